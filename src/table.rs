//! CSV views over the statistics tables. The tables are flattened,
//! multi-level-indexed (cell, epoch, sweep, step) views regenerated in
//! full on every run; undefined values are empty fields.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::EphysError;
use crate::stats::StatsTables;

pub const IV_STATS: &str = "iv_stats.csv";
pub const SWEEP_STATS: &str = "sweep_stats.csv";
pub const EPOCH_STATS: &str = "epoch_stats.csv";
pub const CELL_INFO: &str = "cell_info.csv";

/// Write one table and log where it went.
pub fn write_results<T: Serialize>(
    rows: &[T],
    path: &Path,
    name: &str,
) -> Result<(), EphysError> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    log::info!("  - wrote {} to '{}'", name, path.display());
    Ok(())
}

/// Read a table written by `write_results`.
pub fn read_table<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, EphysError> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        rows.push(record?);
    }
    Ok(rows)
}

/// Write all four summary tables into the output directory.
pub fn write_all(tables: &StatsTables, output_dir: &Path) -> Result<(), EphysError> {
    write_results(&tables.iv, &output_dir.join(IV_STATS), "I-V steps")?;
    write_results(
        &tables.sweeps,
        &output_dir.join(SWEEP_STATS),
        "sweep statistics",
    )?;
    write_results(
        &tables.epochs,
        &output_dir.join(EPOCH_STATS),
        "epoch statistics",
    )?;
    write_results(&tables.cells, &output_dir.join(CELL_INFO), "cell info")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::IvRow;

    #[test]
    fn undefined_values_round_trip_as_empty_fields() {
        let rows = vec![
            IvRow {
                cell: "cell01".into(),
                epoch: 1,
                sweep: 0,
                step: 0,
                current: Some(0.0),
                voltage: Some(-70.0),
            },
            IvRow {
                cell: "cell01".into(),
                epoch: 1,
                sweep: 0,
                step: 1,
                current: None,
                voltage: None,
            },
        ];
        let dir = std::env::temp_dir().join(format!("patchstats-table-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(IV_STATS);
        write_results(&rows, &path, "I-V steps").unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("cell,epoch,sweep,step,current,voltage"));
        assert!(text.contains("cell01,1,0,1,,"));
        let back: Vec<IvRow> = read_table(&path).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[1].current, None);
        assert_eq!(back[0].voltage, Some(-70.0));
        std::fs::remove_dir_all(&dir).ok();
    }
}
