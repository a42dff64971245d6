//! Firing and I-V statistics aggregated across pprox epochs: per-sweep
//! firing rates and burst durations, MAD-based sweep exclusion, rheobase
//! and f-I slope, and epoch-level aggregates with deltas relative to the
//! cell's first epoch.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::EphysError;
use crate::pprox::{Document, FirstSpikeStats, Stimulus};

/// Index of the depolarizing step in the per-sweep step vectors; the
/// deviance check skips it because evoked firing legitimately moves the
/// steady-state voltage there.
const DEPOL_STEP: usize = 1;

/// One sweep flattened out of a pprox document, joined with its epoch
/// metadata.
#[derive(Clone, Debug)]
pub struct SweepRow {
    pub cell: String,
    pub epoch: u32,
    pub sweep: usize,
    pub events: Vec<f64>,
    pub steps_i: Vec<Option<f64>>,
    pub steps_v: Vec<Option<f64>>,
    pub stimulus: Option<Stimulus>,
    pub spont_interval: [f64; 2],
    pub rs: Option<f64>,
    pub rm: Option<f64>,
    pub vm: Option<f64>,
    pub first_spike: Option<FirstSpikeStats>,
    pub tau: Option<f64>,
    pub cm: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

/// Flatten one epoch file into sweep rows.
pub fn load_epoch(path: &Path) -> Result<Vec<SweepRow>, EphysError> {
    log::debug!(" - reading {}", path.display());
    let doc = Document::read(path)?;
    Ok(doc
        .pprox
        .iter()
        .map(|trial| SweepRow {
            cell: doc.cell.clone(),
            epoch: doc.epoch,
            sweep: trial.index,
            events: trial.events.clone(),
            steps_i: trial
                .steps
                .as_ref()
                .map(|s| s.current.clone())
                .unwrap_or_default(),
            steps_v: trial
                .steps
                .as_ref()
                .map(|s| s.voltage.clone())
                .unwrap_or_default(),
            stimulus: trial.stimulus,
            spont_interval: trial.spont_interval,
            rs: trial.rs,
            rm: trial.rm,
            vm: trial.vm,
            first_spike: trial.first_spike,
            tau: doc.stats.tau,
            cm: doc.stats.cm,
            timestamp: doc.timestamp,
            source: doc.source.clone(),
        })
        .collect())
}

/// One (cell, epoch, sweep, step) row of the I-V table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IvRow {
    pub cell: String,
    pub epoch: u32,
    pub sweep: usize,
    pub step: usize,
    pub current: Option<f64>,
    pub voltage: Option<f64>,
}

pub fn iv_stats<'a>(rows: impl IntoIterator<Item = &'a SweepRow>) -> Vec<IvRow> {
    let mut out = Vec::new();
    for row in rows {
        for (step, (current, voltage)) in row.steps_i.iter().zip(&row.steps_v).enumerate() {
            out.push(IvRow {
                cell: row.cell.clone(),
                epoch: row.epoch,
                sweep: row.sweep,
                step,
                current: *current,
                voltage: *voltage,
            });
        }
    }
    out
}

/// Sweeps whose steady-state voltage deviates from the epoch median by
/// more than `max_dev` median absolute deviations in any baseline or
/// hyperpolarization step column.
pub fn bad_sweeps(rows: &[SweepRow], max_dev: f64) -> HashSet<(String, u32, usize)> {
    let mut groups: BTreeMap<(String, u32), Vec<&SweepRow>> = BTreeMap::new();
    for row in rows {
        groups
            .entry((row.cell.clone(), row.epoch))
            .or_default()
            .push(row);
    }
    let mut flagged = HashSet::new();
    for group in groups.values() {
        let n_steps = group.iter().map(|r| r.steps_v.len()).max().unwrap_or(0);
        for step in (0..n_steps).filter(|&s| s != DEPOL_STEP) {
            let values: Vec<(&SweepRow, f64)> = group
                .iter()
                .filter_map(|r| r.steps_v.get(step).copied().flatten().map(|v| (*r, v)))
                .collect();
            let mut sorted: Vec<f64> = values.iter().map(|(_, v)| *v).collect();
            let Some(med) = median(&mut sorted) else {
                continue;
            };
            let mut abs_dev: Vec<f64> = values.iter().map(|(_, v)| (v - med).abs()).collect();
            let Some(mad) = median(&mut abs_dev) else {
                continue;
            };
            for (row, value) in &values {
                let dev = (value - med).abs();
                let ratio = if mad > 0.0 {
                    dev / mad
                } else if dev > 0.0 {
                    f64::INFINITY
                } else {
                    0.0
                };
                if ratio > max_dev {
                    flagged.insert((row.cell.clone(), row.epoch, row.sweep));
                }
            }
        }
    }
    flagged
}

/// Per-sweep firing statistics.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SweepStats {
    pub cell: String,
    pub epoch: u32,
    pub sweep: usize,
    /// Injected current (pA).
    pub current: Option<f64>,
    /// Evoked rate over the stimulus window (Hz).
    pub firing_rate: Option<f64>,
    /// Evoked burst duration (s).
    pub firing_duration: Option<f64>,
    #[serde(rename = "Rs")]
    pub rs: Option<f64>,
    #[serde(rename = "Rm")]
    pub rm: Option<f64>,
    #[serde(rename = "Vm")]
    pub vm: Option<f64>,
    pub spike_width: Option<f64>,
    pub spike_trough: Option<f64>,
    pub n_evoked: usize,
    pub n_spont: usize,
    /// Local Δrate/ΔI (Hz/pA); undefined below rheobase.
    pub firing_rate_slope: Option<f64>,
}

/// Firing statistics for one sweep. With no stimulus window the rate and
/// duration are undefined; with no evoked spikes the duration is
/// undefined; a single evoked spike takes its duration from the spike
/// shape statistics.
pub fn sweep_firing_stats(row: &SweepRow) -> SweepStats {
    let (current, firing_rate, firing_duration, n_evoked) = match &row.stimulus {
        Some(stim) => {
            let [start, end] = stim.interval;
            let spikes: Vec<f64> = row
                .events
                .iter()
                .copied()
                .filter(|e| *e >= start && *e < end)
                .collect();
            let rate = spikes.len() as f64 / (end - start);
            let duration = match spikes.as_slice() {
                [] => None,
                [_] => row
                    .first_spike
                    .map(|fs| (fs.width + fs.trough_t) / 1e3),
                [first, .., last] => Some(last - first),
            };
            (Some(stim.current), Some(rate), duration, spikes.len())
        }
        None => (None, None, None, 0),
    };
    let [spont_start, spont_end] = row.spont_interval;
    let n_spont = row
        .events
        .iter()
        .filter(|e| **e >= spont_start && **e < spont_end)
        .count();
    SweepStats {
        cell: row.cell.clone(),
        epoch: row.epoch,
        sweep: row.sweep,
        current,
        firing_rate,
        firing_duration,
        rs: row.rs,
        rm: row.rm,
        vm: row.vm,
        spike_width: row.first_spike.map(|fs| fs.width),
        spike_trough: row.first_spike.map(|fs| fs.trough_t),
        n_evoked,
        n_spont,
        firing_rate_slope: None,
    }
}

/// Fill in Δf/ΔI for all sweeps of one epoch (sorted by sweep index).
/// The slope is undefined below the rheobase, and undefined everywhere
/// when no sweep fires.
pub fn epoch_firing_slope(sweeps: &mut [SweepStats]) {
    let Some(first) = sweeps
        .iter()
        .position(|s| s.firing_rate.is_some_and(|r| r > 0.0))
    else {
        return;
    };
    for k in first.max(1)..sweeps.len() {
        let slope = match (
            sweeps[k].firing_rate,
            sweeps[k - 1].firing_rate,
            sweeps[k].current,
            sweeps[k - 1].current,
        ) {
            (Some(r1), Some(r0), Some(i1), Some(i0)) if (i1 - i0).abs() > 1e-9 => {
                Some((r1 - r0) / (i1 - i0))
            }
            _ => None,
        };
        sweeps[k].firing_rate_slope = slope;
    }
}

/// Per-epoch aggregates.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EpochStats {
    pub cell: String,
    pub epoch: u32,
    pub n_sweeps: usize,
    pub duration_max: Option<f64>,
    pub duration_mean: Option<f64>,
    pub duration_sd: Option<f64>,
    pub rate_max: Option<f64>,
    /// Current straddling the first nonzero firing rate (pA).
    pub rheobase: Option<f64>,
    /// Mean f-I slope above rheobase (Hz/pA).
    pub slope: Option<f64>,
    #[serde(rename = "Rs")]
    pub rs: Option<f64>,
    #[serde(rename = "Rs_sd")]
    pub rs_sd: Option<f64>,
    #[serde(rename = "Rm")]
    pub rm: Option<f64>,
    #[serde(rename = "Rm_sd")]
    pub rm_sd: Option<f64>,
    #[serde(rename = "Vm")]
    pub vm: Option<f64>,
    #[serde(rename = "Vm_sd")]
    pub vm_sd: Option<f64>,
    pub spike_width: Option<f64>,
    pub spike_trough: Option<f64>,
    pub n_evoked: usize,
    pub n_spont: usize,
    pub tau: Option<f64>,
    #[serde(rename = "Cm")]
    pub cm: Option<f64>,
    /// Seconds since the cell's first epoch.
    pub time: Option<f64>,
    #[serde(rename = "delta_Rs")]
    pub delta_rs: Option<f64>,
    #[serde(rename = "delta_Rm")]
    pub delta_rm: Option<f64>,
    #[serde(rename = "delta_Vm")]
    pub delta_vm: Option<f64>,
    /// Spikes accumulated in epochs before this one.
    pub cum_spikes: usize,
}

/// Aggregate one epoch's sweep statistics (sorted by sweep index, slope
/// column already filled).
pub fn epoch_firing_stats(
    sweeps: &[SweepStats],
    tau: Option<f64>,
    cm: Option<f64>,
) -> EpochStats {
    let first_firing = sweeps
        .iter()
        .position(|s| s.firing_rate.is_some_and(|r| r > 0.0));
    let (rheobase, slope) = match first_firing {
        // no evoked firing anywhere: rheobase undefined, slope zero
        None => (None, Some(0.0)),
        // firing at the lowest current: rheobase is below the sampled range
        Some(0) => (None, opt_mean(sweeps.iter().map(|s| s.firing_rate_slope))),
        Some(idx) => {
            let straddle = match (sweeps[idx - 1].current, sweeps[idx].current) {
                (Some(a), Some(b)) => Some((a + b) / 2.0),
                _ => None,
            };
            (
                straddle,
                opt_mean(sweeps.iter().map(|s| s.firing_rate_slope)),
            )
        }
    };
    EpochStats {
        cell: sweeps[0].cell.clone(),
        epoch: sweeps[0].epoch,
        n_sweeps: sweeps.len(),
        duration_max: opt_max(sweeps.iter().map(|s| s.firing_duration)),
        duration_mean: opt_mean(sweeps.iter().map(|s| s.firing_duration)),
        duration_sd: opt_sd(sweeps.iter().map(|s| s.firing_duration)),
        rate_max: opt_max(sweeps.iter().map(|s| s.firing_rate)),
        rheobase,
        slope,
        rs: opt_mean(sweeps.iter().map(|s| s.rs)),
        rs_sd: opt_sd(sweeps.iter().map(|s| s.rs)),
        rm: opt_mean(sweeps.iter().map(|s| s.rm)),
        rm_sd: opt_sd(sweeps.iter().map(|s| s.rm)),
        vm: opt_mean(sweeps.iter().map(|s| s.vm)),
        vm_sd: opt_sd(sweeps.iter().map(|s| s.vm)),
        spike_width: opt_mean(sweeps.iter().map(|s| s.spike_width)),
        spike_trough: opt_mean(sweeps.iter().map(|s| s.spike_trough)),
        n_evoked: sweeps.iter().map(|s| s.n_evoked).sum(),
        n_spont: sweeps.iter().map(|s| s.n_spont).sum(),
        tau,
        cm,
        time: None,
        delta_rs: None,
        delta_rm: None,
        delta_vm: None,
        cum_spikes: 0,
    }
}

/// One row per cell.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CellInfo {
    pub cell: String,
    pub source: String,
}

/// The four output tables.
#[derive(Clone, Debug, Default)]
pub struct StatsTables {
    pub iv: Vec<IvRow>,
    pub sweeps: Vec<SweepStats>,
    pub epochs: Vec<EpochStats>,
    pub cells: Vec<CellInfo>,
}

/// The full aggregation: deviance exclusion, per-sweep firing statistics
/// (parallel across the independent rows), f-I slopes, and per-epoch
/// aggregates with deltas relative to each cell's first epoch.
pub fn response_stats(rows: &[SweepRow], max_vm_deviance: f64) -> StatsTables {
    log::info!("- checking for bad sweeps (Vm deviance)");
    let flagged = bad_sweeps(rows, max_vm_deviance);
    log::info!("  - excluded {} sweeps", flagged.len());
    let rows: Vec<&SweepRow> = rows
        .iter()
        .filter(|r| !flagged.contains(&(r.cell.clone(), r.epoch, r.sweep)))
        .collect();

    log::info!("- computing I-V functions");
    let iv = iv_stats(rows.iter().copied());

    log::info!("- computing sweep-level statistics");
    let mut sweeps: Vec<SweepStats> = rows.par_iter().map(|r| sweep_firing_stats(r)).collect();
    sweeps.sort_by(|a, b| {
        (&a.cell, a.epoch, a.sweep).cmp(&(&b.cell, b.epoch, b.sweep))
    });
    for group in group_ranges(&sweeps) {
        epoch_firing_slope(&mut sweeps[group]);
    }

    log::info!("- computing epoch-level statistics");
    let mut meta: BTreeMap<(String, u32), (Option<f64>, Option<f64>, DateTime<Utc>, String)> =
        BTreeMap::new();
    for row in &rows {
        meta.entry((row.cell.clone(), row.epoch)).or_insert((
            row.tau,
            row.cm,
            row.timestamp,
            row.source.clone(),
        ));
    }
    let mut epochs: Vec<EpochStats> = group_ranges(&sweeps)
        .into_iter()
        .map(|range| {
            let group = &sweeps[range];
            let key = (group[0].cell.clone(), group[0].epoch);
            let (tau, cm) = meta
                .get(&key)
                .map(|(tau, cm, _, _)| (*tau, *cm))
                .unwrap_or((None, None));
            epoch_firing_stats(group, tau, cm)
        })
        .collect();
    let timestamps: BTreeMap<(String, u32), DateTime<Utc>> = meta
        .iter()
        .map(|(key, (_, _, ts, _))| (key.clone(), *ts))
        .collect();
    epoch_deltas(&mut epochs, &timestamps);

    let mut cells: Vec<CellInfo> = Vec::new();
    for ((cell, _), (_, _, _, source)) in &meta {
        if cells.last().map(|c| &c.cell) != Some(cell) {
            cells.push(CellInfo {
                cell: cell.clone(),
                source: source.clone(),
            });
        }
    }

    StatsTables {
        iv,
        sweeps,
        epochs,
        cells,
    }
}

/// Elapsed time, relative Rs/Rm and absolute Vm change from each cell's
/// first epoch, and the cumulative spike count before each epoch.
pub fn epoch_deltas(
    epochs: &mut [EpochStats],
    timestamps: &BTreeMap<(String, u32), DateTime<Utc>>,
) {
    epochs.sort_by(|a, b| (&a.cell, a.epoch).cmp(&(&b.cell, b.epoch)));
    let mut start = 0;
    while start < epochs.len() {
        let cell = epochs[start].cell.clone();
        let mut end = start;
        while end < epochs.len() && epochs[end].cell == cell {
            end += 1;
        }
        let t0 = timestamps.get(&(cell.clone(), epochs[start].epoch)).copied();
        let rs0 = epochs[start].rs;
        let rm0 = epochs[start].rm;
        let vm0 = epochs[start].vm;
        let mut accumulated = 0;
        for epoch in &mut epochs[start..end] {
            epoch.time = match (t0, timestamps.get(&(cell.clone(), epoch.epoch))) {
                (Some(t0), Some(t)) => Some((*t - t0).num_milliseconds() as f64 / 1e3),
                _ => None,
            };
            epoch.delta_rs = relative_change(epoch.rs, rs0);
            epoch.delta_rm = relative_change(epoch.rm, rm0);
            epoch.delta_vm = match (epoch.vm, vm0) {
                (Some(v), Some(v0)) => Some(v - v0),
                _ => None,
            };
            epoch.cum_spikes = accumulated;
            accumulated += epoch.n_spont + epoch.n_evoked;
        }
        start = end;
    }
}

fn relative_change(value: Option<f64>, reference: Option<f64>) -> Option<f64> {
    match (value, reference) {
        (Some(v), Some(r)) if r.abs() > 1e-12 => Some((v - r) / r.abs()),
        _ => None,
    }
}

/// Contiguous (cell, epoch) ranges in a sorted sweep-stats vector.
fn group_ranges(sweeps: &[SweepStats]) -> Vec<std::ops::Range<usize>> {
    let mut ranges = Vec::new();
    let mut start = 0;
    for k in 1..=sweeps.len() {
        let boundary = k == sweeps.len()
            || sweeps[k].cell != sweeps[start].cell
            || sweeps[k].epoch != sweeps[start].epoch;
        if boundary {
            ranges.push(start..k);
            start = k;
        }
    }
    ranges
}

fn median(values: &mut Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

fn opt_mean(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    let defined: Vec<f64> = values.flatten().collect();
    (!defined.is_empty()).then(|| defined.iter().sum::<f64>() / defined.len() as f64)
}

fn opt_sd(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    let defined: Vec<f64> = values.flatten().collect();
    if defined.len() < 2 {
        return None;
    }
    let mean = defined.iter().sum::<f64>() / defined.len() as f64;
    let var = defined.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>()
        / (defined.len() - 1) as f64;
    Some(var.sqrt())
}

fn opt_max(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    values.flatten().reduce(f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(epoch: u32, sweep: usize, current: f64, events: &[f64], vm: f64) -> SweepRow {
        SweepRow {
            cell: "cell01".into(),
            epoch,
            sweep,
            events: events.to_vec(),
            steps_i: vec![Some(0.0), Some(current), Some(-50.0), Some(-100.0), Some(-50.0)],
            steps_v: vec![Some(vm), Some(vm + 10.0), Some(vm - 10.0), Some(vm - 20.0), Some(vm - 10.0)],
            stimulus: Some(Stimulus {
                interval: [0.5, 1.5],
                current,
            }),
            spont_interval: [0.0, 0.5],
            rs: Some(10.0),
            rm: Some(200.0),
            vm: Some(vm),
            first_spike: Some(FirstSpikeStats {
                width: 1.0,
                trough_t: 3.0,
                trough_v: -75.0,
            }),
            tau: Some(20.0),
            cm: Some(100.0),
            timestamp: Utc
                .with_ymd_and_hms(2022, 10, 10, 12, 0, epoch)
                .unwrap(),
            source: "neurobank://cell01-x".into(),
        }
    }

    #[test]
    fn firing_rate_and_duration_rules() {
        // no evoked spikes: rate 0, duration undefined
        let stats = sweep_firing_stats(&row(1, 0, 10.0, &[0.2], -70.0));
        assert_eq!(stats.firing_rate, Some(0.0));
        assert_eq!(stats.firing_duration, None);
        assert_eq!(stats.n_spont, 1);
        // one evoked spike: duration from the shape statistics
        let stats = sweep_firing_stats(&row(1, 1, 20.0, &[0.6], -70.0));
        assert_eq!(stats.n_evoked, 1);
        assert!((stats.firing_duration.unwrap() - 0.004).abs() < 1e-12);
        // several evoked spikes: first-to-last span
        let stats = sweep_firing_stats(&row(1, 2, 30.0, &[0.6, 0.8, 1.1], -70.0));
        assert!((stats.firing_rate.unwrap() - 3.0).abs() < 1e-12);
        assert!((stats.firing_duration.unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn rheobase_straddles_the_first_firing_sweep() {
        let rows: Vec<SweepRow> = vec![
            row(1, 0, 0.0, &[], -70.0),
            row(1, 1, 20.0, &[], -70.0),
            row(1, 2, 40.0, &[0.6, 0.7], -70.0),
            row(1, 3, 60.0, &[0.6, 0.7, 0.8, 0.9], -70.0),
        ];
        let mut sweeps: Vec<SweepStats> = rows.iter().map(sweep_firing_stats).collect();
        epoch_firing_slope(&mut sweeps);
        assert_eq!(sweeps[1].firing_rate_slope, None);
        assert!(sweeps[2].firing_rate_slope.unwrap() > 0.0);
        let epoch = epoch_firing_stats(&sweeps, Some(20.0), Some(100.0));
        // between 20 and 40 pA
        assert!((epoch.rheobase.unwrap() - 30.0).abs() < 1e-9);
        assert!(epoch.slope.unwrap() > 0.0);
        assert_eq!(epoch.n_evoked, 6);
    }

    #[test]
    fn rheobase_is_undefined_without_firing_or_at_zero_current() {
        let quiet: Vec<SweepStats> = vec![
            row(1, 0, 0.0, &[], -70.0),
            row(1, 1, 20.0, &[], -70.0),
        ]
        .iter()
        .map(sweep_firing_stats)
        .collect();
        let epoch = epoch_firing_stats(&quiet, None, None);
        assert_eq!(epoch.rheobase, None);
        assert_eq!(epoch.slope, Some(0.0));

        let spontaneous: Vec<SweepStats> = vec![
            row(1, 0, 0.0, &[0.6], -70.0),
            row(1, 1, 20.0, &[0.6, 0.7], -70.0),
        ]
        .iter()
        .map(sweep_firing_stats)
        .collect();
        let epoch = epoch_firing_stats(&spontaneous, None, None);
        assert_eq!(epoch.rheobase, None);
    }

    #[test]
    fn deviant_sweeps_are_flagged() {
        let mut rows: Vec<SweepRow> = (0..8).map(|k| row(1, k, 10.0, &[], -70.0 + 0.1 * k as f64)).collect();
        rows.push(row(1, 8, 10.0, &[], -40.0));
        let flagged = bad_sweeps(&rows, 10.0);
        assert_eq!(flagged.len(), 1);
        assert!(flagged.contains(&("cell01".to_string(), 1, 8)));
    }

    #[test]
    fn deltas_are_relative_to_the_first_epoch() {
        let rows: Vec<SweepRow> = vec![
            row(1, 0, 20.0, &[0.6, 0.7], -70.0),
            row(2, 0, 20.0, &[0.6], -65.0),
        ];
        let tables = response_stats(&rows, 10.0);
        assert_eq!(tables.epochs.len(), 2);
        assert_eq!(tables.epochs[0].time, Some(0.0));
        assert_eq!(tables.epochs[1].time, Some(1.0));
        assert_eq!(tables.epochs[0].delta_vm, Some(0.0));
        assert_eq!(tables.epochs[1].delta_vm, Some(5.0));
        assert_eq!(tables.epochs[0].cum_spikes, 0);
        assert_eq!(tables.epochs[1].cum_spikes, 2);
        assert_eq!(tables.cells.len(), 1);
        assert_eq!(tables.iv.len(), 10);
    }
}
