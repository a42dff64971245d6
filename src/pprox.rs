//! The pprox point-process document: one JSON file per recording epoch,
//! holding per-sweep spike times and the derived electrical properties.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EphysError;
use crate::units::Quantity;

pub const SCHEMA: &str = "https://meliza.org/spec:2/pprox.json#";

/// Epoch-level passive properties from the exponential fit. All fields are
/// null when the fit fails to converge.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct PassiveSummary {
    /// Membrane time constant (ms).
    pub tau: Option<f64>,
    /// Capacitance (pF).
    #[serde(rename = "Cm")]
    pub cm: Option<f64>,
    /// RMS residual of the fit (mV).
    pub fit_err: Option<f64>,
}

/// Shape statistics of the first spike in a sweep.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FirstSpikeStats {
    /// Width at half height (ms).
    pub width: f64,
    /// Time from peak to trough (ms).
    pub trough_t: f64,
    /// Trough voltage (mV).
    pub trough_v: f64,
}

/// Per-step representative levels. Entries are null when the averaging
/// window contained a spike.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Steps {
    #[serde(rename = "I")]
    pub current: Vec<Option<f64>>,
    #[serde(rename = "V")]
    pub voltage: Vec<Option<f64>>,
}

/// The depolarizing stimulus step.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Stimulus {
    /// Stimulus window in seconds from sweep start.
    pub interval: [f64; 2],
    /// Injected current (pA).
    #[serde(rename = "I")]
    pub current: f64,
}

/// One sweep of the epoch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Trial {
    pub index: usize,
    /// Sweep start in seconds from the start of the epoch.
    pub offset: f64,
    /// Recording interval in seconds from sweep start.
    pub interval: [f64; 2],
    /// Spike times in seconds from sweep start.
    pub events: Vec<f64>,
    /// Per-spike shape statistics, one array per mark.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marks: Option<BTreeMap<String, Quantity>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spike_base: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spike_thresh: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_spike: Option<FirstSpikeStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Steps>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stimulus: Option<Stimulus>,
    /// Pre-stimulus window scanned for spontaneous spikes.
    pub spont_interval: [f64; 2],
    /// Series resistance (MΩ).
    #[serde(rename = "Rs")]
    pub rs: Option<f64>,
    /// Membrane resistance (MΩ).
    #[serde(rename = "Rm")]
    pub rm: Option<f64>,
    /// Resting potential from the baseline step (mV).
    #[serde(rename = "Vm")]
    pub vm: Option<f64>,
}

/// A pprox document for one epoch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "$schema")]
    pub schema: String,
    /// Registry URL of the source recording.
    pub source: String,
    /// Short cell name.
    pub cell: String,
    pub epoch: u32,
    /// Stem of the source recording file.
    pub abf_file: String,
    pub timestamp: DateTime<Utc>,
    /// Units of the recorded fields.
    pub units: BTreeMap<String, String>,
    pub stats: PassiveSummary,
    pub pprox: Vec<Trial>,
}

impl Document {
    pub fn new(
        source: String,
        cell: String,
        epoch: u32,
        abf_file: String,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            schema: SCHEMA.to_string(),
            source,
            cell,
            epoch,
            abf_file,
            timestamp,
            units: default_units(),
            stats: PassiveSummary::default(),
            pprox: Vec::new(),
        }
    }

    pub fn read(path: &Path) -> Result<Self, EphysError> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    pub fn write(&self, path: &Path) -> Result<(), EphysError> {
        let file = File::create(path)?;
        serde_json::to_writer(BufWriter::new(file), self)?;
        Ok(())
    }

    /// Output file name for this epoch.
    pub fn file_name(&self) -> String {
        format!("{}_{:02}.pprox", self.cell, self.epoch)
    }
}

fn default_units() -> BTreeMap<String, String> {
    BTreeMap::from(
        [
            ("events", "s"),
            ("interval", "s"),
            ("offset", "s"),
            ("steps.I", "pA"),
            ("steps.V", "mV"),
            ("stimulus.I", "pA"),
            ("Rs", "MΩ"),
            ("Rm", "MΩ"),
            ("Vm", "mV"),
            ("stats.tau", "ms"),
            ("stats.Cm", "pF"),
            ("marks.peak", "mV"),
            ("marks.width", "ms"),
            ("marks.trough_t", "ms"),
            ("marks.trough_v", "mV"),
        ]
        .map(|(k, v)| (k.to_string(), v.to_string())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn document() -> Document {
        let mut doc = Document::new(
            "neurobank://a1b2c3d4-20220101-1".into(),
            "a1b2c3d4".into(),
            3,
            "22101000".into(),
            Utc.with_ymd_and_hms(2022, 10, 10, 12, 30, 0).unwrap(),
        );
        doc.stats = PassiveSummary {
            tau: Some(18.5),
            cm: Some(92.4),
            fit_err: Some(0.03),
        };
        doc.pprox.push(Trial {
            index: 0,
            offset: 0.0,
            interval: [0.0, 2.0],
            events: vec![0.512, 0.538, 0.6211],
            marks: Some(BTreeMap::from([(
                "width".to_string(),
                Quantity::Array(vec![0.8, 0.9, 1.1]),
            )])),
            spike_base: Some(-68.2),
            spike_thresh: Some(-51.0),
            first_spike: Some(FirstSpikeStats {
                width: 0.8,
                trough_t: 2.5,
                trough_v: -72.0,
            }),
            steps: Some(Steps {
                current: vec![Some(0.0), None, Some(-50.0)],
                voltage: vec![Some(-70.0), None, Some(-80.0)],
            }),
            stimulus: Some(Stimulus {
                interval: [0.5, 1.0],
                current: 50.0,
            }),
            spont_interval: [0.0, 0.5],
            rs: Some(12.0),
            rm: Some(200.0),
            vm: Some(-70.0),
        });
        doc.pprox.push(Trial {
            index: 1,
            offset: 2.5,
            interval: [0.0, 2.0],
            events: vec![],
            marks: None,
            spike_base: None,
            spike_thresh: None,
            first_spike: None,
            steps: None,
            stimulus: None,
            spont_interval: [0.0, 0.5],
            rs: None,
            rm: None,
            vm: None,
        });
        doc
    }

    #[test]
    fn round_trip_preserves_events_and_indices() {
        let doc = document();
        let text = serde_json::to_string(&doc).unwrap();
        let back: Document = serde_json::from_str(&text).unwrap();
        assert_eq!(back.epoch, doc.epoch);
        assert_eq!(back.pprox.len(), doc.pprox.len());
        assert_eq!(back.pprox[0].events, doc.pprox[0].events);
        assert_eq!(back.pprox[0].steps.as_ref().unwrap().current[1], None);
        assert_eq!(back.stats.tau, doc.stats.tau);
        assert_eq!(back.pprox[1].rs, None);
    }

    #[test]
    fn quiescent_trials_omit_spike_fields() {
        let doc = document();
        let value = serde_json::to_value(&doc).unwrap();
        let quiet = &value["pprox"][1];
        assert!(quiet.get("spike_thresh").is_none());
        assert!(quiet.get("marks").is_none());
        assert_eq!(quiet["Rs"], serde_json::Value::Null);
        assert_eq!(value["$schema"], SCHEMA);
        assert_eq!(value["units"]["steps.I"], "pA");
    }

    #[test]
    fn file_names_are_zero_padded() {
        assert_eq!(document().file_name(), "a1b2c3d4_03.pprox");
    }
}
