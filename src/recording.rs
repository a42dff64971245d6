use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EphysError;
use crate::units::{scale_to_canonical, Dimension};

/// One analog channel of a sweep as stored in the exchange container, with
/// the units declared by the acquisition system.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Channel {
    pub units: String,
    pub data: Vec<f64>,
}

/// One repetition of the stimulus protocol. Signal 0 is the membrane
/// voltage, signal 1 (when present) the command current; gap-free
/// recordings carry only the voltage channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sweep {
    /// Start of the sweep in seconds from the start of the epoch.
    pub t_start: f64,
    /// Samples per second.
    pub sampling_rate: f64,
    pub signals: Vec<Channel>,
}

impl Sweep {
    pub fn sampling_period(&self) -> f64 {
        1.0 / self.sampling_rate
    }

    /// Sweep length in seconds, from the voltage channel.
    pub fn duration(&self) -> f64 {
        self.signals
            .first()
            .map(|c| c.data.len() as f64 / self.sampling_rate)
            .unwrap_or(0.0)
    }

    /// Membrane voltage normalized to mV. Fatal when signal 0 is missing or
    /// its units are not a voltage.
    pub fn voltage_mv(&self) -> Result<Vec<f64>, EphysError> {
        let channel = self
            .signals
            .first()
            .ok_or_else(|| EphysError::NotVoltage("none".into()))?;
        let scale = scale_to_canonical(Dimension::Voltage, &channel.units)?;
        Ok(channel.data.iter().map(|v| v * scale).collect())
    }

    /// Command current normalized to pA. `NoCommandChannel` when signal 1 is
    /// absent (a gap-free recording), `NotCurrent` when its units are wrong.
    pub fn command_pa(&self) -> Result<Vec<f64>, EphysError> {
        let channel = self.signals.get(1).ok_or(EphysError::NoCommandChannel)?;
        let scale = scale_to_canonical(Dimension::Current, &channel.units)?;
        Ok(channel.data.iter().map(|v| v * scale).collect())
    }

    pub fn validate(&self) -> Result<(), EphysError> {
        if self.sampling_rate <= 0.0 {
            return Err(EphysError::BadRecording {
                path: Default::default(),
                reason: "sampling rate must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

/// A single recording epoch exported from the acquisition system. The
/// native ABF file is read by external tooling; this container is the
/// analysis-side boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Recording {
    pub timestamp: DateTime<Utc>,
    pub sweeps: Vec<Sweep>,
}

impl Recording {
    pub fn open(path: &Path) -> Result<Self, EphysError> {
        let file = File::open(path)?;
        let recording: Recording =
            serde_json::from_reader(BufReader::new(file)).map_err(|err| {
                EphysError::BadRecording {
                    path: path.to_path_buf(),
                    reason: err.to_string(),
                }
            })?;
        for sweep in &recording.sweeps {
            sweep.validate().map_err(|_| EphysError::BadRecording {
                path: path.to_path_buf(),
                reason: "sampling rate must be greater than zero".into(),
            })?;
        }
        Ok(recording)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sweep(units0: &str, units1: Option<&str>) -> Sweep {
        let mut signals = vec![Channel {
            units: units0.into(),
            data: vec![-0.07, -0.071],
        }];
        if let Some(units) = units1 {
            signals.push(Channel {
                units: units.into(),
                data: vec![0.0, 0.05],
            });
        }
        Sweep {
            t_start: 0.0,
            sampling_rate: 10_000.0,
            signals,
        }
    }

    #[test]
    fn voltage_is_rescaled_to_millivolts() {
        let v = sweep("V", None).voltage_mv().unwrap();
        assert!((v[0] + 70.0).abs() < 1e-9);
    }

    #[test]
    fn wrong_units_are_fatal() {
        assert!(matches!(
            sweep("pA", None).voltage_mv(),
            Err(EphysError::NotVoltage(_))
        ));
        assert!(matches!(
            sweep("mV", Some("mV")).command_pa(),
            Err(EphysError::NotCurrent(_))
        ));
    }

    #[test]
    fn missing_command_channel_is_gapfree() {
        assert!(matches!(
            sweep("mV", None).command_pa(),
            Err(EphysError::NoCommandChannel)
        ));
        let i = sweep("mV", Some("nA")).command_pa().unwrap();
        assert!((i[1] - 50.0).abs() < 1e-9);
    }
}
