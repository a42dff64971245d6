//! Assembly of a pprox document from one recording epoch: spike detection,
//! step segmentation, and passive-property computation per sweep, then the
//! epoch-level exponential fit over the averaged hyperpolarization
//! transient.

use std::collections::BTreeMap;

use ndarray::{Array1, ArrayView1};

use crate::error::EphysError;
use crate::interval::Interval;
use crate::passive::{
    fit_membrane_time_constant, membrane_resistance, series_resistance, PassiveParams,
};
use crate::pprox::{Document, FirstSpikeStats, PassiveSummary, Steps, Stimulus, Trial};
use crate::recording::Recording;
use crate::spikes::{detect_sweep, Detection, Spike, SpikeParams};
use crate::steps::{step_means, stimulus_amplitude, StepProtocol};
use crate::units::{picofarads, Quantity};

/// Step-mean indices used for the steady-state Rm estimates: baseline to
/// outer hyperpolarization, and outer to inner.
const RM_PAIRS: [(usize, usize); 2] = [(0, 2), (2, 3)];

#[derive(Clone, Copy, Debug, Default)]
pub struct ExtractParams {
    pub spikes: SpikeParams,
    pub passive: PassiveParams,
}

/// Identity of the epoch being extracted, recorded in the document header.
#[derive(Clone, Debug)]
pub struct EpochId {
    pub source: String,
    pub cell: String,
    pub epoch: u32,
    pub abf_file: String,
}

/// Run the full extraction for one epoch. A quiescent sweep is a valid
/// trial; a sweep whose command channel does not contain the expected step
/// protocol is fatal for the epoch.
pub fn extract_epoch(
    recording: &Recording,
    id: &EpochId,
    params: &ExtractParams,
) -> Result<Document, EphysError> {
    let mut doc = Document::new(
        id.source.clone(),
        id.cell.clone(),
        id.epoch,
        id.abf_file.clone(),
        recording.timestamp,
    );
    let mut transients: Vec<Vec<f64>> = Vec::new();
    let mut rs_all: Vec<f64> = Vec::new();
    let mut fit_rate = None;

    for (sweep_idx, sweep) in recording.sweeps.iter().enumerate() {
        log::debug!("- sweep {sweep_idx}:");
        let v = sweep.voltage_mv()?;
        let i = sweep.command_pa()?;
        let rate = sweep.sampling_rate;
        let period = sweep.sampling_period();

        let protocol = StepProtocol::from_current(&i)?;
        let stim_interval = protocol.stimulus_interval(rate);

        let (events, marks, spike_base, spike_thresh, first_spike) =
            match detect_sweep(&v, rate, &params.spikes) {
                Detection::Quiescent => (Vec::new(), None, None, None, None),
                Detection::Detected {
                    thresh,
                    base,
                    spikes,
                } => {
                    let events: Vec<f64> = spikes.iter().map(|s| s.index as f64 * period).collect();
                    let first = spikes.first().map(|s| FirstSpikeStats {
                        width: s.width * period * 1e3,
                        trough_t: s.trough_t * period * 1e3,
                        trough_v: s.trough_v,
                    });
                    let marks = (!spikes.is_empty()).then(|| spike_marks(&spikes, period));
                    (events, marks, Some(base), Some(thresh), first)
                }
            };
        log::debug!("  - {} events", events.len());

        let means = step_means(&protocol, &v, &i, rate, &events)?;
        let stim_current = stimulus_amplitude(&protocol, &i, rate)?;

        let rs_values: Vec<f64> = protocol
            .hyper
            .iter()
            .filter_map(|seg| series_resistance(&v, &i, rate, seg.start, &events, &params.passive))
            .collect();
        let rs = mean_of(&rs_values);
        let rm_values: Vec<f64> = RM_PAIRS
            .iter()
            .filter_map(|&(a, b)| membrane_resistance(&means, a, b))
            .collect();
        let rm = mean_of(&rm_values);
        let vm = means.voltage.first().copied().flatten();
        rs_all.extend(&rs_values);

        // spike-free relaxations into the outer hyperpolarization step are
        // averaged across sweeps for the epoch-level fit
        let h1 = protocol.hyper[0];
        if h1.end() <= v.len() {
            let window = Interval::new(h1.start, h1.end(), period)?;
            if !window.contains(&events) {
                transients.push(v[window.range()].to_vec());
                fit_rate = Some(rate);
            }
        }

        doc.pprox.push(Trial {
            index: sweep_idx,
            offset: sweep.t_start,
            interval: [0.0, sweep.duration()],
            events,
            marks,
            spike_base,
            spike_thresh,
            first_spike,
            steps: Some(Steps {
                current: means.current,
                voltage: means.voltage,
            }),
            stimulus: stim_current.map(|current| Stimulus {
                interval: stim_interval,
                current,
            }),
            spont_interval: [0.0, stim_interval[0]],
            rs,
            rm,
            vm,
        });
    }

    doc.stats = epoch_passive_stats(&transients, fit_rate, mean_of(&rs_all));
    Ok(doc)
}

/// Average the collected hyperpolarization transients and fit the membrane
/// time constant; capacitance follows from tau over the transient-only
/// resistance estimate.
fn epoch_passive_stats(
    transients: &[Vec<f64>],
    rate: Option<f64>,
    rs_transient: Option<f64>,
) -> PassiveSummary {
    let (Some(rate), Some(min_len)) = (rate, transients.iter().map(Vec::len).min()) else {
        return PassiveSummary::default();
    };
    if min_len == 0 {
        return PassiveSummary::default();
    }
    let mut acc = Array1::<f64>::zeros(min_len);
    for transient in transients {
        acc += &ArrayView1::from(&transient[..min_len]);
    }
    acc /= transients.len() as f64;
    let Some(fit) = fit_membrane_time_constant(&acc.to_vec(), rate) else {
        log::debug!("- exponential fit did not converge");
        return PassiveSummary::default();
    };
    PassiveSummary {
        tau: Some(fit.tau_ms),
        cm: rs_transient.map(|rs| picofarads(fit.tau_ms, rs)),
        fit_err: Some(fit.residual),
    }
}

fn spike_marks(spikes: &[Spike], period: f64) -> BTreeMap<String, Quantity> {
    let ms = period * 1e3;
    BTreeMap::from([
        (
            "peak".to_string(),
            Quantity::Array(spikes.iter().map(|s| s.peak).collect()),
        ),
        (
            "width".to_string(),
            Quantity::Array(spikes.iter().map(|s| s.width * ms).collect()),
        ),
        (
            "trough_t".to_string(),
            Quantity::Array(spikes.iter().map(|s| s.trough_t * ms).collect()),
        ),
        (
            "trough_v".to_string(),
            Quantity::Array(spikes.iter().map(|s| s.trough_v).collect()),
        ),
    ])
}

fn mean_of(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

/// Synthetic epoch builder shared by the unit and integration tests.
pub mod synthetic {
    use chrono::{DateTime, Utc};

    use crate::recording::{Channel, Recording, Sweep};

    pub const RATE: f64 = 10_000.0;
    pub const TAU_MS: f64 = 20.0;
    /// Step levels in pA over equal 0.25 s segments, the canonical
    /// protocol: baseline, depolarizing, nested hyperpolarizations, tail.
    pub const LEVELS: [f64; 6] = [0.0, 50.0, -50.0, -100.0, -50.0, 0.0];
    const SAMPLES_PER_STEP: usize = 2500;
    /// Input resistance used to synthesize the voltage response (MΩ).
    const RM: f64 = 200.0;
    const BASELINE_MV: f64 = -70.0;

    /// One sweep with the canonical current protocol and a passive
    /// exponential voltage response; a single 40 mV spike is added at
    /// `spike_at` seconds when given.
    pub fn sweep(t_start: f64, spike_at: Option<f64>) -> Sweep {
        let n = SAMPLES_PER_STEP * LEVELS.len();
        let mut current = Vec::with_capacity(n);
        for level in LEVELS {
            current.extend(std::iter::repeat(level).take(SAMPLES_PER_STEP));
        }
        // piecewise-exponential relaxation toward each step's steady state
        let mut voltage = Vec::with_capacity(n);
        let mut value = BASELINE_MV;
        for &level in &current {
            let target = BASELINE_MV + level * RM * 1e-3;
            value = target + (value - target) * (-1e3 / RATE / TAU_MS).exp();
            voltage.push(value);
        }
        if let Some(at) = spike_at {
            let peak = (at * RATE).round() as usize;
            for k in 0..10 {
                voltage[peak - 10 + k] += 40.0 * k as f64 / 10.0;
            }
            for k in 0..20 {
                voltage[peak + k] += 40.0 * (20 - k) as f64 / 20.0;
            }
        }
        Sweep {
            t_start,
            sampling_rate: RATE,
            signals: vec![
                Channel {
                    units: "mV".into(),
                    data: voltage,
                },
                Channel {
                    units: "pA".into(),
                    data: current,
                },
            ],
        }
    }

    pub fn recording(n_sweeps: usize, spike_at: Option<f64>) -> Recording {
        Recording {
            timestamp: DateTime::<Utc>::from_timestamp(1_665_405_000, 0).unwrap_or_default(),
            sweeps: (0..n_sweeps)
                .map(|k| sweep(k as f64 * 2.0, spike_at))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::synthetic;
    use super::*;

    fn test_id() -> EpochId {
        EpochId {
            source: "neurobank://a1b2c3d4-20220101-1".into(),
            cell: "a1b2c3d4".into(),
            epoch: 1,
            abf_file: "22101000".into(),
        }
    }

    #[test]
    fn synthetic_epoch_yields_one_event_and_positive_passive_properties() {
        let recording = synthetic::recording(3, Some(0.050));
        let doc = extract_epoch(&recording, &test_id(), &ExtractParams::default()).unwrap();
        assert_eq!(doc.pprox.len(), 3);
        for trial in &doc.pprox {
            assert_eq!(trial.events.len(), 1);
            assert!((trial.events[0] - 0.050).abs() < 1e-3);
            assert!(trial.rs.unwrap() > 0.0);
            assert!(trial.rm.unwrap() > 0.0);
            // synthesized with Rm = 200 MOhm
            assert!((trial.rm.unwrap() - 200.0).abs() < 20.0);
            assert!(trial.vm.unwrap() < -60.0);
            let stimulus = trial.stimulus.unwrap();
            assert!((stimulus.current - 50.0).abs() < 1.0);
            assert!((stimulus.interval[0] - 0.25).abs() < 1e-6);
        }
        let tau = doc.stats.tau.expect("fit should converge");
        assert!(
            (tau - synthetic::TAU_MS).abs() / synthetic::TAU_MS < 0.1,
            "tau = {tau}"
        );
        assert!(doc.stats.cm.unwrap() > 0.0);
    }

    #[test]
    fn quiescent_sweeps_have_no_threshold_fields() {
        let recording = synthetic::recording(2, None);
        let doc = extract_epoch(&recording, &test_id(), &ExtractParams::default()).unwrap();
        for trial in &doc.pprox {
            assert!(trial.events.is_empty());
            assert!(trial.spike_thresh.is_none());
            assert!(trial.spike_base.is_none());
            assert!(trial.marks.is_none());
        }
    }

    #[test]
    fn missing_step_aborts_the_epoch() {
        let mut recording = synthetic::recording(1, None);
        // flatten the command channel: no depolarizing step
        for sample in &mut recording.sweeps[0].signals[1].data {
            *sample = 0.0;
        }
        assert!(matches!(
            extract_epoch(&recording, &test_id(), &ExtractParams::default()),
            Err(EphysError::MissingStep(_))
        ));
    }
}
