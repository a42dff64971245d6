//! Segmentation of the command-current channel into the fixed protocol
//! shape: one baseline step, one depolarizing step, and two nested
//! hyperpolarizing steps. Anything else is outside the precondition of
//! these tools and is reported as a fatal error.

use std::fmt;

use crate::error::EphysError;
use crate::interval::Interval;

/// Fraction of a step used for its representative mean (the trailing part,
/// to avoid the capacitive transient at the leading edge).
const STEP_WINDOW_FRAC: f64 = 0.5;
/// Padding excluded at the step edges (ms).
const STEP_EDGE_PAD_MS: f64 = 5.0;

/// One run of constant (integer-truncated) command current.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub value: i64,
    pub start: usize,
    pub length: usize,
}

impl Segment {
    pub fn end(&self) -> usize {
        self.start + self.length
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepKind {
    Baseline,
    Depolarizing,
    Hyperpolarizing,
    SecondHyperpolarizing,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepKind::Baseline => "baseline",
            StepKind::Depolarizing => "depolarizing",
            StepKind::Hyperpolarizing => "hyperpolarizing",
            StepKind::SecondHyperpolarizing => "second hyperpolarizing",
        };
        f.write_str(name)
    }
}

/// Run-length encode a sequence of integers into contiguous
/// (value, start, length) segments.
pub fn runlength_encode(values: impl IntoIterator<Item = i64>) -> Vec<Segment> {
    let mut segments: Vec<Segment> = Vec::new();
    for (index, value) in values.into_iter().enumerate() {
        match segments.last_mut() {
            Some(last) if last.value == value => last.length += 1,
            _ => segments.push(Segment {
                value,
                start: index,
                length: 1,
            }),
        }
    }
    segments
}

/// Reconstruct the integer sequence from its segments.
pub fn runlength_decode(segments: &[Segment]) -> Vec<i64> {
    let mut out = Vec::with_capacity(segments.iter().map(|s| s.length).sum());
    for segment in segments {
        out.extend(std::iter::repeat(segment.value).take(segment.length));
    }
    out
}

/// The located protocol steps for one sweep.
#[derive(Clone, Debug)]
pub struct StepProtocol {
    pub baseline: Segment,
    pub depol: Segment,
    /// Outer and inner hyperpolarizing steps, in order of onset.
    pub hyper: [Segment; 2],
    /// Tail of the outer hyperpolarization after the inner step, when the
    /// command returns to the outer level before baseline.
    pub hyper_tail: Option<Segment>,
}

impl StepProtocol {
    /// Locate the protocol steps in the command current (pA). The current
    /// is truncated to integers and run-length encoded; each step type is
    /// found by its sign. A missing expected step is fatal.
    pub fn from_current(current_pa: &[f64]) -> Result<Self, EphysError> {
        let segments = runlength_encode(current_pa.iter().map(|x| x.trunc() as i64));
        let baseline = *segments
            .iter()
            .find(|s| s.value == 0)
            .ok_or(EphysError::MissingStep(StepKind::Baseline))?;
        let depol = *segments
            .iter()
            .find(|s| s.value > 0)
            .ok_or(EphysError::MissingStep(StepKind::Depolarizing))?;
        let first_hyper = segments
            .iter()
            .position(|s| s.value < 0)
            .ok_or(EphysError::MissingStep(StepKind::Hyperpolarizing))?;
        let second = *segments
            .get(first_hyper + 1)
            .filter(|s| s.value < 0)
            .ok_or(EphysError::MissingStep(StepKind::SecondHyperpolarizing))?;
        let hyper_tail = segments
            .get(first_hyper + 2)
            .filter(|s| s.value < 0)
            .copied();
        Ok(Self {
            baseline,
            depol,
            hyper: [segments[first_hyper], second],
            hyper_tail,
        })
    }

    /// The steps in protocol order: baseline, depolarizing, outer and inner
    /// hyperpolarization, and the outer tail when present.
    pub fn steps(&self) -> Vec<Segment> {
        let mut steps = vec![self.baseline, self.depol, self.hyper[0], self.hyper[1]];
        if let Some(tail) = self.hyper_tail {
            steps.push(tail);
        }
        steps
    }

    /// The stimulus window in seconds.
    pub fn stimulus_interval(&self, sampling_rate: f64) -> [f64; 2] {
        [
            self.depol.start as f64 / sampling_rate,
            self.depol.end() as f64 / sampling_rate,
        ]
    }
}

/// Representative mean current and voltage per step. Entries are `None`
/// when the averaging window contains a detected spike (which would bias
/// the resistance estimates) or is too short to average.
#[derive(Clone, Debug, Default)]
pub struct StepMeans {
    pub current: Vec<Option<f64>>,
    pub voltage: Vec<Option<f64>>,
}

/// The averaging window for one step: its trailing part, shrunk away from
/// the edges.
pub fn step_window(segment: &Segment, sampling_rate: f64) -> Result<Interval, EphysError> {
    let pad = (STEP_EDGE_PAD_MS / 1e3 * sampling_rate).round() as usize;
    let lead = (segment.length as f64 * (1.0 - STEP_WINDOW_FRAC)) as usize;
    let start = segment.start + lead.max(pad);
    let end = segment.end().saturating_sub(pad).max(start);
    Interval::new(start, end, 1.0 / sampling_rate)
}

/// Mean V and I over the trailing sub-window of each protocol step.
pub fn step_means(
    protocol: &StepProtocol,
    voltage_mv: &[f64],
    current_pa: &[f64],
    sampling_rate: f64,
    events_s: &[f64],
) -> Result<StepMeans, EphysError> {
    let mut means = StepMeans::default();
    for segment in protocol.steps() {
        let window = step_window(&segment, sampling_rate)?;
        means
            .current
            .push(window.mean_of(current_pa, Some(events_s)));
        means
            .voltage
            .push(window.mean_of(voltage_mv, Some(events_s)));
    }
    Ok(means)
}

/// Stimulus amplitude: mean command current over the trailing window of the
/// depolarizing step. Spikes ride on the voltage trace, not the command, so
/// no event exclusion applies here.
pub fn stimulus_amplitude(
    protocol: &StepProtocol,
    current_pa: &[f64],
    sampling_rate: f64,
) -> Result<Option<f64>, EphysError> {
    let window = step_window(&protocol.depol, sampling_rate)?;
    Ok(window.mean_of(current_pa, None))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The canonical protocol: 0, +50, -50, -100, -50, 0 pA.
    fn canonical_current(samples_per_step: usize) -> Vec<f64> {
        let mut i = Vec::new();
        for &level in &[0.0, 50.0, -50.0, -100.0, -50.0, 0.0] {
            i.extend(std::iter::repeat(level).take(samples_per_step));
        }
        i
    }

    #[test]
    fn runlength_round_trips() {
        let values = vec![0, 0, 50, 50, 50, -50, -100, -100, 0];
        let segments = runlength_encode(values.iter().copied());
        assert_eq!(runlength_decode(&segments), values);
        assert_eq!(segments[0].length, 2);
        assert_eq!(segments[1].start, 2);
    }

    #[test]
    fn canonical_protocol_is_located() {
        let i = canonical_current(1000);
        let protocol = StepProtocol::from_current(&i).unwrap();
        assert_eq!(protocol.baseline.value, 0);
        assert_eq!(protocol.depol.value, 50);
        assert_eq!(protocol.hyper[0].value, -50);
        assert_eq!(protocol.hyper[1].value, -100);
        assert_eq!(protocol.hyper_tail.unwrap().value, -50);
        assert_eq!(protocol.steps().len(), 5);
        let interval = protocol.stimulus_interval(10_000.0);
        assert!((interval[0] - 0.1).abs() < 1e-9);
        assert!((interval[1] - 0.2).abs() < 1e-9);
    }

    #[test]
    fn missing_depolarizing_step_is_fatal() {
        let mut i = vec![0.0; 1000];
        i.extend(std::iter::repeat(-50.0).take(1000));
        i.extend(std::iter::repeat(-100.0).take(1000));
        assert!(matches!(
            StepProtocol::from_current(&i),
            Err(EphysError::MissingStep(StepKind::Depolarizing))
        ));
    }

    #[test]
    fn missing_second_hyperpolarization_is_fatal() {
        let mut i = vec![0.0; 1000];
        i.extend(std::iter::repeat(50.0).take(1000));
        i.extend(std::iter::repeat(-50.0).take(1000));
        i.extend(std::iter::repeat(0.0).take(1000));
        assert!(matches!(
            StepProtocol::from_current(&i),
            Err(EphysError::MissingStep(StepKind::SecondHyperpolarizing))
        ));
    }

    #[test]
    fn spike_in_window_undefines_the_mean() {
        let rate = 10_000.0;
        let i = canonical_current(1000);
        let protocol = StepProtocol::from_current(&i).unwrap();
        let v = vec![-70.0; i.len()];
        // event in the trailing half of the depolarizing step
        let events = [0.175];
        let means = step_means(&protocol, &v, &i, rate, &events).unwrap();
        assert_eq!(means.voltage[1], None);
        assert!(means.voltage[0].is_some());
        assert!((means.current[2].unwrap() + 50.0).abs() < 1e-9);
        // stimulus amplitude ignores events
        let amp = stimulus_amplitude(&protocol, &i, rate).unwrap();
        assert!((amp.unwrap() - 50.0).abs() < 1e-9);
    }
}
