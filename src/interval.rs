use crate::error::EphysError;

/// Half-open range of sample indices with an associated sampling period,
/// used to select, average, or test containment of windows in a trace.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Interval {
    start_index: usize,
    end_index: usize,
    /// Seconds per sample.
    sampling_period: f64,
}

impl Interval {
    pub fn new(
        start_index: usize,
        end_index: usize,
        sampling_period: f64,
    ) -> Result<Self, EphysError> {
        if start_index > end_index {
            return Err(EphysError::BadInterval {
                start: start_index,
                end: end_index,
            });
        }
        Ok(Self {
            start_index,
            end_index,
            sampling_period,
        })
    }

    /// Build from a time window in seconds at the given sampling rate.
    pub fn from_times(start_s: f64, end_s: f64, sampling_rate: f64) -> Result<Self, EphysError> {
        let period = 1.0 / sampling_rate;
        Self::new(
            (start_s * sampling_rate).round() as usize,
            (end_s * sampling_rate).round() as usize,
            period,
        )
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.start_index..self.end_index
    }

    /// Window boundaries in seconds.
    pub fn times(&self) -> (f64, f64) {
        (
            self.start_index as f64 * self.sampling_period,
            self.end_index as f64 * self.sampling_period,
        )
    }

    pub fn len(&self) -> usize {
        self.end_index - self.start_index
    }

    pub fn is_empty(&self) -> bool {
        self.start_index == self.end_index
    }

    /// True when any event time (seconds) falls within [start, end).
    pub fn contains(&self, events: &[f64]) -> bool {
        let (start, end) = self.times();
        events.iter().any(|&ev| ev >= start && ev < end)
    }

    /// Mean of the trace over the window. Averaging over a window that
    /// contains an event yields `None` rather than a biased mean; an empty
    /// or out-of-range window is also `None`.
    pub fn mean_of(&self, trace: &[f64], events: Option<&[f64]>) -> Option<f64> {
        if let Some(events) = events {
            if self.contains(events) {
                return None;
            }
        }
        let end = self.end_index.min(trace.len());
        if self.start_index >= end {
            return None;
        }
        let window = &trace[self.start_index..end];
        Some(window.iter().sum::<f64>() / window.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_inverted_bounds() {
        assert!(matches!(
            Interval::new(10, 5, 1e-4),
            Err(EphysError::BadInterval { .. })
        ));
    }

    #[test]
    fn containment_is_half_open() {
        // 1 kHz sampling, window [10, 20) ms
        let iv = Interval::new(10, 20, 1e-3).unwrap();
        assert!(iv.contains(&[0.010]));
        assert!(iv.contains(&[0.0199]));
        assert!(!iv.contains(&[0.020]));
        assert!(!iv.contains(&[0.005, 0.025]));
    }

    #[test]
    fn mean_is_undefined_when_an_event_is_inside() {
        let trace: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let iv = Interval::new(10, 20, 1e-3).unwrap();
        assert_eq!(iv.mean_of(&trace, Some(&[0.015])), None);
        let mean = iv.mean_of(&trace, Some(&[0.5])).unwrap();
        assert!((mean - 14.5).abs() < 1e-12);
        assert_eq!(iv.mean_of(&trace, None), Some(14.5));
    }

    #[test]
    fn mean_of_empty_window_is_undefined() {
        let trace = vec![1.0; 50];
        let iv = Interval::new(20, 20, 1e-3).unwrap();
        assert_eq!(iv.mean_of(&trace, None), None);
        // window entirely past the end of the trace
        let iv = Interval::new(60, 80, 1e-3).unwrap();
        assert_eq!(iv.mean_of(&trace, None), None);
    }
}
