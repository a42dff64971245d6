use std::path::PathBuf;
use thiserror::Error;

use crate::steps::StepKind;

/// Fatal input errors for the analysis tools. Expected absence-of-signal
/// conditions (no spikes, failed fit, spike-contaminated window) are `None`
/// values in the output, never errors.
#[derive(Debug, Error)]
pub enum EphysError {
    #[error("not a current clamp recording (signal 0 units `{0}` not voltage)")]
    NotVoltage(String),
    #[error("not a current clamp recording (signal 1 units `{0}` not current)")]
    NotCurrent(String),
    #[error("recording has no command channel")]
    NoCommandChannel,
    #[error("`{0}` is not in the resource registry")]
    MissingResource(String),
    #[error("no registry root; pass --registry or set NBANK_REGISTRY")]
    NoRegistry,
    #[error("there is no epoch {epoch} ({available} available)")]
    NoSuchEpoch { epoch: usize, available: usize },
    #[error("no {0} step in command channel")]
    MissingStep(StepKind),
    #[error("recording `{path}` is malformed: {reason}")]
    BadRecording { path: PathBuf, reason: String },
    #[error("interval start {start} is after end {end}")]
    BadInterval { start: usize, end: usize },
    #[error("failed to render plot: {0}")]
    Plot(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl<E: std::error::Error + Send + Sync + 'static> From<plotters::drawing::DrawingAreaErrorKind<E>>
    for EphysError
{
    fn from(value: plotters::drawing::DrawingAreaErrorKind<E>) -> Self {
        EphysError::Plot(format!("{value:?}"))
    }
}

impl From<image::ImageError> for EphysError {
    fn from(value: image::ImageError) -> Self {
        EphysError::Plot(value.to_string())
    }
}
