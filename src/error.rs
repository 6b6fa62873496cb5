use std::time::Duration;

use thiserror::Error;

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Failures surfaced by the orchestration core.
///
/// Flow-control statuses (`NeedMoreInput`, `NeedMoreOutput`) and transient
/// busy conditions are resolved inside the driver and never show up here.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    #[error("surface pool '{pool}' needs {required} surface(s) but only {available} can be provided")]
    Allocation {
        pool: String,
        required: usize,
        available: usize,
    },

    #[error("stage '{stage}' stayed busy for {waited:?}")]
    BusyTimeout { stage: String, waited: Duration },

    #[error("stage '{stage}' failed: {message}")]
    StageFailed { stage: String, message: String },

    #[error("completion of '{operation}' not signalled within {waited:?}")]
    SyncTimeout { operation: String, waited: Duration },

    #[error("no free surface in pool '{pool}' after {waited:?}")]
    SurfaceStarved { pool: String, waited: Duration },

    #[error("bitstream buffer cannot grow to {required} bytes (limit {limit})")]
    BufferGrowth { required: usize, limit: usize },

    #[error("classifier thread failed: {0}")]
    ClassifierFailed(String),

    #[error("classifier thread unresponsive for frame {sequence} after {waited:?}")]
    ClassifierStalled { sequence: u64, waited: Duration },

    #[error("frame source failed: {0}")]
    Source(String),

    #[error("sink write failed")]
    Sink(#[from] std::io::Error),
}

impl PipelineError {
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StageFailed {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// True for errors raised before any frame moved through the chain.
    pub fn is_setup_error(&self) -> bool {
        matches!(self, Self::InvalidConfig(_) | Self::Allocation { .. })
    }
}
