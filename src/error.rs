/// Error kinds surfaced to callers, and non-fatal quality warnings.

use crate::types::FrameShape;

/// Fatal errors. Everything recoverable is reported as a [`QualityWarning`] instead.
#[derive(Debug, thiserror::Error)]
pub enum CnmfError {
    /// A configuration parameter is missing or out of range. Raised before any fitting.
    #[error("invalid configuration: `{param}` {reason}")]
    InvalidConfig { param: &'static str, reason: String },

    /// A frame whose shape differs from the session's frame shape.
    #[error("malformed frame {index}: expected {expected}, got {actual}")]
    MalformedFrame {
        index: usize,
        expected: FrameShape,
        actual: FrameShape,
    },

    /// Pixel buffer length does not match the declared shape.
    #[error("frame of shape {shape} needs {expected} pixels, got {actual}")]
    PixelCount {
        shape: FrameShape,
        expected: usize,
        actual: usize,
    },

    /// The source ended before enough frames were seen.
    #[error("frame source exhausted after {frames} frames ({needed} needed)")]
    StreamExhausted { frames: usize, needed: usize },

    /// The session already shut down or failed on an earlier frame.
    #[error("session is closed")]
    SessionClosed,

    /// Component data whose length disagrees with the model it is added to.
    #[error("component does not fit the model")]
    Shape(#[from] ndarray::ShapeError),

    /// The external frame source reported an error.
    #[error("frame source failed")]
    Source(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CnmfError>;

/// Non-fatal conditions attached to a fit outcome.
#[derive(Clone, Debug, PartialEq)]
pub enum QualityWarning {
    /// The alternating loop hit its iteration cap; the best model so far was kept.
    NotConverged { iterations: usize, change: f64 },
    /// Components dropped because their support or trace vanished.
    ComponentsRemoved { count: usize },
    /// A patch failed and contributed no components.
    PatchFailed { patch: usize, reason: String },
}

pub(crate) fn invalid(param: &'static str, reason: impl Into<String>) -> CnmfError {
    CnmfError::InvalidConfig {
        param,
        reason: reason.into(),
    }
}
