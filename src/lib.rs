// Core data types and configuration
pub mod config;
pub mod error;
pub mod model;
pub mod registry;
pub mod types;

// Numerical building blocks
mod filter;
mod linalg;
pub mod stats;

// Fitting stages
pub mod deconvolution;
pub mod initialization;
pub mod merging;
pub mod preprocess;
pub mod quality;
pub mod spatial;
pub mod temporal;

// Outer control loops
pub mod batch;
pub mod online;
pub mod patches;

pub use batch::{Cnmf, FitOutcome};
pub use config::{
    ArOrder, BackgroundMode, CnmfConfig, InitConfig, MergeConfig, NoiseMethod, OnlineConfig, OwnershipPolicy,
    PatchConfig, Pipeline, PreprocessConfig, QualityConfig, SpatialConfig, TemporalConfig,
};
pub use error::{CnmfError, QualityWarning, Result};
pub use model::Model;
pub use online::{FrameReport, OnlineSession, SessionCounters, SessionOutcome, SessionState, SnapshotHandle};
pub use patches::{Patch, PatchExecutor, PatchFit, PatchJob, PatchReport, PatchStatus, RayonExecutor, SequentialExecutor};
pub use registry::{ComponentId, ComponentRecord, ComponentState, Registry};
pub use types::{Frame, FrameShape, FrameSource, InMemorySource};
