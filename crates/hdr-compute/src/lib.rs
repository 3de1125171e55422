//! GPU tone-mapping pipelines cross-checked against CPU references.
//!
//! Selects a wgpu adapter, plans launch geometry from its limits, builds one
//! WGSL program per operator, and runs the operator's stage sequence over a
//! fixed set of device buffers. Any run can be verified pixel-by-pixel
//! against the `hdr-core` reference of the same operator.
//!
//! # Architecture
//!
//! ```text
//! Session (caller-owned)
//!     └── ToneMapper  ── Unconfigured → Ready ⇄ Executing → Released
//!             ├── DeviceContext   adapter selection, programs, buffers
//!             │       └── LaunchGeometry   local/global sizes per kernel
//!             ├── GpuPipeline
//!             │       ├── HistEqPipeline
//!             │       ├── ReinhardGlobalPipeline
//!             │       ├── ReinhardLocalPipeline
//!             │       └── GradDomPipeline
//!             ├── ReferenceCache  ── hdr_core::tonemap
//!             └── Verifier
//! ```
//!
//! Progress, timing and failures go to a [`StatusSink`]; the default sink
//! forwards to `tracing`.
//!
//! # Example
//!
//! ```ignore
//! use hdr_compute::{Operator, Params, RunOptions, ToneMapper};
//!
//! let mut mapper = ToneMapper::new(Operator::reinhard_global());
//! mapper.setup(&Params::default(), width, height)?;
//! let report = mapper.process(&input, &mut output, &RunOptions::verified())?;
//! println!("{}", report.verification);
//! ```

pub mod cache;
pub mod device;
pub mod geometry;
pub mod interop;
pub mod params;
pub mod session;
pub mod stages;
pub mod status;
pub mod tonemap;
pub mod verify;
mod shaders;

pub use cache::{Fingerprint, ReferenceCache};
pub use device::{list_devices, AdapterSummary, DeviceContext, DeviceInfo};
pub use geometry::{KernelLimits, LaunchGeometry};
pub use interop::{InteropTextures, SharedDevice};
pub use params::{DeviceClass, Params, PlatformDevice};
pub use session::Session;
pub use stages::StageMask;
pub use status::{Reporter, Severity, StatusSink, TracingSink};
pub use tonemap::{
    Algorithm, Method, Operator, PipelineState, RunOptions, RunReport, ToneMapper,
    VerificationStatus,
};
pub use verify::{VerificationReport, Verifier};

use thiserror::Error;

/// Numeric failure codes carried by resource and execution errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    DeviceNotFound = -1,
    DeviceNotAvailable = -2,
    OutOfMemory = -4,
    OutOfResources = -5,
    BuildFailure = -11,
    MapFailure = -12,
    InvalidValue = -30,
}

impl ErrorCode {
    #[inline]
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Framework errors.
#[derive(Error, Debug)]
pub enum ComputeError {
    /// Bad platform/device index, stage index, or parameter combination.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Adapter, device, buffer, bind group or pipeline creation failed.
    #[error("Error during operation '{op}' ({code}): {detail}")]
    ResourceCreation {
        op: String,
        code: ErrorCode,
        detail: String,
    },

    /// A WGSL program failed to compile; `log` holds the full diagnostics.
    #[error("Failed to build program '{label}':\n{log}")]
    Build { label: String, log: String },

    /// Submission, synchronisation or readback failed mid-run.
    #[error("Error during operation '{op}' ({code}): {detail}")]
    Execution {
        op: String,
        code: ErrorCode,
        detail: String,
    },

    /// The operation is not allowed in the pipeline's current state.
    #[error("Cannot {op} while pipeline is {state}")]
    InvalidState { op: &'static str, state: PipelineState },

    #[error(transparent)]
    Core(#[from] hdr_core::Error),
}

impl ComputeError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn resource(op: impl Into<String>, code: ErrorCode, detail: impl Into<String>) -> Self {
        Self::ResourceCreation {
            op: op.into(),
            code,
            detail: detail.into(),
        }
    }

    pub fn execution(op: impl Into<String>, code: ErrorCode, detail: impl Into<String>) -> Self {
        Self::Execution {
            op: op.into(),
            code,
            detail: detail.into(),
        }
    }
}

pub type ComputeResult<T> = Result<T, ComputeError>;
