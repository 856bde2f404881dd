//! Error types shared by every pipeline built on the backend capability.

use crate::shader::ShaderError;

/// Failures reported by a [`GpuBackend`](crate::GpuBackend) implementation.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// A required capability is not offered by this backend.
    #[error("backend does not support {0}")]
    Unsupported(&'static str),

    /// Shader compilation failed.
    #[error(transparent)]
    Shader(#[from] ShaderError),

    /// A handle does not refer to a live resource.
    #[error("invalid {kind} handle {index}")]
    InvalidHandle { kind: &'static str, index: u32 },

    /// A write or copy does not fit the destination.
    #[error("{what}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        what: &'static str,
        expected: u64,
        actual: u64,
    },

    /// Bind group entries do not match the pipeline layout.
    #[error("bind group {group}: {reason}")]
    LayoutMismatch { group: u32, reason: String },

    /// A draw was issued outside `begin_pass`/`end_pass`, or passes nested.
    #[error("render pass state: {0}")]
    PassState(&'static str),

    /// The platform refused an allocation.
    #[error("allocation of {bytes} bytes failed")]
    OutOfMemory { bytes: u64 },
}

/// The error taxonomy surfaced by the terrain, atmosphere and feature
/// pipelines.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Storage textures, compute, or texture arrays are missing. Fatal at init.
    #[error("backend unsupported: missing {missing}")]
    BackendUnsupported { missing: &'static str },

    /// Fatal for the affected pipeline; not retried.
    #[error("shader '{name}' failed to compile: {message}")]
    ShaderCompilationFailed { name: String, message: String },

    /// Dispatched work failed; the slot is left unchanged.
    #[error("generation of {key} failed after {attempts} attempt(s): {reason}")]
    GenerationFailed {
        key: String,
        attempts: u32,
        reason: String,
    },

    /// A required atlas was not resident when a draw was assembled.
    #[error("missing {kind} texture for {key}")]
    MissingTexture { key: String, kind: String },

    /// Eviction could not bring residency under budget.
    #[error("texture budget exceeded: {resident} resident > {budget} budget")]
    BudgetExceeded { resident: u64, budget: u64 },

    /// NaN or non-finite coordinates.
    #[error("invalid coordinate ({x}, {y})")]
    InvalidCoordinate { x: f64, y: f64 },
}

impl From<ShaderError> for PipelineError {
    fn from(e: ShaderError) -> Self {
        match e {
            ShaderError::CompilationFailed { name, message } => {
                Self::ShaderCompilationFailed { name, message }
            }
            other => Self::ShaderCompilationFailed {
                name: String::new(),
                message: other.to_string(),
            },
        }
    }
}

impl From<BackendError> for PipelineError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Unsupported(missing) => Self::BackendUnsupported { missing },
            BackendError::Shader(s) => s.into(),
            other => Self::GenerationFailed {
                key: String::new(),
                attempts: 1,
                reason: other.to_string(),
            },
        }
    }
}
