use nebula_render::PipelineError;
use thiserror::Error;

/// Errors from atlas configuration and the texture cache.
#[derive(Debug, Error)]
pub enum LodError {
    #[error("invalid atlas config field '{field}': {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}
