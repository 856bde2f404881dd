use nebula_lod::LodError;
use nebula_render::{BackendError, PipelineError, ShaderError};
use thiserror::Error;

/// Errors from atlas generation and chunk data readback.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Lod(#[from] LodError),

    /// A requested chunk does not lie in the given atlas slot.
    #[error("chunk ({chunk_x}, {chunk_y}) is outside atlas {atlas}")]
    ChunkOutsideAtlas {
        chunk_x: i32,
        chunk_y: i32,
        atlas: String,
    },
}

impl From<ShaderError> for GenerationError {
    fn from(e: ShaderError) -> Self {
        Self::Pipeline(e.into())
    }
}

impl GenerationError {
    /// Collapse into the shared pipeline taxonomy.
    #[must_use]
    pub fn into_pipeline(self) -> PipelineError {
        match self {
            Self::Pipeline(e) | Self::Lod(LodError::Pipeline(e)) => e,
            Self::Backend(BackendError::Unsupported(missing)) => {
                PipelineError::BackendUnsupported { missing }
            }
            Self::Backend(BackendError::Shader(e)) => e.into(),
            other => PipelineError::GenerationFailed {
                key: String::new(),
                attempts: 1,
                reason: other.to_string(),
            },
        }
    }
}
