use nebula_lod::LodError;
use nebula_render::{BackendError, PipelineError, ShaderError};
use nebula_terrain::GenerationError;
use thiserror::Error;

/// Errors from building the atmosphere LUTs and drawing the sky.
#[derive(Debug, Error)]
pub enum AtmosphereError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// `update` or `draw_sky` before `initialize`.
    #[error("atmosphere used before initialization")]
    NotInitialized,

    #[error("atmosphere LUT generation failed: {0}")]
    LutFailed(String),
}

impl From<ShaderError> for AtmosphereError {
    fn from(e: ShaderError) -> Self {
        Self::Backend(e.into())
    }
}

impl AtmosphereError {
    /// Collapse into the shared pipeline taxonomy.
    #[must_use]
    pub fn into_pipeline(self) -> PipelineError {
        match self {
            Self::Backend(e) => e.into(),
            other => PipelineError::GenerationFailed {
                key: "atmosphere".into(),
                attempts: 1,
                reason: other.to_string(),
            },
        }
    }
}

/// Errors from the chunk streamer, the terrain surface and the feature instancer.
#[derive(Debug, Error)]
pub enum StreamingError {
    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Lod(#[from] LodError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl StreamingError {
    #[must_use]
    pub fn into_pipeline(self) -> PipelineError {
        match self {
            Self::Generation(e) => e.into_pipeline(),
            Self::Lod(LodError::Pipeline(e)) | Self::Pipeline(e) => e,
            Self::Lod(e) => PipelineError::GenerationFailed {
                key: String::new(),
                attempts: 1,
                reason: e.to_string(),
            },
            Self::Backend(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Missing compute surfaces as `BackendUnsupported` in both error families.
    #[test]
    fn test_unsupported_collapses() {
        let a: AtmosphereError = BackendError::Unsupported("compute").into();
        assert!(matches!(
            a.into_pipeline(),
            PipelineError::BackendUnsupported { missing: "compute" }
        ));
        let s: StreamingError = BackendError::Unsupported("storage textures").into();
        assert!(matches!(
            s.into_pipeline(),
            PipelineError::BackendUnsupported { .. }
        ));
    }

    /// LUT failures are reported as generation failures for the atmosphere.
    #[test]
    fn test_lut_failed_message() {
        let e = AtmosphereError::LutFailed("submission 3 failed".into()).into_pipeline();
        assert_eq!(
            e.to_string(),
            "generation of atmosphere failed after 1 attempt(s): atmosphere LUT generation failed: submission 3 failed"
        );
    }
}
