use nebula_config::ConfigError;
use nebula_lod::LodError;
use nebula_planet::{AtmosphereError, StreamingError};
use nebula_render::{BackendError, RenderContextError};
use nebula_terrain::GenerationError;
use thiserror::Error;

/// Everything that can stop the headless renderer.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("no usable GPU adapter: {0}")]
    Context(#[from] RenderContextError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Lod(#[from] LodError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Streaming(#[from] StreamingError),

    #[error(transparent)]
    Atmosphere(#[from] AtmosphereError),

    #[error("readback failed: {0}")]
    Readback(String),

    #[error("failed to write image: {0}")]
    Image(#[from] image::ImageError),

    #[error("failed to serialise state: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not resolve platform directories")]
    NoPlatformDirs,
}
