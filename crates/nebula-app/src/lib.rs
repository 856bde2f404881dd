//! Headless driver for the planet terrain pipeline.
//!
//! Wires configuration, streaming, atmosphere, environment, terrain and
//! feature rendering into a single frame loop on any [`nebula_render::GpuBackend`].

pub mod error;
pub mod platform;
pub mod renderer;
pub mod scheduler;

pub use error::AppError;
pub use platform::PlatformDirs;
pub use renderer::{CameraPath, FrameReport, PlanetRenderer, StateDump};
pub use scheduler::FrameScheduler;
