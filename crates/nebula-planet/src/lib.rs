//! Planet-level rendering: the atmosphere, chunk streaming over the LOD
//! atlases, the terrain surface material, streamed ground features and the
//! environment state that feeds their uniforms.

pub mod atmosphere;
pub mod environment;
pub mod error;
pub mod features;
pub mod streaming;
pub mod terrain_material;

pub use atmosphere::{Atmosphere, AtmosphereParams, AtmosphereState, AtmosphereUniform, SkyInputs};
pub use environment::{
    DayPeriod, Environment, EnvironmentSnapshot, EnvironmentState, EnvironmentUniform, WeatherKind,
};
pub use error::{AtmosphereError, StreamingError};
pub use features::{
    FeatureDrawStats, FeatureFrameInputs, FeatureInstanceId, FeatureInstancer, PlacedFeature,
    place_instance,
};
pub use streaming::{
    ActiveChunk, CameraView, ChunkCoord, ChunkId, StreamingDomain, StreamingEvent,
    StreamingManager, StreamingStats,
};
pub use terrain_material::{TerrainDrawStats, TerrainFrameInputs, TerrainMaterial, TileSet};
