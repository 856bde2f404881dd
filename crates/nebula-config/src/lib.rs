//! Configuration for the planet terrain pipeline.
//!
//! Every recognised option lives in a closed set of structs that persist to
//! disk as RON. Unknown keys are rejected, missing keys take defaults, and
//! [`Config::validate`] checks the cross-field invariants the streaming core
//! relies on. CLI overrides are applied through clap.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    AtmosphereConfig, Config, DebugConfig, EnvironmentConfig, FeatureTypeConfig, RenderConfig,
    Season, StreamingConfig, TerrainConfig, default_config_dir,
};
pub use error::ConfigError;
