//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Headless planet terrain renderer.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "nebula-terrain", about = "Procedural planet terrain pipeline")]
pub struct CliArgs {
    /// World seed.
    #[arg(long)]
    pub seed: Option<i32>,

    /// Number of frames to simulate.
    #[arg(long, default_value_t = 120)]
    pub frames: u64,

    /// Streaming radius in meters.
    #[arg(long)]
    pub stream_radius: Option<f32>,

    /// Stream on the cube-sphere instead of the plane.
    #[arg(long)]
    pub spherical: Option<bool>,

    /// Texture budget in mebibytes.
    #[arg(long)]
    pub budget_mb: Option<u64>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Write the final frame to this PNG file.
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Use the in-memory software backend instead of a GPU adapter.
    #[arg(long)]
    pub software: bool,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(seed) = args.seed {
            self.streaming.seed = seed;
        }
        if let Some(radius) = args.stream_radius {
            self.streaming.stream_radius = radius;
        }
        if let Some(spherical) = args.spherical {
            self.streaming.spherical = spherical;
        }
        if let Some(mb) = args.budget_mb {
            self.streaming.texture_budget_bytes = mb * 1024 * 1024;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            seed: Some(7),
            budget_mb: Some(64),
            ..Default::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.streaming.seed, 7);
        assert_eq!(config.streaming.texture_budget_bytes, 64 * 1024 * 1024);
        // Non-overridden fields retain defaults
        assert_eq!(config.streaming.stream_radius, 2000.0);
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_cli_parses_flags() {
        let args = CliArgs::try_parse_from([
            "nebula-terrain",
            "--frames",
            "30",
            "--spherical",
            "true",
            "--software",
        ])
        .unwrap();
        assert_eq!(args.frames, 30);
        assert_eq!(args.spherical, Some(true));
        assert!(args.software);
    }
}
