//! Configuration structs with defaults, validation, and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.ron";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Chunk streaming, atlas layout, and cache budget.
    pub streaming: StreamingConfig,
    /// Procedural height/tile generation parameters.
    pub terrain: TerrainConfig,
    /// Atmosphere LUT and sky parameters.
    pub atmosphere: AtmosphereConfig,
    /// Time of day and weather.
    pub environment: EnvironmentConfig,
    /// Streamed feature types (grass, flowers, ...).
    pub features: Vec<FeatureTypeConfig>,
    /// Offscreen target and shading toggles.
    pub render: RenderConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Streaming and atlas layout options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StreamingConfig {
    /// World seed for all terrain generation.
    pub seed: i32,
    /// Chunk side in meters (power of two).
    pub chunk_size: u32,
    /// Meters covered by one atlas (power of two, multiple of `chunk_size`).
    pub world_coverage: u32,
    /// LOD-0 atlas texels per side (power of two).
    pub base_texture_size: u32,
    /// Number of LOD levels.
    pub max_lod_levels: u32,
    /// Distance thresholds per LOD in meters. The final entry may be
    /// omitted, in which case the coarsest LOD extends to infinity.
    pub lod_distances: Vec<f32>,
    /// Radius around the camera in which chunks are kept resident.
    pub stream_radius: f32,
    /// Heavy streaming work runs once every this many frames.
    pub update_frame_interval: u32,
    /// Byte budget for resident atlas textures.
    pub texture_budget_bytes: u64,
    /// Upper bound on generation requests submitted per frame.
    pub max_generations_per_frame: u32,
    /// Upper bound on feature chunks added per instancer update.
    pub feature_chunks_per_update: u32,
    /// Frames a chunk lingers after leaving the required set.
    pub eviction_grace_frames: u64,
    /// Failed generations are retried this many times.
    pub max_generation_retries: u32,
    /// Show coarser resident LODs while finer ones generate.
    pub progressive_refinement: bool,
    /// Stream on the cube-sphere instead of the development plane.
    pub spherical: bool,
    /// Splat kernel width in texels (odd).
    pub splat_kernel_size: u32,
    /// Back atlas textures with shared texture arrays.
    pub texture_array_pooling: bool,
    /// Layers per pooled texture array.
    pub array_pool_capacity: u32,
}

/// Noise scales and bands for the height/tile generator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TerrainConfig {
    pub elevation_scale: f32,
    pub height_scale: f32,
    pub biome_scale: f32,
    pub region_scale: f32,
    pub detail_scale: f32,
    pub ridge_scale: f32,
    pub valley_scale: f32,
    pub plateau_scale: f32,
    pub world_scale: f32,
    /// Height in meters below which terrain is submerged.
    pub water_level: f32,
}

/// Atmosphere options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AtmosphereConfig {
    /// Draw the physically based sky. When false only the gradient is used.
    pub enable_atmosphere: bool,
    /// Also build the 32×32 multi-scatter LUT.
    pub enable_multi_scatter: bool,
    pub planet_radius: f32,
    /// Atmosphere thickness above the planet surface in meters.
    pub atmosphere_height: f32,
    pub scale_height_rayleigh: f32,
    pub scale_height_mie: f32,
    /// Henyey-Greenstein `g`, strictly inside (-1, 1).
    pub mie_anisotropy: f32,
    /// Per-channel Rayleigh scattering coefficients (1/m).
    pub rayleigh_scattering: [f32; 3],
    pub mie_scattering: f32,
    /// Per-channel ozone absorption coefficients (1/m).
    pub ozone_absorption: [f32; 3],
    pub sun_intensity: f32,
    /// Ray-march steps in the sky pass.
    pub sky_samples: u32,
}

/// Seasons drive the weather table and tile lookup variants.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Season {
    Spring,
    #[default]
    Summer,
    Autumn,
    Winter,
}

impl Season {
    /// Index written into shader uniforms.
    pub fn index(self) -> u32 {
        self as u32
    }
}

/// Time-of-day and weather options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EnvironmentConfig {
    /// Seed for the weather Markov chain.
    pub weather_seed: u64,
    /// Hours in [0, 24).
    pub start_time_of_day: f32,
    /// Real seconds per in-game day.
    pub day_duration_seconds: f32,
    /// Axial tilt applied to the sun in spherical mode.
    pub axial_tilt_degrees: f32,
    pub season: Season,
    /// Base exponential fog density (1/m).
    pub fog_density: f32,
    /// Altitude falloff for height fog in meters.
    pub fog_scale_height: f32,
}

/// One streamed feature type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FeatureTypeConfig {
    pub type_name: String,
    /// Meters between grid cells.
    pub grid_spacing: f32,
    /// Fraction of cells kept, in [0, 1].
    pub density: f32,
    /// Tile ids that accept this feature.
    pub valid_tiles: Vec<u32>,
    pub noise_seed: f32,
    pub stream_radius: f32,
    pub max_render_distance: f32,
    pub taper_start_distance: f32,
    pub taper_end_distance: f32,
    pub min_cull_distance: f32,
    /// Random extra render distance per instance, in meters.
    pub cull_margin: f32,
    pub color: [f32; 3],
    pub wind_strength: f32,
    /// Blade/stem height in meters.
    pub height: f32,
    /// Blade/stem base width in meters.
    pub width: f32,
}

/// Offscreen render target and shading toggles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RenderConfig {
    pub width: u32,
    pub height: u32,
    /// Blend the two dominant tiles from the splat atlas.
    pub enable_splat: bool,
    /// Modulate the base color with the macro mask.
    pub enable_macro: bool,
    /// Splat taps per fragment: 1 (nearest) or 4 (bilinear).
    pub splat_neighbors: u32,
    /// Vertical field of view in degrees.
    pub fov_y_degrees: f32,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DebugConfig {
    /// Log filter override (e.g., "debug", "info,nebula_planet=trace").
    pub log_level: String,
    /// Write a JSON snapshot of the environment and streaming stats on exit.
    pub dump_state_json: bool,
}

// --- Default implementations ---

impl Default for Config {
    fn default() -> Self {
        Self {
            streaming: StreamingConfig::default(),
            terrain: TerrainConfig::default(),
            atmosphere: AtmosphereConfig::default(),
            environment: EnvironmentConfig::default(),
            features: vec![FeatureTypeConfig::grass(), FeatureTypeConfig::flowers()],
            render: RenderConfig::default(),
            debug: DebugConfig::default(),
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            chunk_size: 128,
            world_coverage: 1024,
            base_texture_size: 1024,
            max_lod_levels: 5,
            lod_distances: vec![1200.0, 3200.0, 8000.0, 16000.0],
            stream_radius: 2000.0,
            update_frame_interval: 10,
            texture_budget_bytes: 512 * 1024 * 1024,
            max_generations_per_frame: 8,
            feature_chunks_per_update: 8,
            eviction_grace_frames: 30,
            max_generation_retries: 3,
            progressive_refinement: true,
            spherical: false,
            splat_kernel_size: 5,
            texture_array_pooling: false,
            array_pool_capacity: 16,
        }
    }
}

impl Default for TerrainConfig {
    fn default() -> Self {
        Self {
            elevation_scale: 0.0015,
            height_scale: 120.0,
            biome_scale: 0.0004,
            region_scale: 0.0002,
            detail_scale: 0.02,
            ridge_scale: 0.001,
            valley_scale: 0.0008,
            plateau_scale: 0.0006,
            world_scale: 1.0,
            water_level: 8.0,
        }
    }
}

impl Default for AtmosphereConfig {
    fn default() -> Self {
        Self {
            enable_atmosphere: true,
            enable_multi_scatter: false,
            planet_radius: 50_000.0,
            atmosphere_height: 60_000.0,
            scale_height_rayleigh: 8000.0,
            scale_height_mie: 1200.0,
            mie_anisotropy: 0.8,
            rayleigh_scattering: [5.802e-6, 13.558e-6, 33.1e-6],
            mie_scattering: 3.996e-6,
            ozone_absorption: [0.650e-6, 1.881e-6, 0.085e-6],
            sun_intensity: 20.0,
            sky_samples: 16,
        }
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            weather_seed: 7,
            start_time_of_day: 10.0,
            day_duration_seconds: 1200.0,
            axial_tilt_degrees: 23.44,
            season: Season::Summer,
            fog_density: 2.0e-5,
            fog_scale_height: 1500.0,
        }
    }
}

impl Default for FeatureTypeConfig {
    fn default() -> Self {
        Self::grass()
    }
}

impl FeatureTypeConfig {
    /// Dense short grass on vegetated feature tiles.
    pub fn grass() -> Self {
        Self {
            type_name: "grass".to_string(),
            grid_spacing: 0.5,
            density: 0.85,
            valid_tiles: vec![102, 103, 104],
            noise_seed: 0.17,
            stream_radius: 96.0,
            max_render_distance: 70.0,
            taper_start_distance: 50.0,
            taper_end_distance: 70.0,
            min_cull_distance: 0.0,
            cull_margin: 3.0,
            color: [0.32, 0.52, 0.18],
            wind_strength: 0.25,
            height: 0.45,
            width: 0.06,
        }
    }

    /// Sparse flowers on grass feature tiles.
    pub fn flowers() -> Self {
        Self {
            type_name: "flowers".to_string(),
            grid_spacing: 2.0,
            density: 0.3,
            valid_tiles: vec![102],
            noise_seed: 0.61,
            stream_radius: 64.0,
            max_render_distance: 50.0,
            taper_start_distance: 35.0,
            taper_end_distance: 50.0,
            min_cull_distance: 0.0,
            cull_margin: 2.0,
            color: [0.85, 0.75, 0.25],
            wind_strength: 0.15,
            height: 0.3,
            width: 0.08,
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            enable_splat: true,
            enable_macro: true,
            splat_neighbors: 4,
            fov_y_degrees: 60.0,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            dump_state_json: false,
        }
    }
}

/// Platform configuration directory for this application.
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("nebula-terrain"))
}

// --- Validation ---

fn check_power_of_two(field: &'static str, value: u32) -> Result<(), ConfigError> {
    if value == 0 || !value.is_power_of_two() {
        return Err(ConfigError::invalid(
            field,
            format!("{value} is not a power of two"),
        ));
    }
    Ok(())
}

fn check_positive(field: &'static str, value: f32) -> Result<(), ConfigError> {
    if !(value.is_finite() && value > 0.0) {
        return Err(ConfigError::invalid(field, format!("{value} must be > 0")));
    }
    Ok(())
}

impl StreamingConfig {
    /// LOD thresholds with the implicit infinite last entry appended.
    pub fn resolved_lod_distances(&self) -> Vec<f32> {
        let mut out = self.lod_distances.clone();
        if out.len() < self.max_lod_levels as usize {
            out.push(f32::INFINITY);
        }
        out
    }
}

impl Config {
    /// Check cross-field invariants.
    ///
    /// Atlas sizes must be powers of two with the coverage divisible by the
    /// chunk size, LOD thresholds strictly increasing with one entry per
    /// level, and physical parameters positive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.streaming;
        check_power_of_two("streaming.chunk_size", s.chunk_size)?;
        check_power_of_two("streaming.world_coverage", s.world_coverage)?;
        check_power_of_two("streaming.base_texture_size", s.base_texture_size)?;
        if s.world_coverage % s.chunk_size != 0 {
            return Err(ConfigError::invalid(
                "streaming.world_coverage",
                format!(
                    "{} is not a multiple of chunk_size {}",
                    s.world_coverage, s.chunk_size
                ),
            ));
        }
        if s.max_lod_levels == 0 {
            return Err(ConfigError::invalid("streaming.max_lod_levels", "must be >= 1"));
        }
        let n = s.lod_distances.len();
        let levels = s.max_lod_levels as usize;
        if n != levels && n + 1 != levels {
            return Err(ConfigError::invalid(
                "streaming.lod_distances",
                format!("expected {} or {} entries, got {n}", levels - 1, levels),
            ));
        }
        if s.lod_distances.iter().any(|d| d.is_nan() || *d <= 0.0) {
            return Err(ConfigError::invalid(
                "streaming.lod_distances",
                "entries must be positive",
            ));
        }
        if s.lod_distances.windows(2).any(|w| w[1] <= w[0]) {
            return Err(ConfigError::invalid(
                "streaming.lod_distances",
                "entries must be strictly increasing",
            ));
        }
        check_positive("streaming.stream_radius", s.stream_radius)?;
        if s.update_frame_interval == 0 {
            return Err(ConfigError::invalid(
                "streaming.update_frame_interval",
                "must be >= 1",
            ));
        }
        if s.max_generations_per_frame == 0 {
            return Err(ConfigError::invalid(
                "streaming.max_generations_per_frame",
                "must be >= 1",
            ));
        }
        if s.splat_kernel_size == 0 || s.splat_kernel_size % 2 == 0 {
            return Err(ConfigError::invalid(
                "streaming.splat_kernel_size",
                format!("{} must be odd", s.splat_kernel_size),
            ));
        }
        if s.texture_array_pooling && s.array_pool_capacity == 0 {
            return Err(ConfigError::invalid(
                "streaming.array_pool_capacity",
                "must be >= 1 when pooling is enabled",
            ));
        }

        let a = &self.atmosphere;
        check_positive("atmosphere.planet_radius", a.planet_radius)?;
        check_positive("atmosphere.atmosphere_height", a.atmosphere_height)?;
        check_positive("atmosphere.scale_height_rayleigh", a.scale_height_rayleigh)?;
        check_positive("atmosphere.scale_height_mie", a.scale_height_mie)?;
        if !(a.mie_anisotropy > -1.0 && a.mie_anisotropy < 1.0) {
            return Err(ConfigError::invalid(
                "atmosphere.mie_anisotropy",
                format!("{} is outside (-1, 1)", a.mie_anisotropy),
            ));
        }
        if a.sky_samples == 0 {
            return Err(ConfigError::invalid("atmosphere.sky_samples", "must be >= 1"));
        }

        let e = &self.environment;
        if !(0.0..24.0).contains(&e.start_time_of_day) {
            return Err(ConfigError::invalid(
                "environment.start_time_of_day",
                format!("{} is outside [0, 24)", e.start_time_of_day),
            ));
        }
        check_positive("environment.day_duration_seconds", e.day_duration_seconds)?;

        for f in &self.features {
            check_positive("features.grid_spacing", f.grid_spacing)?;
            if !(0.0..=1.0).contains(&f.density) {
                return Err(ConfigError::invalid(
                    "features.density",
                    format!("{}: {} is outside [0, 1]", f.type_name, f.density),
                ));
            }
            if f.taper_end_distance < f.taper_start_distance {
                return Err(ConfigError::invalid(
                    "features.taper_end_distance",
                    format!("{}: taper ends before it starts", f.type_name),
                ));
            }
        }

        if !matches!(self.render.splat_neighbors, 1 | 4) {
            return Err(ConfigError::invalid(
                "render.splat_neighbors",
                format!("{} must be 1 or 4", self.render.splat_neighbors),
            ));
        }
        Ok(())
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Parse and validate RON text.
    pub fn from_ron(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = ron::from_str(contents).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config = Self::from_ron(&contents)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);
        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(config_dir.join(CONFIG_FILE), serialized).map_err(ConfigError::WriteError)
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let contents =
            std::fs::read_to_string(config_dir.join(CONFIG_FILE)).map_err(ConfigError::ReadError)?;
        let new_config = Self::from_ron(&contents)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
