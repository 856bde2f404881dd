//! The per-frame planet pipeline.
//!
//! [`PlanetRenderer`] owns every stage and runs them in a fixed order each
//! frame: throttled residency refresh, atlas generation, atmosphere LUT work,
//! environment step, feature bookkeeping, then one render pass that draws
//! terrain, features and finally the sky into an offscreen target.

use std::time::Duration;

use glam::Vec3;
use image::{GrayImage, RgbaImage};
use nebula_config::Config;
use nebula_cubesphere::PlanetSurface;
use nebula_lod::{AtlasKind, LodAtlasConfig};
use nebula_planet::{
    Atmosphere, AtmosphereError, CameraView, Environment, EnvironmentSnapshot, EnvironmentUniform,
    FeatureDrawStats, FeatureFrameInputs, FeatureInstancer, SkyInputs, StreamingDomain,
    StreamingEvent, StreamingManager, StreamingStats, TerrainDrawStats, TerrainFrameInputs,
    TerrainMaterial, features::FEATURE_UPDATE_INTERVAL,
};
use nebula_render::{
    BufferHandle, BufferUsage, Camera, GpuBackend, PassDesc, ReadbackStatus, TextureDesc,
    TextureFormat, TextureHandle, TextureRegion, TextureUsage, padded_bytes_per_row, unpad_rows,
};
use nebula_terrain::{AtlasGenerator, GeneratorOptions, TerrainParams, decode_rgba32f};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::scheduler::FrameScheduler;

/// Offscreen color format; the sky and surface shaders write tonemapped
/// linear color.
pub const COLOR_FORMAT: TextureFormat = TextureFormat::Rgba8UnormSrgb;
pub const DEPTH_FORMAT: TextureFormat = TextureFormat::Depth32Float;

/// Simulated seconds per frame.
pub const FRAME_DT: f32 = 1.0 / 60.0;

/// Reverse-Z clears depth to the far plane at 0.
const FAR_DEPTH: f32 = 0.0;

const READBACK_ATTEMPTS: u32 = 5_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FrameTask {
    Residency,
    Streaming,
    Atmosphere,
    Environment,
    Features,
}

/// Straight-line camera flight used by the headless binary.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraPath {
    pub start: Vec3,
    /// Meters per frame.
    pub velocity: Vec3,
    /// Downward tilt of the view in radians.
    pub pitch: f32,
    /// On a sphere the camera keeps its distance from the center.
    pub planet_radius: Option<f32>,
}

impl CameraPath {
    /// Default flight for `config`: 150 m above ground, 4 m per frame.
    pub fn straight(config: &Config) -> Self {
        let altitude = 150.0;
        let speed = 4.0;
        if config.streaming.spherical {
            let radius = config.atmosphere.planet_radius;
            Self {
                start: Vec3::new(0.0, radius + altitude, 0.0),
                velocity: Vec3::new(speed, 0.0, 0.0),
                pitch: 0.15,
                planet_radius: Some(radius),
            }
        } else {
            Self {
                start: Vec3::new(0.0, altitude, 0.0),
                velocity: Vec3::new(speed, 0.0, speed * 0.25),
                pitch: 0.15,
                planet_radius: None,
            }
        }
    }

    pub fn position(&self, frame: u64) -> Vec3 {
        let p = self.start + self.velocity * frame as f32;
        match self.planet_radius {
            Some(_) => p.normalize_or_zero() * self.start.length(),
            None => p,
        }
    }

    /// Local up at `position`.
    pub fn up(&self, position: Vec3) -> Vec3 {
        match self.planet_radius {
            Some(_) => position.try_normalize().unwrap_or(Vec3::Y),
            None => Vec3::Y,
        }
    }

    /// Camera for `frame` with the given lens settings.
    pub fn camera(&self, frame: u64, fov_y: f32, aspect_ratio: f32) -> Camera {
        let position = self.position(frame);
        let up = self.up(position);
        let along = self.velocity - up * self.velocity.dot(up);
        let heading = along.try_normalize().unwrap_or(Vec3::X);
        let forward = (heading * self.pitch.cos() - up * self.pitch.sin()).normalize_or_zero();
        Camera {
            fov_y,
            aspect_ratio,
            ..Camera::looking(position, forward, up)
        }
    }
}

/// What one frame did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct FrameReport {
    pub frame: u64,
    pub chunks_drawn: usize,
    pub chunks_skipped: usize,
    pub triangles: usize,
    pub feature_draws: usize,
    pub feature_instances: u64,
    pub lut_ready: bool,
    pub generation_failures: usize,
}

/// Debug dump written next to the output image.
#[derive(Clone, Debug, Serialize)]
pub struct StateDump {
    pub frame: u64,
    pub environment: EnvironmentSnapshot,
    pub streaming: StreamingStats,
    pub last_frame: FrameReport,
}

pub struct PlanetRenderer {
    config: Config,
    streaming: StreamingManager,
    atmosphere: Atmosphere,
    environment: Environment,
    terrain: TerrainMaterial,
    features: FeatureInstancer,
    scheduler: FrameScheduler<FrameTask>,
    color: TextureHandle,
    depth: TextureHandle,
    frame: u64,
    time: f32,
    last_report: FrameReport,
}

impl PlanetRenderer {
    /// Build every stage on `gpu`. The config must already be validated.
    pub fn new(gpu: &mut dyn GpuBackend, config: &Config) -> Result<Self, AppError> {
        let settings = &config.streaming;
        let atlas = LodAtlasConfig::from_streaming(settings)?;
        let spherical = settings.spherical;
        let radius = config.atmosphere.planet_radius;
        let (params, domain) = if spherical {
            (
                TerrainParams::spherical(settings.seed, &config.terrain, radius),
                StreamingDomain::Spherical(PlanetSurface::new(f64::from(radius))),
            )
        } else {
            (
                TerrainParams::planar(settings.seed, &config.terrain),
                StreamingDomain::Planar,
            )
        };
        let generator = AtlasGenerator::new(
            gpu,
            atlas.clone(),
            params,
            GeneratorOptions::from_streaming(settings),
        )?;
        let streaming = StreamingManager::new(settings, generator, domain);

        let mut atmosphere = Atmosphere::new(&config.atmosphere);
        atmosphere.initialize(gpu, COLOR_FORMAT)?;
        let environment = Environment::new(&config.environment, spherical);
        let terrain = TerrainMaterial::new(gpu, COLOR_FORMAT, atlas.grid_segments(0))?;
        let features = FeatureInstancer::new(
            gpu,
            COLOR_FORMAT,
            &config.features,
            settings.feature_chunks_per_update,
        )?;

        let (width, height) = (config.render.width.max(1), config.render.height.max(1));
        let color = gpu.create_texture_2d(&TextureDesc {
            label: "planet color",
            width,
            height,
            layers: 1,
            format: COLOR_FORMAT,
            usage: TextureUsage::TARGET,
        })?;
        let depth = gpu.create_texture_2d(&TextureDesc {
            label: "planet depth",
            width,
            height,
            layers: 1,
            format: DEPTH_FORMAT,
            usage: TextureUsage::TARGET,
        })?;

        let mut scheduler = FrameScheduler::new();
        scheduler.register(
            "residency",
            u64::from(settings.update_frame_interval),
            0,
            FrameTask::Residency,
        );
        scheduler.register("streaming", 1, 0, FrameTask::Streaming);
        scheduler.register("atmosphere", 1, 0, FrameTask::Atmosphere);
        scheduler.register("environment", 1, 0, FrameTask::Environment);
        scheduler.register("features", FEATURE_UPDATE_INTERVAL, 0, FrameTask::Features);

        info!(
            "Planet renderer ready on {:?}: {}x{}, {} mode, seed {}",
            gpu.api_name(),
            width,
            height,
            if spherical { "spherical" } else { "planar" },
            settings.seed
        );
        Ok(Self {
            config: config.clone(),
            streaming,
            atmosphere,
            environment,
            terrain,
            features,
            scheduler,
            color,
            depth,
            frame: 0,
            time: 0.0,
            last_report: FrameReport::default(),
        })
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn streaming(&self) -> &StreamingManager {
        &self.streaming
    }

    pub fn atmosphere(&self) -> &Atmosphere {
        &self.atmosphere
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn features(&self) -> &FeatureInstancer {
        &self.features
    }

    pub fn color_target(&self) -> TextureHandle {
        self.color
    }

    pub fn last_report(&self) -> FrameReport {
        self.last_report
    }

    /// Run one frame as seen from `camera`. Never waits on the GPU: stages
    /// that are not ready yet fall back and the frame still draws.
    pub fn render_frame(&mut self, gpu: &mut dyn GpuBackend, camera: &Camera) -> Result<FrameReport, AppError> {
        gpu.poll();
        let frame = self.frame;
        let view = CameraView::new(camera.position.as_dvec3(), camera.forward.as_dvec3());
        let up = camera.up.normalize_or_zero();
        let mut failures = 0;

        let tasks: Vec<FrameTask> = self.scheduler.due(frame).collect();
        for task in tasks {
            match task {
                FrameTask::Residency => {
                    self.streaming.refresh_residency(&view, frame);
                }
                FrameTask::Streaming => {
                    let events = self.streaming.update(gpu, &view, frame)?;
                    failures += log_events(&events);
                    self.features.handle_events(gpu, &events);
                }
                FrameTask::Atmosphere => self.update_atmosphere(gpu)?,
                FrameTask::Environment => self.environment.update(FRAME_DT, up),
                FrameTask::Features => self.features.update(gpu, &self.streaming, frame)?,
            }
        }

        let env = self.environment.uniform();
        let state = self.environment.state();
        let clear = state.horizon_color;
        gpu.begin_pass(&PassDesc {
            label: "planet",
            color: self.color,
            depth: Some(self.depth),
            clear_color: Some([f64::from(clear.x), f64::from(clear.y), f64::from(clear.z), 1.0]),
            clear_depth: Some(FAR_DEPTH),
        })?;
        let drawn = self.draw_scene(gpu, camera, &env);
        gpu.end_pass()?;
        let (terrain, features) = drawn?;
        gpu.submit();

        let report = FrameReport {
            frame,
            chunks_drawn: terrain.drawn,
            chunks_skipped: terrain.skipped,
            triangles: terrain.triangles,
            feature_draws: features.draws,
            feature_instances: features.instances,
            lut_ready: self.atmosphere.lut_ready(),
            generation_failures: failures,
        };
        if frame % 60 == 0 {
            debug!(
                "Frame {frame}: {} chunks drawn, {} skipped, {} feature draws",
                report.chunks_drawn, report.chunks_skipped, report.feature_draws
            );
        }
        self.last_report = report;
        self.frame += 1;
        self.time += FRAME_DT;
        Ok(report)
    }

    fn draw_scene(
        &mut self,
        gpu: &mut dyn GpuBackend,
        camera: &Camera,
        env: &EnvironmentUniform,
    ) -> Result<(TerrainDrawStats, FeatureDrawStats), AppError> {
        let spherical = self.streaming.domain().is_spherical();
        let view_proj = camera.view_projection_matrix();
        let render = &self.config.render;

        let terrain = self.terrain.draw(
            gpu,
            &TerrainFrameInputs {
                view_proj,
                camera_position: camera.position,
                time: self.time,
                enable_splat: render.enable_splat,
                enable_macro: render.enable_macro,
                splat_neighbors: render.splat_neighbors,
            },
            &self.atmosphere.surface_uniform(Vec3::ZERO, spherical),
            env,
            &self.streaming,
        )?;
        let features = self.features.draw(
            gpu,
            &FeatureFrameInputs {
                view_proj,
                camera_position: camera.position,
                time: self.time,
            },
            env,
            &self.streaming,
        )?;
        let state = self.environment.state();
        self.atmosphere.draw_sky(
            gpu,
            &SkyInputs {
                inv_view_proj: camera.inverse_view_projection(),
                camera_position: camera.position,
                sun_direction: state.sun_direction,
                zenith_color: state.zenith_color,
                horizon_color: state.horizon_color,
                daylight: state.daylight,
                num_samples: self.config.atmosphere.sky_samples,
                spherical,
                planet_center: Vec3::ZERO,
            },
        )?;
        Ok((terrain, features))
    }

    /// A LUT that keeps failing leaves the gradient sky in place.
    fn update_atmosphere(&mut self, gpu: &mut dyn GpuBackend) -> Result<(), AppError> {
        match self.atmosphere.update(gpu) {
            Ok(_) => Ok(()),
            Err(AtmosphereError::LutFailed(reason)) => {
                warn!("Sky stays on the gradient fallback: {reason}");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Environment and streaming counters as pretty JSON.
    pub fn state_json(&self) -> Result<String, AppError> {
        let dump = StateDump {
            frame: self.frame,
            environment: self.environment.state().snapshot(),
            streaming: self.streaming.stats(),
            last_frame: self.last_report,
        };
        Ok(serde_json::to_string_pretty(&dump)?)
    }

    /// Read the color target back as an RGBA image.
    pub fn capture_color(&self, gpu: &mut dyn GpuBackend) -> Result<RgbaImage, AppError> {
        let (width, height) = (self.config.render.width.max(1), self.config.render.height.max(1));
        let bytes = read_texture(gpu, &TextureRegion::full(self.color, 0, width, height), 4)?;
        RgbaImage::from_raw(width, height, bytes)
            .ok_or_else(|| AppError::Readback("color target size mismatch".into()))
    }

    /// Grayscale view of the height atlas under the chunk nearest the
    /// camera, normalised to its own range. `None` before any chunk has a
    /// resident height atlas.
    pub fn capture_height_preview(&self, gpu: &mut dyn GpuBackend) -> Result<Option<GrayImage>, AppError> {
        let nearest = self
            .streaming
            .drawable()
            .filter_map(|(_, c)| c.textures.get(AtlasKind::Height).map(|t| (c.distance, t.texture)))
            .min_by(|a, b| a.0.total_cmp(&b.0));
        let Some((_, height)) = nearest else {
            return Ok(None);
        };
        let texture = height.texture;
        let info = gpu
            .texture_info(texture)
            .ok_or_else(|| AppError::Readback("height atlas was destroyed".into()))?;
        if info.format != TextureFormat::Rgba32Float {
            return Err(AppError::Readback(format!("unexpected height format {:?}", info.format)));
        }
        let layer = height.layer.unwrap_or(0);
        let bytes = read_texture(
            gpu,
            &TextureRegion::full(texture, layer, info.width, info.height),
            info.format.bytes_per_texel(),
        )?;
        let heights: Vec<f32> = decode_rgba32f(&bytes).iter().map(|t| t[0]).collect();
        let (lo, hi) = heights
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &h| (lo.min(h), hi.max(h)));
        let range = (hi - lo).max(1e-3);
        let pixels = heights
            .iter()
            .map(|h| (((h - lo) / range).clamp(0.0, 1.0) * 255.0).round() as u8)
            .collect();
        Ok(GrayImage::from_raw(info.width, info.height, pixels))
    }

    /// Release every GPU resource the renderer owns.
    pub fn shutdown(&mut self, gpu: &mut dyn GpuBackend) {
        self.features.destroy(gpu);
        self.terrain.destroy(gpu);
        self.streaming.shutdown(gpu);
        gpu.destroy_texture(self.color);
        gpu.destroy_texture(self.depth);
        info!("Planet renderer shut down after {} frames", self.frame);
    }
}

/// Returns the number of generation failures among `events`.
fn log_events(events: &[StreamingEvent]) -> usize {
    let mut failures = 0;
    for event in events {
        match event {
            StreamingEvent::LodChanged { coord, previous, lod, .. } => {
                debug!("Chunk {coord:?} LOD {previous:?} -> {lod}");
            }
            StreamingEvent::GenerationFailed { key, error } => {
                warn!("Atlas {key} gave up: {error}");
                failures += 1;
            }
            StreamingEvent::ChunkActivated { .. } | StreamingEvent::ChunkReleased { .. } => {}
        }
    }
    failures
}

/// Copy one texture region into a staging buffer and wait for it. Only used
/// outside the frame loop.
fn read_texture(gpu: &mut dyn GpuBackend, region: &TextureRegion, bytes_per_texel: u32) -> Result<Vec<u8>, AppError> {
    let row_bytes = region.width * bytes_per_texel;
    let padded = padded_bytes_per_row(region.width, bytes_per_texel);
    let staging = gpu.create_buffer(
        "readback staging",
        u64::from(padded) * u64::from(region.height),
        BufferUsage::READBACK,
    )?;
    let result = copy_and_wait(gpu, region, staging, padded, row_bytes);
    gpu.destroy_buffer(staging);
    result
}

fn copy_and_wait(
    gpu: &mut dyn GpuBackend,
    region: &TextureRegion,
    staging: BufferHandle,
    padded: u32,
    row_bytes: u32,
) -> Result<Vec<u8>, AppError> {
    gpu.copy_texture_to_buffer(region, staging, padded)?;
    let token = gpu.read_buffer(staging)?;
    gpu.submit();
    for _ in 0..READBACK_ATTEMPTS {
        gpu.poll();
        match gpu.poll_readback(token) {
            ReadbackStatus::Ready(data) => return Ok(unpad_rows(&data, row_bytes, padded, region.height)),
            ReadbackStatus::Failed(reason) => return Err(AppError::Readback(reason)),
            ReadbackStatus::Pending => std::thread::sleep(Duration::from_millis(1)),
        }
    }
    Err(AppError::Readback("timed out waiting for the GPU".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nebula_render::SoftwareBackend;

    fn small_config() -> Config {
        let mut config = Config::default();
        config.streaming.base_texture_size = 64;
        config.streaming.stream_radius = 200.0;
        config.render.width = 16;
        config.render.height = 8;
        config
    }

    fn run(gpu: &mut SoftwareBackend, renderer: &mut PlanetRenderer, path: &CameraPath, frames: u64) {
        for frame in 0..frames {
            let camera = path.camera(frame, 1.0, 2.0);
            renderer.render_frame(gpu, &camera).unwrap();
        }
    }

    /// The planar path moves in a straight line at constant height.
    #[test]
    fn test_planar_camera_path() {
        let path = CameraPath::straight(&Config::default());
        let a = path.position(0);
        let b = path.position(100);
        assert!((a.y - b.y).abs() < 1e-4);
        assert!((b - a - path.velocity * 100.0).length() < 1e-2);
        let camera = path.camera(5, 1.0, 1.5);
        assert!(camera.forward.y < 0.0, "camera should look slightly down");
        assert!(camera.forward.x > 0.0);
        assert!((camera.forward.length() - 1.0).abs() < 1e-5);
    }

    /// On a sphere the path keeps its distance from the center and the
    /// camera's up follows the surface normal.
    #[test]
    fn test_spherical_camera_path() {
        let mut config = Config::default();
        config.streaming.spherical = true;
        let path = CameraPath::straight(&config);
        let r0 = path.position(0).length();
        let p = path.position(500);
        assert!((p.length() - r0).abs() / r0 < 1e-5);
        let camera = path.camera(500, 1.0, 1.0);
        assert!((camera.up - p.normalize()).length() < 1e-4);
        assert!(camera.forward.dot(camera.up) < 0.0);
    }

    /// Frames stream chunks and draw terrain, then features, then the sky
    /// in a single pass.
    #[test]
    fn test_frame_draw_order() {
        let mut gpu = SoftwareBackend::new();
        let config = small_config();
        let mut renderer = PlanetRenderer::new(&mut gpu, &config).unwrap();
        let path = CameraPath::straight(&config);
        run(&mut gpu, &mut renderer, &path, 40);

        assert_eq!(renderer.frame(), 40);
        let report = renderer.last_report();
        assert_eq!(report.frame, 39);
        assert!(report.chunks_drawn > 0, "no chunks drawn after 40 frames");
        assert!(renderer.atmosphere().lut_ready());

        let pass = gpu.passes().last().unwrap();
        assert_eq!(pass.label, "planet");
        let order: Vec<&str> = pass.draws.iter().map(|d| d.pipeline.as_str()).collect();
        assert_eq!(order.last(), Some(&"sky"));
        let first_feature = order.iter().position(|p| *p == "features").unwrap_or(order.len() - 1);
        assert!(order[..first_feature].iter().all(|p| *p == "terrain"));
        assert!(order[first_feature..order.len() - 1].iter().all(|p| *p == "features"));
        assert_eq!(order.iter().filter(|p| **p == "terrain").count(), report.chunks_drawn);
    }

    /// Residency is refreshed only on the configured interval.
    #[test]
    fn test_residency_cadence() {
        let mut gpu = SoftwareBackend::new();
        let config = small_config();
        let mut renderer = PlanetRenderer::new(&mut gpu, &config).unwrap();
        let interval = u64::from(config.streaming.update_frame_interval);
        assert_eq!(renderer.scheduler.due_names(0)[0], "residency");
        assert!(!renderer.scheduler.due_names(1).contains(&"residency"));
        assert!(renderer.scheduler.due_names(interval).contains(&"residency"));

        let path = CameraPath::straight(&config);
        renderer.render_frame(&mut gpu, &path.camera(0, 1.0, 2.0)).unwrap();
        let active = renderer.streaming().len();
        assert!(active > 0);
    }

    /// Readback yields an image of the target size and a height preview
    /// once a chunk is resident.
    #[test]
    fn test_captures() {
        let mut gpu = SoftwareBackend::new();
        let config = small_config();
        let mut renderer = PlanetRenderer::new(&mut gpu, &config).unwrap();
        let path = CameraPath::straight(&config);
        run(&mut gpu, &mut renderer, &path, 30);

        let color = renderer.capture_color(&mut gpu).unwrap();
        assert_eq!(color.dimensions(), (16, 8));
        let preview = renderer.capture_height_preview(&mut gpu).unwrap().unwrap();
        let side = LodAtlasConfig::from_streaming(&config.streaming)
            .unwrap()
            .texture_extent(AtlasKind::Height, 0);
        assert!(preview.width() > 0 && preview.width() <= side);
        assert!(preview.pixels().any(|p| p.0[0] == 255), "preview should span the full range");
    }

    /// The JSON dump carries environment and streaming state.
    #[test]
    fn test_state_json() {
        let mut gpu = SoftwareBackend::new();
        let config = small_config();
        let mut renderer = PlanetRenderer::new(&mut gpu, &config).unwrap();
        let path = CameraPath::straight(&config);
        run(&mut gpu, &mut renderer, &path, 3);
        let json: serde_json::Value = serde_json::from_str(&renderer.state_json().unwrap()).unwrap();
        assert_eq!(json["frame"], 3);
        assert!(json["environment"]["time_of_day"].is_number());
        assert!(json["streaming"]["active_chunks"].as_u64().unwrap() > 0);
        assert_eq!(json["last_frame"]["frame"], 2);
    }

    /// Shutdown releases the streamed textures and the targets.
    #[test]
    fn test_shutdown_releases_textures() {
        let mut gpu = SoftwareBackend::new();
        let config = small_config();
        let before = gpu.live_texture_count();
        let mut renderer = PlanetRenderer::new(&mut gpu, &config).unwrap();
        let path = CameraPath::straight(&config);
        run(&mut gpu, &mut renderer, &path, 20);
        assert!(gpu.live_texture_count() > before);
        renderer.shutdown(&mut gpu);
        assert!(renderer.streaming().is_empty());
        assert!(gpu.texture_label(renderer.color_target()).is_none());
    }
}
