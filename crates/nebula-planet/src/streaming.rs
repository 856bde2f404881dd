//! Chunk streaming and LOD around a moving camera.
//!
//! Active chunks live in a slot arena addressed by [`ChunkId`]. Every frame
//! the manager settles finished atlas builds, recomputes each chunk's target
//! LOD with hysteresis, queues the missing atlas slots nearest first, and
//! shows each chunk at the finest resident LOD at or above its target.
//! Which chunks are active at all is decided by
//! [`StreamingManager::refresh_residency`], which the frame scheduler runs
//! every `update_frame_interval` frames.

use std::collections::{HashMap, HashSet};
use std::fmt;

use glam::{DVec2, DVec3};
use nebula_config::StreamingConfig;
use nebula_cubesphere::{CubeFace, FacePoint, PlanetSurface};
use nebula_lod::{
    AtlasKey, AtlasKind, LodAtlasConfig, LodTexture, RequestPriority, RequestQueue, TextureCache,
};
use nebula_render::{GpuBackend, PipelineError, SlotArena};
use nebula_terrain::{AtlasGenerator, GenerationEvent, RequestOutcome};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::StreamingError;

/// Index of an active chunk in the streaming arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChunkId(u32);

impl ChunkId {
    #[must_use]
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Chunk grid position; `face` is `None` in planar mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChunkCoord {
    pub face: Option<CubeFace>,
    pub x: i32,
    pub y: i32,
}

impl ChunkCoord {
    #[must_use]
    pub fn planar(x: i32, y: i32) -> Self {
        Self { face: None, x, y }
    }

    #[must_use]
    pub fn on_face(face: CubeFace, x: i32, y: i32) -> Self {
        Self {
            face: Some(face),
            x,
            y,
        }
    }
}

impl fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.face {
            Some(face) => write!(f, "{face:?}/{},{}", self.x, self.y),
            None => write!(f, "{},{}", self.x, self.y),
        }
    }
}

/// How world positions map onto the chunk grid.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StreamingDomain {
    /// World `(x, z)` is the grid `(x, y)`; `y` is up.
    Planar,
    /// Cube-sphere centred at the origin.
    Spherical(PlanetSurface),
}

impl StreamingDomain {
    #[must_use]
    pub fn is_spherical(&self) -> bool {
        matches!(self, Self::Spherical(_))
    }
}

/// Camera inputs for one streaming step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraView {
    pub position: DVec3,
    pub forward: DVec3,
}

impl CameraView {
    #[must_use]
    pub fn new(position: DVec3, forward: DVec3) -> Self {
        Self { position, forward }
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if self.position.is_finite() && self.forward.is_finite() {
            Ok(())
        } else {
            Err(PipelineError::InvalidCoordinate {
                x: self.position.x,
                y: self.position.z,
            })
        }
    }
}

/// Atlas textures a displayed chunk samples, one per kind.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ChunkTextures {
    slots: [Option<LodTexture>; 5],
}

impl ChunkTextures {
    fn slot(kind: AtlasKind) -> usize {
        match kind {
            AtlasKind::Height => 0,
            AtlasKind::Normal => 1,
            AtlasKind::Tile => 2,
            AtlasKind::Macro => 3,
            AtlasKind::Splat => 4,
        }
    }

    #[must_use]
    pub fn get(&self, kind: AtlasKind) -> Option<&LodTexture> {
        self.slots[Self::slot(kind)].as_ref()
    }

    fn set(&mut self, kind: AtlasKind, texture: Option<LodTexture>) {
        self.slots[Self::slot(kind)] = texture;
    }

    /// Height and tile are both present.
    #[must_use]
    pub fn is_drawable(&self) -> bool {
        AtlasKind::REQUIRED.iter().all(|&k| self.get(k).is_some())
    }
}

/// One chunk in the active set.
#[derive(Clone, Debug)]
pub struct ActiveChunk {
    pub coord: ChunkCoord,
    /// Grid-space centre in meters (face-local on a sphere).
    pub center_m: (f64, f64),
    /// World-space centre on the surface (`y = 0` in planar mode).
    pub center: DVec3,
    /// Distance from the camera used for LOD selection.
    pub distance: f64,
    pub target_lod: u8,
    /// LOD currently drawn; `None` until any level is resident.
    pub display_lod: Option<u8>,
    pub textures: ChunkTextures,
    /// Frame the chunk left the required set, if it has.
    pub outside_since: Option<u64>,
}

impl ActiveChunk {
    #[must_use]
    pub fn is_pending_release(&self) -> bool {
        self.outside_since.is_some()
    }
}

/// Changes other subsystems (meshes, features) react to.
#[derive(Debug)]
pub enum StreamingEvent {
    ChunkActivated {
        id: ChunkId,
        coord: ChunkCoord,
    },
    /// The drawn LOD changed; meshes swap index strips, features rescale
    /// their render distance.
    LodChanged {
        id: ChunkId,
        coord: ChunkCoord,
        previous: Option<u8>,
        lod: u8,
    },
    ChunkReleased {
        id: ChunkId,
        coord: ChunkCoord,
    },
    /// A slot exhausted its retries; chunks stay at a coarser LOD.
    GenerationFailed {
        key: AtlasKey,
        error: PipelineError,
    },
}

/// Per-frame counters, serialisable for debug dumps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct StreamingStats {
    pub frame: u64,
    pub active_chunks: usize,
    pub displayed_chunks: usize,
    pub blank_chunks: usize,
    pub queued_requests: usize,
    pub submitted_this_frame: usize,
    pub in_flight: usize,
    pub resident_bytes: u64,
    pub budget_bytes: u64,
    pub evicted_this_frame: usize,
    pub evictions_total: u64,
    pub generations_completed: u64,
    pub failed_attempts: u64,
    pub budget_exceeded: bool,
}

impl StreamingStats {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Streaming tunables lifted from [`StreamingConfig`].
#[derive(Clone, Copy, Debug, PartialEq)]
struct StreamingLimits {
    stream_radius: f64,
    max_generations_per_frame: usize,
    eviction_grace_frames: u64,
    progressive_refinement: bool,
}

/// Owns the active chunk set, the atlas generator and the texture cache.
pub struct StreamingManager {
    cfg: LodAtlasConfig,
    domain: StreamingDomain,
    limits: StreamingLimits,
    generator: AtlasGenerator,
    cache: TextureCache,
    queue: RequestQueue<AtlasKey>,
    chunks: SlotArena<ActiveChunk>,
    index: HashMap<ChunkCoord, ChunkId>,
    stats: StreamingStats,
}

impl StreamingManager {
    pub fn new(settings: &StreamingConfig, generator: AtlasGenerator, domain: StreamingDomain) -> Self {
        let cfg = generator.config().clone();
        info!(
            "Streaming {} chunks of {} m within {} m, {} LOD levels, budget {} MiB",
            if domain.is_spherical() { "spherical" } else { "planar" },
            cfg.base_chunk_size(),
            settings.stream_radius,
            cfg.max_lod_levels(),
            settings.texture_budget_bytes / (1024 * 1024)
        );
        Self {
            cfg,
            domain,
            limits: StreamingLimits {
                stream_radius: f64::from(settings.stream_radius),
                max_generations_per_frame: settings.max_generations_per_frame.max(1) as usize,
                eviction_grace_frames: settings.eviction_grace_frames,
                progressive_refinement: settings.progressive_refinement,
            },
            generator,
            cache: TextureCache::new(settings.texture_budget_bytes),
            queue: RequestQueue::new(),
            chunks: SlotArena::new(),
            index: HashMap::new(),
            stats: StreamingStats::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &LodAtlasConfig {
        &self.cfg
    }

    #[must_use]
    pub fn domain(&self) -> StreamingDomain {
        self.domain
    }

    #[must_use]
    pub fn generator(&self) -> &AtlasGenerator {
        &self.generator
    }

    #[must_use]
    pub fn cache(&self) -> &TextureCache {
        &self.cache
    }

    pub fn set_budget(&mut self, bytes: u64) {
        self.cache.set_budget(bytes);
    }

    #[must_use]
    pub fn stats(&self) -> StreamingStats {
        self.stats
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    #[must_use]
    pub fn chunk(&self, id: ChunkId) -> Option<&ActiveChunk> {
        self.chunks.get(id.0)
    }

    #[must_use]
    pub fn chunk_id(&self, coord: &ChunkCoord) -> Option<ChunkId> {
        self.index.get(coord).copied()
    }

    pub fn chunks(&self) -> impl Iterator<Item = (ChunkId, &ActiveChunk)> {
        self.chunks.iter().map(|(i, c)| (ChunkId(i), c))
    }

    /// Chunks with height and tile resident, ready to draw this frame.
    pub fn drawable(&self) -> impl Iterator<Item = (ChunkId, &ActiveChunk)> {
        self.chunks().filter(|(_, c)| c.textures.is_drawable())
    }

    /// Recompute the required chunk set: activate newly required chunks and
    /// start the grace period of chunks that left it.
    pub fn refresh_residency(&mut self, view: &CameraView, frame: u64) -> Vec<StreamingEvent> {
        if let Err(e) = view.validate() {
            warn!("Rejected camera for residency refresh: {e}");
            return Vec::new();
        }
        let required = self.required_set(view);
        let mut events = Vec::new();

        let mut coords: Vec<&ChunkCoord> = required.iter().collect();
        coords.sort();
        for coord in coords {
            if let Some(id) = self.index.get(coord) {
                if let Some(chunk) = self.chunks.get_mut(id.0) {
                    chunk.outside_since = None;
                }
                continue;
            }
            let (center_m, center) = self.placement(coord);
            let distance = self.distance_to(view, center);
            let target_lod = self.cfg.lod_for_distance(distance);
            let id = ChunkId(self.chunks.insert(ActiveChunk {
                coord: *coord,
                center_m,
                center,
                distance,
                target_lod,
                display_lod: None,
                textures: ChunkTextures::default(),
                outside_since: None,
            }));
            self.index.insert(*coord, id);
            events.push(StreamingEvent::ChunkActivated { id, coord: *coord });
        }

        for (_, chunk) in self.chunks.iter_mut() {
            if chunk.outside_since.is_none() && !required.contains(&chunk.coord) {
                chunk.outside_since = Some(frame);
            }
        }
        if !events.is_empty() {
            debug!(
                "Activated {} chunks, {} active at frame {frame}",
                events.len(),
                self.chunks.len()
            );
        }
        events
    }

    /// Per-frame step: settle builds, release expired chunks, request
    /// missing atlases, refresh what every chunk displays, then let the cache
    /// enforce its budget. Textures the cache drops are destroyed on `gpu`.
    pub fn update(
        &mut self,
        gpu: &mut dyn GpuBackend,
        view: &CameraView,
        frame: u64,
    ) -> Result<Vec<StreamingEvent>, StreamingError> {
        if let Err(e) = view.validate() {
            warn!("Rejected camera for streaming update: {e}");
            return Ok(Vec::new());
        }
        let mut events = Vec::new();

        for event in self.generator.poll(gpu, &mut self.cache) {
            match event {
                GenerationEvent::Completed { key } => debug!("Atlas {key} resident"),
                GenerationEvent::Retrying { key, attempts, .. } => {
                    debug!("Atlas {key} will be requested again after {attempts} failures");
                }
                GenerationEvent::Failed { key, error } => {
                    events.push(StreamingEvent::GenerationFailed { key, error });
                }
            }
        }

        self.release_expired(frame, &mut events);
        self.queue_missing(view);
        let submitted = self.submit_requests(gpu)?;
        self.refresh_display(&mut events);

        let outcome = self.cache.tick(frame);
        for texture in &outcome.destroy {
            gpu.destroy_texture(*texture);
        }

        let generator = self.generator.stats();
        let displayed = self.chunks.iter().filter(|(_, c)| c.display_lod.is_some()).count();
        self.stats = StreamingStats {
            frame,
            active_chunks: self.chunks.len(),
            displayed_chunks: displayed,
            blank_chunks: self.chunks.len() - displayed,
            queued_requests: self.queue.len(),
            submitted_this_frame: submitted,
            in_flight: self.generator.in_flight_len(),
            resident_bytes: self.cache.resident_bytes(),
            budget_bytes: self.cache.budget(),
            evicted_this_frame: outcome.evicted.len(),
            evictions_total: self.cache.evictions_total(),
            generations_completed: generator.completed,
            failed_attempts: generator.failed_attempts,
            budget_exceeded: outcome.budget_exceeded.is_some(),
        };
        Ok(events)
    }

    /// Drop every chunk and texture, destroying them on `gpu`.
    pub fn shutdown(&mut self, gpu: &mut dyn GpuBackend) {
        self.generator.cancel_all(gpu, &mut self.cache);
        for texture in self.cache.clear() {
            gpu.destroy_texture(texture);
        }
        self.chunks = SlotArena::new();
        self.index.clear();
        self.queue.clear();
    }

    fn release_expired(&mut self, frame: u64, events: &mut Vec<StreamingEvent>) {
        let grace = self.limits.eviction_grace_frames;
        let expired: Vec<(u32, ChunkCoord)> = self
            .chunks
            .iter()
            .filter(|(_, c)| c.outside_since.is_some_and(|f| frame.saturating_sub(f) >= grace))
            .map(|(i, c)| (i, c.coord))
            .collect();
        for (index, coord) in expired {
            self.chunks.remove(index);
            self.index.remove(&coord);
            events.push(StreamingEvent::ChunkReleased {
                id: ChunkId(index),
                coord,
            });
        }
    }

    /// Recompute distances and targets, then rebuild the request queue from
    /// the slots still missing.
    fn queue_missing(&mut self, view: &CameraView) {
        let mut wanted: HashMap<AtlasKey, RequestPriority> = HashMap::new();
        let max_lod = self.cfg.max_lod_levels();

        let chunk_views: Vec<(u32, DVec3)> = self.chunks.iter().map(|(i, c)| (i, c.center)).collect();
        for (index, center) in chunk_views {
            let distance = self.distance_to(view, center);
            let angle = self.view_angle(view, center);
            let Some(chunk) = self.chunks.get_mut(index) else {
                continue;
            };
            chunk.distance = distance;
            chunk.target_lod = self
                .cfg
                .thresholds()
                .select_with_hysteresis(chunk.target_lod, distance);
            if chunk.display_lod == Some(chunk.target_lod) {
                continue;
            }

            let coord = chunk.coord;
            let target = chunk.target_lod;
            for lod in target..max_lod {
                let key = self.cfg.atlas_key_from_chunk(coord.x, coord.y, lod, coord.face);
                if self.slot_resident(&key) {
                    break;
                }
                if self.generator.is_exhausted(&key) {
                    continue;
                }
                if !self.generator.is_in_flight(&key) {
                    // Coarser fallbacks win over the fine slot at equal distance.
                    let priority = RequestPriority {
                        distance: distance / f64::from(1u32 << (lod - target)),
                        angle,
                    };
                    wanted
                        .entry(key)
                        .and_modify(|p| {
                            if priority.distance < p.distance {
                                *p = priority;
                            }
                        })
                        .or_insert(priority);
                }
                if !self.limits.progressive_refinement {
                    break;
                }
            }
        }

        self.queue.clear();
        let mut keys: Vec<(AtlasKey, RequestPriority)> = wanted.into_iter().collect();
        keys.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, priority) in keys {
            self.queue.push(key, priority);
        }
    }

    fn submit_requests(&mut self, gpu: &mut dyn GpuBackend) -> Result<usize, StreamingError> {
        let mut submitted = 0;
        while submitted < self.limits.max_generations_per_frame {
            let Some(key) = self.queue.pop() else {
                break;
            };
            match self.generator.request(gpu, &mut self.cache, key) {
                Ok(RequestOutcome::Submitted) => submitted += 1,
                Ok(RequestOutcome::AlreadyInFlight | RequestOutcome::Exhausted) => {}
                Err(e) => {
                    let e = e.into_pipeline();
                    if let PipelineError::BackendUnsupported { .. } = e {
                        return Err(e.into());
                    }
                    warn!("Atlas {key} could not be submitted: {e}");
                }
            }
        }
        Ok(submitted)
    }

    /// Point every chunk at the finest resident LOD at or above its target
    /// and pin what it displays.
    fn refresh_display(&mut self, events: &mut Vec<StreamingEvent>) {
        let Self {
            cfg, cache, chunks, ..
        } = self;
        for (index, chunk) in chunks.iter_mut() {
            let coord = chunk.coord;
            let resident = cache.finest_resident_lod(
                coord.x,
                coord.y,
                chunk.target_lod,
                coord.face,
                &AtlasKind::REQUIRED,
                cfg,
            );
            // A chunk already drawn keeps its level until something at or
            // finer than the new target arrives.
            let display = match (resident, chunk.display_lod) {
                (Some(lod), _) => Some(lod),
                (None, Some(old))
                    if AtlasKind::REQUIRED
                        .iter()
                        .all(|&k| cache.has_lod(coord.x, coord.y, k, old, coord.face, cfg)) =>
                {
                    Some(old)
                }
                (None, _) => None,
            };

            if display != chunk.display_lod {
                if let Some(lod) = display {
                    events.push(StreamingEvent::LodChanged {
                        id: ChunkId(index),
                        coord,
                        previous: chunk.display_lod,
                        lod,
                    });
                }
                chunk.display_lod = display;
            }

            chunk.textures = ChunkTextures::default();
            if let Some(lod) = display {
                for kind in AtlasKind::ALL {
                    let texture = cache.get_lod_for_chunk(coord.x, coord.y, kind, lod, coord.face, cfg);
                    chunk.textures.set(kind, texture);
                }
                cache.pin(&cfg.atlas_key_from_chunk(coord.x, coord.y, lod, coord.face));
            }
        }
    }

    fn slot_resident(&self, key: &AtlasKey) -> bool {
        AtlasKind::REQUIRED.iter().all(|&k| self.cache.contains(key, k))
    }

    fn required_set(&self, view: &CameraView) -> HashSet<ChunkCoord> {
        match self.domain {
            StreamingDomain::Planar => self.required_planar(view),
            StreamingDomain::Spherical(surface) => self.required_spherical(view, &surface),
        }
    }

    /// Chunks whose square comes within the stream radius of the camera.
    fn required_planar(&self, view: &CameraView) -> HashSet<ChunkCoord> {
        let r = self.limits.stream_radius;
        let size = f64::from(self.cfg.base_chunk_size());
        let (px, pz) = (view.position.x, view.position.z);
        let mut out = HashSet::new();
        let (Ok((x0, y0)), Ok((x1, y1))) = (
            self.cfg.chunk_coords(px - r, pz - r),
            self.cfg.chunk_coords(px + r, pz + r),
        ) else {
            return out;
        };
        for y in y0..=y1 {
            for x in x0..=x1 {
                let (ox, oy) = self.cfg.chunk_origin(x, y);
                let dx = (ox - px).max(px - (ox + size)).max(0.0);
                let dy = (oy - pz).max(pz - (oy + size)).max(0.0);
                if dx.hypot(dy) <= r {
                    out.insert(ChunkCoord::planar(x, y));
                }
            }
        }
        out
    }

    /// Chunks around the camera's face point. Cells past a face edge are
    /// re-projected onto the neighbouring face; membership uses the arc
    /// distance to the chunk centre padded by half a chunk diagonal.
    fn required_spherical(&self, view: &CameraView, surface: &PlanetSurface) -> HashSet<ChunkCoord> {
        let r = self.limits.stream_radius;
        let size = f64::from(self.cfg.base_chunk_size());
        let face_size = surface.face_size_m();
        let per_face = (face_size / size).ceil() as i32;
        let reach = (r / size).ceil() as i32 + 1;
        let pad = size * std::f64::consts::FRAC_1_SQRT_2;

        let cam = surface.to_face_point(view.position);
        let cx = (cam.x_m / size).floor() as i32;
        let cy = (cam.y_m / size).floor() as i32;
        let on_face = |v: i32| (0..per_face).contains(&v);

        let mut out = HashSet::new();
        for y in cy - reach..=cy + reach {
            for x in cx - reach..=cx + reach {
                let coord = if on_face(x) && on_face(y) {
                    ChunkCoord::on_face(cam.face, x, y)
                } else {
                    let u = (f64::from(x) + 0.5) * size / face_size;
                    let v = (f64::from(y) + 0.5) * size / face_size;
                    let dir = (cam.face.normal()
                        + (2.0 * u - 1.0) * cam.face.tangent()
                        + (2.0 * v - 1.0) * cam.face.bitangent())
                    .normalize();
                    let p = surface.to_face_point(dir);
                    ChunkCoord::on_face(
                        p.face,
                        ((p.x_m / size).floor() as i32).clamp(0, per_face - 1),
                        ((p.y_m / size).floor() as i32).clamp(0, per_face - 1),
                    )
                };
                let (_, center) = self.placement(&coord);
                if surface.arc_distance(view.position, center) - pad <= r {
                    out.insert(coord);
                }
            }
        }
        out
    }

    fn placement(&self, coord: &ChunkCoord) -> ((f64, f64), DVec3) {
        let (mx, my) = self.cfg.chunk_center(coord.x, coord.y);
        let world = match (self.domain, coord.face) {
            (StreamingDomain::Spherical(surface), Some(face)) => surface.to_world(&FacePoint {
                face,
                x_m: mx,
                y_m: my,
            }),
            _ => DVec3::new(mx, 0.0, my),
        };
        ((mx, my), world)
    }

    fn distance_to(&self, view: &CameraView, center: DVec3) -> f64 {
        match self.domain {
            StreamingDomain::Planar => {
                DVec2::new(center.x - view.position.x, center.z - view.position.z).length()
            }
            StreamingDomain::Spherical(surface) => surface.arc_distance(view.position, center),
        }
    }

    fn view_angle(&self, view: &CameraView, center: DVec3) -> f32 {
        let (forward, to) = match self.domain {
            StreamingDomain::Planar => (
                DVec3::new(view.forward.x, 0.0, view.forward.z),
                DVec3::new(center.x - view.position.x, 0.0, center.z - view.position.z),
            ),
            StreamingDomain::Spherical(_) => (view.forward, center - view.position),
        };
        if forward.length_squared() < 1e-12 || to.length_squared() < 1e-12 {
            return 0.0;
        }
        forward.angle_between(to) as f32
    }
}
