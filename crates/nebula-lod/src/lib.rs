//! Level-of-detail atlas management: the atlas coordinate system, distance
//! based LOD selection with hysteresis, the request priority queue, and the
//! budgeted texture cache.

mod atlas;
mod error;
mod priority_queue;
mod selector;
mod texture_cache;

pub use atlas::{AtlasBounds, AtlasKey, AtlasKind, LodAtlasConfig, UvTransform};
pub use error::LodError;
pub use priority_queue::{RequestPriority, RequestQueue};
pub use selector::{LodThresholds, REFINE_HYSTERESIS};
pub use texture_cache::{
    AtlasSlotId, LodTexture, PoolKey, TextureCache, TextureRef, TickOutcome,
};
