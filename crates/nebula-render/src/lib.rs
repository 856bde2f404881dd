//! GPU backend capability layer: the narrow interface the terrain, atmosphere
//! and feature pipelines use to allocate resources, dispatch compute, draw,
//! and read data back.
//!
//! Two implementations ship with the crate: [`WgpuBackend`] drives a real
//! device, [`SoftwareBackend`] keeps everything in memory and is used for
//! headless runs and tests.

pub mod arena;
pub mod backend;
pub mod camera;
pub mod error;
pub mod frustum;
pub mod gpu;
pub mod readback;
pub mod shader;
pub mod software;
pub mod wgpu_backend;

pub use arena::SlotArena;
pub use backend::{
    AddressMode, ApiName, BackendCapabilities, BindGroupHandle, BindingResource, BindingType,
    BlendMode, BufferHandle, BufferUsage, CompareFn, ComputePipelineDesc, DepthState, DrawCall,
    FilterMode, GpuBackend, IndexFormat, PassDesc, PipelineHandle, ReadbackStatus, ReadbackToken,
    RenderPipelineDesc, SamplerDesc, SamplerHandle, SubmissionId, SubmissionStatus, TextureDesc,
    TextureFormat, TextureHandle, TextureInfo, TextureRegion, TextureUsage, VertexAttribute,
    VertexFormat, VertexLayout, VertexStep,
};
pub use camera::Camera;
pub use error::{BackendError, PipelineError};
pub use frustum::{Aabb, Frustum};
pub use gpu::{GpuContext, RenderContextError};
pub use readback::{padded_bytes_per_row, unpad_rows};
pub use shader::{ShaderError, ShaderLibrary, compose_wgsl};
pub use software::SoftwareBackend;
pub use wgpu_backend::WgpuBackend;
