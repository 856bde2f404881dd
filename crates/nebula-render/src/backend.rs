//! The GPU backend capability contract.
//!
//! Resources are addressed through small copyable handles owned by the
//! backend. All calls happen on the render thread, and commands execute in
//! the order they were issued: a `write_buffer` issued after a dispatch is
//! not visible to that dispatch.

use crate::error::BackendError;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);

        impl $name {
            /// Raw slot index.
            pub fn index(self) -> u32 {
                self.0
            }

            /// Wrap a raw slot index. Only backends should mint handles.
            pub fn from_index(index: u32) -> Self {
                Self(index)
            }
        }
    };
}

handle!(
    /// A 2D texture or 2D texture array.
    TextureHandle
);
handle!(
    /// A GPU buffer.
    BufferHandle
);
handle!(
    /// A compute or render pipeline together with its bind group layouts.
    PipelineHandle
);
handle!(
    /// A bind group created against one of a pipeline's layouts.
    BindGroupHandle
);
handle!(
    /// A texture sampler.
    SamplerHandle
);
handle!(
    /// Token for an asynchronous buffer readback.
    ReadbackToken
);

/// Monotonic id of a queue submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubmissionId(pub u64);

/// Which shading API the backend drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ApiName {
    WebGpu,
    WebGl2,
    Native,
}

/// Optional features. Consumers adapt to what is advertised.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub compute: bool,
    pub storage_textures: bool,
    pub texture_arrays: bool,
    pub float32_filterable: bool,
    pub max_texture_size: u32,
}

impl BackendCapabilities {
    /// Everything a desktop WebGPU-class device offers.
    pub const FULL: Self = Self {
        compute: true,
        storage_textures: true,
        texture_arrays: true,
        float32_filterable: false,
        max_texture_size: 8192,
    };

    /// The WebGL2-class intersection: no compute, no storage textures.
    pub const RASTER_ONLY: Self = Self {
        compute: false,
        storage_textures: false,
        texture_arrays: true,
        float32_filterable: false,
        max_texture_size: 4096,
    };

    /// True when atlases can be generated with compute shaders.
    pub fn supports_compute_generation(&self) -> bool {
        self.compute && self.storage_textures
    }
}

/// Texel formats used by the pipelines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba16Float,
    Rgba32Float,
    R8Unorm,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Depth32Float,
}

impl TextureFormat {
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            TextureFormat::Rgba16Float => 8,
            TextureFormat::Rgba32Float => 16,
            TextureFormat::R8Unorm => 1,
            TextureFormat::Rgba8Unorm | TextureFormat::Rgba8UnormSrgb => 4,
            TextureFormat::Depth32Float => 4,
        }
    }

    /// Whether linear filtering is allowed without optional features.
    pub fn is_filterable(self) -> bool {
        !matches!(self, TextureFormat::Rgba32Float | TextureFormat::Depth32Float)
    }
}

/// How a texture may be used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct TextureUsage {
    pub sampled: bool,
    pub storage: bool,
    pub render_target: bool,
    pub copy_src: bool,
    pub copy_dst: bool,
}

impl TextureUsage {
    /// Generated atlas: written by compute or upload, sampled, read back.
    pub const ATLAS: Self = Self {
        sampled: true,
        storage: true,
        render_target: false,
        copy_src: true,
        copy_dst: true,
    };

    /// Uploaded from the CPU and sampled.
    pub const UPLOAD: Self = Self {
        sampled: true,
        storage: false,
        render_target: false,
        copy_src: true,
        copy_dst: true,
    };

    /// Offscreen color or depth target.
    pub const TARGET: Self = Self {
        sampled: false,
        storage: false,
        render_target: true,
        copy_src: true,
        copy_dst: false,
    };
}

/// Texture creation parameters.
#[derive(Clone, Copy, Debug)]
pub struct TextureDesc<'a> {
    pub label: &'a str,
    pub width: u32,
    pub height: u32,
    /// `1` for a plain 2D texture, `> 1` for a 2D array.
    pub layers: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl TextureDesc<'_> {
    /// Bytes occupied by all layers.
    pub fn size_bytes(&self) -> u64 {
        u64::from(self.width)
            * u64::from(self.height)
            * u64::from(self.layers.max(1))
            * u64::from(self.format.bytes_per_texel())
    }
}

/// Dimensions and format of a live texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureInfo {
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub format: TextureFormat,
}

/// A rectangle in one layer of a texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureRegion {
    pub texture: TextureHandle,
    pub layer: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl TextureRegion {
    /// The full extent of layer `layer` of a `width × height` texture.
    pub fn full(texture: TextureHandle, layer: u32, width: u32, height: u32) -> Self {
        Self {
            texture,
            layer,
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}

/// How a buffer may be used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct BufferUsage {
    pub uniform: bool,
    pub storage: bool,
    pub vertex: bool,
    pub index: bool,
    pub copy_dst: bool,
    pub map_read: bool,
}

impl BufferUsage {
    pub const UNIFORM: Self = Self {
        uniform: true,
        storage: false,
        vertex: false,
        index: false,
        copy_dst: true,
        map_read: false,
    };

    pub const VERTEX: Self = Self {
        uniform: false,
        storage: false,
        vertex: true,
        index: false,
        copy_dst: true,
        map_read: false,
    };

    pub const INDEX: Self = Self {
        uniform: false,
        storage: false,
        vertex: false,
        index: true,
        copy_dst: true,
        map_read: false,
    };

    /// Staging buffer for texture readback.
    pub const READBACK: Self = Self {
        uniform: false,
        storage: false,
        vertex: false,
        index: false,
        copy_dst: true,
        map_read: true,
    };
}

/// One entry of a bind group layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindingType {
    UniformBuffer,
    StorageBuffer { read_only: bool },
    /// Sampled float texture; `array` selects a 2D-array view.
    Texture { filterable: bool, array: bool },
    /// Write-only storage texture (compute only).
    StorageTexture { format: TextureFormat },
    Sampler { filtering: bool },
}

/// A resource bound at one binding slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingResource {
    Buffer(BufferHandle),
    /// Sampled view; `layer` selects one layer of an array as a 2D view.
    Texture {
        texture: TextureHandle,
        layer: Option<u32>,
    },
    StorageTexture {
        texture: TextureHandle,
        layer: Option<u32>,
    },
    Sampler(SamplerHandle),
}

/// Compute pipeline parameters.
#[derive(Clone, Copy, Debug)]
pub struct ComputePipelineDesc<'a> {
    pub label: &'a str,
    /// WGSL source.
    pub shader: &'a str,
    pub entry_point: &'a str,
    pub bind_group_layouts: &'a [&'a [BindingType]],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float32x2,
    Float32x3,
    Float32x4,
    Uint32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub format: VertexFormat,
    pub offset: u64,
    pub location: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VertexStep {
    Vertex,
    Instance,
}

#[derive(Clone, Copy, Debug)]
pub struct VertexLayout<'a> {
    pub stride: u64,
    pub step: VertexStep,
    pub attributes: &'a [VertexAttribute],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompareFn {
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Always,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DepthState {
    pub format: TextureFormat,
    pub write: bool,
    pub compare: CompareFn,
}

impl DepthState {
    /// Reverse-Z depth test with writes.
    pub const REVERSE_Z: Self = Self {
        format: TextureFormat::Depth32Float,
        write: true,
        compare: CompareFn::GreaterEqual,
    };

    /// Reverse-Z test without writes (sky, transparent features).
    pub const REVERSE_Z_READ_ONLY: Self = Self {
        format: TextureFormat::Depth32Float,
        write: false,
        compare: CompareFn::GreaterEqual,
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlendMode {
    Opaque,
    Alpha,
    PremultipliedAlpha,
}

/// Render pipeline parameters.
#[derive(Clone, Copy, Debug)]
pub struct RenderPipelineDesc<'a> {
    pub label: &'a str,
    /// WGSL source holding both entry points.
    pub shader: &'a str,
    pub vs_entry: &'a str,
    pub fs_entry: &'a str,
    pub vertex_layouts: &'a [VertexLayout<'a>],
    pub bind_group_layouts: &'a [&'a [BindingType]],
    pub color_format: TextureFormat,
    pub depth: Option<DepthState>,
    pub blend: BlendMode,
    pub cull_back_faces: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Nearest,
    Linear,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressMode {
    ClampToEdge,
    Repeat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    pub filter: FilterMode,
    pub address: AddressMode,
}

/// A render pass over one color target and an optional depth target.
#[derive(Clone, Copy, Debug)]
pub struct PassDesc<'a> {
    pub label: &'a str,
    pub color: TextureHandle,
    pub depth: Option<TextureHandle>,
    /// `None` loads the existing contents.
    pub clear_color: Option<[f64; 4]>,
    pub clear_depth: Option<f32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U16,
    U32,
}

/// One draw inside a pass. `count` is the index count when an index buffer
/// is bound, otherwise the vertex count.
#[derive(Clone, Copy, Debug)]
pub struct DrawCall<'a> {
    pub pipeline: PipelineHandle,
    pub bind_groups: &'a [BindGroupHandle],
    pub vertex_buffers: &'a [BufferHandle],
    pub index_buffer: Option<(BufferHandle, IndexFormat)>,
    pub count: u32,
    pub instance_count: u32,
}

/// Completion state of a submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmissionStatus {
    Pending,
    Complete,
    Failed(String),
}

/// Completion state of a buffer readback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadbackStatus {
    Pending,
    Ready(Vec<u8>),
    Failed(String),
}

/// The capability set the core consumes.
pub trait GpuBackend {
    fn api_name(&self) -> ApiName;

    fn capabilities(&self) -> BackendCapabilities;

    /// Create a sampled (and optionally storage) 2D texture or array.
    fn create_texture_2d(&mut self, desc: &TextureDesc<'_>) -> Result<TextureHandle, BackendError>;

    /// Create a compute-writable texture. Fails with
    /// [`BackendError::Unsupported`] when storage textures are missing.
    fn create_storage_texture(
        &mut self,
        label: &str,
        width: u32,
        height: u32,
        format: TextureFormat,
        layers: u32,
    ) -> Result<TextureHandle, BackendError> {
        if !self.capabilities().storage_textures {
            return Err(BackendError::Unsupported("storage textures"));
        }
        self.create_texture_2d(&TextureDesc {
            label,
            width,
            height,
            layers,
            format,
            usage: TextureUsage::ATLAS,
        })
    }

    fn texture_info(&self, texture: TextureHandle) -> Option<TextureInfo>;

    /// Upload tightly packed texel rows into a region.
    fn write_texture(
        &mut self,
        region: &TextureRegion,
        data: &[u8],
        bytes_per_row: u32,
    ) -> Result<(), BackendError>;

    fn destroy_texture(&mut self, texture: TextureHandle);

    fn create_buffer(
        &mut self,
        label: &str,
        size: u64,
        usage: BufferUsage,
    ) -> Result<BufferHandle, BackendError>;

    fn write_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError>;

    fn destroy_buffer(&mut self, buffer: BufferHandle);

    /// Start mapping `buffer` for reading. Completes after the work that
    /// writes it has executed; poll with [`GpuBackend::poll_readback`].
    fn read_buffer(&mut self, buffer: BufferHandle) -> Result<ReadbackToken, BackendError>;

    /// Non-blocking readback query. `Ready` and `Failed` are returned once.
    fn poll_readback(&mut self, token: ReadbackToken) -> ReadbackStatus;

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerHandle, BackendError>;

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDesc<'_>,
    ) -> Result<PipelineHandle, BackendError>;

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDesc<'_>,
    ) -> Result<PipelineHandle, BackendError>;

    /// Create a bind group for layout `group` of `pipeline`. Entries are
    /// bound to bindings `0..entries.len()`.
    fn create_bind_group(
        &mut self,
        pipeline: PipelineHandle,
        group: u32,
        entries: &[BindingResource],
    ) -> Result<BindGroupHandle, BackendError>;

    fn destroy_bind_group(&mut self, bind_group: BindGroupHandle);

    fn dispatch_compute(
        &mut self,
        pipeline: PipelineHandle,
        bind_groups: &[BindGroupHandle],
        groups: [u32; 3],
    ) -> Result<(), BackendError>;

    fn begin_pass(&mut self, desc: &PassDesc<'_>) -> Result<(), BackendError>;

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), BackendError>;

    fn end_pass(&mut self) -> Result<(), BackendError>;

    /// Copy a texture region into `buffer` with the given row pitch
    /// (a multiple of 256 on GPU backends).
    fn copy_texture_to_buffer(
        &mut self,
        region: &TextureRegion,
        buffer: BufferHandle,
        bytes_per_row: u32,
    ) -> Result<(), BackendError>;

    fn copy_texture_to_texture(
        &mut self,
        src: &TextureRegion,
        dst: TextureHandle,
        dst_layer: u32,
        dst_origin: [u32; 2],
    ) -> Result<(), BackendError>;

    /// Submit all recorded work.
    fn submit(&mut self) -> SubmissionId;

    fn submission_status(&mut self, id: SubmissionId) -> SubmissionStatus;

    /// Drive callbacks without blocking.
    fn poll(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Texture byte sizes account for layers and texel size.
    #[test]
    fn test_texture_desc_size_bytes() {
        let desc = TextureDesc {
            label: "t",
            width: 1024,
            height: 1024,
            layers: 1,
            format: TextureFormat::Rgba32Float,
            usage: TextureUsage::ATLAS,
        };
        assert_eq!(desc.size_bytes(), 16 * 1024 * 1024);
        let array = TextureDesc { layers: 4, ..desc };
        assert_eq!(array.size_bytes(), 64 * 1024 * 1024);
    }

    /// Float32 formats are not filterable by default.
    #[test]
    fn test_filterable_formats() {
        assert!(!TextureFormat::Rgba32Float.is_filterable());
        assert!(TextureFormat::Rgba16Float.is_filterable());
    }

    /// Raster-only backends cannot generate atlases on the GPU.
    #[test]
    fn test_capability_presets() {
        assert!(BackendCapabilities::FULL.supports_compute_generation());
        assert!(!BackendCapabilities::RASTER_ONLY.supports_compute_generation());
    }
}
