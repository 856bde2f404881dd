//! [`GpuBackend`] on top of a wgpu device.
//!
//! Commands are recorded into one open encoder. Queue writes (`write_buffer`,
//! `write_texture`) first flush that encoder so they cannot overtake work that
//! was recorded before them. Render passes are recorded as owned draw lists
//! and encoded when the pass ends.

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use log::{debug, warn};

use crate::arena::SlotArena;
use crate::backend::*;
use crate::error::BackendError;
use crate::gpu::GpuContext;
use crate::shader::ShaderLibrary;

struct GpuTexture {
    texture: wgpu::Texture,
    info: TextureInfo,
}

struct GpuBuffer {
    buffer: wgpu::Buffer,
}

enum PipelineKind {
    Compute(wgpu::ComputePipeline),
    Render(wgpu::RenderPipeline),
}

struct GpuPipeline {
    kind: PipelineKind,
    layouts: Vec<wgpu::BindGroupLayout>,
    types: Vec<Vec<BindingType>>,
}

struct PendingReadback {
    buffer: BufferHandle,
    rx: Receiver<Result<(), String>>,
}

struct RecordedDraw {
    pipeline: PipelineHandle,
    bind_groups: Vec<BindGroupHandle>,
    vertex_buffers: Vec<BufferHandle>,
    index_buffer: Option<(BufferHandle, IndexFormat)>,
    count: u32,
    instance_count: u32,
}

struct OpenPass {
    label: String,
    color: TextureHandle,
    depth: Option<TextureHandle>,
    clear_color: Option<[f64; 4]>,
    clear_depth: Option<f32>,
    draws: Vec<RecordedDraw>,
}

/// Backend driving a real device.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    caps: BackendCapabilities,
    shaders: ShaderLibrary,
    textures: SlotArena<GpuTexture>,
    buffers: SlotArena<GpuBuffer>,
    samplers: SlotArena<wgpu::Sampler>,
    pipelines: SlotArena<GpuPipeline>,
    bind_groups: SlotArena<wgpu::BindGroup>,
    readbacks: SlotArena<PendingReadback>,
    encoder: Option<wgpu::CommandEncoder>,
    open_pass: Option<OpenPass>,
    next_submission: u64,
    completed_upto: u64,
    done_tx: Sender<u64>,
    done_rx: Receiver<u64>,
}

impl WgpuBackend {
    pub fn new(ctx: GpuContext) -> Self {
        Self::from_device(ctx.device, ctx.queue, ctx.float32_filterable)
    }

    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue, float32_filterable: bool) -> Self {
        let limits = device.limits();
        let caps = BackendCapabilities {
            float32_filterable,
            max_texture_size: limits.max_texture_dimension_2d,
            ..BackendCapabilities::FULL
        };
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        Self {
            device,
            queue,
            caps,
            shaders: ShaderLibrary::new(),
            textures: SlotArena::new(),
            buffers: SlotArena::new(),
            samplers: SlotArena::new(),
            pipelines: SlotArena::new(),
            bind_groups: SlotArena::new(),
            readbacks: SlotArena::new(),
            encoder: None,
            open_pass: None,
            next_submission: 1,
            completed_upto: 0,
            done_tx,
            done_rx,
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// Block until all submitted work has finished.
    pub fn wait_idle(&mut self) {
        let _ = self.device.poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        });
        self.drain_completions();
    }

    fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        let device = &self.device;
        self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("nebula-backend-encoder"),
            })
        })
    }

    /// Submit recorded commands without minting a submission id.
    fn flush(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit([encoder.finish()]);
        }
    }

    fn drain_completions(&mut self) {
        while let Ok(id) = self.done_rx.try_recv() {
            self.completed_upto = self.completed_upto.max(id);
        }
    }

    fn texture(&self, h: TextureHandle) -> Result<&GpuTexture, BackendError> {
        self.textures
            .get(h.index())
            .ok_or(BackendError::InvalidHandle {
                kind: "texture",
                index: h.index(),
            })
    }

    fn buffer(&self, h: BufferHandle) -> Result<&GpuBuffer, BackendError> {
        self.buffers
            .get(h.index())
            .ok_or(BackendError::InvalidHandle {
                kind: "buffer",
                index: h.index(),
            })
    }

    fn pipeline(&self, h: PipelineHandle) -> Result<&GpuPipeline, BackendError> {
        self.pipelines
            .get(h.index())
            .ok_or(BackendError::InvalidHandle {
                kind: "pipeline",
                index: h.index(),
            })
    }

    fn bind_group(&self, h: BindGroupHandle) -> Result<&wgpu::BindGroup, BackendError> {
        self.bind_groups
            .get(h.index())
            .ok_or(BackendError::InvalidHandle {
                kind: "bind group",
                index: h.index(),
            })
    }

    fn create_layouts(
        &self,
        label: &str,
        groups: &[&[BindingType]],
        visibility: wgpu::ShaderStages,
    ) -> Vec<wgpu::BindGroupLayout> {
        groups
            .iter()
            .enumerate()
            .map(|(g, bindings)| {
                let entries: Vec<wgpu::BindGroupLayoutEntry> = bindings
                    .iter()
                    .enumerate()
                    .map(|(i, ty)| wgpu::BindGroupLayoutEntry {
                        binding: i as u32,
                        visibility,
                        ty: to_wgpu_binding(*ty),
                        count: None,
                    })
                    .collect();
                self.device
                    .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                        label: Some(&format!("{label}-group-{g}")),
                        entries: &entries,
                    })
            })
            .collect()
    }

    fn encode_pass(&mut self, pass: OpenPass) -> Result<(), BackendError> {
        let color_view = self
            .texture(pass.color)?
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let depth_view = match pass.depth {
            Some(d) => Some(
                self.texture(d)?
                    .texture
                    .create_view(&wgpu::TextureViewDescriptor::default()),
            ),
            None => None,
        };

        // Resolve every handle before any encoding starts.
        for draw in &pass.draws {
            for bg in &draw.bind_groups {
                self.bind_group(*bg)?;
            }
            for vb in &draw.vertex_buffers {
                self.buffer(*vb)?;
            }
            if let Some((ib, _)) = draw.index_buffer {
                self.buffer(ib)?;
            }
        }

        let mut encoder = self.encoder.take().unwrap_or_else(|| {
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("nebula-backend-encoder"),
                })
        });
        {
            let load_color = match pass.clear_color {
                Some([r, g, b, a]) => wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a }),
                None => wgpu::LoadOp::Load,
            };
            let load_depth = match pass.clear_depth {
                Some(v) => wgpu::LoadOp::Clear(v),
                None => wgpu::LoadOp::Load,
            };
            let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(&pass.label),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &color_view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: load_color,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: depth_view.as_ref().map(|view| {
                    wgpu::RenderPassDepthStencilAttachment {
                        view,
                        depth_ops: Some(wgpu::Operations {
                            load: load_depth,
                            store: wgpu::StoreOp::Store,
                        }),
                        stencil_ops: None,
                    }
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });

            for draw in &pass.draws {
                let Some(GpuPipeline {
                    kind: PipelineKind::Render(pipeline),
                    ..
                }) = self.pipelines.get(draw.pipeline.index())
                else {
                    continue;
                };
                rpass.set_pipeline(pipeline);
                for (i, bg) in draw.bind_groups.iter().enumerate() {
                    if let Some(group) = self.bind_groups.get(bg.index()) {
                        rpass.set_bind_group(i as u32, group, &[]);
                    }
                }
                for (slot, vb) in draw.vertex_buffers.iter().enumerate() {
                    if let Some(buf) = self.buffers.get(vb.index()) {
                        rpass.set_vertex_buffer(slot as u32, buf.buffer.slice(..));
                    }
                }
                match draw.index_buffer {
                    Some((ib, format)) => {
                        if let Some(buf) = self.buffers.get(ib.index()) {
                            rpass.set_index_buffer(buf.buffer.slice(..), to_wgpu_index(format));
                        }
                        rpass.draw_indexed(0..draw.count, 0, 0..draw.instance_count);
                    }
                    None => rpass.draw(0..draw.count, 0..draw.instance_count),
                }
            }
        }
        self.encoder = Some(encoder);
        Ok(())
    }
}

fn to_wgpu_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        TextureFormat::R8Unorm => wgpu::TextureFormat::R8Unorm,
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
        TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
    }
}

fn to_wgpu_binding(ty: BindingType) -> wgpu::BindingType {
    match ty {
        BindingType::UniformBuffer => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        BindingType::StorageBuffer { read_only } => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        BindingType::Texture { filterable, array } => wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable },
            view_dimension: if array {
                wgpu::TextureViewDimension::D2Array
            } else {
                wgpu::TextureViewDimension::D2
            },
            multisampled: false,
        },
        BindingType::StorageTexture { format } => wgpu::BindingType::StorageTexture {
            access: wgpu::StorageTextureAccess::WriteOnly,
            format: to_wgpu_format(format),
            view_dimension: wgpu::TextureViewDimension::D2,
        },
        BindingType::Sampler { filtering } => wgpu::BindingType::Sampler(if filtering {
            wgpu::SamplerBindingType::Filtering
        } else {
            wgpu::SamplerBindingType::NonFiltering
        }),
    }
}

fn to_wgpu_compare(compare: CompareFn) -> wgpu::CompareFunction {
    match compare {
        CompareFn::Less => wgpu::CompareFunction::Less,
        CompareFn::LessEqual => wgpu::CompareFunction::LessEqual,
        CompareFn::Greater => wgpu::CompareFunction::Greater,
        CompareFn::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
        CompareFn::Always => wgpu::CompareFunction::Always,
    }
}

fn to_wgpu_vertex_format(format: VertexFormat) -> wgpu::VertexFormat {
    match format {
        VertexFormat::Float32x2 => wgpu::VertexFormat::Float32x2,
        VertexFormat::Float32x3 => wgpu::VertexFormat::Float32x3,
        VertexFormat::Float32x4 => wgpu::VertexFormat::Float32x4,
        VertexFormat::Uint32 => wgpu::VertexFormat::Uint32,
    }
}

fn to_wgpu_index(format: IndexFormat) -> wgpu::IndexFormat {
    match format {
        IndexFormat::U16 => wgpu::IndexFormat::Uint16,
        IndexFormat::U32 => wgpu::IndexFormat::Uint32,
    }
}

fn to_wgpu_filter(filter: FilterMode) -> wgpu::FilterMode {
    match filter {
        FilterMode::Nearest => wgpu::FilterMode::Nearest,
        FilterMode::Linear => wgpu::FilterMode::Linear,
    }
}

fn to_wgpu_address(address: AddressMode) -> wgpu::AddressMode {
    match address {
        AddressMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
        AddressMode::Repeat => wgpu::AddressMode::Repeat,
    }
}

fn origin(region: &TextureRegion) -> wgpu::Origin3d {
    wgpu::Origin3d {
        x: region.x,
        y: region.y,
        z: region.layer,
    }
}

fn extent(region: &TextureRegion) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: region.width,
        height: region.height,
        depth_or_array_layers: 1,
    }
}

impl GpuBackend for WgpuBackend {
    fn api_name(&self) -> ApiName {
        if cfg!(target_arch = "wasm32") {
            ApiName::WebGpu
        } else {
            ApiName::Native
        }
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.caps
    }

    fn create_texture_2d(&mut self, desc: &TextureDesc<'_>) -> Result<TextureHandle, BackendError> {
        if desc.width > self.caps.max_texture_size || desc.height > self.caps.max_texture_size {
            return Err(BackendError::Unsupported("texture size"));
        }
        let mut usage = wgpu::TextureUsages::empty();
        if desc.usage.sampled {
            usage |= wgpu::TextureUsages::TEXTURE_BINDING;
        }
        if desc.usage.storage {
            usage |= wgpu::TextureUsages::STORAGE_BINDING;
        }
        if desc.usage.render_target {
            usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        if desc.usage.copy_src {
            usage |= wgpu::TextureUsages::COPY_SRC;
        }
        if desc.usage.copy_dst {
            usage |= wgpu::TextureUsages::COPY_DST;
        }
        let layers = desc.layers.max(1);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(desc.label),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: layers,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: to_wgpu_format(desc.format),
            usage,
            view_formats: &[],
        });
        let index = self.textures.insert(GpuTexture {
            texture,
            info: TextureInfo {
                width: desc.width,
                height: desc.height,
                layers,
                format: desc.format,
            },
        });
        Ok(TextureHandle::from_index(index))
    }

    fn texture_info(&self, texture: TextureHandle) -> Option<TextureInfo> {
        self.textures.get(texture.index()).map(|t| t.info)
    }

    fn write_texture(
        &mut self,
        region: &TextureRegion,
        data: &[u8],
        bytes_per_row: u32,
    ) -> Result<(), BackendError> {
        self.flush();
        let tex = self.texture(region.texture)?;
        let needed = u64::from(bytes_per_row) * u64::from(region.height);
        if (data.len() as u64) < needed {
            return Err(BackendError::SizeMismatch {
                what: "write_texture",
                expected: needed,
                actual: data.len() as u64,
            });
        }
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &tex.texture,
                mip_level: 0,
                origin: origin(region),
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(region.height),
            },
            extent(region),
        );
        Ok(())
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(texture.index());
    }

    fn create_buffer(
        &mut self,
        label: &str,
        size: u64,
        usage: BufferUsage,
    ) -> Result<BufferHandle, BackendError> {
        let mut flags = wgpu::BufferUsages::empty();
        if usage.uniform {
            flags |= wgpu::BufferUsages::UNIFORM;
        }
        if usage.storage {
            flags |= wgpu::BufferUsages::STORAGE;
        }
        if usage.vertex {
            flags |= wgpu::BufferUsages::VERTEX;
        }
        if usage.index {
            flags |= wgpu::BufferUsages::INDEX;
        }
        if usage.copy_dst {
            flags |= wgpu::BufferUsages::COPY_DST;
        }
        if usage.map_read {
            flags |= wgpu::BufferUsages::MAP_READ;
        }
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: size.div_ceil(wgpu::COPY_BUFFER_ALIGNMENT) * wgpu::COPY_BUFFER_ALIGNMENT,
            usage: flags,
            mapped_at_creation: false,
        });
        Ok(BufferHandle::from_index(self.buffers.insert(GpuBuffer { buffer })))
    }

    fn write_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError> {
        self.flush();
        let buf = self.buffer(buffer)?;
        let end = offset + data.len() as u64;
        if end > buf.buffer.size() {
            return Err(BackendError::SizeMismatch {
                what: "write_buffer",
                expected: buf.buffer.size(),
                actual: end,
            });
        }
        self.queue.write_buffer(&buf.buffer, offset, data);
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(buffer.index());
    }

    fn read_buffer(&mut self, buffer: BufferHandle) -> Result<ReadbackToken, BackendError> {
        self.flush();
        let buf = self.buffer(buffer)?;
        let (tx, rx) = crossbeam_channel::bounded(1);
        buf.buffer
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = tx.send(result.map_err(|e| e.to_string()));
            });
        let index = self.readbacks.insert(PendingReadback { buffer, rx });
        Ok(ReadbackToken::from_index(index))
    }

    fn poll_readback(&mut self, token: ReadbackToken) -> ReadbackStatus {
        let _ = self.device.poll(wgpu::PollType::Poll);
        let Some(pending) = self.readbacks.get(token.index()) else {
            return ReadbackStatus::Failed(format!("unknown readback {}", token.index()));
        };
        let outcome = match pending.rx.try_recv() {
            Err(TryRecvError::Empty) => return ReadbackStatus::Pending,
            Err(TryRecvError::Disconnected) => Err("map callback dropped".to_string()),
            Ok(result) => result,
        };
        let buffer = pending.buffer;
        self.readbacks.remove(token.index());
        match (outcome, self.buffers.get(buffer.index())) {
            (Ok(()), Some(buf)) => {
                let data = buf.buffer.slice(..).get_mapped_range().to_vec();
                buf.buffer.unmap();
                ReadbackStatus::Ready(data)
            }
            (Ok(()), None) => ReadbackStatus::Failed("buffer destroyed before readback".into()),
            (Err(reason), _) => {
                warn!("Readback {} failed: {}", token.index(), reason);
                ReadbackStatus::Failed(reason)
            }
        }
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerHandle, BackendError> {
        let filter = to_wgpu_filter(desc.filter);
        let address = to_wgpu_address(desc.address);
        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("nebula-sampler"),
            address_mode_u: address,
            address_mode_v: address,
            address_mode_w: address,
            mag_filter: filter,
            min_filter: filter,
            mipmap_filter: wgpu::MipmapFilterMode::Nearest,
            ..Default::default()
        });
        Ok(SamplerHandle::from_index(self.samplers.insert(sampler)))
    }

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDesc<'_>,
    ) -> Result<PipelineHandle, BackendError> {
        let module = self
            .shaders
            .load_from_source(&self.device, desc.label, desc.shader)?;
        let layouts = self.create_layouts(
            desc.label,
            desc.bind_group_layouts,
            wgpu::ShaderStages::COMPUTE,
        );
        let layout_refs: Vec<&wgpu::BindGroupLayout> = layouts.iter().collect();
        let layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(desc.label),
                bind_group_layouts: &layout_refs,
                immediate_size: 0,
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(desc.label),
                layout: Some(&layout),
                module: &module,
                entry_point: Some(desc.entry_point),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });
        debug!("Created compute pipeline '{}'", desc.label);
        let index = self.pipelines.insert(GpuPipeline {
            kind: PipelineKind::Compute(pipeline),
            layouts,
            types: desc.bind_group_layouts.iter().map(|l| l.to_vec()).collect(),
        });
        Ok(PipelineHandle::from_index(index))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDesc<'_>,
    ) -> Result<PipelineHandle, BackendError> {
        let module = self
            .shaders
            .load_from_source(&self.device, desc.label, desc.shader)?;
        let layouts = self.create_layouts(
            desc.label,
            desc.bind_group_layouts,
            wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
        );
        let layout_refs: Vec<&wgpu::BindGroupLayout> = layouts.iter().collect();
        let layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(desc.label),
                bind_group_layouts: &layout_refs,
                immediate_size: 0,
            });

        let attributes: Vec<Vec<wgpu::VertexAttribute>> = desc
            .vertex_layouts
            .iter()
            .map(|l| {
                l.attributes
                    .iter()
                    .map(|a| wgpu::VertexAttribute {
                        format: to_wgpu_vertex_format(a.format),
                        offset: a.offset,
                        shader_location: a.location,
                    })
                    .collect()
            })
            .collect();
        let buffers: Vec<wgpu::VertexBufferLayout> = desc
            .vertex_layouts
            .iter()
            .zip(&attributes)
            .map(|(l, attrs)| wgpu::VertexBufferLayout {
                array_stride: l.stride,
                step_mode: match l.step {
                    VertexStep::Vertex => wgpu::VertexStepMode::Vertex,
                    VertexStep::Instance => wgpu::VertexStepMode::Instance,
                },
                attributes: attrs,
            })
            .collect();

        let blend = match desc.blend {
            BlendMode::Opaque => None,
            BlendMode::Alpha => Some(wgpu::BlendState::ALPHA_BLENDING),
            BlendMode::PremultipliedAlpha => Some(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING),
        };

        let pipeline = self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(desc.label),
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module: &module,
                    entry_point: Some(desc.vs_entry),
                    buffers: &buffers,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    strip_index_format: None,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: desc.cull_back_faces.then_some(wgpu::Face::Back),
                    unclipped_depth: false,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    conservative: false,
                },
                depth_stencil: desc.depth.map(|d| wgpu::DepthStencilState {
                    format: to_wgpu_format(d.format),
                    depth_write_enabled: d.write,
                    depth_compare: to_wgpu_compare(d.compare),
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                fragment: Some(wgpu::FragmentState {
                    module: &module,
                    entry_point: Some(desc.fs_entry),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: to_wgpu_format(desc.color_format),
                        blend,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                multiview_mask: None,
                cache: None,
            });
        debug!("Created render pipeline '{}'", desc.label);
        let index = self.pipelines.insert(GpuPipeline {
            kind: PipelineKind::Render(pipeline),
            layouts,
            types: desc.bind_group_layouts.iter().map(|l| l.to_vec()).collect(),
        });
        Ok(PipelineHandle::from_index(index))
    }

    fn create_bind_group(
        &mut self,
        pipeline: PipelineHandle,
        group: u32,
        entries: &[BindingResource],
    ) -> Result<BindGroupHandle, BackendError> {
        let p = self.pipeline(pipeline)?;
        let (Some(layout), Some(types)) = (
            p.layouts.get(group as usize),
            p.types.get(group as usize),
        ) else {
            return Err(BackendError::LayoutMismatch {
                group,
                reason: "pipeline has no such group".into(),
            });
        };
        if types.len() != entries.len() {
            return Err(BackendError::LayoutMismatch {
                group,
                reason: format!("expected {} entries, got {}", types.len(), entries.len()),
            });
        }

        enum Owned {
            View(wgpu::TextureView),
            Buffer(BufferHandle),
            Sampler(SamplerHandle),
        }
        let mut owned = Vec::with_capacity(entries.len());
        for (ty, res) in types.iter().zip(entries) {
            let item = match (ty, res) {
                (
                    BindingType::UniformBuffer | BindingType::StorageBuffer { .. },
                    BindingResource::Buffer(b),
                ) => {
                    self.buffer(*b)?;
                    Owned::Buffer(*b)
                }
                (BindingType::Texture { array, .. }, BindingResource::Texture { texture, layer }) => {
                    let tex = self.texture(*texture)?;
                    let view = match (*array, *layer) {
                        (false, Some(l)) => view_of_layer(&tex.texture, l),
                        (true, _) => tex.texture.create_view(&wgpu::TextureViewDescriptor {
                            dimension: Some(wgpu::TextureViewDimension::D2Array),
                            ..Default::default()
                        }),
                        (false, None) => view_of_layer(&tex.texture, 0),
                    };
                    Owned::View(view)
                }
                (
                    BindingType::StorageTexture { .. },
                    BindingResource::StorageTexture { texture, layer },
                ) => {
                    let tex = self.texture(*texture)?;
                    Owned::View(view_of_layer(&tex.texture, layer.unwrap_or(0)))
                }
                (BindingType::Sampler { .. }, BindingResource::Sampler(s)) => {
                    if !self.samplers.contains(s.index()) {
                        return Err(BackendError::InvalidHandle {
                            kind: "sampler",
                            index: s.index(),
                        });
                    }
                    Owned::Sampler(*s)
                }
                (ty, res) => {
                    return Err(BackendError::LayoutMismatch {
                        group,
                        reason: format!("{res:?} does not fit {ty:?}"),
                    });
                }
            };
            owned.push(item);
        }

        let mut wgpu_entries = Vec::with_capacity(owned.len());
        for (i, item) in owned.iter().enumerate() {
            let resource = match item {
                Owned::View(view) => wgpu::BindingResource::TextureView(view),
                Owned::Buffer(b) => self.buffer(*b)?.buffer.as_entire_binding(),
                Owned::Sampler(s) => match self.samplers.get(s.index()) {
                    Some(sampler) => wgpu::BindingResource::Sampler(sampler),
                    None => {
                        return Err(BackendError::InvalidHandle {
                            kind: "sampler",
                            index: s.index(),
                        });
                    }
                },
            };
            wgpu_entries.push(wgpu::BindGroupEntry {
                binding: i as u32,
                resource,
            });
        }
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("nebula-bind-group"),
            layout,
            entries: &wgpu_entries,
        });
        Ok(BindGroupHandle::from_index(self.bind_groups.insert(bind_group)))
    }

    fn destroy_bind_group(&mut self, bind_group: BindGroupHandle) {
        self.bind_groups.remove(bind_group.index());
    }

    fn dispatch_compute(
        &mut self,
        pipeline: PipelineHandle,
        bind_groups: &[BindGroupHandle],
        groups: [u32; 3],
    ) -> Result<(), BackendError> {
        for bg in bind_groups {
            self.bind_group(*bg)?;
        }
        if !matches!(self.pipeline(pipeline)?.kind, PipelineKind::Compute(_)) {
            return Err(BackendError::PassState("dispatch with a render pipeline"));
        }
        let mut encoder = self.encoder.take().unwrap_or_else(|| {
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("nebula-backend-encoder"),
                })
        });
        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("nebula-compute"),
                timestamp_writes: None,
            });
            if let Some(GpuPipeline {
                kind: PipelineKind::Compute(p),
                ..
            }) = self.pipelines.get(pipeline.index())
            {
                cpass.set_pipeline(p);
            }
            for (i, bg) in bind_groups.iter().enumerate() {
                if let Some(group) = self.bind_groups.get(bg.index()) {
                    cpass.set_bind_group(i as u32, group, &[]);
                }
            }
            cpass.dispatch_workgroups(groups[0], groups[1], groups[2]);
        }
        self.encoder = Some(encoder);
        Ok(())
    }

    fn begin_pass(&mut self, desc: &PassDesc<'_>) -> Result<(), BackendError> {
        if self.open_pass.is_some() {
            return Err(BackendError::PassState("pass already open"));
        }
        self.texture(desc.color)?;
        if let Some(depth) = desc.depth {
            self.texture(depth)?;
        }
        self.open_pass = Some(OpenPass {
            label: desc.label.to_string(),
            color: desc.color,
            depth: desc.depth,
            clear_color: desc.clear_color,
            clear_depth: desc.clear_depth,
            draws: Vec::new(),
        });
        Ok(())
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), BackendError> {
        if !matches!(self.pipeline(call.pipeline)?.kind, PipelineKind::Render(_)) {
            return Err(BackendError::PassState("draw with a compute pipeline"));
        }
        let pass = self
            .open_pass
            .as_mut()
            .ok_or(BackendError::PassState("draw outside a pass"))?;
        pass.draws.push(RecordedDraw {
            pipeline: call.pipeline,
            bind_groups: call.bind_groups.to_vec(),
            vertex_buffers: call.vertex_buffers.to_vec(),
            index_buffer: call.index_buffer,
            count: call.count,
            instance_count: call.instance_count,
        });
        Ok(())
    }

    fn end_pass(&mut self) -> Result<(), BackendError> {
        let pass = self
            .open_pass
            .take()
            .ok_or(BackendError::PassState("no open pass"))?;
        self.encode_pass(pass)
    }

    fn copy_texture_to_buffer(
        &mut self,
        region: &TextureRegion,
        buffer: BufferHandle,
        bytes_per_row: u32,
    ) -> Result<(), BackendError> {
        if bytes_per_row % wgpu::COPY_BYTES_PER_ROW_ALIGNMENT != 0 {
            return Err(BackendError::SizeMismatch {
                what: "bytes_per_row alignment",
                expected: u64::from(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT),
                actual: u64::from(bytes_per_row),
            });
        }
        self.texture(region.texture)?;
        self.buffer(buffer)?;
        self.encoder();
        if let (Some(encoder), Some(tex), Some(buf)) = (
            self.encoder.as_mut(),
            self.textures.get(region.texture.index()),
            self.buffers.get(buffer.index()),
        ) {
            encoder.copy_texture_to_buffer(
                wgpu::TexelCopyTextureInfo {
                    texture: &tex.texture,
                    mip_level: 0,
                    origin: origin(region),
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::TexelCopyBufferInfo {
                    buffer: &buf.buffer,
                    layout: wgpu::TexelCopyBufferLayout {
                        offset: 0,
                        bytes_per_row: Some(bytes_per_row),
                        rows_per_image: Some(region.height),
                    },
                },
                extent(region),
            );
        }
        Ok(())
    }

    fn copy_texture_to_texture(
        &mut self,
        src: &TextureRegion,
        dst: TextureHandle,
        dst_layer: u32,
        dst_origin: [u32; 2],
    ) -> Result<(), BackendError> {
        self.texture(src.texture)?;
        self.texture(dst)?;
        self.encoder();
        if let (Some(encoder), Some(s), Some(d)) = (
            self.encoder.as_mut(),
            self.textures.get(src.texture.index()),
            self.textures.get(dst.index()),
        ) {
            encoder.copy_texture_to_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: &s.texture,
                    mip_level: 0,
                    origin: origin(src),
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::TexelCopyTextureInfo {
                    texture: &d.texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d {
                        x: dst_origin[0],
                        y: dst_origin[1],
                        z: dst_layer,
                    },
                    aspect: wgpu::TextureAspect::All,
                },
                extent(src),
            );
        }
        Ok(())
    }

    fn submit(&mut self) -> SubmissionId {
        let id = self.next_submission;
        self.next_submission += 1;
        let encoder = self.encoder.take().unwrap_or_else(|| {
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("nebula-backend-encoder"),
                })
        });
        self.queue.submit([encoder.finish()]);
        let tx = self.done_tx.clone();
        self.queue.on_submitted_work_done(move || {
            let _ = tx.send(id);
        });
        SubmissionId(id)
    }

    /// Device errors surface through wgpu's uncaptured-error handler, so
    /// submissions here only ever report pending or complete.
    fn submission_status(&mut self, id: SubmissionId) -> SubmissionStatus {
        self.drain_completions();
        if id.0 <= self.completed_upto {
            SubmissionStatus::Complete
        } else {
            SubmissionStatus::Pending
        }
    }

    fn poll(&mut self) {
        let _ = self.device.poll(wgpu::PollType::Poll);
        self.drain_completions();
    }
}

fn view_of_layer(texture: &wgpu::Texture, layer: u32) -> wgpu::TextureView {
    texture.create_view(&wgpu::TextureViewDescriptor {
        dimension: Some(wgpu::TextureViewDimension::D2),
        base_array_layer: layer,
        array_layer_count: Some(1),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::create_test_device_queue;
    use crate::readback::{padded_bytes_per_row, unpad_rows};

    fn backend() -> Option<WgpuBackend> {
        let (device, queue) = create_test_device_queue()?;
        Some(WgpuBackend::from_device(device, queue, false))
    }

    fn wait_readback(b: &mut WgpuBackend, token: ReadbackToken) -> Vec<u8> {
        for _ in 0..1000 {
            b.wait_idle();
            match b.poll_readback(token) {
                ReadbackStatus::Ready(data) => return data,
                ReadbackStatus::Failed(reason) => panic!("readback failed: {reason}"),
                ReadbackStatus::Pending => {}
            }
        }
        panic!("readback never completed");
    }

    /// Uploaded texels come back unchanged through a padded readback.
    #[test]
    fn test_upload_readback_roundtrip() {
        let Some(mut b) = backend() else {
            return;
        };
        let (w, h) = (5u32, 3u32);
        let tex = b
            .create_texture_2d(&TextureDesc {
                label: "roundtrip",
                width: w,
                height: h,
                layers: 1,
                format: TextureFormat::Rgba32Float,
                usage: TextureUsage::UPLOAD,
            })
            .unwrap();
        let texels: Vec<f32> = (0..w * h * 4).map(|i| i as f32 * 0.5).collect();
        b.write_texture(
            &TextureRegion::full(tex, 0, w, h),
            bytemuck::cast_slice(&texels),
            w * 16,
        )
        .unwrap();
        let padded = padded_bytes_per_row(w, 16);
        let buf = b
            .create_buffer("rb", u64::from(padded * h), BufferUsage::READBACK)
            .unwrap();
        b.copy_texture_to_buffer(&TextureRegion::full(tex, 0, w, h), buf, padded)
            .unwrap();
        let token = b.read_buffer(buf).unwrap();
        b.submit();
        let data = wait_readback(&mut b, token);
        let tight = unpad_rows(&data, w * 16, padded, h);
        let back: &[f32] = bytemuck::cast_slice(&tight);
        assert_eq!(back, texels.as_slice());
    }

    /// Submissions complete after the device drains its queue.
    #[test]
    fn test_submission_completes() {
        let Some(mut b) = backend() else {
            return;
        };
        let id = b.submit();
        b.wait_idle();
        assert_eq!(b.submission_status(id), SubmissionStatus::Complete);
    }

    /// Compute dispatches write storage textures.
    #[test]
    fn test_compute_fills_storage_texture() {
        let Some(mut b) = backend() else {
            return;
        };
        let shader = "
@group(0) @binding(0) var out_tex: texture_storage_2d<rgba32float, write>;
@compute @workgroup_size(8, 8)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    textureStore(out_tex, vec2<i32>(id.xy), vec4<f32>(1.0, 2.0, 3.0, 4.0));
}
";
        let pipeline = b
            .create_compute_pipeline(&ComputePipelineDesc {
                label: "fill",
                shader,
                entry_point: "main",
                bind_group_layouts: &[&[BindingType::StorageTexture {
                    format: TextureFormat::Rgba32Float,
                }]],
            })
            .unwrap();
        let tex = b
            .create_storage_texture("fill-target", 8, 8, TextureFormat::Rgba32Float, 1)
            .unwrap();
        let bg = b
            .create_bind_group(
                pipeline,
                0,
                &[BindingResource::StorageTexture {
                    texture: tex,
                    layer: None,
                }],
            )
            .unwrap();
        b.dispatch_compute(pipeline, &[bg], [1, 1, 1]).unwrap();
        let buf = b
            .create_buffer("rb", 256 * 8, BufferUsage::READBACK)
            .unwrap();
        b.copy_texture_to_buffer(&TextureRegion::full(tex, 0, 8, 8), buf, 256)
            .unwrap();
        let token = b.read_buffer(buf).unwrap();
        b.submit();
        let data = wait_readback(&mut b, token);
        let first: &[f32] = bytemuck::cast_slice(&data[..16]);
        assert_eq!(first, &[1.0, 2.0, 3.0, 4.0]);
    }
}
