//! In-memory backend.
//!
//! Texture and buffer contents live in host memory, uploads and copies are
//! applied immediately, dispatches and draws are validated and recorded but
//! not executed. Submissions and readbacks complete on the next
//! [`GpuBackend::poll`], which mirrors the one-frame latency of a real queue.
//!
//! The default capability set is [`BackendCapabilities::RASTER_ONLY`], so
//! consumers exercise their CPU generation paths.

use rustc_hash::FxHashSet;

use crate::arena::SlotArena;
use crate::backend::*;
use crate::error::BackendError;
use crate::readback::COPY_ROW_ALIGNMENT;

struct SoftTexture {
    label: String,
    info: TextureInfo,
    data: Vec<u8>,
}

impl SoftTexture {
    fn layer_bytes(&self) -> usize {
        (self.info.width * self.info.height * self.info.format.bytes_per_texel()) as usize
    }

    fn row_bytes(&self) -> usize {
        (self.info.width * self.info.format.bytes_per_texel()) as usize
    }
}

struct SoftBuffer {
    data: Vec<u8>,
}

enum PipelineKind {
    Compute,
    Render,
}

struct SoftPipeline {
    label: String,
    kind: PipelineKind,
    layouts: Vec<Vec<BindingType>>,
}

struct SoftBindGroup {
    group: u32,
    entries: Vec<BindingResource>,
}

struct SoftReadback {
    buffer: BufferHandle,
    submission: SubmissionId,
}

/// One recorded compute dispatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchRecord {
    pub pipeline: String,
    pub groups: [u32; 3],
    pub bind_groups: Vec<BindGroupHandle>,
}

/// One recorded draw.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrawRecord {
    pub pipeline: String,
    pub count: u32,
    pub instance_count: u32,
    pub bind_groups: Vec<BindGroupHandle>,
}

/// One recorded render pass.
#[derive(Clone, Debug, PartialEq)]
pub struct PassRecord {
    pub label: String,
    pub color: TextureHandle,
    pub depth: Option<TextureHandle>,
    pub draws: Vec<DrawRecord>,
}

/// Backend that keeps every resource in host memory.
pub struct SoftwareBackend {
    api: ApiName,
    caps: BackendCapabilities,
    memory_limit: Option<u64>,
    textures: SlotArena<SoftTexture>,
    buffers: SlotArena<SoftBuffer>,
    samplers: SlotArena<SamplerDesc>,
    pipelines: SlotArena<SoftPipeline>,
    bind_groups: SlotArena<SoftBindGroup>,
    readbacks: SlotArena<SoftReadback>,
    open_pass: Option<PassRecord>,
    passes: Vec<PassRecord>,
    dispatches: Vec<DispatchRecord>,
    next_submission: u64,
    submitted_upto: u64,
    completed_upto: u64,
    failed: FxHashSet<u64>,
    fail_next: u32,
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareBackend {
    /// A raster-only backend reporting the WebGL2 API.
    pub fn new() -> Self {
        Self::with_capabilities(ApiName::WebGl2, BackendCapabilities::RASTER_ONLY)
    }

    pub fn with_capabilities(api: ApiName, caps: BackendCapabilities) -> Self {
        Self {
            api,
            caps,
            memory_limit: None,
            textures: SlotArena::new(),
            buffers: SlotArena::new(),
            samplers: SlotArena::new(),
            pipelines: SlotArena::new(),
            bind_groups: SlotArena::new(),
            readbacks: SlotArena::new(),
            open_pass: None,
            passes: Vec::new(),
            dispatches: Vec::new(),
            next_submission: 1,
            submitted_upto: 0,
            completed_upto: 0,
            failed: FxHashSet::default(),
            fail_next: 0,
        }
    }

    /// Refuse texture allocations that would exceed `bytes` in total.
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Mark the next `count` submissions as failed.
    pub fn fail_next_submissions(&mut self, count: u32) {
        self.fail_next = count;
    }

    /// Raw bytes of one texture layer.
    pub fn texture_data(&self, texture: TextureHandle, layer: u32) -> Option<&[u8]> {
        let tex = self.textures.get(texture.index())?;
        let size = tex.layer_bytes();
        let start = size * layer as usize;
        tex.data.get(start..start + size)
    }

    /// Label a texture was created with.
    pub fn texture_label(&self, texture: TextureHandle) -> Option<&str> {
        self.textures.get(texture.index()).map(|t| t.label.as_str())
    }

    /// Resources bound by a bind group.
    pub fn bind_group_entries(&self, bind_group: BindGroupHandle) -> Option<&[BindingResource]> {
        self.bind_groups
            .get(bind_group.index())
            .map(|g| g.entries.as_slice())
    }

    pub fn live_texture_count(&self) -> usize {
        self.textures.len()
    }

    /// Bytes held by live textures.
    pub fn allocated_texture_bytes(&self) -> u64 {
        self.textures.iter().map(|(_, t)| t.data.len() as u64).sum()
    }

    pub fn dispatches(&self) -> &[DispatchRecord] {
        &self.dispatches
    }

    /// Completed render passes since the last [`SoftwareBackend::clear_records`].
    pub fn passes(&self) -> &[PassRecord] {
        &self.passes
    }

    pub fn clear_records(&mut self) {
        self.passes.clear();
        self.dispatches.clear();
    }

    fn texture(&self, h: TextureHandle) -> Result<&SoftTexture, BackendError> {
        self.textures
            .get(h.index())
            .ok_or(BackendError::InvalidHandle {
                kind: "texture",
                index: h.index(),
            })
    }

    fn pipeline(&self, h: PipelineHandle) -> Result<&SoftPipeline, BackendError> {
        self.pipelines
            .get(h.index())
            .ok_or(BackendError::InvalidHandle {
                kind: "pipeline",
                index: h.index(),
            })
    }

    fn check_region(tex: &SoftTexture, region: &TextureRegion) -> Result<(), BackendError> {
        let info = tex.info;
        if region.layer >= info.layers
            || region.x + region.width > info.width
            || region.y + region.height > info.height
        {
            return Err(BackendError::SizeMismatch {
                what: "texture region",
                expected: u64::from(info.width) * u64::from(info.height),
                actual: u64::from(region.x + region.width) * u64::from(region.y + region.height),
            });
        }
        Ok(())
    }

    fn check_bind_groups(
        &self,
        pipeline: PipelineHandle,
        bind_groups: &[BindGroupHandle],
    ) -> Result<(), BackendError> {
        let expected = self.pipeline(pipeline)?.layouts.len();
        if bind_groups.len() != expected {
            return Err(BackendError::LayoutMismatch {
                group: bind_groups.len() as u32,
                reason: format!("pipeline expects {expected} bind groups"),
            });
        }
        for (i, bg) in bind_groups.iter().enumerate() {
            let group = self
                .bind_groups
                .get(bg.index())
                .ok_or(BackendError::InvalidHandle {
                    kind: "bind group",
                    index: bg.index(),
                })?;
            if group.group != i as u32 {
                return Err(BackendError::LayoutMismatch {
                    group: i as u32,
                    reason: format!("bind group was created for slot {}", group.group),
                });
            }
        }
        Ok(())
    }
}

fn binding_matches(ty: &BindingType, res: &BindingResource) -> bool {
    matches!(
        (ty, res),
        (BindingType::UniformBuffer, BindingResource::Buffer(_))
            | (BindingType::StorageBuffer { .. }, BindingResource::Buffer(_))
            | (BindingType::Texture { .. }, BindingResource::Texture { .. })
            | (BindingType::StorageTexture { .. }, BindingResource::StorageTexture { .. })
            | (BindingType::Sampler { .. }, BindingResource::Sampler(_))
    )
}

impl GpuBackend for SoftwareBackend {
    fn api_name(&self) -> ApiName {
        self.api
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.caps
    }

    fn create_texture_2d(&mut self, desc: &TextureDesc<'_>) -> Result<TextureHandle, BackendError> {
        if desc.layers > 1 && !self.caps.texture_arrays {
            return Err(BackendError::Unsupported("texture arrays"));
        }
        if desc.usage.storage && !self.caps.storage_textures {
            return Err(BackendError::Unsupported("storage textures"));
        }
        if desc.width > self.caps.max_texture_size || desc.height > self.caps.max_texture_size {
            return Err(BackendError::Unsupported("texture size"));
        }
        let bytes = desc.size_bytes();
        if let Some(limit) = self.memory_limit
            && self.allocated_texture_bytes() + bytes > limit
        {
            return Err(BackendError::OutOfMemory { bytes });
        }
        let index = self.textures.insert(SoftTexture {
            label: desc.label.to_string(),
            info: TextureInfo {
                width: desc.width,
                height: desc.height,
                layers: desc.layers.max(1),
                format: desc.format,
            },
            data: vec![0; bytes as usize],
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
        let tex = self.texture(region.texture)?;
        Self::check_region(tex, region)?;
        let bpp = tex.info.format.bytes_per_texel() as usize;
        let row = region.width as usize * bpp;
        let pitch = bytes_per_row as usize;
        let needed = pitch * (region.height as usize).saturating_sub(1) + row;
        if pitch < row || data.len() < needed {
            return Err(BackendError::SizeMismatch {
                what: "write_texture",
                expected: needed as u64,
                actual: data.len() as u64,
            });
        }
        let layer_base = tex.layer_bytes() * region.layer as usize;
        let tex_row = tex.row_bytes();
        let tex = self
            .textures
            .get_mut(region.texture.index())
            .ok_or(BackendError::InvalidHandle {
                kind: "texture",
                index: region.texture.index(),
            })?;
        for y in 0..region.height as usize {
            let dst = layer_base + (region.y as usize + y) * tex_row + region.x as usize * bpp;
            let src = y * pitch;
            tex.data[dst..dst + row].copy_from_slice(&data[src..src + row]);
        }
        Ok(())
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(texture.index());
    }

    fn create_buffer(
        &mut self,
        _label: &str,
        size: u64,
        _usage: BufferUsage,
    ) -> Result<BufferHandle, BackendError> {
        let index = self.buffers.insert(SoftBuffer {
            data: vec![0; size as usize],
        });
        Ok(BufferHandle::from_index(index))
    }

    fn write_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError> {
        let buf = self
            .buffers
            .get_mut(buffer.index())
            .ok_or(BackendError::InvalidHandle {
                kind: "buffer",
                index: buffer.index(),
            })?;
        let start = offset as usize;
        let end = start + data.len();
        if end > buf.data.len() {
            return Err(BackendError::SizeMismatch {
                what: "write_buffer",
                expected: buf.data.len() as u64,
                actual: end as u64,
            });
        }
        buf.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(buffer.index());
    }

    fn read_buffer(&mut self, buffer: BufferHandle) -> Result<ReadbackToken, BackendError> {
        if !self.buffers.contains(buffer.index()) {
            return Err(BackendError::InvalidHandle {
                kind: "buffer",
                index: buffer.index(),
            });
        }
        // Recorded work lands in the next submission.
        let submission = SubmissionId(self.next_submission);
        let index = self.readbacks.insert(SoftReadback { buffer, submission });
        Ok(ReadbackToken::from_index(index))
    }

    fn poll_readback(&mut self, token: ReadbackToken) -> ReadbackStatus {
        let Some(rb) = self.readbacks.get(token.index()) else {
            return ReadbackStatus::Failed(format!("unknown readback {}", token.index()));
        };
        let (buffer, submission) = (rb.buffer, rb.submission);
        match self.submission_status(submission) {
            SubmissionStatus::Pending => ReadbackStatus::Pending,
            SubmissionStatus::Failed(reason) => {
                self.readbacks.remove(token.index());
                ReadbackStatus::Failed(reason)
            }
            SubmissionStatus::Complete => {
                self.readbacks.remove(token.index());
                match self.buffers.get(buffer.index()) {
                    Some(buf) => ReadbackStatus::Ready(buf.data.clone()),
                    None => ReadbackStatus::Failed("buffer destroyed before readback".into()),
                }
            }
        }
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerHandle, BackendError> {
        Ok(SamplerHandle::from_index(self.samplers.insert(*desc)))
    }

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDesc<'_>,
    ) -> Result<PipelineHandle, BackendError> {
        if !self.caps.compute {
            return Err(BackendError::Unsupported("compute"));
        }
        let index = self.pipelines.insert(SoftPipeline {
            label: desc.label.to_string(),
            kind: PipelineKind::Compute,
            layouts: desc.bind_group_layouts.iter().map(|l| l.to_vec()).collect(),
        });
        Ok(PipelineHandle::from_index(index))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDesc<'_>,
    ) -> Result<PipelineHandle, BackendError> {
        let index = self.pipelines.insert(SoftPipeline {
            label: desc.label.to_string(),
            kind: PipelineKind::Render,
            layouts: desc.bind_group_layouts.iter().map(|l| l.to_vec()).collect(),
        });
        Ok(PipelineHandle::from_index(index))
    }

    fn create_bind_group(
        &mut self,
        pipeline: PipelineHandle,
        group: u32,
        entries: &[BindingResource],
    ) -> Result<BindGroupHandle, BackendError> {
        let layout = self
            .pipeline(pipeline)?
            .layouts
            .get(group as usize)
            .ok_or_else(|| BackendError::LayoutMismatch {
                group,
                reason: "pipeline has no such group".into(),
            })?;
        if layout.len() != entries.len() {
            return Err(BackendError::LayoutMismatch {
                group,
                reason: format!("expected {} entries, got {}", layout.len(), entries.len()),
            });
        }
        for (binding, (ty, res)) in layout.iter().zip(entries).enumerate() {
            if !binding_matches(ty, res) {
                return Err(BackendError::LayoutMismatch {
                    group,
                    reason: format!("binding {binding}: {res:?} does not fit {ty:?}"),
                });
            }
            match res {
                BindingResource::Texture { texture, .. }
                | BindingResource::StorageTexture { texture, .. } => {
                    self.texture(*texture)?;
                }
                BindingResource::Buffer(b) if !self.buffers.contains(b.index()) => {
                    return Err(BackendError::InvalidHandle {
                        kind: "buffer",
                        index: b.index(),
                    });
                }
                _ => {}
            }
        }
        let index = self.bind_groups.insert(SoftBindGroup {
            group,
            entries: entries.to_vec(),
        });
        Ok(BindGroupHandle::from_index(index))
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
        let p = self.pipeline(pipeline)?;
        if !matches!(p.kind, PipelineKind::Compute) {
            return Err(BackendError::PassState("dispatch with a render pipeline"));
        }
        let label = p.label.clone();
        self.check_bind_groups(pipeline, bind_groups)?;
        self.dispatches.push(DispatchRecord {
            pipeline: label,
            groups,
            bind_groups: bind_groups.to_vec(),
        });
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
        self.open_pass = Some(PassRecord {
            label: desc.label.to_string(),
            color: desc.color,
            depth: desc.depth,
            draws: Vec::new(),
        });
        Ok(())
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), BackendError> {
        if self.open_pass.is_none() {
            return Err(BackendError::PassState("draw outside a pass"));
        }
        let p = self.pipeline(call.pipeline)?;
        if !matches!(p.kind, PipelineKind::Render) {
            return Err(BackendError::PassState("draw with a compute pipeline"));
        }
        let label = p.label.clone();
        self.check_bind_groups(call.pipeline, call.bind_groups)?;
        if let Some(pass) = self.open_pass.as_mut() {
            pass.draws.push(DrawRecord {
                pipeline: label,
                count: call.count,
                instance_count: call.instance_count,
                bind_groups: call.bind_groups.to_vec(),
            });
        }
        Ok(())
    }

    fn end_pass(&mut self) -> Result<(), BackendError> {
        let pass = self
            .open_pass
            .take()
            .ok_or(BackendError::PassState("no open pass"))?;
        self.passes.push(pass);
        Ok(())
    }

    fn copy_texture_to_buffer(
        &mut self,
        region: &TextureRegion,
        buffer: BufferHandle,
        bytes_per_row: u32,
    ) -> Result<(), BackendError> {
        if bytes_per_row % COPY_ROW_ALIGNMENT != 0 {
            return Err(BackendError::SizeMismatch {
                what: "bytes_per_row alignment",
                expected: u64::from(bytes_per_row.div_ceil(COPY_ROW_ALIGNMENT) * COPY_ROW_ALIGNMENT),
                actual: u64::from(bytes_per_row),
            });
        }
        let tex = self.texture(region.texture)?;
        Self::check_region(tex, region)?;
        let bpp = tex.info.format.bytes_per_texel() as usize;
        let row = region.width as usize * bpp;
        let layer_base = tex.layer_bytes() * region.layer as usize;
        let tex_row = tex.row_bytes();
        let rows: Vec<Vec<u8>> = (0..region.height as usize)
            .map(|y| {
                let src = layer_base + (region.y as usize + y) * tex_row + region.x as usize * bpp;
                tex.data[src..src + row].to_vec()
            })
            .collect();

        let buf = self
            .buffers
            .get_mut(buffer.index())
            .ok_or(BackendError::InvalidHandle {
                kind: "buffer",
                index: buffer.index(),
            })?;
        let needed = bytes_per_row as usize * rows.len();
        if buf.data.len() < needed {
            return Err(BackendError::SizeMismatch {
                what: "copy_texture_to_buffer",
                expected: needed as u64,
                actual: buf.data.len() as u64,
            });
        }
        for (y, r) in rows.iter().enumerate() {
            let dst = y * bytes_per_row as usize;
            buf.data[dst..dst + row].copy_from_slice(r);
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
        let tex = self.texture(src.texture)?;
        Self::check_region(tex, src)?;
        let bpp = tex.info.format.bytes_per_texel() as usize;
        let row = src.width as usize * bpp;
        let mut packed = Vec::with_capacity(row * src.height as usize);
        let layer_base = tex.layer_bytes() * src.layer as usize;
        for y in 0..src.height as usize {
            let s = layer_base + (src.y as usize + y) * tex.row_bytes() + src.x as usize * bpp;
            packed.extend_from_slice(&tex.data[s..s + row]);
        }
        let dst_region = TextureRegion {
            texture: dst,
            layer: dst_layer,
            x: dst_origin[0],
            y: dst_origin[1],
            width: src.width,
            height: src.height,
        };
        self.write_texture(&dst_region, &packed, row as u32)
    }

    fn submit(&mut self) -> SubmissionId {
        let id = self.next_submission;
        self.next_submission += 1;
        self.submitted_upto = id;
        if self.fail_next > 0 {
            self.fail_next -= 1;
            self.failed.insert(id);
        }
        SubmissionId(id)
    }

    fn submission_status(&mut self, id: SubmissionId) -> SubmissionStatus {
        if self.failed.contains(&id.0) {
            SubmissionStatus::Failed(format!("submission {} failed", id.0))
        } else if id.0 <= self.completed_upto {
            SubmissionStatus::Complete
        } else {
            SubmissionStatus::Pending
        }
    }

    fn poll(&mut self) {
        self.completed_upto = self.submitted_upto;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload_desc(w: u32, h: u32) -> TextureDesc<'static> {
        TextureDesc {
            label: "t",
            width: w,
            height: h,
            layers: 1,
            format: TextureFormat::Rgba32Float,
            usage: TextureUsage::UPLOAD,
        }
    }

    /// Uploaded texels are readable per layer.
    #[test]
    fn test_write_texture_region() {
        let mut b = SoftwareBackend::new();
        let t = b.create_texture_2d(&upload_desc(4, 4)).unwrap();
        let texel: Vec<u8> = bytemuck::cast_slice(&[1.0f32, 2.0, 3.0, 4.0]).to_vec();
        let region = TextureRegion {
            texture: t,
            layer: 0,
            x: 2,
            y: 1,
            width: 1,
            height: 1,
        };
        b.write_texture(&region, &texel, 16).unwrap();
        let data = b.texture_data(t, 0).unwrap();
        let offset = (4 + 2) * 16;
        assert_eq!(&data[offset..offset + 16], texel.as_slice());
    }

    /// Readbacks complete only after the submission has been polled.
    #[test]
    fn test_readback_latency() {
        let mut b = SoftwareBackend::new();
        let t = b.create_texture_2d(&upload_desc(2, 2)).unwrap();
        let texels: Vec<f32> = (0..16).map(|i| i as f32).collect();
        b.write_texture(
            &TextureRegion::full(t, 0, 2, 2),
            bytemuck::cast_slice(&texels),
            32,
        )
        .unwrap();
        let buf = b.create_buffer("rb", 512, BufferUsage::READBACK).unwrap();
        b.copy_texture_to_buffer(&TextureRegion::full(t, 0, 2, 2), buf, 256)
            .unwrap();
        let token = b.read_buffer(buf).unwrap();
        assert_eq!(b.poll_readback(token), ReadbackStatus::Pending);
        b.submit();
        assert_eq!(b.poll_readback(token), ReadbackStatus::Pending);
        b.poll();
        let ReadbackStatus::Ready(bytes) = b.poll_readback(token) else {
            panic!("readback should be ready");
        };
        let row1: &[f32] = bytemuck::cast_slice(&bytes[256..288]);
        assert_eq!(row1, &texels[8..16]);
    }

    /// Unaligned row pitches are rejected like on a GPU.
    #[test]
    fn test_copy_requires_row_alignment() {
        let mut b = SoftwareBackend::new();
        let t = b.create_texture_2d(&upload_desc(2, 2)).unwrap();
        let buf = b.create_buffer("rb", 512, BufferUsage::READBACK).unwrap();
        let r = b.copy_texture_to_buffer(&TextureRegion::full(t, 0, 2, 2), buf, 32);
        assert!(matches!(r, Err(BackendError::SizeMismatch { .. })));
    }

    /// Raster-only capabilities refuse compute and storage textures.
    #[test]
    fn test_raster_only_refuses_compute() {
        let mut b = SoftwareBackend::new();
        let r = b.create_compute_pipeline(&ComputePipelineDesc {
            label: "c",
            shader: "",
            entry_point: "main",
            bind_group_layouts: &[],
        });
        assert!(matches!(r, Err(BackendError::Unsupported("compute"))));
        let s = b.create_storage_texture("s", 4, 4, TextureFormat::Rgba32Float, 1);
        assert!(matches!(s, Err(BackendError::Unsupported("storage textures"))));
    }

    /// Bind group entries are checked against the pipeline layout.
    #[test]
    fn test_bind_group_layout_validation() {
        let mut b = SoftwareBackend::with_capabilities(ApiName::Native, BackendCapabilities::FULL);
        let p = b
            .create_compute_pipeline(&ComputePipelineDesc {
                label: "c",
                shader: "",
                entry_point: "main",
                bind_group_layouts: &[&[BindingType::UniformBuffer]],
            })
            .unwrap();
        let s = b.create_sampler(&SamplerDesc {
            filter: FilterMode::Linear,
            address: AddressMode::ClampToEdge,
        });
        let bad = b.create_bind_group(p, 0, &[BindingResource::Sampler(s.unwrap())]);
        assert!(matches!(bad, Err(BackendError::LayoutMismatch { .. })));
        let buf = b.create_buffer("u", 16, BufferUsage::UNIFORM).unwrap();
        let bg = b.create_bind_group(p, 0, &[BindingResource::Buffer(buf)]).unwrap();
        b.dispatch_compute(p, &[bg], [2, 2, 1]).unwrap();
        assert_eq!(b.dispatches()[0].groups, [2, 2, 1]);
    }

    /// Failure injection marks submissions failed.
    #[test]
    fn test_failure_injection() {
        let mut b = SoftwareBackend::new();
        b.fail_next_submissions(1);
        let first = b.submit();
        let second = b.submit();
        b.poll();
        assert!(matches!(b.submission_status(first), SubmissionStatus::Failed(_)));
        assert_eq!(b.submission_status(second), SubmissionStatus::Complete);
    }

    /// Allocations beyond the memory limit fail.
    #[test]
    fn test_memory_limit() {
        let mut b = SoftwareBackend::new().with_memory_limit(1024);
        assert!(b.create_texture_2d(&upload_desc(8, 8)).is_ok());
        assert!(matches!(
            b.create_texture_2d(&upload_desc(8, 8)),
            Err(BackendError::OutOfMemory { .. })
        ));
    }
}
