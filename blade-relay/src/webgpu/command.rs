//! Command encoding for WebGPU backend
//!
//! The recorded command list is walked once per submission. Bindings are
//! accumulated per stage and turned into bind groups right before the draw or
//! dispatch that needs them.

use super::*;
use crate::{
    BindingTable, BufferPiece, Command, EncoderKind, IndexType, LoadOp, RenderPassDesc, StoreOp,
    Submission, SyncPoint,
};
use std::collections::BTreeSet;
use strum::EnumCount as _;
use wgpu::util::DeviceExt as _;

/// Uniform bindings need their size rounded to this.
const UNIFORM_ALIGNMENT: usize = 16;

/// Resources bound to one stage, indexed by slot.
#[derive(Default)]
struct StageBindings {
    buffers: HashMap<u32, (wgpu::Buffer, u64)>,
    textures: HashMap<u32, wgpu::TextureView>,
    samplers: HashMap<u32, wgpu::Sampler>,
}

enum Pass {
    None,
    Render(wgpu::RenderPass<'static>),
    Compute(wgpu::ComputePass<'static>),
    Transfer,
}

fn map_color_load(load: LoadOp) -> wgpu::LoadOp<wgpu::Color> {
    match load {
        LoadOp::Load => wgpu::LoadOp::Load,
        LoadOp::Clear([r, g, b, a]) => wgpu::LoadOp::Clear(wgpu::Color {
            r: r as f64,
            g: g as f64,
            b: b as f64,
            a: a as f64,
        }),
        LoadOp::DontCare => wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
    }
}

fn map_depth_load(load: LoadOp) -> wgpu::LoadOp<f32> {
    match load {
        LoadOp::Load => wgpu::LoadOp::Load,
        LoadOp::Clear([depth, ..]) => wgpu::LoadOp::Clear(depth),
        LoadOp::DontCare => wgpu::LoadOp::Clear(1.0),
    }
}

fn map_store(store: StoreOp) -> wgpu::StoreOp {
    match store {
        StoreOp::Store => wgpu::StoreOp::Store,
        StoreOp::Discard => wgpu::StoreOp::Discard,
    }
}

fn map_index_format(index_type: IndexType) -> wgpu::IndexFormat {
    match index_type {
        IndexType::U16 => wgpu::IndexFormat::Uint16,
        IndexType::U32 => wgpu::IndexFormat::Uint32,
    }
}

fn is_aligned(value: u64) -> bool {
    value % wgpu::COPY_BUFFER_ALIGNMENT == 0
}

//=============================================================================
// Translator
//=============================================================================

struct Translator<'a> {
    device: &'a WebGpuDevice,
    hub: &'a Hub,
    submission: &'a Submission<'a>,
    encoder: wgpu::CommandEncoder,
    pass: Pass,
    stages: [StageBindings; ShaderStage::COUNT],
    bindings_dirty: bool,
    render_pipeline: Option<RenderPipelineKey>,
    depth_stencil: Option<DepthStencilKey>,
    front_face: FrontFace,
    cull_mode: CullMode,
    realized: Option<(RealizedKey, wgpu::RenderPipeline)>,
    compute_pipeline: Option<ComputePipelineKey>,
    warned_fill_mode: bool,
}

impl<'a> Translator<'a> {
    fn new(device: &'a WebGpuDevice, hub: &'a Hub, submission: &'a Submission<'a>) -> Self {
        let encoder = device
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(submission.label),
            });
        Self {
            device,
            hub,
            submission,
            encoder,
            pass: Pass::None,
            stages: Default::default(),
            bindings_dirty: true,
            render_pipeline: None,
            depth_stencil: None,
            front_face: FrontFace::default(),
            cull_mode: CullMode::default(),
            realized: None,
            compute_pipeline: None,
            warned_fill_mode: false,
        }
    }

    fn dangling(&self, what: &str) {
        log::error!(
            "Submission {} references a destroyed {what}",
            self.submission.sequence
        );
    }

    fn buffer(&self, piece: &BufferPiece) -> Option<&'a wgpu::Buffer> {
        let hub = self.hub;
        match hub.buffers.get(piece.buffer.raw) {
            Some(entry) => Some(&entry.gpu),
            None => {
                self.dangling("buffer");
                None
            }
        }
    }

    fn begin_pass(&mut self, kind: EncoderKind, serial: u64, targets: Option<&RenderPassDesc>) {
        self.pass = Pass::None;
        self.stages = Default::default();
        self.bindings_dirty = true;
        self.realized = None;
        self.compute_pipeline = None;
        let label = format!("{}#{}", self.submission.label, serial);
        self.pass = match kind {
            EncoderKind::Render => {
                let Some(targets) = targets else {
                    log::error!("Render pass {label} has no targets");
                    return;
                };
                self.begin_render_pass(&label, targets)
            }
            EncoderKind::Compute => Pass::Compute(
                self.encoder
                    .begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some(label.as_str()),
                        timestamp_writes: None,
                    })
                    .forget_lifetime(),
            ),
            EncoderKind::Copy => Pass::Transfer,
        };
    }

    fn begin_render_pass(&mut self, label: &str, targets: &RenderPassDesc) -> Pass {
        let hub = self.hub;
        let mut color_attachments = Vec::with_capacity(targets.color_targets.len());
        for target in targets.color_targets.iter() {
            let Some(entry) = hub.textures.get(target.texture.raw) else {
                self.dangling("texture");
                continue;
            };
            color_attachments.push(Some(wgpu::RenderPassColorAttachment {
                view: &entry.view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: map_color_load(target.load),
                    store: map_store(target.store),
                },
            }));
        }
        let depth_stencil_attachment = targets.depth_target.as_ref().and_then(|target| {
            let entry = hub.textures.get(target.texture.raw)?;
            Some(wgpu::RenderPassDepthStencilAttachment {
                view: &entry.view,
                depth_ops: Some(wgpu::Operations {
                    load: map_depth_load(target.load),
                    store: map_store(target.store),
                }),
                stencil_ops: None,
            })
        });
        let pass = self
            .encoder
            .begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(label),
                color_attachments: &color_attachments,
                depth_stencil_attachment,
                ..Default::default()
            })
            .forget_lifetime();
        Pass::Render(pass)
    }

    fn bind_bytes(&mut self, stage: ShaderStage, slot: u32, range: &std::ops::Range<usize>) {
        let Some(data) = self.submission.plain_data.get(range.clone()) else {
            log::error!(
                "Submission {} reads inline data {:?} past {} bytes",
                self.submission.sequence,
                range,
                self.submission.plain_data.len()
            );
            return;
        };
        let mut contents = data.to_vec();
        contents.resize(contents.len().next_multiple_of(UNIFORM_ALIGNMENT).max(UNIFORM_ALIGNMENT), 0);
        let buffer = self
            .device
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("inline-bytes"),
                contents: &contents,
                usage: wgpu::BufferUsages::UNIFORM,
            });
        self.stages[stage.index()].buffers.insert(slot, (buffer, 0));
        self.bindings_dirty = true;
    }

    /// Builds the bind group of `group` from the resources bound to the
    /// stage that owns it.
    fn bind_group(
        &self,
        layout: &wgpu::BindGroupLayout,
        group: u32,
        slots: &[BindingSlot],
    ) -> Option<wgpu::BindGroup> {
        let stage = *BindingTable::STAGE_GROUPS.get(group as usize)?;
        let bindings = &self.stages[stage.index()];
        let mut entries = Vec::new();
        for slot in slots.iter().filter(|slot| slot.group == group) {
            let resource = match slot.kind {
                BindingKind::Texture => bindings
                    .textures
                    .get(&slot.binding)
                    .map(wgpu::BindingResource::TextureView),
                BindingKind::Sampler => bindings
                    .samplers
                    .get(&slot.binding)
                    .map(wgpu::BindingResource::Sampler),
                _ => bindings.buffers.get(&slot.binding).map(|(buffer, offset)| {
                    wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer,
                        offset: *offset,
                        size: None,
                    })
                }),
            };
            let Some(resource) = resource else {
                log::warn!(
                    "Nothing bound at {} slot {} ({:?}), skipping the work",
                    stage,
                    slot.binding,
                    slot.kind
                );
                return None;
            };
            entries.push(wgpu::BindGroupEntry {
                binding: slot.binding,
                resource,
            });
        }
        Some(
            self.device
                .device
                .create_bind_group(&wgpu::BindGroupDescriptor {
                    label: None,
                    layout,
                    entries: &entries,
                }),
        )
    }

    /// Every group up to the highest one used, gaps included.
    fn bind_groups(
        &self,
        slots: &[BindingSlot],
        layout: impl Fn(u32) -> wgpu::BindGroupLayout,
    ) -> Option<Vec<wgpu::BindGroup>> {
        let groups: BTreeSet<u32> = slots.iter().map(|slot| slot.group).collect();
        let Some(&last) = groups.last() else {
            return Some(Vec::new());
        };
        (0..=last)
            .map(|group| self.bind_group(&layout(group), group, slots))
            .collect()
    }

    /// Prepares the render pass for a draw. Returns `false` when the draw
    /// cannot be issued.
    fn prepare_draw(&mut self, primitive: PrimitiveType) -> bool {
        let Some(pipeline) = self.render_pipeline else {
            log::warn!("Draw without a render pipeline");
            return false;
        };
        let key = RealizedKey {
            pipeline,
            depth: self.depth_stencil,
            primitive,
            front_face: self.front_face,
            cull_mode: self.cull_mode,
        };
        let changed = self.realized.as_ref().map(|&(k, _)| k) != Some(key);
        if changed {
            let Some(raw) = self.device.realize_render_pipeline(self.hub, key) else {
                log::error!("Render pipeline {:?} is not available", pipeline);
                return false;
            };
            if let Pass::Render(ref mut pass) = self.pass {
                pass.set_pipeline(&raw);
            }
            self.realized = Some((key, raw));
            self.bindings_dirty = true;
        }
        if !self.bindings_dirty {
            return true;
        }
        let hub = self.hub;
        let Some(entry) = hub.render_pipelines.get(pipeline) else {
            self.dangling("render pipeline");
            return false;
        };
        let Some((_, ref raw)) = self.realized else {
            return false;
        };
        let Some(groups) = self.bind_groups(&entry.slots, |group| raw.get_bind_group_layout(group))
        else {
            return false;
        };
        let vertex = &self.stages[ShaderStage::Vertex.index()];
        let Pass::Render(ref mut pass) = self.pass else {
            log::error!("Draw outside of a render pass");
            return false;
        };
        for (index, group) in groups.iter().enumerate() {
            pass.set_bind_group(index as u32, group, &[]);
        }
        for (index, &(location, _)) in entry.vertex_buffers.iter().enumerate() {
            match vertex.buffers.get(&location) {
                Some((buffer, offset)) => pass.set_vertex_buffer(index as u32, buffer.slice(*offset..)),
                None => {
                    log::warn!("No vertex buffer for attribute {location}");
                    return false;
                }
            }
        }
        self.bindings_dirty = false;
        true
    }

    fn prepare_dispatch(&mut self) -> bool {
        let hub = self.hub;
        let Some(entry) = self
            .compute_pipeline
            .and_then(|pipeline| hub.compute_pipelines.get(pipeline))
        else {
            log::warn!("Dispatch without a compute pipeline");
            return false;
        };
        if !self.bindings_dirty {
            return true;
        }
        let Some(groups) = self.bind_groups(&entry.slots, |group| entry.raw.get_bind_group_layout(group))
        else {
            return false;
        };
        let Pass::Compute(ref mut pass) = self.pass else {
            log::error!("Dispatch outside of a compute pass");
            return false;
        };
        for (index, group) in groups.iter().enumerate() {
            pass.set_bind_group(index as u32, group, &[]);
        }
        self.bindings_dirty = false;
        true
    }

    fn transfer_allowed(&self) -> bool {
        match self.pass {
            Pass::Render(_) | Pass::Compute(_) => {
                log::error!("Transfer command inside a render or compute pass");
                false
            }
            Pass::None | Pass::Transfer => true,
        }
    }

    fn execute(&mut self, command: &Command) {
        match *command {
            Command::BeginPass {
                kind,
                serial,
                ref targets,
            } => self.begin_pass(kind, serial, targets.as_ref()),
            Command::EndPass => {
                self.pass = Pass::None;
            }
            Command::SetViewport(vp) => {
                if let Pass::Render(ref mut pass) = self.pass {
                    pass.set_viewport(vp.x, vp.y, vp.w, vp.h, vp.near, vp.far);
                }
            }
            Command::SetRenderPipeline(pipeline) => {
                self.render_pipeline = Some(pipeline.raw);
            }
            Command::SetDepthStencilState(state) => {
                self.depth_stencil = Some(state.raw);
            }
            Command::SetFrontFace(front_face) => self.front_face = front_face,
            Command::SetCullMode(cull_mode) => self.cull_mode = cull_mode,
            Command::SetFillMode(fill_mode) => {
                if fill_mode != crate::FillMode::Fill && !self.warned_fill_mode {
                    log::warn!("Line fill mode is not available, drawing filled");
                    self.warned_fill_mode = true;
                }
            }
            Command::SetBlendConstant([r, g, b, a]) => {
                if let Pass::Render(ref mut pass) = self.pass {
                    pass.set_blend_constant(wgpu::Color {
                        r: r as f64,
                        g: g as f64,
                        b: b as f64,
                        a: a as f64,
                    });
                }
            }
            Command::SetComputePipeline(pipeline) => {
                let hub = self.hub;
                let Some(entry) = hub.compute_pipelines.get(pipeline.raw) else {
                    self.dangling("compute pipeline");
                    return;
                };
                if let Pass::Compute(ref mut pass) = self.pass {
                    pass.set_pipeline(&entry.raw);
                }
                self.compute_pipeline = Some(pipeline.raw);
                self.bindings_dirty = true;
            }
            Command::SetBuffer {
                stage,
                slot,
                ref piece,
            } => {
                if let Some(buffer) = self.buffer(piece) {
                    self.stages[stage.index()]
                        .buffers
                        .insert(slot, (buffer.clone(), piece.offset));
                    self.bindings_dirty = true;
                }
            }
            Command::SetBytes {
                stage,
                slot,
                ref range,
            } => self.bind_bytes(stage, slot, range),
            Command::SetTexture {
                stage,
                slot,
                texture,
            } => match self.hub.textures.get(texture.raw) {
                Some(entry) => {
                    self.stages[stage.index()]
                        .textures
                        .insert(slot, entry.view.clone());
                    self.bindings_dirty = true;
                }
                None => self.dangling("texture"),
            },
            Command::SetSampler {
                stage,
                slot,
                sampler,
            } => match self.hub.samplers.get(sampler.raw) {
                Some(raw) => {
                    self.stages[stage.index()].samplers.insert(slot, raw.clone());
                    self.bindings_dirty = true;
                }
                None => self.dangling("sampler"),
            },
            Command::Draw {
                primitive,
                vertex_start,
                vertex_count,
                instance_count,
                base_instance,
            } => {
                if self.prepare_draw(primitive) {
                    if let Pass::Render(ref mut pass) = self.pass {
                        pass.draw(
                            vertex_start..vertex_start + vertex_count,
                            base_instance..base_instance + instance_count,
                        );
                    }
                }
            }
            Command::DrawIndexed {
                primitive,
                ref index,
                index_type,
                index_count,
                base_vertex,
                instance_count,
                base_instance,
            } => {
                let Some(buffer) = self.buffer(index) else {
                    return;
                };
                if self.prepare_draw(primitive) {
                    if let Pass::Render(ref mut pass) = self.pass {
                        pass.set_index_buffer(
                            buffer.slice(index.offset..),
                            map_index_format(index_type),
                        );
                        pass.draw_indexed(
                            0..index_count,
                            base_vertex,
                            base_instance..base_instance + instance_count,
                        );
                    }
                }
            }
            Command::Dispatch { groups, group_size } => {
                if self.prepare_dispatch() {
                    if let Pass::Compute(ref mut pass) = self.pass {
                        log::trace!("Dispatch {:?} x {:?}", groups, group_size);
                        pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
                    }
                }
            }
            Command::CopyBufferToBuffer { src, dst, size } => {
                if !self.transfer_allowed() {
                    return;
                }
                let (Some(from), Some(to)) = (self.buffer(&src), self.buffer(&dst)) else {
                    return;
                };
                if !(is_aligned(src.offset) && is_aligned(dst.offset) && is_aligned(size)) {
                    log::error!("Unaligned buffer copy of {size} bytes is skipped");
                    return;
                }
                self.encoder
                    .copy_buffer_to_buffer(from, src.offset, to, dst.offset, size);
            }
            Command::FillBuffer { dst, size, value } => {
                if !self.transfer_allowed() {
                    return;
                }
                let Some(to) = self.buffer(&dst) else {
                    return;
                };
                if !(is_aligned(dst.offset) && is_aligned(size)) {
                    log::error!("Unaligned buffer fill of {size} bytes is skipped");
                    return;
                }
                if value == 0 {
                    self.encoder.clear_buffer(to, dst.offset, Some(size));
                } else {
                    let pattern = self
                        .device
                        .device
                        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                            label: Some("fill-pattern"),
                            contents: &vec![value; size as usize],
                            usage: wgpu::BufferUsages::COPY_SRC,
                        });
                    self.encoder
                        .copy_buffer_to_buffer(&pattern, 0, to, dst.offset, size);
                }
            }
            // One wgpu queue executes submissions in order, which already
            // satisfies every recorded dependency.
            Command::WaitForEvent { value } => log::trace!("Wait for event {value}"),
            Command::SignalEvent { value } => log::trace!("Signal event {value}"),
            Command::WaitForQueue {
                recorder,
                queue,
                submission,
            } => log::trace!("Wait for {queue} submission {submission} of recorder {recorder}"),
        }
    }

    fn finish(mut self) -> wgpu::CommandBuffer {
        self.pass = Pass::None;
        self.encoder.finish()
    }
}

//=============================================================================
// CommandDevice Implementation
//=============================================================================

#[hidden_trait::expose]
impl crate::traits::CommandDevice for WebGpuDevice {
    fn create_command_buffer(&self) -> CommandBufferKey {
        self.hub.write().unwrap().command_buffers.insert(())
    }

    fn destroy_command_buffer(&self, raw: CommandBufferKey) {
        if self.hub.write().unwrap().command_buffers.remove(raw).is_none() {
            log::warn!("Destroying an unknown command buffer {:?}", raw);
        }
    }

    fn submit(&self, submission: Submission, on_complete: CompletionHandler) {
        profiling::scope!("webgpu submit");
        log::trace!(
            "Submitting '{}' ({} commands) on {}",
            submission.label,
            submission.commands.len(),
            submission.queue
        );
        let raw = {
            let hub = self.hub.read().unwrap();
            let mut translator = Translator::new(self, &hub, &submission);
            for command in submission.commands {
                translator.execute(command);
            }
            translator.finish()
        };
        self.queue.submit(Some(raw));
        let sequence = submission.sequence;
        self.completions.schedule(sequence);
        let completions = Arc::clone(&self.completions);
        self.queue.on_submitted_work_done(move || {
            on_complete();
            completions.complete(sequence);
        });
    }

    fn wait_until_scheduled(&self, sync_point: &SyncPoint) -> bool {
        // `Queue::submit` returns once the work is queued
        self.completions.is_scheduled(sync_point.sequence)
    }

    fn wait_for(&self, sync_point: &SyncPoint, timeout_ms: u32) -> bool {
        let sequence = sync_point.sequence;
        if self.completions.contains(sequence) {
            return true;
        }
        self.poll_until(Duration::from_millis(timeout_ms as u64), |slice| {
            self.completions.wait(sequence, slice);
            self.completions.contains(sequence)
        })
    }
}
