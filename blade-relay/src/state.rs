//! Per-thread recording state.
//!
//! Setters only record what the caller wants bound and which parts of the
//! state changed. Nothing reaches a command buffer until
//! [`Context::commit_state`] emits the pending deltas into the render encoder
//! in use, which lets redundant bindings between draws coalesce.

use crate::{
    binding::{BindingKind, BindingTable},
    gs::GsState,
    queue::LogicalQueue,
    BlendState, BufferPiece, ColorWrites, ComputePipeline, Context, ContractViolation, CullMode,
    DepthState, Device, EncoderKind, FillMode, FrontFace, Function, IndexType, MultisampleState,
    PrimitiveType, QueueId, RenderPipeline, Sampler, ShaderStage, Texture, TextureFormat,
    VertexElement, VertexLayout,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use strum::{EnumCount as _, IntoEnumIterator as _};

/// Part of the recording state that changed since it was last emitted.
#[derive(
    Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, strum::EnumIter, strum::EnumCount,
)]
pub enum StateDelta {
    DrawTarget,
    VertexLayout,
    VertexBuffers,
    VertexUniforms,
    FragmentUniforms,
    IndexBuffer,
    Textures,
    Samplers,
    CullModeWinding,
    FillMode,
    BlendConstant,
}

#[derive(Clone, Debug)]
pub(crate) struct ShadingProgram {
    pub label: String,
    pub vertex: Function,
    pub fragment: Option<Function>,
    pub bindings: Arc<BindingTable>,
    /// The vertex stage fetches its own inputs, vertex attributes are ignored.
    pub manual_vertex_assembly: bool,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct BoundBuffer {
    pub piece: BufferPiece,
    /// Not emitted into the current encoder yet.
    pub modified: bool,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct BoundTexture {
    pub texture: Option<Texture>,
    pub array: bool,
}

/// Loose uniforms of one stage, uploaded as inline bytes.
#[derive(Clone, Debug, Default)]
pub(crate) struct UniformStaging {
    pub slot: u32,
    pub data: Vec<u8>,
}

/// Fixed-function state that is either baked into pipeline objects or set
/// directly on the render encoder.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct RasterState {
    pub front_face: FrontFace,
    pub cull_mode: CullMode,
    pub fill_mode: FillMode,
    pub blend: Option<BlendState>,
    pub blend_constant: [f32; 4],
    pub write_mask: ColorWrites,
    pub depth: DepthState,
    pub multisample: MultisampleState,
    /// Overrides the formats of the render pass attachments.
    pub color_format: Option<TextureFormat>,
    pub depth_format: Option<TextureFormat>,
}

/// Index buffer derived from another buffer, cached until the source changes.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RemappedIndices {
    pub source: BufferPiece,
    pub count: u32,
    pub buffer: crate::Buffer,
}

/// Everything a recording thread accumulates between commits.
pub struct RecordingState {
    pub(crate) recorder: u64,
    pub(crate) queues: [LogicalQueue; QueueId::COUNT],
    pub(crate) current_queue: QueueId,
    pub(crate) pending: BTreeSet<StateDelta>,
    /// Highest event value any queue of this state waits for.
    pub(crate) highest_expected_event: u64,
    pub(crate) program: Option<ShadingProgram>,
    pub(crate) vertex_layout: VertexLayout,
    pub(crate) buffers: BTreeMap<(ShaderStage, u32), BoundBuffer>,
    pub(crate) textures: BTreeMap<(ShaderStage, u32), BoundTexture>,
    pub(crate) samplers: BTreeMap<(ShaderStage, u32), Option<Sampler>>,
    pub(crate) uniforms: [UniformStaging; ShaderStage::COUNT],
    pub(crate) index_buffer: Option<(BufferPiece, IndexType)>,
    pub(crate) raster: RasterState,
    pub(crate) gs: GsState,
    pub(crate) quad_indices: Option<RemappedIndices>,
    pub(crate) point_indices: Option<crate::Buffer>,
}

impl RecordingState {
    pub(crate) fn new(recorder: u64) -> Self {
        Self {
            recorder,
            queues: [
                LogicalQueue::new(QueueId::Default),
                LogicalQueue::new(QueueId::AuxiliaryCompute),
                LogicalQueue::new(QueueId::Resource),
            ],
            current_queue: QueueId::Default,
            pending: StateDelta::iter().collect(),
            highest_expected_event: 0,
            program: None,
            vertex_layout: VertexLayout::default(),
            buffers: BTreeMap::new(),
            textures: BTreeMap::new(),
            samplers: BTreeMap::new(),
            uniforms: Default::default(),
            index_buffer: None,
            raster: RasterState::default(),
            gs: GsState::default(),
            quad_indices: None,
            point_indices: None,
        }
    }

    pub fn recorder(&self) -> u64 {
        self.recorder
    }

    pub fn queue(&self, id: QueueId) -> &LogicalQueue {
        &self.queues[id.index()]
    }

    pub fn queue_mut(&mut self, id: QueueId) -> &mut LogicalQueue {
        &mut self.queues[id.index()]
    }

    /// Queue of the encoder that was requested last.
    pub fn current_queue(&self) -> QueueId {
        self.current_queue
    }

    pub fn is_pending(&self, delta: StateDelta) -> bool {
        self.pending.contains(&delta)
    }

    /// Marks everything as changed, as a new encoder knows nothing of what
    /// was bound before.
    pub(crate) fn invalidate_bindings(&mut self) {
        self.pending.extend(StateDelta::iter());
        for bound in self.buffers.values_mut() {
            bound.modified = true;
        }
    }

    pub fn dirty_draw_targets(&mut self) {
        self.pending.insert(StateDelta::DrawTarget);
    }

    /// Color and depth formats the render pipeline on `queue` has to match.
    pub(crate) fn attachment_formats(
        &self,
        queue: QueueId,
    ) -> (Vec<TextureFormat>, Option<TextureFormat>) {
        let pass = self.queue(queue).render_pass.as_ref();
        let colors = match self.raster.color_format {
            Some(format) => vec![format],
            None => pass.map_or(Vec::new(), |pass| {
                pass.color_targets
                    .iter()
                    .map(|rt| rt.texture.format)
                    .collect()
            }),
        };
        let depth = self.raster.depth_format.or_else(|| {
            pass.and_then(|pass| pass.depth_target.as_ref())
                .map(|rt| rt.texture.format)
        });
        (colors, depth)
    }

    fn resolve(
        &self,
        name: &str,
        stage: ShaderStage,
    ) -> Result<(u32, BindingKind), ContractViolation> {
        self.program
            .as_ref()
            .and_then(|program| program.bindings.resolve(name, stage))
            .map(|location| (location.slot, location.kind))
            .ok_or_else(|| ContractViolation::UnresolvedBinding {
                name: name.to_string(),
                stage,
            })
    }

    fn resolve_kind(
        &self,
        name: &str,
        stage: ShaderStage,
        kind: BindingKind,
    ) -> Result<u32, ContractViolation> {
        match self.resolve(name, stage)? {
            (slot, found) if found == kind => Ok(slot),
            _ => Err(ContractViolation::UnresolvedBinding {
                name: name.to_string(),
                stage,
            }),
        }
    }

    //=========================================================================
    // Programs
    //=========================================================================

    /// Sets the functions of the next draws. Any ComputeGS program is
    /// detached and has to be set again afterwards.
    pub fn set_shading_programs(
        &mut self,
        label: &str,
        vertex: Function,
        fragment: Option<Function>,
        bindings: Arc<BindingTable>,
        manual_vertex_assembly: bool,
    ) {
        for stage in [ShaderStage::Vertex, ShaderStage::Fragment] {
            let staging = &mut self.uniforms[stage.index()];
            match bindings.uniform_block(stage) {
                Some(block) => {
                    staging.slot = block.slot;
                    staging.data.resize(block.size as usize, 0);
                }
                None => staging.data.clear(),
            }
        }
        self.program = Some(ShadingProgram {
            label: label.to_string(),
            vertex,
            fragment,
            bindings,
            manual_vertex_assembly,
        });
        self.gs.function = None;
        self.pending.insert(StateDelta::VertexUniforms);
        self.pending.insert(StateDelta::FragmentUniforms);
    }

    /// Attaches a compute function that expands geometry ahead of the
    /// vertex stage on the auxiliary compute queue.
    pub fn set_compute_gs_program(&mut self, function: Function) -> Result<(), ContractViolation> {
        let program = self
            .program
            .as_ref()
            .ok_or(ContractViolation::NoShadingProgram)?;
        if !program.manual_vertex_assembly {
            return Err(ContractViolation::GsWithoutManualVertexAssembly);
        }
        self.gs.function = Some(function);
        Ok(())
    }

    pub fn compute_gs_program(&self) -> Option<Function> {
        self.gs.function
    }

    //=========================================================================
    // Bindings
    //=========================================================================

    /// Describes how the vertex attribute `name` is fetched. Ignored with
    /// manual vertex assembly.
    pub fn set_vertex_attribute(
        &mut self,
        name: &str,
        element: VertexElement,
    ) -> Result<(), ContractViolation> {
        if self
            .program
            .as_ref()
            .is_some_and(|program| program.manual_vertex_assembly)
        {
            return Ok(());
        }
        let location = self.resolve_kind(name, ShaderStage::Vertex, BindingKind::VertexAttribute)?;
        self.vertex_layout.set(location, element);
        self.pending.insert(StateDelta::VertexLayout);
        Ok(())
    }

    /// Copies `data` into the uniform block member `name`. Data beyond the
    /// member size is dropped.
    pub fn set_uniform(
        &mut self,
        name: &str,
        stage: ShaderStage,
        data: &[u8],
    ) -> Result<(), ContractViolation> {
        if data.is_empty() {
            return Ok(());
        }
        let (slot, kind) = self.resolve(name, stage)?;
        let BindingKind::Uniform { offset, size } = kind else {
            return Err(ContractViolation::UnresolvedBinding {
                name: name.to_string(),
                stage,
            });
        };
        let staging = &mut self.uniforms[stage.index()];
        if staging.data.is_empty() {
            staging.slot = slot;
        }
        let start = offset as usize;
        let len = data.len().min(size as usize);
        if staging.data.len() < start + len {
            staging.data.resize(start + len, 0);
        }
        staging.data[start..start + len].copy_from_slice(&data[..len]);
        self.pending.insert(match stage {
            ShaderStage::Fragment => StateDelta::FragmentUniforms,
            ShaderStage::Vertex | ShaderStage::Compute => StateDelta::VertexUniforms,
        });
        Ok(())
    }

    pub fn set_uniform_value<T: bytemuck::Pod>(
        &mut self,
        name: &str,
        stage: ShaderStage,
        value: &T,
    ) -> Result<(), ContractViolation> {
        self.set_uniform(name, stage, bytemuck::bytes_of(value))
    }

    /// Places the loose uniforms of `stage` at `slot`, sized `size` bytes.
    pub fn set_uniform_block(&mut self, stage: ShaderStage, slot: u32, size: u32) {
        let staging = &mut self.uniforms[stage.index()];
        staging.slot = slot;
        staging.data.resize(size as usize, 0);
        self.pending.insert(match stage {
            ShaderStage::Fragment => StateDelta::FragmentUniforms,
            ShaderStage::Vertex | ShaderStage::Compute => StateDelta::VertexUniforms,
        });
    }

    pub fn set_buffer(
        &mut self,
        name: &str,
        stage: ShaderStage,
        piece: BufferPiece,
    ) -> Result<(), ContractViolation> {
        let slot = self.resolve_kind(name, stage, BindingKind::Buffer)?;
        self.bind_buffer(stage, slot, piece);
        Ok(())
    }

    /// Binds a buffer by slot, bypassing the binding table.
    pub fn bind_buffer(&mut self, stage: ShaderStage, slot: u32, piece: BufferPiece) {
        self.buffers.insert(
            (stage, slot),
            BoundBuffer {
                piece,
                modified: true,
            },
        );
        self.pending.insert(StateDelta::VertexBuffers);
    }

    pub fn set_index_buffer(&mut self, piece: BufferPiece, index_type: IndexType) {
        self.index_buffer = Some((piece, index_type));
        self.pending.insert(StateDelta::IndexBuffer);
    }

    /// Binds a texture by name. `None` is replaced by a black dummy texture
    /// of the matching dimension when the state is committed.
    pub fn set_texture(
        &mut self,
        name: &str,
        stage: ShaderStage,
        texture: Option<Texture>,
        array: bool,
    ) -> Result<(), ContractViolation> {
        let slot = self.resolve_kind(name, stage, BindingKind::Texture)?;
        self.bind_texture(stage, slot, texture, array);
        Ok(())
    }

    pub fn bind_texture(
        &mut self,
        stage: ShaderStage,
        slot: u32,
        texture: Option<Texture>,
        array: bool,
    ) {
        self.textures
            .insert((stage, slot), BoundTexture { texture, array });
        self.pending.insert(StateDelta::Textures);
    }

    /// Binds a sampler by name. `None` is replaced by the default sampler.
    pub fn set_sampler(
        &mut self,
        name: &str,
        stage: ShaderStage,
        sampler: Option<Sampler>,
    ) -> Result<(), ContractViolation> {
        let slot = self.resolve_kind(name, stage, BindingKind::Sampler)?;
        self.bind_sampler(stage, slot, sampler);
        Ok(())
    }

    pub fn bind_sampler(&mut self, stage: ShaderStage, slot: u32, sampler: Option<Sampler>) {
        self.samplers.insert((stage, slot), sampler);
        self.pending.insert(StateDelta::Samplers);
    }

    /// Drops every binding and forgets the pipeline objects bound on the
    /// current queue.
    pub fn clear_render_encoder_state(&mut self) {
        self.vertex_layout.clear();
        self.index_buffer = None;
        self.buffers.clear();
        self.textures.clear();
        self.samplers.clear();
        let bound = &mut self.queues[self.current_queue.index()].bound;
        bound.render_hash = 0;
        bound.render = None;
        bound.depth_hash = 0;
        bound.depth = None;
        self.pending.extend(StateDelta::iter());
    }

    //=========================================================================
    // Raster State
    //=========================================================================

    pub fn set_front_face(&mut self, front_face: FrontFace) {
        self.raster.front_face = front_face;
        self.pending.insert(StateDelta::CullModeWinding);
    }

    pub fn set_cull_mode(&mut self, cull_mode: CullMode) {
        self.raster.cull_mode = cull_mode;
        self.pending.insert(StateDelta::CullModeWinding);
    }

    pub fn set_fill_mode(&mut self, fill_mode: FillMode) {
        self.raster.fill_mode = fill_mode;
        self.pending.insert(StateDelta::FillMode);
    }

    /// `None` disables blending.
    pub fn set_blend(&mut self, blend: Option<BlendState>) {
        self.raster.blend = blend;
    }

    pub fn set_blend_constant(&mut self, color: [f32; 4]) {
        self.raster.blend_constant = color;
        self.pending.insert(StateDelta::BlendConstant);
    }

    pub fn set_write_mask(&mut self, write_mask: ColorWrites) {
        self.raster.write_mask = write_mask;
    }

    pub fn set_depth_state(&mut self, depth: DepthState) {
        self.raster.depth = depth;
    }

    pub fn set_multisample(&mut self, multisample: MultisampleState) {
        self.raster.multisample = multisample;
    }

    /// Overrides the attachment formats pipelines are built for. `None`
    /// falls back to the formats of the render pass.
    pub fn set_output_formats(
        &mut self,
        color: Option<TextureFormat>,
        depth: Option<TextureFormat>,
    ) {
        self.raster.color_format = color;
        self.raster.depth_format = depth;
        self.dirty_draw_targets();
    }

    /// Resets the per-frame ComputeGS bookkeeping. An open batch carries over.
    pub fn start_frame(&mut self) {
        self.current_queue = QueueId::Default;
        if !self.gs.has_open_batch {
            self.gs.reset();
        }
    }
}

fn pair_mut<T>(items: &mut [T], first: usize, second: usize) -> Option<(&mut T, &mut T)> {
    if first < second {
        let (head, tail) = items.split_at_mut(second);
        Some((&mut head[first], &mut tail[0]))
    } else if second < first {
        let (head, tail) = items.split_at_mut(first);
        Some((&mut tail[0], &mut head[second]))
    } else {
        None
    }
}

//=============================================================================
// Context Operations
//=============================================================================

impl<D: Device> Context<D> {
    pub fn create_recording_state(&self) -> RecordingState {
        let recorder = self
            .next_recorder
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        RecordingState::new(recorder)
    }

    /// Returns the buffers a recording state owns to the pool and recycles
    /// command buffers that were never committed.
    pub fn retire_recording_state(
        &self,
        mut state: RecordingState,
    ) -> Result<(), ContractViolation> {
        if state.gs.has_open_batch {
            log::warn!(
                "Retiring recording state {} with an open ComputeGS batch",
                state.recorder
            );
        }
        self.scheduler
            .lock()
            .unwrap()
            .retire_recorder(state.recorder);
        for wq in state.queues.iter_mut() {
            if let Some(cb) = wq.command_buffer.take() {
                log::debug!("Dropping uncommitted work of {}", wq.id());
                self.recycle_command_buffer(cb);
            }
        }
        let mut owned = std::mem::take(&mut state.gs.buffers);
        owned.extend(state.quad_indices.take().map(|remap| remap.buffer));
        owned.extend(state.point_indices.take());
        for buffer in owned {
            self.release_buffer(buffer)?;
        }
        Ok(())
    }

    /// Emits every pending delta into the render encoder in use on the
    /// current queue. Returns `false` when the pipeline objects could not be
    /// created; the draw should be skipped and the deltas stay pending.
    #[profiling::function]
    pub fn commit_state(&self, state: &mut RecordingState) -> Result<bool, ContractViolation> {
        let queue = state.current_queue;
        let gs_function = state.gs.function;
        {
            let wq = state.queue(queue);
            if wq.open_kind() != Some(EncoderKind::Render) || !wq.in_use {
                return Err(ContractViolation::WrongEncoder {
                    queue,
                    expected: EncoderKind::Render,
                    found: wq.open_kind(),
                });
            }
        }
        if state.program.is_none() {
            return Err(ContractViolation::NoShadingProgram);
        }
        if gs_function.is_none() {
            let compute_slot = state
                .buffers
                .iter()
                .find(|&(&(stage, _), bound)| stage == ShaderStage::Compute && bound.modified)
                .map(|(&(_, slot), _)| slot);
            if let Some(slot) = compute_slot {
                return Err(ContractViolation::ComputeBindingWithoutGs { slot });
            }
        }

        // A fresh GS encoder invalidates the bindings, so it has to be opened
        // before the pending deltas are taken.
        if gs_function.is_some() {
            self.get_encoder(state, QueueId::AuxiliaryCompute, EncoderKind::Compute)?;
            state.current_queue = queue;
        }
        let pending = std::mem::take(&mut state.pending);

        let pipeline = match self.bind_render_pipeline(state, queue, &pending) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                state.pending = pending;
                return Err(e);
            }
        };
        let depth = self.bind_depth_stencil_state(state, queue);
        if pipeline.is_none() || depth.is_none() {
            state.pending = pending;
            if gs_function.is_some() {
                self.release_encoder(state, QueueId::AuxiliaryCompute, false)?;
            }
            return Ok(false);
        }

        let immutable_mask = self.emit_bindings(state, queue, &pending)?;

        if let Some(function) = gs_function {
            let buffer_count = state.buffers.len() as u32;
            self.set_compute_encoder_state(
                state,
                function,
                buffer_count,
                immutable_mask,
                "GS Compute phase",
                QueueId::AuxiliaryCompute,
            )?;
            self.release_encoder(state, QueueId::AuxiliaryCompute, false)?;
        }
        Ok(true)
    }

    /// Records the bindings into the render encoder and mirrors vertex
    /// stage resources into the ComputeGS encoder. Returns the mask of
    /// buffer slots the ComputeGS phase only reads.
    fn emit_bindings(
        &self,
        state: &mut RecordingState,
        queue: QueueId,
        pending: &BTreeSet<StateDelta>,
    ) -> Result<u64, ContractViolation> {
        let RecordingState {
            ref mut queues,
            ref mut buffers,
            ref textures,
            ref samplers,
            ref uniforms,
            ref raster,
            ref gs,
            ..
        } = *state;
        let (render_queue, gs_queue) = if gs.function.is_some() {
            match pair_mut(queues, queue.index(), QueueId::AuxiliaryCompute.index()) {
                Some((render_queue, gs_queue)) => (render_queue, Some(gs_queue)),
                None => {
                    return Err(ContractViolation::EncoderInUse {
                        queue: QueueId::AuxiliaryCompute,
                    })
                }
            }
        } else {
            (&mut queues[queue.index()], None)
        };
        let mut render = render_queue
            .command_buffer
            .as_mut()
            .ok_or(ContractViolation::MissingCommandBuffer { queue })?
            .pass::<RenderPipeline>();
        let mut mirror = match gs_queue {
            Some(wq) => Some(
                wq.command_buffer
                    .as_mut()
                    .ok_or(ContractViolation::MissingCommandBuffer {
                        queue: QueueId::AuxiliaryCompute,
                    })?
                    .pass::<ComputePipeline>(),
            ),
            None => None,
        };
        let mut immutable_mask = 0u64;
        let mut protect = |slot: u32| {
            if slot < u64::BITS {
                immutable_mask |= 1 << slot;
            }
        };

        if pending.contains(&StateDelta::CullModeWinding) {
            render.set_front_face(raster.front_face);
            render.set_cull_mode(raster.cull_mode);
        }
        if pending.contains(&StateDelta::FillMode) {
            render.set_fill_mode(raster.fill_mode);
        }
        if pending.contains(&StateDelta::BlendConstant) {
            render.set_blend_constant(raster.blend_constant);
        }

        for (&(stage, slot), bound) in buffers.iter_mut() {
            if !bound.modified {
                continue;
            }
            match stage {
                ShaderStage::Vertex => {
                    if let Some(ref mut compute) = mirror {
                        compute.set_buffer(slot, bound.piece);
                        protect(slot);
                    }
                    render.set_buffer(stage, slot, bound.piece);
                }
                ShaderStage::Fragment => render.set_buffer(stage, slot, bound.piece),
                ShaderStage::Compute => match mirror {
                    Some(ref mut compute) => {
                        compute.set_buffer(slot, bound.piece);
                        protect(slot);
                    }
                    None => return Err(ContractViolation::ComputeBindingWithoutGs { slot }),
                },
            }
            bound.modified = false;
        }

        // Vertex uniforms go out with every commit.
        let vertex_uniforms = &uniforms[ShaderStage::Vertex.index()];
        if !vertex_uniforms.data.is_empty() {
            if let Some(ref mut compute) = mirror {
                compute.set_bytes(vertex_uniforms.slot, &vertex_uniforms.data);
                protect(vertex_uniforms.slot);
            }
            render.set_bytes(
                ShaderStage::Vertex,
                vertex_uniforms.slot,
                &vertex_uniforms.data,
            );
        }
        let fragment_uniforms = &uniforms[ShaderStage::Fragment.index()];
        if pending.contains(&StateDelta::FragmentUniforms) && !fragment_uniforms.data.is_empty() {
            render.set_bytes(
                ShaderStage::Fragment,
                fragment_uniforms.slot,
                &fragment_uniforms.data,
            );
        }

        if pending.contains(&StateDelta::Textures) {
            for (&(stage, slot), bound) in textures.iter() {
                let texture = match bound.texture {
                    Some(texture) => texture,
                    None => self.dummies.texture(bound.array),
                };
                match stage {
                    ShaderStage::Vertex => {
                        if let Some(ref mut compute) = mirror {
                            compute.set_texture(slot, texture);
                        }
                        render.set_texture(stage, slot, texture);
                    }
                    ShaderStage::Fragment => render.set_texture(stage, slot, texture),
                    ShaderStage::Compute => {
                        if let Some(ref mut compute) = mirror {
                            compute.set_texture(slot, texture);
                        }
                    }
                }
            }
        }
        if pending.contains(&StateDelta::Samplers) {
            for (&(stage, slot), &sampler) in samplers.iter() {
                let sampler = match sampler {
                    Some(sampler) => sampler,
                    None => self.dummies.sampler(),
                };
                match stage {
                    ShaderStage::Vertex => {
                        if let Some(ref mut compute) = mirror {
                            compute.set_sampler(slot, sampler);
                        }
                        render.set_sampler(stage, slot, sampler);
                    }
                    ShaderStage::Fragment => render.set_sampler(stage, slot, sampler),
                    ShaderStage::Compute => {
                        if let Some(ref mut compute) = mirror {
                            compute.set_sampler(slot, sampler);
                        }
                    }
                }
            }
        }
        Ok(immutable_mask)
    }

    /// Draws with the state last committed on the current queue.
    pub fn draw(
        &self,
        state: &mut RecordingState,
        primitive: PrimitiveType,
        vertex_start: u32,
        vertex_count: u32,
        instance_count: u32,
        base_instance: u32,
    ) -> Result<(), ContractViolation> {
        let queue = state.current_queue;
        state.render_encoder(queue)?.draw(
            primitive,
            vertex_start,
            vertex_count,
            instance_count,
            base_instance,
        );
        self.accounting.count_primitives(
            primitive.primitive_count(vertex_count) as u64 * instance_count.max(1) as u64,
        );
        Ok(())
    }

    /// Draws with the bound index buffer, starting at index `first_index`.
    pub fn draw_indexed(
        &self,
        state: &mut RecordingState,
        primitive: PrimitiveType,
        index_count: u32,
        first_index: u32,
        base_vertex: i32,
        instance_count: u32,
        base_instance: u32,
    ) -> Result<(), ContractViolation> {
        let (piece, index_type) = state
            .index_buffer
            .ok_or(ContractViolation::MissingIndexBuffer)?;
        let index = piece
            .buffer
            .at(piece.offset + first_index as u64 * index_type.size());
        let queue = state.current_queue;
        state.render_encoder(queue)?.draw_indexed(
            primitive,
            index,
            index_type,
            index_count,
            base_vertex,
            instance_count,
            base_instance,
        );
        self.accounting.count_primitives(
            primitive.primitive_count(index_count) as u64 * instance_count.max(1) as u64,
        );
        Ok(())
    }
}
