//! Deferred command recording.
//!
//! Commands are recorded into a [`CommandBuffer`] and replayed by the device
//! at submit time. Inline data (uniform bytes) lives in a side buffer that the
//! commands reference by range.

use crate::{
    BufferPiece, CommandBufferKey, ComputePipeline, CullMode, DepthStencilState, EncoderKind,
    FillMode, FrontFace, IndexType, PrimitiveType, QueueId, RenderPassDesc, RenderPipeline,
    Sampler, ShaderStage, Texture, Viewport,
};
use std::{marker::PhantomData, ops::Range};

//=============================================================================
// Command Types
//=============================================================================

/// Recorded commands - executed at submit time
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    BeginPass {
        kind: EncoderKind,
        /// Identifies the pass object within the command buffer.
        serial: u64,
        targets: Option<RenderPassDesc>,
    },
    EndPass,
    SetViewport(Viewport),
    SetRenderPipeline(RenderPipeline),
    SetDepthStencilState(DepthStencilState),
    SetComputePipeline(ComputePipeline),
    SetFrontFace(FrontFace),
    SetCullMode(CullMode),
    SetFillMode(FillMode),
    SetBlendConstant([f32; 4]),
    SetBuffer {
        stage: ShaderStage,
        slot: u32,
        piece: BufferPiece,
    },
    SetBytes {
        stage: ShaderStage,
        slot: u32,
        range: Range<usize>,
    },
    SetTexture {
        stage: ShaderStage,
        slot: u32,
        texture: Texture,
    },
    SetSampler {
        stage: ShaderStage,
        slot: u32,
        sampler: Sampler,
    },
    Draw {
        primitive: PrimitiveType,
        vertex_start: u32,
        vertex_count: u32,
        instance_count: u32,
        base_instance: u32,
    },
    DrawIndexed {
        primitive: PrimitiveType,
        index: BufferPiece,
        index_type: IndexType,
        index_count: u32,
        base_vertex: i32,
        instance_count: u32,
        base_instance: u32,
    },
    Dispatch {
        groups: [u32; 3],
        group_size: [u32; 3],
    },
    CopyBufferToBuffer {
        src: BufferPiece,
        dst: BufferPiece,
        size: u64,
    },
    FillBuffer {
        dst: BufferPiece,
        size: u64,
        value: u8,
    },
    /// Wait until the given event value has been signalled.
    WaitForEvent { value: u64 },
    /// Wait until the given submission of another queue has finished.
    WaitForQueue {
        recorder: u64,
        queue: QueueId,
        submission: u64,
    },
    SignalEvent { value: u64 },
}

//=============================================================================
// Command Buffer
//=============================================================================

pub struct CommandBuffer {
    pub(crate) raw: CommandBufferKey,
    pub(crate) label: String,
    pub(crate) commands: Vec<Command>,
    pub(crate) plain_data: Vec<u8>,
    /// Frame whose timer expects this buffer's completion.
    pub(crate) timer_frame: Option<u64>,
}

impl CommandBuffer {
    pub(crate) fn new(raw: CommandBufferKey) -> Self {
        Self {
            raw,
            label: String::new(),
            commands: Vec::new(),
            plain_data: Vec::new(),
            timer_frame: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn plain_data(&self) -> &[u8] {
        &self.plain_data
    }

    /// Clears the recorded contents, keeping the allocations.
    pub(crate) fn reset(&mut self) {
        self.label.clear();
        self.commands.clear();
        self.plain_data.clear();
        self.timer_frame = None;
    }

    pub(crate) fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub(crate) fn pass<P>(&mut self) -> PassEncoder<'_, P> {
        PassEncoder {
            commands: &mut self.commands,
            plain_data: &mut self.plain_data,
            pipeline: PhantomData,
        }
    }
}

//=============================================================================
// Pass Encoders
//=============================================================================

pub struct PassEncoder<'a, P> {
    commands: &'a mut Vec<Command>,
    plain_data: &'a mut Vec<u8>,
    pipeline: PhantomData<P>,
}

pub type TransferCommandEncoder<'a> = PassEncoder<'a, ()>;
pub type ComputeCommandEncoder<'a> = PassEncoder<'a, ComputePipeline>;
pub type RenderCommandEncoder<'a> = PassEncoder<'a, RenderPipeline>;

impl<P> PassEncoder<'_, P> {
    fn bind_buffer(&mut self, stage: ShaderStage, slot: u32, piece: BufferPiece) {
        self.commands.push(Command::SetBuffer { stage, slot, piece });
    }

    fn bind_bytes(&mut self, stage: ShaderStage, slot: u32, data: &[u8]) {
        let start = self.plain_data.len();
        self.plain_data.extend_from_slice(data);
        self.commands.push(Command::SetBytes {
            stage,
            slot,
            range: start..self.plain_data.len(),
        });
    }

    fn bind_texture(&mut self, stage: ShaderStage, slot: u32, texture: Texture) {
        self.commands.push(Command::SetTexture {
            stage,
            slot,
            texture,
        });
    }

    fn bind_sampler(&mut self, stage: ShaderStage, slot: u32, sampler: Sampler) {
        self.commands.push(Command::SetSampler {
            stage,
            slot,
            sampler,
        });
    }
}

impl TransferCommandEncoder<'_> {
    pub fn copy_buffer_to_buffer(&mut self, src: BufferPiece, dst: BufferPiece, size: u64) {
        self.commands
            .push(Command::CopyBufferToBuffer { src, dst, size });
    }

    pub fn fill_buffer(&mut self, dst: BufferPiece, size: u64, value: u8) {
        self.commands.push(Command::FillBuffer { dst, size, value });
    }
}

impl ComputeCommandEncoder<'_> {
    pub fn set_compute_pipeline(&mut self, pipeline: ComputePipeline) {
        self.commands.push(Command::SetComputePipeline(pipeline));
    }

    pub fn set_buffer(&mut self, slot: u32, piece: BufferPiece) {
        self.bind_buffer(ShaderStage::Compute, slot, piece);
    }

    pub fn set_bytes(&mut self, slot: u32, data: &[u8]) {
        self.bind_bytes(ShaderStage::Compute, slot, data);
    }

    pub fn set_texture(&mut self, slot: u32, texture: Texture) {
        self.bind_texture(ShaderStage::Compute, slot, texture);
    }

    pub fn set_sampler(&mut self, slot: u32, sampler: Sampler) {
        self.bind_sampler(ShaderStage::Compute, slot, sampler);
    }

    pub fn dispatch(&mut self, groups: [u32; 3], group_size: [u32; 3]) {
        self.commands.push(Command::Dispatch { groups, group_size });
    }
}

impl RenderCommandEncoder<'_> {
    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.commands.push(Command::SetViewport(viewport));
    }

    pub fn set_render_pipeline(&mut self, pipeline: RenderPipeline) {
        self.commands.push(Command::SetRenderPipeline(pipeline));
    }

    pub fn set_depth_stencil_state(&mut self, state: DepthStencilState) {
        self.commands.push(Command::SetDepthStencilState(state));
    }

    pub fn set_front_face(&mut self, front_face: FrontFace) {
        self.commands.push(Command::SetFrontFace(front_face));
    }

    pub fn set_cull_mode(&mut self, cull_mode: CullMode) {
        self.commands.push(Command::SetCullMode(cull_mode));
    }

    pub fn set_fill_mode(&mut self, fill_mode: FillMode) {
        self.commands.push(Command::SetFillMode(fill_mode));
    }

    pub fn set_blend_constant(&mut self, color: [f32; 4]) {
        self.commands.push(Command::SetBlendConstant(color));
    }

    pub fn set_buffer(&mut self, stage: ShaderStage, slot: u32, piece: BufferPiece) {
        self.bind_buffer(stage, slot, piece);
    }

    pub fn set_bytes(&mut self, stage: ShaderStage, slot: u32, data: &[u8]) {
        self.bind_bytes(stage, slot, data);
    }

    pub fn set_texture(&mut self, stage: ShaderStage, slot: u32, texture: Texture) {
        self.bind_texture(stage, slot, texture);
    }

    pub fn set_sampler(&mut self, stage: ShaderStage, slot: u32, sampler: Sampler) {
        self.bind_sampler(stage, slot, sampler);
    }

    pub fn draw(
        &mut self,
        primitive: PrimitiveType,
        vertex_start: u32,
        vertex_count: u32,
        instance_count: u32,
        base_instance: u32,
    ) {
        self.commands.push(Command::Draw {
            primitive,
            vertex_start,
            vertex_count,
            instance_count,
            base_instance,
        });
    }

    pub fn draw_indexed(
        &mut self,
        primitive: PrimitiveType,
        index: BufferPiece,
        index_type: IndexType,
        index_count: u32,
        base_vertex: i32,
        instance_count: u32,
        base_instance: u32,
    ) {
        self.commands.push(Command::DrawIndexed {
            primitive,
            index,
            index_type,
            index_count,
            base_vertex,
            instance_count,
            base_instance,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_referenced_by_range() {
        let mut cb = CommandBuffer::new(CommandBufferKey::default());
        {
            let mut pass = cb.pass::<RenderPipeline>();
            pass.set_bytes(ShaderStage::Vertex, 1, &[1, 2, 3, 4]);
            pass.set_bytes(ShaderStage::Fragment, 0, &[5, 6]);
        }
        assert_eq!(cb.plain_data(), &[1, 2, 3, 4, 5, 6]);
        match cb.commands()[1] {
            Command::SetBytes {
                stage,
                slot,
                ref range,
            } => {
                assert_eq!(stage, ShaderStage::Fragment);
                assert_eq!(slot, 0);
                assert_eq!(&cb.plain_data()[range.clone()], &[5, 6]);
            }
            ref other => panic!("unexpected {other:?}"),
        }
        cb.reset();
        assert!(cb.commands().is_empty() && cb.plain_data().is_empty());
    }
}
