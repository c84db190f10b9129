//! Encoder state machine.
//!
//! Each queue has at most one open encoder. Asking for the kind that is
//! already open hands the same encoder back; asking for another kind closes
//! it first. Opening a render or compute encoder invalidates everything
//! that was bound, so the next `commit_state` emits the full state again.

use crate::{
    command::{Command, PassEncoder},
    queue::EncoderState,
    ComputeCommandEncoder, ComputePipeline, Context, ContractViolation, Device, EncoderKind,
    QueueId, RecordingState, RenderCommandEncoder, RenderPassDesc, RenderPipeline,
    TransferCommandEncoder, Viewport,
};

/// Identity of an encoder opened on a queue.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct Encoder {
    pub queue: QueueId,
    pub kind: EncoderKind,
    /// Distinguishes pass objects within the queue.
    pub serial: u64,
}

impl<D: Device> Context<D> {
    /// Returns an encoder of `kind` on `queue`, marking it in use.
    pub fn get_encoder(
        &self,
        state: &mut RecordingState,
        queue: QueueId,
        kind: EncoderKind,
    ) -> Result<Encoder, ContractViolation> {
        if state.queue(queue).in_use {
            return Err(ContractViolation::EncoderInUse { queue });
        }
        self.ensure_command_buffer(state, queue)?;
        self.stats.inc_encoders_requested(kind);
        state.current_queue = queue;

        let wq = state.queue_mut(queue);
        if let EncoderState::Open(encoder) = wq.encoder {
            if encoder.kind == kind {
                wq.in_use = true;
                return Ok(encoder);
            }
        }
        let targets = match kind {
            EncoderKind::Render => Some(
                wq.render_pass
                    .clone()
                    .ok_or(ContractViolation::MissingRenderPass { queue })?,
            ),
            EncoderKind::Compute | EncoderKind::Copy => None,
        };
        wq.end_encoder();

        let encoder = Encoder {
            queue,
            kind,
            serial: wq.next_serial,
        };
        wq.next_serial += 1;
        let extent = targets.as_ref().map(RenderPassDesc::extent);
        wq.push(Command::BeginPass {
            kind,
            serial: encoder.serial,
            targets,
        });
        if let Some(extent) = extent {
            wq.push(Command::SetViewport(Viewport {
                x: 0.0,
                y: 0.0,
                w: extent.width as f32,
                h: extent.height as f32,
                near: 0.0,
                far: 1.0,
            }));
        }
        wq.encoder = EncoderState::Open(encoder);
        wq.in_use = true;
        wq.has_work = true;
        self.stats.inc_encoders_created(kind);
        log::trace!("Opened {kind:?} encoder {} on {queue}", encoder.serial);

        if kind != EncoderKind::Copy {
            state.invalidate_bindings();
        }
        Ok(encoder)
    }

    /// Gives the encoder of `queue` back. With `end_encoding` the encoder is
    /// closed, otherwise the next request for the same kind reuses it.
    pub fn release_encoder(
        &self,
        state: &mut RecordingState,
        queue: QueueId,
        end_encoding: bool,
    ) -> Result<(), ContractViolation> {
        let wq = state.queue_mut(queue);
        if wq.command_buffer.is_none() {
            return Err(ContractViolation::MissingCommandBuffer { queue });
        }
        if !wq.in_use {
            return Err(ContractViolation::NoEncoderInUse { queue });
        }
        wq.in_use = false;
        if end_encoding {
            wq.end_encoder();
        }
        Ok(())
    }

    /// Sets the attachments of the next render encoder on `queue`. An open
    /// render encoder is closed since its attachments no longer apply.
    pub fn set_render_pass(
        &self,
        state: &mut RecordingState,
        queue: QueueId,
        desc: RenderPassDesc,
    ) -> Result<(), ContractViolation> {
        let wq = state.queue_mut(queue);
        if wq.in_use {
            return Err(ContractViolation::RenderPassWhileEncoding { queue });
        }
        if wq.open_kind() == Some(EncoderKind::Render) {
            wq.end_encoder();
        }
        wq.render_pass = Some(desc);
        state.dirty_draw_targets();
        Ok(())
    }
}

impl RecordingState {
    fn pass_encoder<P>(
        &mut self,
        queue: QueueId,
        kind: EncoderKind,
    ) -> Result<PassEncoder<'_, P>, ContractViolation> {
        let wq = &mut self.queues[queue.index()];
        let found = wq.open_kind();
        if found != Some(kind) || !wq.in_use {
            return Err(ContractViolation::WrongEncoder {
                queue,
                expected: kind,
                found,
            });
        }
        wq.command_buffer
            .as_mut()
            .map(|cb| cb.pass())
            .ok_or(ContractViolation::MissingCommandBuffer { queue })
    }

    /// Records into the render encoder that is in use on `queue`.
    pub fn render_encoder(
        &mut self,
        queue: QueueId,
    ) -> Result<RenderCommandEncoder<'_>, ContractViolation> {
        self.pass_encoder::<RenderPipeline>(queue, EncoderKind::Render)
    }

    pub fn compute_encoder(
        &mut self,
        queue: QueueId,
    ) -> Result<ComputeCommandEncoder<'_>, ContractViolation> {
        self.pass_encoder::<ComputePipeline>(queue, EncoderKind::Compute)
    }

    pub fn transfer_encoder(
        &mut self,
        queue: QueueId,
    ) -> Result<TransferCommandEncoder<'_>, ContractViolation> {
        self.pass_encoder::<()>(queue, EncoderKind::Copy)
    }
}
