//! Logical queues and command buffer lifetime.

use crate::{
    command::{Command, CommandBuffer},
    encoder::Encoder,
    sync::PendingSubmission,
    ComputePipeline, Context, ContractViolation, DepthStencilState, Device, EncoderKind,
    RecordingState, RenderPassDesc, RenderPipeline, SyncPoint,
};
use std::sync::Mutex;

#[derive(
    Clone,
    Copy,
    Debug,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    strum::EnumIter,
    strum::EnumCount,
    strum::Display,
)]
pub enum QueueId {
    /// Rendering and general work.
    Default,
    /// Compute work feeding the default queue, such as ComputeGS batches.
    AuxiliaryCompute,
    /// Uploads and other resource preparation.
    Resource,
}

impl QueueId {
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EncoderState {
    /// Nothing recorded since the command buffer was taken.
    #[default]
    Idle,
    Open(Encoder),
    /// The last encoder was closed.
    Ended,
}

/// Pipeline objects last bound on a queue, with the hashes they were looked
/// up with.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct BoundPipelines {
    pub vertex_layout_hash: u64,
    pub attachments_hash: u64,
    pub render_hash: u64,
    pub render: Option<RenderPipeline>,
    pub depth_hash: u64,
    pub depth: Option<DepthStencilState>,
    pub compute_hash: u64,
    pub compute: Option<ComputePipeline>,
}

impl BoundPipelines {
    fn clear_handles(&mut self) {
        self.render = None;
        self.depth = None;
        self.compute = None;
    }
}

pub struct LogicalQueue {
    id: QueueId,
    pub(crate) command_buffer: Option<CommandBuffer>,
    pub(crate) encoder: EncoderState,
    pub(crate) next_serial: u64,
    pub(crate) in_use: bool,
    pub(crate) has_work: bool,
    /// Another queue waits for this one to drain.
    pub(crate) generates_end_event: bool,
    pub(crate) has_signals: bool,
    pub(crate) last_wait_event_value: u64,
    pub(crate) bound: BoundPipelines,
    pub(crate) render_pass: Option<RenderPassDesc>,
    pub(crate) submissions: u64,
}

impl LogicalQueue {
    pub(crate) fn new(id: QueueId) -> Self {
        Self {
            id,
            command_buffer: None,
            encoder: EncoderState::Idle,
            next_serial: 0,
            in_use: false,
            has_work: false,
            generates_end_event: false,
            has_signals: false,
            last_wait_event_value: 0,
            bound: BoundPipelines::default(),
            render_pass: None,
            submissions: 0,
        }
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn command_buffer(&self) -> Option<&CommandBuffer> {
        self.command_buffer.as_ref()
    }

    pub fn encoder_state(&self) -> EncoderState {
        self.encoder
    }

    /// Kind of the encoder that is open, in use or not.
    pub fn open_kind(&self) -> Option<EncoderKind> {
        match self.encoder {
            EncoderState::Open(encoder) => Some(encoder.kind),
            _ => None,
        }
    }

    pub fn is_encoder_in_use(&self) -> bool {
        self.in_use
    }

    pub fn is_encoder_ended(&self) -> bool {
        self.encoder == EncoderState::Ended
    }

    pub fn has_work(&self) -> bool {
        self.has_work
    }

    pub fn generates_end_event(&self) -> bool {
        self.generates_end_event
    }

    pub fn last_wait_event_value(&self) -> u64 {
        self.last_wait_event_value
    }

    pub fn render_pass(&self) -> Option<&RenderPassDesc> {
        self.render_pass.as_ref()
    }

    /// Number of command buffers this queue submitted.
    pub fn submissions(&self) -> u64 {
        self.submissions
    }

    pub(crate) fn push(&mut self, command: Command) {
        if let Some(ref mut cb) = self.command_buffer {
            cb.push(command);
        }
    }

    /// Closes the open encoder, if any. The caller makes sure it is not in use.
    pub(crate) fn end_encoder(&mut self) {
        if let EncoderState::Open(_) = self.encoder {
            self.push(Command::EndPass);
            self.bound.clear_handles();
            self.encoder = EncoderState::Ended;
        }
    }

    /// Prepares the queue for the next command buffer.
    fn reset(&mut self) {
        self.command_buffer = None;
        self.encoder = EncoderState::Idle;
        self.in_use = false;
        self.has_work = false;
        self.generates_end_event = false;
        self.has_signals = false;
        self.last_wait_event_value = 0;
        self.bound = BoundPipelines::default();
    }
}

//=============================================================================
// Command Buffer Pool
//=============================================================================

/// Free list of command buffers that were recycled without being submitted.
pub(crate) struct CommandBufferPool {
    free: Mutex<Vec<CommandBuffer>>,
    capacity: usize,
}

impl CommandBufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            capacity,
        }
    }

    fn take(&self) -> Option<CommandBuffer> {
        self.free.lock().unwrap().pop()
    }

    /// Returns the buffer back if the pool is full.
    fn recycle(&self, mut cb: CommandBuffer) -> Option<CommandBuffer> {
        let mut free = self.free.lock().unwrap();
        if free.len() >= self.capacity {
            return Some(cb);
        }
        cb.reset();
        free.push(cb);
        None
    }

    pub fn drain(&self) -> Vec<CommandBuffer> {
        std::mem::take(&mut *self.free.lock().unwrap())
    }
}

//=============================================================================
// Context Operations
//=============================================================================

impl<D: Device> Context<D> {
    /// Makes sure `queue` has a command buffer to record into.
    pub fn ensure_command_buffer(
        &self,
        state: &mut RecordingState,
        queue: QueueId,
    ) -> Result<(), ContractViolation> {
        let wq = state.queue_mut(queue);
        if wq.in_use {
            return Err(ContractViolation::EncoderInUse { queue });
        }
        if wq.command_buffer.is_none() {
            // capture tools need one object per recorded command buffer
            let recycled = if self.desc.capture {
                None
            } else {
                self.command_buffers.take()
            };
            let mut cb = match recycled {
                Some(cb) => cb,
                None => {
                    self.stats.inc_command_buffers_created();
                    CommandBuffer::new(self.device.create_command_buffer())
                }
            };
            if queue == QueueId::Default {
                cb.timer_frame = Some(self.accounting.event_expected());
            }
            wq.command_buffer = Some(cb);
        }
        Ok(())
    }

    /// Returns the command buffer of `queue` with no encoder left open.
    pub fn command_buffer<'a>(
        &self,
        state: &'a mut RecordingState,
        queue: QueueId,
    ) -> Result<&'a CommandBuffer, ContractViolation> {
        self.ensure_command_buffer(state, queue)?;
        let wq = state.queue_mut(queue);
        wq.end_encoder();
        wq.command_buffer
            .as_ref()
            .ok_or(ContractViolation::MissingCommandBuffer { queue })
    }

    pub fn label_command_buffer(
        &self,
        state: &mut RecordingState,
        queue: QueueId,
        label: &str,
    ) -> Result<(), ContractViolation> {
        let cb = state
            .queue_mut(queue)
            .command_buffer
            .as_mut()
            .ok_or(ContractViolation::MissingCommandBuffer { queue })?;
        cb.label.clear();
        cb.label.push_str(label);
        Ok(())
    }

    pub(crate) fn recycle_command_buffer(&self, cb: CommandBuffer) {
        if let Some(frame) = cb.timer_frame {
            self.accounting.unexpect_event(frame);
        }
        if self.desc.capture {
            self.device.destroy_command_buffer(cb.raw);
        } else if let Some(overflow) = self.command_buffers.recycle(cb) {
            self.device.destroy_command_buffer(overflow.raw);
        }
    }

    /// Finishes the command buffer of `queue` and hands it to the device.
    ///
    /// A command buffer with no work, no signals and nobody waiting for the
    /// queue to drain is recycled instead, and `None` is returned.
    #[profiling::function]
    pub fn commit(
        &self,
        state: &mut RecordingState,
        queue: QueueId,
        wait_until_scheduled: bool,
    ) -> Result<Option<SyncPoint>, ContractViolation> {
        {
            let wq = state.queue(queue);
            if wq.command_buffer.is_none() {
                return Err(ContractViolation::MissingCommandBuffer { queue });
            }
            if wq.in_use {
                return Err(ContractViolation::EncoderInUse { queue });
            }
        }
        if state.gs.has_open_batch {
            self.close_gs_batch(state)?;
        }
        self.check_dangling_waits(state)?;

        let recorder = state.recorder;
        let wq = state.queue_mut(queue);
        let needs_submit = wq.has_work || wq.has_signals || wq.generates_end_event;
        if !needs_submit {
            if let Some(cb) = wq.command_buffer.take() {
                self.recycle_command_buffer(cb);
            }
            wq.reset();
            log::trace!("Recycled empty command buffer of {queue}");
            return Ok(None);
        }

        if wait_until_scheduled {
            let held = wq.command_buffer.as_ref().is_some_and(|cb| {
                self.scheduler
                    .lock()
                    .unwrap()
                    .would_hold(recorder, queue, &cb.commands)
            });
            if held {
                return Err(ContractViolation::WaitOnHeldSubmission { queue });
            }
        }

        wq.end_encoder();
        let command_buffer = wq
            .command_buffer
            .take()
            .ok_or(ContractViolation::MissingCommandBuffer { queue })?;
        wq.submissions += 1;
        let submission = wq.submissions;
        wq.reset();

        let sequence = self.accounting.next_sequence();
        log::debug!(
            "Committing '{}' on {} as sequence {}",
            command_buffer.label,
            queue,
            sequence
        );
        self.schedule(PendingSubmission {
            recorder,
            queue,
            submission,
            sequence,
            command_buffer,
        });
        self.stats.inc_command_buffers_committed();

        let sync_point = SyncPoint { sequence };
        if wait_until_scheduled && !self.device.wait_until_scheduled(&sync_point) {
            log::error!("Sequence {sequence} of {queue} never reached the device");
        }
        Ok(Some(sync_point))
    }
}
