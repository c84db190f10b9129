//! Cross-queue synchronization.
//!
//! Event tokens come from one context-wide monotonic counter. Signals and
//! waits are recorded as commands; the scheduler holds back a submission
//! until every event and queue drain it waits on has been submitted, so the
//! device always sees signals before the waits that depend on them.

use crate::{
    command::{Command, CommandBuffer},
    traits::CompletionHandler,
    Context, ContractViolation, Device, QueueId, RecordingState, Submission, SyncPoint,
};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Passed as the wait value to wait for everything the signalling queue
/// has recorded so far, rather than a specific event.
pub const END_OF_QUEUE_EVENT_VALUE: u64 = u64::MAX;

//=============================================================================
// Watermark
//=============================================================================

/// Set of `u64` values stored as a contiguous prefix plus the values seen
/// ahead of it.
#[derive(Debug)]
pub(crate) struct Watermark {
    /// All values below are present.
    next: u64,
    ahead: BTreeSet<u64>,
}

impl Watermark {
    pub fn new(first: u64) -> Self {
        Self {
            next: first,
            ahead: BTreeSet::new(),
        }
    }

    pub fn insert(&mut self, value: u64) {
        if value < self.next {
            return;
        }
        self.ahead.insert(value);
        while self.ahead.remove(&self.next) {
            self.next += 1;
        }
    }

    pub fn contains(&self, value: u64) -> bool {
        value < self.next || self.ahead.contains(&value)
    }

    /// Highest value of the contiguous prefix, if any.
    pub fn contiguous(&self, first: u64) -> Option<u64> {
        if self.next > first {
            Some(self.next - 1)
        } else {
            None
        }
    }
}

//=============================================================================
// Scheduler
//=============================================================================

pub(crate) struct PendingSubmission {
    pub recorder: u64,
    pub queue: QueueId,
    /// Per-queue submission number, starting at 1.
    pub submission: u64,
    pub sequence: u64,
    pub command_buffer: CommandBuffer,
}

impl PendingSubmission {
    fn signals(&self) -> impl Iterator<Item = u64> + '_ {
        signals_of(&self.command_buffer.commands)
    }
}

fn signals_of(commands: &[Command]) -> impl Iterator<Item = u64> + '_ {
    commands.iter().filter_map(|command| match *command {
        Command::SignalEvent { value } => Some(value),
        _ => None,
    })
}

pub(crate) struct Scheduler {
    signals: Watermark,
    /// Last submission number that reached the device, per queue stream.
    submitted: HashMap<(u64, QueueId), u64>,
    held: VecDeque<PendingSubmission>,
    /// Recorders whose state is gone but may still have held submissions.
    retired: HashSet<u64>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            signals: Watermark::new(1),
            submitted: HashMap::new(),
            held: VecDeque::new(),
            retired: HashSet::new(),
        }
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    pub fn tracked_stream_count(&self) -> usize {
        self.submitted.len()
    }

    fn is_satisfied(&self, commands: &[Command]) -> bool {
        commands.iter().all(|command| match *command {
            Command::WaitForEvent { value } => {
                self.signals.contains(value) || signals_of(commands).any(|v| v == value)
            }
            Command::WaitForQueue {
                recorder,
                queue,
                submission,
            } => self.submitted.get(&(recorder, queue)).copied().unwrap_or(0) >= submission,
            _ => true,
        })
    }

    /// Whether a submission with these commands would be held back instead
    /// of going to the device right away.
    pub fn would_hold(&self, recorder: u64, queue: QueueId, commands: &[Command]) -> bool {
        self.held
            .iter()
            .any(|pending| pending.recorder == recorder && pending.queue == queue)
            || !self.is_satisfied(commands)
    }

    /// Forgets the submission counters of a recorder once its held
    /// submissions are gone.
    pub fn retire_recorder(&mut self, recorder: u64) {
        self.retired.insert(recorder);
        self.prune(recorder);
    }

    fn prune(&mut self, recorder: u64) {
        if !self.retired.contains(&recorder)
            || self.held.iter().any(|pending| pending.recorder == recorder)
        {
            return;
        }
        self.submitted.retain(|&(r, _), _| r != recorder);
        self.retired.remove(&recorder);
    }

    /// Finds the first held submission that can go to the device. A queue's
    /// submissions leave in the order they were committed.
    fn take_ready(&mut self) -> Option<PendingSubmission> {
        let mut blocked = Vec::new();
        let mut found = None;
        for (index, pending) in self.held.iter().enumerate() {
            let stream = (pending.recorder, pending.queue);
            if blocked.contains(&stream) {
                continue;
            }
            if self.is_satisfied(&pending.command_buffer.commands) {
                found = Some(index);
                break;
            }
            blocked.push(stream);
        }
        let pending = self.held.remove(found?)?;
        for value in pending.signals() {
            self.signals.insert(value);
        }
        *self
            .submitted
            .entry((pending.recorder, pending.queue))
            .or_insert(0) = pending.submission;
        self.prune(pending.recorder);
        Some(pending)
    }
}

//=============================================================================
// Context Operations
//=============================================================================

impl<D: Device> Context<D> {
    /// Next event token that `encode_signal_event` will hand out.
    pub fn next_event_value(&self) -> u64 {
        self.events.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Records a wait on `wait_queue` for `value` to be signalled by
    /// `signal_queue`. A `value` of 0 waits for the next token to be
    /// signalled, [`END_OF_QUEUE_EVENT_VALUE`] waits for the signalling queue
    /// to drain.
    pub fn encode_wait_for_event(
        &self,
        state: &mut RecordingState,
        wait_queue: QueueId,
        signal_queue: QueueId,
        value: u64,
    ) -> Result<(), ContractViolation> {
        for queue in [wait_queue, signal_queue] {
            if state.queue(queue).command_buffer.is_none() {
                return Err(ContractViolation::MissingCommandBuffer { queue });
            }
        }
        if state.queue(wait_queue).in_use {
            return Err(ContractViolation::EncoderInUse { queue: wait_queue });
        }
        if value == END_OF_QUEUE_EVENT_VALUE {
            return self.encode_wait_for_queue(state, wait_queue, signal_queue);
        }

        if state.queue(signal_queue).in_use {
            return Err(ContractViolation::EncoderInUse {
                queue: signal_queue,
            });
        }
        state.queue_mut(wait_queue).end_encoder();
        state.queue_mut(signal_queue).end_encoder();

        let value = if value == 0 {
            self.next_event_value()
        } else {
            value
        };
        let wq = state.queue_mut(wait_queue);
        if value > wq.last_wait_event_value {
            wq.push(Command::WaitForEvent { value });
            wq.last_wait_event_value = value;
            state.highest_expected_event = state.highest_expected_event.max(value);
            log::trace!("{wait_queue} waits for event {value} from {signal_queue}");
        }
        Ok(())
    }

    /// Records a wait on `wait_queue` for everything `signal_queue` records
    /// until its next commit.
    pub fn encode_wait_for_queue(
        &self,
        state: &mut RecordingState,
        wait_queue: QueueId,
        signal_queue: QueueId,
    ) -> Result<(), ContractViolation> {
        for queue in [wait_queue, signal_queue] {
            if state.queue(queue).command_buffer.is_none() {
                return Err(ContractViolation::MissingCommandBuffer { queue });
            }
        }
        if state.queue(wait_queue).in_use {
            return Err(ContractViolation::EncoderInUse { queue: wait_queue });
        }
        let recorder = state.recorder;
        let submission = {
            let sq = state.queue_mut(signal_queue);
            sq.generates_end_event = true;
            sq.submissions + 1
        };
        let wq = state.queue_mut(wait_queue);
        wq.end_encoder();
        wq.push(Command::WaitForQueue {
            recorder,
            queue: signal_queue,
            submission,
        });
        Ok(())
    }

    /// Records a signal of the next event token on `signal_queue` and
    /// returns the token.
    pub fn encode_signal_event(
        &self,
        state: &mut RecordingState,
        signal_queue: QueueId,
    ) -> Result<u64, ContractViolation> {
        let sq = state.queue_mut(signal_queue);
        if sq.command_buffer.is_none() {
            return Err(ContractViolation::MissingCommandBuffer {
                queue: signal_queue,
            });
        }
        if sq.in_use {
            return Err(ContractViolation::EncoderInUse {
                queue: signal_queue,
            });
        }
        sq.end_encoder();
        let value = self
            .events
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        sq.push(Command::SignalEvent { value });
        sq.has_signals = true;
        log::trace!("{signal_queue} signals event {value}");
        Ok(value)
    }

    /// Every wait recorded by this state must be matched by a signal that has
    /// already been handed out.
    pub(crate) fn check_dangling_waits(
        &self,
        state: &RecordingState,
    ) -> Result<(), ContractViolation> {
        let next_signal = self.next_event_value();
        if state.highest_expected_event >= next_signal {
            return Err(ContractViolation::DanglingWait {
                highest_expected: state.highest_expected_event,
                next_signal,
            });
        }
        Ok(())
    }

    /// Hands a committed command buffer to the scheduler and submits
    /// everything that became ready.
    pub(crate) fn schedule(&self, pending: PendingSubmission) {
        let mut scheduler = self.scheduler.lock().unwrap();
        scheduler.held.push_back(pending);
        while let Some(ready) = scheduler.take_ready() {
            self.submit_to_device(ready);
        }
        if scheduler.held_count() != 0 {
            log::debug!("{} submissions wait for signals", scheduler.held_count());
        }
    }

    fn submit_to_device(&self, pending: PendingSubmission) {
        let accounting = Arc::clone(&self.accounting);
        let sequence = pending.sequence;
        let timer_frame = pending.command_buffer.timer_frame;
        let on_complete: CompletionHandler = Box::new(move || {
            accounting.command_buffer_completed(sequence, timer_frame);
        });
        let cb = &pending.command_buffer;
        self.device.submit(
            Submission {
                queue: pending.queue,
                sequence,
                label: &cb.label,
                commands: &cb.commands,
                plain_data: &cb.plain_data,
            },
            on_complete,
        );
        self.device.destroy_command_buffer(cb.raw);
    }

    /// Number of committed submissions still waiting for their dependencies.
    pub fn held_submission_count(&self) -> usize {
        self.scheduler.lock().unwrap().held_count()
    }

    /// Number of queue streams whose submission counters are still kept.
    pub fn tracked_stream_count(&self) -> usize {
        self.scheduler.lock().unwrap().tracked_stream_count()
    }

    /// Blocks until the submission completes or the timeout expires.
    pub fn wait_for(&self, sync_point: &SyncPoint, timeout_ms: u32) -> bool {
        self.device.wait_for(sync_point, timeout_ms)
    }
}
