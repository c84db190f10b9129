//! Cross-queue ordering through event tokens and queue drains.

use blade_relay::{
    soft::{Completion, SoftDevice},
    BufferDesc, Command, Context, ContextDesc, ContractViolation, EncoderKind, QueueId,
    RecordingState, StorageMode, END_OF_QUEUE_EVENT_VALUE,
};

fn context(completion: Completion) -> Context<SoftDevice> {
    let _ = env_logger::builder().is_test(true).try_init();
    Context::new(SoftDevice::new(completion), ContextDesc::default())
}

/// Records a fill on `queue` so its command buffer has work.
fn record_fill(ctx: &Context<SoftDevice>, state: &mut RecordingState, queue: QueueId) {
    let buffer = ctx.acquire_buffer(
        BufferDesc {
            name: "fill-target",
            size: 16,
            ..Default::default()
        },
        None,
    );
    ctx.get_encoder(state, queue, EncoderKind::Copy).unwrap();
    state
        .transfer_encoder(queue)
        .unwrap()
        .fill_buffer(buffer.into(), 16, 1);
    ctx.release_encoder(state, queue, true).unwrap();
    ctx.release_buffer(buffer).unwrap();
}

#[test]
fn wait_recorded_before_signal_is_committed() {
    let ctx = context(Completion::Immediate);
    let mut state = ctx.create_recording_state();
    ctx.ensure_command_buffer(&mut state, QueueId::Resource)
        .unwrap();
    ctx.ensure_command_buffer(&mut state, QueueId::Default)
        .unwrap();

    record_fill(&ctx, &mut state, QueueId::Resource);
    let token = ctx
        .encode_signal_event(&mut state, QueueId::Resource)
        .unwrap();
    assert_eq!(ctx.next_event_value(), token + 1);
    ctx.encode_wait_for_event(&mut state, QueueId::Default, QueueId::Resource, token)
        .unwrap();
    record_fill(&ctx, &mut state, QueueId::Default);

    let waiting = ctx
        .commit(&mut state, QueueId::Default, false)
        .unwrap()
        .expect("default queue has work");
    assert_eq!(ctx.held_submission_count(), 1);
    assert_eq!(ctx.device().submission_count(), 0);
    assert!(!ctx.wait_for(&waiting, 0));

    ctx.commit(&mut state, QueueId::Resource, false)
        .unwrap()
        .expect("resource queue signals");
    assert_eq!(ctx.held_submission_count(), 0);
    assert!(ctx.wait_for(&waiting, 100));

    let submitted = ctx.device().submissions();
    let queues: Vec<_> = submitted.iter().map(|work| work.queue).collect();
    assert_eq!(queues, vec![QueueId::Resource, QueueId::Default]);
    assert_eq!(submitted[0].signals().collect::<Vec<_>>(), vec![token]);
    assert_eq!(submitted[1].waits().collect::<Vec<_>>(), vec![token]);
    assert_eq!(ctx.last_completed_command_buffer(), 1);
    ctx.retire_recording_state(state).unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn wait_for_next_token() {
    let ctx = context(Completion::Immediate);
    let mut state = ctx.create_recording_state();
    ctx.ensure_command_buffer(&mut state, QueueId::Default)
        .unwrap();
    ctx.ensure_command_buffer(&mut state, QueueId::AuxiliaryCompute)
        .unwrap();
    let next = ctx.next_event_value();
    ctx.encode_wait_for_event(&mut state, QueueId::Default, QueueId::AuxiliaryCompute, 0)
        .unwrap();
    assert_eq!(state.queue(QueueId::Default).last_wait_event_value(), next);
    record_fill(&ctx, &mut state, QueueId::Default);

    // nobody signalled the token yet
    assert_eq!(
        ctx.commit(&mut state, QueueId::Default, false),
        Err(ContractViolation::DanglingWait {
            highest_expected: next,
            next_signal: next,
        })
    );
    let token = ctx
        .encode_signal_event(&mut state, QueueId::AuxiliaryCompute)
        .unwrap();
    assert_eq!(token, next);
    assert!(ctx
        .commit(&mut state, QueueId::Default, false)
        .unwrap()
        .is_some());
    ctx.commit(&mut state, QueueId::AuxiliaryCompute, false)
        .unwrap();
    assert_eq!(ctx.device().submission_count(), 2);
    ctx.retire_recording_state(state).unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn waits_only_move_forward() {
    let ctx = context(Completion::Immediate);
    let mut state = ctx.create_recording_state();
    for queue in [QueueId::Default, QueueId::Resource] {
        ctx.ensure_command_buffer(&mut state, queue).unwrap();
    }
    for value in [2, 1, 2, 3] {
        ctx.encode_wait_for_event(&mut state, QueueId::Default, QueueId::Resource, value)
            .unwrap();
    }
    let waits: Vec<_> = ctx
        .command_buffer(&mut state, QueueId::Default)
        .unwrap()
        .commands()
        .iter()
        .filter_map(|command| match *command {
            Command::WaitForEvent { value } => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(waits, vec![2, 3]);
    ctx.retire_recording_state(state).unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn wait_for_queue_drain() {
    let ctx = context(Completion::Immediate);
    let mut state = ctx.create_recording_state();
    for queue in [QueueId::Default, QueueId::Resource] {
        ctx.ensure_command_buffer(&mut state, queue).unwrap();
    }
    ctx.encode_wait_for_event(
        &mut state,
        QueueId::Default,
        QueueId::Resource,
        END_OF_QUEUE_EVENT_VALUE,
    )
    .unwrap();
    assert!(state.queue(QueueId::Resource).generates_end_event());
    record_fill(&ctx, &mut state, QueueId::Default);

    ctx.commit(&mut state, QueueId::Default, false).unwrap();
    assert_eq!(ctx.held_submission_count(), 1);
    // nothing recorded, yet the drain obligation forces a submission
    let drained = ctx.commit(&mut state, QueueId::Resource, false).unwrap();
    assert!(drained.is_some());
    assert_eq!(ctx.held_submission_count(), 0);

    let submitted = ctx.device().submissions();
    assert_eq!(submitted[0].queue, QueueId::Resource);
    assert!(submitted[1].commands.contains(&Command::WaitForQueue {
        recorder: state.recorder(),
        queue: QueueId::Resource,
        submission: 1,
    }));
    ctx.retire_recording_state(state).unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn waits_across_recording_states() {
    let ctx = context(Completion::Deferred);
    let mut producer = ctx.create_recording_state();
    let mut consumer = ctx.create_recording_state();
    assert_ne!(producer.recorder(), consumer.recorder());

    ctx.ensure_command_buffer(&mut producer, QueueId::Resource)
        .unwrap();
    record_fill(&ctx, &mut producer, QueueId::Resource);
    let token = ctx
        .encode_signal_event(&mut producer, QueueId::Resource)
        .unwrap();

    for queue in [QueueId::Default, QueueId::Resource] {
        ctx.ensure_command_buffer(&mut consumer, queue).unwrap();
    }
    ctx.encode_wait_for_event(&mut consumer, QueueId::Default, QueueId::Resource, token)
        .unwrap();
    record_fill(&ctx, &mut consumer, QueueId::Default);
    let consumed = ctx
        .commit(&mut consumer, QueueId::Default, false)
        .unwrap()
        .expect("consumer has work");
    assert_eq!(ctx.held_submission_count(), 1);

    let produced = ctx
        .commit(&mut producer, QueueId::Resource, false)
        .unwrap()
        .expect("producer signals");
    assert_eq!(ctx.held_submission_count(), 0);
    assert_eq!(ctx.device().in_flight_count(), 2);
    // the device received the producer first
    let order: Vec<_> = ctx
        .device()
        .submissions()
        .iter()
        .map(|work| work.sequence)
        .collect();
    assert_eq!(order, vec![produced.sequence(), consumed.sequence()]);

    // completions arrive in device order, sequence numbers out of order
    ctx.device().retire(1);
    assert_eq!(ctx.last_completed_command_buffer(), -1);
    ctx.device().retire(1);
    assert_eq!(ctx.last_completed_command_buffer(), 1);

    ctx.retire_recording_state(producer).unwrap();
    ctx.retire_recording_state(consumer).unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn empty_command_buffer_is_recycled() {
    let ctx = context(Completion::Immediate);
    let mut state = ctx.create_recording_state();
    ctx.ensure_command_buffer(&mut state, QueueId::Default)
        .unwrap();
    assert_eq!(ctx.commit(&mut state, QueueId::Default, false), Ok(None));
    assert!(state.queue(QueueId::Default).command_buffer().is_none());
    assert_eq!(ctx.device().submission_count(), 0);

    // the recycled buffer is handed out again
    ctx.ensure_command_buffer(&mut state, QueueId::Default)
        .unwrap();
    assert_eq!(ctx.stats().command_buffers_created, 1);
    assert_eq!(
        ctx.commit(&mut state, QueueId::AuxiliaryCompute, false),
        Err(ContractViolation::MissingCommandBuffer {
            queue: QueueId::AuxiliaryCompute
        })
    );
    ctx.retire_recording_state(state).unwrap();
    let device = ctx.destroy().unwrap();
    assert_eq!(device.live_objects().command_buffers, 0);
}

#[test]
fn wait_until_scheduled_refuses_held_submission() {
    let ctx = context(Completion::Immediate);
    let mut state = ctx.create_recording_state();
    for queue in [QueueId::Default, QueueId::Resource] {
        ctx.ensure_command_buffer(&mut state, queue).unwrap();
    }
    let readback = ctx.acquire_buffer(
        BufferDesc {
            name: "readback",
            size: 4,
            storage: StorageMode::Shared,
            ..Default::default()
        },
        None,
    );
    let token = ctx
        .encode_signal_event(&mut state, QueueId::Resource)
        .unwrap();
    ctx.encode_wait_for_event(&mut state, QueueId::Default, QueueId::Resource, token)
        .unwrap();
    ctx.get_encoder(&mut state, QueueId::Default, EncoderKind::Copy)
        .unwrap();
    state
        .transfer_encoder(QueueId::Default)
        .unwrap()
        .fill_buffer(readback.into(), 4, 7);
    ctx.release_encoder(&mut state, QueueId::Default, true)
        .unwrap();

    // the signal is still unsubmitted, blocking here would never return
    assert_eq!(
        ctx.commit(&mut state, QueueId::Default, true),
        Err(ContractViolation::WaitOnHeldSubmission {
            queue: QueueId::Default
        })
    );
    assert_eq!(ctx.held_submission_count(), 0);
    assert_eq!(ctx.device().submission_count(), 0);
    assert!(state.queue(QueueId::Default).command_buffer().is_some());

    ctx.commit(&mut state, QueueId::Resource, true)
        .unwrap()
        .expect("resource queue signals");
    let filled = ctx
        .commit(&mut state, QueueId::Default, true)
        .unwrap()
        .expect("default queue has work");
    assert!(ctx.wait_for(&filled, 100));
    assert_eq!(ctx.read_buffer(readback, 0, 4), vec![7; 4]);

    ctx.release_buffer(readback).unwrap();
    ctx.retire_recording_state(state).unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn wait_needs_signal_encoder_released() {
    let ctx = context(Completion::Immediate);
    let mut state = ctx.create_recording_state();
    for queue in [QueueId::Default, QueueId::Resource] {
        ctx.ensure_command_buffer(&mut state, queue).unwrap();
    }
    ctx.get_encoder(&mut state, QueueId::Resource, EncoderKind::Copy)
        .unwrap();
    assert_eq!(
        ctx.encode_wait_for_event(&mut state, QueueId::Default, QueueId::Resource, 0),
        Err(ContractViolation::EncoderInUse {
            queue: QueueId::Resource
        })
    );
    assert_eq!(state.queue(QueueId::Default).last_wait_event_value(), 0);

    ctx.release_encoder(&mut state, QueueId::Resource, false)
        .unwrap();
    assert_eq!(
        state.queue(QueueId::Resource).open_kind(),
        Some(EncoderKind::Copy)
    );
    ctx.encode_wait_for_event(&mut state, QueueId::Default, QueueId::Resource, 0)
        .unwrap();
    assert!(state.queue(QueueId::Resource).is_encoder_ended());
    ctx.retire_recording_state(state).unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn retired_states_leave_no_submission_counters() {
    let ctx = context(Completion::Immediate);
    for _ in 0..4 {
        let mut state = ctx.create_recording_state();
        for queue in [QueueId::Default, QueueId::Resource] {
            ctx.ensure_command_buffer(&mut state, queue).unwrap();
            record_fill(&ctx, &mut state, queue);
            ctx.commit(&mut state, queue, false).unwrap();
        }
        assert_eq!(ctx.tracked_stream_count(), 2);
        ctx.retire_recording_state(state).unwrap();
        assert_eq!(ctx.tracked_stream_count(), 0);
    }
    assert_eq!(ctx.device().submission_count(), 8);
    assert_eq!(ctx.last_completed_command_buffer(), 7);
    ctx.destroy().unwrap();
}

#[test]
fn capture_bypasses_command_buffer_reuse() {
    let _ = env_logger::builder().is_test(true).try_init();
    let ctx = Context::new(
        SoftDevice::new(Completion::Immediate),
        ContextDesc {
            capture: true,
            ..Default::default()
        },
    );
    let mut state = ctx.create_recording_state();
    ctx.ensure_command_buffer(&mut state, QueueId::Default)
        .unwrap();
    assert_eq!(ctx.commit(&mut state, QueueId::Default, false), Ok(None));
    // the empty buffer went back to the device, not to the free list
    assert_eq!(ctx.device().live_objects().command_buffers, 0);

    ctx.ensure_command_buffer(&mut state, QueueId::Default)
        .unwrap();
    assert_eq!(ctx.stats().command_buffers_created, 2);
    assert_eq!(ctx.device().live_objects().command_buffers, 1);
    ctx.retire_recording_state(state).unwrap();
    let device = ctx.destroy().unwrap();
    assert_eq!(device.live_objects().command_buffers, 0);
}
