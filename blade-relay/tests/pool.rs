//! Buffer pool behavior against the software device.

use blade_relay::{
    soft::{Completion, LiveObjects, SoftDevice},
    BufferDesc, CacheMode, Context, ContextDesc, ContractViolation, QueueId, RecordingState,
    StorageMode,
};

fn context(completion: Completion, desc: ContextDesc) -> Context<SoftDevice> {
    let _ = env_logger::builder().is_test(true).try_init();
    Context::new(SoftDevice::new(completion), desc)
}

fn desc(size: u64) -> BufferDesc<'static> {
    BufferDesc {
        name: "transient",
        size,
        storage: StorageMode::Shared,
        cache: CacheMode::DefaultCache,
    }
}

/// Commits a command buffer on the default queue that only signals.
fn submit_work(ctx: &Context<SoftDevice>, state: &mut RecordingState) {
    ctx.ensure_command_buffer(state, QueueId::Default).unwrap();
    ctx.encode_signal_event(state, QueueId::Default).unwrap();
    let sync_point = ctx.commit(state, QueueId::Default, false).unwrap();
    assert!(sync_point.is_some());
}

#[test]
fn reuse_waits_for_safe_distance() {
    let ctx = context(Completion::Deferred, ContextDesc::default());
    let mut state = ctx.create_recording_state();

    let first = ctx.acquire_buffer(desc(256), None);
    ctx.release_buffer(first).unwrap();
    let busy = ctx.acquire_buffer(desc(256), None);
    assert_ne!(busy, first, "nothing completed since the release");

    submit_work(&ctx, &mut state);
    submit_work(&ctx, &mut state);
    assert_eq!(ctx.device().in_flight_count(), 2);
    ctx.device().retire(1);
    let early = ctx.acquire_buffer(desc(256), None);
    assert_ne!(early, first);

    ctx.device().retire(1);
    assert_eq!(ctx.last_completed_command_buffer(), 1);
    let other_size = ctx.acquire_buffer(desc(512), None);
    let other_storage = ctx.acquire_buffer(
        BufferDesc {
            storage: StorageMode::Private,
            ..desc(256)
        },
        None,
    );
    assert_ne!(other_size, first);
    assert_ne!(other_storage, first);
    let reused = ctx.acquire_buffer(desc(256), Some(&[7; 4]));
    assert_eq!(reused, first);
    assert_eq!(ctx.read_buffer(reused, 0, 4), vec![7; 4]);
    assert!(ctx.stats().buffers_reused >= 1);

    for buffer in [busy, early, other_size, other_storage, reused] {
        ctx.release_buffer(buffer).unwrap();
    }
    ctx.device().retire_all();
    ctx.retire_recording_state(state).unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn release_requires_outstanding_buffer() {
    let ctx = context(Completion::Immediate, ContextDesc::default());
    let buffer = ctx.acquire_buffer(desc(64), None);
    ctx.release_buffer(buffer).unwrap();
    assert_eq!(
        ctx.release_buffer(buffer),
        Err(ContractViolation::BufferNotOutstanding)
    );
    let foreign = ctx.device().create_buffer(desc(64), None);
    assert_eq!(
        ctx.release_buffer(foreign),
        Err(ContractViolation::BufferNotOutstanding)
    );
    ctx.device().destroy_buffer(foreign);
    ctx.destroy().unwrap();
}

#[test]
fn reclaim_by_command_buffer_age() {
    let ctx = context(
        Completion::Immediate,
        ContextDesc {
            max_buffer_age_in_command_buffers: 2,
            ..Default::default()
        },
    );
    let mut state = ctx.create_recording_state();
    let buffer = ctx.acquire_buffer(desc(128), None);
    ctx.release_buffer(buffer).unwrap();

    for _ in 0..3 {
        submit_work(&ctx, &mut state);
    }
    let report = ctx.reclaim_buffers(false).unwrap();
    assert_eq!(report.destroyed, 0);

    submit_work(&ctx, &mut state);
    let report = ctx.reclaim_buffers(false).unwrap();
    assert_eq!(report.destroyed, 1);
    assert_eq!(report.destroyed_bytes, 128);
    ctx.retire_recording_state(state).unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn reclaim_by_frame_age() {
    let ctx = context(Completion::Immediate, ContextDesc::default());
    let buffer = ctx.acquire_buffer(desc(128), None);
    ctx.release_buffer(buffer).unwrap();
    for _ in 0..4 {
        ctx.start_frame();
        ctx.end_frame();
    }
    assert_eq!(ctx.last_completed_frame(), 3);
    assert_eq!(ctx.reclaim_buffers(false).unwrap().destroyed, 0);

    ctx.start_frame();
    ctx.end_frame();
    let report = ctx.reclaim_buffers(false).unwrap();
    assert_eq!((report.destroyed, report.remaining), (1, 0));
    ctx.destroy().unwrap();
}

#[test]
fn pressure_stops_at_safe_distance() {
    let ctx = context(
        Completion::Immediate,
        ContextDesc {
            high_memory_threshold: 800,
            ..Default::default()
        },
    );
    let mut state = ctx.create_recording_state();
    let buffers: Vec<_> = (0..3).map(|_| ctx.acquire_buffer(desc(400), None)).collect();
    for &buffer in buffers.iter() {
        ctx.release_buffer(buffer).unwrap();
    }
    assert_eq!(ctx.pooled_buffers(), (3, 1200));

    // over the threshold, but the GPU may still use every pooled buffer
    let report = ctx.reclaim_buffers(false).unwrap();
    assert_eq!((report.destroyed, report.remaining), (0, 3));

    submit_work(&ctx, &mut state);
    submit_work(&ctx, &mut state);
    let report = ctx.reclaim_buffers(false).unwrap();
    assert_eq!(report.destroyed, 1);
    // exactly at the threshold is not over it
    assert_eq!(report.remaining_bytes, 800);
    assert_eq!(ctx.reclaim_buffers(false).unwrap().destroyed, 0);

    ctx.retire_recording_state(state).unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn triple_buffer_rotates_through_slots() {
    let ctx = context(Completion::Immediate, ContextDesc::default());
    let mut ring = ctx.create_triple_buffer(desc(4), None);
    let slots = ring.slots();
    assert_eq!(slots.len(), 3);
    assert!(ring.is_filling());

    ctx.start_frame();
    ctx.write_triple_buffer(&mut ring, 0, &[0; 4]);
    for slot in slots.iter() {
        assert_eq!(ctx.read_buffer(*slot, 0, 4), vec![0; 4]);
    }
    ctx.end_frame();

    let mut seen = Vec::new();
    for frame in 1..=4u8 {
        ctx.start_frame();
        ctx.write_triple_buffer(&mut ring, 0, &[frame; 4]);
        let active = ring.active();
        assert_eq!(ctx.read_buffer(active, 0, 4), vec![frame; 4]);
        seen.push(ring.active_index());
        ctx.end_frame();
    }
    assert_eq!(seen, vec![1, 2, 0, 1]);
    // every slot keeps the data of its own last write
    assert_eq!(ctx.read_buffer(ring.slot(0), 0, 4), vec![3; 4]);
    assert_eq!(ctx.read_buffer(ring.slot(1), 0, 4), vec![4; 4]);
    assert_eq!(ctx.read_buffer(ring.slot(2), 0, 4), vec![2; 4]);

    ctx.release_triple_buffer(ring).unwrap();
    assert_eq!(ctx.pooled_buffers().0, 3);
    ctx.destroy().unwrap();
}

#[test]
fn managed_ranges_coalesce() {
    let ctx = context(Completion::Immediate, ContextDesc::default());
    let managed = BufferDesc {
        storage: StorageMode::Managed,
        ..desc(64)
    };
    let buffer = ctx.acquire_buffer(managed, None);
    ctx.prepare_buffer_flush();
    ctx.queue_buffer_flush(buffer, 0..16);
    ctx.queue_buffer_flush(buffer, 16..32);
    ctx.queue_buffer_flush(buffer, 48..64);
    ctx.flush_buffers();
    // the first two ranges merged
    assert_eq!(ctx.device().flushed_ranges(buffer), 2);

    ctx.queue_buffer_flush(buffer, 0..4);
    assert_eq!(ctx.device().flushed_ranges(buffer), 3);
    ctx.release_buffer(buffer).unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn teardown_leaves_nothing_behind() {
    let ctx = context(Completion::Deferred, ContextDesc::default());
    let mut state = ctx.create_recording_state();
    let buffers: Vec<_> = (1..=5).map(|i| ctx.acquire_buffer(desc(i * 64), None)).collect();
    let ring = ctx.create_triple_buffer(desc(32), None);
    submit_work(&ctx, &mut state);
    for buffer in buffers {
        ctx.release_buffer(buffer).unwrap();
    }
    ctx.release_triple_buffer(ring).unwrap();
    ctx.device().retire_all();
    ctx.retire_recording_state(state).unwrap();
    assert_eq!(ctx.pooled_buffers().0, 8);

    let device = ctx.destroy().unwrap();
    assert_eq!(device.live_objects(), LiveObjects::default());
    assert_eq!(device.dangling_references(), 0);
}

#[test]
fn released_buffer_drops_its_pending_flush() {
    let ctx = context(Completion::Immediate, ContextDesc::default());
    let managed = BufferDesc {
        storage: StorageMode::Managed,
        ..desc(64)
    };
    let buffer = ctx.acquire_buffer(managed, None);
    ctx.prepare_buffer_flush();
    ctx.queue_buffer_flush(buffer, 0..16);
    ctx.release_buffer(buffer).unwrap();
    assert_eq!(ctx.device().flushed_ranges(buffer), 0);

    let report = ctx.reclaim_buffers(true).unwrap();
    assert_eq!(report.destroyed, 1);
    // the destroyed buffer is no longer part of the batch
    ctx.flush_buffers();
    let device = ctx.destroy().unwrap();
    assert_eq!(device.dangling_references(), 0);
    assert_eq!(device.live_objects(), LiveObjects::default());
}

#[test]
fn forced_reclaim_reports_unreleased_buffers() {
    let ctx = context(Completion::Immediate, ContextDesc::default());
    let pooled = ctx.acquire_buffer(desc(64), None);
    let held = ctx.acquire_buffer(desc(128), None);
    ctx.release_buffer(pooled).unwrap();

    assert_eq!(
        ctx.reclaim_buffers(true),
        Err(ContractViolation::BuffersOutstanding { count: 1 })
    );
    // the free list is emptied all the same
    assert_eq!(ctx.pooled_buffers(), (0, 0));
    assert_eq!(ctx.device().live_objects().buffers, 1);

    ctx.release_buffer(held).unwrap();
    let report = ctx.reclaim_buffers(true).unwrap();
    assert_eq!(report.destroyed, 1);
    assert_eq!(report.remaining, 0);
    let device = ctx.destroy().unwrap();
    assert_eq!(device.live_objects(), LiveObjects::default());
}

#[test]
fn teardown_with_unreleased_buffer_fails() {
    let ctx = context(Completion::Immediate, ContextDesc::default());
    let _leaked = ctx.acquire_buffer(desc(64), None);
    assert!(matches!(
        ctx.destroy(),
        Err(ContractViolation::BuffersOutstanding { count: 1 })
    ));
}
