//! Resource statistics.

use crate::EncoderKind;
use std::sync::atomic::{AtomicU64, Ordering};
use strum::{EnumCount as _, IntoEnumIterator as _};

/// Snapshot of the resource counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub buffer_searches: u64,
    pub buffers_reused: u64,
    pub buffers_created: u64,
    pub buffers_destroyed: u64,
    /// Bytes held by live buffers, pooled or outstanding.
    pub buffer_bytes: u64,
    pub peak_buffer_bytes: u64,
    pub pipelines_created: u64,
    pub command_buffers_created: u64,
    pub command_buffers_committed: u64,
    pub encoders_requested: [u64; EncoderKind::COUNT],
    pub encoders_created: [u64; EncoderKind::COUNT],
    pub gs_batches_started: u64,
    pub frames: u64,
}

/// Counters updated from any recording thread.
#[derive(Debug, Default)]
pub(crate) struct ResourceStats {
    buffer_searches: AtomicU64,
    buffers_reused: AtomicU64,
    buffers_created: AtomicU64,
    buffers_destroyed: AtomicU64,
    buffer_bytes: AtomicU64,
    peak_buffer_bytes: AtomicU64,
    pipelines_created: AtomicU64,
    command_buffers_created: AtomicU64,
    command_buffers_committed: AtomicU64,
    encoders_requested: [AtomicU64; EncoderKind::COUNT],
    encoders_created: [AtomicU64; EncoderKind::COUNT],
    gs_batches_started: AtomicU64,
    frames: AtomicU64,
}

impl ResourceStats {
    pub fn add_buffer_searches(&self, count: u64) {
        self.buffer_searches.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_buffers_reused(&self) {
        self.buffers_reused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn buffer_created(&self, size: u64) {
        self.buffers_created.fetch_add(1, Ordering::Relaxed);
        let total = self.buffer_bytes.fetch_add(size, Ordering::Relaxed) + size;
        self.peak_buffer_bytes.fetch_max(total, Ordering::Relaxed);
    }

    pub fn buffer_destroyed(&self, size: u64) {
        self.buffers_destroyed.fetch_add(1, Ordering::Relaxed);
        self.buffer_bytes.fetch_sub(size, Ordering::Relaxed);
    }

    pub fn inc_pipelines_created(&self) {
        self.pipelines_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_command_buffers_created(&self) {
        self.command_buffers_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_command_buffers_committed(&self) {
        self.command_buffers_committed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_encoders_requested(&self, kind: EncoderKind) {
        self.encoders_requested[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_encoders_created(&self, kind: EncoderKind) {
        self.encoders_created[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_gs_batches_started(&self) {
        self.gs_batches_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_frames(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            buffer_searches: load(&self.buffer_searches),
            buffers_reused: load(&self.buffers_reused),
            buffers_created: load(&self.buffers_created),
            buffers_destroyed: load(&self.buffers_destroyed),
            buffer_bytes: load(&self.buffer_bytes),
            peak_buffer_bytes: load(&self.peak_buffer_bytes),
            pipelines_created: load(&self.pipelines_created),
            command_buffers_created: load(&self.command_buffers_created),
            command_buffers_committed: load(&self.command_buffers_committed),
            encoders_requested: std::array::from_fn(|i| load(&self.encoders_requested[i])),
            encoders_created: std::array::from_fn(|i| load(&self.encoders_created[i])),
            gs_batches_started: load(&self.gs_batches_started),
            frames: load(&self.frames),
        }
    }

    /// Logs per-frame averages of every counter.
    pub fn report(&self) {
        let s = self.snapshot();
        let frames = s.frames.max(1) as f64;
        let per_frame = |value: u64| value as f64 / frames;
        log::info!("Resource statistics over {} frames:", s.frames);
        log::info!(
            "\tbuffers: {:.2} searches, {:.2} reused, {:.2} created, {:.2} destroyed per frame",
            per_frame(s.buffer_searches),
            per_frame(s.buffers_reused),
            per_frame(s.buffers_created),
            per_frame(s.buffers_destroyed),
        );
        log::info!(
            "\tbuffer memory: {} bytes live, {} bytes peak",
            s.buffer_bytes,
            s.peak_buffer_bytes
        );
        log::info!(
            "\tcommand buffers: {:.2} created, {:.2} committed per frame",
            per_frame(s.command_buffers_created),
            per_frame(s.command_buffers_committed),
        );
        log::info!("\tpipelines created: {}", s.pipelines_created);
        log::info!(
            "\tComputeGS batches: {:.2} started per frame",
            per_frame(s.gs_batches_started)
        );
        for kind in EncoderKind::iter() {
            log::info!(
                "\t{:?} encoders: {:.2} requested, {:.2} created per frame",
                kind,
                per_frame(s.encoders_requested[kind.index()]),
                per_frame(s.encoders_created[kind.index()]),
            );
        }
    }
}
