//! Pool of transient buffers.
//!
//! Released buffers stay in a free list until the GPU is known to be done
//! with them. A buffer is handed out again only to a request with the exact
//! same size, storage and cache mode, and only once enough command buffers
//! have completed since its release.

use crate::{
    Buffer, BufferDesc, CacheMode, Context, ContextDesc, ContractViolation, Device, StorageMode,
};
use std::collections::HashMap;
use std::sync::Mutex;

/// A buffer sitting in the free list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PooledBuffer {
    pub buffer: Buffer,
    pub storage: StorageMode,
    pub cache: CacheMode,
    pub released_on_frame: u64,
    /// Number of committed command buffers at release time.
    pub released_on_command_buffer: u64,
}

/// Outcome of [`Context::reclaim_buffers`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub destroyed: usize,
    pub destroyed_bytes: u64,
    pub remaining: usize,
    pub remaining_bytes: u64,
}

/// Progress of the GPU as seen by the pool.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PoolAges {
    pub frame: u64,
    pub last_completed_frame: i64,
    pub committed: u64,
    pub last_completed_command_buffer: i64,
}

#[derive(Clone, Copy, Debug)]
struct PoolPolicy {
    safe_reuse_age: u64,
    max_age_in_frames: u64,
    max_age_in_command_buffers: u64,
    high_memory_threshold: u64,
}

impl PoolPolicy {
    fn is_safe(&self, entry: &PooledBuffer, ages: PoolAges) -> bool {
        ages.last_completed_command_buffer
            >= (entry.released_on_command_buffer + self.safe_reuse_age) as i64
    }

    fn is_expired(&self, entry: &PooledBuffer, ages: PoolAges) -> bool {
        let frame_age = ages.last_completed_frame - entry.released_on_frame as i64;
        let cb_age = ages.last_completed_command_buffer - entry.released_on_command_buffer as i64;
        frame_age > self.max_age_in_frames as i64
            || cb_age > self.max_age_in_command_buffers as i64
    }
}

#[derive(Default)]
struct PoolInner {
    free: Vec<PooledBuffer>,
    /// Buffers handed out and not yet released.
    outstanding: HashMap<Buffer, CacheMode>,
    pooled_bytes: u64,
}

pub(crate) struct BufferPool {
    policy: PoolPolicy,
    inner: Mutex<PoolInner>,
}

impl BufferPool {
    pub fn new(desc: &ContextDesc) -> Self {
        Self {
            policy: PoolPolicy {
                safe_reuse_age: desc.safe_buffer_reuse_age,
                max_age_in_frames: desc.max_buffer_age_in_frames,
                max_age_in_command_buffers: desc.max_buffer_age_in_command_buffers,
                high_memory_threshold: desc.high_memory_threshold,
            },
            inner: Mutex::new(PoolInner::default()),
        }
    }

    /// Removes a matching buffer from the free list. Also returns the number
    /// of entries inspected.
    fn take(&self, desc: &BufferDesc, ages: PoolAges) -> (Option<Buffer>, u64) {
        let mut inner = self.inner.lock().unwrap();
        let mut searched = 0;
        let position = inner.free.iter().position(|entry| {
            searched += 1;
            entry.buffer.size == desc.size
                && entry.storage == desc.storage
                && entry.cache == desc.cache
                && self.policy.is_safe(entry, ages)
        });
        let buffer = position.map(|index| {
            let entry = inner.free.swap_remove(index);
            inner.pooled_bytes -= entry.buffer.size;
            entry.buffer
        });
        (buffer, searched)
    }

    fn track(&self, buffer: Buffer, cache: CacheMode) {
        self.inner.lock().unwrap().outstanding.insert(buffer, cache);
    }

    fn release(&self, buffer: Buffer, ages: PoolAges) -> Result<(), ContractViolation> {
        let mut inner = self.inner.lock().unwrap();
        let cache = inner
            .outstanding
            .remove(&buffer)
            .ok_or(ContractViolation::BufferNotOutstanding)?;
        inner.pooled_bytes += buffer.size;
        inner.free.push(PooledBuffer {
            buffer,
            storage: buffer.storage,
            cache,
            released_on_frame: ages.frame,
            released_on_command_buffer: ages.committed,
        });
        Ok(())
    }

    /// Removes the entries to destroy from the free list.
    fn reclaim(&self, ages: PoolAges, force: bool) -> Vec<PooledBuffer> {
        let mut inner = self.inner.lock().unwrap();
        let doomed = if force {
            std::mem::take(&mut inner.free)
        } else {
            let (expired, mut kept): (Vec<_>, Vec<_>) = inner
                .free
                .drain(..)
                .partition(|entry| self.policy.is_expired(entry, ages));
            let mut doomed = expired;
            let mut pooled: u64 = kept.iter().map(|entry| entry.buffer.size).sum();
            if pooled > self.policy.high_memory_threshold {
                kept.sort_by_key(|entry| (entry.released_on_command_buffer, entry.released_on_frame));
                let mut survivors = Vec::with_capacity(kept.len());
                for entry in kept {
                    if pooled > self.policy.high_memory_threshold
                        && self.policy.is_safe(&entry, ages)
                    {
                        pooled -= entry.buffer.size;
                        doomed.push(entry);
                    } else {
                        survivors.push(entry);
                    }
                }
                kept = survivors;
            }
            inner.free = kept;
            doomed
        };
        inner.pooled_bytes = inner.free.iter().map(|entry| entry.buffer.size).sum();
        doomed
    }

    fn free_stats(&self) -> (usize, u64) {
        let inner = self.inner.lock().unwrap();
        (inner.free.len(), inner.pooled_bytes)
    }

    fn outstanding_count(&self) -> usize {
        self.inner.lock().unwrap().outstanding.len()
    }
}

impl<D: Device> Context<D> {
    pub(crate) fn pool_ages(&self) -> PoolAges {
        PoolAges {
            frame: self.accounting.current_frame(),
            last_completed_frame: self.accounting.last_completed_frame(),
            committed: self.accounting.committed_count(),
            last_completed_command_buffer: self.accounting.last_completed_command_buffer(),
        }
    }

    /// Returns a buffer matching `desc`, reusing a pooled one when the GPU is
    /// done with it. `data` is copied into the buffer.
    #[profiling::function]
    pub fn acquire_buffer(&self, desc: BufferDesc, data: Option<&[u8]>) -> Buffer {
        let (reused, searched) = self.buffers.take(&desc, self.pool_ages());
        self.stats.add_buffer_searches(searched);
        let buffer = match reused {
            Some(buffer) => {
                log::trace!("Reusing pooled buffer {:?} for '{}'", buffer.raw, desc.name);
                self.stats.inc_buffers_reused();
                if let Some(data) = data {
                    self.device.write_buffer(buffer, 0, data);
                    if buffer.storage == StorageMode::Managed {
                        self.queue_buffer_flush(buffer, 0..data.len() as u64);
                    }
                }
                buffer
            }
            None => {
                let buffer = self.device.create_buffer(desc, data);
                self.stats.buffer_created(desc.size);
                buffer
            }
        };
        self.buffers.track(buffer, desc.cache);
        buffer
    }

    /// Returns a buffer obtained from [`Self::acquire_buffer`] to the pool.
    pub fn release_buffer(&self, buffer: Buffer) -> Result<(), ContractViolation> {
        self.discard_buffer_flush(buffer);
        self.buffers.release(buffer, self.pool_ages())
    }

    /// Destroys pooled buffers that aged out, then the oldest safe ones while
    /// the pool holds more than the high memory threshold. With `force`,
    /// destroys every pooled buffer and fails if any buffer is still
    /// acquired.
    pub fn reclaim_buffers(&self, force: bool) -> Result<ReclaimReport, ContractViolation> {
        let doomed = self.buffers.reclaim(self.pool_ages(), force);
        let mut report = ReclaimReport::default();
        for entry in doomed {
            report.destroyed += 1;
            report.destroyed_bytes += entry.buffer.size;
            self.device.destroy_buffer(entry.buffer);
            self.stats.buffer_destroyed(entry.buffer.size);
        }
        let (remaining, remaining_bytes) = self.buffers.free_stats();
        report.remaining = remaining;
        report.remaining_bytes = remaining_bytes;
        if report.destroyed != 0 {
            log::debug!(
                "Reclaimed {} buffers ({} bytes), {} remain pooled",
                report.destroyed,
                report.destroyed_bytes,
                report.remaining
            );
        }
        if force {
            let count = self.buffers.outstanding_count();
            if count != 0 {
                return Err(ContractViolation::BuffersOutstanding { count });
            }
        }
        Ok(report)
    }

    /// Number of buffers in the free list and their total size.
    pub fn pooled_buffers(&self) -> (usize, u64) {
        self.buffers.free_stats()
    }

    pub fn outstanding_buffer_count(&self) -> usize {
        self.buffers.outstanding_count()
    }
}
