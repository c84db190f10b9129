//! Coalescing of modified ranges of managed buffers.

use crate::{Buffer, Context, Device, StorageMode};
use std::{ops::Range, sync::Mutex};

#[derive(Default)]
struct FlushState {
    /// Between `prepare_buffer_flush` and `flush_buffers`.
    batching: bool,
    pending: Vec<(Buffer, Range<u64>)>,
}

impl FlushState {
    /// Adds a range and returns what has to be flushed right away.
    fn queue(&mut self, buffer: Buffer, range: Range<u64>) -> Option<(Buffer, Range<u64>)> {
        if !self.batching {
            return Some((buffer, range));
        }
        let Some(entry) = self.pending.iter_mut().find(|entry| entry.0 == buffer) else {
            self.pending.push((buffer, range));
            return None;
        };
        if entry.1.end == range.start {
            entry.1.end = range.end;
            None
        } else {
            let flushed = std::mem::replace(&mut entry.1, range);
            Some((buffer, flushed))
        }
    }

    /// Removes the collected range of `buffer`, if any.
    fn take(&mut self, buffer: Buffer) -> Option<Range<u64>> {
        let index = self.pending.iter().position(|entry| entry.0 == buffer)?;
        Some(self.pending.swap_remove(index).1)
    }
}

pub(crate) struct FlushQueue {
    state: Mutex<FlushState>,
}

impl FlushQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FlushState::default()),
        }
    }
}

impl<D: Device> Context<D> {
    /// Starts collecting modified ranges instead of flushing them one by one.
    pub fn prepare_buffer_flush(&self) {
        self.flushes.state.lock().unwrap().batching = true;
    }

    /// Notes that the CPU modified `range` of a managed buffer. Contiguous
    /// ranges of the same buffer are merged while a flush is prepared.
    pub fn queue_buffer_flush(&self, buffer: Buffer, range: Range<u64>) {
        if buffer.storage != StorageMode::Managed || range.is_empty() {
            return;
        }
        let flushed = self.flushes.state.lock().unwrap().queue(buffer, range);
        if let Some((buffer, range)) = flushed {
            self.device.did_modify_range(buffer, range);
        }
    }

    /// Drops the collected range of a buffer going back to the pool. Its
    /// contents are dead once released.
    pub(crate) fn discard_buffer_flush(&self, buffer: Buffer) {
        let range = self.flushes.state.lock().unwrap().take(buffer);
        if let Some(range) = range {
            log::trace!("Discarding flush of {range:?} of a released buffer");
        }
    }

    /// Flushes every collected range and ends the batching window.
    pub fn flush_buffers(&self) {
        let pending = {
            let mut state = self.flushes.state.lock().unwrap();
            state.batching = false;
            std::mem::take(&mut state.pending)
        };
        for (buffer, range) in pending {
            self.device.did_modify_range(buffer, range);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BufferKey;
    use slotmap::SlotMap;

    fn managed(count: usize) -> Vec<Buffer> {
        let mut keys = SlotMap::<BufferKey, ()>::with_key();
        (0..count)
            .map(|_| Buffer {
                raw: keys.insert(()),
                size: 256,
                storage: StorageMode::Managed,
            })
            .collect()
    }

    #[test]
    fn immediate_outside_window() {
        let mut state = FlushState::default();
        let buffer = managed(1)[0];
        assert_eq!(state.queue(buffer, 0..16), Some((buffer, 0..16)));
        assert!(state.pending.is_empty());
    }

    #[test]
    fn contiguous_ranges_merge() {
        let mut state = FlushState {
            batching: true,
            ..FlushState::default()
        };
        let list = managed(2);
        assert_eq!(state.queue(list[0], 0..16), None);
        assert_eq!(state.queue(list[1], 32..48), None);
        assert_eq!(state.queue(list[0], 16..40), None);
        assert_eq!(state.pending, vec![(list[0], 0..40), (list[1], 32..48)]);

        // a gap flushes what was collected and starts over
        assert_eq!(state.queue(list[0], 100..110), Some((list[0], 0..40)));
        assert_eq!(state.pending[0], (list[0], 100..110));
    }

    #[test]
    fn take_removes_one_buffer() {
        let mut state = FlushState {
            batching: true,
            ..FlushState::default()
        };
        let list = managed(3);
        for (i, &buffer) in list.iter().enumerate() {
            state.queue(buffer, 0..(i as u64 + 1) * 8);
        }
        assert_eq!(state.take(list[0]), Some(0..8));
        assert_eq!(state.take(list[0]), None);
        assert_eq!(state.pending.len(), 2);
        assert!(state.pending.iter().all(|entry| entry.0 != list[0]));
    }
}
