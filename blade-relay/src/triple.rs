//! Triple-buffered dynamic buffers.
//!
//! Data rewritten every frame goes to a ring of three buffers so the CPU
//! never writes a buffer the GPU may still read for an earlier frame. The
//! first frame writes all three slots so each of them holds valid data.

use crate::{Buffer, BufferDesc, Context, ContractViolation, Device, StorageMode};
use std::{ops::Range, sync::Arc};

pub const TRIPLE_BUFFER_SLOTS: usize = 3;

pub struct TripleBuffer {
    slots: Arc<[Buffer; TRIPLE_BUFFER_SLOTS]>,
    active: usize,
    last_written_frame: u64,
    filling: bool,
}

impl TripleBuffer {
    fn new(slots: [Buffer; TRIPLE_BUFFER_SLOTS], frame: u64) -> Self {
        Self {
            slots: Arc::new(slots),
            active: 0,
            last_written_frame: frame,
            filling: true,
        }
    }

    /// Buffer to bind for the current frame.
    pub fn active(&self) -> Buffer {
        self.slots[self.active]
    }

    pub fn active_index(&self) -> usize {
        self.active
    }

    pub fn slot(&self, index: usize) -> Buffer {
        self.slots[index % TRIPLE_BUFFER_SLOTS]
    }

    /// Shared handle to all slots, for work that outlives this ring.
    pub fn slots(&self) -> Arc<[Buffer; TRIPLE_BUFFER_SLOTS]> {
        Arc::clone(&self.slots)
    }

    pub fn size(&self) -> u64 {
        self.slots[0].size
    }

    /// Still in the frame the ring was created in.
    pub fn is_filling(&self) -> bool {
        self.filling
    }

    /// Moves to the next slot on a new frame and returns the slots a write
    /// in `frame` has to go to.
    fn advance(&mut self, frame: u64) -> Range<usize> {
        if frame != self.last_written_frame {
            self.filling = false;
            self.active = (self.active + 1) % TRIPLE_BUFFER_SLOTS;
            self.last_written_frame = frame;
        }
        if self.filling {
            0..TRIPLE_BUFFER_SLOTS
        } else {
            self.active..self.active + 1
        }
    }
}

impl<D: Device> Context<D> {
    pub fn create_triple_buffer(&self, desc: BufferDesc, data: Option<&[u8]>) -> TripleBuffer {
        let slots = std::array::from_fn(|_| self.acquire_buffer(desc, data));
        TripleBuffer::new(slots, self.current_frame())
    }

    /// Writes `data` at `offset` into the slot of the current frame.
    pub fn write_triple_buffer(&self, buffer: &mut TripleBuffer, offset: u64, data: &[u8]) {
        let frame = self.current_frame();
        for index in buffer.advance(frame) {
            let slot = buffer.slots[index];
            self.device.write_buffer(slot, offset, data);
            if slot.storage == StorageMode::Managed {
                self.queue_buffer_flush(slot, offset..offset + data.len() as u64);
            }
        }
    }

    /// Returns all slots to the pool.
    pub fn release_triple_buffer(&self, buffer: TripleBuffer) -> Result<(), ContractViolation> {
        let mut result = Ok(());
        for &slot in buffer.slots.iter() {
            if let Err(e) = self.release_buffer(slot) {
                result = Err(e);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BufferKey;
    use slotmap::SlotMap;

    fn ring(frame: u64) -> TripleBuffer {
        let mut keys = SlotMap::<BufferKey, ()>::with_key();
        let slots = std::array::from_fn(|_| Buffer {
            raw: keys.insert(()),
            size: 64,
            storage: StorageMode::Shared,
        });
        TripleBuffer::new(slots, frame)
    }

    #[test]
    fn first_frame_fans_out() {
        let mut tb = ring(7);
        assert_eq!(tb.advance(7), 0..3);
        assert_eq!(tb.advance(7), 0..3);
        assert_eq!(tb.active_index(), 0);
        assert_eq!(tb.advance(8), 1..2);
        assert!(!tb.is_filling());
    }

    #[test]
    fn rotation_wraps_around() {
        let mut tb = ring(0);
        tb.advance(0);
        let order: Vec<usize> = (1..=4).map(|frame| tb.advance(frame).start).collect();
        assert_eq!(order, vec![1, 2, 0, 1]);
        // several writes in one frame stay on the same slot
        assert_eq!(tb.advance(4), 1..2);
        assert_eq!(tb.active(), tb.slot(1));
    }
}
