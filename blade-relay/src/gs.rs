//! ComputeGS batching.
//!
//! Geometry expansion runs as compute work on the auxiliary queue and writes
//! into a small rotation of batch buffers that the default queue reads from.
//! Opening a batch makes the default queue wait for the next auxiliary
//! signal, closing it emits that signal. Once every buffer of the rotation
//! holds an encoded batch, both queues are committed so the oldest buffer
//! can be written again.

use crate::{
    Buffer, BufferDesc, CacheMode, Context, ContractViolation, Device, Function, QueueId,
    RecordingState, StorageMode,
};

const GS_ALIGNMENT: u32 = 16;

/// Where a ComputeGS part writes its output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GsPart {
    pub buffer: Buffer,
    pub vertex_offset: u32,
    pub primitive_offset: u32,
    /// The part opened a new batch.
    pub new_batch: bool,
}

#[derive(Debug, Default)]
pub(crate) struct GsState {
    pub function: Option<Function>,
    /// Batch buffers, acquired from the pool on first use.
    pub buffers: Vec<Buffer>,
    pub index: usize,
    pub offset: u32,
    pub encoded_batches: u32,
    pub has_open_batch: bool,
}

impl GsState {
    pub fn reset(&mut self) {
        self.index = 0;
        self.offset = 0;
        self.encoded_batches = 0;
    }

    fn advance(&mut self, batch_count: u32) {
        self.index = (self.index + 1) % batch_count.max(1) as usize;
        self.offset = 0;
    }
}

fn align(size: u32) -> u32 {
    (size + GS_ALIGNMENT - 1) & !(GS_ALIGNMENT - 1)
}

impl<D: Device> Context<D> {
    /// Number of input primitives whose output fits into one batch.
    pub fn max_compute_gs_part_size(
        &self,
        out_vertices_per_primitive: u32,
        out_primitives_per_primitive: u32,
        data_per_vertex: u32,
        data_per_primitive: u32,
    ) -> u32 {
        let per_primitive = out_vertices_per_primitive
            .saturating_mul(data_per_vertex)
            .saturating_add(out_primitives_per_primitive.saturating_mul(data_per_primitive));
        if per_primitive == 0 {
            return u32::MAX;
        }
        // room for aligning both the vertex and the primitive data
        let usable = self
            .desc
            .gs_max_data_per_batch
            .saturating_sub(2 * (GS_ALIGNMENT - 1));
        usable / per_primitive
    }

    /// Reserves room for a ComputeGS part producing `vertex_data` and
    /// `primitive_data` bytes. Moves to the next batch buffer when the
    /// current one is full, which may commit both queues.
    ///
    /// Opening a batch records a wait on the default queue, so its encoder
    /// must not be in use.
    pub fn prepare_for_compute_gs_part(
        &self,
        state: &mut RecordingState,
        vertex_data: u32,
        primitive_data: u32,
    ) -> Result<GsPart, ContractViolation> {
        if state.gs.function.is_none() {
            return Err(ContractViolation::ComputeGsDisabled);
        }
        let max = self.desc.gs_max_data_per_batch;
        let vertex_data = align(vertex_data);
        let primitive_data = align(primitive_data);
        let size = vertex_data.saturating_add(primitive_data);
        if size > max {
            return Err(ContractViolation::GsPartTooLarge { size, max });
        }

        let use_next_buffer = state.gs.offset + size > max;
        let new_batch = use_next_buffer || !state.gs.has_open_batch;
        if use_next_buffer {
            state.gs.advance(self.desc.gs_max_concurrent_batches);
        }
        while state.gs.buffers.len() <= state.gs.index {
            let buffer = self.acquire_buffer(
                BufferDesc {
                    name: "compute-gs",
                    size: max as u64,
                    storage: StorageMode::Private,
                    cache: CacheMode::DefaultCache,
                },
                None,
            );
            state.gs.buffers.push(buffer);
        }

        let part = GsPart {
            buffer: state.gs.buffers[state.gs.index],
            vertex_offset: state.gs.offset,
            primitive_offset: state.gs.offset + vertex_data,
            new_batch,
        };
        state.gs.offset += size;
        if new_batch {
            self.gs_encode_sync(state, true)?;
        }
        Ok(part)
    }

    /// Closes the open batch by signalling the auxiliary queue.
    pub(crate) fn close_gs_batch(&self, state: &mut RecordingState) -> Result<(), ContractViolation> {
        self.gs_encode_sync(state, false)
    }

    fn gs_encode_sync(
        &self,
        state: &mut RecordingState,
        open_batch: bool,
    ) -> Result<(), ContractViolation> {
        if state.gs.has_open_batch {
            self.ensure_command_buffer(state, QueueId::AuxiliaryCompute)?;
            self.encode_signal_event(state, QueueId::AuxiliaryCompute)?;
            state.gs.has_open_batch = false;
            if open_batch {
                state.gs.encoded_batches += 1;
                if state.gs.encoded_batches >= self.desc.gs_max_concurrent_batches {
                    log::debug!(
                        "ComputeGS rotation full after {} batches, committing",
                        state.gs.encoded_batches
                    );
                    self.commit(state, QueueId::AuxiliaryCompute, false)?;
                    self.commit(state, QueueId::Default, false)?;
                    state.gs.encoded_batches = 0;
                }
            }
        }

        if open_batch {
            self.ensure_command_buffer(state, QueueId::AuxiliaryCompute)?;
            self.ensure_command_buffer(state, QueueId::Default)?;
            self.encode_wait_for_event(
                state,
                QueueId::Default,
                QueueId::AuxiliaryCompute,
                0,
            )?;
            state.gs.has_open_batch = true;
            self.stats.inc_gs_batches_started();
        }
        Ok(())
    }
}
