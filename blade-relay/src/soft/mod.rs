//! Software device.
//!
//! Objects live in host memory and submitted command lists are replayed on
//! the CPU: copies, fills and writes land in the buffer contents, everything
//! else is only validated. Completion is either reported inside `submit` or
//! deferred until the owner retires submissions, which models a GPU that
//! lags behind the recording threads.

mod command;
mod resource;

use crate::{
    sync::Watermark, traits::CompletionHandler, BufferKey, CommandBufferKey, Command,
    ComputePipelineKey, DepthStencilKey, DeviceId, DeviceInformation, FunctionKey, QueueId,
    RenderPipelineKey, SamplerKey, ShaderStage, StorageMode, TextureKey,
};
use slotmap::SlotMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, RwLock};

/// Threads per SIMD group reported for compute pipelines.
const THREAD_EXECUTION_WIDTH: u32 = 32;
const MAX_THREADS_PER_THREADGROUP: u32 = 1024;

/// When the device reports submitted work as complete.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Completion {
    /// Inside `submit`, right after the replay.
    #[default]
    Immediate,
    /// Only through [`SoftDevice::retire`] and [`SoftDevice::retire_all`].
    Deferred,
}

//=============================================================================
// Internal Storage Entry Types
//=============================================================================

struct BufferEntry {
    name: String,
    contents: Vec<u8>,
    storage: StorageMode,
    /// Managed range flushes seen so far.
    flushed_ranges: u64,
}

struct TextureEntry {
    name: String,
    contents: Vec<u8>,
}

struct SamplerEntry {
    name: String,
}

struct FunctionEntry {
    name: String,
    stage: ShaderStage,
}

struct RenderPipelineEntry {
    name: String,
}

struct DepthStencilEntry {
    name: String,
}

struct ComputePipelineEntry {
    name: String,
}

//=============================================================================
// The Hub: Central Resource Storage (RwLock for Concurrency)
//=============================================================================

struct Hub {
    buffers: SlotMap<BufferKey, BufferEntry>,
    textures: SlotMap<TextureKey, TextureEntry>,
    samplers: SlotMap<SamplerKey, SamplerEntry>,
    functions: SlotMap<FunctionKey, FunctionEntry>,
    render_pipelines: SlotMap<RenderPipelineKey, RenderPipelineEntry>,
    depth_stencil_states: SlotMap<DepthStencilKey, DepthStencilEntry>,
    compute_pipelines: SlotMap<ComputePipelineKey, ComputePipelineEntry>,
    command_buffers: SlotMap<CommandBufferKey, ()>,
}

impl Hub {
    fn new() -> Self {
        Self {
            buffers: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            samplers: SlotMap::with_key(),
            functions: SlotMap::with_key(),
            render_pipelines: SlotMap::with_key(),
            depth_stencil_states: SlotMap::with_key(),
            compute_pipelines: SlotMap::with_key(),
            command_buffers: SlotMap::with_key(),
        }
    }
}

/// Number of live device objects per kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LiveObjects {
    pub buffers: usize,
    pub textures: usize,
    pub samplers: usize,
    pub functions: usize,
    pub render_pipelines: usize,
    pub depth_stencil_states: usize,
    pub compute_pipelines: usize,
    pub command_buffers: usize,
}

impl LiveObjects {
    pub fn total(&self) -> usize {
        self.buffers
            + self.textures
            + self.samplers
            + self.functions
            + self.render_pipelines
            + self.depth_stencil_states
            + self.compute_pipelines
            + self.command_buffers
    }
}

/// A command list as the device received it.
#[derive(Clone, Debug)]
pub struct SubmittedWork {
    pub queue: QueueId,
    pub sequence: u64,
    pub label: String,
    pub commands: Vec<Command>,
    pub plain_data: Vec<u8>,
}

impl SubmittedWork {
    pub fn signals(&self) -> impl Iterator<Item = u64> + '_ {
        self.commands.iter().filter_map(|command| match *command {
            Command::SignalEvent { value } => Some(value),
            _ => None,
        })
    }

    pub fn waits(&self) -> impl Iterator<Item = u64> + '_ {
        self.commands.iter().filter_map(|command| match *command {
            Command::WaitForEvent { value } => Some(value),
            _ => None,
        })
    }
}

//=============================================================================
// Device
//=============================================================================

pub struct SoftDevice {
    id: DeviceId,
    completion: Completion,
    hub: RwLock<Hub>,
    submissions: Mutex<Vec<SubmittedWork>>,
    /// Deferred completions in submission order.
    in_flight: Mutex<VecDeque<(u64, CompletionHandler)>>,
    /// Sequences handed to `submit`.
    scheduled: Mutex<Watermark>,
    completed: Mutex<Watermark>,
    completed_cond: Condvar,
    /// Commands that referenced an object no longer alive.
    dangling_references: AtomicU64,
}

impl SoftDevice {
    pub fn new(completion: Completion) -> Self {
        let id = DeviceId::next();
        log::debug!("Soft device {:?} with {:?} completion", id, completion);
        Self {
            id,
            completion,
            hub: RwLock::new(Hub::new()),
            submissions: Mutex::new(Vec::new()),
            in_flight: Mutex::new(VecDeque::new()),
            scheduled: Mutex::new(Watermark::new(0)),
            completed: Mutex::new(Watermark::new(0)),
            completed_cond: Condvar::new(),
            dangling_references: AtomicU64::new(0),
        }
    }

    pub fn completion(&self) -> Completion {
        self.completion
    }

    pub fn live_objects(&self) -> LiveObjects {
        let hub = self.hub.read().unwrap();
        LiveObjects {
            buffers: hub.buffers.len(),
            textures: hub.textures.len(),
            samplers: hub.samplers.len(),
            functions: hub.functions.len(),
            render_pipelines: hub.render_pipelines.len(),
            depth_stencil_states: hub.depth_stencil_states.len(),
            compute_pipelines: hub.compute_pipelines.len(),
            command_buffers: hub.command_buffers.len(),
        }
    }

    /// Everything submitted so far, in device order.
    pub fn submissions(&self) -> Vec<SubmittedWork> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }

    /// Number of submissions whose completion has not been reported yet.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    pub fn dangling_references(&self) -> u64 {
        self.dangling_references.load(Ordering::Relaxed)
    }

    /// Debug name of a live buffer.
    pub fn buffer_name(&self, buffer: crate::Buffer) -> Option<String> {
        let hub = self.hub.read().unwrap();
        hub.buffers.get(buffer.raw).map(|entry| entry.name.clone())
    }

    /// Number of modified ranges flushed for a live buffer.
    pub fn flushed_ranges(&self, buffer: crate::Buffer) -> u64 {
        let hub = self.hub.read().unwrap();
        hub.buffers.get(buffer.raw).map_or(0, |entry| entry.flushed_ranges)
    }

    /// Completes the `count` oldest in-flight submissions. Returns how many
    /// were completed.
    pub fn retire(&self, count: usize) -> usize {
        let retired: Vec<_> = {
            let mut in_flight = self.in_flight.lock().unwrap();
            let count = count.min(in_flight.len());
            in_flight.drain(..count).collect()
        };
        let n = retired.len();
        for (sequence, on_complete) in retired {
            self.complete(sequence, on_complete);
        }
        n
    }

    pub fn retire_all(&self) -> usize {
        self.retire(usize::MAX)
    }

    fn complete(&self, sequence: u64, on_complete: CompletionHandler) {
        log::trace!("Soft device completed submission {sequence}");
        on_complete();
        self.completed.lock().unwrap().insert(sequence);
        self.completed_cond.notify_all();
    }

    fn report_dangling(&self, what: &str, sequence: u64) {
        log::error!("Submission {sequence} references a destroyed {what}");
        self.dangling_references.fetch_add(1, Ordering::Relaxed);
    }
}

#[hidden_trait::expose]
impl crate::traits::Device for SoftDevice {
    fn info(&self) -> DeviceInformation {
        DeviceInformation {
            id: self.id,
            device_name: "Soft".to_string(),
            driver_name: "blade-relay".to_string(),
            is_software_emulated: true,
        }
    }
}
