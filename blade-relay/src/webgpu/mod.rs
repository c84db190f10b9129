//! WebGPU device on top of wgpu.
//!
//! Objects live in a hub of slotmaps keyed by the crate handles. Finished
//! command lists are translated into wgpu passes at submit time.
//!
//! Metal-style render pipelines leave depth-stencil state, topology and
//! rasterizer state dynamic, while wgpu bakes them into the pipeline. The
//! device therefore only records the description of a render pipeline and
//! builds one wgpu pipeline per combination the first time a draw needs it.

mod command;
mod pipeline;
mod platform;
mod resource;

use crate::{
    sync::Watermark, traits::CompletionHandler, BindingKind, BlendState, BufferKey, CommandBufferKey, ColorWrites,
    ComputePipelineKey, CullMode, DepthState, DepthStencilKey, DeviceId, DeviceInformation,
    FrontFace, FunctionKey, MultisampleState, PrimitiveType, RenderPipelineKey,
    SamplerKey, ShaderStage, StorageMode, TextureFormat, TextureKey, VertexElement,
};
use slotmap::SlotMap;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;
#[cfg(not(target_arch = "wasm32"))]
use std::time::Instant;

pub use platform::PlatformError;

/// How long a blocking wait sleeps between two device polls.
const POLL_INTERVAL: Duration = Duration::from_millis(1);
/// wgpu has no notion of SIMD width, report the common one.
const THREAD_EXECUTION_WIDTH: u32 = 32;

//=============================================================================
// Internal Storage Entry Types
//=============================================================================

/// Internal buffer entry with shadow memory
struct BufferEntry {
    gpu: wgpu::Buffer,
    storage: StorageMode,
    /// CPU copy of a managed buffer. Host writes land here and reach the GPU
    /// copy when the modified range is flushed.
    shadow: Option<Box<[u8]>>,
}

struct TextureEntry {
    gpu: wgpu::Texture,
    view: wgpu::TextureView,
}

/// A resource an entry point reads through a bind group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct BindingSlot {
    group: u32,
    binding: u32,
    kind: BindingKind,
}

struct FunctionEntry {
    module: wgpu::ShaderModule,
    entry_point: String,
    stage: ShaderStage,
    slots: Vec<BindingSlot>,
    workgroup_size: [u32; 3],
}

/// Everything of a render pipeline that does not depend on draw state.
struct RenderPipelineEntry {
    name: String,
    vertex: FunctionKey,
    fragment: Option<FunctionKey>,
    /// Attribute location and fetch of every vertex buffer, in buffer order.
    vertex_buffers: Vec<(u32, VertexElement)>,
    color_formats: Vec<TextureFormat>,
    depth_format: Option<TextureFormat>,
    blend: Option<BlendState>,
    write_mask: ColorWrites,
    multisample: MultisampleState,
    slots: Vec<BindingSlot>,
}

struct ComputePipelineEntry {
    raw: wgpu::ComputePipeline,
    slots: Vec<BindingSlot>,
}

/// Draw state baked into a wgpu render pipeline.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
struct RealizedKey {
    pipeline: RenderPipelineKey,
    depth: Option<DepthStencilKey>,
    primitive: PrimitiveType,
    front_face: FrontFace,
    cull_mode: CullMode,
}

//=============================================================================
// The Hub: Central Resource Storage (RwLock for Concurrency)
//=============================================================================

/// Central storage for all GPU resources.
///
/// # Concurrency Model
/// - Command translation: `read()` access, concurrent
/// - Resource creation and destruction: `write()` access
struct Hub {
    buffers: SlotMap<BufferKey, BufferEntry>,
    textures: SlotMap<TextureKey, TextureEntry>,
    samplers: SlotMap<SamplerKey, wgpu::Sampler>,
    functions: SlotMap<FunctionKey, FunctionEntry>,
    render_pipelines: SlotMap<RenderPipelineKey, RenderPipelineEntry>,
    depth_stencil_states: SlotMap<DepthStencilKey, DepthState>,
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

//=============================================================================
// Completion Tracking
//=============================================================================

struct Completions {
    scheduled: Mutex<Watermark>,
    done: Mutex<Watermark>,
    cond: Condvar,
}

impl Default for Completions {
    fn default() -> Self {
        Self {
            scheduled: Mutex::new(Watermark::new(0)),
            done: Mutex::new(Watermark::new(0)),
            cond: Condvar::new(),
        }
    }
}

impl Completions {
    fn schedule(&self, sequence: u64) {
        self.scheduled.lock().unwrap().insert(sequence);
    }

    fn is_scheduled(&self, sequence: u64) -> bool {
        self.scheduled.lock().unwrap().contains(sequence)
    }

    fn complete(&self, sequence: u64) {
        self.done.lock().unwrap().insert(sequence);
        self.cond.notify_all();
    }

    fn contains(&self, sequence: u64) -> bool {
        self.done.lock().unwrap().contains(sequence)
    }

    fn wait(&self, sequence: u64, timeout: Duration) {
        let done = self.done.lock().unwrap();
        let _ = self
            .cond
            .wait_timeout_while(done, timeout, |done| !done.contains(sequence))
            .unwrap();
    }
}

//=============================================================================
// Device
//=============================================================================

pub struct WebGpuDevice {
    id: DeviceId,
    #[allow(dead_code)]
    instance: wgpu::Instance,
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    hub: RwLock<Hub>,
    /// Pipelines built for a particular draw state.
    realized: Mutex<HashMap<RealizedKey, wgpu::RenderPipeline>>,
    completions: Arc<Completions>,
}

impl WebGpuDevice {
    fn from_parts(
        instance: wgpu::Instance,
        adapter: wgpu::Adapter,
        device: wgpu::Device,
        queue: wgpu::Queue,
    ) -> Self {
        device.set_device_lost_callback(|reason, message| {
            log::error!("WebGPU device lost: {:?} - {}", reason, message);
        });
        let id = DeviceId::next();
        let info = adapter.get_info();
        log::info!("WebGPU device {:?} on '{}' ({:?})", id, info.name, info.backend);
        Self {
            id,
            instance,
            adapter,
            device,
            queue,
            hub: RwLock::new(Hub::new()),
            realized: Mutex::new(HashMap::new()),
            completions: Arc::new(Completions::default()),
        }
    }

    pub fn raw_device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn raw_queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Polls the device until `done` holds or `timeout` passes. `done` gets
    /// the time it may block for.
    #[cfg(not(target_arch = "wasm32"))]
    fn poll_until(&self, timeout: Duration, mut done: impl FnMut(Duration) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if let Err(e) = self.device.poll(wgpu::PollType::Poll) {
                log::error!("WebGPU poll failed: {e}");
                return false;
            }
            let now = Instant::now();
            let remaining = deadline.saturating_duration_since(now);
            if done(remaining.min(POLL_INTERVAL)) {
                return true;
            }
            if remaining.is_zero() {
                return false;
            }
        }
    }

    /// The browser drives the device, a blocking wait only checks once.
    #[cfg(target_arch = "wasm32")]
    fn poll_until(&self, _timeout: Duration, mut done: impl FnMut(Duration) -> bool) -> bool {
        done(Duration::ZERO)
    }
}

#[hidden_trait::expose]
impl crate::traits::Device for WebGpuDevice {
    fn info(&self) -> DeviceInformation {
        let info = self.adapter.get_info();
        DeviceInformation {
            id: self.id,
            device_name: info.name,
            driver_name: info.driver,
            is_software_emulated: info.device_type == wgpu::DeviceType::Cpu,
        }
    }
}
