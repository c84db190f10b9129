//! The context shared by all recording threads.

use crate::{
    flush::FlushQueue, frame::FrameAccounting, index::SharedIndices, pipeline::PipelineCaches,
    pool::BufferPool, queue::CommandBufferPool, stats::ResourceStats, sync::Scheduler, Buffer,
    ContextDesc, ContractViolation, Device, DeviceInformation, Extent, Function, FunctionDesc,
    PipelineError, Sampler, SamplerDesc, StatsSnapshot, Texture, TextureDesc, TextureDimension,
    TextureFormat, TextureUsage,
};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};

/// Stand-ins bound in place of missing textures and samplers.
pub(crate) struct Dummies {
    black_2d: Texture,
    black_2d_array: Texture,
    sampler: Sampler,
    reported: AtomicBool,
}

impl Dummies {
    fn new<D: Device>(device: &D) -> Self {
        let black = [0u8, 0, 0, 0xFF];
        let texture = |name, dimension| {
            device.create_texture(
                TextureDesc {
                    name,
                    format: TextureFormat::Rgba8Unorm,
                    size: Extent::default(),
                    array_layer_count: 1,
                    dimension,
                    usage: TextureUsage::RESOURCE,
                },
                Some(&black),
            )
        };
        Self {
            black_2d: texture("dummy-black-2d", TextureDimension::D2),
            black_2d_array: texture("dummy-black-2d-array", TextureDimension::D2Array),
            sampler: device.create_sampler(SamplerDesc {
                name: "dummy-sampler",
                ..Default::default()
            }),
            reported: AtomicBool::new(false),
        }
    }

    fn report(&self) {
        if !self.reported.swap(true, Ordering::Relaxed) {
            log::debug!("Substituting dummy resources for unbound textures or samplers");
        }
    }

    pub fn texture(&self, array: bool) -> Texture {
        self.report();
        if array {
            self.black_2d_array
        } else {
            self.black_2d
        }
    }

    pub fn sampler(&self) -> Sampler {
        self.report();
        self.sampler
    }

    fn destroy<D: Device>(&self, device: &D) {
        device.destroy_texture(self.black_2d);
        device.destroy_texture(self.black_2d_array);
        device.destroy_sampler(self.sampler);
    }
}

/// Orchestrates recording, caching, pooling and submission on top of a
/// device. Shared by reference between recording threads.
pub struct Context<D: Device> {
    pub(crate) device: D,
    pub(crate) info: DeviceInformation,
    pub(crate) desc: ContextDesc,
    pub(crate) command_buffers: CommandBufferPool,
    pub(crate) pipelines: PipelineCaches,
    pub(crate) buffers: BufferPool,
    pub(crate) flushes: FlushQueue,
    pub(crate) accounting: Arc<FrameAccounting>,
    pub(crate) stats: ResourceStats,
    /// Next event token to signal.
    pub(crate) events: AtomicU64,
    pub(crate) scheduler: Mutex<Scheduler>,
    pub(crate) shared_indices: SharedIndices,
    pub(crate) dummies: Dummies,
    pub(crate) next_recorder: AtomicU64,
}

impl<D: Device> Context<D> {
    pub fn new(device: D, desc: ContextDesc) -> Self {
        let info = device.info();
        log::info!(
            "Context on '{}' ({}), software: {}",
            info.device_name,
            info.driver_name,
            info.is_software_emulated
        );
        log::debug!("{desc:?}");
        if desc.capture {
            log::info!("Capture mode, command buffers are not recycled");
        }
        let dummies = Dummies::new(&device);
        Self {
            info,
            command_buffers: CommandBufferPool::new(desc.command_buffer_pool_size),
            pipelines: PipelineCaches::new(),
            buffers: BufferPool::new(&desc),
            flushes: FlushQueue::new(),
            accounting: Arc::new(FrameAccounting::new()),
            stats: ResourceStats::default(),
            events: AtomicU64::new(1),
            scheduler: Mutex::new(Scheduler::new()),
            shared_indices: SharedIndices::new(),
            dummies,
            next_recorder: AtomicU64::new(0),
            device,
            desc,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_information(&self) -> &DeviceInformation {
        &self.info
    }

    pub fn desc(&self) -> &ContextDesc {
        &self.desc
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn create_function(&self, desc: FunctionDesc) -> Result<Function, PipelineError> {
        self.device.create_function(desc)
    }

    pub fn destroy_function(&self, function: Function) {
        self.device.destroy_function(function);
    }

    pub fn create_texture(&self, desc: TextureDesc, data: Option<&[u8]>) -> Texture {
        self.device.create_texture(desc, data)
    }

    pub fn destroy_texture(&self, texture: Texture) {
        self.device.destroy_texture(texture);
    }

    pub fn create_sampler(&self, desc: SamplerDesc) -> Sampler {
        self.device.create_sampler(desc)
    }

    pub fn destroy_sampler(&self, sampler: Sampler) {
        self.device.destroy_sampler(sampler);
    }

    /// Reads buffer contents back. Only meaningful for host visible buffers
    /// after the GPU is done writing them.
    pub fn read_buffer(&self, buffer: Buffer, offset: u64, size: u64) -> Vec<u8> {
        self.device.read_buffer(buffer, offset, size)
    }

    /// Tears the context down: destroys every pooled buffer, cached
    /// pipeline, recycled command buffer and dummy resource. Hands the
    /// device back. Every acquired buffer must have been released first.
    pub fn destroy(self) -> Result<D, ContractViolation> {
        if let Some(buffer) = self.shared_indices.take() {
            self.release_buffer(buffer)?;
        }
        let held = self.held_submission_count();
        if held != 0 {
            log::warn!("Destroying the context with {held} submissions never scheduled");
        }
        let report = self.reclaim_buffers(true)?;
        log::debug!(
            "Destroyed {} pooled buffers ({} bytes)",
            report.destroyed,
            report.destroyed_bytes
        );
        self.destroy_pipelines();
        for cb in self.command_buffers.drain() {
            self.device.destroy_command_buffer(cb.raw);
        }
        self.dummies.destroy(&self.device);
        if self.desc.enable_stats {
            self.stats.report();
        }
        Ok(self.device)
    }
}
