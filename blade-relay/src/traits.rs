//! The seam between the orchestration layer and a concrete device.
//!
//! Devices only allocate objects and replay finished command lists. All
//! bookkeeping (pooling, caching, ordering) lives above this seam.

use crate::{
    Buffer, BufferDesc, CommandBufferKey, ComputePipeline, ComputePipelineDesc, DepthStencilDesc,
    DepthStencilState, DeviceInformation, Function, FunctionDesc, PipelineError, RenderPipeline,
    RenderPipelineDesc, Sampler, SamplerDesc, Submission, SyncPoint, Texture, TextureDesc,
};
use std::ops::Range;

/// Invoked by the device once a submitted command buffer finished executing.
/// May be called from any thread, in any order relative to other submissions.
pub type CompletionHandler = Box<dyn FnOnce() + Send + 'static>;

pub trait ResourceDevice {
    /// Allocates a buffer, optionally filled with `data`.
    fn create_buffer(&self, desc: BufferDesc, data: Option<&[u8]>) -> Buffer;
    fn destroy_buffer(&self, buffer: Buffer);
    /// Writes host data into the buffer contents.
    fn write_buffer(&self, buffer: Buffer, offset: u64, data: &[u8]);
    fn read_buffer(&self, buffer: Buffer, offset: u64, size: u64) -> Vec<u8>;
    /// Tells the device that the CPU modified a range of a managed buffer.
    fn did_modify_range(&self, buffer: Buffer, range: Range<u64>);
    fn create_texture(&self, desc: TextureDesc, data: Option<&[u8]>) -> Texture;
    fn destroy_texture(&self, texture: Texture);
    fn create_sampler(&self, desc: SamplerDesc) -> Sampler;
    fn destroy_sampler(&self, sampler: Sampler);
}

pub trait ShaderDevice {
    fn create_function(&self, desc: FunctionDesc) -> Result<Function, PipelineError>;
    fn destroy_function(&self, function: Function);
    fn create_render_pipeline(
        &self,
        desc: &RenderPipelineDesc,
    ) -> Result<RenderPipeline, PipelineError>;
    fn destroy_render_pipeline(&self, pipeline: RenderPipeline);
    fn create_depth_stencil_state(
        &self,
        desc: &DepthStencilDesc,
    ) -> Result<DepthStencilState, PipelineError>;
    fn destroy_depth_stencil_state(&self, state: DepthStencilState);
    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc,
    ) -> Result<ComputePipeline, PipelineError>;
    fn destroy_compute_pipeline(&self, pipeline: ComputePipeline);
}

pub trait CommandDevice {
    fn create_command_buffer(&self) -> CommandBufferKey;
    fn destroy_command_buffer(&self, raw: CommandBufferKey);
    /// Hands a finished command list to the device. `on_complete` is called
    /// exactly once when the GPU is done with it.
    fn submit(&self, submission: Submission, on_complete: CompletionHandler);
    /// Blocks until the submission is handed over to the hardware queue.
    /// Returns `false` if the device never received it.
    fn wait_until_scheduled(&self, sync_point: &SyncPoint) -> bool;
    /// Blocks until the submission completes or the timeout expires.
    /// Returns `true` if the submission is complete.
    fn wait_for(&self, sync_point: &SyncPoint, timeout_ms: u32) -> bool;
}

pub trait Device: ResourceDevice + ShaderDevice + CommandDevice + Send + Sync + 'static {
    fn info(&self) -> DeviceInformation;
}
