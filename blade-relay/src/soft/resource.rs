//! Resource and pipeline objects of the software device.

use super::*;
use crate::{
    Buffer, BufferDesc, ComputePipeline, ComputePipelineDesc, DepthStencilDesc,
    DepthStencilState, Function, FunctionDesc, PipelineError, RenderPipeline, RenderPipelineDesc,
    Sampler, SamplerDesc, Texture, TextureDesc,
};
use std::ops::Range;

fn pipeline_error(name: &str, message: impl Into<String>) -> PipelineError {
    PipelineError {
        name: name.to_string(),
        message: message.into(),
    }
}

/// Byte range of `size` bytes at `offset`, clamped to `len`.
fn clamp_range(offset: u64, size: u64, len: usize) -> Range<usize> {
    let start = (offset as usize).min(len);
    let end = offset.saturating_add(size).min(len as u64) as usize;
    start..end
}

//=============================================================================
// ResourceDevice Implementation
//=============================================================================

#[hidden_trait::expose]
impl crate::traits::ResourceDevice for SoftDevice {
    fn create_buffer(&self, desc: BufferDesc, data: Option<&[u8]>) -> Buffer {
        let mut contents = match desc.storage {
            StorageMode::Memoryless => Vec::new(),
            _ => vec![0; desc.size as usize],
        };
        if let Some(data) = data {
            let len = data.len().min(contents.len());
            contents[..len].copy_from_slice(&data[..len]);
        }
        let raw = self.hub.write().unwrap().buffers.insert(BufferEntry {
            name: desc.name.to_string(),
            contents,
            storage: desc.storage,
            flushed_ranges: 0,
        });
        log::trace!("Created buffer '{}' of {} bytes", desc.name, desc.size);
        Buffer {
            raw,
            size: desc.size,
            storage: desc.storage,
        }
    }

    fn destroy_buffer(&self, buffer: Buffer) {
        if self.hub.write().unwrap().buffers.remove(buffer.raw).is_none() {
            log::warn!("Destroying an unknown buffer {:?}", buffer.raw);
        }
    }

    fn write_buffer(&self, buffer: Buffer, offset: u64, data: &[u8]) {
        let mut hub = self.hub.write().unwrap();
        let Some(entry) = hub.buffers.get_mut(buffer.raw) else {
            log::warn!("Writing into an unknown buffer {:?}", buffer.raw);
            return;
        };
        let range = clamp_range(offset, data.len() as u64, entry.contents.len());
        let len = range.len();
        entry.contents[range].copy_from_slice(&data[..len]);
    }

    fn read_buffer(&self, buffer: Buffer, offset: u64, size: u64) -> Vec<u8> {
        let hub = self.hub.read().unwrap();
        match hub.buffers.get(buffer.raw) {
            Some(entry) => entry.contents[clamp_range(offset, size, entry.contents.len())].to_vec(),
            None => {
                log::warn!("Reading from an unknown buffer {:?}", buffer.raw);
                Vec::new()
            }
        }
    }

    fn did_modify_range(&self, buffer: Buffer, range: Range<u64>) {
        let mut hub = self.hub.write().unwrap();
        let Some(entry) = hub.buffers.get_mut(buffer.raw) else {
            log::warn!("Flushing {:?} of a destroyed buffer", range);
            self.dangling_references.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if entry.storage != StorageMode::Managed {
            log::warn!(
                "Flushing {:?} of buffer '{}' which is not managed",
                range,
                entry.name
            );
        }
        entry.flushed_ranges += 1;
    }

    fn create_texture(&self, desc: TextureDesc, data: Option<&[u8]>) -> Texture {
        let size = desc.size.width as usize
            * desc.size.height as usize
            * desc.array_layer_count.max(1) as usize
            * desc.format.block_size() as usize;
        let mut contents = vec![0; size];
        if let Some(data) = data {
            let len = data.len().min(size);
            contents[..len].copy_from_slice(&data[..len]);
        }
        let raw = self.hub.write().unwrap().textures.insert(TextureEntry {
            name: desc.name.to_string(),
            contents,
        });
        Texture {
            raw,
            format: desc.format,
            dimension: desc.dimension,
            size: desc.size,
        }
    }

    fn destroy_texture(&self, texture: Texture) {
        if let Some(entry) = self.hub.write().unwrap().textures.remove(texture.raw) {
            log::trace!("Destroyed texture '{}' ({} bytes)", entry.name, entry.contents.len());
        }
    }

    fn create_sampler(&self, desc: SamplerDesc) -> Sampler {
        let raw = self.hub.write().unwrap().samplers.insert(SamplerEntry {
            name: desc.name.to_string(),
        });
        Sampler { raw }
    }

    fn destroy_sampler(&self, sampler: Sampler) {
        if let Some(entry) = self.hub.write().unwrap().samplers.remove(sampler.raw) {
            log::trace!("Destroyed sampler '{}'", entry.name);
        }
    }
}

//=============================================================================
// ShaderDevice Implementation
//=============================================================================

impl SoftDevice {
    /// Checks that `function` is alive and runs in `stage`.
    fn check_function(
        &self,
        pipeline: &str,
        function: Function,
        stage: ShaderStage,
    ) -> Result<(), PipelineError> {
        let hub = self.hub.read().unwrap();
        let Some(entry) = hub.functions.get(function.raw) else {
            return Err(pipeline_error(pipeline, "function was destroyed"));
        };
        if entry.stage != stage {
            return Err(pipeline_error(
                pipeline,
                format!("'{}' is a {} function, expected {}", entry.name, entry.stage, stage),
            ));
        }
        Ok(())
    }
}

#[hidden_trait::expose]
impl crate::traits::ShaderDevice for SoftDevice {
    fn create_function(&self, desc: FunctionDesc) -> Result<Function, PipelineError> {
        if !desc.source.is_empty() {
            let module = naga::front::wgsl::parse_str(desc.source)
                .map_err(|e| pipeline_error(desc.name, e.emit_to_string(desc.source)))?;
            let expected = match desc.stage {
                ShaderStage::Vertex => naga::ShaderStage::Vertex,
                ShaderStage::Fragment => naga::ShaderStage::Fragment,
                ShaderStage::Compute => naga::ShaderStage::Compute,
            };
            if !module
                .entry_points
                .iter()
                .any(|ep| ep.name == desc.name && ep.stage == expected)
            {
                return Err(pipeline_error(
                    desc.name,
                    format!("no {} entry point with this name", desc.stage),
                ));
            }
        }
        let raw = self.hub.write().unwrap().functions.insert(FunctionEntry {
            name: desc.name.to_string(),
            stage: desc.stage,
        });
        Ok(Function {
            raw,
            stage: desc.stage,
        })
    }

    fn destroy_function(&self, function: Function) {
        self.hub.write().unwrap().functions.remove(function.raw);
    }

    fn create_render_pipeline(
        &self,
        desc: &RenderPipelineDesc,
    ) -> Result<RenderPipeline, PipelineError> {
        self.check_function(desc.name, desc.vertex, ShaderStage::Vertex)?;
        if let Some(fragment) = desc.fragment {
            self.check_function(desc.name, fragment, ShaderStage::Fragment)?;
        }
        if desc.color_formats.iter().any(|format| format.is_depth()) {
            return Err(pipeline_error(desc.name, "depth format used as a color target"));
        }
        if let Some(format) = desc.depth_format {
            if !format.is_depth() {
                return Err(pipeline_error(
                    desc.name,
                    format!("{format:?} is not a depth format"),
                ));
            }
        }
        if desc.multisample.sample_count == 0 {
            return Err(pipeline_error(desc.name, "sample count of zero"));
        }
        let raw = self
            .hub
            .write()
            .unwrap()
            .render_pipelines
            .insert(RenderPipelineEntry {
                name: desc.name.to_string(),
            });
        Ok(RenderPipeline { raw })
    }

    fn destroy_render_pipeline(&self, pipeline: RenderPipeline) {
        if let Some(entry) = self.hub.write().unwrap().render_pipelines.remove(pipeline.raw) {
            log::trace!("Destroyed render pipeline '{}'", entry.name);
        }
    }

    fn create_depth_stencil_state(
        &self,
        desc: &DepthStencilDesc,
    ) -> Result<DepthStencilState, PipelineError> {
        let raw = self
            .hub
            .write()
            .unwrap()
            .depth_stencil_states
            .insert(DepthStencilEntry {
                name: desc.name.to_string(),
            });
        Ok(DepthStencilState { raw })
    }

    fn destroy_depth_stencil_state(&self, state: DepthStencilState) {
        if let Some(entry) = self.hub.write().unwrap().depth_stencil_states.remove(state.raw) {
            log::trace!("Destroyed depth-stencil state '{}'", entry.name);
        }
    }

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc,
    ) -> Result<ComputePipeline, PipelineError> {
        self.check_function(desc.name, desc.function, ShaderStage::Compute)?;
        let raw = self
            .hub
            .write()
            .unwrap()
            .compute_pipelines
            .insert(ComputePipelineEntry {
                name: desc.name.to_string(),
            });
        Ok(ComputePipeline {
            raw,
            thread_execution_width: THREAD_EXECUTION_WIDTH,
            max_total_threads_per_threadgroup: MAX_THREADS_PER_THREADGROUP,
        })
    }

    fn destroy_compute_pipeline(&self, pipeline: ComputePipeline) {
        if let Some(entry) = self.hub.write().unwrap().compute_pipelines.remove(pipeline.raw) {
            log::trace!("Destroyed compute pipeline '{}'", entry.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Extent, TextureDimension, TextureFormat, TextureUsage};

    #[test]
    fn buffer_contents_round_trip() {
        let device = SoftDevice::new(Completion::Immediate);
        let buffer = device.create_buffer(
            BufferDesc {
                name: "test",
                size: 8,
                ..Default::default()
            },
            Some(&[1, 2, 3]),
        );
        device.write_buffer(buffer, 6, &[7, 8, 9]);
        assert_eq!(device.read_buffer(buffer, 0, 8), vec![1, 2, 3, 0, 0, 0, 7, 8]);
        assert_eq!(device.read_buffer(buffer, 6, 100), vec![7, 8]);
        device.destroy_buffer(buffer);
        assert!(device.read_buffer(buffer, 0, 8).is_empty());
        assert_eq!(device.live_objects(), LiveObjects::default());
    }

    #[test]
    fn texture_contents_cover_all_layers() {
        let device = SoftDevice::new(Completion::Immediate);
        let texture = device.create_texture(
            TextureDesc {
                name: "layers",
                format: TextureFormat::Rgba8Unorm,
                size: Extent {
                    width: 2,
                    height: 2,
                },
                array_layer_count: 3,
                dimension: TextureDimension::D2Array,
                usage: TextureUsage::RESOURCE,
            },
            None,
        );
        let hub = device.hub.read().unwrap();
        assert_eq!(hub.textures[texture.raw].contents.len(), 2 * 2 * 3 * 4);
    }

    #[test]
    fn pipelines_check_function_stages() {
        let device = SoftDevice::new(Completion::Immediate);
        let function = |name, stage| {
            device
                .create_function(FunctionDesc {
                    name,
                    stage,
                    source: "",
                })
                .unwrap()
        };
        let vs = function("vs", ShaderStage::Vertex);
        let fs = function("fs", ShaderStage::Fragment);
        let desc = RenderPipelineDesc {
            name: "swapped",
            vertex: fs,
            fragment: Some(vs),
            vertex_layout: None,
            color_formats: &[TextureFormat::Rgba8Unorm],
            depth_format: None,
            blend: None,
            write_mask: Default::default(),
            multisample: Default::default(),
        };
        let err = device.create_render_pipeline(&desc).unwrap_err();
        assert_eq!(err.name, "swapped");
        let ok = RenderPipelineDesc {
            vertex: vs,
            fragment: Some(fs),
            ..desc
        };
        assert!(device.create_render_pipeline(&ok).is_ok());
        assert!(device
            .create_compute_pipeline(&ComputePipelineDesc {
                name: "cs",
                function: vs,
                buffer_count: 0,
                texture_count: 0,
                immutable_buffer_mask: 0,
            })
            .is_err());
    }

    #[test]
    fn functions_are_checked_against_wgsl() {
        let device = SoftDevice::new(Completion::Immediate);
        let source = "@compute @workgroup_size(1) fn main() {}";
        assert!(device
            .create_function(FunctionDesc {
                name: "main",
                stage: ShaderStage::Compute,
                source,
            })
            .is_ok());
        assert!(device
            .create_function(FunctionDesc {
                name: "main",
                stage: ShaderStage::Vertex,
                source,
            })
            .is_err());
    }
}
