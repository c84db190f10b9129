//! Pipeline creation for WebGPU backend

use super::resource::{map_compare_function, map_texture_format};
use super::*;
use crate::{
    BlendComponent, ComputePipeline, ComputePipelineDesc, DepthStencilDesc, DepthStencilState,
    Function, FunctionDesc, PipelineError, RenderPipeline, RenderPipelineDesc, VertexFormat,
    VertexStep,
};
use std::borrow::Cow;

/// Runs `f` inside a validation error scope and turns a captured error into
/// a `PipelineError`. Native builds block on the scope.
#[cfg(not(target_arch = "wasm32"))]
fn with_error_scope<T, F: FnOnce() -> T>(
    device: &wgpu::Device,
    name: &str,
    f: F,
) -> Result<T, PipelineError> {
    let scope = device.push_error_scope(wgpu::ErrorFilter::Validation);
    let result = f();
    match pollster::block_on(scope.pop()) {
        Some(e) => {
            log::error!("WebGPU pipeline '{}' validation error: {}", name, e);
            Err(pipeline_error(name, e.to_string()))
        }
        None => Ok(result),
    }
}

/// Scopes must be popped in reverse order, which async pops cannot promise
/// in the browser. Errors surface in the console instead.
#[cfg(target_arch = "wasm32")]
fn with_error_scope<T, F: FnOnce() -> T>(
    _device: &wgpu::Device,
    _name: &str,
    f: F,
) -> Result<T, PipelineError> {
    Ok(f())
}

fn pipeline_error(name: &str, message: impl Into<String>) -> PipelineError {
    PipelineError {
        name: name.to_string(),
        message: message.into(),
    }
}

//=============================================================================
// State Mapping
//=============================================================================

fn map_shader_stage(stage: ShaderStage) -> naga::ShaderStage {
    match stage {
        ShaderStage::Vertex => naga::ShaderStage::Vertex,
        ShaderStage::Fragment => naga::ShaderStage::Fragment,
        ShaderStage::Compute => naga::ShaderStage::Compute,
    }
}

fn map_primitive_topology(primitive: PrimitiveType) -> wgpu::PrimitiveTopology {
    match primitive {
        PrimitiveType::Point => wgpu::PrimitiveTopology::PointList,
        PrimitiveType::Line => wgpu::PrimitiveTopology::LineList,
        PrimitiveType::LineStrip => wgpu::PrimitiveTopology::LineStrip,
        PrimitiveType::Triangle => wgpu::PrimitiveTopology::TriangleList,
        PrimitiveType::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
    }
}

fn map_front_face(front_face: FrontFace) -> wgpu::FrontFace {
    match front_face {
        FrontFace::Ccw => wgpu::FrontFace::Ccw,
        FrontFace::Cw => wgpu::FrontFace::Cw,
    }
}

fn map_cull_mode(cull_mode: CullMode) -> Option<wgpu::Face> {
    match cull_mode {
        CullMode::None => None,
        CullMode::Front => Some(wgpu::Face::Front),
        CullMode::Back => Some(wgpu::Face::Back),
    }
}

fn map_blend_factor(factor: crate::BlendFactor) -> wgpu::BlendFactor {
    match factor {
        crate::BlendFactor::Zero => wgpu::BlendFactor::Zero,
        crate::BlendFactor::One => wgpu::BlendFactor::One,
        crate::BlendFactor::Src => wgpu::BlendFactor::Src,
        crate::BlendFactor::OneMinusSrc => wgpu::BlendFactor::OneMinusSrc,
        crate::BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
        crate::BlendFactor::OneMinusSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
        crate::BlendFactor::Dst => wgpu::BlendFactor::Dst,
        crate::BlendFactor::OneMinusDst => wgpu::BlendFactor::OneMinusDst,
        crate::BlendFactor::DstAlpha => wgpu::BlendFactor::DstAlpha,
        crate::BlendFactor::OneMinusDstAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
        crate::BlendFactor::SrcAlphaSaturated => wgpu::BlendFactor::SrcAlphaSaturated,
        crate::BlendFactor::Constant => wgpu::BlendFactor::Constant,
        crate::BlendFactor::OneMinusConstant => wgpu::BlendFactor::OneMinusConstant,
    }
}

fn map_blend_operation(op: crate::BlendOperation) -> wgpu::BlendOperation {
    match op {
        crate::BlendOperation::Add => wgpu::BlendOperation::Add,
        crate::BlendOperation::Subtract => wgpu::BlendOperation::Subtract,
        crate::BlendOperation::ReverseSubtract => wgpu::BlendOperation::ReverseSubtract,
        crate::BlendOperation::Min => wgpu::BlendOperation::Min,
        crate::BlendOperation::Max => wgpu::BlendOperation::Max,
    }
}

fn map_blend_component(component: &BlendComponent) -> wgpu::BlendComponent {
    wgpu::BlendComponent {
        src_factor: map_blend_factor(component.src_factor),
        dst_factor: map_blend_factor(component.dst_factor),
        operation: map_blend_operation(component.operation),
    }
}

fn map_vertex_format(format: VertexFormat) -> wgpu::VertexFormat {
    match format {
        VertexFormat::F32 => wgpu::VertexFormat::Float32,
        VertexFormat::F32Vec2 => wgpu::VertexFormat::Float32x2,
        VertexFormat::F32Vec3 => wgpu::VertexFormat::Float32x3,
        VertexFormat::F32Vec4 => wgpu::VertexFormat::Float32x4,
        VertexFormat::U32 => wgpu::VertexFormat::Uint32,
        VertexFormat::U32Vec2 => wgpu::VertexFormat::Uint32x2,
        VertexFormat::U32Vec3 => wgpu::VertexFormat::Uint32x3,
        VertexFormat::U32Vec4 => wgpu::VertexFormat::Uint32x4,
        VertexFormat::I32 => wgpu::VertexFormat::Sint32,
        VertexFormat::I32Vec2 => wgpu::VertexFormat::Sint32x2,
        VertexFormat::I32Vec3 => wgpu::VertexFormat::Sint32x3,
        VertexFormat::I32Vec4 => wgpu::VertexFormat::Sint32x4,
        VertexFormat::Unorm8x4 => wgpu::VertexFormat::Unorm8x4,
    }
}

//=============================================================================
// Reflection
//=============================================================================

/// Resources the entry point at `index` actually reads. wgpu derives the
/// pipeline layout from these, unused declarations are left out.
fn reflect_slots(
    module: &naga::Module,
    info: &naga::valid::ModuleInfo,
    index: usize,
) -> Vec<BindingSlot> {
    let usage = info.get_entry_point(index);
    let mut slots = Vec::new();
    for (handle, var) in module.global_variables.iter() {
        let Some(ref binding) = var.binding else {
            continue;
        };
        if usage[handle].is_empty() {
            continue;
        }
        let kind = match module.types[var.ty].inner {
            naga::TypeInner::Image { .. } => BindingKind::Texture,
            naga::TypeInner::Sampler { .. } => BindingKind::Sampler,
            _ => BindingKind::Buffer,
        };
        slots.push(BindingSlot {
            group: binding.group,
            binding: binding.binding,
            kind,
        });
    }
    slots
}

fn merge_slots(target: &mut Vec<BindingSlot>, slots: &[BindingSlot]) {
    for slot in slots {
        if !target.contains(slot) {
            target.push(*slot);
        }
    }
}

//=============================================================================
// Realized Render Pipelines
//=============================================================================

impl WebGpuDevice {
    fn check_function(
        &self,
        hub: &Hub,
        pipeline: &str,
        function: Function,
        stage: ShaderStage,
    ) -> Result<Vec<BindingSlot>, PipelineError> {
        let Some(entry) = hub.functions.get(function.raw) else {
            return Err(pipeline_error(pipeline, "function was destroyed"));
        };
        if entry.stage != stage {
            return Err(pipeline_error(
                pipeline,
                format!(
                    "'{}' is a {} function, expected {}",
                    entry.entry_point, entry.stage, stage
                ),
            ));
        }
        Ok(entry.slots.clone())
    }

    /// Returns the wgpu pipeline for a render pipeline under the given draw
    /// state, building it on first use.
    pub(super) fn realize_render_pipeline(
        &self,
        hub: &Hub,
        key: RealizedKey,
    ) -> Option<wgpu::RenderPipeline> {
        let mut realized = self.realized.lock().unwrap();
        if let Some(raw) = realized.get(&key) {
            return Some(raw.clone());
        }
        let entry = hub.render_pipelines.get(key.pipeline)?;
        let vertex = hub.functions.get(entry.vertex)?;
        let fragment = match entry.fragment {
            Some(function) => Some(hub.functions.get(function)?),
            None => None,
        };
        log::debug!(
            "Building '{}' for {:?} {:?} {:?}",
            entry.name,
            key.primitive,
            key.front_face,
            key.cull_mode
        );

        let attributes: Vec<[wgpu::VertexAttribute; 1]> = entry
            .vertex_buffers
            .iter()
            .map(|&(location, element)| {
                [wgpu::VertexAttribute {
                    format: map_vertex_format(element.format),
                    offset: element.offset as u64,
                    shader_location: location,
                }]
            })
            .collect();
        let vertex_buffers: Vec<wgpu::VertexBufferLayout> = entry
            .vertex_buffers
            .iter()
            .zip(attributes.iter())
            .map(|(&(_, element), attributes)| wgpu::VertexBufferLayout {
                array_stride: match element.step {
                    VertexStep::Constant => 0,
                    _ => element.stride as u64,
                },
                step_mode: match element.step {
                    VertexStep::PerInstance => wgpu::VertexStepMode::Instance,
                    VertexStep::PerVertex | VertexStep::Constant => wgpu::VertexStepMode::Vertex,
                },
                attributes,
            })
            .collect();

        let targets: Vec<Option<wgpu::ColorTargetState>> = entry
            .color_formats
            .iter()
            .map(|&format| {
                Some(wgpu::ColorTargetState {
                    format: map_texture_format(format),
                    blend: entry.blend.map(|b| wgpu::BlendState {
                        color: map_blend_component(&b.color),
                        alpha: map_blend_component(&b.alpha),
                    }),
                    write_mask: wgpu::ColorWrites::from_bits_truncate(entry.write_mask.bits()),
                })
            })
            .collect();

        let depth = key
            .depth
            .and_then(|state| hub.depth_stencil_states.get(state).copied());
        let depth_stencil = entry.depth_format.map(|format| {
            let depth = depth.unwrap_or(DepthState {
                write_enabled: false,
                compare: crate::CompareFunction::Always,
            });
            wgpu::DepthStencilState {
                format: map_texture_format(format),
                depth_write_enabled: depth.write_enabled,
                depth_compare: map_compare_function(depth.compare),
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }
        });

        let raw = with_error_scope(&self.device, &entry.name, || {
            self.device
                .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some(&entry.name),
                    layout: None,
                    vertex: wgpu::VertexState {
                        module: &vertex.module,
                        entry_point: Some(&vertex.entry_point),
                        compilation_options: Default::default(),
                        buffers: &vertex_buffers,
                    },
                    primitive: wgpu::PrimitiveState {
                        topology: map_primitive_topology(key.primitive),
                        strip_index_format: None,
                        front_face: map_front_face(key.front_face),
                        cull_mode: map_cull_mode(key.cull_mode),
                        unclipped_depth: false,
                        polygon_mode: wgpu::PolygonMode::Fill,
                        conservative: false,
                    },
                    depth_stencil,
                    multisample: wgpu::MultisampleState {
                        count: entry.multisample.sample_count,
                        mask: !0,
                        alpha_to_coverage_enabled: entry.multisample.alpha_to_coverage,
                    },
                    fragment: fragment.map(|fs| wgpu::FragmentState {
                        module: &fs.module,
                        entry_point: Some(&fs.entry_point),
                        compilation_options: Default::default(),
                        targets: &targets,
                    }),
                    multiview_mask: None,
                    cache: None,
                })
        })
        .ok()?;
        realized.insert(key, raw.clone());
        Some(raw)
    }
}

//=============================================================================
// ShaderDevice Implementation
//=============================================================================

#[hidden_trait::expose]
impl crate::traits::ShaderDevice for WebGpuDevice {
    fn create_function(&self, desc: FunctionDesc) -> Result<Function, PipelineError> {
        if desc.source.is_empty() {
            return Err(pipeline_error(desc.name, "no WGSL source"));
        }
        let module = naga::front::wgsl::parse_str(desc.source)
            .map_err(|e| pipeline_error(desc.name, e.emit_to_string(desc.source)))?;
        let info = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .map_err(|e| pipeline_error(desc.name, e.emit_to_string(desc.source)))?;
        let expected = map_shader_stage(desc.stage);
        let Some(index) = module
            .entry_points
            .iter()
            .position(|ep| ep.name == desc.name && ep.stage == expected)
        else {
            return Err(pipeline_error(
                desc.name,
                format!("no {} entry point with this name", desc.stage),
            ));
        };
        let slots = reflect_slots(&module, &info, index);
        let workgroup_size = module.entry_points[index].workgroup_size;

        let shader = with_error_scope(&self.device, desc.name, || {
            self.device
                .create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(desc.name),
                    source: wgpu::ShaderSource::Wgsl(Cow::Owned(desc.source.to_string())),
                })
        })?;
        let raw = self.hub.write().unwrap().functions.insert(FunctionEntry {
            module: shader,
            entry_point: desc.name.to_string(),
            stage: desc.stage,
            slots,
            workgroup_size,
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
        let mut hub = self.hub.write().unwrap();
        let mut slots = self.check_function(&hub, desc.name, desc.vertex, ShaderStage::Vertex)?;
        if let Some(fragment) = desc.fragment {
            let fragment_slots =
                self.check_function(&hub, desc.name, fragment, ShaderStage::Fragment)?;
            merge_slots(&mut slots, &fragment_slots);
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
        if desc.multisample.alpha_to_one {
            log::warn!("Pipeline '{}': alpha-to-one is not available", desc.name);
        }
        let vertex_buffers: Vec<(u32, VertexElement)> = desc
            .vertex_layout
            .map(|layout| {
                layout
                    .elements
                    .iter()
                    .map(|(&location, &element)| (location, element))
                    .collect()
            })
            .unwrap_or_default();

        let raw = hub.render_pipelines.insert(RenderPipelineEntry {
            name: desc.name.to_string(),
            vertex: desc.vertex.raw,
            fragment: desc.fragment.map(|f| f.raw),
            vertex_buffers,
            color_formats: desc.color_formats.to_vec(),
            depth_format: desc.depth_format,
            blend: desc.blend,
            write_mask: desc.write_mask,
            multisample: desc.multisample,
            slots,
        });
        Ok(RenderPipeline { raw })
    }

    fn destroy_render_pipeline(&self, pipeline: RenderPipeline) {
        if let Some(entry) = self.hub.write().unwrap().render_pipelines.remove(pipeline.raw) {
            log::trace!("Destroyed render pipeline '{}'", entry.name);
        }
        self.realized
            .lock()
            .unwrap()
            .retain(|key, _| key.pipeline != pipeline.raw);
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
            .insert(desc.depth);
        Ok(DepthStencilState { raw })
    }

    fn destroy_depth_stencil_state(&self, state: DepthStencilState) {
        self.hub.write().unwrap().depth_stencil_states.remove(state.raw);
        self.realized
            .lock()
            .unwrap()
            .retain(|key, _| key.depth != Some(state.raw));
    }

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc,
    ) -> Result<ComputePipeline, PipelineError> {
        let mut hub = self.hub.write().unwrap();
        let slots = self.check_function(&hub, desc.name, desc.function, ShaderStage::Compute)?;
        let (raw, workgroup_size) = {
            let function = &hub.functions[desc.function.raw];
            let raw = with_error_scope(&self.device, desc.name, || {
                self.device
                    .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                        label: Some(desc.name),
                        layout: None,
                        module: &function.module,
                        entry_point: Some(&function.entry_point),
                        compilation_options: Default::default(),
                        cache: None,
                    })
            })?;
            (raw, function.workgroup_size)
        };
        let limit = self.device.limits().max_compute_invocations_per_workgroup;
        log::debug!(
            "Compute pipeline '{}' with workgroup {:?}, {} slots",
            desc.name,
            workgroup_size,
            slots.len()
        );
        let key = hub
            .compute_pipelines
            .insert(ComputePipelineEntry { raw, slots });
        Ok(ComputePipeline {
            raw: key,
            thread_execution_width: THREAD_EXECUTION_WIDTH,
            max_total_threads_per_threadgroup: limit,
        })
    }

    fn destroy_compute_pipeline(&self, pipeline: ComputePipeline) {
        self.hub.write().unwrap().compute_pipelines.remove(pipeline.raw);
    }
}
