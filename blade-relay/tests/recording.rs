//! Render state recording end to end on the software device.

use blade_relay::{
    soft::{Completion, SoftDevice},
    BindingKind, BindingTable, BlendState, Buffer, BufferDesc, Command, Context, ContextDesc,
    ContractViolation, EncoderKind, Extent, Function, FunctionDesc, IndexType, LoadOp,
    PrimitiveType, QueueId, RecordingState, RenderPassDesc, RenderTarget, ShaderStage, StoreOp,
    Texture, TextureDesc, TextureDimension, TextureFormat, TextureUsage,
};
use std::sync::Arc;

struct Fixture {
    ctx: Context<SoftDevice>,
    vertex: Function,
    fragment: Function,
    target: Texture,
    bindings: Arc<BindingTable>,
}

impl Fixture {
    fn new(desc: ContextDesc) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let ctx = Context::new(SoftDevice::new(Completion::Immediate), desc);
        let function = |name, stage| {
            ctx.create_function(FunctionDesc {
                name,
                stage,
                source: "",
            })
            .unwrap()
        };
        let vertex = function("vs_main", ShaderStage::Vertex);
        let fragment = function("fs_main", ShaderStage::Fragment);
        let target = ctx.create_texture(
            TextureDesc {
                name: "target",
                format: TextureFormat::Rgba8Unorm,
                size: Extent {
                    width: 64,
                    height: 32,
                },
                array_layer_count: 1,
                dimension: TextureDimension::D2,
                usage: TextureUsage::TARGET,
            },
            None,
        );
        let bindings = BindingTable::new()
            .with("vertices", ShaderStage::Vertex, 0, BindingKind::Buffer)
            .with("albedo", ShaderStage::Fragment, 0, BindingKind::Texture)
            .with("layers", ShaderStage::Fragment, 1, BindingKind::Texture)
            .with("linear", ShaderStage::Fragment, 0, BindingKind::Sampler)
            .with(
                "tint",
                ShaderStage::Fragment,
                2,
                BindingKind::Uniform { offset: 0, size: 16 },
            )
            .with_uniform_block(ShaderStage::Fragment, 2, 16);
        Self {
            ctx,
            vertex,
            fragment,
            target,
            bindings: Arc::new(bindings),
        }
    }

    fn pass(&self) -> RenderPassDesc {
        RenderPassDesc {
            color_targets: vec![RenderTarget {
                texture: self.target,
                load: LoadOp::Clear([0.0; 4]),
                store: StoreOp::Store,
            }],
            depth_target: None,
        }
    }

    /// Recording state with the test program and render pass on the
    /// default queue.
    fn state(&self, manual_vertex_assembly: bool) -> RecordingState {
        let mut state = self.ctx.create_recording_state();
        state.set_shading_programs(
            "fixture",
            self.vertex,
            Some(self.fragment),
            Arc::clone(&self.bindings),
            manual_vertex_assembly,
        );
        self.ctx
            .set_render_pass(&mut state, QueueId::Default, self.pass())
            .unwrap();
        state
    }

    fn buffer(&self, data: &[u32]) -> Buffer {
        self.ctx.acquire_buffer(
            BufferDesc {
                name: "vertices",
                size: (data.len() * 4) as u64,
                ..Default::default()
            },
            Some(bytemuck::cast_slice(data)),
        )
    }

    fn finish(self, states: Vec<RecordingState>) -> SoftDevice {
        for state in states {
            self.ctx.retire_recording_state(state).unwrap();
        }
        self.ctx.destroy_function(self.vertex);
        self.ctx.destroy_function(self.fragment);
        self.ctx.destroy_texture(self.target);
        let device = self.ctx.destroy().unwrap();
        assert_eq!(device.live_objects().total(), 0);
        assert_eq!(device.dangling_references(), 0);
        device
    }
}

fn count(commands: &[Command], matches: impl Fn(&Command) -> bool) -> usize {
    commands.iter().filter(|&command| matches(command)).count()
}

#[test]
fn same_kind_reuses_encoder() {
    let fx = Fixture::new(ContextDesc::default());
    let ctx = &fx.ctx;
    let mut state = fx.state(false);
    let first = ctx
        .get_encoder(&mut state, QueueId::Default, EncoderKind::Render)
        .unwrap();
    assert_eq!(
        ctx.get_encoder(&mut state, QueueId::Default, EncoderKind::Render),
        Err(ContractViolation::EncoderInUse {
            queue: QueueId::Default
        })
    );
    ctx.release_encoder(&mut state, QueueId::Default, false)
        .unwrap();
    let again = ctx
        .get_encoder(&mut state, QueueId::Default, EncoderKind::Render)
        .unwrap();
    assert_eq!(first, again);
    ctx.release_encoder(&mut state, QueueId::Default, false)
        .unwrap();

    let compute = ctx
        .get_encoder(&mut state, QueueId::Default, EncoderKind::Compute)
        .unwrap();
    assert_ne!(compute.serial, first.serial);
    ctx.release_encoder(&mut state, QueueId::Default, true)
        .unwrap();
    assert!(state.queue(QueueId::Default).is_encoder_ended());
    let stats = ctx.stats();
    assert_eq!(stats.encoders_requested, [2, 1, 0]);
    assert_eq!(stats.encoders_created, [1, 1, 0]);
    fx.finish(vec![state]);
}

#[test]
fn bindings_are_emitted_once_per_encoder() {
    let fx = Fixture::new(ContextDesc::default());
    let ctx = &fx.ctx;
    let mut state = fx.state(false);
    let vertices = fx.buffer(&[0; 16]);
    state
        .set_buffer("vertices", ShaderStage::Vertex, vertices.into())
        .unwrap();

    ctx.get_encoder(&mut state, QueueId::Default, EncoderKind::Render)
        .unwrap();
    assert!(ctx.commit_state(&mut state).unwrap());
    ctx.draw(&mut state, PrimitiveType::Triangle, 0, 3, 1, 0)
        .unwrap();
    ctx.release_encoder(&mut state, QueueId::Default, false)
        .unwrap();

    // the same encoder still has everything bound
    ctx.get_encoder(&mut state, QueueId::Default, EncoderKind::Render)
        .unwrap();
    assert!(ctx.commit_state(&mut state).unwrap());
    ctx.release_encoder(&mut state, QueueId::Default, false)
        .unwrap();

    // a compute pass in between ends the render pass
    ctx.get_encoder(&mut state, QueueId::Default, EncoderKind::Compute)
        .unwrap();
    ctx.release_encoder(&mut state, QueueId::Default, true)
        .unwrap();
    ctx.get_encoder(&mut state, QueueId::Default, EncoderKind::Render)
        .unwrap();
    assert!(ctx.commit_state(&mut state).unwrap());
    ctx.release_encoder(&mut state, QueueId::Default, true)
        .unwrap();

    let commands = ctx
        .command_buffer(&mut state, QueueId::Default)
        .unwrap()
        .commands();
    assert_eq!(
        count(commands, |c| matches!(c, Command::BeginPass { .. })),
        3
    );
    assert_eq!(
        count(commands, |c| matches!(
            c,
            Command::SetBuffer {
                stage: ShaderStage::Vertex,
                slot: 0,
                ..
            }
        )),
        2
    );
    assert_eq!(
        count(commands, |c| matches!(c, Command::SetRenderPipeline(_))),
        2
    );
    assert!(commands.contains(&Command::BeginPass {
        kind: EncoderKind::Render,
        serial: 0,
        targets: Some(fx.pass()),
    }));
    let viewport = commands.iter().find_map(|c| match *c {
        Command::SetViewport(viewport) => Some(viewport),
        _ => None,
    });
    assert_eq!(viewport.map(|v| (v.w, v.h)), Some((64.0, 32.0)));

    ctx.commit(&mut state, QueueId::Default, false).unwrap();
    ctx.release_buffer(vertices).unwrap();
    fx.finish(vec![state]);
}

#[test]
fn pipelines_are_shared_between_states() {
    let fx = Fixture::new(ContextDesc::default());
    let ctx = &fx.ctx;
    let mut states = vec![fx.state(false), fx.state(false)];
    for state in states.iter_mut() {
        ctx.get_encoder(state, QueueId::Default, EncoderKind::Render)
            .unwrap();
        assert!(ctx.commit_state(state).unwrap());
        ctx.release_encoder(state, QueueId::Default, false).unwrap();
    }
    assert_eq!(ctx.cached_pipeline_counts(), (1, 1, 0));
    assert_eq!(ctx.device().live_objects().render_pipelines, 1);

    let state = &mut states[0];
    state.set_blend(Some(BlendState::ALPHA_BLENDING));
    ctx.get_encoder(state, QueueId::Default, EncoderKind::Render)
        .unwrap();
    assert!(ctx.commit_state(state).unwrap());
    ctx.release_encoder(state, QueueId::Default, false).unwrap();
    assert_eq!(ctx.cached_pipeline_counts(), (2, 1, 0));
    assert_eq!(ctx.stats().pipelines_created, 3);

    // a depth format as color output cannot be built, the draw is skipped
    let state = &mut states[1];
    state.set_output_formats(Some(TextureFormat::Depth32Float), None);
    ctx.get_encoder(state, QueueId::Default, EncoderKind::Render)
        .unwrap();
    assert!(!ctx.commit_state(state).unwrap());
    assert!(state.is_pending(blade_relay::StateDelta::DrawTarget));
    ctx.release_encoder(state, QueueId::Default, false).unwrap();
    assert_eq!(ctx.cached_pipeline_counts(), (2, 1, 0));
    fx.finish(states);
}

#[test]
fn missing_resources_use_dummies() {
    let fx = Fixture::new(ContextDesc::default());
    let ctx = &fx.ctx;
    let mut state = fx.state(false);
    state
        .set_texture("albedo", ShaderStage::Fragment, None, false)
        .unwrap();
    state
        .set_texture("layers", ShaderStage::Fragment, None, true)
        .unwrap();
    state
        .set_sampler("linear", ShaderStage::Fragment, None)
        .unwrap();
    state
        .set_uniform_value("tint", ShaderStage::Fragment, &[1.0f32, 0.5, 0.25, 1.0])
        .unwrap();
    ctx.get_encoder(&mut state, QueueId::Default, EncoderKind::Render)
        .unwrap();
    assert!(ctx.commit_state(&mut state).unwrap());
    ctx.release_encoder(&mut state, QueueId::Default, true)
        .unwrap();

    let commands = ctx
        .command_buffer(&mut state, QueueId::Default)
        .unwrap()
        .commands()
        .to_vec();
    let textures: Vec<_> = commands
        .iter()
        .filter_map(|c| match *c {
            Command::SetTexture { slot, texture, .. } => Some((slot, texture)),
            _ => None,
        })
        .collect();
    assert_eq!(textures.len(), 2);
    for (slot, texture) in textures {
        let expected = if slot == 1 {
            TextureDimension::D2Array
        } else {
            TextureDimension::D2
        };
        assert_eq!(texture.dimension(), expected);
        assert_eq!(texture.format(), TextureFormat::Rgba8Unorm);
        assert_eq!(texture.size(), Extent::default());
    }
    assert_eq!(
        count(&commands, |c| matches!(c, Command::SetSampler { slot: 0, .. })),
        1
    );
    assert_eq!(
        count(&commands, |c| matches!(
            c,
            Command::SetBytes {
                stage: ShaderStage::Fragment,
                slot: 2,
                ..
            }
        )),
        1
    );
    let plain = ctx
        .command_buffer(&mut state, QueueId::Default)
        .unwrap()
        .plain_data();
    assert_eq!(plain.len(), 16);
    assert_eq!(&plain[4..8], bytemuck::bytes_of(&0.5f32));
    fx.finish(vec![state]);
}

#[test]
fn bindings_need_a_program() {
    let fx = Fixture::new(ContextDesc::default());
    let ctx = &fx.ctx;
    let mut bare = ctx.create_recording_state();
    ctx.set_render_pass(&mut bare, QueueId::Default, fx.pass())
        .unwrap();
    assert_eq!(
        ctx.commit_state(&mut bare),
        Err(ContractViolation::WrongEncoder {
            queue: QueueId::Default,
            expected: EncoderKind::Render,
            found: None,
        })
    );
    ctx.get_encoder(&mut bare, QueueId::Default, EncoderKind::Render)
        .unwrap();
    assert_eq!(
        ctx.commit_state(&mut bare),
        Err(ContractViolation::NoShadingProgram)
    );
    ctx.release_encoder(&mut bare, QueueId::Default, true)
        .unwrap();

    let mut state = fx.state(false);
    let scratch = fx.buffer(&[0; 4]);
    state.bind_buffer(ShaderStage::Compute, 4, scratch.into());
    ctx.get_encoder(&mut state, QueueId::Default, EncoderKind::Render)
        .unwrap();
    assert_eq!(
        ctx.commit_state(&mut state),
        Err(ContractViolation::ComputeBindingWithoutGs { slot: 4 })
    );
    ctx.release_encoder(&mut state, QueueId::Default, true)
        .unwrap();
    ctx.release_buffer(scratch).unwrap();
    fx.finish(vec![bare, state]);
}

#[test]
fn quads_are_remapped_once() {
    let fx = Fixture::new(ContextDesc::default());
    let ctx = &fx.ctx;
    let mut state = fx.state(false);
    let quads = fx.buffer(&[0, 1, 2, 3, 4, 5, 6, 7]);

    state.set_index_buffer(quads.into(), IndexType::U16);
    assert_eq!(
        ctx.quad_index_buffer(&mut state, 8),
        Err(ContractViolation::UnsupportedIndexType)
    );
    state.set_index_buffer(quads.into(), IndexType::U32);
    let triangles = ctx.quad_index_buffer(&mut state, 8).unwrap();
    let indices: Vec<u32> = ctx
        .read_buffer(triangles, 0, 48)
        .chunks_exact(4)
        .map(bytemuck::pod_read_unaligned)
        .collect();
    assert_eq!(indices, vec![0, 1, 2, 0, 2, 3, 4, 5, 6, 4, 6, 7]);
    assert_eq!(ctx.quad_index_buffer(&mut state, 8), Ok(triangles));

    ctx.get_encoder(&mut state, QueueId::Default, EncoderKind::Render)
        .unwrap();
    assert!(ctx.commit_state(&mut state).unwrap());
    state.set_index_buffer(triangles.into(), IndexType::U32);
    ctx.draw_indexed(&mut state, PrimitiveType::Triangle, 12, 0, 0, 1, 0)
        .unwrap();
    ctx.release_encoder(&mut state, QueueId::Default, true)
        .unwrap();
    ctx.commit(&mut state, QueueId::Default, false).unwrap();

    let shared = ctx
        .triangle_list_index_buffer(IndexType::U32, 2)
        .unwrap();
    assert_eq!(
        ctx.triangle_list_index_buffer(IndexType::U32, 1),
        Ok(shared)
    );
    ctx.release_buffer(quads).unwrap();
    fx.finish(vec![state]);
}

#[test]
fn draws_count_primitives() {
    let fx = Fixture::new(ContextDesc::default());
    let ctx = &fx.ctx;
    let mut state = fx.state(false);
    ctx.start_frame();
    ctx.get_encoder(&mut state, QueueId::Default, EncoderKind::Render)
        .unwrap();
    assert!(ctx.commit_state(&mut state).unwrap());
    ctx.draw(&mut state, PrimitiveType::Triangle, 0, 9, 2, 0)
        .unwrap();
    ctx.draw(&mut state, PrimitiveType::TriangleStrip, 0, 4, 0, 0)
        .unwrap();
    assert_eq!(ctx.primitives_drawn(), 8);
    assert_eq!(
        ctx.draw_indexed(&mut state, PrimitiveType::Point, 1, 0, 0, 1, 0),
        Err(ContractViolation::MissingIndexBuffer)
    );
    ctx.release_encoder(&mut state, QueueId::Default, true)
        .unwrap();
    ctx.commit(&mut state, QueueId::Default, false).unwrap();
    ctx.end_frame();
    assert_eq!(ctx.last_completed_frame(), 0);
    fx.finish(vec![state]);
}

#[test]
fn compute_gs_feeds_the_default_queue() {
    let fx = Fixture::new(ContextDesc {
        gs_max_data_per_batch: 256,
        ..Default::default()
    });
    let ctx = &fx.ctx;
    let expand = ctx
        .create_function(FunctionDesc {
            name: "gs_main",
            stage: ShaderStage::Compute,
            source: "",
        })
        .unwrap();
    let mut state = fx.state(true);
    assert_eq!(
        ctx.prepare_for_compute_gs_part(&mut state, 16, 16),
        Err(ContractViolation::ComputeGsDisabled)
    );
    state.set_compute_gs_program(expand).unwrap();
    assert_eq!(
        ctx.prepare_for_compute_gs_part(&mut state, 200, 100),
        Err(ContractViolation::GsPartTooLarge { size: 320, max: 256 })
    );

    let first = ctx.prepare_for_compute_gs_part(&mut state, 100, 20).unwrap();
    assert!(first.new_batch);
    assert_eq!((first.vertex_offset, first.primitive_offset), (0, 112));
    let second = ctx.prepare_for_compute_gs_part(&mut state, 10, 10).unwrap();
    assert!(!second.new_batch);
    assert_eq!(second.buffer, first.buffer);
    assert_eq!((second.vertex_offset, second.primitive_offset), (144, 160));

    let vertices = fx.buffer(&[0; 8]);
    state
        .set_buffer("vertices", ShaderStage::Vertex, vertices.into())
        .unwrap();
    ctx.get_encoder(&mut state, QueueId::Default, EncoderKind::Render)
        .unwrap();
    assert!(ctx.commit_state(&mut state).unwrap());
    assert_eq!(
        ctx.current_compute_thread_execution_width(&state, QueueId::AuxiliaryCompute),
        32
    );
    assert_eq!(state.current_queue(), QueueId::Default);
    ctx.draw(&mut state, PrimitiveType::Triangle, 0, 3, 1, 0)
        .unwrap();
    ctx.release_encoder(&mut state, QueueId::Default, true)
        .unwrap();

    let aux = ctx
        .command_buffer(&mut state, QueueId::AuxiliaryCompute)
        .unwrap()
        .commands()
        .to_vec();
    assert_eq!(count(&aux, |c| matches!(c, Command::SetComputePipeline(_))), 1);
    // the vertex buffer is mirrored into the expansion pass
    assert_eq!(
        count(&aux, |c| matches!(
            c,
            Command::SetBuffer {
                stage: ShaderStage::Compute,
                slot: 0,
                ..
            }
        )),
        1
    );

    let drawn = ctx
        .commit(&mut state, QueueId::Default, false)
        .unwrap()
        .expect("default queue has draws");
    assert_eq!(ctx.held_submission_count(), 1);
    ctx.commit(&mut state, QueueId::AuxiliaryCompute, false)
        .unwrap();
    assert_eq!(ctx.held_submission_count(), 0);
    assert!(ctx.wait_for(&drawn, 100));

    let submitted = ctx.device().submissions();
    assert_eq!(submitted[0].queue, QueueId::AuxiliaryCompute);
    let signal: Vec<_> = submitted[0].signals().collect();
    assert_eq!(signal.len(), 1);
    assert_eq!(submitted[1].waits().collect::<Vec<_>>(), signal);
    assert_eq!(ctx.stats().gs_batches_started, 1);
    assert_eq!(ctx.cached_pipeline_counts(), (1, 1, 1));

    ctx.release_buffer(vertices).unwrap();
    ctx.destroy_function(expand);
    fx.finish(vec![state]);
}
