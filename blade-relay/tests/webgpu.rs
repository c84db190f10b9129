//! Smoke tests against a real wgpu adapter.
//!
//! Build with `RUSTFLAGS="--cfg blade_wgpu"`. Machines without an adapter
//! skip every test.
#![cfg(blade_wgpu)]

use blade_relay::{
    webgpu::WebGpuDevice, BufferDesc, Context, ContextDesc, EncoderKind, FunctionDesc, QueueId,
    ShaderStage, StorageMode,
};

const FILL_SHADER: &str = "
@group(2) @binding(0) var<storage, read_write> output: array<u32>;

@compute @workgroup_size(64)
fn fill(@builtin(global_invocation_id) id: vec3<u32>) {
    output[id.x] = id.x;
}
";

fn context() -> Option<Context<WebGpuDevice>> {
    let _ = env_logger::builder().is_test(true).try_init();
    let desc = ContextDesc::default();
    match WebGpuDevice::new(&desc) {
        Ok(device) => Some(Context::new(device, desc)),
        Err(e) => {
            log::warn!("Skipping: {e}");
            None
        }
    }
}

#[test]
fn fill_reaches_the_buffer() {
    let Some(ctx) = context() else { return };
    let buffer = ctx.acquire_buffer(
        BufferDesc {
            name: "fill-target",
            size: 64,
            storage: StorageMode::Shared,
            ..Default::default()
        },
        None,
    );
    let mut state = ctx.create_recording_state();
    ctx.ensure_command_buffer(&mut state, QueueId::Default)
        .unwrap();
    ctx.get_encoder(&mut state, QueueId::Default, EncoderKind::Copy)
        .unwrap();
    state
        .transfer_encoder(QueueId::Default)
        .unwrap()
        .fill_buffer(buffer.into(), 64, 0xA5);
    ctx.release_encoder(&mut state, QueueId::Default, true)
        .unwrap();
    let sync_point = ctx
        .commit(&mut state, QueueId::Default, false)
        .unwrap()
        .expect("fill is work");
    assert!(ctx.wait_for(&sync_point, 5000));
    assert_eq!(ctx.read_buffer(buffer, 0, 64), vec![0xA5; 64]);

    ctx.release_buffer(buffer).unwrap();
    ctx.retire_recording_state(state).unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn compute_pipelines_are_cached() {
    let Some(ctx) = context() else { return };
    let function = ctx
        .create_function(FunctionDesc {
            name: "fill",
            stage: ShaderStage::Compute,
            source: FILL_SHADER,
        })
        .unwrap();
    let first = ctx.get_compute_pipeline(function, 1, 0, 0, "fill");
    assert!(first.is_some());
    assert_eq!(ctx.get_compute_pipeline(function, 1, 0, 0, "fill"), first);
    assert_eq!(ctx.cached_pipeline_counts().2, 1);
    ctx.destroy_function(function);
    ctx.destroy().unwrap();
}

#[test]
fn broken_shader_is_reported() {
    let Some(ctx) = context() else { return };
    let err = ctx
        .create_function(FunctionDesc {
            name: "fill",
            stage: ShaderStage::Compute,
            source: "fn fill( {",
        })
        .unwrap_err();
    assert_eq!(err.name, "fill");
    ctx.destroy().unwrap();
}
