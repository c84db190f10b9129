//! Platform-specific initialization for WebGPU backend
//!
//! WASM uses async initialization, native uses pollster.

use super::*;

//=============================================================================
// Platform Error
//=============================================================================

#[derive(Debug)]
pub struct PlatformError(pub String);

impl std::fmt::Display for PlatformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for PlatformError {}

fn instance_descriptor(desc: &crate::ContextDesc, backends: wgpu::Backends) -> wgpu::InstanceDescriptor {
    let mut flags = wgpu::InstanceFlags::empty();
    if desc.validation {
        flags |= wgpu::InstanceFlags::DEBUG | wgpu::InstanceFlags::VALIDATION;
    }
    wgpu::InstanceDescriptor {
        backends,
        flags,
        ..Default::default()
    }
}

fn adapter_options() -> wgpu::RequestAdapterOptions<'static, 'static> {
    wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }
}

fn device_descriptor() -> wgpu::DeviceDescriptor<'static> {
    wgpu::DeviceDescriptor {
        label: Some("Blade Relay Device"),
        required_features: wgpu::Features::empty(),
        required_limits: wgpu::Limits::default(),
        memory_hints: wgpu::MemoryHints::default(),
        experimental_features: wgpu::ExperimentalFeatures::default(),
        trace: wgpu::Trace::Off,
    }
}

fn check_adapter_index(desc: &crate::ContextDesc) {
    if desc.device_id != 0 {
        log::warn!(
            "Adapter index {} requested, using the high performance adapter",
            desc.device_id
        );
    }
    if desc.capture {
        log::info!("Frame capture is driven by the external tool on this backend");
    }
}

//=============================================================================
// WASM Platform (async)
//=============================================================================

#[cfg(target_arch = "wasm32")]
impl WebGpuDevice {
    pub async fn new(desc: &crate::ContextDesc) -> Result<Self, PlatformError> {
        check_adapter_index(desc);
        let instance =
            wgpu::Instance::new(&instance_descriptor(desc, wgpu::Backends::BROWSER_WEBGPU));
        let adapter = instance
            .request_adapter(&adapter_options())
            .await
            .map_err(|e| PlatformError(format!("Adapter request failed: {}", e)))?;
        let (device, queue) = adapter
            .request_device(&device_descriptor())
            .await
            .map_err(|e| PlatformError(format!("Device request failed: {}", e)))?;
        Ok(Self::from_parts(instance, adapter, device, queue))
    }
}

//=============================================================================
// Native Platform (sync with pollster)
//=============================================================================

#[cfg(not(target_arch = "wasm32"))]
impl WebGpuDevice {
    pub fn new(desc: &crate::ContextDesc) -> Result<Self, PlatformError> {
        check_adapter_index(desc);
        let instance = wgpu::Instance::new(&instance_descriptor(desc, wgpu::Backends::PRIMARY));
        let adapter = pollster::block_on(instance.request_adapter(&adapter_options()))
            .map_err(|e| PlatformError(format!("Adapter request failed: {}", e)))?;
        let (device, queue) = pollster::block_on(adapter.request_device(&device_descriptor()))
            .map_err(|e| PlatformError(format!("Device request failed: {}", e)))?;
        Ok(Self::from_parts(instance, adapter, device, queue))
    }
}
