//! Resource creation for WebGPU backend

use super::*;
use crate::{Buffer, BufferDesc, Sampler, SamplerDesc, Texture, TextureDesc};
use std::ops::Range;

/// wgpu copies and queue writes work in whole words.
const COPY_ALIGNMENT: u64 = wgpu::COPY_BUFFER_ALIGNMENT;
const READBACK_TIMEOUT: Duration = Duration::from_secs(5);

//=============================================================================
// Format Mapping
//=============================================================================

pub(super) fn map_texture_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::R8Unorm => wgpu::TextureFormat::R8Unorm,
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
        TextureFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
        TextureFormat::Bgra8UnormSrgb => wgpu::TextureFormat::Bgra8UnormSrgb,
        TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::R32Float => wgpu::TextureFormat::R32Float,
        TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
        TextureFormat::Depth32FloatStencil8Uint => wgpu::TextureFormat::Depth32FloatStencil8,
    }
}

fn map_view_dimension(dimension: crate::TextureDimension) -> wgpu::TextureViewDimension {
    match dimension {
        crate::TextureDimension::D2 => wgpu::TextureViewDimension::D2,
        crate::TextureDimension::D2Array => wgpu::TextureViewDimension::D2Array,
    }
}

fn map_texture_usage(usage: crate::TextureUsage) -> wgpu::TextureUsages {
    let mut raw = wgpu::TextureUsages::COPY_SRC | wgpu::TextureUsages::COPY_DST;
    if usage.contains(crate::TextureUsage::RESOURCE) {
        raw |= wgpu::TextureUsages::TEXTURE_BINDING;
    }
    if usage.contains(crate::TextureUsage::STORAGE) {
        raw |= wgpu::TextureUsages::STORAGE_BINDING;
    }
    if usage.contains(crate::TextureUsage::TARGET) {
        raw |= wgpu::TextureUsages::RENDER_ATTACHMENT;
    }
    raw
}

fn map_address_mode(mode: crate::AddressMode) -> wgpu::AddressMode {
    match mode {
        crate::AddressMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
        crate::AddressMode::Repeat => wgpu::AddressMode::Repeat,
        crate::AddressMode::MirrorRepeat => wgpu::AddressMode::MirrorRepeat,
    }
}

fn map_filter_mode(mode: crate::FilterMode) -> wgpu::FilterMode {
    match mode {
        crate::FilterMode::Nearest => wgpu::FilterMode::Nearest,
        crate::FilterMode::Linear => wgpu::FilterMode::Linear,
    }
}

fn map_mipmap_filter_mode(mode: crate::FilterMode) -> wgpu::MipmapFilterMode {
    match mode {
        crate::FilterMode::Nearest => wgpu::MipmapFilterMode::Nearest,
        crate::FilterMode::Linear => wgpu::MipmapFilterMode::Linear,
    }
}

pub(super) fn map_compare_function(func: crate::CompareFunction) -> wgpu::CompareFunction {
    match func {
        crate::CompareFunction::Never => wgpu::CompareFunction::Never,
        crate::CompareFunction::Less => wgpu::CompareFunction::Less,
        crate::CompareFunction::LessEqual => wgpu::CompareFunction::LessEqual,
        crate::CompareFunction::Equal => wgpu::CompareFunction::Equal,
        crate::CompareFunction::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
        crate::CompareFunction::Greater => wgpu::CompareFunction::Greater,
        crate::CompareFunction::NotEqual => wgpu::CompareFunction::NotEqual,
        crate::CompareFunction::Always => wgpu::CompareFunction::Always,
    }
}

/// Word-aligned range covering `offset..offset + size`, clamped to `len`.
fn aligned_range(offset: u64, size: u64, len: u64) -> Range<u64> {
    let start = (offset & !(COPY_ALIGNMENT - 1)).min(len);
    let end = wgpu::util::align_to(offset.saturating_add(size), COPY_ALIGNMENT).min(len);
    start..end
}

fn label(name: &str) -> Option<&str> {
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

//=============================================================================
// Host Access
//=============================================================================

impl WebGpuDevice {
    /// Copies a range of a GPU buffer into host memory, blocking until the
    /// queue has caught up.
    fn read_gpu(&self, gpu: &wgpu::Buffer, offset: u64, size: u64) -> Vec<u8> {
        let range = aligned_range(offset, size, gpu.size());
        if range.is_empty() {
            return Vec::new();
        }
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: range.end - range.start,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback"),
            });
        encoder.copy_buffer_to_buffer(gpu, range.start, &staging, 0, range.end - range.start);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let mapped = Arc::new(Mutex::new(None));
        let result = Arc::clone(&mapped);
        slice.map_async(wgpu::MapMode::Read, move |r| {
            *result.lock().unwrap() = Some(r);
        });
        if !self.poll_until(READBACK_TIMEOUT, |_| mapped.lock().unwrap().is_some()) {
            log::error!("Timed out reading back {:?} of a buffer", range);
            return Vec::new();
        }
        let status = mapped.lock().unwrap().take();
        if let Some(Err(e)) = status {
            log::error!("Mapping the readback buffer failed: {e}");
            return Vec::new();
        }
        let skip = (offset - range.start) as usize;
        let data = {
            let view = slice.get_mapped_range();
            let end = (skip as u64 + size).min(view.len() as u64) as usize;
            view[skip.min(end)..end].to_vec()
        };
        staging.unmap();
        data
    }

    /// Uploads host data into a GPU buffer. Unaligned edges are merged with
    /// the current contents first.
    fn write_gpu(&self, gpu: &wgpu::Buffer, offset: u64, data: &[u8]) {
        let range = aligned_range(offset, data.len() as u64, gpu.size());
        if range.is_empty() {
            return;
        }
        if range.start == offset && range.end == offset + data.len() as u64 {
            self.queue.write_buffer(gpu, offset, data);
            return;
        }
        let mut merged = self.read_gpu(gpu, range.start, range.end - range.start);
        if merged.len() as u64 != range.end - range.start {
            log::warn!("Dropping an unaligned write of {} bytes", data.len());
            return;
        }
        let skip = (offset - range.start) as usize;
        let len = data.len().min(merged.len() - skip);
        merged[skip..skip + len].copy_from_slice(&data[..len]);
        self.queue.write_buffer(gpu, range.start, &merged);
    }
}

//=============================================================================
// ResourceDevice Implementation
//=============================================================================

#[hidden_trait::expose]
impl crate::traits::ResourceDevice for WebGpuDevice {
    fn create_buffer(&self, desc: BufferDesc, data: Option<&[u8]>) -> Buffer {
        // Storage and transient memory have no wgpu equivalent, every buffer
        // is device memory with host access through the queue.
        let usage = wgpu::BufferUsages::COPY_SRC
            | wgpu::BufferUsages::COPY_DST
            | wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::UNIFORM
            | wgpu::BufferUsages::VERTEX
            | wgpu::BufferUsages::INDEX
            | wgpu::BufferUsages::INDIRECT;
        let padded = wgpu::util::align_to(desc.size.max(COPY_ALIGNMENT), COPY_ALIGNMENT);
        let gpu = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: label(desc.name),
            size: padded,
            usage,
            mapped_at_creation: false,
        });

        let shadow = match desc.storage {
            StorageMode::Managed => {
                let mut shadow = vec![0u8; padded as usize].into_boxed_slice();
                if let Some(data) = data {
                    let len = data.len().min(desc.size as usize);
                    shadow[..len].copy_from_slice(&data[..len]);
                }
                Some(shadow)
            }
            _ => None,
        };
        match (shadow.as_deref(), data) {
            (Some(shadow), Some(_)) => self.queue.write_buffer(&gpu, 0, shadow),
            (None, Some(data)) => {
                let mut padded_data = vec![0u8; padded as usize];
                let len = data.len().min(desc.size as usize);
                padded_data[..len].copy_from_slice(&data[..len]);
                self.queue.write_buffer(&gpu, 0, &padded_data);
            }
            (_, None) => {}
        }

        let raw = self.hub.write().unwrap().buffers.insert(BufferEntry {
            gpu,
            storage: desc.storage,
            shadow,
        });
        log::trace!("Created buffer '{}' of {} bytes", desc.name, desc.size);
        Buffer {
            raw,
            size: desc.size,
            storage: desc.storage,
        }
    }

    fn destroy_buffer(&self, buffer: Buffer) {
        match self.hub.write().unwrap().buffers.remove(buffer.raw) {
            Some(entry) => entry.gpu.destroy(),
            None => log::warn!("Destroying an unknown buffer {:?}", buffer.raw),
        }
    }

    fn write_buffer(&self, buffer: Buffer, offset: u64, data: &[u8]) {
        let data = &data[..data.len().min(buffer.size.saturating_sub(offset) as usize)];
        if data.is_empty() {
            return;
        }
        let gpu = {
            let mut hub = self.hub.write().unwrap();
            let Some(entry) = hub.buffers.get_mut(buffer.raw) else {
                log::warn!("Writing into an unknown buffer {:?}", buffer.raw);
                return;
            };
            if let Some(ref mut shadow) = entry.shadow {
                let start = offset as usize;
                shadow[start..start + data.len()].copy_from_slice(data);
                return;
            }
            entry.gpu.clone()
        };
        self.write_gpu(&gpu, offset, data);
    }

    fn read_buffer(&self, buffer: Buffer, offset: u64, size: u64) -> Vec<u8> {
        let size = size.min(buffer.size.saturating_sub(offset));
        if size == 0 {
            return Vec::new();
        }
        let gpu = {
            let hub = self.hub.read().unwrap();
            let Some(entry) = hub.buffers.get(buffer.raw) else {
                log::warn!("Reading from an unknown buffer {:?}", buffer.raw);
                return Vec::new();
            };
            if let Some(ref shadow) = entry.shadow {
                let start = offset as usize;
                return shadow[start..start + size as usize].to_vec();
            }
            entry.gpu.clone()
        };
        self.read_gpu(&gpu, offset, size)
    }

    fn did_modify_range(&self, buffer: Buffer, range: Range<u64>) {
        let hub = self.hub.read().unwrap();
        let Some(entry) = hub.buffers.get(buffer.raw) else {
            log::warn!("Flushing {:?} of a destroyed buffer", range);
            return;
        };
        let Some(ref shadow) = entry.shadow else {
            log::warn!(
                "Flushing {:?} of a {:?} buffer which is not managed",
                range,
                entry.storage
            );
            return;
        };
        let aligned = aligned_range(
            range.start,
            range.end.saturating_sub(range.start),
            shadow.len() as u64,
        );
        if !aligned.is_empty() {
            self.queue.write_buffer(
                &entry.gpu,
                aligned.start,
                &shadow[aligned.start as usize..aligned.end as usize],
            );
        }
    }

    fn create_texture(&self, desc: TextureDesc, data: Option<&[u8]>) -> Texture {
        let layers = desc.array_layer_count.max(1);
        let extent = wgpu::Extent3d {
            width: desc.size.width,
            height: desc.size.height,
            depth_or_array_layers: layers,
        };
        let gpu = self.device.create_texture(&wgpu::TextureDescriptor {
            label: label(desc.name),
            size: extent,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: map_texture_format(desc.format),
            usage: map_texture_usage(desc.usage),
            view_formats: &[],
        });
        let view = gpu.create_view(&wgpu::TextureViewDescriptor {
            label: label(desc.name),
            dimension: Some(map_view_dimension(desc.dimension)),
            ..Default::default()
        });

        match data {
            Some(_) if desc.format.is_depth() => {
                log::warn!("Ignoring initial data of depth texture '{}'", desc.name);
            }
            Some(data) => {
                let bytes_per_row = desc.size.width * desc.format.block_size();
                let required = bytes_per_row as usize * desc.size.height as usize * layers as usize;
                let mut contents = data[..data.len().min(required)].to_vec();
                contents.resize(required, 0);
                self.queue.write_texture(
                    wgpu::TexelCopyTextureInfo {
                        texture: &gpu,
                        mip_level: 0,
                        origin: wgpu::Origin3d::ZERO,
                        aspect: wgpu::TextureAspect::All,
                    },
                    &contents,
                    wgpu::TexelCopyBufferLayout {
                        offset: 0,
                        bytes_per_row: Some(bytes_per_row),
                        rows_per_image: Some(desc.size.height),
                    },
                    extent,
                );
            }
            None => {}
        }

        let raw = self
            .hub
            .write()
            .unwrap()
            .textures
            .insert(TextureEntry { gpu, view });
        Texture {
            raw,
            format: desc.format,
            dimension: desc.dimension,
            size: desc.size,
        }
    }

    fn destroy_texture(&self, texture: Texture) {
        if let Some(entry) = self.hub.write().unwrap().textures.remove(texture.raw) {
            entry.gpu.destroy();
        }
    }

    fn create_sampler(&self, desc: SamplerDesc) -> Sampler {
        let gpu = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: label(desc.name),
            address_mode_u: map_address_mode(desc.address_modes[0]),
            address_mode_v: map_address_mode(desc.address_modes[1]),
            address_mode_w: map_address_mode(desc.address_modes[2]),
            mag_filter: map_filter_mode(desc.mag_filter),
            min_filter: map_filter_mode(desc.min_filter),
            mipmap_filter: map_mipmap_filter_mode(desc.mipmap_filter),
            compare: desc.compare.map(map_compare_function),
            ..Default::default()
        });
        let raw = self.hub.write().unwrap().samplers.insert(gpu);
        Sampler { raw }
    }

    fn destroy_sampler(&self, sampler: Sampler) {
        self.hub.write().unwrap().samplers.remove(sampler.raw);
    }
}
