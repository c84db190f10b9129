//! Generated index buffers.
//!
//! Quads are drawn as triangle pairs, and a few draw paths need trivial
//! triangle-list or point index buffers. Only 32-bit indices are produced.

use crate::{
    state::RemappedIndices, Buffer, BufferDesc, CacheMode, Context, ContractViolation,
    Device, IndexType, RecordingState, StorageMode,
};
use std::sync::Mutex;

/// Splits every quad `a b c d` into the triangles `a b c` and `a c d`.
/// A trailing partial quad is dropped.
pub fn remap_quads(quads: &[u32]) -> Vec<u32> {
    quads
        .chunks_exact(4)
        .flat_map(|q| [q[0], q[1], q[2], q[0], q[2], q[3]])
        .collect()
}

pub fn triangle_list_indices(triangle_count: u32) -> Vec<u32> {
    (0..triangle_count * 3).collect()
}

/// `count` indices drawing points as triangles. With `quads` every four
/// vertices form a quad split along its diagonal, otherwise the indices
/// run through the vertices in order.
pub fn point_indices(count: u32, quads: bool) -> Vec<u32> {
    if !quads {
        return (0..count).collect();
    }
    (0..count.div_ceil(6))
        .flat_map(|quad| {
            let base = quad * 4;
            [base, base + 1, base + 2, base + 1, base + 2, base + 3]
        })
        .take(count as usize)
        .collect()
}

fn index_desc(name: &str, count: usize) -> BufferDesc<'_> {
    BufferDesc {
        name,
        size: (count * size_of::<u32>()) as u64,
        storage: StorageMode::Managed,
        cache: CacheMode::DefaultCache,
    }
}

/// Triangle list index buffer shared by all recording threads.
pub(crate) struct SharedIndices {
    triangles: Mutex<Option<(Buffer, u32)>>,
}

impl SharedIndices {
    pub fn new() -> Self {
        Self {
            triangles: Mutex::new(None),
        }
    }

    pub fn take(&self) -> Option<Buffer> {
        self.triangles.lock().unwrap().take().map(|(buffer, _)| buffer)
    }
}

impl<D: Device> Context<D> {
    /// Index buffer that draws the quads of the bound index buffer as
    /// triangles. The remapped buffer is kept until the bound one changes.
    pub fn quad_index_buffer(
        &self,
        state: &mut RecordingState,
        quad_index_count: u32,
    ) -> Result<Buffer, ContractViolation> {
        let (source, index_type) = state
            .index_buffer
            .ok_or(ContractViolation::MissingIndexBuffer)?;
        if index_type != IndexType::U32 {
            return Err(ContractViolation::UnsupportedIndexType);
        }
        if let Some(remap) = state.quad_indices {
            if remap.source == source && remap.count == quad_index_count {
                return Ok(remap.buffer);
            }
            state.quad_indices = None;
            self.release_buffer(remap.buffer)?;
        }

        log::debug!("Remapping {quad_index_count} quad indices");
        let raw = self.device.read_buffer(
            source.buffer,
            source.offset,
            quad_index_count as u64 * IndexType::U32.size(),
        );
        let quads: Vec<u32> = raw
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        let triangles = remap_quads(&quads);
        let buffer = self.acquire_buffer(
            index_desc("quad-indices", triangles.len()),
            Some(bytemuck::cast_slice(&triangles)),
        );
        state.quad_indices = Some(RemappedIndices {
            source,
            count: quad_index_count,
            buffer,
        });
        Ok(buffer)
    }

    /// Index buffer enumerating `triangle_count` triangles, grown on demand.
    pub fn triangle_list_index_buffer(
        &self,
        index_type: IndexType,
        triangle_count: u32,
    ) -> Result<Buffer, ContractViolation> {
        if index_type != IndexType::U32 {
            return Err(ContractViolation::UnsupportedIndexType);
        }
        let mut triangles = self.shared_indices.triangles.lock().unwrap();
        if let Some((buffer, capacity)) = *triangles {
            if capacity >= triangle_count {
                return Ok(buffer);
            }
            // in-flight draws may still read the old one
            self.release_buffer(buffer)?;
        }
        log::debug!("Growing the triangle list index buffer to {triangle_count} triangles");
        let indices = triangle_list_indices(triangle_count);
        let buffer = self.acquire_buffer(
            index_desc("triangle-list-indices", indices.len()),
            Some(bytemuck::cast_slice(&indices)),
        );
        *triangles = Some((buffer, triangle_count));
        Ok(buffer)
    }

    /// Index buffer holding at least `count` point indices.
    pub fn point_index_buffer(
        &self,
        state: &mut RecordingState,
        index_type: IndexType,
        count: u32,
        quads: bool,
    ) -> Result<Buffer, ContractViolation> {
        if index_type != IndexType::U32 {
            return Err(ContractViolation::UnsupportedIndexType);
        }
        let needed = count as u64 * IndexType::U32.size();
        if let Some(buffer) = state.point_indices {
            if buffer.size >= needed {
                return Ok(buffer);
            }
            state.point_indices = None;
            self.release_buffer(buffer)?;
        }
        let indices = point_indices(count, quads);
        let buffer = self.acquire_buffer(
            index_desc("point-indices", indices.len()),
            Some(bytemuck::cast_slice(&indices)),
        );
        state.point_indices = Some(buffer);
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quads_split_along_diagonal() {
        assert_eq!(
            remap_quads(&[10, 11, 12, 13, 20, 21, 22, 23, 99]),
            vec![10, 11, 12, 10, 12, 13, 20, 21, 22, 20, 22, 23]
        );
        assert!(remap_quads(&[]).is_empty());
    }

    #[test]
    fn triangle_list_is_identity() {
        assert_eq!(triangle_list_indices(2), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn point_quads() {
        assert_eq!(
            point_indices(12, true),
            vec![0, 1, 2, 1, 2, 3, 4, 5, 6, 5, 6, 7]
        );
        assert_eq!(point_indices(4, true), vec![0, 1, 2, 1]);
        assert_eq!(point_indices(3, false), vec![0, 1, 2]);
    }
}
