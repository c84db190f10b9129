//! Pipeline state cache.
//!
//! Pipeline and depth-stencil objects are expensive to build and immutable,
//! so they are memoized by structural keys and shared by all recording
//! threads. Entries live until the context is destroyed.

use crate::{
    command::Command, BlendState, ColorWrites, ComputePipeline, ComputePipelineDesc, Context,
    ContractViolation, DepthState, DepthStencilDesc, DepthStencilState, Device, DeviceId,
    EncoderKind, Function, MultisampleState, PipelineError, QueueId, RecordingState,
    RenderPipeline, RenderPipelineDesc, StateDelta,
};
use std::{
    collections::{hash_map::Entry, BTreeSet, HashMap},
    hash::{DefaultHasher, Hash, Hasher},
    sync::Mutex,
};

pub(crate) fn structural_hash<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

//=============================================================================
// Keys
//=============================================================================

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct RenderKey {
    pub device: DeviceId,
    pub vertex: Function,
    pub fragment: Option<Function>,
    /// Hash of the vertex layout, 0 with manual vertex assembly.
    pub vertex_layout: u64,
    /// Hash of the color and depth attachment formats.
    pub attachments: u64,
    pub blend: Option<BlendState>,
    pub write_mask: ColorWrites,
    pub multisample: MultisampleState,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct DepthKey {
    pub device: DeviceId,
    pub depth: DepthState,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ComputeKey {
    pub device: DeviceId,
    pub function: Function,
    pub buffer_count: u32,
    pub texture_count: u32,
    pub immutable_buffer_mask: u64,
}

//=============================================================================
// Cache
//=============================================================================

pub(crate) struct PipelineCache<K, V> {
    map: Mutex<HashMap<K, V>>,
}

impl<K: Hash + Eq, V: Copy> PipelineCache<K, V> {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Looks `key` up, building the object outside of the lock on a miss.
    /// When two threads race on the same key the loser destroys its object.
    pub fn get_or_create(
        &self,
        key: K,
        label: &str,
        create: impl FnOnce() -> Result<V, PipelineError>,
        destroy: impl FnOnce(V),
    ) -> Option<V> {
        if let Some(&value) = self.map.lock().unwrap().get(&key) {
            return Some(value);
        }
        let created = match create() {
            Ok(value) => value,
            Err(e) => {
                log::error!("Failed to create pipeline '{}': {}", label, e.message);
                return None;
            }
        };
        let mut map = self.map.lock().unwrap();
        match map.entry(key) {
            Entry::Occupied(e) => {
                let existing = *e.get();
                drop(map);
                destroy(created);
                Some(existing)
            }
            Entry::Vacant(e) => Some(*e.insert(created)),
        }
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn drain(&self) -> Vec<V> {
        self.map.lock().unwrap().drain().map(|(_, v)| v).collect()
    }
}

pub(crate) struct PipelineCaches {
    pub render: PipelineCache<RenderKey, RenderPipeline>,
    pub depth: PipelineCache<DepthKey, DepthStencilState>,
    pub compute: PipelineCache<ComputeKey, ComputePipeline>,
}

impl PipelineCaches {
    pub fn new() -> Self {
        Self {
            render: PipelineCache::new(),
            depth: PipelineCache::new(),
            compute: PipelineCache::new(),
        }
    }
}

//=============================================================================
// Context Operations
//=============================================================================

impl<D: Device> Context<D> {
    /// Number of cached render, depth-stencil and compute objects.
    pub fn cached_pipeline_counts(&self) -> (usize, usize, usize) {
        (
            self.pipelines.render.len(),
            self.pipelines.depth.len(),
            self.pipelines.compute.len(),
        )
    }

    pub fn get_compute_pipeline(
        &self,
        function: Function,
        buffer_count: u32,
        texture_count: u32,
        immutable_buffer_mask: u64,
        label: &str,
    ) -> Option<ComputePipeline> {
        let key = ComputeKey {
            device: self.info.id,
            function,
            buffer_count,
            texture_count,
            immutable_buffer_mask,
        };
        let desc = ComputePipelineDesc {
            name: label,
            function,
            buffer_count,
            texture_count,
            immutable_buffer_mask,
        };
        self.pipelines.compute.get_or_create(
            key,
            label,
            || {
                let pipeline = self.device.create_compute_pipeline(&desc)?;
                self.stats.inc_pipelines_created();
                Ok(pipeline)
            },
            |duplicate| self.device.destroy_compute_pipeline(duplicate),
        )
    }

    /// Binds the compute pipeline for `function` on the compute encoder in
    /// use on `queue`. Returns its thread execution width, 0 when the
    /// pipeline could not be created.
    pub fn set_compute_encoder_state(
        &self,
        state: &mut RecordingState,
        function: Function,
        buffer_count: u32,
        immutable_buffer_mask: u64,
        label: &str,
        queue: QueueId,
    ) -> Result<u32, ContractViolation> {
        let wq = state.queue(queue);
        if wq.open_kind() != Some(EncoderKind::Compute) || !wq.in_use {
            return Err(ContractViolation::WrongEncoder {
                queue,
                expected: EncoderKind::Compute,
                found: wq.open_kind(),
            });
        }
        let hash = (function, buffer_count, immutable_buffer_mask);
        let hash = structural_hash(&hash);
        let wq = state.queue_mut(queue);
        if wq.bound.compute_hash == hash {
            if let Some(pipeline) = wq.bound.compute {
                return Ok(pipeline.thread_execution_width);
            }
        }
        match self.get_compute_pipeline(function, buffer_count, 0, immutable_buffer_mask, label) {
            Some(pipeline) => {
                wq.bound.compute_hash = hash;
                if wq.bound.compute != Some(pipeline) {
                    wq.push(Command::SetComputePipeline(pipeline));
                    wq.bound.compute = Some(pipeline);
                }
                Ok(pipeline.thread_execution_width)
            }
            None => {
                wq.bound.compute_hash = 0;
                wq.bound.compute = None;
                Ok(0)
            }
        }
    }

    /// Thread execution width of the compute pipeline bound on `queue`.
    pub fn current_compute_thread_execution_width(
        &self,
        state: &RecordingState,
        queue: QueueId,
    ) -> u32 {
        state
            .queue(queue)
            .bound
            .compute
            .map_or(0, |pipeline| pipeline.thread_execution_width)
    }

    pub fn max_threads_per_threadgroup(&self, state: &RecordingState, queue: QueueId) -> u32 {
        state
            .queue(queue)
            .bound
            .compute
            .map_or(0, |pipeline| pipeline.max_total_threads_per_threadgroup)
    }

    /// Looks up the render pipeline for the current state and binds it on
    /// the render encoder of `queue` if it changed.
    pub(crate) fn bind_render_pipeline(
        &self,
        state: &mut RecordingState,
        queue: QueueId,
        pending: &BTreeSet<StateDelta>,
    ) -> Result<Option<RenderPipeline>, ContractViolation> {
        let program = state
            .program
            .as_ref()
            .ok_or(ContractViolation::NoShadingProgram)?;
        let (color_formats, depth_format) = state.attachment_formats(queue);
        let raster = state.raster;
        let layout = if program.manual_vertex_assembly {
            None
        } else {
            Some(&state.vertex_layout)
        };

        let wq = &mut state.queues[queue.index()];
        if pending.contains(&StateDelta::VertexLayout) {
            wq.bound.vertex_layout_hash = layout.map_or(0, structural_hash);
        }
        if pending.contains(&StateDelta::DrawTarget) {
            wq.bound.attachments_hash = structural_hash(&(&color_formats, depth_format));
        }
        let key = RenderKey {
            device: self.info.id,
            vertex: program.vertex,
            fragment: program.fragment,
            vertex_layout: wq.bound.vertex_layout_hash,
            attachments: wq.bound.attachments_hash,
            blend: raster.blend,
            write_mask: raster.write_mask,
            multisample: raster.multisample,
        };
        let hash = structural_hash(&key);
        if hash == wq.bound.render_hash {
            if let Some(pipeline) = wq.bound.render {
                return Ok(Some(pipeline));
            }
        }

        let desc = RenderPipelineDesc {
            name: &program.label,
            vertex: program.vertex,
            fragment: program.fragment,
            vertex_layout: layout,
            color_formats: &color_formats,
            depth_format,
            blend: raster.blend,
            write_mask: raster.write_mask,
            multisample: raster.multisample,
        };
        let pipeline = self.pipelines.render.get_or_create(
            key,
            desc.name,
            || {
                let pipeline = self.device.create_render_pipeline(&desc)?;
                self.stats.inc_pipelines_created();
                Ok(pipeline)
            },
            |duplicate| self.device.destroy_render_pipeline(duplicate),
        );
        match pipeline {
            Some(pipeline) => {
                wq.bound.render_hash = hash;
                if wq.bound.render != Some(pipeline) {
                    wq.push(Command::SetRenderPipeline(pipeline));
                    wq.bound.render = Some(pipeline);
                }
                Ok(Some(pipeline))
            }
            None => {
                wq.bound.render_hash = 0;
                wq.bound.render = None;
                Ok(None)
            }
        }
    }

    pub(crate) fn bind_depth_stencil_state(
        &self,
        state: &mut RecordingState,
        queue: QueueId,
    ) -> Option<DepthStencilState> {
        let key = DepthKey {
            device: self.info.id,
            depth: state.raster.depth,
        };
        let hash = structural_hash(&key);
        let wq = state.queue_mut(queue);
        if hash == wq.bound.depth_hash {
            if let Some(depth) = wq.bound.depth {
                return Some(depth);
            }
        }
        let desc = DepthStencilDesc {
            name: "depth-stencil",
            depth: key.depth,
        };
        let depth = self.pipelines.depth.get_or_create(
            key,
            desc.name,
            || {
                let depth = self.device.create_depth_stencil_state(&desc)?;
                self.stats.inc_pipelines_created();
                Ok(depth)
            },
            |duplicate| self.device.destroy_depth_stencil_state(duplicate),
        );
        match depth {
            Some(depth) => {
                wq.bound.depth_hash = hash;
                if wq.bound.depth != Some(depth) {
                    wq.push(Command::SetDepthStencilState(depth));
                    wq.bound.depth = Some(depth);
                }
            }
            None => {
                wq.bound.depth_hash = 0;
                wq.bound.depth = None;
            }
        }
        depth
    }

    /// Destroys every cached pipeline object.
    pub(crate) fn destroy_pipelines(&self) {
        for pipeline in self.pipelines.render.drain() {
            self.device.destroy_render_pipeline(pipeline);
        }
        for depth in self.pipelines.depth.drain() {
            self.device.destroy_depth_stencil_state(depth);
        }
        for pipeline in self.pipelines.compute.drain() {
            self.device.destroy_compute_pipeline(pipeline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DepthStencilKey, RenderPipelineKey};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn memoizes_by_key() {
        let cache = PipelineCache::<u32, RenderPipeline>::new();
        let created = AtomicUsize::new(0);
        let make = || {
            created.fetch_add(1, Ordering::Relaxed);
            Ok(RenderPipeline {
                raw: RenderPipelineKey::default(),
            })
        };
        let first = cache.get_or_create(1, "a", make, |_| unreachable!());
        let second = cache.get_or_create(1, "a", make, |_| unreachable!());
        assert_eq!(first, second);
        assert_eq!(created.load(Ordering::Relaxed), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failure_is_not_cached() {
        let cache = PipelineCache::<u32, DepthStencilState>::new();
        let failed = cache.get_or_create(
            3,
            "broken",
            || {
                Err(PipelineError {
                    name: "broken".to_string(),
                    message: "no".to_string(),
                })
            },
            |_| unreachable!(),
        );
        assert_eq!(failed, None);
        assert_eq!(cache.len(), 0);
        let fixed = cache.get_or_create(
            3,
            "fixed",
            || {
                Ok(DepthStencilState {
                    raw: DepthStencilKey::default(),
                })
            },
            |_| unreachable!(),
        );
        assert!(fixed.is_some());
    }

    #[test]
    fn racing_creators_agree() {
        let cache = PipelineCache::<u32, u32>::new();
        let destroyed = Mutex::new(Vec::new());
        std::thread::scope(|s| {
            for i in 0..8u32 {
                let cache = &cache;
                let destroyed = &destroyed;
                s.spawn(move || {
                    let value = cache
                        .get_or_create(
                            0,
                            "race",
                            || Ok(100 + i),
                            |dup| destroyed.lock().unwrap().push(dup),
                        )
                        .unwrap();
                    assert!((100..108).contains(&value));
                });
            }
        });
        let winner = cache.drain()[0];
        let destroyed = destroyed.into_inner().unwrap();
        assert!(!destroyed.contains(&winner));
        assert_eq!(cache.len(), 0);
    }
}
