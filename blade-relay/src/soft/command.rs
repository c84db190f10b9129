//! Command list replay.

use super::*;
use crate::{BufferPiece, Submission, SyncPoint};
use std::time::Duration;

impl SoftDevice {
    /// Replays the transfer work of a submission into host memory and checks
    /// that every referenced object is alive.
    fn replay(&self, submission: &Submission) {
        profiling::scope!("soft replay");
        let sequence = submission.sequence;
        let mut hub = self.hub.write().unwrap();
        let check_buffer = |hub: &Hub, piece: &BufferPiece| {
            if !hub.buffers.contains_key(piece.buffer.raw) {
                self.report_dangling("buffer", sequence);
            }
        };
        for command in submission.commands {
            match *command {
                Command::CopyBufferToBuffer { src, dst, size } => {
                    let data = match hub.buffers.get(src.buffer.raw) {
                        Some(entry) => {
                            let start = (src.offset as usize).min(entry.contents.len());
                            let end = src.offset.saturating_add(size).min(entry.contents.len() as u64);
                            entry.contents[start..end as usize].to_vec()
                        }
                        None => {
                            self.report_dangling("buffer", sequence);
                            continue;
                        }
                    };
                    match hub.buffers.get_mut(dst.buffer.raw) {
                        Some(entry) => {
                            let start = (dst.offset as usize).min(entry.contents.len());
                            let len = data.len().min(entry.contents.len() - start);
                            entry.contents[start..start + len].copy_from_slice(&data[..len]);
                        }
                        None => self.report_dangling("buffer", sequence),
                    }
                }
                Command::FillBuffer { dst, size, value } => {
                    match hub.buffers.get_mut(dst.buffer.raw) {
                        Some(entry) => {
                            let len = entry.contents.len() as u64;
                            let start = dst.offset.min(len) as usize;
                            let end = dst.offset.saturating_add(size).min(len) as usize;
                            entry.contents[start..end].fill(value);
                        }
                        None => self.report_dangling("buffer", sequence),
                    }
                }
                Command::SetBuffer { ref piece, .. } => check_buffer(&*hub, piece),
                Command::DrawIndexed { ref index, .. } => check_buffer(&*hub, index),
                Command::SetTexture { texture, .. } => {
                    if !hub.textures.contains_key(texture.raw) {
                        self.report_dangling("texture", sequence);
                    }
                }
                Command::SetSampler { sampler, .. } => {
                    if !hub.samplers.contains_key(sampler.raw) {
                        self.report_dangling("sampler", sequence);
                    }
                }
                Command::SetRenderPipeline(pipeline) => {
                    if !hub.render_pipelines.contains_key(pipeline.raw) {
                        self.report_dangling("render pipeline", sequence);
                    }
                }
                Command::SetDepthStencilState(state) => {
                    if !hub.depth_stencil_states.contains_key(state.raw) {
                        self.report_dangling("depth-stencil state", sequence);
                    }
                }
                Command::SetComputePipeline(pipeline) => {
                    if !hub.compute_pipelines.contains_key(pipeline.raw) {
                        self.report_dangling("compute pipeline", sequence);
                    }
                }
                Command::SetBytes { ref range, .. } => {
                    if range.end > submission.plain_data.len() {
                        log::error!(
                            "Submission {sequence} reads inline data {:?} past {} bytes",
                            range,
                            submission.plain_data.len()
                        );
                    }
                }
                _ => {}
            }
        }
    }
}

//=============================================================================
// CommandDevice Implementation
//=============================================================================

#[hidden_trait::expose]
impl crate::traits::CommandDevice for SoftDevice {
    fn create_command_buffer(&self) -> CommandBufferKey {
        self.hub.write().unwrap().command_buffers.insert(())
    }

    fn destroy_command_buffer(&self, raw: CommandBufferKey) {
        if self.hub.write().unwrap().command_buffers.remove(raw).is_none() {
            log::warn!("Destroying an unknown command buffer {:?}", raw);
        }
    }

    fn submit(&self, submission: Submission, on_complete: CompletionHandler) {
        log::trace!(
            "Submitting '{}' ({} commands) on {}",
            submission.label,
            submission.commands.len(),
            submission.queue
        );
        self.replay(&submission);
        self.submissions.lock().unwrap().push(SubmittedWork {
            queue: submission.queue,
            sequence: submission.sequence,
            label: submission.label.to_string(),
            commands: submission.commands.to_vec(),
            plain_data: submission.plain_data.to_vec(),
        });
        self.scheduled.lock().unwrap().insert(submission.sequence);
        match self.completion {
            Completion::Immediate => self.complete(submission.sequence, on_complete),
            Completion::Deferred => self
                .in_flight
                .lock()
                .unwrap()
                .push_back((submission.sequence, on_complete)),
        }
    }

    fn wait_until_scheduled(&self, sync_point: &SyncPoint) -> bool {
        // replay happens inside `submit`, so there is nothing to wait for
        self.scheduled.lock().unwrap().contains(sync_point.sequence)
    }

    fn wait_for(&self, sync_point: &SyncPoint, timeout_ms: u32) -> bool {
        let completed = self.completed.lock().unwrap();
        let (completed, _) = self
            .completed_cond
            .wait_timeout_while(
                completed,
                Duration::from_millis(timeout_ms as u64),
                |completed| !completed.contains(sync_point.sequence),
            )
            .unwrap();
        completed.contains(sync_point.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Buffer, BufferDesc};
    use std::sync::{atomic::AtomicUsize, Arc};

    fn buffer(device: &SoftDevice, data: &[u8]) -> Buffer {
        device.create_buffer(
            BufferDesc {
                name: "replay",
                size: data.len() as u64,
                ..Default::default()
            },
            Some(data),
        )
    }

    fn submit(device: &SoftDevice, sequence: u64, commands: &[Command], done: &Arc<AtomicUsize>) {
        let done = Arc::clone(done);
        device.submit(
            Submission {
                queue: QueueId::Default,
                sequence,
                label: "test",
                commands,
                plain_data: &[],
            },
            Box::new(move || {
                done.fetch_add(1, Ordering::SeqCst);
            }),
        );
    }

    #[test]
    fn copies_and_fills_land_in_memory() {
        let device = SoftDevice::new(Completion::Immediate);
        let src = buffer(&device, &[1, 2, 3, 4]);
        let dst = buffer(&device, &[0; 6]);
        let done = Arc::new(AtomicUsize::new(0));
        submit(
            &device,
            0,
            &[
                Command::FillBuffer {
                    dst: dst.into(),
                    size: 6,
                    value: 9,
                },
                Command::CopyBufferToBuffer {
                    src: src.at(1),
                    dst: dst.at(2),
                    size: 3,
                },
            ],
            &done,
        );
        assert_eq!(device.read_buffer(dst, 0, 6), vec![9, 9, 2, 3, 4, 9]);
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(device.wait_for(&SyncPoint { sequence: 0 }, 0));
        assert_eq!(device.dangling_references(), 0);
    }

    #[test]
    fn deferred_completion_waits_for_retire() {
        let device = SoftDevice::new(Completion::Deferred);
        let done = Arc::new(AtomicUsize::new(0));
        for sequence in 0..3 {
            submit(&device, sequence, &[], &done);
        }
        assert_eq!(device.in_flight_count(), 3);
        assert!(!device.wait_for(&SyncPoint { sequence: 0 }, 1));
        assert_eq!(device.retire(2), 2);
        assert_eq!(done.load(Ordering::SeqCst), 2);
        assert!(device.wait_for(&SyncPoint { sequence: 1 }, 0));
        assert!(!device.wait_for(&SyncPoint { sequence: 2 }, 0));
        assert_eq!(device.retire_all(), 1);
        assert_eq!(device.submission_count(), 3);
    }

    #[test]
    fn destroyed_objects_are_reported() {
        let device = SoftDevice::new(Completion::Immediate);
        let gone = buffer(&device, &[0; 4]);
        device.destroy_buffer(gone);
        let done = Arc::new(AtomicUsize::new(0));
        submit(
            &device,
            0,
            &[Command::FillBuffer {
                dst: gone.into(),
                size: 4,
                value: 1,
            }],
            &done,
        );
        assert_eq!(device.dangling_references(), 1);
    }
}
