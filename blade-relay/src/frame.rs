//! Frame and command buffer completion accounting.

use crate::{sync::Watermark, Context, Device};
use std::{
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Mutex,
    },
    time::Instant,
};

/// Number of frames whose GPU timing is tracked at once.
pub const GPU_FRAME_TIMES: usize = 5;

#[derive(Clone, Copy, Debug, Default)]
struct FrameTimer {
    frame: u64,
    expected: u32,
    received: u32,
    /// The CPU side of the frame has ended.
    completed: bool,
    start: Option<Instant>,
    end: Option<Instant>,
}

impl FrameTimer {
    fn is_resolved(&self) -> bool {
        self.completed && self.expected != 0 && self.expected == self.received
    }
}

pub(crate) struct FrameAccounting {
    frame: AtomicU64,
    timers: Mutex<[FrameTimer; GPU_FRAME_TIMES]>,
    /// -1 until the first frame completes.
    last_completed_frame: AtomicI64,
    completions: Mutex<Watermark>,
    /// Sequence numbers handed to committed command buffers.
    committed: AtomicU64,
    primitives: AtomicU64,
}

impl FrameAccounting {
    pub fn new() -> Self {
        Self {
            frame: AtomicU64::new(0),
            timers: Mutex::new([FrameTimer::default(); GPU_FRAME_TIMES]),
            last_completed_frame: AtomicI64::new(-1),
            completions: Mutex::new(Watermark::new(0)),
            committed: AtomicU64::new(0),
            primitives: AtomicU64::new(0),
        }
    }

    pub fn current_frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    pub fn start_frame(&self) {
        let frame = self.current_frame();
        let mut timers = self.timers.lock().unwrap();
        timers[frame as usize % GPU_FRAME_TIMES] = FrameTimer {
            frame,
            ..FrameTimer::default()
        };
        self.primitives.store(0, Ordering::Relaxed);
    }

    pub fn end_frame(&self) {
        let frame = self.current_frame();
        {
            let mut timers = self.timers.lock().unwrap();
            let timer = &mut timers[frame as usize % GPU_FRAME_TIMES];
            if timer.frame == frame {
                timer.completed = true;
                if timer.expected == timer.received {
                    self.mark_frame_completed(frame);
                }
            }
        }
        self.frame.fetch_add(1, Ordering::AcqRel);
    }

    /// Registers a command buffer whose completion the current frame's timer
    /// waits for. Returns the frame it was registered with.
    pub fn event_expected(&self) -> u64 {
        let frame = self.current_frame();
        let mut timers = self.timers.lock().unwrap();
        let timer = &mut timers[frame as usize % GPU_FRAME_TIMES];
        if timer.frame != frame {
            *timer = FrameTimer {
                frame,
                ..FrameTimer::default()
            };
        }
        if timer.expected == 0 {
            timer.start = Some(Instant::now());
        }
        timer.expected += 1;
        frame
    }

    /// Undoes `event_expected` for a command buffer that is recycled without
    /// being submitted.
    pub fn unexpect_event(&self, frame: u64) {
        let mut timers = self.timers.lock().unwrap();
        let timer = &mut timers[frame as usize % GPU_FRAME_TIMES];
        if timer.frame == frame && timer.expected != 0 {
            timer.expected -= 1;
            if timer.completed && timer.expected == timer.received {
                self.mark_frame_completed(frame);
            }
        }
    }

    fn end_timer(&self, frame: u64) {
        let mut timers = self.timers.lock().unwrap();
        let timer = &mut timers[frame as usize % GPU_FRAME_TIMES];
        if timer.frame != frame {
            log::debug!("Completion for frame {frame} arrived after its timer was reused");
            return;
        }
        timer.received += 1;
        timer.end = Some(Instant::now());
        if timer.completed && timer.expected == timer.received {
            self.mark_frame_completed(frame);
        }
    }

    fn mark_frame_completed(&self, frame: u64) {
        self.last_completed_frame
            .fetch_max(frame as i64, Ordering::AcqRel);
    }

    /// Completion callback of a submitted command buffer.
    pub fn command_buffer_completed(&self, sequence: u64, timer_frame: Option<u64>) {
        self.completions.lock().unwrap().insert(sequence);
        if let Some(frame) = timer_frame {
            self.end_timer(frame);
        }
    }

    pub fn next_sequence(&self) -> u64 {
        self.committed.fetch_add(1, Ordering::AcqRel)
    }

    pub fn committed_count(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    pub fn last_completed_frame(&self) -> i64 {
        self.last_completed_frame.load(Ordering::Acquire)
    }

    /// Highest sequence number below which every command buffer completed,
    /// -1 if none did.
    pub fn last_completed_command_buffer(&self) -> i64 {
        self.completions
            .lock()
            .unwrap()
            .contiguous(0)
            .map_or(-1, |sequence| sequence as i64)
    }

    pub fn count_primitives(&self, count: u64) {
        self.primitives.fetch_add(count, Ordering::Relaxed);
    }

    pub fn primitives(&self) -> u64 {
        self.primitives.load(Ordering::Relaxed)
    }

    /// GPU time of the most recent fully resolved frame in milliseconds.
    pub fn gpu_time_ms(&self) -> f32 {
        let timers = self.timers.lock().unwrap();
        timers
            .iter()
            .filter(|timer| timer.is_resolved())
            .max_by_key(|timer| timer.frame)
            .and_then(|timer| Some(timer.end?.duration_since(timer.start?)))
            .map_or(0.0, |duration| duration.as_secs_f32() * 1000.0)
    }
}

impl<D: Device> Context<D> {
    pub fn start_frame(&self) {
        self.accounting.start_frame();
    }

    /// Ends the CPU side of the current frame and moves on to the next one.
    pub fn end_frame(&self) {
        let held = self.held_submission_count();
        if held != 0 {
            log::warn!(
                "Frame {} ends with {} submissions waiting for signals",
                self.current_frame(),
                held
            );
        }
        self.accounting.end_frame();
        self.stats.inc_frames();
    }

    pub fn current_frame(&self) -> u64 {
        self.accounting.current_frame()
    }

    pub fn last_completed_frame(&self) -> i64 {
        self.accounting.last_completed_frame()
    }

    pub fn last_completed_command_buffer(&self) -> i64 {
        self.accounting.last_completed_command_buffer()
    }

    pub fn committed_command_buffer_count(&self) -> u64 {
        self.accounting.committed_count()
    }

    pub fn gpu_time_ms(&self) -> f32 {
        self.accounting.gpu_time_ms()
    }

    /// Primitives drawn since the frame started.
    pub fn primitives_drawn(&self) -> u64 {
        self.accounting.primitives()
    }
}
