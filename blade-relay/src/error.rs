//! Error types.

use crate::{EncoderKind, QueueId, ShaderStage};
use std::fmt;

/// Misuse of the recording API. Every variant is a programming error on the
/// caller side; nothing was submitted to the device when one is returned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContractViolation {
    /// An encoder was requested or the command buffer touched while the
    /// queue's encoder is still in use.
    EncoderInUse { queue: QueueId },
    /// An encoder was released while none was in use.
    NoEncoderInUse { queue: QueueId },
    /// The open encoder is not of the kind the operation needs.
    WrongEncoder {
        queue: QueueId,
        expected: EncoderKind,
        found: Option<EncoderKind>,
    },
    /// The queue has no command buffer to record into.
    MissingCommandBuffer { queue: QueueId },
    /// A render encoder was requested without a render pass description.
    MissingRenderPass { queue: QueueId },
    /// The render pass was changed while an encoder is in use.
    RenderPassWhileEncoding { queue: QueueId },
    /// A wait was encoded for an event that no signal will ever produce.
    DanglingWait { highest_expected: u64, next_signal: u64 },
    /// A buffer was released that the pool did not hand out.
    BufferNotOutstanding,
    /// Buffers were still acquired when the pool was torn down.
    BuffersOutstanding { count: usize },
    /// `commit` was asked to wait until scheduled, but the submission would
    /// be held back behind an unsubmitted signal or an earlier held
    /// submission of the same queue.
    WaitOnHeldSubmission { queue: QueueId },
    /// A binding name has no location in the current program.
    UnresolvedBinding { name: String, stage: ShaderStage },
    /// A compute-stage buffer was bound without a ComputeGS program.
    ComputeBindingWithoutGs { slot: u32 },
    /// `commit_state` was called before any shading program was set.
    NoShadingProgram,
    /// The operation only supports 32-bit indices.
    UnsupportedIndexType,
    /// Indexed work was requested without an index buffer.
    MissingIndexBuffer,
    /// ComputeGS work was requested without a ComputeGS program.
    ComputeGsDisabled,
    /// A ComputeGS program needs manual vertex assembly in the vertex stage.
    GsWithoutManualVertexAssembly,
    /// A single ComputeGS part does not fit into one batch buffer.
    GsPartTooLarge { size: u32, max: u32 },
}

impl fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::EncoderInUse { queue } => write!(f, "encoder of queue {queue} is in use"),
            Self::NoEncoderInUse { queue } => write!(f, "no encoder of queue {queue} is in use"),
            Self::WrongEncoder {
                queue,
                expected,
                found,
            } => write!(
                f,
                "queue {queue} needs an open {expected:?} encoder, found {found:?}"
            ),
            Self::MissingCommandBuffer { queue } => {
                write!(f, "queue {queue} has no command buffer")
            }
            Self::MissingRenderPass { queue } => {
                write!(f, "render encoder on queue {queue} requires a render pass")
            }
            Self::RenderPassWhileEncoding { queue } => write!(
                f,
                "render pass changed while an encoder of queue {queue} is in use"
            ),
            Self::DanglingWait {
                highest_expected,
                next_signal,
            } => write!(
                f,
                "waiting on event {highest_expected} but the next signal is {next_signal}"
            ),
            Self::BufferNotOutstanding => write!(f, "buffer was not acquired from the pool"),
            Self::BuffersOutstanding { count } => {
                write!(f, "{count} buffers are still acquired at teardown")
            }
            Self::WaitOnHeldSubmission { queue } => write!(
                f,
                "commit of queue {queue} cannot wait until scheduled while it is held"
            ),
            Self::UnresolvedBinding { ref name, stage } => {
                write!(f, "binding '{name}' has no {stage} location")
            }
            Self::ComputeBindingWithoutGs { slot } => write!(
                f,
                "compute buffer at slot {slot} is bound without a ComputeGS program"
            ),
            Self::NoShadingProgram => write!(f, "no shading program is set"),
            Self::UnsupportedIndexType => write!(f, "only 32-bit indices are supported"),
            Self::MissingIndexBuffer => write!(f, "no index buffer is bound"),
            Self::ComputeGsDisabled => write!(f, "no ComputeGS program is set"),
            Self::GsWithoutManualVertexAssembly => {
                write!(f, "ComputeGS requires manual vertex assembly")
            }
            Self::GsPartTooLarge { size, max } => write!(
                f,
                "ComputeGS part of {size} bytes exceeds the batch size of {max} bytes"
            ),
        }
    }
}

impl std::error::Error for ContractViolation {}

/// Failure reported by the device while building a pipeline object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineError {
    pub name: String,
    pub message: String,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipeline '{}': {}", self.name, self.message)
    }
}

impl std::error::Error for PipelineError {}
