//! Command encoding and resource lifecycle orchestration for Blade.
//!
//! The crate sits between a renderer and a GPU device. It multiplexes recorded
//! work onto a few logical queues, memoizes pipeline objects by structural
//! keys, pools transient buffers behind an age-based safety window and orders
//! dependent work across queues with a monotonic event counter.
//!
//! A [`Context`] is shared between threads. Every recording thread owns a
//! [`RecordingState`] and passes it by `&mut` into the context operations.
//!
//! Backends are selected at compile time: [`soft`] is always available and
//! replays command lists into host memory, `webgpu` is built with
//! `--cfg blade_wgpu`.

#![allow(
    // We don't use syntax sugar where it's not necessary.
    clippy::match_like_matches_macro,
    // Redundant matching is more explicit.
    clippy::redundant_pattern_matching,
    // Some functions have many arguments, it's fine.
    clippy::too_many_arguments,
    // Explicit lifetimes are often easier to reason about.
    clippy::needless_lifetimes,
    // No need for defaults in the internal types.
    clippy::new_without_default,
)]
#![warn(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications,
)]

mod binding;
mod command;
mod context;
mod encoder;
mod error;
mod flush;
mod frame;
mod gs;
mod index;
mod pipeline;
mod pool;
mod queue;
mod state;
mod stats;
mod sync;
mod triple;

pub mod soft;
pub mod traits;
#[cfg(blade_wgpu)]
pub mod webgpu;

pub use binding::{BindingKind, BindingLocation, BindingTable, ReflectionError, UniformBlock};
pub use command::{
    Command, CommandBuffer, ComputeCommandEncoder, PassEncoder, RenderCommandEncoder,
    TransferCommandEncoder,
};
pub use context::Context;
pub use encoder::Encoder;
pub use error::{ContractViolation, PipelineError};
pub use frame::GPU_FRAME_TIMES;
pub use gs::GsPart;
pub use index::{point_indices, remap_quads, triangle_list_indices};
pub use pipeline::{ComputeKey, DepthKey, RenderKey};
pub use pool::{PooledBuffer, ReclaimReport};
pub use queue::{EncoderState, LogicalQueue, QueueId};
pub use state::{RecordingState, StateDelta};
pub use stats::StatsSnapshot;
pub use sync::END_OF_QUEUE_EVENT_VALUE;
pub use traits::{CommandDevice, Device, ResourceDevice, ShaderDevice};
pub use triple::{TripleBuffer, TRIPLE_BUFFER_SLOTS};

//=============================================================================
// Tunables
//=============================================================================

/// Minimum number of completed command buffers before a released buffer
/// may be handed out again.
pub const SAFE_BUFFER_REUSE_AGE: u64 = 1;
/// Pooled buffers untouched for this many frames are destroyed.
pub const MAX_BUFFER_AGE_IN_FRAMES: u64 = 3;
/// Pooled buffers untouched for this many command buffers are destroyed.
pub const MAX_BUFFER_AGE_IN_COMMAND_BUFFERS: u64 = 20;
#[cfg(target_os = "ios")]
pub const HIGH_MEMORY_THRESHOLD: u64 = 1 << 30;
#[cfg(not(target_os = "ios"))]
pub const HIGH_MEMORY_THRESHOLD: u64 = 2 << 30;
pub const COMMAND_BUFFER_POOL_SIZE: usize = 256;
#[cfg(target_os = "ios")]
pub const GS_MAX_CONCURRENT_BATCHES: u32 = 2;
#[cfg(not(target_os = "ios"))]
pub const GS_MAX_CONCURRENT_BATCHES: u32 = 4;
pub const GS_MAX_DATA_PER_BATCH: u32 = 32 << 20;

//=============================================================================
// Slotmap Key Types
//=============================================================================

slotmap::new_key_type! {
    /// Key for buffer resources
    pub struct BufferKey;
    /// Key for texture resources
    pub struct TextureKey;
    /// Key for sampler resources
    pub struct SamplerKey;
    /// Key for shader functions
    pub struct FunctionKey;
    /// Key for render pipelines
    pub struct RenderPipelineKey;
    /// Key for depth-stencil states
    pub struct DepthStencilKey;
    /// Key for compute pipelines
    pub struct ComputePipelineKey;
    /// Key for device command buffers
    pub struct CommandBufferKey;
}

//=============================================================================
// Device
//=============================================================================

/// Stable identity of a device, used as part of every pipeline key.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeviceId(pub u64);

impl DeviceId {
    /// A process-wide unique identity for a new device.
    pub(crate) fn next() -> Self {
        static NEXT: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);
        Self(NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceInformation {
    pub id: DeviceId,
    /// The name of the device
    pub device_name: String,
    /// The driver used to talk to the device
    pub driver_name: String,
    /// Whether the device is emulated on the CPU
    pub is_software_emulated: bool,
}

#[derive(Clone, Debug)]
pub struct ContextDesc {
    /// Ask the device for validation of every object it creates.
    pub validation: bool,
    /// Frame capture mode: every command buffer gets a fresh device object
    /// that is destroyed instead of recycled.
    pub capture: bool,
    /// Index of the adapter to pick, 0 for the default one.
    pub device_id: u32,
    pub safe_buffer_reuse_age: u64,
    pub max_buffer_age_in_frames: u64,
    pub max_buffer_age_in_command_buffers: u64,
    /// Pooled bytes above which reclamation destroys further entries.
    pub high_memory_threshold: u64,
    /// Capacity of the recycled command buffer list.
    pub command_buffer_pool_size: usize,
    pub gs_max_concurrent_batches: u32,
    pub gs_max_data_per_batch: u32,
    /// Log averaged resource statistics at teardown.
    pub enable_stats: bool,
}

impl Default for ContextDesc {
    fn default() -> Self {
        Self {
            validation: false,
            capture: false,
            device_id: 0,
            safe_buffer_reuse_age: SAFE_BUFFER_REUSE_AGE,
            max_buffer_age_in_frames: MAX_BUFFER_AGE_IN_FRAMES,
            max_buffer_age_in_command_buffers: MAX_BUFFER_AGE_IN_COMMAND_BUFFERS,
            high_memory_threshold: HIGH_MEMORY_THRESHOLD,
            command_buffer_pool_size: COMMAND_BUFFER_POOL_SIZE,
            gs_max_concurrent_batches: GS_MAX_CONCURRENT_BATCHES,
            gs_max_data_per_batch: GS_MAX_DATA_PER_BATCH,
            enable_stats: false,
        }
    }
}

/// Marks a submitted command buffer. Completion can be awaited through
/// [`Context::wait_for`].
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct SyncPoint {
    pub(crate) sequence: u64,
}

impl SyncPoint {
    /// Global command buffer sequence number, starting at 0.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

//=============================================================================
// Buffers
//=============================================================================

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum StorageMode {
    /// CPU and GPU see the same memory.
    #[default]
    Shared,
    /// CPU copy mirrored to the GPU, modified ranges need flushing.
    Managed,
    /// GPU only.
    Private,
    /// Transient tile memory, never backed.
    Memoryless,
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum CacheMode {
    #[default]
    DefaultCache,
    WriteCombined,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferDesc<'a> {
    pub name: &'a str,
    pub size: u64,
    pub storage: StorageMode,
    pub cache: CacheMode,
}

/// Handle to a device buffer.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct Buffer {
    pub(crate) raw: BufferKey,
    pub(crate) size: u64,
    pub(crate) storage: StorageMode,
}

impl Buffer {
    pub fn size(&self) -> u64 {
        self.size
    }
    pub fn storage(&self) -> StorageMode {
        self.storage
    }
    pub fn at(self, offset: u64) -> BufferPiece {
        BufferPiece {
            buffer: self,
            offset,
        }
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct BufferPiece {
    pub buffer: Buffer,
    pub offset: u64,
}

impl From<Buffer> for BufferPiece {
    fn from(buffer: Buffer) -> Self {
        Self { buffer, offset: 0 }
    }
}

//=============================================================================
// Textures and Samplers
//=============================================================================

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum TextureFormat {
    R8Unorm,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Rgba16Float,
    R32Float,
    Rgba32Float,
    Depth32Float,
    Depth32FloatStencil8Uint,
}

impl TextureFormat {
    /// Size of a single texel in bytes.
    pub fn block_size(&self) -> u32 {
        match *self {
            Self::R8Unorm => 1,
            Self::Rgba8Unorm
            | Self::Rgba8UnormSrgb
            | Self::Bgra8Unorm
            | Self::Bgra8UnormSrgb
            | Self::R32Float
            | Self::Depth32Float => 4,
            Self::Rgba16Float | Self::Depth32FloatStencil8Uint => 8,
            Self::Rgba32Float => 16,
        }
    }

    pub fn is_depth(&self) -> bool {
        match *self {
            Self::Depth32Float | Self::Depth32FloatStencil8Uint => true,
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum TextureDimension {
    #[default]
    D2,
    D2Array,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Default for Extent {
    fn default() -> Self {
        Self {
            width: 1,
            height: 1,
        }
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
    pub struct TextureUsage: u32 {
        const COPY = 1 << 0;
        const RESOURCE = 1 << 1;
        const TARGET = 1 << 2;
        const STORAGE = 1 << 3;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureDesc<'a> {
    pub name: &'a str,
    pub format: TextureFormat,
    pub size: Extent,
    pub array_layer_count: u32,
    pub dimension: TextureDimension,
    pub usage: TextureUsage,
}

/// Handle to a device texture.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct Texture {
    pub(crate) raw: TextureKey,
    pub(crate) format: TextureFormat,
    pub(crate) dimension: TextureDimension,
    pub(crate) size: Extent,
}

impl Texture {
    pub fn format(&self) -> TextureFormat {
        self.format
    }
    pub fn dimension(&self) -> TextureDimension {
        self.dimension
    }
    pub fn size(&self) -> Extent {
        self.size
    }
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum AddressMode {
    #[default]
    ClampToEdge,
    Repeat,
    MirrorRepeat,
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum FilterMode {
    #[default]
    Nearest,
    Linear,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SamplerDesc<'a> {
    pub name: &'a str,
    pub address_modes: [AddressMode; 3],
    pub mag_filter: FilterMode,
    pub min_filter: FilterMode,
    pub mipmap_filter: FilterMode,
    pub compare: Option<CompareFunction>,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct Sampler {
    pub(crate) raw: SamplerKey,
}

//=============================================================================
// Shaders and Pipelines
//=============================================================================

#[derive(
    Clone,
    Copy,
    Debug,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    strum::EnumIter,
    strum::EnumCount,
    strum::Display,
)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FunctionDesc<'a> {
    /// Entry point name, also used as the debug label.
    pub name: &'a str,
    pub stage: ShaderStage,
    /// WGSL source. Backends that do not compile shaders ignore it.
    pub source: &'a str,
}

/// Handle to a compiled shader entry point.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Function {
    pub(crate) raw: FunctionKey,
    pub(crate) stage: ShaderStage,
}

impl Function {
    pub fn stage(&self) -> ShaderStage {
        self.stage
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct RenderPipeline {
    pub(crate) raw: RenderPipelineKey,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct DepthStencilState {
    pub(crate) raw: DepthStencilKey,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct ComputePipeline {
    pub(crate) raw: ComputePipelineKey,
    pub(crate) thread_execution_width: u32,
    pub(crate) max_total_threads_per_threadgroup: u32,
}

impl ComputePipeline {
    pub fn thread_execution_width(&self) -> u32 {
        self.thread_execution_width
    }
    pub fn max_total_threads_per_threadgroup(&self) -> u32 {
        self.max_total_threads_per_threadgroup
    }
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum CompareFunction {
    Never,
    Less,
    Equal,
    #[default]
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    Src,
    OneMinusSrc,
    SrcAlpha,
    OneMinusSrcAlpha,
    Dst,
    OneMinusDst,
    DstAlpha,
    OneMinusDstAlpha,
    SrcAlphaSaturated,
    Constant,
    OneMinusConstant,
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum BlendOperation {
    #[default]
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct BlendComponent {
    pub src_factor: BlendFactor,
    pub dst_factor: BlendFactor,
    pub operation: BlendOperation,
}

impl BlendComponent {
    pub const REPLACE: Self = Self {
        src_factor: BlendFactor::One,
        dst_factor: BlendFactor::Zero,
        operation: BlendOperation::Add,
    };
    pub const OVER: Self = Self {
        src_factor: BlendFactor::One,
        dst_factor: BlendFactor::OneMinusSrcAlpha,
        operation: BlendOperation::Add,
    };
}

/// Blending of the color attachments. `None` in the render state means
/// blending is disabled.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct BlendState {
    pub color: BlendComponent,
    pub alpha: BlendComponent,
}

impl BlendState {
    pub const ALPHA_BLENDING: Self = Self {
        color: BlendComponent {
            src_factor: BlendFactor::SrcAlpha,
            dst_factor: BlendFactor::OneMinusSrcAlpha,
            operation: BlendOperation::Add,
        },
        alpha: BlendComponent::OVER,
    };
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
    pub struct ColorWrites: u32 {
        const RED = 1 << 0;
        const GREEN = 1 << 1;
        const BLUE = 1 << 2;
        const ALPHA = 1 << 3;
        const COLOR = Self::RED.bits() | Self::GREEN.bits() | Self::BLUE.bits();
        const ALL = Self::RED.bits() | Self::GREEN.bits() | Self::BLUE.bits() | Self::ALPHA.bits();
    }
}

impl Default for ColorWrites {
    fn default() -> Self {
        Self::ALL
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct DepthState {
    pub write_enabled: bool,
    pub compare: CompareFunction,
}

impl Default for DepthState {
    fn default() -> Self {
        Self {
            write_enabled: true,
            compare: CompareFunction::LessEqual,
        }
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct MultisampleState {
    pub sample_count: u32,
    pub alpha_to_coverage: bool,
    pub alpha_to_one: bool,
}

impl Default for MultisampleState {
    fn default() -> Self {
        Self {
            sample_count: 1,
            alpha_to_coverage: false,
            alpha_to_one: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum FrontFace {
    #[default]
    Ccw,
    Cw,
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum FillMode {
    #[default]
    Fill,
    Lines,
}

//=============================================================================
// Vertex Input
//=============================================================================

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum VertexFormat {
    F32,
    F32Vec2,
    F32Vec3,
    F32Vec4,
    U32,
    U32Vec2,
    U32Vec3,
    U32Vec4,
    I32,
    I32Vec2,
    I32Vec3,
    I32Vec4,
    Unorm8x4,
}

impl VertexFormat {
    pub fn size(&self) -> u32 {
        match *self {
            Self::F32 | Self::U32 | Self::I32 | Self::Unorm8x4 => 4,
            Self::F32Vec2 | Self::U32Vec2 | Self::I32Vec2 => 8,
            Self::F32Vec3 | Self::U32Vec3 | Self::I32Vec3 => 12,
            Self::F32Vec4 | Self::U32Vec4 | Self::I32Vec4 => 16,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum VertexStep {
    Constant,
    #[default]
    PerVertex,
    PerInstance,
}

/// One attribute fetched from its own vertex buffer slot.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct VertexElement {
    pub format: VertexFormat,
    pub offset: u32,
    pub stride: u32,
    pub step: VertexStep,
}

/// Vertex fetch description keyed by attribute location. The buffer slot of
/// an attribute equals its location.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq)]
pub struct VertexLayout {
    pub elements: std::collections::BTreeMap<u32, VertexElement>,
}

impl VertexLayout {
    pub fn set(&mut self, location: u32, element: VertexElement) {
        self.elements.insert(location, element);
    }
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
    pub fn clear(&mut self) {
        self.elements.clear();
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum PrimitiveType {
    Point,
    Line,
    LineStrip,
    Triangle,
    TriangleStrip,
}

impl PrimitiveType {
    /// Number of primitives produced by `vertex_count` vertices.
    pub fn primitive_count(&self, vertex_count: u32) -> u32 {
        match *self {
            Self::Point => vertex_count,
            Self::Line => vertex_count / 2,
            Self::LineStrip => vertex_count.saturating_sub(1),
            Self::Triangle => vertex_count / 3,
            Self::TriangleStrip => vertex_count.saturating_sub(2),
        }
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum IndexType {
    U16,
    U32,
}

impl IndexType {
    pub fn size(&self) -> u64 {
        match *self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}

//=============================================================================
// Pipeline Descriptors
//=============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct RenderPipelineDesc<'a> {
    pub name: &'a str,
    pub vertex: Function,
    pub fragment: Option<Function>,
    /// `None` when the vertex stage assembles its own inputs.
    pub vertex_layout: Option<&'a VertexLayout>,
    pub color_formats: &'a [TextureFormat],
    pub depth_format: Option<TextureFormat>,
    pub blend: Option<BlendState>,
    pub write_mask: ColorWrites,
    pub multisample: MultisampleState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DepthStencilDesc<'a> {
    pub name: &'a str,
    pub depth: DepthState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ComputePipelineDesc<'a> {
    pub name: &'a str,
    pub function: Function,
    pub buffer_count: u32,
    pub texture_count: u32,
    /// Buffer slots the pipeline promises not to modify.
    pub immutable_buffer_mask: u64,
}

//=============================================================================
// Render Passes
//=============================================================================

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LoadOp {
    Load,
    Clear([f32; 4]),
    DontCare,
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum StoreOp {
    #[default]
    Store,
    Discard,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderTarget {
    pub texture: Texture,
    pub load: LoadOp,
    pub store: StoreOp,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RenderPassDesc {
    pub color_targets: Vec<RenderTarget>,
    pub depth_target: Option<RenderTarget>,
}

impl RenderPassDesc {
    /// Size of the first attachment, or a single pixel for an empty pass.
    pub fn extent(&self) -> Extent {
        self.color_targets
            .first()
            .or(self.depth_target.as_ref())
            .map_or(Extent::default(), |rt| rt.texture.size)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub near: f32,
    pub far: f32,
}

//=============================================================================
// Encoders
//=============================================================================

#[derive(
    Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, strum::EnumIter, strum::EnumCount,
)]
pub enum EncoderKind {
    Render,
    Compute,
    Copy,
}

impl EncoderKind {
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// A finished command buffer handed to the device.
pub struct Submission<'a> {
    pub queue: QueueId,
    pub sequence: u64,
    pub label: &'a str,
    pub commands: &'a [Command],
    pub plain_data: &'a [u8],
}
