// Vulkan execution and resource-management backend
//
// Owns all interaction with the GPU: hardware queues, device memory arenas,
// resource tables, deferred destruction and the submission pipeline. Clients
// (asset decoding, UI, debug draw, renderers) only see the GfxBackend facade
// and the CommandRecorder.

pub mod backend;
pub mod command;
pub mod config;
pub mod device;
pub mod handle;
pub mod mem;
pub mod pipeline;
pub mod queue;
pub mod resources;
pub mod swapchain;

pub use backend::GfxBackend;
pub use command::{
    Binding, BindingResource, BufferTransition, CommandRecorder, ImageTransition,
    RenderPassAttachment, RenderPassDesc,
};
pub use config::GfxSettings;
pub use handle::Handle;
pub use mem::MemoryArena;
pub use pipeline::{
    BindingDesc, GraphicsPipelineDesc, PipelineHandle, PipelineLayoutDesc, PipelineLayoutHandle,
    PushConstantDesc, ShaderParam, ShaderReflection, ShaderStageBlob,
};
pub use queue::QueueRole;
pub use resources::{BufferDesc, BufferHandle, ImageDesc, ImageHandle, MAX_MIPS_PER_IMAGE};

/// Number of frames the CPU may record ahead of the GPU.
pub const FRAMES_IN_FLIGHT: usize = 2;

/// Upper bound on deferred native destructions per frame, unless a forced
/// drain is requested at shutdown.
pub(crate) const MAX_GARBAGE_COLLECT_PER_FRAME: usize = 32;

/// Descriptor sets a single pipeline layout may span.
pub(crate) const MAX_SETS_PER_PIPELINE: usize = 4;
