// Command recording
//
// CommandRecorder wraps one open command buffer on one queue. It borrows the
// backend for its whole recording lifetime, so the borrow checker rules out
// frame transitions while any recording is open.

use anyhow::Result;
use ash::vk;

use crate::backend::GfxBackend;
use crate::pipeline::{PipelineKind, PipelineLayoutHandle};
use crate::queue::{PendingBarrier, QueueRole, RecordingToken};
use crate::resources::{BufferHandle, ImageHandle};

/// Well-known image states drawing code can ask for by name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageTransition {
    ShaderRead,
    ComputeWrite,
    CopySource,
    CopyDest,
    RenderTarget,
    DepthTarget,
}

impl ImageTransition {
    fn target(self) -> (vk::PipelineStageFlags2, vk::AccessFlags2, vk::ImageLayout) {
        match self {
            ImageTransition::ShaderRead => (
                vk::PipelineStageFlags2::FRAGMENT_SHADER | vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_READ,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ),
            ImageTransition::ComputeWrite => (
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_WRITE,
                vk::ImageLayout::GENERAL,
            ),
            ImageTransition::CopySource => (
                vk::PipelineStageFlags2::COPY,
                vk::AccessFlags2::TRANSFER_READ,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            ),
            ImageTransition::CopyDest => (
                vk::PipelineStageFlags2::COPY,
                vk::AccessFlags2::TRANSFER_WRITE,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ),
            ImageTransition::RenderTarget => (
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ),
            ImageTransition::DepthTarget => (
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferTransition {
    ShaderRead,
    ComputeWrite,
    CopySource,
    CopyDest,
}

impl BufferTransition {
    fn target(self) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
        match self {
            BufferTransition::ShaderRead => (
                vk::PipelineStageFlags2::VERTEX_SHADER
                    | vk::PipelineStageFlags2::FRAGMENT_SHADER
                    | vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_READ,
            ),
            BufferTransition::ComputeWrite => (
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_WRITE,
            ),
            BufferTransition::CopySource => (
                vk::PipelineStageFlags2::COPY,
                vk::AccessFlags2::TRANSFER_READ,
            ),
            BufferTransition::CopyDest => (
                vk::PipelineStageFlags2::COPY,
                vk::AccessFlags2::TRANSFER_WRITE,
            ),
        }
    }
}

/// What a named shader binding points at for this draw/dispatch
#[derive(Debug, Clone, Copy)]
pub enum BindingResource {
    Buffer(BufferHandle),
    BufferRange {
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    },
    Image(ImageHandle),
}

#[derive(Debug, Clone, Copy)]
pub struct Binding<'a> {
    pub name: &'a str,
    pub resource: BindingResource,
}

/// One color (or depth) attachment of a dynamic render pass. An invalid image
/// handle targets the current swapchain image.
#[derive(Debug, Clone, Copy)]
pub struct RenderPassAttachment {
    pub image: ImageHandle,
    pub load: vk::AttachmentLoadOp,
    pub clear: [f32; 4],
}

impl Default for RenderPassAttachment {
    fn default() -> Self {
        Self {
            image: ImageHandle::INVALID,
            load: vk::AttachmentLoadOp::CLEAR,
            clear: [0.0; 4],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RenderPassDesc {
    pub colors: Vec<RenderPassAttachment>,
    /// Depth clear value rides in `clear[0]`
    pub depth: Option<RenderPassAttachment>,
}

/// Tracks whether a recorder reached `end()`. A recorder dropped while still
/// open leaves an un-ended buffer behind that the next submit would capture
/// half-recorded, so the drop asserts in debug builds.
struct OpenRecording {
    finished: bool,
}

impl OpenRecording {
    fn new() -> Self {
        Self { finished: false }
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}

impl Drop for OpenRecording {
    fn drop(&mut self) {
        debug_assert!(
            self.finished || std::thread::panicking(),
            "Command recorder dropped without end(); the buffer would be submitted half-recorded"
        );
    }
}

pub struct CommandRecorder<'a> {
    backend: &'a GfxBackend,
    token: RecordingToken,
    role: QueueRole,
    bind_point: vk::PipelineBindPoint,
    swapchain_pass: bool,
    open: OpenRecording,
}

impl<'a> CommandRecorder<'a> {
    pub(crate) fn new(backend: &'a GfxBackend, token: RecordingToken, role: QueueRole) -> Self {
        Self {
            backend,
            token,
            role,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            swapchain_pass: false,
            open: OpenRecording::new(),
        }
    }

    fn device(&self) -> &ash::Device {
        &self.backend.device.device
    }

    fn cmd(&self) -> vk::CommandBuffer {
        self.token.cmd
    }

    pub fn bind_pipeline(&mut self, pipeline: crate::pipeline::PipelineHandle) {
        let pipelines = self.backend.pipelines.lock();
        let entry = pipelines
            .pipelines
            .get(pipeline)
            .expect("bind_pipeline: stale pipeline handle");
        self.bind_point = match entry.kind {
            PipelineKind::Graphics => vk::PipelineBindPoint::GRAPHICS,
            PipelineKind::Compute => vk::PipelineBindPoint::COMPUTE,
        };
        unsafe {
            self.device()
                .cmd_bind_pipeline(self.cmd(), self.bind_point, entry.native)
        };
    }

    pub fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: &[BufferHandle], offsets: &[u64]) {
        let tables = self.backend.tables.lock();
        let natives: Vec<vk::Buffer> = buffers
            .iter()
            .map(|&h| {
                tables
                    .buffers
                    .get(h)
                    .expect("bind_vertex_buffers: stale buffer handle")
                    .native
            })
            .collect();
        unsafe {
            self.device()
                .cmd_bind_vertex_buffers(self.cmd(), first_binding, &natives, offsets)
        };
    }

    pub fn bind_index_buffer(&mut self, buffer: BufferHandle, offset: u64, index_type: vk::IndexType) {
        let tables = self.backend.tables.lock();
        let native = tables
            .buffers
            .get(buffer)
            .expect("bind_index_buffer: stale buffer handle")
            .native;
        unsafe {
            self.device()
                .cmd_bind_index_buffer(self.cmd(), native, offset, index_type)
        };
    }

    pub fn set_viewport(&mut self, viewport: vk::Viewport) {
        unsafe { self.device().cmd_set_viewport(self.cmd(), 0, &[viewport]) };
    }

    pub fn set_scissor(&mut self, scissor: vk::Rect2D) {
        unsafe { self.device().cmd_set_scissor(self.cmd(), 0, &[scissor]) };
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        unsafe {
            self.device()
                .cmd_draw(self.cmd(), vertex_count, instance_count, first_vertex, first_instance)
        };
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device().cmd_draw_indexed(
                self.cmd(),
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        };
    }

    pub fn dispatch(&mut self, group_x: u32, group_y: u32, group_z: u32) {
        unsafe { self.device().cmd_dispatch(self.cmd(), group_x, group_y, group_z) };
    }

    /// Push a named constant block. Name and size must match the layout.
    pub fn push_constants(&mut self, layout: PipelineLayoutHandle, name: &str, bytes: &[u8]) {
        let pipelines = self.backend.pipelines.lock();
        let entry = pipelines
            .layouts
            .get(layout)
            .expect("push_constants: stale layout handle");
        let range = entry
            .push_constants
            .iter()
            .find(|p| p.name == name)
            .unwrap_or_else(|| panic!("Layout has no push constant named '{name}'"));
        assert_eq!(
            bytes.len(),
            range.size as usize,
            "Push constant '{}' is {} bytes, got {}",
            name,
            range.size,
            bytes.len()
        );
        unsafe {
            self.device().cmd_push_constants(
                self.cmd(),
                entry.layout,
                range.stages,
                range.offset,
                bytes,
            )
        };
    }

    /// Bind named resources through push descriptors, grouped per set
    pub fn push_bindings(&mut self, layout: PipelineLayoutHandle, bindings: &[Binding<'_>]) {
        let pipelines = self.backend.pipelines.lock();
        let tables = self.backend.tables.lock();
        let entry = pipelines
            .layouts
            .get(layout)
            .expect("push_bindings: stale layout handle");

        // Pre-sized so the info pointers stay stable while writes are built
        let mut buffer_infos: Vec<vk::DescriptorBufferInfo> = Vec::with_capacity(bindings.len());
        let mut image_infos: Vec<vk::DescriptorImageInfo> = Vec::with_capacity(bindings.len());

        for set_index in 0..entry.set_layouts.len() as u32 {
            let mut writes: Vec<vk::WriteDescriptorSet> = Vec::new();
            for binding in bindings {
                let resolved = entry
                    .bindings
                    .iter()
                    .find(|r| r.name == binding.name)
                    .unwrap_or_else(|| panic!("Layout has no binding named '{}'", binding.name));
                if resolved.set_index != set_index {
                    continue;
                }

                let write = vk::WriteDescriptorSet::builder()
                    .dst_binding(resolved.slot)
                    .descriptor_type(resolved.ty);
                let write = match binding.resource {
                    BindingResource::Buffer(handle) => {
                        let buffer = tables
                            .buffers
                            .get(handle)
                            .expect("push_bindings: stale buffer handle");
                        buffer_infos.push(vk::DescriptorBufferInfo {
                            buffer: buffer.native,
                            offset: 0,
                            range: vk::WHOLE_SIZE,
                        });
                        let i = buffer_infos.len() - 1;
                        write.buffer_info(&buffer_infos[i..i + 1])
                    }
                    BindingResource::BufferRange { buffer, offset, size } => {
                        let entry = tables
                            .buffers
                            .get(buffer)
                            .expect("push_bindings: stale buffer handle");
                        buffer_infos.push(vk::DescriptorBufferInfo {
                            buffer: entry.native,
                            offset,
                            range: size,
                        });
                        let i = buffer_infos.len() - 1;
                        write.buffer_info(&buffer_infos[i..i + 1])
                    }
                    BindingResource::Image(handle) => {
                        let image = tables
                            .images
                            .get(handle)
                            .expect("push_bindings: stale image handle");
                        image_infos.push(vk::DescriptorImageInfo {
                            sampler: self.backend.default_sampler,
                            image_view: image.view,
                            image_layout: image.state.layout,
                        });
                        let i = image_infos.len() - 1;
                        write.image_info(&image_infos[i..i + 1])
                    }
                };
                writes.push(write.build());
            }

            if !writes.is_empty() {
                unsafe {
                    self.backend.device.push_descriptor.cmd_push_descriptor_set(
                        self.cmd(),
                        self.bind_point,
                        entry.layout,
                        set_index,
                        &writes,
                    )
                };
            }
        }
    }

    /// Barrier an image into a well-known state, from whatever it was last in
    pub fn transition_image(&mut self, handle: ImageHandle, to: ImageTransition) {
        let (dst_stage, dst_access, new_layout) = to.target();
        let mut tables = self.backend.tables.lock();
        let entry = tables
            .images
            .get_mut(handle)
            .expect("transition_image: stale image handle");

        let barrier = PendingBarrier::Image {
            image: entry.native,
            aspect: crate::resources::aspect_for_format(entry.desc.format),
            mip_count: entry.desc.mip_count,
            layer_count: entry.desc.layer_count,
            old_layout: entry.state.layout,
            new_layout,
            src_stage: entry.state.stage,
            src_access: entry.state.access,
            dst_stage,
            dst_access,
            src_family: vk::QUEUE_FAMILY_IGNORED,
            dst_family: vk::QUEUE_FAMILY_IGNORED,
        };
        entry.state.stage = dst_stage;
        entry.state.access = dst_access;
        entry.state.layout = new_layout;
        drop(tables);
        barrier.record(self.device(), self.cmd());
    }

    pub fn transition_buffer(&mut self, handle: BufferHandle, to: BufferTransition) {
        let (dst_stage, dst_access) = to.target();
        let mut tables = self.backend.tables.lock();
        let entry = tables
            .buffers
            .get_mut(handle)
            .expect("transition_buffer: stale buffer handle");

        let barrier = PendingBarrier::Buffer {
            buffer: entry.native,
            offset: 0,
            size: vk::WHOLE_SIZE,
            src_stage: entry.state.stage,
            src_access: entry.state.access,
            dst_stage,
            dst_access,
            src_family: vk::QUEUE_FAMILY_IGNORED,
            dst_family: vk::QUEUE_FAMILY_IGNORED,
        };
        entry.state.stage = dst_stage;
        entry.state.access = dst_access;
        drop(tables);
        barrier.record(self.device(), self.cmd());
    }

    /// Copy between buffers, then hand the destination to `consumer`. A
    /// same-family consumer gets an immediate barrier; a different family
    /// gets a two-sided ownership transfer, the acquire side replayed when
    /// the consumer queue next opens a command buffer.
    pub fn copy_buffer_to_buffer(
        &mut self,
        src: BufferHandle,
        dst: BufferHandle,
        consumer: QueueRole,
        to: BufferTransition,
    ) {
        let mut tables = self.backend.tables.lock();
        let src_entry = tables
            .buffers
            .get(src)
            .expect("copy_buffer_to_buffer: stale source handle");
        let (src_native, src_size) = (src_entry.native, src_entry.desc.size_bytes);
        let dst_entry = tables
            .buffers
            .get_mut(dst)
            .expect("copy_buffer_to_buffer: stale destination handle");

        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: src_size.min(dst_entry.desc.size_bytes),
        };
        unsafe {
            self.device()
                .cmd_copy_buffer(self.cmd(), src_native, dst_entry.native, &[region])
        };

        let (dst_stage, dst_access) = to.target();
        let dst_native = dst_entry.native;
        dst_entry.state.stage = dst_stage;
        dst_entry.state.access = dst_access;
        drop(tables);

        self.hand_off_buffer(dst_native, consumer, dst_stage, dst_access);
    }

    /// Upload a full mip chain from a source buffer, using the image's
    /// per-mip offsets, then hand the image to `consumer` as a shader input.
    pub fn copy_buffer_to_image(&mut self, src: BufferHandle, dst: ImageHandle, consumer: QueueRole) {
        let mut tables = self.backend.tables.lock();
        let src_native = tables
            .buffers
            .get(src)
            .expect("copy_buffer_to_image: stale source handle")
            .native;
        let entry = tables
            .images
            .get_mut(dst)
            .expect("copy_buffer_to_image: stale destination handle");
        let desc = entry.desc.clone();
        let dst_native = entry.native;

        // Whole image to TRANSFER_DST before any region lands
        PendingBarrier::Image {
            image: dst_native,
            aspect: vk::ImageAspectFlags::COLOR,
            mip_count: desc.mip_count,
            layer_count: desc.layer_count,
            old_layout: entry.state.layout,
            new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            src_stage: entry.state.stage,
            src_access: entry.state.access,
            dst_stage: vk::PipelineStageFlags2::COPY,
            dst_access: vk::AccessFlags2::TRANSFER_WRITE,
            src_family: vk::QUEUE_FAMILY_IGNORED,
            dst_family: vk::QUEUE_FAMILY_IGNORED,
        }
        .record(self.device(), self.cmd());

        let regions: Vec<vk::BufferImageCopy> = (0..desc.mip_count)
            .map(|mip| vk::BufferImageCopy {
                buffer_offset: desc.mip_offsets[mip as usize],
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: mip,
                    base_array_layer: 0,
                    layer_count: desc.layer_count,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width: (desc.width >> mip).max(1),
                    height: (desc.height >> mip).max(1),
                    depth: (desc.depth >> mip).max(1),
                },
            })
            .collect();
        unsafe {
            self.device().cmd_copy_buffer_to_image(
                self.cmd(),
                src_native,
                dst_native,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &regions,
            )
        };

        let (dst_stage, dst_access, new_layout) = ImageTransition::ShaderRead.target();
        entry.state.stage = dst_stage;
        entry.state.access = dst_access;
        entry.state.layout = new_layout;
        drop(tables);

        let queues = &self.backend.queues;
        let src_family = queues.queue_family(self.token.queue_index);
        let consumer_index = queues.queue_index(consumer);
        let dst_family = queues.queue_family(consumer_index);

        if src_family == dst_family {
            PendingBarrier::Image {
                image: dst_native,
                aspect: vk::ImageAspectFlags::COLOR,
                mip_count: desc.mip_count,
                layer_count: desc.layer_count,
                old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                new_layout,
                src_stage: vk::PipelineStageFlags2::COPY,
                src_access: vk::AccessFlags2::TRANSFER_WRITE,
                dst_stage,
                dst_access,
                src_family: vk::QUEUE_FAMILY_IGNORED,
                dst_family: vk::QUEUE_FAMILY_IGNORED,
            }
            .record(self.device(), self.cmd());
        } else {
            // Release here, matching acquire replayed on the consumer queue
            PendingBarrier::Image {
                image: dst_native,
                aspect: vk::ImageAspectFlags::COLOR,
                mip_count: desc.mip_count,
                layer_count: desc.layer_count,
                old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                new_layout,
                src_stage: vk::PipelineStageFlags2::COPY,
                src_access: vk::AccessFlags2::TRANSFER_WRITE,
                dst_stage: vk::PipelineStageFlags2::NONE,
                dst_access: vk::AccessFlags2::NONE,
                src_family,
                dst_family,
            }
            .record(self.device(), self.cmd());
            queues.route_barrier(
                self.token.queue_index,
                consumer_index,
                PendingBarrier::Image {
                    image: dst_native,
                    aspect: vk::ImageAspectFlags::COLOR,
                    mip_count: desc.mip_count,
                    layer_count: desc.layer_count,
                    old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    new_layout,
                    src_stage: vk::PipelineStageFlags2::NONE,
                    src_access: vk::AccessFlags2::NONE,
                    dst_stage,
                    dst_access,
                    src_family,
                    dst_family,
                },
            );
        }
    }

    fn hand_off_buffer(
        &self,
        native: vk::Buffer,
        consumer: QueueRole,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) {
        let queues = &self.backend.queues;
        let src_family = queues.queue_family(self.token.queue_index);
        let consumer_index = queues.queue_index(consumer);
        let dst_family = queues.queue_family(consumer_index);

        if src_family == dst_family {
            PendingBarrier::Buffer {
                buffer: native,
                offset: 0,
                size: vk::WHOLE_SIZE,
                src_stage: vk::PipelineStageFlags2::COPY,
                src_access: vk::AccessFlags2::TRANSFER_WRITE,
                dst_stage,
                dst_access,
                src_family: vk::QUEUE_FAMILY_IGNORED,
                dst_family: vk::QUEUE_FAMILY_IGNORED,
            }
            .record(self.device(), self.cmd());
        } else {
            PendingBarrier::Buffer {
                buffer: native,
                offset: 0,
                size: vk::WHOLE_SIZE,
                src_stage: vk::PipelineStageFlags2::COPY,
                src_access: vk::AccessFlags2::TRANSFER_WRITE,
                dst_stage: vk::PipelineStageFlags2::NONE,
                dst_access: vk::AccessFlags2::NONE,
                src_family,
                dst_family,
            }
            .record(self.device(), self.cmd());
            queues.route_barrier(
                self.token.queue_index,
                consumer_index,
                PendingBarrier::Buffer {
                    buffer: native,
                    offset: 0,
                    size: vk::WHOLE_SIZE,
                    src_stage: vk::PipelineStageFlags2::NONE,
                    src_access: vk::AccessFlags2::NONE,
                    dst_stage,
                    dst_access,
                    src_family,
                    dst_family,
                },
            );
        }
    }

    pub fn clear_image(&mut self, handle: ImageHandle, color: [f32; 4]) {
        self.transition_image(handle, ImageTransition::CopyDest);
        let tables = self.backend.tables.lock();
        let entry = tables.images.get(handle).expect("clear_image: stale image handle");
        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: entry.desc.mip_count,
            base_array_layer: 0,
            layer_count: entry.desc.layer_count,
        };
        unsafe {
            self.device().cmd_clear_color_image(
                self.cmd(),
                entry.native,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &vk::ClearColorValue { float32: color },
                &[range],
            )
        };
    }

    /// Clear the current swapchain image without starting a render pass
    pub fn clear_swapchain(&mut self, color: [f32; 4]) {
        let mut swapchain = self.backend.swapchain.lock();
        let index = swapchain.current_image() as usize;
        let image = swapchain.images[index];
        let state = swapchain.image_states[index];

        PendingBarrier::Image {
            image,
            aspect: vk::ImageAspectFlags::COLOR,
            mip_count: 1,
            layer_count: 1,
            old_layout: state.layout,
            new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            src_stage: state.stage,
            src_access: state.access,
            dst_stage: vk::PipelineStageFlags2::CLEAR,
            dst_access: vk::AccessFlags2::TRANSFER_WRITE,
            src_family: vk::QUEUE_FAMILY_IGNORED,
            dst_family: vk::QUEUE_FAMILY_IGNORED,
        }
        .record(self.device(), self.cmd());
        swapchain.image_states[index].stage = vk::PipelineStageFlags2::CLEAR;
        swapchain.image_states[index].access = vk::AccessFlags2::TRANSFER_WRITE;
        swapchain.image_states[index].layout = vk::ImageLayout::TRANSFER_DST_OPTIMAL;

        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        unsafe {
            self.device().cmd_clear_color_image(
                self.cmd(),
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &vk::ClearColorValue { float32: color },
                &[range],
            )
        };
        self.backend.mark_swapchain_touched();
    }

    /// Begin a dynamic render pass. A swapchain color target is barriered
    /// into attachment layout and marks this frame's present dependency.
    pub fn begin_render_pass(&mut self, desc: &RenderPassDesc) {
        let tables = self.backend.tables.lock();
        let mut swapchain = self.backend.swapchain.lock();
        let mut extent = vk::Extent2D::default();
        let mut color_infos: Vec<vk::RenderingAttachmentInfo> = Vec::with_capacity(desc.colors.len());

        for attachment in &desc.colors {
            let view = if attachment.image.is_valid() {
                let entry = tables
                    .images
                    .get(attachment.image)
                    .expect("begin_render_pass: stale image handle");
                assert_eq!(
                    entry.state.layout,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    "Render target must be transitioned to RenderTarget before the pass"
                );
                extent = vk::Extent2D {
                    width: entry.desc.width,
                    height: entry.desc.height,
                };
                entry.view
            } else {
                let index = swapchain.current_image() as usize;
                let state = swapchain.image_states[index];
                PendingBarrier::Image {
                    image: swapchain.images[index],
                    aspect: vk::ImageAspectFlags::COLOR,
                    mip_count: 1,
                    layer_count: 1,
                    old_layout: state.layout,
                    new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    src_stage: state.stage,
                    src_access: state.access,
                    dst_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                    dst_access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                    src_family: vk::QUEUE_FAMILY_IGNORED,
                    dst_family: vk::QUEUE_FAMILY_IGNORED,
                }
                .record(self.device(), self.cmd());
                swapchain.image_states[index].stage = vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT;
                swapchain.image_states[index].access = vk::AccessFlags2::COLOR_ATTACHMENT_WRITE;
                swapchain.image_states[index].layout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;

                extent = swapchain.extent;
                self.swapchain_pass = true;
                self.backend.mark_swapchain_touched();
                swapchain.image_views[index]
            };

            color_infos.push(
                vk::RenderingAttachmentInfo::builder()
                    .image_view(view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(attachment.load)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(vk::ClearValue {
                        color: vk::ClearColorValue {
                            float32: attachment.clear,
                        },
                    })
                    .build(),
            );
        }

        let depth_info = desc.depth.as_ref().map(|attachment| {
            let entry = tables
                .images
                .get(attachment.image)
                .expect("begin_render_pass: stale depth image handle");
            assert_eq!(
                entry.state.layout,
                vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
                "Depth target must be transitioned to DepthTarget before the pass"
            );
            vk::RenderingAttachmentInfo::builder()
                .image_view(entry.view)
                .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                .load_op(attachment.load)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: attachment.clear[0],
                        stencil: 0,
                    },
                })
                .build()
        });

        let mut rendering_info = vk::RenderingInfo::builder()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            })
            .layer_count(1)
            .color_attachments(&color_infos);
        if let Some(depth) = &depth_info {
            rendering_info = rendering_info.depth_attachment(depth);
        }

        unsafe { self.device().cmd_begin_rendering(self.cmd(), &rendering_info) };
    }

    /// End the pass; a swapchain pass also barriers the image to present
    pub fn end_render_pass(&mut self) {
        unsafe { self.device().cmd_end_rendering(self.cmd()) };

        if self.swapchain_pass {
            let mut swapchain = self.backend.swapchain.lock();
            let index = swapchain.current_image() as usize;
            let state = swapchain.image_states[index];
            PendingBarrier::Image {
                image: swapchain.images[index],
                aspect: vk::ImageAspectFlags::COLOR,
                mip_count: 1,
                layer_count: 1,
                old_layout: state.layout,
                new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                src_stage: state.stage,
                src_access: state.access,
                dst_stage: vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
                dst_access: vk::AccessFlags2::NONE,
                src_family: vk::QUEUE_FAMILY_IGNORED,
                dst_family: vk::QUEUE_FAMILY_IGNORED,
            }
            .record(self.device(), self.cmd());
            swapchain.image_states[index].stage = vk::PipelineStageFlags2::BOTTOM_OF_PIPE;
            swapchain.image_states[index].access = vk::AccessFlags2::NONE;
            swapchain.image_states[index].layout = vk::ImageLayout::PRESENT_SRC_KHR;
            self.swapchain_pass = false;
        }
    }

    /// Finish recording; the buffer waits for the queue's next submit
    pub fn end(mut self) -> Result<()> {
        self.open.finish();
        self.backend.queues.end_command_buffer(self.token)
    }

    pub fn role(&self) -> QueueRole {
        self.role
    }
}

#[cfg(test)]
mod tests {
    use super::OpenRecording;

    #[test]
    #[should_panic(expected = "dropped without end()")]
    fn dropping_an_open_recording_is_a_contract_violation() {
        let guard = OpenRecording::new();
        drop(guard);
    }

    #[test]
    fn a_finished_recording_drops_quietly() {
        let mut guard = OpenRecording::new();
        guard.finish();
        drop(guard);
    }
}
