// Backend facade - frame orchestration and the public surface
//
// One constructed context object owns the device, the memory arenas, the
// queue manager, the swapchain and every resource table. Begin/end frame,
// Create*/Destroy* and command recording all go through here, and only from
// the thread that called initialize.

use anyhow::{bail, ensure, Context, Result};
use ash::vk;
use ash::Entry;
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use crate::command::CommandRecorder;
use crate::config::GfxSettings;
use crate::device::{self, DeviceContext};
use crate::mem::{DeviceMemoryManager, MemoryArena};
use crate::pipeline::{
    GraphicsPipelineDesc, PipelineCache, PipelineHandle, PipelineLayoutDesc, PipelineLayoutHandle,
    ShaderReflection,
};
use crate::queue::{self, QueueManager, QueueRole, SwapchainSync};
use crate::resources::{
    BufferDesc, BufferHandle, GarbageHandle, GarbageList, ImageDesc, ImageHandle, ResourceTables,
};
use crate::swapchain::Swapchain;

/// How long end-of-frame waits for recorded work to reach the submission
/// thread before calling it a programmer error
const FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

pub struct GfxBackend {
    pub(crate) device: Arc<DeviceContext>,
    pub(crate) mem: DeviceMemoryManager,
    pub(crate) queues: QueueManager,
    pub(crate) swapchain: Mutex<Swapchain>,
    pub(crate) tables: Mutex<ResourceTables>,
    pub(crate) pipelines: Mutex<PipelineCache>,
    pub(crate) garbage: GarbageList,
    pub(crate) default_sampler: vk::Sampler,
    swapchain_touched: AtomicBool,
    frame_index: u64,
    frame_open: bool,
    image_acquired: bool,
    main_thread: ThreadId,
    released: bool,
}

impl GfxBackend {
    /// Bring up the whole backend: instance, device, arenas, queues and
    /// swapchain. Any failure here is fatal to startup.
    pub fn initialize(
        settings: GfxSettings,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let entry = unsafe { Entry::load() }.context("Failed to load Vulkan library")?;
        let instance = device::create_instance(&entry, &settings, display_handle)?;
        let debug_utils = if settings.debug.validation_layers {
            Some(device::create_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let surface = unsafe {
            ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
        }
        .context("Failed to create window surface")?;
        let surface_loader = ash::extensions::khr::Surface::new(&entry, &instance);

        let gpu = device::pick_physical_device(&instance, &settings.graphics.preferred_gpu)?;

        let mut present_support = Vec::with_capacity(gpu.queue_families.len());
        for family in 0..gpu.queue_families.len() as u32 {
            let supported = unsafe {
                surface_loader.get_physical_device_surface_support(gpu.handle, family, surface)
            }
            .unwrap_or(false);
            present_support.push(supported);
        }

        let caps = queue::family_caps(&gpu.queue_families, &present_support);
        let plans = queue::plan_queues(&caps)?;

        let logical = device::create_logical_device(&instance, &gpu, &plans)?;
        let ctx = Arc::new(device::make_context(entry, instance, debug_utils, gpu, logical));

        let mem = DeviceMemoryManager::new(&ctx, &settings.memory)?;
        let queues = QueueManager::new(&ctx, &plans)?;
        let swapchain = Swapchain::new(
            Arc::clone(&ctx),
            surface,
            surface_loader,
            width,
            height,
            settings.graphics.vsync,
        )?;

        let anisotropy = ctx.gpu.props.limits.max_sampler_anisotropy.min(8.0);
        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(true)
            .max_anisotropy(anisotropy)
            .max_lod(vk::LOD_CLAMP_NONE);
        let default_sampler = unsafe { ctx.device.create_sampler(&sampler_info, None) }
            .context("Failed to create default sampler")?;

        log::info!("Graphics backend up on {}", ctx.gpu.name());

        Ok(Self {
            device: ctx,
            mem,
            queues,
            swapchain: Mutex::new(swapchain),
            tables: Mutex::new(ResourceTables::new()),
            pipelines: Mutex::new(PipelineCache::new()),
            garbage: GarbageList::new(),
            default_sampler,
            swapchain_touched: AtomicBool::new(false),
            frame_index: 0,
            frame_open: false,
            image_acquired: false,
            main_thread: std::thread::current().id(),
            released: false,
        })
    }

    fn assert_main_thread(&self) {
        assert_owning_thread(self.main_thread);
    }

    /// Open the next frame slot and acquire a swapchain image. Returns whether
    /// an image was acquired: `false` means the surface is out of date, the
    /// frame still runs but all swapchain-targeting work must be skipped, and
    /// the recreate resolves it at the next frame boundary.
    pub fn begin_frame(&mut self) -> Result<bool> {
        self.assert_main_thread();
        assert!(!self.frame_open, "begin_frame called twice without end_frame");
        if self.queues.fatal() {
            bail!("A previous submission failed; backend is unusable");
        }

        let mut swapchain = self.swapchain.lock();
        if swapchain.resize_pending() {
            self.device.wait_idle();
            swapchain.recreate()?;
        }
        drop(swapchain);

        // A touched flag surviving the frame boundary belongs to a frame
        // whose acquire failed; it must not wire next frame's semaphores
        self.swapchain_touched.store(false, Ordering::Relaxed);

        let slot = self.queues.begin_frame(&self.mem)?;
        self.image_acquired = self.swapchain.lock().acquire(slot)?.is_some();
        self.frame_open = true;
        Ok(self.image_acquired)
    }

    /// Flush, present and run a garbage-collection step
    pub fn end_frame(&mut self) -> Result<()> {
        self.assert_main_thread();
        assert!(self.frame_open, "end_frame without begin_frame");

        // Everything recorded this frame must have reached the submission
        // thread, otherwise the present would race unflushed work
        assert!(
            self.queues.gate.wait_baseline(FLUSH_TIMEOUT),
            "Command buffers were recorded this frame but never submitted"
        );

        if self.image_acquired && self.swapchain_touched.swap(false, Ordering::Relaxed) {
            // Present semaphores were wired by the presenting submission; the
            // gate drain above guarantees no submit is in flight on the queue
            let queue = self.queues.queue_handle(QueueRole::PRESENT);
            self.swapchain.lock().present(queue)?;
        }

        self.frame_index += 1;
        self.frame_open = false;
        self.image_acquired = false;

        self.garbage.collect(&self.device.device, self.frame_index, false);

        if self.queues.fatal() {
            bail!("Submission failed during this frame; backend is unusable");
        }
        Ok(())
    }

    /// Record the new framebuffer size from the platform layer
    pub fn request_resize(&self, width: u32, height: u32) {
        self.swapchain.lock().request_resize(width, height);
    }

    /// Open a command buffer on the queue serving `role`
    pub fn begin_command_buffer(&self, role: QueueRole) -> Result<CommandRecorder<'_>> {
        self.assert_main_thread();
        assert!(self.frame_open, "Recording is only allowed inside a frame");
        let token = self.queues.begin_command_buffer(role)?;
        Ok(CommandRecorder::new(self, token, role))
    }

    /// Submit everything recorded on `role`'s queue since its last submit.
    /// `dependents` name the roles that must wait on this work.
    pub fn submit_queue(&self, role: QueueRole, dependents: QueueRole) -> Result<()> {
        self.assert_main_thread();
        let presents_here =
            self.queues.queue_index(role) == self.queues.queue_index(QueueRole::PRESENT);
        let swapchain_sync = if swapchain_sync_wanted(
            self.image_acquired,
            self.swapchain_touched.load(Ordering::Relaxed),
            presents_here,
        ) {
            let swapchain = self.swapchain.lock();
            Some(SwapchainSync {
                acquire: swapchain.acquire_semaphore(self.queues.frame_slot()),
                present: swapchain.present_semaphore(),
            })
        } else {
            None
        };
        self.queues.submit_queue(role, dependents, swapchain_sync)
    }

    pub(crate) fn mark_swapchain_touched(&self) {
        assert!(
            self.image_acquired,
            "No swapchain image was acquired this frame; skip swapchain work when begin_frame returns false"
        );
        self.swapchain_touched.store(true, Ordering::Relaxed);
    }

    pub fn create_image(&self, desc: ImageDesc) -> Result<ImageHandle> {
        self.assert_main_thread();
        self.tables.lock().create_image(&self.device.device, &self.mem, desc)
    }

    pub fn create_buffer(&self, desc: BufferDesc) -> Result<BufferHandle> {
        self.assert_main_thread();
        self.tables.lock().create_buffer(&self.device.device, &self.mem, desc)
    }

    pub fn destroy_image(&self, handle: ImageHandle) {
        self.assert_main_thread();
        self.tables.lock().destroy_image(handle, &self.garbage, self.frame_index);
    }

    pub fn destroy_buffer(&self, handle: BufferHandle) {
        self.assert_main_thread();
        self.tables.lock().destroy_buffer(handle, &self.garbage, self.frame_index);
    }

    pub fn image_desc(&self, handle: ImageHandle) -> Option<ImageDesc> {
        self.assert_main_thread();
        self.tables.lock().images.get(handle).map(|entry| entry.desc.clone())
    }

    pub fn create_pipeline_layout(
        &self,
        reflection: &ShaderReflection,
        desc: &PipelineLayoutDesc,
    ) -> Result<PipelineLayoutHandle> {
        self.assert_main_thread();
        self.pipelines.lock().create_layout(
            &self.device.device,
            &self.device.gpu.props.limits,
            reflection,
            desc,
        )
    }

    pub fn destroy_pipeline_layout(&self, handle: PipelineLayoutHandle) {
        self.assert_main_thread();
        self.pipelines
            .lock()
            .destroy_layout(handle, &self.garbage, self.frame_index);
    }

    pub fn create_graphics_pipeline(
        &self,
        reflection: &ShaderReflection,
        layout: PipelineLayoutHandle,
        desc: &GraphicsPipelineDesc,
    ) -> Result<PipelineHandle> {
        self.assert_main_thread();
        self.pipelines
            .lock()
            .create_graphics_pipeline(&self.device.device, reflection, layout, desc)
    }

    pub fn create_compute_pipeline(
        &self,
        reflection: &ShaderReflection,
        layout: PipelineLayoutHandle,
    ) -> Result<PipelineHandle> {
        self.assert_main_thread();
        self.pipelines
            .lock()
            .create_compute_pipeline(&self.device.device, reflection, layout)
    }

    pub fn destroy_pipeline(&self, handle: PipelineHandle) {
        self.assert_main_thread();
        self.pipelines
            .lock()
            .destroy_pipeline(handle, &self.garbage, self.frame_index);
    }

    /// Base pointer of a host-visible buffer; valid until the buffer dies
    /// (or, for transient buffers, until the slot's arena resets)
    pub fn map_buffer(&self, handle: BufferHandle) -> Result<*mut u8> {
        self.assert_main_thread();
        let tables = self.tables.lock();
        let entry = tables.buffers.get(handle).context("map_buffer: stale buffer handle")?;
        ensure!(entry.mem.cpu_visible, "Buffer is not host-visible");
        Ok(entry.mem.mapped)
    }

    /// Make host writes visible to the device for a non-coherent buffer
    pub fn flush_buffer(&self, handle: BufferHandle, offset: u64, size: u64) -> Result<()> {
        self.assert_main_thread();
        let tables = self.tables.lock();
        let entry = tables.buffers.get(handle).context("flush_buffer: stale buffer handle")?;
        ensure!(entry.mem.cpu_visible, "Buffer is not host-visible");
        if entry.mem.coherent {
            return Ok(());
        }

        let atom = self.device.gpu.props.limits.non_coherent_atom_size.max(1);
        let start = (entry.mem.offset + offset) / atom * atom;
        let end = (entry.mem.offset + offset + size + atom - 1) / atom * atom;
        let range = vk::MappedMemoryRange::builder()
            .memory(entry.mem.memory)
            .offset(start)
            .size(end - start);
        unsafe { self.device.device.flush_mapped_memory_ranges(&[range.build()]) }
            .context("Failed to flush buffer memory")
    }

    /// Convenience for streaming data: a transient host-visible buffer filled
    /// from `bytes`, dead at the end of this slot's frame
    pub fn create_transient_buffer(&self, bytes: &[u8], usage: vk::BufferUsageFlags) -> Result<BufferHandle> {
        let handle = self.create_buffer(BufferDesc {
            size_bytes: bytes.len() as u64,
            usage,
            arena: MemoryArena::TransientCpu,
        })?;
        let dst = self.map_buffer(handle)?;
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) };
        self.flush_buffer(handle, 0, bytes.len() as u64)?;
        Ok(handle)
    }

    /// Tear everything down in dependency order. Stops the submission thread,
    /// then force-drains the garbage list so nothing native survives.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        log::info!("Shutting down graphics backend");

        self.device.wait_idle();
        self.queues.release();

        let frame = self.frame_index;
        {
            let mut tables = self.tables.lock();
            for entry in tables.images.drain() {
                self.garbage.push(frame, GarbageHandle::ImageView(entry.view));
                self.garbage.push(frame, GarbageHandle::Image(entry.native));
            }
            for entry in tables.buffers.drain() {
                self.garbage.push(frame, GarbageHandle::Buffer(entry.native));
            }
        }
        {
            let mut pipelines = self.pipelines.lock();
            for entry in pipelines.pipelines.drain() {
                self.garbage.push(frame, GarbageHandle::Pipeline(entry.native));
            }
            for entry in pipelines.layouts.drain() {
                for set_layout in entry.set_layouts {
                    self.garbage.push(frame, GarbageHandle::DescriptorSetLayout(set_layout));
                }
                self.garbage.push(frame, GarbageHandle::PipelineLayout(entry.layout));
            }
        }
        self.garbage.push(frame, GarbageHandle::Sampler(self.default_sampler));
        self.garbage.collect(&self.device.device, frame, true);

        self.mem.release();
        // Swapchain and device context unwind through their own Drop impls
    }
}

impl Drop for GfxBackend {
    fn drop(&mut self) {
        self.release();
    }
}

fn assert_owning_thread(owner: ThreadId) {
    assert_eq!(
        std::thread::current().id(),
        owner,
        "Backend calls are only allowed from the thread that initialized it"
    );
}

/// A submission wires the acquire/present semaphores only when it runs on the
/// presenting queue, a swapchain target was recorded, and this frame actually
/// acquired an image. An acquire that failed with out-of-date never signals
/// its semaphore, so waiting on it would hang the submission.
fn swapchain_sync_wanted(image_acquired: bool, touched: bool, presents_here: bool) -> bool {
    image_acquired && touched && presents_here
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_acquire_never_wires_swapchain_semaphores() {
        assert!(!swapchain_sync_wanted(false, true, true));
        assert!(!swapchain_sync_wanted(false, false, true));
    }

    #[test]
    fn swapchain_semaphores_only_on_the_presenting_queue() {
        assert!(swapchain_sync_wanted(true, true, true));
        assert!(!swapchain_sync_wanted(true, true, false));
        assert!(!swapchain_sync_wanted(true, false, true));
    }

    #[test]
    fn foreign_thread_is_rejected() {
        let owner = std::thread::current().id();
        let result = std::thread::spawn(move || assert_owning_thread(owner)).join();
        assert!(result.is_err());
        assert_owning_thread(owner); // same thread passes
    }
}
