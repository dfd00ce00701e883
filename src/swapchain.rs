// Swapchain - window presentation
//
// Manages the chain of presentable images, their acquire/present semaphores
// and their tracked layout state. Out-of-date and suboptimal results never
// surface as errors; they set a resize flag resolved at the frame boundary.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use crate::device::DeviceContext;
use crate::FRAMES_IN_FLIGHT;

/// Last-transitioned state of one presentable image
#[derive(Clone, Copy)]
pub(crate) struct ImageState {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub layout: vk::ImageLayout,
}

impl ImageState {
    fn fresh() -> Self {
        Self {
            stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
            access: vk::AccessFlags2::NONE,
            layout: vk::ImageLayout::UNDEFINED,
        }
    }
}

pub struct Swapchain {
    loader: ash::extensions::khr::Swapchain,
    surface_loader: ash::extensions::khr::Surface,
    surface: vk::SurfaceKHR,
    handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    /// One acquire semaphore per frame-in-flight slot
    acquire_semaphores: [vk::Semaphore; FRAMES_IN_FLIGHT],
    /// One present semaphore per swapchain image
    present_semaphores: Vec<vk::Semaphore>,
    pub(crate) image_states: Vec<ImageState>,
    current_image: u32,
    resize_pending: bool,
    pending_size: (u32, u32),
    vsync: bool,
    device: Arc<DeviceContext>,
}

impl Swapchain {
    pub fn new(
        device: Arc<DeviceContext>,
        surface: vk::SurfaceKHR,
        surface_loader: ash::extensions::khr::Surface,
        width: u32,
        height: u32,
        vsync: bool,
    ) -> Result<Self> {
        let loader = ash::extensions::khr::Swapchain::new(&device.instance, &device.device);

        let mut swapchain = Self {
            loader,
            surface_loader,
            surface,
            handle: vk::SwapchainKHR::null(),
            images: Vec::new(),
            image_views: Vec::new(),
            format: vk::Format::UNDEFINED,
            extent: vk::Extent2D::default(),
            acquire_semaphores: [vk::Semaphore::null(); FRAMES_IN_FLIGHT],
            present_semaphores: Vec::new(),
            image_states: Vec::new(),
            current_image: 0,
            resize_pending: false,
            pending_size: (width, height),
            vsync,
            device,
        };

        for sem in &mut swapchain.acquire_semaphores {
            *sem = unsafe {
                swapchain
                    .device
                    .device
                    .create_semaphore(&vk::SemaphoreCreateInfo::builder(), None)
            }
            .context("Failed to create acquire semaphore")?;
        }

        swapchain.create_chain(width, height)?;
        Ok(swapchain)
    }

    fn create_chain(&mut self, width: u32, height: u32) -> Result<()> {
        log::info!("Creating swapchain: {}x{}", width, height);

        let gpu = self.device.gpu.handle;
        let surface_caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(gpu, self.surface)
        }?;
        let formats = unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(gpu, self.surface)
        }?;
        let present_modes = unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(gpu, self.surface)
        }?;

        // Prefer SRGB
        let surface_format = formats
            .iter()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_SRGB
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| formats.first())
            .context("No suitable surface format")?;

        // FIFO when vsync is on (always supported); otherwise MAILBOX, falling
        // back to IMMEDIATE, falling back to FIFO
        let present_mode = if self.vsync {
            vk::PresentModeKHR::FIFO
        } else {
            present_modes
                .iter()
                .copied()
                .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
                .or_else(|| {
                    present_modes
                        .iter()
                        .copied()
                        .find(|&mode| mode == vk::PresentModeKHR::IMMEDIATE)
                })
                .unwrap_or(vk::PresentModeKHR::FIFO)
        };
        log::info!("Present mode: {:?}", present_mode);

        let extent = if surface_caps.current_extent.width != u32::MAX {
            surface_caps.current_extent
        } else {
            vk::Extent2D {
                width: width.clamp(
                    surface_caps.min_image_extent.width,
                    surface_caps.max_image_extent.width,
                ),
                height: height.clamp(
                    surface_caps.min_image_extent.height,
                    surface_caps.max_image_extent.height,
                ),
            }
        };

        let mut image_count = surface_caps.min_image_count + 1;
        if surface_caps.max_image_count > 0 && image_count > surface_caps.max_image_count {
            image_count = surface_caps.max_image_count;
        }

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(self.handle);

        let handle = unsafe { self.loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;
        if self.handle != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(self.handle, None) };
        }
        self.handle = handle;

        let images = unsafe { self.loader.get_swapchain_images(handle) }?;
        log::info!("Created swapchain with {} images", images.len());

        let device = &self.device.device;
        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            image_views.push(
                unsafe { device.create_image_view(&view_info, None) }
                    .context("Failed to create swapchain image view")?,
            );
        }

        let mut present_semaphores = Vec::with_capacity(images.len());
        for _ in &images {
            present_semaphores.push(
                unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::builder(), None) }
                    .context("Failed to create present semaphore")?,
            );
        }

        self.image_states = images.iter().map(|_| ImageState::fresh()).collect();
        self.images = images;
        self.image_views = image_views;
        self.present_semaphores = present_semaphores;
        self.format = surface_format.format;
        self.extent = extent;
        self.current_image = 0;
        Ok(())
    }

    /// Acquire the next presentable image. `None` means the surface is out of
    /// date; the resize flag is set and the frame should be skipped.
    pub fn acquire(&mut self, frame_slot: usize) -> Result<Option<u32>> {
        let semaphore = self.acquire_semaphores[frame_slot];
        let result = unsafe {
            self.loader
                .acquire_next_image(self.handle, u64::MAX, semaphore, vk::Fence::null())
        };
        match result {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    self.resize_pending = true;
                }
                self.current_image = index;
                Ok(Some(index))
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.resize_pending = true;
                Ok(None)
            }
            Err(err) => Err(err).context("Failed to acquire swapchain image"),
        }
    }

    /// Present the current image, waiting on its render-complete semaphore
    pub fn present(&mut self, queue: vk::Queue) -> Result<()> {
        let wait = [self.present_semaphores[self.current_image as usize]];
        let swapchains = [self.handle];
        let image_indices = [self.current_image];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.loader.queue_present(queue, &present_info) };
        match result {
            Ok(suboptimal) => {
                if suboptimal {
                    self.resize_pending = true;
                }
                Ok(())
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.resize_pending = true;
                Ok(())
            }
            Err(err) => Err(err).context("Failed to present swapchain image"),
        }
    }

    pub fn acquire_semaphore(&self, frame_slot: usize) -> vk::Semaphore {
        self.acquire_semaphores[frame_slot]
    }

    pub fn present_semaphore(&self) -> vk::Semaphore {
        self.present_semaphores[self.current_image as usize]
    }

    pub fn current_image(&self) -> u32 {
        self.current_image
    }

    /// Record the new framebuffer size from a window event
    pub fn request_resize(&mut self, width: u32, height: u32) {
        self.pending_size = (width, height);
        self.resize_pending = true;
    }

    pub fn resize_pending(&self) -> bool {
        self.resize_pending
    }

    /// Rebuild the chain at the pending size. The caller has already waited
    /// the device idle.
    pub fn recreate(&mut self) -> Result<()> {
        let (width, height) = self.pending_size;
        if width == 0 || height == 0 {
            // Minimized; keep the flag and try again next frame
            return Ok(());
        }
        self.destroy_images();
        self.create_chain(width, height)?;
        self.resize_pending = false;
        Ok(())
    }

    fn destroy_images(&mut self) {
        let device = &self.device.device;
        unsafe {
            for view in self.image_views.drain(..) {
                device.destroy_image_view(view, None);
            }
            for sem in self.present_semaphores.drain(..) {
                device.destroy_semaphore(sem, None);
            }
        }
        self.images.clear();
        self.image_states.clear();
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy_images();
        unsafe {
            for &sem in &self.acquire_semaphores {
                self.device.device.destroy_semaphore(sem, None);
            }
            self.loader.destroy_swapchain(self.handle, None);
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}
