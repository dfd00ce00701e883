// Resource tables and deferred garbage collection
//
// Images and buffers live in handle-indexed tables; Destroy* removes the
// table entry immediately (so the handle dies) but quarantines the native
// objects until every frame that could still reference them has completed.

use anyhow::{ensure, Context, Result};
use ash::vk;
use parking_lot::Mutex;

use crate::handle::{Handle, HandlePool};
use crate::mem::{DeviceMemoryBlock, DeviceMemoryManager, MemoryArena};
use crate::{FRAMES_IN_FLIGHT, MAX_GARBAGE_COLLECT_PER_FRAME};

/// Mip chain ceiling; enough for a 4096² base level
pub const MAX_MIPS_PER_IMAGE: usize = 12;

#[derive(Debug, Clone)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_count: u32,
    pub layer_count: u32,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub arena: MemoryArena,
    /// Byte offset of each mip inside a source upload buffer, filled by the
    /// asset pipeline; only consulted by buffer-to-image copies
    pub mip_offsets: [u64; MAX_MIPS_PER_IMAGE],
}

impl Default for ImageDesc {
    fn default() -> Self {
        Self {
            width: 1,
            height: 1,
            depth: 1,
            mip_count: 1,
            layer_count: 1,
            format: vk::Format::R8G8B8A8_UNORM,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            arena: MemoryArena::PersistentGpu,
            mip_offsets: [0; MAX_MIPS_PER_IMAGE],
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub size_bytes: u64,
    pub usage: vk::BufferUsageFlags,
    pub arena: MemoryArena,
}

impl Default for BufferDesc {
    fn default() -> Self {
        Self {
            size_bytes: 0,
            usage: vk::BufferUsageFlags::empty(),
            arena: MemoryArena::PersistentGpu,
        }
    }
}

/// Last-transitioned pipeline state of a resource, used to build the source
/// half of the next barrier
#[derive(Clone, Copy)]
pub(crate) struct TrackedState {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub layout: vk::ImageLayout,
}

impl TrackedState {
    fn fresh() -> Self {
        Self {
            stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
            access: vk::AccessFlags2::NONE,
            layout: vk::ImageLayout::UNDEFINED,
        }
    }
}

pub struct ImageEntry {
    pub(crate) native: vk::Image,
    pub(crate) view: vk::ImageView,
    pub(crate) desc: ImageDesc,
    pub(crate) mem: DeviceMemoryBlock,
    pub(crate) state: TrackedState,
}

pub struct BufferEntry {
    pub(crate) native: vk::Buffer,
    pub(crate) desc: BufferDesc,
    pub(crate) mem: DeviceMemoryBlock,
    pub(crate) state: TrackedState,
}

pub type ImageHandle = Handle<ImageEntry>;
pub type BufferHandle = Handle<BufferEntry>;

/// Native handle awaiting destruction. Exhaustively matched in the collector
/// so a new kind can never be silently skipped.
#[derive(Debug, Clone, Copy)]
pub(crate) enum GarbageHandle {
    Pipeline(vk::Pipeline),
    PipelineLayout(vk::PipelineLayout),
    DescriptorSetLayout(vk::DescriptorSetLayout),
    Buffer(vk::Buffer),
    Image(vk::Image),
    ImageView(vk::ImageView),
    Sampler(vk::Sampler),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct GarbageItem {
    /// Frame index when destruction was requested
    pub frame: u64,
    pub handle: GarbageHandle,
}

/// An item may be released once every frame in flight at request time has
/// provably completed.
fn expired(current_frame: u64, item_frame: u64) -> bool {
    current_frame.saturating_sub(item_frame) >= FRAMES_IN_FLIGHT as u64
}

/// Release expired items through `destroy`, keeping the rest. At most
/// `MAX_GARBAGE_COLLECT_PER_FRAME` items go per call; `force` ignores both
/// the budget and the age check (shutdown drain). Returns the release count.
fn drain_expired(
    items: &mut Vec<GarbageItem>,
    current_frame: u64,
    force: bool,
    destroy: &mut dyn FnMut(GarbageHandle),
) -> usize {
    let budget = if force { usize::MAX } else { MAX_GARBAGE_COLLECT_PER_FRAME };
    let mut released = 0usize;
    items.retain(|item| {
        if released >= budget || (!force && !expired(current_frame, item.frame)) {
            return true;
        }
        destroy(item.handle);
        released += 1;
        false
    });
    released
}

/// Deferred-destruction quarantine. The only resource structure touched from
/// more than one thread, so it carries its own lock.
pub(crate) struct GarbageList {
    items: Mutex<Vec<GarbageItem>>,
}

impl GarbageList {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, frame: u64, handle: GarbageHandle) {
        self.items.lock().push(GarbageItem { frame, handle });
    }

    /// Release expired items, bounded per call unless `force` (shutdown)
    pub fn collect(&self, device: &ash::Device, current_frame: u64, force: bool) {
        let mut items = self.items.lock();
        let released = drain_expired(&mut items, current_frame, force, &mut |handle| unsafe {
            match handle {
                GarbageHandle::Pipeline(p) => device.destroy_pipeline(p, None),
                GarbageHandle::PipelineLayout(l) => device.destroy_pipeline_layout(l, None),
                GarbageHandle::DescriptorSetLayout(l) => {
                    device.destroy_descriptor_set_layout(l, None)
                }
                GarbageHandle::Buffer(b) => device.destroy_buffer(b, None),
                GarbageHandle::Image(i) => device.destroy_image(i, None),
                GarbageHandle::ImageView(v) => device.destroy_image_view(v, None),
                GarbageHandle::Sampler(s) => device.destroy_sampler(s, None),
            }
        });

        if released > 0 {
            log::debug!("Garbage collected {} native objects, {} pending", released, items.len());
        }
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.items.lock().len()
    }
}

pub(crate) fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Handle-indexed stores for images and buffers. Mutated from the main
/// thread only; no locking required.
pub(crate) struct ResourceTables {
    pub images: HandlePool<ImageEntry>,
    pub buffers: HandlePool<BufferEntry>,
}

impl ResourceTables {
    pub fn new() -> Self {
        Self {
            images: HandlePool::new(),
            buffers: HandlePool::new(),
        }
    }

    /// Create a native image backed by the requested arena. Identical
    /// descriptors always produce distinct images; nothing is deduplicated.
    pub fn create_image(
        &mut self,
        device: &ash::Device,
        mem: &DeviceMemoryManager,
        desc: ImageDesc,
    ) -> Result<ImageHandle> {
        ensure!(
            desc.mip_count as usize <= MAX_MIPS_PER_IMAGE,
            "Image requests {} mips, limit is {}",
            desc.mip_count,
            MAX_MIPS_PER_IMAGE
        );
        ensure!(desc.width > 0 && desc.height > 0 && desc.depth > 0, "Zero-sized image");

        let image_type = if desc.depth > 1 {
            vk::ImageType::TYPE_3D
        } else {
            vk::ImageType::TYPE_2D
        };
        let create_info = vk::ImageCreateInfo::builder()
            .image_type(image_type)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: desc.depth,
            })
            .mip_levels(desc.mip_count)
            .array_layers(desc.layer_count)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let native = unsafe { device.create_image(&create_info, None) }
            .context("Failed to create image")?;

        let req = unsafe { device.get_image_memory_requirements(native) };
        let block = match mem.alloc(&req, desc.arena) {
            Ok(block) => block,
            Err(err) => {
                unsafe { device.destroy_image(native, None) };
                return Err(err);
            }
        };
        unsafe { device.bind_image_memory(native, block.memory, block.offset) }
            .context("Failed to bind image memory")?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(native)
            .view_type(if desc.depth > 1 {
                vk::ImageViewType::TYPE_3D
            } else if desc.layer_count > 1 {
                vk::ImageViewType::TYPE_2D_ARRAY
            } else {
                vk::ImageViewType::TYPE_2D
            })
            .format(desc.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect_for_format(desc.format),
                base_mip_level: 0,
                level_count: desc.mip_count,
                base_array_layer: 0,
                layer_count: desc.layer_count,
            });
        let view = unsafe { device.create_image_view(&view_info, None) }
            .context("Failed to create image view")?;

        Ok(self.images.add(ImageEntry {
            native,
            view,
            desc,
            mem: block,
            state: TrackedState::fresh(),
        }))
    }

    pub fn create_buffer(
        &mut self,
        device: &ash::Device,
        mem: &DeviceMemoryManager,
        desc: BufferDesc,
    ) -> Result<BufferHandle> {
        ensure!(desc.size_bytes > 0, "Zero-sized buffer");

        let create_info = vk::BufferCreateInfo::builder()
            .size(desc.size_bytes)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let native = unsafe { device.create_buffer(&create_info, None) }
            .context("Failed to create buffer")?;

        let mut req = unsafe { device.get_buffer_memory_requirements(native) };
        req.alignment = req.alignment.max(16);
        let block = match mem.alloc(&req, desc.arena) {
            Ok(block) => block,
            Err(err) => {
                unsafe { device.destroy_buffer(native, None) };
                return Err(err);
            }
        };
        unsafe { device.bind_buffer_memory(native, block.memory, block.offset) }
            .context("Failed to bind buffer memory")?;

        Ok(self.buffers.add(BufferEntry {
            native,
            desc,
            mem: block,
            state: TrackedState::fresh(),
        }))
    }

    /// Idempotent: destroying an invalid or already-destroyed handle is a no-op
    pub fn destroy_image(&mut self, handle: ImageHandle, garbage: &GarbageList, frame: u64) {
        if let Some(entry) = self.images.remove(handle) {
            log::trace!(
                "Retiring image ({:?} arena, offset {})",
                entry.mem.arena,
                entry.mem.offset
            );
            garbage.push(frame, GarbageHandle::ImageView(entry.view));
            garbage.push(frame, GarbageHandle::Image(entry.native));
        }
    }

    pub fn destroy_buffer(&mut self, handle: BufferHandle, garbage: &GarbageList, frame: u64) {
        if let Some(entry) = self.buffers.remove(handle) {
            garbage.push(frame, GarbageHandle::Buffer(entry.native));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_survive_until_frames_in_flight_have_elapsed() {
        for age in 0..FRAMES_IN_FLIGHT as u64 {
            assert!(!expired(10 + age, 10), "age {} must not be released", age);
        }
        assert!(expired(10 + FRAMES_IN_FLIGHT as u64, 10));
    }

    #[test]
    fn expiry_is_robust_to_frame_zero() {
        assert!(!expired(0, 0));
        assert!(!expired(1, 0));
        assert!(expired(FRAMES_IN_FLIGHT as u64, 0));
    }

    #[test]
    fn garbage_push_is_visible_until_collected() {
        let garbage = GarbageList::new();
        garbage.push(5, GarbageHandle::Buffer(vk::Buffer::null()));
        garbage.push(5, GarbageHandle::Image(vk::Image::null()));
        assert_eq!(garbage.pending(), 2);
    }

    fn expired_buffers(count: usize) -> Vec<GarbageItem> {
        (0..count)
            .map(|_| GarbageItem {
                frame: 0,
                handle: GarbageHandle::Buffer(vk::Buffer::null()),
            })
            .collect()
    }

    #[test]
    fn collection_stops_at_the_per_frame_budget() {
        let mut items = expired_buffers(MAX_GARBAGE_COLLECT_PER_FRAME + 8);
        let mut destroyed = 0;
        let released = drain_expired(&mut items, 100, false, &mut |_| destroyed += 1);
        assert_eq!(released, MAX_GARBAGE_COLLECT_PER_FRAME);
        assert_eq!(destroyed, MAX_GARBAGE_COLLECT_PER_FRAME);
        assert_eq!(items.len(), 8);
    }

    #[test]
    fn forced_collection_drains_everything() {
        let mut items = expired_buffers(MAX_GARBAGE_COLLECT_PER_FRAME + 8);
        // Not yet expired at frame 100; force must take it anyway.
        items.push(GarbageItem {
            frame: 100,
            handle: GarbageHandle::Buffer(vk::Buffer::null()),
        });
        let released = drain_expired(&mut items, 100, true, &mut |_| {});
        assert_eq!(released, MAX_GARBAGE_COLLECT_PER_FRAME + 9);
        assert!(items.is_empty());
    }

    #[test]
    fn unexpired_items_are_kept() {
        let mut items = vec![
            GarbageItem {
                frame: 0,
                handle: GarbageHandle::Buffer(vk::Buffer::null()),
            },
            GarbageItem {
                frame: 99,
                handle: GarbageHandle::Buffer(vk::Buffer::null()),
            },
        ];
        let released = drain_expired(&mut items, 100, false, &mut |_| {});
        assert_eq!(released, 1);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].frame, 99);
    }

    #[test]
    fn depth_formats_map_to_depth_aspect() {
        assert_eq!(aspect_for_format(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect_for_format(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(aspect_for_format(vk::Format::R8G8B8A8_SRGB), vk::ImageAspectFlags::COLOR);
    }
}
