// Device memory manager - fixed-purpose bump arenas
//
// All device memory comes out of a small set of arenas sized once at init.
// Allocation is a forward-only cursor bump; reclaiming memory means resetting
// a whole arena, never freeing individual allocations. Transient arenas are
// per frame-in-flight slot and reset every frame after the slot's fences have
// been waited, which makes them a fragmentation-free streaming allocator.

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::MemorySettings;
use crate::device::DeviceContext;
use crate::FRAMES_IN_FLIGHT;

/// Which arena an allocation lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryArena {
    /// Device-local, lives for the whole run
    #[default]
    PersistentGpu,
    /// Host-visible, lives for the whole run (permanent staging)
    PersistentCpu,
    /// Host-visible, valid for one frame; reset at the next use of its slot
    TransientCpu,
}

/// A range inside one arena's device memory
#[derive(Clone, Copy)]
pub struct DeviceMemoryBlock {
    pub memory: vk::DeviceMemory,
    pub offset: vk::DeviceSize,
    /// Base of the range when the heap is host-visible
    pub mapped: *mut u8,
    pub arena: MemoryArena,
    pub device_local: bool,
    pub cpu_visible: bool,
    pub coherent: bool,
}

impl DeviceMemoryBlock {
    pub fn is_valid(&self) -> bool {
        self.memory != vk::DeviceMemory::null()
    }
}

/// Forward-only cursor bump inside `capacity`. Returns the aligned offset, or
/// `None` when the arena is exhausted.
fn bump(cursor: &mut vk::DeviceSize, alignment: vk::DeviceSize, size: vk::DeviceSize, capacity: vk::DeviceSize) -> Option<vk::DeviceSize> {
    debug_assert!(alignment != 0 && alignment.is_power_of_two());
    let offset = (*cursor + alignment - 1) & !(alignment - 1);
    if offset + size > capacity {
        return None;
    }
    *cursor = offset + size;
    Some(offset)
}

/// Memory-type selection: exact-match pass first, then a flag-subset pass,
/// then the same two passes with the fallback flags. `None` means the
/// hardware cannot back this arena at all, which is fatal at init.
pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    required: vk::MemoryPropertyFlags,
    prefer_device_local_heap: bool,
    fallback: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let heap_local = |index: u32| {
        let heap = props.memory_types[index as usize].heap_index;
        props.memory_heaps[heap as usize]
            .flags
            .contains(vk::MemoryHeapFlags::DEVICE_LOCAL)
    };

    for pass in 0..2 {
        for i in 0..props.memory_type_count {
            let flags = props.memory_types[i as usize].property_flags;
            let matches = if pass == 0 { flags == required } else { flags.contains(required) };
            if matches && (!prefer_device_local_heap || heap_local(i)) {
                return Some(i);
            }
        }
    }

    if !fallback.is_empty() && fallback != required {
        return find_memory_type(props, fallback, prefer_device_local_heap, vk::MemoryPropertyFlags::empty());
    }

    None
}

struct BumpArena {
    memory: vk::DeviceMemory,
    mapped: *mut u8,
    capacity: vk::DeviceSize,
    cursor: Mutex<vk::DeviceSize>,
    mem_type_index: u32,
    type_flags: vk::MemoryPropertyFlags,
    heap_flags: vk::MemoryHeapFlags,
}

// The raw mapped pointer is only dereferenced through DeviceMemoryBlock on
// the owning thread; the arena itself is just handles + a guarded cursor.
unsafe impl Send for BumpArena {}
unsafe impl Sync for BumpArena {}

impl BumpArena {
    fn new(
        device: &ash::Device,
        props: &vk::PhysicalDeviceMemoryProperties,
        mem_type_index: u32,
        capacity: vk::DeviceSize,
    ) -> Result<Self> {
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(capacity)
            .memory_type_index(mem_type_index);

        let memory = unsafe { device.allocate_memory(&alloc_info, None) }
            .context("Failed to allocate arena device memory")?;

        let mem_type = props.memory_types[mem_type_index as usize];
        let type_flags = mem_type.property_flags;
        let heap_flags = props.memory_heaps[mem_type.heap_index as usize].flags;

        // Host-visible arenas stay mapped for their whole lifetime
        let mapped = if type_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            unsafe { device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) }
                .context("Failed to map arena memory")? as *mut u8
        } else {
            std::ptr::null_mut()
        };

        Ok(Self {
            memory,
            mapped,
            capacity,
            cursor: Mutex::new(0),
            mem_type_index,
            type_flags,
            heap_flags,
        })
    }

    fn alloc(&self, req: &vk::MemoryRequirements, arena: MemoryArena) -> Result<DeviceMemoryBlock> {
        assert!(
            (req.memory_type_bits >> self.mem_type_index) & 1 == 1,
            "Resource cannot be backed by memory type {} (type bits {:#x})",
            self.mem_type_index,
            req.memory_type_bits
        );

        let mut cursor = self.cursor.lock();
        let offset = bump(&mut cursor, req.alignment.max(1), req.size, self.capacity)
            .with_context(|| {
                format!(
                    "Arena {:?} exhausted: {} bytes requested, {} of {} used",
                    arena, req.size, *cursor, self.capacity
                )
            })?;

        Ok(DeviceMemoryBlock {
            memory: self.memory,
            offset,
            mapped: if self.mapped.is_null() {
                std::ptr::null_mut()
            } else {
                unsafe { self.mapped.add(offset as usize) }
            },
            arena,
            device_local: self.heap_flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL),
            cpu_visible: self.type_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
            coherent: self.type_flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT),
        })
    }

    fn reset(&self) {
        *self.cursor.lock() = 0;
    }

    fn release(&self, device: &ash::Device) {
        unsafe {
            if !self.mapped.is_null() {
                device.unmap_memory(self.memory);
            }
            device.free_memory(self.memory, None);
        }
    }
}

/// Owns the fixed arena set and maps arena requests onto concrete memory types
pub struct DeviceMemoryManager {
    device: ash::Device,
    persistent_gpu: BumpArena,
    persistent_cpu: BumpArena,
    transient_cpu: [BumpArena; FRAMES_IN_FLIGHT],
    frame_slot: AtomicUsize,
}

impl DeviceMemoryManager {
    pub fn new(ctx: &DeviceContext, settings: &MemorySettings) -> Result<Self> {
        let props = &ctx.gpu.memory_props;
        let device = &ctx.device;
        const MB: u64 = 1024 * 1024;

        let gpu_type = find_memory_type(
            props,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            true,
            vk::MemoryPropertyFlags::empty(),
        )
        .context("No device-local memory type on this hardware")?;

        let cpu_type = find_memory_type(
            props,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            false,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        )
        .context("No host-visible memory type on this hardware")?;

        log::info!(
            "Memory arenas: persistent-gpu {} MB (type {}), persistent-cpu {} MB, transient-cpu {} MB x{} (type {})",
            settings.persistent_gpu_mb,
            gpu_type,
            settings.persistent_cpu_mb,
            settings.transient_cpu_mb,
            FRAMES_IN_FLIGHT,
            cpu_type
        );

        Ok(Self {
            device: device.clone(),
            persistent_gpu: BumpArena::new(device, props, gpu_type, settings.persistent_gpu_mb * MB)?,
            persistent_cpu: BumpArena::new(device, props, cpu_type, settings.persistent_cpu_mb * MB)?,
            transient_cpu: [
                BumpArena::new(device, props, cpu_type, settings.transient_cpu_mb * MB)?,
                BumpArena::new(device, props, cpu_type, settings.transient_cpu_mb * MB)?,
            ],
            frame_slot: AtomicUsize::new(0),
        })
    }

    /// Allocate out of the requested arena. Exhaustion is an error surfaced
    /// to the caller, never silently retried.
    pub fn alloc(&self, req: &vk::MemoryRequirements, arena: MemoryArena) -> Result<DeviceMemoryBlock> {
        match arena {
            MemoryArena::PersistentGpu => self.persistent_gpu.alloc(req, arena),
            MemoryArena::PersistentCpu => self.persistent_cpu.alloc(req, arena),
            MemoryArena::TransientCpu => {
                let slot = self.frame_slot.load(Ordering::Relaxed);
                self.transient_cpu[slot].alloc(req, arena)
            }
        }
    }

    /// Reset the transient arena of `slot` and route subsequent transient
    /// allocations to it. The caller guarantees (via the frame fence wait)
    /// that the GPU no longer references anything allocated from this slot.
    pub fn reset_transient(&self, slot: usize) {
        self.transient_cpu[slot].reset();
        self.frame_slot.store(slot, Ordering::Relaxed);
    }

    pub fn release(&mut self) {
        self.persistent_gpu.release(&self.device);
        self.persistent_cpu.release(&self.device);
        for arena in &self.transient_cpu {
            arena.release(&self.device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_aligns_and_advances() {
        let mut cursor = 0;
        assert_eq!(bump(&mut cursor, 16, 100, 1024), Some(0));
        assert_eq!(cursor, 100);
        // next allocation rounds up to the alignment
        assert_eq!(bump(&mut cursor, 16, 16, 1024), Some(112));
        assert_eq!(cursor, 128);
    }

    #[test]
    fn bump_rejects_exhaustion_and_keeps_cursor() {
        let mut cursor = 0;
        assert_eq!(bump(&mut cursor, 4, 1000, 1024), Some(0));
        assert_eq!(bump(&mut cursor, 4, 100, 1024), None);
        assert_eq!(cursor, 1000); // failed allocation does not move the cursor
    }

    #[test]
    fn bump_reset_returns_to_zero() {
        let mut cursor = 0;
        bump(&mut cursor, 16, 64, 1024).unwrap();
        cursor = 0;
        assert_eq!(bump(&mut cursor, 16, 64, 1024), Some(0));
    }

    fn fake_props(types: &[(vk::MemoryPropertyFlags, u32)], local_heaps: &[bool]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = types.len() as u32;
        for (i, &(flags, heap)) in types.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType { property_flags: flags, heap_index: heap };
        }
        props.memory_heap_count = local_heaps.len() as u32;
        for (i, &local) in local_heaps.iter().enumerate() {
            props.memory_heaps[i].flags = if local {
                vk::MemoryHeapFlags::DEVICE_LOCAL
            } else {
                vk::MemoryHeapFlags::empty()
            };
        }
        props
    }

    #[test]
    fn memory_type_exact_match_wins_over_superset() {
        let props = fake_props(
            &[
                (
                    vk::MemoryPropertyFlags::HOST_VISIBLE
                        | vk::MemoryPropertyFlags::HOST_COHERENT
                        | vk::MemoryPropertyFlags::HOST_CACHED,
                    0,
                ),
                (vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT, 0),
            ],
            &[false],
        );
        let picked = find_memory_type(
            &props,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            false,
            vk::MemoryPropertyFlags::empty(),
        );
        assert_eq!(picked, Some(1));
    }

    #[test]
    fn memory_type_falls_back_to_subset_then_fallback_flags() {
        let props = fake_props(
            &[(
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
                0,
            )],
            &[false],
        );
        // No coherent type at all: the fallback flags decide
        let picked = find_memory_type(
            &props,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            false,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        );
        assert_eq!(picked, Some(0));
    }

    #[test]
    fn memory_type_no_match_is_none() {
        let props = fake_props(&[(vk::MemoryPropertyFlags::DEVICE_LOCAL, 0)], &[true]);
        let picked = find_memory_type(
            &props,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            false,
            vk::MemoryPropertyFlags::empty(),
        );
        assert_eq!(picked, None);
    }

    #[test]
    fn device_local_heap_preference() {
        let props = fake_props(
            &[
                (vk::MemoryPropertyFlags::DEVICE_LOCAL, 0), // non-local heap (e.g. BAR)
                (vk::MemoryPropertyFlags::DEVICE_LOCAL, 1),
            ],
            &[false, true],
        );
        let picked = find_memory_type(
            &props,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            true,
            vk::MemoryPropertyFlags::empty(),
        );
        assert_eq!(picked, Some(1));
    }
}
