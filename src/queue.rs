// Queue manager and submission pipeline
//
// Owns every hardware queue, the per-queue per-slot command buffer contexts,
// and the single submission thread. The submission thread is the only caller
// of queue_submit2 in the whole crate; the main thread hands it work through
// a bounded channel and never blocks on submission latency.

use anyhow::{bail, Context, Result};
use ash::vk;
use bitflags::bitflags;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::device::DeviceContext;
use crate::mem::DeviceMemoryManager;
use crate::FRAMES_IN_FLIGHT;

bitflags! {
    /// Logical roles a hardware queue can serve. The set is closed; cross-queue
    /// dependencies are expressed by role, not by a general job graph.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QueueRole: u32 {
        const GRAPHICS = 1 << 0;
        const COMPUTE  = 1 << 1;
        const TRANSFER = 1 << 2;
        const PRESENT  = 1 << 3;
    }
}

/// Capability summary of one queue family, with surface support folded in
#[derive(Debug, Clone, Copy)]
pub struct FamilyCaps {
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
    pub present: bool,
}

/// One planned hardware queue: which roles it serves and where it comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePlan {
    pub roles: QueueRole,
    pub family_index: u32,
    pub queue_index: u32,
}

/// Assign the logical roles to concrete (family, queue) pairs.
///
/// Graphics+Present goes to the first family that can do both. Transfer
/// prefers a dedicated family (no graphics, no compute), then a non-graphics
/// one; Compute prefers a non-graphics family. A role that cannot get its own
/// queue folds into the graphics queue's role mask, so a single-family device
/// ends up with one queue carrying every role.
pub fn plan_queues(families: &[FamilyCaps]) -> Result<Vec<QueuePlan>> {
    let mut used: Vec<u32> = families.iter().map(|_| 0).collect();

    let graphics_family = families
        .iter()
        .position(|f| f.flags.contains(vk::QueueFlags::GRAPHICS) && f.present)
        .context("No queue family supports both graphics and present")?;
    used[graphics_family] += 1;

    let mut plans = vec![QueuePlan {
        roles: QueueRole::GRAPHICS | QueueRole::PRESENT,
        family_index: graphics_family as u32,
        queue_index: 0,
    }];

    let claim = |preference: &[fn(&FamilyCaps) -> bool], used: &mut Vec<u32>| -> Option<(u32, u32)> {
        for pred in preference {
            for (i, f) in families.iter().enumerate() {
                if pred(f) && used[i] < f.queue_count {
                    let queue_index = used[i];
                    used[i] += 1;
                    return Some((i as u32, queue_index));
                }
            }
        }
        None
    };

    // Graphics and compute families implicitly support transfer
    let transfer_capable = |f: &FamilyCaps| {
        f.flags
            .intersects(vk::QueueFlags::TRANSFER | vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
    };

    match claim(
        &[
            |f| {
                f.flags.contains(vk::QueueFlags::COMPUTE)
                    && !f.flags.contains(vk::QueueFlags::GRAPHICS)
            },
            |f| f.flags.contains(vk::QueueFlags::COMPUTE),
        ],
        &mut used,
    ) {
        Some((family_index, queue_index)) => plans.push(QueuePlan {
            roles: QueueRole::COMPUTE,
            family_index,
            queue_index,
        }),
        None => plans[0].roles |= QueueRole::COMPUTE,
    }

    let dedicated_transfer: fn(&FamilyCaps) -> bool = |f| {
        f.flags.contains(vk::QueueFlags::TRANSFER)
            && !f
                .flags
                .intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
    };
    let non_graphics_transfer: fn(&FamilyCaps) -> bool = |f| {
        f.flags
            .intersects(vk::QueueFlags::TRANSFER | vk::QueueFlags::COMPUTE)
            && !f.flags.contains(vk::QueueFlags::GRAPHICS)
    };

    match claim(&[dedicated_transfer, non_graphics_transfer, transfer_capable], &mut used) {
        Some((family_index, queue_index)) => plans.push(QueuePlan {
            roles: QueueRole::TRANSFER,
            family_index,
            queue_index,
        }),
        None => plans[0].roles |= QueueRole::TRANSFER,
    }

    Ok(plans)
}

/// Derive per-family capability masks from the device's family properties
/// plus per-family surface support answers.
pub fn family_caps(families: &[vk::QueueFamilyProperties], present: &[bool]) -> Vec<FamilyCaps> {
    families
        .iter()
        .zip(present)
        .map(|(f, &present)| FamilyCaps {
            flags: f.queue_flags,
            queue_count: f.queue_count,
            present,
        })
        .collect()
}

/// A cross-queue acquire/release barrier carried as a plain message between
/// queues. Native barrier structs hold pointers and cannot cross threads, so
/// the fields travel raw and the vk struct is rebuilt at replay time.
#[derive(Debug, Clone, Copy)]
pub(crate) enum PendingBarrier {
    Buffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        src_stage: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
        src_family: u32,
        dst_family: u32,
    },
    Image {
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        mip_count: u32,
        layer_count: u32,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src_stage: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
        src_family: u32,
        dst_family: u32,
    },
}

impl PendingBarrier {
    /// Record this barrier into an open command buffer
    pub(crate) fn record(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        match *self {
            PendingBarrier::Buffer {
                buffer,
                offset,
                size,
                src_stage,
                src_access,
                dst_stage,
                dst_access,
                src_family,
                dst_family,
            } => {
                let barrier = vk::BufferMemoryBarrier2::builder()
                    .buffer(buffer)
                    .offset(offset)
                    .size(size)
                    .src_stage_mask(src_stage)
                    .src_access_mask(src_access)
                    .dst_stage_mask(dst_stage)
                    .dst_access_mask(dst_access)
                    .src_queue_family_index(src_family)
                    .dst_queue_family_index(dst_family);
                let dep = vk::DependencyInfo::builder()
                    .buffer_memory_barriers(std::slice::from_ref(&barrier));
                unsafe { device.cmd_pipeline_barrier2(cmd, &dep) };
            }
            PendingBarrier::Image {
                image,
                aspect,
                mip_count,
                layer_count,
                old_layout,
                new_layout,
                src_stage,
                src_access,
                dst_stage,
                dst_access,
                src_family,
                dst_family,
            } => {
                let barrier = vk::ImageMemoryBarrier2::builder()
                    .image(image)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: aspect,
                        base_mip_level: 0,
                        level_count: mip_count,
                        base_array_layer: 0,
                        layer_count,
                    })
                    .old_layout(old_layout)
                    .new_layout(new_layout)
                    .src_stage_mask(src_stage)
                    .src_access_mask(src_access)
                    .dst_stage_mask(dst_stage)
                    .dst_access_mask(dst_access)
                    .src_queue_family_index(src_family)
                    .dst_queue_family_index(dst_family);
                let dep = vk::DependencyInfo::builder()
                    .image_memory_barriers(std::slice::from_ref(&barrier));
                unsafe { device.cmd_pipeline_barrier2(cmd, &dep) };
            }
        }
    }
}

/// Per-queue, per-frame-slot recording state: one native pool plus free-lists
/// for command buffers, fences and private semaphores, and a cursor marking
/// how far into the active list submission has consumed.
struct CommandBufferContext {
    pool: vk::CommandPool,
    free: Vec<vk::CommandBuffer>,
    active: Vec<vk::CommandBuffer>,
    /// Index into `active` past the last submitted buffer
    cursor: usize,
    fence_free: Vec<vk::Fence>,
    fences_in_flight: Vec<vk::Fence>,
    semaphores: Vec<vk::Semaphore>,
    sem_cursor: usize,
}

impl CommandBufferContext {
    fn new(device: &ash::Device, family_index: u32) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder().queue_family_index(family_index);
        let pool = unsafe { device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;
        Ok(Self {
            pool,
            free: Vec::new(),
            active: Vec::new(),
            cursor: 0,
            fence_free: Vec::new(),
            fences_in_flight: Vec::new(),
            semaphores: Vec::new(),
            sem_cursor: 0,
        })
    }

    fn next_fence(&mut self, device: &ash::Device) -> Result<vk::Fence> {
        match self.fence_free.pop() {
            Some(fence) => Ok(fence),
            None => unsafe { device.create_fence(&vk::FenceCreateInfo::builder(), None) }
                .context("Failed to create submit fence"),
        }
    }

    fn next_semaphore(&mut self, device: &ash::Device) -> Result<vk::Semaphore> {
        if self.sem_cursor == self.semaphores.len() {
            let sem = unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::builder(), None) }
                .context("Failed to create submit semaphore")?;
            self.semaphores.push(sem);
        }
        let sem = self.semaphores[self.sem_cursor];
        self.sem_cursor += 1;
        Ok(sem)
    }

    fn release(&mut self, device: &ash::Device) {
        unsafe {
            for fence in self.fence_free.drain(..).chain(self.fences_in_flight.drain(..)) {
                device.destroy_fence(fence, None);
            }
            for sem in self.semaphores.drain(..) {
                device.destroy_semaphore(sem, None);
            }
            device.destroy_command_pool(self.pool, None);
        }
    }
}

/// One provisioned hardware queue. Recording state is slot-local and only
/// touched by the main thread; the native handle is only touched by the
/// submission thread; the barrier inbox is the bridge between them.
pub(crate) struct Queue {
    pub roles: QueueRole,
    pub family_index: u32,
    handle: vk::Queue,
    contexts: [Mutex<CommandBufferContext>; FRAMES_IN_FLIGHT],
    /// Acquire barriers other queues have routed here, replayed once when the
    /// next command buffer on this queue opens
    inbox: Mutex<Vec<PendingBarrier>>,
    /// Release-side barriers recorded this submit interval, routed to their
    /// destination queue after the submit lands
    outbox: Mutex<Vec<(usize, PendingBarrier)>>,
    /// Roles that must wait on this queue because of cross-queue transfers
    /// recorded since the last submit
    internal_dependents: Mutex<QueueRole>,
    /// Semaphores the next submission on this queue must wait on, signaled by
    /// earlier submissions that declared it a dependent. Must drain to empty
    /// within the frame: a declared dependent that never submits would leave
    /// a signaled semaphore behind, and re-signaling it after the slot's
    /// semaphore bank recycles is invalid.
    pending_waits: Mutex<Vec<vk::Semaphore>>,
}

/// Swapchain semaphores a presenting submission must wire in
#[derive(Clone, Copy)]
pub(crate) struct SwapchainSync {
    pub acquire: vk::Semaphore,
    pub present: vk::Semaphore,
}

/// Everything the submission thread needs for one queue_submit2 call
pub(crate) struct SubmitRequest {
    queue_index: usize,
    cmd_bufs: Vec<vk::CommandBuffer>,
    fence: vk::Fence,
    /// One signal semaphore per dependent queue; a binary semaphore may only
    /// be waited by a single submission, so dependents never share one
    signals: Vec<(usize, vk::Semaphore)>,
    barriers: Vec<(usize, PendingBarrier)>,
    swapchain: Option<SwapchainSync>,
}

/// Counts command buffers opened but not yet consumed by the submission
/// thread; end-of-frame waits for it to return to zero before presenting.
pub(crate) struct FrameGate {
    count: Mutex<i64>,
    cond: Condvar,
}

impl FrameGate {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn raise(&self, n: i64) {
        *self.count.lock() += n;
    }

    pub(crate) fn lower(&self, n: i64) {
        let mut count = self.count.lock();
        *count -= n;
        if *count <= 0 {
            self.cond.notify_all();
        }
    }

    /// Wait for all raised work to be consumed. Returns false on timeout.
    pub(crate) fn wait_baseline(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        let deadline = Instant::now() + timeout;
        while *count > 0 {
            if self.cond.wait_until(&mut count, deadline).timed_out() {
                return *count <= 0;
            }
        }
        true
    }
}

/// Ticket for one open command buffer. Carries the manager generation at
/// acquisition; a later begin_frame invalidates it.
#[derive(Clone, Copy)]
pub(crate) struct RecordingToken {
    pub cmd: vk::CommandBuffer,
    pub queue_index: usize,
    pub generation: u32,
}

const FENCE_WAIT_SLICE: u64 = 1_000_000_000; // 1s, in ns
const FENCE_WAIT_RETRIES: u32 = 8;

pub(crate) struct QueueManager {
    device: ash::Device,
    queues: Arc<Vec<Queue>>,
    generation: AtomicU32,
    frame_slot: AtomicUsize,
    sender: Option<Sender<SubmitRequest>>,
    thread: Option<JoinHandle<()>>,
    pub gate: Arc<FrameGate>,
    fatal: Arc<AtomicBool>,
}

impl QueueManager {
    pub fn new(ctx: &DeviceContext, plans: &[QueuePlan]) -> Result<Self> {
        let device = ctx.device.clone();

        let mut queues = Vec::with_capacity(plans.len());
        for plan in plans {
            let handle = unsafe { device.get_device_queue(plan.family_index, plan.queue_index) };
            log::info!(
                "Queue {:?} on family {} index {}",
                plan.roles,
                plan.family_index,
                plan.queue_index
            );
            queues.push(Queue {
                roles: plan.roles,
                family_index: plan.family_index,
                handle,
                contexts: [
                    Mutex::new(CommandBufferContext::new(&device, plan.family_index)?),
                    Mutex::new(CommandBufferContext::new(&device, plan.family_index)?),
                ],
                inbox: Mutex::new(Vec::new()),
                outbox: Mutex::new(Vec::new()),
                internal_dependents: Mutex::new(QueueRole::empty()),
                pending_waits: Mutex::new(Vec::new()),
            });
        }

        let queues = Arc::new(queues);
        let gate = Arc::new(FrameGate::new());
        let fatal = Arc::new(AtomicBool::new(false));

        let (sender, receiver) = bounded::<SubmitRequest>(64);
        let thread = {
            let device = device.clone();
            let queues = Arc::clone(&queues);
            let gate = Arc::clone(&gate);
            let fatal = Arc::clone(&fatal);
            std::thread::Builder::new()
                .name("gfx-submit".into())
                .spawn(move || submission_loop(device, queues, receiver, gate, fatal))
                .context("Failed to spawn submission thread")?
        };

        Ok(Self {
            device,
            queues,
            generation: AtomicU32::new(0),
            frame_slot: AtomicUsize::new(0),
            sender: Some(sender),
            thread: Some(thread),
            gate,
            fatal,
        })
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Relaxed)
    }

    pub fn frame_slot(&self) -> usize {
        self.frame_slot.load(Ordering::Relaxed)
    }

    pub fn fatal(&self) -> bool {
        self.fatal.load(Ordering::Relaxed)
    }

    pub(crate) fn queue_index(&self, role: QueueRole) -> usize {
        self.queues
            .iter()
            .position(|q| q.roles.contains(role))
            .unwrap_or_else(|| panic!("No queue provisioned for role {:?}", role))
    }

    pub(crate) fn queue_family(&self, index: usize) -> u32 {
        self.queues[index].family_index
    }

    /// Native handle for presentation. Only safe to touch from the main
    /// thread after the frame gate has drained, so no submit is in flight.
    pub(crate) fn queue_handle(&self, role: QueueRole) -> vk::Queue {
        self.queues[self.queue_index(role)].handle
    }

    /// Record a release-side barrier now and route the matching acquire to the
    /// destination queue's inbox (delivered after this queue's next submit).
    pub(crate) fn route_barrier(&self, from: usize, to: usize, barrier: PendingBarrier) {
        self.queues[from].outbox.lock().push((to, barrier));
        *self.queues[from].internal_dependents.lock() |= self.queues[to].roles;
    }

    /// Open a command buffer on the queue serving `role`. Replays any pending
    /// cross-queue acquire barriers before handing the buffer out.
    pub(crate) fn begin_command_buffer(&self, role: QueueRole) -> Result<RecordingToken> {
        let queue_index = self.queue_index(role);
        let queue = &self.queues[queue_index];
        let slot = self.frame_slot();
        let mut ctx = queue.contexts[slot].lock();

        let cmd = match ctx.free.pop() {
            Some(cmd) => cmd,
            None => {
                let alloc = vk::CommandBufferAllocateInfo::builder()
                    .command_pool(ctx.pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1);
                unsafe { self.device.allocate_command_buffers(&alloc) }
                    .context("Failed to allocate command buffer")?[0]
            }
        };

        let begin = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cmd, &begin) }
            .context("Failed to begin command buffer")?;

        // Drained exactly once; a barrier replayed here was released by the
        // producing queue before its submit signaled us
        for barrier in queue.inbox.lock().drain(..) {
            barrier.record(&self.device, cmd);
        }

        ctx.active.push(cmd);
        self.gate.raise(1);

        Ok(RecordingToken {
            cmd,
            queue_index,
            generation: self.generation(),
        })
    }

    pub(crate) fn end_command_buffer(&self, token: RecordingToken) -> Result<()> {
        assert_eq!(
            token.generation,
            self.generation(),
            "Command buffer outlived its frame slot (recorded in generation {}, now {})",
            token.generation,
            self.generation()
        );
        unsafe { self.device.end_command_buffer(token.cmd) }
            .context("Failed to end command buffer")
    }

    /// Capture every buffer recorded since the previous submit on this role's
    /// queue and hand the batch to the submission thread. Returns immediately;
    /// completion is only observable through the next frame's fence wait.
    ///
    /// Every role named in `dependents` must itself submit later in the same
    /// frame; the dependency semaphore it consumes is wired at its submit,
    /// and an unconsumed one is asserted at the next frame boundary.
    pub(crate) fn submit_queue(
        &self,
        role: QueueRole,
        dependents: QueueRole,
        swapchain: Option<SwapchainSync>,
    ) -> Result<()> {
        let queue_index = self.queue_index(role);
        let queue = &self.queues[queue_index];
        let slot = self.frame_slot();
        let mut ctx = queue.contexts[slot].lock();

        let cmd_bufs: Vec<vk::CommandBuffer> = ctx.active[ctx.cursor..].to_vec();
        ctx.cursor = ctx.active.len();

        let deps = dependents | std::mem::replace(&mut *queue.internal_dependents.lock(), QueueRole::empty());
        let barriers: Vec<(usize, PendingBarrier)> = queue.outbox.lock().drain(..).collect();

        if cmd_bufs.is_empty() && barriers.is_empty() && swapchain.is_none() {
            return Ok(());
        }

        let fence = ctx.next_fence(&self.device)?;
        ctx.fences_in_flight.push(fence);

        let mut signals = Vec::new();
        for (i, q) in self.queues.iter().enumerate() {
            if i != queue_index && q.roles.intersects(deps) {
                signals.push((i, ctx.next_semaphore(&self.device)?));
            }
        }
        drop(ctx);

        let request = SubmitRequest {
            queue_index,
            cmd_bufs,
            fence,
            signals,
            barriers,
            swapchain,
        };

        match &self.sender {
            Some(sender) => sender
                .send(request)
                .map_err(|_| anyhow::anyhow!("Submission thread is gone")),
            None => bail!("Queue manager already released"),
        }
    }

    /// Start a new frame slot: wait out the slot's previous fences, recycle
    /// its pools and semaphores, then reset its transient arena.
    pub fn begin_frame(&self, mem: &DeviceMemoryManager) -> Result<usize> {
        // The submission thread is idle here (the previous end-of-frame
        // drained the gate), so the pending lists are stable to read
        let wait_counts: Vec<usize> = self
            .queues
            .iter()
            .map(|q| q.pending_waits.lock().len())
            .collect();
        if let Some(index) = unconsumed_waits(&wait_counts) {
            panic!(
                "Queue {:?} was declared a dependent last frame but never submitted; \
                 its dependency semaphore was left signaled",
                self.queues[index].roles
            );
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let slot = generation as usize % FRAMES_IN_FLIGHT;

        for queue in self.queues.iter() {
            let mut ctx = queue.contexts[slot].lock();
            if !ctx.fences_in_flight.is_empty() {
                self.wait_slot_fences(&ctx.fences_in_flight)?;
                unsafe { self.device.reset_fences(&ctx.fences_in_flight) }
                    .context("Failed to reset frame fences")?;
                let recycled: Vec<vk::Fence> = ctx.fences_in_flight.drain(..).collect();
                ctx.fence_free.extend(recycled);
            }
            unsafe {
                self.device
                    .reset_command_pool(ctx.pool, vk::CommandPoolResetFlags::empty())
            }
            .context("Failed to reset command pool")?;
            let done: Vec<vk::CommandBuffer> = ctx.active.drain(..).collect();
            ctx.free.extend(done);
            ctx.cursor = 0;
            ctx.sem_cursor = 0;
        }

        mem.reset_transient(slot);
        self.frame_slot.store(slot, Ordering::Relaxed);
        Ok(slot)
    }

    /// Bounded, retried fence wait. A timeout is never success; running out
    /// of retries is reported as a lost device.
    fn wait_slot_fences(&self, fences: &[vk::Fence]) -> Result<()> {
        for _ in 0..FENCE_WAIT_RETRIES {
            match unsafe { self.device.wait_for_fences(fences, true, FENCE_WAIT_SLICE) } {
                Ok(()) => return Ok(()),
                Err(vk::Result::TIMEOUT) => {
                    log::warn!("Frame fence wait exceeded {}ms, retrying", FENCE_WAIT_SLICE / 1_000_000);
                }
                Err(err) => return Err(err).context("Frame fence wait failed"),
            }
        }
        bail!("Frame fences never signaled, device presumed lost")
    }

    /// Stop the submission thread and destroy all native queue state. The
    /// caller has already waited the device idle.
    pub fn release(&mut self) {
        self.sender.take(); // closes the channel, ends the loop
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        for queue in self.queues.iter() {
            for ctx in &queue.contexts {
                ctx.lock().release(&self.device);
            }
        }
    }
}

/// Queues with dependency waits nobody consumed, checked at the frame
/// boundary. Any entry means a declared dependent skipped its submit.
fn unconsumed_waits(counts: &[usize]) -> Option<usize> {
    counts.iter().position(|&n| n > 0)
}

/// Body of the submission thread. Dependency semaphores travel through the
/// per-queue pending-wait lists: a submission that declares dependents pushes
/// one signaled semaphore per dependent, and each dependent's next submission
/// drains its list into that submit's wait set.
fn submission_loop(
    device: ash::Device,
    queues: Arc<Vec<Queue>>,
    receiver: Receiver<SubmitRequest>,
    gate: Arc<FrameGate>,
    fatal: Arc<AtomicBool>,
) {
    while let Ok(req) = receiver.recv() {
        let mut wait_infos: Vec<vk::SemaphoreSubmitInfo> = queues[req.queue_index]
            .pending_waits
            .lock()
            .drain(..)
            .map(|sem| {
                vk::SemaphoreSubmitInfo::builder()
                    .semaphore(sem)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                    .build()
            })
            .collect();
        let mut signal_infos: Vec<vk::SemaphoreSubmitInfo> = req
            .signals
            .iter()
            .map(|&(_, sem)| {
                vk::SemaphoreSubmitInfo::builder()
                    .semaphore(sem)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                    .build()
            })
            .collect();
        if let Some(sc) = &req.swapchain {
            wait_infos.push(
                vk::SemaphoreSubmitInfo::builder()
                    .semaphore(sc.acquire)
                    .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
                    .build(),
            );
            signal_infos.push(
                vk::SemaphoreSubmitInfo::builder()
                    .semaphore(sc.present)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                    .build(),
            );
        }

        let cb_infos: Vec<vk::CommandBufferSubmitInfo> = req
            .cmd_bufs
            .iter()
            .map(|&cmd| vk::CommandBufferSubmitInfo::builder().command_buffer(cmd).build())
            .collect();

        let submit = vk::SubmitInfo2::builder()
            .wait_semaphore_infos(&wait_infos)
            .command_buffer_infos(&cb_infos)
            .signal_semaphore_infos(&signal_infos)
            .build();

        let result = unsafe {
            device.queue_submit2(queues[req.queue_index].handle, &[submit], req.fence)
        };
        match result {
            Ok(()) => {
                for &(dep, sem) in &req.signals {
                    queues[dep].pending_waits.lock().push(sem);
                }
                for (dest, barrier) in req.barriers {
                    queues[dest].inbox.lock().push(barrier);
                }
            }
            Err(err) => {
                log::error!("Queue submit failed: {err}");
                fatal.store(true, Ordering::Relaxed);
            }
        }

        gate.lower(req.cmd_bufs.len() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(flags: vk::QueueFlags, count: u32, present: bool) -> FamilyCaps {
        FamilyCaps {
            flags,
            queue_count: count,
            present,
        }
    }

    #[test]
    fn discrete_layout_gets_three_dedicated_queues() {
        // Typical discrete GPU: all-purpose family, compute family, transfer family
        let families = [
            caps(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                2,
                true,
            ),
            caps(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 2, false),
            caps(vk::QueueFlags::TRANSFER, 1, false),
        ];
        let plans = plan_queues(&families).unwrap();
        assert_eq!(plans.len(), 3);
        assert_eq!(plans[0].roles, QueueRole::GRAPHICS | QueueRole::PRESENT);
        assert_eq!(plans[0].family_index, 0);
        assert_eq!(plans[1].roles, QueueRole::COMPUTE);
        assert_eq!(plans[1].family_index, 1);
        assert_eq!(plans[2].roles, QueueRole::TRANSFER);
        assert_eq!(plans[2].family_index, 2); // dedicated beats shared
    }

    #[test]
    fn single_family_folds_every_role_into_graphics() {
        let families = [caps(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            1,
            true,
        )];
        let plans = plan_queues(&families).unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].roles, QueueRole::all());
        assert_eq!(plans[0].queue_index, 0);
    }

    #[test]
    fn spare_queue_in_shared_family_is_claimed_before_folding() {
        // Two queues in one do-everything family: compute gets the second,
        // transfer has nothing left and folds
        let families = [caps(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            2,
            true,
        )];
        let plans = plan_queues(&families).unwrap();
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[1].roles, QueueRole::COMPUTE);
        assert_eq!(plans[1].queue_index, 1);
        assert!(plans[0].roles.contains(QueueRole::TRANSFER));
    }

    #[test]
    fn no_present_capable_family_is_fatal() {
        let families = [caps(vk::QueueFlags::GRAPHICS, 1, false)];
        assert!(plan_queues(&families).is_err());
    }

    #[test]
    fn gate_balances_across_threads() {
        let gate = Arc::new(FrameGate::new());
        gate.raise(3);
        let remote = Arc::clone(&gate);
        let worker = std::thread::spawn(move || {
            for _ in 0..3 {
                remote.lower(1);
            }
        });
        assert!(gate.wait_baseline(Duration::from_secs(5)));
        worker.join().unwrap();
    }

    #[test]
    fn gate_times_out_when_work_is_stuck() {
        let gate = FrameGate::new();
        gate.raise(1);
        assert!(!gate.wait_baseline(Duration::from_millis(20)));
    }

    #[test]
    fn drained_wait_lists_pass_the_frame_boundary() {
        assert_eq!(unconsumed_waits(&[0, 0, 0]), None);
        assert_eq!(unconsumed_waits(&[]), None);
    }

    #[test]
    fn dependent_that_skipped_its_submit_is_caught() {
        // A transfer submit declared graphics a dependent, graphics never
        // submitted: its wait list still holds the signaled semaphore
        assert_eq!(unconsumed_waits(&[0, 1]), Some(1));
        assert_eq!(unconsumed_waits(&[2, 0, 1]), Some(0));
    }
}
