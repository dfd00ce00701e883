// Offline checks for the parts of the backend that need no GPU: queue role
// planning over synthetic family layouts and handle-table lifecycles.

use ash::vk;
use gfx_backend::handle::HandlePool;
use gfx_backend::queue::{family_caps, plan_queues, QueueRole};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn family(flags: vk::QueueFlags, queue_count: u32) -> vk::QueueFamilyProperties {
    vk::QueueFamilyProperties {
        queue_flags: flags,
        queue_count,
        ..Default::default()
    }
}

#[test]
fn desktop_gpu_layout_provisions_all_roles() {
    init_logging();
    // Family layout of a common discrete desktop part
    let families = [
        family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            16,
        ),
        family(vk::QueueFlags::TRANSFER, 2),
        family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 8),
    ];
    let caps = family_caps(&families, &[true, false, false]);
    let plans = plan_queues(&caps).unwrap();

    let all: QueueRole = plans.iter().map(|p| p.roles).fold(QueueRole::empty(), |a, r| a | r);
    assert_eq!(all, QueueRole::all());
    // Transfer lands on the dedicated copy-engine family
    let transfer = plans.iter().find(|p| p.roles == QueueRole::TRANSFER).unwrap();
    assert_eq!(transfer.family_index, 1);
    // No two plans share a (family, queue) pair
    for (i, a) in plans.iter().enumerate() {
        for b in &plans[i + 1..] {
            assert!(a.family_index != b.family_index || a.queue_index != b.queue_index);
        }
    }
}

#[test]
fn integrated_gpu_layout_still_covers_every_role() {
    init_logging();
    let families = [family(
        vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        1,
    )];
    let caps = family_caps(&families, &[true]);
    let plans = plan_queues(&caps).unwrap();

    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].roles, QueueRole::all());
}

#[test]
fn handle_lifecycle_across_create_destroy_sequences() {
    init_logging();
    let mut pool: HandlePool<&'static str> = HandlePool::new();

    let a = pool.add("first");
    let b = pool.add("second");
    assert_eq!(pool.get(a), Some(&"first"));

    pool.remove(a);
    assert_eq!(pool.get(a), None, "destroyed handle must die immediately");
    assert_eq!(pool.get(b), Some(&"second"));

    // The slot is reused but the old handle stays dead
    let c = pool.add("third");
    assert_eq!(pool.get(a), None);
    assert_eq!(pool.get(c), Some(&"third"));
}
