//! Control-plane behavior through the public surface, driven on the
//! simulated chipset.

use agpgart_rs::backend::MemoryType;
use agpgart_rs::backend::sim::SimBackend;
use agpgart_rs::{GartConfig, GartDevice, GartError, Protection, Segment};
use std::sync::Arc;
use std::thread;

const CONTROLLER: u32 = 100;

fn device() -> GartDevice {
    GartDevice::new(Box::new(SimBackend::new()), GartConfig::default()).unwrap()
}

#[test]
fn full_allocate_bind_release_cycle() {
    let device = device();

    device.acquire(CONTROLLER, true).unwrap();

    let first = device.allocate(CONTROLLER, 4, MemoryType::Generic).unwrap();
    assert_eq!(first.page_count, 4);
    device.bind(CONTROLLER, first.key, 0).unwrap();

    let second = device.allocate(CONTROLLER, 4, MemoryType::Generic).unwrap();
    assert_ne!(second.key, first.key);

    // The first block holds [0, 4).
    assert_eq!(
        device.bind(CONTROLLER, second.key, 0).unwrap_err(),
        GartError::Occupied
    );
    device.bind(CONTROLLER, second.key, 4).unwrap();

    device.unbind(CONTROLLER, first.key).unwrap();

    // The second block is bound at [4, 8); asking it to bind again still
    // fails even though [0, 4) is free now.
    assert_eq!(
        device.bind(CONTROLLER, second.key, 0).unwrap_err(),
        GartError::Occupied
    );

    // [0, 4) really is free again: a fresh block can claim it.
    let third = device.allocate(CONTROLLER, 4, MemoryType::Generic).unwrap();
    device.bind(CONTROLLER, third.key, 0).unwrap();
    assert_eq!(device.info().current_pages, 12);

    device.release(CONTROLLER).unwrap();
    device.detach(CONTROLLER);

    // Teardown freed every block; the aperture is fully available to the
    // next controller.
    device.acquire(CONTROLLER + 1, true).unwrap();
    assert_eq!(device.info().current_pages, 0);
    let fresh = device
        .allocate(CONTROLLER + 1, 12, MemoryType::Generic)
        .unwrap();
    device.bind(CONTROLLER + 1, fresh.key, 0).unwrap();
}

#[test]
fn only_one_controller_at_a_time() {
    let device = Arc::new(device());

    let handles: Vec<_> = [1u32, 2u32]
        .into_iter()
        .map(|pid| {
            let device = Arc::clone(&device);
            thread::spawn(move || device.acquire(pid, true))
        })
        .collect();
    let results: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    let wins = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1);
    assert!(results.contains(&Err(GartError::Busy)));

    // After the winner releases, a third pid can take over.
    let winner = if results[0].is_ok() { 1 } else { 2 };
    device.release(winner).unwrap();
    device.acquire(3, true).unwrap();
}

#[test]
fn acquire_requires_privilege() {
    let device = device();
    assert_eq!(
        device.acquire(CONTROLLER, false).unwrap_err(),
        GartError::PermissionDenied
    );
    device.acquire(CONTROLLER, true).unwrap();
}

#[test]
fn release_requires_ownership() {
    let device = device();
    device.acquire(CONTROLLER, true).unwrap();
    assert_eq!(device.release(999).unwrap_err(), GartError::NotOwner);
    device.release(CONTROLLER).unwrap();
}

#[test]
fn operations_require_a_current_controller() {
    let device = device();
    assert_eq!(
        device
            .allocate(CONTROLLER, 1, MemoryType::Generic)
            .unwrap_err(),
        GartError::NotOwner
    );
    device.acquire(CONTROLLER, true).unwrap();
    let block = device.allocate(CONTROLLER, 1, MemoryType::Generic).unwrap();
    device.release(CONTROLLER).unwrap();

    // With the hardware released the pool still exists but is not
    // reachable through the control plane.
    assert_eq!(
        device.deallocate(CONTROLLER, block.key).unwrap_err(),
        GartError::NotOwner
    );
}

#[test]
fn deallocate_rejects_dead_keys() {
    let device = device();
    device.acquire(CONTROLLER, true).unwrap();

    let block = device.allocate(CONTROLLER, 2, MemoryType::Generic).unwrap();
    device.deallocate(CONTROLLER, block.key).unwrap();
    assert_eq!(
        device.deallocate(CONTROLLER, block.key).unwrap_err(),
        GartError::InvalidKey(block.key)
    );
    assert_eq!(
        device.bind(CONTROLLER, block.key, 0).unwrap_err(),
        GartError::InvalidKey(block.key)
    );
}

#[test]
fn detach_frees_everything_implicitly() {
    let device = device();
    device.acquire(CONTROLLER, true).unwrap();

    let a = device.allocate(CONTROLLER, 8, MemoryType::Generic).unwrap();
    let b = device.allocate(CONTROLLER, 8, MemoryType::Generic).unwrap();
    device.bind(CONTROLLER, a.key, 0).unwrap();
    device.bind(CONTROLLER, b.key, 8).unwrap();
    assert_eq!(device.info().current_pages, 16);

    // No explicit unbind or deallocate: teardown handles bound blocks.
    device.detach(CONTROLLER);
    assert_eq!(device.info().current_pages, 0);
}

#[test]
fn ceiling_follows_installed_ram() {
    let config = GartConfig {
        system_memory_mb: 64,
        ..GartConfig::default()
    };
    let device = GartDevice::new(Box::new(SimBackend::new()), config).unwrap();

    // The 64 MiB breakpoint maps to exactly 28 MiB of aperture memory.
    assert_eq!(device.info().max_pages, 28 << 8);
}

#[test]
fn client_mmap_authorization_is_exact_match() {
    let device = device();
    let rw = Protection::READ | Protection::WRITE;
    let client = 200;

    device.acquire(CONTROLLER, true).unwrap();
    device
        .reserve(CONTROLLER, client, vec![Segment::new(0, 16, rw)])
        .unwrap();

    let native = device.authorize_mmap(client, 0, 16, rw).unwrap();
    assert_eq!(native, libc::PROT_READ | libc::PROT_WRITE);

    // A strict subset of the reservation is refused, by policy.
    assert_eq!(
        device.authorize_mmap(client, 0, 8, rw).unwrap_err(),
        GartError::NotFound
    );

    // Authorization dies with the controller's hardware ownership.
    device.release(CONTROLLER).unwrap();
    assert_eq!(
        device.authorize_mmap(client, 0, 16, rw).unwrap_err(),
        GartError::PermissionDenied
    );
}

#[test]
fn controller_mmap_is_range_checked_only() {
    let device = device();
    let rw = Protection::READ | Protection::WRITE;

    device.acquire(CONTROLLER, true).unwrap();
    device.authorize_mmap(CONTROLLER, 0, 1024, rw).unwrap();

    let pages = (device.info().aperture_size_mb as usize) << 8;
    assert_eq!(
        device
            .authorize_mmap(CONTROLLER, pages - 1, 2, rw)
            .unwrap_err(),
        GartError::InvalidRange
    );
}

#[test]
fn shut_down_with_live_state() {
    let device = device();
    device.acquire(CONTROLLER, true).unwrap();
    let block = device.allocate(CONTROLLER, 4, MemoryType::Generic).unwrap();
    device.bind(CONTROLLER, block.key, 0).unwrap();

    // Full teardown while a controller holds bound memory.
    device.shut_down();
}
