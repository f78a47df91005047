use agpgart_rs::backend::sim::SimBackend;
use agpgart_rs::{GartConfig, GartDevice, GartError, Protection, Segment};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("============================================================");
    println!("        AGP GART Manager - Session Model Walkthrough        ");
    println!("============================================================");

    let controller = std::process::id();
    let client = controller + 1;
    let rw = Protection::READ | Protection::WRITE;

    let device = GartDevice::new(Box::new(SimBackend::new()), GartConfig::default())?;

    // 1. Exclusive acquisition
    println!("[+] pid {controller} acquires the hardware...");
    device.acquire(controller, true)?;

    match device.acquire(controller + 99, true) {
        Err(GartError::Busy) => println!("    A second acquire observes Busy, as it must."),
        other => println!("    Unexpected: {other:?}"),
    }

    // 2. Reserve an aperture sub-range for a client
    println!("[+] Reserving pages [0, 64) read/write for client pid {client}...");
    device.reserve(controller, client, vec![Segment::new(0, 64, rw)])?;

    // 3. Authorization is exact-match only
    let native = device.authorize_mmap(client, 0, 64, rw)?;
    println!("    Exact request authorized (native prot {native:#x}).");

    match device.authorize_mmap(client, 0, 32, rw) {
        Err(GartError::NotFound) => {
            println!("    A subset of the reservation is refused: exact match only.");
        }
        other => println!("    Unexpected: {other:?}"),
    }

    // 4. Release drops authorization but keeps the records
    println!("[+] Controller releases the hardware...");
    device.release(controller)?;
    match device.authorize_mmap(client, 0, 64, rw) {
        Err(GartError::PermissionDenied) => {
            println!("    Client authorization lapsed with the release.");
        }
        other => println!("    Unexpected: {other:?}"),
    }

    // 5. Re-acquiring revives the surviving client record
    println!("[+] Controller re-acquires...");
    device.acquire(controller, true)?;
    device.authorize_mmap(client, 0, 64, rw)?;
    println!("    Client is authorized again without a new reserve call.");

    device.release(controller)?;
    device.detach(controller);
    device.shut_down();

    println!("[+] Done.");
    Ok(())
}
