use agpgart_rs::backend::sim::{SIM_FIXED_PHYS, SimBackend};
use agpgart_rs::backend::{AgpMode, MemoryType};
use agpgart_rs::{GartConfig, GartDevice};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("============================================================");
    println!("        AGP GART Manager - Allocate/Bind Walkthrough        ");
    println!("============================================================");

    let pid = std::process::id();

    // 1. Bring the device up on the simulated chipset
    println!("[+] Bringing up the GART on the simulated chipset...");
    let device = GartDevice::new(Box::new(SimBackend::new()), GartConfig::default())?;

    let info = device.info();
    println!(
        "    Interface {}.{}, aperture {} MiB at {:#x}",
        info.version.0, info.version.1, info.aperture_size_mb, info.aperture_base
    );
    println!(
        "    Pages: {} in use / {} max",
        info.current_pages, info.max_pages
    );

    // 2. Become the controller and enable a transfer mode
    println!("[+] Acquiring the hardware (pid {pid})...");
    device.acquire(pid, true)?;
    device.setup(pid, AgpMode::all())?;
    println!("    Negotiated mode: {:?}", device.info().mode);

    // 3. Allocate and bind a generic block
    println!("[+] Allocating 16 generic pages...");
    let block = device.allocate(pid, 16, MemoryType::Generic)?;
    println!("    key={}, first page at {:#x}", block.key, block.physical);

    println!("[+] Binding at aperture page 0...");
    device.bind(pid, block.key, 0)?;

    // 4. A vendor-type allocation alongside it
    println!("[+] Allocating one fixed-physical page...");
    let fixed = device.allocate(pid, 1, SIM_FIXED_PHYS)?;
    println!("    key={}, physical {:#x}", fixed.key, fixed.physical);
    device.bind(pid, fixed.key, 16)?;

    println!("    Pages in use: {}", device.info().current_pages);

    // 5. Unwind everything
    println!("[+] Unbinding and freeing...");
    device.unbind(pid, block.key)?;
    device.deallocate(pid, block.key)?;
    device.unbind(pid, fixed.key)?;
    device.deallocate(pid, fixed.key)?;

    device.release(pid)?;
    device.detach(pid);
    device.shut_down();

    println!("[+] Done.");
    Ok(())
}
