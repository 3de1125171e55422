//! Devices command (like clinfo).

use crate::DevicesArgs;
use anyhow::Result;
use hdr_compute::{list_devices, AdapterSummary};

/// Lists every platform and its devices with the indices `--device` takes.
pub fn run(args: DevicesArgs, verbose: bool) -> Result<()> {
    let devices = list_devices(args.class);
    if devices.is_empty() {
        println!("No platforms found.");
        return Ok(());
    }

    let mut platform = None;
    for summary in &devices {
        if platform != Some(summary.platform) {
            println!();
            println!("Platform {}: {}", summary.platform, summary.platform_name);
            platform = Some(summary.platform);
        }
        print_device(summary, verbose);
    }
    println!();
    Ok(())
}

fn print_device(summary: &AdapterSummary, verbose: bool) {
    let info = &summary.info;
    println!("-> Device {}: {} ({:?})", summary.device, info.name, info.device_type);
    if !info.driver.is_empty() {
        println!("     Driver:          {} {}", info.driver, info.driver_info);
    }
    if verbose {
        let limits = &summary.limits;
        println!(
            "     Work-group size: {} (x {} y {})",
            limits.max_compute_invocations_per_workgroup,
            limits.max_compute_workgroup_size_x,
            limits.max_compute_workgroup_size_y
        );
        println!("     Shared memory:   {} bytes", limits.max_compute_workgroup_storage_size);
        println!("     Storage binding: {} bytes", limits.max_storage_buffer_binding_size);
        println!("     Buffer size:     {} bytes", limits.max_buffer_size);
    }
}
