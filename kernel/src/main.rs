//! Helios kernel binary entry point.

#![no_std]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(target_os = "none")]
mod boot {
    use bootloader_api::{config::Mapping, entry_point, BootInfo, BootloaderConfig};
    use helios_kernel::{arch, logger, mm, sched, serial_println};

    /// Request the higher-half direct map of all physical memory from the
    /// bootloader; the address-space manager depends on it for every page
    /// table walk.
    pub static BOOTLOADER_CONFIG: BootloaderConfig = {
        let mut config = BootloaderConfig::new_default();
        config.mappings.physical_memory = Some(Mapping::Dynamic);
        config
    };

    entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

    fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
        logger::init();
        log::info!("Helios v{}", env!("CARGO_PKG_VERSION"));

        arch::x86_64::gdt::init();
        arch::x86_64::interrupts::init();

        mm::init(boot_info);

        // Scheduler init programs the tick source and registers slot 0
        // (the idle task) as the boot context.
        sched::init(sched::DEFAULT_QUANTUM_TICKS, sched::SCHED_HZ);

        log::info!("kernel initialized, entering idle loop");
        arch::interrupts::enable();
        sched::run();
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        serial_println!("[KERNEL PANIC] {}", info);
        arch::halt()
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
