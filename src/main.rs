//! Entry point binary. The bootloader (out of scope for this crate) is
//! expected to set up long mode, a stack, and identity/higher-half paging,
//! then hand control to `_start` with a pointer to a populated
//! `kcore::boot::BootInfo`.
#![no_std]
#![no_main]

use core::panic::PanicInfo;

use kcore::boot::{BootConfig, BootInfo};
use kcore::{arch, event, init, mm, sched};

/// Conservative placeholder for the kernel image's own footprint in the
/// kernel address space. `BootInfo` carries where the image was loaded
/// (`kernel_phys_base`) but not how big it is -- that number comes from a
/// linker script this crate doesn't own. 16 MiB comfortably covers this
/// crate's own code and static data with room to grow before a real
/// `_kernel_end` symbol replaces this.
const KERNEL_IMAGE_RESERVATION: u64 = 16 * 1024 * 1024;

#[no_mangle]
pub extern "C" fn _start(boot_info: *const BootInfo) -> ! {
    // Safety: the bootloader contract is that this pointer is valid and
    // the structure it points to outlives this call.
    let boot_info = unsafe { &*boot_info };

    unsafe {
        arch::x86_64::arch_early_init().expect("arch_early_init failed");
        mm::heap::init();
    }

    // No loader-supplied config reaches `_start` yet (the INI parser belongs
    // to the bootloader), so this runs with the defaults until a real
    // handoff path threads a parsed `BootConfig` through.
    init::apply_boot_config(&BootConfig::default());

    mm::frame_alloc::init(boot_info);
    mm::vmalloc::init(boot_info.kernel_phys_base, KERNEL_IMAGE_RESERVATION).expect("vmalloc::init failed");
    mm::heap::mark_vmalloc_ready();

    event::register_builtin_filters();
    sched::init_cpu(0);

    kcore::info!("{}", kcore::lib::build_info::version_string());
    kcore::info!("kcore: core subsystems online, entering idle loop");

    arch::x86_64::enable_interrupts();
    arch::x86_64::halt_loop();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    kcore::lib::panic::panic_handler(info)
}
