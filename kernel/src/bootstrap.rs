//! Bootstrap task.
//!
//! The kernel entry point composes the memory and interrupt subsystems,
//! then transfers control here on a freshly allocated kernel stack. The
//! bootstrap task finishes bringing the system up -- syscalls, the ramdisk,
//! the message bus, PS/2 -- spawns the initial services, and exits. From
//! then on the system is event-driven.

use crate::{amc, drivers::ps2, elf, initrd, sched, syscall};

/// Initial services, spawned from the initrd in this order. The file
/// manager must come up first: the window manager and input drivers open
/// their binaries through it.
const INITIAL_SERVICES: [&str; 4] = ["file_manager", "awm", "kb_driver", "mouse_driver"];

/// Entry point of the bootstrap task.
pub extern "C" fn bootstrap_entry(_arg: usize) -> ! {
    log::info!("bootstrap: running on its own stack");

    syscall::init();
    initrd::init().expect("initrd is malformed");
    amc::init();
    ps2::init();

    sched::spawn_kernel_task("reaper", sched::reaper_entry, 0);

    for name in INITIAL_SERVICES {
        let image = initrd::file_named(name)
            .unwrap_or_else(|| panic!("initrd is missing initial service {name}"));
        elf::spawn_from_buffer(name, image, &[name])
            .unwrap_or_else(|e| panic!("failed to load initial service {name}: {e}"));
    }

    log::info!("bootstrap: initial services spawned, exiting");
    sched::exit_current(0)
}
