//! Kernel entry point, called by the boot stage in 32-bit protected mode.
//!
//! The boot stage loads the image at 1 MiB, collects the firmware memory map
//! and jumps to `KernelMain` with a pointer to [`BootParameters`].

#![no_std]
#![no_main]

use core::sync::atomic::{AtomicU32, Ordering};

use kcore_kernel::arch::{cpu, interrupts};
use kcore_kernel::config::KernelConfig;
use kcore_kernel::drivers::serial;
use kcore_kernel::logging;
use kcore_kernel::memory::bootinfo::MemoryMapEntry;
use kcore_kernel::memory::manager::{self, BootInfo};
use kcore_kernel::memory::{AddressSpaceId, IdentityMapper, MemoryManager, PhysAddr};
use kcore_kernel::scheduler::{self, TaskId, DEFAULT_PRIORITY};

/// Handed over by the boot stage.
#[repr(C)]
pub struct BootParameters {
    pub memory_map: *const MemoryMapEntry,
    pub memory_map_len: u32,
    pub kernel_end: u32,
    pub command_line: *const u8,
    pub command_line_len: u32,
}

const DEMO_WORKERS: usize = 3;
const WORKER_ROUNDS: u32 = 50;

/// Incremented by every demo worker on every round.
static SHARED_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Kernel entry point.
///
/// # Safety
/// `params` must point to a valid [`BootParameters`] whose slices stay
/// untouched until the frame allocator is populated.
#[no_mangle]
#[link_section = ".text.boot"]
pub unsafe extern "C" fn KernelMain(params: *const BootParameters) -> ! {
    serial::init();

    // SAFETY: the boot stage passes a valid parameter block.
    let params = unsafe { &*params };
    // SAFETY: both ranges are owned by the boot stage and live below 1 MiB.
    let (memory_map, command_line) = unsafe {
        (
            core::slice::from_raw_parts(params.memory_map, params.memory_map_len as usize),
            core::slice::from_raw_parts(params.command_line, params.command_line_len as usize),
        )
    };
    let command_line = core::str::from_utf8(command_line).unwrap_or("");

    let (config, rejected) = KernelConfig::parse(command_line);
    logging::init(&config.log);
    log::info!(target: "boot", "kernel core starting, command line '{}'", command_line);
    for (word, err) in rejected.iter() {
        log::warn!(target: "boot", "ignoring '{}': {}", word, err);
    }
    if rejected.dropped() > 0 {
        log::warn!(target: "boot", "{} more words ignored", rejected.dropped());
    }

    interrupts::init();

    let info = BootInfo {
        memory_map,
        kernel_end: PhysAddr::new(params.kernel_end),
        command_line,
    };
    let memory = match MemoryManager::bootstrap(IdentityMapper, &info, &config.memory, |dir| {
        // SAFETY: the kernel directory identity-maps the running image.
        unsafe { cpu::enable_paging(dir) }
    }) {
        Ok(memory) => memory,
        Err(err) => panic!("memory bootstrap failed: {}", err),
    };
    manager::install(memory);

    scheduler::init(&config.scheduler);
    let mut workers: [Option<TaskId>; DEMO_WORKERS] = [None; DEMO_WORKERS];
    for (index, slot) in workers.iter_mut().enumerate() {
        match scheduler::kernel_thread_create(DEFAULT_PRIORITY, demo_worker, index) {
            Ok(id) => *slot = Some(id),
            Err(err) => log::error!(target: "boot", "worker {} not created: {}", index, err),
        }
    }

    let (free_frames, heap_pages) = manager::with_memory(|mm| {
        (mm.free_frames(), mm.heap_pages_in_use(AddressSpaceId::KERNEL))
    });
    log::info!(
        target: "boot",
        "{} free frames, {} heap pages, {} tasks",
        free_frames,
        heap_pages,
        scheduler::task_count()
    );

    if let Err(err) = scheduler::start(config.timer_hz) {
        panic!("timer registration failed: {}", err);
    }
    interrupts::enable();

    idle_loop(&mut workers)
}

/// Boot context after start-up: halts between interrupts and reaps workers.
fn idle_loop(workers: &mut [Option<TaskId>]) -> ! {
    loop {
        cpu::halt();
        for slot in workers.iter_mut() {
            let Some(id) = *slot else {
                continue;
            };
            if let Ok(code) = scheduler::kernel_thread_wait(id) {
                log::info!(
                    target: "boot",
                    "worker {:?} exited with {}, counter at {}",
                    id,
                    code,
                    SHARED_COUNTER.load(Ordering::Relaxed)
                );
                *slot = None;
            }
        }
    }
}

extern "C" fn demo_worker(index: usize) {
    for _ in 0..WORKER_ROUNDS {
        SHARED_COUNTER.fetch_add(1, Ordering::Relaxed);
        cpu::halt();
    }
    scheduler::kernel_thread_exit(index as i32)
}
