//! Scheduler module facade.
//!
//! [`Scheduler`] is the state object; the free functions here drive the
//! process-wide instance. Lock order is scheduler, then memory. Anything that
//! may grow a scheduler `Vec` runs before the memory lock is taken, because
//! the kernel's global allocator needs that lock itself.

mod roundrobin;
pub mod task;

use crate::arch::context::X86Context;
use crate::arch::interrupts::{self, IrqError, IrqFlags, TIMER_IRQ};
use crate::config::SchedulerConfig;
use crate::memory::manager::{self, with_memory};
use crate::memory::VirtAddr;
use crate::sync::spinlock::SpinLock;

pub use roundrobin::{Scheduler, TaskError};
pub use task::{
    KernelStack, KernelThreadFn, Pid, Task, TaskId, TaskState, WaitAddress, WaitQueues,
    DEFAULT_PRIORITY, KERNEL_STACK_SIZE, MAX_WAIT_ADDRESSES,
};

static SCHEDULER: SpinLock<Option<Scheduler<X86Context>>> = SpinLock::new(None);

fn with_scheduler<R>(
    f: impl FnOnce(&mut Scheduler<X86Context>) -> Result<R, TaskError>,
) -> Result<R, TaskError> {
    let mut guard = SCHEDULER.lock();
    let sched = guard.as_mut().ok_or(TaskError::NotRunning)?;
    f(sched)
}

/// Registers the running boot context as pid 0.
///
/// Requires an installed memory manager; its kernel directory becomes the
/// CR3 of every kernel thread.
pub fn init(config: &SchedulerConfig) {
    let kernel_cr3 = with_memory(|mm| mm.kernel_directory());
    let sched = Scheduler::new(X86Context::new(), kernel_cr3, config);
    let old = SCHEDULER.lock().replace(sched);
    drop(old);
}

/// Hooks the scheduler to the yield vector and the timer line, then starts
/// the PIT.
pub fn start(hz: u32) -> Result<(), IrqError> {
    interrupts::request_vector(interrupts::YIELD_VECTOR, yield_interrupt, "yield")?;
    interrupts::request_irq(TIMER_IRQ, timer_interrupt, IrqFlags::empty(), "scheduler")?;
    interrupts::init_periodic_timer(hz);
    Ok(())
}

pub fn is_initialized() -> bool {
    SCHEDULER.lock().is_some()
}

pub fn kernel_thread_create(
    priority: u8,
    entry: KernelThreadFn,
    arg: usize,
) -> Result<TaskId, TaskError> {
    with_scheduler(|sched| {
        sched.reserve_task_slot()?;
        with_memory(|mm| sched.kernel_thread_create(mm, priority, entry, arg))
    })
}

/// Ends the calling kernel thread.
///
/// # Panics
/// When called from the boot context.
pub fn kernel_thread_exit(code: i32) -> ! {
    if let Err(err) = with_scheduler(|sched| sched.kernel_thread_exit(code)) {
        panic!("kernel_thread_exit({}): {}", code, err);
    }
    yield_now();
    loop {
        crate::arch::cpu::halt();
    }
}

/// Reaps an exited thread; fails with [`TaskError::NotZombie`] while it runs.
pub fn kernel_thread_wait(id: TaskId) -> Result<i32, TaskError> {
    with_scheduler(|sched| with_memory(|mm| sched.kernel_thread_wait(mm, id)))
}

/// Sleeps until [`wakeup`] is called for `addr`.
///
/// A wakeup that lands between queueing and the yield is not lost: the task
/// is already runnable again and the yield merely reschedules.
pub fn sleep_on(addr: WaitAddress) -> Result<(), TaskError> {
    with_scheduler(|sched| {
        sched.reserve_waiter(addr)?;
        sched.block_current(addr)
    })?;
    yield_now();
    Ok(())
}

/// Wakes every sleeper on `addr`; safe from interrupt handlers.
pub fn wakeup(addr: WaitAddress) -> usize {
    with_scheduler(|sched| Ok(sched.wakeup(addr))).unwrap_or(0)
}

pub fn task_count() -> usize {
    with_scheduler(|sched| Ok(sched.task_count())).unwrap_or(0)
}

pub fn current_pid() -> Option<Pid> {
    with_scheduler(|sched| Ok(sched.current_pid())).ok()
}

/// Enters the scheduler through the yield vector.
pub fn yield_now() {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        // SAFETY:
        // - Software interrupt into `irq_rust_dispatch`, which switches tasks.
        // - Valid only in ring 0, which holds for kernel code.
        unsafe {
            core::arch::asm!(
                "int {vector}",
                vector = const interrupts::YIELD_VECTOR,
                options(nomem)
            );
        }
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    core::hint::spin_loop();
}

/// Timer IRQ handler.
pub fn timer_interrupt(frame: VirtAddr) -> VirtAddr {
    let mut guard = SCHEDULER.lock();
    match guard.as_mut() {
        Some(sched) if manager::is_initialized() => {
            with_memory(|mm| sched.on_timer_tick(mm, frame))
        }
        _ => frame,
    }
}

/// Yield-vector handler: reschedule immediately.
pub fn yield_interrupt(frame: VirtAddr) -> VirtAddr {
    let mut guard = SCHEDULER.lock();
    match guard.as_mut() {
        Some(sched) if manager::is_initialized() => with_memory(|mm| sched.schedule(mm, frame)),
        _ => frame,
    }
}
