//! Round-robin scheduler over a task arena.
//!
//! Tasks live in a generation-checked arena; the ring keeps them in creation
//! order and plays the role of the circular task list. `schedule` walks the
//! ring once, starting after the current task and ending at it, and switches
//! to the first runnable task it meets.
//!
//! Nothing in here allocates while a `MemoryManager` is borrowed: callers
//! reserve arena, ring and wait-queue room beforehand through
//! [`Scheduler::reserve_task_slot`] and [`Scheduler::reserve_waiter`].
//! Kernel stacks come from the kernel heap and are released once execution
//! has left them: a zombie's stack at the next `schedule`, or at reap time.

use alloc::vec::Vec;

use crate::arch::context::{build_initial_frame, ArchContext, TaskContext};
use crate::config::SchedulerConfig;
use crate::memory::heap::AllocFlags;
use crate::memory::{AddressSpaceId, MemoryManager, PhysAddr, PhysMapper, VirtAddr};
use crate::scheduler::task::{
    KernelStack, KernelThreadFn, Pid, Task, TaskId, TaskState, WaitAddress, WaitQueues,
    KERNEL_STACK_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("no such task")]
    InvalidHandle,
    #[error("task has not exited")]
    NotZombie,
    #[error("scheduler is not running")]
    NotRunning,
    #[error("operation not allowed on the boot task")]
    BootTask,
}

struct Slot {
    generation: u32,
    task: Option<Task>,
}

pub struct Scheduler<A: ArchContext> {
    arch: A,
    slots: Vec<Slot>,
    /// Circular task list in creation order.
    ring: Vec<TaskId>,
    /// Ring position of the current task.
    current: usize,
    wait_queues: WaitQueues,
    quantum: u32,
    elapsed: u32,
    ticks: u64,
    next_pid: Pid,
    kernel_cr3: PhysAddr,
    debug_enabled: bool,
}

impl<A: ArchContext> Scheduler<A> {
    /// Creates the scheduler with the boot context as pid 0, `Running`.
    pub fn new(arch: A, kernel_cr3: PhysAddr, config: &SchedulerConfig) -> Self {
        let boot = Task {
            pid: 0,
            state: TaskState::Running,
            priority: crate::scheduler::task::DEFAULT_PRIORITY,
            context: TaskContext::new(VirtAddr::zero(), kernel_cr3),
            kernel_stack: None,
            exit_code: None,
            waiting_on: None,
            entry: None,
        };
        let mut slots = Vec::with_capacity(8);
        slots.push(Slot {
            generation: 0,
            task: Some(boot),
        });
        let mut ring = Vec::with_capacity(8);
        ring.push(TaskId::new(0, 0));

        log::info!(
            target: "sched",
            "round robin, quantum {} ticks",
            config.quantum_ticks
        );

        Self {
            arch,
            slots,
            ring,
            current: 0,
            wait_queues: WaitQueues::new(),
            quantum: config.quantum_ticks.max(1),
            elapsed: 0,
            ticks: 0,
            next_pid: 1,
            kernel_cr3,
            debug_enabled: config.debug,
        }
    }

    pub fn arch(&self) -> &A {
        &self.arch
    }

    /// Ensures the next creation finds arena and ring room without growing.
    pub fn reserve_task_slot(&mut self) -> Result<(), TaskError> {
        if !self.slots.iter().any(|slot| slot.task.is_none()) {
            self.slots
                .try_reserve(1)
                .map_err(|_| TaskError::OutOfMemory)?;
        }
        self.ring.try_reserve(1).map_err(|_| TaskError::OutOfMemory)
    }

    /// Ensures the next sleeper on `addr` can be queued without growing.
    pub fn reserve_waiter(&mut self, addr: WaitAddress) -> Result<(), TaskError> {
        self.wait_queues
            .try_reserve(addr)
            .map_err(|_| TaskError::OutOfMemory)
    }

    /// Creates a kernel thread that starts as `entry(arg)`.
    ///
    /// The stack comes from the kernel heap and is seeded with the initial
    /// trap frame. On failure nothing stays allocated.
    pub fn kernel_thread_create<M: PhysMapper>(
        &mut self,
        mm: &mut MemoryManager<M>,
        priority: u8,
        entry: KernelThreadFn,
        arg: usize,
    ) -> Result<TaskId, TaskError> {
        self.reserve_task_slot()?;

        let base = mm
            .kmalloc(KERNEL_STACK_SIZE, AllocFlags::ZEROED)
            .map_err(|_| TaskError::OutOfMemory)?;
        let stack = KernelStack::new(base, KERNEL_STACK_SIZE);
        let initial = build_initial_frame(stack.top(), entry as usize, arg);
        if mm
            .write_bytes(AddressSpaceId::KERNEL, initial.frame_addr, &initial.bytes)
            .is_err()
        {
            mm.kfree(base);
            return Err(TaskError::OutOfMemory);
        }

        let pid = self.next_pid;
        self.next_pid += 1;
        let task = Task {
            pid,
            state: TaskState::ReadyToRun,
            priority,
            context: TaskContext::new(initial.frame_addr, self.kernel_cr3),
            kernel_stack: Some(stack),
            exit_code: None,
            waiting_on: None,
            entry: Some((entry, arg)),
        };

        let id = match self.slots.iter().position(|slot| slot.task.is_none()) {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.task = Some(task);
                TaskId::new(index, slot.generation)
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    task: Some(task),
                });
                TaskId::new(self.slots.len() - 1, 0)
            }
        };
        self.ring.push(id);

        log::debug!(
            target: "sched",
            "created pid {} ({:?}) stack {:?}..{:?}",
            pid,
            id,
            stack.base(),
            stack.top()
        );
        Ok(id)
    }

    /// Turns the current task into a zombie holding `code`.
    ///
    /// The stack stays in place until execution has left it. Sleepers on
    /// [`WaitAddress::CHILD_EXIT`] are woken.
    pub fn kernel_thread_exit(&mut self, code: i32) -> Result<(), TaskError> {
        let id = self.current();
        if id.index() == 0 {
            return Err(TaskError::BootTask);
        }
        let task = self.task_mut(id).ok_or(TaskError::InvalidHandle)?;
        task.state = TaskState::Zombie;
        task.exit_code = Some(code);
        let pid = task.pid;

        log::debug!(target: "sched", "pid {} exited with {}", pid, code);
        self.wakeup(WaitAddress::CHILD_EXIT);
        Ok(())
    }

    /// Reaps `id` if it is a zombie and returns its exit code.
    ///
    /// Never blocks; callers that must wait combine this with
    /// `sleep_on(CHILD_EXIT)`.
    pub fn kernel_thread_wait<M: PhysMapper>(
        &mut self,
        mm: &mut MemoryManager<M>,
        id: TaskId,
    ) -> Result<i32, TaskError> {
        if id.index() == 0 {
            return Err(TaskError::BootTask);
        }
        let task = self.task(id).ok_or(TaskError::InvalidHandle)?;
        if task.state != TaskState::Zombie {
            return Err(TaskError::NotZombie);
        }

        let slot = &mut self.slots[id.index()];
        let Some(task) = slot.task.take() else {
            return Err(TaskError::InvalidHandle);
        };
        slot.generation = slot.generation.wrapping_add(1);
        if let Some(stack) = task.kernel_stack {
            mm.kfree(stack.base());
        }

        if let Some(pos) = self.ring.iter().position(|queued| *queued == id) {
            self.ring.remove(pos);
            if pos < self.current {
                self.current -= 1;
            }
        }
        self.wait_queues.remove(id);

        log::debug!(target: "sched", "reaped pid {}", task.pid);
        Ok(task.exit_code.unwrap_or(0))
    }

    /// Saves the interrupted `frame` and picks the next runnable task.
    ///
    /// Returns the frame to resume.
    ///
    /// # Panics
    /// When a whole lap finds no runnable task.
    pub fn schedule<M: PhysMapper>(&mut self, mm: &mut MemoryManager<M>, frame: VirtAddr) -> VirtAddr {
        let outgoing = self.current();
        let Self { arch, slots, .. } = self;
        if let Some(task) = slots[outgoing.index()].task.as_mut() {
            arch.save(&mut task.context, frame);
            if task.state == TaskState::Running {
                task.state = TaskState::ReadyToRun;
            }
        }

        self.release_zombie_stacks(mm, outgoing);

        let len = self.ring.len();
        let next = (1..=len)
            .map(|step| (self.current + step) % len)
            .find(|&pos| {
                self.task(self.ring[pos])
                    .is_some_and(|task| task.state.is_runnable())
            });
        let Some(pos) = next else {
            panic!("no runnable task");
        };

        self.current = pos;
        self.elapsed = 0;
        let incoming = self.ring[pos];
        let Some(task) = self.slots[incoming.index()].task.as_mut() else {
            panic!("ring references empty slot {:?}", incoming);
        };
        task.state = TaskState::Running;
        let context = task.context;
        let pid = task.pid;

        if self.debug_enabled {
            log::trace!(target: "sched", "switch {:?} -> pid {}", outgoing, pid);
        }
        self.arch.restore(&context)
    }

    /// Timer hook: reschedules once the quantum has elapsed.
    pub fn on_timer_tick<M: PhysMapper>(
        &mut self,
        mm: &mut MemoryManager<M>,
        frame: VirtAddr,
    ) -> VirtAddr {
        self.ticks += 1;
        self.elapsed += 1;
        if self.elapsed >= self.quantum {
            self.schedule(mm, frame)
        } else {
            frame
        }
    }

    /// Marks the current task `Stopped` and queues it on `addr`.
    ///
    /// The caller must reschedule afterwards; [`Self::sleep_on`] does both.
    pub fn block_current(&mut self, addr: WaitAddress) -> Result<(), TaskError> {
        let id = self.current();
        let task = self.task_mut(id).ok_or(TaskError::InvalidHandle)?;
        task.state = TaskState::Stopped;
        task.waiting_on = Some(addr);
        self.wait_queues.push(addr, id);
        Ok(())
    }

    /// Puts the current task to sleep on `addr` and switches away.
    pub fn sleep_on<M: PhysMapper>(
        &mut self,
        mm: &mut MemoryManager<M>,
        addr: WaitAddress,
        frame: VirtAddr,
    ) -> VirtAddr {
        match self.block_current(addr) {
            Ok(()) => self.schedule(mm, frame),
            Err(_) => frame,
        }
    }

    /// Makes every sleeper on `addr` runnable, in the order they slept.
    ///
    /// Returns how many tasks were woken.
    pub fn wakeup(&mut self, addr: WaitAddress) -> usize {
        let mut woken = 0;
        while let Some(id) = self.wait_queues.pop(addr) {
            if let Some(task) = self.task_mut(id) {
                if task.state == TaskState::Stopped {
                    task.state = TaskState::ReadyToRun;
                    task.waiting_on = None;
                    woken += 1;
                }
            }
        }
        if woken > 0 && self.debug_enabled {
            log::trace!(target: "sched", "woke {} on {:?}", woken, addr);
        }
        woken
    }

    /// Frees the stacks of zombies other than `outgoing`, which may still be
    /// running on its own.
    fn release_zombie_stacks<M: PhysMapper>(&mut self, mm: &mut MemoryManager<M>, outgoing: TaskId) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if index == outgoing.index() {
                continue;
            }
            if let Some(task) = slot.task.as_mut() {
                if task.state == TaskState::Zombie {
                    if let Some(stack) = task.kernel_stack.take() {
                        mm.kfree(stack.base());
                    }
                }
            }
        }
    }

    fn task(&self, id: TaskId) -> Option<&Task> {
        let slot = self.slots.get(id.index())?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.task.as_ref()
    }

    fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.task.as_mut()
    }

    // Diagnostics

    pub fn current(&self) -> TaskId {
        self.ring[self.current]
    }

    pub fn current_pid(&self) -> Pid {
        self.task(self.current()).map_or(0, |task| task.pid)
    }

    pub fn boot_task(&self) -> TaskId {
        TaskId::new(0, 0)
    }

    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.task(id).map(|task| task.state)
    }

    pub fn pid(&self, id: TaskId) -> Option<Pid> {
        self.task(id).map(|task| task.pid)
    }

    pub fn task_entry(&self, id: TaskId) -> Option<(KernelThreadFn, usize)> {
        self.task(id).and_then(|task| task.entry)
    }

    pub fn kernel_stack(&self, id: TaskId) -> Option<KernelStack> {
        self.task(id).and_then(|task| task.kernel_stack)
    }

    /// Live tasks, zombies and the boot context included.
    pub fn task_count(&self) -> usize {
        self.ring.len()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn frame_of(&self, id: TaskId) -> Option<VirtAddr> {
        self.task(id).map(|task| task.context.frame())
    }

    pub fn waiters(&self, addr: WaitAddress) -> impl Iterator<Item = TaskId> + '_ {
        self.wait_queues.iter(addr)
    }
}
