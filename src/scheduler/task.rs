//! Task records, handles and wait queues.

use alloc::collections::{TryReserveError, VecDeque};
use core::fmt;

use crate::arch::context::TaskContext;
use crate::memory::heap::HEADER_SIZE;
use crate::memory::{VirtAddr, PAGE_SIZE};

/// Kernel thread entry; receives the argument given at creation.
pub type KernelThreadFn = extern "C" fn(usize);

/// Stack payload size; together with the region header it fills four pages.
pub const KERNEL_STACK_SIZE: usize = 4 * PAGE_SIZE - HEADER_SIZE;

pub const DEFAULT_PRIORITY: u8 = 1;

/// Number of distinct sleep addresses.
pub const MAX_WAIT_ADDRESSES: usize = 32;

/// Process id; 0 is the boot context.
pub type Pid = u32;

/// Generation-checked handle into the task arena.
///
/// A handle to a reaped task never matches the slot's next occupant.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl TaskId {
    pub(crate) const fn new(index: usize, generation: u32) -> Self {
        Self {
            index: index as u32,
            generation,
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        self.index as usize
    }

    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({}#{})", self.index, self.generation)
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Eligible for scheduling.
    ReadyToRun,

    /// The task currently executing on the CPU.
    Running,

    /// Sleeping on a wait address until woken.
    Stopped,

    /// Exited; the record and exit code stay until a waiter reaps it.
    Zombie,
}

impl TaskState {
    #[inline]
    pub fn is_runnable(self) -> bool {
        matches!(self, TaskState::ReadyToRun | TaskState::Running)
    }
}

/// Abstract event class a task can sleep on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WaitAddress(u8);

impl WaitAddress {
    /// Disk controller completed a request.
    pub const DISK_IRQ: Self = Self(0);
    /// A key is available.
    pub const KEYBOARD: Self = Self(1);
    /// A kernel thread exited.
    pub const CHILD_EXIT: Self = Self(2);

    pub const fn new(raw: u8) -> Option<Self> {
        if (raw as usize) < MAX_WAIT_ADDRESSES {
            Some(Self(raw))
        } else {
            None
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Heap block holding a task's kernel stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelStack {
    base: VirtAddr,
    size: usize,
}

impl KernelStack {
    pub(crate) const fn new(base: VirtAddr, size: usize) -> Self {
        Self { base, size }
    }

    /// Pointer returned by `kmalloc`; what `kfree` expects back.
    #[inline]
    pub fn base(&self) -> VirtAddr {
        self.base
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the highest usable byte; stacks grow down from here.
    #[inline]
    pub fn top(&self) -> VirtAddr {
        VirtAddr::new(self.base.as_u32() + self.size as u32)
    }

    pub fn contains(&self, va: VirtAddr) -> bool {
        va >= self.base && va < self.top()
    }
}

/// One schedulable unit of execution.
#[derive(Debug)]
pub struct Task {
    pub pid: Pid,
    pub state: TaskState,
    pub priority: u8,
    pub context: TaskContext,
    /// `None` for the boot context and for zombies whose stack was released.
    pub kernel_stack: Option<KernelStack>,
    pub exit_code: Option<i32>,
    pub waiting_on: Option<WaitAddress>,
    pub entry: Option<(KernelThreadFn, usize)>,
}

/// FIFO queue of sleepers per wait address.
pub struct WaitQueues {
    queues: [VecDeque<TaskId>; MAX_WAIT_ADDRESSES],
}

impl WaitQueues {
    pub const fn new() -> Self {
        const EMPTY: VecDeque<TaskId> = VecDeque::new();
        Self {
            queues: [EMPTY; MAX_WAIT_ADDRESSES],
        }
    }

    /// Makes room for one more sleeper so `push` cannot allocate.
    pub fn try_reserve(&mut self, addr: WaitAddress) -> Result<(), TryReserveError> {
        self.queues[addr.index()].try_reserve(1)
    }

    pub fn push(&mut self, addr: WaitAddress, task: TaskId) {
        self.queues[addr.index()].push_back(task);
    }

    pub fn pop(&mut self, addr: WaitAddress) -> Option<TaskId> {
        self.queues[addr.index()].pop_front()
    }

    /// Drops `task` from whichever queue holds it.
    pub fn remove(&mut self, task: TaskId) {
        for queue in self.queues.iter_mut() {
            queue.retain(|queued| *queued != task);
        }
    }

    pub fn len(&self, addr: WaitAddress) -> usize {
        self.queues[addr.index()].len()
    }

    pub fn is_empty(&self, addr: WaitAddress) -> bool {
        self.queues[addr.index()].is_empty()
    }

    pub fn iter(&self, addr: WaitAddress) -> impl Iterator<Item = TaskId> + '_ {
        self.queues[addr.index()].iter().copied()
    }
}

impl Default for WaitQueues {
    fn default() -> Self {
        Self::new()
    }
}
