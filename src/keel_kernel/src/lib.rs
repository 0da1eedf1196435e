//! The `keel` kernel: a small preemptive RTOS core for single-core 32-bit
//! microcontrollers.
//!
//! The kernel multiplexes a fixed number of tasks over one CPU, arbitrates
//! shared resources through blocking primitives (mutex with priority
//! inheritance, counting semaphore, event flags, bounded message queue), and
//! delivers deterministic response times to external events.
//!
//! # Contexts
//!
//! Code runs in one of two execution contexts:
//!
//! - **Task context**: an application task's own stack and privilege level.
//!   Blocking operations are only allowed here.
//! - **Privileged context**: the software-trap handler, the pend-switch
//!   handler, or any interrupt handler. Every state-mutating kernel operation
//!   is funnelled into this context by [`gate`](crate::gate) so that it runs
//!   atomically with respect to task preemption.
//!
//! Interrupt handlers may call [`System::semaphore_give`] and
//! [`System::event_set`]; every other mutating operation requires task
//! context.
//!
//! # Instantiation
//!
//! The kernel is generic over a system type implementing [`KernelTraits`],
//! which supplies the port layer ([`PortThreading`] + [`PortTimer`]) and the
//! statically allocated kernel [`State`]. The port drives the kernel through
//! [`PortToKernel`], which is implemented for every such system type.
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

use core::marker::PhantomData;

pub mod cfg;
pub mod error;
mod event;
mod gate;
mod klock;
mod list;
mod mutex;
mod queue;
mod sched;
mod semaphore;
mod task;
mod timeout;
mod timer;
mod utils;

pub use crate::event::{EventCapture, EventId};
pub use crate::mutex::MutexId;
pub use crate::queue::QueueId;
pub use crate::sched::State;
pub use crate::semaphore::SemaphoreId;
pub use crate::task::{TaskId, TaskStats};
pub use crate::timer::{TimerId, TimerMode};
pub use crate::utils::Init;

/// A numeric identifier for a kernel object.
///
/// The value is the object's one-based index into its kind's descriptor
/// range.
pub type Id = core::num::NonZeroUsize;

/// A point in time or a time span, measured in milliseconds.
pub type TimeMs = u32;

/// The timeout value meaning "wait indefinitely".
///
/// A blocking operation given this value never arms a deadline.
pub const TIME_FOREVER: TimeMs = TimeMs::MAX;

/// A task priority. Lower values are scheduled first.
pub type Priority = u8;

/// The entry point of a task. Task entry functions are expected to never
/// return; a hosted port may map a return onto task deletion.
pub type TaskEntry = fn();

/// A reference to a task slot, used at the kernel–port boundary.
///
/// Ports may use [`TaskRef::slot`] to key their own per-task bookkeeping.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TaskRef(pub(crate) usize);

impl TaskRef {
    /// The task's slot index in the task descriptor range.
    #[inline]
    pub fn slot(self) -> usize {
        self.0
    }
}

/// A region of memory reserved for a task's stack.
///
/// On a bare-metal port this is the backing store for the task's saved
/// context; a hosted port that runs tasks on operating-system threads may use
/// [`StackRegion::empty`] instead.
#[derive(Clone, Copy, Debug)]
pub struct StackRegion {
    start: usize,
    len: usize,
}

impl StackRegion {
    /// A zero-length region, for ports that manage task stacks themselves.
    pub const fn empty() -> Self {
        Self { start: 0, len: 0 }
    }

    /// Claim `stack` as a task stack region.
    ///
    /// Taking `&'static mut` ensures the caller relinquishes all other access
    /// to the memory for the lifetime of the program.
    pub fn new(stack: &'static mut [u8]) -> Self {
        Self {
            start: stack.as_mut_ptr() as usize,
            len: stack.len(),
        }
    }

    /// The base address of the region.
    #[inline]
    pub const fn start(&self) -> usize {
        self.start
    }

    /// The length of the region in bytes.
    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is zero-length.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Overwrite the region with zeroes.
    ///
    /// Used when a task slot is reclaimed so that no stale stack contents
    /// survive into the next task placed there.
    pub(crate) fn clear(&self) {
        if self.len != 0 {
            // Safety: The region was handed to us as `&'static mut [u8]` by
            // `StackRegion::new`, and the owning task no longer runs.
            unsafe { core::ptr::write_bytes(self.start as *mut u8, 0, self.len) };
        }
    }
}

/// Implemented by a port to provide threading and privilege primitives.
///
/// # Safety
///
/// The implementation must uphold each method's documented contract; the
/// kernel's memory safety depends on it (see [`klock`](crate::klock)).
pub unsafe trait PortThreading: Sized + 'static {
    /// Attempt to enter a CPU Lock state, masking preemption and interrupts.
    /// Returns `false` if CPU Lock is already active.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Leave the CPU Lock state.
    ///
    /// # Safety
    ///
    /// CPU Lock must be currently active, and it must be the kernel that
    /// activated it.
    unsafe fn leave_cpu_lock();

    /// Whether CPU Lock is currently active.
    fn is_cpu_lock_active() -> bool;

    /// Whether the current context is a task context.
    fn is_task_context() -> bool;

    /// Whether the current context is an interrupt (handler) context.
    fn is_interrupt_context() -> bool;

    /// Raise the pend-switch request.
    ///
    /// The port must invoke [`PortToKernel::switch_pending`] at the next safe
    /// point, before control returns to any task context.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel, with CPU Lock active.
    unsafe fn request_switch();

    /// Issue the privileged software trap, re-entering `f(data)` from the
    /// handler context.
    ///
    /// # Safety
    ///
    /// `f` and `data` come from the kernel's [`gate`](crate::gate); the port
    /// must call `f(data)` exactly once before returning.
    unsafe fn svc(f: unsafe fn(*mut ()), data: *mut ());

    /// Prepare the execution state of a new task and return the initial
    /// saved stack pointer.
    ///
    /// A bare-metal port builds the initial stack frame in `stack`; a hosted
    /// port may spawn a backing thread for `entry` and return zero.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel, with CPU Lock active.
    unsafe fn initialize_task_state(task: TaskRef, entry: TaskEntry, stack: StackRegion) -> usize;

    /// Called after the pend-switch handler has elected `next` to run.
    ///
    /// `prev` is the task that held the processor before the switch, if any.
    /// The kernel's saved-stack-pointer accessors ([`System::task_saved_sp`])
    /// are available for ports that swap contexts themselves.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel from the pend-switch path.
    unsafe fn context_switch(prev: Option<TaskRef>, next: TaskRef);

    /// Called when a task slot has been reclaimed, so the port can release
    /// any execution state backing it.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn reclaim_task_state(task: TaskRef);

    /// Enter the first task. Called once, at the end of [`PortToKernel::boot`].
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel, exactly once.
    unsafe fn run_first(first: TaskRef) -> !;

    /// Hint that the idle task has nothing to do. A bare-metal port typically
    /// waits for an interrupt here; a hosted port may sleep.
    ///
    /// # Safety
    ///
    /// Only meant to be called from the idle task's context.
    unsafe fn idle();
}

/// Implemented by a port to provide the monotonic clock.
///
/// # Safety
///
/// `now_ms` must be monotonic (modulo 32-bit wrap-around) and callable from
/// any context.
pub unsafe trait PortTimer: Sized + 'static {
    /// The current monotonic time in milliseconds.
    fn now_ms() -> TimeMs;
}

/// The combined port interface consumed by the kernel core.
pub trait Port: PortThreading + PortTimer {}

impl<T: PortThreading + PortTimer> Port for T {}

/// A system type: a port plus the statically allocated kernel state.
pub trait KernelTraits: Port {
    /// The kernel state owned by this system type.
    fn state() -> &'static State<Self>;
}

/// The kernel services a port invokes. Implemented for every [`KernelTraits`]
/// type; applications never call these.
pub trait PortToKernel {
    /// Finish kernel initialization and enter the first task.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the port, once, with CPU Lock inactive.
    unsafe fn boot() -> !;

    /// The pend-switch handler: drain the staging lists, elect the next
    /// running task, and hand the switch to the port.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the port from the pend-switch interrupt
    /// context, with CPU Lock inactive.
    unsafe fn switch_pending();

    /// The tick entry: fire due deadlines.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the port from the tick interrupt context,
    /// with CPU Lock inactive.
    unsafe fn timer_tick();
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn boot() -> ! {
        // Safety: forwarded contract
        unsafe { sched::boot::<Traits>() }
    }

    unsafe fn switch_pending() {
        // Safety: forwarded contract
        unsafe { sched::switch_pending::<Traits>() }
    }

    unsafe fn timer_tick() {
        // Safety: forwarded contract
        unsafe { timeout::tick::<Traits>() }
    }
}

/// The public operation set of a kernel instance.
///
/// All operations are associated functions; `System` itself is never
/// constructed.
pub struct System<Traits>(PhantomData<Traits>);

impl<Traits: KernelTraits> System<Traits> {
    /// The current monotonic time in milliseconds.
    #[inline]
    pub fn now_ms() -> TimeMs {
        Traits::now_ms()
    }

    /// Read a task's saved stack pointer. For use by a bare-metal port's
    /// context-switch code.
    ///
    /// # Safety
    ///
    /// Must be called from the pend-switch handler context, after
    /// [`PortToKernel::switch_pending`] returned this task as part of a
    /// switch.
    pub unsafe fn task_saved_sp(task: TaskRef) -> usize {
        // Safety: the caller is in a privileged context
        let mut lock =
            klock::CpuLock::<Traits>::acquire().unwrap_or_else(|_| unsafe { klock::CpuLock::steal() });
        let body = lock.get_mut(&Traits::state().body);
        body.tasks[task.0].stack_ptr
    }

    /// Write a task's saved stack pointer. For use by a bare-metal port's
    /// context-switch code.
    ///
    /// # Safety
    ///
    /// See [`System::task_saved_sp`].
    pub unsafe fn task_set_saved_sp(task: TaskRef, sp: usize) {
        // Safety: the caller is in a privileged context
        let mut lock =
            klock::CpuLock::<Traits>::acquire().unwrap_or_else(|_| unsafe { klock::CpuLock::steal() });
        let body = lock.get_mut(&Traits::state().body);
        body.tasks[task.0].stack_ptr = sp;
    }
}
