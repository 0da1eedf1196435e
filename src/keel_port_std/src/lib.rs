//! Simulation environment for running a `keel` kernel on a hosted platform.
//!
//! Each kernel task is backed by an operating-system thread that is allowed
//! to run only while the kernel considers its task the running one; every
//! other backing thread is parked on the scheduler condition variable. The
//! CPU Lock is a flag guarded by the scheduler mutex, and a real-time tick
//! thread drives [`PortToKernel::timer_tick`] once per millisecond.
//!
//! # Fidelity
//!
//! Preemption takes effect when the preempted thread next enters the kernel
//! (there is no asynchronous thread suspension), so two backing threads may
//! briefly run concurrently between a wake-up and the loser's next kernel
//! call. Kernel state is still fully serialized by the CPU Lock; only the
//! exact instant of preemption is looser than on real hardware. Tests that
//! need exact preemption timing belong in the kernel's deterministic unit
//! tests, not here.
//!
//! [`PortToKernel::timer_tick`]: keel_kernel::PortToKernel::timer_tick
use once_cell::sync::OnceCell;
use std::{
    cell::Cell,
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
    sync::{Condvar, Mutex},
    thread,
    time::{Duration, Instant},
};

use keel_kernel::{KernelTraits, PortToKernel, TaskEntry, TaskRef};

/// Used by `port_std_kernel!`
#[doc(hidden)]
pub extern crate keel_kernel;

/// The role of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Unknown,
    Boot,
    /// The backing thread for the tick interrupt context.
    Interrupt,
    /// The backing thread for the task in the given slot.
    Task(usize),
}

thread_local! {
    /// The current thread's role, assigned when the port creates the thread.
    static THREAD_ROLE: Cell<ThreadRole> = Cell::new(ThreadRole::Unknown);
}

/// The panic payload used to unwind a backing thread whose task was deleted.
struct TaskRetired;

/// Implemented on a system type by [`port_std_kernel!`].
///
/// # Safety
///
/// Only meant to be implemented by [`port_std_kernel!`].
pub unsafe trait PortInstance: KernelTraits + PortToKernel {
    fn port_state() -> &'static PortState;
}

struct Sched {
    cpu_lock: bool,
    lock_owner: Option<thread::ThreadId>,
    started: bool,
    current: Option<usize>,
    pended: bool,
    dead: [bool; keel_kernel::cfg::TASK_SLOTS],
}

/// The internal state of the port.
#[doc(hidden)]
pub struct PortState {
    sched: Mutex<Sched>,
    cond: Condvar,
    origin: OnceCell<Instant>,
}

#[allow(clippy::missing_safety_doc)]
impl PortState {
    pub const fn new() -> Self {
        Self {
            sched: Mutex::new(Sched {
                cpu_lock: false,
                lock_owner: None,
                started: false,
                current: None,
                pended: false,
                dead: [false; keel_kernel::cfg::TASK_SLOTS],
            }),
            cond: Condvar::new(),
            origin: OnceCell::new(),
        }
    }

    pub fn now_ms(&self) -> u32 {
        self.origin.get_or_init(Instant::now).elapsed().as_millis() as u32
    }

    /// Acquire the CPU Lock, waiting out another thread's critical section.
    /// Returns `false` if the calling thread already holds it.
    pub fn try_enter_cpu_lock(&self) -> bool {
        let me = thread::current().id();
        let mut s = self.sched.lock().unwrap();
        loop {
            if !s.cpu_lock {
                s.cpu_lock = true;
                s.lock_owner = Some(me);
                return true;
            }
            if s.lock_owner == Some(me) {
                return false;
            }
            s = self.cond.wait(s).unwrap();
        }
    }

    pub fn leave_cpu_lock(&self) {
        let mut s = self.sched.lock().unwrap();
        debug_assert!(s.cpu_lock);
        s.cpu_lock = false;
        s.lock_owner = None;
        drop(s);
        self.cond.notify_all();
    }

    pub fn is_cpu_lock_active(&self) -> bool {
        self.sched.lock().unwrap().cpu_lock
    }

    pub fn is_task_context(&self) -> bool {
        matches!(THREAD_ROLE.with(|r| r.get()), ThreadRole::Task(_))
    }

    pub fn is_interrupt_context(&self) -> bool {
        THREAD_ROLE.with(|r| r.get()) == ThreadRole::Interrupt
    }

    pub fn request_switch(&self) {
        self.sched.lock().unwrap().pended = true;
    }

    /// The software trap: run the privileged routine on the calling thread,
    /// then service any pend-switch it raised. A task thread that lost the
    /// processor parks here until it is scheduled again.
    pub unsafe fn svc<Traits: PortInstance>(&self, f: unsafe fn(*mut ()), data: *mut ()) {
        // Safety: forwarded from `PortThreading::svc`
        unsafe { f(data) };
        self.service_pending::<Traits>();
        if let ThreadRole::Task(slot) = THREAD_ROLE.with(|r| r.get()) {
            if !self.wait_until_scheduled(slot) {
                // The task was deleted while blocked; unwind the backing
                // thread.
                std::panic::panic_any(TaskRetired);
            }
        }
    }

    /// Run the pend-switch handler until no request is left.
    pub fn service_pending<Traits: PortInstance>(&self) {
        loop {
            let pended = {
                let mut s = self.sched.lock().unwrap();
                std::mem::replace(&mut s.pended, false)
            };
            if !pended {
                return;
            }
            // Safety: we are the port; CPU Lock is inactive here
            unsafe { <Traits as PortToKernel>::switch_pending() };
        }
    }

    /// Park until the kernel schedules `slot` again. Returns `false` if the
    /// task was deleted instead.
    fn wait_until_scheduled(&self, slot: usize) -> bool {
        let mut s = self.sched.lock().unwrap();
        loop {
            if s.dead[slot] {
                return false;
            }
            if s.started && s.current == Some(slot) {
                return true;
            }
            s = self.cond.wait(s).unwrap();
        }
    }

    /// Spawn the backing thread for a new task. The thread stays parked
    /// until the task is first scheduled.
    pub fn spawn_task<Traits: PortInstance>(&self, task: TaskRef, entry: TaskEntry) -> usize {
        let slot = task.slot();
        {
            let mut s = self.sched.lock().unwrap();
            s.dead[slot] = false;
        }
        let _ = thread::Builder::new()
            .name(format!("keel-task-{slot}"))
            .spawn(move || {
                THREAD_ROLE.with(|r| r.set(ThreadRole::Task(slot)));
                let run = move || {
                    if !Traits::port_state().wait_until_scheduled(slot) {
                        return;
                    }
                    log::debug!("task {slot} is now running");
                    entry();
                    // The entry function returned; retire the task.
                    keel_kernel::System::<Traits>::task_exit();
                };
                match catch_unwind(AssertUnwindSafe(run)) {
                    Ok(()) => {}
                    Err(e) if e.is::<TaskRetired>() => {
                        log::debug!("task {slot} retired");
                    }
                    Err(e) => resume_unwind(e),
                }
            });
        0
    }

    pub fn context_switch(&self, prev: Option<TaskRef>, next: TaskRef) {
        log::trace!("context switch {:?} -> {}", prev.map(TaskRef::slot), next.slot());
        let mut s = self.sched.lock().unwrap();
        s.current = Some(next.slot());
        drop(s);
        self.cond.notify_all();
    }

    pub fn reclaim_task_state(&self, task: TaskRef) {
        let mut s = self.sched.lock().unwrap();
        s.dead[task.slot()] = true;
        drop(s);
        self.cond.notify_all();
    }

    pub fn run_first(&self, first: TaskRef) -> ! {
        {
            let mut s = self.sched.lock().unwrap();
            s.started = true;
            s.current = Some(first.slot());
        }
        self.cond.notify_all();
        // The boot context is never scheduled again.
        loop {
            thread::park();
        }
    }

    pub fn idle(&self) {
        thread::sleep(Duration::from_millis(1));
    }
}

impl Default for PortState {
    fn default() -> Self {
        Self::new()
    }
}

/// Launch a configured kernel instance: start the tick thread and boot the
/// kernel on a background thread, then return to the caller.
///
/// Create every task and primitive before calling this.
pub fn start_kernel<Traits: PortInstance>() {
    let _ = thread::Builder::new().name("keel-tick".into()).spawn(|| {
        THREAD_ROLE.with(|r| r.set(ThreadRole::Interrupt));
        loop {
            thread::sleep(Duration::from_millis(1));
            if !Traits::port_state().sched.lock().unwrap().started {
                continue;
            }
            // Safety: we are the port's tick interrupt context
            unsafe { <Traits as PortToKernel>::timer_tick() };
            Traits::port_state().service_pending::<Traits>();
        }
    });
    let _ = thread::Builder::new().name("keel-boot".into()).spawn(|| {
        THREAD_ROLE.with(|r| r.set(ThreadRole::Boot));
        // Safety: called once, on the boot context
        unsafe { <Traits as PortToKernel>::boot() };
    });
}

/// Instantiate a kernel system type backed by this port.
///
/// Invoke once at module scope:
///
/// ```ignore
/// keel_port_std::port_std_kernel!(pub struct SystemTraits);
/// type System = keel_port_std::keel_kernel::System<SystemTraits>;
/// ```
#[macro_export]
macro_rules! port_std_kernel {
    ($vis:vis struct $SystemTy:ident) => {
        $vis struct $SystemTy;

        static __KEEL_KERNEL_STATE: $crate::keel_kernel::State<$SystemTy> =
            $crate::keel_kernel::State::new();
        static __KEEL_PORT_STATE: $crate::PortState = $crate::PortState::new();

        impl $crate::keel_kernel::KernelTraits for $SystemTy {
            fn state() -> &'static $crate::keel_kernel::State<Self> {
                &__KEEL_KERNEL_STATE
            }
        }

        unsafe impl $crate::PortInstance for $SystemTy {
            fn port_state() -> &'static $crate::PortState {
                &__KEEL_PORT_STATE
            }
        }

        unsafe impl $crate::keel_kernel::PortThreading for $SystemTy {
            unsafe fn try_enter_cpu_lock() -> bool {
                <Self as $crate::PortInstance>::port_state().try_enter_cpu_lock()
            }
            unsafe fn leave_cpu_lock() {
                <Self as $crate::PortInstance>::port_state().leave_cpu_lock()
            }
            fn is_cpu_lock_active() -> bool {
                <Self as $crate::PortInstance>::port_state().is_cpu_lock_active()
            }
            fn is_task_context() -> bool {
                <Self as $crate::PortInstance>::port_state().is_task_context()
            }
            fn is_interrupt_context() -> bool {
                <Self as $crate::PortInstance>::port_state().is_interrupt_context()
            }
            unsafe fn request_switch() {
                <Self as $crate::PortInstance>::port_state().request_switch()
            }
            unsafe fn svc(f: unsafe fn(*mut ()), data: *mut ()) {
                // Safety: forwarded contract
                unsafe {
                    <Self as $crate::PortInstance>::port_state().svc::<Self>(f, data)
                }
            }
            unsafe fn initialize_task_state(
                task: $crate::keel_kernel::TaskRef,
                entry: $crate::keel_kernel::TaskEntry,
                _stack: $crate::keel_kernel::StackRegion,
            ) -> usize {
                <Self as $crate::PortInstance>::port_state().spawn_task::<Self>(task, entry)
            }
            unsafe fn context_switch(
                prev: Option<$crate::keel_kernel::TaskRef>,
                next: $crate::keel_kernel::TaskRef,
            ) {
                <Self as $crate::PortInstance>::port_state().context_switch(prev, next)
            }
            unsafe fn reclaim_task_state(task: $crate::keel_kernel::TaskRef) {
                <Self as $crate::PortInstance>::port_state().reclaim_task_state(task)
            }
            unsafe fn run_first(first: $crate::keel_kernel::TaskRef) -> ! {
                <Self as $crate::PortInstance>::port_state().run_first(first)
            }
            unsafe fn idle() {
                <Self as $crate::PortInstance>::port_state().idle()
            }
        }

        unsafe impl $crate::keel_kernel::PortTimer for $SystemTy {
            fn now_ms() -> u32 {
                <Self as $crate::PortInstance>::port_state().now_ms()
            }
        }
    };
}
