//! Privilege call gate
//!
//! Every state-mutating operation is funnelled through [`invoke`] so that it
//! runs in the privileged execution context with preemption masked and a
//! consistent view of scheduler state. From an interrupt context the routine
//! runs directly under the CPU Lock; from task context it is marshalled
//! through the port's software trap.
use crate::{
    error::BadContextError,
    klock::CpuLock,
    sched, KernelTraits,
};

/// If the current context is not a task context, return `Err(BadContext)`.
pub(crate) fn expect_task_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    if !Traits::is_task_context() {
        Err(BadContextError::BadContext)
    } else {
        Ok(())
    }
}

struct Packet<F, R> {
    f: Option<F>,
    r: Option<R>,
}

/// Run `f` in the privileged context and return its result.
///
/// On exit, a pend-switch requested by `f` is forwarded to the port while
/// preemption is still masked, so the switch is serviced before control can
/// return to any task.
pub(crate) fn invoke<Traits: KernelTraits, F, R>(f: F) -> R
where
    F: FnOnce(&mut CpuLock<Traits>) -> R,
{
    if Traits::is_interrupt_context() {
        // Already in a privileged context; a critical section suffices.
        // The kernel never re-enters the gate with the lock held, so this
        // can't fail
        let mut lock = CpuLock::<Traits>::acquire().expect("privileged call with CPU Lock active");
        let r = f(&mut lock);
        sched::service_switch_request::<Traits>(&mut lock);
        r
    } else {
        let mut packet = Packet::<F, R> { f: Some(f), r: None };
        // Safety: `trampoline` matches the packet's type parameters and the
        // packet outlives the call.
        unsafe {
            Traits::svc(
                trampoline::<Traits, F, R>,
                (&mut packet) as *mut Packet<F, R> as *mut (),
            )
        };
        match packet.r {
            Some(r) => r,
            // The port is required to run the trap exactly once.
            None => unreachable!("privileged trap did not run"),
        }
    }
}

unsafe fn trampoline<Traits: KernelTraits, F, R>(p: *mut ())
where
    F: FnOnce(&mut CpuLock<Traits>) -> R,
{
    // Safety: `p` was derived from a live `Packet<F, R>` in `invoke`
    let packet = unsafe { &mut *(p as *mut Packet<F, R>) };
    let mut lock = CpuLock::<Traits>::acquire().expect("trap entered with CPU Lock active");
    let f = packet.f.take().expect("trap entered twice");
    packet.r = Some(f(&mut lock));
    sched::service_switch_request::<Traits>(&mut lock);
}
