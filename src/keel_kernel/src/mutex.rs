//! Mutexes
//!
//! Mutual exclusion with one-level priority inheritance: while a task holds
//! the lock, a better-priority contender lowers the holder's effective
//! priority value to its own. Nested inheritance across a chain of held
//! mutexes is not supported. Unlock hands the lock to the head waiter
//! atomically, so there is no window in which a middle-priority task can
//! steal it.
use crate::{
    cfg,
    error::{AccessError, CreateError, LockMutexError, ResultCode, UnlockMutexError},
    gate,
    list::ListHead,
    sched::{self, StateBody},
    task::{ExitTarget, PendPayload, WaitSource},
    utils::Init,
    Id, KernelTraits, Priority, System,
};

pub type MutexId = Id;

/// *Mutex control block* - the state data of a mutex.
pub(crate) struct MutexCb {
    pub(crate) init: bool,
    pub(crate) name: &'static str,
    /// Contenders, in effective-priority order.
    pub(crate) wait: ListHead,
    pub(crate) locked: bool,
    pub(crate) holder: Option<usize>,
    /// The holder's priority at the moment it was granted the lock; restored
    /// on unlock.
    pub(crate) holder_stable_priority: Priority,
}

impl Init for MutexCb {
    const INIT: Self = Self {
        init: false,
        name: "",
        wait: ListHead::INIT,
        locked: false,
        holder: None,
        holder_stable_priority: cfg::PRIORITY_INVALID,
    };
}

pub(crate) fn mutex_index(body: &StateBody, id: MutexId) -> Result<usize, AccessError> {
    let i = id.get() - 1;
    if i >= cfg::MUTEX_SLOTS {
        return Err(AccessError::BadId);
    }
    if !body.mutexes[i].init {
        return Err(AccessError::NotInitialized);
    }
    Ok(i)
}

/// Grant the lock to the head waiter if the mutex is free. Runs after the
/// exit drain links a staged contender.
pub(crate) fn repoll(body: &mut StateBody, i: usize) {
    if body.mutexes[i].locked {
        return;
    }
    if let Some(waiter) = body.mutexes[i].wait.head() {
        body.mutexes[i].locked = true;
        body.mutexes[i].holder = Some(waiter);
        body.mutexes[i].holder_stable_priority = body.tasks[waiter].priority;
        sched::entry_trigger(body, waiter, None, ResultCode::Success.raw());
    }
}

/// The privileged part of `lock`: take the lock or stage the caller onto the
/// wait queue, boosting the holder first.
pub(crate) fn lock_in(body: &mut StateBody, i: usize) -> Result<bool, LockMutexError> {
    let slot = body.running.expect("no running task");
    if !body.mutexes[i].locked {
        body.mutexes[i].locked = true;
        body.mutexes[i].holder = Some(slot);
        body.mutexes[i].holder_stable_priority = body.tasks[slot].priority;
        return Ok(false);
    }

    let Some(holder) = body.mutexes[i].holder else {
        log::error!("mutex {} locked without a holder", body.mutexes[i].name);
        return Err(LockMutexError::Internal);
    };
    // One-level priority inheritance: drag the holder up to the contender's
    // effective priority and reposition it in whatever list it occupies.
    if body.tasks[slot].priority < body.tasks[holder].priority {
        body.tasks[holder].priority = body.tasks[slot].priority;
        body.reorder(holder);
    }
    body.tasks[slot].pend = PendPayload::Mutex;
    sched::exit_trigger(body, slot, ExitTarget::Wait(WaitSource::Mutex(i)), 0);
    Ok(true)
}

/// The privileged part of `unlock`: restore the holder's priority and hand
/// the lock to the head waiter, or free it.
///
/// The caller is deliberately not verified to be the holder.
pub(crate) fn unlock_in(body: &mut StateBody, i: usize) -> Result<(), UnlockMutexError> {
    if !body.mutexes[i].locked {
        return Err(UnlockMutexError::BadObjectState);
    }
    if let Some(holder) = body.mutexes[i].holder {
        let stable = body.mutexes[i].holder_stable_priority;
        if body.tasks[holder].priority != stable {
            body.tasks[holder].priority = stable;
            body.reorder(holder);
        }
    }
    if let Some(waiter) = body.mutexes[i].wait.head() {
        // Hand-off: the head waiter becomes the holder before it even runs.
        body.mutexes[i].holder = Some(waiter);
        body.mutexes[i].holder_stable_priority = body.tasks[waiter].priority;
        sched::entry_trigger(body, waiter, None, ResultCode::Success.raw());
    } else {
        body.mutexes[i].locked = false;
        body.mutexes[i].holder = None;
        body.mutexes[i].holder_stable_priority = cfg::PRIORITY_INVALID;
    }
    Ok(())
}

impl<Traits: KernelTraits> System<Traits> {
    /// Create a mutex.
    pub fn mutex_create(name: &'static str) -> Result<MutexId, CreateError> {
        gate::invoke::<Traits, _, _>(|lock| {
            let body = lock.get_mut(&Traits::state().body);
            let slot = body
                .mutexes
                .iter()
                .position(|m| !m.init)
                .ok_or(CreateError::NoResource)?;
            body.mutexes[slot] = MutexCb {
                init: true,
                name,
                wait: ListHead::INIT,
                locked: false,
                holder: None,
                holder_stable_priority: cfg::PRIORITY_INVALID,
            };
            Ok(Id::new(slot + 1).unwrap())
        })
    }

    /// Lock the mutex, waiting indefinitely if it is held.
    pub fn mutex_lock(id: MutexId) -> Result<(), LockMutexError> {
        gate::expect_task_context::<Traits>()?;
        let pending = gate::invoke::<Traits, _, _>(|lock| -> Result<bool, LockMutexError> {
            let body = lock.get_mut(&Traits::state().body);
            let i = mutex_index(body, id)?;
            lock_in(body, i)
        })?;
        if !pending {
            return Ok(());
        }
        let (raw, _) = sched::finish_wait::<Traits>();
        match raw {
            x if x == ResultCode::Success.raw() => Ok(()),
            _ => Err(LockMutexError::Internal),
        }
    }

    /// Unlock the mutex, transferring it to the head waiter if any.
    pub fn mutex_unlock(id: MutexId) -> Result<(), UnlockMutexError> {
        gate::expect_task_context::<Traits>()?;
        gate::invoke::<Traits, _, _>(|lock| {
            let body = lock.get_mut(&Traits::state().body);
            let i = mutex_index(body, id)?;
            unlock_in(body, i)
        })
    }
}
