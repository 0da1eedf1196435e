//! Tasks
use arrayvec::ArrayVec;

use crate::{
    cfg,
    error::{AccessError, CreateError, DeleteError, QueryError, ResultCode, ResumeError,
        SleepError, SuspendError, YieldError},
    gate,
    sched::{self, EntryFn, StateBody, RESULT_NONE},
    utils::Init,
    Id, KernelTraits, Priority, StackRegion, System, TaskEntry, TaskRef, TimeMs, TIME_FOREVER,
};

pub type TaskId = Id;

/// Which list a task is linked in. A task descriptor participates in exactly
/// one list at a time; this tag names it so unlinking is never ambiguous.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Linkage {
    Detached,
    Ready,
    EntryStaging,
    ExitStaging,
    Parked,
    Waiting(WaitSource),
}

/// The wait queue a blocked task sits in, which doubles as its pending
/// context pointer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum WaitSource {
    Semaphore(usize),
    Mutex(usize),
    Event(usize),
    QueueTx(usize),
    QueueRx(usize),
}

/// Where the exit-staging drain routes a departing task.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ExitTarget {
    /// Back into the ready queue (yield).
    Ready,
    /// Onto the scheduler's park list (sleep, suspend).
    Park,
    /// Into a primitive's wait queue.
    Wait(WaitSource),
    /// Out of the system: clear the stack and free the slot.
    Drop,
}

/// The exit-staging record.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ExitRec {
    pub(crate) target: ExitTarget,
    pub(crate) timeout_ms: TimeMs,
}

/// The entry-staging record: the wake result and an optional callback run by
/// the entry drain.
pub(crate) struct EntryRec {
    pub(crate) result: i32,
    pub(crate) callback: Option<EntryFn>,
}

impl Init for EntryRec {
    const INIT: Self = Self {
        result: RESULT_NONE,
        callback: None,
    };
}

/// The primitive-specific per-waiter record carried by a blocked task.
pub(crate) enum PendPayload {
    None,
    Semaphore,
    Mutex,
    /// Event waiter: the listen mask, the value snapshot last observed by
    /// this waiter, and the trigger bits reported to it.
    Event {
        listen: u32,
        out_value: u32,
        out_trigger: u32,
    },
    /// Blocked sender: the element, staged until a slot frees up.
    QueueTx {
        elem: ArrayVec<u8, { cfg::QUEUE_ELEM_MAX }>,
    },
    /// Blocked receiver: filled by the sender or the drain.
    QueueRx {
        elem: ArrayVec<u8, { cfg::QUEUE_ELEM_MAX }>,
    },
}

impl Init for PendPayload {
    const INIT: Self = Self::None;
}

/// Scheduling analytics, maintained by the pend-switch handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskStats {
    /// When the task last gained the processor.
    pub last_active_ms: TimeMs,
    /// The length of the task's last completed run.
    pub last_run_ms: TimeMs,
    /// Accumulated run time.
    pub total_run_ms: TimeMs,
    /// When the task last left the entry-staging list.
    pub last_pend_ms: TimeMs,
}

impl Init for TaskStats {
    const INIT: Self = Self {
        last_active_ms: 0,
        last_run_ms: 0,
        total_run_ms: 0,
        last_pend_ms: 0,
    };
}

/// *Task control block* - the state data of a task.
pub(crate) struct TaskCb {
    pub(crate) init: bool,
    pub(crate) name: &'static str,
    pub(crate) entry: TaskEntry,
    pub(crate) stack: StackRegion,
    /// The saved stack pointer, maintained by the port.
    pub(crate) stack_ptr: usize,
    /// The priority configured at creation.
    pub(crate) base_priority: Priority,
    /// The effective priority: equal to `base_priority` except while a held
    /// mutex grants a temporary boost.
    pub(crate) priority: Priority,
    pub(crate) linkage: Linkage,
    pub(crate) pending_on: Option<WaitSource>,
    pub(crate) pend: PendPayload,
    pub(crate) entry_rec: EntryRec,
    pub(crate) exit_rec: Option<ExitRec>,
    pub(crate) stats: TaskStats,
}

impl Init for TaskCb {
    const INIT: Self = Self {
        init: false,
        name: "",
        entry: || {},
        stack: StackRegion::empty(),
        stack_ptr: 0,
        base_priority: cfg::PRIORITY_INVALID,
        priority: cfg::PRIORITY_INVALID,
        linkage: Linkage::Detached,
        pending_on: None,
        pend: PendPayload::INIT,
        entry_rec: EntryRec::INIT,
        exit_rec: None,
        stats: TaskStats::INIT,
    };
}

/// Claim the first vacant task slot and link the new task into the ready
/// queue. Returns `None` if the range is exhausted.
pub(crate) fn create_in(
    body: &mut StateBody,
    entry: TaskEntry,
    stack: StackRegion,
    priority: Priority,
    name: &'static str,
) -> Option<usize> {
    let slot = body.tasks.iter().position(|t| !t.init)?;
    body.tasks[slot] = TaskCb {
        init: true,
        name,
        entry,
        stack,
        stack_ptr: 0,
        base_priority: priority,
        priority,
        linkage: Linkage::Detached,
        pending_on: None,
        pend: PendPayload::None,
        entry_rec: EntryRec::INIT,
        exit_rec: None,
        stats: TaskStats::INIT,
    };
    body.link_ready(slot);
    Some(slot)
}

pub(crate) fn task_index(body: &StateBody, id: TaskId) -> Result<usize, AccessError> {
    let i = id.get() - 1;
    if i >= cfg::TASK_SLOTS {
        return Err(AccessError::BadId);
    }
    if !body.tasks[i].init {
        return Err(AccessError::NotInitialized);
    }
    Ok(i)
}

impl<Traits: KernelTraits> System<Traits> {
    /// Create a task and put it on the ready queue.
    ///
    /// Tasks can only be created before the kernel starts; the configured
    /// priority range and minimum stack size are enforced.
    pub fn task_create(
        entry: TaskEntry,
        stack: StackRegion,
        priority: Priority,
        name: &'static str,
    ) -> Result<TaskId, CreateError> {
        if !(cfg::PRIORITY_USER_HIGHEST..=cfg::PRIORITY_USER_LOWEST).contains(&priority) {
            return Err(CreateError::BadParam);
        }
        if !stack.is_empty() && stack.len() < cfg::STACK_SIZE_MIN {
            return Err(CreateError::BadParam);
        }
        gate::invoke::<Traits, _, _>(|lock| {
            let body = lock.get_mut(&Traits::state().body);
            if body.started {
                return Err(CreateError::BadContext);
            }
            let slot = create_in(body, entry, stack, priority, name).ok_or(CreateError::NoResource)?;
            // Safety: CPU Lock active, the slot was just claimed
            let sp = unsafe { Traits::initialize_task_state(TaskRef(slot), entry, stack) };
            body.tasks[slot].stack_ptr = sp;
            Ok(Id::new(slot + 1).unwrap())
        })
    }

    /// Put the current task to sleep for `ms` milliseconds.
    ///
    /// Returns success both when the full duration elapses and when another
    /// task cuts the sleep short with [`System::task_resume`].
    pub fn task_sleep(ms: TimeMs) -> Result<(), SleepError> {
        gate::expect_task_context::<Traits>()?;
        if ms == 0 {
            return Ok(());
        }
        gate::invoke::<Traits, _, _>(|lock| {
            let body = lock.get_mut(&Traits::state().body);
            let slot = body.running.expect("no running task");
            sched::exit_trigger(body, slot, ExitTarget::Park, ms);
        });
        let (raw, _) = sched::finish_wait::<Traits>();
        match raw {
            x if x == 0 || x == ResultCode::Timeout.raw() => Ok(()),
            _ => Err(SleepError::Internal),
        }
    }

    /// Let other ready tasks of the same priority run.
    ///
    /// The current task is re-inserted behind its equal-priority peers; if
    /// there are none, it keeps the processor.
    pub fn task_yield() -> Result<(), YieldError> {
        gate::expect_task_context::<Traits>()?;
        gate::invoke::<Traits, _, _>(|lock| {
            let body = lock.get_mut(&Traits::state().body);
            let slot = body.running.expect("no running task");
            sched::exit_trigger(body, slot, ExitTarget::Ready, 0);
        });
        Ok(())
    }

    /// Suspend a task until [`System::task_resume`]. Suspending the current
    /// task blocks; suspending another task requires it to be ready.
    pub fn task_suspend(id: TaskId) -> Result<(), SuspendError> {
        gate::expect_task_context::<Traits>()?;
        let pending = gate::invoke::<Traits, _, _>(|lock| -> Result<bool, SuspendError> {
            let body = lock.get_mut(&Traits::state().body);
            let slot = task_index(body, id)?;
            if body.running == Some(slot) {
                sched::exit_trigger(body, slot, ExitTarget::Park, TIME_FOREVER);
                Ok(true)
            } else if body.tasks[slot].linkage == Linkage::Ready {
                body.unlink_task(slot);
                body.link_park(slot);
                Ok(false)
            } else {
                Err(SuspendError::BadObjectState)
            }
        })?;
        if pending {
            let (raw, _) = sched::finish_wait::<Traits>();
            match raw {
                0 => Ok(()),
                _ => Err(SuspendError::Internal),
            }
        } else {
            Ok(())
        }
    }

    /// Resume a sleeping or suspended task.
    pub fn task_resume(id: TaskId) -> Result<(), ResumeError> {
        gate::expect_task_context::<Traits>()?;
        gate::invoke::<Traits, _, _>(|lock| {
            let body = lock.get_mut(&Traits::state().body);
            let slot = task_index(body, id)?;
            if body.tasks[slot].linkage == Linkage::Parked {
                sched::entry_trigger(body, slot, None, 0);
                Ok(())
            } else {
                Err(ResumeError::BadObjectState)
            }
        })
    }

    /// Delete a task, clearing its stack and freeing its slot. The target
    /// must be the current task or a parked (sleeping or suspended) one.
    pub fn task_delete(id: TaskId) -> Result<(), DeleteError> {
        gate::expect_task_context::<Traits>()?;
        let reclaimed = gate::invoke::<Traits, _, _>(|lock| -> Result<Option<usize>, DeleteError> {
            let body = lock.get_mut(&Traits::state().body);
            let slot = task_index(body, id)?;
            if body.running == Some(slot) {
                sched::exit_trigger(body, slot, ExitTarget::Drop, 0);
                Ok(None)
            } else if body.tasks[slot].linkage == Linkage::Parked {
                crate::timeout::remove(body, slot);
                body.unlink_task(slot);
                body.tasks[slot].stack.clear();
                body.tasks[slot] = TaskCb::INIT;
                Ok(Some(slot))
            } else {
                Err(DeleteError::BadObjectState)
            }
        })?;
        match reclaimed {
            Some(slot) => {
                // Safety: the slot was freed above
                unsafe { Traits::reclaim_task_state(TaskRef(slot)) };
                Ok(())
            }
            None => {
                // Self-deletion: a conforming port services the pend-switch
                // before returning to task context, and this context is gone.
                unreachable!("self-deleted task kept running")
            }
        }
    }

    /// Terminate the current task. Intended for ports whose task entry
    /// functions can return.
    pub fn task_exit() -> ! {
        gate::invoke::<Traits, _, _>(|lock| {
            let body = lock.get_mut(&Traits::state().body);
            if let Some(slot) = body.running {
                sched::exit_trigger(body, slot, ExitTarget::Drop, 0);
            }
        });
        // A conforming port never resumes this context.
        loop {
            core::hint::spin_loop();
        }
    }

    /// Read a task's scheduling analytics.
    pub fn task_stats(id: TaskId) -> Result<TaskStats, QueryError> {
        gate::invoke::<Traits, _, _>(|lock| {
            let body = lock.get_mut(&Traits::state().body);
            let slot = task_index(body, id)?;
            Ok(body.tasks[slot].stats)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::test_support::*;

    #[test]
    fn create_claims_first_vacant_slot() {
        let mut body = body();
        let a = spawn(&mut body, 2, "a");
        let b = spawn(&mut body, 2, "b");
        assert_eq!((a, b), (0, 1));
        assert!(body.tasks[a].init);
        assert_eq!(body.tasks[b].name, "b");

        // Freeing a slot makes it the next claimed one.
        body.unlink_task(a);
        body.tasks[a] = TaskCb::INIT;
        let c = spawn(&mut body, 3, "c");
        assert_eq!(c, a);
    }

    #[test]
    fn create_exhausts_range() {
        let mut body = body();
        for i in 0..cfg::TASK_SLOTS {
            assert_eq!(spawn(&mut body, 2, "t"), i);
        }
        assert!(create_in(&mut body, || {}, StackRegion::empty(), 2, "x").is_none());
    }

    #[test]
    fn task_index_validates() {
        let mut body = body();
        let a = spawn(&mut body, 2, "a");
        let id = Id::new(a + 1).unwrap();
        assert_eq!(task_index(&body, id), Ok(a));
        assert_eq!(
            task_index(&body, Id::new(cfg::TASK_SLOTS + 1).unwrap()),
            Err(AccessError::BadId)
        );
        assert_eq!(
            task_index(&body, Id::new(a + 2).unwrap()),
            Err(AccessError::NotInitialized)
        );
    }
}
