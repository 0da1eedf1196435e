//! Semaphores
use crate::{
    error::{AccessError, CreateError, FlushSemaphoreError, GiveSemaphoreError, ResultCode,
        TakeSemaphoreError},
    gate,
    list::ListHead,
    sched::{self, StateBody},
    task::{ExitTarget, PendPayload, WaitSource},
    utils::Init,
    cfg, Id, KernelTraits, System, TimeMs,
};

pub type SemaphoreId = Id;

/// *Semaphore control block* - the state data of a counting semaphore.
pub(crate) struct SemaphoreCb {
    pub(crate) init: bool,
    pub(crate) name: &'static str,
    /// Tasks blocked in `take`, in effective-priority order.
    pub(crate) wait: ListHead,
    pub(crate) available: u8,
    pub(crate) limit: u8,
}

impl Init for SemaphoreCb {
    const INIT: Self = Self {
        init: false,
        name: "",
        wait: ListHead::INIT,
        available: 0,
        limit: 0,
    };
}

pub(crate) fn semaphore_index(body: &StateBody, id: SemaphoreId) -> Result<usize, AccessError> {
    let i = id.get() - 1;
    if i >= cfg::SEMAPHORE_SLOTS {
        return Err(AccessError::BadId);
    }
    if !body.semaphores[i].init {
        return Err(AccessError::NotInitialized);
    }
    Ok(i)
}

/// Release one permit: hand it to the head waiter if there is one, deposit
/// it otherwise.
pub(crate) fn give_in(body: &mut StateBody, i: usize) -> Result<(), GiveSemaphoreError> {
    if let Some(waiter) = body.semaphores[i].wait.head() {
        sched::entry_trigger(body, waiter, None, ResultCode::Success.raw());
        Ok(())
    } else if body.semaphores[i].available < body.semaphores[i].limit {
        body.semaphores[i].available += 1;
        Ok(())
    } else {
        Err(GiveSemaphoreError::Full)
    }
}

/// Hand deposited permits to newly enqueued waiters. Runs after the exit
/// drain links a staged waiter, covering a `give` that raced ahead of it
/// from interrupt context.
pub(crate) fn repoll(body: &mut StateBody, i: usize) {
    while body.semaphores[i].available > 0 {
        let Some(waiter) = body.semaphores[i].wait.head() else {
            break;
        };
        body.semaphores[i].available -= 1;
        sched::entry_trigger(body, waiter, None, ResultCode::Success.raw());
    }
}

impl<Traits: KernelTraits> System<Traits> {
    /// Create a counting semaphore with `available` initial permits and a
    /// capacity of `limit`.
    pub fn semaphore_create(
        available: u8,
        limit: u8,
        name: &'static str,
    ) -> Result<SemaphoreId, CreateError> {
        if limit == 0 || available > limit {
            return Err(CreateError::BadParam);
        }
        gate::invoke::<Traits, _, _>(|lock| {
            let body = lock.get_mut(&Traits::state().body);
            let slot = body
                .semaphores
                .iter()
                .position(|s| !s.init)
                .ok_or(CreateError::NoResource)?;
            body.semaphores[slot] = SemaphoreCb {
                init: true,
                name,
                wait: ListHead::INIT,
                available,
                limit,
            };
            Ok(Id::new(slot + 1).unwrap())
        })
    }

    /// Take one permit, blocking for up to `timeout` milliseconds.
    ///
    /// A `timeout` of zero polls: "would block" surfaces as `NoResource`.
    pub fn semaphore_take(id: SemaphoreId, timeout: TimeMs) -> Result<(), TakeSemaphoreError> {
        gate::expect_task_context::<Traits>()?;
        let pending = gate::invoke::<Traits, _, _>(|lock| -> Result<bool, TakeSemaphoreError> {
            let body = lock.get_mut(&Traits::state().body);
            let i = semaphore_index(body, id)?;
            if body.semaphores[i].available > 0 {
                body.semaphores[i].available -= 1;
                return Ok(false);
            }
            if timeout == 0 {
                return Err(TakeSemaphoreError::NoResource);
            }
            let slot = body.running.expect("no running task");
            body.tasks[slot].pend = PendPayload::Semaphore;
            sched::exit_trigger(body, slot, ExitTarget::Wait(WaitSource::Semaphore(i)), timeout);
            Ok(true)
        })?;
        if !pending {
            return Ok(());
        }
        let (raw, _) = sched::finish_wait::<Traits>();
        match raw {
            x if x == ResultCode::Success.raw() => Ok(()),
            x if x == ResultCode::Timeout.raw() => Err(TakeSemaphoreError::Timeout),
            x if x == ResultCode::Flushed.raw() => Err(TakeSemaphoreError::Flushed),
            _ => Err(TakeSemaphoreError::Internal),
        }
    }

    /// Release one permit, waking the head waiter if any. Callable from
    /// interrupt context.
    pub fn semaphore_give(id: SemaphoreId) -> Result<(), GiveSemaphoreError> {
        gate::invoke::<Traits, _, _>(|lock| {
            let body = lock.get_mut(&Traits::state().body);
            let i = semaphore_index(body, id)?;
            give_in(body, i)
        })
    }

    /// Release every waiter with a `Flushed` result. The permit count is
    /// unchanged.
    pub fn semaphore_flush(id: SemaphoreId) -> Result<(), FlushSemaphoreError> {
        gate::expect_task_context::<Traits>()?;
        gate::invoke::<Traits, _, _>(|lock| {
            let body = lock.get_mut(&Traits::state().body);
            let i = semaphore_index(body, id)?;
            while let Some(waiter) = body.semaphores[i].wait.head() {
                sched::entry_trigger(body, waiter, None, ResultCode::Flushed.raw());
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::test_support::*;
    use crate::task::Linkage;
    use crate::timeout;

    fn make_sem(body: &mut StateBody, available: u8, limit: u8) -> usize {
        let i = body.semaphores.iter().position(|s| !s.init).unwrap();
        body.semaphores[i] = SemaphoreCb {
            init: true,
            name: "sem",
            wait: ListHead::INIT,
            available,
            limit,
        };
        i
    }

    fn block_on_take(body: &mut StateBody, slot: usize, sem: usize, timeout: TimeMs) {
        body.tasks[slot].pend = PendPayload::Semaphore;
        sched::exit_trigger(body, slot, ExitTarget::Wait(WaitSource::Semaphore(sem)), timeout);
    }

    #[test]
    fn give_wakes_exactly_one_waiter_in_order() {
        let mut body = body();
        let a = spawn(&mut body, 2, "a");
        let b = spawn(&mut body, 2, "b");
        let main = spawn(&mut body, 1, "main");
        start(&mut body);
        assert_eq!(body.running, Some(main));
        let s = make_sem(&mut body, 0, 3);

        // A then B block on the semaphore (equal priority, FIFO).
        block_on_take(&mut body, a, s, crate::TIME_FOREVER);
        block_on_take(&mut body, b, s, crate::TIME_FOREVER);
        reschedule(&mut body, 0);
        let waiters: Vec<usize> = body.semaphores[s].wait.iter(&body.task_links).collect();
        assert_eq!(waiters, vec![a, b]);

        give_in(&mut body, s).unwrap();
        reschedule(&mut body, 1);
        // A woke with success; B still blocked; no permit deposited.
        assert!(matches!(body.tasks[a].linkage, Linkage::Ready));
        assert!(matches!(body.tasks[b].linkage, Linkage::Waiting(_)));
        assert_eq!(body.semaphores[s].available, 0);
    }

    #[test]
    fn give_deposits_up_to_limit() {
        let mut body = body();
        let s = make_sem(&mut body, 0, 2);
        assert!(give_in(&mut body, s).is_ok());
        assert!(give_in(&mut body, s).is_ok());
        assert_eq!(give_in(&mut body, s), Err(GiveSemaphoreError::Full));
        assert_eq!(body.semaphores[s].available, 2);
    }

    #[test]
    fn flush_releases_all_waiters() {
        let mut body = body();
        let a = spawn(&mut body, 2, "a");
        let b = spawn(&mut body, 3, "b");
        let main = spawn(&mut body, 1, "main");
        start(&mut body);
        let _ = main;
        let s = make_sem(&mut body, 0, 1);

        block_on_take(&mut body, a, s, crate::TIME_FOREVER);
        block_on_take(&mut body, b, s, crate::TIME_FOREVER);
        reschedule(&mut body, 0);

        while let Some(w) = body.semaphores[s].wait.head() {
            sched::entry_trigger(&mut body, w, None, ResultCode::Flushed.raw());
        }
        assert!(body.semaphores[s].wait.is_empty());
        reschedule(&mut body, 1);
        assert_eq!(body.tasks[a].entry_rec.result, ResultCode::Flushed.raw());
        assert_eq!(body.tasks[b].entry_rec.result, ResultCode::Flushed.raw());
        assert_eq!(body.semaphores[s].available, 0);
    }

    #[test]
    fn repoll_catches_wake_that_raced_the_drain() {
        let mut body = body();
        let a = spawn(&mut body, 2, "a");
        let _main = spawn(&mut body, 1, "main");
        start(&mut body);
        let s = make_sem(&mut body, 0, 1);

        // `a` stages a block; before the drain runs, an interrupt-context
        // give finds nobody waiting and deposits the permit.
        block_on_take(&mut body, a, s, crate::TIME_FOREVER);
        give_in(&mut body, s).unwrap();
        assert_eq!(body.semaphores[s].available, 1);

        // The drain links `a` into the wait queue and re-polls: the permit
        // is consumed and `a` is woken rather than stranded.
        reschedule(&mut body, 0);
        assert_eq!(body.semaphores[s].available, 0);
        assert!(body.semaphores[s].wait.is_empty());
        assert!(matches!(body.tasks[a].linkage, Linkage::Ready));
        assert_eq!(body.tasks[a].entry_rec.result, ResultCode::Success.raw());
    }

    #[test]
    fn timeout_and_give_race_has_one_winner() {
        // Whatever order the tick and the give land in, exactly one of
        // {success, timeout} is delivered and the permit count matches.
        for give_first in [true, false] {
            let mut body = body();
            let a = spawn(&mut body, 2, "a");
            let _main = spawn(&mut body, 1, "main");
            start(&mut body);
            let s = make_sem(&mut body, 0, 1);

            block_on_take(&mut body, a, s, 5);
            reschedule(&mut body, 0);
            assert!(body.nodes[a].linked);

            if give_first {
                give_in(&mut body, s).unwrap();
                timeout::tick_drain(&mut body, 5);
            } else {
                timeout::tick_drain(&mut body, 5);
                give_in(&mut body, s).unwrap();
            }
            reschedule(&mut body, 5);

            let raw = body.tasks[a].entry_rec.result;
            if give_first {
                assert_eq!(raw, ResultCode::Success.raw());
                assert_eq!(body.semaphores[s].available, 0);
            } else {
                assert_eq!(raw, ResultCode::Timeout.raw());
                assert_eq!(body.semaphores[s].available, 1);
            }
            assert!(body.semaphores[s].wait.is_empty());
            assert!(!body.nodes[a].linked);
        }
    }
}
