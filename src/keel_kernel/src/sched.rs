//! Scheduler core
//!
//! All mutable kernel state lives in [`StateBody`], one instance per system
//! type, guarded by the CPU Lock (see [`klock`](crate::klock)). Primitives
//! never touch the ready queue directly: they stage the current task on the
//! exit list to block it ([`exit_trigger`]) or stage a waiter on the entry
//! list to wake it ([`entry_trigger`]), then the pend-switch handler drains
//! both lists, rebuilds the ready queue, and elects the next running task.
//!
//! The entry-staging drain is the linearization point for racing wake-ups
//! and timeouts: whichever party moves the task to entry staging first wins,
//! and the loser's trigger finds the task no longer waiting and does
//! nothing.
use arrayvec::ArrayVec;
use core::mem;

use crate::{
    cfg,
    error::ResultCode,
    event::{self, EventCb},
    klock::{CpuLock, CpuLockCell},
    list::{Cursor, Link, ListHead},
    mutex::{self, MutexCb},
    queue::{self, QueueCb},
    semaphore::{self, SemaphoreCb},
    task::{self, ExitRec, ExitTarget, Linkage, PendPayload, TaskCb, WaitSource},
    timeout::{self, DeadlineNode},
    timer::TimerCb,
    utils::Init,
    KernelTraits, StackRegion, TaskRef, TimeMs, TIME_FOREVER,
};

/// The sentinel stored in an entry-staging record that has not been given a
/// result yet. Distinct from every [`ResultCode`]; observing it on wake-up is
/// an internal error.
pub(crate) const RESULT_NONE: i32 = i32::MIN;

/// An entry-staging callback, invoked by the entry drain right before the
/// task is returned to the ready queue.
pub(crate) type EntryFn = fn(&mut StateBody, usize);

/// The statically allocated state of one kernel instance.
///
/// Place this in a `static` and return it from
/// [`KernelTraits::state`](crate::KernelTraits::state).
pub struct State<Traits> {
    pub(crate) body: CpuLockCell<Traits, StateBody>,
}

impl<Traits> State<Traits> {
    pub const fn new() -> Self {
        Self {
            body: CpuLockCell::new(StateBody::INIT),
        }
    }
}

impl<Traits> Init for State<Traits> {
    const INIT: Self = Self::new();
}

impl<Traits> Default for State<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

/// The contents of [`State`]: every descriptor range and scheduler list.
pub(crate) struct StateBody {
    pub(crate) tasks: [TaskCb; cfg::TASK_SLOTS],
    /// Linkage slots for the task arena. A task is linked in at most one of:
    /// the ready queue, a wait queue, entry staging, exit staging, the park
    /// list; which one is recorded in [`TaskCb::linkage`].
    pub(crate) task_links: [Link; cfg::TASK_SLOTS],
    pub(crate) ready: ListHead,
    pub(crate) entry_q: ListHead,
    pub(crate) exit_q: ListHead,
    /// Sleeping and suspended tasks.
    pub(crate) park_q: ListHead,

    /// Deadline nodes: tasks own `0..TASK_SLOTS`, timers own the rest.
    pub(crate) nodes: [DeadlineNode; cfg::TASK_SLOTS + cfg::TIMER_SLOTS],
    pub(crate) node_links: [Link; cfg::TASK_SLOTS + cfg::TIMER_SLOTS],
    /// Pending deadlines in expiry order.
    pub(crate) wheel: ListHead,

    pub(crate) semaphores: [SemaphoreCb; cfg::SEMAPHORE_SLOTS],
    pub(crate) mutexes: [MutexCb; cfg::MUTEX_SLOTS],
    pub(crate) events: [EventCb; cfg::EVENT_SLOTS],
    pub(crate) queues: [QueueCb; cfg::QUEUE_SLOTS],
    pub(crate) timers: [TimerCb; cfg::TIMER_SLOTS],

    pub(crate) running: Option<usize>,
    pub(crate) started: bool,
    /// Set by the staging triggers; converted into the port's pend-switch
    /// request when the privileged section ends.
    pub(crate) switch_requested: bool,
}

impl Init for StateBody {
    const INIT: Self = {
        const TASK: TaskCb = TaskCb::INIT;
        const NODE: DeadlineNode = DeadlineNode::INIT;
        const SEM: SemaphoreCb = SemaphoreCb::INIT;
        const MUTEX: MutexCb = MutexCb::INIT;
        const EVENT: EventCb = EventCb::INIT;
        const QUEUE: QueueCb = QueueCb::INIT;
        const TIMER: TimerCb = TimerCb::INIT;
        Self {
            tasks: [TASK; cfg::TASK_SLOTS],
            task_links: [None; cfg::TASK_SLOTS],
            ready: ListHead::INIT,
            entry_q: ListHead::INIT,
            exit_q: ListHead::INIT,
            park_q: ListHead::INIT,
            nodes: [NODE; cfg::TASK_SLOTS + cfg::TIMER_SLOTS],
            node_links: [None; cfg::TASK_SLOTS + cfg::TIMER_SLOTS],
            wheel: ListHead::INIT,
            semaphores: [SEM; cfg::SEMAPHORE_SLOTS],
            mutexes: [MUTEX; cfg::MUTEX_SLOTS],
            events: [EVENT; cfg::EVENT_SLOTS],
            queues: [QUEUE; cfg::QUEUE_SLOTS],
            timers: [TIMER; cfg::TIMER_SLOTS],
            running: None,
            started: false,
            switch_requested: false,
        }
    };
}

impl StateBody {
    /// Unlink a task from whichever list it currently occupies.
    pub(crate) fn unlink_task(&mut self, slot: usize) {
        match self.tasks[slot].linkage {
            Linkage::Detached => {}
            Linkage::Ready => {
                self.ready.unlink(&mut self.task_links, slot);
            }
            Linkage::EntryStaging => {
                self.entry_q.unlink(&mut self.task_links, slot);
            }
            Linkage::ExitStaging => {
                self.exit_q.unlink(&mut self.task_links, slot);
            }
            Linkage::Parked => {
                self.park_q.unlink(&mut self.task_links, slot);
            }
            Linkage::Waiting(src) => match src {
                WaitSource::Semaphore(i) => {
                    self.semaphores[i].wait.unlink(&mut self.task_links, slot);
                }
                WaitSource::Mutex(i) => {
                    self.mutexes[i].wait.unlink(&mut self.task_links, slot);
                }
                WaitSource::Event(i) => {
                    self.events[i].wait.unlink(&mut self.task_links, slot);
                }
                WaitSource::QueueTx(i) => {
                    self.queues[i].tx_wait.unlink(&mut self.task_links, slot);
                }
                WaitSource::QueueRx(i) => {
                    self.queues[i].rx_wait.unlink(&mut self.task_links, slot);
                }
            },
        }
        self.tasks[slot].linkage = Linkage::Detached;
    }

    /// Link a detached task into the ready queue, in effective-priority
    /// order, after any peers of equal priority.
    pub(crate) fn link_ready(&mut self, slot: usize) {
        debug_assert!(matches!(self.tasks[slot].linkage, Linkage::Detached));
        let Self {
            ready,
            task_links,
            tasks,
            ..
        } = self;
        ready.insert_sorted(task_links, slot, |c, n| {
            tasks[c].priority <= tasks[n].priority
        });
        self.tasks[slot].linkage = Linkage::Ready;
    }

    /// Link a detached task into the park list.
    pub(crate) fn link_park(&mut self, slot: usize) {
        debug_assert!(matches!(self.tasks[slot].linkage, Linkage::Detached));
        let Self {
            park_q,
            task_links,
            tasks,
            ..
        } = self;
        park_q.insert_sorted(task_links, slot, |c, n| {
            tasks[c].priority <= tasks[n].priority
        });
        self.tasks[slot].linkage = Linkage::Parked;
    }

    /// Link a detached task into a primitive's wait queue.
    pub(crate) fn link_wait(&mut self, slot: usize, src: WaitSource) {
        debug_assert!(matches!(self.tasks[slot].linkage, Linkage::Detached));
        let Self {
            semaphores,
            mutexes,
            events,
            queues,
            task_links,
            tasks,
            ..
        } = self;
        let in_order = |c: usize, n: usize| tasks[c].priority <= tasks[n].priority;
        match src {
            WaitSource::Semaphore(i) => semaphores[i].wait.insert_sorted(task_links, slot, in_order),
            WaitSource::Mutex(i) => mutexes[i].wait.insert_sorted(task_links, slot, in_order),
            WaitSource::Event(i) => events[i].wait.insert_sorted(task_links, slot, in_order),
            WaitSource::QueueTx(i) => queues[i].tx_wait.insert_sorted(task_links, slot, in_order),
            WaitSource::QueueRx(i) => queues[i].rx_wait.insert_sorted(task_links, slot, in_order),
        }
        self.tasks[slot].linkage = Linkage::Waiting(src);
    }

    /// Reposition a task after its effective priority changed.
    pub(crate) fn reorder(&mut self, slot: usize) {
        match self.tasks[slot].linkage {
            Linkage::Ready => {
                self.unlink_task(slot);
                self.link_ready(slot);
            }
            Linkage::Waiting(src) => {
                self.unlink_task(slot);
                self.link_wait(slot, src);
            }
            // Entry staging is drained FIFO and exit staging is about to be
            // re-sorted into a destination list anyway.
            _ => {}
        }
    }
}

/// Stage the current (or any ready) task for leaving the ready queue: record
/// its destination and timeout, move it to exit staging, and request a
/// pend-switch.
pub(crate) fn exit_trigger(body: &mut StateBody, slot: usize, target: ExitTarget, timeout_ms: TimeMs) {
    body.tasks[slot].pending_on = match target {
        ExitTarget::Wait(src) => Some(src),
        _ => None,
    };
    body.tasks[slot].exit_rec = Some(ExitRec { target, timeout_ms });
    body.unlink_task(slot);
    let StateBody {
        exit_q,
        task_links,
        tasks,
        ..
    } = body;
    exit_q.insert_sorted(task_links, slot, |c, n| {
        tasks[c].priority <= tasks[n].priority
    });
    body.tasks[slot].linkage = Linkage::ExitStaging;
    body.switch_requested = true;
}

/// Stage a waiting or parked task for re-entering the ready queue with the
/// given wake result, and request a pend-switch.
///
/// Returns `false` without touching anything if the task is not in a wakeable
/// state; this is how the loser of a wake/timeout race becomes a no-op.
pub(crate) fn entry_trigger(
    body: &mut StateBody,
    slot: usize,
    callback: Option<EntryFn>,
    result: i32,
) -> bool {
    match body.tasks[slot].linkage {
        Linkage::Waiting(_) | Linkage::Parked => {}
        _ => return false,
    }
    body.unlink_task(slot);
    body.tasks[slot].entry_rec.result = result;
    body.tasks[slot].entry_rec.callback = callback;
    body.entry_q.push_back(&mut body.task_links, slot);
    body.tasks[slot].linkage = Linkage::EntryStaging;
    body.switch_requested = true;
    true
}

/// The timeout callback for task deadline nodes: route the task through
/// entry staging with a `Timeout` result.
pub(crate) fn timeout_fired(body: &mut StateBody, slot: usize) {
    entry_trigger(body, slot, None, ResultCode::Timeout.raw());
}

fn drain_exit(body: &mut StateBody, now: TimeMs, dropped: &mut ArrayVec<usize, { cfg::TASK_SLOTS }>) {
    let mut cur = Cursor::new(&body.exit_q);
    while let Some(slot) = cur.next(&body.task_links) {
        let Some(rec) = body.tasks[slot].exit_rec.take() else {
            log::error!("task {:?} staged for exit without a record", slot);
            continue;
        };
        body.unlink_task(slot);
        if rec.timeout_ms > 0 && rec.timeout_ms != TIME_FOREVER {
            timeout::set(body, slot, now, rec.timeout_ms, true);
        }
        // Not scheduled yet: the wake-upper will fill this in.
        body.tasks[slot].entry_rec.result = RESULT_NONE;
        match rec.target {
            ExitTarget::Ready => body.link_ready(slot),
            ExitTarget::Park => body.link_park(slot),
            ExitTarget::Wait(src) => {
                body.link_wait(slot, src);
                // An interrupt-context wake may have fired while this task
                // sat in exit staging and found nobody waiting. Poll again
                // now that the task is enqueued, so that wake is not lost.
                repoll(body, src);
            }
            ExitTarget::Drop => {
                timeout::remove(body, slot);
                if body.running == Some(slot) {
                    body.running = None;
                }
                body.tasks[slot].stack.clear();
                body.tasks[slot] = TaskCb::INIT;
                let _ = dropped.try_push(slot);
            }
        }
    }
}

fn drain_entry(body: &mut StateBody, now: TimeMs) {
    let mut cur = Cursor::new(&body.entry_q);
    while let Some(slot) = cur.next(&body.task_links) {
        if let Some(f) = body.tasks[slot].entry_rec.callback.take() {
            f(body, slot);
        }
        // A woken task never keeps a pending deadline.
        timeout::remove(body, slot);
        body.unlink_task(slot);
        body.tasks[slot].pending_on = None;
        body.tasks[slot].stats.last_pend_ms = now;
        body.link_ready(slot);
    }
}

/// Re-poll a primitive after a staged waiter was linked into its wait queue.
fn repoll(body: &mut StateBody, src: WaitSource) {
    match src {
        WaitSource::Semaphore(i) => semaphore::repoll(body, i),
        WaitSource::Mutex(i) => mutex::repoll(body, i),
        WaitSource::Event(i) => event::repoll(body, i),
        WaitSource::QueueTx(i) => queue::repoll_tx(body, i),
        WaitSource::QueueRx(i) => queue::repoll_rx(body, i),
    }
}

/// The preempt gate: may the current task lose the processor?
///
/// The ready queue contains the running task while it runs. If it is still at
/// the head, every other ready task has a worse priority (FIFO tie-break
/// placed equal-priority newcomers behind it), so the switch would be a
/// no-op; suppressing it prevents oscillation when only one task is
/// eligible.
fn can_preempt(body: &StateBody) -> bool {
    let Some(running) = body.running else {
        return true;
    };
    body.ready.head() != Some(running)
}

/// What the pend-switch handler decided.
pub(crate) struct SwitchOutcome {
    /// `(previous, next)` if the processor changes hands.
    pub(crate) swap: Option<(Option<usize>, usize)>,
    /// Task slots freed by self-deletion; the port must reclaim their
    /// execution state.
    pub(crate) dropped: ArrayVec<usize, { cfg::TASK_SLOTS }>,
}

/// The pend-switch handler body. Runs with the CPU Lock held, in the port's
/// pend-switch interrupt context.
pub(crate) fn pend_switch(body: &mut StateBody, now: TimeMs) -> SwitchOutcome {
    let mut outcome = SwitchOutcome {
        swap: None,
        dropped: ArrayVec::new(),
    };
    body.switch_requested = false;
    if !body.started {
        return outcome;
    }

    drain_exit(body, now, &mut outcome.dropped);
    drain_entry(body, now);

    let prev = body.running;
    let Some(next) = body.ready.head() else {
        // Unreachable once the idle task exists; tolerate it before boot
        // completes.
        return outcome;
    };

    if !can_preempt(body) {
        return outcome;
    }

    if let Some(p) = prev {
        let stats = &mut body.tasks[p].stats;
        stats.last_run_ms = now.wrapping_sub(stats.last_active_ms);
        stats.total_run_ms = stats.total_run_ms.wrapping_add(stats.last_run_ms);
    }
    body.tasks[next].stats.last_active_ms = now;
    body.running = Some(next);

    if prev != Some(next) {
        outcome.swap = Some((prev, next));
    }
    outcome
}

/// Implements [`PortToKernel::switch_pending`](crate::PortToKernel::switch_pending).
pub(crate) unsafe fn switch_pending<Traits: KernelTraits>() {
    // The port enters the pend-switch handler with CPU Lock inactive, so
    // this can't fail
    let mut lock = CpuLock::<Traits>::acquire().expect("pend-switch with CPU Lock active");
    let now = Traits::now_ms();
    let body = lock.get_mut(&Traits::state().body);
    let outcome = pend_switch(body, now);
    drop(lock);

    for &slot in &outcome.dropped {
        // Safety: the slot was freed by the drain above
        unsafe { Traits::reclaim_task_state(TaskRef(slot)) };
    }
    if let Some((prev, next)) = outcome.swap {
        log::trace!("switching {:?} -> {}", prev, next);
        // Safety: we are on the pend-switch path
        unsafe { Traits::context_switch(prev.map(TaskRef), TaskRef(next)) };
    }
}

/// Convert a pending [`StateBody::switch_requested`] into the port's
/// pend-switch request. Called at the end of every privileged section.
pub(crate) fn service_switch_request<Traits: KernelTraits>(lock: &mut CpuLock<Traits>) {
    let body = lock.get_mut(&Traits::state().body);
    if body.switch_requested {
        body.switch_requested = false;
        // Safety: CPU Lock active
        unsafe { Traits::request_switch() };
    }
}

/// Read and clear the current task's wake result and waiter record.
///
/// Called by a blocking operation after it has been rescheduled.
pub(crate) fn finish_wait<Traits: KernelTraits>() -> (i32, PendPayload) {
    let mut lock = CpuLock::<Traits>::acquire().expect("wake-up read with CPU Lock active");
    let body = lock.get_mut(&Traits::state().body);
    // Only the running task reads its own result channel
    let slot = body.running.expect("no running task");
    let raw = mem::replace(&mut body.tasks[slot].entry_rec.result, RESULT_NONE);
    let payload = mem::replace(&mut body.tasks[slot].pend, PendPayload::None);
    if raw == RESULT_NONE {
        log::error!("task {} woke without a result", body.tasks[slot].name);
        return (ResultCode::Internal.raw(), payload);
    }
    (raw, payload)
}

/// Implements [`PortToKernel::boot`](crate::PortToKernel::boot).
pub(crate) unsafe fn boot<Traits: KernelTraits>() -> ! {
    let mut lock = CpuLock::<Traits>::acquire().expect("boot with CPU Lock active");
    let now = Traits::now_ms();
    let body = lock.get_mut(&Traits::state().body);
    assert!(!body.started, "kernel started twice");

    // The idle task keeps the ready queue populated forever.
    let slot = task::create_in(
        body,
        idle_entry::<Traits>,
        StackRegion::empty(),
        cfg::PRIORITY_IDLE,
        "idle",
    )
    .expect("no task slot left for the idle task");
    // Safety: CPU Lock active, the slot was just claimed
    let sp = unsafe {
        Traits::initialize_task_state(TaskRef(slot), idle_entry::<Traits>, StackRegion::empty())
    };
    body.tasks[slot].stack_ptr = sp;

    body.started = true;
    let first = body.ready.head().expect("ready queue empty at boot");
    body.running = Some(first);
    body.tasks[first].stats.last_active_ms = now;
    drop(lock);

    // Safety: called exactly once, CPU Lock inactive
    unsafe { Traits::run_first(TaskRef(first)) }
}

fn idle_entry<Traits: KernelTraits>() {
    loop {
        // Safety: this is the idle task's context
        unsafe { Traits::idle() };
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub(crate) fn body() -> Box<StateBody> {
        Box::new(StateBody::INIT)
    }

    pub(crate) fn spawn(body: &mut StateBody, priority: crate::Priority, name: &'static str) -> usize {
        task::create_in(body, || {}, StackRegion::empty(), priority, name).unwrap()
    }

    /// Mark the kernel started with the head of the ready queue running.
    pub(crate) fn start(body: &mut StateBody) {
        body.started = true;
        body.running = body.ready.head();
    }

    /// Drive one pend-switch at `now` and return the newly running slot.
    pub(crate) fn reschedule(body: &mut StateBody, now: TimeMs) -> Option<usize> {
        pend_switch(body, now);
        body.running
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn ready_queue_orders_by_priority_fifo_on_ties() {
        let mut body = body();
        let a = spawn(&mut body, 5, "a");
        let b = spawn(&mut body, 3, "b");
        let c = spawn(&mut body, 5, "c");
        let order: Vec<usize> = body.ready.iter(&body.task_links).collect();
        assert_eq!(order, vec![b, a, c]);
    }

    #[test]
    fn block_and_wake_round_trip() {
        let mut body = body();
        let a = spawn(&mut body, 2, "a");
        let b = spawn(&mut body, 3, "b");
        start(&mut body);
        assert_eq!(body.running, Some(a));

        // `a` blocks on semaphore 0 forever.
        body.semaphores[0].init = true;
        body.semaphores[0].limit = 1;
        exit_trigger(&mut body, a, ExitTarget::Wait(WaitSource::Semaphore(0)), TIME_FOREVER);
        assert!(body.switch_requested);
        assert_eq!(reschedule(&mut body, 10), Some(b));
        assert!(matches!(body.tasks[a].linkage, Linkage::Waiting(_)));
        assert_eq!(body.tasks[a].entry_rec.result, RESULT_NONE);

        // Wake `a` with success; it outranks `b`.
        assert!(entry_trigger(&mut body, a, None, 0));
        assert_eq!(reschedule(&mut body, 20), Some(a));
        assert_eq!(body.tasks[a].entry_rec.result, 0);
        assert_eq!(body.tasks[a].stats.last_pend_ms, 20);
        assert!(body.tasks[a].pending_on.is_none());
    }

    #[test]
    fn preempt_gate_keeps_sole_eligible_task() {
        let mut body = body();
        let a = spawn(&mut body, 2, "a");
        start(&mut body);
        let outcome = pend_switch(&mut body, 0);
        assert!(outcome.swap.is_none());
        assert_eq!(body.running, Some(a));
    }

    #[test]
    fn entry_trigger_is_single_winner() {
        let mut body = body();
        let a = spawn(&mut body, 2, "a");
        let _b = spawn(&mut body, 3, "b");
        start(&mut body);
        body.semaphores[0].init = true;
        body.semaphores[0].limit = 1;
        exit_trigger(&mut body, a, ExitTarget::Wait(WaitSource::Semaphore(0)), 5);
        reschedule(&mut body, 0);

        // First trigger wins; the second (the raced timeout) is a no-op.
        assert!(entry_trigger(&mut body, a, None, 0));
        assert!(!entry_trigger(&mut body, a, None, ResultCode::Timeout.raw()));
        reschedule(&mut body, 5);
        assert_eq!(body.tasks[a].entry_rec.result, 0);
    }

    #[test]
    fn exit_drain_arms_deadline_and_timeout_fires() {
        let mut body = body();
        let a = spawn(&mut body, 2, "a");
        let b = spawn(&mut body, 3, "b");
        start(&mut body);
        body.semaphores[0].init = true;
        body.semaphores[0].limit = 1;
        exit_trigger(&mut body, a, ExitTarget::Wait(WaitSource::Semaphore(0)), 10);
        assert_eq!(reschedule(&mut body, 0), Some(b));
        assert!(body.nodes[a].linked);

        // Tick before the deadline: nothing happens.
        timeout::tick_drain(&mut body, 9);
        assert!(matches!(body.tasks[a].linkage, Linkage::Waiting(_)));

        // Tick at the deadline: the task is routed through entry staging
        // with a timeout result.
        timeout::tick_drain(&mut body, 10);
        assert!(matches!(body.tasks[a].linkage, Linkage::EntryStaging));
        assert_eq!(reschedule(&mut body, 10), Some(a));
        assert_eq!(body.tasks[a].entry_rec.result, ResultCode::Timeout.raw());
        assert!(!body.nodes[a].linked);
        assert!(body.semaphores[0].wait.is_empty());
    }

    #[test]
    fn self_delete_clears_slot() {
        let mut body = body();
        let a = spawn(&mut body, 2, "a");
        let b = spawn(&mut body, 3, "b");
        start(&mut body);
        exit_trigger(&mut body, a, ExitTarget::Drop, 0);
        let outcome = pend_switch(&mut body, 0);
        assert_eq!(outcome.dropped.as_slice(), &[a]);
        assert!(!body.tasks[a].init);
        assert_eq!(body.running, Some(b));
    }
}
