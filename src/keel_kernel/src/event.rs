//! Event flags
//!
//! A 32-bit signal word with per-bit triggering disciplines:
//!
//! - a bit in `any_mask` fires on every change;
//! - otherwise, a bit in `mode_mask` is edge-sensitive (`dir_mask` selects
//!   rising vs falling);
//! - otherwise it is level-sensitive (`dir_mask` selects high vs low).
//!
//! Edge firings are latched in `triggered` until some waiter observes them,
//! so a task that starts waiting after the edge still sees it. Level bits
//! are never latched; they are recomputed against the current value whenever
//! a task starts waiting, and again on the wake path, so they always reflect
//! the present state.
use crate::{
    cfg,
    error::{AccessError, CreateError, ReadEventError, ResultCode, SetEventError, WaitEventError},
    gate,
    list::{Cursor, ListHead},
    sched::{self, StateBody},
    task::{ExitTarget, PendPayload, WaitSource},
    utils::Init,
    Id, KernelTraits, System, TimeMs,
};

pub type EventId = Id;

/// A waiter's view of an event, carried across calls to
/// [`System::event_wait`]: the last observed value and the trigger bits
/// reported by the last successful wait.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventCapture {
    pub value: u32,
    pub trigger: u32,
}

impl EventCapture {
    pub const fn new() -> Self {
        Self {
            value: 0,
            trigger: 0,
        }
    }
}

/// *Event control block* - the state data of an event.
pub(crate) struct EventCb {
    pub(crate) init: bool,
    pub(crate) name: &'static str,
    pub(crate) wait: ListHead,
    /// The signal word.
    pub(crate) value: u32,
    /// Latched edge firings not yet observed by any waiter. Only bits in
    /// `any_mask | mode_mask` may appear here.
    pub(crate) triggered: u32,
    pub(crate) any_mask: u32,
    pub(crate) mode_mask: u32,
    pub(crate) dir_mask: u32,
}

impl Init for EventCb {
    const INIT: Self = Self {
        init: false,
        name: "",
        wait: ListHead::INIT,
        value: 0,
        triggered: 0,
        any_mask: 0,
        mode_mask: 0,
        dir_mask: 0,
    };
}

pub(crate) fn event_index(body: &StateBody, id: EventId) -> Result<usize, AccessError> {
    let i = id.get() - 1;
    if i >= cfg::EVENT_SLOTS {
        return Err(AccessError::BadId);
    }
    if !body.events[i].init {
        return Err(AccessError::NotInitialized);
    }
    Ok(i)
}

/// The per-bit trigger expression for a transition from `new ^ changed` to
/// `new`.
fn trigger_bits(any: u32, mode: u32, dir: u32, new: u32, changed: u32) -> u32 {
    let edge = mode & !any;
    let level = !mode & !any;
    (any & changed)
        | (edge & new & dir & changed)
        | (edge & !new & !dir & changed)
        | (level & new & dir & changed)
        | (level & !new & !dir & changed)
}

/// Compute the trigger bits a waiter that last saw `seen` would observe
/// against the event's current state, including the latch.
fn pending_trigger(e: &EventCb, seen: u32) -> u32 {
    let changed = e.value ^ seen;
    let fresh = if changed != 0 {
        trigger_bits(e.any_mask, e.mode_mask, e.dir_mask, e.value, changed)
    } else {
        0
    };
    fresh | e.triggered
}

/// The privileged part of `set`: update the signal word, compute the trigger
/// set, and report it to every listening waiter.
pub(crate) fn set_in(body: &mut StateBody, i: usize, set: u32, clear: u32, toggle: u32) {
    let e = &body.events[i];
    let old = e.value;
    let new = ((old & !clear) | set) ^ toggle;
    let changed = new ^ old;
    let mut trigger = if changed != 0 {
        trigger_bits(e.any_mask, e.mode_mask, e.dir_mask, new, changed)
    } else {
        0
    };
    trigger |= e.triggered;
    // Only change-latching disciplines may persist in `triggered`; level
    // bits must keep tracking the live value.
    let latchable = e.any_mask | e.mode_mask;

    let mut reported = 0u32;
    let mut cur = Cursor::new(&body.events[i].wait);
    while let Some(waiter) = cur.next(&body.task_links) {
        let PendPayload::Event { listen, .. } = &body.tasks[waiter].pend else {
            log::error!("event waiter {} without a record", body.tasks[waiter].name);
            continue;
        };
        let report = trigger & *listen;
        if report == 0 {
            continue;
        }
        reported |= report;
        if let PendPayload::Event {
            out_value,
            out_trigger,
            ..
        } = &mut body.tasks[waiter].pend
        {
            *out_value = new;
            *out_trigger = trigger;
        }
        sched::entry_trigger(body, waiter, Some(refresh), ResultCode::Success.raw());
    }

    body.events[i].triggered = trigger & !reported & latchable;
    body.events[i].value = new;
}

/// Entry-staging callback for woken event waiters: the signal word may have
/// moved again between the wake and the drain, so refresh the waiter's
/// outputs against the current state.
fn refresh(body: &mut StateBody, slot: usize) {
    let Some(WaitSource::Event(i)) = body.tasks[slot].pending_on else {
        return;
    };
    let (listen, seen) = match &body.tasks[slot].pend {
        PendPayload::Event {
            listen, out_value, ..
        } => (*listen, *out_value),
        _ => return,
    };
    let trigger = pending_trigger(&body.events[i], seen);
    let report = trigger & listen;
    let value = body.events[i].value;
    if report != 0 {
        body.events[i].triggered &= !report;
    }
    if let PendPayload::Event {
        out_value,
        out_trigger,
        ..
    } = &mut body.tasks[slot].pend
    {
        *out_value = value;
        if report != 0 {
            *out_trigger = trigger;
        }
    }
}

/// Report pending triggers to freshly enqueued waiters. Runs after the exit
/// drain links a staged waiter, covering a `set` that raced ahead of it from
/// interrupt context.
pub(crate) fn repoll(body: &mut StateBody, i: usize) {
    let mut cur = Cursor::new(&body.events[i].wait);
    while let Some(waiter) = cur.next(&body.task_links) {
        let (listen, seen) = match &body.tasks[waiter].pend {
            PendPayload::Event {
                listen, out_value, ..
            } => (*listen, *out_value),
            _ => continue,
        };
        let trigger = pending_trigger(&body.events[i], seen);
        let report = trigger & listen;
        if report == 0 {
            continue;
        }
        body.events[i].triggered &= !report;
        let value = body.events[i].value;
        if let PendPayload::Event {
            out_value,
            out_trigger,
            ..
        } = &mut body.tasks[waiter].pend
        {
            *out_value = value;
            *out_trigger = trigger;
        }
        sched::entry_trigger(body, waiter, None, ResultCode::Success.raw());
    }
}

enum WaitStep {
    Done { value: u32, trigger: u32 },
    Pending,
}

impl<Traits: KernelTraits> System<Traits> {
    /// Create an event with the given per-bit trigger configuration and
    /// initial value.
    pub fn event_create(
        any_mask: u32,
        mode_mask: u32,
        dir_mask: u32,
        init_value: u32,
        name: &'static str,
    ) -> Result<EventId, CreateError> {
        gate::invoke::<Traits, _, _>(|lock| {
            let body = lock.get_mut(&Traits::state().body);
            let slot = body
                .events
                .iter()
                .position(|e| !e.init)
                .ok_or(CreateError::NoResource)?;
            body.events[slot] = EventCb {
                init: true,
                name,
                wait: ListHead::INIT,
                value: init_value,
                triggered: 0,
                any_mask,
                mode_mask,
                dir_mask,
            };
            Ok(Id::new(slot + 1).unwrap())
        })
    }

    /// Set, clear and toggle signal bits, waking every waiter whose listen
    /// mask intersects the resulting trigger set. Callable from interrupt
    /// context.
    pub fn event_set(id: EventId, set: u32, clear: u32, toggle: u32) -> Result<(), SetEventError> {
        gate::invoke::<Traits, _, _>(|lock| {
            let body = lock.get_mut(&Traits::state().body);
            let i = event_index(body, id)?;
            set_in(body, i, set, clear, toggle);
            Ok(())
        })
    }

    /// Wait for any of the bits in `listen` to trigger.
    ///
    /// `cap` carries the caller's last observed value into the call (edges
    /// are detected against it) and receives the reported value and trigger
    /// set on success. On timeout no trigger bits are consumed and `cap` is
    /// untouched.
    pub fn event_wait(
        id: EventId,
        cap: &mut EventCapture,
        listen: u32,
        timeout: TimeMs,
    ) -> Result<(), WaitEventError> {
        gate::expect_task_context::<Traits>()?;
        let step = gate::invoke::<Traits, _, _>(|lock| -> Result<WaitStep, WaitEventError> {
            let body = lock.get_mut(&Traits::state().body);
            let i = event_index(body, id)?;
            let trigger = pending_trigger(&body.events[i], cap.value);
            let report = trigger & listen;
            let value = body.events[i].value;
            if report != 0 {
                body.events[i].triggered &= !report;
                return Ok(WaitStep::Done { value, trigger });
            }
            if timeout == 0 {
                return Err(WaitEventError::NoResource);
            }
            let slot = body.running.expect("no running task");
            body.tasks[slot].pend = PendPayload::Event {
                listen,
                // Synchronize the waiter's snapshot so the setter computes
                // edges against what this task has really seen.
                out_value: value,
                out_trigger: 0,
            };
            sched::exit_trigger(body, slot, ExitTarget::Wait(WaitSource::Event(i)), timeout);
            Ok(WaitStep::Pending)
        })?;
        match step {
            WaitStep::Done { value, trigger } => {
                cap.value = value;
                cap.trigger = trigger;
                Ok(())
            }
            WaitStep::Pending => {
                let (raw, payload) = sched::finish_wait::<Traits>();
                match raw {
                    x if x == ResultCode::Success.raw() => {
                        if let PendPayload::Event {
                            out_value,
                            out_trigger,
                            ..
                        } = payload
                        {
                            cap.value = out_value;
                            cap.trigger = out_trigger;
                            Ok(())
                        } else {
                            Err(WaitEventError::Internal)
                        }
                    }
                    x if x == ResultCode::Timeout.raw() => Err(WaitEventError::Timeout),
                    _ => Err(WaitEventError::Internal),
                }
            }
        }
    }

    /// Read the current signal word.
    pub fn event_read(id: EventId) -> Result<u32, ReadEventError> {
        gate::invoke::<Traits, _, _>(|lock| {
            let body = lock.get_mut(&Traits::state().body);
            let i = event_index(body, id)?;
            Ok(body.events[i].value)
        })
    }
}
