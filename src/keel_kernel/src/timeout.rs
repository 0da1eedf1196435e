//! Time wheel
//!
//! Pending deadlines are kept in one expiry-ordered list keyed by absolute
//! milliseconds. Deadline nodes live in a fixed arena: node `i < TASK_SLOTS`
//! belongs to task `i` (its wait timeout), node `TASK_SLOTS + j` to software
//! timer `j`.
//!
//! Time values wrap around every 2³² ms; comparisons use the signed
//! difference, so a deadline may be at most 2³¹ ms (~24.8 days) in the
//! future.
//!
//! Timeouts fire in expiry order; ties fire in insertion order. The tick
//! drain unlinks a node *before* dispatching its owner, so an owner that
//! re-arms the node during dispatch cannot corrupt the walk.
use arrayvec::ArrayVec;

use crate::{
    cfg, klock,
    sched::{self, StateBody},
    timer,
    utils::Init,
    KernelTraits, TimeMs, TIME_FOREVER,
};

/// A deadline, sorted into the time wheel while armed.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DeadlineNode {
    pub(crate) expires_at: TimeMs,
    pub(crate) linked: bool,
}

impl Init for DeadlineNode {
    const INIT: Self = Self {
        expires_at: 0,
        linked: false,
    };
}

/// Whether `at` has been reached at time `now`, modulo wrap-around.
#[inline]
fn due(now: TimeMs, at: TimeMs) -> bool {
    (now.wrapping_sub(at) as i32) >= 0
}

/// Whether a node expiring at `a` may stay ahead of one expiring at `b`.
/// Equal expiries answer yes, which keeps ties in insertion order.
#[inline]
fn in_order(a: TimeMs, b: TimeMs) -> bool {
    (b.wrapping_sub(a) as i32) >= 0
}

/// Install or update a deadline `ms` milliseconds from `now`.
///
/// [`TIME_FOREVER`] means "no deadline" and unlinks the node. An armed node
/// is re-sorted at the new expiry. An idle node is linked only when
/// `link_if_unlinked` is set; otherwise the expiry is merely stored (used by
/// stopped timers to remember their remaining delay).
pub(crate) fn set(
    body: &mut StateBody,
    node: usize,
    now: TimeMs,
    ms: TimeMs,
    link_if_unlinked: bool,
) {
    if ms == TIME_FOREVER {
        remove(body, node);
        return;
    }
    let at = now.wrapping_add(ms);
    if body.nodes[node].linked {
        body.wheel.unlink(&mut body.node_links, node);
    } else if !link_if_unlinked {
        body.nodes[node].expires_at = at;
        return;
    }
    link_at(body, node, at);
}

/// Link a node at an absolute expiry time.
pub(crate) fn link_at(body: &mut StateBody, node: usize, at: TimeMs) {
    body.nodes[node].expires_at = at;
    let StateBody {
        wheel,
        node_links,
        nodes,
        ..
    } = body;
    wheel.insert_sorted(node_links, node, |c, n| {
        in_order(nodes[c].expires_at, nodes[n].expires_at)
    });
    body.nodes[node].linked = true;
}

/// Unlink a deadline. Idempotent.
pub(crate) fn remove(body: &mut StateBody, node: usize) {
    if body.nodes[node].linked {
        body.wheel.unlink(&mut body.node_links, node);
        body.nodes[node].linked = false;
    }
}

/// Timer callbacks collected by one tick drain, to be invoked after the
/// privileged section ends.
pub(crate) type FiredTimers = ArrayVec<(fn(usize), usize), { cfg::TIMER_SLOTS }>;

/// Fire every deadline that is due at `now`, in expiry order.
pub(crate) fn tick_drain(body: &mut StateBody, now: TimeMs) -> FiredTimers {
    let mut fired = FiredTimers::new();
    while let Some(head) = body.wheel.head() {
        if !due(now, body.nodes[head].expires_at) {
            break;
        }
        body.wheel.unlink(&mut body.node_links, head);
        body.nodes[head].linked = false;
        if head < cfg::TASK_SLOTS {
            sched::timeout_fired(body, head);
        } else {
            timer::fired(body, head - cfg::TASK_SLOTS, &mut fired);
        }
    }
    fired
}

/// Implements [`PortToKernel::timer_tick`](crate::PortToKernel::timer_tick).
pub(crate) unsafe fn tick<Traits: KernelTraits>() {
    let fired = {
        // The port enters the tick handler with CPU Lock inactive
        let mut lock = klock::CpuLock::<Traits>::acquire().expect("tick with CPU Lock active");
        let now = Traits::now_ms();
        let body = lock.get_mut(&Traits::state().body);
        let fired = tick_drain(body, now);
        sched::service_switch_request::<Traits>(&mut lock);
        fired
    };
    // User timer callbacks run without the lock; they are in interrupt
    // context, so they may re-enter the kernel through `give`/`set`.
    for (f, param) in fired {
        f(param);
    }
}
