//! Software timers
//!
//! Timers share the time wheel with task deadlines: timer `i` owns deadline
//! node `TASK_SLOTS + i`. Callbacks run in tick context with the kernel lock
//! released, so they may call the interrupt-safe operations
//! (`semaphore_give`, `event_set`) and the timer operations themselves.
use crate::{
    cfg,
    error::{AccessError, CreateError, QueryError, StartTimerError, StopTimerError},
    gate,
    sched::StateBody,
    timeout::{self, FiredTimers},
    utils::Init,
    Id, KernelTraits, System, TimeMs, TIME_FOREVER,
};

pub type TimerId = Id;

/// Whether a timer fires once or repeatedly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerMode {
    OneShot,
    Periodic,
}

/// *Timer control block* - the state data of a software timer.
pub(crate) struct TimerCb {
    pub(crate) init: bool,
    pub(crate) name: &'static str,
    pub(crate) callback: fn(usize),
    pub(crate) param: usize,
    /// Zero for one-shot timers.
    pub(crate) period_ms: TimeMs,
    pub(crate) active: bool,
}

impl Init for TimerCb {
    const INIT: Self = Self {
        init: false,
        name: "",
        callback: |_| {},
        param: 0,
        period_ms: 0,
        active: false,
    };
}

fn timer_index(body: &StateBody, id: TimerId) -> Result<usize, AccessError> {
    let i = id.get() - 1;
    if i >= cfg::TIMER_SLOTS {
        return Err(AccessError::BadId);
    }
    if !body.timers[i].init {
        return Err(AccessError::NotInitialized);
    }
    Ok(i)
}

#[inline]
fn node_of(i: usize) -> usize {
    cfg::TASK_SLOTS + i
}

/// Called by the tick drain when timer `i`'s deadline node fired (the node
/// is already unlinked). Re-arms periodic timers relative to the previous
/// expiry so the period does not drift, and collects the callback for
/// invocation outside the lock.
pub(crate) fn fired(body: &mut StateBody, i: usize, out: &mut FiredTimers) {
    let node = node_of(i);
    if !body.timers[i].init || !body.timers[i].active {
        return;
    }
    let period = body.timers[i].period_ms;
    if period != 0 {
        let at = body.nodes[node].expires_at.wrapping_add(period);
        timeout::link_at(body, node, at);
    } else {
        body.timers[i].active = false;
    }
    let entry = (body.timers[i].callback, body.timers[i].param);
    if out.try_push(entry).is_err() {
        // More firings than timer slots in one drain can only happen when
        // ticks stalled for whole periods; drop the excess callbacks.
        log::warn!("timer {} callback burst dropped", body.timers[i].name);
    }
}

impl<Traits: KernelTraits> System<Traits> {
    /// Create a timer that calls `callback(param)` on expiry.
    pub fn timer_create(
        callback: fn(usize),
        param: usize,
        name: &'static str,
    ) -> Result<TimerId, CreateError> {
        gate::invoke::<Traits, _, _>(|lock| {
            let body = lock.get_mut(&Traits::state().body);
            let slot = body
                .timers
                .iter()
                .position(|t| !t.init)
                .ok_or(CreateError::NoResource)?;
            body.timers[slot] = TimerCb {
                init: true,
                name,
                callback,
                param,
                period_ms: 0,
                active: false,
            };
            Ok(Id::new(slot + 1).unwrap())
        })
    }

    /// Arm the timer `ms` milliseconds from now. Restarting an armed timer
    /// moves its deadline. `ms = 0` resumes the delay that was remaining
    /// when the timer was last stopped.
    pub fn timer_start(id: TimerId, mode: TimerMode, ms: TimeMs) -> Result<(), StartTimerError> {
        if ms == TIME_FOREVER {
            return Err(StartTimerError::BadParam);
        }
        gate::invoke::<Traits, _, _>(|lock| {
            let body = lock.get_mut(&Traits::state().body);
            let i = timer_index(body, id)?;
            let node = node_of(i);
            let ms = if ms == 0 {
                // The remaining delay recorded by `timer_stop`.
                body.nodes[node].expires_at
            } else {
                ms
            };
            if ms == 0 {
                return Err(StartTimerError::BadParam);
            }
            body.timers[i].period_ms = match mode {
                TimerMode::Periodic => ms,
                TimerMode::OneShot => 0,
            };
            body.timers[i].active = true;
            timeout::set(body, node, Traits::now_ms(), ms, true);
            Ok(())
        })
    }

    /// Disarm the timer. The remaining delay is captured and can be resumed
    /// by `timer_start` with `ms = 0`.
    pub fn timer_stop(id: TimerId) -> Result<(), StopTimerError> {
        gate::invoke::<Traits, _, _>(|lock| {
            let body = lock.get_mut(&Traits::state().body);
            let i = timer_index(body, id)?;
            let node = node_of(i);
            if body.nodes[node].linked {
                let now = Traits::now_ms();
                let remaining = body.nodes[node].expires_at.wrapping_sub(now);
                timeout::remove(body, node);
                // Store without linking.
                timeout::set(body, node, 0, remaining, false);
            }
            body.timers[i].active = false;
            Ok(())
        })
    }

    /// Whether the timer is armed.
    pub fn timer_is_busy(id: TimerId) -> Result<bool, QueryError> {
        gate::invoke::<Traits, _, _>(|lock| {
            let body = lock.get_mut(&Traits::state().body);
            let i = timer_index(body, id)?;
            Ok(body.timers[i].active)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::test_support::*;

    fn make_timer(body: &mut StateBody, period_ms: TimeMs) -> usize {
        let i = body.timers.iter().position(|t| !t.init).unwrap();
        body.timers[i] = TimerCb {
            init: true,
            name: "tmr",
            callback: |_| {},
            param: 0,
            period_ms,
            active: true,
        };
        i
    }

    #[test]
    fn one_shot_fires_once() {
        let mut body = body();
        let t = make_timer(&mut body, 0);
        timeout::set(&mut body, node_of(t), 0, 10, true);

        assert!(timeout::tick_drain(&mut body, 9).is_empty());
        let fired_at_10 = timeout::tick_drain(&mut body, 10);
        assert_eq!(fired_at_10.len(), 1);
        assert!(!body.timers[t].active);
        assert!(!body.nodes[node_of(t)].linked);
        assert!(timeout::tick_drain(&mut body, 100).is_empty());
    }

    #[test]
    fn periodic_rearms_without_drift() {
        let mut body = body();
        let t = make_timer(&mut body, 10);
        timeout::set(&mut body, node_of(t), 0, 10, true);

        // The tick lands late; the next expiry is still measured from the
        // previous one.
        assert_eq!(timeout::tick_drain(&mut body, 13).len(), 1);
        assert!(body.nodes[node_of(t)].linked);
        assert_eq!(body.nodes[node_of(t)].expires_at, 20);
        assert_eq!(timeout::tick_drain(&mut body, 20).len(), 1);
        assert_eq!(body.nodes[node_of(t)].expires_at, 30);
    }

    #[test]
    fn task_and_timer_deadlines_share_the_wheel() {
        let mut body = body();
        let a = spawn(&mut body, 2, "a");
        let _main = spawn(&mut body, 1, "main");
        start(&mut body);
        let t = make_timer(&mut body, 0);

        crate::sched::exit_trigger(&mut body, a, crate::task::ExitTarget::Park, 5);
        reschedule(&mut body, 0);
        timeout::set(&mut body, node_of(t), 0, 3, true);

        let order: Vec<usize> = body.wheel.iter(&body.node_links).collect();
        assert_eq!(order, vec![node_of(t), a]);

        let fired = timeout::tick_drain(&mut body, 5);
        assert_eq!(fired.len(), 1);
        assert!(matches!(
            body.tasks[a].linkage,
            crate::task::Linkage::EntryStaging
        ));
    }
}
