//! Event flag scenarios on the hosted port.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

fn wait_for(flag: &AtomicBool, ms: u64) {
    let deadline = Instant::now() + Duration::from_millis(ms);
    while !flag.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "scenario timed out");
        std::thread::sleep(Duration::from_millis(5));
    }
}

mod rising_edge {
    use super::*;
    use keel_port_std::keel_kernel::{EventCapture, EventId, StackRegion, TIME_FOREVER};
    use once_cell::sync::OnceCell;

    keel_port_std::port_std_kernel!(struct SystemTraits);
    type System = keel_port_std::keel_kernel::System<SystemTraits>;

    static EVENT: OnceCell<EventId> = OnceCell::new();
    static OUT_VALUE: AtomicU32 = AtomicU32::new(0);
    static OUT_TRIGGER: AtomicU32 = AtomicU32::new(0);
    static DONE: AtomicBool = AtomicBool::new(false);

    fn waiter() {
        let evt = *EVENT.get().unwrap();
        let mut cap = EventCapture::new();
        System::event_wait(evt, &mut cap, 0x1, TIME_FOREVER).unwrap();
        OUT_VALUE.store(cap.value, Ordering::SeqCst);
        OUT_TRIGGER.store(cap.trigger, Ordering::SeqCst);
        DONE.store(true, Ordering::SeqCst);
        loop {
            System::task_sleep(100).unwrap();
        }
    }

    fn setter() {
        let evt = *EVENT.get().unwrap();
        System::task_sleep(10).unwrap();
        System::event_set(evt, 0x1, 0, 0).unwrap();
        loop {
            System::task_sleep(100).unwrap();
        }
    }

    #[test]
    fn waiter_observes_the_edge() {
        let _ = env_logger::builder().is_test(true).try_init();
        // All four low bits edge-sensitive, rising polarity.
        EVENT
            .set(System::event_create(0x0, 0xF, 0xF, 0x0, "edge").unwrap())
            .unwrap();
        System::task_create(waiter, StackRegion::empty(), 2, "waiter").unwrap();
        System::task_create(setter, StackRegion::empty(), 3, "setter").unwrap();
        keel_port_std::start_kernel::<SystemTraits>();

        wait_for(&DONE, 3000);
        assert_eq!(OUT_VALUE.load(Ordering::SeqCst), 0x1);
        assert_eq!(OUT_TRIGGER.load(Ordering::SeqCst), 0x1);
        assert_eq!(System::event_read(*EVENT.get().unwrap()), Ok(0x1));
    }
}

mod level {
    use super::*;
    use keel_port_std::keel_kernel::{
        error::WaitEventError, EventCapture, EventId, StackRegion,
    };
    use once_cell::sync::OnceCell;

    keel_port_std::port_std_kernel!(struct SystemTraits);
    type System = keel_port_std::keel_kernel::System<SystemTraits>;

    static EVENT: OnceCell<EventId> = OnceCell::new();
    static DONE: AtomicBool = AtomicBool::new(false);

    fn prober() {
        let evt = *EVENT.get().unwrap();

        // The bit is already high: a level wait returns immediately.
        System::event_set(evt, 0x1, 0, 0).unwrap();
        let mut cap = EventCapture::new();
        System::event_wait(evt, &mut cap, 0x1, 50).unwrap();
        assert_eq!(cap.value, 0x1);

        // After the bit drops, the level no longer holds: a bounded wait
        // times out instead of seeing a stale latch.
        System::event_set(evt, 0, 0x1, 0).unwrap();
        let r = System::event_wait(evt, &mut cap, 0x1, 20);
        assert_eq!(r, Err(WaitEventError::Timeout));

        DONE.store(true, Ordering::SeqCst);
        loop {
            System::task_sleep(100).unwrap();
        }
    }

    #[test]
    fn level_bits_track_the_live_value() {
        let _ = env_logger::builder().is_test(true).try_init();
        // Level-sensitive, high polarity.
        EVENT
            .set(System::event_create(0x0, 0x0, 0xF, 0x0, "level").unwrap())
            .unwrap();
        System::task_create(prober, StackRegion::empty(), 2, "prober").unwrap();
        keel_port_std::start_kernel::<SystemTraits>();

        wait_for(&DONE, 3000);
    }
}
