//! Mutex scenarios on the hosted port.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

fn wait_for(flag: &AtomicBool, ms: u64) {
    let deadline = Instant::now() + Duration::from_millis(ms);
    while !flag.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "scenario timed out");
        std::thread::sleep(Duration::from_millis(5));
    }
}

mod exclusion {
    use super::*;
    use keel_port_std::keel_kernel::{MutexId, StackRegion};
    use once_cell::sync::OnceCell;

    keel_port_std::port_std_kernel!(struct SystemTraits);
    type System = keel_port_std::keel_kernel::System<SystemTraits>;

    static MUTEX: OnceCell<MutexId> = OnceCell::new();
    /// Deliberately non-atomic read-modify-write under the mutex: torn
    /// updates would show up as a lost count.
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    static FINISHED: AtomicU32 = AtomicU32::new(0);
    static DONE: AtomicBool = AtomicBool::new(false);

    const ROUNDS: u32 = 5;

    fn contender() {
        let m = *MUTEX.get().unwrap();
        for _ in 0..ROUNDS {
            System::mutex_lock(m).unwrap();
            let v = COUNTER.load(Ordering::SeqCst);
            System::task_sleep(1).unwrap();
            COUNTER.store(v + 1, Ordering::SeqCst);
            System::mutex_unlock(m).unwrap();
        }
        if FINISHED.fetch_add(1, Ordering::SeqCst) == 1 {
            DONE.store(true, Ordering::SeqCst);
        }
        loop {
            System::task_sleep(100).unwrap();
        }
    }

    #[test]
    fn lock_serializes_critical_sections() {
        let _ = env_logger::builder().is_test(true).try_init();
        MUTEX.set(System::mutex_create("guard").unwrap()).unwrap();
        System::task_create(contender, StackRegion::empty(), 2, "contender-a").unwrap();
        System::task_create(contender, StackRegion::empty(), 2, "contender-b").unwrap();
        keel_port_std::start_kernel::<SystemTraits>();

        wait_for(&DONE, 5000);
        assert_eq!(COUNTER.load(Ordering::SeqCst), 2 * ROUNDS);
    }
}

mod handoff {
    use super::*;
    use keel_port_std::keel_kernel::{MutexId, StackRegion};
    use once_cell::sync::OnceCell;

    keel_port_std::port_std_kernel!(struct SystemTraits);
    type System = keel_port_std::keel_kernel::System<SystemTraits>;

    static MUTEX: OnceCell<MutexId> = OnceCell::new();
    static HOLDER_SEQ: AtomicU32 = AtomicU32::new(0);
    static DONE: AtomicBool = AtomicBool::new(false);

    fn first_holder() {
        let m = *MUTEX.get().unwrap();
        System::mutex_lock(m).unwrap();
        // Give the contender time to queue up behind the lock.
        System::task_sleep(15).unwrap();
        HOLDER_SEQ.store(1, Ordering::SeqCst);
        System::mutex_unlock(m).unwrap();
        loop {
            System::task_sleep(100).unwrap();
        }
    }

    fn second_holder() {
        let m = *MUTEX.get().unwrap();
        System::task_sleep(5).unwrap();
        System::mutex_lock(m).unwrap();
        // The lock was handed off only after the first holder released it.
        assert_eq!(HOLDER_SEQ.load(Ordering::SeqCst), 1);
        System::mutex_unlock(m).unwrap();
        DONE.store(true, Ordering::SeqCst);
        loop {
            System::task_sleep(100).unwrap();
        }
    }

    #[test]
    fn unlock_hands_off_to_the_waiter() {
        let _ = env_logger::builder().is_test(true).try_init();
        MUTEX.set(System::mutex_create("baton").unwrap()).unwrap();
        System::task_create(first_holder, StackRegion::empty(), 2, "first").unwrap();
        System::task_create(second_holder, StackRegion::empty(), 3, "second").unwrap();
        keel_port_std::start_kernel::<SystemTraits>();

        wait_for(&DONE, 3000);
    }
}
