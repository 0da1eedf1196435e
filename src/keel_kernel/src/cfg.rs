//! Compile-time configuration.
//!
//! These constants bound the statically reserved descriptor storage for each
//! kernel object kind. Creation claims the first vacant slot in the
//! corresponding range; there is no dynamic allocation.
use crate::Priority;

/// The number of task descriptor slots, including the slot reserved for the
/// idle task.
pub const TASK_SLOTS: usize = 8;

/// The number of semaphore descriptor slots.
pub const SEMAPHORE_SLOTS: usize = 8;

/// The number of mutex descriptor slots.
pub const MUTEX_SLOTS: usize = 8;

/// The number of event descriptor slots.
pub const EVENT_SLOTS: usize = 8;

/// The number of message queue descriptor slots.
pub const QUEUE_SLOTS: usize = 4;

/// The number of software timer descriptor slots.
pub const TIMER_SLOTS: usize = 4;

/// The ring storage reserved in each message queue descriptor, in bytes.
/// `element size × capacity` must fit in this.
pub const QUEUE_STORAGE: usize = 256;

/// The largest supported message queue element size, in bytes. Bounds the
/// staging buffer carried in a blocked sender's or receiver's waiter record.
pub const QUEUE_ELEM_MAX: usize = 64;

/// The smallest stack a task may be created with, in bytes. Zero-length
/// regions are exempt (they denote a port-managed stack).
pub const STACK_SIZE_MIN: usize = 256;

/// The priority reserved for kernel service work. Nothing outranks it.
pub const PRIORITY_KERNEL: Priority = 0;

/// The best (numerically lowest) priority assignable to an application task.
pub const PRIORITY_USER_HIGHEST: Priority = 1;

/// The worst (numerically highest) priority assignable to an application
/// task.
pub const PRIORITY_USER_LOWEST: Priority = 29;

/// The idle task's priority, one level below the worst application priority.
pub const PRIORITY_IDLE: Priority = PRIORITY_USER_LOWEST + 1;

/// Marker for "no priority recorded".
pub(crate) const PRIORITY_INVALID: Priority = Priority::MAX;
