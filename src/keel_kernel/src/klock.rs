//! Kernel privilege lock
//!
//! Every mutation of kernel state must happen with the port's CPU Lock held,
//! that is, with preemption and interrupts masked. Rather than trusting each
//! call site to remember this, the rule is carried in the type system: the
//! state sits in a [`CpuLockCell`], and the only key that opens the cell is
//! the [`tokenlock`] singleton token embedded in a live [`CpuLock`] value.
//! Acquiring the lock and gaining access to the state are the same act, and
//! releasing happens on drop.
use tokenlock::{SingletonTokenId, UnsyncSingletonToken, UnsyncTokenLock};

use crate::{error::BadContextError, utils::Init, PortThreading};

/// Ties a token family to one kernel instance, so that two instances in the
/// same program cannot open each other's cells.
pub(super) struct LockTag<Traits>(Traits);

type LockToken<Traits> = UnsyncSingletonToken<LockTag<Traits>>;
type LockKeyhole<Traits> = SingletonTokenId<LockTag<Traits>>;

/// Storage that can only be reached through a live [`CpuLock`].
pub(super) struct CpuLockCell<Traits, T> {
    inner: UnsyncTokenLock<T, LockKeyhole<Traits>>,
}

impl<Traits, T> CpuLockCell<Traits, T> {
    pub(super) const fn new(value: T) -> Self {
        Self {
            inner: UnsyncTokenLock::new(LockKeyhole::INIT, value),
        }
    }
}

impl<Traits, T: Init> Init for CpuLockCell<Traits, T> {
    const INIT: Self = Self::new(T::INIT);
}

/// Proof that the current context holds the CPU Lock.
///
/// At most one value of this type exists per kernel instance at any moment;
/// that uniqueness is what makes handing out `&mut` to cell contents sound.
/// Dropping the value releases the lock.
pub(super) struct CpuLock<Traits: PortThreading> {
    token: LockToken<Traits>,
}

impl<Traits: PortThreading> CpuLock<Traits> {
    /// Mask preemption and take the lock.
    ///
    /// Fails with `BadContext` when the lock is already active, since a
    /// second `CpuLock` would alias the token of the first.
    pub(super) fn acquire() -> Result<Self, BadContextError> {
        // Safety: reserved to the kernel, which this is
        if unsafe { Traits::try_enter_cpu_lock() } {
            // Safety: the lock was free until this very call, so no other
            // `CpuLock` is alive right now
            Ok(unsafe { Self::steal() })
        } else {
            Err(BadContextError::BadContext)
        }
    }

    /// Materialize the lock without taking it.
    ///
    /// # Safety
    ///
    /// The CPU Lock must already be active, and no other `CpuLock` for this
    /// kernel instance may exist; otherwise two tokens for the same cells
    /// would be live at once.
    pub(super) unsafe fn steal() -> Self {
        debug_assert!(Traits::is_cpu_lock_active());
        Self {
            // Safety: uniqueness is the caller's obligation, see above
            token: unsafe { LockToken::new_unchecked() },
        }
    }

    /// Open a cell for mutation. The borrow pins the lock, so the lock
    /// cannot be released while the contents are reachable.
    pub(super) fn get_mut<'a, T>(&'a mut self, cell: &'a CpuLockCell<Traits, T>) -> &'a mut T {
        cell.inner.write(&mut self.token)
    }
}

impl<Traits: PortThreading> Drop for CpuLock<Traits> {
    fn drop(&mut self) {
        // Safety: a live `CpuLock` means the kernel holds the lock
        unsafe { Traits::leave_cpu_lock() };
    }
}
