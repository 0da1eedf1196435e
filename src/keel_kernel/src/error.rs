//! Error codes
//!
//! Errors are values. Every public operation returns a `Result` whose error
//! enum is a subset of [`ResultCode`]; the numeric codes double as the values
//! carried over the blocked-wake result channel (see
//! [`sched`](crate::sched)).
use core::fmt;

/// The kernel-wide result code space. `Success` is zero; everything else is
/// negative.
#[repr(i8)]
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ResultCode {
    /// The operation completed.
    Success = 0,
    /// A blocking operation reached its deadline.
    Timeout = -1,
    /// The requested resource is unavailable and the caller chose not to
    /// wait, or a descriptor range is exhausted.
    NoResource = -2,
    /// A bounded container is full.
    Full = -3,
    /// A bounded container is empty.
    Empty = -4,
    /// The waiter was released by a flush.
    Flushed = -5,
    /// The identifier does not denote a slot in the object's descriptor
    /// range.
    BadId = -6,
    /// The slot's init marker is clear.
    NotInitialized = -7,
    /// The operation is not allowed in the calling execution context.
    BadContext = -8,
    /// An argument failed validation.
    BadParam = -9,
    /// The object is not in a state that permits the operation.
    BadObjectState = -10,
    /// A kernel invariant was violated. Reported via the trace collaborator;
    /// treat as a defect.
    Internal = -11,
}

impl ResultCode {
    /// The code as carried over the blocked-wake result channel.
    #[inline]
    pub(crate) const fn raw(self) -> i32 {
        self as i8 as i32
    }
}

macro_rules! define_suberror_base {
    (
        $( #[doc $( $doc:tt )*] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[repr(i8)]
        #[derive(PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $( $Variant = ResultCode::$Variant as i8 ),*
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<$Name> for ResultCode {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }
    };
}

macro_rules! define_suberror_into {
    ($Name:ident, $Supererror:path, { $( $Variant:ident, )* }) => {
        impl From<$Name> for $Supererror {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }
    };
}

macro_rules! define_suberror {
    (
        $( #[doc $( $doc:tt )*] )*
        $( #[into( $Supererror:path )] )*
        $vis:vis enum $Name:ident $body:tt
    ) => {
        define_suberror_base! {
            $( #[doc $( $doc )*] )*
            $vis enum $Name $body
        }

        $(
            define_suberror_into! { $Name, $Supererror, $body }
        )*
    };
}

define_suberror! {
    /// `BadContext`
    #[into(CreateError)]
    #[into(TakeSemaphoreError)]
    #[into(GiveSemaphoreError)]
    #[into(FlushSemaphoreError)]
    #[into(LockMutexError)]
    #[into(UnlockMutexError)]
    #[into(SetEventError)]
    #[into(WaitEventError)]
    #[into(SendQueueError)]
    #[into(ReceiveQueueError)]
    #[into(SleepError)]
    #[into(YieldError)]
    #[into(SuspendError)]
    #[into(ResumeError)]
    #[into(DeleteError)]
    pub(super) enum BadContextError {
        BadContext,
    }
}

define_suberror! {
    /// `BadId` or `NotInitialized`, the two ways an object handle can fail
    /// validation.
    #[into(TakeSemaphoreError)]
    #[into(GiveSemaphoreError)]
    #[into(FlushSemaphoreError)]
    #[into(LockMutexError)]
    #[into(UnlockMutexError)]
    #[into(SetEventError)]
    #[into(WaitEventError)]
    #[into(ReadEventError)]
    #[into(SendQueueError)]
    #[into(ReceiveQueueError)]
    #[into(SuspendError)]
    #[into(ResumeError)]
    #[into(DeleteError)]
    #[into(QueryError)]
    #[into(StartTimerError)]
    #[into(StopTimerError)]
    pub(super) enum AccessError {
        BadId,
        NotInitialized,
    }
}

define_suberror! {
    /// Errors from object creation.
    pub enum CreateError {
        NoResource,
        BadContext,
        BadParam,
    }
}

define_suberror! {
    /// Errors from [`System::semaphore_take`](crate::System::semaphore_take).
    pub enum TakeSemaphoreError {
        Timeout,
        NoResource,
        Flushed,
        BadId,
        NotInitialized,
        BadContext,
        Internal,
    }
}

define_suberror! {
    /// Errors from [`System::semaphore_give`](crate::System::semaphore_give).
    pub enum GiveSemaphoreError {
        Full,
        BadId,
        NotInitialized,
        BadContext,
    }
}

define_suberror! {
    /// Errors from [`System::semaphore_flush`](crate::System::semaphore_flush).
    pub enum FlushSemaphoreError {
        BadId,
        NotInitialized,
        BadContext,
    }
}

define_suberror! {
    /// Errors from [`System::mutex_lock`](crate::System::mutex_lock).
    pub enum LockMutexError {
        BadId,
        NotInitialized,
        BadContext,
        Internal,
    }
}

define_suberror! {
    /// Errors from [`System::mutex_unlock`](crate::System::mutex_unlock).
    pub enum UnlockMutexError {
        BadId,
        NotInitialized,
        BadContext,
        BadObjectState,
    }
}

define_suberror! {
    /// Errors from [`System::event_set`](crate::System::event_set).
    pub enum SetEventError {
        BadId,
        NotInitialized,
        BadContext,
    }
}

define_suberror! {
    /// Errors from [`System::event_wait`](crate::System::event_wait).
    pub enum WaitEventError {
        Timeout,
        NoResource,
        BadId,
        NotInitialized,
        BadContext,
        Internal,
    }
}

define_suberror! {
    /// Errors from [`System::event_read`](crate::System::event_read).
    pub enum ReadEventError {
        BadId,
        NotInitialized,
    }
}

define_suberror! {
    /// Errors from [`System::queue_send`](crate::System::queue_send).
    pub enum SendQueueError {
        Timeout,
        Full,
        BadId,
        NotInitialized,
        BadContext,
        BadParam,
        Internal,
    }
}

define_suberror! {
    /// Errors from [`System::queue_receive`](crate::System::queue_receive).
    pub enum ReceiveQueueError {
        Timeout,
        Empty,
        BadId,
        NotInitialized,
        BadContext,
        BadParam,
        Internal,
    }
}

define_suberror! {
    /// Errors from [`System::task_sleep`](crate::System::task_sleep).
    pub enum SleepError {
        BadContext,
        Internal,
    }
}

define_suberror! {
    /// Errors from [`System::task_yield`](crate::System::task_yield).
    pub enum YieldError {
        BadContext,
        Internal,
    }
}

define_suberror! {
    /// Errors from [`System::task_suspend`](crate::System::task_suspend).
    pub enum SuspendError {
        BadId,
        NotInitialized,
        BadContext,
        BadObjectState,
        Internal,
    }
}

define_suberror! {
    /// Errors from [`System::task_resume`](crate::System::task_resume).
    pub enum ResumeError {
        BadId,
        NotInitialized,
        BadContext,
        BadObjectState,
    }
}

define_suberror! {
    /// Errors from [`System::task_delete`](crate::System::task_delete).
    pub enum DeleteError {
        BadId,
        NotInitialized,
        BadContext,
        BadObjectState,
    }
}

define_suberror! {
    /// Errors from read-only queries such as
    /// [`System::task_stats`](crate::System::task_stats).
    pub enum QueryError {
        BadId,
        NotInitialized,
    }
}

define_suberror! {
    /// Errors from [`System::timer_start`](crate::System::timer_start).
    pub enum StartTimerError {
        BadId,
        NotInitialized,
        BadParam,
    }
}

define_suberror! {
    /// Errors from [`System::timer_stop`](crate::System::timer_stop).
    pub enum StopTimerError {
        BadId,
        NotInitialized,
    }
}
