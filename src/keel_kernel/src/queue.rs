//! Message queues
//!
//! A bounded FIFO of fixed-size elements with blocking on both ends. A
//! blocked sender stages its element in its own waiter record; when a
//! receiver frees a slot, the head sender's element is moved into it and the
//! sender is woken, so element order is exactly send-completion order. A
//! sender that finds a receiver waiting hands over the oldest element
//! directly (the queue is necessarily empty at that point).
use arrayvec::ArrayVec;

use crate::{
    cfg,
    error::{AccessError, CreateError, ReceiveQueueError, ResultCode, SendQueueError},
    gate,
    list::ListHead,
    sched::{self, StateBody},
    task::{ExitTarget, PendPayload, WaitSource},
    utils::Init,
    Id, KernelTraits, System, TimeMs,
};

pub type QueueId = Id;

/// *Queue control block* - the state data of a message queue.
pub(crate) struct QueueCb {
    pub(crate) init: bool,
    pub(crate) name: &'static str,
    /// Senders blocked on a full queue.
    pub(crate) tx_wait: ListHead,
    /// Receivers blocked on an empty queue.
    pub(crate) rx_wait: ListHead,
    pub(crate) elem_size: u16,
    pub(crate) capacity: u16,
    pub(crate) count: u16,
    pub(crate) head: u16,
    pub(crate) tail: u16,
    pub(crate) storage: [u8; cfg::QUEUE_STORAGE],
}

impl Init for QueueCb {
    const INIT: Self = Self {
        init: false,
        name: "",
        tx_wait: ListHead::INIT,
        rx_wait: ListHead::INIT,
        elem_size: 0,
        capacity: 0,
        count: 0,
        head: 0,
        tail: 0,
        storage: [0; cfg::QUEUE_STORAGE],
    };
}

impl QueueCb {
    fn slot(&self, index: u16) -> core::ops::Range<usize> {
        let n = self.elem_size as usize;
        let start = index as usize * n;
        start..start + n
    }

    fn is_full(&self) -> bool {
        self.count == self.capacity
    }

    fn enqueue(&mut self, src: &[u8]) {
        debug_assert!(!self.is_full());
        let range = self.slot(self.tail);
        self.storage[range].copy_from_slice(src);
        self.tail = (self.tail + 1) % self.capacity;
        self.count += 1;
    }

    fn dequeue_into(&mut self, dst: &mut [u8]) {
        debug_assert!(self.count > 0);
        let range = self.slot(self.head);
        dst.copy_from_slice(&self.storage[range]);
        self.head = (self.head + 1) % self.capacity;
        self.count -= 1;
    }
}

pub(crate) fn queue_index(body: &StateBody, id: QueueId) -> Result<usize, AccessError> {
    let i = id.get() - 1;
    if i >= cfg::QUEUE_SLOTS {
        return Err(AccessError::BadId);
    }
    if !body.queues[i].init {
        return Err(AccessError::NotInitialized);
    }
    Ok(i)
}

/// Move the head blocked sender's staged element into the queue and wake it.
fn complete_one_sender(body: &mut StateBody, i: usize) -> bool {
    if body.queues[i].is_full() {
        return false;
    }
    let Some(sender) = body.queues[i].tx_wait.head() else {
        return false;
    };
    let staged = core::mem::replace(&mut body.tasks[sender].pend, PendPayload::None);
    let PendPayload::QueueTx { elem } = staged else {
        log::error!("queue sender {} without a record", body.tasks[sender].name);
        sched::entry_trigger(body, sender, None, ResultCode::Internal.raw());
        return true;
    };
    body.queues[i].enqueue(&elem);
    sched::entry_trigger(body, sender, None, ResultCode::Success.raw());
    true
}

/// Move the oldest element into the head blocked receiver's record and wake
/// it.
fn complete_one_receiver(body: &mut StateBody, i: usize) -> bool {
    if body.queues[i].count == 0 {
        return false;
    }
    let Some(receiver) = body.queues[i].rx_wait.head() else {
        return false;
    };
    let n = body.queues[i].elem_size as usize;
    let mut tmp = [0u8; cfg::QUEUE_ELEM_MAX];
    body.queues[i].dequeue_into(&mut tmp[..n]);
    if let PendPayload::QueueRx { elem } = &mut body.tasks[receiver].pend {
        elem.clear();
        let _ = elem.try_extend_from_slice(&tmp[..n]);
        sched::entry_trigger(body, receiver, None, ResultCode::Success.raw());
    } else {
        log::error!("queue receiver {} without a record", body.tasks[receiver].name);
        sched::entry_trigger(body, receiver, None, ResultCode::Internal.raw());
    }
    true
}

/// Runs after the exit drain links a staged sender.
pub(crate) fn repoll_tx(body: &mut StateBody, i: usize) {
    while complete_one_sender(body, i) {}
}

/// Runs after the exit drain links a staged receiver.
pub(crate) fn repoll_rx(body: &mut StateBody, i: usize) {
    while complete_one_receiver(body, i) {}
}

impl<Traits: KernelTraits> System<Traits> {
    /// Create a message queue of `capacity` elements of `elem_size` bytes
    /// each, backed by the descriptor's own ring storage.
    pub fn queue_create(
        elem_size: usize,
        capacity: usize,
        name: &'static str,
    ) -> Result<QueueId, CreateError> {
        // A queue without a slot cannot hold a message: the rendezvous mode
        // this would imply is not provided.
        if capacity == 0 {
            return Err(CreateError::NoResource);
        }
        if elem_size == 0
            || elem_size > cfg::QUEUE_ELEM_MAX
            || elem_size * capacity > cfg::QUEUE_STORAGE
        {
            return Err(CreateError::BadParam);
        }
        gate::invoke::<Traits, _, _>(|lock| {
            let body = lock.get_mut(&Traits::state().body);
            let slot = body
                .queues
                .iter()
                .position(|q| !q.init)
                .ok_or(CreateError::NoResource)?;
            body.queues[slot] = QueueCb {
                init: true,
                name,
                tx_wait: ListHead::INIT,
                rx_wait: ListHead::INIT,
                elem_size: elem_size as u16,
                capacity: capacity as u16,
                count: 0,
                head: 0,
                tail: 0,
                storage: [0; cfg::QUEUE_STORAGE],
            };
            Ok(Id::new(slot + 1).unwrap())
        })
    }

    /// Send one element, blocking for up to `timeout` milliseconds while the
    /// queue is full. `buf.len()` must equal the configured element size.
    pub fn queue_send(id: QueueId, buf: &[u8], timeout: TimeMs) -> Result<(), SendQueueError> {
        gate::expect_task_context::<Traits>()?;
        let pending = gate::invoke::<Traits, _, _>(|lock| -> Result<bool, SendQueueError> {
            let body = lock.get_mut(&Traits::state().body);
            let i = queue_index(body, id)?;
            if buf.len() != body.queues[i].elem_size as usize {
                return Err(SendQueueError::BadParam);
            }
            if let Some(receiver) = body.queues[i].rx_wait.head() {
                // A receiver can only be waiting while the queue is empty,
                // so this element is the oldest one; hand it over directly.
                debug_assert_eq!(body.queues[i].count, 0);
                if let PendPayload::QueueRx { elem } = &mut body.tasks[receiver].pend {
                    elem.clear();
                    let _ = elem.try_extend_from_slice(buf);
                    sched::entry_trigger(body, receiver, None, ResultCode::Success.raw());
                } else {
                    log::error!("queue receiver {} without a record", body.tasks[receiver].name);
                    sched::entry_trigger(body, receiver, None, ResultCode::Internal.raw());
                }
                return Ok(false);
            }
            if !body.queues[i].is_full() {
                body.queues[i].enqueue(buf);
                return Ok(false);
            }
            if timeout == 0 {
                return Err(SendQueueError::Full);
            }
            let mut elem = ArrayVec::new();
            if elem.try_extend_from_slice(buf).is_err() {
                return Err(SendQueueError::Internal);
            }
            let slot = body.running.expect("no running task");
            body.tasks[slot].pend = PendPayload::QueueTx { elem };
            sched::exit_trigger(body, slot, ExitTarget::Wait(WaitSource::QueueTx(i)), timeout);
            Ok(true)
        })?;
        if !pending {
            return Ok(());
        }
        let (raw, _) = sched::finish_wait::<Traits>();
        match raw {
            x if x == ResultCode::Success.raw() => Ok(()),
            x if x == ResultCode::Timeout.raw() => Err(SendQueueError::Timeout),
            _ => Err(SendQueueError::Internal),
        }
    }

    /// Receive one element, blocking for up to `timeout` milliseconds while
    /// the queue is empty. `buf.len()` must equal the configured element
    /// size.
    pub fn queue_receive(
        id: QueueId,
        buf: &mut [u8],
        timeout: TimeMs,
    ) -> Result<(), ReceiveQueueError> {
        gate::expect_task_context::<Traits>()?;
        let pending = gate::invoke::<Traits, _, _>(|lock| -> Result<bool, ReceiveQueueError> {
            let body = lock.get_mut(&Traits::state().body);
            let i = queue_index(body, id)?;
            if buf.len() != body.queues[i].elem_size as usize {
                return Err(ReceiveQueueError::BadParam);
            }
            if body.queues[i].count > 0 {
                body.queues[i].dequeue_into(&mut *buf);
                // The freed slot completes the head blocked sender, if any.
                complete_one_sender(body, i);
                return Ok(false);
            }
            if timeout == 0 {
                return Err(ReceiveQueueError::Empty);
            }
            let slot = body.running.expect("no running task");
            body.tasks[slot].pend = PendPayload::QueueRx {
                elem: ArrayVec::new(),
            };
            sched::exit_trigger(body, slot, ExitTarget::Wait(WaitSource::QueueRx(i)), timeout);
            Ok(true)
        })?;
        if !pending {
            return Ok(());
        }
        let (raw, payload) = sched::finish_wait::<Traits>();
        match raw {
            x if x == ResultCode::Success.raw() => {
                if let PendPayload::QueueRx { elem } = payload {
                    if elem.len() == buf.len() {
                        buf.copy_from_slice(&elem);
                        return Ok(());
                    }
                }
                Err(ReceiveQueueError::Internal)
            }
            x if x == ResultCode::Timeout.raw() => Err(ReceiveQueueError::Timeout),
            _ => Err(ReceiveQueueError::Internal),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::test_support::*;
    use crate::task::Linkage;

    fn make_queue(body: &mut StateBody, elem_size: u16, capacity: u16) -> usize {
        let i = body.queues.iter().position(|q| !q.init).unwrap();
        body.queues[i] = QueueCb {
            init: true,
            name: "q",
            tx_wait: ListHead::INIT,
            rx_wait: ListHead::INIT,
            elem_size,
            capacity,
            count: 0,
            head: 0,
            tail: 0,
            storage: [0; cfg::QUEUE_STORAGE],
        };
        i
    }

    fn ring(body: &StateBody, q: usize) -> Vec<Vec<u8>> {
        let cb = &body.queues[q];
        (0..cb.count)
            .map(|k| {
                let idx = (cb.head + k) % cb.capacity;
                cb.storage[cb.slot(idx)].to_vec()
            })
            .collect()
    }

    #[test]
    fn ring_round_trips_in_order() {
        let mut body = body();
        let q = make_queue(&mut body, 4, 3);
        for v in [1u32, 2, 3] {
            body.queues[q].enqueue(&v.to_le_bytes());
        }
        assert!(body.queues[q].is_full());
        let mut out = [0u8; 4];
        for v in [1u32, 2, 3] {
            body.queues[q].dequeue_into(&mut out);
            assert_eq!(out, v.to_le_bytes());
        }
        assert_eq!(body.queues[q].count, 0);
    }

    #[test]
    fn ring_wraps_around() {
        let mut body = body();
        let q = make_queue(&mut body, 2, 2);
        let mut out = [0u8; 2];
        for v in 0u8..10 {
            body.queues[q].enqueue(&[v, v]);
            body.queues[q].dequeue_into(&mut out);
            assert_eq!(out, [v, v]);
        }
    }

    #[test]
    fn blocked_sender_completes_into_freed_slot() {
        // Capacity 2: send {1, 2}, a third send blocks; receiving 1 must
        // resume the sender and leave {2, 3}.
        let mut body = body();
        let a = spawn(&mut body, 2, "a");
        let _main = spawn(&mut body, 1, "main");
        start(&mut body);
        let q = make_queue(&mut body, 4, 2);

        body.queues[q].enqueue(&1u32.to_le_bytes());
        body.queues[q].enqueue(&2u32.to_le_bytes());

        // `a` stages a blocking send of 3.
        let mut elem = ArrayVec::new();
        elem.try_extend_from_slice(&3u32.to_le_bytes()).unwrap();
        body.tasks[a].pend = PendPayload::QueueTx { elem };
        sched::exit_trigger(&mut body, a, ExitTarget::Wait(WaitSource::QueueTx(q)), 10);
        reschedule(&mut body, 0);
        assert!(matches!(body.tasks[a].linkage, Linkage::Waiting(_)));

        // Receive as the running task.
        let mut out = [0u8; 4];
        body.queues[q].dequeue_into(&mut out);
        complete_one_sender(&mut body, q);
        assert_eq!(out, 1u32.to_le_bytes());
        reschedule(&mut body, 1);

        assert_eq!(body.tasks[a].entry_rec.result, ResultCode::Success.raw());
        assert_eq!(body.queues[q].count, 2);
        assert_eq!(
            ring(&body, q),
            vec![2u32.to_le_bytes().to_vec(), 3u32.to_le_bytes().to_vec()]
        );
        assert!(!body.nodes[a].linked);
    }

    #[test]
    fn waiting_receiver_gets_element_directly() {
        let mut body = body();
        let a = spawn(&mut body, 2, "a");
        let _main = spawn(&mut body, 1, "main");
        start(&mut body);
        let q = make_queue(&mut body, 2, 2);

        body.tasks[a].pend = PendPayload::QueueRx {
            elem: ArrayVec::new(),
        };
        sched::exit_trigger(
            &mut body,
            a,
            ExitTarget::Wait(WaitSource::QueueRx(q)),
            crate::TIME_FOREVER,
        );
        reschedule(&mut body, 0);

        // A send finds the receiver waiting: direct hand-over, queue stays
        // empty.
        if let Some(receiver) = body.queues[q].rx_wait.head() {
            if let PendPayload::QueueRx { elem } = &mut body.tasks[receiver].pend {
                elem.try_extend_from_slice(&[7, 7]).unwrap();
            }
            sched::entry_trigger(&mut body, receiver, None, ResultCode::Success.raw());
        }
        assert_eq!(body.queues[q].count, 0);
        reschedule(&mut body, 1);
        match &body.tasks[a].pend {
            PendPayload::QueueRx { elem } => assert_eq!(elem.as_slice(), &[7, 7]),
            _ => panic!("record consumed"),
        }
    }

    #[test]
    fn repoll_completes_staged_receiver_after_racing_send() {
        let mut body = body();
        let a = spawn(&mut body, 2, "a");
        let _main = spawn(&mut body, 1, "main");
        start(&mut body);
        let q = make_queue(&mut body, 1, 2);

        // Receiver stages a block; an element arrives before the drain.
        body.tasks[a].pend = PendPayload::QueueRx {
            elem: ArrayVec::new(),
        };
        sched::exit_trigger(
            &mut body,
            a,
            ExitTarget::Wait(WaitSource::QueueRx(q)),
            crate::TIME_FOREVER,
        );
        body.queues[q].enqueue(&[9]);

        reschedule(&mut body, 0);
        assert_eq!(body.queues[q].count, 0);
        assert_eq!(body.tasks[a].entry_rec.result, ResultCode::Success.raw());
        match &body.tasks[a].pend {
            PendPayload::QueueRx { elem } => assert_eq!(elem.as_slice(), &[9]),
            _ => panic!("record consumed"),
        }
    }
}
