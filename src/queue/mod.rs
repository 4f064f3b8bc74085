pub use consumer::{Consumer, ConsumerKind, Predicate};
pub use lock::LockQueue;
pub use state::{DispatchPlan, QueueState, QueuedMessage};
pub use tx::{TxQueue, transactional_copy};

mod consumer;
mod lock;
mod state;
mod tx;

use crate::error::FlowError;
use crate::message::Message;
use crate::result::{ResultChannel, SendOutcome};
use std::cell::Cell;

/// Deferred unlock handed down the pipeline during propagation.
///
/// An enqueue fires the upstream release as soon as it has entered its own
/// exclusive section, so the upstream lock is held exactly long enough to
/// pin message order and never across downstream recursion (which would
/// invert lock order on cyclic graphs). Dropping an unfired release fires
/// it.
pub struct Release<'a>(Option<Box<dyn FnOnce() + 'a>>);

impl<'a> Release<'a> {
    pub fn none() -> Release<'static> {
        Release(None)
    }

    pub fn of(f: impl FnOnce() + 'a) -> Release<'a> {
        Release(Some(Box::new(f)))
    }

    pub fn fire(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.fire();
    }
}

/// Where an enqueue landed.
#[derive(Debug)]
pub enum Enqueued<R> {
    /// The queue was already closed.
    Closed,
    /// A waiting consumer took the message.
    Consumed,
    /// Buffered; the producer's deferred resolves at dispatch.
    Queued(ResultChannel<SendOutcome>),
    /// No consumer, no persistence, no stream handler.
    Discarded,
    /// The stream handler ran; its result.
    Streamed(R),
}

thread_local! {
    static TXN_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Whether the calling thread is inside a [`transaction`] scope.
#[inline]
pub fn in_transaction() -> bool {
    TXN_DEPTH.with(|d| d.get()) > 0
}

/// Run `f` in a transaction scope. Transactional queues may only be mutated
/// inside one; lock-based queues refuse to be mutated inside one. Nests.
pub fn transaction<R>(f: impl FnOnce() -> R) -> R {
    TXN_DEPTH.with(|d| d.set(d.get() + 1));
    struct Exit;
    impl Drop for Exit {
        fn drop(&mut self) {
            TXN_DEPTH.with(|d| d.set(d.get() - 1));
        }
    }
    let _exit = Exit;
    f()
}

/// Tagged queue variant living inside a node. The degenerate `Errored` and
/// `Drained` forms answer every operation immediately with the terminal
/// reason.
pub enum EventQueue<T: Message> {
    Lock(LockQueue<T>),
    Transactional(TxQueue<T>),
    Errored(FlowError),
    Drained,
}

impl<T: Message> Clone for EventQueue<T> {
    fn clone(&self) -> Self {
        match self {
            EventQueue::Lock(q) => EventQueue::Lock(q.clone()),
            EventQueue::Transactional(q) => EventQueue::Transactional(q.clone()),
            EventQueue::Errored(e) => EventQueue::Errored(e.clone()),
            EventQueue::Drained => EventQueue::Drained,
        }
    }
}

impl<T: Message> EventQueue<T> {
    pub fn new(transactional: bool) -> Self {
        if transactional {
            EventQueue::Transactional(TxQueue::new())
        } else {
            EventQueue::Lock(LockQueue::new())
        }
    }

    pub fn seeded(transactional: bool, msgs: impl IntoIterator<Item = T>) -> Self {
        if transactional {
            EventQueue::Transactional(TxQueue::seeded(msgs))
        } else {
            EventQueue::Lock(LockQueue::seeded(msgs))
        }
    }

    pub fn is_transactional(&self) -> bool {
        matches!(self, EventQueue::Transactional(_))
    }

    pub fn enqueue_stream<R>(
        &self,
        msg: T,
        persist: bool,
        upstream: Release<'_>,
        stream: impl for<'q> FnOnce(T, Release<'q>) -> R,
    ) -> Result<Enqueued<R>, FlowError> {
        match self {
            EventQueue::Lock(q) => q.enqueue_stream(msg, persist, upstream, stream),
            EventQueue::Transactional(q) => q.enqueue_stream(msg, persist, upstream, stream),
            EventQueue::Errored(e) => Err(e.clone()),
            EventQueue::Drained => Ok(Enqueued::Closed),
        }
    }

    pub fn enqueue(&self, msg: T, persist: bool) -> Result<Enqueued<()>, FlowError> {
        match self {
            EventQueue::Lock(q) => q.enqueue(msg, persist),
            EventQueue::Transactional(q) => q.enqueue(msg, persist),
            EventQueue::Errored(e) => Err(e.clone()),
            EventQueue::Drained => Ok(Enqueued::Closed),
        }
    }

    /// Register the consumer or fail it immediately on a degenerate queue.
    pub fn receive(&self, consumer: Consumer<T>) -> ResultChannel<T> {
        let rc = consumer.result().clone();
        let refused = match self {
            EventQueue::Lock(q) => q.receive(consumer).err(),
            EventQueue::Transactional(q) => q.receive(consumer).err(),
            EventQueue::Errored(e) => Some(e.clone()),
            EventQueue::Drained => Some(FlowError::Drained),
        };
        if let Some(e) = refused {
            let _ = rc.fail(e);
        }
        rc
    }

    pub fn cancel(&self, rc: &ResultChannel<T>) -> bool {
        match self {
            EventQueue::Lock(q) => q.cancel(rc),
            EventQueue::Transactional(q) => q.cancel(rc),
            EventQueue::Errored(_) | EventQueue::Drained => false,
        }
    }

    pub fn close(&self) {
        match self {
            EventQueue::Lock(q) => q.close(),
            EventQueue::Transactional(q) => q.close(),
            EventQueue::Errored(_) | EventQueue::Drained => {}
        }
    }

    pub fn fail(&self, error: &FlowError) {
        match self {
            EventQueue::Lock(q) => q.fail(error),
            EventQueue::Transactional(q) => q.fail(error),
            EventQueue::Errored(_) | EventQueue::Drained => {}
        }
    }

    pub fn drain_buffered(&self) -> Vec<T> {
        match self {
            EventQueue::Lock(q) => q.drain_buffered(),
            EventQueue::Transactional(q) => q.drain_buffered(),
            EventQueue::Errored(_) | EventQueue::Drained => Vec::new(),
        }
    }

    pub(crate) fn flush_ordered(
        &self,
        f: impl FnMut(T, Option<ResultChannel<SendOutcome>>),
    ) {
        match self {
            EventQueue::Lock(q) => q.flush_ordered(f),
            EventQueue::Transactional(q) => q.flush_ordered(f),
            EventQueue::Errored(_) | EventQueue::Drained => {}
        }
    }

    pub fn len(&self) -> usize {
        match self {
            EventQueue::Lock(q) => q.len(),
            EventQueue::Transactional(q) => q.len(),
            EventQueue::Errored(_) | EventQueue::Drained => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_drained(&self) -> bool {
        match self {
            EventQueue::Lock(q) => q.is_drained(),
            EventQueue::Transactional(q) => q.is_drained(),
            EventQueue::Errored(_) => false,
            EventQueue::Drained => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FlowError;
    use crate::result::SendOutcome;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;
    use std::time::Duration;

    fn read(q: &LockQueue<u32>) -> ResultChannel<u32> {
        let c = Consumer::simple();
        let rc = c.result().clone();
        q.receive(c).expect("receive outside transaction");
        rc
    }

    #[test]
    fn enqueue_then_receive_pops_in_order() {
        let q = LockQueue::new();
        assert!(matches!(q.enqueue(1, true), Ok(Enqueued::Queued(_))));
        assert!(matches!(q.enqueue(2, true), Ok(Enqueued::Queued(_))));
        assert_eq!(read(&q).try_get(), Some(Ok(1)));
        assert_eq!(read(&q).try_get(), Some(Ok(2)));
    }

    #[test]
    fn receive_then_enqueue_dispatches_immediately() {
        let q = LockQueue::new();
        let rc = read(&q);
        assert!(!rc.is_realized());
        assert!(matches!(q.enqueue(7, true), Ok(Enqueued::Consumed)));
        assert_eq!(rc.try_get(), Some(Ok(7)));
        assert!(q.is_empty(), "dispatched message must not also buffer");
    }

    #[test]
    fn queued_listener_acks_on_dispatch() {
        let q = LockQueue::new();
        let listener = match q.enqueue(5, true) {
            Ok(Enqueued::Queued(l)) => l,
            other => panic!("expected queued: {other:?}"),
        };
        assert!(!listener.is_realized());
        assert_eq!(read(&q).try_get(), Some(Ok(5)));
        assert_eq!(listener.try_get(), Some(Ok(SendOutcome::Consumed)));
    }

    #[test]
    fn no_persist_no_consumer_discards() {
        let q = LockQueue::new();
        assert!(matches!(q.enqueue(1, false), Ok(Enqueued::Discarded)));
        assert!(q.is_empty());
    }

    #[test]
    fn predicated_rejection_leaves_message() {
        let q = LockQueue::new();
        assert!(matches!(q.enqueue(3, true), Ok(Enqueued::Queued(_))));

        let c = Consumer::predicated(ResultChannel::new(), |m: &u32| *m % 2 == 0, 999);
        let rc = c.result().clone();
        q.receive(c).expect("receive");
        assert_eq!(rc.try_get(), Some(Ok(999)), "resolves with false-value");
        assert_eq!(q.len(), 1, "message must stay in the queue");
        assert_eq!(read(&q).try_get(), Some(Ok(3)));
    }

    #[test]
    fn predicated_consumer_rejects_then_message_retries_next() {
        let q = LockQueue::new();
        let odd_only = Consumer::predicated(ResultChannel::new(), |m: &u32| *m % 2 == 1, 0);
        let rejected = odd_only.result().clone();
        q.receive(odd_only).expect("receive");
        let plain = Consumer::simple();
        let taken = plain.result().clone();
        q.receive(plain).expect("receive");

        assert!(matches!(q.enqueue(4, true), Ok(Enqueued::Consumed)));
        assert_eq!(rejected.try_get(), Some(Ok(0)));
        assert_eq!(taken.try_get(), Some(Ok(4)));
    }

    #[test]
    fn panicking_predicate_errors_consumer_and_retries() {
        let q = LockQueue::new();
        let bad = Consumer::predicated(ResultChannel::new(), |_: &u32| panic!("bad predicate"), 0);
        let broken = bad.result().clone();
        q.receive(bad).expect("receive");
        let plain = Consumer::simple();
        let taken = plain.result().clone();
        q.receive(plain).expect("receive");

        assert!(matches!(q.enqueue(1, true), Ok(Enqueued::Consumed)));
        assert!(matches!(broken.error_value(), Some(FlowError::Callback(_))));
        assert_eq!(taken.try_get(), Some(Ok(1)));
    }

    #[test]
    fn cancel_releases_no_message_and_is_idempotent() {
        let q = LockQueue::new();
        let first = read(&q);
        let second = read(&q);
        assert!(q.cancel(&first));
        assert!(!q.cancel(&first), "double cancel is a no-op");
        assert_eq!(first.error_value(), Some(FlowError::Cancelled));

        assert!(matches!(q.enqueue(11, true), Ok(Enqueued::Consumed)));
        assert_eq!(second.try_get(), Some(Ok(11)), "next consumer sees the message");
    }

    #[test]
    fn close_fails_pending_consumers_keeps_messages() {
        let q = LockQueue::new();
        assert!(matches!(q.enqueue(1, true), Ok(Enqueued::Queued(_))));
        q.close();
        assert!(matches!(q.enqueue(2, true), Ok(Enqueued::Closed)));
        assert!(!q.is_drained());
        assert_eq!(read(&q).try_get(), Some(Ok(1)));
        assert!(q.is_drained());
        assert_eq!(read(&q).error_value(), Some(FlowError::Drained));
    }

    #[test]
    fn close_with_pending_consumer_errors_it() {
        let q = LockQueue::<u32>::new();
        let rc = read(&q);
        q.close();
        assert_eq!(rc.error_value(), Some(FlowError::Drained));
    }

    #[test]
    fn fail_errors_everything() {
        let q = LockQueue::new();
        let listener = match q.enqueue(1, true) {
            Ok(Enqueued::Queued(l)) => l,
            other => panic!("expected queued: {other:?}"),
        };
        q.fail(&FlowError::callback("operator died"));
        assert_eq!(listener.error_value(), Some(FlowError::callback("operator died")));
        assert!(q.is_empty());
    }

    #[test]
    fn hand_over_hand_release_fires_inside_section() {
        let q = LockQueue::new();
        let released = Arc::new(AtomicU32::new(0));
        let seen = released.clone();
        let upstream = Release::of(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let out = q
            .enqueue_stream(1u32, false, upstream, |m, release| {
                drop(release);
                m
            })
            .expect("enqueue");
        assert!(matches!(out, Enqueued::Streamed(1)));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn streamed_section_blocks_other_producers_until_released() {
        let q = Arc::new(LockQueue::new());
        let q2 = q.clone();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();

        let handle = {
            let q = q.clone();
            thread::spawn(move || {
                let _ = q.enqueue_stream(1u32, false, Release::none(), move |m, release| {
                    o1.lock().push(m);
                    thread::sleep(Duration::from_millis(50));
                    drop(release);
                });
            })
        };
        thread::sleep(Duration::from_millis(10));
        let _ = q2.enqueue_stream(2u32, false, Release::none(), move |m, release| {
            o2.lock().push(m);
            drop(release);
        });
        handle.join().expect("producer thread");
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test]
    fn lock_queue_refuses_transactions() {
        let q = LockQueue::new();
        let denied = transaction(|| q.enqueue(1, true));
        assert!(matches!(denied, Err(FlowError::TransactionMix)));
    }

    #[test]
    fn tx_queue_requires_transactions() {
        let q = TxQueue::new();
        assert!(matches!(q.enqueue(1, true), Err(FlowError::TransactionMix)));
        let ok = transaction(|| q.enqueue(1, true));
        assert!(matches!(ok, Ok(Enqueued::Queued(_))));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn tx_queue_dispatches_under_transaction() {
        let q = TxQueue::new();
        let c = Consumer::simple();
        let rc = c.result().clone();
        transaction(|| q.receive(c)).expect("receive");
        let out = transaction(|| q.enqueue(9, true)).expect("enqueue");
        assert!(matches!(out, Enqueued::Consumed));
        assert_eq!(rc.try_get(), Some(Ok(9)));
    }

    #[test]
    fn transactional_copy_preserves_contents() {
        let q = LockQueue::new();
        assert!(matches!(q.enqueue(1, true), Ok(Enqueued::Queued(_))));
        assert!(matches!(q.enqueue(2, true), Ok(Enqueued::Queued(_))));
        q.close();

        let tx = transactional_copy(&q);
        assert_eq!(tx.len(), 2);
        assert!(tx.is_closed());

        let c = Consumer::simple();
        let rc = c.result().clone();
        transaction(|| tx.receive(c)).expect("receive");
        assert_eq!(rc.try_get(), Some(Ok(1)));
    }

    #[test]
    fn concurrent_producers_consumers_lose_nothing() {
        let q = Arc::new(LockQueue::new());
        let total = 200u32;

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let q = q.clone();
                thread::spawn(move || {
                    for i in 0..total / 4 {
                        let _ = q.enqueue(p * 1000 + i, true);
                    }
                })
            })
            .collect();

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let q = q.clone();
                let seen = seen.clone();
                thread::spawn(move || {
                    for _ in 0..total / 4 {
                        let c = Consumer::simple();
                        let rc = c.result().clone();
                        q.receive(c).expect("receive");
                        let v = rc.wait(Some(Duration::from_secs(5))).expect("message");
                        seen.lock().push(v);
                    }
                })
            })
            .collect();

        for h in producers.into_iter().chain(consumers) {
            h.join().expect("worker");
        }
        let mut seen = seen.lock().clone();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len() as u32, total, "no duplication, no loss");
    }
}
