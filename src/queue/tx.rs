use super::consumer::Consumer;
use super::state::{DispatchPlan, EnqueueStep, QueueState};
use super::{Enqueued, Release, in_transaction};
use crate::error::FlowError;
use crate::message::Message;
use crate::result::ResultChannel;
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

const CONFLICT_BACKOFF: Duration = Duration::from_millis(1);

struct TxShared<T: Message> {
    version: AtomicU64,
    state: Mutex<QueueState<T>>,
}

/// The transactional queue variant.
///
/// The runtime has no software transactional memory, so the contract is
/// carried by a logical version tag: an operation snapshots the tag, takes
/// the state opportunistically, and retries with a back-off escalating to a
/// 1 ms sleep when the tag moved underneath it. Atomicity across several
/// queues in one transaction is not available.
///
/// Refuses to be touched outside a transaction.
pub struct TxQueue<T: Message> {
    shared: Arc<TxShared<T>>,
}

impl<T: Message> Clone for TxQueue<T> {
    fn clone(&self) -> Self {
        TxQueue {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Message> TxQueue<T> {
    pub fn new() -> Self {
        Self::from_state(QueueState::new())
    }

    pub fn seeded(msgs: impl IntoIterator<Item = T>) -> Self {
        Self::from_state(QueueState::seeded(msgs))
    }

    fn from_state(state: QueueState<T>) -> Self {
        TxQueue {
            shared: Arc::new(TxShared {
                version: AtomicU64::new(0),
                state: Mutex::new(state),
            }),
        }
    }

    /// Commit one mutation under the version tag, retrying on conflict.
    fn commit<R>(
        &self,
        f: impl FnOnce(&mut QueueState<T>, &mut DispatchPlan<T>) -> R,
    ) -> Result<R, FlowError> {
        if !in_transaction() {
            return Err(FlowError::TransactionMix);
        }
        let mut f = Some(f);
        let backoff = Backoff::new();
        loop {
            let seen = self.shared.version.load(Ordering::Acquire);
            if let Some(mut guard) = self.shared.state.try_lock() {
                if self.shared.version.load(Ordering::Relaxed) == seen {
                    let mut plan = DispatchPlan::new();
                    let func = match f.take() {
                        Some(func) => func,
                        None => return Err(FlowError::TransactionMix),
                    };
                    let out = func(&mut guard, &mut plan);
                    self.shared.version.fetch_add(1, Ordering::Release);
                    drop(guard);
                    plan.run();
                    return Ok(out);
                }
            }
            if backoff.is_completed() {
                thread::sleep(CONFLICT_BACKOFF);
            } else {
                backoff.snooze();
            }
        }
    }

    pub fn enqueue_stream<R>(
        &self,
        msg: T,
        persist: bool,
        mut upstream: Release<'_>,
        stream: impl for<'q> FnOnce(T, Release<'q>) -> R,
    ) -> Result<Enqueued<R>, FlowError> {
        if !in_transaction() {
            return Err(FlowError::TransactionMix);
        }
        let backoff = Backoff::new();
        let mut msg = Some(msg);
        let mut stream = Some(stream);
        loop {
            let seen = self.shared.version.load(Ordering::Acquire);
            if let Some(mut guard) = self.shared.state.try_lock() {
                if self.shared.version.load(Ordering::Relaxed) == seen {
                    upstream.fire();
                    let mut plan = DispatchPlan::new();
                    let payload = match msg.take() {
                        Some(m) => m,
                        None => return Err(FlowError::TransactionMix),
                    };
                    let step = guard.enqueue(payload, persist, &mut plan);
                    self.shared.version.fetch_add(1, Ordering::Release);
                    let out = match step {
                        EnqueueStep::Closed => {
                            drop(guard);
                            Enqueued::Closed
                        }
                        EnqueueStep::Consumed => {
                            drop(guard);
                            Enqueued::Consumed
                        }
                        EnqueueStep::Queued(listener) => {
                            drop(guard);
                            Enqueued::Queued(listener)
                        }
                        EnqueueStep::Pass(m) => {
                            let mut held = Some(guard);
                            let release = Release::of(move || {
                                held.take();
                            });
                            let func = match stream.take() {
                                Some(func) => func,
                                None => return Err(FlowError::TransactionMix),
                            };
                            Enqueued::Streamed(func(m, release))
                        }
                    };
                    plan.run();
                    return Ok(out);
                }
            }
            if backoff.is_completed() {
                thread::sleep(CONFLICT_BACKOFF);
            } else {
                backoff.snooze();
            }
        }
    }

    pub fn enqueue(&self, msg: T, persist: bool) -> Result<Enqueued<()>, FlowError> {
        self.enqueue_stream(msg, persist, Release::none(), |_, release| drop(release))
            .map(|e| match e {
                Enqueued::Streamed(()) => Enqueued::Discarded,
                other => other,
            })
    }

    pub fn receive(&self, consumer: Consumer<T>) -> Result<(), FlowError> {
        self.commit(move |state, plan| state.receive(consumer, plan))
    }

    pub fn cancel(&self, rc: &ResultChannel<T>) -> bool {
        let rc = rc.clone();
        super::transaction(|| self.commit(move |state, plan| state.cancel(&rc, plan)))
            .unwrap_or(false)
    }

    pub fn close(&self) {
        let _ = super::transaction(|| self.commit(|state, plan| state.close(plan)));
    }

    pub fn fail(&self, error: &FlowError) {
        let error = error.clone();
        let _ = super::transaction(|| self.commit(move |state, plan| state.fail(&error, plan)));
    }

    pub fn drain_buffered(&self) -> Vec<T> {
        super::transaction(|| self.commit(|state, plan| state.drain_buffered(plan)))
            .unwrap_or_default()
    }

    pub(crate) fn flush_ordered(
        &self,
        mut f: impl FnMut(T, Option<ResultChannel<crate::result::SendOutcome>>),
    ) {
        let mut guard = self.shared.state.lock();
        for m in guard.take_buffered() {
            f(m.payload, m.listener);
        }
        self.shared.version.fetch_add(1, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().is_closed()
    }

    pub fn is_drained(&self) -> bool {
        self.shared.state.lock().is_drained()
    }
}

impl<T: Message> Default for TxQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot a lock-based queue into a transactional one, preserving
/// messages, the consumer list, and the closed flag.
pub fn transactional_copy<T: Message>(queue: &super::LockQueue<T>) -> TxQueue<T> {
    TxQueue::from_state(queue.snapshot())
}
