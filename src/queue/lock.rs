use super::consumer::Consumer;
use super::state::{DispatchPlan, EnqueueStep, QueueState};
use super::{Enqueued, Release, in_transaction};
use crate::error::FlowError;
use crate::message::Message;
use crate::result::ResultChannel;
use parking_lot::Mutex;
use std::sync::Arc;

/// The lock-based queue variant. Cheap to clone; clones share state.
///
/// Refuses to be touched inside a transaction.
pub struct LockQueue<T: Message> {
    state: Arc<Mutex<QueueState<T>>>,
}

impl<T: Message> Clone for LockQueue<T> {
    fn clone(&self) -> Self {
        LockQueue {
            state: self.state.clone(),
        }
    }
}

impl<T: Message> LockQueue<T> {
    pub fn new() -> Self {
        LockQueue {
            state: Arc::new(Mutex::new(QueueState::new())),
        }
    }

    pub fn seeded(msgs: impl IntoIterator<Item = T>) -> Self {
        LockQueue {
            state: Arc::new(Mutex::new(QueueState::seeded(msgs))),
        }
    }

    pub(crate) fn snapshot(&self) -> QueueState<T> {
        self.state.lock().clone()
    }

    /// Enqueue under the exclusive section. `upstream` is released as soon
    /// as the section is entered (hand-over-hand). When the message neither
    /// reaches a consumer nor is buffered, `stream` receives it together
    /// with a release of this queue's section, so the caller can forward it
    /// downstream while holding the FIFO-critical lock.
    pub fn enqueue_stream<R>(
        &self,
        msg: T,
        persist: bool,
        mut upstream: Release<'_>,
        stream: impl for<'q> FnOnce(T, Release<'q>) -> R,
    ) -> Result<Enqueued<R>, FlowError> {
        if in_transaction() {
            return Err(FlowError::TransactionMix);
        }
        let mut plan = DispatchPlan::new();
        let mut guard = self.state.lock();
        upstream.fire();
        let step = guard.enqueue(msg, persist, &mut plan);
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
                Enqueued::Streamed(stream(m, release))
            }
        };
        plan.run();
        Ok(out)
    }

    /// Plain enqueue: an unhandled pass-through is a discard.
    pub fn enqueue(&self, msg: T, persist: bool) -> Result<Enqueued<()>, FlowError> {
        self.enqueue_stream(msg, persist, Release::none(), |_, release| drop(release))
            .map(|e| match e {
                Enqueued::Streamed(()) => Enqueued::Discarded,
                other => other,
            })
    }

    pub fn receive(&self, consumer: Consumer<T>) -> Result<(), FlowError> {
        if in_transaction() {
            return Err(FlowError::TransactionMix);
        }
        let mut plan = DispatchPlan::new();
        {
            let mut guard = self.state.lock();
            guard.receive(consumer, &mut plan);
        }
        plan.run();
        Ok(())
    }

    pub fn cancel(&self, rc: &ResultChannel<T>) -> bool {
        let mut plan = DispatchPlan::new();
        let found = {
            let mut guard = self.state.lock();
            guard.cancel(rc, &mut plan)
        };
        plan.run();
        found
    }

    pub fn close(&self) {
        let mut plan = DispatchPlan::new();
        {
            let mut guard = self.state.lock();
            guard.close(&mut plan);
        }
        plan.run();
    }

    pub fn fail(&self, error: &FlowError) {
        let mut plan = DispatchPlan::new();
        {
            let mut guard = self.state.lock();
            guard.fail(error, &mut plan);
        }
        plan.run();
    }

    pub fn drain_buffered(&self) -> Vec<T> {
        let mut plan = DispatchPlan::new();
        let out = {
            let mut guard = self.state.lock();
            guard.drain_buffered(&mut plan)
        };
        plan.run();
        out
    }

    /// Flush buffered messages through `f` while holding the exclusive
    /// section, so no concurrent enqueue can overtake them. `f` gets each
    /// payload with its producer listener.
    pub(crate) fn flush_ordered(
        &self,
        mut f: impl FnMut(T, Option<ResultChannel<crate::result::SendOutcome>>),
    ) {
        let mut guard = self.state.lock();
        for m in guard.take_buffered() {
            f(m.payload, m.listener);
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().is_closed()
    }

    pub fn is_drained(&self) -> bool {
        self.state.lock().is_drained()
    }
}

impl<T: Message> Default for LockQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
