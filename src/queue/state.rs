use super::consumer::{Consumer, Offer};
use crate::error::FlowError;
use crate::message::Message;
use crate::result::{ResultChannel, SendOutcome};
use std::collections::VecDeque;

/// A buffered message plus the deferred its producer holds for
/// back-pressure.
pub struct QueuedMessage<T: Message> {
    pub payload: T,
    pub listener: Option<ResultChannel<SendOutcome>>,
}

impl<T: Message> Clone for QueuedMessage<T> {
    fn clone(&self) -> Self {
        QueuedMessage {
            payload: self.payload.clone(),
            listener: self.listener.clone(),
        }
    }
}

/// Completions decided under a queue lock, executed after it is released.
/// Listener callbacks may re-enter the queue, so running them while locked
/// would deadlock.
enum DispatchOp<T: Message> {
    /// Consumer whose claim was won during the offer.
    DeliverClaimed(ResultChannel<T>, T),
    /// Consumer whose claim was won but whose predicate failed.
    RejectClaimed(ResultChannel<T>, FlowError),
    /// Consumer that was never claimed; claim is attempted and a lost race
    /// leaves the channel untouched.
    Reject(ResultChannel<T>, FlowError),
    /// Producer-side listener acknowledgment.
    Ack(ResultChannel<SendOutcome>, SendOutcome),
    Nack(ResultChannel<SendOutcome>, FlowError),
}

pub struct DispatchPlan<T: Message> {
    ops: Vec<DispatchOp<T>>,
}

impl<T: Message> DispatchPlan<T> {
    pub fn new() -> Self {
        DispatchPlan { ops: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn run(self) {
        for op in self.ops {
            match op {
                DispatchOp::DeliverClaimed(rc, v) => {
                    let _ = rc.succeed_claimed(v);
                }
                DispatchOp::RejectClaimed(rc, e) => {
                    let _ = rc.fail_claimed(e);
                }
                DispatchOp::Reject(rc, e) => {
                    let _ = rc.fail(e);
                }
                DispatchOp::Ack(rc, o) => {
                    let _ = rc.succeed(o);
                }
                DispatchOp::Nack(rc, e) => {
                    let _ = rc.fail(e);
                }
            }
        }
    }
}

/// Where an enqueue landed, decided under the lock.
pub enum EnqueueStep<T: Message> {
    Closed,
    Consumed,
    Queued(ResultChannel<SendOutcome>),
    /// No consumer took it and the caller asked not to buffer: the message
    /// is handed back for streaming (or discarding).
    Pass(T),
}

/// The queue proper: messages, consumers, closed flag. Both concrete queue
/// variants wrap this and differ only in locking discipline.
///
/// Invariant: `messages` and `consumers` are never simultaneously non-empty.
pub struct QueueState<T: Message> {
    messages: VecDeque<QueuedMessage<T>>,
    consumers: VecDeque<Consumer<T>>,
    closed: bool,
}

impl<T: Message> Clone for QueueState<T> {
    fn clone(&self) -> Self {
        QueueState {
            messages: self.messages.clone(),
            consumers: self.consumers.clone(),
            closed: self.closed,
        }
    }
}

impl<T: Message> QueueState<T> {
    pub fn new() -> Self {
        QueueState {
            messages: VecDeque::new(),
            consumers: VecDeque::new(),
            closed: false,
        }
    }

    pub fn seeded(msgs: impl IntoIterator<Item = T>) -> Self {
        let mut state = QueueState::new();
        state.messages.extend(msgs.into_iter().map(|payload| QueuedMessage {
            payload,
            listener: None,
        }));
        state
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    #[inline]
    pub fn is_drained(&self) -> bool {
        self.closed && self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Offer to waiting consumers in order, retrying past dead, rejected,
    /// and broken ones; then buffer or pass.
    pub fn enqueue(&mut self, msg: T, persist: bool, plan: &mut DispatchPlan<T>) -> EnqueueStep<T> {
        if self.closed {
            return EnqueueStep::Closed;
        }
        while let Some(consumer) = self.consumers.pop_front() {
            match consumer.offer(&msg) {
                Offer::Taken => {
                    plan.ops
                        .push(DispatchOp::DeliverClaimed(consumer.result().clone(), msg));
                    return EnqueueStep::Consumed;
                }
                Offer::Rejected(false_value) => {
                    plan.ops.push(DispatchOp::DeliverClaimed(
                        consumer.result().clone(),
                        false_value,
                    ));
                }
                Offer::Broken(e) => {
                    plan.ops
                        .push(DispatchOp::RejectClaimed(consumer.result().clone(), e));
                }
                Offer::Dead => {}
            }
        }
        if persist {
            let listener = ResultChannel::new();
            self.messages.push_back(QueuedMessage {
                payload: msg,
                listener: Some(listener.clone()),
            });
            EnqueueStep::Queued(listener)
        } else {
            EnqueueStep::Pass(msg)
        }
    }

    /// Register a consumer, or satisfy it from the buffer head.
    pub fn receive(&mut self, consumer: Consumer<T>, plan: &mut DispatchPlan<T>) {
        if let Some(front) = self.messages.front() {
            match consumer.offer(&front.payload) {
                Offer::Taken => {
                    let m = match self.messages.pop_front() {
                        Some(m) => m,
                        None => return,
                    };
                    plan.ops
                        .push(DispatchOp::DeliverClaimed(consumer.result().clone(), m.payload));
                    if let Some(listener) = m.listener {
                        plan.ops.push(DispatchOp::Ack(listener, SendOutcome::Consumed));
                    }
                }
                Offer::Rejected(false_value) => {
                    plan.ops.push(DispatchOp::DeliverClaimed(
                        consumer.result().clone(),
                        false_value,
                    ));
                }
                Offer::Broken(e) => {
                    plan.ops
                        .push(DispatchOp::RejectClaimed(consumer.result().clone(), e));
                }
                Offer::Dead => {}
            }
            return;
        }
        if self.closed {
            plan.ops
                .push(DispatchOp::Reject(consumer.result().clone(), FlowError::Drained));
            return;
        }
        self.consumers.push_back(consumer);
    }

    /// Remove the consumer identified by `rc`. A consumer already claimed by
    /// an arrival race is removed without being errored.
    pub fn cancel(&mut self, rc: &ResultChannel<T>, plan: &mut DispatchPlan<T>) -> bool {
        let before = self.consumers.len();
        self.consumers.retain(|c| !c.result().same_channel(rc));
        let found = self.consumers.len() != before;
        if found {
            plan.ops.push(DispatchOp::Reject(rc.clone(), FlowError::Cancelled));
        }
        found
    }

    /// Close: pending consumers drain as errors, buffered messages stay
    /// receivable.
    pub fn close(&mut self, plan: &mut DispatchPlan<T>) {
        if self.closed {
            return;
        }
        self.closed = true;
        for c in self.consumers.drain(..) {
            plan.ops
                .push(DispatchOp::Reject(c.result().clone(), FlowError::Drained));
        }
    }

    /// Error: everything pending resolves with `error`, buffered messages
    /// are dropped and their producers notified.
    pub fn fail(&mut self, error: &FlowError, plan: &mut DispatchPlan<T>) {
        self.closed = true;
        for c in self.consumers.drain(..) {
            plan.ops
                .push(DispatchOp::Reject(c.result().clone(), error.clone()));
        }
        for m in self.messages.drain(..) {
            if let Some(listener) = m.listener {
                plan.ops.push(DispatchOp::Nack(listener, error.clone()));
            }
        }
    }

    /// Pop every buffered message, acknowledging producers.
    pub fn drain_buffered(&mut self, plan: &mut DispatchPlan<T>) -> Vec<T> {
        let mut out = Vec::with_capacity(self.messages.len());
        for m in self.messages.drain(..) {
            if let Some(listener) = m.listener {
                plan.ops.push(DispatchOp::Ack(listener, SendOutcome::Consumed));
            }
            out.push(m.payload);
        }
        out
    }

    /// Take buffered messages with their listeners intact; the caller
    /// becomes responsible for completing them.
    pub fn take_buffered(&mut self) -> Vec<QueuedMessage<T>> {
        self.messages.drain(..).collect()
    }
}
