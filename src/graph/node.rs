use super::{Edge, EdgeStyle, Emitter, LifecycleFn, NodeId, Propagator, UnconsumeFn, run_callback};
use crate::config::ChannelOptions;
use crate::error::FlowError;
use crate::message::Message;
use crate::queue::{Consumer, Enqueued, EventQueue, Release};
use crate::result::{ResultChannel, SendOutcome, SendResult, merge_send_results};
use crate::utils::{AsymLock, Label};
use ahash::AHashMap;
use parking_lot::RwLockReadGuard;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

/// Ingress transform applied by a node to every arriving message.
/// `Ok(None)` drops the message (the typed form of a filter rejection).
pub type Operator<In, Out> = Box<dyn Fn(In) -> Result<Option<Out>, FlowError> + Send + Sync>;

/// Lifecycle of a propagator vertex. Transitions are irrevocable except
/// `Consumed`, which an unconsume thunk reverts.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeState {
    Open,
    /// Exactly one owning edge streams every message; the queue is bypassed.
    Consumed,
    /// Two or more downstream edges; messages fan out in parallel.
    Split,
    Closed,
    Drained,
    Error(FlowError),
}

struct LinkedEdge<T: Message> {
    id: u64,
    edge: Edge<T>,
}

struct NodeCore<T: Message> {
    state: NodeState,
    queue: EventQueue<T>,
    edges: Vec<LinkedEdge<T>>,
    owner: Option<Edge<T>>,
    next_edge_id: u64,
    cancellations: AHashMap<u64, LifecycleFn>,
    on_closed: Vec<LifecycleFn>,
    on_drained: Vec<LifecycleFn>,
}

/// A propagator vertex: queue, operator, downstream edges, lifecycle state.
///
/// The node applies its operator on ingress, which is why enqueueing
/// directly into a mapped channel still transforms. The state lock is held
/// shared across a whole propagation (cycles re-enter it recursively) and
/// exclusively for lifecycle transitions and edge management.
pub struct Node<In: Message, Out: Message> {
    id: NodeId,
    label: Label,
    permanent: bool,
    grounded: bool,
    transactional: bool,
    operator: Operator<In, Out>,
    weak: Weak<Node<In, Out>>,
    core: AsymLock<NodeCore<Out>>,
}

/// Identity node: the building block of plain channels, forks, and taps.
pub fn identity_node<T: Message>(
    options: &ChannelOptions,
    seeds: impl IntoIterator<Item = T>,
) -> Arc<Node<T, T>> {
    Node::with_seeds(options, Box::new(|m| Ok(Some(m))), seeds)
}

impl<In: Message, Out: Message> Node<In, Out> {
    pub fn new(options: &ChannelOptions, operator: Operator<In, Out>) -> Arc<Self> {
        Self::with_seeds(options, operator, Vec::new())
    }

    pub fn with_seeds(
        options: &ChannelOptions,
        operator: Operator<In, Out>,
        seeds: impl IntoIterator<Item = Out>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Node {
            id: NodeId::new(),
            label: options.description.clone().unwrap_or_default(),
            permanent: options.permanent,
            grounded: options.grounded,
            transactional: options.transactional,
            operator,
            weak: weak.clone(),
            core: AsymLock::new(NodeCore {
                state: NodeState::Open,
                queue: EventQueue::seeded(options.transactional, seeds),
                edges: Vec::new(),
                owner: None,
                next_edge_id: 0,
                cancellations: AHashMap::new(),
                on_closed: Vec::new(),
                on_drained: Vec::new(),
            }),
        })
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn label(&self) -> &Label {
        &self.label
    }

    #[inline]
    pub fn is_permanent(&self) -> bool {
        self.permanent
    }

    #[inline]
    pub fn is_transactional(&self) -> bool {
        self.transactional
    }

    /// Apply the operator, then dispatch. The produced error of a failing
    /// operator poisons the node.
    pub fn ingest(&self, msg: In, upstream: Release<'_>) -> SendResult {
        let guard = self.core.read_recursive();
        match &guard.state {
            NodeState::Error(e) => return SendResult::Fail(e.clone()),
            NodeState::Closed | NodeState::Drained => {
                return SendResult::Done(SendOutcome::Closed);
            }
            _ => {}
        }
        let out = match catch_unwind(AssertUnwindSafe(|| (self.operator)(msg))) {
            Ok(Ok(Some(v))) => v,
            Ok(Ok(None)) => return SendResult::Done(SendOutcome::Discarded),
            Ok(Err(e)) => {
                drop(guard);
                self.fail_node(e.clone());
                return SendResult::Fail(e);
            }
            Err(p) => {
                let e = FlowError::from_panic(p);
                drop(guard);
                self.fail_node(e.clone());
                return SendResult::Fail(e);
            }
        };
        self.dispatch(guard, out, upstream)
    }

    /// Dispatch a message that is already in the node's output form,
    /// bypassing the operator.
    pub fn forward(&self, msg: Out, upstream: Release<'_>) -> SendResult {
        let guard = self.core.read_recursive();
        match &guard.state {
            NodeState::Error(e) => return SendResult::Fail(e.clone()),
            NodeState::Closed | NodeState::Drained => {
                return SendResult::Done(SendOutcome::Closed);
            }
            _ => {}
        }
        self.dispatch(guard, msg, upstream)
    }

    fn dispatch(
        &self,
        guard: RwLockReadGuard<'_, NodeCore<Out>>,
        out: Out,
        upstream: Release<'_>,
    ) -> SendResult {
        match &guard.state {
            NodeState::Consumed => {
                let owner = guard.owner.clone();
                match owner {
                    Some(edge) => edge.target().propagate(out, upstream),
                    None => SendResult::Done(SendOutcome::Discarded),
                }
            }
            _ => {
                let edges: Vec<Edge<Out>> = guard.edges.iter().map(|l| l.edge.clone()).collect();
                // messages buffer only while nothing is attached downstream
                let persist = edges.is_empty();
                let queue = guard.queue.clone();
                let enq = queue.enqueue_stream(out, persist, upstream, |m, section| {
                    self.fan_out(m, edges, section)
                });
                match enq {
                    Err(e) => SendResult::Fail(e),
                    Ok(Enqueued::Closed) => SendResult::Done(SendOutcome::Closed),
                    Ok(Enqueued::Consumed) => SendResult::Done(SendOutcome::Consumed),
                    Ok(Enqueued::Queued(listener)) => SendResult::Deferred(listener),
                    Ok(Enqueued::Discarded) => SendResult::Done(SendOutcome::Discarded),
                    Ok(Enqueued::Streamed(result)) => result,
                }
            }
        }
    }

    /// Stream one message through the edge snapshot while this node's queue
    /// section pins its position in the FIFO.
    ///
    /// A single non-tap edge gets the section handed down (released inside
    /// the destination's own section). A fan-out holds the section until
    /// every destination has ordered its copy, so a cycle must re-enter
    /// through a single-edge node, never through a split.
    fn fan_out(&self, msg: Out, edges: Vec<Edge<Out>>, section: Release<'_>) -> SendResult {
        let non_tap = edges.iter().filter(|e| e.style() != EdgeStyle::Tap).count();
        if edges.len() == 1 && non_tap == 1 {
            return match edges.into_iter().next() {
                Some(edge) => edge.target().propagate(msg, section),
                None => SendResult::Done(SendOutcome::Discarded),
            };
        }

        let mut section = section;
        let mut results = Vec::with_capacity(non_tap);
        let count = edges.len();
        let mut payload = Some(msg);
        for (i, edge) in edges.into_iter().enumerate() {
            let m = match payload.take() {
                Some(m) => {
                    if i + 1 < count {
                        payload = Some(m.clone());
                    }
                    m
                }
                None => break,
            };
            let r = edge.target().propagate(m, Release::none());
            // taps carry no back-pressure
            if edge.style() != EdgeStyle::Tap {
                results.push(r);
            }
        }
        section.fire();

        match results.len() {
            0 => SendResult::Done(SendOutcome::Discarded),
            1 => match results.pop() {
                Some(r) => r,
                None => SendResult::Done(SendOutcome::Discarded),
            },
            _ => merge_send_results(results),
        }
    }

    /// Attach a downstream edge, streaming any backlog through it in order.
    pub fn link(&self, edge: Edge<Out>) -> Result<u64, FlowError> {
        let mut settled = Vec::new();
        let id = {
            let mut g = self.core.write();
            match &g.state {
                NodeState::Consumed => return Err(FlowError::AlreadyConsumed),
                NodeState::Closed | NodeState::Drained => return Err(FlowError::AlreadyClosed),
                NodeState::Error(e) => return Err(e.clone()),
                NodeState::Open | NodeState::Split => {}
            }
            let id = g.next_edge_id;
            g.next_edge_id += 1;
            g.edges.push(LinkedEdge {
                id,
                edge: edge.clone(),
            });
            if !self.grounded {
                g.state = if g.edges.len() > 1 {
                    NodeState::Split
                } else {
                    NodeState::Open
                };
            }
            // the queue section is held across the flush so no concurrent
            // enqueue can overtake the backlog
            g.queue.flush_ordered(|payload, listener| {
                let r = edge.target().propagate(payload, Release::none());
                settled.push((listener, r));
            });
            id
        };
        for (listener, result) in settled {
            settle_listener(listener, result);
        }
        Ok(id)
    }

    /// Detach the edge `link` returned `edge_id` for.
    pub fn unlink(&self, edge_id: u64) -> bool {
        let mut g = self.core.write();
        let before = g.edges.len();
        g.edges.retain(|l| l.id != edge_id);
        let found = g.edges.len() != before;
        if found && !self.grounded && matches!(g.state, NodeState::Open | NodeState::Split) {
            g.state = if g.edges.len() > 1 {
                NodeState::Split
            } else {
                NodeState::Open
            };
        }
        found
    }

    /// Designate `edge` as the node's owner: every message streams through
    /// it and the queue is bypassed. Fails when an owner already exists.
    pub fn consume(&self, edge: Edge<Out>) -> Result<UnconsumeFn, FlowError> {
        let mut settled = Vec::new();
        {
            let mut g = self.core.write();
            match &g.state {
                NodeState::Consumed => return Err(FlowError::AlreadyConsumed),
                NodeState::Closed | NodeState::Drained => return Err(FlowError::AlreadyClosed),
                NodeState::Error(e) => return Err(e.clone()),
                NodeState::Open | NodeState::Split => {}
            }
            g.owner = Some(edge.clone());
            g.state = NodeState::Consumed;
            g.queue.flush_ordered(|payload, listener| {
                let r = edge.target().propagate(payload, Release::none());
                settled.push((listener, r));
            });
        }
        for (listener, result) in settled {
            settle_listener(listener, result);
        }
        let weak = self.weak.clone();
        Ok(Box::new(move || {
            if let Some(node) = weak.upgrade() {
                node.unconsume();
            }
        }))
    }

    fn unconsume(&self) {
        let mut g = self.core.write();
        if matches!(g.state, NodeState::Consumed) {
            g.owner = None;
            g.state = if g.edges.len() > 1 {
                NodeState::Split
            } else {
                NodeState::Open
            };
        }
    }

    /// Register a one-shot consumer, or satisfy it from the backlog.
    pub fn receive(&self, consumer: Consumer<Out>) -> ResultChannel<Out> {
        let rc = consumer.result().clone();
        let queue = {
            let guard = self.core.read();
            match &guard.state {
                NodeState::Error(e) => {
                    let e = e.clone();
                    drop(guard);
                    let _ = rc.fail(e);
                    return rc;
                }
                NodeState::Drained => {
                    drop(guard);
                    let _ = rc.fail(FlowError::Drained);
                    return rc;
                }
                _ => guard.queue.clone(),
            }
        };
        let _ = queue.receive(consumer);
        self.settle_drained();
        rc
    }

    pub fn cancel_receive(&self, rc: &ResultChannel<Out>) -> bool {
        let queue = self.core.read().queue.clone();
        queue.cancel(rc)
    }

    /// Pop the entire backlog, acknowledging producers.
    pub fn drain(&self) -> Vec<Out> {
        let queue = self.core.read().queue.clone();
        let out = queue.drain_buffered();
        self.settle_drained();
        out
    }

    pub fn state(&self) -> NodeState {
        self.core.read().state.clone()
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self.state(),
            NodeState::Closed | NodeState::Drained | NodeState::Error(_)
        )
    }

    pub fn is_drained(&self) -> bool {
        matches!(self.state(), NodeState::Drained)
    }

    /// Close: refuse if permanent (unless forced), cascade downstream, fail
    /// pending receives, keep the backlog receivable until drained.
    pub fn close(&self) -> bool {
        self.close_inner(false)
    }

    pub fn close_force(&self) -> bool {
        self.close_inner(true)
    }

    fn close_inner(&self, force: bool) -> bool {
        if self.permanent && !force {
            return false;
        }
        let (queue, targets, on_closed, on_drained) = {
            let mut g = self.core.write();
            match &g.state {
                NodeState::Closed | NodeState::Drained => return true,
                NodeState::Error(_) => return false,
                _ => {}
            }
            let queue = g.queue.clone();
            // the write guard excludes producers, so the backlog length is
            // stable here; empty backlog means drained the moment we close
            let drained = queue.len() == 0;
            let owner_target = g.owner.take().map(Edge::into_target);
            let targets: Vec<Arc<dyn Propagator<Out>>> = g
                .edges
                .drain(..)
                .map(|l| l.edge.into_target())
                .chain(owner_target)
                .collect();
            g.cancellations.clear();
            let on_closed = std::mem::take(&mut g.on_closed);
            let on_drained = if drained {
                g.state = NodeState::Drained;
                g.queue = EventQueue::Drained;
                std::mem::take(&mut g.on_drained)
            } else {
                g.state = NodeState::Closed;
                Vec::new()
            };
            (queue, targets, on_closed, on_drained)
        };
        queue.close();
        for f in on_closed {
            run_callback(f);
        }
        for f in on_drained {
            run_callback(f);
        }
        for target in targets {
            target.close();
        }
        tracing::debug!(node = %self.id, label = %self.label, "node closed");
        true
    }

    /// Error: irreversible, cascades downstream through every edge style.
    pub fn fail_node(&self, error: FlowError) {
        let (queue, targets) = {
            let mut g = self.core.write();
            match &g.state {
                NodeState::Closed | NodeState::Drained | NodeState::Error(_) => return,
                _ => {}
            }
            g.state = NodeState::Error(error.clone());
            let queue = g.queue.clone();
            g.queue = EventQueue::Errored(error.clone());
            let owner_target = g.owner.take().map(Edge::into_target);
            let targets: Vec<Arc<dyn Propagator<Out>>> = g
                .edges
                .drain(..)
                .map(|l| l.edge.into_target())
                .chain(owner_target)
                .collect();
            g.cancellations.clear();
            g.on_closed.clear();
            g.on_drained.clear();
            (queue, targets)
        };
        queue.fail(&error);
        for target in targets {
            target.fail(error.clone());
        }
        tracing::debug!(node = %self.id, label = %self.label, "node errored: {error}");
    }

    /// Runs `f` once the node closes; immediately if it already has.
    pub fn on_closed(&self, f: LifecycleFn) {
        {
            let mut g = self.core.write();
            match &g.state {
                NodeState::Closed | NodeState::Drained | NodeState::Error(_) => {}
                _ => {
                    g.on_closed.push(f);
                    return;
                }
            }
        }
        run_callback(f);
    }

    /// Runs `f` once the node is closed and its backlog gone; immediately if
    /// it already is.
    pub fn on_drained(&self, f: LifecycleFn) {
        {
            let mut g = self.core.write();
            match &g.state {
                NodeState::Drained | NodeState::Error(_) => {}
                _ => {
                    g.on_drained.push(f);
                    return;
                }
            }
        }
        run_callback(f);
    }

    pub fn register_cancellation(&self, key: u64, f: LifecycleFn) {
        let mut g = self.core.write();
        g.cancellations.insert(key, f);
    }

    /// Invoke and remove the cancellation hook under `key`.
    pub fn cancel(&self, key: u64) -> bool {
        let hook = {
            let mut g = self.core.write();
            g.cancellations.remove(&key)
        };
        match hook {
            Some(f) => {
                run_callback(f);
                true
            }
            None => false,
        }
    }

    // Closed with an emptied backlog => Drained, firing on_drained hooks.
    fn settle_drained(&self) {
        {
            let guard = self.core.read();
            if !(matches!(guard.state, NodeState::Closed) && guard.queue.is_drained()) {
                return;
            }
        }
        let on_drained = {
            let mut g = self.core.write();
            if !(matches!(g.state, NodeState::Closed) && g.queue.is_drained()) {
                return;
            }
            g.state = NodeState::Drained;
            g.queue = EventQueue::Drained;
            std::mem::take(&mut g.on_drained)
        };
        for f in on_drained {
            run_callback(f);
        }
    }
}

fn settle_listener(listener: Option<ResultChannel<SendOutcome>>, result: SendResult) {
    let Some(l) = listener else { return };
    match result {
        SendResult::Done(o) => {
            let _ = l.succeed(o);
        }
        SendResult::Fail(e) => {
            let _ = l.fail(e);
        }
        SendResult::Deferred(rc) => {
            let ack = l.clone();
            rc.on_success(move |o| {
                let _ = ack.succeed(o);
            });
            rc.on_error(move |e| {
                let _ = l.fail(e);
            });
        }
    }
}

impl<In: Message, Out: Message> Propagator<In> for Node<In, Out> {
    fn propagate(&self, msg: In, upstream: Release<'_>) -> SendResult {
        self.ingest(msg, upstream)
    }

    fn close(&self) -> bool {
        Node::close(self)
    }

    fn close_force(&self) -> bool {
        Node::close_force(self)
    }

    fn fail(&self, error: FlowError) {
        self.fail_node(error);
    }

    fn is_closed(&self) -> bool {
        Node::is_closed(self)
    }

    fn on_closed(&self, f: LifecycleFn) {
        Node::on_closed(self, f);
    }

    fn label(&self) -> &Label {
        Node::label(self)
    }
}

impl<In: Message, Out: Message> Emitter<Out> for Node<In, Out> {
    fn link(&self, edge: Edge<Out>) -> Result<u64, FlowError> {
        Node::link(self, edge)
    }

    fn unlink(&self, edge_id: u64) -> bool {
        Node::unlink(self, edge_id)
    }

    fn consume(&self, edge: Edge<Out>) -> Result<UnconsumeFn, FlowError> {
        Node::consume(self, edge)
    }

    fn receive(&self, consumer: Consumer<Out>) -> ResultChannel<Out> {
        Node::receive(self, consumer)
    }

    fn cancel_receive(&self, rc: &ResultChannel<Out>) -> bool {
        Node::cancel_receive(self, rc)
    }

    fn drain(&self) -> Vec<Out> {
        Node::drain(self)
    }

    fn state(&self) -> NodeState {
        Node::state(self)
    }

    fn is_drained(&self) -> bool {
        Node::is_drained(self)
    }

    fn on_closed(&self, f: LifecycleFn) {
        Node::on_closed(self, f);
    }

    fn on_drained(&self, f: LifecycleFn) {
        Node::on_drained(self, f);
    }

    fn register_cancellation(&self, key: u64, f: LifecycleFn) {
        Node::register_cancellation(self, key, f);
    }

    fn cancel(&self, key: u64) -> bool {
        Node::cancel(self, key)
    }

    fn is_transactional(&self) -> bool {
        Node::is_transactional(self)
    }

    fn node_id(&self) -> NodeId {
        self.id
    }

    fn label(&self) -> &Label {
        Node::label(self)
    }
}

impl<In: Message, Out: Message> fmt::Debug for Node<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Node");
        d.field("id", &self.id).field("label", &self.label);
        match self.core.try_write() {
            Some(g) => d
                .field("state", &g.state)
                .field("edges", &g.edges.len())
                .field("backlog", &g.queue.len()),
            None => d.field("state", &"busy"),
        };
        d.finish()
    }
}
