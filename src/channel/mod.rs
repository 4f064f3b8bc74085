use crate::config::ChannelOptions;
use crate::error::FlowError;
use crate::graph::{Edge, Emitter, Node, NodeState, Propagator, Terminal, identity_node};
use crate::message::Message;
use crate::queue::{Consumer, Predicate, Release};
use crate::result::{ResultChannel, SendResult};
use crate::time::Context;
use crate::utils::Label;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Handle returned by [`Channel::receive_all`]; cancels the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionKey(u64);

/// A (receiver-node, emitter-node) pair.
///
/// For a plain channel both views are the same node; [`splice`] pairs the
/// front of one graph with the back of another so head-of-pipeline
/// transforms stay separate from consumer-side ones. Enqueued messages pass
/// through the receiver's operator, so enqueueing into a mapped channel
/// transforms.
pub struct Channel<In: Message, Out: Message = In> {
    receiver: Arc<dyn Propagator<In>>,
    emitter: Arc<dyn Emitter<Out>>,
}

impl<In: Message, Out: Message> Clone for Channel<In, Out> {
    fn clone(&self) -> Self {
        Channel {
            receiver: self.receiver.clone(),
            emitter: self.emitter.clone(),
        }
    }
}

/// Empty open channel.
pub fn channel<T: Message>() -> Channel<T> {
    channel_with(&ChannelOptions::default(), [])
}

/// Open channel with `msgs` pre-buffered.
pub fn channel_of<T: Message>(msgs: impl IntoIterator<Item = T>) -> Channel<T> {
    channel_with(&ChannelOptions::default(), msgs)
}

/// Channel built from explicit options, with `seeds` pre-buffered.
pub fn channel_with<T: Message>(
    options: &ChannelOptions,
    seeds: impl IntoIterator<Item = T>,
) -> Channel<T> {
    Channel::from_node(identity_node(options, seeds))
}

/// Channel that already carries `msgs` and is closed: readable until
/// drained, rejecting enqueues.
pub fn closed_channel<T: Message>(msgs: impl IntoIterator<Item = T>) -> Channel<T> {
    let ch = channel_of(msgs);
    ch.close();
    ch
}

/// Pair the receiver of `front` with the emitter of `back`. Linking the two
/// graphs stays the caller's responsibility.
pub fn splice<In: Message, M1: Message, M2: Message, Out: Message>(
    front: &Channel<In, M1>,
    back: &Channel<M2, Out>,
) -> Channel<In, Out> {
    Channel {
        receiver: front.receiver.clone(),
        emitter: back.emitter.clone(),
    }
}

/// Link `src`'s emitter into `dst`'s receiver: messages flow onward, and
/// closing `src` closes `dst` unless `dst` is permanent.
pub fn siphon<A: Message, T: Message, B: Message>(
    src: &Channel<A, T>,
    dst: &Channel<T, B>,
) -> Result<u64, FlowError> {
    src.emitter.link(Edge::join(
        Label::derived("siphon", src.emitter.label()),
        propagator_of(dst),
    ))
}

/// [`siphon`], plus the reverse coupling: closing `dst` closes `src`.
pub fn join<A: Message, T: Message, B: Message>(
    src: &Channel<A, T>,
    dst: &Channel<T, B>,
) -> Result<u64, FlowError> {
    let id = siphon(src, dst)?;
    let up = src.receiver.clone();
    dst.receiver.on_closed(Box::new(move || {
        up.close();
    }));
    Ok(id)
}

/// Attach a propagator edge to `src` whose destination applies `callback`;
/// the callback's send-result is the edge's back-pressure. Lifetimes couple
/// both ways, like [`join`].
pub fn bridge_join<A: Message, T: Message, B: Message, U: Message>(
    src: &Channel<A, T>,
    dst: &Channel<B, U>,
    description: impl Into<Label>,
    callback: impl Fn(T) -> SendResult + Send + Sync + 'static,
) -> Result<u64, FlowError> {
    let id = src
        .emitter
        .link(Edge::join(description, Terminal::new("bridge", callback)))?;
    let down = dst.receiver.clone();
    src.emitter.on_closed(Box::new(move || {
        down.close();
    }));
    let up = src.receiver.clone();
    dst.receiver.on_closed(Box::new(move || {
        up.close();
    }));
    Ok(id)
}

fn propagator_of<T: Message, B: Message>(ch: &Channel<T, B>) -> Arc<dyn Propagator<T>> {
    ch.receiver.clone()
}

/// One-shot read options: predicate gating, timeout, and value translations
/// for the non-arrival outcomes.
pub struct ReadOptions<T: Message> {
    predicate: Option<(Predicate<T>, T)>,
    timeout: Option<Duration>,
    on_timeout: Option<T>,
    on_drained: Option<T>,
    result: Option<ResultChannel<T>>,
}

impl<T: Message> Default for ReadOptions<T> {
    fn default() -> Self {
        ReadOptions {
            predicate: None,
            timeout: None,
            on_timeout: None,
            on_drained: None,
            result: None,
        }
    }
}

impl<T: Message> ReadOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate on `p`; a non-matching head message resolves the read with
    /// `on_false` and stays in the queue.
    pub fn predicate(mut self, p: impl Fn(&T) -> bool + Send + Sync + 'static, on_false: T) -> Self {
        self.predicate = Some((Arc::new(p), on_false));
        self
    }

    pub fn timeout(mut self, d: Duration) -> Self {
        self.timeout = Some(d);
        self
    }

    /// Resolve with this value instead of a `Timeout` error.
    pub fn on_timeout(mut self, v: T) -> Self {
        self.on_timeout = Some(v);
        self
    }

    /// Resolve with this value instead of a `Drained` error.
    pub fn on_drained(mut self, v: T) -> Self {
        self.on_drained = Some(v);
        self
    }

    /// Complete this pre-registered channel instead of a fresh one.
    pub fn result(mut self, rc: ResultChannel<T>) -> Self {
        self.result = Some(rc);
        self
    }
}

impl<In: Message, Out: Message> Channel<In, Out> {
    pub(crate) fn from_node(node: Arc<Node<In, Out>>) -> Channel<In, Out> {
        Channel {
            receiver: node.clone(),
            emitter: node,
        }
    }

    /// Assemble a channel from explicit graph parts.
    pub fn from_parts(
        receiver: Arc<dyn Propagator<In>>,
        emitter: Arc<dyn Emitter<Out>>,
    ) -> Channel<In, Out> {
        Channel { receiver, emitter }
    }

    /// Feed a message into the receiver node. The result carries the
    /// aggregate downstream completion (back-pressure).
    pub fn enqueue(&self, msg: In) -> SendResult {
        self.receiver.propagate(msg, Release::none())
    }

    /// One-shot read of the next message.
    pub fn read(&self) -> ResultChannel<Out> {
        self.emitter.receive(Consumer::simple())
    }

    /// One-shot read honouring [`ReadOptions`].
    pub fn read_with(&self, opts: ReadOptions<Out>) -> ResultChannel<Out> {
        let translate = opts.on_timeout.is_some() || opts.on_drained.is_some();
        let outer = opts.result.unwrap_or_default();
        let inner = if translate {
            ResultChannel::new()
        } else {
            outer.clone()
        };

        let consumer = match opts.predicate {
            Some((p, on_false)) => {
                Consumer::predicated(inner.clone(), move |m: &Out| p(m), on_false)
            }
            None => Consumer::with_result(inner.clone()),
        };
        self.emitter.receive(consumer);

        if let Some(d) = opts.timeout {
            let target = inner.clone();
            let emitter = self.emitter.clone();
            Context::current().timer().schedule_once(d, move || {
                // arrival vs timeout: whoever claims first wins
                if target.claim() {
                    target.fail_claimed(FlowError::Timeout);
                    emitter.cancel_receive(&target);
                }
            });
        }

        if translate {
            let done = outer.clone();
            inner.on_success(move |v| {
                let _ = done.succeed(v);
            });
            let done = outer.clone();
            let on_timeout = opts.on_timeout;
            let on_drained = opts.on_drained;
            inner.on_error(move |e| {
                let translated = match &e {
                    FlowError::Timeout => on_timeout.clone(),
                    FlowError::Drained => on_drained.clone(),
                    _ => None,
                };
                match translated {
                    Some(v) => {
                        let _ = done.succeed(v);
                    }
                    None => {
                        let _ = done.fail(e);
                    }
                }
            });
        }
        outer
    }

    /// Cancel a pending [`read`](Self::read). Idempotent; a read that
    /// already matched keeps its message.
    pub fn cancel_read(&self, rc: &ResultChannel<Out>) -> bool {
        self.emitter.cancel_receive(rc)
    }

    /// Subscribe `f` to every subsequent message. The subscription closes
    /// with the channel.
    pub fn receive_all(
        &self,
        f: impl Fn(Out) + Send + Sync + 'static,
    ) -> Result<SubscriptionKey, FlowError> {
        let label = Label::derived("receive-all", self.emitter.label());
        let id = self
            .emitter
            .link(Edge::standard(label.clone(), Terminal::consuming(label, f)))?;
        let emitter = self.emitter.clone();
        self.emitter
            .register_cancellation(id, Box::new(move || {
                emitter.unlink(id);
            }));
        Ok(SubscriptionKey(id))
    }

    /// Unsubscribe a [`receive_all`](Self::receive_all) registration.
    pub fn unsubscribe(&self, key: SubscriptionKey) -> bool {
        self.emitter.cancel(key.0)
    }

    /// New channel whose node applies `f` to every message.
    pub fn map<U: Message>(
        &self,
        f: impl Fn(Out) -> U + Send + Sync + 'static,
    ) -> Channel<Out, U> {
        let label = Label::derived("map", self.emitter.label());
        let node: Arc<Node<Out, U>> = Node::new(
            &ChannelOptions::described(label.clone()),
            Box::new(move |m| Ok(Some(f(m)))),
        );
        self.attach(Edge::standard(label, node.clone()));
        Channel::from_node(node)
    }

    /// New channel passing only messages matching `p`.
    pub fn filter(&self, p: impl Fn(&Out) -> bool + Send + Sync + 'static) -> Channel<Out, Out> {
        let label = Label::derived("filter", self.emitter.label());
        let node: Arc<Node<Out, Out>> = Node::new(
            &ChannelOptions::described(label.clone()),
            Box::new(move |m| Ok(p(&m).then_some(m))),
        );
        self.attach(Edge::standard(label, node.clone()));
        Channel::from_node(node)
    }

    /// Complement of [`filter`](Self::filter).
    pub fn remove(&self, p: impl Fn(&Out) -> bool + Send + Sync + 'static) -> Channel<Out, Out> {
        self.filter(move |m| !p(m))
    }

    /// Downstream copy. Closing the fork leaves the source open; closing or
    /// erroring the source reaches the fork.
    pub fn fork(&self) -> Channel<Out, Out> {
        let label = Label::derived("fork", self.emitter.label());
        let node = identity_node(&ChannelOptions::described(label.clone()), []);
        self.attach(Edge::fork(label, node.clone()));
        Channel::from_node(node)
    }

    /// Observation copy: no back-pressure, no upstream coupling.
    pub fn tap(&self) -> Channel<Out, Out> {
        let label = Label::derived("tap", self.emitter.label());
        let node = identity_node(&ChannelOptions::described(label.clone()), []);
        self.attach(Edge::tap(label, node.clone()));
        Channel::from_node(node)
    }

    // Link an edge; a refused link leaves the new node in the refusing
    // node's terminal condition so the derived channel reports it.
    fn attach(&self, edge: Edge<Out>) {
        let target = edge.target().clone();
        match self.emitter.link(edge) {
            Ok(_) => {}
            Err(FlowError::AlreadyClosed) | Err(FlowError::Drained) => {
                target.close_force();
            }
            Err(e) => target.fail(e),
        }
    }

    /// Attach a discarding sink so unconsumed messages stop buffering.
    pub fn ground(&self) -> Result<u64, FlowError> {
        let label = Label::derived("ground", self.emitter.label());
        self.emitter
            .link(Edge::standard(label.clone(), Terminal::discarding(label)))
    }

    /// Empty channel with the same transactional-ness and description.
    pub fn mimic(&self) -> Channel<Out, Out> {
        let options = ChannelOptions {
            description: Some(self.emitter.label().clone()),
            transactional: self.emitter.is_transactional(),
            ..Default::default()
        };
        channel_with(&options, [])
    }

    pub fn close(&self) -> bool {
        self.receiver.close()
    }

    pub fn close_force(&self) -> bool {
        self.receiver.close_force()
    }

    pub fn fail(&self, error: FlowError) {
        self.receiver.fail(error);
    }

    pub fn is_closed(&self) -> bool {
        self.receiver.is_closed()
    }

    pub fn is_drained(&self) -> bool {
        self.emitter.is_drained()
    }

    pub fn state(&self) -> NodeState {
        self.emitter.state()
    }

    pub fn on_closed(&self, f: impl FnOnce() + Send + Sync + 'static) {
        Emitter::on_closed(&*self.emitter, Box::new(f));
    }

    pub fn on_drained(&self, f: impl FnOnce() + Send + Sync + 'static) {
        self.emitter.on_drained(Box::new(f));
    }

    /// Pop everything currently buffered.
    pub fn drain_available(&self) -> Vec<Out> {
        self.emitter.drain()
    }

    /// Blocking iterator over the stream; ends at drain.
    pub fn iter(&self) -> ChannelIter<Out> {
        ChannelIter {
            emitter: self.emitter.clone(),
            timeout: None,
        }
    }

    /// Blocking iterator that also ends after `timeout` of silence.
    pub fn iter_timeout(&self, timeout: Duration) -> ChannelIter<Out> {
        ChannelIter {
            emitter: self.emitter.clone(),
            timeout: Some(timeout),
        }
    }

    pub fn label(&self) -> &Label {
        self.emitter.label()
    }

    /// Graph-level receiver view, for advanced wiring.
    pub fn receiver_node(&self) -> Arc<dyn Propagator<In>> {
        self.receiver.clone()
    }

    /// Graph-level emitter view, for advanced wiring.
    pub fn emitter_node(&self) -> Arc<dyn Emitter<Out>> {
        self.emitter.clone()
    }
}

impl<In: Message, Out: Message> fmt::Debug for Channel<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("label", self.emitter.label())
            .field("state", &self.emitter.state())
            .finish()
    }
}

/// Blocking lazy-sequence bridge: pulls one message at a time through a
/// synchronous wait.
pub struct ChannelIter<T: Message> {
    emitter: Arc<dyn Emitter<T>>,
    timeout: Option<Duration>,
}

impl<T: Message> Iterator for ChannelIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let rc = self.emitter.receive(Consumer::simple());
        match rc.wait(self.timeout) {
            Ok(v) => Some(v),
            Err(FlowError::Timeout) => {
                self.emitter.cancel_receive(&rc);
                None
            }
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests;
