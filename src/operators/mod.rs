use crate::channel::{Channel, channel_with};
use crate::config::ChannelOptions;
use crate::error::FlowError;
use crate::graph::{Edge, Emitter, NodeState, UnconsumeFn, identity_node};
use crate::message::Message;
use crate::queue::Consumer;
use crate::result::{ResultChannel, SendOutcome, SendResult};
use crate::time::Context;
use crate::utils::Label;
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// What a driver step asks for next.
pub enum DriverCmd {
    /// Read the next message now.
    Continue,
    /// Read the next message only once this deferred settles.
    Wait(ResultChannel<SendOutcome>),
    /// Release the source and finish.
    Stop,
    /// Finish with an error.
    Fail(FlowError),
}

/// Why a driver finished.
pub enum DriverExit {
    /// The source drained.
    Drained,
    /// A step asked to stop.
    Stopped,
    Failed(FlowError),
}

struct DriverBody<S: Message, St: Send + 'static> {
    state: St,
    step: Box<dyn FnMut(&mut St, S) -> DriverCmd + Send>,
    done: Box<dyn FnOnce(St, DriverExit) + Send>,
    unconsume: Option<UnconsumeFn>,
    completion: ResultChannel<SendOutcome>,
}

/// The shared read loop behind every streaming operator: a temporary
/// consumption of the source into a private relay, pulled one message at a
/// time. The step callback never overlaps itself, and a `Wait` command
/// defers the next read until the step's deferred resolves.
struct Driver<S: Message, St: Send + 'static> {
    source: Arc<dyn Emitter<S>>,
    inner: Mutex<Option<DriverBody<S, St>>>,
}

/// Drive `step` over `src` in strict order. Returns a deferred resolving
/// when the drive finishes (source drained, stopped, or failed).
///
/// An open source is consumed exclusively (a second operator on the same
/// channel gets `AlreadyConsumed`); a closed source has its backlog read
/// directly.
pub fn bridge_in_order<A: Message, S: Message, St: Send + 'static>(
    src: &Channel<A, S>,
    description: impl Into<Label>,
    state: St,
    step: impl FnMut(&mut St, S) -> DriverCmd + Send + 'static,
    done: impl FnOnce(St, DriverExit) + Send + 'static,
) -> Result<ResultChannel<SendOutcome>, FlowError> {
    let label: Label = description.into();
    let emitter = src.emitter_node();
    let (source, unconsume): (Arc<dyn Emitter<S>>, Option<UnconsumeFn>) = match emitter.state() {
        NodeState::Closed | NodeState::Drained => (emitter, None),
        NodeState::Error(e) => return Err(e),
        _ => {
            let relay = identity_node::<S>(&ChannelOptions::described(label.clone()), []);
            let thunk = emitter.consume(Edge::standard(label, relay.clone()))?;
            (relay as Arc<dyn Emitter<S>>, Some(thunk))
        }
    };

    let completion = ResultChannel::new();
    let driver = Arc::new(Driver {
        source,
        inner: Mutex::new(Some(DriverBody {
            state,
            step: Box::new(step),
            done: Box::new(done),
            unconsume,
            completion: completion.clone(),
        })),
    });
    pump(&driver);
    Ok(completion)
}

fn pump<S: Message, St: Send + 'static>(driver: &Arc<Driver<S, St>>) {
    loop {
        if driver.inner.lock().is_none() {
            return;
        }
        let rc = driver.source.receive(Consumer::simple());
        match rc.try_get() {
            Some(Ok(msg)) => {
                if !feed(driver, msg) {
                    return;
                }
            }
            Some(Err(e)) => {
                finish(driver, exit_of(e));
                return;
            }
            None => {
                let d = driver.clone();
                rc.on_success(move |msg| {
                    if feed(&d, msg) {
                        pump(&d);
                    }
                });
                let d = driver.clone();
                rc.on_error(move |e| finish(&d, exit_of(e)));
                return;
            }
        }
    }
}

fn exit_of(e: FlowError) -> DriverExit {
    match e {
        FlowError::Drained => DriverExit::Drained,
        other => DriverExit::Failed(other),
    }
}

// One step. Returns whether the caller should issue the next read now.
fn feed<S: Message, St: Send + 'static>(driver: &Arc<Driver<S, St>>, msg: S) -> bool {
    let stepped = {
        let mut guard = driver.inner.lock();
        let Some(body) = guard.as_mut() else {
            return false;
        };
        // the step runs under the driver lock: invocations never overlap
        catch_unwind(AssertUnwindSafe(|| (body.step)(&mut body.state, msg)))
    };
    match stepped {
        Ok(DriverCmd::Continue) => true,
        Ok(DriverCmd::Stop) => {
            finish(driver, DriverExit::Stopped);
            false
        }
        Ok(DriverCmd::Fail(e)) => {
            finish(driver, DriverExit::Failed(e));
            false
        }
        Ok(DriverCmd::Wait(rc)) => {
            if rc.try_get().is_some() {
                return true;
            }
            let d = driver.clone();
            rc.on_success(move |_| pump(&d));
            let d = driver.clone();
            rc.on_error(move |e| finish(&d, DriverExit::Failed(e)));
            false
        }
        Err(p) => {
            finish(driver, DriverExit::Failed(FlowError::from_panic(p)));
            false
        }
    }
}

fn finish<S: Message, St: Send + 'static>(driver: &Arc<Driver<S, St>>, exit: DriverExit) {
    let Some(body) = driver.inner.lock().take() else {
        return;
    };
    if let Some(thunk) = body.unconsume {
        thunk();
    }
    let completion = body.completion;
    let failure = match &exit {
        DriverExit::Failed(e) => Some(e.clone()),
        _ => None,
    };
    (body.done)(body.state, exit);
    match failure {
        Some(e) => {
            let _ = completion.fail(e);
        }
        None => {
            let _ = completion.succeed(SendOutcome::Consumed);
        }
    }
}

/// Invoke `f` for every message, strictly serialised: when `f` returns a
/// deferred send-result, the next message is read only after it resolves.
/// The returned deferred resolves when the source drains.
pub fn receive_in_order<A: Message, T: Message>(
    src: &Channel<A, T>,
    mut f: impl FnMut(T) -> SendResult + Send + 'static,
) -> Result<ResultChannel<SendOutcome>, FlowError> {
    bridge_in_order(
        src,
        Label::derived("receive-in-order", src.label()),
        (),
        move |_, m| match f(m) {
            SendResult::Done(_) => DriverCmd::Continue,
            SendResult::Deferred(rc) => DriverCmd::Wait(rc),
            SendResult::Fail(e) => DriverCmd::Fail(e),
        },
        |_, _| {},
    )
}

/// Relay that re-emits the source strictly serially, deferring each read
/// until the downstream acknowledged the previous message.
pub fn emit_in_order<A: Message, T: Message>(src: &Channel<A, T>) -> Channel<T, T> {
    let out = src.mimic();
    let sink = out.clone();
    let closer = out.clone();
    let drive = bridge_in_order(
        src,
        Label::derived("emit-in-order", src.label()),
        (),
        move |_, m| match sink.enqueue(m) {
            SendResult::Done(_) => DriverCmd::Continue,
            SendResult::Deferred(rc) => DriverCmd::Wait(rc),
            SendResult::Fail(e) => DriverCmd::Fail(e),
        },
        move |_, exit| match exit {
            DriverExit::Failed(e) => closer.fail(e),
            _ => {
                closer.close_force();
            }
        },
    );
    if let Err(e) = drive {
        out.fail(e);
    }
    out
}

/// Pass along the first `n` messages, then close the output and release the
/// source.
pub fn take<A: Message, T: Message>(src: &Channel<A, T>, n: usize) -> Channel<T, T> {
    let out = src.mimic();
    if n == 0 {
        out.close_force();
        return out;
    }
    let sink = out.clone();
    let closer = out.clone();
    let drive = bridge_in_order(
        src,
        Label::derived("take", src.label()),
        n,
        move |left, m| {
            sink.enqueue(m);
            *left -= 1;
            if *left == 0 {
                DriverCmd::Stop
            } else {
                DriverCmd::Continue
            }
        },
        move |_, exit| settle_out(&closer, exit),
    );
    if let Err(e) = drive {
        out.fail(e);
    }
    out
}

/// Pass messages while `p` holds, then close.
pub fn take_while<A: Message, T: Message>(
    src: &Channel<A, T>,
    p: impl Fn(&T) -> bool + Send + 'static,
) -> Channel<T, T> {
    let out = src.mimic();
    let sink = out.clone();
    let closer = out.clone();
    let drive = bridge_in_order(
        src,
        Label::derived("take-while", src.label()),
        (),
        move |_, m| {
            if p(&m) {
                sink.enqueue(m);
                DriverCmd::Continue
            } else {
                DriverCmd::Stop
            }
        },
        move |_, exit| settle_out(&closer, exit),
    );
    if let Err(e) = drive {
        out.fail(e);
    }
    out
}

/// Running reduction seeded by the first message; every accumulation is
/// emitted, the seed included.
pub fn reductions<A: Message, T: Message>(
    src: &Channel<A, T>,
    f: impl Fn(T, T) -> T + Send + 'static,
) -> Channel<T, T> {
    let out = src.mimic();
    let sink = out.clone();
    let closer = out.clone();
    let drive = bridge_in_order(
        src,
        Label::derived("reductions", src.label()),
        None::<T>,
        move |acc, m| {
            let next = match acc.take() {
                None => m,
                Some(prev) => f(prev, m),
            };
            *acc = Some(next.clone());
            sink.enqueue(next);
            DriverCmd::Continue
        },
        move |_, exit| settle_out(&closer, exit),
    );
    if let Err(e) = drive {
        out.fail(e);
    }
    out
}

/// Running reduction from an explicit seed, which is emitted up front.
pub fn reductions_with<A: Message, T: Message, U: Message>(
    src: &Channel<A, T>,
    init: U,
    f: impl Fn(U, T) -> U + Send + 'static,
) -> Channel<U, U> {
    let out: Channel<U, U> = channel_with(
        &ChannelOptions::described(Label::derived("reductions", src.label())),
        [],
    );
    out.enqueue(init.clone());
    let sink = out.clone();
    let closer = out.clone();
    let drive = bridge_in_order(
        src,
        Label::derived("reductions", src.label()),
        init,
        move |acc, m| {
            let next = f(acc.clone(), m);
            *acc = next.clone();
            sink.enqueue(next);
            DriverCmd::Continue
        },
        move |_, exit| settle_out(&closer, exit),
    );
    if let Err(e) = drive {
        out.fail(e);
    }
    out
}

/// Fold the stream; resolves at drain. An empty stream resolves as
/// `Drained`.
pub fn reduce<A: Message, T: Message>(
    src: &Channel<A, T>,
    f: impl Fn(T, T) -> T + Send + 'static,
) -> ResultChannel<T> {
    let result = ResultChannel::new();
    let settled = result.clone();
    let drive = bridge_in_order(
        src,
        Label::derived("reduce", src.label()),
        None::<T>,
        move |acc, m| {
            *acc = Some(match acc.take() {
                None => m,
                Some(prev) => f(prev, m),
            });
            DriverCmd::Continue
        },
        move |acc, exit| settle_fold(&settled, acc, exit),
    );
    if let Err(e) = drive {
        let _ = result.fail(e);
    }
    result
}

/// Fold the stream from an explicit seed.
pub fn reduce_with<A: Message, T: Message, U: Message>(
    src: &Channel<A, T>,
    init: U,
    f: impl Fn(U, T) -> U + Send + 'static,
) -> ResultChannel<U> {
    let result = ResultChannel::new();
    let settled = result.clone();
    let drive = bridge_in_order(
        src,
        Label::derived("reduce", src.label()),
        init,
        move |acc, m| {
            *acc = f(acc.clone(), m);
            DriverCmd::Continue
        },
        move |acc, exit| settle_fold(&settled, Some(acc), exit),
    );
    if let Err(e) = drive {
        let _ = result.fail(e);
    }
    result
}

/// The final message of the stream; resolves at drain.
pub fn last<A: Message, T: Message>(src: &Channel<A, T>) -> ResultChannel<T> {
    reduce(src, |_, m| m)
}

/// Group into exact windows of `n`; a trailing partial window is dropped.
pub fn partition<A: Message, T: Message>(src: &Channel<A, T>, n: usize) -> Channel<Vec<T>> {
    partition_inner(src, n, false)
}

/// Group into windows of `n`, emitting the trailing partial window at
/// drain.
pub fn partition_all<A: Message, T: Message>(src: &Channel<A, T>, n: usize) -> Channel<Vec<T>> {
    partition_inner(src, n, true)
}

fn partition_inner<A: Message, T: Message>(
    src: &Channel<A, T>,
    n: usize,
    keep_partial: bool,
) -> Channel<Vec<T>> {
    let out: Channel<Vec<T>> = channel_with(
        &ChannelOptions::described(Label::derived("partition", src.label())),
        [],
    );
    let n = n.max(1);
    let sink = out.clone();
    let closer = out.clone();
    let drive = bridge_in_order(
        src,
        Label::derived("partition", src.label()),
        Vec::with_capacity(n),
        move |buf: &mut Vec<T>, m| {
            buf.push(m);
            if buf.len() == n {
                sink.enqueue(std::mem::take(buf));
            }
            DriverCmd::Continue
        },
        move |buf, exit| {
            if keep_partial && !buf.is_empty() {
                closer.enqueue(buf);
            }
            settle_out(&closer, exit);
        },
    );
    if let Err(e) = drive {
        out.fail(e);
    }
    out
}

/// Flatten a stream of batches.
pub fn concat<A: Message, T: Message>(src: &Channel<A, Vec<T>>) -> Channel<T> {
    mapcat(src, |batch| batch)
}

/// Map each message to a batch and flatten.
pub fn mapcat<A: Message, T: Message, U: Message>(
    src: &Channel<A, T>,
    f: impl Fn(T) -> Vec<U> + Send + 'static,
) -> Channel<U> {
    let out: Channel<U> = channel_with(
        &ChannelOptions::described(Label::derived("mapcat", src.label())),
        [],
    );
    let sink = out.clone();
    let closer = out.clone();
    let drive = bridge_in_order(
        src,
        Label::derived("mapcat", src.label()),
        (),
        move |_, m| {
            for item in f(m) {
                sink.enqueue(item);
            }
            DriverCmd::Continue
        },
        move |_, exit| settle_out(&closer, exit),
    );
    if let Err(e) = drive {
        out.fail(e);
    }
    out
}

fn settle_out<In: Message, Out: Message>(out: &Channel<In, Out>, exit: DriverExit) {
    match exit {
        DriverExit::Failed(e) => out.fail(e),
        _ => {
            out.close_force();
        }
    }
}

fn settle_fold<T: Message>(result: &ResultChannel<T>, acc: Option<T>, exit: DriverExit) {
    match exit {
        DriverExit::Failed(e) => {
            let _ = result.fail(e);
        }
        _ => match acc {
            Some(v) => {
                let _ = result.succeed(v);
            }
            None => {
                let _ = result.fail(FlowError::Drained);
            }
        },
    }
}

/// Emit `f()` every `period` until the output channel closes.
pub fn periodically<T: Message>(period: Duration, f: impl Fn() -> T + Send + 'static) -> Channel<T> {
    let out: Channel<T> = channel_with(&ChannelOptions::described("periodically"), []);
    let sink = out.clone();
    Context::current().timer().schedule_periodic(period, move || {
        if sink.is_closed() {
            return false;
        }
        sink.enqueue(f());
        true
    });
    out
}

/// Emit the latest-seen message on a periodic schedule, skipping periods
/// before the first message arrives. Closes with the source.
pub fn sample_every<A: Message, T: Message>(
    src: &Channel<A, T>,
    period: Duration,
) -> Channel<T, T> {
    let out = src.mimic();
    let latest: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));

    let slot = latest.clone();
    if src.receive_all(move |m| *slot.lock() = Some(m)).is_err() {
        out.close_force();
        return out;
    }
    let closer = out.clone();
    src.on_closed(move || {
        closer.close_force();
    });

    let sink = out.clone();
    Context::current().timer().schedule_periodic(period, move || {
        if sink.is_closed() {
            return false;
        }
        let sample = latest.lock().clone();
        if let Some(v) = sample {
            sink.enqueue(v);
        }
        true
    });
    out
}

/// Buffer everything arriving in each period and emit it as a batch; an
/// empty period emits an empty batch. The final partial batch is emitted at
/// source close.
pub fn partition_every<A: Message, T: Message>(
    src: &Channel<A, T>,
    period: Duration,
) -> Channel<Vec<T>> {
    let out: Channel<Vec<T>> = channel_with(
        &ChannelOptions::described(Label::derived("partition-every", src.label())),
        [],
    );
    let buffer: Arc<Mutex<Vec<T>>> = Arc::new(Mutex::new(Vec::new()));

    let buf = buffer.clone();
    if src.receive_all(move |m| buf.lock().push(m)).is_err() {
        out.close_force();
        return out;
    }
    let closer = out.clone();
    let buf = buffer.clone();
    src.on_closed(move || {
        let remainder = std::mem::take(&mut *buf.lock());
        if !remainder.is_empty() {
            closer.enqueue(remainder);
        }
        closer.close_force();
    });

    let sink = out.clone();
    Context::current().timer().schedule_periodic(period, move || {
        if sink.is_closed() {
            return false;
        }
        sink.enqueue(std::mem::take(&mut *buffer.lock()));
        true
    });
    out
}

/// Emit `f` over the latest value of every input whenever any of them
/// updates, once all inputs have produced at least one message. Closes when
/// every input has closed.
pub fn combine_latest<A: Message, T: Message, U: Message>(
    f: impl Fn(&[T]) -> U + Send + Sync + 'static,
    inputs: &[Channel<A, T>],
) -> Channel<U> {
    let out: Channel<U> = channel_with(&ChannelOptions::described("combine-latest"), []);
    let n = inputs.len();
    if n == 0 {
        out.close_force();
        return out;
    }
    let slots: Arc<Mutex<Vec<Option<T>>>> = Arc::new(Mutex::new(vec![None; n]));
    let closed = Arc::new(AtomicUsize::new(0));
    let f = Arc::new(f);

    for (i, input) in inputs.iter().enumerate() {
        let slots = slots.clone();
        let sink = out.clone();
        let f = f.clone();
        let _ = input.receive_all(move |m| {
            let snapshot = {
                let mut s = slots.lock();
                s[i] = Some(m);
                if s.iter().all(Option::is_some) {
                    Some(s.iter().filter_map(Clone::clone).collect::<Vec<T>>())
                } else {
                    None
                }
            };
            if let Some(values) = snapshot {
                sink.enqueue(f(&values));
            }
        });

        let closed = closed.clone();
        let sink = out.clone();
        input.on_closed(move || {
            if closed.fetch_add(1, Ordering::AcqRel) + 1 == n {
                sink.close_force();
            }
        });
    }
    out
}
