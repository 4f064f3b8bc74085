use crate::error::FlowError;
use crate::message::Message;
use crate::time::Context;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

type SuccessFn<T> = Box<dyn FnOnce(T) + Send>;
type ErrorFn = Box<dyn FnOnce(FlowError) + Send>;

/// Handle for cancelling a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerKey(u64);

struct Waiting<T> {
    claimed: bool,
    next_key: u64,
    on_success: Vec<(ListenerKey, SuccessFn<T>)>,
    on_error: Vec<(ListenerKey, ErrorFn)>,
}

enum Inner<T> {
    Pending(Waiting<T>),
    Success(T),
    Error(FlowError),
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    realized: Condvar,
}

/// Single-assignment deferred value.
///
/// Exactly one terminal transition: pending to success or error. `claim`
/// reserves the right to complete; the arrival-vs-timeout race is decided by
/// whoever claims first. Listeners registered before completion run in
/// registration order at completion time, on the completing thread;
/// listeners registered after completion run immediately on the registering
/// thread. Listeners always run outside the internal lock.
pub struct ResultChannel<T: Message> {
    shared: Arc<Shared<T>>,
}

impl<T: Message> Clone for ResultChannel<T> {
    fn clone(&self) -> Self {
        ResultChannel {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Message> ResultChannel<T> {
    pub fn new() -> Self {
        ResultChannel {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::Pending(Waiting {
                    claimed: false,
                    next_key: 0,
                    on_success: Vec::new(),
                    on_error: Vec::new(),
                })),
                realized: Condvar::new(),
            }),
        }
    }

    /// Already-successful channel.
    pub fn success(value: T) -> Self {
        ResultChannel {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::Success(value)),
                realized: Condvar::new(),
            }),
        }
    }

    /// Already-errored channel.
    pub fn error(error: FlowError) -> Self {
        ResultChannel {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::Error(error)),
                realized: Condvar::new(),
            }),
        }
    }

    /// Reserve the right to complete this channel. Fails if the channel is
    /// already claimed or realized.
    pub fn claim(&self) -> bool {
        let mut inner = self.shared.inner.lock();
        match &mut *inner {
            Inner::Pending(w) if !w.claimed => {
                w.claimed = true;
                true
            }
            _ => false,
        }
    }

    /// Claim-then-complete. Fails against a channel someone else has claimed.
    pub fn succeed(&self, value: T) -> bool {
        self.complete(Ok(value), true)
    }

    /// Claim-then-fail. Fails against a channel someone else has claimed.
    pub fn fail(&self, error: FlowError) -> bool {
        self.complete(Err(error), true)
    }

    /// Complete a channel whose claim the caller holds.
    pub fn succeed_claimed(&self, value: T) -> bool {
        self.complete(Ok(value), false)
    }

    /// Fail a channel whose claim the caller holds.
    pub fn fail_claimed(&self, error: FlowError) -> bool {
        self.complete(Err(error), false)
    }

    fn complete(&self, value: Result<T, FlowError>, only_unclaimed: bool) -> bool {
        let fired = {
            let mut inner = self.shared.inner.lock();
            let waiting = match &mut *inner {
                Inner::Pending(w) => {
                    if only_unclaimed && w.claimed {
                        return false;
                    }
                    std::mem::replace(
                        w,
                        Waiting {
                            claimed: true,
                            next_key: 0,
                            on_success: Vec::new(),
                            on_error: Vec::new(),
                        },
                    )
                }
                _ => return false,
            };
            *inner = match value.clone() {
                Ok(v) => Inner::Success(v),
                Err(e) => Inner::Error(e),
            };
            self.shared.realized.notify_all();
            waiting
        };

        match value {
            Ok(v) => {
                let mut fns = fired.on_success;
                if let Some((_, last)) = fns.pop() {
                    for (_, f) in fns {
                        f(v.clone());
                    }
                    last(v);
                }
            }
            Err(e) => {
                for (_, f) in fired.on_error {
                    f(e.clone());
                }
            }
        }
        true
    }

    /// Register a success listener. Runs immediately if already successful.
    pub fn on_success(&self, f: impl FnOnce(T) + Send + 'static) -> ListenerKey {
        let immediate = {
            let mut inner = self.shared.inner.lock();
            match &mut *inner {
                Inner::Pending(w) => {
                    let key = ListenerKey(w.next_key);
                    w.next_key += 1;
                    w.on_success.push((key, Box::new(f)));
                    return key;
                }
                Inner::Success(v) => Some(v.clone()),
                Inner::Error(_) => None,
            }
        };
        if let Some(v) = immediate {
            f(v);
        }
        ListenerKey(u64::MAX)
    }

    /// Register an error listener. Runs immediately if already errored.
    pub fn on_error(&self, f: impl FnOnce(FlowError) + Send + 'static) -> ListenerKey {
        let immediate = {
            let mut inner = self.shared.inner.lock();
            match &mut *inner {
                Inner::Pending(w) => {
                    let key = ListenerKey(w.next_key);
                    w.next_key += 1;
                    w.on_error.push((key, Box::new(f)));
                    return key;
                }
                Inner::Error(e) => Some(e.clone()),
                Inner::Success(_) => None,
            }
        };
        if let Some(e) = immediate {
            f(e);
        }
        ListenerKey(u64::MAX)
    }

    /// Remove a listener registered while pending. Idempotent.
    pub fn cancel_listener(&self, key: ListenerKey) -> bool {
        let mut inner = self.shared.inner.lock();
        match &mut *inner {
            Inner::Pending(w) => {
                let before = w.on_success.len() + w.on_error.len();
                w.on_success.retain(|(k, _)| *k != key);
                w.on_error.retain(|(k, _)| *k != key);
                before != w.on_success.len() + w.on_error.len()
            }
            _ => false,
        }
    }

    /// Terminal value, if any.
    pub fn try_get(&self) -> Option<Result<T, FlowError>> {
        let inner = self.shared.inner.lock();
        match &*inner {
            Inner::Pending(_) => None,
            Inner::Success(v) => Some(Ok(v.clone())),
            Inner::Error(e) => Some(Err(e.clone())),
        }
    }

    /// The success value, or `default` when pending or errored.
    pub fn success_value(&self, default: T) -> T {
        match self.try_get() {
            Some(Ok(v)) => v,
            _ => default,
        }
    }

    /// The error, if the channel is errored.
    pub fn error_value(&self) -> Option<FlowError> {
        match self.try_get() {
            Some(Err(e)) => Some(e),
            _ => None,
        }
    }

    pub fn is_realized(&self) -> bool {
        !matches!(&*self.shared.inner.lock(), Inner::Pending(_))
    }

    pub fn is_claimed(&self) -> bool {
        match &*self.shared.inner.lock() {
            Inner::Pending(w) => w.claimed,
            _ => true,
        }
    }

    /// Block until realized. `timeout` of `None` waits indefinitely; on
    /// elapse the channel itself is untouched and `Timeout` is returned.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<T, FlowError> {
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        let mut inner = self.shared.inner.lock();
        loop {
            match &*inner {
                Inner::Success(v) => return Ok(v.clone()),
                Inner::Error(e) => return Err(e.clone()),
                Inner::Pending(_) => {}
            }
            match deadline {
                None => self.shared.realized.wait(&mut inner),
                Some(d) => {
                    if self.shared.realized.wait_until(&mut inner, d).timed_out() {
                        if let Inner::Pending(_) = &*inner {
                            return Err(FlowError::Timeout);
                        }
                    }
                }
            }
        }
    }

    /// Identity comparison; this is how consumers are matched for
    /// cancellation.
    #[inline]
    pub fn same_channel(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl<T: Message> Default for ResultChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Message + fmt::Debug> fmt::Debug for ResultChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.shared.inner.try_lock() {
            None => "locked".to_string(),
            Some(g) => match &*g {
                Inner::Pending(w) if w.claimed => "claimed".to_string(),
                Inner::Pending(_) => "pending".to_string(),
                Inner::Success(v) => format!("success({v:?})"),
                Inner::Error(e) => format!("error({e})"),
            },
        };
        f.debug_struct("ResultChannel").field("state", &state).finish()
    }
}

/// Channel that becomes `success(value)` after `delay`, via the current
/// context's timer.
pub fn timed_result<T: Message>(delay: Duration, value: T) -> ResultChannel<T> {
    let rc = ResultChannel::new();
    let done = rc.clone();
    Context::current().timer().schedule_once(delay, move || {
        let _ = done.succeed(value);
    });
    rc
}

/// Immediate, non-exceptional outcome of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Delivered straight to a waiting consumer.
    Consumed,
    /// Buffered; the producer's deferred resolves at dispatch time.
    Queued,
    /// No consumer, no persistence.
    Discarded,
    /// Fanned out to more than one downstream edge.
    Split,
    /// The target was already closed or drained.
    Closed,
}

/// What a producer gets back from an enqueue or a propagation.
#[derive(Debug)]
pub enum SendResult {
    /// Settled on the spot.
    Done(SendOutcome),
    /// Resolves when all non-tap downstream work has settled.
    Deferred(ResultChannel<SendOutcome>),
    /// Contract violation or terminal failure.
    Fail(FlowError),
}

impl SendResult {
    /// Normalize into a result channel; settled results become pre-completed
    /// channels.
    pub fn into_result(self) -> ResultChannel<SendOutcome> {
        match self {
            SendResult::Done(o) => ResultChannel::success(o),
            SendResult::Deferred(rc) => rc,
            SendResult::Fail(e) => ResultChannel::error(e),
        }
    }

    /// Block on downstream completion (producer-side back-pressure).
    pub fn wait(self, timeout: Option<Duration>) -> Result<SendOutcome, FlowError> {
        match self {
            SendResult::Done(o) => Ok(o),
            SendResult::Deferred(rc) => rc.wait(timeout),
            SendResult::Fail(e) => Err(e),
        }
    }

    #[inline]
    pub fn is_fail(&self) -> bool {
        matches!(self, SendResult::Fail(_))
    }
}

/// Combine per-edge send-results into one aggregate.
///
/// Success iff all settle successfully; the first error wins and later ones
/// are orphans, logged through the throttle; pending otherwise, resolving
/// when the last pending member does.
pub fn merge_send_results(results: Vec<SendResult>) -> SendResult {
    let mut first_fail: Option<FlowError> = None;
    let mut deferred = Vec::new();
    for r in results {
        match r {
            SendResult::Done(_) => {}
            SendResult::Fail(e) => {
                if first_fail.is_none() {
                    first_fail = Some(e);
                } else {
                    crate::utils::logger::orphaned(&e);
                }
            }
            SendResult::Deferred(rc) => deferred.push(rc),
        }
    }

    if deferred.is_empty() {
        return match first_fail {
            Some(e) => SendResult::Fail(e),
            None => SendResult::Done(SendOutcome::Split),
        };
    }

    let aggregate = ResultChannel::<SendOutcome>::new();
    let remaining = Arc::new(AtomicUsize::new(deferred.len()));
    if let Some(e) = first_fail {
        let _ = aggregate.fail(e);
    }
    for rc in deferred {
        let agg = aggregate.clone();
        let left = remaining.clone();
        rc.on_success(move |_| {
            if left.fetch_sub(1, Ordering::AcqRel) == 1 {
                let _ = agg.succeed(SendOutcome::Split);
            }
        });
        let agg = aggregate.clone();
        rc.on_error(move |e| {
            if !agg.fail(e.clone()) {
                crate::utils::logger::orphaned(&e);
            }
        });
    }
    SendResult::Deferred(aggregate)
}
