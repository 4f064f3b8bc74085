use super::{LifecycleFn, Propagator, run_callback};
use crate::error::FlowError;
use crate::message::Message;
use crate::queue::Release;
use crate::result::{SendOutcome, SendResult};
use crate::utils::Label;
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

type TerminalFn<T> = Box<dyn Fn(T) -> SendResult + Send + Sync>;

/// Callback-driven sink at the end of an edge. Its send-result is the
/// callback's, so a deferred-returning callback back-pressures the
/// producer.
pub struct Terminal<T: Message> {
    label: Label,
    closed: AtomicBool,
    on_closed: Mutex<Vec<LifecycleFn>>,
    callback: TerminalFn<T>,
}

impl<T: Message> Terminal<T> {
    pub fn new(
        label: impl Into<Label>,
        callback: impl Fn(T) -> SendResult + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Terminal {
            label: label.into(),
            closed: AtomicBool::new(false),
            on_closed: Mutex::new(Vec::new()),
            callback: Box::new(callback),
        })
    }

    /// Sink that invokes `f` and reports the message consumed.
    pub fn consuming(label: impl Into<Label>, f: impl Fn(T) + Send + Sync + 'static) -> Arc<Self> {
        Self::new(label, move |msg| {
            f(msg);
            SendResult::Done(SendOutcome::Consumed)
        })
    }

    /// Sink that swallows messages so they do not accumulate upstream.
    pub fn discarding(label: impl Into<Label>) -> Arc<Self> {
        Self::new(label, |_msg| SendResult::Done(SendOutcome::Discarded))
    }

    fn shut(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return true;
        }
        for f in self.on_closed.lock().drain(..) {
            run_callback(f);
        }
        true
    }
}

impl<T: Message> Propagator<T> for Terminal<T> {
    fn propagate(&self, msg: T, upstream: Release<'_>) -> SendResult {
        // the callback runs inside the upstream ordering section (released on
        // return), so per-edge FIFO extends to the callback itself; a
        // callback must not enqueue back into its own source
        let _section = upstream;
        if self.closed.load(Ordering::Acquire) {
            return SendResult::Done(SendOutcome::Closed);
        }
        match catch_unwind(AssertUnwindSafe(|| (self.callback)(msg))) {
            Ok(result) => result,
            Err(p) => SendResult::Fail(FlowError::from_panic(p)),
        }
    }

    fn close(&self) -> bool {
        self.shut()
    }

    fn close_force(&self) -> bool {
        self.shut()
    }

    fn fail(&self, _error: FlowError) {
        self.shut();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn on_closed(&self, f: LifecycleFn) {
        if self.is_closed() {
            run_callback(f);
            return;
        }
        let mut hooks = self.on_closed.lock();
        if self.is_closed() {
            drop(hooks);
            run_callback(f);
        } else {
            hooks.push(f);
        }
    }

    fn label(&self) -> &Label {
        &self.label
    }
}
