use arc_swap::ArcSwapOption;
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

enum Task {
    Once(Box<dyn FnOnce() + Send>),
    /// Re-armed every `period` until the closure returns `false`.
    Every {
        period: Duration,
        tick: Box<dyn FnMut() -> bool + Send>,
    },
}

struct Entry {
    at: Instant,
    seq: u64,
    task: Task,
}

// min-heap by (at, seq); seq breaks ties so same-deadline entries fire in
// schedule order
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

struct TimerState {
    entries: BinaryHeap<Entry>,
    next_seq: u64,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    wake: Condvar,
}

/// Process-wide wheel for deferred and periodic callbacks.
///
/// One worker thread parks on a condvar until the earliest deadline. Tasks
/// run on the worker thread; panics are caught and logged so a bad callback
/// cannot kill the wheel.
pub struct Timer {
    shared: Arc<TimerShared>,
}

impl Timer {
    pub fn new() -> Arc<Timer> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                entries: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            wake: Condvar::new(),
        });

        let worker = shared.clone();
        thread::Builder::new()
            .name("flowrt-timer".into())
            .spawn(move || Timer::run(worker))
            .ok();

        Arc::new(Timer { shared })
    }

    /// Run `f` once after `delay`.
    pub fn schedule_once(&self, delay: Duration, f: impl FnOnce() + Send + 'static) {
        self.push(delay, Task::Once(Box::new(f)));
    }

    /// Run `tick` every `period`, starting one period from now, until it
    /// returns `false`.
    pub fn schedule_periodic(&self, period: Duration, tick: impl FnMut() -> bool + Send + 'static) {
        self.push(
            period,
            Task::Every {
                period,
                tick: Box::new(tick),
            },
        );
    }

    /// Stop the worker thread. Pending entries are dropped.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        state.shutdown = true;
        state.entries.clear();
        self.shared.wake.notify_all();
    }

    fn push(&self, delay: Duration, task: Task) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push(Entry {
            at: Instant::now() + delay,
            seq,
            task,
        });
        self.shared.wake.notify_all();
    }

    fn run(shared: Arc<TimerShared>) {
        let mut state = shared.state.lock();
        loop {
            if state.shutdown {
                return;
            }
            let now = Instant::now();
            match state.entries.peek().map(|e| e.at) {
                None => {
                    shared.wake.wait(&mut state);
                }
                Some(at) if at > now => {
                    shared.wake.wait_until(&mut state, at);
                }
                Some(_) => {
                    let entry = match state.entries.pop() {
                        Some(e) => e,
                        None => continue,
                    };
                    drop(state);
                    let rearm = Timer::fire(entry);
                    state = shared.state.lock();
                    if let Some(entry) = rearm {
                        state.entries.push(entry);
                    }
                }
            }
        }
    }

    // runs the task with the state lock released; returns a re-armed entry
    // for live periodic tasks
    fn fire(entry: Entry) -> Option<Entry> {
        let Entry { seq, task, .. } = entry;
        match task {
            Task::Once(f) => {
                if let Err(p) = catch_unwind(AssertUnwindSafe(f)) {
                    tracing::warn!(
                        "timer task panicked: {}",
                        crate::error::FlowError::from_panic(p)
                    );
                }
                None
            }
            Task::Every { period, mut tick } => {
                let keep = catch_unwind(AssertUnwindSafe(|| tick()));
                match keep {
                    Ok(true) => Some(Entry {
                        at: Instant::now() + period,
                        seq,
                        task: Task::Every { period, tick },
                    }),
                    Ok(false) => None,
                    Err(p) => {
                        tracing::warn!(
                            "periodic task panicked, unscheduling: {}",
                            crate::error::FlowError::from_panic(p)
                        );
                        None
                    }
                }
            }
        }
    }
}

/// Ambient engine context: the shared timer, and room for whatever else the
/// process wants to scope (a pipeline executor, say).
///
/// Constructors that need a timer take the current context: the innermost
/// [`Context::enter`] scope on this thread, else the process default, which
/// is created lazily on first use.
#[derive(Clone)]
pub struct Context {
    timer: Arc<Timer>,
}

static DEFAULT_CONTEXT: ArcSwapOption<Context> = ArcSwapOption::const_empty();
static DEFAULT_INIT: Mutex<()> = Mutex::new(());

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<Context>> = const { RefCell::new(Vec::new()) };
}

impl Context {
    pub fn new() -> Context {
        Context { timer: Timer::new() }
    }

    #[inline]
    pub fn timer(&self) -> &Arc<Timer> {
        &self.timer
    }

    /// The innermost entered context on this thread, else the process
    /// default.
    pub fn current() -> Context {
        let local = CONTEXT_STACK.with(|stack| stack.borrow().last().cloned());
        if let Some(ctx) = local {
            return ctx;
        }
        if let Some(ctx) = DEFAULT_CONTEXT.load_full() {
            return (*ctx).clone();
        }
        // lazy init under a lock so a race cannot spawn two default timers
        let _init = DEFAULT_INIT.lock();
        if let Some(ctx) = DEFAULT_CONTEXT.load_full() {
            return (*ctx).clone();
        }
        let fresh = Arc::new(Context::new());
        DEFAULT_CONTEXT.store(Some(fresh.clone()));
        (*fresh).clone()
    }

    /// Replace the process default context.
    pub fn set_default(ctx: Context) {
        DEFAULT_CONTEXT.store(Some(Arc::new(ctx)));
    }

    /// Run `f` with this context as the thread's current one.
    pub fn enter<R>(&self, f: impl FnOnce() -> R) -> R {
        CONTEXT_STACK.with(|stack| stack.borrow_mut().push(self.clone()));
        struct Pop;
        impl Drop for Pop {
            fn drop(&mut self) {
                CONTEXT_STACK.with(|stack| {
                    stack.borrow_mut().pop();
                });
            }
        }
        let _pop = Pop;
        f()
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::new()
    }
}
