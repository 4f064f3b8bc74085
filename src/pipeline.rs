use crate::error::FlowError;
use crate::message::Message;
use crate::result::ResultChannel;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// What a stage hands back to the pipeline.
pub enum StageOutput<V: Message> {
    /// Feed the next stage with this value, on the same thread.
    Value(V),
    /// Resume the next stage when the deferred resolves, on whichever thread
    /// resolves it.
    Deferred(ResultChannel<V>),
    /// Re-enter the pipeline at stage zero.
    Restart(V),
    /// Terminate with this value, skipping remaining stages.
    Complete(V),
    /// Transfer control to another pipeline.
    Redirect(Arc<Pipeline<V>>, V),
}

pub type StageFn<V> = Box<dyn Fn(V) -> Result<StageOutput<V>, FlowError> + Send + Sync>;
type ErrorHandler<V> = Box<dyn Fn(FlowError) -> Result<StageOutput<V>, FlowError> + Send + Sync>;
type FinallyFn = Box<dyn Fn() + Send + Sync>;

/// Sequential composition of stages where each stage may return a deferred.
///
/// Synchronous chains run iteratively (a trampoline, not recursion), so long
/// restart loops cannot grow the stack. Stage `i + 1` is never invoked
/// before stage `i` has produced its value; there is no parallelism within a
/// single run.
pub struct Pipeline<V: Message> {
    stages: Vec<StageFn<V>>,
    error_handler: Option<ErrorHandler<V>>,
    finally: Option<FinallyFn>,
}

pub struct PipelineBuilder<V: Message> {
    pipeline: Pipeline<V>,
}

impl<V: Message> Pipeline<V> {
    pub fn builder() -> PipelineBuilder<V> {
        PipelineBuilder {
            pipeline: Pipeline {
                stages: Vec::new(),
                error_handler: None,
                finally: None,
            },
        }
    }

    /// Run from stage zero; the returned channel resolves with the terminal
    /// value.
    pub fn run(self: &Arc<Self>, initial: V) -> ResultChannel<V> {
        let result = ResultChannel::new();
        self.run_into(result.clone(), initial);
        result
    }

    /// Run against an externally-provided result channel (pipeline merging).
    pub fn run_into(self: &Arc<Self>, result: ResultChannel<V>, initial: V) {
        drive(self.clone(), result, 0, initial);
    }

    fn finish(&self, result: &ResultChannel<V>, terminal: Result<V, FlowError>) {
        if let Some(finally) = &self.finally {
            if let Err(p) = catch_unwind(AssertUnwindSafe(finally)) {
                tracing::warn!("finally hook panicked: {}", FlowError::from_panic(p));
            }
        }
        match terminal {
            Ok(v) => {
                let _ = result.succeed_claimed(v);
            }
            Err(e) => {
                let _ = result.fail_claimed(e);
            }
        }
    }
}

impl<V: Message> PipelineBuilder<V> {
    /// Append a stage.
    pub fn stage(
        mut self,
        f: impl Fn(V) -> Result<StageOutput<V>, FlowError> + Send + Sync + 'static,
    ) -> Self {
        self.pipeline.stages.push(Box::new(f));
        self
    }

    /// Append an infallible value-to-value stage.
    pub fn map_stage(self, f: impl Fn(V) -> V + Send + Sync + 'static) -> Self {
        self.stage(move |v| Ok(StageOutput::Value(f(v))))
    }

    /// Invoked for a stage error or an errored deferred; may downgrade the
    /// error to any stage output, including a restart.
    pub fn on_error(
        mut self,
        f: impl Fn(FlowError) -> Result<StageOutput<V>, FlowError> + Send + Sync + 'static,
    ) -> Self {
        self.pipeline.error_handler = Some(Box::new(f));
        self
    }

    /// Runs on every terminal path, before the result is observable.
    pub fn finally(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.pipeline.finally = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Arc<Pipeline<V>> {
        Arc::new(self.pipeline)
    }
}

/// One-shot convenience over the builder.
pub fn run_pipeline<V: Message>(
    initial: V,
    stages: impl IntoIterator<Item = StageFn<V>>,
) -> ResultChannel<V> {
    let mut builder = Pipeline::builder();
    for s in stages {
        builder.pipeline.stages.push(s);
    }
    builder.build().run(initial)
}

enum Flow<V: Message> {
    Step(usize, V),
    Jump(Arc<Pipeline<V>>, V),
    Finish(Result<V, FlowError>),
    Suspended,
}

fn drive<V: Message>(
    mut pipe: Arc<Pipeline<V>>,
    result: ResultChannel<V>,
    mut idx: usize,
    mut val: V,
) {
    loop {
        if idx >= pipe.stages.len() {
            pipe.finish(&result, Ok(val));
            return;
        }
        let outcome = {
            let stage = &pipe.stages[idx];
            let moved = val;
            catch_unwind(AssertUnwindSafe(move || stage(moved)))
                .unwrap_or_else(|p| Err(FlowError::from_panic(p)))
        };
        match apply(&pipe, &result, idx, outcome) {
            Flow::Step(i, v) => {
                idx = i;
                val = v;
            }
            Flow::Jump(other, v) => {
                // control leaves this pipeline: its finally fires now
                if let Some(finally) = &pipe.finally {
                    if let Err(p) = catch_unwind(AssertUnwindSafe(finally)) {
                        tracing::warn!("finally hook panicked: {}", FlowError::from_panic(p));
                    }
                }
                pipe = other;
                idx = 0;
                val = v;
            }
            Flow::Finish(terminal) => {
                pipe.finish(&result, terminal);
                return;
            }
            Flow::Suspended => return,
        }
    }
}

// Resolve one stage outcome into the next movement of the trampoline.
fn apply<V: Message>(
    pipe: &Arc<Pipeline<V>>,
    result: &ResultChannel<V>,
    idx: usize,
    outcome: Result<StageOutput<V>, FlowError>,
) -> Flow<V> {
    match outcome {
        Ok(StageOutput::Value(v)) => Flow::Step(idx + 1, v),
        Ok(StageOutput::Restart(v)) => Flow::Step(0, v),
        Ok(StageOutput::Complete(v)) => Flow::Finish(Ok(v)),
        Ok(StageOutput::Redirect(other, v)) => Flow::Jump(other, v),
        Ok(StageOutput::Deferred(rc)) => {
            // already-realized deferreds continue inline so long synchronous
            // chains stay on the trampoline
            if let Some(settled) = rc.try_get() {
                return match settled {
                    Ok(v) => Flow::Step(idx + 1, v),
                    Err(e) => handle_error(pipe, result, e),
                };
            }
            let (p, r) = (pipe.clone(), result.clone());
            rc.on_success(move |v| drive(p, r, idx + 1, v));
            let (p, r) = (pipe.clone(), result.clone());
            rc.on_error(move |e| match handle_error(&p, &r, e) {
                Flow::Step(i, v) => drive(p.clone(), r, i, v),
                Flow::Jump(other, v) => drive(other, r, 0, v),
                Flow::Finish(t) => p.finish(&r, t),
                Flow::Suspended => {}
            });
            Flow::Suspended
        }
        Err(e) => handle_error(pipe, result, e),
    }
}

fn handle_error<V: Message>(
    pipe: &Arc<Pipeline<V>>,
    result: &ResultChannel<V>,
    error: FlowError,
) -> Flow<V> {
    let handler = match &pipe.error_handler {
        Some(h) => h,
        None => return Flow::Finish(Err(error)),
    };
    let outcome = catch_unwind(AssertUnwindSafe(|| handler(error)))
        .unwrap_or_else(|p| Err(FlowError::from_panic(p)));
    match outcome {
        // a handler value is the pipeline's terminal value
        Ok(StageOutput::Value(v)) | Ok(StageOutput::Complete(v)) => Flow::Finish(Ok(v)),
        Ok(StageOutput::Restart(v)) => Flow::Step(0, v),
        Ok(StageOutput::Redirect(other, v)) => Flow::Jump(other, v),
        Ok(StageOutput::Deferred(rc)) => {
            if let Some(settled) = rc.try_get() {
                return Flow::Finish(settled);
            }
            let (p, r) = (pipe.clone(), result.clone());
            rc.on_success(move |v| p.finish(&r, Ok(v)));
            let (p, r) = (pipe.clone(), result.clone());
            rc.on_error(move |e| p.finish(&r, Err(e)));
            Flow::Suspended
        }
        Err(e) => Flow::Finish(Err(e)),
    }
}
