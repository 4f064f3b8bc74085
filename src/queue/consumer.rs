use crate::error::FlowError;
use crate::message::Message;
use crate::result::ResultChannel;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

pub type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

pub enum ConsumerKind<T: Message> {
    Simple,
    /// Succeeds with the message when the predicate holds; otherwise
    /// succeeds with `false_value` without consuming the message.
    Predicated {
        predicate: Predicate<T>,
        false_value: T,
    },
}

impl<T: Message> Clone for ConsumerKind<T> {
    fn clone(&self) -> Self {
        match self {
            ConsumerKind::Simple => ConsumerKind::Simple,
            ConsumerKind::Predicated {
                predicate,
                false_value,
            } => ConsumerKind::Predicated {
                predicate: predicate.clone(),
                false_value: false_value.clone(),
            },
        }
    }
}

/// A registered one-shot recipient on a queue.
///
/// Two consumers are the same consumer when their result channels are
/// identical, so a predicated and a simple consumer collide for cancellation
/// purposes.
pub struct Consumer<T: Message> {
    result: ResultChannel<T>,
    kind: ConsumerKind<T>,
}

impl<T: Message> Clone for Consumer<T> {
    fn clone(&self) -> Self {
        Consumer {
            result: self.result.clone(),
            kind: self.kind.clone(),
        }
    }
}

/// Verdict of offering one message to one consumer, decided under the queue
/// lock. Completions implied by the verdict run later, off the lock.
pub enum Offer<T: Message> {
    /// Claim won; the consumer takes the message.
    Taken,
    /// Predicate said no; the consumer resolves with this value and the
    /// message stays available.
    Rejected(T),
    /// The consumer's claim was already gone (cancelled or raced); skip it.
    Dead,
    /// The predicate failed; the consumer resolves with this error and the
    /// message stays available.
    Broken(FlowError),
}

impl<T: Message> Consumer<T> {
    pub fn simple() -> Self {
        Consumer {
            result: ResultChannel::new(),
            kind: ConsumerKind::Simple,
        }
    }

    /// Simple consumer bound to a caller-provided result channel
    /// (pre-registration into pipelines).
    pub fn with_result(result: ResultChannel<T>) -> Self {
        Consumer {
            result,
            kind: ConsumerKind::Simple,
        }
    }

    pub fn predicated(
        result: ResultChannel<T>,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
        false_value: T,
    ) -> Self {
        Consumer {
            result,
            kind: ConsumerKind::Predicated {
                predicate: Arc::new(predicate),
                false_value,
            },
        }
    }

    #[inline]
    pub fn result(&self) -> &ResultChannel<T> {
        &self.result
    }

    pub(crate) fn offer(&self, msg: &T) -> Offer<T> {
        match &self.kind {
            ConsumerKind::Simple => {
                if self.result.claim() {
                    Offer::Taken
                } else {
                    Offer::Dead
                }
            }
            ConsumerKind::Predicated {
                predicate,
                false_value,
            } => {
                let verdict = catch_unwind(AssertUnwindSafe(|| predicate(msg)));
                match verdict {
                    Ok(true) => {
                        if self.result.claim() {
                            Offer::Taken
                        } else {
                            Offer::Dead
                        }
                    }
                    Ok(false) => {
                        if self.result.claim() {
                            Offer::Rejected(false_value.clone())
                        } else {
                            Offer::Dead
                        }
                    }
                    Err(p) => {
                        if self.result.claim() {
                            Offer::Broken(FlowError::from_panic(p))
                        } else {
                            Offer::Dead
                        }
                    }
                }
            }
        }
    }
}
