pub use edge::{Edge, EdgeStyle};
pub use node::{Node, NodeState, Operator, identity_node};
pub use terminal::Terminal;

mod edge;
mod node;
mod terminal;

use crate::error::FlowError;
use crate::message::Message;
use crate::queue::{Consumer, Release};
use crate::result::{ResultChannel, SendResult};
use crate::utils::Label;
use std::fmt;
use uuid::Uuid;
use uuid::fmt::Simple;

/// Unique identifier of a graph vertex.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct NodeId {
    raw: Simple,
}

impl NodeId {
    pub fn new() -> NodeId {
        Self {
            raw: Uuid::new_v4().simple(),
        }
    }

    /// Raw UUID (compact format).
    #[inline]
    pub fn raw(&self) -> Simple {
        self.raw
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Lifecycle callback stored on a vertex until its transition fires.
pub type LifecycleFn = Box<dyn FnOnce() + Send + Sync>;

/// Anything that accepts a message and yields a send-result: interior graph
/// vertices and terminal sinks.
///
/// `upstream` is the hand-over-hand release of the caller's queue section;
/// implementations fire it once their own exclusive section is entered (or
/// immediately, for lock-free sinks).
pub trait Propagator<T: Message>: Send + Sync {
    fn propagate(&self, msg: T, upstream: Release<'_>) -> SendResult;

    /// Downstream close cascade. Permanent vertices refuse and return
    /// `false`.
    fn close(&self) -> bool;

    /// Close regardless of permanence.
    fn close_force(&self) -> bool;

    /// Error cascade: irreversible, served to all future operations.
    fn fail(&self, error: FlowError);

    fn is_closed(&self) -> bool;

    /// Runs once when the vertex closes; immediately if already closed.
    fn on_closed(&self, f: LifecycleFn);

    fn label(&self) -> &Label;
}

/// Thunk returned by a successful consumption; restores the node.
pub type UnconsumeFn = Box<dyn FnOnce() + Send>;

/// The receive side of a graph vertex: edge management, consumption, and
/// one-shot reads. Implemented by [`Node`]; terminal sinks have no emitter
/// surface.
pub trait Emitter<T: Message>: Send + Sync {
    /// Attach a downstream edge. The backlog, if any, streams through the
    /// new edge in order before this returns.
    fn link(&self, edge: Edge<T>) -> Result<u64, FlowError>;

    /// Detach an edge by the id `link` returned.
    fn unlink(&self, edge_id: u64) -> bool;

    /// Exclusive consumption: the edge becomes the owner, the queue is
    /// bypassed, and no further owner may be designated until the returned
    /// thunk runs.
    fn consume(&self, edge: Edge<T>) -> Result<UnconsumeFn, FlowError>;

    /// Register a one-shot consumer, or satisfy it from the buffer.
    fn receive(&self, consumer: Consumer<T>) -> ResultChannel<T>;

    /// Remove the pending consumer identified by `rc`. Idempotent.
    fn cancel_receive(&self, rc: &ResultChannel<T>) -> bool;

    /// Pop the entire backlog.
    fn drain(&self) -> Vec<T>;

    fn state(&self) -> NodeState;

    fn is_drained(&self) -> bool;

    fn on_closed(&self, f: LifecycleFn);

    /// Runs once when the vertex is closed and its backlog fully consumed.
    fn on_drained(&self, f: LifecycleFn);

    /// Register an unsubscribe hook under `key`.
    fn register_cancellation(&self, key: u64, f: LifecycleFn);

    /// Invoke and remove the hook registered under `key`.
    fn cancel(&self, key: u64) -> bool;

    fn is_transactional(&self) -> bool;

    fn node_id(&self) -> NodeId;

    fn label(&self) -> &Label;
}

pub(crate) fn run_callback(f: LifecycleFn) {
    if let Err(p) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        tracing::warn!("lifecycle callback panicked: {}", FlowError::from_panic(p));
    }
}

#[cfg(test)]
mod tests;
