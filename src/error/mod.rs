use std::sync::Arc;
use std::{error::Error, fmt};

const ERR_MSG_ALREADY_CLOSED: &str = "channel is already closed";
const ERR_MSG_ALREADY_CONSUMED: &str = "node is already consumed";
const ERR_MSG_DRAINED: &str = "channel is drained";
const ERR_MSG_CANCELLED: &str = "operation cancelled";
const ERR_MSG_TIMEOUT: &str = "operation timed out";
const ERR_MSG_TX_MIX: &str = "transactional/non-transactional mix";

/// Non-exceptional failure outcomes observable by callers.
///
/// Every variant is a contract violation or a terminal state, not a panic:
/// they surface on the result channel tied to the affected operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    /// Enqueue or link against a closed node.
    AlreadyClosed,
    /// A second consumption attempt on a node that already has an owner.
    AlreadyConsumed,
    /// Receive against a closed node with no messages left.
    Drained,
    /// A pending receive was cancelled before a message arrived.
    Cancelled,
    /// A timed read elapsed before a message arrived.
    Timeout,
    /// A transactional queue touched outside a transaction, or a lock-based
    /// queue touched inside one.
    TransactionMix,
    /// A user operator, predicate, or subscriber callback failed.
    Callback(Arc<String>),
}

impl FlowError {
    pub fn callback(msg: impl Into<String>) -> Self {
        FlowError::Callback(Arc::new(msg.into()))
    }

    /// Convert a caught panic payload into a callback error.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic (unknown type)".into());
        FlowError::Callback(Arc::new(msg))
    }
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowError::AlreadyClosed => write!(f, "{ERR_MSG_ALREADY_CLOSED}"),
            FlowError::AlreadyConsumed => write!(f, "{ERR_MSG_ALREADY_CONSUMED}"),
            FlowError::Drained => write!(f, "{ERR_MSG_DRAINED}"),
            FlowError::Cancelled => write!(f, "{ERR_MSG_CANCELLED}"),
            FlowError::Timeout => write!(f, "{ERR_MSG_TIMEOUT}"),
            FlowError::TransactionMix => write!(f, "{ERR_MSG_TX_MIX}"),
            FlowError::Callback(msg) => write!(f, "callback failed: {msg}"),
        }
    }
}

impl Error for FlowError {}

impl From<anyhow::Error> for FlowError {
    fn from(err: anyhow::Error) -> Self {
        FlowError::Callback(Arc::new(err.to_string()))
    }
}
