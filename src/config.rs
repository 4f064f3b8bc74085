use crate::utils::Label;
use serde::{Deserialize, Serialize};

/// Construction knobs for a channel and its backing node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelOptions {
    /// Diagnostic label shown in `Debug` output and log lines.
    pub description: Option<Label>,

    /// Back the node with the transactional queue variant. Transactional
    /// and lock-based queues must not be mixed in one operation.
    #[serde(default)]
    pub transactional: bool,

    /// A permanent node ignores plain `close`, including the cascade from
    /// an upstream close. Only `close_force` closes it.
    #[serde(default)]
    pub permanent: bool,

    /// A grounded node stays in the open state regardless of edge count;
    /// closure is always explicit.
    #[serde(default)]
    pub grounded: bool,
}

impl ChannelOptions {
    pub fn described(label: impl Into<Label>) -> Self {
        ChannelOptions {
            description: Some(label.into()),
            ..Default::default()
        }
    }

    pub fn description(mut self, label: impl Into<Label>) -> Self {
        self.description = Some(label.into());
        self
    }

    pub fn transactional(mut self, on: bool) -> Self {
        self.transactional = on;
        self
    }

    pub fn permanent(mut self, on: bool) -> Self {
        self.permanent = on;
        self
    }

    pub fn grounded(mut self, on: bool) -> Self {
        self.grounded = on;
        self
    }
}
