use super::Propagator;
use crate::message::Message;
use crate::utils::Label;
use std::fmt;
use std::sync::Arc;

/// How an edge participates in propagation and lifecycle cascades.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeStyle {
    Standard,
    /// Observation edge: contributes no back-pressure, installs no upstream
    /// hooks. Closing the destination never touches the source.
    Tap,
    /// Edge whose destination's lifetime is coupled to the source both ways.
    Join,
    /// Downstream copy: closing the destination leaves the source open.
    Fork,
    /// Multi-dispatch branch of a split node.
    Split,
}

/// Typed link from a source node to a destination propagator.
pub struct Edge<T: Message> {
    label: Label,
    style: EdgeStyle,
    target: Arc<dyn Propagator<T>>,
}

impl<T: Message> Clone for Edge<T> {
    fn clone(&self) -> Self {
        Edge {
            label: self.label.clone(),
            style: self.style,
            target: self.target.clone(),
        }
    }
}

impl<T: Message> Edge<T> {
    pub fn new(
        style: EdgeStyle,
        label: impl Into<Label>,
        target: Arc<dyn Propagator<T>>,
    ) -> Self {
        Edge {
            label: label.into(),
            style,
            target,
        }
    }

    pub fn standard(label: impl Into<Label>, target: Arc<dyn Propagator<T>>) -> Self {
        Self::new(EdgeStyle::Standard, label, target)
    }

    pub fn tap(label: impl Into<Label>, target: Arc<dyn Propagator<T>>) -> Self {
        Self::new(EdgeStyle::Tap, label, target)
    }

    pub fn join(label: impl Into<Label>, target: Arc<dyn Propagator<T>>) -> Self {
        Self::new(EdgeStyle::Join, label, target)
    }

    pub fn fork(label: impl Into<Label>, target: Arc<dyn Propagator<T>>) -> Self {
        Self::new(EdgeStyle::Fork, label, target)
    }

    #[inline]
    pub fn style(&self) -> EdgeStyle {
        self.style
    }

    #[inline]
    pub fn target(&self) -> &Arc<dyn Propagator<T>> {
        &self.target
    }

    pub fn into_target(self) -> Arc<dyn Propagator<T>> {
        self.target
    }

    #[inline]
    pub fn label(&self) -> &Label {
        &self.label
    }
}

impl<T: Message> fmt::Debug for Edge<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Edge")
            .field("label", &self.label)
            .field("style", &self.style)
            .field("target", &self.target.label())
            .finish()
    }
}
