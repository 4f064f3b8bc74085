use std::{borrow::Borrow, sync::Arc};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Cheap cloneable description attached to channels, nodes, and edges.
///
/// Purely diagnostic: labels show up in `Debug` output and log lines, never
/// in dispatch decisions.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Label(Arc<str>);

impl Serialize for Label {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Label {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(Label::from(value))
    }
}

impl Default for Label {
    fn default() -> Self {
        Self(Arc::<str>::from("channel"))
    }
}

impl Label {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::<str>::from(name.as_ref()))
    }

    /// Label for an operator stage derived from a source, e.g. `map < ticks`.
    pub fn derived(op: &str, source: &Label) -> Self {
        Self(Arc::<str>::from(format!("{op} < {source}").as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Label {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl From<String> for Label {
    fn from(value: String) -> Self {
        Self(Arc::<str>::from(value))
    }
}

impl<'a> From<&'a str> for Label {
    fn from(value: &'a str) -> Self {
        Self(Arc::<str>::from(value))
    }
}

impl From<&Label> for Label {
    fn from(value: &Label) -> Self {
        value.clone()
    }
}

impl AsRef<str> for Label {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
