//! Command payloads.
//!
//! A command is a named, parameterized unit of work. The name selects the
//! kind; the params are opaque to the queue except for duplicate detection.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::Trigger;

/// A command payload as accepted by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Kind discriminator (e.g. "RefreshSeries").
    pub name: String,

    /// Kind-specific parameters. Always a JSON object once validated.
    #[serde(default)]
    pub params: serde_json::Value,

    /// Transient: who asked. Ignored by duplicate detection.
    #[serde(default)]
    pub trigger: Trigger,

    /// Transient: when this kind last ran. Ignored by duplicate detection.
    #[serde(default)]
    pub last_execution_time: Option<DateTime<Utc>>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: serde_json::Value::Object(serde_json::Map::new()),
            trigger: Trigger::Unspecified,
            last_execution_time: None,
        }
    }

    pub fn params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn last_execution_time(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.last_execution_time = at;
        self
    }

    /// Build a command from a typed kind.
    pub fn from_kind<K: CommandKind>(kind: &K) -> Result<Self> {
        let params = serde_json::to_value(kind)
            .map_err(|e| Error::Validation(format!("{}: {e}", K::NAME)))?;
        Ok(Self::new(K::NAME).params(params))
    }

    /// Decode the params back into a typed kind.
    pub fn to_kind<K: CommandKind>(&self) -> Result<K> {
        if !same_kind(&self.name, K::NAME) {
            return Err(Error::Validation(format!(
                "command {} is not a {}",
                self.name,
                K::NAME
            )));
        }
        serde_json::from_value(canonical_params(&self.params))
            .map_err(|e| Error::Validation(format!("{}: {e}", K::NAME)))
    }

    /// Reject payloads the queue cannot reason about.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("command name is empty".to_string()));
        }
        match self.params {
            serde_json::Value::Object(_) | serde_json::Value::Null => Ok(()),
            _ => Err(Error::Validation(format!(
                "params for {} must be a JSON object",
                self.name
            ))),
        }
    }

    /// Duplicate-equivalence: same kind and equal parameters.
    ///
    /// `trigger` and `last_execution_time` do not take part.
    pub fn is_duplicate_of(&self, other: &Command) -> bool {
        same_kind(&self.name, &other.name)
            && canonical_params(&self.params) == canonical_params(&other.params)
    }
}

/// A statically known command kind.
///
/// Implementors are plain serde structs; their fields become the params.
pub trait CommandKind: Serialize + DeserializeOwned + Default + Send + Sync + 'static {
    const NAME: &'static str;
}

fn same_kind(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

// Null and {} both mean "no parameters". Object equality in serde_json is
// key-order independent, so this is the whole canonical form.
fn canonical_params(params: &serde_json::Value) -> serde_json::Value {
    match params {
        serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
        other => other.clone(),
    }
}
