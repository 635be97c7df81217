//! Stream identities and idempotency tokens.
//!
//! An [`Identity`] names exactly one event stream. A [`SourceId`] names the
//! operation that produced a batch of events; it is stamped into event
//! metadata so that a resent command can be recognised as a duplicate.

use std::{borrow::Borrow, fmt};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::CommittedEvent;

/// Opaque key naming one aggregate's event stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generate a fresh random identity of the form `prefix-<uuid>`.
    #[must_use]
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{prefix}-{}", Uuid::new_v4()))
    }

    /// Derive a stable identity from a namespace and a name.
    ///
    /// The same inputs always produce the same identity, which lets a saga
    /// locator map related events onto one saga instance without a lookup
    /// table.
    #[must_use]
    pub fn deterministic(prefix: &str, namespace: &Uuid, name: &str) -> Self {
        Self(format!(
            "{prefix}-{}",
            Uuid::new_v5(namespace, name.as_bytes())
        ))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Identity {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Idempotency token for a single logical update.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Source id for work triggered by a committed event.
    ///
    /// Redelivering the same event yields the same source id, so handlers
    /// that update an aggregate in response to an event become idempotent.
    #[must_use]
    pub fn for_event(event: &CommittedEvent) -> Self {
        match event.aggregate_name() {
            Some(kind) => Self(format!(
                "{kind}/{}:{}",
                event.aggregate_id, event.aggregate_sequence
            )),
            None => Self(format!("{}:{}", event.aggregate_id, event.aggregate_sequence)),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_identity_carries_prefix() {
        let id = Identity::generate("order");
        assert!(id.as_str().starts_with("order-"));
        assert_ne!(id, Identity::generate("order"));
    }

    #[test]
    fn deterministic_identity_is_stable() {
        let namespace = Uuid::new_v4();
        let a = Identity::deterministic("saga", &namespace, "order-1");
        let b = Identity::deterministic("saga", &namespace, "order-1");
        let c = Identity::deterministic("saga", &namespace, "order-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn identity_serializes_as_plain_string() {
        let id = Identity::new("account-7");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"account-7\"");
    }

    #[test]
    fn event_source_id_is_stable_and_scoped_by_kind() {
        let mut event = CommittedEvent {
            aggregate_id: Identity::new("o-1"),
            aggregate_sequence: 3,
            global_sequence: 9,
            batch_id: Uuid::nil(),
            data: Vec::new(),
            metadata: crate::metadata::Metadata::new(),
        };
        assert_eq!(SourceId::for_event(&event).as_str(), "o-1:3");

        event
            .metadata
            .insert(crate::metadata::keys::AGGREGATE_NAME, "order");
        assert_eq!(SourceId::for_event(&event), SourceId::for_event(&event.clone()));
        assert_eq!(SourceId::for_event(&event).as_str(), "order/o-1:3");
    }
}
