//! Event metadata and the providers that stamp it.
//!
//! Metadata is an ordered string map stored next to every event payload.
//! The aggregate engine stamps a fixed set of well-known keys on commit
//! (see [`keys`]); [`MetadataProvider`]s may add more.

use std::collections::{BTreeMap, btree_map};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    event::EventType,
    identity::{Identity, SourceId},
};

/// Well-known metadata keys.
pub mod keys {
    pub const EVENT_NAME: &str = "event_name";
    pub const EVENT_VERSION: &str = "event_version";
    pub const AGGREGATE_NAME: &str = "aggregate_name";
    pub const AGGREGATE_ID: &str = "aggregate_id";
    pub const AGGREGATE_SEQUENCE: &str = "aggregate_sequence";
    pub const SOURCE_ID: &str = "source_id";
    pub const EVENT_ID: &str = "event_id";
    pub const TIMESTAMP: &str = "timestamp";

    /// Keys owned by the aggregate engine. Providers cannot override them.
    pub const RESERVED: [&str; 6] = [
        EVENT_NAME,
        EVENT_VERSION,
        AGGREGATE_NAME,
        AGGREGATE_ID,
        AGGREGATE_SEQUENCE,
        SOURCE_ID,
    ];
}

/// String key/value map attached to an event.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Copy every entry of `other` into `self`, overwriting existing keys.
    pub fn merge(&mut self, other: Self) {
        self.0.extend(other.0);
    }

    /// Copy entries of `other` that are not reserved for the engine.
    pub(crate) fn merge_unreserved(&mut self, other: Self) {
        for (key, value) in other.0 {
            if !keys::RESERVED.contains(&key.as_str()) {
                self.0.insert(key, value);
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn event_type(&self) -> Option<EventType> {
        let name = self.get(keys::EVENT_NAME)?;
        let version = self.get(keys::EVENT_VERSION)?.parse().ok()?;
        Some(EventType::new(name, version))
    }

    #[must_use]
    pub fn aggregate_name(&self) -> Option<&str> {
        self.get(keys::AGGREGATE_NAME)
    }

    #[must_use]
    pub fn aggregate_sequence(&self) -> Option<u64> {
        self.get(keys::AGGREGATE_SEQUENCE)?.parse().ok()
    }

    #[must_use]
    pub fn source_id(&self) -> Option<SourceId> {
        self.get(keys::SOURCE_ID).map(SourceId::new)
    }

    #[must_use]
    pub fn event_id(&self) -> Option<Uuid> {
        self.get(keys::EVENT_ID)?.parse().ok()
    }

    #[must_use]
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(self.get(keys::TIMESTAMP)?)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }
}

impl FromIterator<(String, String)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Metadata {
    type Item = (String, String);
    type IntoIter = btree_map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// What a provider knows about the event it is stamping.
#[derive(Clone, Copy, Debug)]
pub struct CommitContext<'a> {
    pub aggregate_name: &'a str,
    pub aggregate_id: &'a Identity,
    pub aggregate_sequence: u64,
    pub event_type: &'a EventType,
    pub source_id: &'a SourceId,
}

/// Contributes metadata to each event before it is committed.
///
/// Providers run in registration order; a later provider overwrites keys
/// written by an earlier one. Reserved engine keys are stamped last.
pub trait MetadataProvider: Send + Sync {
    fn provide(&self, context: &CommitContext<'_>) -> Metadata;
}

impl<F> MetadataProvider for F
where
    F: Fn(&CommitContext<'_>) -> Metadata + Send + Sync,
{
    fn provide(&self, context: &CommitContext<'_>) -> Metadata {
        self(context)
    }
}

/// Stamps the wall-clock commit time.
#[derive(Clone, Copy, Debug, Default)]
pub struct TimestampProvider;

impl MetadataProvider for TimestampProvider {
    fn provide(&self, _context: &CommitContext<'_>) -> Metadata {
        Metadata::new().with(keys::TIMESTAMP, Utc::now().to_rfc3339())
    }
}

/// Stamps a deterministic event id derived from the aggregate id and
/// sequence.
#[derive(Clone, Copy, Debug)]
pub struct EventIdProvider {
    namespace: Uuid,
}

impl EventIdProvider {
    const DEFAULT_NAMESPACE: Uuid = Uuid::from_u128(0x6576_656e_7469_6465_0000_0000_0000_0001);

    #[must_use]
    pub const fn new(namespace: Uuid) -> Self {
        Self { namespace }
    }
}

impl Default for EventIdProvider {
    fn default() -> Self {
        Self::new(Self::DEFAULT_NAMESPACE)
    }
}

impl MetadataProvider for EventIdProvider {
    fn provide(&self, context: &CommitContext<'_>) -> Metadata {
        let name = format!("{}-{}", context.aggregate_id, context.aggregate_sequence);
        Metadata::new().with(
            keys::EVENT_ID,
            Uuid::new_v5(&self.namespace, name.as_bytes()).to_string(),
        )
    }
}
