//! Aggregate persistence.
//!
//! [`Repository`] is the write side of the library. It replays an
//! aggregate's stream, runs a mutation against the rebuilt state, stamps and
//! encodes whatever was emitted, and commits the batch under optimistic
//! concurrency. Conflicts restart the whole load, mutate and commit cycle
//! under a [`RetryPolicy`]. Commits made under an already-seen [`SourceId`]
//! are skipped, which makes resending a command safe.

use std::sync::Arc;

use nonempty::NonEmpty;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    aggregate::{Aggregate, AggregateRoot, Handle},
    codec::{Codec, JsonCodec},
    concurrency::ConcurrencyConflict,
    event::{EventDecodeError, EventEnvelope, EventRegistry, RegistryError},
    identity::{Identity, SourceId},
    metadata::{CommitContext, MetadataProvider, keys},
    publisher::{EventPublisher, PublishError},
    retry::RetryPolicy,
    store::{CommitError, CommittedEvent, EventLog, SequenceRange, SerializedEvent},
    upgrade::{EventUpgrader, UpgradePipeline},
};

/// Failure to rebuild an aggregate from its stream.
#[derive(Debug, Error)]
pub enum LoadError<StoreError, CodecError>
where
    StoreError: std::error::Error + 'static,
    CodecError: std::error::Error + 'static,
{
    #[error("failed to load events: {0}")]
    Store(#[source] StoreError),
    #[error("failed to decode stored event: {0}")]
    Decode(#[source] EventDecodeError<CodecError>),
}

/// Failure of [`Repository::update`].
#[derive(Debug, Error)]
pub enum UpdateError<DomainError, StoreError, CodecError>
where
    StoreError: std::error::Error + 'static,
    CodecError: std::error::Error + 'static,
{
    /// The mutation rejected the update. Not retried.
    #[error("aggregate rejected update: {0}")]
    Domain(DomainError),
    /// Every attempt lost the race to another writer.
    #[error("gave up after {attempts} conflicting attempts: {conflict}")]
    Conflict {
        attempts: u32,
        #[source]
        conflict: ConcurrencyConflict,
    },
    #[error(transparent)]
    Load(LoadError<StoreError, CodecError>),
    #[error("failed to encode events: {0}")]
    Codec(#[source] CodecError),
    #[error("failed to persist events: {0}")]
    Store(#[source] StoreError),
    /// The events are durable; delivering them failed. The recovery loop
    /// will redeliver them.
    #[error("events committed but publishing failed: {source}")]
    Publish {
        committed: Vec<CommittedEvent>,
        #[source]
        source: PublishError,
    },
    /// Cancelled before anything was written.
    #[error("update cancelled before commit")]
    Cancelled,
}

impl<D, S, C> UpdateError<D, S, C>
where
    S: std::error::Error + 'static,
    C: std::error::Error + 'static,
{
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Result alias for [`Repository::execute`].
pub type ExecuteResult<A, L, C> = Result<
    Vec<CommittedEvent>,
    UpdateError<<A as Aggregate>::Error, <L as EventLog>::Error, <C as Codec>::Error>,
>;

/// Loads and updates aggregates of type `A` stored in `L`.
pub struct Repository<A, L, C = JsonCodec>
where
    A: Aggregate,
    C: Codec,
{
    log: L,
    registry: EventRegistry<A::Event, C>,
    upgraders: UpgradePipeline<A::Event>,
    retry: RetryPolicy,
    providers: Vec<Arc<dyn MetadataProvider>>,
    publisher: Option<EventPublisher>,
}

impl<A, L> Repository<A, L, JsonCodec>
where
    A: Aggregate,
    L: EventLog,
{
    /// # Errors
    ///
    /// Returns [`RegistryError`] if `A::Event` names an event type twice.
    pub fn new(log: L) -> Result<Self, RegistryError> {
        Self::with_codec(log, JsonCodec)
    }
}

impl<A, L, C> Repository<A, L, C>
where
    A: Aggregate,
    L: EventLog,
    C: Codec,
{
    /// # Errors
    ///
    /// Returns [`RegistryError`] if `A::Event` names an event type twice.
    pub fn with_codec(log: L, codec: C) -> Result<Self, RegistryError> {
        Ok(Self {
            log,
            registry: EventRegistry::new(codec)?,
            upgraders: UpgradePipeline::new(),
            retry: RetryPolicy::commit_default(),
            providers: Vec::new(),
            publisher: None,
        })
    }

    #[must_use]
    pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_upgrader(mut self, upgrader: impl EventUpgrader<A::Event> + 'static) -> Self {
        self.upgraders.push(upgrader);
        self
    }

    /// Append a metadata provider. Providers run in the order added.
    #[must_use]
    pub fn with_metadata_provider(mut self, provider: impl MetadataProvider + 'static) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    /// Deliver every committed batch through `publisher`.
    #[must_use]
    pub fn with_publisher(mut self, publisher: EventPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub const fn event_log(&self) -> &L {
        &self.log
    }

    pub const fn registry(&self) -> &EventRegistry<A::Event, C> {
        &self.registry
    }

    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Load, decode and upgrade part of a stream.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError`] if the log fails or an event cannot be decoded.
    pub async fn load_events(
        &self,
        id: &Identity,
        range: SequenceRange,
    ) -> Result<Vec<EventEnvelope<A::Event>>, LoadError<L::Error, C::Error>> {
        let committed = self
            .log
            .load_events(id, range)
            .await
            .map_err(LoadError::Store)?;
        self.decode_and_upgrade(&committed)
    }

    fn decode_and_upgrade(
        &self,
        committed: &[CommittedEvent],
    ) -> Result<Vec<EventEnvelope<A::Event>>, LoadError<L::Error, C::Error>> {
        let envelopes = committed
            .iter()
            .map(|event| self.registry.decode_committed(event))
            .collect::<Result<Vec<_>, _>>()
            .map_err(LoadError::Decode)?;
        Ok(self.upgraders.upgrade(envelopes))
    }

    /// Rebuild an aggregate from its full stream. A missing stream yields a
    /// new root.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError`] if the log fails or an event cannot be decoded.
    #[tracing::instrument(skip_all, fields(aggregate = A::KIND, aggregate_id = %id))]
    pub async fn load(
        &self,
        id: &Identity,
    ) -> Result<AggregateRoot<A>, LoadError<L::Error, C::Error>> {
        let committed = self
            .log
            .load_events(id, SequenceRange::ALL)
            .await
            .map_err(LoadError::Store)?;
        let envelopes = self.decode_and_upgrade(&committed)?;
        let mut root = AggregateRoot::replay(id.clone(), &envelopes);
        root.observe_stored(&committed);
        tracing::trace!(version = root.version(), "aggregate loaded");
        Ok(root)
    }

    /// Load `id`, run `mutate`, and commit whatever it emitted.
    ///
    /// - If a committed event already carries `source_id`, nothing runs and
    ///   an empty vector is returned.
    /// - If `mutate` emits nothing, nothing is committed.
    /// - On a concurrency conflict the whole cycle reruns, so `mutate` may
    ///   be called more than once and must not have side effects.
    ///
    /// # Errors
    ///
    /// See [`UpdateError`]. [`UpdateError::Cancelled`] is only returned when
    /// nothing was written.
    #[tracing::instrument(
        skip_all,
        fields(aggregate = A::KIND, aggregate_id = %id, source_id = %source_id)
    )]
    pub async fn update<F, E>(
        &self,
        id: &Identity,
        source_id: &SourceId,
        mut mutate: F,
        cancel: &CancellationToken,
    ) -> Result<Vec<CommittedEvent>, UpdateError<E, L::Error, C::Error>>
    where
        F: FnMut(&mut AggregateRoot<A>) -> Result<(), E> + Send,
        E: Send,
    {
        let mut retries = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(UpdateError::Cancelled);
            }

            let mut root = self.load(id).await.map_err(UpdateError::Load)?;
            if root.has_seen_source(source_id) {
                tracing::info!("source id already committed, skipping duplicate update");
                return Ok(Vec::new());
            }

            mutate(&mut root).map_err(UpdateError::Domain)?;

            let start = root.committed_version() + 1;
            let Some(batch) = NonEmpty::from_vec(self.serialize(&mut root, source_id, start)?)
            else {
                tracing::debug!("mutation emitted no events");
                return Ok(Vec::new());
            };

            if cancel.is_cancelled() {
                return Err(UpdateError::Cancelled);
            }

            match self.log.commit_events(id, start, batch).await {
                Ok(committed) => {
                    tracing::debug!(
                        from = start,
                        count = committed.len(),
                        retries,
                        "events committed"
                    );
                    self.publish(&committed, cancel).await.map_err(|source| {
                        UpdateError::Publish {
                            committed: committed.clone(),
                            source,
                        }
                    })?;
                    return Ok(committed);
                }
                Err(CommitError::Conflict(conflict)) => {
                    retries += 1;
                    if !self.retry.allows(retries) {
                        tracing::warn!(%conflict, retries, "retries exhausted");
                        return Err(UpdateError::Conflict {
                            attempts: retries,
                            conflict,
                        });
                    }
                    tracing::debug!(%conflict, retries, "conflict, reloading");
                    if !self.retry.backoff(retries, cancel).await {
                        return Err(UpdateError::Cancelled);
                    }
                }
                Err(CommitError::Store(err)) => return Err(UpdateError::Store(err)),
            }
        }
    }

    /// Run a typed command through [`Handle`] with [`update`](Self::update)
    /// semantics.
    ///
    /// # Errors
    ///
    /// See [`update`](Self::update).
    pub async fn execute<Cmd>(
        &self,
        id: &Identity,
        source_id: &SourceId,
        command: &Cmd,
        cancel: &CancellationToken,
    ) -> ExecuteResult<A, L, C>
    where
        A: Handle<Cmd>,
        Cmd: Sync,
    {
        self.update(
            id,
            source_id,
            |root| {
                let events = root.state().handle(command)?;
                for event in events {
                    root.emit(event);
                }
                Ok(())
            },
            cancel,
        )
        .await
    }

    /// Delete the aggregate's stream.
    ///
    /// # Errors
    ///
    /// Returns the log's error.
    pub async fn delete(&self, id: &Identity) -> Result<(), L::Error> {
        self.log.delete_stream(id).await
    }

    /// Encode and stamp the root's uncommitted events.
    fn serialize<E>(
        &self,
        root: &mut AggregateRoot<A>,
        source_id: &SourceId,
        start: u64,
    ) -> Result<Vec<SerializedEvent>, UpdateError<E, L::Error, C::Error>> {
        let id = root.id().clone();
        let mut batch = Vec::new();
        for (sequence, pending) in (start..).zip(root.take_uncommitted()) {
            let (event_type, data) = self
                .registry
                .encode(&pending.event)
                .map_err(UpdateError::Codec)?;

            let context = CommitContext {
                aggregate_name: A::KIND,
                aggregate_id: &id,
                aggregate_sequence: sequence,
                event_type: &event_type,
                source_id,
            };
            let mut metadata = pending.metadata;
            for provider in &self.providers {
                metadata.merge_unreserved(provider.provide(&context));
            }
            metadata.insert(keys::EVENT_NAME, event_type.name.clone());
            metadata.insert(keys::EVENT_VERSION, event_type.version.to_string());
            metadata.insert(keys::AGGREGATE_NAME, A::KIND);
            metadata.insert(keys::AGGREGATE_ID, id.as_str());
            metadata.insert(keys::AGGREGATE_SEQUENCE, sequence.to_string());
            metadata.insert(keys::SOURCE_ID, source_id.as_str());

            batch.push(SerializedEvent { data, metadata });
        }
        Ok(batch)
    }

    async fn publish(
        &self,
        committed: &[CommittedEvent],
        cancel: &CancellationToken,
    ) -> Result<(), PublishError> {
        match &self.publisher {
            Some(publisher) => publisher.publish(committed, cancel).await,
            None => Ok(()),
        }
    }
}
