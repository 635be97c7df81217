//! Read-model projection.
//!
//! A [`ReadModel`] is a denormalized view kept in a [`ReadModelStore`]. Its
//! [`ReadModelDefinition`] declares which `(aggregate, event)` pairs it
//! handles and how events are routed to read model ids. A
//! [`ReadModelProjector`] turns committed batches into per-id updates, folds
//! them through the handlers, and writes the result back under an
//! optimistic version check. [`ProjectionManager`] fans a batch out to
//! several projectors and plugs into the
//! [`EventPublisher`](crate::publisher::EventPublisher) as a subscriber.
//!
//! Folding is a pure function of the stored envelope and the events. Each
//! envelope records the last sequence it applied from every aggregate that
//! fed it, and events at or below that sequence are skipped, so a redelivered
//! batch leaves the stored read model as it was.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    aggregate::Aggregate,
    codec::{Codec, JsonCodec},
    event::{
        DefinitionError, DomainEvent, EventEnvelope, EventKey, HandlerDecodeError, handler_key,
    },
    publisher::{BoxError, EventSubscriber},
    retry::RetryPolicy,
    store::{CommittedEvent, EventLog, GlobalPosition},
};

pub mod inmemory;
pub mod schema;

/// A denormalized view built from events.
pub trait ReadModel: Default + Clone + Send + Sync + 'static {
    /// Stable name, used in logs and as the default table name.
    const KIND: &'static str;
}

/// What a handler did to the read model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Unchanged,
    Modified,
    /// Remove the read model. Later events in the same update are ignored.
    Delete,
}

/// Per-event handler, the read-model counterpart of
/// [`Apply`](crate::aggregate::Apply).
pub trait ApplyReadModel<E>: ReadModel {
    fn apply_event(&mut self, event: &EventEnvelope<E>) -> ApplyOutcome;
}

/// Last applied aggregate sequence per source aggregate.
///
/// The read model version is the sum of these positions. For a read model
/// fed by a single aggregate that is the sequence of the last event applied;
/// for a fan-in read model it still grows on every write.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamPositions(BTreeMap<String, u64>);

impl StreamPositions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Positions for a read model that has applied `aggregate_id` up to
    /// `sequence`.
    #[must_use]
    pub fn single(aggregate_id: impl Into<String>, sequence: u64) -> Self {
        Self(BTreeMap::from([(aggregate_id.into(), sequence)]))
    }

    #[must_use]
    pub fn get(&self, aggregate_id: &str) -> Option<u64> {
        self.0.get(aggregate_id).copied()
    }

    /// Whether `event` lies beyond what has been applied from its aggregate.
    #[must_use]
    pub fn is_pending(&self, event: &CommittedEvent) -> bool {
        self.get(event.aggregate_id.as_str())
            .is_none_or(|applied| event.aggregate_sequence > applied)
    }

    pub fn advance(&mut self, event: &CommittedEvent) {
        let applied = self.0.entry(event.aggregate_id.to_string()).or_default();
        *applied = (*applied).max(event.aggregate_sequence);
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.0.values().sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(id, sequence)| (id.as_str(), *sequence))
    }
}

/// A read model as stored, together with the version it was written at.
#[derive(Clone, Debug, PartialEq)]
pub struct ReadModelEnvelope<R> {
    pub id: String,
    pub read_model: Option<R>,
    pub version: Option<u64>,
    pub positions: StreamPositions,
}

impl<R> ReadModelEnvelope<R> {
    /// Envelope for an id with nothing stored.
    #[must_use]
    pub fn empty(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            read_model: None,
            version: None,
            positions: StreamPositions::new(),
        }
    }

    /// Envelope for a stored read model.
    #[must_use]
    pub fn stored(id: impl Into<String>, read_model: R, positions: StreamPositions) -> Self {
        Self {
            id: id.into(),
            read_model: Some(read_model),
            version: Some(positions.version()),
            positions,
        }
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.read_model.is_some()
    }
}

#[derive(Debug, Error)]
pub enum WriteError<StoreError> {
    #[error("read model `{id}` is stale: expected version {expected:?}, found {actual:?}")]
    Stale {
        id: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },
    #[error(transparent)]
    Store(StoreError),
}

/// Persistence for one read model type.
pub trait ReadModelStore<R: ReadModel>: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn get<'a>(
        &'a self,
        id: &'a str,
    ) -> impl Future<Output = Result<ReadModelEnvelope<R>, Self::Error>> + Send + 'a;

    /// Write `read_model` with its `positions` if the stored version still
    /// equals `expected_version` (`None` meaning "not stored"). The new
    /// version is [`StreamPositions::version`].
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::Stale`] when another writer got there first.
    fn put<'a>(
        &'a self,
        id: &'a str,
        read_model: R,
        positions: StreamPositions,
        expected_version: Option<u64>,
    ) -> impl Future<Output = Result<(), WriteError<Self::Error>>> + Send + 'a;

    /// Remove a read model. Removing a missing id is not an error.
    fn delete<'a>(&'a self, id: &'a str)
    -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

    /// Remove every read model of this type.
    fn delete_all(&self) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;
}

/// Events destined for one read model id, in commit order.
#[derive(Clone, Debug, PartialEq)]
pub struct ReadModelUpdate {
    pub read_model_id: String,
    pub events: Vec<CommittedEvent>,
}

/// Result of folding an update into a stored envelope.
#[derive(Clone, Debug, PartialEq)]
pub enum Applied<R> {
    Unchanged,
    Write {
        read_model: R,
        positions: StreamPositions,
    },
    Delete,
}

type Handler<R, C> = Box<
    dyn Fn(&mut R, &CommittedEvent, &C) -> Result<ApplyOutcome, <C as Codec>::Error> + Send + Sync,
>;

type Locator = Box<dyn Fn(&CommittedEvent) -> Vec<String> + Send + Sync>;

/// Handler table and routing for one read model type.
pub struct ReadModelDefinition<R, C = JsonCodec>
where
    C: Codec,
{
    codec: C,
    /// Event key -> handler mapping for O(1) dispatch.
    handlers: HashMap<EventKey, Handler<R, C>>,
    locator: Locator,
}

impl<R: ReadModel> ReadModelDefinition<R> {
    #[must_use]
    pub fn builder() -> ReadModelDefinitionBuilder<R> {
        ReadModelDefinitionBuilder::new(JsonCodec)
    }
}

impl<R, C> ReadModelDefinition<R, C>
where
    R: ReadModel,
    C: Codec,
{
    #[must_use]
    pub fn builder_with_codec(codec: C) -> ReadModelDefinitionBuilder<R, C> {
        ReadModelDefinitionBuilder::new(codec)
    }

    pub fn handled_keys(&self) -> impl Iterator<Item = &EventKey> {
        self.handlers.keys()
    }

    #[must_use]
    pub fn handles(&self, event: &CommittedEvent) -> bool {
        EventKey::of(event).is_some_and(|key| self.handlers.contains_key(&key))
    }

    /// Read model ids an event is routed to.
    #[must_use]
    pub fn locate(&self, event: &CommittedEvent) -> Vec<String> {
        (self.locator)(event)
    }

    /// Group the handled events of a batch by read model id.
    ///
    /// Ids keep the order of their first event; each update keeps commit
    /// order.
    #[must_use]
    pub fn plan(&self, events: &[CommittedEvent]) -> Vec<ReadModelUpdate> {
        let mut updates: Vec<ReadModelUpdate> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for event in events.iter().filter(|event| self.handles(event)) {
            for id in self.locate(event) {
                let slot = *index.entry(id.clone()).or_insert_with(|| {
                    updates.push(ReadModelUpdate {
                        read_model_id: id,
                        events: Vec::new(),
                    });
                    updates.len() - 1
                });
                updates[slot].events.push(event.clone());
            }
        }
        updates
    }

    /// Fold `events` into the stored envelope.
    ///
    /// Events the envelope has already applied are skipped. Returns
    /// [`Applied::Unchanged`] when nothing new was applied.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerDecodeError`] if a handled event cannot be decoded.
    pub fn apply(
        &self,
        envelope: &ReadModelEnvelope<R>,
        events: &[CommittedEvent],
    ) -> Result<Applied<R>, HandlerDecodeError<C::Error>> {
        let mut read_model = envelope.read_model.clone().unwrap_or_default();
        let mut positions = envelope.positions.clone();
        let mut modified = false;

        for event in events {
            let Some(key) = EventKey::of(event) else {
                continue;
            };
            let Some(handler) = self.handlers.get(&key) else {
                continue;
            };
            if !positions.is_pending(event) {
                tracing::trace!(
                    aggregate_id = %event.aggregate_id,
                    aggregate_sequence = event.aggregate_sequence,
                    "event already applied"
                );
                continue;
            }
            let outcome = handler(&mut read_model, event, &self.codec)
                .map_err(|source| HandlerDecodeError::new(key, event, source))?;
            match outcome {
                ApplyOutcome::Unchanged => {}
                ApplyOutcome::Modified => modified = true,
                ApplyOutcome::Delete => return Ok(Applied::Delete),
            }
            positions.advance(event);
        }

        Ok(if modified {
            Applied::Write {
                read_model,
                positions,
            }
        } else {
            Applied::Unchanged
        })
    }
}

impl<R, C: Codec> fmt::Debug for ReadModelDefinition<R, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadModelDefinition")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Builder for [`ReadModelDefinition`].
///
/// ```ignore
/// let definition = ReadModelDefinition::<AccountSummary>::builder()
///     .on::<Account, FundsDeposited>()
///     .on::<Account, FundsWithdrawn>()
///     .build()?;
/// ```
pub struct ReadModelDefinitionBuilder<R, C = JsonCodec>
where
    C: Codec,
{
    codec: C,
    handlers: HashMap<EventKey, Handler<R, C>>,
    locator: Option<Locator>,
    errors: Vec<DefinitionError>,
}

impl<R, C> ReadModelDefinitionBuilder<R, C>
where
    R: ReadModel,
    C: Codec,
{
    fn new(codec: C) -> Self {
        Self {
            codec,
            handlers: HashMap::new(),
            locator: None,
            errors: Vec::new(),
        }
    }

    /// Handle `T` events from aggregate `A` with `R`'s [`ApplyReadModel`]
    /// impl.
    #[must_use]
    pub fn on<A, T>(self) -> Self
    where
        A: Aggregate,
        T: DomainEvent,
        R: ApplyReadModel<T>,
    {
        self.on_with::<A, T, _>(|read_model: &mut R, envelope: &EventEnvelope<T>| {
            read_model.apply_event(envelope)
        })
    }

    /// Handle `T` events from aggregate `A` with a closure.
    #[must_use]
    pub fn on_with<A, T, F>(mut self, handler: F) -> Self
    where
        A: Aggregate,
        T: DomainEvent,
        F: Fn(&mut R, &EventEnvelope<T>) -> ApplyOutcome + Send + Sync + 'static,
    {
        let key = match handler_key::<A, T, C>(&self.codec) {
            Ok(key) => key,
            Err(error) => {
                self.errors.push(error);
                return self;
            }
        };
        if self.handlers.contains_key(&key) {
            self.errors.push(DefinitionError::DuplicateHandler(key));
            return self;
        }
        self.handlers.insert(
            key,
            Box::new(move |read_model, event, codec| {
                let payload = codec.deserialize::<T>(&event.data)?;
                Ok(handler(read_model, &EventEnvelope::from_committed(event, payload)))
            }),
        );
        self
    }

    /// Route events to read model ids. Defaults to the aggregate id.
    #[must_use]
    pub fn locate_by<F>(mut self, locator: F) -> Self
    where
        F: Fn(&CommittedEvent) -> Vec<String> + Send + Sync + 'static,
    {
        self.locator = Some(Box::new(locator));
        self
    }

    /// # Errors
    ///
    /// Returns the first [`DefinitionError`] recorded while registering
    /// handlers, or [`DefinitionError::NoHandlers`] if none were registered.
    pub fn build(self) -> Result<ReadModelDefinition<R, C>, DefinitionError> {
        if let Some(error) = self.errors.into_iter().next() {
            return Err(error);
        }
        if self.handlers.is_empty() {
            return Err(DefinitionError::NoHandlers);
        }
        Ok(ReadModelDefinition {
            codec: self.codec,
            handlers: self.handlers,
            locator: self
                .locator
                .unwrap_or_else(|| Box::new(|event| vec![event.aggregate_id.to_string()])),
        })
    }
}

#[derive(Debug, Error)]
pub enum ProjectionError<StoreError, CodecError> {
    #[error(transparent)]
    Decode(#[from] HandlerDecodeError<CodecError>),
    #[error("read model `{id}` still stale after {attempts} attempt(s)")]
    Stale { id: String, attempts: u32 },
    #[error("read model store error: {0}")]
    Store(#[source] StoreError),
    #[error("projection cancelled")]
    Cancelled,
}

/// What to do with a failed read model update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Log and move on; the update is counted as absorbed.
    Absorb,
    /// Report the failure to the caller.
    Raise,
}

/// Decides whether a failed update is fatal. Other updates in the batch run
/// either way.
pub trait ProjectionErrorHandler: Send + Sync {
    fn on_error(
        &self,
        read_model: &str,
        read_model_id: &str,
        error: &(dyn std::error::Error + 'static),
    ) -> ErrorDisposition;
}

impl<F> ProjectionErrorHandler for F
where
    F: Fn(&str, &str, &(dyn std::error::Error + 'static)) -> ErrorDisposition + Send + Sync,
{
    fn on_error(
        &self,
        read_model: &str,
        read_model_id: &str,
        error: &(dyn std::error::Error + 'static),
    ) -> ErrorDisposition {
        self(read_model, read_model_id, error)
    }
}

/// Raise every failure.
#[derive(Clone, Copy, Debug, Default)]
pub struct RaiseErrors;

impl ProjectionErrorHandler for RaiseErrors {
    fn on_error(
        &self,
        _: &str,
        _: &str,
        _: &(dyn std::error::Error + 'static),
    ) -> ErrorDisposition {
        ErrorDisposition::Raise
    }
}

#[derive(Debug, Error)]
#[error("read model `{read_model}/{read_model_id}` failed: {source}")]
pub struct ProjectionFailure {
    pub read_model: String,
    pub read_model_id: String,
    #[source]
    pub source: BoxError,
}

#[derive(Debug, Error)]
#[error("{} read model update(s) failed: {}", .failures.len(), summarize(.failures))]
pub struct ProjectionFailures {
    pub failures: Vec<ProjectionFailure>,
    /// Counts for the updates that did go through.
    pub report: ProjectionReport,
}

fn summarize(failures: &[ProjectionFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}/{}", f.read_model, f.read_model_id))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProjectionReport {
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub absorbed: usize,
}

impl ProjectionReport {
    pub fn merge(&mut self, other: Self) {
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.unchanged += other.unchanged;
        self.absorbed += other.absorbed;
    }

    fn record(&mut self, outcome: UpdateOutcome) {
        match outcome {
            UpdateOutcome::Updated { .. } => self.updated += 1,
            UpdateOutcome::Deleted => self.deleted += 1,
            UpdateOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated { version: u64 },
    Deleted,
    Unchanged,
}

#[derive(Debug, Error)]
pub enum PopulateError<LogError> {
    #[error("failed to read the event log: {0}")]
    Log(#[source] LogError),
    #[error(transparent)]
    Projection(#[from] ProjectionFailures),
    #[error("populate cancelled")]
    Cancelled,
}

/// Keeps one read model type up to date.
pub struct ReadModelProjector<R, S, C = JsonCodec>
where
    R: ReadModel,
    S: ReadModelStore<R>,
    C: Codec,
{
    definition: Arc<ReadModelDefinition<R, C>>,
    store: S,
    retry: RetryPolicy,
    errors: Arc<dyn ProjectionErrorHandler>,
}

impl<R, S, C> ReadModelProjector<R, S, C>
where
    R: ReadModel,
    S: ReadModelStore<R>,
    C: Codec,
{
    #[must_use]
    pub fn new(definition: impl Into<Arc<ReadModelDefinition<R, C>>>, store: S) -> Self {
        Self {
            definition: definition.into(),
            store,
            retry: RetryPolicy::read_model_default(),
            errors: Arc::new(RaiseErrors),
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_error_handler(mut self, handler: impl ProjectionErrorHandler + 'static) -> Self {
        self.errors = Arc::new(handler);
        self
    }

    pub fn definition(&self) -> &ReadModelDefinition<R, C> {
        &self.definition
    }

    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Project a committed batch.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionFailures`] listing every update the error handler
    /// raised. Updates for other ids are still applied.
    pub async fn apply_events(
        &self,
        events: &[CommittedEvent],
        cancel: &CancellationToken,
    ) -> Result<ProjectionReport, ProjectionFailures> {
        let updates = self.definition.plan(events);
        self.update_read_models(&updates, cancel).await
    }

    /// Apply a set of planned updates, isolating failures per read model id.
    ///
    /// # Errors
    ///
    /// See [`apply_events`](Self::apply_events).
    #[tracing::instrument(skip_all, fields(read_model = R::KIND, updates = updates.len()))]
    pub async fn update_read_models(
        &self,
        updates: &[ReadModelUpdate],
        cancel: &CancellationToken,
    ) -> Result<ProjectionReport, ProjectionFailures> {
        let mut report = ProjectionReport::default();
        let mut failures = Vec::new();

        for update in updates {
            match self.update_read_model(update, cancel).await {
                Ok(outcome) => report.record(outcome),
                Err(error) => {
                    let disposition = self.errors.on_error(R::KIND, &update.read_model_id, &error);
                    match disposition {
                        ErrorDisposition::Absorb => {
                            tracing::warn!(
                                read_model_id = %update.read_model_id,
                                error = %error,
                                "read model update failed; absorbed"
                            );
                            report.absorbed += 1;
                        }
                        ErrorDisposition::Raise => {
                            tracing::error!(
                                read_model_id = %update.read_model_id,
                                error = %error,
                                "read model update failed"
                            );
                            failures.push(ProjectionFailure {
                                read_model: R::KIND.to_owned(),
                                read_model_id: update.read_model_id.clone(),
                                source: Box::new(error),
                            });
                        }
                    }
                }
            }
        }

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(ProjectionFailures { failures, report })
        }
    }

    /// Load, fold and write back a single read model, retrying when another
    /// writer moved it first.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Stale`] once the retry policy is
    /// exhausted, or the decode/store error that stopped the update.
    pub async fn update_read_model(
        &self,
        update: &ReadModelUpdate,
        cancel: &CancellationToken,
    ) -> Result<UpdateOutcome, ProjectionError<S::Error, C::Error>> {
        let id = update.read_model_id.as_str();
        let mut retries = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(ProjectionError::Cancelled);
            }
            let envelope = self.store.get(id).await.map_err(ProjectionError::Store)?;
            let expected = envelope.version;

            let (read_model, positions) = match self.definition.apply(&envelope, &update.events)? {
                Applied::Unchanged => return Ok(UpdateOutcome::Unchanged),
                Applied::Delete => {
                    if cancel.is_cancelled() {
                        return Err(ProjectionError::Cancelled);
                    }
                    if envelope.exists() {
                        self.store.delete(id).await.map_err(ProjectionError::Store)?;
                    }
                    tracing::debug!(read_model_id = id, "read model deleted");
                    return Ok(UpdateOutcome::Deleted);
                }
                Applied::Write {
                    read_model,
                    positions,
                } => (read_model, positions),
            };

            if cancel.is_cancelled() {
                return Err(ProjectionError::Cancelled);
            }
            let version = positions.version();
            match self.store.put(id, read_model, positions, expected).await {
                Ok(()) => {
                    tracing::trace!(read_model_id = id, version, "read model written");
                    return Ok(UpdateOutcome::Updated { version });
                }
                Err(WriteError::Store(error)) => return Err(ProjectionError::Store(error)),
                Err(WriteError::Stale { actual, .. }) => {
                    retries += 1;
                    if !self.retry.allows(retries) {
                        return Err(ProjectionError::Stale {
                            id: id.to_owned(),
                            attempts: retries,
                        });
                    }
                    tracing::debug!(
                        read_model_id = id,
                        ?expected,
                        ?actual,
                        retry = retries,
                        "stale read model; reloading"
                    );
                    if !self.retry.backoff(retries, cancel).await {
                        return Err(ProjectionError::Cancelled);
                    }
                }
            }
        }
    }

    /// Rebuild from the whole log, one page at a time.
    ///
    /// Does not clear existing state; call [`purge`](Self::purge) first for a
    /// from-scratch rebuild.
    ///
    /// # Errors
    ///
    /// Stops at the first page that fails to read or project.
    #[tracing::instrument(skip_all, fields(read_model = R::KIND, page_size = page_size))]
    pub async fn populate<L: EventLog>(
        &self,
        log: &L,
        page_size: usize,
        cancel: &CancellationToken,
    ) -> Result<ProjectionReport, PopulateError<L::Error>> {
        let page_size = page_size.max(1);
        let mut cursor = GlobalPosition::START;
        let mut report = ProjectionReport::default();

        loop {
            if cancel.is_cancelled() {
                return Err(PopulateError::Cancelled);
            }
            let page = log
                .load_all_events_page(cursor, page_size)
                .await
                .map_err(PopulateError::Log)?;
            if page.is_empty() {
                break;
            }
            report.merge(self.apply_events(&page.events, cancel).await?);
            cursor = page.next;
            if page.len() < page_size {
                break;
            }
        }

        tracing::info!(
            updated = report.updated,
            deleted = report.deleted,
            "read model populated"
        );
        Ok(report)
    }

    /// Delete every stored read model of this type.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Cancelled`] without touching the store if
    /// `cancel` has fired, otherwise the store error.
    pub async fn purge(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), ProjectionError<S::Error, C::Error>> {
        if cancel.is_cancelled() {
            return Err(ProjectionError::Cancelled);
        }
        tracing::info!(read_model = R::KIND, "purging read models");
        self.store.delete_all().await.map_err(ProjectionError::Store)
    }
}

/// Object-safe view of a projector, so one manager can drive read models of
/// different types.
#[async_trait]
pub trait ProjectionTarget: Send + Sync {
    fn name(&self) -> &str;

    async fn project(
        &self,
        events: &[CommittedEvent],
        cancel: &CancellationToken,
    ) -> Result<ProjectionReport, ProjectionFailures>;
}

#[async_trait]
impl<R, S, C> ProjectionTarget for ReadModelProjector<R, S, C>
where
    R: ReadModel,
    S: ReadModelStore<R>,
    C: Codec,
{
    fn name(&self) -> &str {
        R::KIND
    }

    async fn project(
        &self,
        events: &[CommittedEvent],
        cancel: &CancellationToken,
    ) -> Result<ProjectionReport, ProjectionFailures> {
        self.apply_events(events, cancel).await
    }
}

/// Drives every registered read model from committed batches.
#[derive(Clone, Default)]
pub struct ProjectionManager {
    targets: Vec<Arc<dyn ProjectionTarget>>,
}

impl ProjectionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_projector(self, target: impl ProjectionTarget + 'static) -> Self {
        self.with_shared_projector(Arc::new(target))
    }

    #[must_use]
    pub fn with_shared_projector(mut self, target: Arc<dyn ProjectionTarget>) -> Self {
        self.targets.push(target);
        self
    }

    #[must_use]
    pub fn projector_count(&self) -> usize {
        self.targets.len()
    }

    /// Project a batch into every read model.
    ///
    /// # Errors
    ///
    /// Returns the combined failures of all projectors. A failing projector
    /// does not stop the others.
    pub async fn apply(
        &self,
        events: &[CommittedEvent],
        cancel: &CancellationToken,
    ) -> Result<ProjectionReport, ProjectionFailures> {
        let mut report = ProjectionReport::default();
        let mut failures = Vec::new();
        for target in &self.targets {
            match target.project(events, cancel).await {
                Ok(r) => report.merge(r),
                Err(e) => {
                    report.merge(e.report);
                    failures.extend(e.failures);
                }
            }
        }
        if failures.is_empty() {
            Ok(report)
        } else {
            Err(ProjectionFailures { failures, report })
        }
    }
}

#[async_trait]
impl EventSubscriber for ProjectionManager {
    fn name(&self) -> &str {
        "projection-manager"
    }

    async fn handle(
        &self,
        events: &[CommittedEvent],
        cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        self.apply(events, cancel).await?;
        Ok(())
    }
}
