//! Event-driven sagas.
//!
//! A saga is an aggregate whose input is other aggregates' events. Its
//! [`SagaDefinition`] says which events start it and which it handles once
//! running, and how to find the saga id for an event. The
//! [`SagaCoordinator`] loads the saga, checks the event is valid for its
//! current [`SagaState`], runs the handler, commits the saga's own events
//! through the [`Repository`], and only then sends the commands the handler
//! queued.
//!
//! Each routed event is committed under a source id derived from the event
//! itself, so redelivering a batch neither re-runs handlers nor re-sends
//! commands.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    aggregate::{Aggregate, AggregateRoot},
    codec::{Codec, JsonCodec},
    concurrency::ConcurrencyConflict,
    event::{
        DefinitionError, DomainEvent, EventEnvelope, EventKey, HandlerDecodeError, handler_key,
    },
    identity::{Identity, SourceId},
    publisher::{BoxError, EventSubscriber, PublishError},
    repository::{LoadError, Repository, UpdateError},
    store::{CommittedEvent, EventLog},
};

/// Lifecycle of a saga instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SagaState {
    /// No events yet.
    New,
    Running,
    /// Terminal. No further events are accepted.
    Completed,
}

impl fmt::Display for SagaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::New => "new",
            Self::Running => "running",
            Self::Completed => "completed",
        })
    }
}

/// An aggregate that reacts to events and issues commands.
pub trait Saga: Aggregate {
    type Command: fmt::Debug + Send + Sync + 'static;

    /// Event recorded when a start trigger is accepted.
    fn started() -> Self::Event;

    /// True once the saga has reached its terminal state.
    fn is_completed(&self) -> bool;
}

impl<S: Saga> AggregateRoot<S> {
    #[must_use]
    pub fn saga_state(&self) -> SagaState {
        if self.is_new() {
            SagaState::New
        } else if self.state().is_completed() {
            SagaState::Completed
        } else {
            SagaState::Running
        }
    }
}

/// How a registered event relates to the saga lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SagaTrigger {
    /// Accepted only while the saga is [`SagaState::New`].
    StartedBy,
    /// Accepted only while the saga is [`SagaState::Running`].
    Handles,
}

/// What a saga handler can see and do.
pub struct SagaContext<'a, S: Saga> {
    root: &'a mut AggregateRoot<S>,
    commands: &'a mut Vec<S::Command>,
}

impl<S: Saga> SagaContext<'_, S> {
    pub fn id(&self) -> &Identity {
        self.root.id()
    }

    pub fn state(&self) -> &S {
        self.root.state()
    }

    #[must_use]
    pub fn saga_state(&self) -> SagaState {
        self.root.saga_state()
    }

    /// Record a saga event. It is applied at once and committed with the
    /// rest of the batch.
    pub fn emit(&mut self, event: impl Into<S::Event>) {
        self.root.emit(event);
    }

    /// Queue a command. It is sent only after the saga's events commit.
    pub fn publish(&mut self, command: impl Into<S::Command>) {
        self.commands.push(command.into());
    }

    #[must_use]
    pub fn queued_commands(&self) -> &[S::Command] {
        self.commands
    }
}

/// Why a saga refused an event.
#[derive(Debug, Error)]
pub enum SagaFault<DomainError, CodecError> {
    #[error("saga `{saga_id}` cannot accept `{key}` while {state}")]
    InvalidState {
        saga_id: Identity,
        key: EventKey,
        state: SagaState,
    },
    #[error("saga rejected event: {0}")]
    Domain(DomainError),
    #[error(transparent)]
    Decode(HandlerDecodeError<CodecError>),
}

type SagaHandler<S, C> = Box<
    dyn Fn(
            &mut SagaContext<'_, S>,
            &CommittedEvent,
            &C,
        ) -> Result<(), SagaFault<<S as Aggregate>::Error, <C as Codec>::Error>>
        + Send
        + Sync,
>;

type SagaLocator = Box<dyn Fn(&CommittedEvent) -> Option<Identity> + Send + Sync>;

/// Immutable trigger table for one saga type, built once at startup.
pub struct SagaDefinition<S, C = JsonCodec>
where
    S: Saga,
    C: Codec,
{
    codec: C,
    handlers: HashMap<EventKey, (SagaTrigger, SagaHandler<S, C>)>,
    locator: SagaLocator,
}

impl<S: Saga> SagaDefinition<S> {
    /// Start a definition. `locator` maps an event to the saga instance it
    /// belongs to; events it maps to `None` are ignored.
    #[must_use]
    pub fn builder<F>(locator: F) -> SagaDefinitionBuilder<S>
    where
        F: Fn(&CommittedEvent) -> Option<Identity> + Send + Sync + 'static,
    {
        SagaDefinitionBuilder::new(JsonCodec, Box::new(locator))
    }
}

impl<S, C> SagaDefinition<S, C>
where
    S: Saga,
    C: Codec,
{
    #[must_use]
    pub fn builder_with_codec<F>(codec: C, locator: F) -> SagaDefinitionBuilder<S, C>
    where
        F: Fn(&CommittedEvent) -> Option<Identity> + Send + Sync + 'static,
    {
        SagaDefinitionBuilder::new(codec, Box::new(locator))
    }

    #[must_use]
    pub fn trigger_for(&self, event: &CommittedEvent) -> Option<SagaTrigger> {
        let key = EventKey::of(event)?;
        self.handlers.get(&key).map(|(trigger, _)| *trigger)
    }

    #[must_use]
    pub fn locate(&self, event: &CommittedEvent) -> Option<Identity> {
        (self.locator)(event)
    }

    /// Check the event against the saga's state and run its handler.
    fn dispatch(
        &self,
        root: &mut AggregateRoot<S>,
        event: &CommittedEvent,
        commands: &mut Vec<S::Command>,
    ) -> Result<(), SagaFault<S::Error, C::Error>> {
        let Some(key) = EventKey::of(event) else {
            return Ok(());
        };
        let Some((trigger, handler)) = self.handlers.get(&key) else {
            return Ok(());
        };

        match (trigger, root.saga_state()) {
            (SagaTrigger::StartedBy, SagaState::New) => root.emit(S::started()),
            (SagaTrigger::Handles, SagaState::Running) => {}
            (_, state) => {
                return Err(SagaFault::InvalidState {
                    saga_id: root.id().clone(),
                    key,
                    state,
                });
            }
        }

        let mut context = SagaContext { root, commands };
        handler(&mut context, event, &self.codec)
    }
}

impl<S: Saga, C: Codec> fmt::Debug for SagaDefinition<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let triggers: Vec<_> = self
            .handlers
            .iter()
            .map(|(key, (trigger, _))| (key, trigger))
            .collect();
        f.debug_struct("SagaDefinition")
            .field("saga", &S::KIND)
            .field("triggers", &triggers)
            .finish_non_exhaustive()
    }
}

/// Builder for [`SagaDefinition`].
///
/// ```ignore
/// let definition = SagaDefinition::<Fulfilment>::builder(|event| {
///         Some(Identity::new(format!("fulfilment-{}", event.aggregate_id)))
///     })
///     .started_by::<Order, OrderPlaced>(|saga, event| {
///         saga.publish(FulfilmentCommand::Charge { order: event.aggregate_id.clone() });
///         Ok(())
///     })
///     .handles::<Payment, PaymentCharged>(|saga, _| {
///         saga.emit(FulfilmentCompleted);
///         Ok(())
///     })
///     .build()?;
/// ```
pub struct SagaDefinitionBuilder<S, C = JsonCodec>
where
    S: Saga,
    C: Codec,
{
    codec: C,
    handlers: HashMap<EventKey, (SagaTrigger, SagaHandler<S, C>)>,
    locator: SagaLocator,
    errors: Vec<DefinitionError>,
}

impl<S, C> SagaDefinitionBuilder<S, C>
where
    S: Saga,
    C: Codec,
{
    fn new(codec: C, locator: SagaLocator) -> Self {
        Self {
            codec,
            handlers: HashMap::new(),
            locator,
            errors: Vec::new(),
        }
    }

    /// `T` events from `A` start a new saga instance.
    #[must_use]
    pub fn started_by<A, T, F>(self, handler: F) -> Self
    where
        A: Aggregate,
        T: DomainEvent,
        F: Fn(&mut SagaContext<'_, S>, &EventEnvelope<T>) -> Result<(), S::Error>
            + Send
            + Sync
            + 'static,
    {
        self.register::<A, T, F>(SagaTrigger::StartedBy, handler)
    }

    /// `T` events from `A` are handled by a running saga.
    #[must_use]
    pub fn handles<A, T, F>(self, handler: F) -> Self
    where
        A: Aggregate,
        T: DomainEvent,
        F: Fn(&mut SagaContext<'_, S>, &EventEnvelope<T>) -> Result<(), S::Error>
            + Send
            + Sync
            + 'static,
    {
        self.register::<A, T, F>(SagaTrigger::Handles, handler)
    }

    fn register<A, T, F>(mut self, trigger: SagaTrigger, handler: F) -> Self
    where
        A: Aggregate,
        T: DomainEvent,
        F: Fn(&mut SagaContext<'_, S>, &EventEnvelope<T>) -> Result<(), S::Error>
            + Send
            + Sync
            + 'static,
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
        let decode_key = key.clone();
        let handler: SagaHandler<S, C> = Box::new(move |context, event, codec| {
            let payload = codec
                .deserialize::<T>(&event.data)
                .map_err(|source| {
                    SagaFault::Decode(HandlerDecodeError::new(decode_key.clone(), event, source))
                })?;
            handler(context, &EventEnvelope::from_committed(event, payload))
                .map_err(SagaFault::Domain)
        });
        self.handlers.insert(key, (trigger, handler));
        self
    }

    /// # Errors
    ///
    /// Returns the first registration error, [`DefinitionError::NoHandlers`]
    /// for an empty definition, or [`DefinitionError::NoStartTrigger`] if no
    /// event can start the saga.
    pub fn build(self) -> Result<SagaDefinition<S, C>, DefinitionError> {
        if let Some(error) = self.errors.into_iter().next() {
            return Err(error);
        }
        if self.handlers.is_empty() {
            return Err(DefinitionError::NoHandlers);
        }
        if !self
            .handlers
            .values()
            .any(|(trigger, _)| *trigger == SagaTrigger::StartedBy)
        {
            return Err(DefinitionError::NoStartTrigger);
        }
        Ok(SagaDefinition {
            codec: self.codec,
            handlers: self.handlers,
            locator: self.locator,
        })
    }
}

/// Transport for saga commands.
// ANCHOR: command_bus
pub trait CommandBus<Cmd>: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn publish(&self, command: Cmd) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;
}
// ANCHOR_END: command_bus

#[derive(Debug, Error)]
#[error("command channel closed")]
pub struct ChannelClosed;

/// Command bus backed by an unbounded tokio channel.
pub struct ChannelCommandBus<Cmd> {
    sender: mpsc::UnboundedSender<Cmd>,
}

impl<Cmd> ChannelCommandBus<Cmd> {
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Cmd>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl<Cmd> Clone for ChannelCommandBus<Cmd> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<Cmd: Send + 'static> CommandBus<Cmd> for ChannelCommandBus<Cmd> {
    type Error = ChannelClosed;

    async fn publish(&self, command: Cmd) -> Result<(), Self::Error> {
        self.sender.send(command).map_err(|_| ChannelClosed)
    }
}

#[derive(Debug, Error)]
#[error("command {command} from saga `{saga_id}` failed: {source}")]
pub struct FailedCommand {
    pub saga_id: Identity,
    /// `Debug` rendering of the command.
    pub command: String,
    #[source]
    pub source: BoxError,
}

/// Commands that could not be sent after their saga committed.
///
/// The saga's events are durable; only delivery of these commands failed.
#[derive(Debug, Error)]
#[error("{} saga command(s) failed to publish: {}", .failures.len(), summarize(.failures))]
pub struct CommandPublishError {
    pub failures: Vec<FailedCommand>,
}

fn summarize(failures: &[FailedCommand]) -> String {
    failures
        .iter()
        .map(|f| f.command.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Error)]
pub enum SagaError<DomainError, StoreError, CodecError>
where
    StoreError: std::error::Error + 'static,
    CodecError: std::error::Error + 'static,
{
    /// The event is not valid for the saga's state. A logic fault; retrying
    /// will not help.
    #[error("saga `{saga_id}` cannot accept `{key}` while {state}")]
    InvalidState {
        saga_id: Identity,
        key: EventKey,
        state: SagaState,
    },
    #[error("saga rejected event: {0}")]
    Domain(DomainError),
    #[error(transparent)]
    Decode(HandlerDecodeError<CodecError>),
    #[error("saga `{saga_id}` gave up after {attempts} conflicting attempts: {conflict}")]
    Conflict {
        saga_id: Identity,
        attempts: u32,
        #[source]
        conflict: ConcurrencyConflict,
    },
    #[error(transparent)]
    Load(LoadError<StoreError, CodecError>),
    #[error("failed to encode saga events: {0}")]
    Codec(#[source] CodecError),
    #[error("failed to persist saga events: {0}")]
    Store(#[source] StoreError),
    #[error("saga events committed but publishing them failed: {0}")]
    Publish(#[source] PublishError),
    #[error(transparent)]
    CommandPublish(CommandPublishError),
    #[error("saga routing cancelled")]
    Cancelled,
}

impl<D, S, C> SagaError<D, S, C>
where
    S: std::error::Error + 'static,
    C: std::error::Error + 'static,
{
    /// True for faults that redelivering the same event will not fix.
    #[must_use]
    pub const fn is_logic_fault(&self) -> bool {
        matches!(
            self,
            Self::InvalidState { .. } | Self::Domain(_) | Self::Decode(_)
        )
    }

    fn from_update(saga_id: &Identity, error: UpdateError<SagaFault<D, C>, S, C>) -> Self {
        match error {
            UpdateError::Domain(SagaFault::InvalidState {
                saga_id,
                key,
                state,
            }) => Self::InvalidState {
                saga_id,
                key,
                state,
            },
            UpdateError::Domain(SagaFault::Domain(e)) => Self::Domain(e),
            UpdateError::Domain(SagaFault::Decode(e)) => Self::Decode(e),
            UpdateError::Conflict { attempts, conflict } => Self::Conflict {
                saga_id: saga_id.clone(),
                attempts,
                conflict,
            },
            UpdateError::Load(e) => Self::Load(e),
            UpdateError::Codec(e) => Self::Codec(e),
            UpdateError::Store(e) => Self::Store(e),
            UpdateError::Publish { source, .. } => Self::Publish(source),
            UpdateError::Cancelled => Self::Cancelled,
        }
    }
}

/// Counts from one [`SagaCoordinator::route`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SagaReport {
    /// Events that reached a saga handler or were recognised as duplicates.
    pub routed: usize,
    pub commands_published: usize,
    /// Events dropped as subscriber deliveries because no redelivery could
    /// ever handle them.
    pub faulted: usize,
}

type CoordinatorError<S, L, C> =
    SagaError<<S as Aggregate>::Error, <L as EventLog>::Error, <C as Codec>::Error>;

/// Routes committed events to saga instances of type `S`.
pub struct SagaCoordinator<S, L, B, C = JsonCodec>
where
    S: Saga,
    C: Codec,
{
    definition: Arc<SagaDefinition<S, C>>,
    repository: Repository<S, L, C>,
    bus: B,
}

impl<S, L, B, C> SagaCoordinator<S, L, B, C>
where
    S: Saga,
    L: EventLog,
    B: CommandBus<S::Command>,
    C: Codec,
{
    #[must_use]
    pub fn new(
        definition: impl Into<Arc<SagaDefinition<S, C>>>,
        repository: Repository<S, L, C>,
        bus: B,
    ) -> Self {
        Self {
            definition: definition.into(),
            repository,
            bus,
        }
    }

    pub fn definition(&self) -> &SagaDefinition<S, C> {
        &self.definition
    }

    pub const fn repository(&self) -> &Repository<S, L, C> {
        &self.repository
    }

    pub const fn bus(&self) -> &B {
        &self.bus
    }

    /// Route a committed batch to the sagas it concerns, in order.
    ///
    /// Command delivery failures are collected across the batch and
    /// reported together at the end; any other error stops routing.
    ///
    /// # Errors
    ///
    /// See [`SagaError`].
    #[tracing::instrument(skip_all, fields(saga = S::KIND, events = events.len()))]
    pub async fn route(
        &self,
        events: &[CommittedEvent],
        cancel: &CancellationToken,
    ) -> Result<SagaReport, CoordinatorError<S, L, C>> {
        self.route_events(events, cancel, false).await
    }

    async fn route_events(
        &self,
        events: &[CommittedEvent],
        cancel: &CancellationToken,
        drop_logic_faults: bool,
    ) -> Result<SagaReport, CoordinatorError<S, L, C>> {
        let mut report = SagaReport::default();
        let mut failed = Vec::new();

        for event in events {
            if self.definition.trigger_for(event).is_none() {
                continue;
            }
            let Some(saga_id) = self.definition.locate(event) else {
                tracing::trace!(
                    aggregate_id = %event.aggregate_id,
                    aggregate_sequence = event.aggregate_sequence,
                    "event maps to no saga instance"
                );
                continue;
            };

            report.routed += 1;
            match self.handle_event(&saga_id, event, cancel).await {
                Ok(published) => report.commands_published += published,
                Err(SagaError::CommandPublish(error)) => {
                    tracing::warn!(saga_id = %saga_id, %error, "saga commands failed");
                    failed.extend(error.failures);
                }
                Err(error) if drop_logic_faults && error.is_logic_fault() => {
                    tracing::error!(
                        saga_id = %saga_id,
                        aggregate_id = %event.aggregate_id,
                        aggregate_sequence = event.aggregate_sequence,
                        %error,
                        "saga cannot handle event, dropping it"
                    );
                    report.faulted += 1;
                }
                Err(error) => return Err(error),
            }
        }

        if failed.is_empty() {
            Ok(report)
        } else {
            Err(SagaError::CommandPublish(CommandPublishError { failures: failed }))
        }
    }

    async fn handle_event(
        &self,
        saga_id: &Identity,
        event: &CommittedEvent,
        cancel: &CancellationToken,
    ) -> Result<usize, CoordinatorError<S, L, C>> {
        let source_id = SourceId::for_event(event);
        let definition = &*self.definition;
        let mut commands = Vec::new();

        let result = self
            .repository
            .update(
                saga_id,
                &source_id,
                |root| {
                    commands.clear();
                    definition.dispatch(root, event, &mut commands)
                },
                cancel,
            )
            .await;

        let publish_failure = match result {
            Ok(_) => None,
            Err(UpdateError::Publish { source, .. }) => Some(source),
            Err(error) => return Err(SagaError::from_update(saga_id, error)),
        };

        let published = self.flush(saga_id, commands).await;
        if let Some(source) = publish_failure {
            return Err(SagaError::Publish(source));
        }
        published
    }

    /// Send queued commands one by one, continuing past failures.
    async fn flush(
        &self,
        saga_id: &Identity,
        commands: Vec<S::Command>,
    ) -> Result<usize, CoordinatorError<S, L, C>> {
        let total = commands.len();
        let mut failures = Vec::new();
        for command in commands {
            let rendered = format!("{command:?}");
            if let Err(error) = self.bus.publish(command).await {
                tracing::error!(
                    saga_id = %saga_id,
                    command = %rendered,
                    %error,
                    "command publish failed"
                );
                failures.push(FailedCommand {
                    saga_id: saga_id.clone(),
                    command: rendered,
                    source: Box::new(error),
                });
            }
        }
        if failures.is_empty() {
            tracing::debug!(saga_id = %saga_id, commands = total, "saga commands published");
            Ok(total)
        } else {
            Err(SagaError::CommandPublish(CommandPublishError { failures }))
        }
    }
}

#[async_trait]
impl<S, L, B, C> EventSubscriber for SagaCoordinator<S, L, B, C>
where
    S: Saga,
    L: EventLog,
    B: CommandBus<S::Command>,
    C: Codec,
{
    fn name(&self) -> &str {
        S::KIND
    }

    /// Unlike [`SagaCoordinator::route`], logic faults are logged and the
    /// event counts as handled. Failing the delivery would only have the
    /// same event redelivered forever.
    async fn handle(
        &self,
        events: &[CommittedEvent],
        cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        self.route_events(events, cancel, true).await?;
        Ok(())
    }
}
