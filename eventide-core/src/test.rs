//! Test utilities for event-sourced aggregates, sagas and logs.
//!
//! - [`TestFramework`]: given/when/then unit tests for aggregates in
//!   isolation.
//! - [`RepositoryTestExt`]: seed history or simulate a concurrent writer
//!   against a real repository.
//! - [`RacingLog`]: an [`EventLog`] wrapper that holds the first few commits
//!   at a barrier so that concurrent writers are guaranteed to collide.
//! - [`RecordingCommandBus`]: a command bus that records what sagas publish
//!   and can be told to fail.
//!
//! ```ignore
//! use eventide::test::TestFramework;
//!
//! #[test]
//! fn cannot_withdraw_more_than_balance() {
//!     TestFramework::<Account>::given(&[Deposited { amount: 10 }.into()])
//!         .when(&Withdraw { amount: 20 })
//!         .then_expect_error_message("insufficient funds");
//! }
//! ```

use std::{
    fmt,
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use nonempty::NonEmpty;
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;

use crate::{
    aggregate::{Aggregate, AggregateRoot, Handle},
    codec::Codec,
    identity::{Identity, SourceId},
    repository::{Repository, UpdateError},
    saga::CommandBus,
    store::{
        CommitOutcome, CommittedEvent, EventLog, EventPage, GlobalPosition, SequenceRange,
        SerializedEvent,
    },
};

// =============================================================================
// Repository Test Extension Trait
// =============================================================================

type SeedResult<L, C> = Result<
    Vec<CommittedEvent>,
    UpdateError<std::convert::Infallible, <L as EventLog>::Error, <C as Codec>::Error>,
>;

/// Fixture helpers for [`Repository`].
///
/// Both methods write through the normal update path with a fresh source id,
/// so seeded events carry the same metadata as real ones.
pub trait RepositoryTestExt<A: Aggregate, L: EventLog, C: Codec> {
    /// Append `events` to `id`, bypassing command handling.
    fn seed_events<'a>(
        &'a self,
        id: &'a Identity,
        events: Vec<A::Event>,
    ) -> impl Future<Output = SeedResult<L, C>> + Send + 'a;

    /// Append one event as if another process had written it.
    fn inject_concurrent_event<'a>(
        &'a self,
        id: &'a Identity,
        event: impl Into<A::Event> + Send + 'a,
    ) -> impl Future<Output = SeedResult<L, C>> + Send + 'a {
        let event = event.into();
        self.seed_events(id, vec![event])
    }
}

impl<A, L, C> RepositoryTestExt<A, L, C> for Repository<A, L, C>
where
    A: Aggregate,
    L: EventLog,
    C: Codec,
{
    fn seed_events<'a>(
        &'a self,
        id: &'a Identity,
        events: Vec<A::Event>,
    ) -> impl Future<Output = SeedResult<L, C>> + Send + 'a {
        async move {
            let mut pending = Some(events);
            self.update(
                id,
                &SourceId::generate(),
                |root| {
                    for event in pending.take().unwrap_or_default() {
                        root.emit(event);
                    }
                    Ok::<(), std::convert::Infallible>(())
                },
                &CancellationToken::new(),
            )
            .await
        }
    }
}

// =============================================================================
// Racing event log
// =============================================================================

/// Event log wrapper that forces concurrent writers to collide.
///
/// The first `writers` calls to [`EventLog::commit_events`] wait for each
/// other before reaching the inner log, so every one of them has already
/// loaded the stream at the same version. Later commits pass straight
/// through.
#[derive(Clone)]
pub struct RacingLog<L> {
    inner: L,
    barrier: Arc<Barrier>,
    remaining: Arc<AtomicUsize>,
}

impl<L> RacingLog<L> {
    #[must_use]
    pub fn new(inner: L, writers: usize) -> Self {
        Self {
            inner,
            barrier: Arc::new(Barrier::new(writers)),
            remaining: Arc::new(AtomicUsize::new(writers)),
        }
    }

    pub const fn inner(&self) -> &L {
        &self.inner
    }
}

impl<L: EventLog> EventLog for RacingLog<L> {
    type Error = L::Error;

    async fn commit_events<'a>(
        &'a self,
        aggregate_id: &'a Identity,
        expected_start_sequence: u64,
        events: NonEmpty<SerializedEvent>,
    ) -> CommitOutcome<Self::Error> {
        let held = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if held {
            self.barrier.wait().await;
        }
        self.inner
            .commit_events(aggregate_id, expected_start_sequence, events)
            .await
    }

    async fn load_events<'a>(
        &'a self,
        aggregate_id: &'a Identity,
        range: SequenceRange,
    ) -> Result<Vec<CommittedEvent>, Self::Error> {
        self.inner.load_events(aggregate_id, range).await
    }

    async fn load_all_events_page(
        &self,
        cursor: GlobalPosition,
        page_size: usize,
    ) -> Result<EventPage, Self::Error> {
        self.inner.load_all_events_page(cursor, page_size).await
    }

    async fn delete_stream<'a>(&'a self, aggregate_id: &'a Identity) -> Result<(), Self::Error> {
        self.inner.delete_stream(aggregate_id).await
    }
}

// =============================================================================
// Recording command bus
// =============================================================================

#[derive(Debug, thiserror::Error)]
#[error("command rejected by test bus: {0}")]
pub struct RejectedCommand(pub String);

type RejectFn<Cmd> = dyn Fn(&Cmd) -> bool + Send + Sync;

/// Command bus that keeps every accepted command in memory.
pub struct RecordingCommandBus<Cmd> {
    published: Arc<Mutex<Vec<Cmd>>>,
    reject: Option<Arc<RejectFn<Cmd>>>,
}

impl<Cmd> RecordingCommandBus<Cmd> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            published: Arc::new(Mutex::new(Vec::new())),
            reject: None,
        }
    }

    /// Fail every command for which `predicate` returns true.
    #[must_use]
    pub fn rejecting(mut self, predicate: impl Fn(&Cmd) -> bool + Send + Sync + 'static) -> Self {
        self.reject = Some(Arc::new(predicate));
        self
    }

    /// Commands accepted so far, in publish order.
    ///
    /// # Panics
    ///
    /// Panics if a publisher panicked while holding the lock.
    #[must_use]
    pub fn published(&self) -> Vec<Cmd>
    where
        Cmd: Clone,
    {
        self.published
            .lock()
            .expect("recording bus lock poisoned")
            .clone()
    }
}

impl<Cmd> Clone for RecordingCommandBus<Cmd> {
    fn clone(&self) -> Self {
        Self {
            published: Arc::clone(&self.published),
            reject: self.reject.clone(),
        }
    }
}

impl<Cmd> Default for RecordingCommandBus<Cmd> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Cmd> CommandBus<Cmd> for RecordingCommandBus<Cmd>
where
    Cmd: fmt::Debug + Send + Sync + 'static,
{
    type Error = RejectedCommand;

    async fn publish(&self, command: Cmd) -> Result<(), Self::Error> {
        if self.reject.as_ref().is_some_and(|reject| reject(&command)) {
            return Err(RejectedCommand(format!("{command:?}")));
        }
        self.published
            .lock()
            .expect("recording bus lock poisoned")
            .push(command);
        Ok(())
    }
}

// =============================================================================
// Test Framework for Aggregate Unit Testing
// =============================================================================

/// Given/when/then harness for aggregate logic.
///
/// Runs commands or mutations against an [`AggregateRoot`] rebuilt from the
/// given events, without any persistence.
pub struct TestFramework<A: Aggregate> {
    root: AggregateRoot<A>,
}

impl<A: Aggregate> TestFramework<A> {
    /// Start from a history of already-committed events.
    ///
    /// Pass `&[]` to start from a new aggregate.
    #[must_use]
    pub fn given(events: &[A::Event]) -> Self {
        let mut root = AggregateRoot::new(Identity::new("test-aggregate"));
        for event in events {
            root.emit(event.clone());
        }
        root.take_uncommitted();
        Self { root }
    }

    /// Add more history before acting.
    #[must_use]
    pub fn and(mut self, events: Vec<A::Event>) -> Self {
        for event in events {
            self.root.emit(event);
        }
        self.root.take_uncommitted();
        self
    }

    /// Run a typed command.
    #[must_use]
    pub fn when<Cmd>(self, command: &Cmd) -> TestResult<A>
    where
        A: Handle<Cmd>,
    {
        TestResult {
            result: self.root.state().handle(command),
        }
    }

    /// Run an arbitrary mutation and capture what it emitted.
    #[must_use]
    pub fn when_mutated<F>(mut self, mutate: F) -> TestResult<A>
    where
        F: FnOnce(&mut AggregateRoot<A>) -> Result<(), A::Error>,
    {
        let result = mutate(&mut self.root).map(|()| {
            self.root
                .take_uncommitted()
                .into_iter()
                .map(|pending| pending.event)
                .collect()
        });
        TestResult { result }
    }
}

/// Outcome of [`TestFramework::when`], ready for assertions.
pub struct TestResult<A: Aggregate> {
    result: Result<Vec<A::Event>, A::Error>,
}

impl<A: Aggregate> TestResult<A> {
    /// # Panics
    ///
    /// Panics if the command failed or emitted different events.
    #[track_caller]
    pub fn then_expect_events(self, expected: &[A::Event])
    where
        A::Event: PartialEq,
    {
        match self.result {
            Ok(events) => {
                assert_eq!(
                    events, expected,
                    "Expected events did not match actual events"
                );
            }
            Err(error) => panic!("Expected events but got error: {error:?}"),
        }
    }

    /// # Panics
    ///
    /// Panics if the command failed or emitted anything.
    #[track_caller]
    pub fn then_expect_no_events(self) {
        match self.result {
            Ok(events) => {
                assert!(events.is_empty(), "Expected no events but got: {events:?}");
            }
            Err(error) => panic!("Expected no events but got error: {error:?}"),
        }
    }

    /// # Panics
    ///
    /// Panics if the command succeeded.
    #[track_caller]
    pub fn then_expect_error(self) {
        if let Ok(events) = self.result {
            panic!("Expected error but got events: {events:?}");
        }
    }

    /// # Panics
    ///
    /// Panics if the command succeeded or failed with a different error.
    #[track_caller]
    pub fn then_expect_error_eq(self, expected: &A::Error)
    where
        A::Error: PartialEq,
    {
        match self.result {
            Ok(events) => panic!("Expected error but got events: {events:?}"),
            Err(error) => {
                assert_eq!(
                    error, *expected,
                    "Expected error did not match actual error"
                );
            }
        }
    }

    /// # Panics
    ///
    /// Panics if the command succeeded or the message lacks the substring.
    #[track_caller]
    pub fn then_expect_error_message(self, expected_substring: &str) {
        match self.result {
            Ok(events) => panic!("Expected error but got events: {events:?}"),
            Err(error) => {
                let error_msg = error.to_string();
                assert!(
                    error_msg.contains(expected_substring),
                    "Expected error message to contain '{expected_substring}' but got: {error_msg}"
                );
            }
        }
    }

    /// The raw result for custom assertions.
    ///
    /// # Errors
    ///
    /// Returns the aggregate's error if the command failed.
    pub fn inspect_result(self) -> Result<Vec<A::Event>, A::Error> {
        self.result
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{aggregate::Apply, event::DomainEvent, store::inmemory};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct ValueAdded {
        amount: i32,
    }

    impl DomainEvent for ValueAdded {
        const NAME: &'static str = "value-added";
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct ValueSubtracted {
        amount: i32,
    }

    impl DomainEvent for ValueSubtracted {
        const NAME: &'static str = "value-subtracted";
    }

    crate::event_set! {
        #[derive(Debug, Clone, PartialEq, Eq)]
        enum CounterEvent {
            Added(ValueAdded),
            Subtracted(ValueSubtracted),
        }
    }

    #[derive(Debug, Default)]
    struct Counter {
        value: i32,
    }

    #[derive(Debug, PartialEq, Eq, thiserror::Error)]
    enum CounterError {
        #[error("insufficient value: have {have}, need {need}")]
        Insufficient { have: i32, need: i32 },
    }

    impl Aggregate for Counter {
        const KIND: &'static str = "counter";
        type Event = CounterEvent;
        type Error = CounterError;

        fn apply(&mut self, event: &Self::Event) {
            match event {
                CounterEvent::Added(e) => Apply::apply(self, e),
                CounterEvent::Subtracted(e) => Apply::apply(self, e),
            }
        }
    }

    impl Apply<ValueAdded> for Counter {
        fn apply(&mut self, event: &ValueAdded) {
            self.value += event.amount;
        }
    }

    impl Apply<ValueSubtracted> for Counter {
        fn apply(&mut self, event: &ValueSubtracted) {
            self.value -= event.amount;
        }
    }

    struct Subtract(i32);

    impl Handle<Subtract> for Counter {
        fn handle(&self, command: &Subtract) -> Result<Vec<CounterEvent>, CounterError> {
            if self.value < command.0 {
                return Err(CounterError::Insufficient {
                    have: self.value,
                    need: command.0,
                });
            }
            Ok(vec![ValueSubtracted { amount: command.0 }.into()])
        }
    }

    #[test]
    fn given_history_then_command_emits() {
        TestFramework::<Counter>::given(&[ValueAdded { amount: 10 }.into()])
            .when(&Subtract(4))
            .then_expect_events(&[ValueSubtracted { amount: 4 }.into()]);
    }

    #[test]
    fn insufficient_value_is_rejected() {
        TestFramework::<Counter>::given(&[])
            .and(vec![ValueAdded { amount: 1 }.into()])
            .when(&Subtract(5))
            .then_expect_error_message("insufficient value");
    }

    #[test]
    fn mutation_without_emits_yields_no_events() {
        TestFramework::<Counter>::given(&[])
            .when_mutated(|_root| Ok(()))
            .then_expect_no_events();
    }

    #[test]
    fn error_eq_matches_exact_error() {
        TestFramework::<Counter>::given(&[])
            .when(&Subtract(1))
            .then_expect_error_eq(&CounterError::Insufficient { have: 0, need: 1 });
    }

    #[test]
    #[should_panic(expected = "Expected error but got events")]
    fn expecting_error_on_success_panics() {
        TestFramework::<Counter>::given(&[ValueAdded { amount: 3 }.into()])
            .when(&Subtract(1))
            .then_expect_error();
    }

    #[tokio::test]
    async fn seeded_events_load_back() {
        let repo = Repository::<Counter, _>::new(inmemory::Store::new()).unwrap();
        let id = Identity::new("c-1");
        repo.seed_events(
            &id,
            vec![ValueAdded { amount: 2 }.into(), ValueAdded { amount: 3 }.into()],
        )
        .await
        .unwrap();
        repo.inject_concurrent_event(&id, ValueSubtracted { amount: 1 })
            .await
            .unwrap();

        let root = repo.load(&id).await.unwrap();
        assert_eq!(root.state().value, 4);
        assert_eq!(root.version(), 3);
    }

    #[tokio::test]
    async fn recording_bus_records_and_rejects() {
        let bus = RecordingCommandBus::<String>::new().rejecting(|cmd| cmd == "bad");
        bus.publish("good".to_owned()).await.unwrap();
        assert!(bus.publish("bad".to_owned()).await.is_err());
        assert_eq!(bus.published(), vec!["good".to_owned()]);
    }
}
