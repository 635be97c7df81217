//! Post-commit event delivery.
//!
//! After a successful commit the repository hands the committed batch to an
//! [`EventPublisher`], which forwards it to every registered
//! [`EventSubscriber`] (projection managers, saga coordinators, outboxes)
//! and then records a publish acknowledgement. Batches whose acknowledgement
//! never lands are found and redelivered by the
//! [`PublishRecoveryLoop`](crate::recovery::PublishRecoveryLoop).

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    recovery::{PublishAckLog, PublishVerificationItem},
    store::CommittedEvent,
};

/// Boxed error used where heterogeneous failures are collected.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Receives committed batches.
///
/// Delivery is at-least-once: the same batch may arrive again after a crash
/// or a failed acknowledgement, so handlers must be idempotent.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Name used in logs and error reports.
    fn name(&self) -> &str;

    async fn handle(
        &self,
        events: &[CommittedEvent],
        cancel: &CancellationToken,
    ) -> Result<(), BoxError>;
}

#[derive(Debug, Error)]
#[error("subscriber `{subscriber}` failed: {source}")]
pub struct SubscriberFailure {
    pub subscriber: String,
    #[source]
    pub source: BoxError,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("{} subscriber(s) failed: {}", .0.len(), summarize(.0))]
    Subscribers(Vec<SubscriberFailure>),
    #[error("failed to record publish acknowledgement: {0}")]
    Acknowledge(#[source] BoxError),
}

fn summarize(failures: &[SubscriberFailure]) -> String {
    failures
        .iter()
        .map(|f| f.subscriber.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
trait AckSink: Send + Sync {
    async fn record(&self, item: PublishVerificationItem) -> Result<(), BoxError>;
}

#[async_trait]
impl<T> AckSink for T
where
    T: PublishAckLog + 'static,
{
    async fn record(&self, item: PublishVerificationItem) -> Result<(), BoxError> {
        PublishAckLog::record(self, item).await.map_err(Into::into)
    }
}

/// Fans committed batches out to subscribers.
#[derive(Clone, Default)]
pub struct EventPublisher {
    subscribers: Vec<Arc<dyn EventSubscriber>>,
    acks: Option<Arc<dyn AckSink>>,
}

impl EventPublisher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_subscriber(mut self, subscriber: impl EventSubscriber + 'static) -> Self {
        self.subscribers.push(Arc::new(subscriber));
        self
    }

    #[must_use]
    pub fn with_shared_subscriber(mut self, subscriber: Arc<dyn EventSubscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    /// Record an acknowledgement in `acks` after each fully delivered batch.
    #[must_use]
    pub fn with_ack_log<A>(mut self, acks: A) -> Self
    where
        A: PublishAckLog + 'static,
    {
        self.acks = Some(Arc::new(acks));
        self
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Deliver `events` to every subscriber, in registration order.
    ///
    /// A failing subscriber does not stop delivery to the others. The
    /// acknowledgement is only recorded when every subscriber succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Subscribers`] listing each failed subscriber,
    /// or [`PublishError::Acknowledge`] if the ack log write failed.
    #[tracing::instrument(skip_all, fields(event_count = events.len()))]
    pub async fn publish(
        &self,
        events: &[CommittedEvent],
        cancel: &CancellationToken,
    ) -> Result<(), PublishError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut failures = Vec::new();
        for subscriber in &self.subscribers {
            if let Err(source) = subscriber.handle(events, cancel).await {
                tracing::warn!(
                    subscriber = subscriber.name(),
                    error = %source,
                    "subscriber failed"
                );
                failures.push(SubscriberFailure {
                    subscriber: subscriber.name().to_owned(),
                    source,
                });
            }
        }
        if !failures.is_empty() {
            return Err(PublishError::Subscribers(failures));
        }

        if let Some(acks) = &self.acks {
            for item in PublishVerificationItem::covering(events) {
                acks.record(item)
                    .await
                    .map_err(PublishError::Acknowledge)?;
            }
        }
        tracing::debug!("batch published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use uuid::Uuid;

    use super::*;
    use crate::{identity::Identity, metadata::Metadata, recovery::inmemory::AckLog};

    fn event(id: &str, sequence: u64, global: u64) -> CommittedEvent {
        CommittedEvent {
            aggregate_id: Identity::new(id),
            aggregate_sequence: sequence,
            global_sequence: global,
            batch_id: Uuid::nil(),
            data: Vec::new(),
            metadata: Metadata::new(),
        }
    }

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl EventSubscriber for Arc<Recording> {
        fn name(&self) -> &str {
            "recording"
        }

        async fn handle(
            &self,
            events: &[CommittedEvent],
            _: &CancellationToken,
        ) -> Result<(), BoxError> {
            self.seen
                .lock()
                .unwrap()
                .extend(events.iter().map(|e| e.global_sequence));
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventSubscriber for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn handle(
            &self,
            _: &[CommittedEvent],
            _: &CancellationToken,
        ) -> Result<(), BoxError> {
            Err("boom".into())
        }
    }

    #[tokio::test]
    async fn delivers_and_acknowledges() {
        let recording = Arc::new(Recording::default());
        let acks = AckLog::new();
        let publisher = EventPublisher::new()
            .with_subscriber(recording.clone())
            .with_ack_log(acks.clone());

        publisher
            .publish(&[event("a", 1, 1), event("a", 2, 2)], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*recording.seen.lock().unwrap(), vec![1, 2]);
        let pending = PublishAckLog::pending(&acks, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!((pending[0].from_sequence, pending[0].to_sequence), (1, 2));
    }

    #[tokio::test]
    async fn failure_is_reported_but_other_subscribers_still_run() {
        let recording = Arc::new(Recording::default());
        let acks = AckLog::new();
        let publisher = EventPublisher::new()
            .with_subscriber(Failing)
            .with_subscriber(recording.clone())
            .with_ack_log(acks.clone());

        let err = publisher
            .publish(&[event("a", 1, 1)], &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(&err, PublishError::Subscribers(f) if f.len() == 1));
        assert!(err.to_string().contains("failing"));
        assert_eq!(*recording.seen.lock().unwrap(), vec![1]);
        assert!(PublishAckLog::pending(&acks, 10).await.unwrap().is_empty());
    }
}
