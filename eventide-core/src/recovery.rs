//! Publish verification and recovery.
//!
//! Publishing happens after the commit, so a crash in between leaves events
//! that are durable but were never delivered. Each successful publish writes
//! a [`PublishVerificationItem`] to a [`PublishAckLog`]. The
//! [`PublishRecoveryLoop`] walks the global event log behind a verified
//! cursor, matches every event against those acknowledgements, and hands
//! anything unmatched to a [`RecoveryHandler`] before the cursor may move.
//!
//! Every step is a read followed by a conditional write, so any number of
//! loops may run against the same logs.

use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    config::RecoveryConfig,
    identity::Identity,
    publisher::{BoxError, EventPublisher},
    store::{CommittedEvent, EventLog, GlobalPosition},
};

pub mod inmemory;

/// Attests that a contiguous run of one stream's events was published.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishVerificationItem {
    pub id: Uuid,
    pub aggregate_id: Identity,
    pub from_sequence: u64,
    pub to_sequence: u64,
    /// Global sequence of the first covered event.
    pub first_global_sequence: u64,
    /// Global sequence of the final covered event.
    pub last_global_sequence: u64,
}

impl PublishVerificationItem {
    #[must_use]
    pub fn new(
        aggregate_id: Identity,
        from_sequence: u64,
        to_sequence: u64,
        first_global_sequence: u64,
        last_global_sequence: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_id,
            from_sequence,
            to_sequence,
            first_global_sequence,
            last_global_sequence,
        }
    }

    /// One item per run of consecutive events from the same stream.
    #[must_use]
    pub fn covering(events: &[CommittedEvent]) -> Vec<Self> {
        let mut items: Vec<Self> = Vec::new();
        for event in events {
            match items.last_mut() {
                Some(item)
                    if item.aggregate_id == event.aggregate_id
                        && item.to_sequence + 1 == event.aggregate_sequence =>
                {
                    item.to_sequence = event.aggregate_sequence;
                    item.last_global_sequence = event.global_sequence;
                }
                _ => items.push(Self::new(
                    event.aggregate_id.clone(),
                    event.aggregate_sequence,
                    event.aggregate_sequence,
                    event.global_sequence,
                    event.global_sequence,
                )),
            }
        }
        items
    }

    #[must_use]
    pub fn covers(&self, event: &CommittedEvent) -> bool {
        self.aggregate_id == event.aggregate_id
            && (self.from_sequence..=self.to_sequence).contains(&event.aggregate_sequence)
    }

    #[must_use]
    pub fn is_final_event(&self, event: &CommittedEvent) -> bool {
        self.aggregate_id == event.aggregate_id && event.aggregate_sequence == self.to_sequence
    }

    /// Whether any covered event lies in `[from, to)` of the global order.
    #[must_use]
    pub const fn overlaps(&self, from: GlobalPosition, to: GlobalPosition) -> bool {
        self.first_global_sequence < to.value() && self.last_global_sequence >= from.value()
    }
}

/// Durable log of publish acknowledgements plus the verified cursor.
// ANCHOR: publish_ack_log_trait
pub trait PublishAckLog: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn record(
        &self,
        item: PublishVerificationItem,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

    /// Every entry covering at least one event in `[from, to)` of the
    /// global order, regardless of when it was recorded.
    fn acknowledged(
        &self,
        from: GlobalPosition,
        to: GlobalPosition,
    ) -> impl Future<Output = Result<Vec<PublishVerificationItem>, Self::Error>> + Send + '_;

    /// Unretired entries, lowest final global sequence first.
    fn pending(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<PublishVerificationItem>, Self::Error>> + Send + '_;

    /// Remove every entry whose final event lies before `position`.
    /// Returns how many were removed.
    fn retire_before(
        &self,
        position: GlobalPosition,
    ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;

    fn verified_cursor(&self)
    -> impl Future<Output = Result<GlobalPosition, Self::Error>> + Send + '_;

    /// Move the cursor from `from` to `to`. Returns `false`, changing
    /// nothing, if the cursor is no longer at `from`.
    fn advance_cursor(
        &self,
        from: GlobalPosition,
        to: GlobalPosition,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;
}
// ANCHOR_END: publish_ack_log_trait

/// Redelivers events found without an acknowledgement.
pub trait RecoveryHandler: Send + Sync {
    fn recover<'a>(
        &'a self,
        events: &'a [CommittedEvent],
        cancel: &'a CancellationToken,
    ) -> impl Future<Output = Result<(), BoxError>> + Send + 'a;
}

/// Recovers by publishing again through the normal publisher, which also
/// records the missing acknowledgements.
#[derive(Clone)]
pub struct RepublishRecovery {
    publisher: EventPublisher,
}

impl RepublishRecovery {
    #[must_use]
    pub const fn new(publisher: EventPublisher) -> Self {
        Self { publisher }
    }
}

impl RecoveryHandler for RepublishRecovery {
    async fn recover<'a>(
        &'a self,
        events: &'a [CommittedEvent],
        cancel: &'a CancellationToken,
    ) -> Result<(), BoxError> {
        self.publisher
            .publish(events, cancel)
            .await
            .map_err(Into::into)
    }
}

/// Result of one verification pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// The cursor reached the end of the log.
    CaughtUp,
    /// The cursor advanced a full page; more may follow.
    MorePages,
    /// Unacknowledged events were handed to the recovery handler; the cursor
    /// did not move. Re-run promptly.
    RecoveryTriggered { unpublished: usize },
}

#[derive(Debug, Error)]
pub enum RecoveryError<LogError, AckError>
where
    LogError: std::error::Error,
    AckError: std::error::Error,
{
    #[error("failed to read event log: {0}")]
    Log(#[source] LogError),
    #[error("publish ack log failed: {0}")]
    AckLog(#[source] AckError),
    #[error("recovery handler failed: {0}")]
    Handler(#[source] BoxError),
    #[error("verification cancelled")]
    Cancelled,
}

/// Reconciles the event log against the publish acknowledgement log.
pub struct PublishRecoveryLoop<L, A, H> {
    log: L,
    acks: A,
    handler: H,
    config: RecoveryConfig,
}

impl<L, A, H> PublishRecoveryLoop<L, A, H>
where
    L: EventLog,
    A: PublishAckLog,
    H: RecoveryHandler,
{
    #[must_use]
    pub fn new(log: L, acks: A, handler: H) -> Self {
        Self {
            log,
            acks,
            handler,
            config: RecoveryConfig::default(),
        }
    }

    #[must_use]
    pub const fn with_config(mut self, config: RecoveryConfig) -> Self {
        self.config = config;
        self
    }

    pub const fn ack_log(&self) -> &A {
        &self.acks
    }

    /// Run one verification pass.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError::Cancelled`] if `cancel` fires before the
    /// pass writes anything, or the failing collaborator's error.
    #[tracing::instrument(skip_all)]
    pub async fn verify_once(
        &self,
        cancel: &CancellationToken,
    ) -> Result<VerifyOutcome, RecoveryError<L::Error, A::Error>> {
        if cancel.is_cancelled() {
            return Err(RecoveryError::Cancelled);
        }

        let cursor = self
            .acks
            .verified_cursor()
            .await
            .map_err(RecoveryError::AckLog)?;
        let page = self
            .log
            .load_all_events_page(cursor, self.config.page_size)
            .await
            .map_err(RecoveryError::Log)?;
        if page.is_empty() {
            tracing::trace!(%cursor, "caught up");
            return Ok(VerifyOutcome::CaughtUp);
        }

        // Acks are looked up by the page's global range, not by age: an ack
        // recorded late by a recovery pass must still match its events.
        let acknowledged = self
            .acks
            .acknowledged(cursor, page.next)
            .await
            .map_err(RecoveryError::AckLog)?;

        let unpublished: Vec<CommittedEvent> = page
            .events
            .iter()
            .filter(|event| !acknowledged.iter().any(|item| item.covers(event)))
            .cloned()
            .collect();

        if !unpublished.is_empty() {
            tracing::info!(
                %cursor,
                unpublished = unpublished.len(),
                "unpublished events found, starting recovery"
            );
            if cancel.is_cancelled() {
                return Err(RecoveryError::Cancelled);
            }
            self.handler
                .recover(&unpublished, cancel)
                .await
                .map_err(RecoveryError::Handler)?;
            return Ok(VerifyOutcome::RecoveryTriggered {
                unpublished: unpublished.len(),
            });
        }

        if cancel.is_cancelled() {
            return Err(RecoveryError::Cancelled);
        }
        let advanced = self
            .acks
            .advance_cursor(cursor, page.next)
            .await
            .map_err(RecoveryError::AckLog)?;
        // Everything ending behind the new cursor has been matched, including
        // duplicates a late publish recorded after an earlier pass.
        let retired = if advanced {
            self.acks
                .retire_before(page.next)
                .await
                .map_err(RecoveryError::AckLog)?
        } else {
            0
        };
        tracing::debug!(
            from = %cursor,
            to = %page.next,
            advanced,
            retired,
            "page verified"
        );

        if page.len() < self.config.page_size {
            Ok(VerifyOutcome::CaughtUp)
        } else {
            Ok(VerifyOutcome::MorePages)
        }
    }

    /// Run passes until `cancel` fires.
    ///
    /// Sleeps for the configured interval after catching up or after a
    /// failed pass; otherwise re-runs immediately.
    pub async fn run(&self, cancel: &CancellationToken) {
        tracing::info!(
            page_size = self.config.page_size,
            interval = ?self.config.interval,
            "publish recovery loop started"
        );
        loop {
            let pause = match self.verify_once(cancel).await {
                Ok(VerifyOutcome::MorePages | VerifyOutcome::RecoveryTriggered { .. }) => false,
                Ok(VerifyOutcome::CaughtUp) => true,
                Err(RecoveryError::Cancelled) => break,
                Err(err) => {
                    tracing::error!(error = %err, "publish verification pass failed");
                    true
                }
            };
            if cancel.is_cancelled() {
                break;
            }
            if pause {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(self.config.interval) => {}
                }
            }
        }
        tracing::info!("publish recovery loop stopped");
    }
}
