//! In-memory publish acknowledgement log.

use std::{convert::Infallible, sync::Arc};

use tokio::sync::Mutex;

use crate::{
    recovery::{PublishAckLog, PublishVerificationItem},
    store::GlobalPosition,
};

/// Ack log held in process memory. Clones share state.
#[derive(Clone, Default)]
pub struct AckLog {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    /// Kept sorted by final global sequence.
    entries: Vec<PublishVerificationItem>,
    cursor: GlobalPosition,
}

impl AckLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PublishAckLog for AckLog {
    type Error = Infallible;

    async fn record(&self, item: PublishVerificationItem) -> Result<(), Self::Error> {
        tracing::trace!(
            aggregate_id = %item.aggregate_id,
            from = item.from_sequence,
            to = item.to_sequence,
            "publish acknowledged"
        );
        let mut inner = self.inner.lock().await;
        let at = inner
            .entries
            .partition_point(|entry| entry.last_global_sequence <= item.last_global_sequence);
        inner.entries.insert(at, item);
        Ok(())
    }

    async fn acknowledged(
        &self,
        from: GlobalPosition,
        to: GlobalPosition,
    ) -> Result<Vec<PublishVerificationItem>, Self::Error> {
        let inner = self.inner.lock().await;
        let start = inner
            .entries
            .partition_point(|entry| entry.last_global_sequence < from.value());
        Ok(inner.entries[start..]
            .iter()
            .filter(|entry| entry.overlaps(from, to))
            .cloned()
            .collect())
    }

    async fn pending(&self, limit: usize) -> Result<Vec<PublishVerificationItem>, Self::Error> {
        let inner = self.inner.lock().await;
        Ok(inner.entries.iter().take(limit).cloned().collect())
    }

    async fn retire_before(&self, position: GlobalPosition) -> Result<u64, Self::Error> {
        let mut inner = self.inner.lock().await;
        let end = inner
            .entries
            .partition_point(|entry| entry.last_global_sequence < position.value());
        inner.entries.drain(..end);
        Ok(u64::try_from(end).unwrap_or(u64::MAX))
    }

    async fn verified_cursor(&self) -> Result<GlobalPosition, Self::Error> {
        Ok(self.inner.lock().await.cursor)
    }

    async fn advance_cursor(
        &self,
        from: GlobalPosition,
        to: GlobalPosition,
    ) -> Result<bool, Self::Error> {
        let mut inner = self.inner.lock().await;
        if inner.cursor != from {
            return Ok(false);
        }
        inner.cursor = to;
        Ok(true)
    }
}
