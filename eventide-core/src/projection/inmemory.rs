//! In-memory read model store.

use std::{collections::HashMap, convert::Infallible, sync::Arc};

use tokio::sync::Mutex;

use crate::projection::{ReadModel, ReadModelEnvelope, ReadModelStore, StreamPositions, WriteError};

/// Read models held in process memory, keyed by id. Clones share state.
#[derive(Clone)]
pub struct Store<R> {
    inner: Arc<Mutex<HashMap<String, (R, StreamPositions)>>>,
}

impl<R> Default for Store<R> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<R: ReadModel> Store<R> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Every stored read model with its version, in no particular order.
    pub async fn all(&self) -> Vec<(String, R, u64)> {
        self.inner
            .lock()
            .await
            .iter()
            .map(|(id, (read_model, positions))| {
                (id.clone(), read_model.clone(), positions.version())
            })
            .collect()
    }
}

impl<R: ReadModel> ReadModelStore<R> for Store<R> {
    type Error = Infallible;

    async fn get<'a>(&'a self, id: &'a str) -> Result<ReadModelEnvelope<R>, Self::Error> {
        let inner = self.inner.lock().await;
        Ok(match inner.get(id) {
            Some((read_model, positions)) => {
                ReadModelEnvelope::stored(id, read_model.clone(), positions.clone())
            }
            None => ReadModelEnvelope::empty(id),
        })
    }

    async fn put<'a>(
        &'a self,
        id: &'a str,
        read_model: R,
        positions: StreamPositions,
        expected_version: Option<u64>,
    ) -> Result<(), WriteError<Self::Error>> {
        let mut inner = self.inner.lock().await;
        let actual = inner.get(id).map(|(_, stored)| stored.version());
        if actual != expected_version {
            return Err(WriteError::Stale {
                id: id.to_owned(),
                expected: expected_version,
                actual,
            });
        }
        inner.insert(id.to_owned(), (read_model, positions));
        Ok(())
    }

    async fn delete<'a>(&'a self, id: &'a str) -> Result<(), Self::Error> {
        self.inner.lock().await.remove(id);
        Ok(())
    }

    async fn delete_all(&self) -> Result<(), Self::Error> {
        self.inner.lock().await.clear();
        Ok(())
    }
}
