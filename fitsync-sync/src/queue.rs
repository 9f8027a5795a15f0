/// Pending-write queue
///
/// Remote inserts that could not be performed immediately, persisted in a
/// table of the local store so they survive restarts. Queue order is
/// insertion order of the backing rows; recording a failed attempt rewrites
/// the row in place and never moves it.

use fitsync_core::{Entity, Key, PendingDivisionCreate, Store, Transaction};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{Result, SyncError};

/// A row type that can live in a pending-write queue
pub trait Queued: Entity + Clone + Send + Sync + 'static {
    fn queue_key(&self) -> Key;

    /// Note a failed attempt on the entry
    fn record_failure(&mut self, error: &str);
}

impl Queued for PendingDivisionCreate {
    fn queue_key(&self) -> Key {
        Key::from(&self.id)
    }

    fn record_failure(&mut self, error: &str) {
        self.attempts += 1;
        self.last_error = Some(error.to_string());
    }
}

type ApplyFn = Box<dyn FnOnce(&mut Transaction<'_>) -> fitsync_core::Result<()> + Send>;

/// Local writes that finish a successful attempt. They commit in the same
/// transaction that removes the entry from the queue.
pub struct Completion {
    tables: Vec<&'static str>,
    apply: ApplyFn,
}

impl Completion {
    pub fn new<F>(tables: &[&'static str], apply: F) -> Self
    where
        F: FnOnce(&mut Transaction<'_>) -> fitsync_core::Result<()> + Send + 'static,
    {
        Self {
            tables: tables.to_vec(),
            apply: Box::new(apply),
        }
    }

    /// Just remove the entry
    pub fn dequeue() -> Self {
        Self::new(&[], |_| Ok(()))
    }
}

/// Result of one drain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Error of each failed attempt, in queue order
    pub errors: Vec<String>,
}

pub struct PendingWriteQueue<T> {
    store: Arc<Store>,
    drain_lock: tokio::sync::Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Queued> PendingWriteQueue<T> {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            drain_lock: tokio::sync::Mutex::new(()),
            _marker: PhantomData,
        }
    }

    /// Append an entry; a single durable commit
    pub fn enqueue(&self, item: &T) -> Result<()> {
        self.store.transaction(&[T::TABLE], |tx| Self::enqueue_in(tx, item))?;
        tracing::debug!(table = T::TABLE, key = %item.queue_key(), "queued pending write");
        Ok(())
    }

    /// Append an entry as part of a larger transaction
    pub fn enqueue_in(tx: &mut Transaction<'_>, item: &T) -> fitsync_core::Result<()> {
        tx.put(item).map(|_| ())
    }

    /// Entries in queue order
    pub fn list(&self) -> Result<Vec<T>> {
        Ok(self.store.all::<T>()?)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.store.count(T::TABLE)?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn contains(&self, key: &Key) -> Result<bool> {
        Ok(self.store.get::<T>(key)?.is_some())
    }

    /// Attempt every entry queued when the drain starts, oldest first.
    ///
    /// An entry is removed only when its attempt succeeds, together with the
    /// attempt's local writes. Failed entries keep their position. Drains are
    /// serialized: a second caller waits for the first to finish.
    pub async fn drain<F, Fut>(&self, mut attempt: F) -> Result<DrainReport>
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = Result<Completion>>,
    {
        let _drain = self.drain_lock.lock().await;

        let items = self.list()?;
        let mut report = DrainReport::default();

        for item in items {
            let key = item.queue_key();
            report.attempted += 1;

            let outcome = match attempt(item.clone()).await {
                Ok(completion) => self.complete(&key, completion),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {
                    report.succeeded += 1;
                    tracing::debug!(table = T::TABLE, %key, "pending write completed");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(table = T::TABLE, %key, error = %e, "pending write failed, keeping it queued");
                    if let Err(record_err) = self.record_failure(&key, &e) {
                        tracing::warn!(%key, error = %record_err, "could not record failed attempt");
                    }
                    report.errors.push(e.to_string());
                }
            }
        }

        Ok(report)
    }

    /// Remove an entry together with `apply`'s local writes, in one
    /// transaction.
    ///
    /// Waits for a running drain, so an entry is never removed while its
    /// attempt is in flight. Returns false, with nothing applied, when the
    /// entry is no longer queued.
    pub async fn remove_with<F>(&self, key: &Key, tables: &[&'static str], apply: F) -> Result<bool>
    where
        F: FnOnce(&mut Transaction<'_>) -> fitsync_core::Result<()>,
    {
        let _drain = self.drain_lock.lock().await;

        let removed = self.store.transaction(&with_queue_table::<T>(tables), |tx| {
            if tx.get::<T>(key)?.is_none() {
                return Ok(false);
            }
            apply(tx)?;
            tx.delete(T::TABLE, key)?;
            Ok(true)
        })?;

        if removed {
            tracing::debug!(table = T::TABLE, %key, "pending write removed");
        }
        Ok(removed)
    }

    fn complete(&self, key: &Key, completion: Completion) -> Result<()> {
        let tables = with_queue_table::<T>(&completion.tables);
        let apply = completion.apply;
        self.store
            .transaction(&tables, |tx| {
                apply(tx)?;
                tx.delete(T::TABLE, key)
            })
            .map_err(|e| {
                tracing::error!(%key, error = %e, "remote write succeeded but local commit failed");
                SyncError::Store(e)
            })
    }

    fn record_failure(&self, key: &Key, error: &SyncError) -> Result<()> {
        self.store.transaction(&[T::TABLE], |tx| {
            // The entry may have been removed while the attempt was running
            if let Some(mut entry) = tx.get::<T>(key)? {
                entry.record_failure(&error.to_string());
                tx.put(&entry)?;
            }
            Ok(())
        })?;
        Ok(())
    }
}

fn with_queue_table<T: Queued>(tables: &[&'static str]) -> Vec<&'static str> {
    let mut all = vec![T::TABLE];
    for table in tables {
        if !all.contains(table) {
            all.push(*table);
        }
    }
    all
}
