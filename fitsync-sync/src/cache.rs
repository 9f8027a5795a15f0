/// Read-through cache loader
///
/// Views render from the local store first, then a background refresh pulls
/// the authoritative rows and upserts them locally. Subscribers of the store
/// see a second, corrected change shortly after the first render. Rows are
/// never evicted by a refresh.

use fitsync_core::{Division, Entity, Exercise, FieldValue, Split, Store};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::error::{RemoteError, Result};
use crate::remote::{
    RemoteQuery, RemoteStore, REMOTE_DIVISIONS, REMOTE_EXERCISES, REMOTE_OWNER_FIELD,
    REMOTE_SPLITS,
};

/// A locally mirrored entity with a remote table
pub trait Cached: Entity + Clone + Send + Sync + 'static {
    const REMOTE_TABLE: &'static str;

    /// Remote column name for a local field
    fn remote_field(field: &str) -> &str {
        field
    }
}

impl Cached for Division {
    const REMOTE_TABLE: &'static str = REMOTE_DIVISIONS;

    fn remote_field(field: &str) -> &str {
        match field {
            "owner_id" => REMOTE_OWNER_FIELD,
            other => other,
        }
    }
}

impl Cached for Split {
    const REMOTE_TABLE: &'static str = REMOTE_SPLITS;
}

impl Cached for Exercise {
    const REMOTE_TABLE: &'static str = REMOTE_EXERCISES;
}

/// Equality filter on an indexed field, with optional ascending order
#[derive(Debug, Clone)]
pub struct CacheQuery {
    field: String,
    value: FieldValue,
    order_by: Option<String>,
}

impl CacheQuery {
    pub fn eq(field: &str, value: impl Into<FieldValue>) -> Self {
        Self {
            field: field.to_string(),
            value: value.into(),
            order_by: None,
        }
    }

    pub fn order_by(mut self, field: &str) -> Self {
        self.order_by = Some(field.to_string());
        self
    }

    fn remote<E: Cached>(&self) -> RemoteQuery {
        let mut query = RemoteQuery::new(E::REMOTE_TABLE)
            .eq(E::remote_field(&self.field), self.value.to_json());
        if let Some(field) = &self.order_by {
            query = query.order_by(E::remote_field(field));
        }
        query
    }
}

/// Local rows plus the background refresh that will overwrite them
pub struct Loaded<E> {
    pub rows: Vec<E>,
    /// Resolves to the number of rows written by the refresh
    pub refresh: JoinHandle<Result<usize>>,
}

#[derive(Clone)]
pub struct ReadThroughLoader {
    store: Arc<Store>,
    remote: Arc<dyn RemoteStore>,
}

impl ReadThroughLoader {
    pub fn new(store: Arc<Store>, remote: Arc<dyn RemoteStore>) -> Self {
        Self { store, remote }
    }

    /// Return local rows immediately and refresh them from the remote store
    /// in the background
    pub async fn load<E: Cached>(&self, query: CacheQuery) -> Result<Loaded<E>> {
        let rows = self.local::<E>(&query)?;

        let loader = self.clone();
        let refresh = tokio::spawn(async move { loader.refresh::<E>(&query).await });

        Ok(Loaded { rows, refresh })
    }

    /// Local rows only
    pub fn local<E: Cached>(&self, query: &CacheQuery) -> Result<Vec<E>> {
        let mut local = self.store.query::<E>().eq(&query.field, query.value.clone());
        if let Some(field) = &query.order_by {
            local = local.order_by(field);
        }
        Ok(local.fetch()?)
    }

    /// Fetch the authoritative rows and upsert them locally
    pub async fn refresh<E: Cached>(&self, query: &CacheQuery) -> Result<usize> {
        let remote_query = query.remote::<E>();
        let rows = match self.remote.select(&remote_query).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(table = E::TABLE, error = %e, "refresh failed, keeping local rows");
                return Err(e.into());
            }
        };

        let entities: Vec<E> = rows.into_iter().filter_map(decode::<E>).collect();
        let written = self.store.transaction(&[E::TABLE], |tx| {
            for entity in &entities {
                tx.put(entity)?;
            }
            Ok(entities.len())
        })?;

        tracing::debug!(table = E::TABLE, rows = written, "cache refreshed");
        Ok(written)
    }
}

fn decode<E: Cached>(row: Value) -> Option<E> {
    match serde_json::from_value(row).map_err(RemoteError::from) {
        Ok(entity) => Some(entity),
        Err(e) => {
            tracing::warn!(table = E::REMOTE_TABLE, error = %e, "skipping undecodable remote row");
            None
        }
    }
}
