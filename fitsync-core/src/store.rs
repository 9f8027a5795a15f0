//! Local durable store.
//!
//! A small table store with secondary indexes, kept in memory and made durable
//! by a transaction journal plus periodic snapshots. Every write, including a
//! single `put`, is a transaction: it is journaled as one frame, then applied
//! to the in-memory tables while the write lock is held.

use crate::journal::{Journal, Op};
use crate::schema::{fitness_schema, Schema, TableSchema};
use crate::snapshot::{RowImage, Snapshot, TableImage};
use crate::{Entity, Error, FieldValue, Key, Lsn, Result, SeqNo, StoreConfig};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

const JOURNAL_FILE: &str = "journal.log";
const SNAPSHOT_FILE: &str = "snapshot.bin";

/// Notification emitted after every committed transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub lsn: Lsn,
    pub tables: Vec<String>,
}

struct StoredRow {
    seq: SeqNo,
    value: Value,
}

struct TableData {
    schema: TableSchema,
    rows: BTreeMap<Key, StoredRow>,
    indexes: HashMap<&'static str, BTreeMap<FieldValue, BTreeSet<Key>>>,
    next_auto: u64,
}

impl TableData {
    fn new(schema: TableSchema) -> Self {
        let indexes = schema
            .indexes
            .iter()
            .map(|field| (*field, BTreeMap::new()))
            .collect();
        Self {
            schema,
            rows: BTreeMap::new(),
            indexes,
            next_auto: 1,
        }
    }

    fn index_row(&mut self, key: &Key, value: &Value) {
        for (field, index) in self.indexes.iter_mut() {
            if let Some(fv) = field_value(value, field) {
                index.entry(fv).or_default().insert(key.clone());
            }
        }
    }

    fn unindex_row(&mut self, key: &Key, value: &Value) {
        for (field, index) in self.indexes.iter_mut() {
            if let Some(fv) = field_value(value, field) {
                if let Some(keys) = index.get_mut(&fv) {
                    keys.remove(key);
                    if keys.is_empty() {
                        index.remove(&fv);
                    }
                }
            }
        }
    }

    fn upsert(&mut self, key: Key, value: Value, next_seq: &mut SeqNo) {
        let seq = match self.rows.remove(&key) {
            Some(old) => {
                self.unindex_row(&key, &old.value);
                old.seq
            }
            None => {
                let seq = *next_seq;
                *next_seq += 1;
                seq
            }
        };

        if let Key::Int(n) = key {
            self.next_auto = self.next_auto.max(n + 1);
        }

        self.index_row(&key, &value);
        self.rows.insert(key, StoredRow { seq, value });
    }

    fn remove(&mut self, key: &Key) {
        if let Some(old) = self.rows.remove(key) {
            self.unindex_row(key, &old.value);
        }
    }

    /// Keys whose `field` equals `value`
    fn lookup(&self, field: &str, value: &FieldValue) -> Result<Vec<Key>> {
        if self.schema.key.field() == field {
            let key = match value {
                FieldValue::Str(s) => Some(Key::Str(s.clone())),
                FieldValue::Int(n) if *n >= 0 => Some(Key::Int(*n as u64)),
                _ => None,
            };
            return Ok(key
                .filter(|k| self.rows.contains_key(k))
                .into_iter()
                .collect());
        }

        let index = self.indexes.get(field).ok_or_else(|| {
            Error::InvalidQuery(format!("no index on {}.{}", self.schema.name, field))
        })?;

        Ok(index
            .get(value)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default())
    }
}

fn field_value(value: &Value, field: &str) -> Option<FieldValue> {
    match value.get(field) {
        Some(v) => FieldValue::from_json(v),
        None => Some(FieldValue::Null),
    }
}

struct StoreInner {
    tables: HashMap<&'static str, TableData>,
    journal: Option<Journal>,
    next_lsn: Lsn,
    next_seq: SeqNo,
}

impl StoreInner {
    fn empty(schema: &Schema) -> Self {
        Self {
            tables: schema
                .tables
                .iter()
                .map(|t| (t.name, TableData::new(t.clone())))
                .collect(),
            journal: None,
            next_lsn: 1,
            next_seq: 1,
        }
    }

    fn table(&self, name: &str) -> Result<&TableData> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown table: {}", name)))
    }

    fn apply_ops(&mut self, ops: &[Op]) -> Result<()> {
        for op in ops {
            let Some(table) = self.tables.get_mut(op.table()) else {
                // Table dropped by a schema upgrade
                tracing::debug!(table = op.table(), "skipping op for unknown table");
                continue;
            };

            match op {
                Op::Put { key, row, .. } => {
                    let value: Value = serde_json::from_str(row)
                        .map_err(|e| Error::Corruption(format!("row {}: {}", key, e)))?;
                    table.upsert(key.clone(), value, &mut self.next_seq);
                }
                Op::Delete { key, .. } => table.remove(key),
            }
        }
        Ok(())
    }

    fn load_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        for image in snapshot.tables {
            let Some(table) = self.tables.get_mut(image.name.as_str()) else {
                tracing::info!(table = %image.name, "dropping table removed from schema");
                continue;
            };

            for row in image.rows {
                let value: Value = serde_json::from_str(&row.row)
                    .map_err(|e| Error::Corruption(format!("snapshot row {}: {}", row.key, e)))?;
                table.index_row(&row.key, &value);
                table.rows.insert(row.key, StoredRow { seq: row.seq, value });
            }
            table.next_auto = table.next_auto.max(image.next_auto);
        }

        self.next_seq = self.next_seq.max(snapshot.next_seq);
        self.next_lsn = self.next_lsn.max(snapshot.lsn + 1);
        Ok(())
    }

    fn snapshot(&self, schema_version: u32) -> Snapshot {
        let mut tables: Vec<TableImage> = self
            .tables
            .values()
            .map(|t| TableImage {
                name: t.schema.name.to_string(),
                next_auto: t.next_auto,
                rows: t
                    .rows
                    .iter()
                    .map(|(key, row)| RowImage {
                        key: key.clone(),
                        seq: row.seq,
                        row: row.value.to_string(),
                    })
                    .collect(),
            })
            .collect();
        tables.sort_by(|a, b| a.name.cmp(&b.name));

        Snapshot {
            schema_version,
            lsn: self.next_lsn - 1,
            next_seq: self.next_seq,
            tables,
        }
    }

    fn checkpoint(&mut self, dir: &Path, schema_version: u32) -> Result<()> {
        let snapshot = self.snapshot(schema_version);
        snapshot.write(&dir.join(SNAPSHOT_FILE))?;
        if let Some(journal) = self.journal.as_mut() {
            journal.reset(schema_version)?;
        }
        tracing::debug!(lsn = snapshot.lsn, "checkpoint written");
        Ok(())
    }
}

/// The local durable store
pub struct Store {
    schema: Schema,
    config: StoreConfig,
    dir: Option<PathBuf>,
    inner: RwLock<StoreInner>,
    subscribers: Mutex<Vec<Sender<StoreChange>>>,
}

impl Store {
    /// Open the store in `dir`, creating it if needed
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(dir, StoreConfig::default())
    }

    /// Open the store in `dir` with an explicit configuration
    pub fn open_with_config(dir: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        config.validate().map_err(Error::InvalidArgument)?;

        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let schema = fitness_schema();
        let mut inner = StoreInner::empty(&schema);
        let mut found_version = schema.version;

        let mut base_lsn = 0;
        if let Some(snapshot) = Snapshot::read(&dir.join(SNAPSHOT_FILE))? {
            schema.check_compatible(snapshot.schema_version)?;
            found_version = found_version.min(snapshot.schema_version);
            base_lsn = snapshot.lsn;
            inner.load_snapshot(snapshot)?;
        }

        let journal_path = dir.join(JOURNAL_FILE);
        let journal = if journal_path.exists() {
            let (journal, recovered) = Journal::open(&journal_path)?;
            schema.check_compatible(recovered.schema_version)?;
            found_version = found_version.min(recovered.schema_version);

            for (lsn, ops) in recovered.frames {
                if lsn <= base_lsn {
                    continue;
                }
                inner.apply_ops(&ops)?;
                inner.next_lsn = lsn + 1;
            }
            journal
        } else {
            Journal::create(&journal_path, schema.version)?
        };
        inner.journal = Some(journal);

        if found_version < schema.version {
            tracing::info!(
                from = found_version,
                to = schema.version,
                "upgrading local store schema"
            );
            inner.checkpoint(&dir, schema.version)?;
        }

        tracing::debug!(
            path = %dir.display(),
            next_lsn = inner.next_lsn,
            "local store opened"
        );

        Ok(Self {
            schema,
            config,
            dir: Some(dir),
            inner: RwLock::new(inner),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Create a store with no backing files
    pub fn in_memory() -> Self {
        let schema = fitness_schema();
        let inner = StoreInner::empty(&schema);
        Self {
            schema,
            config: StoreConfig::default(),
            dir: None,
            inner: RwLock::new(inner),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Directory backing this store, if any
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Run `work` with exclusive write access to `tables`.
    ///
    /// All writes staged by `work` are committed as one journal frame, or none
    /// are if `work` returns an error or panics. The write lock is a scoped
    /// guard and is released on every exit path.
    pub fn transaction<T, F>(&self, tables: &[&str], work: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        for table in tables {
            self.schema.table(table)?;
        }

        let mut guard = self.inner.write();
        let (result, ops) = {
            let mut tx = Transaction {
                inner: &*guard,
                scope: tables.iter().map(|t| t.to_string()).collect(),
                staged: BTreeMap::new(),
                auto: HashMap::new(),
                ops: Vec::new(),
            };
            let result = work(&mut tx)?;
            (result, tx.ops)
        };

        if ops.is_empty() {
            return Ok(result);
        }

        let lsn = guard.next_lsn;
        if let Some(journal) = guard.journal.as_mut() {
            journal.append(lsn, &ops, self.config.sync_on_commit)?;
        }
        guard.next_lsn += 1;
        guard
            .apply_ops(&ops)
            .map_err(|e| e.with_context("applying committed transaction"))?;

        let needs_checkpoint = guard
            .journal
            .as_ref()
            .map(|j| j.frames_written() >= self.config.checkpoint_after_frames)
            .unwrap_or(false);
        if needs_checkpoint {
            if let Some(dir) = self.dir.as_deref() {
                // The commit is already durable in the journal
                if let Err(e) = guard.checkpoint(dir, self.schema.version) {
                    tracing::warn!(error = %e, "automatic checkpoint failed");
                }
            }
        }
        drop(guard);

        let mut touched: Vec<String> = ops.iter().map(|op| op.table().to_string()).collect();
        touched.sort();
        touched.dedup();
        self.notify(StoreChange {
            lsn,
            tables: touched,
        });

        Ok(result)
    }

    /// Upsert an entity by primary key
    pub fn put<E: Entity>(&self, entity: &E) -> Result<Key> {
        self.transaction(&[E::TABLE], |tx| tx.put(entity))
    }

    /// Upsert a raw JSON row
    pub fn put_value(&self, table: &str, value: Value) -> Result<Key> {
        self.transaction(&[table], |tx| tx.put_value(table, value))
    }

    pub fn get<E: Entity>(&self, key: &Key) -> Result<Option<E>> {
        match self.get_value(E::TABLE, key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn get_value(&self, table: &str, key: &Key) -> Result<Option<Value>> {
        let inner = self.inner.read();
        Ok(inner.table(table)?.rows.get(key).map(|r| r.value.clone()))
    }

    /// Remove a row by primary key. Removing an absent row is not an error.
    pub fn delete(&self, table: &str, key: &Key) -> Result<()> {
        self.transaction(&[table], |tx| tx.delete(table, key))
    }

    pub fn delete_entity<E: Entity>(&self, key: &Key) -> Result<()> {
        self.delete(E::TABLE, key)
    }

    /// All rows of `table` whose `field` equals `value`, in no particular order
    pub fn query_by_index(
        &self,
        table: &str,
        field: &str,
        value: impl Into<FieldValue>,
    ) -> Result<Vec<Value>> {
        let value = value.into();
        let inner = self.inner.read();
        let data = inner.table(table)?;
        let keys = data.lookup(field, &value)?;
        Ok(keys
            .iter()
            .filter_map(|k| data.rows.get(k))
            .map(|r| r.value.clone())
            .collect())
    }

    /// Start a typed query over `E`'s table
    pub fn query<E: Entity>(&self) -> Query<'_, E> {
        Query {
            store: self,
            filter: None,
            order_by: None,
            limit: None,
            _marker: PhantomData,
        }
    }

    /// Every row of `E`'s table in insertion order
    pub fn all<E: Entity>(&self) -> Result<Vec<E>> {
        self.query::<E>().fetch()
    }

    pub fn count(&self, table: &str) -> Result<usize> {
        Ok(self.inner.read().table(table)?.rows.len())
    }

    /// Receive a notification after every commit
    pub fn subscribe(&self) -> Receiver<StoreChange> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Fold the journal into a snapshot now
    pub fn checkpoint(&self) -> Result<()> {
        let Some(dir) = self.dir.as_deref() else {
            return Ok(());
        };
        self.inner.write().checkpoint(dir, self.schema.version)
    }

    fn notify(&self, change: StoreChange) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(change.clone()).is_ok());
    }
}

/// Staged writes of one transaction. Reads see the transaction's own writes.
pub struct Transaction<'a> {
    inner: &'a StoreInner,
    scope: Vec<String>,
    staged: BTreeMap<(String, Key), Option<Value>>,
    auto: HashMap<String, u64>,
    ops: Vec<Op>,
}

impl<'a> Transaction<'a> {
    fn check_scope(&self, table: &str) -> Result<&'a TableData> {
        if !self.scope.iter().any(|t| t == table) {
            return Err(Error::InvalidArgument(format!(
                "table {} is not part of this transaction",
                table
            )));
        }
        self.inner.table(table)
    }

    pub fn put<E: Entity>(&mut self, entity: &E) -> Result<Key> {
        let value = serde_json::to_value(entity)?;
        self.put_value(E::TABLE, value)
    }

    pub fn put_value(&mut self, table: &str, mut value: Value) -> Result<Key> {
        let data = self.check_scope(table)?;
        let key_field = data.schema.key.field();

        let object = value
            .as_object_mut()
            .ok_or_else(|| Error::InvalidArgument(format!("{} row must be an object", table)))?;

        let existing = object
            .get(key_field)
            .filter(|v| !v.is_null())
            .map(Key::from_json);

        let key = match existing {
            Some(Some(key)) => key,
            Some(None) => {
                return Err(Error::InvalidArgument(format!(
                    "{}.{} is not a valid key",
                    table, key_field
                )))
            }
            None if data.schema.key.is_auto_increment() => {
                let next = self.auto.entry(table.to_string()).or_insert(data.next_auto);
                let key = Key::Int(*next);
                *next += 1;
                object.insert(key_field.to_string(), key.to_json());
                key
            }
            None => {
                return Err(Error::InvalidArgument(format!(
                    "{} row is missing key field {}",
                    table, key_field
                )))
            }
        };

        if let Key::Int(n) = key {
            let next = self.auto.entry(table.to_string()).or_insert(data.next_auto);
            *next = (*next).max(n + 1);
        }

        self.ops.push(Op::Put {
            table: table.to_string(),
            key: key.clone(),
            row: value.to_string(),
        });
        self.staged.insert((table.to_string(), key.clone()), Some(value));
        Ok(key)
    }

    pub fn delete(&mut self, table: &str, key: &Key) -> Result<()> {
        self.check_scope(table)?;
        self.ops.push(Op::Delete {
            table: table.to_string(),
            key: key.clone(),
        });
        self.staged.insert((table.to_string(), key.clone()), None);
        Ok(())
    }

    pub fn get<E: Entity>(&self, key: &Key) -> Result<Option<E>> {
        match self.get_value(E::TABLE, key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn get_value(&self, table: &str, key: &Key) -> Result<Option<Value>> {
        if let Some(staged) = self.staged.get(&(table.to_string(), key.clone())) {
            return Ok(staged.clone());
        }
        Ok(self.inner.table(table)?.rows.get(key).map(|r| r.value.clone()))
    }

    /// Index lookup that includes this transaction's staged writes
    pub fn query_by_index(
        &self,
        table: &str,
        field: &str,
        value: impl Into<FieldValue>,
    ) -> Result<Vec<Value>> {
        let value = value.into();
        let data = self.inner.table(table)?;

        let mut found: BTreeMap<Key, Value> = data
            .lookup(field, &value)?
            .into_iter()
            .filter_map(|k| data.rows.get(&k).map(|r| (k, r.value.clone())))
            .collect();

        for ((staged_table, key), staged) in &self.staged {
            if staged_table != table {
                continue;
            }
            found.remove(key);
            if let Some(row) = staged {
                if field_value(row, field).as_ref() == Some(&value) {
                    found.insert(key.clone(), row.clone());
                }
            }
        }

        Ok(found.into_values().collect())
    }

    pub fn query<E: Entity>(&self, field: &str, value: impl Into<FieldValue>) -> Result<Vec<E>> {
        self.query_by_index(E::TABLE, field, value)?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(Error::from))
            .collect()
    }
}

/// Typed query builder
pub struct Query<'a, E> {
    store: &'a Store,
    filter: Option<(String, FieldValue)>,
    order_by: Option<String>,
    limit: Option<usize>,
    _marker: PhantomData<E>,
}

impl<'a, E: Entity> Query<'a, E> {
    /// Restrict to rows whose indexed `field` equals `value`
    pub fn eq(mut self, field: &str, value: impl Into<FieldValue>) -> Self {
        self.filter = Some((field.to_string(), value.into()));
        self
    }

    /// Order ascending by `field`; ties keep first-insertion order
    pub fn order_by(mut self, field: &str) -> Self {
        self.order_by = Some(field.to_string());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn fetch(self) -> Result<Vec<E>> {
        let inner = self.store.inner.read();
        let data = inner.table(E::TABLE)?;

        let mut rows: Vec<&StoredRow> = match &self.filter {
            Some((field, value)) => data
                .lookup(field, value)?
                .iter()
                .filter_map(|k| data.rows.get(k))
                .collect(),
            None => data.rows.values().collect(),
        };

        match &self.order_by {
            Some(field) => rows.sort_by(|a, b| {
                let fa = field_value(&a.value, field).unwrap_or(FieldValue::Null);
                let fb = field_value(&b.value, field).unwrap_or(FieldValue::Null);
                fa.cmp(&fb).then(a.seq.cmp(&b.seq))
            }),
            None => rows.sort_by_key(|r| r.seq),
        }

        if let Some(limit) = self.limit {
            rows.truncate(limit);
        }

        rows.into_iter()
            .map(|r| serde_json::from_value(r.value.clone()).map_err(Error::from))
            .collect()
    }
}
