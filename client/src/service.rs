//! The remote record store service boundary.
//!
//! Every call answers with an [`Envelope`]; callers classify failures through
//! [`Envelope::into_result`]. The in-memory implementation backs the tests and
//! the simulator and can be told to fail, lag or slow down.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use grantsync_engine::{
    is_virtual, Collection, Envelope, Fields, Record, RecordId, RemoteError, StoredRecord,
    VIRTUAL_ID_THRESHOLD,
};
use serde_json::Value;

/// Which storage a delete addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteTarget {
    /// A durable row in the collection's main table.
    Row(RecordId),
    /// A saved snapshot in the collection's side table.
    Snapshot(RecordId),
}

impl DeleteTarget {
    /// Pick the target from the id's namespace.
    pub fn for_id(id: RecordId) -> Self {
        if is_virtual(id) {
            DeleteTarget::Snapshot(id)
        } else {
            DeleteTarget::Row(id)
        }
    }

    pub fn id(self) -> RecordId {
        match self {
            DeleteTarget::Row(id) | DeleteTarget::Snapshot(id) => id,
        }
    }
}

/// How a record is sent to the server when saved.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveRequest {
    /// A persisted record is saved by id.
    Reference { id: RecordId },
    /// A virtual record carries its full snapshot.
    Snapshot { id: RecordId, snapshot: Value },
}

impl SaveRequest {
    pub fn for_record(record: &Record) -> Self {
        if record.is_virtual() {
            SaveRequest::Snapshot {
                id: record.id,
                snapshot: record.snapshot_blob(),
            }
        } else {
            SaveRequest::Reference { id: record.id }
        }
    }

    pub fn id(&self) -> RecordId {
        match self {
            SaveRequest::Reference { id } | SaveRequest::Snapshot { id, .. } => *id,
        }
    }
}

/// Remote CRUD over server-owned collections.
#[async_trait]
pub trait RecordStoreService: Send + Sync {
    /// Fetch the full collection.
    async fn list(&self, collection: Collection) -> Envelope<Vec<StoredRecord>>;

    /// Create a row; the server assigns the id.
    async fn create(&self, collection: Collection, fields: Fields) -> Envelope<StoredRecord>;

    /// Replace a row's fields.
    async fn update(
        &self,
        collection: Collection,
        id: RecordId,
        fields: Fields,
    ) -> Envelope<StoredRecord>;

    /// Delete one row or snapshot.
    async fn delete(&self, collection: Collection, target: DeleteTarget) -> Envelope<()>;

    /// Save a record into a collection.
    async fn save(&self, collection: Collection, request: SaveRequest) -> Envelope<StoredRecord>;
}

/// Process-local record store.
#[derive(Debug)]
pub struct InMemoryRecordStore {
    rows: DashMap<Collection, BTreeMap<RecordId, StoredRecord>>,
    next_id: AtomicU64,
    /// Writes against these targets fail with the stored error
    target_failures: DashMap<(Collection, RecordId), RemoteError>,
    create_failures: DashMap<Collection, RemoteError>,
    list_failures: AtomicUsize,
    /// Deleted rows the listing keeps returning, with remaining list count
    lingering: DashMap<(Collection, RecordId), (StoredRecord, usize)>,
    linger_for: AtomicUsize,
    latency_ms: AtomicU64,
    list_calls: AtomicUsize,
    write_calls: AtomicUsize,
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            next_id: AtomicU64::new(1),
            target_failures: DashMap::new(),
            create_failures: DashMap::new(),
            list_failures: AtomicUsize::new(0),
            lingering: DashMap::new(),
            linger_for: AtomicUsize::new(0),
            latency_ms: AtomicU64::new(0),
            list_calls: AtomicUsize::new(0),
            write_calls: AtomicUsize::new(0),
        }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert a row directly, bypassing failure injection.
    pub fn seed(&self, collection: Collection, row: StoredRecord) {
        self.next_id.fetch_max(row.id.saturating_add(1), Ordering::SeqCst);
        self.rows.entry(collection).or_default().insert(row.id, row);
    }

    /// Seed a persisted row from fields.
    pub fn seed_fields(&self, collection: Collection, id: RecordId, fields: Fields) {
        self.seed(
            collection,
            StoredRecord {
                id,
                fields: Some(fields),
                snapshot: None,
            },
        );
    }

    pub fn contains(&self, collection: Collection, id: RecordId) -> bool {
        self.rows
            .get(&collection)
            .map(|rows| rows.contains_key(&id))
            .unwrap_or(false)
    }

    pub fn row(&self, collection: Collection, id: RecordId) -> Option<StoredRecord> {
        self.rows.get(&collection)?.get(&id).cloned()
    }

    pub fn row_count(&self, collection: Collection) -> usize {
        self.rows.get(&collection).map(|rows| rows.len()).unwrap_or(0)
    }

    /// Make writes against `id` fail with `error`.
    pub fn fail_target(&self, collection: Collection, id: RecordId, error: RemoteError) {
        self.target_failures.insert((collection, id), error);
    }

    pub fn clear_target_failure(&self, collection: Collection, id: RecordId) {
        self.target_failures.remove(&(collection, id));
    }

    /// Make creates in `collection` fail with `error`.
    pub fn fail_creates(&self, collection: Collection, error: RemoteError) {
        self.create_failures.insert(collection, error);
    }

    /// Make the next `count` list calls fail with a network error.
    pub fn fail_next_lists(&self, count: usize) {
        self.list_failures.store(count, Ordering::SeqCst);
    }

    /// Keep returning deleted rows from the next `lists` list calls.
    pub fn linger_deletes(&self, lists: usize) {
        self.linger_for.store(lists, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    /// Shared prelude of every write: latency, call count, injected failure.
    async fn begin_write(&self, collection: Collection, id: RecordId) -> Result<(), RemoteError> {
        self.simulate_latency().await;
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        match self.target_failures.get(&(collection, id)) {
            Some(error) => Err(error.value().clone()),
            None => Ok(()),
        }
    }

    fn take_list_failure(&self) -> bool {
        self.list_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn drain_lingering(&self, collection: Collection) -> Vec<StoredRecord> {
        let mut out = Vec::new();
        self.lingering.retain(|(c, _), (row, remaining)| {
            if *c != collection {
                return true;
            }
            out.push(row.clone());
            *remaining -= 1;
            *remaining > 0
        });
        out
    }
}

#[async_trait]
impl RecordStoreService for InMemoryRecordStore {
    async fn list(&self, collection: Collection) -> Envelope<Vec<StoredRecord>> {
        self.simulate_latency().await;
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        if self.take_list_failure() {
            return Envelope::from_error(RemoteError::network("connection reset"));
        }

        let mut rows: BTreeMap<RecordId, StoredRecord> = self
            .rows
            .get(&collection)
            .map(|rows| rows.value().clone())
            .unwrap_or_default();
        for row in self.drain_lingering(collection) {
            rows.entry(row.id).or_insert(row);
        }

        Envelope::ok(rows.into_values().collect())
    }

    async fn create(&self, collection: Collection, fields: Fields) -> Envelope<StoredRecord> {
        self.simulate_latency().await;
        self.write_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.create_failures.get(&collection) {
            return Envelope::from_error(error.value().clone());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if id >= VIRTUAL_ID_THRESHOLD {
            return Envelope::err("row id space exhausted", Some("REJECTED"));
        }

        let row = StoredRecord {
            id,
            fields: Some(fields),
            snapshot: None,
        };
        self.rows
            .entry(collection)
            .or_default()
            .insert(id, row.clone());
        Envelope::ok(row)
    }

    async fn update(
        &self,
        collection: Collection,
        id: RecordId,
        fields: Fields,
    ) -> Envelope<StoredRecord> {
        if let Err(error) = self.begin_write(collection, id).await {
            return Envelope::from_error(error);
        }

        let mut rows = self.rows.entry(collection).or_default();
        match rows.get_mut(&id) {
            Some(row) => {
                row.fields = Some(fields);
                Envelope::ok(row.clone())
            }
            None => Envelope::err(format!("{collection} row {id} not found"), Some("NOT_FOUND")),
        }
    }

    async fn delete(&self, collection: Collection, target: DeleteTarget) -> Envelope<()> {
        let id = target.id();
        if let Err(error) = self.begin_write(collection, id).await {
            return Envelope::from_error(error);
        }

        if matches!(target, DeleteTarget::Row(id) if is_virtual(id)) {
            return Envelope::err("row ids must be below the virtual threshold", Some("REJECTED"));
        }

        let removed = self
            .rows
            .get_mut(&collection)
            .and_then(|mut rows| rows.remove(&id));

        match removed {
            Some(row) => {
                let linger = self.linger_for.load(Ordering::SeqCst);
                if linger > 0 {
                    self.lingering.insert((collection, id), (row, linger));
                }
                Envelope::done()
            }
            None => Envelope::err(format!("{collection} record {id} not found"), Some("NOT_FOUND")),
        }
    }

    async fn save(&self, collection: Collection, request: SaveRequest) -> Envelope<StoredRecord> {
        if let Err(error) = self.begin_write(collection, request.id()).await {
            return Envelope::from_error(error);
        }

        let row = match request {
            SaveRequest::Snapshot { id, snapshot } => StoredRecord {
                id,
                fields: None,
                snapshot: Some(snapshot),
            },
            SaveRequest::Reference { id } => {
                // The saved row mirrors whichever collection owns the id.
                let fields = self
                    .rows
                    .iter()
                    .find_map(|rows| rows.get(&id).and_then(|row| row.fields.clone()))
                    .unwrap_or_default();
                StoredRecord {
                    id,
                    fields: Some(fields),
                    snapshot: None,
                }
            }
        };

        self.rows
            .entry(collection)
            .or_default()
            .insert(row.id, row.clone());
        Envelope::ok(row)
    }
}
