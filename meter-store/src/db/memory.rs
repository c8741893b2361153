use std::{
    cmp::Ordering,
    collections::{BTreeMap, BinaryHeap},
    sync::{Mutex, MutexGuard},
};

use async_stream::try_stream;
use time::OffsetDateTime;

use super::{
    document::{field_path, increment_path, merge_into, resolve_server_timestamps, resolve_value, set_path, Document, Value},
    error::StoreError,
    path::{auto_id, CollectionPath, DocPath},
    query::{FieldUpdate, GroupQuery, Snapshot},
    PartitionStore, SnapshotStream, WriteMode,
};

const DEFAULT_PAGE_SIZE: usize = 300;

/// Position of a document in a result ordering.
#[derive(Debug, Clone)]
struct SortKey {
    values: Vec<Value>,
    path: DocPath,
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.values.iter().zip(other.values.iter()) {
            let ord = a.total_cmp(b);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.path.cmp(&other.path)
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SortKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortKey {}

struct PageEntry {
    key: SortKey,
    data: Document,
}

impl Ord for PageEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl PartialOrd for PageEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PageEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for PageEntry {}

/// In-process [`PartitionStore`].
///
/// Query results are served in pages: each page is selected from a fresh
/// snapshot of the data, resuming after the last key of the previous page,
/// so a stream never holds more than one page and may observe writes made
/// while it is being consumed.
pub struct MemoryStore {
    docs: Mutex<BTreeMap<DocPath, Document>>,
    page_size: usize,
    enforce_indexes: bool,
    composite_indexes: Vec<(String, Vec<String>)>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            docs: Mutex::new(BTreeMap::new()),
            page_size: DEFAULT_PAGE_SIZE,
            enforce_indexes: false,
            composite_indexes: Vec::new(),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Rejects multi-field orderings that have no declared composite index.
    pub fn require_composite_indexes(mut self) -> Self {
        self.enforce_indexes = true;
        self
    }

    pub fn with_composite_index(mut self, collection_id: &str, fields: &[&str]) -> Self {
        self.composite_indexes.push((
            collection_id.to_string(),
            fields.iter().map(|f| f.to_string()).collect(),
        ));
        self
    }

    pub fn document_count(&self) -> usize {
        self.lock().map(|docs| docs.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<DocPath, Document>>, StoreError> {
        self.docs
            .lock()
            .map_err(|_| StoreError::Internal("memory store lock poisoned".to_string()))
    }

    fn check_index(&self, query: &GroupQuery) -> Result<(), StoreError> {
        if !self.enforce_indexes || !query.requires_composite_index() {
            return Ok(());
        }
        let declared = self
            .composite_indexes
            .iter()
            .any(|(collection, fields)| *collection == query.collection_id && *fields == query.order_by);
        if declared {
            return Ok(());
        }
        let fields = query
            .order_by
            .iter()
            .map(|f| format!("{f} ASC"))
            .collect::<Vec<_>>()
            .join(", ");
        Err(StoreError::IndexRequired(format!(
            "FAILED_PRECONDITION: the query requires a composite index on collection group '{}' over ({fields}); create the index and re-run",
            query.collection_id
        )))
    }

    /// Selects the next `page_size` documents after `after`, keeping at most
    /// one page in memory while scanning.
    fn page<F>(&self, after: Option<&SortKey>, select: F) -> Result<Vec<(SortKey, Document)>, StoreError>
    where
        F: Fn(&DocPath, &Document) -> Option<Vec<Value>>,
    {
        let docs = self.lock()?;
        let mut heap: BinaryHeap<PageEntry> = BinaryHeap::with_capacity(self.page_size + 1);

        for (path, data) in docs.iter() {
            let Some(values) = select(path, data) else {
                continue;
            };
            let key = SortKey {
                values,
                path: path.clone(),
            };
            if after.is_some_and(|cursor| key <= *cursor) {
                continue;
            }
            if heap.len() == self.page_size && heap.peek().is_some_and(|top| key >= top.key) {
                continue;
            }
            heap.push(PageEntry {
                key,
                data: data.clone(),
            });
            if heap.len() > self.page_size {
                heap.pop();
            }
        }

        Ok(heap
            .into_sorted_vec()
            .into_iter()
            .map(|entry| (entry.key, entry.data))
            .collect())
    }

    fn paged<'a, F>(&'a self, select: F) -> SnapshotStream<'a>
    where
        F: Fn(&DocPath, &Document) -> Option<Vec<Value>> + Send + Sync + 'a,
    {
        Box::pin(try_stream! {
            let mut cursor: Option<SortKey> = None;
            loop {
                let page = self.page(cursor.as_ref(), &select)?;
                let exhausted = page.len() < self.page_size;
                if let Some((last, _)) = page.last() {
                    cursor = Some(last.clone());
                }
                for (key, data) in page {
                    yield Snapshot { path: key.path, data };
                }
                if exhausted {
                    break;
                }
            }
        })
    }
}

#[async_trait::async_trait]
impl PartitionStore for MemoryStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>, StoreError> {
        Ok(self.lock()?.get(path).cloned())
    }

    async fn set(&self, path: &DocPath, mut doc: Document, mode: WriteMode) -> Result<(), StoreError> {
        resolve_server_timestamps(&mut doc, OffsetDateTime::now_utc());
        let mut docs = self.lock()?;
        if mode == WriteMode::Merge {
            if let Some(existing) = docs.get_mut(path) {
                merge_into(existing, doc);
                return Ok(());
            }
        }
        docs.insert(path.clone(), doc);
        Ok(())
    }

    async fn add(&self, collection: &CollectionPath, mut doc: Document) -> Result<DocPath, StoreError> {
        let path = collection.doc(&auto_id())?;
        resolve_server_timestamps(&mut doc, OffsetDateTime::now_utc());
        self.lock()?.insert(path.clone(), doc);
        Ok(path)
    }

    async fn update(&self, path: &DocPath, updates: &[FieldUpdate]) -> Result<(), StoreError> {
        let now = OffsetDateTime::now_utc();
        let mut docs = self.lock()?;
        let doc = docs
            .get_mut(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;

        for update in updates {
            match update {
                FieldUpdate::Set { field, value } => {
                    let mut value = value.clone();
                    resolve_value(&mut value, now);
                    set_path(doc, &field_path(field), value);
                }
                FieldUpdate::Increment { field, by } => increment_path(doc, &field_path(field), *by),
            }
        }
        Ok(())
    }

    async fn delete(&self, path: &DocPath) -> Result<(), StoreError> {
        self.lock()?.remove(path);
        Ok(())
    }

    fn list(&self, collection: &CollectionPath) -> SnapshotStream<'_> {
        let collection = collection.clone();
        self.paged(move |path, _| (path.parent() == collection).then(Vec::new))
    }

    fn query(&self, query: GroupQuery) -> SnapshotStream<'_> {
        if let Err(e) = self.check_index(&query) {
            return Box::pin(futures::stream::once(async move { Err(e) }));
        }
        self.paged(move |path, data| {
            if path.parent().id() != query.collection_id || !query.matches(data) {
                return None;
            }
            query.sort_values(data)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::TryStreamExt;
    use time::macros::datetime;

    use super::*;

    fn item(meter: &str, ts: OffsetDateTime) -> Document {
        let mut doc = Document::new();
        doc.insert("f_meter_id".to_string(), meter.into());
        doc.insert("f_ts_utc".to_string(), ts.into());
        doc
    }

    fn items_of(meter: &str, month: &str) -> CollectionPath {
        CollectionPath::root("meter")
            .and_then(|c| c.doc(meter))
            .and_then(|d| d.collection("readings"))
            .and_then(|c| c.doc(month))
            .and_then(|d| d.collection("items"))
            .unwrap()
    }

    #[tokio::test]
    async fn group_query_orders_across_partitions_and_pages() {
        let store = MemoryStore::new().with_page_size(2);
        for hour in [3u8, 1, 2] {
            let ts = datetime!(2024-03-11 00:00:00 UTC) + time::Duration::hours(i64::from(hour));
            store.add(&items_of("B", "2024_03"), item("B", ts)).await.unwrap();
            store.add(&items_of("A", "2024_03"), item("A", ts)).await.unwrap();
        }
        store
            .add(&items_of("A", "2024_04"), item("A", datetime!(2024-04-01 00:00:00 UTC)))
            .await
            .unwrap();

        let q = GroupQuery::collection_group("items").order_by("f_meter_id").order_by("f_ts_utc");
        let rows: Vec<Snapshot> = store.query(q).try_collect().await.unwrap();

        let order: Vec<(String, OffsetDateTime)> = rows
            .iter()
            .map(|s| {
                (
                    s.data["f_meter_id"].as_str().unwrap().to_string(),
                    s.data["f_ts_utc"].as_timestamp().unwrap(),
                )
            })
            .collect();
        assert_eq!(order.len(), 7);
        assert_eq!(order[0].0, "A");
        assert_eq!(order[3].1, datetime!(2024-04-01 00:00:00 UTC));
        assert!(order[4..].iter().all(|(m, _)| m == "B"));
        assert!(order.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn undeclared_composite_ordering_is_rejected() {
        let store = MemoryStore::new().require_composite_indexes();
        let q = GroupQuery::collection_group("items").order_by("f_meter_id").order_by("f_ts_utc");
        let res: Result<Vec<Snapshot>, _> = store.query(q.clone()).try_collect().await;
        assert!(matches!(res, Err(StoreError::IndexRequired(msg)) if msg.contains("composite index")));

        let store = MemoryStore::new()
            .require_composite_indexes()
            .with_composite_index("items", &["f_meter_id", "f_ts_utc"]);
        let res: Result<Vec<Snapshot>, _> = store.query(q).try_collect().await;
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn update_on_missing_document_is_not_found() {
        let store = MemoryStore::new();
        let path = DocPath::parse("meter/MTR-404").unwrap();
        let res = store.update(&path, &[FieldUpdate::set("f_active", true)]).await;
        assert!(matches!(res, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn merge_set_is_idempotent_and_server_timestamps_resolve() {
        let store = MemoryStore::new();
        let path = DocPath::parse("meter/MTR-1/readings/2024_03").unwrap();
        let mut doc = Document::new();
        doc.insert("f_bucket".to_string(), "2024_03".into());
        doc.insert("f_seen_at".to_string(), Value::ServerTimestamp);

        store.set(&path, doc.clone(), WriteMode::Merge).await.unwrap();
        store.set(&path, doc, WriteMode::Merge).await.unwrap();

        assert_eq!(store.document_count(), 1);
        let stored = store.get(&path).await.unwrap().unwrap();
        assert!(matches!(stored["f_seen_at"], Value::Timestamp(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStore::new());
        let path = DocPath::parse("meter/MTR-1").unwrap();
        store.set(&path, Document::new(), WriteMode::Replace).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..64 {
            let store = Arc::clone(&store);
            let path = path.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update(&path, &[FieldUpdate::increment("f_monthly_total_m3.2024_03", 0.5)])
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let doc = store.get(&path).await.unwrap().unwrap();
        let total = doc["f_monthly_total_m3"].as_map().unwrap()["2024_03"].as_f64().unwrap();
        assert_eq!(total, 32.0);
    }

    #[tokio::test]
    async fn list_returns_direct_children_only() {
        let store = MemoryStore::new();
        let meters = CollectionPath::root("meter").unwrap();
        store.set(&meters.doc("A").unwrap(), Document::new(), WriteMode::Replace).await.unwrap();
        store.set(&meters.doc("B").unwrap(), Document::new(), WriteMode::Replace).await.unwrap();
        store
            .add(&items_of("A", "2024_03"), item("A", datetime!(2024-03-01 00:00:00 UTC)))
            .await
            .unwrap();

        let ids: Vec<String> = store
            .list(&meters)
            .map_ok(|s| s.id().to_string())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(ids, vec!["A", "B"]);
    }
}
