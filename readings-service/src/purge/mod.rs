use futures::{StreamExt, TryStreamExt};

use meter_store::{
    db::path::{CLIENTS, CONDOMINIUMS, ITEMS, LOCATIONS, METERS, READINGS},
    CollectionPath, DocPath, GroupQuery, PartitionStore, SnapshotStream,
};

use crate::error::ServiceError;

const DELETE_BATCH: usize = 500;

/// Root collections, children's parents last.
pub const ROOT_COLLECTIONS: [&str; 4] = [CONDOMINIUMS, LOCATIONS, CLIENTS, METERS];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub items: u64,
    pub buckets: u64,
    pub roots: Vec<(&'static str, u64)>,
}

impl PurgeReport {
    pub fn total(&self) -> u64 {
        self.items + self.buckets + self.roots.iter().map(|(_, n)| n).sum::<u64>()
    }
}

/// Deletes every reading item, then every month bucket, then the root
/// collections.
///
/// Not transactional: a failure leaves part of the data behind and the
/// purge can simply be run again.
pub async fn purge<S>(store: &S) -> Result<PurgeReport, ServiceError>
where
    S: PartitionStore + ?Sized,
{
    let items = delete_in_batches(store, ITEMS, || store.query(GroupQuery::collection_group(ITEMS))).await?;

    let mut buckets = 0;
    let meters = CollectionPath::root(METERS)?;
    let mut meter_pages = store.list(&meters);
    while let Some(meter) = meter_pages.try_next().await? {
        let readings = meter.path.collection(READINGS)?;
        buckets += delete_in_batches(store, READINGS, || store.list(&readings)).await?;
    }
    drop(meter_pages);

    let mut roots = Vec::with_capacity(ROOT_COLLECTIONS.len());
    for name in ROOT_COLLECTIONS {
        let collection = CollectionPath::root(name)?;
        roots.push((name, delete_in_batches(store, name, || store.list(&collection)).await?));
    }

    let report = PurgeReport { items, buckets, roots };
    tracing::info!(total = report.total(), "purge finished");
    Ok(report)
}

/// Re-opens the listing after every batch until it comes back empty.
async fn delete_in_batches<'a, S, F>(store: &'a S, label: &str, mut open: F) -> Result<u64, ServiceError>
where
    S: PartitionStore + ?Sized,
    F: FnMut() -> SnapshotStream<'a>,
{
    let mut deleted = 0u64;
    loop {
        let batch: Vec<DocPath> = open()
            .take(DELETE_BATCH)
            .map_ok(|snapshot| snapshot.path)
            .try_collect()
            .await?;
        if batch.is_empty() {
            break;
        }
        for path in &batch {
            store.delete(path).await?;
        }
        deleted += batch.len() as u64;
        metrics::counter!("purge_documents_deleted_total").increment(batch.len() as u64);
        tracing::debug!(collection = label, deleted, "batch deleted");
    }
    if deleted > 0 {
        tracing::info!(collection = label, deleted, "collection purged");
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::ReadingWriter;
    use meter_store::{domain::Meter, Document, MemoryStore, WriteMode};
    use time::macros::datetime;

    #[tokio::test]
    async fn removes_everything_children_first() {
        let store = MemoryStore::new().with_page_size(3);
        let location = CollectionPath::root(LOCATIONS).unwrap().doc("LOC-1").unwrap();
        store.set(&location, Document::new(), WriteMode::Replace).await.unwrap();
        for meter in ["MTR-1", "MTR-2"] {
            store
                .set(&Meter::path(meter).unwrap(), Meter::initial_aggregates(), WriteMode::Replace)
                .await
                .unwrap();
        }
        let writer = ReadingWriter::new(&store);
        for hour in 0..5 {
            let ts = datetime!(2024-03-31 22:00:00 UTC) + time::Duration::hours(hour);
            writer.write_reading("MTR-1", None, ts, 0.010).await.unwrap();
        }
        writer.write_reading("MTR-2", None, datetime!(2024-03-01 00:00:00 UTC), 0.010).await.unwrap();

        let report = purge(&store).await.unwrap();
        assert_eq!(report.items, 6);
        assert_eq!(report.buckets, 3);
        assert_eq!(report.roots, vec![(CONDOMINIUMS, 0), (LOCATIONS, 1), (CLIENTS, 0), (METERS, 2)]);
        assert_eq!(store.document_count(), 0);

        let again = purge(&store).await.unwrap();
        assert_eq!(again.total(), 0);
    }
}
