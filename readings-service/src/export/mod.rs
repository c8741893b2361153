//! Sorted export of readings across every meter and month partition.
//!
//! Two orderings are produced:
//! * without a meter filter, one collection-group query over every item,
//!   ordered by meter id then timestamp;
//! * with a meter filter, one block per requested meter in the order the
//!   meters were given, each block ordered by timestamp.

use futures::{stream, StreamExt, TryStreamExt};
use time::{
    format_description::well_known::Rfc3339, macros::format_description, Date, OffsetDateTime,
    PrimitiveDateTime, Time, UtcOffset,
};

use meter_store::{
    db::{path::ITEMS, FieldAccess},
    domain::reading::fields as reading_fields,
    Document, GroupQuery, PartitionStore, Snapshot, SnapshotStream,
};

use crate::{
    error::ServiceError,
    pipeline::{RecordStream, Source},
};

/// Column carrying the item's document id in every exported record.
pub const DOC_ID_FIELD: &str = "_doc_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Start,
    End,
}

/// Parses a UTC time filter bound.
///
/// Accepts `YYYY-MM-DD`, `YYYY-MM-DDTHH:MM[:SS]` (taken as UTC) or a full
/// RFC 3339 timestamp. A date-only end bound covers the whole day.
pub fn parse_bound(raw: &str, bound: Bound) -> Result<OffsetDateTime, ServiceError> {
    let raw = raw.trim();

    if let Ok(ts) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Ok(ts.to_offset(UtcOffset::UTC));
    }
    if let Ok(ts) = PrimitiveDateTime::parse(raw, format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]")) {
        return Ok(ts.assume_utc());
    }
    if let Ok(ts) = PrimitiveDateTime::parse(raw, format_description!("[year]-[month]-[day]T[hour]:[minute]")) {
        return Ok(ts.assume_utc());
    }
    if let Ok(date) = Date::parse(raw, format_description!("[year]-[month]-[day]")) {
        let time = match bound {
            Bound::Start => Time::MIDNIGHT,
            Bound::End => Time::from_hms_micro(23, 59, 59, 999_999)
                .map_err(|e| ServiceError::InvalidArgument(e.to_string()))?,
        };
        return Ok(date.with_time(time).assume_utc());
    }

    Err(ServiceError::InvalidArgument(format!(
        "invalid date '{raw}', expected YYYY-MM-DD or YYYY-MM-DDTHH:MM[:SS]"
    )))
}

/// Inclusive time window over reading timestamps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<OffsetDateTime>,
    pub end: Option<OffsetDateTime>,
}

impl TimeRange {
    pub fn parse(start: Option<&str>, end: Option<&str>) -> Result<Self, ServiceError> {
        Ok(Self {
            start: start.map(|s| parse_bound(s, Bound::Start)).transpose()?,
            end: end.map(|s| parse_bound(s, Bound::End)).transpose()?,
        })
    }

    fn apply(&self, mut query: GroupQuery) -> GroupQuery {
        if let Some(start) = self.start {
            query = query.where_ge(reading_fields::TS_UTC, start);
        }
        if let Some(end) = self.end {
            query = query.where_le(reading_fields::TS_UTC, end);
        }
        query
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportFilter {
    pub range: TimeRange,
    /// Requested meters, in output order. Empty means every meter.
    pub meters: Vec<String>,
}

impl ExportFilter {
    pub fn is_per_meter(&self) -> bool {
        !self.meters.is_empty()
    }
}

/// One exported item: its stored fields plus [`DOC_ID_FIELD`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRecord {
    pub doc_id: String,
    pub fields: Document,
}

impl ExportRecord {
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let doc_id = snapshot.id().to_string();
        let mut fields = snapshot.data;
        fields.insert(DOC_ID_FIELD.to_string(), doc_id.as_str().into());
        Self { doc_id, fields }
    }

    pub fn meter_id(&self) -> Option<&str> {
        self.fields.str_field(reading_fields::METER_ID)
    }

    pub fn ts_utc(&self) -> Option<OffsetDateTime> {
        self.fields.timestamp_field(reading_fields::TS_UTC)
    }
}

/// Query over every meter's items ordered by (meter id, timestamp).
///
/// Needs a composite index on the `items` collection group.
pub fn all_meters_query(range: &TimeRange) -> GroupQuery {
    range
        .apply(GroupQuery::collection_group(ITEMS))
        .order_by(reading_fields::METER_ID)
        .order_by(reading_fields::TS_UTC)
}

/// Query over one meter's items ordered by timestamp.
pub fn meter_query(range: &TimeRange, meter_id: &str) -> GroupQuery {
    range
        .apply(GroupQuery::collection_group(ITEMS).where_eq(reading_fields::METER_ID, meter_id))
        .order_by(reading_fields::TS_UTC)
}

/// Streams readings in export order. Each per-meter block is exhausted
/// before the next meter's query is opened.
pub fn export<'a, S>(store: &'a S, filter: &ExportFilter) -> RecordStream<'a, ExportRecord>
where
    S: PartitionStore + ?Sized,
{
    let snapshots: SnapshotStream<'a> = if filter.is_per_meter() {
        tracing::info!(meters = filter.meters.len(), "exporting per-meter blocks");
        let range = filter.range;
        stream::iter(filter.meters.clone())
            .map(move |meter_id| store.query(meter_query(&range, &meter_id)))
            .flatten()
            .boxed()
    } else {
        tracing::info!("exporting all meters ordered by meter and timestamp");
        store.query(all_meters_query(&filter.range))
    };

    Box::pin(
        snapshots
            .map_ok(ExportRecord::from_snapshot)
            .map_err(ServiceError::from),
    )
}

/// [`Source`] over the sorted export of one store.
pub struct ReadingExport<'a, S: ?Sized> {
    store: &'a S,
    filter: ExportFilter,
}

impl<'a, S> ReadingExport<'a, S>
where
    S: PartitionStore + ?Sized,
{
    pub fn new(store: &'a S, filter: ExportFilter) -> Self {
        Self { store, filter }
    }

    pub fn filter(&self) -> &ExportFilter {
        &self.filter
    }
}

impl<'a, S> Source<ExportRecord> for ReadingExport<'a, S>
where
    S: PartitionStore + ?Sized,
{
    fn stream(&self) -> RecordStream<'_, ExportRecord> {
        export(self.store, &self.filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::ReadingWriter;
    use meter_store::{domain::Meter, MemoryStore, WriteMode};
    use time::macros::datetime;

    async fn seed(store: &MemoryStore, readings: &[(&str, OffsetDateTime, f64)]) {
        for (meter_id, _, _) in readings {
            let path = Meter::path(meter_id).unwrap();
            if store.get(&path).await.unwrap().is_none() {
                store
                    .set(&path, Meter::initial_aggregates(), WriteMode::Replace)
                    .await
                    .unwrap();
            }
        }
        let writer = ReadingWriter::new(store);
        for (meter_id, ts, volume) in readings {
            writer.write_reading(meter_id, None, *ts, *volume).await.unwrap();
        }
    }

    async fn collect(store: &MemoryStore, filter: &ExportFilter) -> Vec<(String, OffsetDateTime)> {
        export(store, filter)
            .map_ok(|r| (r.meter_id().unwrap().to_string(), r.ts_utc().unwrap()))
            .try_collect()
            .await
            .unwrap()
    }

    fn scattered() -> Vec<(&'static str, OffsetDateTime, f64)> {
        vec![
            ("MTR-B", datetime!(2024-04-02 08:00:00 UTC), 0.011),
            ("MTR-A", datetime!(2024-04-01 00:00:00 UTC), 0.010),
            ("MTR-B", datetime!(2024-03-30 23:00:00 UTC), 0.009),
            ("MTR-A", datetime!(2024-03-15 12:00:00 UTC), 0.012),
            ("MTR-C", datetime!(2024-03-01 00:00:00 UTC), 0.008),
            ("MTR-A", datetime!(2024-03-15 06:00:00 UTC), 0.010),
        ]
    }

    #[test]
    fn date_only_bounds_cover_whole_days() {
        assert_eq!(
            parse_bound("2024-03-11", Bound::Start).unwrap(),
            datetime!(2024-03-11 00:00:00 UTC)
        );
        assert_eq!(
            parse_bound("2024-03-11", Bound::End).unwrap(),
            datetime!(2024-03-11 23:59:59.999999 UTC)
        );
        assert_eq!(
            parse_bound("2024-03-11T06:30:00", Bound::End).unwrap(),
            datetime!(2024-03-11 06:30:00 UTC)
        );
        assert_eq!(
            parse_bound("2024-03-11T06:30", Bound::End).unwrap(),
            datetime!(2024-03-11 06:30:00 UTC)
        );
        assert_eq!(
            parse_bound("2024-03-11T06:30:00-03:00", Bound::Start).unwrap(),
            datetime!(2024-03-11 09:30:00 UTC)
        );
    }

    #[test]
    fn malformed_bounds_are_invalid_arguments() {
        for raw in ["11/03/2024", "2024-13-01", "2024-03-11T06", "yesterday", ""] {
            assert!(
                matches!(parse_bound(raw, Bound::Start), Err(ServiceError::InvalidArgument(_))),
                "{raw}"
            );
        }
    }

    #[tokio::test]
    async fn unfiltered_export_is_ordered_by_meter_then_timestamp() {
        let store = MemoryStore::new().with_page_size(2);
        seed(&store, &scattered()).await;

        let rows = collect(&store, &ExportFilter::default()).await;
        assert_eq!(rows.len(), 6);
        assert!(rows.windows(2).all(|w| w[0] <= w[1]), "{rows:?}");
        assert_eq!(rows[0], ("MTR-A".to_string(), datetime!(2024-03-15 06:00:00 UTC)));
        assert_eq!(rows[5], ("MTR-C".to_string(), datetime!(2024-03-01 00:00:00 UTC)));
    }

    #[tokio::test]
    async fn meter_filter_emits_blocks_in_request_order() {
        let store = MemoryStore::new();
        seed(&store, &scattered()).await;

        let ab = collect(&store, &ExportFilter { meters: vec!["MTR-A".into(), "MTR-B".into()], ..Default::default() }).await;
        let ba = collect(&store, &ExportFilter { meters: vec!["MTR-B".into(), "MTR-A".into()], ..Default::default() }).await;

        let meters: Vec<&str> = ab.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(meters, ["MTR-A", "MTR-A", "MTR-A", "MTR-B", "MTR-B"]);
        assert!(ab[..3].windows(2).all(|w| w[0].1 <= w[1].1));
        assert!(ab[3..].windows(2).all(|w| w[0].1 <= w[1].1));

        let mut expected = ab[3..].to_vec();
        expected.extend_from_slice(&ab[..3]);
        assert_eq!(ba, expected);
    }

    #[tokio::test]
    async fn repeated_meters_repeat_their_filtered_block() {
        let store = MemoryStore::new();
        seed(&store, &scattered()).await;

        let filter = ExportFilter {
            range: TimeRange::parse(Some("2024-03-01"), Some("2024-03-31")).unwrap(),
            meters: vec!["MTR-A".into(), "MTR-B".into(), "MTR-A".into()],
        };
        let rows = collect(&store, &filter).await;

        let a_block = vec![
            ("MTR-A".to_string(), datetime!(2024-03-15 06:00:00 UTC)),
            ("MTR-A".to_string(), datetime!(2024-03-15 12:00:00 UTC)),
        ];
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[..2], a_block[..]);
        assert_eq!(rows[2], ("MTR-B".to_string(), datetime!(2024-03-30 23:00:00 UTC)));
        assert_eq!(rows[3..], a_block[..]);
    }

    #[tokio::test]
    async fn meter_ids_sort_by_bytes() {
        let store = MemoryStore::new();
        seed(
            &store,
            &[
                ("mtr-a", datetime!(2024-03-11 00:00:00 UTC), 0.010),
                ("MTR-Z", datetime!(2024-03-11 00:00:00 UTC), 0.010),
            ],
        )
        .await;

        let meters: Vec<String> = collect(&store, &ExportFilter::default())
            .await
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        assert_eq!(meters, ["MTR-Z", "mtr-a"]);
    }

    #[tokio::test]
    async fn unknown_meters_contribute_empty_blocks() {
        let store = MemoryStore::new();
        seed(&store, &scattered()).await;

        let rows = collect(&store, &ExportFilter { meters: vec!["MTR-404".into(), "MTR-C".into()], ..Default::default() }).await;
        assert_eq!(rows, vec![("MTR-C".to_string(), datetime!(2024-03-01 00:00:00 UTC))]);
    }

    #[tokio::test]
    async fn same_day_range_includes_both_readings() {
        let store = MemoryStore::new();
        seed(
            &store,
            &[
                ("MTR-000001", datetime!(2024-03-11 00:00:00 UTC), 0.010),
                ("MTR-000001", datetime!(2024-03-11 01:00:00 UTC), 0.012),
                ("MTR-000001", datetime!(2024-03-12 00:00:00 UTC), 0.013),
            ],
        )
        .await;

        let filter = ExportFilter {
            range: TimeRange::parse(Some("2024-03-11"), Some("2024-03-11")).unwrap(),
            meters: Vec::new(),
        };
        let records: Vec<ExportRecord> = export(&store, &filter).try_collect().await.unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].ts_utc(), Some(datetime!(2024-03-11 00:00:00 UTC)));
        assert_eq!(records[1].ts_utc(), Some(datetime!(2024-03-11 01:00:00 UTC)));
        for record in &records {
            assert_eq!(record.fields[DOC_ID_FIELD].as_str(), Some(record.doc_id.as_str()));
        }
    }

    #[tokio::test]
    async fn missing_composite_index_is_surfaced() {
        let store = MemoryStore::new().require_composite_indexes();
        seed(&store, &[("MTR-000001", datetime!(2024-03-11 00:00:00 UTC), 0.010)]).await;

        let res: Result<Vec<ExportRecord>, _> = export(&store, &ExportFilter::default()).try_collect().await;
        match res {
            Err(ServiceError::IndexRequired(msg)) => assert!(msg.contains("composite index")),
            other => panic!("expected IndexRequired, got {other:?}"),
        }

        let indexed = MemoryStore::new()
            .require_composite_indexes()
            .with_composite_index(ITEMS, &[reading_fields::METER_ID, reading_fields::TS_UTC]);
        seed(&indexed, &[("MTR-000001", datetime!(2024-03-11 00:00:00 UTC), 0.010)]).await;
        assert_eq!(collect(&indexed, &ExportFilter::default()).await.len(), 1);
    }
}
