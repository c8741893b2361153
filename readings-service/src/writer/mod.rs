use time::{OffsetDateTime, UtcOffset};

use meter_store::{
    domain::{meter::fields as meter_fields, month::bucket_fields, Meter, Reading},
    DocPath, Document, FieldUpdate, PartitionStore, WriteMode,
};

use crate::error::ServiceError;

/// Rejects volumes that can't be accumulated into a monthly total.
pub fn validate_volume(volume_m3: f64) -> Result<(), ServiceError> {
    if !volume_m3.is_finite() {
        return Err(ServiceError::InvalidArgument(format!(
            "volume must be a finite number, got {volume_m3}"
        )));
    }
    if volume_m3 < 0.0 {
        return Err(ServiceError::InvalidArgument(format!(
            "volume must not be negative, got {volume_m3}"
        )));
    }
    Ok(())
}

/// Persists readings under their meter's month bucket and keeps the
/// meter's aggregates in step.
pub struct ReadingWriter<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S> ReadingWriter<'a, S>
where
    S: PartitionStore + ?Sized,
{
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Writes one reading and returns the path of the stored item.
    ///
    /// The bucket upsert, the item insert and the meter update are
    /// separate writes. The meter update itself is atomic, so concurrent
    /// writers never lose an increment. A failure after the item insert
    /// leaves the item in place without its aggregate contribution.
    pub async fn write_reading(
        &self,
        meter_id: &str,
        client_id: Option<&str>,
        ts: OffsetDateTime,
        volume_m3: f64,
    ) -> Result<DocPath, ServiceError> {
        validate_volume(volume_m3)?;
        if meter_id.trim().is_empty() {
            return Err(ServiceError::InvalidArgument("meter id must not be empty".to_string()));
        }

        let ts = ts.to_offset(UtcOffset::UTC);
        let meter_path = Meter::path(meter_id).map_err(ServiceError::bad_id)?;
        if self.store.get(&meter_path).await?.is_none() {
            return Err(ServiceError::NotFound(format!("meter {meter_id}")));
        }

        let reading = Reading::new(meter_id, client_id.map(str::to_string), ts, volume_m3);
        let month = reading.month();

        let mut bucket = Document::new();
        bucket.insert(bucket_fields::BUCKET.to_string(), month.to_string().into());
        bucket.insert(bucket_fields::CREATED_AT.to_string(), ts.into());
        self.store
            .set(&month.bucket_path(meter_id)?, bucket, WriteMode::Merge)
            .await?;

        let item = self
            .store
            .add(&month.items_collection(meter_id)?, reading.to_document())
            .await?;

        self.store
            .update(
                &meter_path,
                &[
                    FieldUpdate::set(meter_fields::LAST_TS_UTC, ts),
                    FieldUpdate::set(meter_fields::LAST_VOLUME_M3, volume_m3),
                    FieldUpdate::increment(Meter::monthly_total_field(month), volume_m3),
                ],
            )
            .await?;

        metrics::counter!("readings_written_total").increment(1);
        tracing::debug!(meter_id, bucket = %month, item = %item, volume_m3, "reading written");
        Ok(item)
    }
}
