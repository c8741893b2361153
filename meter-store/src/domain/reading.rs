use time::OffsetDateTime;

use crate::db::{document::FieldAccess, error::StoreError, Document, Value};

use super::MonthKey;

/// One pulse per litre.
pub const PULSES_PER_M3: f64 = 1000.0;

pub const DEFAULT_SENSOR_STATUS: i64 = 1;

pub mod fields {
    pub const METER_ID: &str = "f_meter_id";
    pub const CLIENT_ID: &str = "f_client_id";
    pub const TS_UTC: &str = "f_ts_utc";
    pub const YEAR_MONTH_REF: &str = "f_year_month_ref";
    pub const VOLUME_M3: &str = "f_volume_m3";
    pub const PULSES: &str = "f_pulses";
    pub const SENSOR_STATUS: &str = "f_sensor_status";
    pub const LEAK_FLAG: &str = "f_leak_flag";
    pub const INGESTED_AT: &str = "f_ingested_at";
    pub const ARCHIVED_AT: &str = "f_archived_at";
}

pub fn pulse_count(volume_m3: f64) -> i64 {
    (volume_m3 * PULSES_PER_M3).round() as i64
}

/// A timestamped volume delta observed on a meter.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub meter_id: String,
    pub client_id: Option<String>,
    pub ts_utc: OffsetDateTime,
    pub year_month_ref: String,
    pub volume_m3: f64,
    pub pulses: i64,
    pub sensor_status: i64,
    pub leak_flag: bool,
    /// Assigned by the store on insert; `None` until then.
    pub ingested_at: Option<OffsetDateTime>,
    pub archived_at: Option<OffsetDateTime>,
}

impl Reading {
    /// Builds a new reading with derived pulse count and default status
    /// fields.
    pub fn new(meter_id: &str, client_id: Option<String>, ts_utc: OffsetDateTime, volume_m3: f64) -> Self {
        Self {
            meter_id: meter_id.to_string(),
            client_id,
            ts_utc,
            year_month_ref: MonthKey::from_timestamp(ts_utc).year_month_ref(),
            volume_m3,
            pulses: pulse_count(volume_m3),
            sensor_status: DEFAULT_SENSOR_STATUS,
            leak_flag: false,
            ingested_at: None,
            archived_at: None,
        }
    }

    pub fn month(&self) -> MonthKey {
        MonthKey::from_timestamp(self.ts_utc)
    }

    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert(fields::METER_ID.to_string(), self.meter_id.as_str().into());
        doc.insert(fields::CLIENT_ID.to_string(), self.client_id.clone().into());
        doc.insert(fields::TS_UTC.to_string(), self.ts_utc.into());
        doc.insert(fields::YEAR_MONTH_REF.to_string(), self.year_month_ref.as_str().into());
        doc.insert(fields::VOLUME_M3.to_string(), self.volume_m3.into());
        doc.insert(fields::PULSES.to_string(), self.pulses.into());
        doc.insert(fields::SENSOR_STATUS.to_string(), self.sensor_status.into());
        doc.insert(fields::LEAK_FLAG.to_string(), self.leak_flag.into());
        doc.insert(
            fields::INGESTED_AT.to_string(),
            self.ingested_at.map(Value::Timestamp).unwrap_or(Value::ServerTimestamp),
        );
        doc.insert(fields::ARCHIVED_AT.to_string(), self.archived_at.into());
        doc
    }

    pub fn from_document(doc: &Document) -> Result<Self, StoreError> {
        let required = |name: &str| StoreError::InvalidData(format!("reading is missing '{name}'"));

        let meter_id = doc.str_field(fields::METER_ID).ok_or_else(|| required(fields::METER_ID))?;
        let ts_utc = doc.timestamp_field(fields::TS_UTC).ok_or_else(|| required(fields::TS_UTC))?;
        let volume_m3 = doc.f64_field(fields::VOLUME_M3).ok_or_else(|| required(fields::VOLUME_M3))?;

        Ok(Self {
            meter_id: meter_id.to_string(),
            client_id: doc.str_field(fields::CLIENT_ID).map(str::to_string),
            ts_utc,
            year_month_ref: doc
                .str_field(fields::YEAR_MONTH_REF)
                .map(str::to_string)
                .unwrap_or_else(|| MonthKey::from_timestamp(ts_utc).year_month_ref()),
            volume_m3,
            pulses: doc.i64_field(fields::PULSES).unwrap_or_else(|| pulse_count(volume_m3)),
            sensor_status: doc.i64_field(fields::SENSOR_STATUS).unwrap_or(DEFAULT_SENSOR_STATUS),
            leak_flag: doc.bool_field(fields::LEAK_FLAG).unwrap_or(false),
            ingested_at: doc.timestamp_field(fields::INGESTED_AT),
            archived_at: doc.timestamp_field(fields::ARCHIVED_AT),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn new_reading_derives_pulses_and_defaults() {
        let r = Reading::new("MTR-000001", None, datetime!(2024-03-11 00:00:00 UTC), 0.0126);
        assert_eq!(r.pulses, 13);
        assert_eq!(r.year_month_ref, "2024-03");
        assert_eq!(r.sensor_status, 1);
        assert!(!r.leak_flag);
        assert_eq!(r.month().to_string(), "2024_03");
    }

    #[test]
    fn document_requests_server_ingestion_time() {
        let r = Reading::new("MTR-000001", Some("CLI-1".to_string()), datetime!(2024-03-11 00:00:00 UTC), 0.010);
        let doc = r.to_document();
        assert_eq!(doc[fields::INGESTED_AT], Value::ServerTimestamp);
        assert_eq!(doc[fields::ARCHIVED_AT], Value::Null);
        assert_eq!(doc[fields::PULSES], Value::Int(10));
    }

    #[test]
    fn from_document_requires_core_fields() {
        let mut doc = Document::new();
        doc.insert(fields::METER_ID.to_string(), "MTR-000001".into());
        assert!(matches!(Reading::from_document(&doc), Err(StoreError::InvalidData(_))));

        doc.insert(fields::TS_UTC.to_string(), datetime!(2024-03-11 00:00:00 UTC).into());
        doc.insert(fields::VOLUME_M3.to_string(), 0.012.into());
        let r = Reading::from_document(&doc).unwrap();
        assert_eq!(r.pulses, 12);
        assert!(r.client_id.is_none());
    }
}
