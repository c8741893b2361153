use std::collections::BTreeMap;

use time::OffsetDateTime;

use crate::db::{
    document::FieldAccess,
    error::StoreError,
    path::METERS,
    CollectionPath, DocPath, Document, Value,
};

use super::{common_fields, MonthKey};

pub mod fields {
    pub const CLIENT_ID: &str = "f_client_id";
    pub const CONDOMINIUM_ID: &str = "f_condominium_id";
    pub const HAS_VALVE: &str = "f_has_valve";
    pub const VALVE_STATUS: &str = "f_valve_status";
    pub const HW_MODEL: &str = "f_hw_model";
    pub const FW_VERSION: &str = "f_fw_version";
    pub const INSTALL_NOTE: &str = "f_install_note";
    pub const LAST_TS_UTC: &str = "f_last_ts_utc";
    pub const LAST_VOLUME_M3: &str = "f_last_volume_m3";
    pub const MONTHLY_TOTAL_M3: &str = "f_monthly_total_m3";
}

/// A metering device, root of its month buckets and readings.
#[derive(Debug, Clone, PartialEq)]
pub struct Meter {
    pub id: String,
    pub client_id: Option<String>,
    pub condominium_id: Option<String>,
    pub has_valve: bool,
    pub valve_status: Option<String>,
    pub hw_model: Option<String>,
    pub fw_version: Option<String>,
    pub install_note: Option<String>,
    pub created_at: Option<OffsetDateTime>,
    pub active: bool,
    pub last_ts_utc: Option<OffsetDateTime>,
    pub last_volume_m3: Option<f64>,
    /// Accumulated volume per `YYYY_MM` bucket.
    pub monthly_total_m3: BTreeMap<String, f64>,
}

impl Meter {
    pub fn collection() -> Result<CollectionPath, StoreError> {
        CollectionPath::root(METERS)
    }

    pub fn path(id: &str) -> Result<DocPath, StoreError> {
        Self::collection()?.doc(id)
    }

    /// Dotted field path of one monthly accumulator.
    pub fn monthly_total_field(month: MonthKey) -> String {
        format!("{}.{month}", fields::MONTHLY_TOTAL_M3)
    }

    pub fn monthly_total(&self, month: MonthKey) -> f64 {
        self.monthly_total_m3
            .get(&month.to_string())
            .copied()
            .unwrap_or(0.0)
    }

    /// Aggregate fields of a freshly created meter.
    pub fn initial_aggregates() -> Document {
        let mut doc = Document::new();
        doc.insert(fields::LAST_TS_UTC.to_string(), Value::Null);
        doc.insert(fields::LAST_VOLUME_M3.to_string(), Value::Null);
        doc.insert(fields::MONTHLY_TOTAL_M3.to_string(), Value::Map(Document::new()));
        doc
    }

    pub fn from_document(id: &str, doc: &Document) -> Result<Self, StoreError> {
        let owned = |name: &str| doc.str_field(name).map(str::to_string);

        let mut monthly_total_m3 = BTreeMap::new();
        if let Some(totals) = doc.field(fields::MONTHLY_TOTAL_M3) {
            let totals = totals.as_map().ok_or_else(|| {
                StoreError::InvalidData(format!("meter {id}: {} is not a map", fields::MONTHLY_TOTAL_M3))
            })?;
            for (bucket, total) in totals {
                let total = total.as_f64().ok_or_else(|| {
                    StoreError::InvalidData(format!("meter {id}: monthly total {bucket} is not numeric"))
                })?;
                monthly_total_m3.insert(bucket.clone(), total);
            }
        }

        Ok(Self {
            id: id.to_string(),
            client_id: owned(fields::CLIENT_ID),
            condominium_id: owned(fields::CONDOMINIUM_ID),
            has_valve: doc.bool_field(fields::HAS_VALVE).unwrap_or(false),
            valve_status: owned(fields::VALVE_STATUS),
            hw_model: owned(fields::HW_MODEL),
            fw_version: owned(fields::FW_VERSION),
            install_note: owned(fields::INSTALL_NOTE),
            created_at: doc.timestamp_field(common_fields::CREATED_AT),
            active: doc.bool_field(common_fields::ACTIVE).unwrap_or(true),
            last_ts_utc: doc.timestamp_field(fields::LAST_TS_UTC),
            last_volume_m3: doc.f64_field(fields::LAST_VOLUME_M3),
            monthly_total_m3,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn reads_aggregates_from_document() {
        let mut totals = Document::new();
        totals.insert("2024_03".to_string(), Value::Float(0.022));
        totals.insert("2024_04".to_string(), Value::Int(1));

        let mut doc = Document::new();
        doc.insert(fields::CLIENT_ID.to_string(), "CLI-1".into());
        doc.insert(fields::HAS_VALVE.to_string(), true.into());
        doc.insert(fields::LAST_TS_UTC.to_string(), datetime!(2024-03-11 01:00:00 UTC).into());
        doc.insert(fields::MONTHLY_TOTAL_M3.to_string(), Value::Map(totals));
        doc.insert(fields::VALVE_STATUS.to_string(), Value::Null);

        let meter = Meter::from_document("MTR-000001", &doc).unwrap();
        assert_eq!(meter.client_id.as_deref(), Some("CLI-1"));
        assert!(meter.has_valve);
        assert!(meter.valve_status.is_none());
        assert_eq!(meter.monthly_total(MonthKey::new(2024, 3).unwrap()), 0.022);
        assert_eq!(meter.monthly_total(MonthKey::new(2024, 4).unwrap()), 1.0);
        assert_eq!(meter.monthly_total(MonthKey::new(2024, 5).unwrap()), 0.0);
        assert_eq!(meter.last_ts_utc, Some(datetime!(2024-03-11 01:00:00 UTC)));
    }

    #[test]
    fn monthly_total_field_is_dotted() {
        let field = Meter::monthly_total_field(MonthKey::new(2024, 3).unwrap());
        assert_eq!(field, "f_monthly_total_m3.2024_03");
    }
}
