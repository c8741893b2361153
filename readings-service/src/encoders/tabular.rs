use std::io::Write;

use meter_store::{domain::reading::fields, Value};

use super::{render_timestamp, to_plain_json, RecordEncoder};
use crate::{
    error::ServiceError,
    export::{ExportRecord, DOC_ID_FIELD},
};

/// Leading columns of every tabular export, in this order.
pub const BASE_COLUMNS: [&str; 11] = [
    fields::METER_ID,
    fields::CLIENT_ID,
    fields::TS_UTC,
    fields::YEAR_MONTH_REF,
    fields::VOLUME_M3,
    fields::PULSES,
    fields::SENSOR_STATUS,
    fields::LEAK_FLAG,
    fields::INGESTED_AT,
    fields::ARCHIVED_AT,
    DOC_ID_FIELD,
];

/// Delimited text with a header row.
///
/// The column set is fixed by the first record: the base columns followed
/// by that record's other fields. Fields that only show up on later records
/// are dropped. No records means an empty output, not even a header.
pub struct TabularEncoder<W: Write> {
    writer: csv::Writer<W>,
    columns: Option<Vec<String>>,
}

impl<W: Write> TabularEncoder<W> {
    pub fn new(inner: W, delimiter: u8) -> Self {
        let writer = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .from_writer(inner);
        Self {
            writer,
            columns: None,
        }
    }

    pub fn columns(&self) -> Option<&[String]> {
        self.columns.as_deref()
    }

    pub fn into_inner(self) -> Result<W, ServiceError> {
        self.writer
            .into_inner()
            .map_err(|e| ServiceError::Encode(e.to_string()))
    }
}

fn columns_for(record: &ExportRecord) -> Vec<String> {
    let mut columns: Vec<String> = BASE_COLUMNS.iter().map(|c| c.to_string()).collect();
    columns.extend(
        record
            .fields
            .keys()
            .filter(|k| !BASE_COLUMNS.contains(&k.as_str()))
            .cloned(),
    );
    columns
}

fn render_cell(value: Option<&Value>) -> Result<String, ServiceError> {
    Ok(match value {
        None | Some(Value::Null) | Some(Value::ServerTimestamp) => String::new(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Int(i)) => i.to_string(),
        Some(Value::Float(f)) => f.to_string(),
        Some(Value::Timestamp(ts)) => render_timestamp(*ts)?,
        Some(Value::String(s)) => s.clone(),
        Some(map @ Value::Map(_)) => serde_json::to_string(&to_plain_json(map)?)?,
    })
}

impl<W: Write + Send> RecordEncoder for TabularEncoder<W> {
    fn write_record(&mut self, record: &ExportRecord) -> Result<(), ServiceError> {
        if self.columns.is_none() {
            let columns = columns_for(record);
            self.writer.write_record(&columns)?;
            self.columns = Some(columns);
        }
        let columns = self.columns.as_deref().unwrap_or_default();

        let row = columns
            .iter()
            .map(|c| render_cell(record.fields.get(c)))
            .collect::<Result<Vec<_>, _>>()?;
        self.writer.write_record(&row)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), ServiceError> {
        self.writer.flush()?;
        Ok(())
    }
}
