pub mod jsonl;
pub mod tabular;

use std::{
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
};

use futures::{Stream, StreamExt};
use time::{macros::format_description, OffsetDateTime, UtcOffset};

use meter_store::Value;

use crate::{error::ServiceError, export::{ExportFilter, ExportRecord}, pipeline::Sink};

pub use jsonl::JsonLinesEncoder;
pub use tabular::TabularEncoder;

const FILE_STEM: &str = "readings_all_sorted";

/// Serializes records to one output, in arrival order.
pub trait RecordEncoder: Send {
    fn write_record(&mut self, record: &ExportRecord) -> Result<(), ServiceError>;

    /// Flushes buffered output. Called once after the last record.
    fn finish(&mut self) -> Result<(), ServiceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Tabular,
    JsonLines,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Tabular => "csv",
            OutputFormat::JsonLines => "jsonl",
        }
    }
}

/// Timestamps are always rendered in UTC as RFC 3339 with exactly six
/// fractional digits, so every value in a column has the same width.
pub fn render_timestamp(ts: OffsetDateTime) -> Result<String, ServiceError> {
    ts.to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
        ))
        .map_err(|e| ServiceError::Encode(format!("timestamp {ts}: {e}")))
}

/// Plain JSON form of a stored value.
pub fn to_plain_json(value: &Value) -> Result<serde_json::Value, ServiceError> {
    Ok(match value {
        Value::Null | Value::ServerTimestamp => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Timestamp(ts) => serde_json::Value::String(render_timestamp(*ts)?),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Map(map) => {
            let mut obj = serde_json::Map::new();
            for (k, v) in map {
                obj.insert(k.clone(), to_plain_json(v)?);
            }
            serde_json::Value::Object(obj)
        }
    })
}

/// Deterministic output file name:
/// `readings_all_sorted[_<start>][_<end>][_<meter>...].<ext>`.
pub fn output_file_name(format: OutputFormat, filter: &ExportFilter) -> String {
    let mut parts = vec![FILE_STEM.to_string()];
    if let Some(start) = filter.range.start {
        parts.push(start.date().to_string());
    }
    if let Some(end) = filter.range.end {
        parts.push(end.date().to_string());
    }
    parts.extend(filter.meters.iter().cloned());
    format!("{}.{}", parts.join("_"), format.extension())
}

/// Validates a CSV field delimiter.
pub fn delimiter_byte(delimiter: char) -> Result<u8, ServiceError> {
    match delimiter {
        '"' | '\n' | '\r' => Err(ServiceError::InvalidArgument(format!(
            "{delimiter:?} can't be used as a delimiter"
        ))),
        c if c.is_ascii() => Ok(c as u8),
        c => Err(ServiceError::InvalidArgument(format!(
            "delimiter must be a single ASCII character, got {c:?}"
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOutput {
    pub format: OutputFormat,
    pub path: PathBuf,
}

/// Feeds every record of one pass to all encoders.
pub struct EncoderSink {
    encoders: Vec<Box<dyn RecordEncoder>>,
}

impl EncoderSink {
    pub fn new(encoders: Vec<Box<dyn RecordEncoder>>) -> Self {
        Self { encoders }
    }

    /// Creates one output file per format under `out_dir`.
    pub fn create(
        out_dir: &Path,
        formats: &[OutputFormat],
        filter: &ExportFilter,
        delimiter: u8,
    ) -> Result<(Self, Vec<ExportOutput>), ServiceError> {
        fs::create_dir_all(out_dir)?;

        let mut encoders: Vec<Box<dyn RecordEncoder>> = Vec::with_capacity(formats.len());
        let mut outputs = Vec::with_capacity(formats.len());
        for &format in formats {
            let path = out_dir.join(output_file_name(format, filter));
            let file = BufWriter::new(File::create(&path)?);
            encoders.push(match format {
                OutputFormat::Tabular => Box::new(TabularEncoder::new(file, delimiter)),
                OutputFormat::JsonLines => Box::new(JsonLinesEncoder::new(file)),
            });
            outputs.push(ExportOutput { format, path });
        }
        Ok((Self::new(encoders), outputs))
    }
}

#[async_trait::async_trait]
impl Sink<ExportRecord> for EncoderSink {
    async fn run<S>(&mut self, mut input: S) -> Result<u64, ServiceError>
    where
        S: Stream<Item = Result<ExportRecord, ServiceError>> + Send + Unpin,
    {
        let mut written = 0u64;
        while let Some(record) = input.next().await {
            let record = record?;
            for encoder in self.encoders.iter_mut() {
                encoder.write_record(&record)?;
            }
            written += 1;
            if written % 10_000 == 0 {
                tracing::info!(written, "export progress");
            }
        }
        for encoder in self.encoders.iter_mut() {
            encoder.finish()?;
        }

        metrics::counter!("export_records_total").increment(written);
        tracing::info!(written, outputs = self.encoders.len(), "export finished");
        Ok(written)
    }
}
