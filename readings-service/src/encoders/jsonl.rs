use std::io::Write;

use super::{to_plain_json, RecordEncoder};
use crate::{error::ServiceError, export::ExportRecord};

/// One JSON object per line, every field kept.
pub struct JsonLinesEncoder<W: Write> {
    out: W,
}

impl<W: Write> JsonLinesEncoder<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> RecordEncoder for JsonLinesEncoder<W> {
    fn write_record(&mut self, record: &ExportRecord) -> Result<(), ServiceError> {
        let mut obj = serde_json::Map::new();
        for (name, value) in &record.fields {
            obj.insert(name.clone(), to_plain_json(value)?);
        }
        serde_json::to_writer(&mut self.out, &obj)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), ServiceError> {
        self.out.flush()?;
        Ok(())
    }
}
