use std::{fmt, str::FromStr};

use time::{OffsetDateTime, UtcOffset};

use crate::db::{error::StoreError, path::READINGS, CollectionPath, DocPath};

/// Calendar month a reading is bucketed under, rendered `YYYY_MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonthKey {
    year: i32,
    month: u8,
}

impl MonthKey {
    pub fn new(year: i32, month: u8) -> Result<Self, StoreError> {
        if !(1..=12).contains(&month) {
            return Err(StoreError::InvalidData(format!("month {month} out of range")));
        }
        Ok(Self { year, month })
    }

    /// Bucket of a timestamp, taken in UTC.
    pub fn from_timestamp(ts: OffsetDateTime) -> Self {
        let utc = ts.to_offset(UtcOffset::UTC);
        Self {
            year: utc.year(),
            month: u8::from(utc.month()),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u8 {
        self.month
    }

    /// Human readable reference stored on each reading (`YYYY-MM`).
    pub fn year_month_ref(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }

    /// `meter/{meter_id}/readings/{YYYY_MM}`.
    pub fn bucket_path(&self, meter_id: &str) -> Result<DocPath, StoreError> {
        crate::domain::Meter::path(meter_id)?
            .collection(READINGS)?
            .doc(&self.to_string())
    }

    /// `meter/{meter_id}/readings/{YYYY_MM}/items`.
    pub fn items_collection(&self, meter_id: &str) -> Result<CollectionPath, StoreError> {
        self.bucket_path(meter_id)?.collection(crate::db::path::ITEMS)
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}_{:02}", self.year, self.month)
    }
}

impl FromStr for MonthKey {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StoreError::InvalidData(format!("invalid month bucket '{s}', expected YYYY_MM"));
        let (year, month) = s.split_once('_').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month: u8 = month.parse().map_err(|_| invalid())?;
        Self::new(year, month)
    }
}

/// Partitioning document grouping a meter's readings for one month.
pub mod bucket_fields {
    pub const BUCKET: &str = "f_bucket";
    pub const CREATED_AT: &str = "f_created_at";
}
