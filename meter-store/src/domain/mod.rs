pub mod meter;
pub mod month;
pub mod reading;

pub use meter::Meter;
pub use month::MonthKey;
pub use reading::Reading;

/// Fields shared by every root record.
pub mod common_fields {
    pub const CREATED_AT: &str = "f_created_at";
    pub const ACTIVE: &str = "f_active";
}
