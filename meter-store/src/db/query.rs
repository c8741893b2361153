use std::cmp::Ordering;

use super::{
    document::{field_path, get_path, Document, Value},
    path::DocPath,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl FilterOp {
    pub fn accepts(self, ord: Ordering) -> bool {
        match self {
            FilterOp::Eq => ord == Ordering::Equal,
            FilterOp::Lt => ord == Ordering::Less,
            FilterOp::Le => ord != Ordering::Greater,
            FilterOp::Gt => ord == Ordering::Greater,
            FilterOp::Ge => ord != Ordering::Less,
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Lt => "<",
            FilterOp::Le => "<=",
            FilterOp::Gt => ">",
            FilterOp::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

/// A query over every collection named `collection_id`, whatever its parent.
///
/// Results are ordered by `order_by` (ascending) and then by document path.
/// Documents lacking an ordered field are not returned.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupQuery {
    pub collection_id: String,
    pub filters: Vec<Filter>,
    pub order_by: Vec<String>,
}

impl GroupQuery {
    pub fn collection_group(collection_id: &str) -> Self {
        Self {
            collection_id: collection_id.to_string(),
            filters: Vec::new(),
            order_by: Vec::new(),
        }
    }

    pub fn filter(mut self, field: &str, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.to_string(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn where_eq(self, field: &str, value: impl Into<Value>) -> Self {
        self.filter(field, FilterOp::Eq, value)
    }

    pub fn where_ge(self, field: &str, value: impl Into<Value>) -> Self {
        self.filter(field, FilterOp::Ge, value)
    }

    pub fn where_le(self, field: &str, value: impl Into<Value>) -> Self {
        self.filter(field, FilterOp::Le, value)
    }

    pub fn order_by(mut self, field: &str) -> Self {
        self.order_by.push(field.to_string());
        self
    }

    /// Ordering by more than one field needs a composite index.
    pub fn requires_composite_index(&self) -> bool {
        self.order_by.len() > 1
    }

    pub fn matches(&self, data: &Document) -> bool {
        self.filters.iter().all(|f| {
            get_path(data, &field_path(&f.field))
                .and_then(|v| v.compare(&f.value))
                .is_some_and(|ord| f.op.accepts(ord))
        })
    }

    /// Values of the ordered fields, or `None` when one of them is missing.
    pub fn sort_values(&self, data: &Document) -> Option<Vec<Value>> {
        self.order_by
            .iter()
            .map(|field| get_path(data, &field_path(field)).cloned())
            .collect()
    }
}

/// A document as returned by reads and queries.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub path: DocPath,
    pub data: Document,
}

impl Snapshot {
    pub fn id(&self) -> &str {
        self.path.id()
    }
}

/// One change applied by [`PartitionStore::update`](super::PartitionStore::update).
///
/// Field names may be dotted to address nested map entries.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    Set { field: String, value: Value },
    /// Atomic numeric add performed by the store.
    Increment { field: String, by: f64 },
}

impl FieldUpdate {
    pub fn set(field: impl Into<String>, value: impl Into<Value>) -> Self {
        FieldUpdate::Set {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn increment(field: impl Into<String>, by: f64) -> Self {
        FieldUpdate::Increment {
            field: field.into(),
            by,
        }
    }

    pub fn field(&self) -> &str {
        match self {
            FieldUpdate::Set { field, .. } | FieldUpdate::Increment { field, .. } => field,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn reading(meter: &str, ts: time::OffsetDateTime) -> Document {
        let mut doc = Document::new();
        doc.insert("f_meter_id".to_string(), meter.into());
        doc.insert("f_ts_utc".to_string(), ts.into());
        doc
    }

    #[test]
    fn range_filters_are_inclusive() {
        let q = GroupQuery::collection_group("items")
            .where_ge("f_ts_utc", datetime!(2024-03-11 00:00:00 UTC))
            .where_le("f_ts_utc", datetime!(2024-03-11 01:00:00 UTC));

        assert!(q.matches(&reading("m", datetime!(2024-03-11 00:00:00 UTC))));
        assert!(q.matches(&reading("m", datetime!(2024-03-11 01:00:00 UTC))));
        assert!(!q.matches(&reading("m", datetime!(2024-03-11 01:00:01 UTC))));
    }

    #[test]
    fn filters_never_match_other_kinds() {
        let q = GroupQuery::collection_group("items").where_ge("f_ts_utc", "2024-01-01");
        assert!(!q.matches(&reading("m", datetime!(2024-03-11 00:00:00 UTC))));
    }

    #[test]
    fn missing_order_field_excludes_document() {
        let q = GroupQuery::collection_group("items").order_by("f_meter_id").order_by("f_ts_utc");
        assert!(q.requires_composite_index());

        let mut doc = Document::new();
        doc.insert("f_meter_id".to_string(), "m".into());
        assert!(q.sort_values(&doc).is_none());
        assert_eq!(q.sort_values(&reading("m", datetime!(2024-01-01 00:00:00 UTC))).map(|v| v.len()), Some(2));
    }
}
