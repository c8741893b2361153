use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use time::OffsetDateTime;

use super::error::StoreError;

pub const METERS: &str = "meter";
pub const READINGS: &str = "readings";
pub const ITEMS: &str = "items";
pub const LOCATIONS: &str = "location";
pub const CONDOMINIUMS: &str = "condominium";
pub const CLIENTS: &str = "client";

fn validate_segment(segment: &str) -> Result<(), StoreError> {
    if segment.is_empty() || segment.contains('/') {
        return Err(StoreError::InvalidData(format!(
            "invalid path segment '{segment}': must be non-empty and free of '/'"
        )));
    }
    Ok(())
}

/// Slash-separated path of a collection: `meter/MTR-000001/readings`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CollectionPath(String);

/// Slash-separated path of a document: `meter/MTR-000001`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocPath(String);

impl CollectionPath {
    pub fn root(name: &str) -> Result<Self, StoreError> {
        validate_segment(name)?;
        Ok(Self(name.to_string()))
    }

    pub fn doc(&self, id: &str) -> Result<DocPath, StoreError> {
        validate_segment(id)?;
        Ok(DocPath(format!("{}/{}", self.0, id)))
    }

    /// Last segment, the collection id used by collection-group queries.
    pub fn id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    pub fn parent(&self) -> Option<DocPath> {
        self.0.rsplit_once('/').map(|(parent, _)| DocPath(parent.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl DocPath {
    pub fn parse(path: &str) -> Result<Self, StoreError> {
        let segments: Vec<&str> = path.split('/').collect();
        if segments.len() % 2 != 0 {
            return Err(StoreError::InvalidData(format!("'{path}' is not a document path")));
        }
        for seg in &segments {
            validate_segment(seg)?;
        }
        Ok(Self(path.to_string()))
    }

    pub fn id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    pub fn parent(&self) -> CollectionPath {
        match self.0.rsplit_once('/') {
            Some((parent, _)) => CollectionPath(parent.to_string()),
            None => CollectionPath(String::new()),
        }
    }

    pub fn collection(&self, name: &str) -> Result<CollectionPath, StoreError> {
        validate_segment(name)?;
        Ok(CollectionPath(format!("{}/{}", self.0, name)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generates a 20 character document id for `add`.
pub fn auto_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let mut h = blake3::Hasher::new();
    h.update(&OffsetDateTime::now_utc().unix_timestamp_nanos().to_le_bytes());
    h.update(&COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    h.update(&std::process::id().to_le_bytes());
    let hex = h.finalize().to_hex();
    hex.as_str()[..20].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_paths_expose_parent_and_ids() {
        let items = CollectionPath::root(METERS)
            .and_then(|c| c.doc("MTR-000001"))
            .and_then(|d| d.collection(READINGS))
            .and_then(|c| c.doc("2024_03"))
            .and_then(|d| d.collection(ITEMS))
            .unwrap();
        assert_eq!(items.as_str(), "meter/MTR-000001/readings/2024_03/items");
        assert_eq!(items.id(), ITEMS);

        let item = items.doc("abc").unwrap();
        assert_eq!(item.id(), "abc");
        assert_eq!(item.parent(), items);
        assert_eq!(items.parent().unwrap().id(), "2024_03");
    }

    #[test]
    fn rejects_ids_containing_slashes() {
        let meters = CollectionPath::root(METERS).unwrap();
        assert!(matches!(meters.doc("a/b"), Err(StoreError::InvalidData(_))));
        assert!(DocPath::parse("meter").is_err());
        assert!(DocPath::parse("meter/MTR-1").is_ok());
    }

    #[test]
    fn auto_ids_are_unique() {
        let a = auto_id();
        let b = auto_id();
        assert_eq!(a.len(), 20);
        assert_ne!(a, b);
    }
}
