use serde::{Deserialize, Deserializer};

use meter_store::{
    db::path::{CLIENTS, CONDOMINIUMS, LOCATIONS, METERS},
    domain::{common_fields, meter::fields as meter_fields, Meter},
    Document, Value,
};

/// Natural id column every sheet must carry.
pub const ID_COLUMN: &str = "_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sheet {
    Location,
    Condominium,
    Client,
    Meter,
}

impl Sheet {
    /// Load order: every sheet only references sheets before it.
    pub const ALL: [Sheet; 4] = [Sheet::Location, Sheet::Condominium, Sheet::Client, Sheet::Meter];

    pub fn collection(self) -> &'static str {
        match self {
            Sheet::Location => LOCATIONS,
            Sheet::Condominium => CONDOMINIUMS,
            Sheet::Client => CLIENTS,
            Sheet::Meter => METERS,
        }
    }

    pub fn file_name(self) -> String {
        format!("{}.csv", self.collection())
    }
}

/// A typed workbook row.
pub trait SheetRow: serde::de::DeserializeOwned {
    const SHEET: Sheet;

    fn id(&self) -> &str;

    /// Attributes taken from the sheet, merged on every load.
    fn attributes(&self) -> Document;

    /// Hierarchy records this row points at, as (collection, id).
    fn references(&self) -> Vec<(&'static str, &str)> {
        Vec::new()
    }

    /// Fields written only when the record is first created.
    fn initial_fields() -> Document {
        let mut doc = Document::new();
        doc.insert(common_fields::CREATED_AT.to_string(), Value::ServerTimestamp);
        doc.insert(common_fields::ACTIVE.to_string(), Value::Bool(true));
        doc
    }
}

fn flag<'de, D>(de: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(de)?;
    Ok(raw.is_some_and(|s| parse_flag(&s)))
}

pub fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "y" | "t" | "sim"
    )
}

/// Removes the punctuation people type into tax ids.
pub fn normalize_tax_id(raw: &str) -> String {
    raw.chars().filter(|c| *c != '.' && *c != '-').collect::<String>().trim().to_string()
}

fn text(value: &Option<String>) -> Value {
    value.clone().into()
}

fn text_or_empty(value: &Option<String>) -> Value {
    Value::String(value.clone().unwrap_or_default())
}

fn references<'a>(pairs: &[(&'static str, &'a Option<String>)]) -> Vec<(&'static str, &'a str)> {
    pairs
        .iter()
        .filter_map(|(collection, id)| id.as_deref().map(|id| (*collection, id)))
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocationRow {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "f_street", default)]
    pub street: Option<String>,
    #[serde(rename = "f_number", default)]
    pub number: Option<String>,
    #[serde(rename = "f_district", default)]
    pub district: Option<String>,
    #[serde(rename = "f_city", default)]
    pub city: Option<String>,
    #[serde(rename = "f_state", default)]
    pub state: Option<String>,
    #[serde(rename = "f_postal_code", default)]
    pub postal_code: Option<String>,
    #[serde(rename = "f_complement", default)]
    pub complement: Option<String>,
    #[serde(rename = "f_geo_lat", default)]
    pub geo_lat: Option<String>,
    #[serde(rename = "f_geo_lon", default)]
    pub geo_lon: Option<String>,
}

impl LocationRow {
    /// Both coordinates must parse, otherwise there's no geo point.
    fn geo(&self) -> Value {
        let coord = |raw: &Option<String>| raw.as_deref().and_then(|s| s.trim().parse::<f64>().ok());
        match (coord(&self.geo_lat), coord(&self.geo_lon)) {
            (Some(lat), Some(lon)) => {
                let mut point = Document::new();
                point.insert("lat".to_string(), Value::Float(lat));
                point.insert("lon".to_string(), Value::Float(lon));
                Value::Map(point)
            }
            _ => Value::Null,
        }
    }
}

impl SheetRow for LocationRow {
    const SHEET: Sheet = Sheet::Location;

    fn id(&self) -> &str {
        &self.id
    }

    fn attributes(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("f_street".to_string(), text_or_empty(&self.street));
        doc.insert("f_number".to_string(), text_or_empty(&self.number));
        doc.insert("f_district".to_string(), text_or_empty(&self.district));
        doc.insert("f_city".to_string(), text_or_empty(&self.city));
        doc.insert("f_state".to_string(), text_or_empty(&self.state));
        doc.insert("f_postal_code".to_string(), text_or_empty(&self.postal_code));
        doc.insert("f_complement".to_string(), text(&self.complement));
        doc.insert("f_geo".to_string(), self.geo());
        doc
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CondominiumRow {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "f_name", default)]
    pub name: Option<String>,
    #[serde(rename = "f_kind", default)]
    pub kind: Option<String>,
    #[serde(rename = "f_location", default)]
    pub location: Option<String>,
    #[serde(rename = "f_manager_name", default)]
    pub manager_name: Option<String>,
    #[serde(rename = "f_manager_phone", default)]
    pub manager_phone: Option<String>,
    #[serde(rename = "f_manager_email", default)]
    pub manager_email: Option<String>,
}

impl SheetRow for CondominiumRow {
    const SHEET: Sheet = Sheet::Condominium;

    fn id(&self) -> &str {
        &self.id
    }

    fn attributes(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("f_name".to_string(), text_or_empty(&self.name));
        doc.insert(
            "f_kind".to_string(),
            self.kind.as_deref().unwrap_or("condominium").into(),
        );
        doc.insert("f_location".to_string(), text(&self.location));
        doc.insert("f_manager_name".to_string(), text(&self.manager_name));
        doc.insert("f_manager_phone".to_string(), text(&self.manager_phone));
        doc.insert("f_manager_email".to_string(), text(&self.manager_email));
        doc
    }

    fn references(&self) -> Vec<(&'static str, &str)> {
        references(&[(LOCATIONS, &self.location)])
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientRow {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "f_name", default)]
    pub name: Option<String>,
    #[serde(rename = "f_tax_id", default)]
    pub tax_id: Option<String>,
    #[serde(rename = "f_condominium_id", default)]
    pub condominium_id: Option<String>,
    #[serde(rename = "f_block", default)]
    pub block: Option<String>,
    #[serde(rename = "f_unit", default)]
    pub unit: Option<String>,
    #[serde(rename = "f_location", default)]
    pub location: Option<String>,
    #[serde(rename = "f_email", default)]
    pub email: Option<String>,
    #[serde(rename = "f_phone", default)]
    pub phone: Option<String>,
}

impl SheetRow for ClientRow {
    const SHEET: Sheet = Sheet::Client;

    fn id(&self) -> &str {
        &self.id
    }

    fn attributes(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("f_name".to_string(), text_or_empty(&self.name));
        doc.insert(
            "f_tax_id".to_string(),
            normalize_tax_id(self.tax_id.as_deref().unwrap_or_default()).into(),
        );
        doc.insert("f_condominium_id".to_string(), text(&self.condominium_id));
        doc.insert("f_block".to_string(), text(&self.block));
        doc.insert("f_unit".to_string(), text(&self.unit));
        doc.insert("f_location".to_string(), text(&self.location));
        doc.insert("f_email".to_string(), text(&self.email));
        doc.insert("f_phone".to_string(), text(&self.phone));
        doc
    }

    fn references(&self) -> Vec<(&'static str, &str)> {
        references(&[(CONDOMINIUMS, &self.condominium_id), (LOCATIONS, &self.location)])
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeterRow {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "f_client_id", default)]
    pub client_id: Option<String>,
    #[serde(rename = "f_condominium_id", default)]
    pub condominium_id: Option<String>,
    #[serde(rename = "f_has_valve", default, deserialize_with = "flag")]
    pub has_valve: bool,
    #[serde(rename = "f_valve_status", default)]
    pub valve_status: Option<String>,
    #[serde(rename = "f_hw_model", default)]
    pub hw_model: Option<String>,
    #[serde(rename = "f_fw_version", default)]
    pub fw_version: Option<String>,
    #[serde(rename = "f_install_note", default)]
    pub install_note: Option<String>,
}

impl SheetRow for MeterRow {
    const SHEET: Sheet = Sheet::Meter;

    fn id(&self) -> &str {
        &self.id
    }

    fn attributes(&self) -> Document {
        let mut doc = Document::new();
        doc.insert(meter_fields::CLIENT_ID.to_string(), text(&self.client_id));
        doc.insert(meter_fields::CONDOMINIUM_ID.to_string(), text(&self.condominium_id));
        doc.insert(meter_fields::HAS_VALVE.to_string(), Value::Bool(self.has_valve));
        doc.insert(meter_fields::VALVE_STATUS.to_string(), text(&self.valve_status));
        doc.insert(meter_fields::HW_MODEL.to_string(), text(&self.hw_model));
        doc.insert(meter_fields::FW_VERSION.to_string(), text(&self.fw_version));
        doc.insert(meter_fields::INSTALL_NOTE.to_string(), text(&self.install_note));
        doc
    }

    fn references(&self) -> Vec<(&'static str, &str)> {
        references(&[(CLIENTS, &self.client_id), (CONDOMINIUMS, &self.condominium_id)])
    }

    fn initial_fields() -> Document {
        let mut doc = Meter::initial_aggregates();
        doc.insert(common_fields::CREATED_AT.to_string(), Value::ServerTimestamp);
        doc.insert(common_fields::ACTIVE.to_string(), Value::Bool(true));
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_accept_common_spellings() {
        for yes in ["true", "1", "YES", " y ", "t", "Sim"] {
            assert!(parse_flag(yes), "{yes}");
        }
        for no in ["", "0", "false", "no", "maybe"] {
            assert!(!parse_flag(no), "{no}");
        }
    }

    #[test]
    fn tax_ids_lose_punctuation() {
        assert_eq!(normalize_tax_id("123.456.789-09"), "12345678909");
    }

    #[test]
    fn geo_needs_both_coordinates() {
        let mut row = LocationRow {
            id: "LOC-1".to_string(),
            street: None,
            number: None,
            district: None,
            city: None,
            state: None,
            postal_code: None,
            complement: None,
            geo_lat: Some("-23.55".to_string()),
            geo_lon: None,
        };
        assert_eq!(row.attributes()["f_geo"], Value::Null);

        row.geo_lon = Some("-46.63".to_string());
        let geo = row.attributes()["f_geo"].clone();
        assert_eq!(geo.as_map().unwrap()["lon"], Value::Float(-46.63));
    }

    #[test]
    fn meters_reference_their_client_and_condominium() {
        let row = MeterRow {
            id: "MTR-000001".to_string(),
            client_id: Some("CLI-1".to_string()),
            condominium_id: None,
            has_valve: false,
            valve_status: None,
            hw_model: None,
            fw_version: None,
            install_note: None,
        };
        assert_eq!(row.references(), vec![(CLIENTS, "CLI-1")]);
    }
}
