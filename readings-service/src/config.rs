use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

use meter_store::PgStore;

use crate::error::ServiceError;

/// Names the TOML file holding the store credentials.
pub const CREDENTIALS_ENV: &str = "METER_STORE_CREDENTIALS";

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub uri: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub store: StoreConfig,
    #[serde(default)]
    pub export: ExportConfig,
}

fn default_max_connections() -> u32 {
    4
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("./exports")
}

fn default_delimiter() -> char {
    ','
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            out_dir: default_out_dir(),
            delimiter: default_delimiter(),
        }
    }
}

impl AppConfig {
    /// Reads the credentials file named by [`CREDENTIALS_ENV`].
    pub fn load() -> Result<Self, ServiceError> {
        let raw = std::env::var(CREDENTIALS_ENV)
            .map_err(|_| ServiceError::Configuration(format!("{CREDENTIALS_ENV} is not set")))?;
        Self::load_from(Path::new(raw.trim()))
    }

    /// Relative paths are resolved against the working directory.
    pub fn load_from(path: &Path) -> Result<Self, ServiceError> {
        if path.as_os_str().is_empty() {
            return Err(ServiceError::Configuration(format!("{CREDENTIALS_ENV} is empty")));
        }
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };

        let contents = fs::read_to_string(&path).map_err(|e| {
            ServiceError::Configuration(format!("credentials not readable at {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ServiceError> {
        toml::from_str(contents).map_err(|e| ServiceError::Configuration(format!("invalid credentials file: {e}")))
    }
}

impl StoreConfig {
    /// Opens the store client and makes sure its schema exists.
    pub async fn connect(&self) -> Result<PgStore, ServiceError> {
        let store = PgStore::connect(&self.uri, self.max_connections).await?;
        store.ensure_schema().await?;
        tracing::info!(max_connections = self.max_connections, "connected to meter store");
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn applies_defaults_for_optional_sections() {
        let cfg = AppConfig::from_toml_str(
            r#"
            [store]
            uri = "postgres://meters@localhost/meters"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.store.max_connections, 4);
        assert_eq!(cfg.export.delimiter, ',');
        assert_eq!(cfg.export.out_dir, PathBuf::from("./exports"));
    }

    #[test]
    fn reads_export_overrides() {
        let cfg = AppConfig::from_toml_str(
            r#"
            [store]
            uri = "postgres://meters@localhost/meters"
            max_connections = 8

            [export]
            delimiter = ";"
            out_dir = "/tmp/out"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.store.max_connections, 8);
        assert_eq!(cfg.export.delimiter, ';');
    }

    #[test]
    fn missing_store_section_is_a_configuration_error() {
        let res = AppConfig::from_toml_str("[export]\ndelimiter = \";\"\n");
        assert!(matches!(res, Err(ServiceError::Configuration(_))));
    }

    #[test]
    fn missing_credentials_file_is_a_configuration_error() {
        let res = AppConfig::load_from(Path::new("/nonexistent/meter-store.toml"));
        assert!(matches!(res, Err(ServiceError::Configuration(_))));
    }

    #[test]
    fn loads_credentials_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[store]\nuri = \"postgres://localhost/meters\"").unwrap();

        let cfg = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(cfg.store.uri, "postgres://localhost/meters");
    }
}
