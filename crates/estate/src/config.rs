use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use estate_core::ImportConfig;
use serde::Deserialize;

pub const DEFAULT_BIND: &str = "0.0.0.0:3000";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Settings read from an optional TOML file, then overridden by the
/// environment. CLI flags override both in `main`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub bind: String,
    pub max_connections: u32,
    pub import: ImportConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            bind: DEFAULT_BIND.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            import: ImportConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env::var_os("ESTATE_CONFIG").map(Into::into));
        let mut config = match path {
            Some(path) => {
                let raw = fs::read_to_string(&path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                Self::from_toml(&raw)
                    .with_context(|| format!("failed to parse config file {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env::var("DATABASE_URL")
            .ok()
            .or_else(|| env::var("ESTATE_DATABASE_URL").ok())
        {
            self.database_url = Some(url);
        }
        if let Ok(bind) = env::var("ESTATE_BIND") {
            self.bind = bind;
        }
        if let Ok(value) = env::var("ESTATE_MAX_CONNECTIONS") {
            self.max_connections = value.parse().with_context(|| {
                format!("ESTATE_MAX_CONNECTIONS must be an integer, got '{value}'")
            })?;
        }
        if let Ok(value) = env::var("ESTATE_IMPORT_CHUNK_SIZE") {
            self.import.chunk_size = value.parse().with_context(|| {
                format!("ESTATE_IMPORT_CHUNK_SIZE must be an integer, got '{value}'")
            })?;
        }
        if let Ok(value) = env::var("ESTATE_REQUIRE_LEDGER") {
            self.import.require_ledger =
                matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        Ok(())
    }

    pub fn database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL (or ESTATE_DATABASE_URL) must be set")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_overrides_defaults() {
        let config = AppConfig::from_toml(
            r#"
            bind = "127.0.0.1:8080"

            [import]
            chunk_size = 25
            require_ledger = true
            "#,
        )
        .unwrap();

        assert_eq!(config.bind, "127.0.0.1:8080");
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.import.chunk_size, 25);
        assert_eq!(config.import.max_rows, 5000);
        assert_eq!(config.import.token_ttl_minutes, 30);
        assert!(config.import.require_ledger);
    }

    #[test]
    fn empty_file_gives_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.bind, DEFAULT_BIND);
        assert_eq!(config.import, ImportConfig::default());
    }
}
