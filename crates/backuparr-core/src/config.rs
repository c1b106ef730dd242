use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BackuparrError, Result};
use crate::retention::RetentionPolicy;

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackuparrConfig {
    #[serde(default)]
    pub app_configs: Vec<AppConfig>,
}

/// One application to back up.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub app_type: String,
    /// Optional display name; defaults to the app type.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default)]
    pub connection: Connection,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres: Option<PostgresOverride>,
    #[serde(default)]
    pub storage: Vec<StorageConfig>,
}

impl AppConfig {
    /// Name used for storage paths, lookups, and logging.
    pub fn effective_name(&self) -> &str {
        if self.name.is_empty() {
            &self.app_type
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Manually specified Postgres connection details. Non-empty fields override
/// the values auto-detected from the backup's config.xml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostgresOverride {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub main_db: String,
    #[serde(default)]
    pub log_db: String,
}

/// A storage backend destination. `type` selects the variant; the remaining
/// fields are variant-specific and ignored by the others.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub kind: String,
    /// Optional display name; defaults to the type.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    // local
    #[serde(default)]
    pub path: String,

    // s3
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_access_key: String,
    #[serde(default)]
    pub storage_class: String,
    #[serde(default)]
    pub force_path_style: bool,

    // pbs
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub datastore: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub fingerprint: String,
}

impl StorageConfig {
    pub fn effective_name(&self) -> &str {
        if self.name.is_empty() {
            &self.kind
        } else {
            &self.name
        }
    }
}

/// Parse the config file at `path`.
pub fn load(path: &Path) -> Result<BackuparrConfig> {
    let data = std::fs::read_to_string(path).map_err(|e| {
        BackuparrError::Config(format!("cannot read config file '{}': {e}", path.display()))
    })?;
    serde_yaml::from_str(&data).map_err(|e| {
        BackuparrError::Config(format!("cannot parse config '{}': {e}", path.display()))
    })
}

/// Resolve the config file path, in priority order:
/// 1. `BACKUPARR_CONFIG` environment variable
/// 2. `/config/config.yml` (container default)
/// 3. `./config.yml`
pub fn config_path() -> PathBuf {
    if let Ok(v) = std::env::var("BACKUPARR_CONFIG") {
        if !v.is_empty() {
            return PathBuf::from(v);
        }
    }
    let docker_default = Path::new("/config/config.yml");
    if docker_default.exists() {
        return docker_default.to_path_buf();
    }
    PathBuf::from("config.yml")
}

/// Look up an app config by its effective name.
pub fn find_app<'a>(cfg: &'a BackuparrConfig, app_name: &str) -> Result<&'a AppConfig> {
    if let Some(app) = cfg
        .app_configs
        .iter()
        .find(|a| a.effective_name() == app_name)
    {
        return Ok(app);
    }
    let available: Vec<&str> = cfg
        .app_configs
        .iter()
        .map(|a| a.effective_name())
        .collect();
    Err(BackuparrError::Config(format!(
        "app '{app_name}' not found in config (available: {available:?})"
    )))
}

/// Look up a single storage config by effective name within an app.
/// Ambiguous names (two entries resolving to the same name) are an error.
pub fn find_backend_config<'a>(
    app: &'a AppConfig,
    backend_name: &str,
) -> Result<&'a StorageConfig> {
    let matches: Vec<&StorageConfig> = app
        .storage
        .iter()
        .filter(|s| s.effective_name() == backend_name)
        .collect();
    match matches.len() {
        0 => {
            let available: Vec<&str> = app.storage.iter().map(|s| s.effective_name()).collect();
            Err(BackuparrError::Config(format!(
                "backend '{backend_name}' not configured for {} (available: {available:?})",
                app.effective_name()
            )))
        }
        1 => Ok(matches[0]),
        _ => Err(BackuparrError::Config(format!(
            "multiple backends match '{backend_name}' for {}; assign unique names in config",
            app.effective_name()
        ))),
    }
}

/// Verify that all external tools the config will need are invokable before
/// any work begins. Avoids partial failures mid-backup or mid-restore.
pub fn preflight_check(cfg: &BackuparrConfig) -> Result<()> {
    let needs_pg = cfg.app_configs.iter().any(|a| a.postgres.is_some());

    let mut missing = Vec::new();
    if needs_pg {
        if !tool_on_path("pg_dump") {
            missing.push("pg_dump (required for PostgreSQL backup)");
        }
        if !tool_on_path("psql") {
            missing.push("psql (required for PostgreSQL restore)");
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(BackuparrError::Config(format!(
            "missing required tools:\n  - {}",
            missing.join("\n  - ")
        )))
    }
}

/// Whether an executable is reachable through PATH.
pub fn tool_on_path(name: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| {
        let candidate = dir.join(name);
        #[cfg(windows)]
        let candidate = candidate.with_extension("exe");
        candidate.is_file()
    })
}
