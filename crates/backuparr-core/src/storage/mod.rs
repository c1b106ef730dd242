pub mod local;
pub mod pbs;
pub mod s3;

use chrono::{DateTime, TimeZone, Utc};

use crate::cancel::CancelToken;
use crate::config::StorageConfig;
use crate::error::{BackuparrError, Result};

/// A single backup stored in a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupMetadata {
    /// Backend-unique identifier (path, object key, snapshot ID). Opaque to
    /// callers; only required to round-trip through `list`.
    pub key: String,
    /// Application that produced the backup.
    pub app_name: String,
    /// Canonical backup filename (see [`format_backup_name`]).
    pub file_name: String,
    /// Size in bytes.
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Contract every storage destination implements.
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Human-readable backend identifier, user-overridable in config.
    fn name(&self) -> &str;

    /// Store backup bytes and return metadata for the stored object.
    fn upload(&self, app_name: &str, file_name: &str, data: &[u8]) -> Result<BackupMetadata>;

    /// Retrieve a backup by key.
    fn download(&self, key: &str) -> Result<(Vec<u8>, BackupMetadata)>;

    /// All backups for an app, **sorted newest-first**. Retention and
    /// restore-latest rely on this ordering.
    fn list(&self, app_name: &str) -> Result<Vec<BackupMetadata>>;

    /// Remove a backup by key.
    fn delete(&self, key: &str) -> Result<()>;
}

/// Canonical backup filename: `<appName>_<YYYY-MM-DDTHHMMSSZ>.zip`, UTC.
pub fn format_backup_name<Tz: TimeZone>(app_name: &str, t: DateTime<Tz>) -> String {
    format!(
        "{app_name}_{}.zip",
        t.with_timezone(&Utc).format("%Y-%m-%dT%H%M%SZ")
    )
}

/// Build the backend set for an app from its storage configs, in declared
/// order. An empty list falls back to local `./backups`.
pub fn backends_from_config(
    configs: &[StorageConfig],
    cancel: &CancelToken,
) -> Result<Vec<Box<dyn StorageBackend>>> {
    if configs.is_empty() {
        return Ok(vec![Box::new(local::LocalBackend::new(
            "./backups",
            "local".to_string(),
        ))]);
    }

    let mut backends: Vec<Box<dyn StorageBackend>> = Vec::with_capacity(configs.len());
    for cfg in configs {
        let display_name = cfg.effective_name().to_string();
        let backend: Box<dyn StorageBackend> = match cfg.kind.as_str() {
            "local" => {
                let path = if cfg.path.is_empty() {
                    "./backups"
                } else {
                    &cfg.path
                };
                Box::new(local::LocalBackend::new(path, display_name))
            }
            "s3" => Box::new(s3::S3Backend::new(cfg, display_name, cancel.clone())?),
            "pbs" => Box::new(pbs::PbsBackend::new(cfg, display_name)?),
            other => {
                return Err(BackuparrError::Config(format!(
                    "unsupported storage type: '{other}'"
                )))
            }
        };
        backends.push(backend);
    }
    Ok(backends)
}

#[cfg(test)]
mod tests {
    use chrono::FixedOffset;

    use super::*;

    #[test]
    fn backup_name_formats_utc() {
        let t = Utc.with_ymd_and_hms(2026, 2, 6, 12, 30, 45).unwrap();
        assert_eq!(format_backup_name("sonarr", t), "sonarr_2026-02-06T123045Z.zip");
    }

    #[test]
    fn backup_name_converts_zoned_timestamps() {
        // 08:00 in America/New_York (UTC-5 in February) is 13:00 UTC.
        let eastern = FixedOffset::west_opt(5 * 3600).unwrap();
        let t = eastern.with_ymd_and_hms(2026, 2, 6, 8, 0, 0).unwrap();
        assert_eq!(format_backup_name("radarr", t), "radarr_2026-02-06T130000Z.zip");
    }

    #[test]
    fn empty_storage_config_defaults_to_local() {
        let backends = backends_from_config(&[], &CancelToken::new()).unwrap();
        assert_eq!(backends.len(), 1);
        assert_eq!(backends[0].name(), "local");
    }

    #[test]
    fn unknown_storage_type_is_rejected() {
        let cfg = StorageConfig {
            kind: "ftp".into(),
            ..Default::default()
        };
        let err = backends_from_config(&[cfg], &CancelToken::new()).unwrap_err();
        assert!(err.to_string().contains("unsupported storage type"));
    }

    #[test]
    fn display_name_defaults_to_type() {
        let cfg = StorageConfig {
            kind: "local".into(),
            path: "/tmp/backups".into(),
            ..Default::default()
        };
        let backends = backends_from_config(std::slice::from_ref(&cfg), &CancelToken::new()).unwrap();
        assert_eq!(backends[0].name(), "local");

        let named = StorageConfig {
            name: "nas".into(),
            ..cfg
        };
        let backends = backends_from_config(&[named], &CancelToken::new()).unwrap();
        assert_eq!(backends[0].name(), "nas");
    }
}
