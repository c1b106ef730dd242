use std::io::Write;
use std::process::Command;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::Deserialize;

use crate::config::StorageConfig;
use crate::error::{BackuparrError, Result};
use crate::storage::{format_backup_name, BackupMetadata, StorageBackend};

const PBS_CLIENT: &str = "proxmox-backup-client";
const DEFAULT_USERNAME: &str = "root@pam";
const DEFAULT_PORT: u16 = 8007;

/// Archive name used inside every snapshot; the ZIP rides along as a single
/// blob image.
const ARCHIVE_NAME: &str = "backup.img";

/// Stores backups as Proxmox Backup Server snapshots, one per upload, keyed
/// `host/<appName>/<RFC3339 timestamp>`. The PBS CLI is the transport; it
/// owns the chunked upload protocol, dedup, and TLS.
#[derive(Debug)]
pub struct PbsBackend {
    repository: String,
    namespace: String,
    password: String,
    fingerprint: String,
    display_name: String,
}

/// One row of `snapshot list --output-format json`.
#[derive(Debug, Deserialize)]
struct SnapshotInfo {
    #[serde(rename = "backup-type")]
    backup_type: String,
    #[serde(rename = "backup-id")]
    backup_id: String,
    #[serde(rename = "backup-time")]
    backup_time: i64,
    #[serde(default)]
    size: Option<u64>,
}

impl PbsBackend {
    pub fn new(cfg: &StorageConfig, display_name: String) -> Result<Self> {
        if cfg.server.is_empty() {
            return Err(BackuparrError::Config("pbs: server is required".into()));
        }
        if cfg.datastore.is_empty() {
            return Err(BackuparrError::Config("pbs: datastore is required".into()));
        }
        if !crate::config::tool_on_path(PBS_CLIENT) {
            return Err(BackuparrError::Config(format!(
                "pbs: {PBS_CLIENT} not found in PATH"
            )));
        }

        let username = if cfg.username.is_empty() {
            DEFAULT_USERNAME
        } else {
            &cfg.username
        };
        let port = if cfg.port == 0 { DEFAULT_PORT } else { cfg.port };
        let repository = format!("{username}@{}:{port}:{}", cfg.server, cfg.datastore);

        Ok(Self {
            repository,
            namespace: cfg.namespace.clone(),
            password: cfg.password.clone(),
            fingerprint: cfg.fingerprint.clone(),
            display_name,
        })
    }

    /// Base command with repository/namespace args and the prompt-suppressing
    /// environment applied.
    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(PBS_CLIENT);
        cmd.args(args);
        cmd.args(["--repository", &self.repository]);
        if !self.namespace.is_empty() {
            cmd.args(["--ns", &self.namespace]);
        }
        if !self.password.is_empty() {
            cmd.env("PBS_PASSWORD", &self.password);
        }
        if !self.fingerprint.is_empty() {
            cmd.env("PBS_FINGERPRINT", &self.fingerprint);
        }
        cmd
    }
}

impl StorageBackend for PbsBackend {
    fn name(&self) -> &str {
        &self.display_name
    }

    fn upload(&self, app_name: &str, file_name: &str, data: &[u8]) -> Result<BackupMetadata> {
        // The CLI wants a file path, so stage through a temp file.
        let mut tmp = tempfile::Builder::new()
            .prefix("backuparr-pbs-")
            .suffix(".zip")
            .tempfile()
            .map_err(|e| BackuparrError::Backend(format!("pbs: cannot create temp file: {e}")))?;
        tmp.write_all(data)
            .and_then(|()| tmp.flush())
            .map_err(|e| BackuparrError::Backend(format!("pbs: cannot write temp file: {e}")))?;

        let spec = format!("{ARCHIVE_NAME}:{}", tmp.path().display());
        let output = self
            .command(&["backup", &spec, "--backup-id", app_name])
            .output()
            .map_err(|e| BackuparrError::Backend(format!("pbs: cannot invoke {PBS_CLIENT}: {e}")))?;

        if !output.status.success() {
            return Err(BackuparrError::Backend(format!(
                "pbs: backup failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let combined = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let key = parse_snapshot_from_output(&combined, app_name).unwrap_or_else(|| {
            // The CLI owns snapshot naming; synthesize a best-effort key when
            // the output format changes under us.
            format!(
                "host/{app_name}/{}",
                Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
            )
        });

        tracing::info!("pbs: uploaded {key} ({} bytes)", data.len());

        Ok(BackupMetadata {
            key,
            app_name: app_name.to_string(),
            file_name: file_name.to_string(),
            size: data.len() as u64,
            created_at: Utc::now(),
        })
    }

    fn download(&self, key: &str) -> Result<(Vec<u8>, BackupMetadata)> {
        let tmp = tempfile::Builder::new()
            .prefix("backuparr-pbs-restore-")
            .suffix(".zip")
            .tempfile()
            .map_err(|e| BackuparrError::Backend(format!("pbs: cannot create temp file: {e}")))?;
        let tmp_path = tmp.path().to_string_lossy().into_owned();

        let output = self
            .command(&["restore", key, ARCHIVE_NAME, &tmp_path])
            .output()
            .map_err(|e| BackuparrError::Backend(format!("pbs: cannot invoke {PBS_CLIENT}: {e}")))?;
        if !output.status.success() {
            return Err(BackuparrError::Backend(format!(
                "pbs: restore of {key} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let data = std::fs::read(tmp.path())
            .map_err(|e| BackuparrError::Backend(format!("pbs: cannot read restored file: {e}")))?;

        let (app_name, created_at) = parse_snapshot_key(key);
        let size = data.len() as u64;
        let file_name = format_backup_name(&app_name, created_at);
        Ok((
            data,
            BackupMetadata {
                key: key.to_string(),
                app_name,
                file_name,
                size,
                created_at,
            },
        ))
    }

    fn list(&self, app_name: &str) -> Result<Vec<BackupMetadata>> {
        let output = self
            .command(&["snapshot", "list", "--output-format", "json"])
            .output()
            .map_err(|e| BackuparrError::Backend(format!("pbs: cannot invoke {PBS_CLIENT}: {e}")))?;
        if !output.status.success() {
            return Err(BackuparrError::Backend(format!(
                "pbs: snapshot list failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let snapshots: Vec<SnapshotInfo> = serde_json::from_slice(&output.stdout)
            .map_err(|e| BackuparrError::Backend(format!("pbs: cannot parse snapshot list: {e}")))?;

        let mut backups: Vec<BackupMetadata> = snapshots
            .into_iter()
            .filter(|s| s.backup_type == "host" && s.backup_id == app_name)
            .filter_map(|s| {
                let created_at = Utc.timestamp_opt(s.backup_time, 0).single()?;
                let key = format!(
                    "host/{}/{}",
                    s.backup_id,
                    created_at.to_rfc3339_opts(SecondsFormat::Secs, true)
                );
                Some(BackupMetadata {
                    key,
                    app_name: s.backup_id.clone(),
                    file_name: format_backup_name(&s.backup_id, created_at),
                    size: s.size.unwrap_or(0),
                    created_at,
                })
            })
            .collect();

        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let output = self
            .command(&["snapshot", "forget", key])
            .output()
            .map_err(|e| BackuparrError::Backend(format!("pbs: cannot invoke {PBS_CLIENT}: {e}")))?;
        if !output.status.success() {
            return Err(BackuparrError::Backend(format!(
                "pbs: forget of {key} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

/// Pull the snapshot id out of the CLI's output, looking for the
/// `Starting backup: host/<app>/<timestamp>` line.
fn parse_snapshot_from_output(output: &str, app_name: &str) -> Option<String> {
    let prefix = "Starting backup: ";
    let target = format!("host/{app_name}/");
    for line in output.lines() {
        let line = line.trim();
        if let Some(idx) = line.find(prefix) {
            let snapshot = line[idx + prefix.len()..].trim();
            if snapshot.starts_with(&target) {
                return Some(snapshot.to_string());
            }
        }
    }
    None
}

/// Split a `host/<app>/<RFC3339>` snapshot key into app name and timestamp.
fn parse_snapshot_key(key: &str) -> (String, DateTime<Utc>) {
    let mut parts = key.splitn(3, '/');
    let _type = parts.next();
    let app = parts.next().unwrap_or_default().to_string();
    let ts = parts
        .next()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    (app, ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_snapshot_id_from_cli_output() {
        let output = "\
Password for \"root@pam\": ***
Starting backup protocol
Starting backup: host/sonarr/2026-02-06T12:30:45Z
Uploading blob backup.img.blob
";
        assert_eq!(
            parse_snapshot_from_output(output, "sonarr").as_deref(),
            Some("host/sonarr/2026-02-06T12:30:45Z")
        );
        assert!(parse_snapshot_from_output(output, "radarr").is_none());
        assert!(parse_snapshot_from_output("no match here", "sonarr").is_none());
    }

    #[test]
    fn snapshot_key_round_trips() {
        let (app, ts) = parse_snapshot_key("host/radarr/2026-02-06T12:30:45Z");
        assert_eq!(app, "radarr");
        assert_eq!(ts, Utc.with_ymd_and_hms(2026, 2, 6, 12, 30, 45).unwrap());
    }

    #[test]
    fn malformed_snapshot_key_degrades_gracefully() {
        let (app, ts) = parse_snapshot_key("garbage");
        assert!(app.is_empty());
        assert_eq!(ts.timestamp(), 0);
    }

    #[test]
    fn server_and_datastore_are_required() {
        let err = PbsBackend::new(
            &StorageConfig {
                kind: "pbs".into(),
                ..Default::default()
            },
            "pbs".to_string(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("server is required"));

        let err = PbsBackend::new(
            &StorageConfig {
                kind: "pbs".into(),
                server: "pbs.local".into(),
                ..Default::default()
            },
            "pbs".to_string(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("datastore is required"));
    }

    #[test]
    fn snapshot_list_rows_parse() {
        let json = r#"[
            {"backup-type": "host", "backup-id": "sonarr", "backup-time": 1770380000, "size": 1024},
            {"backup-type": "vm", "backup-id": "100", "backup-time": 1770380000}
        ]"#;
        let rows: Vec<SnapshotInfo> = serde_json::from_str(json).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].backup_type, "host");
        assert_eq!(rows[0].backup_id, "sonarr");
        assert_eq!(rows[0].size, Some(1024));
        assert_eq!(rows[1].size, None);
    }
}
