use chrono::Utc;

use crate::cancel::CancelToken;
use crate::client::Client;
use crate::error::{BackuparrError, Result};
use crate::retention::{apply_retention, RetentionPolicy};
use crate::storage::{format_backup_name, StorageBackend};

/// Outcome of one app's backup run across its backends.
#[derive(Debug, Default)]
pub struct BackupRunReport {
    pub app: String,
    pub file_name: String,
    pub size: u64,
    /// Backends that accepted the artifact.
    pub uploaded: Vec<String>,
    /// `(backend, error)` for backends that did not.
    pub failed: Vec<(String, String)>,
    /// Old backups removed by retention, summed over backends.
    pub pruned: usize,
}

impl BackupRunReport {
    pub fn fully_successful(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Produce one backup and fan it out to every backend, applying retention
/// behind each successful upload.
///
/// The artifact is buffered exactly once; backends are written sequentially
/// in declared order, and a failing backend never aborts the remaining ones.
/// The run as a whole fails only when producing the artifact fails or every
/// backend rejected it.
pub fn run_backup(
    client: &dyn Client,
    backends: &[Box<dyn StorageBackend>],
    retention: &RetentionPolicy,
    cancel: &CancelToken,
) -> Result<BackupRunReport> {
    let app_name = client.name().to_string();
    tracing::info!("[{app_name}] starting backup");

    let (result, data) = client.backup(cancel)?;
    tracing::info!(
        "[{app_name}] backup created: {} ({} bytes)",
        result.name,
        data.len()
    );

    // The canonical name is stamped here, not by the app: uploads across
    // backends must agree on it.
    let file_name = format_backup_name(&app_name, Utc::now());

    let mut report = BackupRunReport {
        app: app_name.clone(),
        file_name: file_name.clone(),
        size: data.len() as u64,
        ..Default::default()
    };

    for backend in backends {
        cancel.check()?;

        match backend.upload(&app_name, &file_name, &data) {
            Ok(meta) => {
                tracing::info!(
                    "[{app_name}] uploaded to {}: {} ({} bytes)",
                    backend.name(),
                    meta.file_name,
                    meta.size
                );
                report.uploaded.push(backend.name().to_string());
            }
            Err(e) => {
                tracing::error!("[{app_name}] upload to {} failed: {e}", backend.name());
                report.failed.push((backend.name().to_string(), e.to_string()));
                continue;
            }
        }

        match apply_retention(backend.as_ref(), &app_name, retention) {
            Ok(0) => {}
            Ok(deleted) => {
                tracing::info!(
                    "[{app_name}] cleaned up {deleted} old backup(s) from {}",
                    backend.name()
                );
                report.pruned += deleted;
            }
            Err(e) => {
                tracing::warn!(
                    "[{app_name}] retention cleanup failed on {}: {e}",
                    backend.name()
                );
            }
        }
    }

    if !backends.is_empty() && report.uploaded.is_empty() {
        return Err(BackuparrError::Backend(format!(
            "all {} backend(s) failed for {app_name}",
            backends.len()
        )));
    }
    Ok(report)
}

/// Restore an app from a backend. With no explicit key, the newest backup
/// (head of `list`) is used.
pub fn run_restore(
    client: &dyn Client,
    backend: &dyn StorageBackend,
    key: Option<&str>,
    cancel: &CancelToken,
) -> Result<String> {
    let app_name = client.name();

    let key = match key {
        Some(k) => k.to_string(),
        None => {
            let backups = backend.list(app_name)?;
            let latest = backups.first().ok_or_else(|| {
                BackuparrError::Backend(format!(
                    "no backups found for {app_name} on {}",
                    backend.name()
                ))
            })?;
            tracing::info!(
                "selected latest backup: {} (created {})",
                latest.key,
                latest.created_at.to_rfc3339()
            );
            latest.key.clone()
        }
    };

    cancel.check()?;

    tracing::info!("downloading backup {key} from {}", backend.name());
    let (data, meta) = backend.download(&key)?;
    tracing::info!(
        "downloaded {} ({} bytes, created {})",
        meta.file_name,
        meta.size,
        meta.created_at.to_rfc3339()
    );

    tracing::info!("restoring {app_name}");
    client.restore(cancel, &data)?;
    tracing::info!("restore complete for {app_name}");
    Ok(key)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    use chrono::{Duration, Utc};

    use super::*;
    use crate::client::BackupResult;
    use crate::storage::BackupMetadata;
    use crate::testutil::MemoryBackend;

    #[derive(Debug)]
    struct FakeClient {
        name: &'static str,
        payload: Vec<u8>,
        fail_backup: bool,
        restored: Mutex<Vec<Vec<u8>>>,
    }

    impl FakeClient {
        fn new(name: &'static str, payload: &[u8]) -> Self {
            Self {
                name,
                payload: payload.to_vec(),
                fail_backup: false,
                restored: Mutex::new(Vec::new()),
            }
        }
    }

    impl Client for FakeClient {
        fn name(&self) -> &str {
            self.name
        }

        fn backup(&self, _cancel: &CancelToken) -> crate::error::Result<(BackupResult, Vec<u8>)> {
            if self.fail_backup {
                return Err(BackuparrError::CommandFailed("backup exploded".into()));
            }
            let result = BackupResult {
                name: "app-backup.zip".into(),
                path: "/backup/app-backup.zip".into(),
                size: self.payload.len() as u64,
                created_at: Utc::now(),
            };
            Ok((result, self.payload.clone()))
        }

        fn restore(&self, _cancel: &CancelToken, data: &[u8]) -> crate::error::Result<()> {
            self.restored.lock().unwrap().push(data.to_vec());
            Ok(())
        }
    }

    fn boxed(backend: MemoryBackend) -> Box<dyn StorageBackend> {
        Box::new(backend)
    }

    #[test]
    fn fan_out_uploads_to_every_backend() {
        let client = FakeClient::new("sonarr", b"artifact");
        let backends = vec![boxed(MemoryBackend::new("a")), boxed(MemoryBackend::new("b"))];

        let report = run_backup(
            &client,
            &backends,
            &RetentionPolicy::default(),
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(report.uploaded, vec!["a", "b"]);
        assert!(report.fully_successful());
        assert!(report.file_name.starts_with("sonarr_"));
        assert!(report.file_name.ends_with("Z.zip"));
        for backend in &backends {
            let listed = backend.list("sonarr").unwrap();
            assert_eq!(listed.len(), 1);
            assert_eq!(listed[0].file_name, report.file_name);
        }
    }

    #[test]
    fn one_failing_backend_does_not_abort_the_rest() {
        let client = FakeClient::new("radarr", b"artifact");
        let broken = MemoryBackend::new("broken");
        broken.fail_uploads.store(true, Ordering::SeqCst);
        let backends = vec![boxed(broken), boxed(MemoryBackend::new("good"))];

        let report = run_backup(
            &client,
            &backends,
            &RetentionPolicy::default(),
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(report.uploaded, vec!["good"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "broken");
        assert!(!report.fully_successful());
        assert_eq!(backends[1].list("radarr").unwrap().len(), 1);
    }

    #[test]
    fn all_backends_failing_fails_the_run() {
        let client = FakeClient::new("radarr", b"artifact");
        let b1 = MemoryBackend::new("b1");
        let b2 = MemoryBackend::new("b2");
        b1.fail_uploads.store(true, Ordering::SeqCst);
        b2.fail_uploads.store(true, Ordering::SeqCst);
        let backends = vec![boxed(b1), boxed(b2)];

        let err = run_backup(
            &client,
            &backends,
            &RetentionPolicy::default(),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, BackuparrError::Backend(_)));
    }

    #[test]
    fn failing_backup_production_fails_the_run() {
        let mut client = FakeClient::new("sonarr", b"artifact");
        client.fail_backup = true;
        let backends = vec![boxed(MemoryBackend::new("a"))];

        let err = run_backup(
            &client,
            &backends,
            &RetentionPolicy::default(),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, BackuparrError::CommandFailed(_)));
    }

    #[test]
    fn retention_prunes_after_upload() {
        let client = FakeClient::new("sonarr", b"artifact");
        let backend = MemoryBackend::new("a");
        // Seed three stale backups well in the past.
        for i in 1..=3 {
            backend.seed(
                BackupMetadata {
                    key: format!("sonarr/old-{i}.zip"),
                    app_name: "sonarr".into(),
                    file_name: format!("old-{i}.zip"),
                    size: 1,
                    created_at: Utc::now() - Duration::days(i),
                },
                vec![0],
            );
        }
        let backends = vec![boxed(backend)];

        let policy = RetentionPolicy {
            keep_last: 1,
            ..Default::default()
        };
        let report = run_backup(&client, &backends, &policy, &CancelToken::new()).unwrap();

        assert_eq!(report.pruned, 3);
        let listed = backends[0].list("sonarr").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].file_name, report.file_name);
    }

    #[test]
    fn restore_latest_picks_head_of_list() {
        let client = FakeClient::new("sonarr", b"unused");
        let backend = MemoryBackend::new("a");
        backend.seed(
            BackupMetadata {
                key: "sonarr/older.zip".into(),
                app_name: "sonarr".into(),
                file_name: "older.zip".into(),
                size: 3,
                created_at: Utc::now() - Duration::hours(2),
            },
            b"old".to_vec(),
        );
        backend.seed(
            BackupMetadata {
                key: "sonarr/newer.zip".into(),
                app_name: "sonarr".into(),
                file_name: "newer.zip".into(),
                size: 3,
                created_at: Utc::now(),
            },
            b"new".to_vec(),
        );

        let key = run_restore(&client, &backend, None, &CancelToken::new()).unwrap();
        assert_eq!(key, "sonarr/newer.zip");
        assert_eq!(client.restored.lock().unwrap().as_slice(), &[b"new".to_vec()]);
    }

    #[test]
    fn restore_with_explicit_key() {
        let client = FakeClient::new("sonarr", b"unused");
        let backend = MemoryBackend::new("a");
        backend.seed(
            BackupMetadata {
                key: "sonarr/specific.zip".into(),
                app_name: "sonarr".into(),
                file_name: "specific.zip".into(),
                size: 4,
                created_at: Utc::now(),
            },
            b"data".to_vec(),
        );

        let key = run_restore(
            &client,
            &backend,
            Some("sonarr/specific.zip"),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(key, "sonarr/specific.zip");
    }

    #[test]
    fn restore_with_no_backups_fails() {
        let client = FakeClient::new("sonarr", b"unused");
        let backend = MemoryBackend::new("a");
        let err = run_restore(&client, &backend, None, &CancelToken::new()).unwrap_err();
        assert!(err.to_string().contains("no backups found"));
    }

    #[test]
    fn cancelled_run_stops_before_uploading() {
        let client = FakeClient::new("sonarr", b"artifact");
        let backends = vec![boxed(MemoryBackend::new("a"))];
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = run_backup(&client, &backends, &RetentionPolicy::default(), &cancel).unwrap_err();
        assert!(matches!(err, BackuparrError::Cancelled));
        assert!(backends[0].list("sonarr").unwrap().is_empty());
    }
}
