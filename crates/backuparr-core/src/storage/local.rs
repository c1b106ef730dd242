use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::{BackuparrError, Result};
use crate::storage::{BackupMetadata, StorageBackend};

/// Stores backups as plain files under `<base>/<appName>/<fileName>`.
/// Keys are full filesystem paths; they round-trip through `list`.
#[derive(Debug)]
pub struct LocalBackend {
    base_path: PathBuf,
    display_name: String,
}

impl LocalBackend {
    pub fn new(base_path: &str, display_name: String) -> Self {
        Self {
            base_path: PathBuf::from(base_path),
            display_name,
        }
    }

    fn app_dir(&self, app_name: &str) -> PathBuf {
        self.base_path.join(app_name)
    }
}

impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.display_name
    }

    fn upload(&self, app_name: &str, file_name: &str, data: &[u8]) -> Result<BackupMetadata> {
        let dir = self.app_dir(app_name);
        fs::create_dir_all(&dir).map_err(|e| {
            BackuparrError::Backend(format!("cannot create directory {}: {e}", dir.display()))
        })?;

        let path = dir.join(file_name);
        let mut file = fs::File::create(&path).map_err(|e| {
            BackuparrError::Backend(format!("cannot create file {}: {e}", path.display()))
        })?;

        if let Err(e) = file.write_all(data).and_then(|()| file.flush()) {
            // A truncated artifact must never surface in a later listing.
            drop(file);
            let _ = fs::remove_file(&path);
            return Err(BackuparrError::Backend(format!(
                "writing backup {} failed: {e}",
                path.display()
            )));
        }

        Ok(BackupMetadata {
            key: path.to_string_lossy().into_owned(),
            app_name: app_name.to_string(),
            file_name: file_name.to_string(),
            size: data.len() as u64,
            created_at: Utc::now(),
        })
    }

    fn download(&self, key: &str) -> Result<(Vec<u8>, BackupMetadata)> {
        let path = Path::new(key);
        let meta = fs::metadata(path)
            .map_err(|e| BackuparrError::Backend(format!("backup not found: {e}")))?;
        let data = fs::read(path)
            .map_err(|e| BackuparrError::Backend(format!("cannot read backup {key}: {e}")))?;

        let app_name = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let created_at = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok((
            data,
            BackupMetadata {
                key: key.to_string(),
                app_name,
                file_name,
                size: meta.len(),
                created_at,
            },
        ))
    }

    fn list(&self, app_name: &str) -> Result<Vec<BackupMetadata>> {
        let dir = self.app_dir(app_name);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(BackuparrError::Backend(format!(
                    "cannot list directory {}: {e}",
                    dir.display()
                )))
            }
        };

        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry.map_err(BackuparrError::Io)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".zip") {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let created_at = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            backups.push(BackupMetadata {
                key: dir.join(&name).to_string_lossy().into_owned(),
                app_name: app_name.to_string(),
                file_name: name,
                size: meta.len(),
                created_at,
            });
        }

        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    fn delete(&self, key: &str) -> Result<()> {
        fs::remove_file(key)
            .map_err(|e| BackuparrError::Backend(format!("cannot delete backup {key}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::format_backup_name;

    fn backend(dir: &tempfile::TempDir) -> LocalBackend {
        LocalBackend::new(dir.path().to_str().unwrap(), "local".to_string())
    }

    #[test]
    fn upload_writes_under_app_directory() {
        let dir = tempfile::tempdir().unwrap();
        let b = backend(&dir);
        let meta = b
            .upload("sonarr", "sonarr_2026-02-06T120000Z.zip", b"zipbytes")
            .unwrap();
        assert_eq!(meta.app_name, "sonarr");
        assert_eq!(meta.size, 8);
        assert!(Path::new(&meta.key).is_file());
        assert!(meta.key.contains("sonarr"));
    }

    #[test]
    fn list_returns_only_zip_files_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let b = backend(&dir);

        b.upload("radarr", "radarr_2026-02-06T110000Z.zip", b"one")
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        b.upload("radarr", "radarr_2026-02-06T120000Z.zip", b"two")
            .unwrap();
        fs::write(dir.path().join("radarr").join("notes.txt"), b"skip me").unwrap();

        let listed = b.list("radarr").unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].created_at >= listed[1].created_at);
        assert_eq!(listed[0].file_name, "radarr_2026-02-06T120000Z.zip");
    }

    #[test]
    fn list_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let b = backend(&dir);
        assert!(b.list("nothing-here").unwrap().is_empty());
    }

    #[test]
    fn keys_round_trip_through_list_and_download() {
        let dir = tempfile::tempdir().unwrap();
        let b = backend(&dir);
        let name = format_backup_name("prowlarr", Utc::now());
        b.upload("prowlarr", &name, b"payload").unwrap();

        let listed = b.list("prowlarr").unwrap();
        let (data, meta) = b.download(&listed[0].key).unwrap();
        assert_eq!(data, b"payload");
        assert_eq!(meta.app_name, "prowlarr");
        assert_eq!(meta.file_name, name);
    }

    #[test]
    fn delete_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let b = backend(&dir);
        let meta = b
            .upload("sonarr", "sonarr_2026-02-06T120000Z.zip", b"data")
            .unwrap();
        b.delete(&meta.key).unwrap();
        assert!(b.list("sonarr").unwrap().is_empty());
        assert!(b.delete(&meta.key).is_err());
    }
}
