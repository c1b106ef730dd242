use std::io::Read;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusty_s3::actions::{ListObjectsV2, S3Action};
use rusty_s3::{Bucket, Credentials, UrlStyle};

use crate::cancel::CancelToken;
use crate::config::StorageConfig;
use crate::error::{BackuparrError, Result};
use crate::storage::{BackupMetadata, StorageBackend};
use crate::transport::{retry_call, RetryPolicy};

/// Validity window for presigned request URLs.
const PRESIGN_DURATION: Duration = Duration::from_secs(3600);

const DEFAULT_PREFIX: &str = "backuparr";
const DEFAULT_REGION: &str = "us-east-1";

/// Stores backups in an S3-compatible object store under
/// `<prefix>/<appName>/<fileName>`. Requests are presigned with `rusty_s3`
/// and driven over the shared retry transport.
#[derive(Debug)]
pub struct S3Backend {
    bucket: Bucket,
    credentials: Credentials,
    agent: ureq::Agent,
    retry: RetryPolicy,
    cancel: CancelToken,
    prefix: String,
    storage_class: String,
    display_name: String,
}

impl S3Backend {
    pub fn new(cfg: &StorageConfig, display_name: String, cancel: CancelToken) -> Result<Self> {
        if cfg.bucket.is_empty() {
            return Err(BackuparrError::Config("s3: bucket is required".into()));
        }

        let prefix = if cfg.prefix.is_empty() {
            DEFAULT_PREFIX.to_string()
        } else {
            cfg.prefix.trim_matches('/').to_string()
        };

        let region = if cfg.region.is_empty() {
            DEFAULT_REGION.to_string()
        } else {
            cfg.region.clone()
        };

        // Custom endpoints (MinIO, R2, B2, ...) need path-style addressing.
        let (endpoint, url_style) = if cfg.endpoint.is_empty() {
            let style = if cfg.force_path_style {
                UrlStyle::Path
            } else {
                UrlStyle::VirtualHost
            };
            (format!("https://s3.{region}.amazonaws.com"), style)
        } else {
            (cfg.endpoint.clone(), UrlStyle::Path)
        };

        let base_url = endpoint
            .parse()
            .map_err(|e| BackuparrError::Config(format!("s3: invalid endpoint '{endpoint}': {e}")))?;

        let bucket = Bucket::new(base_url, url_style, cfg.bucket.clone(), region)
            .map_err(|e| BackuparrError::Config(format!("s3: cannot create bucket handle: {e}")))?;

        let credentials = resolve_credentials(cfg)?;

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();

        Ok(Self {
            bucket,
            credentials,
            agent,
            retry: RetryPolicy::default(),
            cancel,
            prefix,
            storage_class: cfg.storage_class.clone(),
            display_name,
        })
    }

    /// Object key layout: `<prefix>/<appName>/<fileName>`.
    fn object_key(&self, app_name: &str, file_name: &str) -> String {
        format!("{}/{app_name}/{file_name}", self.prefix)
    }

    /// Split an object key back into app and file name.
    fn parse_key<'a>(&self, key: &'a str) -> (&'a str, &'a str) {
        let rel = key.strip_prefix(&self.prefix).unwrap_or(key);
        let rel = rel.trim_start_matches('/');
        match rel.split_once('/') {
            Some((app, file)) => (app, file),
            None => ("", rel),
        }
    }
}

/// Static credentials from config when present, otherwise the ambient
/// `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` environment pair.
fn resolve_credentials(cfg: &StorageConfig) -> Result<Credentials> {
    if !cfg.access_key_id.is_empty() && !cfg.secret_access_key.is_empty() {
        return Ok(Credentials::new(
            cfg.access_key_id.clone(),
            cfg.secret_access_key.clone(),
        ));
    }
    match (
        std::env::var("AWS_ACCESS_KEY_ID"),
        std::env::var("AWS_SECRET_ACCESS_KEY"),
    ) {
        (Ok(key), Ok(secret)) if !key.is_empty() && !secret.is_empty() => {
            Ok(Credentials::new(key, secret))
        }
        _ => Err(BackuparrError::Config(
            "s3: no credentials in config and AWS_ACCESS_KEY_ID/AWS_SECRET_ACCESS_KEY not set"
                .into(),
        )),
    }
}

impl StorageBackend for S3Backend {
    fn name(&self) -> &str {
        &self.display_name
    }

    fn upload(&self, app_name: &str, file_name: &str, data: &[u8]) -> Result<BackupMetadata> {
        let key = self.object_key(app_name, file_name);

        let mut action = self.bucket.put_object(Some(&self.credentials), &key);
        if !self.storage_class.is_empty() {
            action
                .headers_mut()
                .insert("x-amz-storage-class", &self.storage_class);
        }
        let url = action.sign(PRESIGN_DURATION);

        retry_call(&self.retry, &self.cancel, &format!("S3 PUT {key}"), || {
            let mut req = self.agent.put(url.as_str());
            if !self.storage_class.is_empty() {
                req = req.set("x-amz-storage-class", &self.storage_class);
            }
            req.send_bytes(data)
        })
        .map_err(|e| BackuparrError::Backend(format!("s3: upload of {key} failed: {e}")))?;

        Ok(BackupMetadata {
            key,
            app_name: app_name.to_string(),
            file_name: file_name.to_string(),
            size: data.len() as u64,
            created_at: Utc::now(),
        })
    }

    fn download(&self, key: &str) -> Result<(Vec<u8>, BackupMetadata)> {
        let url = self
            .bucket
            .get_object(Some(&self.credentials), key)
            .sign(PRESIGN_DURATION);

        let resp = retry_call(&self.retry, &self.cancel, &format!("S3 GET {key}"), || {
            self.agent.get(url.as_str()).call()
        })
        .map_err(|e| BackuparrError::Backend(format!("s3: download of {key} failed: {e}")))?;

        let created_at = resp
            .header("Last-Modified")
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let mut data = Vec::new();
        resp.into_reader()
            .read_to_end(&mut data)
            .map_err(|e| BackuparrError::Backend(format!("s3: reading {key} failed: {e}")))?;

        let (app_name, file_name) = self.parse_key(key);
        let size = data.len() as u64;
        Ok((
            data,
            BackupMetadata {
                key: key.to_string(),
                app_name: app_name.to_string(),
                file_name: file_name.to_string(),
                size,
                created_at,
            },
        ))
    }

    fn list(&self, app_name: &str) -> Result<Vec<BackupMetadata>> {
        let list_prefix = format!("{}/{app_name}/", self.prefix);

        let mut backups = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut action = self.bucket.list_objects_v2(Some(&self.credentials));
            action.query_mut().insert("prefix", &list_prefix);
            if let Some(ref token) = continuation_token {
                action.query_mut().insert("continuation-token", token);
            }
            let url = action.sign(PRESIGN_DURATION);

            let resp = retry_call(
                &self.retry,
                &self.cancel,
                &format!("S3 LIST {list_prefix}"),
                || self.agent.get(url.as_str()).call(),
            )
            .map_err(|e| BackuparrError::Backend(format!("s3: list failed: {e}")))?;

            let mut body = Vec::new();
            resp.into_reader()
                .read_to_end(&mut body)
                .map_err(|e| BackuparrError::Backend(format!("s3: reading list failed: {e}")))?;

            let body_str = std::str::from_utf8(&body).map_err(|e| {
                BackuparrError::Backend(format!("s3: list response not utf8: {e}"))
            })?;
            let parsed = ListObjectsV2::parse_response(body_str).map_err(|e| {
                BackuparrError::Backend(format!("s3: cannot parse list response: {e}"))
            })?;

            for obj in &parsed.contents {
                let (_, file_name) = self.parse_key(&obj.key);
                if !file_name.ends_with(".zip") {
                    continue;
                }
                let created_at = DateTime::parse_from_rfc3339(&obj.last_modified)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now());
                backups.push(BackupMetadata {
                    key: obj.key.clone(),
                    app_name: app_name.to_string(),
                    file_name: file_name.to_string(),
                    size: obj.size,
                    created_at,
                });
            }

            match parsed.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }

        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let url = self
            .bucket
            .delete_object(Some(&self.credentials), key)
            .sign(PRESIGN_DURATION);

        retry_call(&self.retry, &self.cancel, &format!("S3 DELETE {key}"), || {
            self.agent.delete(url.as_str()).call()
        })
        .map_err(|e| BackuparrError::Backend(format!("s3: delete of {key} failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_backend() -> S3Backend {
        let cfg = StorageConfig {
            kind: "s3".into(),
            bucket: "backups".into(),
            endpoint: "https://minio.local:9000".into(),
            access_key_id: "key".into(),
            secret_access_key: "secret".into(),
            ..Default::default()
        };
        S3Backend::new(&cfg, "s3".to_string(), CancelToken::new()).unwrap()
    }

    #[test]
    fn bucket_is_required() {
        let cfg = StorageConfig {
            kind: "s3".into(),
            ..Default::default()
        };
        let err = S3Backend::new(&cfg, "s3".to_string(), CancelToken::new()).unwrap_err();
        assert!(err.to_string().contains("bucket is required"));
    }

    #[test]
    fn object_keys_use_default_prefix() {
        let b = test_backend();
        assert_eq!(
            b.object_key("sonarr", "sonarr_2026-02-06T120000Z.zip"),
            "backuparr/sonarr/sonarr_2026-02-06T120000Z.zip"
        );
    }

    #[test]
    fn parse_key_inverts_object_key() {
        let b = test_backend();
        let key = b.object_key("radarr", "radarr_2026-02-06T120000Z.zip");
        let (app, file) = b.parse_key(&key);
        assert_eq!(app, "radarr");
        assert_eq!(file, "radarr_2026-02-06T120000Z.zip");
    }

    #[test]
    fn custom_prefix_is_trimmed() {
        let cfg = StorageConfig {
            kind: "s3".into(),
            bucket: "backups".into(),
            prefix: "/media/arr/".into(),
            endpoint: "https://minio.local:9000".into(),
            access_key_id: "key".into(),
            secret_access_key: "secret".into(),
            ..Default::default()
        };
        let b = S3Backend::new(&cfg, "s3".to_string(), CancelToken::new()).unwrap();
        assert_eq!(
            b.object_key("sonarr", "x.zip"),
            "media/arr/sonarr/x.zip"
        );
    }
}
