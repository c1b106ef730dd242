use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;

use crate::cancel::CancelToken;
use crate::client::{BackupResult, Client, MultipartForm};
use crate::error::{BackuparrError, Result};
use crate::transport::{retry_call, RetryPolicy};

const TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);

/// Client for apps without a native backup API, fronted by the backuparr
/// sidecar HTTP server (nzbget, transmission, overseerr, ...). The sidecar
/// zips the app's data directory on demand and unpacks uploads.
#[derive(Debug)]
pub struct SidecarClient {
    base_url: String,
    api_key: String,
    app_name: String,
    agent: ureq::Agent,
    retry: RetryPolicy,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestoreOutcome {
    #[serde(default)]
    message: String,
    #[serde(default)]
    restart: RestartOutcome,
}

#[derive(Debug, Default, Deserialize)]
struct RestartOutcome {
    #[serde(default)]
    attempted: bool,
    #[serde(default)]
    success: bool,
}

impl SidecarClient {
    pub fn new(base_url: &str, api_key: &str, app_name: &str) -> Result<Self> {
        if base_url.is_empty() {
            return Err(BackuparrError::Config("sidecar URL is required".into()));
        }
        if app_name.is_empty() {
            return Err(BackuparrError::Config(
                "app name is required for sidecar client".into(),
            ));
        }

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .build();

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            app_name: app_name.to_string(),
            agent,
            retry: RetryPolicy::default(),
        })
    }

    fn with_api_key(&self, req: ureq::Request) -> ureq::Request {
        if self.api_key.is_empty() {
            req
        } else {
            req.set("X-Api-Key", &self.api_key)
        }
    }
}

impl Client for SidecarClient {
    fn name(&self) -> &str {
        &self.app_name
    }

    fn backup(&self, cancel: &CancelToken) -> Result<(BackupResult, Vec<u8>)> {
        let url = format!("{}/api/v1/backup", self.base_url);
        let resp = retry_call(&self.retry, cancel, "sidecar backup", || {
            let req = self.agent.post(&url).timeout(TRANSFER_TIMEOUT);
            self.with_api_key(req).send_bytes(&[])
        })
        .map_err(|e| match e {
            ureq::Error::Status(code, resp) => BackuparrError::Download(format!(
                "sidecar backup failed (HTTP {code}): {}",
                resp.into_string().unwrap_or_default()
            )),
            other => BackuparrError::Download(format!("sidecar backup request failed: {other}")),
        })?;

        let mut data = Vec::new();
        std::io::Read::read_to_end(&mut resp.into_reader(), &mut data)
            .map_err(|e| BackuparrError::Download(format!("reading sidecar backup failed: {e}")))?;

        tracing::info!("[{}] sidecar backup received: {} bytes", self.app_name, data.len());

        let result = BackupResult {
            name: format!("{}-sidecar-backup", self.app_name),
            path: String::new(),
            size: data.len() as u64,
            created_at: Utc::now(),
        };
        Ok((result, data))
    }

    fn restore(&self, cancel: &CancelToken, data: &[u8]) -> Result<()> {
        let mut form = MultipartForm::new();
        form.add_file("backup", "backup.zip", data);
        let (content_type, body) = form.finish();

        let url = format!("{}/api/v1/restore", self.base_url);
        let resp = retry_call(&self.retry, cancel, "sidecar restore", || {
            let req = self
                .agent
                .post(&url)
                .set("Content-Type", &content_type)
                .timeout(TRANSFER_TIMEOUT);
            self.with_api_key(req).send_bytes(&body)
        })
        .map_err(|e| match e {
            ureq::Error::Status(code, resp) => BackuparrError::Restore(format!(
                "sidecar restore failed (HTTP {code}): {}",
                resp.into_string().unwrap_or_default()
            )),
            other => BackuparrError::Restore(format!("sidecar restore request failed: {other}")),
        })?;

        if let Ok(outcome) = resp.into_json::<RestoreOutcome>() {
            if !outcome.message.is_empty() {
                tracing::info!("[{}] {}", self.app_name, outcome.message);
            }
            if outcome.restart.attempted && !outcome.restart.success {
                tracing::warn!(
                    "[{}] restart failed, restart the app manually",
                    self.app_name
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestServer;

    #[test]
    fn requires_url_and_name() {
        assert!(SidecarClient::new("", "key", "app").is_err());
        assert!(SidecarClient::new("http://localhost:1234", "key", "").is_err());
        assert!(SidecarClient::new("http://localhost:1234", "", "app").is_ok());
    }

    #[test]
    fn backup_fetches_zip_bytes() {
        let server = TestServer::start(|req| {
            if req.header("X-Api-Key") != Some("secret") {
                return TestServer::status(401, "missing api key");
            }
            if req.method == "POST" && req.path == "/api/v1/backup" {
                TestServer::bytes(200, "application/zip", b"PK\x03\x04zipdata")
            } else {
                TestServer::status(404, "not found")
            }
        });

        let client = SidecarClient::new(&server.base_url(), "secret", "nzbget").unwrap();
        let (result, data) = client.backup(&CancelToken::new()).unwrap();
        assert_eq!(result.name, "nzbget-sidecar-backup");
        assert!(result.path.is_empty());
        assert_eq!(data.len() as u64, result.size);
        assert!(data.starts_with(b"PK"));
    }

    #[test]
    fn restore_posts_multipart_backup_field() {
        let server = TestServer::start(|req| {
            if req.method == "POST" && req.path == "/api/v1/restore" {
                let body = String::from_utf8_lossy(&req.body);
                if !body.contains("name=\"backup\"") {
                    return TestServer::status(400, "missing backup field");
                }
                TestServer::json(
                    200,
                    r#"{"success": true, "message": "restored", "restart": {"attempted": true, "success": true}}"#,
                )
            } else {
                TestServer::status(404, "not found")
            }
        });

        let client = SidecarClient::new(&server.base_url(), "", "overseerr").unwrap();
        assert!(client.restore(&CancelToken::new(), b"PK\x03\x04").is_ok());
    }

    #[test]
    fn restore_failure_surfaces_status() {
        let server = TestServer::start(|_| TestServer::status(500, "exploded"));
        let client = SidecarClient::new(&server.base_url(), "", "app").unwrap();
        let err = client.restore(&CancelToken::new(), b"PK").unwrap_err();
        assert!(matches!(err, BackuparrError::Restore(_)));
    }
}
