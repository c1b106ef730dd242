pub mod arr;
pub mod sidecar;
pub mod truenas;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::cancel::CancelToken;
use crate::config::AppConfig;
use crate::error::{BackuparrError, Result};
use crate::postgres::PostgresConfig;

/// Description of an artifact produced by an app client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupResult {
    /// Original filename reported by the application.
    pub name: String,
    /// Application-provided path; empty for apps that stream without one.
    pub path: String,
    /// Size of the final artifact in bytes.
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Contract every application client implements.
pub trait Client: Send + Sync + std::fmt::Debug {
    /// Stable application identifier used for storage paths and logging.
    fn name(&self) -> &str;

    /// Produce a backup artifact.
    fn backup(&self, cancel: &CancelToken) -> Result<(BackupResult, Vec<u8>)>;

    /// Restore the application from artifact bytes.
    fn restore(&self, cancel: &CancelToken, data: &[u8]) -> Result<()>;
}

/// Build the right client for an app config entry.
pub fn client_from_config(cfg: &AppConfig) -> Result<Box<dyn Client>> {
    let pg_override = cfg.postgres.as_ref().map(|o| PostgresConfig {
        host: o.host.clone(),
        port: o.port.clone(),
        user: o.user.clone(),
        password: o.password.clone(),
        main_db: o.main_db.clone(),
        log_db: o.log_db.clone(),
    });

    let conn = &cfg.connection;
    match cfg.app_type.as_str() {
        "sonarr" => Ok(Box::new(arr::ArrClient::new(
            arr::ArrKind::Sonarr,
            &conn.url,
            &conn.api_key,
            &conn.username,
            &conn.password,
            pg_override,
        ))),
        "radarr" => Ok(Box::new(arr::ArrClient::new(
            arr::ArrKind::Radarr,
            &conn.url,
            &conn.api_key,
            &conn.username,
            &conn.password,
            pg_override,
        ))),
        "prowlarr" => Ok(Box::new(arr::ArrClient::new(
            arr::ArrKind::Prowlarr,
            &conn.url,
            &conn.api_key,
            &conn.username,
            &conn.password,
            None,
        ))),
        "truenas" => Ok(Box::new(truenas::TrueNasClient::new(
            &conn.url,
            &conn.api_key,
        ))),
        "sidecar" => {
            let name = if cfg.name.is_empty() {
                "sidecar"
            } else {
                &cfg.name
            };
            sidecar::SidecarClient::new(&conn.url, &conn.api_key, name)
                .map(|c| Box::new(c) as Box<dyn Client>)
        }
        other => Err(BackuparrError::Config(format!(
            "unsupported app type: '{other}'"
        ))),
    }
}

/// Hand-assembled `multipart/form-data` body. The apps only need flat text
/// and file fields, which keeps a full multipart dependency out of the tree.
pub(crate) struct MultipartForm {
    boundary: String,
    body: Vec<u8>,
}

impl MultipartForm {
    pub fn new() -> Self {
        let suffix: u64 = rand::thread_rng().gen();
        Self {
            boundary: format!("----backuparr-{suffix:016x}"),
            body: Vec::new(),
        }
    }

    pub fn add_text(&mut self, name: &str, value: &str) {
        self.body
            .extend_from_slice(format!("--{}\r\n", self.boundary).as_bytes());
        self.body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
        );
        self.body.extend_from_slice(value.as_bytes());
        self.body.extend_from_slice(b"\r\n");
    }

    pub fn add_file(&mut self, name: &str, filename: &str, data: &[u8]) {
        self.body
            .extend_from_slice(format!("--{}\r\n", self.boundary).as_bytes());
        self.body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        self.body.extend_from_slice(data);
        self.body.extend_from_slice(b"\r\n");
    }

    /// Finalize into `(content_type, body)`.
    pub fn finish(mut self) -> (String, Vec<u8>) {
        self.body
            .extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        (
            format!("multipart/form-data; boundary={}", self.boundary),
            self.body,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Connection;

    #[test]
    fn factory_builds_known_app_types() {
        for app_type in ["sonarr", "radarr", "prowlarr", "truenas"] {
            let cfg = AppConfig {
                app_type: app_type.to_string(),
                connection: Connection {
                    url: "http://localhost:1234".into(),
                    api_key: "key".into(),
                    ..Default::default()
                },
                ..Default::default()
            };
            let client = client_from_config(&cfg).unwrap();
            assert_eq!(client.name(), app_type);
        }
    }

    #[test]
    fn factory_rejects_unknown_app_types() {
        let cfg = AppConfig {
            app_type: "plex".into(),
            ..Default::default()
        };
        let err = client_from_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("unsupported app type"));
    }

    #[test]
    fn sidecar_uses_configured_display_name() {
        let cfg = AppConfig {
            app_type: "sidecar".into(),
            name: "nzbget".into(),
            connection: Connection {
                url: "http://localhost:5678".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let client = client_from_config(&cfg).unwrap();
        assert_eq!(client.name(), "nzbget");
    }

    #[test]
    fn multipart_form_layout() {
        let mut form = MultipartForm::new();
        form.add_text("data", "{\"method\": \"config.upload\"}");
        form.add_file("file", "backup.zip", b"PK\x03\x04");
        let (content_type, body) = form.finish();

        assert!(content_type.starts_with("multipart/form-data; boundary="));
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("Content-Disposition: form-data; name=\"data\""));
        assert!(text.contains("name=\"file\"; filename=\"backup.zip\""));
        assert!(text.trim_end().ends_with("--"));
        // data field precedes the file field
        let data_at = text.find("name=\"data\"").unwrap();
        let file_at = text.find("name=\"file\"").unwrap();
        assert!(data_at < file_at);
    }
}
