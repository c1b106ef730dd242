use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::artifact;
use crate::cancel::CancelToken;
use crate::client::{BackupResult, Client, MultipartForm};
use crate::error::{BackuparrError, Result};
use crate::postgres::PostgresConfig;
use crate::transport::{retry_call, RetryPolicy};

/// Interval between command status polls.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Timeout for control-plane requests.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for artifact downloads and restore uploads.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);

/// Content types accepted for a backup download. Anything else is treated as
/// a failed download; misconfigured forms auth returns HTML login pages.
const VALID_ZIP_CONTENT_TYPES: &[&str] = &[
    "application/zip",
    "application/octet-stream",
    "application/x-zip-compressed",
    "application/x-zip",
];

/// Forms login is authoritative only through the session cookie: the apps
/// return 200 even on bad credentials, but only set a cookie whose name ends
/// in this suffix on success.
const AUTH_COOKIE_SUFFIX: &str = "Auth";

/// Database type label the apps report when running against Postgres.
const POSTGRES_DB_TYPE: &str = "postgresql";

/// The three *arr applications share one protocol; they differ only in API
/// base path and whether a Postgres enrichment step applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrKind {
    Sonarr,
    Radarr,
    Prowlarr,
}

impl ArrKind {
    pub fn app_name(self) -> &'static str {
        match self {
            ArrKind::Sonarr => "sonarr",
            ArrKind::Radarr => "radarr",
            ArrKind::Prowlarr => "prowlarr",
        }
    }

    pub fn api_base(self) -> &'static str {
        match self {
            ArrKind::Sonarr | ArrKind::Radarr => "/api/v3",
            ArrKind::Prowlarr => "/api/v1",
        }
    }

    /// Prowlarr has no Postgres backup path.
    pub fn postgres_capable(self) -> bool {
        !matches!(self, ArrKind::Prowlarr)
    }
}

/// Terminal and pending states of a server-side command. Labels are matched
/// case-insensitively; the apps differ in casing conventions.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CommandStatus {
    Queued,
    Started,
    Completed,
    Failed,
    Cancelled,
    Aborted,
    Other(String),
}

impl CommandStatus {
    fn parse(label: &str) -> Self {
        match label.to_lowercase().as_str() {
            "queued" => CommandStatus::Queued,
            "started" => CommandStatus::Started,
            "completed" => CommandStatus::Completed,
            "failed" => CommandStatus::Failed,
            "cancelled" => CommandStatus::Cancelled,
            "aborted" => CommandStatus::Aborted,
            _ => CommandStatus::Other(label.to_string()),
        }
    }
}

// Upstream responses model optional fields as nullable; keep them Option and
// fail fast where a field is required.

#[derive(Debug, Deserialize)]
struct CommandResource {
    id: Option<i64>,
    status: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BackupResource {
    name: Option<String>,
    path: Option<String>,
    size: Option<u64>,
    time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HostConfigResource {
    authentication_method: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SystemResource {
    database_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RestoreResponse {
    #[serde(rename = "RestartRequired", alias = "restartRequired", default)]
    restart_required: bool,
}

/// Client for Sonarr, Radarr, and Prowlarr: a poll-driven command state
/// machine over the HTTP API, with multi-mode auth for the artifact download
/// and an optional Postgres enrichment/restore path.
#[derive(Debug)]
pub struct ArrClient {
    kind: ArrKind,
    base_url: String,
    api_key: String,
    username: String,
    password: String,
    pg_override: Option<PostgresConfig>,
    agent: ureq::Agent,
    retry: RetryPolicy,
}

impl ArrClient {
    pub fn new(
        kind: ArrKind,
        base_url: &str,
        api_key: &str,
        username: &str,
        password: &str,
        pg_override: Option<PostgresConfig>,
    ) -> Self {
        // One agent for everything: the cookie jar set by the forms login
        // must be visible to the download request.
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .build();

        Self {
            kind,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            pg_override,
            agent,
            retry: RetryPolicy::default(),
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, self.kind.api_base(), path)
    }

    fn api_get(&self, cancel: &CancelToken, path: &str) -> Result<ureq::Response> {
        let url = self.api_url(path);
        retry_call(&self.retry, cancel, &format!("GET {path}"), || {
            self.agent
                .get(&url)
                .set("X-Api-Key", &self.api_key)
                .timeout(CONTROL_TIMEOUT)
                .call()
        })
        .map_err(|e| protocol_error(&url, e))
    }

    fn run_backup_command(&self, cancel: &CancelToken) -> Result<i64> {
        let url = self.api_url("/command");
        let resp = retry_call(&self.retry, cancel, "POST /command", || {
            self.agent
                .post(&url)
                .set("X-Api-Key", &self.api_key)
                .timeout(CONTROL_TIMEOUT)
                .send_json(serde_json::json!({"name": "Backup"}))
        })
        .map_err(|e| protocol_error(&url, e))?;

        let command: CommandResource = parse_json(resp)?;
        command
            .id
            .ok_or_else(|| BackuparrError::Protocol("command response has no id".into()))
    }

    fn wait_for_command(&self, cancel: &CancelToken, command_id: i64) -> Result<()> {
        loop {
            cancel.check()?;

            let resp = self.api_get(cancel, &format!("/command/{command_id}"))?;
            let command: CommandResource = parse_json(resp)?;

            if let Some(label) = command.status.as_deref() {
                tracing::debug!("[{}] command status: {label}", self.name());
                match CommandStatus::parse(label) {
                    CommandStatus::Completed => return Ok(()),
                    CommandStatus::Failed => {
                        return Err(BackuparrError::CommandFailed(
                            command.message.unwrap_or_default(),
                        ))
                    }
                    CommandStatus::Cancelled => {
                        return Err(BackuparrError::CommandFailed("command was cancelled".into()))
                    }
                    CommandStatus::Aborted => {
                        return Err(BackuparrError::CommandFailed("command was aborted".into()))
                    }
                    CommandStatus::Queued | CommandStatus::Started | CommandStatus::Other(_) => {}
                }
            }

            if !cancel.sleep(POLL_INTERVAL) {
                return Err(BackuparrError::Cancelled);
            }
        }
    }

    fn backup_files(&self, cancel: &CancelToken) -> Result<Vec<BackupResource>> {
        let resp = self.api_get(cancel, "/system/backup")?;
        parse_json(resp)
    }

    fn auth_method(&self, cancel: &CancelToken) -> Result<String> {
        let resp = self.api_get(cancel, "/config/host")?;
        let config: HostConfigResource = parse_json(resp)?;
        Ok(config
            .authentication_method
            .unwrap_or_else(|| "none".to_string()))
    }

    fn database_type(&self, cancel: &CancelToken) -> Result<String> {
        let resp = self.api_get(cancel, "/system/status")?;
        let status: SystemResource = parse_json(resp)?;
        Ok(status.database_type.unwrap_or_else(|| "sqLite".to_string()))
    }

    fn login_with_forms(&self, cancel: &CancelToken) -> Result<()> {
        let url = format!("{}/login", self.base_url);
        let result = retry_call(&self.retry, cancel, "POST /login", || {
            self.agent
                .post(&url)
                .timeout(CONTROL_TIMEOUT)
                .send_form(&[("username", &self.username), ("password", &self.password)])
        });

        match result {
            Ok(_) => {}
            Err(ureq::Error::Status(401, _)) => {
                return Err(BackuparrError::Auth("login failed: invalid credentials".into()))
            }
            Err(ureq::Error::Status(code, resp)) => {
                return Err(BackuparrError::Auth(format!(
                    "login failed with status {code}: {}",
                    body_snippet(resp)
                )))
            }
            Err(e) => return Err(BackuparrError::Auth(format!("login request failed: {e}"))),
        }

        // The apps answer 200 even on bad credentials; the session cookie is
        // the only authoritative success signal.
        if !self.has_auth_cookie() {
            return Err(BackuparrError::Auth(
                "login failed: no auth cookie received (check username/password)".into(),
            ));
        }

        tracing::debug!("[{}] forms login successful", self.name());
        Ok(())
    }

    fn has_auth_cookie(&self) -> bool {
        let Ok(url) = url::Url::parse(&self.base_url) else {
            return false;
        };
        self.agent
            .cookie_store()
            .matches(&url)
            .iter()
            .any(|c| c.name().ends_with(AUTH_COOKIE_SUFFIX))
    }

    fn download_backup(
        &self,
        cancel: &CancelToken,
        path: &str,
        expected_size: u64,
    ) -> Result<Vec<u8>> {
        let auth_method = self.auth_method(cancel)?.to_lowercase();
        tracing::debug!("[{}] authentication method: {auth_method}", self.name());

        match auth_method.as_str() {
            "forms" => self.login_with_forms(cancel)?,
            // Basic credentials ride on the download request itself.
            "basic" | "none" | "external" => {}
            other => {
                tracing::warn!(
                    "[{}] unknown auth method '{other}', proceeding without session auth",
                    self.name()
                );
            }
        }

        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("[{}] downloading backup from {url}", self.name());

        let resp = retry_call(&self.retry, cancel, "GET backup", || {
            let mut req = self
                .agent
                .get(&url)
                .set("X-Api-Key", &self.api_key)
                .timeout(TRANSFER_TIMEOUT);
            if auth_method == "basic" && !self.username.is_empty() {
                req = req.set("Authorization", &basic_auth(&self.username, &self.password));
            }
            req.call()
        })
        .map_err(|e| match e {
            ureq::Error::Status(code, resp) => BackuparrError::Download(format!(
                "download error: {code} - {}",
                body_snippet(resp)
            )),
            other => BackuparrError::Download(format!("download failed: {other}")),
        })?;

        if !(200..300).contains(&resp.status()) {
            return Err(BackuparrError::Download(format!(
                "download error: {}",
                resp.status()
            )));
        }

        let content_type = resp
            .header("Content-Type")
            .map(|v| v.split(';').next().unwrap_or("").trim().to_string())
            .unwrap_or_default();
        if !content_type.is_empty() && !VALID_ZIP_CONTENT_TYPES.contains(&content_type.as_str()) {
            return Err(BackuparrError::Download(format!(
                "unexpected content type: {content_type} (expected application/zip)"
            )));
        }

        let content_length: u64 = resp
            .header("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if content_length > 0 && expected_size > 0 && content_length != expected_size {
            tracing::warn!(
                "[{}] content length mismatch: got {content_length}, expected {expected_size} (continuing)",
                self.name()
            );
        }

        let mut data = Vec::new();
        std::io::Read::read_to_end(&mut resp.into_reader(), &mut data)
            .map_err(|e| BackuparrError::Download(format!("reading backup stream failed: {e}")))?;
        Ok(data)
    }

    /// Splice Postgres dumps into the artifact when the app runs on Postgres.
    fn enrich_with_postgres(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        let detected = artifact::parse_postgres_config(&data)?;
        let pg = match (detected, self.pg_override.as_ref()) {
            (Some(cfg), o) => cfg.with_override(o),
            // No settings in config.xml: the override is the whole config.
            (None, Some(o)) => o.clone(),
            (None, None) => return Ok(data),
        };

        tracing::info!(
            "[{}] postgres detected, dumping databases at {}:{}",
            self.name(),
            pg.host,
            pg.port
        );
        let dumps = pg.dump_all()?;
        tracing::info!(
            "[{}] dumped {} database(s), building enhanced backup",
            self.name(),
            dumps.len()
        );
        artifact::enhance_archive(&data, &dumps)
    }

    fn restart(&self, cancel: &CancelToken) -> Result<()> {
        let url = self.api_url("/system/restart");
        retry_call(&self.retry, cancel, "POST /system/restart", || {
            self.agent
                .post(&url)
                .set("X-Api-Key", &self.api_key)
                .timeout(CONTROL_TIMEOUT)
                .send_bytes(&[])
        })
        .map_err(|e| BackuparrError::Restore(format!("restart command failed: {e}")))?;
        Ok(())
    }
}

impl Client for ArrClient {
    fn name(&self) -> &str {
        self.kind.app_name()
    }

    fn backup(&self, cancel: &CancelToken) -> Result<(BackupResult, Vec<u8>)> {
        let command_id = self.run_backup_command(cancel)?;
        self.wait_for_command(cancel, command_id)?;

        let backups = self.backup_files(cancel)?;
        // Newest-first by API contract; the head is the artifact we just made.
        let latest = backups
            .first()
            .ok_or_else(|| BackuparrError::Protocol("no backup files found after backup command".into()))?;

        let path = latest
            .path
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| BackuparrError::Protocol("backup path is empty".into()))?;

        let mut data = self.download_backup(cancel, &path, latest.size.unwrap_or(0))?;

        let db_type = match self.database_type(cancel) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("[{}] could not determine database type: {e}", self.name());
                "sqLite".to_string()
            }
        };

        if self.kind.postgres_capable() && db_type.to_lowercase() == POSTGRES_DB_TYPE {
            data = self.enrich_with_postgres(data)?;
        }

        let result = BackupResult {
            name: latest.name.clone().unwrap_or_default(),
            path,
            size: data.len() as u64,
            created_at: latest.time.unwrap_or_else(Utc::now),
        };
        Ok((result, data))
    }

    fn restore(&self, cancel: &CancelToken, data: &[u8]) -> Result<()> {
        let dumps = artifact::extract_postgres_dumps(data)?;

        if !dumps.is_empty() {
            tracing::info!(
                "[{}] postgres backup detected with {} database dump(s)",
                self.name(),
                dumps.len()
            );

            let detected = artifact::parse_postgres_config(data)?;
            let pg = match (detected, self.pg_override.as_ref()) {
                (Some(cfg), o) => cfg.with_override(o),
                (None, Some(o)) => o.clone(),
                (None, None) => {
                    return Err(BackuparrError::Protocol(
                        "backup contains postgres dumps but config.xml has no postgres settings"
                            .into(),
                    ))
                }
            };

            pg.restore_all(&dumps)?;
            tracing::info!("[{}] postgres databases restored", self.name());
        }

        // The original (non-enriched) bytes go to the app; it ignores the
        // postgres/ entries and restores its own files.
        let mut form = MultipartForm::new();
        form.add_file("restore", "backup.zip", data);
        let (content_type, body) = form.finish();

        let url = self.api_url("/system/backup/restore/upload");
        let resp = retry_call(&self.retry, cancel, "POST restore upload", || {
            self.agent
                .post(&url)
                .set("X-Api-Key", &self.api_key)
                .set("Content-Type", &content_type)
                .timeout(TRANSFER_TIMEOUT)
                .send_bytes(&body)
        })
        .map_err(|e| match e {
            ureq::Error::Status(code, resp) => BackuparrError::Restore(format!(
                "restore upload failed: {code} - {}",
                body_snippet(resp)
            )),
            other => BackuparrError::Restore(format!("restore upload failed: {other}")),
        })?;

        let restore: RestoreResponse = match resp.into_json() {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("[{}] cannot parse restore response: {e}", self.name());
                RestoreResponse::default()
            }
        };

        tracing::info!(
            "[{}] backup uploaded, restart required: {}",
            self.name(),
            restore.restart_required
        );

        if restore.restart_required {
            self.restart(cancel)?;
            tracing::info!("[{}] restart triggered", self.name());
        }
        Ok(())
    }
}

fn basic_auth(username: &str, password: &str) -> String {
    let encoded =
        base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
    format!("Basic {encoded}")
}

fn parse_json<T: serde::de::DeserializeOwned>(resp: ureq::Response) -> Result<T> {
    resp.into_json()
        .map_err(|e| BackuparrError::Protocol(format!("cannot decode response: {e}")))
}

fn protocol_error(url: &str, e: ureq::Error) -> BackuparrError {
    match e {
        ureq::Error::Status(code, resp) => {
            BackuparrError::Protocol(format!("API error at {url}: {code} - {}", body_snippet(resp)))
        }
        other => BackuparrError::Protocol(format!("request to {url} failed: {other}")),
    }
}

fn body_snippet(resp: ureq::Response) -> String {
    let body = resp.into_string().unwrap_or_default();
    body.chars().take(300).collect()
}
