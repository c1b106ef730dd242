//! Backup client for TrueNAS Scale over its JSON-RPC 2.0 WebSocket API.
//!
//! Backup: connect to `ws(s)://<host>/api/current`, authenticate with an API
//! key, invoke `core.download("config.save", ...)` which returns
//! `[job_id, url]`, then POST that URL (empty body) for the artifact. With
//! `secretseed`/`root_authorized_keys` set, the result is a tar archive of
//! the system database plus secrets.
//!
//! Restore: multipart POST to `/_upload/` (`data` JSON field first, then
//! `file`), then poll `core.get_jobs` until the upload job reaches a
//! terminal state. The appliance reboots on its own shortly after a
//! successful restore; this client does not wait for the reboot.

use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Connector, Message, WebSocket};

use crate::cancel::CancelToken;
use crate::client::{BackupResult, Client, MultipartForm};
use crate::error::{BackuparrError, Result};

const WS_PATH: &str = "/api/current";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// config.save can take a while on large installations.
const RPC_TIMEOUT: Duration = Duration::from_secs(120);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);
const JOB_POLL_INTERVAL: Duration = Duration::from_secs(2);

const BACKUP_FILENAME: &str = "truenas-config.tar";

#[derive(Debug)]
pub struct TrueNasClient {
    base_url: String,
    api_key: String,
}

#[derive(Debug, serde::Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'a str,
    id: i64,
    method: &'a str,
    params: serde_json::Value,
}

/// Incoming frame: either a correlated response (has `id`) or a server
/// notification (no `id`, e.g. collection_update events), which we skip.
#[derive(Debug, Deserialize)]
struct RpcMessage {
    id: Option<i64>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// One row of `core.get_jobs`.
#[derive(Debug, Deserialize)]
struct JobInfo {
    state: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    progress: JobProgress,
}

#[derive(Debug, Default, Deserialize)]
struct JobProgress {
    #[serde(default)]
    percent: f64,
    #[serde(default)]
    description: String,
}

/// Blocking JSON-RPC connection with automatic request-id generation.
struct WsRpc {
    socket: WebSocket<MaybeTlsStream<TcpStream>>,
    next_id: i64,
}

impl WsRpc {
    fn call<T: DeserializeOwned>(&mut self, method: &str, params: serde_json::Value) -> Result<T> {
        self.next_id += 1;
        let id = self.next_id;

        let request = RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let payload = serde_json::to_string(&request)
            .map_err(|e| BackuparrError::Protocol(format!("cannot encode {method}: {e}")))?;
        self.socket
            .send(Message::Text(payload))
            .map_err(|e| BackuparrError::Protocol(format!("websocket write {method}: {e}")))?;

        loop {
            let frame = self
                .socket
                .read()
                .map_err(|e| BackuparrError::Protocol(format!("websocket read {method}: {e}")))?;
            let text = match frame {
                Message::Text(text) => text,
                // Control frames are answered by tungstenite; anything else
                // is not a response.
                _ => continue,
            };

            let message: RpcMessage = match serde_json::from_str(&text) {
                Ok(m) => m,
                Err(_) => continue,
            };

            // Notifications have no id; responses for other calls can't
            // happen with a single in-flight request but are skipped anyway.
            match message.id {
                Some(got) if got == id => {}
                _ => continue,
            }

            if let Some(err) = message.error {
                return Err(BackuparrError::Protocol(format!(
                    "RPC error {}: {}",
                    err.code, err.message
                )));
            }

            let result = message.result.unwrap_or(serde_json::Value::Null);
            return serde_json::from_value(result).map_err(|e| {
                BackuparrError::Protocol(format!("cannot decode {method} result: {e}"))
            });
        }
    }
}

impl TrueNasClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn parsed_base(&self) -> Result<url::Url> {
        url::Url::parse(&self.base_url)
            .map_err(|e| BackuparrError::Config(format!("invalid truenas URL: {e}")))
    }

    fn is_https(&self) -> bool {
        self.parsed_base()
            .map(|u| u.scheme() == "https")
            .unwrap_or(false)
    }

    fn ws_url(&self) -> Result<String> {
        let url = self.parsed_base()?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        let host = url
            .host_str()
            .ok_or_else(|| BackuparrError::Config("truenas URL has no host".into()))?;
        let port = url
            .port()
            .map(|p| format!(":{p}"))
            .unwrap_or_default();
        Ok(format!("{scheme}://{host}{port}{WS_PATH}"))
    }

    fn connect(&self) -> Result<WsRpc> {
        let url = self.parsed_base()?;
        let host = url
            .host_str()
            .ok_or_else(|| BackuparrError::Config("truenas URL has no host".into()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| BackuparrError::Config("truenas URL has no port".into()))?;

        let stream = TcpStream::connect((host, port))
            .map_err(|e| BackuparrError::Protocol(format!("cannot connect to {host}:{port}: {e}")))?;
        stream.set_read_timeout(Some(RPC_TIMEOUT))?;
        stream.set_write_timeout(Some(HANDSHAKE_TIMEOUT))?;

        // Home-lab instances run self-signed certs; accept them like every
        // other TrueNAS integration does.
        let connector = if self.is_https() {
            let tls = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .build()
                .map_err(|e| BackuparrError::Protocol(format!("TLS setup failed: {e}")))?;
            Some(Connector::NativeTls(tls))
        } else {
            None
        };

        let ws_url = self.ws_url()?;
        let (socket, _response) =
            tungstenite::client_tls_with_config(ws_url.as_str(), stream, None, connector)
                .map_err(|e| BackuparrError::Protocol(format!("websocket handshake: {e}")))?;

        Ok(WsRpc { socket, next_id: 0 })
    }

    fn authenticate(&self, rpc: &mut WsRpc) -> Result<()> {
        let authed: bool = rpc.call(
            "auth.login_with_api_key",
            serde_json::json!([self.api_key]),
        )?;
        if !authed {
            return Err(BackuparrError::Auth(
                "authentication failed: API key was rejected".into(),
            ));
        }
        tracing::debug!("[truenas] authenticated via API key");
        Ok(())
    }

    fn http_agent(&self) -> Result<ureq::Agent> {
        let mut builder = ureq::AgentBuilder::new().timeout_connect(Duration::from_secs(30));
        if self.is_https() {
            let tls = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .build()
                .map_err(|e| BackuparrError::Protocol(format!("TLS setup failed: {e}")))?;
            builder = builder.tls_connector(Arc::new(tls));
        }
        Ok(builder.build())
    }

    fn wait_for_job(&self, rpc: &mut WsRpc, cancel: &CancelToken, job_id: i64) -> Result<()> {
        let mut last_percent = -1.0;
        loop {
            cancel.check()?;

            let jobs: Vec<JobInfo> = rpc.call(
                "core.get_jobs",
                serde_json::json!([[["id", "=", job_id]]]),
            )?;
            let job = jobs
                .first()
                .ok_or_else(|| BackuparrError::Protocol(format!("job {job_id} not found")))?;

            if job.progress.percent != last_percent {
                tracing::info!(
                    "[truenas] job {job_id}: {:.0}% - {}",
                    job.progress.percent,
                    job.progress.description
                );
                last_percent = job.progress.percent;
            }

            match job.state.as_str() {
                "SUCCESS" => return Ok(()),
                "FAILED" => {
                    return Err(BackuparrError::Restore(
                        job.error.clone().unwrap_or_default(),
                    ))
                }
                "ABORTED" => return Err(BackuparrError::Restore("job was aborted".into())),
                _ => {}
            }

            if !cancel.sleep(JOB_POLL_INTERVAL) {
                return Err(BackuparrError::Cancelled);
            }
        }
    }
}

impl Client for TrueNasClient {
    fn name(&self) -> &str {
        "truenas"
    }

    fn backup(&self, cancel: &CancelToken) -> Result<(BackupResult, Vec<u8>)> {
        cancel.check()?;

        let mut rpc = self.connect()?;
        self.authenticate(&mut rpc)?;

        // With any option set config.save produces a tar archive instead of
        // a bare sqlite file; include the secrets for a complete backup.
        let save_opts = serde_json::json!({
            "secretseed": true,
            "root_authorized_keys": true,
        });
        let (job_id, download_path): (i64, String) = rpc.call(
            "core.download",
            serde_json::json!(["config.save", [save_opts], BACKUP_FILENAME, false]),
        )?;
        tracing::info!("[truenas] config save job {job_id} started, downloading from {download_path}");

        cancel.check()?;

        // The download URL carries an embedded auth token; the endpoint
        // accepts POST with an empty body.
        let url = format!("{}{download_path}", self.base_url);
        let resp = self
            .http_agent()?
            .post(&url)
            .timeout(TRANSFER_TIMEOUT)
            .send_bytes(&[])
            .map_err(|e| match e {
                ureq::Error::Status(code, _) => {
                    BackuparrError::Download(format!("HTTP {code} from download endpoint"))
                }
                other => BackuparrError::Download(format!("download failed: {other}")),
            })?;

        let mut data = Vec::new();
        std::io::Read::read_to_end(&mut resp.into_reader(), &mut data)
            .map_err(|e| BackuparrError::Download(format!("reading download failed: {e}")))?;

        let result = BackupResult {
            name: BACKUP_FILENAME.to_string(),
            path: String::new(),
            size: data.len() as u64,
            created_at: Utc::now(),
        };
        Ok((result, data))
    }

    fn restore(&self, cancel: &CancelToken, data: &[u8]) -> Result<()> {
        cancel.check()?;

        // "data" must precede the file field per the upload endpoint's docs.
        let mut form = MultipartForm::new();
        form.add_text("data", r#"{"method": "config.upload", "params": []}"#);
        form.add_file("file", BACKUP_FILENAME, data);
        let (content_type, body) = form.finish();

        let url = format!("{}/_upload/", self.base_url);
        let resp = self
            .http_agent()?
            .post(&url)
            .set("Content-Type", &content_type)
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .timeout(TRANSFER_TIMEOUT)
            .send_bytes(&body)
            .map_err(|e| match e {
                ureq::Error::Status(code, resp) => BackuparrError::Restore(format!(
                    "upload failed (HTTP {code}): {}",
                    resp.into_string().unwrap_or_default()
                )),
                other => BackuparrError::Restore(format!("upload failed: {other}")),
            })?;

        #[derive(Deserialize)]
        struct UploadResponse {
            job_id: i64,
        }
        let upload: UploadResponse = resp
            .into_json()
            .map_err(|e| BackuparrError::Restore(format!("cannot decode upload response: {e}")))?;
        tracing::info!(
            "[truenas] config upload job {} started, waiting for completion",
            upload.job_id
        );

        let mut rpc = self.connect()?;
        self.authenticate(&mut rpc)?;
        self.wait_for_job(&mut rpc, cancel, upload.job_id)?;

        // TrueNAS reboots itself ~10s after a successful upload; requests in
        // that window will fail.
        tracing::info!(
            "[truenas] config restored (job {}). The appliance will reboot shortly.",
            upload.job_id
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_derivation() {
        let plain = TrueNasClient::new("http://nas.local", "key");
        assert_eq!(plain.ws_url().unwrap(), "ws://nas.local/api/current");
        assert!(!plain.is_https());

        let tls = TrueNasClient::new("https://nas.local/", "key");
        assert_eq!(tls.ws_url().unwrap(), "wss://nas.local/api/current");
        assert!(tls.is_https());

        let with_port = TrueNasClient::new("http://192.168.1.136:8080", "key");
        assert_eq!(
            with_port.ws_url().unwrap(),
            "ws://192.168.1.136:8080/api/current"
        );
    }

    #[test]
    fn invalid_base_url_is_a_config_error() {
        let client = TrueNasClient::new("not a url", "key");
        assert!(matches!(
            client.ws_url(),
            Err(BackuparrError::Config(_))
        ));
    }

    #[test]
    fn rpc_messages_distinguish_notifications() {
        let notification: RpcMessage = serde_json::from_str(
            r#"{"jsonrpc": "2.0", "method": "collection_update", "params": {"msg": "changed"}}"#,
        )
        .unwrap();
        assert!(notification.id.is_none());

        let response: RpcMessage =
            serde_json::from_str(r#"{"jsonrpc": "2.0", "id": 3, "result": true}"#).unwrap();
        assert_eq!(response.id, Some(3));
        assert_eq!(response.result, Some(serde_json::Value::Bool(true)));

        let failure: RpcMessage = serde_json::from_str(
            r#"{"jsonrpc": "2.0", "id": 4, "error": {"code": -32601, "message": "no such method"}}"#,
        )
        .unwrap();
        let err = failure.error.unwrap();
        assert_eq!(err.code, -32601);
        assert_eq!(err.message, "no such method");
    }

    #[test]
    fn job_rows_parse_terminal_states() {
        let rows: Vec<JobInfo> = serde_json::from_str(
            r#"[{"id": 12, "state": "SUCCESS", "progress": {"percent": 100.0, "description": "done"}}]"#,
        )
        .unwrap();
        assert_eq!(rows[0].state, "SUCCESS");
        assert_eq!(rows[0].progress.percent, 100.0);

        let failed: Vec<JobInfo> = serde_json::from_str(
            r#"[{"id": 13, "state": "FAILED", "error": "checksum mismatch"}]"#,
        )
        .unwrap();
        assert_eq!(failed[0].error.as_deref(), Some("checksum mismatch"));
    }

    #[test]
    fn core_download_result_shape() {
        let result: (i64, String) = serde_json::from_str(
            r#"[57, "/_download/57?auth_token=abc123"]"#,
        )
        .unwrap();
        assert_eq!(result.0, 57);
        assert!(result.1.starts_with("/_download/"));
    }
}
