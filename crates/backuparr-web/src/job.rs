use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a job was asked to do: every configured app, or a single one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub app: Option<String>,
    #[serde(default)]
    pub all: bool,
}

/// Per-app outcome row of a job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub app: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub status: String,
}

impl JobResult {
    pub fn ok(app: &str) -> Self {
        Self {
            app: app.to_string(),
            ok: true,
            error: None,
            status: "ok".to_string(),
        }
    }

    pub fn failed(app: &str, error: String) -> Self {
        Self {
            app: app.to_string(),
            ok: false,
            error: Some(error),
            status: "failed".to_string(),
        }
    }
}

/// One orchestrator invocation, inspectable over HTTP. Lives in the server's
/// in-memory job map; once `running` is false nothing mutates anymore.
#[derive(Debug)]
pub struct BackupJob {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub running: bool,
    pub success: Option<bool>,
    pub request: JobRequest,
    pub results: Vec<JobResult>,
    pub logs: Vec<String>,
}

impl BackupJob {
    pub fn new(id: String, request: JobRequest) -> Self {
        Self {
            id,
            started_at: Utc::now(),
            ended_at: None,
            running: true,
            success: None,
            request,
            results: Vec::new(),
            logs: vec!["Backup job started".to_string()],
        }
    }

    /// Deep copy for emission; emitted data never aliases in-flight state.
    pub fn snapshot(&self) -> JobSnapshot {
        let status = if self.running {
            "running"
        } else if self.success == Some(true) {
            "completed"
        } else {
            "failed"
        };
        JobSnapshot {
            job_id: self.id.clone(),
            running: self.running,
            success: self.success,
            status: status.to_string(),
            results: self.results.clone(),
            logs: self.logs.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }
}

/// Wire form of a job as returned by the poll endpoint and the WebSocket.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub job_id: String,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    pub status: String,
    pub results: Vec<JobResult>,
    pub logs: Vec<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}
