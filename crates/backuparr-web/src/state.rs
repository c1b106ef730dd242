use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;

use backuparr_core::cancel::CancelToken;
use backuparr_core::client::client_from_config;
use backuparr_core::config::{preflight_check, BackuparrConfig};
use backuparr_core::orchestrator::run_backup;
use backuparr_core::storage::backends_from_config;

use crate::capture::CaptureSink;
use crate::job::{BackupJob, JobRequest, JobResult, JobSnapshot};

/// Shared server state, cloned into every handler.
#[derive(Clone)]
pub struct WebState {
    pub inner: Arc<WebStateInner>,
}

pub struct WebStateInner {
    pub config: BackuparrConfig,
    /// Jobs by id, for the lifetime of the server. No persistence boundary.
    jobs: RwLock<HashMap<String, BackupJob>>,
    /// Serializes job execution: at most one backup job runs at a time, and
    /// the capture sink belongs to the job holding this lock.
    job_gate: Mutex<()>,
    pub capture: CaptureSink,
}

pub(crate) fn read_unpoisoned<'a, T>(
    lock: &'a RwLock<T>,
    lock_name: &'static str,
) -> RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(lock = lock_name, "rwlock poisoned; continuing with inner state");
            poisoned.into_inner()
        }
    }
}

pub(crate) fn write_unpoisoned<'a, T>(
    lock: &'a RwLock<T>,
    lock_name: &'static str,
) -> RwLockWriteGuard<'a, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(lock = lock_name, "rwlock poisoned; continuing with inner state");
            poisoned.into_inner()
        }
    }
}

fn lock_unpoisoned<'a, T>(lock: &'a Mutex<T>, lock_name: &'static str) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(lock = lock_name, "mutex poisoned; continuing with inner state");
            poisoned.into_inner()
        }
    }
}

impl WebState {
    pub fn new(config: BackuparrConfig, capture: CaptureSink) -> Self {
        Self {
            inner: Arc::new(WebStateInner {
                config,
                jobs: RwLock::new(HashMap::new()),
                job_gate: Mutex::new(()),
                capture,
            }),
        }
    }

    /// Deep-copied view of a job, or `None` for unknown ids.
    pub fn snapshot(&self, id: &str) -> Option<JobSnapshot> {
        read_unpoisoned(&self.inner.jobs, "jobs")
            .get(id)
            .map(BackupJob::snapshot)
    }

    /// Register a job and run it on a background thread. Returns the initial
    /// snapshot.
    pub fn start_job(&self, request: JobRequest) -> JobSnapshot {
        let id = Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_string();
        let job = BackupJob::new(id.clone(), request);
        let snapshot = job.snapshot();

        write_unpoisoned(&self.inner.jobs, "jobs").insert(id.clone(), job);

        let worker = self.clone();
        std::thread::spawn(move || worker.execute_job(id));

        snapshot
    }

    fn append_log(&self, id: &str, line: &str) {
        let stamped = format!("{} {line}", Utc::now().to_rfc3339());
        self.append_raw_log(id, stamped);
    }

    /// Append an already-formatted line (used by the capture layer).
    pub(crate) fn append_raw_log(&self, id: &str, line: String) {
        let mut jobs = write_unpoisoned(&self.inner.jobs, "jobs");
        if let Some(job) = jobs.get_mut(id) {
            if job.running {
                job.logs.push(line);
            }
        }
    }

    fn finish_job(&self, id: &str, success: bool, results: Vec<JobResult>, final_line: &str) {
        let mut jobs = write_unpoisoned(&self.inner.jobs, "jobs");
        if let Some(job) = jobs.get_mut(id) {
            job.logs
                .push(format!("{} {final_line}", Utc::now().to_rfc3339()));
            job.running = false;
            job.success = Some(success);
            job.results = results;
            job.ended_at = Some(Utc::now());
        }
    }

    fn execute_job(&self, id: String) {
        if let Err(e) = preflight_check(&self.inner.config) {
            self.finish_job(&id, false, Vec::new(), &format!("Preflight failed: {e}"));
            return;
        }

        // One job at a time; queued submissions wait here.
        let _gate = lock_unpoisoned(&self.inner.job_gate, "job_gate");

        let sink_state = self.clone();
        let sink_id = id.clone();
        self.inner
            .capture
            .install(Box::new(move |line| sink_state.append_raw_log(&sink_id, line)));

        let target = {
            let jobs = read_unpoisoned(&self.inner.jobs, "jobs");
            jobs.get(&id).and_then(|job| {
                if job.request.all {
                    None
                } else {
                    job.request.app.clone()
                }
            })
        };

        let cancel = CancelToken::new();
        let mut results = Vec::new();

        for app_cfg in &self.inner.config.app_configs {
            let name = app_cfg.effective_name().to_string();
            if let Some(ref target) = target {
                if &name != target {
                    continue;
                }
            }

            self.append_log(&id, &format!("[{name}] starting backup"));

            let outcome = client_from_config(app_cfg).and_then(|client| {
                let backends = backends_from_config(&app_cfg.storage, &cancel)?;
                run_backup(client.as_ref(), &backends, &app_cfg.retention, &cancel)
            });

            match outcome {
                Ok(report) if report.fully_successful() => {
                    self.append_log(&id, &format!("[{name}] backup completed"));
                    results.push(JobResult::ok(&name));
                }
                Ok(report) => {
                    let detail: Vec<String> = report
                        .failed
                        .iter()
                        .map(|(backend, err)| format!("{backend}: {err}"))
                        .collect();
                    let message = format!("partial failure: {}", detail.join("; "));
                    self.append_log(&id, &format!("[{name}] {message}"));
                    results.push(JobResult::failed(&name, message));
                }
                Err(e) => {
                    self.append_log(&id, &format!("[{name}] failed: {e}"));
                    results.push(JobResult::failed(&name, e.to_string()));
                }
            }
        }

        self.inner.capture.clear();

        let success = results.iter().all(|r| r.ok);
        let final_line = if success {
            "Backup job completed successfully"
        } else {
            "Backup job completed with failures"
        };
        self.finish_job(&id, success, results, final_line);
    }
}
