pub mod capture;
pub mod handlers;
pub mod job;
pub mod state;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use backuparr_core::config::BackuparrConfig;
use backuparr_core::error::{BackuparrError, Result};

use crate::capture::{CaptureSink, JobLogLayer};
use crate::state::WebState;

/// Run the web UI: installs the job-capture logging stack, builds the tokio
/// runtime, and serves until the process exits.
pub fn serve(config: BackuparrConfig, listen: &str) -> Result<()> {
    let capture = CaptureSink::new();

    // Normal fmt output plus the per-job capture layer. A pre-installed
    // global subscriber (e.g. in tests) keeps capture out; jobs still run.
    if tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(JobLogLayer::new(capture.clone()))
        .try_init()
        .is_err()
    {
        tracing::debug!("global subscriber already set; job log capture inherits it");
    }

    let state = WebState::new(config, capture);
    let listen = listen.to_string();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| BackuparrError::Config(format!("cannot build async runtime: {e}")))?;

    runtime.block_on(async move {
        let app = handlers::router(state);
        let listener = tokio::net::TcpListener::bind(&listen)
            .await
            .map_err(|e| BackuparrError::Config(format!("cannot bind to {listen}: {e}")))?;

        tracing::info!("backuparr web UI listening on {listen}");
        axum::serve(listener, app)
            .await
            .map_err(|e| BackuparrError::Config(format!("web server failed: {e}")))
    })
}
