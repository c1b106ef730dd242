mod signal;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL_CONDENSED, Table};

use backuparr_core::cancel::CancelToken;
use backuparr_core::client::client_from_config;
use backuparr_core::config::{
    self, find_app, find_backend_config, preflight_check, BackuparrConfig,
};
use backuparr_core::orchestrator::{run_backup, run_restore};
use backuparr_core::storage::backends_from_config;

#[derive(Parser)]
#[command(name = "backuparr", version, about = "Backup orchestrator for self-hosted media apps",
    after_help = "\
Configuration file lookup order:
  1. --config <path>             (explicit flag)
  2. $BACKUPARR_CONFIG           (environment variable)
  3. /config/config.yml          (container default)
  4. ./config.yml                (local fallback)

Examples:
  backuparr backup
  backuparr list --app sonarr --backend local
  backuparr restore --app sonarr --backend s3 --latest
  backuparr restore --app sonarr --backend local --backup \"backups/sonarr/sonarr_2026-02-06T120000Z.zip\"
  backuparr web --listen :8080")]
struct Cli {
    /// Path to configuration file (overrides BACKUPARR_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run backups for all configured apps
    Backup,

    /// Restore an app from a storage backend
    Restore {
        /// App to restore (e.g. sonarr, radarr, prowlarr, truenas)
        #[arg(long)]
        app: String,

        /// Storage backend name (defaults to type, e.g. local, s3)
        #[arg(long)]
        backend: String,

        /// Specific backup key to restore
        #[arg(long)]
        backup: Option<String>,

        /// Restore the most recent backup
        #[arg(long)]
        latest: bool,
    },

    /// List available backups from a storage backend
    List {
        /// App to list backups for
        #[arg(long)]
        app: String,

        /// Storage backend name
        #[arg(long)]
        backend: String,
    },

    /// Serve the web UI
    Web {
        /// HTTP listen address
        #[arg(long, default_value = ":8080")]
        listen: String,
    },
}

fn main() {
    let cli = Cli::parse();

    // The web server installs its own subscriber stack (it needs the job
    // capture layer); everything else gets plain fmt output here.
    if !matches!(cli.command, Commands::Web { .. }) {
        let filter = match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    let config_path: PathBuf = cli
        .config
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(config::config_path);

    let cfg = match config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    tracing::debug!("using config: {}", config_path.display());

    let cancel = CancelToken::new();
    signal::install(cancel.clone());

    let result = match cli.command {
        Commands::Backup => cmd_backup(&cfg, &cancel),
        Commands::Restore {
            app,
            backend,
            backup,
            latest,
        } => cmd_restore(&cfg, &cancel, &app, &backend, backup.as_deref(), latest),
        Commands::List { app, backend } => cmd_list(&cfg, &cancel, &app, &backend),
        Commands::Web { listen } => {
            let addr = normalize_listen(&listen);
            backuparr_web::serve(cfg, &addr).map_err(|e| e.to_string())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn cmd_backup(cfg: &BackuparrConfig, cancel: &CancelToken) -> Result<(), String> {
    preflight_check(cfg).map_err(|e| format!("preflight check failed: {e}"))?;

    let mut had_error = false;
    for app_cfg in &cfg.app_configs {
        let name = app_cfg.effective_name();

        let outcome = client_from_config(app_cfg).and_then(|client| {
            let backends = backends_from_config(&app_cfg.storage, cancel)?;
            run_backup(client.as_ref(), &backends, &app_cfg.retention, cancel)
        });

        match outcome {
            Ok(report) if report.fully_successful() => {}
            Ok(report) => {
                for (backend, err) in &report.failed {
                    tracing::warn!("[{name}] backend {backend} failed: {err}");
                }
            }
            Err(e) => {
                tracing::error!("[{name}] backup failed: {e}");
                had_error = true;
            }
        }
    }

    if had_error {
        Err("one or more backups failed".into())
    } else {
        Ok(())
    }
}

fn cmd_restore(
    cfg: &BackuparrConfig,
    cancel: &CancelToken,
    app: &str,
    backend: &str,
    backup_key: Option<&str>,
    latest: bool,
) -> Result<(), String> {
    if backup_key.is_none() && !latest {
        return Err("either --backup <key> or --latest is required".into());
    }

    preflight_check(cfg).map_err(|e| format!("preflight check failed: {e}"))?;

    let app_cfg = find_app(cfg, app).map_err(|e| e.to_string())?;
    let client = client_from_config(app_cfg).map_err(|e| e.to_string())?;
    let backend_cfg = find_backend_config(app_cfg, backend).map_err(|e| e.to_string())?;
    let backends = backends_from_config(std::slice::from_ref(backend_cfg), cancel)
        .map_err(|e| e.to_string())?;

    run_restore(client.as_ref(), backends[0].as_ref(), backup_key, cancel)
        .map_err(|e| e.to_string())?;
    Ok(())
}

fn cmd_list(
    cfg: &BackuparrConfig,
    cancel: &CancelToken,
    app: &str,
    backend: &str,
) -> Result<(), String> {
    let app_cfg = find_app(cfg, app).map_err(|e| e.to_string())?;
    let backend_cfg = find_backend_config(app_cfg, backend).map_err(|e| e.to_string())?;
    let backends = backends_from_config(std::slice::from_ref(backend_cfg), cancel)
        .map_err(|e| e.to_string())?;

    let backups = backends[0]
        .list(app_cfg.effective_name())
        .map_err(|e| e.to_string())?;

    if backups.is_empty() {
        println!("No backups found for {app} on {backend}");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec!["Key", "Filename", "Size", "Created"]);
    for b in &backups {
        table.add_row(vec![
            b.key.clone(),
            b.file_name.clone(),
            format_bytes(b.size),
            b.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]);
    }
    println!("{table}");
    Ok(())
}

/// Accept Go-style `:8080` listen addresses alongside full `host:port`.
fn normalize_listen(listen: &str) -> String {
    if listen.starts_with(':') {
        format!("0.0.0.0{listen}")
    } else {
        listen.to_string()
    }
}

fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_addresses_normalize() {
        assert_eq!(normalize_listen(":8080"), "0.0.0.0:8080");
        assert_eq!(normalize_listen("127.0.0.1:9000"), "127.0.0.1:9000");
    }

    #[test]
    fn bytes_format_human_readable() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GiB");
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["backuparr", "backup"]).unwrap();
        assert!(matches!(cli.command, Commands::Backup));

        let cli = Cli::try_parse_from([
            "backuparr", "restore", "--app", "sonarr", "--backend", "s3", "--latest",
        ])
        .unwrap();
        match cli.command {
            Commands::Restore {
                app,
                backend,
                backup,
                latest,
            } => {
                assert_eq!(app, "sonarr");
                assert_eq!(backend, "s3");
                assert!(backup.is_none());
                assert!(latest);
            }
            _ => panic!("expected restore"),
        }

        let cli = Cli::try_parse_from(["backuparr", "web", "--listen", ":9090"]).unwrap();
        match cli.command {
            Commands::Web { listen } => assert_eq!(listen, ":9090"),
            _ => panic!("expected web"),
        }
    }

    #[test]
    fn restore_requires_key_or_latest() {
        let cfg = BackuparrConfig::default();
        let err = cmd_restore(&cfg, &CancelToken::new(), "sonarr", "local", None, false)
            .unwrap_err();
        assert!(err.contains("--backup"));
    }
}
