//! flynn-backup - Main entry point
//!
//! Writes a backup of the cluster to a file or to stdout.

use anyhow::{bail, Context, Result};
use clap::Parser;
use controller_client::ControllerClient;
use flynn_backup::{config::Config, shutdown, utils, BackupAssembler, BackupOptions, BackupReport, ControlPlane};
use std::path::{Path, PathBuf};
use tokio::io::BufWriter;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Archive destination; stdout when omitted or "-"
    #[arg(short, long, value_name = "PATH")]
    file: Option<PathBuf>,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Controller URL (overrides config)
    #[arg(long, env = "FLYNN_CONTROLLER_URL")]
    controller_url: Option<String>,

    /// Controller auth key (overrides config)
    #[arg(long, env = "FLYNN_CONTROLLER_KEY", hide_env_values = true)]
    controller_key: Option<String>,

    /// Give up after this many seconds (overrides config)
    #[arg(short, long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)
            .with_context(|| format!("failed to load config {}", config_path.display()))?
    } else {
        Config::default()
    };
    if let Some(url) = args.controller_url {
        config.controller.url = url;
    }
    if let Some(key) = args.controller_key {
        config.controller.key = key;
    }
    if let Some(secs) = args.timeout {
        config.backup.timeout_secs = Some(secs);
    }

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    if config.controller.key.is_empty() {
        bail!("no controller key configured (set FLYNN_CONTROLLER_KEY or [controller] key)");
    }

    tracing::info!(
        "Starting flynn-backup v{} (controller: {})",
        env!("CARGO_PKG_VERSION"),
        config.controller.url
    );

    let client = ControllerClient::new(config.controller.url.clone(), config.controller.key.clone())?;
    let options = BackupOptions {
        spool: config.spool_options(),
        ..BackupOptions::default()
    };

    let cancel = CancellationToken::new();
    let watcher = shutdown::spawn_watcher(cancel.clone(), config.timeout());
    let assembler = BackupAssembler::with_cancel(&client, options, cancel.clone());

    let result = match args.file.as_deref() {
        Some(path) if path != Path::new("-") => write_to_file(&assembler, path).await,
        _ => assembler.run(tokio::io::stdout()).await.map_err(Into::into),
    };

    // Stop the watcher
    cancel.cancel();
    let _ = watcher.await;

    let report = result?;
    for entry in &report.entries {
        tracing::info!("  {}/{} ({} bytes)", report.archive_name, entry.name, entry.bytes);
    }
    Ok(())
}

/// Write the archive next to `path` and move it into place only once complete.
async fn write_to_file<C: ControlPlane>(assembler: &BackupAssembler<'_, C>, path: &Path) -> Result<BackupReport> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let file = tokio::fs::File::create(&tmp)
        .await
        .with_context(|| format!("failed to create {}", tmp.display()))?;
    let mut writer = BufWriter::new(file);

    let result = async {
        let report = assembler.run(&mut writer).await?;
        writer.get_ref().sync_all().await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok::<_, anyhow::Error>(report)
    }
    .await;

    if result.is_err() {
        if let Err(e) = tokio::fs::remove_file(&tmp).await {
            tracing::warn!("Failed to remove {}: {}", tmp.display(), e);
        }
    } else {
        tracing::info!("Wrote backup to {}", path.display());
    }
    result
}
