use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tide_cache::wal::Wal;
use tide_config::logging::{init_logging, LogLevel};
use tide_config::{expand_home, log_daemon_error, log_daemon_info, log_daemon_warn, Config};
use tide_content::ContentService;
use tokio::signal;
use tokio_util::sync::CancellationToken;

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "tided")]
#[command(version, about = "Tidepool content daemon", long_about = None)]
struct Cli {
    /// Config file layered over ~/.tidepool/config.toml
    #[arg(short, long, global = true, env = "TIDE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level; RUST_LOG wins when set
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (default)
    Start,
    /// Replay the WAL read-only and list the blocks a start would recover
    Check,
    /// Print the default configuration
    DefaultConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let level = cli
        .log_level
        .unwrap_or_else(|| config.log.level.parse().unwrap_or(LogLevel::Info));
    init_logging(level);

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => start_daemon(config).await?,
        Commands::Check => check_wal(&config)?,
        Commands::DefaultConfig => print!("{}", Config::default_toml()?),
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(Config::global_config_path().as_deref(), Some(path))
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Config::load().context("Failed to load config"),
    }
}

async fn start_daemon(config: Config) -> Result<()> {
    log_daemon_info!(
        wal = %config.cache.wal_path.display(),
        store = ?config.store.backend,
        index = ?config.index.backend,
        "Starting tided"
    );

    let service = ContentService::open(&config).context("Failed to open content service")?;
    let cancel = CancellationToken::new();

    service
        .health_check(&cancel)
        .await
        .context("Block store health check failed")?;

    // Before any traffic: strays from a crash between store write and bind
    match service.reconcile(&cancel).await {
        Ok(report) if !report.missing.is_empty() => log_daemon_warn!(
            missing = report.missing.len(),
            "Index references blocks missing from the store"
        ),
        Ok(_) => {}
        Err(e) => log_daemon_error!(error = %e, "Reconciliation failed"),
    }

    log_daemon_info!("tided ready; Ctrl-C to stop");

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
    stats_tick.tick().await;
    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                res.context("Failed to listen for Ctrl-C")?;
                break;
            }
            _ = stats_tick.tick() => {
                if let Ok(stats) = service.storage_stats(&cancel).await {
                    log_daemon_info!(
                        cache_used = stats.cache.used_bytes,
                        cache_dirty = stats.cache.dirty_bytes,
                        wal_used = stats.cache.wal_used,
                        records = stats.dedup.records,
                        dedup_ratio = stats.dedup_ratio,
                        uploads = stats.offload.uploads,
                        downloads = stats.offload.downloads,
                        "Storage stats"
                    );
                }
            }
        }
    }

    log_daemon_info!("Shutting down");
    cancel.cancel();
    service
        .shutdown(Duration::from_millis(config.offload.shutdown_timeout_ms))
        .await
        .context("Shutdown failed")?;
    Ok(())
}

fn check_wal(config: &Config) -> Result<()> {
    let path = expand_home(&config.cache.wal_path);
    if !path.exists() {
        println!("No WAL at {}", path.display());
        return Ok(());
    }
    let report =
        Wal::inspect(&path).with_context(|| format!("Failed to read WAL {}", path.display()))?;

    println!(
        "WAL {}: {}/{} bytes used, {} records, next lsn {}",
        path.display(),
        report.used,
        report.capacity,
        report.records,
        report.next_lsn
    );
    println!("{} block(s) pending upload", report.pending.len());
    for (payload, block, len, seq) in &report.pending {
        println!("  {payload} block {block}: {len} bytes (seq {seq})");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_to_start() {
        let cli = Cli::try_parse_from(["tided"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli =
            Cli::try_parse_from(["tided", "check", "--config", "t.toml", "--log-level", "debug"])
                .unwrap();
        assert!(matches!(cli.command, Some(Commands::Check)));
        assert_eq!(cli.config, Some(PathBuf::from("t.toml")));
        assert_eq!(cli.log_level, Some(LogLevel::Debug));
    }

    #[test]
    fn test_check_without_wal() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.cache.wal_path = temp.path().join("absent.wal");
        check_wal(&config).unwrap();
    }

    #[test]
    fn test_load_explicit_config() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tided.toml");
        std::fs::write(&path, "[offload]\nworkers = 3\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.worker_count(), 3);
    }
}
