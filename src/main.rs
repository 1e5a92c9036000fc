use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use casitas_sync::backend::SupabaseClient;
use casitas_sync::cache::{CacheBucket, CacheLayer};
use casitas_sync::config::{self, Config};
use casitas_sync::connection::{ConnectionMonitor, ConnectionState};
use casitas_sync::db::{self, Pool};
use casitas_sync::dispatcher::{DispatchOutcome, Dispatcher};
use casitas_sync::maintenance;
use casitas_sync::model::{AttachedFile, EntryStatus, FormType};
use casitas_sync::notify::LogNotifier;
use casitas_sync::processor::{self, QueueProcessor};

#[derive(Debug, Parser)]
#[command(author, version, about = "Offline-first submission queue for casita inspections")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormArg {
    Revision,
    Note,
}

impl From<FormArg> for FormType {
    fn from(value: FormArg) -> Self {
        match value {
            FormArg::Revision => FormType::Revision,
            FormArg::Note => FormType::Note,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    Pending,
    Uploading,
    Completed,
    Error,
}

impl From<StatusArg> for EntryStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Pending => EntryStatus::Pending,
            StatusArg::Uploading => EntryStatus::Uploading,
            StatusArg::Completed => EntryStatus::Completed,
            StatusArg::Error => EntryStatus::Error,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Monitor connectivity, replay the offline queue and run maintenance
    Run,
    /// Submit a form, queueing it locally when the backend is unreachable
    Submit {
        #[arg(long, value_enum)]
        form: FormArg,
        /// JSON file with the form payload
        #[arg(long)]
        payload: PathBuf,
        /// Attachment as FIELD=PATH (repeatable)
        #[arg(long = "file", value_parser = parse_file_arg)]
        files: Vec<(String, PathBuf)>,
    },
    /// List queued entries
    List {
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
    },
    /// Move failed entries back to pending
    Retry {
        /// Entry id to retry
        id: Option<Uuid>,
        /// Retry every failed entry
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },
    /// Remove completed entries past the retention window
    Cleanup,
    /// Show cache bucket usage
    CacheStats,
    /// Drop the data cache (or everything with --all)
    PurgeCache {
        #[arg(long)]
        all: bool,
    },
    /// Read a table through the cache
    Fetch {
        table: String,
        #[arg(long, default_value = "")]
        query: String,
        /// Store in the permanent structure bucket instead of the data bucket
        #[arg(long)]
        structure: bool,
    },
}

fn parse_file_arg(raw: &str) -> Result<(String, PathBuf), String> {
    match raw.split_once('=') {
        Some((field, path)) if !field.is_empty() && !path.is_empty() => {
            Ok((field.to_string(), PathBuf::from(path)))
        }
        _ => Err(format!("expected FIELD=PATH, got {}", raw)),
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|s| s.to_ascii_lowercase())
    {
        Some(ext) if ext == "jpg" || ext == "jpeg" => "image/jpeg",
        Some(ext) if ext == "png" => "image/png",
        Some(ext) if ext == "webp" => "image/webp",
        Some(ext) if ext == "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

async fn read_attachment(field: String, path: &Path) -> Result<AttachedFile> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read attachment {}", path.display()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("invalid file name {}", path.display()))?
        .to_string();
    Ok(AttachedFile {
        field,
        file_name,
        content_type: content_type_for(path).to_string(),
        bytes,
    })
}

async fn open_pool(cfg: &Config) -> Result<Pool> {
    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    Ok(pool)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;
    let pool = open_pool(&cfg).await?;

    match args.command {
        Command::Run => run_daemon(&cfg, &pool).await,
        Command::Submit {
            form,
            payload,
            files,
        } => {
            let raw = tokio::fs::read_to_string(&payload)
                .await
                .with_context(|| format!("failed to read payload {}", payload.display()))?;
            let payload: serde_json::Value =
                serde_json::from_str(&raw).context("payload is not valid JSON")?;
            let mut attachments = Vec::with_capacity(files.len());
            for (field, path) in files {
                attachments.push(read_attachment(field, &path).await?);
            }

            let backend = SupabaseClient::from_config(&cfg)?;
            let monitor = ConnectionMonitor::new(ConnectionState::Offline);
            monitor.probe(&backend).await;
            let dispatcher = Dispatcher {
                pool: &pool,
                backend: &backend,
                monitor: &monitor,
                notifier: &LogNotifier,
                images: &cfg.images,
            };
            match dispatcher.submit(form.into(), payload, attachments).await? {
                DispatchOutcome::Submitted(remote_id) => println!("submitted {}", remote_id),
                DispatchOutcome::QueuedOffline(id) => println!("queued {}", id),
            }
            Ok(())
        }
        Command::List { status } => {
            for e in db::list_entries(&pool, status.map(Into::into)).await? {
                println!(
                    "{}\t{}\t{}\t{}\tretries={}\tfiles={}\t{}",
                    e.id,
                    e.form_type,
                    e.status,
                    e.timestamp.to_rfc3339(),
                    e.retry_count,
                    e.file_count,
                    e.last_error.unwrap_or_default()
                );
            }
            let counts = db::count_by_status(&pool).await?;
            println!(
                "pending={} uploading={} completed={} error={}",
                counts.pending, counts.uploading, counts.completed, counts.error
            );
            Ok(())
        }
        Command::Retry { id, all } => {
            if all {
                let n = processor::retry_all_failed(&pool).await?;
                println!("re-queued {} entries", n);
            } else {
                let id = id.ok_or_else(|| anyhow!("pass an entry id or --all"))?;
                processor::retry_entry(&pool, id).await?;
                println!("re-queued {}", id);
            }
            Ok(())
        }
        Command::Cleanup => {
            let n = maintenance::cleanup_completed(&pool, cfg.app.retention()).await?;
            println!("removed {} completed entries", n);
            Ok(())
        }
        Command::CacheStats => {
            let stats = CacheLayer::new(&pool).stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Command::PurgeCache { all } => {
            let cache = CacheLayer::new(&pool);
            let n = if all {
                cache.clear_all().await?
            } else {
                cache.purge_data().await?
            };
            println!("removed {} cached responses", n);
            Ok(())
        }
        Command::Fetch {
            table,
            query,
            structure,
        } => {
            let backend = SupabaseClient::from_config(&cfg)?;
            let bucket = if structure {
                CacheBucket::Structure
            } else {
                CacheBucket::Data
            };
            let body = CacheLayer::new(&pool)
                .get_or_fetch(bucket, &backend, &table, &query)
                .await?;
            println!("{}", body);
            Ok(())
        }
    }
}

async fn run_daemon(cfg: &Config, pool: &Pool) -> Result<()> {
    let interrupted = db::fail_interrupted_uploads(pool).await?;
    if interrupted > 0 {
        warn!(interrupted, "entries were left uploading by a previous run");
    }

    let backend = SupabaseClient::from_config(cfg)?;
    let monitor = ConnectionMonitor::new(ConnectionState::Offline);
    monitor.probe(&backend).await;
    let cache = CacheLayer::new(pool);
    let processor = QueueProcessor {
        pool,
        backend: &backend,
        notifier: &LogNotifier,
        replay_timeout: cfg.app.replay_timeout(),
    };

    info!(online = monitor.is_online(), "starting offline queue daemon");
    tokio::select! {
        _ = monitor.run_probe_loop(&backend, cfg.app.probe_interval()) => {}
        res = processor.run(
            &monitor,
            &cache,
            cfg.app.retry_failed_on_reconnect,
            cfg.app.poll_interval(),
        ) => res?,
        _ = maintenance::run(
            pool,
            &cache,
            cfg.app.retention(),
            cfg.app.cleanup_interval(),
            cfg.app.data_cache_purge_interval(),
        ) => {}
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
