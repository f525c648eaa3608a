//! Wiring & DI. Entry point: bootstrap adapters, inject into services, run once or watch.
//! No business logic here.

use clap::Parser;
use dotenv::dotenv;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tg_ingest::adapters::export::JsonlExportSource;
use tg_ingest::adapters::persistence::CacheStore;
use tg_ingest::adapters::render::MarkdownNoteWriter;
use tg_ingest::adapters::tools::FfmpegTranscoder;
use tg_ingest::ports::{MessageSource, NoteRenderer, TranscoderPort};
use tg_ingest::shared::config::AppConfig;
use tg_ingest::shared::retry::RetryPolicy;
use tg_ingest::shared::zero_copy::ZeroCopyTransfer;
use tg_ingest::usecases::{
    MediaPoolConfig, MediaWorkerPool, PrefetchConfig, SyncConfig, SyncService, WatcherService,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Ingest chat history into notes and media, resuming where the last run stopped.
#[derive(Debug, Parser)]
#[command(name = "tg-ingest", version, about, allow_negative_numbers = true)]
struct Cli {
    /// Entity (chat/channel) ids to ingest
    #[arg(required = true, value_name = "IDS")]
    ids: Vec<i64>,

    /// Skip media download and transcoding
    #[arg(long)]
    no_media: bool,

    /// Fetch from the start of the history (the ledger still skips processed messages)
    #[arg(long)]
    no_resume: bool,

    /// Consumer workers per entity
    #[arg(long, value_name = "N")]
    consumers: Option<usize>,

    /// Media pool size
    #[arg(long, value_name = "N")]
    media_workers: Option<usize>,

    /// Keep running and re-sync every watcher cycle until Ctrl-C
    #[arg(long)]
    watch: bool,

    /// Archive directory (overrides TG_INGEST_EXPORT_DIR)
    #[arg(long, value_name = "DIR")]
    export_dir: Option<PathBuf>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let json = std::env::var("TG_INGEST_LOG_JSON")
        .is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let env_loaded = dotenv();
    init_tracing();

    match &env_loaded {
        Ok(path) => info!(path = %path.display(), "loaded .env"),
        Err(_) => info!(cwd = %cwd.display(), "no .env found (check CWD)"),
    }

    let cli = Cli::parse();
    let cfg = AppConfig::load().map_err(|e| anyhow::anyhow!("config: {}", e))?;
    cfg.validate().map_err(|e| anyhow::anyhow!("{}", e))?;

    let export_dir = cli
        .export_dir
        .clone()
        .unwrap_or_else(|| cfg.export_dir_or_default());
    let notes_dir = cfg.notes_dir_or_default();
    let media_dir = cfg.media_dir_or_default();
    let staging_dir = cfg.staging_dir();
    for dir in [&notes_dir, &media_dir, &staging_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| anyhow::anyhow!("create {}: {}", dir.display(), e))?;
    }
    info!(
        export = %export_dir.display(),
        notes = %notes_dir.display(),
        media = %media_dir.display(),
        "directories ready"
    );

    // --- Ledger ---
    let cache = Arc::new(
        CacheStore::new(cfg.ledger_path_or_default()).with_debounce(cfg.save_debounce()),
    );
    cache.load().await.map_err(|e| anyhow::anyhow!("{}", e))?;

    // --- Adapters ---
    let source: Arc<dyn MessageSource> = Arc::new(JsonlExportSource::new(&export_dir));
    let renderer: Arc<dyn NoteRenderer> = Arc::new(MarkdownNoteWriter::new(&notes_dir));
    let transcoder: Arc<dyn TranscoderPort> = Arc::new(FfmpegTranscoder::new(
        cfg.ffmpeg_path_or_default(),
        cfg.ffprobe_path_or_default(),
    ));

    // --- Shared policies ---
    let retry = Arc::new(RetryPolicy::new());
    let transfer = Arc::new(ZeroCopyTransfer::new(cfg.zero_copy()));

    let media_enabled = cfg.media_enabled_or_default() && !cli.no_media;
    let sync_config = SyncConfig {
        prefetch: PrefetchConfig {
            batch_size: cfg.batch_size_or_default(),
            queue_size: cfg.queue_size_or_default(),
        },
        consumers: cli
            .consumers
            .unwrap_or_else(|| cfg.consumer_workers_or_default()),
        media_enabled,
        resume: cfg.resume_or_default() && !cli.no_resume,
        fetch_retry: cfg.fetch_retry(),
        staging_dir,
        media_dir,
        flush_every: cfg.flush_every_or_default(),
        render_failure_policy: cfg.render_failure_policy_or_default(),
        media_max_attempts: cfg.max_attempts_or_default(),
        ..SyncConfig::default()
    };
    info!(
        consumers = sync_config.consumers,
        batch_size = sync_config.prefetch.batch_size,
        queue_size = sync_config.prefetch.queue_size,
        media_enabled,
        resume = sync_config.resume,
        "pipeline configured"
    );

    let mut service = SyncService::new(
        source,
        renderer,
        Arc::clone(&cache),
        Arc::clone(&retry),
        Arc::clone(&transfer),
        sync_config,
    );
    if media_enabled {
        let pool_config = MediaPoolConfig {
            workers: cli
                .media_workers
                .unwrap_or_else(|| cfg.media_workers_or_default()),
            thresholds: cfg.thresholds(),
            ..MediaPoolConfig::default()
        };
        let pool = MediaWorkerPool::start(
            pool_config,
            transcoder,
            Arc::clone(&transfer),
            Arc::clone(&retry),
        );
        service = service.with_media_pool(Arc::new(pool));
    }
    let service = Arc::new(service);

    // --- Run ---
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    let signal_service = Arc::clone(&service);
    let signal = tokio::spawn(async move {
        tokio::select! {
            _ = on_signal.cancelled() => return,
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!(error = %e, "cannot listen for Ctrl-C");
                    return;
                }
            }
        }
        warn!("Ctrl-C received, finishing messages in hand; the rest is picked up next run");
        signal_service.stop();
        on_signal.cancel();
    });

    let outcome = if cli.watch {
        let watcher = WatcherService::new(
            Arc::clone(&service),
            cli.ids.clone(),
            Duration::from_secs(cfg.watcher_cycle_secs_or_default()),
        );
        watcher.run_loop(cancel.clone()).await.map(|_| None)
    } else {
        service.sync_entities(&cli.ids).await.map(Some)
    };
    cancel.cancel();
    let _ = signal.await;

    if let Err(e) = service.shutdown(cfg.shutdown_grace()).await {
        error!(error = %e, "final ledger flush failed");
    }

    match outcome {
        Ok(Some(report)) => {
            report.log();
            if !report.failed_entities.is_empty() {
                anyhow::bail!("{} entities could not be synced", report.failed_entities.len());
            }
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("{}", e)),
    }
}
