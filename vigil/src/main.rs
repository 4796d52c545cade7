use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vigil::alerts::AlertEngine;
use vigil::capture::{CaptureFallback, CaptureStrategies, FaststartFinalizer, FfmpegSegmentCapture};
use vigil::config::AppConfig;
use vigil::database::{self, DbPool};
use vigil::database::repositories::{SqlxAlertRepository, SqlxIndexRepository};
use vigil::pipeline::{ChunkPipeline, PipelineServices};
use vigil::services::{
    OpenAiVisionAnalyzer, RcloneObjectStore, SqliteVectorIndex, VectorIndex,
};
use vigil::session::{RecordingSession, SessionEvent, SessionState, StartRequest};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "vigil", version, about = "Continuous stream capture with chunk analysis")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record a source until interrupted.
    Record {
        /// Stream URI (rtsp://, rtmp://, http://, or a y4m file/tcp source).
        source_uri: String,
        /// Seconds of stream per chunk.
        #[arg(long)]
        chunk_duration: Option<u64>,
        /// Directory chunks are written to.
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Delete local recordings and clear the local analysis index.
    Purge,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_env().context("loading configuration")?;
    let (logging, _guard) = vigil::logging::init_logging(&config.log_dir)?;

    let shutdown = CancellationToken::new();
    let retention = logging.start_retention_cleanup(shutdown.clone());

    let pool = open_database(&config).await?;
    let result = match cli.command {
        Command::Record {
            source_uri,
            chunk_duration,
            output_dir,
        } => {
            let mut request = StartRequest::new(source_uri);
            if let Some(secs) = chunk_duration {
                request = request.with_chunk_duration(Duration::from_secs(secs));
            }
            if let Some(dir) = output_dir {
                request = request.with_output_dir(dir);
            }
            record(&config, pool.clone(), request).await
        }
        Command::Purge => purge(&config, pool.clone()).await,
    };

    shutdown.cancel();
    if let Err(e) = retention.await {
        warn!("Log retention task failed: {}", e);
    }
    pool.close().await;
    result
}

async fn open_database(config: &AppConfig) -> anyhow::Result<DbPool> {
    let pool = database::init_pool(&config.database_url)
        .await
        .with_context(|| format!("opening database {}", config.database_url))?;
    database::run_migrations(&pool).await?;
    Ok(pool)
}

async fn record(config: &AppConfig, pool: DbPool, request: StartRequest) -> anyhow::Result<()> {
    let alerts = AlertEngine::new(Arc::new(SqlxAlertRepository::new(pool.clone())))
        .with_history_cap(config.alert_history_cap);
    let services = PipelineServices {
        object_store: Arc::new(RcloneObjectStore::new(config.rclone_settings()?)),
        analyzer: Arc::new(OpenAiVisionAnalyzer::new(config.vision_settings()?)?),
        index: Arc::new(SqliteVectorIndex::new(Arc::new(SqlxIndexRepository::new(pool)))),
        alerts,
    };
    let pipeline = ChunkPipeline::new(config.pipeline.clone(), services);
    let (chunk_tx, chunk_rx) = mpsc::channel(config.pipeline.channel_capacity);
    let dispatcher = pipeline.spawn_dispatcher(chunk_rx);

    let strategies = CaptureStrategies::new(
        Arc::new(FfmpegSegmentCapture::new(config.ffmpeg_settings())),
        Some(Arc::new(CaptureFallback::standard(config.fallback.clone()))),
    );
    let finalizer = Arc::new(FaststartFinalizer::new(&config.ffmpeg_path, config.finalize_timeout));
    let session = RecordingSession::new(strategies, finalizer, chunk_tx, config.session_config());

    let mut events = session.subscribe();
    session.start(request).await?;
    info!("Recording; press Ctrl-C to stop");

    let failure = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "Cannot listen for Ctrl-C, stopping");
                }
                break None;
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Failed { reason }) => break Some(reason),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break None,
            }
        }
    };

    if session.state() == SessionState::Active {
        session.stop().await?;
    }
    // Dropping the session closes the chunk channel once it is drained.
    drop(session);

    info!(
        timeout_secs = config.drain_timeout.as_secs(),
        "Waiting for in-flight chunks"
    );
    if tokio::time::timeout(config.drain_timeout, dispatcher).await.is_err()
        || !pipeline.wait_idle(config.drain_timeout).await
    {
        warn!("In-flight chunks did not finish in time");
    }

    let stats = pipeline.stats();
    info!(
        completed = stats.completed,
        failed = stats.failed(),
        alerts = stats.alerts_triggered,
        "Pipeline finished"
    );

    match failure {
        Some(reason) => {
            error!(reason = %reason, "Recording stopped unexpectedly");
            Err(anyhow::anyhow!("recording stopped unexpectedly: {reason}"))
        }
        None => Ok(()),
    }
}

async fn purge(config: &AppConfig, pool: DbPool) -> anyhow::Result<()> {
    let files = vigil::recordings::purge_recordings(&config.recordings_dir).await?;
    let index = SqliteVectorIndex::new(Arc::new(SqlxIndexRepository::new(pool)));
    let documents = index.clear().await?;
    info!(files, documents, "Purged recordings and analysis index");
    Ok(())
}
