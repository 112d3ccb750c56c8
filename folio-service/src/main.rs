use std::net::SocketAddr;
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use folio_service::captioning::OllamaCaptioner;
use folio_service::config::Settings;
use folio_service::db::{Database, SqliteWorkQueue};
use folio_service::graph::HttpGraphBuilder;
use folio_service::indexing::HttpIndexingSubmitter;
use folio_service::pipeline::{
    JobOrchestrator, OrchestratorSettings, PageProcessor, QueueWorker, UploadConsumer,
};
use folio_service::queue::WorkQueue;
use folio_service::render::{DocumentRenderer, LayoutClient, PdfiumEngine};
use folio_service::retry::BackoffPolicy;
use folio_service::storage::FsObjectStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    info!("Starting Folio ingestion service v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    info!(
        data_dir = %settings.storage.data_dir.display(),
        upload_queue = %settings.upload_queue.name,
        indexing_queue = %settings.indexing_queue.name,
        "Configuration loaded"
    );

    if let Some(addr) = &settings.metrics.listen_addr {
        let addr: SocketAddr = addr.trim().parse()?;
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!(%addr, "Prometheus exporter listening");
    }

    std::fs::create_dir_all(&settings.storage.data_dir)?;

    let db_path = settings.storage.database_path();
    let db = Arc::new(Database::open(&db_path)?);
    info!(path = %db_path.display(), "Database initialized");

    let objects = Arc::new(FsObjectStore::new(settings.storage.objects_dir()));
    let upload_queue: Arc<dyn WorkQueue> = Arc::new(SqliteWorkQueue::new(
        db.clone(),
        settings.upload_queue.name.clone(),
    ));
    let indexing_queue: Arc<dyn WorkQueue> = Arc::new(SqliteWorkQueue::new(
        db.clone(),
        settings.indexing_queue.name.clone(),
    ));
    info!(
        uploads_pending = upload_queue.approximate_len()?,
        jobs_pending = indexing_queue.approximate_len()?,
        "Queues opened"
    );
    let backoff = BackoffPolicy::from(&settings.retry);

    let cancel = CancellationToken::new();
    let mut workers = JoinSet::new();

    if settings.workers.upload_enabled {
        let engine = PdfiumEngine::new(
            settings.rendering.pdfium_library_dir.clone(),
            settings.rendering.dpi,
        );
        engine.check()?;
        let renderer = Arc::new(DocumentRenderer::new(
            engine,
            LayoutClient::new(settings.layout.clone())?,
        ));

        let mut processor = PageProcessor::new(
            objects.clone(),
            renderer,
            backoff,
            settings.storage.scratch_dir(),
        );
        if settings.captioning.model.is_empty() {
            info!("Figure captioning disabled (no model configured)");
        } else {
            info!(model = %settings.captioning.model, "Figure captioning enabled");
            processor =
                processor.with_captioner(Arc::new(OllamaCaptioner::new(settings.captioning.clone())?));
        }

        let worker = QueueWorker::new(
            upload_queue.clone(),
            UploadConsumer::new(processor),
            settings.upload_queue.clone(),
        );
        let token = cancel.clone();
        workers.spawn(async move { worker.run(token).await });
    }

    if settings.workers.indexing_enabled {
        let orchestrator = JobOrchestrator::new(
            db.clone(),
            Arc::new(HttpIndexingSubmitter::new(settings.indexing.clone())?),
            Arc::new(HttpGraphBuilder::new(settings.graph.clone())?),
            indexing_queue.clone(),
            OrchestratorSettings::from_config(
                &settings.indexing,
                &settings.indexing_queue,
                &settings.retry,
            ),
        );

        let worker = QueueWorker::new(
            indexing_queue.clone(),
            orchestrator,
            settings.indexing_queue.clone(),
        );
        let token = cancel.clone();
        workers.spawn(async move { worker.run(token).await });
    }

    if workers.is_empty() {
        warn!("No workers enabled, exiting");
        return Ok(());
    }

    wait_for_shutdown().await;
    info!("Shutdown requested, finishing in-flight messages");
    cancel.cancel();

    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            warn!(error = %e, "Worker task ended abnormally");
        }
    }

    info!("Folio ingestion service stopped");
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(error) => {
                warn!(%error, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = sigterm => {},
    }
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    // Use RUST_LOG if set, otherwise default to info level for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("folio_service=info"));

    // FOLIO_LOG_FORMAT=json for log shippers
    let json = std::env::var("FOLIO_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        let format = fmt::format()
            .with_target(true)
            .with_thread_ids(true)
            .compact();
        registry.with(fmt::layer().event_format(format)).init();
    }
}
