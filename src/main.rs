//! Camera Age Estimation Service
//!
//! Brings up the offline cache worker and its local intercept endpoint,
//! then runs the camera session with live face detection and age
//! estimation until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use agecam::assets::AssetChecker;
use agecam::cache::{
    create_intercept_router, CacheWorker, FsCacheStore, HttpFetcher, InterceptState, WorkerFetcher,
};
use agecam::camera::{CameraSession, NokhwaBackend};
use agecam::config::Config;
use agecam::engine::{EngineLoader, LoadStatus, OpenVinoEngineFactory};
use agecam::service::{ServiceStatus, Supervisor};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    info!("Starting Camera Age Estimation Service v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load(Config::default_path()).unwrap_or_else(|e| {
        info!("Using default config ({})", e);
        Config::default()
    });

    info!("Configuration loaded:");
    info!("  Intercept port: {}", config.server.intercept_port);
    info!("  Origin: {}", config.server.origin);
    info!("  Model dir: {}", config.engine.local_model_dir.display());
    info!("  Backends: {:?}", config.engine.backends);
    info!("  Cache generation: {}", config.cache.version);

    // Bring up the offline cache worker before anything fetches
    let store = Arc::new(FsCacheStore::new(&config.cache.dir)?);
    let fetcher = Arc::new(HttpFetcher::new(Duration::from_secs(30))?);
    let worker = Arc::new(CacheWorker::new(store, fetcher, &config.cache));
    if let Err(err) = worker.start().await {
        // An incomplete install must not activate: activation evicts the
        // previous generation, which is the only complete one left. The
        // next launch with network access finishes the upgrade.
        warn!("cache install failed ({err:#}); intercept endpoint stays inactive");
    }

    // Local intercept endpoint
    let intercept_state = Arc::new(InterceptState {
        worker: worker.clone(),
    });
    let router = create_intercept_router(intercept_state);
    let intercept_port = config.server.intercept_port;
    tokio::spawn(async move {
        let addr = format!("127.0.0.1:{}", intercept_port);
        info!("Intercept endpoint listening on http://{}", addr);

        let listener = TcpListener::bind(&addr).await.unwrap();
        axum::serve(listener, router).await.unwrap();
    });

    // Engine bring-up chain. Asset probes go through the cache worker,
    // so a previously cached model still passes the check offline.
    let assets = AssetChecker::new(
        &config.engine,
        &config.assets,
        Arc::new(WorkerFetcher::new(worker.clone())),
    );
    let factory = Arc::new(OpenVinoEngineFactory::new()?);
    let loader = EngineLoader::new(factory, config.engine.clone())
        .with_remote_staging(worker.clone(), config.cache.dir.join("models-staging"));

    // Camera session
    let camera = Arc::new(CameraSession::new(
        Arc::new(NokhwaBackend::new()),
        &config.camera,
        &config.server.origin,
    ));

    let supervisor = Arc::new(Supervisor::new(assets, loader, camera, &config.detect));

    // Log engine bring-up progress
    let mut engine_status = supervisor.engine_status();
    tokio::spawn(async move {
        while engine_status.changed().await.is_ok() {
            match engine_status.borrow().clone() {
                LoadStatus::Trying { candidate, attempt, total } => {
                    info!("Trying engine candidate {candidate} ({attempt}/{total})")
                }
                LoadStatus::Ready { candidate } => info!("Engine ready: {candidate}"),
                LoadStatus::Failed => warn!("All engine candidates failed"),
                LoadStatus::Idle => {}
            }
        }
    });

    // Log service state transitions
    let mut status = supervisor.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            match status.borrow().clone() {
                ServiceStatus::Running { width, height } => {
                    info!("Session running at {width}x{height}")
                }
                ServiceStatus::Error { message, retryable } => {
                    warn!("Session error (retryable: {retryable}): {message}")
                }
                other => info!("Session state: {other:?}"),
            }
        }
    });

    match supervisor.start(None).await {
        Ok(session) => {
            let mut results = session.results.clone();
            let mut fps = session.fps.clone();
            let mut errors = session.errors.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        changed = results.changed() => {
                            if changed.is_err() { break; }
                            if let Some(result) = results.borrow_and_update().clone() {
                                if let Some(face) = result.face {
                                    info!(
                                        "face at {:.0},{:.0} {:.0}x{:.0} conf {:.2} age {:?}",
                                        face.bounds[0], face.bounds[1],
                                        face.bounds[2], face.bounds[3],
                                        face.confidence, face.age
                                    );
                                }
                            }
                        }
                        changed = fps.changed() => {
                            if changed.is_err() { break; }
                            info!("inference rate: {:.1}/s", *fps.borrow_and_update());
                        }
                        changed = errors.changed() => {
                            if changed.is_err() { break; }
                            if let Some(message) = errors.borrow_and_update().clone() {
                                warn!("{message}");
                            }
                        }
                    }
                }
            });
        }
        Err(err) => warn!("Session did not start: {}", err.user_message()),
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, cleaning up...");

    supervisor.stop().await;

    info!("Goodbye!");
    Ok(())
}
