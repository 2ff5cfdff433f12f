//! facewatchd - camera ingest daemon
//!
//! This daemon:
//! 1. Connects to the configured camera source (RTSP, RTMP, HTTP MJPEG or stub)
//! 2. Runs the capture loop with reconnection on a dedicated worker
//! 3. Gates frames on motion and runs face matching on a recognition worker
//! 4. Publishes detection events to MQTT (or the log when no broker is set)
//! 5. Serves status, snapshots and the live viewer stream over HTTP

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use facewatch::{
    api::{ApiConfig, ApiContext, ApiServer},
    config::FacewatchConfig,
    recognize::{default_extractor_factory, select_extractor},
    ConnectionManager, DetectionPipeline, DirectoryIdentityStore, EventPublisher,
    FrameDistributor, IdentityStore, LogPublisher, MotionGate, MqttPublisher, NetworkConnector,
    RecognitionMatcher, SharedState, StreamEncoder,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Camera ingest with motion-gated face matching and MQTT detection events"
)]
struct Args {
    /// JSON or TOML configuration file.
    #[arg(long, env = "FACEWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Source descriptor (overrides the configured source.url).
    #[arg(long)]
    source: Option<String>,

    /// Control API address (overrides api.addr).
    #[arg(long)]
    api_addr: Option<String>,

    /// Start the API only; connect later with POST /connect.
    #[arg(long)]
    no_connect: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut cfg = FacewatchConfig::load_from(args.config.as_deref())?;
    if let Some(source) = args.source {
        cfg.source.url = source;
    }
    if let Some(addr) = args.api_addr {
        cfg.api_addr = addr;
    }

    let default_filter = cfg.log_level.clone().unwrap_or_else(|| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
    log::info!("facewatchd {} starting", env!("CARGO_PKG_VERSION"));

    // Recognition: identities on disk, extractor chosen by accelerator order.
    let identities: Arc<dyn IdentityStore> = Arc::new(DirectoryIdentityStore::new(
        &cfg.recognition.known_faces_dir,
        cfg.recognition.embedding_dim,
    ));
    match identities.known_people() {
        Ok(people) => log::info!("{} enrolled identities", people.len()),
        Err(err) => log::warn!("identity store unavailable: {:#}", err),
    }
    let selection = select_extractor(
        &cfg.recognition.accelerators,
        default_extractor_factory(
            cfg.recognition.model_path.clone(),
            cfg.recognition.embedding_dim,
        ),
    );
    let matcher = Arc::new(RecognitionMatcher::new(
        selection.extractor,
        identities.clone(),
        cfg.recognition.similarity_threshold,
    ));

    let mqtt = match &cfg.mqtt {
        Some(settings) => Some(Arc::new(MqttPublisher::connect(settings)?)),
        None => None,
    };
    let publisher: Arc<dyn EventPublisher> = match &mqtt {
        Some(mqtt) => mqtt.clone(),
        None => {
            log::warn!("no MQTT broker configured; detection events go to the log");
            Arc::new(LogPublisher::default())
        }
    };

    // Capture side.
    let state = SharedState::new(cfg.history_capacity);
    let distributor = FrameDistributor::new(cfg.distributor_capacity);
    let manager = Arc::new(ConnectionManager::new(
        Arc::new(NetworkConnector),
        cfg.source.options.clone(),
        cfg.capture.clone(),
        state.clone(),
        distributor.clone(),
    ));
    let pipeline = Arc::new(DetectionPipeline::new(
        MotionGate::new(cfg.motion.gate.clone()),
        matcher,
        publisher,
        state,
        cfg.pipeline_config(),
    )?);
    manager.set_processor(pipeline.clone());

    let api_handle = ApiServer::new(
        ApiConfig {
            addr: cfg.api_addr.clone(),
            ..ApiConfig::default()
        },
        ApiContext {
            manager: manager.clone(),
            pipeline: Some(pipeline.clone()),
            identities: Some(identities),
            encoder: StreamEncoder::new(cfg.stream.clone()),
        },
    )
    .spawn()?;

    if args.no_connect {
        log::info!("waiting for POST /connect");
    } else {
        match manager.connect_with_retry(&cfg.source.url, cfg.capture.connect_attempts) {
            Ok(()) => manager.start()?,
            Err(err) => log::error!(
                "initial connect failed: {}; use POST /connect to retry",
                err
            ),
        }
    }

    let (tx, rx) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("facewatchd running; Ctrl-C to stop");
    let _ = rx.recv();
    log::info!("shutdown signal received");

    if !manager.stop() {
        log::warn!("capture worker did not stop in time");
    }
    distributor.close();
    pipeline.shutdown();
    api_handle.stop()?;
    if let Some(mqtt) = mqtt {
        mqtt.shutdown()?;
    }
    log::info!("facewatchd stopped");
    Ok(())
}
