//! watchpostd - watchpost daemon
//!
//! This daemon:
//! 1. Discovers local cameras and registers the configured IP camera
//! 2. Opens the selected camera through the stream multiplexer
//! 3. Runs the detection loop (detector → tracker → verification → gate)
//! 4. Writes gated evidence and sends buzzer alerts for unknown people
//! 5. Serves status, detections and an MJPEG preview over HTTP

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};

use watchpost::alert::{AlertDispatcher, HttpBuzzer, RecordingDispatcher};
use watchpost::api::{ApiConfig, ApiServer, ApiState};
use watchpost::cameras::{default_local_candidates, CameraRegistry};
use watchpost::detect::{DetectorRegistry, NullBackend};
use watchpost::storage::{JsonEvidenceStore, SharedStore};
use watchpost::{
    DetectionPipeline, DetectionService, Statistics, StreamMultiplexer, TrainingCapture,
    WatchpostConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (.toml or JSON). Overrides WATCHPOST_CONFIG.
    #[arg(long)]
    config: Option<PathBuf>,
    /// IP camera URL (http MJPEG/JPEG endpoint or stub://name).
    #[arg(long)]
    camera: Option<String>,
    /// Person detection model (ONNX).
    #[cfg(feature = "backend-tract")]
    #[arg(long)]
    model: Option<PathBuf>,
    /// Face recognition model (ONNX), run on each person crop.
    #[cfg(feature = "backend-tract")]
    #[arg(long)]
    face_model: Option<PathBuf>,
    /// Address for the status/preview API.
    #[arg(long, env = "WATCHPOST_API_ADDR")]
    api_addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => WatchpostConfig::load_from(path)?,
        None => WatchpostConfig::load()?,
    };
    if let Some(url) = &args.camera {
        config.camera.url = url.clone();
    }
    if let Some(addr) = &args.api_addr {
        config.api.addr = addr.clone();
    }
    #[cfg(feature = "backend-tract")]
    {
        if args.model.is_some() {
            config.models.person = args.model.clone();
        }
        if args.face_model.is_some() {
            config.models.face = args.face_model.clone();
        }
    }

    let mux = Arc::new(StreamMultiplexer::new(config.stream_config()));
    let cameras = Arc::new(CameraRegistry::new(mux.clone()));
    cameras.discover_local(&default_local_candidates(config.camera.local_devices))?;
    let ip_camera = match cameras.add_ip_camera(&config.camera.name, &config.camera.url) {
        Ok(descriptor) => {
            log::info!(
                "watchpostd: IP camera {} reachable at {}",
                descriptor.id,
                descriptor.source_locator
            );
            Some(descriptor.id)
        }
        Err(err) => {
            log::warn!("watchpostd: IP camera {} not reachable: {:#}", config.camera.url, err);
            None
        }
    };
    let initial = ip_camera.or_else(|| cameras.list().first().map(|c| c.id.clone()));
    match initial {
        Some(id) => {
            if let Err(err) = cameras.select(&id) {
                log::warn!("watchpostd: could not open camera {}: {:#}", id, err);
            }
        }
        None => log::warn!("watchpostd: no camera available; select one via the API"),
    }

    let detectors = Arc::new(DetectorRegistry::new());
    register_detectors(&detectors, &config)?;

    let store: SharedStore = Arc::new(Mutex::new(JsonEvidenceStore::open(
        &config.storage.images_dir,
        &config.storage.log_path,
    )?));
    let alerts: Arc<dyn AlertDispatcher> = if config.alert.enabled {
        let buzzer = HttpBuzzer::new(&config.alert.buzzer_url, config.alert.timeout)?;
        match buzzer.status() {
            Ok(status) => log::info!("watchpostd: buzzer status {}", status),
            Err(err) => log::warn!("watchpostd: buzzer not answering yet: {:#}", err),
        }
        Arc::new(buzzer)
    } else {
        log::info!("watchpostd: alerts disabled, recording patterns only");
        Arc::new(RecordingDispatcher::new())
    };

    let pipeline = DetectionPipeline::new(
        config.pipeline_config(),
        store,
        alerts.clone(),
        Arc::new(Statistics::new()),
    );
    let service = Arc::new(DetectionService::new(
        mux.clone(),
        detectors,
        Arc::new(Mutex::new(pipeline)),
        alerts,
    )?);
    let capture = Arc::new(TrainingCapture::open(&config.storage.dataset_dir)?);

    let api_handle = ApiServer::new(
        ApiConfig {
            addr: config.api.addr.clone(),
            preview_fps: config.api.preview_fps,
            ..ApiConfig::default()
        },
        ApiState {
            service: service.clone(),
            cameras,
            capture: Some(capture),
        },
    )
    .spawn()?;
    log::info!("watchpostd: api listening on {}", api_handle.addr);

    service.start()?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("watchpostd running; waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");
    service.shutdown()?;
    api_handle.stop()?;
    mux.close();
    Ok(())
}

#[cfg(feature = "backend-tract")]
fn register_detectors(detectors: &DetectorRegistry, config: &WatchpostConfig) -> Result<()> {
    use watchpost::detect::{TwoStageBackend, YoloBackend, YoloRole};

    const INPUT_SIZE: u32 = 640;
    match (&config.models.person, &config.models.face) {
        (Some(person), Some(face)) => {
            let person = YoloBackend::new(person, YoloRole::PersonDetector, INPUT_SIZE)?
                .with_threshold(config.detection.person_confidence);
            let face = YoloBackend::new(face, YoloRole::FaceRecognizer, INPUT_SIZE)?;
            detectors.register(TwoStageBackend::new("person+face", person, face))?;
        }
        (Some(person), None) => {
            detectors.register(
                YoloBackend::new(person, YoloRole::PersonDetector, INPUT_SIZE)?
                    .with_threshold(config.detection.person_confidence),
            )?;
        }
        (None, _) => {
            log::warn!("watchpostd: no detection model configured; detector is inactive");
            detectors.register(NullBackend)?;
        }
    }
    Ok(())
}

#[cfg(not(feature = "backend-tract"))]
fn register_detectors(detectors: &DetectorRegistry, config: &WatchpostConfig) -> Result<()> {
    if config.models.person.is_some() {
        log::warn!("watchpostd: model configured but built without backend-tract; ignoring");
    }
    log::warn!("watchpostd: no detection backend compiled in; detector is inactive");
    detectors.register(NullBackend)
}
