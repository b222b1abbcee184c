use std::sync::Mutex;

use tempfile::NamedTempFile;

use watchpost::config::WatchpostConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "WATCHPOST_CONFIG",
        "WATCHPOST_CAMERA_URL",
        "WATCHPOST_BUZZER_URL",
        "WATCHPOST_API_ADDR",
        "WATCHPOST_IMAGES_DIR",
        "WATCHPOST_MIN_DETECTIONS",
        "WATCHPOST_KNOWN_CONFIDENCE",
        "WATCHPOST_ALERT_COOLDOWN_SECS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = WatchpostConfig::load().expect("load defaults");
    assert_eq!(cfg.camera.url, "http://192.168.1.100/stream");
    assert_eq!(cfg.alert.buzzer_url, "http://192.168.1.101/alert");
    assert_eq!(cfg.detection.person_confidence, 0.75);
    assert_eq!(cfg.detection.min_detections, 5);
    assert_eq!(cfg.detection.known_confidence, 0.92);
    assert_eq!(cfg.detection.frame_skip, 5);
    assert_eq!(cfg.alert.cooldown.as_secs(), 30);
    assert_eq!(cfg.storage.save_cooldown.as_secs(), 3600);
    assert_eq!(cfg.storage.images_dir.to_str(), Some("security_images"));

    let pipeline = cfg.pipeline_config();
    assert_eq!(pipeline.tracker.max_track_distance, 100.0);
    assert_eq!(pipeline.tracker.track_timeout_frames, 30);
    assert_eq!(pipeline.gate.hash_similarity_threshold, 5);
    assert_eq!(cfg.stream_config().reconnect_delay.as_secs(), 5);
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "camera": { "url": "http://10.0.0.5/stream", "target_fps": 12 },
        "detection": { "person_confidence": 0.6, "frame_skip": 2 },
        "storage": { "log_path": "/var/lib/watchpost/log.jsonl" },
        "alert": { "pattern": 3 }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("WATCHPOST_CONFIG", file.path());
    std::env::set_var("WATCHPOST_CAMERA_URL", "stub://porch");
    std::env::set_var("WATCHPOST_MIN_DETECTIONS", "7");
    std::env::set_var("WATCHPOST_ALERT_COOLDOWN_SECS", "90");

    let cfg = WatchpostConfig::load().expect("load config");
    assert_eq!(cfg.camera.url, "stub://porch");
    assert_eq!(cfg.camera.target_fps, 12);
    assert_eq!(cfg.detection.person_confidence, 0.6);
    assert_eq!(cfg.detection.frame_skip, 2);
    assert_eq!(cfg.detection.min_detections, 7);
    assert_eq!(cfg.alert.pattern, 3);
    assert_eq!(cfg.alert.cooldown.as_secs(), 90);
    assert_eq!(
        cfg.storage.log_path.to_str(),
        Some("/var/lib/watchpost/log.jsonl")
    );
    assert_eq!(cfg.pipeline_config().gate.alert_cooldown.num_seconds(), 90);

    clear_env();
}

#[test]
fn loads_toml_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("watchpost.toml");
    std::fs::write(
        &path,
        "[api]\naddr = \"0.0.0.0:9090\"\n\n[storage]\nsave_images = false\n",
    )
    .expect("write toml");
    std::env::set_var("WATCHPOST_CONFIG", &path);

    let cfg = WatchpostConfig::load().expect("load toml");
    assert_eq!(cfg.api.addr, "0.0.0.0:9090");
    assert!(!cfg.storage.save_images);

    clear_env();
}

#[test]
fn rejects_out_of_range_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("WATCHPOST_KNOWN_CONFIDENCE", "1.5");
    assert!(WatchpostConfig::load().is_err());
    std::env::set_var("WATCHPOST_KNOWN_CONFIDENCE", "high");
    assert!(WatchpostConfig::load().is_err());
    clear_env();

    std::env::set_var("WATCHPOST_MIN_DETECTIONS", "0");
    let err = WatchpostConfig::load().expect_err("zero min detections");
    assert!(err.to_string().contains("min_detections"));

    clear_env();
}
