//! Camera registry.
//!
//! Keeps the known camera descriptors keyed by id and routes selection through the
//! stream multiplexer, which owns the live connection.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};

use crate::ingest::{CameraDescriptor, CameraKind, Resolution};
use crate::stream::{InspectReport, StreamHandle, StreamMultiplexer};

/// Device nodes tried by [`CameraRegistry::discover_local`].
pub fn default_local_candidates(max_devices: usize) -> Vec<String> {
    (0..max_devices).map(|idx| format!("/dev/video{}", idx)).collect()
}

/// Derive a camera id from a display name.
pub fn camera_slug(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "_")
}

pub struct CameraRegistry {
    cameras: RwLock<BTreeMap<String, CameraDescriptor>>,
    mux: Arc<StreamMultiplexer>,
}

impl CameraRegistry {
    pub fn new(mux: Arc<StreamMultiplexer>) -> Self {
        Self {
            cameras: RwLock::new(BTreeMap::new()),
            mux,
        }
    }

    pub fn multiplexer(&self) -> &Arc<StreamMultiplexer> {
        &self.mux
    }

    /// Try local capture devices and replace the local entries with what answered.
    ///
    /// Each candidate is a device path or a `stub://` locator; ids are `webcam_<n>`
    /// by position in `candidates`.
    pub fn discover_local(&self, candidates: &[String]) -> Result<Vec<CameraDescriptor>> {
        let mut found = Vec::new();
        for (idx, locator) in candidates.iter().enumerate() {
            let mut descriptor = CameraDescriptor::local(
                &format!("webcam_{}", idx),
                &format!("Webcam ({})", idx),
                locator,
            );
            match self.mux.inspect(&descriptor) {
                Ok(report) => {
                    descriptor.resolution = Some(report.resolution);
                    found.push(descriptor);
                }
                Err(err) => log::debug!("CameraRegistry: no camera at {}: {:#}", locator, err),
            }
        }

        let mut cameras = self
            .cameras
            .write()
            .map_err(|_| anyhow!("camera registry lock poisoned"))?;
        cameras.retain(|_, camera| camera.kind != CameraKind::Local);
        for descriptor in &found {
            cameras.insert(descriptor.id.clone(), descriptor.clone());
        }
        log::info!("CameraRegistry: detected {} local cameras", found.len());
        Ok(found)
    }

    /// Add (or replace) an IP camera after a successful connectivity check.
    pub fn add_ip_camera(&self, name: &str, url: &str) -> Result<CameraDescriptor> {
        let id = camera_slug(name);
        if id.is_empty() {
            return Err(anyhow!("camera name must not be empty"));
        }
        let mut descriptor = CameraDescriptor::ip(&id, name.trim(), url);
        let report = self.mux.inspect(&descriptor).map_err(|err| {
            log::error!("CameraRegistry: failed to connect to IP camera {}: {:#}", url, err);
            err
        })?;
        descriptor.resolution = Some(report.resolution);
        self.register(descriptor.clone())?;
        log::info!("CameraRegistry: added IP camera {} ({})", name, url);
        Ok(descriptor)
    }

    /// Insert or replace a descriptor without probing it.
    pub fn register(&self, descriptor: CameraDescriptor) -> Result<()> {
        let mut cameras = self
            .cameras
            .write()
            .map_err(|_| anyhow!("camera registry lock poisoned"))?;
        cameras.insert(descriptor.id.clone(), descriptor);
        Ok(())
    }

    /// Forget a camera. Removing the current camera closes the stream.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let removed = self
            .cameras
            .write()
            .map_err(|_| anyhow!("camera registry lock poisoned"))?
            .remove(id)
            .is_some();
        if removed && self.mux.current().map(|c| c.id).as_deref() == Some(id) {
            self.mux.close();
        }
        Ok(removed)
    }

    pub fn list(&self) -> Vec<CameraDescriptor> {
        self.cameras
            .read()
            .map(|cameras| cameras.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, id: &str) -> Option<CameraDescriptor> {
        self.cameras.read().ok()?.get(id).cloned()
    }

    /// Descriptor of the camera the multiplexer is streaming.
    pub fn current(&self) -> Option<CameraDescriptor> {
        let current = self.mux.current()?;
        self.get(&current.id).or(Some(current))
    }

    /// Make `id` the current camera.
    pub fn select(&self, id: &str) -> Result<StreamHandle> {
        let descriptor = self
            .get(id)
            .ok_or_else(|| anyhow!("camera '{}' not found", id))?;
        let handle = self.mux.open(&descriptor)?;
        if let Ok(frame) = handle.read_latest() {
            if let Ok(mut cameras) = self.cameras.write() {
                if let Some(entry) = cameras.get_mut(id) {
                    entry.resolution = Some(Resolution::new(frame.width, frame.height));
                }
            }
        }
        log::info!("CameraRegistry: selected camera {}", descriptor.display_name);
        Ok(handle)
    }

    /// One-shot open and read of `id`, leaving the active stream alone.
    pub fn test_camera(&self, id: &str) -> Result<InspectReport> {
        let descriptor = self
            .get(id)
            .ok_or_else(|| anyhow!("camera '{}' not found", id))?;
        self.mux.inspect(&descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamConfig;
    use std::time::Duration;

    fn registry() -> CameraRegistry {
        let config = StreamConfig {
            reconnect_delay: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            ..StreamConfig::default()
        };
        CameraRegistry::new(Arc::new(StreamMultiplexer::new(config)))
    }

    #[test]
    fn slug_lowercases_and_replaces_spaces() {
        assert_eq!(camera_slug("Front Door Cam"), "front_door_cam");
        assert_eq!(camera_slug("  Yard "), "yard");
    }

    #[test]
    fn discovery_keeps_only_answering_devices() -> Result<()> {
        let registry = registry();
        let found = registry.discover_local(&[
            "stub://one?width=20&height=10".to_string(),
            "stub://dead?fail_connect=true".to_string(),
        ])?;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "webcam_0");
        assert_eq!(found[0].resolution, Some(Resolution::new(20, 10)));
        assert_eq!(registry.list().len(), 1);
        Ok(())
    }

    #[test]
    fn ip_camera_replaces_entry_with_same_slug() -> Result<()> {
        let registry = registry();
        registry.add_ip_camera("Back Yard", "stub://yard?width=8&height=8")?;
        let replaced = registry.add_ip_camera("back yard", "stub://yard2?width=16&height=8")?;
        assert_eq!(replaced.id, "back_yard");
        assert_eq!(registry.list().len(), 1);
        assert_eq!(
            registry.get("back_yard").and_then(|c| c.resolution),
            Some(Resolution::new(16, 8))
        );
        Ok(())
    }

    #[test]
    fn unreachable_ip_camera_is_not_added() {
        let registry = registry();
        assert!(registry
            .add_ip_camera("Porch", "stub://porch?fail_connect=true")
            .is_err());
        assert!(registry.list().is_empty());
    }

    #[test]
    fn select_and_remove_current_camera() -> Result<()> {
        let registry = registry();
        registry.register(CameraDescriptor::local("lab", "Lab", "stub://lab?width=8&height=6&fps=50"))?;
        assert!(registry.select("missing").is_err());
        let handle = registry.select("lab")?;
        assert_eq!(handle.camera_id(), "lab");
        assert_eq!(registry.current().map(|c| c.id), Some("lab".to_string()));
        assert_eq!(
            registry.get("lab").and_then(|c| c.resolution),
            Some(Resolution::new(8, 6))
        );
        assert!(registry.test_camera("lab").is_ok());

        assert!(registry.remove("lab")?);
        assert!(registry.current().is_none());
        Ok(())
    }
}
