use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{anyhow, Context, Result};

use crate::detect::result::BoundingBox;
use crate::frame::Frame;

use super::backend::DetectorBackend;

/// A backend shared between the registry and the detection loop.
pub type SharedBackend = Arc<Mutex<dyn DetectorBackend>>;

/// Thread-safe registry of detector backends with exactly one active entry.
///
/// The detection loop resolves the active backend on every frame, so swapping the
/// active model takes effect on the next frame without restarting the loop.
/// Backends are wrapped in `Mutex` because `DetectorBackend::detect` takes `&mut self`.
#[derive(Default)]
pub struct DetectorRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    backends: HashMap<String, SharedBackend>,
    active: Option<String>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Warm up and register a backend, replacing any backend with the same name.
    ///
    /// The registry only activates a backend on its own when nothing is active yet.
    /// A backend whose warm-up fails is not registered.
    pub fn register<B: DetectorBackend + 'static>(&self, mut backend: B) -> Result<()> {
        let name = backend.name().to_string();
        backend
            .warm_up()
            .with_context(|| format!("warm up detector backend '{}'", name))?;
        let mut inner = self
            .inner
            .write()
            .map_err(|_| anyhow!("detector registry lock poisoned"))?;
        if inner.active.is_none() {
            inner.active = Some(name.clone());
        }
        inner.backends.insert(name.clone(), Arc::new(Mutex::new(backend)));
        log::info!("DetectorRegistry: registered backend '{}'", name);
        Ok(())
    }

    /// Make `name` the active backend.
    pub fn set_active(&self, name: &str) -> Result<()> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| anyhow!("detector registry lock poisoned"))?;
        if !inner.backends.contains_key(name) {
            return Err(anyhow!("backend '{}' not registered", name));
        }
        inner.active = Some(name.to_string());
        log::info!("DetectorRegistry: active backend is now '{}'", name);
        Ok(())
    }

    /// Remove a backend. Removing the active backend leaves nothing active.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| anyhow!("detector registry lock poisoned"))?;
        let removed = inner.backends.remove(name).is_some();
        if inner.active.as_deref() == Some(name) {
            inner.active = None;
        }
        Ok(removed)
    }

    pub fn active_name(&self) -> Option<String> {
        self.inner.read().ok().and_then(|inner| inner.active.clone())
    }

    /// Active backend, if any.
    pub fn active(&self) -> Option<SharedBackend> {
        let inner = self.inner.read().ok()?;
        inner
            .active
            .as_ref()
            .and_then(|name| inner.backends.get(name))
            .cloned()
    }

    /// List registered backends.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .read()
            .map(|inner| inner.backends.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Run the active backend on `frame`.
    pub fn detect(&self, frame: &Frame) -> Result<Vec<BoundingBox>> {
        let backend = self
            .active()
            .ok_or_else(|| anyhow!("no active detector backend"))?;
        let mut guard = backend
            .lock()
            .map_err(|_| anyhow!("backend lock poisoned"))?;
        guard.detect(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{Label, ScriptedBackend};
    use image::RgbImage;

    fn frame() -> Frame {
        Frame::new("cam", 1, RgbImage::new(8, 8))
    }

    #[test]
    fn first_registered_backend_becomes_active_until_swapped() -> Result<()> {
        let registry = DetectorRegistry::new();
        registry.register(ScriptedBackend::named("a").repeat(vec![]))?;
        registry.register(ScriptedBackend::named("b").repeat(vec![BoundingBox::new(
            0.0,
            0.0,
            2.0,
            2.0,
            Label::Person,
            0.8,
        )]))?;
        assert_eq!(registry.active_name().as_deref(), Some("a"));
        assert!(registry.detect(&frame())?.is_empty());

        registry.set_active("b")?;
        assert_eq!(registry.detect(&frame())?.len(), 1);
        assert_eq!(registry.list(), vec!["a".to_string(), "b".to_string()]);
        Ok(())
    }

    #[test]
    fn unknown_backend_cannot_be_activated() {
        let registry = DetectorRegistry::new();
        assert!(registry.set_active("missing").is_err());
        assert!(registry.detect(&frame()).is_err());
    }

    struct ColdBackend {
        fail: bool,
        warmed: Arc<Mutex<u32>>,
    }

    impl DetectorBackend for ColdBackend {
        fn name(&self) -> &str {
            "cold"
        }

        fn detect(&mut self, _frame: &Frame) -> Result<Vec<BoundingBox>> {
            Ok(Vec::new())
        }

        fn warm_up(&mut self) -> Result<()> {
            *self.warmed.lock().expect("warm counter") += 1;
            if self.fail {
                Err(anyhow!("model file truncated"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn register_warms_up_once() -> Result<()> {
        let registry = DetectorRegistry::new();
        let warmed = Arc::new(Mutex::new(0));
        registry.register(ColdBackend {
            fail: false,
            warmed: warmed.clone(),
        })?;
        registry.detect(&frame())?;
        assert_eq!(*warmed.lock().expect("warm counter"), 1);
        assert_eq!(registry.active_name().as_deref(), Some("cold"));
        Ok(())
    }

    #[test]
    fn failed_warm_up_keeps_backend_out() -> Result<()> {
        let registry = DetectorRegistry::new();
        registry.register(ScriptedBackend::named("a"))?;
        let err = registry
            .register(ColdBackend {
                fail: true,
                warmed: Arc::new(Mutex::new(0)),
            })
            .expect_err("warm-up failure must reject the backend");
        assert!(format!("{:#}", err).contains("model file truncated"));
        assert_eq!(registry.list(), vec!["a".to_string()]);
        assert!(registry.set_active("cold").is_err());
        Ok(())
    }

    #[test]
    fn removing_active_backend_clears_selection() -> Result<()> {
        let registry = DetectorRegistry::new();
        registry.register(ScriptedBackend::named("a"))?;
        assert!(registry.remove("a")?);
        assert!(registry.active().is_none());
        Ok(())
    }
}
