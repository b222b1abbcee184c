use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::BoundingBox;
use crate::frame::Frame;

/// Backend that never detects anything. Used when no model is configured.
#[derive(Default)]
pub struct NullBackend;

impl DetectorBackend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<BoundingBox>> {
        Ok(Vec::new())
    }
}

enum Step {
    Boxes(Vec<BoundingBox>),
    Fail(String),
}

#[derive(Default)]
struct Script {
    steps: VecDeque<Step>,
    fallback: Vec<BoundingBox>,
    calls: u64,
}

/// Backend replaying a scripted sequence of detector outputs, one step per call.
///
/// When the script runs dry the `repeat` boxes are returned on every call.
pub struct ScriptedBackend {
    name: String,
    script: Arc<Mutex<Script>>,
    delay: Duration,
}

/// Clonable handle for feeding a `ScriptedBackend` after it has been registered.
#[derive(Clone)]
pub struct ScriptHandle {
    script: Arc<Mutex<Script>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::named("scripted")
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Arc::new(Mutex::new(Script::default())),
            delay: Duration::ZERO,
        }
    }

    /// Queue one call's worth of boxes.
    pub fn then(self, boxes: Vec<BoundingBox>) -> Self {
        self.handle().push(boxes);
        self
    }

    /// Queue a failing call.
    pub fn then_fail(self, reason: &str) -> Self {
        self.handle().push_failure(reason);
        self
    }

    /// Boxes returned once the queued steps are exhausted.
    pub fn repeat(self, boxes: Vec<BoundingBox>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.fallback = boxes;
        }
        self
    }

    /// Simulate slow inference.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn handle(&self) -> ScriptHandle {
        ScriptHandle {
            script: self.script.clone(),
        }
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptHandle {
    pub fn push(&self, boxes: Vec<BoundingBox>) {
        if let Ok(mut script) = self.script.lock() {
            script.steps.push_back(Step::Boxes(boxes));
        }
    }

    pub fn push_failure(&self, reason: &str) {
        if let Ok(mut script) = self.script.lock() {
            script.steps.push_back(Step::Fail(reason.to_string()));
        }
    }

    /// Number of `detect` calls served so far.
    pub fn calls(&self) -> u64 {
        self.script.lock().map(|script| script.calls).unwrap_or(0)
    }

    pub fn pending(&self) -> usize {
        self.script.lock().map(|script| script.steps.len()).unwrap_or(0)
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<BoundingBox>> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let mut script = self
            .script
            .lock()
            .map_err(|_| anyhow!("script lock poisoned"))?;
        script.calls += 1;
        match script.steps.pop_front() {
            Some(Step::Boxes(boxes)) => Ok(boxes),
            Some(Step::Fail(reason)) => Err(anyhow!(reason)),
            None => Ok(script.fallback.clone()),
        }
    }
}
