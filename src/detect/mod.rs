mod backend;
mod backends;
mod registry;
mod result;

pub use backend::DetectorBackend;
pub use backends::{NullBackend, ScriptHandle, ScriptedBackend};
pub use registry::{DetectorRegistry, SharedBackend};
pub use result::{BoundingBox, Label};

#[cfg(feature = "backend-tract")]
pub use backends::{TwoStageBackend, YoloBackend, YoloRole};
