pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::{NullBackend, ScriptHandle, ScriptedBackend};

#[cfg(feature = "backend-tract")]
pub use tract::{TwoStageBackend, YoloBackend, YoloRole};
