mod backend;
mod backends;
mod registry;
mod result;

pub use backend::DetectorBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use backends::{ScriptStep, ScriptedBackend, StubBackend};
pub use registry::{BackendFactory, BackendRegistry};
pub use result::{non_max_suppression, BoundingBox, Detection, FallClass};
