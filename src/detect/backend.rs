use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Detector backend trait.
///
/// # Audit Boundary
///
/// The model behind a backend is opaque to the rest of the daemon. Implementations
/// receive a borrowed frame and return boxes in frame pixel coordinates; they must
/// not keep the frame past the `detect` call or draw on it.
///
/// A backend instance serves a single stream. Sessions build their own instance
/// through the `BackendRegistry`, so `detect` never contends across streams.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run inference on one frame.
    ///
    /// An error is an inference failure for this frame only; the pipeline
    /// forwards the frame unannotated and moves on.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, called once before the first frame.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
