use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;

/// Confidence reported for a synthetic fall.
const STUB_FALL_CONFIDENCE: f32 = 0.85;

/// Stub backend for runs without a model. Uses pixel hashing to spot scene changes
/// and reports each change as a fall covering the centre of the frame.
pub struct StubBackend {
    last_hash: Option<[u8; 32]>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self { last_hash: None }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let current_hash: [u8; 32] = Sha256::digest(frame.pixels()).into();

        let changed = match self.last_hash {
            Some(prev) => prev != current_hash,
            None => false,
        };

        self.last_hash = Some(current_hash);

        if !changed {
            return Ok(Vec::new());
        }

        let (w, h) = (frame.width as i32, frame.height as i32);
        Ok(vec![Detection::new(
            BoundingBox::new(w / 4, h / 4, w * 3 / 4, h * 3 / 4),
            STUB_FALL_CONFIDENCE,
            0,
        )])
    }
}
