use anyhow::{anyhow, Result};
use std::collections::VecDeque;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// One scripted inference result.
#[derive(Clone, Debug)]
pub enum ScriptStep {
    Detections(Vec<Detection>),
    /// Simulated inference failure with the given message.
    Fail(String),
}

/// Backend that replays a fixed script, one step per frame.
///
/// Once the script is exhausted every frame yields no detections. Used to drive the
/// pipeline deterministically in tests and replay tooling.
pub struct ScriptedBackend {
    steps: VecDeque<ScriptStep>,
    calls: u64,
}

impl ScriptedBackend {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: steps.into(),
            calls: 0,
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        self.calls += 1;
        match self.steps.pop_front() {
            Some(ScriptStep::Detections(dets)) => Ok(dets),
            Some(ScriptStep::Fail(msg)) => Err(anyhow!(msg)),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;

    #[test]
    fn replays_steps_then_goes_quiet() -> Result<()> {
        let det = Detection::new(BoundingBox::new(0, 0, 4, 4), 0.9, 0);
        let mut backend = ScriptedBackend::new(vec![
            ScriptStep::Fail("model crashed".into()),
            ScriptStep::Detections(vec![det.clone()]),
        ]);
        let frame = Frame::filled(4, 4, [0, 0, 0])?;

        let err = backend.detect(&frame).unwrap_err();
        assert!(err.to_string().contains("model crashed"));
        assert_eq!(backend.detect(&frame)?, vec![det]);
        assert!(backend.detect(&frame)?.is_empty());
        assert_eq!(backend.calls(), 3);
        Ok(())
    }
}
