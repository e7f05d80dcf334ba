//! Per-stream frame producer.
//!
//! `FramePipeline` is a lazy, forward-only iterator of annotated frames. Each
//! step reads one frame, runs the detector, draws overlays, and on an event frame
//! persists evidence and publishes the event to the session's handoff before the
//! frame is yielded.

use std::fmt;
use std::sync::Arc;

use crate::alert::AlertHandoff;
use crate::annotate::{Annotation, Annotator};
use crate::detect::DetectorBackend;
use crate::evidence::EvidenceWriter;
use crate::frame::Frame;
use crate::ingest::FrameSource;

/// One produced frame and what the producer decided about it.
#[derive(Debug)]
pub struct AnnotatedFrame {
    pub frame: Frame,
    pub annotation: Annotation,
    /// Detector failed on this frame; it is passed through unannotated.
    pub inference_failed: bool,
}

/// Why a stream stopped producing frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEnd {
    /// The source reported end of input.
    Exhausted,
    /// The source failed to yield a frame.
    SourceFailed(String),
    /// Evidence for an event frame could not be persisted.
    EvidenceFailed(String),
    /// No detector backend could be built for the session.
    DetectorUnavailable(String),
    /// The viewer went away.
    ViewerGone,
}

impl fmt::Display for StreamEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted => write!(f, "source exhausted"),
            Self::SourceFailed(err) => write!(f, "source failed: {}", err),
            Self::EvidenceFailed(err) => write!(f, "evidence persist failed: {}", err),
            Self::DetectorUnavailable(err) => write!(f, "detector unavailable: {}", err),
            Self::ViewerGone => write!(f, "viewer disconnected"),
        }
    }
}

pub struct FramePipeline {
    source: Box<dyn FrameSource>,
    detector: Box<dyn DetectorBackend>,
    annotator: Annotator,
    evidence: Arc<EvidenceWriter>,
    handoff: Arc<dyn AlertHandoff>,
    source_id: String,
    frames: u64,
    events: u64,
    end: Option<StreamEnd>,
}

impl FramePipeline {
    pub fn new(
        source: Box<dyn FrameSource>,
        detector: Box<dyn DetectorBackend>,
        annotator: Annotator,
        evidence: Arc<EvidenceWriter>,
        handoff: Arc<dyn AlertHandoff>,
        source_id: &str,
    ) -> Self {
        Self {
            source,
            detector,
            annotator,
            evidence,
            handoff,
            source_id: source_id.to_string(),
            frames: 0,
            events: 0,
            end: None,
        }
    }

    /// Set once the iterator has returned `None`.
    pub fn end_reason(&self) -> Option<&StreamEnd> {
        self.end.as_ref()
    }

    pub fn frames_produced(&self) -> u64 {
        self.frames
    }

    pub fn events_raised(&self) -> u64 {
        self.events
    }

    fn finish(&mut self, end: StreamEnd) -> Option<AnnotatedFrame> {
        match &end {
            StreamEnd::EvidenceFailed(_) => {
                log::error!("stream {}: {}", self.source_id, end)
            }
            StreamEnd::SourceFailed(_) => log::warn!("stream {}: {}", self.source_id, end),
            _ => log::info!("stream {}: {}", self.source_id, end),
        }
        self.end = Some(end);
        None
    }
}

impl Iterator for FramePipeline {
    type Item = AnnotatedFrame;

    fn next(&mut self) -> Option<AnnotatedFrame> {
        if self.end.is_some() {
            return None;
        }

        let mut frame = match self.source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return self.finish(StreamEnd::Exhausted),
            Err(err) => return self.finish(StreamEnd::SourceFailed(format!("{:#}", err))),
        };
        self.frames += 1;

        let detections = match self.detector.detect(&frame) {
            Ok(detections) => detections,
            Err(err) => {
                log::warn!(
                    "stream {}: inference failed on frame {} ({}): {:#}",
                    self.source_id,
                    self.frames,
                    self.detector.name(),
                    err
                );
                return Some(AnnotatedFrame {
                    frame,
                    annotation: Annotation::default(),
                    inference_failed: true,
                });
            }
        };

        let annotation = self.annotator.annotate(&mut frame, &detections);
        if let Some(confidence) = annotation.event_confidence {
            // Snapshot carries the boxes but not the banner.
            let event = match self.evidence.persist(&frame, &self.source_id, confidence) {
                Ok(event) => event,
                Err(err) => return self.finish(StreamEnd::EvidenceFailed(format!("{:#}", err))),
            };
            let banner_time = event.timestamp.clone();
            self.handoff.publish(event);
            self.events += 1;
            self.annotator.draw_banner(&mut frame, &banner_time);
        }

        Some(AnnotatedFrame {
            frame,
            annotation,
            inference_failed: false,
        })
    }
}
