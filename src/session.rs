//! One stream session per viewer.
//!
//! The producer (`FramePipeline`) runs on its own thread and hands frames to the
//! consumer (`StreamEncoder`) through a small bounded FIFO, preserving capture
//! order. When the viewer goes away the consumer drops its receiver and the
//! producer stops at its next send.

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver};
use std::io::Write;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::alert::{build_handoff, AlertDispatcher, DispatchOutcome, Notifier};
use crate::annotate::Annotator;
use crate::config::{FallwatchConfig, HandoffKind};
use crate::detect::BackendRegistry;
use crate::evidence::EvidenceWriter;
use crate::ingest::{FrameSource, SourceDescriptor};
use crate::pipeline::{AnnotatedFrame, FramePipeline, StreamEnd};
use crate::stream::{StreamEncoder, StreamStats};

const FRAME_QUEUE_DEPTH: usize = 2;

/// What a finished session did.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionReport {
    pub source_id: String,
    pub end: StreamEnd,
    pub stream: StreamStats,
    /// Frames the producer yielded; `None` if it was left running after the
    /// viewer disconnected.
    pub frames_produced: Option<u64>,
    pub events_raised: Option<u64>,
    /// Dispatch outcomes, collected only when the session waits for alerts.
    pub dispatches: Vec<DispatchOutcome>,
}

/// Parameters of one session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionRequest {
    pub descriptor: SourceDescriptor,
    /// Identifier written to the evidence log's `ip` column.
    pub source_id: String,
    /// Join alert threads before returning (used by one-shot runs and tests).
    pub wait_for_alerts: bool,
}

impl SessionRequest {
    pub fn new(descriptor: SourceDescriptor, source_id: &str) -> Self {
        Self {
            descriptor,
            source_id: source_id.to_string(),
            wait_for_alerts: false,
        }
    }

    pub fn waiting_for_alerts(mut self) -> Self {
        self.wait_for_alerts = true;
        self
    }
}

/// Shared collaborators from which sessions are built.
pub struct SessionRunner {
    registry: Arc<BackendRegistry>,
    evidence: Arc<EvidenceWriter>,
    notifier: Arc<dyn Notifier>,
    annotator: Annotator,
    handoff: HandoffKind,
    cooldown: Duration,
    shared_dispatcher: Option<Arc<AlertDispatcher>>,
    target_fps: u32,
}

impl SessionRunner {
    pub fn new(
        config: &FallwatchConfig,
        registry: BackendRegistry,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let evidence = EvidenceWriter::new(&config.evidence)?;
        let annotator = Annotator::new(config.detector.confidence_threshold)?;
        let shared_dispatcher = config.alerts.shared_cooldown.then(|| {
            Arc::new(AlertDispatcher::new(
                Arc::clone(&notifier),
                config.alerts.cooldown,
            ))
        });
        Ok(Self {
            registry: Arc::new(registry),
            evidence: Arc::new(evidence),
            notifier,
            annotator,
            handoff: config.alerts.handoff,
            cooldown: config.alerts.cooldown,
            shared_dispatcher,
            target_fps: config.source.target_fps,
        })
    }

    pub fn evidence(&self) -> &Arc<EvidenceWriter> {
        &self.evidence
    }

    /// The dispatcher a new session should use.
    pub fn dispatcher(&self) -> Arc<AlertDispatcher> {
        match &self.shared_dispatcher {
            Some(shared) => Arc::clone(shared),
            None => Arc::new(AlertDispatcher::new(
                Arc::clone(&self.notifier),
                self.cooldown,
            )),
        }
    }

    /// Open the requested source and stream it to `out`.
    ///
    /// A source that cannot be opened ends the session before any frame is
    /// written.
    pub fn run<W: Write>(&self, request: &SessionRequest, out: &mut W) -> SessionReport {
        match request.descriptor.open(self.target_fps) {
            Ok(source) => self.run_with_source(source, request, out),
            Err(err) => {
                log::warn!(
                    "session {}: cannot open {}: {:#}",
                    request.source_id,
                    request.descriptor,
                    err
                );
                SessionReport::ended_early(
                    &request.source_id,
                    StreamEnd::SourceFailed(format!("{:#}", err)),
                )
            }
        }
    }

    /// Stream an already connected source to `out`.
    pub fn run_with_source<W: Write>(
        &self,
        source: Box<dyn FrameSource>,
        request: &SessionRequest,
        out: &mut W,
    ) -> SessionReport {
        let detector = match self.registry.create_default() {
            Ok(detector) => detector,
            Err(err) => {
                log::error!("session {}: detector unavailable: {:#}", request.source_id, err);
                return SessionReport::ended_early(
                    &request.source_id,
                    StreamEnd::DetectorUnavailable(format!("{:#}", err)),
                );
            }
        };

        let handoff = build_handoff(self.handoff, &request.source_id);
        let pipeline = FramePipeline::new(
            source,
            detector,
            self.annotator,
            Arc::clone(&self.evidence),
            Arc::clone(&handoff),
            &request.source_id,
        );
        let producer = match spawn_producer(pipeline, &request.source_id) {
            Ok(producer) => producer,
            Err(err) => {
                log::error!("session {}: {:#}", request.source_id, err);
                return SessionReport::ended_early(
                    &request.source_id,
                    StreamEnd::SourceFailed(format!("{:#}", err)),
                );
            }
        };

        log::info!("session {}: streaming", request.source_id);
        let mut encoder = StreamEncoder::new(handoff, self.dispatcher());
        let viewer_end = encoder.run(producer.frames.iter(), out);
        drop(producer.frames);

        let (end, frames_produced, events_raised) = match viewer_end {
            // The producer may be blocked in a read; leave it to stop on its own.
            Some(end) => (end, None, None),
            None => match producer.handle.join() {
                Ok(result) => (result.end, Some(result.frames), Some(result.events)),
                Err(_) => (
                    StreamEnd::SourceFailed("producer thread panicked".to_string()),
                    None,
                    None,
                ),
            },
        };

        let dispatches = if request.wait_for_alerts {
            encoder.join_dispatches()
        } else {
            Vec::new()
        };
        let report = SessionReport {
            source_id: request.source_id.clone(),
            end,
            stream: encoder.stats(),
            frames_produced,
            events_raised,
            dispatches,
        };
        log::info!(
            "session {}: ended ({}), {} frames sent, {} alerts",
            report.source_id,
            report.end,
            report.stream.frames_sent,
            report.stream.alerts_dispatched
        );
        report
    }
}

impl SessionReport {
    fn ended_early(source_id: &str, end: StreamEnd) -> Self {
        Self {
            source_id: source_id.to_string(),
            end,
            stream: StreamStats::default(),
            frames_produced: Some(0),
            events_raised: Some(0),
            dispatches: Vec::new(),
        }
    }
}

struct ProducerResult {
    end: StreamEnd,
    frames: u64,
    events: u64,
}

struct Producer {
    frames: Receiver<AnnotatedFrame>,
    handle: JoinHandle<ProducerResult>,
}

fn spawn_producer(mut pipeline: FramePipeline, source_id: &str) -> Result<Producer> {
    let (tx, rx) = bounded(FRAME_QUEUE_DEPTH);
    let handle = std::thread::Builder::new()
        .name(format!("producer-{}", source_id))
        .spawn(move || {
            while let Some(frame) = pipeline.next() {
                if tx.send(frame).is_err() {
                    return ProducerResult {
                        end: StreamEnd::ViewerGone,
                        frames: pipeline.frames_produced(),
                        events: pipeline.events_raised(),
                    };
                }
            }
            ProducerResult {
                end: pipeline
                    .end_reason()
                    .cloned()
                    .unwrap_or(StreamEnd::Exhausted),
                frames: pipeline.frames_produced(),
                events: pipeline.events_raised(),
            }
        })
        .context("spawn producer thread")?;
    Ok(Producer { frames: rx, handle })
}
