//! fallwatch: fall detection over live or recorded video.
//!
//! A stream session reads frames from a source, runs a detector, draws overlays,
//! persists evidence for fall frames and streams the annotated result as multipart
//! MJPEG. Alerts leave the stream path through a cooldown-gated dispatcher on a
//! detached thread, so a slow notifier never stalls the picture.
//!
//! # Module Structure
//!
//! - `frame`: RGB frame container and JPEG encoding
//! - `ingest`: Frame sources (files, capture devices, network cameras, synthetic)
//! - `detect`: Detector backends, results and registry
//! - `annotate`: Threshold, overlays and event classification
//! - `evidence`: Snapshot files and the append-only CSV log
//! - `alert`: Event handoff, cooldown dispatcher and notifiers
//! - `pipeline`: Per-stream producer iterator
//! - `stream`: Multipart MJPEG consumer
//! - `session`: Producer/consumer wiring for one viewer
//! - `server`: HTTP viewer server

pub mod alert;
pub mod annotate;
pub mod config;
pub mod detect;
pub mod evidence;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod server;
pub mod session;
pub mod stream;
pub mod transport;

pub use alert::{
    AlertDispatcher, AlertHandoff, AlertMessage, AlertState, CooldownGate, DispatchCounts,
    DispatchOutcome, EventChannel, LogNotifier, MqttNotifier, Notifier, RetryPolicy,
};
pub use annotate::{Annotation, Annotator};
pub use config::{FallwatchConfig, HandoffKind};
pub use detect::{
    BackendRegistry, BoundingBox, Detection, DetectorBackend, FallClass, ScriptStep,
    ScriptedBackend, StubBackend,
};
pub use evidence::{EvidenceLog, EvidenceWriter, FallEvent};
pub use frame::Frame;
pub use ingest::{FrameSource, SourceDescriptor, SourceStats};
pub use pipeline::{AnnotatedFrame, FramePipeline, StreamEnd};
pub use server::{FallServer, ServerConfig, ServerHandle};
pub use session::{SessionReport, SessionRequest, SessionRunner};
pub use stream::{StreamEncoder, StreamStats};
