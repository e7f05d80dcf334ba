//! Stream consumer: resolves pending alerts and serializes frames as multipart
//! MJPEG.
//!
//! Alert dispatch is handed to a detached thread so the visual stream is never held
//! up by notification delivery. A frame that fails to encode is dropped; a failed
//! write ends the stream.

use std::io::{self, Write};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::alert::{AlertDispatcher, AlertHandoff, DispatchOutcome};
use crate::frame::{Frame, STREAM_JPEG_QUALITY};
use crate::pipeline::{AnnotatedFrame, StreamEnd};

pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Frame one JPEG as a multipart chunk.
pub fn encode_chunk(jpeg: &[u8]) -> Vec<u8> {
    let mut chunk = Vec::with_capacity(jpeg.len() + 64);
    chunk.extend_from_slice(b"--");
    chunk.extend_from_slice(BOUNDARY.as_bytes());
    chunk.extend_from_slice(b"\r\nContent-Type: image/jpeg\r\n\r\n");
    chunk.extend_from_slice(jpeg);
    chunk.extend_from_slice(b"\r\n");
    chunk
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub alerts_dispatched: u64,
}

pub struct StreamEncoder {
    handoff: Arc<dyn AlertHandoff>,
    dispatcher: Arc<AlertDispatcher>,
    quality: u8,
    stats: StreamStats,
    in_flight: Vec<JoinHandle<DispatchOutcome>>,
    completed: Vec<DispatchOutcome>,
}

impl StreamEncoder {
    pub fn new(handoff: Arc<dyn AlertHandoff>, dispatcher: Arc<AlertDispatcher>) -> Self {
        Self {
            handoff,
            dispatcher,
            quality: STREAM_JPEG_QUALITY,
            stats: StreamStats::default(),
            in_flight: Vec::new(),
            completed: Vec::new(),
        }
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality;
        self
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    /// Forward a pending alert, if any, to the dispatcher.
    pub fn resolve_pending(&mut self) {
        let Some(event) = self.handoff.take_pending() else {
            return;
        };
        match self.dispatcher.dispatch(event) {
            Ok(handle) => {
                self.reap_finished();
                self.in_flight.push(handle);
                self.stats.alerts_dispatched += 1;
            }
            Err(err) => log::error!("stream: {:#}", err),
        }
    }

    /// Encode one frame into a multipart chunk; `None` if encoding failed.
    pub fn encode(&mut self, frame: &Frame) -> Option<Vec<u8>> {
        match frame.encode_jpeg(self.quality) {
            Ok(jpeg) => Some(encode_chunk(&jpeg)),
            Err(err) => {
                self.stats.frames_dropped += 1;
                log::warn!("stream: dropping frame: {:#}", err);
                None
            }
        }
    }

    /// Write one frame to `out`, resolving any pending alert first.
    pub fn send<W: Write>(&mut self, frame: &Frame, out: &mut W) -> io::Result<()> {
        self.resolve_pending();
        let Some(chunk) = self.encode(frame) else {
            return Ok(());
        };
        out.write_all(&chunk)?;
        out.flush()?;
        self.stats.frames_sent += 1;
        Ok(())
    }

    /// Drain `frames` into `out` until the frames run out or a write fails.
    ///
    /// Returns `Some(StreamEnd::ViewerGone)` if the transport failed.
    pub fn run<I, W>(&mut self, frames: I, out: &mut W) -> Option<StreamEnd>
    where
        I: IntoIterator<Item = AnnotatedFrame>,
        W: Write,
    {
        for produced in frames {
            if let Err(err) = self.send(&produced.frame, out) {
                log::info!("stream: transport closed: {}", err);
                return Some(StreamEnd::ViewerGone);
            }
        }
        // Catch an event raised on the final frame.
        self.resolve_pending();
        None
    }

    /// Wait for dispatches started by this encoder and collect their outcomes.
    pub fn join_dispatches(&mut self) -> Vec<DispatchOutcome> {
        let mut outcomes = std::mem::take(&mut self.completed);
        outcomes.extend(
            self.in_flight
                .drain(..)
                .filter_map(|handle| handle.join().ok()),
        );
        outcomes
    }

    // Finished handles are joined here so their outcomes survive pruning.
    fn reap_finished(&mut self) {
        let mut running = Vec::with_capacity(self.in_flight.len());
        for handle in self.in_flight.drain(..) {
            if handle.is_finished() {
                if let Ok(outcome) = handle.join() {
                    self.completed.push(outcome);
                }
            } else {
                running.push(handle);
            }
        }
        self.in_flight = running;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{EventChannel, LogNotifier};
    use crate::annotate::Annotation;
    use crate::evidence::FallEvent;
    use std::time::Duration;

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "viewer left"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn wait_until_finished(encoder: &StreamEncoder) {
        for _ in 0..200 {
            if encoder.in_flight.iter().all(|h| h.is_finished()) {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("dispatch threads did not finish");
    }

    fn encoder() -> (Arc<EventChannel>, StreamEncoder) {
        let handoff = Arc::new(EventChannel::new());
        let dispatcher = Arc::new(AlertDispatcher::new(
            Arc::new(LogNotifier),
            Duration::from_secs(60),
        ));
        let encoder = StreamEncoder::new(handoff.clone(), dispatcher);
        (handoff, encoder)
    }

    fn produced(frame: Frame) -> AnnotatedFrame {
        AnnotatedFrame {
            frame,
            annotation: Annotation::default(),
            inference_failed: false,
        }
    }

    #[test]
    fn chunk_layout() {
        let chunk = encode_chunk(&[0xFF, 0xD8, 0xFF, 0xD9]);
        assert_eq!(
            chunk,
            b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8\xFF\xD9\r\n".to_vec()
        );
    }

    #[test]
    fn bad_frame_is_dropped_and_stream_continues() -> anyhow::Result<()> {
        let (_handoff, mut encoder) = encoder();
        let frames = vec![
            produced(Frame::from_raw_parts(vec![1, 2, 3], 4, 4)),
            produced(Frame::filled(8, 8, [10, 20, 30])?),
        ];
        let mut out = Vec::new();
        assert_eq!(encoder.run(frames, &mut out), None);
        assert_eq!(encoder.stats().frames_sent, 1);
        assert_eq!(encoder.stats().frames_dropped, 1);
        assert!(out.starts_with(b"--frame\r\n"));
        Ok(())
    }

    #[test]
    fn write_failure_ends_stream() -> anyhow::Result<()> {
        let (_handoff, mut encoder) = encoder();
        let frames = vec![produced(Frame::filled(8, 8, [0, 0, 0])?)];
        assert_eq!(
            encoder.run(frames, &mut BrokenPipe),
            Some(StreamEnd::ViewerGone)
        );
        Ok(())
    }

    #[test]
    fn pending_alert_is_dispatched_once() -> anyhow::Result<()> {
        let (handoff, mut encoder) = encoder();
        handoff.publish(FallEvent::placeholder("cam"));
        let frames = vec![
            produced(Frame::filled(8, 8, [0, 0, 0])?),
            produced(Frame::filled(8, 8, [0, 0, 0])?),
        ];
        encoder.run(frames, &mut Vec::new());
        assert_eq!(encoder.stats().alerts_dispatched, 1);
        assert_eq!(encoder.join_dispatches(), vec![DispatchOutcome::Sent]);
        Ok(())
    }

    #[test]
    fn finished_dispatches_keep_their_outcomes() -> anyhow::Result<()> {
        let (handoff, mut encoder) = encoder();
        let frame = Frame::filled(8, 8, [0, 0, 0])?;

        handoff.publish(FallEvent::placeholder("cam"));
        encoder.send(&frame, &mut Vec::new())?;
        wait_until_finished(&encoder);

        // The second dispatch prunes the first, already finished, handle.
        handoff.publish(FallEvent::placeholder("cam"));
        encoder.send(&frame, &mut Vec::new())?;
        wait_until_finished(&encoder);
        handoff.publish(FallEvent::placeholder("cam"));
        encoder.send(&frame, &mut Vec::new())?;

        assert_eq!(encoder.stats().alerts_dispatched, 3);
        assert_eq!(
            encoder.join_dispatches(),
            vec![
                DispatchOutcome::Sent,
                DispatchOutcome::Suppressed,
                DispatchOutcome::Suppressed
            ]
        );
        assert!(encoder.join_dispatches().is_empty());
        Ok(())
    }
}
