//! Producer-to-consumer handoff of fall events within one stream session.
//!
//! Two implementations share the `AlertHandoff` trait:
//! - `EventChannel`: one-slot channel carrying a complete event; a newer event
//!   evicts an unconsumed older one.
//! - `AlertState`: pending flag plus a separately written metadata record. The
//!   consumer polls for metadata with a bounded retry and falls back to
//!   placeholders, so it never blocks indefinitely.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::HandoffKind;
use crate::evidence::FallEvent;

pub trait AlertHandoff: Send + Sync {
    /// Producer side: publish an event whose evidence is already persisted.
    fn publish(&self, event: FallEvent);

    /// Consumer side: the pending event, if one was raised since the last call.
    fn take_pending(&self) -> Option<FallEvent>;
}

/// Build the handoff selected by configuration for a stream reading `source`.
pub fn build_handoff(kind: HandoffKind, source: &str) -> Arc<dyn AlertHandoff> {
    match kind {
        HandoffKind::Channel => Arc::new(EventChannel::new()),
        HandoffKind::Flag => Arc::new(AlertState::new(source, RetryPolicy::default())),
    }
}

/// Single-slot, latest-wins event channel.
pub struct EventChannel {
    tx: Sender<FallEvent>,
    rx: Receiver<FallEvent>,
    evicted: AtomicU64,
}

impl EventChannel {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self {
            tx,
            rx,
            evicted: AtomicU64::new(0),
        }
    }

    /// Events replaced before the consumer saw them.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertHandoff for EventChannel {
    fn publish(&self, event: FallEvent) {
        let mut event = event;
        loop {
            match self.tx.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    if self.rx.try_recv().is_ok() {
                        self.evicted.fetch_add(1, Ordering::Relaxed);
                        log::debug!("alert handoff: replaced an unconsumed event");
                    }
                    event = rejected;
                }
                // Both ends live in `self`.
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    fn take_pending(&self) -> Option<FallEvent> {
        self.rx.try_recv().ok()
    }
}

/// Bounded metadata wait used by `AlertState`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(50),
        }
    }
}

/// Pending flag plus last-event metadata, written in two separate steps.
pub struct AlertState {
    source: String,
    policy: RetryPolicy,
    pending: AtomicBool,
    metadata: Mutex<Option<FallEvent>>,
}

impl AlertState {
    pub fn new(source: &str, policy: RetryPolicy) -> Self {
        Self {
            source: source.to_string(),
            policy,
            pending: AtomicBool::new(false),
            metadata: Mutex::new(None),
        }
    }

    /// Overwrite the last-event metadata without raising the flag.
    pub fn store_metadata(&self, event: FallEvent) {
        match self.metadata.lock() {
            Ok(mut slot) => *slot = Some(event),
            Err(poisoned) => *poisoned.into_inner() = Some(event),
        }
    }

    /// Mark a notification as pending.
    pub fn raise(&self) {
        self.pending.store(true, Ordering::SeqCst);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    fn read_metadata(&self) -> Option<FallEvent> {
        match self.metadata.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl AlertHandoff for AlertState {
    fn publish(&self, event: FallEvent) {
        self.store_metadata(event);
        self.raise();
    }

    /// Resolves the metadata first and clears the flag afterwards.
    fn take_pending(&self) -> Option<FallEvent> {
        if !self.is_pending() {
            return None;
        }
        let event = self.resolve_metadata();
        self.pending.store(false, Ordering::SeqCst);
        Some(event)
    }
}

impl AlertState {
    fn resolve_metadata(&self) -> FallEvent {
        let mut attempts = 0;
        loop {
            if let Some(event) = self.read_metadata() {
                return event;
            }
            if attempts >= self.policy.attempts {
                break;
            }
            std::thread::sleep(self.policy.delay);
            attempts += 1;
        }
        log::warn!(
            "alert handoff: metadata missing after {} retries; using placeholders",
            self.policy.attempts
        );
        FallEvent::placeholder(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn event(confidence: f32) -> FallEvent {
        FallEvent {
            timestamp: "2024-05-01 10:00:00".into(),
            source: "cam".into(),
            location: "Unknown".into(),
            confidence,
            image_path: "falls/FALL_x.jpg".into(),
        }
    }

    #[test]
    fn channel_latest_event_wins() {
        let channel = EventChannel::new();
        assert!(channel.take_pending().is_none());
        channel.publish(event(0.7));
        channel.publish(event(0.9));
        assert_eq!(channel.take_pending().map(|e| e.confidence), Some(0.9));
        assert!(channel.take_pending().is_none());
        assert_eq!(channel.evicted(), 1);
    }

    #[test]
    fn flag_delivers_published_event_once() {
        let state = AlertState::new("cam", RetryPolicy::default());
        state.publish(event(0.8));
        assert!(state.is_pending());
        assert_eq!(state.take_pending(), Some(event(0.8)));
        assert!(!state.is_pending());
        assert!(state.take_pending().is_none());
    }

    #[test]
    fn flag_without_metadata_falls_back_to_placeholders() {
        let policy = RetryPolicy {
            attempts: 5,
            delay: Duration::from_millis(10),
        };
        let state = AlertState::new("192.168.1.7", policy);
        state.raise();
        let started = Instant::now();
        let event = state.take_pending().expect("pending event");
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(event, FallEvent::placeholder("192.168.1.7"));
    }

    #[test]
    fn flag_picks_up_metadata_written_during_retry() {
        let state = Arc::new(AlertState::new("cam", RetryPolicy::default()));
        state.raise();
        let writer = {
            let state = Arc::clone(&state);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(60));
                state.store_metadata(event(0.75));
            })
        };
        let resolved = state.take_pending().expect("pending event");
        writer.join().expect("writer thread");
        assert_eq!(resolved.confidence, 0.75);
    }

    #[test]
    fn build_handoff_selects_kind() {
        let handoff = build_handoff(HandoffKind::Flag, "cam");
        handoff.publish(event(0.6));
        assert_eq!(handoff.take_pending().map(|e| e.confidence), Some(0.6));
    }

    #[test]
    fn flag_stays_pending_until_resolved() {
        let policy = RetryPolicy {
            attempts: 5,
            delay: Duration::from_millis(40),
        };
        let state = Arc::new(AlertState::new("cam", policy));
        state.raise();
        let consumer = {
            let state = Arc::clone(&state);
            std::thread::spawn(move || state.take_pending())
        };
        std::thread::sleep(Duration::from_millis(60));
        assert!(state.is_pending());

        let resolved = consumer.join().expect("consumer thread");
        assert_eq!(resolved, Some(FallEvent::placeholder("cam")));
        assert!(!state.is_pending());
    }
}
