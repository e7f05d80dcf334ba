//! Cooldown-gated, fire-and-forget alert dispatch.
//!
//! Each resolved event produces exactly one outcome: `Sent`, `Suppressed` (inside
//! the cooldown window) or `Failed` (notifier error). Nothing is retried and no
//! outcome reaches the stream; failures are logged and counted.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::notifier::{AlertMessage, Notifier};
use crate::evidence::FallEvent;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent,
    Suppressed,
    Failed,
}

/// Rate limiter: at most one delivery attempt per window.
pub struct CooldownGate {
    window: Duration,
    last_dispatch: Mutex<Option<Instant>>,
}

impl CooldownGate {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_dispatch: Mutex::new(None),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Claim the gate at `now`. On success the dispatch time is recorded before
    /// returning, so concurrent callers inside the window are refused.
    pub fn try_acquire(&self, now: Instant) -> bool {
        let mut last = match self.last_dispatch.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = *last {
            if now.saturating_duration_since(previous) < self.window {
                return false;
            }
            *last = Some(previous.max(now));
        } else {
            *last = Some(now);
        }
        true
    }

    pub fn last_dispatch(&self) -> Option<Instant> {
        match self.last_dispatch.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Outcome counters.
#[derive(Debug, Default)]
pub struct DispatchStats {
    sent: AtomicU64,
    suppressed: AtomicU64,
    failed: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchCounts {
    pub sent: u64,
    pub suppressed: u64,
    pub failed: u64,
}

impl DispatchStats {
    fn record(&self, outcome: DispatchOutcome) {
        let counter = match outcome {
            DispatchOutcome::Sent => &self.sent,
            DispatchOutcome::Suppressed => &self.suppressed,
            DispatchOutcome::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchCounts {
        DispatchCounts {
            sent: self.sent.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

pub struct AlertDispatcher {
    gate: CooldownGate,
    notifier: Arc<dyn Notifier>,
    stats: DispatchStats,
}

impl AlertDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, cooldown: Duration) -> Self {
        Self {
            gate: CooldownGate::new(cooldown),
            notifier,
            stats: DispatchStats::default(),
        }
    }

    pub fn gate(&self) -> &CooldownGate {
        &self.gate
    }

    pub fn stats(&self) -> DispatchCounts {
        self.stats.snapshot()
    }

    /// Dispatch on a detached thread. The handle may be dropped.
    pub fn dispatch(self: &Arc<Self>, event: FallEvent) -> Result<JoinHandle<DispatchOutcome>> {
        let dispatcher = Arc::clone(self);
        std::thread::Builder::new()
            .name("fall-alert".to_string())
            .spawn(move || dispatcher.dispatch_blocking(&event))
            .context("spawn alert dispatch thread")
    }

    pub fn dispatch_blocking(&self, event: &FallEvent) -> DispatchOutcome {
        self.dispatch_at(event, Instant::now())
    }

    /// Gate check and delivery for an event observed at `now`.
    pub fn dispatch_at(&self, event: &FallEvent, now: Instant) -> DispatchOutcome {
        let outcome = if !self.gate.try_acquire(now) {
            log::info!(
                "alert: cooldown active ({}s), skipping alert for {}",
                self.gate.window().as_secs(),
                event.source
            );
            DispatchOutcome::Suppressed
        } else {
            let message = AlertMessage::from_event(event);
            match self.notifier.notify(&message) {
                Ok(()) => {
                    log::info!(
                        "alert: sent via {} for {} ({})",
                        self.notifier.name(),
                        event.source,
                        event.timestamp
                    );
                    DispatchOutcome::Sent
                }
                Err(err) => {
                    log::error!("alert: {} delivery failed: {:#}", self.notifier.name(), err);
                    DispatchOutcome::Failed
                }
            }
        };
        self.stats.record(outcome);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::AtomicUsize;

    struct CountingNotifier {
        calls: AtomicUsize,
        fail: bool,
        delay: Duration,
    }

    impl Notifier for CountingNotifier {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn notify(&self, _message: &AlertMessage) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if self.fail {
                return Err(anyhow!("smtp down"));
            }
            Ok(())
        }
    }

    fn counting(fail: bool) -> Arc<CountingNotifier> {
        Arc::new(CountingNotifier {
            calls: AtomicUsize::new(0),
            fail,
            delay: Duration::ZERO,
        })
    }

    #[test]
    fn cooldown_suppresses_inside_window() {
        let notifier = counting(false);
        let dispatcher = AlertDispatcher::new(notifier.clone(), Duration::from_secs(60));
        let event = FallEvent::placeholder("cam");
        let t0 = Instant::now();

        assert_eq!(dispatcher.dispatch_at(&event, t0), DispatchOutcome::Sent);
        assert_eq!(
            dispatcher.dispatch_at(&event, t0 + Duration::from_secs(30)),
            DispatchOutcome::Suppressed
        );
        assert_eq!(
            dispatcher.dispatch_at(&event, t0 + Duration::from_secs(61)),
            DispatchOutcome::Sent
        );
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            dispatcher.stats(),
            DispatchCounts {
                sent: 2,
                suppressed: 1,
                failed: 0
            }
        );
    }

    #[test]
    fn failed_delivery_still_starts_cooldown() {
        let notifier = counting(true);
        let dispatcher = AlertDispatcher::new(notifier.clone(), Duration::from_secs(60));
        let event = FallEvent::placeholder("cam");
        let t0 = Instant::now();

        assert_eq!(dispatcher.dispatch_at(&event, t0), DispatchOutcome::Failed);
        assert_eq!(dispatcher.gate().last_dispatch(), Some(t0));
        assert_eq!(
            dispatcher.dispatch_at(&event, t0 + Duration::from_secs(1)),
            DispatchOutcome::Suppressed
        );
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn gate_time_never_moves_backwards() {
        let gate = CooldownGate::new(Duration::ZERO);
        let t0 = Instant::now();
        let later = t0 + Duration::from_secs(5);
        assert!(gate.try_acquire(later));
        assert!(gate.try_acquire(t0));
        assert_eq!(gate.last_dispatch(), Some(later));
    }

    #[test]
    fn detached_dispatch_reports_outcome() -> Result<()> {
        let dispatcher = Arc::new(AlertDispatcher::new(counting(false), Duration::from_secs(60)));
        let handle = dispatcher.dispatch(FallEvent::placeholder("cam"))?;
        assert_eq!(handle.join().expect("dispatch thread"), DispatchOutcome::Sent);
        Ok(())
    }

    #[test]
    fn concurrent_dispatches_send_once() -> Result<()> {
        let notifier = Arc::new(CountingNotifier {
            calls: AtomicUsize::new(0),
            fail: false,
            delay: Duration::from_millis(200),
        });
        let dispatcher = Arc::new(AlertDispatcher::new(notifier.clone(), Duration::from_secs(60)));

        let handles = (0..8)
            .map(|_| dispatcher.dispatch(FallEvent::placeholder("cam")))
            .collect::<Result<Vec<_>>>()?;
        let outcomes: Vec<DispatchOutcome> = handles
            .into_iter()
            .map(|handle| handle.join().expect("dispatch thread"))
            .collect();

        let sent = outcomes.iter().filter(|o| **o == DispatchOutcome::Sent).count();
        let suppressed = outcomes
            .iter()
            .filter(|o| **o == DispatchOutcome::Suppressed)
            .count();
        assert_eq!((sent, suppressed), (1, 7));
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.stats().suppressed, 7);
        Ok(())
    }
}
