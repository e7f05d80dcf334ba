//! Alert coordination: event handoff between the producer and consumer of a
//! stream, and the rate-limited notifier that runs off the stream path.

pub mod dispatcher;
pub mod handoff;
pub mod notifier;

pub use dispatcher::{AlertDispatcher, CooldownGate, DispatchCounts, DispatchOutcome, DispatchStats};
pub use handoff::{build_handoff, AlertHandoff, AlertState, EventChannel, RetryPolicy};
pub use notifier::{AlertMessage, LogNotifier, MqttNotifier, Notifier, ALERT_SUBJECT};
