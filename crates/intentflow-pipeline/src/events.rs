//! Round controller event stream.
//!
//! Emits [`RoundEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! observers (the CLI progress printer, tests) can follow the trial loop
//! without coupling to the controller internals.

use serde::{Deserialize, Serialize};

use crate::submit::SubmissionOutcome;
use intentflow_types::Label;

/// Events emitted while running intents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RoundEvent {
    IntentStarted {
        phase: String,
        intent: String,
    },
    TrialCompleted {
        intent: String,
        trial: usize,
        reward: f64,
        label: Label,
        posterior_norm: f64,
        /// Chosen candidate's trimmed lines joined with ` | `.
        pipeline: String,
    },
    TrialSkipped {
        intent: String,
        trial: usize,
        reason: String,
    },
    ThresholdReached {
        intent: String,
        trial: usize,
    },
    PromotionRejected {
        intent: String,
        diagnostics: Vec<String>,
    },
    ManifestWritten {
        intent: String,
        path: String,
    },
    Submission {
        intent: String,
        outcome: SubmissionOutcome,
    },
    IntentFinished {
        intent: String,
        ats: usize,
        succeeded: bool,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<RoundEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: RoundEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RoundEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_sends_and_receives() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();

        emitter.emit(RoundEvent::ThresholdReached {
            intent: "detect".into(),
            trial: 3,
        });

        match rx.recv().await.unwrap() {
            RoundEvent::ThresholdReached { intent, trial } => {
                assert_eq!(intent, "detect");
                assert_eq!(trial, 3);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let emitter = EventEmitter::new(16);
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();

        emitter.emit(RoundEvent::TrialSkipped {
            intent: "i".into(),
            trial: 1,
            reason: "all candidates blacklisted".into(),
        });

        let json1 = serde_json::to_string(&rx1.recv().await.unwrap()).unwrap();
        let json2 = serde_json::to_string(&rx2.recv().await.unwrap()).unwrap();
        assert_eq!(json1, json2);
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let emitter = EventEmitter::new(16);
        emitter.emit(RoundEvent::IntentFinished {
            intent: "i".into(),
            ats: 151,
            succeeded: false,
        });
    }
}
