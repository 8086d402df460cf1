//! Outbound security events.
//!
//! The orchestrator never holds references into channel adapters; it emits
//! typed events onto a broadcast channel and whoever is listening (chat
//! channel, dashboard, CLI) reacts. No subscribers is fine.

use serde::Serialize;
use tokio::sync::broadcast;

/// Events the core surfaces to external collaborators.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SecurityEvent {
    /// A tool call is suspended awaiting user confirmation.
    AskPending {
        approval_id: String,
        request_id: String,
        session_id: String,
        tool: String,
        reason: String,
    },
    /// A canary marker leaked into model output or tool arguments.
    /// Carries the marker fingerprint, never its value.
    InjectionAlert {
        session_id: String,
        fingerprint: String,
        location: String,
    },
    /// The audit chain could not be extended; tool execution is halted.
    AuditHalted { reason: String },
}

#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<SecurityEvent>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Emit an event to all subscribers. No receivers is fine.
    pub fn emit(&self, event: SecurityEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SecurityEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let broadcaster = EventBroadcaster::new();
        let mut rx = broadcaster.subscribe();

        broadcaster.emit(SecurityEvent::AuditHalted {
            reason: "disk full".to_string(),
        });

        match rx.recv().await.expect("event") {
            SecurityEvent::AuditHalted { reason } => assert_eq!(reason, "disk full"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let broadcaster = EventBroadcaster::new();
        broadcaster.emit(SecurityEvent::InjectionAlert {
            session_id: "s1".to_string(),
            fingerprint: "abcd".to_string(),
            location: "tool_args".to_string(),
        });
    }
}
