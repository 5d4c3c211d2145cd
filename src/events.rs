//! Progress and error notifications.
//!
//! Long-running operations publish [`PilotEvent`]s on a broadcast channel.
//! Publishing never blocks and never fails when nobody is listening; a slow
//! subscriber only loses the oldest events.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::action::Action;

const CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PilotEvent {
    /// The gateway discarded a spurious `fail` reply and is asking again.
    RepairRetry { model: String, attempt: usize },
    /// A model reply could not be parsed; the loop will try again.
    ParseFailed { attempt: usize, reason: String },
    /// A provider error the loop recovers from.
    RecoverableError { attempt: usize, message: String },
    /// The loop gave up; the message is meant for the user.
    Exhausted { message: String },
    TransportRetry { method: String, attempt: usize, error: String },
    Reinjected { context: String },
    ActionStarted { action: Action },
    ActionFailed { action: Action, error: String },
}

#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<PilotEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PilotEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: PilotEvent) {
        let _ = self.tx.send(event);
    }
}
