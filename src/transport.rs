//! Command transport into an in-page execution context.
//!
//! Every call verifies that the page payload answers a ping, injecting it and
//! waiting for the handshake when it does not. Calls to the same context are
//! serialized so two callers never race to inject. A failed attempt clears
//! the cached liveness so the next one verifies again.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::events::{EventBus, PilotEvent};

/// `{method, payload}` as delivered to the execution context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub method: String,
    pub payload: Vec<Value>,
}

impl CommandMessage {
    pub fn new(method: impl Into<String>, payload: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            payload,
        }
    }
}

/// The in-page environment that runs transport commands.
#[async_trait]
pub trait ExecutionContext: Send + Sync {
    /// Stable identifier for liveness bookkeeping.
    fn id(&self) -> &str;

    /// `true` when the payload is installed and answering.
    async fn ping(&self) -> Result<bool, TransportError>;

    /// (Re)install the payload.
    async fn inject(&self) -> Result<(), TransportError>;

    async fn dispatch(&self, message: &CommandMessage) -> Result<Value, TransportError>;
}

#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub max_attempts: usize,
    /// Applies to each attempt on its own, handshake included.
    pub call_timeout: Duration,
    pub handshake_interval: Duration,
    pub handshake_polls: usize,
    /// Delay after the first failure; doubles on every further one.
    pub backoff_base: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        let millis = |key: &str, default: u64| {
            Duration::from_millis(
                env::var(key)
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(default),
            )
        };
        Self {
            max_attempts: env::var("PAGEPILOT_TRANSPORT_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            call_timeout: millis("PAGEPILOT_CALL_TIMEOUT_MS", 10_000),
            handshake_interval: Duration::from_millis(500),
            handshake_polls: 6,
            backoff_base: millis("PAGEPILOT_BACKOFF_MS", 1_000),
        }
    }
}

impl TransportConfig {
    fn backoff(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as u32;
        self.backoff_base.saturating_mul(1u32 << exp)
    }
}

type Liveness = Arc<tokio::sync::Mutex<bool>>;

pub struct Transport {
    cfg: TransportConfig,
    contexts: Mutex<HashMap<String, Liveness>>,
    events: EventBus,
}

impl Transport {
    pub fn new(cfg: TransportConfig) -> Self {
        Self {
            cfg,
            contexts: Mutex::new(HashMap::new()),
            events: EventBus::new(),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    fn liveness(&self, context: &str) -> Liveness {
        self.contexts
            .lock()
            .entry(context.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(false)))
            .clone()
    }

    /// Forget that a context was alive, e.g. after it navigated away.
    pub async fn invalidate(&self, context: &str) {
        let slot = self.liveness(context);
        *slot.lock().await = false;
    }

    pub async fn call(
        &self,
        context: &dyn ExecutionContext,
        method: &str,
        payload: Vec<Value>,
    ) -> Result<Value, TransportError> {
        let message = CommandMessage::new(method, payload);
        let slot = self.liveness(context.id());
        let mut alive = slot.lock().await;
        let attempts = self.cfg.max_attempts.max(1);
        let mut last = TransportError::Context("no attempt was made".into());

        for attempt in 1..=attempts {
            let outcome = timeout(self.cfg.call_timeout, self.attempt(context, &message, &mut alive)).await;
            let err = match outcome {
                Ok(Ok(value)) => {
                    debug!(method, attempt, context = context.id(), "transport call ok");
                    return Ok(value);
                }
                Ok(Err(err)) => err,
                Err(_) => TransportError::Timeout {
                    method: method.to_string(),
                    after: self.cfg.call_timeout,
                },
            };
            *alive = false;
            warn!(method, attempt, context = context.id(), error = %err, "transport call failed");
            self.events.publish(PilotEvent::TransportRetry {
                method: method.to_string(),
                attempt,
                error: err.to_string(),
            });
            last = err;
            if attempt < attempts {
                sleep(self.cfg.backoff(attempt)).await;
            }
        }

        Err(TransportError::Exhausted {
            method: method.to_string(),
            attempts,
            last: Box::new(last),
        })
    }

    async fn attempt(
        &self,
        context: &dyn ExecutionContext,
        message: &CommandMessage,
        alive: &mut bool,
    ) -> Result<Value, TransportError> {
        if !*alive {
            if !context.ping().await.unwrap_or(false) {
                info!(context = context.id(), "injecting page payload");
                context.inject().await?;
                self.events.publish(PilotEvent::Reinjected {
                    context: context.id().to_string(),
                });
                self.await_handshake(context).await?;
            }
            *alive = true;
        }
        context.dispatch(message).await
    }

    async fn await_handshake(&self, context: &dyn ExecutionContext) -> Result<(), TransportError> {
        for _ in 0..self.cfg.handshake_polls.max(1) {
            sleep(self.cfg.handshake_interval).await;
            if context.ping().await.unwrap_or(false) {
                return Ok(());
            }
        }
        Err(TransportError::Handshake)
    }
}

/// A transport bound to one execution context.
#[derive(Clone)]
pub struct PageChannel {
    transport: Arc<Transport>,
    context: Arc<dyn ExecutionContext>,
}

impl PageChannel {
    pub fn new(transport: Arc<Transport>, context: Arc<dyn ExecutionContext>) -> Self {
        Self { transport, context }
    }

    pub async fn call(&self, method: &str, payload: Vec<Value>) -> Result<Value, TransportError> {
        self.transport.call(self.context.as_ref(), method, payload).await
    }

    pub async fn invalidate(&self) {
        self.transport.invalidate(self.context.id()).await
    }
}
