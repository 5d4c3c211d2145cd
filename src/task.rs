//! Closed-loop task execution: snapshot, decide, act, repeat.

use std::env;
use std::sync::Arc;

use async_trait::async_trait;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::action::{Action, ModelTurn};
use crate::agent::Agent;
use crate::error::{ActionError, AgentError, TransportError};
use crate::executor::ActionExecutor;
use crate::llm::{AgentMode, UsageStats};
use crate::transport::PageChannel;

/// The page-snapshot collaborator: a textual rendering of the page in which
/// every addressable element carries a [`crate::action::TargetRef`].
#[async_trait]
pub trait PageSnapshotSource: Send + Sync {
    async fn snapshot(&self) -> Result<String, TransportError>;

    /// Screenshot `data:` URL for vision turns, when the source can take one.
    async fn screenshot(&self) -> Option<String> {
        None
    }
}

#[async_trait]
impl PageSnapshotSource for PageChannel {
    async fn snapshot(&self) -> Result<String, TransportError> {
        let reply = self.call("snapshot", vec![]).await?;
        Ok(reply.as_str().unwrap_or_default().to_string())
    }
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(&self, action: &Action) -> Result<(), ActionError>;
}

#[async_trait]
impl ActionHandler for ActionExecutor {
    async fn execute(&self, action: &Action) -> Result<(), ActionError> {
        ActionExecutor::execute(self, action).await
    }
}

#[derive(Clone, Debug)]
pub struct TaskConfig {
    pub max_actions: usize,
    pub mode: AgentMode,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_actions: env::var("PAGEPILOT_MAX_ACTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(50),
            mode: match env::var("PAGEPILOT_VISION").as_deref() {
                Ok("1") | Ok("true") => AgentMode::VisionEnhanced,
                _ => AgentMode::Text,
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    Finished,
    Failed { reason: String },
    Cancelled,
    ActionBudgetExhausted,
    Error { message: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    pub index: usize,
    pub turn: ModelTurn,
    /// Set when the action ran and failed; the task carries on regardless.
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub run_id: String,
    pub instructions: String,
    pub status: TaskStatus,
    pub steps: Vec<TaskStep>,
    pub usage: Option<UsageStats>,
}

pub struct TaskRunner {
    agent: Agent,
    handler: Arc<dyn ActionHandler>,
    source: Arc<dyn PageSnapshotSource>,
    cfg: TaskConfig,
    cancel: CancellationToken,
}

impl TaskRunner {
    pub fn new(
        agent: Agent,
        handler: Arc<dyn ActionHandler>,
        source: Arc<dyn PageSnapshotSource>,
        cfg: TaskConfig,
    ) -> Self {
        Self {
            agent,
            handler,
            source,
            cfg,
            cancel: CancellationToken::new(),
        }
    }

    /// Share a token with the caller. The agent observes it as well.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.agent = self.agent.with_cancellation(token.clone());
        self.cancel = token;
        self
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(&self, instructions: &str) -> TaskReport {
        let run_id = nanoid!();
        let mut history: Vec<ModelTurn> = Vec::new();
        let mut steps = Vec::new();
        let mut usage = None;
        info!(%run_id, max_actions = self.cfg.max_actions, "task started");

        let status = 'run: {
            for index in 0..self.cfg.max_actions {
                if self.cancel.is_cancelled() {
                    break 'run TaskStatus::Cancelled;
                }

                let page = match self.source.snapshot().await {
                    Ok(page) => page,
                    Err(err) => {
                        break 'run TaskStatus::Error {
                            message: AgentError::Snapshot(err.to_string()).to_string(),
                        }
                    }
                };

                let screenshot = match self.cfg.mode {
                    AgentMode::VisionEnhanced => self.source.screenshot().await,
                    AgentMode::Text => None,
                };
                let next = match &screenshot {
                    Some(image) => {
                        self.agent
                            .determine_next_action_with_image(instructions, &history, &page, image, None)
                            .await
                    }
                    None => self.agent.determine_next_action(instructions, &history, &page, None).await,
                };

                let turn = match next {
                    Ok(next) => {
                        usage = UsageStats::merge(usage, next.usage);
                        next.turn
                    }
                    Err(AgentError::AttemptsExhausted { message, .. }) => {
                        warn!(%run_id, %message, "agent loop exhausted");
                        ModelTurn::max_retries()
                    }
                    Err(AgentError::Cancelled) => break 'run TaskStatus::Cancelled,
                    Err(err) => break 'run TaskStatus::Error { message: err.to_string() },
                };

                let mut step = TaskStep {
                    index,
                    turn: turn.clone(),
                    error: None,
                };
                match &turn.action {
                    Action::Finish => {
                        steps.push(step);
                        break 'run TaskStatus::Finished;
                    }
                    Action::Fail => {
                        steps.push(step);
                        break 'run TaskStatus::Failed { reason: turn.thought };
                    }
                    action => {
                        if let Err(err) = self.handler.execute(action).await {
                            step.error = Some(err.to_string());
                        }
                    }
                }
                steps.push(step);
                history.push(turn);
            }
            TaskStatus::ActionBudgetExhausted
        };

        info!(%run_id, steps = steps.len(), status = ?status, "task finished");
        TaskReport {
            run_id,
            instructions: instructions.to_string(),
            status,
            steps,
            usage,
        }
    }
}
