use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::Agent;
use crate::browser::Browser;
use crate::config::PilotConfig;
use crate::credentials::CredentialStore;
use crate::error::TransportError;
use crate::events::{EventBus, PilotEvent};
use crate::executor::ActionExecutor;
use crate::llm::{Gateway, GatewayConfig, ModelRegistry};
use crate::task::{PageSnapshotSource, TaskReport, TaskRunner};
use crate::transport::{PageChannel, Transport};

/// Snapshot text from the payload plus screenshots from the tab.
struct ChromiumSnapshots {
    browser: Arc<Browser>,
    channel: PageChannel,
}

#[async_trait]
impl PageSnapshotSource for ChromiumSnapshots {
    async fn snapshot(&self) -> Result<String, TransportError> {
        PageSnapshotSource::snapshot(&self.channel).await
    }

    async fn screenshot(&self) -> Option<String> {
        match self.browser.screenshot_data_url().await {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(error = %e, "screenshot failed; continuing without image");
                None
            }
        }
    }
}

/// A launched browser wired to a model gateway.
pub struct Pilot {
    browser: Arc<Browser>,
    gateway: Arc<Gateway>,
    executor: Arc<ActionExecutor>,
    snapshots: Arc<ChromiumSnapshots>,
    cfg: PilotConfig,
    events: EventBus,
}

impl Pilot {
    pub async fn launch(mut cfg: PilotConfig, credentials: Arc<dyn CredentialStore>) -> Result<Self> {
        let events = EventBus::new();
        let registry = Arc::new(ModelRegistry::new());
        let model = registry.best_matching_model(&cfg.agent.model, cfg.task.mode, credentials.as_ref());
        if model != cfg.agent.model {
            info!(requested = %cfg.agent.model, %model, "using best matching model");
            cfg.agent.model = model;
        }

        let gateway = Arc::new(
            Gateway::with_default_providers(
                registry,
                credentials,
                GatewayConfig {
                    parse_mode: cfg.agent.parse_mode,
                    ..cfg.gateway.clone()
                },
            )
            .with_events(events.clone()),
        );
        let browser = Arc::new(Browser::launch(cfg.browser.clone()).await?);
        let transport = Arc::new(Transport::new(cfg.transport.clone()).with_events(events.clone()));
        let channel = browser.channel(transport);
        let executor = Arc::new(
            ActionExecutor::new(browser.clone(), channel.clone(), cfg.executor.clone()).with_events(events.clone()),
        );
        let snapshots = Arc::new(ChromiumSnapshots {
            browser: browser.clone(),
            channel,
        });

        Ok(Self {
            browser,
            gateway,
            executor,
            snapshots,
            cfg,
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PilotEvent> {
        self.events.subscribe()
    }

    pub fn model(&self) -> &str {
        &self.cfg.agent.model
    }

    pub fn executor(&self) -> &ActionExecutor {
        &self.executor
    }

    pub fn browser(&self) -> &Browser {
        &self.browser
    }

    /// Open `start_url` (if any) and run the task to completion.
    pub async fn run_task(
        &self,
        start_url: Option<&str>,
        instructions: &str,
        cancel: CancellationToken,
    ) -> Result<TaskReport> {
        if let Some(url) = start_url {
            self.executor.navigate(url).await?;
        }
        let agent = Agent::new(self.gateway.clone(), self.cfg.agent.clone()).with_events(self.events.clone());
        let runner = TaskRunner::new(agent, self.executor.clone(), self.snapshots.clone(), self.cfg.task.clone())
            .with_cancellation(cancel);
        Ok(runner.run(instructions).await)
    }
}
