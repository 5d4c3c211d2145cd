use crate::agent::AgentConfig;
use crate::browser::BrowserConfig;
use crate::executor::ExecutorConfig;
use crate::llm::GatewayConfig;
use crate::task::TaskConfig;
use crate::transport::TransportConfig;

/// Every knob in one place. `Default` reads the `PAGEPILOT_*` environment
/// variables each component understands.
#[derive(Clone, Debug, Default)]
pub struct PilotConfig {
    pub agent: AgentConfig,
    pub gateway: GatewayConfig,
    pub transport: TransportConfig,
    pub executor: ExecutorConfig,
    pub task: TaskConfig,
    pub browser: BrowserConfig,
}

impl PilotConfig {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.agent.model = model.into();
        self
    }
}
