pub mod action;
pub mod agent;
pub mod browser;
pub mod config;
pub mod credentials;
pub mod driver;
pub mod error;
pub mod events;
pub mod executor;
pub mod llm;
pub mod page_scripts;
pub mod parse;
pub mod pilot;
pub mod resolver;
pub mod task;
pub mod transport;

pub use action::{Action, ModelTurn, ScrollDirection, TargetRef};
pub use agent::{Agent, AgentConfig, DefaultErrorClassifier, ErrorClassifier, NextAction};
pub use browser::{Browser, BrowserConfig};
pub use config::PilotConfig;
pub use credentials::{CredentialStore, EnvCredentials, StaticCredentials};
pub use error::{ActionError, AgentError, ParseError, ProviderError, ResolutionError, TransportError};
pub use events::{EventBus, PilotEvent};
pub use executor::{ActionExecutor, ExecutorConfig};
pub use llm::{AgentMode, Gateway, GatewayConfig, ModelGateway, ModelRegistry, ProviderKind};
pub use parse::{parse, parse_with_mode, ParseMode};
pub use pilot::Pilot;
pub use resolver::{Resolver, ResolverConfig, SelectorSource, Strategy};
pub use task::{ActionHandler, PageSnapshotSource, TaskConfig, TaskReport, TaskRunner, TaskStatus};
pub use transport::{CommandMessage, ExecutionContext, PageChannel, Transport, TransportConfig};
