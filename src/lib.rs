pub mod agent;
pub mod defaults;
pub mod deploy;
pub mod layered_config;
pub mod registry;
pub mod resolve;
pub mod settings;

pub use agent::{DeployAgent, DEFAULT_PROTOCOL_VERSION, MAX_SUPPORTED_PROTOCOL_VERSION};
pub use defaults::DefaultAgentSource;
pub use deploy::{BusDispatch, DeployItem, DeployMessage, DeployReply, NullDispatch};
pub use layered_config::LayeredSettings;
pub use registry::AgentRegistry;
pub use resolve::{AgentLookup, AgentLookupExt};
pub use settings::{ConfigError, InMemorySettings, SettingItem, SettingOrigin, Settings};
