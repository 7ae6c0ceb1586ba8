use crate::agent::DeployAgent;
use crate::registry::{add_or_update_indexed, Indexed};
use crate::settings::{
    Settings, CONFIG_SECTION, DEFAULT_DEPLOY_AGENT_KEY, DISABLED_PACKAGE_AGENTS, PACKAGE_AGENTS,
};
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;
use tracing::debug;

enum Source {
    /// A read-only settings store, e.g. an administrator-distributed
    /// defaults file.
    Store(Box<dyn Settings + Send + Sync>),
    /// A fixed list, mainly for tests and embedding.
    Fixed(Vec<DeployAgent>),
}

/// Built-in default agents. Injected into the registry rather than living as
/// a process-wide singleton; the underlying store is read at most once per
/// source lifetime and never written.
pub struct DefaultAgentSource {
    source: Source,
    agents: OnceLock<Vec<DeployAgent>>,
    deploy_endpoint: OnceLock<Option<String>>,
}

impl DefaultAgentSource {
    pub fn new(settings: impl Settings + Send + Sync + 'static) -> Self {
        Self {
            source: Source::Store(Box::new(settings)),
            agents: OnceLock::new(),
            deploy_endpoint: OnceLock::new(),
        }
    }

    /// No defaults at all.
    pub fn empty() -> Self {
        Self::from_agents(Vec::new())
    }

    pub fn from_agents(agents: Vec<DeployAgent>) -> Self {
        Self {
            source: Source::Fixed(agents),
            agents: OnceLock::new(),
            deploy_endpoint: OnceLock::new(),
        }
    }

    /// The default agents, de-duplicated by name with the usual capped
    /// protocol-version upgrade. Memoized on first use.
    pub fn agents(&self) -> &[DeployAgent] {
        self.agents.get_or_init(|| {
            let raw = match &self.source {
                Source::Fixed(agents) => agents.clone(),
                Source::Store(settings) => Self::read_store(settings.as_ref()),
            };
            let mut lookup: HashMap<String, Indexed> = HashMap::new();
            let mut index = 0;
            for agent in raw {
                let key = agent.name.to_lowercase();
                index = add_or_update_indexed(&mut lookup, index, agent, key);
            }
            let mut entries: Vec<Indexed> = lookup.into_values().collect();
            entries.sort_by_key(|e| e.index);
            let agents: Vec<DeployAgent> = entries.into_iter().map(|e| e.agent).collect();
            debug!(count = agents.len(), "loaded default agents");
            agents
        })
    }

    fn read_store(settings: &(dyn Settings + Send + Sync)) -> Vec<DeployAgent> {
        let disabled: HashSet<String> = settings
            .section(DISABLED_PACKAGE_AGENTS)
            .into_iter()
            .map(|item| item.key.to_lowercase())
            .collect();
        settings
            .section(PACKAGE_AGENTS)
            .into_iter()
            .map(|item| {
                let enabled = !disabled.contains(&item.key.to_lowercase());
                let mut agent = DeployAgent::official(&item.key, &item.value, enabled);
                if let Some(version) = item.protocol_version {
                    agent.protocol_version = version;
                }
                agent
            })
            .collect()
    }

    /// The administrator-provided default deploy target, if any.
    pub fn default_deploy_endpoint(&self) -> Option<&str> {
        self.deploy_endpoint
            .get_or_init(|| match &self.source {
                Source::Fixed(_) => None,
                Source::Store(settings) => settings
                    .section(CONFIG_SECTION)
                    .into_iter()
                    .find(|item| item.key == DEFAULT_DEPLOY_AGENT_KEY)
                    .map(|item| item.value),
            })
            .as_deref()
    }
}
