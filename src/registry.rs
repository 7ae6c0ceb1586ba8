use crate::agent::{
    endpoints_match, names_match, DeployAgent, DEFAULT_PROTOCOL_VERSION,
    MAX_SUPPORTED_PROTOCOL_VERSION,
};
use crate::defaults::DefaultAgentSource;
use crate::resolve::AgentLookup;
use crate::settings::{
    ConfigError, SettingItem, Settings, ACTIVE_PACKAGE_AGENT, CONFIG_SECTION,
    DEFAULT_DEPLOY_AGENT_KEY, DISABLED_PACKAGE_AGENTS, PACKAGE_AGENTS,
};
use std::collections::{HashMap, HashSet};
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub(crate) struct Indexed {
    pub(crate) index: usize,
    pub(crate) agent: DeployAgent,
}

/// Insert `agent` under `key` at the next index, or upgrade the stored entry
/// in place when the incoming protocol version is strictly higher and still
/// supported. The stored index never moves.
pub(crate) fn add_or_update_indexed(
    lookup: &mut HashMap<String, Indexed>,
    next_index: usize,
    agent: DeployAgent,
    key: String,
) -> usize {
    match lookup.get_mut(&key) {
        None => {
            lookup.insert(key, Indexed { index: next_index, agent });
            next_index + 1
        }
        Some(existing) => {
            if existing.agent.protocol_version < agent.protocol_version
                && agent.protocol_version <= MAX_SUPPORTED_PROTOCOL_VERSION
            {
                existing.agent = agent;
            }
            next_index
        }
    }
}

fn into_ordered(lookup: HashMap<String, Indexed>) -> Vec<DeployAgent> {
    let mut entries: Vec<Indexed> = lookup.into_values().collect();
    entries.sort_by_key(|e| e.index);
    entries.into_iter().map(|e| e.agent).collect()
}

/// The agent registry: merges the layered agent section with the disabled-set
/// overlay and the injected defaults, and writes mutations back through the
/// settings capability.
///
/// Every read goes to the settings store; nothing is cached between calls.
/// Mutations accumulate a dirty flag and perform exactly one save plus one
/// change notification per top-level operation. Concurrent registries over
/// the same store are not coordinated.
pub struct AgentRegistry<S: Settings> {
    settings: S,
    defaults: DefaultAgentSource,
    tx: broadcast::Sender<()>,
}

impl<S: Settings> AgentRegistry<S> {
    /// A registry with no built-in default agents.
    pub fn new(settings: S) -> Self {
        Self::with_defaults(settings, DefaultAgentSource::empty())
    }

    pub fn with_defaults(settings: S, defaults: DefaultAgentSource) -> Self {
        Self {
            settings,
            defaults,
            tx: broadcast::channel(16).0,
        }
    }

    pub fn settings(&self) -> &S {
        &self.settings
    }

    /// Fired synchronously after every successful mutation.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    fn notify(&self) {
        let _ = self.tx.send(());
    }

    /// Save and notify once, iff anything changed.
    fn finish(&self, dirty: &mut bool) -> Result<(), ConfigError> {
        if *dirty {
            self.settings.save_to_disk()?;
            self.notify();
            *dirty = false;
        }
        Ok(())
    }

    // ---- read path ----

    fn disabled_names(&self) -> HashSet<String> {
        self.settings
            .section(DISABLED_PACKAGE_AGENTS)
            .into_iter()
            .map(|item| item.key.to_lowercase())
            .collect()
    }

    fn read_agent(&self, item: &SettingItem, enabled: bool) -> DeployAgent {
        let mut agent = DeployAgent::new(&item.key, &item.value)
            .enabled(enabled)
            .with_protocol_version(item.protocol_version.unwrap_or(DEFAULT_PROTOCOL_VERSION));
        agent.is_machine_wide = item.origin.is_some_and(|o| o.machine_wide);
        agent
    }

    /// Keyed merge over the raw agent entries, closest-to-user layers first.
    fn lookup(&self, by_name: bool) -> HashMap<String, Indexed> {
        let mut items = self.settings.section(PACKAGE_AGENTS);
        items.sort_by_key(|item| {
            std::cmp::Reverse(item.origin.map(|o| o.priority).unwrap_or_default())
        });

        let disabled = self.disabled_names();
        let mut lookup = HashMap::new();
        let mut index = 0;
        for item in &items {
            let enabled = !disabled.contains(&item.key.to_lowercase());
            let agent = self.read_agent(item, enabled);
            let key = if by_name {
                agent.name.to_lowercase()
            } else {
                agent.endpoint.to_ascii_lowercase()
            };
            index = add_or_update_indexed(&mut lookup, index, agent, key);
        }
        lookup
    }

    /// The effective agent list: merged persisted entries in first-seen
    /// order, plus any non-colliding defaults.
    pub fn load_agents(&self) -> Vec<DeployAgent> {
        let mut agents = into_ordered(self.lookup(true));
        if !self.defaults.agents().is_empty() {
            self.inject_defaults(&mut agents);
        }
        debug!(count = agents.len(), "loaded agents");
        agents
    }

    /// Defaults whose name and endpoint both avoid the loaded set go in just
    /// before the first machine-wide entry, or at the end.
    fn inject_defaults(&self, agents: &mut Vec<DeployAgent>) {
        let to_add: Vec<DeployAgent> = self
            .defaults
            .agents()
            .iter()
            .filter(|default| {
                !agents.iter().any(|a| {
                    endpoints_match(&a.endpoint, &default.endpoint)
                        || names_match(&a.name, &default.name)
                })
            })
            .cloned()
            .collect();

        let at = agents
            .iter()
            .position(|a| a.is_machine_wide)
            .unwrap_or(agents.len());
        agents.splice(at..at, to_add);
    }

    fn find(&self, key: &str, by_name: bool) -> Option<DeployAgent> {
        let lookup = self.lookup(by_name);
        let normalized = if by_name {
            key.to_lowercase()
        } else {
            key.to_ascii_lowercase()
        };
        if let Some(entry) = lookup.get(&normalized) {
            return Some(entry.agent.clone());
        }
        // fall back to a default matching the requested key; it is returned
        // as-is and never persisted
        self.defaults
            .agents()
            .iter()
            .find(|d| names_match(&d.name, key) || endpoints_match(&d.endpoint, key))
            .cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Result<Option<DeployAgent>, ConfigError> {
        if name.is_empty() {
            return Err(ConfigError::InvalidArgument("name"));
        }
        Ok(self.find(name, true))
    }

    pub fn get_by_endpoint(&self, endpoint: &str) -> Result<Option<DeployAgent>, ConfigError> {
        if endpoint.is_empty() {
            return Err(ConfigError::InvalidArgument("endpoint"));
        }
        Ok(self.find(endpoint, false))
    }

    /// Enablement comes from the disabled-set overlay alone; the name does
    /// not have to exist as a configured agent.
    pub fn is_enabled(&self, name: &str) -> Result<bool, ConfigError> {
        if name.is_empty() {
            return Err(ConfigError::InvalidArgument("name"));
        }
        let disabled = self
            .settings
            .section(DISABLED_PACKAGE_AGENTS)
            .into_iter()
            .any(|item| names_match(&item.key, name));
        Ok(!disabled)
    }

    /// The configured default deploy target, falling back to the injected
    /// defaults.
    pub fn default_deploy_endpoint(&self) -> Option<String> {
        self.settings
            .section(CONFIG_SECTION)
            .into_iter()
            .find(|item| item.key == DEFAULT_DEPLOY_AGENT_KEY)
            .map(|item| item.value)
            .or_else(|| self.defaults.default_deploy_endpoint().map(str::to_string))
    }

    // ---- mutation path ----

    pub fn add(&self, agent: &DeployAgent) -> Result<(), ConfigError> {
        let mut dirty = false;
        self.add_inner(agent, &mut dirty)?;
        self.finish(&mut dirty)
    }

    fn add_inner(&self, agent: &DeployAgent, dirty: &mut bool) -> Result<(), ConfigError> {
        if agent.is_persistable() {
            self.settings.add_or_update(PACKAGE_AGENTS, agent.as_item())?;
            *dirty = true;
        }
        if agent.is_enabled {
            self.remove_disabled_inner(&agent.name, dirty)
        } else {
            self.add_disabled_inner(&agent.name, dirty)
        }
    }

    /// Removes every persisted entry matching the name, best effort: one
    /// entry failing to go (e.g. it lives in a machine-wide layer) does not
    /// stop the rest.
    pub fn remove(&self, name: &str) -> Result<(), ConfigError> {
        if name.is_empty() {
            return Err(ConfigError::InvalidArgument("name"));
        }
        let mut dirty = false;
        self.remove_inner(name, &mut dirty)?;
        self.finish(&mut dirty)
    }

    fn remove_inner(&self, name: &str, dirty: &mut bool) -> Result<(), ConfigError> {
        for item in self
            .settings
            .section(PACKAGE_AGENTS)
            .into_iter()
            .filter(|item| names_match(&item.key, name))
        {
            match self.settings.remove(PACKAGE_AGENTS, &item) {
                Ok(()) => *dirty = true,
                Err(err) => warn!(agent = %item.key, %err, "skipping entry that could not be removed"),
            }
        }
        self.remove_disabled_inner(name, dirty)
    }

    pub fn enable(&self, name: &str) -> Result<(), ConfigError> {
        if name.is_empty() {
            return Err(ConfigError::InvalidArgument("name"));
        }
        let mut dirty = false;
        self.remove_disabled_inner(name, &mut dirty)?;
        self.finish(&mut dirty)
    }

    pub fn disable(&self, name: &str) -> Result<(), ConfigError> {
        if name.is_empty() {
            return Err(ConfigError::InvalidArgument("name"));
        }
        let mut dirty = false;
        self.add_disabled_inner(name, &mut dirty)?;
        self.finish(&mut dirty)
    }

    fn add_disabled_inner(&self, name: &str, dirty: &mut bool) -> Result<(), ConfigError> {
        // the value is a marker; only the key's presence matters
        self.settings
            .add_or_update(DISABLED_PACKAGE_AGENTS, SettingItem::new(name, "true"))?;
        *dirty = true;
        Ok(())
    }

    fn remove_disabled_inner(&self, name: &str, dirty: &mut bool) -> Result<(), ConfigError> {
        for item in self
            .settings
            .section(DISABLED_PACKAGE_AGENTS)
            .into_iter()
            .filter(|item| names_match(&item.key, name))
        {
            self.settings.remove(DISABLED_PACKAGE_AGENTS, &item)?;
            *dirty = true;
        }
        Ok(())
    }

    /// Writable (non-machine-wide) persisted entries keyed by lowercased
    /// name; the last entry for a name wins.
    fn existing_settings_lookup(&self) -> HashMap<String, SettingItem> {
        let mut lookup = HashMap::new();
        for item in self
            .settings
            .section(PACKAGE_AGENTS)
            .into_iter()
            .filter(|item| !item.origin.is_some_and(|o| o.machine_wide))
        {
            lookup.insert(item.key.to_lowercase(), item);
        }
        lookup
    }

    /// Update the persisted entry matching `agent.name`. Absent entries make
    /// this a silent no-op.
    pub fn update(&self, agent: &DeployAgent, update_enabled: bool) -> Result<(), ConfigError> {
        let existing = self.existing_settings_lookup();
        let Some(existing_item) = existing.get(&agent.name.to_lowercase()) else {
            return Ok(());
        };

        let disabled_item = if update_enabled {
            self.settings
                .section(DISABLED_PACKAGE_AGENTS)
                .into_iter()
                .find(|item| names_match(&item.key, &existing_item.key))
        } else {
            None
        };

        let old = self.read_agent(existing_item, disabled_item.is_none());
        let mut dirty = false;
        self.update_inner(agent, &old, disabled_item.as_ref(), update_enabled, &mut dirty)?;
        self.finish(&mut dirty)
    }

    fn update_inner(
        &self,
        new: &DeployAgent,
        old: &DeployAgent,
        disabled_item: Option<&SettingItem>,
        update_enabled: bool,
        dirty: &mut bool,
    ) -> Result<(), ConfigError> {
        // a located record under a different name is left untouched; renames
        // are not an update
        if !names_match(&new.name, &old.name) {
            return Ok(());
        }

        if (!endpoints_match(&new.endpoint, &old.endpoint)
            || new.protocol_version != old.protocol_version)
            && new.is_persistable()
        {
            self.settings.add_or_update(PACKAGE_AGENTS, new.as_item())?;
            *dirty = true;
        }

        if update_enabled {
            if new.is_enabled {
                if let Some(item) = disabled_item {
                    self.settings.remove(DISABLED_PACKAGE_AGENTS, item)?;
                    *dirty = true;
                }
            } else if disabled_item.is_none() {
                self.add_disabled_inner(&new.name, dirty)?;
            }
        }
        Ok(())
    }

    /// Authoritative reconciliation: after this call the persisted set
    /// equals exactly `agents`. Entries not named in the input are removed
    /// from both the agent section and the disabled set. One save, one
    /// notification.
    pub fn save_all(&self, agents: &[DeployAgent]) -> Result<(), ConfigError> {
        let mut dirty = false;
        let mut existing = self.existing_settings_lookup();
        let disabled_lookup: HashMap<String, SettingItem> = self
            .settings
            .section(DISABLED_PACKAGE_AGENTS)
            .into_iter()
            .map(|item| (item.key.to_lowercase(), item))
            .collect();

        for agent in agents {
            let key = agent.name.to_lowercase();
            let disabled_item = disabled_lookup.get(&key);
            match existing.get(&key) {
                Some(item)
                    if item.protocol_version.unwrap_or(DEFAULT_PROTOCOL_VERSION)
                        == agent.protocol_version =>
                {
                    let old = self.read_agent(item, disabled_item.is_none());
                    self.update_inner(agent, &old, disabled_item, true, &mut dirty)?;
                }
                _ => self.add_inner(agent, &mut dirty)?,
            }
            existing.remove(&key);
        }

        // anything left was not in the incoming set
        for (key, item) in existing {
            if let Some(disabled) = disabled_lookup.get(&key) {
                self.settings.remove(DISABLED_PACKAGE_AGENTS, disabled)?;
                dirty = true;
            }
            self.settings.remove(PACKAGE_AGENTS, &item)?;
            dirty = true;
        }

        self.finish(&mut dirty)
    }

    // ---- active agent ----

    pub fn active_agent_name(&self) -> Option<String> {
        self.settings
            .section(ACTIVE_PACKAGE_AGENT)
            .into_iter()
            .next()
            .map(|item| item.key)
    }

    /// Best effort: active-agent tracking is advisory and must never abort a
    /// calling workflow, so every failure is swallowed.
    pub fn save_active_agent(&self, agent: &DeployAgent) {
        if let Err(err) = self.try_save_active(agent) {
            warn!(agent = %agent.name, %err, "failed to persist active agent");
        }
    }

    fn try_save_active(&self, agent: &DeployAgent) -> Result<(), ConfigError> {
        for item in self.settings.section(ACTIVE_PACKAGE_AGENT) {
            self.settings.remove(ACTIVE_PACKAGE_AGENT, &item)?;
        }
        self.settings
            .add_or_update(ACTIVE_PACKAGE_AGENT, SettingItem::new(&agent.name, &agent.endpoint))?;
        self.settings.save_to_disk()
    }
}

impl<S: Settings> AgentLookup for AgentRegistry<S> {
    fn load_agents(&self) -> Vec<DeployAgent> {
        AgentRegistry::load_agents(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::InMemorySettings;

    fn agent_item(name: &str, endpoint: &str) -> SettingItem {
        SettingItem::new(name, endpoint)
    }

    fn registry(settings: InMemorySettings) -> AgentRegistry<InMemorySettings> {
        AgentRegistry::new(settings)
    }

    fn names(agents: &[DeployAgent]) -> Vec<&str> {
        agents.iter().map(|a| a.name.as_str()).collect()
    }

    #[test]
    fn merge_keeps_first_seen_order() {
        let s = InMemorySettings::new();
        s.seed(PACKAGE_AGENTS, agent_item("b", "https://b.example/"));
        s.seed(PACKAGE_AGENTS, agent_item("a", "https://a.example/"));
        s.seed(PACKAGE_AGENTS, agent_item("c", "https://c.example/"));
        let agents = registry(s).load_agents();
        assert_eq!(names(&agents), ["b", "a", "c"]);
    }

    #[test]
    fn higher_protocol_version_replaces_in_place() {
        let s = InMemorySettings::new();
        s.seed(PACKAGE_AGENTS, agent_item("a", "https://v2.example/"));
        s.seed(PACKAGE_AGENTS, agent_item("b", "https://b.example/"));
        s.seed(
            PACKAGE_AGENTS,
            agent_item("A", "https://v3.example/").with_protocol_version(3),
        );
        let agents = registry(s).load_agents();
        assert_eq!(names(&agents), ["A", "b"]);
        assert_eq!(agents[0].endpoint, "https://v3.example/");
        assert_eq!(agents[0].protocol_version, 3);
    }

    #[test]
    fn equal_or_lower_version_never_replaces() {
        let s = InMemorySettings::new();
        s.seed(
            PACKAGE_AGENTS,
            agent_item("a", "https://v3.example/").with_protocol_version(3),
        );
        s.seed(PACKAGE_AGENTS, agent_item("a", "https://v2.example/"));
        let agents = registry(s).load_agents();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].endpoint, "https://v3.example/");
    }

    #[test]
    fn unsupported_version_never_wins() {
        let s = InMemorySettings::new();
        s.seed(PACKAGE_AGENTS, agent_item("a", "https://v2.example/"));
        s.seed(
            PACKAGE_AGENTS,
            agent_item("a", "https://v9.example/").with_protocol_version(9),
        );
        let agents = registry(s).load_agents();
        assert_eq!(agents[0].endpoint, "https://v2.example/");
    }

    #[test]
    fn user_layers_take_precedence_over_machine_layers() {
        let s = InMemorySettings::new().with_layer(-10, true);
        s.seed_layer(1, PACKAGE_AGENTS, agent_item("a", "https://machine.example/"));
        s.seed(PACKAGE_AGENTS, agent_item("a", "https://user.example/"));
        let agents = registry(s).load_agents();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].endpoint, "https://user.example/");
        assert!(!agents[0].is_machine_wide);
    }

    #[test]
    fn enablement_is_overlay_driven() {
        let s = InMemorySettings::new();
        s.seed(PACKAGE_AGENTS, agent_item("a", "https://a.example/"));
        s.seed(DISABLED_PACKAGE_AGENTS, SettingItem::new("A", "whatever"));
        // a name that is not a configured agent at all
        s.seed(DISABLED_PACKAGE_AGENTS, SettingItem::new("ghost", "1"));
        let r = registry(s);

        assert!(!r.is_enabled("a").unwrap());
        assert!(!r.is_enabled("ghost").unwrap());
        assert!(r.is_enabled("b").unwrap());
        assert!(!r.load_agents()[0].is_enabled);
    }

    #[test]
    fn empty_keys_are_rejected_before_io() {
        let r = registry(InMemorySettings::new());
        assert!(matches!(r.get_by_name(""), Err(ConfigError::InvalidArgument(_))));
        assert!(matches!(r.get_by_endpoint(""), Err(ConfigError::InvalidArgument(_))));
        assert!(matches!(r.is_enabled(""), Err(ConfigError::InvalidArgument(_))));
        assert!(matches!(r.remove(""), Err(ConfigError::InvalidArgument(_))));
        assert!(matches!(r.enable(""), Err(ConfigError::InvalidArgument(_))));
        assert!(matches!(r.disable(""), Err(ConfigError::InvalidArgument(_))));
    }

    #[test]
    fn default_injection_skips_name_or_endpoint_collisions() {
        let s = InMemorySettings::new();
        s.seed(PACKAGE_AGENTS, agent_item("official", "https://example.org/feed"));
        let defaults = DefaultAgentSource::from_agents(vec![DeployAgent::official(
            "Official",
            "https://other.example/",
            true,
        )]);
        let agents = AgentRegistry::with_defaults(s, defaults).load_agents();
        // name collides case-insensitively; the default stays out
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].endpoint, "https://example.org/feed");
    }

    #[test]
    fn endpoint_collision_also_blocks_injection() {
        let s = InMemorySettings::new();
        s.seed(PACKAGE_AGENTS, agent_item("mine", "https://example.org/feed"));
        let defaults = DefaultAgentSource::from_agents(vec![DeployAgent::official(
            "official",
            "HTTPS://EXAMPLE.ORG/FEED",
            true,
        )]);
        let agents = AgentRegistry::with_defaults(s, defaults).load_agents();
        assert_eq!(names(&agents), ["mine"]);
    }

    #[test]
    fn defaults_go_before_the_first_machine_wide_entry() {
        let s = InMemorySettings::new().with_layer(-10, true);
        s.seed(PACKAGE_AGENTS, agent_item("user", "https://user.example/"));
        s.seed_layer(1, PACKAGE_AGENTS, agent_item("machine", "https://machine.example/"));
        let defaults = DefaultAgentSource::from_agents(vec![DeployAgent::official(
            "official",
            "https://example.org/feed",
            true,
        )]);
        let agents = AgentRegistry::with_defaults(s, defaults).load_agents();
        assert_eq!(names(&agents), ["user", "official", "machine"]);
    }

    #[test]
    fn defaults_append_when_nothing_is_machine_wide() {
        let defaults = DefaultAgentSource::from_agents(vec![DeployAgent::official(
            "official",
            "https://example.org/feed",
            true,
        )]);
        let agents = AgentRegistry::with_defaults(InMemorySettings::new(), defaults).load_agents();
        assert_eq!(agents.len(), 1);
        assert!(agents[0].is_official);
        assert!(!agents[0].is_persistable());
    }

    #[test]
    fn lookup_falls_back_to_defaults_without_persisting() {
        let defaults = DefaultAgentSource::from_agents(vec![DeployAgent::official(
            "official",
            "https://example.org/feed",
            true,
        )]);
        let r = AgentRegistry::with_defaults(InMemorySettings::new(), defaults);

        let by_name = r.get_by_name("OFFICIAL").unwrap().unwrap();
        assert_eq!(by_name.endpoint, "https://example.org/feed");
        let by_endpoint = r.get_by_endpoint("https://example.org/feed").unwrap().unwrap();
        assert_eq!(by_endpoint.name, "official");
        assert!(r.settings().section(PACKAGE_AGENTS).is_empty());
    }

    #[test]
    fn add_then_get_round_trips() {
        let r = registry(InMemorySettings::new());
        let agent = DeployAgent::new("internal", "https://agents.corp/feed")
            .with_protocol_version(3);
        r.add(&agent).unwrap();

        let got = r.get_by_name("Internal").unwrap().unwrap();
        assert_eq!(got, agent);
        assert_eq!(got.protocol_version, 3);

        r.remove("internal").unwrap();
        assert!(r.get_by_name("internal").unwrap().is_none());
        assert!(r.settings().section(DISABLED_PACKAGE_AGENTS).is_empty());
    }

    #[test]
    fn adding_a_disabled_agent_records_the_overlay() {
        let r = registry(InMemorySettings::new());
        r.add(&DeployAgent::new("a", "https://a.example/").enabled(false))
            .unwrap();
        assert!(!r.is_enabled("a").unwrap());
        // re-adding enabled clears the overlay entry
        r.add(&DeployAgent::new("a", "https://a.example/")).unwrap();
        assert!(r.is_enabled("a").unwrap());
        assert!(r.settings().section(DISABLED_PACKAGE_AGENTS).is_empty());
    }

    #[test]
    fn non_persistable_agents_never_reach_the_agent_section() {
        let r = registry(InMemorySettings::new());
        r.add(&DeployAgent::official("official", "https://example.org/feed", true))
            .unwrap();
        assert!(r.settings().section(PACKAGE_AGENTS).is_empty());
    }

    #[test]
    fn enable_and_disable_are_idempotent() {
        let r = registry(InMemorySettings::new());
        r.disable("a").unwrap();
        r.disable("a").unwrap();
        assert_eq!(r.settings().section(DISABLED_PACKAGE_AGENTS).len(), 1);

        r.enable("a").unwrap();
        r.enable("a").unwrap();
        assert!(r.settings().section(DISABLED_PACKAGE_AGENTS).is_empty());
    }

    #[test]
    fn remove_is_best_effort_across_layers() {
        let s = InMemorySettings::new().with_layer(-10, true);
        s.seed(PACKAGE_AGENTS, agent_item("a", "https://user.example/"));
        s.seed_layer(1, PACKAGE_AGENTS, agent_item("A", "https://machine.example/"));
        let r = registry(s);

        r.remove("a").unwrap();
        // the user entry is gone; the machine-wide one could not be touched
        let left = r.settings().section(PACKAGE_AGENTS);
        assert_eq!(left.len(), 1);
        assert!(left[0].origin.unwrap().machine_wide);
    }

    #[test]
    fn update_of_an_unknown_agent_is_a_silent_no_op() {
        let r = registry(InMemorySettings::new());
        let mut rx = r.subscribe();
        r.update(&DeployAgent::new("ghost", "https://ghost.example/"), true)
            .unwrap();
        assert!(rx.try_recv().is_err());
        assert!(r.settings().section(PACKAGE_AGENTS).is_empty());
    }

    #[test]
    fn update_rewrites_endpoint_and_reconciles_enablement() {
        let r = registry(InMemorySettings::new());
        r.add(&DeployAgent::new("a", "https://old.example/")).unwrap();

        r.update(
            &DeployAgent::new("a", "https://new.example/").enabled(false),
            true,
        )
        .unwrap();

        let got = r.get_by_name("a").unwrap().unwrap();
        assert_eq!(got.endpoint, "https://new.example/");
        assert!(!r.is_enabled("a").unwrap());
    }

    #[test]
    fn update_ignores_enablement_when_not_requested() {
        let r = registry(InMemorySettings::new());
        r.add(&DeployAgent::new("a", "https://a.example/")).unwrap();
        r.update(&DeployAgent::new("a", "https://a.example/").enabled(false), false)
            .unwrap();
        assert!(r.is_enabled("a").unwrap());
    }

    // Documented quirk, not a contract: when the located record's name does
    // not match the incoming one, the whole update silently does nothing.
    #[test]
    fn update_with_mismatched_names_is_a_quirky_no_op() {
        let r = registry(InMemorySettings::new());
        let old = DeployAgent::new("a", "https://a.example/");
        let new = DeployAgent::new("b", "https://b.example/");
        let mut dirty = false;
        r.update_inner(&new, &old, None, true, &mut dirty).unwrap();
        assert!(!dirty);
    }

    #[test]
    fn save_all_is_authoritative() {
        let r = registry(InMemorySettings::new());
        r.add(&DeployAgent::new("a", "https://a.example/")).unwrap();
        r.add(&DeployAgent::new("b", "https://b.example/").enabled(false))
            .unwrap();
        r.add(&DeployAgent::new("c", "https://c.example/")).unwrap();

        let a2 = DeployAgent::new("a", "https://a2.example/");
        let c = DeployAgent::new("c", "https://c.example/");
        r.save_all(&[a2.clone(), c]).unwrap();

        let agents = r.load_agents();
        assert_eq!(names(&agents), ["a", "c"]);
        assert_eq!(agents[0].endpoint, "https://a2.example/");
        // b disappears from both sections
        assert!(r.get_by_name("b").unwrap().is_none());
        assert!(r.settings().section(DISABLED_PACKAGE_AGENTS).is_empty());
    }

    #[test]
    fn save_all_fires_a_single_notification() {
        let r = registry(InMemorySettings::new());
        r.add(&DeployAgent::new("a", "https://a.example/")).unwrap();

        let mut rx = r.subscribe();
        r.save_all(&[
            DeployAgent::new("a", "https://changed.example/"),
            DeployAgent::new("d", "https://d.example/"),
        ])
        .unwrap();

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn every_successful_mutation_notifies_once() {
        let r = registry(InMemorySettings::new());
        let mut rx = r.subscribe();

        r.add(&DeployAgent::new("a", "https://a.example/")).unwrap();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        r.disable("a").unwrap();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        // enabling an already-enabled name changes nothing and stays silent
        r.enable("b").unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn active_agent_is_a_singleton() {
        let r = registry(InMemorySettings::new());
        r.save_active_agent(&DeployAgent::new("a", "https://a.example/"));
        r.save_active_agent(&DeployAgent::new("b", "https://b.example/"));

        assert_eq!(r.active_agent_name().as_deref(), Some("b"));
        let section = r.settings().section(ACTIVE_PACKAGE_AGENT);
        assert_eq!(section.len(), 1);
        assert_eq!(section[0].value, "https://b.example/");
    }

    #[test]
    fn default_deploy_endpoint_prefers_configured_value() {
        let s = InMemorySettings::new();
        s.seed(
            CONFIG_SECTION,
            SettingItem::new(DEFAULT_DEPLOY_AGENT_KEY, "https://configured.example/"),
        );
        let defaults = DefaultAgentSource::from_agents(vec![]);
        let r = AgentRegistry::with_defaults(s, defaults);
        assert_eq!(
            r.default_deploy_endpoint().as_deref(),
            Some("https://configured.example/")
        );
    }

    // a persisted agent shadows an identical default, and an empty store
    // surfaces the default itself
    #[test]
    fn persisted_agent_shadows_identical_default() {
        let s = InMemorySettings::new();
        s.seed(PACKAGE_AGENTS, agent_item("official", "https://example.org/feed"));
        let defaults = DefaultAgentSource::from_agents(vec![DeployAgent::official(
            "official",
            "https://example.org/feed",
            true,
        )]);
        let r = AgentRegistry::with_defaults(s, defaults);

        let agents = r.load_agents();
        assert_eq!(agents.len(), 1);
        assert!(agents[0].is_persistable());

        let empty = AgentRegistry::with_defaults(
            InMemorySettings::new(),
            DefaultAgentSource::from_agents(vec![DeployAgent::official(
                "official",
                "https://example.org/feed",
                true,
            )]),
        );
        let agents = empty.load_agents();
        assert_eq!(agents.len(), 1);
        assert!(!agents[0].is_persistable());
    }
}
