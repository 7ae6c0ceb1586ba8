use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf};
use thiserror::Error;
use tokio::sync::broadcast;

/// Section holding the registered agent list (name -> endpoint, protocol version).
pub const PACKAGE_AGENTS: &str = "packageAgents";
/// Section holding the disabled-set overlay; presence of a name means disabled.
pub const DISABLED_PACKAGE_AGENTS: &str = "disabledPackageAgents";
/// Section holding at most one entry: the active agent (name -> endpoint).
pub const ACTIVE_PACKAGE_AGENT: &str = "activePackageAgent";
/// General configuration section.
pub const CONFIG_SECTION: &str = "config";
/// Key in [`CONFIG_SECTION`] naming the default deploy target.
pub const DEFAULT_DEPLOY_AGENT_KEY: &str = "DefaultDeployAgent";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    InvalidArgument(&'static str),
    #[error("section `{0}` can only be edited in a machine-wide layer")]
    ReadOnlyLayer(String),
    #[error("could not determine a user configuration directory")]
    NoConfigDir,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed settings file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("could not serialize settings")]
    Serialize(#[from] toml::ser::Error),
    #[error("file watcher error")]
    Watch(#[from] notify::Error),
}

/// Where a setting item came from: its layer priority (higher = closer to the
/// user) and whether the layer is machine-wide (never edited by this crate).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SettingOrigin {
    pub priority: i32,
    pub machine_wide: bool,
}

/// One keyed entry inside a settings section.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettingItem {
    pub key: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<u32>,
    #[serde(skip)]
    pub origin: Option<SettingOrigin>,
}

impl SettingItem {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            protocol_version: None,
            origin: None,
        }
    }

    pub fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = Some(version);
        self
    }

    /// Items are matched for update/removal by key and protocol version;
    /// value and origin are payload.
    pub(crate) fn same_entry(&self, other: &SettingItem) -> bool {
        self.key == other.key && self.protocol_version == other.protocol_version
    }
}

/// The capability surface the registry consumes. Layered stores implement
/// this; errors propagate to the registry's caller unwrapped.
pub trait Settings {
    /// All items of a section in layer order, each stamped with its origin.
    fn section(&self, name: &str) -> Vec<SettingItem>;
    /// Update the matching item in place in the writable layer that owns it,
    /// or insert into the closest-to-user writable layer.
    fn add_or_update(&self, section: &str, item: SettingItem) -> Result<(), ConfigError>;
    /// Remove the matching item from a writable layer.
    fn remove(&self, section: &str, item: &SettingItem) -> Result<(), ConfigError>;
    /// Flush pending mutations and notify subscribers.
    fn save_to_disk(&self) -> Result<(), ConfigError>;
    /// Change notification, fired on every successful save.
    fn subscribe(&self) -> broadcast::Receiver<()>;
}

struct MemLayer {
    origin: SettingOrigin,
    sections: BTreeMap<String, Vec<SettingItem>>,
}

/// Layer-faithful in-memory store. Backs tests and the empty default source.
pub struct InMemorySettings {
    layers: RwLock<Vec<MemLayer>>,
    tx: broadcast::Sender<()>,
}

impl InMemorySettings {
    /// A single writable user layer.
    pub fn new() -> Self {
        Self {
            layers: RwLock::new(vec![MemLayer {
                origin: SettingOrigin { priority: 0, machine_wide: false },
                sections: BTreeMap::new(),
            }]),
            tx: broadcast::channel(16).0,
        }
    }

    /// Append another layer; layer index is the order of these calls.
    pub fn with_layer(self, priority: i32, machine_wide: bool) -> Self {
        self.layers.write().push(MemLayer {
            origin: SettingOrigin { priority, machine_wide },
            sections: BTreeMap::new(),
        });
        self
    }

    /// Place an item directly into the first layer.
    pub fn seed(&self, section: &str, item: SettingItem) {
        self.seed_layer(0, section, item);
    }

    /// Place an item directly into a specific layer.
    pub fn seed_layer(&self, layer: usize, section: &str, item: SettingItem) {
        let mut layers = self.layers.write();
        layers[layer]
            .sections
            .entry(section.to_string())
            .or_default()
            .push(item);
    }
}

impl Default for InMemorySettings {
    fn default() -> Self {
        Self::new()
    }
}

impl Settings for InMemorySettings {
    fn section(&self, name: &str) -> Vec<SettingItem> {
        let layers = self.layers.read();
        let mut out = Vec::new();
        for layer in layers.iter() {
            if let Some(items) = layer.sections.get(name) {
                out.extend(items.iter().cloned().map(|mut it| {
                    it.origin = Some(layer.origin);
                    it
                }));
            }
        }
        out
    }

    fn add_or_update(&self, section: &str, item: SettingItem) -> Result<(), ConfigError> {
        let mut layers = self.layers.write();
        // update in place wherever a writable layer already holds the entry
        for layer in layers.iter_mut().filter(|l| !l.origin.machine_wide) {
            if let Some(items) = layer.sections.get_mut(section) {
                if let Some(existing) = items.iter_mut().find(|it| it.same_entry(&item)) {
                    existing.value = item.value;
                    existing.protocol_version = item.protocol_version;
                    return Ok(());
                }
            }
        }
        let target = layers
            .iter_mut()
            .filter(|l| !l.origin.machine_wide)
            .max_by_key(|l| l.origin.priority)
            .ok_or_else(|| ConfigError::ReadOnlyLayer(section.to_string()))?;
        target
            .sections
            .entry(section.to_string())
            .or_default()
            .push(item);
        Ok(())
    }

    fn remove(&self, section: &str, item: &SettingItem) -> Result<(), ConfigError> {
        let mut layers = self.layers.write();
        let mut removed = false;
        let mut machine_match = false;
        for layer in layers.iter_mut() {
            let Some(items) = layer.sections.get_mut(section) else {
                continue;
            };
            if layer.origin.machine_wide {
                machine_match |= items.iter().any(|it| it.same_entry(item));
                continue;
            }
            let before = items.len();
            items.retain(|it| !it.same_entry(item));
            removed |= items.len() != before;
        }
        if !removed && machine_match {
            return Err(ConfigError::ReadOnlyLayer(section.to_string()));
        }
        Ok(())
    }

    fn save_to_disk(&self) -> Result<(), ConfigError> {
        let _ = self.tx.send(());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }
}
