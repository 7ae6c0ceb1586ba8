use crate::settings::SettingItem;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Protocol version assumed when an entry carries none.
pub const DEFAULT_PROTOCOL_VERSION: u32 = 2;
/// Entries above this version never win a merge.
pub const MAX_SUPPORTED_PROTOCOL_VERSION: u32 = 3;

/// One named remote deployment target.
///
/// Identity (equality and hash) is the case-insensitive (name, endpoint)
/// pair only; enablement, flags and protocol version are payload and do not
/// affect it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeployAgent {
    pub name: String,
    pub endpoint: String,
    pub default_contact: Option<String>,
    pub is_enabled: bool,
    pub is_official: bool,
    pub is_machine_wide: bool,
    #[serde(default = "persistable_default")]
    is_persistable: bool,
    pub protocol_version: u32,
}

fn persistable_default() -> bool {
    true
}

impl DeployAgent {
    /// An enabled, unofficial, persistable agent at the default protocol
    /// version.
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            default_contact: None,
            is_enabled: true,
            is_official: false,
            is_machine_wide: false,
            is_persistable: true,
            protocol_version: DEFAULT_PROTOCOL_VERSION,
        }
    }

    /// A built-in default agent: official, never written back to user
    /// settings.
    pub fn official(name: impl Into<String>, endpoint: impl Into<String>, enabled: bool) -> Self {
        let mut agent = Self::new(name, endpoint);
        agent.is_enabled = enabled;
        agent.is_official = true;
        agent.is_persistable = false;
        agent
    }

    pub fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn with_contact(mut self, contact: impl Into<String>) -> Self {
        self.default_contact = Some(contact.into());
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.is_enabled = enabled;
        self
    }

    /// False means this record exists only in memory and must never reach
    /// the persisted agent section.
    pub fn is_persistable(&self) -> bool {
        self.is_persistable
    }

    /// The persisted form: name as key, endpoint as value, protocol version
    /// only when it differs from the default.
    pub(crate) fn as_item(&self) -> SettingItem {
        let item = SettingItem::new(&self.name, &self.endpoint);
        if self.protocol_version == DEFAULT_PROTOCOL_VERSION {
            item
        } else {
            item.with_protocol_version(self.protocol_version)
        }
    }
}

/// Name comparison is Unicode case-insensitive.
pub(crate) fn names_match(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

/// Endpoint comparison is ASCII case-insensitive, intentionally narrower
/// than name comparison.
pub(crate) fn endpoints_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

impl PartialEq for DeployAgent {
    fn eq(&self, other: &Self) -> bool {
        names_match(&self.name, &other.name) && endpoints_match(&self.endpoint, &other.endpoint)
    }
}

impl Eq for DeployAgent {}

impl Hash for DeployAgent {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.to_lowercase().hash(state);
        self.endpoint.to_ascii_lowercase().hash(state);
    }
}

impl fmt::Display for DeployAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.name, self.endpoint)
    }
}
