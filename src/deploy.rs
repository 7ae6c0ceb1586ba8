use anyhow::Result;
use serde::{Deserialize, Serialize};

/// One package to deploy.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeployItem {
    pub package_id: String,
    pub version: String,
}

/// The message handed to a remote deployment agent.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployMessage {
    pub api_key: Option<String>,
    pub want_reply: bool,
    pub from_spec: bool,
    pub items: Vec<DeployItem>,
    pub exclude_version: bool,
    pub prerelease: bool,
    pub contact: Option<String>,
    pub project: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployReply {
    pub body: Option<String>,
}

/// Transport seam for delivering a [`DeployMessage`] to a resolved endpoint.
/// Actual delivery is outside this crate; callers plug in their own bus.
pub trait BusDispatch {
    fn send(&self, endpoint: &str, message: &DeployMessage) -> Result<DeployReply>;
}

/// Discards every message. Stands in where no transport is wired up.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullDispatch;

impl BusDispatch for NullDispatch {
    fn send(&self, _endpoint: &str, _message: &DeployMessage) -> Result<DeployReply> {
        Ok(DeployReply::default())
    }
}
