//! Layers, identities and the persisted policy shape.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Write/read scope of a chunk, ordered from narrowest to broadest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    /// Private to one agent inside one project
    ProjectAgent,
    /// Shared by every agent of a project
    ProjectGlobal,
    /// Private to one agent across projects
    UserAgent,
    /// Shared by every agent across projects
    UserGlobal,
}

impl Layer {
    /// All layers in read precedence order (narrowest first).
    pub const ALL: [Layer; 4] = [
        Layer::ProjectAgent,
        Layer::ProjectGlobal,
        Layer::UserAgent,
        Layer::UserGlobal,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::ProjectAgent => "project_agent",
            Self::ProjectGlobal => "project_global",
            Self::UserAgent => "user_agent",
            Self::UserGlobal => "user_global",
        }
    }

    /// Whether partitions of this layer are owned by a single agent.
    pub fn is_agent_scoped(&self) -> bool {
        matches!(self, Self::ProjectAgent | Self::UserAgent)
    }

    /// Which root the layer's partitions live under.
    pub fn scope(&self) -> Scope {
        match self {
            Self::ProjectAgent | Self::ProjectGlobal => Scope::Project,
            Self::UserAgent | Self::UserGlobal => Scope::User,
        }
    }

    /// Breadth rank, 0 being the narrowest layer.
    pub fn breadth(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Layer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "project_agent" => Ok(Self::ProjectAgent),
            "project_global" => Ok(Self::ProjectGlobal),
            "user_agent" => Ok(Self::UserAgent),
            "user_global" => Ok(Self::UserGlobal),
            other => Err(Error::validation(format!("unknown layer: {}", other))),
        }
    }
}

/// Physical root a layer is stored under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Project,
    User,
}

/// One physical partition: a layer, plus the owning agent for agent-scoped layers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub layer: Layer,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

impl PartitionKey {
    pub fn global(layer: Layer) -> Self {
        Self {
            layer,
            agent_id: None,
        }
    }

    pub fn agent(layer: Layer, agent_id: impl Into<String>) -> Self {
        Self {
            layer,
            agent_id: Some(agent_id.into()),
        }
    }

    /// Partition for `layer` as seen by `agent_id`.
    pub fn for_layer(layer: Layer, agent_id: &str) -> Self {
        if layer.is_agent_scoped() {
            Self::agent(layer, agent_id)
        } else {
            Self::global(layer)
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.agent_id {
            Some(agent) => write!(f, "{}/{}", self.layer, agent),
            None => write!(f, "{}", self.layer),
        }
    }
}

/// Who is calling: every store call and operation carries one explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub project_id: String,
    pub agent_id: String,
}

impl Identity {
    pub fn new(project_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            agent_id: agent_id.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.project_id, self.agent_id)
    }
}

/// Opens one agent's private partitions to another agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub owner_agent: String,
    pub grantee_agent: String,
    /// Grantee may also write into the owner's partitions
    #[serde(default)]
    pub write: bool,
}

/// Memory policy as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub enabled: bool,
    pub read_layers: Vec<Layer>,
    pub write_layers: Vec<Layer>,
    pub allow_user_global_write: bool,
    pub retention_days: u32,
    pub redaction_rules: Vec<String>,
    pub shared_access: Vec<AccessGrant>,
}

/// Keywords whose values are masked before any write.
pub const DEFAULT_REDACTION_RULES: [&str; 5] =
    ["api_key", "token", "password", "secret", "private_key"];

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            read_layers: vec![Layer::ProjectAgent, Layer::ProjectGlobal],
            write_layers: vec![Layer::ProjectAgent],
            allow_user_global_write: false,
            retention_days: 90,
            redaction_rules: DEFAULT_REDACTION_RULES
                .iter()
                .map(|r| r.to_string())
                .collect(),
            shared_access: Vec::new(),
        }
    }
}

impl PolicyConfig {
    pub fn with_read_layers(mut self, layers: impl IntoIterator<Item = Layer>) -> Self {
        self.read_layers = layers.into_iter().collect();
        self
    }

    pub fn with_write_layers(mut self, layers: impl IntoIterator<Item = Layer>) -> Self {
        self.write_layers = layers.into_iter().collect();
        self
    }

    pub fn with_user_global_write(mut self, allow: bool) -> Self {
        self.allow_user_global_write = allow;
        self
    }

    pub fn with_grant(mut self, grant: AccessGrant) -> Self {
        self.shared_access.push(grant);
        self
    }

    pub fn with_redaction_rules(mut self, rules: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.redaction_rules = rules.into_iter().map(Into::into).collect();
        self
    }

    /// Reject configurations that would leak into user scope without opt-in.
    pub fn validate(&self) -> Result<()> {
        if self.retention_days == 0 {
            return Err(Error::Config("retention_days must be at least 1".into()));
        }
        if !self.allow_user_global_write {
            if let Some(layer) = self
                .write_layers
                .iter()
                .find(|l| l.scope() == Scope::User)
            {
                return Err(Error::Config(format!(
                    "unsafe write configuration: {} requires allow_user_global_write",
                    layer
                )));
            }
        }
        for grant in &self.shared_access {
            if grant.owner_agent == grant.grantee_agent {
                return Err(Error::Config(format!(
                    "shared access grant for {} points at itself",
                    grant.owner_agent
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_precedence() {
        assert!(Layer::ProjectAgent < Layer::ProjectGlobal);
        assert!(Layer::UserAgent < Layer::UserGlobal);
        assert_eq!(Layer::ALL[0].breadth(), 0);
        assert_eq!(Layer::UserGlobal.breadth(), 3);
    }

    #[test]
    fn test_layer_parse_roundtrip() {
        for layer in Layer::ALL {
            assert_eq!(layer.name().parse::<Layer>().unwrap(), layer);
        }
        assert!("team_global".parse::<Layer>().is_err());
    }

    #[test]
    fn test_partition_key_display() {
        assert_eq!(
            PartitionKey::for_layer(Layer::ProjectAgent, "coder").to_string(),
            "project_agent/coder"
        );
        assert_eq!(
            PartitionKey::for_layer(Layer::ProjectGlobal, "coder").to_string(),
            "project_global"
        );
    }

    #[test]
    fn test_default_policy_is_valid() {
        let policy = PolicyConfig::default();
        assert!(policy.validate().is_ok());
        assert_eq!(policy.write_layers, vec![Layer::ProjectAgent]);
        assert_eq!(policy.retention_days, 90);
    }

    #[test]
    fn test_user_write_requires_opt_in() {
        let policy = PolicyConfig::default().with_write_layers([Layer::UserAgent]);
        assert!(matches!(policy.validate(), Err(Error::Config(_))));

        let policy = policy.with_user_global_write(true);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_policy_yaml_defaults() {
        let policy: PolicyConfig = serde_yaml::from_str("read_layers: [project_global]").unwrap();
        assert_eq!(policy.read_layers, vec![Layer::ProjectGlobal]);
        assert_eq!(policy.write_layers, vec![Layer::ProjectAgent]);
        assert!(policy.enabled);
    }
}
