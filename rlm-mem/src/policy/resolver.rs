//! Resolution of a policy into concrete partitions for one identity.

use std::sync::Arc;
use tracing::warn;

use super::redaction::{Redacted, Redactor};
use super::types::{Identity, Layer, PartitionKey, PolicyConfig};
use crate::error::{Error, Result};
use crate::memory::validate_id;

/// The partitions one identity may touch, plus the redaction rules for its writes.
#[derive(Debug, Clone)]
pub struct ResolvedPolicy {
    pub identity: Identity,
    /// Readable partitions in precedence order (narrowest first)
    pub readable: Vec<PartitionKey>,
    pub writable: Vec<PartitionKey>,
    pub retention_days: u32,
    redactor: Arc<Redactor>,
}

impl ResolvedPolicy {
    pub fn can_read(&self, partition: &PartitionKey) -> bool {
        self.readable.contains(partition)
    }

    pub fn can_write(&self, partition: &PartitionKey) -> bool {
        self.writable.contains(partition)
    }

    /// Partition the caller writes to for `layer`, or a policy violation.
    pub fn write_partition(&self, layer: Layer) -> Result<PartitionKey> {
        let key = PartitionKey::for_layer(layer, &self.identity.agent_id);
        if self.can_write(&key) {
            Ok(key)
        } else {
            warn!(identity = %self.identity, layer = %layer, "Write denied by policy");
            Err(Error::policy(format!(
                "{} may not write to layer {}",
                self.identity, layer
            )))
        }
    }

    /// Default write target: the narrowest writable partition the caller owns.
    pub fn default_write_layer(&self) -> Result<Layer> {
        self.writable
            .iter()
            .find(|p| {
                p.agent_id.is_none() || p.agent_id.as_deref() == Some(self.identity.agent_id.as_str())
            })
            .map(|p| p.layer)
            .ok_or_else(|| Error::policy(format!("{} has no writable layer", self.identity)))
    }

    /// Readable partitions restricted to the given layers.
    pub fn readable_in(&self, layers: Option<&[Layer]>) -> Vec<PartitionKey> {
        match layers {
            None => self.readable.clone(),
            Some(layers) => self
                .readable
                .iter()
                .filter(|p| layers.contains(&p.layer))
                .cloned()
                .collect(),
        }
    }

    pub fn redact(&self, text: &str) -> Result<Redacted> {
        self.redactor.redact(text)
    }

    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }
}

/// Turns a policy configuration and an identity into a [`ResolvedPolicy`].
///
/// Holds no mutable state; resolving has no side effects and is cheap enough
/// to run on every read and write.
#[derive(Debug, Clone)]
pub struct PolicyResolver {
    config: PolicyConfig,
    redactor: Arc<Redactor>,
}

impl PolicyResolver {
    pub fn new(config: PolicyConfig) -> Result<Self> {
        config.validate()?;
        let redactor = Arc::new(Redactor::new(&config.redaction_rules)?);
        Ok(Self { config, redactor })
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn resolve(&self, identity: &Identity) -> Result<ResolvedPolicy> {
        validate_id(&identity.project_id).map_err(|_| {
            Error::validation(format!("invalid project id: {:?}", identity.project_id))
        })?;
        validate_id(&identity.agent_id)
            .map_err(|_| Error::validation(format!("invalid agent id: {:?}", identity.agent_id)))?;

        let mut readable = Vec::new();
        let mut writable = Vec::new();

        if self.config.enabled {
            for layer in Layer::ALL {
                if self.config.read_layers.contains(&layer) {
                    readable.extend(self.partitions_for(layer, identity, false));
                }
                if self.config.write_layers.contains(&layer) && self.write_allowed(layer) {
                    writable.extend(self.partitions_for(layer, identity, true));
                }
            }
        }

        Ok(ResolvedPolicy {
            identity: identity.clone(),
            readable,
            writable,
            retention_days: self.config.retention_days,
            redactor: Arc::clone(&self.redactor),
        })
    }

    fn write_allowed(&self, layer: Layer) -> bool {
        layer.scope() == super::types::Scope::Project || self.config.allow_user_global_write
    }

    fn partitions_for(&self, layer: Layer, identity: &Identity, write: bool) -> Vec<PartitionKey> {
        if !layer.is_agent_scoped() {
            return vec![PartitionKey::global(layer)];
        }

        let mut keys = vec![PartitionKey::agent(layer, identity.agent_id.as_str())];
        for grant in &self.config.shared_access {
            if grant.grantee_agent == identity.agent_id && (!write || grant.write) {
                keys.push(PartitionKey::agent(layer, grant.owner_agent.as_str()));
            }
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::types::AccessGrant;

    fn identity(agent: &str) -> Identity {
        Identity::new("proj-a", agent)
    }

    #[test]
    fn test_default_resolution() {
        let resolver = PolicyResolver::new(PolicyConfig::default()).unwrap();
        let resolved = resolver.resolve(&identity("coder")).unwrap();

        assert_eq!(
            resolved.readable,
            vec![
                PartitionKey::agent(Layer::ProjectAgent, "coder"),
                PartitionKey::global(Layer::ProjectGlobal),
            ]
        );
        assert_eq!(
            resolved.writable,
            vec![PartitionKey::agent(Layer::ProjectAgent, "coder")]
        );
        assert_eq!(resolved.default_write_layer().unwrap(), Layer::ProjectAgent);
    }

    #[test]
    fn test_agents_are_isolated() {
        let resolver = PolicyResolver::new(PolicyConfig::default()).unwrap();
        let coder = resolver.resolve(&identity("coder")).unwrap();
        let reviewer = resolver.resolve(&identity("reviewer")).unwrap();

        let coder_private = PartitionKey::agent(Layer::ProjectAgent, "coder");
        assert!(coder.can_read(&coder_private));
        assert!(!reviewer.can_read(&coder_private));
        assert!(!reviewer.can_write(&coder_private));
        assert!(reviewer.can_read(&PartitionKey::global(Layer::ProjectGlobal)));
    }

    #[test]
    fn test_shared_access_grant() {
        let config = PolicyConfig::default().with_grant(AccessGrant {
            owner_agent: "coder".into(),
            grantee_agent: "reviewer".into(),
            write: false,
        });
        let resolver = PolicyResolver::new(config).unwrap();
        let reviewer = resolver.resolve(&identity("reviewer")).unwrap();

        let coder_private = PartitionKey::agent(Layer::ProjectAgent, "coder");
        assert!(reviewer.can_read(&coder_private));
        assert!(!reviewer.can_write(&coder_private));
    }

    #[test]
    fn test_write_denied_is_policy_violation() {
        let resolver = PolicyResolver::new(PolicyConfig::default()).unwrap();
        let resolved = resolver.resolve(&identity("coder")).unwrap();
        let err = resolved.write_partition(Layer::ProjectGlobal).unwrap_err();
        assert!(matches!(err, Error::PolicyViolation(_)));
    }

    #[test]
    fn test_user_layers_with_opt_in() {
        let config = PolicyConfig::default()
            .with_read_layers(Layer::ALL)
            .with_write_layers([Layer::ProjectAgent, Layer::UserGlobal])
            .with_user_global_write(true);
        let resolver = PolicyResolver::new(config).unwrap();
        let resolved = resolver.resolve(&identity("coder")).unwrap();

        assert_eq!(resolved.readable.len(), 4);
        assert!(resolved.write_partition(Layer::UserGlobal).is_ok());
        assert!(resolved.write_partition(Layer::UserAgent).is_err());
    }

    #[test]
    fn test_disabled_policy_denies_everything() {
        let config = PolicyConfig {
            enabled: false,
            ..PolicyConfig::default()
        };
        let resolver = PolicyResolver::new(config).unwrap();
        let resolved = resolver.resolve(&identity("coder")).unwrap();
        assert!(resolved.readable.is_empty());
        assert!(resolved.default_write_layer().is_err());
    }

    #[test]
    fn test_invalid_identity_rejected() {
        let resolver = PolicyResolver::new(PolicyConfig::default()).unwrap();
        let err = resolver.resolve(&Identity::new("proj", "../etc")).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_resolution_has_no_side_effects() {
        let resolver = PolicyResolver::new(PolicyConfig::default()).unwrap();
        let a = resolver.resolve(&identity("coder")).unwrap();
        let b = resolver.resolve(&identity("coder")).unwrap();
        assert_eq!(a.readable, b.readable);
        assert_eq!(a.writable, b.writable);
    }
}
