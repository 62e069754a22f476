//! Manual `supports` / `contradicts` edges.

use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::{capture, MemoryEngine, OperationError};
use crate::error::Result;
use crate::memory::{ChunkId, Edge, EdgeType};
use crate::policy::Identity;

/// An edge asserted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRequest {
    pub source: String,
    pub target: String,
    pub edge_type: EdgeType,
    #[serde(default = "default_strength")]
    pub strength: f64,
    pub rationale: Option<String>,
}

fn default_strength() -> f64 {
    1.0
}

impl LinkRequest {
    pub fn new(source: impl Into<String>, target: impl Into<String>, edge_type: EdgeType) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            edge_type,
            strength: default_strength(),
            rationale: None,
        }
    }

    pub fn with_strength(mut self, strength: f64) -> Self {
        self.strength = strength;
        self
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkResult {
    pub success: bool,
    pub edge: Option<Edge>,
    pub error: Option<OperationError>,
}

impl MemoryEngine {
    /// Record that one chunk supports or contradicts another.
    #[instrument(skip(self, request), fields(identity = %identity, edge_type = %request.edge_type))]
    pub fn link(&self, identity: &Identity, request: LinkRequest) -> Result<LinkResult> {
        let linked = ChunkId::parse(request.source.as_str()).and_then(|source| {
            let target = ChunkId::parse(request.target.as_str())?;
            self.store.link(
                identity,
                &source,
                &target,
                request.edge_type,
                request.strength,
                request.rationale,
            )
        });
        match linked {
            Ok(edge) => Ok(LinkResult {
                success: true,
                edge: Some(edge),
                error: None,
            }),
            Err(e) => Ok(LinkResult {
                error: Some(capture(e)?),
                ..LinkResult::default()
            }),
        }
    }
}
