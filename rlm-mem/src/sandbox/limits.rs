//! Resource bounds of a retrieval session.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Resource bounds applied to every retrieval session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxLimits {
    /// Model calls allowed per session, nested loops included
    pub max_iterations: u32,
    /// Deepest nested retrieval loop
    pub max_depth: u32,
    /// Wall-clock bound per command in milliseconds
    pub command_timeout_ms: u64,
    /// Wall-clock bound for the whole session in milliseconds
    pub session_timeout_ms: u64,
    /// Largest text any command may produce
    pub max_buffer_bytes: usize,
    /// Largest result list a search or listing may return
    pub max_results: usize,
    /// Spending cap in USD
    pub max_cost_usd: Option<f64>,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_depth: 3,
            command_timeout_ms: 10_000,
            session_timeout_ms: 60_000,
            max_buffer_bytes: 16 * 1024,
            max_results: 20,
            max_cost_usd: None,
        }
    }
}

impl SandboxLimits {
    pub fn with_max_iterations(mut self, n: u32) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn with_max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_command_timeout_ms(mut self, ms: u64) -> Self {
        self.command_timeout_ms = ms;
        self
    }

    pub fn with_session_timeout_ms(mut self, ms: u64) -> Self {
        self.session_timeout_ms = ms;
        self
    }

    pub fn with_max_buffer_bytes(mut self, bytes: usize) -> Self {
        self.max_buffer_bytes = bytes;
        self
    }

    pub fn with_max_results(mut self, n: usize) -> Self {
        self.max_results = n;
        self
    }

    pub fn with_max_cost_usd(mut self, usd: f64) -> Self {
        self.max_cost_usd = Some(usd);
        self
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.command_timeout_ms == 0 || self.session_timeout_ms == 0 {
            return Err(Error::Config("sandbox timeouts must be positive".into()));
        }
        if self.max_buffer_bytes < 256 {
            return Err(Error::Config(format!(
                "max_buffer_bytes {} is below the 256 byte minimum",
                self.max_buffer_bytes
            )));
        }
        if self.max_results == 0 {
            return Err(Error::Config("max_results must be at least 1".into()));
        }
        if let Some(cost) = self.max_cost_usd {
            if cost.is_nan() || cost < 0.0 {
                return Err(Error::Config(format!("invalid max_cost_usd {}", cost)));
            }
        }
        Ok(())
    }
}

/// Cut `text` to at most `max_bytes`, on a char boundary.
pub(crate) fn clip(text: &str, max_bytes: usize) -> (String, bool) {
    if text.len() <= max_bytes {
        return (text.to_string(), false);
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    (text[..end].to_string(), true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let limits = SandboxLimits::default();
        assert_eq!(limits.max_iterations, 10);
        assert_eq!(limits.max_depth, 3);
        assert_eq!(limits.command_timeout(), Duration::from_secs(10));
        assert_eq!(limits.session_timeout(), Duration::from_secs(60));
        assert_eq!(limits.max_buffer_bytes, 16384);
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn test_invalid_limits() {
        assert!(SandboxLimits::default().with_command_timeout_ms(0).validate().is_err());
        assert!(SandboxLimits::default().with_max_buffer_bytes(10).validate().is_err());
        assert!(SandboxLimits::default().with_max_cost_usd(f64::NAN).validate().is_err());
    }

    #[test]
    fn test_clip_respects_char_boundaries() {
        let (clipped, truncated) = clip("héllo", 2);
        assert_eq!(clipped, "h");
        assert!(truncated);
        assert_eq!(clip("short", 100), ("short".to_string(), false));
    }
}
