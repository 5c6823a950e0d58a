//! Platform compatibility adapter
//!
//! Decided once, before the first node is built. The engine asks the profile
//! instead of probing nodes for missing properties on every call.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::{NodeKind, Param};

/// What the host reports about itself
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformInfo {
    /// Browser or host engine identification string
    pub user_agent: String,
    /// Whether a real-time audio API exists at all
    pub has_audio_api: bool,
    /// Node properties the host is known not to expose
    #[serde(default)]
    pub missing_params: Vec<(NodeKind, Param)>,
}

/// Startup verdict for a platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "capability", rename_all = "snake_case")]
pub enum Capability {
    /// Build the full graph
    Ready,
    /// Known-incompatible engine variant; run silently
    Degraded { reason: String },
    /// No audio API; run silently
    Unsupported { reason: String },
}

impl Capability {
    pub fn is_usable(&self) -> bool {
        matches!(self, Capability::Ready)
    }
}

/// Compatibility profile for one platform
#[derive(Debug, Clone)]
pub struct CompatProfile {
    capability: Capability,
    missing: HashSet<(NodeKind, Param)>,
}

impl CompatProfile {
    /// Classify a platform
    ///
    /// # Arguments
    /// * `info` - Host identification
    /// * `incompatible_agents` - User-agent markers of engine variants that
    ///   cannot run the graph
    pub fn detect(info: &PlatformInfo, incompatible_agents: &[String]) -> Self {
        let capability = if !info.has_audio_api {
            Capability::Unsupported {
                reason: "no audio API available".to_string(),
            }
        } else if let Some(marker) = incompatible_agents
            .iter()
            .find(|marker| !marker.is_empty() && info.user_agent.contains(marker.as_str()))
        {
            Capability::Degraded {
                reason: format!("engine variant '{}' is not supported", marker),
            }
        } else {
            Capability::Ready
        };

        Self {
            capability,
            missing: info.missing_params.iter().copied().collect(),
        }
    }

    /// Profile for a platform that supports everything
    pub fn full() -> Self {
        Self {
            capability: Capability::Ready,
            missing: HashSet::new(),
        }
    }

    pub fn capability(&self) -> &Capability {
        &self.capability
    }

    pub fn is_usable(&self) -> bool {
        self.capability.is_usable()
    }

    /// Whether `param` can be written on nodes of `kind`
    pub fn supports(&self, kind: NodeKind, param: Param) -> bool {
        !self.missing.contains(&(kind, param))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(user_agent: &str) -> PlatformInfo {
        PlatformInfo {
            user_agent: user_agent.to_string(),
            has_audio_api: true,
            missing_params: vec![(NodeKind::Chorus, Param::Depth)],
        }
    }

    #[test]
    fn test_detects_incompatible_variant() {
        let markers = vec!["Firefox/".to_string()];
        let profile = CompatProfile::detect(&info("Mozilla/5.0 Firefox/121.0"), &markers);
        assert!(matches!(profile.capability(), Capability::Degraded { .. }));
        assert!(!profile.is_usable());

        let profile = CompatProfile::detect(&info("Mozilla/5.0 Chrome/120.0"), &markers);
        assert_eq!(profile.capability(), &Capability::Ready);
    }

    #[test]
    fn test_missing_audio_api_is_unsupported() {
        let mut no_api = info("Chrome/120.0");
        no_api.has_audio_api = false;
        let profile = CompatProfile::detect(&no_api, &[]);
        assert!(matches!(profile.capability(), Capability::Unsupported { .. }));
    }

    #[test]
    fn test_missing_params_are_reported() {
        let profile = CompatProfile::detect(&info("Chrome/120.0"), &[]);
        assert!(!profile.supports(NodeKind::Chorus, Param::Depth));
        assert!(profile.supports(NodeKind::Chorus, Param::Wet));
    }
}
