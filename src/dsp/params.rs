//! Per-entity effect parameters
//!
//! The settings store owns these values; the engine only reads them and maps
//! them onto the entity's sub-chain right before each trigger. Mapping is a
//! pure function so the graph topology never carries listeners.

use serde::{Deserialize, Serialize};

use super::subchain::SubChain;
use crate::platform::{NodeId, NodeKind, Param};

// ============================================================================
// Constants
// ============================================================================

/// Lowest cutoff written to a filter, in Hz
pub const MIN_CUTOFF_HZ: f32 = 20.0;

/// Highest cutoff written to a filter, in Hz
pub const MAX_CUTOFF_HZ: f32 = 20_000.0;

// ============================================================================
// Effect Parameters
// ============================================================================

/// Effect amounts stored per entity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectParams {
    /// Reverb wet amount (0..1)
    pub reverb: f32,
    /// Delay wet amount (0..1)
    pub delay: f32,
    /// Lowpass cutoff in Hz
    pub lowpass: f32,
    /// Highpass cutoff in Hz
    pub highpass: f32,
}

impl Default for EffectParams {
    fn default() -> Self {
        Self {
            reverb: 0.0,
            delay: 0.0,
            lowpass: MAX_CUTOFF_HZ,
            highpass: MIN_CUTOFF_HZ,
        }
    }
}

impl EffectParams {
    /// Copy with the fields present in `patch` replaced
    pub fn merged(&self, patch: &EffectPatch) -> Self {
        Self {
            reverb: patch.reverb.unwrap_or(self.reverb),
            delay: patch.delay.unwrap_or(self.delay),
            lowpass: patch.lowpass.unwrap_or(self.lowpass),
            highpass: patch.highpass.unwrap_or(self.highpass),
        }
    }
}

/// Partial update of [`EffectParams`]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EffectPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverb: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lowpass: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highpass: Option<f32>,
}

impl EffectPatch {
    pub fn reverb(value: f32) -> Self {
        Self {
            reverb: Some(value),
            ..Self::default()
        }
    }

    pub fn delay(value: f32) -> Self {
        Self {
            delay: Some(value),
            ..Self::default()
        }
    }
}

// ============================================================================
// Parameter Application
// ============================================================================

/// One node property write
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamWrite {
    pub node: NodeId,
    pub kind: NodeKind,
    pub param: Param,
    pub value: f32,
}

fn finite_or(value: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

fn amount(value: f32) -> f32 {
    finite_or(value, 0.0).clamp(0.0, 1.0)
}

fn cutoff(value: f32, fallback: f32) -> f32 {
    finite_or(value, fallback).clamp(MIN_CUTOFF_HZ, MAX_CUTOFF_HZ)
}

/// Map stored parameters onto sub-chain node properties
///
/// Values are clamped to their node ranges; non-finite input falls back to
/// the neutral setting (dry, filters fully open).
pub fn apply_params(subchain: &SubChain, params: &EffectParams) -> Vec<ParamWrite> {
    vec![
        ParamWrite {
            node: subchain.highpass,
            kind: NodeKind::Filter,
            param: Param::Frequency,
            value: cutoff(params.highpass, MIN_CUTOFF_HZ),
        },
        ParamWrite {
            node: subchain.lowpass,
            kind: NodeKind::Filter,
            param: Param::Frequency,
            value: cutoff(params.lowpass, MAX_CUTOFF_HZ),
        },
        ParamWrite {
            node: subchain.delay,
            kind: NodeKind::Delay,
            param: Param::Wet,
            value: amount(params.delay),
        },
        ParamWrite {
            node: subchain.reverb,
            kind: NodeKind::Reverb,
            param: Param::Wet,
            value: amount(params.reverb),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn subchain() -> SubChain {
        SubChain {
            highpass: NodeId(1),
            lowpass: NodeId(2),
            delay: NodeId(3),
            reverb: NodeId(4),
        }
    }

    fn value_for(writes: &[ParamWrite], node: NodeId) -> f32 {
        writes.iter().find(|w| w.node == node).unwrap().value
    }

    #[test]
    fn test_maps_each_field_to_its_node() {
        let params = EffectParams {
            reverb: 0.5,
            delay: 0.25,
            lowpass: 4000.0,
            highpass: 120.0,
        };
        let writes = apply_params(&subchain(), &params);
        assert_eq!(writes.len(), 4);
        assert_eq!(value_for(&writes, NodeId(1)), 120.0);
        assert_eq!(value_for(&writes, NodeId(2)), 4000.0);
        assert_eq!(value_for(&writes, NodeId(3)), 0.25);
        assert_eq!(value_for(&writes, NodeId(4)), 0.5);
    }

    #[test]
    fn test_clamps_out_of_range_values() {
        let params = EffectParams {
            reverb: 3.0,
            delay: -1.0,
            lowpass: 1.0e6,
            highpass: f32::NAN,
        };
        let writes = apply_params(&subchain(), &params);
        assert_eq!(value_for(&writes, NodeId(4)), 1.0);
        assert_eq!(value_for(&writes, NodeId(3)), 0.0);
        assert_eq!(value_for(&writes, NodeId(2)), MAX_CUTOFF_HZ);
        assert_eq!(value_for(&writes, NodeId(1)), MIN_CUTOFF_HZ);
    }

    #[test]
    fn test_patch_merges_only_present_fields() {
        let base = EffectParams::default();
        let merged = base.merged(&EffectPatch::reverb(0.5));
        assert_eq!(merged.reverb, 0.5);
        assert_eq!(merged.lowpass, base.lowpass);

        let patch: EffectPatch = serde_json::from_str(r#"{"delay": 0.4}"#).unwrap();
        assert_eq!(patch, EffectPatch::delay(0.4));
    }
}
