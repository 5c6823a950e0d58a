//! Per-entity signal path
//!
//! voice → highpass → lowpass → delay → reverb → panner → meter → master

use parking_lot::Mutex;

use super::params::{apply_params, EffectParams};
use crate::error::Result;
use crate::platform::{
    AudioGraph, CompatProfile, FilterType, NodeId, NodeSpec, PannerConfig, Position,
};

/// Delay time of entity delays, in seconds
const ENTITY_DELAY_TIME: f32 = 0.25;

/// Feedback of entity delays
const ENTITY_DELAY_FEEDBACK: f32 = 0.3;

/// Decay of entity reverbs, in seconds
const ENTITY_REVERB_DECAY: f32 = 1.5;

/// Dispose nodes created before a failure, newest first
pub(crate) fn unwind(graph: &dyn AudioGraph, nodes: &[NodeId]) {
    for node in nodes.iter().rev() {
        if let Err(err) = graph.dispose_node(*node) {
            tracing::debug!(node = %node, error = %err, "unwinding partial build");
        }
    }
}

/// Build `specs` in order and connect them in series
pub(crate) fn build_series(graph: &dyn AudioGraph, specs: &[NodeSpec]) -> Result<Vec<NodeId>> {
    let mut nodes = Vec::with_capacity(specs.len());
    for spec in specs {
        match graph.create_node(spec) {
            Ok(node) => {
                if let Some(prev) = nodes.last().copied() {
                    if let Err(err) = graph.connect(prev, node) {
                        nodes.push(node);
                        unwind(graph, &nodes);
                        return Err(err);
                    }
                }
                nodes.push(node);
            }
            Err(err) => {
                unwind(graph, &nodes);
                return Err(err);
            }
        }
    }
    Ok(nodes)
}

// ============================================================================
// Sub-chain
// ============================================================================

/// Filter and effect nodes of one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubChain {
    pub highpass: NodeId,
    pub lowpass: NodeId,
    pub delay: NodeId,
    pub reverb: NodeId,
}

impl SubChain {
    /// Build the four nodes wired highpass → lowpass → delay → reverb
    pub fn build(graph: &dyn AudioGraph) -> Result<Self> {
        let defaults = EffectParams::default();
        let nodes = build_series(
            graph,
            &[
                NodeSpec::Filter {
                    filter_type: FilterType::Highpass,
                    frequency: defaults.highpass,
                },
                NodeSpec::Filter {
                    filter_type: FilterType::Lowpass,
                    frequency: defaults.lowpass,
                },
                NodeSpec::Delay {
                    time: ENTITY_DELAY_TIME,
                    feedback: ENTITY_DELAY_FEEDBACK,
                    wet: defaults.delay,
                },
                NodeSpec::Reverb {
                    decay: ENTITY_REVERB_DECAY,
                    wet: defaults.reverb,
                },
            ],
        )?;
        Ok(Self {
            highpass: nodes[0],
            lowpass: nodes[1],
            delay: nodes[2],
            reverb: nodes[3],
        })
    }

    pub fn entry(&self) -> NodeId {
        self.highpass
    }

    pub fn exit(&self) -> NodeId {
        self.reverb
    }

    pub fn nodes(&self) -> [NodeId; 4] {
        [self.highpass, self.lowpass, self.delay, self.reverb]
    }

    /// Write `params` onto the live nodes
    ///
    /// Properties the platform lacks are skipped and write failures are
    /// logged; the remaining writes still happen.
    pub fn apply(&self, graph: &dyn AudioGraph, profile: &CompatProfile, params: &EffectParams) {
        for write in apply_params(self, params) {
            if !profile.supports(write.kind, write.param) {
                continue;
            }
            if let Err(err) = graph.set_param(write.node, write.param, write.value) {
                tracing::debug!(
                    node = %write.node,
                    param = %write.param,
                    error_code = err.error_code(),
                    "skipping sub-chain parameter"
                );
            }
        }
    }

    pub fn dispose(&self, graph: &dyn AudioGraph) {
        unwind(graph, &self.nodes());
    }
}

// ============================================================================
// Spatial Panner
// ============================================================================

/// HRTF panner placing an entity in 3D space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpatialPanner {
    node: NodeId,
}

impl SpatialPanner {
    pub fn build(graph: &dyn AudioGraph, config: PannerConfig) -> Result<Self> {
        let node = graph.create_node(&NodeSpec::Panner(config))?;
        Ok(Self { node })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn set_position(&self, graph: &dyn AudioGraph, position: Position) -> Result<()> {
        graph.set_position(self.node, position)
    }
}

// ============================================================================
// Level Meter
// ============================================================================

/// Smoothed 0..1 output level of one entity
#[derive(Debug)]
pub struct LevelMeter {
    node: NodeId,
    smoothing: f32,
    value: Mutex<f32>,
}

impl LevelMeter {
    pub fn build(graph: &dyn AudioGraph, smoothing: f32) -> Result<Self> {
        let node = graph.create_node(&NodeSpec::Meter { smoothing })?;
        Ok(Self {
            node,
            smoothing: smoothing.clamp(0.0, 0.99),
            value: Mutex::new(0.0),
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Read the platform level and fold it into the smoothed envelope
    ///
    /// Called once per visual frame.
    pub fn poll(&self, graph: &dyn AudioGraph) -> f32 {
        let raw = graph.read_level(self.node);
        let raw = if raw.is_finite() { raw.clamp(0.0, 1.0) } else { 0.0 };
        let mut value = self.value.lock();
        *value = self.smoothing * *value + (1.0 - self.smoothing) * raw;
        *value
    }

    /// Last smoothed value without reading the platform
    pub fn value(&self) -> f32 {
        *self.value.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::params::MIN_CUTOFF_HZ;
    use crate::music::Note;
    use crate::entity::EntityKind;
    use crate::platform::{MemoryPlatform, NodeKind, Param, VoiceEvent};
    use crate::synth::{create_voice, PoolKey, Preset};
    use approx::assert_relative_eq;

    #[test]
    fn test_subchain_is_wired_in_order() {
        let platform = MemoryPlatform::new();
        let chain = SubChain::build(&platform).unwrap();
        assert!(platform.is_connected(chain.highpass, chain.lowpass));
        assert!(platform.is_connected(chain.lowpass, chain.delay));
        assert!(platform.is_connected(chain.delay, chain.reverb));
        assert_eq!(chain.entry(), chain.highpass);
        assert_eq!(chain.exit(), chain.reverb);
    }

    #[test]
    fn test_failed_build_leaves_no_nodes() {
        let platform = MemoryPlatform::new();
        platform.fail_node_kind(NodeKind::Reverb);
        assert!(SubChain::build(&platform).is_err());
        assert!(platform.nodes_of_kind(NodeKind::Filter).is_empty());
        assert!(platform.nodes_of_kind(NodeKind::Delay).is_empty());
    }

    #[test]
    fn test_apply_skips_missing_params() {
        let platform = MemoryPlatform::new();
        platform.break_param(NodeKind::Delay, Param::Wet);
        let chain = SubChain::build(&platform).unwrap();
        let params = EffectParams {
            reverb: 0.5,
            delay: 0.5,
            lowpass: 1000.0,
            highpass: MIN_CUTOFF_HZ,
        };
        chain.apply(&platform, &CompatProfile::full(), &params);
        assert_eq!(platform.param(chain.reverb, Param::Wet), Some(0.5));
        assert_eq!(platform.param(chain.lowpass, Param::Frequency), Some(1000.0));
        assert_eq!(platform.param(chain.delay, Param::Wet), None);
    }

    #[test]
    fn test_meter_smooths_towards_level() {
        let platform = MemoryPlatform::new();
        let voice = create_voice(&platform, PoolKey::new(EntityKind::Note, Preset::Lead)).unwrap();
        let meter = LevelMeter::build(&platform, 0.8).unwrap();
        platform.connect(voice.node(), meter.node()).unwrap();

        assert_eq!(meter.poll(&platform), 0.0);
        platform
            .schedule(
                voice.node(),
                VoiceEvent::Attack {
                    notes: vec![Note::MIDDLE_C],
                    velocity: 1.0,
                },
                0.0,
            )
            .unwrap();
        assert_relative_eq!(meter.poll(&platform), 0.2, epsilon = 1e-6);
        assert_relative_eq!(meter.poll(&platform), 0.36, epsilon = 1e-6);
        assert_relative_eq!(meter.value(), 0.36, epsilon = 1e-6);
    }

    #[test]
    fn test_panner_position() {
        let platform = MemoryPlatform::new();
        let panner = SpatialPanner::build(&platform, PannerConfig::default()).unwrap();
        panner
            .set_position(&platform, Position::new(1.0, 2.0, -3.0))
            .unwrap();
        assert_eq!(
            platform.position(panner.node()),
            Some(Position::new(1.0, 2.0, -3.0))
        );
    }
}
