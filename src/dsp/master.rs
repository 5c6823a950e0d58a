//! Master effects chain
//!
//! One shared tail for every voice in the engine. Stages run in a fixed order:
//! 1. Volume (entity sub-chains and always-present voices join here)
//! 2. Distortion (bit crusher)
//! 3. Filter
//! 4. Reverb
//! 5. Delay
//! 6. Chorus
//! 7. Output
//!
//! When the full chain cannot be built the engine falls back to a single
//! volume stage, and when even that fails to an inert chain that accepts
//! every call and does nothing.

use serde::{Deserialize, Serialize};

use super::subchain::{build_series, unwind};
use crate::error::Result;
use crate::platform::{
    AudioGraph, CompatProfile, FilterType, NodeId, NodeKind, NodeSpec, Param,
};

/// Drive of the distortion stage; the bit depth carries the colour
const DISTORTION_AMOUNT: f32 = 0.0;

/// Master reverb decay in seconds
const REVERB_DECAY: f32 = 2.5;

/// Master delay time in seconds
const DELAY_TIME: f32 = 0.25;

/// Master delay wet amount
const DELAY_WET: f32 = 0.2;

/// Chorus LFO rate in Hz
const CHORUS_FREQUENCY: f32 = 1.5;

/// Chorus delay in milliseconds
const CHORUS_DELAY_MS: f32 = 3.5;

/// Chorus wet amount
const CHORUS_WET: f32 = 0.5;

// ============================================================================
// Stages
// ============================================================================

/// Stage order (lower runs earlier)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterStage {
    Volume = 0,
    Distortion = 1,
    Filter = 2,
    Reverb = 3,
    Delay = 4,
    Chorus = 5,
    Output = 6,
}

impl MasterStage {
    pub const ORDER: [MasterStage; 7] = [
        MasterStage::Volume,
        MasterStage::Distortion,
        MasterStage::Filter,
        MasterStage::Reverb,
        MasterStage::Delay,
        MasterStage::Chorus,
        MasterStage::Output,
    ];
}

/// User-adjustable master controls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterControl {
    Volume,
    ChorusDepth,
    ReverbWet,
    DelayFeedback,
    BitcrusherBits,
    FilterFrequency,
}

impl MasterControl {
    pub fn stage(&self) -> MasterStage {
        match self {
            MasterControl::Volume => MasterStage::Volume,
            MasterControl::ChorusDepth => MasterStage::Chorus,
            MasterControl::ReverbWet => MasterStage::Reverb,
            MasterControl::DelayFeedback => MasterStage::Delay,
            MasterControl::BitcrusherBits => MasterStage::Distortion,
            MasterControl::FilterFrequency => MasterStage::Filter,
        }
    }

    pub fn param(&self) -> Param {
        match self {
            MasterControl::Volume => Param::Gain,
            MasterControl::ChorusDepth => Param::Depth,
            MasterControl::ReverbWet => Param::Wet,
            MasterControl::DelayFeedback => Param::Feedback,
            MasterControl::BitcrusherBits => Param::Bits,
            MasterControl::FilterFrequency => Param::Frequency,
        }
    }

    /// Clamp a requested value into the control's range
    pub fn clamp(&self, value: f32) -> f32 {
        let (lo, hi) = match self {
            MasterControl::Volume
            | MasterControl::ChorusDepth
            | MasterControl::ReverbWet => (0.0, 1.0),
            // Keep the feedback loop below unity so it always decays
            MasterControl::DelayFeedback => (0.0, 0.95),
            MasterControl::BitcrusherBits => (1.0, 16.0),
            MasterControl::FilterFrequency => (20.0, 20_000.0),
        };
        if value.is_finite() {
            value.clamp(lo, hi)
        } else {
            lo
        }
    }
}

/// Current master control values
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterSettings {
    pub master_volume: f32,
    pub chorus_depth: f32,
    pub reverb_wet: f32,
    pub delay_feedback: f32,
    pub bitcrusher_bits: f32,
    pub filter_frequency: f32,
}

impl Default for MasterSettings {
    fn default() -> Self {
        Self {
            master_volume: 0.8,
            chorus_depth: 0.5,
            reverb_wet: 0.3,
            delay_feedback: 0.3,
            bitcrusher_bits: 8.0,
            filter_frequency: 2000.0,
        }
    }
}

impl MasterSettings {
    pub fn get(&self, control: MasterControl) -> f32 {
        match control {
            MasterControl::Volume => self.master_volume,
            MasterControl::ChorusDepth => self.chorus_depth,
            MasterControl::ReverbWet => self.reverb_wet,
            MasterControl::DelayFeedback => self.delay_feedback,
            MasterControl::BitcrusherBits => self.bitcrusher_bits,
            MasterControl::FilterFrequency => self.filter_frequency,
        }
    }

    /// Store a clamped value and return it
    pub fn set(&mut self, control: MasterControl, value: f32) -> f32 {
        let value = control.clamp(value);
        match control {
            MasterControl::Volume => self.master_volume = value,
            MasterControl::ChorusDepth => self.chorus_depth = value,
            MasterControl::ReverbWet => self.reverb_wet = value,
            MasterControl::DelayFeedback => self.delay_feedback = value,
            MasterControl::BitcrusherBits => self.bitcrusher_bits = value,
            MasterControl::FilterFrequency => self.filter_frequency = value,
        }
        value
    }

    fn stage_spec(&self, stage: MasterStage) -> NodeSpec {
        match stage {
            MasterStage::Volume => NodeSpec::Gain {
                gain: MasterControl::Volume.clamp(self.master_volume),
            },
            MasterStage::Distortion => NodeSpec::Distortion {
                amount: DISTORTION_AMOUNT,
                bits: MasterControl::BitcrusherBits.clamp(self.bitcrusher_bits),
            },
            MasterStage::Filter => NodeSpec::Filter {
                filter_type: FilterType::Lowpass,
                frequency: MasterControl::FilterFrequency.clamp(self.filter_frequency),
            },
            MasterStage::Reverb => NodeSpec::Reverb {
                decay: REVERB_DECAY,
                wet: MasterControl::ReverbWet.clamp(self.reverb_wet),
            },
            MasterStage::Delay => NodeSpec::Delay {
                time: DELAY_TIME,
                feedback: MasterControl::DelayFeedback.clamp(self.delay_feedback),
                wet: DELAY_WET,
            },
            MasterStage::Chorus => NodeSpec::Chorus {
                frequency: CHORUS_FREQUENCY,
                delay_time: CHORUS_DELAY_MS,
                depth: MasterControl::ChorusDepth.clamp(self.chorus_depth),
                wet: CHORUS_WET,
            },
            MasterStage::Output => NodeSpec::Destination,
        }
    }
}

// ============================================================================
// Chain
// ============================================================================

/// How much of the master chain exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Fidelity {
    Full,
    /// Volume stage straight to the output
    Reduced,
    /// No nodes; sound is absent
    Silent,
}

/// The built master chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterChain {
    Full { stages: Vec<(MasterStage, NodeId)> },
    PassThrough { volume: NodeId, output: NodeId },
    Inert,
}

impl MasterChain {
    /// Build the best chain the platform allows
    ///
    /// Never fails: the full chain falls back to a pass-through gain, which
    /// falls back to [`MasterChain::Inert`].
    pub fn build(graph: &dyn AudioGraph, settings: &MasterSettings) -> Self {
        match Self::build_full(graph, settings) {
            Ok(chain) => return chain,
            Err(err) => tracing::warn!(
                error = %err,
                error_code = err.error_code(),
                "master chain failed; falling back to pass-through"
            ),
        }
        match Self::build_pass_through(graph, settings) {
            Ok(chain) => chain,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    error_code = err.error_code(),
                    "pass-through failed; master chain is inert"
                );
                MasterChain::Inert
            }
        }
    }

    fn build_full(graph: &dyn AudioGraph, settings: &MasterSettings) -> Result<Self> {
        let specs: Vec<NodeSpec> = MasterStage::ORDER
            .iter()
            .map(|stage| settings.stage_spec(*stage))
            .collect();
        let nodes = build_series(graph, &specs)?;
        Ok(MasterChain::Full {
            stages: MasterStage::ORDER.iter().copied().zip(nodes).collect(),
        })
    }

    fn build_pass_through(graph: &dyn AudioGraph, settings: &MasterSettings) -> Result<Self> {
        let nodes = build_series(
            graph,
            &[
                settings.stage_spec(MasterStage::Volume),
                settings.stage_spec(MasterStage::Output),
            ],
        )?;
        Ok(MasterChain::PassThrough {
            volume: nodes[0],
            output: nodes[1],
        })
    }

    pub fn fidelity(&self) -> Fidelity {
        match self {
            MasterChain::Full { .. } => Fidelity::Full,
            MasterChain::PassThrough { .. } => Fidelity::Reduced,
            MasterChain::Inert => Fidelity::Silent,
        }
    }

    pub fn stage(&self, stage: MasterStage) -> Option<NodeId> {
        match self {
            MasterChain::Full { stages } => stages
                .iter()
                .find(|(s, _)| *s == stage)
                .map(|(_, node)| *node),
            MasterChain::PassThrough { volume, output } => match stage {
                MasterStage::Volume => Some(*volume),
                MasterStage::Output => Some(*output),
                _ => None,
            },
            MasterChain::Inert => None,
        }
    }

    /// Node every entity and voice connects into
    pub fn input(&self) -> Option<NodeId> {
        self.stage(MasterStage::Volume)
    }

    /// Write one control onto its stage
    ///
    /// Missing stages and properties the platform lacks are skipped; write
    /// failures are logged and swallowed.
    pub fn apply(
        &self,
        graph: &dyn AudioGraph,
        profile: &CompatProfile,
        control: MasterControl,
        value: f32,
    ) {
        let Some(node) = self.stage(control.stage()) else {
            tracing::debug!(control = ?control, "stage not present in this chain");
            return;
        };
        let Some(kind) = stage_kind(control.stage()) else {
            return;
        };
        if !profile.supports(kind, control.param()) {
            tracing::debug!(control = ?control, "platform lacks this property");
            return;
        }
        if let Err(err) = graph.set_param(node, control.param(), control.clamp(value)) {
            tracing::warn!(
                control = ?control,
                error = %err,
                error_code = err.error_code(),
                "master control write failed"
            );
        }
    }

    /// Disconnect and free every stage
    pub fn dispose(&self, graph: &dyn AudioGraph) {
        match self {
            MasterChain::Full { stages } => {
                let nodes: Vec<NodeId> = stages.iter().map(|(_, node)| *node).collect();
                unwind(graph, &nodes);
            }
            MasterChain::PassThrough { volume, output } => unwind(graph, &[*volume, *output]),
            MasterChain::Inert => {}
        }
    }
}

fn stage_kind(stage: MasterStage) -> Option<NodeKind> {
    match stage {
        MasterStage::Volume => Some(NodeKind::Gain),
        MasterStage::Distortion => Some(NodeKind::Distortion),
        MasterStage::Filter => Some(NodeKind::Filter),
        MasterStage::Reverb => Some(NodeKind::Reverb),
        MasterStage::Delay => Some(NodeKind::Delay),
        MasterStage::Chorus => Some(NodeKind::Chorus),
        MasterStage::Output => None,
    }
}
