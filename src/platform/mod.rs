//! Host audio platform boundary
//!
//! Everything the engine does to produce sound goes through [`AudioGraph`]:
//! creating nodes, wiring them, writing parameters and scheduling voice
//! events against the platform clock. [`AudioPlatform`] adds the pieces only
//! the startup gate needs (context resume and platform identification).
//!
//! Host bindings implement these traits over their native audio API. The
//! crate ships [`MemoryPlatform`], which keeps the graph in memory and is used
//! by the CLI, headless hosts and the test suite.

mod compat;
mod memory;

pub use compat::{Capability, CompatProfile, PlatformInfo};
pub use memory::{GraphSnapshot, MemoryPlatform, NodeSnapshot, EVENT_HISTORY_SECONDS};

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::music::Note;

// ============================================================================
// Node Identity
// ============================================================================

/// Opaque handle to a node owned by the platform graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Node category, without construction parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Gain,
    Distortion,
    Filter,
    Reverb,
    Delay,
    Chorus,
    Panner,
    Meter,
    Synth,
    Destination,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Gain => "gain",
            NodeKind::Distortion => "distortion",
            NodeKind::Filter => "filter",
            NodeKind::Reverb => "reverb",
            NodeKind::Delay => "delay",
            NodeKind::Chorus => "chorus",
            NodeKind::Panner => "panner",
            NodeKind::Meter => "meter",
            NodeKind::Synth => "synth",
            NodeKind::Destination => "destination",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Writable node properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Param {
    Gain,
    Frequency,
    Wet,
    Feedback,
    DelayTime,
    Depth,
    Bits,
    Amount,
    Decay,
}

impl Param {
    pub fn as_str(&self) -> &'static str {
        match self {
            Param::Gain => "gain",
            Param::Frequency => "frequency",
            Param::Wet => "wet",
            Param::Feedback => "feedback",
            Param::DelayTime => "delay_time",
            Param::Depth => "depth",
            Param::Bits => "bits",
            Param::Amount => "amount",
            Param::Decay => "decay",
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Node Construction
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterType {
    Lowpass,
    Highpass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Waveform {
    Sine,
    Triangle,
    Sawtooth,
    Square,
}

/// ADSR envelope, times in seconds and sustain as a 0..1 level
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub attack: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
}

/// Voice architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceFamily {
    /// One note at a time
    Mono,
    /// Several simultaneous notes
    Poly,
    /// Pitched percussion with a fast pitch sweep
    Membrane,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceConfig {
    pub family: VoiceFamily,
    pub waveform: Waveform,
    pub envelope: Envelope,
    pub polyphony: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PanningModel {
    EqualPower,
    Hrtf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceModel {
    Linear,
    Inverse,
    Exponential,
}

/// 3D panner construction parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PannerConfig {
    pub panning_model: PanningModel,
    pub distance_model: DistanceModel,
    pub ref_distance: f32,
    pub max_distance: f32,
    pub rolloff_factor: f32,
}

impl Default for PannerConfig {
    fn default() -> Self {
        Self {
            panning_model: PanningModel::Hrtf,
            distance_model: DistanceModel::Inverse,
            ref_distance: 1.0,
            max_distance: 50.0,
            rolloff_factor: 1.0,
        }
    }
}

/// Everything needed to create one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeSpec {
    Gain { gain: f32 },
    Distortion { amount: f32, bits: f32 },
    Filter { filter_type: FilterType, frequency: f32 },
    Reverb { decay: f32, wet: f32 },
    Delay { time: f32, feedback: f32, wet: f32 },
    Chorus { frequency: f32, delay_time: f32, depth: f32, wet: f32 },
    Panner(PannerConfig),
    Meter { smoothing: f32 },
    Synth(VoiceConfig),
    Destination,
}

impl NodeSpec {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeSpec::Gain { .. } => NodeKind::Gain,
            NodeSpec::Distortion { .. } => NodeKind::Distortion,
            NodeSpec::Filter { .. } => NodeKind::Filter,
            NodeSpec::Reverb { .. } => NodeKind::Reverb,
            NodeSpec::Delay { .. } => NodeKind::Delay,
            NodeSpec::Chorus { .. } => NodeKind::Chorus,
            NodeSpec::Panner(_) => NodeKind::Panner,
            NodeSpec::Meter { .. } => NodeKind::Meter,
            NodeSpec::Synth(_) => NodeKind::Synth,
            NodeSpec::Destination => NodeKind::Destination,
        }
    }

    /// Parameter values the node starts with
    pub fn initial_params(&self) -> Vec<(Param, f32)> {
        match *self {
            NodeSpec::Gain { gain } => vec![(Param::Gain, gain)],
            NodeSpec::Distortion { amount, bits } => {
                vec![(Param::Amount, amount), (Param::Bits, bits)]
            }
            NodeSpec::Filter { frequency, .. } => vec![(Param::Frequency, frequency)],
            NodeSpec::Reverb { decay, wet } => vec![(Param::Decay, decay), (Param::Wet, wet)],
            NodeSpec::Delay {
                time,
                feedback,
                wet,
            } => vec![
                (Param::DelayTime, time),
                (Param::Feedback, feedback),
                (Param::Wet, wet),
            ],
            NodeSpec::Chorus {
                frequency,
                delay_time,
                depth,
                wet,
            } => vec![
                (Param::Frequency, frequency),
                (Param::DelayTime, delay_time),
                (Param::Depth, depth),
                (Param::Wet, wet),
            ],
            NodeSpec::Panner(_)
            | NodeSpec::Meter { .. }
            | NodeSpec::Synth(_)
            | NodeSpec::Destination => Vec::new(),
        }
    }
}

// ============================================================================
// Scheduling
// ============================================================================

/// Listener-relative position in world units
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Position {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// Note events a synth node understands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum VoiceEvent {
    /// Start the notes and release them after `duration` seconds
    AttackRelease {
        notes: Vec<Note>,
        duration: f64,
        velocity: f32,
    },
    /// Start the notes and hold them until released
    Attack { notes: Vec<Note>, velocity: f32 },
    /// Release held notes
    Release { notes: Vec<Note> },
    /// Silence everything the voice is playing
    ReleaseAll,
}

/// A voice event placed on the platform timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub node: NodeId,
    pub at: f64,
    pub event: VoiceEvent,
}

// ============================================================================
// Platform Traits
// ============================================================================

/// Synchronous graph operations on the host audio subsystem
pub trait AudioGraph: Send + Sync {
    /// Current time of the platform audio clock, in seconds
    fn now(&self) -> f64;

    fn create_node(&self, spec: &NodeSpec) -> Result<NodeId>;

    fn connect(&self, from: NodeId, to: NodeId) -> Result<()>;

    /// Disconnect every outgoing connection of `node`
    fn disconnect(&self, node: NodeId) -> Result<()>;

    /// Free the node; its id must not be used afterwards
    fn dispose_node(&self, node: NodeId) -> Result<()>;

    fn set_param(&self, node: NodeId, param: Param, value: f32) -> Result<()>;

    fn set_position(&self, node: NodeId, position: Position) -> Result<()>;

    fn schedule(&self, node: NodeId, event: VoiceEvent, at: f64) -> Result<()>;

    /// Drop every event on `node` scheduled at or after `after`
    fn cancel_scheduled(&self, node: NodeId, after: f64) -> Result<()>;

    /// Raw 0..1 level observed at a meter node
    fn read_level(&self, node: NodeId) -> f32;
}

/// Full host platform: the graph plus context lifecycle
pub trait AudioPlatform: AudioGraph {
    /// Identification used by the compatibility adapter
    fn info(&self) -> PlatformInfo;

    /// Resume the suspended audio context
    ///
    /// Hosts only allow this after a qualifying user interaction.
    fn resume(&self) -> impl Future<Output = Result<()>> + Send;
}
