//! Orbitone - Entity Audio Engine
//!
//! Turns discrete intents ("play this note", "start this loop", "change this
//! effect amount") into scheduled sound for a changing set of user-created
//! entities, on top of a host audio platform that may refuse to start, lack
//! node properties, or fail halfway through building a graph.
//!
//! # Architecture
//!
//! - [`platform`]: the only boundary to the host audio subsystem, plus an
//!   in-memory implementation
//! - [`dsp`]: master chain, per-entity sub-chains, parameter mapping
//! - [`synth`]: voice presets and the voice pool
//! - [`engine`]: lifecycle gate, entity registry, loop transport and the
//!   [`AudioEngine`] object tying them together

pub mod cli;
pub mod config;
pub mod dsp;
pub mod engine;
pub mod entity;
pub mod error;
pub mod music;
pub mod platform;
pub mod settings;
pub mod synth;

pub use config::EngineConfig;
pub use engine::{AudioEngine, EngineState, InitSubscription, Readiness};
pub use entity::EntityKind;
pub use error::{EngineError, Result};
pub use music::{Interval, MusicalKey, Note};
pub use platform::{AudioGraph, AudioPlatform, MemoryPlatform, NodeId, Position};
pub use settings::{SettingsProvider, SharedSettings};
pub use synth::Preset;
