//! Audio Engine Module
//!
//! The engine object and the pieces it coordinates:
//! - Lifecycle state and single-flight startup bookkeeping
//! - Per-entity audio resources
//! - Loop transport

mod audio_engine;
pub mod lifecycle;
pub mod registry;
pub mod transport;

pub use audio_engine::AudioEngine;
pub use lifecycle::{EngineState, InitSubscription, Readiness};
pub use registry::{EntityAudioResource, EntityRegistry, VoiceBundle};
pub use transport::{spawn_transport, DueTick, LoopHandle, LoopRegistration, LoopScheduler};
