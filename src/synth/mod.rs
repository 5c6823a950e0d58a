//! Synth voices
//!
//! Preset table plus the pool that recycles voices between entities.

mod pool;
mod preset;

pub use pool::{create_voice, PoolKey, PooledVoice, VoicePool};
pub use preset::{membrane_config, Preset, POLYPHONY};
