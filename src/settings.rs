//! Read-only view of the host's settings store
//!
//! The engine consults these values on every trigger and never writes them.
//! [`SharedSettings`] is a ready-made store for hosts that do not have one.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::dsp::{EffectParams, EffectPatch};
use crate::error::Result;
use crate::music::MusicalKey;
use crate::synth::Preset;

/// Slowest tempo the transport accepts
pub const MIN_TEMPO_BPM: f64 = 20.0;

/// Fastest tempo the transport accepts
pub const MAX_TEMPO_BPM: f64 = 300.0;

/// Tempo used until the host sets one
pub const DEFAULT_TEMPO_BPM: f64 = 120.0;

/// Settings the engine reads before each trigger
pub trait SettingsProvider: Send + Sync {
    /// Global key; notes are transposed by its offset from C
    fn key(&self) -> MusicalKey;

    /// Transport tempo in BPM
    fn tempo(&self) -> f64;

    /// Preset for newly built melodic voices
    fn preset(&self) -> Preset;

    /// Effect amounts for one entity
    fn effect_params(&self, entity_id: &str) -> EffectParams;
}

#[derive(Debug)]
struct SettingsInner {
    key: MusicalKey,
    tempo: f64,
    preset: Preset,
    defaults: EffectParams,
    effects: HashMap<String, EffectParams>,
}

/// In-process settings store
#[derive(Debug)]
pub struct SharedSettings {
    inner: RwLock<SettingsInner>,
}

impl Default for SharedSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedSettings {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(SettingsInner {
                key: MusicalKey::default(),
                tempo: DEFAULT_TEMPO_BPM,
                preset: Preset::default(),
                defaults: EffectParams::default(),
                effects: HashMap::new(),
            }),
        }
    }

    /// Set the key from a name such as `"D"` or `"Bb minor"`
    pub fn set_key(&self, key: &str) -> Result<()> {
        let key: MusicalKey = key.parse()?;
        self.inner.write().key = key;
        Ok(())
    }

    /// Set the tempo, clamped to the supported range
    pub fn set_tempo(&self, bpm: f64) {
        let bpm = if bpm.is_finite() {
            bpm.clamp(MIN_TEMPO_BPM, MAX_TEMPO_BPM)
        } else {
            DEFAULT_TEMPO_BPM
        };
        self.inner.write().tempo = bpm;
    }

    pub fn set_preset(&self, preset: Preset) {
        self.inner.write().preset = preset;
    }

    /// Merge `patch` into the stored parameters of `entity_id`
    pub fn set_effect(&self, entity_id: &str, patch: EffectPatch) {
        let mut inner = self.inner.write();
        let base = inner
            .effects
            .get(entity_id)
            .copied()
            .unwrap_or(inner.defaults);
        inner
            .effects
            .insert(entity_id.to_string(), base.merged(&patch));
    }

    /// Parameters used by entities without their own entry
    pub fn set_default_effects(&self, params: EffectParams) {
        self.inner.write().defaults = params;
    }

    /// Forget the parameters of a removed entity
    pub fn remove_entity(&self, entity_id: &str) {
        self.inner.write().effects.remove(entity_id);
    }
}

impl SettingsProvider for SharedSettings {
    fn key(&self) -> MusicalKey {
        self.inner.read().key
    }

    fn tempo(&self) -> f64 {
        self.inner.read().tempo
    }

    fn preset(&self) -> Preset {
        self.inner.read().preset
    }

    fn effect_params(&self, entity_id: &str) -> EffectParams {
        let inner = self.inner.read();
        inner
            .effects
            .get(entity_id)
            .copied()
            .unwrap_or(inner.defaults)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effect_patches_accumulate() {
        let settings = SharedSettings::new();
        settings.set_effect("o1", EffectPatch::reverb(0.5));
        settings.set_effect("o1", EffectPatch::delay(0.2));
        let params = settings.effect_params("o1");
        assert_eq!(params.reverb, 0.5);
        assert_eq!(params.delay, 0.2);
        assert_eq!(settings.effect_params("other"), EffectParams::default());

        settings.remove_entity("o1");
        assert_eq!(settings.effect_params("o1"), EffectParams::default());
    }

    #[test]
    fn test_tempo_is_clamped() {
        let settings = SharedSettings::new();
        settings.set_tempo(1000.0);
        assert_eq!(settings.tempo(), MAX_TEMPO_BPM);
        settings.set_tempo(f64::NAN);
        assert_eq!(settings.tempo(), DEFAULT_TEMPO_BPM);
    }

    #[test]
    fn test_key_and_preset() {
        let settings = SharedSettings::new();
        settings.set_key("E").unwrap();
        assert_eq!(settings.key().offset(), 4);
        assert!(settings.set_key("X").is_err());
        settings.set_preset(Preset::Pad);
        assert_eq!(settings.preset(), Preset::Pad);
    }
}
