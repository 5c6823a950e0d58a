//! Synth preset table
//!
//! A preset fixes the oscillator waveform and ADSR envelope of melodic
//! voices. Percussive voices ignore presets and use [`membrane_config`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::platform::{Envelope, VoiceConfig, VoiceFamily, Waveform};

/// Simultaneous notes of a polyphonic voice
pub const POLYPHONY: usize = 8;

/// Named sound of melodic voices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    #[default]
    Lead,
    Pad,
    Bass,
    Pluck,
}

impl Preset {
    pub const ALL: [Preset; 4] = [Preset::Lead, Preset::Pad, Preset::Bass, Preset::Pluck];

    pub fn as_str(&self) -> &'static str {
        match self {
            Preset::Lead => "lead",
            Preset::Pad => "pad",
            Preset::Bass => "bass",
            Preset::Pluck => "pluck",
        }
    }

    pub fn waveform(&self) -> Waveform {
        match self {
            Preset::Lead => Waveform::Sawtooth,
            Preset::Pad => Waveform::Sine,
            Preset::Bass => Waveform::Square,
            Preset::Pluck => Waveform::Triangle,
        }
    }

    pub fn envelope(&self) -> Envelope {
        match self {
            Preset::Lead => Envelope {
                attack: 0.01,
                decay: 0.2,
                sustain: 0.6,
                release: 0.4,
            },
            Preset::Pad => Envelope {
                attack: 0.6,
                decay: 0.4,
                sustain: 0.8,
                release: 1.5,
            },
            Preset::Bass => Envelope {
                attack: 0.01,
                decay: 0.3,
                sustain: 0.4,
                release: 0.2,
            },
            Preset::Pluck => Envelope {
                attack: 0.001,
                decay: 0.25,
                sustain: 0.0,
                release: 0.3,
            },
        }
    }

    /// Voice configuration for this preset in the given family
    pub fn voice_config(&self, family: VoiceFamily) -> VoiceConfig {
        if family == VoiceFamily::Membrane {
            return membrane_config();
        }
        VoiceConfig {
            family,
            waveform: self.waveform(),
            envelope: self.envelope(),
            polyphony: polyphony_of(family),
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Preset {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "lead" => Ok(Preset::Lead),
            "pad" => Ok(Preset::Pad),
            "bass" => Ok(Preset::Bass),
            "pluck" => Ok(Preset::Pluck),
            _ => Err(EngineError::UnknownPreset {
                name: s.to_string(),
            }),
        }
    }
}

fn polyphony_of(family: VoiceFamily) -> usize {
    match family {
        VoiceFamily::Poly => POLYPHONY,
        VoiceFamily::Mono | VoiceFamily::Membrane => 1,
    }
}

/// Pitched percussion voice used by beat entities
pub fn membrane_config() -> VoiceConfig {
    VoiceConfig {
        family: VoiceFamily::Membrane,
        waveform: Waveform::Sine,
        envelope: Envelope {
            attack: 0.001,
            decay: 0.4,
            sustain: 0.01,
            release: 1.4,
        },
        polyphony: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_parse_and_display() {
        for preset in Preset::ALL {
            assert_eq!(preset.as_str().parse::<Preset>().unwrap(), preset);
        }
        assert!("organ".parse::<Preset>().is_err());
    }

    #[test]
    fn test_envelopes_are_sane() {
        for preset in Preset::ALL {
            let env = preset.envelope();
            assert!(env.attack > 0.0);
            assert!((0.0..=1.0).contains(&env.sustain));
            assert!(env.release > 0.0);
        }
    }

    #[test]
    fn test_membrane_ignores_preset() {
        let config = Preset::Pad.voice_config(VoiceFamily::Membrane);
        assert_eq!(config, membrane_config());
        assert_eq!(Preset::Pad.voice_config(VoiceFamily::Poly).polyphony, POLYPHONY);
    }
}
