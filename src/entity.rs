//! Entity kinds shared by the registry, pool and transport
//!
//! Entity ids are plain strings owned by the host's object store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::platform::VoiceFamily;

/// What an entity plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Note,
    Chord,
    Beat,
    Loop,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Note,
        EntityKind::Chord,
        EntityKind::Beat,
        EntityKind::Loop,
    ];

    /// Melodic kinds follow the globally selected synth preset
    pub fn is_melodic(&self) -> bool {
        !matches!(self, EntityKind::Beat)
    }

    pub fn voice_family(&self) -> VoiceFamily {
        match self {
            EntityKind::Note => VoiceFamily::Mono,
            EntityKind::Chord | EntityKind::Loop => VoiceFamily::Poly,
            EntityKind::Beat => VoiceFamily::Membrane,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Note => "note",
            EntityKind::Chord => "chord",
            EntityKind::Beat => "beat",
            EntityKind::Loop => "loop",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "note" => Ok(EntityKind::Note),
            "chord" => Ok(EntityKind::Chord),
            "beat" | "drum" => Ok(EntityKind::Beat),
            "loop" => Ok(EntityKind::Loop),
            other => Err(EngineError::Config {
                reason: format!("unknown entity kind '{}'", other),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voice_family_per_kind() {
        assert_eq!(EntityKind::Note.voice_family(), VoiceFamily::Mono);
        assert_eq!(EntityKind::Chord.voice_family(), VoiceFamily::Poly);
        assert_eq!(EntityKind::Beat.voice_family(), VoiceFamily::Membrane);
        assert!(!EntityKind::Beat.is_melodic());
        assert!(EntityKind::Loop.is_melodic());
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!("Drum".parse::<EntityKind>().unwrap(), EntityKind::Beat);
        assert!("pad".parse::<EntityKind>().is_err());
    }
}
