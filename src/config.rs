//! Engine configuration
//!
//! Every field has a default, so an empty JSON object is a valid config.
//! Environment variables prefixed `ORBITONE_` override file values.

use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dsp::MasterSettings;
use crate::error::{EngineError, Result};
use crate::music::{Interval, Note};
use crate::platform::PannerConfig;

/// Lead time added to the clock when scheduling, in seconds
///
/// Clock reads are floating point and may already be in the past by the time
/// the event reaches the platform; scheduling slightly ahead keeps every
/// start time non-negative relative to the platform clock.
pub const SCHEDULE_EPSILON: f64 = 0.01;

/// Default loop lookahead window, in seconds
pub const DEFAULT_LOOKAHEAD: f64 = 0.1;

/// Default meter smoothing factor
pub const DEFAULT_METER_SMOOTHING: f32 = 0.8;

fn default_chord() -> Vec<Note> {
    // C major triad
    vec![Note::MIDDLE_C, Note::MIDDLE_C.transpose(4), Note::MIDDLE_C.transpose(7)]
}

/// Tunables of an [`AudioEngine`](crate::engine::AudioEngine)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Seconds between the clock read and the scheduled start of a trigger
    pub schedule_epsilon: f64,
    /// Window ahead of the clock in which loop repetitions are scheduled
    pub lookahead: f64,
    /// Smoothing factor of entity level meters (0..1)
    pub meter_smoothing: f32,
    pub panner: PannerConfig,
    /// Pitch of `play_note` without an explicit note
    pub default_note: Note,
    /// Pitches of `play_chord` without explicit notes
    pub default_chord: Vec<Note>,
    /// Pitch of percussive hits
    pub default_beat_note: Note,
    /// Repeat interval of `start_loop` without an explicit interval
    pub default_loop_interval: Interval,
    /// Length of note, chord, beat and loop hits
    pub note_duration: Interval,
    /// User-agent markers of engine variants that run silently
    pub incompatible_agents: Vec<String>,
    /// Master chain values before any setter runs
    pub master: MasterSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schedule_epsilon: SCHEDULE_EPSILON,
            lookahead: DEFAULT_LOOKAHEAD,
            meter_smoothing: DEFAULT_METER_SMOOTHING,
            panner: PannerConfig::default(),
            default_note: Note::MIDDLE_C,
            default_chord: default_chord(),
            default_beat_note: Note::MIDDLE_C.transpose(-24),
            default_loop_interval: Interval::ONE_MEASURE,
            note_duration: Interval::EIGHTH,
            incompatible_agents: vec!["Firefox/".to_string()],
            master: MasterSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document and validate it
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file and validate it
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Apply `ORBITONE_*` environment overrides
    ///
    /// Recognised: `ORBITONE_SCHEDULE_EPSILON`, `ORBITONE_LOOKAHEAD`,
    /// `ORBITONE_METER_SMOOTHING`, `ORBITONE_INCOMPATIBLE_AGENTS`
    /// (comma separated). Unparseable values are ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(value) = env_number("ORBITONE_SCHEDULE_EPSILON") {
            self.schedule_epsilon = value;
        }
        if let Some(value) = env_number("ORBITONE_LOOKAHEAD") {
            self.lookahead = value;
        }
        if let Some(value) = env_number("ORBITONE_METER_SMOOTHING") {
            self.meter_smoothing = value as f32;
        }
        if let Ok(agents) = env::var("ORBITONE_INCOMPATIBLE_AGENTS") {
            self.incompatible_agents = agents
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        self
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(EngineError::Config {
                reason: reason.to_string(),
            })
        };
        if !(self.schedule_epsilon > 0.0 && self.schedule_epsilon.is_finite()) {
            return invalid("schedule_epsilon must be positive");
        }
        if !(self.lookahead > 0.0 && self.lookahead.is_finite()) {
            return invalid("lookahead must be positive");
        }
        if !(0.0..1.0).contains(&self.meter_smoothing) {
            return invalid("meter_smoothing must be in [0, 1)");
        }
        if self.default_chord.is_empty() {
            return invalid("default_chord must contain at least one note");
        }
        let panner = &self.panner;
        if !(panner.ref_distance > 0.0 && panner.max_distance >= panner.ref_distance) {
            return invalid("panner distances must satisfy 0 < ref_distance <= max_distance");
        }
        if panner.rolloff_factor < 0.0 {
            return invalid("panner rolloff_factor must not be negative");
        }
        Ok(())
    }
}

fn env_number(name: &str) -> Option<f64> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse::<f64>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "ignoring unparseable override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.schedule_epsilon, 0.01);
        assert_eq!(config.meter_smoothing, 0.8);
        assert_eq!(config.default_beat_note.name(), "C2");
        assert_eq!(config.default_loop_interval.to_string(), "1m");
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config = EngineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_partial_json_overrides() {
        let config = EngineConfig::from_json_str(
            r#"{"default_note": "E4", "default_loop_interval": "2n", "master": {"master_volume": 0.5}}"#,
        )
        .unwrap();
        assert_eq!(config.default_note.name(), "E4");
        assert_eq!(config.default_loop_interval.to_string(), "2n");
        assert_eq!(config.master.master_volume, 0.5);
        assert_eq!(config.master.reverb_wet, MasterSettings::default().reverb_wet);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(EngineConfig::from_json_str(r#"{"default_note": "Q4"}"#).is_err());
        assert!(EngineConfig::from_json_str(r#"{"meter_smoothing": 1.0}"#).is_err());
        assert!(EngineConfig::from_json_str(r#"{"schedule_epsilon": 0}"#).is_err());
        assert!(EngineConfig::from_json_str(r#"{"default_chord": []}"#).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"lookahead": 0.25}}"#).unwrap();
        let config = EngineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.lookahead, 0.25);

        let missing = EngineConfig::from_json_file("/nonexistent/orbitone.json");
        assert_eq!(missing.unwrap_err().error_code(), "IO_ERROR");
    }
}
