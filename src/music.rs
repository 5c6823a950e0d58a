//! Musical values exchanged with the settings store and the UI
//!
//! Notes use scientific pitch names (`C4` is MIDI 60, `A4` is 440 Hz).
//! Intervals use transport notation in 4/4: `1m` is one measure, `4n` a
//! quarter note, `8t` an eighth-note triplet, `4n.` a dotted quarter and
//! `0.5s` (or a bare number) plain seconds.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Beats per measure; the transport only runs in 4/4
const BEATS_PER_MEASURE: f64 = 4.0;

/// Shortest absolute interval accepted, in seconds
pub const MIN_INTERVAL_SECONDS: f64 = 0.01;

fn semitone_of(letter: char) -> Option<i32> {
    match letter.to_ascii_uppercase() {
        'C' => Some(0),
        'D' => Some(2),
        'E' => Some(4),
        'F' => Some(5),
        'G' => Some(7),
        'A' => Some(9),
        'B' => Some(11),
        _ => None,
    }
}

/// Parse a pitch class with optional accidentals, returning the semitone
/// offset from C and the unparsed remainder
fn parse_pitch_class(input: &str) -> Option<(i32, &str)> {
    let mut chars = input.char_indices();
    let (_, letter) = chars.next()?;
    let mut semitone = semitone_of(letter)?;
    let mut rest_at = letter.len_utf8();
    for (idx, c) in chars {
        match c {
            '#' | 's' => semitone += 1,
            'b' => semitone -= 1,
            _ => {
                rest_at = idx;
                break;
            }
        }
        rest_at = idx + c.len_utf8();
    }
    Some((semitone, &input[rest_at..]))
}

// ============================================================================
// Note
// ============================================================================

/// A pitch on the MIDI note grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Note {
    midi: u8,
}

impl Note {
    pub const MIDDLE_C: Note = Note { midi: 60 };

    /// Create a note from a MIDI number (0..=127)
    pub fn from_midi(midi: u8) -> Result<Self> {
        if midi > 127 {
            return Err(EngineError::InvalidNote {
                input: midi.to_string(),
            });
        }
        Ok(Self { midi })
    }

    pub fn midi(&self) -> u8 {
        self.midi
    }

    /// Frequency in Hz, equal temperament with A4 = 440 Hz
    pub fn frequency(&self) -> f32 {
        440.0 * 2.0_f32.powf((self.midi as f32 - 69.0) / 12.0)
    }

    /// Shift by `semitones`, clamped to the MIDI range
    pub fn transpose(&self, semitones: i32) -> Self {
        let midi = (self.midi as i32 + semitones).clamp(0, 127);
        Self { midi: midi as u8 }
    }

    pub fn octave(&self) -> i32 {
        self.midi as i32 / 12 - 1
    }

    pub fn name(&self) -> String {
        format!("{}{}", NOTE_NAMES[(self.midi % 12) as usize], self.octave())
    }
}

impl FromStr for Note {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || EngineError::InvalidNote {
            input: s.to_string(),
        };
        let trimmed = s.trim();
        let (semitone, octave) = parse_pitch_class(trimmed).ok_or_else(invalid)?;
        let octave: i32 = octave.parse().map_err(|_| invalid())?;
        let midi = 12 * (octave + 1) + semitone;
        if !(0..=127).contains(&midi) {
            return Err(invalid());
        }
        Ok(Self { midi: midi as u8 })
    }
}

impl TryFrom<String> for Note {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Note> for String {
    fn from(note: Note) -> Self {
        note.name()
    }
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

// ============================================================================
// Musical Key
// ============================================================================

/// Global key, applied as a transposition from C
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MusicalKey {
    offset: i32,
}

impl MusicalKey {
    /// Semitones above C, in 0..12
    pub fn offset(&self) -> i32 {
        self.offset
    }
}

impl FromStr for MusicalKey {
    type Err = EngineError;

    /// Accepts a root with optional accidental and mode suffix
    /// (`"D"`, `"Bb"`, `"F# minor"`, `"Am"`)
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || EngineError::InvalidNote {
            input: s.to_string(),
        };
        let (semitone, rest) = parse_pitch_class(s.trim()).ok_or_else(invalid)?;
        let mode = rest.trim().to_ascii_lowercase();
        if !matches!(mode.as_str(), "" | "m" | "major" | "minor" | "maj" | "min") {
            return Err(invalid());
        }
        Ok(Self {
            offset: semitone.rem_euclid(12),
        })
    }
}

// ============================================================================
// Interval
// ============================================================================

/// Rhythmic modifier of a note value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier {
    Plain,
    /// Half again as long
    Dotted,
    /// Three in the time of two
    Triplet,
}

/// Transport time value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Interval {
    /// Whole measures (`1m`, `2m`)
    Measures(u32),
    /// Note values (`4n`, `8n.`, `8t`)
    Subdivision { division: u32, modifier: Modifier },
    /// Absolute time (`0.5s`); parsing rejects anything below
    /// [`MIN_INTERVAL_SECONDS`]
    Seconds(f64),
}

impl Interval {
    pub const ONE_MEASURE: Interval = Interval::Measures(1);

    pub const EIGHTH: Interval = Interval::Subdivision {
        division: 8,
        modifier: Modifier::Plain,
    };

    /// Length in seconds at `bpm` quarter-note beats per minute
    pub fn to_seconds(&self, bpm: f64) -> f64 {
        let beat = 60.0 / bpm.max(1.0);
        match *self {
            Interval::Measures(count) => count as f64 * BEATS_PER_MEASURE * beat,
            Interval::Subdivision { division, modifier } => {
                let base = BEATS_PER_MEASURE / division as f64 * beat;
                match modifier {
                    Modifier::Plain => base,
                    Modifier::Dotted => base * 1.5,
                    Modifier::Triplet => base * 2.0 / 3.0,
                }
            }
            Interval::Seconds(secs) => secs,
        }
    }
}

impl FromStr for Interval {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || EngineError::InvalidInterval {
            input: s.to_string(),
        };
        let trimmed = s.trim();

        if let Ok(secs) = trimmed.trim_end_matches('s').parse::<f64>() {
            if secs >= MIN_INTERVAL_SECONDS && secs.is_finite() {
                return Ok(Interval::Seconds(secs));
            }
            return Err(invalid());
        }

        if let Some(count) = trimmed.strip_suffix('m') {
            let count: u32 = count.parse().map_err(|_| invalid())?;
            if count == 0 {
                return Err(invalid());
            }
            return Ok(Interval::Measures(count));
        }

        let (body, modifier) = if let Some(body) = trimmed.strip_suffix('.') {
            (body.strip_suffix('n').ok_or_else(invalid)?, Modifier::Dotted)
        } else if let Some(body) = trimmed.strip_suffix('t') {
            (body, Modifier::Triplet)
        } else {
            (trimmed.strip_suffix('n').ok_or_else(invalid)?, Modifier::Plain)
        };

        let division: u32 = body.parse().map_err(|_| invalid())?;
        if division == 0 || !division.is_power_of_two() || division > 64 {
            return Err(invalid());
        }
        Ok(Interval::Subdivision { division, modifier })
    }
}

impl TryFrom<String> for Interval {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Interval> for String {
    fn from(interval: Interval) -> Self {
        interval.to_string()
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Interval::Measures(count) => write!(f, "{}m", count),
            Interval::Subdivision { division, modifier } => match modifier {
                Modifier::Plain => write!(f, "{}n", division),
                Modifier::Dotted => write!(f, "{}n.", division),
                Modifier::Triplet => write!(f, "{}t", division),
            },
            Interval::Seconds(secs) => write!(f, "{}s", secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use test_case::test_case;

    #[test_case("C4", 60)]
    #[test_case("A4", 69)]
    #[test_case("C#4", 61)]
    #[test_case("Db4", 61)]
    #[test_case("Fs3", 54)]
    #[test_case("B-1", 11)]
    #[test_case("G9", 127)]
    fn test_parse_note(input: &str, midi: u8) {
        let note: Note = input.parse().unwrap();
        assert_eq!(note.midi(), midi);
    }

    #[test_case("H4")]
    #[test_case("C")]
    #[test_case("")]
    #[test_case("G#9")]
    fn test_reject_note(input: &str) {
        assert!(input.parse::<Note>().is_err());
    }

    #[test]
    fn test_note_frequency_and_transpose() {
        let a4: Note = "A4".parse().unwrap();
        assert_relative_eq!(a4.frequency(), 440.0, epsilon = 1e-3);
        assert_eq!(Note::MIDDLE_C.transpose(4).name(), "E4");
        assert_eq!(Note::MIDDLE_C.transpose(-200).midi(), 0);
    }

    #[test]
    fn test_note_serde_uses_names() {
        let json = serde_json::to_string(&Note::MIDDLE_C).unwrap();
        assert_eq!(json, "\"C4\"");
        let back: Note = serde_json::from_str("\"Eb3\"").unwrap();
        assert_eq!(back.name(), "D#3");
    }

    #[test_case("C", 0)]
    #[test_case("D", 2)]
    #[test_case("Bb", 10)]
    #[test_case("F# minor", 6)]
    #[test_case("Am", 9)]
    fn test_parse_key(input: &str, offset: i32) {
        let key: MusicalKey = input.parse().unwrap();
        assert_eq!(key.offset(), offset);
    }

    #[test_case("1m", 2.0)]
    #[test_case("2m", 4.0)]
    #[test_case("4n", 0.5)]
    #[test_case("8n", 0.25)]
    #[test_case("4n.", 0.75)]
    #[test_case("0.3s", 0.3)]
    fn test_interval_seconds_at_120(input: &str, expected: f64) {
        let interval: Interval = input.parse().unwrap();
        assert_relative_eq!(interval.to_seconds(120.0), expected, epsilon = 1e-9);
    }

    #[test]
    fn test_triplet_interval() {
        let triplet: Interval = "8t".parse().unwrap();
        assert_relative_eq!(triplet.to_seconds(120.0), 0.25 * 2.0 / 3.0, epsilon = 1e-9);
        assert_eq!(triplet.to_string(), "8t");
    }

    #[test_case("0m")]
    #[test_case("3n")]
    #[test_case("xn")]
    #[test_case("-1s")]
    #[test_case("0.000001s")]
    #[test_case("1e-9s")]
    fn test_reject_interval(input: &str) {
        assert!(input.parse::<Interval>().is_err());
    }
}
