//! CLI Command Implementations
//!
//! Each command prints one JSON document on stdout.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::config::EngineConfig;
use crate::dsp::{EffectPatch, Fidelity};
use crate::engine::{AudioEngine, EngineState};
use crate::error::Result;
use crate::platform::{
    Capability, Envelope, GraphSnapshot, MemoryPlatform, PlatformInfo, Position, Waveform,
};
use crate::settings::SharedSettings;
use crate::synth::Preset;

/// Load the config file if given, then apply environment overrides
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => {
            info!("Loading config: {}", path.display());
            EngineConfig::from_json_file(path)?
        }
        None => EngineConfig::default(),
    }
    .with_env_overrides();
    config.validate()?;
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// demo
// ============================================================================

/// Scene parameters of the `demo` command
#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub seconds: f64,
    pub tempo: f64,
    pub key: String,
    pub preset: Preset,
    pub user_agent: Option<String>,
    pub full: bool,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            seconds: 4.0,
            tempo: 120.0,
            key: "C".to_string(),
            preset: Preset::default(),
            user_agent: None,
            full: false,
        }
    }
}

/// What the demo scene left behind
#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    pub engine_id: String,
    pub state: EngineState,
    pub capability: Capability,
    pub fidelity: Option<Fidelity>,
    pub entities: usize,
    pub active_loops: usize,
    pub voices_allocated: usize,
    pub voices_attached: usize,
    pub scheduled_events: usize,
    pub loop_progress: f64,
    pub levels: BTreeMap<String, f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph: Option<GraphSnapshot>,
}

const SCENE: [&str; 4] = ["note-1", "chord-1", "beat-1", "loop-1"];

/// Run the demo scene and return its report
pub async fn run_demo(config: EngineConfig, options: &DemoOptions) -> Result<DemoReport> {
    let platform = Arc::new(match &options.user_agent {
        Some(agent) => MemoryPlatform::with_info(PlatformInfo {
            user_agent: agent.clone(),
            has_audio_api: true,
            missing_params: Vec::new(),
        }),
        None => MemoryPlatform::new(),
    });
    let settings = Arc::new(SharedSettings::new());
    settings.set_key(&options.key)?;
    settings.set_tempo(options.tempo);
    settings.set_preset(options.preset);
    settings.set_effect("note-1", EffectPatch::reverb(0.4));
    settings.set_effect("chord-1", EffectPatch::delay(0.3));

    let lookahead = config.lookahead;
    let engine = AudioEngine::new(Arc::clone(&platform), settings, config);
    let _subscription = engine.on_audio_init(|| info!("Audio initialized"));
    engine.allow_activation();

    engine.play_note("note-1", None).await;
    engine.play_chord("chord-1", None).await;
    engine.play_beat("beat-1").await;
    engine.start_loop("loop-1", None).await;
    engine.set_entity_position("note-1", Position::new(-2.0, 0.0, -1.0));
    engine.set_entity_position("chord-1", Position::new(2.0, 1.0, -3.0));

    let step = lookahead / 2.0;
    let mut elapsed = 0.0;
    let mut next_hit = 1.0;
    while elapsed < options.seconds {
        platform.advance(step);
        elapsed += step;
        engine.tick();
        if elapsed >= next_hit {
            engine.play_note("note-1", None).await;
            engine.play_beat("beat-1").await;
            next_hit += 1.0;
        }
    }

    let levels = SCENE
        .iter()
        .map(|id| (id.to_string(), engine.entity_level(id)))
        .collect();
    let snapshot = platform.snapshot();
    let pool = engine.registry().pool();
    let report = DemoReport {
        engine_id: engine.id().to_string(),
        state: engine.state(),
        capability: engine.profile().capability().clone(),
        fidelity: engine.fidelity(),
        entities: engine.registry().len(),
        active_loops: engine.loops().len(),
        voices_allocated: pool.allocated(),
        voices_attached: pool.attached_count(),
        scheduled_events: snapshot.events.len(),
        loop_progress: engine.loop_progress("loop-1"),
        levels,
        graph: options.full.then_some(snapshot),
    };
    engine.shutdown();
    Ok(report)
}

/// Run the demo scene and print its report
pub async fn demo(config: EngineConfig, options: &DemoOptions) -> Result<()> {
    info!("Running demo for {:.1}s at {} BPM", options.seconds, options.tempo);
    let report = run_demo(config, options).await?;
    print_json(&report)
}

// ============================================================================
// presets
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct PresetInfo {
    pub name: Preset,
    pub waveform: Waveform,
    pub envelope: Envelope,
}

pub fn preset_table() -> Vec<PresetInfo> {
    Preset::ALL
        .iter()
        .map(|preset| PresetInfo {
            name: *preset,
            waveform: preset.waveform(),
            envelope: preset.envelope(),
        })
        .collect()
}

/// Print the preset table
pub fn presets() -> Result<()> {
    print_json(&preset_table())
}

// ============================================================================
// config
// ============================================================================

/// Print the effective configuration
pub fn show_config(config: &EngineConfig) -> Result<()> {
    print_json(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_demo_reaches_ready() {
        let report = run_demo(EngineConfig::default(), &DemoOptions::default())
            .await
            .unwrap();
        assert_eq!(report.state, EngineState::Ready);
        assert_eq!(report.fidelity, Some(Fidelity::Full));
        assert_eq!(report.entities, 4);
        assert_eq!(report.active_loops, 1);
        assert_eq!(report.voices_attached, 4);
        assert!(report.scheduled_events > 4);
        assert!((0.0..1.0).contains(&report.loop_progress));
        assert!(report.graph.is_none());
    }

    #[tokio::test]
    async fn test_demo_on_incompatible_agent_is_silent() {
        let options = DemoOptions {
            user_agent: Some("Mozilla/5.0 Firefox/128.0".to_string()),
            full: true,
            ..DemoOptions::default()
        };
        let report = run_demo(EngineConfig::default(), &options).await.unwrap();
        assert_eq!(report.state, EngineState::Degraded);
        assert_eq!(report.entities, 0);
        assert!(report.fidelity.is_none());
        assert!(report.graph.unwrap().nodes.is_empty());
    }

    #[test]
    fn test_preset_table_lists_all() {
        let table = preset_table();
        assert_eq!(table.len(), Preset::ALL.len());
        let json = serde_json::to_value(&table).unwrap();
        assert_eq!(json[0]["name"], "lead");
    }

    #[test]
    fn test_load_config_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.lookahead, EngineConfig::default().lookahead);
    }
}
