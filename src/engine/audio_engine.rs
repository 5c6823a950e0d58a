//! The engine object
//!
//! One [`AudioEngine`] is built at the application root and shared by
//! reference. Every synthesis operation first goes through
//! [`AudioEngine::ensure_ready`]; failures are logged where they happen and
//! never reach the caller.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::Instrument;
use uuid::Uuid;

use super::lifecycle::{EngineState, InitSubscription, Lifecycle, Readiness};
use super::registry::{EntityAudioResource, EntityRegistry};
use super::transport::LoopScheduler;
use crate::config::EngineConfig;
use crate::dsp::{Fidelity, MasterChain, MasterControl, MasterSettings};
use crate::entity::EntityKind;
use crate::error::{EngineError, Result};
use crate::music::{Interval, Note};
use crate::platform::{AudioGraph, AudioPlatform, CompatProfile, NodeId, Position, VoiceEvent};
use crate::settings::SettingsProvider;
use crate::synth::{create_voice, PoolKey, PooledVoice};

/// Velocity of the sustained cue
const CUE_VELOCITY: f32 = 1.0;

/// The three voices that exist for the whole engine lifetime
#[derive(Debug)]
struct CoreVoices {
    mono: PooledVoice,
    poly: PooledVoice,
    membrane: PooledVoice,
}

impl CoreVoices {
    fn nodes(&self) -> [NodeId; 3] {
        [self.mono.node(), self.poly.node(), self.membrane.node()]
    }
}

/// Entity audio engine over a host platform
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use orbitone::{AudioEngine, EngineConfig, MemoryPlatform, Readiness, SharedSettings};
///
/// let runtime = tokio::runtime::Runtime::new().unwrap();
/// runtime.block_on(async {
///     let engine = AudioEngine::new(
///         Arc::new(MemoryPlatform::new()),
///         Arc::new(SharedSettings::new()),
///         EngineConfig::default(),
///     );
///     assert_eq!(engine.ensure_ready().await, Readiness::NotReady);
///     engine.allow_activation();
///     assert_eq!(engine.ensure_ready().await, Readiness::Ready);
///     engine.play_note("o1", None).await;
/// });
/// ```
pub struct AudioEngine<P: AudioPlatform> {
    id: Uuid,
    platform: Arc<P>,
    settings: Arc<dyn SettingsProvider>,
    config: EngineConfig,
    profile: CompatProfile,
    lifecycle: Lifecycle,
    master: Mutex<Option<MasterChain>>,
    master_settings: Mutex<MasterSettings>,
    voices: Mutex<Option<CoreVoices>>,
    registry: EntityRegistry,
    loops: LoopScheduler,
    shut_down: AtomicBool,
}

impl<P: AudioPlatform> fmt::Debug for AudioEngine<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioEngine")
            .field("id", &self.id)
            .field("lifecycle", &self.lifecycle)
            .field("profile", &self.profile)
            .field("entities", &self.registry.len())
            .field("loops", &self.loops.len())
            .finish()
    }
}

impl<P: AudioPlatform> AudioEngine<P> {
    /// Create an engine; nothing is built until the first allowed `ensure_ready`
    ///
    /// Platform compatibility is decided here, once.
    pub fn new(platform: Arc<P>, settings: Arc<dyn SettingsProvider>, config: EngineConfig) -> Self {
        let profile = CompatProfile::detect(&platform.info(), &config.incompatible_agents);
        let id = Uuid::new_v4();
        tracing::debug!(engine_id = %id, capability = ?profile.capability(), "engine created");
        Self {
            id,
            platform,
            settings,
            master_settings: Mutex::new(config.master),
            registry: EntityRegistry::new(config.panner, config.meter_smoothing),
            config,
            profile,
            lifecycle: Lifecycle::new(),
            master: Mutex::new(None),
            voices: Mutex::new(None),
            loops: LoopScheduler::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    fn graph(&self) -> &dyn AudioGraph {
        &*self.platform
    }

    /// Instance id recorded on startup spans
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Host platform the engine drives
    pub fn platform(&self) -> &Arc<P> {
        &self.platform
    }

    /// Effective configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Compatibility verdict decided at construction
    pub fn profile(&self) -> &CompatProfile {
        &self.profile
    }

    /// Per-entity resources and the voice pool
    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Active loop registrations
    pub fn loops(&self) -> &LoopScheduler {
        &self.loops
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Record that a qualifying user interaction happened
    pub fn allow_activation(&self) {
        if !self.lifecycle.activation_allowed() {
            tracing::debug!(engine_id = %self.id, "activation allowed");
        }
        self.lifecycle.allow_activation();
    }

    pub fn state(&self) -> EngineState {
        self.lifecycle.state()
    }

    /// True once the engine reached Ready or Degraded
    pub fn is_audio_initialized(&self) -> bool {
        self.lifecycle.state().is_terminal()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Run `callback` once the engine first initializes
    ///
    /// Runs immediately when the engine already has.
    pub fn on_audio_init<F>(&self, callback: F) -> InitSubscription
    where
        F: FnOnce() + Send + 'static,
    {
        self.lifecycle.subscribe(callback)
    }

    /// Make sure the audio graph exists
    ///
    /// Returns `NotReady` without building anything until
    /// [`allow_activation`](Self::allow_activation) was called. Concurrent
    /// callers share one startup attempt and observe its outcome.
    pub async fn ensure_ready(&self) -> Readiness {
        if self.is_shut_down() {
            return Readiness::NotReady;
        }
        let state = self.lifecycle.state();
        if state.is_terminal() {
            return state.into();
        }
        if !self.lifecycle.activation_allowed() {
            tracing::debug!(engine_id = %self.id, "activation not allowed yet");
            return Readiness::NotReady;
        }

        let seen = self.lifecycle.attempts();
        let guard = self.lifecycle.gate.lock().await;
        if self.lifecycle.attempts() != seen {
            // Someone else ran an attempt while we waited
            return self.lifecycle.last_outcome();
        }
        let state = self.lifecycle.state();
        if state.is_terminal() {
            return state.into();
        }

        self.lifecycle.set_state(EngineState::Initializing);
        let span = tracing::info_span!("startup", engine_id = %self.id, attempt = seen + 1);
        let next = self.startup().instrument(span).await;
        let outcome = self.lifecycle.finish_attempt(next);
        drop(guard);

        self.lifecycle.notify_initialized();
        outcome
    }

    async fn startup(&self) -> EngineState {
        if !self.profile.is_usable() {
            tracing::warn!(capability = ?self.profile.capability(), "platform unsupported; running silent");
            return EngineState::Degraded;
        }

        if let Err(err) = self.platform.resume().await {
            tracing::warn!(error = %err, error_code = err.error_code(), "audio context resume failed");
            return EngineState::FailedRetryable;
        }

        let input = self.ensure_master_chain();
        if let Err(err) = self.ensure_core_voices(input) {
            let err = err.during("core voices");
            tracing::warn!(error = %err, error_code = err.error_code(), "voice construction failed");
            return EngineState::FailedRetryable;
        }

        tracing::info!(fidelity = ?self.fidelity(), "audio engine ready");
        EngineState::Ready
    }

    /// Build the master chain if it does not exist; returns its input node
    fn ensure_master_chain(&self) -> Option<NodeId> {
        let mut master = self.master.lock();
        if master.is_none() {
            let settings = *self.master_settings.lock();
            let chain = MasterChain::build(self.graph(), &settings);
            tracing::info!(fidelity = ?chain.fidelity(), "master chain built");
            *master = Some(chain);
        }
        master.as_ref().and_then(MasterChain::input)
    }

    fn ensure_core_voices(&self, input: Option<NodeId>) -> Result<()> {
        let mut voices = self.voices.lock();
        if voices.is_some() {
            return Ok(());
        }

        let graph = self.graph();
        let preset = self.settings.preset();
        let mut built: Vec<PooledVoice> = Vec::with_capacity(3);
        for kind in [EntityKind::Note, EntityKind::Chord, EntityKind::Beat] {
            let made = create_voice(graph, PoolKey::new(kind, preset)).and_then(|voice| {
                if let Some(input) = input {
                    if let Err(err) = graph.connect(voice.node(), input) {
                        if let Err(dispose_err) = graph.dispose_node(voice.node()) {
                            tracing::debug!(node = %voice.node(), error = %dispose_err, "unwinding core voice");
                        }
                        return Err(err);
                    }
                }
                Ok(voice)
            });
            match made {
                Ok(voice) => built.push(voice),
                Err(err) => {
                    for voice in &built {
                        if let Err(err) = graph.dispose_node(voice.node()) {
                            tracing::debug!(node = %voice.node(), error = %err, "unwinding core voice");
                        }
                    }
                    return Err(err);
                }
            }
        }

        let mut built = built.into_iter();
        match (built.next(), built.next(), built.next()) {
            (Some(mono), Some(poly), Some(membrane)) => {
                *voices = Some(CoreVoices { mono, poly, membrane });
                Ok(())
            }
            _ => Err(EngineError::TransientInit {
                stage: "core voices".to_string(),
                reason: "voice set incomplete".to_string(),
            }),
        }
    }

    fn master_input(&self) -> Option<NodeId> {
        self.master.lock().as_ref().and_then(MasterChain::input)
    }

    /// How much of the master chain exists, `None` before it is built
    pub fn fidelity(&self) -> Option<Fidelity> {
        self.master.lock().as_ref().map(MasterChain::fidelity)
    }

    /// Stop every loop and free every node the engine owns
    ///
    /// The engine is inert afterwards.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let graph = self.graph();
        self.loops.clear();
        self.registry.dispose_all(graph);
        if let Some(voices) = self.voices.lock().take() {
            for node in voices.nodes() {
                if let Err(err) = graph.dispose_node(node) {
                    tracing::debug!(node = %node, error = %err, "dispose failed");
                }
            }
        }
        if let Some(chain) = self.master.lock().take() {
            chain.dispose(graph);
        }
        tracing::info!(engine_id = %self.id, "audio engine shut down");
    }

    // ========================================================================
    // Entity Triggers
    // ========================================================================

    fn key_offset(&self) -> i32 {
        self.settings.key().offset()
    }

    fn hit_duration(&self) -> f64 {
        self.config.note_duration.to_seconds(self.settings.tempo())
    }

    /// Resource of `entity_id` with current effect params applied
    fn prepared_resource(&self, entity_id: &str, kind: EntityKind) -> Option<Arc<EntityAudioResource>> {
        let graph = self.graph();
        let resource = match self.registry.get_or_create(
            graph,
            self.master_input(),
            entity_id,
            kind,
            self.settings.preset(),
        ) {
            Ok(resource) => resource,
            Err(err) => {
                tracing::warn!(
                    entity_id,
                    error = %err,
                    error_code = err.error_code(),
                    "could not build entity audio"
                );
                return None;
            }
        };
        resource.apply_params(graph, &self.profile, &self.settings.effect_params(entity_id));
        Some(resource)
    }

    fn trigger_entity(&self, entity_id: &str, kind: EntityKind, notes: Vec<Note>, earliest: f64) {
        let Some(resource) = self.prepared_resource(entity_id, kind) else {
            return;
        };
        self.trigger_resource(&resource, notes, earliest);
    }

    fn trigger_resource(&self, resource: &EntityAudioResource, notes: Vec<Note>, earliest: f64) {
        let entity_id = resource.entity_id();
        let kind = resource.kind();
        match resource.trigger(self.graph(), notes, self.hit_duration(), earliest) {
            Ok(Some(at)) => tracing::debug!(entity_id, kind = %kind, at, "triggered"),
            Ok(None) => {}
            Err(err) => tracing::warn!(
                entity_id,
                error = %err,
                error_code = err.error_code(),
                "trigger failed"
            ),
        }
    }

    fn earliest_start(&self) -> f64 {
        self.graph().now() + self.config.schedule_epsilon
    }

    /// Play one note on `entity_id`, transposed into the current key
    pub async fn play_note(&self, entity_id: &str, note: Option<Note>) {
        if !self.ensure_ready().await.can_play() {
            return;
        }
        let note = note
            .unwrap_or(self.config.default_note)
            .transpose(self.key_offset());
        self.trigger_entity(entity_id, EntityKind::Note, vec![note], self.earliest_start());
    }

    /// Play a chord on `entity_id`, transposed into the current key
    pub async fn play_chord(&self, entity_id: &str, notes: Option<Vec<Note>>) {
        if !self.ensure_ready().await.can_play() {
            return;
        }
        let offset = self.key_offset();
        let notes: Vec<Note> = notes
            .filter(|notes| !notes.is_empty())
            .unwrap_or_else(|| self.config.default_chord.clone())
            .into_iter()
            .map(|note| note.transpose(offset))
            .collect();
        self.trigger_entity(entity_id, EntityKind::Chord, notes, self.earliest_start());
    }

    /// Play a percussive hit on `entity_id`
    pub async fn play_beat(&self, entity_id: &str) {
        if !self.ensure_ready().await.can_play() {
            return;
        }
        let notes = vec![self.config.default_beat_note];
        self.trigger_entity(entity_id, EntityKind::Beat, notes, self.earliest_start());
    }

    // ========================================================================
    // Loops
    // ========================================================================

    /// Start repeating `entity_id` every `interval` at the current tempo
    ///
    /// Idempotent per entity.
    pub async fn start_loop(&self, entity_id: &str, interval: Option<Interval>) {
        if !self.ensure_ready().await.can_play() {
            return;
        }
        if self.prepared_resource(entity_id, EntityKind::Loop).is_none() {
            return;
        }
        let interval = interval.unwrap_or(self.config.default_loop_interval);
        let (_, created) = self.loops.start(
            entity_id,
            interval,
            self.earliest_start(),
            self.settings.tempo(),
        );
        if created {
            self.tick();
        }
    }

    /// Cancel the loop of `entity_id`; safe when it does not loop
    pub fn stop_loop(&self, entity_id: &str) {
        self.loops.stop(entity_id);
    }

    /// Position within the current repetition, in `[0, 1)`
    pub fn loop_progress(&self, entity_id: &str) -> f64 {
        self.loops.progress(entity_id, self.graph().now())
    }

    /// Schedule every loop repetition inside the lookahead window
    pub fn tick(&self) {
        if self.state() != EngineState::Ready || self.is_shut_down() {
            return;
        }
        let due = self.loops.due(self.graph().now(), self.config.lookahead);
        if due.is_empty() {
            return;
        }
        let note = self
            .config
            .default_note
            .transpose(self.key_offset());
        for tick in due {
            // Loop repetitions never build resources: a missing one was disposed
            let Some(resource) = self.registry.get(&tick.entity_id) else {
                tracing::debug!(entity_id = %tick.entity_id, "loop entity is gone; stopping its loop");
                self.loops.stop(&tick.entity_id);
                continue;
            };
            resource.apply_params(
                self.graph(),
                &self.profile,
                &self.settings.effect_params(&tick.entity_id),
            );
            self.trigger_resource(&resource, vec![note], tick.at);
        }
    }

    // ========================================================================
    // Master Controls
    // ========================================================================

    fn set_master_control(&self, control: MasterControl, value: f32) {
        if self.state() == EngineState::Degraded || self.is_shut_down() {
            return;
        }
        let value = self.master_settings.lock().set(control, value);
        if !self.lifecycle.activation_allowed() || !self.profile.is_usable() {
            tracing::debug!(control = ?control, value, "master value stored as pending");
            return;
        }
        self.ensure_master_chain();
        if let Some(chain) = self.master.lock().as_ref() {
            chain.apply(self.graph(), &self.profile, control, value);
        }
    }

    /// Master output level, 0..1
    pub fn set_master_volume(&self, value: f32) {
        self.set_master_control(MasterControl::Volume, value);
    }

    pub fn set_chorus_depth(&self, value: f32) {
        self.set_master_control(MasterControl::ChorusDepth, value);
    }

    pub fn set_reverb_wet(&self, value: f32) {
        self.set_master_control(MasterControl::ReverbWet, value);
    }

    pub fn set_delay_feedback(&self, value: f32) {
        self.set_master_control(MasterControl::DelayFeedback, value);
    }

    pub fn set_bitcrusher_bits(&self, value: f32) {
        self.set_master_control(MasterControl::BitcrusherBits, value);
    }

    pub fn set_filter_frequency(&self, value: f32) {
        self.set_master_control(MasterControl::FilterFrequency, value);
    }

    /// Current master values, including ones not yet applied
    pub fn master_settings(&self) -> MasterSettings {
        *self.master_settings.lock()
    }

    // ========================================================================
    // Sustained Cue
    // ========================================================================

    /// Hold `note` on the monophonic voice until [`stop_note`](Self::stop_note)
    pub async fn start_note(&self, note: Note) {
        if !self.ensure_ready().await.can_play() {
            return;
        }
        let Some(node) = self.voices.lock().as_ref().map(|v| v.mono.node()) else {
            return;
        };
        let event = VoiceEvent::Attack {
            notes: vec![note.transpose(self.key_offset())],
            velocity: CUE_VELOCITY,
        };
        if let Err(err) = self.graph().schedule(node, event, self.earliest_start()) {
            tracing::warn!(error = %err, error_code = err.error_code(), "cue attack failed");
        }
    }

    pub fn stop_note(&self) {
        if self.state() != EngineState::Ready {
            return;
        }
        let Some(node) = self.voices.lock().as_ref().map(|v| v.mono.node()) else {
            return;
        };
        if let Err(err) = self.graph().schedule(node, VoiceEvent::ReleaseAll, self.earliest_start()) {
            tracing::warn!(error = %err, error_code = err.error_code(), "cue release failed");
        }
    }

    /// Node of the always-present voice of `kind`
    pub fn core_voice(&self, kind: EntityKind) -> Option<NodeId> {
        let voices = self.voices.lock();
        let voices = voices.as_ref()?;
        Some(match kind {
            EntityKind::Note => voices.mono.node(),
            EntityKind::Chord | EntityKind::Loop => voices.poly.node(),
            EntityKind::Beat => voices.membrane.node(),
        })
    }

    // ========================================================================
    // Entity Queries
    // ========================================================================

    /// Free the audio resource of `entity_id` and cancel its loop
    ///
    /// Returns whether the entity had a resource.
    pub fn dispose_entity(&self, entity_id: &str) -> bool {
        self.loops.stop(entity_id);
        self.registry.dispose(self.graph(), entity_id)
    }

    pub fn entity_resource(&self, entity_id: &str) -> Option<Arc<EntityAudioResource>> {
        self.registry.get(entity_id)
    }

    /// Smoothed output level of `entity_id`, 0 when it has no resource
    pub fn entity_level(&self, entity_id: &str) -> f32 {
        self.registry
            .get(entity_id)
            .map_or(0.0, |resource| resource.level(self.graph()))
    }

    pub fn entity_panner(&self, entity_id: &str) -> Option<NodeId> {
        self.registry
            .get(entity_id)
            .map(|resource| resource.bundle().panner().node())
    }

    /// Move the panner of `entity_id`; ignored when it has no resource
    pub fn set_entity_position(&self, entity_id: &str, position: Position) {
        let Some(resource) = self.registry.get(entity_id) else {
            tracing::debug!(entity_id, "no resource to position");
            return;
        };
        if let Err(err) = resource.set_position(self.graph(), position) {
            tracing::debug!(entity_id, error = %err, "panner position not applied");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{MemoryPlatform, NodeKind, Param};
    use crate::settings::SharedSettings;

    fn engine() -> AudioEngine<MemoryPlatform> {
        AudioEngine::new(
            Arc::new(MemoryPlatform::new()),
            Arc::new(SharedSettings::new()),
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_not_ready_before_activation() {
        let engine = engine();
        assert_eq!(engine.ensure_ready().await, Readiness::NotReady);
        assert_eq!(engine.state(), EngineState::Uninitialized);
        assert_eq!(engine.platform().resume_calls(), 0);
        assert!(engine.fidelity().is_none());
    }

    #[tokio::test]
    async fn test_startup_builds_core_voices() {
        let engine = engine();
        engine.allow_activation();
        assert_eq!(engine.ensure_ready().await, Readiness::Ready);
        assert_eq!(engine.fidelity(), Some(Fidelity::Full));

        let platform = engine.platform();
        assert!(platform.is_resumed());
        assert_eq!(platform.created_count(NodeKind::Synth), 3);
        let input = engine.master_input().unwrap();
        for kind in [EntityKind::Note, EntityKind::Chord, EntityKind::Beat] {
            let voice = engine.core_voice(kind).unwrap();
            assert!(platform.is_connected(voice, input));
        }
    }

    #[tokio::test]
    async fn test_pending_master_values_applied_on_build() {
        let engine = engine();
        engine.set_master_volume(0.25);
        assert!(engine.fidelity().is_none());

        engine.allow_activation();
        engine.ensure_ready().await;
        let input = engine.master_input().unwrap();
        assert_eq!(engine.platform().param(input, Param::Gain), Some(0.25));
    }

    #[tokio::test]
    async fn test_setter_clamps() {
        let engine = engine();
        engine.allow_activation();
        engine.ensure_ready().await;
        engine.set_delay_feedback(2.0);
        assert_eq!(engine.master_settings().delay_feedback, 0.95);
    }

    #[tokio::test]
    async fn test_shutdown_frees_everything() {
        let engine = engine();
        engine.allow_activation();
        engine.play_note("o1", None).await;
        engine.shutdown();

        let snapshot = engine.platform().snapshot();
        assert!(snapshot.nodes.is_empty());
        assert!(engine.is_shut_down());
        assert_eq!(engine.ensure_ready().await, Readiness::NotReady);
    }
}
