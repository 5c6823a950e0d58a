//! Per-entity audio resources
//!
//! Each live entity owns one resource: a pooled voice feeding its own
//! sub-chain, panner and meter, joined to the master chain input. Resources
//! are built on the first trigger and kept until the entity is disposed.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::dsp::{EffectParams, LevelMeter, SpatialPanner, SubChain};
use crate::entity::EntityKind;
use crate::error::Result;
use crate::music::Note;
use crate::platform::{AudioGraph, CompatProfile, NodeId, PannerConfig, Position, VoiceEvent};
use crate::synth::{create_voice, PoolKey, PooledVoice, Preset, VoicePool};

/// Velocity of every entity hit
const HIT_VELOCITY: f32 = 0.8;

/// How far ahead single-voice hits may queue before new hits are dropped,
/// in seconds
const MAX_QUEUED_SECONDS: f64 = 1.0;

#[derive(Debug, Default, Clone, Copy)]
struct Cursor {
    last_start: f64,
    last_end: f64,
    /// Set once the voice went back to the pool; no hit may follow
    disposed: bool,
}

impl Cursor {
    /// Pick the start time of the next hit
    ///
    /// Start times never decrease. Voices that hold one note at a time also
    /// never overlap: a hit waits for the previous one to finish, and is
    /// dropped (returns `None`) when that would queue too far ahead.
    fn next_start(&self, earliest: f64, single_voice: bool) -> Option<f64> {
        let start = if single_voice {
            earliest.max(self.last_end)
        } else {
            earliest.max(self.last_start)
        };
        (start - earliest <= MAX_QUEUED_SECONDS).then_some(start)
    }

    fn commit(&mut self, start: f64, duration: f64) {
        self.last_start = start;
        self.last_end = self.last_end.max(start + duration);
    }
}

/// Nodes and voice shared by every resource shape
#[derive(Debug)]
pub struct VoiceBundle {
    entity_id: String,
    voice: PooledVoice,
    subchain: SubChain,
    panner: SpatialPanner,
    meter: LevelMeter,
    cursor: Mutex<Cursor>,
}

impl VoiceBundle {
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn voice(&self) -> &PooledVoice {
        &self.voice
    }

    pub fn subchain(&self) -> &SubChain {
        &self.subchain
    }

    pub fn panner(&self) -> &SpatialPanner {
        &self.panner
    }

    pub fn meter(&self) -> &LevelMeter {
        &self.meter
    }

    /// Whether the voice has been handed back to the pool
    pub fn is_disposed(&self) -> bool {
        self.cursor.lock().disposed
    }
}

// ============================================================================
// Resource Shapes
// ============================================================================

/// Audio resource of one entity, tagged by what the entity plays
#[derive(Debug)]
pub enum EntityAudioResource {
    Note(VoiceBundle),
    Chord(VoiceBundle),
    Beat(VoiceBundle),
    Loop(VoiceBundle),
}

impl EntityAudioResource {
    fn wrap(kind: EntityKind, bundle: VoiceBundle) -> Self {
        match kind {
            EntityKind::Note => EntityAudioResource::Note(bundle),
            EntityKind::Chord => EntityAudioResource::Chord(bundle),
            EntityKind::Beat => EntityAudioResource::Beat(bundle),
            EntityKind::Loop => EntityAudioResource::Loop(bundle),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            EntityAudioResource::Note(_) => EntityKind::Note,
            EntityAudioResource::Chord(_) => EntityKind::Chord,
            EntityAudioResource::Beat(_) => EntityKind::Beat,
            EntityAudioResource::Loop(_) => EntityKind::Loop,
        }
    }

    pub fn bundle(&self) -> &VoiceBundle {
        match self {
            EntityAudioResource::Note(b)
            | EntityAudioResource::Chord(b)
            | EntityAudioResource::Beat(b)
            | EntityAudioResource::Loop(b) => b,
        }
    }

    pub fn entity_id(&self) -> &str {
        self.bundle().entity_id()
    }

    pub fn voice_node(&self) -> NodeId {
        self.bundle().voice.node()
    }

    /// Stamp current effect parameters onto the sub-chain
    pub fn apply_params(&self, graph: &dyn AudioGraph, profile: &CompatProfile, params: &EffectParams) {
        self.bundle().subchain.apply(graph, profile, params);
    }

    /// Schedule an attack-release of `notes` no earlier than `earliest`
    ///
    /// Returns the scheduled start, or `None` when the hit was dropped. The
    /// cursor lock is held while scheduling, so a hit never lands on a voice
    /// that [`dispose`](Self::dispose) already returned to the pool.
    pub fn trigger(
        &self,
        graph: &dyn AudioGraph,
        notes: Vec<Note>,
        duration: f64,
        earliest: f64,
    ) -> Result<Option<f64>> {
        let single_voice = matches!(
            self,
            EntityAudioResource::Note(_) | EntityAudioResource::Beat(_)
        );
        let notes = match self {
            // One pitch per hit on single-voice shapes
            EntityAudioResource::Note(_) | EntityAudioResource::Beat(_) => {
                notes.into_iter().take(1).collect()
            }
            EntityAudioResource::Chord(_) | EntityAudioResource::Loop(_) => notes,
        };
        if notes.is_empty() {
            return Ok(None);
        }

        let bundle = self.bundle();
        let mut cursor = bundle.cursor.lock();
        if cursor.disposed {
            tracing::debug!(entity_id = %bundle.entity_id, "dropping hit; resource is disposed");
            return Ok(None);
        }
        let Some(at) = cursor.next_start(earliest, single_voice) else {
            tracing::debug!(entity_id = %bundle.entity_id, "dropping hit; voice queue is full");
            return Ok(None);
        };
        graph.schedule(
            bundle.voice.node(),
            VoiceEvent::AttackRelease {
                notes,
                duration,
                velocity: HIT_VELOCITY,
            },
            at,
        )?;
        cursor.commit(at, duration);
        Ok(Some(at))
    }

    /// Smoothed output level for visual feedback
    pub fn level(&self, graph: &dyn AudioGraph) -> f32 {
        self.bundle().meter.poll(graph)
    }

    pub fn set_position(&self, graph: &dyn AudioGraph, position: Position) -> Result<()> {
        self.bundle().panner.set_position(graph, position)
    }

    /// Return the voice to the pool and free every other node
    ///
    /// Idempotent. Later triggers on this resource are dropped.
    pub fn dispose(&self, graph: &dyn AudioGraph, pool: &VoicePool) {
        let bundle = self.bundle();
        let mut cursor = bundle.cursor.lock();
        if cursor.disposed {
            return;
        }
        cursor.disposed = true;
        pool.release(graph, bundle.voice.clone());
        drop(cursor);
        bundle.subchain.dispose(graph);
        for node in [bundle.panner.node(), bundle.meter.node()] {
            if let Err(err) = graph.dispose_node(node) {
                tracing::debug!(node = %node, error = %err, "dispose failed");
            }
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Entity id to resource map, with the voice pool behind it
#[derive(Debug)]
pub struct EntityRegistry {
    entries: Mutex<HashMap<String, Arc<EntityAudioResource>>>,
    pool: VoicePool,
    panner: PannerConfig,
    meter_smoothing: f32,
}

impl EntityRegistry {
    pub fn new(panner: PannerConfig, meter_smoothing: f32) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            pool: VoicePool::new(),
            panner,
            meter_smoothing,
        }
    }

    pub fn pool(&self) -> &VoicePool {
        &self.pool
    }

    /// Cached resource of `entity_id`, built on first use
    ///
    /// The lookup and the build happen under one lock, so an id never gets two
    /// resources. An existing resource is returned even if `kind` differs.
    pub fn get_or_create(
        &self,
        graph: &dyn AudioGraph,
        master_input: Option<NodeId>,
        entity_id: &str,
        kind: EntityKind,
        preset: Preset,
    ) -> Result<Arc<EntityAudioResource>> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(entity_id) {
            if existing.kind() != kind {
                tracing::debug!(
                    entity_id,
                    cached = %existing.kind(),
                    requested = %kind,
                    "entity kind differs from cached resource"
                );
            }
            return Ok(Arc::clone(existing));
        }

        let bundle = self.build_bundle(graph, master_input, entity_id, PoolKey::new(kind, preset))?;
        let resource = Arc::new(EntityAudioResource::wrap(kind, bundle));
        entries.insert(entity_id.to_string(), Arc::clone(&resource));
        tracing::debug!(entity_id, kind = %kind, "created entity audio resource");
        Ok(resource)
    }

    fn build_bundle(
        &self,
        graph: &dyn AudioGraph,
        master_input: Option<NodeId>,
        entity_id: &str,
        key: PoolKey,
    ) -> Result<VoiceBundle> {
        let subchain = SubChain::build(graph)?;
        let voice = match self.pool.acquire(key, |k| create_voice(graph, k)) {
            Ok(voice) => voice,
            Err(err) => {
                subchain.dispose(graph);
                return Err(err);
            }
        };

        let mut extra: Vec<NodeId> = Vec::new();
        let wired = (|| -> Result<(SpatialPanner, LevelMeter)> {
            let panner = SpatialPanner::build(graph, self.panner)?;
            extra.push(panner.node());
            let meter = LevelMeter::build(graph, self.meter_smoothing)?;
            extra.push(meter.node());

            graph.connect(voice.node(), subchain.entry())?;
            graph.connect(subchain.exit(), panner.node())?;
            graph.connect(panner.node(), meter.node())?;
            if let Some(input) = master_input {
                graph.connect(meter.node(), input)?;
            }
            Ok((panner, meter))
        })();

        match wired {
            Ok((panner, meter)) => Ok(VoiceBundle {
                entity_id: entity_id.to_string(),
                voice,
                subchain,
                panner,
                meter,
                cursor: Mutex::new(Cursor::default()),
            }),
            Err(err) => {
                self.pool.release(graph, voice);
                subchain.dispose(graph);
                crate::dsp::unwind_nodes(graph, &extra);
                Err(err)
            }
        }
    }

    pub fn get(&self, entity_id: &str) -> Option<Arc<EntityAudioResource>> {
        self.entries.lock().get(entity_id).cloned()
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.entries.lock().contains_key(entity_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Tear down the resource of `entity_id`
    ///
    /// Returns whether a resource existed.
    pub fn dispose(&self, graph: &dyn AudioGraph, entity_id: &str) -> bool {
        let removed = self.entries.lock().remove(entity_id);
        match removed {
            Some(resource) => {
                resource.dispose(graph, &self.pool);
                tracing::debug!(entity_id, "disposed entity audio resource");
                true
            }
            None => false,
        }
    }

    /// Tear down every resource and free the pooled voices
    pub fn dispose_all(&self, graph: &dyn AudioGraph) {
        let drained: Vec<Arc<EntityAudioResource>> =
            self.entries.lock().drain().map(|(_, r)| r).collect();
        for resource in drained {
            resource.dispose(graph, &self.pool);
        }
        self.pool.drain(graph);
    }
}
