//! Synth voice pool
//!
//! Voices are expensive to build on most hosts, so they are recycled across
//! entity lifetimes. Free lists are keyed by entity kind and, for melodic
//! kinds, the preset the voice was built with.
//!
//! A voice is either attached to exactly one entity or sitting silent in a
//! free list. `release` cancels queued hits, silences and disconnects before
//! the voice becomes reusable.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use serde::Serialize;

use super::preset::{membrane_config, Preset};
use crate::entity::EntityKind;
use crate::error::Result;
use crate::platform::{AudioGraph, NodeId, NodeSpec, VoiceEvent, VoiceFamily};

/// Free-list key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PoolKey {
    pub kind: EntityKind,
    /// `None` for kinds that do not follow the global preset
    pub preset: Option<Preset>,
}

impl PoolKey {
    pub fn new(kind: EntityKind, preset: Preset) -> Self {
        Self {
            kind,
            preset: kind.is_melodic().then_some(preset),
        }
    }
}

/// A synth node handed out by the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PooledVoice {
    node: NodeId,
    key: PoolKey,
    family: VoiceFamily,
}

impl PooledVoice {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn key(&self) -> PoolKey {
        self.key
    }

    pub fn family(&self) -> VoiceFamily {
        self.family
    }

    /// Cancel every queued hit and release every sounding note right now
    pub fn silence(&self, graph: &dyn AudioGraph) -> Result<()> {
        let now = graph.now();
        graph.cancel_scheduled(self.node, now)?;
        graph.schedule(self.node, VoiceEvent::ReleaseAll, now)
    }
}

/// Build a fresh voice for `key`
pub fn create_voice(graph: &dyn AudioGraph, key: PoolKey) -> Result<PooledVoice> {
    let family = key.kind.voice_family();
    let config = match key.preset {
        Some(preset) => preset.voice_config(family),
        None if family == VoiceFamily::Membrane => membrane_config(),
        None => Preset::default().voice_config(family),
    };
    let node = graph.create_node(&NodeSpec::Synth(config))?;
    Ok(PooledVoice { node, key, family })
}

#[derive(Debug, Default)]
struct PoolInner {
    free: HashMap<PoolKey, Vec<PooledVoice>>,
    attached: HashSet<NodeId>,
    allocated: usize,
}

/// Reuse cache of synth voices
#[derive(Debug, Default)]
pub struct VoicePool {
    inner: Mutex<PoolInner>,
}

impl VoicePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a free voice for `key`, or build one with `factory`
    ///
    /// An empty free list is not an error: the pool grows on demand.
    pub fn acquire<F>(&self, key: PoolKey, factory: F) -> Result<PooledVoice>
    where
        F: FnOnce(PoolKey) -> Result<PooledVoice>,
    {
        let mut inner = self.inner.lock();
        let reused = inner.free.get_mut(&key).and_then(|list| list.pop());
        let voice = match reused {
            Some(voice) => {
                tracing::debug!(node = %voice.node, kind = %key.kind, "reusing pooled voice");
                voice
            }
            None => {
                let voice = factory(key)?;
                inner.allocated += 1;
                tracing::debug!(node = %voice.node, kind = %key.kind, "allocated voice");
                voice
            }
        };
        inner.attached.insert(voice.node);
        Ok(voice)
    }

    /// Return a voice to its free list
    ///
    /// The voice is silenced and disconnected first. A voice that cannot be
    /// silenced is disposed instead of pooled, and releasing a voice the pool
    /// does not consider attached is ignored.
    pub fn release(&self, graph: &dyn AudioGraph, voice: PooledVoice) {
        let mut inner = self.inner.lock();
        if !inner.attached.remove(&voice.node) {
            tracing::warn!(node = %voice.node, "ignoring release of a voice that is not attached");
            return;
        }

        if let Err(err) = voice.silence(graph) {
            tracing::warn!(node = %voice.node, error = %err, "could not silence voice; disposing it");
            inner.allocated = inner.allocated.saturating_sub(1);
            if let Err(err) = graph.dispose_node(voice.node) {
                tracing::debug!(node = %voice.node, error = %err, "dispose after failed silence");
            }
            return;
        }
        if let Err(err) = graph.disconnect(voice.node) {
            tracing::debug!(node = %voice.node, error = %err, "disconnect on release failed");
        }

        inner.free.entry(voice.key).or_default().push(voice);
    }

    /// Dispose every free voice
    pub fn drain(&self, graph: &dyn AudioGraph) {
        let mut inner = self.inner.lock();
        let free: Vec<PooledVoice> = inner.free.drain().flat_map(|(_, list)| list).collect();
        for voice in free {
            inner.allocated = inner.allocated.saturating_sub(1);
            if let Err(err) = graph.dispose_node(voice.node) {
                tracing::debug!(node = %voice.node, error = %err, "dispose on drain failed");
            }
        }
    }

    /// Voices built and not yet disposed
    pub fn allocated(&self) -> usize {
        self.inner.lock().allocated
    }

    pub fn free_count(&self, key: PoolKey) -> usize {
        self.inner.lock().free.get(&key).map_or(0, Vec::len)
    }

    pub fn attached_count(&self) -> usize {
        self.inner.lock().attached.len()
    }

    pub fn is_attached(&self, node: NodeId) -> bool {
        self.inner.lock().attached.contains(&node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::music::Note;
    use crate::platform::MemoryPlatform;

    fn lead_note_key() -> PoolKey {
        PoolKey::new(EntityKind::Note, Preset::Lead)
    }

    #[test]
    fn test_beat_key_ignores_preset() {
        assert_eq!(PoolKey::new(EntityKind::Beat, Preset::Pad).preset, None);
        assert_eq!(
            PoolKey::new(EntityKind::Chord, Preset::Pad).preset,
            Some(Preset::Pad)
        );
    }

    #[test]
    fn test_release_then_acquire_reuses_silent_voice() {
        let platform = MemoryPlatform::new();
        let pool = VoicePool::new();
        let key = lead_note_key();

        let voice = pool.acquire(key, |k| create_voice(&platform, k)).unwrap();
        platform
            .schedule(
                voice.node(),
                VoiceEvent::Attack {
                    notes: vec![Note::MIDDLE_C],
                    velocity: 1.0,
                },
                0.0,
            )
            .unwrap();
        assert!(platform.is_sounding(voice.node(), 0.0));

        let node = voice.node();
        pool.release(&platform, voice);
        assert_eq!(pool.free_count(key), 1);
        assert!(!pool.is_attached(node));

        let again = pool
            .acquire(key, |_| panic!("factory must not run while a free voice exists"))
            .unwrap();
        assert_eq!(again.node(), node);
        assert!(!platform.is_sounding(node, platform.now()));
        assert_eq!(pool.allocated(), 1);
        assert!(pool.is_attached(node));
    }

    #[test]
    fn test_release_cancels_queued_hits() {
        let platform = MemoryPlatform::new();
        let pool = VoicePool::new();
        let key = lead_note_key();
        let voice = pool.acquire(key, |k| create_voice(&platform, k)).unwrap();
        for at in [0.1, 0.4, 0.7] {
            platform
                .schedule(
                    voice.node(),
                    VoiceEvent::AttackRelease {
                        notes: vec![Note::MIDDLE_C],
                        duration: 0.25,
                        velocity: 1.0,
                    },
                    at,
                )
                .unwrap();
        }

        let node = voice.node();
        pool.release(&platform, voice);
        assert_eq!(pool.free_count(key), 1);
        for step in 0..20 {
            let at = step as f64 * 0.05;
            assert!(!platform.is_sounding(node, at), "free voice sounds at {at}");
        }
    }

    #[test]
    fn test_keys_do_not_share_voices() {
        let platform = MemoryPlatform::new();
        let pool = VoicePool::new();
        let lead = pool
            .acquire(lead_note_key(), |k| create_voice(&platform, k))
            .unwrap();
        pool.release(&platform, lead);

        let pad_key = PoolKey::new(EntityKind::Note, Preset::Pad);
        let pad = pool.acquire(pad_key, |k| create_voice(&platform, k)).unwrap();
        assert_eq!(pool.allocated(), 2);
        assert_eq!(pad.key(), pad_key);
        assert_eq!(pool.free_count(lead_note_key()), 1);
    }

    #[test]
    fn test_double_release_is_ignored() {
        let platform = MemoryPlatform::new();
        let pool = VoicePool::new();
        let key = lead_note_key();
        let voice = pool.acquire(key, |k| create_voice(&platform, k)).unwrap();
        pool.release(&platform, voice.clone());
        pool.release(&platform, voice);
        assert_eq!(pool.free_count(key), 1);
    }

    #[test]
    fn test_factory_error_propagates() {
        let platform = MemoryPlatform::new();
        platform.fail_node_kind(crate::platform::NodeKind::Synth);
        let pool = VoicePool::new();
        assert!(pool
            .acquire(lead_note_key(), |k| create_voice(&platform, k))
            .is_err());
        assert_eq!(pool.attached_count(), 0);
        assert_eq!(pool.allocated(), 0);
    }

    #[test]
    fn test_drain_disposes_free_voices() {
        let platform = MemoryPlatform::new();
        let pool = VoicePool::new();
        let key = lead_note_key();
        let voice = pool.acquire(key, |k| create_voice(&platform, k)).unwrap();
        let node = voice.node();
        pool.release(&platform, voice);
        pool.drain(&platform);
        assert_eq!(pool.allocated(), 0);
        assert!(!platform.contains_node(node));
    }
}
