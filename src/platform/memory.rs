//! In-memory audio platform
//!
//! Keeps the node graph, parameter values and scheduled voice events in a
//! single locked table. The clock only moves when told to, which makes
//! scheduling fully deterministic. Faults can be injected per node kind,
//! per parameter and for context resume.
//!
//! Events that can no longer affect anything later than
//! [`EVENT_HISTORY_SECONDS`] before the clock are pruned whenever the clock
//! moves, so long-running transports keep a bounded timeline.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;

use parking_lot::Mutex;
use serde::Serialize;

use super::{
    AudioGraph, AudioPlatform, NodeId, NodeKind, NodeSpec, Param, PlatformInfo, Position,
    ScheduledEvent, VoiceEvent,
};
use crate::error::{EngineError, Result};

/// Default identification reported by [`MemoryPlatform::new`]
const DEFAULT_USER_AGENT: &str = "orbitone-memory/1.0";

/// How far behind the clock scheduled events stay queryable, in seconds
pub const EVENT_HISTORY_SECONDS: f64 = 30.0;

#[derive(Debug, Clone)]
struct MemoryNode {
    spec: NodeSpec,
    params: HashMap<Param, f32>,
    position: Option<Position>,
}

#[derive(Debug, Default)]
struct Faults {
    /// Node kinds whose creation fails, with the number of remaining
    /// failures (`None` fails forever)
    node_kinds: HashMap<NodeKind, Option<usize>>,
    missing_params: HashSet<(NodeKind, Param)>,
    resume_failures: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: u64,
    clock: f64,
    resumed: bool,
    resume_calls: usize,
    nodes: HashMap<NodeId, MemoryNode>,
    edges: Vec<(NodeId, NodeId)>,
    events: Vec<ScheduledEvent>,
    created: HashMap<NodeKind, usize>,
    faults: Faults,
}

impl MemoryState {
    fn node(&self, id: NodeId) -> Result<&MemoryNode> {
        self.nodes
            .get(&id)
            .ok_or(EngineError::UnknownNode { node: id.0 })
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut MemoryNode> {
        self.nodes
            .get_mut(&id)
            .ok_or(EngineError::UnknownNode { node: id.0 })
    }

    fn take_fault(&mut self, kind: NodeKind) -> bool {
        match self.faults.node_kinds.get_mut(&kind) {
            Some(None) => true,
            Some(Some(remaining)) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    /// Drop events that no query at or after `clock - EVENT_HISTORY_SECONDS`
    /// can observe
    ///
    /// A finished attack-release is dead once it ended, and everything on a
    /// node before one of its `ReleaseAll` events is masked by that release.
    fn prune(&mut self) {
        let horizon = self.clock - EVENT_HISTORY_SECONDS;
        let mut cleared: HashMap<NodeId, f64> = HashMap::new();
        for scheduled in &self.events {
            if matches!(scheduled.event, VoiceEvent::ReleaseAll) && scheduled.at <= horizon {
                let cut = cleared.entry(scheduled.node).or_insert(scheduled.at);
                *cut = cut.max(scheduled.at);
            }
        }
        self.events.retain(|scheduled| {
            if let Some(cut) = cleared.get(&scheduled.node) {
                if scheduled.at < *cut {
                    return false;
                }
            }
            match &scheduled.event {
                VoiceEvent::AttackRelease { duration, .. } => scheduled.at + duration > horizon,
                _ => true,
            }
        });
    }

    fn sounding(&self, node: NodeId, at: f64) -> bool {
        let mut events: Vec<&ScheduledEvent> = self
            .events
            .iter()
            .filter(|e| e.node == node && e.at <= at)
            .collect();
        events.sort_by(|a, b| a.at.total_cmp(&b.at));

        let mut held: HashSet<u8> = HashSet::new();
        let mut released_at = f64::NEG_INFINITY;
        let mut ringing = false;
        for scheduled in events {
            match &scheduled.event {
                VoiceEvent::Attack { notes, .. } => {
                    held.extend(notes.iter().map(|n| n.midi()));
                }
                VoiceEvent::Release { notes } => {
                    for note in notes {
                        held.remove(&note.midi());
                    }
                }
                VoiceEvent::ReleaseAll => {
                    held.clear();
                    released_at = scheduled.at;
                    ringing = false;
                }
                VoiceEvent::AttackRelease { duration, .. } => {
                    if scheduled.at >= released_at && at < scheduled.at + duration {
                        ringing = true;
                    }
                }
            }
        }
        ringing || !held.is_empty()
    }

    /// Synth nodes feeding `node`, directly or through other nodes
    fn upstream_synths(&self, node: NodeId) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([node]);
        let mut synths = Vec::new();
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(n) = self.nodes.get(&current) {
                if n.spec.kind() == NodeKind::Synth {
                    synths.push(current);
                }
            }
            for (from, to) in &self.edges {
                if *to == current {
                    queue.push_back(*from);
                }
            }
        }
        synths
    }
}

/// Serializable view of a node
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub kind: NodeKind,
    pub params: HashMap<Param, f32>,
    pub position: Option<Position>,
}

/// Serializable view of the whole graph
#[derive(Debug, Clone, Serialize)]
pub struct GraphSnapshot {
    pub clock: f64,
    pub resumed: bool,
    pub nodes: Vec<NodeSnapshot>,
    pub edges: Vec<(NodeId, NodeId)>,
    pub events: Vec<ScheduledEvent>,
}

/// Audio platform backed by an in-memory graph
#[derive(Debug)]
pub struct MemoryPlatform {
    info: PlatformInfo,
    state: Mutex<MemoryState>,
}

impl Default for MemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPlatform {
    /// Create a platform with an audio API and no quirks
    pub fn new() -> Self {
        Self::with_info(PlatformInfo {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            has_audio_api: true,
            missing_params: Vec::new(),
        })
    }

    pub fn with_info(info: PlatformInfo) -> Self {
        let mut state = MemoryState::default();
        state.faults.missing_params = info.missing_params.iter().copied().collect();
        Self {
            info,
            state: Mutex::new(state),
        }
    }

    /// Create a platform that identifies as `user_agent`
    pub fn with_user_agent(user_agent: impl Into<String>) -> Self {
        Self::with_info(PlatformInfo {
            user_agent: user_agent.into(),
            has_audio_api: true,
            missing_params: Vec::new(),
        })
    }

    // ========================================================================
    // Fault Injection
    // ========================================================================

    /// Make every creation of `kind` fail
    pub fn fail_node_kind(&self, kind: NodeKind) {
        self.state.lock().faults.node_kinds.insert(kind, None);
    }

    /// Make the next `times` creations of `kind` fail
    pub fn fail_node_kind_times(&self, kind: NodeKind, times: usize) {
        self.state.lock().faults.node_kinds.insert(kind, Some(times));
    }

    /// Make writes of `param` on `kind` fail without announcing it in `info()`
    pub fn break_param(&self, kind: NodeKind, param: Param) {
        self.state.lock().faults.missing_params.insert((kind, param));
    }

    /// Make the next `times` context resumes fail
    pub fn fail_resume_times(&self, times: usize) {
        self.state.lock().faults.resume_failures = times;
    }

    pub fn clear_faults(&self) {
        let mut state = self.state.lock();
        state.faults.node_kinds.clear();
        state.faults.resume_failures = 0;
        state.faults.missing_params = self.info.missing_params.iter().copied().collect();
    }

    // ========================================================================
    // Clock
    // ========================================================================

    pub fn advance(&self, seconds: f64) {
        let mut state = self.state.lock();
        state.clock += seconds.max(0.0);
        state.prune();
    }

    pub fn set_time(&self, seconds: f64) {
        let mut state = self.state.lock();
        state.clock = seconds;
        state.prune();
    }

    /// Number of events still held on the timeline
    pub fn event_count(&self) -> usize {
        self.state.lock().events.len()
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn is_resumed(&self) -> bool {
        self.state.lock().resumed
    }

    pub fn resume_calls(&self) -> usize {
        self.state.lock().resume_calls
    }

    /// Number of nodes of `kind` ever created
    pub fn created_count(&self, kind: NodeKind) -> usize {
        self.state.lock().created.get(&kind).copied().unwrap_or(0)
    }

    /// Live nodes of `kind`
    pub fn nodes_of_kind(&self, kind: NodeKind) -> Vec<NodeId> {
        let state = self.state.lock();
        let mut ids: Vec<NodeId> = state
            .nodes
            .iter()
            .filter(|(_, n)| n.spec.kind() == kind)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub fn contains_node(&self, node: NodeId) -> bool {
        self.state.lock().nodes.contains_key(&node)
    }

    pub fn node_spec(&self, node: NodeId) -> Option<NodeSpec> {
        self.state.lock().nodes.get(&node).map(|n| n.spec.clone())
    }

    pub fn param(&self, node: NodeId, param: Param) -> Option<f32> {
        self.state
            .lock()
            .nodes
            .get(&node)
            .and_then(|n| n.params.get(&param).copied())
    }

    pub fn position(&self, node: NodeId) -> Option<Position> {
        self.state.lock().nodes.get(&node).and_then(|n| n.position)
    }

    pub fn is_connected(&self, from: NodeId, to: NodeId) -> bool {
        self.state.lock().edges.contains(&(from, to))
    }

    pub fn outputs_of(&self, node: NodeId) -> Vec<NodeId> {
        self.state
            .lock()
            .edges
            .iter()
            .filter(|(from, _)| *from == node)
            .map(|(_, to)| *to)
            .collect()
    }

    /// Events scheduled on `node`, in time order
    ///
    /// Events pruned from history are not included.
    pub fn events_for(&self, node: NodeId) -> Vec<ScheduledEvent> {
        let mut events: Vec<ScheduledEvent> = self
            .state
            .lock()
            .events
            .iter()
            .filter(|e| e.node == node)
            .cloned()
            .collect();
        events.sort_by(|a, b| a.at.total_cmp(&b.at));
        events
    }

    /// Whether `node` has any note sounding at time `at`
    pub fn is_sounding(&self, node: NodeId, at: f64) -> bool {
        self.state.lock().sounding(node, at)
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        let state = self.state.lock();
        let mut nodes: Vec<NodeSnapshot> = state
            .nodes
            .iter()
            .map(|(id, n)| NodeSnapshot {
                id: *id,
                kind: n.spec.kind(),
                params: n.params.clone(),
                position: n.position,
            })
            .collect();
        nodes.sort_by_key(|n| n.id);
        let mut events = state.events.clone();
        events.sort_by(|a, b| a.at.total_cmp(&b.at));
        GraphSnapshot {
            clock: state.clock,
            resumed: state.resumed,
            nodes,
            edges: state.edges.clone(),
            events,
        }
    }
}

impl AudioGraph for MemoryPlatform {
    fn now(&self) -> f64 {
        self.state.lock().clock
    }

    fn create_node(&self, spec: &NodeSpec) -> Result<NodeId> {
        let mut state = self.state.lock();
        let kind = spec.kind();
        if state.take_fault(kind) {
            return Err(EngineError::NodeCreation {
                node: kind.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        state.next_id += 1;
        let id = NodeId(state.next_id);
        let params = spec
            .initial_params()
            .into_iter()
            .filter(|(param, _)| !state.faults.missing_params.contains(&(kind, *param)))
            .collect();
        state.nodes.insert(
            id,
            MemoryNode {
                spec: spec.clone(),
                params,
                position: None,
            },
        );
        *state.created.entry(kind).or_insert(0) += 1;
        Ok(id)
    }

    fn connect(&self, from: NodeId, to: NodeId) -> Result<()> {
        let mut state = self.state.lock();
        for node in [from, to] {
            if !state.nodes.contains_key(&node) {
                return Err(EngineError::Connection {
                    from: from.0,
                    to: to.0,
                    reason: format!("node {} does not exist", node),
                });
            }
        }
        if !state.edges.contains(&(from, to)) {
            state.edges.push((from, to));
        }
        Ok(())
    }

    fn disconnect(&self, node: NodeId) -> Result<()> {
        let mut state = self.state.lock();
        state.node(node)?;
        state.edges.retain(|(from, _)| *from != node);
        Ok(())
    }

    fn dispose_node(&self, node: NodeId) -> Result<()> {
        let mut state = self.state.lock();
        state
            .nodes
            .remove(&node)
            .ok_or(EngineError::UnknownNode { node: node.0 })?;
        state.edges.retain(|(from, to)| *from != node && *to != node);
        state.events.retain(|e| e.node != node);
        Ok(())
    }

    fn set_param(&self, node: NodeId, param: Param, value: f32) -> Result<()> {
        let mut state = self.state.lock();
        let kind = state.node(node)?.spec.kind();
        if state.faults.missing_params.contains(&(kind, param)) {
            return Err(EngineError::ParameterQuirk {
                node: kind.to_string(),
                param: param.to_string(),
            });
        }
        state.node_mut(node)?.params.insert(param, value);
        Ok(())
    }

    fn set_position(&self, node: NodeId, position: Position) -> Result<()> {
        let mut state = self.state.lock();
        let target = state.node_mut(node)?;
        if target.spec.kind() != NodeKind::Panner {
            return Err(EngineError::ParameterQuirk {
                node: target.spec.kind().to_string(),
                param: "position".to_string(),
            });
        }
        target.position = Some(position);
        Ok(())
    }

    fn schedule(&self, node: NodeId, event: VoiceEvent, at: f64) -> Result<()> {
        let mut state = self.state.lock();
        if at < state.clock {
            return Err(EngineError::Scheduling {
                at,
                reason: format!("time is before clock {:.4}s", state.clock),
            });
        }
        if state.node(node)?.spec.kind() != NodeKind::Synth {
            return Err(EngineError::Scheduling {
                at,
                reason: format!("node {} is not a synth", node),
            });
        }
        state.events.push(ScheduledEvent { node, at, event });
        Ok(())
    }

    fn cancel_scheduled(&self, node: NodeId, after: f64) -> Result<()> {
        let mut state = self.state.lock();
        state.node(node)?;
        state.events.retain(|e| e.node != node || e.at < after);
        Ok(())
    }

    fn read_level(&self, node: NodeId) -> f32 {
        let state = self.state.lock();
        let now = state.clock;
        let sounding = state
            .upstream_synths(node)
            .into_iter()
            .any(|synth| state.sounding(synth, now));
        if sounding {
            1.0
        } else {
            0.0
        }
    }
}

impl AudioPlatform for MemoryPlatform {
    fn info(&self) -> PlatformInfo {
        self.info.clone()
    }

    fn resume(&self) -> impl Future<Output = Result<()>> + Send {
        let outcome = {
            let mut state = self.state.lock();
            state.resume_calls += 1;
            if state.faults.resume_failures > 0 {
                state.faults.resume_failures -= 1;
                Err(EngineError::ContextResume {
                    reason: "injected failure".to_string(),
                })
            } else {
                state.resumed = true;
                Ok(())
            }
        };
        async move {
            // Hosts resolve resume asynchronously; give concurrent callers a
            // chance to run before completing.
            tokio::task::yield_now().await;
            outcome
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::music::Note;

    fn synth(platform: &MemoryPlatform) -> NodeId {
        platform
            .create_node(&NodeSpec::Synth(crate::synth::Preset::Lead.voice_config(
                crate::platform::VoiceFamily::Mono,
            )))
            .unwrap()
    }

    #[test]
    fn test_create_and_connect() {
        let platform = MemoryPlatform::new();
        let gain = platform.create_node(&NodeSpec::Gain { gain: 0.5 }).unwrap();
        let out = platform.create_node(&NodeSpec::Destination).unwrap();
        platform.connect(gain, out).unwrap();

        assert!(platform.is_connected(gain, out));
        assert_eq!(platform.param(gain, Param::Gain), Some(0.5));
        assert_eq!(platform.created_count(NodeKind::Gain), 1);

        platform.disconnect(gain).unwrap();
        assert!(platform.outputs_of(gain).is_empty());
    }

    #[test]
    fn test_injected_node_failure_is_counted_down() {
        let platform = MemoryPlatform::new();
        platform.fail_node_kind_times(NodeKind::Reverb, 1);
        let spec = NodeSpec::Reverb { decay: 2.0, wet: 0.3 };
        assert!(platform.create_node(&spec).is_err());
        assert!(platform.create_node(&spec).is_ok());
    }

    #[test]
    fn test_schedule_rejects_past_times() {
        let platform = MemoryPlatform::new();
        let voice = synth(&platform);
        platform.set_time(1.0);
        let err = platform
            .schedule(voice, VoiceEvent::ReleaseAll, 0.5)
            .unwrap_err();
        assert_eq!(err.error_code(), "SCHEDULING");
    }

    #[test]
    fn test_sounding_follows_events() {
        let platform = MemoryPlatform::new();
        let voice = synth(&platform);
        let notes = vec![Note::MIDDLE_C];
        platform
            .schedule(
                voice,
                VoiceEvent::AttackRelease {
                    notes: notes.clone(),
                    duration: 0.25,
                    velocity: 1.0,
                },
                0.01,
            )
            .unwrap();

        assert!(!platform.is_sounding(voice, 0.0));
        assert!(platform.is_sounding(voice, 0.1));
        assert!(!platform.is_sounding(voice, 0.3));

        platform
            .schedule(voice, VoiceEvent::Attack { notes: notes.clone(), velocity: 1.0 }, 0.5)
            .unwrap();
        assert!(platform.is_sounding(voice, 10.0));
        platform.schedule(voice, VoiceEvent::ReleaseAll, 11.0).unwrap();
        assert!(!platform.is_sounding(voice, 11.0));
    }

    #[test]
    fn test_cancel_drops_only_future_events() {
        let platform = MemoryPlatform::new();
        let voice = synth(&platform);
        for at in [0.0, 0.5, 1.0] {
            platform
                .schedule(
                    voice,
                    VoiceEvent::AttackRelease {
                        notes: vec![Note::MIDDLE_C],
                        duration: 0.25,
                        velocity: 1.0,
                    },
                    at,
                )
                .unwrap();
        }

        platform.cancel_scheduled(voice, 0.5).unwrap();
        assert_eq!(platform.events_for(voice).len(), 1);
        assert!(platform.is_sounding(voice, 0.1));
        assert!(!platform.is_sounding(voice, 0.6));
        assert!(!platform.is_sounding(voice, 1.1));
    }

    #[test]
    fn test_clock_moves_prune_dead_events() {
        let platform = MemoryPlatform::new();
        let voice = synth(&platform);
        let hit = |at: f64| {
            platform
                .schedule(
                    voice,
                    VoiceEvent::AttackRelease {
                        notes: vec![Note::MIDDLE_C],
                        duration: 0.25,
                        velocity: 1.0,
                    },
                    at,
                )
                .unwrap();
        };
        for step in 0..100 {
            platform.set_time(step as f64);
            hit(step as f64);
        }
        // Only hits inside the history window survive
        assert!(platform.event_count() <= EVENT_HISTORY_SECONDS as usize + 1);
        assert!(platform.is_sounding(voice, 99.1));

        // A held note survives pruning until a release masks it
        platform
            .schedule(voice, VoiceEvent::Attack { notes: vec![Note::MIDDLE_C], velocity: 1.0 }, 100.0)
            .unwrap();
        platform.advance(100.0);
        assert!(platform.is_sounding(voice, platform.now()));
        platform.schedule(voice, VoiceEvent::ReleaseAll, 200.0).unwrap();
        platform.advance(100.0);
        assert_eq!(platform.event_count(), 1);
        assert!(!platform.is_sounding(voice, platform.now()));
    }

    #[test]
    fn test_level_reads_through_the_graph() {
        let platform = MemoryPlatform::new();
        let voice = synth(&platform);
        let filter = platform
            .create_node(&NodeSpec::Filter {
                filter_type: crate::platform::FilterType::Lowpass,
                frequency: 800.0,
            })
            .unwrap();
        let meter = platform.create_node(&NodeSpec::Meter { smoothing: 0.8 }).unwrap();
        platform.connect(voice, filter).unwrap();
        platform.connect(filter, meter).unwrap();

        assert_eq!(platform.read_level(meter), 0.0);
        platform
            .schedule(
                voice,
                VoiceEvent::Attack {
                    notes: vec![Note::MIDDLE_C],
                    velocity: 1.0,
                },
                0.0,
            )
            .unwrap();
        assert_eq!(platform.read_level(meter), 1.0);
    }

    #[test]
    fn test_broken_param_is_a_quirk() {
        let platform = MemoryPlatform::new();
        platform.break_param(NodeKind::Chorus, Param::Depth);
        let chorus = platform
            .create_node(&NodeSpec::Chorus {
                frequency: 1.5,
                delay_time: 3.5,
                depth: 0.5,
                wet: 0.5,
            })
            .unwrap();
        assert_eq!(platform.param(chorus, Param::Depth), None);
        let err = platform.set_param(chorus, Param::Depth, 0.2).unwrap_err();
        assert_eq!(err.error_code(), "PARAMETER_QUIRK");
    }
}
