//! Signal routing
//!
//! The shared master chain, the per-entity sub-chains that feed it, and the
//! mapping of stored effect parameters onto sub-chain nodes.

mod master;
mod params;
mod subchain;

pub use master::{Fidelity, MasterChain, MasterControl, MasterSettings, MasterStage};
pub use params::{apply_params, EffectParams, EffectPatch, ParamWrite, MAX_CUTOFF_HZ, MIN_CUTOFF_HZ};
pub use subchain::{LevelMeter, SpatialPanner, SubChain};

pub(crate) use subchain::unwind as unwind_nodes;
