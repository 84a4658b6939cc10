//! Lattice Runtime: dual heap, channels, and the bytecode VM
//!
//! The execution side of the Lattice phase system:
//! - `fluid`: mark-and-sweep tracked heap for mutable values
//! - `region`: epoch-versioned bump-arena regions for crystal values
//! - `router`: explicit allocation routing between the two
//! - `phase_ops`: deep clone, freeze, thaw, partial freezes
//! - `channel`: the only sanctioned cross-thread communication
//! - `builtins`: native function and per-type method registries
//! - `modules`: compiled module chunks for `IMPORT`
//! - `vm`: the stack VM (frames, handlers, defers, inline caches)

pub mod builtins;
pub mod channel;
pub mod fluid;
pub mod modules;
pub mod phase_ops;
pub mod region;
pub mod router;
pub mod vm;

pub use builtins::{Arity, Builtins};
pub use channel::{
    channel_count, channel_stats, close_channel, make_channel, recv_value, send_value,
    ChannelStats,
};
pub use fluid::{mark_reachable, FluidHeap, FluidObj, DEFAULT_GC_THRESHOLD};
pub use modules::ModuleRegistry;
pub use phase_ops::{
    deep_clone, deep_clone_for_transfer, deep_is_crystal, freeze_except, freeze_map_key,
    freeze_struct_field, value_freeze, value_sublimate, value_thaw,
};
pub use region::{reachable_regions, Region, RegionManager};
pub use router::{AllocRoute, Heaps};
pub use vm::{OutputSink, Vm, VmConfig};
