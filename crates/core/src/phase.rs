//! Phase tags and region identifiers
//!
//! Every Lattice value carries a phase that governs mutability and which
//! backing store owns its memory:
//!
//! - `Unphased`: primitives and fresh temporaries, copied by value
//! - `Fluid`: mutable, individually tracked in the fluid heap
//! - `Crystal`: immutable, arena-backed, reclaimed when its region dies

use serde::{Deserialize, Serialize};

/// Mutability/backing-store phase of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Phase {
    /// No phase commitment yet (primitives, literals, temporaries)
    #[default]
    Unphased,
    /// Mutable, fluid-heap backed
    Fluid,
    /// Immutable, region backed
    Crystal,
}

impl Phase {
    pub fn is_crystal(self) -> bool {
        self == Phase::Crystal
    }

    pub fn is_fluid(self) -> bool {
        self == Phase::Fluid
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Unphased => "unphased",
            Phase::Fluid => "fluid",
            Phase::Crystal => "crystal",
        };
        write!(f, "{}", s)
    }
}

/// Identifier of the crystal region that owns a value's memory.
///
/// `NO_REGION` (zero) marks heap-backed values. Real ids are handed out by
/// the region manager from a process-wide counter, so ids minted on
/// different threads never collide.
pub type RegionId = u32;

/// Sentinel for "not owned by any region".
pub const NO_REGION: RegionId = 0;
