//! Allocation routing: which backing store receives each allocation
//!
//! The VM steers deep clones with an explicit route instead of the
//! thread-local globals of classic interpreter runtimes: `Heaps` bundles
//! the fluid heap and region manager owned by one VM thread, and
//! `with_route` scopes a route change so it is restored on every exit
//! path, including error returns.

use crate::fluid::FluidHeap;
use crate::region::RegionManager;
use lattice_core::phase::RegionId;

/// Destination for allocations made while cloning values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocRoute {
    /// Plain process heap: outside the VM (tests, startup)
    System,
    /// The fluid heap: normal VM execution
    Fluid,
    /// A crystal region: inside a freeze/forge deep clone
    Region(RegionId),
}

/// One thread's backing stores plus the active route.
#[derive(Debug)]
pub struct Heaps {
    pub fluid: FluidHeap,
    pub regions: RegionManager,
    route: AllocRoute,
}

impl Heaps {
    pub fn new() -> Self {
        Heaps {
            fluid: FluidHeap::new(),
            regions: RegionManager::new(),
            route: AllocRoute::System,
        }
    }

    /// The heaps of a running VM default to fluid routing.
    pub fn for_vm() -> Self {
        Heaps {
            route: AllocRoute::Fluid,
            ..Heaps::new()
        }
    }

    pub fn route(&self) -> AllocRoute {
        self.route
    }

    /// Run `f` with `route` active; the previous route is restored on
    /// every exit path (including `?`-style early returns inside `f`).
    pub fn with_route<R>(&mut self, route: AllocRoute, f: impl FnOnce(&mut Heaps) -> R) -> R {
        let prev = self.route;
        self.route = route;
        let out = f(self);
        self.route = prev;
        out
    }
}

impl Default for Heaps {
    fn default() -> Self {
        Self::new()
    }
}
