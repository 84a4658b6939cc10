//! Fluid heap: tracked allocations with mark-and-sweep reclamation
//!
//! Every fluid composite is registered here under its payload address.
//! The registry holds a strong handle, so an object dropped by every
//! root stays alive until a sweep decides it is garbage: that is what
//! makes the fluid phase *collected* rather than scope-bound.
//!
//! The registry is a hash map keyed by raw pointer address rather than an
//! intrusive list: dealloc and mark stay O(1) and sweep is a retain pass.

use lattice_core::value::{
    ArrayRef, BufferData, ClosureData, EnumData, LatValue, MapRef, SetRef, StructRef,
    ValueCellRef, ValueKind,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::trace;

/// Collection is first considered once this many bytes are live.
pub const DEFAULT_GC_THRESHOLD: usize = 1024 * 1024;

/// Strong handle to one tracked fluid payload.
#[derive(Debug, Clone)]
pub enum FluidObj {
    Array(ArrayRef),
    Buffer(Rc<RefCell<Vec<u8>>>),
    Map(MapRef),
    Set(SetRef),
    Struct(StructRef),
    Enum(Rc<EnumData>),
    Ref(ValueCellRef),
    Closure(Rc<ClosureData>),
}

impl FluidObj {
    /// Stable address of the payload; the registry key.
    pub fn addr(&self) -> usize {
        match self {
            FluidObj::Array(r) => Rc::as_ptr(r) as usize,
            FluidObj::Buffer(r) => Rc::as_ptr(r) as usize,
            FluidObj::Map(r) => Rc::as_ptr(r) as usize,
            FluidObj::Set(r) => Rc::as_ptr(r) as usize,
            FluidObj::Struct(r) => Rc::as_ptr(r) as usize,
            FluidObj::Enum(r) => Rc::as_ptr(r) as usize,
            FluidObj::Ref(r) => Rc::as_ptr(r) as usize,
            FluidObj::Closure(r) => Rc::as_ptr(r) as usize,
        }
    }

    /// The trackable payload of a value, if it has one. Strings and
    /// primitives are owned inline by their slot and are not tracked.
    pub fn from_value(value: &LatValue) -> Option<FluidObj> {
        match &value.kind {
            ValueKind::Array(r) => Some(FluidObj::Array(r.clone())),
            ValueKind::Buffer(BufferData::Heap(r)) => Some(FluidObj::Buffer(r.clone())),
            ValueKind::Map(r) => Some(FluidObj::Map(r.clone())),
            ValueKind::Set(r) => Some(FluidObj::Set(r.clone())),
            ValueKind::Struct(r) => Some(FluidObj::Struct(r.clone())),
            ValueKind::Enum(r) => Some(FluidObj::Enum(r.clone())),
            ValueKind::Ref(r) => Some(FluidObj::Ref(r.clone())),
            ValueKind::Closure(r) => Some(FluidObj::Closure(r.clone())),
            ValueKind::Int(_)
            | ValueKind::Float(_)
            | ValueKind::Bool(_)
            | ValueKind::Unit
            | ValueKind::Nil
            | ValueKind::Str(_)
            | ValueKind::Buffer(BufferData::Arena(_))
            | ValueKind::Tuple(_)
            | ValueKind::Range(_, _)
            | ValueKind::Channel(_)
            | ValueKind::Function(_) => None,
        }
    }
}

#[derive(Debug)]
struct Allocation {
    obj: FluidObj,
    size: usize,
    marked: bool,
}

/// The per-thread fluid heap.
#[derive(Debug, Default)]
pub struct FluidHeap {
    records: HashMap<usize, Allocation>,
    total_bytes: usize,
    gc_threshold: usize,
}

impl FluidHeap {
    pub fn new() -> Self {
        FluidHeap {
            records: HashMap::new(),
            total_bytes: 0,
            gc_threshold: DEFAULT_GC_THRESHOLD,
        }
    }

    pub fn with_threshold(threshold: usize) -> Self {
        FluidHeap {
            gc_threshold: threshold,
            ..FluidHeap::new()
        }
    }

    /// Track a payload. Returns its address. Re-registering an already
    /// tracked payload is a no-op (the first size wins).
    pub fn alloc(&mut self, obj: FluidObj, size: usize) -> usize {
        let addr = obj.addr();
        if self.records.contains_key(&addr) {
            return addr;
        }
        self.records.insert(
            addr,
            Allocation {
                obj,
                size,
                marked: false,
            },
        );
        self.total_bytes += size;
        addr
    }

    /// Track the payload of `value` if it has one, sized by its shallow
    /// payload estimate.
    pub fn track_value(&mut self, value: &LatValue) {
        if let Some(obj) = FluidObj::from_value(value) {
            let size = value.heap_size();
            self.alloc(obj, size);
        }
    }

    /// Drop the record for `addr`, releasing the registry's handle.
    /// Returns false (and changes nothing) for untracked addresses.
    pub fn dealloc(&mut self, addr: usize) -> bool {
        match self.records.remove(&addr) {
            Some(alloc) => {
                self.total_bytes -= alloc.size;
                true
            }
            None => false,
        }
    }

    pub fn unmark_all(&mut self) {
        for alloc in self.records.values_mut() {
            alloc.marked = false;
        }
    }

    /// Mark one record live. Returns false for untracked addresses.
    pub fn mark(&mut self, addr: usize) -> bool {
        match self.records.get_mut(&addr) {
            Some(alloc) => {
                alloc.marked = true;
                true
            }
            None => false,
        }
    }

    pub fn is_marked(&self, addr: usize) -> bool {
        self.records.get(&addr).is_some_and(|a| a.marked)
    }

    /// Free every unmarked record. Returns the number freed.
    pub fn sweep(&mut self) -> usize {
        let before = self.records.len();
        let mut freed_bytes = 0;
        self.records.retain(|_, alloc| {
            if alloc.marked {
                true
            } else {
                freed_bytes += alloc.size;
                false
            }
        });
        self.total_bytes -= freed_bytes;
        let freed = before - self.records.len();
        if freed > 0 {
            trace!(freed, freed_bytes, live = self.records.len(), "fluid sweep");
        }
        // Back off the threshold so surviving-heavy workloads do not
        // sweep on every allocation.
        self.gc_threshold = (self.total_bytes * 2).max(DEFAULT_GC_THRESHOLD);
        freed
    }

    pub fn live_count(&self) -> usize {
        self.records.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn should_collect(&self) -> bool {
        self.total_bytes > self.gc_threshold
    }
}

/// Mark everything reachable from `value`: the payload itself plus every
/// tracked payload inside it. Used by the VM's root scan.
pub fn mark_reachable(heap: &mut FluidHeap, value: &LatValue) {
    if let Some(obj) = FluidObj::from_value(value) {
        let addr = obj.addr();
        if heap.is_marked(addr) {
            return; // already visited; guards against cycles
        }
        heap.mark(addr);
    }
    match &value.kind {
        ValueKind::Array(arr) => {
            for v in arr.borrow().iter() {
                mark_reachable(heap, v);
            }
        }
        ValueKind::Tuple(elems) => {
            for v in elems.iter() {
                mark_reachable(heap, v);
            }
        }
        ValueKind::Map(map) => {
            for (_, v) in map.borrow().entries.iter() {
                mark_reachable(heap, v);
            }
        }
        ValueKind::Struct(s) => {
            for v in s.borrow().fields.iter() {
                mark_reachable(heap, v);
            }
        }
        ValueKind::Enum(e) => {
            for v in e.payload.iter() {
                mark_reachable(heap, v);
            }
        }
        ValueKind::Ref(cell) => {
            mark_reachable(heap, &cell.borrow());
        }
        ValueKind::Closure(c) => {
            if let lattice_core::value::Captures::Upvalues(ups) = &c.captures {
                for up in ups {
                    if let lattice_core::value::Upvalue::Closed(v) = &*up.borrow() {
                        mark_reachable(heap, v);
                    }
                }
            }
        }
        ValueKind::Int(_)
        | ValueKind::Float(_)
        | ValueKind::Bool(_)
        | ValueKind::Unit
        | ValueKind::Nil
        | ValueKind::Str(_)
        | ValueKind::Buffer(_)
        | ValueKind::Set(_)
        | ValueKind::Range(_, _)
        | ValueKind::Channel(_)
        | ValueKind::Function(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracked_array(heap: &mut FluidHeap, len: usize) -> (LatValue, usize, usize) {
        let value = LatValue::array((0..len as i64).map(LatValue::int).collect());
        let size = value.heap_size();
        let obj = FluidObj::from_value(&value).expect("array is trackable");
        let addr = heap.alloc(obj, size);
        (value, addr, size)
    }

    #[test]
    fn test_alloc_increments_counters_by_exact_size() {
        let mut heap = FluidHeap::new();
        let (_v, _addr, size) = tracked_array(&mut heap, 3);
        assert_eq!(heap.live_count(), 1);
        assert_eq!(heap.total_bytes(), size);
        let (_v2, _addr2, size2) = tracked_array(&mut heap, 10);
        assert_eq!(heap.live_count(), 2);
        assert_eq!(heap.total_bytes(), size + size2);
    }

    #[test]
    fn test_dealloc_decrements_and_unknown_is_noop() {
        let mut heap = FluidHeap::new();
        let (_v, addr, _size) = tracked_array(&mut heap, 3);
        let (_v2, _addr2, size2) = tracked_array(&mut heap, 5);
        assert!(heap.dealloc(addr));
        assert_eq!(heap.live_count(), 1);
        assert_eq!(heap.total_bytes(), size2);
        // unknown pointer: both counters unchanged
        assert!(!heap.dealloc(0xdead_beef));
        assert_eq!(heap.live_count(), 1);
        assert_eq!(heap.total_bytes(), size2);
    }

    #[test]
    fn test_mark_sweep_frees_unmarked() {
        let mut heap = FluidHeap::new();
        let (a, addr_a, size_a) = tracked_array(&mut heap, 1);
        let (_b, _addr_b, _) = tracked_array(&mut heap, 2);
        let (c, addr_c, size_c) = tracked_array(&mut heap, 3);
        heap.unmark_all();
        heap.mark(addr_a);
        heap.mark(addr_c);
        let freed = heap.sweep();
        assert_eq!(freed, 1);
        assert_eq!(heap.live_count(), 2);
        assert_eq!(heap.total_bytes(), size_a + size_c);
        // survivors stay readable and writable
        if let ValueKind::Array(arr) = &a.kind {
            arr.borrow_mut().push(LatValue::int(99));
            assert_eq!(arr.borrow().len(), 2);
        }
        assert_eq!(c.to_string(), "[0, 1, 2]");
    }

    #[test]
    fn test_sweep_frees_orphans_for_real() {
        let mut heap = FluidHeap::new();
        let value = LatValue::array(vec![LatValue::int(1)]);
        let obj = FluidObj::from_value(&value).unwrap();
        let weak = match &value.kind {
            ValueKind::Array(r) => Rc::downgrade(r),
            _ => unreachable!(),
        };
        heap.alloc(obj, value.heap_size());
        drop(value); // heap now holds the only strong handle
        assert!(weak.upgrade().is_some());
        heap.unmark_all();
        heap.sweep();
        assert!(weak.upgrade().is_none(), "sweep released the last handle");
    }

    #[test]
    fn test_double_registration_is_idempotent() {
        let mut heap = FluidHeap::new();
        let value = LatValue::array(vec![LatValue::int(1)]);
        heap.track_value(&value);
        heap.track_value(&value);
        assert_eq!(heap.live_count(), 1);
    }

    #[test]
    fn test_mark_reachable_walks_nesting() {
        let mut heap = FluidHeap::new();
        let inner = LatValue::array(vec![LatValue::int(1)]);
        heap.track_value(&inner);
        let outer = LatValue::array(vec![inner.clone()]);
        heap.track_value(&outer);
        heap.unmark_all();
        mark_reachable(&mut heap, &outer);
        assert_eq!(heap.sweep(), 0);
        assert_eq!(heap.live_count(), 2);
    }

    #[test]
    fn test_threshold_backoff_after_sweep() {
        let mut heap = FluidHeap::with_threshold(1);
        let (_v, _addr, _size) = tracked_array(&mut heap, 100);
        assert!(heap.should_collect());
        heap.unmark_all();
        let (_, addr, _) = tracked_array(&mut heap, 1);
        heap.mark(addr);
        heap.sweep();
        assert!(!heap.should_collect());
    }
}
