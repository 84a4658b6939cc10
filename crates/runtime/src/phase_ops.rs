//! Phase transitions: deep clone, freeze, thaw, and partial freezes
//!
//! All cloning funnels through [`deep_clone`], which consults the active
//! allocation route:
//!
//! - `Region(id)`: every node is tagged CRYSTAL and stamped with the
//!   region id; string and buffer bytes are copied into the region's
//!   arena; composite nodes charge their size to the region. Map clones
//!   preserve slot layout (probe chains and tombstones) so lookups on the
//!   frozen copy behave identically.
//! - `Fluid`: every node is tagged FLUID, payloads are rebuilt on the
//!   heap, and composites are registered with the fluid heap.
//! - `System`: a plain structural copy preserving existing tags.
//!
//! Tuples are crystal by construction and stay crystal even under thaw;
//! they are immutable islands inside otherwise fluid graphs.

use crate::router::{AllocRoute, Heaps};
use lattice_core::env::clone_chain;
use lattice_core::error::LatError;
use lattice_core::latstr::LatStr;
use lattice_core::phase::{Phase, NO_REGION};
use lattice_core::value::{
    BufferData, Captures, ClosureData, EnumData, LatValue, MapData, StructData, Upvalue,
    ValueKind,
};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::trace;

/// Freeze: deep-clone `value` into a fresh region at the current epoch,
/// tagging every node CRYSTAL. Freezing a crystal value shares it.
pub fn value_freeze(heaps: &mut Heaps, value: &LatValue) -> Result<LatValue, LatError> {
    if value.phase == Phase::Crystal {
        return Ok(value.clone());
    }
    let region = heaps.regions.create();
    let frozen = heaps.with_route(AllocRoute::Region(region), |h| deep_clone(h, value))?;
    trace!(region, bytes = heaps.regions.total_bytes(region), "froze value");
    Ok(frozen)
}

/// Thaw: deep-clone out of the region, tagging every node FLUID.
pub fn value_thaw(heaps: &mut Heaps, value: &LatValue) -> Result<LatValue, LatError> {
    heaps.with_route(AllocRoute::Fluid, |h| deep_clone(h, value))
}

/// Thaw and release the source region in one step (crystal -> gone).
pub fn value_sublimate(heaps: &mut Heaps, value: &LatValue) -> Result<LatValue, LatError> {
    let thawed = value_thaw(heaps, value)?;
    if value.region != NO_REGION {
        heaps.regions.release(value.region);
    }
    Ok(thawed)
}

/// True when every reachable node is CRYSTAL.
pub fn deep_is_crystal(value: &LatValue) -> bool {
    if value.phase != Phase::Crystal {
        return false;
    }
    match &value.kind {
        ValueKind::Array(arr) => arr.borrow().iter().all(deep_is_crystal),
        ValueKind::Tuple(elems) => elems.iter().all(deep_is_crystal),
        ValueKind::Map(map) => map.borrow().entries.values().all(deep_is_crystal),
        ValueKind::Struct(s) => s.borrow().fields.iter().all(deep_is_crystal),
        ValueKind::Enum(e) => e.payload.iter().all(deep_is_crystal),
        ValueKind::Ref(cell) => deep_is_crystal(&cell.borrow()),
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
        | ValueKind::Closure(_)
        | ValueKind::Function(_) => true,
    }
}

/// Route-aware deep clone. See the module docs for per-route behavior.
pub fn deep_clone(heaps: &mut Heaps, value: &LatValue) -> Result<LatValue, LatError> {
    let route = heaps.route();
    let (phase, region) = match route {
        AllocRoute::System => (value.phase, value.region),
        AllocRoute::Fluid => (Phase::Fluid, NO_REGION),
        AllocRoute::Region(id) => (Phase::Crystal, id),
    };
    let kind = match &value.kind {
        ValueKind::Int(n) => ValueKind::Int(*n),
        ValueKind::Float(x) => ValueKind::Float(*x),
        ValueKind::Bool(b) => ValueKind::Bool(*b),
        ValueKind::Unit => ValueKind::Unit,
        ValueKind::Nil => ValueKind::Nil,
        ValueKind::Range(a, b) => ValueKind::Range(*a, *b),
        ValueKind::Str(s) => ValueKind::Str(clone_str(heaps, s, route)),
        ValueKind::Buffer(b) => ValueKind::Buffer(clone_buffer(heaps, b, route)),
        ValueKind::Array(arr) => {
            let elems = arr
                .borrow()
                .iter()
                .map(|v| deep_clone(heaps, v))
                .collect::<Result<Vec<_>, _>>()?;
            ValueKind::Array(Rc::new(RefCell::new(elems)))
        }
        ValueKind::Tuple(elems) => {
            // Tuples stay crystal even when the route is fluid; their
            // elements keep their tags.
            let cloned = match route {
                AllocRoute::Fluid | AllocRoute::System => elems.clone(),
                AllocRoute::Region(_) => elems
                    .iter()
                    .map(|v| deep_clone(heaps, v))
                    .collect::<Result<Vec<_>, _>>()?
                    .into(),
            };
            let mut out = LatValue::new(ValueKind::Tuple(cloned));
            out.phase = Phase::Crystal;
            out.region = if let AllocRoute::Region(id) = route {
                id
            } else {
                value.region
            };
            finish_composite(heaps, &mut out, route);
            return Ok(out);
        }
        ValueKind::Map(map) => {
            let src = map.borrow();
            // Layout-preserving: clone the slot array verbatim, then map
            // the values in place. No rehash, probe chains intact.
            let mut entries = src.entries.clone();
            for (_, v) in entries.iter_mut() {
                *v = deep_clone(heaps, &v.clone())?;
            }
            let key_phases = match route {
                // A uniformly tagged clone needs no per-key table
                AllocRoute::Region(_) | AllocRoute::Fluid => None,
                AllocRoute::System => src.key_phases.clone(),
            };
            ValueKind::Map(Rc::new(RefCell::new(MapData {
                entries,
                key_phases,
            })))
        }
        ValueKind::Set(set) => ValueKind::Set(Rc::new(RefCell::new(set.borrow().clone()))),
        ValueKind::Struct(s) => {
            let src = s.borrow();
            let fields = src
                .fields
                .iter()
                .map(|v| deep_clone(heaps, v))
                .collect::<Result<Vec<_>, _>>()?;
            let field_phases = match route {
                AllocRoute::Region(_) | AllocRoute::Fluid => None,
                AllocRoute::System => src.field_phases.clone(),
            };
            ValueKind::Struct(Rc::new(RefCell::new(StructData {
                name: src.name.clone(),
                field_names: src.field_names.clone(),
                fields,
                field_phases,
            })))
        }
        ValueKind::Enum(e) => {
            let payload = e
                .payload
                .iter()
                .map(|v| deep_clone(heaps, v))
                .collect::<Result<Vec<_>, _>>()?;
            ValueKind::Enum(Rc::new(EnumData {
                enum_name: e.enum_name.clone(),
                variant: e.variant.clone(),
                payload,
            }))
        }
        ValueKind::Ref(cell) => {
            let inner = deep_clone(heaps, &cell.borrow())?;
            ValueKind::Ref(Rc::new(RefCell::new(inner)))
        }
        ValueKind::Channel(chan) => ValueKind::Channel(chan.clone()),
        ValueKind::Closure(c) => match route {
            // Fluid and system clones share the closure; captured
            // variables stay reference-shared.
            AllocRoute::Fluid | AllocRoute::System => ValueKind::Closure(c.clone()),
            AllocRoute::Region(_) => ValueKind::Closure(Rc::new(freeze_closure(heaps, c)?)),
        },
        ValueKind::Function(proto) => ValueKind::Function(proto.clone()),
    };
    let mut out = LatValue::new(kind);
    out.phase = phase;
    out.region = region;
    finish_composite(heaps, &mut out, route);
    Ok(out)
}

fn clone_str(heaps: &mut Heaps, s: &LatStr, route: AllocRoute) -> LatStr {
    match route {
        AllocRoute::Region(id) => match heaps.regions.alloc_str(id, s.as_str()) {
            Some(arena_str) => LatStr::Arena(arena_str),
            None => LatStr::Heap(s.to_heap_string()),
        },
        AllocRoute::Fluid | AllocRoute::System => LatStr::Heap(s.to_heap_string()),
    }
}

fn clone_buffer(heaps: &mut Heaps, b: &BufferData, route: AllocRoute) -> BufferData {
    match route {
        AllocRoute::Region(id) => {
            let bytes = b.to_vec();
            match heaps.regions.alloc_bytes(id, &bytes) {
                Some(arena_bytes) => BufferData::Arena(arena_bytes),
                None => BufferData::from_bytes(bytes),
            }
        }
        AllocRoute::Fluid | AllocRoute::System => BufferData::from_bytes(b.to_vec()),
    }
}

/// Closure capture clone for the crystal route. Open upvalues must have
/// been closed by the VM before freezing.
fn freeze_closure(heaps: &mut Heaps, c: &ClosureData) -> Result<ClosureData, LatError> {
    let captures = match &c.captures {
        Captures::Env(env) => {
            let mut err = None;
            let cloned = clone_chain(env, &mut |v| match deep_clone(heaps, v) {
                Ok(out) => out,
                Err(e) => {
                    err.get_or_insert(e);
                    LatValue::nil()
                }
            });
            if let Some(e) = err {
                return Err(e);
            }
            Captures::Env(cloned)
        }
        Captures::Upvalues(ups) => {
            let mut cloned = Vec::with_capacity(ups.len());
            for up in ups {
                let inner = match &*up.borrow() {
                    Upvalue::Closed(v) => deep_clone(heaps, v)?,
                    Upvalue::Open(_) => {
                        return Err(LatError::phase(
                            "cannot freeze a closure with open captures",
                        ))
                    }
                };
                cloned.push(Rc::new(RefCell::new(Upvalue::Closed(inner))));
            }
            Captures::Upvalues(cloned)
        }
    };
    Ok(ClosureData {
        proto: c.proto.clone(),
        captures,
    })
}

/// Register or charge a freshly cloned composite with its backing store.
fn finish_composite(heaps: &mut Heaps, value: &mut LatValue, route: AllocRoute) {
    if !value.is_composite() {
        return;
    }
    match route {
        AllocRoute::Fluid => heaps.fluid.track_value(value),
        AllocRoute::Region(id) => heaps.regions.charge(id, value.heap_size()),
        AllocRoute::System => {}
    }
}

/// Clone for cross-thread transfer: every `Rc` spine is rebuilt so no
/// reference count is ever shared between threads. `Arc`-backed payloads
/// (arena strings and buffers, channels, function prototypes) are shared;
/// that is what makes crystal values cheap to move.
///
/// The VM closes open upvalues before transferring a closure; any still
/// open are snapshot as nil.
pub fn deep_clone_for_transfer(value: &LatValue) -> LatValue {
    let kind = match &value.kind {
        ValueKind::Int(n) => ValueKind::Int(*n),
        ValueKind::Float(x) => ValueKind::Float(*x),
        ValueKind::Bool(b) => ValueKind::Bool(*b),
        ValueKind::Unit => ValueKind::Unit,
        ValueKind::Nil => ValueKind::Nil,
        ValueKind::Range(a, b) => ValueKind::Range(*a, *b),
        ValueKind::Str(s) => match s {
            LatStr::Arena(a) => ValueKind::Str(LatStr::Arena(a.clone())),
            LatStr::Heap(h) => ValueKind::Str(LatStr::Heap(h.clone())),
        },
        ValueKind::Buffer(b) => match b {
            BufferData::Arena(a) => ValueKind::Buffer(BufferData::Arena(a.clone())),
            BufferData::Heap(h) => ValueKind::Buffer(BufferData::from_bytes(h.borrow().clone())),
        },
        ValueKind::Array(arr) => ValueKind::Array(Rc::new(RefCell::new(
            arr.borrow().iter().map(deep_clone_for_transfer).collect(),
        ))),
        ValueKind::Tuple(elems) => {
            ValueKind::Tuple(elems.iter().map(deep_clone_for_transfer).collect())
        }
        ValueKind::Map(map) => {
            let src = map.borrow();
            let mut entries = src.entries.clone();
            for (_, v) in entries.iter_mut() {
                *v = deep_clone_for_transfer(&v.clone());
            }
            ValueKind::Map(Rc::new(RefCell::new(MapData {
                entries,
                key_phases: src.key_phases.clone(),
            })))
        }
        ValueKind::Set(set) => ValueKind::Set(Rc::new(RefCell::new(set.borrow().clone()))),
        ValueKind::Struct(s) => {
            let src = s.borrow();
            ValueKind::Struct(Rc::new(RefCell::new(StructData {
                name: src.name.clone(),
                field_names: src.field_names.clone(),
                fields: src.fields.iter().map(deep_clone_for_transfer).collect(),
                field_phases: src.field_phases.clone(),
            })))
        }
        ValueKind::Enum(e) => ValueKind::Enum(Rc::new(EnumData {
            enum_name: e.enum_name.clone(),
            variant: e.variant.clone(),
            payload: e.payload.iter().map(deep_clone_for_transfer).collect(),
        })),
        ValueKind::Ref(cell) => ValueKind::Ref(Rc::new(RefCell::new(deep_clone_for_transfer(
            &cell.borrow(),
        )))),
        ValueKind::Channel(chan) => ValueKind::Channel(chan.clone()),
        ValueKind::Closure(c) => {
            let captures = match &c.captures {
                Captures::Env(env) => Captures::Env(clone_chain(env, &mut |v| {
                    deep_clone_for_transfer(v)
                })),
                Captures::Upvalues(ups) => Captures::Upvalues(
                    ups.iter()
                        .map(|up| {
                            let inner = match &*up.borrow() {
                                Upvalue::Closed(v) => deep_clone_for_transfer(v),
                                Upvalue::Open(_) => LatValue::nil(),
                            };
                            Rc::new(RefCell::new(Upvalue::Closed(inner)))
                        })
                        .collect(),
                ),
            };
            ValueKind::Closure(Rc::new(ClosureData {
                proto: c.proto.clone(),
                captures,
            }))
        }
        ValueKind::Function(proto) => ValueKind::Function(proto.clone()),
    };
    let mut out = LatValue::new(kind);
    out.phase = value.phase;
    out.region = value.region;
    out
}

/// Freeze a single map key in place, building the per-key phase table.
pub fn freeze_map_key(
    heaps: &mut Heaps,
    map: &lattice_core::value::MapRef,
    key: &str,
) -> Result<(), LatError> {
    let current = match map.borrow().entries.get(key) {
        Some(v) => v.clone(),
        None => return Err(LatError::missing_field("map", key)),
    };
    let frozen = value_freeze(heaps, &current)?;
    let mut data = map.borrow_mut();
    data.entries.insert(key, frozen);
    let table = data.key_phases.get_or_insert_with(Default::default);
    table.insert(key, Phase::Crystal);
    Ok(())
}

/// Freeze a single struct field in place.
pub fn freeze_struct_field(
    heaps: &mut Heaps,
    strct: &lattice_core::value::StructRef,
    field: &str,
) -> Result<(), LatError> {
    let (index, current) = {
        let data = strct.borrow();
        match data.field_index(field) {
            Some(i) => (i, data.fields[i].clone()),
            None => return Err(LatError::missing_field(&data.name.clone(), field)),
        }
    };
    let frozen = value_freeze(heaps, &current)?;
    let mut data = strct.borrow_mut();
    let field_count = data.fields.len();
    data.fields[index] = frozen;
    let table = data
        .field_phases
        .get_or_insert_with(|| vec![Phase::Unphased; field_count]);
    table[index] = Phase::Crystal;
    Ok(())
}

/// Freeze every direct field/key except the named ones.
pub fn freeze_except(
    heaps: &mut Heaps,
    value: &LatValue,
    except: &[String],
) -> Result<(), LatError> {
    let keep = |name: &str| except.iter().any(|e| e == name);
    match &value.kind {
        ValueKind::Map(map) => {
            let keys: Vec<String> = map
                .borrow()
                .entries
                .keys()
                .filter(|k| !keep(k))
                .map(|k| k.to_string())
                .collect();
            for key in keys {
                freeze_map_key(heaps, map, &key)?;
            }
            Ok(())
        }
        ValueKind::Struct(s) => {
            let names: Vec<String> = s
                .borrow()
                .field_names
                .iter()
                .filter(|n| !keep(n))
                .map(|n| n.to_string())
                .collect();
            for name in names {
                freeze_struct_field(heaps, s, &name)?;
            }
            Ok(())
        }
        _ => Err(LatError::type_error(format!(
            "freeze-except applies to maps and structs, not {}",
            value.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::map::LatMap;

    fn sample_nested() -> LatValue {
        let mut entries = LatMap::new();
        entries.insert("xs", LatValue::array(vec![LatValue::int(1), LatValue::int(2)]));
        entries.insert("name", LatValue::string("lattice"));
        LatValue::map(MapData {
            entries,
            key_phases: None,
        })
    }

    #[test]
    fn test_freeze_tags_every_node_crystal() {
        let mut heaps = Heaps::for_vm();
        let v = sample_nested();
        let frozen = value_freeze(&mut heaps, &v).unwrap();
        assert!(deep_is_crystal(&frozen));
        assert_ne!(frozen.region, NO_REGION);
        assert!(heaps.regions.contains(frozen.region));
    }

    #[test]
    fn test_thaw_round_trip_is_structurally_equal() {
        let mut heaps = Heaps::for_vm();
        let v = sample_nested();
        let frozen = value_freeze(&mut heaps, &v).unwrap();
        let thawed = value_thaw(&mut heaps, &frozen).unwrap();
        assert_eq!(thawed, v);
        assert_eq!(thawed.phase, Phase::Fluid);
        assert_eq!(thawed.region, NO_REGION);
        assert!(!deep_is_crystal(&thawed));
    }

    #[test]
    fn test_freeze_does_not_alias_source() {
        let mut heaps = Heaps::for_vm();
        let v = LatValue::array(vec![LatValue::int(1)]);
        let frozen = value_freeze(&mut heaps, &v).unwrap();
        if let ValueKind::Array(arr) = &v.kind {
            arr.borrow_mut().push(LatValue::int(2));
        }
        if let ValueKind::Array(arr) = &frozen.kind {
            assert_eq!(arr.borrow().len(), 1);
        }
    }

    #[test]
    fn test_freeze_string_lands_in_arena() {
        let mut heaps = Heaps::for_vm();
        let v = LatValue::string("goes to the arena");
        let frozen = value_freeze(&mut heaps, &v).unwrap();
        match &frozen.kind {
            ValueKind::Str(s) => assert!(s.is_arena()),
            other => panic!("expected string, got {:?}", other),
        }
        assert!(heaps.regions.total_bytes(frozen.region) >= 17);
    }

    #[test]
    fn test_freeze_of_crystal_is_shared() {
        let mut heaps = Heaps::for_vm();
        let v = sample_nested();
        let frozen = value_freeze(&mut heaps, &v).unwrap();
        let regions_before = heaps.regions.region_count();
        let again = value_freeze(&mut heaps, &frozen).unwrap();
        assert_eq!(heaps.regions.region_count(), regions_before);
        assert_eq!(again.region, frozen.region);
    }

    #[test]
    fn test_fluid_clone_registers_in_heap() {
        let mut heaps = Heaps::for_vm();
        let v = sample_nested();
        let before = heaps.fluid.live_count();
        let _thawed = value_thaw(&mut heaps, &v).unwrap();
        assert!(heaps.fluid.live_count() > before);
    }

    #[test]
    fn test_map_freeze_preserves_probe_layout() {
        let mut heaps = Heaps::for_vm();
        let mut entries = LatMap::new();
        for i in 0..24 {
            entries.insert(&format!("key{}", i), LatValue::int(i));
        }
        entries.remove("key5");
        entries.remove("key13");
        let v = LatValue::map(MapData {
            entries,
            key_phases: None,
        });
        let frozen = value_freeze(&mut heaps, &v).unwrap();
        let (src, dst) = match (&v.kind, &frozen.kind) {
            (ValueKind::Map(a), ValueKind::Map(b)) => (a.borrow(), b.borrow()),
            _ => unreachable!(),
        };
        let src_keys: Vec<String> = src.entries.keys().map(String::from).collect();
        let dst_keys: Vec<String> = dst.entries.keys().map(String::from).collect();
        assert_eq!(src_keys, dst_keys, "iteration order identical");
        assert_eq!(src.entries.capacity(), dst.entries.capacity());
    }

    #[test]
    fn test_sublimate_releases_region() {
        let mut heaps = Heaps::for_vm();
        let v = sample_nested();
        let frozen = value_freeze(&mut heaps, &v).unwrap();
        heaps.regions.retain(frozen.region);
        let thawed = value_sublimate(&mut heaps, &frozen).unwrap();
        assert_eq!(thawed, v);
        assert_eq!(heaps.regions.region(frozen.region).unwrap().ref_count(), 0);
    }

    #[test]
    fn test_freeze_map_key_builds_phase_table() {
        let mut heaps = Heaps::for_vm();
        let v = sample_nested();
        let map = match &v.kind {
            ValueKind::Map(m) => m.clone(),
            _ => unreachable!(),
        };
        freeze_map_key(&mut heaps, &map, "xs").unwrap();
        let data = map.borrow();
        assert_eq!(data.key_phase("xs", Phase::Fluid), Phase::Crystal);
        assert_eq!(data.key_phase("name", Phase::Fluid), Phase::Fluid);
        assert!(deep_is_crystal(data.entries.get("xs").unwrap()));
    }

    #[test]
    fn test_freeze_except_leaves_named_fields_fluid() {
        let mut heaps = Heaps::for_vm();
        let v = LatValue::struct_value(StructData {
            name: "Account".into(),
            field_names: vec!["id".into(), "balance".into(), "log".into()],
            fields: vec![
                LatValue::int(1),
                LatValue::int(100),
                LatValue::array(vec![]),
            ],
            field_phases: None,
        });
        freeze_except(&mut heaps, &v, &["log".to_string()]).unwrap();
        let s = match &v.kind {
            ValueKind::Struct(s) => s.borrow(),
            _ => unreachable!(),
        };
        assert_eq!(s.field_phase(0, Phase::Fluid), Phase::Crystal);
        assert_eq!(s.field_phase(1, Phase::Fluid), Phase::Crystal);
        assert_eq!(s.field_phase(2, Phase::Fluid), Phase::Unphased);
    }

    #[test]
    fn test_transfer_clone_rebuilds_rc_spines() {
        let v = sample_nested();
        let moved = deep_clone_for_transfer(&v);
        assert_eq!(moved, v);
        let (a, b) = match (&v.kind, &moved.kind) {
            (ValueKind::Map(a), ValueKind::Map(b)) => (a, b),
            _ => unreachable!(),
        };
        assert!(!Rc::ptr_eq(a, b));
    }

    #[test]
    fn test_tuple_stays_crystal_under_thaw() {
        let mut heaps = Heaps::for_vm();
        let t = LatValue::tuple(vec![LatValue::int(1).with_phase(Phase::Crystal)]);
        let thawed = value_thaw(&mut heaps, &t).unwrap();
        assert_eq!(thawed.phase, Phase::Crystal);
    }
}
