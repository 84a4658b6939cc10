//! Builtin functions and per-type method tables
//!
//! Two registries:
//! - named builtins (`print`, `len`, `channel`, ...) reached through
//!   `INVOKE_GLOBAL`
//! - per-type methods (`xs.push(1)`, `s.split(",")`, ...) reached through
//!   `INVOKE` and cached in the chunk's inline caches by method index
//!
//! Host integration (files, network, time) is not registered here; an
//! embedder extends the set through [`Builtins::register`] and
//! [`Builtins::register_method`].

use crate::channel;
use crate::phase_ops;
use crate::vm::Vm;
use lattice_core::error::LatError;
use lattice_core::phase::Phase;
use lattice_core::value::{BufferData, LatValue, ValueKind};
use std::collections::HashMap;

/// Arity contract for a builtin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(u8),
    AtLeast(u8),
}

impl Arity {
    fn check(self, got: usize, name: &str) -> Result<(), LatError> {
        match self {
            Arity::Exact(n) if got == n as usize => Ok(()),
            Arity::AtLeast(n) if got >= n as usize => Ok(()),
            Arity::Exact(n) => Err(LatError::arity(n as usize, got, name)),
            Arity::AtLeast(n) => Err(LatError::arity(n as usize, got, name)),
        }
    }
}

pub type BuiltinFn = fn(&mut Vm, Vec<LatValue>) -> Result<LatValue, LatError>;
pub type MethodFn = fn(&mut Vm, &LatValue, Vec<LatValue>) -> Result<LatValue, LatError>;

struct Builtin {
    name: &'static str,
    arity: Arity,
    func: BuiltinFn,
}

struct Method {
    shape: &'static str,
    name: &'static str,
    arity: Arity,
    func: MethodFn,
}

/// The builtin registries. Shared read-only between VM threads.
pub struct Builtins {
    by_name: HashMap<&'static str, usize>,
    entries: Vec<Builtin>,
    methods: Vec<Method>,
    method_index: HashMap<(&'static str, &'static str), u16>,
}

impl Builtins {
    pub fn new() -> Self {
        Builtins {
            by_name: HashMap::new(),
            entries: Vec::new(),
            methods: Vec::new(),
            method_index: HashMap::new(),
        }
    }

    /// The standard registry every VM starts from.
    pub fn standard() -> Self {
        let mut b = Builtins::new();
        b.register("print", Arity::AtLeast(0), builtin_print);
        b.register("println", Arity::AtLeast(0), builtin_println);
        b.register("len", Arity::Exact(1), builtin_len);
        b.register("str", Arity::Exact(1), builtin_str);
        b.register("type_of", Arity::Exact(1), builtin_type_of);
        b.register("shape_of", Arity::Exact(1), builtin_shape_of);
        b.register("phase_of", Arity::Exact(1), builtin_phase_of);
        b.register("clone", Arity::Exact(1), builtin_clone);
        b.register("anneal", Arity::Exact(2), builtin_anneal);
        b.register("abs", Arity::Exact(1), builtin_abs);
        b.register("min", Arity::Exact(2), builtin_min);
        b.register("max", Arity::Exact(2), builtin_max);
        b.register("assert", Arity::AtLeast(1), builtin_assert);
        b.register("channel", Arity::AtLeast(0), builtin_channel);
        b.register("send", Arity::Exact(2), builtin_send);
        b.register("recv", Arity::Exact(1), builtin_recv);
        b.register("send_safe", Arity::Exact(2), builtin_send_safe);
        b.register("recv_safe", Arity::Exact(1), builtin_recv_safe);
        b.register("close", Arity::Exact(1), builtin_close);
        b.register("ref", Arity::Exact(1), builtin_ref);
        b.register("deref", Arity::Exact(1), builtin_deref);
        b.register("set_ref", Arity::Exact(2), builtin_set_ref);
        b.register("heap_stats", Arity::Exact(0), builtin_heap_stats);
        b.register("region_stats", Arity::Exact(0), builtin_region_stats);
        b.register("gc", Arity::Exact(0), builtin_gc);

        b.register_method("array", "len", Arity::Exact(0), method_seq_len);
        b.register_method("array", "push", Arity::Exact(1), method_array_push);
        b.register_method("array", "pop", Arity::Exact(0), method_array_pop);
        b.register_method("array", "contains", Arity::Exact(1), method_array_contains);
        b.register_method("array", "slice", Arity::Exact(2), method_array_slice);
        b.register_method("tuple", "len", Arity::Exact(0), method_seq_len);
        b.register_method("string", "len", Arity::Exact(0), method_seq_len);
        b.register_method("string", "contains", Arity::Exact(1), method_str_contains);
        b.register_method("string", "split", Arity::Exact(1), method_str_split);
        b.register_method("string", "trim", Arity::Exact(0), method_str_trim);
        b.register_method("string", "starts_with", Arity::Exact(1), method_str_starts_with);
        b.register_method("string", "ends_with", Arity::Exact(1), method_str_ends_with);
        b.register_method("string", "to_upper", Arity::Exact(0), method_str_to_upper);
        b.register_method("string", "to_lower", Arity::Exact(0), method_str_to_lower);
        b.register_method("map", "len", Arity::Exact(0), method_seq_len);
        b.register_method("map", "keys", Arity::Exact(0), method_map_keys);
        b.register_method("map", "values", Arity::Exact(0), method_map_values);
        b.register_method("map", "insert", Arity::Exact(2), method_map_insert);
        b.register_method("map", "remove", Arity::Exact(1), method_map_remove);
        b.register_method("map", "contains", Arity::Exact(1), method_map_contains);
        b.register_method("set", "len", Arity::Exact(0), method_seq_len);
        b.register_method("set", "add", Arity::Exact(1), method_set_add);
        b.register_method("set", "remove", Arity::Exact(1), method_set_remove);
        b.register_method("set", "contains", Arity::Exact(1), method_set_contains);
        b.register_method("range", "len", Arity::Exact(0), method_seq_len);
        b.register_method("range", "contains", Arity::Exact(1), method_range_contains);
        b.register_method("buffer", "len", Arity::Exact(0), method_seq_len);
        b.register_method("enum", "variant", Arity::Exact(0), method_enum_variant);
        b
    }

    pub fn register(&mut self, name: &'static str, arity: Arity, func: BuiltinFn) {
        let idx = self.entries.len();
        self.entries.push(Builtin { name, arity, func });
        self.by_name.insert(name, idx);
    }

    pub fn register_method(
        &mut self,
        shape: &'static str,
        name: &'static str,
        arity: Arity,
        func: MethodFn,
    ) {
        let idx = self.methods.len() as u16;
        self.methods.push(Method {
            shape,
            name,
            arity,
            func,
        });
        self.method_index.insert((shape, name), idx);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|b| b.name).collect()
    }

    pub fn call(&self, vm: &mut Vm, name: &str, args: Vec<LatValue>) -> Result<LatValue, LatError> {
        let idx = self
            .by_name
            .get(name)
            .copied()
            .ok_or_else(|| LatError::undefined(name))?;
        let builtin = &self.entries[idx];
        builtin.arity.check(args.len(), builtin.name)?;
        (builtin.func)(vm, args)
    }

    /// Resolve a method for an inline cache: `(shape, name)` -> index.
    pub fn method_id(&self, shape: &str, name: &str) -> Option<u16> {
        self.method_index
            .iter()
            .find(|((s, n), _)| *s == shape && *n == name)
            .map(|(_, idx)| *idx)
    }

    pub fn call_method(
        &self,
        vm: &mut Vm,
        id: u16,
        recv: &LatValue,
        args: Vec<LatValue>,
    ) -> Result<LatValue, LatError> {
        let method = self
            .methods
            .get(id as usize)
            .ok_or_else(|| LatError::internal(format!("bad method id {}", id)))?;
        method.arity.check(args.len(), method.name)?;
        (method.func)(vm, recv, args)
    }
}

impl Default for Builtins {
    fn default() -> Self {
        Self::standard()
    }
}

fn expect_int(v: &LatValue, what: &str) -> Result<i64, LatError> {
    match v.kind {
        ValueKind::Int(n) => Ok(n),
        _ => Err(LatError::type_error(format!(
            "{} expects an int, got {}",
            what,
            v.type_name()
        ))),
    }
}

fn expect_str(v: &LatValue, what: &str) -> Result<String, LatError> {
    match &v.kind {
        ValueKind::Str(s) => Ok(s.as_str().to_string()),
        _ => Err(LatError::type_error(format!(
            "{} expects a string, got {}",
            what,
            v.type_name()
        ))),
    }
}

fn expect_channel(
    v: &LatValue,
    what: &str,
) -> Result<std::sync::Arc<lattice_core::value::ChannelData>, LatError> {
    match &v.kind {
        ValueKind::Channel(c) => Ok(c.clone()),
        _ => Err(LatError::type_error(format!(
            "{} expects a channel, got {}",
            what,
            v.type_name()
        ))),
    }
}

/// Reject in-place mutation of crystal receivers.
fn check_mutable(recv: &LatValue, what: &str) -> Result<(), LatError> {
    if recv.phase == Phase::Crystal {
        return Err(LatError::crystal_mutation(what));
    }
    Ok(())
}

// --- builtins ---

fn builtin_print(vm: &mut Vm, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    let text = args
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    vm.write_out(&text);
    Ok(LatValue::unit())
}

fn builtin_println(vm: &mut Vm, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    builtin_print(vm, args)?;
    vm.write_out("\n");
    Ok(LatValue::unit())
}

fn builtin_len(_vm: &mut Vm, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    value_len(&args[0]).map(LatValue::int)
}

fn value_len(v: &LatValue) -> Result<i64, LatError> {
    match &v.kind {
        ValueKind::Str(s) => Ok(s.len() as i64),
        ValueKind::Buffer(b) => Ok(b.len() as i64),
        ValueKind::Array(a) => Ok(a.borrow().len() as i64),
        ValueKind::Tuple(t) => Ok(t.len() as i64),
        ValueKind::Map(m) => Ok(m.borrow().entries.len() as i64),
        ValueKind::Set(s) => Ok(s.borrow().len() as i64),
        ValueKind::Range(a, b) => Ok((b - a).max(0)),
        _ => Err(LatError::type_error(format!(
            "len is not defined for {}",
            v.type_name()
        ))),
    }
}

fn builtin_str(_vm: &mut Vm, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    Ok(LatValue::string(args[0].to_string()))
}

fn builtin_type_of(_vm: &mut Vm, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    Ok(LatValue::string(args[0].type_name()))
}

/// Dispatch shape: the struct or enum name for nominal values, the type
/// name otherwise. Structural pattern tests compile against this.
fn builtin_shape_of(_vm: &mut Vm, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    Ok(LatValue::string(args[0].shape_name().to_string()))
}

fn builtin_phase_of(_vm: &mut Vm, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    Ok(LatValue::string(args[0].phase.to_string()))
}

fn builtin_clone(vm: &mut Vm, mut args: Vec<LatValue>) -> Result<LatValue, LatError> {
    let v = args.remove(0);
    phase_ops::deep_clone(&mut vm.heaps, &v)
}

/// `anneal(target, fn)`: deep-check crystal phase, thaw into a
/// temporary, apply the closure, refreeze. The caller writes the result
/// back to the original storage. Closure failures are wrapped with an
/// `anneal failed:` prefix.
fn builtin_anneal(vm: &mut Vm, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    if !phase_ops::deep_is_crystal(&args[0]) {
        return Err(LatError::phase(format!(
            "anneal expects a crystal value, got {} {}",
            args[0].phase,
            args[0].type_name()
        )));
    }
    let thawed = phase_ops::value_thaw(&mut vm.heaps, &args[0])?;
    let result = vm
        .call_value_with(&args[1], vec![thawed.clone()])
        .map_err(|e| e.wrap("anneal failed: "))?;
    // A closure that returns unit/nil mutated the temporary in place;
    // otherwise its return value is the new content.
    let updated = match result.kind {
        ValueKind::Unit | ValueKind::Nil => thawed,
        _ => result,
    };
    phase_ops::value_freeze(&mut vm.heaps, &updated)
}

fn builtin_abs(_vm: &mut Vm, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    match args[0].kind {
        ValueKind::Int(n) => Ok(LatValue::int(n.abs())),
        ValueKind::Float(x) => Ok(LatValue::float(x.abs())),
        _ => Err(LatError::type_error("abs expects a number")),
    }
}

fn numeric(v: &LatValue) -> Result<f64, LatError> {
    match v.kind {
        ValueKind::Int(n) => Ok(n as f64),
        ValueKind::Float(x) => Ok(x),
        _ => Err(LatError::type_error("expected a number")),
    }
}

fn builtin_min(_vm: &mut Vm, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    let (a, b) = (numeric(&args[0])?, numeric(&args[1])?);
    Ok(if a <= b { args[0].clone() } else { args[1].clone() })
}

fn builtin_max(_vm: &mut Vm, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    let (a, b) = (numeric(&args[0])?, numeric(&args[1])?);
    Ok(if a >= b { args[0].clone() } else { args[1].clone() })
}

fn builtin_assert(_vm: &mut Vm, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    if args[0].is_truthy() {
        return Ok(LatValue::unit());
    }
    let msg = args
        .get(1)
        .map(|v| v.to_string())
        .unwrap_or_else(|| "assertion failed".to_string());
    Err(LatError::thrown(LatValue::string(msg)))
}

fn builtin_channel(_vm: &mut Vm, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    let capacity = match args.first() {
        Some(v) => expect_int(v, "channel")?.max(0) as usize,
        None => 0,
    };
    Ok(channel::make_channel(capacity))
}

fn builtin_send(_vm: &mut Vm, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    let chan = expect_channel(&args[0], "send")?;
    channel::send_value(&chan, &args[1])?;
    Ok(LatValue::unit())
}

fn builtin_recv(_vm: &mut Vm, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    let chan = expect_channel(&args[0], "recv")?;
    channel::recv_value(&chan)
}

fn builtin_send_safe(_vm: &mut Vm, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    let chan = expect_channel(&args[0], "send_safe")?;
    Ok(LatValue::boolean(
        channel::send_value(&chan, &args[1]).is_ok(),
    ))
}

fn builtin_recv_safe(_vm: &mut Vm, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    let chan = expect_channel(&args[0], "recv_safe")?;
    match channel::recv_value(&chan) {
        Ok(v) => Ok(v),
        Err(_) => Ok(LatValue::nil()),
    }
}

fn builtin_close(_vm: &mut Vm, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    let chan = expect_channel(&args[0], "close")?;
    channel::close_channel(&chan);
    Ok(LatValue::unit())
}

fn builtin_ref(vm: &mut Vm, mut args: Vec<LatValue>) -> Result<LatValue, LatError> {
    let cell = LatValue::reference(args.remove(0));
    vm.heaps.fluid.track_value(&cell);
    Ok(cell)
}

fn builtin_deref(_vm: &mut Vm, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    match &args[0].kind {
        ValueKind::Ref(cell) => Ok(cell.borrow().clone()),
        _ => Err(LatError::type_error("deref expects a ref")),
    }
}

fn builtin_set_ref(_vm: &mut Vm, mut args: Vec<LatValue>) -> Result<LatValue, LatError> {
    let value = args.remove(1);
    let target = args.remove(0);
    check_mutable(&target, "ref")?;
    match &target.kind {
        ValueKind::Ref(cell) => {
            *cell.borrow_mut() = value.clone();
            Ok(value)
        }
        _ => Err(LatError::type_error("set_ref expects a ref")),
    }
}

fn builtin_heap_stats(vm: &mut Vm, _args: Vec<LatValue>) -> Result<LatValue, LatError> {
    let mut entries = lattice_core::map::LatMap::new();
    entries.insert("live", LatValue::int(vm.heaps.fluid.live_count() as i64));
    entries.insert("bytes", LatValue::int(vm.heaps.fluid.total_bytes() as i64));
    Ok(LatValue::map(lattice_core::value::MapData {
        entries,
        key_phases: None,
    }))
}

fn builtin_region_stats(vm: &mut Vm, _args: Vec<LatValue>) -> Result<LatValue, LatError> {
    let mut entries = lattice_core::map::LatMap::new();
    entries.insert(
        "regions",
        LatValue::int(vm.heaps.regions.region_count() as i64),
    );
    entries.insert("epoch", LatValue::int(vm.heaps.regions.epoch() as i64));
    entries.insert(
        "total_allocs",
        LatValue::int(vm.heaps.regions.total_allocs() as i64),
    );
    Ok(LatValue::map(lattice_core::value::MapData {
        entries,
        key_phases: None,
    }))
}

fn builtin_gc(vm: &mut Vm, _args: Vec<LatValue>) -> Result<LatValue, LatError> {
    let freed = vm.collect_garbage();
    Ok(LatValue::int(freed as i64))
}

// --- methods ---

fn method_seq_len(_vm: &mut Vm, recv: &LatValue, _args: Vec<LatValue>) -> Result<LatValue, LatError> {
    value_len(recv).map(LatValue::int)
}

fn method_array_push(_vm: &mut Vm, recv: &LatValue, mut args: Vec<LatValue>) -> Result<LatValue, LatError> {
    check_mutable(recv, "array")?;
    match &recv.kind {
        ValueKind::Array(a) => {
            a.borrow_mut().push(args.remove(0));
            Ok(LatValue::unit())
        }
        _ => Err(LatError::type_error("push expects an array")),
    }
}

fn method_array_pop(_vm: &mut Vm, recv: &LatValue, _args: Vec<LatValue>) -> Result<LatValue, LatError> {
    check_mutable(recv, "array")?;
    match &recv.kind {
        ValueKind::Array(a) => Ok(a.borrow_mut().pop().unwrap_or_else(LatValue::nil)),
        _ => Err(LatError::type_error("pop expects an array")),
    }
}

fn method_array_contains(_vm: &mut Vm, recv: &LatValue, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    match &recv.kind {
        ValueKind::Array(a) => Ok(LatValue::boolean(
            a.borrow().iter().any(|v| lattice_core::value::lat_eq(v, &args[0])),
        )),
        _ => Err(LatError::type_error("contains expects an array")),
    }
}

fn method_array_slice(vm: &mut Vm, recv: &LatValue, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    let start = expect_int(&args[0], "slice")?;
    let end = expect_int(&args[1], "slice")?;
    match &recv.kind {
        ValueKind::Array(a) => {
            let src = a.borrow();
            let len = src.len() as i64;
            let (s, e) = (start.clamp(0, len) as usize, end.clamp(0, len) as usize);
            let out = LatValue::array(src.get(s..e.max(s)).unwrap_or(&[]).to_vec());
            vm.heaps.fluid.track_value(&out);
            Ok(out)
        }
        _ => Err(LatError::type_error("slice expects an array")),
    }
}

fn method_str_contains(_vm: &mut Vm, recv: &LatValue, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    let needle = expect_str(&args[0], "contains")?;
    let hay = expect_str(recv, "contains")?;
    Ok(LatValue::boolean(hay.contains(&needle)))
}

fn method_str_split(vm: &mut Vm, recv: &LatValue, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    let sep = expect_str(&args[0], "split")?;
    let s = expect_str(recv, "split")?;
    let parts: Vec<LatValue> = if sep.is_empty() {
        s.chars().map(|c| LatValue::string(c.to_string())).collect()
    } else {
        s.split(&sep).map(LatValue::string).collect()
    };
    let out = LatValue::array(parts);
    vm.heaps.fluid.track_value(&out);
    Ok(out)
}

fn method_str_trim(_vm: &mut Vm, recv: &LatValue, _args: Vec<LatValue>) -> Result<LatValue, LatError> {
    Ok(LatValue::string(expect_str(recv, "trim")?.trim().to_string()))
}

fn method_str_starts_with(_vm: &mut Vm, recv: &LatValue, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    let prefix = expect_str(&args[0], "starts_with")?;
    Ok(LatValue::boolean(
        expect_str(recv, "starts_with")?.starts_with(&prefix),
    ))
}

fn method_str_ends_with(_vm: &mut Vm, recv: &LatValue, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    let suffix = expect_str(&args[0], "ends_with")?;
    Ok(LatValue::boolean(
        expect_str(recv, "ends_with")?.ends_with(&suffix),
    ))
}

fn method_str_to_upper(_vm: &mut Vm, recv: &LatValue, _args: Vec<LatValue>) -> Result<LatValue, LatError> {
    Ok(LatValue::string(expect_str(recv, "to_upper")?.to_uppercase()))
}

fn method_str_to_lower(_vm: &mut Vm, recv: &LatValue, _args: Vec<LatValue>) -> Result<LatValue, LatError> {
    Ok(LatValue::string(expect_str(recv, "to_lower")?.to_lowercase()))
}

fn method_map_keys(vm: &mut Vm, recv: &LatValue, _args: Vec<LatValue>) -> Result<LatValue, LatError> {
    match &recv.kind {
        ValueKind::Map(m) => {
            let keys: Vec<LatValue> = m.borrow().entries.keys().map(LatValue::string).collect();
            let out = LatValue::array(keys);
            vm.heaps.fluid.track_value(&out);
            Ok(out)
        }
        _ => Err(LatError::type_error("keys expects a map")),
    }
}

fn method_map_values(vm: &mut Vm, recv: &LatValue, _args: Vec<LatValue>) -> Result<LatValue, LatError> {
    match &recv.kind {
        ValueKind::Map(m) => {
            let values: Vec<LatValue> = m.borrow().entries.values().cloned().collect();
            let out = LatValue::array(values);
            vm.heaps.fluid.track_value(&out);
            Ok(out)
        }
        _ => Err(LatError::type_error("values expects a map")),
    }
}

fn method_map_insert(_vm: &mut Vm, recv: &LatValue, mut args: Vec<LatValue>) -> Result<LatValue, LatError> {
    check_mutable(recv, "map")?;
    let key = expect_str(&args[0], "insert")?;
    let value = args.remove(1);
    match &recv.kind {
        ValueKind::Map(m) => {
            if m.borrow().key_phase(&key, recv.phase) == Phase::Crystal {
                return Err(LatError::crystal_mutation(&format!("map key '{}'", key)));
            }
            m.borrow_mut().entries.insert(&key, value);
            Ok(LatValue::unit())
        }
        _ => Err(LatError::type_error("insert expects a map")),
    }
}

fn method_map_remove(_vm: &mut Vm, recv: &LatValue, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    check_mutable(recv, "map")?;
    let key = expect_str(&args[0], "remove")?;
    match &recv.kind {
        ValueKind::Map(m) => {
            if m.borrow().key_phase(&key, recv.phase) == Phase::Crystal {
                return Err(LatError::crystal_mutation(&format!("map key '{}'", key)));
            }
            Ok(m.borrow_mut()
                .entries
                .remove(&key)
                .unwrap_or_else(LatValue::nil))
        }
        _ => Err(LatError::type_error("remove expects a map")),
    }
}

fn method_map_contains(_vm: &mut Vm, recv: &LatValue, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    let key = expect_str(&args[0], "contains")?;
    match &recv.kind {
        ValueKind::Map(m) => Ok(LatValue::boolean(m.borrow().entries.contains_key(&key))),
        _ => Err(LatError::type_error("contains expects a map")),
    }
}

fn method_set_add(_vm: &mut Vm, recv: &LatValue, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    check_mutable(recv, "set")?;
    let key = expect_str(&args[0], "add")?;
    match &recv.kind {
        ValueKind::Set(s) => {
            s.borrow_mut().insert(&key, ());
            Ok(LatValue::unit())
        }
        _ => Err(LatError::type_error("add expects a set")),
    }
}

fn method_set_remove(_vm: &mut Vm, recv: &LatValue, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    check_mutable(recv, "set")?;
    let key = expect_str(&args[0], "remove")?;
    match &recv.kind {
        ValueKind::Set(s) => Ok(LatValue::boolean(s.borrow_mut().remove(&key).is_some())),
        _ => Err(LatError::type_error("remove expects a set")),
    }
}

fn method_set_contains(_vm: &mut Vm, recv: &LatValue, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    let key = expect_str(&args[0], "contains")?;
    match &recv.kind {
        ValueKind::Set(s) => Ok(LatValue::boolean(s.borrow().contains_key(&key))),
        _ => Err(LatError::type_error("contains expects a set")),
    }
}

fn method_range_contains(_vm: &mut Vm, recv: &LatValue, args: Vec<LatValue>) -> Result<LatValue, LatError> {
    let n = expect_int(&args[0], "contains")?;
    match recv.kind {
        ValueKind::Range(a, b) => Ok(LatValue::boolean(n >= a && n < b)),
        _ => Err(LatError::type_error("contains expects a range")),
    }
}

fn method_enum_variant(_vm: &mut Vm, recv: &LatValue, _args: Vec<LatValue>) -> Result<LatValue, LatError> {
    match &recv.kind {
        ValueKind::Enum(e) => Ok(LatValue::string(e.variant.to_string())),
        _ => Err(LatError::type_error("variant expects an enum")),
    }
}

/// Non-crystal buffer bytes of `data`; used by `SET_INDEX` on buffers.
pub fn buffer_heap_bytes(data: &BufferData) -> Option<&std::rc::Rc<std::cell::RefCell<Vec<u8>>>> {
    match data {
        BufferData::Heap(rc) => Some(rc),
        BufferData::Arena(_) => None,
    }
}
