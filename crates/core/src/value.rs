//! LatValue - the tagged value model
//!
//! A value is a `(phase, region, kind)` triple. The kind is a closed sum:
//! every operation matches exhaustively, so adding a variant surfaces each
//! site that must learn about it.
//!
//! Composite payloads are shared handles (`Rc<RefCell<..>>`) so aliases of
//! a fluid value observe in-place mutation, exactly like the heap-pointer
//! semantics of the source language. Crystal values reuse the same handles
//! but are never mutated: every mutating opcode checks the phase tag
//! before borrowing.

use crate::arena::ArenaBytes;
use crate::chunk::FnProto;
use crate::env::EnvRef;
use crate::latstr::LatStr;
use crate::map::LatMap;
use crate::phase::{Phase, RegionId, NO_REGION};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::{Arc, Condvar, Mutex};

pub type ArrayRef = Rc<RefCell<Vec<LatValue>>>;
pub type MapRef = Rc<RefCell<MapData>>;
pub type SetRef = Rc<RefCell<LatMap<()>>>;
pub type StructRef = Rc<RefCell<StructData>>;
pub type ValueCellRef = Rc<RefCell<LatValue>>;
pub type UpvalueRef = Rc<RefCell<Upvalue>>;

/// Map payload: entries plus the optional per-key phase table built by
/// partial freezes (`freeze m.key`, `freeze m except ...`).
#[derive(Debug, Clone, PartialEq)]
pub struct MapData {
    pub entries: LatMap<LatValue>,
    pub key_phases: Option<LatMap<Phase>>,
}

impl MapData {
    pub fn new() -> Self {
        MapData {
            entries: LatMap::new(),
            key_phases: None,
        }
    }

    /// Effective phase of one key: the per-key table wins over `fallback`
    /// (the phase tag of the map value itself).
    pub fn key_phase(&self, key: &str, fallback: Phase) -> Phase {
        self.key_phases
            .as_ref()
            .and_then(|t| t.get(key).copied())
            .unwrap_or(fallback)
    }
}

impl Default for MapData {
    fn default() -> Self {
        Self::new()
    }
}

/// Struct payload: declared name, field names in declaration order, field
/// values, and the optional per-field phase table from partial freezes.
#[derive(Debug, Clone, PartialEq)]
pub struct StructData {
    pub name: Arc<str>,
    pub field_names: Vec<Arc<str>>,
    pub fields: Vec<LatValue>,
    pub field_phases: Option<Vec<Phase>>,
}

impl StructData {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.field_names.iter().position(|f| &**f == name)
    }

    pub fn field_phase(&self, index: usize, fallback: Phase) -> Phase {
        self.field_phases
            .as_ref()
            .and_then(|t| t.get(index).copied())
            .unwrap_or(fallback)
    }
}

/// Enum payload: `Color::Rgb(1, 2, 3)` carries enum name, variant name,
/// and the payload values.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumData {
    pub enum_name: Arc<str>,
    pub variant: Arc<str>,
    pub payload: Vec<LatValue>,
}

/// Buffer payload: heap bytes (mutable, shared) or an arena slice
/// (crystal, immutable).
#[derive(Debug, Clone)]
pub enum BufferData {
    Heap(Rc<RefCell<Vec<u8>>>),
    Arena(ArenaBytes),
}

impl BufferData {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        BufferData::Heap(Rc::new(RefCell::new(bytes)))
    }

    pub fn len(&self) -> usize {
        match self {
            BufferData::Heap(b) => b.borrow().len(),
            BufferData::Arena(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<u8> {
        match self {
            BufferData::Heap(b) => b.borrow().get(index).copied(),
            BufferData::Arena(b) => b.as_slice().get(index).copied(),
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        match self {
            BufferData::Heap(b) => b.borrow().clone(),
            BufferData::Arena(b) => b.as_slice().to_vec(),
        }
    }
}

impl PartialEq for BufferData {
    fn eq(&self, other: &Self) -> bool {
        self.to_vec() == other.to_vec()
    }
}

/// A closure's captured variable.
///
/// Open upvalues alias a live stack slot; when that slot leaves scope the
/// VM migrates the value into the cell (`Closed`) so every closure sharing
/// the cell keeps seeing it.
#[derive(Debug, Clone, PartialEq)]
pub enum Upvalue {
    Open(usize),
    Closed(LatValue),
}

/// What a closure captured: either a whole environment chain (host and
/// env-captured closures) or a bytecode upvalue array. A tagged variant
/// rather than one pointer doing double duty.
#[derive(Debug, Clone)]
pub enum Captures {
    Env(EnvRef),
    Upvalues(Vec<UpvalueRef>),
}

impl Captures {
    pub fn upvalue_count(&self) -> usize {
        match self {
            Captures::Env(_) => 0,
            Captures::Upvalues(ups) => ups.len(),
        }
    }
}

/// Closure: compiled prototype plus captured state.
#[derive(Debug, Clone)]
pub struct ClosureData {
    pub proto: Arc<FnProto>,
    pub captures: Captures,
}

/// Channel internals: one mutex around the queue, one condvar for blocked
/// senders, another for blocked receivers. Capacity 0 means unbounded.
#[derive(Debug)]
pub struct ChannelData {
    pub id: u64,
    pub capacity: usize,
    inner: Mutex<ChanInner>,
    not_full: Condvar,
    not_empty: Condvar,
}

#[derive(Debug)]
struct ChanInner {
    queue: VecDeque<LatValue>,
    closed: bool,
}

/// Outcome of a channel operation on a closed channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClosed;

impl ChannelData {
    pub fn new(id: u64, capacity: usize) -> Self {
        ChannelData {
            id,
            capacity,
            inner: Mutex::new(ChanInner {
                queue: VecDeque::new(),
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Block until the value is queued (or the channel closes).
    pub fn send(&self, value: LatValue) -> Result<(), ChannelClosed> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if inner.closed {
                return Err(ChannelClosed);
            }
            if self.capacity == 0 || inner.queue.len() < self.capacity {
                inner.queue.push_back(value);
                self.not_empty.notify_one();
                return Ok(());
            }
            inner = self
                .not_full
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Block until a value arrives. Returns `Err` once the channel is
    /// closed and drained.
    pub fn recv(&self) -> Result<LatValue, ChannelClosed> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(value) = inner.queue.pop_front() {
                self.not_full.notify_one();
                return Ok(value);
            }
            if inner.closed {
                return Err(ChannelClosed);
            }
            inner = self
                .not_empty
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Non-blocking receive: `Ok(None)` when the queue is empty but open.
    pub fn try_recv(&self) -> Result<Option<LatValue>, ChannelClosed> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(value) = inner.queue.pop_front() {
            self.not_full.notify_one();
            return Ok(Some(value));
        }
        if inner.closed {
            return Err(ChannelClosed);
        }
        Ok(None)
    }

    /// Close the channel and wake everything blocked on it.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.closed = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .closed
    }

    pub fn queue_len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .queue
            .len()
    }
}

// Channel equality is identity.
impl PartialEq for ChannelData {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

/// The closed sum of value kinds.
#[derive(Debug, Clone)]
pub enum ValueKind {
    Int(i64),
    Float(f64),
    Bool(bool),
    Unit,
    Nil,
    Str(LatStr),
    Buffer(BufferData),
    Array(ArrayRef),
    /// Always crystal by construction
    Tuple(Arc<[LatValue]>),
    Map(MapRef),
    Set(SetRef),
    Struct(StructRef),
    Enum(Rc<EnumData>),
    Range(i64, i64),
    Channel(Arc<ChannelData>),
    Ref(ValueCellRef),
    Closure(Rc<ClosureData>),
    /// Compiled function prototype; lives in constant pools and is wrapped
    /// by `CLOSURE` at runtime
    Function(Arc<FnProto>),
}

/// A Lattice runtime value: phase tag, owning region, payload.
#[derive(Debug, Clone)]
pub struct LatValue {
    pub phase: Phase,
    pub region: RegionId,
    pub kind: ValueKind,
}

// Safety: LatValue can be sent between threads under the transfer
// discipline the runtime enforces:
//
// Send:
// - Int/Float/Bool/Unit/Nil/Range are plain data.
// - Str is heap-owned or an Arc-backed arena slice.
// - Crystal composites are immutable; their Rc handles are never cloned
//   concurrently because every cross-thread transfer (channel send, scope
//   spawn capture) goes through deep_clone_for_transfer, which replaces
//   every Rc with a freshly-allocated unshared one before the value moves.
// - Channel is Arc over a Mutex/Condvar structure, genuinely Sync.
//
// Sync:
// - Shared references only ever cross threads for crystal values, which
//   are never mutated (every mutating opcode checks the phase tag before
//   borrowing a RefCell), so no RefCell is ever borrowed mutably from two
//   threads.
//
// These invariants are owned by the runtime crate (channel send and scope
// spawn are the only transfer points).
unsafe impl Send for LatValue {}
unsafe impl Sync for LatValue {}

impl LatValue {
    pub fn new(kind: ValueKind) -> Self {
        LatValue {
            phase: Phase::Unphased,
            region: NO_REGION,
            kind,
        }
    }

    pub fn int(n: i64) -> Self {
        Self::new(ValueKind::Int(n))
    }

    pub fn float(f: f64) -> Self {
        Self::new(ValueKind::Float(f))
    }

    pub fn boolean(b: bool) -> Self {
        Self::new(ValueKind::Bool(b))
    }

    pub fn unit() -> Self {
        Self::new(ValueKind::Unit)
    }

    pub fn nil() -> Self {
        Self::new(ValueKind::Nil)
    }

    pub fn string(s: impl Into<LatStr>) -> Self {
        Self::new(ValueKind::Str(s.into()))
    }

    pub fn range(start: i64, end: i64) -> Self {
        Self::new(ValueKind::Range(start, end))
    }

    /// Fresh fluid array. The caller (the VM) registers it with the fluid
    /// heap for accounting and sweep.
    pub fn array(elems: Vec<LatValue>) -> Self {
        let mut v = Self::new(ValueKind::Array(Rc::new(RefCell::new(elems))));
        v.phase = Phase::Fluid;
        v
    }

    pub fn buffer(bytes: Vec<u8>) -> Self {
        let mut v = Self::new(ValueKind::Buffer(BufferData::from_bytes(bytes)));
        v.phase = Phase::Fluid;
        v
    }

    /// Tuples are crystal by construction; the VM deep-freezes the
    /// elements before calling this.
    pub fn tuple(elems: Vec<LatValue>) -> Self {
        let mut v = Self::new(ValueKind::Tuple(elems.into()));
        v.phase = Phase::Crystal;
        v
    }

    pub fn map(data: MapData) -> Self {
        let mut v = Self::new(ValueKind::Map(Rc::new(RefCell::new(data))));
        v.phase = Phase::Fluid;
        v
    }

    pub fn set(keys: LatMap<()>) -> Self {
        let mut v = Self::new(ValueKind::Set(Rc::new(RefCell::new(keys))));
        v.phase = Phase::Fluid;
        v
    }

    pub fn struct_value(data: StructData) -> Self {
        let mut v = Self::new(ValueKind::Struct(Rc::new(RefCell::new(data))));
        v.phase = Phase::Fluid;
        v
    }

    pub fn enum_value(data: EnumData) -> Self {
        let mut v = Self::new(ValueKind::Enum(Rc::new(data)));
        v.phase = Phase::Fluid;
        v
    }

    pub fn reference(inner: LatValue) -> Self {
        let mut v = Self::new(ValueKind::Ref(Rc::new(RefCell::new(inner))));
        v.phase = Phase::Fluid;
        v
    }

    pub fn channel(data: Arc<ChannelData>) -> Self {
        Self::new(ValueKind::Channel(data))
    }

    pub fn closure(data: ClosureData) -> Self {
        Self::new(ValueKind::Closure(Rc::new(data)))
    }

    pub fn function(proto: Arc<FnProto>) -> Self {
        Self::new(ValueKind::Function(proto))
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_region(mut self, region: RegionId) -> Self {
        self.region = region;
        self
    }

    pub fn is_nil(&self) -> bool {
        matches!(self.kind, ValueKind::Nil)
    }

    /// `false` and `nil` are falsy; everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self.kind, ValueKind::Bool(false) | ValueKind::Nil)
    }

    /// Whether the payload is a composite that participates in heap /
    /// region tracking.
    pub fn is_composite(&self) -> bool {
        matches!(
            self.kind,
            ValueKind::Str(_)
                | ValueKind::Buffer(_)
                | ValueKind::Array(_)
                | ValueKind::Tuple(_)
                | ValueKind::Map(_)
                | ValueKind::Set(_)
                | ValueKind::Struct(_)
                | ValueKind::Enum(_)
                | ValueKind::Ref(_)
                | ValueKind::Closure(_)
        )
    }

    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            ValueKind::Int(_) => "int",
            ValueKind::Float(_) => "float",
            ValueKind::Bool(_) => "bool",
            ValueKind::Unit => "unit",
            ValueKind::Nil => "nil",
            ValueKind::Str(_) => "string",
            ValueKind::Buffer(_) => "buffer",
            ValueKind::Array(_) => "array",
            ValueKind::Tuple(_) => "tuple",
            ValueKind::Map(_) => "map",
            ValueKind::Set(_) => "set",
            ValueKind::Struct(_) => "struct",
            ValueKind::Enum(_) => "enum",
            ValueKind::Range(_, _) => "range",
            ValueKind::Channel(_) => "channel",
            ValueKind::Ref(_) => "ref",
            ValueKind::Closure(_) => "closure",
            ValueKind::Function(_) => "function",
        }
    }

    /// Dispatch shape for inline caches: the declared name for structs
    /// and enums, the type name otherwise.
    pub fn shape_name(&self) -> Arc<str> {
        match &self.kind {
            ValueKind::Struct(s) => s.borrow().name.clone(),
            ValueKind::Enum(e) => e.enum_name.clone(),
            _ => Arc::from(self.type_name()),
        }
    }

    /// Shallow payload size estimate in bytes, used by heap and region
    /// accounting.
    pub fn heap_size(&self) -> usize {
        const BASE: usize = std::mem::size_of::<LatValue>();
        BASE + match &self.kind {
            ValueKind::Str(s) => s.len(),
            ValueKind::Buffer(b) => b.len(),
            ValueKind::Array(a) => a.borrow().len() * std::mem::size_of::<LatValue>(),
            ValueKind::Tuple(t) => t.len() * std::mem::size_of::<LatValue>(),
            ValueKind::Map(m) => {
                let m = m.borrow();
                m.entries
                    .iter()
                    .map(|(k, _)| k.len() + std::mem::size_of::<LatValue>())
                    .sum()
            }
            ValueKind::Set(s) => s.borrow().iter().map(|(k, _)| k.len()).sum(),
            ValueKind::Struct(s) => {
                s.borrow().fields.len() * std::mem::size_of::<LatValue>()
            }
            ValueKind::Enum(e) => e.payload.len() * std::mem::size_of::<LatValue>(),
            _ => 0,
        }
    }
}

/// Structural equality with numeric coercion.
///
/// - `Int` and `Float` compare numerically across kinds.
/// - Channels compare by identity.
/// - Closures and functions never compare equal to anything but the same
///   object (closures: never equal at all).
/// - Everything else is deep structural equality; phase and region tags
///   are ignored, so a thawed clone equals its crystal source.
pub fn lat_eq(a: &LatValue, b: &LatValue) -> bool {
    use ValueKind::*;
    match (&a.kind, &b.kind) {
        (Int(x), Int(y)) => x == y,
        (Float(x), Float(y)) => x == y,
        (Int(x), Float(y)) | (Float(y), Int(x)) => (*x as f64) == *y,
        (Bool(x), Bool(y)) => x == y,
        (Unit, Unit) => true,
        (Nil, Nil) => true,
        (Str(x), Str(y)) => x == y,
        (Buffer(x), Buffer(y)) => x == y,
        (Array(x), Array(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| lat_eq(a, b))
        }
        (Tuple(x), Tuple(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| lat_eq(a, b))
        }
        (Map(x), Map(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.entries.len() == y.entries.len()
                && x.entries
                    .iter()
                    .all(|(k, v)| y.entries.get(k).is_some_and(|w| lat_eq(v, w)))
        }
        (Set(x), Set(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len() && x.keys().all(|k| y.contains_key(k))
        }
        (Struct(x), Struct(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.name == y.name
                && x.field_names == y.field_names
                && x.fields.len() == y.fields.len()
                && x.fields.iter().zip(y.fields.iter()).all(|(a, b)| lat_eq(a, b))
        }
        (Enum(x), Enum(y)) => {
            x.enum_name == y.enum_name
                && x.variant == y.variant
                && x.payload.len() == y.payload.len()
                && x.payload.iter().zip(y.payload.iter()).all(|(a, b)| lat_eq(a, b))
        }
        (Range(s1, e1), Range(s2, e2)) => s1 == s2 && e1 == e2,
        (Channel(x), Channel(y)) => Arc::ptr_eq(x, y),
        (Ref(x), Ref(y)) => lat_eq(&x.borrow(), &y.borrow()),
        (Closure(_), Closure(_)) => false,
        (Function(x), Function(y)) => Arc::ptr_eq(x, y),
        _ => false,
    }
}

impl PartialEq for LatValue {
    fn eq(&self, other: &Self) -> bool {
        lat_eq(self, other)
    }
}

impl std::fmt::Display for LatValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ValueKind::Int(n) => write!(f, "{}", n),
            ValueKind::Float(x) => {
                if x.fract() == 0.0 && x.is_finite() {
                    write!(f, "{:.1}", x)
                } else {
                    write!(f, "{}", x)
                }
            }
            ValueKind::Bool(b) => write!(f, "{}", b),
            ValueKind::Unit => write!(f, "()"),
            ValueKind::Nil => write!(f, "nil"),
            ValueKind::Str(s) => write!(f, "{}", s),
            ValueKind::Buffer(b) => write!(f, "buffer[{}]", b.len()),
            ValueKind::Array(a) => {
                write!(f, "[")?;
                for (i, v) in a.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            ValueKind::Tuple(t) => {
                write!(f, "(")?;
                for (i, v) in t.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, ")")
            }
            ValueKind::Map(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.borrow().entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            ValueKind::Set(s) => {
                write!(f, "set{{")?;
                for (i, (k, _)) in s.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", k)?;
                }
                write!(f, "}}")
            }
            ValueKind::Struct(s) => {
                let s = s.borrow();
                write!(f, "{} {{", s.name)?;
                for (i, (name, value)) in s.field_names.iter().zip(s.fields.iter()).enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, " {}: {}", name, value)?;
                }
                write!(f, " }}")
            }
            ValueKind::Enum(e) => {
                write!(f, "{}::{}", e.enum_name, e.variant)?;
                if !e.payload.is_empty() {
                    write!(f, "(")?;
                    for (i, v) in e.payload.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}", v)?;
                    }
                    write!(f, ")")?;
                }
                Ok(())
            }
            ValueKind::Range(start, end) => write!(f, "{}..{}", start, end),
            ValueKind::Channel(c) => write!(f, "channel#{}", c.id),
            ValueKind::Ref(r) => write!(f, "ref({})", r.borrow()),
            ValueKind::Closure(c) => match &c.proto.name {
                Some(name) => write!(f, "<fn {}>", name),
                None => write!(f, "<fn>"),
            },
            ValueKind::Function(p) => match &p.name {
                Some(name) => write!(f, "<fn {}>", name),
                None => write!(f, "<fn>"),
            },
        }
    }
}
