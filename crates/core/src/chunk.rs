//! Bytecode chunks: code, constants, debug tables, inline caches
//!
//! A chunk is the unit of compilation and persistence. The on-disk format
//! is a 4-byte magic (`LATB` for stack-VM chunks; register-VM chunks use
//! `LATR` and are rejected) followed by a bincode-encoded body. Constants
//! serialize through a closed mirror enum so only persistable kinds are
//! ever written; inline caches are not persisted and start cold on load.

use crate::opcode::Opcode;
use crate::phase::Phase;
use crate::value::{LatValue, ValueKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Magic for stack-VM chunks.
pub const CHUNK_MAGIC: [u8; 4] = *b"LATB";
/// Magic of the (out of scope) register-VM chunk format; recognized only
/// to produce a useful error.
pub const REGISTER_CHUNK_MAGIC: [u8; 4] = *b"LATR";

/// Hard cap on constants per chunk (16-bit constant operands).
pub const MAX_CONSTANTS: usize = u16::MAX as usize;

/// Compiled function prototype. The chunk carries everything else
/// (defaults, variadic flag, parameter phases).
#[derive(Debug)]
pub struct FnProto {
    pub name: Option<String>,
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Arc<Chunk>,
}

/// Where a cached method dispatch lands.
#[derive(Debug, Clone)]
pub enum PicTarget {
    /// A user-defined method
    Proto(Arc<FnProto>),
    /// Index into the builtin method table
    Builtin(u16),
}

#[derive(Debug, Clone)]
struct PicEntry {
    shape: Arc<str>,
    target: PicTarget,
}

/// Per-call-site polymorphic inline cache, keyed by bytecode offset.
///
/// The VM never mutates entries directly; all access funnels through
/// [`PicTable::lookup`] and [`PicTable::insert`].
#[derive(Debug, Default)]
pub struct PicTable {
    entries: Mutex<HashMap<u32, Vec<PicEntry>>>,
}

/// Cached entries per call site before older shapes are evicted.
const PIC_WAYS: usize = 4;

impl PicTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache hit for `shape` at `offset`, if any.
    pub fn lookup(&self, offset: u32, shape: &str) -> Option<PicTarget> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&offset)?
            .iter()
            .find(|e| &*e.shape == shape)
            .map(|e| e.target.clone())
    }

    /// Record a resolution for `shape` at `offset`.
    pub fn insert(&self, offset: u32, shape: Arc<str>, target: PicTarget) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let site = entries.entry(offset).or_default();
        if site.len() >= PIC_WAYS {
            site.remove(0);
        }
        site.push(PicEntry { shape, target });
    }

    /// Number of call sites with at least one cached shape.
    pub fn site_count(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// A compiled bytecode chunk.
#[derive(Debug, Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub constants: Vec<LatValue>,
    /// Parallel to `code`: source line per code byte
    pub lines: Vec<u32>,
    /// Debug table: local slot -> name
    pub local_names: Vec<Option<String>>,
    pub name: Option<String>,
    /// Required phase per parameter (Unphased = unconstrained)
    pub param_phases: Vec<Phase>,
    pub export_names: Vec<String>,
    pub has_exports: bool,
    /// Trailing-parameter default values
    pub default_values: Vec<LatValue>,
    pub fn_has_variadic: bool,
    pub pic: PicTable,
}

impl Chunk {
    pub fn new() -> Self {
        Chunk::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Chunk {
            name: Some(name.into()),
            ..Chunk::default()
        }
    }

    pub fn write_op(&mut self, op: Opcode, line: u32) {
        self.code.push(op as u8);
        self.lines.push(line);
    }

    pub fn write_byte(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    pub fn write_u16(&mut self, value: u16, line: u32) {
        self.write_byte((value >> 8) as u8, line);
        self.write_byte((value & 0xff) as u8, line);
    }

    /// Overwrite a previously written 16-bit operand (jump patching).
    pub fn patch_u16(&mut self, offset: usize, value: u16) {
        self.code[offset] = (value >> 8) as u8;
        self.code[offset + 1] = (value & 0xff) as u8;
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        ((self.code[offset] as u16) << 8) | self.code[offset + 1] as u16
    }

    /// Add a constant; `None` once the 16-bit pool is full.
    pub fn add_constant(&mut self, value: LatValue) -> Option<u16> {
        if self.constants.len() >= MAX_CONSTANTS {
            return None;
        }
        self.constants.push(value);
        Some((self.constants.len() - 1) as u16)
    }

    /// Source line of the code byte at `offset`.
    pub fn line_at(&self, offset: usize) -> u32 {
        self.lines.get(offset).copied().unwrap_or(0)
    }

    pub fn default_count(&self) -> usize {
        self.default_values.len()
    }

    // --- Persistence ---

    pub fn to_bytes(&self) -> Result<Vec<u8>, ChunkIoError> {
        let repr = ChunkRepr::try_from(self)?;
        let body = bincode::serialize(&repr).map_err(|e| ChunkIoError::Encode(e.to_string()))?;
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&CHUNK_MAGIC);
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Chunk, ChunkIoError> {
        if bytes.len() < 4 {
            return Err(ChunkIoError::BadMagic);
        }
        let magic: [u8; 4] = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if magic == REGISTER_CHUNK_MAGIC {
            return Err(ChunkIoError::RegisterChunk);
        }
        if magic != CHUNK_MAGIC {
            return Err(ChunkIoError::BadMagic);
        }
        let repr: ChunkRepr =
            bincode::deserialize(&bytes[4..]).map_err(|e| ChunkIoError::Decode(e.to_string()))?;
        Ok(repr.into())
    }

    // --- Disassembly ---

    /// Human-readable listing of the whole chunk (and nested function
    /// constants).
    pub fn disassemble(&self, label: &str) -> String {
        let mut out = String::new();
        out.push_str(&format!("== {} ==\n", label));
        let mut offset = 0;
        while offset < self.code.len() {
            offset = self.disassemble_instruction(&mut out, offset);
        }
        for (idx, constant) in self.constants.iter().enumerate() {
            if let ValueKind::Function(proto) = &constant.kind {
                let sub = proto
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("fn#{}", idx));
                out.push('\n');
                out.push_str(&proto.chunk.disassemble(&sub));
            }
        }
        out
    }

    fn disassemble_instruction(&self, out: &mut String, offset: usize) -> usize {
        use std::fmt::Write as _;
        let _ = write!(out, "{:04} ", offset);
        if offset > 0 && self.line_at(offset) == self.line_at(offset - 1) {
            out.push_str("   | ");
        } else {
            let _ = write!(out, "{:4} ", self.line_at(offset));
        }
        let byte = self.code[offset];
        let op = match Opcode::try_from(byte) {
            Ok(op) => op,
            Err(b) => {
                let _ = writeln!(out, "UNKNOWN {:#04x}", b);
                return offset + 1;
            }
        };
        let _ = write!(out, "{:<22}", op.mnemonic());
        let next = match op {
            Opcode::Constant | Opcode::DefineGlobal | Opcode::GetGlobal | Opcode::SetGlobal => {
                let idx = self.code[offset + 1] as usize;
                let _ = write!(out, " {} ({})", idx, self.constant_str(idx));
                offset + 2
            }
            Opcode::Constant16
            | Opcode::DefineGlobal16
            | Opcode::GetGlobal16
            | Opcode::SetGlobal16
            | Opcode::Import => {
                let idx = self.read_u16(offset + 1) as usize;
                let _ = write!(out, " {} ({})", idx, self.constant_str(idx));
                offset + 3
            }
            Opcode::GetField | Opcode::SetField => {
                let idx = self.read_u16(offset + 1) as usize;
                let _ = write!(out, " '{}'", self.constant_str(idx));
                offset + 3
            }
            Opcode::Invoke | Opcode::InvokeGlobal => {
                let idx = self.read_u16(offset + 1) as usize;
                let argc = self.code[offset + 3];
                let _ = write!(out, " '{}' argc={}", self.constant_str(idx), argc);
                offset + 4
            }
            Opcode::InvokeLocal => {
                let slot = self.code[offset + 1];
                let idx = self.read_u16(offset + 2) as usize;
                let argc = self.code[offset + 4];
                let _ = write!(out, " slot={} '{}' argc={}", slot, self.constant_str(idx), argc);
                offset + 5
            }
            Opcode::GetFieldLocal => {
                let slot = self.code[offset + 1];
                let idx = self.read_u16(offset + 2) as usize;
                let _ = write!(out, " slot={} '{}'", slot, self.constant_str(idx));
                offset + 4
            }
            Opcode::Jump | Opcode::JumpIfFalse | Opcode::JumpIfTrue | Opcode::JumpIfNotNil => {
                let dist = self.read_u16(offset + 1) as usize;
                let _ = write!(out, " -> {}", offset + 3 + dist);
                offset + 3
            }
            Opcode::Loop => {
                let dist = self.read_u16(offset + 1) as usize;
                let _ = write!(out, " -> {}", offset + 3 - dist);
                offset + 3
            }
            Opcode::PushExceptionHandler => {
                let dist = self.read_u16(offset + 1) as usize;
                let _ = write!(out, " catch -> {}", offset + 3 + dist);
                offset + 3
            }
            Opcode::DeferPush => {
                let depth = self.code[offset + 1];
                let dist = self.read_u16(offset + 2) as usize;
                let _ = write!(out, " depth={} body={}..{}", depth, offset + 4, offset + 4 + dist);
                offset + 4
            }
            Opcode::Closure => {
                let idx = self.read_u16(offset + 1) as usize;
                let count = self.code[offset + 3] as usize;
                let _ = write!(out, " {} ({}) upvalues={}", idx, self.constant_str(idx), count);
                offset + 4 + count * 2
            }
            Opcode::BuildStruct => {
                let idx = self.read_u16(offset + 1) as usize;
                let fields = self.code[offset + 3] as usize;
                let _ = write!(out, " '{}' fields={}", self.constant_str(idx), fields);
                offset + 4 + fields * 2
            }
            Opcode::FreezeExcept => {
                let loc = self.code[offset + 1];
                let target = self.read_u16(offset + 2);
                let count = self.code[offset + 4] as usize;
                let _ = write!(out, " loc={} target={} except={}", loc, target, count);
                offset + 5 + count * 2
            }
            Opcode::Scope => {
                let spawns = self.code[offset + 1] as usize;
                let sync = self.read_u16(offset + 2);
                let _ = write!(out, " spawns={} sync={}", spawns, sync);
                offset + 4 + spawns * 2
            }
            Opcode::Select => {
                let arms = self.code[offset + 1] as usize;
                let _ = write!(out, " arms={}", arms);
                offset + 2 + arms * 6
            }
            _ => {
                let width = op.fixed_operands().unwrap_or(0);
                for i in 0..width {
                    let _ = write!(out, " {}", self.code[offset + 1 + i]);
                }
                offset + 1 + width
            }
        };
        out.push('\n');
        next
    }

    fn constant_str(&self, idx: usize) -> String {
        match self.constants.get(idx) {
            Some(c) => c.to_string(),
            None => "<bad const>".to_string(),
        }
    }
}

/// Errors from chunk persistence.
#[derive(Debug)]
pub enum ChunkIoError {
    /// Not a Lattice chunk at all
    BadMagic,
    /// A register-VM chunk; this runtime executes stack chunks only
    RegisterChunk,
    /// A constant kind that cannot be persisted (channels, closures)
    Unpersistable(&'static str),
    Encode(String),
    Decode(String),
}

impl std::fmt::Display for ChunkIoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkIoError::BadMagic => write!(f, "not a Lattice bytecode chunk (bad magic)"),
            ChunkIoError::RegisterChunk => {
                write!(f, "register-VM chunk; this runtime executes stack-VM chunks")
            }
            ChunkIoError::Unpersistable(kind) => {
                write!(f, "constant of type '{}' cannot be persisted", kind)
            }
            ChunkIoError::Encode(msg) => write!(f, "chunk encode error: {}", msg),
            ChunkIoError::Decode(msg) => write!(f, "chunk decode error: {}", msg),
        }
    }
}

impl std::error::Error for ChunkIoError {}

// --- Serialized mirror ---

#[derive(Debug, Serialize, Deserialize)]
struct ChunkRepr {
    code: Vec<u8>,
    constants: Vec<ConstRepr>,
    lines: Vec<u32>,
    local_names: Vec<Option<String>>,
    name: Option<String>,
    param_phases: Vec<Phase>,
    export_names: Vec<String>,
    has_exports: bool,
    default_values: Vec<ConstRepr>,
    fn_has_variadic: bool,
}

/// Persistable constants. A closed mirror of the literal kinds the
/// compiler ever places in a pool.
#[derive(Debug, Serialize, Deserialize)]
enum ConstRepr {
    Int(i64),
    Float(f64),
    Bool(bool),
    Unit,
    Nil,
    Str(String),
    Range(i64, i64),
    Tuple(Vec<ConstRepr>),
    Fn {
        name: Option<String>,
        arity: u8,
        upvalue_count: u8,
        chunk: Box<ChunkRepr>,
    },
}

impl TryFrom<&LatValue> for ConstRepr {
    type Error = ChunkIoError;

    fn try_from(value: &LatValue) -> Result<Self, ChunkIoError> {
        Ok(match &value.kind {
            ValueKind::Int(n) => ConstRepr::Int(*n),
            ValueKind::Float(x) => ConstRepr::Float(*x),
            ValueKind::Bool(b) => ConstRepr::Bool(*b),
            ValueKind::Unit => ConstRepr::Unit,
            ValueKind::Nil => ConstRepr::Nil,
            ValueKind::Str(s) => ConstRepr::Str(s.as_str().to_string()),
            ValueKind::Range(a, b) => ConstRepr::Range(*a, *b),
            ValueKind::Tuple(elems) => ConstRepr::Tuple(
                elems
                    .iter()
                    .map(ConstRepr::try_from)
                    .collect::<Result<_, _>>()?,
            ),
            ValueKind::Function(proto) => ConstRepr::Fn {
                name: proto.name.clone(),
                arity: proto.arity,
                upvalue_count: proto.upvalue_count,
                chunk: Box::new(ChunkRepr::try_from(&*proto.chunk)?),
            },
            ValueKind::Buffer(_)
            | ValueKind::Array(_)
            | ValueKind::Map(_)
            | ValueKind::Set(_)
            | ValueKind::Struct(_)
            | ValueKind::Enum(_)
            | ValueKind::Channel(_)
            | ValueKind::Ref(_)
            | ValueKind::Closure(_) => {
                return Err(ChunkIoError::Unpersistable(value.type_name()));
            }
        })
    }
}

impl From<ConstRepr> for LatValue {
    fn from(repr: ConstRepr) -> LatValue {
        match repr {
            ConstRepr::Int(n) => LatValue::int(n),
            ConstRepr::Float(x) => LatValue::float(x),
            ConstRepr::Bool(b) => LatValue::boolean(b),
            ConstRepr::Unit => LatValue::unit(),
            ConstRepr::Nil => LatValue::nil(),
            ConstRepr::Str(s) => LatValue::string(s),
            ConstRepr::Range(a, b) => LatValue::range(a, b),
            ConstRepr::Tuple(elems) => {
                LatValue::tuple(elems.into_iter().map(LatValue::from).collect())
            }
            ConstRepr::Fn {
                name,
                arity,
                upvalue_count,
                chunk,
            } => LatValue::function(Arc::new(FnProto {
                name,
                arity,
                upvalue_count,
                chunk: Arc::new(Chunk::from(*chunk)),
            })),
        }
    }
}

impl TryFrom<&Chunk> for ChunkRepr {
    type Error = ChunkIoError;

    fn try_from(chunk: &Chunk) -> Result<Self, ChunkIoError> {
        Ok(ChunkRepr {
            code: chunk.code.clone(),
            constants: chunk
                .constants
                .iter()
                .map(ConstRepr::try_from)
                .collect::<Result<_, _>>()?,
            lines: chunk.lines.clone(),
            local_names: chunk.local_names.clone(),
            name: chunk.name.clone(),
            param_phases: chunk.param_phases.clone(),
            export_names: chunk.export_names.clone(),
            has_exports: chunk.has_exports,
            default_values: chunk
                .default_values
                .iter()
                .map(ConstRepr::try_from)
                .collect::<Result<_, _>>()?,
            fn_has_variadic: chunk.fn_has_variadic,
        })
    }
}

impl From<ChunkRepr> for Chunk {
    fn from(repr: ChunkRepr) -> Chunk {
        Chunk {
            code: repr.code,
            constants: repr.constants.into_iter().map(LatValue::from).collect(),
            lines: repr.lines,
            local_names: repr.local_names,
            name: repr.name,
            param_phases: repr.param_phases,
            export_names: repr.export_names,
            has_exports: repr.has_exports,
            default_values: repr
                .default_values
                .into_iter()
                .map(LatValue::from)
                .collect(),
            fn_has_variadic: repr.fn_has_variadic,
            pic: PicTable::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chunk() -> Chunk {
        let mut chunk = Chunk::named("sample");
        let idx = chunk.add_constant(LatValue::int(19)).unwrap();
        chunk.write_op(Opcode::Constant, 1);
        chunk.write_byte(idx as u8, 1);
        chunk.write_op(Opcode::Return, 2);
        chunk.export_names.push("main".to_string());
        chunk.has_exports = true;
        chunk
    }

    #[test]
    fn test_write_and_patch_u16() {
        let mut chunk = Chunk::new();
        chunk.write_op(Opcode::Jump, 1);
        let at = chunk.code.len();
        chunk.write_u16(0xffff, 1);
        chunk.patch_u16(at, 0x1234);
        assert_eq!(chunk.read_u16(at), 0x1234);
    }

    #[test]
    fn test_persist_round_trip() {
        let chunk = sample_chunk();
        let bytes = chunk.to_bytes().unwrap();
        assert_eq!(&bytes[..4], b"LATB");
        let loaded = Chunk::from_bytes(&bytes).unwrap();
        assert_eq!(loaded.code, chunk.code);
        assert_eq!(loaded.lines, chunk.lines);
        assert_eq!(loaded.constants.len(), 1);
        assert_eq!(loaded.constants[0], LatValue::int(19));
        assert_eq!(loaded.name.as_deref(), Some("sample"));
        assert!(loaded.has_exports);
    }

    #[test]
    fn test_function_constant_round_trip() {
        let mut inner = Chunk::named("f");
        inner.write_op(Opcode::Nil, 1);
        inner.write_op(Opcode::Return, 1);
        let proto = Arc::new(FnProto {
            name: Some("f".to_string()),
            arity: 2,
            upvalue_count: 0,
            chunk: Arc::new(inner),
        });
        let mut outer = Chunk::new();
        outer.add_constant(LatValue::function(proto)).unwrap();
        let loaded = Chunk::from_bytes(&outer.to_bytes().unwrap()).unwrap();
        match &loaded.constants[0].kind {
            ValueKind::Function(p) => {
                assert_eq!(p.name.as_deref(), Some("f"));
                assert_eq!(p.arity, 2);
                assert_eq!(p.chunk.code.len(), 2);
            }
            other => panic!("expected function constant, got {:?}", other),
        }
    }

    #[test]
    fn test_register_chunk_rejected() {
        let mut bytes = sample_chunk().to_bytes().unwrap();
        bytes[..4].copy_from_slice(&REGISTER_CHUNK_MAGIC);
        match Chunk::from_bytes(&bytes) {
            Err(ChunkIoError::RegisterChunk) => {}
            other => panic!("expected RegisterChunk error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_bad_magic_rejected() {
        assert!(matches!(
            Chunk::from_bytes(b"NOPE"),
            Err(ChunkIoError::BadMagic)
        ));
        assert!(matches!(Chunk::from_bytes(b"xy"), Err(ChunkIoError::BadMagic)));
    }

    #[test]
    fn test_unpersistable_constant() {
        let mut chunk = Chunk::new();
        chunk
            .add_constant(LatValue::array(vec![LatValue::int(1)]))
            .unwrap();
        assert!(matches!(
            chunk.to_bytes(),
            Err(ChunkIoError::Unpersistable("array"))
        ));
    }

    #[test]
    fn test_pic_lookup_and_insert() {
        let pic = PicTable::new();
        assert!(pic.lookup(10, "Point").is_none());
        pic.insert(10, Arc::from("Point"), PicTarget::Builtin(3));
        match pic.lookup(10, "Point") {
            Some(PicTarget::Builtin(3)) => {}
            other => panic!("unexpected cache result: {:?}", other),
        }
        assert!(pic.lookup(10, "array").is_none());
        assert_eq!(pic.site_count(), 1);
    }

    #[test]
    fn test_pic_evicts_oldest_shape() {
        let pic = PicTable::new();
        for i in 0..5u16 {
            pic.insert(0, Arc::from(format!("Shape{}", i)), PicTarget::Builtin(i));
        }
        assert!(pic.lookup(0, "Shape0").is_none(), "oldest way evicted");
        assert!(pic.lookup(0, "Shape4").is_some());
    }

    #[test]
    fn test_disassemble_contains_mnemonics() {
        let chunk = sample_chunk();
        let listing = chunk.disassemble("sample");
        assert!(listing.contains("CONSTANT"));
        assert!(listing.contains("RETURN"));
        assert!(listing.contains("19"));
    }
}
