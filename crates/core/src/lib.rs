//! Lattice Core: the shared foundation of the Lattice execution stack
//!
//! Lattice is a phase-typed bytecode language: every value is *fluid*
//! (mutable, tracked by a mark-sweep heap) or *crystal* (immutable,
//! arena-backed). This crate holds everything the compiler and the VM
//! both need:
//!
//! - `phase`: the phase tag and region identifiers
//! - `arena`: shared bump arenas and arena-backed payloads
//! - `latstr`: heap- or arena-backed strings
//! - `map`: the open-addressed string-keyed table used by map values
//! - `value`: the `LatValue` model (kinds, equality, display, channels)
//! - `env`: refcounted lexical scope-chain frames
//! - `opcode` / `chunk`: the bytecode instruction set and chunk format
//! - `error`: compile- and run-time error taxonomy

pub mod arena;
pub mod chunk;
pub mod env;
pub mod error;
pub mod latstr;
pub mod map;
pub mod opcode;
pub mod phase;
pub mod value;

pub use arena::{ArenaBytes, ArenaStr, SharedArena, ARENA_ALIGN, ARENA_PAGE_SIZE};
pub use chunk::{
    Chunk, ChunkIoError, FnProto, PicTable, PicTarget, CHUNK_MAGIC, MAX_CONSTANTS,
    REGISTER_CHUNK_MAGIC,
};
pub use env::{clone_chain, EnvFrame, EnvRef};
pub use error::{CompileError, CompileErrorKind, LatError, LatErrorKind};
pub use latstr::LatStr;
pub use map::{fnv1a, LatMap};
pub use opcode::{
    Opcode, LOC_GLOBAL, LOC_LOCAL, LOC_UPVALUE, SELECT_ARM_CHANNEL, SELECT_ARM_DEFAULT,
    SELECT_ARM_TIMEOUT,
};
pub use phase::{Phase, RegionId, NO_REGION};
pub use value::{
    lat_eq, ArrayRef, BufferData, Captures, ChannelClosed, ChannelData, ClosureData, EnumData,
    LatValue, MapData, MapRef, SetRef, StructData, StructRef, Upvalue, UpvalueRef, ValueCellRef,
    ValueKind,
};
