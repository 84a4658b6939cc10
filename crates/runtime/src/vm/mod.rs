//! The bytecode virtual machine
//!
//! A stack machine over one shared value stack. Each activation frame
//! records its closure, instruction pointer, and stack base; slot 0 of a
//! frame is the callee (or `self` for methods). The dispatch loop is
//! re-entrant: defer bodies, ensure closures, and nested calls run by
//! pushing a frame and looping until the frame count returns to a
//! watermark.
//!
//! Submodules:
//! - `ops`: arithmetic, comparison, indexing, field access
//! - `concurrent`: `SCOPE` (thread join) and `SELECT` (channel polling)

mod concurrent;
mod ops;

use crate::builtins::Builtins;
use crate::fluid::mark_reachable;
use crate::modules::ModuleRegistry;
use crate::phase_ops::{
    self, freeze_except, freeze_map_key, freeze_struct_field, value_freeze, value_sublimate,
    value_thaw,
};
use crate::region::reachable_regions;
use crate::router::Heaps;
use lattice_core::chunk::{Chunk, FnProto, PicTarget};
use lattice_core::env::EnvFrame;
use lattice_core::env::EnvRef;
use lattice_core::error::{LatError, LatErrorKind};
use lattice_core::opcode::{Opcode, LOC_GLOBAL, LOC_LOCAL, LOC_UPVALUE};
use lattice_core::phase::{Phase, RegionId};
use lattice_core::value::{
    Captures, ClosureData, LatValue, Upvalue, UpvalueRef, ValueKind,
};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::io::Write as _;
use std::rc::Rc;
use std::sync::{Arc, OnceLock};
use tracing::trace;

/// Tuning knobs for one VM instance.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Maximum activation depth before the run aborts
    pub max_frames: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig { max_frames: 1024 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    /// Ordinary call (including the script body)
    Call,
    /// Inlined defer body; returns end the body, not the function
    Defer,
}

struct Frame {
    closure: Rc<ClosureData>,
    ip: usize,
    base: usize,
    kind: FrameKind,
}

impl Frame {
    fn chunk(&self) -> Arc<Chunk> {
        self.closure.proto.chunk.clone()
    }
}

/// Installed try/catch landing site.
struct Handler {
    catch_ip: usize,
    frame_index: usize,
    /// Stack height at PUSH_EXCEPTION_HANDLER; restored before the catch
    stack_height: usize,
    /// Defer-stack height at push; defers above it run during unwind
    defer_floor: usize,
}

/// Registered `defer` body awaiting scope exit.
struct DeferRecord {
    frame_index: usize,
    start_ip: usize,
    scope_depth: u8,
}

/// Where builtin `print` output goes.
#[derive(Clone)]
pub enum OutputSink {
    Stdout,
    Buffer(Rc<RefCell<Vec<u8>>>),
}

fn standard_builtins() -> Arc<Builtins> {
    static STANDARD: OnceLock<Arc<Builtins>> = OnceLock::new();
    STANDARD.get_or_init(|| Arc::new(Builtins::standard())).clone()
}

/// One thread's virtual machine.
pub struct Vm {
    stack: Vec<LatValue>,
    frames: Vec<Frame>,
    globals: EnvRef,
    pub heaps: Heaps,
    open_upvalues: Vec<UpvalueRef>,
    handlers: Vec<Handler>,
    defers: Vec<DeferRecord>,
    builtins: Arc<Builtins>,
    modules: Arc<ModuleRegistry>,
    imported: HashMap<String, ()>,
    ephemeral: Option<RegionId>,
    out: OutputSink,
    config: VmConfig,
}

impl Vm {
    pub fn new() -> Self {
        Vm {
            stack: Vec::new(),
            frames: Vec::new(),
            globals: EnvFrame::global(),
            heaps: Heaps::for_vm(),
            open_upvalues: Vec::new(),
            handlers: Vec::new(),
            defers: Vec::new(),
            builtins: standard_builtins(),
            modules: Arc::new(ModuleRegistry::new()),
            imported: HashMap::new(),
            ephemeral: None,
            out: OutputSink::Stdout,
            config: VmConfig::default(),
        }
    }

    /// A VM whose `print` output is captured into a buffer the caller
    /// can inspect.
    pub fn with_output_buffer() -> (Self, Rc<RefCell<Vec<u8>>>) {
        let buffer = Rc::new(RefCell::new(Vec::new()));
        let mut vm = Vm::new();
        vm.out = OutputSink::Buffer(buffer.clone());
        (vm, buffer)
    }

    pub fn with_modules(mut self, modules: Arc<ModuleRegistry>) -> Self {
        self.modules = modules;
        self
    }

    pub fn with_config(mut self, config: VmConfig) -> Self {
        self.config = config;
        self
    }

    pub fn modules(&self) -> Arc<ModuleRegistry> {
        self.modules.clone()
    }

    pub fn globals(&self) -> &EnvRef {
        &self.globals
    }

    pub fn write_out(&mut self, text: &str) {
        match &self.out {
            OutputSink::Stdout => {
                print!("{}", text);
                let _ = std::io::stdout().flush();
            }
            OutputSink::Buffer(buffer) => {
                buffer.borrow_mut().extend_from_slice(text.as_bytes());
            }
        }
    }

    /// Execute a compiled script chunk to completion.
    pub fn run_chunk(&mut self, chunk: Arc<Chunk>) -> Result<LatValue, LatError> {
        let proto = Arc::new(FnProto {
            name: chunk.name.clone(),
            arity: 0,
            upvalue_count: 0,
            chunk,
        });
        let closure = Rc::new(ClosureData {
            proto,
            captures: Captures::Upvalues(Vec::new()),
        });
        let target = self.frames.len();
        self.stack.push(LatValue::closure((*closure).clone()));
        self.frames.push(Frame {
            closure,
            ip: 0,
            base: self.stack.len() - 1,
            kind: FrameKind::Call,
        });
        self.run_loop(target)
    }

    /// Call a closure value with arguments and run it to completion.
    pub fn call_value_with(
        &mut self,
        callee: &LatValue,
        args: Vec<LatValue>,
    ) -> Result<LatValue, LatError> {
        let target = self.frames.len();
        let argc = args.len();
        self.stack.push(callee.clone());
        for arg in args {
            self.stack.push(arg);
        }
        self.call_value(argc)?;
        self.run_loop(target)
    }

    // --- dispatch ---

    fn frame(&self) -> &Frame {
        match self.frames.last() {
            Some(frame) => frame,
            None => unreachable!("dispatch with empty frame stack"),
        }
    }

    fn frame_mut(&mut self) -> &mut Frame {
        match self.frames.last_mut() {
            Some(frame) => frame,
            None => unreachable!("dispatch with empty frame stack"),
        }
    }

    fn pop(&mut self) -> Result<LatValue, LatError> {
        self.stack
            .pop()
            .ok_or_else(|| LatError::internal("value stack underflow"))
    }

    fn peek(&self, distance: usize) -> Result<&LatValue, LatError> {
        let len = self.stack.len();
        if distance >= len {
            return Err(LatError::internal("value stack underflow"));
        }
        Ok(&self.stack[len - 1 - distance])
    }

    fn read_u8(&mut self, chunk: &Chunk) -> u8 {
        let frame = self.frame_mut();
        let byte = chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self, chunk: &Chunk) -> u16 {
        let hi = self.read_u8(chunk) as u16;
        let lo = self.read_u8(chunk) as u16;
        (hi << 8) | lo
    }

    fn read_const(&mut self, chunk: &Chunk, idx: usize) -> Result<LatValue, LatError> {
        chunk
            .constants
            .get(idx)
            .cloned()
            .ok_or_else(|| LatError::internal(format!("bad constant index {}", idx)))
    }

    fn const_name(&mut self, chunk: &Chunk, idx: usize) -> Result<String, LatError> {
        match self.read_const(chunk, idx)?.kind {
            ValueKind::Str(s) => Ok(s.as_str().to_string()),
            _ => Err(LatError::internal("name constant is not a string")),
        }
    }

    fn fn_const(&mut self, chunk: &Chunk, idx: usize) -> Result<Arc<FnProto>, LatError> {
        match self.read_const(chunk, idx)?.kind {
            ValueKind::Function(proto) => Ok(proto),
            _ => Err(LatError::internal("expected function constant")),
        }
    }

    /// Run until the frame stack shrinks back to `target_depth`.
    fn run_loop(&mut self, target_depth: usize) -> Result<LatValue, LatError> {
        loop {
            let chunk = self.frame().chunk();
            let op_offset = self.frame().ip;
            let byte = chunk.code[op_offset];
            let op = Opcode::try_from(byte)
                .map_err(|b| LatError::internal(format!("unknown opcode {:#04x}", b)))?;
            self.frame_mut().ip += 1;

            let outcome = self.execute(op, &chunk, op_offset, target_depth);
            match outcome {
                Ok(Some(result)) => return Ok(result),
                Ok(None) => {}
                Err(err) => {
                    let err = err.with_line(chunk.line_at(op_offset));
                    self.unwind(err, target_depth)?;
                }
            }
        }
    }

    /// Execute one instruction. `Ok(Some(v))` means `run_loop` is done.
    fn execute(
        &mut self,
        op: Opcode,
        chunk: &Arc<Chunk>,
        op_offset: usize,
        target_depth: usize,
    ) -> Result<Option<LatValue>, LatError> {
        match op {
            Opcode::Constant => {
                let idx = self.read_u8(chunk) as usize;
                let v = self.read_const(chunk, idx)?;
                self.stack.push(v);
            }
            Opcode::Constant16 => {
                let idx = self.read_u16(chunk) as usize;
                let v = self.read_const(chunk, idx)?;
                self.stack.push(v);
            }
            Opcode::LoadInt8 => {
                let n = self.read_u8(chunk) as i8;
                self.stack.push(LatValue::int(n as i64));
            }
            Opcode::True => self.stack.push(LatValue::boolean(true)),
            Opcode::False => self.stack.push(LatValue::boolean(false)),
            Opcode::Nil => self.stack.push(LatValue::nil()),
            Opcode::Unit => self.stack.push(LatValue::unit()),

            Opcode::Pop => {
                self.pop()?;
            }
            Opcode::Dup => {
                let v = self.peek(0)?.clone();
                self.stack.push(v);
            }
            Opcode::Swap => {
                let len = self.stack.len();
                if len < 2 {
                    return Err(LatError::internal("SWAP on short stack"));
                }
                self.stack.swap(len - 1, len - 2);
            }

            Opcode::GetLocal => {
                let slot = self.read_u8(chunk) as usize;
                let v = self.local(slot)?.clone();
                self.stack.push(v);
            }
            Opcode::SetLocal => {
                let slot = self.read_u8(chunk) as usize;
                let v = self.peek(0)?.clone();
                *self.local_mut(slot)? = v;
            }
            Opcode::SetLocalPop => {
                let slot = self.read_u8(chunk) as usize;
                let v = self.pop()?;
                *self.local_mut(slot)? = v;
            }
            Opcode::GetUpvalue => {
                let idx = self.read_u8(chunk) as usize;
                let v = self.upvalue_get(idx)?;
                self.stack.push(v);
            }
            Opcode::SetUpvalue => {
                let idx = self.read_u8(chunk) as usize;
                let v = self.peek(0)?.clone();
                self.upvalue_set(idx, v)?;
            }

            Opcode::GetGlobal | Opcode::GetGlobal16 => {
                let idx = if op == Opcode::GetGlobal {
                    self.read_u8(chunk) as usize
                } else {
                    self.read_u16(chunk) as usize
                };
                let name = self.const_name(chunk, idx)?;
                let v = self
                    .globals
                    .lookup(&name)
                    .ok_or_else(|| LatError::undefined(&name))?;
                self.stack.push(v);
            }
            Opcode::SetGlobal | Opcode::SetGlobal16 => {
                let idx = if op == Opcode::SetGlobal {
                    self.read_u8(chunk) as usize
                } else {
                    self.read_u16(chunk) as usize
                };
                let name = self.const_name(chunk, idx)?;
                let v = self.peek(0)?.clone();
                if !self.globals.assign(&name, v) {
                    return Err(LatError::undefined(&name));
                }
            }
            Opcode::DefineGlobal | Opcode::DefineGlobal16 => {
                let idx = if op == Opcode::DefineGlobal {
                    self.read_u8(chunk) as usize
                } else {
                    self.read_u16(chunk) as usize
                };
                let name = self.const_name(chunk, idx)?;
                let v = self.pop()?;
                self.globals.define(&name, v);
            }

            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::BitAnd
            | Opcode::BitOr
            | Opcode::BitXor
            | Opcode::Shl
            | Opcode::Shr
            | Opcode::Eq
            | Opcode::Neq
            | Opcode::Lt
            | Opcode::Gt
            | Opcode::LtEq
            | Opcode::GtEq => self.op_binary(op)?,
            Opcode::Neg | Opcode::Not | Opcode::BitNot => self.op_unary(op)?,

            Opcode::Jump => {
                let dist = self.read_u16(chunk) as usize;
                self.frame_mut().ip += dist;
            }
            Opcode::JumpIfFalse => {
                let dist = self.read_u16(chunk) as usize;
                let v = self.pop()?;
                if !v.is_truthy() {
                    self.frame_mut().ip += dist;
                }
            }
            Opcode::JumpIfTrue => {
                let dist = self.read_u16(chunk) as usize;
                let v = self.pop()?;
                if v.is_truthy() {
                    self.frame_mut().ip += dist;
                }
            }
            Opcode::JumpIfNotNil => {
                // Keeps the value when jumping; pops the nil otherwise.
                let dist = self.read_u16(chunk) as usize;
                if self.peek(0)?.is_nil() {
                    self.pop()?;
                } else {
                    self.frame_mut().ip += dist;
                }
            }
            Opcode::Loop => {
                let dist = self.read_u16(chunk) as usize;
                self.frame_mut().ip -= dist;
            }

            Opcode::Call => {
                let argc = self.read_u8(chunk) as usize;
                self.call_value(argc)?;
            }
            Opcode::Closure => {
                let fn_idx = self.read_u16(chunk) as usize;
                let count = self.read_u8(chunk) as usize;
                let proto = self.fn_const(chunk, fn_idx)?;
                let mut upvalues = Vec::with_capacity(count);
                for _ in 0..count {
                    let is_local = self.read_u8(chunk) != 0;
                    let index = self.read_u8(chunk) as usize;
                    if is_local {
                        let slot = self.frame().base + index;
                        upvalues.push(self.capture_upvalue(slot));
                    } else {
                        upvalues.push(self.enclosing_upvalue(index)?);
                    }
                }
                let closure = LatValue::closure(ClosureData {
                    proto,
                    captures: Captures::Upvalues(upvalues),
                })
                .with_phase(Phase::Fluid);
                self.heaps.fluid.track_value(&closure);
                self.stack.push(closure);
            }
            Opcode::CloseUpvalue => {
                let top = self.stack.len() - 1;
                self.close_upvalues(top);
                self.pop()?;
            }
            Opcode::Return => {
                let result = self.pop()?;
                if let Some(final_result) = self.do_return(result, target_depth)? {
                    return Ok(Some(final_result));
                }
            }

            Opcode::BuildArray
            | Opcode::BuildTuple
            | Opcode::BuildRange
            | Opcode::BuildStruct
            | Opcode::BuildEnum
            | Opcode::BuildMap
            | Opcode::BuildSet => {
                self.op_build(op, chunk)?;
                self.maybe_gc();
            }

            Opcode::Index => {
                let index = self.pop()?;
                let target = self.pop()?;
                let v = self.index_value(&target, &index)?;
                self.stack.push(v);
            }
            Opcode::SetIndex => {
                let value = self.pop()?;
                let index = self.pop()?;
                let target = self.pop()?;
                self.set_index(&target, &index, value.clone())?;
                self.stack.push(value);
            }
            Opcode::GetField => {
                let idx = self.read_u16(chunk) as usize;
                let name = self.const_name(chunk, idx)?;
                let target = self.pop()?;
                let v = self.get_field(&target, &name)?;
                self.stack.push(v);
            }
            Opcode::SetField => {
                let idx = self.read_u16(chunk) as usize;
                let name = self.const_name(chunk, idx)?;
                let value = self.pop()?;
                let target = self.pop()?;
                self.set_field(&target, &name, value.clone())?;
                self.stack.push(value);
            }
            Opcode::Invoke => {
                let idx = self.read_u16(chunk) as usize;
                let argc = self.read_u8(chunk) as usize;
                let name = self.const_name(chunk, idx)?;
                self.invoke(chunk, op_offset as u32, &name, argc)?;
            }
            Opcode::InvokeGlobal => {
                let idx = self.read_u16(chunk) as usize;
                let argc = self.read_u8(chunk) as usize;
                let name = self.const_name(chunk, idx)?;
                self.invoke_global(&name, argc)?;
            }
            Opcode::InvokeLocal => {
                let slot = self.read_u8(chunk) as usize;
                let idx = self.read_u16(chunk) as usize;
                let argc = self.read_u8(chunk) as usize;
                let name = self.const_name(chunk, idx)?;
                let recv = self.local(slot)?.clone();
                self.stack.insert(self.stack.len() - argc, recv);
                self.invoke(chunk, op_offset as u32, &name, argc)?;
            }
            Opcode::IndexLocal => {
                let slot = self.read_u8(chunk) as usize;
                let index = self.pop()?;
                let target = self.local(slot)?.clone();
                let v = self.index_value(&target, &index)?;
                self.stack.push(v);
            }
            Opcode::GetFieldLocal => {
                let slot = self.read_u8(chunk) as usize;
                let idx = self.read_u16(chunk) as usize;
                let name = self.const_name(chunk, idx)?;
                let target = self.local(slot)?.clone();
                let v = self.get_field(&target, &name)?;
                self.stack.push(v);
            }
            Opcode::IncLocal | Opcode::DecLocal => {
                let slot = self.read_u8(chunk) as usize;
                let delta: i64 = if op == Opcode::IncLocal { 1 } else { -1 };
                let local = self.local_mut(slot)?;
                match &mut local.kind {
                    ValueKind::Int(n) => *n += delta,
                    _ => {
                        return Err(LatError::type_error(format!(
                            "cannot increment {}",
                            local.type_name()
                        )))
                    }
                }
            }
            Opcode::AppendStrLocal => {
                let slot = self.read_u8(chunk) as usize;
                let suffix = self.pop()?;
                let suffix = match &suffix.kind {
                    ValueKind::Str(s) => s.as_str().to_string(),
                    _ => suffix.to_string(),
                };
                let local = self.local_mut(slot)?;
                if local.phase == Phase::Crystal {
                    return Err(LatError::crystal_mutation("string"));
                }
                match &mut local.kind {
                    ValueKind::Str(s) => s.push_str(&suffix),
                    _ => {
                        return Err(LatError::type_error(format!(
                            "cannot append to {}",
                            local.type_name()
                        )))
                    }
                }
            }
            Opcode::SetIndexLocal => {
                let slot = self.read_u8(chunk) as usize;
                let value = self.pop()?;
                let index = self.pop()?;
                let target = self.local(slot)?.clone();
                self.set_index(&target, &index, value)?;
            }
            Opcode::SetSliceLocal => {
                let slot = self.read_u8(chunk) as usize;
                let value = self.pop()?;
                let end = self.pop()?;
                let start = self.pop()?;
                let target = self.local(slot)?.clone();
                self.set_slice(&target, &start, &end, value)?;
            }

            Opcode::Freeze => {
                let v = self.pop()?;
                self.close_open_captures(&v);
                let frozen = value_freeze(&mut self.heaps, &v)?;
                self.stack.push(frozen);
            }
            Opcode::Thaw => {
                let v = self.pop()?;
                let thawed = value_thaw(&mut self.heaps, &v)?;
                self.stack.push(thawed);
            }
            Opcode::CloneValue => {
                let v = self.pop()?;
                let cloned = phase_ops::deep_clone(&mut self.heaps, &v)?;
                self.stack.push(cloned);
                self.maybe_gc();
            }
            Opcode::FreezeVar | Opcode::ThawVar => {
                let loc_type = self.read_u8(chunk);
                let operand = self.read_u16(chunk);
                let current = self.read_storage(chunk, loc_type, operand)?;
                let updated = if op == Opcode::FreezeVar {
                    self.close_open_captures(&current);
                    value_freeze(&mut self.heaps, &current)?
                } else {
                    value_thaw(&mut self.heaps, &current)?
                };
                self.write_storage(chunk, loc_type, operand, updated.clone())?;
                self.stack.push(updated);
            }
            Opcode::FreezeField => {
                let loc_type = self.read_u8(chunk);
                let operand = self.read_u16(chunk);
                let name_idx = self.read_u16(chunk) as usize;
                let field = self.const_name(chunk, name_idx)?;
                let target = self.read_storage(chunk, loc_type, operand)?;
                match &target.kind {
                    ValueKind::Map(m) => freeze_map_key(&mut self.heaps, m, &field)?,
                    ValueKind::Struct(s) => freeze_struct_field(&mut self.heaps, s, &field)?,
                    _ => {
                        return Err(LatError::type_error(format!(
                            "cannot freeze field of {}",
                            target.type_name()
                        )))
                    }
                }
                self.stack.push(target);
            }
            Opcode::FreezeExcept => {
                let loc_type = self.read_u8(chunk);
                let operand = self.read_u16(chunk);
                let count = self.read_u8(chunk) as usize;
                let mut except = Vec::with_capacity(count);
                for _ in 0..count {
                    let idx = self.read_u16(chunk) as usize;
                    except.push(self.const_name(chunk, idx)?);
                }
                let target = self.read_storage(chunk, loc_type, operand)?;
                freeze_except(&mut self.heaps, &target, &except)?;
                self.stack.push(target);
            }
            Opcode::Sublimate => {
                let v = self.pop()?;
                let thawed = value_sublimate(&mut self.heaps, &v)?;
                self.stack.push(thawed);
            }
            Opcode::MarkFluid => {
                match self.stack.last_mut() {
                    Some(v) => v.phase = Phase::Fluid,
                    None => return Err(LatError::internal("MARK_FLUID on empty stack")),
                }
            }
            Opcode::IsCrystal => {
                let v = self.pop()?;
                self.stack.push(LatValue::boolean(v.phase == Phase::Crystal));
            }
            Opcode::IsFluid => {
                let v = self.pop()?;
                self.stack.push(LatValue::boolean(v.phase == Phase::Fluid));
            }

            Opcode::PushExceptionHandler => {
                let dist = self.read_u16(chunk) as usize;
                let catch_ip = self.frame().ip + dist;
                self.handlers.push(Handler {
                    catch_ip,
                    frame_index: self.frames.len() - 1,
                    stack_height: self.stack.len(),
                    defer_floor: self.defers.len(),
                });
            }
            Opcode::PopExceptionHandler => {
                self.handlers.pop();
            }
            Opcode::Throw => {
                let v = self.pop()?;
                return Err(LatError::thrown(v));
            }
            Opcode::TryUnwrap => {
                let v = self.pop()?;
                match &v.kind {
                    ValueKind::Enum(e) if &*e.variant == "Ok" => {
                        let inner = e.payload.first().cloned().unwrap_or_else(LatValue::unit);
                        self.stack.push(inner);
                    }
                    ValueKind::Enum(e) if &*e.variant == "Err" => {
                        let payload =
                            e.payload.first().cloned().unwrap_or_else(LatValue::nil);
                        return Err(LatError::thrown(payload));
                    }
                    ValueKind::Nil => {
                        // `?` on nil returns nil from the enclosing function
                        if let Some(final_result) =
                            self.do_return(LatValue::nil(), target_depth)?
                        {
                            return Ok(Some(final_result));
                        }
                    }
                    _ => self.stack.push(v),
                }
            }

            Opcode::DeferPush => {
                let depth = self.read_u8(chunk);
                let dist = self.read_u16(chunk) as usize;
                let start_ip = self.frame().ip;
                self.defers.push(DeferRecord {
                    frame_index: self.frames.len() - 1,
                    start_ip,
                    scope_depth: depth,
                });
                self.frame_mut().ip += dist;
            }
            Opcode::DeferRun => {
                let depth = self.read_u8(chunk);
                let frame_index = self.frames.len() - 1;
                self.run_frame_defers(frame_index, depth)?;
            }

            Opcode::Scope => self.op_scope(chunk)?,
            Opcode::Select => self.op_select(chunk)?,
            Opcode::Import => {
                let idx = self.read_u16(chunk) as usize;
                let name = self.const_name(chunk, idx)?;
                self.op_import(&name)?;
            }

            Opcode::CheckType => {
                let slot = self.read_u8(chunk) as usize;
                let type_idx = self.read_u16(chunk) as usize;
                let msg_idx = self.read_u16(chunk) as usize;
                let expected = self.const_name(chunk, type_idx)?;
                let msg = self.const_name(chunk, msg_idx)?;
                let v = self.local(slot)?.clone();
                self.check_type(&v, &expected, &msg)?;
            }
            Opcode::CheckReturnType => {
                let type_idx = self.read_u16(chunk) as usize;
                let msg_idx = self.read_u16(chunk) as usize;
                let expected = self.const_name(chunk, type_idx)?;
                let msg = self.const_name(chunk, msg_idx)?;
                let v = self.peek(0)?.clone();
                self.check_type(&v, &expected, &msg)?;
            }

            Opcode::ResetEphemeral => {
                if let Some(id) = self.ephemeral.take() {
                    self.heaps.regions.release(id);
                }
                self.ephemeral = Some(self.heaps.regions.create());
            }
        }
        Ok(None)
    }

    // --- storage classes (FREEZE_VAR family) ---

    fn read_storage(
        &mut self,
        chunk: &Chunk,
        loc_type: u8,
        operand: u16,
    ) -> Result<LatValue, LatError> {
        match loc_type {
            LOC_LOCAL => self.local(operand as usize).cloned(),
            LOC_UPVALUE => self.upvalue_get(operand as usize),
            LOC_GLOBAL => {
                let name = self.const_name(chunk, operand as usize)?;
                self.globals
                    .lookup(&name)
                    .ok_or_else(|| LatError::undefined(&name))
            }
            other => Err(LatError::internal(format!("bad storage class {}", other))),
        }
    }

    fn write_storage(
        &mut self,
        chunk: &Chunk,
        loc_type: u8,
        operand: u16,
        value: LatValue,
    ) -> Result<(), LatError> {
        match loc_type {
            LOC_LOCAL => {
                *self.local_mut(operand as usize)? = value;
                Ok(())
            }
            LOC_UPVALUE => self.upvalue_set(operand as usize, value),
            LOC_GLOBAL => {
                let name = self.const_name(chunk, operand as usize)?;
                if self.globals.assign(&name, value) {
                    Ok(())
                } else {
                    Err(LatError::undefined(&name))
                }
            }
            other => Err(LatError::internal(format!("bad storage class {}", other))),
        }
    }

    fn local(&self, slot: usize) -> Result<&LatValue, LatError> {
        let base = self.frame().base;
        self.stack
            .get(base + slot)
            .ok_or_else(|| LatError::internal(format!("bad local slot {}", slot)))
    }

    fn local_mut(&mut self, slot: usize) -> Result<&mut LatValue, LatError> {
        let base = self.frame().base;
        self.stack
            .get_mut(base + slot)
            .ok_or_else(|| LatError::internal(format!("bad local slot {}", slot)))
    }

    // --- upvalues ---

    fn current_upvalues(&self) -> Result<&Vec<UpvalueRef>, LatError> {
        match &self.frame().closure.captures {
            Captures::Upvalues(ups) => Ok(ups),
            Captures::Env(_) => Err(LatError::internal(
                "bytecode frame with environment captures",
            )),
        }
    }

    fn upvalue_get(&self, idx: usize) -> Result<LatValue, LatError> {
        let ups = self.current_upvalues()?;
        let cell = ups
            .get(idx)
            .ok_or_else(|| LatError::internal(format!("bad upvalue index {}", idx)))?;
        let value = match &*cell.borrow() {
            Upvalue::Open(slot) => self.stack[*slot].clone(),
            Upvalue::Closed(v) => v.clone(),
        };
        Ok(value)
    }

    fn upvalue_set(&mut self, idx: usize, value: LatValue) -> Result<(), LatError> {
        let cell = {
            let ups = self.current_upvalues()?;
            ups.get(idx)
                .cloned()
                .ok_or_else(|| LatError::internal(format!("bad upvalue index {}", idx)))?
        };
        let slot = match &*cell.borrow() {
            Upvalue::Open(slot) => Some(*slot),
            Upvalue::Closed(_) => None,
        };
        match slot {
            Some(slot) => self.stack[slot] = value,
            None => *cell.borrow_mut() = Upvalue::Closed(value),
        }
        Ok(())
    }

    fn enclosing_upvalue(&self, idx: usize) -> Result<UpvalueRef, LatError> {
        let ups = self.current_upvalues()?;
        ups.get(idx)
            .cloned()
            .ok_or_else(|| LatError::internal(format!("bad upvalue index {}", idx)))
    }

    fn capture_upvalue(&mut self, slot: usize) -> UpvalueRef {
        for cell in &self.open_upvalues {
            if let Upvalue::Open(s) = &*cell.borrow() {
                if *s == slot {
                    return cell.clone();
                }
            }
        }
        let cell = Rc::new(RefCell::new(Upvalue::Open(slot)));
        self.open_upvalues.push(cell.clone());
        cell
    }

    /// Close every open upvalue whose slot is at or above `from`,
    /// migrating the stack value into the shared cell.
    fn close_upvalues(&mut self, from: usize) {
        let stack = &self.stack;
        self.open_upvalues.retain(|cell| {
            let slot = match &*cell.borrow() {
                Upvalue::Open(s) => *s,
                Upvalue::Closed(_) => return false,
            };
            if slot >= from {
                let value = stack[slot].clone();
                *cell.borrow_mut() = Upvalue::Closed(value);
                false
            } else {
                true
            }
        });
    }

    /// Close the open captures of every closure inside `value` so it can
    /// be frozen or transferred.
    fn close_open_captures(&mut self, value: &LatValue) {
        let mut cells = Vec::new();
        collect_closure_cells(value, &mut cells);
        for cell in cells {
            let slot = match &*cell.borrow() {
                Upvalue::Open(s) => *s,
                Upvalue::Closed(_) => continue,
            };
            let v = self.stack[slot].clone();
            *cell.borrow_mut() = Upvalue::Closed(v);
            self.open_upvalues
                .retain(|open| !Rc::ptr_eq(open, &cell));
        }
    }

    // --- calls ---

    fn call_value(&mut self, argc: usize) -> Result<(), LatError> {
        let callee_idx = self.stack.len() - 1 - argc;
        let callee = self.stack[callee_idx].clone();
        match &callee.kind {
            ValueKind::Closure(c) => self.call_closure_data(c.clone(), argc),
            ValueKind::Function(p) => {
                let closure = Rc::new(ClosureData {
                    proto: p.clone(),
                    captures: Captures::Upvalues(Vec::new()),
                });
                self.call_closure_data(closure, argc)
            }
            _ => Err(LatError::type_error(format!(
                "cannot call a value of type {}",
                callee.type_name()
            ))),
        }
    }

    fn call_closure_data(
        &mut self,
        closure: Rc<ClosureData>,
        argc: usize,
    ) -> Result<(), LatError> {
        if self.frames.len() >= self.config.max_frames {
            return Err(LatError::internal("call stack overflow"));
        }
        let proto = closure.proto.clone();
        let chunk = proto.chunk.clone();
        let fixed = proto.arity as usize;
        let name = proto.name.clone().unwrap_or_else(|| "<fn>".to_string());
        let mut argc = argc;

        if argc < fixed {
            let defaults = &chunk.default_values;
            let missing = fixed - argc;
            if missing > defaults.len() {
                return Err(LatError::arity(fixed, argc, &name));
            }
            for default in &defaults[defaults.len() - missing..] {
                self.stack.push(default.clone());
            }
            argc = fixed;
        }
        if argc > fixed {
            if !chunk.fn_has_variadic {
                return Err(LatError::arity(fixed, argc, &name));
            }
            let rest: Vec<LatValue> = self.stack.split_off(self.stack.len() - (argc - fixed));
            let rest = LatValue::array(rest);
            self.heaps.fluid.track_value(&rest);
            self.stack.push(rest);
            argc = fixed + 1;
        } else if chunk.fn_has_variadic {
            let rest = LatValue::array(Vec::new());
            self.heaps.fluid.track_value(&rest);
            self.stack.push(rest);
            argc = fixed + 1;
        }

        let base = self.stack.len() - 1 - argc;
        for (i, required) in chunk.param_phases.iter().enumerate() {
            let arg = match self.stack.get(base + 1 + i) {
                Some(v) => v,
                None => break,
            };
            match required {
                Phase::Crystal if arg.phase != Phase::Crystal => {
                    return Err(LatError::phase(format!(
                        "parameter {} of '{}' must be crystal",
                        i + 1,
                        name
                    )));
                }
                Phase::Fluid if arg.phase == Phase::Crystal => {
                    return Err(LatError::phase(format!(
                        "parameter {} of '{}' must be fluid",
                        i + 1,
                        name
                    )));
                }
                _ => {}
            }
        }

        self.frames.push(Frame {
            closure,
            ip: 0,
            base,
            kind: FrameKind::Call,
        });
        Ok(())
    }

    /// Shared RETURN path. `Ok(Some(v))` ends the current `run_loop`.
    fn do_return(
        &mut self,
        result: LatValue,
        target_depth: usize,
    ) -> Result<Option<LatValue>, LatError> {
        let frame_index = self.frames.len() - 1;
        if self.frame().kind == FrameKind::Defer {
            self.frames.pop();
            // Defers registered inside this defer body die with it.
            let live = self.frames.len();
            self.defers.retain(|d| d.frame_index < live);
            if self.frames.len() == target_depth {
                return Ok(Some(result));
            }
            return Ok(None);
        }
        self.run_frame_defers(frame_index, 0)?;
        let base = self.frame().base;
        self.close_upvalues(base);
        self.stack.truncate(base);
        self.frames.pop();
        while self
            .handlers
            .last()
            .map_or(false, |h| h.frame_index >= self.frames.len())
        {
            self.handlers.pop();
        }
        if self.frames.len() == target_depth {
            return Ok(Some(result));
        }
        self.stack.push(result);
        Ok(None)
    }

    // --- defers ---

    /// Run (and remove) this frame's defers with scope depth >= `depth`,
    /// in LIFO order.
    fn run_frame_defers(&mut self, frame_index: usize, depth: u8) -> Result<(), LatError> {
        while let Some(last) = self.defers.last() {
            if last.frame_index != frame_index || last.scope_depth < depth {
                break;
            }
            let record = match self.defers.pop() {
                Some(r) => r,
                None => break,
            };
            self.run_defer(record)?;
        }
        Ok(())
    }

    fn run_defer(&mut self, record: DeferRecord) -> Result<(), LatError> {
        let frame = &self.frames[record.frame_index];
        let closure = frame.closure.clone();
        let base = frame.base;
        self.frames.push(Frame {
            closure,
            ip: record.start_ip,
            base,
            kind: FrameKind::Defer,
        });
        let target = self.frames.len() - 1;
        let _ = self.run_loop(target)?;
        Ok(())
    }

    // --- unwind ---

    /// Route a thrown error to the innermost handler within this
    /// `run_loop`'s frame region, or propagate it out.
    fn unwind(&mut self, err: LatError, target_depth: usize) -> Result<(), LatError> {
        if !err.is_catchable() {
            return Err(err);
        }
        let usable = self
            .handlers
            .last()
            .map_or(false, |h| h.frame_index >= target_depth);
        if !usable {
            return Err(err);
        }
        let handler = match self.handlers.pop() {
            Some(h) => h,
            None => return Err(err),
        };
        trace!(
            kind = ?err.kind,
            frame = handler.frame_index,
            "unwinding to handler"
        );
        // Defers registered after the handler run first, LIFO; a throw
        // inside one of them continues unwinding outward.
        while self.defers.len() > handler.defer_floor {
            let record = match self.defers.pop() {
                Some(r) => r,
                None => break,
            };
            self.run_defer(record)?;
        }
        self.close_upvalues(handler.stack_height);
        self.frames.truncate(handler.frame_index + 1);
        self.stack.truncate(handler.stack_height);
        self.frame_mut().ip = handler.catch_ip;
        self.stack.push(err.payload());
        Ok(())
    }

    // --- method dispatch ---

    fn invoke(
        &mut self,
        chunk: &Arc<Chunk>,
        op_offset: u32,
        name: &str,
        argc: usize,
    ) -> Result<(), LatError> {
        let recv_idx = self.stack.len() - 1 - argc;
        let recv = self.stack[recv_idx].clone();
        let shape = recv.shape_name();
        if let Some(target) = chunk.pic.lookup(op_offset, &shape) {
            return self.invoke_target(target, argc);
        }
        let target = self.resolve_method(&recv, &shape, name)?;
        chunk.pic.insert(op_offset, shape, target.clone());
        self.invoke_target(target, argc)
    }

    fn resolve_method(
        &self,
        recv: &LatValue,
        shape: &str,
        name: &str,
    ) -> Result<PicTarget, LatError> {
        if matches!(recv.kind, ValueKind::Struct(_) | ValueKind::Enum(_)) {
            let qualified = format!("{}::{}", shape, name);
            if let Some(v) = self.globals.lookup(&qualified) {
                match &v.kind {
                    ValueKind::Closure(c) => return Ok(PicTarget::Proto(c.proto.clone())),
                    ValueKind::Function(p) => return Ok(PicTarget::Proto(p.clone())),
                    _ => {}
                }
            }
        }
        if let Some(id) = self.builtins.method_id(shape, name) {
            return Ok(PicTarget::Builtin(id));
        }
        // Nominal shapes (struct/enum names) fall back to the builtin
        // table keyed by their underlying type.
        if let Some(id) = self.builtins.method_id(recv.type_name(), name) {
            return Ok(PicTarget::Builtin(id));
        }
        Err(LatError::missing_field(shape, name))
    }

    fn invoke_target(&mut self, target: PicTarget, argc: usize) -> Result<(), LatError> {
        match target {
            PicTarget::Proto(proto) => {
                let closure = Rc::new(ClosureData {
                    proto,
                    captures: Captures::Upvalues(Vec::new()),
                });
                self.call_closure_data(closure, argc)
            }
            PicTarget::Builtin(id) => {
                let args = self.stack.split_off(self.stack.len() - argc);
                let recv = self.pop()?;
                let builtins = self.builtins.clone();
                let out = builtins.call_method(self, id, &recv, args)?;
                self.stack.push(out);
                Ok(())
            }
        }
    }

    fn invoke_global(&mut self, name: &str, argc: usize) -> Result<(), LatError> {
        if self.builtins.contains(name) {
            let args = self.stack.split_off(self.stack.len() - argc);
            let builtins = self.builtins.clone();
            let out = builtins.call(self, name, args)?;
            self.stack.push(out);
            return Ok(());
        }
        let callee = self
            .globals
            .lookup(name)
            .ok_or_else(|| LatError::undefined(name))?;
        self.stack.insert(self.stack.len() - argc, callee);
        self.call_value(argc)
    }

    // --- modules ---

    fn op_import(&mut self, name: &str) -> Result<(), LatError> {
        if self.imported.contains_key(name) {
            return Ok(());
        }
        let module_chunk = self
            .modules
            .get(name)
            .ok_or_else(|| {
                LatError::new(LatErrorKind::MissingModule, format!("unknown module '{}'", name))
            })?;
        let saved = std::mem::replace(&mut self.globals, EnvFrame::global());
        let outcome = self.run_chunk(module_chunk.clone());
        let module_globals = std::mem::replace(&mut self.globals, saved);
        outcome?;
        for export in &module_chunk.export_names {
            let value = module_globals
                .lookup(export)
                .ok_or_else(|| LatError::missing_export(name, export))?;
            self.globals.define(&format!("{}::{}", name, export), value);
        }
        self.imported.insert(name.to_string(), ());
        Ok(())
    }

    // --- contracts ---

    fn check_type(&self, v: &LatValue, expected: &str, msg: &str) -> Result<(), LatError> {
        if expected == "any" {
            return Ok(());
        }
        let actual = v.shape_name();
        if &*actual == expected || v.type_name() == expected {
            return Ok(());
        }
        Err(LatError::new(LatErrorKind::Contract, msg.to_string()))
    }

    // --- garbage collection ---

    fn maybe_gc(&mut self) {
        if self.heaps.fluid.should_collect() {
            self.collect_garbage();
        }
    }

    /// Full collection: mark from the VM roots, sweep the fluid heap,
    /// then collect unreachable regions. Returns objects freed.
    pub fn collect_garbage(&mut self) -> usize {
        self.heaps.fluid.unmark_all();
        {
            let fluid = &mut self.heaps.fluid;
            for v in self.stack.iter() {
                mark_reachable(fluid, v);
            }
            let mut env = Some(self.globals.clone());
            while let Some(frame) = env {
                frame.for_each_local(|v| mark_reachable(fluid, v));
                env = frame.parent().cloned();
            }
            for cell in self.open_upvalues.iter() {
                if let Upvalue::Closed(v) = &*cell.borrow() {
                    mark_reachable(fluid, v);
                }
            }
        }
        let freed = self.heaps.fluid.sweep();

        // Regions reachable from the same roots survive; the ephemeral
        // scratch region is always pinned.
        let mut reachable: HashSet<RegionId> = reachable_regions(self.stack.iter());
        let mut env = Some(self.globals.clone());
        while let Some(frame) = env {
            frame.for_each_local(|v| {
                for id in reachable_regions([v].into_iter()) {
                    reachable.insert(id);
                }
            });
            env = frame.parent().cloned();
        }
        if let Some(id) = self.ephemeral {
            reachable.insert(id);
        }
        let regions_freed = self.heaps.regions.collect(&reachable);
        trace!(freed, regions_freed, "collection cycle");
        freed
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// Gather the upvalue cells of every closure reachable from `value`.
fn collect_closure_cells(value: &LatValue, out: &mut Vec<UpvalueRef>) {
    match &value.kind {
        ValueKind::Closure(c) => {
            if let Captures::Upvalues(ups) = &c.captures {
                for cell in ups {
                    out.push(cell.clone());
                }
            }
        }
        ValueKind::Array(arr) => {
            for v in arr.borrow().iter() {
                collect_closure_cells(v, out);
            }
        }
        ValueKind::Tuple(elems) => {
            for v in elems.iter() {
                collect_closure_cells(v, out);
            }
        }
        ValueKind::Map(m) => {
            for (_, v) in m.borrow().entries.iter() {
                collect_closure_cells(v, out);
            }
        }
        ValueKind::Struct(s) => {
            for v in s.borrow().fields.iter() {
                collect_closure_cells(v, out);
            }
        }
        ValueKind::Enum(e) => {
            for v in e.payload.iter() {
                collect_closure_cells(v, out);
            }
        }
        ValueKind::Ref(cell) => collect_closure_cells(&cell.borrow(), out),
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
