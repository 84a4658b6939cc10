//! AST to bytecode translation
//!
//! One [`FnCompiler`] per function being compiled, kept on an explicit
//! stack so nested closures resolve upvalues by walking enclosing
//! compilers by index (no shared mutable compiler pointer). Submodules:
//!
//! - `fold`: compile-time evaluation of literal operator expressions
//! - `expr` / `stmt`: expression and statement lowering
//! - `pattern`: `match` arm lowering

mod expr;
mod fold;
mod pattern;
mod stmt;

use crate::ast::*;
use crate::config::CompilerConfig;
use lattice_core::chunk::{Chunk, FnProto};
use lattice_core::error::{CompileError, CompileErrorKind};
use lattice_core::opcode::Opcode;
use lattice_core::phase::Phase;
use lattice_core::value::LatValue;
use std::collections::HashMap;
use std::sync::Arc;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FnKind {
    Script,
    Function,
    Method,
}

#[derive(Debug)]
pub(crate) struct Local {
    pub name: String,
    pub depth: u8,
    pub is_captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UpvalueDesc {
    pub index: u8,
    pub is_local: bool,
}

#[derive(Debug, Default)]
pub(crate) struct ScopeInfo {
    pub has_defer: bool,
}

#[derive(Debug)]
pub(crate) struct LoopCtx {
    pub start: usize,
    /// For-loops patch continue jumps forward to the increment
    pub is_for: bool,
    pub break_sites: Vec<usize>,
    pub continue_sites: Vec<usize>,
    pub local_floor: usize,
    pub depth: u8,
}

/// Per-function compilation state.
pub(crate) struct FnCompiler {
    pub chunk: Chunk,
    pub kind: FnKind,
    pub fn_name: Option<String>,
    pub locals: Vec<Local>,
    pub upvalues: Vec<UpvalueDesc>,
    pub scope_depth: u8,
    pub scopes: Vec<ScopeInfo>,
    pub loops: Vec<LoopCtx>,
    pub line: u32,
    pub ensures: Vec<Contract>,
    pub return_type: Option<String>,
    name_cache: HashMap<String, u16>,
}

impl FnCompiler {
    fn new(kind: FnKind, name: Option<String>) -> Self {
        let mut chunk = Chunk::new();
        chunk.name = name.clone();
        FnCompiler {
            chunk,
            kind,
            fn_name: name,
            locals: Vec::new(),
            upvalues: Vec::new(),
            scope_depth: 0,
            scopes: vec![ScopeInfo::default()],
            loops: Vec::new(),
            line: 1,
            ensures: Vec::new(),
            return_type: None,
            name_cache: HashMap::new(),
        }
    }
}

/// The compiler: a stack of function compilers plus declaration tables.
pub(crate) struct Compiler<'a> {
    pub config: &'a CompilerConfig,
    pub stack: Vec<FnCompiler>,
    pub structs: HashMap<String, Vec<String>>,
    pub enums: HashMap<String, HashMap<String, usize>>,
    pub traits: HashMap<String, TraitDecl>,
}

pub(crate) type CResult<T = ()> = Result<T, CompileError>;

impl<'a> Compiler<'a> {
    pub fn new(config: &'a CompilerConfig) -> Self {
        Compiler {
            config,
            stack: Vec::new(),
            structs: HashMap::new(),
            enums: HashMap::new(),
            traits: HashMap::new(),
        }
    }

    pub(crate) fn fc(&self) -> &FnCompiler {
        match self.stack.last() {
            Some(fc) => fc,
            None => unreachable!("compiler stack is never empty during compilation"),
        }
    }

    pub(crate) fn fc_mut(&mut self) -> &mut FnCompiler {
        match self.stack.last_mut() {
            Some(fc) => fc,
            None => unreachable!("compiler stack is never empty during compilation"),
        }
    }

    pub(crate) fn line(&self) -> u32 {
        self.fc().line
    }

    pub(crate) fn set_line(&mut self, line: u32) {
        self.fc_mut().line = line;
    }

    pub(crate) fn error(&self, kind: CompileErrorKind, message: impl Into<String>) -> CompileError {
        CompileError::new(self.line(), kind, message)
    }

    // --- emission ---

    pub(crate) fn emit_op(&mut self, op: Opcode) {
        let line = self.line();
        self.fc_mut().chunk.write_op(op, line);
    }

    pub(crate) fn emit_byte(&mut self, byte: u8) {
        let line = self.line();
        self.fc_mut().chunk.write_byte(byte, line);
    }

    pub(crate) fn emit_u16(&mut self, value: u16) {
        let line = self.line();
        self.fc_mut().chunk.write_u16(value, line);
    }

    pub(crate) fn make_constant(&mut self, value: LatValue) -> CResult<u16> {
        let line = self.line();
        match self.fc_mut().chunk.add_constant(value) {
            Some(idx) => Ok(idx),
            None => Err(CompileError::new(
                line,
                CompileErrorKind::TooManyConstants,
                "too many constants in one chunk",
            )),
        }
    }

    /// Push a constant-pool value (CONSTANT / CONSTANT_16).
    pub(crate) fn emit_constant_value(&mut self, value: LatValue) -> CResult {
        let idx = self.make_constant(value)?;
        if idx <= u8::MAX as u16 {
            self.emit_op(Opcode::Constant);
            self.emit_byte(idx as u8);
        } else {
            self.emit_op(Opcode::Constant16);
            self.emit_u16(idx);
        }
        Ok(())
    }

    /// Interned string constant for names (globals, fields, methods).
    pub(crate) fn name_const(&mut self, name: &str) -> CResult<u16> {
        if let Some(&idx) = self.fc().name_cache.get(name) {
            return Ok(idx);
        }
        let idx = self.make_constant(LatValue::string(name))?;
        self.fc_mut().name_cache.insert(name.to_string(), idx);
        Ok(idx)
    }

    /// Push a small-int literal without touching the constant pool.
    pub(crate) fn emit_int(&mut self, n: i64) -> CResult {
        if (i8::MIN as i64..=i8::MAX as i64).contains(&n) {
            self.emit_op(Opcode::LoadInt8);
            self.emit_byte(n as i8 as u8);
            Ok(())
        } else {
            self.emit_constant_value(LatValue::int(n))
        }
    }

    pub(crate) fn emit_jump(&mut self, op: Opcode) -> usize {
        self.emit_op(op);
        self.emit_u16(0xffff);
        self.fc().chunk.code.len() - 2
    }

    pub(crate) fn patch_jump(&mut self, site: usize) -> CResult {
        let dist = self.fc().chunk.code.len() - site - 2;
        if dist > u16::MAX as usize {
            return Err(self.error(CompileErrorKind::JumpTooLarge, "jump distance overflow"));
        }
        self.fc_mut().chunk.patch_u16(site, dist as u16);
        Ok(())
    }

    pub(crate) fn emit_loop(&mut self, start: usize) -> CResult {
        let dist = self.fc().chunk.code.len() + 3 - start;
        if dist > u16::MAX as usize {
            return Err(self.error(CompileErrorKind::JumpTooLarge, "loop distance overflow"));
        }
        self.emit_op(Opcode::Loop);
        self.emit_u16(dist as u16);
        Ok(())
    }

    // --- scopes and locals ---

    pub(crate) fn begin_scope(&mut self) {
        let fc = self.fc_mut();
        fc.scope_depth += 1;
        fc.scopes.push(ScopeInfo::default());
    }

    /// Close the current scope: run its defers, then pop (or close) its
    /// locals.
    pub(crate) fn end_scope(&mut self) {
        let leaving = self.fc().scope_depth;
        let had_defer = self.fc_mut().scopes.pop().map(|s| s.has_defer).unwrap_or(false);
        if had_defer {
            self.emit_op(Opcode::DeferRun);
            self.emit_byte(leaving);
        }
        self.fc_mut().scope_depth -= 1;
        loop {
            let fc = self.fc();
            let captured = match fc.locals.last() {
                Some(local) if local.depth > fc.scope_depth => local.is_captured,
                _ => break,
            };
            if captured {
                self.emit_op(Opcode::CloseUpvalue);
            } else {
                self.emit_op(Opcode::Pop);
            }
            self.fc_mut().locals.pop();
        }
    }

    /// Scope exit without emitting pops (the caller already balanced the
    /// stack, e.g. match arms); compiler bookkeeping only.
    pub(crate) fn forget_scope_locals(&mut self, floor: usize) {
        self.fc_mut().locals.truncate(floor);
    }

    pub(crate) fn mark_defer_in_scope(&mut self) {
        if let Some(scope) = self.fc_mut().scopes.last_mut() {
            scope.has_defer = true;
        }
    }

    pub(crate) fn has_any_defer(&self) -> bool {
        self.fc().scopes.iter().any(|s| s.has_defer)
    }

    pub(crate) fn declare_local(&mut self, name: &str) -> CResult<u8> {
        if self.fc().locals.len() >= MAX_LOCALS {
            return Err(self.error(
                CompileErrorKind::TooManyLocals,
                "too many locals in one function",
            ));
        }
        let depth = self.fc().scope_depth;
        let slot = self.fc().locals.len() as u8;
        self.fc_mut().locals.push(Local {
            name: name.to_string(),
            depth,
            is_captured: false,
        });
        if self.config.debug_locals {
            let chunk = &mut self.fc_mut().chunk;
            if chunk.local_names.len() <= slot as usize {
                chunk.local_names.resize(slot as usize + 1, None);
            }
            chunk.local_names[slot as usize] = Some(name.to_string());
        }
        Ok(slot)
    }

    pub(crate) fn resolve_local(&self, name: &str) -> Option<u8> {
        self.resolve_local_at(self.stack.len() - 1, name)
    }

    fn resolve_local_at(&self, level: usize, name: &str) -> Option<u8> {
        let fc = &self.stack[level];
        fc.locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, local)| local.name == name)
            .map(|(slot, _)| slot as u8)
    }

    pub(crate) fn resolve_upvalue(&mut self, name: &str) -> CResult<Option<u8>> {
        let level = self.stack.len() - 1;
        self.resolve_upvalue_at(level, name)
    }

    fn resolve_upvalue_at(&mut self, level: usize, name: &str) -> CResult<Option<u8>> {
        if level == 0 {
            return Ok(None);
        }
        if let Some(slot) = self.resolve_local_at(level - 1, name) {
            self.stack[level - 1].locals[slot as usize].is_captured = true;
            return self.add_upvalue(level, slot, true).map(Some);
        }
        if let Some(up) = self.resolve_upvalue_at(level - 1, name)? {
            return self.add_upvalue(level, up, false).map(Some);
        }
        Ok(None)
    }

    fn add_upvalue(&mut self, level: usize, index: u8, is_local: bool) -> CResult<u8> {
        let desc = UpvalueDesc { index, is_local };
        if let Some(existing) = self.stack[level].upvalues.iter().position(|u| *u == desc) {
            return Ok(existing as u8);
        }
        if self.stack[level].upvalues.len() >= MAX_UPVALUES {
            return Err(self.error(
                CompileErrorKind::TooManyUpvalues,
                "too many captured variables in one closure",
            ));
        }
        self.stack[level].upvalues.push(desc);
        Ok((self.stack[level].upvalues.len() - 1) as u8)
    }

    // --- program entry points ---

    pub fn compile_program(
        &mut self,
        program: &Program,
        mode: CompileMode,
    ) -> CResult<Arc<Chunk>> {
        self.collect_declarations(program);
        self.stack
            .push(FnCompiler::new(FnKind::Script, Some(script_name(mode))));
        // slot 0 holds the running script closure
        self.declare_local("")?;

        if mode == CompileMode::Repl {
            self.emit_op(Opcode::ResetEphemeral);
        }

        let mut has_main = false;
        for (index, item) in program.items.iter().enumerate() {
            let last = index + 1 == program.items.len();
            match item {
                Item::Stmt(Stmt::Expr { expr, line }) if last && mode == CompileMode::Repl => {
                    // REPL: the last bare expression's value is the
                    // chunk's result.
                    self.set_line(*line);
                    self.compile_expr(expr)?;
                    self.emit_op(Opcode::Return);
                    let fc = match self.stack.pop() {
                        Some(fc) => fc,
                        None => unreachable!("script compiler present"),
                    };
                    return Ok(Arc::new(fc.chunk));
                }
                Item::Stmt(stmt) => self.compile_stmt(stmt)?,
                Item::Function(decl) => {
                    if decl.name == "main" {
                        has_main = true;
                    }
                    self.compile_fn_item(decl, &decl.name, mode)?;
                }
                Item::Struct(decl) => self.compile_struct_decl(decl, mode)?,
                Item::Enum(decl) => self.compile_enum_decl(decl, mode)?,
                Item::Impl(block) => self.compile_impl_block(block)?,
                Item::Trait(_) => {} // collected in the pre-pass
                Item::Test(test) => self.compile_test_item(test)?,
            }
        }

        match mode {
            CompileMode::Script if has_main => {
                let idx = self.name_const("main")?;
                self.emit_global_op(Opcode::GetGlobal, Opcode::GetGlobal16, idx);
                self.emit_op(Opcode::Call);
                self.emit_byte(0);
                self.emit_op(Opcode::Return);
            }
            _ => {
                self.emit_op(Opcode::Unit);
                self.emit_op(Opcode::Return);
            }
        }

        let fc = match self.stack.pop() {
            Some(fc) => fc,
            None => unreachable!("script compiler present"),
        };
        let mut chunk = fc.chunk;
        if mode == CompileMode::Module {
            chunk.has_exports = !chunk.export_names.is_empty();
        }
        Ok(Arc::new(chunk))
    }

    fn collect_declarations(&mut self, program: &Program) {
        for item in &program.items {
            match item {
                Item::Struct(decl) => {
                    self.structs.insert(decl.name.clone(), decl.fields.clone());
                }
                Item::Enum(decl) => {
                    self.enums
                        .insert(decl.name.clone(), decl.variants.iter().cloned().collect());
                }
                Item::Trait(decl) => {
                    self.traits.insert(decl.name.clone(), decl.clone());
                }
                Item::Stmt(_) | Item::Function(_) | Item::Impl(_) | Item::Test(_) => {}
            }
        }
    }

    pub(crate) fn emit_global_op(&mut self, short: Opcode, long: Opcode, idx: u16) {
        if idx <= u8::MAX as u16 {
            self.emit_op(short);
            self.emit_byte(idx as u8);
        } else {
            self.emit_op(long);
            self.emit_u16(idx);
        }
    }

    // --- items ---

    fn compile_fn_item(&mut self, decl: &FnDecl, global_name: &str, mode: CompileMode) -> CResult {
        self.set_line(decl.line);
        self.compile_closure_value(decl, FnKind::Function)?;
        let idx = self.name_const(global_name)?;
        self.emit_global_op(Opcode::DefineGlobal, Opcode::DefineGlobal16, idx);
        if decl.exported && mode == CompileMode::Module {
            self.fc_mut().chunk.export_names.push(global_name.to_string());
        }
        Ok(())
    }

    fn compile_struct_decl(&mut self, decl: &StructDecl, mode: CompileMode) -> CResult {
        // Declarations are compile-time: the table was filled by the
        // pre-pass; exported structs only surface in the export list.
        if decl.exported && mode == CompileMode::Module {
            self.fc_mut().chunk.export_names.push(decl.name.clone());
        }
        Ok(())
    }

    fn compile_enum_decl(&mut self, decl: &EnumDecl, mode: CompileMode) -> CResult {
        if decl.exported && mode == CompileMode::Module {
            self.fc_mut().chunk.export_names.push(decl.name.clone());
        }
        Ok(())
    }

    fn compile_impl_block(&mut self, block: &ImplBlock) -> CResult {
        self.set_line(block.line);
        let mut methods: Vec<FnDecl> = block.methods.clone();
        if let Some(trait_name) = &block.trait_name {
            let decl = self.traits.get(trait_name).cloned().ok_or_else(|| {
                self.error(
                    CompileErrorKind::Internal,
                    format!("impl of unknown trait '{}'", trait_name),
                )
            })?;
            for required in &decl.required {
                let provided = methods.iter().any(|m| &m.name == required)
                    || decl.defaults.iter().any(|d| &d.name == required);
                if !provided {
                    return Err(self.error(
                        CompileErrorKind::Internal,
                        format!(
                            "impl {} for {} is missing method '{}'",
                            trait_name, block.type_name, required
                        ),
                    ));
                }
            }
            // Default methods are copied into impls that omit them.
            for default in &decl.defaults {
                if !methods.iter().any(|m| m.name == default.name) {
                    methods.push(default.clone());
                }
            }
        }
        for method in &methods {
            self.set_line(method.line);
            self.compile_closure_value(method, FnKind::Method)?;
            let qualified = format!("{}::{}", block.type_name, method.name);
            let idx = self.name_const(&qualified)?;
            self.emit_global_op(Opcode::DefineGlobal, Opcode::DefineGlobal16, idx);
        }
        Ok(())
    }

    fn compile_test_item(&mut self, test: &TestDecl) -> CResult {
        self.set_line(test.line);
        let decl = FnDecl::new(format!("test:{}", test.name), Vec::new(), test.body.clone());
        self.compile_closure_value(&decl, FnKind::Function)?;
        let global = format!("test:{}", test.name);
        let idx = self.name_const(&global)?;
        self.emit_global_op(Opcode::DefineGlobal, Opcode::DefineGlobal16, idx);
        self.fc_mut().chunk.export_names.push(global);
        Ok(())
    }

    // --- function bodies ---

    /// Compile a function declaration into a prototype constant and emit
    /// the CLOSURE instruction that captures its upvalues.
    pub(crate) fn compile_closure_value(&mut self, decl: &FnDecl, kind: FnKind) -> CResult {
        let fixed_arity = decl.params.len();
        if fixed_arity > u8::MAX as usize {
            return Err(self.error(CompileErrorKind::TooManyLocals, "too many parameters"));
        }

        self.stack
            .push(FnCompiler::new(kind, Some(decl.name.clone())));
        self.fc_mut().line = decl.line;
        self.fc_mut().ensures = decl.ensures.clone();
        self.fc_mut().return_type = decl.return_type.clone();

        // Slot 0: the callee for plain functions (enabling recursion by
        // name), `self` for methods.
        match kind {
            FnKind::Method => {
                self.declare_local("self")?;
            }
            FnKind::Function | FnKind::Script => {
                let name = decl.name.clone();
                self.declare_local(&name)?;
            }
        }

        // Parameters: phases, defaults, type contracts.
        let mut param_phases = Vec::with_capacity(fixed_arity);
        let mut defaults_started = false;
        for param in &decl.params {
            self.declare_local(&param.name)?;
            param_phases.push(param.phase.unwrap_or(Phase::Unphased));
            match &param.default {
                Some(default_expr) => {
                    defaults_started = true;
                    let value = fold::literal_value(default_expr).ok_or_else(|| {
                        self.error(
                            CompileErrorKind::Internal,
                            format!("default for '{}' must be a literal", param.name),
                        )
                    })?;
                    self.fc_mut().chunk.default_values.push(value);
                }
                None if defaults_started => {
                    return Err(self.error(
                        CompileErrorKind::Internal,
                        "parameters with defaults must be trailing",
                    ));
                }
                None => {}
            }
        }
        if let Some(rest) = &decl.variadic {
            let rest = rest.clone();
            self.declare_local(&rest)?;
            self.fc_mut().chunk.fn_has_variadic = true;
        }
        self.fc_mut().chunk.param_phases = param_phases;

        for (i, param) in decl.params.iter().enumerate() {
            if let Some(type_name) = &param.type_name {
                let slot = (i + 1) as u8;
                let type_idx = self.name_const(type_name)?;
                let msg = format!(
                    "require failed in '{}': parameter '{}' must be {}",
                    decl.name, param.name, type_name
                );
                let msg_idx = self.name_const(&msg)?;
                self.emit_op(Opcode::CheckType);
                self.emit_byte(slot);
                self.emit_u16(type_idx);
                self.emit_u16(msg_idx);
            }
        }

        // Preconditions.
        for require in &decl.requires {
            self.set_line(require.line);
            self.compile_expr(&require.condition)?;
            let ok = self.emit_jump(Opcode::JumpIfTrue);
            let msg = format!("require failed in '{}': {}", decl.name, require.message);
            self.emit_constant_value(LatValue::string(msg))?;
            self.emit_op(Opcode::Throw);
            self.patch_jump(ok)?;
        }

        for stmt in &decl.body {
            self.compile_stmt(stmt)?;
        }

        // Implicit return of unit.
        self.emit_op(Opcode::Unit);
        self.emit_return_checks()?;
        self.emit_op(Opcode::Return);

        let fc = match self.stack.pop() {
            Some(fc) => fc,
            None => unreachable!("function compiler present"),
        };
        let upvalues = fc.upvalues.clone();
        let proto = Arc::new(FnProto {
            name: Some(decl.name.clone()),
            arity: fixed_arity as u8,
            upvalue_count: upvalues.len() as u8,
            chunk: Arc::new(fc.chunk),
        });

        let idx = self.make_constant(LatValue::function(proto))?;
        self.emit_op(Opcode::Closure);
        self.emit_u16(idx);
        self.emit_byte(upvalues.len() as u8);
        for up in upvalues {
            self.emit_byte(up.is_local as u8);
            self.emit_byte(up.index);
        }
        Ok(())
    }

    /// `ensure` contracts plus the return-type check, applied to the
    /// result on TOS. Emitted before every RETURN.
    pub(crate) fn emit_return_checks(&mut self) -> CResult {
        if self.fc().kind == FnKind::Script {
            return Ok(());
        }
        let ensures = self.fc().ensures.clone();
        let fn_name = self
            .fc()
            .fn_name
            .clone()
            .unwrap_or_else(|| "<fn>".to_string());
        for ensure in &ensures {
            self.set_line(ensure.line);
            // [result] -> apply a one-parameter closure to a copy
            self.emit_op(Opcode::Dup);
            let check = FnDecl::new(
                format!("ensure:{}", fn_name),
                vec![Param::plain("result")],
                vec![Stmt::Return {
                    value: Some(ensure.condition.clone()),
                    line: ensure.line,
                }],
            );
            self.compile_closure_value(&check, FnKind::Function)?;
            self.emit_op(Opcode::Swap);
            self.emit_op(Opcode::Call);
            self.emit_byte(1);
            let ok = self.emit_jump(Opcode::JumpIfTrue);
            let msg = format!("ensure failed in '{}': {}", fn_name, ensure.message);
            self.emit_constant_value(LatValue::string(msg))?;
            self.emit_op(Opcode::Throw);
            self.patch_jump(ok)?;
        }
        if let Some(return_type) = self.fc().return_type.clone() {
            let type_idx = self.name_const(&return_type)?;
            let msg = format!(
                "ensure failed in '{}': return value must be {}",
                fn_name, return_type
            );
            let msg_idx = self.name_const(&msg)?;
            self.emit_op(Opcode::CheckReturnType);
            self.emit_u16(type_idx);
            self.emit_u16(msg_idx);
        }
        Ok(())
    }

    /// Compile a block in expression position, leaving its value on the
    /// stack. A pure-expression block compiles inline; a block with
    /// statements becomes an immediately-invoked closure so its locals
    /// get clean slots regardless of outstanding temporaries.
    pub(crate) fn compile_block_value(&mut self, block: &Block) -> CResult {
        if block.stmts.is_empty() {
            match &block.value {
                Some(expr) => self.compile_expr(expr)?,
                None => self.emit_op(Opcode::Unit),
            }
            return Ok(());
        }
        self.compile_block_closure(block, None, "block")?;
        self.emit_op(Opcode::Call);
        self.emit_byte(0);
        Ok(())
    }

    /// Compile a block as the body of a zero- or one-parameter closure
    /// (scope spawns, select arms). Returns the prototype constant idx.
    pub(crate) fn compile_block_closure(
        &mut self,
        block: &Block,
        param: Option<&str>,
        name: &str,
    ) -> CResult<u16> {
        let mut params = Vec::new();
        if let Some(p) = param {
            params.push(Param::plain(p));
        }
        let mut body = block.stmts.clone();
        let line = self.line();
        match &block.value {
            Some(expr) => body.push(Stmt::Return {
                value: Some((**expr).clone()),
                line,
            }),
            None => {}
        }
        let decl = FnDecl::new(name, params, body);
        self.compile_closure_value(&decl, FnKind::Function)?;
        // The prototype is the constant added last (by compile_closure_value).
        let idx = (self.fc().chunk.constants.len() - 1) as u16;
        Ok(idx)
    }
}

/// What the chunk is being compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileMode {
    /// Script execution: auto-invoke `main()` when defined
    Script,
    /// Module: no auto-call, exports preserved
    Module,
    /// REPL: the last bare expression's value is the result
    Repl,
}

fn script_name(mode: CompileMode) -> String {
    match mode {
        CompileMode::Script => "script".to_string(),
        CompileMode::Module => "module".to_string(),
        CompileMode::Repl => "repl".to_string(),
    }
}
