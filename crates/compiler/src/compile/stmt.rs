//! Statement lowering

use super::{CResult, Compiler, FnKind, LoopCtx};
use crate::ast::*;
use crate::compile::expr::StorageRef;
use lattice_core::error::CompileErrorKind;
use lattice_core::opcode::Opcode;

impl Compiler<'_> {
    pub(crate) fn compile_stmt(&mut self, stmt: &Stmt) -> CResult {
        self.set_line(stmt.line());
        match stmt {
            Stmt::Let { name, value, .. } => {
                self.compile_expr(value)?;
                let top_level =
                    self.fc().kind == FnKind::Script && self.fc().scope_depth == 0;
                if top_level {
                    let idx = self.name_const(name)?;
                    self.emit_global_op(Opcode::DefineGlobal, Opcode::DefineGlobal16, idx);
                } else {
                    // The value on the stack becomes the local's slot.
                    self.declare_local(name)?;
                }
            }
            Stmt::Assign { target, value, .. } => self.compile_assign(target, value)?,
            Stmt::Expr { expr, .. } => {
                self.compile_expr(expr)?;
                self.emit_op(Opcode::Pop);
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
                ..
            } => {
                self.compile_expr(cond)?;
                let else_site = self.emit_jump(Opcode::JumpIfFalse);
                self.begin_scope();
                for s in then_body {
                    self.compile_stmt(s)?;
                }
                self.end_scope();
                let end_site = self.emit_jump(Opcode::Jump);
                self.patch_jump(else_site)?;
                if let Some(else_body) = else_body {
                    self.begin_scope();
                    for s in else_body {
                        self.compile_stmt(s)?;
                    }
                    self.end_scope();
                }
                self.patch_jump(end_site)?;
            }
            Stmt::While { cond, body, .. } => {
                let start = self.fc().chunk.code.len();
                let ctx = LoopCtx {
                    start,
                    is_for: false,
                    break_sites: Vec::new(),
                    continue_sites: Vec::new(),
                    local_floor: self.fc().locals.len(),
                    depth: self.fc().scope_depth,
                };
                self.fc_mut().loops.push(ctx);
                self.compile_expr(cond)?;
                let exit = self.emit_jump(Opcode::JumpIfFalse);
                self.begin_scope();
                for s in body {
                    self.compile_stmt(s)?;
                }
                self.end_scope();
                self.emit_loop(start)?;
                self.patch_jump(exit)?;
                self.finish_loop()?;
            }
            Stmt::ForIn {
                var,
                iterable,
                body,
                ..
            } => {
                self.begin_scope();
                self.compile_expr(iterable)?;
                let iter_slot = self.declare_local("")?;
                self.emit_int(0)?;
                let index_slot = self.declare_local("")?;

                let start = self.fc().chunk.code.len();
                let ctx = LoopCtx {
                    start,
                    is_for: true,
                    break_sites: Vec::new(),
                    continue_sites: Vec::new(),
                    local_floor: self.fc().locals.len(),
                    depth: self.fc().scope_depth,
                };
                self.fc_mut().loops.push(ctx);

                // index < len(iterable)
                self.emit_op(Opcode::GetLocal);
                self.emit_byte(index_slot);
                self.emit_op(Opcode::GetLocal);
                self.emit_byte(iter_slot);
                let len_idx = self.name_const("len")?;
                self.emit_op(Opcode::InvokeGlobal);
                self.emit_u16(len_idx);
                self.emit_byte(1);
                self.emit_op(Opcode::Lt);
                let exit = self.emit_jump(Opcode::JumpIfFalse);

                self.begin_scope();
                self.emit_op(Opcode::GetLocal);
                self.emit_byte(iter_slot);
                self.emit_op(Opcode::GetLocal);
                self.emit_byte(index_slot);
                self.emit_op(Opcode::Index);
                self.declare_local(var)?;
                for s in body {
                    self.compile_stmt(s)?;
                }
                self.end_scope();

                // continue lands on the increment
                let continue_target = self.fc().chunk.code.len();
                let sites = match self.fc_mut().loops.last_mut() {
                    Some(ctx) => std::mem::take(&mut ctx.continue_sites),
                    None => Vec::new(),
                };
                for site in sites {
                    let dist = continue_target - site - 2;
                    if dist > u16::MAX as usize {
                        return Err(self
                            .error(CompileErrorKind::JumpTooLarge, "jump distance overflow"));
                    }
                    self.fc_mut().chunk.patch_u16(site, dist as u16);
                }
                self.emit_op(Opcode::IncLocal);
                self.emit_byte(index_slot);
                self.emit_loop(start)?;
                self.patch_jump(exit)?;
                self.finish_loop()?;
                self.end_scope();
            }
            Stmt::Break { .. } => {
                let (floor, depth) = match self.fc().loops.last() {
                    Some(ctx) => (ctx.local_floor, ctx.depth),
                    None => {
                        return Err(self.error(
                            CompileErrorKind::LoopControlOutsideLoop,
                            "break outside of a loop",
                        ))
                    }
                };
                if self.has_any_defer() {
                    self.emit_op(Opcode::DeferRun);
                    self.emit_byte(depth + 1);
                }
                self.emit_scope_unwind(floor);
                let site = self.emit_jump(Opcode::Jump);
                match self.fc_mut().loops.last_mut() {
                    Some(ctx) => ctx.break_sites.push(site),
                    None => {}
                }
            }
            Stmt::Continue { .. } => {
                let (floor, depth, start, is_for) = match self.fc().loops.last() {
                    Some(ctx) => (ctx.local_floor, ctx.depth, ctx.start, ctx.is_for),
                    None => {
                        return Err(self.error(
                            CompileErrorKind::LoopControlOutsideLoop,
                            "continue outside of a loop",
                        ))
                    }
                };
                if self.has_any_defer() {
                    self.emit_op(Opcode::DeferRun);
                    self.emit_byte(depth + 1);
                }
                self.emit_scope_unwind(floor);
                if is_for {
                    let site = self.emit_jump(Opcode::Jump);
                    match self.fc_mut().loops.last_mut() {
                        Some(ctx) => ctx.continue_sites.push(site),
                        None => {}
                    }
                } else {
                    self.emit_loop(start)?;
                }
            }
            Stmt::Return { value, .. } => {
                match value {
                    Some(expr) => self.compile_expr(expr)?,
                    None => self.emit_op(Opcode::Unit),
                }
                self.emit_return_checks()?;
                self.emit_op(Opcode::Return);
            }
            Stmt::Throw { value, .. } => {
                self.compile_expr(value)?;
                self.emit_op(Opcode::Throw);
            }
            Stmt::Defer { body, .. } => {
                self.mark_defer_in_scope();
                let depth = self.fc().scope_depth;
                self.emit_op(Opcode::DeferPush);
                self.emit_byte(depth);
                let span_site = {
                    self.emit_u16(0xffff);
                    self.fc().chunk.code.len() - 2
                };
                // The deferred span: run the body as its own closure so
                // defer-local variables get a clean frame, then finish
                // the span with RETURN.
                let block = Block::of_stmts(body.clone());
                self.compile_block_closure(&block, None, "defer")?;
                self.emit_op(Opcode::Call);
                self.emit_byte(0);
                self.emit_op(Opcode::Return);
                self.patch_jump(span_site)?;
            }
            Stmt::TryCatch {
                body,
                catch_var,
                catch_body,
                ..
            } => {
                let handler_site = {
                    self.emit_op(Opcode::PushExceptionHandler);
                    self.emit_u16(0xffff);
                    self.fc().chunk.code.len() - 2
                };
                self.begin_scope();
                for s in body {
                    self.compile_stmt(s)?;
                }
                self.end_scope();
                self.emit_op(Opcode::PopExceptionHandler);
                let end_site = self.emit_jump(Opcode::Jump);
                // Catch: the VM restores the watermark and pushes the
                // thrown value, which becomes the catch binding's slot.
                self.patch_jump(handler_site)?;
                self.begin_scope();
                self.declare_local(catch_var)?;
                for s in catch_body {
                    self.compile_stmt(s)?;
                }
                self.end_scope();
                self.patch_jump(end_site)?;
            }
            Stmt::Import { module, .. } => {
                let idx = self.name_const(module)?;
                self.emit_op(Opcode::Import);
                self.emit_u16(idx);
            }
        }
        Ok(())
    }

    /// Emit pops (closing captured slots) for every local above `floor`
    /// without touching the compiler's bookkeeping; used by break and
    /// continue, which jump out of scopes that are still open.
    fn emit_scope_unwind(&mut self, floor: usize) {
        for i in (floor..self.fc().locals.len()).rev() {
            if self.fc().locals[i].is_captured {
                self.emit_op(Opcode::CloseUpvalue);
            } else {
                self.emit_op(Opcode::Pop);
            }
        }
    }

    fn finish_loop(&mut self) -> CResult {
        let ctx = match self.fc_mut().loops.pop() {
            Some(ctx) => ctx,
            None => return Ok(()),
        };
        for site in ctx.break_sites {
            self.patch_jump(site)?;
        }
        Ok(())
    }

    fn compile_assign(&mut self, target: &AssignTarget, value: &Expr) -> CResult {
        match target {
            AssignTarget::Name(name) => {
                if let Some(slot) = self.resolve_local(name) {
                    if self.emit_local_fast_path(name, slot, value)? {
                        return Ok(());
                    }
                    self.compile_expr(value)?;
                    self.emit_op(Opcode::SetLocalPop);
                    self.emit_byte(slot);
                    return Ok(());
                }
                self.compile_expr(value)?;
                match self.resolve_storage(name)? {
                    StorageRef::Local(_) => unreachable!("handled above"),
                    storage => {
                        self.emit_storage_write_keep(storage);
                        self.emit_op(Opcode::Pop);
                    }
                }
            }
            AssignTarget::Index { target, index } => {
                let local = match target {
                    Expr::Ident(name) => self.resolve_local(name),
                    _ => None,
                };
                match local {
                    Some(slot) => {
                        self.compile_expr(index)?;
                        self.compile_expr(value)?;
                        self.emit_op(Opcode::SetIndexLocal);
                        self.emit_byte(slot);
                    }
                    None => {
                        self.compile_expr(target)?;
                        self.compile_expr(index)?;
                        self.compile_expr(value)?;
                        self.emit_op(Opcode::SetIndex);
                        self.emit_op(Opcode::Pop);
                    }
                }
            }
            AssignTarget::Field { target, field } => {
                self.compile_expr(target)?;
                self.compile_expr(value)?;
                let idx = self.name_const(field)?;
                self.emit_op(Opcode::SetField);
                self.emit_u16(idx);
                self.emit_op(Opcode::Pop);
            }
            AssignTarget::Slice { target, start, end } => {
                let slot = match target {
                    Expr::Ident(name) => self.resolve_local(name),
                    _ => None,
                };
                let slot = slot.ok_or_else(|| {
                    self.error(
                        CompileErrorKind::Internal,
                        "slice assignment target must be a local variable",
                    )
                })?;
                self.compile_expr(start)?;
                self.compile_expr(end)?;
                self.compile_expr(value)?;
                self.emit_op(Opcode::SetSliceLocal);
                self.emit_byte(slot);
            }
        }
        Ok(())
    }

    /// INC_LOCAL / DEC_LOCAL / APPEND_STR_LOCAL peepholes for
    /// `x = x + 1`, `x = x - 1`, `x = x + "..."`.
    fn emit_local_fast_path(&mut self, name: &str, slot: u8, value: &Expr) -> CResult<bool> {
        let (op, lhs, rhs) = match value {
            Expr::Binary { op, lhs, rhs } => (op, lhs, rhs),
            _ => return Ok(false),
        };
        let lhs_is_self = matches!(&**lhs, Expr::Ident(n) if n == name);
        if !lhs_is_self {
            return Ok(false);
        }
        match (op, &**rhs) {
            (BinaryOp::Add, Expr::Int(1)) => {
                self.emit_op(Opcode::IncLocal);
                self.emit_byte(slot);
                Ok(true)
            }
            (BinaryOp::Sub, Expr::Int(1)) => {
                self.emit_op(Opcode::DecLocal);
                self.emit_byte(slot);
                Ok(true)
            }
            (BinaryOp::Add, Expr::Str(s)) => {
                let suffix = s.clone();
                self.emit_constant_value(lattice_core::value::LatValue::string(suffix))?;
                self.emit_op(Opcode::AppendStrLocal);
                self.emit_byte(slot);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
