//! Expression lowering

use super::fold;
use super::{CResult, Compiler, FnKind};
use crate::ast::*;
use lattice_core::error::CompileErrorKind;
use lattice_core::opcode::{
    Opcode, LOC_GLOBAL, LOC_LOCAL, LOC_UPVALUE, SELECT_ARM_CHANNEL, SELECT_ARM_DEFAULT,
    SELECT_ARM_TIMEOUT,
};
use lattice_core::value::{LatValue, ValueKind};

/// A resolved storage class for reads, writes, and the `*_VAR` phase
/// opcodes.
#[derive(Debug, Clone, Copy)]
pub(crate) enum StorageRef {
    Local(u8),
    Upvalue(u8),
    Global(u16),
}

impl StorageRef {
    pub(crate) fn operands(self) -> (u8, u16) {
        match self {
            StorageRef::Local(slot) => (LOC_LOCAL, slot as u16),
            StorageRef::Upvalue(idx) => (LOC_UPVALUE, idx as u16),
            StorageRef::Global(name) => (LOC_GLOBAL, name),
        }
    }
}

impl Compiler<'_> {
    pub(crate) fn compile_expr(&mut self, expr: &Expr) -> CResult {
        if self.config.fold_constants
            && matches!(expr, Expr::Binary { .. } | Expr::Unary { .. })
        {
            if let Some(value) = fold::fold(expr) {
                return self.emit_folded(value);
            }
        }
        match expr {
            Expr::Int(n) => self.emit_int(*n)?,
            Expr::Float(x) => self.emit_constant_value(LatValue::float(*x))?,
            Expr::Bool(true) => self.emit_op(Opcode::True),
            Expr::Bool(false) => self.emit_op(Opcode::False),
            Expr::Str(s) => self.emit_constant_value(LatValue::string(s.clone()))?,
            Expr::Unit => self.emit_op(Opcode::Unit),
            Expr::Nil => self.emit_op(Opcode::Nil),
            Expr::Ident(name) => {
                let storage = self.resolve_storage(name)?;
                self.emit_storage_read(storage);
            }
            Expr::Array(elems) => {
                for elem in elems {
                    self.compile_expr(elem)?;
                }
                self.emit_op(Opcode::BuildArray);
                self.emit_u16(elems.len() as u16);
            }
            Expr::Tuple(elems) => {
                if elems.len() > u8::MAX as usize {
                    return Err(
                        self.error(CompileErrorKind::Internal, "tuple too large")
                    );
                }
                for elem in elems {
                    self.compile_expr(elem)?;
                }
                self.emit_op(Opcode::BuildTuple);
                self.emit_byte(elems.len() as u8);
            }
            Expr::MapLit(pairs) => {
                for (key, value) in pairs {
                    self.compile_expr(key)?;
                    self.compile_expr(value)?;
                }
                self.emit_op(Opcode::BuildMap);
                self.emit_u16(pairs.len() as u16);
            }
            Expr::SetLit(elems) => {
                for elem in elems {
                    self.compile_expr(elem)?;
                }
                self.emit_op(Opcode::BuildSet);
                self.emit_u16(elems.len() as u16);
            }
            Expr::StructLit { name, fields } => self.compile_struct_lit(name, fields)?,
            Expr::EnumLit {
                enum_name,
                variant,
                payload,
            } => {
                if let Some(variants) = self.enums.get(enum_name) {
                    match variants.get(variant) {
                        Some(&arity) if arity != payload.len() => {
                            return Err(self.error(
                                CompileErrorKind::Internal,
                                format!(
                                    "{}::{} takes {} value(s), got {}",
                                    enum_name,
                                    variant,
                                    arity,
                                    payload.len()
                                ),
                            ));
                        }
                        None => {
                            return Err(self.error(
                                CompileErrorKind::Internal,
                                format!("{} has no variant {}", enum_name, variant),
                            ));
                        }
                        Some(_) => {}
                    }
                }
                for value in payload {
                    self.compile_expr(value)?;
                }
                let enum_idx = self.name_const(enum_name)?;
                let variant_idx = self.name_const(variant)?;
                self.emit_op(Opcode::BuildEnum);
                self.emit_u16(enum_idx);
                self.emit_u16(variant_idx);
                self.emit_byte(payload.len() as u8);
            }
            Expr::Range { start, end } => {
                self.compile_expr(start)?;
                self.compile_expr(end)?;
                self.emit_op(Opcode::BuildRange);
            }
            Expr::Binary { op, lhs, rhs } => {
                self.compile_expr(lhs)?;
                self.compile_expr(rhs)?;
                self.emit_op(binary_opcode(*op));
            }
            Expr::Unary { op, operand } => {
                self.compile_expr(operand)?;
                self.emit_op(match op {
                    UnaryOp::Neg => Opcode::Neg,
                    UnaryOp::Not => Opcode::Not,
                    UnaryOp::BitNot => Opcode::BitNot,
                });
            }
            Expr::Logical { op, lhs, rhs } => self.compile_logical(*op, lhs, rhs)?,
            Expr::Call { callee, args } => self.compile_call(callee, args)?,
            Expr::MethodCall { recv, method, args } => {
                let local = match &**recv {
                    Expr::Ident(name) => self.resolve_local(name),
                    _ => None,
                };
                match local {
                    Some(slot) => {
                        for arg in args {
                            self.compile_expr(arg)?;
                        }
                        let name_idx = self.name_const(method)?;
                        self.emit_op(Opcode::InvokeLocal);
                        self.emit_byte(slot);
                        self.emit_u16(name_idx);
                        self.emit_byte(args.len() as u8);
                    }
                    None => {
                        self.compile_expr(recv)?;
                        for arg in args {
                            self.compile_expr(arg)?;
                        }
                        let name_idx = self.name_const(method)?;
                        self.emit_op(Opcode::Invoke);
                        self.emit_u16(name_idx);
                        self.emit_byte(args.len() as u8);
                    }
                }
            }
            Expr::Index { target, index } => {
                let local = match &**target {
                    Expr::Ident(name) => self.resolve_local(name),
                    _ => None,
                };
                match local {
                    Some(slot) => {
                        self.compile_expr(index)?;
                        self.emit_op(Opcode::IndexLocal);
                        self.emit_byte(slot);
                    }
                    None => {
                        self.compile_expr(target)?;
                        self.compile_expr(index)?;
                        self.emit_op(Opcode::Index);
                    }
                }
            }
            Expr::Field { target, field } => {
                let local = match &**target {
                    Expr::Ident(name) => self.resolve_local(name),
                    _ => None,
                };
                match local {
                    Some(slot) => {
                        let name_idx = self.name_const(field)?;
                        self.emit_op(Opcode::GetFieldLocal);
                        self.emit_byte(slot);
                        self.emit_u16(name_idx);
                    }
                    None => {
                        self.compile_expr(target)?;
                        let name_idx = self.name_const(field)?;
                        self.emit_op(Opcode::GetField);
                        self.emit_u16(name_idx);
                    }
                }
            }
            Expr::Closure {
                params,
                variadic,
                body,
            } => {
                let mut decl = FnDecl::new("closure", params.clone(), body.clone());
                decl.variadic = variadic.clone();
                decl.line = self.line();
                self.compile_closure_value(&decl, FnKind::Function)?;
            }
            Expr::IfElse {
                cond,
                then_block,
                else_block,
            } => {
                self.compile_expr(cond)?;
                let else_site = self.emit_jump(Opcode::JumpIfFalse);
                self.compile_block_value(then_block)?;
                let end_site = self.emit_jump(Opcode::Jump);
                self.patch_jump(else_site)?;
                self.compile_block_value(else_block)?;
                self.patch_jump(end_site)?;
            }
            Expr::Match { scrutinee, arms } => self.compile_match(scrutinee, arms)?,
            Expr::TryUnwrap(inner) => {
                self.compile_expr(inner)?;
                self.emit_op(Opcode::TryUnwrap);
            }
            Expr::Scope { spawns, sync } => self.compile_scope(spawns, sync)?,
            Expr::Select { arms } => self.compile_select(arms)?,
            Expr::Freeze { target, except } => self.compile_freeze(target, except)?,
            Expr::Thaw(target) => self.compile_thaw(target)?,
            Expr::Anneal { target, func } => self.compile_anneal(target, func)?,
            Expr::Crystallize { target, body } => {
                self.compile_phase_window(target, body, true)?
            }
            Expr::Borrow { target, body } => self.compile_phase_window(target, body, false)?,
            Expr::Forge { body } => {
                self.compile_block_value(body)?;
                self.emit_op(Opcode::Freeze);
            }
            Expr::Sublimate(inner) => {
                self.compile_expr(inner)?;
                self.emit_op(Opcode::Sublimate);
            }
            Expr::CloneExpr(inner) => {
                self.compile_expr(inner)?;
                self.emit_op(Opcode::CloneValue);
            }
            Expr::IsCrystal(inner) => {
                self.compile_expr(inner)?;
                self.emit_op(Opcode::IsCrystal);
            }
            Expr::IsFluid(inner) => {
                self.compile_expr(inner)?;
                self.emit_op(Opcode::IsFluid);
            }
        }
        Ok(())
    }

    fn emit_folded(&mut self, value: LatValue) -> CResult {
        match value.kind {
            ValueKind::Bool(true) => {
                self.emit_op(Opcode::True);
                Ok(())
            }
            ValueKind::Bool(false) => {
                self.emit_op(Opcode::False);
                Ok(())
            }
            ValueKind::Nil => {
                self.emit_op(Opcode::Nil);
                Ok(())
            }
            ValueKind::Unit => {
                self.emit_op(Opcode::Unit);
                Ok(())
            }
            // Folded results (including small ints) go through the
            // constant pool so the fold is visible in the chunk.
            _ => self.emit_constant_value(value),
        }
    }

    // --- storage ---

    pub(crate) fn resolve_storage(&mut self, name: &str) -> CResult<StorageRef> {
        if let Some(slot) = self.resolve_local(name) {
            return Ok(StorageRef::Local(slot));
        }
        if let Some(idx) = self.resolve_upvalue(name)? {
            return Ok(StorageRef::Upvalue(idx));
        }
        let idx = self.name_const(name)?;
        Ok(StorageRef::Global(idx))
    }

    pub(crate) fn emit_storage_read(&mut self, storage: StorageRef) {
        match storage {
            StorageRef::Local(slot) => {
                self.emit_op(Opcode::GetLocal);
                self.emit_byte(slot);
            }
            StorageRef::Upvalue(idx) => {
                self.emit_op(Opcode::GetUpvalue);
                self.emit_byte(idx);
            }
            StorageRef::Global(idx) => {
                self.emit_global_op(Opcode::GetGlobal, Opcode::GetGlobal16, idx);
            }
        }
    }

    /// Write TOS back to storage, keeping the value on the stack.
    pub(crate) fn emit_storage_write_keep(&mut self, storage: StorageRef) {
        match storage {
            StorageRef::Local(slot) => {
                self.emit_op(Opcode::SetLocal);
                self.emit_byte(slot);
            }
            StorageRef::Upvalue(idx) => {
                self.emit_op(Opcode::SetUpvalue);
                self.emit_byte(idx);
            }
            StorageRef::Global(idx) => {
                self.emit_global_op(Opcode::SetGlobal, Opcode::SetGlobal16, idx);
            }
        }
    }

    // --- specific forms ---

    fn compile_struct_lit(&mut self, name: &str, fields: &[(String, Expr)]) -> CResult {
        let ordered: Vec<(String, &Expr)> = match self.structs.get(name).cloned() {
            Some(declared) => {
                if declared.len() != fields.len() {
                    return Err(self.error(
                        CompileErrorKind::Internal,
                        format!(
                            "struct {} has {} field(s), literal supplies {}",
                            name,
                            declared.len(),
                            fields.len()
                        ),
                    ));
                }
                let mut ordered = Vec::with_capacity(declared.len());
                for field_name in &declared {
                    match fields.iter().find(|(n, _)| n == field_name) {
                        Some((_, value)) => ordered.push((field_name.clone(), value)),
                        None => {
                            return Err(self.error(
                                CompileErrorKind::Internal,
                                format!("struct {} literal is missing '{}'", name, field_name),
                            ));
                        }
                    }
                }
                ordered
            }
            None => fields.iter().map(|(n, v)| (n.clone(), v)).collect(),
        };
        for (_, value) in &ordered {
            self.compile_expr(value)?;
        }
        let name_idx = self.name_const(name)?;
        self.emit_op(Opcode::BuildStruct);
        self.emit_u16(name_idx);
        self.emit_byte(ordered.len() as u8);
        for (field_name, _) in &ordered {
            let idx = self.name_const(field_name)?;
            self.emit_u16(idx);
        }
        Ok(())
    }

    fn compile_logical(&mut self, op: LogicalOp, lhs: &Expr, rhs: &Expr) -> CResult {
        match op {
            LogicalOp::And => {
                self.compile_expr(lhs)?;
                self.emit_op(Opcode::Dup);
                let end = self.emit_jump(Opcode::JumpIfFalse);
                self.emit_op(Opcode::Pop);
                self.compile_expr(rhs)?;
                self.patch_jump(end)?;
            }
            LogicalOp::Or => {
                self.compile_expr(lhs)?;
                self.emit_op(Opcode::Dup);
                let end = self.emit_jump(Opcode::JumpIfTrue);
                self.emit_op(Opcode::Pop);
                self.compile_expr(rhs)?;
                self.patch_jump(end)?;
            }
            LogicalOp::NilCoalesce => {
                self.compile_expr(lhs)?;
                let end = self.emit_jump(Opcode::JumpIfNotNil);
                self.compile_expr(rhs)?;
                self.patch_jump(end)?;
            }
        }
        Ok(())
    }

    fn compile_call(&mut self, callee: &Expr, args: &[Expr]) -> CResult {
        if let Expr::Ident(name) = callee {
            let is_local = self.resolve_local(name).is_some();
            let is_upvalue = !is_local && self.resolve_upvalue(name)?.is_some();
            if !is_local && !is_upvalue {
                // Builtins and global functions dispatch by name.
                for arg in args {
                    self.compile_expr(arg)?;
                }
                let name_idx = self.name_const(name)?;
                self.emit_op(Opcode::InvokeGlobal);
                self.emit_u16(name_idx);
                self.emit_byte(args.len() as u8);
                return Ok(());
            }
        }
        self.compile_expr(callee)?;
        for arg in args {
            self.compile_expr(arg)?;
        }
        self.emit_op(Opcode::Call);
        self.emit_byte(args.len() as u8);
        Ok(())
    }

    fn compile_scope(&mut self, spawns: &[Block], sync: &Block) -> CResult {
        if spawns.len() > u8::MAX as usize {
            return Err(self.error(CompileErrorKind::Internal, "too many spawns in scope"));
        }
        let sync_idx = self.compile_block_closure(sync, None, "scope:sync")?;
        let mut spawn_idxs = Vec::with_capacity(spawns.len());
        for (i, spawn) in spawns.iter().enumerate() {
            let idx = self.compile_block_closure(spawn, None, &format!("scope:spawn{}", i))?;
            spawn_idxs.push(idx);
        }
        self.emit_op(Opcode::Scope);
        self.emit_byte(spawns.len() as u8);
        self.emit_u16(sync_idx);
        for idx in spawn_idxs {
            self.emit_u16(idx);
        }
        Ok(())
    }

    fn compile_select(&mut self, arms: &[SelectArm]) -> CResult {
        if arms.is_empty() || arms.len() > u8::MAX as usize {
            return Err(self.error(
                CompileErrorKind::Internal,
                "select needs between 1 and 255 arms",
            ));
        }
        let mut metas = Vec::with_capacity(arms.len());
        for (i, arm) in arms.iter().enumerate() {
            self.set_line(arm.line);
            let (kind, expr_idx) = match &arm.kind {
                SelectArmKind::Recv(chan_expr) => {
                    let idx = self.compile_block_closure(
                        &Block::of_expr(chan_expr.clone()),
                        None,
                        &format!("select:chan{}", i),
                    )?;
                    (SELECT_ARM_CHANNEL, idx)
                }
                SelectArmKind::Timeout(ms_expr) => {
                    let idx = self.compile_block_closure(
                        &Block::of_expr(ms_expr.clone()),
                        None,
                        &format!("select:timeout{}", i),
                    )?;
                    (SELECT_ARM_TIMEOUT, idx)
                }
                SelectArmKind::Default => {
                    self.emit_op(Opcode::Nil);
                    (SELECT_ARM_DEFAULT, u16::MAX)
                }
            };
            let body_idx = self.compile_block_closure(
                &arm.body,
                arm.binding.as_deref(),
                &format!("select:body{}", i),
            )?;
            metas.push((kind, arm.binding.is_some(), expr_idx, body_idx));
        }
        self.emit_op(Opcode::Select);
        self.emit_byte(arms.len() as u8);
        for (kind, has_binding, expr_idx, body_idx) in metas {
            self.emit_byte(kind);
            self.emit_byte(has_binding as u8);
            self.emit_u16(expr_idx);
            self.emit_u16(body_idx);
        }
        Ok(())
    }

    fn compile_freeze(&mut self, target: &PhaseTarget, except: &[String]) -> CResult {
        match target {
            PhaseTarget::Var(name) => {
                let storage = self.resolve_storage(name)?;
                let (loc_type, operand) = storage.operands();
                if except.is_empty() {
                    self.emit_op(Opcode::FreezeVar);
                    self.emit_byte(loc_type);
                    self.emit_u16(operand);
                } else {
                    let name_idxs: Vec<u16> = except
                        .iter()
                        .map(|n| self.name_const(n))
                        .collect::<CResult<_>>()?;
                    self.emit_op(Opcode::FreezeExcept);
                    self.emit_byte(loc_type);
                    self.emit_u16(operand);
                    self.emit_byte(name_idxs.len() as u8);
                    for idx in name_idxs {
                        self.emit_u16(idx);
                    }
                }
            }
            PhaseTarget::Field { object, field } => {
                let storage = self.resolve_storage(object)?;
                let (loc_type, operand) = storage.operands();
                let field_idx = self.name_const(field)?;
                self.emit_op(Opcode::FreezeField);
                self.emit_byte(loc_type);
                self.emit_u16(operand);
                self.emit_u16(field_idx);
            }
            PhaseTarget::Value(expr) => {
                if !except.is_empty() {
                    return Err(self.error(
                        CompileErrorKind::Internal,
                        "freeze-except needs a named target",
                    ));
                }
                self.compile_expr(expr)?;
                self.emit_op(Opcode::Freeze);
            }
        }
        Ok(())
    }

    fn compile_thaw(&mut self, target: &PhaseTarget) -> CResult {
        match target {
            PhaseTarget::Var(name) => {
                let storage = self.resolve_storage(name)?;
                let (loc_type, operand) = storage.operands();
                self.emit_op(Opcode::ThawVar);
                self.emit_byte(loc_type);
                self.emit_u16(operand);
            }
            PhaseTarget::Field { .. } => {
                return Err(self.error(
                    CompileErrorKind::Internal,
                    "thaw applies to variables and values, not single fields",
                ));
            }
            PhaseTarget::Value(expr) => {
                self.compile_expr(expr)?;
                self.emit_op(Opcode::Thaw);
            }
        }
        Ok(())
    }

    fn compile_anneal(&mut self, target: &Expr, func: &Expr) -> CResult {
        self.compile_expr(target)?;
        self.compile_expr(func)?;
        let name_idx = self.name_const("anneal")?;
        self.emit_op(Opcode::InvokeGlobal);
        self.emit_u16(name_idx);
        self.emit_byte(2);
        if let Expr::Ident(name) = target {
            let storage = self.resolve_storage(name)?;
            self.emit_storage_write_keep(storage);
        }
        Ok(())
    }

    /// `crystallize(x) { body }` and `borrow(x) { body }`: flip the
    /// target's phase around the body, restoring it afterwards unless it
    /// already had the window's phase at entry. Pure stack juggling: the
    /// entry-phase flag rides beneath the body result.
    fn compile_phase_window(
        &mut self,
        target: &str,
        body: &Block,
        to_crystal: bool,
    ) -> CResult {
        let storage = self.resolve_storage(target)?;
        let (loc_type, operand) = storage.operands();
        let (test_op, enter_op, leave_op) = if to_crystal {
            (Opcode::IsCrystal, Opcode::FreezeVar, Opcode::ThawVar)
        } else {
            (Opcode::IsFluid, Opcode::ThawVar, Opcode::FreezeVar)
        };

        // Did the target already have the window's phase?
        self.emit_storage_read(storage);
        self.emit_op(test_op);

        self.emit_op(enter_op);
        self.emit_byte(loc_type);
        self.emit_u16(operand);
        self.emit_op(Opcode::Pop);

        // [flag] -> [flag, result]
        self.compile_block_value(body)?;

        // [flag, result] -> [result]; restore the phase unless the flag
        // says the window was a no-op at entry.
        self.emit_op(Opcode::Swap);
        let skip = self.emit_jump(Opcode::JumpIfTrue);
        self.emit_op(leave_op);
        self.emit_byte(loc_type);
        self.emit_u16(operand);
        self.emit_op(Opcode::Pop);
        self.patch_jump(skip)?;
        Ok(())
    }
}

fn binary_opcode(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Add => Opcode::Add,
        BinaryOp::Sub => Opcode::Sub,
        BinaryOp::Mul => Opcode::Mul,
        BinaryOp::Div => Opcode::Div,
        BinaryOp::Mod => Opcode::Mod,
        BinaryOp::Eq => Opcode::Eq,
        BinaryOp::Neq => Opcode::Neq,
        BinaryOp::Lt => Opcode::Lt,
        BinaryOp::Gt => Opcode::Gt,
        BinaryOp::LtEq => Opcode::LtEq,
        BinaryOp::GtEq => Opcode::GtEq,
        BinaryOp::BitAnd => Opcode::BitAnd,
        BinaryOp::BitOr => Opcode::BitOr,
        BinaryOp::BitXor => Opcode::BitXor,
        BinaryOp::Shl => Opcode::Shl,
        BinaryOp::Shr => Opcode::Shr,
    }
}
