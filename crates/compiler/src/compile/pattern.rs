//! `match` lowering
//!
//! The whole match compiles as an immediately-invoked closure: the
//! scrutinee and arm bindings live in the closure's fresh frame, so
//! binding slots are clean no matter what temporaries surround the
//! match expression. Enclosing variables referenced by guards and arm
//! bodies are captured as upvalues by the usual resolution path.
//!
//! Each arm runs in two passes over its pattern:
//! 1. *tests*: every structural check runs first, reading sub-values
//!    through the scrutinee local (end-relative array indices go through
//!    an invoked `len` and subtraction). All failure jumps land after
//!    the arm with a uniform stack.
//! 2. *bindings*: only once every test has passed are binding locals
//!    declared, so guard-failure cleanup knows exactly what to pop.
//!
//! No arm matching leaves nil as the match result.

use super::{CResult, Compiler, FnCompiler, FnKind};
use crate::ast::{Expr, MatchArm, Pattern};
use lattice_core::chunk::FnProto;
use lattice_core::error::CompileErrorKind;
use lattice_core::opcode::Opcode;
use lattice_core::phase::Phase;
use lattice_core::value::LatValue;
use std::sync::Arc;

/// How to reach a sub-value of the scrutinee.
#[derive(Debug, Clone)]
enum Access {
    Index(i64),
    /// `len - k`, for elements after a rest pattern
    IndexFromEnd(i64),
    Field(String),
}

impl Compiler<'_> {
    pub(crate) fn compile_match(&mut self, scrutinee: &Expr, arms: &[MatchArm]) -> CResult {
        let line = self.line();
        self.stack
            .push(FnCompiler::new(FnKind::Function, Some("match".to_string())));
        self.fc_mut().line = line;
        self.declare_local("match")?;

        self.compile_expr(scrutinee)?;
        let scrut_slot = self.declare_local("")?;

        for arm in arms {
            self.set_line(arm.line);
            self.compile_arm(arm, scrut_slot)?;
        }
        // No arm matched.
        self.emit_op(Opcode::Nil);
        self.emit_op(Opcode::Return);

        let fc = match self.stack.pop() {
            Some(fc) => fc,
            None => unreachable!("match compiler present"),
        };
        let upvalues = fc.upvalues.clone();
        let proto = Arc::new(FnProto {
            name: Some("match".to_string()),
            arity: 0,
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
        self.emit_op(Opcode::Call);
        self.emit_byte(0);
        Ok(())
    }

    fn compile_arm(&mut self, arm: &MatchArm, scrut_slot: u8) -> CResult {
        let mut fail_sites = Vec::new();
        self.pattern_tests(&arm.pattern, scrut_slot, &[], &mut fail_sites)?;

        let bindings_floor = self.fc().locals.len();
        self.pattern_bindings(&arm.pattern, scrut_slot, &[])?;
        let binding_count = self.fc().locals.len() - bindings_floor;

        let mut guard_fail = None;
        if let Some(guard) = &arm.guard {
            self.compile_expr(guard)?;
            guard_fail = Some(self.emit_jump(Opcode::JumpIfFalse));
        }

        self.compile_expr(&arm.body)?;
        // RETURN pops the frame: bindings are cleaned up (and captured
        // ones closed) by the return path itself.
        self.emit_op(Opcode::Return);

        // Guard failure: drop the bindings, then fall through to the
        // next arm alongside the pre-binding failures.
        if let Some(site) = guard_fail {
            self.patch_jump(site)?;
            for i in (0..binding_count).rev() {
                let captured = self.fc().locals[bindings_floor + i].is_captured;
                if captured {
                    self.emit_op(Opcode::CloseUpvalue);
                } else {
                    self.emit_op(Opcode::Pop);
                }
            }
        }
        self.forget_scope_locals(bindings_floor);
        for site in fail_sites {
            self.patch_jump(site)?;
        }
        Ok(())
    }

    /// Push the sub-value at `path`, starting from the scrutinee local.
    fn emit_access(&mut self, scrut_slot: u8, path: &[Access]) -> CResult {
        self.emit_op(Opcode::GetLocal);
        self.emit_byte(scrut_slot);
        for step in path {
            match step {
                Access::Index(i) => {
                    self.emit_int(*i)?;
                    self.emit_op(Opcode::Index);
                }
                Access::IndexFromEnd(k) => {
                    // [container] -> [container, len - k] -> [element]
                    self.emit_op(Opcode::Dup);
                    let len_idx = self.name_const("len")?;
                    self.emit_op(Opcode::Invoke);
                    self.emit_u16(len_idx);
                    self.emit_byte(0);
                    self.emit_int(*k)?;
                    self.emit_op(Opcode::Sub);
                    self.emit_op(Opcode::Index);
                }
                Access::Field(name) => {
                    let idx = self.name_const(name)?;
                    self.emit_op(Opcode::GetField);
                    self.emit_u16(idx);
                }
            }
        }
        Ok(())
    }

    fn fail_if_false(&mut self, fail_sites: &mut Vec<usize>) {
        fail_sites.push(self.emit_jump(Opcode::JumpIfFalse));
    }

    fn pattern_tests(
        &mut self,
        pattern: &Pattern,
        scrut_slot: u8,
        path: &[Access],
        fail_sites: &mut Vec<usize>,
    ) -> CResult {
        match pattern {
            Pattern::Binding(_) => {}
            Pattern::Wildcard { phase } => match phase {
                None | Some(Phase::Unphased) => {}
                Some(Phase::Crystal) => {
                    self.emit_access(scrut_slot, path)?;
                    self.emit_op(Opcode::IsCrystal);
                    self.fail_if_false(fail_sites);
                }
                Some(Phase::Fluid) => {
                    self.emit_access(scrut_slot, path)?;
                    self.emit_op(Opcode::IsFluid);
                    self.fail_if_false(fail_sites);
                }
            },
            Pattern::Literal(lit) => {
                self.emit_access(scrut_slot, path)?;
                self.compile_expr(lit)?;
                self.emit_op(Opcode::Eq);
                self.fail_if_false(fail_sites);
            }
            Pattern::Range { start, end } => {
                self.emit_access(scrut_slot, path)?;
                self.emit_int(*start)?;
                self.emit_op(Opcode::GtEq);
                self.fail_if_false(fail_sites);
                self.emit_access(scrut_slot, path)?;
                self.emit_int(*end)?;
                self.emit_op(Opcode::Lt);
                self.fail_if_false(fail_sites);
            }
            Pattern::Array {
                prefix,
                rest,
                suffix,
            } => {
                if rest.is_none() && !suffix.is_empty() {
                    return Err(self.error(
                        CompileErrorKind::Internal,
                        "array pattern suffix requires a rest element",
                    ));
                }
                // Type check.
                self.emit_access(scrut_slot, path)?;
                let type_of = self.name_const("type_of")?;
                self.emit_op(Opcode::InvokeGlobal);
                self.emit_u16(type_of);
                self.emit_byte(1);
                self.emit_constant_value(LatValue::string("array"))?;
                self.emit_op(Opcode::Eq);
                self.fail_if_false(fail_sites);
                // Length check.
                let required = (prefix.len() + suffix.len()) as i64;
                self.emit_access(scrut_slot, path)?;
                let len = self.name_const("len")?;
                self.emit_op(Opcode::InvokeGlobal);
                self.emit_u16(len);
                self.emit_byte(1);
                self.emit_int(required)?;
                self.emit_op(if rest.is_some() {
                    Opcode::GtEq
                } else {
                    Opcode::Eq
                });
                self.fail_if_false(fail_sites);
                // Elements.
                for (i, sub) in prefix.iter().enumerate() {
                    let mut sub_path = path.to_vec();
                    sub_path.push(Access::Index(i as i64));
                    self.pattern_tests(sub, scrut_slot, &sub_path, fail_sites)?;
                }
                for (j, sub) in suffix.iter().enumerate() {
                    let mut sub_path = path.to_vec();
                    sub_path.push(Access::IndexFromEnd((suffix.len() - j) as i64));
                    self.pattern_tests(sub, scrut_slot, &sub_path, fail_sites)?;
                }
            }
            Pattern::Struct { name, fields } => {
                self.emit_access(scrut_slot, path)?;
                let shape_of = self.name_const("shape_of")?;
                self.emit_op(Opcode::InvokeGlobal);
                self.emit_u16(shape_of);
                self.emit_byte(1);
                self.emit_constant_value(LatValue::string(name.clone()))?;
                self.emit_op(Opcode::Eq);
                self.fail_if_false(fail_sites);
                for (field, sub) in fields {
                    let mut sub_path = path.to_vec();
                    sub_path.push(Access::Field(field.clone()));
                    self.pattern_tests(sub, scrut_slot, &sub_path, fail_sites)?;
                }
            }
        }
        Ok(())
    }

    fn pattern_bindings(
        &mut self,
        pattern: &Pattern,
        scrut_slot: u8,
        path: &[Access],
    ) -> CResult {
        match pattern {
            Pattern::Binding(name) => {
                self.emit_access(scrut_slot, path)?;
                let name = name.clone();
                self.declare_local(&name)?;
            }
            Pattern::Literal(_) | Pattern::Wildcard { .. } | Pattern::Range { .. } => {}
            Pattern::Array {
                prefix,
                rest,
                suffix,
            } => {
                for (i, sub) in prefix.iter().enumerate() {
                    let mut sub_path = path.to_vec();
                    sub_path.push(Access::Index(i as i64));
                    self.pattern_bindings(sub, scrut_slot, &sub_path)?;
                }
                if let Some(Some(rest_name)) = rest {
                    // rest = container[prefix.len() .. len - suffix.len()]
                    self.emit_access(scrut_slot, path)?;
                    self.emit_int(prefix.len() as i64)?;
                    self.emit_access(scrut_slot, path)?;
                    let len = self.name_const("len")?;
                    self.emit_op(Opcode::InvokeGlobal);
                    self.emit_u16(len);
                    self.emit_byte(1);
                    self.emit_int(suffix.len() as i64)?;
                    self.emit_op(Opcode::Sub);
                    self.emit_op(Opcode::BuildRange);
                    self.emit_op(Opcode::Index);
                    let rest_name = rest_name.clone();
                    self.declare_local(&rest_name)?;
                }
                for (j, sub) in suffix.iter().enumerate() {
                    let mut sub_path = path.to_vec();
                    sub_path.push(Access::IndexFromEnd((suffix.len() - j) as i64));
                    self.pattern_bindings(sub, scrut_slot, &sub_path)?;
                }
            }
            Pattern::Struct { fields, .. } => {
                for (field, sub) in fields {
                    let mut sub_path = path.to_vec();
                    sub_path.push(Access::Field(field.clone()));
                    self.pattern_bindings(sub, scrut_slot, &sub_path)?;
                }
            }
        }
        Ok(())
    }
}
