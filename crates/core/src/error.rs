//! Error taxonomy
//!
//! Two layers:
//! - [`CompileError`]: produced while translating a program to bytecode,
//!   formatted `<line>:1: <message>`.
//! - [`LatError`]: runtime errors. Thrown errors are ordinary values once
//!   caught; `LatError` carries the payload so a handler receives exactly
//!   what was thrown.

use crate::value::LatValue;

/// What went wrong during compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileErrorKind {
    TooManyConstants,
    JumpTooLarge,
    LoopControlOutsideLoop,
    TooManyLocals,
    TooManyUpvalues,
    OutOfMemory,
    Internal,
}

#[derive(Debug, Clone)]
pub struct CompileError {
    pub line: u32,
    pub kind: CompileErrorKind,
    pub message: String,
}

impl CompileError {
    pub fn new(line: u32, kind: CompileErrorKind, message: impl Into<String>) -> Self {
        CompileError {
            line,
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:1: {}", self.line, self.message)
    }
}

impl std::error::Error for CompileError {}

/// Classification of a runtime error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatErrorKind {
    Type,
    Arity,
    DivideByZero,
    CrystalMutation,
    BadIndex,
    MissingField,
    MissingExport,
    MissingModule,
    UndefinedName,
    Phase,
    Contract,
    Channel,
    /// A user `throw`; the payload is whatever was thrown
    Thrown,
    /// Broken VM invariant; never catchable
    Internal,
}

/// A runtime error travelling up the handler stack.
#[derive(Debug, Clone)]
pub struct LatError {
    pub kind: LatErrorKind,
    pub message: String,
    /// Source line, 0 when unknown; filled in by the VM from the line table
    pub line: u32,
    /// The thrown value, when the error originated from `throw`
    pub value: Option<LatValue>,
}

impl LatError {
    pub fn new(kind: LatErrorKind, message: impl Into<String>) -> Self {
        LatError {
            kind,
            message: message.into(),
            line: 0,
            value: None,
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(LatErrorKind::Type, message)
    }

    pub fn arity(expected: usize, got: usize, callee: &str) -> Self {
        Self::new(
            LatErrorKind::Arity,
            format!("{} expects {} argument(s), got {}", callee, expected, got),
        )
    }

    pub fn divide_by_zero() -> Self {
        Self::new(LatErrorKind::DivideByZero, "division by zero")
    }

    pub fn crystal_mutation(what: &str) -> Self {
        Self::new(
            LatErrorKind::CrystalMutation,
            format!("cannot mutate crystal {}", what),
        )
    }

    pub fn bad_index(message: impl Into<String>) -> Self {
        Self::new(LatErrorKind::BadIndex, message)
    }

    pub fn missing_field(type_name: &str, field: &str) -> Self {
        Self::new(
            LatErrorKind::MissingField,
            format!("{} has no field '{}'", type_name, field),
        )
    }

    pub fn missing_export(module: &str, name: &str) -> Self {
        Self::new(
            LatErrorKind::MissingExport,
            format!("module '{}' has no export '{}'", module, name),
        )
    }

    pub fn undefined(name: &str) -> Self {
        Self::new(
            LatErrorKind::UndefinedName,
            format!("undefined name '{}'", name),
        )
    }

    pub fn phase(message: impl Into<String>) -> Self {
        Self::new(LatErrorKind::Phase, message)
    }

    pub fn require_failed(fn_name: &str, msg: &str) -> Self {
        Self::new(
            LatErrorKind::Contract,
            format!("require failed in '{}': {}", fn_name, msg),
        )
    }

    pub fn ensure_failed(fn_name: &str, msg: &str) -> Self {
        Self::new(
            LatErrorKind::Contract,
            format!("ensure failed in '{}': {}", fn_name, msg),
        )
    }

    pub fn channel(message: impl Into<String>) -> Self {
        Self::new(LatErrorKind::Channel, message)
    }

    pub fn thrown(value: LatValue) -> Self {
        let message = value.to_string();
        LatError {
            kind: LatErrorKind::Thrown,
            message,
            line: 0,
            value: Some(value),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(LatErrorKind::Internal, message)
    }

    pub fn with_line(mut self, line: u32) -> Self {
        if self.line == 0 {
            self.line = line;
        }
        self
    }

    /// Add context in front of the message (e.g. `anneal failed: ...`).
    pub fn wrap(mut self, prefix: &str) -> Self {
        self.message = format!("{}{}", prefix, self.message);
        self
    }

    /// The value a `catch` receives: the thrown payload, or the message
    /// as a string for VM-raised errors.
    pub fn payload(&self) -> LatValue {
        match &self.value {
            Some(v) => v.clone(),
            None => LatValue::string(self.message.clone()),
        }
    }

    /// Internal errors must not be intercepted by user handlers.
    pub fn is_catchable(&self) -> bool {
        self.kind != LatErrorKind::Internal
    }
}

impl std::fmt::Display for LatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.line > 0 {
            write!(f, "{}:1: {}", self.line, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for LatError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_error_format() {
        let err = CompileError::new(12, CompileErrorKind::JumpTooLarge, "jump too large");
        assert_eq!(err.to_string(), "12:1: jump too large");
    }

    #[test]
    fn test_contract_messages() {
        let r = LatError::require_failed("withdraw", "amount must be positive");
        assert_eq!(
            r.message,
            "require failed in 'withdraw': amount must be positive"
        );
        let e = LatError::ensure_failed("withdraw", "balance stays non-negative");
        assert_eq!(
            e.message,
            "ensure failed in 'withdraw': balance stays non-negative"
        );
    }

    #[test]
    fn test_thrown_payload_round_trip() {
        let err = LatError::thrown(LatValue::int(42));
        assert_eq!(err.payload(), LatValue::int(42));
        let raised = LatError::type_error("bad operand");
        assert_eq!(raised.payload(), LatValue::string("bad operand"));
    }

    #[test]
    fn test_with_line_keeps_first() {
        let err = LatError::divide_by_zero().with_line(3).with_line(9);
        assert_eq!(err.line, 3);
        assert_eq!(err.to_string(), "3:1: division by zero");
    }

    #[test]
    fn test_internal_not_catchable() {
        assert!(!LatError::internal("corrupt frame").is_catchable());
        assert!(LatError::divide_by_zero().is_catchable());
    }
}
