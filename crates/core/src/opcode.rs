//! Bytecode opcode set for the stack VM
//!
//! Multi-byte operands are big-endian. Jump operands are unsigned 16-bit
//! distances: forward for `JUMP*`, backward for `LOOP`.
//!
//! Operand layouts (beyond the fixed widths listed per opcode):
//! - `CLOSURE fn_const:u16 upvalue_count:u8 (is_local:u8 index:u8)*`
//! - `BUILD_STRUCT name_const:u16 field_count:u8 (field_name_const:u16)*`
//! - `FREEZE_EXCEPT loc_type:u8 target:u16 count:u8 (name_const:u16)*`
//! - `SCOPE spawn_count:u8 sync_const:u16 (spawn_const:u16)*`
//! - `SELECT arm_count:u8 (kind:u8 has_binding:u8 expr_const:u16 body_const:u16)*`
//!
//! `loc_type` for the `*_VAR` phase opcodes selects the storage class:
//! 0 = local slot, 1 = upvalue index, 2 = global (operand is a name
//! constant).

/// Storage class operand for FREEZE_VAR / THAW_VAR / FREEZE_FIELD /
/// FREEZE_EXCEPT.
pub const LOC_LOCAL: u8 = 0;
pub const LOC_UPVALUE: u8 = 1;
pub const LOC_GLOBAL: u8 = 2;

/// Arm kinds for SELECT.
pub const SELECT_ARM_CHANNEL: u8 = 0;
pub const SELECT_ARM_TIMEOUT: u8 = 1;
pub const SELECT_ARM_DEFAULT: u8 = 2;

macro_rules! opcodes {
    ($($name:ident, $mnemonic:expr, $operands:expr, $val:expr;)+) => {
        /// One VM instruction tag. See the module docs for operand layouts.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($name = $val),+
        }

        impl Opcode {
            /// Canonical mnemonic, used by the disassembler.
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$name => $mnemonic),+
                }
            }

            /// Fixed operand byte count, or `None` for variable-length
            /// instructions (CLOSURE, BUILD_STRUCT, FREEZE_EXCEPT, SCOPE,
            /// SELECT).
            pub fn fixed_operands(self) -> Option<usize> {
                match self {
                    $(Opcode::$name => $operands),+
                }
            }
        }

        impl TryFrom<u8> for Opcode {
            type Error = u8;

            fn try_from(byte: u8) -> Result<Self, u8> {
                match byte {
                    $(b if b == $val => Ok(Opcode::$name),)+
                    other => Err(other),
                }
            }
        }
    };
}

opcodes! {
    // Constants and literals
    Constant,      "CONSTANT",       Some(1), 0;
    Constant16,    "CONSTANT_16",    Some(2), 1;
    LoadInt8,      "LOAD_INT8",      Some(1), 2;
    True,          "TRUE",           Some(0), 3;
    False,         "FALSE",          Some(0), 4;
    Nil,           "NIL",            Some(0), 5;
    Unit,          "UNIT",           Some(0), 6;

    // Stack plumbing
    Pop,           "POP",            Some(0), 7;
    Dup,           "DUP",            Some(0), 8;
    Swap,          "SWAP",           Some(0), 9;

    // Locals, upvalues, globals
    GetLocal,      "GET_LOCAL",      Some(1), 10;
    SetLocal,      "SET_LOCAL",      Some(1), 11;
    SetLocalPop,   "SET_LOCAL_POP",  Some(1), 12;
    GetUpvalue,    "GET_UPVALUE",    Some(1), 13;
    SetUpvalue,    "SET_UPVALUE",    Some(1), 14;
    GetGlobal,     "GET_GLOBAL",     Some(1), 15;
    SetGlobal,     "SET_GLOBAL",     Some(1), 16;
    DefineGlobal,  "DEFINE_GLOBAL",  Some(1), 17;
    GetGlobal16,   "GET_GLOBAL_16",  Some(2), 18;
    SetGlobal16,   "SET_GLOBAL_16",  Some(2), 19;
    DefineGlobal16,"DEFINE_GLOBAL_16",Some(2), 20;

    // Arithmetic and bitwise
    Add,           "ADD",            Some(0), 21;
    Sub,           "SUB",            Some(0), 22;
    Mul,           "MUL",            Some(0), 23;
    Div,           "DIV",            Some(0), 24;
    Mod,           "MOD",            Some(0), 25;
    Neg,           "NEG",            Some(0), 26;
    Not,           "NOT",            Some(0), 27;
    BitAnd,        "BIT_AND",        Some(0), 28;
    BitOr,         "BIT_OR",         Some(0), 29;
    BitXor,        "BIT_XOR",        Some(0), 30;
    BitNot,        "BIT_NOT",        Some(0), 31;
    Shl,           "BIT_SHL",        Some(0), 32;
    Shr,           "BIT_SHR",        Some(0), 33;

    // Comparison
    Eq,            "EQ",             Some(0), 34;
    Neq,           "NEQ",            Some(0), 35;
    Lt,            "LT",             Some(0), 36;
    Gt,            "GT",             Some(0), 37;
    LtEq,          "LTEQ",           Some(0), 38;
    GtEq,          "GTEQ",           Some(0), 39;

    // Control flow
    Jump,          "JUMP",           Some(2), 40;
    JumpIfFalse,   "JUMP_IF_FALSE",  Some(2), 41;
    JumpIfTrue,    "JUMP_IF_TRUE",   Some(2), 42;
    JumpIfNotNil,  "JUMP_IF_NOT_NIL",Some(2), 43;
    Loop,          "LOOP",           Some(2), 44;

    // Calls and closures
    Call,          "CALL",           Some(1), 45;
    Closure,       "CLOSURE",        None,    46;
    CloseUpvalue,  "CLOSE_UPVALUE",  Some(0), 47;
    Return,        "RETURN",         Some(0), 48;

    // Constructors
    BuildArray,    "BUILD_ARRAY",    Some(2), 49;
    BuildTuple,    "BUILD_TUPLE",    Some(1), 50;
    BuildRange,    "BUILD_RANGE",    Some(0), 51;
    BuildStruct,   "BUILD_STRUCT",   None,    52;
    BuildEnum,     "BUILD_ENUM",     Some(5), 53;
    BuildMap,      "BUILD_MAP",      Some(2), 54;
    BuildSet,      "BUILD_SET",      Some(2), 55;

    // Access
    Index,         "INDEX",          Some(0), 56;
    SetIndex,      "SET_INDEX",      Some(0), 57;
    GetField,      "GET_FIELD",      Some(2), 58;
    SetField,      "SET_FIELD",      Some(2), 59;
    Invoke,        "INVOKE",         Some(3), 60;

    // Local fast paths
    IndexLocal,    "INDEX_LOCAL",    Some(1), 61;
    GetFieldLocal, "GET_FIELD_LOCAL",Some(3), 62;
    InvokeLocal,   "INVOKE_LOCAL",   Some(4), 63;
    InvokeGlobal,  "INVOKE_GLOBAL",  Some(3), 64;
    IncLocal,      "INC_LOCAL",      Some(1), 65;
    DecLocal,      "DEC_LOCAL",      Some(1), 66;
    AppendStrLocal,"APPEND_STR_LOCAL",Some(1), 67;
    SetIndexLocal, "SET_INDEX_LOCAL",Some(1), 68;
    SetSliceLocal, "SET_SLICE_LOCAL",Some(1), 69;

    // Phase operations
    Freeze,        "FREEZE",         Some(0), 70;
    Thaw,          "THAW",           Some(0), 71;
    CloneValue,    "CLONE",          Some(0), 72;
    FreezeVar,     "FREEZE_VAR",     Some(3), 73;
    ThawVar,       "THAW_VAR",       Some(3), 74;
    FreezeField,   "FREEZE_FIELD",   Some(5), 75;
    FreezeExcept,  "FREEZE_EXCEPT",  None,    76;
    Sublimate,     "SUBLIMATE",      Some(0), 77;
    MarkFluid,     "MARK_FLUID",     Some(0), 78;
    IsCrystal,     "IS_CRYSTAL",     Some(0), 79;
    IsFluid,       "IS_FLUID",       Some(0), 80;

    // Errors
    PushExceptionHandler, "PUSH_EXCEPTION_HANDLER", Some(2), 81;
    PopExceptionHandler,  "POP_EXCEPTION_HANDLER",  Some(0), 82;
    Throw,         "THROW",          Some(0), 83;
    TryUnwrap,     "TRY_UNWRAP",     Some(0), 84;

    // Defer
    DeferPush,     "DEFER_PUSH",     Some(3), 85;
    DeferRun,      "DEFER_RUN",      Some(1), 86;

    // Concurrency and modules
    Scope,         "SCOPE",          None,    87;
    Select,        "SELECT",         None,    88;
    Import,        "IMPORT",         Some(2), 89;

    // Contracts
    CheckType,     "CHECK_TYPE",     Some(5), 90;
    CheckReturnType, "CHECK_RETURN_TYPE", Some(4), 91;

    // Ephemeral arena
    ResetEphemeral,"RESET_EPHEMERAL",Some(0), 92;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_all_opcodes() {
        for byte in 0..=92u8 {
            let op = Opcode::try_from(byte).expect("contiguous opcode space");
            assert_eq!(op as u8, byte);
        }
        assert!(Opcode::try_from(93).is_err());
        assert!(Opcode::try_from(255).is_err());
    }

    #[test]
    fn test_mnemonics_match_inventory() {
        assert_eq!(Opcode::Constant.mnemonic(), "CONSTANT");
        assert_eq!(Opcode::FreezeVar.mnemonic(), "FREEZE_VAR");
        assert_eq!(Opcode::PushExceptionHandler.mnemonic(), "PUSH_EXCEPTION_HANDLER");
        assert_eq!(Opcode::ResetEphemeral.mnemonic(), "RESET_EPHEMERAL");
    }

    #[test]
    fn test_variable_length_ops() {
        for op in [
            Opcode::Closure,
            Opcode::BuildStruct,
            Opcode::FreezeExcept,
            Opcode::Scope,
            Opcode::Select,
        ] {
            assert_eq!(op.fixed_operands(), None);
        }
        assert_eq!(Opcode::Jump.fixed_operands(), Some(2));
        assert_eq!(Opcode::Invoke.fixed_operands(), Some(3));
    }
}
