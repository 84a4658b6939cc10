//! Abstract syntax tree for Lattice programs
//!
//! The parser (an external collaborator) produces a [`Program`]; the
//! compiler consumes it. Statements carry their source line for the
//! chunk's line table; expressions inherit the line of their statement.

use lattice_core::phase::Phase;

/// A parsed program: the compiler's input.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub items: Vec<Item>,
}

impl Program {
    pub fn from_stmts(stmts: Vec<Stmt>) -> Self {
        Program {
            items: stmts.into_iter().map(Item::Stmt).collect(),
        }
    }
}

/// Top-level item.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Stmt(Stmt),
    Function(FnDecl),
    Struct(StructDecl),
    Enum(EnumDecl),
    Impl(ImplBlock),
    Trait(TraitDecl),
    Test(TestDecl),
}

/// Function parameter: optional default, required phase, and type
/// annotation.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
    pub phase: Option<Phase>,
    pub type_name: Option<String>,
}

impl Param {
    pub fn plain(name: impl Into<String>) -> Self {
        Param {
            name: name.into(),
            default: None,
            phase: None,
            type_name: None,
        }
    }
}

/// A `require` or `ensure` clause. `ensure` conditions may reference the
/// magic binding `result`.
#[derive(Debug, Clone, PartialEq)]
pub struct Contract {
    pub condition: Expr,
    pub message: String,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FnDecl {
    pub name: String,
    pub params: Vec<Param>,
    /// Name of the rest parameter, when the function is variadic
    pub variadic: Option<String>,
    pub body: Vec<Stmt>,
    pub requires: Vec<Contract>,
    pub ensures: Vec<Contract>,
    pub return_type: Option<String>,
    pub exported: bool,
    pub line: u32,
}

impl FnDecl {
    pub fn new(name: impl Into<String>, params: Vec<Param>, body: Vec<Stmt>) -> Self {
        FnDecl {
            name: name.into(),
            params,
            variadic: None,
            body,
            requires: Vec::new(),
            ensures: Vec::new(),
            return_type: None,
            exported: false,
            line: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructDecl {
    pub name: String,
    pub fields: Vec<String>,
    pub exported: bool,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumDecl {
    pub name: String,
    /// Variant name and payload arity
    pub variants: Vec<(String, usize)>,
    pub exported: bool,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImplBlock {
    pub type_name: String,
    pub trait_name: Option<String>,
    pub methods: Vec<FnDecl>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraitDecl {
    pub name: String,
    /// Methods an impl must provide
    pub required: Vec<String>,
    /// Default method bodies copied into impls that omit them
    pub defaults: Vec<FnDecl>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestDecl {
    pub name: String,
    pub body: Vec<Stmt>,
    pub line: u32,
}

/// A block with an optional tail expression producing its value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    pub value: Option<Box<Expr>>,
}

impl Block {
    pub fn of_expr(expr: Expr) -> Self {
        Block {
            stmts: Vec::new(),
            value: Some(Box::new(expr)),
        }
    }

    pub fn of_stmts(stmts: Vec<Stmt>) -> Self {
        Block { stmts, value: None }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let {
        name: String,
        value: Expr,
        line: u32,
    },
    Assign {
        target: AssignTarget,
        value: Expr,
        line: u32,
    },
    Expr {
        expr: Expr,
        line: u32,
    },
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Option<Vec<Stmt>>,
        line: u32,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
        line: u32,
    },
    ForIn {
        var: String,
        iterable: Expr,
        body: Vec<Stmt>,
        line: u32,
    },
    Break {
        line: u32,
    },
    Continue {
        line: u32,
    },
    Return {
        value: Option<Expr>,
        line: u32,
    },
    Throw {
        value: Expr,
        line: u32,
    },
    Defer {
        body: Vec<Stmt>,
        line: u32,
    },
    TryCatch {
        body: Vec<Stmt>,
        catch_var: String,
        catch_body: Vec<Stmt>,
        line: u32,
    },
    Import {
        module: String,
        line: u32,
    },
}

impl Stmt {
    pub fn line(&self) -> u32 {
        match self {
            Stmt::Let { line, .. }
            | Stmt::Assign { line, .. }
            | Stmt::Expr { line, .. }
            | Stmt::If { line, .. }
            | Stmt::While { line, .. }
            | Stmt::ForIn { line, .. }
            | Stmt::Break { line }
            | Stmt::Continue { line }
            | Stmt::Return { line, .. }
            | Stmt::Throw { line, .. }
            | Stmt::Defer { line, .. }
            | Stmt::TryCatch { line, .. }
            | Stmt::Import { line, .. } => *line,
        }
    }

    /// Expression statement on line 1 (test convenience).
    pub fn expr(expr: Expr) -> Self {
        Stmt::Expr { expr, line: 1 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AssignTarget {
    Name(String),
    Index { target: Expr, index: Expr },
    Field { target: Expr, field: String },
    Slice { target: Expr, start: Expr, end: Expr },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Neq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
}

/// Short-circuit operators; never constant-folded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    NilCoalesce,
}

/// Target of `freeze` / `thaw`.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseTarget {
    /// A named variable: the transition writes back to its storage
    Var(String),
    /// One field/key of a named object (`freeze obj.field`)
    Field { object: String, field: String },
    /// An arbitrary expression: transition applies to the value only
    Value(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectArmKind {
    /// Receive from the channel the expression evaluates to
    Recv(Expr),
    /// Fire after the given number of milliseconds
    Timeout(Expr),
    /// Taken immediately when nothing is ready on the first poll
    Default,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectArm {
    pub kind: SelectArmKind,
    pub binding: Option<String>,
    pub body: Block,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    /// Literal value comparison (int, float, string, bool, nil, unit)
    Literal(Expr),
    /// `_`, optionally phase-qualified (`crystal _`)
    Wildcard { phase: Option<Phase> },
    /// Half-open integer range
    Range { start: i64, end: i64 },
    /// Bind the scrutinee to a name for the arm body and guard
    Binding(String),
    /// `[a, 1, ..rest, b]`: one rest element allowed at any position
    Array {
        prefix: Vec<Pattern>,
        rest: Option<Option<String>>,
        suffix: Vec<Pattern>,
    },
    /// `Name { field: pattern, .. }`
    Struct {
        name: String,
        fields: Vec<(String, Pattern)>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchArm {
    pub pattern: Pattern,
    pub guard: Option<Expr>,
    pub body: Expr,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Unit,
    Nil,
    Ident(String),
    Array(Vec<Expr>),
    Tuple(Vec<Expr>),
    MapLit(Vec<(Expr, Expr)>),
    SetLit(Vec<Expr>),
    StructLit {
        name: String,
        fields: Vec<(String, Expr)>,
    },
    EnumLit {
        enum_name: String,
        variant: String,
        payload: Vec<Expr>,
    },
    Range {
        start: Box<Expr>,
        end: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    MethodCall {
        recv: Box<Expr>,
        method: String,
        args: Vec<Expr>,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Field {
        target: Box<Expr>,
        field: String,
    },
    Closure {
        params: Vec<Param>,
        variadic: Option<String>,
        body: Vec<Stmt>,
    },
    IfElse {
        cond: Box<Expr>,
        then_block: Block,
        else_block: Block,
    },
    Match {
        scrutinee: Box<Expr>,
        arms: Vec<MatchArm>,
    },
    /// `expr?`
    TryUnwrap(Box<Expr>),
    Scope {
        spawns: Vec<Block>,
        sync: Block,
    },
    Select {
        arms: Vec<SelectArm>,
    },
    Freeze {
        target: PhaseTarget,
        except: Vec<String>,
    },
    Thaw(PhaseTarget),
    Anneal {
        target: Box<Expr>,
        func: Box<Expr>,
    },
    Crystallize {
        target: String,
        body: Block,
    },
    Borrow {
        target: String,
        body: Block,
    },
    Forge {
        body: Block,
    },
    Sublimate(Box<Expr>),
    CloneExpr(Box<Expr>),
    IsCrystal(Box<Expr>),
    IsFluid(Box<Expr>),
}

impl Expr {
    pub fn ident(name: impl Into<String>) -> Self {
        Expr::Ident(name.into())
    }

    pub fn string(s: impl Into<String>) -> Self {
        Expr::Str(s.into())
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn call(callee: Expr, args: Vec<Expr>) -> Self {
        Expr::Call {
            callee: Box::new(callee),
            args,
        }
    }

    pub fn call_named(name: &str, args: Vec<Expr>) -> Self {
        Expr::call(Expr::ident(name), args)
    }

    pub fn index(target: Expr, index: Expr) -> Self {
        Expr::Index {
            target: Box::new(target),
            index: Box::new(index),
        }
    }

    pub fn field(target: Expr, field: impl Into<String>) -> Self {
        Expr::Field {
            target: Box::new(target),
            field: field.into(),
        }
    }

    pub fn method(recv: Expr, method: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::MethodCall {
            recv: Box::new(recv),
            method: method.into(),
            args,
        }
    }
}
