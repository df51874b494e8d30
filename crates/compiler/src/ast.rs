//! Abstract syntax tree (spec §3 "AST node", §9 "Deep virtual visitor
//! hierarchy").
//!
//! The original source models every node as a subclass of an `AstNode` base
//! with a virtual `accept(Visitor&)` and ~90 `visit` overloads
//! (`original_source/src/frontend/ast/ast.h`). Per the REDESIGN FLAGS in
//! spec.md §9, this is restructured as two closed sum types —
//! [`Expr`]/[`Stmt`] — walked with `match` instead of double dispatch. Every
//! node carries a [`SourceLocation`] directly rather than inheriting it from
//! a base class (I1 in spec §3: every node must be locatable for
//! diagnostics).

use std::rc::Rc;
use talon_core::SourceLocation;

/// A parsed type expression, as written in source (`*T`, `&T`, `[T]`,
/// `Name[T1, T2]`, `T?`, …). Resolved to a canonical [`crate::types::Type`]
/// by the type checker; kept separate because the parser has no type
/// registry to resolve against.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeExpr {
    Name(String),
    Pointer { raw: bool, inner: Box<TypeExpr> },
    Reference { mutable: bool, inner: Box<TypeExpr> },
    List(Box<TypeExpr>),
    FixedArray { element: Box<TypeExpr>, size: Box<Expr> },
    Generic { base: String, args: Vec<TypeExpr> },
    Nullable(Box<TypeExpr>),
    Function { params: Vec<TypeExpr>, ret: Box<TypeExpr> },
}

/// One part of an interpolated string literal: either a plain text segment
/// or an expression captured between `{` and `}` (spec §4.1 "Strings").
#[derive(Debug, Clone, PartialEq)]
pub enum StringPart {
    Text(String),
    Expr(Box<Expr>),
}

/// A call argument: positional, or `name: value` (spec §3 "Call").
#[derive(Debug, Clone, PartialEq)]
pub struct Arg {
    pub name: Option<String>,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchCase {
    pub pattern: Pattern,
    pub guard: Option<Expr>,
    pub body: Vec<Stmt>,
    pub location: SourceLocation,
}

/// Patterns appearing in `match` arms and destructuring declarations.
#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Wildcard,
    Literal(Expr),
    Identifier(String),
    Tuple(Vec<Pattern>),
    Record { type_name: Option<String>, fields: Vec<(String, Pattern)> },
}

/// A field in a destructuring `let (a, b) = rhs` / `let { a, b } = rhs`.
#[derive(Debug, Clone, PartialEq)]
pub enum DestructureShape {
    Tuple(Vec<String>),
    Record(Vec<String>),
}

/// Synchronization-primitive constructors (spec §3 "Expressions").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCtor {
    MakeChan,
    MakeMutex,
    MakeRwlock,
    MakeCond,
    MakeSemaphore,
}

/// Synchronization-primitive operations (lock/unlock/read/write/…).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOp {
    Lock,
    Unlock,
    Read,
    Write,
    Wait,
    Signal,
    Broadcast,
    Acquire,
    Release,
    TryAcquire,
    Send,
    Recv,
}

/// A binary operator token, including custom operators (spec §4.1
/// "Operators": `CUSTOM_OP` for user-defined infix operators).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Spaceship,
    NullCoalesce,
    Range,
    Custom(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    BitNot,
}

/// The compound-assignment operator an [`Expr::Assign`] carries, or plain
/// `=` when the op is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompoundOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    IntLiteral(i64, SourceLocation),
    FloatLiteral(f64, SourceLocation),
    BoolLiteral(bool, SourceLocation),
    NilLiteral(SourceLocation),
    StringLiteral(String, SourceLocation),
    InterpolatedString(Vec<StringPart>, SourceLocation),
    Identifier(String, SourceLocation),

    Binary { op: BinOp, left: Box<Expr>, right: Box<Expr>, location: SourceLocation },
    Unary { op: UnOp, operand: Box<Expr>, location: SourceLocation },
    Ternary { cond: Box<Expr>, then_branch: Box<Expr>, else_branch: Box<Expr>, location: SourceLocation },

    Call {
        callee: Box<Expr>,
        args: Vec<Arg>,
        type_args: Vec<TypeExpr>,
        hot: bool,
        location: SourceLocation,
    },
    Member { object: Box<Expr>, name: String, location: SourceLocation },
    Index { object: Box<Expr>, index: Box<Expr>, location: SourceLocation },

    ListLiteral { elements: Vec<Expr>, location: SourceLocation },
    RecordLiteral { type_name: Option<String>, fields: Vec<(String, Expr)>, location: SourceLocation },
    MapLiteral { entries: Vec<(Expr, Expr)>, location: SourceLocation },
    RangeLiteral { start: Box<Expr>, end: Box<Expr>, step: Option<Box<Expr>>, inclusive: bool, location: SourceLocation },

    Lambda { params: Vec<Param>, body: Box<LambdaBody>, location: SourceLocation },
    ListComprehension {
        element: Box<Expr>,
        var: String,
        iterable: Box<Expr>,
        condition: Option<Box<Expr>>,
        location: SourceLocation,
    },

    AddressOf { operand: Box<Expr>, location: SourceLocation },
    Deref { operand: Box<Expr>, location: SourceLocation },
    New { type_name: String, type_args: Vec<TypeExpr>, args: Vec<Arg>, location: SourceLocation },
    Cast { operand: Box<Expr>, target: TypeExpr, location: SourceLocation },
    Await { operand: Box<Expr>, location: SourceLocation },
    Spawn { call: Box<Expr>, location: SourceLocation },

    Assign { target: Box<Expr>, op: Option<CompoundOp>, value: Box<Expr>, location: SourceLocation },
    Propagate { operand: Box<Expr>, location: SourceLocation },

    DslBlock { name: String, raw: String, location: SourceLocation },

    SyncConstruct { ctor: SyncCtor, element_type: Option<TypeExpr>, args: Vec<Expr>, location: SourceLocation },
    SyncOperation { op: SyncOp, target: Box<Expr>, args: Vec<Expr>, location: SourceLocation },
}

#[derive(Debug, Clone, PartialEq)]
pub enum LambdaBody {
    Expr(Expr),
    Block(Vec<Stmt>),
}

impl Expr {
    pub fn location(&self) -> SourceLocation {
        match self {
            Expr::IntLiteral(_, location)
            | Expr::FloatLiteral(_, location)
            | Expr::BoolLiteral(_, location)
            | Expr::NilLiteral(location)
            | Expr::StringLiteral(_, location)
            | Expr::Identifier(_, location)
            | Expr::InterpolatedString(_, location) => location.clone(),
            Expr::Binary { location, .. }
            | Expr::Unary { location, .. }
            | Expr::Ternary { location, .. }
            | Expr::Call { location, .. }
            | Expr::Member { location, .. }
            | Expr::Index { location, .. }
            | Expr::ListLiteral { location, .. }
            | Expr::RecordLiteral { location, .. }
            | Expr::MapLiteral { location, .. }
            | Expr::RangeLiteral { location, .. }
            | Expr::Lambda { location, .. }
            | Expr::ListComprehension { location, .. }
            | Expr::AddressOf { location, .. }
            | Expr::Deref { location, .. }
            | Expr::New { location, .. }
            | Expr::Cast { location, .. }
            | Expr::Await { location, .. }
            | Expr::Spawn { location, .. }
            | Expr::Assign { location, .. }
            | Expr::Propagate { location, .. }
            | Expr::DslBlock { location, .. }
            | Expr::SyncConstruct { location, .. }
            | Expr::SyncOperation { location, .. } => location.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub type_ann: Option<TypeExpr>,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Attributes {
    pub repr_c: bool,
    pub packed: bool,
    pub align: Option<u32>,
    pub hot: bool,
    pub cold: bool,
    pub inline: bool,
    pub naked: bool,
    pub calling_convention: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BitfieldSpec {
    pub name: String,
    pub type_ann: TypeExpr,
    pub bits: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeParam {
    pub name: String,
    pub bounds: Vec<String>,
    pub default: Option<TypeExpr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDecl {
    pub name: String,
    pub type_ann: TypeExpr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub name: String,
    pub generics: Vec<TypeParam>,
    pub params: Vec<Param>,
    pub return_type: Option<TypeExpr>,
    pub body: Vec<Stmt>,
    pub calling_convention: Option<String>,
    pub is_pub: bool,
    pub is_extern: bool,
    pub is_async: bool,
    pub is_hot: bool,
    pub is_cold: bool,
    pub is_variadic: bool,
    pub is_naked: bool,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordDecl {
    pub name: String,
    pub generics: Vec<TypeParam>,
    pub fields: Vec<FieldDecl>,
    pub bitfields: Vec<BitfieldSpec>,
    pub attributes: Attributes,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnionDecl {
    pub name: String,
    pub fields: Vec<FieldDecl>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumVariant {
    pub name: String,
    pub fields: Vec<TypeExpr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumDecl {
    pub name: String,
    pub variants: Vec<EnumVariant>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraitMethodSig {
    pub name: String,
    pub params: Vec<Param>,
    pub return_type: Option<TypeExpr>,
    /// A method body present here means it's defaulted (spec I4: "must
    /// provide every non-defaulted method").
    pub default_body: Option<Vec<Stmt>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraitDecl {
    pub name: String,
    pub generics: Vec<TypeParam>,
    pub super_traits: Vec<String>,
    pub methods: Vec<TraitMethodSig>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImplDecl {
    pub trait_name: Option<String>,
    pub type_name: String,
    pub type_args: Vec<TypeExpr>,
    pub methods: Vec<FunctionDecl>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExternFunctionDecl {
    pub name: String,
    pub params: Vec<Param>,
    pub return_type: Option<TypeExpr>,
    pub is_variadic: bool,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExternBlock {
    pub abi: String,
    pub library: Option<String>,
    pub functions: Vec<ExternFunctionDecl>,
    pub location: SourceLocation,
}

/// Declarations whose internals are opaque to the core (spec §1 "Out of
/// scope": the macro expander's DSL-specific rewriters). The core parses
/// enough structure to splice/skip them but does not interpret the body.
#[derive(Debug, Clone, PartialEq)]
pub struct OpaqueDecl {
    pub keyword: String,
    pub name: String,
    pub raw_body: String,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InlineAsmOperand {
    pub constraint: String,
    pub expr: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InlineAsm {
    pub template: String,
    pub outputs: Vec<InlineAsmOperand>,
    pub inputs: Vec<InlineAsmOperand>,
    pub clobbers: Vec<String>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Expr(Expr),
    VarDecl {
        name: String,
        is_mut: bool,
        type_ann: Option<TypeExpr>,
        init: Option<Expr>,
        location: SourceLocation,
    },
    ConstDecl {
        name: String,
        value: Expr,
        location: SourceLocation,
    },
    Destructure {
        shape: DestructureShape,
        rhs: Expr,
        location: SourceLocation,
    },
    CompoundAssign {
        target: Expr,
        op: CompoundOp,
        value: Expr,
        location: SourceLocation,
    },
    Block(Vec<Stmt>),
    If {
        cond: Expr,
        then_branch: Vec<Stmt>,
        elifs: Vec<(Expr, Vec<Stmt>)>,
        else_branch: Option<Vec<Stmt>>,
        location: SourceLocation,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
        location: SourceLocation,
    },
    ForIn {
        var: String,
        iterable: Expr,
        body: Vec<Stmt>,
        location: SourceLocation,
    },
    Match {
        value: Expr,
        cases: Vec<MatchCase>,
        location: SourceLocation,
    },
    Return { value: Option<Expr>, location: SourceLocation },
    Break { location: SourceLocation },
    Continue { location: SourceLocation },
    TryElse {
        body: Vec<Stmt>,
        else_name: Option<String>,
        else_body: Vec<Stmt>,
        location: SourceLocation,
    },
    FunctionDecl(Rc<FunctionDecl>),
    RecordDecl(Rc<RecordDecl>),
    UnionDecl(Rc<UnionDecl>),
    EnumDecl(Rc<EnumDecl>),
    TypeAlias { name: String, target: TypeExpr, location: SourceLocation },
    TraitDecl(Rc<TraitDecl>),
    ImplDecl(Rc<ImplDecl>),
    UnsafeBlock { body: Box<Stmt>, location: SourceLocation },
    Import { path: String, location: SourceLocation },
    ExternBlock(Rc<ExternBlock>),
    Opaque(OpaqueDecl),
    Delete { target: Expr, location: SourceLocation },
    Lock { mutex: Expr, body: Box<Stmt>, location: SourceLocation },
    InlineAsm(InlineAsm),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

impl Program {
    pub fn new() -> Self {
        Program::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_default_is_empty() {
        let p = Program::new();
        assert!(p.statements.is_empty());
    }

    #[test]
    fn binary_location_is_carried_on_the_node() {
        let loc = SourceLocation::synthetic();
        let e = Expr::Binary {
            op: BinOp::Add,
            left: Box::new(Expr::IntLiteral(1, loc.clone())),
            right: Box::new(Expr::IntLiteral(2, loc.clone())),
            location: loc.clone(),
        };
        assert_eq!(e.location(), loc);
    }
}
