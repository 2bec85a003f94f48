//! The Textual IR data model.
//!
//! This is the crate's *output* shape: typed procedures, globals, record
//! types, and builtin declarations, each block-structured and SSA. A
//! pretty-printer that renders this into the grammar described in the
//! crate docs (`define f(...) : *T { #b0: ... }`) is an external
//! collaborator — this module only builds the structure, it never
//! stringifies it.

use crate::loc::Loc;

/// A dotted identifier locating a symbol within a module or class, e.g.
/// `Module::fn` or `Module::Class::method`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct QualifiedName {
    pub value: String,
    pub loc: Loc,
}

impl QualifiedName {
    pub fn new(value: impl Into<String>, loc: Loc) -> Self {
        Self {
            value: value.into(),
            loc,
        }
    }
}

/// An IR type. User classes get a `Named` record type instead of a fixed
/// variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IrType {
    Object,
    Int,
    Float,
    Bool,
    String,
    None,
    Code,
    Class,
    PyIterItem,
    Method,
    Named(String),
}

/// SSA temporary identifier, unique within one procedure.
pub type TempId = u32;

/// An immediate value embedded directly in an instruction, as opposed to
/// one read off an SSA temporary.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Literal {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

/// A value used in operand position. Every stack cell that crosses a block
/// boundary is first resolved down to a `Temp` — but a literal constant
/// feeding a primitive-wrapper call (`python_int(42)`) is passed through
/// directly rather than bound to an identifier first.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Operand {
    Temp(TempId),
    Literal(Literal),
    /// The `None` literal, rendered as the IR keyword `null`.
    Null,
}

/// The addressable location of a `store`/`load`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LValue {
    Global(QualifiedName),
    Local(String),
}

/// The thing being called by a `Call` expression.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Callee {
    Builtin(String),
    Proc(QualifiedName),
}

/// The right-hand side of an id-binding instruction (`n = rhs`).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Expr {
    Call { callee: Callee, args: Vec<Operand> },
    /// `base.?.attr` — an untyped (dynamic) field read.
    LoadAttr { base: Operand, attr: String },
}

/// One non-terminating instruction inside a block body.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Instr {
    /// `store &lval <- rhs: *T`
    Store {
        lval: LValue,
        rhs: Operand,
        ty: IrType,
    },
    /// `n = rhs`
    Bind { id: TempId, rhs: Expr },
    /// `n:*T = load &lval`
    Load {
        id: TempId,
        ty: IrType,
        lval: LValue,
    },
    /// `store base.?.attr <- v:*T`
    StoreAttr {
        base: Operand,
        attr: String,
        value: Operand,
        ty: IrType,
    },
    /// `prune e` / `prune __sil_lnot(e)`
    Prune { operand: Operand, negate: bool },
}

/// One successor of a block terminator, with the SSA arguments it supplies.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JumpTarget {
    pub label: String,
    pub args: Vec<Operand>,
}

/// The instruction that ends a block: a one- or two-way `jmp`, or a `ret`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Terminator {
    Jump(Vec<JumpTarget>),
    Ret(Operand),
}

/// A basic block: a label, its SSA parameters, a straight-line body, and a
/// terminator.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Block {
    pub label: String,
    pub params: Vec<(TempId, IrType)>,
    pub body: Vec<Instr>,
    pub terminator: Terminator,
}

/// A formal parameter of a procedure declaration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Param {
    pub name: String,
    pub ty: IrType,
}

/// `define <name>(params) : *R { blocks }`
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Proc {
    pub name: QualifiedName,
    pub params: Vec<Param>,
    pub ret_ty: IrType,
    pub blocks: Vec<Block>,
}

/// `global <name>: *T`
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Global {
    pub name: QualifiedName,
    pub ty: IrType,
}

/// A field of a `type Name = {field: *T; ...}` declaration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Field {
    pub name: String,
    pub ty: IrType,
}

/// `type Name = {field: *T; ...}`
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RecordType {
    pub name: String,
    pub fields: Vec<Field>,
}

/// `declare $builtins.<name>(params) : *T`
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BuiltinDecl {
    pub name: String,
    pub params: Vec<IrType>,
    pub ret_ty: IrType,
}

/// The complete translation output for one module.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Module {
    pub procs: Vec<Proc>,
    pub globals: Vec<Global>,
    pub types: Vec<RecordType>,
    pub builtins: Vec<BuiltinDecl>,
}

impl Module {
    /// The textual IR module header is always `.source_language = "python"`.
    pub const SOURCE_LANGUAGE: &'static str = "python";
}
