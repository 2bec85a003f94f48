//! Translation failures.
//!
//! The translator distinguishes malformed bytecode (stack underflow, bad
//! jump arity) from unsupported constructs (opcodes outside the modeled
//! subset). Both are the caller's problem, never silently patched over.
//! Errors the downstream IR type checker would report are not represented
//! here at all — that checker is an external collaborator (see crate docs)
//! and its errors are surfaced by the caller, not synthesized by us.

use thiserror::Error;

/// Everything that can go wrong while lowering one code object.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The data stack was popped while empty.
    #[error("stack underflow at offset {offset} lowering {opname}")]
    StackUnderflow { offset: u32, opname: String },

    /// An opcode the loader produced has no lowering rule at all.
    #[error("unknown opcode {opname:?} at offset {offset}")]
    UnknownOpcode { offset: u32, opname: String },

    /// An opcode is recognized but models a construct this translator does
    /// not support (closures, exceptions, generators, ...).
    #[error("unsupported construct `{opname}` at offset {offset}: {reason}")]
    UnsupportedConstruct {
        offset: u32,
        opname: String,
        reason: String,
    },

    /// A block already had SSA parameters registered with a different
    /// arity or type than the one now being demanded of it.
    #[error(
        "SSA arity mismatch at block `{label}`: expected {expected} parameter(s), found {found}"
    )]
    SsaArityMismatch {
        label: String,
        expected: usize,
        found: usize,
    },

    /// `LOAD_BUILD_CLASS` was not followed by the recognizable
    /// marker/code/name/bases handshake.
    #[error("malformed class-build sequence at offset {offset}")]
    MalformedClassBuild { offset: u32 },

    /// A jump refers to an offset that was never reached during lowering.
    #[error("jump target offset {offset} was never registered as a label")]
    MissingLabel { offset: u32 },
}

pub type Result<T> = std::result::Result<T, Error>;
