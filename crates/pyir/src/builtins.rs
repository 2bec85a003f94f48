//! The set of shim builtins the lowering rules may call, and the
//! declarations they turn into.
//!
//! Every shim the translator might emit a call to is named here with a
//! fixed signature. `builtins_seen` (tracked on [`crate::env::Env`]) only
//! ever grows; [`to_decls`] turns the final set into `declare` items plus
//! an unconditional set of primitive-wrapper declarations, mirroring how
//! the record types for `PyIterItem`/`Method` are only emitted when their
//! builtin was actually referenced.

use std::collections::BTreeSet;

use crate::ir::{BuiltinDecl, IrType};

/// A builtin shim the translator can call, used to model a source-language
/// primitive the analyzer need not implement directly.
///
/// `Host` covers arbitrary host functions resolved by name at a call site
/// (`print`, `range`, ...) that have no fixed signature of their own; they
/// are declared as `(Object...) -> Object`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BuiltinTag {
    IsTrue,
    BinaryAdd,
    PythonCall,
    PythonCallMethod,
    PythonClass,
    PythonClassConstructor,
    PythonCode,
    PythonIter,
    PythonIterNext,
    PythonLoadMethod,
    Host(String),
}

impl BuiltinTag {
    /// The name used in `$builtins.<name>` and in the `declare` item.
    pub fn ir_name(&self) -> String {
        match self {
            BuiltinTag::IsTrue => "python_is_true".to_string(),
            BuiltinTag::BinaryAdd => "binary_add".to_string(),
            BuiltinTag::PythonCall => "python_call".to_string(),
            BuiltinTag::PythonCallMethod => "python_call_method".to_string(),
            BuiltinTag::PythonClass => "python_class".to_string(),
            BuiltinTag::PythonClassConstructor => "python_class_constructor".to_string(),
            BuiltinTag::PythonCode => "python_code".to_string(),
            BuiltinTag::PythonIter => "python_iter".to_string(),
            BuiltinTag::PythonIterNext => "python_iter_next".to_string(),
            BuiltinTag::PythonLoadMethod => "python_load_method".to_string(),
            BuiltinTag::Host(name) => name.clone(),
        }
    }

    /// `(params, return type)` for this shim. Variadic shims (calls,
    /// construction, host functions) report an empty parameter list —
    /// their arity is checked by the caller, not by this table.
    pub fn signature(&self) -> (Vec<IrType>, IrType) {
        match self {
            BuiltinTag::IsTrue => (vec![IrType::Object], IrType::Int),
            BuiltinTag::BinaryAdd => (vec![IrType::Object, IrType::Object], IrType::Object),
            BuiltinTag::PythonCall => (Vec::new(), IrType::Object),
            BuiltinTag::PythonCallMethod => (Vec::new(), IrType::Object),
            BuiltinTag::PythonClass => (vec![IrType::String], IrType::Class),
            BuiltinTag::PythonClassConstructor => (Vec::new(), IrType::Object),
            BuiltinTag::PythonCode => (vec![IrType::String], IrType::Code),
            BuiltinTag::PythonIter => (vec![IrType::Object], IrType::Object),
            BuiltinTag::PythonIterNext => (vec![IrType::Object], IrType::PyIterItem),
            BuiltinTag::PythonLoadMethod => {
                (vec![IrType::Object, IrType::String], IrType::Method)
            }
            BuiltinTag::Host(_) => (Vec::new(), IrType::Object),
        }
    }
}

/// Primitive-wrapper shims that resolve a constant of the matching kind.
/// Used by `LOAD_CONST` resolution, always declared regardless of what was
/// actually referenced (per the module assembler's unconditional set).
pub const PRIMITIVE_WRAPPERS: &[(&str, IrType, IrType)] = &[
    ("python_int", IrType::Int, IrType::Object),
    ("python_bool", IrType::Bool, IrType::Object),
    ("python_string", IrType::String, IrType::Object),
    ("python_tuple", IrType::Object, IrType::Object),
];

/// Tracks which shims have been referenced while lowering a module.
#[derive(Debug, Clone, Default)]
pub struct BuiltinRegistry {
    seen: BTreeSet<BuiltinTag>,
}

impl BuiltinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a reference to `tag`. Idempotent.
    pub fn record(&mut self, tag: BuiltinTag) {
        self.seen.insert(tag);
    }

    pub fn has_seen(&self, tag: &BuiltinTag) -> bool {
        self.seen.contains(tag)
    }

    /// Whether `PyIterItem` was ever produced, and so needs its record
    /// declaration.
    pub fn uses_iter_item(&self) -> bool {
        self.has_seen(&BuiltinTag::PythonIterNext)
    }

    /// Whether `Method` was ever produced, and so needs its record
    /// declaration.
    pub fn uses_method(&self) -> bool {
        self.has_seen(&BuiltinTag::PythonLoadMethod)
    }

    /// The transitive closure of referenced shims, as `declare` items, plus
    /// the always-emitted primitive wrappers.
    pub fn to_decls(&self) -> Vec<BuiltinDecl> {
        let mut decls: Vec<BuiltinDecl> = self
            .seen
            .iter()
            .map(|tag| {
                let (params, ret_ty) = tag.signature();
                BuiltinDecl {
                    name: tag.ir_name(),
                    params,
                    ret_ty,
                }
            })
            .collect();

        for (name, param, ret_ty) in PRIMITIVE_WRAPPERS {
            decls.push(BuiltinDecl {
                name: (*name).to_string(),
                params: vec![param.clone()],
                ret_ty: ret_ty.clone(),
            });
        }

        decls
    }
}
