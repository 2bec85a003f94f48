//! Symbol & Type Registry.
//!
//! Tracks global and local symbol definitions, procedure/method
//! signatures, and the user classes seen so far (with the fields inferred
//! from `self.<attr>` stores in their bodies). Duplicate registration is
//! not an error: the source language shadows on redefinition, and this
//! registry models that by simply overwriting.

use std::collections::{BTreeMap, HashMap};

use crate::ir::{Field, IrType, QualifiedName};

/// Coarse type information attached to a symbol or SSA temporary.
#[derive(Debug, Clone, PartialEq)]
pub struct Info {
    pub is_code: bool,
    pub is_class: bool,
    pub typ: IrType,
}

impl Info {
    pub fn object() -> Self {
        Self {
            is_code: false,
            is_class: false,
            typ: IrType::Object,
        }
    }

    pub fn of(typ: IrType) -> Self {
        Self {
            is_code: false,
            is_class: false,
            typ,
        }
    }

    pub fn code() -> Self {
        Self {
            is_code: true,
            is_class: false,
            typ: IrType::Code,
        }
    }

    pub fn class() -> Self {
        Self {
            is_code: false,
            is_class: true,
            typ: IrType::Class,
        }
    }
}

/// A name bound in the global or local scope.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolInfo {
    pub qualified_name: QualifiedName,
    pub is_builtin: bool,
    pub info: Info,
}

/// An annotated procedure or method signature, used to give calls a
/// precise return type instead of falling back to `Object`.
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    pub params: Vec<IrType>,
    pub ret_ty: IrType,
}

/// A user class under construction: its name and the fields discovered via
/// `self.x = v` stores in its body.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDecl {
    pub name: String,
    pub fields: Vec<Field>,
}

/// Global and local symbol tables, procedure signatures, and class
/// declarations. Globals/functions/classes are module-scoped; `locals` is
/// reset per procedure by [`crate::env::Env::enter_proc`].
#[derive(Debug, Clone, Default)]
pub struct Registry {
    globals: BTreeMap<String, SymbolInfo>,
    locals: HashMap<String, SymbolInfo>,
    functions: HashMap<String, Signature>,
    classes: Vec<ClassDecl>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert into the given scope, overwriting any previous definition
    /// (source-language shadowing).
    pub fn register_symbol(&mut self, is_global: bool, short_name: &str, info: SymbolInfo) {
        if is_global {
            self.globals.insert(short_name.to_string(), info);
        } else {
            self.locals.insert(short_name.to_string(), info);
        }
    }

    pub fn lookup_symbol(&self, is_global: bool, short_name: &str) -> Option<&SymbolInfo> {
        if is_global {
            self.globals.get(short_name)
        } else {
            self.locals.get(short_name)
        }
    }

    /// Look up `short_name`, preferring the local scope (source-language
    /// lookup order: locals shadow globals).
    pub fn lookup_symbol_scoped(&self, short_name: &str) -> Option<&SymbolInfo> {
        self.locals
            .get(short_name)
            .or_else(|| self.globals.get(short_name))
    }

    /// Reset the local scope; called at the start of each procedure.
    pub fn clear_locals(&mut self) {
        self.locals.clear();
    }

    /// Iterates in key order, so callers that collect this directly into a
    /// declaration list (the module assembler does) get deterministic
    /// output across runs without needing to sort it themselves.
    pub fn globals(&self) -> impl Iterator<Item = (&String, &SymbolInfo)> {
        self.globals.iter()
    }

    /// Key used for both free functions (`enclosing = None`) and methods
    /// (`enclosing = Some(class)`).
    fn signature_key(enclosing: Option<&str>, name: &str) -> String {
        match enclosing {
            Some(class) => format!("{class}::{name}"),
            None => name.to_string(),
        }
    }

    pub fn register_function(&mut self, name: &str, params: Vec<IrType>, ret_ty: IrType) {
        self.functions
            .insert(Self::signature_key(None, name), Signature { params, ret_ty });
    }

    pub fn register_method(
        &mut self,
        enclosing_class: &str,
        name: &str,
        params: Vec<IrType>,
        ret_ty: IrType,
    ) {
        self.functions.insert(
            Self::signature_key(Some(enclosing_class), name),
            Signature { params, ret_ty },
        );
    }

    pub fn lookup_signature(&self, enclosing: Option<&str>, proc_name: &str) -> Option<&Signature> {
        self.functions.get(&Self::signature_key(enclosing, proc_name))
    }

    /// Register a class by name, if not already known.
    pub fn register_class(&mut self, name: &str) {
        if !self.classes.iter().any(|c| c.name == name) {
            self.classes.push(ClassDecl {
                name: name.to_string(),
                fields: Vec::new(),
            });
        }
    }

    pub fn get_classes(&self) -> Vec<String> {
        self.classes.iter().map(|c| c.name.clone()).collect()
    }

    pub fn class_decls(&self) -> &[ClassDecl] {
        &self.classes
    }

    /// Record that `class_name.field` was stored with type `ty`, inferring
    /// the class's record type lazily as its body is lowered. `class_name`
    /// must already have been registered via [`Registry::register_class`].
    pub fn register_class_field(&mut self, class_name: &str, field_name: &str, ty: IrType) {
        let Some(class) = self.classes.iter_mut().find(|c| c.name == class_name) else {
            return;
        };
        if let Some(field) = class.fields.iter_mut().find(|f| f.name == field_name) {
            field.ty = ty;
        } else {
            class.fields.push(Field {
                name: field_name.to_string(),
                ty,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loc::Loc;
    use std::sync::Arc;

    fn qn(value: &str) -> QualifiedName {
        QualifiedName::new(value, Loc::unknown(Arc::from("m.py")))
    }

    #[test]
    fn locals_shadow_globals() {
        let mut reg = Registry::new();
        reg.register_symbol(
            true,
            "x",
            SymbolInfo {
                qualified_name: qn("Module::x"),
                is_builtin: false,
                info: Info::object(),
            },
        );
        reg.register_symbol(
            false,
            "x",
            SymbolInfo {
                qualified_name: qn("x"),
                is_builtin: false,
                info: Info::of(IrType::Int),
            },
        );
        let found = reg.lookup_symbol_scoped("x").unwrap();
        assert_eq!(found.info.typ, IrType::Int);
    }

    #[test]
    fn reregistering_overwrites_shadowing() {
        let mut reg = Registry::new();
        reg.register_symbol(
            true,
            "x",
            SymbolInfo {
                qualified_name: qn("Module::x"),
                is_builtin: false,
                info: Info::of(IrType::Int),
            },
        );
        reg.register_symbol(
            true,
            "x",
            SymbolInfo {
                qualified_name: qn("Module::x"),
                is_builtin: false,
                info: Info::of(IrType::String),
            },
        );
        assert_eq!(
            reg.lookup_symbol(true, "x").unwrap().info.typ,
            IrType::String
        );
    }

    #[test]
    fn class_fields_accumulate_in_order() {
        let mut reg = Registry::new();
        reg.register_class("C");
        reg.register_class_field("C", "x", IrType::Int);
        reg.register_class_field("C", "y", IrType::Object);
        reg.register_class_field("C", "x", IrType::Int);
        let classes = reg.class_decls();
        assert_eq!(classes.len(), 1);
        assert_eq!(classes[0].fields.len(), 2);
        assert_eq!(classes[0].fields[0].name, "x");
        assert_eq!(classes[0].fields[1].name, "y");
    }

    #[test]
    fn method_signature_keyed_by_enclosing_class() {
        let mut reg = Registry::new();
        reg.register_method("C", "get", vec![], IrType::Object);
        reg.register_function("get", vec![], IrType::Int);
        assert_eq!(
            reg.lookup_signature(Some("C"), "get").unwrap().ret_ty,
            IrType::Object
        );
        assert_eq!(reg.lookup_signature(None, "get").unwrap().ret_ty, IrType::Int);
    }
}
