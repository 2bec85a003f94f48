//! The Module Assembler.
//!
//! Drives translation starting from the top-level code object, following
//! every nested function, method, and class body discovered along the
//! way, and assembles the final [`Module`]: procedures, globals, record
//! types, and builtin declarations.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::env::Env;
use crate::error::Result;
use crate::input::CodeObject;
use crate::ir::{Field, Global, IrType, Module, QualifiedName, RecordType};
use crate::loc::Loc;
use crate::lower::{lower_class_body, lower_procedure, PendingUnit, UnitKind, MODULE_PREFIX, TOPLEVEL_NAME};

/// Translate `code_object` (the module top level) and every nested code
/// object it discovers into a complete Textual IR module.
pub fn to_module(sourcefile: impl Into<Arc<str>>, code_object: CodeObject) -> Result<Module> {
    let filename: Arc<str> = sourcefile.into();
    let mut env = Env::new(Arc::clone(&filename));

    let toplevel_qn = QualifiedName::new(
        format!("{MODULE_PREFIX}::{TOPLEVEL_NAME}"),
        Loc::unknown(Arc::clone(&filename)),
    );

    let mut work: VecDeque<PendingUnit> = VecDeque::new();
    work.push_back(PendingUnit {
        qualified_name: toplevel_qn,
        code: Arc::new(code_object),
        kind: UnitKind::Function,
    });

    let mut procs = Vec::new();
    let mut is_first = true;
    while let Some(unit) = work.pop_front() {
        match unit.kind {
            UnitKind::ClassBody { class } => {
                let nested = lower_class_body(&mut env, &class, &unit.code)?;
                work.extend(nested);
            }
            UnitKind::Function => {
                let (proc, nested) = lower_procedure(&mut env, unit.qualified_name, &unit.code, is_first, None)?;
                procs.push(proc);
                work.extend(nested);
            }
            UnitKind::Method { class } => {
                let (proc, nested) =
                    lower_procedure(&mut env, unit.qualified_name, &unit.code, false, Some(class))?;
                procs.push(proc);
                work.extend(nested);
            }
        }
        is_first = false;
    }

    let globals: Vec<Global> = env
        .registry
        .globals()
        .map(|(_, info)| Global {
            name: info.qualified_name.clone(),
            ty: info.info.typ.clone(),
        })
        .collect();

    let mut types: Vec<RecordType> = env
        .registry
        .class_decls()
        .iter()
        .map(|class| RecordType {
            name: class.name.clone(),
            fields: class.fields.clone(),
        })
        .collect();

    if env.builtins.uses_iter_item() {
        types.push(RecordType {
            name: "PyIterItem".to_string(),
            fields: vec![
                Field {
                    name: "has_item".to_string(),
                    ty: IrType::Int,
                },
                Field {
                    name: "next_item".to_string(),
                    ty: IrType::Object,
                },
            ],
        });
    }
    if env.builtins.uses_method() {
        types.push(RecordType {
            name: "PyMethod".to_string(),
            fields: vec![],
        });
    }

    let builtins = env.builtins.to_decls();

    Ok(Module {
        procs,
        globals,
        types,
        builtins,
    })
}
