//! Per-opcode lowering rules, and the driver loop that threads them
//! through one code object's flat instruction stream.
//!
//! The driver keeps exactly one block "open" at a time (`current_label`,
//! `current_params`, and `env.instr_buf`). Most opcodes only push and pop
//! the data stack and append to `instr_buf`; the control-flow opcodes
//! close the open block with a terminator and either open the next one
//! themselves (conditionals, `FOR_ITER`, since their fallthrough successor
//! is always the very next instruction) or leave it for the driver to
//! open once it reaches a label materialized by an earlier instruction
//! (`JUMP_ABSOLUTE`, `JUMP_FORWARD`, `RETURN_VALUE`).

use std::sync::Arc;

use crate::env::Env;
use crate::error::{Error, Result};
use crate::input::{CodeObject, ConstValue, Instruction, Opcode};
use crate::ir::{
    Block, Callee, Expr, IrType, Instr, JumpTarget, Literal, LValue, Operand, Param, Proc,
    QualifiedName, TempId, Terminator,
};
use crate::labels::{LabelInfo, Prelude};
use crate::loc::Loc;
use crate::registry::{Info, SymbolInfo};
use crate::stack::Cell;

pub(crate) const MODULE_PREFIX: &str = "$module";
pub(crate) const TOPLEVEL_NAME: &str = "toplevel";

pub(crate) fn function_qn(name: &str, loc: Loc) -> QualifiedName {
    QualifiedName::new(format!("{MODULE_PREFIX}::{name}"), loc)
}

pub(crate) fn class_qn(name: &str, loc: Loc) -> QualifiedName {
    QualifiedName::new(format!("{MODULE_PREFIX}::{name}"), loc)
}

pub(crate) fn method_qn(class: &str, name: &str, loc: Loc) -> QualifiedName {
    QualifiedName::new(format!("{MODULE_PREFIX}::{class}::{name}"), loc)
}

/// A nested code object discovered while lowering, waiting to be lowered
/// in turn by the module assembler.
#[derive(Debug, Clone)]
pub(crate) struct PendingUnit {
    pub qualified_name: QualifiedName,
    pub code: Arc<CodeObject>,
    pub kind: UnitKind,
}

#[derive(Debug, Clone)]
pub(crate) enum UnitKind {
    Function,
    Method { class: String },
    ClassBody { class: String },
}

/// Host functions resolved by name at a call site, as opposed to falling
/// back to the generic `python_call` shim.
const HOST_BUILTIN_ALLOWLIST: &[&str] = &[
    "print", "range", "len", "str", "int", "bool", "float", "list", "abs", "repr",
];

/// Lower one code object (a module top level, a function, or a method)
/// into a procedure declaration, plus whatever nested code objects its
/// body discovered.
pub(crate) fn lower_procedure(
    env: &mut Env,
    qualified_name: QualifiedName,
    code: &CodeObject,
    is_toplevel: bool,
    current_class: Option<String>,
) -> Result<(Proc, Vec<PendingUnit>)> {
    env.enter_proc(is_toplevel);
    env.current_class = current_class;

    let mut params = Vec::new();
    for idx in 0..code.co_argcount as usize {
        let name = code.co_varnames.get(idx).cloned().unwrap_or_default();
        env.registry.register_symbol(
            false,
            &name,
            SymbolInfo {
                qualified_name: QualifiedName::new(name.clone(), env.loc()),
                is_builtin: false,
                info: Info::object(),
            },
        );
        params.push(Param {
            name,
            ty: IrType::Object,
        });
    }

    let mut pending = Vec::new();
    let mut blocks = Vec::new();
    let mut current_label = env.mk_fresh_label();
    let mut current_params: Vec<(TempId, IrType)> = Vec::new();
    let mut block_is_closed = false;

    let instrs = &code.instructions;
    let mut i = 0;
    while i < instrs.len() {
        let instr = &instrs[i];
        if block_is_closed {
            let info = env
                .labels
                .label_of_offset(instr.offset)
                .cloned()
                .ok_or(Error::MissingLabel {
                    offset: instr.offset,
                })?;
            current_params = open_block(env, &info);
            env.labels.process_label(instr.offset);
            current_label = info.name;
            block_is_closed = false;
        }
        if let Some(line) = instr.starts_line {
            env.update_last_line(line);
        }

        let terminated = lower_instruction(
            env,
            code,
            instr,
            instrs,
            i,
            &mut pending,
            &mut blocks,
            &mut current_label,
            &mut current_params,
        )?;
        block_is_closed = terminated;

        i += 1;

        if !block_is_closed {
            if let Some(next) = instrs.get(i) {
                if let Some(info) = env.labels.label_of_offset(next.offset).cloned() {
                    if !info.processed {
                        let cells = env.stack.reset();
                        let args = force_all(env, code, next.offset, cells)?;
                        if args.len() != info.ssa_param_types.len() {
                            return Err(Error::SsaArityMismatch {
                                label: info.name.clone(),
                                expected: info.ssa_param_types.len(),
                                found: args.len(),
                            });
                        }
                        close_block(
                            env,
                            std::mem::take(&mut current_label),
                            std::mem::take(&mut current_params),
                            Terminator::Jump(vec![JumpTarget {
                                label: info.name.clone(),
                                args,
                            }]),
                            &mut blocks,
                        );
                        block_is_closed = true;
                    }
                }
            }
        }
    }

    if !block_is_closed {
        close_block(
            env,
            current_label,
            current_params,
            Terminator::Ret(Operand::Null),
            &mut blocks,
        );
    }

    env.current_class = None;

    let proc = Proc {
        name: qualified_name,
        params,
        ret_ty: IrType::Object,
        blocks,
    };
    Ok((proc, pending))
}

/// Lower a class body purely for its side effects (method and field
/// registration, nested `PendingUnit`s): no procedure is emitted for the
/// class body itself.
pub(crate) fn lower_class_body(
    env: &mut Env,
    class_name: &str,
    code: &CodeObject,
) -> Result<Vec<PendingUnit>> {
    let (_proc, pending) = lower_procedure(
        env,
        class_qn(class_name, env.loc()),
        code,
        false,
        Some(class_name.to_string()),
    )?;
    Ok(pending)
}

fn open_block(env: &mut Env, info: &LabelInfo) -> Vec<(TempId, IrType)> {
    env.enter_node();
    let mut params = Vec::with_capacity(info.ssa_param_types.len());
    let mut cells = Vec::with_capacity(info.ssa_param_types.len());
    for ty in &info.ssa_param_types {
        let id = env.mk_fresh_ident(Info::of(ty.clone()));
        params.push((id, ty.clone()));
        cells.push(Cell::Temp(id));
    }
    match &info.prelude {
        Prelude::Identity => {}
        Prelude::Prune(cond) => env.push_instr(Instr::Prune {
            operand: Operand::Temp(*cond),
            negate: false,
        }),
        Prelude::PruneNot(cond) => env.push_instr(Instr::Prune {
            operand: Operand::Temp(*cond),
            negate: true,
        }),
    }
    env.stack.restore(cells);
    params
}

fn close_block(
    env: &mut Env,
    label: String,
    params: Vec<(TempId, IrType)>,
    terminator: Terminator,
    blocks: &mut Vec<Block>,
) {
    let body = std::mem::take(&mut env.instr_buf);
    blocks.push(Block {
        label,
        params,
        body,
        terminator,
    });
}

/// Register (or fetch) the label pending at `offset`. The first call for
/// a given offset defines its parameter arity and prelude; later calls
/// only check the arity matches.
fn ensure_label(
    env: &mut Env,
    offset: u32,
    param_types: Vec<IrType>,
    prelude: Prelude,
) -> Result<String> {
    if let Some(existing) = env.labels.label_of_offset(offset) {
        if existing.ssa_param_types.len() != param_types.len() {
            return Err(Error::SsaArityMismatch {
                label: existing.name.clone(),
                expected: existing.ssa_param_types.len(),
                found: param_types.len(),
            });
        }
        return Ok(existing.name.clone());
    }
    let name = env.mk_fresh_label();
    env.labels
        .register_label(offset, LabelInfo::new(name.clone()).with_params(param_types).with_prelude(prelude))?;
    Ok(name)
}

fn force_all(env: &mut Env, code: &CodeObject, offset: u32, cells: Vec<Cell>) -> Result<Vec<Operand>> {
    cells
        .into_iter()
        .map(|cell| force_operand(env, code, offset, cell))
        .collect()
}

/// Resolve a stack cell into an `Operand`, emitting whatever load or
/// wrapper call is needed to produce it.
fn force_operand(env: &mut Env, code: &CodeObject, offset: u32, cell: Cell) -> Result<Operand> {
    match cell {
        Cell::Temp(id) => Ok(Operand::Temp(id)),
        Cell::Const(idx) => force_const(env, code, offset, idx),
        Cell::Name(idx) => force_name(env, code, idx, true),
        Cell::VarName(idx) => force_name(env, code, idx, false),
        Cell::Code { .. } => Err(Error::UnsupportedConstruct {
            offset,
            opname: "LOAD_CONST".to_string(),
            reason: "a code object must be consumed by a store or class-build, not used as a value".to_string(),
        }),
        Cell::Map(_) => Err(Error::UnsupportedConstruct {
            offset,
            opname: "LOAD_CONST".to_string(),
            reason: "a map cell cannot cross a block boundary".to_string(),
        }),
        Cell::BuildClassMarker => Err(Error::MalformedClassBuild { offset }),
    }
}

fn force_const(env: &mut Env, code: &CodeObject, offset: u32, idx: u32) -> Result<Operand> {
    let value = code
        .co_consts
        .get(idx as usize)
        .ok_or_else(|| Error::UnsupportedConstruct {
            offset,
            opname: "LOAD_CONST".to_string(),
            reason: format!("constant index {idx} out of range"),
        })?;
    match value {
        ConstValue::None => Ok(Operand::Null),
        ConstValue::Int(n) => Ok(wrap_primitive(env, "python_int", Operand::Literal(Literal::Int(*n)))),
        ConstValue::Bool(b) => Ok(wrap_primitive(env, "python_bool", Operand::Literal(Literal::Bool(*b)))),
        ConstValue::Str(s) => Ok(wrap_primitive(
            env,
            "python_string",
            Operand::Literal(Literal::Str(s.clone())),
        )),
        ConstValue::Float(_) => Err(Error::UnsupportedConstruct {
            offset,
            opname: "LOAD_CONST".to_string(),
            reason: "float constants are outside the modeled constant set (int, bool, string, None, code)".to_string(),
        }),
        ConstValue::Code(_) => Err(Error::UnsupportedConstruct {
            offset,
            opname: "LOAD_CONST".to_string(),
            reason: "a nested code object must be consumed by a store or class-build".to_string(),
        }),
    }
}

/// Wrap a literal in its primitive-wrapper call. The wrapper declarations
/// themselves are always emitted (see [`crate::builtins::PRIMITIVE_WRAPPERS`]),
/// so unlike other builtins this call site need not record anything.
fn wrap_primitive(env: &mut Env, name: &str, literal: Operand) -> Operand {
    let id = env.mk_fresh_ident(Info::object());
    env.push_instr(Instr::Bind {
        id,
        rhs: Expr::Call {
            callee: Callee::Builtin(name.to_string()),
            args: vec![literal],
        },
    });
    Operand::Temp(id)
}

fn force_name(env: &mut Env, code: &CodeObject, idx: u32, is_global_table: bool) -> Result<Operand> {
    let name = if is_global_table {
        code.co_names.get(idx as usize).cloned().unwrap_or_default()
    } else {
        code.co_varnames.get(idx as usize).cloned().unwrap_or_default()
    };
    if let Some(symbol) = env.registry.lookup_symbol_scoped(&name).cloned() {
        let is_local = env.registry.lookup_symbol(false, &name).is_some();
        let id = env.mk_fresh_ident(Info::of(symbol.info.typ.clone()));
        let lval = if is_local {
            LValue::Local(name)
        } else {
            LValue::Global(symbol.qualified_name)
        };
        env.push_instr(Instr::Load {
            id,
            ty: symbol.info.typ,
            lval,
        });
        return Ok(Operand::Temp(id));
    }
    // First read of a name never stored in this pass: auto-vivify it as an
    // `Object`-typed symbol in the scope its table implies.
    let qn = QualifiedName::new(format!("{MODULE_PREFIX}::{name}"), env.loc());
    let info = Info::object();
    env.registry.register_symbol(
        is_global_table,
        &name,
        SymbolInfo {
            qualified_name: qn.clone(),
            is_builtin: false,
            info: info.clone(),
        },
    );
    let id = env.mk_fresh_ident(info);
    let lval = if is_global_table {
        LValue::Global(qn)
    } else {
        LValue::Local(name)
    };
    env.push_instr(Instr::Load {
        id,
        ty: IrType::Object,
        lval,
    });
    Ok(Operand::Temp(id))
}

fn infer_cell_type(env: &Env, code: &CodeObject, cell: &Cell) -> IrType {
    match cell {
        // Every primitive constant is boxed through a wrapper builtin that
        // returns `Object`; only `None` and a nested code object keep a
        // more specific type once resolved.
        Cell::Const(idx) => match code.co_consts.get(*idx as usize) {
            Some(ConstValue::None) => IrType::None,
            Some(ConstValue::Code(_)) => IrType::Code,
            Some(_) => IrType::Object,
            None => IrType::Object,
        },
        Cell::Temp(id) => env
            .get_ident_info(*id)
            .map(|info| info.typ.clone())
            .unwrap_or(IrType::Object),
        Cell::Name(idx) => code
            .co_names
            .get(*idx as usize)
            .and_then(|name| env.registry.lookup_symbol_scoped(name))
            .map(|s| s.info.typ.clone())
            .unwrap_or(IrType::Object),
        Cell::VarName(idx) => code
            .co_varnames
            .get(*idx as usize)
            .and_then(|name| env.registry.lookup_symbol_scoped(name))
            .map(|s| s.info.typ.clone())
            .unwrap_or(IrType::Object),
        Cell::Code { .. } => IrType::Code,
        Cell::Map(_) | Cell::BuildClassMarker => IrType::Object,
    }
}

enum StoreKind {
    Name,
    Global,
    Fast,
}

#[allow(clippy::too_many_arguments)]
fn lower_instruction(
    env: &mut Env,
    code: &CodeObject,
    instr: &Instruction,
    all_instrs: &[Instruction],
    index: usize,
    pending: &mut Vec<PendingUnit>,
    blocks: &mut Vec<Block>,
    current_label: &mut String,
    current_params: &mut Vec<(TempId, IrType)>,
) -> Result<bool> {
    let offset = instr.offset;
    match &instr.op {
        Opcode::LoadConst(idx) => {
            let value = code
                .co_consts
                .get(*idx as usize)
                .ok_or_else(|| Error::UnsupportedConstruct {
                    offset,
                    opname: "LOAD_CONST".to_string(),
                    reason: format!("constant index {idx} out of range"),
                })?;
            if let ConstValue::Code(nested) = value {
                env.stack.push(Cell::Code {
                    is_fun_or_class: true,
                    qualified_name: String::new(),
                    code: nested.clone(),
                });
            } else {
                env.stack.push(Cell::Const(*idx));
            }
            Ok(false)
        }
        Opcode::LoadName(idx) | Opcode::LoadGlobal(idx) => {
            env.stack.push(Cell::Name(*idx));
            Ok(false)
        }
        Opcode::LoadFast(idx) => {
            env.stack.push(Cell::VarName(*idx));
            Ok(false)
        }
        Opcode::StoreName(idx) => lower_store(env, code, offset, *idx, StoreKind::Name, pending).map(|_| false),
        Opcode::StoreGlobal(idx) => {
            lower_store(env, code, offset, *idx, StoreKind::Global, pending).map(|_| false)
        }
        Opcode::StoreFast(idx) => lower_store(env, code, offset, *idx, StoreKind::Fast, pending).map(|_| false),
        Opcode::LoadAttr(idx) => {
            let base_cell = env.stack.pop().ok_or(Error::StackUnderflow {
                offset,
                opname: "LOAD_ATTR".to_string(),
            })?;
            let base_op = force_operand(env, code, offset, base_cell)?;
            let attr = code.co_names.get(*idx as usize).cloned().unwrap_or_default();
            let id = env.mk_fresh_ident(Info::object());
            env.push_instr(Instr::Bind {
                id,
                rhs: Expr::LoadAttr { base: base_op, attr },
            });
            env.stack.push(Cell::Temp(id));
            Ok(false)
        }
        Opcode::StoreAttr(idx) => {
            let value_cell = env.stack.pop().ok_or(Error::StackUnderflow {
                offset,
                opname: "STORE_ATTR".to_string(),
            })?;
            let base_cell = env.stack.pop().ok_or(Error::StackUnderflow {
                offset,
                opname: "STORE_ATTR".to_string(),
            })?;
            let is_self_store = matches!(base_cell, Cell::VarName(0));
            let ty = infer_cell_type(env, code, &value_cell);
            let attr = code.co_names.get(*idx as usize).cloned().unwrap_or_default();
            if is_self_store {
                if let Some(class) = env.current_class.clone() {
                    env.registry.register_class_field(&class, &attr, ty.clone());
                }
            }
            let base_op = force_operand(env, code, offset, base_cell)?;
            let value_op = force_operand(env, code, offset, value_cell)?;
            env.push_instr(Instr::StoreAttr {
                base: base_op,
                attr,
                value: value_op,
                ty,
            });
            Ok(false)
        }
        Opcode::BinaryAdd => {
            let rhs_cell = env.stack.pop().ok_or(Error::StackUnderflow {
                offset,
                opname: "BINARY_ADD".to_string(),
            })?;
            let lhs_cell = env.stack.pop().ok_or(Error::StackUnderflow {
                offset,
                opname: "BINARY_ADD".to_string(),
            })?;
            let lhs = force_operand(env, code, offset, lhs_cell)?;
            let rhs = force_operand(env, code, offset, rhs_cell)?;
            env.builtins.record(crate::builtins::BuiltinTag::BinaryAdd);
            let id = env.mk_fresh_ident(Info::object());
            env.push_instr(Instr::Bind {
                id,
                rhs: Expr::Call {
                    callee: Callee::Builtin("binary_add".to_string()),
                    args: vec![lhs, rhs],
                },
            });
            env.stack.push(Cell::Temp(id));
            Ok(false)
        }
        Opcode::CallFunction(n) => lower_call_function(env, code, offset, *n, pending).map(|_| false),
        Opcode::LoadMethod(idx) => {
            let base_cell = env.stack.pop().ok_or(Error::StackUnderflow {
                offset,
                opname: "LOAD_METHOD".to_string(),
            })?;
            let base_op = force_operand(env, code, offset, base_cell)?;
            let name = code.co_names.get(*idx as usize).cloned().unwrap_or_default();
            env.builtins.record(crate::builtins::BuiltinTag::PythonLoadMethod);
            let id = env.mk_fresh_ident(Info::of(IrType::Method));
            env.push_instr(Instr::Bind {
                id,
                rhs: Expr::Call {
                    callee: Callee::Builtin("python_load_method".to_string()),
                    args: vec![base_op, Operand::Literal(Literal::Str(name))],
                },
            });
            env.stack.push(Cell::Temp(id));
            Ok(false)
        }
        Opcode::CallMethod(n) => {
            let mut arg_cells = Vec::with_capacity(*n as usize);
            for _ in 0..*n {
                arg_cells.push(env.stack.pop().ok_or(Error::StackUnderflow {
                    offset,
                    opname: "CALL_METHOD".to_string(),
                })?);
            }
            arg_cells.reverse();
            let method_cell = env.stack.pop().ok_or(Error::StackUnderflow {
                offset,
                opname: "CALL_METHOD".to_string(),
            })?;
            let method_op = force_operand(env, code, offset, method_cell)?;
            let mut args = vec![method_op];
            for cell in arg_cells {
                args.push(force_operand(env, code, offset, cell)?);
            }
            env.builtins.record(crate::builtins::BuiltinTag::PythonCallMethod);
            let id = env.mk_fresh_ident(Info::object());
            env.push_instr(Instr::Bind {
                id,
                rhs: Expr::Call {
                    callee: Callee::Builtin("python_call_method".to_string()),
                    args,
                },
            });
            env.stack.push(Cell::Temp(id));
            Ok(false)
        }
        Opcode::GetIter => {
            let cell = env.stack.pop().ok_or(Error::StackUnderflow {
                offset,
                opname: "GET_ITER".to_string(),
            })?;
            let op = force_operand(env, code, offset, cell)?;
            env.builtins.record(crate::builtins::BuiltinTag::PythonIter);
            let id = env.mk_fresh_ident(Info::object());
            env.push_instr(Instr::Bind {
                id,
                rhs: Expr::Call {
                    callee: Callee::Builtin("python_iter".to_string()),
                    args: vec![op],
                },
            });
            env.stack.push(Cell::Temp(id));
            Ok(false)
        }
        Opcode::ForIter(off) => {
            let next_offset = all_instrs
                .get(index + 1)
                .map(|i| i.offset)
                .ok_or(Error::UnsupportedConstruct {
                    offset,
                    opname: "FOR_ITER".to_string(),
                    reason: "a loop header must be followed by at least one body instruction".to_string(),
                })?;
            lower_for_iter(env, offset, *off, next_offset, blocks, current_label, current_params)
        }
        Opcode::PopJumpIfFalse(off) => lower_conditional(
            env,
            code,
            offset,
            CondKind::PopFalse,
            *off,
            all_instrs.get(index + 1).map(|i| i.offset),
            blocks,
            current_label,
            current_params,
        ),
        Opcode::PopJumpIfTrue(off) => lower_conditional(
            env,
            code,
            offset,
            CondKind::PopTrue,
            *off,
            all_instrs.get(index + 1).map(|i| i.offset),
            blocks,
            current_label,
            current_params,
        ),
        Opcode::JumpIfFalseOrPop(off) => lower_conditional(
            env,
            code,
            offset,
            CondKind::OrPopFalse,
            *off,
            all_instrs.get(index + 1).map(|i| i.offset),
            blocks,
            current_label,
            current_params,
        ),
        Opcode::JumpIfTrueOrPop(off) => lower_conditional(
            env,
            code,
            offset,
            CondKind::OrPopTrue,
            *off,
            all_instrs.get(index + 1).map(|i| i.offset),
            blocks,
            current_label,
            current_params,
        ),
        Opcode::JumpAbsolute(off) | Opcode::JumpForward(off) => {
            let cells = env.stack.reset();
            let args = force_all(env, code, offset, cells)?;
            let types = args
                .iter()
                .map(|op| operand_type(env, op))
                .collect::<Vec<_>>();
            let label = ensure_label(env, *off, types, Prelude::Identity)?;
            close_block(
                env,
                std::mem::take(current_label),
                std::mem::take(current_params),
                Terminator::Jump(vec![JumpTarget { label, args }]),
                blocks,
            );
            Ok(true)
        }
        Opcode::ReturnValue => {
            let cell = env.stack.pop().ok_or(Error::StackUnderflow {
                offset,
                opname: "RETURN_VALUE".to_string(),
            })?;
            let op = force_operand(env, code, offset, cell)?;
            close_block(
                env,
                std::mem::take(current_label),
                std::mem::take(current_params),
                Terminator::Ret(op),
                blocks,
            );
            Ok(true)
        }
        Opcode::LoadBuildClass => {
            env.stack.push(Cell::BuildClassMarker);
            Ok(false)
        }
    }
}

fn operand_type(env: &Env, op: &Operand) -> IrType {
    match op {
        Operand::Temp(id) => env.get_ident_info(*id).map(|i| i.typ.clone()).unwrap_or(IrType::Object),
        Operand::Literal(_) => IrType::Object,
        Operand::Null => IrType::None,
    }
}

fn lower_store(
    env: &mut Env,
    code: &CodeObject,
    offset: u32,
    idx: u32,
    kind: StoreKind,
    pending: &mut Vec<PendingUnit>,
) -> Result<()> {
    let opname = match kind {
        StoreKind::Name => "STORE_NAME",
        StoreKind::Global => "STORE_GLOBAL",
        StoreKind::Fast => "STORE_FAST",
    };
    let cell = env.stack.pop().ok_or(Error::StackUnderflow {
        offset,
        opname: opname.to_string(),
    })?;
    let name = match kind {
        StoreKind::Name | StoreKind::Global => code.co_names.get(idx as usize).cloned(),
        StoreKind::Fast => code.co_varnames.get(idx as usize).cloned(),
    }
    .unwrap_or_default();

    if let Cell::Code { code: nested, .. } = &cell {
        let param_types = vec![IrType::Object; nested.co_argcount as usize];
        let ret_ty = IrType::Object;
        if let Some(class) = env.current_class.clone() {
            env.registry.register_method(&class, &name, param_types, ret_ty);
            pending.push(PendingUnit {
                qualified_name: method_qn(&class, &name, env.loc()),
                code: nested.clone(),
                kind: UnitKind::Method { class },
            });
        } else {
            env.registry.register_function(&name, param_types, ret_ty);
            pending.push(PendingUnit {
                qualified_name: function_qn(&name, env.loc()),
                code: nested.clone(),
                kind: UnitKind::Function,
            });
        }
        return Ok(());
    }

    let ty = infer_cell_type(env, code, &cell);
    let op = force_operand(env, code, offset, cell)?;
    let is_global = match kind {
        StoreKind::Global => true,
        StoreKind::Fast => false,
        StoreKind::Name => env.is_toplevel(),
    };
    let lval = if is_global {
        let qn = QualifiedName::new(format!("{MODULE_PREFIX}::{name}"), env.loc());
        env.registry.register_symbol(
            true,
            &name,
            SymbolInfo {
                qualified_name: qn.clone(),
                is_builtin: false,
                info: Info::of(ty.clone()),
            },
        );
        LValue::Global(qn)
    } else {
        env.registry.register_symbol(
            false,
            &name,
            SymbolInfo {
                qualified_name: QualifiedName::new(name.clone(), env.loc()),
                is_builtin: false,
                info: Info::of(ty.clone()),
            },
        );
        LValue::Local(name)
    };
    env.push_instr(Instr::Store {
        lval,
        rhs: op,
        ty,
    });
    Ok(())
}

fn lower_call_function(
    env: &mut Env,
    code: &CodeObject,
    offset: u32,
    n: u32,
    pending: &mut Vec<PendingUnit>,
) -> Result<()> {
    let mut arg_cells = Vec::with_capacity(n as usize);
    for _ in 0..n {
        arg_cells.push(env.stack.pop().ok_or(Error::StackUnderflow {
            offset,
            opname: "CALL_FUNCTION".to_string(),
        })?);
    }
    arg_cells.reverse();
    let callee_cell = env.stack.pop().ok_or(Error::StackUnderflow {
        offset,
        opname: "CALL_FUNCTION".to_string(),
    })?;

    if matches!(callee_cell, Cell::BuildClassMarker) {
        return lower_class_build(env, code, offset, arg_cells, pending);
    }

    let resolved_name = match &callee_cell {
        Cell::Name(idx) => code.co_names.get(*idx as usize).cloned(),
        Cell::VarName(idx) => code.co_varnames.get(*idx as usize).cloned(),
        _ => None,
    };

    if let Some(name) = resolved_name {
        if let Some(sig) = env.registry.lookup_signature(None, &name).cloned() {
            let args = force_all(env, code, offset, arg_cells)?;
            let id = env.mk_fresh_ident(Info::of(sig.ret_ty.clone()));
            env.push_instr(Instr::Bind {
                id,
                rhs: Expr::Call {
                    callee: Callee::Proc(function_qn(&name, env.loc())),
                    args,
                },
            });
            env.stack.push(Cell::Temp(id));
            return Ok(());
        }
        if HOST_BUILTIN_ALLOWLIST.contains(&name.as_str()) {
            let args = force_all(env, code, offset, arg_cells)?;
            env.builtins.record(crate::builtins::BuiltinTag::Host(name.clone()));
            let id = env.mk_fresh_ident(Info::object());
            env.push_instr(Instr::Bind {
                id,
                rhs: Expr::Call {
                    callee: Callee::Builtin(name),
                    args,
                },
            });
            env.stack.push(Cell::Temp(id));
            return Ok(());
        }
        if env.registry.get_classes().contains(&name) {
            let mut args = vec![Operand::Literal(Literal::Str(name.clone()))];
            args.extend(force_all(env, code, offset, arg_cells)?);
            env.builtins.record(crate::builtins::BuiltinTag::PythonClassConstructor);
            let id = env.mk_fresh_ident(Info::of(IrType::Named(name.clone())));
            env.push_instr(Instr::Bind {
                id,
                rhs: Expr::Call {
                    callee: Callee::Builtin("python_class_constructor".to_string()),
                    args,
                },
            });
            env.stack.push(Cell::Temp(id));
            return Ok(());
        }
    }

    let callee_op = force_operand(env, code, offset, callee_cell)?;
    let mut args = vec![callee_op];
    args.extend(force_all(env, code, offset, arg_cells)?);
    env.builtins.record(crate::builtins::BuiltinTag::PythonCall);
    let id = env.mk_fresh_ident(Info::object());
    env.push_instr(Instr::Bind {
        id,
        rhs: Expr::Call {
            callee: Callee::Builtin("python_call".to_string()),
            args,
        },
    });
    env.stack.push(Cell::Temp(id));
    Ok(())
}

fn lower_class_build(
    env: &mut Env,
    code: &CodeObject,
    offset: u32,
    mut args: Vec<Cell>,
    pending: &mut Vec<PendingUnit>,
) -> Result<()> {
    if args.len() < 2 {
        return Err(Error::MalformedClassBuild { offset });
    }
    let bases = args.split_off(2);
    let _ = bases;
    let name_cell = args.remove(1);
    let code_cell = args.remove(0);

    let class_name = match name_cell {
        Cell::Const(idx) => match code.co_consts.get(idx as usize) {
            Some(ConstValue::Str(s)) => s.clone(),
            _ => return Err(Error::MalformedClassBuild { offset }),
        },
        _ => return Err(Error::MalformedClassBuild { offset }),
    };
    let nested = match code_cell {
        Cell::Code { code, .. } => code,
        _ => return Err(Error::MalformedClassBuild { offset }),
    };

    env.registry.register_class(&class_name);
    pending.push(PendingUnit {
        qualified_name: class_qn(&class_name, env.loc()),
        code: nested,
        kind: UnitKind::ClassBody {
            class: class_name.clone(),
        },
    });

    env.builtins.record(crate::builtins::BuiltinTag::PythonClass);
    let id = env.mk_fresh_ident(Info::class());
    env.push_instr(Instr::Bind {
        id,
        rhs: Expr::Call {
            callee: Callee::Builtin("python_class".to_string()),
            args: vec![Operand::Literal(Literal::Str(class_name))],
        },
    });
    env.stack.push(Cell::Temp(id));
    Ok(())
}

enum CondKind {
    PopFalse,
    PopTrue,
    OrPopFalse,
    OrPopTrue,
}

#[allow(clippy::too_many_arguments)]
fn lower_conditional(
    env: &mut Env,
    code: &CodeObject,
    offset: u32,
    kind: CondKind,
    off: u32,
    next_offset: Option<u32>,
    blocks: &mut Vec<Block>,
    current_label: &mut String,
    current_params: &mut Vec<(TempId, IrType)>,
) -> Result<bool> {
    let next_offset = next_offset.ok_or(Error::UnsupportedConstruct {
        offset,
        opname: "conditional jump".to_string(),
        reason: "a conditional jump must be followed by a fallthrough instruction".to_string(),
    })?;

    let pops = matches!(kind, CondKind::PopFalse | CondKind::PopTrue);
    let v_cell = if pops {
        env.stack.pop().ok_or(Error::StackUnderflow {
            offset,
            opname: "conditional jump".to_string(),
        })?
    } else {
        env.stack.peek().cloned().ok_or(Error::StackUnderflow {
            offset,
            opname: "conditional jump".to_string(),
        })?
    };
    let v_op = force_operand(env, code, offset, v_cell)?;
    env.builtins.record(crate::builtins::BuiltinTag::IsTrue);
    let cond = env.mk_fresh_ident(Info::of(IrType::Int));
    env.push_instr(Instr::Bind {
        id: cond,
        rhs: Expr::Call {
            callee: Callee::Builtin("python_is_true".to_string()),
            args: vec![v_op],
        },
    });

    let without_v = if pops {
        env.stack.snapshot()
    } else {
        let mut cells = env.stack.snapshot();
        cells.pop();
        cells
    };
    let with_v = if pops { None } else { Some(env.stack.snapshot()) };

    let without_v_ops = force_all(env, code, offset, without_v)?;
    let without_v_types: Vec<IrType> = without_v_ops.iter().map(|op| operand_type(env, op)).collect();

    let (off_prelude, next_prelude, off_args, off_types) = match kind {
        CondKind::PopFalse => (
            Prelude::PruneNot(cond),
            Prelude::Prune(cond),
            without_v_ops.clone(),
            without_v_types.clone(),
        ),
        CondKind::PopTrue => (
            Prelude::Prune(cond),
            Prelude::PruneNot(cond),
            without_v_ops.clone(),
            without_v_types.clone(),
        ),
        CondKind::OrPopFalse => {
            let with_v_ops = force_all(env, code, offset, with_v.unwrap())?;
            let with_v_types: Vec<IrType> = with_v_ops.iter().map(|op| operand_type(env, op)).collect();
            (Prelude::PruneNot(cond), Prelude::Prune(cond), with_v_ops, with_v_types)
        }
        CondKind::OrPopTrue => {
            let with_v_ops = force_all(env, code, offset, with_v.unwrap())?;
            let with_v_types: Vec<IrType> = with_v_ops.iter().map(|op| operand_type(env, op)).collect();
            (Prelude::Prune(cond), Prelude::PruneNot(cond), with_v_ops, with_v_types)
        }
    };

    let off_label = ensure_label(env, off, off_types, off_prelude)?;
    let next_label = ensure_label(env, next_offset, without_v_types, next_prelude)?;

    close_block(
        env,
        std::mem::take(current_label),
        std::mem::take(current_params),
        Terminator::Jump(vec![
            JumpTarget {
                label: next_label.clone(),
                args: without_v_ops,
            },
            JumpTarget {
                label: off_label,
                args: off_args,
            },
        ]),
        blocks,
    );

    let info = env.labels.label_of_offset(next_offset).cloned().unwrap();
    *current_params = open_block(env, &info);
    env.labels.process_label(next_offset);
    *current_label = info.name;

    Ok(false)
}

#[allow(clippy::too_many_arguments)]
fn lower_for_iter(
    env: &mut Env,
    offset: u32,
    exit_off: u32,
    next_offset: u32,
    blocks: &mut Vec<Block>,
    current_label: &mut String,
    current_params: &mut Vec<(TempId, IrType)>,
) -> Result<bool> {
    let iter_cell = env.stack.pop().ok_or(Error::StackUnderflow {
        offset,
        opname: "FOR_ITER".to_string(),
    })?;
    let iter_op = match iter_cell {
        Cell::Temp(id) => Operand::Temp(id),
        other => return force_for_iter_cell(env, offset, other),
    };

    let header_name = env.mk_fresh_label();
    env.labels.register_label(
        offset,
        LabelInfo::new(header_name.clone())
            .with_params(vec![IrType::Object])
            .with_prelude(Prelude::Identity),
    )?;
    close_block(
        env,
        std::mem::take(current_label),
        std::mem::take(current_params),
        Terminator::Jump(vec![JumpTarget {
            label: header_name.clone(),
            args: vec![iter_op],
        }]),
        blocks,
    );

    let header_info = env.labels.label_of_offset(offset).cloned().unwrap();
    let header_params = open_block(env, &header_info);
    env.labels.process_label(offset);
    let it_id = header_params[0].0;

    let it_next = env.mk_fresh_ident(Info::of(IrType::PyIterItem));
    env.builtins.record(crate::builtins::BuiltinTag::PythonIterNext);
    env.push_instr(Instr::Bind {
        id: it_next,
        rhs: Expr::Call {
            callee: Callee::Builtin("python_iter_next".to_string()),
            args: vec![Operand::Temp(it_id)],
        },
    });

    let has_item = env.mk_fresh_ident(Info::of(IrType::Int));
    env.push_instr(Instr::Bind {
        id: has_item,
        rhs: Expr::LoadAttr {
            base: Operand::Temp(it_next),
            attr: "has_item".to_string(),
        },
    });

    let next_item = env.mk_fresh_ident(Info::object());
    env.push_instr(Instr::Bind {
        id: next_item,
        rhs: Expr::LoadAttr {
            base: Operand::Temp(it_next),
            attr: "next_item".to_string(),
        },
    });

    // The iterator stays live beneath the yielded item, exactly as it does on
    // the real evaluation stack: FOR_ITER pushes `next_item` on top of the
    // iterator it peeked, a body-local STORE_FAST only consumes `next_item`,
    // and a back-edge (JUMP_ABSOLUTE to this offset) needs the iterator
    // still sitting on the stack to supply the header's single argument.
    let body_label = ensure_label(
        env,
        next_offset,
        vec![IrType::Object, IrType::Object],
        Prelude::Prune(has_item),
    )?;
    let exit_label = ensure_label(env, exit_off, vec![], Prelude::PruneNot(has_item))?;

    close_block(
        env,
        header_name,
        vec![(it_id, IrType::Object)],
        Terminator::Jump(vec![
            JumpTarget {
                label: body_label,
                args: vec![Operand::Temp(it_id), Operand::Temp(next_item)],
            },
            JumpTarget {
                label: exit_label,
                args: vec![],
            },
        ]),
        blocks,
    );

    let body_info = env.labels.label_of_offset(next_offset).cloned().unwrap();
    *current_params = open_block(env, &body_info);
    env.labels.process_label(next_offset);
    *current_label = body_info.name;

    Ok(false)
}

fn force_for_iter_cell(env: &mut Env, offset: u32, cell: Cell) -> Result<bool> {
    let _ = (env, cell);
    Err(Error::UnsupportedConstruct {
        offset,
        opname: "FOR_ITER".to_string(),
        reason: "the iterable must already be bound to an SSA temporary by GET_ITER".to_string(),
    })
}
