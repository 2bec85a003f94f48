//! End-to-end translation scenarios: small hand-assembled code objects in,
//! asserted-on `Module` shapes out.

use std::sync::Arc;

use pretty_assertions::assert_eq;

use pyir::input::{CodeObject, ConstValue, Instruction, Opcode};
use pyir::ir::{
    BuiltinDecl, Callee, Expr, Instr, IrType, Literal, LValue, Operand, Param, QualifiedName,
    Terminator,
};
use pyir::{to_module, Loc};

fn qn(value: &str) -> QualifiedName {
    QualifiedName::new(value, Loc::unknown(Arc::from("m.py")))
}

fn primitive_wrapper_decls() -> Vec<BuiltinDecl> {
    vec![
        BuiltinDecl {
            name: "python_int".to_string(),
            params: vec![IrType::Int],
            ret_ty: IrType::Object,
        },
        BuiltinDecl {
            name: "python_bool".to_string(),
            params: vec![IrType::Bool],
            ret_ty: IrType::Object,
        },
        BuiltinDecl {
            name: "python_string".to_string(),
            params: vec![IrType::String],
            ret_ty: IrType::Object,
        },
        BuiltinDecl {
            name: "python_tuple".to_string(),
            params: vec![IrType::Object],
            ret_ty: IrType::Object,
        },
    ]
}

/// `x = 42`: one block, one global, a store wrapped through `python_int`.
#[test]
fn scenario_assignment_to_a_global() {
    let mut code = CodeObject::new("m.py");
    code.co_consts = vec![ConstValue::Int(42)];
    code.co_names = vec!["x".to_string()];
    code.instructions = vec![
        Instruction::new(Opcode::LoadConst(0), 0),
        Instruction::new(Opcode::StoreName(0), 2),
    ];

    let module = to_module("m.py", code).expect("translation succeeds");

    assert_eq!(module.procs.len(), 1);
    let toplevel = &module.procs[0];
    assert_eq!(toplevel.name, qn("$module::toplevel"));
    assert_eq!(toplevel.params, Vec::<Param>::new());
    assert_eq!(toplevel.blocks.len(), 1);

    let block = &toplevel.blocks[0];
    assert_eq!(block.label, "b0");
    assert!(block.params.is_empty());
    assert_eq!(
        block.body,
        vec![
            Instr::Bind {
                id: 0,
                rhs: Expr::Call {
                    callee: Callee::Builtin("python_int".to_string()),
                    args: vec![Operand::Literal(Literal::Int(42))],
                },
            },
            Instr::Store {
                lval: LValue::Global(qn("$module::x")),
                rhs: Operand::Temp(0),
                ty: IrType::Object,
            },
        ]
    );
    assert_eq!(block.terminator, Terminator::Ret(Operand::Null));

    assert_eq!(module.globals.len(), 1);
    assert_eq!(module.globals[0].name, qn("$module::x"));
    assert_eq!(module.globals[0].ty, IrType::Object);
    assert!(module.types.is_empty());
    assert_eq!(module.builtins, primitive_wrapper_decls());
}

/// `x = 42; y = 10; print(x + y)`: two stores, two loads feeding a
/// `binary_add`, and one resolved `print` call.
#[test]
fn scenario_binary_add_and_print() {
    let mut code = CodeObject::new("m.py");
    code.co_consts = vec![ConstValue::Int(42), ConstValue::Int(10)];
    code.co_names = vec!["x".to_string(), "y".to_string(), "print".to_string()];
    code.instructions = vec![
        Instruction::new(Opcode::LoadConst(0), 0),
        Instruction::new(Opcode::StoreName(0), 2),
        Instruction::new(Opcode::LoadConst(1), 4),
        Instruction::new(Opcode::StoreName(1), 6),
        Instruction::new(Opcode::LoadName(2), 8),
        Instruction::new(Opcode::LoadName(0), 10),
        Instruction::new(Opcode::LoadName(1), 12),
        Instruction::new(Opcode::BinaryAdd, 14),
        Instruction::new(Opcode::CallFunction(1), 15),
    ];

    let module = to_module("m.py", code).expect("translation succeeds");

    assert_eq!(module.procs.len(), 1);
    let block = &module.procs[0].blocks[0];
    assert_eq!(
        block.body,
        vec![
            Instr::Bind {
                id: 0,
                rhs: Expr::Call {
                    callee: Callee::Builtin("python_int".to_string()),
                    args: vec![Operand::Literal(Literal::Int(42))],
                },
            },
            Instr::Store {
                lval: LValue::Global(qn("$module::x")),
                rhs: Operand::Temp(0),
                ty: IrType::Object,
            },
            Instr::Bind {
                id: 1,
                rhs: Expr::Call {
                    callee: Callee::Builtin("python_int".to_string()),
                    args: vec![Operand::Literal(Literal::Int(10))],
                },
            },
            Instr::Store {
                lval: LValue::Global(qn("$module::y")),
                rhs: Operand::Temp(1),
                ty: IrType::Object,
            },
            Instr::Load {
                id: 2,
                ty: IrType::Object,
                lval: LValue::Global(qn("$module::x")),
            },
            Instr::Load {
                id: 3,
                ty: IrType::Object,
                lval: LValue::Global(qn("$module::y")),
            },
            Instr::Bind {
                id: 4,
                rhs: Expr::Call {
                    callee: Callee::Builtin("binary_add".to_string()),
                    args: vec![Operand::Temp(2), Operand::Temp(3)],
                },
            },
            Instr::Bind {
                id: 5,
                rhs: Expr::Call {
                    callee: Callee::Builtin("print".to_string()),
                    args: vec![Operand::Temp(4)],
                },
            },
        ]
    );
    assert_eq!(block.terminator, Terminator::Ret(Operand::Null));

    let mut names: Vec<&str> = module.builtins.iter().map(|d| d.name.as_str()).collect();
    names.sort();
    assert_eq!(
        names,
        vec!["binary_add", "print", "python_bool", "python_int", "python_string", "python_tuple"]
    );
}

/// Two procedures, `coin` and `f`, where `f` branches on `coin()` and
/// returns one of its two parameters directly from each arm.
#[test]
fn scenario_if_else_both_arms_return() {
    let mut coin_code = CodeObject::new("m.py");
    coin_code.co_consts = vec![ConstValue::Bool(false)];
    coin_code.instructions = vec![
        Instruction::new(Opcode::LoadConst(0), 0),
        Instruction::new(Opcode::ReturnValue, 2),
    ];

    let mut f_code = CodeObject::new("m.py");
    f_code.co_varnames = vec!["x".to_string(), "y".to_string()];
    f_code.co_argcount = 2;
    f_code.co_names = vec!["coin".to_string()];
    f_code.instructions = vec![
        Instruction::new(Opcode::LoadGlobal(0), 0),
        Instruction::new(Opcode::CallFunction(0), 2),
        Instruction::new(Opcode::PopJumpIfFalse(10), 4),
        Instruction::new(Opcode::LoadFast(0), 6),
        Instruction::new(Opcode::ReturnValue, 8),
        Instruction::new(Opcode::LoadFast(1), 10),
        Instruction::new(Opcode::ReturnValue, 12),
    ];

    let mut code = CodeObject::new("m.py");
    code.co_consts = vec![
        ConstValue::Code(Arc::new(coin_code)),
        ConstValue::Code(Arc::new(f_code)),
    ];
    code.co_names = vec!["coin".to_string(), "f".to_string()];
    code.instructions = vec![
        Instruction::new(Opcode::LoadConst(0), 0),
        Instruction::new(Opcode::StoreName(0), 2),
        Instruction::new(Opcode::LoadConst(1), 4),
        Instruction::new(Opcode::StoreName(1), 6),
    ];

    let module = to_module("m.py", code).expect("translation succeeds");

    assert_eq!(module.procs.len(), 3);
    assert!(module.globals.is_empty());

    let toplevel = &module.procs[0];
    assert_eq!(toplevel.name, qn("$module::toplevel"));
    assert_eq!(toplevel.blocks.len(), 1);
    assert!(toplevel.blocks[0].body.is_empty());
    assert_eq!(toplevel.blocks[0].terminator, Terminator::Ret(Operand::Null));

    let coin = &module.procs[1];
    assert_eq!(coin.name, qn("$module::coin"));
    assert!(coin.params.is_empty());
    assert_eq!(coin.blocks.len(), 1);
    assert_eq!(
        coin.blocks[0].body,
        vec![Instr::Bind {
            id: 0,
            rhs: Expr::Call {
                callee: Callee::Builtin("python_bool".to_string()),
                args: vec![Operand::Literal(Literal::Bool(false))],
            },
        }]
    );
    assert_eq!(coin.blocks[0].terminator, Terminator::Ret(Operand::Temp(0)));

    let f = &module.procs[2];
    assert_eq!(f.name, qn("$module::f"));
    assert_eq!(
        f.params,
        vec![
            Param { name: "x".to_string(), ty: IrType::Object },
            Param { name: "y".to_string(), ty: IrType::Object },
        ]
    );
    assert_eq!(f.blocks.len(), 3);

    let entry = &f.blocks[0];
    assert_eq!(entry.label, "b0");
    assert!(entry.params.is_empty());
    assert_eq!(
        entry.body,
        vec![
            Instr::Bind {
                id: 0,
                rhs: Expr::Call {
                    callee: Callee::Proc(qn("$module::coin")),
                    args: vec![],
                },
            },
            Instr::Bind {
                id: 1,
                rhs: Expr::Call {
                    callee: Callee::Builtin("python_is_true".to_string()),
                    args: vec![Operand::Temp(0)],
                },
            },
        ]
    );
    let Terminator::Jump(targets) = &entry.terminator else {
        panic!("expected a two-way jump");
    };
    assert_eq!(targets.len(), 2);
    assert!(targets.iter().all(|t| t.args.is_empty()));
    let true_label = targets[0].label.clone();
    let false_label = targets[1].label.clone();
    assert_ne!(true_label, false_label);

    let true_block = f.blocks.iter().find(|b| b.label == true_label).unwrap();
    assert_eq!(
        true_block.body,
        vec![
            Instr::Prune { operand: Operand::Temp(1), negate: false },
            Instr::Load { id: 2, ty: IrType::Object, lval: LValue::Local("x".to_string()) },
        ]
    );
    assert_eq!(true_block.terminator, Terminator::Ret(Operand::Temp(2)));

    let false_block = f.blocks.iter().find(|b| b.label == false_label).unwrap();
    assert_eq!(
        false_block.body,
        vec![
            Instr::Prune { operand: Operand::Temp(1), negate: true },
            Instr::Load { id: 3, ty: IrType::Object, lval: LValue::Local("y".to_string()) },
        ]
    );
    assert_eq!(false_block.terminator, Terminator::Ret(Operand::Temp(3)));

    let mut names: Vec<&str> = module.builtins.iter().map(|d| d.name.as_str()).collect();
    names.sort();
    assert_eq!(
        names,
        vec!["python_bool", "python_int", "python_is_true", "python_string", "python_tuple"]
    );
}

/// `for x in range(10): print(x)`: a self-registered loop-header block
/// carrying the iterator as its one SSA parameter.
#[test]
fn scenario_for_loop_header_self_registers() {
    let mut code = CodeObject::new("m.py");
    code.co_names = vec!["range".to_string(), "print".to_string()];
    code.co_varnames = vec!["x".to_string()];
    code.co_consts = vec![ConstValue::Int(10)];
    code.instructions = vec![
        Instruction::new(Opcode::LoadName(0), 0), // range
        Instruction::new(Opcode::LoadConst(0), 2), // 10
        Instruction::new(Opcode::CallFunction(1), 4),
        Instruction::new(Opcode::GetIter, 6),
        Instruction::new(Opcode::ForIter(100), 8), // exit offset never reached in this body
        Instruction::new(Opcode::StoreFast(0), 10), // x = <item>
        Instruction::new(Opcode::LoadName(1), 12),  // print
        Instruction::new(Opcode::LoadFast(0), 14),  // x
        Instruction::new(Opcode::CallFunction(1), 16),
        Instruction::new(Opcode::ReturnValue, 18),
    ];

    let module = to_module("m.py", code).expect("translation succeeds");

    let toplevel = &module.procs[0];
    assert!(module.types.iter().any(|t| t.name == "PyIterItem"));
    let header = toplevel
        .blocks
        .iter()
        .find(|b| b.params.len() == 1)
        .expect("the loop header carries exactly one SSA parameter");
    assert_eq!(header.params[0].1, IrType::Object);
    assert!(header
        .body
        .iter()
        .any(|i| matches!(i, Instr::Bind { rhs: Expr::Call { callee: Callee::Builtin(n), .. }, .. } if n == "python_iter_next")));

    let mut names: Vec<&str> = module.builtins.iter().map(|d| d.name.as_str()).collect();
    names.sort();
    assert!(names.contains(&"python_iter"));
    assert!(names.contains(&"python_iter_next"));
}

/// The loop body's own back-edge (`JUMP_ABSOLUTE` to the `FOR_ITER` offset)
/// must close against the header's arity-1 registration: the iterator has
/// to still be live on the stack underneath the consumed loop variable.
#[test]
fn scenario_for_loop_back_edge_reuses_header() {
    let mut code = CodeObject::new("m.py");
    code.co_names = vec!["range".to_string()];
    code.co_varnames = vec!["x".to_string()];
    code.co_consts = vec![ConstValue::Int(10), ConstValue::None];
    code.instructions = vec![
        Instruction::new(Opcode::LoadName(0), 0),  // range
        Instruction::new(Opcode::LoadConst(0), 2), // 10
        Instruction::new(Opcode::CallFunction(1), 4),
        Instruction::new(Opcode::GetIter, 6),
        Instruction::new(Opcode::ForIter(14), 8), // header; exit offset 14
        Instruction::new(Opcode::StoreFast(0), 10), // x = <item>
        Instruction::new(Opcode::JumpAbsolute(8), 12), // back-edge to the header
        Instruction::new(Opcode::LoadConst(1), 14), // None (loop-exit block)
        Instruction::new(Opcode::ReturnValue, 16),
    ];

    let module = to_module("m.py", code).expect("the back-edge closes against the header's arity");

    let toplevel = &module.procs[0];
    let header = toplevel
        .blocks
        .iter()
        .find(|b| b.params.len() == 1)
        .expect("the loop header carries exactly one SSA parameter (the iterator)");
    let body = toplevel
        .blocks
        .iter()
        .find(|b| b.params.len() == 2)
        .expect("the loop body carries the iterator alongside the yielded item");
    assert_eq!(body.params[0].1, IrType::Object);
    assert_eq!(body.params[1].1, IrType::Object);

    let Terminator::Jump(targets) = &body.terminator else {
        panic!("the loop body ends in a jump back to the header, got {:?}", body.terminator);
    };
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].label, header.label);
    assert_eq!(targets[0].args.len(), 1, "the back-edge supplies only the iterator");

    let exit = toplevel
        .blocks
        .iter()
        .find(|b| b.params.is_empty() && matches!(b.terminator, Terminator::Ret(_)))
        .expect("the loop-exit block returns once the iterator is exhausted");
    assert!(matches!(exit.terminator, Terminator::Ret(Operand::Null)));
}

/// A callee reference threaded through a two-predecessor SSA join loses
/// its name-cell identity and so falls back to the generic `python_call`
/// shim rather than resolving directly, even though both edges happen to
/// carry the same underlying function.
#[test]
fn scenario_ssa_join_erases_direct_callee_resolution() {
    let mut foo_code = CodeObject::new("m.py");
    foo_code.co_varnames = vec!["v".to_string()];
    foo_code.co_argcount = 1;
    foo_code.co_consts = vec![ConstValue::None];
    foo_code.instructions = vec![
        Instruction::new(Opcode::LoadConst(0), 0),
        Instruction::new(Opcode::ReturnValue, 2),
    ];

    let mut f_code = CodeObject::new("m.py");
    f_code.co_varnames = vec!["x".to_string()];
    f_code.co_argcount = 1;
    f_code.co_names = vec!["foo".to_string()];
    f_code.co_consts = vec![ConstValue::Int(1), ConstValue::Int(0)];
    f_code.instructions = vec![
        Instruction::new(Opcode::LoadGlobal(0), 0), // foo
        Instruction::new(Opcode::LoadFast(0), 2),   // x
        Instruction::new(Opcode::PopJumpIfFalse(10), 4),
        Instruction::new(Opcode::LoadConst(0), 6), // 1
        Instruction::new(Opcode::JumpForward(12), 8),
        Instruction::new(Opcode::LoadConst(1), 10), // 0
        Instruction::new(Opcode::CallFunction(1), 12),
    ];

    let mut code = CodeObject::new("m.py");
    code.co_consts = vec![
        ConstValue::Code(Arc::new(foo_code)),
        ConstValue::Code(Arc::new(f_code)),
    ];
    code.co_names = vec!["foo".to_string(), "f".to_string()];
    code.instructions = vec![
        Instruction::new(Opcode::LoadConst(0), 0),
        Instruction::new(Opcode::StoreName(0), 2),
        Instruction::new(Opcode::LoadConst(1), 4),
        Instruction::new(Opcode::StoreName(1), 6),
    ];

    let module = to_module("m.py", code).expect("translation succeeds");

    let f = module.procs.iter().find(|p| p.name == qn("$module::f")).unwrap();
    let join = f
        .blocks
        .iter()
        .find(|b| b.params.len() == 2)
        .expect("the ternary join carries two live SSA values");
    assert!(join
        .body
        .iter()
        .any(|i| matches!(i, Instr::Bind { rhs: Expr::Call { callee: Callee::Builtin(n), .. }, .. } if n == "python_call")));

    assert!(module.builtins.iter().any(|d| d.name == "python_call"));
}

/// A class with `__init__`/`get`/`set` lowers to three methods plus a
/// record type with one inferred field, and a construction site resolves
/// through `python_class_constructor`.
#[test]
fn scenario_class_with_methods_and_constructor() {
    let mut init_code = CodeObject::new("m.py");
    init_code.co_varnames = vec!["self".to_string(), "x".to_string()];
    init_code.co_argcount = 2;
    init_code.co_names = vec!["x".to_string()];
    init_code.instructions = vec![
        Instruction::new(Opcode::LoadFast(0), 0), // self
        Instruction::new(Opcode::LoadFast(1), 2), // x
        Instruction::new(Opcode::StoreAttr(0), 4),
    ];

    let mut get_code = CodeObject::new("m.py");
    get_code.co_varnames = vec!["self".to_string()];
    get_code.co_argcount = 1;
    get_code.co_names = vec!["x".to_string()];
    get_code.instructions = vec![
        Instruction::new(Opcode::LoadFast(0), 0),
        Instruction::new(Opcode::LoadAttr(0), 2),
        Instruction::new(Opcode::ReturnValue, 4),
    ];

    let mut set_code = CodeObject::new("m.py");
    set_code.co_varnames = vec!["self".to_string(), "x".to_string()];
    set_code.co_argcount = 2;
    set_code.co_names = vec!["x".to_string()];
    set_code.instructions = vec![
        Instruction::new(Opcode::LoadFast(0), 0),
        Instruction::new(Opcode::LoadFast(1), 2),
        Instruction::new(Opcode::StoreAttr(0), 4),
    ];

    let mut class_body = CodeObject::new("m.py");
    class_body.co_consts = vec![
        ConstValue::Code(Arc::new(init_code)),
        ConstValue::Code(Arc::new(get_code)),
        ConstValue::Code(Arc::new(set_code)),
    ];
    class_body.co_names = vec!["__init__".to_string(), "get".to_string(), "set".to_string()];
    class_body.instructions = vec![
        Instruction::new(Opcode::LoadConst(0), 0),
        Instruction::new(Opcode::StoreName(0), 2),
        Instruction::new(Opcode::LoadConst(1), 4),
        Instruction::new(Opcode::StoreName(1), 6),
        Instruction::new(Opcode::LoadConst(2), 8),
        Instruction::new(Opcode::StoreName(2), 10),
    ];

    let mut code = CodeObject::new("m.py");
    code.co_consts = vec![
        ConstValue::Code(Arc::new(class_body)),
        ConstValue::Str("C".to_string()),
    ];
    code.co_names = vec!["C".to_string(), "instance".to_string()];
    code.instructions = vec![
        Instruction::new(Opcode::LoadBuildClass, 0),
        Instruction::new(Opcode::LoadConst(0), 2), // class body code
        Instruction::new(Opcode::LoadConst(1), 4), // class name "C"
        Instruction::new(Opcode::CallFunction(2), 6),
        Instruction::new(Opcode::StoreName(0), 8),
        Instruction::new(Opcode::LoadName(0), 10), // C
        Instruction::new(Opcode::CallFunction(0), 12),
        Instruction::new(Opcode::StoreName(1), 14), // instance = C()
    ];

    let module = to_module("m.py", code).expect("translation succeeds");

    let method_names: Vec<&str> = module
        .procs
        .iter()
        .map(|p| p.name.value.as_str())
        .filter(|n| n.starts_with("$module::C::"))
        .collect();
    assert_eq!(
        method_names,
        vec!["$module::C::__init__", "$module::C::get", "$module::C::set"]
    );

    let class_ty = module.types.iter().find(|t| t.name == "C").expect("class C is declared");
    assert_eq!(class_ty.fields.len(), 1);
    assert_eq!(class_ty.fields[0].name, "x");
    assert_eq!(class_ty.fields[0].ty, IrType::Object);

    let toplevel = &module.procs[0];
    assert!(toplevel.blocks[0]
        .body
        .iter()
        .any(|i| matches!(i, Instr::Bind { rhs: Expr::Call { callee: Callee::Builtin(n), .. }, .. } if n == "python_class")));

    assert!(module.builtins.iter().any(|d| d.name == "python_class"));

    let instance_global = module
        .globals
        .iter()
        .find(|g| g.name.value == "$module::instance")
        .expect("the construction site's result is stored to a global");
    assert_eq!(instance_global.ty, IrType::Named("C".to_string()));
    assert!(module.builtins.iter().any(|d| d.name == "python_class_constructor"));
}

/// Stack discipline: a procedure that reads more values than were ever
/// pushed is a translation error, not a panic.
#[test]
fn scenario_stack_underflow_is_a_translation_error() {
    let mut code = CodeObject::new("m.py");
    code.instructions = vec![Instruction::new(Opcode::ReturnValue, 0)];

    let err = to_module("m.py", code).expect_err("an empty stack cannot satisfy RETURN_VALUE");
    assert!(matches!(err, pyir::Error::StackUnderflow { .. }));
}
