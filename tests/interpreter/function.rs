//! Function declarations and expressions, calls, `this`, `arguments`,
//! constructors and the recursion cap.

use es5run::vm::builder::{reg, ProgramBuilder, MIN_REG};
use es5run::vm::opcode::INVALID_IDX;
use es5run::vm::{ArgKind, MetaType, Opcode};
use es5run::EngineError;

use super::{exit_on, run, run_err};

fn prologue(b: &mut ProgramBuilder) {
    b.emit(Opcode::RegVarDecl { min: MIN_REG, max: reg(15) });
}

/// Emit a function declaration: parameter markers, the body-end marker and
/// the body in its own literal scope.
fn emit_func_decl(
    b: &mut ProgramBuilder,
    name: &str,
    params: &[&str],
    body: impl FnOnce(&mut ProgramBuilder),
) {
    let name_uid = b.ident(name);
    b.emit(Opcode::FuncDeclN { name: name_uid, argc: params.len() as u8 });
    for param in params {
        let uid = b.ident(param);
        b.emit(Opcode::Meta { meta_type: MetaType::Varg, d1: uid, d2: 0 });
    }
    let end_meta = b.emit(Opcode::Meta { meta_type: MetaType::FunctionEnd, d1: 0, d2: 0 });
    b.begin_scope();
    body(b);
    b.end_scope();
    let (d1, d2) = ProgramBuilder::delta(end_meta, b.here());
    b.patch(end_meta, Opcode::Meta { meta_type: MetaType::FunctionEnd, d1, d2 });
}

/// Emit a function expression into a register; `name` makes it a named
/// expression with its own immutable self-binding.
fn emit_func_expr(
    b: &mut ProgramBuilder,
    lhs: u8,
    name: Option<&str>,
    params: &[&str],
    body: impl FnOnce(&mut ProgramBuilder),
) {
    let name_uid = name.map(|n| b.ident(n)).unwrap_or(INVALID_IDX);
    b.emit(Opcode::FuncExprN { lhs, name: name_uid, argc: params.len() as u8 });
    for param in params {
        let uid = b.ident(param);
        b.emit(Opcode::Meta { meta_type: MetaType::Varg, d1: uid, d2: 0 });
    }
    let end_meta = b.emit(Opcode::Meta { meta_type: MetaType::FunctionEnd, d1: 0, d2: 0 });
    b.begin_scope();
    body(b);
    b.end_scope();
    let (d1, d2) = ProgramBuilder::delta(end_meta, b.here());
    b.patch(end_meta, Opcode::Meta { meta_type: MetaType::FunctionEnd, d1, d2 });
}

#[test]
fn declared_function_subtracts() {
    // function f(a, b) { return a - b; } exit(f(10, 4) === 6);
    let mut b = ProgramBuilder::new();
    prologue(&mut b);
    emit_func_decl(&mut b, "f", &["a", "b"], |b| {
        b.emit(Opcode::RegVarDecl { min: MIN_REG, max: reg(2) });
        let a = b.ident("a");
        b.emit(Opcode::Assignment { dst: reg(0), kind: ArgKind::Variable, src: a });
        let bb = b.ident("b");
        b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::Variable, src: bb });
        b.emit(Opcode::Substraction { dst: reg(2), left: reg(0), right: reg(1) });
        b.emit(Opcode::RetVal { var: reg(2) });
    });

    let f = b.ident("f");
    b.emit(Opcode::CallN { lhs: reg(0), func: f, argc: 2 });
    b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::SmallInt, src: 10 });
    b.emit(Opcode::Meta { meta_type: MetaType::Varg, d1: reg(1), d2: 0 });
    b.emit(Opcode::Assignment { dst: reg(2), kind: ArgKind::SmallInt, src: 4 });
    b.emit(Opcode::Meta { meta_type: MetaType::Varg, d1: reg(2), d2: 0 });

    b.emit(Opcode::Assignment { dst: reg(3), kind: ArgKind::SmallInt, src: 6 });
    b.emit(Opcode::EqualValueType { dst: reg(4), left: reg(0), right: reg(3) });
    exit_on(&mut b, reg(4));

    assert!(run(b.finish()));
}

#[test]
fn empty_body_returns_undefined() {
    // function e() {} exit(e() === undefined);
    let mut b = ProgramBuilder::new();
    prologue(&mut b);
    emit_func_decl(&mut b, "e", &[], |b| {
        b.emit(Opcode::RegVarDecl { min: MIN_REG, max: MIN_REG });
        b.emit(Opcode::Ret);
    });

    let e = b.ident("e");
    b.emit(Opcode::CallN { lhs: reg(0), func: e, argc: 0 });
    b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::Simple, src: 0 });
    b.emit(Opcode::EqualValueType { dst: reg(2), left: reg(0), right: reg(1) });
    exit_on(&mut b, reg(2));

    assert!(run(b.finish()));
}

#[test]
fn missing_arguments_read_undefined() {
    // function one(p) { return p; } exit(one() === undefined);
    let mut b = ProgramBuilder::new();
    prologue(&mut b);
    emit_func_decl(&mut b, "one", &["p"], |b| {
        b.emit(Opcode::RegVarDecl { min: MIN_REG, max: MIN_REG });
        let p = b.ident("p");
        b.emit(Opcode::Assignment { dst: reg(0), kind: ArgKind::Variable, src: p });
        b.emit(Opcode::RetVal { var: reg(0) });
    });

    let one = b.ident("one");
    b.emit(Opcode::CallN { lhs: reg(0), func: one, argc: 0 });
    b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::Simple, src: 0 });
    b.emit(Opcode::EqualValueType { dst: reg(2), left: reg(0), right: reg(1) });
    exit_on(&mut b, reg(2));

    assert!(run(b.finish()));
}

#[test]
fn anonymous_expression_called_through_register() {
    // var f = function () { return 42; }; exit(f() === 42);
    let mut b = ProgramBuilder::new();
    prologue(&mut b);
    emit_func_expr(&mut b, reg(0), None, &[], |b| {
        b.emit(Opcode::RegVarDecl { min: MIN_REG, max: MIN_REG });
        b.emit(Opcode::Assignment { dst: reg(0), kind: ArgKind::SmallInt, src: 42 });
        b.emit(Opcode::RetVal { var: reg(0) });
    });

    b.emit(Opcode::CallN { lhs: reg(1), func: reg(0), argc: 0 });
    b.emit(Opcode::Assignment { dst: reg(2), kind: ArgKind::SmallInt, src: 42 });
    b.emit(Opcode::EqualValueType { dst: reg(3), left: reg(1), right: reg(2) });
    exit_on(&mut b, reg(3));

    assert!(run(b.finish()));
}

#[test]
fn named_expression_recurses_through_its_own_binding() {
    // var fact = function fact(n) { if (n < 2) return 1; return n * fact(n - 1); };
    // exit(fact(5) === 120);
    let mut b = ProgramBuilder::new();
    prologue(&mut b);
    emit_func_expr(&mut b, reg(0), Some("fact"), &["n"], |b| {
        b.emit(Opcode::RegVarDecl { min: MIN_REG, max: reg(4) });
        let n = b.ident("n");
        b.emit(Opcode::Assignment { dst: reg(0), kind: ArgKind::Variable, src: n });
        b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::SmallInt, src: 2 });
        b.emit(Opcode::LessThan { dst: reg(2), left: reg(0), right: reg(1) });
        b.emit(Opcode::IsFalseJmpDown { cond: reg(2), d1: 0, d2: 3 });
        b.emit(Opcode::Assignment { dst: reg(3), kind: ArgKind::SmallInt, src: 1 });
        b.emit(Opcode::RetVal { var: reg(3) });
        // n * fact(n - 1)
        b.emit(Opcode::Assignment { dst: reg(3), kind: ArgKind::Variable, src: n });
        b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::SmallInt, src: 1 });
        b.emit(Opcode::Substraction { dst: reg(4), left: reg(3), right: reg(1) });
        let fact = b.ident("fact");
        b.emit(Opcode::CallN { lhs: reg(4), func: fact, argc: 1 });
        b.emit(Opcode::Meta { meta_type: MetaType::Varg, d1: reg(4), d2: 0 });
        b.emit(Opcode::Multiplication { dst: reg(3), left: reg(3), right: reg(4) });
        b.emit(Opcode::RetVal { var: reg(3) });
    });

    b.emit(Opcode::CallN { lhs: reg(1), func: reg(0), argc: 1 });
    b.emit(Opcode::Assignment { dst: reg(2), kind: ArgKind::SmallInt, src: 5 });
    b.emit(Opcode::Meta { meta_type: MetaType::Varg, d1: reg(2), d2: 0 });
    b.emit(Opcode::Assignment { dst: reg(3), kind: ArgKind::SmallInt, src: 120 });
    b.emit(Opcode::EqualValueType { dst: reg(4), left: reg(1), right: reg(3) });
    exit_on(&mut b, reg(4));

    assert!(run(b.finish()));
}

#[test]
fn method_call_binds_this() {
    // var o = {}; o.v = 7; o.m = function () { return this.v; };
    // exit(o.m() === 7);
    let mut b = ProgramBuilder::new();
    prologue(&mut b);
    b.emit(Opcode::ObjDecl { lhs: reg(0), propc: 0 });

    let v = b.ident("v");
    b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::StringLit, src: v });
    b.emit(Opcode::Assignment { dst: reg(2), kind: ArgKind::SmallInt, src: 7 });
    b.emit(Opcode::PropSetter { obj: reg(0), prop: reg(1), rhs: reg(2) });

    emit_func_expr(&mut b, reg(3), None, &[], |b| {
        b.emit(Opcode::RegVarDecl { min: MIN_REG, max: reg(2) });
        b.emit(Opcode::This { lhs: reg(0) });
        let v = b.ident("v");
        b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::StringLit, src: v });
        b.emit(Opcode::PropGetter { lhs: reg(2), obj: reg(0), prop: reg(1) });
        b.emit(Opcode::RetVal { var: reg(2) });
    });
    let m = b.ident("m");
    b.emit(Opcode::Assignment { dst: reg(4), kind: ArgKind::StringLit, src: m });
    b.emit(Opcode::PropSetter { obj: reg(0), prop: reg(4), rhs: reg(3) });

    // o.m() - callee read first, this delivered by the marker.
    b.emit(Opcode::PropGetter { lhs: reg(5), obj: reg(0), prop: reg(4) });
    b.emit(Opcode::CallN { lhs: reg(6), func: reg(5), argc: 1 });
    b.emit(Opcode::Meta { meta_type: MetaType::ThisArg, d1: reg(0), d2: 0 });

    b.emit(Opcode::Assignment { dst: reg(7), kind: ArgKind::SmallInt, src: 7 });
    b.emit(Opcode::EqualValueType { dst: reg(8), left: reg(6), right: reg(7) });
    exit_on(&mut b, reg(8));

    assert!(run(b.finish()));
}

#[test]
fn arguments_object_exposes_length_and_indices() {
    // function g() { return arguments.length + arguments[0]; } exit(g(5) === 6);
    let mut b = ProgramBuilder::new();
    prologue(&mut b);
    emit_func_decl(&mut b, "g", &[], |b| {
        b.emit(Opcode::RegVarDecl { min: MIN_REG, max: reg(4) });
        let arguments = b.ident("arguments");
        b.emit(Opcode::Assignment { dst: reg(0), kind: ArgKind::Variable, src: arguments });
        let length = b.ident("length");
        b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::StringLit, src: length });
        b.emit(Opcode::PropGetter { lhs: reg(2), obj: reg(0), prop: reg(1) });
        let zero = b.ident("0");
        b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::StringLit, src: zero });
        b.emit(Opcode::PropGetter { lhs: reg(3), obj: reg(0), prop: reg(1) });
        b.emit(Opcode::Addition { dst: reg(4), left: reg(2), right: reg(3) });
        b.emit(Opcode::RetVal { var: reg(4) });
    });

    let g = b.ident("g");
    b.emit(Opcode::CallN { lhs: reg(0), func: g, argc: 1 });
    b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::SmallInt, src: 5 });
    b.emit(Opcode::Meta { meta_type: MetaType::Varg, d1: reg(1), d2: 0 });

    b.emit(Opcode::Assignment { dst: reg(2), kind: ArgKind::SmallInt, src: 6 });
    b.emit(Opcode::EqualValueType { dst: reg(3), left: reg(0), right: reg(2) });
    exit_on(&mut b, reg(3));

    assert!(run(b.finish()));
}

#[test]
fn construction_initializes_the_instance() {
    // function C() { this.x = 1; } var o = new C(); exit(o.x === 1);
    let mut b = ProgramBuilder::new();
    prologue(&mut b);
    emit_func_decl(&mut b, "C", &[], |b| {
        b.emit(Opcode::RegVarDecl { min: MIN_REG, max: reg(2) });
        b.emit(Opcode::This { lhs: reg(0) });
        let x = b.ident("x");
        b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::StringLit, src: x });
        b.emit(Opcode::Assignment { dst: reg(2), kind: ArgKind::SmallInt, src: 1 });
        b.emit(Opcode::PropSetter { obj: reg(0), prop: reg(1), rhs: reg(2) });
        b.emit(Opcode::Ret);
    });

    let c = b.ident("C");
    b.emit(Opcode::ConstructN { lhs: reg(0), func: c, argc: 0 });
    let x = b.ident("x");
    b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::StringLit, src: x });
    b.emit(Opcode::PropGetter { lhs: reg(2), obj: reg(0), prop: reg(1) });
    b.emit(Opcode::Assignment { dst: reg(3), kind: ArgKind::SmallInt, src: 1 });
    b.emit(Opcode::EqualValueType { dst: reg(4), left: reg(2), right: reg(3) });
    exit_on(&mut b, reg(4));

    assert!(run(b.finish()));
}

#[test]
fn instance_of_its_constructor() {
    // function C() {} exit(new C() instanceof C);
    let mut b = ProgramBuilder::new();
    prologue(&mut b);
    emit_func_decl(&mut b, "C", &[], |b| {
        b.emit(Opcode::RegVarDecl { min: MIN_REG, max: MIN_REG });
        b.emit(Opcode::Ret);
    });

    let c = b.ident("C");
    b.emit(Opcode::ConstructN { lhs: reg(0), func: c, argc: 0 });
    b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::Variable, src: c });
    b.emit(Opcode::Instanceof { dst: reg(2), left: reg(0), right: reg(1) });
    exit_on(&mut b, reg(2));

    assert!(run(b.finish()));
}

#[test]
fn unbounded_recursion_throws_range_error() {
    // function r() { return r(); } r();
    let mut b = ProgramBuilder::new();
    prologue(&mut b);
    emit_func_decl(&mut b, "r", &[], |b| {
        b.emit(Opcode::RegVarDecl { min: MIN_REG, max: MIN_REG });
        let r = b.ident("r");
        b.emit(Opcode::CallN { lhs: reg(0), func: r, argc: 0 });
        b.emit(Opcode::RetVal { var: reg(0) });
    });

    let r = b.ident("r");
    b.emit(Opcode::CallN { lhs: reg(0), func: r, argc: 0 });
    b.emit(Opcode::Exitval { status: 0 });

    match run_err(b.finish()) {
        EngineError::UnhandledException(message) => {
            assert!(message.contains("RangeError"), "message was {:?}", message)
        }
        other => panic!("expected an unhandled exception, got {:?}", other),
    }
}

#[test]
fn calling_a_non_function_throws_type_error() {
    // var x = 1; x();
    let mut b = ProgramBuilder::new();
    prologue(&mut b);
    b.emit(Opcode::Assignment { dst: reg(0), kind: ArgKind::SmallInt, src: 1 });
    b.emit(Opcode::CallN { lhs: reg(1), func: reg(0), argc: 0 });
    b.emit(Opcode::Exitval { status: 0 });

    match run_err(b.finish()) {
        EngineError::UnhandledException(message) => {
            assert!(message.contains("TypeError"), "message was {:?}", message)
        }
        other => panic!("expected an unhandled exception, got {:?}", other),
    }
}
