//! Strict-mode behavior: the leading strict marker, this-binding, frozen
//! property assignment, setter-less accessors and the compiler contract on
//! identifier deletes.

use es5run::vm::builder::{reg, ProgramBuilder, MIN_REG};
use es5run::vm::opcode::INVALID_IDX;
use es5run::vm::{ArgKind, MetaType, Opcode};
use es5run::EngineError;

use super::{emit_data_prop, exit_on, run, run_err};

fn strict_prologue(b: &mut ProgramBuilder) {
    b.emit(Opcode::Meta { meta_type: MetaType::StrictCode, d1: 0, d2: 0 });
    b.emit(Opcode::RegVarDecl { min: MIN_REG, max: reg(15) });
}

/// try { <body> ; exit(false) } catch (e) { exit(e instanceof TypeError) }
fn expect_type_error(b: &mut ProgramBuilder, body: impl FnOnce(&mut ProgramBuilder)) {
    let try_at = b.emit(Opcode::TryBlock { d1: 0, d2: 0 });
    body(b);
    b.emit(Opcode::Exitval { status: 1 });
    let (d1, d2) = ProgramBuilder::delta(try_at, b.here());
    b.patch(try_at, Opcode::TryBlock { d1, d2 });

    let catch_at = b.emit(Opcode::Meta { meta_type: MetaType::Catch, d1: 0, d2: 0 });
    let e = b.ident("e");
    b.emit(Opcode::Meta { meta_type: MetaType::CatchExceptionIdentifier, d1: e, d2: 0 });
    b.emit(Opcode::Assignment { dst: reg(10), kind: ArgKind::Variable, src: e });
    let type_error = b.ident("TypeError");
    b.emit(Opcode::Assignment { dst: reg(11), kind: ArgKind::Variable, src: type_error });
    b.emit(Opcode::Instanceof { dst: reg(12), left: reg(10), right: reg(11) });
    exit_on(b, reg(12));
    let (d1, d2) = ProgramBuilder::delta(catch_at, b.here());
    b.patch(catch_at, Opcode::Meta { meta_type: MetaType::Catch, d1, d2 });
    b.emit(Opcode::Meta { meta_type: MetaType::EndTryCatchFinally, d1: 0, d2: 0 });
    b.emit(Opcode::Exitval { status: 1 });
}

#[test]
fn frozen_property_assignment_throws() {
    // var o = {}; Object.defineProperty(o, "k",
    //   {value: 1, writable: false, configurable: false});
    // try { "use strict"; o.k = 2; exit(false); } catch (e) { exit(true); }
    let mut b = ProgramBuilder::new();
    strict_prologue(&mut b);

    b.emit(Opcode::ObjDecl { lhs: reg(0), propc: 0 });
    b.emit(Opcode::ObjDecl { lhs: reg(1), propc: 3 });
    emit_data_prop(&mut b, "value", |b, dst| {
        b.emit(Opcode::Assignment { dst, kind: ArgKind::SmallInt, src: 1 });
    });
    emit_data_prop(&mut b, "writable", |b, dst| {
        b.emit(Opcode::Assignment { dst, kind: ArgKind::Simple, src: 2 });
    });
    emit_data_prop(&mut b, "configurable", |b, dst| {
        b.emit(Opcode::Assignment { dst, kind: ArgKind::Simple, src: 2 });
    });

    let object_name = b.ident("Object");
    b.emit(Opcode::Assignment { dst: reg(2), kind: ArgKind::Variable, src: object_name });
    let dp = b.ident("defineProperty");
    b.emit(Opcode::Assignment { dst: reg(3), kind: ArgKind::StringLit, src: dp });
    b.emit(Opcode::PropGetter { lhs: reg(4), obj: reg(2), prop: reg(3) });
    let k = b.ident("k");
    b.emit(Opcode::CallN { lhs: reg(5), func: reg(4), argc: 4 });
    b.emit(Opcode::Meta { meta_type: MetaType::ThisArg, d1: reg(2), d2: 0 });
    b.emit(Opcode::Meta { meta_type: MetaType::Varg, d1: reg(0), d2: 0 });
    b.emit(Opcode::Assignment { dst: reg(6), kind: ArgKind::StringLit, src: k });
    b.emit(Opcode::Meta { meta_type: MetaType::Varg, d1: reg(6), d2: 0 });
    b.emit(Opcode::Meta { meta_type: MetaType::Varg, d1: reg(1), d2: 0 });

    expect_type_error(&mut b, |b| {
        let k = b.ident("k");
        b.emit(Opcode::Assignment { dst: reg(7), kind: ArgKind::StringLit, src: k });
        b.emit(Opcode::Assignment { dst: reg(8), kind: ArgKind::SmallInt, src: 2 });
        b.emit(Opcode::PropSetter { obj: reg(0), prop: reg(7), rhs: reg(8) });
    });

    assert!(run(b.finish()));
}

#[test]
fn setterless_accessor_assignment_throws() {
    // var o = { get g() { return 5; } };
    // try { o.g = 1; exit(false); } catch (e) { exit(e instanceof TypeError); }
    let mut b = ProgramBuilder::new();
    strict_prologue(&mut b);

    b.emit(Opcode::ObjDecl { lhs: reg(0), propc: 1 });
    b.emit(Opcode::FuncExprN { lhs: reg(15), name: INVALID_IDX, argc: 0 });
    let end_meta = b.emit(Opcode::Meta { meta_type: MetaType::FunctionEnd, d1: 0, d2: 0 });
    b.begin_scope();
    b.emit(Opcode::RegVarDecl { min: MIN_REG, max: MIN_REG });
    b.emit(Opcode::Assignment { dst: reg(0), kind: ArgKind::SmallInt, src: 5 });
    b.emit(Opcode::RetVal { var: reg(0) });
    b.end_scope();
    let (d1, d2) = ProgramBuilder::delta(end_meta, b.here());
    b.patch(end_meta, Opcode::Meta { meta_type: MetaType::FunctionEnd, d1, d2 });
    let g = b.ident("g");
    b.emit(Opcode::Assignment { dst: reg(14), kind: ArgKind::StringLit, src: g });
    b.emit(Opcode::Meta { meta_type: MetaType::VargPropGetter, d1: reg(14), d2: reg(15) });

    expect_type_error(&mut b, |b| {
        let g = b.ident("g");
        b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::StringLit, src: g });
        b.emit(Opcode::Assignment { dst: reg(2), kind: ArgKind::SmallInt, src: 1 });
        b.emit(Opcode::PropSetter { obj: reg(0), prop: reg(1), rhs: reg(2) });
    });

    assert!(run(b.finish()));
}

#[test]
fn strict_function_keeps_this_undefined() {
    // function f() { "use strict"; return this === undefined; } exit(f());
    let mut b = ProgramBuilder::new();
    b.emit(Opcode::RegVarDecl { min: MIN_REG, max: reg(15) });

    let f = b.ident("f");
    b.emit(Opcode::FuncDeclN { name: f, argc: 0 });
    let end_meta = b.emit(Opcode::Meta { meta_type: MetaType::FunctionEnd, d1: 0, d2: 0 });
    // Function-level strict marker sits between the end marker and the body.
    b.emit(Opcode::Meta { meta_type: MetaType::StrictCode, d1: 0, d2: 0 });
    b.begin_scope();
    b.emit(Opcode::RegVarDecl { min: MIN_REG, max: reg(2) });
    b.emit(Opcode::This { lhs: reg(0) });
    b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::Simple, src: 0 });
    b.emit(Opcode::EqualValueType { dst: reg(2), left: reg(0), right: reg(1) });
    b.emit(Opcode::RetVal { var: reg(2) });
    b.end_scope();
    let (d1, d2) = ProgramBuilder::delta(end_meta, b.here());
    b.patch(end_meta, Opcode::Meta { meta_type: MetaType::FunctionEnd, d1, d2 });

    b.emit(Opcode::CallN { lhs: reg(0), func: f, argc: 0 });
    exit_on(&mut b, reg(0));

    assert!(run(b.finish()));
}

#[test]
fn non_strict_this_coerces_to_the_global_object() {
    // function f() { return typeof this; } exit(f() === "object");
    let mut b = ProgramBuilder::new();
    b.emit(Opcode::RegVarDecl { min: MIN_REG, max: reg(15) });

    let f = b.ident("f");
    b.emit(Opcode::FuncDeclN { name: f, argc: 0 });
    let end_meta = b.emit(Opcode::Meta { meta_type: MetaType::FunctionEnd, d1: 0, d2: 0 });
    b.begin_scope();
    b.emit(Opcode::RegVarDecl { min: MIN_REG, max: reg(1) });
    b.emit(Opcode::This { lhs: reg(0) });
    b.emit(Opcode::Typeof { lhs: reg(1), var: reg(0) });
    b.emit(Opcode::RetVal { var: reg(1) });
    b.end_scope();
    let (d1, d2) = ProgramBuilder::delta(end_meta, b.here());
    b.patch(end_meta, Opcode::Meta { meta_type: MetaType::FunctionEnd, d1, d2 });

    b.emit(Opcode::CallN { lhs: reg(0), func: f, argc: 0 });
    let object_text = b.ident("object");
    b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::StringLit, src: object_text });
    b.emit(Opcode::EqualValueType { dst: reg(2), left: reg(0), right: reg(1) });
    exit_on(&mut b, reg(2));

    assert!(run(b.finish()));
}

#[test]
fn strict_identifier_delete_violates_the_image_contract() {
    // A compiler honoring the early-error rules never emits delete_var in
    // strict code; the runtime rejects such an image instead of asserting.
    let mut b = ProgramBuilder::new();
    strict_prologue(&mut b);
    let x = b.ident("x");
    b.emit(Opcode::DeleteVar { lhs: reg(0), name: x });
    b.emit(Opcode::Exitval { status: 0 });

    match run_err(b.finish()) {
        EngineError::InvalidImage(message) => {
            assert!(message.contains("delete"), "message was {:?}", message)
        }
        other => panic!("expected an invalid-image fault, got {:?}", other),
    }
}

#[test]
fn non_strict_identifier_delete_reports_success() {
    // Non-strict: delete of an unresolvable identifier is true, delete of a
    // non-configurable global var is false.
    let mut b = ProgramBuilder::new();
    b.emit(Opcode::RegVarDecl { min: MIN_REG, max: reg(15) });
    let ghost = b.ident("ghost");
    b.emit(Opcode::DeleteVar { lhs: reg(0), name: ghost });
    b.emit(Opcode::IsFalseJmpDown { cond: reg(0), d1: 0, d2: 7 });

    let v = b.ident("v");
    b.emit(Opcode::VarDecl { name: v });
    b.emit(Opcode::DeleteVar { lhs: reg(1), name: v });
    b.emit(Opcode::LogicalNot { dst: reg(2), var: reg(1) });
    exit_on(&mut b, reg(2));
    b.emit(Opcode::Exitval { status: 1 });

    assert!(run(b.finish()));
}
