//! Object and array initializers, property access, delete, accessors, the
//! `in` operator and the Object.defineProperty dispatch contract.

use es5run::vm::builder::{reg, ProgramBuilder, MIN_REG};
use es5run::vm::opcode::INVALID_IDX;
use es5run::vm::{ArgKind, MetaType, Opcode};

use super::{emit_data_prop, exit_on, run};

fn prologue(b: &mut ProgramBuilder) {
    b.emit(Opcode::RegVarDecl { min: MIN_REG, max: reg(15) });
}

fn check_eq_or_fail(b: &mut ProgramBuilder, left: u8, right: u8) {
    b.emit(Opcode::EqualValueType { dst: reg(13), left, right });
    b.emit(Opcode::IsTrueJmpDown { cond: reg(13), d1: 0, d2: 2 });
    b.emit(Opcode::Exitval { status: 1 });
}

#[test]
fn object_literal_roundtrip() {
    // var o = {a: 1}; exit(o.a === 1 && o.missing === undefined);
    let mut b = ProgramBuilder::new();
    prologue(&mut b);
    b.emit(Opcode::ObjDecl { lhs: reg(0), propc: 1 });
    emit_data_prop(&mut b, "a", |b, dst| {
        b.emit(Opcode::Assignment { dst, kind: ArgKind::SmallInt, src: 1 });
    });

    let a = b.ident("a");
    b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::StringLit, src: a });
    b.emit(Opcode::PropGetter { lhs: reg(2), obj: reg(0), prop: reg(1) });
    b.emit(Opcode::Assignment { dst: reg(3), kind: ArgKind::SmallInt, src: 1 });
    check_eq_or_fail(&mut b, reg(2), reg(3));

    let missing = b.ident("missing");
    b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::StringLit, src: missing });
    b.emit(Opcode::PropGetter { lhs: reg(2), obj: reg(0), prop: reg(1) });
    b.emit(Opcode::Assignment { dst: reg(3), kind: ArgKind::Simple, src: 0 });
    b.emit(Opcode::EqualValueType { dst: reg(4), left: reg(2), right: reg(3) });
    exit_on(&mut b, reg(4));

    assert!(run(b.finish()));
}

#[test]
fn property_write_and_shadowing() {
    // var o = {}; o.k = 1; o.k = 2; exit(o.k === 2);
    let mut b = ProgramBuilder::new();
    prologue(&mut b);
    b.emit(Opcode::ObjDecl { lhs: reg(0), propc: 0 });
    let k = b.ident("k");
    b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::StringLit, src: k });
    b.emit(Opcode::Assignment { dst: reg(2), kind: ArgKind::SmallInt, src: 1 });
    b.emit(Opcode::PropSetter { obj: reg(0), prop: reg(1), rhs: reg(2) });
    b.emit(Opcode::Assignment { dst: reg(2), kind: ArgKind::SmallInt, src: 2 });
    b.emit(Opcode::PropSetter { obj: reg(0), prop: reg(1), rhs: reg(2) });

    b.emit(Opcode::PropGetter { lhs: reg(3), obj: reg(0), prop: reg(1) });
    b.emit(Opcode::Assignment { dst: reg(4), kind: ArgKind::SmallInt, src: 2 });
    b.emit(Opcode::EqualValueType { dst: reg(5), left: reg(3), right: reg(4) });
    exit_on(&mut b, reg(5));

    assert!(run(b.finish()));
}

#[test]
fn delete_returns_true_for_missing_and_existing() {
    // var o = {a: 1};
    // exit(delete o.b && delete o.a && o.a === undefined);
    let mut b = ProgramBuilder::new();
    prologue(&mut b);
    b.emit(Opcode::ObjDecl { lhs: reg(0), propc: 1 });
    emit_data_prop(&mut b, "a", |b, dst| {
        b.emit(Opcode::Assignment { dst, kind: ArgKind::SmallInt, src: 1 });
    });

    let bb = b.ident("b");
    b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::StringLit, src: bb });
    b.emit(Opcode::DeleteProp { lhs: reg(2), base: reg(0), name: reg(1) });
    b.emit(Opcode::IsFalseJmpDown { cond: reg(2), d1: 0, d2: 10 });

    let a = b.ident("a");
    b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::StringLit, src: a });
    b.emit(Opcode::DeleteProp { lhs: reg(2), base: reg(0), name: reg(1) });
    b.emit(Opcode::IsFalseJmpDown { cond: reg(2), d1: 0, d2: 7 });

    b.emit(Opcode::PropGetter { lhs: reg(3), obj: reg(0), prop: reg(1) });
    b.emit(Opcode::Assignment { dst: reg(4), kind: ArgKind::Simple, src: 0 });
    b.emit(Opcode::EqualValueType { dst: reg(5), left: reg(3), right: reg(4) });
    exit_on(&mut b, reg(5));
    b.emit(Opcode::Exitval { status: 1 });

    assert!(run(b.finish()));
}

#[test]
fn array_literal_length_and_elements() {
    // var a = [1, 2, 3]; a[1] = 9;
    // exit(a.length === 3 && a[1] === 9 && a[2] === 3);
    let mut b = ProgramBuilder::new();
    prologue(&mut b);
    b.emit(Opcode::ArrayDecl { lhs: reg(0), argc: 3 });
    for n in 1..=3u8 {
        b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::SmallInt, src: n });
        b.emit(Opcode::Meta { meta_type: MetaType::Varg, d1: reg(1), d2: 0 });
    }

    let length = b.ident("length");
    b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::StringLit, src: length });
    b.emit(Opcode::PropGetter { lhs: reg(2), obj: reg(0), prop: reg(1) });
    b.emit(Opcode::Assignment { dst: reg(3), kind: ArgKind::SmallInt, src: 3 });
    check_eq_or_fail(&mut b, reg(2), reg(3));

    let one = b.ident("1");
    b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::StringLit, src: one });
    b.emit(Opcode::Assignment { dst: reg(2), kind: ArgKind::SmallInt, src: 9 });
    b.emit(Opcode::PropSetter { obj: reg(0), prop: reg(1), rhs: reg(2) });
    b.emit(Opcode::PropGetter { lhs: reg(3), obj: reg(0), prop: reg(1) });
    check_eq_or_fail(&mut b, reg(3), reg(2));

    let two = b.ident("2");
    b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::StringLit, src: two });
    b.emit(Opcode::PropGetter { lhs: reg(3), obj: reg(0), prop: reg(1) });
    b.emit(Opcode::Assignment { dst: reg(4), kind: ArgKind::SmallInt, src: 3 });
    b.emit(Opcode::EqualValueType { dst: reg(5), left: reg(3), right: reg(4) });
    exit_on(&mut b, reg(5));

    assert!(run(b.finish()));
}

#[test]
fn growing_an_array_updates_length() {
    // var a = []; a[4] = 1; exit(a.length === 5);
    let mut b = ProgramBuilder::new();
    prologue(&mut b);
    b.emit(Opcode::ArrayDecl { lhs: reg(0), argc: 0 });
    let four = b.ident("4");
    b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::StringLit, src: four });
    b.emit(Opcode::Assignment { dst: reg(2), kind: ArgKind::SmallInt, src: 1 });
    b.emit(Opcode::PropSetter { obj: reg(0), prop: reg(1), rhs: reg(2) });

    let length = b.ident("length");
    b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::StringLit, src: length });
    b.emit(Opcode::PropGetter { lhs: reg(3), obj: reg(0), prop: reg(1) });
    b.emit(Opcode::Assignment { dst: reg(4), kind: ArgKind::SmallInt, src: 5 });
    b.emit(Opcode::EqualValueType { dst: reg(5), left: reg(3), right: reg(4) });
    exit_on(&mut b, reg(5));

    assert!(run(b.finish()));
}

#[test]
fn in_operator_checks_own_and_inherited() {
    // var o = {a: 1}; exit("a" in o && !("b" in o) && "constructor" in o);
    let mut b = ProgramBuilder::new();
    prologue(&mut b);
    b.emit(Opcode::ObjDecl { lhs: reg(0), propc: 1 });
    emit_data_prop(&mut b, "a", |b, dst| {
        b.emit(Opcode::Assignment { dst, kind: ArgKind::SmallInt, src: 1 });
    });

    let a = b.ident("a");
    b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::StringLit, src: a });
    b.emit(Opcode::In { dst: reg(2), left: reg(1), right: reg(0) });
    b.emit(Opcode::IsFalseJmpDown { cond: reg(2), d1: 0, d2: 9 });

    let bb = b.ident("b");
    b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::StringLit, src: bb });
    b.emit(Opcode::In { dst: reg(2), left: reg(1), right: reg(0) });
    b.emit(Opcode::IsTrueJmpDown { cond: reg(2), d1: 0, d2: 6 });

    // Inherited through Object.prototype.
    let ctor = b.ident("constructor");
    b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::StringLit, src: ctor });
    b.emit(Opcode::In { dst: reg(2), left: reg(1), right: reg(0) });
    exit_on(&mut b, reg(2));
    b.emit(Opcode::Exitval { status: 1 });

    assert!(run(b.finish()));
}

#[test]
fn literal_getter_runs_on_read() {
    // var o = { get g() { return 5; } }; exit(o.g === 5);
    let mut b = ProgramBuilder::new();
    prologue(&mut b);
    b.emit(Opcode::ObjDecl { lhs: reg(0), propc: 1 });
    // The getter function and the name evaluate inside the initializer
    // protocol, then the marker delivers both.
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

    b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::StringLit, src: g });
    b.emit(Opcode::PropGetter { lhs: reg(2), obj: reg(0), prop: reg(1) });
    b.emit(Opcode::Assignment { dst: reg(3), kind: ArgKind::SmallInt, src: 5 });
    b.emit(Opcode::EqualValueType { dst: reg(4), left: reg(2), right: reg(3) });
    exit_on(&mut b, reg(4));

    assert!(run(b.finish()));
}

#[test]
fn define_property_through_the_builtin_surface() {
    // var o = {};
    // Object.defineProperty(o, "k", {value: 1, writable: false, configurable: false});
    // exit(o.k === 1);
    let mut b = ProgramBuilder::new();
    prologue(&mut b);
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

    b.emit(Opcode::Assignment { dst: reg(7), kind: ArgKind::StringLit, src: k });
    b.emit(Opcode::PropGetter { lhs: reg(8), obj: reg(0), prop: reg(7) });
    b.emit(Opcode::Assignment { dst: reg(9), kind: ArgKind::SmallInt, src: 1 });
    b.emit(Opcode::EqualValueType { dst: reg(10), left: reg(8), right: reg(9) });
    exit_on(&mut b, reg(10));

    assert!(run(b.finish()));
}
