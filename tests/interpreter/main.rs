//! Integration tests for the execution core, organized by feature.
//!
//! Programs are assembled with `ProgramBuilder` (the compiler is an external
//! collaborator) and run through the public `Engine` API. Most scripts
//! follow the exit-code convention: compute a condition into a register,
//! then exit with success iff it held.

mod function;
mod object;
mod strict;

use es5run::vm::builder::{reg, ProgramBuilder};
use es5run::vm::Opcode;
use es5run::{Engine, EngineConfig, EngineError, Program};

/// Run to completion; panics on engine faults and uncaught exceptions.
pub fn run(program: Program) -> bool {
    Engine::new(program, EngineConfig::default())
        .expect("engine construction")
        .run()
        .expect("run completes")
}

/// Run a program expected to fail with an engine error.
pub fn run_err(program: Program) -> EngineError {
    Engine::new(program, EngineConfig::default())
        .expect("engine construction")
        .run()
        .expect_err("run faults")
}

/// Emit `exit(condition)`: success iff the register holds a truthy value.
pub fn exit_on(b: &mut ProgramBuilder, cond: u8) {
    b.emit(Opcode::IsFalseJmpDown { cond, d1: 0, d2: 2 });
    b.emit(Opcode::Exitval { status: 0 });
    b.emit(Opcode::Exitval { status: 1 });
}

/// Emit an object-initializer data property: name and value code first,
/// then the marker that delivers them.
pub fn emit_data_prop(b: &mut ProgramBuilder, name: &str, emit_value: impl FnOnce(&mut ProgramBuilder, u8)) {
    use es5run::vm::{ArgKind, MetaType};
    let name_uid = b.ident(name);
    b.emit(Opcode::Assignment { dst: reg(14), kind: ArgKind::StringLit, src: name_uid });
    emit_value(b, reg(15));
    b.emit(Opcode::Meta { meta_type: MetaType::VargPropData, d1: reg(14), d2: reg(15) });
}
