//! The dispatch loop and the opcode handlers.
//!
//! Every handler receives the decoded opcode and the current frame and
//! returns a completion value. The loop keeps running while completions are
//! normal-empty, translates meta completions into empty (leaving the counter
//! on the marker for the enclosing construct to consume), and returns
//! anything else to the caller.
//!
//! Exception handling inside handlers is the early-return discipline:
//! every fallible ECMA operation is an `OpResult` and `?` aborts the handler
//! with the abrupt completion, after the handler has released the values it
//! owns.

use rustc_hash::FxHashSet;

use crate::context::{Context, ErrorKind};
use crate::conversion::PreferredType;
use crate::error::EngineError;
use crate::mem::MemStats;
use crate::object::{InternalSlot, ObjectId, PropertyDescriptor};
use crate::strings::{MagicStringId, StringId};
use crate::value::{
    Abrupt, Completion, FatalKind, OpResult, Reference, ReferenceBase, SimpleValue, Value,
};
use crate::vm::frame::Frame;
use crate::vm::opcode::{
    counter_from_idx_idx, ArgKind, MetaType, Opcode, OpcodeCounter,
};

fn abrupt_of(completion: Completion) -> Abrupt {
    match completion {
        Completion::Throw(v) => Abrupt::Throw(v),
        Completion::Exit(ok) => Abrupt::Exit(ok),
        Completion::Fatal(kind) => Abrupt::Fatal(kind),
        Completion::Empty | Completion::Meta | Completion::Return(_) => {
            Abrupt::Fatal(FatalKind::InvalidImage("unexpected completion kind"))
        }
    }
}

impl Context {
    // ========================================================================
    // Entry points
    // ========================================================================

    /// Execute the whole program: detect the leading strict marker, enter at
    /// the global frame, and map the final completion to the public result.
    pub fn run_program(&mut self) -> Result<bool, EngineError> {
        let mut start: OpcodeCounter = 0;
        let mut is_strict = false;
        if let Some(Opcode::Meta { meta_type: MetaType::StrictCode, .. }) = self.program.opcode(0)
        {
            is_strict = true;
            start = 1;
        }

        let global_obj = self.globals.global_obj;
        let global_env = self.globals.global_env;
        self.objects.inc_rc(global_obj);
        self.objects.inc_rc(global_env);

        let completion = self.run_from_pos(
            start,
            Value::Object(global_obj),
            global_env,
            is_strict,
            false,
        );

        self.objects.dec_rc(global_env);
        self.objects.dec_rc(global_obj);

        match completion {
            Completion::Exit(ok) => Ok(ok),
            Completion::Throw(value) => {
                let message = self.describe_thrown(value);
                self.free_value(value);
                Err(EngineError::UnhandledException(message))
            }
            Completion::Fatal(kind) => Err(kind.into_engine_error()),
            Completion::Empty | Completion::Return(_) | Completion::Meta => Err(
                EngineError::invalid_image("program ended without an exit completion"),
            ),
        }
    }

    /// Human-readable one-liner for an uncaught exception. Reads the class
    /// slot and the message property directly; no user code runs during
    /// unwinding.
    fn describe_thrown(&mut self, value: Value) -> String {
        match value {
            Value::Object(obj) => {
                let class = self
                    .internal_slot(obj, InternalSlot::Class)
                    .and_then(|raw| MagicStringId::from_index(raw as u16))
                    .map(|magic| magic.text().to_owned())
                    .unwrap_or_else(|| "Object".to_owned());
                let message_name = self.strings.magic(MagicStringId::Message);
                let message = self
                    .find_named_property(obj, message_name)
                    .map(|pid| self.named_data_value(pid))
                    .and_then(|v| v.as_string())
                    .map(|id| self.strings.text(id).to_owned())
                    .unwrap_or_default();
                if message.is_empty() {
                    class
                } else {
                    format!("{}: {}", class, message)
                }
            }
            Value::Str(id) => self.strings.text(id).to_owned(),
            Value::Number(n) => format!("{}", n),
            Value::Bool(b) => format!("{}", b),
            Value::Null => "null".to_owned(),
            Value::Undefined | Value::Empty => "undefined".to_owned(),
        }
    }

    /// Recursive interpreter entry (program, calls, eval): reads the
    /// register-window prologue, runs the loop and tears the frame down.
    pub(crate) fn run_from_pos(
        &mut self,
        start: OpcodeCounter,
        this_binding: Value,
        lex_env: ObjectId,
        is_strict: bool,
        is_eval_code: bool,
    ) -> Completion {
        let Some(Opcode::RegVarDecl { min, max }) = self.program.opcode(start) else {
            return Completion::Fatal(FatalKind::InvalidImage(
                "block does not begin with reg_var_decl",
            ));
        };
        if max < min {
            return Completion::Fatal(FatalKind::InvalidImage("inverted register window"));
        }

        let mut frame = Frame::new(
            start + 1,
            this_binding,
            lex_env,
            is_strict,
            is_eval_code,
            min,
            max,
        );

        self.trace_block_enter(start);
        let completion = self.run_loop(&mut frame);

        for value in frame.take_regs() {
            self.free_value(value);
        }
        self.trace_block_exit(start);
        completion
    }

    /// The dispatch loop. Stops at the first non-normal completion,
    /// converting a meta completion to empty (the counter stays on the
    /// marker).
    pub(crate) fn run_loop(&mut self, frame: &mut Frame) -> Completion {
        loop {
            let Some(op) = self.program.opcode(frame.pos) else {
                // Running off the end of the program is a successful exit.
                return Completion::Exit(true);
            };

            let before = self.trace_opcode_enter(op, frame.pos);
            let completion = self.dispatch(op, frame);
            self.trace_opcode_exit(op, before);

            match completion {
                Completion::Empty => continue,
                Completion::Meta => return Completion::Empty,
                other => return other,
            }
        }
    }

    // ========================================================================
    // Memory statistics tracing
    // ========================================================================

    fn trace_block_enter(&mut self, pos: OpcodeCounter) {
        if !self.dump_mem_stats {
            return;
        }
        let stats = self.mem_stats();
        eprintln!(
            "{:indent$}--- block @{} enter: heap {} bytes, {} chunks ---",
            "",
            pos,
            stats.heap.allocated_bytes,
            stats.pools.allocated_chunks,
            indent = self.mem_trace_indent as usize,
        );
        self.mem_trace_indent += 2;
    }

    fn trace_block_exit(&mut self, pos: OpcodeCounter) {
        if !self.dump_mem_stats {
            return;
        }
        self.mem_trace_indent = self.mem_trace_indent.saturating_sub(2);
        let stats = self.mem_stats();
        eprintln!(
            "{:indent$}--- block @{} exit: heap {} bytes (peak {}), {} chunks (peak {}) ---",
            "",
            pos,
            stats.heap.allocated_bytes,
            stats.heap.global_peak_allocated_bytes,
            stats.pools.allocated_chunks,
            stats.pools.global_peak_allocated_chunks,
            indent = self.mem_trace_indent as usize,
        );
    }

    fn trace_opcode_enter(&mut self, op: Opcode, pos: OpcodeCounter) -> Option<MemStats> {
        if !self.dump_mem_stats {
            return None;
        }
        self.reset_stat_peaks();
        let stats = self.mem_stats();
        eprintln!(
            "{:indent$}-- {} @{} --",
            "",
            op.name(),
            pos,
            indent = self.mem_trace_indent as usize,
        );
        Some(stats)
    }

    fn trace_opcode_exit(&mut self, op: Opcode, before: Option<MemStats>) {
        let Some(before) = before else { return };
        let after = self.mem_stats();
        if before.heap.allocated_bytes != after.heap.allocated_bytes
            || before.pools.allocated_chunks != after.pools.allocated_chunks
        {
            eprintln!(
                "{:indent$}   {}: heap {} -> {} bytes, chunks {} -> {}",
                "",
                op.name(),
                before.heap.allocated_bytes,
                after.heap.allocated_bytes,
                before.pools.allocated_chunks,
                after.pools.allocated_chunks,
                indent = self.mem_trace_indent as usize,
            );
        }
    }

    // ========================================================================
    // Operand access
    // ========================================================================

    /// Read an operand: a register copy, or an identifier resolved through
    /// the environment chain. Returns an owned value.
    fn get_variable_value(&mut self, frame: &Frame, idx: u8) -> OpResult<Value> {
        if frame.is_reg(idx) {
            let value = frame.reg(idx);
            self.ref_value(value);
            return Ok(value);
        }

        let lit = self.lit_id_for_uid(idx, frame.pos)?;
        let name = self.string_from_lit(lit)?;
        let result = match self.resolve_reference_base(frame.lex_env, name) {
            Ok(Some(env)) => self.op_get_binding_value(env, name, frame.is_strict),
            Ok(None) => Err(self.throw_error(ErrorKind::Reference)),
            Err(abrupt) => Err(abrupt),
        };
        self.strings.deref_string(name);
        result
    }

    /// Write an operand: a register store, or PutValue on an identifier
    /// reference. `lit_pos` names the opcode whose scope maps the uid.
    fn set_variable_value(
        &mut self,
        frame: &mut Frame,
        lit_pos: OpcodeCounter,
        idx: u8,
        value: Value,
    ) -> OpResult<()> {
        if frame.is_reg(idx) {
            self.ref_value(value);
            let old = frame.reg(idx);
            frame.set_reg(idx, value);
            self.free_value(old);
            return Ok(());
        }

        let lit = self.lit_id_for_uid(idx, lit_pos)?;
        let name = self.string_from_lit(lit)?;
        let result = match self.resolve_reference_base(frame.lex_env, name) {
            Ok(Some(env)) => self.op_set_mutable_binding(env, name, value, frame.is_strict),
            Ok(None) => {
                if frame.is_strict {
                    Err(self.throw_error(ErrorKind::Reference))
                } else {
                    let global = self.globals.global_obj;
                    self.op_object_put(global, name, value, false).map(|_| ())
                }
            }
            Err(abrupt) => Err(abrupt),
        };
        self.strings.deref_string(name);
        result
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    fn dispatch(&mut self, op: Opcode, frame: &mut Frame) -> Completion {
        match op {
            Opcode::Nop => {
                frame.pos += 1;
                Completion::Empty
            }
            Opcode::RegVarDecl { .. } => Completion::Fatal(FatalKind::InvalidImage(
                "reg_var_decl dispatched as an instruction",
            )),
            Opcode::Assignment { dst, kind, src } => {
                Completion::from_result(self.op_assignment(frame, dst, kind, src))
            }
            Opcode::PreIncr { dst, var } => {
                Completion::from_result(self.op_incr_decr(frame, dst, var, 1.0, true))
            }
            Opcode::PreDecr { dst, var } => {
                Completion::from_result(self.op_incr_decr(frame, dst, var, -1.0, true))
            }
            Opcode::PostIncr { dst, var } => {
                Completion::from_result(self.op_incr_decr(frame, dst, var, 1.0, false))
            }
            Opcode::PostDecr { dst, var } => {
                Completion::from_result(self.op_incr_decr(frame, dst, var, -1.0, false))
            }
            Opcode::Addition { dst, left, right } => {
                Completion::from_result(self.op_addition(frame, dst, left, right))
            }
            Opcode::Substraction { dst, left, right } => Completion::from_result(
                self.op_number_binary(frame, dst, left, right, |a, b| a - b),
            ),
            Opcode::Multiplication { dst, left, right } => Completion::from_result(
                self.op_number_binary(frame, dst, left, right, |a, b| a * b),
            ),
            Opcode::Division { dst, left, right } => Completion::from_result(
                self.op_number_binary(frame, dst, left, right, |a, b| a / b),
            ),
            Opcode::Remainder { dst, left, right } => Completion::from_result(
                self.op_number_binary(frame, dst, left, right, |a, b| a % b),
            ),
            Opcode::UnaryMinus { dst, var } => {
                Completion::from_result(self.op_number_unary(frame, dst, var, |n| -n))
            }
            Opcode::UnaryPlus { dst, var } => {
                Completion::from_result(self.op_number_unary(frame, dst, var, |n| n))
            }
            Opcode::BOr { dst, left, right } => Completion::from_result(
                self.op_int32_binary(frame, dst, left, right, |a, b| a | b),
            ),
            Opcode::BXor { dst, left, right } => Completion::from_result(
                self.op_int32_binary(frame, dst, left, right, |a, b| a ^ b),
            ),
            Opcode::BAnd { dst, left, right } => Completion::from_result(
                self.op_int32_binary(frame, dst, left, right, |a, b| a & b),
            ),
            Opcode::BShiftLeft { dst, left, right } => Completion::from_result(
                self.op_int32_binary(frame, dst, left, right, |a, b| a << (b & 0x1F)),
            ),
            Opcode::BShiftRight { dst, left, right } => Completion::from_result(
                self.op_int32_binary(frame, dst, left, right, |a, b| a >> (b & 0x1F)),
            ),
            Opcode::BShiftURight { dst, left, right } => {
                Completion::from_result(self.op_shift_uright(frame, dst, left, right))
            }
            Opcode::BNot { dst, var } => Completion::from_result(self.op_bnot(frame, dst, var)),
            Opcode::LogicalNot { dst, var } => {
                Completion::from_result(self.op_logical_not(frame, dst, var))
            }
            Opcode::EqualValue { dst, left, right } => {
                Completion::from_result(self.op_equal_value(frame, dst, left, right, false))
            }
            Opcode::NotEqualValue { dst, left, right } => {
                Completion::from_result(self.op_equal_value(frame, dst, left, right, true))
            }
            Opcode::EqualValueType { dst, left, right } => {
                Completion::from_result(self.op_equal_value_type(frame, dst, left, right, false))
            }
            Opcode::NotEqualValueType { dst, left, right } => {
                Completion::from_result(self.op_equal_value_type(frame, dst, left, right, true))
            }
            Opcode::LessThan { dst, left, right } => {
                Completion::from_result(self.op_relational(frame, dst, left, right, false, false))
            }
            Opcode::GreaterThan { dst, left, right } => {
                Completion::from_result(self.op_relational(frame, dst, left, right, true, false))
            }
            Opcode::LessOrEqualThan { dst, left, right } => {
                Completion::from_result(self.op_relational(frame, dst, left, right, true, true))
            }
            Opcode::GreaterOrEqualThan { dst, left, right } => {
                Completion::from_result(self.op_relational(frame, dst, left, right, false, true))
            }
            Opcode::Instanceof { dst, left, right } => {
                Completion::from_result(self.op_instanceof_handler(frame, dst, left, right))
            }
            Opcode::In { dst, left, right } => {
                Completion::from_result(self.op_in_handler(frame, dst, left, right))
            }
            Opcode::VarDecl { name } => Completion::from_result(self.op_var_decl(frame, name)),
            Opcode::This { lhs } => Completion::from_result(self.op_this(frame, lhs)),
            Opcode::PropGetter { lhs, obj, prop } => {
                Completion::from_result(self.op_prop_getter(frame, lhs, obj, prop))
            }
            Opcode::PropSetter { obj, prop, rhs } => {
                Completion::from_result(self.op_prop_setter(frame, obj, prop, rhs))
            }
            Opcode::CallN { lhs, func, argc } => {
                Completion::from_result(self.op_call_n(frame, lhs, func, argc))
            }
            Opcode::ConstructN { lhs, func, argc } => {
                Completion::from_result(self.op_construct_n(frame, lhs, func, argc))
            }
            Opcode::FuncDeclN { name, argc } => {
                Completion::from_result(self.op_func_decl_n(frame, name, argc))
            }
            Opcode::FuncExprN { lhs, name, argc } => {
                Completion::from_result(self.op_func_expr_n(frame, lhs, name, argc))
            }
            Opcode::ArrayDecl { lhs, argc } => {
                Completion::from_result(self.op_array_decl(frame, lhs, argc))
            }
            Opcode::ObjDecl { lhs, propc } => {
                Completion::from_result(self.op_obj_decl(frame, lhs, propc))
            }
            Opcode::DeleteVar { lhs, name } => self.op_delete_var(frame, lhs, name),
            Opcode::DeleteProp { lhs, base, name } => {
                Completion::from_result(self.op_delete_prop(frame, lhs, base, name))
            }
            Opcode::Typeof { lhs, var } => {
                Completion::from_result(self.op_typeof(frame, lhs, var))
            }
            Opcode::With { expr } => self.op_with(frame, expr),
            Opcode::ForIn { dst, expr } => self.op_for_in(frame, dst, expr),
            Opcode::TryBlock { d1, d2 } => self.op_try_block(frame, d1, d2),
            Opcode::Throw { var } => match self.get_variable_value(frame, var) {
                Ok(value) => {
                    frame.pos += 1;
                    Completion::Throw(value)
                }
                Err(abrupt) => abrupt.into(),
            },
            Opcode::JmpDown { d1, d2 } => {
                frame.pos += counter_from_idx_idx(d1, d2);
                Completion::Empty
            }
            Opcode::JmpUp { d1, d2 } => {
                frame.pos -= counter_from_idx_idx(d1, d2);
                Completion::Empty
            }
            Opcode::IsTrueJmpDown { cond, d1, d2 } => {
                Completion::from_result(self.op_cond_jmp(frame, cond, d1, d2, true, true))
            }
            Opcode::IsFalseJmpDown { cond, d1, d2 } => {
                Completion::from_result(self.op_cond_jmp(frame, cond, d1, d2, false, true))
            }
            Opcode::IsTrueJmpUp { cond, d1, d2 } => {
                Completion::from_result(self.op_cond_jmp(frame, cond, d1, d2, true, false))
            }
            Opcode::IsFalseJmpUp { cond, d1, d2 } => {
                Completion::from_result(self.op_cond_jmp(frame, cond, d1, d2, false, false))
            }
            Opcode::Ret => Completion::Return(Value::Undefined),
            Opcode::RetVal { var } => match self.get_variable_value(frame, var) {
                Ok(value) => Completion::Return(value),
                Err(abrupt) => abrupt.into(),
            },
            Opcode::Exitval { status } => match status {
                0 => Completion::Exit(true),
                1 => Completion::Exit(false),
                _ => Completion::Fatal(FatalKind::InvalidImage("exitval status out of range")),
            },
            Opcode::Meta { meta_type, .. } => match meta_type {
                MetaType::Varg
                | MetaType::VargPropData
                | MetaType::VargPropGetter
                | MetaType::VargPropSetter
                | MetaType::EndWith
                | MetaType::EndForIn
                | MetaType::Catch
                | MetaType::Finally
                | MetaType::EndTryCatchFinally => Completion::Meta,
                // Strictness is decided before dispatch; the runtime marker
                // is informational.
                MetaType::StrictCode => Completion::Meta,
                MetaType::ThisArg
                | MetaType::FunctionEnd
                | MetaType::CatchExceptionIdentifier => Completion::Fatal(
                    FatalKind::InvalidImage("marker dispatched outside its protocol"),
                ),
            },
        }
    }

    // ========================================================================
    // Simple handlers
    // ========================================================================

    fn op_assignment(
        &mut self,
        frame: &mut Frame,
        dst: u8,
        kind: ArgKind,
        src: u8,
    ) -> OpResult<()> {
        let lit_pos = frame.pos;
        match kind {
            ArgKind::Simple => {
                let value = SimpleValue::decode(src)
                    .ok_or(Abrupt::Fatal(FatalKind::InvalidImage("bad simple value")))?
                    .to_value();
                self.set_variable_value(frame, lit_pos, dst, value)?;
            }
            ArgKind::StringLit => {
                let lit = self.lit_id_for_uid(src, lit_pos)?;
                let id = self.string_from_lit(lit)?;
                let result = self.set_variable_value(frame, lit_pos, dst, Value::Str(id));
                self.strings.deref_string(id);
                result?;
            }
            ArgKind::Variable => {
                let value = self.get_variable_value(frame, src)?;
                let result = self.set_variable_value(frame, lit_pos, dst, value);
                self.free_value(value);
                result?;
            }
            ArgKind::NumberLit | ArgKind::NumberLitNegate => {
                let lit = self.lit_id_for_uid(src, lit_pos)?;
                let mut n = self.number_from_lit(lit)?;
                if kind == ArgKind::NumberLitNegate {
                    n = -n;
                }
                self.set_variable_value(frame, lit_pos, dst, Value::Number(n))?;
            }
            ArgKind::SmallInt => {
                self.set_variable_value(frame, lit_pos, dst, Value::Number(src as f64))?;
            }
            ArgKind::SmallIntNegate => {
                self.set_variable_value(frame, lit_pos, dst, Value::Number(-(src as f64)))?;
            }
        }
        frame.pos += 1;
        Ok(())
    }

    fn op_incr_decr(
        &mut self,
        frame: &mut Frame,
        dst: u8,
        var: u8,
        delta: f64,
        is_pre: bool,
    ) -> OpResult<()> {
        let lit_pos = frame.pos;
        let old_value = self.get_variable_value(frame, var)?;
        let old_num = self.to_number(old_value);
        self.free_value(old_value);
        let old_num = old_num?;

        let new_num = old_num + delta;
        self.set_variable_value(frame, lit_pos, var, Value::Number(new_num))?;
        let result_num = if is_pre { new_num } else { old_num };
        self.set_variable_value(frame, lit_pos, dst, Value::Number(result_num))?;

        frame.pos += 1;
        Ok(())
    }

    /// The addition operator (11.6.1): string concatenation when either
    /// primitive operand is a string, numeric addition otherwise.
    fn op_addition(&mut self, frame: &mut Frame, dst: u8, left: u8, right: u8) -> OpResult<()> {
        let lit_pos = frame.pos;
        let left_value = self.get_variable_value(frame, left)?;
        let right_value = match self.get_variable_value(frame, right) {
            Ok(v) => v,
            Err(abrupt) => {
                self.free_value(left_value);
                return Err(abrupt);
            }
        };

        let result = (|ctx: &mut Context| {
            let lp = ctx.to_primitive(left_value, PreferredType::None)?;
            let rp = match ctx.to_primitive(right_value, PreferredType::None) {
                Ok(rp) => rp,
                Err(abrupt) => {
                    ctx.free_value(lp);
                    return Err(abrupt);
                }
            };

            let result = if lp.as_string().is_some() || rp.as_string().is_some() {
                match ctx.to_string_value(lp) {
                    Err(abrupt) => Err(abrupt),
                    Ok(ls) => {
                        let joined = match ctx.to_string_value(rp) {
                            Err(abrupt) => Err(abrupt),
                            Ok(rs) => {
                                let joined = ctx.concat_with_recovery(ls, rs);
                                ctx.strings.deref_string(rs);
                                joined.map(Value::Str)
                            }
                        };
                        ctx.strings.deref_string(ls);
                        joined
                    }
                }
            } else {
                match (ctx.to_number(lp), ctx.to_number(rp)) {
                    (Ok(a), Ok(b)) => Ok(Value::Number(a + b)),
                    (Err(abrupt), _) | (_, Err(abrupt)) => Err(abrupt),
                }
            };
            ctx.free_value(lp);
            ctx.free_value(rp);
            result
        })(self);

        self.free_value(left_value);
        self.free_value(right_value);
        let sum = result?;

        let stored = self.set_variable_value(frame, lit_pos, dst, sum);
        self.free_value(sum);
        stored?;
        frame.pos += 1;
        Ok(())
    }

    pub(crate) fn concat_with_recovery(
        &mut self,
        a: StringId,
        b: StringId,
    ) -> OpResult<StringId> {
        if let Some(id) = self.strings.concat(a, b) {
            return Ok(id);
        }
        self.try_give_memory_back(crate::mem::GcSeverity::Critical);
        self.strings
            .concat(a, b)
            .ok_or(Abrupt::Fatal(FatalKind::OutOfMemory))
    }

    fn op_number_binary(
        &mut self,
        frame: &mut Frame,
        dst: u8,
        left: u8,
        right: u8,
        apply: fn(f64, f64) -> f64,
    ) -> OpResult<()> {
        let lit_pos = frame.pos;
        let (a, b) = self.two_number_operands(frame, left, right)?;
        self.set_variable_value(frame, lit_pos, dst, Value::Number(apply(a, b)))?;
        frame.pos += 1;
        Ok(())
    }

    fn two_number_operands(
        &mut self,
        frame: &Frame,
        left: u8,
        right: u8,
    ) -> OpResult<(f64, f64)> {
        let left_value = self.get_variable_value(frame, left)?;
        let a = self.to_number(left_value);
        self.free_value(left_value);
        let a = a?;

        let right_value = self.get_variable_value(frame, right)?;
        let b = self.to_number(right_value);
        self.free_value(right_value);
        Ok((a, b?))
    }

    fn op_number_unary(
        &mut self,
        frame: &mut Frame,
        dst: u8,
        var: u8,
        apply: fn(f64) -> f64,
    ) -> OpResult<()> {
        let lit_pos = frame.pos;
        let value = self.get_variable_value(frame, var)?;
        let n = self.to_number(value);
        self.free_value(value);
        self.set_variable_value(frame, lit_pos, dst, Value::Number(apply(n?)))?;
        frame.pos += 1;
        Ok(())
    }

    fn op_int32_binary(
        &mut self,
        frame: &mut Frame,
        dst: u8,
        left: u8,
        right: u8,
        apply: fn(i32, i32) -> i32,
    ) -> OpResult<()> {
        let lit_pos = frame.pos;
        let (a, b) = self.two_number_operands(frame, left, right)?;
        let result = apply(
            crate::conversion::double_to_int32(a),
            crate::conversion::double_to_int32(b),
        );
        self.set_variable_value(frame, lit_pos, dst, Value::Number(result as f64))?;
        frame.pos += 1;
        Ok(())
    }

    fn op_shift_uright(
        &mut self,
        frame: &mut Frame,
        dst: u8,
        left: u8,
        right: u8,
    ) -> OpResult<()> {
        let lit_pos = frame.pos;
        let (a, b) = self.two_number_operands(frame, left, right)?;
        let a = crate::conversion::double_to_int32(a) as u32;
        let shift = crate::conversion::double_to_int32(b) as u32 & 0x1F;
        self.set_variable_value(frame, lit_pos, dst, Value::Number((a >> shift) as f64))?;
        frame.pos += 1;
        Ok(())
    }

    fn op_bnot(&mut self, frame: &mut Frame, dst: u8, var: u8) -> OpResult<()> {
        let lit_pos = frame.pos;
        let value = self.get_variable_value(frame, var)?;
        let n = self.to_number(value);
        self.free_value(value);
        let result = !crate::conversion::double_to_int32(n?);
        self.set_variable_value(frame, lit_pos, dst, Value::Number(result as f64))?;
        frame.pos += 1;
        Ok(())
    }

    fn op_logical_not(&mut self, frame: &mut Frame, dst: u8, var: u8) -> OpResult<()> {
        let lit_pos = frame.pos;
        let value = self.get_variable_value(frame, var)?;
        let result = !self.to_boolean(value);
        self.free_value(value);
        self.set_variable_value(frame, lit_pos, dst, Value::Bool(result))?;
        frame.pos += 1;
        Ok(())
    }

    fn op_equal_value(
        &mut self,
        frame: &mut Frame,
        dst: u8,
        left: u8,
        right: u8,
        negate: bool,
    ) -> OpResult<()> {
        let lit_pos = frame.pos;
        let left_value = self.get_variable_value(frame, left)?;
        let right_value = match self.get_variable_value(frame, right) {
            Ok(v) => v,
            Err(abrupt) => {
                self.free_value(left_value);
                return Err(abrupt);
            }
        };
        let equal = self.abstract_equality(left_value, right_value);
        self.free_value(left_value);
        self.free_value(right_value);
        let result = equal? != negate;
        self.set_variable_value(frame, lit_pos, dst, Value::Bool(result))?;
        frame.pos += 1;
        Ok(())
    }

    fn op_equal_value_type(
        &mut self,
        frame: &mut Frame,
        dst: u8,
        left: u8,
        right: u8,
        negate: bool,
    ) -> OpResult<()> {
        let lit_pos = frame.pos;
        let left_value = self.get_variable_value(frame, left)?;
        let right_value = match self.get_variable_value(frame, right) {
            Ok(v) => v,
            Err(abrupt) => {
                self.free_value(left_value);
                return Err(abrupt);
            }
        };
        let result = self.strict_equality(left_value, right_value) != negate;
        self.free_value(left_value);
        self.free_value(right_value);
        self.set_variable_value(frame, lit_pos, dst, Value::Bool(result))?;
        frame.pos += 1;
        Ok(())
    }

    /// The four relational handlers reduce to the abstract comparison with
    /// swapped operands and result negation (11.8.1-11.8.4).
    fn op_relational(
        &mut self,
        frame: &mut Frame,
        dst: u8,
        left: u8,
        right: u8,
        swap: bool,
        negate: bool,
    ) -> OpResult<()> {
        let lit_pos = frame.pos;
        let left_value = self.get_variable_value(frame, left)?;
        let right_value = match self.get_variable_value(frame, right) {
            Ok(v) => v,
            Err(abrupt) => {
                self.free_value(left_value);
                return Err(abrupt);
            }
        };

        let compared = if swap {
            self.abstract_relational(right_value, left_value, false)
        } else {
            self.abstract_relational(left_value, right_value, true)
        };
        self.free_value(left_value);
        self.free_value(right_value);

        let result = match compared? {
            None => false,
            Some(lt) => lt != negate,
        };
        self.set_variable_value(frame, lit_pos, dst, Value::Bool(result))?;
        frame.pos += 1;
        Ok(())
    }

    fn op_instanceof_handler(
        &mut self,
        frame: &mut Frame,
        dst: u8,
        left: u8,
        right: u8,
    ) -> OpResult<()> {
        let lit_pos = frame.pos;
        let value = self.get_variable_value(frame, left)?;
        let target = match self.get_variable_value(frame, right) {
            Ok(v) => v,
            Err(abrupt) => {
                self.free_value(value);
                return Err(abrupt);
            }
        };
        let found = self.op_instanceof(value, target);
        self.free_value(value);
        self.free_value(target);
        self.set_variable_value(frame, lit_pos, dst, Value::Bool(found?))?;
        frame.pos += 1;
        Ok(())
    }

    fn op_in_handler(&mut self, frame: &mut Frame, dst: u8, left: u8, right: u8) -> OpResult<()> {
        let lit_pos = frame.pos;
        let name_value = self.get_variable_value(frame, left)?;
        let base = match self.get_variable_value(frame, right) {
            Ok(v) => v,
            Err(abrupt) => {
                self.free_value(name_value);
                return Err(abrupt);
            }
        };

        let result = (|ctx: &mut Context| {
            let Some(obj) = base.as_object() else {
                return Err(ctx.throw_error(ErrorKind::Type));
            };
            let name = ctx.to_string_value(name_value)?;
            let found = ctx.op_object_has_property(obj, name);
            ctx.strings.deref_string(name);
            found
        })(self);

        self.free_value(name_value);
        self.free_value(base);
        self.set_variable_value(frame, lit_pos, dst, Value::Bool(result?))?;
        frame.pos += 1;
        Ok(())
    }

    /// Declaration binding instantiation for one `var` (10.5 block 8): the
    /// binding is created if absent, and left undisturbed otherwise.
    fn op_var_decl(&mut self, frame: &mut Frame, name_idx: u8) -> OpResult<()> {
        let lit = self.lit_id_for_uid(name_idx, frame.pos)?;
        let name = self.string_from_lit(lit)?;
        let result = (|ctx: &mut Context| {
            if !ctx.op_has_binding(frame.lex_env, name)? {
                ctx.op_create_mutable_binding(frame.lex_env, name, frame.is_eval_code)?;
            }
            Ok(())
        })(self);
        self.strings.deref_string(name);
        result?;
        frame.pos += 1;
        Ok(())
    }

    fn op_this(&mut self, frame: &mut Frame, lhs: u8) -> OpResult<()> {
        let lit_pos = frame.pos;
        frame.pos += 1;
        let this = frame.this_binding;
        self.set_variable_value(frame, lit_pos, lhs, this)
    }

    // ========================================================================
    // Property access
    // ========================================================================

    fn op_prop_getter(
        &mut self,
        frame: &mut Frame,
        lhs: u8,
        obj: u8,
        prop: u8,
    ) -> OpResult<()> {
        let lit_pos = frame.pos;
        let base = self.get_variable_value(frame, obj)?;
        let prop_value = match self.get_variable_value(frame, prop) {
            Ok(v) => v,
            Err(abrupt) => {
                self.free_value(base);
                return Err(abrupt);
            }
        };

        let result = (|ctx: &mut Context| {
            ctx.check_object_coercible(base)?;
            let name = ctx.to_string_value(prop_value)?;
            let reference =
                Reference::new(ReferenceBase::Value(base), name, frame.is_strict);
            let value = ctx.get_value_object_base(&reference);
            ctx.strings.deref_string(name);
            value
        })(self);

        self.free_value(base);
        self.free_value(prop_value);
        let value = result?;

        let stored = self.set_variable_value(frame, lit_pos, lhs, value);
        self.free_value(value);
        stored?;
        frame.pos += 1;
        Ok(())
    }

    fn op_prop_setter(
        &mut self,
        frame: &mut Frame,
        obj: u8,
        prop: u8,
        rhs: u8,
    ) -> OpResult<()> {
        let base = self.get_variable_value(frame, obj)?;
        let prop_value = match self.get_variable_value(frame, prop) {
            Ok(v) => v,
            Err(abrupt) => {
                self.free_value(base);
                return Err(abrupt);
            }
        };

        let result = (|ctx: &mut Context| {
            ctx.check_object_coercible(base)?;
            let name = ctx.to_string_value(prop_value)?;
            let reference =
                Reference::new(ReferenceBase::Value(base), name, frame.is_strict);
            let rhs_value = match ctx.get_variable_value(frame, rhs) {
                Ok(v) => v,
                Err(abrupt) => {
                    ctx.strings.deref_string(name);
                    return Err(abrupt);
                }
            };
            let put = ctx.put_value_object_base(&reference, rhs_value);
            ctx.free_value(rhs_value);
            ctx.strings.deref_string(name);
            put
        })(self);

        self.free_value(base);
        self.free_value(prop_value);
        result?;
        frame.pos += 1;
        Ok(())
    }

    // ========================================================================
    // Variable-arity protocols
    // ========================================================================

    /// Collect `count` argument values delivered by `varg` markers: run the
    /// loop until each marker, then read the value it names.
    fn fill_varg_list(&mut self, frame: &mut Frame, count: u8) -> OpResult<Vec<Value>> {
        let mut values: Vec<Value> = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let completion = self.run_loop(frame);
            if !completion.is_empty() {
                self.free_values(&values);
                return Err(abrupt_of(completion));
            }
            match self.program.opcode(frame.pos) {
                Some(Opcode::Meta { meta_type: MetaType::Varg, d1, .. }) => {
                    match self.get_variable_value(frame, d1) {
                        Ok(value) => {
                            values.push(value);
                            frame.pos += 1;
                        }
                        Err(abrupt) => {
                            self.free_values(&values);
                            return Err(abrupt);
                        }
                    }
                }
                _ => {
                    self.free_values(&values);
                    return Err(Abrupt::Fatal(FatalKind::InvalidImage(
                        "expected a varg marker",
                    )));
                }
            }
        }
        Ok(values)
    }

    fn free_values(&mut self, values: &[Value]) {
        for &value in values {
            self.free_value(value);
        }
    }

    /// Read `count` formal parameter names (plain `varg` markers, no code
    /// runs between them).
    fn fill_params_list(&mut self, frame: &mut Frame, count: u8) -> OpResult<Vec<StringId>> {
        let mut names: Vec<StringId> = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match self.program.opcode(frame.pos) {
                Some(Opcode::Meta { meta_type: MetaType::Varg, d1, .. }) => {
                    let lit = self.lit_id_for_uid(d1, frame.pos);
                    let name = lit.and_then(|lit| self.string_from_lit(lit));
                    match name {
                        Ok(name) => {
                            names.push(name);
                            frame.pos += 1;
                        }
                        Err(abrupt) => {
                            for name in names {
                                self.strings.deref_string(name);
                            }
                            return Err(abrupt);
                        }
                    }
                }
                _ => {
                    for name in names {
                        self.strings.deref_string(name);
                    }
                    return Err(Abrupt::Fatal(FatalKind::InvalidImage(
                        "expected a parameter marker",
                    )));
                }
            }
        }
        Ok(names)
    }

    /// Read the function-end marker at the current position; returns the
    /// counter one past the body.
    fn read_function_end(&mut self, frame: &Frame) -> OpResult<OpcodeCounter> {
        match self.program.opcode(frame.pos) {
            Some(Opcode::Meta { meta_type: MetaType::FunctionEnd, d1, d2 }) => {
                Ok(frame.pos + counter_from_idx_idx(d1, d2))
            }
            _ => Err(Abrupt::Fatal(FatalKind::InvalidImage(
                "expected a function-end marker",
            ))),
        }
    }

    // ========================================================================
    // Calls and constructors
    // ========================================================================

    fn op_call_n(&mut self, frame: &mut Frame, lhs: u8, func: u8, argc_field: u8) -> OpResult<()> {
        let lit_pos = frame.pos;
        let func_value = self.get_variable_value(frame, func)?;
        frame.pos += 1;

        // An explicit this is delivered by a marker and counted inside the
        // argument field.
        let mut this_idx: Option<u8> = None;
        let mut argc = argc_field;
        if let Some(Opcode::Meta { meta_type: MetaType::ThisArg, d1, .. }) =
            self.program.opcode(frame.pos)
        {
            if argc_field == 0 || !frame.is_reg(d1) {
                self.free_value(func_value);
                return Err(Abrupt::Fatal(FatalKind::InvalidImage("bad this-arg marker")));
            }
            this_idx = Some(d1);
            argc = argc_field - 1;
            frame.pos += 1;
        }

        let args = match self.fill_varg_list(frame, argc) {
            Ok(args) => args,
            Err(abrupt) => {
                self.free_value(func_value);
                return Err(abrupt);
            }
        };

        let result = (|ctx: &mut Context| {
            let this_value = match this_idx {
                Some(idx) => ctx.get_variable_value(frame, idx)?,
                None => ctx.op_implicit_this_value(frame.lex_env)?,
            };

            let call_result = if !ctx.op_is_callable(func_value) {
                Err(ctx.throw_error(ErrorKind::Type))
            } else {
                let callee = func_value.as_object().expect("callable implies object");
                ctx.op_function_call(callee, this_value, &args)
            };
            ctx.free_value(this_value);

            let value = call_result?;
            let stored = ctx.set_variable_value(frame, lit_pos, lhs, value);
            ctx.free_value(value);
            stored
        })(self);

        self.free_values(&args);
        self.free_value(func_value);
        result
    }

    fn op_construct_n(
        &mut self,
        frame: &mut Frame,
        lhs: u8,
        func: u8,
        argc: u8,
    ) -> OpResult<()> {
        let lit_pos = frame.pos;
        let ctor_value = self.get_variable_value(frame, func)?;
        frame.pos += 1;

        let args = match self.fill_varg_list(frame, argc) {
            Ok(args) => args,
            Err(abrupt) => {
                self.free_value(ctor_value);
                return Err(abrupt);
            }
        };

        let result = (|ctx: &mut Context| {
            let construct_result = if !ctx.op_is_constructor(ctor_value) {
                Err(ctx.throw_error(ErrorKind::Type))
            } else {
                let ctor = ctor_value.as_object().expect("constructor implies object");
                ctx.op_function_construct(ctor, &args)
            };
            let value = construct_result?;
            let stored = ctx.set_variable_value(frame, lit_pos, lhs, value);
            ctx.free_value(value);
            stored
        })(self);

        self.free_values(&args);
        self.free_value(ctor_value);
        result
    }

    // ========================================================================
    // Function definitions
    // ========================================================================

    fn op_func_decl_n(&mut self, frame: &mut Frame, name_idx: u8, argc: u8) -> OpResult<()> {
        let name_lit = self.lit_id_for_uid(name_idx, frame.pos)?;
        frame.pos += 1;

        let params = self.fill_params_list(frame, argc)?;
        let result = (|ctx: &mut Context| {
            let code_end = ctx.read_function_end(frame)?;
            frame.pos += 1;

            let mut is_strict = frame.is_strict;
            if let Some(Opcode::Meta { meta_type: MetaType::StrictCode, .. }) =
                ctx.program.opcode(frame.pos)
            {
                is_strict = true;
                frame.pos += 1;
            }

            let name = ctx.string_from_lit(name_lit)?;
            let declared = ctx.op_function_declaration(
                frame.lex_env,
                name,
                &params,
                frame.pos,
                is_strict,
                frame.is_eval_code,
            );
            ctx.strings.deref_string(name);
            declared?;

            frame.pos = code_end;
            Ok(())
        })(self);

        for name in params {
            self.strings.deref_string(name);
        }
        result
    }

    fn op_func_expr_n(
        &mut self,
        frame: &mut Frame,
        lhs: u8,
        name_idx: u8,
        argc: u8,
    ) -> OpResult<()> {
        let lit_pos = frame.pos;
        let is_named = name_idx != crate::vm::opcode::INVALID_IDX;
        frame.pos += 1;

        let params = self.fill_params_list(frame, argc)?;
        let result = (|ctx: &mut Context| {
            let code_end = ctx.read_function_end(frame)?;
            frame.pos += 1;

            let mut is_strict = frame.is_strict;
            if let Some(Opcode::Meta { meta_type: MetaType::StrictCode, .. }) =
                ctx.program.opcode(frame.pos)
            {
                is_strict = true;
                frame.pos += 1;
            }

            // A named function expression closes over a fresh declarative
            // environment carrying its own immutable self-binding.
            let (scope, name) = if is_named {
                let lit = ctx.lit_id_for_uid(name_idx, lit_pos)?;
                let name = ctx.string_from_lit(lit)?;
                let scope = match ctx.create_decl_env(Some(frame.lex_env)) {
                    Ok(scope) => scope,
                    Err(abrupt) => {
                        ctx.strings.deref_string(name);
                        return Err(abrupt);
                    }
                };
                ctx.objects.inc_rc(scope);
                if let Err(abrupt) = ctx.op_create_immutable_binding(scope, name) {
                    ctx.objects.dec_rc(scope);
                    ctx.strings.deref_string(name);
                    return Err(abrupt);
                }
                (scope, Some(name))
            } else {
                ctx.objects.inc_rc(frame.lex_env);
                (frame.lex_env, None)
            };

            let built = (|ctx: &mut Context| {
                let func = ctx.op_create_function_object(&params, scope, is_strict, frame.pos)?;
                let mut stored = ctx.set_variable_value(frame, lit_pos, lhs, Value::Object(func));
                if stored.is_ok() {
                    if let Some(name) = name {
                        stored =
                            ctx.op_initialize_immutable_binding(scope, name, Value::Object(func));
                    }
                }
                ctx.free_value(Value::Object(func));
                stored
            })(ctx);

            if let Some(name) = name {
                ctx.strings.deref_string(name);
            }
            ctx.objects.dec_rc(scope);
            built?;

            frame.pos = code_end;
            Ok(())
        })(self);

        for name in params {
            self.strings.deref_string(name);
        }
        result
    }

    // ========================================================================
    // Initializers
    // ========================================================================

    fn op_array_decl(&mut self, frame: &mut Frame, lhs: u8, argc: u8) -> OpResult<()> {
        let lit_pos = frame.pos;
        frame.pos += 1;

        let elements = self.fill_varg_list(frame, argc)?;
        let result = (|ctx: &mut Context| {
            let array = ctx.op_create_array_object(&elements)?;
            let stored = ctx.set_variable_value(frame, lit_pos, lhs, array);
            ctx.free_value(array);
            stored
        })(self);
        self.free_values(&elements);
        result
    }

    fn op_obj_decl(&mut self, frame: &mut Frame, lhs: u8, propc: u8) -> OpResult<()> {
        let lit_pos = frame.pos;
        frame.pos += 1;

        let obj = self.op_create_object_object()?;
        let result = (|ctx: &mut Context| {
            for _ in 0..propc {
                let completion = ctx.run_loop(frame);
                if !completion.is_empty() {
                    return Err(abrupt_of(completion));
                }
                ctx.define_initializer_property(frame, obj)?;
                frame.pos += 1;
            }
            ctx.set_variable_value(frame, lit_pos, lhs, Value::Object(obj))
        })(self);
        self.free_value(Value::Object(obj));
        result
    }

    /// Consume one object-initializer marker (data / getter / setter) and
    /// define the property it describes (11.1.5).
    fn define_initializer_property(&mut self, frame: &mut Frame, obj: ObjectId) -> OpResult<()> {
        let Some(Opcode::Meta { meta_type, d1, d2 }) = self.program.opcode(frame.pos) else {
            return Err(Abrupt::Fatal(FatalKind::InvalidImage(
                "expected an initializer marker",
            )));
        };

        let name_value = self.get_variable_value(frame, d1)?;
        let prop_value = match self.get_variable_value(frame, d2) {
            Ok(v) => v,
            Err(abrupt) => {
                self.free_value(name_value);
                return Err(abrupt);
            }
        };

        let result = (|ctx: &mut Context| {
            let name = ctx.to_string_value(name_value)?;

            let desc = match meta_type {
                MetaType::VargPropData => PropertyDescriptor {
                    value: Some(prop_value),
                    writable: Some(true),
                    enumerable: Some(true),
                    configurable: Some(true),
                    ..PropertyDescriptor::default()
                },
                MetaType::VargPropGetter | MetaType::VargPropSetter => {
                    let Some(accessor) = prop_value.as_object() else {
                        ctx.strings.deref_string(name);
                        return Err(Abrupt::Fatal(FatalKind::InvalidImage(
                            "initializer accessor is not an object",
                        )));
                    };
                    if meta_type == MetaType::VargPropGetter {
                        PropertyDescriptor {
                            get: Some(Some(accessor)),
                            enumerable: Some(true),
                            configurable: Some(true),
                            ..PropertyDescriptor::default()
                        }
                    } else {
                        PropertyDescriptor {
                            set: Some(Some(accessor)),
                            enumerable: Some(true),
                            configurable: Some(true),
                            ..PropertyDescriptor::default()
                        }
                    }
                }
                _ => {
                    ctx.strings.deref_string(name);
                    return Err(Abrupt::Fatal(FatalKind::InvalidImage(
                        "unexpected marker in an initializer",
                    )));
                }
            };

            let defined = ctx.op_object_define_own_property(obj, name, &desc, false);
            ctx.strings.deref_string(name);
            defined.map(|_| ())
        })(self);

        self.free_value(name_value);
        self.free_value(prop_value);
        result
    }

    // ========================================================================
    // delete / typeof
    // ========================================================================

    /// `delete identifier` (11.4.1 cases 3 and 5.a). In strict code this is
    /// an early SyntaxError; an image carrying it violates the compiler
    /// contract and the fault is fatal, not silent.
    fn op_delete_var(&mut self, frame: &mut Frame, lhs: u8, name_idx: u8) -> Completion {
        if frame.is_strict {
            return Completion::Fatal(FatalKind::InvalidImage(
                "strict-mode delete of an identifier reached the interpreter",
            ));
        }

        let lit_pos = frame.pos;
        frame.pos += 1;

        let result = (|ctx: &mut Context| {
            let lit = ctx.lit_id_for_uid(name_idx, lit_pos)?;
            let name = ctx.string_from_lit(lit)?;
            let deleted = (|ctx: &mut Context| {
                match ctx.resolve_reference_base(frame.lex_env, name)? {
                    None => Ok(true),
                    Some(env) => ctx.op_delete_binding(env, name),
                }
            })(ctx);
            ctx.strings.deref_string(name);
            let deleted = deleted?;
            ctx.set_variable_value(frame, lit_pos, lhs, Value::Bool(deleted))
        })(self);
        Completion::from_result(result)
    }

    fn op_delete_prop(
        &mut self,
        frame: &mut Frame,
        lhs: u8,
        base: u8,
        name_idx: u8,
    ) -> OpResult<()> {
        let lit_pos = frame.pos;
        let base_value = self.get_variable_value(frame, base)?;
        let name_value = match self.get_variable_value(frame, name_idx) {
            Ok(v) => v,
            Err(abrupt) => {
                self.free_value(base_value);
                return Err(abrupt);
            }
        };

        let result = (|ctx: &mut Context| {
            ctx.check_object_coercible(base_value)?;
            let name = ctx.to_string_value(name_value)?;
            let deleted = (|ctx: &mut Context| {
                let obj = ctx.to_object(base_value)?;
                let deleted = ctx.op_object_delete(obj, name, frame.is_strict);
                ctx.free_value(Value::Object(obj));
                deleted
            })(ctx);
            ctx.strings.deref_string(name);
            let deleted = deleted?;
            ctx.set_variable_value(frame, lit_pos, lhs, Value::Bool(deleted))
        })(self);

        self.free_value(base_value);
        self.free_value(name_value);
        result?;
        frame.pos += 1;
        Ok(())
    }

    fn op_typeof(&mut self, frame: &mut Frame, lhs: u8, var: u8) -> OpResult<()> {
        let lit_pos = frame.pos;

        // 2.b: typeof of an unresolvable identifier is "undefined", not a
        // ReferenceError.
        let value = if frame.is_reg(var) {
            self.get_variable_value(frame, var)?
        } else {
            let lit = self.lit_id_for_uid(var, frame.pos)?;
            let name = self.string_from_lit(lit)?;
            let resolved = self.resolve_reference_base(frame.lex_env, name);
            let value = match resolved {
                Ok(Some(env)) => self.op_get_binding_value(env, name, frame.is_strict),
                Ok(None) => Ok(Value::Undefined),
                Err(abrupt) => Err(abrupt),
            };
            self.strings.deref_string(name);
            value?
        };

        let magic = match value {
            Value::Undefined | Value::Empty => MagicStringId::Undefined,
            Value::Null => MagicStringId::Object,
            Value::Bool(_) => MagicStringId::Boolean,
            Value::Number(_) => MagicStringId::Number,
            Value::Str(_) => MagicStringId::String,
            Value::Object(_) => {
                if self.op_is_callable(value) {
                    MagicStringId::Function
                } else {
                    MagicStringId::Object
                }
            }
        };
        self.free_value(value);

        let type_str = self.strings.magic(magic);
        self.set_variable_value(frame, lit_pos, lhs, Value::Str(type_str))?;
        frame.pos += 1;
        Ok(())
    }

    // ========================================================================
    // with / for-in / try
    // ========================================================================

    fn op_with(&mut self, frame: &mut Frame, expr: u8) -> Completion {
        let expr_value = match self.get_variable_value(frame, expr) {
            Ok(v) => v,
            Err(abrupt) => return abrupt.into(),
        };
        let obj = match self.to_object(expr_value) {
            Ok(obj) => obj,
            Err(abrupt) => {
                self.free_value(expr_value);
                return abrupt.into();
            }
        };
        frame.pos += 1;

        let old_env = frame.lex_env;
        let new_env = match self.create_object_env(Some(old_env), obj, true) {
            Ok(env) => env,
            Err(abrupt) => {
                self.free_value(Value::Object(obj));
                self.free_value(expr_value);
                return abrupt.into();
            }
        };
        self.objects.inc_rc(new_env);
        frame.lex_env = new_env;

        let mut completion = self.run_loop(frame);
        if completion.is_empty() {
            match self.program.opcode(frame.pos) {
                Some(Opcode::Meta { meta_type: MetaType::EndWith, .. }) => {
                    frame.pos += 1;
                }
                _ => {
                    completion = Completion::Fatal(FatalKind::InvalidImage(
                        "with body ended at the wrong marker",
                    ));
                }
            }
        }

        frame.lex_env = old_env;
        self.objects.dec_rc(new_env);
        self.free_value(Value::Object(obj));
        self.free_value(expr_value);
        completion
    }

    /// for-in (12.6.4): enumerate the own and inherited enumerable property
    /// names, skipping names deleted mid-iteration; the body is delimited by
    /// the end-for-in marker.
    fn op_for_in(&mut self, frame: &mut Frame, dst: u8, expr: u8) -> Completion {
        let lit_pos = frame.pos;
        let expr_value = match self.get_variable_value(frame, expr) {
            Ok(v) => v,
            Err(abrupt) => return abrupt.into(),
        };

        let end_meta = match self.find_end_for_in(frame.pos + 1) {
            Ok(at) => at,
            Err(abrupt) => {
                self.free_value(expr_value);
                return abrupt.into();
            }
        };

        // An undefined or null expression skips the statement entirely.
        if expr_value.is_nullish() {
            self.free_value(expr_value);
            frame.pos = end_meta + 1;
            return Completion::Empty;
        }

        let obj = match self.to_object(expr_value) {
            Ok(obj) => obj,
            Err(abrupt) => {
                self.free_value(expr_value);
                return abrupt.into();
            }
        };

        let names = self.collect_enumerable_names(obj);
        let body_start = frame.pos + 1;
        let mut completion = Completion::Empty;

        for &name in &names {
            // A property removed while iterating is not visited.
            let still_there = match self.op_object_has_property(obj, name) {
                Ok(found) => found,
                Err(abrupt) => {
                    completion = abrupt.into();
                    break;
                }
            };
            if !still_there {
                continue;
            }

            self.strings.ref_string(name);
            if let Err(abrupt) =
                self.set_variable_value(frame, lit_pos, dst, Value::Str(name))
            {
                self.strings.deref_string(name);
                completion = abrupt.into();
                break;
            }
            self.strings.deref_string(name);

            frame.pos = body_start;
            let body = self.run_loop(frame);
            if body.is_empty() {
                match self.program.opcode(frame.pos) {
                    Some(Opcode::Meta { meta_type: MetaType::EndForIn, .. }) => {}
                    _ => {
                        completion = Completion::Fatal(FatalKind::InvalidImage(
                            "for-in body ended at the wrong marker",
                        ));
                        break;
                    }
                }
            } else {
                completion = body;
                break;
            }
        }

        for name in names {
            self.strings.deref_string(name);
        }
        self.free_value(Value::Object(obj));
        self.free_value(expr_value);

        if completion.is_empty() {
            frame.pos = end_meta + 1;
        }
        completion
    }

    /// Own and inherited enumerable property names, shadowing-deduped.
    /// Returned names carry a reference each.
    fn collect_enumerable_names(&mut self, obj: ObjectId) -> Vec<StringId> {
        let mut seen: FxHashSet<StringId> = FxHashSet::default();
        let mut names = Vec::new();
        let mut at = Some(obj);
        while let Some(current) = at {
            let mut cursor = self.objects.get(current).props;
            let mut level: Vec<(StringId, bool)> = Vec::new();
            while let Some(pid) = cursor {
                let node = self.props.get(pid.raw());
                if let Some(name) = node.name {
                    level.push((name, node.is_enumerable()));
                }
                cursor = node.next;
            }
            // The list links newest-first; enumeration runs oldest-first.
            for (name, enumerable) in level.into_iter().rev() {
                if seen.insert(name) && enumerable {
                    self.strings.ref_string(name);
                    names.push(name);
                }
            }
            at = self.objects.get(current).prototype;
        }
        names
    }

    /// Find the end-for-in marker matching the body that starts at `from`.
    /// Nested statements keep their markers balanced, so a depth count is
    /// enough even across skipped function bodies.
    fn find_end_for_in(&self, from: OpcodeCounter) -> OpResult<OpcodeCounter> {
        let mut depth = 0u32;
        let mut at = from;
        loop {
            match self.program.opcode(at) {
                None => {
                    return Err(Abrupt::Fatal(FatalKind::InvalidImage(
                        "unterminated for-in body",
                    )))
                }
                Some(Opcode::ForIn { .. }) => depth += 1,
                Some(Opcode::Meta { meta_type: MetaType::EndForIn, .. }) => {
                    if depth == 0 {
                        return Ok(at);
                    }
                    depth -= 1;
                }
                _ => {}
            }
            at += 1;
        }
    }

    /// try/catch/finally (12.14), delimited by markers: the `try_block`
    /// record carries the delta to the marker section; `catch` and
    /// `finally` markers carry deltas over their own blocks, and
    /// `end_try_catch_finally` closes the statement.
    fn op_try_block(&mut self, frame: &mut Frame, d1: u8, d2: u8) -> Completion {
        let markers_at = frame.pos + counter_from_idx_idx(d1, d2);
        frame.pos += 1;

        let mut completion = self.run_loop(frame);
        let mut at = markers_at;

        // Catch section.
        if let Some(Opcode::Meta { meta_type: MetaType::Catch, d1, d2 }) = self.program.opcode(at)
        {
            let catch_end = at + counter_from_idx_idx(d1, d2);
            if let Completion::Throw(exception) = completion {
                completion = self.run_catch_block(frame, at, exception);
            }
            at = catch_end;
        }

        // Finally section runs on every path; its abrupt completion takes
        // precedence over the pending one.
        if let Some(Opcode::Meta { meta_type: MetaType::Finally, d1, d2 }) =
            self.program.opcode(at)
        {
            let finally_end = at + counter_from_idx_idx(d1, d2);
            frame.pos = at + 1;
            let finally_completion = self.run_loop(frame);
            if !finally_completion.is_empty() {
                match completion {
                    Completion::Throw(pending) | Completion::Return(pending) => {
                        self.free_value(pending)
                    }
                    _ => {}
                }
                completion = finally_completion;
            }
            at = finally_end;
        }

        match self.program.opcode(at) {
            Some(Opcode::Meta { meta_type: MetaType::EndTryCatchFinally, .. }) => {
                frame.pos = at + 1;
                completion
            }
            _ => Completion::Fatal(FatalKind::InvalidImage(
                "try statement without its closing marker",
            )),
        }
    }

    /// Bind the exception in a fresh declarative environment and run the
    /// catch block.
    fn run_catch_block(
        &mut self,
        frame: &mut Frame,
        catch_at: OpcodeCounter,
        exception: Value,
    ) -> Completion {
        let ident_at = catch_at + 1;
        let Some(Opcode::Meta {
            meta_type: MetaType::CatchExceptionIdentifier,
            d1,
            ..
        }) = self.program.opcode(ident_at)
        else {
            self.free_value(exception);
            return Completion::Fatal(FatalKind::InvalidImage(
                "catch block without its identifier marker",
            ));
        };

        let result = (|ctx: &mut Context| -> OpResult<ObjectId> {
            let lit = ctx.lit_id_for_uid(d1, ident_at)?;
            let name = ctx.string_from_lit(lit)?;
            let env = match ctx.create_decl_env(Some(frame.lex_env)) {
                Ok(env) => env,
                Err(abrupt) => {
                    ctx.strings.deref_string(name);
                    return Err(abrupt);
                }
            };
            ctx.objects.inc_rc(env);
            let bound = ctx
                .op_create_mutable_binding(env, name, false)
                .and_then(|()| ctx.op_set_mutable_binding(env, name, exception, false));
            ctx.strings.deref_string(name);
            match bound {
                Ok(()) => Ok(env),
                Err(abrupt) => {
                    ctx.objects.dec_rc(env);
                    Err(abrupt)
                }
            }
        })(self);

        let env = match result {
            Ok(env) => env,
            Err(abrupt) => {
                self.free_value(exception);
                return abrupt.into();
            }
        };
        // The binding now keeps the exception reachable.
        self.free_value(exception);

        let old_env = frame.lex_env;
        frame.lex_env = env;
        frame.pos = ident_at + 1;
        // On normal completion the loop stopped at the next marker (finally
        // or the closing one); the caller resumes from the absolute section
        // positions.
        let completion = self.run_loop(frame);
        frame.lex_env = old_env;
        self.objects.dec_rc(env);
        completion
    }

    fn op_cond_jmp(
        &mut self,
        frame: &mut Frame,
        cond: u8,
        d1: u8,
        d2: u8,
        jump_when: bool,
        down: bool,
    ) -> OpResult<()> {
        let value = self.get_variable_value(frame, cond)?;
        let truthy = self.to_boolean(value);
        self.free_value(value);

        if truthy == jump_when {
            let delta = counter_from_idx_idx(d1, d2);
            if down {
                frame.pos += delta;
            } else {
                frame.pos -= delta;
            }
        } else {
            frame.pos += 1;
        }
        Ok(())
    }
}
