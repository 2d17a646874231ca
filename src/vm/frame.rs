//! Per-invocation interpreter frame: the register window and the execution
//! flags threaded through the dispatch loop.
//!
//! Register values are externally referenced; the interpreter releases them
//! when the frame is torn down in `run_from_pos`.

use crate::object::ObjectId;
use crate::value::Value;
use crate::vm::opcode::OpcodeCounter;

pub struct Frame {
    pub pos: OpcodeCounter,
    pub this_binding: Value,
    /// Current lexical environment; `with` swaps it temporarily.
    pub lex_env: ObjectId,
    pub is_strict: bool,
    pub is_eval_code: bool,
    min_reg: u8,
    regs: Vec<Value>,
}

impl Frame {
    pub fn new(
        pos: OpcodeCounter,
        this_binding: Value,
        lex_env: ObjectId,
        is_strict: bool,
        is_eval_code: bool,
        min_reg: u8,
        max_reg: u8,
    ) -> Self {
        Frame {
            pos,
            this_binding,
            lex_env,
            is_strict,
            is_eval_code,
            min_reg,
            regs: vec![Value::Undefined; (max_reg - min_reg + 1) as usize],
        }
    }

    /// Is this operand byte a register of the frame's window (as opposed to
    /// a literal uid)?
    #[inline]
    pub fn is_reg(&self, idx: u8) -> bool {
        idx >= self.min_reg && ((idx - self.min_reg) as usize) < self.regs.len()
    }

    #[inline]
    pub fn reg(&self, idx: u8) -> Value {
        self.regs[(idx - self.min_reg) as usize]
    }

    /// Raw store; reference accounting is the interpreter's job.
    #[inline]
    pub fn set_reg(&mut self, idx: u8, value: Value) {
        self.regs[(idx - self.min_reg) as usize] = value;
    }

    /// Drain the register values for teardown.
    pub fn take_regs(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.regs)
    }
}
