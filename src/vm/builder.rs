//! Program assembly for embedders, tests and benchmarks.
//!
//! The source-to-bytecode compiler is an external collaborator; this builder
//! is the programmatic way to produce its output: emit fixed-width records,
//! patch jump deltas, and intern literals into per-scope uid maps.

use indexmap::IndexMap;

use crate::vm::opcode::{
    idx_idx_from_counter, LitId, Literal, Opcode, OpcodeCounter, Program, ScopeLitMap,
};

/// Conventional first register index; operand bytes below it are literal
/// uids.
pub const MIN_REG: u8 = 128;

/// Register operand helper: `reg(0)` is the first register of the window.
pub const fn reg(n: u8) -> u8 {
    MIN_REG + n
}

/// Key for literal dedup (numbers by bit pattern, so NaN and -0.0 intern
/// cleanly).
#[derive(PartialEq, Eq, Hash)]
enum LitKey {
    Number(u64),
    Ident(String),
}

struct OpenScope {
    start: OpcodeCounter,
    uids: Vec<LitId>,
    by_lit: IndexMap<LitId, u8>,
}

pub struct ProgramBuilder {
    ops: Vec<Opcode>,
    literals: Vec<Literal>,
    lit_index: IndexMap<LitKey, LitId>,
    open: Vec<OpenScope>,
    closed: Vec<ScopeLitMap>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        ProgramBuilder {
            ops: Vec::new(),
            literals: Vec::new(),
            lit_index: IndexMap::new(),
            open: vec![OpenScope {
                start: 0,
                uids: Vec::new(),
                by_lit: IndexMap::new(),
            }],
            closed: Vec::new(),
        }
    }

    /// Append an opcode; returns its counter.
    pub fn emit(&mut self, op: Opcode) -> OpcodeCounter {
        let at = self.ops.len() as OpcodeCounter;
        self.ops.push(op);
        at
    }

    /// Replace a previously emitted record (jump/delta patching).
    pub fn patch(&mut self, at: OpcodeCounter, op: Opcode) {
        self.ops[at as usize] = op;
    }

    /// Counter of the next emitted opcode.
    pub fn here(&self) -> OpcodeCounter {
        self.ops.len() as OpcodeCounter
    }

    /// Forward delta from `from` to `to`, packed as meta data bytes.
    pub fn delta(from: OpcodeCounter, to: OpcodeCounter) -> (u8, u8) {
        idx_idx_from_counter(to - from)
    }

    /// Open a nested uid scope (a function body). Its range starts at the
    /// next opcode.
    pub fn begin_scope(&mut self) {
        self.open.push(OpenScope {
            start: self.here(),
            uids: Vec::new(),
            by_lit: IndexMap::new(),
        });
    }

    /// Close the innermost scope; its range ends before the next opcode.
    pub fn end_scope(&mut self) {
        let scope = self.open.pop().expect("scope underflow");
        assert!(!self.open.is_empty(), "the root scope cannot be closed");
        self.closed.push(ScopeLitMap {
            start: scope.start,
            end: self.here(),
            lit_ids: scope.uids,
        });
    }

    /// uid of an identifier literal in the innermost open scope.
    pub fn ident(&mut self, name: &str) -> u8 {
        let lit = self.intern(LitKey::Ident(name.to_owned()), || {
            Literal::Ident(name.to_owned())
        });
        self.scope_uid(lit)
    }

    /// uid of a number literal in the innermost open scope.
    pub fn number(&mut self, n: f64) -> u8 {
        let lit = self.intern(LitKey::Number(n.to_bits()), || Literal::Number(n));
        self.scope_uid(lit)
    }

    fn intern(&mut self, key: LitKey, make: impl FnOnce() -> Literal) -> LitId {
        if let Some(&id) = self.lit_index.get(&key) {
            return id;
        }
        let id = self.literals.len() as LitId;
        self.literals.push(make());
        self.lit_index.insert(key, id);
        id
    }

    fn scope_uid(&mut self, lit: LitId) -> u8 {
        let scope = self.open.last_mut().expect("a scope is always open");
        if let Some(&uid) = scope.by_lit.get(&lit) {
            return uid;
        }
        let uid = scope.uids.len() as u8;
        assert!(uid < MIN_REG, "scope literal table overflow");
        scope.uids.push(lit);
        scope.by_lit.insert(lit, uid);
        uid
    }

    pub fn finish(mut self) -> Program {
        while self.open.len() > 1 {
            self.end_scope();
        }
        let root = self.open.pop().expect("root scope present");
        let mut scopes = vec![ScopeLitMap {
            start: root.start,
            end: self.ops.len() as OpcodeCounter,
            lit_ids: root.uids,
        }];
        scopes.append(&mut self.closed);

        Program {
            ops: self.ops,
            literals: self.literals,
            scopes,
        }
    }
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}
