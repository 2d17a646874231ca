//! Bytecode: fixed-width opcode records, the literal table and the image
//! format.
//!
//! Every opcode occupies exactly four bytes: a one-byte op index and up to
//! three one-byte fields. Field bytes below `MIN_REG` name literals through
//! the per-scope uid maps; bytes at or above it name registers of the
//! current frame window. Structural markers (argument carriers, block
//! delimiters) are `meta` opcodes that the dispatch protocol consumes; they
//! are never executed as ordinary instructions.

use crate::error::EngineError;

/// Field value meaning "absent" (e.g. anonymous function expression name).
pub const INVALID_IDX: u8 = 0xFF;

/// Opcode counter: index into the opcode vector.
pub type OpcodeCounter = u16;

/// Structural marker kinds carried by the `meta` opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MetaType {
    /// Argument of a preceding variable-arity opcode; data1 names the value.
    Varg = 0,
    /// Object-literal data property: data1 name, data2 value.
    VargPropData = 1,
    /// Object-literal getter: data1 name, data2 function.
    VargPropGetter = 2,
    /// Object-literal setter: data1 name, data2 function.
    VargPropSetter = 3,
    /// Explicit `this` for a method call; data1 names the value.
    ThisArg = 4,
    /// End of a function body; data1/data2 pack the 16-bit counter delta.
    FunctionEnd = 5,
    /// The scope is strict code. Informational at runtime: strictness is a
    /// compile-time decision surfaced to `run_from_pos`.
    StrictCode = 6,
    EndWith = 7,
    EndForIn = 8,
    /// Start of a catch block; data1/data2 pack the delta to its end.
    Catch = 9,
    /// data1 names the catch binding identifier literal.
    CatchExceptionIdentifier = 10,
    /// Start of a finally block; data1/data2 pack the delta to its end.
    Finally = 11,
    EndTryCatchFinally = 12,
}

impl MetaType {
    pub fn decode(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => MetaType::Varg,
            1 => MetaType::VargPropData,
            2 => MetaType::VargPropGetter,
            3 => MetaType::VargPropSetter,
            4 => MetaType::ThisArg,
            5 => MetaType::FunctionEnd,
            6 => MetaType::StrictCode,
            7 => MetaType::EndWith,
            8 => MetaType::EndForIn,
            9 => MetaType::Catch,
            10 => MetaType::CatchExceptionIdentifier,
            11 => MetaType::Finally,
            12 => MetaType::EndTryCatchFinally,
            _ => return None,
        })
    }
}

/// Immediate-kind selector of the `assignment` opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ArgKind {
    Simple = 0,
    StringLit = 1,
    Variable = 2,
    NumberLit = 3,
    NumberLitNegate = 4,
    SmallInt = 5,
    SmallIntNegate = 6,
}

impl ArgKind {
    pub fn decode(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => ArgKind::Simple,
            1 => ArgKind::StringLit,
            2 => ArgKind::Variable,
            3 => ArgKind::NumberLit,
            4 => ArgKind::NumberLitNegate,
            5 => ArgKind::SmallInt,
            6 => ArgKind::SmallIntNegate,
            _ => return None,
        })
    }
}

/// One four-byte instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Opcode {
    Nop,
    /// dst = immediate (kind selects how src is interpreted).
    Assignment { dst: u8, kind: ArgKind, src: u8 },
    PreIncr { dst: u8, var: u8 },
    PreDecr { dst: u8, var: u8 },
    PostIncr { dst: u8, var: u8 },
    PostDecr { dst: u8, var: u8 },
    Addition { dst: u8, left: u8, right: u8 },
    Substraction { dst: u8, left: u8, right: u8 },
    Multiplication { dst: u8, left: u8, right: u8 },
    Division { dst: u8, left: u8, right: u8 },
    Remainder { dst: u8, left: u8, right: u8 },
    UnaryMinus { dst: u8, var: u8 },
    UnaryPlus { dst: u8, var: u8 },
    BOr { dst: u8, left: u8, right: u8 },
    BXor { dst: u8, left: u8, right: u8 },
    BAnd { dst: u8, left: u8, right: u8 },
    BShiftLeft { dst: u8, left: u8, right: u8 },
    BShiftRight { dst: u8, left: u8, right: u8 },
    BShiftURight { dst: u8, left: u8, right: u8 },
    BNot { dst: u8, var: u8 },
    LogicalNot { dst: u8, var: u8 },
    EqualValue { dst: u8, left: u8, right: u8 },
    NotEqualValue { dst: u8, left: u8, right: u8 },
    EqualValueType { dst: u8, left: u8, right: u8 },
    NotEqualValueType { dst: u8, left: u8, right: u8 },
    LessThan { dst: u8, left: u8, right: u8 },
    GreaterThan { dst: u8, left: u8, right: u8 },
    LessOrEqualThan { dst: u8, left: u8, right: u8 },
    GreaterOrEqualThan { dst: u8, left: u8, right: u8 },
    Instanceof { dst: u8, left: u8, right: u8 },
    In { dst: u8, left: u8, right: u8 },
    /// Declaration binding instantiation for one `var` name.
    VarDecl { name: u8 },
    /// Frame prologue: reserve the register window [min, max].
    RegVarDecl { min: u8, max: u8 },
    This { lhs: u8 },
    PropGetter { lhs: u8, obj: u8, prop: u8 },
    PropSetter { obj: u8, prop: u8, rhs: u8 },
    CallN { lhs: u8, func: u8, argc: u8 },
    ConstructN { lhs: u8, func: u8, argc: u8 },
    FuncDeclN { name: u8, argc: u8 },
    FuncExprN { lhs: u8, name: u8, argc: u8 },
    ArrayDecl { lhs: u8, argc: u8 },
    ObjDecl { lhs: u8, propc: u8 },
    DeleteVar { lhs: u8, name: u8 },
    DeleteProp { lhs: u8, base: u8, name: u8 },
    Typeof { lhs: u8, var: u8 },
    With { expr: u8 },
    /// Enumerate expr's property names into dst, body up to `end_for_in`.
    ForIn { dst: u8, expr: u8 },
    /// data bytes pack the delta to the first marker after the try body.
    TryBlock { d1: u8, d2: u8 },
    Throw { var: u8 },
    JmpDown { d1: u8, d2: u8 },
    JmpUp { d1: u8, d2: u8 },
    IsTrueJmpDown { cond: u8, d1: u8, d2: u8 },
    IsFalseJmpDown { cond: u8, d1: u8, d2: u8 },
    IsTrueJmpUp { cond: u8, d1: u8, d2: u8 },
    IsFalseJmpUp { cond: u8, d1: u8, d2: u8 },
    Ret,
    RetVal { var: u8 },
    Exitval { status: u8 },
    Meta { meta_type: MetaType, d1: u8, d2: u8 },
}

impl Opcode {
    /// Encode into the fixed four-byte record.
    pub fn encode(self) -> [u8; 4] {
        use Opcode::*;
        match self {
            Nop => [0, 0, 0, 0],
            Assignment { dst, kind, src } => [1, dst, kind as u8, src],
            PreIncr { dst, var } => [2, dst, var, 0],
            PreDecr { dst, var } => [3, dst, var, 0],
            PostIncr { dst, var } => [4, dst, var, 0],
            PostDecr { dst, var } => [5, dst, var, 0],
            Addition { dst, left, right } => [6, dst, left, right],
            Substraction { dst, left, right } => [7, dst, left, right],
            Multiplication { dst, left, right } => [8, dst, left, right],
            Division { dst, left, right } => [9, dst, left, right],
            Remainder { dst, left, right } => [10, dst, left, right],
            UnaryMinus { dst, var } => [11, dst, var, 0],
            UnaryPlus { dst, var } => [12, dst, var, 0],
            BOr { dst, left, right } => [13, dst, left, right],
            BXor { dst, left, right } => [14, dst, left, right],
            BAnd { dst, left, right } => [15, dst, left, right],
            BShiftLeft { dst, left, right } => [16, dst, left, right],
            BShiftRight { dst, left, right } => [17, dst, left, right],
            BShiftURight { dst, left, right } => [18, dst, left, right],
            BNot { dst, var } => [19, dst, var, 0],
            LogicalNot { dst, var } => [20, dst, var, 0],
            EqualValue { dst, left, right } => [21, dst, left, right],
            NotEqualValue { dst, left, right } => [22, dst, left, right],
            EqualValueType { dst, left, right } => [23, dst, left, right],
            NotEqualValueType { dst, left, right } => [24, dst, left, right],
            LessThan { dst, left, right } => [25, dst, left, right],
            GreaterThan { dst, left, right } => [26, dst, left, right],
            LessOrEqualThan { dst, left, right } => [27, dst, left, right],
            GreaterOrEqualThan { dst, left, right } => [28, dst, left, right],
            Instanceof { dst, left, right } => [29, dst, left, right],
            In { dst, left, right } => [30, dst, left, right],
            VarDecl { name } => [31, name, 0, 0],
            RegVarDecl { min, max } => [32, min, max, 0],
            This { lhs } => [33, lhs, 0, 0],
            PropGetter { lhs, obj, prop } => [34, lhs, obj, prop],
            PropSetter { obj, prop, rhs } => [35, obj, prop, rhs],
            CallN { lhs, func, argc } => [36, lhs, func, argc],
            ConstructN { lhs, func, argc } => [37, lhs, func, argc],
            FuncDeclN { name, argc } => [38, name, argc, 0],
            FuncExprN { lhs, name, argc } => [39, lhs, name, argc],
            ArrayDecl { lhs, argc } => [40, lhs, argc, 0],
            ObjDecl { lhs, propc } => [41, lhs, propc, 0],
            DeleteVar { lhs, name } => [42, lhs, name, 0],
            DeleteProp { lhs, base, name } => [43, lhs, base, name],
            Typeof { lhs, var } => [44, lhs, var, 0],
            With { expr } => [45, expr, 0, 0],
            ForIn { dst, expr } => [46, dst, expr, 0],
            TryBlock { d1, d2 } => [47, d1, d2, 0],
            Throw { var } => [48, var, 0, 0],
            JmpDown { d1, d2 } => [49, d1, d2, 0],
            JmpUp { d1, d2 } => [50, d1, d2, 0],
            IsTrueJmpDown { cond, d1, d2 } => [51, cond, d1, d2],
            IsFalseJmpDown { cond, d1, d2 } => [52, cond, d1, d2],
            IsTrueJmpUp { cond, d1, d2 } => [53, cond, d1, d2],
            IsFalseJmpUp { cond, d1, d2 } => [54, cond, d1, d2],
            Ret => [55, 0, 0, 0],
            RetVal { var } => [56, var, 0, 0],
            Exitval { status } => [57, status, 0, 0],
            Meta { meta_type, d1, d2 } => [58, meta_type as u8, d1, d2],
        }
    }

    /// Decode a four-byte record. `None` on an unknown op index or field.
    pub fn decode(raw: [u8; 4]) -> Option<Opcode> {
        use Opcode::*;
        let [op, a, b, c] = raw;
        Some(match op {
            0 => Nop,
            1 => Assignment { dst: a, kind: ArgKind::decode(b)?, src: c },
            2 => PreIncr { dst: a, var: b },
            3 => PreDecr { dst: a, var: b },
            4 => PostIncr { dst: a, var: b },
            5 => PostDecr { dst: a, var: b },
            6 => Addition { dst: a, left: b, right: c },
            7 => Substraction { dst: a, left: b, right: c },
            8 => Multiplication { dst: a, left: b, right: c },
            9 => Division { dst: a, left: b, right: c },
            10 => Remainder { dst: a, left: b, right: c },
            11 => UnaryMinus { dst: a, var: b },
            12 => UnaryPlus { dst: a, var: b },
            13 => BOr { dst: a, left: b, right: c },
            14 => BXor { dst: a, left: b, right: c },
            15 => BAnd { dst: a, left: b, right: c },
            16 => BShiftLeft { dst: a, left: b, right: c },
            17 => BShiftRight { dst: a, left: b, right: c },
            18 => BShiftURight { dst: a, left: b, right: c },
            19 => BNot { dst: a, var: b },
            20 => LogicalNot { dst: a, var: b },
            21 => EqualValue { dst: a, left: b, right: c },
            22 => NotEqualValue { dst: a, left: b, right: c },
            23 => EqualValueType { dst: a, left: b, right: c },
            24 => NotEqualValueType { dst: a, left: b, right: c },
            25 => LessThan { dst: a, left: b, right: c },
            26 => GreaterThan { dst: a, left: b, right: c },
            27 => LessOrEqualThan { dst: a, left: b, right: c },
            28 => GreaterOrEqualThan { dst: a, left: b, right: c },
            29 => Instanceof { dst: a, left: b, right: c },
            30 => In { dst: a, left: b, right: c },
            31 => VarDecl { name: a },
            32 => RegVarDecl { min: a, max: b },
            33 => This { lhs: a },
            34 => PropGetter { lhs: a, obj: b, prop: c },
            35 => PropSetter { obj: a, prop: b, rhs: c },
            36 => CallN { lhs: a, func: b, argc: c },
            37 => ConstructN { lhs: a, func: b, argc: c },
            38 => FuncDeclN { name: a, argc: b },
            39 => FuncExprN { lhs: a, name: b, argc: c },
            40 => ArrayDecl { lhs: a, argc: b },
            41 => ObjDecl { lhs: a, propc: b },
            42 => DeleteVar { lhs: a, name: b },
            43 => DeleteProp { lhs: a, base: b, name: c },
            44 => Typeof { lhs: a, var: b },
            45 => With { expr: a },
            46 => ForIn { dst: a, expr: b },
            47 => TryBlock { d1: a, d2: b },
            48 => Throw { var: a },
            49 => JmpDown { d1: a, d2: b },
            50 => JmpUp { d1: a, d2: b },
            51 => IsTrueJmpDown { cond: a, d1: b, d2: c },
            52 => IsFalseJmpDown { cond: a, d1: b, d2: c },
            53 => IsTrueJmpUp { cond: a, d1: b, d2: c },
            54 => IsFalseJmpUp { cond: a, d1: b, d2: c },
            55 => Ret,
            56 => RetVal { var: a },
            57 => Exitval { status: a },
            58 => Meta { meta_type: MetaType::decode(a)?, d1: b, d2: c },
            _ => return None,
        })
    }

    /// Handler name for the mem-stats tracer.
    pub fn name(&self) -> &'static str {
        use Opcode::*;
        match self {
            Nop => "nop",
            Assignment { .. } => "assignment",
            PreIncr { .. } => "pre_incr",
            PreDecr { .. } => "pre_decr",
            PostIncr { .. } => "post_incr",
            PostDecr { .. } => "post_decr",
            Addition { .. } => "addition",
            Substraction { .. } => "substraction",
            Multiplication { .. } => "multiplication",
            Division { .. } => "division",
            Remainder { .. } => "remainder",
            UnaryMinus { .. } => "unary_minus",
            UnaryPlus { .. } => "unary_plus",
            BOr { .. } => "b_or",
            BXor { .. } => "b_xor",
            BAnd { .. } => "b_and",
            BShiftLeft { .. } => "b_shift_left",
            BShiftRight { .. } => "b_shift_right",
            BShiftURight { .. } => "b_shift_uright",
            BNot { .. } => "b_not",
            LogicalNot { .. } => "logical_not",
            EqualValue { .. } => "equal_value",
            NotEqualValue { .. } => "not_equal_value",
            EqualValueType { .. } => "equal_value_type",
            NotEqualValueType { .. } => "not_equal_value_type",
            LessThan { .. } => "less_than",
            GreaterThan { .. } => "greater_than",
            LessOrEqualThan { .. } => "less_or_equal_than",
            GreaterOrEqualThan { .. } => "greater_or_equal_than",
            Instanceof { .. } => "instanceof",
            In { .. } => "in",
            VarDecl { .. } => "var_decl",
            RegVarDecl { .. } => "reg_var_decl",
            This { .. } => "this_binding",
            PropGetter { .. } => "prop_getter",
            PropSetter { .. } => "prop_setter",
            CallN { .. } => "call_n",
            ConstructN { .. } => "construct_n",
            FuncDeclN { .. } => "func_decl_n",
            FuncExprN { .. } => "func_expr_n",
            ArrayDecl { .. } => "array_decl",
            ObjDecl { .. } => "obj_decl",
            DeleteVar { .. } => "delete_var",
            DeleteProp { .. } => "delete_prop",
            Typeof { .. } => "typeof",
            With { .. } => "with",
            ForIn { .. } => "for_in",
            TryBlock { .. } => "try_block",
            Throw { .. } => "throw_value",
            JmpDown { .. } => "jmp_down",
            JmpUp { .. } => "jmp_up",
            IsTrueJmpDown { .. } => "is_true_jmp_down",
            IsFalseJmpDown { .. } => "is_false_jmp_down",
            IsTrueJmpUp { .. } => "is_true_jmp_up",
            IsFalseJmpUp { .. } => "is_false_jmp_up",
            Ret => "ret",
            RetVal { .. } => "retval",
            Exitval { .. } => "exitval",
            Meta { .. } => "meta",
        }
    }
}

/// Combine a meta opcode's two data bytes into a 16-bit opcode counter.
#[inline]
pub fn counter_from_idx_idx(d1: u8, d2: u8) -> OpcodeCounter {
    ((d1 as u16) << 8) | d2 as u16
}

/// Split a 16-bit opcode counter into meta data bytes.
#[inline]
pub fn idx_idx_from_counter(counter: OpcodeCounter) -> (u8, u8) {
    ((counter >> 8) as u8, counter as u8)
}

// ============================================================================
// Literal table
// ============================================================================

/// An entry of the literal table.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(f64),
    Ident(String),
}

/// Global literal id.
pub type LitId = u16;

/// Mapping from opcode-field uids to global literal ids, valid for the
/// opcode range `[start, end)`. Scopes nest; the innermost one wins.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeLitMap {
    pub start: OpcodeCounter,
    pub end: OpcodeCounter,
    pub lit_ids: Vec<LitId>,
}

/// An executable bytecode image: the opcode vector plus literals.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub ops: Vec<Opcode>,
    pub literals: Vec<Literal>,
    pub scopes: Vec<ScopeLitMap>,
}

impl Program {
    /// Opcode at `counter`; `None` past the end.
    #[inline]
    pub fn opcode(&self, counter: OpcodeCounter) -> Option<Opcode> {
        self.ops.get(counter as usize).copied()
    }

    /// Resolve an opcode-field uid against the innermost scope containing
    /// `at`.
    pub fn lit_id_for_uid(&self, uid: u8, at: OpcodeCounter) -> Option<LitId> {
        self.scopes
            .iter()
            .filter(|scope| scope.start <= at && at < scope.end)
            .min_by_key(|scope| scope.end - scope.start)
            .and_then(|scope| scope.lit_ids.get(uid as usize).copied())
    }

    pub fn literal(&self, id: LitId) -> Option<&Literal> {
        self.literals.get(id as usize)
    }

    /// Structural checks on load: the program must start with an optional
    /// strict marker followed by a register window prologue, and every
    /// record must have decoded (callers decode before constructing).
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.ops.len() > OpcodeCounter::MAX as usize {
            return Err(EngineError::invalid_image("program too long"));
        }
        let mut at = 0;
        if let Some(Opcode::Meta { meta_type: MetaType::StrictCode, .. }) = self.opcode(0) {
            at = 1;
        }
        match self.opcode(at) {
            Some(Opcode::RegVarDecl { min, max }) if max >= min => Ok(()),
            _ => Err(EngineError::invalid_image(
                "program must begin with reg_var_decl",
            )),
        }
    }

    // ------------------------------------------------------------------
    // Image serialization
    // ------------------------------------------------------------------

    const MAGIC: &'static [u8; 4] = b"E5BC";
    const VERSION: u8 = 1;

    /// Serialize to the persisted image format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(Self::MAGIC);
        out.push(Self::VERSION);
        out.extend_from_slice(&(self.ops.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.literals.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.scopes.len() as u32).to_le_bytes());

        for op in &self.ops {
            out.extend_from_slice(&op.encode());
        }
        for lit in &self.literals {
            match lit {
                Literal::Number(n) => {
                    out.push(0);
                    out.extend_from_slice(&n.to_le_bytes());
                }
                Literal::Ident(name) => {
                    out.push(1);
                    out.extend_from_slice(&(name.len() as u16).to_le_bytes());
                    out.extend_from_slice(name.as_bytes());
                }
            }
        }
        for scope in &self.scopes {
            out.extend_from_slice(&scope.start.to_le_bytes());
            out.extend_from_slice(&scope.end.to_le_bytes());
            out.extend_from_slice(&(scope.lit_ids.len() as u16).to_le_bytes());
            for id in &scope.lit_ids {
                out.extend_from_slice(&id.to_le_bytes());
            }
        }
        out
    }

    /// Deserialize a persisted image. Round-trips with
    /// [`to_bytes`](Program::to_bytes) exactly.
    pub fn from_bytes(bytes: &[u8]) -> Result<Program, EngineError> {
        let mut r = Reader::new(bytes);
        if r.take(4)? != Self::MAGIC {
            return Err(EngineError::invalid_image("bad magic"));
        }
        if r.u8()? != Self::VERSION {
            return Err(EngineError::invalid_image("unsupported version"));
        }
        let op_count = r.u32()? as usize;
        let lit_count = r.u32()? as usize;
        let scope_count = r.u32()? as usize;

        let mut ops = Vec::with_capacity(op_count.min(1 << 16));
        for _ in 0..op_count {
            let raw: [u8; 4] = r.take(4)?.try_into().expect("length checked");
            let op = Opcode::decode(raw)
                .ok_or_else(|| EngineError::invalid_image("unknown opcode"))?;
            ops.push(op);
        }

        let mut literals = Vec::with_capacity(lit_count.min(1 << 16));
        for _ in 0..lit_count {
            match r.u8()? {
                0 => literals.push(Literal::Number(f64::from_le_bytes(
                    r.take(8)?.try_into().expect("length checked"),
                ))),
                1 => {
                    let len = r.u16()? as usize;
                    let text = std::str::from_utf8(r.take(len)?)
                        .map_err(|_| EngineError::invalid_image("identifier not utf-8"))?;
                    literals.push(Literal::Ident(text.to_owned()));
                }
                _ => return Err(EngineError::invalid_image("unknown literal tag")),
            }
        }

        let mut scopes = Vec::with_capacity(scope_count.min(1 << 12));
        for _ in 0..scope_count {
            let start = r.u16()?;
            let end = r.u16()?;
            let n = r.u16()? as usize;
            let mut lit_ids = Vec::with_capacity(n.min(256));
            for _ in 0..n {
                lit_ids.push(r.u16()?);
            }
            scopes.push(ScopeLitMap { start, end, lit_ids });
        }

        let program = Program { ops, literals, scopes };
        program.validate()?;
        Ok(program)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, at: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], EngineError> {
        let end = self
            .at
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| EngineError::invalid_image("truncated image"))?;
        let slice = &self.bytes[self.at..end];
        self.at = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, EngineError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, EngineError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().expect("length checked")))
    }

    fn u32(&mut self) -> Result<u32, EngineError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("length checked")))
    }
}
