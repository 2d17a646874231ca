//! ES5.1 bytecode execution core for memory-constrained targets.
//!
//! The crate interprets a fixed-width opcode stream produced by an external
//! compiler, over a full ES5 value/object model (named data and accessor
//! properties, lexical environments, references) and a pooled memory
//! substrate with compressed 16-bit handles and a mark-and-sweep collector.
//!
//! # Example
//!
//! ```
//! use es5run::vm::builder::{reg, ProgramBuilder, MIN_REG};
//! use es5run::vm::{ArgKind, Opcode};
//! use es5run::{Engine, EngineConfig};
//!
//! // var x = 1 + 2; exit(x === 3);
//! let mut b = ProgramBuilder::new();
//! b.emit(Opcode::RegVarDecl { min: MIN_REG, max: reg(3) });
//! b.emit(Opcode::Assignment { dst: reg(0), kind: ArgKind::SmallInt, src: 1 });
//! b.emit(Opcode::Assignment { dst: reg(1), kind: ArgKind::SmallInt, src: 2 });
//! b.emit(Opcode::Addition { dst: reg(2), left: reg(0), right: reg(1) });
//! b.emit(Opcode::Assignment { dst: reg(3), kind: ArgKind::SmallInt, src: 3 });
//! b.emit(Opcode::EqualValueType { dst: reg(2), left: reg(2), right: reg(3) });
//! b.emit(Opcode::IsFalseJmpDown { cond: reg(2), d1: 0, d2: 2 });
//! b.emit(Opcode::Exitval { status: 0 });
//! b.emit(Opcode::Exitval { status: 1 });
//!
//! let engine = Engine::new(b.finish(), EngineConfig::default()).unwrap();
//! assert!(engine.run().unwrap());
//! ```

pub mod compare;
pub mod context;
pub mod conversion;
pub mod env;
pub mod error;
pub mod gc;
pub mod mem;
pub mod object;
pub mod strings;
pub mod value;
pub mod vm;

pub use context::Context;
pub use error::EngineError;
pub use mem::{GcSeverity, MemStats};
pub use value::Value;
pub use vm::builder::ProgramBuilder;
pub use vm::opcode::{Opcode, Program};

/// Engine construction knobs.
pub struct EngineConfig {
    /// Byte-heap size for string payloads.
    pub heap_size: u32,
    /// Trace per-block and per-opcode memory statistics to stderr.
    pub dump_mem_stats: bool,
    /// Nested interpreter entries allowed before RangeError.
    pub max_call_depth: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            heap_size: context::DEFAULT_HEAP_SIZE,
            dump_mem_stats: false,
            max_call_depth: context::DEFAULT_MAX_CALL_DEPTH,
        }
    }
}

/// One execution of one program: construction is `init`, [`Engine::run`]
/// executes and tears down. Every run-wide singleton lives inside, so
/// double-init is unrepresentable.
pub struct Engine {
    ctx: Context,
}

impl Engine {
    /// Bind a validated program image and build the run-wide ECMA
    /// singletons (global object, global environment, built-in registry).
    pub fn new(program: Program, config: EngineConfig) -> Result<Engine, EngineError> {
        let mut ctx = Context::new(program, config.heap_size, config.dump_mem_stats)?;
        ctx.max_call_depth = config.max_call_depth;
        Ok(Engine { ctx })
    }

    /// Execute the program. `Ok(true)` is an exit-success completion (or
    /// running off the end of the image), `Ok(false)` exit-failure; an
    /// uncaught throw or an engine fault is the error.
    pub fn run(mut self) -> Result<bool, EngineError> {
        let result = self.ctx.run_program();
        if self.ctx.dump_mem_stats {
            let stats = self.ctx.mem_stats();
            eprintln!(
                "heap: {} bytes allocated ({} waste), global peak {} ({})",
                stats.heap.allocated_bytes,
                stats.heap.waste_bytes,
                stats.heap.global_peak_allocated_bytes,
                stats.heap.global_peak_waste_bytes,
            );
            eprintln!(
                "pools: {} pages, {} chunks, global peak {} pages {} chunks",
                stats.pools.pools_count,
                stats.pools.allocated_chunks,
                stats.pools.global_peak_pools_count,
                stats.pools.global_peak_allocated_chunks,
            );
        }
        self.ctx.teardown();
        result
    }

    /// Memory statistics snapshot (useful before [`Engine::run`] and in
    /// embedding tests).
    pub fn mem_stats(&self) -> MemStats {
        self.ctx.mem_stats()
    }
}
