//! CLI for running compiled bytecode images.
//!
//! Usage: es5run [--mem-stats] program.bc
//!
//! Exit codes: 0 script success, 1 script failure, 2 unhandled exception,
//! 3 out of memory, 64 usage or invalid image.

use std::env;
use std::fs;
use std::process::ExitCode;

use es5run::{Engine, EngineConfig, EngineError, Program};

fn main() -> ExitCode {
    let mut dump_mem_stats = false;
    let mut path: Option<String> = None;

    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--mem-stats" => dump_mem_stats = true,
            _ if arg.starts_with("--") => {
                eprintln!("unknown option: {}", arg);
                return usage();
            }
            _ if path.is_none() => path = Some(arg),
            _ => return usage(),
        }
    }

    let Some(path) = path else {
        return usage();
    };

    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(error) => {
            eprintln!("{}: {}", path, error);
            return ExitCode::from(64);
        }
    };

    let program = match Program::from_bytes(&bytes) {
        Ok(program) => program,
        Err(error) => {
            eprintln!("{}: {}", path, error);
            return ExitCode::from(64);
        }
    };

    let config = EngineConfig {
        dump_mem_stats,
        ..EngineConfig::default()
    };
    let engine = match Engine::new(program, config) {
        Ok(engine) => engine,
        Err(error) => {
            eprintln!("{}", error);
            return ExitCode::from(3);
        }
    };

    match engine.run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(error @ EngineError::UnhandledException(_)) => {
            eprintln!("{}", error);
            ExitCode::from(2)
        }
        Err(error @ EngineError::OutOfMemory) => {
            eprintln!("{}", error);
            ExitCode::from(3)
        }
        Err(error) => {
            eprintln!("{}", error);
            ExitCode::from(64)
        }
    }
}

fn usage() -> ExitCode {
    eprintln!("usage: es5run [--mem-stats] program.bc");
    ExitCode::from(64)
}
