//! Lattice CLI
//!
//! Operates on serialized bytecode chunks (`.latb`): run them, list
//! their instructions, or run their embedded tests. Parsing source text
//! is the host frontend's concern; this binary covers the execution
//! side.

use clap::{Parser, Subcommand};
use lattice_core::chunk::Chunk;
use lattice_runtime::Vm;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "latc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Lattice bytecode tool - run, inspect, and test chunks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a compiled chunk
    Run {
        /// Input .latb chunk file
        input: PathBuf,
    },
    /// Print a chunk's instruction listing
    Disasm {
        /// Input .latb chunk file
        input: PathBuf,
    },
    /// Run every exported `test:` function in a chunk
    Test {
        /// Input .latb chunk file
        input: PathBuf,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { input } => cmd_run(&input),
        Commands::Disasm { input } => cmd_disasm(&input),
        Commands::Test { input } => cmd_test(&input),
    }
}

fn load_chunk(path: &PathBuf) -> Result<Arc<Chunk>, String> {
    let bytes =
        std::fs::read(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    Chunk::from_bytes(&bytes)
        .map(Arc::new)
        .map_err(|e| format!("{}: {}", path.display(), e))
}

fn cmd_run(input: &PathBuf) -> ExitCode {
    let chunk = match load_chunk(input) {
        Ok(chunk) => chunk,
        Err(msg) => {
            eprintln!("error: {}", msg);
            return ExitCode::from(2);
        }
    };
    let mut vm = Vm::new();
    match vm.run_chunk(chunk) {
        Ok(result) => {
            use lattice_core::value::ValueKind;
            match result.kind {
                // An int result becomes the exit code, shell style.
                ValueKind::Int(n) => ExitCode::from((n & 0xff) as u8),
                ValueKind::Unit | ValueKind::Nil => ExitCode::SUCCESS,
                _ => {
                    println!("{}", result);
                    ExitCode::SUCCESS
                }
            }
        }
        Err(err) => {
            eprintln!("runtime error: {}", err);
            ExitCode::from(70)
        }
    }
}

fn cmd_disasm(input: &PathBuf) -> ExitCode {
    match load_chunk(input) {
        Ok(chunk) => {
            let label = chunk.name.clone().unwrap_or_else(|| "chunk".to_string());
            print!("{}", chunk.disassemble(&label));
            ExitCode::SUCCESS
        }
        Err(msg) => {
            eprintln!("error: {}", msg);
            ExitCode::from(2)
        }
    }
}

fn cmd_test(input: &PathBuf) -> ExitCode {
    let chunk = match load_chunk(input) {
        Ok(chunk) => chunk,
        Err(msg) => {
            eprintln!("error: {}", msg);
            return ExitCode::from(2);
        }
    };
    let tests: Vec<String> = chunk
        .export_names
        .iter()
        .filter(|name| name.starts_with("test:"))
        .cloned()
        .collect();
    if tests.is_empty() {
        println!("no tests in {}", input.display());
        return ExitCode::SUCCESS;
    }

    let mut vm = Vm::new();
    // Define the test functions (and everything else at top level).
    if let Err(err) = vm.run_chunk(chunk) {
        eprintln!("setup error: {}", err);
        return ExitCode::from(70);
    }

    let mut failed = 0usize;
    for name in &tests {
        let callee = match vm.globals().lookup(name) {
            Some(v) => v,
            None => {
                println!("FAIL {} (not defined)", name);
                failed += 1;
                continue;
            }
        };
        match vm.call_value_with(&callee, Vec::new()) {
            Ok(_) => println!("ok   {}", &name["test:".len()..]),
            Err(err) => {
                println!("FAIL {}: {}", &name["test:".len()..], err);
                failed += 1;
            }
        }
    }
    println!("{} test(s), {} failed", tests.len(), failed);
    if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
