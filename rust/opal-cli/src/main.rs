//! Opal CLI — load, inspect and run compiled Opal modules.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser as ClapParser, Subcommand};

use opal_core::code::{Constant, Module, Opcode};
use opal_vm::{Engine, EngineConfig};

mod colors;

#[derive(ClapParser)]
#[command(
    name = "opal",
    version,
    about = "The Opal execution engine",
    help_template = "\
{before-help}{name} {version}
{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}

Examples:
  opal run module.json         Run a compiled module
  opal run module.json --entry setup
  opal check module.json       Validate without running
  opal disasm module.json      List the bytecode
"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a compiled module
    Run {
        /// Path to the module (JSON)
        file: PathBuf,
        /// Entry function name, overriding the module's entry point
        #[arg(long)]
        entry: Option<String>,
        /// Abort after this many instructions
        #[arg(long)]
        instruction_limit: Option<u64>,
        /// Print the entry function's return value
        #[arg(long)]
        print_result: bool,
    },
    /// Load and validate a module without running it
    Check {
        /// Path to the module (JSON)
        file: PathBuf,
    },
    /// Print a module's constants, switch tables and bytecode
    Disasm {
        /// Path to the module (JSON)
        file: PathBuf,
    },
    /// List the built-in native operations
    Natives,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run {
            file,
            entry,
            instruction_limit,
            print_result,
        } => cmd_run(&file, entry.as_deref(), instruction_limit, print_result),
        Commands::Check { file } => cmd_check(&file),
        Commands::Disasm { file } => cmd_disasm(&file),
        Commands::Natives => cmd_natives(),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {}", colors::red("error:"), err);
            ExitCode::FAILURE
        }
    }
}

fn read_module(path: &Path) -> Result<Module, String> {
    let text = fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    serde_json::from_str(&text).map_err(|e| format!("{}: {}", path.display(), e))
}

fn cmd_run(
    path: &Path,
    entry: Option<&str>,
    instruction_limit: Option<u64>,
    print_result: bool,
) -> Result<(), String> {
    let module = read_module(path)?;
    let mut engine = Engine::new(EngineConfig {
        instruction_limit,
        ..EngineConfig::default()
    });
    engine
        .load(module)
        .map_err(|e| format!("{}: {}", path.display(), e))?;
    let result = engine.run_entry(entry);
    for line in &engine.output {
        print!("{}", line);
    }
    match result {
        Ok(value) => {
            if print_result {
                println!("{}", colors::gray(&format!("=> {:?}", value)));
            }
            Ok(())
        }
        Err(err) => Err(format!("{}", err)),
    }
}

fn cmd_check(path: &Path) -> Result<(), String> {
    let module = read_module(path)?;
    let programs = module.programs.len();
    let functions: usize = module.programs.iter().map(|p| p.functions.len()).sum();
    Engine::default()
        .load(module)
        .map_err(|e| format!("{}: {}", path.display(), e))?;
    println!(
        "{} {} ({} programs, {} functions)",
        colors::green("ok:"),
        path.display(),
        programs,
        functions
    );
    Ok(())
}

fn cmd_disasm(path: &Path) -> Result<(), String> {
    let module = read_module(path)?;
    if !module.constants.is_empty() {
        println!("{}", colors::bold("constants:"));
        for (i, c) in module.constants.iter().enumerate() {
            println!("  {:4}  {}", i, format_constant(c));
        }
    }
    for (i, table) in module.switch_tables.iter().enumerate() {
        println!(
            "{} cases=#{} targets={:?}",
            colors::bold(&format!("switch table {}:", i)),
            table.cases,
            table.table
        );
    }
    for (pi, program) in module.programs.iter().enumerate() {
        println!(
            "{} ({} variables)",
            colors::bold(&format!("program {} \"{}\"", pi, program.name)),
            program.num_vars
        );
        for (fi, fun) in program.functions.iter().enumerate() {
            let variadic = if fun.variadic { ", variadic" } else { "" };
            println!(
                "  function {} \"{}\" ({} args, {} locals{})",
                fi, fun.name, fun.num_args, fun.num_locals, variadic
            );
            for (pc, insn) in fun.code.iter().enumerate() {
                if has_operand(insn.op) {
                    println!("    {:4}  {:<18} {}", pc, format!("{:?}", insn.op), insn.a);
                } else {
                    println!("    {:4}  {:?}", pc, insn.op);
                }
            }
        }
    }
    Ok(())
}

fn cmd_natives() -> Result<(), String> {
    let registry = opal_vm::natives::default_registry();
    for name in registry.names() {
        if let Some(op) = registry.lookup(name) {
            println!("{:<12} {}", name, colors::gray(op.signature));
        }
    }
    Ok(())
}

fn format_constant(c: &Constant) -> String {
    match c {
        Constant::Int(n) => format!("{}", n),
        Constant::Float(x) => format!("{}", x),
        Constant::Str(s) => format!("{:?}", s),
        Constant::Array(items) => {
            let inner: Vec<String> = items.iter().map(format_constant).collect();
            format!("({{ {} }})", inner.join(", "))
        }
    }
}

fn has_operand(op: Opcode) -> bool {
    !matches!(
        op,
        Opcode::Nop
            | Opcode::Pop
            | Opcode::Dup
            | Opcode::Swap
            | Opcode::Mark
            | Opcode::Index
            | Opcode::LvalIndex
            | Opcode::Assign
            | Opcode::AssignPop
            | Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Neg
            | Opcode::Not
            | Opcode::BitAnd
            | Opcode::BitOr
            | Opcode::BitXor
            | Opcode::Lt
            | Opcode::Le
            | Opcode::Gt
            | Opcode::Ge
            | Opcode::Eq
            | Opcode::Ne
            | Opcode::Identical
            | Opcode::CallValue
            | Opcode::Return
            | Opcode::CatchEnd
            | Opcode::Throw
    )
}
