use clap::{Parser, Subcommand};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use rill::compiler::{self, dump};
use rill::config::{DumpTarget, RuntimeConfig};
use rill::debugger;
use rill::vm::Natives;

#[derive(Parser)]
#[command(name = "rill")]
#[command(about = "Compile syntax trees to bytecode and run them on a stack VM", long_about = None)]
struct Cli {
    /// Configuration file (defaults to rill.toml next to the input, if present)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and run a JSON syntax tree
    Run {
        /// The syntax tree to run
        file: PathBuf,

        /// Log every executed instruction to stderr
        #[arg(long)]
        trace: bool,

        /// Profile opcode execution counts
        #[arg(long)]
        profile_opcodes: bool,

        /// Dump bytecode to stderr, or to a file with --dump-bytecode=path
        #[arg(long, value_name = "FILE", num_args = 0..=1)]
        dump_bytecode: Option<Option<PathBuf>>,

        /// Print the final machine status
        #[arg(long)]
        status: bool,

        /// Print the final machine status as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the bytecode listing and symbol tables of a JSON syntax tree
    Dump {
        /// The syntax tree to compile
        file: PathBuf,
    },
    /// Debug a JSON syntax tree with the TUI debugger
    Debug {
        /// The syntax tree to debug
        file: PathBuf,
    },
}

impl Commands {
    fn file(&self) -> &Path {
        match self {
            Commands::Run { file, .. } | Commands::Dump { file } | Commands::Debug { file } => file,
        }
    }
}

fn load_config(explicit: Option<&Path>, input: &Path) -> Result<RuntimeConfig, rill::RunError> {
    let config = match explicit {
        Some(path) => RuntimeConfig::load(path)?,
        None => {
            let dir = input.parent().unwrap_or(Path::new("."));
            RuntimeConfig::discover(dir)?
        }
    };
    Ok(config)
}

fn init_logging(config: &RuntimeConfig) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_filter().into()))
        .with(fmt::layer().with_writer(io::stderr).with_target(false))
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match load_config(cli.config.as_deref(), cli.command.file()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Run {
            file,
            trace,
            profile_opcodes,
            dump_bytecode,
            status,
            json,
        } => {
            config.trace_exec |= trace;
            config.profile_opcodes |= profile_opcodes;
            if let Some(target) = dump_bytecode {
                config.dump_bytecode = Some(match target {
                    Some(path) => DumpTarget::File(path),
                    None => DumpTarget::Stderr(true),
                });
            }
            init_logging(&config);
            run_file(&file, &config, status, json)
        }
        Commands::Dump { file } => {
            init_logging(&config);
            match compiler::compile_file(&file) {
                Ok(compilation) => {
                    print!(
                        "{}",
                        dump::format_with_symbols(&compilation.program, &compilation.symbols)
                    );
                    let unresolved = Natives::standard().unresolved(&compilation.symbols.natives);
                    if !unresolved.is_empty() {
                        println!("== Unresolved ==");
                        for name in unresolved {
                            println!("  {}", name);
                        }
                    }
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("error: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Debug { file } => {
            init_logging(&config);
            if let Err(e) = debugger::run_debugger(&file, &config) {
                eprintln!("error: {}", e);
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
    }
}

fn run_file(path: &Path, config: &RuntimeConfig, show_status: bool, json: bool) -> ExitCode {
    let compilation = match compiler::compile_file(path) {
        Ok(compilation) => compilation,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Some(target) = &config.dump_bytecode
        && let Err(e) = compiler::write_dump(&compilation, target)
    {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }

    let mut vm = compiler::build_vm(compilation, config, Box::new(io::stdout()));
    let result = vm.execute_all();

    if let Some(profile) = vm.format_profile() {
        eprint!("{}", profile);
    }

    if json {
        match serde_json::to_string(&vm.status()) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("error: failed to serialize status: {}", e),
        }
    } else if show_status {
        println!("{}", vm.status());
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: runtime error: {}", e);
            ExitCode::FAILURE
        }
    }
}
