//! Jab Compiler CLI
//!
//! Run Jab programs, evaluate expressions, execute textual VM assembly,
//! and generate shell completions.

use std::io;
use std::path::PathBuf;
use std::process;

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{generate, Shell};
use tracing_subscriber::EnvFilter;

use jab_runtime::program::ProgramBuilder;
use jab_runtime::{asm, Vm};
use jabc::{describe_exception, Compiler, JabConfig, JabError};

#[derive(ClapParser)]
#[command(name = "jabc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Jab - poke at binary data", long_about = None)]
struct Cli {
    /// Configuration file (jab.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Dump the final tree of each compile
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a .jab program
    Run {
        /// Input source file
        input: PathBuf,
    },

    /// Evaluate an expression and print its value
    Eval {
        /// Expression text
        #[arg(short, long)]
        expression: String,
    },

    /// Assemble and run a textual VM routine
    Asm {
        /// Input assembly file
        input: PathBuf,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { input } => run_source(&input, cli.config.as_deref(), cli.debug),
        Commands::Eval { expression } => eval(&expression, cli.config.as_deref(), cli.debug),
        Commands::Asm { input } => run_asm(&input),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "jabc", &mut io::stdout());
        }
    }
}

fn setup(config: Option<&std::path::Path>, debug: bool) -> (Vm, Compiler) {
    let mut vm = Vm::new();
    let mut compiler = match Compiler::new(&mut vm, 0) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("jabc: cannot initialize the compiler: {}", e);
            process::exit(1);
        }
    };
    compiler.debug_p = debug;
    if let Some(path) = config {
        match JabConfig::load(path) {
            Ok(cfg) => cfg.apply(&mut vm, &mut compiler),
            Err(e) => {
                eprintln!("jabc: {}", e);
                process::exit(1);
            }
        }
    }
    (vm, compiler)
}

fn run_source(input: &std::path::Path, config: Option<&std::path::Path>, debug: bool) {
    let (mut vm, mut compiler) = setup(config, debug);
    let result = compiler.execute_file(&mut vm, input);
    print!("{}", vm.take_output());
    if debug {
        if let Some(tree) = compiler.last_ast() {
            eprintln!("{}", tree);
        }
    }
    if let Err(e) = result {
        report(&mut vm, e);
    }
}

fn eval(expression: &str, config: Option<&std::path::Path>, debug: bool) {
    let (mut vm, mut compiler) = setup(config, debug);
    match compiler.execute_expression(&mut vm, expression) {
        Ok(v) => {
            print!("{}", vm.take_output());
            match vm.format_value(v) {
                Ok(s) => println!("{}", s),
                Err(_) => println!("<unprintable>"),
            }
        }
        Err(e) => {
            print!("{}", vm.take_output());
            report(&mut vm, e);
        }
    }
}

fn run_asm(input: &std::path::Path) {
    let src = match std::fs::read_to_string(input) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("jabc: cannot read {}: {}", input.display(), e);
            process::exit(1);
        }
    };
    let mut vm = Vm::new();
    let mut b = ProgramBuilder::new();
    if let Err(e) = asm::parse_from_string(&src, &mut b, vm.heap_mut()) {
        eprintln!("jabc: {}", e);
        process::exit(1);
    }
    let program = match vm.make_program(b) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("jabc: {}", e);
            process::exit(1);
        }
    };
    match vm.run(&program) {
        Ok(v) => {
            print!("{}", vm.take_output());
            if !v.is_null() {
                match vm.format_value(v) {
                    Ok(s) => println!("{}", s),
                    Err(_) => {}
                }
            }
        }
        Err(exc) => {
            print!("{}", vm.take_output());
            let msg = describe_exception(&mut vm, exc);
            eprintln!("jabc: {}", msg);
            process::exit(1);
        }
    }
}

fn report(vm: &mut Vm, e: JabError) {
    match e {
        JabError::Compile(e) => eprintln!("jabc: {}", e),
        JabError::Exception(exc) => {
            let msg = describe_exception(vm, exc);
            eprintln!("jabc: {}", msg);
        }
    }
    process::exit(1);
}
