use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process;

use clap::Parser;
use rslox::{InterpretError, Vm, VmConfig};
use tracing_subscriber::EnvFilter;

// Exit codes from sysexits.h
const EX_USAGE: i32 = 64;
const EX_DATAERR: i32 = 65;
const EX_SOFTWARE: i32 = 70;
const EX_IOERR: i32 = 74;

#[derive(Parser)]
#[command(name = "rslox")]
#[command(about = "Lox bytecode interpreter. Starts a REPL when no script is given.", long_about = None)]
struct Cli {
    /// Script to run
    #[arg(num_args = 0..)]
    scripts: Vec<PathBuf>,

    /// Run the garbage collector before every allocation
    #[arg(long)]
    stress_gc: bool,

    /// Log the bytecode of every compiled function
    #[arg(long)]
    print_code: bool,
}

fn main() {
    let cli = Cli::parse();

    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    if cli.print_code {
        if let Ok(directive) = "rslox::compiler=debug".parse() {
            filter = filter.add_directive(directive);
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = if cli.stress_gc {
        VmConfig::stress_gc()
    } else {
        VmConfig::default()
    };
    config.print_code |= cli.print_code;
    let mut vm = Vm::with_config(config);

    let code = match cli.scripts.as_slice() {
        [] => repl(&mut vm),
        [path] => run_file(&mut vm, path),
        _ => {
            eprintln!("Usage: rslox [path]");
            EX_USAGE
        }
    };
    process::exit(code);
}

fn repl(vm: &mut Vm) -> i32 {
    let stdin = std::io::stdin();
    let mut stdin = stdin.lock();
    let stdout = std::io::stdout();
    let mut line = String::new();
    loop {
        print!("> ");
        if let Err(e) = stdout.lock().flush() {
            eprintln!("{}", e);
            return EX_IOERR;
        }
        line.clear();
        match stdin.read_line(&mut line) {
            Ok(0) => {
                println!();
                return 0;
            }
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}", e);
                return EX_IOERR;
            }
        }
        if let Err(e) = vm.interpret(&line, &mut stdout.lock()) {
            eprintln!("{}", e);
        }
    }
}

fn run_file(vm: &mut Vm, path: &Path) -> i32 {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Could not read file \"{}\": {}", path.display(), e);
            return EX_IOERR;
        }
    };
    let stdout = std::io::stdout();
    match vm.interpret(&source, &mut stdout.lock()) {
        Ok(()) => 0,
        Err(e @ InterpretError::Compile(_)) => {
            eprintln!("{}", e);
            EX_DATAERR
        }
        Err(e @ InterpretError::Runtime(_)) => {
            eprintln!("{}", e);
            EX_SOFTWARE
        }
    }
}
