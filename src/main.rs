use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process;

use clap::error::ErrorKind;
use clap::Parser;

use rook::vm::{InterpretResult, VM};

#[derive(Parser)]
#[command(name = "rook", version)]
#[command(about = "The Rook bytecode interpreter", long_about = None)]
struct Cli {
    /// Script to run; omit it for an interactive session.
    script: Option<PathBuf>,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 64,
            };
            let _ = err.print();
            process::exit(code);
        }
    };

    let mut vm = VM::new();
    match cli.script {
        Some(path) => run_file(&mut vm, &path),
        None => repl(&mut vm),
    }
}

fn run_file(vm: &mut VM, path: &Path) {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not open file \"{}\": {}.", path.display(), err);
            process::exit(74);
        }
    };

    match vm.interpret(&source) {
        InterpretResult::Ok => {}
        InterpretResult::CompileError => process::exit(65),
        InterpretResult::RuntimeError => process::exit(70),
    }
}

fn repl(vm: &mut VM) {
    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush().expect("failed to flush stdout");

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => {
                println!();
                break;
            }
            Ok(_) => {
                // Errors are already reported; the session keeps going.
                let _ = vm.interpret(&line);
            }
            Err(err) => {
                eprintln!("Could not read input: {}.", err);
                break;
            }
        }
    }
}
