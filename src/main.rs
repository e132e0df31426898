mod chunk;
mod compiler;
mod natives;
mod object;
mod reporter;
mod table;
mod token;
mod tokenizer;
mod value;
mod vm;

use reporter::CliReporter;
use rustyline::Editor;
use std::{env, fs, process};
use vm::{InterpretError, Vm};

fn main() {
    let args: Vec<String> = env::args().collect();
    match args.len() {
        1 => repl(),
        2 => run_file(&args[1]),
        _ => {
            eprintln!("Usage: dusk [path]");
            process::exit(exitcode::USAGE);
        }
    }
}

fn repl() {
    let mut vm = Vm::new();
    let mut reporter = CliReporter::new();
    let mut rl = Editor::<()>::new();
    loop {
        match rl.readline("> ") {
            Ok(line) => {
                rl.add_history_entry(&line);
                vm.interpret(&line, &mut reporter).ok();
            }
            Err(_) => break,
        }
    }
}

fn run_file(path: &str) {
    let source = fs::read_to_string(path).unwrap_or_else(|err| {
        eprintln!("Could not read \"{}\": {}", path, err);
        process::exit(exitcode::IOERR);
    });

    let mut vm = Vm::new();
    let mut reporter = CliReporter::new();
    match vm.interpret(&source, &mut reporter) {
        Ok(()) => {}
        Err(InterpretError::Compile) => process::exit(exitcode::DATAERR),
        Err(InterpretError::Runtime) => process::exit(exitcode::SOFTWARE),
    }
}
