#[macro_use]
extern crate log;

mod settings;

use pylower_compiler::{CodeObject, CompileError};
use settings::{Action, Input, Settings};
use std::{
    fs,
    io::{self, Read},
    process::ExitCode,
};

fn main() -> ExitCode {
    env_logger::init();

    match settings::parse_args(lexopt::Parser::from_env()) {
        Ok(Action::Compile(settings)) => run(&settings),
        Ok(Action::Help) => {
            println!("{}", settings::USAGE);
            ExitCode::SUCCESS
        }
        Ok(Action::Version) => {
            println!("pylower {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("pylower: {err}\n\n{}", settings::USAGE);
            ExitCode::from(2)
        }
    }
}

fn read_input(input: &Input) -> io::Result<(String, String)> {
    match input {
        Input::Command(source) => Ok((source.clone(), "<string>".to_owned())),
        Input::File(path) if path.as_os_str() == "-" => {
            let mut source = String::new();
            io::stdin().read_to_string(&mut source)?;
            Ok((source, "<stdin>".to_owned()))
        }
        Input::File(path) => Ok((fs::read_to_string(path)?, path.display().to_string())),
    }
}

fn run(settings: &Settings) -> ExitCode {
    let (source, path) = match read_input(&settings.input) {
        Ok(input) => input,
        Err(err) => {
            eprintln!("pylower: cannot read input: {err}");
            return ExitCode::FAILURE;
        }
    };
    debug!("compiling {path} ({} bytes)", source.len());

    let result = pylower_compiler::compile_with_output(
        &source,
        settings.mode,
        &path,
        settings.opts.clone(),
    );
    match result {
        Ok(output) => {
            for warning in &output.warnings {
                eprintln!("{path}: SyntaxWarning: {warning}");
            }
            if settings.dis {
                print!("{}", output.code);
            } else {
                println!("{:?}: {} code objects", output.code, count_codes(&output.code));
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            report(&err);
            ExitCode::FAILURE
        }
    }
}

fn count_codes(code: &CodeObject) -> usize {
    1 + code.child_codes().map(count_codes).sum::<usize>()
}

fn report(err: &CompileError) {
    match err.location() {
        Some(location) => eprintln!(
            "File \"{}\", line {}, column {}\nSyntaxError: {err}",
            err.source_path(),
            location.line,
            location.character_offset,
        ),
        None => eprintln!("File \"{}\"\nSyntaxError: {err}", err.source_path()),
    }
}
