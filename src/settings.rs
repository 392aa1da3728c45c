use lexopt::prelude::*;
use pylower_compiler::{CompileOpts, Mode};
use std::path::PathBuf;

pub(crate) const USAGE: &str = "\
usage: pylower [OPTIONS] FILE
       pylower [OPTIONS] -c SOURCE

Compile Python source and report the resulting code objects.

options:
  -c SOURCE                compile SOURCE instead of reading a file
  --mode exec|eval|single  top level shape of the input (default: exec)
  -O                       optimize; give twice to also drop docstrings
  --dis                    print the disassembly of every code object
  -W, --warnings-as-errors treat compile warnings as syntax errors
  --no-debug-ranges        record only start positions for instructions
  -h, --help               print this help
  -V, --version            print the version";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Input {
    /// A path, or `-` for standard input.
    File(PathBuf),
    Command(String),
}

#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) input: Input,
    pub(crate) mode: Mode,
    pub(crate) dis: bool,
    pub(crate) opts: CompileOpts,
}

#[derive(Debug, Clone)]
pub(crate) enum Action {
    Compile(Settings),
    Help,
    Version,
}

pub(crate) fn parse_args(mut parser: lexopt::Parser) -> Result<Action, lexopt::Error> {
    let mut input = None;
    let mut mode = Mode::Exec;
    let mut dis = false;
    let mut opts = CompileOpts::default();

    while let Some(arg) = parser.next()? {
        match arg {
            Short('c') if input.is_none() => {
                input = Some(Input::Command(parser.value()?.string()?));
            }
            Long("mode") => mode = parser.value()?.parse()?,
            Short('O') => opts.optimize = opts.optimize.saturating_add(1),
            Long("dis") => dis = true,
            Short('W') | Long("warnings-as-errors") => opts.warnings_as_errors = true,
            Long("no-debug-ranges") => opts.debug_ranges = false,
            Short('h') | Long("help") => return Ok(Action::Help),
            Short('V') | Long("version") => return Ok(Action::Version),
            Value(path) if input.is_none() => input = Some(Input::File(path.into())),
            _ => return Err(arg.unexpected()),
        }
    }

    let input = input.ok_or("expected a FILE or -c SOURCE")?;
    Ok(Action::Compile(Settings {
        input,
        mode,
        dis,
        opts,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Action, lexopt::Error> {
        parse_args(lexopt::Parser::from_args(args.iter().copied()))
    }

    fn settings(args: &[&str]) -> Settings {
        match parse(args).unwrap() {
            Action::Compile(settings) => settings,
            other => panic!("expected settings, got {other:?}"),
        }
    }

    #[test]
    fn file_with_defaults() {
        let settings = settings(&["script.py"]);
        assert_eq!(settings.input, Input::File("script.py".into()));
        assert_eq!(settings.mode, Mode::Exec);
        assert!(!settings.dis);
        assert_eq!(settings.opts.optimize, 0);
    }

    #[test]
    fn command_with_options() {
        let settings = settings(&["--mode", "eval", "-OO", "--dis", "-c", "1 + 2"]);
        assert_eq!(settings.input, Input::Command("1 + 2".to_owned()));
        assert_eq!(settings.mode, Mode::Eval);
        assert!(settings.dis);
        assert_eq!(settings.opts.optimize, 2);
    }

    #[test]
    fn warnings_as_errors() {
        assert!(settings(&["-W", "-"]).opts.warnings_as_errors);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["--mode", "module", "x.py"]).is_err());
        assert!(parse(&["a.py", "b.py"]).is_err());
        assert!(parse(&["--frobnicate"]).is_err());
    }

    #[test]
    fn help_and_version() {
        assert!(matches!(parse(&["--help"]), Ok(Action::Help)));
        assert!(matches!(parse(&["-V"]), Ok(Action::Version)));
    }
}
