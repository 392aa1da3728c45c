//! Source text in, code objects out.
//!
//! Parses with the ruff parser, builds the symbol table and runs the
//! pylower code generator, folding every failure into one [`CompileError`].

use pylower_codegen::{
    Compiler,
    compile::CompileOutput,
    symboltable::{SymbolTable, SymbolTableArena},
};
use ruff_python_ast::Mod;
use ruff_source_file::{PositionEncoding, SourceFile, SourceFileBuilder, SourceLocation};
use thiserror::Error;

pub use pylower_codegen::compile::CompileOpts;
pub use pylower_compiler_core::{Mode, bytecode::CodeObject};

// re-exported so users need only one dependency
pub use pylower_codegen as codegen;
pub use pylower_compiler_core as core;
pub use ruff_python_ast as ast;
pub use ruff_python_parser as parser;

/// A syntax error reported by the parser, with resolved positions.
#[derive(Error, Debug)]
#[error("{error}")]
pub struct ParseError {
    #[source]
    pub error: parser::ParseErrorType,
    pub raw_location: ruff_text_size::TextRange,
    pub location: SourceLocation,
    pub end_location: SourceLocation,
    pub source_path: String,
}

#[derive(Error, Debug)]
pub enum CompileError {
    #[error(transparent)]
    Codegen(#[from] codegen::error::CodegenError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl CompileError {
    pub fn from_ruff_parse_error(error: parser::ParseError, source_file: &SourceFile) -> Self {
        let source_code = source_file.to_source_code();
        let location = source_code.source_location(error.location.start(), PositionEncoding::Utf8);
        let mut end_location =
            source_code.source_location(error.location.end(), PositionEncoding::Utf8);
        // a range ending at the start of the next line ends this one instead
        if end_location.character_offset.get() == 1 && end_location.line > location.line {
            let last = error.location.end() - ruff_text_size::TextSize::from(1);
            end_location = source_code.source_location(last, PositionEncoding::Utf8);
            end_location.character_offset = end_location.character_offset.saturating_add(1);
        }
        Self::Parse(ParseError {
            error: error.error,
            raw_location: error.location,
            location,
            end_location,
            source_path: source_file.name().to_owned(),
        })
    }

    pub const fn location(&self) -> Option<SourceLocation> {
        match self {
            Self::Codegen(error) => error.location,
            Self::Parse(error) => Some(error.location),
        }
    }

    pub const fn end_location(&self) -> Option<SourceLocation> {
        match self {
            Self::Codegen(error) => error.end_location,
            Self::Parse(error) => Some(error.end_location),
        }
    }

    pub fn source_path(&self) -> &str {
        match self {
            Self::Codegen(error) => &error.source_path,
            Self::Parse(error) => &error.source_path,
        }
    }
}

const fn parser_mode(mode: Mode) -> parser::Mode {
    match mode {
        Mode::Exec | Mode::Single => parser::Mode::Module,
        Mode::Eval => parser::Mode::Expression,
    }
}

fn parse(source_file: &SourceFile, mode: Mode) -> Result<Mod, CompileError> {
    parser::parse(source_file.source_text(), parser_mode(mode).into())
        .map(|parsed| parsed.into_syntax())
        .map_err(|err| CompileError::from_ruff_parse_error(err, source_file))
}

fn scan(ast: &Mod, source_file: &SourceFile) -> Result<SymbolTableArena, CompileError> {
    let symbols = match ast {
        Mod::Module(module) => SymbolTable::scan_program(module, source_file.clone()),
        Mod::Expression(expr) => SymbolTable::scan_expr(expr, source_file.clone()),
    };
    symbols.map_err(|e| e.into_codegen_error(source_file.name().to_owned()).into())
}

/// Compile source text, keeping the warnings and, with
/// [`CompileOpts::introspection`], the raw instruction sequences.
pub fn compile_with_output(
    source: &str,
    mode: Mode,
    source_path: &str,
    opts: CompileOpts,
) -> Result<CompileOutput, CompileError> {
    let source_file = SourceFileBuilder::new(source_path, source).finish();
    let ast = parse(&source_file, mode)?;
    let symbols = scan(&ast, &source_file)?;
    log::debug!("compiling {source_path} in {mode:?} mode");

    let mut compiler = Compiler::new(source_file, symbols, opts);
    match (&ast, mode) {
        (Mod::Module(module), Mode::Single) => compiler.compile_program_single(module)?,
        (Mod::Module(module), _) => compiler.compile_program(module)?,
        (Mod::Expression(expr), _) => compiler.compile_eval(expr)?,
    }
    Ok(compiler.finish()?)
}

/// Compile source text into a code object.
pub fn compile(
    source: &str,
    mode: Mode,
    source_path: &str,
    opts: CompileOpts,
) -> Result<CodeObject, CompileError> {
    compile_with_output(source, mode, source_path, opts).map(|output| output.code)
}

/// Build only the symbol table of `source`.
pub fn compile_symtable(
    source: &str,
    mode: Mode,
    source_path: &str,
) -> Result<SymbolTableArena, CompileError> {
    let source_file = SourceFileBuilder::new(source_path, source).finish();
    let ast = parse(&source_file, mode)?;
    scan(&ast, &source_file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_exec(source: &str) -> CodeObject {
        compile(source, Mode::Exec, "<test>", CompileOpts::default()).unwrap()
    }

    #[test]
    fn compiles_a_small_program() {
        let code = compile_exec(
            "initialized = True\ndef main():\n    print('Hello world!')\nif __name__ == '__main__':\n    main()\n",
        );
        assert_eq!(code.obj_name, "<module>");
        assert!(code.child_codes().any(|c| c.obj_name == "main"));
    }

    #[test]
    fn nested_fstrings_and_lambdas() {
        let code = compile_exec("assert f\"{{{(lambda x: f'hello, {x}')('world}')}\" == '{hello, world}'\n");
        assert!(code.child_codes().any(|c| c.obj_name == "<lambda>"));
    }

    #[test]
    fn big_integer_literal() {
        compile_exec("a = 0xFFFFFFFFFFFFFFFFFFFFFFFF\n");
    }

    #[test]
    fn eval_mode_takes_an_expression() {
        let code = compile("1 + x", Mode::Eval, "<test>", CompileOpts::default()).unwrap();
        assert!(code.names.iter().any(|name| name == "x"));
        assert!(compile("x = 1", Mode::Eval, "<test>", CompileOpts::default()).is_err());
    }

    #[test]
    fn single_mode_prints_expressions() {
        let code = compile("x", Mode::Single, "<stdin>", CompileOpts::default()).unwrap();
        assert!(code.to_string().contains("CALL_INTRINSIC_1"));
    }

    #[test]
    fn parse_errors_have_positions() {
        let err = compile("x = = 1\n", Mode::Exec, "bad.py", CompileOpts::default()).unwrap_err();
        assert!(matches!(err, CompileError::Parse(_)));
        assert_eq!(err.source_path(), "bad.py");
        assert_eq!(err.location().unwrap().line.get(), 1);
    }

    #[test]
    fn codegen_errors_are_wrapped() {
        let err = compile("break\n", Mode::Exec, "<test>", CompileOpts::default()).unwrap_err();
        assert!(matches!(err, CompileError::Codegen(_)));
        assert_eq!(err.to_string(), "'break' outside loop");
    }

    #[test]
    fn warnings_are_collected() {
        let output = compile_with_output(
            "x is 1\n",
            Mode::Exec,
            "<test>",
            CompileOpts::default(),
        )
        .unwrap();
        assert_eq!(output.warnings.len(), 1);

        let opts = CompileOpts {
            warnings_as_errors: true,
            ..CompileOpts::default()
        };
        assert!(compile("x is 1\n", Mode::Exec, "<test>", opts).is_err());
    }

    #[test]
    fn symbol_table_only() {
        let symbols = compile_symtable("def f(a):\n    return a\n", Mode::Exec, "<test>").unwrap();
        assert!(!symbols.future_annotations);
    }
}
