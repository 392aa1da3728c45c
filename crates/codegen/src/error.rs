use alloc::string::String;
use core::fmt;
use pylower_compiler_core::SourceLocation;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternUnreachableReason {
    NameCapture,
    Wildcard,
}

impl fmt::Display for PatternUnreachableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NameCapture => write!(f, "name capture"),
            Self::Wildcard => write!(f, "wildcard"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{error}")]
pub struct CodegenError {
    pub location: Option<SourceLocation>,
    pub end_location: Option<SourceLocation>,
    #[source]
    pub error: CodegenErrorType,
    pub source_path: String,
}

impl CodegenError {
    /// Whether this error reports a bug in the code generator rather than bad input.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self.error, CodegenErrorType::Internal(_))
    }
}

/// Broken invariants between the symbol table and the code generator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum InternalError {
    #[error("unit stack underflow")]
    StackUnderflow,
    #[error(
        "the symbol '{0}' must be present in the symbol table, even when it is undefined in python"
    )]
    MissingSymbol(String),
    #[error("no symbol table for {0}")]
    MissingSymbolTable(String),
    #[error("frame block mismatch: expected {expected}, found {found}")]
    FrameBlockMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("label {0} placed twice")]
    DuplicateLabel(u32),
    #[error("label {0} used but never placed")]
    DanglingLabel(u32),
    #[error("{0}")]
    Assembler(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum CodegenErrorType {
    /// Invalid assignment, cannot store value in target.
    #[error("cannot assign to {0}")]
    Assign(&'static str),
    /// Invalid delete
    #[error("cannot delete {0}")]
    Delete(&'static str),
    #[error("{0}")]
    SyntaxError(String),
    /// Multiple `*` detected
    #[error("multiple starred expressions in assignment")]
    MultipleStarArgs,
    /// Misplaced `*` expression
    #[error("can't use starred expression here")]
    InvalidStarExpr,
    /// Break statement outside of loop.
    #[error("'break' outside loop")]
    InvalidBreak,
    /// Continue statement outside of loop.
    #[error("'continue' not properly in loop")]
    InvalidContinue,
    #[error("'{0}' cannot appear in an except* block")]
    BreakContinueReturnInExceptStar(&'static str),
    #[error("'return' outside function")]
    InvalidReturn,
    #[error("'yield' outside function")]
    InvalidYield,
    #[error("'yield from' outside function")]
    InvalidYieldFrom,
    #[error("'await' outside function")]
    AwaitOutsideFunction,
    #[error("'await' outside async function")]
    InvalidAwait,
    #[error("asynchronous comprehension outside of an asynchronous function")]
    InvalidAsyncComprehension,
    #[error("'{0}' outside async function")]
    AsyncOutsideFunction(&'static str),
    #[error("'yield from' inside async function")]
    AsyncYieldFrom,
    #[error("'return' with value in async generator")]
    AsyncReturnValue,
    #[error("from __future__ imports must occur at the beginning of the file")]
    InvalidFuturePlacement,
    #[error("future feature {0} is not defined")]
    InvalidFutureFeature(String),
    #[error("import * only allowed at module level")]
    FunctionImportStar,
    #[error("too many expressions in star-unpacking assignment")]
    TooManyStarUnpack,
    #[error("too many statically nested blocks")]
    TooManyNestedBlocks,
    #[error("keyword argument repeated: {0}")]
    RepeatedKeyword(String),
    #[error("non-default type parameter '{0}' follows default type parameter")]
    NonDefaultTypeParam(String),
    #[error("multiple assignments to name '{0}' in pattern")]
    DuplicateStore(String),
    #[error("{0} makes remaining patterns unreachable")]
    UnreachablePattern(PatternUnreachableReason),
    #[error("attribute name repeated in class pattern: {0}")]
    RepeatedAttributePattern(String),
    #[error("alternative patterns bind different names")]
    ConflictingNameBindPattern,
    #[error("too many sub-patterns in {0} pattern")]
    TooManySubPatterns(&'static str),
    #[error("mapping pattern keys may only match literals and attribute lookups")]
    InvalidMappingKey,
    #[error("multiple starred names in sequence pattern")]
    MultipleStarredPatterns,
    #[error("{0}")]
    Internal(InternalError),
}

impl From<InternalError> for CodegenErrorType {
    fn from(err: InternalError) -> Self {
        Self::Internal(err)
    }
}

/// A soft diagnostic. Escalated to a `SyntaxError` when warnings are errors.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileWarning {
    pub message: String,
    pub location: Option<SourceLocation>,
    pub end_location: Option<SourceLocation>,
}

impl fmt::Display for CompileWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "line {}: {}", loc.line, self.message),
            None => f.write_str(&self.message),
        }
    }
}
