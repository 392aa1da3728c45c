//! Lower a Python AST into VM instruction sequences.
//!
//! The entry points are [`compile::compile_top`] (and its per-mode helpers)
//! and [`symboltable::SymbolTable`], which computes the scope information the
//! code generator consults for every name.

#[macro_use]
extern crate log;

extern crate alloc;

type IndexMap<K, V> = indexmap::IndexMap<K, V, ahash::RandomState>;
type IndexSet<T> = indexmap::IndexSet<T, ahash::RandomState>;

pub mod compile;
pub mod constant;
pub mod error;
pub mod ir;
pub mod symboltable;
mod unparse;

pub use compile::{CompileOpts, Compiler};
pub use constant::ConstantCache;
pub use ir::{Assemble, AssembleError, CodeUnitMetadata, InstructionSequence, LabelResolver};
use ruff_python_ast::Expr;

pub trait ToPythonName {
    /// Returns a short name for the node suitable for use in error messages.
    fn python_name(&self) -> &'static str;
}

impl ToPythonName for Expr {
    fn python_name(&self) -> &'static str {
        match self {
            Self::BoolOp(_) | Self::BinOp(_) | Self::UnaryOp(_) => "expression",
            Self::Subscript(_) => "subscript",
            Self::Await(_) => "await expression",
            Self::Yield(_) | Self::YieldFrom(_) => "yield expression",
            Self::Compare(_) => "comparison",
            Self::Attribute(_) => "attribute",
            Self::Call(_) => "function call",
            Self::BooleanLiteral(b) => {
                if b.value {
                    "True"
                } else {
                    "False"
                }
            }
            Self::EllipsisLiteral(_) => "ellipsis",
            Self::NoneLiteral(_) => "None",
            Self::NumberLiteral(_) | Self::BytesLiteral(_) | Self::StringLiteral(_) => "literal",
            Self::Tuple(_) => "tuple",
            Self::List(_) => "list",
            Self::Dict(_) => "dict literal",
            Self::Set(_) => "set display",
            Self::ListComp(_) => "list comprehension",
            Self::DictComp(_) => "dict comprehension",
            Self::SetComp(_) => "set comprehension",
            Self::Generator(_) => "generator expression",
            Self::Starred(_) => "starred",
            Self::Slice(_) => "slice",
            Self::FString(_) => "f-string expression",
            Self::TString(_) => "t-string expression",
            Self::Name(_) => "name",
            Self::Lambda(_) => "lambda",
            Self::If(_) => "conditional expression",
            Self::Named(_) => "named expression",
            Self::IpyEscapeCommand(_) => "escape command",
        }
    }
}
