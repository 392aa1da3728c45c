#![doc = "Instruction set and code objects shared by the pylower code generator and its consumers."]

extern crate alloc;

pub mod bytecode;
mod mode;

pub use mode::{Mode, ModeParseError};

pub use ruff_source_file::{
    LineIndex, OneIndexed, PositionEncoding, SourceFile, SourceFileBuilder, SourceLocation,
};
