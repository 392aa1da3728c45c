//! Instruction set, constants and code objects.

use alloc::{boxed::Box, collections::BTreeSet, string::String, vec::Vec};
use bitflags::bitflags;
use core::{fmt, hash, mem};
use itertools::Itertools;
use malachite_bigint::BigInt;
use num_complex::Complex64;

use crate::{OneIndexed, SourceLocation};

pub use instruction::{Arg, Instruction};
pub use oparg::{
    AwaitableKind, BinaryOperator, CommonConstant, ComparisonOperator, ConvertValueOparg,
    IntrinsicFunction1, IntrinsicFunction2, Invert, Label, LoadAttr, LoadSuperAttr,
    MakeFunctionFlags, NameIdx, OpArg, OpArgError, OpArgType, RaiseKind, ResumeType,
    SpecialMethod, UnpackExArgs,
};

mod instruction;
mod oparg;

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
    pub struct CodeFlags: u32 {
        const OPTIMIZED = 0x0001;
        const NEWLOCALS = 0x0002;
        const VARARGS = 0x0004;
        const VARKEYWORDS = 0x0008;
        const NESTED = 0x0010;
        const GENERATOR = 0x0020;
        const COROUTINE = 0x0080;
        const ITERABLE_COROUTINE = 0x0100;
        const ASYNC_GENERATOR = 0x0200;
        const HAS_DOCSTRING = 0x0400_0000;
        const METHOD = 0x0800_0000;
    }
}

/// A Constant (which usually encapsulates data within it)
///
/// # Examples
/// ```
/// use pylower_compiler_core::bytecode::ConstantData;
/// let a = ConstantData::Float {value: 120f64};
/// let b = ConstantData::Boolean {value: false};
/// assert_ne!(a, b);
/// ```
#[derive(Debug, Clone)]
pub enum ConstantData {
    Tuple { elements: Vec<ConstantData> },
    FrozenSet { elements: Vec<ConstantData> },
    Integer { value: BigInt },
    Float { value: f64 },
    Complex { value: Complex64 },
    Boolean { value: bool },
    Str { value: String },
    Bytes { value: Vec<u8> },
    Code { code: Box<CodeObject> },
    None,
    Ellipsis,
}

impl ConstantData {
    #[must_use]
    pub fn str(value: impl Into<String>) -> Self {
        Self::Str {
            value: value.into(),
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str { value } => Some(value.as_str()),
            _ => None,
        }
    }

    /// Python truthiness of a constant. Code objects are always true.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Tuple { elements } | Self::FrozenSet { elements } => !elements.is_empty(),
            Self::Integer { value } => *value != BigInt::from(0u8),
            Self::Float { value } => *value != 0.0,
            Self::Complex { value } => value.re != 0.0 || value.im != 0.0,
            Self::Boolean { value } => *value,
            Self::Str { value } => !value.is_empty(),
            Self::Bytes { value } => !value.is_empty(),
            Self::Code { .. } | Self::Ellipsis => true,
            Self::None => false,
        }
    }
}

impl PartialEq for ConstantData {
    fn eq(&self, other: &Self) -> bool {
        use ConstantData::*;

        match (self, other) {
            (Integer { value: a }, Integer { value: b }) => a == b,
            // compare floats by bit pattern so -0.0 and 0.0 stay distinct
            (Float { value: a }, Float { value: b }) => a.to_bits() == b.to_bits(),
            (Complex { value: a }, Complex { value: b }) => {
                a.re.to_bits() == b.re.to_bits() && a.im.to_bits() == b.im.to_bits()
            }
            (Boolean { value: a }, Boolean { value: b }) => a == b,
            (Str { value: a }, Str { value: b }) => a == b,
            (Bytes { value: a }, Bytes { value: b }) => a == b,
            (Code { code: a }, Code { code: b }) => core::ptr::eq(a.as_ref(), b.as_ref()),
            (Tuple { elements: a }, Tuple { elements: b }) => a == b,
            (FrozenSet { elements: a }, FrozenSet { elements: b }) => {
                a.len() == b.len() && a.iter().all(|x| b.contains(x))
            }
            (None, None) => true,
            (Ellipsis, Ellipsis) => true,
            _ => false,
        }
    }
}

impl Eq for ConstantData {}

impl hash::Hash for ConstantData {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        use ConstantData::*;

        mem::discriminant(self).hash(state);
        match self {
            Integer { value } => value.hash(state),
            Float { value } => value.to_bits().hash(state),
            Complex { value } => {
                value.re.to_bits().hash(state);
                value.im.to_bits().hash(state);
            }
            Boolean { value } => value.hash(state),
            Str { value } => value.hash(state),
            Bytes { value } => value.hash(state),
            Code { code } => core::ptr::hash(code.as_ref(), state),
            Tuple { elements } => elements.hash(state),
            // order-independent
            FrozenSet { elements } => elements.len().hash(state),
            None => {}
            Ellipsis => {}
        }
    }
}

impl fmt::Display for ConstantData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer { value } => write!(f, "{value}"),
            Self::Float { value } => write!(f, "{value:?}"),
            Self::Complex { value } => {
                if value.re == 0.0 && value.re.is_sign_positive() {
                    write!(f, "{:?}j", value.im)
                } else {
                    write!(f, "({:?}{:+?}j)", value.re, value.im)
                }
            }
            Self::Boolean { value } => f.write_str(if *value { "True" } else { "False" }),
            Self::Str { value } => write!(f, "{value:?}"),
            Self::Bytes { value } => write!(f, r#"b"{}""#, value.escape_ascii()),
            Self::Code { code } => write!(f, "{code:?}"),
            Self::Tuple { elements } => {
                if let [single] = elements.as_slice() {
                    write!(f, "({single},)")
                } else {
                    write!(f, "({})", elements.iter().format(", "))
                }
            }
            Self::FrozenSet { elements } => {
                if elements.is_empty() {
                    f.write_str("frozenset()")
                } else {
                    write!(f, "frozenset({{{}}})", elements.iter().format(", "))
                }
            }
            Self::None => f.write_str("None"),
            Self::Ellipsis => f.write_str("..."),
        }
    }
}

/// An instruction with its argument, as stored in a finished [`CodeObject`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CodeUnit {
    pub op: Instruction,
    pub arg: OpArg,
}

impl CodeUnit {
    #[must_use]
    pub const fn new(op: Instruction, arg: OpArg) -> Self {
        Self { op, arg }
    }
}

/// Primary container of a single code object. Each python function has
/// a code object. Also a module has a code object.
#[derive(Clone)]
pub struct CodeObject {
    pub instructions: Box<[CodeUnit]>,
    /// Start and end position of each instruction. `None` marks artificial
    /// instructions that belong to no source line.
    pub locations: Box<[Option<(SourceLocation, SourceLocation)>]>,
    pub flags: CodeFlags,
    /// Number of positional-only arguments
    pub posonlyarg_count: u32,
    pub arg_count: u32,
    pub kwonlyarg_count: u32,
    pub source_path: String,
    pub first_line_number: Option<OneIndexed>,
    /// Name of the object that created this code object
    pub obj_name: String,
    /// Dotted path from the module to this object
    pub qualname: String,
    pub constants: Box<[ConstantData]>,
    pub names: Box<[String]>,
    pub varnames: Box<[String]>,
    pub cellvars: Box<[String]>,
    pub freevars: Box<[String]>,
}

/// Argument names of a code object, split by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arguments<'a> {
    pub posonlyargs: &'a [String],
    pub args: &'a [String],
    pub vararg: Option<&'a str>,
    pub kwonlyargs: &'a [String],
    pub varkwarg: Option<&'a str>,
}

impl CodeObject {
    /// Get all arguments of the code object
    /// like inspect.getargs
    #[must_use]
    pub fn arg_names(&self) -> Arguments<'_> {
        let nargs = self.arg_count as usize;
        let nkwargs = self.kwonlyarg_count as usize;
        let mut varargs_pos = nargs + nkwargs;
        let posonlyargs = &self.varnames[..self.posonlyarg_count as usize];
        let args = &self.varnames[..nargs];
        let kwonlyargs = &self.varnames[nargs..varargs_pos];

        let vararg = if self.flags.contains(CodeFlags::VARARGS) {
            let vararg = self.varnames[varargs_pos].as_str();
            varargs_pos += 1;
            Some(vararg)
        } else {
            None
        };
        let varkwarg = self
            .flags
            .contains(CodeFlags::VARKEYWORDS)
            .then(|| self.varnames[varargs_pos].as_str());

        Arguments {
            posonlyargs,
            args,
            vararg,
            kwonlyargs,
            varkwarg,
        }
    }

    /// Return the labels targeted by the instructions of this CodeObject
    #[must_use]
    pub fn label_targets(&self) -> BTreeSet<Label> {
        self.instructions
            .iter()
            .filter_map(|unit| unit.op.label_arg().and_then(|l| l.try_get(unit.arg)))
            .collect()
    }

    /// Nested code objects among the constants, in constant-table order.
    pub fn child_codes(&self) -> impl Iterator<Item = &Self> + '_ {
        self.constants.iter().filter_map(|c| match c {
            ConstantData::Code { code } => Some(code.as_ref()),
            _ => None,
        })
    }

    pub(crate) fn display_inner(
        &self,
        f: &mut fmt::Formatter<'_>,
        expand_code_objects: bool,
        level: usize,
    ) -> fmt::Result {
        let label_targets = self.label_targets();
        let line_digits = self
            .locations
            .iter()
            .flatten()
            .map(|(start, _)| start.line.digits().get())
            .max()
            .map_or(3, |digits| digits.max(3));
        let offset_digits = (4).max(1 + self.instructions.len().max(1).ilog10() as usize);
        let mut last_line = None;
        for (offset, unit) in self.instructions.iter().enumerate() {
            // artificial instructions continue the previous line
            let line = self
                .locations
                .get(offset)
                .copied()
                .flatten()
                .map(|(start, _)| start.line);
            if let Some(line) = line
                && last_line != Some(line)
            {
                if last_line.is_some() {
                    writeln!(f)?;
                }
                last_line = Some(line);
                write!(f, "{line:line_digits$}")?;
            } else {
                for _ in 0..line_digits {
                    write!(f, " ")?;
                }
            }
            write!(f, " ")?;

            for _ in 0..level {
                write!(f, "    ")?;
            }

            let arrow = if label_targets.contains(&Label(offset as u32)) {
                ">>"
            } else {
                "  "
            };
            write!(f, "{arrow} {offset:offset_digits$} ")?;

            unit.op
                .fmt_dis(unit.arg, f, self, expand_code_objects, 21, level)?;
            writeln!(f)?;
        }
        Ok(())
    }

    /// Recursively display this CodeObject
    pub fn display_expand_code_objects(&self) -> impl fmt::Display + '_ {
        struct Display<'a>(&'a CodeObject);
        impl fmt::Display for Display<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.display_inner(f, true, 1)
            }
        }
        Display(self)
    }
}

impl fmt::Display for CodeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.display_inner(f, false, 1)?;
        for code in self.child_codes() {
            writeln!(f, "Disassembly of {code:?}:")?;
            code.fmt(f)?;
        }
        Ok(())
    }
}

impl fmt::Debug for CodeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<code object {} at ??? file {:?}, line {}>",
            self.obj_name,
            self.source_path,
            self.first_line_number.map_or(-1, |x| x.get() as i32)
        )
    }
}

/// Name tables an instruction needs to print its argument.
pub trait InstrDisplayContext {
    fn get_constant(&self, i: usize) -> &ConstantData;

    fn get_name(&self, i: usize) -> &str;

    fn get_varname(&self, i: usize) -> &str;

    fn get_cell_name(&self, i: usize) -> &str;
}

impl InstrDisplayContext for CodeObject {
    fn get_constant(&self, i: usize) -> &ConstantData {
        &self.constants[i]
    }

    fn get_name(&self, i: usize) -> &str {
        self.names.get(i).map_or("<?>", String::as_str)
    }

    fn get_varname(&self, i: usize) -> &str {
        self.varnames.get(i).map_or("<?>", String::as_str)
    }

    fn get_cell_name(&self, i: usize) -> &str {
        self.cellvars
            .get(i)
            .or_else(|| self.freevars.get(i.wrapping_sub(self.cellvars.len())))
            .map_or("<?>", String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn frozenset_equality_ignores_order() {
        let a = ConstantData::FrozenSet {
            elements: vec![ConstantData::str("a"), ConstantData::str("b")],
        };
        let b = ConstantData::FrozenSet {
            elements: vec![ConstantData::str("b"), ConstantData::str("a")],
        };
        assert_eq!(a, b);
    }

    #[test]
    fn floats_compare_by_bits() {
        assert_ne!(
            ConstantData::Float { value: 0.0 },
            ConstantData::Float { value: -0.0 }
        );
        assert_ne!(
            ConstantData::Integer {
                value: BigInt::from(1)
            },
            ConstantData::Boolean { value: true }
        );
    }

    #[test]
    fn constant_display() {
        let single = ConstantData::Tuple {
            elements: vec![ConstantData::Integer {
                value: BigInt::from(1),
            }],
        };
        assert_eq!(single.to_string(), "(1,)");
        let pair = ConstantData::Tuple {
            elements: vec![ConstantData::str("x"), ConstantData::None],
        };
        assert_eq!(pair.to_string(), r#"("x", None)"#);
        assert_eq!(ConstantData::Float { value: 1.0 }.to_string(), "1.0");
    }

    #[test]
    fn truthiness() {
        assert!(!ConstantData::str("").is_truthy());
        assert!(ConstantData::Ellipsis.is_truthy());
        assert!(
            !ConstantData::Integer {
                value: BigInt::from(0)
            }
            .is_truthy()
        );
    }
}
