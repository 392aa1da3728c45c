use bitflags::bitflags;

use core::fmt;

use thiserror::Error;

/// A typed view over the raw 32-bit argument of an [`Instruction`](super::Instruction).
pub trait OpArgType: Copy + Into<u32> + TryFrom<u32> {}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("invalid oparg {value} for {kind}")]
pub struct OpArgError {
    pub value: u32,
    pub kind: &'static str,
}

impl OpArgError {
    #[must_use]
    pub const fn new(value: u32, kind: &'static str) -> Self {
        Self { value, kind }
    }
}

/// Full 32-bit op_arg.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct OpArg(pub u32);

impl OpArg {
    pub const NULL: Self = Self::new(0);

    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }
}

impl From<u32> for OpArg {
    fn from(raw: u32) -> Self {
        Self::new(raw)
    }
}

impl From<OpArg> for u32 {
    fn from(value: OpArg) -> Self {
        value.0
    }
}

/// Helper macro for defining oparg enums.
///
/// Generates the enum itself plus `TryFrom<u32>`, `Into<u32>` and [`OpArgType`].
/// When a variant lists alternatives (`Foo = 0 | 255`), the first value is the
/// one produced when converting back to a number.
macro_rules! oparg_enum {
    (
        $(#[$enum_meta:meta])*
        $vis:vis enum $name:ident {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident = $value:literal $(| $alternatives:literal)*
            ),* $(,)?
        }
    ) => {
        $(#[$enum_meta])*
        $vis enum $name {
            $(
                $(#[$variant_meta])*
                $variant,
            )*
        }

        impl TryFrom<u32> for $name {
            type Error = OpArgError;

            fn try_from(value: u32) -> Result<Self, Self::Error> {
                Ok(match value {
                    $(
                        $value $(| $alternatives)* => Self::$variant,
                    )*
                    _ => return Err(OpArgError::new(value, stringify!($name))),
                })
            }
        }

        impl From<$name> for u32 {
            fn from(value: $name) -> Self {
                match value {
                    $(
                        $name::$variant => $value,
                    )*
                }
            }
        }

        impl OpArgType for $name {}
    };
}

impl OpArgType for u32 {}

pub type NameIdx = u32;

/// A jump target. Before assembly this is a symbolic label id; after assembly it
/// is the instruction offset the label was placed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[repr(transparent)]
pub struct Label(pub u32);

impl Label {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }
}

impl From<Label> for u32 {
    fn from(value: Label) -> Self {
        value.0
    }
}

impl TryFrom<u32> for Label {
    type Error = OpArgError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(Self(value))
    }
}

impl OpArgType for Label {}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

oparg_enum!(
    /// Oparg values for [`Instruction::ConvertValue`](super::Instruction::ConvertValue).
    #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
    pub enum ConvertValueOparg {
        /// No conversion. Ruff encodes this as `-1i8`, hence the alternative value.
        None = 0 | 255,
        /// `f"{x!s}"`
        Str = 1,
        /// `f"{x!r}"`
        Repr = 2,
        /// `f"{x!a}"`
        Ascii = 3,
    }
);

impl fmt::Display for ConvertValueOparg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let out = match self {
            Self::Str => "1 (str)",
            Self::Repr => "2 (repr)",
            Self::Ascii => "3 (ascii)",
            Self::None => "0",
        };
        write!(f, "{out}")
    }
}

oparg_enum!(
    /// Where a RESUME instruction sits.
    #[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
    pub enum ResumeType {
        AtFuncStart = 0,
        AfterYield = 1,
        AfterYieldFrom = 2,
        AfterAwait = 3,
    }
);

oparg_enum!(
    /// The kind of `raise` statement.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub enum RaiseKind {
        /// Bare `raise`.
        BareRaise = 0,
        /// `raise exc`
        Raise = 1,
        /// `raise exc from cause`
        RaiseCause = 2,
    }
);

oparg_enum!(
    /// Intrinsic function for CALL_INTRINSIC_1
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub enum IntrinsicFunction1 {
        Print = 1,
        /// `from x import *`
        ImportStar = 2,
        /// Convert StopIteration into RuntimeError inside generators
        StopIterationError = 3,
        AsyncGenWrap = 4,
        UnaryPositive = 5,
        ListToTuple = 6,
        TypeVar = 7,
        ParamSpec = 8,
        TypeVarTuple = 9,
        SubscriptGeneric = 10,
        TypeAlias = 11,
    }
);

oparg_enum!(
    /// Intrinsic function for CALL_INTRINSIC_2
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub enum IntrinsicFunction2 {
        PrepReraiseStar = 1,
        TypeVarWithBound = 2,
        TypeVarWithConstraints = 3,
        SetFunctionTypeParams = 4,
        SetTypeparamDefault = 5,
    }
);

bitflags! {
    /// Attribute selector for SET_FUNCTION_ATTRIBUTE.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct MakeFunctionFlags: u8 {
        const DEFAULTS = 0x01;
        const KW_DEFAULTS = 0x02;
        const ANNOTATIONS = 0x04;
        const CLOSURE = 0x08;
        const ANNOTATE = 0x10;
    }
}

impl TryFrom<u32> for MakeFunctionFlags {
    type Error = OpArgError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        u8::try_from(value)
            .ok()
            .and_then(Self::from_bits)
            .ok_or(OpArgError::new(value, "MakeFunctionFlags"))
    }
}

impl From<MakeFunctionFlags> for u32 {
    fn from(value: MakeFunctionFlags) -> Self {
        value.bits().into()
    }
}

impl OpArgType for MakeFunctionFlags {}

oparg_enum!(
    /// The possible comparison operators.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum ComparisonOperator {
        Less = 0,
        LessOrEqual = 1,
        Equal = 2,
        NotEqual = 3,
        Greater = 4,
        GreaterOrEqual = 5,
    }
);

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Self::Less => "<",
            Self::LessOrEqual => "<=",
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::Greater => ">",
            Self::GreaterOrEqual => ">=",
        };
        write!(f, "{op}")
    }
}

oparg_enum!(
    /// The possible binary operators, numbered like the `NB_*` slots.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use pylower_compiler_core::bytecode::{Arg, BinaryOperator, Instruction};
    /// let (op, _) = Arg::new(BinaryOperator::Add);
    /// let instruction = Instruction::BinaryOp { op };
    /// ```
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub enum BinaryOperator {
        /// `+`
        Add = 0,
        /// `&`
        And = 1,
        /// `//`
        FloorDivide = 2,
        /// `<<`
        Lshift = 3,
        /// `@`
        MatrixMultiply = 4,
        /// `*`
        Multiply = 5,
        /// `%`
        Remainder = 6,
        /// `|`
        Or = 7,
        /// `**`
        Power = 8,
        /// `>>`
        Rshift = 9,
        /// `-`
        Subtract = 10,
        /// `/`
        TrueDivide = 11,
        /// `^`
        Xor = 12,
        InplaceAdd = 13,
        InplaceAnd = 14,
        InplaceFloorDivide = 15,
        InplaceLshift = 16,
        InplaceMatrixMultiply = 17,
        InplaceMultiply = 18,
        InplaceRemainder = 19,
        InplaceOr = 20,
        InplacePower = 21,
        InplaceRshift = 22,
        InplaceSubtract = 23,
        InplaceTrueDivide = 24,
        InplaceXor = 25,
    }
);

impl BinaryOperator {
    /// Get the "inplace" version of the operator.
    /// This has no effect if `self` is already an "inplace" operator.
    ///
    /// ```rust
    /// use pylower_compiler_core::bytecode::BinaryOperator;
    ///
    /// assert_eq!(BinaryOperator::Power.as_inplace(), BinaryOperator::InplacePower);
    /// assert_eq!(BinaryOperator::InplaceSubtract.as_inplace(), BinaryOperator::InplaceSubtract);
    /// ```
    #[must_use]
    pub const fn as_inplace(self) -> Self {
        match self {
            Self::Add => Self::InplaceAdd,
            Self::And => Self::InplaceAnd,
            Self::FloorDivide => Self::InplaceFloorDivide,
            Self::Lshift => Self::InplaceLshift,
            Self::MatrixMultiply => Self::InplaceMatrixMultiply,
            Self::Multiply => Self::InplaceMultiply,
            Self::Remainder => Self::InplaceRemainder,
            Self::Or => Self::InplaceOr,
            Self::Power => Self::InplacePower,
            Self::Rshift => Self::InplaceRshift,
            Self::Subtract => Self::InplaceSubtract,
            Self::TrueDivide => Self::InplaceTrueDivide,
            Self::Xor => Self::InplaceXor,
            _ => self,
        }
    }
}

impl fmt::Display for BinaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Self::Add => "+",
            Self::And => "&",
            Self::FloorDivide => "//",
            Self::Lshift => "<<",
            Self::MatrixMultiply => "@",
            Self::Multiply => "*",
            Self::Remainder => "%",
            Self::Or => "|",
            Self::Power => "**",
            Self::Rshift => ">>",
            Self::Subtract => "-",
            Self::TrueDivide => "/",
            Self::Xor => "^",
            Self::InplaceAdd => "+=",
            Self::InplaceAnd => "&=",
            Self::InplaceFloorDivide => "//=",
            Self::InplaceLshift => "<<=",
            Self::InplaceMatrixMultiply => "@=",
            Self::InplaceMultiply => "*=",
            Self::InplaceRemainder => "%=",
            Self::InplaceOr => "|=",
            Self::InplacePower => "**=",
            Self::InplaceRshift => ">>=",
            Self::InplaceSubtract => "-=",
            Self::InplaceTrueDivide => "/=",
            Self::InplaceXor => "^=",
        };
        write!(f, "{op}")
    }
}

oparg_enum!(
    /// Whether or not to invert the operation.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Invert {
        /// `foo is bar`, `x in lst`
        No = 0,
        /// `foo is not bar`, `x not in lst`
        Yes = 1,
    }
);

oparg_enum!(
    /// Special method for LOAD_SPECIAL (context managers).
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum SpecialMethod {
        Enter = 0,
        Exit = 1,
        AEnter = 2,
        AExit = 3,
    }
);

impl fmt::Display for SpecialMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let method_name = match self {
            Self::Enter => "__enter__",
            Self::Exit => "__exit__",
            Self::AEnter => "__aenter__",
            Self::AExit => "__aexit__",
        };
        write!(f, "{method_name}")
    }
}

oparg_enum!(
    /// Constants loadable through LOAD_COMMON_CONSTANT.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum CommonConstant {
        AssertionError = 0,
        NotImplementedError = 1,
    }
);

impl fmt::Display for CommonConstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AssertionError => "AssertionError",
            Self::NotImplementedError => "NotImplementedError",
        };
        write!(f, "{name}")
    }
}

oparg_enum!(
    /// What GET_AWAITABLE is awaiting, for better error messages.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum AwaitableKind {
        Await = 0,
        AEnter = 1,
        AExit = 2,
    }
);

/// Argument of UNPACK_EX: the number of targets before and after the starred one.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UnpackExArgs {
    pub before: u8,
    pub after: u8,
}

impl TryFrom<u32> for UnpackExArgs {
    type Error = OpArgError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        let [before, after, rest @ ..] = value.to_le_bytes();
        if rest != [0, 0] {
            return Err(OpArgError::new(value, "UnpackExArgs"));
        }
        Ok(Self { before, after })
    }
}

impl From<UnpackExArgs> for u32 {
    fn from(value: UnpackExArgs) -> Self {
        Self::from_le_bytes([value.before, value.after, 0, 0])
    }
}

impl OpArgType for UnpackExArgs {}

impl fmt::Display for UnpackExArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "before: {}, after: {}", self.before, self.after)
    }
}

/// LOAD_ATTR argument: bit 0 selects the method form, the rest is the name index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadAttr(u32);

impl LoadAttr {
    #[must_use]
    pub const fn new(name_idx: NameIdx, is_method: bool) -> Self {
        Self((name_idx << 1) | (is_method as u32))
    }

    #[must_use]
    pub const fn name_idx(self) -> NameIdx {
        self.0 >> 1
    }

    #[must_use]
    pub const fn is_method(self) -> bool {
        (self.0 & 1) == 1
    }
}

impl TryFrom<u32> for LoadAttr {
    type Error = OpArgError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(Self(value))
    }
}

impl From<LoadAttr> for u32 {
    fn from(value: LoadAttr) -> Self {
        value.0
    }
}

impl OpArgType for LoadAttr {}

/// LOAD_SUPER_ATTR argument: bit 0 = method, bit 1 = two-argument form,
/// bits 2.. = name index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadSuperAttr(u32);

impl LoadSuperAttr {
    #[must_use]
    pub const fn new(name_idx: NameIdx, is_method: bool, has_class: bool) -> Self {
        Self((name_idx << 2) | ((has_class as u32) << 1) | (is_method as u32))
    }

    #[must_use]
    pub const fn name_idx(self) -> NameIdx {
        self.0 >> 2
    }

    #[must_use]
    pub const fn is_method(self) -> bool {
        (self.0 & 1) == 1
    }

    #[must_use]
    pub const fn has_class(self) -> bool {
        (self.0 & 2) == 2
    }
}

impl TryFrom<u32> for LoadSuperAttr {
    type Error = OpArgError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(Self(value))
    }
}

impl From<LoadSuperAttr> for u32 {
    fn from(value: LoadSuperAttr) -> Self {
        value.0
    }
}

impl OpArgType for LoadSuperAttr {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_attr_packs_method_bit() {
        let arg = LoadAttr::new(5, true);
        assert_eq!(u32::from(arg), 11);
        assert_eq!(arg.name_idx(), 5);
        assert!(arg.is_method());
    }

    #[test]
    fn load_super_attr_packs_flags() {
        let arg = LoadSuperAttr::new(3, false, true);
        assert_eq!(u32::from(arg), (3 << 2) | 2);
        assert!(arg.has_class());
        assert!(!arg.is_method());
    }

    #[test]
    fn conversion_accepts_ruff_none() {
        assert_eq!(
            ConvertValueOparg::try_from(255).unwrap(),
            ConvertValueOparg::None
        );
        assert_eq!(u32::from(ConvertValueOparg::None), 0);
        assert!(ConvertValueOparg::try_from(7).is_err());
    }

    #[test]
    fn unpack_ex_rejects_wide_values() {
        let args = UnpackExArgs::try_from(0x0201).unwrap();
        assert_eq!(args, UnpackExArgs { before: 1, after: 2 });
        assert!(UnpackExArgs::try_from(0x01_0000).is_err());
    }
}
