use core::{fmt, marker::PhantomData};

use crate::bytecode::{
    ConstantData, InstrDisplayContext,
    oparg::{
        AwaitableKind, BinaryOperator, CommonConstant, ComparisonOperator, ConvertValueOparg,
        IntrinsicFunction1, IntrinsicFunction2, Invert, Label, LoadAttr, LoadSuperAttr,
        MakeFunctionFlags, NameIdx, OpArg, OpArgType, RaiseKind, ResumeType, SpecialMethod,
        UnpackExArgs,
    },
};

/// A single VM instruction.
///
/// Arguments are not stored inline: each variant carries zero-sized [`Arg`]
/// markers naming the typed meaning of the separate [`OpArg`] that travels
/// alongside it in an instruction sequence.
///
/// The variants after [`Instruction::Jump`] are pseudo instructions. They are
/// produced by code generation and consumed by the assembler; they never
/// reach the VM.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Instruction {
    Nop,
    PopTop,
    PushNull,
    EndFor,
    EndSend,
    Copy {
        index: Arg<u32>,
    },
    Swap {
        index: Arg<u32>,
    },
    LoadConst {
        idx: Arg<u32>,
    },
    ReturnValue,
    Resume {
        arg: Arg<ResumeType>,
    },

    LoadFast(Arg<NameIdx>),
    LoadFastAndClear(Arg<NameIdx>),
    StoreFast(Arg<NameIdx>),
    DeleteFast(Arg<NameIdx>),
    LoadDeref(Arg<NameIdx>),
    StoreDeref(Arg<NameIdx>),
    DeleteDeref(Arg<NameIdx>),
    LoadFromDictOrDeref(Arg<NameIdx>),
    MakeCell(Arg<NameIdx>),
    LoadName(Arg<NameIdx>),
    StoreName(Arg<NameIdx>),
    DeleteName(Arg<NameIdx>),
    LoadGlobal(Arg<NameIdx>),
    StoreGlobal(Arg<NameIdx>),
    DeleteGlobal(Arg<NameIdx>),
    LoadFromDictOrGlobals(Arg<NameIdx>),
    LoadLocals,

    LoadAttr {
        idx: Arg<LoadAttr>,
    },
    StoreAttr {
        idx: Arg<NameIdx>,
    },
    DeleteAttr {
        idx: Arg<NameIdx>,
    },
    LoadSuperAttr {
        arg: Arg<LoadSuperAttr>,
    },
    ImportName {
        idx: Arg<NameIdx>,
    },
    ImportFrom {
        idx: Arg<NameIdx>,
    },

    BinaryOp {
        op: Arg<BinaryOperator>,
    },
    CompareOp {
        op: Arg<ComparisonOperator>,
    },
    IsOp(Arg<Invert>),
    ContainsOp(Arg<Invert>),
    UnaryNegative,
    UnaryNot,
    UnaryInvert,
    ToBool,

    BinarySubscr,
    StoreSubscr,
    DeleteSubscr,
    BinarySlice,
    StoreSlice,
    BuildSlice {
        argc: Arg<u32>,
    },

    BuildTuple {
        size: Arg<u32>,
    },
    BuildList {
        size: Arg<u32>,
    },
    BuildSet {
        size: Arg<u32>,
    },
    BuildMap {
        size: Arg<u32>,
    },
    BuildString {
        size: Arg<u32>,
    },
    ListAppend {
        i: Arg<u32>,
    },
    SetAdd {
        i: Arg<u32>,
    },
    MapAdd {
        i: Arg<u32>,
    },
    ListExtend {
        i: Arg<u32>,
    },
    SetUpdate {
        i: Arg<u32>,
    },
    DictUpdate {
        i: Arg<u32>,
    },
    DictMerge {
        i: Arg<u32>,
    },
    UnpackSequence {
        size: Arg<u32>,
    },
    UnpackEx {
        args: Arg<UnpackExArgs>,
    },

    Call {
        nargs: Arg<u32>,
    },
    CallKw {
        nargs: Arg<u32>,
    },
    CallFunctionEx {
        has_kwargs: Arg<u32>,
    },
    CallIntrinsic1 {
        func: Arg<IntrinsicFunction1>,
    },
    CallIntrinsic2 {
        func: Arg<IntrinsicFunction2>,
    },
    MakeFunction,
    SetFunctionAttribute {
        attr: Arg<MakeFunctionFlags>,
    },
    LoadBuildClass,

    LoadSpecial {
        method: Arg<SpecialMethod>,
    },
    LoadCommonConstant {
        idx: Arg<CommonConstant>,
    },
    RaiseVarargs {
        kind: Arg<RaiseKind>,
    },
    Reraise {
        depth: Arg<u32>,
    },
    PushExcInfo,
    PopExcept,
    CheckExcMatch,
    CheckEgMatch,
    WithExceptStart,
    CleanupThrow,

    GetIter,
    GetAIter,
    GetANext,
    GetYieldFromIter,
    GetAwaitable {
        kind: Arg<AwaitableKind>,
    },
    YieldValue {
        arg: Arg<u32>,
    },
    ForIter {
        target: Arg<Label>,
    },
    Send {
        target: Arg<Label>,
    },
    EndAsyncFor,

    PopJumpIfFalse {
        target: Arg<Label>,
    },
    PopJumpIfTrue {
        target: Arg<Label>,
    },
    PopJumpIfNone {
        target: Arg<Label>,
    },
    PopJumpIfNotNone {
        target: Arg<Label>,
    },

    FormatSimple,
    FormatWithSpec,
    ConvertValue {
        oparg: Arg<ConvertValueOparg>,
    },

    MatchMapping,
    MatchSequence,
    MatchKeys,
    MatchClass {
        count: Arg<u32>,
    },
    GetLen,
    SetupAnnotations,

    // Pseudo instructions
    Jump {
        target: Arg<Label>,
    },
    JumpNoInterrupt {
        target: Arg<Label>,
    },
    SetupFinally {
        target: Arg<Label>,
    },
    SetupCleanup {
        target: Arg<Label>,
    },
    SetupWith {
        target: Arg<Label>,
    },
    PopBlock,
    LoadClosure(Arg<NameIdx>),
    StoreFastMaybeNull(Arg<NameIdx>),
}

impl Instruction {
    /// The label argument of a jump or block-setup instruction.
    #[must_use]
    pub const fn label_arg(&self) -> Option<Arg<Label>> {
        match self {
            Self::ForIter { target }
            | Self::Send { target }
            | Self::PopJumpIfFalse { target }
            | Self::PopJumpIfTrue { target }
            | Self::PopJumpIfNone { target }
            | Self::PopJumpIfNotNone { target }
            | Self::Jump { target }
            | Self::JumpNoInterrupt { target }
            | Self::SetupFinally { target }
            | Self::SetupCleanup { target }
            | Self::SetupWith { target } => Some(*target),
            _ => None,
        }
    }

    /// Whether control never falls through to the next instruction.
    #[must_use]
    pub const fn is_scope_exit(&self) -> bool {
        matches!(
            self,
            Self::ReturnValue
                | Self::RaiseVarargs { .. }
                | Self::Reraise { .. }
                | Self::Jump { .. }
                | Self::JumpNoInterrupt { .. }
        )
    }

    #[must_use]
    pub const fn is_pseudo(&self) -> bool {
        matches!(
            self,
            Self::Jump { .. }
                | Self::JumpNoInterrupt { .. }
                | Self::SetupFinally { .. }
                | Self::SetupCleanup { .. }
                | Self::SetupWith { .. }
                | Self::PopBlock
                | Self::LoadClosure(_)
                | Self::StoreFastMaybeNull(_)
        )
    }

    pub fn display<'a>(
        &'a self,
        arg: OpArg,
        ctx: &'a impl InstrDisplayContext,
    ) -> impl fmt::Display + 'a {
        struct FmtFn<F>(F);
        impl<F: Fn(&mut fmt::Formatter<'_>) -> fmt::Result> fmt::Display for FmtFn<F> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                (self.0)(f)
            }
        }
        FmtFn(move |f: &mut fmt::Formatter<'_>| self.fmt_dis(arg, f, ctx, false, 0, 0))
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn fmt_dis(
        &self,
        arg: OpArg,
        f: &mut fmt::Formatter<'_>,
        ctx: &impl InstrDisplayContext,
        expand_code_objects: bool,
        pad: usize,
        level: usize,
    ) -> fmt::Result {
        macro_rules! w {
            ($variant:ident) => {
                write!(f, stringify!($variant))
            };
            ($variant:ident, $map:ident = $arg_marker:expr) => {{
                let arg = $arg_marker.get(arg);
                write!(f, "{:pad$}({}, {})", stringify!($variant), arg, $map(arg))
            }};
            ($variant:ident, $arg_marker:expr) => {
                write!(f, "{:pad$}({})", stringify!($variant), $arg_marker.get(arg))
            };
            ($variant:ident, ?$arg_marker:expr) => {
                write!(
                    f,
                    "{:pad$}({:?})",
                    stringify!($variant),
                    $arg_marker.get(arg)
                )
            };
        }

        let varname = |i: u32| ctx.get_varname(i as usize);
        let name = |i: u32| ctx.get_name(i as usize);
        let cell_name = |i: u32| ctx.get_cell_name(i as usize);

        let fmt_const = |f: &mut fmt::Formatter<'_>, idx: &Arg<u32>| -> fmt::Result {
            let value = ctx.get_constant(idx.get(arg) as usize);
            match value {
                ConstantData::Code { code } if expand_code_objects => {
                    write!(f, "{:pad$}({code:?}):", "LOAD_CONST")?;
                    writeln!(f)?;
                    code.display_inner(f, true, level + 1)
                }
                c => write!(f, "{:pad$}({c})", "LOAD_CONST"),
            }
        };

        match self {
            Self::Nop => w!(NOP),
            Self::PopTop => w!(POP_TOP),
            Self::PushNull => w!(PUSH_NULL),
            Self::EndFor => w!(END_FOR),
            Self::EndSend => w!(END_SEND),
            Self::Copy { index } => w!(COPY, index),
            Self::Swap { index } => w!(SWAP, index),
            Self::LoadConst { idx } => fmt_const(f, idx),
            Self::ReturnValue => w!(RETURN_VALUE),
            Self::Resume { arg: kind } => w!(RESUME, ?kind),
            Self::LoadFast(idx) => w!(LOAD_FAST, varname = idx),
            Self::LoadFastAndClear(idx) => w!(LOAD_FAST_AND_CLEAR, varname = idx),
            Self::StoreFast(idx) => w!(STORE_FAST, varname = idx),
            Self::DeleteFast(idx) => w!(DELETE_FAST, varname = idx),
            Self::LoadDeref(idx) => w!(LOAD_DEREF, cell_name = idx),
            Self::StoreDeref(idx) => w!(STORE_DEREF, cell_name = idx),
            Self::DeleteDeref(idx) => w!(DELETE_DEREF, cell_name = idx),
            Self::LoadFromDictOrDeref(idx) => w!(LOAD_FROM_DICT_OR_DEREF, cell_name = idx),
            Self::MakeCell(idx) => w!(MAKE_CELL, cell_name = idx),
            Self::LoadName(idx) => w!(LOAD_NAME, name = idx),
            Self::StoreName(idx) => w!(STORE_NAME, name = idx),
            Self::DeleteName(idx) => w!(DELETE_NAME, name = idx),
            Self::LoadGlobal(idx) => w!(LOAD_GLOBAL, name = idx),
            Self::StoreGlobal(idx) => w!(STORE_GLOBAL, name = idx),
            Self::DeleteGlobal(idx) => w!(DELETE_GLOBAL, name = idx),
            Self::LoadFromDictOrGlobals(idx) => w!(LOAD_FROM_DICT_OR_GLOBALS, name = idx),
            Self::LoadLocals => w!(LOAD_LOCALS),
            Self::LoadAttr { idx } => {
                let attr = idx.get(arg);
                let attr_name = name(attr.name_idx());
                if attr.is_method() {
                    write!(f, "{:pad$}({}, {}, method=true)", "LOAD_ATTR", u32::from(attr), attr_name)
                } else {
                    write!(f, "{:pad$}({}, {})", "LOAD_ATTR", u32::from(attr), attr_name)
                }
            }
            Self::StoreAttr { idx } => w!(STORE_ATTR, name = idx),
            Self::DeleteAttr { idx } => w!(DELETE_ATTR, name = idx),
            Self::LoadSuperAttr { arg: idx } => {
                let attr = idx.get(arg);
                write!(
                    f,
                    "{:pad$}({}, {}, method={}, class={})",
                    "LOAD_SUPER_ATTR",
                    u32::from(attr),
                    name(attr.name_idx()),
                    attr.is_method(),
                    attr.has_class()
                )
            }
            Self::ImportName { idx } => w!(IMPORT_NAME, name = idx),
            Self::ImportFrom { idx } => w!(IMPORT_FROM, name = idx),
            Self::BinaryOp { op } => write!(f, "{:pad$}({})", "BINARY_OP", op.get(arg)),
            Self::CompareOp { op } => write!(f, "{:pad$}({})", "COMPARE_OP", op.get(arg)),
            Self::IsOp(inv) => w!(IS_OP, ?inv),
            Self::ContainsOp(inv) => w!(CONTAINS_OP, ?inv),
            Self::UnaryNegative => w!(UNARY_NEGATIVE),
            Self::UnaryNot => w!(UNARY_NOT),
            Self::UnaryInvert => w!(UNARY_INVERT),
            Self::ToBool => w!(TO_BOOL),
            Self::BinarySubscr => w!(BINARY_SUBSCR),
            Self::StoreSubscr => w!(STORE_SUBSCR),
            Self::DeleteSubscr => w!(DELETE_SUBSCR),
            Self::BinarySlice => w!(BINARY_SLICE),
            Self::StoreSlice => w!(STORE_SLICE),
            Self::BuildSlice { argc } => w!(BUILD_SLICE, argc),
            Self::BuildTuple { size } => w!(BUILD_TUPLE, size),
            Self::BuildList { size } => w!(BUILD_LIST, size),
            Self::BuildSet { size } => w!(BUILD_SET, size),
            Self::BuildMap { size } => w!(BUILD_MAP, size),
            Self::BuildString { size } => w!(BUILD_STRING, size),
            Self::ListAppend { i } => w!(LIST_APPEND, i),
            Self::SetAdd { i } => w!(SET_ADD, i),
            Self::MapAdd { i } => w!(MAP_ADD, i),
            Self::ListExtend { i } => w!(LIST_EXTEND, i),
            Self::SetUpdate { i } => w!(SET_UPDATE, i),
            Self::DictUpdate { i } => w!(DICT_UPDATE, i),
            Self::DictMerge { i } => w!(DICT_MERGE, i),
            Self::UnpackSequence { size } => w!(UNPACK_SEQUENCE, size),
            Self::UnpackEx { args } => w!(UNPACK_EX, args),
            Self::Call { nargs } => w!(CALL, nargs),
            Self::CallKw { nargs } => w!(CALL_KW, nargs),
            Self::CallFunctionEx { has_kwargs } => w!(CALL_FUNCTION_EX, has_kwargs),
            Self::CallIntrinsic1 { func } => w!(CALL_INTRINSIC_1, ?func),
            Self::CallIntrinsic2 { func } => w!(CALL_INTRINSIC_2, ?func),
            Self::MakeFunction => w!(MAKE_FUNCTION),
            Self::SetFunctionAttribute { attr } => w!(SET_FUNCTION_ATTRIBUTE, ?attr),
            Self::LoadBuildClass => w!(LOAD_BUILD_CLASS),
            Self::LoadSpecial { method } => w!(LOAD_SPECIAL, method),
            Self::LoadCommonConstant { idx } => w!(LOAD_COMMON_CONSTANT, idx),
            Self::RaiseVarargs { kind } => w!(RAISE_VARARGS, ?kind),
            Self::Reraise { depth } => w!(RERAISE, depth),
            Self::PushExcInfo => w!(PUSH_EXC_INFO),
            Self::PopExcept => w!(POP_EXCEPT),
            Self::CheckExcMatch => w!(CHECK_EXC_MATCH),
            Self::CheckEgMatch => w!(CHECK_EG_MATCH),
            Self::WithExceptStart => w!(WITH_EXCEPT_START),
            Self::CleanupThrow => w!(CLEANUP_THROW),
            Self::GetIter => w!(GET_ITER),
            Self::GetAIter => w!(GET_AITER),
            Self::GetANext => w!(GET_ANEXT),
            Self::GetYieldFromIter => w!(GET_YIELD_FROM_ITER),
            Self::GetAwaitable { kind } => w!(GET_AWAITABLE, ?kind),
            Self::YieldValue { arg: value } => w!(YIELD_VALUE, value),
            Self::ForIter { target } => w!(FOR_ITER, target),
            Self::Send { target } => w!(SEND, target),
            Self::EndAsyncFor => w!(END_ASYNC_FOR),
            Self::PopJumpIfFalse { target } => w!(POP_JUMP_IF_FALSE, target),
            Self::PopJumpIfTrue { target } => w!(POP_JUMP_IF_TRUE, target),
            Self::PopJumpIfNone { target } => w!(POP_JUMP_IF_NONE, target),
            Self::PopJumpIfNotNone { target } => w!(POP_JUMP_IF_NOT_NONE, target),
            Self::FormatSimple => w!(FORMAT_SIMPLE),
            Self::FormatWithSpec => w!(FORMAT_WITH_SPEC),
            Self::ConvertValue { oparg } => {
                write!(f, "{:pad$}({})", "CONVERT_VALUE", oparg.get(arg))
            }
            Self::MatchMapping => w!(MATCH_MAPPING),
            Self::MatchSequence => w!(MATCH_SEQUENCE),
            Self::MatchKeys => w!(MATCH_KEYS),
            Self::MatchClass { count } => w!(MATCH_CLASS, count),
            Self::GetLen => w!(GET_LEN),
            Self::SetupAnnotations => w!(SETUP_ANNOTATIONS),
            Self::Jump { target } => w!(JUMP, target),
            Self::JumpNoInterrupt { target } => w!(JUMP_NO_INTERRUPT, target),
            Self::SetupFinally { target } => w!(SETUP_FINALLY, target),
            Self::SetupCleanup { target } => w!(SETUP_CLEANUP, target),
            Self::SetupWith { target } => w!(SETUP_WITH, target),
            Self::PopBlock => w!(POP_BLOCK),
            Self::LoadClosure(idx) => w!(LOAD_CLOSURE, cell_name = idx),
            Self::StoreFastMaybeNull(idx) => w!(STORE_FAST_MAYBE_NULL, varname = idx),
        }
    }
}

/// Zero-sized marker tying an instruction field to the type of its [`OpArg`].
#[derive(Copy, Clone)]
pub struct Arg<T: OpArgType>(PhantomData<T>);

impl<T: OpArgType> Arg<T> {
    #[inline]
    #[must_use]
    pub const fn marker() -> Self {
        Self(PhantomData)
    }

    #[inline]
    pub fn new(arg: T) -> (Self, OpArg) {
        (Self(PhantomData), OpArg(arg.into()))
    }

    /// Decode `arg` as `T`.
    ///
    /// # Panics
    /// Panics if `arg` is not a valid encoding of `T`.
    #[inline(always)]
    pub fn get(self, arg: OpArg) -> T {
        match self.try_get(arg) {
            Some(value) => value,
            None => panic!("invalid oparg {} for {}", arg.0, core::any::type_name::<T>()),
        }
    }

    #[inline(always)]
    pub fn try_get(self, arg: OpArg) -> Option<T> {
        T::try_from(arg.0).ok()
    }
}

impl<T: OpArgType> PartialEq for Arg<T> {
    fn eq(&self, _: &Self) -> bool {
        true
    }
}

impl<T: OpArgType> Eq for Arg<T> {}

impl<T: OpArgType> fmt::Debug for Arg<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Arg<{}>", core::any::type_name::<T>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jumps_expose_their_label() {
        let (target, _) = Arg::new(Label(3));
        let jump = Instruction::PopJumpIfTrue { target };
        assert!(jump.label_arg().is_some());
        assert!(!jump.is_scope_exit());
        assert!(Instruction::ReturnValue.label_arg().is_none());
    }

    #[test]
    fn pseudo_ops_are_flagged() {
        assert!(Instruction::PopBlock.is_pseudo());
        assert!(!Instruction::PopTop.is_pseudo());
        let (target, _) = Arg::new(Label(0));
        assert!(Instruction::JumpNoInterrupt { target }.is_scope_exit());
    }
}
