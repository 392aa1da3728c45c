//! Expression generators.

use super::{CompileResult, Compiler, NameUsage, ToU32, emit, ruff_int_to_bigint};
use crate::{
    error::CodegenErrorType,
    symboltable::{ComprehensionKind, CompilerScope, SymbolFlags, SymbolScope},
};
use itertools::Itertools;
use num_complex::Complex64;
use pylower_compiler_core::bytecode::{
    AwaitableKind, BinaryOperator, ComparisonOperator, ConstantData, ConvertValueOparg,
    Instruction, IntrinsicFunction1, Invert, Label, LoadAttr, LoadSuperAttr, ResumeType,
};
use ruff_python_ast::{
    Arguments, BoolOp, CmpOp, ConversionFlag, DebugText, DictItem, Expr, ExprAttribute,
    ExprBoolOp, ExprCall, ExprCompare, ExprDict, ExprFString, ExprIf, ExprName, ExprNamed,
    ExprSlice, ExprStarred, ExprSubscript, ExprTuple, ExprUnaryOp, FStringPart,
    InterpolatedElement, InterpolatedStringElement, InterpolatedStringElements, Keyword, Number,
    Operator, UnaryOp,
};
use ruff_text_size::Ranged;

/// Past this many stack items, collections and calls are built incrementally.
const STACK_USE_GUIDELINE: usize = 30;

#[derive(Clone, Copy, PartialEq, Eq)]
pub(super) enum Collection {
    Tuple,
    List,
    Set,
}

/// One piece of a flattened f-string: adjacent literal parts are merged.
enum FStringPiece<'a> {
    Literal(String),
    Value {
        element: &'a InterpolatedElement,
        conversion: ConvertValueOparg,
    },
}

pub(super) fn binary_operator(op: Operator) -> BinaryOperator {
    match op {
        Operator::Add => BinaryOperator::Add,
        Operator::Sub => BinaryOperator::Subtract,
        Operator::Mult => BinaryOperator::Multiply,
        Operator::MatMult => BinaryOperator::MatrixMultiply,
        Operator::Div => BinaryOperator::TrueDivide,
        Operator::FloorDiv => BinaryOperator::FloorDivide,
        Operator::Mod => BinaryOperator::Remainder,
        Operator::Pow => BinaryOperator::Power,
        Operator::LShift => BinaryOperator::Lshift,
        Operator::RShift => BinaryOperator::Rshift,
        Operator::BitOr => BinaryOperator::Or,
        Operator::BitXor => BinaryOperator::Xor,
        Operator::BitAnd => BinaryOperator::And,
    }
}

/// Python type name of a literal, including folded constant tuples.
fn literal_type(expr: &Expr) -> Option<&'static str> {
    Some(match expr {
        Expr::NumberLiteral(number) => match number.value {
            Number::Int(_) => "int",
            Number::Float(_) => "float",
            Number::Complex { .. } => "complex",
        },
        Expr::StringLiteral(_) => "str",
        Expr::BytesLiteral(_) => "bytes",
        Expr::BooleanLiteral(_) => "bool",
        Expr::NoneLiteral(_) => "NoneType",
        Expr::EllipsisLiteral(_) => "ellipsis",
        Expr::Name(ExprName { id, .. }) if id.as_str() == "__debug__" => "bool",
        Expr::Tuple(ExprTuple { elts, .. }) if elts.iter().all(|e| literal_type(e).is_some()) => {
            "tuple"
        }
        _ => return None,
    })
}

fn infer_type(expr: &Expr) -> Option<&'static str> {
    literal_type(expr).or(match expr {
        Expr::Tuple(_) => Some("tuple"),
        Expr::List(_) | Expr::ListComp(_) => Some("list"),
        Expr::Dict(_) | Expr::DictComp(_) => Some("dict"),
        Expr::Set(_) | Expr::SetComp(_) => Some("set"),
        Expr::Generator(_) => Some("generator"),
        Expr::Lambda(_) => Some("function"),
        Expr::FString(_) => Some("str"),
        _ => None,
    })
}

/// Operands of `is` that do not trigger the literal warning.
fn check_is_arg(expr: &Expr) -> bool {
    literal_type(expr).is_none_or(|typ| matches!(typ, "NoneType" | "bool" | "ellipsis"))
}

fn has_starred(elts: &[Expr]) -> bool {
    elts.iter().any(|e| matches!(e, Expr::Starred(_)))
}

impl Compiler {
    pub(super) fn compile_expression(&mut self, expression: &Expr) -> CompileResult<()> {
        trace!("Compiling {expression:?}");
        let range = expression.range();
        self.set_source_range(range);

        match expression {
            Expr::Call(ExprCall {
                func, arguments, ..
            }) => self.compile_call(func, arguments)?,
            Expr::BoolOp(ExprBoolOp { op, values, .. }) => self.compile_bool_op(*op, values)?,
            Expr::BinOp(binop) => {
                self.compile_expression(&binop.left)?;
                self.compile_expression(&binop.right)?;
                self.set_source_range(range);
                let op = binary_operator(binop.op);
                emit!(self, Instruction::BinaryOp { op });
            }
            Expr::UnaryOp(ExprUnaryOp { op, operand, .. }) => {
                self.compile_expression(operand)?;
                self.set_source_range(range);
                match op {
                    UnaryOp::UAdd => emit!(
                        self,
                        Instruction::CallIntrinsic1 {
                            func: IntrinsicFunction1::UnaryPositive
                        }
                    ),
                    UnaryOp::USub => emit!(self, Instruction::UnaryNegative),
                    UnaryOp::Not => {
                        emit!(self, Instruction::ToBool);
                        emit!(self, Instruction::UnaryNot);
                    }
                    UnaryOp::Invert => emit!(self, Instruction::UnaryInvert),
                }
            }
            Expr::Lambda(lambda) => self.compile_lambda(lambda)?,
            Expr::If(ExprIf {
                test, body, orelse, ..
            }) => {
                let else_block = self.new_label();
                let end = self.new_label();
                self.compile_jump_if(test, false, else_block)?;
                self.compile_expression(body)?;
                emit!(self, Instruction::JumpNoInterrupt { target: end });
                self.use_label(else_block);
                self.compile_expression(orelse)?;
                self.use_label(end);
            }
            Expr::Dict(ExprDict { items, .. }) => self.compile_dict(items)?,
            Expr::Set(set) => self.starunpack_helper(&set.elts, 0, Collection::Set)?,
            Expr::List(list) => self.starunpack_helper(&list.elts, 0, Collection::List)?,
            Expr::Tuple(ExprTuple { elts, .. }) => match self.constant_value(expression) {
                Some(constant) => self.emit_load_const(constant),
                None => self.starunpack_helper(elts, 0, Collection::Tuple)?,
            },
            Expr::ListComp(comp) => self.compile_comprehension(
                ComprehensionKind::List,
                &comp.elt,
                None,
                &comp.generators,
                range,
            )?,
            Expr::SetComp(comp) => self.compile_comprehension(
                ComprehensionKind::Set,
                &comp.elt,
                None,
                &comp.generators,
                range,
            )?,
            Expr::DictComp(comp) => self.compile_comprehension(
                ComprehensionKind::Dict,
                &comp.key,
                Some(&comp.value),
                &comp.generators,
                range,
            )?,
            Expr::Generator(generator) => self.compile_comprehension(
                ComprehensionKind::Generator,
                &generator.elt,
                None,
                &generator.generators,
                range,
            )?,
            Expr::Yield(yield_expr) => {
                if !self.current_symbol_table().is_function_like() {
                    return Err(self.error(CodegenErrorType::InvalidYield));
                }
                match &yield_expr.value {
                    Some(value) => self.compile_expression(value)?,
                    None => self.emit_load_const(ConstantData::None),
                }
                self.set_source_range(range);
                self.emit_yield_value();
            }
            Expr::YieldFrom(yield_from) => {
                let table = self.current_symbol_table();
                if !table.is_function_like() {
                    return Err(self.error(CodegenErrorType::InvalidYieldFrom));
                }
                if table.typ == CompilerScope::AsyncFunction {
                    return Err(self.error(CodegenErrorType::AsyncYieldFrom));
                }
                self.compile_expression(&yield_from.value)?;
                self.set_source_range(range);
                emit!(self, Instruction::GetYieldFromIter);
                self.emit_load_const(ConstantData::None);
                self.emit_yield_from(false);
            }
            Expr::Await(await_expr) => {
                let table = self.current_symbol_table();
                if !table.is_function_like() {
                    return Err(self.error(CodegenErrorType::AwaitOutsideFunction));
                }
                if !matches!(
                    table.typ,
                    CompilerScope::AsyncFunction | CompilerScope::Comprehension
                ) {
                    return Err(self.error(CodegenErrorType::InvalidAwait));
                }
                self.compile_expression(&await_expr.value)?;
                self.set_source_range(range);
                emit!(
                    self,
                    Instruction::GetAwaitable {
                        kind: AwaitableKind::Await
                    }
                );
                self.emit_load_const(ConstantData::None);
                self.emit_yield_from(true);
            }
            Expr::Compare(compare) => self.compile_compare(compare)?,
            Expr::FString(fstring) => self.compile_fstring(fstring)?,
            Expr::TString(_) => {
                return Err(self.error(CodegenErrorType::SyntaxError(
                    "template strings are not supported".to_owned(),
                )));
            }
            Expr::StringLiteral(string) => {
                self.emit_load_const(ConstantData::str(string.value.to_str()));
            }
            Expr::BytesLiteral(bytes) => {
                let value = bytes.value.iter().flat_map(|x| x.iter().copied()).collect();
                self.emit_load_const(ConstantData::Bytes { value });
            }
            Expr::NumberLiteral(number) => match &number.value {
                Number::Int(int) => {
                    let value = ruff_int_to_bigint(int).map_err(|e| self.error(e))?;
                    self.emit_load_const(ConstantData::Integer { value });
                }
                Number::Float(value) => {
                    self.emit_load_const(ConstantData::Float { value: *value });
                }
                Number::Complex { real, imag } => {
                    self.emit_load_const(ConstantData::Complex {
                        value: Complex64::new(*real, *imag),
                    });
                }
            },
            Expr::BooleanLiteral(b) => {
                self.emit_load_const(ConstantData::Boolean { value: b.value });
            }
            Expr::NoneLiteral(_) => self.emit_load_const(ConstantData::None),
            Expr::EllipsisLiteral(_) => self.emit_load_const(ConstantData::Ellipsis),
            Expr::Attribute(attribute) => {
                let idx = self.name(attribute.attr.as_str());
                if let Some(super_call) = self.optimizable_super_call(attribute) {
                    let two_args = !super_call.arguments.args.is_empty();
                    self.load_args_for_super(super_call)?;
                    self.set_source_range(range);
                    emit!(
                        self,
                        Instruction::LoadSuperAttr {
                            arg: LoadSuperAttr::new(idx, false, two_args)
                        }
                    );
                } else {
                    self.compile_expression(&attribute.value)?;
                    self.set_source_range(range);
                    self.emit_load_attr(idx, false);
                }
            }
            Expr::Subscript(ExprSubscript { value, slice, .. }) => {
                self.compile_subscript(value, slice, NameUsage::Load)?;
            }
            Expr::Starred(_) => return Err(self.error(CodegenErrorType::InvalidStarExpr)),
            Expr::Slice(slice) => {
                let argc = self.compile_slice_bounds(slice)?;
                emit!(self, Instruction::BuildSlice { argc });
            }
            Expr::Name(ExprName { id, .. }) => self.compile_name(id.as_str(), NameUsage::Load)?,
            Expr::Named(ExprNamed { target, value, .. }) => {
                self.compile_expression(value)?;
                emit!(self, Instruction::Copy { index: 1 });
                self.compile_store(target)?;
            }
            Expr::IpyEscapeCommand(_) => {
                return Err(self.error(CodegenErrorType::SyntaxError(
                    "IPython escape commands are not Python".to_owned(),
                )));
            }
        }
        Ok(())
    }

    /// The value of `expr` if it is a compile-time constant.
    pub(super) fn constant_value(&self, expr: &Expr) -> Option<ConstantData> {
        Some(match expr {
            Expr::NoneLiteral(_) => ConstantData::None,
            Expr::EllipsisLiteral(_) => ConstantData::Ellipsis,
            Expr::BooleanLiteral(b) => ConstantData::Boolean { value: b.value },
            Expr::NumberLiteral(number) => match &number.value {
                Number::Int(int) => ConstantData::Integer {
                    value: ruff_int_to_bigint(int).ok()?,
                },
                Number::Float(value) => ConstantData::Float { value: *value },
                Number::Complex { real, imag } => ConstantData::Complex {
                    value: Complex64::new(*real, *imag),
                },
            },
            Expr::StringLiteral(string) => ConstantData::str(string.value.to_str()),
            Expr::BytesLiteral(bytes) => ConstantData::Bytes {
                value: bytes.value.iter().flat_map(|x| x.iter().copied()).collect(),
            },
            Expr::Name(ExprName { id, .. }) if id.as_str() == "__debug__" => {
                ConstantData::Boolean {
                    value: self.opts.optimize == 0,
                }
            }
            Expr::Tuple(ExprTuple { elts, .. }) => ConstantData::Tuple {
                elements: elts
                    .iter()
                    .map(|e| self.constant_value(e))
                    .collect::<Option<_>>()?,
            },
            _ => return None,
        })
    }

    // Conditions

    fn compile_bool_op(&mut self, op: BoolOp, values: &[Expr]) -> CompileResult<()> {
        let Some((last, rest)) = values.split_last() else {
            return Ok(());
        };
        let end = self.new_label();
        for value in rest {
            self.compile_expression(value)?;
            emit!(self, Instruction::Copy { index: 1 });
            emit!(self, Instruction::ToBool);
            match op {
                BoolOp::And => emit!(self, Instruction::PopJumpIfFalse { target: end }),
                BoolOp::Or => emit!(self, Instruction::PopJumpIfTrue { target: end }),
            }
            emit!(self, Instruction::PopTop);
        }
        self.compile_expression(last)?;
        self.use_label(end);
        Ok(())
    }

    /// Jump to `target` when the truth value of `expr` equals `condition`,
    /// without materializing intermediate booleans where possible.
    pub(super) fn compile_jump_if(
        &mut self,
        expr: &Expr,
        condition: bool,
        target: Label,
    ) -> CompileResult<()> {
        self.set_source_range(expr.range());
        match expr {
            Expr::UnaryOp(ExprUnaryOp {
                op: UnaryOp::Not,
                operand,
                ..
            }) => self.compile_jump_if(operand, !condition, target),
            Expr::BoolOp(ExprBoolOp { op, values, .. }) => {
                let Some((last, rest)) = values.split_last() else {
                    return Ok(());
                };
                let inner_condition = matches!(op, BoolOp::Or);
                let own_label = inner_condition != condition;
                let next = if own_label { self.new_label() } else { target };
                for value in rest {
                    self.compile_jump_if(value, inner_condition, next)?;
                }
                self.compile_jump_if(last, condition, target)?;
                if own_label {
                    self.use_label(next);
                }
                Ok(())
            }
            Expr::If(ExprIf {
                test, body, orelse, ..
            }) => {
                let end = self.new_label();
                let else_block = self.new_label();
                self.compile_jump_if(test, false, else_block)?;
                self.compile_jump_if(body, condition, target)?;
                emit!(self, Instruction::JumpNoInterrupt { target: end });
                self.use_label(else_block);
                self.compile_jump_if(orelse, condition, target)?;
                self.use_label(end);
                Ok(())
            }
            Expr::Compare(compare) if compare.ops.len() > 1 => {
                self.check_compare(compare)?;
                let range = compare.range;
                let (Some((last_op, ops)), Some((last, comparators))) =
                    (compare.ops.split_last(), compare.comparators.split_last())
                else {
                    return Ok(());
                };
                let cleanup = self.new_label();
                let end = self.new_label();
                self.compile_expression(&compare.left)?;
                for (op, comparator) in ops.iter().zip(comparators) {
                    self.compile_expression(comparator)?;
                    self.set_source_range(range);
                    emit!(self, Instruction::Swap { index: 2 });
                    emit!(self, Instruction::Copy { index: 2 });
                    self.compile_compare_op(*op);
                    emit!(self, Instruction::ToBool);
                    emit!(self, Instruction::PopJumpIfFalse { target: cleanup });
                }
                self.compile_expression(last)?;
                self.set_source_range(range);
                self.compile_compare_op(*last_op);
                emit!(self, Instruction::ToBool);
                if condition {
                    emit!(self, Instruction::PopJumpIfTrue { target });
                } else {
                    emit!(self, Instruction::PopJumpIfFalse { target });
                }
                emit!(self, Instruction::JumpNoInterrupt { target: end });
                self.use_label(cleanup);
                emit!(self, Instruction::PopTop);
                if !condition {
                    emit!(self, Instruction::JumpNoInterrupt { target });
                }
                self.use_label(end);
                Ok(())
            }
            _ => {
                self.compile_expression(expr)?;
                self.set_source_range(expr.range());
                emit!(self, Instruction::ToBool);
                if condition {
                    emit!(self, Instruction::PopJumpIfTrue { target });
                } else {
                    emit!(self, Instruction::PopJumpIfFalse { target });
                }
                Ok(())
            }
        }
    }

    fn compile_compare(&mut self, compare: &ExprCompare) -> CompileResult<()> {
        self.check_compare(compare)?;
        let range = compare.range;
        self.compile_expression(&compare.left)?;

        let (Some((last_op, ops)), Some((last, comparators))) =
            (compare.ops.split_last(), compare.comparators.split_last())
        else {
            return Ok(());
        };
        if ops.is_empty() {
            self.compile_expression(last)?;
            self.set_source_range(range);
            self.compile_compare_op(*last_op);
            return Ok(());
        }

        let cleanup = self.new_label();
        let end = self.new_label();
        for (op, comparator) in ops.iter().zip(comparators) {
            self.compile_expression(comparator)?;
            self.set_source_range(range);
            emit!(self, Instruction::Swap { index: 2 });
            emit!(self, Instruction::Copy { index: 2 });
            self.compile_compare_op(*op);
            emit!(self, Instruction::Copy { index: 1 });
            emit!(self, Instruction::ToBool);
            emit!(self, Instruction::PopJumpIfFalse { target: cleanup });
            emit!(self, Instruction::PopTop);
        }
        self.compile_expression(last)?;
        self.set_source_range(range);
        self.compile_compare_op(*last_op);
        emit!(self, Instruction::JumpNoInterrupt { target: end });
        self.use_label(cleanup);
        emit!(self, Instruction::Swap { index: 2 });
        emit!(self, Instruction::PopTop);
        self.use_label(end);
        Ok(())
    }

    fn compile_compare_op(&mut self, op: CmpOp) {
        match op {
            CmpOp::Eq => self.emit_compare(ComparisonOperator::Equal),
            CmpOp::NotEq => self.emit_compare(ComparisonOperator::NotEqual),
            CmpOp::Lt => self.emit_compare(ComparisonOperator::Less),
            CmpOp::LtE => self.emit_compare(ComparisonOperator::LessOrEqual),
            CmpOp::Gt => self.emit_compare(ComparisonOperator::Greater),
            CmpOp::GtE => self.emit_compare(ComparisonOperator::GreaterOrEqual),
            CmpOp::In => emit!(self, Instruction::ContainsOp(Invert::No)),
            CmpOp::NotIn => emit!(self, Instruction::ContainsOp(Invert::Yes)),
            CmpOp::Is => emit!(self, Instruction::IsOp(Invert::No)),
            CmpOp::IsNot => emit!(self, Instruction::IsOp(Invert::Yes)),
        }
    }

    // Suspicious-literal warnings

    fn check_compare(&mut self, compare: &ExprCompare) -> CompileResult<()> {
        let mut left: &Expr = &compare.left;
        for (op, right) in compare.ops.iter().zip(&compare.comparators) {
            if matches!(op, CmpOp::Is | CmpOp::IsNot) && !(check_is_arg(left) && check_is_arg(right))
            {
                let literal = if check_is_arg(left) { right } else { left };
                let typ = infer_type(literal).unwrap_or("object");
                let message = match op {
                    CmpOp::Is => format!("\"is\" with '{typ}' literal. Did you mean \"==\"?"),
                    _ => format!("\"is not\" with '{typ}' literal. Did you mean \"!=\"?"),
                };
                return self.warn_ranged(message, compare.range);
            }
            left = right;
        }
        Ok(())
    }

    fn check_caller(&mut self, func: &Expr) -> CompileResult<()> {
        let suspicious = literal_type(func).is_some()
            || matches!(
                func,
                Expr::Tuple(_)
                    | Expr::List(_)
                    | Expr::ListComp(_)
                    | Expr::Dict(_)
                    | Expr::DictComp(_)
                    | Expr::Set(_)
                    | Expr::SetComp(_)
                    | Expr::Generator(_)
                    | Expr::FString(_)
            );
        match infer_type(func) {
            Some(typ) if suspicious => self.warn_ranged(
                format!("'{typ}' object is not callable; perhaps you missed a comma?"),
                func.range(),
            ),
            _ => Ok(()),
        }
    }

    fn check_subscripter(&mut self, value: &Expr) -> CompileResult<()> {
        let suspicious = match literal_type(value) {
            Some(typ) => matches!(
                typ,
                "NoneType" | "ellipsis" | "int" | "bool" | "float" | "complex"
            ),
            None => matches!(
                value,
                Expr::Set(_) | Expr::SetComp(_) | Expr::Generator(_) | Expr::Lambda(_)
            ),
        };
        match infer_type(value) {
            Some(typ) if suspicious => self.warn_ranged(
                format!("'{typ}' object is not subscriptable; perhaps you missed a comma?"),
                value.range(),
            ),
            _ => Ok(()),
        }
    }

    fn check_index(&mut self, value: &Expr, index: &Expr) -> CompileResult<()> {
        let Some(index_type) = infer_type(index) else {
            return Ok(());
        };
        if matches!(index_type, "int" | "bool") {
            return Ok(());
        }
        let suspicious = match literal_type(value) {
            Some(typ) => matches!(typ, "str" | "bytes" | "tuple"),
            None => matches!(
                value,
                Expr::Tuple(_) | Expr::List(_) | Expr::ListComp(_) | Expr::FString(_)
            ),
        };
        match infer_type(value) {
            Some(typ) if suspicious => self.warn_ranged(
                format!(
                    "{typ} indices must be integers or slices, not {index_type}; \
                     perhaps you missed a comma?"
                ),
                value.range(),
            ),
            _ => Ok(()),
        }
    }

    // Collections

    /// Build a tuple, list or set from `elts` on top of `pushed` items that
    /// are already on the stack, expanding starred elements.
    pub(super) fn starunpack_helper(
        &mut self,
        elts: &[Expr],
        pushed: u32,
        collection: Collection,
    ) -> CompileResult<()> {
        let n = elts.len();
        if n > 2
            && let Some(elements) = elts
                .iter()
                .map(|e| self.constant_value(e))
                .collect::<Option<Vec<_>>>()
        {
            if collection == Collection::Tuple && pushed == 0 {
                self.emit_load_const(ConstantData::Tuple { elements });
                return Ok(());
            }
            let folded = match collection {
                Collection::Set => ConstantData::FrozenSet {
                    elements: elements.into_iter().unique().collect(),
                },
                Collection::Tuple | Collection::List => ConstantData::Tuple { elements },
            };
            self.emit_build(collection, pushed);
            self.emit_load_const(folded);
            self.emit_extend(collection);
            if collection == Collection::Tuple {
                self.emit_list_to_tuple();
            }
            return Ok(());
        }

        let size = n.to_u32() + pushed;
        let big = n + pushed as usize > STACK_USE_GUIDELINE;
        if !has_starred(elts) && !big {
            for elt in elts {
                self.compile_expression(elt)?;
            }
            match collection {
                Collection::Tuple => emit!(self, Instruction::BuildTuple { size }),
                Collection::List => emit!(self, Instruction::BuildList { size }),
                Collection::Set => emit!(self, Instruction::BuildSet { size }),
            }
            return Ok(());
        }

        let mut built = false;
        if big {
            self.emit_build(collection, pushed);
            built = true;
        }
        for (i, elt) in elts.iter().enumerate() {
            if let Expr::Starred(ExprStarred { value, .. }) = elt {
                if !built {
                    self.emit_build(collection, i.to_u32() + pushed);
                    built = true;
                }
                self.compile_expression(value)?;
                self.emit_extend(collection);
            } else {
                self.compile_expression(elt)?;
                if built {
                    match collection {
                        Collection::Tuple | Collection::List => {
                            emit!(self, Instruction::ListAppend { i: 1 })
                        }
                        Collection::Set => emit!(self, Instruction::SetAdd { i: 1 }),
                    }
                }
            }
        }
        if collection == Collection::Tuple {
            self.emit_list_to_tuple();
        }
        Ok(())
    }

    fn emit_build(&mut self, collection: Collection, size: u32) {
        match collection {
            Collection::Tuple | Collection::List => emit!(self, Instruction::BuildList { size }),
            Collection::Set => emit!(self, Instruction::BuildSet { size }),
        }
    }

    fn emit_extend(&mut self, collection: Collection) {
        match collection {
            Collection::Tuple | Collection::List => emit!(self, Instruction::ListExtend { i: 1 }),
            Collection::Set => emit!(self, Instruction::SetUpdate { i: 1 }),
        }
    }

    fn emit_list_to_tuple(&mut self) {
        emit!(
            self,
            Instruction::CallIntrinsic1 {
                func: IntrinsicFunction1::ListToTuple
            }
        );
    }

    fn compile_dict(&mut self, items: &[DictItem]) -> CompileResult<()> {
        let mut have_dict = false;
        let mut elements = 0;
        for (i, item) in items.iter().enumerate() {
            match &item.key {
                None => {
                    if elements > 0 {
                        self.compile_subdict(&items[i - elements..i])?;
                        if have_dict {
                            emit!(self, Instruction::DictUpdate { i: 1 });
                        }
                        have_dict = true;
                        elements = 0;
                    }
                    if !have_dict {
                        emit!(self, Instruction::BuildMap { size: 0 });
                        have_dict = true;
                    }
                    self.compile_expression(&item.value)?;
                    emit!(self, Instruction::DictUpdate { i: 1 });
                }
                Some(_) if elements * 2 > STACK_USE_GUIDELINE => {
                    self.compile_subdict(&items[i - elements..=i])?;
                    if have_dict {
                        emit!(self, Instruction::DictUpdate { i: 1 });
                    }
                    have_dict = true;
                    elements = 0;
                }
                Some(_) => elements += 1,
            }
        }
        if elements > 0 {
            self.compile_subdict(&items[items.len() - elements..])?;
            if have_dict {
                emit!(self, Instruction::DictUpdate { i: 1 });
            }
            have_dict = true;
        }
        if !have_dict {
            emit!(self, Instruction::BuildMap { size: 0 });
        }
        Ok(())
    }

    /// Build a dict from a run of `key: value` items.
    fn compile_subdict(&mut self, items: &[DictItem]) -> CompileResult<()> {
        let big = items.len() * 2 > STACK_USE_GUIDELINE;
        if big {
            emit!(self, Instruction::BuildMap { size: 0 });
        }
        for item in items {
            if let Some(key) = &item.key {
                self.compile_expression(key)?;
            }
            self.compile_expression(&item.value)?;
            if big {
                emit!(self, Instruction::MapAdd { i: 1 });
            }
        }
        if !big {
            emit!(
                self,
                Instruction::BuildMap {
                    size: items.len().to_u32()
                }
            );
        }
        Ok(())
    }

    // Calls

    fn compile_call(&mut self, func: &Expr, arguments: &Arguments) -> CompileResult<()> {
        self.validate_keywords(&arguments.keywords)?;
        if self.maybe_optimize_method_call(func, arguments)? {
            return Ok(());
        }
        self.check_caller(func)?;
        self.compile_expression(func)?;
        self.set_source_range(func.range());
        emit!(self, Instruction::PushNull);
        self.compile_call_helper(0, arguments)
    }

    /// Push the arguments and emit the call, with `pushed` positional
    /// arguments already on the stack.
    pub(super) fn compile_call_helper(
        &mut self,
        pushed: u32,
        arguments: &Arguments,
    ) -> CompileResult<()> {
        self.validate_keywords(&arguments.keywords)?;
        let args = &arguments.args;
        let keywords = &arguments.keywords;

        let simple = args.len() + keywords.len() * 2 <= STACK_USE_GUIDELINE
            && !has_starred(args)
            && keywords.iter().all(|k| k.arg.is_some());
        if simple {
            for arg in args {
                self.compile_expression(arg)?;
            }
            let nargs = pushed + args.len().to_u32() + keywords.len().to_u32();
            if keywords.is_empty() {
                emit!(self, Instruction::Call { nargs });
            } else {
                for keyword in keywords {
                    self.compile_expression(&keyword.value)?;
                }
                self.emit_keyword_names(keywords);
                emit!(self, Instruction::CallKw { nargs });
            }
            return Ok(());
        }

        match &**args {
            [Expr::Starred(ExprStarred { value, .. })] if pushed == 0 => {
                self.compile_expression(value)?;
            }
            _ => self.starunpack_helper(args, pushed, Collection::Tuple)?,
        }

        let mut have_dict = false;
        for (is_unpack, group) in &keywords.iter().chunk_by(|k| k.arg.is_none()) {
            let group: Vec<&Keyword> = group.collect();
            if is_unpack {
                for keyword in group {
                    if !have_dict {
                        emit!(self, Instruction::BuildMap { size: 0 });
                        have_dict = true;
                    }
                    self.compile_expression(&keyword.value)?;
                    emit!(self, Instruction::DictMerge { i: 1 });
                }
            } else {
                self.compile_subkwargs(&group)?;
                if have_dict {
                    emit!(self, Instruction::DictMerge { i: 1 });
                }
                have_dict = true;
            }
        }
        emit!(
            self,
            Instruction::CallFunctionEx {
                has_kwargs: u32::from(!keywords.is_empty())
            }
        );
        Ok(())
    }

    fn emit_keyword_names(&mut self, keywords: &[Keyword]) {
        let elements = keywords
            .iter()
            .filter_map(|k| k.arg.as_ref())
            .map(|name| ConstantData::str(name.as_str()))
            .collect();
        self.emit_load_const(ConstantData::Tuple { elements });
    }

    /// Build a dict from a run of named keyword arguments.
    fn compile_subkwargs(&mut self, keywords: &[&Keyword]) -> CompileResult<()> {
        let big = keywords.len() * 2 > STACK_USE_GUIDELINE;
        if big {
            emit!(self, Instruction::BuildMap { size: 0 });
        }
        for keyword in keywords {
            let name = keyword.arg.as_ref().map_or("", |name| name.as_str());
            self.emit_load_const(ConstantData::str(name));
            self.compile_expression(&keyword.value)?;
            if big {
                emit!(self, Instruction::MapAdd { i: 1 });
            }
        }
        if !big {
            emit!(
                self,
                Instruction::BuildMap {
                    size: keywords.len().to_u32()
                }
            );
        }
        Ok(())
    }

    fn validate_keywords(&self, keywords: &[Keyword]) -> CompileResult<()> {
        for (i, keyword) in keywords.iter().enumerate() {
            let Some(name) = &keyword.arg else { continue };
            if let Some(other) = keywords[i + 1..]
                .iter()
                .find(|other| other.arg.as_ref().is_some_and(|o| o.as_str() == name.as_str()))
            {
                return Err(self.error_ranged(
                    CodegenErrorType::RepeatedKeyword(name.to_string()),
                    other.range,
                ));
            }
        }
        Ok(())
    }

    /// Whether `expr` names something the module imports; such receivers
    /// keep the plain attribute-then-call sequence.
    fn is_import_originated(&self, expr: &Expr) -> bool {
        let Expr::Name(ExprName { id, .. }) = expr else {
            return false;
        };
        self.symbols
            .root()
            .lookup(id.as_str())
            .is_some_and(|symbol| symbol.flags.contains(SymbolFlags::IMPORTED))
    }

    /// Emit `receiver.method(args)` as a method load plus call. Returns
    /// whether the call was handled.
    fn maybe_optimize_method_call(
        &mut self,
        func: &Expr,
        arguments: &Arguments,
    ) -> CompileResult<bool> {
        let Expr::Attribute(attribute) = func else {
            return Ok(false);
        };
        let args = &arguments.args;
        let keywords = &arguments.keywords;
        if args.len() + keywords.len() + usize::from(!keywords.is_empty()) >= STACK_USE_GUIDELINE
            || has_starred(args)
            || keywords.iter().any(|k| k.arg.is_none())
            || self.is_import_originated(&attribute.value)
        {
            return Ok(false);
        }

        let idx = self.name(attribute.attr.as_str());
        if let Some(super_call) = self.optimizable_super_call(attribute) {
            let two_args = !super_call.arguments.args.is_empty();
            self.load_args_for_super(super_call)?;
            self.set_source_range(attribute.range);
            emit!(
                self,
                Instruction::LoadSuperAttr {
                    arg: LoadSuperAttr::new(idx, true, two_args)
                }
            );
        } else {
            self.compile_expression(&attribute.value)?;
            self.set_source_range(attribute.range);
            self.emit_load_attr(idx, true);
        }

        for arg in args {
            self.compile_expression(arg)?;
        }
        let nargs = args.len().to_u32() + keywords.len().to_u32();
        if keywords.is_empty() {
            emit!(self, Instruction::Call { nargs });
        } else {
            for keyword in keywords {
                self.compile_expression(&keyword.value)?;
            }
            self.emit_keyword_names(keywords);
            emit!(self, Instruction::CallKw { nargs });
        }
        Ok(true)
    }

    /// The `super(...)` call of `super(...).attr` when it can be lowered to
    /// LOAD_SUPER_ATTR: `super` must be the unshadowed builtin, and the
    /// zero-argument form needs a first argument and a `__class__` cell.
    fn optimizable_super_call<'a>(&self, attribute: &'a ExprAttribute) -> Option<&'a ExprCall> {
        let Expr::Call(call) = &*attribute.value else {
            return None;
        };
        let Expr::Name(ExprName { id, .. }) = &*call.func else {
            return None;
        };
        if id.as_str() != "super"
            || attribute.attr.as_str() == "__class__"
            || !call.arguments.keywords.is_empty()
        {
            return None;
        }
        if self.lookup_scope("super") != SymbolScope::GlobalImplicit
            || self.symbols.root().lookup("super").is_some()
        {
            return None;
        }
        match &*call.arguments.args {
            [Expr::Starred(_), _] | [_, Expr::Starred(_)] => None,
            [_, _] => Some(call),
            [] => {
                let metadata = &self.unit.metadata;
                let has_first_arg = metadata.argcount > 0 || metadata.posonlyargcount > 0;
                (has_first_arg && self.lookup_scope("__class__") == SymbolScope::Free)
                    .then_some(call)
            }
            _ => None,
        }
    }

    fn load_args_for_super(&mut self, call: &ExprCall) -> CompileResult<()> {
        self.set_source_range(call.func.range());
        self.compile_name("super", NameUsage::Load)?;
        if let [first, second] = &*call.arguments.args {
            self.compile_expression(first)?;
            self.compile_expression(second)?;
            return Ok(());
        }
        self.set_source_range(call.range);
        self.compile_name("__class__", NameUsage::Load)?;
        let first_arg = self.unit.metadata.varnames.get_index(0).cloned();
        match first_arg {
            Some(name) => self.compile_name(&name, NameUsage::Load),
            None => Err(self.error(CodegenErrorType::SyntaxError(
                "super(): no arguments".to_owned(),
            ))),
        }
    }

    pub(super) fn emit_load_attr(&mut self, idx: u32, is_method: bool) {
        emit!(
            self,
            Instruction::LoadAttr {
                idx: LoadAttr::new(idx, is_method)
            }
        );
    }

    // Subscripts

    pub(super) fn compile_subscript(
        &mut self,
        value: &Expr,
        slice: &Expr,
        usage: NameUsage,
    ) -> CompileResult<()> {
        if usage == NameUsage::Load {
            self.check_subscripter(value)?;
            self.check_index(value, slice)?;
        }
        self.compile_expression(value)?;
        let range = value.range().cover(slice.range());

        if let Expr::Slice(bounds) = slice
            && bounds.step.is_none()
            && usage != NameUsage::Delete
        {
            self.compile_slice_bounds(bounds)?;
            self.set_source_range(range);
            match usage {
                NameUsage::Load => emit!(self, Instruction::BinarySlice),
                _ => emit!(self, Instruction::StoreSlice),
            }
            return Ok(());
        }

        self.compile_expression(slice)?;
        self.set_source_range(range);
        match usage {
            NameUsage::Load => emit!(self, Instruction::BinarySubscr),
            NameUsage::Store => emit!(self, Instruction::StoreSubscr),
            NameUsage::Delete => emit!(self, Instruction::DeleteSubscr),
        }
        Ok(())
    }

    /// Push the bounds of a slice and return how many were pushed.
    pub(super) fn compile_slice_bounds(&mut self, slice: &ExprSlice) -> CompileResult<u32> {
        for bound in [&slice.lower, &slice.upper] {
            match bound {
                Some(bound) => self.compile_expression(bound)?,
                None => self.emit_load_const(ConstantData::None),
            }
        }
        if let Some(step) = &slice.step {
            self.compile_expression(step)?;
            return Ok(3);
        }
        Ok(2)
    }

    // Generators

    pub(super) fn emit_yield_value(&mut self) {
        let table = self.current_symbol_table();
        if table.is_generator && table.is_coroutine {
            emit!(
                self,
                Instruction::CallIntrinsic1 {
                    func: IntrinsicFunction1::AsyncGenWrap
                }
            );
        }
        emit!(self, Instruction::YieldValue { arg: 0 });
        emit!(
            self,
            Instruction::Resume {
                arg: ResumeType::AfterYield
            }
        );
    }

    /// Drive the iterator below the sent value until it is exhausted,
    /// leaving its return value on the stack.
    pub(super) fn emit_yield_from(&mut self, is_await: bool) {
        let send = self.new_label();
        let fail = self.new_label();
        let exit = self.new_label();

        self.use_label(send);
        emit!(self, Instruction::Send { target: exit });
        emit!(self, Instruction::SetupFinally { target: fail });
        emit!(self, Instruction::YieldValue { arg: 1 });
        emit!(self, Instruction::PopBlock);
        let arg = if is_await {
            ResumeType::AfterAwait
        } else {
            ResumeType::AfterYieldFrom
        };
        emit!(self, Instruction::Resume { arg });
        emit!(self, Instruction::JumpNoInterrupt { target: send });

        self.use_label(fail);
        emit!(self, Instruction::CleanupThrow);

        self.use_label(exit);
        emit!(self, Instruction::EndSend);
    }

    // f-strings

    fn compile_fstring(&mut self, fstring: &ExprFString) -> CompileResult<()> {
        let mut pieces = Vec::new();
        for part in &fstring.value {
            match part {
                FStringPart::Literal(literal) => push_literal(&mut pieces, &literal.value),
                FStringPart::FString(f) => self.collect_fstring_pieces(&f.elements, &mut pieces),
            }
        }
        self.compile_fstring_pieces(&pieces)
    }

    fn collect_fstring_pieces<'a>(
        &self,
        elements: &'a InterpolatedStringElements,
        pieces: &mut Vec<FStringPiece<'a>>,
    ) {
        for element in elements {
            match element {
                InterpolatedStringElement::Literal(literal) => {
                    push_literal(pieces, &literal.value);
                }
                InterpolatedStringElement::Interpolation(element) => {
                    let mut conversion = match element.conversion {
                        ConversionFlag::None => ConvertValueOparg::None,
                        ConversionFlag::Str => ConvertValueOparg::Str,
                        ConversionFlag::Repr => ConvertValueOparg::Repr,
                        ConversionFlag::Ascii => ConvertValueOparg::Ascii,
                    };
                    if let Some(DebugText { leading, trailing }) = &element.debug_text {
                        let source = self.source_file.slice(element.expression.range());
                        push_literal(pieces, &format!("{leading}{source}{trailing}"));
                        if matches!(conversion, ConvertValueOparg::None)
                            && element.format_spec.is_none()
                        {
                            conversion = ConvertValueOparg::Repr;
                        }
                    }
                    pieces.push(FStringPiece::Value {
                        element,
                        conversion,
                    });
                }
            }
        }
    }

    fn compile_fstring_pieces(&mut self, pieces: &[FStringPiece<'_>]) -> CompileResult<()> {
        if pieces.len() > STACK_USE_GUIDELINE {
            self.emit_load_const(ConstantData::str(""));
            let join = self.name_index("join");
            self.emit_load_attr(join, true);
            emit!(self, Instruction::BuildList { size: 0 });
            for piece in pieces {
                self.compile_fstring_piece(piece)?;
                emit!(self, Instruction::ListAppend { i: 1 });
            }
            emit!(self, Instruction::Call { nargs: 1 });
            return Ok(());
        }

        for piece in pieces {
            self.compile_fstring_piece(piece)?;
        }
        match pieces.len() {
            0 => self.emit_load_const(ConstantData::str("")),
            1 => {}
            n => emit!(self, Instruction::BuildString { size: n.to_u32() }),
        }
        Ok(())
    }

    fn compile_fstring_piece(&mut self, piece: &FStringPiece<'_>) -> CompileResult<()> {
        let (element, conversion) = match piece {
            FStringPiece::Literal(text) => {
                self.emit_load_const(ConstantData::str(text.as_str()));
                return Ok(());
            }
            FStringPiece::Value {
                element,
                conversion,
            } => (*element, *conversion),
        };
        self.compile_expression(&element.expression)?;
        if !matches!(conversion, ConvertValueOparg::None) {
            emit!(self, Instruction::ConvertValue { oparg: conversion });
        }
        match &element.format_spec {
            Some(spec) => {
                let mut spec_pieces = Vec::new();
                self.collect_fstring_pieces(&spec.elements, &mut spec_pieces);
                self.compile_fstring_pieces(&spec_pieces)?;
                emit!(self, Instruction::FormatWithSpec);
            }
            None => emit!(self, Instruction::FormatSimple),
        }
        Ok(())
    }
}

fn push_literal(pieces: &mut Vec<FStringPiece<'_>>, text: &str) {
    if text.is_empty() {
        return;
    }
    match pieces.last_mut() {
        Some(FStringPiece::Literal(last)) => last.push_str(text),
        _ => pieces.push(FStringPiece::Literal(text.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::error::CodegenErrorType;

    fn warnings(source: &str) -> Vec<String> {
        compile_with(source, Default::default())
            .unwrap()
            .warnings
            .into_iter()
            .map(|w| w.message)
            .collect()
    }

    #[test]
    fn short_circuit_and() {
        let code = compile("x = a and b\n");
        insta::assert_snapshot!(listing(&code), @r"
        RESUME(AtFuncStart)
        LOAD_NAME(0, a)
        COPY(1)
        TO_BOOL
        POP_JUMP_IF_FALSE(7)
        POP_TOP
        LOAD_NAME(1, b)
        STORE_NAME(2, x)
        LOAD_CONST(None)
        RETURN_VALUE
        ");
    }

    #[test]
    fn chained_comparison() {
        let code = compile("x = a < b < c\n");
        insta::assert_snapshot!(listing(&code), @r"
        RESUME(AtFuncStart)
        LOAD_NAME(0, a)
        LOAD_NAME(1, b)
        SWAP(2)
        COPY(2)
        COMPARE_OP(<)
        COPY(1)
        TO_BOOL
        POP_JUMP_IF_FALSE(13)
        POP_TOP
        LOAD_NAME(2, c)
        COMPARE_OP(<)
        JUMP_NO_INTERRUPT(15)
        SWAP(2)
        POP_TOP
        STORE_NAME(3, x)
        LOAD_CONST(None)
        RETURN_VALUE
        ");
    }

    #[test]
    fn membership_and_identity() {
        let text = listing(&compile("x = a not in b\ny = a is not None\n"));
        assert!(text.contains("CONTAINS_OP(Yes)"), "{text}");
        assert!(text.contains("IS_OP(Yes)"), "{text}");
    }

    #[test]
    fn method_call_with_keywords() {
        let code = compile("a.b(1, k=2)\n");
        insta::assert_snapshot!(listing(&code), @r#"
        RESUME(AtFuncStart)
        LOAD_NAME(0, a)
        LOAD_ATTR(3, b, method=true)
        LOAD_CONST(1)
        LOAD_CONST(2)
        LOAD_CONST(("k",))
        CALL_KW(2)
        POP_TOP
        LOAD_CONST(None)
        RETURN_VALUE
        "#);
    }

    #[test]
    fn imported_receiver_is_not_a_method_call() {
        let text = listing(&compile("import os\nos.getcwd()\n"));
        assert!(text.contains("LOAD_ATTR(2, getcwd)\nPUSH_NULL\nCALL(0)"), "{text}");
    }

    #[test]
    fn star_and_double_star_call() {
        let code = compile("f(*a, **k)\n");
        insta::assert_snapshot!(listing(&code), @r"
        RESUME(AtFuncStart)
        LOAD_NAME(0, f)
        PUSH_NULL
        LOAD_NAME(1, a)
        BUILD_MAP(0)
        LOAD_NAME(2, k)
        DICT_MERGE(1)
        CALL_FUNCTION_EX(1)
        POP_TOP
        LOAD_CONST(None)
        RETURN_VALUE
        ");
    }

    #[test]
    fn starred_argument_between_positionals() {
        let text = listing(&compile("f(1, *a, 2)\n"));
        assert!(
            text.contains(
                "LOAD_CONST(1)\nBUILD_LIST(1)\nLOAD_NAME(1, a)\nLIST_EXTEND(1)\nLOAD_CONST(2)\n\
                 LIST_APPEND(1)\nCALL_INTRINSIC_1(ListToTuple)\nCALL_FUNCTION_EX(0)"
            ),
            "{text}"
        );
    }

    #[test]
    fn named_and_unpacked_keywords_merge() {
        let text = listing(&compile("f(a=1, **k, b=2)\n"));
        assert!(
            text.contains(
                "BUILD_TUPLE(0)\nLOAD_CONST(\"a\")\nLOAD_CONST(1)\nBUILD_MAP(1)\n\
                 LOAD_NAME(1, k)\nDICT_MERGE(1)\nLOAD_CONST(\"b\")\nLOAD_CONST(2)\n\
                 BUILD_MAP(1)\nDICT_MERGE(1)\nCALL_FUNCTION_EX(1)"
            ),
            "{text}"
        );
    }

    #[test]
    fn constant_collections_are_folded() {
        let list = listing(&compile("x = [1, 2, 3]\n"));
        assert!(
            list.contains("BUILD_LIST(0)\nLOAD_CONST((1, 2, 3))\nLIST_EXTEND(1)"),
            "{list}"
        );

        let set = listing(&compile("x = {1, 2, 3, 1}\n"));
        assert!(
            set.contains("BUILD_SET(0)\nLOAD_CONST(frozenset({1, 2, 3}))\nSET_UPDATE(1)"),
            "{set}"
        );

        let tuple = listing(&compile("x = (1, (2, 'a'))\n"));
        assert!(tuple.contains("LOAD_CONST((1, (2, \"a\")))\nSTORE_NAME"), "{tuple}");

        let short = listing(&compile("x = [1, 2]\n"));
        assert!(short.contains("BUILD_LIST(2)"), "{short}");
    }

    #[test]
    fn big_list_is_built_incrementally() {
        let names = (0..31).map(|i| format!("v{i}")).collect::<Vec<_>>().join(", ");
        let text = listing(&compile(&format!("x = [{names}]\n")));
        assert!(text.contains("RESUME(AtFuncStart)\nBUILD_LIST(0)"), "{text}");
        assert_eq!(text.matches("LIST_APPEND(1)").count(), 31);
    }

    #[test]
    fn big_dict_is_split() {
        let items = (0..20).map(|i| format!("k{i}: {i}")).collect::<Vec<_>>().join(", ");
        let text = listing(&compile(&format!("x = {{{items}}}\n")));
        assert_eq!(text.matches("MAP_ADD(1)").count(), 17);
        assert!(text.contains("BUILD_MAP(3)\nDICT_UPDATE(1)"), "{text}");
    }

    #[test]
    fn dict_with_unpacking() {
        let code = compile("x = {'a': 1, **b, 'c': 2}\n");
        insta::assert_snapshot!(listing(&code), @r#"
        RESUME(AtFuncStart)
        LOAD_CONST("a")
        LOAD_CONST(1)
        BUILD_MAP(1)
        LOAD_NAME(0, b)
        DICT_UPDATE(1)
        LOAD_CONST("c")
        LOAD_CONST(2)
        BUILD_MAP(1)
        DICT_UPDATE(1)
        STORE_NAME(1, x)
        LOAD_CONST(None)
        RETURN_VALUE
        "#);
    }

    #[test]
    fn fstring_conversion_and_spec() {
        let text = listing(&compile("s = f\"{x!r:>10}\"\n"));
        assert!(
            text.contains(
                "LOAD_NAME(0, x)\nCONVERT_VALUE(2 (repr))\nLOAD_CONST(\">10\")\nFORMAT_WITH_SPEC\n\
                 STORE_NAME(1, s)"
            ),
            "{text}"
        );
    }

    #[test]
    fn fstring_debug_text_merges_with_literal() {
        let text = listing(&compile("s = f\"a{y=}\"\n"));
        assert!(
            text.contains(
                "LOAD_CONST(\"ay=\")\nLOAD_NAME(0, y)\nCONVERT_VALUE(2 (repr))\nFORMAT_SIMPLE\n\
                 BUILD_STRING(2)"
            ),
            "{text}"
        );
    }

    #[test]
    fn empty_fstring_is_empty_string() {
        let text = listing(&compile("s = f\"\"\n"));
        assert!(text.contains("LOAD_CONST(\"\")\nSTORE_NAME(0, s)"), "{text}");
    }

    #[test]
    fn suspicious_literals_warn() {
        assert_eq!(
            warnings("x is 1\n"),
            ["\"is\" with 'int' literal. Did you mean \"==\"?"]
        );
        assert_eq!(
            warnings("x is not ()\n"),
            ["\"is not\" with 'tuple' literal. Did you mean \"!=\"?"]
        );
        assert!(warnings("x is None\n").is_empty());
        assert_eq!(
            warnings("1(2)\n"),
            ["'int' object is not callable; perhaps you missed a comma?"]
        );
        assert_eq!(
            warnings("[1, 2][3, 4]\n"),
            ["list indices must be integers or slices, not tuple; perhaps you missed a comma?"]
        );
        assert_eq!(
            warnings("None[0]\n"),
            ["'NoneType' object is not subscriptable; perhaps you missed a comma?"]
        );
        assert!(warnings("[1, 2][0]\n").is_empty());
    }

    #[test]
    fn zero_argument_super_method_call() {
        let code = compile("class A(B):\n    def f(self):\n        return super().f()\n");
        let text = listing(find_code(&code, "f"));
        for expected in [
            "LOAD_GLOBAL(0, super)",
            "LOAD_DEREF(0, __class__)",
            "LOAD_FAST(0, self)",
            "LOAD_SUPER_ATTR(5, f, method=true, class=false)",
        ] {
            assert!(text.contains(expected), "{expected} missing from\n{text}");
        }
    }

    #[test]
    fn shadowed_super_is_a_plain_call() {
        let code = compile("class A(B):\n    def f(self, super):\n        return super().f()\n");
        let text = listing(find_code(&code, "f"));
        assert!(!text.contains("LOAD_SUPER_ATTR"), "{text}");
    }

    #[test]
    fn slices() {
        let text = listing(&compile("x = a[1:2]\ny = a[::2]\n"));
        assert!(text.contains("LOAD_CONST(2)\nBINARY_SLICE"), "{text}");
        assert!(
            text.contains("LOAD_CONST(None)\nLOAD_CONST(None)\nLOAD_CONST(2)\nBUILD_SLICE(3)\nBINARY_SUBSCR"),
            "{text}"
        );
    }

    #[test]
    fn await_and_yield_placement() {
        assert_eq!(compile_error("await x\n"), CodegenErrorType::AwaitOutsideFunction);
        assert_eq!(
            compile_error("def f():\n    await x\n"),
            CodegenErrorType::InvalidAwait
        );
        assert_eq!(
            compile_error("async def f():\n    yield from x\n"),
            CodegenErrorType::AsyncYieldFrom
        );
    }

    #[test]
    fn await_drives_the_awaitable() {
        let code = compile("async def f():\n    await x\n");
        let text = listing(find_code(&code, "f"));
        assert!(
            text.contains(
                "GET_AWAITABLE(Await)\nLOAD_CONST(None)\nSEND(12)\nSETUP_FINALLY(11)\n\
                 YIELD_VALUE(1)\nPOP_BLOCK\nRESUME(AfterAwait)\nJUMP_NO_INTERRUPT(5)\n\
                 CLEANUP_THROW\nEND_SEND"
            ),
            "{text}"
        );
    }

    #[test]
    fn walrus_copies_the_value() {
        let text = listing(&compile("print(y := 1)\n"));
        assert!(text.contains("LOAD_CONST(1)\nCOPY(1)\nSTORE_NAME(1, y)"), "{text}");
    }
}
