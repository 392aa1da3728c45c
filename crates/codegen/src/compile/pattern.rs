//! Structural pattern matching.
//!
//! Each pattern consumes the subject on top of the stack and either falls
//! through on success or jumps into the failure chain. Values a pattern
//! wants to bind are rotated underneath the items still owed a pop and are
//! only stored once the whole case pattern has matched.

use super::{CompileResult, Compiler, NameUsage, ToU32, emit, ruff_int_to_bigint};
use crate::{
    IndexSet,
    error::{CodegenErrorType, PatternUnreachableReason},
    unparse::UnparseExpr,
};
use malachite_bigint::BigInt;
use pylower_compiler_core::bytecode::{
    BinaryOperator, ComparisonOperator, ConstantData, Instruction, Invert, Label, UnpackExArgs,
};
use ruff_python_ast::{
    Expr, ExprBinOp, ExprNumberLiteral, ExprUnaryOp, Identifier, MatchCase, Number, Operator,
    Pattern, PatternMatchAs, PatternMatchClass, PatternMatchMapping, PatternMatchOr,
    PatternMatchSequence, PatternMatchSingleton, PatternMatchStar, PatternMatchValue, Singleton,
    UnaryOp,
};
use ruff_text_size::Ranged;

/// Bookkeeping for the pattern of one `case`.
#[derive(Debug, Clone, Default)]
struct PatternContext {
    /// Names bound so far, in the order their values sit on the stack.
    stores: Vec<String>,
    /// Whether an irrefutable pattern may appear at this position.
    allow_irrefutable: bool,
    /// `fail_pop[n]` pops `n` items and falls through to `fail_pop[n - 1]`.
    fail_pop: Vec<Label>,
    /// Items on the stack above the captured values that a failure must pop.
    on_top: usize,
}

impl PatternContext {
    fn reset(&mut self, allow_irrefutable: bool) {
        self.stores.clear();
        self.allow_irrefutable = allow_irrefutable;
        self.fail_pop.clear();
        self.on_top = 0;
    }
}

#[derive(Debug, Clone, Copy)]
enum FailJump {
    Always,
    IfFalse,
}

/// `case _:`, with neither a sub-pattern nor a name.
fn is_wildcard(pattern: &Pattern) -> bool {
    matches!(
        pattern,
        Pattern::MatchAs(PatternMatchAs {
            pattern: None,
            name: None,
            ..
        })
    )
}

fn is_star_wildcard(pattern: &Pattern) -> bool {
    matches!(pattern, Pattern::MatchStar(PatternMatchStar { name: None, .. }))
}

/// Mapping keys may be literals, negated numbers, complex literals or
/// dotted attribute lookups.
fn is_valid_mapping_key(key: &Expr) -> bool {
    match key {
        Expr::NumberLiteral(_)
        | Expr::StringLiteral(_)
        | Expr::BytesLiteral(_)
        | Expr::BooleanLiteral(_)
        | Expr::NoneLiteral(_)
        | Expr::Attribute(_) => true,
        Expr::UnaryOp(ExprUnaryOp {
            op: UnaryOp::USub,
            operand,
            ..
        }) => matches!(**operand, Expr::NumberLiteral(_)),
        Expr::BinOp(binop) => {
            is_valid_mapping_key(&binop.left)
                && matches!(
                    &*binop.right,
                    Expr::NumberLiteral(n) if matches!(n.value, Number::Complex { .. })
                )
        }
        _ => false,
    }
}

/// A literal mapping key up to Python equality, so `1`, `1.0`, `True` and
/// `1+0j` are the same key.
#[derive(Debug, PartialEq, Eq, Hash)]
enum KeyIdentity {
    None,
    Ellipsis,
    Str(String),
    Bytes(Vec<u8>),
    Int(BigInt),
    Float(u64),
    Complex(u64, u64),
}

impl KeyIdentity {
    fn from_float(value: f64) -> Self {
        // integral floats below 2**53 convert exactly
        if value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
            Self::Int(BigInt::from(value as i64))
        } else {
            Self::Float(value.to_bits())
        }
    }

    fn from_complex(real: f64, imag: f64) -> Self {
        if imag == 0.0 {
            Self::from_float(real)
        } else {
            // -0.0 + 0.0 is 0.0
            Self::Complex((real + 0.0).to_bits(), imag.to_bits())
        }
    }

    fn from_number(number: &Number, negative: bool) -> Option<Self> {
        let sign = if negative { -1.0 } else { 1.0 };
        Some(match number {
            Number::Int(int) => {
                let value = ruff_int_to_bigint(int).ok()?;
                Self::Int(if negative { -value } else { value })
            }
            Number::Float(value) => Self::from_float(sign * value),
            Number::Complex { real, imag } => Self::from_complex(sign * real, sign * imag),
        })
    }

    fn from_constant(constant: ConstantData) -> Option<Self> {
        Some(match constant {
            ConstantData::None => Self::None,
            ConstantData::Ellipsis => Self::Ellipsis,
            ConstantData::Boolean { value } => Self::Int(BigInt::from(u8::from(value))),
            ConstantData::Integer { value } => Self::Int(value),
            ConstantData::Float { value } => Self::from_float(value),
            ConstantData::Complex { value } => Self::from_complex(value.re, value.im),
            ConstantData::Str { value } => Self::Str(value),
            ConstantData::Bytes { value } => Self::Bytes(value),
            _ => return None,
        })
    }
}

/// A number literal, possibly negated.
fn signed_number(expr: &Expr) -> Option<(bool, &Number)> {
    match expr {
        Expr::NumberLiteral(ExprNumberLiteral { value, .. }) => Some((false, value)),
        Expr::UnaryOp(ExprUnaryOp {
            op: UnaryOp::USub,
            operand,
            ..
        }) => match &**operand {
            Expr::NumberLiteral(ExprNumberLiteral { value, .. }) => Some((true, value)),
            _ => None,
        },
        _ => None,
    }
}

impl Compiler {
    /// The value `key` compares equal to, if it is known before run time.
    fn mapping_key_identity(&self, key: &Expr) -> Option<KeyIdentity> {
        match key {
            Expr::UnaryOp(_) => {
                let (negative, number) = signed_number(key)?;
                KeyIdentity::from_number(number, negative)
            }
            // `1+2j`, `-1.5-2j`
            Expr::BinOp(ExprBinOp {
                left, op, right, ..
            }) => {
                let (negative, real) = signed_number(left)?;
                let real = match real {
                    Number::Int(int) => int.as_u64()? as f64,
                    Number::Float(value) => *value,
                    Number::Complex { .. } => return None,
                };
                let Expr::NumberLiteral(ExprNumberLiteral {
                    value: Number::Complex { imag, .. },
                    ..
                }) = &**right
                else {
                    return None;
                };
                let imag = match op {
                    Operator::Add => *imag,
                    Operator::Sub => -*imag,
                    _ => return None,
                };
                Some(KeyIdentity::from_complex(
                    if negative { -real } else { real },
                    imag,
                ))
            }
            _ => KeyIdentity::from_constant(self.constant_value(key)?),
        }
    }

    pub(super) fn compile_match(&mut self, subject: &Expr, cases: &[MatchCase]) -> CompileResult<()> {
        self.compile_expression(subject)?;
        let end = self.new_label();

        let has_default = cases.len() > 1 && cases.last().is_some_and(|c| is_wildcard(&c.pattern));
        let (default, cases) = match cases.split_last() {
            Some((last, rest)) if has_default => (Some(last), rest),
            _ => (None, cases),
        };
        let last_index = cases.len().saturating_sub(1);
        let arm_count = cases.len() + usize::from(default.is_some());

        let mut pc = PatternContext::default();
        for (i, case) in cases.iter().enumerate() {
            self.set_source_range(case.pattern.range());
            // the last arm consumes the subject
            if i != last_index {
                emit!(self, Instruction::Copy { index: 1_u32 });
            }
            pc.reset(case.guard.is_some() || i + 1 == arm_count);
            self.compile_pattern(&case.pattern, &mut pc)?;
            debug_assert_eq!(pc.on_top, 0);

            for name in &pc.stores {
                self.compile_name(name, NameUsage::Store)?;
            }
            if let Some(guard) = &case.guard {
                self.ensure_fail_pop(&mut pc, 0);
                self.compile_jump_if(guard, false, pc.fail_pop[0])?;
            }
            if i != last_index {
                emit!(self, Instruction::PopTop);
            }
            self.compile_statements(&case.body)?;
            emit!(self, Instruction::JumpNoInterrupt { target: end });
            self.emit_and_reset_fail_pop(&mut pc);
        }

        if let Some(case) = default {
            self.set_source_range(case.pattern.range());
            emit!(self, Instruction::Nop);
            if let Some(guard) = &case.guard {
                self.compile_jump_if(guard, false, end)?;
            }
            self.compile_statements(&case.body)?;
        }
        self.use_label(end);
        Ok(())
    }

    fn compile_pattern(&mut self, pattern: &Pattern, pc: &mut PatternContext) -> CompileResult<()> {
        self.set_source_range(pattern.range());
        match pattern {
            Pattern::MatchValue(p) => self.compile_pattern_value(p, pc),
            Pattern::MatchSingleton(p) => self.compile_pattern_singleton(p, pc),
            Pattern::MatchSequence(p) => self.compile_pattern_sequence(p, pc),
            Pattern::MatchMapping(p) => self.compile_pattern_mapping(p, pc),
            Pattern::MatchClass(p) => self.compile_pattern_class(p, pc),
            Pattern::MatchStar(p) => self.pattern_helper_store_name(p.name.as_ref(), pc),
            Pattern::MatchAs(p) => self.compile_pattern_as(p, pc),
            Pattern::MatchOr(p) => self.compile_pattern_or(p, pc),
        }
    }

    /// A nested pattern, which is always allowed to be irrefutable.
    fn compile_pattern_subpattern(
        &mut self,
        pattern: &Pattern,
        pc: &mut PatternContext,
    ) -> CompileResult<()> {
        let allow_irrefutable = pc.allow_irrefutable;
        pc.allow_irrefutable = true;
        self.compile_pattern(pattern, pc)?;
        pc.allow_irrefutable = allow_irrefutable;
        Ok(())
    }

    // Failure chain

    fn ensure_fail_pop(&mut self, pc: &mut PatternContext, n: usize) {
        while pc.fail_pop.len() <= n {
            let label = self.new_label();
            pc.fail_pop.push(label);
        }
    }

    /// Leave the pattern, popping everything the pattern has pushed so far.
    fn jump_to_fail_pop(&mut self, pc: &mut PatternContext, jump: FailJump) {
        let pops = pc.on_top + pc.stores.len();
        self.ensure_fail_pop(pc, pops);
        let target = pc.fail_pop[pops];
        match jump {
            FailJump::Always => emit!(self, Instruction::Jump { target }),
            FailJump::IfFalse => emit!(self, Instruction::PopJumpIfFalse { target }),
        }
    }

    /// Place the failure labels, deepest first, each popping one item.
    fn emit_and_reset_fail_pop(&mut self, pc: &mut PatternContext) {
        let Some((&first, rest)) = pc.fail_pop.split_first() else {
            return;
        };
        for &label in rest.iter().rev() {
            self.use_label(label);
            emit!(self, Instruction::PopTop);
        }
        self.use_label(first);
        pc.fail_pop.clear();
    }

    /// Move the top of the stack `count - 1` places down.
    fn pattern_helper_rotate(&mut self, count: usize) {
        for index in (2..=count).rev() {
            emit!(self, Instruction::Swap {
                index: index.to_u32()
            });
        }
    }

    /// Bind the value on top of the stack, or discard it for `None`.
    fn pattern_helper_store_name(
        &mut self,
        name: Option<&Identifier>,
        pc: &mut PatternContext,
    ) -> CompileResult<()> {
        let Some(name) = name else {
            emit!(self, Instruction::PopTop);
            return Ok(());
        };
        self.check_forbidden_name(name.as_str(), NameUsage::Store)?;
        if pc.stores.iter().any(|stored| stored == name.as_str()) {
            return Err(self.error_ranged(
                CodegenErrorType::DuplicateStore(name.to_string()),
                name.range(),
            ));
        }
        self.pattern_helper_rotate(pc.on_top + pc.stores.len() + 1);
        pc.stores.push(name.to_string());
        Ok(())
    }

    // Capture and wildcard

    fn compile_pattern_as(&mut self, p: &PatternMatchAs, pc: &mut PatternContext) -> CompileResult<()> {
        let Some(pattern) = &p.pattern else {
            if !pc.allow_irrefutable {
                let reason = if p.name.is_some() {
                    PatternUnreachableReason::NameCapture
                } else {
                    PatternUnreachableReason::Wildcard
                };
                return Err(self.error(CodegenErrorType::UnreachablePattern(reason)));
            }
            return self.pattern_helper_store_name(p.name.as_ref(), pc);
        };
        // keep a copy for the name while the sub-pattern consumes the other
        pc.on_top += 1;
        emit!(self, Instruction::Copy { index: 1_u32 });
        self.compile_pattern(pattern, pc)?;
        pc.on_top -= 1;
        self.pattern_helper_store_name(p.name.as_ref(), pc)
    }

    // Literals

    fn compile_pattern_value(
        &mut self,
        p: &PatternMatchValue,
        pc: &mut PatternContext,
    ) -> CompileResult<()> {
        self.compile_expression(&p.value)?;
        self.emit_compare(ComparisonOperator::Equal);
        emit!(self, Instruction::ToBool);
        self.jump_to_fail_pop(pc, FailJump::IfFalse);
        Ok(())
    }

    fn compile_pattern_singleton(
        &mut self,
        p: &PatternMatchSingleton,
        pc: &mut PatternContext,
    ) -> CompileResult<()> {
        self.emit_load_const(match p.value {
            Singleton::None => ConstantData::None,
            Singleton::True => ConstantData::Boolean { value: true },
            Singleton::False => ConstantData::Boolean { value: false },
        });
        emit!(self, Instruction::IsOp(Invert::No));
        self.jump_to_fail_pop(pc, FailJump::IfFalse);
        Ok(())
    }

    // Sequences

    fn compile_pattern_sequence(
        &mut self,
        p: &PatternMatchSequence,
        pc: &mut PatternContext,
    ) -> CompileResult<()> {
        let patterns = &p.patterns;
        let size = patterns.len();
        let mut star = None;
        let mut only_wildcard = true;
        let mut star_wildcard = false;
        for (i, pattern) in patterns.iter().enumerate() {
            if let Pattern::MatchStar(_) = pattern {
                if star.is_some() {
                    return Err(self.error(CodegenErrorType::MultipleStarredPatterns));
                }
                star = Some(i);
                star_wildcard = is_star_wildcard(pattern);
                only_wildcard &= star_wildcard;
            } else {
                only_wildcard &= is_wildcard(pattern);
            }
        }

        // the subject stays on top for the protocol and length checks
        pc.on_top += 1;
        emit!(self, Instruction::MatchSequence);
        self.jump_to_fail_pop(pc, FailJump::IfFalse);
        match star {
            None => {
                self.emit_length_check(size, ComparisonOperator::Equal);
                self.jump_to_fail_pop(pc, FailJump::IfFalse);
            }
            Some(_) if size > 1 => {
                self.emit_length_check(size - 1, ComparisonOperator::GreaterOrEqual);
                self.jump_to_fail_pop(pc, FailJump::IfFalse);
            }
            Some(_) => {}
        }
        pc.on_top -= 1;

        match star {
            _ if only_wildcard => {
                emit!(self, Instruction::PopTop);
                Ok(())
            }
            Some(star) if star_wildcard => self.pattern_helper_sequence_subscr(patterns, star, pc),
            _ => self.pattern_helper_sequence_unpack(patterns, pc),
        }
    }

    fn emit_length_check(&mut self, size: usize, op: ComparisonOperator) {
        emit!(self, Instruction::GetLen);
        self.emit_load_const(ConstantData::Integer {
            value: BigInt::from(size),
        });
        self.emit_compare(op);
    }

    fn pattern_helper_sequence_unpack(
        &mut self,
        patterns: &[Pattern],
        pc: &mut PatternContext,
    ) -> CompileResult<()> {
        self.pattern_unpack_helper(patterns)?;
        pc.on_top += patterns.len();
        for pattern in patterns {
            pc.on_top -= 1;
            self.compile_pattern_subpattern(pattern, pc)?;
        }
        Ok(())
    }

    fn pattern_unpack_helper(&mut self, patterns: &[Pattern]) -> CompileResult<()> {
        let size = patterns.len();
        match patterns.iter().position(|p| matches!(p, Pattern::MatchStar(_))) {
            None => emit!(self, Instruction::UnpackSequence {
                size: size.to_u32()
            }),
            Some(before) => {
                let after = size - before - 1;
                let (Ok(before), Ok(after)) = (u8::try_from(before), u8::try_from(after)) else {
                    return Err(self.error(CodegenErrorType::TooManySubPatterns("sequence")));
                };
                emit!(self, Instruction::UnpackEx {
                    args: UnpackExArgs { before, after }
                });
            }
        }
        Ok(())
    }

    /// Index into the subject instead of unpacking it, for patterns like
    /// `[a, *_, b]` where the starred part is thrown away.
    fn pattern_helper_sequence_subscr(
        &mut self,
        patterns: &[Pattern],
        star: usize,
        pc: &mut PatternContext,
    ) -> CompileResult<()> {
        pc.on_top += 1;
        for (i, pattern) in patterns.iter().enumerate() {
            if i == star || is_wildcard(pattern) {
                continue;
            }
            emit!(self, Instruction::Copy { index: 1_u32 });
            if i < star {
                self.emit_load_const(ConstantData::Integer {
                    value: BigInt::from(i),
                });
            } else {
                emit!(self, Instruction::GetLen);
                self.emit_load_const(ConstantData::Integer {
                    value: BigInt::from(patterns.len() - i),
                });
                emit!(self, Instruction::BinaryOp {
                    op: BinaryOperator::Subtract
                });
            }
            emit!(self, Instruction::BinarySubscr);
            self.compile_pattern_subpattern(pattern, pc)?;
        }
        pc.on_top -= 1;
        emit!(self, Instruction::PopTop);
        Ok(())
    }

    // Mappings

    fn compile_pattern_mapping(
        &mut self,
        p: &PatternMatchMapping,
        pc: &mut PatternContext,
    ) -> CompileResult<()> {
        let PatternMatchMapping {
            keys,
            patterns,
            rest,
            ..
        } = p;
        if keys.len() != patterns.len() {
            return Err(self.error(CodegenErrorType::SyntaxError(format!(
                "keys ({}) / patterns ({}) length mismatch in mapping pattern",
                keys.len(),
                patterns.len()
            ))));
        }
        let size = keys.len();

        pc.on_top += 1;
        emit!(self, Instruction::MatchMapping);
        self.jump_to_fail_pop(pc, FailJump::IfFalse);
        if size == 0 && rest.is_none() {
            // `{}` matches any mapping
            pc.on_top -= 1;
            emit!(self, Instruction::PopTop);
            return Ok(());
        }
        if size > 0 {
            self.emit_length_check(size, ComparisonOperator::GreaterOrEqual);
            self.jump_to_fail_pop(pc, FailJump::IfFalse);
        }
        let Ok(size) = u32::try_from(size) else {
            return Err(self.error(CodegenErrorType::TooManySubPatterns("mapping")));
        };

        let mut seen = IndexSet::default();
        for key in keys {
            if !is_valid_mapping_key(key) {
                return Err(self.error_ranged(CodegenErrorType::InvalidMappingKey, key.range()));
            }
            if let Some(identity) = self.mapping_key_identity(key)
                && !seen.insert(identity)
            {
                let repr = UnparseExpr::new(key, &self.source_file).to_string();
                return Err(self.error_ranged(
                    CodegenErrorType::SyntaxError(format!(
                        "mapping pattern checks duplicate key ({repr})"
                    )),
                    key.range(),
                ));
            }
            self.compile_expression(key)?;
        }
        emit!(self, Instruction::BuildTuple { size });
        // subject, keys, values or None
        emit!(self, Instruction::MatchKeys);
        pc.on_top += 2;
        emit!(self, Instruction::Copy { index: 1_u32 });
        self.emit_load_const(ConstantData::None);
        emit!(self, Instruction::IsOp(Invert::Yes));
        self.jump_to_fail_pop(pc, FailJump::IfFalse);

        emit!(self, Instruction::UnpackSequence { size });
        pc.on_top += patterns.len();
        pc.on_top -= 1;
        for pattern in patterns {
            pc.on_top -= 1;
            self.compile_pattern_subpattern(pattern, pc)?;
        }
        // the keys tuple and the subject are consumed below
        pc.on_top -= 2;

        match rest {
            Some(rest) => {
                // rest = dict(subject); del rest[k] for every matched key
                emit!(self, Instruction::BuildMap { size: 0 });
                emit!(self, Instruction::Swap { index: 3_u32 });
                emit!(self, Instruction::DictUpdate { i: 2_u32 });
                emit!(self, Instruction::UnpackSequence { size });
                for remaining in (1..=size).rev() {
                    emit!(self, Instruction::Copy {
                        index: 1 + remaining
                    });
                    emit!(self, Instruction::Swap { index: 2_u32 });
                    emit!(self, Instruction::DeleteSubscr);
                }
                self.pattern_helper_store_name(Some(rest), pc)?;
            }
            None => {
                emit!(self, Instruction::PopTop);
                emit!(self, Instruction::PopTop);
            }
        }
        Ok(())
    }

    // Classes

    fn compile_pattern_class(
        &mut self,
        p: &PatternMatchClass,
        pc: &mut PatternContext,
    ) -> CompileResult<()> {
        let positional = &p.arguments.patterns;
        let keywords = &p.arguments.keywords;
        for (i, keyword) in keywords.iter().enumerate() {
            self.check_forbidden_name(keyword.attr.as_str(), NameUsage::Store)?;
            let repeated = keywords[i + 1..]
                .iter()
                .any(|other| other.attr.as_str() == keyword.attr.as_str());
            if repeated {
                return Err(self.error_ranged(
                    CodegenErrorType::RepeatedAttributePattern(keyword.attr.to_string()),
                    keyword.attr.range(),
                ));
            }
        }
        let total = positional.len() + keywords.len();
        let (Ok(count), Ok(size)) = (u32::try_from(positional.len()), u32::try_from(total)) else {
            return Err(self.error(CodegenErrorType::TooManySubPatterns("class")));
        };

        self.compile_expression(&p.cls)?;
        self.emit_load_const(ConstantData::Tuple {
            elements: keywords
                .iter()
                .map(|keyword| ConstantData::str(keyword.attr.as_str()))
                .collect(),
        });
        // subject, class, names -> attribute tuple or None
        emit!(self, Instruction::MatchClass { count });
        emit!(self, Instruction::Copy { index: 1_u32 });
        self.emit_load_const(ConstantData::None);
        emit!(self, Instruction::IsOp(Invert::Yes));
        pc.on_top += 1;
        self.jump_to_fail_pop(pc, FailJump::IfFalse);

        emit!(self, Instruction::UnpackSequence { size });
        pc.on_top += total;
        pc.on_top -= 1;
        let subpatterns = positional
            .iter()
            .chain(keywords.iter().map(|keyword| &keyword.pattern));
        for pattern in subpatterns {
            pc.on_top -= 1;
            if is_wildcard(pattern) {
                emit!(self, Instruction::PopTop);
                continue;
            }
            self.compile_pattern_subpattern(pattern, pc)?;
        }
        Ok(())
    }

    // Alternatives

    fn compile_pattern_or(&mut self, p: &PatternMatchOr, pc: &mut PatternContext) -> CompileResult<()> {
        let end = self.new_label();
        let outer = pc.clone();
        // names bound by the first alternative, in their stack order
        let mut control: Option<Vec<String>> = None;

        for (i, alternative) in p.patterns.iter().enumerate() {
            pc.reset(i + 1 == p.patterns.len() && outer.allow_irrefutable);
            emit!(self, Instruction::Copy { index: 1_u32 });
            self.compile_pattern(alternative, pc)?;

            match &control {
                None => control = Some(pc.stores.clone()),
                Some(control) => self.align_alternative_stores(control, pc)?,
            }
            emit!(self, Instruction::Jump { target: end });
            self.emit_and_reset_fail_pop(pc);
        }

        // no alternative matched
        *pc = outer;
        emit!(self, Instruction::PopTop);
        self.jump_to_fail_pop(pc, FailJump::Always);

        self.use_label(end);
        let control = control.unwrap_or_default();
        let rotations = control.len() + 1 + pc.on_top + pc.stores.len();
        for name in control {
            self.pattern_helper_rotate(rotations);
            if pc.stores.contains(&name) {
                return Err(self.error(CodegenErrorType::DuplicateStore(name)));
            }
            pc.stores.push(name);
        }
        // the copy of the subject
        emit!(self, Instruction::PopTop);
        Ok(())
    }

    /// Check that an alternative binds exactly the names of the first one
    /// and rotate its captured values into the same order.
    fn align_alternative_stores(
        &mut self,
        control: &[String],
        pc: &mut PatternContext,
    ) -> CompileResult<()> {
        if pc.stores.len() != control.len() {
            return Err(self.error(CodegenErrorType::ConflictingNameBindPattern));
        }
        for (i_control, name) in control.iter().enumerate().rev() {
            let Some(i_stores) = pc.stores.iter().position(|stored| stored == name) else {
                return Err(self.error(CodegenErrorType::ConflictingNameBindPattern));
            };
            if i_control == i_stores {
                continue;
            }
            // everything after i_control is already in place
            debug_assert!(i_stores < i_control);
            let rotated: Vec<_> = pc.stores.drain(..=i_stores).collect();
            let at = i_control - i_stores;
            pc.stores.splice(at..at, rotated);
            for _ in 0..=i_stores {
                self.pattern_helper_rotate(i_control + 1);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn literal_case_with_default() {
        let code = compile("match x:\n    case 1:\n        y = 1\n    case _:\n        y = 2\n");
        insta::assert_snapshot!(listing(&code), @r"
        RESUME(AtFuncStart)
        LOAD_NAME(0, x)
        LOAD_CONST(1)
        COMPARE_OP(==)
        TO_BOOL
        POP_JUMP_IF_FALSE(9)
        LOAD_CONST(1)
        STORE_NAME(1, y)
        JUMP_NO_INTERRUPT(12)
        NOP
        LOAD_CONST(2)
        STORE_NAME(1, y)
        LOAD_CONST(None)
        RETURN_VALUE
        ");
    }

    #[test]
    fn value_comparison_is_converted_to_bool() {
        let code = compile("match c:\n    case Color.RED:\n        pass\n    case [1, *_]:\n        pass\n");
        let text = listing(&code);
        assert_eq!(text.matches("COMPARE_OP(==)\nTO_BOOL\nPOP_JUMP_IF_FALSE").count(), 2, "{text}");
        // length checks compare ints and jump directly
        assert!(text.contains("COMPARE_OP(>=)\nPOP_JUMP_IF_FALSE"), "{text}");
        assert_eq!(text.matches("TO_BOOL").count(), 2, "{text}");
    }

    #[test]
    fn tuple_cases_copy_the_subject_until_the_last() {
        let code = compile("match p:\n    case (0, 0):\n        a\n    case (x, y):\n        b\n");
        let text = listing(&code);
        assert_eq!(text.matches("COPY(1)").count(), 1);
        assert_eq!(text.matches("MATCH_SEQUENCE").count(), 2);
        assert!(text.contains("UNPACK_SEQUENCE(2)"));
        // both captures are stored together, after the whole pattern
        let store_x = text.find("STORE_NAME(2, x)").unwrap();
        let store_y = text.find("STORE_NAME(3, y)").unwrap();
        let last_check = text.rfind("POP_JUMP_IF_FALSE").unwrap();
        assert!(last_check < store_x && last_check < store_y);
    }

    #[test]
    fn star_capture_unpacks() {
        let code = compile("match v:\n    case [a, *rest]:\n        pass\n");
        let text = listing(&code);
        assert!(text.contains("COMPARE_OP(>=)"));
        assert!(text.contains("UNPACK_EX(before: 1, after: 0)"));
        assert!(text.contains("STORE_NAME(1, a)"));
        assert!(text.contains("STORE_NAME(2, rest)"));
    }

    #[test]
    fn star_wildcard_uses_subscripts() {
        let code = compile("match v:\n    case [a, *_, b]:\n        pass\n");
        let text = listing(&code);
        assert!(!text.contains("UNPACK_EX"));
        assert_eq!(text.matches("BINARY_SUBSCR").count(), 2);
        assert!(text.contains("BINARY_OP(-)"));
    }

    #[test]
    fn all_wildcard_sequence_only_checks_length() {
        let code = compile("match v:\n    case [_, _]:\n        pass\n");
        let text = listing(&code);
        assert!(text.contains("GET_LEN"));
        assert!(!text.contains("UNPACK_SEQUENCE"));
    }

    #[test]
    fn mapping_with_rest() {
        let code = compile("match m:\n    case {'k': v, **rest}:\n        pass\n");
        let text = listing(&code);
        for op in ["MATCH_MAPPING", "MATCH_KEYS", "DICT_UPDATE(2)", "DELETE_SUBSCR"] {
            assert!(text.contains(op), "missing {op}");
        }
        assert!(text.contains("STORE_NAME(1, v)"));
        assert!(text.contains("STORE_NAME(2, rest)"));
    }

    #[test]
    fn empty_mapping_pattern() {
        let code = compile("match m:\n    case {}:\n        pass\n");
        let text = listing(&code);
        assert!(text.contains("MATCH_MAPPING"));
        assert!(!text.contains("MATCH_KEYS"));
    }

    #[test]
    fn mapping_keys_must_be_literals() {
        assert_eq!(
            compile_error("match m:\n    case {f(): 1}:\n        pass\n"),
            CodegenErrorType::InvalidMappingKey
        );
    }

    #[test]
    fn duplicate_mapping_key() {
        let err = compile_error("match m:\n    case {'a': 1, 'a': 2}:\n        pass\n");
        assert!(
            matches!(&err, CodegenErrorType::SyntaxError(msg) if msg.contains("duplicate key")),
            "{err:?}"
        );
    }

    #[test]
    fn mapping_keys_compare_like_python_values() {
        for keys in [
            "1: a, True: b",
            "1: a, 1.0: b",
            "-1: a, -1: b",
            "0: a, -0.0: b",
            "1+2j: a, 1.0+2j: b",
            "-2j: a, -0-2j: b",
            "3: a, 3+0j: b",
        ] {
            let source = format!("match m:\n    case {{{keys}}}:\n        pass\n");
            let err = compile_error(&source);
            assert!(
                matches!(&err, CodegenErrorType::SyntaxError(msg) if msg.contains("duplicate key")),
                "{keys}: {err:?}"
            );
        }
        for keys in [
            "1: a, -1: b",
            "'1': a, 1: b",
            "1j: a, 1: b",
            "b'a': a, 'a': b",
            "1.5: a, 1: b",
            "None: a, False: b",
            "C.x: a, C.x: b",
        ] {
            compile(&format!("match m:\n    case {{{keys}}}:\n        pass\n"));
        }
    }

    #[test]
    fn class_pattern_with_keywords() {
        let code = compile("match p:\n    case Point(0, y=yy):\n        pass\n");
        let text = listing(&code);
        assert!(text.contains(r#"LOAD_CONST(("y",))"#));
        assert!(text.contains("MATCH_CLASS(1)"));
        assert!(text.contains("STORE_NAME(2, yy)"));
    }

    #[test]
    fn repeated_class_attribute() {
        assert_eq!(
            compile_error("match p:\n    case C(x=1, x=2):\n        pass\n"),
            CodegenErrorType::RepeatedAttributePattern("x".to_owned())
        );
    }

    #[test]
    fn singletons_compare_by_identity() {
        let code = compile("match v:\n    case None:\n        pass\n");
        assert!(listing(&code).contains("IS_OP(No)"));
    }

    #[test]
    fn alternatives_must_bind_the_same_names() {
        assert_eq!(
            compile_error("match v:\n    case [x] | (y, 1):\n        pass\n"),
            CodegenErrorType::ConflictingNameBindPattern
        );
    }

    #[test]
    fn alternatives_are_reordered() {
        let code = compile("match v:\n    case (a, b) | [b, a]:\n        pass\n");
        let text = listing(&code);
        assert!(text.contains("STORE_NAME(1, a)"));
        assert!(text.contains("STORE_NAME(2, b)"));
    }

    #[test]
    fn duplicate_capture() {
        assert_eq!(
            compile_error("match v:\n    case [x, x]:\n        pass\n"),
            CodegenErrorType::DuplicateStore("x".to_owned())
        );
    }

    #[test]
    fn irrefutable_case_must_be_last() {
        assert_eq!(
            compile_error("match v:\n    case x:\n        pass\n    case 1:\n        pass\n"),
            CodegenErrorType::UnreachablePattern(PatternUnreachableReason::NameCapture)
        );
        assert_eq!(
            compile_error("match v:\n    case _:\n        pass\n    case 1:\n        pass\n"),
            CodegenErrorType::UnreachablePattern(PatternUnreachableReason::Wildcard)
        );
    }

    #[test]
    fn guarded_capture_may_come_first() {
        let code = compile("match v:\n    case x if x > 0:\n        pass\n    case _:\n        pass\n");
        let text = listing(&code);
        let store = text.find("STORE_NAME(1, x)").unwrap();
        let guard = text.find("COMPARE_OP(>)").unwrap();
        assert!(store < guard);
    }

    #[test]
    fn as_pattern_binds_the_subject() {
        let code = compile("match v:\n    case [1] as whole:\n        pass\n");
        assert!(listing(&code).contains("STORE_NAME(1, whole)"));
    }

    #[test]
    fn cannot_capture_debug() {
        let err = compile_error("match v:\n    case [__debug__]:\n        pass\n");
        assert_eq!(err.to_string(), "cannot assign to __debug__");
    }
}
