//! Render expressions back to Python source.
//!
//! Used for postponed annotations (`from __future__ import annotations`)
//! and for quoting expressions in diagnostics. Output follows CPython's
//! `ast.unparse` closely enough that annotation strings compare equal.

use alloc::fmt::{self, Write as _};
use pylower_compiler_core::SourceFile;
use ruff_python_ast as ast;
use ruff_text_size::Ranged;

/// Binding strength, loosest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    Tuple,
    Test,
    Or,
    And,
    Not,
    Cmp,
    BitOr,
    BitXor,
    BitAnd,
    Shift,
    Arith,
    Term,
    Factor,
    Power,
    Await,
    Atom,
}

impl Precedence {
    /// A plain expression, as allowed after `*` or `**`.
    const EXPR: Self = Self::BitOr;

    const fn next(self) -> Self {
        match self {
            Self::Tuple => Self::Test,
            Self::Test => Self::Or,
            Self::Or => Self::And,
            Self::And => Self::Not,
            Self::Not => Self::Cmp,
            Self::Cmp => Self::BitOr,
            Self::BitOr => Self::BitXor,
            Self::BitXor => Self::BitAnd,
            Self::BitAnd => Self::Shift,
            Self::Shift => Self::Arith,
            Self::Arith => Self::Term,
            Self::Term => Self::Factor,
            Self::Factor => Self::Power,
            Self::Power => Self::Await,
            Self::Await | Self::Atom => Self::Atom,
        }
    }
}

const fn binary_operator(op: ast::Operator) -> (&'static str, Precedence) {
    use Precedence::*;
    use ast::Operator;
    match op {
        Operator::Add => (" + ", Arith),
        Operator::Sub => (" - ", Arith),
        Operator::Mult => (" * ", Term),
        Operator::MatMult => (" @ ", Term),
        Operator::Div => (" / ", Term),
        Operator::Mod => (" % ", Term),
        Operator::FloorDiv => (" // ", Term),
        Operator::Pow => (" ** ", Power),
        Operator::LShift => (" << ", Shift),
        Operator::RShift => (" >> ", Shift),
        Operator::BitOr => (" | ", BitOr),
        Operator::BitXor => (" ^ ", BitXor),
        Operator::BitAnd => (" & ", BitAnd),
    }
}

struct Unparser<'s, W> {
    out: W,
    source: &'s SourceFile,
}

impl<'s, W: fmt::Write> Unparser<'s, W> {
    const fn new(out: W, source: &'s SourceFile) -> Self {
        Self { out, source }
    }

    fn p(&mut self, s: &str) -> fmt::Result {
        self.out.write_str(s)
    }

    fn p_if(&mut self, cond: bool, s: &str) -> fmt::Result {
        if cond { self.p(s) } else { Ok(()) }
    }

    /// Write `sep` before every item but the first.
    fn p_delim(&mut self, first: &mut bool, sep: &str) -> fmt::Result {
        self.p_if(!core::mem::take(first), sep)
    }

    fn grouped(
        &mut self,
        level: Precedence,
        own: Precedence,
        body: impl FnOnce(&mut Self) -> fmt::Result,
    ) -> fmt::Result {
        let group = level > own;
        self.p_if(group, "(")?;
        body(self)?;
        self.p_if(group, ")")
    }

    fn expr_list(&mut self, elts: &[ast::Expr]) -> fmt::Result {
        let mut first = true;
        for elt in elts {
            self.p_delim(&mut first, ", ")?;
            self.unparse_expr(elt, Precedence::Test)?;
        }
        Ok(())
    }

    fn unparse_expr(&mut self, expr: &ast::Expr, level: Precedence) -> fmt::Result {
        use ast::Expr;
        match expr {
            Expr::BoolOp(ast::ExprBoolOp { op, values, .. }) => {
                let (sep, own) = match op {
                    ast::BoolOp::And => (" and ", Precedence::And),
                    ast::BoolOp::Or => (" or ", Precedence::Or),
                };
                self.grouped(level, own, |u| {
                    let mut first = true;
                    for value in values {
                        u.p_delim(&mut first, sep)?;
                        u.unparse_expr(value, own.next())?;
                    }
                    Ok(())
                })
            }
            Expr::Named(ast::ExprNamed { target, value, .. }) => {
                self.grouped(level, Precedence::Tuple, |u| {
                    u.unparse_expr(target, Precedence::Atom)?;
                    u.p(" := ")?;
                    u.unparse_expr(value, Precedence::Atom)
                })
            }
            Expr::BinOp(ast::ExprBinOp {
                left, op, right, ..
            }) => {
                let (symbol, own) = binary_operator(*op);
                // `**` groups to the right, everything else to the left
                let (left_level, right_level) = if matches!(op, ast::Operator::Pow) {
                    (own.next(), own)
                } else {
                    (own, own.next())
                };
                self.grouped(level, own, |u| {
                    u.unparse_expr(left, left_level)?;
                    u.p(symbol)?;
                    u.unparse_expr(right, right_level)
                })
            }
            Expr::UnaryOp(ast::ExprUnaryOp { op, operand, .. }) => {
                let (symbol, own) = match op {
                    ast::UnaryOp::Invert => ("~", Precedence::Factor),
                    ast::UnaryOp::Not => ("not ", Precedence::Not),
                    ast::UnaryOp::UAdd => ("+", Precedence::Factor),
                    ast::UnaryOp::USub => ("-", Precedence::Factor),
                };
                self.grouped(level, own, |u| {
                    u.p(symbol)?;
                    u.unparse_expr(operand, own)
                })
            }
            Expr::Lambda(ast::ExprLambda {
                parameters, body, ..
            }) => self.grouped(level, Precedence::Test, |u| {
                match parameters {
                    Some(parameters) => {
                        u.p("lambda ")?;
                        u.unparse_parameters(parameters)?;
                    }
                    None => u.p("lambda")?,
                }
                u.p(": ")?;
                u.unparse_expr(body, Precedence::Test)
            }),
            Expr::If(ast::ExprIf {
                test, body, orelse, ..
            }) => self.grouped(level, Precedence::Test, |u| {
                u.unparse_expr(body, Precedence::Test.next())?;
                u.p(" if ")?;
                u.unparse_expr(test, Precedence::Test.next())?;
                u.p(" else ")?;
                u.unparse_expr(orelse, Precedence::Test)
            }),
            Expr::Dict(ast::ExprDict { items, .. }) => {
                self.p("{")?;
                let mut first = true;
                for item in items {
                    self.p_delim(&mut first, ", ")?;
                    match &item.key {
                        Some(key) => {
                            self.unparse_expr(key, Precedence::Test)?;
                            self.p(": ")?;
                            self.unparse_expr(&item.value, Precedence::Test)?;
                        }
                        None => {
                            self.p("**")?;
                            self.unparse_expr(&item.value, Precedence::EXPR)?;
                        }
                    }
                }
                self.p("}")
            }
            Expr::Set(ast::ExprSet { elts, .. }) => {
                self.p("{")?;
                self.expr_list(elts)?;
                self.p("}")
            }
            Expr::ListComp(ast::ExprListComp {
                elt, generators, ..
            }) => {
                self.p("[")?;
                self.unparse_expr(elt, Precedence::Test)?;
                self.unparse_comprehension(generators)?;
                self.p("]")
            }
            Expr::SetComp(ast::ExprSetComp {
                elt, generators, ..
            }) => {
                self.p("{")?;
                self.unparse_expr(elt, Precedence::Test)?;
                self.unparse_comprehension(generators)?;
                self.p("}")
            }
            Expr::DictComp(ast::ExprDictComp {
                key,
                value,
                generators,
                ..
            }) => {
                self.p("{")?;
                self.unparse_expr(key, Precedence::Test)?;
                self.p(": ")?;
                self.unparse_expr(value, Precedence::Test)?;
                self.unparse_comprehension(generators)?;
                self.p("}")
            }
            Expr::Generator(ast::ExprGenerator {
                elt, generators, ..
            }) => {
                self.p("(")?;
                self.unparse_expr(elt, Precedence::Test)?;
                self.unparse_comprehension(generators)?;
                self.p(")")
            }
            Expr::Await(ast::ExprAwait { value, .. }) => {
                self.grouped(level, Precedence::Await, |u| {
                    u.p("await ")?;
                    u.unparse_expr(value, Precedence::Atom)
                })
            }
            Expr::Yield(ast::ExprYield { value, .. }) => match value {
                Some(value) => {
                    self.p("(yield ")?;
                    self.unparse_expr(value, Precedence::Test)?;
                    self.p(")")
                }
                None => self.p("(yield)"),
            },
            Expr::YieldFrom(ast::ExprYieldFrom { value, .. }) => {
                self.p("(yield from ")?;
                self.unparse_expr(value, Precedence::Test)?;
                self.p(")")
            }
            Expr::Compare(ast::ExprCompare {
                left,
                ops,
                comparators,
                ..
            }) => self.grouped(level, Precedence::Cmp, |u| {
                let operand = Precedence::Cmp.next();
                u.unparse_expr(left, operand)?;
                for (op, comparator) in ops.iter().zip(comparators) {
                    write!(u.out, " {} ", op.as_str())?;
                    u.unparse_expr(comparator, operand)?;
                }
                Ok(())
            }),
            Expr::Call(ast::ExprCall {
                func, arguments, ..
            }) => {
                self.unparse_expr(func, Precedence::Atom)?;
                self.p("(")?;
                self.unparse_call_arguments(arguments)?;
                self.p(")")
            }
            Expr::FString(ast::ExprFString { value, .. }) => {
                let mut body = String::new();
                for part in value.iter() {
                    match part {
                        ast::FStringPart::Literal(literal) => body.push_str(&literal.value),
                        ast::FStringPart::FString(fstring) => {
                            Unparser::new(&mut body, self.source)
                                .unparse_interpolated(&fstring.elements)?;
                        }
                    }
                }
                self.p("f")?;
                self.p(&str_repr(&body))
            }
            Expr::TString(ast::ExprTString { value, .. }) => {
                let mut body = String::new();
                for tstring in value.iter() {
                    Unparser::new(&mut body, self.source)
                        .unparse_interpolated(&tstring.elements)?;
                }
                self.p("t")?;
                self.p(&str_repr(&body))
            }
            Expr::StringLiteral(ast::ExprStringLiteral { value, .. }) => {
                self.p_if(value.is_unicode(), "u")?;
                self.p(&str_repr(value.to_str()))
            }
            Expr::BytesLiteral(ast::ExprBytesLiteral { value, .. }) => {
                let bytes: Vec<u8> = value.bytes().collect();
                self.p(&bytes_repr(&bytes))
            }
            Expr::NumberLiteral(ast::ExprNumberLiteral { value, .. }) => match value {
                ast::Number::Int(int) => write!(self.out, "{int}"),
                ast::Number::Float(value) => self.p(&float_literal(*value)),
                ast::Number::Complex { real, imag } => self.p(&complex_literal(*real, *imag)),
            },
            Expr::BooleanLiteral(ast::ExprBooleanLiteral { value, .. }) => {
                self.p(if *value { "True" } else { "False" })
            }
            Expr::NoneLiteral(_) => self.p("None"),
            Expr::EllipsisLiteral(_) => self.p("..."),
            Expr::Attribute(ast::ExprAttribute { value, attr, .. }) => {
                self.unparse_expr(value, Precedence::Atom)?;
                // `1 .real`, since `1.real` would lex as a float
                let is_int = matches!(
                    &**value,
                    Expr::NumberLiteral(ast::ExprNumberLiteral {
                        value: ast::Number::Int(_),
                        ..
                    })
                );
                self.p(if is_int { " ." } else { "." })?;
                self.p(attr.as_str())
            }
            Expr::Subscript(ast::ExprSubscript { value, slice, .. }) => {
                self.unparse_expr(value, Precedence::Atom)?;
                self.p("[")?;
                match &**slice {
                    // `x[a, b]` rather than `x[(a, b)]`
                    Expr::Tuple(ast::ExprTuple { elts, .. }) if !elts.is_empty() => {
                        self.expr_list(elts)?;
                        self.p_if(elts.len() == 1, ",")?;
                    }
                    slice => self.unparse_expr(slice, Precedence::Tuple)?,
                }
                self.p("]")
            }
            Expr::Starred(ast::ExprStarred { value, .. }) => {
                self.p("*")?;
                self.unparse_expr(value, Precedence::EXPR)
            }
            Expr::Name(ast::ExprName { id, .. }) => self.p(id.as_str()),
            Expr::List(ast::ExprList { elts, .. }) => {
                self.p("[")?;
                self.expr_list(elts)?;
                self.p("]")
            }
            Expr::Tuple(ast::ExprTuple { elts, .. }) if elts.is_empty() => self.p("()"),
            Expr::Tuple(ast::ExprTuple { elts, .. }) => {
                self.grouped(level, Precedence::Tuple, |u| {
                    u.expr_list(elts)?;
                    u.p_if(elts.len() == 1, ",")
                })
            }
            Expr::Slice(ast::ExprSlice {
                lower, upper, step, ..
            }) => {
                if let Some(lower) = lower {
                    self.unparse_expr(lower, Precedence::Test)?;
                }
                self.p(":")?;
                if let Some(upper) = upper {
                    self.unparse_expr(upper, Precedence::Test)?;
                }
                if let Some(step) = step {
                    self.p(":")?;
                    self.unparse_expr(step, Precedence::Test)?;
                }
                Ok(())
            }
            Expr::IpyEscapeCommand(_) => Ok(()),
        }
    }

    fn unparse_call_arguments(&mut self, arguments: &ast::Arguments) -> fmt::Result {
        // a lone generator argument keeps the call's parentheses
        if let ([ast::Expr::Generator(generator)], []) =
            (&*arguments.args, &*arguments.keywords)
        {
            self.unparse_expr(&generator.elt, Precedence::Test)?;
            return self.unparse_comprehension(&generator.generators);
        }
        let mut first = true;
        for arg in &arguments.args {
            self.p_delim(&mut first, ", ")?;
            self.unparse_expr(arg, Precedence::Test)?;
        }
        for keyword in &arguments.keywords {
            self.p_delim(&mut first, ", ")?;
            match &keyword.arg {
                Some(arg) => write!(self.out, "{}=", arg.as_str())?,
                None => self.p("**")?,
            }
            self.unparse_expr(&keyword.value, Precedence::Test)?;
        }
        Ok(())
    }

    fn unparse_parameters(&mut self, parameters: &ast::Parameters) -> fmt::Result {
        let mut first = true;
        let positional = parameters.posonlyargs.iter().chain(&parameters.args);
        for (i, parameter) in positional.enumerate() {
            self.p_delim(&mut first, ", ")?;
            self.unparse_parameter_with_default(parameter)?;
            self.p_if(i + 1 == parameters.posonlyargs.len(), ", /")?;
        }
        if parameters.vararg.is_some() || !parameters.kwonlyargs.is_empty() {
            self.p_delim(&mut first, ", ")?;
            self.p("*")?;
        }
        if let Some(vararg) = &parameters.vararg {
            self.unparse_parameter(vararg)?;
        }
        for parameter in &parameters.kwonlyargs {
            self.p_delim(&mut first, ", ")?;
            self.unparse_parameter_with_default(parameter)?;
        }
        if let Some(kwarg) = &parameters.kwarg {
            self.p_delim(&mut first, ", ")?;
            self.p("**")?;
            self.unparse_parameter(kwarg)?;
        }
        Ok(())
    }

    fn unparse_parameter_with_default(&mut self, parameter: &ast::ParameterWithDefault) -> fmt::Result {
        self.unparse_parameter(&parameter.parameter)?;
        if let Some(default) = &parameter.default {
            self.p("=")?;
            self.unparse_expr(default, Precedence::Test)?;
        }
        Ok(())
    }

    fn unparse_parameter(&mut self, parameter: &ast::Parameter) -> fmt::Result {
        self.p(parameter.name.as_str())?;
        if let Some(annotation) = &parameter.annotation {
            self.p(": ")?;
            self.unparse_expr(annotation, Precedence::Test)?;
        }
        Ok(())
    }

    fn unparse_comprehension(&mut self, generators: &[ast::Comprehension]) -> fmt::Result {
        for generator in generators {
            self.p(if generator.is_async {
                " async for "
            } else {
                " for "
            })?;
            self.unparse_expr(&generator.target, Precedence::Tuple)?;
            self.p(" in ")?;
            self.unparse_expr(&generator.iter, Precedence::Test.next())?;
            for condition in &generator.ifs {
                self.p(" if ")?;
                self.unparse_expr(condition, Precedence::Test.next())?;
            }
        }
        Ok(())
    }

    /// The inside of an f-string or t-string, without prefix or quotes.
    fn unparse_interpolated(&mut self, elements: &[ast::InterpolatedStringElement]) -> fmt::Result {
        for element in elements {
            match element {
                ast::InterpolatedStringElement::Literal(literal) => {
                    self.p(&literal.value.replace('{', "{{").replace('}', "}}"))?;
                }
                ast::InterpolatedStringElement::Interpolation(interpolation) => {
                    self.unparse_interpolation(interpolation)?;
                }
            }
        }
        Ok(())
    }

    fn unparse_interpolation(&mut self, element: &ast::InterpolatedElement) -> fmt::Result {
        if let Some(ast::DebugText { leading, trailing }) = &element.debug_text {
            self.p(leading)?;
            self.p(self.source.slice(element.expression.range()))?;
            self.p(trailing)?;
        }
        let mut inner = String::new();
        Unparser::new(&mut inner, self.source)
            .unparse_expr(&element.expression, Precedence::Test.next())?;
        // `{ {..}}` keeps a set or dict display from reading as an escape
        self.p(if inner.starts_with('{') { "{ " } else { "{" })?;
        self.p(&inner)?;
        match element.conversion {
            ast::ConversionFlag::None => {}
            ast::ConversionFlag::Str => self.p("!s")?,
            ast::ConversionFlag::Repr => self.p("!r")?,
            ast::ConversionFlag::Ascii => self.p("!a")?,
        }
        if let Some(spec) = &element.format_spec {
            self.p(":")?;
            self.unparse_interpolated(&spec.elements)?;
        }
        self.p("}")
    }
}

/// Displays an expression as Python source.
pub struct UnparseExpr<'a> {
    expr: &'a ast::Expr,
    source: &'a SourceFile,
}

impl<'a> UnparseExpr<'a> {
    pub const fn new(expr: &'a ast::Expr, source: &'a SourceFile) -> Self {
        Self { expr, source }
    }
}

impl fmt::Display for UnparseExpr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Unparser::new(f, self.source).unparse_expr(self.expr, Precedence::Test)
    }
}

/// `repr()` of a `str`: single quotes unless only double quotes avoid escaping.
fn str_repr(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_control() => {
                let code = u32::from(c);
                let _ = match code {
                    0..=0xff => write!(out, "\\x{code:02x}"),
                    0x100..=0xffff => write!(out, "\\u{code:04x}"),
                    _ => write!(out, "\\U{code:08x}"),
                };
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

/// `repr()` of a `bytes` object.
fn bytes_repr(bytes: &[u8]) -> String {
    let quote = if bytes.contains(&b'\'') && !bytes.contains(&b'"') {
        b'"'
    } else {
        b'\''
    };
    let mut out = String::with_capacity(bytes.len() + 3);
    out.push('b');
    out.push(char::from(quote));
    for &b in bytes {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            b if b == quote => {
                out.push('\\');
                out.push(char::from(b));
            }
            0x20..0x7f => out.push(char::from(b)),
            b => {
                let _ = write!(out, "\\x{b:02x}");
            }
        }
    }
    out.push(char::from(quote));
    out
}

/// `repr()` of a finite float: the shortest round-tripping digits, in
/// scientific notation outside `1e-4 <= |x| < 1e16`.
fn float_repr(value: f64) -> String {
    let scientific = format!("{:e}", value.abs());
    let (mantissa, exponent) = scientific
        .split_once('e')
        .unwrap_or((scientific.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let digits: String = mantissa.chars().filter(char::is_ascii_digit).collect();
    let sign = if value.is_sign_negative() { "-" } else { "" };

    if !(-4..16).contains(&exponent) {
        let (first, rest) = digits.split_at(1);
        let fraction = if rest.is_empty() {
            String::new()
        } else {
            format!(".{rest}")
        };
        let exp_sign = if exponent < 0 { '-' } else { '+' };
        return format!("{sign}{first}{fraction}e{exp_sign}{:02}", exponent.unsigned_abs());
    }
    if exponent < 0 {
        let zeros = "0".repeat(exponent.unsigned_abs() as usize - 1);
        return format!("{sign}0.{zeros}{digits}");
    }
    let point = exponent.unsigned_abs() as usize + 1;
    if digits.len() > point {
        let (whole, fraction) = digits.split_at(point);
        format!("{sign}{whole}.{fraction}")
    } else {
        let zeros = "0".repeat(point - digits.len());
        format!("{sign}{digits}{zeros}.0")
    }
}

/// A float literal; infinities are spelled as an overflowing literal.
fn float_literal(value: f64) -> String {
    if value.is_infinite() {
        let sign = if value < 0.0 { "-" } else { "" };
        format!("{sign}1e309")
    } else {
        float_repr(value)
    }
}

/// A complex literal like CPython prints it: `1j`, `(1+2.5j)`.
fn complex_literal(real: f64, imag: f64) -> String {
    let part = |value: f64| {
        let repr = float_literal(value);
        match repr.strip_suffix(".0") {
            Some(integral) => integral.to_owned(),
            None => repr,
        }
    };
    if real == 0.0 && real.is_sign_positive() {
        return format!("{}j", part(imag));
    }
    let sign = if imag.is_sign_negative() { "" } else { "+" };
    format!("({}{sign}{}j)", part(real), part(imag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pylower_compiler_core::SourceFileBuilder;
    use ruff_python_parser::parse_expression;

    fn roundtrip(source: &str) -> String {
        let parsed = parse_expression(source).unwrap();
        let file = SourceFileBuilder::new("<test>", source).finish();
        UnparseExpr::new(&parsed.syntax().body, &file).to_string()
    }

    #[test]
    fn precedence_adds_only_needed_parentheses() {
        assert_eq!(roundtrip("(a + b) * c"), "(a + b) * c");
        assert_eq!(roundtrip("a + (b * c)"), "a + b * c");
        assert_eq!(roundtrip("a - (b - c)"), "a - (b - c)");
        assert_eq!(roundtrip("(a ** b) ** c"), "(a ** b) ** c");
        assert_eq!(roundtrip("a ** (b ** c)"), "a ** b ** c");
        assert_eq!(roundtrip("not (a and b)"), "not (a and b)");
        assert_eq!(roundtrip("(-1) .real"), "(-1).real");
    }

    #[test]
    fn annotation_shapes() {
        assert_eq!(roundtrip("dict[str, list[int]]"), "dict[str, list[int]]");
        assert_eq!(roundtrip("int | None"), "int | None");
        assert_eq!(roundtrip("Callable[..., T]"), "Callable[..., T]");
        assert_eq!(roundtrip("tuple[()]"), "tuple[()]");
        assert_eq!(roundtrip("Literal['a', \"b\"]"), "Literal['a', 'b']");
    }

    #[test]
    fn displays_and_comprehensions() {
        assert_eq!(roundtrip("(1,)"), "(1,)");
        assert_eq!(roundtrip("{**a, 'k': v}"), "{**a, 'k': v}");
        assert_eq!(roundtrip("[x for x in y if x]"), "[x for x in y if x]");
        assert_eq!(roundtrip("f(x for x in y)"), "f(x for x in y)");
        assert_eq!(roundtrip("f(a, *b, c=1, **d)"), "f(a, *b, c=1, **d)");
        assert_eq!(roundtrip("lambda x, /, y=1, *a, z, **k: x"), "lambda x, /, y=1, *a, z, **k: x");
        assert_eq!(roundtrip("a if b else c"), "a if b else c");
    }

    #[test]
    fn fstrings() {
        assert_eq!(roundtrip("f'{a!r:>{w}} {{x}}'"), "f'{a!r:>{w}} {{x}}'");
        assert_eq!(roundtrip("f'{ {1} }'"), "f'{ {1}}'");
    }

    #[test]
    fn string_quoting() {
        assert_eq!(str_repr("it's"), "\"it's\"");
        assert_eq!(str_repr("both ' and \""), "'both \\' and \"'");
        assert_eq!(str_repr("tab\tnl\n\u{1}"), "'tab\\tnl\\n\\x01'");
        assert_eq!(bytes_repr(b"a\xff'"), "b\"a\\xff'\"");
    }

    #[test]
    fn float_formatting() {
        assert_eq!(float_repr(1.0), "1.0");
        assert_eq!(float_repr(0.5), "0.5");
        assert_eq!(float_repr(123.25), "123.25");
        assert_eq!(float_repr(1e16), "1e+16");
        assert_eq!(float_repr(1e15), "1000000000000000.0");
        assert_eq!(float_repr(0.0001), "0.0001");
        assert_eq!(float_repr(1.5e-5), "1.5e-05");
        assert_eq!(float_repr(0.0), "0.0");
        assert_eq!(float_literal(f64::INFINITY), "1e309");
    }

    #[test]
    fn complex_formatting() {
        assert_eq!(complex_literal(0.0, 1.0), "1j");
        assert_eq!(complex_literal(0.0, 2.5), "2.5j");
        assert_eq!(complex_literal(1.0, -2.0), "(1-2j)");
    }
}
