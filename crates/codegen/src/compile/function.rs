//! Function, lambda and class definitions, PEP 695 type parameters and
//! annotations.
//!
//! Every definition compiles its body into a nested unit and materializes
//! the result with [`Compiler::make_closure`]. Annotations and lazily
//! evaluated type parameter bounds get their own annotation scopes whose
//! single positional parameter is the requested format.

use super::{
    CompileResult, Compiler, DeferredAnnotation, NameUsage, ToU32, clean_doc, emit,
    fblock::{FBlockDatum, FBlockType},
    split_doc,
};
use crate::{
    error::{CodegenErrorType, InternalError},
    symboltable::{CompilerScope, SymbolScope},
    unparse::UnparseExpr,
};
use core::mem;
use malachite_bigint::BigInt;
use pylower_compiler_core::{
    OneIndexed,
    bytecode::{
        CodeFlags, CodeObject, ConstantData, Instruction, IntrinsicFunction1, IntrinsicFunction2,
        MakeFunctionFlags,
    },
};
use ruff_python_ast::{
    Arguments, AtomicNodeIndex, Decorator, Expr, ExprContext, ExprLambda, ExprName, ExprStarred,
    Parameters, StmtClassDef, StmtFunctionDef, StmtTypeAlias, TypeParam, TypeParamParamSpec,
    TypeParamTypeVar, TypeParamTypeVarTuple, TypeParams, name::Name,
};
use ruff_text_size::{Ranged, TextRange};

impl Compiler {
    // Functions

    pub(super) fn compile_function_def(&mut self, def: &StmtFunctionDef) -> CompileResult<()> {
        let StmtFunctionDef {
            name,
            parameters,
            decorator_list,
            type_params,
            range,
            ..
        } = def;
        self.compile_decorators(decorator_list)?;
        let firstlineno = self.definition_line(decorator_list, *range);

        self.set_source_range(*range);
        let flags = self.compile_default_arguments(parameters)?;

        if let Some(type_params) = type_params.as_deref() {
            let has_defaults = flags.contains(MakeFunctionFlags::DEFAULTS);
            let has_kwdefaults = flags.contains(MakeFunctionFlags::KW_DEFAULTS);
            let num_args = u32::from(has_defaults) + u32::from(has_kwdefaults);
            if num_args == 2 {
                emit!(self, Instruction::Swap { index: 2 });
            }
            let table =
                self.find_table(CompilerScope::TypeParams, type_params.range, name.as_str())?;
            let scope_name = format!("<generic parameters of {name}>");
            let code = self.in_scope(&scope_name, table, firstlineno, None, |c| {
                c.unit.metadata.argcount = num_args;
                c.compile_type_params(type_params)?;
                if has_defaults {
                    let idx = c.varname(".defaults");
                    emit!(c, Instruction::LoadFast(idx));
                }
                if has_kwdefaults {
                    let idx = c.varname(".kwdefaults");
                    emit!(c, Instruction::LoadFast(idx));
                }
                c.compile_function_object(def, flags, firstlineno)?;
                emit!(c, Instruction::Swap { index: 2 });
                emit!(
                    c,
                    Instruction::CallIntrinsic2 {
                        func: IntrinsicFunction2::SetFunctionTypeParams
                    }
                );
                emit!(c, Instruction::ReturnValue);
                Ok(())
            })?;
            self.set_source_range(*range);
            self.make_closure(code, MakeFunctionFlags::empty())?;
            if num_args > 0 {
                emit!(self, Instruction::Swap { index: num_args + 1 });
                emit!(self, Instruction::Call { nargs: num_args - 1 });
            } else {
                emit!(self, Instruction::PushNull);
                emit!(self, Instruction::Call { nargs: 0 });
            }
        } else {
            self.compile_function_object(def, flags, firstlineno)?;
        }

        self.apply_decorators(decorator_list);
        self.compile_name(name.as_str(), NameUsage::Store)
    }

    /// Annotations, the body and the function object itself; the defaults
    /// selected by `flags` are already on the stack.
    fn compile_function_object(
        &mut self,
        def: &StmtFunctionDef,
        flags: MakeFunctionFlags,
        firstlineno: OneIndexed,
    ) -> CompileResult<()> {
        let StmtFunctionDef {
            name,
            parameters,
            body,
            returns,
            is_async,
            range,
            ..
        } = def;
        let flags = flags
            | self.compile_function_annotations(name.as_str(), parameters, returns.as_deref())?;

        let typ = if *is_async {
            CompilerScope::AsyncFunction
        } else {
            CompilerScope::Function
        };
        let table = self.find_table(typ, *range, name.as_str())?;
        let code = self.in_scope(name.as_str(), table, firstlineno, None, |c| {
            c.set_signature_metadata(parameters);
            let mut statements = &body[..];
            // the first constant is always the docstring slot
            match split_doc(body) {
                Some((doc, rest)) => {
                    statements = rest;
                    if c.opts.optimize < 2 {
                        c.add_const(ConstantData::str(clean_doc(doc)));
                        c.unit.has_docstring = true;
                    } else {
                        c.add_const(ConstantData::None);
                    }
                }
                None => {
                    c.add_const(ConstantData::None);
                }
            }

            let ste = c.current_symbol_table();
            if ste.is_generator || ste.is_coroutine {
                c.with_fblock(FBlockType::StopIteration, None, None, FBlockDatum::None, |c| {
                    c.compile_statements(statements)
                })?;
                c.wrap_in_stop_iteration_handler();
            } else {
                c.compile_statements(statements)?;
            }
            Ok(())
        })?;

        self.set_source_range(*range);
        self.make_closure(code, flags)
    }

    fn compile_decorators(&mut self, decorators: &[Decorator]) -> CompileResult<()> {
        for decorator in decorators {
            self.set_source_range(decorator.range());
            self.compile_expression(&decorator.expression)?;
        }
        Ok(())
    }

    fn apply_decorators(&mut self, decorators: &[Decorator]) {
        for decorator in decorators.iter().rev() {
            self.set_source_range(decorator.range());
            emit!(self, Instruction::Call { nargs: 0 });
        }
    }

    /// A decorated definition starts at its first decorator.
    fn definition_line(&self, decorators: &[Decorator], range: TextRange) -> OneIndexed {
        let start = decorators.first().map_or(range, Ranged::range);
        self.line_number(start)
    }

    fn set_signature_metadata(&mut self, parameters: &Parameters) {
        let metadata = &mut self.unit.metadata;
        metadata.posonlyargcount = parameters.posonlyargs.len().to_u32();
        metadata.argcount = (parameters.posonlyargs.len() + parameters.args.len()).to_u32();
        metadata.kwonlyargcount = parameters.kwonlyargs.len().to_u32();
        if parameters.vararg.is_some() {
            self.unit.arg_flags |= CodeFlags::VARARGS;
        }
        if parameters.kwarg.is_some() {
            self.unit.arg_flags |= CodeFlags::VARKEYWORDS;
        }
    }

    /// Push the positional defaults as a tuple and the keyword-only defaults
    /// as a dict, returning which of the two were pushed.
    fn compile_default_arguments(
        &mut self,
        parameters: &Parameters,
    ) -> CompileResult<MakeFunctionFlags> {
        let mut flags = MakeFunctionFlags::empty();

        let defaults: Vec<&Expr> = parameters
            .posonlyargs
            .iter()
            .chain(&parameters.args)
            .filter_map(|p| p.default.as_deref())
            .collect();
        if !defaults.is_empty() {
            let folded: Option<Vec<ConstantData>> =
                defaults.iter().map(|d| self.constant_value(d)).collect();
            match folded {
                Some(elements) => self.emit_load_const(ConstantData::Tuple { elements }),
                None => {
                    for default in &defaults {
                        self.compile_expression(default)?;
                    }
                    emit!(
                        self,
                        Instruction::BuildTuple {
                            size: defaults.len().to_u32()
                        }
                    );
                }
            }
            flags |= MakeFunctionFlags::DEFAULTS;
        }

        let mut kw_count = 0u32;
        for parameter in &parameters.kwonlyargs {
            let Some(default) = parameter.default.as_deref() else {
                continue;
            };
            let mangled = self.mangle(parameter.parameter.name.as_str()).into_owned();
            self.emit_load_const(ConstantData::str(mangled));
            self.compile_expression(default)?;
            kw_count += 1;
        }
        if kw_count > 0 {
            emit!(self, Instruction::BuildMap { size: kw_count });
            flags |= MakeFunctionFlags::KW_DEFAULTS;
        }
        Ok(flags)
    }

    /// Parameter and return annotations. Stringified annotations are pushed
    /// as a flat tuple of name/value pairs; otherwise they are wrapped in an
    /// `__annotate__` function.
    fn compile_function_annotations(
        &mut self,
        name: &str,
        parameters: &Parameters,
        returns: Option<&Expr>,
    ) -> CompileResult<MakeFunctionFlags> {
        let annotated: Vec<(&str, &Expr)> = parameters
            .args
            .iter()
            .chain(&parameters.posonlyargs)
            .map(|p| &p.parameter)
            .chain(parameters.vararg.as_deref())
            .chain(parameters.kwonlyargs.iter().map(|p| &p.parameter))
            .chain(parameters.kwarg.as_deref())
            .filter_map(|p| Some((p.name.as_str(), p.annotation.as_deref()?)))
            .chain(returns.map(|r| ("return", r)))
            .collect();
        if annotated.is_empty() {
            return Ok(MakeFunctionFlags::empty());
        }

        if self.future_annotations {
            for (arg, annotation) in &annotated {
                let mangled = self.mangle(arg).into_owned();
                self.emit_load_const(ConstantData::str(mangled));
                self.compile_annotation(annotation)?;
            }
            emit!(
                self,
                Instruction::BuildTuple {
                    size: (annotated.len() * 2).to_u32()
                }
            );
            return Ok(MakeFunctionFlags::ANNOTATIONS);
        }

        let table = self.find_table(CompilerScope::Annotation, parameters.range, name)?;
        let lineno = self.line_number(parameters.range);
        let code = self.in_scope("__annotate__", table, lineno, None, |c| {
            c.setup_annotation_scope();
            for (arg, annotation) in &annotated {
                let mangled = c.mangle(arg).into_owned();
                c.set_source_range(annotation.range());
                c.emit_load_const(ConstantData::str(mangled));
                c.compile_annotation(annotation)?;
            }
            emit!(
                c,
                Instruction::BuildMap {
                    size: annotated.len().to_u32()
                }
            );
            emit!(c, Instruction::ReturnValue);
            Ok(())
        })?;
        self.make_closure(code, MakeFunctionFlags::empty())?;
        Ok(MakeFunctionFlags::ANNOTATE)
    }

    /// Slot 0 holds the format, and anything but the plain value format is
    /// refused.
    fn setup_annotation_scope(&mut self) {
        self.varname(".format");
        self.unit.metadata.argcount = 1;
        self.unit.metadata.posonlyargcount = 1;
        self.emit_format_check();
    }

    /// Push the value of one annotation: its source text under
    /// `from __future__ import annotations`, the evaluated expression otherwise.
    pub(super) fn compile_annotation(&mut self, annotation: &Expr) -> CompileResult<()> {
        if self.future_annotations {
            let text = UnparseExpr::new(annotation, &self.source_file).to_string();
            self.emit_load_const(ConstantData::str(text));
            return Ok(());
        }
        match annotation {
            Expr::Starred(ExprStarred { value, .. }) => {
                self.compile_expression(value)?;
                emit!(self, Instruction::UnpackSequence { size: 1 });
            }
            _ => self.compile_expression(annotation)?,
        }
        Ok(())
    }

    /// Compile the annotations collected from a module or class body into
    /// its `__annotate__` function.
    pub(super) fn compile_deferred_annotations(&mut self, lineno: OneIndexed) -> CompileResult<()> {
        if self.unit.deferred_annotations.is_empty() {
            return Ok(());
        }
        let annotations = mem::take(&mut self.unit.deferred_annotations);
        let Some(table) = self.current_symbol_table().annotation_block else {
            return Err(self.internal_error(InternalError::MissingSymbolTable(
                "__annotate__".to_owned(),
            )));
        };
        let code = self.in_scope("__annotate__", table, lineno, None, |c| {
            c.setup_annotation_scope();
            for DeferredAnnotation {
                name,
                annotation,
                range,
            } in &annotations
            {
                c.set_source_range(*range);
                c.emit_load_const(ConstantData::str(name.as_str()));
                c.compile_annotation(annotation)?;
            }
            emit!(
                c,
                Instruction::BuildMap {
                    size: annotations.len().to_u32()
                }
            );
            emit!(c, Instruction::ReturnValue);
            Ok(())
        })?;
        self.make_closure(code, MakeFunctionFlags::empty())?;
        self.compile_name("__annotate__", NameUsage::Store)
    }

    // Lambdas

    pub(super) fn compile_lambda(&mut self, lambda: &ExprLambda) -> CompileResult<()> {
        let ExprLambda {
            parameters,
            body,
            range,
            ..
        } = lambda;
        let flags = match parameters.as_deref() {
            Some(parameters) => self.compile_default_arguments(parameters)?,
            None => MakeFunctionFlags::empty(),
        };
        let table = self.find_table(CompilerScope::Lambda, *range, "<lambda>")?;
        let lineno = self.line_number(*range);
        let code = self.in_scope("<lambda>", table, lineno, None, |c| {
            if let Some(parameters) = parameters.as_deref() {
                c.set_signature_metadata(parameters);
            }
            // a lambda has no docstring
            c.add_const(ConstantData::None);
            c.set_source_range(body.range());
            c.compile_expression(body)?;
            if c.current_symbol_table().is_generator {
                emit!(c, Instruction::PopTop);
                c.wrap_in_stop_iteration_handler();
            } else {
                emit!(c, Instruction::ReturnValue);
            }
            Ok(())
        })?;
        self.set_source_range(*range);
        self.make_closure(code, flags)
    }

    // Closures

    /// Turn `code` into a function object on the stack.
    ///
    /// The attachments selected by `flags` must already be on the stack in
    /// the order defaults, keyword defaults, annotations; the closure tuple
    /// is built here from the code's free variables.
    pub(super) fn make_closure(
        &mut self,
        code: CodeObject,
        flags: MakeFunctionFlags,
    ) -> CompileResult<()> {
        let mut flags = flags;
        if !code.freevars.is_empty() {
            for name in code.freevars.iter() {
                let scope = self.get_ref_type(name)?;
                let idx = self.deref_index(name, scope)?;
                emit!(self, Instruction::LoadClosure(idx));
            }
            emit!(
                self,
                Instruction::BuildTuple {
                    size: code.freevars.len().to_u32()
                }
            );
            flags |= MakeFunctionFlags::CLOSURE;
        }

        self.emit_load_const(ConstantData::Code {
            code: Box::new(code),
        });
        emit!(self, Instruction::MakeFunction);

        for attr in [
            MakeFunctionFlags::CLOSURE,
            MakeFunctionFlags::ANNOTATIONS,
            MakeFunctionFlags::ANNOTATE,
            MakeFunctionFlags::KW_DEFAULTS,
            MakeFunctionFlags::DEFAULTS,
        ] {
            if flags.contains(attr) {
                emit!(self, Instruction::SetFunctionAttribute { attr });
            }
        }
        Ok(())
    }

    // Classes

    pub(super) fn compile_class_def(&mut self, def: &StmtClassDef) -> CompileResult<()> {
        let StmtClassDef {
            name,
            arguments,
            decorator_list,
            type_params,
            range,
            ..
        } = def;
        self.compile_decorators(decorator_list)?;
        let firstlineno = self.definition_line(decorator_list, *range);
        self.set_source_range(*range);

        if let Some(type_params) = type_params.as_deref() {
            let table =
                self.find_table(CompilerScope::TypeParams, type_params.range, name.as_str())?;
            let scope_name = format!("<generic parameters of {name}>");
            let code = self.in_scope(&scope_name, table, firstlineno, Some(name.as_str()), |c| {
                c.compile_type_params(type_params)?;
                c.compile_name(".type_params", NameUsage::Store)?;
                c.compile_class_body(def, firstlineno)?;
                c.set_source_range(*range);
                c.compile_name(".type_params", NameUsage::Load)?;
                emit!(
                    c,
                    Instruction::CallIntrinsic1 {
                        func: IntrinsicFunction1::SubscriptGeneric
                    }
                );
                c.compile_name(".generic_base", NameUsage::Store)?;
                let arguments = with_generic_base(arguments.as_deref(), *range);
                c.compile_call_helper(2, &arguments)?;
                emit!(c, Instruction::ReturnValue);
                Ok(())
            })?;
            self.set_source_range(*range);
            self.make_closure(code, MakeFunctionFlags::empty())?;
            emit!(self, Instruction::PushNull);
            emit!(self, Instruction::Call { nargs: 0 });
        } else {
            self.compile_class_body(def, firstlineno)?;
            match arguments.as_deref() {
                Some(arguments) => self.compile_call_helper(2, arguments)?,
                None => emit!(self, Instruction::Call { nargs: 2 }),
            }
        }

        self.apply_decorators(decorator_list);
        self.compile_name(name.as_str(), NameUsage::Store)
    }

    /// Compile the class body function and push `__build_class__`, a null,
    /// the body function and the class name.
    fn compile_class_body(
        &mut self,
        def: &StmtClassDef,
        firstlineno: OneIndexed,
    ) -> CompileResult<()> {
        let StmtClassDef {
            name,
            body,
            type_params,
            range,
            ..
        } = def;
        let table = self.find_table(CompilerScope::Class, *range, name.as_str())?;
        let code = self.in_scope(name.as_str(), table, firstlineno, None, |c| {
            c.set_source_range(*range);
            c.compile_name("__name__", NameUsage::Load)?;
            c.compile_name("__module__", NameUsage::Store)?;
            let qualname = c
                .unit
                .metadata
                .qualname
                .clone()
                .unwrap_or_else(|| name.to_string());
            c.emit_load_const(ConstantData::str(qualname));
            c.compile_name("__qualname__", NameUsage::Store)?;
            c.emit_load_const(ConstantData::Integer {
                value: BigInt::from(firstlineno.get()),
            });
            c.compile_name("__firstlineno__", NameUsage::Store)?;
            if type_params.is_some() {
                c.compile_name(".type_params", NameUsage::Load)?;
                c.compile_name("__type_params__", NameUsage::Store)?;
            }

            let ste = c.current_symbol_table();
            let needs_classdict = ste.needs_classdict;
            let needs_class_closure = ste.needs_class_closure;
            if needs_classdict {
                emit!(c, Instruction::LoadLocals);
                let idx = c.deref_index("__classdict__", SymbolScope::Cell)?;
                emit!(c, Instruction::StoreDeref(idx));
            }

            c.compile_body(body)?;

            let mut attributes: Vec<String> = c
                .unit
                .static_attributes
                .take()
                .map(|attrs| attrs.into_iter().collect())
                .unwrap_or_default();
            attributes.sort();
            c.emit_load_const(ConstantData::Tuple {
                elements: attributes.into_iter().map(ConstantData::str).collect(),
            });
            c.compile_name("__static_attributes__", NameUsage::Store)?;

            if needs_classdict {
                let idx = c.deref_index("__classdict__", SymbolScope::Cell)?;
                emit!(c, Instruction::LoadClosure(idx));
                c.compile_name("__classdictcell__", NameUsage::Store)?;
            }
            // the class cell is returned so `type.__new__` can fill it in
            if needs_class_closure {
                let idx = c.deref_index("__class__", SymbolScope::Cell)?;
                emit!(c, Instruction::LoadClosure(idx));
                emit!(c, Instruction::Copy { index: 1 });
                c.compile_name("__classcell__", NameUsage::Store)?;
            } else {
                c.emit_load_const(ConstantData::None);
            }
            emit!(c, Instruction::ReturnValue);
            Ok(())
        })?;

        self.set_source_range(*range);
        emit!(self, Instruction::LoadBuildClass);
        emit!(self, Instruction::PushNull);
        self.make_closure(code, MakeFunctionFlags::empty())?;
        self.emit_load_const(ConstantData::str(name.as_str()));
        Ok(())
    }

    // Type parameters and aliases

    /// Create each type parameter, bind it, and leave the tuple of all of
    /// them on the stack.
    fn compile_type_params(&mut self, type_params: &TypeParams) -> CompileResult<()> {
        let mut seen_default = false;
        for param in &type_params.type_params {
            self.set_source_range(param.range());
            let (name, default) = match param {
                TypeParam::TypeVar(TypeParamTypeVar {
                    name,
                    bound,
                    default,
                    ..
                }) => {
                    self.emit_load_const(ConstantData::str(name.as_str()));
                    if let Some(bound) = bound {
                        let func = if bound.is_tuple_expr() {
                            IntrinsicFunction2::TypeVarWithConstraints
                        } else {
                            IntrinsicFunction2::TypeVarWithBound
                        };
                        self.compile_type_param_bound_or_default(bound, name.as_str(), false)?;
                        emit!(self, Instruction::CallIntrinsic2 { func });
                    } else {
                        emit!(
                            self,
                            Instruction::CallIntrinsic1 {
                                func: IntrinsicFunction1::TypeVar
                            }
                        );
                    }
                    (name, default)
                }
                TypeParam::ParamSpec(TypeParamParamSpec { name, default, .. }) => {
                    self.emit_load_const(ConstantData::str(name.as_str()));
                    emit!(
                        self,
                        Instruction::CallIntrinsic1 {
                            func: IntrinsicFunction1::ParamSpec
                        }
                    );
                    (name, default)
                }
                TypeParam::TypeVarTuple(TypeParamTypeVarTuple { name, default, .. }) => {
                    self.emit_load_const(ConstantData::str(name.as_str()));
                    emit!(
                        self,
                        Instruction::CallIntrinsic1 {
                            func: IntrinsicFunction1::TypeVarTuple
                        }
                    );
                    (name, default)
                }
            };

            if let Some(default) = default {
                seen_default = true;
                let allow_starred = matches!(param, TypeParam::TypeVarTuple(_));
                self.compile_type_param_bound_or_default(default, name.as_str(), allow_starred)?;
                emit!(
                    self,
                    Instruction::CallIntrinsic2 {
                        func: IntrinsicFunction2::SetTypeparamDefault
                    }
                );
            } else if seen_default {
                return Err(self.error_ranged(
                    CodegenErrorType::NonDefaultTypeParam(name.to_string()),
                    param.range(),
                ));
            }

            emit!(self, Instruction::Copy { index: 1 });
            self.compile_name(name.as_str(), NameUsage::Store)?;
        }
        emit!(
            self,
            Instruction::BuildTuple {
                size: type_params.type_params.len().to_u32()
            }
        );
        Ok(())
    }

    /// A bound, constraint tuple or default is evaluated lazily by a small
    /// function taking the format, which defaults to 1.
    fn compile_type_param_bound_or_default(
        &mut self,
        expr: &Expr,
        name: &str,
        allow_starred: bool,
    ) -> CompileResult<()> {
        self.emit_load_const(ConstantData::Tuple {
            elements: vec![ConstantData::Integer {
                value: BigInt::from(1),
            }],
        });
        let range = expr.range();
        let table = self.find_table(CompilerScope::TypeParams, range, name)?;
        let lineno = self.line_number(range);
        let code = self.in_scope(name, table, lineno, None, |c| {
            c.setup_annotation_scope();
            c.set_source_range(range);
            match expr {
                Expr::Starred(ExprStarred { value, .. }) if allow_starred => {
                    c.compile_expression(value)?;
                    emit!(c, Instruction::UnpackSequence { size: 1 });
                }
                _ => c.compile_expression(expr)?,
            }
            emit!(c, Instruction::ReturnValue);
            Ok(())
        })?;
        self.make_closure(code, MakeFunctionFlags::DEFAULTS)
    }

    pub(super) fn compile_type_alias(&mut self, alias: &StmtTypeAlias) -> CompileResult<()> {
        let StmtTypeAlias {
            name,
            type_params,
            value,
            range,
            ..
        } = alias;
        let Expr::Name(ExprName { id, .. }) = &**name else {
            return Err(self.error_ranged(
                CodegenErrorType::SyntaxError("type alias name must be an identifier".to_owned()),
                name.range(),
            ));
        };
        let alias_name = id.as_str();
        self.set_source_range(*range);

        if let Some(type_params) = type_params.as_deref() {
            let table =
                self.find_table(CompilerScope::TypeParams, type_params.range, alias_name)?;
            let lineno = self.line_number(*range);
            let scope_name = format!("<generic parameters of {alias_name}>");
            let code = self.in_scope(&scope_name, table, lineno, None, |c| {
                c.emit_load_const(ConstantData::str(alias_name));
                c.compile_type_params(type_params)?;
                c.compile_type_alias_value(alias_name, value, *range)?;
                emit!(c, Instruction::ReturnValue);
                Ok(())
            })?;
            self.set_source_range(*range);
            self.make_closure(code, MakeFunctionFlags::empty())?;
            emit!(self, Instruction::PushNull);
            emit!(self, Instruction::Call { nargs: 0 });
        } else {
            self.emit_load_const(ConstantData::str(alias_name));
            self.emit_load_const(ConstantData::None);
            self.compile_type_alias_value(alias_name, value, *range)?;
        }
        self.compile_name(alias_name, NameUsage::Store)
    }

    /// With the name and type parameters pushed, add the lazily evaluated
    /// value and create the alias. Like a bound, the value function takes
    /// the format with a default of 1.
    fn compile_type_alias_value(
        &mut self,
        name: &str,
        value: &Expr,
        range: TextRange,
    ) -> CompileResult<()> {
        self.emit_load_const(ConstantData::Tuple {
            elements: vec![ConstantData::Integer {
                value: BigInt::from(1),
            }],
        });
        let table = self.find_table(CompilerScope::Annotation, range, name)?;
        let lineno = self.line_number(range);
        let code = self.in_scope(name, table, lineno, None, |c| {
            // None first, so the value function never has a docstring
            c.add_const(ConstantData::None);
            c.setup_annotation_scope();
            c.set_source_range(value.range());
            c.compile_expression(value)?;
            emit!(c, Instruction::ReturnValue);
            Ok(())
        })?;
        self.set_source_range(range);
        self.make_closure(code, MakeFunctionFlags::DEFAULTS)?;
        emit!(self, Instruction::BuildTuple { size: 3 });
        emit!(
            self,
            Instruction::CallIntrinsic1 {
                func: IntrinsicFunction1::TypeAlias
            }
        );
        Ok(())
    }
}

/// The class arguments of a generic class with `.generic_base` appended to
/// the positional bases.
fn with_generic_base(arguments: Option<&Arguments>, range: TextRange) -> Arguments {
    let mut args: Vec<Expr> = arguments.map(|a| a.args.to_vec()).unwrap_or_default();
    args.push(Expr::Name(ExprName {
        node_index: AtomicNodeIndex::NONE,
        range,
        id: Name::new_static(".generic_base"),
        ctx: ExprContext::Load,
    }));
    Arguments {
        node_index: AtomicNodeIndex::NONE,
        range,
        args: args.into_boxed_slice(),
        keywords: arguments.map(|a| a.keywords.clone()).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::super::{CompileOpts, test_support::*};
    use crate::error::CodegenErrorType;
    use pylower_compiler_core::bytecode::{CodeFlags, ConstantData, Instruction};

    #[test]
    fn closure_captures_cell() {
        let code = compile(
            "def outer():\n    x = 1\n    def inner():\n        return x\n    return inner\n",
        );
        let outer = find_code(&code, "outer");
        let inner = find_code(&code, "inner");
        assert_eq!(&*outer.cellvars, ["x"]);
        assert_eq!(&*inner.freevars, ["x"]);
        assert_eq!(inner.qualname, "outer.<locals>.inner");

        let text = listing(outer);
        assert!(text.contains("LOAD_CLOSURE(0, x)\nBUILD_TUPLE(1)"), "{text}");
        assert!(text.contains("MAKE_FUNCTION\nSET_FUNCTION_ATTRIBUTE"), "{text}");
        assert!(listing(inner).contains("LOAD_DEREF(0, x)"));
    }

    #[test]
    fn defaults_and_keyword_defaults() {
        let code = compile("def f(a, b=1, c=2, *, d=3):\n    pass\n");
        let text = listing(&code);
        assert!(text.contains("LOAD_CONST((1, 2))"), "{text}");
        assert!(
            text.contains("LOAD_CONST(\"d\")\nLOAD_CONST(3)\nBUILD_MAP(1)"),
            "{text}"
        );
        let attributes = ops(&code)
            .into_iter()
            .filter(|op| matches!(op, Instruction::SetFunctionAttribute { .. }))
            .count();
        assert_eq!(attributes, 2);

        let f = find_code(&code, "f");
        assert_eq!(f.arg_count, 3);
        assert_eq!(f.kwonlyarg_count, 1);
        assert_eq!(&*f.varnames, ["a", "b", "c", "d"]);
    }

    #[test]
    fn non_constant_defaults_build_a_tuple() {
        let code = compile("def f(a=x, b=1):\n    pass\n");
        let text = listing(&code);
        assert!(
            text.contains("LOAD_NAME(0, x)\nLOAD_CONST(1)\nBUILD_TUPLE(2)"),
            "{text}"
        );
    }

    #[test]
    fn varargs_set_code_flags() {
        let code = compile("def f(a, /, b, *args, c, **kwargs):\n    pass\n");
        let f = find_code(&code, "f");
        assert_eq!(f.posonlyarg_count, 1);
        assert_eq!(f.arg_count, 2);
        assert!(f.flags.contains(CodeFlags::VARARGS | CodeFlags::VARKEYWORDS));
        assert_eq!(&*f.varnames, ["a", "b", "c", "args", "kwargs"]);
    }

    #[test]
    fn docstring_is_first_constant() {
        let code = compile("def f():\n    \"\"\"Doc.\n\n    More.\n    \"\"\"\n    return 1\n");
        let f = find_code(&code, "f");
        assert_eq!(f.constants[0], ConstantData::str("Doc.\n\nMore.\n"));
        assert!(f.flags.contains(CodeFlags::HAS_DOCSTRING));

        let code = compile("def g():\n    return 1\n");
        let g = find_code(&code, "g");
        assert_eq!(g.constants[0], ConstantData::None);
        assert!(!g.flags.contains(CodeFlags::HAS_DOCSTRING));
    }

    #[test]
    fn docstrings_dropped_at_optimize_two() {
        let opts = CompileOpts {
            optimize: 2,
            ..CompileOpts::default()
        };
        let code = compile_with("def f():\n    \"doc\"\n", opts).unwrap().code;
        let f = find_code(&code, "f");
        assert_eq!(f.constants[0], ConstantData::None);
        assert!(!f.flags.contains(CodeFlags::HAS_DOCSTRING));
    }

    #[test]
    fn generator_body_is_guarded() {
        let code = compile("def gen():\n    yield 1\n");
        let gen_code = find_code(&code, "gen");
        assert!(gen_code.flags.contains(CodeFlags::GENERATOR));
        let text = listing(gen_code);
        assert!(text.starts_with("RESUME(AtFuncStart)\nSETUP_CLEANUP("), "{text}");
        assert!(
            text.ends_with("CALL_INTRINSIC_1(StopIterationError)\nRERAISE(1)"),
            "{text}"
        );
    }

    #[test]
    fn decorators_wrap_the_function() {
        let code = compile("@a\n@b\ndef f():\n    pass\n");
        let text = listing(&code);
        assert!(text.starts_with("RESUME(AtFuncStart)\nLOAD_NAME(0, a)\nLOAD_NAME(1, b)"));
        assert!(
            text.contains("MAKE_FUNCTION\nCALL(0)\nCALL(0)\nSTORE_NAME(2, f)"),
            "{text}"
        );
        assert_eq!(find_code(&code, "f").first_line_number.map(|l| l.get()), Some(1));
    }

    #[test]
    fn lambda_reserves_the_docstring_slot() {
        let code = compile("f = lambda x, y=2: x + y\n");
        let lambda = find_code(&code, "<lambda>");
        assert_eq!(lambda.constants[0], ConstantData::None);
        assert_eq!(lambda.arg_count, 2);
        insta::assert_snapshot!(listing(lambda), @r"
        RESUME(AtFuncStart)
        LOAD_FAST(0, x)
        LOAD_FAST(1, y)
        BINARY_OP(+)
        RETURN_VALUE
        ");
    }

    #[test]
    fn class_body_records_metadata() {
        let code = compile(
            "class C(Base):\n    def __init__(self):\n        self.b = 1\n        self.a = 2\n",
        );
        let text = listing(&code);
        assert!(text.starts_with("RESUME(AtFuncStart)\nLOAD_BUILD_CLASS\nPUSH_NULL"));
        assert!(
            text.contains("LOAD_CONST(\"C\")\nLOAD_NAME(0, Base)\nCALL(3)\nSTORE_NAME(1, C)"),
            "{text}"
        );

        let class = find_code(&code, "C");
        let body = listing(class);
        assert!(body.contains("STORE_NAME(1, __module__)"), "{body}");
        assert!(body.contains("LOAD_CONST(\"C\")\nSTORE_NAME(2, __qualname__)"), "{body}");
        assert!(body.contains("LOAD_CONST(1)\nSTORE_NAME(3, __firstlineno__)"), "{body}");
        assert!(
            body.contains("LOAD_CONST((\"a\", \"b\"))\nSTORE_NAME(5, __static_attributes__)"),
            "{body}"
        );
        assert!(body.ends_with("LOAD_CONST(None)\nRETURN_VALUE"), "{body}");
        assert_eq!(find_code(&code, "__init__").qualname, "C.__init__");
    }

    #[test]
    fn zero_argument_super_creates_class_cell() {
        let code = compile("class C:\n    def f(self):\n        return super().f()\n");
        let class = find_code(&code, "C");
        assert_eq!(&*class.cellvars, ["__class__"]);
        let body = listing(class);
        assert!(
            body.contains("LOAD_CLOSURE(0, __class__)\nCOPY(1)\nSTORE_NAME"),
            "{body}"
        );
        assert!(body.contains("__classcell__"), "{body}");
    }

    #[test]
    fn private_names_are_mangled_in_signatures() {
        let code = compile("class C:\n    def f(self, *, __x=1):\n        return __x\n");
        let class = find_code(&code, "C");
        let body = listing(class);
        assert!(body.contains("LOAD_CONST(\"_C__x\")"), "{body}");
        let f = find_code(&code, "f");
        assert_eq!(&*f.varnames, ["self", "_C__x"]);
    }

    #[test]
    fn generic_function_sets_type_params() {
        let code = compile("def f[T](x: T) -> T:\n    return x\n");
        let generic = find_code(&code, "<generic parameters of f>");
        let text = listing(generic);
        assert!(
            text.contains("LOAD_CONST(\"T\")\nCALL_INTRINSIC_1(TypeVar)\nCOPY(1)"),
            "{text}"
        );
        assert!(
            text.contains("SWAP(2)\nCALL_INTRINSIC_2(SetFunctionTypeParams)\nRETURN_VALUE"),
            "{text}"
        );
        let module = listing(&code);
        assert!(module.contains("PUSH_NULL\nCALL(0)\nSTORE_NAME(0, f)"), "{module}");
    }

    #[test]
    fn generic_function_passes_defaults_through() {
        let code = compile("def f[T](x=1, *, y=2):\n    pass\n");
        let module = listing(&code);
        assert!(module.contains("BUILD_MAP(1)\nSWAP(2)"), "{module}");
        assert!(module.contains("SWAP(3)\nCALL(1)"), "{module}");
        let generic = find_code(&code, "<generic parameters of f>");
        assert_eq!(generic.arg_count, 2);
    }

    #[test]
    fn type_param_bound_is_lazy() {
        let code = compile("def f[T: int, *Ts, **P]():\n    pass\n");
        let generic = find_code(&code, "<generic parameters of f>");
        let text = listing(generic);
        assert!(text.contains("LOAD_CONST((1,))"), "{text}");
        assert!(text.contains("CALL_INTRINSIC_2(TypeVarWithBound)"), "{text}");
        assert!(text.contains("CALL_INTRINSIC_1(TypeVarTuple)"), "{text}");
        assert!(text.contains("CALL_INTRINSIC_1(ParamSpec)"), "{text}");
        assert!(text.contains("BUILD_TUPLE(3)"), "{text}");

        let bound = find_code(generic, "T");
        assert_eq!(bound.arg_count, 1);
        assert_eq!(&*bound.varnames, [".format"]);
        assert!(listing(bound).contains("LOAD_GLOBAL"));
    }

    #[test]
    fn constraints_use_their_own_intrinsic() {
        let code = compile("class C[T: (int, str)]:\n    pass\n");
        let generic = find_code(&code, "<generic parameters of C>");
        let text = listing(generic);
        assert!(text.contains("CALL_INTRINSIC_2(TypeVarWithConstraints)"), "{text}");
        assert!(text.contains("CALL_INTRINSIC_1(SubscriptGeneric)"), "{text}");
    }

    #[test]
    fn non_default_type_param_after_default() {
        assert!(matches!(
            compile_error("def f[T=int, U]():\n    pass\n"),
            CodegenErrorType::NonDefaultTypeParam(name) if name == "U"
        ));
    }

    #[test]
    fn function_annotations_become_annotate() {
        let code = compile("def f(x: int) -> str:\n    pass\n");
        let annotate = find_code(&code, "__annotate__");
        assert_eq!(annotate.arg_count, 1);
        assert_eq!(annotate.posonlyarg_count, 1);
        let text = listing(annotate);
        assert!(text.contains("RAISE_VARARGS(Raise)"), "{text}");
        assert!(
            text.contains(
                "LOAD_CONST(\"x\")\nLOAD_GLOBAL(0, int)\nLOAD_CONST(\"return\")\nLOAD_GLOBAL(1, str)\nBUILD_MAP(2)\nRETURN_VALUE"
            ),
            "{text}"
        );
    }

    #[test]
    fn future_annotations_are_strings() {
        let code = compile(
            "from __future__ import annotations\ndef f(x: list[int]) -> None:\n    pass\n",
        );
        let text = listing(&code);
        assert!(
            text.contains(
                "LOAD_CONST(\"x\")\nLOAD_CONST(\"list[int]\")\nLOAD_CONST(\"return\")\nLOAD_CONST(\"None\")\nBUILD_TUPLE(4)"
            ),
            "{text}"
        );
    }

    #[test]
    fn module_annotations_are_deferred() {
        let code = compile("x: int = 1\ny: str\n");
        let text = listing(&code);
        assert!(text.contains("STORE_NAME(1, __annotate__)"), "{text}");
        let annotate = find_code(&code, "__annotate__");
        let body = listing(annotate);
        assert!(
            body.contains("LOAD_CONST(\"x\")\nLOAD_GLOBAL(0, int)\nLOAD_CONST(\"y\")\nLOAD_GLOBAL(1, str)\nBUILD_MAP(2)"),
            "{body}"
        );
    }

    #[test]
    fn type_alias_builds_lazy_value() {
        let code = compile("type A = list[int]\n");
        insta::assert_snapshot!(listing(&code), @r#"
        RESUME(AtFuncStart)
        LOAD_CONST("A")
        LOAD_CONST(None)
        LOAD_CONST((1,))
        LOAD_CONST(<code object A at ??? file "<test>", line 1>)
        MAKE_FUNCTION
        SET_FUNCTION_ATTRIBUTE(MakeFunctionFlags(DEFAULTS))
        BUILD_TUPLE(3)
        CALL_INTRINSIC_1(TypeAlias)
        STORE_NAME(0, A)
        LOAD_CONST(None)
        RETURN_VALUE
        "#);

        let value = find_code(&code, "A");
        assert_eq!(value.constants[0], ConstantData::None);
        assert_eq!((value.arg_count, value.posonlyarg_count), (1, 1));
    }

    #[test]
    fn generic_type_alias_value_takes_the_format() {
        let code = compile("type Pair[T] = tuple[T, T]\n");
        let params = find_code(&code, "<generic parameters of Pair>");
        let text = listing(params);
        assert!(
            text.contains("LOAD_CONST((1,))\nLOAD_CONST(<code object Pair"),
            "{text}"
        );
        assert!(
            text.contains("SET_FUNCTION_ATTRIBUTE(MakeFunctionFlags(DEFAULTS))\nBUILD_TUPLE(3)"),
            "{text}"
        );
        assert_eq!(find_code(params, "Pair").constants[0], ConstantData::None);
    }
}
