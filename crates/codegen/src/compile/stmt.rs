//! Statement generators.

use super::{
    CompileResult, Compiler, NameUsage, ToU32, emit,
    fblock::{FBlockDatum, FBlockType},
};
use crate::{ToPythonName, error::CodegenErrorType};
use malachite_bigint::BigInt;
use pylower_compiler_core::bytecode::{
    AwaitableKind, CommonConstant, ConstantData, Instruction, IntrinsicFunction1,
    IntrinsicFunction2, Label, RaiseKind, SpecialMethod, UnpackExArgs,
};
use ruff_python_ast::{
    Alias, ElifElseClause, ExceptHandler, ExceptHandlerExceptHandler, Expr, ExprAttribute,
    ExprList, ExprName, ExprStarred, ExprSubscript, ExprTuple, Identifier, Stmt, StmtAnnAssign,
    StmtAssert, StmtAssign, StmtAugAssign, StmtDelete, StmtExpr, StmtFor, StmtIf, StmtImport,
    StmtImportFrom, StmtRaise, StmtReturn, StmtTry, StmtWhile, StmtWith, WithItem,
};
use ruff_text_size::{Ranged, TextRange};

impl Compiler {
    pub(super) fn compile_statements(&mut self, statements: &[Stmt]) -> CompileResult<()> {
        for statement in statements {
            self.compile_statement(statement)?;
        }
        Ok(())
    }

    fn compile_statement(&mut self, statement: &Stmt) -> CompileResult<()> {
        trace!("Compiling {statement:?}");
        self.set_source_range(statement.range());

        match statement {
            // a future import still runs as a normal import afterwards
            Stmt::ImportFrom(StmtImportFrom { module, names, .. })
                if module.as_ref().map(Identifier::as_str) == Some("__future__") =>
            {
                self.compile_future_features(names)?;
            }
            Stmt::Expr(StmtExpr { value, .. })
                if matches!(&**value, Expr::StringLiteral(_)) && self.unit_stack.is_empty() => {}
            _ => self.done_with_future_stmts = true,
        }

        match statement {
            Stmt::FunctionDef(def) => self.compile_function_def(def)?,
            Stmt::ClassDef(def) => self.compile_class_def(def)?,
            Stmt::TypeAlias(alias) => self.compile_type_alias(alias)?,
            Stmt::Return(StmtReturn { value, .. }) => self.compile_return(value.as_deref())?,
            Stmt::Delete(StmtDelete { targets, .. }) => {
                for target in targets {
                    self.compile_delete(target)?;
                }
            }
            Stmt::Assign(StmtAssign { targets, value, .. }) => {
                self.compile_expression(value)?;
                for (i, target) in targets.iter().enumerate() {
                    if i + 1 != targets.len() {
                        emit!(self, Instruction::Copy { index: 1 });
                    }
                    self.compile_store(target)?;
                }
            }
            Stmt::AugAssign(aug) => self.compile_augassign(aug)?,
            Stmt::AnnAssign(ann) => self.compile_annassign(ann)?,
            Stmt::For(StmtFor {
                target,
                iter,
                body,
                orelse,
                is_async,
                ..
            }) => {
                if *is_async {
                    self.compile_async_for(target, iter, body, orelse)?;
                } else {
                    self.compile_for(target, iter, body, orelse)?;
                }
            }
            Stmt::While(StmtWhile {
                test, body, orelse, ..
            }) => self.compile_while(test, body, orelse)?,
            Stmt::If(StmtIf {
                test,
                body,
                elif_else_clauses,
                ..
            }) => self.compile_if(test, body, elif_else_clauses)?,
            Stmt::Match(stmt) => self.compile_match(&stmt.subject, &stmt.cases)?,
            Stmt::Raise(StmtRaise { exc, cause, .. }) => {
                let kind = match exc {
                    Some(exc) => {
                        self.compile_expression(exc)?;
                        match cause {
                            Some(cause) => {
                                self.compile_expression(cause)?;
                                RaiseKind::RaiseCause
                            }
                            None => RaiseKind::Raise,
                        }
                    }
                    None => RaiseKind::BareRaise,
                };
                self.set_source_range(statement.range());
                emit!(self, Instruction::RaiseVarargs { kind });
            }
            Stmt::Try(stmt) => self.compile_try(stmt)?,
            Stmt::Assert(stmt) => self.compile_assert(stmt)?,
            Stmt::Import(StmtImport { names, .. }) => self.compile_import(names)?,
            Stmt::ImportFrom(stmt) => self.compile_import_from(stmt)?,
            Stmt::Global(_) | Stmt::Nonlocal(_) => {}
            Stmt::Expr(StmtExpr { value, .. }) => self.compile_expr_statement(value)?,
            Stmt::Pass(_) => emit!(self, Instruction::Nop),
            Stmt::Break(_) => self.compile_break()?,
            Stmt::Continue(_) => self.compile_continue()?,
            Stmt::With(StmtWith {
                items,
                body,
                is_async,
                ..
            }) => {
                if *is_async {
                    self.check_async_allowed("async with")?;
                }
                self.compile_with(items, body, *is_async)?;
            }
            Stmt::IpyEscapeCommand(_) => {
                return Err(self.error(CodegenErrorType::SyntaxError(
                    "IPython escape commands are not Python".to_owned(),
                )));
            }
        }
        Ok(())
    }

    fn compile_expr_statement(&mut self, value: &Expr) -> CompileResult<()> {
        if self.interactive && self.unit_stack.is_empty() {
            self.compile_expression(value)?;
            emit!(
                self,
                Instruction::CallIntrinsic1 {
                    func: IntrinsicFunction1::Print
                }
            );
            emit!(self, Instruction::PopTop);
            return Ok(());
        }
        if is_literal(value) {
            emit!(self, Instruction::Nop);
            return Ok(());
        }
        self.compile_expression(value)?;
        emit!(self, Instruction::PopTop);
        Ok(())
    }

    fn check_async_allowed(&self, construct: &'static str) -> CompileResult<()> {
        let table = self.current_symbol_table();
        if table.is_function_like() && table.is_coroutine {
            Ok(())
        } else {
            Err(self.error(CodegenErrorType::AsyncOutsideFunction(construct)))
        }
    }

    // Control flow

    /// `if`/`elif`/`else`; every `elif` is compiled as an `if` nested in the
    /// previous `else`.
    fn compile_if(
        &mut self,
        test: &Expr,
        body: &[Stmt],
        clauses: &[ElifElseClause],
    ) -> CompileResult<()> {
        let end = self.new_label();
        let next = if clauses.is_empty() {
            end
        } else {
            self.new_label()
        };
        self.compile_jump_if(test, false, next)?;
        self.compile_statements(body)?;
        if let Some((clause, rest)) = clauses.split_first() {
            emit!(self, Instruction::JumpNoInterrupt { target: end });
            self.use_label(next);
            match &clause.test {
                Some(test) => {
                    self.set_source_range(clause.range());
                    self.compile_if(test, &clause.body, rest)?;
                }
                None => self.compile_statements(&clause.body)?,
            }
        }
        self.use_label(end);
        Ok(())
    }

    fn compile_while(&mut self, test: &Expr, body: &[Stmt], orelse: &[Stmt]) -> CompileResult<()> {
        let start = self.new_label();
        let end = self.new_label();
        let anchor = self.new_label();

        self.use_label(start);
        self.with_fblock(
            FBlockType::WhileLoop,
            Some(start),
            Some(end),
            FBlockDatum::None,
            |c| {
                c.compile_jump_if(test, false, anchor)?;
                c.compile_statements(body)?;
                emit!(c, Instruction::Jump { target: start });
                Ok(())
            },
        )?;
        self.use_label(anchor);
        self.compile_statements(orelse)?;
        self.use_label(end);
        Ok(())
    }

    fn compile_for(
        &mut self,
        target: &Expr,
        iter: &Expr,
        body: &[Stmt],
        orelse: &[Stmt],
    ) -> CompileResult<()> {
        let start = self.new_label();
        let cleanup = self.new_label();
        let end = self.new_label();

        self.with_fblock(
            FBlockType::ForLoop,
            Some(start),
            Some(end),
            FBlockDatum::None,
            |c| {
                c.compile_expression(iter)?;
                c.set_source_range(iter.range());
                emit!(c, Instruction::GetIter);
                c.use_label(start);
                emit!(c, Instruction::ForIter { target: cleanup });
                c.compile_store(target)?;
                c.compile_statements(body)?;
                emit!(c, Instruction::Jump { target: start });

                // exhausted normally; `break` jumps past this to `end`
                c.use_label(cleanup);
                emit!(c, Instruction::EndFor);
                emit!(c, Instruction::PopTop);
                Ok(())
            },
        )?;
        self.compile_statements(orelse)?;
        self.use_label(end);
        Ok(())
    }

    fn compile_async_for(
        &mut self,
        target: &Expr,
        iter: &Expr,
        body: &[Stmt],
        orelse: &[Stmt],
    ) -> CompileResult<()> {
        self.check_async_allowed("async for")?;
        let start = self.new_label();
        let except = self.new_label();
        let end = self.new_label();

        self.compile_expression(iter)?;
        emit!(self, Instruction::GetAIter);

        self.use_label(start);
        self.with_fblock(
            FBlockType::ForLoop,
            Some(start),
            Some(end),
            FBlockDatum::None,
            |c| {
                emit!(c, Instruction::SetupFinally { target: except });
                emit!(c, Instruction::GetANext);
                c.emit_load_const(ConstantData::None);
                c.emit_yield_from(true);
                emit!(c, Instruction::PopBlock);

                c.compile_store(target)?;
                c.compile_statements(body)?;
                emit!(c, Instruction::Jump { target: start });
                Ok(())
            },
        )?;

        self.use_label(except);
        self.set_source_range(iter.range());
        emit!(self, Instruction::EndAsyncFor);
        self.compile_statements(orelse)?;
        self.use_label(end);
        Ok(())
    }

    // Exceptions

    fn compile_try(&mut self, stmt: &StmtTry) -> CompileResult<()> {
        if !stmt.finalbody.is_empty() {
            self.compile_try_finally(stmt)
        } else if stmt.is_star {
            self.compile_try_star_except(stmt)
        } else {
            self.compile_try_except(stmt)
        }
    }

    fn compile_try_finally(&mut self, stmt: &StmtTry) -> CompileResult<()> {
        let finalbody = &stmt.finalbody;
        self.warn_finally_exits(finalbody)?;

        let body = self.new_label();
        let end = self.new_label();
        let exit = self.new_label();
        let cleanup = self.new_label();

        emit!(self, Instruction::SetupFinally { target: end });
        self.use_label(body);
        self.with_fblock(
            FBlockType::FinallyTry,
            Some(body),
            Some(end),
            FBlockDatum::FinallyBody(finalbody.clone()),
            |c| match (stmt.handlers.is_empty(), stmt.is_star) {
                (true, _) => c.compile_statements(&stmt.body),
                (false, true) => c.compile_try_star_except(stmt),
                (false, false) => c.compile_try_except(stmt),
            },
        )?;
        emit!(self, Instruction::PopBlock);
        self.compile_statements(finalbody)?;
        emit!(self, Instruction::JumpNoInterrupt { target: exit });

        // reached with an exception in flight
        self.use_label(end);
        emit!(self, Instruction::SetupCleanup { target: cleanup });
        emit!(self, Instruction::PushExcInfo);
        self.with_fblock(
            FBlockType::FinallyEnd,
            Some(end),
            None,
            FBlockDatum::None,
            |c| c.compile_statements(finalbody),
        )?;
        emit!(self, Instruction::Reraise { depth: 0 });

        self.use_label(cleanup);
        self.emit_pop_except_and_reraise();
        self.use_label(exit);
        Ok(())
    }

    fn compile_try_except(&mut self, stmt: &StmtTry) -> CompileResult<()> {
        let body = self.new_label();
        let except = self.new_label();
        let end = self.new_label();
        let cleanup = self.new_label();

        emit!(self, Instruction::SetupFinally { target: except });
        self.use_label(body);
        self.with_fblock(
            FBlockType::TryExcept,
            Some(body),
            None,
            FBlockDatum::None,
            |c| c.compile_statements(&stmt.body),
        )?;
        emit!(self, Instruction::PopBlock);
        self.compile_statements(&stmt.orelse)?;
        emit!(self, Instruction::JumpNoInterrupt { target: end });

        self.use_label(except);
        emit!(self, Instruction::SetupCleanup { target: cleanup });
        emit!(self, Instruction::PushExcInfo);
        self.with_fblock(
            FBlockType::ExceptionHandler,
            None,
            None,
            FBlockDatum::None,
            |c| {
                let count = stmt.handlers.len();
                for (i, handler) in stmt.handlers.iter().enumerate() {
                    let ExceptHandler::ExceptHandler(ExceptHandlerExceptHandler {
                        type_,
                        name,
                        body,
                        range,
                        ..
                    }) = handler;
                    c.set_source_range(*range);
                    if type_.is_none() && i + 1 < count {
                        return Err(c.error(CodegenErrorType::SyntaxError(
                            "default 'except:' must be last".to_owned(),
                        )));
                    }
                    let next_except = c.new_label();
                    if let Some(type_) = type_ {
                        c.compile_expression(type_)?;
                        emit!(c, Instruction::CheckExcMatch);
                        emit!(c, Instruction::PopJumpIfFalse {
                            target: next_except
                        });
                    }
                    match name {
                        Some(name) => c.compile_named_handler_body(name.as_str(), body, end)?,
                        None => {
                            let cleanup_body = c.new_label();
                            emit!(c, Instruction::PopTop);
                            c.use_label(cleanup_body);
                            c.with_fblock(
                                FBlockType::HandlerCleanup,
                                Some(cleanup_body),
                                None,
                                FBlockDatum::None,
                                |c| c.compile_statements(body),
                            )?;
                            emit!(c, Instruction::PopBlock);
                            emit!(c, Instruction::PopExcept);
                            emit!(c, Instruction::JumpNoInterrupt { target: end });
                        }
                    }
                    c.use_label(next_except);
                }
                Ok(())
            },
        )?;
        emit!(self, Instruction::Reraise { depth: 0 });

        self.use_label(cleanup);
        self.emit_pop_except_and_reraise();
        self.use_label(end);
        Ok(())
    }

    /// `except E as name:` runs its body as if wrapped in
    /// `try: ... finally: name = None; del name`.
    fn compile_named_handler_body(
        &mut self,
        name: &str,
        body: &[Stmt],
        end: Label,
    ) -> CompileResult<()> {
        let cleanup_end = self.new_label();
        let cleanup_body = self.new_label();

        self.compile_name(name, NameUsage::Store)?;
        emit!(self, Instruction::SetupCleanup {
            target: cleanup_end
        });
        self.use_label(cleanup_body);
        self.with_fblock(
            FBlockType::HandlerCleanup,
            Some(cleanup_body),
            None,
            FBlockDatum::ExceptionName(name.to_owned()),
            |c| c.compile_statements(body),
        )?;
        emit!(self, Instruction::PopBlock);
        emit!(self, Instruction::PopBlock);
        emit!(self, Instruction::PopExcept);
        self.emit_clear_name(name)?;
        emit!(self, Instruction::JumpNoInterrupt { target: end });

        self.use_label(cleanup_end);
        self.emit_clear_name(name)?;
        emit!(self, Instruction::Reraise { depth: 1 });
        Ok(())
    }

    /// `name = None; del name`
    fn emit_clear_name(&mut self, name: &str) -> CompileResult<()> {
        self.emit_load_const(ConstantData::None);
        self.compile_name(name, NameUsage::Store)?;
        self.compile_name(name, NameUsage::Delete)
    }

    /// `except*`: every matching clause runs; exceptions raised by the
    /// clauses and the unmatched rest are collected into a list and merged
    /// back into one group by `PREP_RERAISE_STAR`.
    fn compile_try_star_except(&mut self, stmt: &StmtTry) -> CompileResult<()> {
        let body = self.new_label();
        let except = self.new_label();
        let orelse = self.new_label();
        let end = self.new_label();
        let cleanup = self.new_label();
        let reraise_star = self.new_label();

        emit!(self, Instruction::SetupFinally { target: except });
        self.use_label(body);
        self.with_fblock(
            FBlockType::TryExcept,
            Some(body),
            None,
            FBlockDatum::None,
            |c| c.compile_statements(&stmt.body),
        )?;
        emit!(self, Instruction::PopBlock);
        emit!(self, Instruction::JumpNoInterrupt { target: orelse });

        self.use_label(except);
        emit!(self, Instruction::SetupCleanup { target: cleanup });
        emit!(self, Instruction::PushExcInfo);
        self.with_fblock(
            FBlockType::ExceptionGroupHandler,
            None,
            None,
            FBlockDatum::None,
            |c| {
                let count = stmt.handlers.len();
                for (i, handler) in stmt.handlers.iter().enumerate() {
                    let ExceptHandler::ExceptHandler(ExceptHandlerExceptHandler {
                        type_,
                        name,
                        body,
                        range,
                        ..
                    }) = handler;
                    c.set_source_range(*range);
                    let next_except = c.new_label();
                    let except_with_error = c.new_label();
                    let no_match = c.new_label();
                    if i == 0 {
                        // [orig] -> [orig, raised, exc]
                        emit!(c, Instruction::BuildList { size: 0 });
                        emit!(c, Instruction::Copy { index: 2 });
                    }
                    if let Some(type_) = type_ {
                        c.compile_expression(type_)?;
                        emit!(c, Instruction::CheckEgMatch);
                        emit!(c, Instruction::Copy { index: 1 });
                        emit!(c, Instruction::PopJumpIfNone { target: no_match });
                    }

                    let cleanup_end = c.new_label();
                    let cleanup_body = c.new_label();
                    let name = name.as_ref().map(Identifier::as_str);
                    match name {
                        Some(name) => c.compile_name(name, NameUsage::Store)?,
                        None => emit!(c, Instruction::PopTop),
                    }
                    emit!(c, Instruction::SetupCleanup {
                        target: cleanup_end
                    });
                    c.use_label(cleanup_body);
                    let datum = name.map_or(FBlockDatum::None, |n| {
                        FBlockDatum::ExceptionName(n.to_owned())
                    });
                    c.with_fblock(
                        FBlockType::HandlerCleanup,
                        Some(cleanup_body),
                        None,
                        datum,
                        |c| c.compile_statements(body),
                    )?;
                    emit!(c, Instruction::PopBlock);
                    if let Some(name) = name {
                        c.emit_clear_name(name)?;
                    }
                    emit!(c, Instruction::JumpNoInterrupt {
                        target: next_except
                    });

                    // the clause body raised: add that exception to the list
                    c.use_label(cleanup_end);
                    if let Some(name) = name {
                        c.emit_clear_name(name)?;
                    }
                    emit!(c, Instruction::ListAppend { i: 3 });
                    emit!(c, Instruction::PopTop);
                    emit!(c, Instruction::JumpNoInterrupt {
                        target: except_with_error
                    });

                    c.use_label(next_except);
                    emit!(c, Instruction::Nop);
                    emit!(c, Instruction::JumpNoInterrupt {
                        target: except_with_error
                    });

                    c.use_label(no_match);
                    emit!(c, Instruction::PopTop);

                    c.use_label(except_with_error);
                    if i + 1 == count {
                        // whatever was not matched joins the list too
                        emit!(c, Instruction::ListAppend { i: 1 });
                        emit!(c, Instruction::JumpNoInterrupt {
                            target: reraise_star
                        });
                    }
                }
                Ok(())
            },
        )?;

        let reraise = self.new_label();
        self.use_label(reraise_star);
        emit!(
            self,
            Instruction::CallIntrinsic2 {
                func: IntrinsicFunction2::PrepReraiseStar
            }
        );
        emit!(self, Instruction::Copy { index: 1 });
        emit!(self, Instruction::PopJumpIfNotNone { target: reraise });

        // nothing left to raise
        emit!(self, Instruction::PopTop);
        emit!(self, Instruction::PopBlock);
        emit!(self, Instruction::PopExcept);
        emit!(self, Instruction::JumpNoInterrupt { target: end });

        self.use_label(reraise);
        emit!(self, Instruction::PopBlock);
        emit!(self, Instruction::Swap { index: 2 });
        emit!(self, Instruction::PopExcept);
        emit!(self, Instruction::Reraise { depth: 0 });

        self.use_label(cleanup);
        self.emit_pop_except_and_reraise();

        self.use_label(orelse);
        self.compile_statements(&stmt.orelse)?;
        self.use_label(end);
        Ok(())
    }

    pub(super) fn emit_pop_except_and_reraise(&mut self) {
        // [exc_info, lasti, exc] -> restore exc_info, raise exc
        emit!(self, Instruction::Copy { index: 3 });
        emit!(self, Instruction::PopExcept);
        emit!(self, Instruction::Reraise { depth: 1 });
    }

    /// Warn about `return`, `break` and `continue` that would leave a
    /// `finally` block and swallow the exception in flight.
    fn warn_finally_exits(&mut self, finalbody: &[Stmt]) -> CompileResult<()> {
        let mut exits = Vec::new();
        collect_finally_exits(finalbody, false, &mut exits);
        for (keyword, range) in exits {
            self.warn_ranged(format!("'{keyword}' in a 'finally' block"), range)?;
        }
        Ok(())
    }

    // Context managers

    /// One `with` item at a time; the body of item k is the `with` of item k+1.
    fn compile_with(&mut self, items: &[WithItem], body: &[Stmt], is_async: bool) -> CompileResult<()> {
        let Some((item, rest)) = items.split_first() else {
            return self.compile_statements(body);
        };
        let block = self.new_label();
        let final_ = self.new_label();
        let exit = self.new_label();
        let cleanup = self.new_label();

        self.compile_expression(&item.context_expr)?;
        self.set_source_range(item.context_expr.range());
        let (enter, exit_method) = if is_async {
            (SpecialMethod::AEnter, SpecialMethod::AExit)
        } else {
            (SpecialMethod::Enter, SpecialMethod::Exit)
        };
        emit!(self, Instruction::Copy { index: 1 });
        emit!(self, Instruction::LoadSpecial {
            method: exit_method
        });
        emit!(self, Instruction::Swap { index: 2 });
        emit!(self, Instruction::Swap { index: 3 });
        emit!(self, Instruction::LoadSpecial { method: enter });
        emit!(self, Instruction::Call { nargs: 0 });
        if is_async {
            emit!(
                self,
                Instruction::GetAwaitable {
                    kind: AwaitableKind::AEnter
                }
            );
            self.emit_load_const(ConstantData::None);
            self.emit_yield_from(true);
        }
        emit!(self, Instruction::SetupWith { target: final_ });

        self.use_label(block);
        let fb_type = if is_async {
            FBlockType::AsyncWith
        } else {
            FBlockType::With
        };
        self.with_fblock(fb_type, Some(block), Some(final_), FBlockDatum::None, |c| {
            match &item.optional_vars {
                Some(var) => c.compile_store(var)?,
                None => emit!(c, Instruction::PopTop),
            }
            c.compile_with(rest, body, is_async)
        })?;
        self.set_source_range(item.context_expr.range());
        emit!(self, Instruction::PopBlock);

        // normal exit: __exit__(None, None, None)
        self.emit_call_exit_with_nones();
        if is_async {
            emit!(
                self,
                Instruction::GetAwaitable {
                    kind: AwaitableKind::AExit
                }
            );
            self.emit_load_const(ConstantData::None);
            self.emit_yield_from(true);
        }
        emit!(self, Instruction::PopTop);
        emit!(self, Instruction::Jump { target: exit });

        // exceptional exit
        self.use_label(final_);
        emit!(self, Instruction::SetupCleanup { target: cleanup });
        emit!(self, Instruction::PushExcInfo);
        emit!(self, Instruction::WithExceptStart);
        if is_async {
            emit!(
                self,
                Instruction::GetAwaitable {
                    kind: AwaitableKind::AExit
                }
            );
            self.emit_load_const(ConstantData::None);
            self.emit_yield_from(true);
        }
        self.compile_with_except_finish(cleanup);
        self.use_label(exit);
        Ok(())
    }

    /// Re-raise unless `__exit__` returned a true value.
    fn compile_with_except_finish(&mut self, cleanup: Label) {
        let suppress = self.new_label();
        let exit = self.new_label();
        emit!(self, Instruction::ToBool);
        emit!(self, Instruction::PopJumpIfTrue { target: suppress });
        emit!(self, Instruction::Reraise { depth: 2 });

        self.use_label(suppress);
        emit!(self, Instruction::PopTop);
        emit!(self, Instruction::PopBlock);
        emit!(self, Instruction::PopExcept);
        emit!(self, Instruction::PopTop);
        emit!(self, Instruction::PopTop);
        emit!(self, Instruction::PopTop);
        emit!(self, Instruction::JumpNoInterrupt { target: exit });

        self.use_label(cleanup);
        self.emit_pop_except_and_reraise();
        self.use_label(exit);
    }

    // Imports

    fn compile_import(&mut self, names: &[Alias]) -> CompileResult<()> {
        for alias in names {
            self.emit_load_const(ConstantData::Integer {
                value: BigInt::from(0),
            });
            self.emit_load_const(ConstantData::None);
            let idx = self.name(alias.name.as_str());
            emit!(self, Instruction::ImportName { idx });

            let module = alias.name.as_str();
            match &alias.asname {
                // `import a.b.c as d` binds the innermost module
                Some(asname) => {
                    let mut parts = module.split('.').skip(1).peekable();
                    let dotted = parts.peek().is_some();
                    while let Some(part) = parts.next() {
                        let idx = self.name(part);
                        emit!(self, Instruction::ImportFrom { idx });
                        if parts.peek().is_some() {
                            emit!(self, Instruction::Swap { index: 2 });
                            emit!(self, Instruction::PopTop);
                        }
                    }
                    self.compile_name(asname.as_str(), NameUsage::Store)?;
                    if dotted {
                        emit!(self, Instruction::PopTop);
                    }
                }
                None => {
                    let top = module.split('.').next().unwrap_or(module);
                    self.compile_name(top, NameUsage::Store)?;
                }
            }
        }
        Ok(())
    }

    fn compile_import_from(&mut self, stmt: &StmtImportFrom) -> CompileResult<()> {
        let StmtImportFrom {
            module,
            names,
            level,
            ..
        } = stmt;
        let import_star = names.iter().any(|alias| alias.name.as_str() == "*");
        if import_star && self.current_symbol_table().typ != crate::symboltable::CompilerScope::Module
        {
            return Err(self.error(CodegenErrorType::FunctionImportStar));
        }

        self.emit_load_const(ConstantData::Integer {
            value: BigInt::from(*level),
        });
        let from_list = names
            .iter()
            .map(|alias| ConstantData::str(alias.name.as_str()))
            .collect();
        self.emit_load_const(ConstantData::Tuple {
            elements: from_list,
        });
        let module_name = module.as_ref().map_or("", Identifier::as_str);
        let idx = self.name(module_name);
        emit!(self, Instruction::ImportName { idx });

        if import_star {
            emit!(
                self,
                Instruction::CallIntrinsic1 {
                    func: IntrinsicFunction1::ImportStar
                }
            );
            emit!(self, Instruction::PopTop);
            return Ok(());
        }
        for alias in names {
            let idx = self.name(alias.name.as_str());
            emit!(self, Instruction::ImportFrom { idx });
            let store_name = alias.asname.as_ref().unwrap_or(&alias.name);
            self.compile_name(store_name.as_str(), NameUsage::Store)?;
        }
        // the module itself
        emit!(self, Instruction::PopTop);
        Ok(())
    }

    fn compile_assert(&mut self, stmt: &StmtAssert) -> CompileResult<()> {
        let StmtAssert { test, msg, .. } = stmt;
        if matches!(&**test, Expr::Tuple(ExprTuple { elts, .. }) if !elts.is_empty()) {
            self.warn("assertion is always true, perhaps remove parentheses?")?;
        }
        if self.opts.optimize > 0 {
            return Ok(());
        }
        let end = self.new_label();
        self.compile_jump_if(test, true, end)?;
        self.set_source_range(stmt.range());
        emit!(
            self,
            Instruction::LoadCommonConstant {
                idx: CommonConstant::AssertionError
            }
        );
        if let Some(msg) = msg {
            self.compile_expression(msg)?;
            self.set_source_range(stmt.range());
            emit!(self, Instruction::Call { nargs: 0 });
        }
        self.set_source_range(test.range());
        emit!(
            self,
            Instruction::RaiseVarargs {
                kind: RaiseKind::Raise
            }
        );
        self.use_label(end);
        Ok(())
    }

    // Assignment

    pub(super) fn check_forbidden_name(&self, name: &str, usage: NameUsage) -> CompileResult<()> {
        if name != "__debug__" {
            return Ok(());
        }
        match usage {
            NameUsage::Store => Err(self.error(CodegenErrorType::Assign("__debug__"))),
            NameUsage::Delete => Err(self.error(CodegenErrorType::Delete("__debug__"))),
            NameUsage::Load => Ok(()),
        }
    }

    /// Store the value on top of the stack into an assignment target.
    pub(super) fn compile_store(&mut self, target: &Expr) -> CompileResult<()> {
        match target {
            Expr::Name(ExprName { id, .. }) => {
                self.check_forbidden_name(id.as_str(), NameUsage::Store)?;
                self.compile_name(id.as_str(), NameUsage::Store)?;
            }
            Expr::Attribute(ExprAttribute { value, attr, .. }) => {
                self.check_forbidden_name(attr.as_str(), NameUsage::Store)?;
                self.maybe_add_static_attribute(value, attr.as_str());
                self.compile_expression(value)?;
                self.set_source_range(target.range());
                let idx = self.name(attr.as_str());
                emit!(self, Instruction::StoreAttr { idx });
            }
            Expr::Subscript(ExprSubscript { value, slice, .. }) => {
                self.compile_subscript(value, slice, NameUsage::Store)?;
            }
            Expr::List(ExprList { elts, .. }) | Expr::Tuple(ExprTuple { elts, .. }) => {
                self.compile_unpack(elts, target.range())?;
                for element in elts {
                    match element {
                        Expr::Starred(ExprStarred { value, .. }) => self.compile_store(value)?,
                        _ => self.compile_store(element)?,
                    }
                }
            }
            Expr::Starred(_) => {
                return Err(self.error_ranged(
                    CodegenErrorType::SyntaxError(
                        "starred assignment target must be in a list or tuple".to_owned(),
                    ),
                    target.range(),
                ));
            }
            _ => {
                return Err(self.error_ranged(
                    CodegenErrorType::Assign(target.python_name()),
                    target.range(),
                ));
            }
        }
        Ok(())
    }

    /// `UNPACK_SEQUENCE`, or `UNPACK_EX` when one element is starred.
    fn compile_unpack(&mut self, elts: &[Expr], range: TextRange) -> CompileResult<()> {
        let mut starred = elts
            .iter()
            .enumerate()
            .filter(|(_, elt)| matches!(elt, Expr::Starred(_)));
        match (starred.next(), starred.next()) {
            (None, _) => emit!(self, Instruction::UnpackSequence {
                size: elts.len().to_u32()
            }),
            (Some((before, _)), None) => {
                let after = elts.len() - before - 1;
                let (Ok(before), Ok(after)) = (u8::try_from(before), u8::try_from(after)) else {
                    return Err(self.error_ranged(CodegenErrorType::TooManyStarUnpack, range));
                };
                emit!(self, Instruction::UnpackEx {
                    args: UnpackExArgs { before, after }
                });
            }
            (Some(_), Some(_)) => {
                return Err(self.error_ranged(CodegenErrorType::MultipleStarArgs, range));
            }
        }
        Ok(())
    }

    fn compile_delete(&mut self, target: &Expr) -> CompileResult<()> {
        self.set_source_range(target.range());
        match target {
            Expr::Name(ExprName { id, .. }) => {
                self.check_forbidden_name(id.as_str(), NameUsage::Delete)?;
                self.compile_name(id.as_str(), NameUsage::Delete)?;
            }
            Expr::Attribute(ExprAttribute { value, attr, .. }) => {
                self.check_forbidden_name(attr.as_str(), NameUsage::Delete)?;
                self.compile_expression(value)?;
                self.set_source_range(target.range());
                let idx = self.name(attr.as_str());
                emit!(self, Instruction::DeleteAttr { idx });
            }
            Expr::Subscript(ExprSubscript { value, slice, .. }) => {
                self.compile_subscript(value, slice, NameUsage::Delete)?;
            }
            Expr::Tuple(ExprTuple { elts, .. }) | Expr::List(ExprList { elts, .. }) => {
                for element in elts {
                    self.compile_delete(element)?;
                }
            }
            _ => return Err(self.error(CodegenErrorType::Delete(target.python_name()))),
        }
        Ok(())
    }

    fn compile_augassign(&mut self, stmt: &StmtAugAssign) -> CompileResult<()> {
        let StmtAugAssign {
            target, op, value, ..
        } = stmt;
        enum Kind<'a> {
            Name(&'a str),
            Attr(&'a str),
            Subscript,
            Slice,
        }

        self.set_source_range(target.range());
        let kind = match &**target {
            Expr::Name(ExprName { id, .. }) => {
                self.check_forbidden_name(id.as_str(), NameUsage::Store)?;
                self.compile_name(id.as_str(), NameUsage::Load)?;
                Kind::Name(id.as_str())
            }
            Expr::Attribute(ExprAttribute { value, attr, .. }) => {
                self.check_forbidden_name(attr.as_str(), NameUsage::Store)?;
                self.compile_expression(value)?;
                emit!(self, Instruction::Copy { index: 1 });
                let idx = self.name(attr.as_str());
                self.emit_load_attr(idx, false);
                Kind::Attr(attr.as_str())
            }
            Expr::Subscript(ExprSubscript { value, slice, .. }) => {
                self.compile_expression(value)?;
                if let Expr::Slice(slice) = &**slice
                    && slice.step.is_none()
                {
                    self.compile_slice_bounds(slice)?;
                    emit!(self, Instruction::Copy { index: 3 });
                    emit!(self, Instruction::Copy { index: 3 });
                    emit!(self, Instruction::Copy { index: 3 });
                    emit!(self, Instruction::BinarySlice);
                    Kind::Slice
                } else {
                    self.compile_expression(slice)?;
                    emit!(self, Instruction::Copy { index: 2 });
                    emit!(self, Instruction::Copy { index: 2 });
                    emit!(self, Instruction::BinarySubscr);
                    Kind::Subscript
                }
            }
            _ => return Err(self.error(CodegenErrorType::Assign(target.python_name()))),
        };

        self.compile_expression(value)?;
        self.set_source_range(stmt.range());
        let op = super::expr::binary_operator(*op).as_inplace();
        emit!(self, Instruction::BinaryOp { op });

        self.set_source_range(target.range());
        match kind {
            Kind::Name(name) => self.compile_name(name, NameUsage::Store)?,
            Kind::Attr(attr) => {
                emit!(self, Instruction::Swap { index: 2 });
                let idx = self.name(attr);
                emit!(self, Instruction::StoreAttr { idx });
            }
            Kind::Subscript => {
                emit!(self, Instruction::Swap { index: 3 });
                emit!(self, Instruction::Swap { index: 2 });
                emit!(self, Instruction::StoreSubscr);
            }
            Kind::Slice => {
                emit!(self, Instruction::Swap { index: 4 });
                emit!(self, Instruction::Swap { index: 3 });
                emit!(self, Instruction::Swap { index: 2 });
                emit!(self, Instruction::StoreSlice);
            }
        }
        Ok(())
    }

    fn compile_annassign(&mut self, stmt: &StmtAnnAssign) -> CompileResult<()> {
        let StmtAnnAssign {
            target,
            annotation,
            value,
            simple,
            ..
        } = stmt;
        if let Some(value) = value {
            self.compile_expression(value)?;
            self.compile_store(target)?;
        }
        let module_or_class = matches!(
            self.current_symbol_table().typ,
            crate::symboltable::CompilerScope::Module | crate::symboltable::CompilerScope::Class
        );
        match &**target {
            Expr::Name(ExprName { id, .. }) => {
                if *simple && module_or_class {
                    let mangled = self.mangle(id.as_str()).into_owned();
                    if self.future_annotations {
                        self.set_source_range(stmt.range());
                        self.compile_annotation(annotation)?;
                        let idx = self.name_index("__annotations__");
                        emit!(self, Instruction::LoadName(idx));
                        self.emit_load_const(ConstantData::str(mangled));
                        emit!(self, Instruction::StoreSubscr);
                    } else {
                        self.unit.deferred_annotations.push(super::DeferredAnnotation {
                            name: mangled,
                            annotation: (**annotation).clone(),
                            range: stmt.range(),
                        });
                    }
                }
            }
            Expr::Attribute(ExprAttribute { value: object, .. }) => {
                if value.is_none() {
                    self.compile_check_ann_expr(object)?;
                }
            }
            Expr::Subscript(ExprSubscript {
                value: object,
                slice,
                ..
            }) => {
                if value.is_none() {
                    self.compile_check_ann_expr(object)?;
                    self.compile_check_ann_subscript(slice)?;
                }
            }
            _ => return Err(self.error(CodegenErrorType::Assign(target.python_name()))),
        }
        // complex targets evaluate their annotation, outside future mode
        if !*simple && !self.future_annotations && module_or_class {
            self.compile_check_ann_expr(annotation)?;
        }
        Ok(())
    }

    fn compile_check_ann_expr(&mut self, expr: &Expr) -> CompileResult<()> {
        self.compile_expression(expr)?;
        emit!(self, Instruction::PopTop);
        Ok(())
    }

    fn compile_check_ann_subscript(&mut self, slice: &Expr) -> CompileResult<()> {
        match slice {
            Expr::Slice(slice) => {
                for bound in [&slice.lower, &slice.upper, &slice.step]
                    .into_iter()
                    .flatten()
                {
                    self.compile_check_ann_expr(bound)?;
                }
                Ok(())
            }
            Expr::Tuple(ExprTuple { elts, .. }) => {
                for elt in elts {
                    self.compile_check_ann_subscript(elt)?;
                }
                Ok(())
            }
            _ => self.compile_check_ann_expr(slice),
        }
    }
}

fn is_literal(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::StringLiteral(_)
            | Expr::BytesLiteral(_)
            | Expr::NumberLiteral(_)
            | Expr::BooleanLiteral(_)
            | Expr::NoneLiteral(_)
            | Expr::EllipsisLiteral(_)
    )
}

/// `return` anywhere in a `finally` body, and `break`/`continue` that are
/// not inside a loop of their own, skipping nested scopes.
fn collect_finally_exits(body: &[Stmt], in_loop: bool, exits: &mut Vec<(&'static str, TextRange)>) {
    for stmt in body {
        match stmt {
            Stmt::Return(s) => exits.push(("return", s.range)),
            Stmt::Break(s) if !in_loop => exits.push(("break", s.range)),
            Stmt::Continue(s) if !in_loop => exits.push(("continue", s.range)),
            Stmt::For(s) => {
                collect_finally_exits(&s.body, true, exits);
                collect_finally_exits(&s.orelse, in_loop, exits);
            }
            Stmt::While(s) => {
                collect_finally_exits(&s.body, true, exits);
                collect_finally_exits(&s.orelse, in_loop, exits);
            }
            Stmt::If(s) => {
                collect_finally_exits(&s.body, in_loop, exits);
                for clause in &s.elif_else_clauses {
                    collect_finally_exits(&clause.body, in_loop, exits);
                }
            }
            Stmt::With(s) => collect_finally_exits(&s.body, in_loop, exits),
            Stmt::Try(s) => {
                collect_finally_exits(&s.body, in_loop, exits);
                for ExceptHandler::ExceptHandler(handler) in &s.handlers {
                    collect_finally_exits(&handler.body, in_loop, exits);
                }
                collect_finally_exits(&s.orelse, in_loop, exits);
                collect_finally_exits(&s.finalbody, in_loop, exits);
            }
            Stmt::Match(s) => {
                for case in &s.cases {
                    collect_finally_exits(&case.body, in_loop, exits);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{CompileOpts, test_support::*};
    use crate::error::CodegenErrorType;
    use pylower_compiler_core::bytecode::Instruction;

    #[test]
    fn if_elif_else() {
        let code = compile("if a:\n    x = 1\nelif b:\n    x = 2\nelse:\n    x = 3\n");
        insta::assert_snapshot!(listing(&code), @r"
        RESUME(AtFuncStart)
        LOAD_NAME(0, a)
        TO_BOOL
        POP_JUMP_IF_FALSE(7)
        LOAD_CONST(1)
        STORE_NAME(1, x)
        JUMP_NO_INTERRUPT(15)
        LOAD_NAME(2, b)
        TO_BOOL
        POP_JUMP_IF_FALSE(13)
        LOAD_CONST(2)
        STORE_NAME(1, x)
        JUMP_NO_INTERRUPT(15)
        LOAD_CONST(3)
        STORE_NAME(1, x)
        LOAD_CONST(None)
        RETURN_VALUE
        ");
    }

    #[test]
    fn for_loop_shape() {
        let code = compile("for x in y:\n    pass\nelse:\n    z = 1\n");
        insta::assert_snapshot!(listing(&code), @r"
        RESUME(AtFuncStart)
        LOAD_NAME(0, y)
        GET_ITER
        FOR_ITER(7)
        STORE_NAME(1, x)
        NOP
        JUMP(3)
        END_FOR
        POP_TOP
        LOAD_CONST(1)
        STORE_NAME(2, z)
        LOAD_CONST(None)
        RETURN_VALUE
        ");
    }

    #[test]
    fn while_loop_with_break_and_continue() {
        let code = compile("while a:\n    if b:\n        break\n    continue\n");
        let ops = ops(&code);
        let jumps = ops
            .iter()
            .filter(|op| matches!(op, Instruction::Jump { .. }))
            .count();
        // break, continue and the back edge
        assert_eq!(jumps, 3);
    }

    #[test]
    fn try_except_with_name_clears_it() {
        let code = compile("try:\n    f()\nexcept E as e:\n    g(e)\n");
        let text = listing(&code);
        assert!(text.contains("CHECK_EXC_MATCH"), "{text}");
        assert_eq!(text.matches("DELETE_NAME").count(), 2, "{text}");
        assert!(text.contains("PUSH_EXC_INFO"), "{text}");
        assert!(text.contains("COPY(3)\nPOP_EXCEPT\nRERAISE(1)"), "{text}");
    }

    #[test]
    fn bare_except_must_be_last() {
        assert!(matches!(
            compile_error("try:\n    pass\nexcept:\n    pass\nexcept E:\n    pass\n"),
            CodegenErrorType::SyntaxError(msg) if msg == "default 'except:' must be last"
        ));
    }

    #[test]
    fn finally_body_is_duplicated_for_both_paths() {
        let code = compile("try:\n    f()\nfinally:\n    g()\n");
        let text = listing(&code);
        assert_eq!(text.matches("LOAD_NAME(1, g)").count(), 2, "{text}");
        assert!(text.contains("RERAISE(0)"), "{text}");
    }

    #[test]
    fn try_star_prepares_reraise() {
        let code = compile("try:\n    f()\nexcept* ValueError as e:\n    pass\n");
        let text = listing(&code);
        assert!(text.contains("CHECK_EG_MATCH"), "{text}");
        assert!(text.contains("CALL_INTRINSIC_2(PrepReraiseStar)"), "{text}");
        assert!(text.contains("LIST_APPEND(3)"), "{text}");
    }

    #[test]
    fn with_statement_shape() {
        let code = compile("with a as b:\n    pass\n");
        let text = listing(&code);
        assert!(
            text.contains(
                "COPY(1)\nLOAD_SPECIAL(__exit__)\nSWAP(2)\nSWAP(3)\nLOAD_SPECIAL(__enter__)\nCALL(0)"
            ),
            "{text}"
        );
        assert!(text.contains("WITH_EXCEPT_START"), "{text}");
        assert!(text.contains("RERAISE(2)"), "{text}");
    }

    #[test]
    fn multiple_with_items_nest() {
        let code = compile("with a, b:\n    pass\n");
        let setups = ops(&code)
            .iter()
            .filter(|op| matches!(op, Instruction::SetupWith { .. }))
            .count();
        assert_eq!(setups, 2);
    }

    #[test]
    fn async_with_outside_async_function() {
        assert_eq!(
            compile_error("def f():\n    async with a:\n        pass\n"),
            CodegenErrorType::AsyncOutsideFunction("async with")
        );
        compile("async def f():\n    async with a:\n        pass\n    async for x in y:\n        pass\n");
    }

    #[test]
    fn dotted_import_as() {
        let code = compile("import a.b.c as d\n");
        insta::assert_snapshot!(listing(&code), @r"
        RESUME(AtFuncStart)
        LOAD_CONST(0)
        LOAD_CONST(None)
        IMPORT_NAME(0, a.b.c)
        IMPORT_FROM(1, b)
        SWAP(2)
        POP_TOP
        IMPORT_FROM(2, c)
        STORE_NAME(3, d)
        POP_TOP
        LOAD_CONST(None)
        RETURN_VALUE
        ");
    }

    #[test]
    fn plain_dotted_import_binds_top_package() {
        let code = compile("import os.path\n");
        assert!(listing(&code).contains("STORE_NAME(1, os)"));
    }

    #[test]
    fn from_import() {
        let code = compile("from ..pkg import a, b as c\n");
        let text = listing(&code);
        assert!(text.starts_with("RESUME(AtFuncStart)\nLOAD_CONST(2)\nLOAD_CONST((\"a\", \"b\"))"), "{text}");
        assert!(text.contains("IMPORT_FROM(1, a)\nSTORE_NAME(1, a)"), "{text}");
        assert!(text.contains("STORE_NAME(3, c)\nPOP_TOP"), "{text}");
    }

    #[test]
    fn import_star_only_at_module_level() {
        compile("from m import *\n");
        assert_eq!(
            compile_error("def f():\n    from m import *\n"),
            CodegenErrorType::FunctionImportStar
        );
    }

    #[test]
    fn assert_uses_common_constant() {
        let code = compile("assert x, 'msg'\n");
        let text = listing(&code);
        assert!(text.contains("LOAD_COMMON_CONSTANT(AssertionError)"), "{text}");
        assert!(text.contains("CALL(0)\nRAISE_VARARGS(Raise)"), "{text}");

        let out = compile_with(
            "assert x\n",
            CompileOpts {
                optimize: 1,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(!listing(&out.code).contains("RAISE_VARARGS"));
    }

    #[test]
    fn assert_on_tuple_warns() {
        let out = compile_with("assert (x, 'msg')\n", CompileOpts::default()).unwrap();
        assert_eq!(
            out.warnings[0].message,
            "assertion is always true, perhaps remove parentheses?"
        );
        let err = compile_with(
            "assert (x, 'msg')\n",
            CompileOpts {
                warnings_as_errors: true,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err.error, CodegenErrorType::SyntaxError(_)));
    }

    #[test]
    fn return_in_finally_warns() {
        let out = compile_with(
            "def f():\n    try:\n        pass\n    finally:\n        for x in y:\n            break\n        return 1\n",
            CompileOpts::default(),
        )
        .unwrap();
        let messages: Vec<_> = out.warnings.iter().map(|w| w.message.as_str()).collect();
        assert_eq!(messages, ["'return' in a 'finally' block"]);
    }

    #[test]
    fn chained_and_starred_assignment() {
        let code = compile("a = b = c\nx, *y, z = w\n");
        let text = listing(&code);
        assert!(text.contains("COPY(1)\nSTORE_NAME(1, a)\nSTORE_NAME(2, b)"), "{text}");
        assert!(text.contains("UNPACK_EX("), "{text}");
        assert_eq!(
            compile_error("*a, *b = c\n"),
            CodegenErrorType::MultipleStarArgs
        );
    }

    #[test]
    fn augmented_subscript_and_slice() {
        let code = compile("a[i] += 1\na[1:2] -= 1\n");
        let text = listing(&code);
        assert!(text.contains("COPY(2)\nCOPY(2)\nBINARY_SUBSCR"), "{text}");
        assert!(text.contains("BINARY_OP(+=)\nSWAP(3)\nSWAP(2)\nSTORE_SUBSCR"), "{text}");
        assert!(text.contains("SWAP(4)\nSWAP(3)\nSWAP(2)\nSTORE_SLICE"), "{text}");
    }

    #[test]
    fn debug_cannot_be_assigned() {
        assert_eq!(compile_error("__debug__ = 1\n"), CodegenErrorType::Assign("__debug__"));
        assert_eq!(compile_error("del __debug__\n"), CodegenErrorType::Delete("__debug__"));
    }

    #[test]
    fn delete_targets() {
        let code = compile("del a, b.c, d[0]\n");
        let text = listing(&code);
        assert!(text.contains("DELETE_NAME(0, a)"), "{text}");
        assert!(text.contains("DELETE_ATTR(2, c)"), "{text}");
        assert!(text.contains("DELETE_SUBSCR"), "{text}");
    }

    #[test]
    fn constant_expression_statement_is_a_nop() {
        let code = compile("1\n");
        assert!(!ops(&code).contains(&Instruction::PopTop));
    }
}
