//! List, set and dict comprehensions and generator expressions.
//!
//! Comprehensions the symbol table marked as inlined run directly in the
//! enclosing unit: the names they bind are saved on the stack, cleared,
//! and restored afterwards, and a temporary scope overlay makes the
//! enclosing unit resolve those names the way the comprehension would.
//! Everything else gets its own code object called with the outermost
//! iterator as its only argument.

use super::{
    CompileResult, Compiler, ToU32, emit,
    fblock::{FBlockDatum, FBlockType},
};
use crate::{
    error::CodegenErrorType,
    ir::InstructionInfo,
    symboltable::{CompilerScope, ComprehensionKind, SymbolFlags, SymbolScope},
};
use pylower_compiler_core::bytecode::{
    Arg, AwaitableKind, ConstantData, Instruction, IntrinsicFunction1, Label, MakeFunctionFlags,
};
use ruff_python_ast::{Comprehension, Expr, ExprList, ExprTuple};
use ruff_text_size::{Ranged, TextRange};

/// What an inlined comprehension changed in the enclosing unit.
#[derive(Default)]
struct InlinedState {
    /// Names whose previous values were saved on the stack, in push order.
    pushed_locals: Vec<String>,
    /// Overlay entries replaced by this comprehension, with their old values.
    saved_overlay: Vec<(String, Option<SymbolScope>)>,
    /// Names this comprehension switched to fast locals.
    fast_hidden: Vec<String>,
    cleanup: Option<Label>,
}

impl Compiler {
    pub(super) fn compile_comprehension(
        &mut self,
        kind: ComprehensionKind,
        elt: &Expr,
        value: Option<&Expr>,
        generators: &[Comprehension],
        range: TextRange,
    ) -> CompileResult<()> {
        let name = match kind {
            ComprehensionKind::List => "<listcomp>",
            ComprehensionKind::Set => "<setcomp>",
            ComprehensionKind::Dict => "<dictcomp>",
            ComprehensionKind::Generator => "<genexpr>",
        };
        let Some(outermost) = generators.first() else {
            return Err(self.error(CodegenErrorType::SyntaxError(
                "comprehension without generators".to_owned(),
            )));
        };
        let table = self.find_table(CompilerScope::Comprehension, range, name)?;
        let inlined = self.symbols[table].comp_inlined;
        let is_async = self.symbols[table].is_coroutine;

        if inlined {
            self.compile_comprehension_iter(outermost)?;
            let mut state = self.push_inlined_comprehension(table)?;
            let result = self.compile_comprehension_body(kind, elt, value, generators, true);
            self.unit.in_inlined_comp -= 1;
            // the overlay must come off even when the body failed
            let popped = result.and_then(|()| self.pop_inlined_comprehension_locals(&state));
            self.revert_inlined_comprehension_scopes(&mut state);
            return popped;
        }

        let lineno = self.line_number(range);
        let code = self.in_scope(name, table, lineno, None, |c| {
            c.compile_comprehension_body(kind, elt, value, generators, false)?;
            if kind == ComprehensionKind::Generator {
                c.wrap_in_stop_iteration_handler();
            } else {
                emit!(c, Instruction::ReturnValue);
            }
            Ok(())
        })?;

        self.set_source_range(range);
        self.make_closure(code, MakeFunctionFlags::empty())?;
        self.compile_comprehension_iter(outermost)?;
        emit!(self, Instruction::Call { nargs: 0 });

        if is_async && kind != ComprehensionKind::Generator {
            emit!(
                self,
                Instruction::GetAwaitable {
                    kind: AwaitableKind::Await
                }
            );
            self.emit_load_const(ConstantData::None);
            self.emit_yield_from(true);
        }
        Ok(())
    }

    fn compile_comprehension_iter(&mut self, generator: &Comprehension) -> CompileResult<()> {
        self.compile_expression(&generator.iter)?;
        if generator.is_async {
            emit!(self, Instruction::GetAIter);
        } else {
            emit!(self, Instruction::GetIter);
        }
        Ok(())
    }

    /// The empty result container (when there is one) and the loops.
    fn compile_comprehension_body(
        &mut self,
        kind: ComprehensionKind,
        elt: &Expr,
        value: Option<&Expr>,
        generators: &[Comprehension],
        iter_on_stack: bool,
    ) -> CompileResult<()> {
        if kind != ComprehensionKind::Generator {
            match kind {
                ComprehensionKind::List => emit!(self, Instruction::BuildList { size: 0 }),
                ComprehensionKind::Set => emit!(self, Instruction::BuildSet { size: 0 }),
                _ => emit!(self, Instruction::BuildMap { size: 0 }),
            }
            if iter_on_stack {
                emit!(self, Instruction::Swap { index: 2 });
            }
        }
        self.compile_comprehension_generator(kind, elt, value, generators, 0, 0, iter_on_stack)
    }

    #[allow(clippy::too_many_arguments)]
    fn compile_comprehension_generator(
        &mut self,
        kind: ComprehensionKind,
        elt: &Expr,
        value: Option<&Expr>,
        generators: &[Comprehension],
        index: usize,
        depth: u32,
        iter_on_stack: bool,
    ) -> CompileResult<()> {
        let generator = &generators[index];
        if generator.is_async {
            self.compile_async_comprehension_generator(
                kind,
                elt,
                value,
                generators,
                index,
                depth,
                iter_on_stack,
            )
        } else {
            self.compile_sync_comprehension_generator(
                kind,
                elt,
                value,
                generators,
                index,
                depth,
                iter_on_stack,
            )
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn compile_sync_comprehension_generator(
        &mut self,
        kind: ComprehensionKind,
        elt: &Expr,
        value: Option<&Expr>,
        generators: &[Comprehension],
        index: usize,
        mut depth: u32,
        iter_on_stack: bool,
    ) -> CompileResult<()> {
        let generator = &generators[index];
        let if_cleanup = self.new_label();
        let anchor = self.new_label();
        // `for y in [f(x)]` binds without looping
        let mut start = Some(self.new_label());

        if !iter_on_stack {
            if index == 0 {
                self.unit.metadata.argcount = 1;
                emit!(self, Instruction::LoadFast(0));
            } else {
                let single = match &generator.iter {
                    Expr::List(ExprList { elts, .. }) | Expr::Tuple(ExprTuple { elts, .. }) => {
                        match elts.as_slice() {
                            [only] if !matches!(only, Expr::Starred(_)) => Some(only),
                            _ => None,
                        }
                    }
                    _ => None,
                };
                if let Some(only) = single {
                    self.compile_expression(only)?;
                    start = None;
                } else {
                    self.compile_expression(&generator.iter)?;
                    self.set_source_range(generator.iter.range());
                    emit!(self, Instruction::GetIter);
                }
            }
        }

        if let Some(start) = start {
            depth += 1;
            self.use_label(start);
            self.set_source_range(generator.iter.range());
            emit!(self, Instruction::ForIter { target: anchor });
        }
        self.compile_store(&generator.target)?;
        for condition in &generator.ifs {
            self.compile_jump_if(condition, false, if_cleanup)?;
        }

        if index + 1 < generators.len() {
            self.compile_comprehension_generator(
                kind,
                elt,
                value,
                generators,
                index + 1,
                depth,
                false,
            )?;
        } else {
            self.compile_comprehension_element(kind, elt, value, depth)?;
        }

        self.use_label(if_cleanup);
        if let Some(start) = start {
            emit!(self, Instruction::Jump { target: start });
            self.use_label(anchor);
            emit!(self, Instruction::EndFor);
            emit!(self, Instruction::PopTop);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn compile_async_comprehension_generator(
        &mut self,
        kind: ComprehensionKind,
        elt: &Expr,
        value: Option<&Expr>,
        generators: &[Comprehension],
        index: usize,
        depth: u32,
        iter_on_stack: bool,
    ) -> CompileResult<()> {
        let generator = &generators[index];
        let start = self.new_label();
        let except = self.new_label();
        let if_cleanup = self.new_label();

        if !iter_on_stack {
            if index == 0 {
                self.unit.metadata.argcount = 1;
                emit!(self, Instruction::LoadFast(0));
            } else {
                self.compile_expression(&generator.iter)?;
                emit!(self, Instruction::GetAIter);
            }
        }

        self.use_label(start);
        self.with_fblock(
            FBlockType::AsyncComprehensionGenerator,
            Some(start),
            None,
            FBlockDatum::None,
            |c| {
                emit!(c, Instruction::SetupFinally { target: except });
                emit!(c, Instruction::GetANext);
                c.emit_load_const(ConstantData::None);
                c.emit_yield_from(true);
                emit!(c, Instruction::PopBlock);
                c.compile_store(&generator.target)?;
                for condition in &generator.ifs {
                    c.compile_jump_if(condition, false, if_cleanup)?;
                }

                let depth = depth + 1;
                if index + 1 < generators.len() {
                    c.compile_comprehension_generator(
                        kind,
                        elt,
                        value,
                        generators,
                        index + 1,
                        depth,
                        false,
                    )?;
                } else {
                    c.compile_comprehension_element(kind, elt, value, depth)?;
                }

                c.use_label(if_cleanup);
                emit!(c, Instruction::Jump { target: start });
                Ok(())
            },
        )?;

        self.use_label(except);
        emit!(self, Instruction::EndAsyncFor);
        Ok(())
    }

    /// Yield or append the element; the result container sits `depth + 1`
    /// slots down, under one iterator per loop.
    fn compile_comprehension_element(
        &mut self,
        kind: ComprehensionKind,
        elt: &Expr,
        value: Option<&Expr>,
        depth: u32,
    ) -> CompileResult<()> {
        let i = depth + 1;
        match (kind, value) {
            (ComprehensionKind::Generator, _) => {
                self.compile_expression(elt)?;
                self.set_source_range(elt.range());
                self.emit_yield_value();
                emit!(self, Instruction::PopTop);
            }
            (ComprehensionKind::List, _) => {
                self.compile_expression(elt)?;
                emit!(self, Instruction::ListAppend { i });
            }
            (ComprehensionKind::Set, _) => {
                self.compile_expression(elt)?;
                emit!(self, Instruction::SetAdd { i });
            }
            (ComprehensionKind::Dict, Some(value)) => {
                // key first, then value
                self.compile_expression(elt)?;
                self.compile_expression(value)?;
                self.set_source_range(TextRange::new(elt.start(), value.end()));
                emit!(self, Instruction::MapAdd { i });
            }
            (ComprehensionKind::Dict, None) => {
                return Err(self.error(CodegenErrorType::SyntaxError(
                    "dict comprehension without a value".to_owned(),
                )));
            }
        }
        Ok(())
    }

    // Inlining

    /// Install the comprehension's view of its names and save the enclosing
    /// values of the names it binds. The outermost iterator is on the stack.
    fn push_inlined_comprehension(&mut self, comp: usize) -> CompileResult<InlinedState> {
        let in_class_block =
            self.current_symbol_table().typ == CompilerScope::Class && self.unit.in_inlined_comp == 0;
        let function_like = self.current_symbol_table().is_function_like();
        self.unit.in_inlined_comp += 1;

        let mut state = InlinedState::default();
        let symbols: Vec<_> = self.symbols[comp]
            .symbols
            .values()
            .filter(|s| !s.flags.contains(SymbolFlags::PARAMETER))
            .map(|s| (s.name.clone(), s.scope, s.flags))
            .collect();

        let mut to_push = Vec::new();
        for (name, scope, flags) in symbols {
            let outer = self.lookup_scope(&name);
            let differs = scope != outer
                && scope != SymbolScope::Free
                && !(scope == SymbolScope::Cell && outer == SymbolScope::Free);
            if differs || in_class_block {
                let previous = self.unit.scope_overlay.insert(name.clone(), scope);
                state.saved_overlay.push((name.clone(), previous));
            }
            let binds = flags.contains(SymbolFlags::ASSIGNED) && !flags.contains(SymbolFlags::NONLOCAL);
            if binds || in_class_block {
                if !function_like && !self.unit.metadata.is_fast_hidden(&name) {
                    self.unit.metadata.fast_hidden.insert(name.clone(), true);
                    state.fast_hidden.push(name.clone());
                }
                to_push.push((name, scope, outer));
            }
        }

        for (name, scope, outer) in to_push {
            let idx = self.varname(&name);
            emit!(self, Instruction::LoadFastAndClear(idx));
            if scope == SymbolScope::Cell {
                let area = if outer == SymbolScope::Free {
                    SymbolScope::Free
                } else {
                    SymbolScope::Cell
                };
                let cell = self.deref_index(&name, area)?;
                emit!(self, Instruction::MakeCell(cell));
            }
            state.pushed_locals.push(name);
        }

        if !state.pushed_locals.is_empty() {
            // bring the iterator back on top
            let index = state.pushed_locals.len().to_u32() + 1;
            emit!(self, Instruction::Swap { index });
            let cleanup = self.new_label();
            emit!(self, Instruction::SetupFinally { target: cleanup });
            state.cleanup = Some(cleanup);
        }
        debug!(
            "inlined comprehension in {:?}: pushed {:?}, overlay {:?}",
            self.unit.metadata.name,
            state.pushed_locals,
            state.saved_overlay.iter().map(|(name, _)| name).collect::<Vec<_>>()
        );
        Ok(state)
    }

    fn pop_inlined_comprehension_locals(&mut self, state: &InlinedState) -> CompileResult<()> {
        let Some(cleanup) = state.cleanup else {
            return Ok(());
        };
        let end = self.new_label();
        emit!(self, Instruction::PopBlock);
        emit!(self, Instruction::JumpNoInterrupt { target: end });

        // an exception escaped: drop the partial result, restore, re-raise
        self.use_label(cleanup);
        emit!(self, Instruction::Swap { index: 2 });
        emit!(self, Instruction::PopTop);
        self.restore_inlined_comprehension_locals(state);
        emit!(self, Instruction::Reraise { depth: 0 });

        self.use_label(end);
        self.restore_inlined_comprehension_locals(state);
        Ok(())
    }

    fn restore_inlined_comprehension_locals(&mut self, state: &InlinedState) {
        let index = state.pushed_locals.len().to_u32() + 1;
        emit!(self, Instruction::Swap { index });
        for name in state.pushed_locals.iter().rev() {
            let idx = self.varname(name);
            emit!(self, Instruction::StoreFastMaybeNull(idx));
        }
    }

    fn revert_inlined_comprehension_scopes(&mut self, state: &mut InlinedState) {
        for (name, previous) in state.saved_overlay.drain(..).rev() {
            match previous {
                Some(scope) => self.unit.scope_overlay.insert(name, scope),
                None => self.unit.scope_overlay.remove(&name),
            };
        }
        // kept as `false` so the name is still known to have been hidden
        for name in state.fast_hidden.drain(..) {
            self.unit.metadata.fast_hidden.insert(name, false);
        }
    }

    /// Turn a `StopIteration` escaping the body of a generator or coroutine
    /// into a `RuntimeError`.
    pub(super) fn wrap_in_stop_iteration_handler(&mut self) {
        let handler = self.new_label();
        let location = self.source_location(self.current_source_range.start());
        let (target, arg) = Arg::new(handler);
        // right after the RESUME that opens every unit
        self.unit.seq.insert(
            1,
            InstructionInfo {
                instr: Instruction::SetupCleanup { target },
                arg,
                location: Some((location, location)),
            },
        );
        self.emit_return_const(ConstantData::None);
        self.use_label(handler);
        emit!(
            self,
            Instruction::CallIntrinsic1 {
                func: IntrinsicFunction1::StopIterationError
            }
        );
        emit!(self, Instruction::Reraise { depth: 1 });
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use pylower_compiler_core::bytecode::CodeFlags;

    #[test]
    fn module_level_list_comprehension_is_inlined() {
        let code = compile("[x for x in y]\n");
        insta::assert_snapshot!(listing(&code), @r"
        RESUME(AtFuncStart)
        LOAD_NAME(0, y)
        GET_ITER
        LOAD_FAST_AND_CLEAR(0, x)
        SWAP(2)
        SETUP_FINALLY(17)
        BUILD_LIST(0)
        SWAP(2)
        FOR_ITER(13)
        STORE_FAST(0, x)
        LOAD_FAST(0, x)
        LIST_APPEND(2)
        JUMP(8)
        END_FOR
        POP_TOP
        POP_BLOCK
        JUMP_NO_INTERRUPT(22)
        SWAP(2)
        POP_TOP
        SWAP(2)
        STORE_FAST_MAYBE_NULL(0, x)
        RERAISE(0)
        SWAP(2)
        STORE_FAST_MAYBE_NULL(0, x)
        POP_TOP
        LOAD_CONST(None)
        RETURN_VALUE
        ");
        assert!(code.child_codes().next().is_none());
    }

    #[test]
    fn iteration_variable_does_not_leak() {
        let code = compile("[x for x in y]\nprint(x)\n");
        let text = listing(&code);
        assert!(text.contains("LOAD_NAME(2, x)"), "{text}");
    }

    #[test]
    fn function_level_comprehension_uses_fast_locals() {
        let code = compile("def f(y):\n    return {k: v for k, v in y if k}\n");
        let f = listing(find_code(&code, "f"));
        assert!(f.contains("BUILD_MAP(0)"), "{f}");
        assert!(f.contains("MAP_ADD(2)"), "{f}");
        assert!(f.contains("POP_JUMP_IF_FALSE"), "{f}");
        assert!(!f.contains("MAKE_FUNCTION"), "{f}");
    }

    #[test]
    fn inlined_comprehension_restores_outer_binding() {
        let code = compile("def f(y):\n    x = 'outer'\n    [x for x in y]\n    return x\n");
        let f = find_code(&code, "f");
        assert_eq!(f.varnames.iter().filter(|name| *name == "x").count(), 1);
        let slot = f.varnames.iter().position(|name| name == "x").unwrap();
        let text = listing(f);

        let saved = text.find(&format!("LOAD_FAST_AND_CLEAR({slot}, x)")).unwrap();
        let loop_store = text.find("FOR_ITER").unwrap();
        assert!(saved < loop_store, "{text}");
        // restored on the normal and the exceptional path
        let restore = format!("SWAP(2)\nSTORE_FAST_MAYBE_NULL({slot}, x)");
        assert_eq!(text.matches(&restore).count(), 2, "{text}");
        let last_restore = text.rfind(&restore).unwrap();
        let read_back = text.rfind(&format!("LOAD_FAST({slot}, x)\nRETURN_VALUE")).unwrap();
        assert!(last_restore < read_back, "{text}");
    }

    #[test]
    fn nested_loops_track_depth() {
        let code = compile("def f(a):\n    return {x * y for x in a for y in a}\n");
        let f = listing(find_code(&code, "f"));
        assert!(f.contains("SET_ADD(3)"), "{f}");
    }

    #[test]
    fn single_element_iterable_binds_without_loop() {
        let code = compile("def f(a):\n    return [z for x in a for z in [x + 1]]\n");
        let f = listing(find_code(&code, "f"));
        assert_eq!(f.matches("FOR_ITER").count(), 1, "{f}");
        assert!(f.contains("LIST_APPEND(2)"), "{f}");
    }

    #[test]
    fn generator_expression_gets_its_own_code() {
        let code = compile("g = (x for x in y)\n");
        let outer = listing(&code);
        assert!(outer.contains("MAKE_FUNCTION\nLOAD_NAME(0, y)\nGET_ITER\nCALL(0)"), "{outer}");

        let genexpr = find_code(&code, "<genexpr>");
        assert_eq!(genexpr.arg_count, 1);
        assert!(genexpr.flags.contains(CodeFlags::GENERATOR));
        insta::assert_snapshot!(listing(genexpr), @r"
        RESUME(AtFuncStart)
        SETUP_CLEANUP(14)
        LOAD_FAST(0, .0)
        FOR_ITER(10)
        STORE_FAST(1, x)
        LOAD_FAST(1, x)
        YIELD_VALUE(0)
        RESUME(AfterYield)
        POP_TOP
        JUMP(3)
        END_FOR
        POP_TOP
        LOAD_CONST(None)
        RETURN_VALUE
        CALL_INTRINSIC_1(StopIterationError)
        RERAISE(1)
        ");
    }

    #[test]
    fn comprehension_cell_is_recreated() {
        let code = compile("def f(a):\n    return [lambda: x for x in a]\n");
        let f = find_code(&code, "f");
        let text = listing(f);
        assert!(text.contains("LOAD_FAST_AND_CLEAR(1, x)\nMAKE_CELL(0, x)"), "{text}");
        assert!(f.cellvars.contains(&"x".to_owned()));
    }

    #[test]
    fn async_comprehension_in_coroutine() {
        let code = compile("async def f(a):\n    return [x async for x in a]\n");
        let f = listing(find_code(&code, "f"));
        assert!(f.contains("GET_AITER"), "{f}");
        assert!(f.contains("GET_ANEXT"), "{f}");
        assert!(f.contains("END_ASYNC_FOR"), "{f}");
    }

    #[test]
    fn class_body_comprehension_reads_globals() {
        let code = compile("class C:\n    a = [len(v) for v in range(3)]\n");
        let class = listing(find_code(&code, "C"));
        assert!(class.contains("LOAD_GLOBAL"), "{class}");
    }
}
