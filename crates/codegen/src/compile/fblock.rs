//! Frame blocks: the stack of enclosing loops, `try`s and `with`s of the
//! current unit, and the cleanup code that leaving them early requires.

use super::{CompileResult, Compiler, NameUsage, emit};
use crate::error::{CodegenErrorType, InternalError};
use pylower_compiler_core::bytecode::{AwaitableKind, ConstantData, Instruction, Label};
use ruff_python_ast::{Expr, Stmt};
use ruff_text_size::TextRange;
use scopeguard::ScopeGuard;

/// Static nesting limit for frame blocks within one unit.
pub(super) const MAXBLOCKS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum FBlockType {
    WhileLoop,
    ForLoop,
    TryExcept,
    FinallyTry,
    FinallyEnd,
    With,
    AsyncWith,
    HandlerCleanup,
    PopValue,
    ExceptionHandler,
    ExceptionGroupHandler,
    AsyncComprehensionGenerator,
    StopIteration,
}

impl FBlockType {
    pub(super) const fn name(self) -> &'static str {
        match self {
            Self::WhileLoop => "while loop",
            Self::ForLoop => "for loop",
            Self::TryExcept => "try/except",
            Self::FinallyTry => "try/finally",
            Self::FinallyEnd => "finally end",
            Self::With => "with",
            Self::AsyncWith => "async with",
            Self::HandlerCleanup => "handler cleanup",
            Self::PopValue => "pop value",
            Self::ExceptionHandler => "except handler",
            Self::ExceptionGroupHandler => "except* handler",
            Self::AsyncComprehensionGenerator => "async comprehension generator",
            Self::StopIteration => "stop iteration guard",
        }
    }

    const fn is_loop(self) -> bool {
        matches!(self, Self::WhileLoop | Self::ForLoop)
    }
}

/// Extra data a block needs to emit its cleanup.
#[derive(Debug, Clone)]
pub(super) enum FBlockDatum {
    None,
    /// The `finally` suite, re-emitted at every early exit.
    FinallyBody(Vec<Stmt>),
    /// The `as` target of an `except` clause.
    ExceptionName(String),
}

#[derive(Debug, Clone)]
pub(super) struct FBlockInfo {
    pub(super) fb_type: FBlockType,
    /// `continue` target for loops.
    pub(super) entry: Option<Label>,
    /// `break` target for loops.
    pub(super) exit: Option<Label>,
    pub(super) range: TextRange,
    pub(super) datum: FBlockDatum,
}

impl Compiler {
    fn push_fblock(&mut self, info: FBlockInfo) -> CompileResult<()> {
        if self.unit.fblocks.len() >= MAXBLOCKS {
            return Err(self.error(CodegenErrorType::TooManyNestedBlocks));
        }
        self.unit.fblocks.push(info);
        Ok(())
    }

    fn pop_fblock(&mut self, fb_type: FBlockType, entry: Option<Label>) -> CompileResult<FBlockInfo> {
        match self.unit.fblocks.pop() {
            Some(info) if info.fb_type == fb_type && info.entry == entry => Ok(info),
            Some(info) => Err(self.internal_error(InternalError::FrameBlockMismatch {
                expected: fb_type.name(),
                found: info.fb_type.name(),
            })),
            None => Err(self.internal_error(InternalError::FrameBlockMismatch {
                expected: fb_type.name(),
                found: "empty block stack",
            })),
        }
    }

    /// Run `body` with a frame block pushed, popping it again afterwards.
    ///
    /// On error the block stack is cut back to where it was.
    pub(super) fn with_fblock<R>(
        &mut self,
        fb_type: FBlockType,
        entry: Option<Label>,
        exit: Option<Label>,
        datum: FBlockDatum,
        body: impl FnOnce(&mut Self) -> CompileResult<R>,
    ) -> CompileResult<R> {
        let depth = self.unit.fblocks.len();
        self.push_fblock(FBlockInfo {
            fb_type,
            entry,
            exit,
            range: self.current_source_range,
            datum,
        })?;
        let mut guard = scopeguard::guard(self, move |c: &mut Self| c.unit.fblocks.truncate(depth));
        let result = body(&mut **guard)?;
        let c = ScopeGuard::into_inner(guard);
        c.pop_fblock(fb_type, entry)?;
        Ok(result)
    }

    /// Emit the cleanup for leaving `info` early. With `preserve_tos` the
    /// value on top of the stack (a return value) must survive.
    fn unwind_fblock(&mut self, info: &FBlockInfo, preserve_tos: bool) -> CompileResult<()> {
        match info.fb_type {
            FBlockType::WhileLoop
            | FBlockType::ExceptionHandler
            | FBlockType::ExceptionGroupHandler
            | FBlockType::AsyncComprehensionGenerator
            | FBlockType::StopIteration => {}
            FBlockType::ForLoop => {
                if preserve_tos {
                    emit!(self, Instruction::Swap { index: 2 });
                }
                emit!(self, Instruction::PopTop);
            }
            FBlockType::TryExcept => emit!(self, Instruction::PopBlock),
            FBlockType::FinallyTry => {
                emit!(self, Instruction::PopBlock);
                let FBlockDatum::FinallyBody(body) = &info.datum else {
                    return Err(self.internal_error(InternalError::FrameBlockMismatch {
                        expected: "finally body",
                        found: info.fb_type.name(),
                    }));
                };
                let range = self.current_source_range;
                if preserve_tos {
                    self.with_fblock(FBlockType::PopValue, None, None, FBlockDatum::None, |c| {
                        c.compile_statements(body)
                    })?;
                } else {
                    self.compile_statements(body)?;
                }
                // whatever leaves the block runs after the finally body
                self.set_source_range(range);
                self.set_no_location();
            }
            FBlockType::FinallyEnd => {
                if preserve_tos {
                    emit!(self, Instruction::Swap { index: 2 });
                }
                emit!(self, Instruction::PopTop);
                if preserve_tos {
                    emit!(self, Instruction::Swap { index: 2 });
                }
                emit!(self, Instruction::PopBlock);
                emit!(self, Instruction::PopExcept);
            }
            FBlockType::With | FBlockType::AsyncWith => {
                let saved = self.set_source_range(info.range);
                emit!(self, Instruction::PopBlock);
                if preserve_tos {
                    emit!(self, Instruction::Swap { index: 3 });
                    emit!(self, Instruction::Swap { index: 2 });
                }
                self.emit_call_exit_with_nones();
                if info.fb_type == FBlockType::AsyncWith {
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
                self.set_source_range(saved);
                self.set_no_location();
            }
            FBlockType::HandlerCleanup => {
                let name = match &info.datum {
                    FBlockDatum::ExceptionName(name) => Some(name.as_str()),
                    _ => None,
                };
                if name.is_some() {
                    emit!(self, Instruction::PopBlock);
                }
                if preserve_tos {
                    emit!(self, Instruction::Swap { index: 2 });
                }
                emit!(self, Instruction::PopBlock);
                emit!(self, Instruction::PopExcept);
                if let Some(name) = name {
                    self.emit_load_const(ConstantData::None);
                    self.compile_name(name, NameUsage::Store)?;
                    self.compile_name(name, NameUsage::Delete)?;
                }
            }
            FBlockType::PopValue => {
                if preserve_tos {
                    emit!(self, Instruction::Swap { index: 2 });
                }
                emit!(self, Instruction::PopTop);
            }
        }
        Ok(())
    }

    /// Unwind blocks from the top of the stack. With `find_loop` the walk
    /// stops at the innermost loop, which is returned without being unwound.
    ///
    /// Each block is popped while its own cleanup is emitted, so a
    /// `return` inside a `finally` body does not run that body again.
    fn unwind_fblock_stack(
        &mut self,
        preserve_tos: bool,
        find_loop: bool,
        keyword: &'static str,
    ) -> CompileResult<Option<FBlockInfo>> {
        let Some(top) = self.unit.fblocks.last() else {
            return Ok(None);
        };
        if top.fb_type == FBlockType::ExceptionGroupHandler {
            return Err(self.error(CodegenErrorType::BreakContinueReturnInExceptStar(keyword)));
        }
        if find_loop && top.fb_type.is_loop() {
            return Ok(Some(top.clone()));
        }
        let Some(top) = self.unit.fblocks.pop() else {
            return Ok(None);
        };
        // the block goes back even when its cleanup fails to compile
        let mut guard = scopeguard::guard((self, top), |(c, top): (&mut Self, FBlockInfo)| {
            c.unit.fblocks.push(top);
        });
        let (c, top) = &mut *guard;
        c.unwind_fblock(top, preserve_tos)?;
        let found = c.unwind_fblock_stack(preserve_tos, find_loop, keyword)?;
        Ok(found)
    }

    pub(super) fn compile_return(&mut self, value: Option<&Expr>) -> CompileResult<()> {
        let table = self.current_symbol_table();
        if !table.is_function_like() {
            return Err(self.error(CodegenErrorType::InvalidReturn));
        }
        if value.is_some() && table.is_coroutine && table.is_generator {
            return Err(self.error(CodegenErrorType::AsyncReturnValue));
        }
        let constant = value.and_then(|v| self.constant_value(v));
        let preserve_tos = value.is_some() && constant.is_none();
        if preserve_tos && let Some(value) = value {
            self.compile_expression(value)?;
        }
        let range = self.current_source_range;
        self.unwind_fblock_stack(preserve_tos, false, "return")?;
        if !preserve_tos {
            self.emit_load_const(constant.unwrap_or(ConstantData::None));
        }
        emit!(self, Instruction::ReturnValue);
        self.set_source_range(range);
        Ok(())
    }

    pub(super) fn compile_break(&mut self) -> CompileResult<()> {
        let range = self.current_source_range;
        let Some(loop_block) = self.unwind_fblock_stack(false, true, "break")? else {
            return Err(self.error(CodegenErrorType::InvalidBreak));
        };
        self.unwind_fblock(&loop_block, false)?;
        let Some(target) = loop_block.exit else {
            return Err(self.internal_error(InternalError::FrameBlockMismatch {
                expected: "loop with exit label",
                found: loop_block.fb_type.name(),
            }));
        };
        emit!(self, Instruction::Jump { target });
        self.set_source_range(range);
        Ok(())
    }

    pub(super) fn compile_continue(&mut self) -> CompileResult<()> {
        let range = self.current_source_range;
        let Some(loop_block) = self.unwind_fblock_stack(false, true, "continue")? else {
            return Err(self.error(CodegenErrorType::InvalidContinue));
        };
        let Some(target) = loop_block.entry else {
            return Err(self.internal_error(InternalError::FrameBlockMismatch {
                expected: "loop with entry label",
                found: loop_block.fb_type.name(),
            }));
        };
        emit!(self, Instruction::Jump { target });
        self.set_source_range(range);
        Ok(())
    }

    /// `__exit__(None, None, None)` on the exit method below the top of stack.
    pub(super) fn emit_call_exit_with_nones(&mut self) {
        self.emit_load_const(ConstantData::None);
        self.emit_load_const(ConstantData::None);
        self.emit_load_const(ConstantData::None);
        emit!(self, Instruction::Call { nargs: 3 });
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::error::CodegenErrorType;
    use pylower_compiler_core::bytecode::Instruction;

    #[test]
    fn break_outside_loop() {
        assert_eq!(compile_error("break\n"), CodegenErrorType::InvalidBreak);
        assert_eq!(
            compile_error("def f():\n    continue\n"),
            CodegenErrorType::InvalidContinue
        );
    }

    #[test]
    fn return_outside_function() {
        assert_eq!(compile_error("return 1\n"), CodegenErrorType::InvalidReturn);
        assert_eq!(
            compile_error("class C:\n    return\n"),
            CodegenErrorType::InvalidReturn
        );
    }

    #[test]
    fn break_from_for_pops_the_iterator() {
        let code = compile("for x in y:\n    break\n");
        let text = listing(&code);
        let body = text.split("STORE_NAME(1, x)").nth(1).unwrap();
        assert!(body.trim_start().starts_with("POP_TOP\nJUMP("), "{text}");
    }

    #[test]
    fn return_runs_finally_body_first() {
        let code = compile("def f():\n    try:\n        return g()\n    finally:\n        cleanup()\n");
        let f = find_code(&code, "f");
        let text = listing(f);
        let cleanup = text.find("LOAD_GLOBAL(1, cleanup)").unwrap();
        let first_return = text.find("RETURN_VALUE").unwrap();
        assert!(cleanup < first_return, "{text}");
    }

    #[test]
    fn return_of_constant_is_loaded_after_unwinding() {
        let code = compile("def f():\n    for x in y:\n        return 1\n");
        let text = listing(find_code(&code, "f"));
        assert!(text.contains("POP_TOP\nLOAD_CONST(1)\nRETURN_VALUE"), "{text}");
    }

    #[test]
    fn return_inside_with_calls_exit() {
        let code = compile("def f():\n    with m:\n        return x\n");
        let f = find_code(&code, "f");
        let text = listing(f);
        let ret = text.find("RETURN_VALUE").unwrap();
        let before = &text[..ret];
        assert!(before.contains("SWAP(3)\nSWAP(2)"), "{text}");
        assert!(before.contains("CALL(3)"), "{text}");
    }

    #[test]
    fn return_after_finally_body_has_no_location() {
        let code = compile("def f():\n    try:\n        return g()\n    finally:\n        cleanup()\n");
        let f = find_code(&code, "f");
        let f_ops = ops(f);
        let ret = f_ops.iter().position(|op| *op == Instruction::ReturnValue).unwrap();
        assert_eq!(f.locations[ret], None);
        // the POP_BLOCK opening the inlined body belongs to the return
        let pop_block = f_ops[..ret].iter().rposition(|op| *op == Instruction::PopBlock).unwrap();
        assert_eq!(f.locations[pop_block].unwrap().0.line.get(), 3);
        let cleanup_call = ret - 1;
        assert_eq!(f.locations[cleanup_call].unwrap().0.line.get(), 5);
    }

    #[test]
    fn return_after_with_exit_has_no_location() {
        let code = compile("def f():\n    with m:\n        return x\n    y = 2\n");
        let f = find_code(&code, "f");
        let ret = ops(f).iter().position(|op| *op == Instruction::ReturnValue).unwrap();
        assert_eq!(f.locations[ret], None);
        // the __exit__ call is attributed to the with statement
        assert_eq!(f.locations[ret - 1].unwrap().0.line.get(), 2);
        assert!(f.locations[ret + 1..].iter().all(Option::is_some));
    }

    #[test]
    fn plain_return_keeps_its_location() {
        let code = compile("def f():\n    for x in y:\n        return 1\n");
        let f = find_code(&code, "f");
        let ret = ops(f).iter().position(|op| *op == Instruction::ReturnValue).unwrap();
        assert_eq!(f.locations[ret].unwrap().0.line.get(), 3);
    }

    #[test]
    fn failed_unwinding_keeps_the_block_stack() {
        let (_, mut compiler) = compiler_for("pass\n");
        let block = |fb_type| FBlockInfo {
            fb_type,
            entry: None,
            exit: None,
            range: TextRange::default(),
            datum: FBlockDatum::None,
        };
        compiler.push_fblock(block(FBlockType::ExceptionGroupHandler)).unwrap();
        compiler.push_fblock(block(FBlockType::ForLoop)).unwrap();
        let err = compiler.unwind_fblock_stack(false, false, "return").unwrap_err();
        assert_eq!(err.error, CodegenErrorType::BreakContinueReturnInExceptStar("return"));
        let kinds: Vec<_> = compiler.unit.fblocks.iter().map(|b| b.fb_type).collect();
        assert_eq!(kinds, [FBlockType::ExceptionGroupHandler, FBlockType::ForLoop]);
    }

    #[test]
    fn compile_errors_leave_no_blocks_behind() {
        for source in [
            "with a:\n    break\n",
            "try:\n    continue\nfinally:\n    pass\n",
            "for x in y:\n    try:\n        pass\n    finally:\n        with a:\n            return\n",
            "while x:\n    try:\n        pass\n    except* E:\n        break\n",
        ] {
            let (module, mut compiler) = compiler_for(source);
            assert!(compiler.compile_program(&module).is_err(), "{source}");
            assert!(compiler.unit.fblocks.is_empty(), "{source}");
        }
    }

    #[test]
    fn break_in_except_star_is_rejected() {
        assert_eq!(
            compile_error("for x in y:\n    try:\n        pass\n    except* E:\n        break\n"),
            CodegenErrorType::BreakContinueReturnInExceptStar("break")
        );
        assert_eq!(
            compile_error("def f():\n    try:\n        pass\n    except* E:\n        return\n"),
            CodegenErrorType::BreakContinueReturnInExceptStar("return")
        );
    }

    #[test]
    fn loops_inside_except_star_are_fine() {
        compile("try:\n    pass\nexcept* E:\n    for x in y:\n        break\n");
    }

    #[test]
    fn too_many_nested_blocks() {
        let mut source = String::new();
        for depth in 0..21 {
            source.push_str(&"    ".repeat(depth));
            source.push_str("while x:\n");
        }
        source.push_str(&"    ".repeat(21));
        source.push_str("pass\n");
        assert_eq!(compile_error(&source), CodegenErrorType::TooManyNestedBlocks);
    }

    #[test]
    fn continue_jumps_to_loop_start() {
        let code = compile("while x:\n    continue\n");
        assert!(ops(&code).iter().any(|op| matches!(op, Instruction::Jump { .. })));
    }
}
