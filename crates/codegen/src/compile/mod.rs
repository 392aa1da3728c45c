//!
//! Take an AST and lower it into per-scope instruction sequences.
//!
//! The compiler keeps one [`CompileUnit`] per lexical scope being compiled.
//! Statement and expression generators append to the current unit; entering
//! a function, class, lambda, comprehension or annotation scope pushes a new
//! unit, and leaving it hands the finished sequence to the [`Assemble`]
//! implementation and embeds the result as a constant in the parent.
//!
//! Inspirational code:
//!   <https://github.com/python/cpython/blob/main/Python/compile.c>

// spell-checker:ignore starunpack subscripter classdict

#![deny(clippy::cast_possible_truncation)]

mod comprehension;
mod expr;
mod fblock;
mod function;
mod pattern;
mod stmt;

use crate::{
    IndexSet,
    constant::ConstantCache,
    error::{CodegenError, CodegenErrorType, CompileWarning, InternalError},
    ir::{Assemble, AssembleError, CodeUnitMetadata, InstructionInfo, InstructionSequence, LabelResolver},
    symboltable::{CompilerScope, SymbolFlags, SymbolScope, SymbolTable, SymbolTableArena},
};
use alloc::borrow::Cow;
use core::mem;
use fblock::FBlockInfo;
use malachite_bigint::BigInt;
use num_traits::Num;
use pylower_compiler_core::{
    Mode, OneIndexed, PositionEncoding, SourceFile, SourceLocation,
    bytecode::{
        Arg, CodeFlags, CodeObject, CommonConstant, ComparisonOperator, ConstantData,
        Instruction, Label, OpArg, OpArgType, RaiseKind, ResumeType,
    },
};
use ruff_python_ast::{Expr, Int, ModExpression, ModModule, Stmt};
use ruff_text_size::{Ranged, TextRange};
use scopeguard::ScopeGuard;
use std::collections::HashMap;

pub(crate) type CompileResult<T> = Result<T, CodegenError>;

#[derive(Debug, Clone)]
pub struct CompileOpts {
    /// How optimized the output should be: `1` drops asserts and makes
    /// `__debug__` false, `2` also drops docstrings.
    pub optimize: u8,
    /// Record end positions of every instruction, not just the start line.
    pub debug_ranges: bool,
    /// Keep the instruction sequence of every nested scope attached to its
    /// parent, so the whole tree can be inspected after compilation.
    pub introspection: bool,
    /// Raise the first warning as a `SyntaxError` instead of collecting it.
    pub warnings_as_errors: bool,
}

impl Default for CompileOpts {
    fn default() -> Self {
        Self {
            optimize: 0,
            debug_ranges: true,
            introspection: false,
            warnings_as_errors: false,
        }
    }
}

/// Everything one compilation produced besides a possible error.
#[derive(Debug)]
pub struct CompileOutput {
    pub code: CodeObject,
    pub warnings: Vec<CompileWarning>,
    /// The module's instruction sequence with nested scopes attached, when
    /// [`CompileOpts::introspection`] is set.
    pub sequence: Option<InstructionSequence>,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
enum NameUsage {
    Load,
    Store,
    Delete,
}

/// Storage class a name resolves to in the current unit.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
enum NameOp {
    Fast,
    Deref,
    Global,
    Name,
}

/// A simple annotation of a module or class body, compiled later into the
/// body's `__annotate__` function.
#[derive(Debug, Clone)]
struct DeferredAnnotation {
    name: String,
    annotation: Expr,
    range: TextRange,
}

/// The state of one scope while its body is being compiled.
struct CompileUnit {
    /// Index of the scope's entry in the symbol table arena.
    table: usize,
    metadata: CodeUnitMetadata,
    seq: InstructionSequence,
    /// Class name used to mangle `__private` identifiers.
    private: Option<String>,
    fblocks: Vec<FBlockInfo>,
    /// `self.<attr>` stores seen in methods; class units only.
    static_attributes: Option<IndexSet<String>>,
    deferred_annotations: Vec<DeferredAnnotation>,
    /// Depth of inlined comprehensions currently being compiled into this unit.
    in_inlined_comp: u32,
    /// Scope overrides installed by an inlined comprehension.
    scope_overlay: HashMap<String, SymbolScope>,
    has_docstring: bool,
    /// `VARARGS` and `VARKEYWORDS`, set while compiling a signature.
    arg_flags: CodeFlags,
}

pub struct Compiler {
    unit: CompileUnit,
    unit_stack: Vec<CompileUnit>,
    symbols: SymbolTableArena,
    source_file: SourceFile,
    current_source_range: TextRange,
    /// Emit without a location until the next `set_source_range`.
    no_location: bool,
    const_cache: ConstantCache,
    opts: CompileOpts,
    future_annotations: bool,
    done_with_future_stmts: bool,
    interactive: bool,
    warnings: Vec<CompileWarning>,
    assembler: Box<dyn Assemble>,
}

/// Compile a module produced by the ruff parser.
pub fn compile_top(
    ast: ruff_python_ast::Mod,
    source_file: SourceFile,
    mode: Mode,
    opts: CompileOpts,
) -> CompileResult<CodeObject> {
    match ast {
        ruff_python_ast::Mod::Module(module) => match mode {
            Mode::Exec | Mode::Eval => compile_program(&module, source_file, opts),
            Mode::Single => compile_program_single(&module, source_file, opts),
        },
        ruff_python_ast::Mod::Expression(expr) => compile_expression(&expr, source_file, opts),
    }
}

/// Compile a standard Python program.
pub fn compile_program(
    ast: &ModModule,
    source_file: SourceFile,
    opts: CompileOpts,
) -> CompileResult<CodeObject> {
    let symbols = SymbolTable::scan_program(ast, source_file.clone())
        .map_err(|e| e.into_codegen_error(source_file.name().to_owned()))?;
    let mut compiler = Compiler::new(source_file, symbols, opts);
    compiler.compile_program(ast)?;
    Ok(compiler.finish()?.code)
}

/// Compile a Python program for the context of a REPL.
pub fn compile_program_single(
    ast: &ModModule,
    source_file: SourceFile,
    opts: CompileOpts,
) -> CompileResult<CodeObject> {
    let symbols = SymbolTable::scan_program(ast, source_file.clone())
        .map_err(|e| e.into_codegen_error(source_file.name().to_owned()))?;
    let mut compiler = Compiler::new(source_file, symbols, opts);
    compiler.compile_program_single(ast)?;
    Ok(compiler.finish()?.code)
}

pub fn compile_expression(
    ast: &ModExpression,
    source_file: SourceFile,
    opts: CompileOpts,
) -> CompileResult<CodeObject> {
    let symbols = SymbolTable::scan_expr(ast, source_file.clone())
        .map_err(|e| e.into_codegen_error(source_file.name().to_owned()))?;
    let mut compiler = Compiler::new(source_file, symbols, opts);
    compiler.compile_eval(ast)?;
    Ok(compiler.finish()?.code)
}

macro_rules! emit {
    ($c:expr, Instruction::$op:ident { $arg:ident$(,)? }$(,)?) => {
        $c.emit_arg($arg, |x| Instruction::$op { $arg: x })
    };
    ($c:expr, Instruction::$op:ident { $arg:ident : $arg_val:expr $(,)? }$(,)?) => {
        $c.emit_arg($arg_val, |x| Instruction::$op { $arg: x })
    };
    ($c:expr, Instruction::$op:ident( $arg_val:expr $(,)? )$(,)?) => {
        $c.emit_arg($arg_val, Instruction::$op)
    };
    ($c:expr, Instruction::$op:ident$(,)?) => {
        $c.emit_no_arg(Instruction::$op)
    };
}
pub(crate) use emit;

impl CompileUnit {
    fn new(table: usize, metadata: CodeUnitMetadata, private: Option<String>) -> Self {
        Self {
            table,
            metadata,
            seq: InstructionSequence::new(),
            private,
            fblocks: Vec::with_capacity(fblock::MAXBLOCKS),
            static_attributes: None,
            deferred_annotations: Vec::new(),
            in_inlined_comp: 0,
            scope_overlay: HashMap::new(),
            has_docstring: false,
            arg_flags: CodeFlags::empty(),
        }
    }
}

impl Compiler {
    /// Create a compiler whose current unit is the module scope.
    pub fn new(source_file: SourceFile, symbols: SymbolTableArena, opts: CompileOpts) -> Self {
        let metadata = CodeUnitMetadata::new("<module>", OneIndexed::MIN);
        let assembler = Box::new(LabelResolver::new(source_file.name()));
        let future_annotations = symbols.future_annotations;
        let mut compiler = Self {
            unit: CompileUnit::new(SymbolTableArena::ROOT, metadata, None),
            unit_stack: Vec::new(),
            symbols,
            source_file,
            current_source_range: TextRange::default(),
            no_location: false,
            const_cache: ConstantCache::new(),
            opts,
            future_annotations,
            done_with_future_stmts: false,
            interactive: false,
            warnings: Vec::new(),
            assembler,
        };
        compiler.emit_resume_at(OneIndexed::MIN);
        trace!("enter module scope");
        compiler
    }

    /// Use a different assembler for every finished scope.
    #[must_use]
    pub fn with_assembler(mut self, assembler: impl Assemble + 'static) -> Self {
        self.assembler = Box::new(assembler);
        self
    }

    pub fn compile_program(&mut self, module: &ModModule) -> CompileResult<()> {
        self.compile_body(&module.body)
    }

    /// Interactive input: expression statements print their value.
    pub fn compile_program_single(&mut self, module: &ModModule) -> CompileResult<()> {
        self.interactive = true;
        self.compile_body(&module.body)
    }

    pub fn compile_eval(&mut self, expression: &ModExpression) -> CompileResult<()> {
        self.compile_expression(&expression.body)?;
        emit!(self, Instruction::ReturnValue);
        Ok(())
    }

    /// Warnings collected so far.
    #[must_use]
    pub fn warnings(&self) -> &[CompileWarning] {
        &self.warnings
    }

    /// Assemble the module scope.
    pub fn finish(mut self) -> CompileResult<CompileOutput> {
        if !self.unit_stack.is_empty() {
            return Err(self.internal_error(InternalError::Assembler(
                "nested scope left open at end of module".to_owned(),
            )));
        }
        self.add_return_at_end();
        let unit = mem::replace(
            &mut self.unit,
            CompileUnit::new(0, CodeUnitMetadata::new("", OneIndexed::MIN), None),
        );
        let code = self.assemble_unit(&unit)?;
        trace!("Compilation completed: {code:?}");
        Ok(CompileOutput {
            code,
            warnings: self.warnings,
            sequence: self.opts.introspection.then_some(unit.seq),
        })
    }

    // Scope management

    fn current_symbol_table(&self) -> &SymbolTable {
        &self.symbols[self.unit.table]
    }

    /// Find the symbol table of the scope opened by the node at `range`.
    fn find_table(&self, typ: CompilerScope, range: TextRange, name: &str) -> CompileResult<usize> {
        self.symbols
            .find(typ, range)
            .ok_or_else(|| self.internal_error(InternalError::MissingSymbolTable(name.to_owned())))
    }

    /// Push a new unit for the scope `table` and make it current.
    ///
    /// `private` overrides the mangling context; by default it is inherited
    /// from the parent, and classes use their own name.
    fn enter_scope(
        &mut self,
        name: &str,
        table: usize,
        lineno: OneIndexed,
        private: Option<&str>,
    ) -> CompileResult<()> {
        let ste = self
            .symbols
            .get(table)
            .ok_or_else(|| self.internal_error(InternalError::MissingSymbolTable(name.to_owned())))?;
        let scope_type = ste.typ;

        let mut metadata = CodeUnitMetadata::new(name, lineno);
        metadata.varnames = ste.varnames.iter().cloned().collect();
        metadata.cellvars = sorted_names(ste, |s| {
            s.scope == SymbolScope::Cell || s.flags.contains(SymbolFlags::COMP_CELL)
        });
        if ste.needs_class_closure {
            metadata.cellvars.insert("__class__".to_owned());
        }
        if ste.needs_classdict {
            metadata.cellvars.insert("__classdict__".to_owned());
        }
        metadata.freevars = sorted_names(ste, |s| {
            s.scope == SymbolScope::Free || s.flags.contains(SymbolFlags::FREE_CLASS)
        });

        let private = match (private, scope_type) {
            (Some(private), _) => Some(private.to_owned()),
            (None, CompilerScope::Class) => Some(name.to_owned()),
            (None, _) => self.unit.private.clone(),
        };
        let mut unit = CompileUnit::new(table, metadata, private);
        if scope_type == CompilerScope::Class {
            unit.static_attributes = Some(IndexSet::default());
        }

        let parent = mem::replace(&mut self.unit, unit);
        self.unit_stack.push(parent);
        self.set_qualname();
        trace!(
            "enter {scope_type} scope {:?}",
            self.unit.metadata.qualname.as_deref().unwrap_or(name)
        );
        self.emit_resume_at(lineno);
        Ok(())
    }

    /// Pop the current unit, assemble it and make the parent current again.
    fn exit_scope(&mut self) -> CompileResult<CodeObject> {
        let parent = self
            .unit_stack
            .pop()
            .ok_or_else(|| self.internal_error(InternalError::StackUnderflow))?;
        self.add_return_at_end();
        let unit = mem::replace(&mut self.unit, parent);
        if let Some(block) = unit.fblocks.last() {
            return Err(self.internal_error(InternalError::FrameBlockMismatch {
                expected: "no frame block",
                found: block.fb_type.name(),
            }));
        }
        let code = self.assemble_unit(&unit)?;
        trace!("exit scope {:?}", code.qualname);
        if self.opts.introspection {
            self.unit.seq.add_nested(unit.seq);
        }
        Ok(code)
    }

    /// Compile `body` inside a fresh unit and return the assembled code.
    ///
    /// If `body` fails, the unit is discarded and the parent is restored.
    fn in_scope<F>(
        &mut self,
        name: &str,
        table: usize,
        lineno: OneIndexed,
        private: Option<&str>,
        body: F,
    ) -> CompileResult<CodeObject>
    where
        F: FnOnce(&mut Self) -> CompileResult<()>,
    {
        self.enter_scope(name, table, lineno, private)?;
        let depth = self.unit_stack.len();
        let mut guard = scopeguard::guard(self, move |c: &mut Self| {
            while c.unit_stack.len() >= depth {
                if let Some(parent) = c.unit_stack.pop() {
                    c.unit = parent;
                }
            }
        });
        body(&mut **guard)?;
        ScopeGuard::into_inner(guard).exit_scope()
    }

    fn assemble_unit(&self, unit: &CompileUnit) -> CompileResult<CodeObject> {
        let flags = self.compute_code_flags(unit);
        self.assembler
            .assemble(&unit.seq, &unit.metadata, flags)
            .map_err(|err| {
                let internal = match err {
                    AssembleError::DanglingLabel(label) => InternalError::DanglingLabel(label.0),
                    AssembleError::DuplicateLabel(label) => InternalError::DuplicateLabel(label.0),
                };
                self.internal_error(internal)
            })
    }

    fn compute_code_flags(&self, unit: &CompileUnit) -> CodeFlags {
        let ste = &self.symbols[unit.table];
        let mut flags = CodeFlags::empty();
        if ste.is_function_like() {
            flags |= CodeFlags::NEWLOCALS | CodeFlags::OPTIMIZED;
            if ste.is_nested {
                flags |= CodeFlags::NESTED;
            }
            if ste.is_generator && !ste.is_coroutine {
                flags |= CodeFlags::GENERATOR;
            }
            if ste.is_generator && ste.is_coroutine {
                flags |= CodeFlags::ASYNC_GENERATOR;
            }
            flags |= unit.arg_flags & (CodeFlags::VARARGS | CodeFlags::VARKEYWORDS);
        }
        if ste.is_coroutine && !ste.is_generator {
            flags |= CodeFlags::COROUTINE;
        }
        if unit.has_docstring {
            flags |= CodeFlags::HAS_DOCSTRING;
        }
        if ste.is_method {
            flags |= CodeFlags::METHOD;
        }
        flags
    }

    /// Make sure an instruction stream that can fall off its end returns None.
    fn add_return_at_end(&mut self) {
        let falls_through = self
            .unit
            .seq
            .last()
            .is_none_or(|last| !last.instr.is_scope_exit());
        if falls_through || self.unit.seq.at_label() {
            self.emit_load_const(ConstantData::None);
            emit!(self, Instruction::ReturnValue);
        }
    }

    /// Dotted path from the module to the current unit.
    fn set_qualname(&mut self) {
        let name = self.unit.metadata.name.clone();
        // ancestors, innermost last, module first
        let ancestors = &self.unit_stack;
        let qualname = 'q: {
            if ancestors.len() <= 1 {
                break 'q name;
            }
            let mut parent = &ancestors[ancestors.len() - 1];
            if is_annotation_scope(self.symbols[parent.table].typ) {
                if ancestors.len() == 2 {
                    break 'q name;
                }
                parent = &ancestors[ancestors.len() - 2];
            }
            let typ = self.current_symbol_table().typ;
            if matches!(
                typ,
                CompilerScope::Function | CompilerScope::AsyncFunction | CompilerScope::Class
            ) {
                let parent_table = &self.symbols[parent.table];
                let mangled = parent_table.mangle(parent.private.as_deref(), &name);
                if parent_table
                    .lookup(&mangled)
                    .is_some_and(|s| s.scope == SymbolScope::GlobalExplicit)
                {
                    break 'q name;
                }
            }
            let base = parent
                .metadata
                .qualname
                .as_deref()
                .unwrap_or(&parent.metadata.name);
            match self.symbols[parent.table].typ {
                CompilerScope::Function | CompilerScope::AsyncFunction | CompilerScope::Lambda => {
                    format!("{base}.<locals>.{name}")
                }
                _ => format!("{base}.{name}"),
            }
        };
        self.unit.metadata.qualname = Some(qualname);
    }

    // Names

    fn mangle<'a>(&self, name: &'a str) -> Cow<'a, str> {
        self.current_symbol_table()
            .mangle(self.unit.private.as_deref(), name)
    }

    /// Scope of `name` (already mangled) as seen by the current unit.
    fn lookup_scope(&self, name: &str) -> SymbolScope {
        if let Some(scope) = self.unit.scope_overlay.get(name) {
            return *scope;
        }
        self.current_symbol_table()
            .lookup(name)
            .map_or(SymbolScope::Unknown, |s| s.scope)
    }

    /// Like [`Self::lookup_scope`], but the implicit class cells are always
    /// cells inside a class body.
    fn get_ref_type(&self, name: &str) -> CompileResult<SymbolScope> {
        if self.current_symbol_table().typ == CompilerScope::Class
            && (name == "__class__" || name == "__classdict__")
        {
            return Ok(SymbolScope::Cell);
        }
        match self.lookup_scope(name) {
            SymbolScope::Unknown => {
                Err(self.internal_error(InternalError::MissingSymbol(name.to_owned())))
            }
            scope => Ok(scope),
        }
    }

    /// Index of a name in the cell/free area: cells first, then free variables.
    fn deref_index(&self, name: &str, scope: SymbolScope) -> CompileResult<u32> {
        let metadata = &self.unit.metadata;
        let idx = match scope {
            SymbolScope::Cell => metadata.cellvars.get_index_of(name),
            _ => metadata
                .freevars
                .get_index_of(name)
                .map(|i| i + metadata.cellvars.len()),
        };
        idx.map(ToU32::to_u32)
            .ok_or_else(|| self.internal_error(InternalError::MissingSymbol(name.to_owned())))
    }

    /// Index in `co_names`, mangling `name` first.
    fn name(&mut self, name: &str) -> u32 {
        let mangled = self.mangle(name).into_owned();
        self.name_index(mangled)
    }

    fn name_index(&mut self, name: impl Into<String>) -> u32 {
        self.unit.metadata.names.insert_full(name.into()).0.to_u32()
    }

    fn varname(&mut self, name: &str) -> u32 {
        let names = &mut self.unit.metadata.varnames;
        match names.get_index_of(name) {
            Some(idx) => idx.to_u32(),
            None => names.insert_full(name.to_owned()).0.to_u32(),
        }
    }

    /// Emit the load, store or delete of a plain name.
    fn compile_name(&mut self, name: &str, usage: NameUsage) -> CompileResult<()> {
        if name == "__debug__" && usage == NameUsage::Load {
            self.emit_load_const(ConstantData::Boolean {
                value: self.opts.optimize == 0,
            });
            return Ok(());
        }
        let mangled = self.mangle(name).into_owned();
        let scope = self.lookup_scope(&mangled);
        let function_like = self.current_symbol_table().is_function_like();

        let op = match scope {
            SymbolScope::Free | SymbolScope::Cell => NameOp::Deref,
            SymbolScope::Local => {
                if function_like || self.unit.metadata.is_fast_hidden(&mangled) {
                    NameOp::Fast
                } else {
                    NameOp::Name
                }
            }
            SymbolScope::GlobalImplicit if function_like => NameOp::Global,
            SymbolScope::GlobalImplicit => NameOp::Name,
            SymbolScope::GlobalExplicit => NameOp::Global,
            SymbolScope::Unknown => {
                // only names the compiler itself introduces may be unknown
                if !mangled.starts_with(['_', '.']) {
                    return Err(self.internal_error(InternalError::MissingSymbol(mangled)));
                }
                NameOp::Name
            }
        };

        let table = self.current_symbol_table();
        let in_class = table.typ == CompilerScope::Class;
        let can_see_class_scope = table.can_see_class_scope;
        match op {
            NameOp::Deref => {
                let idx = self.deref_index(&mangled, scope)?;
                match usage {
                    NameUsage::Load => {
                        if in_class && self.unit.in_inlined_comp == 0 {
                            emit!(self, Instruction::LoadLocals);
                            emit!(self, Instruction::LoadFromDictOrDeref(idx));
                        } else if can_see_class_scope {
                            self.load_classdict_freevar()?;
                            emit!(self, Instruction::LoadFromDictOrDeref(idx));
                        } else {
                            emit!(self, Instruction::LoadDeref(idx));
                        }
                    }
                    NameUsage::Store => emit!(self, Instruction::StoreDeref(idx)),
                    NameUsage::Delete => emit!(self, Instruction::DeleteDeref(idx)),
                }
            }
            NameOp::Fast => {
                let idx = self.varname(&mangled);
                match usage {
                    NameUsage::Load => emit!(self, Instruction::LoadFast(idx)),
                    NameUsage::Store => emit!(self, Instruction::StoreFast(idx)),
                    NameUsage::Delete => emit!(self, Instruction::DeleteFast(idx)),
                }
            }
            NameOp::Global => match usage {
                NameUsage::Load => {
                    if can_see_class_scope && scope == SymbolScope::GlobalImplicit {
                        self.load_classdict_freevar()?;
                        let idx = self.name_index(mangled);
                        emit!(self, Instruction::LoadFromDictOrGlobals(idx));
                    } else {
                        let idx = self.name_index(mangled);
                        emit!(self, Instruction::LoadGlobal(idx));
                    }
                }
                NameUsage::Store => {
                    let idx = self.name_index(mangled);
                    emit!(self, Instruction::StoreGlobal(idx));
                }
                NameUsage::Delete => {
                    let idx = self.name_index(mangled);
                    emit!(self, Instruction::DeleteGlobal(idx));
                }
            },
            NameOp::Name => {
                let idx = self.name_index(mangled);
                match usage {
                    NameUsage::Load if in_class && self.unit.in_inlined_comp > 0 => {
                        emit!(self, Instruction::LoadGlobal(idx))
                    }
                    NameUsage::Load => emit!(self, Instruction::LoadName(idx)),
                    NameUsage::Store => emit!(self, Instruction::StoreName(idx)),
                    NameUsage::Delete => emit!(self, Instruction::DeleteName(idx)),
                }
            }
        }
        Ok(())
    }

    fn load_classdict_freevar(&mut self) -> CompileResult<()> {
        let idx = self.deref_index("__classdict__", SymbolScope::Free)?;
        emit!(self, Instruction::LoadDeref(idx));
        Ok(())
    }

    /// Record `self.<attr>` stores for the nearest enclosing class.
    fn maybe_add_static_attribute(&mut self, value: &Expr, attr: &str) {
        let Expr::Name(name) = value else { return };
        if name.id.as_str() != "self" {
            return;
        }
        let symbols = &self.symbols;
        if let Some(attributes) = self
            .unit_stack
            .iter_mut()
            .rev()
            .find(|unit| symbols[unit.table].typ == CompilerScope::Class)
            .and_then(|unit| unit.static_attributes.as_mut())
        {
            attributes.insert(attr.to_owned());
        }
    }

    // Constants

    fn add_const(&mut self, constant: ConstantData) -> u32 {
        let constant = self.const_cache.merge(constant);
        self.unit.metadata.consts.insert_full(constant).0.to_u32()
    }

    fn emit_load_const(&mut self, constant: ConstantData) {
        let idx = self.add_const(constant);
        emit!(self, Instruction::LoadConst { idx });
    }

    fn emit_return_const(&mut self, constant: ConstantData) {
        self.emit_load_const(constant);
        emit!(self, Instruction::ReturnValue);
    }

    // Emission

    fn new_label(&mut self) -> Label {
        self.unit.seq.new_label()
    }

    fn use_label(&mut self, label: Label) {
        self.unit.seq.use_label(label);
    }

    fn set_source_range(&mut self, range: TextRange) -> TextRange {
        self.no_location = false;
        mem::replace(&mut self.current_source_range, range)
    }

    /// Mark what follows as artificial, like the jump or return after
    /// inlined cleanup code.
    fn set_no_location(&mut self) {
        self.no_location = true;
    }

    fn source_location(&self, offset: ruff_text_size::TextSize) -> SourceLocation {
        self.source_file
            .to_source_code()
            .source_location(offset, PositionEncoding::Utf8)
    }

    fn line_number(&self, range: TextRange) -> OneIndexed {
        self.source_file.to_source_code().line_index(range.start())
    }

    fn _emit(&mut self, instr: Instruction, arg: OpArg) {
        let location = (!self.no_location).then(|| {
            let range = self.current_source_range;
            let start = self.source_location(range.start());
            let end = if self.opts.debug_ranges {
                self.source_location(range.end())
            } else {
                start
            };
            (start, end)
        });
        self.unit.seq.push(InstructionInfo {
            instr,
            arg,
            location,
        });
    }

    fn emit_no_arg(&mut self, instr: Instruction) {
        self._emit(instr, OpArg::NULL);
    }

    fn emit_arg<A: OpArgType>(&mut self, arg: A, f: impl FnOnce(Arg<A>) -> Instruction) {
        let (marker, arg) = Arg::new(arg);
        self._emit(f(marker), arg);
    }

    fn emit_resume_at(&mut self, lineno: OneIndexed) {
        let location = SourceLocation {
            line: lineno,
            character_offset: OneIndexed::MIN,
        };
        let (arg, oparg) = Arg::new(ResumeType::AtFuncStart);
        self.unit.seq.push(InstructionInfo {
            instr: Instruction::Resume { arg },
            arg: oparg,
            location: Some((location, location)),
        });
    }

    fn emit_compare(&mut self, op: ComparisonOperator) {
        emit!(self, Instruction::CompareOp { op });
    }

    /// `if .format != 1: raise NotImplementedError`, the prologue of every
    /// annotation function.
    fn emit_format_check(&mut self) {
        let body = self.new_label();
        emit!(self, Instruction::LoadFast(0));
        self.emit_load_const(ConstantData::Integer {
            value: BigInt::from(1),
        });
        self.emit_compare(ComparisonOperator::NotEqual);
        emit!(self, Instruction::PopJumpIfFalse { target: body });
        emit!(
            self,
            Instruction::LoadCommonConstant {
                idx: CommonConstant::NotImplementedError
            }
        );
        emit!(
            self,
            Instruction::RaiseVarargs {
                kind: RaiseKind::Raise
            }
        );
        self.use_label(body);
    }

    // Diagnostics

    fn error(&self, error: CodegenErrorType) -> CodegenError {
        self.error_ranged(error, self.current_source_range)
    }

    fn error_ranged(&self, error: CodegenErrorType, range: TextRange) -> CodegenError {
        CodegenError {
            error,
            location: Some(self.source_location(range.start())),
            end_location: Some(self.source_location(range.end())),
            source_path: self.source_file.name().to_owned(),
        }
    }

    fn internal_error(&self, error: InternalError) -> CodegenError {
        error!("internal compiler error: {error}");
        self.error(CodegenErrorType::Internal(error))
    }

    fn warn(&mut self, message: impl Into<String>) -> CompileResult<()> {
        self.warn_ranged(message, self.current_source_range)
    }

    fn warn_ranged(&mut self, message: impl Into<String>, range: TextRange) -> CompileResult<()> {
        let message = message.into();
        if self.opts.warnings_as_errors {
            return Err(self.error_ranged(CodegenErrorType::SyntaxError(message), range));
        }
        let warning = CompileWarning {
            message,
            location: Some(self.source_location(range.start())),
            end_location: Some(self.source_location(range.end())),
        };
        warn!("{}: {warning}", self.source_file.name());
        self.warnings.push(warning);
        Ok(())
    }

    // Bodies

    /// Compile the statements of a module or class body: docstring,
    /// statements, then the deferred annotations.
    fn compile_body(&mut self, body: &[Stmt]) -> CompileResult<()> {
        if self.future_annotations && self.current_symbol_table().annotations_used {
            if let Some(first) = body.first() {
                self.set_source_range(first.range());
            }
            emit!(self, Instruction::SetupAnnotations);
        }
        let mut statements = body;
        if !self.interactive
            && let Some((doc, rest)) = split_doc(body)
        {
            statements = rest;
            if self.opts.optimize < 2 {
                self.set_source_range(body[0].range());
                self.emit_load_const(ConstantData::str(clean_doc(doc)));
                self.compile_name("__doc__", NameUsage::Store)?;
            }
        }
        self.compile_statements(statements)?;
        if !self.future_annotations {
            let lineno = body
                .first()
                .map_or(OneIndexed::MIN, |s| self.line_number(s.range()));
            self.compile_deferred_annotations(lineno)?;
        }
        Ok(())
    }

    fn compile_future_features(&mut self, features: &[ruff_python_ast::Alias]) -> CompileResult<()> {
        if self.done_with_future_stmts {
            return Err(self.error(CodegenErrorType::InvalidFuturePlacement));
        }
        for feature in features {
            match feature.name.as_str() {
                // Python 3 features; always on
                "nested_scopes" | "generators" | "division" | "absolute_import"
                | "with_statement" | "print_function" | "unicode_literals" | "generator_stop" => {}
                "annotations" => self.future_annotations = true,
                other => {
                    return Err(
                        self.error(CodegenErrorType::InvalidFutureFeature(other.to_owned()))
                    );
                }
            }
        }
        Ok(())
    }
}

fn is_annotation_scope(typ: CompilerScope) -> bool {
    matches!(typ, CompilerScope::Annotation | CompilerScope::TypeParams)
}

fn sorted_names(
    table: &SymbolTable,
    pred: impl Fn(&crate::symboltable::Symbol) -> bool,
) -> IndexSet<String> {
    let mut names: Vec<&String> = table
        .symbols
        .values()
        .filter(|s| pred(s))
        .map(|s| &s.name)
        .collect();
    names.sort();
    names.into_iter().cloned().collect()
}

/// Inspect the first statement of a body for a docstring.
fn split_doc(body: &[Stmt]) -> Option<(&str, &[Stmt])> {
    let (Stmt::Expr(expr), rest) = body.split_first()? else {
        return None;
    };
    match &*expr.value {
        Expr::StringLiteral(value) => Some((value.value.to_str(), rest)),
        _ => None,
    }
}

/// `inspect.cleandoc`, except that leading and trailing blank lines are kept
/// so line numbers stay meaningful.
fn clean_doc(doc: &str) -> String {
    let doc = expandtabs(doc, 8);
    let margin = doc
        .split('\n')
        .skip(1)
        .filter(|line| !line.trim_start_matches(' ').is_empty())
        .map(|line| line.len() - line.trim_start_matches(' ').len())
        .min()
        .unwrap_or(0);

    let mut lines = doc.split('\n');
    let mut cleaned = String::with_capacity(doc.len());
    if let Some(first) = lines.next() {
        cleaned.push_str(first.trim_start_matches(' '));
    }
    for line in lines {
        cleaned.push('\n');
        let indent = line.len() - line.trim_start_matches(' ').len();
        cleaned.push_str(&line[indent.min(margin)..]);
    }
    cleaned
}

fn expandtabs(input: &str, tab_stop: usize) -> String {
    let mut expanded = String::with_capacity(input.len());
    let mut column = 0usize;
    for ch in input.chars() {
        match ch {
            '\t' => {
                let spaces = tab_stop - column % tab_stop;
                expanded.extend(core::iter::repeat_n(' ', spaces));
                column += spaces;
            }
            '\r' | '\n' => {
                expanded.push(ch);
                column = 0;
            }
            _ => {
                expanded.push(ch);
                column += 1;
            }
        }
    }
    expanded
}

pub fn ruff_int_to_bigint(int: &Int) -> Result<BigInt, CodegenErrorType> {
    if let Some(small) = int.as_u64() {
        Ok(BigInt::from(small))
    } else {
        parse_big_integer(int)
    }
}

/// Big integers keep their source spelling, which may use any of the four
/// radix prefixes and `_` separators.
fn parse_big_integer(int: &Int) -> Result<BigInt, CodegenErrorType> {
    let text = int.to_string().replace('_', "");
    let (digits, radix) = match text.get(0..2) {
        Some("0b" | "0B") => (&text[2..], 2),
        Some("0o" | "0O") => (&text[2..], 8),
        Some("0x" | "0X") => (&text[2..], 16),
        _ => (text.as_str(), 10),
    };
    BigInt::from_str_radix(digits, radix).map_err(|e| {
        CodegenErrorType::SyntaxError(format!(
            "unparsed integer literal (radix {radix}): {digits} ({e})"
        ))
    })
}

// Keep this trait private to the compiler: oparg indices never get near u32::MAX.
trait ToU32 {
    fn to_u32(self) -> u32;
}

impl ToU32 for usize {
    fn to_u32(self) -> u32 {
        u32::try_from(self).unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use itertools::Itertools;
    use pylower_compiler_core::SourceFileBuilder;
    use ruff_python_parser::parse_module;

    pub(crate) fn compile_with(source: &str, opts: CompileOpts) -> CompileResult<CompileOutput> {
        let parsed = parse_module(source).unwrap();
        let source_file = SourceFileBuilder::new("<test>", source).finish();
        let symbols = SymbolTable::scan_program(parsed.syntax(), source_file.clone())
            .map_err(|e| e.into_codegen_error("<test>".to_owned()))?;
        let mut compiler = Compiler::new(source_file, symbols, opts);
        compiler.compile_program(parsed.syntax())?;
        compiler.finish()
    }

    /// A fresh compiler for `source`, next to the module it should compile.
    pub(crate) fn compiler_for(source: &str) -> (ruff_python_ast::ModModule, Compiler) {
        let parsed = parse_module(source).unwrap();
        let source_file = SourceFileBuilder::new("<test>", source).finish();
        let symbols = SymbolTable::scan_program(parsed.syntax(), source_file.clone()).unwrap();
        let compiler = Compiler::new(source_file, symbols, CompileOpts::default());
        (parsed.into_syntax(), compiler)
    }

    pub(crate) fn try_compile(source: &str) -> CompileResult<CodeObject> {
        compile_with(source, CompileOpts::default()).map(|out| out.code)
    }

    pub(crate) fn compile(source: &str) -> CodeObject {
        try_compile(source).unwrap()
    }

    pub(crate) fn compile_error(source: &str) -> CodegenErrorType {
        try_compile(source).unwrap_err().error
    }

    /// One instruction per line, as `Instruction::display` renders it.
    pub(crate) fn listing(code: &CodeObject) -> String {
        code.instructions
            .iter()
            .map(|unit| unit.op.display(unit.arg, code).to_string())
            .join("\n")
    }

    pub(crate) fn ops(code: &CodeObject) -> Vec<Instruction> {
        code.instructions.iter().map(|unit| unit.op).collect()
    }

    /// The first nested code object named `name`, searched depth first.
    pub(crate) fn find_code<'a>(code: &'a CodeObject, name: &str) -> &'a CodeObject {
        fn walk<'a>(code: &'a CodeObject, name: &str) -> Option<&'a CodeObject> {
            code.child_codes()
                .find(|c| c.obj_name == name)
                .or_else(|| code.child_codes().find_map(|c| walk(c, name)))
        }
        walk(code, name).unwrap_or_else(|| panic!("no code object named {name}"))
    }

    pub(crate) fn contains_op(code: &CodeObject, op: Instruction) -> bool {
        ops(code).contains(&op)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn simple_assignment() {
        let code = compile("x = 1\n");
        insta::assert_snapshot!(listing(&code), @r"
        RESUME(AtFuncStart)
        LOAD_CONST(1)
        STORE_NAME(0, x)
        LOAD_CONST(None)
        RETURN_VALUE
        ");
    }

    #[test]
    fn module_docstring() {
        let code = compile("'''doc'''\nx = 1\n");
        assert_eq!(code.names[0], "__doc__");
        assert_eq!(code.constants[0], ConstantData::str("doc"));

        let out = compile_with(
            "'''doc'''\n",
            CompileOpts {
                optimize: 2,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(out.code.names.is_empty());
    }

    #[test]
    fn clean_doc_strips_common_margin() {
        assert_eq!(clean_doc("  first\n    a\n      b\n"), "first\na\n  b\n");
        assert_eq!(clean_doc("x\n\tindented"), "x\nindented");
        assert_eq!(clean_doc("only"), "only");
    }

    #[test]
    fn expandtabs_uses_tab_stops() {
        assert_eq!(expandtabs("a\tb", 8), "a       b");
        assert_eq!(expandtabs("\t\n\tx", 4), "    \n    x");
    }

    #[test]
    fn big_integers_in_any_radix() {
        let code = compile("x = 0x1_0000_0000_0000_0000\n");
        assert_eq!(
            code.constants[0],
            ConstantData::Integer {
                value: BigInt::from(1u128 << 64)
            }
        );
    }

    #[test]
    fn qualnames_follow_nesting() {
        let code = compile(
            "class A:\n    def f(self):\n        def g():\n            pass\n        return g\n",
        );
        assert_eq!(find_code(&code, "A").qualname, "A");
        assert_eq!(find_code(&code, "f").qualname, "A.f");
        assert_eq!(find_code(&code, "g").qualname, "A.f.<locals>.g");
    }

    #[test]
    fn global_declaration_resets_qualname() {
        let code = compile("def outer():\n    global inner\n    def inner():\n        pass\n");
        assert_eq!(find_code(&code, "inner").qualname, "inner");
    }

    #[test]
    fn cell_and_free_variables_are_sorted() {
        let code = compile(
            "def f():\n    b = 1\n    a = 2\n    def g():\n        return a + b\n    return g\n",
        );
        let f = find_code(&code, "f");
        assert_eq!(&*f.cellvars, ["a", "b"]);
        let g = find_code(&code, "g");
        assert_eq!(&*g.freevars, ["a", "b"]);
        assert!(g.flags.contains(CodeFlags::NESTED));
    }

    #[test]
    fn name_ops_by_scope() {
        let code = compile(
            "g = 0\ndef f(a):\n    global h\n    h = a\n    b = g\n    def inner():\n        return b\n",
        );
        let f = find_code(&code, "f");
        let text = listing(f);
        assert!(text.contains("STORE_GLOBAL(0, h)"), "{text}");
        assert!(text.contains("LOAD_GLOBAL(1, g)"), "{text}");
        assert!(text.contains("STORE_DEREF(0, b)"), "{text}");
        assert!(text.contains("LOAD_FAST(0, a)"), "{text}");
        let inner = find_code(&code, "inner");
        assert!(text.contains("MAKE_FUNCTION"));
        assert!(listing(inner).contains("LOAD_DEREF(0, b)"));
    }

    #[test]
    fn class_body_reads_free_variable_through_locals() {
        let code = compile("def f():\n    x = 1\n    class C:\n        y = x\n");
        let class = listing(find_code(&code, "C"));
        assert!(class.contains("LOAD_LOCALS"), "{class}");
        assert!(class.contains("LOAD_FROM_DICT_OR_DEREF"), "{class}");
    }

    #[test]
    fn debug_is_a_constant() {
        let code = compile("x = __debug__\n");
        assert_eq!(code.constants[0], ConstantData::Boolean { value: true });
        let out = compile_with(
            "x = __debug__\n",
            CompileOpts {
                optimize: 1,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(out.code.constants[0], ConstantData::Boolean { value: false });
    }

    #[test]
    fn future_import_must_come_first() {
        assert_eq!(
            compile_error("x = 1\nfrom __future__ import annotations\n"),
            CodegenErrorType::InvalidFuturePlacement
        );
        assert_eq!(
            compile_error("from __future__ import braces\n"),
            CodegenErrorType::InvalidFutureFeature("braces".to_owned())
        );
        compile("'''doc'''\nfrom __future__ import annotations\n");
    }

    #[test]
    fn introspection_keeps_nested_sequences() {
        let out = compile_with(
            "def f():\n    pass\n",
            CompileOpts {
                introspection: true,
                ..Default::default()
            },
        )
        .unwrap();
        let seq = out.sequence.unwrap();
        assert_eq!(seq.nested().len(), 1);
        assert_eq!(seq.nested()[0].opcodes().last(), Some(Instruction::ReturnValue));
    }

    #[test]
    fn eval_mode_returns_the_value() {
        let parsed = ruff_python_parser::parse_expression("1 + x").unwrap();
        let source_file =
            pylower_compiler_core::SourceFileBuilder::new("<eval>", "1 + x").finish();
        let code =
            compile_expression(parsed.syntax(), source_file, CompileOpts::default()).unwrap();
        let ops = ops(&code);
        assert!(matches!(ops.last(), Some(Instruction::ReturnValue)));
        assert!(!ops.contains(&Instruction::PopTop));
    }

    #[test]
    fn interactive_mode_prints_expressions() {
        let parsed = ruff_python_parser::parse_module("1 + 2\n").unwrap();
        let source_file =
            pylower_compiler_core::SourceFileBuilder::new("<stdin>", "1 + 2\n").finish();
        let code =
            compile_program_single(parsed.syntax(), source_file, CompileOpts::default()).unwrap();
        assert!(listing(&code).contains("CALL_INTRINSIC_1(Print)"));
    }

    #[test]
    fn compiling_twice_gives_the_same_code() {
        let source = "import os\nclass C:\n    def m(self, a=1, *, b=(1, 2)):\n        self.z = {k: v for k, v in a}\n        return lambda: (a, b)\nmatch os.name:\n    case 'nt' | 'posix' as n:\n        print(n)\n";
        let first = compile(source);
        let second = compile(source);
        assert_eq!(first.to_string(), second.to_string());
        assert_eq!(first.names, second.names);
        let m = (find_code(&first, "m"), find_code(&second, "m"));
        assert_eq!(m.0.varnames, m.1.varnames);
        assert_eq!(m.0.cellvars, m.1.cellvars);
    }

    #[test]
    fn equal_tuple_literals_share_a_constant() {
        let code = compile("a = (1, 2)\nb = (1, 2)\nc = (1, 2.0)\n");
        let int = |value: i32| ConstantData::Integer {
            value: BigInt::from(value),
        };
        let pair = ConstantData::Tuple {
            elements: vec![int(1), int(2)],
        };
        assert_eq!(code.constants.iter().filter(|c| **c == pair).count(), 1);
        // (1, 2), (1, 2.0) and None
        assert_eq!(code.constants.len(), 3);
        let text = listing(&code);
        assert_eq!(text.matches("LOAD_CONST((1, 2))").count(), 2, "{text}");
    }
}
