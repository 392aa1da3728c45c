/* Scope analysis for a parsed module.

The builder walks the AST once and records, per scope, every name that is
bound, used or declared global/nonlocal. The analysis pass then resolves each
name to a storage class across nested scopes: fast local, cell, free,
implicit or explicit global. The code generator treats the finished arena as
a read-only oracle.
*/

use crate::{
    IndexMap,
    error::{CodegenError, CodegenErrorType},
};
use alloc::{borrow::Cow, fmt};
use bitflags::bitflags;
use core::ops::Index;
use pylower_compiler_core::{PositionEncoding, SourceFile, SourceLocation};
use ruff_python_ast as ast;
use ruff_text_size::{Ranged, TextRange};
use std::collections::{HashMap, HashSet};

/// Captures all symbols in one scope, and points at the scopes nested in it.
#[derive(Clone)]
pub struct SymbolTable {
    /// The name of this symbol table. Often the name of the class or function.
    pub name: String,

    /// The type of symbol table
    pub typ: CompilerScope,

    /// The line number in the source code where this symboltable begins.
    pub line_number: u32,

    /// Whether the scope is nested inside a function-like scope.
    pub is_nested: bool,

    /// A set of symbols present on this scope level.
    pub symbols: IndexMap<String, Symbol>,

    /// Parameter names in signature order. Other locals are numbered by the
    /// code generator on first use.
    pub varnames: Vec<String>,

    /// Arena indices of the directly nested scopes, in source order.
    pub children: Vec<usize>,

    /// Whether this class scope needs an implicit __class__ cell
    pub needs_class_closure: bool,

    /// Whether this class scope needs an implicit __classdict__ cell
    pub needs_classdict: bool,

    /// Whether names in this scope may be looked up in an enclosing class
    /// namespace first (annotation and type parameter scopes in a class).
    pub can_see_class_scope: bool,

    /// Whether this comprehension is compiled into its parent's code.
    pub comp_inlined: bool,

    pub comprehension: Option<ComprehensionKind>,

    pub is_generator: bool,

    pub is_coroutine: bool,

    /// A function defined directly in a class body.
    pub is_method: bool,

    /// Deferred annotations of a module or class body are evaluated in this scope.
    pub annotation_block: Option<usize>,

    /// Whether any annotation was seen in this scope (for function
    /// annotation scopes: whether the signature has any).
    pub annotations_used: bool,

    /// Type parameter scopes of a generic class only mangle the type
    /// parameter names themselves.
    pub mangled_names: Option<HashSet<String>>,

    /// How the scope is described in "cannot be used within" errors.
    scope_info: Option<&'static str>,

    /// Location of the first `global`/`nonlocal` statement naming a symbol.
    directives: HashMap<String, TextRange>,

    comp_iter_target: bool,
    comp_iter_expr: u32,
}

impl SymbolTable {
    fn new(name: String, typ: CompilerScope, line_number: u32, is_nested: bool) -> Self {
        Self {
            name,
            typ,
            line_number,
            is_nested,
            symbols: IndexMap::default(),
            varnames: Vec::new(),
            children: Vec::new(),
            needs_class_closure: false,
            needs_classdict: false,
            can_see_class_scope: false,
            comp_inlined: false,
            comprehension: None,
            is_generator: false,
            is_coroutine: false,
            is_method: false,
            annotation_block: None,
            annotations_used: false,
            mangled_names: None,
            scope_info: None,
            directives: HashMap::new(),
            comp_iter_target: false,
            comp_iter_expr: 0,
        }
    }

    pub fn scan_program(
        program: &ast::ModModule,
        source_file: SourceFile,
    ) -> SymbolTableResult<SymbolTableArena> {
        let mut builder = SymbolTableBuilder::new(source_file);
        builder.scan_future_imports(&program.body);
        builder.scan_statements(program.body.as_ref())?;
        builder.finish()
    }

    pub fn scan_expr(
        expr: &ast::ModExpression,
        source_file: SourceFile,
    ) -> SymbolTableResult<SymbolTableArena> {
        let mut builder = SymbolTableBuilder::new(source_file);
        builder.scan_expression(expr.body.as_ref(), ExpressionContext::Load)?;
        builder.finish()
    }

    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(name)
    }

    /// Function, lambda, comprehension, annotation and type parameter
    /// scopes: everything that gets fast locals.
    pub const fn is_function_like(&self) -> bool {
        !matches!(self.typ, CompilerScope::Module | CompilerScope::Class)
    }

    /// Apply private name mangling as seen from this scope.
    pub fn mangle<'a>(&self, private: Option<&str>, name: &'a str) -> Cow<'a, str> {
        if let Some(names) = &self.mangled_names
            && !names.contains(name)
        {
            return Cow::Borrowed(name);
        }
        mangle_name(private, name)
    }
}

impl fmt::Debug for SymbolTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SymbolTable({} {:?}: {} symbols, {} sub scopes)",
            self.typ,
            self.name,
            self.symbols.len(),
            self.children.len()
        )
    }
}

/// Every scope of one compilation, addressable by the AST node that opened it.
#[derive(Clone, Debug, Default)]
pub struct SymbolTableArena {
    tables: Vec<SymbolTable>,
    by_node: HashMap<(CompilerScope, TextRange), usize>,
    /// `from __future__ import annotations` is in effect.
    pub future_annotations: bool,
}

impl SymbolTableArena {
    pub const ROOT: usize = 0;

    /// The module (or expression) scope.
    pub fn root(&self) -> &SymbolTable {
        &self.tables[Self::ROOT]
    }

    pub fn get(&self, id: usize) -> Option<&SymbolTable> {
        self.tables.get(id)
    }

    /// Find the scope opened by the node at `range`.
    ///
    /// Functions, lambdas, classes and comprehensions are keyed by the range
    /// of their own node; type parameter scopes by the range of the type
    /// parameter list; bound and default scopes by the range of the
    /// expression; function annotation scopes by the range of the parameter
    /// list; type alias values by the range of the statement.
    pub fn find(&self, typ: CompilerScope, range: TextRange) -> Option<usize> {
        self.by_node.get(&(typ, range)).copied()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SymbolTable> + '_ {
        self.tables.iter()
    }
}

impl Index<usize> for SymbolTableArena {
    type Output = SymbolTable;

    fn index(&self, id: usize) -> &SymbolTable {
        &self.tables[id]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompilerScope {
    Module,
    Class,
    Function,
    AsyncFunction,
    Lambda,
    Comprehension,
    TypeParams,
    Annotation,
}

impl fmt::Display for CompilerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Module => write!(f, "module"),
            Self::Class => write!(f, "class"),
            Self::Function => write!(f, "function"),
            Self::AsyncFunction => write!(f, "async function"),
            Self::Lambda => write!(f, "lambda"),
            Self::Comprehension => write!(f, "comprehension"),
            Self::TypeParams => write!(f, "type parameter"),
            Self::Annotation => write!(f, "annotation"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComprehensionKind {
    List,
    Set,
    Dict,
    Generator,
}

impl ComprehensionKind {
    const fn describe(self) -> &'static str {
        match self {
            Self::List => "list comprehension",
            Self::Set => "set comprehension",
            Self::Dict => "dict comprehension",
            Self::Generator => "generator expression",
        }
    }
}

/// Indicator for a single symbol what the scope of this symbol is.
/// `Unknown` only survives for symbols the analysis never saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolScope {
    Unknown,
    Local,
    GlobalExplicit,
    GlobalImplicit,
    Free,
    Cell,
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct SymbolFlags: u16 {
        const REFERENCED = 0x001;
        const ASSIGNED = 0x002;
        const PARAMETER = 0x004;
        const ANNOTATED = 0x008;
        const IMPORTED = 0x010;
        const NONLOCAL = 0x020;
        const GLOBAL = 0x040;
        /// A free variable of a method that the class body also binds or uses:
        /// ```python
        /// def foo(x):
        ///     class A:
        ///         x = 1
        ///         def method(self):
        ///             return x
        /// ```
        const FREE_CLASS = 0x080;
        /// The target of a comprehension `for` clause.
        const COMP_ITER = 0x100;
        /// A cell of an inlined comprehension, hosted by the enclosing scope.
        const COMP_CELL = 0x200;
        const TYPE_PARAM = 0x400;
        const BOUND = Self::ASSIGNED.bits() | Self::PARAMETER.bits() | Self::IMPORTED.bits();
    }
}

/// A single symbol in a table. Has various properties such as the scope
/// of the symbol, and also the various uses of the symbol.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub scope: SymbolScope,
    pub flags: SymbolFlags,
}

impl Symbol {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            scope: SymbolScope::Unknown,
            flags: SymbolFlags::empty(),
        }
    }

    pub const fn is_global(&self) -> bool {
        matches!(
            self.scope,
            SymbolScope::GlobalExplicit | SymbolScope::GlobalImplicit
        )
    }

    pub const fn is_local(&self) -> bool {
        matches!(self.scope, SymbolScope::Local | SymbolScope::Cell)
    }

    pub const fn is_bound(&self) -> bool {
        self.flags.intersects(SymbolFlags::BOUND)
    }
}

#[derive(Debug)]
pub struct SymbolTableError {
    pub error: String,
    pub location: Option<SourceLocation>,
}

impl SymbolTableError {
    pub fn into_codegen_error(self, source_path: String) -> CodegenError {
        CodegenError {
            location: self.location,
            end_location: None,
            error: CodegenErrorType::SyntaxError(self.error),
            source_path,
        }
    }
}

impl fmt::Display for SymbolTableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.error)
    }
}

pub type SymbolTableResult<T = ()> = Result<T, SymbolTableError>;

#[derive(Debug, Clone, Copy)]
enum SymbolUsage {
    Global,
    Nonlocal,
    Used,
    Assigned,
    Imported,
    AnnotationAssigned,
    Parameter,
    TypeParam,
}

impl SymbolUsage {
    const fn flags(self) -> SymbolFlags {
        match self {
            Self::Global => SymbolFlags::GLOBAL,
            Self::Nonlocal => SymbolFlags::NONLOCAL,
            Self::Used => SymbolFlags::REFERENCED,
            Self::Assigned => SymbolFlags::ASSIGNED,
            Self::Imported => SymbolFlags::IMPORTED,
            Self::AnnotationAssigned => SymbolFlags::ASSIGNED.union(SymbolFlags::ANNOTATED),
            Self::Parameter => SymbolFlags::PARAMETER,
            Self::TypeParam => SymbolFlags::ASSIGNED.union(SymbolFlags::TYPE_PARAM),
        }
    }
}

/// Enum to indicate in what mode an expression was used.
#[derive(Copy, Clone, PartialEq, Eq)]
enum ExpressionContext {
    Load,
    Store,
    Delete,
}

type NameSet = HashSet<String>;

struct SymbolTableBuilder {
    class_name: Option<String>,
    tables: Vec<SymbolTable>,
    by_node: HashMap<(CompilerScope, TextRange), usize>,
    current: usize,
    // Enclosing scopes of `current`, innermost last.
    stack: Vec<usize>,
    future_annotations: bool,
    source_file: SourceFile,
}

impl SymbolTableBuilder {
    fn new(source_file: SourceFile) -> Self {
        Self {
            class_name: None,
            tables: vec![SymbolTable::new(
                "top".to_owned(),
                CompilerScope::Module,
                0,
                false,
            )],
            by_node: HashMap::new(),
            current: SymbolTableArena::ROOT,
            stack: Vec::new(),
            future_annotations: false,
            source_file,
        }
    }

    fn finish(mut self) -> SymbolTableResult<SymbolTableArena> {
        let mut free = NameSet::new();
        self.analyze_block(
            SymbolTableArena::ROOT,
            None,
            &mut free,
            NameSet::new(),
            NameSet::new(),
            None,
        )?;
        Ok(SymbolTableArena {
            tables: self.tables,
            by_node: self.by_node,
            future_annotations: self.future_annotations,
        })
    }

    fn table(&self) -> &SymbolTable {
        &self.tables[self.current]
    }

    fn table_mut(&mut self) -> &mut SymbolTable {
        &mut self.tables[self.current]
    }

    fn location(&self, range: TextRange) -> SourceLocation {
        self.source_file
            .to_source_code()
            .source_location(range.start(), PositionEncoding::Utf8)
    }

    fn error(&self, error: impl Into<String>, range: TextRange) -> SymbolTableError {
        SymbolTableError {
            error: error.into(),
            location: Some(self.location(range)),
        }
    }

    fn line_index_start(&self, range: TextRange) -> u32 {
        self.source_file
            .to_source_code()
            .line_index(range.start())
            .get() as _
    }

    /// Open a new scope nested in the current one and make it current.
    fn enter_scope(
        &mut self,
        name: &str,
        typ: CompilerScope,
        key: Option<TextRange>,
        line_number: u32,
    ) -> usize {
        let parent = self.table();
        let is_nested = parent.is_nested || parent.is_function_like();
        let is_method = parent.typ == CompilerScope::Class
            && matches!(typ, CompilerScope::Function | CompilerScope::AsyncFunction);
        let mut table = SymbolTable::new(name.to_owned(), typ, line_number, is_nested);
        table.is_method = is_method;
        table.is_coroutine = typ == CompilerScope::AsyncFunction;

        let id = self.tables.len();
        self.tables.push(table);
        self.tables[self.current].children.push(id);
        if let Some(range) = key {
            self.by_node.insert((typ, range), id);
        }
        self.stack.push(self.current);
        self.current = id;
        trace!("enter {typ} scope {name:?} (#{id})");
        id
    }

    fn reenter_scope(&mut self, id: usize) {
        self.stack.push(self.current);
        self.current = id;
    }

    fn leave_scope(&mut self) {
        self.current = self.stack.pop().unwrap_or(SymbolTableArena::ROOT);
    }

    fn enter_type_param_block(
        &mut self,
        name: &str,
        type_params: &ast::TypeParams,
        has_defaults: bool,
        has_kwdefaults: bool,
        is_class: bool,
    ) -> SymbolTableResult {
        let in_class = self.table().typ == CompilerScope::Class;
        let range = type_params.range;
        self.enter_scope(
            name,
            CompilerScope::TypeParams,
            Some(range),
            self.line_index_start(range),
        );
        if in_class {
            self.table_mut().can_see_class_scope = true;
            self.register_name("__classdict__", SymbolUsage::Used, range)?;
        }
        if is_class {
            // set when the tuple of parameters is built, used for the generic base
            self.register_name(".type_params", SymbolUsage::Assigned, range)?;
            self.register_name(".type_params", SymbolUsage::Used, range)?;
            self.register_name(".generic_base", SymbolUsage::Assigned, range)?;
            self.register_name(".generic_base", SymbolUsage::Used, range)?;
        }
        if has_defaults {
            self.register_name(".defaults", SymbolUsage::Parameter, range)?;
        }
        if has_kwdefaults {
            self.register_name(".kwdefaults", SymbolUsage::Parameter, range)?;
        }
        Ok(())
    }

    /// Enter (creating on first use) the scope holding the deferred
    /// annotations of the current module or class body.
    fn enter_annotation_block(&mut self, range: TextRange) -> SymbolTableResult {
        if let Some(id) = self.table().annotation_block {
            self.reenter_scope(id);
            return Ok(());
        }
        let parent = self.current;
        let in_class = self.table().typ == CompilerScope::Class;
        let id = self.enter_scope(
            "__annotate__",
            CompilerScope::Annotation,
            None,
            self.line_index_start(range),
        );
        self.tables[parent].annotation_block = Some(id);
        self.register_name(".format", SymbolUsage::Parameter, range)?;
        if in_class && !self.future_annotations {
            self.table_mut().can_see_class_scope = true;
            self.register_name("__classdict__", SymbolUsage::Used, range)?;
        }
        Ok(())
    }

    fn scan_future_imports(&mut self, body: &[ast::Stmt]) {
        for statement in body {
            match statement {
                ast::Stmt::ImportFrom(ast::StmtImportFrom { module, names, .. })
                    if module.as_ref().map(|id| id.as_str()) == Some("__future__") =>
                {
                    if names.iter().any(|alias| &alias.name == "annotations") {
                        self.future_annotations = true;
                    }
                }
                ast::Stmt::Expr(ast::StmtExpr { value, .. }) if value.is_string_literal_expr() => {}
                _ => break,
            }
        }
    }

    fn scan_statements(&mut self, statements: &[ast::Stmt]) -> SymbolTableResult {
        for statement in statements {
            self.scan_statement(statement)?;
        }
        Ok(())
    }

    fn scan_parameters(&mut self, parameters: &ast::Parameters) -> SymbolTableResult {
        for parameter in parameters
            .posonlyargs
            .iter()
            .chain(&parameters.args)
            .chain(&parameters.kwonlyargs)
        {
            self.scan_parameter(&parameter.parameter)?;
        }
        if let Some(vararg) = &parameters.vararg {
            self.scan_parameter(vararg)?;
        }
        if let Some(kwarg) = &parameters.kwarg {
            self.scan_parameter(kwarg)?;
        }
        Ok(())
    }

    fn scan_parameter(&mut self, parameter: &ast::Parameter) -> SymbolTableResult {
        self.check_name(
            parameter.name.as_str(),
            ExpressionContext::Store,
            parameter.name.range,
        )?;
        self.register_ident(&parameter.name, SymbolUsage::Parameter)
    }

    fn scan_defaults(&mut self, parameters: &ast::Parameters) -> SymbolTableResult {
        for default in parameters
            .posonlyargs
            .iter()
            .chain(&parameters.args)
            .chain(&parameters.kwonlyargs)
            .filter_map(|p| p.default.as_deref())
        {
            self.scan_expression(default, ExpressionContext::Load)?;
        }
        Ok(())
    }

    /// Parameter and return annotations live in their own scope, keyed by
    /// the parameter list, whether or not any are present.
    fn scan_function_annotations(
        &mut self,
        name: &str,
        parameters: &ast::Parameters,
        returns: Option<&ast::Expr>,
    ) -> SymbolTableResult {
        let in_class = self.table().typ == CompilerScope::Class;
        self.enter_scope(
            name,
            CompilerScope::Annotation,
            Some(parameters.range),
            self.line_index_start(parameters.range),
        );
        self.register_name(".format", SymbolUsage::Parameter, parameters.range)?;
        if in_class && !self.future_annotations {
            self.table_mut().can_see_class_scope = true;
            self.register_name("__classdict__", SymbolUsage::Used, parameters.range)?;
        }

        let annotations = parameters
            .args
            .iter()
            .chain(&parameters.posonlyargs)
            .map(|p| &p.parameter)
            .chain(parameters.vararg.as_deref())
            .chain(parameters.kwonlyargs.iter().map(|p| &p.parameter))
            .chain(parameters.kwarg.as_deref())
            .filter_map(|p| p.annotation.as_deref())
            .chain(returns);
        for annotation in annotations {
            self.table_mut().annotations_used = true;
            if !self.future_annotations {
                self.scan_expression(annotation, ExpressionContext::Load)?;
            }
        }
        self.leave_scope();
        Ok(())
    }

    fn scan_annotation(&mut self, annotation: &ast::Expr) -> SymbolTableResult {
        self.table_mut().annotations_used = true;
        if self.future_annotations {
            // stringified at compile time, nothing to resolve
            return Ok(());
        }
        self.enter_annotation_block(annotation.range())?;
        let result = self.scan_expression(annotation, ExpressionContext::Load);
        self.leave_scope();
        result
    }

    fn scan_statement(&mut self, statement: &ast::Stmt) -> SymbolTableResult {
        use ast::*;
        match &statement {
            Stmt::Global(StmtGlobal { names, range, .. }) => {
                for name in names {
                    self.scan_declaration(name, SymbolUsage::Global, *range)?;
                }
            }
            Stmt::Nonlocal(StmtNonlocal { names, range, .. }) => {
                for name in names {
                    self.scan_declaration(name, SymbolUsage::Nonlocal, *range)?;
                }
            }
            Stmt::FunctionDef(StmtFunctionDef {
                name,
                body,
                parameters,
                decorator_list,
                type_params,
                returns,
                is_async,
                range,
                ..
            }) => {
                self.register_ident(name, SymbolUsage::Assigned)?;
                self.scan_defaults(parameters)?;
                self.scan_decorators(decorator_list)?;
                if let Some(type_params) = type_params {
                    let has_defaults = parameters
                        .posonlyargs
                        .iter()
                        .chain(&parameters.args)
                        .any(|p| p.default.is_some());
                    let has_kwdefaults = parameters.kwonlyargs.iter().any(|p| p.default.is_some());
                    self.enter_type_param_block(
                        name.as_str(),
                        type_params,
                        has_defaults,
                        has_kwdefaults,
                        false,
                    )?;
                    self.scan_type_params(type_params)?;
                }
                self.scan_function_annotations(name.as_str(), parameters, returns.as_deref())?;
                let typ = if *is_async {
                    CompilerScope::AsyncFunction
                } else {
                    CompilerScope::Function
                };
                self.enter_scope(
                    name.as_str(),
                    typ,
                    Some(*range),
                    self.line_index_start(*range),
                );
                self.scan_parameters(parameters)?;
                self.scan_statements(body)?;
                self.leave_scope();
                if type_params.is_some() {
                    self.leave_scope();
                }
            }
            Stmt::ClassDef(StmtClassDef {
                name,
                body,
                arguments,
                decorator_list,
                type_params,
                range,
                ..
            }) => {
                self.register_ident(name, SymbolUsage::Assigned)?;
                self.scan_decorators(decorator_list)?;
                let prev_class = self.class_name.clone();
                if let Some(type_params) = type_params {
                    self.enter_type_param_block(name.as_str(), type_params, false, false, true)?;
                    self.class_name = Some(name.to_string());
                    self.table_mut().mangled_names = Some(HashSet::new());
                    self.scan_type_params(type_params)?;
                }
                if let Some(arguments) = arguments {
                    self.scan_expressions(&arguments.args, ExpressionContext::Load)?;
                    for keyword in &arguments.keywords {
                        self.scan_expression(&keyword.value, ExpressionContext::Load)?;
                    }
                }
                self.enter_scope(
                    name.as_str(),
                    CompilerScope::Class,
                    Some(*range),
                    self.line_index_start(*range),
                );
                self.class_name = Some(name.to_string());
                if let Some(type_params) = type_params {
                    self.register_name("__type_params__", SymbolUsage::Assigned, type_params.range)?;
                    self.register_name(".type_params", SymbolUsage::Used, type_params.range)?;
                }
                self.scan_statements(body)?;
                self.leave_scope();
                if type_params.is_some() {
                    self.leave_scope();
                }
                self.class_name = prev_class;
            }
            Stmt::Expr(StmtExpr { value, .. }) => {
                self.scan_expression(value, ExpressionContext::Load)?
            }
            Stmt::If(StmtIf {
                test,
                body,
                elif_else_clauses,
                ..
            }) => {
                self.scan_expression(test, ExpressionContext::Load)?;
                self.scan_statements(body)?;
                for elif in elif_else_clauses {
                    if let Some(test) = &elif.test {
                        self.scan_expression(test, ExpressionContext::Load)?;
                    }
                    self.scan_statements(&elif.body)?;
                }
            }
            Stmt::For(StmtFor {
                target,
                iter,
                body,
                orelse,
                ..
            }) => {
                self.scan_expression(target, ExpressionContext::Store)?;
                self.scan_expression(iter, ExpressionContext::Load)?;
                self.scan_statements(body)?;
                self.scan_statements(orelse)?;
            }
            Stmt::While(StmtWhile {
                test, body, orelse, ..
            }) => {
                self.scan_expression(test, ExpressionContext::Load)?;
                self.scan_statements(body)?;
                self.scan_statements(orelse)?;
            }
            Stmt::Break(_) | Stmt::Continue(_) | Stmt::Pass(_) => {
                // No symbols here.
            }
            Stmt::Import(StmtImport { names, .. })
            | Stmt::ImportFrom(StmtImportFrom { names, .. }) => {
                for name in names {
                    if let Some(alias) = &name.asname {
                        // `import my_module as my_alias`
                        self.check_name(alias.as_str(), ExpressionContext::Store, alias.range)?;
                        self.register_ident(alias, SymbolUsage::Imported)?;
                    } else if name.name.as_str() == "*" {
                        if self.table().typ != CompilerScope::Module {
                            return Err(self.error(
                                "import * only allowed at module level",
                                name.name.range,
                            ));
                        }
                    } else {
                        // `import a.b.c` binds `a`
                        let imported_name = name
                            .name
                            .split('.')
                            .next()
                            .unwrap_or_else(|| name.name.as_str());
                        self.check_name(imported_name, ExpressionContext::Store, name.name.range)?;
                        self.register_name(imported_name, SymbolUsage::Imported, name.name.range)?;
                    }
                }
            }
            Stmt::Return(StmtReturn { value, .. }) => {
                if let Some(expression) = value {
                    self.scan_expression(expression, ExpressionContext::Load)?;
                }
            }
            Stmt::Assert(StmtAssert { test, msg, .. }) => {
                self.scan_expression(test, ExpressionContext::Load)?;
                if let Some(expression) = msg {
                    self.scan_expression(expression, ExpressionContext::Load)?;
                }
            }
            Stmt::Delete(StmtDelete { targets, .. }) => {
                self.scan_expressions(targets, ExpressionContext::Delete)?;
            }
            Stmt::Assign(StmtAssign { targets, value, .. }) => {
                self.scan_expressions(targets, ExpressionContext::Store)?;
                self.scan_expression(value, ExpressionContext::Load)?;
            }
            Stmt::AugAssign(StmtAugAssign { target, value, .. }) => {
                self.scan_expression(target, ExpressionContext::Store)?;
                self.scan_expression(value, ExpressionContext::Load)?;
            }
            Stmt::AnnAssign(StmtAnnAssign {
                target,
                annotation,
                value,
                simple,
                ..
            }) => {
                match &**target {
                    Expr::Name(ast::ExprName { id, range, .. }) => {
                        let id_str = id.as_str();
                        let flags = self.lookup_flags(id_str);
                        if *simple
                            && self.current != SymbolTableArena::ROOT
                            && flags.intersects(SymbolFlags::GLOBAL | SymbolFlags::NONLOCAL)
                        {
                            let kind = if flags.contains(SymbolFlags::GLOBAL) {
                                "global"
                            } else {
                                "nonlocal"
                            };
                            return Err(self.error(
                                format!("annotated name '{id_str}' can't be {kind}"),
                                *range,
                            ));
                        }
                        self.check_name(id_str, ExpressionContext::Store, *range)?;
                        if *simple {
                            self.register_name(id_str, SymbolUsage::AnnotationAssigned, *range)?;
                        } else if value.is_some() {
                            self.register_name(id_str, SymbolUsage::Assigned, *range)?;
                        }
                    }
                    _ => {
                        self.scan_expression(target, ExpressionContext::Store)?;
                    }
                }
                self.scan_annotation(annotation)?;
                if let Some(value) = value {
                    self.scan_expression(value, ExpressionContext::Load)?;
                }
            }
            Stmt::With(StmtWith { items, body, .. }) => {
                for item in items {
                    self.scan_expression(&item.context_expr, ExpressionContext::Load)?;
                    if let Some(expression) = &item.optional_vars {
                        self.scan_expression(expression, ExpressionContext::Store)?;
                    }
                }
                self.scan_statements(body)?;
            }
            Stmt::Try(StmtTry {
                body,
                handlers,
                orelse,
                finalbody,
                ..
            }) => {
                self.scan_statements(body)?;
                for handler in handlers {
                    let ExceptHandler::ExceptHandler(ast::ExceptHandlerExceptHandler {
                        type_,
                        name,
                        body,
                        ..
                    }) = &handler;
                    if let Some(expression) = type_ {
                        self.scan_expression(expression, ExpressionContext::Load)?;
                    }
                    if let Some(name) = name {
                        self.check_name(name.as_str(), ExpressionContext::Store, name.range)?;
                        self.register_ident(name, SymbolUsage::Assigned)?;
                    }
                    self.scan_statements(body)?;
                }
                self.scan_statements(orelse)?;
                self.scan_statements(finalbody)?;
            }
            Stmt::Match(StmtMatch { subject, cases, .. }) => {
                self.scan_expression(subject, ExpressionContext::Load)?;
                for case in cases {
                    self.scan_pattern(&case.pattern)?;
                    if let Some(guard) = &case.guard {
                        self.scan_expression(guard, ExpressionContext::Load)?;
                    }
                    self.scan_statements(&case.body)?;
                }
            }
            Stmt::Raise(StmtRaise { exc, cause, .. }) => {
                if let Some(expression) = exc {
                    self.scan_expression(expression, ExpressionContext::Load)?;
                }
                if let Some(expression) = cause {
                    self.scan_expression(expression, ExpressionContext::Load)?;
                }
            }
            Stmt::TypeAlias(StmtTypeAlias {
                name,
                value,
                type_params,
                range,
                ..
            }) => {
                self.scan_expression(name, ExpressionContext::Store)?;
                let alias_name = match &**name {
                    Expr::Name(ExprName { id, .. }) => id.to_string(),
                    _ => "TypeAlias".to_owned(),
                };
                let in_class = self.table().typ == CompilerScope::Class;
                if let Some(type_params) = type_params {
                    self.enter_type_param_block(&alias_name, type_params, false, false, false)?;
                    self.scan_type_params(type_params)?;
                }
                self.enter_scope(
                    &alias_name,
                    CompilerScope::Annotation,
                    Some(*range),
                    self.line_index_start(*range),
                );
                self.table_mut().scope_info = Some("a type alias");
                if in_class {
                    self.table_mut().can_see_class_scope = true;
                    self.register_name("__classdict__", SymbolUsage::Used, value.range())?;
                }
                self.scan_expression(value, ExpressionContext::Load)?;
                self.leave_scope();
                if type_params.is_some() {
                    self.leave_scope();
                }
            }
            Stmt::IpyEscapeCommand(command) => {
                return Err(self.error("IPython escape commands are not supported", command.range));
            }
        }
        Ok(())
    }

    fn scan_declaration(
        &mut self,
        name: &ast::Identifier,
        usage: SymbolUsage,
        statement_range: TextRange,
    ) -> SymbolTableResult {
        let kind = match usage {
            SymbolUsage::Global => "global",
            _ => "nonlocal",
        };
        let flags = self.lookup_flags(name.as_str());
        let conflict = if flags.contains(SymbolFlags::PARAMETER) {
            Some(format!("name '{name}' is parameter and {kind}"))
        } else if flags.contains(SymbolFlags::REFERENCED) {
            Some(format!("name '{name}' is used prior to {kind} declaration"))
        } else if flags.contains(SymbolFlags::ANNOTATED) {
            Some(format!("annotated name '{name}' can't be {kind}"))
        } else if flags.contains(SymbolFlags::ASSIGNED) {
            Some(format!(
                "name '{name}' is assigned to before {kind} declaration"
            ))
        } else {
            None
        };
        if let Some(message) = conflict {
            return Err(self.error(message, statement_range));
        }
        self.register_ident(name, usage)?;
        let mangled = self.mangle(name.as_str()).into_owned();
        self.table_mut()
            .directives
            .entry(mangled)
            .or_insert(statement_range);
        Ok(())
    }

    fn scan_decorators(&mut self, decorators: &[ast::Decorator]) -> SymbolTableResult {
        for decorator in decorators {
            self.scan_expression(&decorator.expression, ExpressionContext::Load)?;
        }
        Ok(())
    }

    fn scan_expressions(
        &mut self,
        expressions: &[ast::Expr],
        context: ExpressionContext,
    ) -> SymbolTableResult {
        for expression in expressions {
            self.scan_expression(expression, context)?;
        }
        Ok(())
    }

    /// Reject yield, await and walrus in annotation-like scopes.
    fn check_expression_allowed(&self, what: &str, range: TextRange) -> SymbolTableResult {
        let table = self.table();
        let context = match (table.typ, table.scope_info) {
            (CompilerScope::Annotation | CompilerScope::TypeParams, Some(info)) => info,
            (CompilerScope::Annotation, None) => "an annotation",
            (CompilerScope::TypeParams, None) => "the definition of a generic",
            _ => return Ok(()),
        };
        Err(self.error(format!("{what} cannot be used within {context}"), range))
    }

    fn scan_expression(
        &mut self,
        expression: &ast::Expr,
        context: ExpressionContext,
    ) -> SymbolTableResult {
        use ast::*;
        match expression {
            Expr::BinOp(ExprBinOp { left, right, .. }) => {
                self.scan_expression(left, context)?;
                self.scan_expression(right, context)?;
            }
            Expr::BoolOp(ExprBoolOp { values, .. }) => {
                self.scan_expressions(values, context)?;
            }
            Expr::Compare(ExprCompare {
                left, comparators, ..
            }) => {
                self.scan_expression(left, context)?;
                self.scan_expressions(comparators, context)?;
            }
            Expr::Subscript(ExprSubscript { value, slice, .. }) => {
                self.scan_expression(value, ExpressionContext::Load)?;
                self.scan_expression(slice, ExpressionContext::Load)?;
            }
            Expr::Attribute(ExprAttribute {
                value, attr, range, ..
            }) => {
                self.check_name(attr.as_str(), context, *range)?;
                self.scan_expression(value, ExpressionContext::Load)?;
            }
            Expr::Dict(ExprDict { items, .. }) => {
                for item in items {
                    if let Some(key) = &item.key {
                        self.scan_expression(key, context)?;
                    }
                    self.scan_expression(&item.value, context)?;
                }
            }
            Expr::Await(ExprAwait { value, range, .. }) => {
                self.check_expression_allowed("await expression", *range)?;
                self.scan_expression(value, context)?;
                self.table_mut().is_coroutine = true;
            }
            Expr::Yield(ExprYield { value, range, .. }) => {
                self.check_expression_allowed("yield expression", *range)?;
                if let Some(expression) = value {
                    self.scan_expression(expression, context)?;
                }
                self.mark_generator(*range)?;
            }
            Expr::YieldFrom(ExprYieldFrom { value, range, .. }) => {
                self.check_expression_allowed("yield expression", *range)?;
                self.scan_expression(value, context)?;
                self.mark_generator(*range)?;
            }
            Expr::UnaryOp(ExprUnaryOp { operand, .. }) => {
                self.scan_expression(operand, context)?;
            }
            Expr::Starred(ExprStarred { value, .. }) => {
                self.scan_expression(value, context)?;
            }
            Expr::Tuple(ExprTuple { elts, .. })
            | Expr::Set(ExprSet { elts, .. })
            | Expr::List(ExprList { elts, .. }) => {
                self.scan_expressions(elts, context)?;
            }
            Expr::Slice(ExprSlice {
                lower, upper, step, ..
            }) => {
                for part in [lower, upper, step].into_iter().flatten() {
                    self.scan_expression(part, context)?;
                }
            }
            Expr::Generator(ExprGenerator {
                elt,
                generators,
                range,
                ..
            }) => {
                self.scan_comprehension(
                    ComprehensionKind::Generator,
                    elt,
                    None,
                    generators,
                    *range,
                )?;
            }
            Expr::ListComp(ExprListComp {
                elt,
                generators,
                range,
                ..
            }) => {
                self.scan_comprehension(ComprehensionKind::List, elt, None, generators, *range)?;
            }
            Expr::SetComp(ExprSetComp {
                elt,
                generators,
                range,
                ..
            }) => {
                self.scan_comprehension(ComprehensionKind::Set, elt, None, generators, *range)?;
            }
            Expr::DictComp(ExprDictComp {
                key,
                value,
                generators,
                range,
                ..
            }) => {
                self.scan_comprehension(
                    ComprehensionKind::Dict,
                    key,
                    Some(value),
                    generators,
                    *range,
                )?;
            }
            Expr::Call(ExprCall {
                func, arguments, ..
            }) => {
                self.scan_expression(func, ExpressionContext::Load)?;
                self.scan_expressions(&arguments.args, ExpressionContext::Load)?;
                for keyword in &arguments.keywords {
                    if let Some(arg) = &keyword.arg {
                        self.check_name(arg.as_str(), ExpressionContext::Store, keyword.range)?;
                    }
                    self.scan_expression(&keyword.value, ExpressionContext::Load)?;
                }
            }
            Expr::Name(ExprName { id, range, .. }) => {
                let id = id.as_str();
                self.check_name(id, context, *range)?;
                match context {
                    ExpressionContext::Load => {
                        self.register_name(id, SymbolUsage::Used, *range)?;
                    }
                    ExpressionContext::Store | ExpressionContext::Delete => {
                        self.register_name(id, SymbolUsage::Assigned, *range)?;
                    }
                }
                // a bare `super` needs the implicit __class__ cell
                if context == ExpressionContext::Load
                    && self.table().is_function_like()
                    && id == "super"
                {
                    self.register_name("__class__", SymbolUsage::Used, *range)?;
                }
            }
            Expr::Lambda(ExprLambda {
                body,
                parameters,
                range,
                ..
            }) => {
                if let Some(parameters) = parameters {
                    self.scan_defaults(parameters)?;
                }
                self.enter_scope(
                    "lambda",
                    CompilerScope::Lambda,
                    Some(*range),
                    self.line_index_start(*range),
                );
                if let Some(parameters) = parameters {
                    self.scan_parameters(parameters)?;
                }
                self.scan_expression(body, ExpressionContext::Load)?;
                self.leave_scope();
            }
            Expr::FString(ExprFString { value, .. }) => {
                for expr in value.elements().filter_map(|x| x.as_interpolation()) {
                    self.scan_expression(&expr.expression, ExpressionContext::Load)?;
                    if let Some(format_spec) = &expr.format_spec {
                        for element in format_spec.elements.interpolations() {
                            self.scan_expression(&element.expression, ExpressionContext::Load)?
                        }
                    }
                }
            }
            Expr::TString(tstring) => {
                for expr in tstring
                    .value
                    .elements()
                    .filter_map(|x| x.as_interpolation())
                {
                    self.scan_expression(&expr.expression, ExpressionContext::Load)?;
                    if let Some(format_spec) = &expr.format_spec {
                        for element in format_spec.elements.interpolations() {
                            self.scan_expression(&element.expression, ExpressionContext::Load)?
                        }
                    }
                }
            }
            // Constants
            Expr::StringLiteral(_)
            | Expr::BytesLiteral(_)
            | Expr::NumberLiteral(_)
            | Expr::BooleanLiteral(_)
            | Expr::NoneLiteral(_)
            | Expr::EllipsisLiteral(_) => {}
            Expr::IpyEscapeCommand(command) => {
                return Err(self.error("IPython escape commands are not supported", command.range));
            }
            Expr::If(ExprIf {
                test, body, orelse, ..
            }) => {
                self.scan_expression(test, ExpressionContext::Load)?;
                self.scan_expression(body, ExpressionContext::Load)?;
                self.scan_expression(orelse, ExpressionContext::Load)?;
            }
            Expr::Named(ExprNamed {
                target,
                value,
                range,
                ..
            }) => {
                self.check_expression_allowed("named expression", *range)?;
                if self.table().comp_iter_expr > 0 {
                    return Err(self.error(
                        "assignment expression cannot be used in a comprehension iterable expression",
                        target.range(),
                    ));
                }
                if self.table().comprehension.is_some()
                    && let Expr::Name(ExprName { id, range, .. }) = &**target
                {
                    self.extend_named_expr_scope(id.as_str(), *range)?;
                }
                self.scan_expression(value, ExpressionContext::Load)?;
                self.scan_expression(target, ExpressionContext::Store)?;
            }
        }
        Ok(())
    }

    fn mark_generator(&mut self, range: TextRange) -> SymbolTableResult {
        let table = self.table_mut();
        table.is_generator = true;
        if let Some(kind) = table.comprehension {
            let message = format!("'yield' inside {}", kind.describe());
            return Err(self.error(message, range));
        }
        Ok(())
    }

    /// The target of a walrus inside a comprehension binds in the nearest
    /// enclosing function or module scope.
    fn extend_named_expr_scope(&mut self, name: &str, range: TextRange) -> SymbolTableResult {
        let scopes: Vec<usize> = self
            .stack
            .iter()
            .copied()
            .chain(core::iter::once(self.current))
            .rev()
            .collect();
        for id in scopes {
            let table = &self.tables[id];
            if table.comprehension.is_some() {
                let flags = table
                    .symbols
                    .get(name)
                    .map_or(SymbolFlags::empty(), |s| s.flags);
                if flags.contains(SymbolFlags::COMP_ITER | SymbolFlags::ASSIGNED) {
                    return Err(self.error(
                        format!(
                            "assignment expression cannot rebind comprehension iteration variable '{name}'"
                        ),
                        range,
                    ));
                }
                continue;
            }
            match (table.typ, table.scope_info) {
                (CompilerScope::Function | CompilerScope::AsyncFunction | CompilerScope::Lambda, _) => {
                    let usage = if table
                        .symbols
                        .get(name)
                        .is_some_and(|s| s.flags.contains(SymbolFlags::GLOBAL))
                    {
                        SymbolUsage::Global
                    } else {
                        SymbolUsage::Nonlocal
                    };
                    self.register_name(name, usage, range)?;
                    self.record_directive(name, range);
                    return self.add_def(id, name, SymbolFlags::ASSIGNED, range);
                }
                (CompilerScope::Module, _) => {
                    self.register_name(name, SymbolUsage::Global, range)?;
                    self.record_directive(name, range);
                    return self.add_def(id, name, SymbolFlags::GLOBAL, range);
                }
                (CompilerScope::Class, _) => {
                    return Err(self.error(
                        "assignment expression within a comprehension cannot be used in a class body",
                        range,
                    ));
                }
                (CompilerScope::TypeParams, None) => {
                    return Err(self.error(
                        "assignment expression within a comprehension cannot be used within the definition of a generic",
                        range,
                    ));
                }
                (CompilerScope::TypeParams | CompilerScope::Annotation, Some(info)) => {
                    return Err(self.error(
                        format!(
                            "assignment expression within a comprehension cannot be used in {info}"
                        ),
                        range,
                    ));
                }
                _ => continue,
            }
        }
        Ok(())
    }

    fn record_directive(&mut self, name: &str, range: TextRange) {
        let mangled = self.mangle(name).into_owned();
        self.table_mut().directives.entry(mangled).or_insert(range);
    }

    fn scan_comprehension(
        &mut self,
        kind: ComprehensionKind,
        elt: &ast::Expr,
        value: Option<&ast::Expr>,
        generators: &[ast::Comprehension],
        range: TextRange,
    ) -> SymbolTableResult {
        let Some((outermost, rest)) = generators.split_first() else {
            return Err(self.error("comprehension without generators", range));
        };
        // The first iterable is evaluated in the enclosing scope.
        self.table_mut().comp_iter_expr += 1;
        let result = self.scan_expression(&outermost.iter, ExpressionContext::Load);
        self.table_mut().comp_iter_expr -= 1;
        result?;

        let scope_name = match kind {
            ComprehensionKind::List => "<listcomp>",
            ComprehensionKind::Set => "<setcomp>",
            ComprehensionKind::Dict => "<dictcomp>",
            ComprehensionKind::Generator => "<genexpr>",
        };
        self.enter_scope(
            scope_name,
            CompilerScope::Comprehension,
            Some(range),
            self.line_index_start(range),
        );
        self.table_mut().comprehension = Some(kind);
        if outermost.is_async {
            self.table_mut().is_coroutine = true;
        }

        // The outermost iterator is received as an argument.
        self.register_name(".0", SymbolUsage::Parameter, range)?;
        self.table_mut().comp_iter_target = true;
        self.scan_expression(&outermost.target, ExpressionContext::Store)?;
        self.table_mut().comp_iter_target = false;
        self.scan_expressions(&outermost.ifs, ExpressionContext::Load)?;

        for generator in rest {
            self.table_mut().comp_iter_target = true;
            self.scan_expression(&generator.target, ExpressionContext::Store)?;
            self.table_mut().comp_iter_target = false;
            self.table_mut().comp_iter_expr += 1;
            self.scan_expression(&generator.iter, ExpressionContext::Load)?;
            self.table_mut().comp_iter_expr -= 1;
            self.scan_expressions(&generator.ifs, ExpressionContext::Load)?;
            if generator.is_async {
                self.table_mut().is_coroutine = true;
            }
        }

        if let Some(value) = value {
            self.scan_expression(value, ExpressionContext::Load)?;
        }
        self.scan_expression(elt, ExpressionContext::Load)?;

        let is_generator = kind == ComprehensionKind::Generator;
        let table = self.table_mut();
        table.is_generator |= is_generator;
        let is_async = table.is_coroutine && !is_generator;
        self.leave_scope();

        if is_async {
            let outer = self.table();
            if outer.typ != CompilerScope::AsyncFunction && outer.comprehension.is_none() {
                return Err(self.error(
                    "asynchronous comprehension outside of an asynchronous function",
                    range,
                ));
            }
            self.table_mut().is_coroutine = true;
        }
        Ok(())
    }

    /// Scan a type parameter bound or default in its own lazily evaluated scope.
    fn scan_type_param_bound_or_default(
        &mut self,
        expr: &ast::Expr,
        name: &str,
        scope_info: &'static str,
    ) -> SymbolTableResult {
        let in_class = self.table().can_see_class_scope;
        let range = expr.range();
        self.enter_scope(
            name,
            CompilerScope::TypeParams,
            Some(range),
            self.line_index_start(range),
        );
        self.table_mut().can_see_class_scope = in_class;
        self.table_mut().scope_info = Some(scope_info);
        if in_class {
            self.register_name("__classdict__", SymbolUsage::Used, range)?;
        }
        let result = self.scan_expression(expr, ExpressionContext::Load);
        self.leave_scope();
        result
    }

    fn scan_type_params(&mut self, type_params: &ast::TypeParams) -> SymbolTableResult {
        let mut seen_names = HashSet::new();
        for type_param in &type_params.type_params {
            let (name, range) = match type_param {
                ast::TypeParam::TypeVar(tv) => (&tv.name, tv.range),
                ast::TypeParam::ParamSpec(ps) => (&ps.name, ps.range),
                ast::TypeParam::TypeVarTuple(tvt) => (&tvt.name, tvt.range),
            };
            if !seen_names.insert(name.as_str()) {
                return Err(self.error(format!("duplicate type parameter '{name}'"), range));
            }
            if name.as_str() == "__classdict__" {
                return Err(self.error(
                    "reserved name '__classdict__' cannot be used for type parameter",
                    range,
                ));
            }
            self.register_name(name.as_str(), SymbolUsage::TypeParam, range)?;

            match type_param {
                ast::TypeParam::TypeVar(ast::TypeParamTypeVar {
                    bound, default, ..
                }) => {
                    if let Some(bound) = bound {
                        let scope_info = if bound.is_tuple_expr() {
                            "a TypeVar constraint"
                        } else {
                            "a TypeVar bound"
                        };
                        self.scan_type_param_bound_or_default(bound, name.as_str(), scope_info)?;
                    }
                    if let Some(default) = default {
                        self.scan_type_param_bound_or_default(
                            default,
                            name.as_str(),
                            "a TypeVar default",
                        )?;
                    }
                }
                ast::TypeParam::ParamSpec(ast::TypeParamParamSpec { default, .. }) => {
                    if let Some(default) = default {
                        self.scan_type_param_bound_or_default(
                            default,
                            name.as_str(),
                            "a ParamSpec default",
                        )?;
                    }
                }
                ast::TypeParam::TypeVarTuple(ast::TypeParamTypeVarTuple { default, .. }) => {
                    if let Some(default) = default {
                        self.scan_type_param_bound_or_default(
                            default,
                            name.as_str(),
                            "a TypeVarTuple default",
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    fn scan_patterns(&mut self, patterns: &[ast::Pattern]) -> SymbolTableResult {
        for pattern in patterns {
            self.scan_pattern(pattern)?;
        }
        Ok(())
    }

    fn scan_pattern(&mut self, pattern: &ast::Pattern) -> SymbolTableResult {
        use ast::Pattern::*;
        match pattern {
            MatchValue(ast::PatternMatchValue { value, .. }) => {
                self.scan_expression(value, ExpressionContext::Load)?
            }
            MatchSingleton(_) => {}
            MatchSequence(ast::PatternMatchSequence { patterns, .. }) => {
                self.scan_patterns(patterns)?
            }
            MatchMapping(ast::PatternMatchMapping {
                keys,
                patterns,
                rest,
                ..
            }) => {
                self.scan_expressions(keys, ExpressionContext::Load)?;
                self.scan_patterns(patterns)?;
                if let Some(rest) = rest {
                    self.register_ident(rest, SymbolUsage::Assigned)?;
                }
            }
            MatchClass(ast::PatternMatchClass { cls, arguments, .. }) => {
                self.scan_expression(cls, ExpressionContext::Load)?;
                self.scan_patterns(&arguments.patterns)?;
                for kw in &arguments.keywords {
                    self.scan_pattern(&kw.pattern)?;
                }
            }
            MatchStar(ast::PatternMatchStar { name, .. }) => {
                if let Some(name) = name {
                    self.register_ident(name, SymbolUsage::Assigned)?;
                }
            }
            MatchAs(ast::PatternMatchAs { pattern, name, .. }) => {
                if let Some(pattern) = pattern {
                    self.scan_pattern(pattern)?;
                }
                if let Some(name) = name {
                    self.check_name(name.as_str(), ExpressionContext::Store, name.range)?;
                    self.register_ident(name, SymbolUsage::Assigned)?;
                }
            }
            MatchOr(ast::PatternMatchOr { patterns, .. }) => self.scan_patterns(patterns)?,
        }
        Ok(())
    }

    fn register_ident(&mut self, ident: &ast::Identifier, role: SymbolUsage) -> SymbolTableResult {
        self.register_name(ident.as_str(), role, ident.range)
    }

    fn check_name(
        &self,
        name: &str,
        context: ExpressionContext,
        range: TextRange,
    ) -> SymbolTableResult {
        if name == "__debug__" {
            match context {
                ExpressionContext::Store => {
                    return Err(self.error("cannot assign to __debug__", range));
                }
                ExpressionContext::Delete => {
                    return Err(self.error("cannot delete __debug__", range));
                }
                ExpressionContext::Load => {}
            }
        }
        Ok(())
    }

    fn mangle<'a>(&self, name: &'a str) -> Cow<'a, str> {
        self.table().mangle(self.class_name.as_deref(), name)
    }

    fn lookup_flags(&self, name: &str) -> SymbolFlags {
        let mangled = self.mangle(name);
        self.table()
            .symbols
            .get(mangled.as_ref())
            .map_or(SymbolFlags::empty(), |s| s.flags)
    }

    fn register_name(
        &mut self,
        name: &str,
        role: SymbolUsage,
        range: TextRange,
    ) -> SymbolTableResult {
        self.add_def(self.current, name, role.flags(), range)
    }

    /// Record `flags` for `name` in the scope `id`.
    fn add_def(
        &mut self,
        id: usize,
        name: &str,
        flags: SymbolFlags,
        range: TextRange,
    ) -> SymbolTableResult {
        if flags.contains(SymbolFlags::TYPE_PARAM)
            && let Some(names) = &mut self.tables[self.current].mangled_names
        {
            names.insert(name.to_owned());
        }
        let mangled = self.mangle(name).into_owned();
        let table = &self.tables[id];
        let old = table
            .symbols
            .get(&mangled)
            .map_or(SymbolFlags::empty(), |s| s.flags);

        if flags.contains(SymbolFlags::PARAMETER) && old.contains(SymbolFlags::PARAMETER) {
            return Err(self.error(
                format!("duplicate argument '{mangled}' in function definition"),
                range,
            ));
        }
        let mut new = old | flags;
        if table.comp_iter_target {
            if new.intersects(SymbolFlags::GLOBAL | SymbolFlags::NONLOCAL) {
                return Err(self.error(
                    format!(
                        "comprehension inner loop cannot rebind assignment expression target '{mangled}'"
                    ),
                    range,
                ));
            }
            new |= SymbolFlags::COMP_ITER;
        }

        let table = &mut self.tables[id];
        if flags.contains(SymbolFlags::PARAMETER) {
            table.varnames.push(mangled.clone());
        }
        table
            .symbols
            .entry(mangled)
            .or_insert_with_key(|name| Symbol::new(name))
            .flags = new;
        Ok(())
    }
}

// Analysis: resolve every symbol's scope across nested blocks.
impl SymbolTableBuilder {
    fn directive_error(&self, id: usize, name: &str, error: String) -> SymbolTableError {
        SymbolTableError {
            error,
            location: self.tables[id]
                .directives
                .get(name)
                .map(|range| self.location(*range)),
        }
    }

    fn analyze_block(
        &mut self,
        id: usize,
        mut bound: Option<NameSet>,
        free: &mut NameSet,
        mut global: NameSet,
        mut type_params: NameSet,
        class_entry: Option<usize>,
    ) -> SymbolTableResult {
        let is_class = self.tables[id].typ == CompilerScope::Class;
        let mut local = NameSet::new();
        let mut scopes: IndexMap<String, SymbolScope> = IndexMap::default();
        let mut newglobal = NameSet::new();
        let mut newfree = NameSet::new();
        let mut newbound = NameSet::new();
        let mut inlined_cells = NameSet::new();

        // Class bindings are not visible in methods, so the sets passed to
        // children are fixed before the class body's own names are analyzed.
        if is_class {
            newglobal.extend(global.iter().cloned());
            if let Some(bound) = &bound {
                newbound.extend(bound.iter().cloned());
            }
        }

        let symbols: Vec<(String, SymbolFlags)> = self.tables[id]
            .symbols
            .values()
            .map(|s| (s.name.clone(), s.flags))
            .collect();
        for (name, flags) in symbols {
            let scope = self.analyze_name(
                id,
                &name,
                flags,
                bound.as_mut(),
                &mut local,
                free,
                &mut global,
                &mut type_params,
                class_entry,
            )?;
            scopes.insert(name, scope);
        }

        if is_class {
            newbound.insert("__class__".to_owned());
            newbound.insert("__classdict__".to_owned());
        } else {
            if self.tables[id].is_function_like() {
                newbound.extend(local.iter().cloned());
            }
            if let Some(bound) = &bound {
                newbound.extend(bound.iter().cloned());
            }
            newglobal.extend(global.iter().cloned());
        }

        let can_see_class_scope = self.tables[id].can_see_class_scope;
        let children = self.tables[id].children.clone();
        for child in children {
            let child_table = &self.tables[child];
            let new_class_entry = if child_table.can_see_class_scope {
                if is_class { Some(id) } else { class_entry }
            } else {
                None
            };
            let inline_comp = child_table.comprehension.is_some()
                && !child_table.is_generator
                && !can_see_class_scope;

            let mut child_free = newfree.clone();
            self.analyze_block(
                child,
                Some(newbound.clone()),
                &mut child_free,
                newglobal.clone(),
                type_params.clone(),
                new_class_entry,
            )?;
            if inline_comp {
                self.inline_comprehension(
                    id,
                    child,
                    &mut scopes,
                    &mut child_free,
                    &mut inlined_cells,
                );
                self.tables[child].comp_inlined = true;
                debug!(
                    "inlining {} into {:?}",
                    self.tables[child].name, self.tables[id].name
                );
            }
            newfree.extend(child_free);
        }

        if self.tables[id].is_function_like() {
            analyze_cells(&mut scopes, &mut newfree, &inlined_cells);
        } else if is_class {
            let table = &mut self.tables[id];
            if newfree.remove("__class__") {
                table.needs_class_closure = true;
            }
            if newfree.remove("__classdict__") {
                table.needs_classdict = true;
            }
        }

        let classflag = is_class || can_see_class_scope;
        update_symbols(
            &mut self.tables[id].symbols,
            &scopes,
            bound.as_ref(),
            &newfree,
            &inlined_cells,
            classflag,
        );
        free.extend(newfree);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn analyze_name(
        &self,
        id: usize,
        name: &str,
        flags: SymbolFlags,
        bound: Option<&mut NameSet>,
        local: &mut NameSet,
        free: &mut NameSet,
        global: &mut NameSet,
        type_params: &mut NameSet,
        class_entry: Option<usize>,
    ) -> SymbolTableResult<SymbolScope> {
        if flags.contains(SymbolFlags::GLOBAL) {
            if flags.contains(SymbolFlags::NONLOCAL) {
                return Err(self.directive_error(
                    id,
                    name,
                    format!("name '{name}' is nonlocal and global"),
                ));
            }
            global.insert(name.to_owned());
            if let Some(bound) = bound {
                bound.remove(name);
            }
            return Ok(SymbolScope::GlobalExplicit);
        }
        if flags.contains(SymbolFlags::NONLOCAL) {
            let Some(bound) = bound else {
                return Err(self.directive_error(
                    id,
                    name,
                    "nonlocal declaration not allowed at module level".to_owned(),
                ));
            };
            if !bound.contains(name) {
                return Err(self.directive_error(
                    id,
                    name,
                    format!("no binding for nonlocal '{name}' found"),
                ));
            }
            if type_params.contains(name) {
                return Err(self.directive_error(
                    id,
                    name,
                    format!("nonlocal binding not allowed for type parameter '{name}'"),
                ));
            }
            free.insert(name.to_owned());
            return Ok(SymbolScope::Free);
        }
        if flags.intersects(SymbolFlags::BOUND) {
            local.insert(name.to_owned());
            global.remove(name);
            if flags.contains(SymbolFlags::TYPE_PARAM) {
                type_params.insert(name.to_owned());
            } else {
                type_params.remove(name);
            }
            return Ok(SymbolScope::Local);
        }
        // A name bound by the class namespace that this scope can see is
        // looked up there at runtime rather than in an outer function.
        if let Some(class_entry) = class_entry {
            let class_flags = self.tables[class_entry]
                .symbols
                .get(name)
                .map_or(SymbolFlags::empty(), |s| s.flags);
            if class_flags.contains(SymbolFlags::GLOBAL) {
                return Ok(SymbolScope::GlobalExplicit);
            }
            if class_flags.intersects(SymbolFlags::BOUND)
                && !class_flags.contains(SymbolFlags::NONLOCAL)
            {
                return Ok(SymbolScope::GlobalImplicit);
            }
        }
        if let Some(bound) = bound
            && bound.contains(name)
        {
            free.insert(name.to_owned());
            return Ok(SymbolScope::Free);
        }
        Ok(SymbolScope::GlobalImplicit)
    }

    /// Merge the symbols of an inlined comprehension into its parent.
    fn inline_comprehension(
        &mut self,
        parent: usize,
        comp: usize,
        scopes: &mut IndexMap<String, SymbolScope>,
        comp_free: &mut NameSet,
        inlined_cells: &mut NameSet,
    ) {
        let parent_is_class = self.tables[parent].typ == CompilerScope::Class;
        let mut remove_dunder_class = false;
        let comp_symbols: Vec<Symbol> = self.tables[comp].symbols.values().cloned().collect();
        for symbol in comp_symbols {
            if symbol.flags.contains(SymbolFlags::PARAMETER) {
                continue;
            }
            let mut scope = symbol.scope;
            if scope == SymbolScope::Cell || symbol.flags.contains(SymbolFlags::COMP_CELL) {
                inlined_cells.insert(symbol.name.clone());
            }
            // __class__ can never be free through a class scope
            if scope == SymbolScope::Free && parent_is_class && symbol.name == "__class__" {
                scope = SymbolScope::GlobalImplicit;
                comp_free.remove(&symbol.name);
                remove_dunder_class = true;
            }
            match self.tables[parent].symbols.get(&symbol.name) {
                None => {
                    let mut copied = Symbol::new(&symbol.name);
                    copied.flags = symbol.flags;
                    self.tables[parent]
                        .symbols
                        .insert(symbol.name.clone(), copied);
                    scopes.insert(symbol.name, scope);
                }
                Some(existing) => {
                    // free in the comprehension but local outside: now simply local
                    if existing.flags.intersects(SymbolFlags::BOUND)
                        && !parent_is_class
                        && !self.is_free_in_any_child(comp, &symbol.name)
                    {
                        comp_free.remove(&symbol.name);
                    }
                }
            }
        }
        if remove_dunder_class {
            self.tables[comp].symbols.shift_remove("__class__");
        }
    }

    fn is_free_in_any_child(&self, id: usize, name: &str) -> bool {
        self.tables[id].children.iter().any(|&child| {
            let table = &self.tables[child];
            if table.comp_inlined {
                return self.is_free_in_any_child(child, name);
            }
            table
                .symbols
                .get(name)
                .is_some_and(|s| s.scope == SymbolScope::Free)
        })
    }
}

/// Locals that a nested scope captures become cells.
fn analyze_cells(
    scopes: &mut IndexMap<String, SymbolScope>,
    free: &mut NameSet,
    inlined_cells: &NameSet,
) {
    for (name, scope) in scopes.iter_mut() {
        if *scope != SymbolScope::Local {
            continue;
        }
        if free.contains(name) || inlined_cells.contains(name) {
            *scope = SymbolScope::Cell;
            free.remove(name);
        }
    }
}

fn update_symbols(
    symbols: &mut IndexMap<String, Symbol>,
    scopes: &IndexMap<String, SymbolScope>,
    bound: Option<&NameSet>,
    free: &NameSet,
    inlined_cells: &NameSet,
    classflag: bool,
) {
    for symbol in symbols.values_mut() {
        if inlined_cells.contains(&symbol.name) {
            symbol.flags.insert(SymbolFlags::COMP_CELL);
        }
        if let Some(scope) = scopes.get(&symbol.name) {
            symbol.scope = *scope;
        }
    }

    // Free variables of children that this scope does not resolve.
    let mut free: Vec<&String> = free.iter().collect();
    free.sort();
    for name in free {
        if let Some(symbol) = symbols.get_mut(name) {
            // a method's free variable that the class body also names
            if classflag {
                symbol.flags.insert(SymbolFlags::FREE_CLASS);
            }
            continue;
        }
        if let Some(bound) = bound
            && !bound.contains(name)
        {
            // global
            continue;
        }
        let mut symbol = Symbol::new(name);
        symbol.scope = SymbolScope::Free;
        symbols.insert(name.clone(), symbol);
    }
}

pub(crate) fn mangle_name<'a>(class_name: Option<&str>, name: &'a str) -> Cow<'a, str> {
    let class_name = match class_name {
        Some(n) => n,
        None => return name.into(),
    };
    if !name.starts_with("__") || name.ends_with("__") || name.contains('.') {
        return name.into();
    }
    // strip leading underscore
    let class_name = class_name.trim_start_matches('_');
    if class_name.is_empty() {
        return name.into();
    }
    let mut ret = String::with_capacity(1 + class_name.len() + name.len());
    ret.push('_');
    ret.push_str(class_name);
    ret.push_str(name);
    ret.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pylower_compiler_core::SourceFileBuilder;
    use ruff_python_parser::parse_module;

    fn scan(source: &str) -> SymbolTableResult<SymbolTableArena> {
        let parsed = parse_module(source).unwrap();
        let source_file = SourceFileBuilder::new("<test>", source).finish();
        SymbolTable::scan_program(parsed.syntax(), source_file)
    }

    fn scope_of(arena: &SymbolTableArena, table: &str, name: &str) -> SymbolScope {
        let table = arena
            .iter()
            .find(|t| t.name == table)
            .unwrap_or_else(|| panic!("no table {table}"));
        table
            .lookup(name)
            .unwrap_or_else(|| panic!("no symbol {name} in {}", table.name))
            .scope
    }

    fn child<'a>(arena: &'a SymbolTableArena, parent: &SymbolTable, name: &str) -> &'a SymbolTable {
        parent
            .children
            .iter()
            .map(|&id| &arena[id])
            .find(|t| t.name == name)
            .unwrap()
    }

    #[test]
    fn closure_variable_is_cell_and_free() {
        let arena = scan("def f():\n    x = 1\n    def g():\n        return x\n").unwrap();
        assert_eq!(scope_of(&arena, "f", "x"), SymbolScope::Cell);
        assert_eq!(scope_of(&arena, "g", "x"), SymbolScope::Free);
        assert_eq!(scope_of(&arena, "top", "f"), SymbolScope::Local);
        let g = arena.iter().find(|t| t.name == "g").unwrap();
        assert!(g.is_nested);
    }

    #[test]
    fn globals() {
        let arena = scan("def f():\n    global y\n    y = 1\n    return z\n").unwrap();
        assert_eq!(scope_of(&arena, "f", "y"), SymbolScope::GlobalExplicit);
        assert_eq!(scope_of(&arena, "f", "z"), SymbolScope::GlobalImplicit);
    }

    #[test]
    fn nonlocal_resolves_to_enclosing_function() {
        let arena =
            scan("def f():\n    x = 0\n    def g():\n        nonlocal x\n        x = 1\n").unwrap();
        assert_eq!(scope_of(&arena, "f", "x"), SymbolScope::Cell);
        assert_eq!(scope_of(&arena, "g", "x"), SymbolScope::Free);
    }

    #[test]
    fn nonlocal_errors() {
        let err = scan("nonlocal x\n").unwrap_err();
        assert_eq!(err.error, "nonlocal declaration not allowed at module level");
        let err = scan("def f():\n    nonlocal x\n").unwrap_err();
        assert_eq!(err.error, "no binding for nonlocal 'x' found");
        let err = scan("def f(x):\n    global x\n").unwrap_err();
        assert_eq!(err.error, "name 'x' is parameter and global");
        let err = scan("def f():\n    print(x)\n    global x\n").unwrap_err();
        assert_eq!(err.error, "name 'x' is used prior to global declaration");
    }

    #[test]
    fn duplicate_argument() {
        let err = scan("def f(a, a): pass\n").unwrap_err();
        assert_eq!(err.error, "duplicate argument 'a' in function definition");
    }

    #[test]
    fn import_star_outside_module() {
        let err = scan("def f():\n    from os import *\n").unwrap_err();
        assert_eq!(err.error, "import * only allowed at module level");
    }

    #[test]
    fn list_comprehension_is_inlined() {
        let arena = scan("[x for x in y]\n").unwrap();
        let comp = child(&arena, arena.root(), "<listcomp>");
        assert!(comp.comp_inlined);
        assert_eq!(comp.varnames, [".0"]);
        // the iteration variable is hoisted into the module
        assert_eq!(scope_of(&arena, "top", "x"), SymbolScope::Local);
        assert_eq!(scope_of(&arena, "top", "y"), SymbolScope::GlobalImplicit);
    }

    #[test]
    fn generator_expression_is_not_inlined() {
        let arena = scan("g = (x for x in y)\n").unwrap();
        let comp = child(&arena, arena.root(), "<genexpr>");
        assert!(!comp.comp_inlined);
        assert!(comp.is_generator);
        assert!(arena.root().lookup("x").is_none());
    }

    #[test]
    fn walrus_in_comprehension_binds_in_function() {
        let arena = scan("def f(z):\n    [(y := v) for v in z]\n    return y\n").unwrap();
        assert_eq!(scope_of(&arena, "f", "y"), SymbolScope::Local);
        assert_eq!(scope_of(&arena, "<listcomp>", "y"), SymbolScope::Free);
    }

    #[test]
    fn walrus_cannot_rebind_iteration_variable() {
        let err = scan("[(x := 1) for x in y]\n").unwrap_err();
        assert_eq!(
            err.error,
            "assignment expression cannot rebind comprehension iteration variable 'x'"
        );
    }

    #[test]
    fn walrus_in_class_comprehension() {
        let err = scan("class C:\n    [(y := 1) for x in z]\n").unwrap_err();
        assert_eq!(
            err.error,
            "assignment expression within a comprehension cannot be used in a class body"
        );
    }

    #[test]
    fn yield_inside_comprehension() {
        let err = scan("def f():\n    [(yield x) for x in y]\n").unwrap_err();
        assert_eq!(err.error, "'yield' inside list comprehension");
    }

    #[test]
    fn super_creates_class_cell() {
        let source = "class A:\n    def f(self):\n        return super().f()\n";
        let arena = scan(source).unwrap();
        let class = child(&arena, arena.root(), "A");
        assert!(class.needs_class_closure);
        assert_eq!(scope_of(&arena, "f", "__class__"), SymbolScope::Free);
        let method = child(&arena, class, "f");
        assert!(method.is_method);
    }

    #[test]
    fn class_names_are_not_visible_in_methods() {
        let source = "def outer():\n    x = 1\n    class A:\n        x = 2\n        def f(self):\n            return x\n";
        let arena = scan(source).unwrap();
        assert_eq!(scope_of(&arena, "f", "x"), SymbolScope::Free);
        assert_eq!(scope_of(&arena, "outer", "x"), SymbolScope::Cell);
        let class = arena.iter().find(|t| t.name == "A").unwrap();
        let symbol = class.lookup("x").unwrap();
        assert_eq!(symbol.scope, SymbolScope::Local);
        assert!(symbol.flags.contains(SymbolFlags::FREE_CLASS));
    }

    #[test]
    fn private_names_are_mangled() {
        let arena = scan("class A:\n    __x = 1\n    __y__ = 2\n").unwrap();
        let class = child(&arena, arena.root(), "A");
        assert!(class.lookup("_A__x").is_some());
        assert!(class.lookup("__y__").is_some());
    }

    #[test]
    fn module_annotations_get_a_scope() {
        let arena = scan("x: int = 1\n").unwrap();
        let root = arena.root();
        assert!(root.annotations_used);
        let block = &arena[root.annotation_block.unwrap()];
        assert_eq!(block.typ, CompilerScope::Annotation);
        assert_eq!(block.varnames, [".format"]);
        assert_eq!(scope_of(&arena, "__annotate__", "int"), SymbolScope::GlobalImplicit);
    }

    #[test]
    fn future_annotations_are_not_scanned() {
        let arena = scan("from __future__ import annotations\nx: Undefined\n").unwrap();
        assert!(arena.future_annotations);
        assert!(arena.root().annotations_used);
        assert!(arena.root().annotation_block.is_none());
    }

    #[test]
    fn type_params_become_cells() {
        let source = "def f[T](x: T) -> T:\n    return x\n";
        let parsed = parse_module(source).unwrap();
        let ast::Stmt::FunctionDef(def) = &parsed.syntax().body[0] else {
            panic!("expected a function");
        };
        let source_file = SourceFileBuilder::new("<test>", source).finish();
        let arena = SymbolTable::scan_program(parsed.syntax(), source_file).unwrap();

        let type_params = def.type_params.as_ref().unwrap();
        let block = &arena[arena
            .find(CompilerScope::TypeParams, type_params.range)
            .unwrap()];
        assert_eq!(block.lookup("T").unwrap().scope, SymbolScope::Cell);

        let annotations = &arena[arena
            .find(CompilerScope::Annotation, def.parameters.range)
            .unwrap()];
        assert!(annotations.annotations_used);
        assert_eq!(annotations.lookup("T").unwrap().scope, SymbolScope::Free);
        assert!(arena.find(CompilerScope::Function, def.range).is_some());
    }

    #[test]
    fn async_comprehension_outside_async_function() {
        let err = scan("def f():\n    [x async for x in y]\n").unwrap_err();
        assert_eq!(
            err.error,
            "asynchronous comprehension outside of an asynchronous function"
        );
        assert!(scan("async def f():\n    [x async for x in y]\n").is_ok());
    }

    #[test]
    fn debug_is_not_assignable() {
        let err = scan("__debug__ = 1\n").unwrap_err();
        assert_eq!(err.error, "cannot assign to __debug__");
    }

    #[test]
    fn yield_in_annotation() {
        let err = scan("def f():\n    def g(x: (yield)): pass\n").unwrap_err();
        assert_eq!(err.error, "yield expression cannot be used within an annotation");
    }

    #[test]
    fn mangle() {
        assert_eq!(mangle_name(Some("_Foo"), "__bar"), "_Foo__bar");
        assert_eq!(mangle_name(Some("Foo"), "__bar__"), "__bar__");
        assert_eq!(mangle_name(Some("___"), "__bar"), "__bar");
        assert_eq!(mangle_name(None, "__bar"), "__bar");
    }
}
