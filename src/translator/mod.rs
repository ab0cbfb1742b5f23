//! AST to bytecode translation.
//!
//! One pass over the tree. A block's functions are registered before any of
//! their bodies is translated, so functions of one block may call each other
//! (and themselves) regardless of declaration order. Every expression
//! leaves exactly one value on the stack, except calls to `void` functions
//! which leave none; the translator tracks the type of that value and
//! inserts conversions where the operand types differ.

use tracing::debug;

use crate::ast::*;
use crate::bytecode::{CodeBuilder, Label, LabelError, Opcode};
use crate::program::{
    BytecodeFunction, CompiledProgram, NativeFunction, NativeSignature, StringPool, TOP_FUNCTION_ID,
    TopVariable,
};
use crate::vm::native::{self, DynamicResolver, NativeError, SymbolResolver};

pub mod scope;
use scope::{Scopes, VarLocation};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TranslateErrorKind {
    #[error("undefined variable '{0}'")]
    UnresolvedVariable(String),
    #[error("undefined function '{0}'")]
    UnresolvedFunction(String),
    #[error("function '{function}' takes {expected} argument(s), got {got}")]
    ArityMismatch { function: String, expected: usize, got: usize },
    #[error("{context}: expected {expected}, found {found}")]
    IncompatibleType { context: &'static str, expected: VarType, found: VarType },
    #[error("operator '{op}' cannot be applied to {ty}")]
    InvalidOperand { op: &'static str, ty: VarType },
    #[error("void value used in an expression")]
    VoidValue,
    #[error("variable '{0}' declared with type void")]
    VoidVariable(String),
    #[error("function '{0}' is already defined in this scope")]
    DuplicateFunction(String),
    #[error("variable '{0}' is already declared in this scope")]
    DuplicateVariable(String),
    #[error("for loop variable '{0}' must be int")]
    ForVariableNotInt(String),
    #[error("function '{function}' must return a {ty} value")]
    MissingReturnValue { function: String, ty: VarType },
    #[error("void function '{0}' cannot return a value")]
    ReturnValueFromVoid(String),
    #[error("native '{0}' must be the only statement of a function body")]
    MisplacedNative(String),
    #[error(transparent)]
    Native(#[from] NativeError),
    #[error("too many functions (limit {})", u16::MAX)]
    TooManyFunctions,
    #[error("function '{0}' has too many local variables (limit {max})", max = u16::MAX)]
    TooManyLocals(String),
    #[error("too many string constants (limit {})", u16::MAX)]
    TooManyStrings,
    #[error("internal label error: {0}")]
    Label(#[from] LabelError),
}

impl TranslateErrorKind {
    /// Stable diagnostic code, explained by `mathvm --explain`.
    pub fn code(&self) -> &'static str {
        match self {
            TranslateErrorKind::UnresolvedVariable(_) => "MVM-T001",
            TranslateErrorKind::UnresolvedFunction(_) => "MVM-T002",
            TranslateErrorKind::ArityMismatch { .. } => "MVM-T003",
            TranslateErrorKind::IncompatibleType { .. } => "MVM-T004",
            TranslateErrorKind::InvalidOperand { .. } => "MVM-T005",
            TranslateErrorKind::VoidValue | TranslateErrorKind::VoidVariable(_) => "MVM-T006",
            TranslateErrorKind::DuplicateFunction(_) | TranslateErrorKind::DuplicateVariable(_) => "MVM-T007",
            TranslateErrorKind::ForVariableNotInt(_) => "MVM-T008",
            TranslateErrorKind::MissingReturnValue { .. } | TranslateErrorKind::ReturnValueFromVoid(_) => {
                "MVM-T009"
            }
            TranslateErrorKind::MisplacedNative(_) | TranslateErrorKind::Native(_) => "MVM-T010",
            TranslateErrorKind::TooManyFunctions
            | TranslateErrorKind::TooManyLocals(_)
            | TranslateErrorKind::TooManyStrings => "MVM-T011",
            TranslateErrorKind::Label(_) => "MVM-T012",
        }
    }
}

/// A translation failure and the span of the node that caused it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}")]
pub struct TranslateError {
    pub kind: TranslateErrorKind,
    pub span: Span,
}

impl TranslateError {
    pub fn new(kind: TranslateErrorKind, span: Span) -> Self {
        TranslateError { kind, span }
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }
}

type TResult<T> = Result<T, TranslateError>;

fn err<T>(kind: TranslateErrorKind, span: Span) -> TResult<T> {
    Err(TranslateError::new(kind, span))
}

// ── Entry points ─────────────────────────────────────────────────────

/// Translates with the default `dlsym` symbol resolver.
pub fn translate(program: &Program) -> Result<CompiledProgram, TranslateError> {
    Translator::new().translate(program)
}

pub struct Translator {
    resolver: Box<dyn SymbolResolver>,
}

impl Default for Translator {
    fn default() -> Self {
        Self::new()
    }
}

impl Translator {
    pub fn new() -> Self {
        Translator { resolver: Box::new(DynamicResolver) }
    }

    /// Uses `resolver` to look up the symbols of native functions.
    pub fn with_resolver(resolver: impl SymbolResolver + 'static) -> Self {
        Translator { resolver: Box::new(resolver) }
    }

    pub fn translate(&self, program: &Program) -> Result<CompiledProgram, TranslateError> {
        let mut translation = Translation::new(self.resolver.as_ref());
        let top = &program.top;
        let id = translation.register(top)?;
        translation.translate_function(top, id)?;
        Ok(CompiledProgram {
            functions: translation.functions,
            strings: translation.strings,
            natives: translation.natives,
            top_variables: translation.top_variables,
        })
    }
}

// ── Per-variable opcode tables ───────────────────────────────────────

struct SlotOps {
    load_compact: [Opcode; 4],
    store_compact: [Opcode; 4],
    load: Opcode,
    store: Opcode,
    load_ctx: Opcode,
    store_ctx: Opcode,
}

static INT_OPS: SlotOps = SlotOps {
    load_compact: [Opcode::LoadIVar0, Opcode::LoadIVar1, Opcode::LoadIVar2, Opcode::LoadIVar3],
    store_compact: [Opcode::StoreIVar0, Opcode::StoreIVar1, Opcode::StoreIVar2, Opcode::StoreIVar3],
    load: Opcode::LoadIVar,
    store: Opcode::StoreIVar,
    load_ctx: Opcode::LoadCtxIVar,
    store_ctx: Opcode::StoreCtxIVar,
};

static DOUBLE_OPS: SlotOps = SlotOps {
    load_compact: [Opcode::LoadDVar0, Opcode::LoadDVar1, Opcode::LoadDVar2, Opcode::LoadDVar3],
    store_compact: [Opcode::StoreDVar0, Opcode::StoreDVar1, Opcode::StoreDVar2, Opcode::StoreDVar3],
    load: Opcode::LoadDVar,
    store: Opcode::StoreDVar,
    load_ctx: Opcode::LoadCtxDVar,
    store_ctx: Opcode::StoreCtxDVar,
};

static STRING_OPS: SlotOps = SlotOps {
    load_compact: [Opcode::LoadSVar0, Opcode::LoadSVar1, Opcode::LoadSVar2, Opcode::LoadSVar3],
    store_compact: [Opcode::StoreSVar0, Opcode::StoreSVar1, Opcode::StoreSVar2, Opcode::StoreSVar3],
    load: Opcode::LoadSVar,
    store: Opcode::StoreSVar,
    load_ctx: Opcode::LoadCtxSVar,
    store_ctx: Opcode::StoreCtxSVar,
};

fn slot_ops(ty: VarType) -> Option<&'static SlotOps> {
    match ty {
        VarType::Int => Some(&INT_OPS),
        VarType::Double => Some(&DOUBLE_OPS),
        VarType::String => Some(&STRING_OPS),
        VarType::Void => None,
    }
}

// ── Translation state ────────────────────────────────────────────────

/// Code and slot layout of the function currently being emitted.
struct FunctionState {
    id: u16,
    code: CodeBuilder,
    local_types: Vec<VarType>,
}

impl FunctionState {
    fn new(id: u16) -> Self {
        FunctionState { id, code: CodeBuilder::new(), local_types: Vec::new() }
    }
}

struct Translation<'r> {
    resolver: &'r dyn SymbolResolver,
    /// Indexed by id. Bodies are filled in once translated.
    functions: Vec<BytecodeFunction>,
    strings: StringPool,
    natives: Vec<NativeFunction>,
    top_variables: Vec<TopVariable>,
    scopes: Scopes,
    current: FunctionState,
}

impl<'r> Translation<'r> {
    fn new(resolver: &'r dyn SymbolResolver) -> Self {
        Translation {
            resolver,
            functions: Vec::new(),
            strings: StringPool::new(),
            natives: Vec::new(),
            top_variables: Vec::new(),
            scopes: Scopes::new(),
            current: FunctionState::new(TOP_FUNCTION_ID),
        }
    }

    fn register(&mut self, decl: &FunctionDecl) -> TResult<u16> {
        let id = u16::try_from(self.functions.len())
            .map_err(|_| TranslateError::new(TranslateErrorKind::TooManyFunctions, decl.span))?;
        self.functions.push(BytecodeFunction {
            id,
            name: decl.name.clone(),
            params: decl.params.iter().map(|p| p.ty).collect(),
            return_type: decl.return_type,
            local_types: Vec::new(),
            bytecode: Default::default(),
        });
        debug!(function = %decl.name, id, "registered function");
        Ok(id)
    }

    fn translate_function(&mut self, decl: &FunctionDecl, id: u16) -> TResult<()> {
        let outer = std::mem::replace(&mut self.current, FunctionState::new(id));
        self.scopes.push(id);
        for param in &decl.params {
            self.declare_var(&param.name, param.ty, decl.span)?;
        }

        if let Some(symbol) = decl.native_symbol() {
            self.native_stub(decl, symbol)?;
        } else {
            self.enter_block(&decl.body, decl.span)?;
            if id == TOP_FUNCTION_ID {
                self.record_top_variables(&decl.body);
            }
            for stmt in &decl.body.statements {
                self.stmt(stmt, decl)?;
            }
            self.scopes.pop();

            let ends_with_return =
                matches!(decl.body.statements.last().map(|s| &s.node), Some(StmtKind::Return(_)));
            if id == TOP_FUNCTION_ID {
                self.emit(Opcode::Stop);
            } else if !ends_with_return {
                match decl.return_type {
                    VarType::Void => {}
                    VarType::Int => self.emit(Opcode::ILoad0),
                    VarType::Double => self.emit(Opcode::DLoad0),
                    VarType::String => self.emit(Opcode::SLoad0),
                }
                self.emit(Opcode::Return);
            }
        }
        self.scopes.pop();

        let state = std::mem::replace(&mut self.current, outer);
        let bytecode = state.code.finish().map_err(|e| TranslateError::new(e.into(), decl.span))?;
        debug!(function = %decl.name, id, bytes = bytecode.len(), locals = state.local_types.len(), "translated function");
        let function = &mut self.functions[id as usize];
        function.bytecode = bytecode;
        function.local_types = state.local_types;
        Ok(())
    }

    fn record_top_variables(&mut self, body: &Block) {
        for var in &body.variables {
            if let Some(loc) = self.scopes.lookup_var(&var.name) {
                self.top_variables.push(TopVariable { name: var.name.clone(), slot: loc.slot, ty: loc.ty });
            }
        }
    }

    /// `load params; CALLNATIVE id; RETURN`
    fn native_stub(&mut self, decl: &FunctionDecl, symbol: &str) -> TResult<()> {
        let span = decl.span;
        let signature = NativeSignature {
            return_type: decl.return_type,
            params: decl.params.iter().map(|p| p.ty).collect(),
        };
        native::check_signature(symbol, &signature).map_err(|e| TranslateError::new(e.into(), span))?;
        let address = self
            .resolver
            .resolve(symbol)
            .ok_or_else(|| TranslateError::new(NativeError::Unresolved(symbol.to_string()).into(), span))?;
        let native_id = u16::try_from(self.natives.len())
            .map_err(|_| TranslateError::new(TranslateErrorKind::TooManyFunctions, span))?;
        debug!(symbol, address = format_args!("{address:#x}"), native_id, "resolved native");
        self.natives.push(NativeFunction { name: symbol.to_string(), signature, address });

        for (slot, param) in decl.params.iter().enumerate() {
            let loc = VarLocation { function: self.current.id, slot: slot as u16, ty: param.ty };
            self.load(loc, span)?;
        }
        self.emit(Opcode::CallNative);
        self.current.code.add_uint16(native_id);
        self.emit(Opcode::Return);
        Ok(())
    }

    /// Opens a scope for `block`, allocates its variables and translates its functions.
    fn enter_block(&mut self, block: &Block, span: Span) -> TResult<()> {
        self.scopes.push(self.current.id);
        for var in &block.variables {
            self.declare_var(&var.name, var.ty, span)?;
        }
        let mut ids = Vec::with_capacity(block.functions.len());
        for function in &block.functions {
            let id = self.register(function)?;
            if !self.scopes.declare_function(&function.name, id) {
                return err(TranslateErrorKind::DuplicateFunction(function.name.clone()), function.span);
            }
            ids.push(id);
        }
        for (function, id) in block.functions.iter().zip(ids) {
            self.translate_function(function, id)?;
        }
        Ok(())
    }

    fn block(&mut self, block: &Block, span: Span, decl: &FunctionDecl) -> TResult<()> {
        self.enter_block(block, span)?;
        for stmt in &block.statements {
            self.stmt(stmt, decl)?;
        }
        self.scopes.pop();
        Ok(())
    }

    fn declare_var(&mut self, name: &str, ty: VarType, span: Span) -> TResult<u16> {
        if ty == VarType::Void {
            return err(TranslateErrorKind::VoidVariable(name.to_string()), span);
        }
        let slot = self.alloc_slot(ty, span)?;
        if !self.scopes.declare_var(name, slot, ty) {
            return err(TranslateErrorKind::DuplicateVariable(name.to_string()), span);
        }
        Ok(slot)
    }

    fn alloc_slot(&mut self, ty: VarType, span: Span) -> TResult<u16> {
        let slot = u16::try_from(self.current.local_types.len()).map_err(|_| {
            let name = self.functions[self.current.id as usize].name.clone();
            TranslateError::new(TranslateErrorKind::TooManyLocals(name), span)
        })?;
        self.current.local_types.push(ty);
        Ok(slot)
    }

    // ── Emission helpers ─────────────────────────────────────────────

    fn emit(&mut self, op: Opcode) {
        self.current.code.add_insn(op);
    }

    fn branch(&mut self, op: Opcode, label: Label, span: Span) -> TResult<()> {
        self.current.code.add_branch(op, label).map_err(|e| TranslateError::new(e.into(), span))
    }

    fn bind(&mut self, label: Label, span: Span) -> TResult<()> {
        self.current.code.bind(label).map_err(|e| TranslateError::new(e.into(), span))
    }

    fn lookup(&self, name: &str, span: Span) -> TResult<VarLocation> {
        self.scopes
            .lookup_var(name)
            .ok_or_else(|| TranslateError::new(TranslateErrorKind::UnresolvedVariable(name.to_string()), span))
    }

    fn load(&mut self, loc: VarLocation, span: Span) -> TResult<()> {
        let ops = slot_ops(loc.ty).ok_or_else(|| TranslateError::new(TranslateErrorKind::VoidValue, span))?;
        self.access(loc, ops.load_compact, ops.load, ops.load_ctx);
        Ok(())
    }

    fn store(&mut self, loc: VarLocation, span: Span) -> TResult<()> {
        let ops = slot_ops(loc.ty).ok_or_else(|| TranslateError::new(TranslateErrorKind::VoidValue, span))?;
        self.access(loc, ops.store_compact, ops.store, ops.store_ctx);
        Ok(())
    }

    fn access(&mut self, loc: VarLocation, compact: [Opcode; 4], wide: Opcode, ctx: Opcode) {
        let code = &mut self.current.code;
        if loc.function != self.current.id {
            code.add_insn(ctx);
            code.add_uint16(loc.function);
            code.add_uint16(loc.slot);
        } else if let Some(&op) = compact.get(loc.slot as usize) {
            code.add_insn(op);
        } else {
            code.add_insn(wide);
            code.add_uint16(loc.slot);
        }
    }

    /// Converts the value on top of the stack from `from` to `to`.
    fn coerce(&mut self, from: VarType, to: VarType, context: &'static str, span: Span) -> TResult<()> {
        match (from, to) {
            _ if from == to => Ok(()),
            (VarType::Void, _) => err(TranslateErrorKind::VoidValue, span),
            (VarType::Int, VarType::Double) => {
                self.emit(Opcode::I2D);
                Ok(())
            }
            (VarType::Double, VarType::Int) => {
                self.emit(Opcode::D2I);
                Ok(())
            }
            (VarType::String, VarType::Int) => {
                self.emit(Opcode::S2I);
                Ok(())
            }
            _ => err(TranslateErrorKind::IncompatibleType { context, expected: to, found: from }, span),
        }
    }

    /// Evaluates `expr` and leaves an int on the stack: non-zero iff the value is truthy.
    fn condition(&mut self, expr: &Expr) -> TResult<()> {
        match self.expr(expr)? {
            VarType::Int => {}
            VarType::Double => {
                self.emit(Opcode::DLoad0);
                self.emit(Opcode::DCmp);
            }
            VarType::String => self.emit(Opcode::S2I),
            VarType::Void => return err(TranslateErrorKind::VoidValue, expr.span),
        }
        Ok(())
    }

    /// Consumes the two ints on the stack, pushes 1 if `branch_op` would jump, else 0.
    fn materialize(&mut self, branch_op: Opcode, span: Span) -> TResult<()> {
        let code = &mut self.current.code;
        let truthy = code.new_label();
        let end = code.new_label();
        self.branch(branch_op, truthy, span)?;
        self.emit(Opcode::ILoad0);
        self.branch(Opcode::Ja, end, span)?;
        self.bind(truthy, span)?;
        self.emit(Opcode::ILoad1);
        self.bind(end, span)
    }

    // ── Statements ───────────────────────────────────────────────────

    fn stmt(&mut self, stmt: &Stmt, decl: &FunctionDecl) -> TResult<()> {
        let span = stmt.span;
        match &stmt.node {
            StmtKind::Expr(expr) => {
                if self.expr(expr)? != VarType::Void {
                    self.emit(Opcode::Pop);
                }
            }

            StmtKind::Store { var, op, value } => {
                let loc = self.lookup(var, span)?;
                match op {
                    StoreOp::Assign => {
                        let ty = self.expr(value)?;
                        self.coerce(ty, loc.ty, "assignment", value.span)?;
                    }
                    StoreOp::Increment | StoreOp::Decrement => {
                        let arith = if *op == StoreOp::Increment { BinaryOp::Add } else { BinaryOp::Sub };
                        self.load(loc, span)?;
                        let ty = self.expr(value)?;
                        let result = self.arithmetic(arith, loc.ty, ty, span)?;
                        self.coerce(result, loc.ty, "assignment", value.span)?;
                    }
                }
                self.store(loc, span)?;
            }

            StmtKind::If { condition, then_block, else_block } => {
                let code = &mut self.current.code;
                let otherwise = code.new_label();
                let end = code.new_label();
                self.condition(condition)?;
                self.emit(Opcode::ILoad0);
                self.branch(Opcode::IfICmpE, otherwise, span)?;
                self.block(then_block, span, decl)?;
                if let Some(else_block) = else_block {
                    self.branch(Opcode::Ja, end, span)?;
                    self.bind(otherwise, span)?;
                    self.block(else_block, span, decl)?;
                } else {
                    self.bind(otherwise, span)?;
                }
                self.bind(end, span)?;
            }

            StmtKind::While { condition, body } => {
                let code = &mut self.current.code;
                let head = code.label_here();
                let exit = code.new_label();
                self.condition(condition)?;
                self.emit(Opcode::ILoad0);
                self.branch(Opcode::IfICmpE, exit, span)?;
                self.block(body, span, decl)?;
                self.branch(Opcode::Ja, head, span)?;
                self.bind(exit, span)?;
            }

            StmtKind::For { var, from, to, body } => {
                let loc = self.lookup(var, span)?;
                if loc.ty != VarType::Int {
                    return err(TranslateErrorKind::ForVariableNotInt(var.clone()), span);
                }
                let ty = self.expr(from)?;
                self.coerce(ty, VarType::Int, "for range start", from.span)?;
                self.store(loc, span)?;

                let bound_slot = self.alloc_slot(VarType::Int, span)?;
                let bound = VarLocation { function: self.current.id, slot: bound_slot, ty: VarType::Int };
                let ty = self.expr(to)?;
                self.coerce(ty, VarType::Int, "for range end", to.span)?;
                self.store(bound, span)?;

                let code = &mut self.current.code;
                let head = code.label_here();
                let exit = code.new_label();
                self.load(loc, span)?;
                self.load(bound, span)?;
                self.branch(Opcode::IfICmpG, exit, span)?;
                self.block(body, span, decl)?;
                self.load(loc, span)?;
                self.emit(Opcode::ILoad1);
                self.emit(Opcode::IAdd);
                self.store(loc, span)?;
                self.branch(Opcode::Ja, head, span)?;
                self.bind(exit, span)?;
            }

            StmtKind::Print(args) => {
                for arg in args {
                    let op = match self.expr(arg)? {
                        VarType::Int => Opcode::IPrint,
                        VarType::Double => Opcode::DPrint,
                        VarType::String => Opcode::SPrint,
                        VarType::Void => return err(TranslateErrorKind::VoidValue, arg.span),
                    };
                    self.emit(op);
                }
            }

            StmtKind::Return(value) => {
                let is_top = self.current.id == TOP_FUNCTION_ID;
                match (value, decl.return_type) {
                    (Some(_), VarType::Void) => {
                        return err(TranslateErrorKind::ReturnValueFromVoid(decl.name.clone()), span);
                    }
                    (None, VarType::Void) => {}
                    (None, ty) => {
                        return err(
                            TranslateErrorKind::MissingReturnValue { function: decl.name.clone(), ty },
                            span,
                        );
                    }
                    (Some(value), ty) => {
                        let found = self.expr(value)?;
                        self.coerce(found, ty, "return value", value.span)?;
                    }
                }
                self.emit(if is_top { Opcode::Stop } else { Opcode::Return });
            }

            StmtKind::NativeCall { symbol } => {
                return err(TranslateErrorKind::MisplacedNative(symbol.clone()), span);
            }
        }
        Ok(())
    }

    // ── Expressions ──────────────────────────────────────────────────

    /// Emits `expr` and returns the type of the value it leaves on the stack.
    fn expr(&mut self, expr: &Expr) -> TResult<VarType> {
        let span = expr.span;
        match &expr.node {
            ExprKind::Int(value) => {
                match *value {
                    0 => self.emit(Opcode::ILoad0),
                    1 => self.emit(Opcode::ILoad1),
                    -1 => self.emit(Opcode::ILoadM1),
                    v => {
                        self.emit(Opcode::ILoad);
                        self.current.code.add_int64(v);
                    }
                }
                Ok(VarType::Int)
            }

            ExprKind::Double(value) => {
                let v = *value;
                if v.to_bits() == 0f64.to_bits() {
                    self.emit(Opcode::DLoad0);
                } else if v == 1.0 {
                    self.emit(Opcode::DLoad1);
                } else if v == -1.0 {
                    self.emit(Opcode::DLoadM1);
                } else {
                    self.emit(Opcode::DLoad);
                    self.current.code.add_double(v);
                }
                Ok(VarType::Double)
            }

            ExprKind::Str(s) => {
                let id = self
                    .strings
                    .intern(s)
                    .ok_or_else(|| TranslateError::new(TranslateErrorKind::TooManyStrings, span))?;
                if id == 0 {
                    self.emit(Opcode::SLoad0);
                } else {
                    self.emit(Opcode::SLoad);
                    self.current.code.add_uint16(id);
                }
                Ok(VarType::String)
            }

            ExprKind::Load(name) => {
                let loc = self.lookup(name, span)?;
                self.load(loc, span)?;
                Ok(loc.ty)
            }

            ExprKind::Unary { op: UnaryOp::Neg, operand } => match self.expr(operand)? {
                VarType::Int => {
                    self.emit(Opcode::INeg);
                    Ok(VarType::Int)
                }
                VarType::Double => {
                    self.emit(Opcode::DNeg);
                    Ok(VarType::Double)
                }
                VarType::Void => err(TranslateErrorKind::VoidValue, operand.span),
                ty => err(TranslateErrorKind::InvalidOperand { op: "-", ty }, span),
            },

            ExprKind::Unary { op: UnaryOp::Not, operand } => {
                self.condition(operand)?;
                self.emit(Opcode::ILoad0);
                self.materialize(Opcode::IfICmpE, span)?;
                Ok(VarType::Int)
            }

            ExprKind::Binary { op: op @ (BinaryOp::And | BinaryOp::Or), left, right } => {
                self.logical(*op, left, right, span)?;
                Ok(VarType::Int)
            }

            ExprKind::Binary { op, left, right } => {
                let lt = self.expr(left)?;
                let rt = self.expr(right)?;
                if lt == VarType::Void || rt == VarType::Void {
                    return err(TranslateErrorKind::VoidValue, span);
                }
                match op {
                    BinaryOp::BitOr | BinaryOp::BitAnd | BinaryOp::BitXor | BinaryOp::Mod => {
                        for ty in [lt, rt] {
                            if ty != VarType::Int {
                                return err(TranslateErrorKind::InvalidOperand { op: op.symbol(), ty }, span);
                            }
                        }
                        self.emit(match op {
                            BinaryOp::BitOr => Opcode::IAOr,
                            BinaryOp::BitAnd => Opcode::IAAnd,
                            BinaryOp::BitXor => Opcode::IAXor,
                            _ => Opcode::IMod,
                        });
                        Ok(VarType::Int)
                    }
                    op if op.is_comparison() => {
                        self.comparison(*op, lt, rt, span)?;
                        Ok(VarType::Int)
                    }
                    _ => self.arithmetic(*op, lt, rt, span),
                }
            }

            ExprKind::Call { function, args } => {
                let id = self.scopes.lookup_function(function).ok_or_else(|| {
                    TranslateError::new(TranslateErrorKind::UnresolvedFunction(function.clone()), span)
                })?;
                let (params, return_type) = {
                    let f = &self.functions[id as usize];
                    (f.params.clone(), f.return_type)
                };
                if params.len() != args.len() {
                    return err(
                        TranslateErrorKind::ArityMismatch {
                            function: function.clone(),
                            expected: params.len(),
                            got: args.len(),
                        },
                        span,
                    );
                }
                for (arg, param) in args.iter().zip(params) {
                    let ty = self.expr(arg)?;
                    self.coerce(ty, param, "argument", arg.span)?;
                }
                self.emit(Opcode::Call);
                self.current.code.add_uint16(id);
                Ok(return_type)
            }
        }
    }

    /// Emits the operator for two values already on the stack, promoting
    /// an int operand to double when the other one is a double.
    fn arithmetic(&mut self, op: BinaryOp, lt: VarType, rt: VarType, span: Span) -> TResult<VarType> {
        let ty = self.promote(op, lt, rt, span)?;
        let opcode = match (op, ty) {
            (BinaryOp::Add, VarType::Int) => Opcode::IAdd,
            (BinaryOp::Add, _) => Opcode::DAdd,
            (BinaryOp::Sub, VarType::Int) => Opcode::ISub,
            (BinaryOp::Sub, _) => Opcode::DSub,
            (BinaryOp::Mul, VarType::Int) => Opcode::IMul,
            (BinaryOp::Mul, _) => Opcode::DMul,
            (BinaryOp::Div, VarType::Int) => Opcode::IDiv,
            _ => Opcode::DDiv,
        };
        self.emit(opcode);
        Ok(ty)
    }

    fn comparison(&mut self, op: BinaryOp, lt: VarType, rt: VarType, span: Span) -> TResult<()> {
        if self.promote(op, lt, rt, span)? == VarType::Double {
            self.emit(Opcode::DCmp);
            self.emit(Opcode::ILoad0);
        }
        let branch_op = match op {
            BinaryOp::Eq => Opcode::IfICmpE,
            BinaryOp::Neq => Opcode::IfICmpNe,
            BinaryOp::Gt => Opcode::IfICmpG,
            BinaryOp::Ge => Opcode::IfICmpGe,
            BinaryOp::Lt => Opcode::IfICmpL,
            _ => Opcode::IfICmpLe,
        };
        self.materialize(branch_op, span)
    }

    /// Brings both numeric operands to a common type.
    fn promote(&mut self, op: BinaryOp, lt: VarType, rt: VarType, span: Span) -> TResult<VarType> {
        for ty in [lt, rt] {
            if ty == VarType::String {
                return err(TranslateErrorKind::InvalidOperand { op: op.symbol(), ty }, span);
            }
            if ty == VarType::Void {
                return err(TranslateErrorKind::VoidValue, span);
            }
        }
        match (lt, rt) {
            (VarType::Int, VarType::Double) => {
                self.emit(Opcode::Swap);
                self.emit(Opcode::I2D);
                self.emit(Opcode::Swap);
                Ok(VarType::Double)
            }
            (VarType::Double, VarType::Int) => {
                self.emit(Opcode::I2D);
                Ok(VarType::Double)
            }
            (ty, _) => Ok(ty),
        }
    }

    /// `&&` and `||`: the right operand is skipped once the left one decides.
    fn logical(&mut self, op: BinaryOp, left: &Expr, right: &Expr, span: Span) -> TResult<()> {
        // && jumps out on a zero operand, || on a non-zero one.
        let (decide, decided, undecided) = if op == BinaryOp::And {
            (Opcode::IfICmpE, Opcode::ILoad0, Opcode::ILoad1)
        } else {
            (Opcode::IfICmpNe, Opcode::ILoad1, Opcode::ILoad0)
        };
        let code = &mut self.current.code;
        let short = code.new_label();
        let end = code.new_label();
        for operand in [left, right] {
            self.condition(operand)?;
            self.emit(Opcode::ILoad0);
            self.branch(decide, short, span)?;
        }
        self.emit(undecided);
        self.branch(Opcode::Ja, end, span)?;
        self.bind(short, span)?;
        self.emit(decided);
        self.bind(end, span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops(code: &crate::bytecode::Bytecode) -> Vec<Opcode> {
        let mut out = Vec::new();
        let mut pos = 0;
        while let Some(Ok(op)) = code.opcode_at(pos) {
            out.push(op);
            pos += op.length() as u32;
        }
        out
    }

    fn top_ops(program: &Program) -> Vec<Opcode> {
        let compiled = translate(program).unwrap();
        ops(&compiled.functions[0].bytecode)
    }

    fn kind(program: &Program) -> TranslateErrorKind {
        translate(program).unwrap_err().kind
    }

    #[test]
    fn constants_use_short_forms() {
        let program = Program::new(Block::new(vec![Stmt::print(vec![
            Expr::int(0),
            Expr::int(1),
            Expr::int(-1),
            Expr::int(7),
            Expr::double(0.0),
            Expr::double(2.5),
            Expr::string(""),
            Expr::string("x"),
        ])]));
        let got = top_ops(&program);
        assert_eq!(
            got,
            vec![
                Opcode::ILoad0, Opcode::IPrint,
                Opcode::ILoad1, Opcode::IPrint,
                Opcode::ILoadM1, Opcode::IPrint,
                Opcode::ILoad, Opcode::IPrint,
                Opcode::DLoad0, Opcode::DPrint,
                Opcode::DLoad, Opcode::DPrint,
                Opcode::SLoad0, Opcode::SPrint,
                Opcode::SLoad, Opcode::SPrint,
                Opcode::Stop,
            ]
        );
    }

    #[test]
    fn compact_slots_then_wide_slots() {
        crate::test_utils::init_test_logging();
        let mut body = Block::default();
        for name in ["a", "b", "c", "d", "e"] {
            body = body.with_var(name, VarType::Int);
        }
        body.statements = ["a", "d", "e"].iter().map(|n| Stmt::assign(*n, Expr::int(0))).collect();
        body.statements.push(Stmt::print(vec![Expr::load("e")]));
        let compiled = translate(&Program::new(body)).unwrap();
        let code = &compiled.functions[0].bytecode;
        assert_eq!(
            ops(code),
            vec![
                Opcode::ILoad0, Opcode::StoreIVar0,
                Opcode::ILoad0, Opcode::StoreIVar3,
                Opcode::ILoad0, Opcode::StoreIVar,
                Opcode::LoadIVar, Opcode::IPrint,
                Opcode::Stop,
            ]
        );
        // STOREIVAR at byte 5, slot operand at 6
        assert_eq!(code.read_uint16(6), Some(4));
        assert_eq!(compiled.functions[0].local_types.len(), 5);
    }

    #[test]
    fn outer_variables_use_context_forms() {
        // int total; function void bump(int n) { total += n; }
        let bump = FunctionDecl::new(
            "bump",
            vec![Param::new("n", VarType::Int)],
            VarType::Void,
            Block::new(vec![Stmt::store("total", StoreOp::Increment, Expr::load("n"))]),
        );
        let body = Block::default().with_var("total", VarType::Int).with_function(bump);
        let compiled = translate(&Program::new(body)).unwrap();
        let f = compiled.function_by_name("bump").unwrap();
        assert_eq!(f.id, 1);
        assert_eq!(
            ops(&f.bytecode),
            vec![Opcode::LoadCtxIVar, Opcode::LoadIVar0, Opcode::IAdd, Opcode::StoreCtxIVar, Opcode::Return]
        );
        assert_eq!(f.bytecode.read_uint16(1), Some(TOP_FUNCTION_ID));
        assert_eq!(f.bytecode.read_uint16(3), Some(0));
    }

    #[test]
    fn int_operand_promoted_when_mixed() {
        let left_int = Program::new(Block::new(vec![Stmt::print(vec![Expr::binary(
            BinaryOp::Sub,
            Expr::int(5),
            Expr::double(2.5),
        )])]));
        assert_eq!(
            top_ops(&left_int),
            vec![Opcode::ILoad, Opcode::DLoad, Opcode::Swap, Opcode::I2D, Opcode::Swap, Opcode::DSub, Opcode::DPrint, Opcode::Stop]
        );

        let right_int = Program::new(Block::new(vec![Stmt::print(vec![Expr::binary(
            BinaryOp::Mul,
            Expr::double(2.5),
            Expr::int(4),
        )])]));
        assert_eq!(
            top_ops(&right_int),
            vec![Opcode::DLoad, Opcode::ILoad, Opcode::I2D, Opcode::DMul, Opcode::DPrint, Opcode::Stop]
        );
    }

    #[test]
    fn void_function_falls_off_into_return_and_typed_one_returns_zero() {
        let noop = FunctionDecl::new("noop", vec![], VarType::Void, Block::default());
        let zero = FunctionDecl::new("zero", vec![], VarType::Double, Block::default());
        let body = Block::default().with_function(noop).with_function(zero);
        let compiled = translate(&Program::new(body)).unwrap();
        assert_eq!(ops(&compiled.function_by_name("noop").unwrap().bytecode), vec![Opcode::Return]);
        assert_eq!(
            ops(&compiled.function_by_name("zero").unwrap().bytecode),
            vec![Opcode::DLoad0, Opcode::Return]
        );
    }

    #[test]
    fn expression_statement_pops_value() {
        let program = Program::new(Block::new(vec![Stmt::expr(Expr::int(3))]));
        assert_eq!(top_ops(&program), vec![Opcode::ILoad, Opcode::Pop, Opcode::Stop]);
    }

    #[test]
    fn top_variables_recorded() {
        let body = Block::default().with_var("x", VarType::Int).with_var("s", VarType::String);
        let compiled = translate(&Program::new(body)).unwrap();
        assert_eq!(
            compiled.top_variables,
            vec![
                TopVariable { name: "x".into(), slot: 0, ty: VarType::Int },
                TopVariable { name: "s".into(), slot: 1, ty: VarType::String },
            ]
        );
    }

    #[test]
    fn string_constants_deduplicated() {
        let program = Program::new(Block::new(vec![Stmt::print(vec![
            Expr::string("hi"),
            Expr::string("hi"),
            Expr::string("there"),
        ])]));
        let compiled = translate(&program).unwrap();
        assert_eq!(compiled.strings.len(), 3);
        assert_eq!(compiled.strings.get(1), Some("hi"));
    }

    // ── Errors ───────────────────────────────────────────────────────

    #[test]
    fn unresolved_names() {
        let span = Span::new(4, 5);
        let program = Program::new(Block::new(vec![Stmt::print(vec![Expr::load("y").at(span)])]));
        let e = translate(&program).unwrap_err();
        assert_eq!(e.kind, TranslateErrorKind::UnresolvedVariable("y".into()));
        assert_eq!(e.span, span);
        assert_eq!(e.code(), "MVM-T001");

        let program = Program::new(Block::new(vec![Stmt::expr(Expr::call("nope", vec![]))]));
        assert_eq!(kind(&program), TranslateErrorKind::UnresolvedFunction("nope".into()));
    }

    #[test]
    fn arity_checked() {
        let f = FunctionDecl::new("f", vec![Param::new("a", VarType::Int)], VarType::Int, Block::default());
        let body = Block::new(vec![Stmt::expr(Expr::call("f", vec![]))]).with_function(f);
        assert!(matches!(
            kind(&Program::new(body)),
            TranslateErrorKind::ArityMismatch { expected: 1, got: 0, .. }
        ));
    }

    #[test]
    fn string_operands_rejected() {
        for op in [BinaryOp::Add, BinaryOp::Lt, BinaryOp::Mod] {
            let program = Program::new(Block::new(vec![Stmt::print(vec![Expr::binary(
                op,
                Expr::string("a"),
                Expr::int(1),
            )])]));
            assert!(matches!(kind(&program), TranslateErrorKind::InvalidOperand { ty: VarType::String, .. }));
        }
        let program = Program::new(Block::new(vec![Stmt::print(vec![Expr::binary(
            BinaryOp::BitAnd,
            Expr::double(1.0),
            Expr::int(1),
        )])]));
        assert!(matches!(kind(&program), TranslateErrorKind::InvalidOperand { ty: VarType::Double, .. }));
    }

    #[test]
    fn string_converts_to_int_on_assignment_and_argument() {
        let body = Block::new(vec![Stmt::assign("x", Expr::string("abc"))]).with_var("x", VarType::Int);
        let got = top_ops(&Program::new(body));
        assert_eq!(&got[..3], &[Opcode::SLoad, Opcode::S2I, Opcode::StoreIVar0]);

        let f = FunctionDecl::new("f", vec![Param::new("n", VarType::Int)], VarType::Int, Block::default());
        let body = Block::new(vec![Stmt::expr(Expr::call("f", vec![Expr::string("s")]))]).with_function(f);
        let got = top_ops(&Program::new(body));
        assert!(got.windows(2).any(|w| w == [Opcode::SLoad, Opcode::S2I]), "{got:?}");
    }

    #[test]
    fn limit_errors_name_the_limit() {
        assert_eq!(
            TranslateErrorKind::TooManyLocals("f".into()).to_string(),
            "function 'f' has too many local variables (limit 65535)"
        );
        assert_eq!(TranslateErrorKind::TooManyStrings.to_string(), "too many string constants (limit 65535)");
    }

    #[test]
    fn string_to_double_assignment_rejected() {
        let body = Block::new(vec![Stmt::assign("x", Expr::string("no"))]).with_var("x", VarType::Double);
        assert_eq!(
            kind(&Program::new(body)),
            TranslateErrorKind::IncompatibleType {
                context: "assignment",
                expected: VarType::Double,
                found: VarType::String
            }
        );
    }

    #[test]
    fn void_call_as_value_rejected() {
        let f = FunctionDecl::new("f", vec![], VarType::Void, Block::default());
        let body = Block::new(vec![Stmt::print(vec![Expr::call("f", vec![])])]).with_function(f);
        assert_eq!(kind(&Program::new(body)), TranslateErrorKind::VoidValue);
    }

    #[test]
    fn duplicates_rejected() {
        let body = Block::default().with_var("x", VarType::Int).with_var("x", VarType::Double);
        assert_eq!(kind(&Program::new(body)), TranslateErrorKind::DuplicateVariable("x".into()));

        let f = || FunctionDecl::new("f", vec![], VarType::Void, Block::default());
        let body = Block::default().with_function(f()).with_function(f());
        assert_eq!(kind(&Program::new(body)), TranslateErrorKind::DuplicateFunction("f".into()));
    }

    #[test]
    fn shadowing_in_nested_block_allowed() {
        let inner = Block::new(vec![Stmt::assign("x", Expr::double(1.5))]).with_var("x", VarType::Double);
        let body = Block::new(vec![Stmt::if_else(Expr::int(1), inner, None)]).with_var("x", VarType::Int);
        assert!(translate(&Program::new(body)).is_ok());
    }

    #[test]
    fn for_variable_must_be_int() {
        let body = Block::new(vec![Stmt::for_range("d", Expr::int(0), Expr::int(3), Block::default())])
            .with_var("d", VarType::Double);
        assert_eq!(kind(&Program::new(body)), TranslateErrorKind::ForVariableNotInt("d".into()));
    }

    #[test]
    fn return_shape_checked() {
        let f = FunctionDecl::new("f", vec![], VarType::Int, Block::new(vec![Stmt::ret(None)]));
        assert!(matches!(
            kind(&Program::new(Block::default().with_function(f))),
            TranslateErrorKind::MissingReturnValue { ty: VarType::Int, .. }
        ));

        let g = FunctionDecl::new("g", vec![], VarType::Void, Block::new(vec![Stmt::ret(Some(Expr::int(1)))]));
        assert_eq!(
            kind(&Program::new(Block::default().with_function(g))),
            TranslateErrorKind::ReturnValueFromVoid("g".into())
        );
    }

    #[test]
    fn native_marker_outside_stub_rejected() {
        let program = Program::new(Block::new(vec![Stmt::print(vec![]), Stmt::native("labs")]));
        assert_eq!(kind(&program), TranslateErrorKind::MisplacedNative("labs".into()));
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    fn native_stub_uses_resolver() {
        let labs = FunctionDecl::new(
            "my_abs",
            vec![Param::new("x", VarType::Int)],
            VarType::Int,
            Block::new(vec![Stmt::native("labs")]),
        );
        let body = Block::default().with_function(labs);
        let translator = Translator::with_resolver(|name: &str| (name == "labs").then_some(0xdead_usize));
        let compiled = translator.translate(&Program::new(body)).unwrap();
        assert_eq!(compiled.natives.len(), 1);
        assert_eq!(compiled.natives[0].address, 0xdead);
        assert_eq!(compiled.natives[0].signature.params, vec![VarType::Int]);
        assert_eq!(
            ops(&compiled.function_by_name("my_abs").unwrap().bytecode),
            vec![Opcode::LoadIVar0, Opcode::CallNative, Opcode::Return]
        );

        let missing = FunctionDecl::new("m", vec![], VarType::Int, Block::new(vec![Stmt::native("nothing")]));
        let translator = Translator::with_resolver(|_: &str| None::<usize>);
        let e = translator.translate(&Program::new(Block::default().with_function(missing))).unwrap_err();
        assert_eq!(e.kind, TranslateErrorKind::Native(NativeError::Unresolved("nothing".into())));
    }

    #[test]
    fn too_many_native_int_args_rejected() {
        let params = (0..7).map(|i| Param::new(format!("p{i}"), VarType::Int)).collect();
        let f = FunctionDecl::new("f", params, VarType::Int, Block::new(vec![Stmt::native("f")]));
        let translator = Translator::with_resolver(|_: &str| Some(1usize));
        let e = translator.translate(&Program::new(Block::default().with_function(f))).unwrap_err();
        assert!(matches!(
            e.kind,
            TranslateErrorKind::Native(NativeError::TooManyIntArgs { count: 7, .. })
                | TranslateErrorKind::Native(NativeError::UnsupportedTarget)
        ));
    }
}
