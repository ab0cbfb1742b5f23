//! Tree-walking interpreter over the AST.
//!
//! Serves as the reference the compiled pipeline is checked against: for the
//! same program it must print the same output and leave top-level variables
//! with the same values as translating and executing on the VM.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;

use tracing::{debug, warn};

use crate::ast::*;
use crate::program::{NativeFunction, NativeSignature};
use crate::vm::native::{self, DynamicResolver, NativeValue, SymbolResolver};
use crate::vm::{Var, VarValue, format_double};

/// Nesting limit for calls. Each interpreted call costs several host stack
/// frames, so this sits far below the VM's limit.
pub const MAX_DEPTH: usize = 1024;

/// Stack reserved for the walk: 256 KiB per call at `MAX_DEPTH`. An unoptimized
/// call measures around 10 KiB.
pub const STACK_SIZE: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Double(f64),
    Str(String),
}

impl Value {
    fn ty(&self) -> VarType {
        match self {
            Value::Int(_) => VarType::Int,
            Value::Double(_) => VarType::Double,
            Value::Str(_) => VarType::String,
        }
    }

    fn zero(ty: VarType) -> Value {
        match ty {
            VarType::Double => Value::Double(0.0),
            VarType::String => Value::Str(String::new()),
            VarType::Int | VarType::Void => Value::Int(0),
        }
    }

    fn is_truthy(&self) -> bool {
        match self {
            Value::Int(i) => *i != 0,
            Value::Double(d) => *d < 0.0 || *d > 0.0,
            Value::Str(s) => !s.is_empty(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Double(d) => f.write_str(&format_double(*d)),
            Value::Str(s) => f.write_str(s),
        }
    }
}

impl From<&VarValue> for Value {
    fn from(v: &VarValue) -> Self {
        match v {
            VarValue::Int(i) => Value::Int(*i),
            VarValue::Double(d) => Value::Double(*d),
            VarValue::Str(s) => Value::Str(s.clone()),
        }
    }
}

impl From<Value> for VarValue {
    fn from(v: Value) -> Self {
        match v {
            Value::Int(i) => VarValue::Int(i),
            Value::Double(d) => VarValue::Double(d),
            Value::Str(s) => VarValue::Str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Runtime error: {message}")]
pub struct RuntimeError {
    pub message: String,
    pub code: &'static str,
}

impl RuntimeError {
    fn new(code: &'static str, msg: impl Into<String>) -> Self {
        RuntimeError { message: msg.into(), code }
    }

    /// A program the translator would have rejected.
    fn malformed(msg: impl Into<String>) -> Self {
        Self::new("MVM-R009", msg)
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

type Result<T> = std::result::Result<T, RuntimeError>;

// ── Environment ──────────────────────────────────────────────────────

/// A function visible from some scope, with where it was declared.
#[derive(Clone, Copy)]
struct FnDef<'p> {
    decl: &'p FunctionDecl,
    parent: &'p FunctionDecl,
    /// Number of the parent's scopes visible from the body.
    depth: usize,
}

#[derive(Default)]
struct Scope<'p> {
    block: Option<&'p Block>,
    vars: HashMap<&'p str, Value>,
    functions: HashMap<&'p str, FnDef<'p>>,
}

struct Frame<'p> {
    decl: &'p FunctionDecl,
    scopes: Vec<Scope<'p>>,
    /// Block variables keep their values for the whole invocation, across
    /// re-entries of the block (loop bodies).
    saved: HashMap<*const Block, HashMap<&'p str, Value>>,
    parent: Option<(&'p FunctionDecl, usize)>,
}

struct Env<'p, 'o> {
    frames: Vec<Frame<'p>>,
    out: &'o mut dyn Write,
    resolver: &'o dyn SymbolResolver,
}

impl<'p> Env<'p, '_> {
    fn frame(&mut self) -> Result<&mut Frame<'p>> {
        self.frames.last_mut().ok_or_else(|| RuntimeError::malformed("no active frame"))
    }

    /// Finds the scope holding a name: innermost first through the current
    /// frame, then through the newest live frame of each enclosing function.
    fn find(&self, has: impl Fn(&Scope<'p>) -> bool) -> Option<(usize, usize)> {
        let mut frame = self.frames.len().checked_sub(1)?;
        let mut limit = self.frames[frame].scopes.len();
        loop {
            let scopes = &self.frames[frame].scopes;
            if let Some(scope) = scopes[..limit.min(scopes.len())].iter().rposition(&has) {
                return Some((frame, scope));
            }
            let (parent, depth) = self.frames[frame].parent?;
            frame = self.frames.iter().rposition(|f| std::ptr::eq(f.decl, parent))?;
            limit = depth;
        }
    }

    fn get(&self, name: &str) -> Result<Value> {
        let (f, s) = self
            .find(|scope| scope.vars.contains_key(name))
            .ok_or_else(|| RuntimeError::malformed(format!("undefined variable: {name}")))?;
        Ok(self.frames[f].scopes[s].vars[name].clone())
    }

    fn set(&mut self, name: &str, value: Value) -> Result<()> {
        let (f, s) = self
            .find(|scope| scope.vars.contains_key(name))
            .ok_or_else(|| RuntimeError::malformed(format!("undefined variable: {name}")))?;
        let slot = self.frames[f].scopes[s]
            .vars
            .get_mut(name)
            .ok_or_else(|| RuntimeError::malformed(format!("undefined variable: {name}")))?;
        *slot = coerce(value, slot.ty())?;
        Ok(())
    }

    fn var_type(&self, name: &str) -> Result<VarType> {
        self.get(name).map(|v| v.ty())
    }

    fn function(&self, name: &str) -> Result<FnDef<'p>> {
        let (f, s) = self
            .find(|scope| scope.functions.contains_key(name))
            .ok_or_else(|| RuntimeError::malformed(format!("undefined function: {name}")))?;
        Ok(self.frames[f].scopes[s].functions[name])
    }

    fn enter_block(&mut self, block: &'p Block) -> Result<()> {
        let frame = self.frame()?;
        let decl = frame.decl;
        let saved = frame.saved.remove(&(block as *const Block));
        let mut scope = Scope { block: Some(block), ..Scope::default() };
        for var in &block.variables {
            let value = saved
                .as_ref()
                .and_then(|s| s.get(var.name.as_str()).cloned())
                .unwrap_or_else(|| Value::zero(var.ty));
            scope.vars.insert(var.name.as_str(), value);
        }
        let depth = frame.scopes.len() + 1;
        for function in &block.functions {
            scope.functions.insert(function.name.as_str(), FnDef { decl: function, parent: decl, depth });
        }
        frame.scopes.push(scope);
        Ok(())
    }

    fn exit_block(&mut self) -> Result<()> {
        let frame = self.frame()?;
        if let Some(Scope { block: Some(block), vars, .. }) = frame.scopes.pop() {
            frame.saved.insert(block as *const Block, vars);
        }
        Ok(())
    }

    fn print(&mut self, value: &Value) -> Result<()> {
        write!(self.out, "{value}").map_err(|e| RuntimeError::new("MVM-R006", format!("output error: {e}")))
    }
}

/// Control-flow signal out of a statement list.
enum BodyResult {
    Next,
    Return(Option<Value>),
}

// ── Entry points ─────────────────────────────────────────────────────

/// Interprets `program`, resolving natives in the running process.
pub fn run(program: &Program, vars: &mut [Var], out: &mut (dyn Write + Send)) -> Result<()> {
    run_with_resolver(program, vars, out, &DynamicResolver)
}

/// Interprets `program`. `vars` are bound to same-named top-level variables
/// before the run and receive their final values afterwards.
///
/// The walk runs on a scoped thread with a `STACK_SIZE` stack, so recursion
/// up to `MAX_DEPTH` never exhausts the caller's stack.
pub fn run_with_resolver(
    program: &Program,
    vars: &mut [Var],
    out: &mut (dyn Write + Send),
    resolver: &(dyn SymbolResolver + Sync),
) -> Result<()> {
    std::thread::scope(|s| {
        let walker = std::thread::Builder::new()
            .name("mathvm-interpreter".into())
            .stack_size(STACK_SIZE)
            .spawn_scoped(s, move || walk(program, vars, out, resolver))
            .map_err(|e| RuntimeError::new("MVM-R003", format!("cannot reserve interpreter stack: {e}")))?;
        walker.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic))
    })
}

fn walk(program: &Program, vars: &mut [Var], out: &mut dyn Write, resolver: &dyn SymbolResolver) -> Result<()> {
    let top = &program.top;
    let mut env = Env {
        frames: vec![Frame {
            decl: top,
            scopes: vec![Scope::default()],
            saved: HashMap::new(),
            parent: None,
        }],
        out,
        resolver,
    };
    env.enter_block(&top.body)?;

    for var in vars.iter() {
        let Some(slot) = env.frames[0].scopes[1].vars.get_mut(var.name.as_str()) else {
            warn!(name = %var.name, "program argument does not match a top-level variable");
            continue;
        };
        if var.value.ty() != slot.ty() {
            return Err(RuntimeError::new(
                "MVM-R004",
                format!("argument '{}' is {}, variable is {}", var.name, var.value.ty(), slot.ty()),
            ));
        }
        *slot = Value::from(&var.value);
    }

    eval_stmts(&mut env, &top.body.statements)?;

    for var in vars.iter_mut() {
        if let Some(value) = env.frames[0].scopes.get(1).and_then(|s| s.vars.get(var.name.as_str())) {
            var.value = value.clone().into();
        }
    }
    env.out.flush().map_err(|e| RuntimeError::new("MVM-R006", format!("output error: {e}")))
}

// ── Calls ────────────────────────────────────────────────────────────

fn call_function<'p>(env: &mut Env<'p, '_>, def: FnDef<'p>, args: Vec<Value>) -> Result<Option<Value>> {
    let decl = def.decl;
    if args.len() != decl.params.len() {
        return Err(RuntimeError::malformed(format!(
            "{}: expected {} args, got {}",
            decl.name,
            decl.params.len(),
            args.len()
        )));
    }
    if env.frames.len() >= MAX_DEPTH {
        return Err(RuntimeError::new("MVM-R003", format!("call depth exceeded calling {}", decl.name)));
    }
    debug!(function = %decl.name, depth = env.frames.len(), "call");

    let mut params = Scope::default();
    for (param, arg) in decl.params.iter().zip(args) {
        params.vars.insert(param.name.as_str(), coerce(arg, param.ty)?);
    }
    if let Some(symbol) = decl.native_symbol() {
        return call_native(env, decl, symbol, params);
    }

    env.frames.push(Frame {
        decl,
        scopes: vec![params],
        saved: HashMap::new(),
        parent: Some((def.parent, def.depth)),
    });
    let result = eval_block(env, &decl.body)?;
    env.frames.pop();

    match (result, decl.return_type) {
        (_, VarType::Void) => Ok(None),
        (BodyResult::Return(Some(v)), _) => Ok(Some(v)),
        (_, ty) => Ok(Some(Value::zero(ty))),
    }
}

fn call_native(env: &Env, decl: &FunctionDecl, symbol: &str, params: Scope) -> Result<Option<Value>> {
    let native_error = |e: native::NativeError| RuntimeError::new("MVM-R005", e.to_string());
    let address = env
        .resolver
        .resolve(symbol)
        .ok_or_else(|| native_error(native::NativeError::Unresolved(symbol.to_string())))?;
    let native = NativeFunction {
        name: symbol.to_string(),
        signature: NativeSignature {
            return_type: decl.return_type,
            params: decl.params.iter().map(|p| p.ty).collect(),
        },
        address,
    };
    let args: Vec<NativeValue> = decl
        .params
        .iter()
        .map(|p| match &params.vars[p.name.as_str()] {
            Value::Int(i) => NativeValue::Int(*i),
            Value::Double(d) => NativeValue::Double(*d),
            Value::Str(s) => NativeValue::Str(s.clone()),
        })
        .collect();
    // SAFETY: the address was resolved for this symbol and the declaration
    // supplies its C signature.
    let result = unsafe { native::invoke(&native, &args) }.map_err(native_error)?;
    Ok(match result {
        NativeValue::Void => None,
        NativeValue::Int(i) => Some(Value::Int(i)),
        NativeValue::Double(d) => Some(Value::Double(d)),
        NativeValue::Str(s) => Some(Value::Str(s)),
    })
}

// ── Statements ───────────────────────────────────────────────────────

fn eval_block<'p>(env: &mut Env<'p, '_>, block: &'p Block) -> Result<BodyResult> {
    env.enter_block(block)?;
    let result = eval_stmts(env, &block.statements)?;
    env.exit_block()?;
    Ok(result)
}

fn eval_stmts<'p>(env: &mut Env<'p, '_>, stmts: &'p [Stmt]) -> Result<BodyResult> {
    for stmt in stmts {
        if let BodyResult::Return(v) = eval_stmt(env, stmt)? {
            return Ok(BodyResult::Return(v));
        }
    }
    Ok(BodyResult::Next)
}

fn eval_stmt<'p>(env: &mut Env<'p, '_>, stmt: &'p Stmt) -> Result<BodyResult> {
    match &stmt.node {
        StmtKind::Expr(expr) => {
            eval_expr(env, expr)?;
        }
        StmtKind::Store { var, op, value } => {
            let new = match op {
                StoreOp::Assign => value_of(env, value)?,
                StoreOp::Increment | StoreOp::Decrement => {
                    let arith = if *op == StoreOp::Increment { BinaryOp::Add } else { BinaryOp::Sub };
                    let current = env.get(var)?;
                    arithmetic(arith, current, value_of(env, value)?)?
                }
            };
            env.set(var, new)?;
        }
        StmtKind::If { condition, then_block, else_block } => {
            if value_of(env, condition)?.is_truthy() {
                return eval_block(env, then_block);
            } else if let Some(block) = else_block {
                return eval_block(env, block);
            }
        }
        StmtKind::While { condition, body } => {
            while value_of(env, condition)?.is_truthy() {
                if let BodyResult::Return(v) = eval_block(env, body)? {
                    return Ok(BodyResult::Return(v));
                }
            }
        }
        StmtKind::For { var, from, to, body } => {
            if env.var_type(var)? != VarType::Int {
                return Err(RuntimeError::malformed(format!("for variable '{var}' is not an int")));
            }
            let start = value_of(env, from)?;
            env.set(var, start)?;
            let Value::Int(upper) = coerce(value_of(env, to)?, VarType::Int)? else {
                return Err(RuntimeError::malformed("for bound is not an int"));
            };
            loop {
                let Value::Int(i) = env.get(var)? else {
                    return Err(RuntimeError::malformed(format!("for variable '{var}' is not an int")));
                };
                if i > upper {
                    break;
                }
                if let BodyResult::Return(v) = eval_block(env, body)? {
                    return Ok(BodyResult::Return(v));
                }
                let next = arithmetic(BinaryOp::Add, env.get(var)?, Value::Int(1))?;
                env.set(var, next)?;
            }
        }
        StmtKind::Print(args) => {
            for arg in args {
                let value = value_of(env, arg)?;
                env.print(&value)?;
            }
        }
        StmtKind::Return(value) => {
            let decl = env.frame()?.decl;
            let value = match value {
                Some(expr) => Some(coerce(value_of(env, expr)?, decl.return_type)?),
                None => None,
            };
            return Ok(BodyResult::Return(value));
        }
        StmtKind::NativeCall { symbol } => {
            return Err(RuntimeError::malformed(format!("native '{symbol}' outside a native function body")));
        }
    }
    Ok(BodyResult::Next)
}

// ── Expressions ──────────────────────────────────────────────────────

fn value_of<'p>(env: &mut Env<'p, '_>, expr: &'p Expr) -> Result<Value> {
    eval_expr(env, expr)?.ok_or_else(|| RuntimeError::malformed("void value used in an expression"))
}

fn eval_expr<'p>(env: &mut Env<'p, '_>, expr: &'p Expr) -> Result<Option<Value>> {
    let value = match &expr.node {
        ExprKind::Int(i) => Value::Int(*i),
        ExprKind::Double(d) => Value::Double(*d),
        ExprKind::Str(s) => Value::Str(s.clone()),
        ExprKind::Load(name) => env.get(name)?,
        ExprKind::Binary { op, left, right } if matches!(op, BinaryOp::And | BinaryOp::Or) => {
            // || settles on a truthy left operand, && on a falsy one.
            let settles_on = *op == BinaryOp::Or;
            let l = value_of(env, left)?.is_truthy();
            let result = if l == settles_on { l } else { value_of(env, right)?.is_truthy() };
            Value::Int(i64::from(result))
        }
        ExprKind::Binary { op, left, right } => {
            let l = value_of(env, left)?;
            let r = value_of(env, right)?;
            if op.is_comparison() { compare(*op, l, r)? } else { arithmetic(*op, l, r)? }
        }
        ExprKind::Unary { op: UnaryOp::Not, operand } => Value::Int(i64::from(!value_of(env, operand)?.is_truthy())),
        ExprKind::Unary { op: UnaryOp::Neg, operand } => match value_of(env, operand)? {
            Value::Int(i) => Value::Int(i.wrapping_neg()),
            Value::Double(d) => Value::Double(-d),
            Value::Str(_) => return Err(RuntimeError::malformed("cannot negate a string")),
        },
        ExprKind::Call { function, args } => {
            let def = env.function(function)?;
            let mut arg_vals = Vec::with_capacity(args.len());
            for arg in args {
                arg_vals.push(value_of(env, arg)?);
            }
            return call_function(env, def, arg_vals);
        }
    };
    Ok(Some(value))
}

fn coerce(value: Value, ty: VarType) -> Result<Value> {
    match (value, ty) {
        (Value::Int(i), VarType::Double) => Ok(Value::Double(i as f64)),
        (Value::Double(d), VarType::Int) => Ok(Value::Int(d as i64)),
        (Value::Str(s), VarType::Int) => Ok(Value::Int(i64::from(!s.is_empty()))),
        (v, ty) if v.ty() == ty => Ok(v),
        (v, ty) => Err(RuntimeError::malformed(format!("expected {ty}, found {}", v.ty()))),
    }
}

/// Brings two numbers to a common type: both ints, or both doubles.
fn promote(l: Value, r: Value, op: BinaryOp) -> Result<(Value, Value)> {
    match (l, r) {
        (Value::Int(a), Value::Double(b)) => Ok((Value::Double(a as f64), Value::Double(b))),
        (Value::Double(a), Value::Int(b)) => Ok((Value::Double(a), Value::Double(b as f64))),
        (l @ (Value::Int(_) | Value::Double(_)), r @ (Value::Int(_) | Value::Double(_))) => Ok((l, r)),
        (l, r) => Err(RuntimeError::malformed(format!(
            "'{}' cannot take {} and {}",
            op.symbol(),
            l.ty(),
            r.ty()
        ))),
    }
}

fn arithmetic(op: BinaryOp, l: Value, r: Value) -> Result<Value> {
    if matches!(op, BinaryOp::BitOr | BinaryOp::BitAnd | BinaryOp::BitXor | BinaryOp::Mod) {
        let (Value::Int(a), Value::Int(b)) = (&l, &r) else {
            return Err(RuntimeError::malformed(format!("'{}' needs int operands", op.symbol())));
        };
        return match op {
            BinaryOp::BitOr => Ok(Value::Int(a | b)),
            BinaryOp::BitAnd => Ok(Value::Int(a & b)),
            BinaryOp::BitXor => Ok(Value::Int(a ^ b)),
            _ if *b == 0 => Err(RuntimeError::new("MVM-R001", "division by zero")),
            _ => Ok(Value::Int(a.wrapping_rem(*b))),
        };
    }
    match promote(l, r, op)? {
        (Value::Int(a), Value::Int(b)) => match op {
            BinaryOp::Add => Ok(Value::Int(a.wrapping_add(b))),
            BinaryOp::Sub => Ok(Value::Int(a.wrapping_sub(b))),
            BinaryOp::Mul => Ok(Value::Int(a.wrapping_mul(b))),
            BinaryOp::Div if b == 0 => Err(RuntimeError::new("MVM-R001", "division by zero")),
            BinaryOp::Div => Ok(Value::Int(a.wrapping_div(b))),
            _ => Err(RuntimeError::malformed(format!("'{}' is not arithmetic", op.symbol()))),
        },
        (Value::Double(a), Value::Double(b)) => match op {
            BinaryOp::Add => Ok(Value::Double(a + b)),
            BinaryOp::Sub => Ok(Value::Double(a - b)),
            BinaryOp::Mul => Ok(Value::Double(a * b)),
            BinaryOp::Div => Ok(Value::Double(a / b)),
            _ => Err(RuntimeError::malformed(format!("'{}' is not arithmetic", op.symbol()))),
        },
        _ => Err(RuntimeError::malformed("mismatched operands")),
    }
}

fn compare(op: BinaryOp, l: Value, r: Value) -> Result<Value> {
    let sign = match promote(l, r, op)? {
        (Value::Int(a), Value::Int(b)) => a.cmp(&b) as i64,
        // Unordered doubles compare as equal.
        (Value::Double(a), Value::Double(b)) => {
            if a < b {
                -1
            } else if a > b {
                1
            } else {
                0
            }
        }
        _ => return Err(RuntimeError::malformed("mismatched operands")),
    };
    let result = match op {
        BinaryOp::Eq => sign == 0,
        BinaryOp::Neq => sign != 0,
        BinaryOp::Gt => sign > 0,
        BinaryOp::Ge => sign >= 0,
        BinaryOp::Lt => sign < 0,
        BinaryOp::Le => sign <= 0,
        _ => return Err(RuntimeError::malformed(format!("'{}' is not a comparison", op.symbol()))),
    };
    Ok(Value::Int(i64::from(result)))
}
