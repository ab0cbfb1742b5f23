use std::fmt;
use std::io::Write;

use tracing::{debug, trace, warn};

use crate::ast::VarType;
use crate::bytecode::Opcode;
use crate::program::{CompiledProgram, TOP_FUNCTION_ID};

pub mod native;
use native::{NativeError, NativeValue};

/// Upper bound on live frames; deeper recursion is reported, not crashed on.
pub const MAX_CALL_DEPTH: usize = 1 << 16;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("operand stack underflow")]
    StackUnderflow,
    #[error("unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),
    #[error("INVALID instruction executed")]
    InvalidInstruction,
    #[error("instruction operands run past the end of the function")]
    TruncatedInstruction,
    #[error("execution ran past the end of the function")]
    RanOffEnd,
    #[error("branch target {0} is outside the function")]
    BranchOutOfRange(i64),
    #[error("variable slot {0} does not exist")]
    SlotOutOfRange(u16),
    #[error("unknown function id {0}")]
    UnknownFunction(u16),
    #[error("unknown native id {0}")]
    UnknownNative(u16),
    #[error("unknown string id {0}")]
    UnknownString(u32),
    #[error("no active frame of function {0} for context access")]
    MissingContext(u16),
    #[error("division by zero")]
    DivisionByZero,
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: VarType, found: VarType },
    #[error("call depth exceeded {MAX_CALL_DEPTH}")]
    CallDepthExceeded,
    #[error("argument '{name}' is {found}, but the variable is declared {expected}")]
    ArgumentType { name: String, expected: VarType, found: VarType },
    #[error(transparent)]
    Native(#[from] NativeError),
    #[error("cannot write output: {0}")]
    Output(#[from] std::io::Error),
}

impl VmError {
    /// Stable diagnostic code, explained by `mathvm --explain`.
    pub fn code(&self) -> &'static str {
        match self {
            VmError::DivisionByZero => "MVM-R001",
            VmError::MissingContext(_) => "MVM-R002",
            VmError::CallDepthExceeded => "MVM-R003",
            VmError::ArgumentType { .. } => "MVM-R004",
            VmError::Native(_) => "MVM-R005",
            VmError::Output(_) => "MVM-R006",
            VmError::TypeMismatch { .. } | VmError::StackUnderflow => "MVM-R007",
            VmError::UnknownOpcode(_)
            | VmError::InvalidInstruction
            | VmError::TruncatedInstruction
            | VmError::RanOffEnd
            | VmError::BranchOutOfRange(_)
            | VmError::SlotOutOfRange(_)
            | VmError::UnknownFunction(_)
            | VmError::UnknownNative(_)
            | VmError::UnknownString(_) => "MVM-R008",
        }
    }
}

/// A fault together with the instruction that raised it.
#[derive(Debug, thiserror::Error)]
#[error("{error} (in {function} at offset {offset})")]
pub struct ExecutionError {
    #[source]
    pub error: VmError,
    pub function: String,
    pub offset: u32,
}

impl ExecutionError {
    pub fn code(&self) -> &'static str {
        self.error.code()
    }
}

type VmResult<T> = Result<T, VmError>;

// ── Program arguments ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum VarValue {
    Int(i64),
    Double(f64),
    Str(String),
}

impl VarValue {
    pub fn ty(&self) -> VarType {
        match self {
            VarValue::Int(_) => VarType::Int,
            VarValue::Double(_) => VarType::Double,
            VarValue::Str(_) => VarType::String,
        }
    }

    /// Parses `text` as an int, else a double, else keeps it as a string.
    pub fn parse(text: &str) -> VarValue {
        if let Ok(i) = text.parse::<i64>() {
            VarValue::Int(i)
        } else if let Ok(d) = text.parse::<f64>() {
            VarValue::Double(d)
        } else {
            VarValue::Str(text.to_string())
        }
    }
}

impl fmt::Display for VarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarValue::Int(i) => write!(f, "{i}"),
            VarValue::Double(d) => f.write_str(&format_double(*d)),
            VarValue::Str(s) => f.write_str(s),
        }
    }
}

/// A named value exchanged with the top-level block of a program.
#[derive(Debug, Clone, PartialEq)]
pub struct Var {
    pub name: String,
    pub value: VarValue,
}

impl Var {
    pub fn new(name: impl Into<String>, value: VarValue) -> Self {
        Var { name: name.into(), value }
    }
}

/// How `print` renders a double.
pub fn format_double(d: f64) -> String {
    format!("{d}")
}

// ── Values and frames ────────────────────────────────────────────────

/// Tagged stack/slot value. Strings are ids: pool constants first, then
/// strings created while running.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i64),
    Double(f64),
    Str(u32),
}

impl Value {
    fn ty(self) -> VarType {
        match self {
            Value::Int(_) => VarType::Int,
            Value::Double(_) => VarType::Double,
            Value::Str(_) => VarType::String,
        }
    }

    fn zero(ty: VarType) -> Value {
        match ty {
            VarType::Double => Value::Double(0.0),
            VarType::String => Value::Str(0),
            VarType::Int | VarType::Void => Value::Int(0),
        }
    }
}

#[derive(Debug)]
struct Frame {
    function: u16,
    locals: Vec<Value>,
    /// Caller function and instruction to resume at; `None` for the top frame.
    return_to: Option<(u16, u32)>,
}

/// Runs `program` once, writing `print` output to `out`.
pub fn execute<W: Write>(program: &CompiledProgram, vars: &mut [Var], out: W) -> Result<(), ExecutionError> {
    Vm::new(program, out).execute(vars)
}

// ── VM ───────────────────────────────────────────────────────────────

pub struct Vm<'a, W: Write> {
    program: &'a CompiledProgram,
    out: W,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    /// Per function id: indices into `frames` of its live activations, newest last.
    contexts: Vec<Vec<usize>>,
    runtime_strings: Vec<String>,
    function: u16,
    ip: u32,
    /// Start of the instruction being executed, for error reports.
    insn: u32,
}

impl<'a, W: Write> Vm<'a, W> {
    pub fn new(program: &'a CompiledProgram, out: W) -> Self {
        Vm {
            program,
            out,
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(64),
            contexts: vec![Vec::new(); program.functions.len()],
            runtime_strings: Vec::new(),
            function: TOP_FUNCTION_ID,
            ip: 0,
            insn: 0,
        }
    }

    /// Runs the top-level function to completion.
    ///
    /// Each entry of `vars` naming a top-level variable initializes it before
    /// the run and receives its final value afterwards.
    pub fn execute(&mut self, vars: &mut [Var]) -> Result<(), ExecutionError> {
        self.stack.clear();
        self.frames.clear();
        self.contexts.iter_mut().for_each(Vec::clear);
        self.runtime_strings.clear();
        self.function = TOP_FUNCTION_ID;
        self.ip = 0;
        self.insn = 0;

        debug!(functions = self.program.functions.len(), natives = self.program.natives.len(), "vm start");
        if let Err(error) = self.start(vars) {
            let function = self
                .program
                .function_by_id(self.function)
                .map_or_else(|| format!("#{}", self.function), |f| f.name.clone());
            return Err(ExecutionError { error, function, offset: self.insn });
        }
        self.write_back(vars);
        debug!("vm stop");
        Ok(())
    }

    fn start(&mut self, vars: &[Var]) -> VmResult<()> {
        self.enter(TOP_FUNCTION_ID, None)?;
        self.bind_arguments(vars)?;
        self.run()
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    pub fn into_output(self) -> W {
        self.out
    }

    fn bind_arguments(&mut self, vars: &[Var]) -> VmResult<()> {
        let program = self.program;
        for var in vars {
            let Some(top) = program.top_variables.iter().find(|v| v.name == var.name) else {
                warn!(name = %var.name, "program argument does not match a top-level variable");
                continue;
            };
            if var.value.ty() != top.ty {
                return Err(VmError::ArgumentType {
                    name: var.name.clone(),
                    expected: top.ty,
                    found: var.value.ty(),
                });
            }
            let value = match &var.value {
                VarValue::Int(i) => Value::Int(*i),
                VarValue::Double(d) => Value::Double(*d),
                VarValue::Str(s) => Value::Str(self.add_string(s.clone())),
            };
            *self.top_slot(top.slot)? = value;
        }
        Ok(())
    }

    fn write_back(&mut self, vars: &mut [Var]) {
        for var in vars.iter_mut() {
            let Some(top) = self.program.top_variables.iter().find(|v| v.name == var.name) else {
                continue;
            };
            let Some(value) = self.frames.first().and_then(|f| f.locals.get(top.slot as usize)) else {
                continue;
            };
            var.value = match *value {
                Value::Int(i) => VarValue::Int(i),
                Value::Double(d) => VarValue::Double(d),
                Value::Str(id) => VarValue::Str(self.string(id).unwrap_or_default().to_string()),
            };
        }
    }

    fn top_slot(&mut self, slot: u16) -> VmResult<&mut Value> {
        self.frames
            .first_mut()
            .and_then(|f| f.locals.get_mut(slot as usize))
            .ok_or(VmError::SlotOutOfRange(slot))
    }

    // ── Strings ──────────────────────────────────────────────────────

    fn string(&self, id: u32) -> VmResult<&str> {
        let pooled = self.program.strings.len();
        let found = match usize::try_from(id).ok() {
            Some(i) if i < pooled => self.program.strings.get(i as u16),
            Some(i) => self.runtime_strings.get(i - pooled).map(String::as_str),
            None => None,
        };
        found.ok_or(VmError::UnknownString(id))
    }

    fn add_string(&mut self, s: String) -> u32 {
        let id = self.program.strings.len() + self.runtime_strings.len();
        self.runtime_strings.push(s);
        id as u32
    }

    // ── Stack ────────────────────────────────────────────────────────

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> VmResult<Value> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    fn pop_int(&mut self) -> VmResult<i64> {
        match self.pop()? {
            Value::Int(i) => Ok(i),
            other => Err(VmError::TypeMismatch { expected: VarType::Int, found: other.ty() }),
        }
    }

    fn pop_double(&mut self) -> VmResult<f64> {
        match self.pop()? {
            Value::Double(d) => Ok(d),
            other => Err(VmError::TypeMismatch { expected: VarType::Double, found: other.ty() }),
        }
    }

    fn pop_string(&mut self) -> VmResult<u32> {
        match self.pop()? {
            Value::Str(id) => Ok(id),
            other => Err(VmError::TypeMismatch { expected: VarType::String, found: other.ty() }),
        }
    }

    fn pop_typed(&mut self, ty: VarType) -> VmResult<Value> {
        let value = self.pop()?;
        if value.ty() != ty {
            return Err(VmError::TypeMismatch { expected: ty, found: value.ty() });
        }
        Ok(value)
    }

    /// Pops upper then lower; returns `(lower, upper)`.
    fn pop_int_pair(&mut self) -> VmResult<(i64, i64)> {
        let upper = self.pop_int()?;
        let lower = self.pop_int()?;
        Ok((lower, upper))
    }

    fn pop_double_pair(&mut self) -> VmResult<(f64, f64)> {
        let upper = self.pop_double()?;
        let lower = self.pop_double()?;
        Ok((lower, upper))
    }

    // ── Frames ───────────────────────────────────────────────────────

    fn enter(&mut self, id: u16, return_to: Option<(u16, u32)>) -> VmResult<()> {
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(VmError::CallDepthExceeded);
        }
        let program = self.program;
        let function = program.function_by_id(id).ok_or(VmError::UnknownFunction(id))?;
        let mut locals: Vec<Value> = function.local_types.iter().map(|&ty| Value::zero(ty)).collect();
        if return_to.is_some() {
            let count = function.params.len().min(locals.len());
            for slot in (0..count).rev() {
                locals[slot] = self.pop_typed(function.params[slot])?;
            }
        }
        trace!(function = %function.name, depth = self.frames.len(), "call");
        self.frames.push(Frame { function: id, locals, return_to });
        let index = self.frames.len() - 1;
        self.contexts
            .get_mut(id as usize)
            .ok_or(VmError::UnknownFunction(id))?
            .push(index);
        self.function = id;
        self.ip = 0;
        Ok(())
    }

    /// Pops the current frame. `false` when there is no caller to resume.
    fn leave(&mut self) -> bool {
        let Some(frame) = self.frames.pop() else {
            return false;
        };
        if let Some(stack) = self.contexts.get_mut(frame.function as usize) {
            stack.pop();
        }
        trace!(function = frame.function, depth = self.frames.len(), "return");
        match frame.return_to {
            Some((function, ip)) => {
                self.function = function;
                self.ip = ip;
                true
            }
            None => false,
        }
    }

    fn local(&mut self, slot: u16) -> VmResult<&mut Value> {
        self.frames
            .last_mut()
            .and_then(|f| f.locals.get_mut(slot as usize))
            .ok_or(VmError::SlotOutOfRange(slot))
    }

    fn context(&mut self, function: u16, slot: u16) -> VmResult<&mut Value> {
        let index = *self
            .contexts
            .get(function as usize)
            .and_then(|stack| stack.last())
            .ok_or(VmError::MissingContext(function))?;
        self.frames[index].locals.get_mut(slot as usize).ok_or(VmError::SlotOutOfRange(slot))
    }

    fn load_local(&mut self, slot: u16, ty: VarType) -> VmResult<()> {
        let value = *self.local(slot)?;
        self.push_checked(value, ty)
    }

    fn store_local(&mut self, slot: u16, ty: VarType) -> VmResult<()> {
        let value = self.pop_typed(ty)?;
        *self.local(slot)? = value;
        Ok(())
    }

    fn load_context(&mut self, function: u16, slot: u16, ty: VarType) -> VmResult<()> {
        let value = *self.context(function, slot)?;
        self.push_checked(value, ty)
    }

    fn store_context(&mut self, function: u16, slot: u16, ty: VarType) -> VmResult<()> {
        let value = self.pop_typed(ty)?;
        *self.context(function, slot)? = value;
        Ok(())
    }

    fn push_checked(&mut self, value: Value, ty: VarType) -> VmResult<()> {
        if value.ty() != ty {
            return Err(VmError::TypeMismatch { expected: ty, found: value.ty() });
        }
        self.push(value);
        Ok(())
    }

    fn write_value(&mut self, value: Value) -> VmResult<()> {
        match value {
            Value::Int(i) => write!(self.out, "{i}")?,
            Value::Double(d) => self.out.write_all(format_double(d).as_bytes())?,
            Value::Str(id) => {
                let text = self.string(id)?.to_string();
                self.out.write_all(text.as_bytes())?;
            }
        }
        Ok(())
    }

    fn call_native(&mut self, id: u16) -> VmResult<()> {
        let program = self.program;
        let native = program.natives.get(id as usize).ok_or(VmError::UnknownNative(id))?;
        let params = &native.signature.params;
        let mut args = vec![NativeValue::Void; params.len()];
        for (slot, ty) in params.iter().enumerate().rev() {
            args[slot] = match self.pop_typed(*ty)? {
                Value::Int(i) => NativeValue::Int(i),
                Value::Double(d) => NativeValue::Double(d),
                Value::Str(s) => NativeValue::Str(self.string(s)?.to_string()),
            };
        }
        trace!(symbol = %native.name, "native call");
        // SAFETY: the address was resolved for this symbol and the translator
        // checked that its signature fits the register-passing convention.
        let result = unsafe { native::invoke(native, &args) }?;
        match result {
            NativeValue::Void => {}
            NativeValue::Int(i) => self.push(Value::Int(i)),
            NativeValue::Double(d) => self.push(Value::Double(d)),
            NativeValue::Str(s) => {
                let id = self.add_string(s);
                self.push(Value::Str(id));
            }
        }
        Ok(())
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    fn run(&mut self) -> VmResult<()> {
        let program = self.program;
        loop {
            let code = &program
                .function_by_id(self.function)
                .ok_or(VmError::UnknownFunction(self.function))?
                .bytecode;

            // Runs until control moves to another function.
            loop {
                self.insn = self.ip;
                let op = match code.opcode_at(self.ip) {
                    Some(Ok(op)) => op,
                    Some(Err(byte)) => return Err(VmError::UnknownOpcode(byte)),
                    None => return Err(VmError::RanOffEnd),
                };
                let arg = self.ip + 1;
                self.ip += op.length() as u32;

                let u16_at = |pos: u32| code.read_uint16(pos).ok_or(VmError::TruncatedInstruction);

                match op {
                    Opcode::Invalid => return Err(VmError::InvalidInstruction),
                    Opcode::DLoad => {
                        let d = code.read_double(arg).ok_or(VmError::TruncatedInstruction)?;
                        self.push(Value::Double(d));
                    }
                    Opcode::ILoad => {
                        let i = code.read_int64(arg).ok_or(VmError::TruncatedInstruction)?;
                        self.push(Value::Int(i));
                    }
                    Opcode::SLoad => {
                        let id = u16_at(arg)?;
                        if program.strings.get(id).is_none() {
                            return Err(VmError::UnknownString(u32::from(id)));
                        }
                        self.push(Value::Str(u32::from(id)));
                    }
                    Opcode::DLoad0 => self.push(Value::Double(0.0)),
                    Opcode::ILoad0 => self.push(Value::Int(0)),
                    Opcode::SLoad0 => self.push(Value::Str(0)),
                    Opcode::DLoad1 => self.push(Value::Double(1.0)),
                    Opcode::ILoad1 => self.push(Value::Int(1)),
                    Opcode::DLoadM1 => self.push(Value::Double(-1.0)),
                    Opcode::ILoadM1 => self.push(Value::Int(-1)),

                    Opcode::DAdd => {
                        let (a, b) = self.pop_double_pair()?;
                        self.push(Value::Double(a + b));
                    }
                    Opcode::DSub => {
                        let (a, b) = self.pop_double_pair()?;
                        self.push(Value::Double(a - b));
                    }
                    Opcode::DMul => {
                        let (a, b) = self.pop_double_pair()?;
                        self.push(Value::Double(a * b));
                    }
                    Opcode::DDiv => {
                        let (a, b) = self.pop_double_pair()?;
                        self.push(Value::Double(a / b));
                    }
                    Opcode::IAdd => {
                        let (a, b) = self.pop_int_pair()?;
                        self.push(Value::Int(a.wrapping_add(b)));
                    }
                    Opcode::ISub => {
                        let (a, b) = self.pop_int_pair()?;
                        self.push(Value::Int(a.wrapping_sub(b)));
                    }
                    Opcode::IMul => {
                        let (a, b) = self.pop_int_pair()?;
                        self.push(Value::Int(a.wrapping_mul(b)));
                    }
                    Opcode::IDiv => {
                        let (a, b) = self.pop_int_pair()?;
                        if b == 0 {
                            return Err(VmError::DivisionByZero);
                        }
                        self.push(Value::Int(a.wrapping_div(b)));
                    }
                    Opcode::IMod => {
                        let (a, b) = self.pop_int_pair()?;
                        if b == 0 {
                            return Err(VmError::DivisionByZero);
                        }
                        self.push(Value::Int(a.wrapping_rem(b)));
                    }
                    Opcode::DNeg => {
                        let d = self.pop_double()?;
                        self.push(Value::Double(-d));
                    }
                    Opcode::INeg => {
                        let i = self.pop_int()?;
                        self.push(Value::Int(i.wrapping_neg()));
                    }
                    Opcode::IAOr => {
                        let (a, b) = self.pop_int_pair()?;
                        self.push(Value::Int(a | b));
                    }
                    Opcode::IAAnd => {
                        let (a, b) = self.pop_int_pair()?;
                        self.push(Value::Int(a & b));
                    }
                    Opcode::IAXor => {
                        let (a, b) = self.pop_int_pair()?;
                        self.push(Value::Int(a ^ b));
                    }

                    Opcode::IPrint => {
                        let v = self.pop_typed(VarType::Int)?;
                        self.write_value(v)?;
                    }
                    Opcode::DPrint => {
                        let v = self.pop_typed(VarType::Double)?;
                        self.write_value(v)?;
                    }
                    Opcode::SPrint => {
                        let v = self.pop_typed(VarType::String)?;
                        self.write_value(v)?;
                    }
                    Opcode::Dump => {
                        let v = *self.stack.last().ok_or(VmError::StackUnderflow)?;
                        self.write_value(v)?;
                    }

                    Opcode::I2D => {
                        let i = self.pop_int()?;
                        self.push(Value::Double(i as f64));
                    }
                    Opcode::D2I => {
                        let d = self.pop_double()?;
                        self.push(Value::Int(d as i64));
                    }
                    Opcode::S2I => {
                        let id = self.pop_string()?;
                        let truthy = !self.string(id)?.is_empty();
                        self.push(Value::Int(i64::from(truthy)));
                    }
                    Opcode::Swap => {
                        let upper = self.pop()?;
                        let lower = self.pop()?;
                        self.push(upper);
                        self.push(lower);
                    }
                    Opcode::Pop => {
                        self.pop()?;
                    }

                    Opcode::LoadDVar0 => self.load_local(0, VarType::Double)?,
                    Opcode::LoadDVar1 => self.load_local(1, VarType::Double)?,
                    Opcode::LoadDVar2 => self.load_local(2, VarType::Double)?,
                    Opcode::LoadDVar3 => self.load_local(3, VarType::Double)?,
                    Opcode::LoadIVar0 => self.load_local(0, VarType::Int)?,
                    Opcode::LoadIVar1 => self.load_local(1, VarType::Int)?,
                    Opcode::LoadIVar2 => self.load_local(2, VarType::Int)?,
                    Opcode::LoadIVar3 => self.load_local(3, VarType::Int)?,
                    Opcode::LoadSVar0 => self.load_local(0, VarType::String)?,
                    Opcode::LoadSVar1 => self.load_local(1, VarType::String)?,
                    Opcode::LoadSVar2 => self.load_local(2, VarType::String)?,
                    Opcode::LoadSVar3 => self.load_local(3, VarType::String)?,
                    Opcode::StoreDVar0 => self.store_local(0, VarType::Double)?,
                    Opcode::StoreDVar1 => self.store_local(1, VarType::Double)?,
                    Opcode::StoreDVar2 => self.store_local(2, VarType::Double)?,
                    Opcode::StoreDVar3 => self.store_local(3, VarType::Double)?,
                    Opcode::StoreIVar0 => self.store_local(0, VarType::Int)?,
                    Opcode::StoreIVar1 => self.store_local(1, VarType::Int)?,
                    Opcode::StoreIVar2 => self.store_local(2, VarType::Int)?,
                    Opcode::StoreIVar3 => self.store_local(3, VarType::Int)?,
                    Opcode::StoreSVar0 => self.store_local(0, VarType::String)?,
                    Opcode::StoreSVar1 => self.store_local(1, VarType::String)?,
                    Opcode::StoreSVar2 => self.store_local(2, VarType::String)?,
                    Opcode::StoreSVar3 => self.store_local(3, VarType::String)?,
                    Opcode::LoadDVar => self.load_local(u16_at(arg)?, VarType::Double)?,
                    Opcode::LoadIVar => self.load_local(u16_at(arg)?, VarType::Int)?,
                    Opcode::LoadSVar => self.load_local(u16_at(arg)?, VarType::String)?,
                    Opcode::StoreDVar => self.store_local(u16_at(arg)?, VarType::Double)?,
                    Opcode::StoreIVar => self.store_local(u16_at(arg)?, VarType::Int)?,
                    Opcode::StoreSVar => self.store_local(u16_at(arg)?, VarType::String)?,
                    Opcode::LoadCtxDVar => self.load_context(u16_at(arg)?, u16_at(arg + 2)?, VarType::Double)?,
                    Opcode::LoadCtxIVar => self.load_context(u16_at(arg)?, u16_at(arg + 2)?, VarType::Int)?,
                    Opcode::LoadCtxSVar => self.load_context(u16_at(arg)?, u16_at(arg + 2)?, VarType::String)?,
                    Opcode::StoreCtxDVar => self.store_context(u16_at(arg)?, u16_at(arg + 2)?, VarType::Double)?,
                    Opcode::StoreCtxIVar => self.store_context(u16_at(arg)?, u16_at(arg + 2)?, VarType::Int)?,
                    Opcode::StoreCtxSVar => self.store_context(u16_at(arg)?, u16_at(arg + 2)?, VarType::String)?,

                    Opcode::DCmp => {
                        let (a, b) = self.pop_double_pair()?;
                        let sign = if a < b { -1 } else if a > b { 1 } else { 0 };
                        self.push(Value::Int(sign));
                    }
                    Opcode::ICmp => {
                        let (a, b) = self.pop_int_pair()?;
                        self.push(Value::Int(a.cmp(&b) as i64));
                    }

                    Opcode::Ja
                    | Opcode::IfICmpNe
                    | Opcode::IfICmpE
                    | Opcode::IfICmpG
                    | Opcode::IfICmpGe
                    | Opcode::IfICmpL
                    | Opcode::IfICmpLe => {
                        let offset = code.read_int16(arg).ok_or(VmError::TruncatedInstruction)?;
                        let taken = if op == Opcode::Ja {
                            true
                        } else {
                            let (a, b) = self.pop_int_pair()?;
                            match op {
                                Opcode::IfICmpNe => a != b,
                                Opcode::IfICmpE => a == b,
                                Opcode::IfICmpG => a > b,
                                Opcode::IfICmpGe => a >= b,
                                Opcode::IfICmpL => a < b,
                                _ => a <= b,
                            }
                        };
                        if taken {
                            let target = i64::from(arg) + 2 + i64::from(offset);
                            self.ip = u32::try_from(target)
                                .ok()
                                .filter(|&t| (t as usize) < code.len())
                                .ok_or(VmError::BranchOutOfRange(target))?;
                        }
                    }

                    Opcode::Stop => return Ok(()),
                    Opcode::Break => {}
                    Opcode::Call => {
                        let id = u16_at(arg)?;
                        self.enter(id, Some((self.function, self.ip)))?;
                        break;
                    }
                    Opcode::CallNative => self.call_native(u16_at(arg)?)?,
                    Opcode::Return => {
                        if !self.leave() {
                            return Ok(());
                        }
                        break;
                    }
                }
            }
        }
    }
}
