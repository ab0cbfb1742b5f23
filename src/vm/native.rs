//! Calls into functions compiled outside the language.
//!
//! Every native is invoked through one fixed C signature with six integer
//! and eight double parameters. Integer-class arguments (ints, string
//! pointers) fill the integer registers in order and doubles fill the
//! floating-point registers, which is where both the System V x86-64 and the
//! AAPCS64 conventions place them; unused registers are ignored by the callee.

use std::ffi::{CStr, CString, c_char};

use crate::ast::VarType;
use crate::program::{NativeFunction, NativeSignature};

pub const MAX_INT_ARGS: usize = 6;
pub const MAX_DOUBLE_ARGS: usize = 8;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NativeError {
    #[error("native calls are not supported on this target")]
    UnsupportedTarget,
    #[error("native symbol '{0}' not found")]
    Unresolved(String),
    #[error("native '{symbol}' takes {count} integer/string arguments, at most {MAX_INT_ARGS} are supported")]
    TooManyIntArgs { symbol: String, count: usize },
    #[error("native '{symbol}' takes {count} double arguments, at most {MAX_DOUBLE_ARGS} are supported")]
    TooManyDoubleArgs { symbol: String, count: usize },
    #[error("native '{symbol}' declares a void parameter")]
    VoidParameter { symbol: String },
    #[error("native '{symbol}' expected {expected} argument(s), got {got}")]
    ArgumentCount { symbol: String, expected: usize, got: usize },
    #[error("native '{symbol}' argument {index} is not {expected}")]
    ArgumentType { symbol: String, index: usize, expected: VarType },
    #[error("string passed to native '{symbol}' contains a NUL byte")]
    InteriorNul { symbol: String },
}

// ── Symbol resolution ────────────────────────────────────────────────

/// Maps a symbol name to the address of a callable C function.
pub trait SymbolResolver {
    fn resolve(&self, symbol: &str) -> Option<usize>;
}

impl<F> SymbolResolver for F
where
    F: Fn(&str) -> Option<usize>,
{
    fn resolve(&self, symbol: &str) -> Option<usize> {
        self(symbol)
    }
}

/// Looks symbols up in the running process with `dlsym(RTLD_DEFAULT, ..)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DynamicResolver;

impl SymbolResolver for DynamicResolver {
    #[cfg(unix)]
    fn resolve(&self, symbol: &str) -> Option<usize> {
        let name = CString::new(symbol).ok()?;
        // SAFETY: `name` is a valid NUL-terminated string for the duration of the call.
        let ptr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
        if ptr.is_null() { None } else { Some(ptr as usize) }
    }

    #[cfg(not(unix))]
    fn resolve(&self, _symbol: &str) -> Option<usize> {
        None
    }
}

pub fn is_supported() -> bool {
    cfg!(all(any(target_arch = "x86_64", target_arch = "aarch64"), not(windows)))
}

/// Rejects signatures that cannot be passed in registers.
pub fn check_signature(symbol: &str, signature: &NativeSignature) -> Result<(), NativeError> {
    if !is_supported() {
        return Err(NativeError::UnsupportedTarget);
    }
    let mut ints = 0;
    let mut doubles = 0;
    for ty in &signature.params {
        match ty {
            VarType::Int | VarType::String => ints += 1,
            VarType::Double => doubles += 1,
            VarType::Void => return Err(NativeError::VoidParameter { symbol: symbol.to_string() }),
        }
    }
    if ints > MAX_INT_ARGS {
        return Err(NativeError::TooManyIntArgs { symbol: symbol.to_string(), count: ints });
    }
    if doubles > MAX_DOUBLE_ARGS {
        return Err(NativeError::TooManyDoubleArgs { symbol: symbol.to_string(), count: doubles });
    }
    Ok(())
}

// ── Invocation ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum NativeValue {
    Void,
    Int(i64),
    Double(f64),
    Str(String),
}

type IntFn = unsafe extern "C" fn(i64, i64, i64, i64, i64, i64, f64, f64, f64, f64, f64, f64, f64, f64) -> i64;
type DoubleFn = unsafe extern "C" fn(i64, i64, i64, i64, i64, i64, f64, f64, f64, f64, f64, f64, f64, f64) -> f64;

/// Calls `native` with `args` and converts the result to its declared type.
///
/// # Safety
///
/// `native.address` must point to a C function whose parameters and return
/// type match `native.signature` under the platform calling convention.
pub unsafe fn invoke(native: &NativeFunction, args: &[NativeValue]) -> Result<NativeValue, NativeError> {
    let signature = &native.signature;
    check_signature(&native.name, signature)?;
    if args.len() != signature.params.len() {
        return Err(NativeError::ArgumentCount {
            symbol: native.name.clone(),
            expected: signature.params.len(),
            got: args.len(),
        });
    }

    let mut ints = [0i64; MAX_INT_ARGS];
    let mut doubles = [0f64; MAX_DOUBLE_ARGS];
    let (mut ni, mut nd) = (0, 0);
    // Owns the C copies of string arguments until the call returns.
    let mut c_strings = Vec::new();
    for (index, (arg, ty)) in args.iter().zip(&signature.params).enumerate() {
        match (ty, arg) {
            (VarType::Int, NativeValue::Int(v)) => {
                ints[ni] = *v;
                ni += 1;
            }
            (VarType::Double, NativeValue::Double(v)) => {
                doubles[nd] = *v;
                nd += 1;
            }
            (VarType::String, NativeValue::Str(s)) => {
                let c = CString::new(s.as_str())
                    .map_err(|_| NativeError::InteriorNul { symbol: native.name.clone() })?;
                ints[ni] = c.as_ptr() as i64;
                ni += 1;
                c_strings.push(c);
            }
            _ => {
                return Err(NativeError::ArgumentType { symbol: native.name.clone(), index, expected: *ty });
            }
        }
    }
    if native.address == 0 {
        return Err(NativeError::Unresolved(native.name.clone()));
    }

    let [i0, i1, i2, i3, i4, i5] = ints;
    let [d0, d1, d2, d3, d4, d5, d6, d7] = doubles;
    let result = match signature.return_type {
        VarType::Double => {
            // SAFETY: the caller guarantees the address is a function of this shape.
            let f = unsafe { std::mem::transmute::<usize, DoubleFn>(native.address) };
            NativeValue::Double(unsafe { f(i0, i1, i2, i3, i4, i5, d0, d1, d2, d3, d4, d5, d6, d7) })
        }
        ret => {
            // SAFETY: as above; int, pointer and void returns all come back in the integer register.
            let f = unsafe { std::mem::transmute::<usize, IntFn>(native.address) };
            let raw = unsafe { f(i0, i1, i2, i3, i4, i5, d0, d1, d2, d3, d4, d5, d6, d7) };
            match ret {
                VarType::Int => NativeValue::Int(raw),
                // SAFETY: a string-returning native hands back NULL or a NUL-terminated string.
                VarType::String => NativeValue::Str(unsafe { string_from_raw(raw as *const c_char) }),
                _ => NativeValue::Void,
            }
        }
    };
    drop(c_strings);
    Ok(result)
}

unsafe fn string_from_raw(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    // SAFETY: non-null and NUL-terminated per the caller.
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}
