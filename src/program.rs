use std::collections::HashMap;

use crate::ast::VarType;
use crate::bytecode::Bytecode;

/// Id of the top-level function; always registered first.
pub const TOP_FUNCTION_ID: u16 = 0;

// ── String pool ──────────────────────────────────────────────────────

/// Deduplicated string constants. Id 0 is always the empty string.
#[derive(Debug, Clone)]
pub struct StringPool {
    strings: Vec<String>,
    ids: HashMap<String, u16>,
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}

impl StringPool {
    pub fn new() -> Self {
        let mut ids = HashMap::new();
        ids.insert(String::new(), 0);
        StringPool { strings: vec![String::new()], ids }
    }

    /// Returns the id of `s`, adding it if needed. `None` once ids run out.
    pub fn intern(&mut self, s: &str) -> Option<u16> {
        if let Some(&id) = self.ids.get(s) {
            return Some(id);
        }
        let id = u16::try_from(self.strings.len()).ok()?;
        self.strings.push(s.to_string());
        self.ids.insert(s.to_string(), id);
        Some(id)
    }

    pub fn get(&self, id: u16) -> Option<&str> {
        self.strings.get(id as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.strings.iter().map(String::as_str)
    }
}

// ── Functions ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BytecodeFunction {
    pub id: u16,
    pub name: String,
    pub params: Vec<VarType>,
    pub return_type: VarType,
    /// Declared type of every slot of a frame; parameters come first.
    pub local_types: Vec<VarType>,
    pub bytecode: Bytecode,
}

impl BytecodeFunction {
    pub fn locals_count(&self) -> usize {
        self.local_types.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeSignature {
    pub return_type: VarType,
    pub params: Vec<VarType>,
}

/// Resolved external function, called through `CALLNATIVE`.
#[derive(Debug, Clone)]
pub struct NativeFunction {
    pub name: String,
    pub signature: NativeSignature,
    pub address: usize,
}

/// A variable of the top-level block, visible to `execute` callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopVariable {
    pub name: String,
    pub slot: u16,
    pub ty: VarType,
}

// ── Compiled program ─────────────────────────────────────────────────

/// Output of translation: immutable once built, shared read-only by the VM.
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    /// Indexed by function id; `functions[0]` is the top-level function.
    pub functions: Vec<BytecodeFunction>,
    pub strings: StringPool,
    pub natives: Vec<NativeFunction>,
    pub top_variables: Vec<TopVariable>,
}

impl CompiledProgram {
    pub fn function_by_id(&self, id: u16) -> Option<&BytecodeFunction> {
        self.functions.get(id as usize)
    }

    pub fn function_by_name(&self, name: &str) -> Option<&BytecodeFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn top(&self) -> Option<&BytecodeFunction> {
        self.function_by_id(TOP_FUNCTION_ID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Opcode;

    #[test]
    fn pool_starts_with_empty_string() {
        let pool = StringPool::new();
        assert_eq!(pool.get(0), Some(""));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn pool_deduplicates() {
        let mut pool = StringPool::new();
        let a = pool.intern("hello").unwrap();
        let b = pool.intern("world").unwrap();
        assert_eq!(pool.intern("hello"), Some(a));
        assert_eq!(pool.intern(""), Some(0));
        assert_eq!((a, b), (1, 2));
        assert_eq!(pool.get(b), Some("world"));
        assert_eq!(pool.get(9), None);
    }

    fn sample() -> CompiledProgram {
        let mut strings = StringPool::new();
        let hi = strings.intern("hi\n").unwrap();
        let mut bytecode = Bytecode::new();
        bytecode.add_insn(Opcode::SLoad);
        bytecode.add_uint16(hi);
        bytecode.add_insn(Opcode::SPrint);
        bytecode.add_insn(Opcode::Ja);
        bytecode.add_int16(-6);
        bytecode.add_insn(Opcode::Stop);
        CompiledProgram {
            functions: vec![BytecodeFunction {
                id: TOP_FUNCTION_ID,
                name: "<top>".into(),
                params: vec![],
                return_type: VarType::Void,
                local_types: vec![VarType::Int],
                bytecode,
            }],
            strings,
            natives: vec![],
            top_variables: vec![],
        }
    }

    #[test]
    fn lookup_by_id_and_name() {
        let program = sample();
        assert_eq!(program.top().map(|f| f.locals_count()), Some(1));
        assert!(program.function_by_name("<top>").is_some());
        assert!(program.function_by_name("missing").is_none());
        assert!(program.function_by_id(3).is_none());
    }
}
