//! Instruction set and the per-function bytecode buffer.
//!
//! An instruction is one opcode byte followed by fixed-width little-endian
//! operands:
//!
//! ```text
//! DLOAD/ILOAD          [op][8-byte f64 / i64]
//! SLOAD/CALL/CALLNATIVE/LOAD*VAR/STORE*VAR
//!                      [op][2-byte u16 id]
//! LOADCTX*/STORECTX*   [op][2-byte u16 context][2-byte u16 slot]
//! JA/IFICMP*           [op][2-byte i16 offset]
//! everything else      [op]
//! ```
//!
//! Branch offsets are relative to the byte right after the offset field.
//! Binary opcodes pop the upper value (right operand) first, then the lower
//! value (left operand), and compute `lower OP upper`.

pub mod label;
pub use label::{CodeBuilder, Label, LabelError};

macro_rules! bytecodes {
    ($($name:ident = $mnemonic:literal, $len:literal, $doc:literal;)*) => {
        /// Closed opcode catalogue. Discriminants are dense and start at 0.
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $(#[doc = $doc] $name,)*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name,)*];

            /// Total instruction length in bytes (opcode + operands).
            pub const fn length(self) -> usize {
                match self {
                    $(Opcode::$name => $len,)*
                }
            }

            pub const fn name(self) -> &'static str {
                match self {
                    $(Opcode::$name => $mnemonic,)*
                }
            }

            pub fn description(self) -> &'static str {
                match self {
                    $(Opcode::$name => $doc,)*
                }
            }
        }
    };
}

bytecodes! {
    Invalid = "INVALID", 1, "Invalid instruction.";
    DLoad = "DLOAD", 9, "Load double on TOS, inlined into insn stream.";
    ILoad = "ILOAD", 9, "Load int on TOS, inlined into insn stream.";
    SLoad = "SLOAD", 3, "Load string reference on TOS, next two bytes - constant id.";
    DLoad0 = "DLOAD0", 1, "Load double 0 on TOS.";
    ILoad0 = "ILOAD0", 1, "Load int 0 on TOS.";
    SLoad0 = "SLOAD0", 1, "Load empty string on TOS.";
    DLoad1 = "DLOAD1", 1, "Load double 1 on TOS.";
    ILoad1 = "ILOAD1", 1, "Load int 1 on TOS.";
    DLoadM1 = "DLOADM1", 1, "Load double -1 on TOS.";
    ILoadM1 = "ILOADM1", 1, "Load int -1 on TOS.";
    DAdd = "DADD", 1, "Add 2 doubles on TOS, push value back.";
    IAdd = "IADD", 1, "Add 2 ints on TOS, push value back.";
    DSub = "DSUB", 1, "Subtract upper double from lower double, push value back.";
    ISub = "ISUB", 1, "Subtract upper int from lower int, push value back.";
    DMul = "DMUL", 1, "Multiply 2 doubles on TOS, push value back.";
    IMul = "IMUL", 1, "Multiply 2 ints on TOS, push value back.";
    DDiv = "DDIV", 1, "Divide lower double by upper double, push value back.";
    IDiv = "IDIV", 1, "Divide lower int by upper int, push value back.";
    IMod = "IMOD", 1, "Remainder of lower int divided by upper int, push value back.";
    DNeg = "DNEG", 1, "Negate double on TOS.";
    INeg = "INEG", 1, "Negate int on TOS.";
    IAOr = "IAOR", 1, "Arithmetic OR of 2 ints on TOS, push value back.";
    IAAnd = "IAAND", 1, "Arithmetic AND of 2 ints on TOS, push value back.";
    IAXor = "IAXOR", 1, "Arithmetic XOR of 2 ints on TOS, push value back.";
    IPrint = "IPRINT", 1, "Pop and print integer TOS.";
    DPrint = "DPRINT", 1, "Pop and print double TOS.";
    SPrint = "SPRINT", 1, "Pop and print string TOS.";
    I2D = "I2D", 1, "Convert int on TOS to double.";
    D2I = "D2I", 1, "Convert double on TOS to int.";
    S2I = "S2I", 1, "Convert string on TOS to int: 1 if non-empty, 0 otherwise.";
    Swap = "SWAP", 1, "Swap 2 topmost values.";
    Pop = "POP", 1, "Remove topmost value.";
    LoadDVar0 = "LOADDVAR0", 1, "Load double from variable 0, push on TOS.";
    LoadDVar1 = "LOADDVAR1", 1, "Load double from variable 1, push on TOS.";
    LoadDVar2 = "LOADDVAR2", 1, "Load double from variable 2, push on TOS.";
    LoadDVar3 = "LOADDVAR3", 1, "Load double from variable 3, push on TOS.";
    LoadIVar0 = "LOADIVAR0", 1, "Load int from variable 0, push on TOS.";
    LoadIVar1 = "LOADIVAR1", 1, "Load int from variable 1, push on TOS.";
    LoadIVar2 = "LOADIVAR2", 1, "Load int from variable 2, push on TOS.";
    LoadIVar3 = "LOADIVAR3", 1, "Load int from variable 3, push on TOS.";
    LoadSVar0 = "LOADSVAR0", 1, "Load string from variable 0, push on TOS.";
    LoadSVar1 = "LOADSVAR1", 1, "Load string from variable 1, push on TOS.";
    LoadSVar2 = "LOADSVAR2", 1, "Load string from variable 2, push on TOS.";
    LoadSVar3 = "LOADSVAR3", 1, "Load string from variable 3, push on TOS.";
    StoreDVar0 = "STOREDVAR0", 1, "Pop TOS and store to double variable 0.";
    StoreDVar1 = "STOREDVAR1", 1, "Pop TOS and store to double variable 1.";
    StoreDVar2 = "STOREDVAR2", 1, "Pop TOS and store to double variable 2.";
    StoreDVar3 = "STOREDVAR3", 1, "Pop TOS and store to double variable 3.";
    StoreIVar0 = "STOREIVAR0", 1, "Pop TOS and store to int variable 0.";
    StoreIVar1 = "STOREIVAR1", 1, "Pop TOS and store to int variable 1.";
    StoreIVar2 = "STOREIVAR2", 1, "Pop TOS and store to int variable 2.";
    StoreIVar3 = "STOREIVAR3", 1, "Pop TOS and store to int variable 3.";
    StoreSVar0 = "STORESVAR0", 1, "Pop TOS and store to string variable 0.";
    StoreSVar1 = "STORESVAR1", 1, "Pop TOS and store to string variable 1.";
    StoreSVar2 = "STORESVAR2", 1, "Pop TOS and store to string variable 2.";
    StoreSVar3 = "STORESVAR3", 1, "Pop TOS and store to string variable 3.";
    LoadDVar = "LOADDVAR", 3, "Load double from variable, whose 2-byte id is inlined to insn stream, push on TOS.";
    LoadIVar = "LOADIVAR", 3, "Load int from variable, whose 2-byte id is inlined to insn stream, push on TOS.";
    LoadSVar = "LOADSVAR", 3, "Load string from variable, whose 2-byte id is inlined to insn stream, push on TOS.";
    StoreDVar = "STOREDVAR", 3, "Pop TOS and store to double variable, whose 2-byte id is inlined to insn stream.";
    StoreIVar = "STOREIVAR", 3, "Pop TOS and store to int variable, whose 2-byte id is inlined to insn stream.";
    StoreSVar = "STORESVAR", 3, "Pop TOS and store to string variable, whose 2-byte id is inlined to insn stream.";
    LoadCtxDVar = "LOADCTXDVAR", 5, "Load double from variable, whose 2-byte context and 2-byte id are inlined to insn stream, push on TOS.";
    LoadCtxIVar = "LOADCTXIVAR", 5, "Load int from variable, whose 2-byte context and 2-byte id are inlined to insn stream, push on TOS.";
    LoadCtxSVar = "LOADCTXSVAR", 5, "Load string from variable, whose 2-byte context and 2-byte id are inlined to insn stream, push on TOS.";
    StoreCtxDVar = "STORECTXDVAR", 5, "Pop TOS and store to double variable, whose 2-byte context and 2-byte id are inlined to insn stream.";
    StoreCtxIVar = "STORECTXIVAR", 5, "Pop TOS and store to int variable, whose 2-byte context and 2-byte id are inlined to insn stream.";
    StoreCtxSVar = "STORECTXSVAR", 5, "Pop TOS and store to string variable, whose 2-byte context and 2-byte id are inlined to insn stream.";
    DCmp = "DCMP", 1, "Compare 2 topmost doubles, pushing sign(lower - upper) as integer.";
    ICmp = "ICMP", 1, "Compare 2 topmost ints, pushing sign(lower - upper) as integer.";
    Ja = "JA", 3, "Jump always, next two bytes - signed offset of jump destination.";
    IfICmpNe = "IFICMPNE", 3, "Pop two ints and jump if lower != upper, next two bytes - signed offset.";
    IfICmpE = "IFICMPE", 3, "Pop two ints and jump if lower == upper, next two bytes - signed offset.";
    IfICmpG = "IFICMPG", 3, "Pop two ints and jump if lower > upper, next two bytes - signed offset.";
    IfICmpGe = "IFICMPGE", 3, "Pop two ints and jump if lower >= upper, next two bytes - signed offset.";
    IfICmpL = "IFICMPL", 3, "Pop two ints and jump if lower < upper, next two bytes - signed offset.";
    IfICmpLe = "IFICMPLE", 3, "Pop two ints and jump if lower <= upper, next two bytes - signed offset.";
    Dump = "DUMP", 1, "Print value on TOS, without removing it.";
    Stop = "STOP", 1, "Stop execution.";
    Call = "CALL", 3, "Call function, next two bytes - unsigned function id.";
    CallNative = "CALLNATIVE", 3, "Call native function, next two bytes - unsigned native table id.";
    Return = "RETURN", 1, "Return to call location.";
    Break = "BREAK", 1, "Breakpoint for the debugger.";
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Option<Opcode> {
        Self::ALL.get(byte as usize).copied()
    }

    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Opcode::Ja
                | Opcode::IfICmpNe
                | Opcode::IfICmpE
                | Opcode::IfICmpG
                | Opcode::IfICmpGe
                | Opcode::IfICmpL
                | Opcode::IfICmpLe
        )
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── Bytecode buffer ─────────────────────────────────────────────────

/// Append-only instruction stream of one function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bytecode {
    data: Vec<u8>,
}

impl Bytecode {
    pub fn new() -> Self {
        Bytecode { data: Vec::new() }
    }

    pub fn add_insn(&mut self, op: Opcode) {
        self.data.push(op as u8);
    }

    pub fn add_int64(&mut self, value: i64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn add_double(&mut self, value: f64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn add_uint16(&mut self, value: u16) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn add_int16(&mut self, value: i16) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    /// Position the next byte will be written at.
    pub fn current(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Decodes the opcode at `pos`; `Err(byte)` for an unknown byte.
    pub fn opcode_at(&self, pos: u32) -> Option<Result<Opcode, u8>> {
        let byte = *self.data.get(pos as usize)?;
        Some(Opcode::from_byte(byte).ok_or(byte))
    }

    fn read<const N: usize>(&self, pos: u32) -> Option<[u8; N]> {
        let start = pos as usize;
        self.data.get(start..start + N)?.try_into().ok()
    }

    pub fn read_int64(&self, pos: u32) -> Option<i64> {
        self.read(pos).map(i64::from_le_bytes)
    }

    pub fn read_double(&self, pos: u32) -> Option<f64> {
        self.read(pos).map(f64::from_le_bytes)
    }

    pub fn read_uint16(&self, pos: u32) -> Option<u16> {
        self.read(pos).map(u16::from_le_bytes)
    }

    pub fn read_int16(&self, pos: u32) -> Option<i16> {
        self.read(pos).map(i16::from_le_bytes)
    }

    /// Overwrites a previously written 16-bit operand. Only labels do this.
    pub(crate) fn patch_int16(&mut self, pos: u32, value: i16) {
        let start = pos as usize;
        self.data[start..start + 2].copy_from_slice(&value.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcodes_are_dense_from_zero() {
        for (i, op) in Opcode::ALL.iter().enumerate() {
            assert_eq!(*op as usize, i, "{op} out of place");
            assert_eq!(Opcode::from_byte(i as u8), Some(*op));
        }
        assert_eq!(Opcode::from_byte(Opcode::ALL.len() as u8), None);
        assert_eq!(Opcode::from_byte(0xFF), None);
    }

    #[test]
    fn operand_widths() {
        assert_eq!(Opcode::ILoad.length(), 1 + 8);
        assert_eq!(Opcode::DLoad.length(), 1 + 8);
        assert_eq!(Opcode::SLoad.length(), 1 + 2);
        assert_eq!(Opcode::LoadIVar.length(), 1 + 2);
        assert_eq!(Opcode::StoreCtxSVar.length(), 1 + 2 + 2);
        assert_eq!(Opcode::CallNative.length(), 1 + 2);
        assert_eq!(Opcode::IAdd.length(), 1);
        for op in Opcode::ALL.iter().filter(|op| op.is_branch()) {
            assert_eq!(op.length(), 3, "{op}");
        }
    }

    #[test]
    fn names_match_mnemonics() {
        assert_eq!(Opcode::IfICmpGe.name(), "IFICMPGE");
        assert_eq!(Opcode::LoadCtxDVar.to_string(), "LOADCTXDVAR");
        assert!(Opcode::S2I.description().contains("non-empty"));
    }

    #[test]
    fn operands_are_little_endian() {
        let mut bc = Bytecode::new();
        bc.add_insn(Opcode::ILoad);
        bc.add_int64(-2);
        bc.add_insn(Opcode::DLoad);
        bc.add_double(2.5);
        bc.add_insn(Opcode::LoadCtxIVar);
        bc.add_uint16(0x0102);
        bc.add_uint16(7);

        assert_eq!(bc.len(), 9 + 9 + 5);
        assert_eq!(bc.as_bytes()[1], 0xFE);
        assert_eq!(bc.read_int64(1), Some(-2));
        assert_eq!(bc.read_double(10), Some(2.5));
        assert_eq!(bc.as_bytes()[19], 0x02);
        assert_eq!(bc.read_uint16(19), Some(0x0102));
        assert_eq!(bc.read_uint16(21), Some(7));
    }

    #[test]
    fn reads_past_end_are_none() {
        let mut bc = Bytecode::new();
        bc.add_insn(Opcode::SLoad);
        bc.add_uint16(3);
        assert_eq!(bc.read_uint16(2), None);
        assert_eq!(bc.read_int64(0), None);
        assert!(bc.opcode_at(3).is_none());
    }

    #[test]
    fn unknown_opcode_byte_reported() {
        let mut bc = Bytecode::new();
        bc.add_uint16(0xFFFF);
        assert_eq!(bc.opcode_at(0), Some(Err(0xFF)));
    }
}
