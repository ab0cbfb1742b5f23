use super::{Bytecode, Opcode};

/// Handle to a branch target owned by a [`CodeBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

impl Label {
    pub fn index(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LabelError {
    #[error("label {0} bound twice")]
    AlreadyBound(u32),
    #[error("label {0} is referenced but never bound")]
    Unbound(u32),
    #[error("branch at {site} cannot reach {target}: offset exceeds 16 bits")]
    JumpTooFar { site: u32, target: u32 },
    #[error("{0} is not a branch instruction")]
    NotABranch(Opcode),
}

#[derive(Debug, Default)]
struct LabelSlot {
    bound: Option<u32>,
    /// Offset-field positions waiting for this label.
    patch_sites: Vec<u32>,
}

/// Bytecode buffer plus the labels branching into it.
///
/// Branches to unbound labels write a zero placeholder and record the
/// placeholder position; [`CodeBuilder::bind`] rewrites every recorded site.
/// Labels never reach the VM.
#[derive(Debug, Default)]
pub struct CodeBuilder {
    code: Bytecode,
    labels: Vec<LabelSlot>,
}

impl CodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open label, to be bound later (forward reference).
    pub fn new_label(&mut self) -> Label {
        self.labels.push(LabelSlot::default());
        Label(self.labels.len() as u32 - 1)
    }

    /// Label already bound to the current position (backward reference).
    pub fn label_here(&mut self) -> Label {
        let pos = self.code.current();
        self.labels.push(LabelSlot { bound: Some(pos), patch_sites: Vec::new() });
        Label(self.labels.len() as u32 - 1)
    }

    pub fn add_insn(&mut self, op: Opcode) {
        self.code.add_insn(op);
    }

    pub fn add_int64(&mut self, value: i64) {
        self.code.add_int64(value);
    }

    pub fn add_double(&mut self, value: f64) {
        self.code.add_double(value);
    }

    pub fn add_uint16(&mut self, value: u16) {
        self.code.add_uint16(value);
    }

    pub fn current(&self) -> u32 {
        self.code.current()
    }

    pub fn code(&self) -> &Bytecode {
        &self.code
    }

    /// Emits `op` with a 16-bit offset pointing at `label`.
    pub fn add_branch(&mut self, op: Opcode, label: Label) -> Result<(), LabelError> {
        if !op.is_branch() {
            return Err(LabelError::NotABranch(op));
        }
        self.code.add_insn(op);
        let site = self.code.current();
        let slot = &mut self.labels[label.0 as usize];
        match slot.bound {
            Some(target) => {
                let offset = relative_offset(site, target)?;
                self.code.add_int16(offset);
            }
            None => {
                slot.patch_sites.push(site);
                self.code.add_int16(0);
            }
        }
        Ok(())
    }

    /// Binds `label` to the current position and patches every pending site.
    pub fn bind(&mut self, label: Label) -> Result<(), LabelError> {
        let target = self.code.current();
        let slot = &mut self.labels[label.0 as usize];
        if slot.bound.is_some() {
            return Err(LabelError::AlreadyBound(label.0));
        }
        slot.bound = Some(target);
        for site in std::mem::take(&mut slot.patch_sites) {
            let offset = relative_offset(site, target)?;
            self.code.patch_int16(site, offset);
        }
        Ok(())
    }

    /// Hands over the finished bytecode; fails if any branch is still dangling.
    pub fn finish(self) -> Result<Bytecode, LabelError> {
        if let Some(i) = self
            .labels
            .iter()
            .position(|slot| slot.bound.is_none() && !slot.patch_sites.is_empty())
        {
            return Err(LabelError::Unbound(i as u32));
        }
        Ok(self.code)
    }
}

fn relative_offset(site: u32, target: u32) -> Result<i16, LabelError> {
    let offset = i64::from(target) - (i64::from(site) + 2);
    i16::try_from(offset).map_err(|_| LabelError::JumpTooFar { site, target })
}
