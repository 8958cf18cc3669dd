//! Target-independent instruction IR produced by lowering and consumed by the
//! register allocator, spiller, trace builder and emitter.
//!
//! An [`Instr`] is a tagged opcode plus up to two operands, matching the Design Note's
//! "tagged variant instead of deep inheritance" resolution: per-target behaviour lives
//! in dispatch tables indexed by [`TargetOp`] (see `crate::targets`), not in virtual
//! methods on a class hierarchy.

pub mod operand;

pub use operand::{AddrFlags, Memory, Operand, Register, RegisterSpace};

use crate::cfg::BlockId;

/// A target-IR opcode. Distinct from `crate::opcode::OpcodeDescriptor`, which
/// describes NetIL bytecode opcodes; this is the lowered instruction set the emitter
/// encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetOp {
    Mov,
    Load { width: Width, signed: bool },
    Store { width: Width },
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    And,
    Or,
    Xor,
    Not,
    Shl,
    Shr,
    Sar,
    Cmp,
    /// Unconditional jump to the block named by the sole `Operand::Label`.
    Jmp,
    /// Conditional jump; the condition is implied by the preceding `Cmp`.
    Jcc(Condition),
    Call,
    Ret,
    /// A bounds check: trap if the index operand is `>=` the length operand.
    BoundsCheck,
    /// Indirect call into a coprocessor's `invoke(op_id)` entry point.
    CoprocessorInvoke,
    /// A dense jump-table dispatch; `switch_entry` on the `Instr` names the table.
    SwitchDispatch,
    /// A spill-slot reload, inserted by the spiller.
    ReloadSpill,
    /// A spill-slot store, inserted by the spiller.
    StoreSpill,
}

/// Memory-access width for loads and stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    Byte,
    Half,
    Word,
}

/// Branch condition codes, independent of target encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

/// One target-IR instruction: an opcode plus zero to two operands, with the few extra
/// fields emission needs (spec §3's "Target IR" record).
#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    pub op: TargetOp,
    pub operands: Vec<Operand>,
    /// Free-text disassembly annotation, never interpreted.
    pub comment: Option<String>,
    /// Filled in by the emitter once this instruction's address is known.
    pub emission_address: Option<u64>,
    /// For `SwitchDispatch`, the index into the emitter's switch-table list.
    pub switch_entry: Option<u32>,
    /// For `SwitchDispatch`, the case table in encoded order: `(value, target block)`.
    /// The default target is `operands[1]`'s `Operand::Label`.
    pub switch_cases: Vec<(i32, BlockId)>,
    /// Set by lowering when an operand's address must be materialised via a
    /// load-effective-address sequence rather than folded into an addressing mode.
    pub load_current_address: bool,
    /// Set when the emitter chose a table-based (as opposed to compare-and-branch)
    /// encoding for a switch.
    pub binary_switch_jump: bool,
}

impl Instr {
    pub fn new(op: TargetOp, operands: Vec<Operand>) -> Self {
        Instr {
            op,
            operands,
            comment: None,
            emission_address: None,
            switch_entry: None,
            switch_cases: Vec::new(),
            load_current_address: false,
            binary_switch_jump: false,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Registers defined (written) by this instruction. A `Memory` operand can name
    /// both a base and an index register, so this collects eagerly rather than
    /// borrowing through `filter_map`.
    pub fn defs(&self) -> impl Iterator<Item = Register> {
        let mut out = Vec::new();
        for (i, operand) in self.operands.iter().enumerate() {
            if i == 0 && self.op.defines_first_operand() {
                out.extend(operand.registers());
            }
        }
        out.into_iter()
    }

    /// Registers used (read) by this instruction.
    pub fn uses(&self) -> impl Iterator<Item = Register> {
        let mut out = Vec::new();
        for (i, operand) in self.operands.iter().enumerate() {
            let is_def_only = i == 0 && self.op.defines_first_operand() && !self.op.reads_first_operand();
            if !is_def_only {
                out.extend(operand.registers());
            }
        }
        out.into_iter()
    }

    /// The `(src, dst)` pair if this instruction is a register-to-register move,
    /// i.e. a coalescing candidate.
    pub fn as_move(&self) -> Option<(Register, Register)> {
        if self.op != TargetOp::Mov {
            return None;
        }
        let dst = self.operands.first()?.as_register()?;
        let src = self.operands.get(1)?.as_register()?;
        Some((src, dst))
    }

    /// Target block of a `Jmp`/`Jcc`, if any.
    pub fn branch_target(&self) -> Option<BlockId> {
        self.operands.iter().find_map(|o| match o {
            Operand::Label(block) => Some(*block),
            _ => None,
        })
    }
}

impl TargetOp {
    /// Whether this opcode writes its first operand (by convention, dst-first like
    /// `mov dst, src`).
    pub fn defines_first_operand(&self) -> bool {
        !matches!(
            self,
            TargetOp::Jmp
                | TargetOp::Jcc(_)
                | TargetOp::Call
                | TargetOp::Ret
                | TargetOp::Cmp
                | TargetOp::Store { .. }
                | TargetOp::BoundsCheck
                | TargetOp::CoprocessorInvoke
                | TargetOp::SwitchDispatch
                | TargetOp::StoreSpill
        )
    }

    /// Whether this opcode also reads its first operand (e.g. `add dst, src` reads and
    /// writes `dst`). `Mov` does not: it only writes.
    pub fn reads_first_operand(&self) -> bool {
        matches!(
            self,
            TargetOp::Add
                | TargetOp::Sub
                | TargetOp::Mul
                | TargetOp::Div
                | TargetOp::And
                | TargetOp::Or
                | TargetOp::Xor
                | TargetOp::Shl
                | TargetOp::Shr
                | TargetOp::Sar
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mov_is_recognised_as_a_move() {
        let dst = Register::virtual_reg(1);
        let src = Register::virtual_reg(2);
        let instr = Instr::new(TargetOp::Mov, vec![Operand::Register(dst), Operand::Register(src)]);
        assert_eq!(instr.as_move(), Some((src, dst)));
    }

    #[test]
    fn add_defs_and_uses_both_include_dst() {
        let dst = Register::virtual_reg(1);
        let src = Register::virtual_reg(2);
        let instr = Instr::new(TargetOp::Add, vec![Operand::Register(dst), Operand::Register(src)]);
        assert_eq!(instr.defs().collect::<Vec<_>>(), vec![dst]);
        assert_eq!(instr.uses().collect::<Vec<_>>(), vec![dst, src]);
    }

    #[test]
    fn store_to_a_base_plus_index_memory_operand_uses_both_registers() {
        let base = Register::machine(1);
        let index = Register::virtual_reg(7);
        let value = Register::virtual_reg(8);
        let mem = Memory { base: Some(base), index: Some(index), scale: 0, displacement: 0, flags: AddrFlags::BASE | AddrFlags::INDEX };
        let instr = Instr::new(TargetOp::Store { width: Width::Byte }, vec![Operand::Memory(mem), Operand::Register(value)]);
        assert!(instr.defs().collect::<Vec<_>>().is_empty());
        let uses = instr.uses().collect::<Vec<_>>();
        assert!(uses.contains(&base));
        assert!(uses.contains(&index));
        assert!(uses.contains(&value));
    }
}
