//! Operand types for the target IR (spec §3: Register, Immediate, Memory, Label).

use crate::cfg::BlockId;

/// Which pool a register instance belongs to. Converting `Virtual` to `Machine` is the
/// register allocator's job; converting to `Spill` is the spiller's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterSpace {
    /// An infinite pool produced by lowering; must be allocated before emission.
    Virtual,
    /// A target physical register.
    Machine,
    /// Has been assigned a stack slot; must never reach the emitter as an operand.
    Spill,
    /// A target vector/XMM-class physical register.
    Xmm,
}

/// A register instance: `(space, name, SSA version)` per spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Register {
    pub space: RegisterSpace,
    pub name: u32,
    pub version: u32,
}

impl Register {
    pub fn virtual_reg(name: u32) -> Self {
        Register { space: RegisterSpace::Virtual, name, version: 0 }
    }

    pub fn machine(name: u32) -> Self {
        Register { space: RegisterSpace::Machine, name, version: 0 }
    }

    pub fn spill(name: u32) -> Self {
        Register { space: RegisterSpace::Spill, name, version: 0 }
    }

    pub fn is_virtual(&self) -> bool {
        self.space == RegisterSpace::Virtual
    }

    pub fn is_machine(&self) -> bool {
        self.space == RegisterSpace::Machine
    }
}

bitflags::bitflags! {
    /// Which fields of a [`Memory`] operand are present/meaningful.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AddrFlags: u8 {
        const BASE = 1 << 0;
        const INDEX = 1 << 1;
        const DISPL = 1 << 2;
        const SCALE = 1 << 3;
    }
}

/// A memory operand: `[base + index * scale + displ]`, with `scale` interpreted as
/// 1/2/4/8 per spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Memory {
    pub base: Option<Register>,
    pub index: Option<Register>,
    /// 0..3, meaning scale factor 1/2/4/8.
    pub scale: u8,
    pub displacement: i32,
    pub flags: AddrFlags,
}

impl Memory {
    pub fn base_displ(base: Register, displacement: i32) -> Self {
        Memory {
            base: Some(base),
            index: None,
            scale: 0,
            displacement,
            flags: AddrFlags::BASE | AddrFlags::DISPL,
        }
    }

    /// The scale factor this operand applies to `index` (1, 2, 4, or 8).
    pub fn scale_factor(&self) -> u32 {
        1u32 << self.scale
    }
}

/// One operand of a target-IR instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Register(Register),
    /// Up to a 64-bit immediate.
    Immediate(i64),
    Memory(Memory),
    /// A branch/call target, named by the block it points to; resolved to a concrete
    /// address only during emission.
    Label(BlockId),
}

impl Operand {
    pub fn as_register(&self) -> Option<Register> {
        match self {
            Operand::Register(r) => Some(*r),
            Operand::Memory(m) => m.base.or(m.index),
            _ => None,
        }
    }

    /// Every register this operand reads or names, for liveness/interference
    /// accounting. A `Memory` operand can carry both a base and an index register at
    /// once, unlike [`Operand::as_register`] which only ever exposes one of them.
    pub fn registers(&self) -> impl Iterator<Item = Register> {
        let (a, b) = match self {
            Operand::Register(r) => (Some(*r), None),
            Operand::Memory(m) => (m.base, m.index),
            Operand::Immediate(_) | Operand::Label(_) => (None, None),
        };
        a.into_iter().chain(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_operand_exposes_register_for_liveness() {
        let base = Register::virtual_reg(3);
        let mem = Operand::Memory(Memory::base_displ(base, 8));
        assert_eq!(mem.as_register(), Some(base));
    }

    #[test]
    fn memory_operand_with_base_and_index_exposes_both_for_liveness() {
        let base = Register::machine(1);
        let index = Register::virtual_reg(9);
        let mem = Operand::Memory(Memory { base: Some(base), index: Some(index), scale: 0, displacement: 0, flags: AddrFlags::BASE | AddrFlags::INDEX });
        assert_eq!(mem.registers().collect::<Vec<_>>(), vec![base, index]);
    }

    #[test]
    fn scale_factor_matches_spec_encoding() {
        let mem = Memory { base: None, index: None, scale: 3, displacement: 0, flags: AddrFlags::SCALE };
        assert_eq!(mem.scale_factor(), 8);
    }
}
