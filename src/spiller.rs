//! Target-specific spill rewrite pass.
//!
//! Given the set of registers the allocator could not color, assigns each a stack slot
//! and rewrites every use/def into a fresh virtual register reloaded/stored around the
//! instruction, per spec §4.5. The rewritten registers are marked as "new temps" so the
//! next allocator round prefers not to spill them again.

use std::collections::HashMap;

use crate::cfg::Cfg;
use crate::ir::{Instr, Memory, Operand, Register, TargetOp};

/// One spilled register's assigned frame-relative slot.
#[derive(Debug, Clone, Copy)]
pub struct SpillSlot {
    pub register: Register,
    pub offset: i32,
}

/// Result of one spill rewrite pass.
pub struct SpillResult {
    pub slots: Vec<SpillSlot>,
    /// Every freshly introduced virtual register; feed into the next allocator round's
    /// "new temps" set so `select_spill` avoids respilling them.
    pub new_temps: Vec<Register>,
}

const SLOT_SIZE: i32 = 8;

/// Rewrites `cfg` in place, assigning one stack slot per register in `spilled` and
/// inserting reload/store instructions around each use/def. `next_virtual` is the
/// allocator's fresh-register counter, advanced as new temporaries are minted.
pub fn rewrite(cfg: &mut Cfg<Instr>, spilled: &[Register], next_virtual: &mut u32, frame_base: Register) -> SpillResult {
    let mut offset = 0i32;
    let mut slot_of: HashMap<Register, i32> = HashMap::new();
    let mut slots = Vec::with_capacity(spilled.len());
    for &r in spilled {
        offset -= SLOT_SIZE;
        slot_of.insert(r, offset);
        slots.push(SpillSlot { register: r, offset });
    }

    let mut new_temps = Vec::new();
    let block_ids: Vec<_> = cfg.blocks().map(|b| b.id()).collect();

    for id in block_ids {
        let old_code = std::mem::take(cfg.block_mut(id).code_mut());
        let mut new_code = Vec::with_capacity(old_code.len());

        for mut instr in old_code {
            let mut reload_map: HashMap<Register, Register> = HashMap::new();
            let mut pending_stores: Vec<(Register, Register)> = Vec::new();

            for operand in instr.operands.iter_mut() {
                rewrite_operand(
                    operand,
                    &slot_of,
                    &mut reload_map,
                    &mut new_code,
                    next_virtual,
                    &mut new_temps,
                    frame_base,
                );
            }

            // Defs of spilled registers: the operand rewrite above already replaced the
            // register with a fresh temp (reused for both use and def per spec §4.5:
            // "share one R′ per (instruction, R)"); record it so we store after.
            if instr.op.defines_first_operand() {
                if let Some(Operand::Register(new_def)) = instr.operands.first() {
                    if let Some((&orig, _)) = reload_map.iter().find(|(_, &mapped)| mapped == *new_def) {
                        pending_stores.push((orig, *new_def));
                    }
                }
            }

            new_code.push(instr);

            for (orig, temp) in pending_stores {
                let slot = slot_of[&orig];
                let mem = Memory::base_displ(frame_base, slot);
                new_code.push(Instr::new(TargetOp::StoreSpill, vec![Operand::Memory(mem), Operand::Register(temp)]));
            }
        }

        *cfg.block_mut(id).code_mut() = new_code;
    }

    SpillResult { slots, new_temps }
}

fn rewrite_operand(
    operand: &mut Operand,
    slot_of: &HashMap<Register, i32>,
    reload_map: &mut HashMap<Register, Register>,
    new_code: &mut Vec<Instr>,
    next_virtual: &mut u32,
    new_temps: &mut Vec<Register>,
    frame_base: Register,
) {
    if let Operand::Register(r) = operand {
        if let Some(&slot) = slot_of.get(r) {
            let temp = *reload_map.entry(*r).or_insert_with(|| {
                let fresh = Register::virtual_reg(*next_virtual);
                *next_virtual += 1;
                new_temps.push(fresh);
                let mem = Memory::base_displ(frame_base, slot);
                new_code.push(Instr::new(TargetOp::ReloadSpill, vec![Operand::Register(fresh), Operand::Memory(mem)]));
                fresh
            });
            *r = temp;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::Cfg;

    #[test]
    fn spilled_register_gets_a_reload_before_its_use() {
        let mut cfg: Cfg<Instr> = Cfg::new();
        let block = cfg.create_block();
        let spilled_reg = Register::virtual_reg(0);
        let other = Register::virtual_reg(1);
        cfg.block_mut(block)
            .code_mut()
            .push(Instr::new(TargetOp::Add, vec![Operand::Register(other), Operand::Register(spilled_reg)]));

        let mut next_virtual = 2;
        let frame_base = Register::machine(99);
        let result = rewrite(&mut cfg, &[spilled_reg], &mut next_virtual, frame_base);

        assert_eq!(result.slots.len(), 1);
        let code = cfg.block(block).code();
        assert!(code.iter().any(|i| i.op == TargetOp::ReloadSpill));
    }
}
