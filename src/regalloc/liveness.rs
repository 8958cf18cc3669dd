//! Per-block live-out sets, computed by standard backward data-flow fixpoint.

use std::collections::{HashMap, HashSet};

use crate::cfg::{BlockId, Cfg};
use crate::ir::{Instr, Register};

/// Computes `live_out` for every block in `cfg`. The allocator's build phase replays
/// each block's instructions in reverse starting from this set to get per-instruction
/// liveness without materialising it up front.
pub fn compute(cfg: &Cfg<Instr>) -> HashMap<BlockId, HashSet<Register>> {
    let mut live_in: HashMap<BlockId, HashSet<Register>> = HashMap::new();
    let mut live_out: HashMap<BlockId, HashSet<Register>> = HashMap::new();

    let ids: Vec<BlockId> = cfg.blocks().map(|b| b.id()).collect();
    for &id in &ids {
        live_in.insert(id, HashSet::new());
        live_out.insert(id, HashSet::new());
    }

    let mut changed = true;
    while changed {
        changed = false;
        for &id in ids.iter().rev() {
            let block = cfg.block(id);

            let mut out = HashSet::new();
            for &succ in block.successors() {
                out.extend(live_in[&succ].iter().copied());
            }

            let mut live = out.clone();
            for instr in block.code().iter().rev() {
                for def in instr.defs() {
                    live.remove(&def);
                }
                for u in instr.uses() {
                    live.insert(u);
                }
            }

            if live != live_in[&id] {
                live_in.insert(id, live);
                changed = true;
            }
            if out != live_out[&id] {
                live_out.insert(id, out);
                changed = true;
            }
        }
    }

    live_out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Operand, TargetOp};

    #[test]
    fn value_live_across_a_branch_is_in_live_out() {
        let mut cfg: Cfg<Instr> = Cfg::new();
        let a = cfg.create_block();
        let b = cfg.create_block();
        cfg.add_successor(a, b);

        let r = Register::virtual_reg(0);
        cfg.block_mut(a).code_mut().push(Instr::new(TargetOp::Mov, vec![Operand::Register(r), Operand::Immediate(1)]));
        cfg.block_mut(b).code_mut().push(Instr::new(TargetOp::Ret, vec![Operand::Register(r)]));

        let live_out = compute(&cfg);
        assert!(live_out[&a].contains(&r));
    }
}
