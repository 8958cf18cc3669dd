//! Orders basic blocks into a linear emission trace minimising fall-through jumps.
//!
//! For each block, prefers to emit next whichever successor is the non-taken
//! fall-through of a conditional branch, the sole successor of an unconditional jump,
//! or the in-order fall-through of a switch; everything left over is appended in
//! reverse-postorder, per spec §4.6.

use std::collections::HashSet;

use crate::cfg::{BlockId, Cfg};
use crate::ir::{Instr, TargetOp};

/// The chosen linear order of blocks for one segment.
pub struct Trace {
    pub order: Vec<BlockId>,
}

/// Builds the emission trace for `cfg`, starting from `entry`.
pub fn build(cfg: &Cfg<Instr>, entry: BlockId) -> Trace {
    let mut emitted: HashSet<BlockId> = HashSet::new();
    let mut order = Vec::with_capacity(cfg.block_count());

    let mut current = Some(entry);
    while let Some(block_id) = current {
        if !emitted.insert(block_id) {
            current = next_unemitted_in_rpo(cfg, entry, &emitted);
            continue;
        }
        order.push(block_id);
        current = preferred_successor(cfg, block_id, &emitted).or_else(|| next_unemitted_in_rpo(cfg, entry, &emitted));
    }

    Trace { order }
}

/// The successor most likely taken, per spec §4.6's fall-through preference.
fn preferred_successor(cfg: &Cfg<Instr>, block_id: BlockId, emitted: &HashSet<BlockId>) -> Option<BlockId> {
    let block = cfg.block(block_id);
    let successors = block.successors();

    if successors.is_empty() {
        return None;
    }

    let last_op = block.code().last().map(|i| i.op);
    let preferred = match last_op {
        Some(TargetOp::Jmp) => successors.first().copied(),
        Some(TargetOp::Jcc(_)) => {
            // The fall-through (non-taken) edge is conventionally the one added second
            // by lowering (the branch target is added first); prefer the last.
            successors.last().copied()
        }
        Some(TargetOp::SwitchDispatch) => successors.first().copied(),
        _ => successors.first().copied(),
    };

    preferred.filter(|b| !emitted.contains(b)).or_else(|| successors.iter().find(|b| !emitted.contains(b)).copied())
}

fn next_unemitted_in_rpo(cfg: &Cfg<Instr>, entry: BlockId, emitted: &HashSet<BlockId>) -> Option<BlockId> {
    cfg.reverse_postorder(entry).into_iter().find(|b| !emitted.contains(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Operand;

    #[test]
    fn linear_chain_emits_in_order() {
        let mut cfg: Cfg<Instr> = Cfg::new();
        let a = cfg.create_block();
        let b = cfg.create_block();
        let c = cfg.create_block();
        cfg.add_successor(a, b);
        cfg.add_successor(b, c);
        cfg.block_mut(a).code_mut().push(Instr::new(TargetOp::Jmp, vec![Operand::Label(b)]));
        cfg.block_mut(b).code_mut().push(Instr::new(TargetOp::Jmp, vec![Operand::Label(c)]));

        let trace = build(&cfg, a);
        assert_eq!(trace.order, vec![a, b, c]);
    }

    #[test]
    fn every_block_appears_exactly_once() {
        let mut cfg: Cfg<Instr> = Cfg::new();
        let a = cfg.create_block();
        let b = cfg.create_block();
        let c = cfg.create_block();
        cfg.add_successor(a, b);
        cfg.add_successor(a, c);
        cfg.add_successor(b, c);

        let trace = build(&cfg, a);
        let mut seen = HashSet::new();
        for block in &trace.order {
            assert!(seen.insert(*block), "block {block:?} emitted twice");
        }
        assert_eq!(trace.order.len(), 3);
    }
}
