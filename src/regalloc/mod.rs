//! Iterative-coalescing graph-coloring register allocator (Chaitin-Briggs / Appel-George).
//!
//! Node- and move-set names follow `gc_regalloc.h` rather than Appel's textbook prose,
//! reimplemented as plain `HashSet`/`Vec` state owned by [`Allocator`] instead of the
//! source's process-wide bit-vectors — one call to [`Allocator::run`] is one outer
//! iteration's worth of build/simplify/coalesce/freeze/spill/assign-colors, with the
//! spiller (`crate::spiller`) invoked by the caller between rounds.

pub mod liveness;

use std::collections::{HashMap, HashSet};

use crate::cfg::Cfg;
use crate::ir::{Instr, Register};

/// Outcome of one allocator round.
pub struct AllocationResult {
    /// Color (machine register number) assigned to every successfully colored node.
    pub colors: HashMap<Register, u32>,
    /// Registers of degree ≥ K that could not be colored this round; the caller's
    /// spiller must rewrite these before the next round.
    pub spilled: Vec<Register>,
    /// `(src, dst)` pairs coalesced into a single register this round; dst is replaced
    /// by src everywhere.
    pub coalesced: Vec<(Register, Register)>,
}

/// Spill cost accumulated per register: `sum(10^loop_depth(block))` over every use and
/// def, per spec §4.4's "Numerical detail."
pub type SpillCosts = HashMap<Register, f64>;

struct Node {
    degree: u32,
    adjacency: HashSet<Register>,
    alias: Option<Register>,
    move_list: HashSet<usize>,
    precolored: Option<u32>,
}

/// One `mov dst, src` candidate for coalescing, indexed into the allocator's move list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoveState {
    Worklist,
    Active,
    Coalesced,
    Constrained,
    Frozen,
}

struct Move {
    src: Register,
    dst: Register,
    state: MoveState,
}

/// Runs iterative-coalescing graph coloring for one target-IR segment.
pub struct Allocator<'a> {
    cfg: &'a Cfg<Instr>,
    k: u32,
    nodes: HashMap<Register, Node>,
    moves: Vec<Move>,

    simplify_worklist: Vec<Register>,
    freeze_worklist: HashSet<Register>,
    spill_worklist: HashSet<Register>,
    spilled_nodes: Vec<Register>,
    coalesced_nodes: Vec<(Register, Register)>,
    colored_nodes: HashSet<Register>,
    select_stack: Vec<Register>,
    new_temps: HashSet<Register>,

    spill_costs: SpillCosts,
}

impl<'a> Allocator<'a> {
    /// Builds the allocator state for `cfg`, targeting `k` colorable machine registers.
    /// `loop_depth` gives each block's nesting depth for spill-cost weighting
    /// (`crate::cfg::Cfg::loop_nesting_depth`).
    pub fn new(cfg: &'a Cfg<Instr>, k: u32, loop_depth: &HashMap<crate::cfg::BlockId, u32>) -> Self {
        let mut allocator = Allocator {
            cfg,
            k,
            nodes: HashMap::new(),
            moves: Vec::new(),
            simplify_worklist: Vec::new(),
            freeze_worklist: HashSet::new(),
            spill_worklist: HashSet::new(),
            spilled_nodes: Vec::new(),
            coalesced_nodes: Vec::new(),
            colored_nodes: HashSet::new(),
            select_stack: Vec::new(),
            new_temps: HashSet::new(),
            spill_costs: HashMap::new(),
        };
        allocator.build(loop_depth);
        allocator.make_worklist();
        allocator
    }

    fn node_mut(&mut self, r: Register) -> &mut Node {
        self.nodes.entry(r).or_insert_with(|| Node {
            degree: 0,
            adjacency: HashSet::new(),
            alias: None,
            move_list: HashSet::new(),
            precolored: if r.is_machine() { Some(r.name) } else { None },
        })
    }

    /// Build: runs liveness, adds an interference edge between every defined register
    /// and every register live after the instruction, except a `mov src,dst` pair
    /// (which becomes a coalescing candidate instead).
    fn build(&mut self, loop_depth: &HashMap<crate::cfg::BlockId, u32>) {
        let live_out = liveness::compute(self.cfg);

        for block in self.cfg.blocks() {
            let mut live: HashSet<Register> = live_out.get(&block.id()).cloned().unwrap_or_default();
            let depth = *loop_depth.get(&block.id()).unwrap_or(&0);
            let weight = 10f64.powi(depth as i32);

            for instr in block.code().iter().rev() {
                let is_move = instr.as_move();

                if let Some((src, dst)) = is_move {
                    live.remove(&dst);
                    let move_index = self.moves.len();
                    self.moves.push(Move { src, dst, state: MoveState::Worklist });
                    self.node_mut(src).move_list.insert(move_index);
                    self.node_mut(dst).move_list.insert(move_index);
                    live.insert(src);
                }

                for def in instr.defs() {
                    *self.spill_costs.entry(def).or_insert(0.0) += weight;
                    for &l in &live {
                        if l != def {
                            self.add_edge(def, l);
                        }
                    }
                }

                if is_move.is_none() {
                    for def in instr.defs() {
                        live.remove(&def);
                    }
                }
                for u in instr.uses() {
                    *self.spill_costs.entry(u).or_insert(0.0) += weight;
                    live.insert(u);
                }
            }
        }
    }

    fn add_edge(&mut self, a: Register, b: Register) {
        if a == b {
            return;
        }
        let a_precolored = self.nodes.get(&a).and_then(|n| n.precolored).or(if a.is_machine() { Some(a.name) } else { None });
        let already = self.nodes.get(&a).map(|n| n.adjacency.contains(&b)).unwrap_or(false);
        if already {
            return;
        }
        if a_precolored.is_none() {
            self.node_mut(a).adjacency.insert(b);
            self.node_mut(a).degree += 1;
        }
        let b_precolored = self.nodes.get(&b).and_then(|n| n.precolored).or(if b.is_machine() { Some(b.name) } else { None });
        if b_precolored.is_none() {
            self.node_mut(b).adjacency.insert(a);
            self.node_mut(b).degree += 1;
        }
    }

    fn make_worklist(&mut self) {
        let candidates: Vec<Register> = self.nodes.keys().filter(|r| !r.is_machine()).copied().collect();
        for node in candidates {
            let degree = self.nodes[&node].degree;
            let has_move = !self.nodes[&node].move_list.is_empty();
            if degree >= self.k {
                self.spill_worklist.insert(node);
            } else if has_move {
                self.freeze_worklist.insert(node);
            } else {
                self.simplify_worklist.push(node);
            }
        }
    }

    /// Runs the main loop (simplify/coalesce/freeze/select-spill) to exhaustion, then
    /// assigns colors. Returns the round's result; a non-empty `spilled` means the
    /// caller must run the spiller and call `Allocator::new` again.
    pub fn run(mut self) -> AllocationResult {
        while !self.simplify_worklist.is_empty()
            || !self.worklist_moves_pending()
            || !self.freeze_worklist.is_empty()
            || !self.spill_worklist.is_empty()
        {
            if !self.simplify_worklist.is_empty() {
                self.simplify();
            } else if self.worklist_moves_pending() {
                self.coalesce();
            } else if !self.freeze_worklist.is_empty() {
                self.freeze();
            } else if !self.spill_worklist.is_empty() {
                self.select_spill();
            } else {
                break;
            }
        }

        self.assign_colors()
    }

    fn worklist_moves_pending(&self) -> bool {
        self.moves.iter().any(|m| m.state == MoveState::Worklist)
    }

    fn simplify(&mut self) {
        let node = self.simplify_worklist.pop().expect("simplify called with empty worklist");
        self.select_stack.push(node);
        let neighbors: Vec<Register> = self.nodes[&node].adjacency.iter().copied().collect();
        for neighbor in neighbors {
            self.decrement_degree(neighbor);
        }
    }

    fn decrement_degree(&mut self, node: Register) {
        if node.is_machine() {
            return;
        }
        let degree = {
            let n = self.node_mut(node);
            if n.degree > 0 {
                n.degree -= 1;
            }
            n.degree
        };
        if degree == self.k - 1 {
            let mut touched: Vec<Register> = self.nodes[&node].adjacency.iter().copied().collect();
            touched.push(node);
            for t in touched {
                self.enable_moves(t);
            }
            self.spill_worklist.remove(&node);
            if self.node_has_move(node) {
                self.freeze_worklist.insert(node);
            } else {
                self.simplify_worklist.push(node);
            }
        }
    }

    fn node_has_move(&self, node: Register) -> bool {
        self.nodes
            .get(&node)
            .map(|n| n.move_list.iter().any(|&i| matches!(self.moves[i].state, MoveState::Worklist | MoveState::Active)))
            .unwrap_or(false)
    }

    fn enable_moves(&mut self, node: Register) {
        let Some(n) = self.nodes.get(&node) else { return };
        let move_indices: Vec<usize> = n.move_list.iter().copied().collect();
        for i in move_indices {
            if self.moves[i].state == MoveState::Active {
                self.moves[i].state = MoveState::Worklist;
            }
        }
    }

    fn alias(&self, mut r: Register) -> Register {
        while let Some(a) = self.nodes.get(&r).and_then(|n| n.alias) {
            r = a;
        }
        r
    }

    fn coalesce(&mut self) {
        let move_index = self
            .moves
            .iter()
            .position(|m| m.state == MoveState::Worklist)
            .expect("coalesce called with no pending moves");

        let (src, dst) = (self.moves[move_index].src, self.moves[move_index].dst);
        let u = self.alias(src);
        let v = self.alias(dst);
        let (u, v) = if v.is_machine() { (v, u) } else { (u, v) };

        if u == v {
            self.moves[move_index].state = MoveState::Coalesced;
            self.add_worklist(u);
        } else if v.is_machine() || self.nodes.get(&u).map(|n| n.adjacency.contains(&v)).unwrap_or(false) {
            self.moves[move_index].state = MoveState::Constrained;
            self.add_worklist(u);
            self.add_worklist(v);
        } else if (u.is_machine() && self.george_ok(u, v)) || (!u.is_machine() && self.briggs_ok(u, v)) {
            self.moves[move_index].state = MoveState::Coalesced;
            self.combine(u, v);
            self.coalesced_nodes.push((u, v));
            self.add_worklist(u);
        } else {
            self.moves[move_index].state = MoveState::Active;
        }
    }

    /// Briggs' test: the merged node has fewer than K neighbors of degree ≥ K.
    fn briggs_ok(&self, u: Register, v: Register) -> bool {
        let mut neighbors: HashSet<Register> = HashSet::new();
        if let Some(n) = self.nodes.get(&u) {
            neighbors.extend(n.adjacency.iter().copied());
        }
        if let Some(n) = self.nodes.get(&v) {
            neighbors.extend(n.adjacency.iter().copied());
        }
        let high_degree_count = neighbors.iter().filter(|r| self.nodes.get(r).map(|n| n.degree).unwrap_or(0) >= self.k).count();
        (high_degree_count as u32) < self.k
    }

    /// George's test: every neighbor of `v` already interferes with `u` or has low
    /// degree (safe to merge into precolored `u`).
    fn george_ok(&self, u: Register, v: Register) -> bool {
        let Some(vn) = self.nodes.get(&v) else { return true };
        vn.adjacency.iter().all(|&t| {
            let degree_ok = self.nodes.get(&t).map(|n| n.degree).unwrap_or(0) < self.k;
            let already_interferes = self.nodes.get(&t).map(|n| n.adjacency.contains(&u)).unwrap_or(false);
            degree_ok || t.is_machine() || already_interferes
        })
    }

    fn add_worklist(&mut self, node: Register) {
        if node.is_machine() || self.node_has_move(node) || self.nodes.get(&node).map(|n| n.degree).unwrap_or(0) >= self.k {
            return;
        }
        self.freeze_worklist.remove(&node);
        self.simplify_worklist.push(node);
    }

    fn combine(&mut self, u: Register, v: Register) {
        self.freeze_worklist.remove(&v);
        self.spill_worklist.remove(&v);
        self.node_mut(v).alias = Some(u);

        let v_moves: Vec<usize> = self.nodes.get(&v).map(|n| n.move_list.iter().copied().collect()).unwrap_or_default();
        for m in v_moves {
            self.node_mut(u).move_list.insert(m);
        }

        let v_adjacency: Vec<Register> = self.nodes.get(&v).map(|n| n.adjacency.iter().copied().collect()).unwrap_or_default();
        for t in v_adjacency {
            self.add_edge(t, u);
            self.decrement_degree(t);
        }

        if self.nodes.get(&u).map(|n| n.degree).unwrap_or(0) >= self.k {
            self.freeze_worklist.remove(&u);
            self.spill_worklist.insert(u);
        }
    }

    fn freeze(&mut self) {
        let node = *self.freeze_worklist.iter().next().expect("freeze called with empty worklist");
        self.freeze_worklist.remove(&node);
        self.simplify_worklist.push(node);
        self.freeze_moves(node);
    }

    fn freeze_moves(&mut self, node: Register) {
        let move_indices: Vec<usize> = self.nodes.get(&node).map(|n| n.move_list.iter().copied().collect()).unwrap_or_default();
        for i in move_indices {
            if !matches!(self.moves[i].state, MoveState::Active | MoveState::Worklist) {
                continue;
            }
            let (src, dst) = (self.moves[i].src, self.moves[i].dst);
            let other = if self.alias(src) == self.alias(node) { self.alias(dst) } else { self.alias(src) };
            self.moves[i].state = MoveState::Frozen;
            if !self.node_has_move(other) && self.nodes.get(&other).map(|n| n.degree).unwrap_or(0) < self.k && !other.is_machine() {
                self.freeze_worklist.remove(&other);
                self.simplify_worklist.push(other);
            }
        }
    }

    /// SelectSpill: picks the spill-worklist node minimising `cost / degree`, preferring
    /// not to re-spill freshly introduced spill temporaries, and treats it as low-degree.
    fn select_spill(&mut self) {
        let chosen = *self
            .spill_worklist
            .iter()
            .min_by(|a, b| {
                let a_is_new = self.new_temps.contains(*a);
                let b_is_new = self.new_temps.contains(*b);
                if a_is_new != b_is_new {
                    return if a_is_new { std::cmp::Ordering::Greater } else { std::cmp::Ordering::Less };
                }
                let a_cost = self.spill_costs.get(*a).copied().unwrap_or(1.0) / self.nodes[*a].degree.max(1) as f64;
                let b_cost = self.spill_costs.get(*b).copied().unwrap_or(1.0) / self.nodes[*b].degree.max(1) as f64;
                a_cost.partial_cmp(&b_cost).unwrap_or(std::cmp::Ordering::Equal).then(a.name.cmp(&b.name))
            })
            .expect("select_spill called with empty worklist");

        self.spill_worklist.remove(&chosen);
        self.simplify_worklist.push(chosen);
        self.freeze_moves(chosen);
    }

    fn assign_colors(mut self) -> AllocationResult {
        let mut colors: HashMap<Register, u32> = HashMap::new();
        for (&r, n) in &self.nodes {
            if let Some(c) = n.precolored {
                colors.insert(r, c);
            }
        }

        while let Some(node) = self.select_stack.pop() {
            let adjacency: Vec<Register> = self.nodes[&node].adjacency.iter().copied().collect();
            let mut forbidden: HashSet<u32> = HashSet::new();
            for a in adjacency {
                let alias = self.alias(a);
                if let Some(&c) = colors.get(&alias) {
                    forbidden.insert(c);
                }
            }
            match (0..self.k).find(|c| !forbidden.contains(c)) {
                Some(color) => {
                    colors.insert(node, color);
                    self.colored_nodes.insert(node);
                }
                None => self.spilled_nodes.push(node),
            }
        }

        for (u, v) in &self.coalesced_nodes {
            if let Some(&c) = colors.get(u) {
                colors.insert(*v, c);
            }
        }

        AllocationResult {
            colors,
            spilled: self.spilled_nodes,
            coalesced: self.coalesced_nodes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Operand, TargetOp};

    fn reg(n: u32) -> Register {
        Register::virtual_reg(n)
    }

    #[test]
    fn two_non_interfering_temporaries_both_get_colored() {
        let mut cfg: Cfg<Instr> = Cfg::new();
        let block = cfg.create_block();
        cfg.block_mut(block).code_mut().push(Instr::new(TargetOp::Mov, vec![Operand::Register(reg(0)), Operand::Immediate(1)]));
        cfg.block_mut(block).code_mut().push(Instr::new(TargetOp::Ret, vec![]));

        let depth = HashMap::new();
        let allocator = Allocator::new(&cfg, 2, &depth);
        let result = allocator.run();
        assert!(result.spilled.is_empty());
        assert!(result.colors.contains_key(&reg(0)));
    }

    #[test]
    fn interfering_registers_get_different_colors() {
        let mut cfg: Cfg<Instr> = Cfg::new();
        let block = cfg.create_block();
        let code = cfg.block_mut(block).code_mut();
        code.push(Instr::new(TargetOp::Mov, vec![Operand::Register(reg(0)), Operand::Immediate(1)]));
        code.push(Instr::new(TargetOp::Mov, vec![Operand::Register(reg(1)), Operand::Immediate(2)]));
        code.push(Instr::new(TargetOp::Add, vec![Operand::Register(reg(0)), Operand::Register(reg(1))]));
        code.push(Instr::new(TargetOp::Ret, vec![]));

        let depth = HashMap::new();
        let allocator = Allocator::new(&cfg, 2, &depth);
        let result = allocator.run();
        if result.spilled.is_empty() {
            assert_ne!(result.colors[&reg(0)], result.colors[&reg(1)]);
        }
    }
}
