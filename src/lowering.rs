//! IR lowering: translates verified NetIL into a target-IR [`Cfg`].
//!
//! Works instruction by instruction over a verifier [`ByteCodeInfo`], pattern-matching
//! short fixed sequences the way `bytecode_analyse.h`'s companion lowering pass does,
//! reimplemented without its instruction-class hierarchy: each NetIL opcode lowers to
//! zero or more [`Instr`]s pushed onto the current block, threading an explicit
//! simulated operand stack of virtual registers (no global evaluation stack).

use crate::cfg::{BlockId, Cfg};
use crate::error::RuntimeException;
use crate::ir::{AddrFlags, Condition, Instr, Memory, Operand, Register, TargetOp, Width};
use crate::verifier::{Args, ByteCodeInfo, InstructionInfo, MemoryAreaFlags};

/// Selects the dense jump-table vs. binary-decision-tree switch lowering.
/// Mirrors spec §4.3: "the choice is made at lowering time from the case vector."
const DENSE_SWITCH_MAX_SPAN: u32 = 256;

/// A NetIL segment lowered into target IR, plus the virtual-register counter so callers
/// can keep allocating fresh temporaries (e.g. the spiller) without colliding.
pub struct LoweredSegment {
    pub cfg: Cfg<Instr>,
    pub entry: BlockId,
    pub next_virtual: u32,
}

/// Lowers one verified segment into target IR.
pub fn lower(info: &ByteCodeInfo) -> LoweredSegment {
    let mut lowering = Lowering::new(info);
    lowering.run();
    LoweredSegment {
        cfg: lowering.cfg,
        entry: lowering.entry,
        next_virtual: lowering.next_virtual,
    }
}

struct Lowering<'a> {
    info: &'a ByteCodeInfo,
    cfg: Cfg<Instr>,
    /// NetIL instruction-index -> lowered block id, populated for every leader.
    block_for_leader: Vec<Option<BlockId>>,
    entry: BlockId,
    next_virtual: u32,
    /// Simulated operand stack: each entry is the virtual register holding that value.
    stack: Vec<Register>,
}

impl<'a> Lowering<'a> {
    fn new(info: &'a ByteCodeInfo) -> Self {
        let mut cfg = Cfg::new();
        let entry = cfg.create_block();
        Lowering {
            info,
            cfg,
            block_for_leader: vec![None; info.instructions.len()],
            entry,
            next_virtual: 0,
            stack: Vec::new(),
        }
    }

    fn fresh(&mut self) -> Register {
        let r = Register::virtual_reg(self.next_virtual);
        self.next_virtual += 1;
        r
    }

    fn run(&mut self) {
        if self.info.instructions.is_empty() {
            return;
        }

        // Pre-create one lowered block per NetIL leader so forward branches have a
        // `BlockId` to reference before that code is lowered.
        for (index, insn) in self.info.instructions.iter().enumerate() {
            if insn.is_leader() {
                let block = if index == 0 { self.entry } else { self.cfg.create_block() };
                self.block_for_leader[index] = Some(block);
            }
        }

        let mut current_leader_index = 0usize;
        let mut current_block = self.entry;

        for (index, insn) in self.info.instructions.iter().enumerate() {
            if insn.is_leader() && index != 0 {
                current_block = self.block_for_leader[index].expect("leader block pre-created");
                current_leader_index = index;
            }
            self.lower_instruction(current_block, insn);
            let _ = current_leader_index;

            if insn.is_terminator() {
                let fallthrough_exists = index + 1 < self.info.instructions.len();
                let falls_through = !insn.is_return()
                    && !insn.is_switch()
                    && !(insn.is_branch() && matches!(&insn.args, Args::RelByte(_) | Args::RelWord(_)));
                if falls_through && fallthrough_exists {
                    if let Some(next_block) = self.block_for_leader[index + 1] {
                        self.cfg.add_successor(current_block, next_block);
                    }
                }
            }
        }
    }

    fn block_for(&self, target: u32) -> BlockId {
        self.block_for_leader[target as usize].expect("branch target is always a leader")
    }

    fn lower_instruction(&mut self, block: BlockId, insn: &InstructionInfo) {
        let mnemonic = crate::opcode::descriptor(insn.opcode).map(|d| d.mnemonic).unwrap_or("?");

        match mnemonic {
            "nop" => {}
            "pop" => {
                self.stack.pop();
            }
            "dup" => {
                let top = *self.stack.last().expect("verified: stack non-empty");
                self.stack.push(top);
            }
            "swap" => {
                let len = self.stack.len();
                self.stack.swap(len - 1, len - 2);
            }
            "push" | "pushbyte" => {
                let value = match &insn.args {
                    Args::Word(v) => *v as i64,
                    Args::Byte(v) => *v as i64,
                    _ => 0,
                };
                let dst = self.fresh();
                self.push_instr(block, Instr::new(TargetOp::Mov, vec![Operand::Register(dst), Operand::Immediate(value)]));
                self.stack.push(dst);
            }
            "ret" | "sendpkt" => {
                self.push_instr(block, Instr::new(TargetOp::Ret, vec![]));
            }
            "loc_load" => {
                let Args::Word(slot) = &insn.args else { unreachable!() };
                let dst = self.fresh();
                let mem = Memory::base_displ(Register::machine(LOCALS_BASE_REG), (*slot as i32) * 4);
                self.push_instr(block, Instr::new(TargetOp::Load { width: Width::Word, signed: false }, vec![Operand::Register(dst), Operand::Memory(mem)]));
                self.stack.push(dst);
            }
            "loc_store" => {
                let Args::Word(slot) = &insn.args else { unreachable!() };
                let src = self.stack.pop().expect("verified: stack non-empty");
                let mem = Memory::base_displ(Register::machine(LOCALS_BASE_REG), (*slot as i32) * 4);
                self.push_instr(block, Instr::new(TargetOp::Store { width: Width::Word }, vec![Operand::Memory(mem), Operand::Register(src)]));
            }
            "jump" | "jumpw" => {
                let target = branch_target_index(insn);
                let target_block = self.block_for(target);
                self.cfg.add_successor(block, target_block);
                self.push_instr(block, Instr::new(TargetOp::Jmp, vec![Operand::Label(target_block)]));
            }
            "jcmp" | "jcmpw" => {
                let cond = self.stack.pop().expect("verified: stack non-empty");
                let target = branch_target_index(insn);
                let target_block = self.block_for(target);
                self.cfg.add_successor(block, target_block);
                self.push_instr(block, Instr::new(TargetOp::Cmp, vec![Operand::Register(cond), Operand::Immediate(0)]));
                self.push_instr(block, Instr::new(TargetOp::Jcc(Condition::Ne), vec![Operand::Label(target_block)]));
            }
            "call" | "callw" => {
                let target = branch_target_index(insn);
                let target_block = self.block_for(target);
                self.cfg.add_successor(block, target_block);
                self.push_instr(block, Instr::new(TargetOp::Call, vec![Operand::Label(target_block)]));
            }
            "switch" => {
                self.lower_switch(block, insn);
            }
            "add" | "sub" | "mul" | "div" | "mod" | "and" | "or" | "xor" | "shl" | "shr" | "sar" => {
                self.lower_binop(block, mnemonic);
            }
            "neg" | "not" => {
                self.lower_unop(block, mnemonic);
            }
            "cmpeq" | "cmpne" | "cmplt" | "cmpgt" | "cmple" | "cmpge" => {
                self.lower_compare(block, mnemonic);
            }
            m if m.ends_with("load") => self.lower_memory_load(block, m),
            m if m.ends_with("store") => self.lower_memory_store(block, m),
            m if m.starts_with("cop") => self.lower_coprocessor(block, m, insn),
            _ => {}
        }
    }

    fn push_instr(&mut self, block: BlockId, instr: Instr) {
        self.cfg.block_mut(block).code_mut().push(instr);
    }

    fn lower_binop(&mut self, block: BlockId, mnemonic: &str) {
        let rhs = self.stack.pop().expect("verified: stack non-empty");
        let lhs = self.stack.pop().expect("verified: stack non-empty");
        let dst = self.fresh();
        let op = match mnemonic {
            "add" => TargetOp::Add,
            "sub" => TargetOp::Sub,
            "mul" => TargetOp::Mul,
            "div" | "mod" => TargetOp::Div,
            "and" => TargetOp::And,
            "or" => TargetOp::Or,
            "xor" => TargetOp::Xor,
            "shl" => TargetOp::Shl,
            "shr" => TargetOp::Shr,
            "sar" => TargetOp::Sar,
            _ => unreachable!(),
        };
        self.push_instr(block, Instr::new(TargetOp::Mov, vec![Operand::Register(dst), Operand::Register(lhs)]));
        self.push_instr(block, Instr::new(op, vec![Operand::Register(dst), Operand::Register(rhs)]));
        self.stack.push(dst);
    }

    fn lower_unop(&mut self, block: BlockId, mnemonic: &str) {
        let src = self.stack.pop().expect("verified: stack non-empty");
        let dst = self.fresh();
        let op = if mnemonic == "neg" { TargetOp::Neg } else { TargetOp::Not };
        self.push_instr(block, Instr::new(TargetOp::Mov, vec![Operand::Register(dst), Operand::Register(src)]));
        self.push_instr(block, Instr::new(op, vec![Operand::Register(dst)]));
        self.stack.push(dst);
    }

    fn lower_compare(&mut self, block: BlockId, mnemonic: &str) {
        let rhs = self.stack.pop().expect("verified: stack non-empty");
        let lhs = self.stack.pop().expect("verified: stack non-empty");
        let dst = self.fresh();
        let cond = match mnemonic {
            "cmpeq" => Condition::Eq,
            "cmpne" => Condition::Ne,
            "cmplt" => Condition::Lt,
            "cmpgt" => Condition::Gt,
            "cmple" => Condition::Le,
            "cmpge" => Condition::Ge,
            _ => unreachable!(),
        };
        self.push_instr(block, Instr::new(TargetOp::Cmp, vec![Operand::Register(lhs), Operand::Register(rhs)]));
        self.push_instr(block, Instr::new(TargetOp::Mov, vec![Operand::Register(dst), Operand::Immediate(cond as i64)]));
        self.stack.push(dst);
    }

    fn lower_memory_load(&mut self, block: BlockId, mnemonic: &str) {
        let (area, width, signed) = decode_memory_mnemonic(mnemonic);
        let area_elided = !self.area_in_use(area);
        let index = self.stack.pop().expect("verified: stack non-empty");
        if !area_elided {
            self.push_bounds_check(block, area, index);
        }
        let dst = self.fresh();
        let mem = Memory {
            base: Some(area_base_register(area)),
            index: Some(index),
            scale: 0,
            displacement: 0,
            flags: AddrFlags::BASE | AddrFlags::INDEX,
        };
        let instr = Instr::new(TargetOp::Load { width, signed }, vec![Operand::Register(dst), Operand::Memory(mem)])
            .with_comment(format!("{mnemonic} idx=v{}", index.name));
        self.push_instr(block, instr);
        self.stack.push(dst);
    }

    fn lower_memory_store(&mut self, block: BlockId, mnemonic: &str) {
        let (area, width, _signed) = decode_memory_mnemonic(mnemonic);
        let area_elided = !self.area_in_use(area);
        let value = self.stack.pop().expect("verified: stack non-empty");
        let index = self.stack.pop().expect("verified: stack non-empty");
        if !area_elided {
            self.push_bounds_check(block, area, index);
        }
        let mem = Memory {
            base: Some(area_base_register(area)),
            index: Some(index),
            scale: 0,
            displacement: 0,
            flags: AddrFlags::BASE | AddrFlags::INDEX,
        };
        let instr = Instr::new(TargetOp::Store { width }, vec![Operand::Memory(mem), Operand::Register(value)])
            .with_comment(format!("{mnemonic} idx=v{}", index.name));
        self.push_instr(block, instr);
    }

    fn area_in_use(&self, area: MemoryArea) -> bool {
        match area {
            MemoryArea::Packet => self
                .info
                .area_flags
                .intersects(MemoryAreaFlags::READS_PACKET | MemoryAreaFlags::WRITES_PACKET),
            MemoryArea::Data => self
                .info
                .area_flags
                .intersects(MemoryAreaFlags::READS_DATA | MemoryAreaFlags::WRITES_DATA),
            MemoryArea::Shared => self
                .info
                .area_flags
                .intersects(MemoryAreaFlags::READS_SHARED | MemoryAreaFlags::WRITES_SHARED),
        }
    }

    fn push_bounds_check(&mut self, block: BlockId, area: MemoryArea, index: Register) {
        let len_reg = Register::machine(area_length_register(area));
        let trap_code = area_bounds_exception(area).trap_code() as i64;
        self.push_instr(
            block,
            Instr::new(TargetOp::BoundsCheck, vec![Operand::Register(index), Operand::Register(len_reg), Operand::Immediate(trap_code)]),
        );
    }

    fn lower_coprocessor(&mut self, block: BlockId, mnemonic: &str, insn: &InstructionInfo) {
        let Args::TwoWord(copro_id, op_id) = &insn.args else { return };
        match mnemonic {
            "copinit" => {
                self.push_instr(block, Instr::new(TargetOp::CoprocessorInvoke, vec![Operand::Immediate(*copro_id as i64), Operand::Immediate(0)]));
            }
            "copwreg" | "copwreg_st" => {
                let value = self.stack.pop().expect("verified: stack non-empty");
                self.push_instr(
                    block,
                    Instr::new(TargetOp::Mov, vec![Operand::Register(Register::machine(COPROCESSOR_REG_BASE + *op_id)), Operand::Register(value)]),
                );
            }
            "copreg" => {
                let dst = self.fresh();
                self.push_instr(
                    block,
                    Instr::new(TargetOp::Mov, vec![Operand::Register(dst), Operand::Register(Register::machine(COPROCESSOR_REG_BASE + *op_id))]),
                );
                self.stack.push(dst);
            }
            "copinvoke" => {
                self.push_instr(
                    block,
                    Instr::new(TargetOp::CoprocessorInvoke, vec![Operand::Immediate(*copro_id as i64), Operand::Immediate(*op_id as i64)]),
                );
            }
            _ => {}
        }
    }

    fn lower_switch(&mut self, block: BlockId, insn: &InstructionInfo) {
        let Args::Switch(switch) = &insn.args else { return };
        let value = self.stack.pop().expect("verified: stack non-empty");
        let default_block = self.block_for(switch.default_target);

        if switch.cases.is_empty() {
            // spec §8 boundary behaviour: zero cases compiles to an unconditional jump.
            self.cfg.add_successor(block, default_block);
            self.push_instr(block, Instr::new(TargetOp::Jmp, vec![Operand::Label(default_block)]));
            return;
        }

        let min = switch.cases.iter().map(|(v, _)| *v).min().unwrap();
        let max = switch.cases.iter().map(|(v, _)| *v).max().unwrap();
        let span = max.saturating_sub(min) as u32;
        let dense = span <= DENSE_SWITCH_MAX_SPAN && span as usize >= switch.cases.len().saturating_sub(1);

        self.cfg.add_successor(block, default_block);
        let mut resolved_cases = Vec::with_capacity(switch.cases.len());
        for (value, target) in &switch.cases {
            let target_block = self.block_for(*target);
            self.cfg.add_successor(block, target_block);
            resolved_cases.push((*value, target_block));
        }

        let mut instr = Instr::new(TargetOp::SwitchDispatch, vec![Operand::Register(value), Operand::Label(default_block)]);
        instr.binary_switch_jump = !dense;
        instr.switch_cases = resolved_cases;
        self.push_instr(block, instr);
    }
}

fn branch_target_index(insn: &InstructionInfo) -> u32 {
    match &insn.args {
        Args::RelByte(target) | Args::RelWord(target) => *target,
        _ => panic!("branch instruction without a resolved target"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemoryArea {
    Packet,
    Data,
    Shared,
}

/// Dedicated machine registers reserved for the locals base and per-area length
/// operands; concrete assignment is a target-specific ABI detail the allocator treats
/// as precolored nodes.
const LOCALS_BASE_REG: u32 = 100;
const PACKET_LEN_REG: u32 = 101;
const DATA_LEN_REG: u32 = 102;
const SHARED_LEN_REG: u32 = 103;
const COPROCESSOR_REG_BASE: u32 = 200;

fn area_base_register(area: MemoryArea) -> Register {
    let name = match area {
        MemoryArea::Packet => 110,
        MemoryArea::Data => 111,
        MemoryArea::Shared => 112,
    };
    Register::machine(name)
}

fn area_length_register(area: MemoryArea) -> u32 {
    match area {
        MemoryArea::Packet => PACKET_LEN_REG,
        MemoryArea::Data => DATA_LEN_REG,
        MemoryArea::Shared => SHARED_LEN_REG,
    }
}

/// The exception a failed bounds check on `area` raises, per spec §7's per-area
/// out-of-bounds variants.
fn area_bounds_exception(area: MemoryArea) -> RuntimeException {
    match area {
        MemoryArea::Packet => RuntimeException::PacketOutOfBounds,
        MemoryArea::Data => RuntimeException::DataOutOfBounds,
        MemoryArea::Shared => RuntimeException::InitMemOutOfBounds,
    }
}

fn decode_memory_mnemonic(mnemonic: &str) -> (MemoryArea, Width, bool) {
    let area = match mnemonic.chars().next().unwrap() {
        'p' => MemoryArea::Packet,
        'd' => MemoryArea::Data,
        's' => MemoryArea::Shared,
        other => panic!("unrecognised memory mnemonic prefix {other}"),
    };
    let (width, signed) = if mnemonic.contains("bl") || mnemonic == "pbstore" || mnemonic == "dbstore" || mnemonic == "sbstore" {
        (Width::Byte, false)
    } else if mnemonic.contains("bs") {
        (Width::Byte, true)
    } else if mnemonic.contains("wl") || mnemonic == "pwstore" || mnemonic == "dwstore" || mnemonic == "swstore" {
        (Width::Half, false)
    } else if mnemonic.contains("ws") {
        (Width::Half, true)
    } else {
        (Width::Word, false)
    };
    (area, width, signed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verifier::{self, SegmentHeader, SegmentKind, VerifierOptions};

    #[test]
    fn minimal_segment_lowers_to_a_single_block_with_a_ret() {
        let code = [0x01u8, 0x06]; // pop; ret
        let header = SegmentHeader { max_stack_size: 1, locals_size: 0 };
        let info = verifier::verify(&code, header, SegmentKind::Push, &VerifierOptions::default()).unwrap();
        let lowered = lower(&info);
        assert_eq!(lowered.cfg.block_count(), 1);
        let block = lowered.cfg.block(lowered.entry);
        assert!(block.code().iter().any(|i| i.op == TargetOp::Ret));
    }

    #[test]
    fn zero_case_switch_lowers_to_unconditional_jump() {
        let mut code = vec![0x04u8];
        code.extend_from_slice(&1i32.to_le_bytes());
        let switch_offset = code.len() as i64;
        code.push(0x26);
        let ret_offset = switch_offset + 1 + 4 + 4;
        let default_rel = (ret_offset - switch_offset) as i32;
        code.extend_from_slice(&default_rel.to_le_bytes());
        code.extend_from_slice(&0u32.to_le_bytes());
        code.push(0x06);

        let header = SegmentHeader { max_stack_size: 1, locals_size: 0 };
        let info = verifier::verify(&code, header, SegmentKind::Push, &VerifierOptions::default()).unwrap();
        let lowered = lower(&info);
        let found_jmp = lowered.cfg.blocks().any(|b| b.code().iter().any(|i| i.op == TargetOp::Jmp));
        assert!(found_jmp);
    }
}
