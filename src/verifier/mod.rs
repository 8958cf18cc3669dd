//! Bytecode verifier / analyser.
//!
//! Turns a raw code segment into a [`ByteCodeInfo`]: a decoded instruction stream with
//! stack depths, basic-block assignments and memory-area usage flags, or a batched list
//! of every [`VerifyError`] found. Grounded on the five-pass algorithm in
//! `bytecode_analyse.h` (index / decode / structural / block / use), reimplemented
//! without the original's process-wide analyser state: every pass takes and returns
//! plain values, threaded explicitly by [`verify`].

use bitflags::bitflags;

use crate::opcode::{self, ArgShape, SideEffects};

/// Which of the three segment kinds is being verified; affects the assumed initial
/// stack depth and which opcodes are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Runs once when the PE is instantiated. Initial stack depth 0.
    Init,
    /// Invoked by an upstream push port. Initial stack depth 1 (the calling port id).
    Push,
    /// Invoked by a downstream pull port. Initial stack depth 1 (the calling port id).
    Pull,
}

impl SegmentKind {
    const fn initial_stack_depth(self) -> u16 {
        match self {
            SegmentKind::Init => 0,
            SegmentKind::Push | SegmentKind::Pull => 1,
        }
    }
}

/// Header preceding a code segment's bytecode bytes (spec §6: the 8-byte
/// `[max_stack_size, locals_size]` pair).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Declared maximum stack depth; exceeding it is `STACK_OVFLOW`.
    pub max_stack_size: u32,
    /// Declared size of the locals area, in slots.
    pub locals_size: u32,
}

/// Knobs controlling verifier strictness.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VerifierOptions {
    /// When `true`, a stack-depth disagreement between predecessors of a block
    /// (`STACK_MERGE`) is recorded but does not fail verification. The spec treats this
    /// as fatal by default.
    pub treat_merge_as_warning: bool,
}

impl Default for VerifierOptions {
    fn default() -> Self {
        VerifierOptions { treat_merge_as_warning: false }
    }
}

bitflags! {
    /// Per-instruction classification flags, named after the original analyser's bits
    /// (`bytecode_analyse.h`) rather than the spec's informal `is-leader`/`is-terminator`
    /// prose names; both namings are available as accessors on [`InstructionInfo`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InstructionFlags: u8 {
        /// First instruction of a basic block.
        const BB_LEADER = 1 << 0;
        /// Last instruction of a basic block.
        const BB_END = 1 << 1;
        /// A `STACK_MERGE` conflict was recorded at this instruction.
        const STACK_MERGE_ERR = 1 << 2;
        /// Is a `switch`.
        const SW_INSN = 1 << 3;
        /// Is a return/sendpkt.
        const RET_INSN = 1 << 4;
        /// Is a branch (conditional or unconditional jump/call).
        const BR_INSN = 1 << 5;
        /// Visited during the structural pass's branch-target fixpoint.
        const VISITED = 1 << 6;
    }
}

bitflags! {
    /// Which memory areas a segment touches, computed by the use pass. Lets lowering
    /// skip bounds-check machinery for areas a segment never accesses.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryAreaFlags: u8 {
        const READS_PACKET = 1 << 0;
        const WRITES_PACKET = 1 << 1;
        const READS_DATA = 1 << 2;
        const WRITES_DATA = 1 << 3;
        const READS_SHARED = 1 << 4;
        const WRITES_SHARED = 1 << 5;
    }
}

/// Decoded operands for one instruction, shaped per its opcode's [`ArgShape`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Args {
    None,
    /// An unsigned byte immediate (e.g. `pushbyte`).
    Byte(u8),
    /// A signed 8-bit relative branch displacement, resolved to a target instruction index.
    RelByte(InstructionIndex),
    /// An unsigned 32-bit immediate or index (e.g. `loc_load`).
    Word(u32),
    /// A signed 32-bit relative branch displacement, resolved to a target instruction index.
    RelWord(InstructionIndex),
    /// Two 32-bit operands (coprocessor id + register index).
    TwoWord(u32, u32),
    /// A `switch`'s case table.
    Switch(SwitchInfo),
}

/// Index of a decoded instruction within a segment (not a byte offset).
pub type InstructionIndex = u32;

/// Index of a basic block within a segment.
pub type BlockId = u32;

/// A `switch` instruction's decoded case table (spec §3/§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchInfo {
    /// Target taken when no case matches.
    pub default_target: InstructionIndex,
    /// `(case value, target instruction index)` pairs, in encoded order.
    pub cases: Vec<(i32, InstructionIndex)>,
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionInfo {
    /// Byte offset of this instruction within the segment.
    pub byte_offset: u32,
    /// Opcode byte.
    pub opcode: u8,
    /// Decoded operands.
    pub args: Args,
    /// Source line, if a debug line-map section was supplied.
    pub line: Option<u32>,
    /// Evaluation-stack depth before this instruction executes.
    pub stack_before: u16,
    /// Evaluation-stack depth after this instruction executes.
    pub stack_after: u16,
    /// Basic block this instruction belongs to, assigned by the block pass.
    pub block_id: Option<BlockId>,
    /// Classification flags.
    pub flags: InstructionFlags,
}

impl InstructionInfo {
    /// `spec.md`'s informal naming: first instruction of a basic block.
    pub fn is_leader(&self) -> bool {
        self.flags.contains(InstructionFlags::BB_LEADER)
    }
    /// `spec.md`'s informal naming: last instruction of a basic block.
    pub fn is_terminator(&self) -> bool {
        self.flags.contains(InstructionFlags::BB_END)
    }
    /// Whether this instruction is a conditional or unconditional branch.
    pub fn is_branch(&self) -> bool {
        self.flags.contains(InstructionFlags::BR_INSN)
    }
    /// Whether this instruction is a return or `sendpkt`.
    pub fn is_return(&self) -> bool {
        self.flags.contains(InstructionFlags::RET_INSN)
    }
    /// Whether this instruction is a `switch`.
    pub fn is_switch(&self) -> bool {
        self.flags.contains(InstructionFlags::SW_INSN)
    }
}

/// The verifier's complete output for one code segment.
#[derive(Debug, Clone)]
pub struct ByteCodeInfo {
    /// Raw segment bytes, as supplied to [`verify`].
    pub code: Vec<u8>,
    /// One entry per decoded instruction, in program order.
    pub instructions: Vec<InstructionInfo>,
    /// Declared maximum stack depth from the segment header.
    pub declared_max_stack: u32,
    /// Declared locals-area size from the segment header.
    pub declared_locals_size: u32,
    /// Highest stack depth actually observed across the structural pass.
    pub max_observed_stack: u16,
    /// Number of distinct local slots referenced by `loc_load`/`loc_store`.
    pub locals_used: usize,
    /// Which local slots were ever the target of a `loc_store`.
    pub locals_defined: Vec<bool>,
    /// Memory areas touched by this segment.
    pub area_flags: MemoryAreaFlags,
    /// Number of basic blocks identified by the block pass.
    pub block_count: u32,
}

/// A single verification failure, pinpointed by instruction index and/or byte offset.
/// Named after the original analyser's error tokens.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum VerifyError {
    /// `OP_NOT_DEF`: an opcode byte has no descriptor-table entry.
    #[display(fmt = "byte offset {offset}: undefined opcode 0x{opcode:02x}")]
    OpNotDefined { offset: u32, opcode: u8 },
    /// `BC_FALLOUT`: the last instruction's operand bytes extend past the segment end.
    #[display(fmt = "byte offset {offset}: instruction bytes fall out of the segment")]
    BytecodeFallout { offset: u32 },
    /// `END_OF_SEG_WO_RET`: the segment does not end in a return, sendpkt, unconditional
    /// branch, or switch.
    #[display(fmt = "segment does not end with a return, sendpkt, branch or switch")]
    EndOfSegWithoutReturn,
    /// `INVALID_BR_TARGET`: a branch or switch target does not land on an instruction
    /// boundary.
    #[display(fmt = "instruction {index}: branch target byte offset {target_offset} is not an instruction boundary")]
    InvalidBranchTarget { index: InstructionIndex, target_offset: u32 },
    /// `STACK_UNDERFLOW`: fewer values are on the stack than the opcode consumes.
    #[display(fmt = "instruction {index}: stack underflow (depth {depth}, needs {needed})")]
    StackUnderflow { index: InstructionIndex, depth: u16, needed: u8 },
    /// `STACK_EMPTY`: an opcode that requires a non-empty stack found depth zero.
    #[display(fmt = "instruction {index}: stack is empty")]
    StackEmpty { index: InstructionIndex },
    /// `STACK_OVFLOW`: stack depth exceeded the segment's declared maximum.
    #[display(fmt = "instruction {index}: stack depth {depth} exceeds declared max {max}")]
    StackOverflow { index: InstructionIndex, depth: u16, max: u32 },
    /// `LOCAL_OUTOB`: `loc_load`/`loc_store` indexed past the declared locals size.
    #[display(fmt = "instruction {index}: local index {local} out of bounds (locals size {size})")]
    LocalOutOfBounds { index: InstructionIndex, local: u32, size: u32 },
    /// `STACK_MERGE`: two predecessors of a block disagree about the stack depth at its
    /// head.
    #[display(fmt = "instruction {index}: stack depth merge conflict (expected {expected}, found {found})")]
    StackMerge { index: InstructionIndex, expected: u16, found: u16 },
    /// An opcode valid on another backend is not implemented on the one selected for
    /// this build.
    #[display(fmt = "instruction {index}: opcode 0x{opcode:02x} is not implemented on the selected backend")]
    OpcodeNotOnBackend { index: InstructionIndex, opcode: u8 },
    /// An `init`-only opcode appeared in a `push` or `pull` segment.
    #[display(fmt = "instruction {index}: opcode 0x{opcode:02x} is only valid in an init segment")]
    InitOnlyOpcodeMisplaced { index: InstructionIndex, opcode: u8 },
}

struct Span {
    offset: u32,
    opcode: u8,
    len: u32,
}

/// Verifies `code` against `header`, returning a populated [`ByteCodeInfo`] if and only
/// if no errors were found. Every error found is returned, not just the first.
pub fn verify(
    code: &[u8],
    header: SegmentHeader,
    kind: SegmentKind,
    options: &VerifierOptions,
) -> Result<ByteCodeInfo, Vec<VerifyError>> {
    let mut errors = Vec::new();

    let spans = match index_pass(code, &mut errors) {
        Some(spans) => spans,
        None => return Err(errors),
    };

    let offset_to_index: std::collections::HashMap<u32, InstructionIndex> = spans
        .iter()
        .enumerate()
        .map(|(i, s)| (s.offset, i as InstructionIndex))
        .collect();

    let mut instructions = decode_pass(code, &spans, &offset_to_index, &mut errors);

    structural_pass(&mut instructions, header, kind, options, &mut errors);

    let block_count = block_pass(&mut instructions);

    let area_flags = use_pass(&instructions);

    let max_observed_stack = instructions.iter().map(|i| i.stack_after.max(i.stack_before)).max().unwrap_or(0);

    let mut locals_defined = vec![false; header.locals_size as usize];
    for insn in &instructions {
        if let Args::Word(local) = &insn.args {
            let descriptor = opcode::descriptor(insn.opcode);
            let is_store = descriptor.map(|d| d.mnemonic == "loc_store").unwrap_or(false);
            if is_store {
                if let Some(slot) = locals_defined.get_mut(*local as usize) {
                    *slot = true;
                }
            }
        }
    }
    let locals_used = locals_defined.iter().filter(|&&defined| defined).count();

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(ByteCodeInfo {
        code: code.to_vec(),
        instructions,
        declared_max_stack: header.max_stack_size,
        declared_locals_size: header.locals_size,
        max_observed_stack,
        locals_used,
        locals_defined,
        area_flags,
        block_count,
    })
}

/// Walks the segment left to right, resolving each byte to an opcode and a length.
/// Returns `None` if the segment could not be fully indexed (in which case `errors`
/// already explains why and no further pass can run safely).
fn index_pass(code: &[u8], errors: &mut Vec<VerifyError>) -> Option<Vec<Span>> {
    let mut spans = Vec::new();
    let mut offset = 0u32;

    while (offset as usize) < code.len() {
        let opcode = code[offset as usize];
        let Some(descriptor) = opcode::descriptor(opcode) else {
            errors.push(VerifyError::OpNotDefined { offset, opcode });
            return None;
        };

        let len = match instruction_len(descriptor.args, code, offset) {
            Some(len) => len,
            None => {
                errors.push(VerifyError::BytecodeFallout { offset });
                return None;
            }
        };

        if offset as usize + len as usize > code.len() {
            errors.push(VerifyError::BytecodeFallout { offset });
            return None;
        }

        spans.push(Span { offset, opcode, len });
        offset += len;
    }

    if let Some(last) = spans.last() {
        let descriptor = opcode::descriptor(last.opcode).expect("indexed opcode is always defined");
        let terminal = descriptor.effects.intersects(
            SideEffects::RETURN | SideEffects::SWITCH | SideEffects::BRANCH,
        );
        if !terminal {
            errors.push(VerifyError::EndOfSegWithoutReturn);
        }
    } else {
        errors.push(VerifyError::EndOfSegWithoutReturn);
    }

    Some(spans)
}

/// Total encoded length of the instruction at `offset`, including the opcode byte.
/// `switch` has a data-dependent length (spec §6): `1 + 4 + 4 + 8 * n_cases`.
fn instruction_len(args: ArgShape, code: &[u8], offset: u32) -> Option<u32> {
    match args.fixed_len() {
        Some(fixed) => Some(1 + fixed as u32),
        None => {
            // Variable shape: only `switch` has one today. Case count lives 5 bytes
            // after the opcode (1 opcode + 4 default_rel).
            let case_count_at = offset as usize + 5;
            let bytes = code.get(case_count_at..case_count_at + 4)?;
            let n_cases = u32::from_le_bytes(bytes.try_into().ok()?);
            Some(1 + 4 + 4 + 8 * n_cases)
        }
    }
}

fn decode_pass(
    code: &[u8],
    spans: &[Span],
    offset_to_index: &std::collections::HashMap<u32, InstructionIndex>,
    errors: &mut Vec<VerifyError>,
) -> Vec<InstructionInfo> {
    spans
        .iter()
        .enumerate()
        .map(|(index, span)| {
            let index = index as InstructionIndex;
            let descriptor = opcode::descriptor(span.opcode).expect("indexed opcode is always defined");
            let body = &code[span.offset as usize + 1..(span.offset + span.len) as usize];
            let args = decode_args(descriptor, span, body, index, offset_to_index, errors);

            let mut flags = InstructionFlags::empty();
            if descriptor.effects.contains(SideEffects::BRANCH) {
                flags |= InstructionFlags::BR_INSN;
            }
            if descriptor.effects.contains(SideEffects::RETURN) {
                flags |= InstructionFlags::RET_INSN;
            }
            if descriptor.effects.contains(SideEffects::SWITCH) {
                flags |= InstructionFlags::SW_INSN;
            }

            InstructionInfo {
                byte_offset: span.offset,
                opcode: span.opcode,
                args,
                line: None,
                stack_before: 0,
                stack_after: 0,
                block_id: None,
                flags,
            }
        })
        .collect()
}

fn decode_args(
    descriptor: &opcode::OpcodeDescriptor,
    span: &Span,
    body: &[u8],
    index: InstructionIndex,
    offset_to_index: &std::collections::HashMap<u32, InstructionIndex>,
    errors: &mut Vec<VerifyError>,
) -> Args {
    let is_branch = descriptor.effects.contains(SideEffects::BRANCH);
    let next_instr_offset = span.offset + span.len;

    match descriptor.args {
        ArgShape::None => Args::None,
        ArgShape::Byte if is_branch => {
            let rel = body[0] as i8;
            let target_offset = (next_instr_offset as i64 + rel as i64) as u32;
            resolve_branch_target(target_offset, index, offset_to_index, errors, true)
        }
        ArgShape::Byte => Args::Byte(body[0]),
        ArgShape::Word32 if is_branch => {
            let rel = i32::from_le_bytes(body[0..4].try_into().unwrap());
            let target_offset = (next_instr_offset as i64 + rel as i64) as u32;
            resolve_branch_target(target_offset, index, offset_to_index, errors, false)
        }
        ArgShape::Word32 => Args::Word(u32::from_le_bytes(body[0..4].try_into().unwrap())),
        ArgShape::TwoWord32 => Args::TwoWord(
            u32::from_le_bytes(body[0..4].try_into().unwrap()),
            u32::from_le_bytes(body[4..8].try_into().unwrap()),
        ),
        ArgShape::Variable => {
            let default_rel = i32::from_le_bytes(body[0..4].try_into().unwrap());
            let n_cases = u32::from_le_bytes(body[4..8].try_into().unwrap());
            let default_target_offset = (span.offset as i64 + default_rel as i64) as u32;
            let default_target = match resolve_branch_target(
                default_target_offset,
                index,
                offset_to_index,
                errors,
                false,
            ) {
                Args::RelWord(t) | Args::RelByte(t) => t,
                _ => 0,
            };

            let mut cases = Vec::with_capacity(n_cases as usize);
            for case in 0..n_cases {
                let base = 8 + case as usize * 8;
                let value = i32::from_le_bytes(body[base..base + 4].try_into().unwrap());
                let target_rel = i32::from_le_bytes(body[base + 4..base + 8].try_into().unwrap());
                let target_offset = (span.offset as i64 + target_rel as i64) as u32;
                let target = match resolve_branch_target(target_offset, index, offset_to_index, errors, false) {
                    Args::RelWord(t) | Args::RelByte(t) => t,
                    _ => 0,
                };
                cases.push((value, target));
            }

            Args::Switch(SwitchInfo { default_target, cases })
        }
    }
}

fn resolve_branch_target(
    target_offset: u32,
    index: InstructionIndex,
    offset_to_index: &std::collections::HashMap<u32, InstructionIndex>,
    errors: &mut Vec<VerifyError>,
    short: bool,
) -> Args {
    match offset_to_index.get(&target_offset) {
        Some(&target) => {
            if short {
                Args::RelByte(target)
            } else {
                Args::RelWord(target)
            }
        }
        None => {
            errors.push(VerifyError::InvalidBranchTarget { index, target_offset });
            if short {
                Args::RelByte(index)
            } else {
                Args::RelWord(index)
            }
        }
    }
}

/// Abstract-interprets stack depth through the segment, recording `stack_before`/
/// `stack_after` on every instruction and collecting depth-related errors.
fn structural_pass(
    instructions: &mut [InstructionInfo],
    header: SegmentHeader,
    kind: SegmentKind,
    options: &VerifierOptions,
    errors: &mut Vec<VerifyError>,
) {
    let mut depth = kind.initial_stack_depth();
    let mut expected_at: std::collections::HashMap<InstructionIndex, u16> = std::collections::HashMap::new();
    expected_at.insert(0, depth);

    for index in 0..instructions.len() {
        let index_u32 = index as InstructionIndex;
        if let Some(&expected) = expected_at.get(&index_u32) {
            if instructions[index].flags.contains(InstructionFlags::VISITED) && expected != depth {
                errors.push(VerifyError::StackMerge { index: index_u32, expected, found: depth });
                instructions[index].flags |= InstructionFlags::STACK_MERGE_ERR;
                if !options.treat_merge_as_warning {
                    // Keep simulating with the recorded expectation so later errors stay
                    // meaningful instead of cascading from a single merge conflict.
                    depth = expected;
                }
            } else {
                depth = expected;
            }
        }
        instructions[index].flags |= InstructionFlags::VISITED;
        instructions[index].stack_before = depth;

        let descriptor = opcode::descriptor(instructions[index].opcode).expect("decoded opcode is always defined");
        let consumed = descriptor.stack.consumed;
        let produced = descriptor.stack.produced;

        if depth < consumed as u16 {
            if depth == 0 {
                errors.push(VerifyError::StackEmpty { index: index_u32 });
            } else {
                errors.push(VerifyError::StackUnderflow { index: index_u32, depth, needed: consumed });
            }
        } else {
            depth = depth - consumed as u16;
        }
        depth += produced as u16;

        if depth as u32 > header.max_stack_size {
            errors.push(VerifyError::StackOverflow { index: index_u32, depth, max: header.max_stack_size });
        }

        if let Args::Word(local) = &instructions[index].args {
            if *local >= header.locals_size {
                errors.push(VerifyError::LocalOutOfBounds { index: index_u32, local: *local, size: header.locals_size });
            }
        }

        instructions[index].stack_after = depth;

        match &instructions[index].args {
            Args::RelByte(target) | Args::RelWord(target) => {
                record_expected(*target, depth, &mut expected_at);
            }
            Args::Switch(switch) => {
                record_expected(switch.default_target, depth, &mut expected_at);
                for (_, target) in &switch.cases {
                    record_expected(*target, depth, &mut expected_at);
                }
            }
            _ => {}
        }

        let falls_through = !descriptor.effects.intersects(
            SideEffects::RETURN | SideEffects::SWITCH,
        ) || (descriptor.effects.contains(SideEffects::BRANCH)
            && !descriptor.effects.contains(SideEffects::RETURN));
        let is_unconditional_branch = descriptor.mnemonic == "jump" || descriptor.mnemonic == "jumpw";
        if falls_through && !is_unconditional_branch && index + 1 < instructions.len() {
            record_expected(index_u32 + 1, depth, &mut expected_at);
        }
    }
}

fn record_expected(target: InstructionIndex, depth: u16, expected_at: &mut std::collections::HashMap<InstructionIndex, u16>) {
    expected_at.entry(target).or_insert(depth);
}

/// Marks basic-block leaders/terminators and assigns sequential block ids.
fn block_pass(instructions: &mut [InstructionInfo]) -> u32 {
    if instructions.is_empty() {
        return 0;
    }

    let mut leaders = std::collections::BTreeSet::new();
    leaders.insert(0u32);

    for (i, insn) in instructions.iter().enumerate() {
        let i = i as InstructionIndex;
        match &insn.args {
            Args::RelByte(target) | Args::RelWord(target) => {
                leaders.insert(*target);
                if i + 1 < instructions.len() as u32 {
                    leaders.insert(i + 1);
                }
            }
            Args::Switch(switch) => {
                leaders.insert(switch.default_target);
                for (_, target) in &switch.cases {
                    leaders.insert(*target);
                }
                if i + 1 < instructions.len() as u32 {
                    leaders.insert(i + 1);
                }
            }
            _ => {
                if insn.is_return() && i + 1 < instructions.len() as u32 {
                    leaders.insert(i + 1);
                }
            }
        }
    }

    for &leader in &leaders {
        if let Some(insn) = instructions.get_mut(leader as usize) {
            insn.flags |= InstructionFlags::BB_LEADER;
        }
    }

    let mut block_id = 0u32;
    let mut sorted_leaders: Vec<u32> = leaders.into_iter().collect();
    sorted_leaders.push(instructions.len() as u32);

    for window in sorted_leaders.windows(2) {
        let (start, end) = (window[0], window[1]);
        for i in start..end {
            instructions[i as usize].block_id = Some(block_id);
        }
        if end > start {
            instructions[(end - 1) as usize].flags |= InstructionFlags::BB_END;
        }
        block_id += 1;
    }

    block_id
}

/// Scans decoded instructions' opcodes for which memory areas they touch.
fn use_pass(instructions: &[InstructionInfo]) -> MemoryAreaFlags {
    let mut flags = MemoryAreaFlags::empty();
    for insn in instructions {
        let Some(descriptor) = opcode::descriptor(insn.opcode) else { continue };
        if descriptor.effects.contains(SideEffects::READS_PACKET) {
            flags |= MemoryAreaFlags::READS_PACKET;
        }
        if descriptor.effects.contains(SideEffects::WRITES_PACKET) {
            flags |= MemoryAreaFlags::WRITES_PACKET;
        }
        if descriptor.effects.contains(SideEffects::READS_DATA) {
            flags |= if descriptor.mnemonic.ends_with("store") {
                MemoryAreaFlags::WRITES_DATA
            } else {
                MemoryAreaFlags::READS_DATA
            };
        }
        if descriptor.effects.contains(SideEffects::READS_SHARED) {
            flags |= if descriptor.mnemonic.ends_with("store") {
                MemoryAreaFlags::WRITES_SHARED
            } else {
                MemoryAreaFlags::READS_SHARED
            };
        }
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(max_stack: u32, locals: u32) -> SegmentHeader {
        SegmentHeader { max_stack_size: max_stack, locals_size: locals }
    }

    #[test]
    fn minimal_push_segment_verifies() {
        // pop; ret
        let code = [0x01u8, 0x06];
        let info = verify(&code, header(1, 0), SegmentKind::Push, &VerifierOptions::default()).unwrap();
        assert_eq!(info.instructions.len(), 2);
        assert!(info.instructions[1].is_return());
    }

    #[test]
    fn stack_underflow_on_second_pop() {
        // pop; pop; ret
        let code = [0x01u8, 0x01, 0x06];
        let errors = verify(&code, header(1, 0), SegmentKind::Push, &VerifierOptions::default()).unwrap_err();
        assert!(errors.iter().any(|e| matches!(e, VerifyError::StackUnderflow { index: 1, .. })));
    }

    #[test]
    fn branch_to_mid_instruction_is_rejected() {
        // push 1; jumpw 1; ret   -- jumpw target lands inside the push's operand bytes
        let mut code = vec![0x04u8];
        code.extend_from_slice(&1i32.to_le_bytes());
        code.push(0x21);
        code.extend_from_slice(&1i32.to_le_bytes());
        code.push(0x06);
        let errors = verify(&code, header(1, 0), SegmentKind::Push, &VerifierOptions::default()).unwrap_err();
        assert!(errors.iter().any(|e| matches!(e, VerifyError::InvalidBranchTarget { .. })));
    }

    #[test]
    fn empty_segment_is_end_of_seg_without_return() {
        let errors = verify(&[], header(0, 0), SegmentKind::Init, &VerifierOptions::default()).unwrap_err();
        assert_eq!(errors, vec![VerifyError::EndOfSegWithoutReturn]);
    }

    #[test]
    fn segment_ending_mid_instruction_is_fallout() {
        // push with only 2 of 4 operand bytes present
        let code = [0x04u8, 0x00, 0x00];
        let errors = verify(&code, header(1, 0), SegmentKind::Push, &VerifierOptions::default()).unwrap_err();
        assert_eq!(errors, vec![VerifyError::BytecodeFallout { offset: 0 }]);
    }

    #[test]
    fn switch_with_zero_cases_decodes_to_default_only() {
        // switch with 0 cases, default targets the following ret
        let mut code = vec![0x04u8]; // push 1 (to satisfy switch's 1 consumed)
        code.extend_from_slice(&1i32.to_le_bytes());
        let switch_offset = code.len() as i64;
        code.push(0x26); // switch
        let ret_offset = switch_offset + 1 + 4 + 4;
        let default_rel = (ret_offset - switch_offset) as i32;
        code.extend_from_slice(&default_rel.to_le_bytes());
        code.extend_from_slice(&0u32.to_le_bytes());
        code.push(0x06); // ret

        let info = verify(&code, header(1, 0), SegmentKind::Push, &VerifierOptions::default()).unwrap();
        let switch_insn = info.instructions.iter().find(|i| i.is_switch()).unwrap();
        match &switch_insn.args {
            Args::Switch(s) => assert!(s.cases.is_empty()),
            other => panic!("expected switch args, got {other:?}"),
        }
    }

    #[test]
    fn local_out_of_bounds_is_reported() {
        // loc_load 5; pop; ret, locals_size = 1
        let mut code = vec![0x10u8];
        code.extend_from_slice(&5u32.to_le_bytes());
        code.push(0x01);
        code.push(0x06);
        let errors = verify(&code, header(2, 1), SegmentKind::Init, &VerifierOptions::default()).unwrap_err();
        assert!(errors.iter().any(|e| matches!(e, VerifyError::LocalOutOfBounds { local: 5, size: 1, .. })));
    }
}
