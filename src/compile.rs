//! Ties the verifier, lowering, register allocator, spiller, trace builder and
//! emitter into the single pipeline spec §2 describes: "bytecode section → Verifier →
//! CFG<NetIL> → IRLowering → CFG<TargetIR> → RegisterAllocator (+ Spiller iterated
//! until a feasible coloring) → TraceBuilder → Emitter → executable page."

use bitflags::bitflags;

use crate::cfg::BlockId;
use crate::emitter::{self, CompiledSegment};
use crate::error::{CompileError, NetVmError};
use crate::ir::{Instr, Memory, Operand, Register, RegisterSpace};
use crate::lowering;
use crate::regalloc::Allocator;
use crate::spiller;
use crate::trace;
use crate::verifier::{self, ByteCodeInfo, SegmentHeader, SegmentKind, VerifierOptions};

bitflags! {
    /// JIT compilation flags (spec §6's `start`): `{ASSEMBLY, NATIVE, INLINE, INIT,
    /// BOUNDSCHECK}`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct JitFlags: u8 {
        /// Emit disassembly alongside the compiled segment (diagnostic only; this
        /// core does not format it, per spec §1's scope note).
        const ASSEMBLY = 1 << 0;
        /// Compile to native machine code (as opposed to an interpretation path this
        /// core does not implement).
        const NATIVE = 1 << 1;
        /// Inline short coprocessor call sequences where profitable.
        const INLINE = 1 << 2;
        /// Run the `init` segment eagerly at load time.
        const INIT = 1 << 3;
        /// Emit packet/data/shared memory bounds checks (spec §4.3: elidable when the
        /// analyser proves the access is in range).
        const BOUNDSCHECK = 1 << 4;
    }
}

impl Default for JitFlags {
    fn default() -> Self {
        JitFlags::NATIVE | JitFlags::BOUNDSCHECK
    }
}

/// Optimisation level selecting how aggressively lowering elides bounds checks and the
/// allocator spends effort coalescing. Threaded explicitly rather than read from global
/// state, per the Design Note on "global mutable state".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OptLevel {
    None,
    Speed,
}

/// Compilation knobs threaded explicitly through the pipeline (spec §6's `start`
/// parameters plus the verifier's strictness knobs).
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CompileOptions {
    pub opt_level: OptLevel,
    pub jit_flags: JitFlags,
    pub verifier: VerifierOptions,
    /// Number of colorable machine general-purpose registers the allocator targets.
    /// Deliberately small (4, not the 14 GPRs x86-64 nominally offers): every color
    /// the allocator hands out maps to a callee-saved physical register, so the
    /// emitter's own instruction sequences (`idiv`'s implicit `rdx:rax`, shift-by-`cl`,
    /// the coprocessor trampoline call) can freely clobber every caller-saved GPR
    /// without ever colliding with a live virtual register. See
    /// `emitter::x86_64`'s module documentation.
    pub machine_registers: u32,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            opt_level: OptLevel::Speed,
            jit_flags: JitFlags::default(),
            verifier: VerifierOptions::default(),
            machine_registers: emitter::COLORABLE_REGISTERS,
        }
    }
}

/// A maximum number of allocate/spill rounds before giving up; a real program
/// converges in a handful of rounds, so hitting this indicates a bug rather than a
/// legitimately hard program.
const MAX_SPILL_ROUNDS: u32 = 64;

/// The frame-pointer machine register spill slots are addressed relative to. Chosen
/// out of band from the allocator's colorable range so it never collides with a
/// color.
fn frame_base_register(options: &CompileOptions) -> Register {
    Register::machine(options.machine_registers)
}

/// Runs the full verify → lower → allocate/spill → trace → emit pipeline over one
/// code segment.
pub fn compile_segment(
    code: &[u8],
    header: SegmentHeader,
    kind: SegmentKind,
    options: &CompileOptions,
) -> Result<CompiledSegment, NetVmError> {
    let info: ByteCodeInfo = verifier::verify(code, header, kind, &options.verifier)?;
    compile_verified(&info, options)
}

/// Runs lower → allocate/spill → trace → emit over an already-verified segment; split
/// out so callers that verify once and recompile under different `CompileOptions`
/// don't pay for re-verification.
pub fn compile_verified(info: &ByteCodeInfo, options: &CompileOptions) -> Result<CompiledSegment, NetVmError> {
    let mut lowered = lowering::lower(info);
    let frame_base = frame_base_register(options);

    let mut round = 0;
    loop {
        round += 1;
        if round > MAX_SPILL_ROUNDS {
            return Err(NetVmError::Compile(CompileError::AllocatorInconsistency(0, 0)));
        }

        let loop_depth = lowered.cfg.loop_nesting_depth(lowered.entry);
        let allocator = Allocator::new(&lowered.cfg, options.machine_registers, &loop_depth);
        let result = allocator.run();

        if result.spilled.is_empty() {
            apply_colors(&mut lowered.cfg, &result.colors);
            break;
        }

        spiller::rewrite(&mut lowered.cfg, &result.spilled, &mut lowered.next_virtual, frame_base);
    }

    verify_no_interference_violations(&lowered.cfg)?;

    let frame_size = scan_frame_size(&lowered.cfg, frame_base);
    let locals_size_bytes = info.declared_locals_size as usize * 4;
    let trace = trace::build(&lowered.cfg, lowered.entry);
    emitter::emit(&lowered.cfg, &trace, frame_size, locals_size_bytes).map_err(NetVmError::Compile)
}

/// Largest spill-slot frame the spiller used, padded so that `sub rsp, N` leaves `rsp`
/// 16-byte aligned at every `call` the compiled body executes (`CoprocessorInvoke`,
/// `Call`). The prologue's six callee-saved pushes (`rbp` plus five more) land `rsp` at
/// `entry_rsp - 48`, and `entry_rsp` is itself `8 (mod 16)` per the System V ABI (the
/// caller's `call` just pushed an 8-byte return address), so `N` must be `8 (mod 16)`
/// for the net adjustment to restore 16-byte alignment before a nested `call`.
fn scan_frame_size(cfg: &crate::cfg::Cfg<Instr>, frame_base: Register) -> usize {
    let mut min_offset = 0i32;
    for block in cfg.blocks() {
        for instr in block.code() {
            for operand in &instr.operands {
                if let Operand::Memory(Memory { base: Some(base), displacement, .. }) = operand {
                    if *base == frame_base {
                        min_offset = min_offset.min(*displacement);
                    }
                }
            }
        }
    }
    let bytes = (-min_offset) as usize;
    (bytes + 15) / 16 * 16 + 8
}

/// Rewrites every virtual-register operand in `cfg` to the machine register the
/// allocator colored it with. Every virtual register must have a color by the time
/// this runs — the allocate/spill loop in [`compile_verified`] only exits once
/// `result.spilled` is empty.
fn apply_colors(cfg: &mut crate::cfg::Cfg<Instr>, colors: &std::collections::HashMap<Register, u32>) {
    let block_ids: Vec<BlockId> = cfg.blocks().map(|b| b.id()).collect();
    for id in block_ids {
        for instr in cfg.block_mut(id).code_mut() {
            for operand in instr.operands.iter_mut() {
                rewrite_operand_color(operand, colors);
            }
        }
    }
}

fn rewrite_operand_color(operand: &mut Operand, colors: &std::collections::HashMap<Register, u32>) {
    match operand {
        Operand::Register(r) => color_register(r, colors),
        Operand::Memory(Memory { base, index, .. }) => {
            if let Some(r) = base {
                color_register(r, colors);
            }
            if let Some(r) = index {
                color_register(r, colors);
            }
        }
        Operand::Immediate(_) | Operand::Label(_) => {}
    }
}

fn color_register(r: &mut Register, colors: &std::collections::HashMap<Register, u32>) {
    if r.space == RegisterSpace::Virtual {
        if let Some(&color) = colors.get(r) {
            *r = Register::machine(color);
        }
    }
}

/// Spec §8's correctness check: after coloring, no interference edge may share a
/// color. Recomputes liveness over the now machine-colored CFG and checks that no two
/// simultaneously-live registers collide on a color, aborting compilation (not
/// returning a runtime value) if the allocator produced an inconsistent result.
fn verify_no_interference_violations(cfg: &crate::cfg::Cfg<Instr>) -> Result<(), NetVmError> {
    use crate::regalloc::liveness;

    let live_out = liveness::compute(cfg);
    for block in cfg.blocks() {
        let mut live: std::collections::HashSet<Register> = live_out.get(&block.id()).cloned().unwrap_or_default();
        for instr in block.code().iter().rev() {
            for def in instr.defs() {
                for &other in &live {
                    if other != def && other.is_machine() && def.is_machine() && other.name == def.name {
                        return Err(NetVmError::Compile(CompileError::AllocatorInconsistency(def.name, other.name)));
                    }
                }
                live.remove(&def);
            }
            for u in instr.uses() {
                live.insert(u);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "serde")]
    #[test]
    fn compile_options_round_trip_through_json() {
        let options = CompileOptions::default();
        let json = serde_json::to_string(&options).unwrap();
        let restored: CompileOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.opt_level, options.opt_level);
        assert_eq!(restored.jit_flags, options.jit_flags);
        assert_eq!(restored.machine_registers, options.machine_registers);
    }

    #[test]
    fn minimal_push_segment_compiles_end_to_end() {
        // pop; ret
        let code = [0x01u8, 0x06];
        let header = SegmentHeader { max_stack_size: 1, locals_size: 0 };
        let compiled = compile_segment(&code, header, SegmentKind::Push, &CompileOptions::default()).unwrap();
        assert!(compiled.code_len > 0);
    }

    #[test]
    fn a_longer_arithmetic_segment_compiles_without_spilling_above_the_register_budget() {
        // push 1; push 2; add; push 3; add; pop; ret
        let mut code = Vec::new();
        for v in [1i32, 2] {
            code.push(0x04);
            code.extend_from_slice(&v.to_le_bytes());
        }
        code.push(0x30); // add
        code.push(0x04);
        code.extend_from_slice(&3i32.to_le_bytes());
        code.push(0x30); // add
        code.push(0x01); // pop
        code.push(0x06); // ret

        let header = SegmentHeader { max_stack_size: 3, locals_size: 0 };
        let compiled = compile_segment(&code, header, SegmentKind::Push, &CompileOptions::default()).unwrap();
        assert!(compiled.code_len > 0);
    }

    #[test]
    fn switch_compiles_and_reaches_its_case_block() {
        // switch on value 7 with cases {3->A,7->B,12->C} default D; each target a ret
        let mut code = vec![0x04u8];
        code.extend_from_slice(&7i32.to_le_bytes());
        let switch_offset = code.len();
        code.push(0x26);
        let placeholder = code.len();
        code.extend_from_slice(&[0u8; 8]); // default_rel, n_cases placeholders
        let case_count = 3u32;
        code.truncate(placeholder);
        code.extend_from_slice(&0i32.to_le_bytes()); // default_rel patched below
        code.extend_from_slice(&case_count.to_le_bytes());
        for (value, _) in [(3i32, 0), (7, 0), (12, 0)] {
            code.extend_from_slice(&value.to_le_bytes());
            code.extend_from_slice(&0i32.to_le_bytes()); // target_rel patched below
        }
        let after_switch = code.len();
        // Case/default blocks: A, B, C, D each a bare `ret` in sequence.
        let mut targets = Vec::new();
        for _ in 0..4 {
            targets.push(code.len());
            code.push(0x06);
        }
        let default_rel = (targets[3] as i64 - switch_offset as i64) as i32;
        code[placeholder..placeholder + 4].copy_from_slice(&default_rel.to_le_bytes());
        for (i, target_idx) in [0usize, 1, 2].into_iter().enumerate() {
            let entry_offset = placeholder + 8 + i * 8 + 4;
            let rel = (targets[target_idx] as i64 - switch_offset as i64) as i32;
            code[entry_offset..entry_offset + 4].copy_from_slice(&rel.to_le_bytes());
        }
        let _ = after_switch;

        let header = SegmentHeader { max_stack_size: 1, locals_size: 0 };
        let compiled = compile_segment(&code, header, SegmentKind::Push, &CompileOptions::default()).unwrap();
        assert!(compiled.code_len > 0);
    }
}
