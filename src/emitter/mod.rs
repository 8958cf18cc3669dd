//! Machine-code emitter.
//!
//! Allocates an executable region sized from a conservative per-opcode upper bound,
//! walks a [`crate::trace::Trace`] encoding each instruction via the selected target's
//! [`Encoder`], and patches every forward/backward branch and switch jump-table entry
//! once all block addresses are known. Executable-page allocation and the RW→RX
//! transition use the `region` crate, the same dependency `cranelift-jit` reaches for,
//! rather than hand-rolled `mmap`/`mprotect` FFI.

mod x86_64;

use std::collections::HashMap;

use crate::cfg::{BlockId, Cfg};
use crate::error::CompileError;
use crate::ir::{Instr, TargetOp};
use crate::trace::Trace;

/// A target backend's instruction encoder. One implementation per Cargo `target-*`
/// feature; exactly one is compiled in (see `crate::opcode`'s Design Note on
/// compile-time target selection).
pub trait Encoder {
    /// Conservative worst-case encoded length for any instruction, used to size the
    /// executable region before a single byte is emitted. Several `Instr`s (a
    /// `BoundsCheck`, a `CoprocessorInvoke`) lower to more than one real machine
    /// instruction, so this is a per-`Instr` bound, not a per-machine-instruction one.
    fn max_instruction_len(&self) -> usize;

    /// Encodes `instr` into `out`, returning a patch descriptor if it contains a
    /// branch displacement that could not be resolved yet (the target block's address
    /// is filled in during [`emit`]'s patch phase).
    fn encode(&self, instr: &Instr, out: &mut Vec<u8>) -> Option<PendingPatch>;

    /// Emits the segment's entry prologue: save callee-saved registers, establish the
    /// frame pointer, load the context-base register from the incoming argument, and
    /// reserve `frame_size_bytes` of spill-slot space below it.
    fn encode_prologue(&self, frame_size_bytes: usize) -> Vec<u8>;
}

/// Where a not-yet-resolved branch displacement lives within the emitted byte stream.
#[derive(Debug, Clone, Copy)]
pub struct PendingPatch {
    /// Byte offset (from the start of the code region) of the 32-bit displacement
    /// field to patch.
    pub field_offset: usize,
    /// Byte offset of the instruction following the patched field, i.e. the base the
    /// displacement is relative to.
    pub instr_end_offset: usize,
    pub target: BlockId,
}

/// One entry in a dense switch's jump table: an 8-byte absolute address, patched once
/// its target block's address is known. `slot_offset` is filled in once the table's
/// base offset (which depends on the total code length) is known.
struct PendingTableEntry {
    slot_offset: usize,
    target: BlockId,
}

/// Number of colorable general-purpose machine registers the allocator targets on
/// this backend, and the `CompileOptions::machine_registers` default. Every color it
/// hands out maps to a System V AMD64 callee-saved register (`rbx`/`r12`/`r14`/`r15`),
/// leaving every caller-saved GPR free for the emitter's own instruction sequences
/// (`idiv`, variable shift counts, trampoline calls) to clobber without threatening a
/// live virtual register. See `emitter::x86_64`'s module documentation.
pub const COLORABLE_REGISTERS: u32 = 4;

/// A successfully emitted, page-protected segment.
pub struct CompiledSegment {
    region: region::Allocation,
    /// Byte length of the code actually written (≤ the allocated region size).
    pub code_len: usize,
    /// Starting address of each block, keyed by id.
    pub block_addresses: HashMap<BlockId, usize>,
    /// Byte size of the locals buffer this segment's declared locals need; the host
    /// allocates exactly this many bytes and passes it as `ExecContext::locals_ptr`.
    pub locals_size_bytes: usize,
}

impl CompiledSegment {
    /// Base address of the executable region.
    pub fn base_address(&self) -> usize {
        self.region.as_ptr::<u8>() as usize
    }

    /// The emitted machine code, as a read-only byte slice.
    pub fn code(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.region.as_ptr::<u8>(), self.code_len) }
    }
}

/// Emits `cfg` in `trace` order into a freshly allocated executable page.
///
/// `frame_size_bytes` is the spill area the prologue reserves below the frame pointer
/// (from the allocate/spill loop's final round); `locals_size_bytes` is recorded on
/// the returned segment for the caller to size a locals buffer per dispatch.
pub fn emit(cfg: &Cfg<Instr>, trace: &Trace, frame_size_bytes: usize, locals_size_bytes: usize) -> Result<CompiledSegment, CompileError> {
    let encoder = select_encoder();

    let instruction_count: usize = trace.order.iter().map(|&b| cfg.block(b).code().len()).sum();
    let upper_bound = instruction_count * encoder.max_instruction_len() + encoder.max_instruction_len() + 1;
    let page = region::page::size();
    let region_len = ((upper_bound + page - 1) / page).max(1) * page;

    let mut allocation = region::alloc(region_len, region::Protection::READ_WRITE)
        .map_err(|_| CompileError::PageAllocationFailed(region_len))?;

    let mut code: Vec<u8> = Vec::with_capacity(upper_bound);
    code.extend(encoder.encode_prologue(frame_size_bytes));
    let mut block_addresses = HashMap::new();
    let mut patches: Vec<PendingPatch> = Vec::new();
    // `(switch instruction's code offset, case table)` pairs; the table itself is
    // appended to `code` once every block address is known, after the main loop.
    let mut pending_switches: Vec<(usize, &Instr)> = Vec::new();

    for &block_id in &trace.order {
        block_addresses.insert(block_id, code.len());
        for instr in cfg.block(block_id).code() {
            if instr.op == TargetOp::SwitchDispatch {
                pending_switches.push((code.len(), instr));
                x86_64::encode_switch_stub(&mut code, instr);
                continue;
            }
            if let Some(patch) = encoder.encode(instr, &mut code) {
                patches.push(patch);
            }
        }
    }

    let table_base = align_up(code.len(), 8);
    code.resize(table_base, 0);
    let mut table_entries: Vec<PendingTableEntry> = Vec::new();
    for (dispatch_offset, instr) in &pending_switches {
        let default_target = instr.branch_target().expect("switch dispatch always carries a default label");
        x86_64::patch_switch_table_base(&mut code, *dispatch_offset, table_base + table_entries.len() * 8);
        table_entries.push(PendingTableEntry { slot_offset: table_base + table_entries.len() * 8, target: default_target });
        for &(_, target) in &instr.switch_cases {
            table_entries.push(PendingTableEntry { slot_offset: table_base + table_entries.len() * 8, target });
        }
    }
    code.resize(table_base + table_entries.len() * 8, 0);

    if code.len() > allocation.len() {
        return Err(CompileError::PageAllocationFailed(code.len()));
    }

    let base = allocation.as_mut_ptr::<u8>();
    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), base, code.len());
    }

    for patch in &patches {
        let target_addr = *block_addresses
            .get(&patch.target)
            .ok_or(CompileError::UnpatchedBranch(patch.target.0))?;
        let displacement = target_addr as i64 - patch.instr_end_offset as i64;
        let bytes = (displacement as i32).to_le_bytes();
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(patch.field_offset), 4);
        }
    }

    for entry in &table_entries {
        let target_addr = *block_addresses
            .get(&entry.target)
            .ok_or(CompileError::UnpatchedBranch(entry.target.0))?;
        let absolute = base as usize + target_addr;
        let bytes = (absolute as u64).to_le_bytes();
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(entry.slot_offset), 8);
        }
    }

    region::protect(base, allocation.len(), region::Protection::READ_EXECUTE)
        .map_err(|_| CompileError::PageAllocationFailed(allocation.len()))?;

    Ok(CompiledSegment { region: allocation, code_len: code.len(), block_addresses, locals_size_bytes })
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

/// Selects the `Encoder` for whichever `target-*` Cargo feature is enabled. Only the
/// x86-64 encoder exists today; `target-x86` and `target-octeon-mips64` are accepted
/// at the feature-flag level (so the rest of the pipeline is target-agnostic) but
/// fail to compile until their encoders land, rather than silently falling back to
/// the wrong backend.
#[cfg(feature = "target-x86_64")]
fn select_encoder() -> Box<dyn Encoder> {
    Box::new(x86_64::X86_64Encoder)
}

#[cfg(feature = "target-x86")]
fn select_encoder() -> Box<dyn Encoder> {
    compile_error!("target-x86 encoder is not implemented yet; see DESIGN.md \"Known gaps\"");
}

#[cfg(feature = "target-octeon-mips64")]
fn select_encoder() -> Box<dyn Encoder> {
    compile_error!("target-octeon-mips64 encoder is not implemented yet; see DESIGN.md \"Known gaps\"");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Operand;
    use crate::trace;

    #[test]
    fn minimal_segment_emits_and_protects_a_region() {
        let mut cfg: Cfg<Instr> = Cfg::new();
        let block = cfg.create_block();
        cfg.block_mut(block).code_mut().push(Instr::new(TargetOp::Ret, vec![]));

        let trace = trace::build(&cfg, block);
        let compiled = emit(&cfg, &trace, 0, 0).unwrap();
        assert!(compiled.code_len > 0);
    }

    #[test]
    fn forward_branch_is_patched_to_its_targets_address() {
        let mut cfg: Cfg<Instr> = Cfg::new();
        let a = cfg.create_block();
        let b = cfg.create_block();
        cfg.add_successor(a, b);
        cfg.block_mut(a).code_mut().push(Instr::new(TargetOp::Jmp, vec![Operand::Label(b)]));
        cfg.block_mut(b).code_mut().push(Instr::new(TargetOp::Ret, vec![]));

        let trace = trace::build(&cfg, a);
        let compiled = emit(&cfg, &trace, 0, 0).unwrap();
        assert!(compiled.block_addresses.contains_key(&b));
    }
}
