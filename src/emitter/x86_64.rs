//! x86-64 instruction encoder.
//!
//! Emits genuine REX/ModRM/SIB-encoded machine code: every [`crate::ir::Instr`]
//! becomes the real x86-64 bytes a disassembler would recognise, not a tag byte. Two
//! simplifications keep the encoder tractable and are deliberate, not oversights:
//!
//! - Every memory operand is encoded with `mod=0b10` (a 32-bit displacement), even
//!   when the displacement is zero. This sidesteps two ModRM/SIB special cases
//!   (`mod=00,rm=101` meaning RIP-relative, and `mod=00,SIB.base=101` meaning
//!   no-base) at the cost of four wasted displacement bytes per memory access.
//! - The allocator only ever hands out [`crate::emitter::COLORABLE_REGISTERS`] colors,
//!   each pinned to a System V AMD64 callee-saved physical register (`rbx`, `r12`,
//!   `r14`, `r15`). That leaves every caller-saved GPR free for this encoder's own
//!   multi-instruction sequences (`idiv`'s implicit `rdx:rax`, shift-by-`cl`, the
//!   coprocessor trampoline call) to clobber without ever touching a live value.
//!   `rbp` is the frame/spill-slot base, `r13` is a dedicated context-base register
//!   holding the `ExecContext*` passed in `rdi`, and `r11` is a dedicated scratch
//!   register used only to materialise a pointer held in an `ExecContext` field (a
//!   pseudo-register serving as a `Memory` operand's base) before it can address
//!   memory. None of `rax`/`rcx`/`rdx`/`rsi`/`rdi`/`r8`-`r10` is ever assigned to a
//!   live virtual register, so this encoder uses them freely as scratch.
//!
//! Lowering's pseudo-registers (`Register::machine(n)` for `n >= 100`, see
//! `crate::lowering`) never reach a physical register directly: a bare pseudo
//! `Operand::Register` is rewritten here into a `[r13 + offset]` access against
//! [`crate::runtime::context::ExecContext`], and a pseudo serving as a `Memory`
//! operand's base is first loaded into `r11` (it names a pointer field, e.g.
//! `packet_ptr`) before the real address is formed.

use super::{Encoder, PendingPatch};
use crate::ir::{Condition, Instr, Memory, Operand, Register, TargetOp, Width};
use crate::runtime::context;

/// Conservative per-`Instr` byte budget: several `Instr`s (`BoundsCheck`,
/// `CoprocessorInvoke`, `Div`) expand into a short, self-contained sequence of real
/// machine instructions rather than a single one.
const MAX_INSTR_LEN: usize = 160;

// Physical register encodings (the 4-bit number ModRM/SIB/REX address a register by).
const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RBX: u8 = 3;
const RBP: u8 = 5;
const RSI: u8 = 6;
const RDI: u8 = 7;
const R11: u8 = 11;
const R12: u8 = 12;
const R13: u8 = 13;
const R14: u8 = 14;
const R15: u8 = 15;

/// Number of bytes the prologue pushes after it snapshots `rbp`, i.e. the offset of
/// the post-prologue `rsp` below `rbp`. Every epilogue (one per `Ret`, plus one per
/// inline trap sequence) restores exactly this.
const CALLEE_SAVED_BYTES: i32 = 40;

pub struct X86_64Encoder;

impl Encoder for X86_64Encoder {
    fn max_instruction_len(&self) -> usize {
        MAX_INSTR_LEN
    }

    fn encode(&self, instr: &Instr, out: &mut Vec<u8>) -> Option<PendingPatch> {
        if instr.op == TargetOp::SwitchDispatch {
            encode_switch_stub(out, instr);
            return None;
        }

        match instr.op {
            TargetOp::Mov => encode_mov(instr, out),
            TargetOp::Load { width, signed } => encode_load(instr, width, signed, out),
            TargetOp::Store { width } => encode_store(instr, width, out),
            TargetOp::Add => encode_binop(instr, 0x01, out),
            TargetOp::Sub => encode_binop(instr, 0x29, out),
            TargetOp::And => encode_binop(instr, 0x21, out),
            TargetOp::Or => encode_binop(instr, 0x09, out),
            TargetOp::Xor => encode_binop(instr, 0x31, out),
            TargetOp::Mul => encode_imul(instr, out),
            TargetOp::Div => encode_div(instr, out),
            TargetOp::Neg => encode_unop_f7(instr, 3, out),
            TargetOp::Not => encode_unop_f7(instr, 2, out),
            TargetOp::Shl => encode_shift(instr, 4, out),
            TargetOp::Shr => encode_shift(instr, 5, out),
            TargetOp::Sar => encode_shift(instr, 7, out),
            TargetOp::Cmp => encode_cmp(instr, out),
            TargetOp::BoundsCheck => encode_bounds_check(instr, out),
            TargetOp::CoprocessorInvoke => encode_coprocessor_invoke(instr, out),
            TargetOp::Ret => out.extend(success_return()),
            TargetOp::ReloadSpill => encode_load_word(instr, out),
            TargetOp::StoreSpill => encode_store_word(instr, out),
            TargetOp::Jmp | TargetOp::Jcc(_) | TargetOp::Call => {}
            TargetOp::SwitchDispatch => unreachable!("handled above"),
        }

        match instr.op {
            TargetOp::Jmp => {
                out.push(0xE9);
                let field_offset = out.len();
                out.extend_from_slice(&0i32.to_le_bytes());
                let instr_end_offset = out.len();
                instr.branch_target().map(|target| PendingPatch { field_offset, instr_end_offset, target })
            }
            TargetOp::Jcc(cond) => {
                out.push(0x0F);
                out.push(jcc_opcode(cond));
                let field_offset = out.len();
                out.extend_from_slice(&0i32.to_le_bytes());
                let instr_end_offset = out.len();
                instr.branch_target().map(|target| PendingPatch { field_offset, instr_end_offset, target })
            }
            TargetOp::Call => {
                out.push(0xE8);
                let field_offset = out.len();
                out.extend_from_slice(&0i32.to_le_bytes());
                let instr_end_offset = out.len();
                instr.branch_target().map(|target| PendingPatch { field_offset, instr_end_offset, target })
            }
            _ => None,
        }
    }

    fn encode_prologue(&self, frame_size_bytes: usize) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(0x55); // push rbp
        out.extend([0x48, 0x89, 0xE5]); // mov rbp, rsp
        out.push(0x53); // push rbx
        out.extend([0x41, 0x54]); // push r12
        out.extend([0x41, 0x55]); // push r13
        out.extend([0x41, 0x56]); // push r14
        out.extend([0x41, 0x57]); // push r15
        out.extend([0x49, 0x89, 0xFD]); // mov r13, rdi
        if frame_size_bytes > 0 {
            out.extend([0x48, 0x81, 0xEC]); // sub rsp, imm32
            out.extend_from_slice(&(frame_size_bytes as i32).to_le_bytes());
        }
        out
    }
}

fn push_rex(out: &mut Vec<u8>, w: bool, r: bool, x: bool, b: bool) {
    if w || r || x || b {
        out.push(0x40 | (w as u8) << 3 | (r as u8) << 2 | (x as u8) << 1 | (b as u8));
    }
}

fn modrm(md: u8, reg: u8, rm: u8) -> u8 {
    (md << 6) | ((reg & 7) << 3) | (rm & 7)
}

fn sib(scale: u8, index: u8, base: u8) -> u8 {
    (scale << 6) | ((index & 7) << 3) | (base & 7)
}

/// Where an operand lives once pseudo-registers are resolved: either a real physical
/// register, or a `[base (+ index*scale)? + disp32]` memory access.
enum Place {
    Reg(u8),
    Mem { base: u8, index: Option<(u8, u8)>, disp: i32 },
}

/// The byte offset of `ExecContext` field represented by pseudo-register `name`, per
/// `lowering.rs`'s pseudo-register scheme.
fn context_offset(name: u32) -> i32 {
    match name {
        100 => context::OFFSET_LOCALS_PTR,
        101 => context::OFFSET_PACKET_LEN,
        102 => context::OFFSET_DATA_LEN,
        103 => context::OFFSET_SHARED_LEN,
        110 => context::OFFSET_PACKET_PTR,
        111 => context::OFFSET_DATA_PTR,
        112 => context::OFFSET_SHARED_PTR,
        n if n >= 200 => {
            let slot = n - 200;
            assert!((slot as usize) < context::COPROCESSOR_REG_SLOTS, "coprocessor register slot {slot} out of range");
            context::OFFSET_COPROCESSOR_REGS + slot as i32 * 8
        }
        n => panic!("x86_64 encoder: unrecognised pseudo-register {n}"),
    }
}

/// Maps a colorable color or the frame-base register to its physical encoding.
/// Pseudo-registers (`name >= 100`) never reach this function directly; callers route
/// them through [`context_offset`] instead.
fn physical(reg: Register) -> u8 {
    match reg.name {
        0 => RBX,
        1 => R12,
        2 => R14,
        3 => R15,
        4 => RBP,
        n => panic!(
            "x86_64 encoder: register name {n} is neither one of the {} colorable registers nor the frame base; \
             this backend requires CompileOptions::machine_registers == crate::emitter::COLORABLE_REGISTERS",
            crate::emitter::COLORABLE_REGISTERS
        ),
    }
}

/// Resolves an operand to where it lives, materialising a pseudo `Memory` base
/// pointer into `r11` first if needed.
fn place_of(operand: &Operand, out: &mut Vec<u8>) -> Place {
    match operand {
        Operand::Register(r) if r.name >= 100 => Place::Mem { base: R13, index: None, disp: context_offset(r.name) },
        Operand::Register(r) => Place::Reg(physical(*r)),
        Operand::Memory(Memory { base: Some(b), index, scale, displacement, .. }) => {
            let base = if b.name >= 100 {
                emit_mov_r64_mem64(out, R11, R13, context_offset(b.name));
                R11
            } else {
                physical(*b)
            };
            let index = (*index).map(|i| (physical(i), *scale));
            Place::Mem { base, index, disp: *displacement }
        }
        Operand::Memory(Memory { base: None, .. }) => unreachable!("every Memory operand in this IR carries a base"),
        Operand::Immediate(_) | Operand::Label(_) => unreachable!("not an addressable operand"),
    }
}

/// `mov dst64, [base64 + disp]` — used only to materialise a pointer field out of
/// `ExecContext` into a scratch register.
fn emit_mov_r64_mem64(out: &mut Vec<u8>, dst: u8, base: u8, disp: i32) {
    push_rex(out, true, dst >= 8, false, base >= 8);
    out.push(0x8B);
    out.push(modrm(0b10, dst, base));
    out.extend_from_slice(&disp.to_le_bytes());
}

/// Encodes `opcode_bytes reg_field, place` (or the reverse, per `reg_is_dst`), i.e. a
/// standard `/r` instruction with an optional multi-byte opcode prefix (`0x0F ...`).
fn encode_reg_rm(out: &mut Vec<u8>, opcode_bytes: &[u8], reg_field: u8, place: Place, rex_w: bool, operand_size_prefix: bool) {
    if operand_size_prefix {
        out.push(0x66);
    }
    match place {
        Place::Reg(rm) => {
            push_rex(out, rex_w, reg_field >= 8, false, rm >= 8);
            out.extend_from_slice(opcode_bytes);
            out.push(modrm(0b11, reg_field, rm));
        }
        Place::Mem { base, index, disp } => {
            push_rex(out, rex_w, reg_field >= 8, index.map(|(i, _)| i >= 8).unwrap_or(false), base >= 8);
            out.extend_from_slice(opcode_bytes);
            match index {
                Some((idx, scale)) => {
                    out.push(modrm(0b10, reg_field, 0b100));
                    out.push(sib(scale, idx, base));
                }
                None => out.push(modrm(0b10, reg_field, base)),
            }
            out.extend_from_slice(&disp.to_le_bytes());
        }
    }
}

fn encode_mov(instr: &Instr, out: &mut Vec<u8>) {
    let dst = &instr.operands[0];
    let src = &instr.operands[1];

    if let Operand::Immediate(value) = src {
        let dst_place = place_of(dst, out);
        match dst_place {
            Place::Reg(rd) => {
                push_rex(out, false, false, false, rd >= 8);
                out.push(0xB8 + (rd & 7));
                out.extend_from_slice(&(*value as i32).to_le_bytes());
            }
            Place::Mem { base, index, disp } => {
                push_rex(out, false, false, index.map(|(i, _)| i >= 8).unwrap_or(false), base >= 8);
                out.push(0xC7);
                match index {
                    Some((idx, scale)) => {
                        out.push(modrm(0b10, 0, 0b100));
                        out.push(sib(scale, idx, base));
                    }
                    None => out.push(modrm(0b10, 0, base)),
                }
                out.extend_from_slice(&disp.to_le_bytes());
                out.extend_from_slice(&(*value as i32).to_le_bytes());
            }
        }
        return;
    }

    let dst_place = place_of(dst, out);
    match dst_place {
        Place::Reg(rd) => {
            let src_place = place_of(src, out);
            encode_reg_rm(out, &[0x8B], rd, src_place, false, false);
        }
        Place::Mem { .. } => {
            let src_reg = src.as_register().expect("mov into a memory/pseudo destination always has a register source");
            encode_reg_rm(out, &[0x89], physical(src_reg), dst_place, false, false);
        }
    }
}

fn encode_load(instr: &Instr, width: Width, signed: bool, out: &mut Vec<u8>) {
    let dst = physical(instr.operands[0].as_register().unwrap());
    let mem_place = place_of(&instr.operands[1], out);
    match width {
        Width::Byte if signed => encode_reg_rm(out, &[0x0F, 0xBE], dst, mem_place, false, false),
        Width::Byte => encode_reg_rm(out, &[0x0F, 0xB6], dst, mem_place, false, false),
        Width::Half if signed => encode_reg_rm(out, &[0x0F, 0xBF], dst, mem_place, false, false),
        Width::Half => encode_reg_rm(out, &[0x0F, 0xB7], dst, mem_place, false, false),
        Width::Word => encode_reg_rm(out, &[0x8B], dst, mem_place, false, false),
    }
}

fn encode_store(instr: &Instr, width: Width, out: &mut Vec<u8>) {
    let mem_place = place_of(&instr.operands[0], out);
    let src = physical(instr.operands[1].as_register().unwrap());
    match width {
        Width::Byte => encode_reg_rm(out, &[0x88], src, mem_place, false, false),
        Width::Half => encode_reg_rm(out, &[0x89], src, mem_place, false, true),
        Width::Word => encode_reg_rm(out, &[0x89], src, mem_place, false, false),
    }
}

fn encode_load_word(instr: &Instr, out: &mut Vec<u8>) {
    let dst = physical(instr.operands[0].as_register().unwrap());
    let mem_place = place_of(&instr.operands[1], out);
    encode_reg_rm(out, &[0x8B], dst, mem_place, false, false);
}

fn encode_store_word(instr: &Instr, out: &mut Vec<u8>) {
    let mem_place = place_of(&instr.operands[0], out);
    let src = physical(instr.operands[1].as_register().unwrap());
    encode_reg_rm(out, &[0x89], src, mem_place, false, false);
}

/// `add`/`sub`/`and`/`or`/`xor dst, src` (`dst` was already moved from its logical
/// lhs by lowering): `OP r/m32, r32` so `r/m32 (dst)` is updated in place.
fn encode_binop(instr: &Instr, opcode: u8, out: &mut Vec<u8>) {
    let dst = physical(instr.operands[0].as_register().unwrap());
    let src = physical(instr.operands[1].as_register().unwrap());
    push_rex(out, false, src >= 8, false, dst >= 8);
    out.push(opcode);
    out.push(modrm(0b11, src, dst));
}

fn encode_cmp(instr: &Instr, out: &mut Vec<u8>) {
    let lhs = physical(instr.operands[0].as_register().unwrap());
    let rhs = physical(instr.operands[1].as_register().unwrap());
    push_rex(out, false, rhs >= 8, false, lhs >= 8);
    out.push(0x39);
    out.push(modrm(0b11, rhs, lhs));
}

fn encode_imul(instr: &Instr, out: &mut Vec<u8>) {
    let dst = physical(instr.operands[0].as_register().unwrap());
    let src = physical(instr.operands[1].as_register().unwrap());
    push_rex(out, false, dst >= 8, false, src >= 8);
    out.push(0x0F);
    out.push(0xAF);
    out.push(modrm(0b11, dst, src));
}

fn encode_unop_f7(instr: &Instr, ext: u8, out: &mut Vec<u8>) {
    let dst = physical(instr.operands[0].as_register().unwrap());
    push_rex(out, false, false, false, dst >= 8);
    out.push(0xF7);
    out.push(modrm(0b11, ext, dst));
}

/// `shl`/`shr`/`sar dst, cl` — the count register is first moved into `cl` (x86's
/// variable-shift form can only read the count from there).
fn encode_shift(instr: &Instr, ext: u8, out: &mut Vec<u8>) {
    let dst = physical(instr.operands[0].as_register().unwrap());
    let count = physical(instr.operands[1].as_register().unwrap());
    // mov cl, count_reg (mov r/m8, r8)
    push_rex(out, false, count >= 8, false, false);
    out.push(0x88);
    out.push(modrm(0b11, count, RCX));
    // shl/shr/sar r/m32, cl
    push_rex(out, false, false, false, dst >= 8);
    out.push(0xD3);
    out.push(modrm(0b11, ext, dst));
}

/// `idiv` clobbers `rdx:rax`; neither is ever a colored register, so no save/restore
/// is needed around it. Guards the divisor against zero first, since a hardware `idiv`
/// by zero raises `#DE` rather than returning a value this code could check.
fn encode_div(instr: &Instr, out: &mut Vec<u8>) {
    let dst = physical(instr.operands[0].as_register().unwrap());
    let rhs = physical(instr.operands[1].as_register().unwrap());

    // test rhs, rhs
    push_rex(out, false, rhs >= 8, false, rhs >= 8);
    out.push(0x85);
    out.push(modrm(0b11, rhs, rhs));
    skip_over(out, 0x75 /* jnz */, trap_body_imm(RuntimeExceptionTrapCode::DIVIDE_BY_ZERO));

    // mov eax, dst
    push_rex(out, false, false, false, dst >= 8);
    out.push(0x89);
    out.push(modrm(0b11, dst, RAX));
    // cdq
    out.push(0x99);
    // idiv rhs
    push_rex(out, false, false, false, rhs >= 8);
    out.push(0xF7);
    out.push(modrm(0b11, 7, rhs));
    // mov dst, eax
    push_rex(out, false, false, false, dst >= 8);
    out.push(0x89);
    out.push(modrm(0b11, RAX, dst));
}

/// `len` is always one of `lowering`'s area-length pseudo-registers (`PACKET_LEN_REG`
/// and friends), never a colored register, so it is read as a `[r13 + offset]`
/// operand rather than compared register-to-register.
fn encode_bounds_check(instr: &Instr, out: &mut Vec<u8>) {
    let index = physical(instr.operands[0].as_register().unwrap());
    let len_place = place_of(&instr.operands[1], out);
    let Operand::Immediate(trap_code) = instr.operands[2] else {
        panic!("BoundsCheck's third operand is always an immediate trap code");
    };

    // cmp index, len  (index - len; CF set iff index < len, unsigned)
    encode_reg_rm(out, &[0x3B], index, len_place, false, false);
    skip_over(out, 0x72 /* jb: in bounds, skip the trap */, trap_body_imm(trap_code));
}

/// Calls [`context::coprocessor_trampoline`] and traps with its returned code if
/// nonzero. The trampoline already encodes [`crate::error::RuntimeException`] as a
/// `u32`; this sequence propagates it rather than synthesising a new code.
fn encode_coprocessor_invoke(instr: &Instr, out: &mut Vec<u8>) {
    let Operand::Immediate(copro_id) = instr.operands[0] else { panic!("CoprocessorInvoke's first operand is always an immediate") };
    let Operand::Immediate(op_id) = instr.operands[1] else { panic!("CoprocessorInvoke's second operand is always an immediate") };

    // mov rdi, r13
    push_rex(out, true, true, false, false);
    out.push(0x89);
    out.push(modrm(0b11, R13, RDI));
    // mov esi, copro_id
    out.push(0xBE);
    out.extend_from_slice(&(copro_id as i32).to_le_bytes());
    // mov edx, op_id
    out.push(0xBA);
    out.extend_from_slice(&(op_id as i32).to_le_bytes());
    // movabs r11, coprocessor_trampoline
    push_rex(out, true, false, false, true);
    out.push(0xB8 + (R11 & 7));
    let trampoline_addr = context::coprocessor_trampoline as usize as u64;
    out.extend_from_slice(&trampoline_addr.to_le_bytes());
    // call r11
    push_rex(out, false, false, false, true);
    out.push(0xFF);
    out.push(modrm(0b11, 2, R11));
    // test eax, eax
    out.push(0x85);
    out.push(modrm(0b11, RAX, RAX));
    skip_over(out, 0x74 /* jz: trampoline succeeded, skip the trap */, epilogue_tail());
}

fn skip_over(out: &mut Vec<u8>, short_jcc_opcode: u8, body: Vec<u8>) {
    assert!(body.len() <= 127, "inline trap sequence exceeds the short-jump range");
    out.push(short_jcc_opcode);
    out.push(body.len() as u8);
    out.extend(body);
}

fn epilogue_tail() -> Vec<u8> {
    let mut out = Vec::new();
    // lea rsp, [rbp - CALLEE_SAVED_BYTES]
    out.extend([0x48, 0x8D, 0x65, (-CALLEE_SAVED_BYTES) as i8 as u8]);
    out.extend([0x41, 0x5F]); // pop r15
    out.extend([0x41, 0x5E]); // pop r14
    out.extend([0x41, 0x5D]); // pop r13
    out.extend([0x41, 0x5C]); // pop r12
    out.push(0x5B); // pop rbx
    out.push(0x5D); // pop rbp
    out.push(0xC3); // ret
    out
}

fn success_return() -> Vec<u8> {
    let mut out = vec![0x31, 0xC0]; // xor eax, eax
    out.extend(epilogue_tail());
    out
}

fn trap_body_imm(code: i64) -> Vec<u8> {
    let mut out = vec![0xB8];
    out.extend_from_slice(&(code as i32).to_le_bytes());
    out.extend(epilogue_tail());
    out
}

/// Trap codes this module needs as plain constants (mirroring
/// [`crate::error::RuntimeException::trap_code`] without an extra dependency edge).
struct RuntimeExceptionTrapCode;
impl RuntimeExceptionTrapCode {
    const DIVIDE_BY_ZERO: i64 = 9;
}

fn jcc_opcode(cond: Condition) -> u8 {
    match cond {
        Condition::Eq => 0x84,
        Condition::Ne => 0x85,
        Condition::Lt => 0x8C,
        Condition::Gt => 0x8F,
        Condition::Le => 0x8E,
        Condition::Ge => 0x8D,
    }
}

/// Emits the indirect-dispatch stub for a `switch`: `lea rax, [rip + disp32]` to find
/// the jump table (patched by [`patch_switch_table_base`] once its offset is known),
/// then `jmp [rax + value*8]`. Fixed at 11 bytes so the `lea`'s `disp32` field sits at
/// a known offset regardless of the value register chosen.
pub fn encode_switch_stub(out: &mut Vec<u8>, instr: &Instr) {
    let value = physical(instr.operands[0].as_register().unwrap());

    // lea rax, [rip + 0]  (patched below)
    out.extend([0x48, 0x8D, 0x05]);
    out.extend_from_slice(&0i32.to_le_bytes());

    // jmp [rax + value*8]  (REX emitted unconditionally to keep this fixed-length)
    out.push(0x40 | (((value >= 8) as u8) << 1));
    out.push(0xFF);
    out.push(modrm(0b00, 4, 0b100));
    out.push(sib(0b11, value, RAX));
}

/// Patches the `lea`'s `disp32` so it resolves to `table_base` (both code-relative
/// offsets into the same contiguous region, so the relative distance is invariant
/// under relocation).
pub fn patch_switch_table_base(code: &mut [u8], dispatch_offset: usize, table_base: usize) {
    let rip_after_lea = dispatch_offset + 7;
    let disp = table_base as i64 - rip_after_lea as i64;
    let bytes = (disp as i32).to_le_bytes();
    code[dispatch_offset + 3..dispatch_offset + 7].copy_from_slice(&bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AddrFlags, Operand};

    #[test]
    fn ret_encodes_a_real_epilogue_ending_in_a_ret_opcode() {
        let mut out = Vec::new();
        let patch = X86_64Encoder.encode(&Instr::new(TargetOp::Ret, vec![]), &mut out);
        assert!(patch.is_none());
        assert_eq!(*out.last().unwrap(), 0xC3);
        assert!(out.len() > 4, "a real epilogue is more than a single opcode byte");
    }

    #[test]
    fn jmp_to_a_resolved_label_carries_a_patch_at_the_right_offset() {
        let mut cfg: crate::cfg::Cfg<Instr> = crate::cfg::Cfg::new();
        let target = cfg.create_block();
        let mut out = Vec::new();
        let patch = X86_64Encoder.encode(&Instr::new(TargetOp::Jmp, vec![Operand::Label(target)]), &mut out);
        let patch = patch.expect("jmp to a label always yields a patch");
        assert_eq!(out[0], 0xE9);
        assert_eq!(patch.field_offset, 1);
        assert_eq!(patch.instr_end_offset, out.len());
    }

    #[test]
    fn add_encodes_a_real_two_register_modrm_form() {
        let dst = Register::machine(0); // rbx
        let src = Register::machine(1); // r12
        let mut out = Vec::new();
        X86_64Encoder.encode(&Instr::new(TargetOp::Add, vec![Operand::Register(dst), Operand::Register(src)]), &mut out);
        // REX.R (src=r12>=8) + 0x01 + modrm(11, r12, rbx)
        assert_eq!(out, vec![0x44, 0x01, modrm(0b11, R12, RBX)]);
    }

    #[test]
    fn mov_reads_a_pseudo_register_as_a_context_relative_load() {
        let dst = Register::machine(0);
        let len = Register::machine(101); // PACKET_LEN_REG
        let mut out = Vec::new();
        X86_64Encoder.encode(&Instr::new(TargetOp::Mov, vec![Operand::Register(dst), Operand::Register(len)]), &mut out);
        // mov rbx, [r13 + OFFSET_PACKET_LEN]
        assert_eq!(out[out.len() - 6], 0x8B, "a real mov opcode, not a tag byte");
        let disp = i32::from_le_bytes(out[out.len() - 4..].try_into().unwrap());
        assert_eq!(disp, context::OFFSET_PACKET_LEN);
    }

    #[test]
    fn store_to_an_area_base_pseudo_register_materialises_the_pointer_first() {
        let index = Register::machine(0);
        let value = Register::machine(1);
        let mem = Memory {
            base: Some(Register::machine(111)), // data area base pseudo
            index: Some(index),
            scale: 0,
            displacement: 0,
            flags: AddrFlags::BASE | AddrFlags::INDEX,
        };
        let mut out = Vec::new();
        X86_64Encoder.encode(&Instr::new(TargetOp::Store { width: Width::Byte }, vec![Operand::Memory(mem), Operand::Register(value)]), &mut out);
        // First a 64-bit load of data_ptr into r11 (REX.W+REX.B, opcode 0x8B), then the
        // real byte store through r11+index.
        assert_eq!(out[0], 0x4D, "REX.W|REX.R|REX.B: r11 is an extended dst, r13 an extended base");
        assert_eq!(out[1], 0x8B);
        assert!(out.contains(&0x88), "byte store opcode must appear after materialisation");
    }

    #[test]
    fn bounds_check_emits_a_self_contained_compare_and_trap() {
        let index = Register::machine(0); // rbx
        let len = Register::machine(101); // PACKET_LEN_REG pseudo, as real usage always passes
        let mut out = Vec::new();
        X86_64Encoder.encode(
            &Instr::new(TargetOp::BoundsCheck, vec![Operand::Register(index), Operand::Register(len), Operand::Immediate(2)]),
            &mut out,
        );
        assert_eq!(out[0], 0x41, "REX.B for the r13 context-base in the comparison's r/m field");
        assert_eq!(out[1], 0x3B, "cmp index, [r13+len_offset] reading the length from the context");
        let disp = i32::from_le_bytes(out[3..7].try_into().unwrap());
        assert_eq!(disp, context::OFFSET_PACKET_LEN);
        assert_eq!(out[7], 0x72, "jb short, skipping the trap body when in bounds");
        assert!(out.contains(&0xC3), "trap body ends in a real ret");
    }
}
