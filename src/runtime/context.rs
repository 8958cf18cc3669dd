//! The native calling-convention record a compiled handler receives.
//!
//! A compiled segment's entry point has signature
//! `unsafe extern "C" fn(*mut ExecContext) -> u64`: the host builds one `ExecContext`
//! per dispatch, passes its address in `rdi` per the System V AMD64 ABI, and the
//! compiled code addresses every NetIL memory area, the locals slots and the
//! coprocessor register window through it rather than through any fixed machine
//! register (spec §3's "base pointer" operands become field reads here). A return
//! value of `0` means the handler ran to completion; any other value is a
//! [`RuntimeException::trap_code`].
//!
//! Every field is eight bytes wide and declared in address order, so the byte offset
//! of field `N` is simply `8 * N` — `emitter::x86_64` relies on that to generate
//! `[r13 + offset]` addressing without consulting this type's layout at compile time.

use crate::coprocessors::CoprocessorTable;
use crate::error::RuntimeException;
use crate::runtime::ExchangeBuffer;

/// Number of coprocessor registers `copreg`/`copwreg` can address through the inline
/// window. Every coprocessor shipped in this crate (`lookup*`, `regexp`,
/// `stringmatching`) fits comfortably under this; a coprocessor needing more would
/// need a larger window, which is a known limit, not a silent truncation (see
/// DESIGN.md).
pub const COPROCESSOR_REG_SLOTS: usize = 32;

#[repr(C)]
pub struct ExecContext {
    pub packet_ptr: *mut u8,
    pub packet_len: u64,
    pub data_ptr: *mut u8,
    pub data_len: u64,
    pub shared_ptr: *mut u8,
    pub shared_len: u64,
    pub locals_ptr: *mut u8,
    pub coprocessor_table: *mut CoprocessorTable,
    pub exbuf: *const ExchangeBuffer,
    pub coprocessor_regs: [u64; COPROCESSOR_REG_SLOTS],
}

/// Field byte offsets from `ExecContext`'s base address, matching its declaration
/// order at eight bytes per field. `lowering.rs`'s pseudo-registers (`LOCALS_BASE_REG`,
/// `PACKET_LEN_REG`, the `area_base_register`/`area_length_register` family, and
/// `COPROCESSOR_REG_BASE + op_id`) resolve to exactly these offsets in
/// `emitter::x86_64`; nowhere else needs to know the mapping.
pub const OFFSET_PACKET_PTR: i32 = 0;
pub const OFFSET_PACKET_LEN: i32 = 8;
pub const OFFSET_DATA_PTR: i32 = 16;
pub const OFFSET_DATA_LEN: i32 = 24;
pub const OFFSET_SHARED_PTR: i32 = 32;
pub const OFFSET_SHARED_LEN: i32 = 40;
pub const OFFSET_LOCALS_PTR: i32 = 48;
pub const OFFSET_COPROCESSOR_TABLE: i32 = 56;
pub const OFFSET_EXBUF: i32 = 64;
pub const OFFSET_COPROCESSOR_REGS: i32 = 72;

/// The `CoprocessorInvoke` trampoline a compiled segment calls into. Resolves
/// `copro_id` against the canonical slot table and dispatches `op_id` against its
/// current register contents, mirroring [`crate::runtime::ProcessingElement::invoke_coprocessor`]
/// for the host-invoked path — this is the bytecode-invoked (`copinvoke`) path, called
/// directly from JIT-compiled code rather than through the public API.
///
/// # Safety
/// `ctx` must point at a live `ExecContext` built by
/// [`crate::runtime::ProcessingElement::dispatch`] for the duration of this call.
pub unsafe extern "C" fn coprocessor_trampoline(ctx: *mut ExecContext, copro_id: u64, op_id: u64) -> u64 {
    let ctx = &mut *ctx;
    let Some(&name) = crate::coprocessors::CANONICAL_SLOTS.get(copro_id as usize) else {
        return RuntimeException::UnknownCoprocessor.trap_code() as u64;
    };
    let table = &mut *ctx.coprocessor_table;
    let Some(coprocessor) = table.get_mut(name) else {
        return RuntimeException::UnknownCoprocessor.trap_code() as u64;
    };
    let exbuf = &*ctx.exbuf;
    match coprocessor.invoke(op_id as u32, exbuf) {
        Ok(()) => 0,
        Err(exception) => exception.trap_code() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_offsets_match_declaration_order() {
        let ctx = ExecContext {
            packet_ptr: std::ptr::null_mut(),
            packet_len: 0,
            data_ptr: std::ptr::null_mut(),
            data_len: 0,
            shared_ptr: std::ptr::null_mut(),
            shared_len: 0,
            locals_ptr: std::ptr::null_mut(),
            coprocessor_table: std::ptr::null_mut(),
            exbuf: std::ptr::null(),
            coprocessor_regs: [0; COPROCESSOR_REG_SLOTS],
        };
        let base = &ctx as *const ExecContext as usize;
        assert_eq!(&ctx.packet_ptr as *const _ as usize - base, OFFSET_PACKET_PTR as usize);
        assert_eq!(&ctx.packet_len as *const _ as usize - base, OFFSET_PACKET_LEN as usize);
        assert_eq!(&ctx.data_ptr as *const _ as usize - base, OFFSET_DATA_PTR as usize);
        assert_eq!(&ctx.data_len as *const _ as usize - base, OFFSET_DATA_LEN as usize);
        assert_eq!(&ctx.shared_ptr as *const _ as usize - base, OFFSET_SHARED_PTR as usize);
        assert_eq!(&ctx.shared_len as *const _ as usize - base, OFFSET_SHARED_LEN as usize);
        assert_eq!(&ctx.locals_ptr as *const _ as usize - base, OFFSET_LOCALS_PTR as usize);
        assert_eq!(&ctx.coprocessor_table as *const _ as usize - base, OFFSET_COPROCESSOR_TABLE as usize);
        assert_eq!(&ctx.exbuf as *const _ as usize - base, OFFSET_EXBUF as usize);
        assert_eq!(&ctx.coprocessor_regs as *const _ as usize - base, OFFSET_COPROCESSOR_REGS as usize);
    }
}
