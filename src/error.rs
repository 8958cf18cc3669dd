//! Crate-wide error types.
//!
//! Each compilation phase keeps its own error family so callers that only care about
//! one phase don't have to match on variants that can't occur there. [`NetVmError`]
//! aggregates all three for callers that want a single type, mirroring the way
//! `fuel-vm::error::InterpreterError` wraps `RuntimeError`.

use core::fmt;

use crate::container::ContainerError;
use crate::verifier::VerifyError;

/// Error raised while compiling verified NetIL into executable code.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum CompileError {
    /// Register allocation produced two same-colored registers across an
    /// interference edge. Indicates a bug in the allocator, not malformed input.
    #[display(fmt = "register allocator produced conflicting colors for {_0} and {_1}")]
    AllocatorInconsistency(u32, u32),
    /// An IR instruction could not be encoded for the selected target.
    #[display(fmt = "instruction at block {block} index {index} is not encodable on this target")]
    Unencodable {
        /// Block containing the offending instruction.
        block: u32,
        /// Index of the instruction within the block.
        index: u32,
    },
    /// The executable-page allocator could not reserve memory.
    #[display(fmt = "failed to allocate {_0} bytes of executable memory")]
    PageAllocationFailed(usize),
    /// A branch patch descriptor was left unpatched after emission completed.
    #[display(fmt = "branch to block {_0} was never patched")]
    UnpatchedBranch(u32),
}

/// Runtime exception raised while a compiled handler executes.
///
/// Discriminants are explicit and stable: a compiled handler reports a trap by
/// returning one of these values (0 meaning no trap) from its native entry point, so
/// the numbering here is part of the JIT/host calling convention, not just a Rust
/// implementation detail. See [`RuntimeException::trap_code`]/[`RuntimeException::from_trap_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u32)]
pub enum RuntimeException {
    /// Access past the end of the packet buffer.
    #[display(fmt = "packet memory access out of bounds")]
    PacketOutOfBounds = 1,
    /// Access past the end of the data (locals) area.
    #[display(fmt = "data memory access out of bounds")]
    DataOutOfBounds = 2,
    /// Access past the end of the info (metadata) area.
    #[display(fmt = "info memory access out of bounds")]
    InfoOutOfBounds = 3,
    /// Access past the end of shared/init memory.
    #[display(fmt = "shared memory access out of bounds")]
    InitMemOutOfBounds = 4,
    /// The evaluation stack underflowed or overflowed at runtime.
    #[display(fmt = "stack out of bounds at runtime")]
    StackOutOfBounds = 5,
    /// A coprocessor's internal self-check failed.
    #[display(fmt = "coprocessor self-check failed")]
    CoprocessorSelfCheck = 6,
    /// A computed jump target did not land on an instruction boundary.
    #[display(fmt = "jump target error")]
    JumpTarget = 7,
    /// A call referenced a coprocessor slot name with nothing registered in it.
    #[display(fmt = "unknown coprocessor")]
    UnknownCoprocessor = 8,
    /// A compiled `div`/`mod` divided by zero.
    #[display(fmt = "division by zero")]
    DivideByZero = 9,
}

impl RuntimeException {
    /// The trap code a compiled handler's native entry point returns for this
    /// exception. Nonzero by construction (0 is reserved for "ran to completion").
    pub fn trap_code(self) -> u32 {
        self as u32
    }

    /// Recovers the exception named by a compiled handler's nonzero return code.
    /// Returns `None` for a code this crate never emits (a corrupt or foreign trap).
    pub fn from_trap_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::PacketOutOfBounds),
            2 => Some(Self::DataOutOfBounds),
            3 => Some(Self::InfoOutOfBounds),
            4 => Some(Self::InitMemOutOfBounds),
            5 => Some(Self::StackOutOfBounds),
            6 => Some(Self::CoprocessorSelfCheck),
            7 => Some(Self::JumpTarget),
            8 => Some(Self::UnknownCoprocessor),
            9 => Some(Self::DivideByZero),
            _ => None,
        }
    }
}

/// Aggregated error for callers that don't need per-phase granularity.
#[derive(Debug, thiserror::Error)]
pub enum NetVmError {
    /// Bytecode failed verification; see the contained diagnostics for every error
    /// found, not just the first.
    #[error("verification failed with {} error(s)", .0.len())]
    Verify(Vec<VerifyError>),
    /// Compilation aborted at the first terminal error.
    #[error("compilation error: {0}")]
    Compile(#[from] CompileError),
    /// A handler raised a runtime exception while executing.
    #[error("runtime exception: {0}")]
    Runtime(RuntimeException),
    /// A PE image's container bytes were malformed.
    #[error("malformed PE image: {0}")]
    Container(ContainerError),
    /// A call referenced a [`crate::vm::PeHandle`] that no longer exists.
    #[error("unknown processing element handle")]
    UnknownPe,
    /// A call referenced a physical interface that was never registered.
    #[error("unknown physical interface: {0}")]
    UnknownInterface(String),
}

impl From<Vec<VerifyError>> for NetVmError {
    fn from(errors: Vec<VerifyError>) -> Self {
        Self::Verify(errors)
    }
}

impl From<RuntimeException> for NetVmError {
    fn from(e: RuntimeException) -> Self {
        Self::Runtime(e)
    }
}

/// Writes `err` into a caller-allocated error buffer as a NUL-terminated,
/// truncated-if-necessary diagnostic, per the public API's error-reporting contract
/// (every fallible entry point takes a buffer of at least 256 bytes).
///
/// Returns the number of bytes written, excluding the terminating NUL.
pub fn write_error(buf: &mut [u8], err: &dyn fmt::Display) -> usize {
    use std::io::Write;

    if buf.is_empty() {
        return 0;
    }
    let mut cursor = std::io::Cursor::new(&mut buf[..buf.len() - 1]);
    // `write!` stops at the cursor's capacity; any truncation is silent by design,
    // this is a diagnostic aid, not a protocol.
    let _ = write!(cursor, "{err}");
    let written = cursor.position() as usize;
    buf[written] = 0;
    written
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_error_nul_terminates() {
        let mut buf = [0xFFu8; 16];
        let n = write_error(&mut buf, &"hello");
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(buf[5], 0);
    }

    #[test]
    fn write_error_truncates_to_buffer_size() {
        let mut buf = [0u8; 8];
        let n = write_error(&mut buf, &"this message is far too long");
        assert_eq!(n, 7);
        assert_eq!(buf[7], 0);
    }

    #[test]
    fn every_runtime_exception_round_trips_through_its_trap_code() {
        let all = [
            RuntimeException::PacketOutOfBounds,
            RuntimeException::DataOutOfBounds,
            RuntimeException::InfoOutOfBounds,
            RuntimeException::InitMemOutOfBounds,
            RuntimeException::StackOutOfBounds,
            RuntimeException::CoprocessorSelfCheck,
            RuntimeException::JumpTarget,
            RuntimeException::UnknownCoprocessor,
            RuntimeException::DivideByZero,
        ];
        for exception in all {
            let code = exception.trap_code();
            assert_ne!(code, 0, "trap codes are reserved to be nonzero");
            assert_eq!(RuntimeException::from_trap_code(code), Some(exception));
        }
    }

    #[test]
    fn zero_is_not_a_recognised_trap_code() {
        assert_eq!(RuntimeException::from_trap_code(0), None);
    }
}
