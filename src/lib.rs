//! NetIL bytecode verifier, JIT compiler and coprocessor runtime for packet-processing
//! pipelines.
//!
//! A segment of NetIL bytecode passes through [`verifier::verify`] to produce a typed
//! [`verifier::ByteCodeInfo`], then through [`compile::compile_verified`] (or the
//! combined [`compile::compile_segment`]) to reach an executable [`emitter::CompiledSegment`].
//! [`runtime::ProcessingElement`] owns the compiled segments and the coprocessor table
//! they call into at run time.
#![deny(unused_must_use)]

pub mod cfg;
pub mod compile;
pub mod container;
pub mod coprocessors;
pub mod emitter;
pub mod error;
pub mod ir;
pub mod lowering;
pub mod opcode;
pub mod regalloc;
pub mod runtime;
pub mod spiller;
pub mod trace;
pub mod verifier;
pub mod vm;

#[cfg(feature = "profile-any")]
pub mod profiler;

#[cfg(not(feature = "profile-any"))]
/// Placeholder used when no `profile-*` feature is enabled; every hook becomes a no-op
/// so `runtime::ProcessingElement` doesn't need its own `cfg` gate around the field.
pub mod profiler {
    use crate::runtime::SegmentSlot;

    #[derive(Default, Debug, Clone)]
    pub struct Profiler;

    impl Profiler {
        pub fn on_dispatch(&mut self, _slot: SegmentSlot) {}
    }
}

/// Re-exports covering the common path: load an image, compile its segments, install
/// them on a processing element, push exchange buffers through it.
pub mod prelude {
    pub use crate::compile::{compile_segment, compile_verified, CompileOptions, JitFlags, OptLevel};
    pub use crate::container::{self, ContainerError, Image};
    pub use crate::coprocessors::{Coprocessor, CoprocessorTable};
    pub use crate::error::{CompileError, NetVmError, RuntimeException};
    pub use crate::runtime::{ExchangeBuffer, ExchangeBufferPool, HandlerStats, ProcessingElement, SegmentSlot};
    pub use crate::verifier::{SegmentHeader, SegmentKind, VerifierOptions, VerifyError};
    pub use crate::vm::{NetVm, PeHandle};
    #[cfg(feature = "profile-any")]
    pub use crate::profiler::{ProfileReceiver, Profiler, ProfilingData};
}
