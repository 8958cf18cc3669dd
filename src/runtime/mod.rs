//! Per-PE runtime: exchange-buffer pool, handler dispatch, coprocessor table.
//!
//! A `ProcessingElement` owns its compiled handlers, its coprocessor slot table, and a
//! handler-statistics record; the host drives it by calling [`ProcessingElement::push`]
//! with an [`ExchangeBuffer`] drawn from a [`ExchangeBufferPool`]. Single-threaded
//! cooperative scheduling per spec §5: one buffer runs to completion before the next
//! is accepted.

pub mod context;
pub mod pool;

use std::collections::HashMap;

use crate::coprocessors::CoprocessorTable;
use crate::emitter::CompiledSegment;
use crate::error::RuntimeException;
use crate::profiler::Profiler;

pub use pool::ExchangeBufferPool;

use context::ExecContext;

/// A compiled segment's native entry point: `ctx` addresses every memory area and the
/// coprocessor register window (see [`context::ExecContext`]); the return value is `0`
/// on success or a [`RuntimeException::trap_code`].
type CompiledEntry = unsafe extern "C" fn(*mut ExecContext) -> u64;

/// Default byte size of a PE's persistent "data" memory area (the `d*load`/`d*store`
/// area, spec §4.3), absent a host-specified size. New to this crate: the original's
/// per-PE data segment size is a container/loader detail this crate doesn't yet parse
/// (see DESIGN.md "Known gaps"), so every PE gets a fixed-size area instead.
const DEFAULT_DATA_MEMORY_BYTES: usize = 4096;

/// Default byte size of a PE's persistent "shared"/init memory area (`s*load`/
/// `s*store`), same rationale as [`DEFAULT_DATA_MEMORY_BYTES`].
const DEFAULT_SHARED_MEMORY_BYTES: usize = 4096;

/// Coprocessor slot names whose state the original serialized across processes with a
/// named semaphore (`lookup.c`'s `COPRO_SYNCH`); only these take the `copro-synch` lock.
#[cfg(feature = "copro-synch")]
const SYNCHRONIZED_COPROCESSORS: [&str; 3] = ["lookup", "lookupnew", "lookup_ex"];

#[cfg(feature = "copro-synch")]
fn copro_synch_lock() -> Result<named_lock::NamedLock, RuntimeException> {
    named_lock::NamedLock::create("netvm_copro_synch").map_err(|_| RuntimeException::CoprocessorSelfCheck)
}

/// The unit of data flowing between PEs (spec §3).
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExchangeBuffer {
    pub packet: Vec<u8>,
    pub info: Vec<u8>,
    pub timestamp_secs: u64,
    pub timestamp_micros: u32,
    /// Opaque to the core; the host attaches whatever it needs here.
    pub user_data: u64,
}

impl ExchangeBuffer {
    pub fn packet_len(&self) -> usize {
        self.packet.len()
    }

    pub fn info_len(&self) -> usize {
        self.info.len()
    }
}

/// Per-PE handler invocation statistics (`nvmNetPEHandlerStats` equivalent,
/// SPEC_FULL.md §3 supplement).
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HandlerStats {
    pub invocations: u64,
    pub cumulative_cycles: u64,
    pub last_failure: Option<RuntimeException>,
}

/// Which compiled segment a PE invokes for a given event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SegmentSlot {
    Init,
    Push,
    Pull,
}

/// A compiled, running Processing Element: compiled segments, coprocessor bindings,
/// per-segment handler statistics, and the persistent data/shared memory areas its
/// compiled handlers address alongside the per-dispatch exchange buffer.
pub struct ProcessingElement {
    segments: HashMap<SegmentSlot, CompiledSegment>,
    coprocessors: CoprocessorTable,
    stats: HashMap<SegmentSlot, HandlerStats>,
    profiler: Profiler,
    data: Vec<u8>,
    shared: Vec<u8>,
}

impl ProcessingElement {
    pub fn new(coprocessors: CoprocessorTable) -> Self {
        ProcessingElement {
            segments: HashMap::new(),
            coprocessors,
            stats: HashMap::new(),
            profiler: Profiler::default(),
            data: vec![0u8; DEFAULT_DATA_MEMORY_BYTES],
            shared: vec![0u8; DEFAULT_SHARED_MEMORY_BYTES],
        }
    }

    /// This PE's persistent data memory area, read-write accessible to its compiled
    /// handlers as the `d*load`/`d*store` area.
    pub fn data_memory_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// This PE's persistent shared/init memory area, read-write accessible to its
    /// compiled handlers as the `s*load`/`s*store` area.
    pub fn shared_memory_mut(&mut self) -> &mut [u8] {
        &mut self.shared
    }

    /// Read-only access to this element's profiling counters (spec §4.8 supplement).
    #[cfg(feature = "profile-any")]
    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    /// Installs a receiver to be notified once per dispatch with a profiling snapshot.
    #[cfg(feature = "profile-any")]
    pub fn set_profile_receiver(&mut self, receiver: Box<dyn crate::profiler::ProfileReceiver + Send + Sync>) {
        self.profiler.set_receiver(receiver);
    }

    pub fn install_segment(&mut self, slot: SegmentSlot, compiled: CompiledSegment) {
        self.segments.insert(slot, compiled);
        self.stats.entry(slot).or_default();
    }

    pub fn coprocessors(&self) -> &CoprocessorTable {
        &self.coprocessors
    }

    pub fn coprocessors_mut(&mut self) -> &mut CoprocessorTable {
        &mut self.coprocessors
    }

    pub fn stats(&self, slot: SegmentSlot) -> Option<&HandlerStats> {
        self.stats.get(&slot)
    }

    /// Runs `slot`'s compiled handler against `exbuf`: builds an [`ExecContext`]
    /// addressing `exbuf`'s packet, this PE's data/shared areas and a freshly
    /// allocated locals buffer, then calls straight into the segment's executable
    /// memory. A nonzero return is a [`RuntimeException::trap_code`].
    pub fn dispatch(&mut self, slot: SegmentSlot, exbuf: &mut ExchangeBuffer) -> Result<(), RuntimeException> {
        let Some(segment) = self.segments.get(&slot) else {
            return Ok(());
        };
        let stats = self.stats.entry(slot).or_default();
        stats.invocations += 1;
        tracing::trace!(?slot, invocations = stats.invocations, "dispatching handler");

        let mut locals = vec![0u8; segment.locals_size_bytes];
        let mut ctx = ExecContext {
            packet_ptr: exbuf.packet.as_mut_ptr(),
            packet_len: exbuf.packet.len() as u64,
            data_ptr: self.data.as_mut_ptr(),
            data_len: self.data.len() as u64,
            shared_ptr: self.shared.as_mut_ptr(),
            shared_len: self.shared.len() as u64,
            locals_ptr: locals.as_mut_ptr(),
            coprocessor_table: &mut self.coprocessors as *mut CoprocessorTable,
            exbuf: exbuf as *const ExchangeBuffer,
            coprocessor_regs: [0u64; context::COPROCESSOR_REG_SLOTS],
        };

        // Safety: `segment`'s region is RX-protected executable memory emitted by
        // `emitter::emit` for exactly this entry signature; `ctx` stays alive for the
        // duration of the call and every pointer it carries is valid until `dispatch`
        // returns.
        let entry: CompiledEntry = unsafe { std::mem::transmute(segment.base_address()) };
        let trap_code = unsafe { entry(&mut ctx as *mut ExecContext) };

        #[cfg(feature = "profile-gas")]
        self.profiler.record_segment_cycles(slot, stats.cumulative_cycles);
        self.profiler.on_dispatch(slot);

        if trap_code == 0 {
            Ok(())
        } else {
            let exception = RuntimeException::from_trap_code(trap_code as u32).unwrap_or(RuntimeException::CoprocessorSelfCheck);
            stats.last_failure = Some(exception);
            Err(exception)
        }
    }

    /// Dispatches `op_id` against the named coprocessor's current register state
    /// (the "read/write application interface" operation applied to a coprocessor
    /// rather than a port). Takes the `copro-synch` named lock first when `name` is
    /// one of the lookup-family slots the original serialized across processes.
    pub fn invoke_coprocessor(&mut self, name: &str, op_id: u32, exbuf: &ExchangeBuffer) -> Result<(), RuntimeException> {
        #[cfg(feature = "copro-synch")]
        let _guard = if SYNCHRONIZED_COPROCESSORS.contains(&name) {
            Some(copro_synch_lock()?.lock().map_err(|_| RuntimeException::CoprocessorSelfCheck)?)
        } else {
            None
        };

        let result = self
            .coprocessors
            .get_mut(name)
            .ok_or(RuntimeException::UnknownCoprocessor)?
            .invoke(op_id, exbuf);

        #[cfg(feature = "profile-coprocessors")]
        self.profiler.record_coprocessor_invoke(name, 0);

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_on_an_uninstalled_slot_is_a_no_op() {
        let mut pe = ProcessingElement::new(CoprocessorTable::new());
        let result = pe.dispatch(SegmentSlot::Push, &mut ExchangeBuffer::default());
        assert!(result.is_ok());
        assert!(pe.stats(SegmentSlot::Push).is_none());
    }

    #[test]
    fn dispatching_a_compiled_segment_runs_it_and_observes_its_effect() {
        use crate::compile::{compile_segment, CompileOptions};
        use crate::verifier::{SegmentHeader, SegmentKind};

        // pushbyte 0 (index); pushbyte 42 (value); dbstore; ret
        let code = [0x05u8, 0, 0x05, 42, 0x63, 0x06];
        let header = SegmentHeader { max_stack_size: 2, locals_size: 0 };
        let compiled = compile_segment(&code, header, SegmentKind::Push, &CompileOptions::default()).unwrap();

        let mut pe = ProcessingElement::new(CoprocessorTable::new());
        pe.install_segment(SegmentSlot::Push, compiled);

        let mut exbuf = ExchangeBuffer::default();
        let result = pe.dispatch(SegmentSlot::Push, &mut exbuf);
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(pe.stats(SegmentSlot::Push).unwrap().invocations, 1);
        assert_eq!(pe.data_memory_mut()[0], 42, "compiled handler's dbstore must actually reach the data area");
    }

    #[test]
    fn invoking_an_unregistered_coprocessor_slot_is_an_error() {
        let mut pe = ProcessingElement::new(CoprocessorTable::new());
        let result = pe.invoke_coprocessor("lookupnew", 0, &ExchangeBuffer::default());
        assert!(matches!(result, Err(RuntimeException::UnknownCoprocessor)));
    }

    #[test]
    fn invoking_a_registered_coprocessor_reaches_its_invoke() {
        use crate::coprocessors::lookup_new::LookupNewCoprocessor;
        use crate::coprocessors::Coprocessor;

        let mut table = CoprocessorTable::new();
        let mut copro = LookupNewCoprocessor::new();
        copro.init(&[]).unwrap();
        table.register("lookupnew", Box::new(copro));
        let mut pe = ProcessingElement::new(table);

        let exbuf = ExchangeBuffer::default();
        for (i, word) in [1u32, 2, 3, 4, 5].into_iter().enumerate() {
            pe.coprocessors_mut().get_mut("lookupnew").unwrap().write(i, word as u64).unwrap();
        }
        assert!(pe.invoke_coprocessor("lookupnew", 1, &exbuf).is_ok()); // OP_INSERT
    }
}
