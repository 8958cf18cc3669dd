//! Per-coprocessor and per-segment profiling, enabled by the `profile-any` feature.
//!
//! Split the same way `fuel-vm` splits `profile-gas`/`profile-coverage` under
//! `profile-any`: each concern accumulates into its own bucket of [`ProfilingData`],
//! and a boxed [`ProfileReceiver`] is notified once per dispatch so a host can drain
//! counters without polling.

use std::collections::HashMap;
use std::fmt;

use dyn_clone::DynClone;

use crate::runtime::SegmentSlot;

/// Receives profiling data after each handler dispatch.
///
/// `DynClone` lets a [`Profiler`] — and therefore the [`crate::runtime::ProcessingElement`]
/// that owns one — stay cheap to snapshot even with a boxed receiver inside.
pub trait ProfileReceiver: DynClone {
    fn on_dispatch(&mut self, slot: SegmentSlot, data: &ProfilingData);
}

dyn_clone::clone_trait_object!(ProfileReceiver);

/// Prints the current profiling snapshot to stderr after every dispatch.
#[derive(Clone)]
pub struct StderrReceiver;

impl ProfileReceiver for StderrReceiver {
    fn on_dispatch(&mut self, slot: SegmentSlot, data: &ProfilingData) {
        eprintln!("PROFILER[{slot:?}]: {data:?}");
    }
}

/// Accumulates profiling counters for one processing element and forwards a
/// snapshot to an optional receiver after each dispatch.
#[derive(Default, Clone)]
pub struct Profiler {
    receiver: Option<Box<dyn ProfileReceiver + Send + Sync>>,
    data: ProfilingData,
}

impl Profiler {
    /// Installs (or replaces) the receiver notified after each dispatch.
    pub fn set_receiver(&mut self, receiver: Box<dyn ProfileReceiver + Send + Sync>) {
        self.receiver = Some(receiver);
    }

    /// Read-only access to the accumulated counters.
    pub fn data(&self) -> &ProfilingData {
        &self.data
    }

    /// Notifies the receiver, if any, that `slot` was just dispatched.
    pub fn on_dispatch(&mut self, slot: SegmentSlot) {
        if let Some(receiver) = &mut self.receiver {
            receiver.on_dispatch(slot, &self.data);
        }
    }

    #[cfg(feature = "profile-coprocessors")]
    pub fn record_coprocessor_invoke(&mut self, name: &str, tick_delta: u64) {
        self.data.coprocessors.record(name, tick_delta);
    }

    #[cfg(feature = "profile-gas")]
    pub fn record_segment_cycles(&mut self, slot: SegmentSlot, cycles: u64) {
        self.data.gas.add(slot, cycles);
    }
}

impl fmt::Debug for Profiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Profiler(receiver={}, data={:?})",
            if self.receiver.is_some() { "enabled" } else { "disabled" },
            self.data
        )
    }
}

/// Profiling data, separated by concern the way `fuel-vm::profiler::ProfilingData`
/// separates gas and coverage data.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProfilingData {
    #[cfg(feature = "profile-coprocessors")]
    coprocessors: CoprocessorProfilingData,
    #[cfg(feature = "profile-gas")]
    gas: GasProfilingData,
}

impl ProfilingData {
    #[cfg(feature = "profile-coprocessors")]
    pub fn coprocessors(&self) -> &CoprocessorProfilingData {
        &self.coprocessors
    }

    #[cfg(feature = "profile-gas")]
    pub fn gas(&self) -> &GasProfilingData {
        &self.gas
    }
}

/// Per-coprocessor call counts and cumulative tick deltas, mirroring
/// `nvmCounter`/`ProfCounter` in the original coprocessor state.
#[cfg(feature = "profile-coprocessors")]
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CoprocessorProfilingData {
    counters: HashMap<String, (u64, u64)>,
}

#[cfg(feature = "profile-coprocessors")]
impl CoprocessorProfilingData {
    fn record(&mut self, name: &str, tick_delta: u64) {
        let entry = self.counters.entry(name.to_string()).or_insert((0, 0));
        entry.0 += 1;
        entry.1 = entry.1.saturating_add(tick_delta);
    }

    /// Number of times `name` was invoked.
    pub fn calls(&self, name: &str) -> u64 {
        self.counters.get(name).map_or(0, |&(calls, _)| calls)
    }

    /// Cumulative tick delta recorded for `name`.
    pub fn ticks(&self, name: &str) -> u64 {
        self.counters.get(name).map_or(0, |&(_, ticks)| ticks)
    }
}

/// Cumulative dispatch cycles per segment slot.
#[cfg(feature = "profile-gas")]
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GasProfilingData {
    cycles: HashMap<SegmentSlot, u64>,
}

#[cfg(feature = "profile-gas")]
impl GasProfilingData {
    fn add(&mut self, slot: SegmentSlot, amount: u64) {
        let entry = self.cycles.entry(slot).or_insert(0);
        *entry = entry.saturating_add(amount);
    }

    pub fn get(&self, slot: SegmentSlot) -> u64 {
        self.cycles.get(&slot).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct RecordingReceiver {
        dispatches: std::sync::Arc<std::sync::Mutex<u32>>,
    }

    impl ProfileReceiver for RecordingReceiver {
        fn on_dispatch(&mut self, _slot: SegmentSlot, _data: &ProfilingData) {
            *self.dispatches.lock().unwrap() += 1;
        }
    }

    #[test]
    fn receiver_is_notified_once_per_dispatch() {
        let receiver = RecordingReceiver::default();
        let count = receiver.dispatches.clone();
        let mut profiler = Profiler::default();
        profiler.set_receiver(Box::new(receiver));
        profiler.on_dispatch(SegmentSlot::Push);
        profiler.on_dispatch(SegmentSlot::Push);
        assert_eq!(*count.lock().unwrap(), 2);
    }

    #[cfg(feature = "profile-coprocessors")]
    #[test]
    fn coprocessor_counters_accumulate_calls_and_ticks() {
        let mut profiler = Profiler::default();
        profiler.record_coprocessor_invoke("lookup", 10);
        profiler.record_coprocessor_invoke("lookup", 5);
        assert_eq!(profiler.data().coprocessors().calls("lookup"), 2);
        assert_eq!(profiler.data().coprocessors().ticks("lookup"), 15);
        assert_eq!(profiler.data().coprocessors().calls("unknown"), 0);
    }

    #[cfg(feature = "profile-gas")]
    #[test]
    fn segment_cycles_accumulate_per_slot() {
        let mut profiler = Profiler::default();
        profiler.record_segment_cycles(SegmentSlot::Push, 100);
        profiler.record_segment_cycles(SegmentSlot::Push, 50);
        profiler.record_segment_cycles(SegmentSlot::Pull, 7);
        assert_eq!(profiler.data().gas().get(SegmentSlot::Push), 150);
        assert_eq!(profiler.data().gas().get(SegmentSlot::Pull), 7);
    }
}
