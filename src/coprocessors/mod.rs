//! Coprocessor capability trait and the per-PE registration table.
//!
//! Every coprocessor exposes the same register-file + `invoke(op_id)` shape (spec
//! §4.8). The source models this as a struct of `init/read/write/invoke` function
//! pointers plus opaque data; the Design Note on "dynamic dispatch of coprocessors"
//! reimplements that as one [`Coprocessor`] trait object per slot, so `invoke` stays a
//! single indirect call on the hot path instead of a chain of virtual dispatches.

pub mod hash;
pub mod lookup;
pub mod lookup_ex;
pub mod lookup_new;
pub mod regex;
pub mod stringmatching;

use crate::error::RuntimeException;
use crate::runtime::ExchangeBuffer;

/// Per-register access permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterAccess {
    pub readable: bool,
    pub writable: bool,
}

impl RegisterAccess {
    pub const READ_ONLY: Self = RegisterAccess { readable: true, writable: false };
    pub const WRITE_ONLY: Self = RegisterAccess { readable: false, writable: true };
    pub const READ_WRITE: Self = RegisterAccess { readable: true, writable: true };
}

/// A stateful kernel invoked from bytecode through a fixed register file.
///
/// `init`/`read`/`write`/`invoke` mirror spec §4.8 exactly; `name` and `register_access`
/// let the verifier reject a read of a write-only register at compile time rather than
/// silently returning garbage at runtime (spec §8 boundary behaviour).
pub trait Coprocessor {
    /// Canonical name this coprocessor is registered under (spec §6: the
    /// `{lookup, lookupnew, lookup_ex, regexp, stringmatching}` set).
    fn name(&self) -> &'static str;

    /// Number of registers in this coprocessor's register file.
    fn register_count(&self) -> usize;

    /// Access mask for register `index`.
    fn register_access(&self, index: usize) -> RegisterAccess;

    /// Called once at PE instantiation with a coprocessor-specific init blob.
    fn init(&mut self, data: &[u8]) -> Result<(), RuntimeException>;

    fn read(&self, index: usize) -> Result<u64, RuntimeException>;
    fn write(&mut self, index: usize, value: u64) -> Result<(), RuntimeException>;

    /// Dispatches operation `op_id` against the current register contents and,
    /// when relevant, `exbuf`.
    fn invoke(&mut self, op_id: u32, exbuf: &ExchangeBuffer) -> Result<(), RuntimeException>;
}

/// The canonical coprocessor slot names (spec §6). Absent backends are recorded as
/// `None` entries rather than omitted, so a PE's slot table has a stable shape.
pub const CANONICAL_SLOTS: [&str; 5] = ["lookup", "lookupnew", "lookup_ex", "regexp", "stringmatching"];

/// A per-PE table of boxed coprocessors, indexed by canonical slot name.
#[derive(Default)]
pub struct CoprocessorTable {
    slots: Vec<(String, Option<Box<dyn Coprocessor>>)>,
}

impl CoprocessorTable {
    pub fn new() -> Self {
        CoprocessorTable { slots: CANONICAL_SLOTS.iter().map(|&name| (name.to_string(), None)).collect() }
    }

    pub fn register(&mut self, name: &str, coprocessor: Box<dyn Coprocessor>) {
        if let Some(slot) = self.slots.iter_mut().find(|(slot_name, _)| slot_name == name) {
            slot.1 = Some(coprocessor);
        } else {
            self.slots.push((name.to_string(), Some(coprocessor)));
        }
    }

    pub fn get(&self, name: &str) -> Option<&dyn Coprocessor> {
        self.slots.iter().find(|(slot_name, _)| slot_name == name).and_then(|(_, c)| c.as_deref())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Box<dyn Coprocessor>> {
        self.slots.iter_mut().find(|(slot_name, _)| slot_name == name).and_then(|(_, c)| c.as_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_slots_start_absent() {
        let table = CoprocessorTable::new();
        for name in CANONICAL_SLOTS {
            assert!(table.get(name).is_none());
        }
    }
}
