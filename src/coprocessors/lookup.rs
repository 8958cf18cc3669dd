//! `lookup` coprocessor: the accumulate-then-commit variant.
//!
//! Grounded on `lookup.c`'s two-register protocol: callers push one 32-bit key word at
//! a time into an accumulating buffer (`ADD_DATA`), optionally attach a value
//! (`ADD_VALUE`), then commit with `INSERT` or `LOOKUP`; `RESET` clears the pending
//! accumulator without committing. This is the variant the spec's Open Question keeps
//! distinct from `lookupnew`'s fixed five-register layout.

use super::hash::hsieh_hash;
use super::{Coprocessor, RegisterAccess};
use crate::error::RuntimeException;
use crate::runtime::ExchangeBuffer;

const BUCKET_COUNT: usize = 50_000;

const REG_ADD_DATA: usize = 0;
const REG_ADD_VALUE: usize = 1;
const REG_VALUE: usize = 2;
const REG_MATCH: usize = 3;
const REGISTER_COUNT: usize = 4;

const OP_RESET: u32 = 0;
const OP_INSERT: u32 = 1;
const OP_LOOKUP: u32 = 2;

struct Entry {
    key: Vec<u32>,
    value: u32,
}

/// The `"lookup"` coprocessor: accumulate-then-commit key/value store.
pub struct LookupCoprocessor {
    buckets: Vec<Vec<Entry>>,
    pending_key: Vec<u32>,
    pending_value: u32,
    last_value: u32,
    match_flag: bool,
}

impl LookupCoprocessor {
    pub fn new() -> Self {
        LookupCoprocessor {
            buckets: (0..BUCKET_COUNT).map(|_| Vec::new()).collect(),
            pending_key: Vec::new(),
            pending_value: 0,
            last_value: 0,
            match_flag: false,
        }
    }

    fn bucket_index(key: &[u32]) -> usize {
        let bytes: Vec<u8> = key.iter().flat_map(|w| w.to_le_bytes()).collect();
        hsieh_hash(&bytes) as usize % BUCKET_COUNT
    }

    fn reset(&mut self) {
        self.pending_key.clear();
        self.pending_value = 0;
    }

    fn insert(&mut self) {
        let index = Self::bucket_index(&self.pending_key);
        let bucket = &mut self.buckets[index];
        if let Some(entry) = bucket.iter_mut().find(|e| e.key == self.pending_key) {
            entry.value = self.pending_value;
        } else {
            bucket.push(Entry { key: self.pending_key.clone(), value: self.pending_value });
        }
        self.reset();
    }

    fn lookup(&mut self) {
        let index = Self::bucket_index(&self.pending_key);
        match self.buckets[index].iter().find(|e| e.key == self.pending_key) {
            Some(entry) => {
                self.match_flag = true;
                self.last_value = entry.value;
            }
            None => {
                self.match_flag = false;
                self.last_value = 0;
            }
        }
        self.reset();
    }
}

impl Default for LookupCoprocessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Coprocessor for LookupCoprocessor {
    fn name(&self) -> &'static str {
        "lookup"
    }

    fn register_count(&self) -> usize {
        REGISTER_COUNT
    }

    fn register_access(&self, index: usize) -> RegisterAccess {
        match index {
            REG_ADD_DATA | REG_ADD_VALUE => RegisterAccess::WRITE_ONLY,
            REG_VALUE => RegisterAccess::READ_WRITE,
            REG_MATCH => RegisterAccess::READ_ONLY,
            _ => RegisterAccess { readable: false, writable: false },
        }
    }

    fn init(&mut self, _data: &[u8]) -> Result<(), RuntimeException> {
        self.buckets.iter_mut().for_each(|b| b.clear());
        self.reset();
        Ok(())
    }

    fn read(&self, index: usize) -> Result<u64, RuntimeException> {
        match index {
            REG_VALUE => Ok(self.last_value as u64),
            REG_MATCH => Ok(self.match_flag as u64),
            _ => Err(RuntimeException::CoprocessorSelfCheck),
        }
    }

    fn write(&mut self, index: usize, value: u64) -> Result<(), RuntimeException> {
        match index {
            REG_ADD_DATA => {
                self.pending_key.push(value as u32);
                Ok(())
            }
            REG_ADD_VALUE | REG_VALUE => {
                self.pending_value = value as u32;
                Ok(())
            }
            _ => Err(RuntimeException::CoprocessorSelfCheck),
        }
    }

    fn invoke(&mut self, op_id: u32, _exbuf: &ExchangeBuffer) -> Result<(), RuntimeException> {
        match op_id {
            OP_RESET => {
                self.reset();
                Ok(())
            }
            OP_INSERT => {
                self.insert();
                Ok(())
            }
            OP_LOOKUP => {
                self.lookup();
                Ok(())
            }
            _ => Err(RuntimeException::CoprocessorSelfCheck),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exbuf() -> ExchangeBuffer {
        ExchangeBuffer::default()
    }

    #[test]
    fn insert_then_lookup_round_trips_the_value() {
        let mut copro = LookupCoprocessor::new();
        copro.init(&[]).unwrap();

        for word in [1u32, 2, 3, 4, 5] {
            copro.write(REG_ADD_DATA, word as u64).unwrap();
        }
        copro.write(REG_ADD_VALUE, 0xAABB).unwrap();
        copro.invoke(OP_INSERT, &exbuf()).unwrap();

        for word in [1u32, 2, 3, 4, 5] {
            copro.write(REG_ADD_DATA, word as u64).unwrap();
        }
        copro.invoke(OP_LOOKUP, &exbuf()).unwrap();

        assert_eq!(copro.read(REG_MATCH).unwrap(), 1);
        assert_eq!(copro.read(REG_VALUE).unwrap(), 0xAABB);
    }

    #[test]
    fn lookup_of_unknown_key_reports_no_match() {
        let mut copro = LookupCoprocessor::new();
        copro.init(&[]).unwrap();
        copro.write(REG_ADD_DATA, 42).unwrap();
        copro.invoke(OP_LOOKUP, &exbuf()).unwrap();
        assert_eq!(copro.read(REG_MATCH).unwrap(), 0);
    }
}
