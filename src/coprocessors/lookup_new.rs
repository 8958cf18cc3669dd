//! `lookupnew` coprocessor: the fixed five-key-register variant (spec §4.8).
//!
//! Registers 0..4 form a 160-bit key, 5..6 a 64-bit value, 7 the match flag. Grounded
//! on `lookup-new.c`'s register layout and its `INIT`/`INSERT`/`LOOKUP` operation set.

use super::hash::hsieh_hash;
use super::{Coprocessor, RegisterAccess};
use crate::error::RuntimeException;
use crate::runtime::ExchangeBuffer;

const BUCKET_COUNT: usize = 65_536;
const KEY_WORDS: usize = 5;

const REG_VALUE_LOW: usize = 5;
const REG_VALUE_HIGH: usize = 6;
const REG_MATCH: usize = 7;
const REGISTER_COUNT: usize = 8;

const OP_INIT: u32 = 0;
const OP_INSERT: u32 = 1;
const OP_LOOKUP: u32 = 2;

struct Entry {
    key: [u32; KEY_WORDS],
    value: u64,
}

/// The `"lookupnew"` coprocessor.
pub struct LookupNewCoprocessor {
    buckets: Vec<Vec<Entry>>,
    key: [u32; KEY_WORDS],
    value: u64,
    match_flag: bool,
}

impl LookupNewCoprocessor {
    pub fn new() -> Self {
        LookupNewCoprocessor {
            buckets: (0..BUCKET_COUNT).map(|_| Vec::new()).collect(),
            key: [0; KEY_WORDS],
            value: 0,
            match_flag: false,
        }
    }

    fn bucket_index(key: &[u32; KEY_WORDS]) -> usize {
        let bytes: Vec<u8> = key.iter().flat_map(|w| w.to_le_bytes()).collect();
        hsieh_hash(&bytes) as usize % BUCKET_COUNT
    }
}

impl Default for LookupNewCoprocessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Coprocessor for LookupNewCoprocessor {
    fn name(&self) -> &'static str {
        "lookupnew"
    }

    fn register_count(&self) -> usize {
        REGISTER_COUNT
    }

    fn register_access(&self, index: usize) -> RegisterAccess {
        match index {
            0..=4 => RegisterAccess::WRITE_ONLY,
            REG_VALUE_LOW | REG_VALUE_HIGH => RegisterAccess::READ_WRITE,
            REG_MATCH => RegisterAccess::READ_ONLY,
            _ => RegisterAccess { readable: false, writable: false },
        }
    }

    fn init(&mut self, _data: &[u8]) -> Result<(), RuntimeException> {
        self.buckets.iter_mut().for_each(|b| b.clear());
        self.key = [0; KEY_WORDS];
        self.value = 0;
        self.match_flag = false;
        Ok(())
    }

    fn read(&self, index: usize) -> Result<u64, RuntimeException> {
        match index {
            REG_VALUE_LOW => Ok(self.value & 0xFFFF_FFFF),
            REG_VALUE_HIGH => Ok(self.value >> 32),
            REG_MATCH => Ok(self.match_flag as u64),
            _ => Err(RuntimeException::CoprocessorSelfCheck),
        }
    }

    fn write(&mut self, index: usize, value: u64) -> Result<(), RuntimeException> {
        match index {
            0..=4 => {
                self.key[index] = value as u32;
                Ok(())
            }
            REG_VALUE_LOW => {
                self.value = (self.value & !0xFFFF_FFFF) | (value & 0xFFFF_FFFF);
                Ok(())
            }
            REG_VALUE_HIGH => {
                self.value = (self.value & 0xFFFF_FFFF) | (value << 32);
                Ok(())
            }
            _ => Err(RuntimeException::CoprocessorSelfCheck),
        }
    }

    fn invoke(&mut self, op_id: u32, _exbuf: &ExchangeBuffer) -> Result<(), RuntimeException> {
        match op_id {
            OP_INIT => self.init(&[]),
            OP_INSERT => {
                let index = Self::bucket_index(&self.key);
                let bucket = &mut self.buckets[index];
                if let Some(entry) = bucket.iter_mut().find(|e| e.key == self.key) {
                    entry.value = self.value;
                } else {
                    bucket.push(Entry { key: self.key, value: self.value });
                }
                Ok(())
            }
            OP_LOOKUP => {
                let index = Self::bucket_index(&self.key);
                match self.buckets[index].iter().find(|e| e.key == self.key) {
                    Some(entry) => {
                        self.value = entry.value;
                        self.match_flag = true;
                    }
                    None => {
                        self.match_flag = false;
                    }
                }
                Ok(())
            }
            _ => Err(RuntimeException::CoprocessorSelfCheck),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_key(copro: &mut LookupNewCoprocessor, key: [u32; KEY_WORDS]) {
        for (i, word) in key.iter().enumerate() {
            copro.write(i, *word as u64).unwrap();
        }
    }

    #[test]
    fn insert_then_lookup_same_key_matches() {
        let mut copro = LookupNewCoprocessor::new();
        copro.init(&[]).unwrap();

        set_key(&mut copro, [1, 2, 3, 4, 5]);
        copro.write(REG_VALUE_LOW, 0xAA).unwrap();
        copro.write(REG_VALUE_HIGH, 0xBB).unwrap();
        copro.invoke(OP_INSERT, &ExchangeBuffer::default()).unwrap();

        set_key(&mut copro, [1, 2, 3, 4, 5]);
        copro.invoke(OP_LOOKUP, &ExchangeBuffer::default()).unwrap();

        assert_eq!(copro.read(REG_MATCH).unwrap(), 1);
        assert_eq!(copro.read(REG_VALUE_LOW).unwrap(), 0xAA);
        assert_eq!(copro.read(REG_VALUE_HIGH).unwrap(), 0xBB);
    }

    #[test]
    fn lookup_of_a_different_key_does_not_match() {
        let mut copro = LookupNewCoprocessor::new();
        copro.init(&[]).unwrap();
        set_key(&mut copro, [1, 2, 3, 4, 5]);
        copro.invoke(OP_INSERT, &ExchangeBuffer::default()).unwrap();

        set_key(&mut copro, [1, 2, 3, 4, 6]);
        copro.invoke(OP_LOOKUP, &ExchangeBuffer::default()).unwrap();
        assert_eq!(copro.read(REG_MATCH).unwrap(), 0);
    }
}
