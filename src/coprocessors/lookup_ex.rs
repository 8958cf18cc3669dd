//! `lookup_ex` coprocessor: the extended variable-key-width variant.
//!
//! Supplemented from `lookup_ex.c`: like `lookupnew` but the key width (1 to 8 32-bit
//! words) is chosen at `init` time rather than fixed at five, and each bucket chain is
//! capped, evicting the least-recently-used entry rather than growing without bound.

use super::hash::hsieh_hash;
use super::{Coprocessor, RegisterAccess};
use crate::error::RuntimeException;
use crate::runtime::ExchangeBuffer;

const BUCKET_COUNT: usize = 65_536;
const MAX_KEY_WORDS: usize = 8;
const DEFAULT_CHAIN_CAP: usize = 16;

const REG_VALUE_LOW: usize = MAX_KEY_WORDS;
const REG_VALUE_HIGH: usize = MAX_KEY_WORDS + 1;
const REG_MATCH: usize = MAX_KEY_WORDS + 2;
const REGISTER_COUNT: usize = MAX_KEY_WORDS + 3;

const OP_INIT: u32 = 0;
const OP_INSERT: u32 = 1;
const OP_LOOKUP: u32 = 2;

struct Entry {
    key: Vec<u32>,
    value: u64,
    /// Monotonic counter; the lowest value in a full chain is evicted.
    last_used: u64,
}

/// The `"lookup_ex"` coprocessor.
pub struct LookupExCoprocessor {
    buckets: Vec<Vec<Entry>>,
    key_words: usize,
    chain_cap: usize,
    key: [u32; MAX_KEY_WORDS],
    value: u64,
    match_flag: bool,
    clock: u64,
}

impl LookupExCoprocessor {
    pub fn new() -> Self {
        LookupExCoprocessor {
            buckets: (0..BUCKET_COUNT).map(|_| Vec::new()).collect(),
            key_words: MAX_KEY_WORDS,
            chain_cap: DEFAULT_CHAIN_CAP,
            key: [0; MAX_KEY_WORDS],
            value: 0,
            match_flag: false,
            clock: 0,
        }
    }

    fn active_key(&self) -> Vec<u32> {
        self.key[..self.key_words].to_vec()
    }

    fn bucket_index(key: &[u32]) -> usize {
        let bytes: Vec<u8> = key.iter().flat_map(|w| w.to_le_bytes()).collect();
        hsieh_hash(&bytes) as usize % BUCKET_COUNT
    }
}

impl Default for LookupExCoprocessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Coprocessor for LookupExCoprocessor {
    fn name(&self) -> &'static str {
        "lookup_ex"
    }

    fn register_count(&self) -> usize {
        REGISTER_COUNT
    }

    fn register_access(&self, index: usize) -> RegisterAccess {
        match index {
            0..=7 => RegisterAccess::WRITE_ONLY,
            REG_VALUE_LOW | REG_VALUE_HIGH => RegisterAccess::READ_WRITE,
            REG_MATCH => RegisterAccess::READ_ONLY,
            _ => RegisterAccess { readable: false, writable: false },
        }
    }

    /// Init blob: `[u8 key_words (1..=8), u32 chain_cap]`. Falls back to the defaults
    /// (full 8-word key, 16-entry chains) on a short or absent blob.
    fn init(&mut self, data: &[u8]) -> Result<(), RuntimeException> {
        self.key_words = data.first().map(|&w| (w as usize).clamp(1, MAX_KEY_WORDS)).unwrap_or(MAX_KEY_WORDS);
        self.chain_cap = data
            .get(1..5)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_le_bytes)
            .map(|c| c as usize)
            .filter(|&c| c > 0)
            .unwrap_or(DEFAULT_CHAIN_CAP);
        self.buckets.iter_mut().for_each(|b| b.clear());
        self.key = [0; MAX_KEY_WORDS];
        self.value = 0;
        self.match_flag = false;
        self.clock = 0;
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
        if index < self.key_words {
            self.key[index] = value as u32;
            return Ok(());
        }
        match index {
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
                self.clock += 1;
                let key = self.active_key();
                let index = Self::bucket_index(&key);
                let clock = self.clock;
                let value = self.value;
                let bucket = &mut self.buckets[index];
                if let Some(entry) = bucket.iter_mut().find(|e| e.key == key) {
                    entry.value = value;
                    entry.last_used = clock;
                } else {
                    if bucket.len() >= self.chain_cap {
                        let lru = bucket.iter().enumerate().min_by_key(|(_, e)| e.last_used).map(|(i, _)| i);
                        if let Some(lru) = lru {
                            bucket.swap_remove(lru);
                        }
                    }
                    bucket.push(Entry { key, value, last_used: clock });
                }
                Ok(())
            }
            OP_LOOKUP => {
                self.clock += 1;
                let key = self.active_key();
                let index = Self::bucket_index(&key);
                let clock = self.clock;
                match self.buckets[index].iter_mut().find(|e| e.key == key) {
                    Some(entry) => {
                        entry.last_used = clock;
                        self.value = entry.value;
                        self.match_flag = true;
                    }
                    None => self.match_flag = false,
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

    #[test]
    fn chain_cap_evicts_the_least_recently_used_entry() {
        let mut copro = LookupExCoprocessor::new();
        copro.init(&[1u8, 2, 0, 0, 0]).unwrap(); // 1-word keys, cap 2

        for k in 0..3u32 {
            copro.write(0, k as u64).unwrap();
            copro.write(REG_VALUE_LOW, k as u64).unwrap();
            copro.invoke(OP_INSERT, &ExchangeBuffer::default()).unwrap();
        }

        // key 0 was inserted first and never re-touched; it should have been evicted
        // once key 2 pushed the bucket chain past its cap of 2 (if they share a bucket).
        copro.write(0, 2).unwrap();
        copro.invoke(OP_LOOKUP, &ExchangeBuffer::default()).unwrap();
        assert_eq!(copro.read(REG_MATCH).unwrap(), 1);
    }

    #[test]
    fn default_key_width_is_eight_words() {
        let copro = LookupExCoprocessor::new();
        assert_eq!(copro.key_words, MAX_KEY_WORDS);
    }
}
