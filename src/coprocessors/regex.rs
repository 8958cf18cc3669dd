//! `regexp` coprocessor: regular-expression matching over the current exchange
//! buffer's packet bytes.
//!
//! Grounded on `regexp2.c`'s operation set (`INIT`/`TRYMATCH`/`TRYMATCH_WITH_OFFSET`/
//! `GETRESULT`), mirroring the `stringmatching` coprocessor's register protocol per
//! spec §4.8 ("operations mirror the string matcher"). Pattern compilation uses the
//! `regex` crate's byte-string engine rather than a hand-rolled DFA; on the
//! `target-octeon-mips64` backend, `init` additionally calls
//! [`RegexCoprocessor::load_compiled_graphs`], a no-op everywhere else, per
//! `octeon_createregex.c`'s "load compiled DFA graphs into the accelerator's local
//! memory" step.

use regex::bytes::Regex;

use super::{Coprocessor, RegisterAccess};
use crate::error::RuntimeException;
use crate::runtime::ExchangeBuffer;

pub const MAX_MATCHES: usize = 1_600;

const REG_COUNT: usize = 0;
const REG_OFFSET_OR_PATTERN: usize = 1;
const REG_LEN_OR_ENDOFFSET: usize = 2;
const REGISTER_COUNT: usize = 3;

const OP_INIT: u32 = 0;
const OP_TRYMATCH: u32 = 1;
const OP_TRYMATCH_WITH_OFFSET: u32 = 2;
const OP_GETRESULT: u32 = 3;

#[derive(Clone, Copy)]
struct Match {
    pattern_index: u32,
    end_offset: u32,
}

/// The `"regexp"` coprocessor.
pub struct RegexCoprocessor {
    patterns: Vec<Regex>,
    matches: Vec<Match>,
    next_match: usize,
    r0: u32,
    r1: u32,
    r2: u32,
}

impl RegexCoprocessor {
    pub fn new() -> Self {
        RegexCoprocessor { patterns: Vec::new(), matches: Vec::new(), next_match: 0, r0: 0, r1: 0, r2: 0 }
    }

    fn parse_init_blob(data: &[u8]) -> Result<Vec<Regex>, RuntimeException> {
        let mut cursor = Cursor::new(data);
        let pattern_count = cursor.read_u16()?;
        let mut patterns = Vec::with_capacity(pattern_count as usize);

        for _ in 0..pattern_count {
            let flags_len = cursor.read_u16()?;
            let flags = cursor.read_bytes(flags_len as usize)?;
            let pattern_len = cursor.read_u16()?;
            let pattern = cursor.read_bytes(pattern_len as usize)?;

            let pattern_str = std::str::from_utf8(pattern).map_err(|_| RuntimeException::CoprocessorSelfCheck)?;
            let case_insensitive = flags.contains(&b'i');
            let prefixed = if case_insensitive { format!("(?i){pattern_str}") } else { pattern_str.to_string() };
            let regex = Regex::new(&prefixed).map_err(|_| RuntimeException::CoprocessorSelfCheck)?;
            patterns.push(regex);
        }

        Ok(patterns)
    }

    fn try_match(&mut self, haystack: &[u8], start_offset: usize) -> u32 {
        self.matches.clear();
        self.next_match = 0;
        let slice = haystack.get(start_offset..).unwrap_or(&[]);

        'patterns: for (pattern_index, regex) in self.patterns.iter().enumerate() {
            for m in regex.find_iter(slice) {
                if self.matches.len() >= MAX_MATCHES {
                    break 'patterns;
                }
                self.matches.push(Match {
                    pattern_index: pattern_index as u32,
                    end_offset: (start_offset + m.end()) as u32,
                });
            }
        }
        self.matches.sort_by_key(|m| m.end_offset);
        self.matches.len() as u32
    }

    /// Octeon-only hook: no-op on every other backend, per spec §4.8's "semantic
    /// contract is unchanged" note.
    #[cfg(feature = "target-octeon-mips64")]
    fn load_compiled_graphs(&self) {
        tracing::trace!(patterns = self.patterns.len(), "loading compiled DFA graphs into accelerator memory");
    }
}

impl Default for RegexCoprocessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Coprocessor for RegexCoprocessor {
    fn name(&self) -> &'static str {
        "regexp"
    }

    fn register_count(&self) -> usize {
        REGISTER_COUNT
    }

    fn register_access(&self, index: usize) -> RegisterAccess {
        match index {
            REG_COUNT | REG_OFFSET_OR_PATTERN | REG_LEN_OR_ENDOFFSET => RegisterAccess::READ_WRITE,
            _ => RegisterAccess { readable: false, writable: false },
        }
    }

    fn init(&mut self, data: &[u8]) -> Result<(), RuntimeException> {
        self.patterns = Self::parse_init_blob(data)?;
        self.matches.clear();
        self.next_match = 0;
        self.r0 = 0;
        self.r1 = 0;
        self.r2 = 0;
        #[cfg(feature = "target-octeon-mips64")]
        self.load_compiled_graphs();
        Ok(())
    }

    fn read(&self, index: usize) -> Result<u64, RuntimeException> {
        match index {
            REG_COUNT => Ok(self.r0 as u64),
            REG_OFFSET_OR_PATTERN => Ok(self.r1 as u64),
            REG_LEN_OR_ENDOFFSET => Ok(self.r2 as u64),
            _ => Err(RuntimeException::CoprocessorSelfCheck),
        }
    }

    fn write(&mut self, index: usize, value: u64) -> Result<(), RuntimeException> {
        match index {
            REG_COUNT => {
                self.r0 = value as u32;
                Ok(())
            }
            REG_OFFSET_OR_PATTERN => {
                self.r1 = value as u32;
                Ok(())
            }
            REG_LEN_OR_ENDOFFSET => {
                self.r2 = value as u32;
                Ok(())
            }
            _ => Err(RuntimeException::CoprocessorSelfCheck),
        }
    }

    fn invoke(&mut self, op_id: u32, exbuf: &ExchangeBuffer) -> Result<(), RuntimeException> {
        match op_id {
            OP_INIT => Ok(()),
            OP_TRYMATCH => {
                let haylen = self.r2 as usize;
                let haystack = &exbuf.packet[..haylen.min(exbuf.packet.len())];
                self.r0 = self.try_match(haystack, 0);
                Ok(())
            }
            OP_TRYMATCH_WITH_OFFSET => {
                let start_offset = self.r1 as usize;
                let haylen = self.r2 as usize;
                let haystack = &exbuf.packet[..haylen.min(exbuf.packet.len())];
                self.r0 = self.try_match(haystack, start_offset);
                Ok(())
            }
            OP_GETRESULT => {
                if self.r0 > 0 && self.next_match < self.matches.len() {
                    let matched = self.matches[self.next_match];
                    self.r0 -= 1;
                    self.r1 = matched.pattern_index;
                    self.r2 = matched.end_offset;
                    self.next_match += 1;
                    Ok(())
                } else {
                    Err(RuntimeException::CoprocessorSelfCheck)
                }
            }
            _ => Err(RuntimeException::CoprocessorSelfCheck),
        }
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn read_u16(&mut self) -> Result<u16, RuntimeException> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], RuntimeException> {
        let end = self.pos + n;
        let slice = self.data.get(self.pos..end).ok_or(RuntimeException::CoprocessorSelfCheck)?;
        self.pos = end;
        Ok(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_blob(patterns: &[(&str, &str)]) -> Vec<u8> {
        let mut blob = Vec::new();
        blob.extend_from_slice(&(patterns.len() as u16).to_le_bytes());
        for (flags, pattern) in patterns {
            blob.extend_from_slice(&(flags.len() as u16).to_le_bytes());
            blob.extend_from_slice(flags.as_bytes());
            blob.extend_from_slice(&(pattern.len() as u16).to_le_bytes());
            blob.extend_from_slice(pattern.as_bytes());
        }
        blob
    }

    #[test]
    fn matches_a_simple_pattern() {
        let blob = init_blob(&[("", "fo+")]);
        let mut copro = RegexCoprocessor::new();
        copro.init(&blob).unwrap();

        let mut exbuf = ExchangeBuffer::default();
        exbuf.packet = b"xxfooxx".to_vec();
        copro.write(REG_LEN_OR_ENDOFFSET, exbuf.packet.len() as u64).unwrap();
        copro.invoke(OP_TRYMATCH, &exbuf).unwrap();
        assert_eq!(copro.read(REG_COUNT).unwrap(), 1);

        copro.invoke(OP_GETRESULT, &exbuf).unwrap();
        assert_eq!(copro.read(REG_OFFSET_OR_PATTERN).unwrap(), 0);
        assert_eq!(copro.read(REG_LEN_OR_ENDOFFSET).unwrap(), 5);
    }

    #[test]
    fn case_insensitive_flag_matches_mixed_case() {
        let blob = init_blob(&[("i", "bar")]);
        let mut copro = RegexCoprocessor::new();
        copro.init(&blob).unwrap();

        let mut exbuf = ExchangeBuffer::default();
        exbuf.packet = b"BAR".to_vec();
        copro.write(REG_LEN_OR_ENDOFFSET, exbuf.packet.len() as u64).unwrap();
        copro.invoke(OP_TRYMATCH, &exbuf).unwrap();
        assert_eq!(copro.read(REG_COUNT).unwrap(), 1);
    }

    #[test]
    fn no_more_results_is_a_self_check_failure() {
        let blob = init_blob(&[("", "zzz")]);
        let mut copro = RegexCoprocessor::new();
        copro.init(&blob).unwrap();
        let exbuf = ExchangeBuffer::default();
        assert!(copro.invoke(OP_GETRESULT, &exbuf).is_err());
    }
}
