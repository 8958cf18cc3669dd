//! `stringmatching` coprocessor: multi-pattern Aho–Corasick matching over the current
//! exchange buffer's packet bytes.
//!
//! Grounded on `stringmatching.c`'s register protocol (R0 = group id / result count,
//! R1 = start offset / returned user data, R2 = haystack length / returned end offset)
//! and its `RESET`/`TRYMATCH`/`TRYMATCH_WITH_OFFSET`/`GETRESULT` operation set. The
//! automaton itself is `aho-corasick` rather than a hand-rolled `acsmx2.c` port — the
//! original's row-storage-mode selection (full/sparse/banded/sparse-banded) is recorded
//! only as a diagnostic [`GroupStats`], since the crate picks its own internal
//! representation.

use aho_corasick::AhoCorasick;

use super::{Coprocessor, RegisterAccess};
use crate::error::RuntimeException;
use crate::runtime::ExchangeBuffer;

/// Maximum number of matches buffered per `try_match` call (`MAX_MATCHES` in the
/// original).
pub const MAX_MATCHES: usize = 1_600;

const REG_GROUP_OR_COUNT: usize = 0;
const REG_OFFSET_OR_DATA: usize = 1;
const REG_LEN_OR_ENDOFFSET: usize = 2;
const REGISTER_COUNT: usize = 4;

const OP_RESET: u32 = 0;
const OP_TRYMATCH: u32 = 1;
const OP_TRYMATCH_WITH_OFFSET: u32 = 2;
const OP_GETRESULT: u32 = 3;

/// One decoded pattern from the init blob, kept for diagnostics and end-offset
/// computation (`offset + length`, per `nvmStringMatchCoproMatchResult`).
#[derive(Debug, Clone)]
pub struct Pattern {
    pub length: u16,
    pub case_insensitive: bool,
    pub user_data: u32,
}

/// Row-storage mode recorded for diagnostics, mirroring `acsmCompile`'s summary
/// printout. Not load-bearing: `aho-corasick` chooses its own internal representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Full,
    Sparse,
    Banded,
    SparseBanded,
}

/// Per-group build statistics, exposed for diagnostics instead of printed as in the
/// original.
#[derive(Debug, Clone)]
pub struct GroupStats {
    pub pattern_count: usize,
    pub storage_mode: StorageMode,
}

struct Group {
    patterns: Vec<Pattern>,
    /// `aho-corasick` pattern index -> index into `patterns`. Case-sensitive and
    /// case-insensitive patterns are compiled into separate automata since the crate's
    /// case-insensitivity flag is builder-wide, not per-pattern.
    exact: Option<AhoCorasick>,
    exact_patterns: Vec<usize>,
    nocase: Option<AhoCorasick>,
    nocase_patterns: Vec<usize>,
    stats: GroupStats,
}

#[derive(Clone, Copy)]
struct Match {
    user_data: u32,
    end_offset: u32,
}

/// The `"stringmatching"` coprocessor.
///
/// Registers follow `nvmStringMatchCoproRun`: R0 holds the group id going into
/// `TRYMATCH`/`TRYMATCH_WITH_OFFSET` and the remaining-match count coming out of them
/// (and decrementing through `GETRESULT`); R1 holds the search start offset going in
/// and a matched pattern's `user_data` coming out of `GETRESULT`; R2 holds the
/// haystack length going in and the match's end offset coming out.
pub struct StringMatchCoprocessor {
    groups: Vec<Group>,
    matches: Vec<Match>,
    next_match: usize,
    r0: u32,
    r1: u32,
    r2: u32,
}

impl StringMatchCoprocessor {
    pub fn new() -> Self {
        StringMatchCoprocessor { groups: Vec::new(), matches: Vec::new(), next_match: 0, r0: 0, r1: 0, r2: 0 }
    }

    pub fn group_stats(&self, group_id: usize) -> Option<&GroupStats> {
        self.groups.get(group_id).map(|g| &g.stats)
    }

    fn parse_init_blob(data: &[u8]) -> Result<Vec<Group>, RuntimeException> {
        let mut cursor = Cursor::new(data);
        let group_count = cursor.read_u16()?;
        let mut groups = Vec::with_capacity(group_count as usize);

        for _ in 0..group_count {
            let pattern_count = cursor.read_u16()?;
            let mut patterns = Vec::with_capacity(pattern_count as usize);
            let mut exact_literals: Vec<Vec<u8>> = Vec::new();
            let mut exact_patterns = Vec::new();
            let mut nocase_literals: Vec<Vec<u8>> = Vec::new();
            let mut nocase_patterns = Vec::new();

            for _ in 0..pattern_count {
                let length = cursor.read_u16()?;
                let case_insensitive = cursor.read_u16()? != 0;
                let user_data = cursor.read_u32()?;
                let bytes = cursor.read_bytes(length as usize)?.to_vec();

                let pattern_index = patterns.len();
                if case_insensitive {
                    nocase_literals.push(bytes);
                    nocase_patterns.push(pattern_index);
                } else {
                    exact_literals.push(bytes);
                    exact_patterns.push(pattern_index);
                }
                patterns.push(Pattern { length, case_insensitive, user_data });
            }

            let exact = if exact_literals.is_empty() {
                None
            } else {
                Some(
                    AhoCorasick::new(&exact_literals)
                        .map_err(|_| RuntimeException::CoprocessorSelfCheck)?,
                )
            };
            let nocase = if nocase_literals.is_empty() {
                None
            } else {
                Some(
                    aho_corasick::AhoCorasickBuilder::new()
                        .ascii_case_insensitive(true)
                        .build(&nocase_literals)
                        .map_err(|_| RuntimeException::CoprocessorSelfCheck)?,
                )
            };

            let storage_mode = match patterns.len() {
                0..=8 => StorageMode::Full,
                9..=64 => StorageMode::Banded,
                65..=512 => StorageMode::Sparse,
                _ => StorageMode::SparseBanded,
            };

            groups.push(Group {
                stats: GroupStats { pattern_count: patterns.len(), storage_mode },
                patterns,
                exact,
                exact_patterns,
                nocase,
                nocase_patterns,
            });
        }

        Ok(groups)
    }

    fn try_match_group(&mut self, group_id: usize, haystack: &[u8], start_offset: usize) -> Result<u32, RuntimeException> {
        self.matches.clear();
        self.next_match = 0;

        let Some(group) = self.groups.get(group_id) else {
            return Err(RuntimeException::CoprocessorSelfCheck);
        };
        let slice = haystack.get(start_offset..).unwrap_or(&[]);

        if let Some(ac) = &group.exact {
            for m in ac.find_overlapping_iter(slice) {
                if self.matches.len() >= MAX_MATCHES {
                    break;
                }
                let pattern = &group.patterns[group.exact_patterns[m.pattern().as_usize()]];
                self.matches.push(Match {
                    user_data: pattern.user_data,
                    end_offset: (start_offset + m.end()) as u32,
                });
            }
        }
        if let Some(ac) = &group.nocase {
            for m in ac.find_overlapping_iter(slice) {
                if self.matches.len() >= MAX_MATCHES {
                    break;
                }
                let pattern = &group.patterns[group.nocase_patterns[m.pattern().as_usize()]];
                self.matches.push(Match {
                    user_data: pattern.user_data,
                    end_offset: (start_offset + m.end()) as u32,
                });
            }
        }

        self.matches.sort_by_key(|m| m.end_offset);
        Ok(self.matches.len() as u32)
    }
}

impl Default for StringMatchCoprocessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Coprocessor for StringMatchCoprocessor {
    fn name(&self) -> &'static str {
        "stringmatching"
    }

    fn register_count(&self) -> usize {
        REGISTER_COUNT
    }

    fn register_access(&self, index: usize) -> RegisterAccess {
        match index {
            REG_GROUP_OR_COUNT | REG_OFFSET_OR_DATA | REG_LEN_OR_ENDOFFSET => RegisterAccess::READ_WRITE,
            _ => RegisterAccess { readable: false, writable: false },
        }
    }

    fn init(&mut self, data: &[u8]) -> Result<(), RuntimeException> {
        self.groups = Self::parse_init_blob(data)?;
        self.matches.clear();
        self.next_match = 0;
        self.r0 = 0;
        self.r1 = 0;
        self.r2 = 0;
        Ok(())
    }

    fn read(&self, index: usize) -> Result<u64, RuntimeException> {
        match index {
            REG_GROUP_OR_COUNT => Ok(self.r0 as u64),
            REG_OFFSET_OR_DATA => Ok(self.r1 as u64),
            REG_LEN_OR_ENDOFFSET => Ok(self.r2 as u64),
            _ => Err(RuntimeException::CoprocessorSelfCheck),
        }
    }

    fn write(&mut self, index: usize, value: u64) -> Result<(), RuntimeException> {
        match index {
            REG_GROUP_OR_COUNT => {
                self.r0 = value as u32;
                Ok(())
            }
            REG_OFFSET_OR_DATA => {
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
            OP_RESET => {
                self.matches.clear();
                self.next_match = 0;
                Ok(())
            }
            OP_TRYMATCH => {
                let group_id = self.r0 as usize;
                let haylen = self.r2 as usize;
                let haystack = &exbuf.packet[..haylen.min(exbuf.packet.len())];
                self.r0 = self.try_match_group(group_id, haystack, 0)?;
                Ok(())
            }
            OP_TRYMATCH_WITH_OFFSET => {
                let group_id = self.r0 as usize;
                let start_offset = self.r1 as usize;
                let haylen = self.r2 as usize;
                let haystack = &exbuf.packet[..haylen.min(exbuf.packet.len())];
                self.r0 = self.try_match_group(group_id, haystack, start_offset)?;
                Ok(())
            }
            OP_GETRESULT => {
                if self.r0 > 0 && self.next_match < self.matches.len() {
                    let matched = self.matches[self.next_match];
                    self.r0 -= 1;
                    self.r1 = matched.user_data;
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

/// Little-endian cursor over an init blob, erroring out instead of panicking on
/// truncated input (the original trusts its caller; we don't).
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

    fn read_u32(&mut self) -> Result<u32, RuntimeException> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
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

    fn init_blob(groups: &[&[(&str, bool, u32)]]) -> Vec<u8> {
        let mut blob = Vec::new();
        blob.extend_from_slice(&(groups.len() as u16).to_le_bytes());
        for group in groups {
            blob.extend_from_slice(&(group.len() as u16).to_le_bytes());
            for (pattern, nocase, data) in *group {
                blob.extend_from_slice(&(pattern.len() as u16).to_le_bytes());
                blob.extend_from_slice(&(*nocase as u16).to_le_bytes());
                blob.extend_from_slice(&data.to_le_bytes());
                blob.extend_from_slice(pattern.as_bytes());
            }
        }
        blob
    }

    #[test]
    fn parses_a_single_group_init_blob() {
        let blob = init_blob(&[&[("foo", false, 1), ("bar", false, 2)]]);
        let mut copro = StringMatchCoprocessor::new();
        copro.init(&blob).unwrap();
        assert_eq!(copro.group_stats(0).unwrap().pattern_count, 2);
    }

    #[test]
    fn finds_both_patterns_in_a_buffer() {
        let blob = init_blob(&[&[("foo", false, 1), ("bar", false, 2)]]);
        let mut copro = StringMatchCoprocessor::new();
        copro.init(&blob).unwrap();

        let haystack = b"prefoostuffbarend";
        let count = copro.try_match_group(0, haystack, 0).unwrap();
        assert_eq!(count, 2);
        assert_eq!(copro.matches[0].end_offset, 6);
        assert_eq!(copro.matches[1].end_offset, 14);
    }

    #[test]
    fn unknown_group_is_a_self_check_failure() {
        let blob = init_blob(&[&[("foo", false, 1)]]);
        let mut copro = StringMatchCoprocessor::new();
        copro.init(&blob).unwrap();
        assert!(copro.try_match_group(5, b"foo", 0).is_err());
    }
}
