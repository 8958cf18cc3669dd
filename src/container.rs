//! The PE image container format (spec §6): a file header naming the three segment
//! entry points, a section table, and section bodies.
//!
//! Parsing lives here because it is in scope (the in-memory container parser); loading
//! the bytes themselves from a file or an assembler's output is the host's job (spec
//! §1's "out of scope" list).

use bitflags::bitflags;

use crate::verifier::SegmentHeader;

bitflags! {
    /// Section-flag bitmask (spec §6): `CODE | {PUSH, PULL, INIT}` for code sections,
    /// `PORT` for the port descriptor table, `INSN_LINES | {PUSH, PULL, INIT}` for
    /// debug line maps.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u32 {
        const CODE = 1 << 0;
        const PORT = 1 << 1;
        const INSN_LINES = 1 << 2;
        const INIT = 1 << 3;
        const PUSH = 1 << 4;
        const PULL = 1 << 5;
    }
}

/// One entry in the section table.
#[derive(Debug, Clone)]
pub struct SectionEntry {
    pub name: String,
    pub size: u32,
    pub file_offset: u32,
    pub flags: SectionFlags,
}

/// The file header naming the three per-segment entry points (spec §6).
#[derive(Debug, Clone, Copy, Default)]
pub struct FileHeader {
    pub address_of_init: u32,
    pub address_of_push: u32,
    pub address_of_pull: u32,
}

/// A `(instruction_offset, source_line)` pair from a debug line-map section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineMapEntry {
    pub instruction_offset: u32,
    pub source_line: u32,
}

/// A parsed code section: its declared header plus raw bytecode bytes.
#[derive(Debug, Clone)]
pub struct CodeSection {
    pub header: SegmentHeader,
    pub code: Vec<u8>,
}

/// Error parsing a container image. Distinct from [`crate::verifier::VerifyError`]:
/// this is a malformed-container error, not a bytecode-semantics one.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum ContainerError {
    #[display(fmt = "image is shorter than the file header")]
    Truncated,
    #[display(fmt = "section table entry {index} extends past the image end")]
    SectionOutOfBounds { index: usize },
    #[display(fmt = "code section {index} is shorter than its 8-byte header")]
    CodeSectionHeaderTruncated { index: usize },
    #[display(fmt = "section name at entry {index} is not valid UTF-8")]
    InvalidSectionName { index: usize },
}

const FILE_HEADER_LEN: usize = 12;
const SECTION_ENTRY_FIXED_LEN: usize = 4 + 4 + 4 + 4; // name_len, size, file_offset, flags
const CODE_SECTION_HEADER_LEN: usize = 8;

/// A fully parsed PE image: the file header plus every section, decoded by kind.
#[derive(Debug, Clone, Default)]
pub struct Image {
    pub header: FileHeader,
    pub code_sections: Vec<(SectionEntry, CodeSection)>,
    pub port_sections: Vec<(SectionEntry, Vec<u8>)>,
    pub line_map_sections: Vec<(SectionEntry, Vec<LineMapEntry>)>,
}

/// Parses a complete PE image from `data`.
///
/// Layout: 12-byte file header (`addressOfInit`, `addressOfPush`, `addressOfPull`, each
/// `u32`), then a `u32` section count, then that many section-table entries (`u32`
/// name length, name bytes, `u32` size, `u32` file_offset, `u32` flags), with section
/// bodies located by `file_offset`/`size` into `data`.
pub fn parse(data: &[u8]) -> Result<Image, ContainerError> {
    if data.len() < FILE_HEADER_LEN + 4 {
        return Err(ContainerError::Truncated);
    }

    let header = FileHeader {
        address_of_init: read_u32(data, 0),
        address_of_push: read_u32(data, 4),
        address_of_pull: read_u32(data, 8),
    };

    let section_count = read_u32(data, FILE_HEADER_LEN) as usize;
    let mut cursor = FILE_HEADER_LEN + 4;

    let mut image = Image { header, ..Default::default() };

    for index in 0..section_count {
        if cursor + 4 > data.len() {
            return Err(ContainerError::SectionOutOfBounds { index });
        }
        let name_len = read_u32(data, cursor) as usize;
        cursor += 4;
        if cursor + name_len + SECTION_ENTRY_FIXED_LEN - 4 > data.len() {
            return Err(ContainerError::SectionOutOfBounds { index });
        }
        let name = std::str::from_utf8(&data[cursor..cursor + name_len])
            .map_err(|_| ContainerError::InvalidSectionName { index })?
            .to_string();
        cursor += name_len;

        let size = read_u32(data, cursor);
        let file_offset = read_u32(data, cursor + 4);
        let flags = SectionFlags::from_bits_truncate(read_u32(data, cursor + 8));
        cursor += 12;

        let entry = SectionEntry { name, size, file_offset, flags };
        let body_start = entry.file_offset as usize;
        let body_end = body_start + entry.size as usize;
        let body = data.get(body_start..body_end).ok_or(ContainerError::SectionOutOfBounds { index })?;

        if flags.contains(SectionFlags::CODE) {
            if body.len() < CODE_SECTION_HEADER_LEN {
                return Err(ContainerError::CodeSectionHeaderTruncated { index });
            }
            let section_header = SegmentHeader {
                max_stack_size: read_u32(body, 0),
                locals_size: read_u32(body, 4),
            };
            let code = body[CODE_SECTION_HEADER_LEN..].to_vec();
            image.code_sections.push((entry, CodeSection { header: section_header, code }));
        } else if flags.contains(SectionFlags::PORT) {
            image.port_sections.push((entry, body.to_vec()));
        } else if flags.contains(SectionFlags::INSN_LINES) {
            let mut entries = Vec::with_capacity(body.len() / 8);
            for chunk in body.chunks_exact(8) {
                entries.push(LineMapEntry {
                    instruction_offset: read_u32(chunk, 0),
                    source_line: read_u32(chunk, 4),
                });
            }
            image.line_map_sections.push((entry, entries));
        }
    }

    Ok(image)
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

/// Serialises `image` back into container bytes. Round-tripping `parse(serialize(x))`
/// must yield an equal [`Image`] (spec §8's round-trip testable property); this is the
/// in-memory parser's own writer, used by tests, not the assembler's file format.
pub fn serialize(image: &Image) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&image.header.address_of_init.to_le_bytes());
    out.extend_from_slice(&image.header.address_of_push.to_le_bytes());
    out.extend_from_slice(&image.header.address_of_pull.to_le_bytes());

    let total_sections = image.code_sections.len() + image.port_sections.len() + image.line_map_sections.len();
    out.extend_from_slice(&(total_sections as u32).to_le_bytes());

    let mut bodies = Vec::new();
    let mut entries_bytes = Vec::new();

    let header_and_count_len = FILE_HEADER_LEN + 4;
    // First pass: compute section-table byte length so body offsets are correct.
    let mut table_len = 0usize;
    for (entry, _) in &image.code_sections {
        table_len += 4 + entry.name.len() + 12;
    }
    for (entry, _) in &image.port_sections {
        table_len += 4 + entry.name.len() + 12;
    }
    for (entry, _) in &image.line_map_sections {
        table_len += 4 + entry.name.len() + 12;
    }

    let mut body_cursor = header_and_count_len + table_len;

    for (entry, section) in &image.code_sections {
        let mut body = Vec::with_capacity(CODE_SECTION_HEADER_LEN + section.code.len());
        body.extend_from_slice(&section.header.max_stack_size.to_le_bytes());
        body.extend_from_slice(&section.header.locals_size.to_le_bytes());
        body.extend_from_slice(&section.code);
        push_entry(&mut entries_bytes, &entry.name, body.len() as u32, body_cursor as u32, entry.flags);
        body_cursor += body.len();
        bodies.extend_from_slice(&body);
    }
    for (entry, body) in &image.port_sections {
        push_entry(&mut entries_bytes, &entry.name, body.len() as u32, body_cursor as u32, entry.flags);
        body_cursor += body.len();
        bodies.extend_from_slice(body);
    }
    for (entry, lines) in &image.line_map_sections {
        let mut body = Vec::with_capacity(lines.len() * 8);
        for line in lines {
            body.extend_from_slice(&line.instruction_offset.to_le_bytes());
            body.extend_from_slice(&line.source_line.to_le_bytes());
        }
        push_entry(&mut entries_bytes, &entry.name, body.len() as u32, body_cursor as u32, entry.flags);
        body_cursor += body.len();
        bodies.extend_from_slice(&body);
    }

    out.extend_from_slice(&entries_bytes);
    out.extend_from_slice(&bodies);
    out
}

fn push_entry(out: &mut Vec<u8>, name: &str, size: u32, file_offset: u32, flags: SectionFlags) {
    out.extend_from_slice(&(name.len() as u32).to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&file_offset.to_le_bytes());
    out.extend_from_slice(&flags.bits().to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_image() -> Image {
        Image {
            header: FileHeader { address_of_init: 0, address_of_push: 0, address_of_pull: 0 },
            code_sections: vec![(
                SectionEntry { name: "push".into(), size: 0, file_offset: 0, flags: SectionFlags::CODE | SectionFlags::PUSH },
                CodeSection { header: SegmentHeader { max_stack_size: 1, locals_size: 0 }, code: vec![0x01, 0x06] },
            )],
            port_sections: vec![(
                SectionEntry { name: "ports".into(), size: 0, file_offset: 0, flags: SectionFlags::PORT },
                vec![1, 2, 3],
            )],
            line_map_sections: vec![(
                SectionEntry { name: "push.lines".into(), size: 0, file_offset: 0, flags: SectionFlags::INSN_LINES | SectionFlags::PUSH },
                vec![LineMapEntry { instruction_offset: 0, source_line: 10 }],
            )],
        }
    }

    #[test]
    fn round_trips_a_minimal_image() {
        let image = sample_image();
        let bytes = serialize(&image);
        let parsed = parse(&bytes).unwrap();

        assert_eq!(parsed.code_sections.len(), 1);
        assert_eq!(parsed.code_sections[0].1.code, vec![0x01, 0x06]);
        assert_eq!(parsed.code_sections[0].1.header.max_stack_size, 1);
        assert_eq!(parsed.port_sections[0].1, vec![1, 2, 3]);
        assert_eq!(parsed.line_map_sections[0].1[0].source_line, 10);
    }

    #[test]
    fn truncated_image_is_rejected() {
        assert_eq!(parse(&[0u8; 4]), Err(ContainerError::Truncated));
    }

    #[test]
    fn section_table_entry_out_of_bounds_is_rejected() {
        let mut bytes = vec![0u8; FILE_HEADER_LEN];
        bytes.extend_from_slice(&1u32.to_le_bytes()); // section_count = 1, but no entry follows
        assert!(matches!(parse(&bytes), Err(ContainerError::SectionOutOfBounds { index: 0 })));
    }
}
