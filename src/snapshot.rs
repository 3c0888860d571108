//! State snapshot save/restore, per spec.md §4.11: a magic-tagged,
//! versioned, 4-byte-aligned binary blob with a JSON metadata block.
//!
//! No teacher analog; grounded on spec.md §4.11's exact layout (magic
//! `0x86768676`, version 3) and on the ambient-stack decision
//! (SPEC_FULL.md §8) to use `serde`/`serde_json` for the metadata block the
//! way `amoljassal-sis-kernel-showcase`'s daemon crate uses `serde_json`
//! for its own structured state, and `thiserror` for the error enum the way
//! `error.rs`'s `CpuException` already does.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SNAPSHOT_MAGIC: u32 = 0x8676_8676;
pub const SNAPSHOT_VERSION: u32 = 3;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot magic mismatch: expected {expected:#010x}, found {found:#010x}")]
    BadMagic { expected: u32, found: u32 },
    #[error("snapshot version {found} unsupported (expected {expected})")]
    UnsupportedVersion { expected: u32, found: u32 },
    #[error("snapshot buffer truncated: needed at least {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },
    #[error("snapshot info block is not valid JSON: {0}")]
    InvalidInfoBlock(#[from] serde_json::Error),
}

/// Free-form metadata carried alongside the binary register/memory dump —
/// a build identifier and a human-readable description, per spec.md
/// §4.11's "JSON info block".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub emulator_version: String,
    pub description: String,
}

/// One named, length-prefixed, 4-byte-aligned section of the snapshot
/// (e.g. `"cpu"`, `"fpu"`, `"ram"`), per spec.md §4.11.
struct Section<'a> {
    name: &'a str,
    data: &'a [u8],
}

fn pad4(len: usize) -> usize {
    (4 - (len % 4)) % 4
}

fn write_section(out: &mut Vec<u8>, section: Section) {
    let name_bytes = section.name.as_bytes();
    out.extend_from_slice(&(name_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(name_bytes);
    out.resize(out.len() + pad4(name_bytes.len()), 0);

    out.extend_from_slice(&(section.data.len() as u32).to_le_bytes());
    out.extend_from_slice(section.data);
    out.resize(out.len() + pad4(section.data.len()), 0);
}

fn read_u32(data: &[u8], offset: &mut usize) -> Result<u32, SnapshotError> {
    if *offset + 4 > data.len() {
        return Err(SnapshotError::Truncated { needed: *offset + 4, available: data.len() });
    }
    let v = u32::from_le_bytes(data[*offset..*offset + 4].try_into().unwrap());
    *offset += 4;
    Ok(v)
}

fn read_section<'a>(data: &'a [u8], offset: &mut usize) -> Result<(String, &'a [u8]), SnapshotError> {
    let name_len = read_u32(data, offset)? as usize;
    if *offset + name_len > data.len() {
        return Err(SnapshotError::Truncated { needed: *offset + name_len, available: data.len() });
    }
    let name = String::from_utf8_lossy(&data[*offset..*offset + name_len]).into_owned();
    *offset += name_len + pad4(name_len);

    let data_len = read_u32(data, offset)? as usize;
    if *offset + data_len > data.len() {
        return Err(SnapshotError::Truncated { needed: *offset + data_len, available: data.len() });
    }
    let section_data = &data[*offset..*offset + data_len];
    *offset += data_len + pad4(data_len);

    Ok((name, section_data))
}

/// Builds a full snapshot image: `magic`, `version`, the JSON info block
/// (as a length-prefixed section named `"info"`), then each caller-supplied
/// named section in order.
pub fn save_state(info: &SnapshotInfo, sections: &[(&str, &[u8])]) -> Result<Vec<u8>, SnapshotError> {
    let mut out = Vec::new();
    out.extend_from_slice(&SNAPSHOT_MAGIC.to_le_bytes());
    out.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());

    let info_json = serde_json::to_vec(info)?;
    write_section(&mut out, Section { name: "info", data: &info_json });

    for (name, data) in sections {
        write_section(&mut out, Section { name, data });
    }

    Ok(out)
}

/// Parses a snapshot image, validating the magic and version and returning
/// the decoded info block plus each section's raw bytes in file order.
pub fn restore_state(data: &[u8]) -> Result<(SnapshotInfo, Vec<(String, Vec<u8>)>), SnapshotError> {
    let mut offset = 0usize;
    let magic = read_u32(data, &mut offset)?;
    if magic != SNAPSHOT_MAGIC {
        return Err(SnapshotError::BadMagic { expected: SNAPSHOT_MAGIC, found: magic });
    }
    let version = read_u32(data, &mut offset)?;
    if version != SNAPSHOT_VERSION {
        return Err(SnapshotError::UnsupportedVersion { expected: SNAPSHOT_VERSION, found: version });
    }

    let (name, info_bytes) = read_section(data, &mut offset)?;
    debug_assert_eq!(name, "info");
    let info: SnapshotInfo = serde_json::from_slice(info_bytes)?;

    let mut sections = Vec::new();
    while offset < data.len() {
        let (name, bytes) = read_section(data, &mut offset)?;
        sections.push((name, bytes.to_vec()));
    }

    Ok((info, sections))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_info_and_sections() {
        let info = SnapshotInfo { emulator_version: "0.1.0".into(), description: "test".into() };
        let cpu_bytes = vec![1, 2, 3, 4, 5];
        let blob = save_state(&info, &[("cpu", &cpu_bytes)]).unwrap();

        let (decoded_info, sections) = restore_state(&blob).unwrap();
        assert_eq!(decoded_info.emulator_version, "0.1.0");
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].0, "cpu");
        assert_eq!(sections[0].1, cpu_bytes);
    }

    #[test]
    fn rejects_bad_magic() {
        let data = vec![0u8; 16];
        let err = restore_state(&data).unwrap_err();
        assert!(matches!(err, SnapshotError::BadMagic { .. }));
    }

    #[test]
    fn rejects_truncated_buffer() {
        let data = SNAPSHOT_MAGIC.to_le_bytes().to_vec();
        let err = restore_state(&data).unwrap_err();
        assert!(matches!(err, SnapshotError::Truncated { .. }));
    }

    #[test]
    fn sections_are_4_byte_aligned() {
        let info = SnapshotInfo::default();
        let odd_length = vec![1, 2, 3];
        let blob = save_state(&info, &[("odd", &odd_length)]).unwrap();
        assert_eq!(blob.len() % 4, 0);
    }
}
