//! NSA volume parsing: header, entry table, payload reads.
//!
//! The header is big-endian; the entry table follows it immediately and
//! payloads live in `[base_offset, EOF)`. Some encountered volumes violate
//! the canonical layout, hence the leading-pad skip and the zero-object-count
//! fallback knobs.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use encoding_rs::SHIFT_JIS;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct NsaHeader {
    pub object_count: u16,
    pub base_offset: u32,
}

#[derive(Debug, Clone)]
pub struct NsaEntry {
    /// CP932-decoded with replacement; may contain backslash separators.
    pub name: String,
    pub compression_flag: u8,
    pub rel_offset: u32,
    pub stored_size: u32,
    pub expanded_size: u32,
}

fn read_u16_be(r: &mut impl Read, what: &'static str) -> Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)
        .map_err(|e| short_read(e, what))?;
    Ok(u16::from_be_bytes(buf))
}

fn read_u32_be(r: &mut impl Read, what: &'static str) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)
        .map_err(|e| short_read(e, what))?;
    Ok(u32::from_be_bytes(buf))
}

fn short_read(e: std::io::Error, what: &'static str) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::UnexpectedEof(what)
    } else {
        Error::Io(e)
    }
}

/// Read a NUL-terminated byte string; plain EOF ends the name like a NUL.
fn read_cstring(r: &mut impl Read) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut b = [0u8; 1];
    loop {
        match r.read(&mut b) {
            Ok(0) => break,
            Ok(_) => {
                if b[0] == 0 {
                    break;
                }
                out.push(b[0]);
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(out)
}

/// Parse the volume header.
///
/// `hdr_skip` consumes N pad bytes first; with `objcount_fallback` a zero
/// object count is re-read from the following u16.
pub fn parse_header(r: &mut impl Read, hdr_skip: usize, objcount_fallback: bool) -> Result<NsaHeader> {
    if hdr_skip > 0 {
        let mut pad = vec![0u8; hdr_skip];
        r.read_exact(&mut pad)
            .map_err(|e| short_read(e, "header pad"))?;
    }
    let mut object_count = read_u16_be(r, "object_count")?;
    if objcount_fallback && object_count == 0 {
        object_count = read_u16_be(r, "object_count (fallback)")?;
    }
    let base_offset = read_u32_be(r, "base offset")?;
    Ok(NsaHeader {
        object_count,
        base_offset,
    })
}

/// Parse `count` directory entries following the header.
pub fn parse_entries(r: &mut impl Read, count: u16) -> Result<Vec<NsaEntry>> {
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let raw_name = read_cstring(r)?;
        let (name, _, _) = SHIFT_JIS.decode(&raw_name);
        let mut flag = [0u8; 1];
        r.read_exact(&mut flag)
            .map_err(|e| short_read(e, "directory compression flag"))?;
        let rel_offset = read_u32_be(r, "entry offset")?;
        let stored_size = read_u32_be(r, "entry stored size")?;
        let expanded_size = read_u32_be(r, "entry expanded size")?;
        entries.push(NsaEntry {
            name: name.into_owned(),
            compression_flag: flag[0],
            rel_offset,
            stored_size,
            expanded_size,
        });
    }
    Ok(entries)
}

/// Read one entry's stored payload. A short read is fatal for this entry
/// only; the caller continues with the rest of the table.
pub fn read_entry_data(f: &mut File, base_offset: u32, entry: &NsaEntry) -> Result<Vec<u8>> {
    f.seek(SeekFrom::Start(base_offset as u64 + entry.rel_offset as u64))?;
    let mut data = vec![0u8; entry.stored_size as usize];
    f.read_exact(&mut data)
        .map_err(|e| short_read(e, "entry data"))?;
    Ok(data)
}

/// Probe `arc.nsa`, then `arc0.nsa` .. `arc{max_volumes-1}.nsa`. Holes in
/// the numbering are skipped; discovery order is the dispatch order.
pub fn discover_volumes(root: &Path, max_volumes: u32) -> Vec<PathBuf> {
    let mut vols = Vec::new();
    let p0 = root.join("arc.nsa");
    if p0.exists() {
        vols.push(p0);
    }
    for n in 0..max_volumes {
        let pn = root.join(format!("arc{n}.nsa"));
        if pn.exists() {
            vols.push(pn);
        }
    }
    vols
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_volume() -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&2u16.to_be_bytes());
        let base: u32 = 6 + 30;
        v.extend_from_slice(&base.to_be_bytes());
        // entry 0: "a.bmp", flag 0, off 0, stored 4, expanded 4
        v.extend_from_slice(b"a.bmp\0");
        v.push(0);
        v.extend_from_slice(&0u32.to_be_bytes());
        v.extend_from_slice(&4u32.to_be_bytes());
        v.extend_from_slice(&4u32.to_be_bytes());
        // entry 1: "snd\\b.nbz", flag 4, off 4, stored 2, expanded 2
        v.extend_from_slice(b"snd\\b.nbz\0");
        v.push(4);
        v.extend_from_slice(&4u32.to_be_bytes());
        v.extend_from_slice(&2u32.to_be_bytes());
        v.extend_from_slice(&2u32.to_be_bytes());
        assert_eq!(v.len(), base as usize);
        v.extend_from_slice(b"BM\x01\x02");
        v.extend_from_slice(b"ZZ");
        v
    }

    #[test]
    fn parses_header_and_entries() {
        let vol = sample_volume();
        let mut r = Cursor::new(&vol);
        let header = parse_header(&mut r, 0, false).unwrap();
        assert_eq!(header.object_count, 2);
        assert_eq!(header.base_offset, 36);
        let entries = parse_entries(&mut r, header.object_count).unwrap();
        assert_eq!(entries[0].name, "a.bmp");
        assert_eq!(entries[0].compression_flag, 0);
        assert_eq!(entries[1].name, "snd\\b.nbz");
        assert_eq!(entries[1].rel_offset, 4);
        assert_eq!(entries[1].stored_size, 2);
    }

    #[test]
    fn hdr_skip_and_objcount_fallback() {
        let mut vol = vec![0xEE];
        vol.extend_from_slice(&0u16.to_be_bytes());
        vol.extend_from_slice(&7u16.to_be_bytes());
        vol.extend_from_slice(&0x1234u32.to_be_bytes());
        let mut r = Cursor::new(&vol);
        let header = parse_header(&mut r, 1, true).unwrap();
        assert_eq!(header.object_count, 7);
        assert_eq!(header.base_offset, 0x1234);
    }

    #[test]
    fn truncated_header_is_unexpected_eof() {
        let mut r = Cursor::new(&[0u8, 1][..]);
        match parse_header(&mut r, 0, false) {
            Err(Error::UnexpectedEof(_)) => {}
            other => panic!("expected UnexpectedEof, got {other:?}"),
        }
    }

    #[test]
    fn cp932_name_decoded_with_replacement() {
        // 0x82 0xA0 is Hiragana 'A' in CP932; a lone 0x82 is malformed and
        // must decode to the replacement character rather than fail.
        let mut v = Vec::new();
        v.extend_from_slice(&[0x82, 0xA0, 0x00]);
        v.push(0);
        v.extend_from_slice(&0u32.to_be_bytes());
        v.extend_from_slice(&1u32.to_be_bytes());
        v.extend_from_slice(&1u32.to_be_bytes());
        v.extend_from_slice(&[0x82, 0x00]);
        v.push(0);
        v.extend_from_slice(&0u32.to_be_bytes());
        v.extend_from_slice(&1u32.to_be_bytes());
        v.extend_from_slice(&1u32.to_be_bytes());
        let mut r = Cursor::new(&v);
        let entries = parse_entries(&mut r, 2).unwrap();
        assert_eq!(entries[0].name, "あ");
        assert!(entries[1].name.contains('\u{FFFD}'));
    }
}
