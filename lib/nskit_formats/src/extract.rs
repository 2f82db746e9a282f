//! Per-entry dispatch and volume extraction.
//!
//! The entry table's compression flag is advisory at best in the wild, so
//! dispatch triangulates between the flag, the file extension, and the
//! payload's leading bytes. Decoder failures downgrade to skip statuses and
//! the run continues; only I/O aborts an entry.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::time::Duration;

use crate::archive::{self, NsaEntry};
use crate::error::{Error, Result};
use crate::image::{self, SpbPlane, SpbScan};
use crate::lzss;

/// SPB conversion policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpbMode {
    /// Convert when plausible, keep original bytes otherwise.
    Auto,
    /// Always attempt conversion (plausibility/size gates still apply
    /// unless their skip flags are set).
    Convert,
    /// Never convert; SPB-looking entries are skipped with `spb_skip_policy`.
    Copy,
}

#[derive(Debug, Clone)]
pub struct SpbOptions {
    pub mode: SpbMode,
    /// Per-image decode budget; `None` disables the deadline.
    pub timeout: Option<Duration>,
    pub skip_plausibility: bool,
    pub skip_sizecheck: bool,
    pub scan: SpbScan,
    pub plane: SpbPlane,
}

impl Default for SpbOptions {
    fn default() -> Self {
        SpbOptions {
            mode: SpbMode::Auto,
            timeout: Some(Duration::from_millis(1500)),
            skip_plausibility: false,
            skip_sizecheck: false,
            scan: SpbScan::Zigzag,
            plane: SpbPlane::Bgr,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Skip N bytes before reading the object count.
    pub hdr_skip: usize,
    /// If the first object count reads zero, use the following u16.
    pub objcount_fallback: bool,
    /// Process only this entry index (triage).
    pub only_index: Option<usize>,
    /// Print the first N payload bytes of each entry (triage).
    pub hexdump: Option<usize>,
    pub spb: SpbOptions,
    /// Dump skipped entries' original bytes under this root.
    pub save_skips_dir: Option<PathBuf>,
}

/// What to do with one entry's payload.
#[derive(Debug)]
pub enum EntryOutcome {
    Write {
        bytes: Vec<u8>,
        status: &'static str,
    },
    Skip(&'static str),
}

enum BmpDecision {
    /// Already a BMP; the caller writes the original bytes.
    Original,
    Converted(Vec<u8>, &'static str),
    Skip(&'static str),
}

fn bz2_decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    bzip2::read::BzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

fn find_lzss_magic(raw: &[u8]) -> Option<usize> {
    let scan_max = 16.min(raw.len().saturating_sub(1));
    (0..scan_max).find(|&off| raw[off] == 0xA1 && raw[off + 1] == 0x53)
}

fn try_spb(raw: &[u8], opts: &SpbOptions) -> Result<Vec<u8>> {
    image::decode_spb(raw, opts.timeout, opts.scan, opts.plane)
}

/// The generic `.bmp` ladder: raw BM, then bzip2, then LZSS, then SPB.
fn detect_and_process_bmp(raw: &[u8], expanded_size: u32, opts: &SpbOptions) -> BmpDecision {
    if raw.len() >= 2 && raw[..2] == *b"BM" {
        return BmpDecision::Original;
    }

    // Some archives store a 4-byte size before the BZh stream.
    for bz_off in [0usize, 4] {
        if raw.len() >= bz_off + 3 && raw[bz_off..bz_off + 3] == *b"BZh" {
            if let Ok(decomp) = bz2_decompress(&raw[bz_off..]) {
                if decomp.len() >= 2 && decomp[..2] == *b"BM" {
                    return BmpDecision::Converted(decomp, "bz2_decompressed");
                }
            }
        }
    }

    if let Some(lz_off) = find_lzss_magic(raw) {
        let out = lzss::decompress(raw, expanded_size as usize, lz_off);
        if out.len() >= 2 && out[..2] == *b"BM" {
            return BmpDecision::Converted(out, "lzss_decompressed");
        }
        // Not a BMP after all; fall through to the SPB path.
    }

    let (plausible, mut w, mut h) = image::spb_plausible(raw);
    if !plausible {
        if !opts.skip_plausibility {
            return BmpDecision::Skip("spb_skip_implausible");
        }
        if raw.len() >= 4 {
            w = u16::from_be_bytes([raw[0], raw[1]]) as u32;
            h = u16::from_be_bytes([raw[2], raw[3]]) as u32;
        }
    }

    if !opts.skip_sizecheck && expanded_size > 0 {
        let expected = image::expected_24bpp_bmp_size(w, h) as i64;
        if (expected - expanded_size as i64).abs() > 8 {
            return BmpDecision::Skip("spb_skip_mismatch");
        }
    }

    if opts.mode == SpbMode::Copy {
        return BmpDecision::Skip("spb_skip_policy");
    }

    match try_spb(raw, opts) {
        Ok(out) => BmpDecision::Converted(out, "spb_converted"),
        Err(Error::Timeout) => BmpDecision::Skip("spb_skip_timeout"),
        Err(_) => BmpDecision::Skip("spb_skip_error"),
    }
}

fn name_extension(name: &str) -> String {
    Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Decide how to handle one entry given its payload and table metadata.
pub fn process_entry_bytes(
    name: &str,
    data: &[u8],
    expanded_size: u32,
    flag: u8,
    opts: &SpbOptions,
) -> EntryOutcome {
    let ext = name_extension(name);

    if ext == "nbz" {
        // The payload keeps its 4-byte length header stripped; the sibling
        // .wav side effect handles decompression.
        let payload = if data.len() >= 4 { &data[4..] } else { data };
        return EntryOutcome::Write {
            bytes: payload.to_vec(),
            status: "nbz_payload",
        };
    }
    if flag == 4 {
        // Flagged bzip2 but not named .nbz: emit decompressed bytes directly.
        for bz_off in [0usize, 4] {
            if data.len() >= bz_off + 3 && data[bz_off..bz_off + 3] == *b"BZh" {
                if let Ok(wav) = bz2_decompress(&data[bz_off..]) {
                    return EntryOutcome::Write {
                        bytes: wav,
                        status: "nbz_decompressed",
                    };
                }
            }
        }
        let payload = if data.len() >= 4 { &data[4..] } else { data };
        return EntryOutcome::Write {
            bytes: payload.to_vec(),
            status: "nbz_payload",
        };
    }

    if ext == "bmp" {
        // Flagged LZSS gets first shot; the result must still be a BMP.
        if flag == 2 {
            if let Some(lz_off) = find_lzss_magic(data) {
                let out = lzss::decompress(data, expanded_size as usize, lz_off);
                if out.len() >= 2 && out[..2] == *b"BM" {
                    return EntryOutcome::Write {
                        bytes: out,
                        status: "lzss_decompressed_flag",
                    };
                }
            }
        }

        // Flagged SPB gets first shot too, behind the same gates.
        if flag == 1 && opts.mode != SpbMode::Copy {
            let (plausible, w, h) = image::spb_plausible(data);
            if plausible || opts.skip_plausibility {
                let size_gated = !opts.skip_sizecheck && expanded_size > 0 && data.len() >= 4;
                let size_ok = if size_gated {
                    let expected = image::expected_24bpp_bmp_size(w, h) as i64;
                    (expected - expanded_size as i64).abs() <= 8
                } else {
                    true
                };
                if size_ok {
                    if let Ok(out) = try_spb(data, opts) {
                        return EntryOutcome::Write {
                            bytes: out,
                            status: "spb_converted_flag",
                        };
                    }
                }
            }
        }

        return match detect_and_process_bmp(data, expanded_size, opts) {
            BmpDecision::Original => EntryOutcome::Write {
                bytes: data.to_vec(),
                status: "raw_bmp",
            },
            BmpDecision::Converted(bytes, status) => EntryOutcome::Write { bytes, status },
            BmpDecision::Skip(status) => EntryOutcome::Skip(status),
        };
    }

    EntryOutcome::Write {
        bytes: data.to_vec(),
        status: "passthrough",
    }
}

fn host_relative(name: &str) -> String {
    name.replace(['\\', '/'], &MAIN_SEPARATOR.to_string())
}

fn safe_reason(reason: &str) -> String {
    reason
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn skip_dest_path(save_root: &Path, rel_name: &str, reason: &str) -> PathBuf {
    let rel = PathBuf::from(host_relative(rel_name));
    let stem = rel
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dir = rel.parent().unwrap_or_else(|| Path::new(""));
    save_root
        .join(dir)
        .join(format!("{stem}.skip-{}.bin", safe_reason(reason)))
}

fn write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)?;
    Ok(())
}

/// Sibling `.wav` next to a written `.nbz` payload; failures are ignored.
fn postprocess_side_effects(out_path: &Path, bytes: &[u8]) {
    let is_nbz = out_path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("nbz"))
        .unwrap_or(false);
    if !is_nbz {
        return;
    }
    match bz2_decompress(bytes) {
        Ok(wav) => {
            let wav_path = out_path.with_extension("wav");
            if let Err(e) = write_bytes(&wav_path, &wav) {
                log::warn!("could not write {}: {e}", wav_path.display());
            }
        }
        Err(e) => log::debug!("{}: not a bzip2 payload: {e}", out_path.display()),
    }
}

fn hexdump_preview(label: &str, bytes: &[u8], n: usize) {
    let take = n.min(bytes.len());
    println!("[hexdump] {label} len={} first {take} bytes:", bytes.len());
    let hex: Vec<String> = bytes[..take].iter().map(|b| format!("{b:02x}")).collect();
    println!("{}", hex.join(" "));
}

fn handle_entry(
    f: &mut fs::File,
    base_offset: u32,
    i: usize,
    entry: &NsaEntry,
    out_root: &Path,
    opts: &ExtractOptions,
) -> Result<()> {
    let raw = archive::read_entry_data(f, base_offset, entry)?;
    if let Some(n) = opts.hexdump {
        println!(
            "[debug] idx={i} name={} stored={} expanded={}",
            entry.name, entry.stored_size, entry.expanded_size
        );
        hexdump_preview(&entry.name, &raw, n);
    }

    let abs_off = base_offset as u64 + entry.rel_offset as u64;
    match process_entry_bytes(&entry.name, &raw, entry.expanded_size, entry.compression_flag, &opts.spb) {
        EntryOutcome::Write { bytes, status } => {
            let out_path = out_root.join(host_relative(&entry.name));
            write_bytes(&out_path, &bytes)?;
            postprocess_side_effects(&out_path, &bytes);
            println!(
                "  #{i:04} {} [{status}] flag={} off=0x{abs_off:08X} stored=0x{:08X} expanded=0x{:08X}",
                entry.name, entry.compression_flag, entry.stored_size, entry.expanded_size
            );
        }
        EntryOutcome::Skip(status) => {
            let mut saved_msg = String::new();
            if let Some(save_root) = &opts.save_skips_dir {
                let dest = skip_dest_path(save_root, &entry.name, status);
                write_bytes(&dest, &raw)?;
                saved_msg = format!(" -> saved: {}", dest.display());
            }
            println!(
                "  #{i:04} {} SKIPPED ({status}) flag={} off=0x{abs_off:08X} stored=0x{:08X} expanded=0x{:08X}{saved_msg}",
                entry.name, entry.compression_flag, entry.stored_size, entry.expanded_size
            );
        }
    }
    Ok(())
}

/// Extract one volume: one stdout line per processed entry, per-entry
/// failures reported and skipped, header failures fatal for the volume.
pub fn extract_volume(vol_path: &Path, out_root: &Path, opts: &ExtractOptions) -> Result<()> {
    let mut f = fs::File::open(vol_path)?;
    let header = archive::parse_header(&mut f, opts.hdr_skip, opts.objcount_fallback)?;
    let entries = archive::parse_entries(&mut f, header.object_count)?;

    let vol_name = vol_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    println!(
        "[{vol_name}] objects={} base=0x{:08X}",
        header.object_count, header.base_offset
    );

    for (i, entry) in entries.iter().enumerate() {
        if let Some(only) = opts.only_index {
            if i != only {
                continue;
            }
        }
        if let Err(e) = handle_entry(&mut f, header.base_offset, i, entry, out_root, opts) {
            println!("  ! #{i:04} {}: {e}", entry.name);
        }
        if opts.only_index.is_some() {
            break;
        }
    }
    Ok(())
}
