//! Script container loading: probe the known container names, undo the
//! container's byte transform, assemble numbered series, normalize newlines,
//! and index labels.

use std::fs;
use std::path::Path;

use encoding_rs::SHIFT_JIS;

use crate::error::{Error, Result};

/// Source text encoding. Decides whether a lead byte with the high bit set
/// opens a 2-byte sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Cp932,
    Utf8,
}

impl Encoding {
    /// Byte length of the character led by `b`. UTF-8 sources are walked
    /// byte-by-byte; CP932 pairs on the high bit.
    pub fn byte_len(self, b: u8) -> usize {
        match self {
            Encoding::Utf8 => 1,
            Encoding::Cp932 => {
                if b & 0x80 != 0 {
                    2
                } else {
                    1
                }
            }
        }
    }

    /// Decode with replacement; malformed input never aborts a load.
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Encoding::Cp932 => SHIFT_JIS.decode(bytes).0.into_owned(),
            Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    /// Encode text back into the source's byte space.
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            Encoding::Cp932 => SHIFT_JIS.encode(text).0.into_owned(),
            Encoding::Utf8 => text.as_bytes().to_vec(),
        }
    }
}

/// Byte transform applied while streaming a container file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    Plain,
    /// `nscript.dat` / `pscript.dat`: XOR every byte with 0x84.
    Xor84,
    /// `nscr_sec.dat`: XOR with a rotating 5-byte magic.
    RotMagic,
    /// `nscript.___`: substitute through a key table, then XOR with 0x84.
    KeyTable,
}

pub const ROT_MAGIC: [u8; 5] = [0x79, 0x57, 0x0D, 0x80, 0x04];

/// Identity permutation; the `nscript.___` table when none is supplied.
pub fn default_key_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    for (i, v) in table.iter_mut().enumerate() {
        *v = i as u8;
    }
    table
}

const PROBE_ORDER: [(&str, CipherMode, Encoding); 7] = [
    ("0.txt", CipherMode::Plain, Encoding::Cp932),
    ("0.utf", CipherMode::Plain, Encoding::Utf8),
    ("00.txt", CipherMode::Plain, Encoding::Cp932),
    ("nscr_sec.dat", CipherMode::RotMagic, Encoding::Cp932),
    ("nscript.___", CipherMode::KeyTable, Encoding::Cp932),
    ("nscript.dat", CipherMode::Xor84, Encoding::Cp932),
    ("pscript.dat", CipherMode::Xor84, Encoding::Utf8),
];

/// The decrypted, concatenated, newline-normalized script bytes.
pub struct ScriptSource {
    pub bytes: Vec<u8>,
    pub encoding: Encoding,
    /// `*` heads seen at line starts during the transform pass.
    pub label_heads: usize,
}

impl ScriptSource {
    /// Build a source from raw plain-text bytes, applying the same
    /// normalization pass the file loader does.
    pub fn from_bytes(raw: &[u8], encoding: Encoding) -> Self {
        let mut bytes = Vec::with_capacity(raw.len() + 1);
        let key_table = default_key_table();
        let label_heads = transform_file(raw, CipherMode::Plain, &key_table, &mut bytes);
        ScriptSource {
            bytes,
            encoding,
            label_heads,
        }
    }
}

/// One per-file transform pass: decrypt, count label heads, normalize CR and
/// CRLF to LF, and terminate with a final LF. Returns the head count.
fn transform_file(raw: &[u8], mode: CipherMode, key_table: &[u8; 256], out: &mut Vec<u8>) -> usize {
    let mut heads = 0usize;
    let mut magic_cursor = 0usize;
    let mut at_line_start = true;
    let mut pending_cr = false;
    let mut new_label = false;

    for &orig in raw {
        let b = match mode {
            CipherMode::Plain => orig,
            CipherMode::Xor84 => orig ^ 0x84,
            CipherMode::RotMagic => {
                let b = orig ^ ROT_MAGIC[magic_cursor];
                magic_cursor = (magic_cursor + 1) % 5;
                b
            }
            CipherMode::KeyTable => key_table[orig as usize] ^ 0x84,
        };

        if pending_cr && b != 0x0A {
            out.push(0x0A);
            at_line_start = true;
            pending_cr = false;
        }
        if b == b'*' && at_line_start && !new_label {
            heads += 1;
            new_label = true;
        } else {
            new_label = false;
        }
        if b == 0x0D {
            pending_cr = true;
            continue;
        }
        if b == 0x0A {
            out.push(0x0A);
            at_line_start = true;
            pending_cr = false;
        } else {
            out.push(b);
            if b != b' ' && b != b'\t' {
                at_line_start = false;
            }
        }
    }
    if pending_cr {
        out.push(0x0A);
    }
    out.push(0x0A);
    heads
}

/// Probe the container names in order and load the chosen one.
///
/// Plain-text containers pull in their numbered series (`1.txt`, `01.txt`,
/// ... `99.txt`, same extension as the base); encrypted containers are a
/// single blob.
pub fn load_script_dir(dir: &Path, key_table: &[u8; 256]) -> Result<ScriptSource> {
    let mut found: Option<(std::path::PathBuf, CipherMode, Encoding)> = None;
    for (name, mode, enc) in PROBE_ORDER {
        let p = dir.join(name);
        if p.exists() {
            found = Some((p, mode, enc));
            break;
        }
    }
    let Some((base_path, mode, encoding)) = found else {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no script container in {}", dir.display()),
        )));
    };
    log::info!("opening {}", base_path.display());

    let mut bytes = Vec::new();
    let mut label_heads = 0usize;

    if mode != CipherMode::Plain {
        let raw = fs::read(&base_path)?;
        label_heads += transform_file(&raw, mode, key_table, &mut bytes);
    } else {
        let ext = base_path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_else(|| ".txt".to_string());
        let mut found_segment = false;
        for i in 1..100 {
            for pat in [format!("{i}{ext}"), format!("{i:02}{ext}")] {
                let p = dir.join(&pat);
                if p.exists() {
                    let raw = fs::read(&p)?;
                    label_heads += transform_file(&raw, CipherMode::Plain, key_table, &mut bytes);
                    found_segment = true;
                }
            }
        }
        if !found_segment {
            let raw = fs::read(&base_path)?;
            label_heads += transform_file(&raw, CipherMode::Plain, key_table, &mut bytes);
        }
    }

    Ok(ScriptSource {
        bytes,
        encoding,
        label_heads,
    })
}

/// Screen mode, variable range and globals border from the first commented
/// line of the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptConfig {
    pub screen_w: u32,
    pub screen_h: u32,
    pub var_range: i32,
    pub globals_border: i32,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        ScriptConfig {
            screen_w: 640,
            screen_h: 480,
            var_range: 4096,
            globals_border: 200,
        }
    }
}

pub fn skip_ws(s: &[u8], mut i: usize) -> usize {
    while i < s.len() && (s[i] == b' ' || s[i] == b'\t') {
        i += 1;
    }
    i
}

fn read_number(s: &[u8], mut i: usize) -> (u32, usize) {
    i = skip_ws(s, i);
    let mut v: u32 = 0;
    while i < s.len() && s[i].is_ascii_digit() {
        v = v.wrapping_mul(10).wrapping_add((s[i] - b'0') as u32);
        i += 1;
    }
    (v, i)
}

/// Parse the config preamble: find the first `;` line, skip past its
/// newline, then read comma-separated settings. An unknown token ends the
/// scan silently; an unstructured preamble (no leading `$`) also stops at
/// the first item not followed by a comma.
pub fn parse_config(s: &[u8]) -> ScriptConfig {
    let mut cfg = ScriptConfig::default();
    let n = s.len();
    let mut i = 0;
    while i < n && s[i] != b';' {
        i += 1;
    }
    while i < n && s[i] != b'\n' {
        i += 1;
    }
    if i >= n {
        return cfg;
    }
    i += 1;
    i = skip_ws(s, i);
    let structured = i < n && s[i] == b'$';
    if structured {
        i += 1;
    }

    while i < n && s[i] != b'\n' {
        i = skip_ws(s, i);
        if s[i..].starts_with(b"mode") {
            i += 4;
            if s[i..].starts_with(b"800") {
                cfg.screen_w = 800;
                cfg.screen_h = 600;
                i += 3;
            } else if s[i..].starts_with(b"400") {
                cfg.screen_w = 400;
                cfg.screen_h = 300;
                i += 3;
            } else if s[i..].starts_with(b"320") {
                cfg.screen_w = 320;
                cfg.screen_h = 240;
                i += 3;
            } else if s[i..].starts_with(b"w720") {
                cfg.screen_w = 1280;
                cfg.screen_h = 720;
                i += 4;
            } else {
                break;
            }
        } else if i < n && (s[i] == b'g' || s[i] == b'G' || s[i..].starts_with(b"value")) {
            i += if s[i] == b'g' || s[i] == b'G' { 1 } else { 5 };
            let (v, j) = read_number(s, i);
            cfg.globals_border = v as i32;
            i = j;
        } else if i < n && (s[i] == b'v' || s[i] == b'V') {
            let (v, j) = read_number(s, i + 1);
            cfg.var_range = v as i32;
            i = j;
        } else if i < n && (s[i] == b's' || s[i] == b'S') {
            let (w, mut j) = read_number(s, i + 1);
            while j < n && (s[j] == b',' || s[j] == b' ' || s[j] == b'\t') {
                j += 1;
            }
            let (h, j2) = read_number(s, j);
            cfg.screen_w = w;
            cfg.screen_h = h;
            i = j2;
        } else if i < n && (s[i] == b'l' || s[i] == b'L') {
            let (_, j) = read_number(s, i + 1);
            i = j;
        } else if i >= n || s[i] != b',' {
            break;
        }
        i = skip_ws(s, i);
        if !structured && (i >= n || s[i] != b',') {
            break;
        }
        if i < n && s[i] == b',' {
            i += 1;
        }
    }
    cfg
}

/// A `*name` declaration and where execution resumes after jumping to it.
#[derive(Debug, Clone)]
pub struct Label {
    /// Lowercased, without the leading `*`.
    pub name: String,
    /// Offset of the `*` token.
    pub header_pos: usize,
    /// First non-whitespace offset past the label line's terminator.
    pub body_pos: usize,
    pub start_line: u32,
}

fn is_ident(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Read `*name` at `i` (the `*`), lowercased, leading `*` kept.
pub fn read_label_name_at(s: &[u8], i: usize) -> String {
    let n = s.len();
    let mut out = String::from("*");
    let mut j = skip_ws(s, i + 1);
    while j < n && is_ident(s[j]) {
        out.push(s[j].to_ascii_lowercase() as char);
        j += 1;
    }
    out
}

/// Offset just past the label identifier starting at the `*` at `i`.
pub fn after_label(s: &[u8], i: usize) -> usize {
    let n = s.len();
    let mut j = skip_ws(s, i + 1);
    while j < n && is_ident(s[j]) {
        j += 1;
    }
    j
}

/// Single forward scan over the whole source. Duplicate names are kept in
/// order; lookup resolves to the last declaration.
pub fn index_labels(s: &[u8]) -> Vec<Label> {
    let n = s.len();
    let mut labels = Vec::new();
    let mut i = 0usize;
    let mut line = 0u32;
    while i < n {
        i = skip_ws(s, i);
        if i < n && s[i] == b'*' {
            while i + 1 < n && s[i + 1] == b'*' {
                i += 1;
            }
            let name = read_label_name_at(s, i);
            let header_pos = i;
            let start_line = line;
            let mut j = after_label(s, i);
            if j < n && s[j] == b'\n' {
                j += 1;
                line += 1;
            }
            j = skip_ws(s, j);
            labels.push(Label {
                name: name[1..].to_string(),
                header_pos,
                body_pos: j,
                start_line,
            });
            i = j;
        } else {
            while i < n && s[i] != b'\n' {
                i += 1;
            }
            if i < n {
                i += 1;
                line += 1;
            }
        }
    }
    labels
}
