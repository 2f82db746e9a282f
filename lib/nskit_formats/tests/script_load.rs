//! Container loading end-to-end: encrypted blobs, plain series, config.

use std::fs;

use nskit_formats::lexer::{Lexer, TokenKind};
use nskit_formats::script::{load_script_dir, default_key_table, ROT_MAGIC};

#[test]
fn xor84_container_loads_and_tokenizes() {
    let dir = tempfile::tempdir().unwrap();
    let plain = b";mode800,g300,v1000\n*A\nhi\n";
    let enc: Vec<u8> = plain.iter().map(|b| b ^ 0x84).collect();
    fs::write(dir.path().join("nscript.dat"), enc).unwrap();

    let mut lx = Lexer::open(dir.path()).unwrap();
    assert_eq!(lx.mode(), (800, 600));
    assert_eq!(lx.var_range(), (1000, 300));

    let labels = lx.labels_all();
    assert_eq!(labels.len(), 1);
    assert_eq!(labels[0].name, "a");

    lx.jump_label("A").unwrap();
    let t = lx.next().unwrap();
    assert_eq!(t.text, "hi");
    assert_eq!(t.line, 2);
}

#[test]
fn rotating_magic_container_decrypts() {
    let dir = tempfile::tempdir().unwrap();
    let plain = b";v100\n*go\n";
    let enc: Vec<u8> = plain
        .iter()
        .enumerate()
        .map(|(i, b)| b ^ ROT_MAGIC[i % 5])
        .collect();
    fs::write(dir.path().join("nscr_sec.dat"), enc).unwrap();

    let src = load_script_dir(dir.path(), &default_key_table()).unwrap();
    assert!(src.bytes.starts_with(b";v100\n*go\n"));
    assert_eq!(src.label_heads, 1);
}

#[test]
fn key_table_container_applies_table_then_xor() {
    let dir = tempfile::tempdir().unwrap();
    // Invert the byte value, then the loader's XOR 0x84 must undo our
    // pre-applied 0x84.
    let mut table = [0u8; 256];
    for (i, v) in table.iter_mut().enumerate() {
        *v = !(i as u8);
    }
    let plain = b"*k\nok\n";
    let enc: Vec<u8> = plain.iter().map(|b| !(b ^ 0x84)).collect();
    fs::write(dir.path().join("nscript.___"), enc).unwrap();

    let src = load_script_dir(dir.path(), &table).unwrap();
    assert!(src.bytes.starts_with(b"*k\nok\n"));
}

#[test]
fn plain_series_concatenates_numbered_segments() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("0.txt"), b"base only\n").unwrap();
    fs::write(dir.path().join("1.txt"), b"*one\n").unwrap();
    fs::write(dir.path().join("02.txt"), b"*two\n").unwrap();

    let src = load_script_dir(dir.path(), &default_key_table()).unwrap();
    // Numbered segments replace the discovered base file's content.
    assert_eq!(src.bytes, b"*one\n\n*two\n\n");
    assert_eq!(src.label_heads, 2);
}

#[test]
fn base_file_loads_when_no_numbered_segments_exist() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("0.txt"), b"*solo\nline\n").unwrap();

    let src = load_script_dir(dir.path(), &default_key_table()).unwrap();
    assert_eq!(src.bytes, b"*solo\nline\n\n");
}

#[test]
fn utf8_container_sets_encoding() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("0.utf"), "*top\nこんにちは@\n".as_bytes()).unwrap();

    let mut lx = Lexer::open(dir.path()).unwrap();
    lx.jump_label("top").unwrap();
    let t = lx.next().unwrap();
    assert_eq!(t.kind, TokenKind::Text);
    assert_eq!(t.text, "こんにちは@");
    assert!(t.wait_at.is_some());
}

#[test]
fn missing_container_reports_io_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(load_script_dir(dir.path(), &default_key_table()).is_err());
}

#[test]
fn crlf_scripts_normalize_before_indexing() {
    let dir = tempfile::tempdir().unwrap();
    let plain = b";cfg\r\n*top\r\nline one\r\n";
    let enc: Vec<u8> = plain.iter().map(|b| b ^ 0x84).collect();
    fs::write(dir.path().join("nscript.dat"), enc).unwrap();

    let mut lx = Lexer::open(dir.path()).unwrap();
    let label = lx.jump_label("top").unwrap();
    assert_eq!(label.start_line, 1);
    let t = lx.next().unwrap();
    assert_eq!(t.text, "line");
}
