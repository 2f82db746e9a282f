//! The context-sensitive tokenizer and its expression evaluator.
//!
//! One `Lexer` owns the loaded source bytes and a mutable cursor; every
//! mutation goes through its operations. The cursor only moves backward via
//! `seek`/`jump_label`; `peek` is a save/restore of `(pos, line, end)`.

use std::collections::HashMap;
use std::path::Path;

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::script::{self, Encoding, Label, ScriptSource};

bitflags! {
    /// Side-channel flags describing how the previous field terminated;
    /// command argument readers consult them.
    pub struct EndFlags: u32 {
        const COMMA = 1 << 0;
        /// Reserved for the 1-byte-terminator signal; never raised here.
        const ONE_BYTE = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Eof,
    Newline,
    Text,
    Cmd,
    Label,
    Mark,
    Comment,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub pos: usize,
    pub line: u32,
    pub end: EndFlags,
    /// Byte offset just past the first `@` or `\` wait in a TEXT token.
    pub wait_at: Option<usize>,
    /// Ponscripter text color (0 = default, 1-9 palette) when active.
    pub color: Option<u8>,
}

/// Which `lang*`-gated lines are commented out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Japanese,
    English,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Plus,
    Minus,
    Mult,
    Div,
    Mod,
}

impl Op {
    fn is_high(self) -> bool {
        matches!(self, Op::Mult | Op::Div | Op::Mod)
    }
}

#[derive(Debug, Clone, Default)]
struct Var {
    num: i32,
    str_val: Option<String>,
    limit: Option<(i32, i32)>,
}

/// A `dim`-declared array; dimensions are stored one larger than the
/// declared maximum index.
#[derive(Debug, Clone)]
struct ArrayVar {
    no: i32,
    dims: Vec<i32>,
    data: Vec<i32>,
}

/// A parsed `?no[e][e]...` reference before resolution.
struct ArrayRef {
    no: i32,
    dims: Vec<i32>,
}

fn is_id0(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_id(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Token text accumulator: raw source bytes are decoded lazily, in segments,
/// so expanded variable values can be spliced in between them.
struct TextAcc {
    out: String,
    raw: Vec<u8>,
}

impl TextAcc {
    fn new() -> Self {
        TextAcc {
            out: String::new(),
            raw: Vec::new(),
        }
    }

    fn push_byte(&mut self, b: u8) {
        self.raw.push(b);
    }

    fn push_str(&mut self, s: &str, enc: Encoding) {
        self.flush(enc);
        self.out.push_str(s);
    }

    fn is_empty(&self) -> bool {
        self.out.is_empty() && self.raw.is_empty()
    }

    fn flush(&mut self, enc: Encoding) {
        if !self.raw.is_empty() {
            self.out.push_str(&enc.decode(&self.raw));
            self.raw.clear();
        }
    }

    fn finish(mut self, enc: Encoding) -> String {
        self.flush(enc);
        self.out
    }
}

pub struct Lexer {
    /// Expand `%n`/`$n`/`?n[..]` inside TEXT tokens.
    pub expand_in_text: bool,
    encoding: Encoding,
    /// UTF-8 inline marker byte toggling literal passthrough; 0 = disabled.
    text_marker: u8,
    buf: Vec<u8>,
    i: usize,
    line: u32,
    end: EndFlags,
    labels: Vec<Label>,
    label_heads: usize,
    vars: Vec<Var>,
    ext: HashMap<i32, Var>,
    var_range: i32,
    globals_border: i32,
    screen_w: u32,
    screen_h: u32,
    language: Language,
    clickstr: Vec<u8>,
    wait_at: Option<usize>,
    arrays: Vec<ArrayVar>,
    num_alias: HashMap<String, i32>,
    ponscripter: bool,
    cur_color: Option<u8>,
    /// An inline control ended the previous TEXT mid-line; the next token
    /// continues as TEXT regardless of its lead byte.
    resume_text: bool,
}

impl Lexer {
    /// Load the script container found in `dir` with the identity key table.
    pub fn open(dir: &Path) -> Result<Lexer> {
        Self::open_with(dir, script::default_key_table())
    }

    /// Load with an explicit `nscript.___` key table.
    pub fn open_with(dir: &Path, key_table: [u8; 256]) -> Result<Lexer> {
        let src = script::load_script_dir(dir, &key_table)?;
        Self::from_source(src)
    }

    /// Build a lexer over an already-loaded source: parse the config
    /// preamble, size the variable store, detect Ponscripter markup, index
    /// labels, and park the cursor at 0.
    pub fn from_source(src: ScriptSource) -> Result<Lexer> {
        let cfg = script::parse_config(&src.bytes);
        let ponscripter = detect_ponscripter(&src.bytes);
        let labels = script::index_labels(&src.bytes);
        let dense = cfg.var_range.max(0) as usize;

        let mut lx = Lexer {
            ponscripter,
            expand_in_text: false,
            encoding: src.encoding,
            text_marker: 0,
            buf: src.bytes,
            i: 0,
            line: 0,
            end: EndFlags::empty(),
            labels,
            label_heads: src.label_heads,
            vars: vec![Var::default(); dense],
            ext: HashMap::new(),
            var_range: cfg.var_range,
            globals_border: cfg.globals_border,
            screen_w: cfg.screen_w,
            screen_h: cfg.screen_h,
            language: Language::English,
            clickstr: Vec::new(),
            wait_at: None,
            arrays: Vec::new(),
            num_alias: HashMap::new(),
            cur_color: None,
            resume_text: false,
        };
        lx.seek(0);
        Ok(lx)
    }

    pub fn with_language(mut self, language: Language) -> Self {
        self.language = language;
        self
    }

    // ----- state info -----

    pub fn mode(&self) -> (u32, u32) {
        (self.screen_w, self.screen_h)
    }

    /// `(var_range, globals_border)`. Slots at or past the border are the
    /// persistent ones; persistence itself lives with the caller.
    pub fn var_range(&self) -> (i32, i32) {
        (self.var_range, self.globals_border)
    }

    pub fn labels_all(&self) -> &[Label] {
        &self.labels
    }

    /// `*` heads counted at line starts during the load pass.
    pub fn label_heads(&self) -> usize {
        self.label_heads
    }

    pub fn pos(&self) -> usize {
        self.i
    }

    pub fn is_ponscripter(&self) -> bool {
        self.ponscripter
    }

    /// Cursor triple for gosub-style save/restore.
    pub fn save_state(&self) -> (usize, u32, EndFlags) {
        (self.i, self.line, self.end)
    }

    pub fn restore_state(&mut self, state: (usize, u32, EndFlags)) {
        self.i = state.0;
        self.line = state.1;
        self.end = state.2;
    }

    /// 1-character click string whose appearance after a double-byte
    /// character marks a wait point.
    pub fn set_clickstr(&mut self, s: &str) {
        self.clickstr = self.encoding.encode(s);
    }

    /// Marker byte that toggles literal runs in UTF-8 sources, suspending
    /// `%`/`$` expansion and wait detection between its occurrences.
    pub fn set_text_marker(&mut self, marker: u8) {
        self.text_marker = marker;
    }

    // ----- cursor movement -----

    pub fn seek(&mut self, pos: usize) {
        self.i = pos;
        self.line = self.line_at(pos);
        self.end = EndFlags::empty();
        self.resume_text = false;
    }

    /// Jump to a label's body position. Lookup is case-insensitive and
    /// resolves to the *last* declaration of the name.
    pub fn jump_label(&mut self, name: &str) -> Result<Label> {
        let wanted = name.to_lowercase();
        let found = self
            .labels
            .iter()
            .rev()
            .find(|l| l.name == wanted)
            .cloned()
            .ok_or(Error::UnknownLabel(wanted))?;
        self.seek(found.body_pos);
        Ok(found)
    }

    pub fn next(&mut self) -> Result<Token> {
        self.next_token()
    }

    /// Look at the next token without consuming it.
    pub fn peek(&mut self) -> Result<Token> {
        let saved = self.save_state();
        let resume = self.resume_text;
        let t = self.next_token();
        self.restore_state(saved);
        self.resume_text = resume;
        t
    }

    fn line_at(&self, pos: usize) -> u32 {
        let end = pos.min(self.buf.len());
        self.buf[..end].iter().filter(|&&b| b == b'\n').count() as u32
    }

    // ----- variables -----

    fn var_mut(&mut self, no: i32) -> &mut Var {
        if no >= 0 && no < self.var_range {
            &mut self.vars[no as usize]
        } else {
            self.ext.entry(no).or_default()
        }
    }

    pub fn set_num(&mut self, no: i32, val: i32) {
        let v = self.var_mut(no);
        let val = match v.limit {
            Some((lo, hi)) => val.max(lo).min(hi),
            None => val,
        };
        v.num = val;
    }

    pub fn get_num(&mut self, no: i32) -> i32 {
        self.var_mut(no).num
    }

    /// Clamp range applied by subsequent `set_num` calls on this slot.
    pub fn set_limit(&mut self, no: i32, lo: i32, hi: i32) {
        self.var_mut(no).limit = Some((lo, hi));
    }

    pub fn set_str(&mut self, no: i32, s: &str) {
        self.var_mut(no).str_val = Some(s.to_string());
    }

    pub fn get_str(&mut self, no: i32) -> String {
        self.var_mut(no).str_val.clone().unwrap_or_default()
    }

    pub fn add_numalias(&mut self, name: &str, val: i32) {
        self.num_alias.insert(name.to_lowercase(), val);
    }

    // ----- readers used by command consumers -----

    /// Read a lowercased identifier at the cursor, if any.
    pub fn read_ident(&mut self) -> Option<String> {
        let i = script::skip_ws(&self.buf, self.i);
        if i < self.buf.len() && is_id0(self.buf[i]) {
            let mut j = i;
            while j < self.buf.len() && is_id(self.buf[j]) {
                j += 1;
            }
            let name: String = self.buf[i..j]
                .iter()
                .map(|b| b.to_ascii_lowercase() as char)
                .collect();
            self.i = self.eat_comma(j);
            Some(name)
        } else {
            None
        }
    }

    /// Read `*name` at the cursor, lowercased with the leading `*`.
    pub fn read_label_name(&mut self) -> Option<String> {
        let s = &self.buf;
        let n = s.len();
        let mut i = script::skip_ws(s, self.i);
        let mut out = String::new();
        if i < n && s[i] == b'*' {
            out.push('*');
            i = script::skip_ws(s, i + 1);
            while i < n && is_id(s[i]) {
                out.push(s[i].to_ascii_lowercase() as char);
                i += 1;
            }
        }
        self.i = self.eat_comma(i);
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    /// Evaluate an integer expression at the cursor.
    pub fn read_int(&mut self) -> Result<i32> {
        let (val, j) = self.expr(self.i)?;
        self.i = self.eat_comma(j);
        Ok(val)
    }

    /// Read a string expression at the cursor; `+` concatenates fragments.
    pub fn read_str(&mut self) -> Result<String> {
        let mut parts = String::new();
        let mut i = self.i;
        loop {
            let (frag, j) = self.str_at(i)?;
            parts.push_str(&frag);
            let j = self.eat_comma(j);
            if j >= self.buf.len() || self.buf[j] != b'+' {
                i = j;
                break;
            }
            i = j + 1;
        }
        self.i = i;
        Ok(parts)
    }

    /// Handle a `dim` declaration at the cursor: allocate the array with
    /// each dimension one larger than the declared maximum index.
    pub fn declare_dim(&mut self) -> Result<()> {
        let (aref, j) = self.array_at(self.i)?;
        let dims: Vec<i32> = aref.dims.iter().map(|d| d + 1).collect();
        let size = dims
            .iter()
            .map(|&d| d.max(0) as usize)
            .product::<usize>();
        self.arrays.push(ArrayVar {
            no: aref.no,
            dims,
            data: vec![0; size],
        });
        self.i = j;
        Ok(())
    }

    /// Read-only prepass over the whole source registering `numalias` and
    /// `dim` declarations; the cursor is restored afterwards.
    pub fn prepass(&mut self) -> Result<()> {
        let saved = self.save_state();
        self.seek(0);
        loop {
            let t = self.next_token()?;
            match t.kind {
                TokenKind::Eof => break,
                TokenKind::Cmd => match t.text.as_str() {
                    "numalias" => {
                        let name = self.read_ident();
                        let val = self.read_int()?;
                        if let Some(name) = name {
                            self.add_numalias(&name, val);
                        }
                    }
                    "dim" => self.declare_dim()?,
                    _ => {}
                },
                _ => {}
            }
        }
        self.restore_state(saved);
        Ok(())
    }

    // ----- internals -----

    fn parse_err(&self, msg: &'static str) -> Error {
        Error::Parse {
            msg,
            pos: self.i,
            line: self.line_at(self.i),
        }
    }

    /// Eat optional whitespace, one optional comma (raising END_COMMA), and
    /// trailing whitespace.
    fn eat_comma(&mut self, mut i: usize) -> usize {
        i = script::skip_ws(&self.buf, i);
        if i < self.buf.len() && self.buf[i] == b',' {
            self.end |= EndFlags::COMMA;
            i += 1;
            i = script::skip_ws(&self.buf, i);
        }
        i
    }

    /// Raw integer or numeric alias. An unknown identifier yields 0 without
    /// consuming it so the outer parser can re-tokenize.
    fn int_raw(&self, start: usize) -> (i32, usize) {
        let s = &self.buf;
        let n = s.len();
        let mut i = script::skip_ws(s, start);
        let mut neg = false;
        if i < n && (s[i] == b'+' || s[i] == b'-') {
            neg = s[i] == b'-';
            i += 1;
        }
        if i < n && is_id0(s[i]) {
            let mut j = i;
            while j < n && is_id(s[j]) {
                j += 1;
            }
            let name: String = s[i..j].iter().map(|b| b.to_ascii_lowercase() as char).collect();
            if let Some(&v) = self.num_alias.get(&name) {
                return (if neg { -v } else { v }, j);
            }
            return (0, i - usize::from(neg));
        }
        let mut j = i;
        let mut ok = false;
        let mut v: i32 = 0;
        while j < n && s[j].is_ascii_digit() {
            ok = true;
            v = v.wrapping_mul(10).wrapping_add((s[j] - b'0') as i32);
            j += 1;
        }
        if !ok {
            return (0, i - usize::from(neg));
        }
        (if neg { v.wrapping_neg() } else { v }, j)
    }

    /// Integer value at `start`: `%n` variable, `?n[..]` array element, or
    /// a raw number/alias.
    fn int_at(&mut self, start: usize) -> Result<(i32, usize)> {
        let i = script::skip_ws(&self.buf, start);
        if i < self.buf.len() && self.buf[i] == b'%' {
            let (no, j) = self.int_raw(i + 1);
            return Ok((self.var_mut(no).num, j));
        }
        if i < self.buf.len() && self.buf[i] == b'?' {
            let (aref, j) = self.array_at(i)?;
            let v = self.array_value(&aref)?;
            return Ok((v, j));
        }
        Ok(self.int_raw(i))
    }

    fn read_operand(&mut self, start: usize) -> Result<(i32, usize)> {
        let s_len = self.buf.len();
        let mut j = script::skip_ws(&self.buf, start);
        let mut neg = false;
        if j < s_len && self.buf[j] == b'-' {
            neg = true;
            j = script::skip_ws(&self.buf, j + 1);
        }
        if j < s_len && self.buf[j] == b'(' {
            let (v, k) = self.expr(j + 1)?;
            let k = script::skip_ws(&self.buf, k);
            if k >= s_len || self.buf[k] != b')' {
                return Err(self.parse_err("missing )"));
            }
            return Ok((if neg { v.wrapping_neg() } else { v }, k + 1));
        }
        let (v, k) = self.int_at(j)?;
        Ok((if neg { v.wrapping_neg() } else { v }, k))
    }

    fn next_op(&self, start: usize) -> (Option<Op>, usize) {
        let s = &self.buf;
        let i = script::skip_ws(s, start);
        if i >= s.len() {
            return (None, i);
        }
        match s[i] {
            b'+' => (Some(Op::Plus), i + 1),
            b'-' => (Some(Op::Minus), i + 1),
            b'*' => (Some(Op::Mult), i + 1),
            b'/' => (Some(Op::Div), i + 1),
            _ if s[i..].starts_with(b"mod") => (Some(Op::Mod), i + 3),
            _ => (None, i),
        }
    }

    fn calc(a: i32, op: Op, b: i32) -> i32 {
        match op {
            Op::Plus => a.wrapping_add(b),
            Op::Minus => a.wrapping_sub(b),
            Op::Mult => a.wrapping_mul(b),
            Op::Div => {
                if b != 0 {
                    a.wrapping_div(b)
                } else {
                    0
                }
            }
            Op::Mod => {
                if b != 0 {
                    // Floored remainder: sign follows the right operand.
                    a.wrapping_rem(b).wrapping_add(b).wrapping_rem(b)
                } else {
                    0
                }
            }
        }
    }

    /// Left-to-right fold holding one pending pair `(a op b)`; a following
    /// higher-precedence operator folds into `b` first.
    fn expr(&mut self, start: usize) -> Result<(i32, usize)> {
        let (mut a, i) = self.read_operand(start)?;
        let (op, i) = self.next_op(i);
        let Some(mut op) = op else {
            return Ok((a, i));
        };
        let (mut b, mut i) = self.read_operand(i)?;
        loop {
            let (op2, i2) = self.next_op(i);
            let Some(op2) = op2 else {
                break;
            };
            let (c, i3) = self.read_operand(i2)?;
            i = i3;
            if !op.is_high() && op2.is_high() {
                b = Self::calc(b, op2, c);
            } else {
                a = Self::calc(a, op, b);
                op = op2;
                b = c;
            }
        }
        Ok((Self::calc(a, op, b), i))
    }

    /// One string fragment: `(...)`, `$n`, `"..."`, `#RRGGBB`, or `*label`.
    fn str_at(&mut self, start: usize) -> Result<(String, usize)> {
        let n = self.buf.len();
        let i = script::skip_ws(&self.buf, start);
        if i >= n {
            return Ok((String::new(), i));
        }
        match self.buf[i] {
            b'(' => {
                let (frag, j) = self.str_at(i + 1)?;
                let j = script::skip_ws(&self.buf, j);
                if j >= n || self.buf[j] != b')' {
                    return Err(self.parse_err("parse_str: missing )"));
                }
                Ok((frag, j + 1))
            }
            b'$' => {
                let (no, j) = self.int_raw(i + 1);
                Ok((self.get_str(no), j))
            }
            b'"' => {
                let mut j = i + 1;
                let mut raw = Vec::new();
                while j < n && self.buf[j] != b'"' && self.buf[j] != b'\n' {
                    raw.push(self.buf[j]);
                    j += 1;
                }
                if j < n && self.buf[j] == b'"' {
                    j += 1;
                }
                Ok((self.encoding.decode(&raw), j))
            }
            b'#' => {
                let end = (i + 7).min(n);
                Ok((self.encoding.decode(&self.buf[i..end]), i + 7))
            }
            b'*' => {
                let mut j = script::skip_ws(&self.buf, i + 1);
                let mut out = String::from("*");
                while j < n && is_id(self.buf[j]) {
                    out.push(self.buf[j].to_ascii_lowercase() as char);
                    j += 1;
                }
                Ok((out, j))
            }
            _ => Ok((String::new(), i)),
        }
    }

    // ----- arrays -----

    fn array_at(&mut self, start: usize) -> Result<(ArrayRef, usize)> {
        let n = self.buf.len();
        let mut i = script::skip_ws(&self.buf, start);
        debug_assert!(i < n && self.buf[i] == b'?');
        i += 1;
        let (no, mut i) = self.int_raw(i);
        let mut dims = Vec::new();
        while i < n && self.buf[i] == b'[' {
            let (val, j) = self.expr(i + 1)?;
            dims.push(val);
            let j = script::skip_ws(&self.buf, j);
            if j >= n || self.buf[j] != b']' {
                return Err(self.parse_err("parse_array: missing ]"));
            }
            i = j + 1;
        }
        Ok((ArrayRef { no, dims }, i))
    }

    fn array_value(&self, aref: &ArrayRef) -> Result<i32> {
        let node = self
            .arrays
            .iter()
            .find(|a| a.no == aref.no)
            .ok_or_else(|| self.parse_err("array not declared"))?;
        let idx = self.array_index(node, aref)?;
        Ok(node.data[idx])
    }

    /// Row-major flat index; any out-of-bounds subscript is fatal.
    fn array_index(&self, decl: &ArrayVar, req: &ArrayRef) -> Result<usize> {
        let mut flat: usize = 0;
        for (k, &d) in decl.dims.iter().enumerate() {
            let r = req.dims.get(k).copied().unwrap_or(0);
            if r < 0 || d <= r {
                return Err(self.parse_err("dim overflow"));
            }
            flat = flat * d as usize + r as usize;
        }
        Ok(flat)
    }

    // ----- tokenization -----

    fn next_token(&mut self) -> Result<Token> {
        let n = self.buf.len();
        self.end = EndFlags::empty();
        self.wait_at = None;
        if self.i >= n {
            return Ok(self.token(TokenKind::Eof, String::new(), self.i, self.line));
        }
        let i = script::skip_ws(&self.buf, self.i);
        if i >= n {
            self.i = i;
            return Ok(self.token(TokenKind::Eof, String::new(), i, self.line));
        }
        if self.resume_text {
            self.resume_text = false;
            return self.text_token(i);
        }
        let ch = self.buf[i];

        // Comment, or a language-gated line treated as one.
        let gated = (self.buf[i..].starts_with(b"langjp") && self.language == Language::Japanese)
            || (self.buf[i..].starts_with(b"langen") && self.language == Language::English);
        if ch == b';' || gated {
            let start = i;
            let start_line = self.line;
            let mut j = i;
            while j < n {
                let c = self.buf[j];
                j += 1;
                if c == b'\n' {
                    self.line += 1;
                    break;
                }
            }
            self.i = j;
            let text = self.encoding.decode(&self.buf[start..j]);
            return Ok(self.token(TokenKind::Comment, text, start, start_line));
        }

        if ch == b'*' {
            let name = script::read_label_name_at(&self.buf, i);
            let j = script::after_label(&self.buf, i);
            self.i = self.eat_comma(j);
            return Ok(self.token(TokenKind::Label, name, i, self.line));
        }

        if ch == b'~' || ch == b':' {
            self.i = i + 1;
            return Ok(self.token(TokenKind::Mark, (ch as char).to_string(), i, self.line));
        }

        if ch == b'\n' {
            self.i = i + 1;
            self.line += 1;
            return Ok(self.token(TokenKind::Newline, "\n".to_string(), i, self.line - 1));
        }

        // Commands are plain ASCII identifiers.
        if is_id0(ch) {
            let start = i;
            let mut j = i;
            let mut text = String::new();
            while j < n && is_id(self.buf[j]) {
                text.push(self.buf[j].to_ascii_lowercase() as char);
                j += 1;
            }
            self.i = self.eat_comma(j);
            return Ok(self.token(TokenKind::Cmd, text, start, self.line));
        }

        self.text_token(i)
    }

    fn token(&self, kind: TokenKind, text: String, pos: usize, line: u32) -> Token {
        Token {
            kind,
            text,
            pos,
            line,
            end: self.end,
            wait_at: self.wait_at,
            color: None,
        }
    }

    fn text_token(&mut self, start: usize) -> Result<Token> {
        let n = self.buf.len();
        let enc = self.encoding;
        let mut i = start;
        let mut acc = TextAcc::new();
        let mut tok_color = self.cur_color;
        let mut literal_run = false;

        while i < n {
            let c = self.buf[i];
            let nb = enc.byte_len(c);

            if nb >= 2 {
                acc.push_byte(c);
                i += 1;
                if i < n {
                    acc.push_byte(self.buf[i]);
                    i += 1;
                }
                self.maybe_clickstr_wait(i);
                continue;
            }

            // Ponscripter inline controls apply in both text modes.
            if self.ponscripter && c == b'^' {
                if self.buf[i..].starts_with(b"^@^") {
                    acc.push_byte(b'@');
                    i += 3;
                    if self.wait_at.is_none() {
                        self.wait_at = Some(i);
                    }
                    continue;
                }
                if i + 5 <= n
                    && self.buf[i + 1] == b'~'
                    && (self.buf[i + 2] | 0x20) == b'c'
                    && self.buf[i + 3].is_ascii_digit()
                    && self.buf[i + 4] == b'~'
                {
                    let col = self.buf[i + 3] - b'0';
                    self.cur_color = Some(col);
                    i += 5;
                    if acc.is_empty() {
                        tok_color = Some(col);
                        continue;
                    }
                    // A color change after visible text ends the token; the
                    // new color carries into the ones that follow.
                    self.resume_text = true;
                    break;
                }
                acc.push_byte(b'^');
                i += 1;
                continue;
            }

            if !self.expand_in_text {
                if c == b';' || c == b'\n' || c == 0 {
                    break;
                }
                acc.push_byte(c);
                i += 1;
                if self.wait_at.is_none() && (c == b'@' || c == b'\\') {
                    self.wait_at = Some(i);
                }
                continue;
            }

            // Expand mode: splice variable and array values into the text.
            if !literal_run && (c == b'%' || c == b'?') {
                let (v, j) = self.int_at(i)?;
                acc.push_str(&v.to_string(), enc);
                i = script::skip_ws(&self.buf, j);
                continue;
            }
            if !literal_run && c == b'$' {
                let (no, j) = self.int_raw(i + 1);
                let v = self.get_str(no);
                acc.push_str(&v, enc);
                i = script::skip_ws(&self.buf, j);
                continue;
            }

            if enc == Encoding::Utf8 && self.text_marker != 0 && c == self.text_marker {
                literal_run = !literal_run;
                i += 1;
                continue;
            }
            if c == b'\n' || c == 0 {
                break;
            }
            acc.push_byte(c);
            i += 1;
            if self.wait_at.is_none() && !literal_run && (c == b'@' || c == b'\\') {
                self.wait_at = Some(i);
            }
            if i < n && self.buf[i] == b';' {
                break;
            }
        }

        self.i = self.eat_comma(i);
        let mut t = self.token(TokenKind::Text, acc.finish(enc), i, self.line);
        t.color = tok_color;
        Ok(t)
    }

    fn maybe_clickstr_wait(&mut self, i: usize) {
        if self.wait_at.is_some() || self.clickstr.is_empty() {
            return;
        }
        // The character just consumed is the 2 bytes before `i`.
        if self.clickstr.len() >= 2 && i >= 2 && self.buf[i - 2..i] == self.clickstr[..2] {
            self.wait_at = Some(i);
        } else if self.clickstr.len() == 1 && i >= 1 && self.buf[i - 1] == self.clickstr[0] {
            self.wait_at = Some(i);
        }
    }
}

fn detect_ponscripter(bytes: &[u8]) -> bool {
    bytes
        .windows(3)
        .any(|w| w == b"^@^" || (w[0] == b'^' && w[1] == b'~' && (w[2] | 0x20) == b'c'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{Encoding, ScriptSource};

    fn lexer_over(src: &[u8]) -> Lexer {
        Lexer::from_source(ScriptSource::from_bytes(src, Encoding::Cp932)).unwrap()
    }

    fn kinds(lx: &mut Lexer, count: usize) -> Vec<TokenKind> {
        (0..count).map(|_| lx.next().unwrap().kind).collect()
    }

    #[test]
    fn expression_precedence() {
        let mut lx = lexer_over(b"2+3*4\n(2+3)*4\n10 mod 3\n10/0\n7 mod 0\n2-3-4\n");
        assert_eq!(lx.read_int().unwrap(), 14);
        lx.next().unwrap(); // newline
        assert_eq!(lx.read_int().unwrap(), 20);
        lx.next().unwrap();
        assert_eq!(lx.read_int().unwrap(), 1);
        lx.next().unwrap();
        assert_eq!(lx.read_int().unwrap(), 0);
        lx.next().unwrap();
        assert_eq!(lx.read_int().unwrap(), 0);
        lx.next().unwrap();
        assert_eq!(lx.read_int().unwrap(), -5);
    }

    #[test]
    fn unary_minus_binds_tightest() {
        let mut lx = lexer_over(b"-2+5\n2*-3\n-(1+2)\n");
        assert_eq!(lx.read_int().unwrap(), 3);
        lx.next().unwrap();
        assert_eq!(lx.read_int().unwrap(), -6);
        lx.next().unwrap();
        assert_eq!(lx.read_int().unwrap(), -3);
    }

    #[test]
    fn unknown_identifier_yields_zero_without_consuming() {
        let mut lx = lexer_over(b"bogus\n");
        let before = lx.pos();
        assert_eq!(lx.read_int().unwrap(), 0);
        assert_eq!(lx.pos(), before);
    }

    #[test]
    fn numalias_resolves_in_expressions() {
        let mut lx = lexer_over(b"limit*2\n");
        lx.add_numalias("LIMIT", 21);
        assert_eq!(lx.read_int().unwrap(), 42);
    }

    #[test]
    fn variables_and_clamp() {
        let mut lx = lexer_over(b"%3+1\n");
        lx.set_num(3, 9);
        assert_eq!(lx.read_int().unwrap(), 10);
        lx.set_limit(5, 0, 100);
        lx.set_num(5, 400);
        assert_eq!(lx.get_num(5), 100);
        lx.set_num(5, -7);
        assert_eq!(lx.get_num(5), 0);
        // Out-of-range slots land in the sparse store.
        lx.set_num(100_000, 77);
        assert_eq!(lx.get_num(100_000), 77);
    }

    #[test]
    fn arrays_declare_and_read() {
        let mut lx = lexer_over(b"dim ?0[2][3]\n?0[1][2]+1\n");
        let t = lx.next().unwrap();
        assert_eq!(t.kind, TokenKind::Cmd);
        assert_eq!(t.text, "dim");
        lx.declare_dim().unwrap();
        lx.next().unwrap(); // newline
        // dims are declared max + 1 = [3, 4]; flat index of [1][2] is 6.
        lx.arrays[0].data[6] = 41;
        assert_eq!(lx.read_int().unwrap(), 42);
    }

    #[test]
    fn array_out_of_bounds_is_fatal() {
        let mut lx = lexer_over(b"dim ?1[2]\n?1[5]\n");
        lx.next().unwrap();
        lx.declare_dim().unwrap();
        lx.next().unwrap();
        match lx.read_int() {
            Err(Error::Parse { msg, .. }) => assert_eq!(msg, "dim overflow"),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn token_stream_kinds() {
        let mut lx = lexer_over(b";c\n*top\ncmdname arg\n!hello\n~\n");
        let t = lx.next().unwrap();
        assert_eq!(t.kind, TokenKind::Comment);
        let t = lx.next().unwrap();
        assert_eq!(t.kind, TokenKind::Label);
        assert_eq!(t.text, "*top");
        let t = lx.next().unwrap();
        assert_eq!(t.kind, TokenKind::Newline);
        let t = lx.next().unwrap();
        assert_eq!(t.kind, TokenKind::Cmd);
        assert_eq!(t.text, "cmdname");
        let t = lx.next().unwrap();
        assert_eq!(t.kind, TokenKind::Cmd);
        assert_eq!(t.text, "arg");
        assert_eq!(
            kinds(&mut lx, 4),
            vec![
                TokenKind::Newline,
                TokenKind::Text,
                TokenKind::Newline,
                TokenKind::Mark
            ]
        );
    }

    #[test]
    fn peek_is_idempotent() {
        let mut lx = lexer_over(b"*top\nhello\n");
        let p = lx.peek().unwrap();
        let t = lx.next().unwrap();
        assert_eq!(p.kind, t.kind);
        assert_eq!(p.text, t.text);
        assert_eq!(p.pos, t.pos);
        assert_eq!(p.line, t.line);
    }

    #[test]
    fn cursor_is_monotonic_without_seek() {
        let mut lx = lexer_over(b"*a\ncmd 1,2\ntext line\n;c\n");
        let mut last = 0;
        loop {
            let t = lx.next().unwrap();
            assert!(lx.pos() >= last);
            last = lx.pos();
            if t.kind == TokenKind::Eof {
                break;
            }
        }
    }

    #[test]
    fn comma_sets_end_flag() {
        let mut lx = lexer_over(b"cmd arg1,arg2\n");
        lx.next().unwrap();
        let t = lx.next().unwrap();
        assert_eq!(t.text, "arg1");
        assert!(t.end.contains(EndFlags::COMMA));
        let t = lx.next().unwrap();
        assert_eq!(t.text, "arg2");
        assert!(!t.end.contains(EndFlags::COMMA));
    }

    #[test]
    fn text_records_wait_position() {
        // Dialogue led by a CP932 opening bracket so it tokenizes as TEXT.
        let mut lx = lexer_over(b"\x81\x75hello@world\n");
        let t = lx.next().unwrap();
        assert_eq!(t.kind, TokenKind::Text);
        assert_eq!(t.text, "\u{300C}hello@world");
        // wait_at is the offset just past the '@'.
        assert_eq!(t.wait_at, Some(8));
    }

    #[test]
    fn text_stops_at_comment() {
        let mut lx = lexer_over(b"\x81\x75hi;note\n");
        let t = lx.next().unwrap();
        assert_eq!(t.kind, TokenKind::Text);
        assert_eq!(t.text, "\u{300C}hi");
        let t = lx.next().unwrap();
        assert_eq!(t.kind, TokenKind::Comment);
    }

    #[test]
    fn expand_mode_splices_variables() {
        let mut lx = lexer_over(b"\x81\x75%3 $2!\n");
        lx.expand_in_text = true;
        lx.set_num(3, 7);
        lx.set_str(2, "seven");
        let t = lx.next().unwrap();
        assert_eq!(t.kind, TokenKind::Text);
        // 0x8175 is CP932 for the opening corner bracket.
        assert_eq!(t.text, "「7seven!");
    }

    #[test]
    fn text_marker_suspends_expansion() {
        let mut lx =
            Lexer::from_source(ScriptSource::from_bytes(b"!x|%1|%1\n", Encoding::Utf8)).unwrap();
        lx.expand_in_text = true;
        lx.set_text_marker(b'|');
        lx.set_num(1, 5);
        let t = lx.next().unwrap();
        // Between the markers '%1' is literal; after them it expands.
        assert_eq!(t.text, "!x%15");
    }

    #[test]
    fn language_gated_line_is_comment() {
        let mut lx = lexer_over(b"langen english here\nlangjp nihongo\n");
        let t = lx.next().unwrap();
        assert_eq!(t.kind, TokenKind::Comment);
        assert_eq!(t.text, "langen english here\n");
        let t = lx.next().unwrap();
        assert_eq!(t.kind, TokenKind::Cmd);
        assert_eq!(t.text, "langjp");
    }

    #[test]
    fn jump_label_resolves_last_declaration() {
        let mut lx = lexer_over(b"*a\nfirst\n*A\nsecond\n");
        let label = lx.jump_label("A").unwrap();
        assert_eq!(label.name, "a");
        let t = lx.next().unwrap();
        assert_eq!(t.kind, TokenKind::Cmd);
        assert_eq!(t.text, "second");
    }

    #[test]
    fn jump_to_unknown_label_fails() {
        let mut lx = lexer_over(b"*a\n");
        match lx.jump_label("nowhere") {
            Err(Error::UnknownLabel(name)) => assert_eq!(name, "nowhere"),
            other => panic!("expected UnknownLabel, got {other:?}"),
        }
    }

    #[test]
    fn ponscripter_color_and_wait() {
        let mut lx = lexer_over(b"^~c3~red^@^^~c0~plain\n");
        assert!(lx.is_ponscripter());
        let t = lx.next().unwrap();
        assert_eq!(t.kind, TokenKind::Text);
        assert_eq!(t.text, "red@");
        assert_eq!(t.color, Some(3));
        assert_eq!(t.wait_at, Some(11));
        let t = lx.next().unwrap();
        assert_eq!(t.kind, TokenKind::Text);
        assert_eq!(t.text, "plain");
        assert_eq!(t.color, Some(0));
    }

    #[test]
    fn stray_caret_is_literal() {
        let mut lx = lexer_over(b"!a^b^@^\n");
        let t = lx.next().unwrap();
        assert_eq!(t.kind, TokenKind::Text);
        assert_eq!(t.text, "!a^b@");
    }

    #[test]
    fn read_str_concatenates_fragments() {
        let mut lx = lexer_over(b"\"ab\"+$1+\"cd\"\n#FF00FF\n*Target\n");
        lx.set_str(1, "-");
        assert_eq!(lx.read_str().unwrap(), "ab-cd");
        lx.next().unwrap();
        assert_eq!(lx.read_str().unwrap(), "#FF00FF");
        lx.next().unwrap();
        assert_eq!(lx.read_str().unwrap(), "*target");
    }

    #[test]
    fn prepass_registers_aliases_and_restores_cursor() {
        let mut lx = lexer_over(b"numalias count,12\ndim ?0[count]\ncount\n");
        lx.prepass().unwrap();
        assert_eq!(lx.pos(), 0);
        // The alias resolves afterwards, and the dim allocated 13 slots.
        assert_eq!(lx.num_alias.get("count"), Some(&12));
        assert_eq!(lx.arrays[0].dims, vec![13]);
    }

    #[test]
    fn config_reaches_lexer_state() {
        let lx = lexer_over(b";preamble\n$mode800,g300,v1000\n*s\n");
        assert_eq!(lx.mode(), (800, 600));
        assert_eq!(lx.var_range(), (1000, 300));
    }
}
