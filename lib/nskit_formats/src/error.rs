use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the archive and script subsystems.
#[derive(Debug)]
pub enum Error {
    /// A wrapped I/O error. Fatal to the operation in progress only.
    Io(io::Error),
    /// A header or entry table ended early. Aborts the affected volume.
    UnexpectedEof(&'static str),
    /// SPB width/height outside the plausible bounds.
    InvalidSpb { width: u32, height: u32 },
    /// SPB decode exceeded its wall-clock budget.
    Timeout,
    /// A decompression path produced something other than what was expected.
    Decode(&'static str),
    /// `jump_label` on a name that is not in the label index.
    UnknownLabel(String),
    /// Malformed expression or array access, reported with buffer position.
    Parse {
        msg: &'static str,
        pos: usize,
        line: u32,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::UnexpectedEof(what) => write!(f, "unexpected EOF reading {what}"),
            Error::InvalidSpb { width, height } => {
                write!(f, "invalid SPB size {width}x{height}")
            }
            Error::Timeout => write!(f, "SPB decode timeout"),
            Error::Decode(what) => write!(f, "decode error: {what}"),
            Error::UnknownLabel(name) => write!(f, "label \"{name}\" not found"),
            Error::Parse { msg, pos, line } => {
                write!(f, "{msg} at pos {pos} line {line}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
