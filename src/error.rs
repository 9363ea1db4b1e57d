//! Error taxonomy for the command server core.
//!
//! Nothing in this crate panics on the request path; every fallible
//! operation returns one of these and the caller decides whether the
//! failure is local to one client or fatal to the owning thread.

use std::fmt;
use std::io;

/// A kind, not a stack trace: each variant carries its own propagation
/// policy, noted below.
#[derive(Debug)]
pub enum SlError {
    /// Transient client I/O: recovered by disconnecting that client.
    Io(io::Error),
    /// The ring buffer could not accept the line/bytes in question.
    RingOverflow,
    /// A socket address (UNIX path or host:port) didn't parse.
    BadAddress(String),
    /// `bind`/`listen` failed -- fatal to the owning server thread.
    Listen(io::Error),
    /// Out of memory -- fatal to the process.
    Oom,
}

impl fmt::Display for SlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlError::Io(e) => write!(f, "I/O error: {}", e),
            SlError::RingOverflow => write!(f, "ring buffer overflow"),
            SlError::BadAddress(s) => write!(f, "bad socket address: {}", s),
            SlError::Listen(e) => write!(f, "listen failed: {}", e),
            SlError::Oom => write!(f, "allocation failed"),
        }
    }
}

impl std::error::Error for SlError {}

impl From<io::Error> for SlError {
    fn from(e: io::Error) -> SlError {
        SlError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, SlError>;
