//! The DwarFS writer pipeline.
//!
//! Building an archive runs through fixed stages, each its own module:
//!
//! 1. [`scan`]: walk the input tree (or an explicit input list), apply
//!    [`filter`] rules and ownership/time overrides.
//! 2. [`categorize`]: split regular files into tagged fragments.
//! 3. [`dedup`]: hash fragments with the configured file hash and
//!    collapse equal content.
//! 4. [`order`]: permute unique fragments for better compression
//!    locality (path, similarity or [`nilsimsa`] ordering).
//! 5. [`pack`]: assemble fragments into fixed-size per-category blocks.
//! 6. [`emit`]: compress blocks on a worker pool and write sections in
//!    finalization order, then metadata, history, and the section index.
//!
//! [`archive::ArchiveWriter`] drives the stages; the `mkdwarfs` tool is a
//! thin CLI wrapper around it. [`recompress`] re-encodes an existing
//! image without rebuilding it.

macro_rules! bail {
    ($err:expr $(,)?) => {
        return Err(Into::into($err))
    };
}

pub mod archive;
pub mod categorize;
pub mod dedup;
pub mod emit;
pub mod filter;
pub mod metadata;
pub mod nilsimsa;
pub mod order;
pub mod pack;
pub mod recompress;
pub mod scan;

use std::fmt;

pub use archive::{ArchiveWriter, BuildStats, WriterOptions};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised while building an archive.
pub struct Error(Box<ErrorInner>);

#[derive(Debug)]
pub(crate) enum ErrorInner {
    BadArgs(String),
    BadFilterRule(String),
    RecursiveInclude(String),
    DuplicateEntry(String),
    Limit(&'static str),
    Corrupt(String),
    Codec(dwarfs::codec::Error),
    Metadata(dwarfs::metadata::Error),
    Section(dwarfs::section::Error),
    Io(std::io::Error),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            ErrorInner::BadArgs(msg) => f.pad(msg),
            ErrorInner::BadFilterRule(msg) => write!(f, "bad filter rule: {msg}"),
            ErrorInner::RecursiveInclude(file) => {
                write!(f, "recursion detected while opening file: {file}")
            }
            ErrorInner::DuplicateEntry(name) => {
                write!(f, "duplicated entry name in a directory: {name}")
            }
            ErrorInner::Limit(msg) => f.pad(msg),
            ErrorInner::Corrupt(msg) => f.pad(msg),
            ErrorInner::Codec(err) => err.fmt(f),
            ErrorInner::Metadata(err) => err.fmt(f),
            ErrorInner::Section(err) => err.fmt(f),
            ErrorInner::Io(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &*self.0 {
            ErrorInner::Codec(err) => Some(err),
            ErrorInner::Metadata(err) => Some(err),
            ErrorInner::Section(err) => Some(err),
            ErrorInner::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ErrorInner> for Error {
    #[cold]
    fn from(inner: ErrorInner) -> Self {
        Self(Box::new(inner))
    }
}

impl From<std::io::Error> for Error {
    #[cold]
    fn from(err: std::io::Error) -> Self {
        ErrorInner::Io(err).into()
    }
}

impl From<dwarfs::codec::Error> for Error {
    #[cold]
    fn from(err: dwarfs::codec::Error) -> Self {
        ErrorInner::Codec(err).into()
    }
}

impl From<dwarfs::metadata::Error> for Error {
    #[cold]
    fn from(err: dwarfs::metadata::Error) -> Self {
        ErrorInner::Metadata(err).into()
    }
}

impl From<dwarfs::section::Error> for Error {
    #[cold]
    fn from(err: dwarfs::section::Error) -> Self {
        ErrorInner::Section(err).into()
    }
}

impl Error {
    pub(crate) fn bad_args(msg: impl Into<String>) -> Self {
        ErrorInner::BadArgs(msg.into()).into()
    }

    /// Whether this error reports corrupt input (recompress source).
    pub fn is_corrupt(&self) -> bool {
        matches!(&*self.0, ErrorInner::Corrupt(_))
    }
}

/// Parse a byte size with an optional `k`/`m`/`g` suffix (powers of
/// 1024), as accepted by several command line options.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let (digits, shift) = match s.as_bytes().last() {
        Some(b'k' | b'K') => (&s[..s.len() - 1], 10),
        Some(b'm' | b'M') => (&s[..s.len() - 1], 20),
        Some(b'g' | b'G') => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| Error::bad_args(format!("invalid size: {s}")))?;
    n.checked_shl(shift)
        .filter(|&v| v >> shift == n)
        .ok_or_else(|| Error::bad_args(format!("size overflows: {s}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_with_suffixes() {
        assert_eq!(parse_size("0").unwrap(), 0);
        assert_eq!(parse_size("1000").unwrap(), 1000);
        assert_eq!(parse_size("4k").unwrap(), 4096);
        assert_eq!(parse_size("2M").unwrap(), 2 << 20);
        assert_eq!(parse_size("1G").unwrap(), 1 << 30);
        assert!(parse_size("").is_err());
        assert!(parse_size("12x").is_err());
        assert!(parse_size("99999999999G").is_err());
    }
}
