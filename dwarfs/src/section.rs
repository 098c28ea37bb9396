//! The on-disk section envelope.
//!
//! Every persisted region of an archive (data block, metadata schema,
//! metadata, history, section index) is framed as a *section*: a fixed
//! 64-byte [`Header`] followed by the maybe-compressed payload. The header
//! carries two checksums: a fast XXH3-64 digest that is always verified on
//! read, and a strong SHA-512/256 digest verified only on request (see
//! [`VerifyLevel`]).
//!
//! The final section of a well-formed archive is the section index, an
//! uncompressed array of [`SectionIndexEntry`] packing `(type, offset)`
//! into a u64 each. It is located by a single tail read, giving O(1)
//! random access to every other section.
//!
//! An archive may be preceded by an arbitrary opaque header (for example a
//! shell launcher). [`SectionReader::detect_archive_start`] scans for the
//! first plausible section header to find the real start of the archive.

use std::{fmt, mem::offset_of};

use positioned_io::ReadAt;
use sha2::{Digest as _, Sha512_256};
use xxhash_rust::xxh3::Xxh3Default;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, little_endian as le};

type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised while reading or validating sections.
pub struct Error(Box<ErrorInner>);

#[derive(Debug)]
#[non_exhaustive]
pub(crate) enum ErrorInner {
    BadMagic([u8; 6]),
    UnsupportedVersion(u8, u8),
    PayloadLengthMismatch,
    FastChecksumMismatch,
    StrongChecksumMismatch,
    OffsetOverflow,
    PayloadTooLong { limit: usize, got: u64 },
    WrongSectionType { expect: SectionType, got: SectionType },
    UnsupportedCompression(CompressAlgo),
    Decompress(std::io::Error),
    BadSectionIndex(String),
    NoArchive,
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
            ErrorInner::BadMagic(magic) => {
                write!(f, "bad section magic b\"{}\"", magic.escape_ascii())
            }
            ErrorInner::UnsupportedVersion(major, minor) => {
                write!(f, "unsupported format version DWARFS{major}.{minor}")
            }
            ErrorInner::PayloadLengthMismatch => f.pad("section payload length mismatch"),
            ErrorInner::FastChecksumMismatch => f.pad("section fast checksum mismatch"),
            ErrorInner::StrongChecksumMismatch => f.pad("section strong checksum mismatch"),
            ErrorInner::OffsetOverflow => f.pad("section offset overflows u64"),
            ErrorInner::PayloadTooLong { limit, got } => {
                write!(f, "section payload of {got} bytes exceeds the {limit} byte limit")
            }
            ErrorInner::WrongSectionType { expect, got } => {
                write!(f, "expected section type {expect:?}, got {got:?}")
            }
            ErrorInner::UnsupportedCompression(algo) => {
                write!(f, "unsupported compression algorithm {algo:?}")
            }
            ErrorInner::Decompress(err) => write!(f, "failed to decompress section: {err}"),
            ErrorInner::BadSectionIndex(msg) => write!(f, "malformed section index: {msg}"),
            ErrorInner::NoArchive => f.pad("no archive found in input"),
            ErrorInner::Io(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &*self.0 {
            ErrorInner::Decompress(err) | ErrorInner::Io(err) => Some(err),
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
        Self(Box::new(ErrorInner::Io(err)))
    }
}

impl Error {
    /// Whether this error indicates corrupt on-disk data, as opposed to an
    /// I/O failure or an unsupported feature.
    pub fn is_corrupt(&self) -> bool {
        matches!(
            &*self.0,
            ErrorInner::BadMagic(_)
                | ErrorInner::PayloadLengthMismatch
                | ErrorInner::FastChecksumMismatch
                | ErrorInner::StrongChecksumMismatch
                | ErrorInner::PayloadTooLong { .. }
                | ErrorInner::WrongSectionType { .. }
                | ErrorInner::Decompress(_)
                | ErrorInner::BadSectionIndex(_)
        )
    }
}

/// The size in bytes of an encoded [`Header`].
pub const HEADER_SIZE: u64 = size_of::<Header>() as u64;

/// How thoroughly payloads are verified against their header on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum VerifyLevel {
    /// Only structural validation (magic, version, lengths).
    None,
    /// Additionally verify the fast XXH3-64 checksum. The default.
    #[default]
    Checksum,
    /// Additionally verify the strong SHA-512/256 checksum.
    Full,
}

/// The section header preceding every payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(8))]
pub struct Header {
    /// Magic bytes and format version.
    pub magic_version: MagicVersion,
    /// SHA-512/256 digest of everything from `fast_checksum` to the end of
    /// the payload.
    pub strong_checksum: [u8; 32],
    /// XXH3-64 digest of everything from `section_number` to the end of
    /// the payload.
    pub fast_checksum: [u8; 8],
    /// 0-based ordinal of this section within the archive.
    pub section_number: le::U32,
    /// What the payload contains.
    pub section_type: SectionType,
    /// How the payload is compressed.
    pub compression: CompressAlgo,
    /// Length in bytes of the (compressed) payload that follows.
    pub payload_size: le::U64,
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("magic_version", &self.magic_version)
            .field("section_number", &self.section_number.get())
            .field("section_type", &self.section_type)
            .field("compression", &self.compression)
            .field("payload_size", &self.payload_size.get())
            .finish_non_exhaustive()
    }
}

impl Header {
    /// Construct an unsealed header for writing. Checksums are filled in by
    /// [`Header::seal`].
    pub fn new(
        section_number: u32,
        section_type: SectionType,
        compression: CompressAlgo,
    ) -> Self {
        Self {
            magic_version: MagicVersion::CURRENT,
            strong_checksum: [0u8; 32],
            fast_checksum: [0u8; 8],
            section_number: section_number.into(),
            section_type,
            compression,
            payload_size: le::U64::ZERO,
        }
    }

    /// Record the payload size and both checksums for `payload`.
    pub fn seal(&mut self, payload: &[u8]) {
        self.payload_size = (payload.len() as u64).into();

        let mut fast = Xxh3Default::new();
        fast.update(&self.as_bytes()[offset_of!(Self, section_number)..]);
        fast.update(payload);
        self.fast_checksum = fast.digest().to_le_bytes();

        let mut strong = Sha512_256::new();
        strong.update(&self.as_bytes()[offset_of!(Self, fast_checksum)..]);
        strong.update(payload);
        self.strong_checksum = strong.finalize().into();
    }

    /// Verify `payload` against this header at the given level.
    pub fn verify(&self, payload: &[u8], level: VerifyLevel) -> Result<()> {
        if payload.len() as u64 != self.payload_size.get() {
            bail!(ErrorInner::PayloadLengthMismatch);
        }
        if level >= VerifyLevel::Checksum {
            let mut h = Xxh3Default::new();
            h.update(&self.as_bytes()[offset_of!(Self, section_number)..]);
            h.update(payload);
            if h.digest().to_le_bytes() != self.fast_checksum {
                bail!(ErrorInner::FastChecksumMismatch);
            }
        }
        if level >= VerifyLevel::Full {
            let mut h = Sha512_256::new();
            h.update(&self.as_bytes()[offset_of!(Self, fast_checksum)..]);
            h.update(payload);
            if *h.finalize() != self.strong_checksum {
                bail!(ErrorInner::StrongChecksumMismatch);
            }
        }
        Ok(())
    }

    pub(crate) fn expect_type(&self, expect: SectionType) -> Result<()> {
        if self.section_type != expect {
            bail!(ErrorInner::WrongSectionType { expect, got: self.section_type });
        }
        Ok(())
    }

    fn payload_size_within(&self, limit: usize) -> Result<usize> {
        let got = self.payload_size.get();
        match usize::try_from(got) {
            Ok(n) if n <= limit => Ok(n),
            _ => bail!(ErrorInner::PayloadTooLong { limit, got }),
        }
    }
}

/// Magic bytes plus the format version.
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct MagicVersion {
    /// Always [`MagicVersion::MAGIC`] in a valid archive.
    pub magic: [u8; 6],
    /// Format major version.
    pub major: u8,
    /// Format minor version.
    pub minor: u8,
}

impl fmt::Debug for MagicVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "b\"{}\" v{}.{}",
            self.magic.escape_ascii(),
            self.major,
            self.minor
        )
    }
}

impl MagicVersion {
    /// The section magic.
    pub const MAGIC: [u8; 6] = *b"DWARFS";

    /// The version written by this crate.
    pub const CURRENT: Self = Self {
        magic: Self::MAGIC,
        major: crate::FORMAT_VERSION_MAX.0,
        minor: crate::FORMAT_VERSION_MAX.1,
    };

    /// Check the magic and that the version is readable by this crate.
    pub fn validate(self) -> Result<()> {
        if self.magic != Self::MAGIC {
            bail!(ErrorInner::BadMagic(self.magic));
        }
        let ver = (self.major, self.minor);
        if !(crate::FORMAT_VERSION_MIN..=crate::FORMAT_VERSION_MAX).contains(&ver) {
            bail!(ErrorInner::UnsupportedVersion(self.major, self.minor));
        }
        Ok(())
    }
}

macro_rules! open_u16_enum {
    ($name:ident { $($(#[$meta:meta])* $variant:ident = $value:expr,)* }) => {
        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match *self {
                    $(Self::$variant => f.pad(stringify!($variant)),)*
                    other => f.debug_tuple(stringify!($name)).field(&other.0.get()).finish(),
                }
            }
        }

        impl $name {
            $($(#[$meta])* pub const $variant: Self = Self(le::U16::new($value));)*
        }
    };
}

/// What a section's payload contains. An open enum: unknown values survive
/// round trips.
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(2))]
pub struct SectionType(pub le::U16);

open_u16_enum! {
    SectionType {
        /// A fixed-size block of file data.
        BLOCK = 0,
        /// The schema describing the layout of [`METADATA`](Self::METADATA).
        METADATA_SCHEMA = 7,
        /// The packed filesystem metadata.
        METADATA = 8,
        /// The section index. Must be last and uncompressed.
        SECTION_INDEX = 9,
        /// Build history records.
        HISTORY = 10,
    }
}

/// How a section payload is compressed. An open enum.
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(2))]
pub struct CompressAlgo(pub le::U16);

open_u16_enum! {
    CompressAlgo {
        /// Stored uncompressed.
        NONE = 0,
        /// LZMA (xz). Feature `lzma`.
        LZMA = 1,
        /// Zstandard. Feature `zstd`.
        ZSTD = 2,
        /// LZ4, fast mode. Feature `lz4`.
        LZ4 = 3,
        /// LZ4 high-compression mode; decompresses as plain LZ4.
        LZ4HC = 4,
        /// Brotli. Feature `brotli`.
        BROTLI = 5,
        /// FLAC, for PCM audio blocks. Registered but not implemented.
        FLAC = 6,
        /// Rice++ coding, for raw sensor data. Registered but not implemented.
        RICEPP = 7,
    }
}

/// One entry of the section index: the section type in the top 16 bits and
/// the offset (relative to the first section) in the low 48.
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(8))]
pub struct SectionIndexEntry(pub le::U64);

impl fmt::Debug for SectionIndexEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectionIndexEntry")
            .field("section_type", &self.section_type())
            .field("offset", &self.offset())
            .finish()
    }
}

impl SectionIndexEntry {
    const OFFSET_BITS: u32 = 48;

    /// Pack `(ty, offset)`, or `None` if the offset needs more than 48 bits.
    pub fn pack(ty: SectionType, offset: u64) -> Option<Self> {
        (offset >> Self::OFFSET_BITS == 0)
            .then(|| Self(le::U64::new(u64::from(ty.0.get()) << Self::OFFSET_BITS | offset)))
    }

    /// The type of the referenced section.
    #[must_use]
    #[inline]
    pub fn section_type(self) -> SectionType {
        SectionType(le::U16::new((self.0.get() >> Self::OFFSET_BITS) as u16))
    }

    /// The offset of the referenced section, relative to the first section.
    #[must_use]
    #[inline]
    pub fn offset(self) -> u64 {
        self.0.get() & ((1u64 << Self::OFFSET_BITS) - 1)
    }
}

/// Reads sections from a random access stream, typically [`std::fs::File`].
///
/// All offsets taken by this type are relative to `archive_start`, the
/// position of section 0 in the underlying stream (0 unless the image
/// carries an opaque prefix header).
///
/// Buffered wrappers are unnecessary: sections are large and higher layers
/// cache decompressed blocks.
pub struct SectionReader<R: ?Sized> {
    archive_start: u64,
    /// Scratch buffer for compressed payload bytes, kept for reuse.
    scratch: Vec<u8>,
    rdr: R,
}

impl<R: fmt::Debug + ?Sized> fmt::Debug for SectionReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectionReader")
            .field("archive_start", &self.archive_start)
            .field("rdr", &&self.rdr)
            .finish_non_exhaustive()
    }
}

impl<R> SectionReader<R> {
    /// Wrap a stream whose archive starts at offset 0.
    pub fn new(rdr: R) -> Self {
        Self::with_archive_start(rdr, 0)
    }

    /// Wrap a stream whose archive starts at `archive_start` (also known as
    /// the image offset).
    pub fn with_archive_start(rdr: R, archive_start: u64) -> Self {
        Self { archive_start, scratch: Vec::new(), rdr }
    }

    /// Consume the wrapper and return the underlying stream.
    #[inline]
    pub fn into_inner(self) -> R {
        self.rdr
    }
}

impl<R: ?Sized> SectionReader<R> {
    /// A shared reference to the underlying stream.
    #[inline]
    pub fn get_ref(&self) -> &R {
        &self.rdr
    }

    /// An exclusive reference to the underlying stream.
    #[inline]
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.rdr
    }

    /// The archive start offset set on creation.
    #[inline]
    #[must_use]
    pub fn archive_start(&self) -> u64 {
        self.archive_start
    }
}

impl<R: ReadAt + ?Sized> SectionReader<R> {
    /// Locate the first section header in `rdr` by scanning for the magic,
    /// and return its stream offset.
    ///
    /// This supports images with an opaque prefix header. A candidate
    /// position only counts if a structurally valid section-0 header is
    /// found there.
    pub fn detect_archive_start(rdr: &R, stream_len: u64) -> Result<u64> {
        use bstr::ByteSlice;

        const WINDOW: usize = 1 << 16;

        let mut buf = vec![0u8; WINDOW + MagicVersion::MAGIC.len() - 1];
        let mut base = 0u64;
        while base + HEADER_SIZE <= stream_len {
            let got = buf.len().min((stream_len - base) as usize);
            rdr.read_exact_at(base, &mut buf[..got])?;
            let mut search = 0;
            while let Some(pos) = buf[search..got].find(MagicVersion::MAGIC) {
                let candidate = base + (search + pos) as u64;
                let mut header = Header::new_zeroed();
                if candidate + HEADER_SIZE <= stream_len {
                    rdr.read_exact_at(candidate, header.as_mut_bytes())?;
                    if header.magic_version.validate().is_ok()
                        && header.section_number.get() == 0
                    {
                        return Ok(candidate);
                    }
                }
                search += pos + 1;
            }
            base += WINDOW as u64;
        }
        bail!(ErrorInner::NoArchive)
    }

    /// Read the section header at `section_offset`.
    pub fn read_header_at(&mut self, section_offset: u64) -> Result<Header> {
        let file_offset = self
            .archive_start
            .checked_add(section_offset)
            .ok_or(ErrorInner::OffsetOverflow)?;
        let mut header = Header::new_zeroed();
        self.rdr.read_exact_at(file_offset, header.as_mut_bytes())?;
        header.magic_version.validate()?;
        Ok(header)
    }

    /// Read the raw (still compressed) payload for `header`, verifying it
    /// at `level`. `payload_offset` is the offset just past the header.
    pub fn read_raw_payload_at(
        &mut self,
        header: &Header,
        payload_offset: u64,
        size_limit: usize,
        level: VerifyLevel,
    ) -> Result<Vec<u8>> {
        let file_offset = self
            .archive_start
            .checked_add(payload_offset)
            .ok_or(ErrorInner::OffsetOverflow)?;
        let size = header.payload_size_within(size_limit)?;
        let mut raw = vec![0u8; size];
        self.rdr.read_exact_at(file_offset, &mut raw)?;
        header.verify(&raw, level)?;
        Ok(raw)
    }

    /// Read and decompress the payload for `header`.
    ///
    /// The decompressed size must not exceed `size_limit`. The fast
    /// checksum is always verified first.
    pub fn read_payload_at(
        &mut self,
        header: &Header,
        payload_offset: u64,
        size_limit: usize,
    ) -> Result<Vec<u8>> {
        let file_offset = self
            .archive_start
            .checked_add(payload_offset)
            .ok_or(ErrorInner::OffsetOverflow)?;
        let compressed_size = header.payload_size_within(size_limit)?;
        let scratch = &mut self.scratch;
        scratch.resize(compressed_size, 0);
        self.rdr.read_exact_at(file_offset, scratch)?;
        header.verify(scratch, VerifyLevel::Checksum)?;
        crate::codec::decompress(header.compression, scratch, size_limit)
    }

    /// Read and decompress a whole section at `section_offset`.
    pub fn read_section_at(
        &mut self,
        section_offset: u64,
        size_limit: usize,
    ) -> Result<(Header, Vec<u8>)> {
        let header = self.read_header_at(section_offset)?;
        // The header read succeeded, so this cannot overflow.
        let payload = self.read_payload_at(&header, section_offset + HEADER_SIZE, size_limit)?;
        Ok((header, payload))
    }

    /// Locate and read the section index from the tail of the stream.
    ///
    /// `stream_len` is the total length of the underlying stream. The index
    /// is validated to be the last section, uncompressed, with a
    /// self-consistent entry count.
    pub fn read_section_index(
        &mut self,
        stream_len: u64,
        size_limit: usize,
    ) -> Result<(Header, Vec<SectionIndexEntry>)> {
        const ENTRY_SIZE: u64 = size_of::<SectionIndexEntry>() as u64;

        let malformed =
            |msg: String| -> Error { ErrorInner::BadSectionIndex(msg).into() };

        if stream_len < self.archive_start + HEADER_SIZE + ENTRY_SIZE {
            return Err(malformed(format!(
                "stream of {stream_len} bytes cannot hold a section index"
            )));
        }

        let mut tail = SectionIndexEntry::new_zeroed();
        self.rdr
            .read_exact_at(stream_len - ENTRY_SIZE, tail.as_mut_bytes())?;
        if tail.section_type() != SectionType::SECTION_INDEX {
            return Err(malformed(format!(
                "last entry has type {:?}, not SECTION_INDEX",
                tail.section_type()
            )));
        }
        let index_offset = tail.offset();

        let payload_size = stream_len
            .checked_sub(self.archive_start)
            .and_then(|n| n.checked_sub(index_offset))
            .and_then(|n| n.checked_sub(HEADER_SIZE))
            .filter(|&n| n > 0)
            .ok_or_else(|| {
                malformed(format!("index offset {index_offset} leaves no payload room"))
            })?;
        if payload_size % ENTRY_SIZE != 0 {
            return Err(malformed(format!(
                "index payload of {payload_size} bytes is not whole entries"
            )));
        }
        let num_sections = payload_size / ENTRY_SIZE;

        let header = self.read_header_at(index_offset)?;
        if header.section_type != SectionType::SECTION_INDEX
            || header.compression != CompressAlgo::NONE
            || header.payload_size.get() != payload_size
            || u64::from(header.section_number.get()) != num_sections - 1
        {
            return Err(malformed(format!("inconsistent index header: {header:?}")));
        }

        if payload_size > size_limit as u64 {
            bail!(ErrorInner::PayloadTooLong { limit: size_limit, got: payload_size });
        }
        let mut entries = SectionIndexEntry::new_vec_zeroed(num_sections as usize)
            .expect("allocation failed");
        self.rdr
            .read_exact_at(self.archive_start + index_offset + HEADER_SIZE, entries.as_mut_bytes())?;
        header.verify(entries.as_bytes(), VerifyLevel::Checksum)?;
        Ok((header, entries))
    }
}

pub(crate) fn decompress_error(err: std::io::Error) -> Error {
    ErrorInner::Decompress(err).into()
}

pub(crate) fn unsupported_compression(algo: CompressAlgo) -> Error {
    ErrorInner::UnsupportedCompression(algo).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_verify() {
        let payload = b"hello section";
        let mut header = Header::new(3, SectionType::BLOCK, CompressAlgo::NONE);
        header.seal(payload);

        header.verify(payload, VerifyLevel::None).unwrap();
        header.verify(payload, VerifyLevel::Checksum).unwrap();
        header.verify(payload, VerifyLevel::Full).unwrap();

        // A payload flip fails the fast checksum but passes level None.
        let mut bad = payload.to_vec();
        bad[0] ^= 1;
        header.verify(&bad, VerifyLevel::None).unwrap();
        assert!(header.verify(&bad, VerifyLevel::Checksum).is_err());

        // A flip in the strong checksum itself is only caught at Full.
        header.strong_checksum[0] ^= 1;
        header.verify(payload, VerifyLevel::Checksum).unwrap();
        assert!(header.verify(payload, VerifyLevel::Full).is_err());
    }

    #[test]
    fn index_entry_packing() {
        let ent = SectionIndexEntry::pack(SectionType::METADATA, 0x1234_5678_9abc).unwrap();
        assert_eq!(ent.section_type(), SectionType::METADATA);
        assert_eq!(ent.offset(), 0x1234_5678_9abc);
        assert!(SectionIndexEntry::pack(SectionType::BLOCK, 1 << 48).is_none());
    }

    #[test]
    fn magic_validation() {
        MagicVersion::CURRENT.validate().unwrap();
        let bad = MagicVersion { magic: *b"DWARFX", major: 2, minor: 5 };
        assert!(bad.validate().is_err());
        let future = MagicVersion { magic: MagicVersion::MAGIC, major: 9, minor: 0 };
        assert!(future.validate().is_err());
    }
}
