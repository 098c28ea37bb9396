//! The high-level filesystem façade.
//!
//! [`Filesystem::open`] loads the section index and metadata of an
//! archive, validates them, and wires up the [block cache][crate::cache].
//! Everything metadata-only (`find`, `getattr`, directory walks) is
//! served from shared read-only tables and never suspends; file content
//! goes through [`Filesystem::readv`], which returns one
//! [`RangeFuture`] per chunk.
//!
//! Inodes are classified by number range, in this order: directories,
//! symlinks, unique regular files, shared regular files, devices, IPC
//! (fifos and sockets). No per-inode type tag exists; the range bounds
//! are computed once when the filesystem is opened.

use std::{
    fmt,
    io::Write,
    iter::FusedIterator,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering::Relaxed},
    },
};

use bstr::{BStr, BString, ByteSlice};
use positioned_io::{ReadAt, Size};
use serde_json::json;

use crate::{
    bisect_by,
    cache::{BlockCache, CacheOptions, RangeFuture, SectionHandle, TidyConfig},
    codec,
    metadata::{self, Metadata, Schema},
    section::{
        self, HEADER_SIZE, SectionIndexEntry, SectionReader, SectionType, VerifyLevel,
    },
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised while opening or querying an archive.
pub struct Error(Box<ErrorInner>);

#[derive(Debug)]
enum ErrorInner {
    Section(String, Option<section::Error>),
    MissingSection(SectionType),
    DuplicatedSection(SectionType),
    ParseMetadata(metadata::Error),
    Validation(&'static str),
    NotRegular(u32),
    NotSymlink(u32),
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
            ErrorInner::Section(msg, Some(err)) => write!(f, "{msg}: {err}"),
            ErrorInner::Section(msg, None) => f.pad(msg),
            ErrorInner::MissingSection(ty) => write!(f, "missing section {ty:?}"),
            ErrorInner::DuplicatedSection(ty) => write!(f, "duplicated section {ty:?}"),
            ErrorInner::ParseMetadata(err) => write!(f, "failed to parse metadata: {err}"),
            ErrorInner::Validation(msg) => write!(f, "malformed metadata: {msg}"),
            ErrorInner::NotRegular(ino) => write!(f, "inode {ino} is not a regular file"),
            ErrorInner::NotSymlink(ino) => write!(f, "inode {ino} is not a symlink"),
            ErrorInner::Io(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &*self.0 {
            ErrorInner::Section(_, Some(err)) => Some(err),
            ErrorInner::ParseMetadata(err) => Some(err),
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
        Self(Box::new(ErrorInner::Io(err)))
    }
}

impl Error {
    /// Whether the error indicates corrupt on-disk data.
    pub fn is_corrupt(&self) -> bool {
        match &*self.0 {
            ErrorInner::Section(_, Some(err)) => err.is_corrupt(),
            ErrorInner::ParseMetadata(_) | ErrorInner::Validation(_) => true,
            _ => false,
        }
    }
}

trait ResultExt<T> {
    fn context(self, msg: impl fmt::Display) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T, section::Error> {
    #[inline]
    fn context(self, msg: impl fmt::Display) -> Result<T> {
        self.map_err(|err| ErrorInner::Section(msg.to_string(), Some(err)).into())
    }
}

trait CheckExt {
    fn check(self, msg: &'static str) -> Result<()>;
}

impl CheckExt for bool {
    #[inline]
    fn check(self, msg: &'static str) -> Result<()> {
        if self { Ok(()) } else { Err(ErrorInner::Validation(msg).into()) }
    }
}

/// Where the archive starts within the input stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageOffset {
    /// Scan for the section magic; handles images with opaque prefix
    /// headers. The default.
    #[default]
    Auto,
    /// The archive starts exactly here.
    Exact(u64),
}

/// Options for [`Filesystem::open_with_config`].
#[derive(Debug, Clone)]
pub struct Config {
    pub image_offset: ImageOffset,
    pub section_index_size_limit: usize,
    pub schema_size_limit: usize,
    pub metadata_size_limit: usize,
    pub cache: CacheOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            image_offset: ImageOffset::Auto,
            section_index_size_limit: 64 << 20,
            schema_size_limit: 1 << 20,
            metadata_size_limit: 256 << 20,
            cache: CacheOptions::default(),
        }
    }
}

/// Inode range bounds for type classification.
#[derive(Debug, Default, Clone, Copy)]
struct InodeRanges {
    symlink_start: u32,
    unique_start: u32,
    shared_start: u32,
    device_start: u32,
    ipc_start: u32,
    unique_count: u32,
}

struct ArcReader(Arc<DynReader>);

type DynReader = dyn ReadAt + Send + Sync;

impl ReadAt for ArcReader {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read_at(pos, buf)
    }
}

/// An opened archive.
pub struct Filesystem {
    reader: Arc<DynReader>,
    cache: BlockCache,
    meta: Metadata,
    section_index: Box<[SectionIndexEntry]>,
    ranges: InodeRanges,
    archive_start: u64,
    stream_len: u64,
    /// `timestamp_base * time_resolution`, precomputed.
    timestamp_base_scaled: u64,
    block_count: u32,
}

impl fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filesystem")
            .field("inodes", &self.meta.inodes.len())
            .field("blocks", &self.block_count)
            .field("archive_start", &self.archive_start)
            .finish_non_exhaustive()
    }
}

impl Filesystem {
    /// Open an archive from a random access stream, typically a
    /// [`std::fs::File`], with default configuration.
    pub fn open<R>(rdr: R) -> Result<Self>
    where
        R: ReadAt + Size + Send + Sync + 'static,
    {
        Self::open_with_config(rdr, &Config::default())
    }

    /// Open an archive with explicit [`Config`].
    pub fn open_with_config<R>(rdr: R, config: &Config) -> Result<Self>
    where
        R: ReadAt + Size + Send + Sync + 'static,
    {
        let stream_len = rdr
            .size()?
            .ok_or_else(|| ErrorInner::Section("cannot size the input stream".into(), None))?;
        let reader: Arc<DynReader> = Arc::new(rdr);
        Self::open_inner(reader, stream_len, config)
    }

    fn open_inner(reader: Arc<DynReader>, stream_len: u64, config: &Config) -> Result<Self> {
        let archive_start = match config.image_offset {
            ImageOffset::Exact(n) => n,
            ImageOffset::Auto => {
                // The common case has no prefix header; only scan when the
                // stream does not start with a valid section.
                let mut probe = SectionReader::new(ArcReader(reader.clone()));
                match probe.read_header_at(0) {
                    Ok(_) => 0,
                    Err(_) => SectionReader::detect_archive_start(probe.get_ref(), stream_len)
                        .context("failed to locate archive")?,
                }
            }
        };

        let mut rdr = SectionReader::with_archive_start(ArcReader(reader.clone()), archive_start);
        let (_, section_index) = rdr
            .read_section_index(stream_len, config.section_index_size_limit)
            .context("failed to load section index")?;
        u32::try_from(section_index.len()).ok().is_some().check("too many sections")?;
        section_index
            .windows(2)
            .all(|w| w[0].offset() < w[1].offset())
            .check("section index offsets are not ascending")?;
        let section_index = section_index.into_boxed_slice();

        let unique_section = |ty: SectionType| -> Result<u64> {
            let mut offsets = section_index
                .iter()
                .filter(|ent| ent.section_type() == ty)
                .map(|ent| ent.offset());
            let off = offsets.next().ok_or(ErrorInner::MissingSection(ty))?;
            if offsets.next().is_some() {
                bail!(ErrorInner::DuplicatedSection(ty));
            }
            Ok(off)
        };

        let meta = {
            let (_, raw_schema) = rdr
                .read_section_at(unique_section(SectionType::METADATA_SCHEMA)?, config.schema_size_limit)
                .context("failed to read metadata schema")?;
            let schema = Schema::parse(&raw_schema).map_err(ErrorInner::ParseMetadata)?;
            let (_, raw_meta) = rdr
                .read_section_at(unique_section(SectionType::METADATA)?, config.metadata_size_limit)
                .context("failed to read metadata")?;
            Metadata::parse(&schema, &raw_meta).map_err(ErrorInner::ParseMetadata)?
        };

        // Collect block sections for the cache, in index order. Block
        // numbers are dense by construction of the writer.
        let cache = BlockCache::new(reader.clone(), &config.cache);
        let mut block_count = 0u32;
        for ent in &section_index {
            if ent.section_type() != SectionType::BLOCK {
                continue;
            }
            let header = rdr
                .read_header_at(ent.offset())
                .context(format_args!("failed to read block section at {}", ent.offset()))?;
            cache.insert(SectionHandle::new(
                header,
                archive_start + ent.offset() + HEADER_SIZE,
            ));
            block_count += 1;
        }

        let mut this = Self {
            reader,
            cache,
            meta,
            section_index,
            ranges: InodeRanges::default(),
            archive_start,
            stream_len,
            timestamp_base_scaled: 0,
            block_count,
        };
        this.validate()?;
        this.cache.set_block_size(this.meta.block_size as usize);
        Ok(this)
    }

    /// Semantic validation: every index in every table is in range, so
    /// accessors can index without further checks.
    fn validate(&mut self) -> Result<()> {
        let m = &self.meta;

        let block_size = m.block_size;
        (block_size > 0 && block_size.is_power_of_two()).check("block size is not a power of two")?;
        usize::try_from(block_size).is_ok().check("block size exceeds usize")?;

        self.timestamp_base_scaled = m
            .timestamp_base
            .checked_mul(u64::from(m.time_resolution))
            .ok_or(ErrorInner::Validation("timestamp base overflows"))?;

        for c in &m.chunks {
            (c.block < self.block_count).check("chunk references unknown block")?;
            c.offset
                .checked_add(c.size)
                .is_some_and(|end| end <= block_size)
                .check("chunk exceeds block bounds")?;
        }

        (!m.directories.is_empty()).check("missing root directory")?;
        let dir_count = m.directories.len() - 1;
        (dir_count >= 1).check("missing root directory")?;
        let entry_count = m.dir_entries.len() as u32;
        (entry_count >= 1).check("missing root directory entry")?;
        m.directories
            .iter()
            .map(|d| d.first_entry)
            .is_sorted()
            .check("directory entry ranges are not ascending")?;
        for d in &m.directories {
            (d.first_entry <= entry_count).check("directory first_entry out of range")?;
            (d.parent_entry < entry_count).check("directory parent_entry out of range")?;
            (d.self_entry < entry_count).check("directory self_entry out of range")?;
        }
        (m.directories.last().unwrap().first_entry == entry_count)
            .check("directory sentinel does not cover all entries")?;

        // Inode ranges.
        let symlink_count = m.symlink_table.len();
        let device_count = m.devices.len();
        let shared_count = m.shared_files_table.len();
        let store_count = m.chunk_table.len().saturating_sub(1);
        let shared_store_count = m
            .shared_files_table
            .iter()
            .max()
            .map_or(0, |&max| max as usize + 1);
        let unique_count = store_count
            .checked_sub(shared_store_count)
            .ok_or(ErrorInner::Validation("more shared stores than file stores"))?;

        let symlink_start = dir_count;
        let unique_start = symlink_start + symlink_count;
        let shared_start = unique_start + unique_count;
        let device_start = shared_start + shared_count;
        let ipc_start = device_start + device_count;
        (ipc_start <= m.inodes.len()).check("inode table too short for tallies")?;
        u32::try_from(m.inodes.len()).is_ok().check("too many inodes")?;
        self.ranges = InodeRanges {
            symlink_start: symlink_start as u32,
            unique_start: unique_start as u32,
            shared_start: shared_start as u32,
            device_start: device_start as u32,
            ipc_start: ipc_start as u32,
            unique_count: unique_count as u32,
        };

        let uids = m.uids.len() as u32;
        let gids = m.gids.len() as u32;
        let modes = m.modes.len() as u32;
        (uids > 0 && gids > 0 && modes > 0).check("empty uid/gid/mode tables")?;
        for ino in &m.inodes {
            (ino.owner_index < uids).check("inode owner_index out of range")?;
            (ino.group_index < gids).check("inode group_index out of range")?;
            (ino.mode_index < modes).check("inode mode_index out of range")?;
            for off in [ino.atime_offset, ino.mtime_offset, ino.ctime_offset] {
                u64::from(off)
                    .checked_mul(u64::from(m.time_resolution))
                    .and_then(|t| t.checked_add(self.timestamp_base_scaled))
                    .is_some()
                    .check("inode time overflows")?;
            }
        }

        let chunk_count = m.chunks.len() as u32;
        m.chunk_table.is_sorted().check("chunk table is not ascending")?;
        for &c in &m.chunk_table {
            (c <= chunk_count).check("chunk table entry out of range")?;
        }
        (store_count == 0 || m.chunk_table.last() == Some(&chunk_count))
            .check("chunk table sentinel mismatch")?;

        let symlink_targets = m.symlinks.len() as u32;
        for &t in &m.symlink_table {
            (t < symlink_targets).check("symlink table entry out of range")?;
        }

        let names = m.names.len() as u32;
        let inodes = m.inodes.len() as u32;
        for ent in &m.dir_entries {
            (ent.name_index < names || (ent.name_index == 0 && names == 0))
                .check("entry name_index out of range")?;
            (ent.inode_num < inodes).check("entry inode_num out of range")?;
        }

        if !m.block_categories.is_empty() {
            (m.block_categories.len() == self.block_count as usize)
                .check("block category table length mismatch")?;
            let cats = m.category_names.len() as u32;
            for &c in &m.block_categories {
                (c < cats).check("block category out of range")?;
            }
        }

        Ok(())
    }

    /// The raw metadata tables.
    pub fn metadata(&self) -> &Metadata {
        &self.meta
    }

    /// The section index.
    pub fn section_index(&self) -> &[SectionIndexEntry] {
        &self.section_index
    }

    /// The number of data blocks.
    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// The archive start offset within the input stream.
    pub fn archive_start(&self) -> u64 {
        self.archive_start
    }

    /// The opaque image header preceding the archive, if any.
    pub fn header(&self) -> Result<Option<Vec<u8>>> {
        if self.archive_start == 0 {
            return Ok(None);
        }
        let mut buf = vec![0u8; self.archive_start as usize];
        self.reader.read_exact_at(0, &mut buf)?;
        Ok(Some(buf))
    }

    /// Reconfigure the cache tidy task.
    pub fn set_cache_tidy(&self, cfg: TidyConfig) {
        self.cache.set_tidy_config(cfg);
    }

    /// The root directory inode.
    pub fn root(&self) -> Inode<'_> {
        Inode { fs: self, num: 0 }
    }

    /// Total number of inodes.
    pub fn inode_count(&self) -> u32 {
        self.meta.inodes.len() as u32
    }

    /// Get an inode by number.
    pub fn inode(&self, num: u32) -> Option<Inode<'_>> {
        (num < self.inode_count()).then_some(Inode { fs: self, num })
    }

    /// Look up an inode by `/`-separated path relative to the root.
    /// Empty components are ignored, so `"a//b/"` equals `"a/b"`.
    pub fn find(&self, path: impl AsRef<[u8]>) -> Option<Inode<'_>> {
        path.as_ref()
            .split(|&b| b == b'/')
            .filter(|seg| !seg.is_empty())
            .try_fold(self.root(), |at, seg| at.as_dir()?.get(seg).map(|e| e.inode()))
    }

    /// The stat-like attributes of an inode. Never suspends.
    pub fn getattr(&self, inode: Inode<'_>) -> Attr {
        let m = &self.meta;
        let data = &m.inodes[inode.num as usize];
        let scale = |off: u32| {
            self.timestamp_base_scaled + u64::from(off) * u64::from(m.time_resolution)
        };
        let size = match inode.kind() {
            InodeKind::File(f) => f.size(),
            InodeKind::Symlink(l) => l.target().len() as u64,
            _ => 0,
        };
        Attr {
            inode: inode.num,
            mode: m.modes[data.mode_index as usize],
            uid: m.uids[data.owner_index as usize],
            gid: m.gids[data.group_index as usize],
            mtime: scale(data.mtime_offset),
            atime: (!m.options.mtime_only).then(|| scale(data.atime_offset)),
            ctime: (!m.options.mtime_only).then(|| scale(data.ctime_offset)),
            size,
        }
    }

    /// Request up to `size` bytes of a regular file starting at `offset`.
    ///
    /// Returns one future per touched chunk, in file order. The call
    /// itself never blocks; waiting on the futures does. Reads past the
    /// end of the file return fewer (or no) futures.
    pub fn readv(&self, inode: Inode<'_>, size: u64, offset: u64) -> Result<Vec<RangeFuture>> {
        let Some(file) = inode.as_file() else {
            bail!(ErrorInner::NotRegular(inode.num));
        };
        let mut out = Vec::new();
        let mut skip = offset;
        let mut rest = size;
        for chunk in file.chunks() {
            if rest == 0 {
                break;
            }
            let len = u64::from(chunk.size);
            if skip >= len {
                skip -= len;
                continue;
            }
            let take = (len - skip).min(rest);
            out.push(self.cache.get(chunk.block, u64::from(chunk.offset) + skip, take));
            skip = 0;
            rest -= take;
        }
        Ok(out)
    }

    /// Read a whole regular file into memory.
    pub fn read_file(&self, inode: Inode<'_>) -> Result<Vec<u8>> {
        let futures = self.readv(inode, u64::MAX, 0)?;
        let mut out = Vec::new();
        for fut in futures {
            let range = fut
                .wait()
                .map_err(|err| ErrorInner::Section(err.to_string(), None))?;
            out.extend_from_slice(&range.bytes());
        }
        Ok(out)
    }

    /// The target of a symlink inode.
    pub fn readlink<'a>(&self, inode: Inode<'a>) -> Result<&'a BStr> {
        match inode.kind() {
            InodeKind::Symlink(l) => Ok(l.target()),
            _ => Err(ErrorInner::NotSymlink(inode.num).into()),
        }
    }

    /// Depth-first pre-order walk over all entries. The root is reported
    /// with an empty path.
    pub fn walk(&self, mut cb: impl FnMut(&BStr, Inode<'_>)) {
        let mut path = BString::default();
        cb(path.as_bstr(), self.root());
        self.walk_dir(self.root().as_dir().expect("root is a directory"), &mut path, &mut cb);
    }

    fn walk_dir(
        &self,
        dir: Dir<'_>,
        path: &mut BString,
        cb: &mut impl FnMut(&BStr, Inode<'_>),
    ) {
        for ent in dir.entries() {
            let save = path.len();
            if !path.is_empty() {
                path.push(b'/');
            }
            path.extend_from_slice(ent.name());
            let inode = ent.inode();
            cb(path.as_bstr(), inode);
            if let Some(sub) = inode.as_dir() {
                self.walk_dir(sub, path, cb);
            }
            path.truncate(save);
        }
    }

    /// Like [`walk`][Self::walk], but regular files are reported in the
    /// order of their first chunk (block, then offset), maximizing block
    /// cache locality for bulk extraction. Non-file entries come first in
    /// path order.
    pub fn walk_data_order(&self, mut cb: impl FnMut(&BStr, Inode<'_>)) {
        let mut files: Vec<(u32, u32, BString, u32)> = Vec::new();
        self.walk(|path, inode| match inode.kind() {
            InodeKind::File(f) => {
                let key = f
                    .chunks()
                    .next()
                    .map_or((u32::MAX, u32::MAX), |c| (c.block, c.offset));
                files.push((key.0, key.1, path.into(), inode.num));
            }
            _ => cb(path, inode),
        });
        files.sort();
        for (_, _, path, num) in files {
            cb(path.as_bstr(), Inode { fs: self, num });
        }
    }

    /// A JSON description of the archive. Higher `detail` adds sections
    /// (1) and metadata internals (2).
    pub fn info_as_json(&self, detail: u32) -> serde_json::Value {
        let m = &self.meta;
        let mut info = json!({
            "version": {
                "major": crate::FORMAT_VERSION_MAX.0,
                "minor": crate::FORMAT_VERSION_MAX.1,
            },
            "created_by": m.creator.as_ref().map(|c| c.to_string()),
            "created_on": m.create_timestamp,
            "block_size": m.block_size,
            "block_count": self.block_count,
            "inode_count": self.inode_count(),
            "original_filesystem_size": m.total_fs_size,
            "categories": m.category_names.iter().map(|c| c.to_string()).collect::<Vec<_>>(),
        });
        if detail >= 1 {
            let sections: Vec<_> = self
                .section_index
                .iter()
                .map(|ent| {
                    json!({
                        "type": format!("{:?}", ent.section_type()),
                        "offset": ent.offset(),
                    })
                })
                .collect();
            info["sections"] = sections.into();
        }
        if detail >= 2 {
            let o = &m.options;
            let mut options = Vec::new();
            for (set, name) in [
                (o.mtime_only, "mtime_only"),
                (o.packed_chunk_table, "packed_chunk_table"),
                (o.packed_directories, "packed_directories"),
                (o.packed_shared_files, "packed_shared_files_table"),
                (o.packed_names, "packed_names"),
                (o.packed_names_index, "packed_names_index"),
                (o.packed_symlinks, "packed_symlinks"),
                (o.packed_symlinks_index, "packed_symlinks_index"),
            ] {
                if set {
                    options.push(name);
                }
            }
            info["options"] = options.into();
            info["time_resolution"] = m.time_resolution.into();
            info["meta"] = json!({
                "chunks": m.chunks.len(),
                "directories": m.directories.len() - 1,
                "symlinks": m.symlink_table.len(),
                "unique_files": self.ranges.unique_count,
                "shared_files": m.shared_files_table.len(),
                "devices": m.devices.len(),
                "names": m.names.len(),
            });
        }
        info
    }

    /// Dump a human-readable description to `out`.
    pub fn dump(&self, out: &mut dyn Write, detail: u32) -> std::io::Result<()> {
        let m = &self.meta;
        writeln!(
            out,
            "DwarFS v{}.{}, {} blocks of {} bytes, {} inodes",
            crate::FORMAT_VERSION_MAX.0,
            crate::FORMAT_VERSION_MAX.1,
            self.block_count,
            m.block_size,
            self.inode_count(),
        )?;
        if let Some(creator) = &m.creator {
            writeln!(out, "created by: {creator}")?;
        }
        if detail >= 1 {
            for ent in &self.section_index {
                writeln!(out, "SECTION {:?} @ {}", ent.section_type(), ent.offset())?;
            }
        }
        if detail >= 2 {
            let mut err = None;
            self.walk(|path, inode| {
                if err.is_some() {
                    return;
                }
                let attr = self.getattr(inode);
                err = writeln!(
                    out,
                    "{:06o} {:>5} {:>5} {:>10} /{}",
                    attr.mode, attr.uid, attr.gid, attr.size, path
                )
                .err();
            });
            if let Some(err) = err {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Verify the whole archive: every section header and checksum at
    /// `level`, full decompression of every block, and every chunk
    /// reference against the decoded block sizes.
    ///
    /// Returns the number of errors found; corruption is reported and
    /// counted rather than aborting the scan.
    pub fn check(&self, level: VerifyLevel, workers: usize) -> Result<u64> {
        let errors = AtomicU64::new(0);
        let block_lens: Vec<AtomicU64> = (0..self.block_count)
            .map(|_| AtomicU64::new(u64::MAX))
            .collect();
        let next = AtomicU64::new(0);

        std::thread::scope(|scope| {
            for _ in 0..workers.max(1) {
                scope.spawn(|| {
                    let mut rdr = SectionReader::with_archive_start(
                        ArcReader(self.reader.clone()),
                        self.archive_start,
                    );
                    loop {
                        let i = next.fetch_add(1, Relaxed) as usize;
                        let Some(ent) = self.section_index.get(i) else { break };
                        // Block numbers follow index order of block sections.
                        let block_no = self.section_index[..i]
                            .iter()
                            .filter(|e| e.section_type() == SectionType::BLOCK)
                            .count() as u32;
                        if let Err(err) =
                            self.check_section(&mut rdr, ent, block_no, level, &block_lens)
                        {
                            log::error!("section {i}: {err}");
                            errors.fetch_add(1, Relaxed);
                        }
                    }
                });
            }
        });

        // With decoded block lengths known, re-check chunk bounds.
        let mut errors = errors.into_inner();
        for c in &self.meta.chunks {
            let len = block_lens[c.block as usize].load(Relaxed);
            if len != u64::MAX && u64::from(c.offset) + u64::from(c.size) > len {
                log::error!(
                    "chunk ({}, {}, {}) exceeds decoded block length {len}",
                    c.block,
                    c.offset,
                    c.size
                );
                errors += 1;
            }
        }
        Ok(errors)
    }

    fn check_section(
        &self,
        rdr: &mut SectionReader<ArcReader>,
        ent: &SectionIndexEntry,
        block_no: u32,
        level: VerifyLevel,
        block_lens: &[AtomicU64],
    ) -> Result<(), section::Error> {
        let header = rdr.read_header_at(ent.offset())?;
        let raw = rdr.read_raw_payload_at(
            &header,
            ent.offset() + HEADER_SIZE,
            self.stream_len as usize,
            level,
        )?;
        if header.section_type == SectionType::BLOCK {
            let decoded = codec::decompress(
                header.compression,
                &raw,
                self.meta.block_size as usize,
            )?;
            block_lens[block_no as usize].store(decoded.len() as u64, Relaxed);
        }
        Ok(())
    }
}

/// Stat-like attributes returned by [`Filesystem::getattr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr {
    pub inode: u32,
    /// File type and permission bits, POSIX `st_mode` layout.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u64,
    /// `None` when the archive stores only mtimes.
    pub atime: Option<u64>,
    pub ctime: Option<u64>,
    pub size: u64,
}

/// An inode handle.
#[derive(Debug, Clone, Copy)]
pub struct Inode<'a> {
    fs: &'a Filesystem,
    num: u32,
}

impl<'a> Inode<'a> {
    pub fn inode_num(&self) -> u32 {
        self.num
    }

    /// Classify by number range.
    pub fn kind(&self) -> InodeKind<'a> {
        let Self { fs, num } = *self;
        let r = &fs.ranges;
        if num < r.symlink_start {
            InodeKind::Directory(Dir { fs, num })
        } else if num < r.unique_start {
            InodeKind::Symlink(Symlink { fs, idx: num - r.symlink_start })
        } else if num < r.shared_start {
            InodeKind::File(File { fs, num, store: num - r.unique_start })
        } else if num < r.device_start {
            let store = r.unique_count + fs.meta.shared_files_table[(num - r.shared_start) as usize];
            InodeKind::File(File { fs, num, store })
        } else if num < r.ipc_start {
            InodeKind::Device(Device { fs, idx: num - r.device_start })
        } else {
            InodeKind::Ipc(Ipc { num })
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind(), InodeKind::Directory(_))
    }

    pub fn as_dir(&self) -> Option<Dir<'a>> {
        match self.kind() {
            InodeKind::Directory(d) => Some(d),
            _ => None,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind(), InodeKind::File(_))
    }

    pub fn as_file(&self) -> Option<File<'a>> {
        match self.kind() {
            InodeKind::File(f) => Some(f),
            _ => None,
        }
    }

    pub fn attr(&self) -> Attr {
        self.fs.getattr(*self)
    }
}

/// An inode, classified.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub enum InodeKind<'a> {
    Directory(Dir<'a>),
    Symlink(Symlink<'a>),
    File(File<'a>),
    Device(Device<'a>),
    Ipc(Ipc),
}

/// A directory inode.
#[derive(Debug, Clone, Copy)]
pub struct Dir<'a> {
    fs: &'a Filesystem,
    num: u32,
}

impl<'a> Dir<'a> {
    pub fn inode(&self) -> Inode<'a> {
        Inode { fs: self.fs, num: self.num }
    }

    fn entry_range(&self) -> (u32, u32) {
        let dirs = &self.fs.meta.directories;
        (dirs[self.num as usize].first_entry, dirs[self.num as usize + 1].first_entry)
    }

    /// Iterate entries in ascending name order.
    pub fn entries(&self) -> DirEntryIter<'a> {
        let (start, end) = self.entry_range();
        DirEntryIter { fs: self.fs, next: start, end }
    }

    /// Binary search an entry by name. Entries are stored sorted by name,
    /// so this is `O(log n)` name comparisons.
    pub fn get(&self, name: impl AsRef<[u8]>) -> Option<DirEntryRef<'a>> {
        let name = name.as_ref();
        let (start, end) = self.entry_range();
        let idx = bisect_by(start..end, |i| {
            let ent_name: &[u8] = DirEntryRef { fs: self.fs, entry: i }.name().as_ref();
            ent_name.cmp(name)
        })?;
        Some(DirEntryRef { fs: self.fs, entry: idx })
    }
}

/// One directory entry.
#[derive(Debug, Clone, Copy)]
pub struct DirEntryRef<'a> {
    fs: &'a Filesystem,
    entry: u32,
}

impl<'a> DirEntryRef<'a> {
    pub fn name(&self) -> &'a BStr {
        let m = &self.fs.meta;
        let ent = &m.dir_entries[self.entry as usize];
        m.names.get(ent.name_index).expect("validated").as_bstr()
    }

    pub fn inode(&self) -> Inode<'a> {
        let m = &self.fs.meta;
        Inode { fs: self.fs, num: m.dir_entries[self.entry as usize].inode_num }
    }
}

/// Iterator over a directory's entries.
#[derive(Debug, Clone)]
pub struct DirEntryIter<'a> {
    fs: &'a Filesystem,
    next: u32,
    end: u32,
}

impl<'a> Iterator for DirEntryIter<'a> {
    type Item = DirEntryRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next < self.end {
            let ent = DirEntryRef { fs: self.fs, entry: self.next };
            self.next += 1;
            Some(ent)
        } else {
            None
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = (self.end - self.next) as usize;
        (len, Some(len))
    }
}

impl ExactSizeIterator for DirEntryIter<'_> {}
impl FusedIterator for DirEntryIter<'_> {}

/// A symlink inode.
#[derive(Debug, Clone, Copy)]
pub struct Symlink<'a> {
    fs: &'a Filesystem,
    idx: u32,
}

impl<'a> Symlink<'a> {
    pub fn target(&self) -> &'a BStr {
        let m = &self.fs.meta;
        let tgt = m.symlink_table[self.idx as usize];
        m.symlinks.get(tgt).expect("validated").as_bstr()
    }
}

/// A regular file inode (unique or shared; both resolve to a chunk
/// store).
#[derive(Debug, Clone, Copy)]
pub struct File<'a> {
    fs: &'a Filesystem,
    num: u32,
    store: u32,
}

impl<'a> File<'a> {
    pub fn inode(&self) -> Inode<'a> {
        Inode { fs: self.fs, num: self.num }
    }

    /// The chunks making up this file, in file order.
    pub fn chunks(&self) -> impl ExactSizeIterator<Item = metadata::Chunk> + Clone + 'a {
        let m = &self.fs.meta;
        let start = m.chunk_table[self.store as usize] as usize;
        let end = m.chunk_table[self.store as usize + 1] as usize;
        m.chunks[start..end].iter().copied()
    }

    /// Total file size in bytes.
    pub fn size(&self) -> u64 {
        self.chunks().map(|c| u64::from(c.size)).sum()
    }
}

/// A block or character device inode.
#[derive(Debug, Clone, Copy)]
pub struct Device<'a> {
    fs: &'a Filesystem,
    idx: u32,
}

impl Device<'_> {
    pub fn device_id(&self) -> u64 {
        self.fs.meta.devices[self.idx as usize]
    }
}

/// A fifo or socket inode.
#[derive(Debug, Clone, Copy)]
pub struct Ipc {
    num: u32,
}

impl Ipc {
    pub fn inode_num(&self) -> u32 {
        self.num
    }
}
