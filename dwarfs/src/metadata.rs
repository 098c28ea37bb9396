//! The packed filesystem metadata model.
//!
//! Metadata is persisted as two sections: a [`Schema`] describing the
//! bit-level layout (row counts and per-column bit widths of every table)
//! and the metadata payload itself, a short varint preamble followed by
//! the bit-packed tables and the string buffers.
//!
//! [`Metadata`] here is the *canonical, unpacked* form: prefix sums
//! applied, run-length tables expanded, front-coded string buffers
//! decoded. The packing flags in [`FsOptions`] record how the data was
//! (or should be) encoded on disk; [`Metadata::to_schema_and_bytes`] and
//! [`Metadata::parse`] are exact inverses of each other.
//!
//! Only binary structure is validated here. Semantic validation (index
//! ranges, inode tallies) happens when a
//! [`Filesystem`][crate::reader::Filesystem] is opened.

use std::fmt;

use bstr::BString;

mod packing;
pub mod schema;

pub use schema::{Schema, TableId, TableLayout};

use packing::{BitReader, BitWriter, bits_for, packed_len, read_uvarint, write_uvarint};

type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised while encoding or decoding metadata.
#[derive(Debug)]
pub struct Error(Box<str>);

impl Error {
    pub(crate) fn new(msg: impl Into<String>) -> Self {
        Self(msg.into().into_boxed_str())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for Error {}

/// A `(block, offset, size)` reference into decompressed block data.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub block: u32,
    pub offset: u32,
    pub size: u32,
}

/// Entry-range bookkeeping for one directory inode.
///
/// A directory's entries are `dir_entries[first_entry..next.first_entry]`;
/// the table carries one trailing sentinel row. `self_entry` and
/// `parent_entry` point back into `dir_entries` for `.`/`..` resolution.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Directory {
    pub parent_entry: u32,
    pub first_entry: u32,
    pub self_entry: u32,
}

/// Per-inode metadata, all indirected through interned tables.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InodeData {
    pub mode_index: u32,
    pub owner_index: u32,
    pub group_index: u32,
    pub atime_offset: u32,
    pub mtime_offset: u32,
    pub ctime_offset: u32,
}

/// One named entry in a directory.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub name_index: u32,
    pub inode_num: u32,
}

/// A flat string table: concatenated bytes plus the end offset of each
/// entry.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StringTable {
    pub buffer: BString,
    /// `index[i]` is the end offset of string `i`; the start is
    /// `index[i - 1]` (or 0).
    pub index: Vec<u32>,
}

impl StringTable {
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn get(&self, i: u32) -> Option<&[u8]> {
        let end = *self.index.get(i as usize)? as usize;
        let start = if i == 0 { 0 } else { self.index[i as usize - 1] as usize };
        self.buffer.get(start..end)
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = &[u8]> + '_ {
        (0..self.index.len() as u32).map(|i| self.get(i).expect("index in range"))
    }
}

/// Filesystem-wide options, including the metadata packing flags.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FsOptions {
    pub mtime_only: bool,
    pub packed_chunk_table: bool,
    pub packed_directories: bool,
    pub packed_shared_files: bool,
    pub packed_names: bool,
    pub packed_names_index: bool,
    pub packed_symlinks: bool,
    pub packed_symlinks_index: bool,
}

impl FsOptions {
    const MTIME_ONLY: u64 = 1 << 0;
    const PACKED_CHUNK_TABLE: u64 = 1 << 1;
    const PACKED_DIRECTORIES: u64 = 1 << 2;
    const PACKED_SHARED_FILES: u64 = 1 << 3;
    const PACKED_NAMES: u64 = 1 << 4;
    const PACKED_NAMES_INDEX: u64 = 1 << 5;
    const PACKED_SYMLINKS: u64 = 1 << 6;
    const PACKED_SYMLINKS_INDEX: u64 = 1 << 7;

    fn to_flags(self) -> u64 {
        let mut f = 0;
        let mut set = |cond, bit| {
            if cond {
                f |= bit;
            }
        };
        set(self.mtime_only, Self::MTIME_ONLY);
        set(self.packed_chunk_table, Self::PACKED_CHUNK_TABLE);
        set(self.packed_directories, Self::PACKED_DIRECTORIES);
        set(self.packed_shared_files, Self::PACKED_SHARED_FILES);
        set(self.packed_names, Self::PACKED_NAMES);
        set(self.packed_names_index, Self::PACKED_NAMES_INDEX);
        set(self.packed_symlinks, Self::PACKED_SYMLINKS);
        set(self.packed_symlinks_index, Self::PACKED_SYMLINKS_INDEX);
        f
    }

    fn from_flags(f: u64) -> Result<Self> {
        const KNOWN: u64 = (1 << 8) - 1;
        if f & !KNOWN != 0 {
            return Err(Error::new(format!("unknown option flags {:#x}", f & !KNOWN)));
        }
        Ok(Self {
            mtime_only: f & Self::MTIME_ONLY != 0,
            packed_chunk_table: f & Self::PACKED_CHUNK_TABLE != 0,
            packed_directories: f & Self::PACKED_DIRECTORIES != 0,
            packed_shared_files: f & Self::PACKED_SHARED_FILES != 0,
            packed_names: f & Self::PACKED_NAMES != 0,
            packed_names_index: f & Self::PACKED_NAMES_INDEX != 0,
            packed_symlinks: f & Self::PACKED_SYMLINKS != 0,
            packed_symlinks_index: f & Self::PACKED_SYMLINKS_INDEX != 0,
        })
    }
}

/// The whole metadata of an archive, in canonical unpacked form.
#[derive(Debug, Default, Clone, PartialEq)]
#[non_exhaustive]
pub struct Metadata {
    pub chunks: Vec<Chunk>,
    /// One row per directory inode, plus a trailing sentinel.
    pub directories: Vec<Directory>,
    pub inodes: Vec<InodeData>,
    pub dir_entries: Vec<DirEntry>,
    /// First-chunk index per file store, plus a trailing sentinel.
    pub chunk_table: Vec<u32>,
    /// Symlink inode index -> index into `symlinks`.
    pub symlink_table: Vec<u32>,
    pub uids: Vec<u32>,
    pub gids: Vec<u32>,
    pub modes: Vec<u32>,
    pub devices: Vec<u64>,
    /// Shared-file inode index -> shared store index.
    pub shared_files_table: Vec<u32>,
    pub names: StringTable,
    pub symlinks: StringTable,
    pub category_names: Vec<BString>,
    /// Per-block category index, parallel to the block sections.
    pub block_categories: Vec<u32>,

    /// Base of all time offsets, in `time_resolution` units.
    pub timestamp_base: u64,
    pub time_resolution: u32,
    pub block_size: u32,
    pub total_fs_size: u64,
    pub options: FsOptions,
    pub creator: Option<BString>,
    pub create_timestamp: Option<u64>,
}

/// Compute delta encoding of a non-decreasing sequence.
fn deltas(values: &[u32], what: &str) -> Result<Vec<u64>> {
    let mut prev = 0u32;
    values
        .iter()
        .map(|&v| {
            let d = v
                .checked_sub(prev)
                .ok_or_else(|| Error::new(format!("{what} is not non-decreasing")))?;
            prev = v;
            Ok(u64::from(d))
        })
        .collect()
}

/// Invert [`deltas`] in place over already-decoded u32 values.
fn prefix_sums(values: &mut [u32], what: &str) -> Result<()> {
    let mut sum = 0u32;
    for v in values {
        sum = sum
            .checked_add(*v)
            .ok_or_else(|| Error::new(format!("{what} prefix sum overflows u32")))?;
        *v = sum;
    }
    Ok(())
}

impl Metadata {
    /// Serialize to `(schema payload, metadata payload)` applying the
    /// packing transforms selected in [`FsOptions`].
    pub fn to_schema_and_bytes(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let o = &self.options;
        let mut out = Vec::new();

        // Preamble.
        write_uvarint(&mut out, o.to_flags());
        write_uvarint(&mut out, u64::from(self.time_resolution.max(1)));
        write_uvarint(&mut out, self.timestamp_base);
        write_uvarint(&mut out, u64::from(self.block_size));
        write_uvarint(&mut out, self.total_fs_size);
        write_uvarint(&mut out, self.names.len() as u64);
        write_uvarint(&mut out, self.symlinks.len() as u64);
        let creator = self.creator.as_deref().map(|b| b.as_slice()).unwrap_or(&[]);
        write_uvarint(&mut out, creator.len() as u64);
        out.extend_from_slice(creator);
        match self.create_timestamp {
            Some(ts) => {
                out.push(1);
                write_uvarint(&mut out, ts);
            }
            None => out.push(0),
        }

        // Collect tables as columns of u64.
        let col32 = |it: &mut dyn Iterator<Item = u32>| it.map(u64::from).collect::<Vec<u64>>();
        let mut tables: Vec<(TableId, Vec<Vec<u64>>)> = Vec::new();

        tables.push((
            TableId::Chunks,
            vec![
                col32(&mut self.chunks.iter().map(|c| c.block)),
                col32(&mut self.chunks.iter().map(|c| c.offset)),
                col32(&mut self.chunks.iter().map(|c| c.size)),
            ],
        ));
        let first_entry_col = if o.packed_directories {
            deltas(
                &self.directories.iter().map(|d| d.first_entry).collect::<Vec<_>>(),
                "directories.first_entry",
            )?
        } else {
            col32(&mut self.directories.iter().map(|d| d.first_entry))
        };
        tables.push((
            TableId::Directories,
            vec![
                col32(&mut self.directories.iter().map(|d| d.parent_entry)),
                first_entry_col,
                col32(&mut self.directories.iter().map(|d| d.self_entry)),
            ],
        ));
        tables.push((
            TableId::Inodes,
            vec![
                col32(&mut self.inodes.iter().map(|i| i.mode_index)),
                col32(&mut self.inodes.iter().map(|i| i.owner_index)),
                col32(&mut self.inodes.iter().map(|i| i.group_index)),
                col32(&mut self.inodes.iter().map(|i| i.atime_offset)),
                col32(&mut self.inodes.iter().map(|i| i.mtime_offset)),
                col32(&mut self.inodes.iter().map(|i| i.ctime_offset)),
            ],
        ));
        tables.push((
            TableId::DirEntries,
            vec![
                col32(&mut self.dir_entries.iter().map(|e| e.name_index)),
                col32(&mut self.dir_entries.iter().map(|e| e.inode_num)),
            ],
        ));
        let chunk_table_col = if o.packed_chunk_table {
            deltas(&self.chunk_table, "chunk_table")?
        } else {
            col32(&mut self.chunk_table.iter().copied())
        };
        tables.push((TableId::ChunkTable, vec![chunk_table_col]));
        tables.push((
            TableId::SymlinkTable,
            vec![col32(&mut self.symlink_table.iter().copied())],
        ));
        tables.push((TableId::Uids, vec![col32(&mut self.uids.iter().copied())]));
        tables.push((TableId::Gids, vec![col32(&mut self.gids.iter().copied())]));
        tables.push((TableId::Modes, vec![col32(&mut self.modes.iter().copied())]));
        tables.push((TableId::Devices, vec![self.devices.clone()]));
        let shared_col = if o.packed_shared_files {
            pack_shared_files(&self.shared_files_table)?
        } else {
            col32(&mut self.shared_files_table.iter().copied())
        };
        tables.push((TableId::SharedFiles, vec![shared_col]));
        if !o.packed_names {
            let col = if o.packed_names_index {
                deltas(&self.names.index, "names.index")?
            } else {
                col32(&mut self.names.index.iter().copied())
            };
            tables.push((TableId::NameIndex, vec![col]));
        }
        if !o.packed_symlinks {
            let col = if o.packed_symlinks_index {
                deltas(&self.symlinks.index, "symlinks.index")?
            } else {
                col32(&mut self.symlinks.index.iter().copied())
            };
            tables.push((TableId::SymlinkIndex, vec![col]));
        }
        tables.push((
            TableId::BlockCategories,
            vec![col32(&mut self.block_categories.iter().copied())],
        ));

        // Bit-pack non-empty tables and derive the schema.
        let mut layouts = Vec::new();
        for (id, cols) in &tables {
            let rows = cols[0].len();
            debug_assert!(cols.iter().all(|c| c.len() == rows));
            if rows == 0 {
                continue;
            }
            if u32::try_from(rows).is_err() {
                return Err(Error::new(format!("table {id:?} exceeds 2^32 rows")));
            }
            let widths: Vec<u8> = cols
                .iter()
                .map(|c| bits_for(c.iter().copied().max().unwrap_or(0)))
                .collect();
            let mut w = BitWriter::new(std::mem::take(&mut out));
            for row in 0..rows {
                for (col, &width) in std::iter::zip(cols, &widths) {
                    w.put(col[row], width);
                }
            }
            out = w.finish();
            layouts.push(TableLayout { id: *id, rows: rows as u64, widths });
        }

        // String buffers.
        let mut write_buffer = |tbl: &StringTable, packed: bool, out: &mut Vec<u8>| {
            if packed {
                let mut coded = Vec::new();
                packing::front_code(tbl.iter(), &mut coded);
                write_uvarint(out, coded.len() as u64);
                out.extend_from_slice(&coded);
            } else {
                write_uvarint(out, tbl.buffer.len() as u64);
                out.extend_from_slice(&tbl.buffer);
            }
        };
        write_buffer(&self.names, o.packed_names, &mut out);
        write_buffer(&self.symlinks, o.packed_symlinks, &mut out);
        write_uvarint(&mut out, self.category_names.len() as u64);
        for name in &self.category_names {
            write_uvarint(&mut out, name.len() as u64);
            out.extend_from_slice(name);
        }

        let schema = Schema { tables: layouts };
        Ok((schema.to_bytes(), out))
    }

    /// Parse a metadata payload laid out according to `schema`, undoing
    /// all packing transforms.
    pub fn parse(schema: &Schema, bytes: &[u8]) -> Result<Self> {
        let input = &mut &bytes[..];

        let options = FsOptions::from_flags(read_uvarint(input)?)?;
        let time_resolution = u32::try_from(read_uvarint(input)?)
            .ok()
            .filter(|&r| r >= 1)
            .ok_or_else(|| Error::new("invalid time resolution"))?;
        let timestamp_base = read_uvarint(input)?;
        let block_size = u32::try_from(read_uvarint(input)?)
            .map_err(|_| Error::new("block size exceeds u32"))?;
        let total_fs_size = read_uvarint(input)?;
        let names_count = read_len(input, "names count")?;
        let symlinks_count = read_len(input, "symlinks count")?;
        let creator_len = read_len(input, "creator length")?;
        let creator = take(input, creator_len, "creator")?;
        let creator = (!creator.is_empty()).then(|| BString::from(creator));
        let create_timestamp = match take(input, 1, "create timestamp flag")?[0] {
            0 => None,
            1 => Some(read_uvarint(input)?),
            _ => return Err(Error::new("invalid create timestamp flag")),
        };

        let mut m = Metadata {
            options,
            time_resolution,
            timestamp_base,
            block_size,
            total_fs_size,
            creator,
            create_timestamp,
            ..Metadata::default()
        };

        // Bit-packed tables, in schema order.
        for layout in &schema.tables {
            let rows = usize::try_from(layout.rows)
                .ok()
                .filter(|&n| u32::try_from(n).is_ok())
                .ok_or_else(|| Error::new(format!("table {:?} is too large", layout.id)))?;
            let nbytes = packed_len(layout.rows, layout.row_bits())
                .ok_or_else(|| Error::new(format!("table {:?} size overflows", layout.id)))?;
            let raw = take(input, nbytes, "table data")?;
            let mut r = BitReader::new(raw);
            let ncols = layout.widths.len();
            let mut cols: Vec<Vec<u64>> = vec![Vec::with_capacity(rows); ncols];
            for _ in 0..rows {
                for (col, &width) in std::iter::zip(&mut cols, &layout.widths) {
                    col.push(r.get(width)?);
                }
            }
            m.assign_table(layout.id, cols)?;
        }

        // String buffers.
        let mut read_strings = |input: &mut &[u8],
                                packed: bool,
                                count: usize,
                                index: Vec<u32>,
                                what: &str|
         -> Result<StringTable> {
            let len = read_len(input, what)?;
            let raw = take(input, len, what)?;
            if packed {
                let coded = &mut &raw[..];
                let (buffer, index) = packing::front_decode(coded, count)?;
                if !coded.is_empty() {
                    return Err(Error::new(format!("trailing bytes in packed {what}")));
                }
                Ok(StringTable { buffer: buffer.into(), index })
            } else {
                if index.len() != count {
                    return Err(Error::new(format!("{what} index length mismatch")));
                }
                Ok(StringTable { buffer: raw.into(), index })
            }
        };
        let name_index = std::mem::take(&mut m.names.index);
        m.names = read_strings(input, options.packed_names, names_count, name_index, "names")?;
        let symlink_index = std::mem::take(&mut m.symlinks.index);
        m.symlinks = read_strings(
            input,
            options.packed_symlinks,
            symlinks_count,
            symlink_index,
            "symlinks",
        )?;
        let category_count = read_len(input, "category count")?;
        for _ in 0..category_count {
            let len = read_len(input, "category name")?;
            m.category_names.push(take(input, len, "category name")?.into());
        }
        if !input.is_empty() {
            return Err(Error::new("trailing bytes after metadata"));
        }

        // Undo packing transforms.
        if options.packed_chunk_table {
            prefix_sums(&mut m.chunk_table, "chunk_table")?;
        }
        if options.packed_directories {
            let mut firsts: Vec<u32> = m.directories.iter().map(|d| d.first_entry).collect();
            prefix_sums(&mut firsts, "directories.first_entry")?;
            for (d, f) in std::iter::zip(&mut m.directories, firsts) {
                d.first_entry = f;
            }
        }
        if options.packed_names_index && !options.packed_names {
            prefix_sums(&mut m.names.index, "names.index")?;
        }
        if options.packed_symlinks_index && !options.packed_symlinks {
            prefix_sums(&mut m.symlinks.index, "symlinks.index")?;
        }
        if options.packed_shared_files {
            m.shared_files_table = unpack_shared_files(&m.shared_files_table, m.inodes.len())?;
        }

        for (tbl, what) in [(&m.names, "names"), (&m.symlinks, "symlinks")] {
            let len = tbl.buffer.len() as u64;
            if !tbl.index.is_sorted() || tbl.index.last().is_some_and(|&e| u64::from(e) != len) {
                return Err(Error::new(format!("inconsistent {what} index")));
            }
            if tbl.index.is_empty() && len != 0 {
                return Err(Error::new(format!("{what} buffer without index")));
            }
        }

        Ok(m)
    }

    fn assign_table(&mut self, id: TableId, cols: Vec<Vec<u64>>) -> Result<()> {
        let to_u32 = |col: &[u64], what: &str| -> Result<Vec<u32>> {
            col.iter()
                .map(|&v| {
                    u32::try_from(v).map_err(|_| Error::new(format!("{what} value exceeds u32")))
                })
                .collect()
        };
        match id {
            TableId::Chunks => {
                let block = to_u32(&cols[0], "chunks.block")?;
                let offset = to_u32(&cols[1], "chunks.offset")?;
                let size = to_u32(&cols[2], "chunks.size")?;
                self.chunks = (0..block.len())
                    .map(|i| Chunk { block: block[i], offset: offset[i], size: size[i] })
                    .collect();
            }
            TableId::Directories => {
                let parent = to_u32(&cols[0], "directories.parent_entry")?;
                let first = to_u32(&cols[1], "directories.first_entry")?;
                let this = to_u32(&cols[2], "directories.self_entry")?;
                self.directories = (0..parent.len())
                    .map(|i| Directory {
                        parent_entry: parent[i],
                        first_entry: first[i],
                        self_entry: this[i],
                    })
                    .collect();
            }
            TableId::Inodes => {
                let mode = to_u32(&cols[0], "inodes.mode_index")?;
                let owner = to_u32(&cols[1], "inodes.owner_index")?;
                let group = to_u32(&cols[2], "inodes.group_index")?;
                let atime = to_u32(&cols[3], "inodes.atime_offset")?;
                let mtime = to_u32(&cols[4], "inodes.mtime_offset")?;
                let ctime = to_u32(&cols[5], "inodes.ctime_offset")?;
                self.inodes = (0..mode.len())
                    .map(|i| InodeData {
                        mode_index: mode[i],
                        owner_index: owner[i],
                        group_index: group[i],
                        atime_offset: atime[i],
                        mtime_offset: mtime[i],
                        ctime_offset: ctime[i],
                    })
                    .collect();
            }
            TableId::DirEntries => {
                let name = to_u32(&cols[0], "dir_entries.name_index")?;
                let inode = to_u32(&cols[1], "dir_entries.inode_num")?;
                self.dir_entries = (0..name.len())
                    .map(|i| DirEntry { name_index: name[i], inode_num: inode[i] })
                    .collect();
            }
            TableId::ChunkTable => self.chunk_table = to_u32(&cols[0], "chunk_table")?,
            TableId::SymlinkTable => self.symlink_table = to_u32(&cols[0], "symlink_table")?,
            TableId::Uids => self.uids = to_u32(&cols[0], "uids")?,
            TableId::Gids => self.gids = to_u32(&cols[0], "gids")?,
            TableId::Modes => self.modes = to_u32(&cols[0], "modes")?,
            TableId::Devices => self.devices = cols.into_iter().next().expect("one column"),
            TableId::SharedFiles => {
                self.shared_files_table = to_u32(&cols[0], "shared_files_table")?;
            }
            TableId::NameIndex => self.names.index = to_u32(&cols[0], "names.index")?,
            TableId::SymlinkIndex => self.symlinks.index = to_u32(&cols[0], "symlinks.index")?,
            TableId::BlockCategories => {
                self.block_categories = to_u32(&cols[0], "block_categories")?;
            }
        }
        Ok(())
    }
}

fn read_len(input: &mut &[u8], what: &str) -> Result<usize> {
    usize::try_from(read_uvarint(input)?).map_err(|_| Error::new(format!("{what} overflows usize")))
}

fn take<'a>(input: &mut &'a [u8], n: usize, what: &str) -> Result<&'a [u8]> {
    input
        .split_off(..n)
        .ok_or_else(|| Error::new(format!("truncated {what}")))
}

/// Run-length pack the shared-files table: one row per shared store
/// holding its duplicate count minus 2 (a store always has at least two
/// referencing inodes).
fn pack_shared_files(unpacked: &[u32]) -> Result<Vec<u64>> {
    let mut counts = Vec::new();
    for &store in unpacked {
        match store.cmp(&(counts.len() as u32)) {
            std::cmp::Ordering::Less if store + 1 == counts.len() as u32 => {
                counts[store as usize] += 1u64;
            }
            std::cmp::Ordering::Equal => counts.push(1),
            _ => return Err(Error::new("shared_files_table is not grouped ascending")),
        }
    }
    counts
        .iter_mut()
        .try_for_each(|c| {
            *c = c.checked_sub(2).ok_or(())?;
            Ok(())
        })
        .map_err(|()| Error::new("shared store with fewer than 2 references"))?;
    Ok(counts)
}

fn unpack_shared_files(packed: &[u32], inode_bound: usize) -> Result<Vec<u32>> {
    let total: u64 = packed.iter().map(|&extra| u64::from(extra) + 2).sum();
    // A loose bound to keep corrupt inputs from ballooning memory.
    if total > inode_bound as u64 {
        return Err(Error::new("shared_files_table larger than inode table"));
    }
    let mut out = Vec::with_capacity(total as usize);
    for (store, &extra) in packed.iter().enumerate() {
        out.extend(std::iter::repeat_n(store as u32, extra as usize + 2));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(options: FsOptions) -> Metadata {
        let mut m = Metadata {
            chunks: vec![
                Chunk { block: 0, offset: 0, size: 100 },
                Chunk { block: 0, offset: 100, size: 4096 },
                Chunk { block: 1, offset: 0, size: 7 },
            ],
            directories: vec![
                Directory { parent_entry: 0, first_entry: 1, self_entry: 0 },
                Directory { parent_entry: 0, first_entry: 4, self_entry: 1 },
                Directory { parent_entry: 0, first_entry: 5, self_entry: 0 },
            ],
            inodes: vec![InodeData::default(); 6],
            dir_entries: vec![
                DirEntry { name_index: 0, inode_num: 0 },
                DirEntry { name_index: 0, inode_num: 1 },
                DirEntry { name_index: 1, inode_num: 2 },
                DirEntry { name_index: 2, inode_num: 3 },
                DirEntry { name_index: 3, inode_num: 4 },
            ],
            chunk_table: vec![0, 2, 3],
            symlink_table: vec![0],
            uids: vec![1000],
            gids: vec![100, 0],
            modes: vec![0o40755, 0o100644, 0o120777],
            devices: vec![],
            shared_files_table: vec![0, 0],
            timestamp_base: 100,
            time_resolution: 1,
            block_size: 1 << 16,
            total_fs_size: 4203,
            options,
            creator: Some("test".into()),
            create_timestamp: Some(12345),
            ..Metadata::default()
        };
        for (tbl, strings) in [
            (&mut m.names, &["bin", "boot", "bootstrap", "zzz"][..]),
            (&mut m.symlinks, &["../target"][..]),
        ] {
            for s in strings {
                tbl.buffer.extend_from_slice(s.as_bytes());
                tbl.index.push(tbl.buffer.len() as u32);
            }
        }
        m
    }

    #[test]
    fn roundtrip_plain() {
        let m = sample(FsOptions::default());
        let (schema_bytes, meta_bytes) = m.to_schema_and_bytes().unwrap();
        let schema = Schema::parse(&schema_bytes).unwrap();
        let got = Metadata::parse(&schema, &meta_bytes).unwrap();
        assert_eq!(got, m);
    }

    #[test]
    fn roundtrip_all_packed() {
        let m = sample(FsOptions {
            mtime_only: true,
            packed_chunk_table: true,
            packed_directories: true,
            packed_shared_files: true,
            packed_names: true,
            packed_names_index: true,
            packed_symlinks: true,
            packed_symlinks_index: true,
        });
        let (schema_bytes, meta_bytes) = m.to_schema_and_bytes().unwrap();
        let schema = Schema::parse(&schema_bytes).unwrap();
        let got = Metadata::parse(&schema, &meta_bytes).unwrap();
        assert_eq!(got, m);
    }

    #[test]
    fn packing_shrinks_name_heavy_metadata() {
        let mut plain = Metadata::default();
        plain.time_resolution = 1;
        for i in 0..64 {
            let name = format!("a_long_shared_prefix_{i:03}.txt");
            plain.names.buffer.extend_from_slice(name.as_bytes());
            plain.names.index.push(plain.names.buffer.len() as u32);
        }
        let mut packed = plain.clone();
        packed.options.packed_names = true;

        let plain_len = plain.to_schema_and_bytes().unwrap().1.len();
        let packed_len = packed.to_schema_and_bytes().unwrap().1.len();
        assert!(packed_len < plain_len, "{packed_len} vs {plain_len}");
    }

    #[test]
    fn shared_files_packing() {
        assert_eq!(pack_shared_files(&[0, 0, 1, 1, 1]).unwrap(), vec![0, 1]);
        assert!(pack_shared_files(&[0]).is_err());
        assert!(pack_shared_files(&[1, 1]).is_err());
        assert_eq!(unpack_shared_files(&[0, 1], 5).unwrap(), vec![0, 0, 1, 1, 1]);
        assert!(unpack_shared_files(&[100], 5).is_err());
    }

    #[test]
    fn corrupt_inputs_do_not_panic() {
        let m = sample(FsOptions::default());
        let (schema_bytes, meta_bytes) = m.to_schema_and_bytes().unwrap();
        let schema = Schema::parse(&schema_bytes).unwrap();
        for cut in [0, 1, meta_bytes.len() / 2, meta_bytes.len() - 1] {
            assert!(Metadata::parse(&schema, &meta_bytes[..cut]).is_err());
        }
    }
}
