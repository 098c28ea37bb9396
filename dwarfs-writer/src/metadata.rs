//! Building the archive metadata.
//!
//! [`Builder`] collects the directory hierarchy, interned attribute
//! tables and per-content chunk streams during the build, and
//! [`Builder::finish`] freezes everything into a
//! [`dwarfs::metadata::Metadata`]:
//!
//! - inode numbers are assigned so each kind occupies one contiguous
//!   range (directories, symlinks, unique files, shared files, devices,
//!   IPC), allowing readers to classify by range compare;
//! - content stores referenced by a single file become unique file
//!   inodes; stores referenced more than once become shared stores with
//!   one shared inode per referencing file;
//! - directory entries are sorted by name for binary search, with the
//!   root's self-link at entry 0 and a sentinel directory row at the
//!   end;
//! - times are quantized to the configured resolution and stored as
//!   offsets from the smallest stored time.

use std::collections::HashSet;

use bstr::{BStr, BString};
use dwarfs::metadata::{self, Chunk, FsOptions, Metadata, StringTable};
use indexmap::IndexSet;

use crate::{Error, ErrorInner, Result, scan::InodeMeta};

// Stored on disk; must not depend on the build platform.
const S_IFSOCK: u32 = 0o0140000;
const S_IFLNK: u32 = 0o0120000;
const S_IFREG: u32 = 0o0100000;
const S_IFBLK: u32 = 0o0060000;
const S_IFDIR: u32 = 0o0040000;
const S_IFCHR: u32 = 0o0020000;
const S_IFIFO: u32 = 0o0010000;

/// Which metadata packing transforms to apply, see
/// `--pack-metadata`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetadataPacking {
    pub chunk_table: bool,
    pub directories: bool,
    pub shared_files: bool,
    pub names: bool,
    pub names_index: bool,
    pub symlinks: bool,
    pub symlinks_index: bool,
    /// Re-pack when recompressing even if the input was packed
    /// differently.
    pub force: bool,
}

impl MetadataPacking {
    /// Parse a comma separated flag list. `all`, `none` and `plain` are
    /// group flags; `plain` clears every name/symlink packing.
    pub fn parse(s: &str) -> Result<Self> {
        let mut this = Self::default();
        for flag in s.split(',').filter(|f| !f.is_empty()) {
            match flag {
                "chunk_table" => this.chunk_table = true,
                "directories" => this.directories = true,
                "shared_files" => this.shared_files = true,
                "names" => this.names = true,
                "names_index" => this.names_index = true,
                "symlinks" => this.symlinks = true,
                "symlinks_index" => this.symlinks_index = true,
                "force" => this.force = true,
                "plain" => {
                    this.names = false;
                    this.names_index = false;
                    this.symlinks = false;
                    this.symlinks_index = false;
                }
                "none" => this = Self { force: this.force, ..Self::default() },
                "all" => {
                    this = Self {
                        chunk_table: true,
                        directories: true,
                        shared_files: true,
                        names: true,
                        names_index: true,
                        symlinks: true,
                        symlinks_index: true,
                        force: this.force,
                    }
                }
                _ => bail!(Error::bad_args(format!("unknown pack-metadata flag: {flag}"))),
            }
        }
        Ok(this)
    }
}

/// Builder configuration, frozen at construction.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Seconds per stored time unit, at least 1.
    pub time_resolution: u32,
    /// Drop atime/ctime and store mtime only.
    pub mtime_only: bool,
    pub packing: MetadataPacking,
    pub creator: Option<String>,
    pub create_timestamp: Option<u64>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            time_resolution: 1,
            mtime_only: true,
            packing: MetadataPacking::default(),
            creator: Some(concat!("mkdwarfs ", env!("CARGO_PKG_VERSION")).to_owned()),
            create_timestamp: None,
        }
    }
}

/// Handle to a directory inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirId(u32);

/// Handle to a registered content store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentId(u32);

// Kind ranks; the sort order defines the inode number ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Kind {
    Dir,
    Symlink,
    File,
    Device,
    Ipc,
}

#[derive(Debug)]
struct BuildInode {
    kind: Kind,
    orig: u32,
    mode_idx: u32,
    uid_idx: u32,
    gid_idx: u32,
    mtime: u64,
    atime: u64,
    ctime: u64,
    /// For regular files only.
    content: Option<ContentId>,
}

#[derive(Debug)]
struct ContentRec {
    chunks: Vec<Chunk>,
    size: u64,
    refs: u32,
}

#[derive(Debug, Clone, Copy)]
struct EntryRec {
    parent: u32,
    name_idx: u32,
    child: u32,
}

/// The metadata builder. Directories must be added parent-first; the
/// root exists from the start.
#[derive(Debug)]
pub struct Builder {
    config: BuilderConfig,
    inodes: Vec<BuildInode>,
    entries: Vec<EntryRec>,
    entry_keys: HashSet<(u32, u32)>,
    contents: Vec<ContentRec>,
    names: IndexSet<BString>,
    symlink_targets: IndexSet<BString>,
    symlink_target_idx: Vec<u32>,
    devices: Vec<u64>,
    modes: IndexSet<u32>,
    uids: IndexSet<u32>,
    gids: IndexSet<u32>,
    total_fs_size: u64,
}

impl Builder {
    pub fn new(config: &BuilderConfig, root_meta: &InodeMeta) -> Self {
        let mut this = Self {
            config: config.clone(),
            inodes: Vec::new(),
            entries: Vec::new(),
            entry_keys: HashSet::new(),
            contents: Vec::new(),
            names: IndexSet::new(),
            symlink_targets: IndexSet::new(),
            symlink_target_idx: Vec::new(),
            devices: Vec::new(),
            modes: IndexSet::new(),
            uids: IndexSet::new(),
            gids: IndexSet::new(),
            total_fs_size: 0,
        };
        this.put_inode(S_IFDIR, Kind::Dir, root_meta, None).expect("first inode");
        // The root's self-link becomes entry 0 in `finish`.
        this
    }

    pub fn root(&self) -> DirId {
        DirId(0)
    }

    fn put_inode(
        &mut self,
        type_bits: u32,
        kind: Kind,
        meta: &InodeMeta,
        content: Option<ContentId>,
    ) -> Result<u32> {
        let orig = u32::try_from(self.inodes.len())
            .map_err(|_| Error::from(ErrorInner::Limit("inode count exceeds 2^32")))?;
        self.inodes.push(BuildInode {
            kind,
            orig,
            mode_idx: self.modes.insert_full(type_bits | meta.perms).0 as u32,
            uid_idx: self.uids.insert_full(meta.uid).0 as u32,
            gid_idx: self.gids.insert_full(meta.gid).0 as u32,
            mtime: meta.mtime,
            atime: meta.atime,
            ctime: meta.ctime,
            content,
        });
        Ok(orig)
    }

    fn put_entry(&mut self, parent: DirId, name: &BStr, child: u32) -> Result<()> {
        u32::try_from(self.entries.len())
            .map_err(|_| Error::from(ErrorInner::Limit("entry count exceeds 2^32")))?;
        let name_idx = self.names.insert_full(name.into()).0 as u32;
        if !self.entry_keys.insert((parent.0, name_idx)) {
            bail!(ErrorInner::DuplicateEntry(name.to_string()));
        }
        self.entries.push(EntryRec { parent: parent.0, name_idx, child });
        Ok(())
    }

    /// Register a chunk stream; files referencing the same content pass
    /// the same id and become shared inodes.
    pub fn add_content(&mut self, chunks: Vec<Chunk>, size: u64) -> Result<ContentId> {
        let id = u32::try_from(self.contents.len())
            .map_err(|_| Error::from(ErrorInner::Limit("content count exceeds 2^32")))?;
        debug_assert_eq!(chunks.iter().map(|c| u64::from(c.size)).sum::<u64>(), size);
        self.contents.push(ContentRec { chunks, size, refs: 0 });
        Ok(ContentId(id))
    }

    pub fn put_dir(&mut self, parent: DirId, name: &BStr, meta: &InodeMeta) -> Result<DirId> {
        let ino = self.put_inode(S_IFDIR, Kind::Dir, meta, None)?;
        self.put_entry(parent, name, ino)?;
        Ok(DirId(ino))
    }

    pub fn put_file(
        &mut self,
        parent: DirId,
        name: &BStr,
        meta: &InodeMeta,
        content: ContentId,
    ) -> Result<()> {
        let ino = self.put_inode(S_IFREG, Kind::File, meta, Some(content))?;
        let rec = &mut self.contents[content.0 as usize];
        rec.refs += 1;
        self.total_fs_size += rec.size;
        self.put_entry(parent, name, ino)
    }

    pub fn put_symlink(
        &mut self,
        parent: DirId,
        name: &BStr,
        meta: &InodeMeta,
        target: &BStr,
    ) -> Result<()> {
        let ino = self.put_inode(S_IFLNK, Kind::Symlink, meta, None)?;
        let tgt_idx = self.symlink_targets.insert_full(target.into()).0 as u32;
        self.symlink_target_idx.push(tgt_idx);
        self.put_entry(parent, name, ino)
    }

    pub fn put_block_device(
        &mut self,
        parent: DirId,
        name: &BStr,
        meta: &InodeMeta,
        rdev: u64,
    ) -> Result<()> {
        let ino = self.put_inode(S_IFBLK, Kind::Device, meta, None)?;
        self.devices.push(rdev);
        self.put_entry(parent, name, ino)
    }

    pub fn put_char_device(
        &mut self,
        parent: DirId,
        name: &BStr,
        meta: &InodeMeta,
        rdev: u64,
    ) -> Result<()> {
        let ino = self.put_inode(S_IFCHR, Kind::Device, meta, None)?;
        self.devices.push(rdev);
        self.put_entry(parent, name, ino)
    }

    pub fn put_fifo(&mut self, parent: DirId, name: &BStr, meta: &InodeMeta) -> Result<()> {
        let ino = self.put_inode(S_IFIFO, Kind::Ipc, meta, None)?;
        self.put_entry(parent, name, ino)
    }

    pub fn put_socket(&mut self, parent: DirId, name: &BStr, meta: &InodeMeta) -> Result<()> {
        let ino = self.put_inode(S_IFSOCK, Kind::Ipc, meta, None)?;
        self.put_entry(parent, name, ino)
    }

    /// Freeze everything into the on-disk metadata model.
    pub fn finish(
        mut self,
        block_size: u32,
        block_categories: Vec<u32>,
        category_names: Vec<BString>,
    ) -> Result<Metadata> {
        let resolution = u64::from(self.config.time_resolution.max(1));

        // Every chunk must lie within a block.
        for rec in &self.contents {
            for c in &rec.chunks {
                if c.offset.checked_add(c.size).is_none_or(|end| end > block_size) {
                    bail!(ErrorInner::Limit("chunk exceeds block size"));
                }
            }
        }

        // Rank shared contents by first appearance among file inodes, so
        // the shared-files table comes out grouped and ascending.
        let mut shared_rank = vec![u32::MAX; self.contents.len()];
        let mut next_rank = 0u32;
        for inode in &self.inodes {
            if let Some(ContentId(c)) = inode.content {
                if self.contents[c as usize].refs >= 2 && shared_rank[c as usize] == u32::MAX {
                    shared_rank[c as usize] = next_rank;
                    next_rank += 1;
                }
            }
        }
        let shared_store_count = next_rank;

        let is_shared = |inode: &BuildInode| {
            inode
                .content
                .is_some_and(|ContentId(c)| self.contents[c as usize].refs >= 2)
        };

        // Stable sort into the kind ranges; shared files additionally
        // group by store rank.
        let sort_key = |inode: &BuildInode| {
            let (kind, sub) = match inode.kind {
                Kind::File if is_shared(inode) => {
                    let ContentId(c) = inode.content.expect("file has content");
                    (3u8, shared_rank[c as usize])
                }
                Kind::Dir => (0, 0),
                Kind::Symlink => (1, 0),
                Kind::File => (2, 0),
                Kind::Device => (4, 0),
                Kind::Ipc => (5, 0),
            };
            (kind, sub, inode.orig)
        };
        self.inodes.sort_by_key(sort_key);

        let mut orig_to_final = vec![0u32; self.inodes.len()];
        for (final_ino, inode) in self.inodes.iter().enumerate() {
            orig_to_final[inode.orig as usize] = final_ino as u32;
        }

        let mut out = Metadata::default();
        out.block_size = block_size;
        out.total_fs_size = self.total_fs_size;
        out.time_resolution = self.config.time_resolution.max(1);
        out.creator = self.config.creator.take().map(BString::from);
        out.create_timestamp = self.config.create_timestamp;
        out.block_categories = block_categories;
        out.category_names = category_names;
        out.options = FsOptions {
            mtime_only: self.config.mtime_only,
            packed_chunk_table: self.config.packing.chunk_table,
            packed_directories: self.config.packing.directories,
            packed_shared_files: self.config.packing.shared_files && shared_store_count > 0,
            packed_names: self.config.packing.names,
            packed_names_index: self.config.packing.names_index,
            packed_symlinks: self.config.packing.symlinks,
            packed_symlinks_index: self.config.packing.symlinks_index,
        };

        //// Times ////

        let quantized = |t: u64| t / resolution;
        let base = self
            .inodes
            .iter()
            .flat_map(|i| {
                let mut times = vec![i.mtime];
                if !self.config.mtime_only {
                    times.extend([i.atime, i.ctime]);
                }
                times
            })
            .map(quantized)
            .min()
            .unwrap_or(0);
        out.timestamp_base = base;
        let offset_of = |t: u64| -> Result<u32> {
            u32::try_from(quantized(t) - base)
                .map_err(|_| ErrorInner::Limit("time spread exceeds 2^32 resolution units").into())
        };

        //// Inodes ////

        out.inodes = self
            .inodes
            .iter()
            .map(|i| {
                let (atime_offset, ctime_offset) = if self.config.mtime_only {
                    (0, 0)
                } else {
                    (offset_of(i.atime)?, offset_of(i.ctime)?)
                };
                Ok(metadata::InodeData {
                    mode_index: i.mode_idx,
                    owner_index: i.uid_idx,
                    group_index: i.gid_idx,
                    mtime_offset: offset_of(i.mtime)?,
                    atime_offset,
                    ctime_offset,
                })
            })
            .collect::<Result<_>>()?;

        //// Directories and entries ////

        let dir_count = self.inodes.iter().take_while(|i| i.kind == Kind::Dir).count();
        debug_assert!(dir_count >= 1, "root always exists");

        let mut entries = vec![EntryRec { parent: 0, name_idx: 0, child: 0 }];
        entries.extend(&self.entries);
        entries[1..].sort_by_key(|e| (e.parent, &self.names[e.name_idx as usize][..]));

        out.directories = vec![metadata::Directory::default(); dir_count + 1];
        let mut cursor = 1u32;
        for (final_ino, inode) in self.inodes[..dir_count].iter().enumerate() {
            out.directories[final_ino].first_entry = cursor;
            // Set by the parent's sweep before we get here (root: 0).
            let self_entry = out.directories[final_ino].self_entry;
            while let Some(ent) =
                entries.get(cursor as usize).filter(|e| e.parent == inode.orig)
            {
                let child_final = orig_to_final[ent.child as usize] as usize;
                if let Some(subdir) = out.directories.get_mut(child_final) {
                    if child_final < dir_count {
                        subdir.self_entry = cursor;
                        subdir.parent_entry = self_entry;
                    }
                }
                cursor += 1;
            }
        }
        debug_assert_eq!(cursor as usize, entries.len(), "every entry belongs to a directory");
        out.directories[dir_count].first_entry = entries.len() as u32;

        out.dir_entries = entries
            .iter()
            .map(|e| metadata::DirEntry {
                name_index: e.name_idx,
                inode_num: orig_to_final[e.child as usize],
            })
            .collect();

        //// Chunk stores ////

        // Unique files first, in final inode order...
        for inode in &self.inodes {
            if inode.kind == Kind::File && !is_shared(inode) {
                let ContentId(c) = inode.content.expect("file has content");
                out.chunk_table.push(out.chunks.len() as u32);
                out.chunks.extend(&self.contents[c as usize].chunks);
            }
        }
        // ...then shared stores in rank order.
        let mut shared_contents: Vec<(u32, u32)> = shared_rank
            .iter()
            .enumerate()
            .filter(|&(_, &r)| r != u32::MAX)
            .map(|(c, &r)| (r, c as u32))
            .collect();
        shared_contents.sort();
        for &(_, c) in &shared_contents {
            out.chunk_table.push(out.chunks.len() as u32);
            out.chunks.extend(&self.contents[c as usize].chunks);
        }
        if !out.chunk_table.is_empty() {
            out.chunk_table.push(out.chunks.len() as u32);
        }

        out.shared_files_table = self
            .inodes
            .iter()
            .filter(|i| i.kind == Kind::File && is_shared(i))
            .map(|i| {
                let ContentId(c) = i.content.expect("file has content");
                shared_rank[c as usize]
            })
            .collect();

        //// Remaining tables ////

        out.symlink_table = self.symlink_target_idx;
        out.devices = self.devices;
        out.modes = self.modes.into_iter().collect();
        out.uids = self.uids.into_iter().collect();
        out.gids = self.gids.into_iter().collect();
        out.names = build_string_table(self.names)?;
        out.symlinks = build_string_table(self.symlink_targets)?;

        Ok(out)
    }
}

fn build_string_table(set: IndexSet<BString>) -> Result<StringTable> {
    let mut out = StringTable::default();
    let total: usize = set.iter().map(|s| s.len()).sum();
    u32::try_from(total)
        .map_err(|_| Error::from(ErrorInner::Limit("string table exceeds 2^32 bytes")))?;
    out.buffer.reserve(total);
    out.index.reserve(set.len());
    for s in set {
        out.buffer.extend_from_slice(&s);
        out.index.push(out.buffer.len() as u32);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const META: InodeMeta = InodeMeta {
        perms: 0o755,
        uid: 1000,
        gid: 100,
        mtime: 1_000_000,
        atime: 1_000_010,
        ctime: 1_000_020,
    };

    fn builder() -> Builder {
        Builder::new(&BuilderConfig::default(), &META)
    }

    #[test]
    fn empty_tree() {
        let m = builder().finish(1 << 16, Vec::new(), Vec::new()).unwrap();
        assert_eq!(m.inodes.len(), 1);
        assert_eq!(m.directories.len(), 2);
        assert_eq!(m.dir_entries.len(), 1);
        assert_eq!(m.directories[0].first_entry, 1);
        assert_eq!(m.directories[1].first_entry, 1);
        assert!(m.chunk_table.is_empty());
        assert_eq!(m.timestamp_base, 1_000_000);
        assert_eq!(m.inodes[0].mtime_offset, 0);
    }

    #[test]
    fn inode_ranges_and_shared_files() {
        let mut b = builder();
        let root = b.root();
        let sub = b.put_dir(root, "sub".into(), &META).unwrap();

        let shared = b
            .add_content(vec![Chunk { block: 0, offset: 0, size: 10 }], 10)
            .unwrap();
        let unique = b
            .add_content(vec![Chunk { block: 0, offset: 10, size: 5 }], 5)
            .unwrap();
        b.put_file(root, "dup1".into(), &META, shared).unwrap();
        b.put_file(sub, "dup2".into(), &META, shared).unwrap();
        b.put_file(root, "solo".into(), &META, unique).unwrap();
        b.put_symlink(root, "link".into(), &META, "solo".into()).unwrap();
        b.put_char_device(root, "tty".into(), &META, 42).unwrap();
        b.put_fifo(root, "pipe".into(), &META).unwrap();

        let m = b.finish(1 << 16, Vec::new(), Vec::new()).unwrap();

        // Ranges: 2 dirs, 1 symlink, 1 unique, 2 shared, 1 device, 1 ipc.
        assert_eq!(m.inodes.len(), 8);
        assert_eq!(m.directories.len(), 3);
        assert_eq!(m.symlink_table.len(), 1);
        assert_eq!(m.shared_files_table, [0, 0]);
        assert_eq!(m.devices, [42]);
        // chunk_table: 1 unique store + 1 shared store + sentinel.
        assert_eq!(m.chunk_table.len(), 3);
        assert_eq!(m.chunks.len(), 2);
        // The unique store's chunks come first.
        assert_eq!(m.chunks[0], Chunk { block: 0, offset: 10, size: 5 });
        assert_eq!(m.chunks[1], Chunk { block: 0, offset: 0, size: 10 });
        assert_eq!(m.total_fs_size, 25);
    }

    #[test]
    fn entries_are_name_sorted_per_directory() {
        let mut b = builder();
        let root = b.root();
        b.put_dir(root, "zzz".into(), &META).unwrap();
        b.put_dir(root, "aaa".into(), &META).unwrap();
        b.put_dir(root, "mmm".into(), &META).unwrap();
        let m = b.finish(1 << 16, Vec::new(), Vec::new()).unwrap();

        let names: Vec<&[u8]> = m.dir_entries[1..]
            .iter()
            .map(|e| m.names.get(e.name_index).unwrap())
            .collect();
        assert_eq!(names, [b"aaa", b"mmm", b"zzz"]);
    }

    #[test]
    fn duplicate_entry_rejected() {
        let mut b = builder();
        let root = b.root();
        b.put_dir(root, "x".into(), &META).unwrap();
        let c = b.add_content(Vec::new(), 0).unwrap();
        assert!(b.put_file(root, "x".into(), &META, c).is_err());
    }

    #[test]
    fn time_quantization() {
        let mut config = BuilderConfig::default();
        config.time_resolution = 3600;
        let mut b = Builder::new(&config, &META);
        let root = b.root();
        let mut late = META;
        late.mtime = 1_000_000 + 7200;
        b.put_dir(root, "later".into(), &META).unwrap();
        b.put_dir(root, "latest".into(), &late).unwrap();
        let m = b.finish(1 << 16, Vec::new(), Vec::new()).unwrap();
        assert_eq!(m.time_resolution, 3600);
        assert_eq!(m.timestamp_base, 1_000_000 / 3600);
        assert_eq!(m.inodes[0].mtime_offset, 0);
        assert_eq!(m.inodes[2].mtime_offset, 2);
    }

    #[test]
    fn pack_flag_parsing() {
        let p = MetadataPacking::parse("chunk_table,names,force").unwrap();
        assert!(p.chunk_table && p.names && p.force);
        assert!(!p.directories && !p.symlinks);

        let all = MetadataPacking::parse("all").unwrap();
        assert!(all.chunk_table && all.names_index && all.symlinks_index && !all.force);

        let plain = MetadataPacking::parse("all,plain").unwrap();
        assert!(plain.chunk_table && !plain.names && !plain.names_index);

        assert!(MetadataPacking::parse("bogus").is_err());
    }

    #[test]
    fn roundtrips_through_serialization() {
        let mut config = BuilderConfig::default();
        config.packing = MetadataPacking::parse("all").unwrap();
        let mut b = Builder::new(&config, &META);
        let root = b.root();
        let c1 = b.add_content(vec![Chunk { block: 0, offset: 0, size: 100 }], 100).unwrap();
        b.put_file(root, "a".into(), &META, c1).unwrap();
        b.put_file(root, "b".into(), &META, c1).unwrap();
        b.put_file(root, "c".into(), &META, c1).unwrap();
        b.put_symlink(root, "s1".into(), &META, "a".into()).unwrap();
        b.put_symlink(root, "s2".into(), &META, "a".into()).unwrap();
        let m = b.finish(1 << 12, vec![0], vec!["<default>".into()]).unwrap();

        let (schema_bytes, meta_bytes) = m.to_schema_and_bytes().unwrap();
        let schema = dwarfs::metadata::Schema::parse(&schema_bytes).unwrap();
        let parsed = Metadata::parse(&schema, &meta_bytes).unwrap();
        assert_eq!(parsed, m);
        assert_eq!(parsed.shared_files_table, [0, 0, 0]);
    }
}
