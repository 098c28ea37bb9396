//! The build orchestrator: scan results in, finished image out.
//!
//! [`ArchiveWriter::write`] runs the full pipeline over a scanned entry
//! list: split each regular file into categorized fragments, hash every
//! fragment with the configured file hash so equal fragments collapse to
//! one chunk stream, order the unique fragments, pack them into
//! per-category blocks, then emit blocks, history, metadata and the
//! section index. Files made of the same fragment sequence share one
//! store and become shared inodes; whole-file deduplication is just the
//! single-default-fragment case of that. File contents are read twice
//! (once for hashing and ordering sketches, once for packing) so the
//! whole input never has to be resident.

use std::{
    collections::{HashMap, hash_map::Entry},
    fs,
    io::Write,
};

use bstr::{BStr, BString, ByteSlice};
use dwarfs::codec::CodecRegistry;
use dwarfs::metadata::Chunk;
use dwarfs::section::SectionType;

use crate::{
    Error, ErrorInner, Result,
    categorize::{CategorizerSet, CategoryRegistry},
    dedup::{Deduper, FileHash},
    emit::{CompressorMap, SectionEmitter},
    metadata::{Builder, BuilderConfig, DirId},
    order::{OrderKey, OrderMode, order_fragments, sketch},
    pack::{BlockPacker, PendingChunk},
    scan::{EntryKind, ScanEntry},
};

/// Content-defined sub-chunking parameters (FastCDC).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CdcConfig {
    pub min_size: u32,
    pub avg_size: u32,
    pub max_size: u32,
}

impl Default for CdcConfig {
    fn default() -> Self {
        Self { min_size: 16 << 10, avg_size: 64 << 10, max_size: 256 << 10 }
    }
}

/// Everything `mkdwarfs` can configure about a build.
#[derive(Debug)]
pub struct WriterOptions {
    /// Blocks hold `1 << block_size_exp` decompressed bytes; valid range
    /// 12 through 28.
    pub block_size_exp: u32,
    /// Default compressor binding, e.g. `zstd:level=19`.
    pub default_compression: String,
    /// Per-category bindings as `(category, binding)` pairs.
    pub category_compression: Vec<(String, String)>,
    /// Comma separated categorizer list (`--categorize`).
    pub categorize: Option<String>,
    pub order: OrderMode,
    /// Threshold for the similarity ordering's large-file fast path.
    pub max_similarity_size: Option<u64>,
    pub file_hash: FileHash,
    /// Optional content-defined sub-chunk deduplication.
    pub cdc: Option<CdcConfig>,
    pub num_workers: usize,
    pub builder: BuilderConfig,
    /// Opaque bytes prepended before section 0.
    pub image_header: Option<Vec<u8>>,
    /// Command line recorded in the history section.
    pub history_args: Vec<String>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            block_size_exp: 24,
            default_compression: "zstd:level=19".to_owned(),
            category_compression: Vec::new(),
            categorize: None,
            order: OrderMode::default(),
            max_similarity_size: None,
            file_hash: FileHash::default(),
            cdc: None,
            num_workers: 2,
            builder: BuilderConfig::default(),
            image_header: None,
            history_args: Vec::new(),
        }
    }
}

/// Counters reported after a build.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BuildStats {
    pub dirs: u64,
    pub files: u64,
    pub symlinks: u64,
    pub specials: u64,
    pub original_bytes: u64,
    pub duplicate_bytes: u64,
    pub blocks: u32,
    pub image_bytes: u64,
}

/// Build progress notifications, for progress bars.
#[derive(Debug, Clone, Copy)]
pub enum BuildEvent<'a> {
    Stage(&'a str),
    /// Input bytes consumed by the packer so far.
    PackedBytes(u64),
}

/// One regular file's place in the pipeline.
struct FileRec {
    entry: u32,
    /// Index into `contents`; shared by files with identical fragments.
    content: u32,
}

/// A distinct file content: the sequence of unique fragments making it
/// up. Two files with the same sequence share one chunk stream and
/// become shared inodes.
struct ContentRec {
    fragment_ids: Vec<u32>,
}

/// One unique fragment: where to re-read its bytes from, and the chunks
/// it packed into.
struct FragmentRec {
    /// First file seen containing this fragment.
    entry: u32,
    offset: u64,
    len: u64,
    category: u32,
    /// Filled in pack order.
    pending: Vec<PendingChunk>,
}

/// The writer pipeline. See the [module documentation][self].
#[derive(Debug)]
pub struct ArchiveWriter {
    options: WriterOptions,
}

impl ArchiveWriter {
    pub fn new(options: WriterOptions) -> Result<Self> {
        if !(12..=28).contains(&options.block_size_exp) {
            bail!(Error::bad_args(format!(
                "block size exponent {} out of range 12..=28",
                options.block_size_exp
            )));
        }
        if options.builder.time_resolution == 0 {
            bail!(Error::bad_args("time resolution must be positive"));
        }
        Ok(Self { options })
    }

    pub fn options(&self) -> &WriterOptions {
        &self.options
    }

    /// Run the pipeline over scanned entries, writing the image to `out`.
    pub fn write<W: Write>(
        &self,
        entries: &[ScanEntry],
        out: W,
        progress: impl FnMut(BuildEvent<'_>),
    ) -> Result<(W, BuildStats)> {
        let categorizers = match &self.options.categorize {
            Some(names) => CategorizerSet::from_names(names)?,
            None => CategorizerSet::default(),
        };
        self.write_with_categorizers(entries, out, categorizers, progress)
    }

    /// Like [`write`][Self::write], but with an explicit categorizer set,
    /// for callers plugging in their own
    /// [`Categorizer`][crate::categorize::Categorizer]s.
    pub fn write_with_categorizers<W: Write>(
        &self,
        entries: &[ScanEntry],
        out: W,
        categorizers: CategorizerSet,
        mut progress: impl FnMut(BuildEvent<'_>),
    ) -> Result<(W, BuildStats)> {
        let opts = &self.options;
        let registry = CodecRegistry::default();
        let mut categories = CategoryRegistry::default();

        let mut stats = BuildStats::default();
        for ent in entries {
            match ent.kind {
                EntryKind::Dir => stats.dirs += 1,
                EntryKind::File { size } => {
                    stats.files += 1;
                    stats.original_bytes += size;
                }
                EntryKind::Symlink { .. } => stats.symlinks += 1,
                _ => stats.specials += 1,
            }
        }

        //// Stage 1: categorize, then dedup each fragment ////

        progress(BuildEvent::Stage("hashing"));
        let mut deduper = Deduper::new(opts.file_hash);
        let mut files: Vec<FileRec> = Vec::new();
        let mut contents: Vec<ContentRec> = Vec::new();
        let mut fragments: Vec<FragmentRec> = Vec::new();
        let mut frag_keys: Vec<OrderKey> = Vec::new();
        // Fragment-id sequence -> content, so files made of the same
        // fragments share one store.
        let mut content_by_fragments: HashMap<Vec<u32>, u32> = HashMap::new();

        for (entry_idx, ent) in entries.iter().enumerate() {
            if !ent.is_file() {
                continue;
            }
            let data = fs::read(&ent.path)?;
            let tagged = categorizers.categorize(ent.name.as_bstr(), &data, &mut categories);
            let mut ids = Vec::with_capacity(tagged.len());
            for frag in &tagged {
                let range = frag.offset as usize..(frag.offset + frag.len) as usize;
                let bytes = &data[range];
                let id = match deduper.dedup(bytes, fragments.len() as u32) {
                    Some(existing) => existing,
                    None => {
                        let id = fragments.len() as u32;
                        fragments.push(FragmentRec {
                            entry: entry_idx as u32,
                            offset: frag.offset,
                            len: frag.len,
                            category: frag.category,
                            pending: Vec::new(),
                        });
                        frag_keys.push(OrderKey {
                            path: entry_rel_path(entries, entry_idx as u32),
                            size: frag.len,
                            sketch: sketch(bytes),
                            digest: crate::nilsimsa::digest(bytes),
                        });
                        id
                    }
                };
                ids.push(id);
            }
            let content = match content_by_fragments.entry(ids) {
                Entry::Occupied(found) => *found.get(),
                Entry::Vacant(slot) => {
                    let content = contents.len() as u32;
                    contents.push(ContentRec { fragment_ids: slot.key().clone() });
                    slot.insert(content);
                    content
                }
            };
            files.push(FileRec { entry: entry_idx as u32, content });
        }
        stats.duplicate_bytes = deduper.duplicate_bytes;

        //// Stage 2: order ////

        progress(BuildEvent::Stage("ordering"));
        let perm = order_fragments(opts.order, opts.max_similarity_size, &frag_keys);

        //// Stage 3: pack + compress ////

        progress(BuildEvent::Stage("packing"));
        let mut emitter = SectionEmitter::new(out, opts.num_workers)?;
        if let Some(header) = &opts.image_header {
            emitter.write_image_header(header)?;
        }
        let mut compressors = CompressorMap::new(registry.create(&opts.default_compression)?.into());
        for (cat_name, binding) in &opts.category_compression {
            let id = categories.intern(cat_name);
            compressors.bind(id, registry.create(binding)?.into());
        }

        let mut packer = BlockPacker::new(opts.block_size_exp);
        // Sub-fragment pieces feed the same configured-hash dedup.
        let mut cdc_dedup = Deduper::new(opts.file_hash);
        let mut cdc_chunks: Vec<Vec<PendingChunk>> = Vec::new();
        let mut packed_bytes = 0u64;
        for &fid in &perm {
            let rec = &fragments[fid as usize];
            let data = fs::read(&entries[rec.entry as usize].path)?;
            let lo = (rec.offset as usize).min(data.len());
            let hi = ((rec.offset + rec.len) as usize).min(data.len());
            let category = rec.category;
            let slice = &data[lo..hi];

            let pending = match opts.cdc {
                None => packer.append(&mut emitter, &compressors, category, slice)?,
                Some(cdc) => {
                    let mut pending = Vec::new();
                    for piece in
                        fastcdc::v2020::FastCDC::new(slice, cdc.min_size, cdc.avg_size, cdc.max_size)
                    {
                        let bytes = &slice[piece.offset..piece.offset + piece.length];
                        match cdc_dedup.dedup(bytes, cdc_chunks.len() as u32) {
                            Some(id) => pending.extend_from_slice(&cdc_chunks[id as usize]),
                            None => {
                                let chunks = packer.append(
                                    &mut emitter,
                                    &compressors,
                                    category,
                                    bytes,
                                )?;
                                cdc_chunks.push(chunks.clone());
                                pending.extend(chunks);
                            }
                        }
                    }
                    pending
                }
            };
            packed_bytes += slice.len() as u64;
            progress(BuildEvent::PackedBytes(packed_bytes));
            fragments[fid as usize].pending = pending;
        }
        packer.finish(&mut emitter, &compressors)?;
        emitter.finish_blocks()?;
        stats.duplicate_bytes += cdc_dedup.duplicate_bytes;
        stats.blocks = emitter.block_categories().len() as u32;

        //// Stage 4: metadata ////

        progress(BuildEvent::Stage("metadata"));
        let mut builder = Builder::new(&opts.builder, &entries[0].meta);
        let mut content_ids = vec![None; contents.len()];
        let mut dir_ids: Vec<Option<DirId>> = vec![None; entries.len()];
        dir_ids[0] = Some(builder.root());
        let mut file_cursor = 0usize;
        for (entry_idx, ent) in entries.iter().enumerate().skip(1) {
            let parent = dir_ids[ent.parent as usize]
                .expect("scan produces parents before children");
            let name = ent.name.as_bstr();
            match &ent.kind {
                EntryKind::Dir => {
                    dir_ids[entry_idx] = Some(builder.put_dir(parent, name, &ent.meta)?);
                }
                EntryKind::File { .. } => {
                    let rec = &files[file_cursor];
                    file_cursor += 1;
                    debug_assert_eq!(rec.entry as usize, entry_idx);
                    let content = rec.content as usize;
                    let id = match content_ids[content] {
                        Some(id) => id,
                        None => {
                            let chunks =
                                resolve_content(&packer, &fragments, &contents[content]);
                            let size =
                                chunks.iter().map(|c| u64::from(c.size)).sum::<u64>();
                            let id = builder.add_content(chunks, size)?;
                            content_ids[content] = Some(id);
                            id
                        }
                    };
                    builder.put_file(parent, name, &ent.meta, id)?;
                }
                EntryKind::Symlink { target } => {
                    builder.put_symlink(parent, name, &ent.meta, target.as_bstr())?;
                }
                EntryKind::BlockDev { rdev } => {
                    builder.put_block_device(parent, name, &ent.meta, *rdev)?;
                }
                EntryKind::CharDev { rdev } => {
                    builder.put_char_device(parent, name, &ent.meta, *rdev)?;
                }
                EntryKind::Fifo => builder.put_fifo(parent, name, &ent.meta)?,
                EntryKind::Socket => builder.put_socket(parent, name, &ent.meta)?,
            }
        }

        if let Ok(path) = std::env::var("DWARFS_DUMP_INODES") {
            dump_inodes(&path, entries, &files, &contents, &fragments, &packer)?;
        }

        let category_names: Vec<BString> =
            categories.iter().map(BString::from).collect();
        let block_categories = emitter.block_categories().to_vec();
        let meta =
            builder.finish(packer.block_size(), block_categories, category_names)?;

        //// Stage 5: tail sections ////

        let history = serde_json::json!([{
            "version": meta.creator.as_ref().map(|c| c.to_string()),
            "timestamp": opts.builder.create_timestamp,
            "arguments": opts.history_args,
        }]);
        emitter.write_tail_section(
            SectionType::HISTORY,
            None,
            history.to_string().as_bytes(),
        )?;

        let (schema_bytes, meta_bytes) = meta.to_schema_and_bytes()?;
        let tail_compressor = registry.create(&opts.default_compression)?;
        emitter.write_tail_section(
            SectionType::METADATA_SCHEMA,
            Some(&*tail_compressor),
            &schema_bytes,
        )?;
        emitter.write_tail_section(SectionType::METADATA, Some(&*tail_compressor), &meta_bytes)?;

        let (w, written) = emitter.finish()?;
        stats.image_bytes = written;
        Ok((w, stats))
    }
}

fn resolve_content(
    packer: &BlockPacker,
    fragments: &[FragmentRec],
    rec: &ContentRec,
) -> Vec<Chunk> {
    let mut pending = Vec::new();
    for &fid in &rec.fragment_ids {
        pending.extend_from_slice(&fragments[fid as usize].pending);
    }
    packer.resolve_all(&pending)
}

/// Reconstruct an entry's path relative to the scan root.
fn entry_rel_path(entries: &[ScanEntry], mut idx: u32) -> BString {
    let mut parts: Vec<&BStr> = Vec::new();
    while idx != 0 {
        let ent = &entries[idx as usize];
        parts.push(ent.name.as_bstr());
        idx = ent.parent;
    }
    let mut out = BString::default();
    for part in parts.iter().rev() {
        if !out.is_empty() {
            out.push(b'/');
        }
        out.extend_from_slice(part);
    }
    out
}

fn dump_inodes(
    path: &str,
    entries: &[ScanEntry],
    files: &[FileRec],
    contents: &[ContentRec],
    fragments: &[FragmentRec],
    packer: &BlockPacker,
) -> Result<()> {
    let mut out = std::io::BufWriter::new(fs::File::create(path)?);
    for rec in files {
        let content = &contents[rec.content as usize];
        let chunks = resolve_content(packer, fragments, content);
        let size = chunks.iter().map(|c| u64::from(c.size)).sum::<u64>();
        writeln!(
            out,
            "ino={} path={} size={} fragments={} chunks={:?}",
            rec.entry,
            entry_rel_path(entries, rec.entry),
            size,
            content.fragment_ids.len(),
            chunks,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterRules;
    use crate::scan::{ScanOptions, scan_tree};

    fn write_tree(files: &[(&str, &[u8])]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (path, content) in files {
            let p = dir.path().join(path);
            fs::create_dir_all(p.parent().unwrap()).unwrap();
            fs::write(p, content).unwrap();
        }
        dir
    }

    fn build(dir: &std::path::Path, options: WriterOptions) -> (Vec<u8>, BuildStats) {
        let entries =
            scan_tree(dir, &FilterRules::new(), &ScanOptions::default(), None).unwrap();
        let writer = ArchiveWriter::new(options).unwrap();
        let (image, stats) = writer.write(&entries, Vec::new(), |_| {}).unwrap();
        (image, stats)
    }

    #[test]
    fn dedup_makes_block_bytes_independent_of_copies() {
        let payload = b"some moderately compressible payload ".repeat(64);
        let one = write_tree(&[("a/file0", &payload)]);
        let many = write_tree(&[
            ("a/file0", &payload[..]),
            ("b/file1", &payload[..]),
            ("c/file2", &payload[..]),
            ("d/file3", &payload[..]),
        ]);

        let opts = || WriterOptions {
            block_size_exp: 16,
            default_compression: "null".into(),
            ..WriterOptions::default()
        };
        let (_, stats_one) = build(one.path(), opts());
        let (_, stats_many) = build(many.path(), opts());
        assert_eq!(stats_one.blocks, stats_many.blocks);
        assert_eq!(stats_many.duplicate_bytes, 3 * payload.len() as u64);
        assert_eq!(stats_many.files, 4);
    }

    #[test]
    fn deterministic_output_for_stable_orders() {
        let tree = write_tree(&[
            ("x/one.txt", b"1111111111".repeat(100).as_slice()),
            ("y/two.txt", b"2222222222".repeat(200).as_slice()),
            ("z/three.txt", b"3333333333".repeat(50).as_slice()),
        ]);
        for order in ["none", "path", "revpath", "nilsimsa"] {
            let mk = || WriterOptions {
                block_size_exp: 14,
                order: order.parse().unwrap(),
                builder: BuilderConfig {
                    create_timestamp: Some(7),
                    ..BuilderConfig::default()
                },
                ..WriterOptions::default()
            };
            let (a, _) = build(tree.path(), mk());
            let (b, _) = build(tree.path(), mk());
            assert_eq!(a, b, "order={order} must be byte-identical");
        }
    }

    #[test]
    fn fragments_dedup_across_differing_files() {
        use crate::categorize::{Categorizer, CategoryRegistry, Fragment};
        use bstr::BStr;

        // Splits files into a fixed-size head and a tagged tail, the way
        // an audio categorizer separates metadata from waveform data.
        struct SplitAt(u64);

        impl Categorizer for SplitAt {
            fn name(&self) -> &'static str {
                "split"
            }

            fn categorize(
                &self,
                _path: &BStr,
                data: &[u8],
                categories: &mut CategoryRegistry,
            ) -> Option<Vec<Fragment>> {
                if (data.len() as u64) <= self.0 {
                    return None;
                }
                let tail = categories.intern("tail");
                Some(vec![
                    Fragment { offset: 0, len: self.0, category: 0 },
                    Fragment { offset: self.0, len: data.len() as u64 - self.0, category: tail },
                ])
            }
        }

        // Two files with different heads but an identical tail payload.
        let payload = b"waveform ".repeat(1000);
        let mut a = b"A".repeat(4096);
        a.extend_from_slice(&payload);
        let mut b = b"B".repeat(4096);
        b.extend_from_slice(&payload);
        let tree = write_tree(&[("a.wav", &a[..]), ("b.wav", &b)]);
        let entries =
            scan_tree(tree.path(), &FilterRules::new(), &ScanOptions::default(), None).unwrap();

        let writer = ArchiveWriter::new(WriterOptions {
            block_size_exp: 16,
            default_compression: "null".into(),
            ..WriterOptions::default()
        })
        .unwrap();
        let mut categorizers = CategorizerSet::default();
        categorizers.push(Box::new(SplitAt(4096)));
        let (image, stats) = writer
            .write_with_categorizers(&entries, Vec::new(), categorizers, |_| {})
            .unwrap();

        // The shared tail fragment is stored once even though the whole
        // files differ.
        assert_eq!(stats.duplicate_bytes, payload.len() as u64);

        let fs_ = dwarfs::Filesystem::open(image).unwrap();
        assert_eq!(fs_.read_file(fs_.find("a.wav").unwrap()).unwrap(), a);
        assert_eq!(fs_.read_file(fs_.find("b.wav").unwrap()).unwrap(), b);
    }

    #[test]
    fn cdc_dedups_shifted_content() {
        let mut base = Vec::new();
        let mut x = 7u64;
        for _ in 0..(1 << 20) {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            base.push((x >> 33) as u8);
        }
        // The second file is the first with a small prefix insertion, so
        // fixed chunking would share nothing.
        let mut shifted = b"prefix".to_vec();
        shifted.extend_from_slice(&base);
        let tree = write_tree(&[("a", &base[..]), ("b", &shifted)]);

        let opts = WriterOptions {
            block_size_exp: 20,
            default_compression: "null".into(),
            cdc: Some(CdcConfig::default()),
            ..WriterOptions::default()
        };
        let (_, stats) = build(tree.path(), opts);
        // Nearly all of the second file dedups against the first.
        assert!(
            stats.duplicate_bytes > (base.len() / 2) as u64,
            "duplicate_bytes={}",
            stats.duplicate_bytes
        );
    }
}
