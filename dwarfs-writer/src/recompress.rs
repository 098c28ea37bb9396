//! Re-encoding an existing image.
//!
//! Recompression streams the sections of an input image into a new one
//! without re-scanning or re-packing file data. What gets re-encoded is
//! selected by [`RecompressMode`] and, for blocks, an optional category
//! filter; everything else is copied with its original compression.
//! Metadata can additionally be re-packed (`--pack-metadata=...,force`),
//! and the opaque image header can be kept, replaced or stripped.
//!
//! Any malformed input section surfaces as an "input filesystem is
//! corrupt" error.

use std::{collections::HashSet, io::Write};

use dwarfs::codec::CodecRegistry;
use dwarfs::positioned_io::{ReadAt, Size};
use dwarfs::section::{HEADER_SIZE, SectionReader, SectionType, VerifyLevel};
use dwarfs::metadata::{Metadata, Schema};

use crate::{
    Error, ErrorInner, Result,
    emit::{CompressorMap, SectionEmitter},
    metadata::MetadataPacking,
};

/// Which parts of the image are re-encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecompressMode {
    /// Blocks and metadata. The default.
    #[default]
    All,
    /// Nothing; sections are copied as-is (the envelope is still
    /// rewritten, e.g. to change the image header).
    None,
    /// Only the metadata sections; blocks are kept.
    Metadata,
    /// Only the blocks; metadata is kept.
    Block,
}

impl std::str::FromStr for RecompressMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "all" => Self::All,
            "none" => Self::None,
            "metadata" => Self::Metadata,
            "block" => Self::Block,
            _ => bail!(Error::bad_args(format!("unknown recompress mode: {s}"))),
        })
    }
}

/// A `--recompress-categories=[!]a,b` filter.
#[derive(Debug, Clone, Default)]
pub struct CategoryFilter {
    negate: bool,
    names: HashSet<String>,
}

impl CategoryFilter {
    pub fn parse(s: &str) -> Self {
        let (negate, list) = match s.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        Self {
            negate,
            names: list.split(',').filter(|n| !n.is_empty()).map(str::to_owned).collect(),
        }
    }

    fn selects(&self, category: &str) -> bool {
        self.names.contains(category) != self.negate
    }
}

#[derive(Debug)]
pub struct RecompressOptions {
    pub mode: RecompressMode,
    pub categories: Option<CategoryFilter>,
    pub default_compression: String,
    pub category_compression: Vec<(String, String)>,
    pub num_workers: usize,
    /// `None` auto-detects the archive start.
    pub image_offset: Option<u64>,
    /// Drop the existing image header.
    pub strip_header: bool,
    /// Replace (or add) the image header.
    pub new_header: Option<Vec<u8>>,
    /// Re-pack metadata with these flags; only honored with `force`.
    pub packing: Option<MetadataPacking>,
    pub history_args: Vec<String>,
}

impl Default for RecompressOptions {
    fn default() -> Self {
        Self {
            mode: RecompressMode::default(),
            categories: None,
            default_compression: "zstd:level=19".to_owned(),
            category_compression: Vec::new(),
            num_workers: 2,
            image_offset: None,
            strip_header: false,
            new_header: None,
            packing: None,
            history_args: Vec::new(),
        }
    }
}

fn corrupt(err: impl std::fmt::Display) -> Error {
    ErrorInner::Corrupt(format!("input filesystem is corrupt: {err}")).into()
}

/// Re-encode `input` into `out`. Returns the writer and the bytes
/// written.
pub fn recompress<R, W>(input: R, out: W, opts: &RecompressOptions) -> Result<(W, u64)>
where
    R: ReadAt + Size,
    W: Write,
{
    let stream_len = input
        .size()?
        .ok_or_else(|| Error::bad_args("cannot size the input image"))?;
    let archive_start = match opts.image_offset {
        Some(n) => n,
        None => {
            let mut probe = SectionReader::new(&input);
            match probe.read_header_at(0) {
                Ok(_) => 0,
                Err(_) => {
                    SectionReader::detect_archive_start(&input, stream_len).map_err(corrupt)?
                }
            }
        }
    };
    let mut rdr = SectionReader::with_archive_start(&input, archive_start);

    let (_, index) = rdr
        .read_section_index(stream_len, 64 << 20)
        .map_err(corrupt)?;

    // Locate and parse the metadata up front; block categories drive the
    // category filter and compressor bindings.
    let find = |ty: SectionType| -> Result<u64> {
        index
            .iter()
            .find(|e| e.section_type() == ty)
            .map(|e| e.offset())
            .ok_or_else(|| corrupt(format_args!("missing section {ty:?}")))
    };
    let (_, schema_bytes) = rdr
        .read_section_at(find(SectionType::METADATA_SCHEMA)?, 64 << 20)
        .map_err(corrupt)?;
    let (_, meta_bytes) = rdr
        .read_section_at(find(SectionType::METADATA)?, 256 << 20)
        .map_err(corrupt)?;
    let schema = Schema::parse(&schema_bytes).map_err(corrupt)?;
    let mut meta = Metadata::parse(&schema, &meta_bytes).map_err(corrupt)?;
    let block_size = meta.block_size as usize;

    let registry = CodecRegistry::default();
    let mut compressors =
        CompressorMap::new(registry.create(&opts.default_compression)?.into());
    let category_id = |name: &str| -> Option<u32> {
        meta.category_names
            .iter()
            .position(|c| c == name.as_bytes())
            .map(|i| i as u32)
    };
    for (cat_name, binding) in &opts.category_compression {
        if let Some(id) = category_id(cat_name) {
            compressors.bind(id, registry.create(binding)?.into());
        }
    }

    let block_selected = |block_no: u32| -> bool {
        match opts.mode {
            RecompressMode::All | RecompressMode::Block => {}
            RecompressMode::None | RecompressMode::Metadata => return false,
        }
        match &opts.categories {
            None => true,
            Some(filter) => {
                let name = meta
                    .block_categories
                    .get(block_no as usize)
                    .and_then(|&c| meta.category_names.get(c as usize))
                    .map_or_else(String::new, |n| n.to_string());
                filter.selects(&name)
            }
        }
    };
    let meta_selected = matches!(opts.mode, RecompressMode::All | RecompressMode::Metadata);
    let repack = opts.packing.filter(|p| p.force);

    let mut emitter = SectionEmitter::new(out, opts.num_workers)?;
    match (&opts.new_header, opts.strip_header) {
        (Some(header), _) => emitter.write_image_header(header)?,
        (None, false) if archive_start > 0 => {
            let mut existing = vec![0u8; archive_start as usize];
            input.read_exact_at(0, &mut existing)?;
            emitter.write_image_header(&existing)?;
        }
        _ => {}
    }

    // Re-serialize metadata when re-packing was requested.
    let new_meta = match repack {
        Some(packing) => {
            meta.options.packed_chunk_table = packing.chunk_table;
            meta.options.packed_directories = packing.directories;
            meta.options.packed_shared_files =
                packing.shared_files && !meta.shared_files_table.is_empty();
            meta.options.packed_names = packing.names;
            meta.options.packed_names_index = packing.names_index;
            meta.options.packed_symlinks = packing.symlinks;
            meta.options.packed_symlinks_index = packing.symlinks_index;
            Some(meta.to_schema_and_bytes()?)
        }
        None => None,
    };

    let mut block_no = 0u32;
    let mut blocks_done = false;
    for ent in &index {
        let ty = ent.section_type();
        if ty == SectionType::SECTION_INDEX {
            continue;
        }
        let header = rdr.read_header_at(ent.offset()).map_err(corrupt)?;
        let raw = rdr
            .read_raw_payload_at(
                &header,
                ent.offset() + HEADER_SIZE,
                stream_len as usize,
                VerifyLevel::Checksum,
            )
            .map_err(corrupt)?;

        if ty == SectionType::BLOCK {
            if blocks_done {
                return Err(corrupt("block section after metadata"));
            }
            let category = meta.block_categories.get(block_no as usize).copied().unwrap_or(0);
            if block_selected(block_no) {
                let data = dwarfs::codec::decompress(header.compression, &raw, block_size)
                    .map_err(corrupt)?;
                let compressor = compressors.for_category(category).clone();
                emitter.submit_block(category, data, &compressor)?;
            } else {
                emitter.submit_raw_block(category, header.compression, raw)?;
            }
            block_no += 1;
            continue;
        }

        if !blocks_done {
            emitter.finish_blocks()?;
            blocks_done = true;
        }

        match ty {
            SectionType::HISTORY => {
                let decompressed =
                    dwarfs::codec::decompress(header.compression, &raw, 64 << 20)
                        .map_err(corrupt)?;
                let mut records: serde_json::Value =
                    serde_json::from_slice(&decompressed).unwrap_or_else(|_| serde_json::json!([]));
                if let Some(arr) = records.as_array_mut() {
                    arr.push(serde_json::json!({
                        "version": meta.creator.as_ref().map(|c| c.to_string()),
                        "arguments": opts.history_args,
                    }));
                }
                emitter.write_tail_section(
                    SectionType::HISTORY,
                    None,
                    records.to_string().as_bytes(),
                )?;
            }
            SectionType::METADATA_SCHEMA | SectionType::METADATA => {
                let payload = match &new_meta {
                    Some((schema_bytes, meta_bytes)) => {
                        if ty == SectionType::METADATA_SCHEMA {
                            schema_bytes.clone()
                        } else {
                            meta_bytes.clone()
                        }
                    }
                    None => dwarfs::codec::decompress(header.compression, &raw, 256 << 20)
                        .map_err(corrupt)?,
                };
                if meta_selected || new_meta.is_some() {
                    let compressor = registry.create(&opts.default_compression)?;
                    emitter.write_tail_section(ty, Some(&*compressor), &payload)?;
                } else {
                    emitter.write_raw_tail_section(ty, header.compression, &raw)?;
                }
            }
            other => {
                // Unknown section types are carried through untouched.
                emitter.write_raw_tail_section(other, header.compression, &raw)?;
            }
        }
    }
    if !blocks_done {
        emitter.finish_blocks()?;
    }

    emitter.finish().map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveWriter, WriterOptions};
    use crate::filter::FilterRules;
    use crate::scan::{ScanOptions, scan_tree};
    use dwarfs::reader::Filesystem;

    fn build_image(compression: &str, header: Option<&[u8]>) -> Vec<u8> {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("d")).unwrap();
        std::fs::write(dir.path().join("d/hello"), b"hello world ".repeat(400)).unwrap();
        let entries =
            scan_tree(dir.path(), &FilterRules::new(), &ScanOptions::default(), None).unwrap();
        let writer = ArchiveWriter::new(WriterOptions {
            block_size_exp: 14,
            default_compression: compression.to_owned(),
            image_header: header.map(<[u8]>::to_vec),
            ..WriterOptions::default()
        })
        .unwrap();
        writer.write(&entries, Vec::new(), |_| {}).unwrap().0
    }

    fn read_back(image: Vec<u8>) -> Vec<u8> {
        let fs = Filesystem::open(image).unwrap();
        let file = fs.find("d/hello").unwrap();
        fs.read_file(file).unwrap()
    }

    #[test]
    fn roundtrip_all_modes() {
        let image = build_image("zstd:level=3", None);
        for mode in ["all", "none", "metadata", "block"] {
            let opts = RecompressOptions {
                mode: mode.parse().unwrap(),
                default_compression: "zstd:level=1".to_owned(),
                ..RecompressOptions::default()
            };
            let (out, _) = recompress(image.clone(), Vec::new(), &opts).unwrap();
            assert_eq!(read_back(out), b"hello world ".repeat(400), "mode={mode}");
        }
    }

    #[test]
    fn header_strip_and_replace() {
        let image = build_image("null", Some(b"#!shebang\n"));
        let fs = Filesystem::open(image.clone()).unwrap();
        assert_eq!(fs.header().unwrap().unwrap(), b"#!shebang\n");
        drop(fs);

        let stripped = recompress(
            image.clone(),
            Vec::new(),
            &RecompressOptions { strip_header: true, ..RecompressOptions::default() },
        )
        .unwrap()
        .0;
        let fs = Filesystem::open(stripped).unwrap();
        assert!(fs.header().unwrap().is_none());
        drop(fs);

        let replaced = recompress(
            image,
            Vec::new(),
            &RecompressOptions {
                new_header: Some(b"NEW".to_vec()),
                ..RecompressOptions::default()
            },
        )
        .unwrap()
        .0;
        let fs = Filesystem::open(replaced).unwrap();
        assert_eq!(fs.header().unwrap().unwrap(), b"NEW");
    }

    #[test]
    fn corrupt_input_is_reported() {
        let mut image = build_image("zstd:level=3", None);
        // Flip a bit inside the first block's payload; the fast checksum
        // catches it.
        image[70] ^= 0x40;
        let err = recompress(image, Vec::new(), &RecompressOptions::default()).unwrap_err();
        assert!(err.is_corrupt(), "{err}");
        assert!(err.to_string().contains("input filesystem is corrupt"));
    }

    #[test]
    fn force_repack_survives() {
        let image = build_image("zstd:level=3", None);
        let mut packing = MetadataPacking::parse("all").unwrap();
        packing.force = true;
        let opts = RecompressOptions {
            mode: "none".parse().unwrap(),
            packing: Some(packing),
            ..RecompressOptions::default()
        };
        let (out, _) = recompress(image, Vec::new(), &opts).unwrap();
        assert_eq!(read_back(out), b"hello world ".repeat(400));
    }
}
