//! Per-category block assembly.
//!
//! Each category accumulates its own block of `1 << block_size_exp`
//! decompressed bytes; fragments are split across block boundaries as
//! needed. Blocks are handed to the emitter the moment they fill, so
//! global block numbers reflect fill order across categories. Chunks are
//! first recorded against `(category, per-category block sequence)` and
//! resolved to global block numbers once packing ends.

use std::io::Write;

use dwarfs::metadata::Chunk;

use crate::{
    Result,
    emit::{CompressorMap, SectionEmitter},
};

/// A chunk whose global block number is not known yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingChunk {
    category: u32,
    /// Sequence number of the block within its category.
    seq: u32,
    offset: u32,
    size: u32,
}

#[derive(Debug, Default)]
struct CategoryState {
    buf: Vec<u8>,
    seq: u32,
    /// Global block number of each flushed block of this category.
    flushed: Vec<u32>,
}

/// Assembles fragment bytes into fixed-size blocks per category.
#[derive(Debug)]
pub struct BlockPacker {
    block_size: u32,
    categories: Vec<CategoryState>,
}

impl BlockPacker {
    pub fn new(block_size_exp: u32) -> Self {
        Self { block_size: 1 << block_size_exp, categories: Vec::new() }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    fn category(&mut self, category: u32) -> &mut CategoryState {
        let i = category as usize;
        if self.categories.len() <= i {
            self.categories.resize_with(i + 1, CategoryState::default);
        }
        &mut self.categories[i]
    }

    /// Append `data` to the category's block stream, flushing blocks as
    /// they fill. Returns the recorded chunks (merged when contiguous).
    pub fn append<W: Write>(
        &mut self,
        emitter: &mut SectionEmitter<W>,
        compressors: &CompressorMap,
        category: u32,
        mut data: &[u8],
    ) -> Result<Vec<PendingChunk>> {
        let block_size = self.block_size as usize;
        let mut chunks = Vec::new();
        while !data.is_empty() {
            let cat = self.category(category);
            let room = block_size - cat.buf.len();
            let take = room.min(data.len());
            let offset = cat.buf.len() as u32;
            if cat.buf.is_empty() {
                cat.buf.reserve_exact(block_size);
            }
            cat.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            chunks.push(PendingChunk {
                category,
                seq: cat.seq,
                offset,
                size: take as u32,
            });
            if cat.buf.len() == block_size {
                self.flush_category(emitter, compressors, category)?;
            }
        }
        Ok(chunks)
    }

    fn flush_category<W: Write>(
        &mut self,
        emitter: &mut SectionEmitter<W>,
        compressors: &CompressorMap,
        category: u32,
    ) -> Result<()> {
        let compressor = compressors.for_category(category).clone();
        let cat = self.category(category);
        debug_assert!(!cat.buf.is_empty());
        let data = std::mem::take(&mut cat.buf);
        cat.seq += 1;
        let block_no = emitter.submit_block(category, data, &compressor)?;
        self.category(category).flushed.push(block_no);
        Ok(())
    }

    /// Flush every partial block, in category id order.
    pub fn finish<W: Write>(
        &mut self,
        emitter: &mut SectionEmitter<W>,
        compressors: &CompressorMap,
    ) -> Result<()> {
        for category in 0..self.categories.len() as u32 {
            if !self.categories[category as usize].buf.is_empty() {
                self.flush_category(emitter, compressors, category)?;
            }
        }
        Ok(())
    }

    /// Resolve a pending chunk to its final `(block, offset, size)`.
    /// Valid only after [`finish`][Self::finish].
    pub fn resolve(&self, pending: PendingChunk) -> Chunk {
        let block = self.categories[pending.category as usize].flushed[pending.seq as usize];
        Chunk { block, offset: pending.offset, size: pending.size }
    }

    /// Resolve a whole stream, merging chunks that stayed contiguous
    /// within one block.
    pub fn resolve_all(&self, pending: &[PendingChunk]) -> Vec<Chunk> {
        let mut out: Vec<Chunk> = Vec::with_capacity(pending.len());
        for &p in pending {
            let c = self.resolve(p);
            match out.last_mut() {
                Some(prev) if prev.block == c.block && prev.offset + prev.size == c.offset => {
                    prev.size += c.size;
                }
                _ => out.push(c),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dwarfs::codec::{CodecRegistry, Compressor};
    use std::sync::Arc;

    fn null_map() -> CompressorMap {
        let null: Arc<dyn Compressor> = CodecRegistry::default().create("null").unwrap().into();
        CompressorMap::new(null)
    }

    #[test]
    fn splits_across_blocks() {
        // 4 KiB blocks.
        let mut packer = BlockPacker::new(12);
        let map = null_map();
        let mut em = SectionEmitter::new(Vec::new(), 1).unwrap();

        let big = vec![7u8; 10_000];
        let pending = packer.append(&mut em, &map, 0, &big).unwrap();
        let small = packer.append(&mut em, &map, 0, b"tail").unwrap();
        packer.finish(&mut em, &map).unwrap();
        em.finish_blocks().unwrap();

        let chunks = packer.resolve_all(&pending);
        assert_eq!(
            chunks,
            [
                Chunk { block: 0, offset: 0, size: 4096 },
                Chunk { block: 1, offset: 0, size: 4096 },
                Chunk { block: 2, offset: 0, size: 10_000 - 8192 },
            ]
        );
        assert_eq!(
            packer.resolve_all(&small),
            [Chunk { block: 2, offset: 1808, size: 4 }]
        );
        assert_eq!(em.block_categories(), [0, 0, 0]);
    }

    #[test]
    fn categories_do_not_interleave_within_blocks() {
        let mut packer = BlockPacker::new(12);
        let map = null_map();
        let mut em = SectionEmitter::new(Vec::new(), 1).unwrap();

        // Alternate appends between two categories; each category's data
        // must stay contiguous in its own blocks.
        let mut a_pending = Vec::new();
        let mut b_pending = Vec::new();
        for i in 0..6u8 {
            a_pending.extend(packer.append(&mut em, &map, 0, &vec![i; 1500]).unwrap());
            b_pending.extend(packer.append(&mut em, &map, 1, &vec![i | 0x80; 1500]).unwrap());
        }
        packer.finish(&mut em, &map).unwrap();
        em.finish_blocks().unwrap();

        let a = packer.resolve_all(&a_pending);
        let b = packer.resolve_all(&b_pending);
        let a_blocks: Vec<u32> = a.iter().map(|c| c.block).collect();
        let b_blocks: Vec<u32> = b.iter().map(|c| c.block).collect();
        assert!(a_blocks.iter().all(|b| !b_blocks.contains(b)));

        // 9000 bytes per category: two full 4 KiB blocks each flushed
        // in alternating fill order, partials last.
        assert_eq!(em.block_categories(), [0, 1, 0, 1, 0, 1]);

        // Merged chunks reassemble to the original sizes.
        assert_eq!(a.iter().map(|c| u64::from(c.size)).sum::<u64>(), 9000);
        assert_eq!(b.iter().map(|c| u64::from(c.size)).sum::<u64>(), 9000);
    }
}
