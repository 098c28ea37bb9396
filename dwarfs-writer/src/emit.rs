//! Section emission: compression worker pool and the on-disk section
//! stream.
//!
//! Blocks are compressed on a pool of worker threads but written strictly
//! in finalization order; the pool preserves submission order while
//! letting codecs run in parallel. Tail sections (history, metadata
//! schema, metadata) are written after all blocks have drained, and
//! [`SectionEmitter::finish`] appends the uncompressed section index as
//! the final section.
//!
//! A codec reporting a bad compression ratio (output not smaller than
//! input) fails that invocation; the emitter stores the block
//! uncompressed instead. Any other codec error aborts the build.

use std::{collections::BTreeMap, io::Write, sync::Arc, thread};

use crossbeam_channel as channel;
use dwarfs::codec::Compressor;
use dwarfs::section::{CompressAlgo, Header, SectionIndexEntry, SectionType};
use dwarfs::zerocopy::IntoBytes;

use crate::{ErrorInner, Result};

/// Runs closures on worker threads, yielding results in submission order.
///
/// The job channel is bounded for backpressure; results are stashed until
/// their predecessors have been drained.
pub(crate) struct OrderedPool<R> {
    job_tx: Option<channel::Sender<(u64, Job<R>)>>,
    res_rx: channel::Receiver<(u64, R)>,
    next_submit: u64,
    next_drain: u64,
    stash: BTreeMap<u64, R>,
    threads: Vec<thread::JoinHandle<()>>,
}

type Job<R> = Box<dyn FnOnce() -> R + Send>;

impl<R: Send + 'static> OrderedPool<R> {
    pub(crate) fn new(name: &str, workers: usize) -> std::io::Result<Self> {
        let workers = workers.max(1);
        let (job_tx, job_rx) = channel::bounded::<(u64, Job<R>)>(workers * 2);
        let (res_tx, res_rx) = channel::unbounded();
        let threads = (0..workers)
            .map(|i| {
                let job_rx = job_rx.clone();
                let res_tx = res_tx.clone();
                thread::Builder::new().name(format!("{name}-{i}")).spawn(move || {
                    while let Ok((seq, job)) = job_rx.recv() {
                        if res_tx.send((seq, job())).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect::<std::io::Result<Vec<_>>>()?;
        Ok(Self {
            job_tx: Some(job_tx),
            res_rx,
            next_submit: 0,
            next_drain: 0,
            stash: BTreeMap::new(),
            threads,
        })
    }

    /// Submit a job, then return all results that are ready in order.
    /// Blocks only when the pool is saturated.
    pub(crate) fn submit(
        &mut self,
        job: impl FnOnce() -> R + Send + 'static,
    ) -> impl Iterator<Item = R> + '_ {
        let seq = self.next_submit;
        self.next_submit += 1;
        self.job_tx
            .as_ref()
            .expect("pool is running")
            .send((seq, Box::new(job)))
            .expect("workers are alive");
        while let Ok((seq, res)) = self.res_rx.try_recv() {
            self.stash.insert(seq, res);
        }
        self.drain_ready()
    }

    fn drain_ready(&mut self) -> impl Iterator<Item = R> + '_ {
        std::iter::from_fn(|| {
            let res = self.stash.remove(&self.next_drain)?;
            self.next_drain += 1;
            Some(res)
        })
    }

    /// Wait for and yield every outstanding result, in order.
    pub(crate) fn finish(&mut self) -> impl Iterator<Item = R> + '_ {
        std::iter::from_fn(|| {
            while !self.stash.contains_key(&self.next_drain) {
                if self.next_drain == self.next_submit {
                    return None;
                }
                let (seq, res) = self.res_rx.recv().expect("workers are alive");
                self.stash.insert(seq, res);
            }
            let res = self.stash.remove(&self.next_drain).expect("just checked");
            self.next_drain += 1;
            Some(res)
        })
    }
}

impl<R> Drop for OrderedPool<R> {
    fn drop(&mut self) {
        self.job_tx = None;
        for t in std::mem::take(&mut self.threads) {
            if t.join().is_err() && !thread::panicking() {
                panic!("compression worker panicked");
            }
        }
    }
}

/// Per-category compressor bindings with a default.
#[derive(Clone)]
pub struct CompressorMap {
    default: Arc<dyn Compressor>,
    by_category: Vec<Option<Arc<dyn Compressor>>>,
}

impl std::fmt::Debug for CompressorMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressorMap")
            .field("default", &self.default.describe())
            .field("bound_categories", &self.by_category.iter().flatten().count())
            .finish()
    }
}

impl CompressorMap {
    pub fn new(default: Arc<dyn Compressor>) -> Self {
        Self { default, by_category: Vec::new() }
    }

    pub fn bind(&mut self, category: u32, compressor: Arc<dyn Compressor>) {
        let i = category as usize;
        if self.by_category.len() <= i {
            self.by_category.resize(i + 1, None);
        }
        self.by_category[i] = Some(compressor);
    }

    pub fn for_category(&self, category: u32) -> &Arc<dyn Compressor> {
        self.by_category
            .get(category as usize)
            .and_then(|c| c.as_ref())
            .unwrap_or(&self.default)
    }
}

struct CompressedBlock {
    category: u32,
    algo: CompressAlgo,
    payload: Vec<u8>,
}

/// Writes the section stream of an image.
pub struct SectionEmitter<W> {
    w: W,
    written: u64,
    next_offset: u64,
    index: Vec<SectionIndexEntry>,
    pool: OrderedPool<Result<CompressedBlock>>,
    submitted_blocks: u32,
    block_categories: Vec<u32>,
}

impl<W: std::fmt::Debug> std::fmt::Debug for SectionEmitter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SectionEmitter")
            .field("written", &self.written)
            .field("sections", &self.index.len())
            .field("blocks", &self.submitted_blocks)
            .finish_non_exhaustive()
    }
}

impl<W: Write> SectionEmitter<W> {
    pub fn new(w: W, compress_workers: usize) -> Result<Self> {
        Ok(Self {
            w,
            written: 0,
            next_offset: 0,
            index: Vec::new(),
            pool: OrderedPool::new("dwarfs-compress", compress_workers)?,
            submitted_blocks: 0,
            block_categories: Vec::new(),
        })
    }

    /// Total bytes written so far, including any image header.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Write the opaque image header. Must precede every section; index
    /// offsets stay relative to the first section.
    pub fn write_image_header(&mut self, header: &[u8]) -> Result<()> {
        assert!(self.index.is_empty() && self.submitted_blocks == 0, "header must come first");
        self.w.write_all(header)?;
        self.written += header.len() as u64;
        Ok(())
    }

    /// Queue a filled block for compression. Returns the block number.
    /// Ready predecessors are flushed to the output on the way.
    pub fn submit_block(
        &mut self,
        category: u32,
        data: Vec<u8>,
        compressor: &Arc<dyn Compressor>,
    ) -> Result<u32> {
        let block_no = self.submitted_blocks;
        self.submitted_blocks = block_no
            .checked_add(1)
            .ok_or(ErrorInner::Limit("block count exceeds 2^32"))?;
        self.block_categories.push(category);

        let compressor = Arc::clone(compressor);
        let ready: Vec<_> = self
            .pool
            .submit(move || {
                match compressor.compress(&data) {
                    Ok(payload) => {
                        Ok(CompressedBlock { category, algo: compressor.algo(), payload })
                    }
                    Err(err) if err.is_bad_ratio() => {
                        log::warn!(
                            "{}: {err}; storing block uncompressed",
                            compressor.describe()
                        );
                        Ok(CompressedBlock { category, algo: CompressAlgo::NONE, payload: data })
                    }
                    Err(err) => Err(err.into()),
                }
            })
            .collect();
        for block in ready {
            self.write_block_section(block?)?;
        }
        Ok(block_no)
    }

    /// Queue an already-compressed block payload, preserving block order
    /// with respect to [`submit_block`][Self::submit_block]. Used when
    /// recompressing keeps a block as-is.
    pub fn submit_raw_block(
        &mut self,
        category: u32,
        algo: CompressAlgo,
        payload: Vec<u8>,
    ) -> Result<u32> {
        let block_no = self.submitted_blocks;
        self.submitted_blocks = block_no
            .checked_add(1)
            .ok_or(ErrorInner::Limit("block count exceeds 2^32"))?;
        self.block_categories.push(category);
        let ready: Vec<_> = self
            .pool
            .submit(move || Ok(CompressedBlock { category, algo, payload }))
            .collect();
        for block in ready {
            self.write_block_section(block?)?;
        }
        Ok(block_no)
    }

    /// Drain the compression pool, writing every remaining block.
    pub fn finish_blocks(&mut self) -> Result<()> {
        let rest: Vec<_> = self.pool.finish().collect();
        for block in rest {
            self.write_block_section(block?)?;
        }
        Ok(())
    }

    fn write_block_section(&mut self, block: CompressedBlock) -> Result<()> {
        log::trace!(
            "block {} (category {}): {} bytes compressed",
            self.index.len(),
            block.category,
            block.payload.len(),
        );
        self.write_section(SectionType::BLOCK, block.algo, &block.payload)
    }

    /// Write a tail section, optionally compressed. Call only after
    /// [`finish_blocks`][Self::finish_blocks].
    pub fn write_tail_section(
        &mut self,
        ty: SectionType,
        compressor: Option<&dyn Compressor>,
        payload: &[u8],
    ) -> Result<()> {
        match compressor {
            None => self.write_section(ty, CompressAlgo::NONE, payload),
            Some(c) => match c.compress(payload) {
                Ok(compressed) => self.write_section(ty, c.algo(), &compressed),
                Err(err) if err.is_bad_ratio() => {
                    self.write_section(ty, CompressAlgo::NONE, payload)
                }
                Err(err) => Err(err.into()),
            },
        }
    }

    /// Write a tail section whose payload is already compressed with
    /// `algo` (recompress keep-as-is path).
    pub fn write_raw_tail_section(
        &mut self,
        ty: SectionType,
        algo: CompressAlgo,
        payload: &[u8],
    ) -> Result<()> {
        self.write_section(ty, algo, payload)
    }

    fn write_section(
        &mut self,
        ty: SectionType,
        algo: CompressAlgo,
        payload: &[u8],
    ) -> Result<()> {
        let section_number = u32::try_from(self.index.len())
            .map_err(|_| ErrorInner::Limit("section count exceeds 2^32"))?;
        let entry = SectionIndexEntry::pack(ty, self.next_offset)
            .ok_or(ErrorInner::Limit("image exceeds 2^48 bytes"))?;

        let mut header = Header::new(section_number, ty, algo);
        header.seal(payload);
        self.w.write_all(header.as_bytes())?;
        self.w.write_all(payload)?;

        let len = size_of::<Header>() as u64 + payload.len() as u64;
        self.written += len;
        self.next_offset += len;
        self.index.push(entry);
        Ok(())
    }

    /// The category recorded for each written or queued block.
    pub fn block_categories(&self) -> &[u32] {
        &self.block_categories
    }

    /// Write the section index and return the underlying writer plus the
    /// total bytes written. Call only after
    /// [`finish_blocks`][Self::finish_blocks].
    pub fn finish(mut self) -> Result<(W, u64)> {
        let index_entry = SectionIndexEntry::pack(SectionType::SECTION_INDEX, self.next_offset)
            .ok_or(ErrorInner::Limit("image exceeds 2^48 bytes"))?;
        self.index.push(index_entry);
        let payload: Vec<u8> = self.index.as_bytes().to_vec();
        let section_number = (self.index.len() - 1) as u32;
        let mut header = Header::new(section_number, SectionType::SECTION_INDEX, CompressAlgo::NONE);
        header.seal(&payload);
        self.w.write_all(header.as_bytes())?;
        self.w.write_all(&payload)?;
        self.written += size_of::<Header>() as u64 + payload.len() as u64;
        self.w.flush()?;
        Ok((self.w, self.written))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dwarfs::codec::CodecRegistry;
    use dwarfs::section::SectionReader;

    #[test]
    fn pool_preserves_submission_order() {
        let mut pool: OrderedPool<u64> = OrderedPool::new("t", 4).unwrap();
        let mut got = Vec::new();
        for i in 0..64u64 {
            // Stagger job runtimes so completion order scrambles.
            got.extend(pool.submit(move || {
                std::thread::sleep(std::time::Duration::from_millis((i % 7) * 3));
                i
            }));
        }
        got.extend(pool.finish());
        assert_eq!(got, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn emits_blocks_in_order_with_index() {
        let registry = CodecRegistry::default();
        let zstd: Arc<dyn Compressor> = registry.create("zstd:level=3").unwrap().into();
        let mut em = SectionEmitter::new(Vec::new(), 4).unwrap();
        for i in 0..10u8 {
            let block = vec![i; 8192];
            assert_eq!(em.submit_block(0, block, &zstd).unwrap(), u32::from(i));
        }
        em.finish_blocks().unwrap();
        em.write_tail_section(SectionType::HISTORY, None, b"[]").unwrap();
        let (image, written) = em.finish().unwrap();
        let image_len = image.len() as u64;
        assert_eq!(written, image_len);

        let mut rdr = SectionReader::new(image);
        let (_, index) = rdr.read_section_index(image_len, 1 << 20).unwrap();
        assert_eq!(index.len(), 12);

        // Offsets and lengths tile the image exactly.
        let mut expect_offset = 0;
        for (i, ent) in index.iter().enumerate() {
            assert_eq!(ent.offset(), expect_offset);
            let header = rdr.read_header_at(ent.offset()).unwrap();
            assert_eq!(header.section_number.get(), i as u32);
            expect_offset += size_of::<Header>() as u64 + header.payload_size.get();
        }
        assert_eq!(expect_offset, image_len);

        // Each block decompresses back to its fill byte.
        for (i, ent) in index.iter().take(10).enumerate() {
            let (_, data) = rdr.read_section_at(ent.offset(), 1 << 20).unwrap();
            assert_eq!(data, vec![i as u8; 8192]);
        }
    }

    #[test]
    fn incompressible_block_is_stored_raw() {
        let registry = CodecRegistry::default();
        let zstd: Arc<dyn Compressor> = registry.create("zstd:level=19").unwrap().into();
        let mut em = SectionEmitter::new(Vec::new(), 2).unwrap();
        let mut x = 1u64;
        let noise: Vec<u8> = std::iter::repeat_with(|| {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
            (x >> 33) as u8
        })
        .take(4096)
        .collect();
        em.submit_block(0, noise.clone(), &zstd).unwrap();
        em.finish_blocks().unwrap();
        let (image, _) = em.finish().unwrap();

        let mut rdr = SectionReader::new(image);
        let header = rdr.read_header_at(0).unwrap();
        assert_eq!(header.compression, CompressAlgo::NONE);
        let (_, data) = rdr.read_section_at(0, 1 << 20).unwrap();
        assert_eq!(data, noise);
    }
}
