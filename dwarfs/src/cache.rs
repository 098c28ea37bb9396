//! The concurrent decompressing block cache.
//!
//! The cache serves arbitrary byte ranges out of logically-decompressed
//! blocks. [`BlockCache::get`] returns a [`RangeFuture`] immediately;
//! decompression happens on a worker pool, and waiting on the future
//! blocks only until the requested range has been decoded, not until the
//! whole block is done (frame-incremental decode).
//!
//! Guarantees:
//!
//! - **Single flight**: any number of concurrent `get`s for one block
//!   trigger at most one decompression.
//! - **Bounded residency**: decompressed bytes are capped at
//!   [`CacheOptions::max_bytes`], evicting least-recently-used ready
//!   blocks. Blocks pinned by a live [`BlockRange`] are never reclaimed;
//!   when nothing can be evicted the allocator blocks until a pin is
//!   released, or fails with a cache-full error under
//!   [`FullPolicy::Fail`].
//! - **Pinned views**: a resolved [`BlockRange`] keeps its block's buffer
//!   alive even if the block is evicted from the cache meanwhile.
//!
//! An optional tidy task evicts blocks that have been idle for longer
//! than a configured age, see [`TidyConfig`].
//!
//! Lock order: the cache-wide state lock may be taken before a per-block
//! entry lock, never the other way around.

use std::{
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, AtomicUsize, Ordering::Relaxed},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel as channel;
use lru::LruCache;
use parking_lot::{Condvar, MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};
use positioned_io::ReadAt;

use crate::{
    codec,
    section::{Header, SectionType, VerifyLevel},
};

type Result<T, E = Error> = std::result::Result<T, E>;

/// An error delivered through a [`RangeFuture`].
pub struct Error(Box<ErrorInner>);

#[derive(Debug)]
enum ErrorInner {
    UnknownBlock(u32),
    NotABlock(u32),
    RangeOutOfBounds { block: u32, end: u64, size: u64 },
    CacheFull,
    Failed { block: u32, msg: String },
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            ErrorInner::UnknownBlock(block) => write!(f, "unknown block {block}"),
            ErrorInner::NotABlock(block) => {
                write!(f, "section for block {block} is not a block section")
            }
            ErrorInner::RangeOutOfBounds { block, end, size } => {
                write!(f, "range end {end} is beyond block {block} of {size} bytes")
            }
            ErrorInner::CacheFull => f.pad("block cache is full of pinned blocks"),
            ErrorInner::Failed { block, msg } => {
                write!(f, "failed to load block {block}: {msg}")
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<ErrorInner> for Error {
    #[cold]
    fn from(inner: ErrorInner) -> Self {
        Self(Box::new(inner))
    }
}

impl Error {
    /// Whether this is the cache-full condition under [`FullPolicy::Fail`].
    pub fn is_cache_full(&self) -> bool {
        matches!(&*self.0, ErrorInner::CacheFull)
    }
}

/// What `get` does when every resident block is pinned and the cache is at
/// capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FullPolicy {
    /// Wait for a pin to be released. The default.
    #[default]
    Block,
    /// Resolve the future with a cache-full error.
    Fail,
}

/// Cache-wide construction options.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Cap on resident decompressed bytes. Default 512 MiB.
    pub max_bytes: u64,
    /// Decompression worker threads. Default 2.
    pub num_workers: usize,
    /// Behavior when at capacity with everything pinned.
    pub full_policy: FullPolicy,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self { max_bytes: 512 << 20, num_workers: 2, full_policy: FullPolicy::Block }
    }
}

/// Idle-block expiry configuration, see [`BlockCache::set_tidy_config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TidyConfig {
    pub strategy: TidyStrategy,
    /// How often the tidy task scans.
    pub interval: Duration,
    /// Blocks idle for longer than this are evicted.
    pub max_age: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TidyStrategy {
    /// No background tidying.
    #[default]
    None,
    /// Evict blocks whose last access is older than `max_age`.
    ExpiryTime,
}

/// A compressed block section registered with [`BlockCache::insert`].
#[derive(Debug, Clone, Copy)]
pub struct SectionHandle {
    pub(crate) header: Header,
    /// Absolute offset of the payload in the underlying stream.
    pub(crate) payload_offset: u64,
}

impl SectionHandle {
    pub fn new(header: Header, payload_offset: u64) -> Self {
        Self { header, payload_offset }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Queued,
    Decoding,
    Ready,
    Failed,
}

struct EntryState {
    phase: Phase,
    /// Published watermark: bytes of `buf` that waiters may read.
    decoded: usize,
    /// End offsets of outstanding waiters. Every live [`RangeFuture`]
    /// keeps exactly one entry here until it resolves or is dropped;
    /// besides frame sizing, a non-empty list makes the block ineligible
    /// for eviction, so a future can never lose its block to a
    /// concurrent eviction before pinning it.
    needs: Vec<u64>,
    error: Option<String>,
}

struct BlockEntry {
    block_no: u32,
    /// Append-only; capacity is reserved up front so published bytes never
    /// move while decoding continues.
    buf: RwLock<Vec<u8>>,
    m: Mutex<EntryState>,
    frames: Condvar,
    /// Number of live [`BlockRange`]s into this block.
    pins: AtomicUsize,
    /// Milliseconds since the cache epoch of the last `get`.
    last_access: AtomicU64,
    /// Bytes charged against the cache residency budget.
    charged: u64,
    cache: Weak<Shared>,
}

impl Drop for BlockEntry {
    fn drop(&mut self) {
        // Credit the residency budget back once the buffer really dies.
        if let Some(shared) = self.cache.upgrade() {
            shared.state.lock().resident_bytes -= self.charged;
            shared.space.notify_all();
        }
    }
}

type DynReader = dyn ReadAt + Send + Sync;

/// A self-contained decompression job: it deliberately does not reference
/// the cache so workers only touch per-block state.
struct Job {
    entry: Arc<BlockEntry>,
    section: SectionHandle,
    reader: Arc<DynReader>,
}

struct CacheState {
    sections: Vec<SectionHandle>,
    live: LruCache<u32, Arc<BlockEntry>>,
    resident_bytes: u64,
    block_size: usize,
    num_workers: usize,
    job_tx: Option<channel::Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
    tidy_stop: Option<channel::Sender<()>>,
    tidy_thread: Option<thread::JoinHandle<()>>,
}

struct Shared {
    state: Mutex<CacheState>,
    /// Signaled when residency is credited back.
    space: Condvar,
    reader: Arc<DynReader>,
    max_bytes: u64,
    full_policy: FullPolicy,
    epoch: Instant,
}

impl Shared {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/// The block cache. See the [module documentation][self].
pub struct BlockCache {
    shared: Arc<Shared>,
}

impl fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.shared.state.lock();
        f.debug_struct("BlockCache")
            .field("blocks", &st.sections.len())
            .field("resident", &st.live.len())
            .field("resident_bytes", &st.resident_bytes)
            .finish_non_exhaustive()
    }
}

impl BlockCache {
    /// Create a cache over a random access stream.
    ///
    /// Call [`set_block_size`][Self::set_block_size] and
    /// [`insert`][Self::insert] before the first `get`.
    pub fn new(reader: Arc<DynReader>, options: &CacheOptions) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(CacheState {
                sections: Vec::new(),
                live: LruCache::unbounded(),
                resident_bytes: 0,
                block_size: 0,
                num_workers: options.num_workers.max(1),
                job_tx: None,
                workers: Vec::new(),
                tidy_stop: None,
                tidy_thread: None,
            }),
            space: Condvar::new(),
            reader,
            max_bytes: options.max_bytes,
            full_policy: options.full_policy,
            epoch: Instant::now(),
        });
        Self { shared }
    }

    /// Register the next block section. Blocks are numbered in insertion
    /// order starting at 0.
    pub fn insert(&self, section: SectionHandle) {
        self.shared.state.lock().sections.push(section);
    }

    /// The number of registered block sections.
    pub fn block_count(&self) -> usize {
        self.shared.state.lock().sections.len()
    }

    /// Decompressed bytes currently charged against the budget.
    pub fn resident_bytes(&self) -> u64 {
        self.shared.state.lock().resident_bytes
    }

    /// Set the decompressed block size. Must be called before any `get`.
    pub fn set_block_size(&self, block_size: usize) {
        self.shared.state.lock().block_size = block_size;
    }

    /// Set the worker thread count. Only effective before the first `get`
    /// spawns the pool.
    pub fn set_num_workers(&self, num: usize) {
        self.shared.state.lock().num_workers = num.max(1);
    }

    /// Configure the idle-tidy task, replacing any previous one.
    pub fn set_tidy_config(&self, cfg: TidyConfig) {
        let (stop, old_thread) = {
            let mut st = self.shared.state.lock();
            let old = (st.tidy_stop.take(), st.tidy_thread.take());
            if cfg.strategy == TidyStrategy::ExpiryTime {
                let (tx, rx) = channel::bounded::<()>(0);
                let weak = Arc::downgrade(&self.shared);
                let handle = thread::Builder::new()
                    .name("dwarfs-cache-tidy".into())
                    .spawn(move || tidy_loop(weak, rx, cfg))
                    .expect("failed to spawn tidy thread");
                st.tidy_stop = Some(tx);
                st.tidy_thread = Some(handle);
            }
            old
        };
        drop(stop);
        if let Some(t) = old_thread {
            let _ = t.join();
        }
    }

    /// Request `len` bytes at `offset` within decompressed block
    /// `block_no`.
    ///
    /// This never blocks on decompression; the returned future resolves
    /// once the range is available. Under [`FullPolicy::Block`] it may
    /// block waiting for cache capacity.
    pub fn get(&self, block_no: u32, offset: u64, len: u64) -> RangeFuture {
        match self.get_inner(block_no, offset, len) {
            Ok(fut) => fut,
            Err(err) => RangeFuture(FutureInner::Err(Some(err))),
        }
    }

    fn get_inner(&self, block_no: u32, offset: u64, len: u64) -> Result<RangeFuture> {
        let shared = &self.shared;
        let end = offset.checked_add(len).ok_or(ErrorInner::RangeOutOfBounds {
            block: block_no,
            end: u64::MAX,
            size: 0,
        })?;

        let entry = loop {
            let mut st = shared.state.lock();
            let block_size = st.block_size;
            if end > block_size as u64 {
                bail!(ErrorInner::RangeOutOfBounds { block: block_no, end, size: block_size as u64 });
            }

            if let Some(entry) = st.live.get(&block_no) {
                // Register the waiter before the state lock drops, so no
                // eviction pass can run between finding the entry and
                // attaching to it. State-then-entry is the allowed lock
                // order.
                let mut m = entry.m.lock();
                let failed = m.phase == Phase::Failed;
                if !failed {
                    m.needs.push(end);
                }
                drop(m);
                if !failed {
                    break Arc::clone(entry);
                }
                // Failed decodes are not cached; drop and retry fresh.
                let dead = st.live.pop(&block_no);
                drop(st);
                drop(dead);
                continue;
            }

            let Some(&section) = st.sections.get(block_no as usize) else {
                bail!(ErrorInner::UnknownBlock(block_no));
            };
            if section.header.section_type != SectionType::BLOCK {
                bail!(ErrorInner::NotABlock(block_no));
            }

            // Make room. Residency is credited back asynchronously when the
            // evicted entries actually drop, so re-check after each pass.
            if st.resident_bytes + block_size as u64 > shared.max_bytes && st.resident_bytes > 0 {
                let needed = st.resident_bytes + block_size as u64 - shared.max_bytes;
                let victims = collect_victims(&mut st, needed, None);
                if victims.is_empty() {
                    match shared.full_policy {
                        FullPolicy::Fail => bail!(ErrorInner::CacheFull),
                        FullPolicy::Block => {
                            shared.space.wait(&mut st);
                            continue;
                        }
                    }
                }
                // Drop the evicted entries outside the lock; their Drop
                // impl re-locks the state to credit residency back.
                drop(st);
                drop(victims);
                continue;
            }

            let entry = Arc::new(BlockEntry {
                block_no,
                buf: RwLock::new(Vec::with_capacity(block_size)),
                m: Mutex::new(EntryState {
                    phase: Phase::Queued,
                    decoded: 0,
                    // This future's waiter, attached from birth.
                    needs: vec![end],
                    error: None,
                }),
                frames: Condvar::new(),
                pins: AtomicUsize::new(0),
                last_access: AtomicU64::new(0),
                charged: block_size as u64,
                cache: Arc::downgrade(shared),
            });
            st.resident_bytes += entry.charged;
            st.live.push(block_no, Arc::clone(&entry));

            ensure_workers(&mut st);
            let tx = st.job_tx.as_ref().expect("workers running").clone();
            drop(st);
            tx.send(Job { entry: Arc::clone(&entry), section, reader: Arc::clone(&shared.reader) })
                .expect("worker pool is alive");
            break entry;
        };

        entry.last_access.store(shared.now_ms(), Relaxed);
        Ok(RangeFuture(FutureInner::Wait { entry, offset, len, need: Some(end) }))
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        let (workers, stop, tidy) = {
            let mut st = self.shared.state.lock();
            st.job_tx = None;
            (std::mem::take(&mut st.workers), st.tidy_stop.take(), st.tidy_thread.take())
        };
        drop(stop);
        if let Some(t) = tidy {
            let _ = t.join();
        }
        for w in workers {
            let _ = w.join();
        }
    }
}

/// Pick LRU-first evictable entries until `wanted` bytes are projected to
/// be freed (or candidates run out). Entries are removed from the map and
/// returned so the caller can drop them outside the state lock.
fn collect_victims(
    st: &mut CacheState,
    wanted: u64,
    min_idle_ms: Option<(u64, u64)>,
) -> Vec<Arc<BlockEntry>> {
    let mut order: Vec<u32> = st.live.iter().map(|(&k, _)| k).collect();
    // `iter` is most-recently-used first; evict from the tail.
    order.reverse();

    let mut victims = Vec::new();
    let mut freed = 0u64;
    for key in order {
        if freed >= wanted {
            break;
        }
        let entry = st.live.peek(&key).expect("key just listed");
        if entry.pins.load(Relaxed) != 0 {
            continue;
        }
        if let Some((now, max_age)) = min_idle_ms {
            if now.saturating_sub(entry.last_access.load(Relaxed)) < max_age {
                continue;
            }
        }
        {
            // Re-check the pin count under the entry lock: `wait` pins
            // while holding it, so a resolving waiter is either still in
            // `needs` or already visible in `pins` here.
            let m = entry.m.lock();
            if !matches!(m.phase, Phase::Ready | Phase::Failed)
                || !m.needs.is_empty()
                || entry.pins.load(Relaxed) != 0
            {
                continue;
            }
        }
        let entry = st.live.pop(&key).expect("key just peeked");
        freed += entry.charged;
        victims.push(entry);
    }
    victims
}

fn ensure_workers(st: &mut CacheState) {
    if st.job_tx.is_some() {
        return;
    }
    let (tx, rx) = channel::unbounded::<Job>();
    st.workers = (0..st.num_workers)
        .map(|i| {
            let rx = rx.clone();
            thread::Builder::new()
                .name(format!("dwarfs-cache-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        run_job(job);
                    }
                })
                .expect("failed to spawn cache worker")
        })
        .collect();
    st.job_tx = Some(tx);
}

fn tidy_loop(shared: Weak<Shared>, stop: channel::Receiver<()>, cfg: TidyConfig) {
    let interval = cfg.interval.max(Duration::from_millis(1));
    let max_age = cfg.max_age.as_millis() as u64;
    loop {
        match stop.recv_timeout(interval) {
            Ok(()) | Err(channel::RecvTimeoutError::Disconnected) => return,
            Err(channel::RecvTimeoutError::Timeout) => {}
        }
        let Some(shared) = shared.upgrade() else { return };
        let victims = {
            let mut st = shared.state.lock();
            collect_victims(&mut st, u64::MAX, Some((shared.now_ms(), max_age)))
        };
        if !victims.is_empty() {
            log::debug!("cache tidy evicted {} idle blocks", victims.len());
        }
        drop(victims);
    }
}

/// Decode one block on a worker thread.
fn run_job(job: Job) {
    let Job { entry, section, reader } = job;
    let fail = |entry: &BlockEntry, msg: String| {
        {
            let mut m = entry.m.lock();
            m.phase = Phase::Failed;
            m.error = Some(msg);
            entry.frames.notify_all();
        }
        if let Some(shared) = entry.cache.upgrade() {
            shared.space.notify_all();
        }
    };

    entry.m.lock().phase = Phase::Decoding;

    let payload_size = section.header.payload_size.get();
    let mut raw = vec![0u8; payload_size as usize];
    if let Err(err) = reader.read_exact_at(section.payload_offset, &mut raw) {
        return fail(&entry, format!("read failed: {err}"));
    }
    if let Err(err) = section.header.verify(&raw, VerifyLevel::Checksum) {
        return fail(&entry, err.to_string());
    }
    let mut decoder = match codec::decoder(section.header.compression, raw) {
        Ok(d) => d,
        Err(err) => return fail(&entry, err.to_string()),
    };

    const DEFAULT_FRAME: usize = 512 << 10;
    // The nominal block size; the buffer was reserved to exactly this, and
    // the allocator may have rounded the real capacity up.
    let capacity = entry.charged as usize;
    loop {
        let decoded = {
            let m = entry.m.lock();
            m.decoded
        };
        if decoded == capacity {
            // The block is nominally full; anything further is corruption.
            let mut probe = Vec::new();
            match decoder.decompress_frame(&mut probe, 1) {
                Ok(true) if probe.is_empty() => {}
                Ok(_) => return fail(&entry, "decompressed data exceeds block size".into()),
                Err(err) => return fail(&entry, format!("decompression failed: {err}")),
            }
            break;
        }

        // Size the frame after the furthest outstanding waiter; with no
        // waiters left, continue in default-size frames.
        const MAX_FRAME: usize = 4 << 20;
        let budget = {
            let m = entry.m.lock();
            let far = m.needs.iter().copied().max().unwrap_or(0) as usize;
            let pending = far.saturating_sub(decoded);
            let want = if pending > 0 { pending.min(MAX_FRAME) } else { DEFAULT_FRAME };
            want.min(capacity - decoded)
        };

        let done = {
            let mut buf = entry.buf.write();
            match decoder.decompress_frame(&mut buf, budget) {
                Ok(done) => {
                    debug_assert!(buf.len() <= capacity);
                    done
                }
                Err(err) => {
                    drop(buf);
                    return fail(&entry, format!("decompression failed: {err}"));
                }
            }
        };

        let mut m = entry.m.lock();
        m.decoded = entry.buf.read().len();
        if done {
            m.phase = Phase::Ready;
        }
        entry.frames.notify_all();
        if done {
            break;
        }
    }

    let mut m = entry.m.lock();
    if m.phase != Phase::Failed {
        m.phase = Phase::Ready;
        m.decoded = entry.buf.read().len();
        // Waiter entries stay registered until each future resolves or
        // is dropped; they also guard the block from eviction.
        entry.frames.notify_all();
    }
    drop(m);
    // A freshly ready block is an eviction candidate; getters blocked on
    // capacity may proceed now.
    if let Some(shared) = entry.cache.upgrade() {
        shared.space.notify_all();
    }
}

enum FutureInner {
    Err(Option<Error>),
    Wait { entry: Arc<BlockEntry>, offset: u64, len: u64, need: Option<u64> },
}

/// A pending range request. Resolve it with [`RangeFuture::wait`]; drop it
/// to cancel.
pub struct RangeFuture(FutureInner);

impl fmt::Debug for RangeFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            FutureInner::Err(err) => f.debug_tuple("RangeFuture::Err").field(err).finish(),
            FutureInner::Wait { entry, offset, len, .. } => f
                .debug_struct("RangeFuture")
                .field("block", &entry.block_no)
                .field("offset", offset)
                .field("len", len)
                .finish(),
        }
    }
}

impl RangeFuture {
    /// Whether [`wait`][Self::wait] would return without blocking.
    pub fn is_ready(&self) -> bool {
        match &self.0 {
            FutureInner::Err(_) => true,
            FutureInner::Wait { entry, offset, len, .. } => {
                let m = entry.m.lock();
                m.decoded as u64 >= offset + len || m.phase == Phase::Failed
                    || m.phase == Phase::Ready
            }
        }
    }

    /// Block until the range is decoded and return a pinned view of it.
    pub fn wait(mut self) -> Result<BlockRange> {
        match std::mem::replace(&mut self.0, FutureInner::Err(None)) {
            FutureInner::Err(err) => Err(err.expect("future already consumed")),
            FutureInner::Wait { entry, offset, len, need } => {
                let end = offset + len;
                let result = {
                    let mut m = entry.m.lock();
                    while (m.decoded as u64) < end
                        && !matches!(m.phase, Phase::Ready | Phase::Failed)
                    {
                        entry.frames.wait(&mut m);
                    }
                    detach_need(&mut m, need);
                    if m.decoded as u64 >= end {
                        // Pin while still holding the entry lock: once the
                        // need is detached, this is the only thing keeping
                        // a concurrent eviction pass from taking the block
                        // out from under the range about to be returned.
                        entry.pins.fetch_add(1, Relaxed);
                        Ok(())
                    } else if m.phase == Phase::Failed {
                        Err(Error::from(ErrorInner::Failed {
                            block: entry.block_no,
                            msg: m.error.clone().unwrap_or_default(),
                        }))
                    } else {
                        Err(Error::from(ErrorInner::RangeOutOfBounds {
                            block: entry.block_no,
                            end,
                            size: m.decoded as u64,
                        }))
                    }
                };
                result.map(|()| BlockRange { entry, offset: offset as usize, len: len as usize })
            }
        }
    }
}

impl Drop for RangeFuture {
    fn drop(&mut self) {
        // Detach the waiter so an abandoned future does not inflate frame
        // sizing decisions, and wake getters blocked on capacity: a block
        // with no waiters left may have become evictable.
        if let FutureInner::Wait { entry, need, .. } = &mut self.0 {
            {
                let mut m = entry.m.lock();
                detach_need(&mut m, *need);
            }
            if let Some(shared) = entry.cache.upgrade() {
                shared.space.notify_all();
            }
        }
    }
}

fn detach_need(m: &mut EntryState, need: Option<u64>) {
    if let Some(end) = need {
        if let Some(pos) = m.needs.iter().position(|&n| n == end) {
            m.needs.swap_remove(pos);
        }
    }
}

/// A resolved, pinned view into a decompressed block.
///
/// The backing buffer stays alive for as long as any range into it does,
/// even across eviction.
pub struct BlockRange {
    entry: Arc<BlockEntry>,
    offset: usize,
    len: usize,
}

impl fmt::Debug for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockRange")
            .field("block", &self.entry.block_no)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

impl BlockRange {
    /// The length of this range in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The bytes of this range.
    ///
    /// The returned guard borrows shared access to the block buffer; keep
    /// it short-lived if the block may still be decoding, since frame
    /// appends take the write side.
    pub fn bytes(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.entry.buf.read(), |buf| {
            &buf[self.offset..self.offset + self.len]
        })
    }

    /// Copy this range out into a `Vec`.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes().to_vec()
    }
}

impl Drop for BlockRange {
    fn drop(&mut self) {
        self.entry.pins.fetch_sub(1, Relaxed);
        // An unpinned block may now be evictable; wake blocked getters.
        if let Some(shared) = self.entry.cache.upgrade() {
            shared.space.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecRegistry;
    use crate::section::CompressAlgo;

    /// A reader that counts `read_at` calls touching each payload.
    struct CountingReader {
        data: Vec<u8>,
        reads: Mutex<Vec<u64>>,
    }

    impl ReadAt for CountingReader {
        fn read_at(&self, pos: u64, buf: &mut [u8]) -> std::io::Result<usize> {
            self.reads.lock().push(pos);
            let pos = pos as usize;
            let n = buf.len().min(self.data.len().saturating_sub(pos));
            buf[..n].copy_from_slice(&self.data[pos..pos + n]);
            Ok(n)
        }
    }

    const BLOCK_SIZE: usize = 4096;

    fn block_data(block_no: u32, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u32).wrapping_mul(2654435761).wrapping_add(block_no) as u8)
            .collect()
    }

    /// Build an in-memory image of compressed block payloads and a cache
    /// over it. Returns the cache, the reader, and the plain block data.
    fn build_cache(
        block_lens: &[usize],
        options: &CacheOptions,
    ) -> (BlockCache, Arc<CountingReader>, Vec<Vec<u8>>) {
        let compressor = CodecRegistry::default().create("zstd:level=3").unwrap();
        let mut data = Vec::new();
        let mut handles = Vec::new();
        let mut plain = Vec::new();
        for (i, &len) in block_lens.iter().enumerate() {
            let content = block_data(i as u32, len);
            let (algo, payload) = match compressor.compress(&content) {
                Ok(c) => (CompressAlgo::ZSTD, c),
                Err(_) => (CompressAlgo::NONE, content.clone()),
            };
            let mut header = Header::new(i as u32, SectionType::BLOCK, algo);
            header.seal(&payload);
            let payload_offset = data.len() as u64;
            data.extend_from_slice(&payload);
            handles.push(SectionHandle::new(header, payload_offset));
            plain.push(content);
        }
        let reader = Arc::new(CountingReader { data, reads: Mutex::new(Vec::new()) });
        let cache = BlockCache::new(reader.clone() as Arc<DynReader>, options);
        cache.set_block_size(BLOCK_SIZE);
        for h in handles {
            cache.insert(h);
        }
        (cache, reader, plain)
    }

    #[test]
    fn coherent_ranges() {
        let (cache, _, plain) = build_cache(&[BLOCK_SIZE, 2000], &CacheOptions::default());
        for (block, content) in plain.iter().enumerate() {
            for (offset, len) in [(0usize, 1usize), (17, 100), (content.len() - 5, 5), (0, content.len())] {
                let r = cache.get(block as u32, offset as u64, len as u64).wait().unwrap();
                assert_eq!(&*r.bytes(), &content[offset..offset + len]);
            }
        }
    }

    #[test]
    fn single_flight() {
        let (cache, reader, plain) = build_cache(&[BLOCK_SIZE], &CacheOptions::default());
        let cache = Arc::new(cache);
        let mut threads = Vec::new();
        for t in 0..8u64 {
            let cache = Arc::clone(&cache);
            let expect = plain[0].clone();
            threads.push(thread::spawn(move || {
                let offset = t * 64;
                let r = cache.get(0, offset, 256).wait().unwrap();
                assert_eq!(&*r.bytes(), &expect[offset as usize..offset as usize + 256]);
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        // All eight requests were served by a single payload read.
        assert_eq!(reader.reads.lock().len(), 1);
    }

    #[test]
    fn lru_eviction_under_cap() {
        let opts = CacheOptions {
            max_bytes: 2 * BLOCK_SIZE as u64,
            ..CacheOptions::default()
        };
        let (cache, _, _) = build_cache(&[BLOCK_SIZE, BLOCK_SIZE, BLOCK_SIZE], &opts);
        for block in 0..3 {
            let r = cache.get(block, 0, 16).wait().unwrap();
            drop(r);
            assert!(cache.resident_bytes() <= opts.max_bytes);
        }
        let st = cache.shared.state.lock();
        assert!(!st.live.contains(&0), "block 0 is the LRU victim");
        assert!(st.live.contains(&1) && st.live.contains(&2));
    }

    #[test]
    fn cache_full_with_pins() {
        let opts = CacheOptions {
            max_bytes: BLOCK_SIZE as u64,
            full_policy: FullPolicy::Fail,
            ..CacheOptions::default()
        };
        let (cache, _, _) = build_cache(&[BLOCK_SIZE, BLOCK_SIZE], &opts);
        let pinned = cache.get(0, 0, 100).wait().unwrap();
        let err = cache.get(1, 0, 100).wait().unwrap_err();
        assert!(err.is_cache_full());
        drop(pinned);
        cache.get(1, 0, 100).wait().unwrap();
    }

    #[test]
    fn blocking_policy_waits_for_pin_release() {
        let opts = CacheOptions {
            max_bytes: BLOCK_SIZE as u64,
            full_policy: FullPolicy::Block,
            ..CacheOptions::default()
        };
        let (cache, _, plain) = build_cache(&[BLOCK_SIZE, BLOCK_SIZE], &opts);
        let pinned = cache.get(0, 0, 100).wait().unwrap();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            drop(pinned);
        });
        let r = cache.get(1, 0, 64).wait().unwrap();
        assert_eq!(&*r.bytes(), &plain[1][..64]);
        releaser.join().unwrap();
    }

    #[test]
    fn dropped_future_detaches() {
        let (cache, _, plain) = build_cache(&[BLOCK_SIZE], &CacheOptions::default());
        let fut = cache.get(0, 0, BLOCK_SIZE as u64);
        drop(fut);
        let r = cache.get(0, 10, 20).wait().unwrap();
        assert_eq!(&*r.bytes(), &plain[0][10..30]);
    }

    #[test]
    fn range_past_block_end_fails() {
        let (cache, _, _) = build_cache(&[BLOCK_SIZE, 2000], &CacheOptions::default());
        // Beyond the nominal block size: rejected immediately.
        assert!(cache.get(0, 0, BLOCK_SIZE as u64 + 1).wait().is_err());
        // Within block size but past the short last block: rejected once
        // the decoded length is known.
        assert!(cache.get(1, 1990, 100).wait().is_err());
        // Unknown block number.
        assert!(cache.get(7, 0, 1).wait().is_err());
    }

    #[test]
    fn corrupt_block_fails_only_itself() {
        let opts = CacheOptions::default();
        let compressor = CodecRegistry::default().create("zstd:level=3").unwrap();
        let good = block_data(0, BLOCK_SIZE);
        let good_payload = compressor.compress(&good).unwrap();
        let mut good_header = Header::new(0, SectionType::BLOCK, CompressAlgo::ZSTD);
        good_header.seal(&good_payload);

        // A payload whose checksum is sealed over different bytes.
        let mut bad_payload = good_payload.clone();
        bad_payload[0] ^= 0xff;
        let mut data = good_payload.clone();
        let bad_offset = data.len() as u64;
        data.extend_from_slice(&bad_payload);

        let reader = Arc::new(CountingReader { data, reads: Mutex::new(Vec::new()) });
        let cache = BlockCache::new(reader as Arc<DynReader>, &opts);
        cache.set_block_size(BLOCK_SIZE);
        cache.insert(SectionHandle::new(good_header, 0));
        let mut bad_header = Header::new(1, SectionType::BLOCK, CompressAlgo::ZSTD);
        bad_header.seal(&good_payload);
        cache.insert(SectionHandle::new(bad_header, bad_offset));

        assert!(cache.get(1, 0, 16).wait().is_err());
        let r = cache.get(0, 0, 16).wait().unwrap();
        assert_eq!(&*r.bytes(), &good[..16]);
    }

    #[test]
    fn tidy_evicts_idle_blocks() {
        let (cache, _, _) = build_cache(&[BLOCK_SIZE], &CacheOptions::default());
        cache.set_tidy_config(TidyConfig {
            strategy: TidyStrategy::ExpiryTime,
            interval: Duration::from_millis(10),
            max_age: Duration::from_millis(1),
        });
        drop(cache.get(0, 0, 16).wait().unwrap());
        let deadline = Instant::now() + Duration::from_secs(5);
        while cache.resident_bytes() > 0 {
            assert!(Instant::now() < deadline, "tidy did not evict in time");
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn pinned_range_survives_eviction() {
        let opts = CacheOptions {
            max_bytes: BLOCK_SIZE as u64,
            full_policy: FullPolicy::Fail,
            ..CacheOptions::default()
        };
        let (cache, _, plain) = build_cache(&[BLOCK_SIZE, BLOCK_SIZE], &opts);
        let r0 = cache.get(0, 0, 128).wait().unwrap();
        // Evicting block 0 must fail while r0 pins it...
        assert!(cache.get(1, 0, 1).wait().unwrap_err().is_cache_full());
        // ...and the pinned bytes stay valid throughout.
        assert_eq!(&*r0.bytes(), &plain[0][..128]);
    }
}
