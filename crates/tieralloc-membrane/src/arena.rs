//! Backing arenas for tier memory.
//!
//! A tier never touches raw memory itself: it asks a [`TierBacking`] for a
//! block under a [`BackingStrategy`] and hands the block back on free. Every
//! block a backing hands out is registered in a sharded [`BlockTable`], so
//! `release`, `copy` and `zero` only ever act on addresses this backing
//! produced; anything else is refused.
//!
//! Two backings exist:
//! - [`SystemArena`]: real memory from the native heap (`posix_memalign`),
//!   page-rounded and `mlock`ed for the pinned strategy.
//! - [`LogicalBacking`]: address-only bump model with an optional byte limit,
//!   used for simulation and deterministic tests.
//!
//! Thread-safe via sharded `parking_lot::Mutex`.

#![allow(unsafe_code)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Alignment of general heap blocks (one cache line).
pub const GENERAL_ALIGN: usize = 64;

/// Number of shards for block-table locks (power of 2).
const NUM_SHARDS: usize = 16;

/// First logical address handed out by [`LogicalBacking`] (above the zero page).
const LOGICAL_BASE: usize = 0x1000;

/// How a tier obtains its memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackingStrategy {
    /// Page-granular blocks locked into RAM.
    PinnedArena,
    /// Cache-line aligned blocks from the native heap.
    GeneralHeap,
    /// Page-granular spill blocks.
    OverflowStore,
}

impl BackingStrategy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PinnedArena => "pinned_arena",
            Self::GeneralHeap => "general_heap",
            Self::OverflowStore => "overflow_store",
        }
    }

    const fn page_granular(self) -> bool {
        matches!(self, Self::PinnedArena | Self::OverflowStore)
    }
}

/// Metadata for one block handed out by a backing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMeta {
    /// Base address of the block.
    pub addr: usize,
    /// Bytes the caller asked for.
    pub size: usize,
    /// Bytes actually reserved.
    pub footprint: usize,
    pub strategy: BackingStrategy,
    /// Whether the block is currently locked into RAM.
    pub pinned: bool,
}

/// Source of tier memory.
///
/// Implementations must only act on addresses they returned from `acquire`
/// and that have not been released or detached since.
pub trait TierBacking: Send + Sync {
    /// Bytes reserved for a `size`-byte request, `None` on arithmetic overflow.
    fn footprint(&self, strategy: BackingStrategy, size: usize) -> Option<usize>;

    /// Obtain a block of at least `size` bytes, returning its base address.
    fn acquire(&self, strategy: BackingStrategy, size: usize) -> Option<usize>;

    /// Return a block. `false` if `addr` is not a live block of this backing.
    fn release(&self, addr: usize) -> bool;

    /// Stop tracking a block without freeing it, leaving it owned by the
    /// native heap. `false` if `addr` is not a live block of this backing.
    fn detach(&self, addr: usize) -> bool;

    /// Copy `len` bytes between two live blocks.
    fn copy(&self, src: usize, dst: usize, len: usize) -> bool;

    /// Zero the first `len` bytes of a live block.
    fn zero(&self, addr: usize, len: usize) -> bool;

    /// Look up a live block.
    fn block(&self, addr: usize) -> Option<BlockMeta>;

    /// Number of live blocks.
    fn live_blocks(&self) -> usize;
}

/// Sharded map of live blocks, keyed by base address.
pub struct BlockTable {
    shards: Box<[Mutex<HashMap<usize, BlockMeta>>]>,
    live: AtomicUsize,
}

impl BlockTable {
    #[must_use]
    pub fn new() -> Self {
        let shards: Vec<Mutex<HashMap<usize, BlockMeta>>> =
            (0..NUM_SHARDS).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            shards: shards.into_boxed_slice(),
            live: AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, meta: BlockMeta) {
        let mut shard = self.shards[shard_for(meta.addr)].lock();
        if shard.insert(meta.addr, meta).is_none() {
            self.live.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn remove(&self, addr: usize) -> Option<BlockMeta> {
        let removed = self.shards[shard_for(addr)].lock().remove(&addr);
        if removed.is_some() {
            self.live.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    #[must_use]
    pub fn get(&self, addr: usize) -> Option<BlockMeta> {
        self.shards[shard_for(addr)].lock().get(&addr).copied()
    }

    /// Whether `[addr, addr + len)` lies inside the block based at `addr`.
    #[must_use]
    pub fn covers(&self, addr: usize, len: usize) -> bool {
        self.get(addr).is_some_and(|meta| len <= meta.footprint)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BlockTable {
    fn default() -> Self {
        Self::new()
    }
}

fn shard_for(addr: usize) -> usize {
    // Mix cache-line and page bits: small blocks share pages.
    ((addr >> 6) ^ (addr >> 12)) % NUM_SHARDS
}

#[inline]
fn round_up(n: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    n.checked_add(align - 1).map(|v| v & !(align - 1))
}

fn system_page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    // SAFETY: sysconf has no memory-safety preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page = usize::try_from(raw)
        .ok()
        .filter(|p| p.is_power_of_two())
        .unwrap_or(4096);
    PAGE_SIZE.store(page, Ordering::Relaxed);
    page
}

// ---------------------------------------------------------------------------
// SystemArena
// ---------------------------------------------------------------------------

/// Real memory from the native heap.
///
/// Blocks come from `posix_memalign`, so a detached block is an ordinary
/// native allocation that the host may later pass to `free`.
pub struct SystemArena {
    table: BlockTable,
    pin: bool,
    page_size: usize,
    pin_failures: AtomicU64,
}

impl SystemArena {
    /// Create an arena; `pin` controls whether pinned blocks are `mlock`ed.
    #[must_use]
    pub fn new(pin: bool) -> Self {
        Self {
            table: BlockTable::new(),
            pin,
            page_size: system_page_size(),
            pin_failures: AtomicU64::new(0),
        }
    }

    /// Number of pinned blocks that could not be locked (served unpinned).
    #[must_use]
    pub fn pin_failures(&self) -> u64 {
        self.pin_failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn align_for(&self, strategy: BackingStrategy) -> usize {
        if strategy.page_granular() {
            self.page_size
        } else {
            GENERAL_ALIGN
        }
    }

    fn unpin(&self, meta: &BlockMeta) {
        if meta.pinned {
            // SAFETY: the range was locked by `acquire` and is still allocated.
            unsafe {
                libc::munlock(meta.addr as *const libc::c_void, meta.footprint);
            }
        }
    }
}

impl Default for SystemArena {
    fn default() -> Self {
        Self::new(true)
    }
}

impl TierBacking for SystemArena {
    fn footprint(&self, strategy: BackingStrategy, size: usize) -> Option<usize> {
        round_up(size.max(1), self.align_for(strategy))
    }

    fn acquire(&self, strategy: BackingStrategy, size: usize) -> Option<usize> {
        let footprint = self.footprint(strategy, size)?;
        let align = self.align_for(strategy);

        let mut raw: *mut libc::c_void = std::ptr::null_mut();
        // SAFETY: `raw` is a valid out-pointer; align is a power of two and a
        // multiple of `size_of::<*mut c_void>()`.
        let rc = unsafe { libc::posix_memalign(&mut raw, align, footprint) };
        if rc != 0 || raw.is_null() {
            return None;
        }

        let mut pinned = false;
        if strategy == BackingStrategy::PinnedArena && self.pin {
            // SAFETY: [raw, raw + footprint) was just allocated and is page aligned.
            pinned = unsafe { libc::mlock(raw, footprint) } == 0;
            if !pinned {
                self.pin_failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        let addr = raw as usize;
        self.table.insert(BlockMeta {
            addr,
            size,
            footprint,
            strategy,
            pinned,
        });
        Some(addr)
    }

    fn release(&self, addr: usize) -> bool {
        let Some(meta) = self.table.remove(addr) else {
            return false;
        };
        self.unpin(&meta);
        // SAFETY: addr came from posix_memalign in `acquire` and was live in
        // the table, so this is its single release.
        unsafe { libc::free(addr as *mut libc::c_void) };
        true
    }

    fn detach(&self, addr: usize) -> bool {
        let Some(meta) = self.table.remove(addr) else {
            return false;
        };
        self.unpin(&meta);
        true
    }

    fn copy(&self, src: usize, dst: usize, len: usize) -> bool {
        if len == 0 {
            return true;
        }
        if src == dst || !self.table.covers(src, len) || !self.table.covers(dst, len) {
            return false;
        }
        // SAFETY: both ranges lie inside distinct live blocks of this arena,
        // so they are valid and cannot overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len);
        }
        true
    }

    fn zero(&self, addr: usize, len: usize) -> bool {
        if !self.table.covers(addr, len) {
            return false;
        }
        // SAFETY: the range lies inside a live block of this arena.
        unsafe { std::ptr::write_bytes(addr as *mut u8, 0, len) };
        true
    }

    fn block(&self, addr: usize) -> Option<BlockMeta> {
        self.table.get(addr)
    }

    fn live_blocks(&self) -> usize {
        self.table.len()
    }
}

impl Drop for SystemArena {
    fn drop(&mut self) {
        // Blocks still registered at teardown stay with the native heap; only
        // drop the locks so the pages become swappable again.
        for shard in self.table.shards.iter() {
            for meta in shard.lock().values() {
                self.unpin(meta);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// LogicalBacking
// ---------------------------------------------------------------------------

/// Address-only backing: hands out monotonically increasing logical offsets
/// and never touches memory.
pub struct LogicalBacking {
    table: BlockTable,
    next_addr: AtomicUsize,
    limit_bytes: Option<usize>,
    used_bytes: AtomicUsize,
    released: AtomicU64,
    detached: AtomicU64,
}

impl LogicalBacking {
    /// Unlimited logical backing.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: BlockTable::new(),
            next_addr: AtomicUsize::new(LOGICAL_BASE),
            limit_bytes: None,
            used_bytes: AtomicUsize::new(0),
            released: AtomicU64::new(0),
            detached: AtomicU64::new(0),
        }
    }

    /// Logical backing that refuses to hold more than `limit` live bytes.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit_bytes: Some(limit),
            ..Self::new()
        }
    }

    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn detached(&self) -> u64 {
        self.detached.load(Ordering::Relaxed)
    }
}

impl Default for LogicalBacking {
    fn default() -> Self {
        Self::new()
    }
}

impl TierBacking for LogicalBacking {
    fn footprint(&self, strategy: BackingStrategy, size: usize) -> Option<usize> {
        let align = if strategy.page_granular() {
            4096
        } else {
            GENERAL_ALIGN
        };
        round_up(size.max(1), align)
    }

    fn acquire(&self, strategy: BackingStrategy, size: usize) -> Option<usize> {
        let footprint = self.footprint(strategy, size)?;
        let reserved = self
            .used_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |used| {
                let next = used.checked_add(footprint)?;
                match self.limit_bytes {
                    Some(limit) if next > limit => None,
                    _ => Some(next),
                }
            });
        if reserved.is_err() {
            return None;
        }

        let addr = self
            .next_addr
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |next| {
                next.checked_add(footprint)
            });
        let Ok(addr) = addr else {
            self.used_bytes.fetch_sub(footprint, Ordering::AcqRel);
            return None;
        };

        self.table.insert(BlockMeta {
            addr,
            size,
            footprint,
            strategy,
            pinned: strategy == BackingStrategy::PinnedArena,
        });
        Some(addr)
    }

    fn release(&self, addr: usize) -> bool {
        let Some(meta) = self.table.remove(addr) else {
            return false;
        };
        self.used_bytes.fetch_sub(meta.footprint, Ordering::AcqRel);
        self.released.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn detach(&self, addr: usize) -> bool {
        let Some(meta) = self.table.remove(addr) else {
            return false;
        };
        self.used_bytes.fetch_sub(meta.footprint, Ordering::AcqRel);
        self.detached.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn copy(&self, src: usize, dst: usize, len: usize) -> bool {
        len == 0 || (src != dst && self.table.covers(src, len) && self.table.covers(dst, len))
    }

    fn zero(&self, addr: usize, len: usize) -> bool {
        self.table.covers(addr, len)
    }

    fn block(&self, addr: usize) -> Option<BlockMeta> {
        self.table.get(addr)
    }

    fn live_blocks(&self) -> usize {
        self.table.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_arena_round_trip_with_real_memory() {
        let arena = SystemArena::new(false);
        let addr = arena
            .acquire(BackingStrategy::GeneralHeap, 100)
            .expect("allocation should succeed");
        assert_eq!(addr % GENERAL_ALIGN, 0);
        assert!(arena.zero(addr, 100));

        let meta = arena.block(addr).expect("live block");
        assert_eq!(meta.size, 100);
        assert_eq!(meta.footprint, 128);
        assert!(!meta.pinned);

        assert!(arena.release(addr));
        assert!(!arena.release(addr), "second release must be refused");
        assert_eq!(arena.live_blocks(), 0);
    }

    #[test]
    fn page_granular_strategies_round_to_pages() {
        let arena = SystemArena::new(false);
        let page = arena.page_size();
        assert_eq!(
            arena.footprint(BackingStrategy::OverflowStore, 1),
            Some(page)
        );
        assert_eq!(
            arena.footprint(BackingStrategy::PinnedArena, page + 1),
            Some(page * 2)
        );
        assert_eq!(arena.footprint(BackingStrategy::GeneralHeap, 0), Some(64));
        assert_eq!(arena.footprint(BackingStrategy::GeneralHeap, usize::MAX), None);

        let addr = arena
            .acquire(BackingStrategy::OverflowStore, 10)
            .expect("overflow block");
        assert_eq!(addr % page, 0);
        assert!(arena.release(addr));
    }

    #[test]
    fn copy_moves_bytes_between_live_blocks_only() {
        let arena = SystemArena::new(false);
        let src = arena.acquire(BackingStrategy::GeneralHeap, 64).unwrap();
        let dst = arena.acquire(BackingStrategy::GeneralHeap, 64).unwrap();

        // SAFETY: src is a live 64-byte block.
        unsafe { std::ptr::write_bytes(src as *mut u8, 0x5A, 64) };
        assert!(arena.copy(src, dst, 64));
        // SAFETY: dst is a live 64-byte block.
        let copied = unsafe { std::slice::from_raw_parts(dst as *const u8, 64) };
        assert!(copied.iter().all(|&b| b == 0x5A));

        assert!(!arena.copy(src, dst, 4096), "length past the block is refused");
        assert!(!arena.copy(src, 0xDEAD_0000, 8), "foreign destination is refused");

        assert!(arena.release(src));
        assert!(arena.release(dst));
    }

    #[test]
    fn detached_block_is_native_heap_memory() {
        let arena = SystemArena::new(false);
        let addr = arena.acquire(BackingStrategy::GeneralHeap, 32).unwrap();
        assert!(arena.detach(addr));
        assert_eq!(arena.live_blocks(), 0);
        assert!(!arena.release(addr));
        // SAFETY: the detached block came from posix_memalign and is now ours.
        unsafe { libc::free(addr as *mut libc::c_void) };
    }

    #[test]
    fn pinned_blocks_fall_back_to_unpinned_when_mlock_fails() {
        let arena = SystemArena::new(true);
        let addr = arena
            .acquire(BackingStrategy::PinnedArena, 4096)
            .expect("pinned block is served even without mlock");
        let meta = arena.block(addr).unwrap();
        assert_eq!(meta.pinned, arena.pin_failures() == 0);
        assert!(arena.release(addr));
    }

    #[test]
    fn logical_backing_enforces_limit() {
        let backing = LogicalBacking::with_limit(128);
        let a = backing.acquire(BackingStrategy::GeneralHeap, 64).unwrap();
        let b = backing.acquire(BackingStrategy::GeneralHeap, 64).unwrap();
        assert_ne!(a, b);
        assert!(backing.acquire(BackingStrategy::GeneralHeap, 1).is_none());
        assert_eq!(backing.used_bytes(), 128);

        assert!(backing.release(a));
        assert!(backing.acquire(BackingStrategy::GeneralHeap, 1).is_some());
        assert_eq!(backing.released(), 1);
    }

    #[test]
    fn logical_addresses_start_above_zero_page_and_never_repeat() {
        let backing = LogicalBacking::new();
        let first = backing.acquire(BackingStrategy::OverflowStore, 1).unwrap();
        assert_eq!(first, LOGICAL_BASE);
        assert!(backing.release(first));
        let second = backing.acquire(BackingStrategy::OverflowStore, 1).unwrap();
        assert_ne!(first, second);
        assert!(backing.detach(second));
        assert_eq!(backing.detached(), 1);
        assert_eq!(backing.live_blocks(), 0);
    }
}
