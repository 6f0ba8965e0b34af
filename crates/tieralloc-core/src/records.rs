//! Live allocation records.
//!
//! Sharded concurrent map from handle to [`AllocationRecord`]. Each shard also
//! remembers a bounded window of recently freed handles so a second free of
//! the same handle can be told apart from a pointer that was never ours.

use crate::tier::TierId;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Number of record shards (power of 2).
const NUM_SHARDS: usize = 16;

/// Freed handles remembered per shard.
const RECENTLY_FREED_PER_SHARD: usize = 256;

/// Address of an allocation as handed to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Handle(usize);

impl Handle {
    pub const NULL: Handle = Handle(0);

    #[must_use]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[must_use]
    pub const fn addr(self) -> usize {
        self.0
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllocationRecord {
    pub handle: Handle,
    /// Bytes the caller asked for (at least 1).
    pub size: usize,
    /// Bytes reserved in the tier.
    pub reserved: usize,
    pub tier: TierId,
    /// Monotonic allocation id.
    pub sequence: u64,
}

/// Ownership state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Live(AllocationRecord),
    RecentlyFreed,
    Unknown,
}

/// Why a removal found no live record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Miss {
    DoubleFree,
    Unknown,
}

#[derive(Debug, Default)]
struct Shard {
    live: HashMap<usize, AllocationRecord>,
    freed_order: VecDeque<usize>,
    freed: HashSet<usize>,
}

impl Shard {
    fn remember_freed(&mut self, addr: usize) {
        if self.freed.insert(addr) {
            self.freed_order.push_back(addr);
            if self.freed_order.len() > RECENTLY_FREED_PER_SHARD {
                if let Some(evicted) = self.freed_order.pop_front() {
                    self.freed.remove(&evicted);
                }
            }
        }
    }

    fn forget_freed(&mut self, addr: usize) {
        if self.freed.remove(&addr) {
            self.freed_order.retain(|&a| a != addr);
        }
    }
}

#[derive(Debug)]
pub struct RecordTable {
    shards: Box<[Mutex<Shard>]>,
    live: AtomicUsize,
}

impl RecordTable {
    #[must_use]
    pub fn new() -> Self {
        let shards: Vec<Mutex<Shard>> = (0..NUM_SHARDS).map(|_| Mutex::default()).collect();
        Self {
            shards: shards.into_boxed_slice(),
            live: AtomicUsize::new(0),
        }
    }

    fn shard(&self, handle: Handle) -> &Mutex<Shard> {
        let addr = handle.addr();
        &self.shards[((addr >> 6) ^ (addr >> 12)) % NUM_SHARDS]
    }

    /// Track a new allocation. `false` if the handle is already live.
    pub fn insert(&self, record: AllocationRecord) -> bool {
        let mut shard = self.shard(record.handle).lock();
        let addr = record.handle.addr();
        if shard.live.contains_key(&addr) {
            return false;
        }
        shard.forget_freed(addr);
        shard.live.insert(addr, record);
        self.live.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Stop tracking an allocation and remember the handle as freed.
    pub fn remove(&self, handle: Handle) -> Result<AllocationRecord, Miss> {
        let mut shard = self.shard(handle).lock();
        match shard.live.remove(&handle.addr()) {
            Some(record) => {
                shard.remember_freed(handle.addr());
                self.live.fetch_sub(1, Ordering::Relaxed);
                Ok(record)
            }
            None if shard.freed.contains(&handle.addr()) => Err(Miss::DoubleFree),
            None => Err(Miss::Unknown),
        }
    }

    /// Put back a record taken by [`RecordTable::remove`] whose operation was
    /// abandoned.
    pub fn restore(&self, record: AllocationRecord) {
        self.insert(record);
    }

    #[must_use]
    pub fn get(&self, handle: Handle) -> Option<AllocationRecord> {
        self.shard(handle).lock().live.get(&handle.addr()).copied()
    }

    #[must_use]
    pub fn state(&self, handle: Handle) -> HandleState {
        let shard = self.shard(handle).lock();
        match shard.live.get(&handle.addr()) {
            Some(record) => HandleState::Live(*record),
            None if shard.freed.contains(&handle.addr()) => HandleState::RecentlyFreed,
            None => HandleState::Unknown,
        }
    }

    /// Remove every live record without marking any handle as freed.
    pub fn drain_all(&self) -> Vec<AllocationRecord> {
        let mut drained = Vec::new();
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            let count = shard.live.len();
            drained.extend(shard.live.drain().map(|(_, record)| record));
            self.live.fetch_sub(count, Ordering::Relaxed);
        }
        drained.sort_by_key(|record| record.sequence);
        drained
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

impl Default for RecordTable {
    fn default() -> Self {
        Self::new()
    }
}
