//! Pinned buffer cache.
//!
//! Callers obtain blocks through [`BufferCache::request_block`], which
//! returns a [`BlockGuard`]. The guard releases its acquisition when it is
//! dropped. A guard that must outlive the borrow of the cache can be turned
//! into a [`DetachedBlock`] and released explicitly later.
//!
//! Pinned blocks are never chosen as eviction victims. The cache may grow
//! past its capacity while every resident block is pinned.

use crate::BlockDevice;
use e4_error::{Ext4Error, Result};
use e4_types::{BlockNumber, BlockSize};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tracing::{trace, warn};

/// Source of block buffers with pin/release accounting.
pub trait BufferCache: Send + Sync {
    /// Filesystem block size served by this cache.
    fn block_size(&self) -> BlockSize;

    /// Fetch one block. With `pin`, the block stays resident until the
    /// returned guard (or its detached form) is released.
    fn request_block(&self, block: BlockNumber, pin: bool) -> Result<BlockGuard<'_>>;

    /// Return one acquisition of `block`. Called exactly once per
    /// successful `request_block`, normally by the guard itself.
    fn release(&self, block: BlockNumber, pinned: bool);
}

/// Scoped view over one block. Dropping it releases the acquisition.
pub struct BlockGuard<'a> {
    cache: Option<&'a dyn BufferCache>,
    block: Option<BlockNumber>,
    pinned: bool,
    data: Arc<[u8]>,
}

impl<'a> BlockGuard<'a> {
    #[must_use]
    pub fn new(
        cache: &'a dyn BufferCache,
        block: BlockNumber,
        pinned: bool,
        data: Arc<[u8]>,
    ) -> Self {
        Self {
            cache: Some(cache),
            block: Some(block),
            pinned,
            data,
        }
    }

    /// Zero-filled buffer not backed by any cached block (sparse holes).
    #[must_use]
    pub fn zeroed(block_size: BlockSize) -> Self {
        Self {
            cache: None,
            block: None,
            pinned: false,
            data: Arc::from(vec![0_u8; block_size.as_usize()]),
        }
    }

    /// Physical block number, or `None` for a transient zero buffer.
    #[must_use]
    pub fn block(&self) -> Option<BlockNumber> {
        self.block
    }

    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.block.is_none()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Stop releasing on drop. The returned handle must be released with
    /// [`DetachedBlock::release`].
    #[must_use]
    pub fn detach(mut self) -> DetachedBlock {
        let owes_release = self.cache.take().is_some();
        DetachedBlock {
            block: self.block,
            pinned: self.pinned,
            data: Arc::clone(&self.data),
            owes_release,
        }
    }
}

impl Deref for BlockGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for BlockGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockGuard")
            .field("block", &self.block)
            .field("pinned", &self.pinned)
            .field("len", &self.data.len())
            .finish_non_exhaustive()
    }
}

impl Drop for BlockGuard<'_> {
    fn drop(&mut self) {
        if let (Some(cache), Some(block)) = (self.cache.take(), self.block) {
            cache.release(block, self.pinned);
        }
    }
}

/// Block held across several steps without borrowing the cache.
#[must_use = "a detached block must be released exactly once"]
#[derive(Debug)]
pub struct DetachedBlock {
    block: Option<BlockNumber>,
    pinned: bool,
    data: Arc<[u8]>,
    owes_release: bool,
}

impl DetachedBlock {
    #[must_use]
    pub fn block(&self) -> Option<BlockNumber> {
        self.block
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Give the acquisition back to `cache`.
    pub fn release(mut self, cache: &dyn BufferCache) {
        if let (true, Some(block)) = (self.owes_release, self.block) {
            cache.release(block, self.pinned);
        }
        self.owes_release = false;
    }

    /// Return to scoped ownership under `cache`.
    #[must_use]
    pub fn reattach(mut self, cache: &dyn BufferCache) -> BlockGuard<'_> {
        let owes = std::mem::replace(&mut self.owes_release, false);
        BlockGuard {
            cache: owes.then_some(cache),
            block: self.block,
            pinned: self.pinned,
            data: Arc::clone(&self.data),
        }
    }
}

impl Drop for DetachedBlock {
    fn drop(&mut self) {
        if self.owes_release {
            warn!(
                block = ?self.block,
                pinned = self.pinned,
                "detached block dropped without release"
            );
        }
    }
}

// ── ARC replacement state ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArcList {
    T1,
    T2,
    B1,
    B2,
}

#[derive(Debug)]
struct ArcState {
    capacity: usize,
    /// Target size for the T1 list.
    p: usize,
    t1: VecDeque<BlockNumber>,
    t2: VecDeque<BlockNumber>,
    b1: VecDeque<BlockNumber>,
    b2: VecDeque<BlockNumber>,
    loc: HashMap<BlockNumber, ArcList>,
    resident: HashMap<BlockNumber, Arc<[u8]>>,
    pins: HashMap<BlockNumber, usize>,
    outstanding: usize,
    hits: u64,
    misses: u64,
}

impl ArcState {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            p: 0,
            t1: VecDeque::new(),
            t2: VecDeque::new(),
            b1: VecDeque::new(),
            b2: VecDeque::new(),
            loc: HashMap::new(),
            resident: HashMap::new(),
            pins: HashMap::new(),
            outstanding: 0,
            hits: 0,
            misses: 0,
        }
    }

    fn remove_from_list(list: &mut VecDeque<BlockNumber>, key: BlockNumber) -> bool {
        if let Some(pos) = list.iter().position(|k| *k == key) {
            let _ = list.remove(pos);
            return true;
        }
        false
    }

    /// Oldest entry of `list` that is not pinned.
    fn pop_unpinned(
        list: &mut VecDeque<BlockNumber>,
        pins: &HashMap<BlockNumber, usize>,
    ) -> Option<BlockNumber> {
        let pos = list.iter().position(|k| !pins.contains_key(k))?;
        list.remove(pos)
    }

    fn touch_mru(&mut self, key: BlockNumber) {
        match self.loc.get(&key).copied() {
            Some(ArcList::T1) => {
                let _ = Self::remove_from_list(&mut self.t1, key);
                self.t2.push_back(key);
                self.loc.insert(key, ArcList::T2);
            }
            Some(ArcList::T2) => {
                let _ = Self::remove_from_list(&mut self.t2, key);
                self.t2.push_back(key);
            }
            Some(ArcList::B1 | ArcList::B2) | None => {}
        }
    }

    fn evict_from_t1(&mut self) -> bool {
        match Self::pop_unpinned(&mut self.t1, &self.pins) {
            Some(victim) => {
                self.loc.insert(victim, ArcList::B1);
                let _ = self.resident.remove(&victim);
                self.b1.push_back(victim);
                trace!(block = victim.0, "arc evict t1");
                true
            }
            None => false,
        }
    }

    fn evict_from_t2(&mut self) -> bool {
        match Self::pop_unpinned(&mut self.t2, &self.pins) {
            Some(victim) => {
                self.loc.insert(victim, ArcList::B2);
                let _ = self.resident.remove(&victim);
                self.b2.push_back(victim);
                trace!(block = victim.0, "arc evict t2");
                true
            }
            None => false,
        }
    }

    /// Evict until a slot is free for `incoming`. Pinned blocks are never
    /// victims, so the resident set may stay above capacity while pins are
    /// held; it shrinks back on the next admission after they are released.
    fn replace(&mut self, incoming: BlockNumber) {
        let incoming_from_b2 = matches!(self.loc.get(&incoming), Some(ArcList::B2));
        while self.resident.len() >= self.capacity {
            let t1_len = self.t1.len();
            let prefer_t1 =
                t1_len >= 1 && (t1_len > self.p || (incoming_from_b2 && t1_len == self.p));
            let evicted = if prefer_t1 {
                self.evict_from_t1() || self.evict_from_t2()
            } else {
                self.evict_from_t2() || self.evict_from_t1()
            };
            if !evicted {
                trace!(
                    resident = self.resident.len(),
                    "all resident blocks pinned; growing past capacity"
                );
                break;
            }
        }

        while self.b1.len() > self.capacity {
            if let Some(victim) = self.b1.pop_front() {
                let _ = self.loc.remove(&victim);
            }
        }
        while self.b2.len() > self.capacity {
            if let Some(victim) = self.b2.pop_front() {
                let _ = self.loc.remove(&victim);
            }
        }
    }

    fn admit(&mut self, key: BlockNumber, data: Arc<[u8]>) {
        match self.loc.get(&key).copied() {
            Some(ArcList::B1) => {
                let delta = (self.b2.len().max(1) / self.b1.len().max(1)).max(1);
                self.p = (self.p + delta).min(self.capacity);
                let _ = Self::remove_from_list(&mut self.b1, key);
                self.replace(key);
                self.t2.push_back(key);
                self.loc.insert(key, ArcList::T2);
            }
            Some(ArcList::B2) => {
                let delta = (self.b1.len().max(1) / self.b2.len().max(1)).max(1);
                self.p = self.p.saturating_sub(delta);
                let _ = Self::remove_from_list(&mut self.b2, key);
                self.replace(key);
                self.t2.push_back(key);
                self.loc.insert(key, ArcList::T2);
            }
            Some(ArcList::T1 | ArcList::T2) => {
                // Raced with another reader that admitted the block first.
                self.touch_mru(key);
            }
            None => {
                if self.t1.len() + self.b1.len() >= self.capacity && !self.b1.is_empty() {
                    let _ = self.b1.pop_front().and_then(|v| self.loc.remove(&v));
                } else if self.t1.len() + self.t2.len() + self.b1.len() + self.b2.len()
                    >= self.capacity.saturating_mul(2)
                {
                    let _ = self.b2.pop_front().and_then(|v| self.loc.remove(&v));
                }
                self.replace(key);
                self.t1.push_back(key);
                self.loc.insert(key, ArcList::T1);
            }
        }
        self.resident.insert(key, data);
    }

    fn acquire(&mut self, key: BlockNumber, pin: bool) {
        self.outstanding += 1;
        if pin {
            *self.pins.entry(key).or_insert(0) += 1;
        }
    }
}

/// Snapshot of cache bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub resident: usize,
    pub pinned_blocks: usize,
    pub outstanding: usize,
    pub hits: u64,
    pub misses: u64,
}

/// ARC-cached, pin-aware [`BufferCache`] over a [`BlockDevice`].
pub struct PinnedArcCache<D: BlockDevice> {
    inner: D,
    block_size: BlockSize,
    state: Mutex<ArcState>,
}

impl<D: BlockDevice> PinnedArcCache<D> {
    pub fn new(inner: D, capacity_blocks: usize) -> Result<Self> {
        if capacity_blocks == 0 {
            return Err(Ext4Error::Parse(
                "cache capacity_blocks must be > 0".to_owned(),
            ));
        }
        let block_size =
            BlockSize::new(inner.block_size()).map_err(|e| Ext4Error::Parse(e.to_string()))?;
        Ok(Self {
            inner,
            block_size,
            state: Mutex::new(ArcState::new(capacity_blocks)),
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            resident: state.resident.len(),
            pinned_blocks: state.pins.len(),
            outstanding: state.outstanding,
            hits: state.hits,
            misses: state.misses,
        }
    }
}

impl<D: BlockDevice> fmt::Debug for PinnedArcCache<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedArcCache")
            .field("block_size", &self.block_size)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<D: BlockDevice> BufferCache for PinnedArcCache<D> {
    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn request_block(&self, block: BlockNumber, pin: bool) -> Result<BlockGuard<'_>> {
        {
            let mut state = self.state.lock();
            if let Some(data) = state.resident.get(&block).cloned() {
                state.hits += 1;
                state.touch_mru(block);
                state.acquire(block, pin);
                drop(state);
                return Ok(BlockGuard::new(self, block, pin, data));
            }
        }

        let buf = self.inner.read_block(block).map_err(|err| match err {
            Ext4Error::BlockUnavailable { .. } => err,
            other => Ext4Error::BlockUnavailable {
                block: block.0,
                detail: other.to_string(),
            },
        })?;
        let data: Arc<[u8]> = Arc::from(buf.into_inner());

        let mut state = self.state.lock();
        state.misses += 1;
        state.admit(block, Arc::clone(&data));
        state.acquire(block, pin);
        drop(state);
        trace!(block = block.0, pin, "cache miss filled");
        Ok(BlockGuard::new(self, block, pin, data))
    }

    fn release(&self, block: BlockNumber, pinned: bool) {
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        if pinned {
            let remaining = state.pins.get_mut(&block).map(|count| {
                *count -= 1;
                *count
            });
            match remaining {
                Some(0) => {
                    let _ = state.pins.remove(&block);
                }
                Some(_) => {}
                None => warn!(block = block.0, "release of a block that is not pinned"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ByteBlockDevice, MemoryByteDevice};

    fn numbered_cache(blocks: usize, capacity: usize) -> PinnedArcCache<ByteBlockDevice<MemoryByteDevice>> {
        let mem = MemoryByteDevice::new(1024 * blocks);
        for b in 0..blocks {
            mem.write_at(1024 * b, &[u8::try_from(b).unwrap(); 1024]).unwrap();
        }
        let dev = ByteBlockDevice::new(mem, 1024).unwrap();
        PinnedArcCache::new(dev, capacity).unwrap()
    }

    #[test]
    fn guard_releases_on_drop() {
        let cache = numbered_cache(4, 2);
        {
            let guard = cache.request_block(BlockNumber(1), true).unwrap();
            assert_eq!(guard[0], 1);
            assert_eq!(cache.stats().outstanding, 1);
            assert_eq!(cache.stats().pinned_blocks, 1);
        }
        let stats = cache.stats();
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.pinned_blocks, 0);
    }

    #[test]
    fn hits_after_first_read() {
        let cache = numbered_cache(4, 2);
        drop(cache.request_block(BlockNumber(3), false).unwrap());
        let again = cache.request_block(BlockNumber(3), false).unwrap();
        assert_eq!(again.as_slice(), &[3_u8; 1024]);
        drop(again);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn pinned_block_survives_eviction_pressure() {
        let cache = numbered_cache(8, 2);
        let pinned = cache.request_block(BlockNumber(0), true).unwrap();
        for b in 1..8 {
            drop(cache.request_block(BlockNumber(b), false).unwrap());
        }
        let before = cache.stats().misses;
        drop(cache.request_block(BlockNumber(0), false).unwrap());
        assert_eq!(cache.stats().misses, before, "pinned block was evicted");
        drop(pinned);
        assert_eq!(cache.stats().outstanding, 0);
    }

    #[test]
    fn unpinned_blocks_are_evicted_at_capacity() {
        let cache = numbered_cache(8, 2);
        for b in 0..8 {
            drop(cache.request_block(BlockNumber(b), false).unwrap());
        }
        assert!(cache.stats().resident <= 2);
    }

    #[test]
    fn overflow_from_pins_drains_on_next_miss() {
        let cache = numbered_cache(8, 2);
        let held: Vec<_> = (0..4)
            .map(|b| cache.request_block(BlockNumber(b), true).unwrap())
            .collect();
        assert_eq!(cache.stats().resident, 4);
        drop(held);
        assert_eq!(cache.stats().pinned_blocks, 0);

        drop(cache.request_block(BlockNumber(4), false).unwrap());
        assert!(cache.stats().resident <= 2);
        drop(cache.request_block(BlockNumber(5), false).unwrap());
        assert!(cache.stats().resident <= 2);
    }

    #[test]
    fn detached_block_released_explicitly() {
        let cache = numbered_cache(4, 2);
        let detached = cache.request_block(BlockNumber(2), true).unwrap().detach();
        assert_eq!(cache.stats().outstanding, 1);
        assert_eq!(detached.as_slice()[0], 2);
        detached.release(&cache);
        assert_eq!(cache.stats().outstanding, 0);
        assert_eq!(cache.stats().pinned_blocks, 0);
    }

    #[test]
    fn reattached_block_releases_on_drop() {
        let cache = numbered_cache(4, 2);
        let detached = cache.request_block(BlockNumber(1), true).unwrap().detach();
        let guard = detached.reattach(&cache);
        assert_eq!(guard.block(), Some(BlockNumber(1)));
        drop(guard);
        assert_eq!(cache.stats().outstanding, 0);
    }

    #[test]
    fn zeroed_guard_is_transient() {
        let bs = BlockSize::new(1024).unwrap();
        let guard = BlockGuard::zeroed(bs);
        assert!(guard.is_transient());
        assert_eq!(guard.len(), 1024);
        assert!(guard.iter().all(|b| *b == 0));
        drop(guard.detach());
    }

    #[test]
    fn device_failure_becomes_block_unavailable() {
        let cache = numbered_cache(2, 2);
        let err = cache.request_block(BlockNumber(9), false).unwrap_err();
        assert!(matches!(err, Ext4Error::BlockUnavailable { block: 9, .. }));
        assert_eq!(cache.stats().outstanding, 0);
    }

    #[test]
    fn capacity_zero_rejected() {
        let dev = ByteBlockDevice::new(MemoryByteDevice::new(1024), 1024).unwrap();
        assert!(PinnedArcCache::new(dev, 0).is_err());
    }
}
