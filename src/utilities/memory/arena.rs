//! Block-based typed arena used to allocate tree nodes and leaf payloads from many threads.
//!
//! Every worker thread owns a cached block taken from a shared pool. Allocation pushes into that
//! block without touching any shared state; only refilling a block takes the pool lock. Handles are
//! `(block, index)` pairs, so they remain valid when blocks are retired and later reused.

use crate::error::{BuildError, Result};
use crossbeam_utils::CachePadded;
use std::mem;
use std::ops::{Index, IndexMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Smallest number of items a freshly carved block holds.
pub const MIN_BLOCK_ITEMS: usize = 64;
/// Largest number of items a regular block holds. Slices larger than this get a dedicated block.
pub const MAX_BLOCK_ITEMS: usize = 1 << 16;
/// Primitive-count threshold used when the byte estimate gives no better information.
pub const DEFAULT_SINGLE_THREAD_THRESHOLD: usize = 1024;

/// Location of an item inside a [`FastAllocator`] / [`ArenaStorage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    pub block: u32,
    pub index: u32,
}

impl Handle {
    #[inline(always)]
    pub fn new(block: u32, index: u32) -> Self {
        Self { block, index }
    }

    /// Handle of the item `offset` slots after this one in the same block.
    #[inline(always)]
    pub fn offset(self, offset: usize) -> Self {
        Self {
            block: self.block,
            index: self.index + offset as u32,
        }
    }
}

/// Whether a block's memory was carved by the arena or donated by a caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockKind {
    Owned,
    Shared,
}

struct Block<T> {
    items: Vec<T>,
    kind: BlockKind,
}

impl<T> Block<T> {
    #[inline(always)]
    fn remaining(&self) -> usize {
        match self.kind {
            BlockKind::Owned => self.items.capacity() - self.items.len(),
            BlockKind::Shared => 0,
        }
    }
}

/// Blocks not currently cached by a thread. `None` marks a block checked out by some thread.
struct BlockPool<T> {
    blocks: Vec<Option<Block<T>>>,
    /// Retired owned blocks that still have room, reused before carving new memory.
    partial: Vec<u32>,
}

struct ThreadSlot<T> {
    block: Option<(u32, Block<T>)>,
}

/// Memory statistics of an arena.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArenaStatistics {
    pub block_count: usize,
    pub shared_block_count: usize,
    pub bytes_reserved: usize,
    pub bytes_used: usize,
    pub bytes_shared: usize,
}

/// Byte budget that may be shared by several arenas of one build.
#[derive(Debug)]
pub struct MemoryLimit {
    reserved: CachePadded<AtomicUsize>,
    max_bytes: usize,
}

impl MemoryLimit {
    pub fn new(max_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            reserved: CachePadded::new(AtomicUsize::new(0)),
            max_bytes,
        })
    }

    /// Bytes reserved so far by all arenas drawing on this budget.
    pub fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Relaxed)
    }

    fn reserve(&self, bytes: usize) -> Result<()> {
        let previous = self.reserved.fetch_add(bytes, Ordering::Relaxed);
        if previous.saturating_add(bytes) > self.max_bytes {
            self.reserved.fetch_sub(bytes, Ordering::Relaxed);
            return Err(BuildError::OutOfMemory {
                requested: previous.saturating_add(bytes),
                limit: self.max_bytes,
            });
        }
        Ok(())
    }
}

/// Thread-aware block allocator. See the module documentation.
pub struct FastAllocator<T> {
    pool: Mutex<BlockPool<T>>,
    slots: Box<[CachePadded<Mutex<ThreadSlot<T>>>]>,
    block_items: AtomicUsize,
    bytes_reserved: CachePadded<AtomicUsize>,
    bytes_used: CachePadded<AtomicUsize>,
    limit: Arc<MemoryLimit>,
}

fn lock<G>(mutex: &Mutex<G>) -> MutexGuard<'_, G> {
    // A panic while holding the lock cannot leave a block half-moved; keep going.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T> Default for FastAllocator<T> {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

impl<T> FastAllocator<T> {
    /// Creates an empty arena that refuses to reserve more than `max_bytes` in total.
    pub fn new(max_bytes: usize) -> Self {
        Self::with_limit(MemoryLimit::new(max_bytes))
    }

    /// Creates an empty arena drawing on a budget shared with other arenas.
    pub fn with_limit(limit: Arc<MemoryLimit>) -> Self {
        // One slot per worker of the current pool plus one for threads outside of it.
        let slot_count = rayon::current_num_threads() + 1;
        let slots = (0..slot_count)
            .map(|_| CachePadded::new(Mutex::new(ThreadSlot { block: None })))
            .collect();
        Self {
            pool: Mutex::new(BlockPool {
                blocks: Vec::new(),
                partial: Vec::new(),
            }),
            slots,
            block_items: AtomicUsize::new(MIN_BLOCK_ITEMS * 16),
            bytes_reserved: CachePadded::new(AtomicUsize::new(0)),
            bytes_used: CachePadded::new(AtomicUsize::new(0)),
            limit,
        }
    }

    #[inline(always)]
    fn item_size() -> usize {
        mem::size_of::<T>().max(1)
    }

    /// Pre-sizes the block size from an estimate of the total bytes this arena will hand out,
    /// so that each thread refills from the shared pool only a handful of times.
    pub fn init_estimate(&self, bytes_estimate: usize) {
        let threads = rayon::current_num_threads().max(1);
        let items = bytes_estimate / Self::item_size() / (4 * threads);
        let items = items.clamp(MIN_BLOCK_ITEMS, MAX_BLOCK_ITEMS);
        self.block_items.store(items, Ordering::Relaxed);
        log::debug!(
            "arena<{}>: estimate {} bytes, block size {} items",
            std::any::type_name::<T>(),
            bytes_estimate,
            items
        );
    }

    /// Number of items a regular block is carved with.
    pub fn block_items(&self) -> usize {
        self.block_items.load(Ordering::Relaxed)
    }

    /// Bytes of a regular block.
    pub fn block_bytes(&self) -> usize {
        self.block_items() * Self::item_size()
    }

    /// Primitive count below which a builder should stop forking tasks.
    ///
    /// If the whole build fits in fewer blocks than there are threads, each task is sized to
    /// fill roughly one block per child so that tiny builds do not drown in scheduling overhead.
    pub fn single_thread_threshold(
        &self,
        branching_factor: usize,
        prim_count: usize,
        bytes_estimate: usize,
    ) -> usize {
        if prim_count == 0 || bytes_estimate == 0 {
            return DEFAULT_SINGLE_THREAD_THRESHOLD;
        }
        let threads = rayon::current_num_threads().max(1);
        let single_thread_bytes = 2 * self.block_bytes();
        if bytes_estimate.div_ceil(single_thread_bytes) >= threads {
            return DEFAULT_SINGLE_THREAD_THRESHOLD;
        }
        let threshold = branching_factor * prim_count * self.block_bytes() / bytes_estimate;
        threshold.clamp(branching_factor, prim_count.max(branching_factor))
    }

    /// Returns the allocation handle for the calling thread.
    ///
    /// The handle keeps the thread's block for its lifetime and gives it back on drop.
    pub fn get_cached_allocator(&self) -> CachedAllocator<'_, T> {
        let slot = rayon::current_thread_index()
            .unwrap_or(self.slots.len() - 1)
            .min(self.slots.len() - 1);
        let block = lock(&self.slots[slot]).block.take();
        CachedAllocator {
            arena: self,
            slot,
            block,
        }
    }

    fn reserve(&self, items: usize) -> Result<()> {
        let bytes = items * Self::item_size();
        self.limit.reserve(bytes)?;
        self.bytes_reserved.fetch_add(bytes, Ordering::Relaxed);
        Ok(())
    }

    /// Takes a block with room for at least `items` items, reusing a retired one when possible.
    fn take_block(&self, items: usize) -> Result<(u32, Block<T>)> {
        let mut pool = lock(&self.pool);
        if let Some(position) = pool.partial.iter().position(|&id| {
            pool.blocks[id as usize]
                .as_ref()
                .is_some_and(|block| block.remaining() >= items)
        }) {
            let id = pool.partial.swap_remove(position);
            if let Some(block) = pool.blocks[id as usize].take() {
                return Ok((id, block));
            }
        }
        let capacity = items.max(self.block_items());
        self.reserve(capacity)?;
        let id = pool.blocks.len() as u32;
        pool.blocks.push(None);
        Ok((
            id,
            Block {
                items: Vec::with_capacity(capacity),
                kind: BlockKind::Owned,
            },
        ))
    }

    fn retire_block(&self, id: u32, block: Block<T>) {
        let mut pool = lock(&self.pool);
        if block.remaining() >= MIN_BLOCK_ITEMS {
            pool.partial.push(id);
        }
        pool.blocks[id as usize] = Some(block);
    }

    /// Donates an externally produced array as a read-only block and returns its block id.
    ///
    /// Handles into a shared block are created with [`Handle::new`] by the donor, who knows the
    /// layout. Shared blocks are never used for new allocations.
    pub fn share(&self, items: Vec<T>) -> u32 {
        let bytes = items.len() * Self::item_size();
        self.bytes_used.fetch_add(bytes, Ordering::Relaxed);
        let mut pool = lock(&self.pool);
        let id = pool.blocks.len() as u32;
        pool.blocks.push(Some(Block {
            items,
            kind: BlockKind::Shared,
        }));
        id
    }

    /// Registers an empty shared block to be filled by [`FastAllocator::share_into`] once the
    /// donated array is complete. Lets callers hand out handles into it ahead of time.
    pub fn reserve_shared(&self) -> u32 {
        self.share(Vec::new())
    }

    /// Fills a block registered with [`FastAllocator::reserve_shared`].
    pub fn share_into(&self, id: u32, items: Vec<T>) {
        let bytes = items.len() * Self::item_size();
        self.bytes_used.fetch_add(bytes, Ordering::Relaxed);
        let mut pool = lock(&self.pool);
        if let Some(Some(block)) = pool.blocks.get_mut(id as usize) {
            debug_assert!(
                block.kind == BlockKind::Shared && block.items.is_empty(),
                "Only reserved shared blocks can be filled."
            );
            block.items = items;
        }
    }

    pub fn statistics(&self) -> ArenaStatistics {
        let pool = lock(&self.pool);
        let mut stats = ArenaStatistics {
            block_count: pool.blocks.len(),
            bytes_reserved: self.bytes_reserved.load(Ordering::Relaxed),
            bytes_used: self.bytes_used.load(Ordering::Relaxed),
            ..Default::default()
        };
        for block in pool.blocks.iter().flatten() {
            if block.kind == BlockKind::Shared {
                stats.shared_block_count += 1;
                stats.bytes_shared += block.items.len() * Self::item_size();
            }
        }
        stats
    }

    /// Freezes the arena into indexable storage. All cached handles must have been dropped.
    pub fn into_storage(self) -> ArenaStorage<T> {
        let FastAllocator { pool, slots, .. } = self;
        let mut pool = pool.into_inner().unwrap_or_else(PoisonError::into_inner);
        for slot in slots.into_vec() {
            let slot = CachePadded::into_inner(slot)
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some((id, block)) = slot.block {
                pool.blocks[id as usize] = Some(block);
            }
        }
        let blocks = pool
            .blocks
            .into_iter()
            .map(|block| block.map(|block| block.items).unwrap_or_default())
            .collect();
        ArenaStorage { blocks }
    }
}

/// Per-thread allocation handle. See [`FastAllocator::get_cached_allocator`].
pub struct CachedAllocator<'a, T> {
    arena: &'a FastAllocator<T>,
    slot: usize,
    block: Option<(u32, Block<T>)>,
}

impl<'a, T> CachedAllocator<'a, T> {
    #[inline]
    fn ensure_room(&mut self, items: usize) -> Result<()> {
        if let Some((_, block)) = &self.block {
            if block.remaining() >= items {
                return Ok(());
            }
        }
        if let Some((id, block)) = self.block.take() {
            self.arena.retire_block(id, block);
        }
        self.block = Some(self.arena.take_block(items)?);
        Ok(())
    }

    /// Stores `value` and returns its handle.
    #[inline]
    pub fn alloc(&mut self, value: T) -> Result<Handle> {
        self.ensure_room(1)?;
        let (id, block) = self.current();
        let index = block.items.len() as u32;
        block.items.push(value);
        self.arena
            .bytes_used
            .fetch_add(FastAllocator::<T>::item_size(), Ordering::Relaxed);
        Ok(Handle::new(id, index))
    }

    /// Stores all values contiguously in one block and returns the handle of the first.
    pub fn alloc_slice<I>(&mut self, values: I) -> Result<Handle>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: ExactSizeIterator,
    {
        let values = values.into_iter();
        let count = values.len();
        self.ensure_room(count.max(1))?;
        let (id, block) = self.current();
        let index = block.items.len() as u32;
        block.items.extend(values);
        debug_assert!(
            block.items.len() <= block.items.capacity(),
            "A slice must never spill over its block."
        );
        self.arena
            .bytes_used
            .fetch_add(count * FastAllocator::<T>::item_size(), Ordering::Relaxed);
        Ok(Handle::new(id, index))
    }

    #[inline(always)]
    fn current(&mut self) -> (u32, &mut Block<T>) {
        match &mut self.block {
            Some((id, block)) => (*id, block),
            None => unreachable!("ensure_room always installs a block"),
        }
    }
}

impl<T> Drop for CachedAllocator<'_, T> {
    fn drop(&mut self) {
        let Some((id, block)) = self.block.take() else {
            return;
        };
        let mut slot = lock(&self.arena.slots[self.slot]);
        if slot.block.is_none() {
            slot.block = Some((id, block));
        } else {
            drop(slot);
            self.arena.retire_block(id, block);
        }
    }
}

/// Frozen contents of a [`FastAllocator`].
#[derive(Clone, Debug)]
pub struct ArenaStorage<T> {
    blocks: Vec<Vec<T>>,
}

impl<T> Default for ArenaStorage<T> {
    fn default() -> Self {
        Self { blocks: Vec::new() }
    }
}

impl<T> ArenaStorage<T> {
    #[inline(always)]
    pub fn get(&self, handle: Handle) -> &T {
        &self.blocks[handle.block as usize][handle.index as usize]
    }

    #[inline(always)]
    pub fn get_mut(&mut self, handle: Handle) -> &mut T {
        &mut self.blocks[handle.block as usize][handle.index as usize]
    }

    /// `count` consecutive items starting at `handle`.
    #[inline(always)]
    pub fn slice(&self, handle: Handle, count: usize) -> &[T] {
        let start = handle.index as usize;
        &self.blocks[handle.block as usize][start..start + count]
    }

    /// Total number of stored items.
    pub fn len(&self) -> usize {
        self.blocks.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> usize {
        self.len() * mem::size_of::<T>()
    }
}

impl<T> Index<Handle> for ArenaStorage<T> {
    type Output = T;

    #[inline(always)]
    fn index(&self, handle: Handle) -> &T {
        self.get(handle)
    }
}

impl<T> IndexMut<Handle> for ArenaStorage<T> {
    #[inline(always)]
    fn index_mut(&mut self, handle: Handle) -> &mut T {
        self.get_mut(handle)
    }
}
