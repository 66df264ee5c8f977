//! Per-worker scratch arenas and the pool that recycles them.
//!
//! Every worker gets an [`Arena`] for the lifetime of its run. When the worker
//! exits, the arena goes back to the [`ArenaPool`] instead of being freed, and
//! the next worker picks it up after a reset.
//!
//! A context starts a single worker, so within one context the pool only
//! parks that worker's arena at shutdown. Reuse happens when another worker
//! is started on the same [`Allocators`].

/// Size of the first chunk carved for an arena.
const INITIAL_CHUNK: usize = 4096;

/// Root allocator that all arenas and shared caches are carved from.
#[derive(Debug, Default)]
pub struct SuperAllocator {
    arenas_carved: usize,
    shared_reserved: usize,
}

impl SuperAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a fresh arena serving worker `worker_num`.
    pub fn carve(&mut self, worker_num: u32) -> Box<Arena> {
        self.arenas_carved += 1;
        Box::new(Arena {
            worker_num,
            chunks: Vec::new(),
            used: 0,
            next: None,
        })
    }

    /// Reserves `bytes` for a cache shared by all workers.
    pub fn reserve_shared(&mut self, bytes: usize) -> SharedCache {
        self.shared_reserved = self.shared_reserved.saturating_add(bytes);
        SharedCache { capacity: bytes }
    }

    /// Returns a reservation that was never put to use.
    pub fn release_shared(&mut self, cache: SharedCache) {
        self.shared_reserved = self.shared_reserved.saturating_sub(cache.capacity);
    }

    /// Number of arenas built from scratch so far.
    #[must_use]
    pub const fn arenas_carved(&self) -> usize {
        self.arenas_carved
    }

    /// Total bytes reserved for shared caches.
    #[must_use]
    pub const fn shared_reserved(&self) -> usize {
        self.shared_reserved
    }
}

/// A shared cache budget carved from the [`SuperAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedCache {
    pub capacity: usize,
}

/// Bump-style scratch memory owned by one worker at a time.
#[derive(Debug)]
pub struct Arena {
    worker_num: u32,
    chunks: Vec<Vec<u8>>,
    used: usize,
    /// Free-list link while parked in the pool.
    next: Option<Box<Arena>>,
}

impl Arena {
    /// Hands out `len` zeroed bytes that live until the next [`reset`](Self::reset).
    pub fn alloc(&mut self, len: usize) -> &mut [u8] {
        let fits = self
            .chunks
            .last()
            .is_some_and(|c| c.capacity() - c.len() >= len);
        if !fits {
            let last = self.chunks.last().map_or(INITIAL_CHUNK / 2, Vec::capacity);
            let size = (last * 2).max(len).max(INITIAL_CHUNK);
            self.chunks.push(Vec::with_capacity(size));
        }
        self.used += len;

        let last = self.chunks.len() - 1;
        let chunk = &mut self.chunks[last];
        let start = chunk.len();
        chunk.resize(start + len, 0);
        &mut chunk[start..]
    }

    /// Copies `bytes` into the arena.
    pub fn alloc_copy(&mut self, bytes: &[u8]) -> &mut [u8] {
        let out = self.alloc(bytes.len());
        out.copy_from_slice(bytes);
        out
    }

    /// Bytes handed out since the last reset.
    #[must_use]
    pub const fn allocated(&self) -> usize {
        self.used
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Bytes of backing storage kept across resets.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.chunks.iter().map(Vec::capacity).sum()
    }

    /// Worker this arena currently serves.
    #[must_use]
    pub const fn worker_num(&self) -> u32 {
        self.worker_num
    }

    /// Forgets every allocation; the largest chunk is kept for reuse.
    pub fn reset(&mut self) {
        let biggest = (0..self.chunks.len()).max_by_key(|&i| self.chunks[i].capacity());
        if let Some(i) = biggest {
            let mut keep = self.chunks.swap_remove(i);
            keep.clear();
            self.chunks.clear();
            self.chunks.push(keep);
        }
        self.used = 0;
    }
}

/// Free list of arenas left behind by exited workers.
///
/// A singly linked list threaded through [`Arena`]'s own link field. Any
/// parked arena may be handed out next.
#[derive(Debug, Default)]
pub struct ArenaPool {
    head: Option<Box<Arena>>,
    len: usize,
}

impl ArenaPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a parked arena, reset and re-parented for `worker_num`, or carves
    /// a new one from `root`.
    pub fn acquire(&mut self, root: &mut SuperAllocator, worker_num: u32) -> Box<Arena> {
        match self.head.take() {
            Some(mut arena) => {
                self.head = arena.next.take();
                self.len -= 1;
                arena.reset();
                arena.worker_num = worker_num;
                tracing::debug!(worker = worker_num, "Reusing pooled arena");
                arena
            }
            None => root.carve(worker_num),
        }
    }

    /// Parks an arena for a later worker.
    pub fn release(&mut self, mut arena: Box<Arena>) {
        arena.next = self.head.take();
        self.head = Some(arena);
        self.len += 1;
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for ArenaPool {
    fn drop(&mut self) {
        // Unlink iteratively so a long list does not recurse on drop.
        let mut cur = self.head.take();
        while let Some(mut arena) = cur {
            cur = arena.next.take();
        }
    }
}

/// The super-allocator together with its recycling pool, guarded as one unit.
#[derive(Debug, Default)]
pub struct Allocators {
    pub root: SuperAllocator,
    pub pool: ArenaPool,
}

impl Allocators {
    pub fn acquire(&mut self, worker_num: u32) -> Box<Arena> {
        self.pool.acquire(&mut self.root, worker_num)
    }

    pub fn release(&mut self, arena: Box<Arena>) {
        self.pool.release(arena);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_spans_chunks() {
        let mut root = SuperAllocator::new();
        let mut arena = root.carve(0);
        arena.alloc_copy(b"abc");
        let big = arena.alloc(INITIAL_CHUNK * 3);
        assert_eq!(big.len(), INITIAL_CHUNK * 3);
        assert!(big.iter().all(|b| *b == 0));
        assert_eq!(arena.allocated(), 3 + INITIAL_CHUNK * 3);
    }

    #[test]
    fn released_arena_comes_back_empty() {
        let mut allocs = Allocators::default();
        let mut arena = allocs.acquire(1);
        arena.alloc_copy(b"residue from worker one");
        let capacity = arena.capacity();
        allocs.release(arena);
        assert_eq!(allocs.pool.len(), 1);

        let mut again = allocs.acquire(2);
        assert!(again.is_empty());
        assert_eq!(again.worker_num(), 2);
        assert_eq!(again.capacity(), capacity);
        assert_eq!(allocs.root.arenas_carved(), 1);
        assert!(allocs.pool.is_empty());

        assert_eq!(again.alloc_copy(b"fresh"), b"fresh");
    }

    #[test]
    fn pool_carves_when_empty() {
        let mut allocs = Allocators::default();
        let a = allocs.acquire(1);
        let b = allocs.acquire(2);
        assert_eq!(allocs.root.arenas_carved(), 2);
        allocs.release(a);
        allocs.release(b);
        assert_eq!(allocs.pool.len(), 2);
        let _ = allocs.acquire(3);
        let _ = allocs.acquire(4);
        let _ = allocs.acquire(5);
        assert_eq!(allocs.root.arenas_carved(), 3);
    }

    #[test]
    fn shared_reservations_accumulate() {
        let mut root = SuperAllocator::new();
        assert_eq!(root.reserve_shared(100).capacity, 100);
        let second = root.reserve_shared(50);
        assert_eq!(root.shared_reserved(), 150);
        root.release_shared(second);
        assert_eq!(root.shared_reserved(), 100);
    }
}
