//! Bump allocator serving memory from large blocks.
//!
//! Memory is handed out as [`ArenaSpan`] handles rather than pointers, typed access goes
//! through `bytemuck`, so everything stored in the arena must be `Pod`.
//! Individual allocations are never freed; [`MemoryArena::reset`] recycles all blocks at once
//! and invalidates every span handed out before it.

use std::marker::PhantomData;

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArenaError {
    #[error("Failed to allocate a {size} byte arena block")]
    OutOfMemory { size: usize },
}

/// Unit of block storage, forces block alignment.
#[derive(Copy, Clone, Pod, Zeroable)]
#[repr(C, align(16))]
struct Chunk([u8; MemoryArena::ALIGN]);

type BlockIdx = u32;

/// Handle to a range of bytes allocated from a [`MemoryArena`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ArenaSpan {
    block: BlockIdx,
    offset: u32,
    len: u32,
    generation: u32,
}

impl ArenaSpan {
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// [`ArenaSpan`] holding `T` values.
#[derive(Debug, PartialEq, Eq)]
pub struct TypedSpan<T> {
    span: ArenaSpan,
    count: usize,
    _type: PhantomData<fn() -> T>,
}

impl<T> Clone for TypedSpan<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TypedSpan<T> {}

impl<T: Pod> TypedSpan<T> {
    /// Span holding a single value, as stored by [`MemoryArena::alloc_value`].
    pub fn from_value_span(span: ArenaSpan) -> Self {
        debug_assert!(span.len() >= std::mem::size_of::<T>());
        TypedSpan {
            span,
            count: 1,
            _type: PhantomData,
        }
    }
}

impl<T> TypedSpan<T> {
    pub fn span(&self) -> ArenaSpan {
        self.span
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

pub struct MemoryArena {
    block_size: usize,

    /// Upper bound on [`Self::total_allocated`], if any.
    limit: Option<usize>,

    blocks: Vec<Vec<Chunk>>,
    current_block: Option<BlockIdx>,
    /// Write cursor in the current block, in bytes
    current_block_pos: usize,
    used_blocks: Vec<BlockIdx>,
    available_blocks: Vec<BlockIdx>,

    generation: u32,
}

impl MemoryArena {
    /// Alignment of every allocation, matches the strictest scalar alignment on common platforms.
    pub const ALIGN: usize = 16;

    pub const DEFAULT_BLOCK_SIZE: usize = 256 * 1024;

    /// Largest block, and so the largest single allocation, that spans can address.
    pub const MAX_BLOCK_SIZE: usize = u32::MAX as usize & !(Self::ALIGN - 1);

    /// Block sizes are rounded up to [`Self::ALIGN`] and clamped to [`Self::MAX_BLOCK_SIZE`].
    pub fn new(block_size: usize) -> Self {
        MemoryArena {
            block_size: round_up(block_size.clamp(1, Self::MAX_BLOCK_SIZE))
                .unwrap_or(Self::MAX_BLOCK_SIZE),
            limit: None,
            blocks: Vec::new(),
            current_block: None,
            current_block_pos: 0,
            used_blocks: Vec::new(),
            available_blocks: Vec::new(),
            generation: 0,
        }
    }

    /// Arena with blocks of `mib` mebibytes.
    pub fn with_block_size_mib(mib: usize) -> Self {
        Self::new(mib.saturating_mul(1024 * 1024))
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Caps the memory the arena may take from the system.
    /// Allocations that would need a new block beyond the limit fail with
    /// [`ArenaError::OutOfMemory`], recycled blocks are not affected.
    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Allocates `n_bytes` bytes, rounded up to [`Self::ALIGN`].
    pub fn alloc(&mut self, n_bytes: usize) -> Result<ArenaSpan, ArenaError> {
        let n_bytes = round_up(n_bytes)
            .filter(|&n| n <= Self::MAX_BLOCK_SIZE)
            .ok_or(ArenaError::OutOfMemory { size: n_bytes })?;

        let block = match self.current_block {
            Some(block) if n_bytes <= self.block_len(block) - self.current_block_pos => block,
            current => {
                if let Some(block) = current {
                    self.used_blocks.push(block);
                    self.current_block = None;
                }

                let recycled = self
                    .available_blocks
                    .iter()
                    .position(|&block| self.block_len(block) >= n_bytes)
                    .map(|i| self.available_blocks.remove(i));

                let block = match recycled {
                    Some(block) => block,
                    None => self.new_block(n_bytes.max(self.block_size))?,
                };
                self.current_block = Some(block);
                self.current_block_pos = 0;
                block
            }
        };

        let span = ArenaSpan {
            block,
            offset: to_u32(self.current_block_pos, n_bytes)?,
            len: to_u32(n_bytes, n_bytes)?,
            generation: self.generation,
        };
        self.current_block_pos += n_bytes;

        Ok(span)
    }

    /// Allocates space for `n` values of `T`.
    /// With `run_constructor` every value is set to `T::default()`, otherwise the content is
    /// whatever was left in the block (zeroes for a fresh block).
    pub fn alloc_slice<T: Pod + Default>(
        &mut self,
        n: usize,
        run_constructor: bool,
    ) -> Result<TypedSpan<T>, ArenaError> {
        assert2::assert!(std::mem::align_of::<T>() <= Self::ALIGN);
        let n_bytes = n
            .checked_mul(std::mem::size_of::<T>())
            .ok_or(ArenaError::OutOfMemory { size: usize::MAX })?;
        let span = self.alloc(n_bytes)?;
        let typed = TypedSpan {
            span,
            count: n,
            _type: PhantomData,
        };

        if run_constructor {
            self.slice_mut(typed).fill(T::default());
        }

        Ok(typed)
    }

    /// Allocates a single value.
    pub fn alloc_value<T: Pod>(&mut self, value: T) -> Result<TypedSpan<T>, ArenaError> {
        assert2::assert!(std::mem::align_of::<T>() <= Self::ALIGN);
        let span = self.alloc(std::mem::size_of::<T>())?;
        let typed = TypedSpan {
            span,
            count: 1,
            _type: PhantomData,
        };
        self.slice_mut(typed)[0] = value;
        Ok(typed)
    }

    pub fn bytes(&self, span: ArenaSpan) -> &[u8] {
        self.check_generation(span);
        let block: &[u8] = bytemuck::cast_slice(&self.blocks[span.block as usize]);
        &block[span.offset as usize..][..span.len()]
    }

    pub fn bytes_mut(&mut self, span: ArenaSpan) -> &mut [u8] {
        self.check_generation(span);
        let block: &mut [u8] = bytemuck::cast_slice_mut(&mut self.blocks[span.block as usize]);
        &mut block[span.offset as usize..][..span.len()]
    }

    pub fn slice<T: Pod>(&self, span: TypedSpan<T>) -> &[T] {
        let bytes = &self.bytes(span.span)[..span.count * std::mem::size_of::<T>()];
        bytemuck::cast_slice(bytes)
    }

    pub fn slice_mut<T: Pod>(&mut self, span: TypedSpan<T>) -> &mut [T] {
        let bytes = &mut self.bytes_mut(span.span)[..span.count * std::mem::size_of::<T>()];
        bytemuck::cast_slice_mut(bytes)
    }

    pub fn value<T: Pod>(&self, span: TypedSpan<T>) -> &T {
        &self.slice(span)[0]
    }

    pub fn value_mut<T: Pod>(&mut self, span: TypedSpan<T>) -> &mut T {
        &mut self.slice_mut(span)[0]
    }

    /// Makes all memory available again without returning it to the system.
    /// Spans allocated before the reset must not be used afterwards.
    pub fn reset(&mut self) {
        self.current_block_pos = 0;
        let mut used = std::mem::take(&mut self.used_blocks);
        used.append(&mut self.available_blocks);
        self.available_blocks = used;
        self.generation = self.generation.wrapping_add(1);
    }

    /// Sum of capacities of all blocks owned by the arena, in bytes.
    pub fn total_allocated(&self) -> usize {
        self.blocks.iter().map(|block| block.len() * Self::ALIGN).sum()
    }

    fn block_len(&self, block: BlockIdx) -> usize {
        self.blocks[block as usize].len() * Self::ALIGN
    }

    fn new_block(&mut self, size: usize) -> Result<BlockIdx, ArenaError> {
        if self.limit.is_some_and(|limit| self.total_allocated() + size > limit) {
            return Err(ArenaError::OutOfMemory { size });
        }

        let block = bytemuck::allocation::try_zeroed_vec::<Chunk>(size / Self::ALIGN)
            .map_err(|()| ArenaError::OutOfMemory { size })?;

        let index = BlockIdx::try_from(self.blocks.len()).map_err(|_| ArenaError::OutOfMemory { size })?;
        tracing::debug!(
            "arena block {index} allocated, {:.2} MB",
            size as f32 / (1024.0 * 1024.0)
        );
        self.blocks.push(block);
        Ok(index)
    }

    fn check_generation(&self, span: ArenaSpan) {
        if span.generation != self.generation {
            panic!("arena span used after the arena was reset");
        }
    }
}

impl Default for MemoryArena {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BLOCK_SIZE)
    }
}

impl std::fmt::Debug for MemoryArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryArena")
            .field("block_size", &self.block_size)
            .field("limit", &self.limit)
            .field("block_count", &self.blocks.len())
            .field("current_block", &self.current_block)
            .field("current_block_pos", &self.current_block_pos)
            .field("used_blocks", &self.used_blocks)
            .field("available_blocks", &self.available_blocks)
            .field("generation", &self.generation)
            .finish()
    }
}

fn round_up(n_bytes: usize) -> Option<usize> {
    n_bytes
        .checked_add(MemoryArena::ALIGN - 1)
        .map(|n| n & !(MemoryArena::ALIGN - 1))
}

fn to_u32(value: usize, requested: usize) -> Result<u32, ArenaError> {
    u32::try_from(value).map_err(|_| ArenaError::OutOfMemory { size: requested })
}

#[cfg(test)]
mod test {
    use super::*;

    use assert2::{assert, let_assert};
    use test_case::test_case;
    use test_strategy::proptest;

    #[test_case(0, 0)]
    #[test_case(1, 16)]
    #[test_case(16, 16)]
    #[test_case(17, 32)]
    fn allocation_size_is_rounded(requested: usize, expected: usize) {
        let mut arena = MemoryArena::new(1024);
        let span = arena.alloc(requested).unwrap();
        assert!(span.len() == expected);
    }

    #[proptest]
    fn allocations_are_aligned_and_disjoint(
        #[strategy(proptest::collection::vec(0usize..300, 1..50))] sizes: Vec<usize>,
    ) {
        let mut arena = MemoryArena::new(512);
        let spans: Vec<_> = sizes.iter().map(|&n| arena.alloc(n).unwrap()).collect();

        for (span, &n) in spans.iter().zip(&sizes) {
            assert!(span.offset as usize % MemoryArena::ALIGN == 0);
            assert!(span.len() >= n);
            assert!(arena.bytes(*span).as_ptr() as usize % MemoryArena::ALIGN == 0);
        }

        for (i, a) in spans.iter().enumerate() {
            for b in &spans[i + 1..] {
                let disjoint = a.block != b.block
                    || a.offset + a.len <= b.offset
                    || b.offset + b.len <= a.offset;
                assert!(disjoint, "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn block_is_retired_when_full() {
        let mut arena = MemoryArena::new(64);
        let a = arena.alloc(48).unwrap();
        let b = arena.alloc(32).unwrap();
        assert!(a.block != b.block);
        assert!(b.offset == 0);
        assert!(arena.used_blocks == vec![a.block]);
        assert!(arena.total_allocated() == 128);
    }

    #[test]
    fn oversized_request_gets_own_block() {
        let mut arena = MemoryArena::new(64);
        let span = arena.alloc(1000).unwrap();
        assert!(span.len() == 1008);
        assert!(arena.total_allocated() == 1008);
    }

    #[test]
    fn reset_recycles_blocks() {
        let mut arena = MemoryArena::new(64);
        for _ in 0..10 {
            arena.alloc(64).unwrap();
        }
        let total = arena.total_allocated();
        assert!(total == 640);

        arena.reset();
        assert!(arena.used_blocks.is_empty());
        assert!(arena.available_blocks.len() == 9);

        for _ in 0..10 {
            arena.alloc(64).unwrap();
        }
        assert!(arena.total_allocated() == total);
    }

    #[test]
    fn recycled_block_must_be_large_enough() {
        let mut arena = MemoryArena::new(64);
        arena.alloc(64).unwrap();
        arena.alloc(64).unwrap();
        arena.reset();

        // Current block is rewound and still has room
        arena.alloc(64).unwrap();
        // Only the small block is available, so a fresh one is needed
        let big = arena.alloc(256).unwrap();
        assert!(big.block == 2);
        assert!(arena.total_allocated() == 64 + 64 + 256);
    }

    #[test]
    fn typed_values() {
        let mut arena = MemoryArena::new(64);
        let values = arena.alloc_slice::<[f32; 3]>(7, true).unwrap();
        assert!(arena.slice(values) == &[[0.0; 3]; 7]);

        arena.slice_mut(values)[3] = [1.0, 2.0, 3.0];
        let single = arena.alloc_value(42u64).unwrap();

        assert!(arena.slice(values)[3] == [1.0, 2.0, 3.0]);
        assert!(*arena.value(single) == 42);

        *arena.value_mut(single) += 1;
        assert!(*arena.value(single) == 43);
    }

    #[test]
    fn constructor_clears_recycled_memory() {
        let mut arena = MemoryArena::new(64);
        let first = arena.alloc_slice::<u32>(4, false).unwrap();
        arena.slice_mut(first).fill(0xdead);
        arena.reset();

        let second = arena.alloc_slice::<u32>(4, true).unwrap();
        assert!(second.span().offset == 0);
        assert!(arena.slice(second) == &[0, 0, 0, 0]);
    }

    #[test]
    #[should_panic(expected = "arena span used after the arena was reset")]
    fn stale_span_is_rejected() {
        let mut arena = MemoryArena::new(64);
        let span = arena.alloc(16).unwrap();
        arena.reset();
        arena.bytes(span);
    }

    #[test]
    fn out_of_memory_is_reported() {
        let mut arena = MemoryArena::new(64);
        let_assert!(Err(ArenaError::OutOfMemory { .. }) = arena.alloc(usize::MAX / 2));
    }

    #[test_case(usize::MAX)]
    #[test_case(usize::MAX - 3)]
    #[test_case(MemoryArena::MAX_BLOCK_SIZE + 1)]
    fn request_near_usize_max_fails(requested: usize) {
        let mut arena = MemoryArena::new(64);
        let_assert!(Err(ArenaError::OutOfMemory { size }) = arena.alloc(requested));
        assert!(size == requested);
        assert!(arena.total_allocated() == 0);
    }

    #[test]
    fn slice_size_overflow_fails() {
        let mut arena = MemoryArena::new(64);
        let_assert!(
            Err(ArenaError::OutOfMemory { .. }) = arena.alloc_slice::<u64>(usize::MAX / 4, false)
        );
    }

    #[test_case(usize::MAX)]
    #[test_case(usize::MAX - 3)]
    #[test_case(1 << 40)]
    fn huge_block_size_is_clamped(block_size: usize) {
        let arena = MemoryArena::new(block_size);
        assert!(arena.block_size() == MemoryArena::MAX_BLOCK_SIZE);
        let from_mib = MemoryArena::with_block_size_mib(usize::MAX);
        assert!(from_mib.block_size() == MemoryArena::MAX_BLOCK_SIZE);
    }

    #[test]
    fn fresh_blocks_are_zeroed() {
        let mut arena = MemoryArena::new(256);
        let span = arena.alloc(200).unwrap();
        assert!(arena.bytes(span).iter().all(|&b| b == 0));
    }

    #[test]
    fn limit_stops_new_blocks() {
        let mut arena = MemoryArena::new(64);
        arena.set_limit(Some(128));
        let a = arena.alloc(64).unwrap();
        arena.alloc(64).unwrap();
        let_assert!(Err(ArenaError::OutOfMemory { size }) = arena.alloc(16));
        assert!(size == 64);
        assert!(arena.total_allocated() == 128);

        // Recycled blocks don't count against the limit
        arena.reset();
        let b = arena.alloc(64).unwrap();
        arena.alloc(64).unwrap();
        assert!(b.block == a.block);
        assert!(b.offset == 0);
        assert!(arena.total_allocated() == 128);
    }

    #[test]
    fn failed_block_allocation_keeps_arena_consistent() {
        let mut arena = MemoryArena::new(64);
        arena.set_limit(Some(64));
        let first = arena.alloc(48).unwrap();
        assert!(arena.alloc(32).is_err());
        assert!(arena.alloc(32).is_err());
        assert!(arena.used_blocks == vec![first.block]);

        arena.reset();
        assert!(arena.available_blocks == vec![first.block]);
        assert!(arena.alloc(64).is_ok());
    }
}
