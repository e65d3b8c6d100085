use super::config::{NODES_PER_BLOCK, POOL_ALIGN};
use super::error::MemoryError;
use super::raw::RawAllocator;
use super::stats;
use crate::sync::{Mutex, MutexGuard};
#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;
#[cfg(debug_assertions)]
use std::collections::HashMap;
use std::ptr::{self, NonNull};

/// In-place header at the start of every slot. Stays intact while the slot
/// is handed out (the payload begins right after it), so `bias` can always
/// be read back on free.
#[repr(C)]
struct FreeNode {
    bias: u32,
    prev: *mut FreeNode,
    next: *mut FreeNode,
}

/// Header at the start of every block.
#[repr(C)]
struct Block {
    free_node_count: u32,
    prev: *mut Block,
    next: *mut Block,
}

const fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Offset from a slot to its payload.
pub(crate) const NODE_HEADER_SIZE: usize = round_up(size_of::<FreeNode>(), POOL_ALIGN);
/// Offset from a block to its first slot.
pub(crate) const BLOCK_HEADER_SIZE: usize = round_up(size_of::<Block>(), POOL_ALIGN);

/// Block size for payloads of `node_size` bytes, or `None` if the block or
/// any slot offset inside it would not fit in an `isize`.
pub(crate) fn checked_block_size(node_size: usize) -> Option<usize> {
    let payload = node_size.checked_next_multiple_of(POOL_ALIGN)?;
    let stride = NODE_HEADER_SIZE.checked_add(payload)?;
    let block = stride
        .checked_mul(NODES_PER_BLOCK)?
        .checked_add(BLOCK_HEADER_SIZE)?;
    (block <= isize::MAX.cast_unsigned()).then_some(block)
}

const _: () = assert!(POOL_ALIGN.is_power_of_two());
const _: () = assert!(POOL_ALIGN >= align_of::<FreeNode>());
const _: () = assert!(POOL_ALIGN >= align_of::<Block>());
const _: () = assert!(NODES_PER_BLOCK <= u32::MAX as usize);

/// Block list, free list and counters. Only touched under the pool mutex.
struct PoolState {
    head_block: *mut Block,
    tail_block: *mut Block,
    head_free: *mut FreeNode,
    tail_free: *mut FreeNode,
    block_count: usize,
    free_nodes: usize,
    recycled_bytes: usize,
    /// Per-block occupancy, keyed by block address. Catches double frees
    /// and frees of slots that were never handed out.
    #[cfg(debug_assertions)]
    live_map: HashMap<usize, FixedBitSet>,
}

// Safety: PoolState owns the blocks its pointers refer to; it is only ever
// accessed behind the pool mutex.
unsafe impl Send for PoolState {}

impl PoolState {
    fn new() -> Self {
        Self {
            head_block: ptr::null_mut(),
            tail_block: ptr::null_mut(),
            head_free: ptr::null_mut(),
            tail_free: ptr::null_mut(),
            block_count: 0,
            free_nodes: 0,
            recycled_bytes: 0,
            #[cfg(debug_assertions)]
            live_map: HashMap::new(),
        }
    }

    /// # Safety
    /// `node` must be a valid slot header that is not currently in the free list.
    unsafe fn push_free_tail(&mut self, node: *mut FreeNode) {
        // Safety: upheld by caller; tail_free is either null or a listed node.
        unsafe {
            (*node).prev = self.tail_free;
            (*node).next = ptr::null_mut();
            if self.tail_free.is_null() {
                self.head_free = node;
            } else {
                (*self.tail_free).next = node;
            }
        }
        self.tail_free = node;
    }

    /// # Safety
    /// `node` must currently be in the free list.
    unsafe fn unlink_free(&mut self, node: *mut FreeNode) {
        // Safety: upheld by caller; neighbours are listed nodes or null.
        unsafe {
            let prev = (*node).prev;
            let next = (*node).next;
            if prev.is_null() {
                self.head_free = next;
            } else {
                (*prev).next = next;
            }
            if next.is_null() {
                self.tail_free = prev;
            } else {
                (*next).prev = prev;
            }
            (*node).prev = ptr::null_mut();
            (*node).next = ptr::null_mut();
        }
    }

    /// # Safety
    /// `block` must be a valid block header that is not currently listed.
    unsafe fn push_block_tail(&mut self, block: *mut Block) {
        // Safety: upheld by caller.
        unsafe {
            (*block).prev = self.tail_block;
            (*block).next = ptr::null_mut();
            if self.tail_block.is_null() {
                self.head_block = block;
            } else {
                (*self.tail_block).next = block;
            }
        }
        self.tail_block = block;
    }

    /// # Safety
    /// `block` must currently be in the block list.
    unsafe fn unlink_block(&mut self, block: *mut Block) {
        // Safety: upheld by caller.
        unsafe {
            let prev = (*block).prev;
            let next = (*block).next;
            if prev.is_null() {
                self.head_block = next;
            } else {
                (*prev).next = next;
            }
            if next.is_null() {
                self.tail_block = prev;
            } else {
                (*next).prev = prev;
            }
            (*block).prev = ptr::null_mut();
            (*block).next = ptr::null_mut();
        }
    }
}

/// Free-list allocator for one fixed node size.
///
/// Memory comes from the raw allocator one block at a time:
///
/// ```text
/// block: [Block header][FreeNode|payload][FreeNode|payload] ... x NODES_PER_BLOCK
///                       ^ bias 0          ^ bias 1
/// ```
///
/// A slot's owning block is found without a back pointer: `bias_table[bias]`
/// is the (negative) byte offset from the slot to its block header. When the
/// last handed-out slot of a block comes back, the block is unlinked, all of
/// its slots are removed from the free list, and the block is returned to the
/// raw allocator. That removal walks every slot of the block.
///
/// All structural mutation happens under one mutex held for the whole
/// operation, including block growth.
pub struct Pool<A: RawAllocator> {
    node_size: usize,
    node_stride: usize,
    block_size: usize,
    bias_table: Box<[isize]>,
    raw: A,
    state: Mutex<PoolState>,
}

impl<A: RawAllocator> Pool<A> {
    /// Create an empty pool serving payloads of `node_size` bytes. No memory is
    /// requested until the first `allocate`.
    ///
    /// # Panics
    ///
    /// Panics if a block of `node_size` slots would exceed `isize::MAX` bytes.
    pub fn new(node_size: usize, raw: A) -> Self {
        debug_assert!(node_size > 0, "pool node size must be non-zero");
        assert!(
            checked_block_size(node_size).is_some(),
            "pool node size {node_size} is too large"
        );
        let node_stride = NODE_HEADER_SIZE + round_up(node_size, POOL_ALIGN);
        let block_size = BLOCK_HEADER_SIZE + node_stride * NODES_PER_BLOCK;

        let mut bias_table = Vec::with_capacity(NODES_PER_BLOCK);
        let mut offset = -BLOCK_HEADER_SIZE.cast_signed();
        for _ in 0..NODES_PER_BLOCK {
            bias_table.push(offset);
            offset -= node_stride.cast_signed();
        }

        Self {
            node_size,
            node_stride,
            block_size,
            bias_table: bias_table.into_boxed_slice(),
            raw,
            state: Mutex::new(PoolState::new()),
        }
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Slot header for `bias` inside `block`.
    #[inline]
    fn node_at(&self, block: *mut Block, bias: usize) -> *mut FreeNode {
        block
            .cast::<u8>()
            .wrapping_add(BLOCK_HEADER_SIZE + bias * self.node_stride)
            .cast::<FreeNode>()
    }

    /// Owning block of a slot, via the bias table.
    ///
    /// # Safety
    /// `node` must be a slot header inside a block owned by this pool.
    #[inline]
    unsafe fn block_of(&self, node: *mut FreeNode) -> *mut Block {
        // Safety: upheld by caller; bias is immutable for the slot's lifetime.
        let bias = unsafe { (*node).bias } as usize;
        debug_assert!(bias < NODES_PER_BLOCK, "corrupted slot header: bias {bias}");
        node.cast::<u8>()
            .wrapping_offset(self.bias_table[bias])
            .cast::<Block>()
    }

    /// Hand out one slot, growing by a block if the free list is empty.
    ///
    /// Slots are reused LIFO: the most recently freed slot comes back first.
    ///
    /// # Errors
    ///
    /// Returns `MemoryError::OutOfMemory` if a new block is needed and the raw
    /// allocator cannot supply it. The pool is left unchanged in that case.
    pub fn allocate(&self) -> Result<NonNull<u8>, MemoryError> {
        let mut state = self.lock();
        if state.tail_free.is_null() {
            self.grow(&mut state)?;
        }

        let node = state.tail_free;
        // Safety: the free list is non-empty, so `node` is a listed slot of one
        // of our blocks.
        unsafe {
            state.unlink_free(node);
            let block = self.block_of(node);
            (*block).free_node_count -= 1;

            #[cfg(debug_assertions)]
            if let Some(map) = state.live_map.get_mut(&(block as usize)) {
                map.insert((*node).bias as usize);
            }
        }
        state.free_nodes -= 1;

        // Safety: the payload lies inside the slot, right after its header.
        Ok(unsafe { NonNull::new_unchecked(node.cast::<u8>().add(NODE_HEADER_SIZE)) })
    }

    /// Request one block from the raw allocator and thread its slots onto the
    /// tail of the free list in bias order.
    fn grow(&self, state: &mut PoolState) -> Result<(), MemoryError> {
        let base = self.raw.allocate(self.block_size)?;
        let block = base.as_ptr().cast::<Block>();

        // Safety: `base` is a fresh allocation of block_size bytes, aligned to
        // RAW_ALIGN, large enough for the header and NODES_PER_BLOCK slots.
        unsafe {
            block.write(Block {
                free_node_count: NODES_PER_BLOCK as u32,
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
            });
            state.push_block_tail(block);

            for bias in 0..NODES_PER_BLOCK {
                let node = self.node_at(block, bias);
                node.write(FreeNode {
                    bias: bias as u32,
                    prev: ptr::null_mut(),
                    next: ptr::null_mut(),
                });
                state.push_free_tail(node);
            }
        }

        state.block_count += 1;
        state.free_nodes += NODES_PER_BLOCK;
        #[cfg(debug_assertions)]
        state
            .live_map
            .insert(block as usize, FixedBitSet::with_capacity(NODES_PER_BLOCK));
        stats::block_acquired(self.block_size);

        tracing::debug!(
            node_size = self.node_size,
            block_size = self.block_size,
            blocks = state.block_count,
            "pool grew by one block"
        );
        Ok(())
    }

    /// Return a slot to the pool. If that leaves its block fully idle, the
    /// block is given back to the raw allocator.
    ///
    /// # Safety
    /// - `ptr` must have been returned by `allocate` on this pool.
    /// - `ptr` must not have been freed already.
    ///
    /// Debug builds panic on a double free.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        // Safety: payloads sit NODE_HEADER_SIZE bytes past their slot header.
        let node = unsafe { ptr.as_ptr().sub(NODE_HEADER_SIZE) }.cast::<FreeNode>();
        let mut state = self.lock();

        // Safety: `node` is a handed-out slot of one of our blocks (caller
        // contract), so it is not in the free list and its block is listed.
        unsafe {
            let block = self.block_of(node);

            #[cfg(debug_assertions)]
            {
                let bias = (*node).bias as usize;
                let map = state.live_map.get_mut(&(block as usize)).unwrap_or_else(|| {
                    panic!("pool deallocate: {ptr:p} does not belong to this pool")
                });
                assert!(
                    map.contains(bias),
                    "pool deallocate: double free of {ptr:p} (node size {})",
                    self.node_size
                );
                map.set(bias, false);
            }

            state.push_free_tail(node);
            state.free_nodes += 1;
            (*block).free_node_count += 1;

            if (*block).free_node_count as usize == NODES_PER_BLOCK {
                self.release_block(&mut state, block);
            }
        }
    }

    /// Unlink an idle block and all of its slots, then free it.
    ///
    /// # Safety
    /// `block` must be a listed block whose slots are all in the free list.
    unsafe fn release_block(&self, state: &mut PoolState, block: *mut Block) {
        // Safety: upheld by caller.
        unsafe {
            state.unlink_block(block);
            for bias in 0..NODES_PER_BLOCK {
                state.unlink_free(self.node_at(block, bias));
            }
        }

        state.block_count -= 1;
        state.free_nodes -= NODES_PER_BLOCK;
        state.recycled_bytes += self.block_size;
        #[cfg(debug_assertions)]
        state.live_map.remove(&(block as usize));
        stats::block_released(self.block_size, true);

        tracing::debug!(
            node_size = self.node_size,
            block_size = self.block_size,
            blocks = state.block_count,
            "pool released an idle block"
        );

        // Safety: the block came from `self.raw` with exactly block_size bytes.
        unsafe {
            self.raw
                .deallocate(NonNull::new_unchecked(block.cast::<u8>()), self.block_size);
        }
    }

    /// Cumulative bytes of idle blocks returned to the raw allocator.
    pub fn recycled_bytes(&self) -> usize {
        self.lock().recycled_bytes
    }

    /// Blocks currently held.
    pub fn block_count(&self) -> usize {
        self.lock().block_count
    }

    /// Slots currently in the free list.
    pub fn free_node_count(&self) -> usize {
        self.lock().free_nodes
    }

    /// Slots currently handed out.
    pub fn live_node_count(&self) -> usize {
        let state = self.lock();
        state.block_count * NODES_PER_BLOCK - state.free_nodes
    }

    /// Payload size this pool serves.
    pub fn node_size(&self) -> usize {
        self.node_size
    }

    /// Distance between consecutive slots (header + padded payload).
    pub fn node_stride(&self) -> usize {
        self.node_stride
    }

    /// Bytes requested from the raw allocator per block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Walk both lists and check every structural invariant.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        let state = self.lock();
        let mut per_block: std::collections::HashMap<usize, usize> =
            std::collections::HashMap::new();

        let mut blocks = 0;
        let mut prev = ptr::null_mut();
        let mut block = state.head_block;
        while !block.is_null() {
            // Safety: Test code walking our own list.
            unsafe {
                assert_eq!((*block).prev, prev, "block list back link broken");
                per_block.insert(block as usize, 0);
                prev = block;
                block = (*block).next;
            }
            blocks += 1;
        }
        assert_eq!(prev, state.tail_block, "block list tail mismatch");
        assert_eq!(blocks, state.block_count);

        let mut free = 0;
        let mut prev_node = ptr::null_mut();
        let mut node = state.head_free;
        while !node.is_null() {
            // Safety: Test code walking our own list.
            unsafe {
                assert_eq!((*node).prev, prev_node, "free list back link broken");
                let owner = self.block_of(node) as usize;
                let count = per_block
                    .get_mut(&owner)
                    .expect("free node belongs to an unlisted block");
                *count += 1;
                prev_node = node;
                node = (*node).next;
            }
            free += 1;
        }
        assert_eq!(prev_node, state.tail_free, "free list tail mismatch");
        assert_eq!(free, state.free_nodes);

        for (&addr, &count) in &per_block {
            // Safety: Test code; addr is a listed block.
            let recorded = unsafe { (*(addr as *mut Block)).free_node_count } as usize;
            assert_eq!(recorded, count, "block free count disagrees with free list");
            assert!(count < NODES_PER_BLOCK, "fully idle block was not released");
        }
    }
}

impl<A: RawAllocator> Drop for Pool<A> {
    fn drop(&mut self) {
        let mut state = self.lock();
        let live = state.block_count * NODES_PER_BLOCK - state.free_nodes;
        if live > 0 {
            tracing::warn!(
                node_size = self.node_size,
                live,
                "pool dropped while slots are still handed out"
            );
        }

        let mut block = state.head_block;
        while !block.is_null() {
            // Safety: every listed block came from `self.raw` with block_size bytes.
            unsafe {
                let next = (*block).next;
                stats::block_released(self.block_size, false);
                self.raw
                    .deallocate(NonNull::new_unchecked(block.cast::<u8>()), self.block_size);
                block = next;
            }
        }

        state.head_block = ptr::null_mut();
        state.tail_block = ptr::null_mut();
        state.head_free = ptr::null_mut();
        state.tail_free = ptr::null_mut();
        state.block_count = 0;
        state.free_nodes = 0;
    }
}

impl<A: RawAllocator> std::fmt::Debug for Pool<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("node_size", &self.node_size)
            .field("block_size", &self.block_size)
            .field("blocks", &self.block_count())
            .field("free_nodes", &self.free_node_count())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::raw::TrackingAllocator;
    use crate::sync::Arc;
    use crate::sync::thread;
    use std::collections::HashSet;

    #[test]
    fn test_fresh_pool_is_empty_and_first_allocate_grows() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let tracker = TrackingAllocator::new();
        let pool = Pool::new(16, tracker.clone());
        assert_eq!(pool.block_count(), 0);
        assert_eq!(pool.free_node_count(), 0);
        assert_eq!(tracker.allocations(), 0);

        let ptr = pool.allocate().unwrap();
        assert_eq!(pool.block_count(), 1);
        assert_eq!(pool.free_node_count(), NODES_PER_BLOCK - 1);
        assert_eq!(pool.live_node_count(), 1);
        assert_eq!(tracker.allocations(), 1);
        assert_eq!(tracker.live_bytes(), pool.block_size());
        pool.check_invariants();

        // Safety: Test code.
        unsafe { pool.deallocate(ptr) };
    }

    #[test]
    fn test_layout_matches_header_plus_payload() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = Pool::new(16, TrackingAllocator::new());
        assert_eq!(pool.node_stride(), NODE_HEADER_SIZE + 16);
        assert_eq!(
            pool.block_size(),
            BLOCK_HEADER_SIZE + NODES_PER_BLOCK * (NODE_HEADER_SIZE + 16)
        );

        assert_eq!(pool.bias_table[0], -BLOCK_HEADER_SIZE.cast_signed());
        for i in 1..NODES_PER_BLOCK {
            assert_eq!(
                pool.bias_table[i],
                pool.bias_table[i - 1] - pool.node_stride().cast_signed()
            );
        }
    }

    #[test]
    fn test_checked_block_size_bounds() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = Pool::new(12, TrackingAllocator::new());
        assert_eq!(checked_block_size(12), Some(pool.block_size()));
        assert_eq!(checked_block_size(usize::MAX), None);
        assert_eq!(checked_block_size(1 << 60), None);
    }

    #[test]
    #[should_panic(expected = "too large")]
    fn test_oversized_node_panics() {
        let _ = Pool::new(1 << 60, TrackingAllocator::new());
    }

    #[test]
    fn test_bias_locates_owning_block() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let tracker = TrackingAllocator::new();
        let pool = Pool::new(24, tracker.clone());
        let first = pool.allocate().unwrap();

        let state = pool.lock();
        let block = state.head_block;
        for bias in [0, 1, NODES_PER_BLOCK / 2, NODES_PER_BLOCK - 1] {
            let node = pool.node_at(block, bias);
            // Safety: Test code.
            unsafe {
                assert_eq!((*node).bias as usize, bias);
                assert_eq!(pool.block_of(node), block);
            }
        }
        assert!(tracker.is_live(NonNull::new(block.cast::<u8>()).unwrap()));
        drop(state);

        // Safety: Test code.
        unsafe { pool.deallocate(first) };
    }

    #[test]
    fn test_payloads_are_aligned_and_disjoint() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = Pool::new(40, TrackingAllocator::new());
        let mut ptrs = Vec::new();
        for i in 0..64u8 {
            let ptr = pool.allocate().unwrap();
            assert_eq!(ptr.as_ptr() as usize % POOL_ALIGN, 0);
            // Safety: Test code; the whole payload is ours.
            unsafe { ptr::write_bytes(ptr.as_ptr(), i, 40) };
            ptrs.push(ptr);
        }
        for (i, ptr) in ptrs.iter().enumerate() {
            // Safety: Test code.
            let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 40) };
            assert!(bytes.iter().all(|&b| usize::from(b) == i), "payload {i} was overwritten");
        }
        for ptr in ptrs {
            // Safety: Test code.
            unsafe { pool.deallocate(ptr) };
        }
        pool.check_invariants();
    }

    #[test]
    fn test_lifo_reuse() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = Pool::new(8, TrackingAllocator::new());
        let keep = pool.allocate().unwrap();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();

        // Safety: Test code.
        unsafe { pool.deallocate(a) };
        // Safety: Test code.
        unsafe { pool.deallocate(b) };
        assert_eq!(pool.allocate().unwrap(), b);
        assert_eq!(pool.allocate().unwrap(), a);

        // Safety: Test code.
        unsafe {
            pool.deallocate(a);
            pool.deallocate(b);
            pool.deallocate(keep);
        }
    }

    #[test]
    fn test_idle_block_is_recycled() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let tracker = TrackingAllocator::new();
        let pool = Pool::new(32, tracker.clone());

        let ptrs: Vec<_> = (0..=NODES_PER_BLOCK)
            .map(|_| pool.allocate().unwrap())
            .collect();
        assert_eq!(pool.block_count(), 2);
        assert_eq!(tracker.allocations(), 2);
        assert_eq!(pool.recycled_bytes(), 0);

        // The first NODES_PER_BLOCK slots all came from the first block.
        for &ptr in &ptrs[..NODES_PER_BLOCK] {
            // Safety: Test code.
            unsafe { pool.deallocate(ptr) };
        }
        assert_eq!(pool.recycled_bytes(), pool.block_size());
        assert_eq!(pool.block_count(), 1);
        assert_eq!(pool.live_node_count(), 1);
        assert_eq!(tracker.deallocations(), 1);
        pool.check_invariants();

        // Safety: Test code.
        unsafe { pool.deallocate(ptrs[NODES_PER_BLOCK]) };
        assert_eq!(pool.recycled_bytes(), 2 * pool.block_size());
        assert_eq!(pool.block_count(), 0);
        assert_eq!(tracker.live_count(), 0);
    }

    #[test]
    fn test_freed_slots_are_reused_without_growth() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let tracker = TrackingAllocator::new();
        let pool = Pool::new(16, tracker.clone());

        let ptrs: Vec<_> = (0..300).map(|_| pool.allocate().unwrap()).collect();
        let mut freed = HashSet::new();
        for ptr in ptrs.iter().step_by(2) {
            // Safety: Test code.
            unsafe { pool.deallocate(*ptr) };
            freed.insert(*ptr);
        }
        assert_eq!(freed.len(), 150);

        let again: Vec<_> = (0..150).map(|_| pool.allocate().unwrap()).collect();
        for ptr in &again {
            assert!(freed.remove(ptr), "allocation did not come from a freed slot");
        }
        assert!(freed.is_empty());
        assert_eq!(pool.block_count(), 1);
        assert_eq!(tracker.allocations(), 1);
        pool.check_invariants();

        for ptr in ptrs.iter().skip(1).step_by(2).chain(again.iter()) {
            // Safety: Test code.
            unsafe { pool.deallocate(*ptr) };
        }
        assert_eq!(pool.block_count(), 0);
    }

    #[test]
    fn test_interleaved_frees_across_blocks() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let tracker = TrackingAllocator::new();
        let pool = Pool::new(8, tracker.clone());
        let ptrs: Vec<_> = (0..NODES_PER_BLOCK * 2 + 10)
            .map(|_| pool.allocate().unwrap())
            .collect();
        assert_eq!(pool.block_count(), 3);

        // Free from the middle block outward so releases hit the list interior.
        let mid = NODES_PER_BLOCK;
        for &ptr in &ptrs[mid..mid * 2] {
            // Safety: Test code.
            unsafe { pool.deallocate(ptr) };
        }
        assert_eq!(pool.block_count(), 2);
        pool.check_invariants();

        for &ptr in ptrs[..mid].iter().rev().chain(&ptrs[mid * 2..]) {
            // Safety: Test code.
            unsafe { pool.deallocate(ptr) };
        }
        assert_eq!(pool.block_count(), 0);
        assert_eq!(pool.free_node_count(), 0);
        assert_eq!(pool.recycled_bytes(), 3 * pool.block_size());
        assert_eq!(tracker.live_count(), 0);
    }

    #[test]
    fn test_out_of_memory_leaves_pool_untouched() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let tracker = TrackingAllocator::with_limit(1024);
        let pool = Pool::new(16, tracker.clone());
        let err = pool.allocate().unwrap_err();
        assert_eq!(
            err,
            MemoryError::OutOfMemory {
                size: pool.block_size()
            }
        );
        assert_eq!(pool.block_count(), 0);
        assert_eq!(pool.free_node_count(), 0);
        pool.check_invariants();
    }

    #[test]
    fn test_drop_returns_remaining_blocks() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let tracker = TrackingAllocator::new();
        {
            let pool = Pool::new(64, tracker.clone());
            for _ in 0..NODES_PER_BLOCK + 1 {
                let _ = pool.allocate().unwrap();
            }
            assert_eq!(tracker.live_count(), 2);
        }
        assert_eq!(tracker.live_count(), 0);
        assert_eq!(tracker.deallocations(), 2);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics_in_debug() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = Pool::new(16, TrackingAllocator::new());
        let _keep = pool.allocate().unwrap();
        let ptr = pool.allocate().unwrap();
        // Safety: Test code (the second free is the bug under test).
        unsafe {
            pool.deallocate(ptr);
            pool.deallocate(ptr);
        }
    }

    #[test]
    fn test_pool_thread_safety() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let tracker = TrackingAllocator::new();
        let pool = Arc::new(Pool::new(16, tracker.clone()));
        let num_threads = 8;
        let allocs_per_thread = 1500;

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let pool = pool.clone();
                thread::spawn(move || {
                    let mut ptrs = Vec::with_capacity(allocs_per_thread);
                    for i in 0..allocs_per_thread {
                        let ptr = pool.allocate().unwrap();
                        let tag = (t * 1_000_000 + i) as u64;
                        // Safety: Test code; payload is 16 bytes, 8-aligned.
                        unsafe { ptr.as_ptr().cast::<u64>().write(tag) };
                        ptrs.push((ptr, tag));
                    }
                    for &(ptr, tag) in &ptrs {
                        // Safety: Test code.
                        let seen = unsafe { ptr.as_ptr().cast::<u64>().read() };
                        assert_eq!(seen, tag, "memory corruption detected");
                    }
                    for (ptr, _) in ptrs {
                        // Safety: Test code.
                        unsafe { pool.deallocate(ptr) };
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        pool.check_invariants();
        assert_eq!(pool.live_node_count(), 0);
        assert_eq!(pool.block_count(), 0);
        assert_eq!(tracker.live_count(), 0);
    }
}
