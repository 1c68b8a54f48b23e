//! Per-client index and LRU lists
//!
//! The index maps block numbers to buffers and keeps every buffer on
//! exactly one of two lists, clean or dirty, ordered by last access. Lists
//! are keyed by a logical clock stamp, so iterating a list walks it from
//! least to most recently used.
//!
//! All methods expect the caller to hold the client lock; nothing here
//! blocks.

use crate::allocator::BlockMemory;
use crate::buffer::Buffer;
use crate::state::{BufferState, ListKind};
use blockcache_common::{BlockNumber, BufferId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Instant;

/// Bookkeeping for one linked buffer
pub(crate) struct Slot {
    pub buffer: Arc<Buffer>,
    pub state: BufferState,
    pub holds: u32,
    pub last_access: Instant,
    pub read_error: Option<ErrorKind>,
    stamp: u64,
    list: ListKind,
}

impl Slot {
    /// Unreferenced, idle and clean
    pub fn is_unclaimed(&self) -> bool {
        self.holds == 0 && self.state.is_clean_idle()
    }
}

/// Index and eviction lists of one client
pub(crate) struct BufferIndex {
    by_block: HashMap<BlockNumber, BufferId>,
    slots: HashMap<BufferId, Slot>,
    clean: BTreeMap<u64, BufferId>,
    dirty: BTreeMap<u64, BufferId>,
    clock: u64,
    next_id: u64,
    /// Pre-reserved data regions for when the allocator runs dry
    pub reserve: Vec<BlockMemory>,
    /// First write failure since the last drain
    pub async_write_error: Option<(BlockNumber, ErrorKind)>,
    pub destroyed: bool,
}

impl BufferIndex {
    pub fn new() -> Self {
        Self {
            by_block: HashMap::new(),
            slots: HashMap::new(),
            clean: BTreeMap::new(),
            dirty: BTreeMap::new(),
            clock: 0,
            next_id: 0,
            reserve: Vec::new(),
            async_write_error: None,
            destroyed: false,
        }
    }

    pub fn allocate_id(&mut self) -> BufferId {
        self.next_id += 1;
        BufferId::new(self.next_id)
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Look up a block without touching list order
    pub fn find(&self, block: BlockNumber) -> Option<BufferId> {
        self.by_block.get(&block).copied()
    }

    pub fn slot(&self, id: BufferId) -> Option<&Slot> {
        self.slots.get(&id)
    }

    pub fn slot_mut(&mut self, id: BufferId) -> Option<&mut Slot> {
        self.slots.get_mut(&id)
    }

    /// Insert a new buffer at the head of the list its state implies
    ///
    /// # Panics
    ///
    /// Panics if the block is already cached.
    pub fn link(&mut self, buffer: Arc<Buffer>, state: BufferState, holds: u32) -> BufferId {
        let id = buffer.id();
        let block = buffer.block();
        assert!(
            !self.by_block.contains_key(&block),
            "block {block} already has a live buffer"
        );

        let stamp = self.tick();
        let list = state.list();
        self.list_mut(list).insert(stamp, id);
        self.by_block.insert(block, id);
        self.slots.insert(
            id,
            Slot {
                buffer,
                state,
                holds,
                last_access: Instant::now(),
                read_error: None,
                stamp,
                list,
            },
        );
        id
    }

    /// Remove a buffer from the index and its list
    ///
    /// # Panics
    ///
    /// Panics if the buffer is held or has I/O in flight.
    pub fn unlink(&mut self, id: BufferId) -> Arc<Buffer> {
        let slot = self
            .slots
            .remove(&id)
            .unwrap_or_else(|| panic!("unlink of unknown buffer {id}"));
        assert!(slot.holds == 0, "unlink of buffer {id} with {} holds", slot.holds);
        assert!(
            !slot.state.io_pending(),
            "unlink of buffer {id} in state {}",
            slot.state
        );

        self.list_mut(slot.list).remove(&slot.stamp);
        let block = slot.buffer.block();
        if self.by_block.get(&block) == Some(&id) {
            self.by_block.remove(&block);
        }
        slot.buffer
    }

    /// Move a buffer to the head of the list its current state implies
    pub fn relink(&mut self, id: BufferId) {
        let stamp = self.tick();
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        let (old_list, old_stamp) = (slot.list, slot.stamp);
        slot.list = slot.state.list();
        slot.stamp = stamp;
        slot.last_access = Instant::now();
        let new_list = slot.list;

        self.list_mut(old_list).remove(&old_stamp);
        self.list_mut(new_list).insert(stamp, id);
    }

    /// Point the buffer's index entry at a different block
    ///
    /// # Panics
    ///
    /// Panics if `new_block` is occupied.
    pub fn rekey(&mut self, id: BufferId, new_block: BlockNumber) {
        assert!(
            !self.by_block.contains_key(&new_block),
            "block {new_block} already has a live buffer"
        );
        let slot = self
            .slots
            .get(&id)
            .unwrap_or_else(|| panic!("rekey of unknown buffer {id}"));
        let old_block = slot.buffer.block();
        if self.by_block.get(&old_block) == Some(&id) {
            self.by_block.remove(&old_block);
        }
        slot.buffer.set_block(new_block);
        self.by_block.insert(new_block, id);
    }

    pub fn hold(&mut self, id: BufferId) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.holds += 1;
        }
    }

    /// Drop one hold and return how many remain
    ///
    /// # Panics
    ///
    /// Panics on an unknown buffer or a zero hold count.
    pub fn unhold(&mut self, id: BufferId) -> u32 {
        let slot = self
            .slots
            .get_mut(&id)
            .unwrap_or_else(|| panic!("release of unknown buffer {id}"));
        assert!(slot.holds > 0, "release of buffer {id} with zero hold count");
        slot.holds -= 1;
        slot.holds
    }

    /// Least recently used unreferenced clean buffer
    pub fn oldest_unclaimed_clean(&self) -> Option<BufferId> {
        self.clean
            .values()
            .copied()
            .find(|id| self.slots.get(id).is_some_and(Slot::is_unclaimed))
    }

    /// Least recently used unreferenced dirty buffer not in `skip`
    pub fn oldest_unheld_dirty(&self, skip: &HashSet<BufferId>) -> Option<BufferId> {
        self.dirty.values().copied().find(|id| {
            !skip.contains(id) && self.slots.get(id).is_some_and(|slot| slot.holds == 0)
        })
    }

    /// Every buffer on the dirty list, oldest first
    pub fn dirty_ids(&self) -> Vec<BufferId> {
        self.dirty.values().copied().collect()
    }

    /// Unreferenced clean buffers last touched before `cutoff`, oldest first
    pub fn unclaimed_clean_before(&self, cutoff: Instant) -> Vec<BufferId> {
        self.clean
            .values()
            .copied()
            .filter(|id| {
                self.slots
                    .get(id)
                    .is_some_and(|slot| slot.is_unclaimed() && slot.last_access < cutoff)
            })
            .collect()
    }

    pub fn ids(&self) -> Vec<BufferId> {
        self.slots.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn clean_len(&self) -> usize {
        self.clean.len()
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    pub fn held_len(&self) -> usize {
        self.slots.values().filter(|slot| slot.holds > 0).count()
    }

    pub fn io_pending_len(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| slot.state.io_pending())
            .count()
    }

    fn list_mut(&mut self, list: ListKind) -> &mut BTreeMap<u64, BufferId> {
        match list {
            ListKind::Clean => &mut self.clean,
            ListKind::Dirty => &mut self.dirty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::BufferAllocator;

    fn buffer(index: &mut BufferIndex, allocator: &BufferAllocator, block: BlockNumber) -> Arc<Buffer> {
        let memory = allocator.allocate(512, None).unwrap();
        Arc::new(Buffer::new(index.allocate_id(), block, memory, 0))
    }

    #[test]
    fn test_link_find_unlink() {
        let allocator = BufferAllocator::default();
        let mut index = BufferIndex::new();

        let buf = buffer(&mut index, &allocator, 10);
        let id = index.link(buf, BufferState::CLEAN, 0);
        assert_eq!(index.find(10), Some(id));
        assert_eq!(index.clean_len(), 1);
        assert_eq!(index.dirty_len(), 0);

        let removed = index.unlink(id);
        assert_eq!(removed.block(), 10);
        assert_eq!(index.find(10), None);
        assert_eq!(index.len(), 0);
        assert_eq!(index.clean_len(), 0);
    }

    #[test]
    #[should_panic(expected = "already has a live buffer")]
    fn test_duplicate_block_rejected() {
        let allocator = BufferAllocator::default();
        let mut index = BufferIndex::new();
        let first = buffer(&mut index, &allocator, 3);
        let second = buffer(&mut index, &allocator, 3);
        index.link(first, BufferState::CLEAN, 0);
        index.link(second, BufferState::CLEAN, 0);
    }

    #[test]
    #[should_panic(expected = "zero hold count")]
    fn test_release_without_hold_panics() {
        let allocator = BufferAllocator::default();
        let mut index = BufferIndex::new();
        let buf = buffer(&mut index, &allocator, 1);
        let id = index.link(buf, BufferState::CLEAN, 1);
        assert_eq!(index.unhold(id), 0);
        index.unhold(id);
    }

    #[test]
    #[should_panic(expected = "holds")]
    fn test_unlink_held_panics() {
        let allocator = BufferAllocator::default();
        let mut index = BufferIndex::new();
        let buf = buffer(&mut index, &allocator, 1);
        let id = index.link(buf, BufferState::CLEAN, 1);
        index.unlink(id);
    }

    #[test]
    fn test_relink_moves_between_lists() {
        let allocator = BufferAllocator::default();
        let mut index = BufferIndex::new();
        let buf = buffer(&mut index, &allocator, 5);
        let id = index.link(buf, BufferState::CLEAN, 0);

        index.slot_mut(id).unwrap().state = BufferState::CLEAN.mark_dirty();
        index.relink(id);
        assert_eq!(index.clean_len(), 0);
        assert_eq!(index.dirty_ids(), vec![id]);

        index.slot_mut(id).unwrap().state = BufferState::CLEAN;
        index.relink(id);
        assert_eq!(index.clean_len(), 1);
        assert_eq!(index.dirty_len(), 0);
    }

    #[test]
    fn test_lru_order_and_unclaimed_selection() {
        let allocator = BufferAllocator::default();
        let mut index = BufferIndex::new();
        let ids: Vec<_> = (0..4)
            .map(|block| {
                let buf = buffer(&mut index, &allocator, block);
                index.link(buf, BufferState::CLEAN, 0)
            })
            .collect();

        // Touch block 0 so block 1 becomes the oldest.
        index.relink(ids[0]);
        assert_eq!(index.oldest_unclaimed_clean(), Some(ids[1]));

        // Held and reading buffers are never candidates.
        index.hold(ids[1]);
        index.slot_mut(ids[2]).unwrap().state = BufferState::Reading;
        assert_eq!(index.oldest_unclaimed_clean(), Some(ids[3]));
    }

    #[test]
    fn test_oldest_unheld_dirty_skips() {
        let allocator = BufferAllocator::default();
        let mut index = BufferIndex::new();
        let dirty = BufferState::CLEAN.mark_dirty();
        let a = {
            let buf = buffer(&mut index, &allocator, 1);
            index.link(buf, dirty, 0)
        };
        let b = {
            let buf = buffer(&mut index, &allocator, 2);
            index.link(buf, dirty, 0)
        };

        let mut skip = HashSet::new();
        assert_eq!(index.oldest_unheld_dirty(&skip), Some(a));
        skip.insert(a);
        assert_eq!(index.oldest_unheld_dirty(&skip), Some(b));
        index.hold(b);
        assert_eq!(index.oldest_unheld_dirty(&skip), None);
    }

    #[test]
    fn test_rekey() {
        let allocator = BufferAllocator::default();
        let mut index = BufferIndex::new();
        let buf = buffer(&mut index, &allocator, 7);
        let id = index.link(Arc::clone(&buf), BufferState::CLEAN, 1);

        index.rekey(id, 70);
        assert_eq!(index.find(7), None);
        assert_eq!(index.find(70), Some(id));
        assert_eq!(buf.block(), 70);
    }

    #[test]
    fn test_unclaimed_clean_before() {
        let allocator = BufferAllocator::default();
        let mut index = BufferIndex::new();
        let old = {
            let buf = buffer(&mut index, &allocator, 1);
            index.link(buf, BufferState::CLEAN, 0)
        };
        let cutoff = Instant::now() + std::time::Duration::from_millis(1);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let _fresh = {
            let buf = buffer(&mut index, &allocator, 2);
            index.link(buf, BufferState::CLEAN, 0)
        };

        assert_eq!(index.unclaimed_clean_before(cutoff), vec![old]);
    }
}
