//! Recency order over clean (`Uploaded`) blocks, the only eviction candidates.

use std::collections::{BTreeMap, HashMap};

use tide_store::PayloadId;

pub(crate) type BlockRef = (PayloadId, u64);

#[derive(Debug, Default)]
pub(crate) struct LruIndex {
    by_tick: BTreeMap<u64, BlockRef>,
    ticks: HashMap<BlockRef, u64>,
}

impl LruIndex {
    /// Insert or refresh `block` with a new tick.
    pub fn touch(&mut self, block: BlockRef, tick: u64) {
        if let Some(old) = self.ticks.insert(block.clone(), tick) {
            self.by_tick.remove(&old);
        }
        self.by_tick.insert(tick, block);
    }

    /// Refresh only if already tracked.
    pub fn refresh(&mut self, block: &BlockRef, tick: u64) {
        if let Some(old) = self.ticks.get_mut(block) {
            self.by_tick.remove(&*old);
            *old = tick;
            self.by_tick.insert(tick, block.clone());
        }
    }

    pub fn remove(&mut self, block: &BlockRef) -> bool {
        match self.ticks.remove(block) {
            Some(tick) => {
                self.by_tick.remove(&tick);
                true
            }
            None => false,
        }
    }

    /// Up to `n` least recently used blocks, oldest first.
    pub fn oldest(&self, n: usize) -> Vec<BlockRef> {
        self.by_tick.values().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(id: &str, b: u64) -> BlockRef {
        (PayloadId::new("s", id), b)
    }

    #[test]
    fn test_touch_reorders() {
        let mut lru = LruIndex::default();
        lru.touch(r("a", 0), 1);
        lru.touch(r("b", 0), 2);
        lru.touch(r("a", 0), 3);
        assert_eq!(lru.oldest(2), vec![r("b", 0), r("a", 0)]);
        assert_eq!(lru.len(), 2);
    }

    #[test]
    fn test_refresh_ignores_untracked() {
        let mut lru = LruIndex::default();
        lru.refresh(&r("a", 0), 5);
        assert_eq!(lru.len(), 0);
        lru.touch(r("a", 0), 1);
        lru.touch(r("b", 0), 2);
        lru.refresh(&r("a", 0), 9);
        assert_eq!(lru.oldest(1), vec![r("b", 0)]);
    }

    #[test]
    fn test_remove() {
        let mut lru = LruIndex::default();
        lru.touch(r("a", 0), 1);
        assert!(lru.remove(&r("a", 0)));
        assert!(!lru.remove(&r("a", 0)));
        assert!(lru.oldest(10).is_empty());
    }
}
