//! Adaptive Replacement Cache bookkeeping over block numbers.
//!
//! Tracks recency (T1) and frequency (T2) lists plus their ghost lists
//! (B1/B2). It only decides *which* resident block to drop; the cache owns
//! the data and tells the policy, through a predicate, which blocks may be
//! dropped right now (clean, unpinned, unreferenced).

use bfs_types::BlockNumber;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArcList {
    T1,
    T2,
    B1,
    B2,
}

#[derive(Debug)]
pub(crate) struct ArcState {
    capacity: usize,
    /// Target size for the T1 list.
    p: usize,
    t1: VecDeque<BlockNumber>,
    t2: VecDeque<BlockNumber>,
    b1: VecDeque<BlockNumber>,
    b2: VecDeque<BlockNumber>,
    loc: HashMap<BlockNumber, ArcList>,
}

impl ArcState {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            p: 0,
            t1: VecDeque::new(),
            t2: VecDeque::new(),
            b1: VecDeque::new(),
            b2: VecDeque::new(),
            loc: HashMap::new(),
        }
    }

    pub(crate) fn resident_len(&self) -> usize {
        self.t1.len() + self.t2.len()
    }

    fn remove_from_list(list: &mut VecDeque<BlockNumber>, key: BlockNumber) -> bool {
        if let Some(pos) = list.iter().position(|k| *k == key) {
            let _ = list.remove(pos);
            return true;
        }
        false
    }

    /// A resident block was accessed again.
    pub(crate) fn on_hit(&mut self, key: BlockNumber) {
        let Some(list) = self.loc.get(&key).copied() else {
            return;
        };

        match list {
            ArcList::T1 => {
                let _ = Self::remove_from_list(&mut self.t1, key);
                self.t2.push_back(key);
                self.loc.insert(key, ArcList::T2);
            }
            ArcList::T2 => {
                let _ = Self::remove_from_list(&mut self.t2, key);
                self.t2.push_back(key);
            }
            ArcList::B1 | ArcList::B2 => {}
        }
    }

    /// Drop `key` from the resident lists without ghosting it (the cache
    /// discarded the block for a reason other than replacement).
    pub(crate) fn forget(&mut self, key: BlockNumber) {
        match self.loc.remove(&key) {
            Some(ArcList::T1) => {
                let _ = Self::remove_from_list(&mut self.t1, key);
            }
            Some(ArcList::T2) => {
                let _ = Self::remove_from_list(&mut self.t2, key);
            }
            Some(ArcList::B1) => {
                let _ = Self::remove_from_list(&mut self.b1, key);
            }
            Some(ArcList::B2) => {
                let _ = Self::remove_from_list(&mut self.b2, key);
            }
            None => {}
        }
    }

    /// Pop the least recently used evictable block from `list`, rotating
    /// non-evictable ones to the back.
    fn pop_evictable(
        list: &mut VecDeque<BlockNumber>,
        evictable: &dyn Fn(BlockNumber) -> bool,
    ) -> Option<BlockNumber> {
        for _ in 0..list.len() {
            let candidate = list.pop_front()?;
            if evictable(candidate) {
                return Some(candidate);
            }
            list.push_back(candidate);
        }
        None
    }

    fn replace(
        &mut self,
        incoming: BlockNumber,
        evictable: &dyn Fn(BlockNumber) -> bool,
        evicted: &mut Vec<BlockNumber>,
    ) {
        let t1_len = self.t1.len();
        let prefer_t1 = t1_len >= 1
            && (t1_len > self.p
                || (matches!(self.loc.get(&incoming), Some(ArcList::B2)) && t1_len == self.p));

        let (first, second) = if prefer_t1 {
            (ArcList::T1, ArcList::T2)
        } else {
            (ArcList::T2, ArcList::T1)
        };
        for list in [first, second] {
            let (resident, ghost, ghost_tag) = match list {
                ArcList::T1 => (&mut self.t1, &mut self.b1, ArcList::B1),
                _ => (&mut self.t2, &mut self.b2, ArcList::B2),
            };
            if let Some(victim) = Self::pop_evictable(resident, evictable) {
                ghost.push_back(victim);
                self.loc.insert(victim, ghost_tag);
                evicted.push(victim);
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

    /// A block became resident. Returns blocks the cache must drop to stay
    /// within capacity. When nothing is evictable the cache overcommits.
    pub(crate) fn on_insert(
        &mut self,
        key: BlockNumber,
        evictable: &dyn Fn(BlockNumber) -> bool,
    ) -> Vec<BlockNumber> {
        let mut evicted = Vec::new();
        match self.loc.get(&key).copied() {
            Some(ArcList::B1) => {
                let b1_len = self.b1.len().max(1);
                let b2_len = self.b2.len().max(1);
                let delta = (b2_len / b1_len).max(1);
                self.p = (self.p + delta).min(self.capacity);
                let _ = Self::remove_from_list(&mut self.b1, key);
                if self.resident_len() >= self.capacity {
                    self.replace(key, evictable, &mut evicted);
                }
                self.t2.push_back(key);
                self.loc.insert(key, ArcList::T2);
            }
            Some(ArcList::B2) => {
                let b1_len = self.b1.len().max(1);
                let b2_len = self.b2.len().max(1);
                let delta = (b1_len / b2_len).max(1);
                self.p = self.p.saturating_sub(delta);
                let _ = Self::remove_from_list(&mut self.b2, key);
                if self.resident_len() >= self.capacity {
                    self.replace(key, evictable, &mut evicted);
                }
                self.t2.push_back(key);
                self.loc.insert(key, ArcList::T2);
            }
            Some(ArcList::T1 | ArcList::T2) => self.on_hit(key),
            None => {
                if self.t1.len() + self.b1.len() >= self.capacity {
                    if self.t1.len() < self.capacity {
                        let _ = self.b1.pop_front().and_then(|v| self.loc.remove(&v));
                        self.replace(key, evictable, &mut evicted);
                    } else if let Some(victim) = Self::pop_evictable(&mut self.t1, evictable) {
                        let _ = self.loc.remove(&victim);
                        evicted.push(victim);
                    }
                } else {
                    let total = self.t1.len() + self.t2.len() + self.b1.len() + self.b2.len();
                    if total >= self.capacity {
                        if total >= self.capacity.saturating_mul(2) {
                            let _ = self.b2.pop_front().and_then(|v| self.loc.remove(&v));
                        }
                        if self.resident_len() >= self.capacity {
                            self.replace(key, evictable, &mut evicted);
                        }
                    }
                }
                self.t1.push_back(key);
                self.loc.insert(key, ArcList::T1);
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn always(_: BlockNumber) -> bool {
        true
    }

    #[test]
    fn stays_within_capacity_when_everything_is_evictable() {
        let mut arc = ArcState::new(3);
        let mut evicted = Vec::new();
        for i in 0..10 {
            evicted.extend(arc.on_insert(BlockNumber(i), &always));
            assert!(arc.resident_len() <= 3, "resident={}", arc.resident_len());
        }
        assert_eq!(evicted.len(), 7);
    }

    #[test]
    fn pinned_blocks_are_never_chosen() {
        let mut arc = ArcState::new(2);
        let pinned = |b: BlockNumber| b != BlockNumber(0);
        let _ = arc.on_insert(BlockNumber(0), &pinned);
        let _ = arc.on_insert(BlockNumber(1), &pinned);
        let evicted = arc.on_insert(BlockNumber(2), &pinned);
        assert_eq!(evicted, vec![BlockNumber(1)]);
    }

    #[test]
    fn overcommits_when_nothing_is_evictable() {
        let mut arc = ArcState::new(2);
        let never = |_: BlockNumber| false;
        for i in 0..4 {
            assert!(arc.on_insert(BlockNumber(i), &never).is_empty());
        }
        assert_eq!(arc.resident_len(), 4);
    }

    #[test]
    fn frequently_used_block_survives_scan() {
        let mut arc = ArcState::new(3);
        let _ = arc.on_insert(BlockNumber(100), &always);
        arc.on_hit(BlockNumber(100));
        let mut evicted = Vec::new();
        for i in 0..6 {
            evicted.extend(arc.on_insert(BlockNumber(i), &always));
        }
        assert!(!evicted.contains(&BlockNumber(100)));
    }
}
