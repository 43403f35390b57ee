use std::collections::BTreeMap;

pub(crate) const NIL: u32 = u32::MAX;

/// A maximal run of consecutive dirty sector keys.
///
/// Invariants: `first <= last`, no two ranges touch or overlap, and the
/// owning [`RangeSet`] index agrees with the cache sector index on
/// membership.
#[derive(Debug)]
pub(crate) struct RangeNode {
    pub(crate) first: u64,
    pub(crate) last: u64,
    prev: u32,
    next: u32,
    /// Taken by a flusher; other flushers skip this range.
    pub(crate) flushing: bool,
    /// Device write failed; not retried again within the same flush.
    pub(crate) failed: bool,
}

impl RangeNode {
    pub(crate) fn len(&self) -> u64 {
        self.last - self.first + 1
    }

    pub(crate) fn contains(&self, sector: u64) -> bool {
        (self.first..=self.last).contains(&sector)
    }
}

/// Dirty ranges in MRU order plus an ordered index keyed by range start.
pub(crate) struct RangeSet {
    arena: Vec<RangeNode>,
    free: Vec<u32>,
    by_first: BTreeMap<u64, u32>,
    head: u32,
    tail: u32,
    len: usize,
}

impl RangeSet {
    pub(crate) fn new() -> RangeSet {
        RangeSet {
            arena: Vec::new(),
            free: Vec::new(),
            by_first: BTreeMap::new(),
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn node(&self, idx: u32) -> &RangeNode {
        &self.arena[idx as usize]
    }

    pub(crate) fn node_mut(&mut self, idx: u32) -> &mut RangeNode {
        &mut self.arena[idx as usize]
    }

    /// The range holding `sector`, if any.
    pub(crate) fn containing(&self, sector: u64) -> Option<u32> {
        let (_, &idx) = self.by_first.range(..=sector).next_back()?;
        if self.arena[idx as usize].contains(sector) {
            Some(idx)
        } else {
            None
        }
    }

    /// Records that `sector` became dirty. The sector must not already be
    /// part of a range. Extends an adjacent range when possible and closes
    /// one-sector gaps by coalescing the two neighbours.
    pub(crate) fn add(&mut self, sector: u64) -> u32 {
        debug_assert!(self.containing(sector).is_none());

        if let Some((_, &pred)) = self.by_first.range(..sector).next_back() {
            if self.arena[pred as usize].last + 1 == sector {
                self.arena[pred as usize].last = sector;
                if let Some(&succ) = self.by_first.get(&(sector + 1)) {
                    let succ_last = self.arena[succ as usize].last;
                    self.arena[pred as usize].last = succ_last;
                    self.by_first.remove(&(sector + 1));
                    self.unlink(succ);
                    self.release(succ);
                    self.len -= 1;
                }
                self.touch(pred);
                return pred;
            }
        }

        if let Some(&succ) = self.by_first.get(&(sector + 1)) {
            self.by_first.remove(&(sector + 1));
            self.arena[succ as usize].first = sector;
            self.by_first.insert(sector, succ);
            self.touch(succ);
            return succ;
        }

        let idx = self.acquire(sector);
        self.by_first.insert(sector, idx);
        self.push_front(idx);
        self.len += 1;
        idx
    }

    /// Records that `sector` left the dirty state: shrinks an endpoint,
    /// splits on an interior sector, or drops the range entirely.
    pub(crate) fn remove_sector(&mut self, sector: u64) {
        let idx = self
            .containing(sector)
            .expect("sector not tracked by any range");
        let (first, last) = {
            let node = &self.arena[idx as usize];
            (node.first, node.last)
        };

        if first == last {
            self.by_first.remove(&first);
            self.unlink(idx);
            self.release(idx);
            self.len -= 1;
        } else if sector == first {
            self.by_first.remove(&first);
            self.arena[idx as usize].first = sector + 1;
            self.by_first.insert(sector + 1, idx);
        } else if sector == last {
            self.arena[idx as usize].last = sector - 1;
        } else {
            self.arena[idx as usize].last = sector - 1;
            let right = self.acquire(sector + 1);
            self.arena[right as usize].last = last;
            self.by_first.insert(sector + 1, right);
            self.insert_after(idx, right);
            self.len += 1;
        }
    }

    /// Moves a range to the MRU position.
    pub(crate) fn touch(&mut self, idx: u32) {
        if self.head != idx {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    /// The least recently touched range that no flusher holds and that has
    /// not already failed this flush.
    pub(crate) fn lru_candidate(&self) -> Option<u32> {
        let mut idx = self.tail;
        while idx != NIL {
            let node = &self.arena[idx as usize];
            if !node.flushing && !node.failed {
                return Some(idx);
            }
            idx = node.prev;
        }
        None
    }

    /// Re-arms failed ranges for the next flush attempt.
    pub(crate) fn clear_failed(&mut self) {
        let mut idx = self.head;
        while idx != NIL {
            self.arena[idx as usize].failed = false;
            idx = self.arena[idx as usize].next;
        }
    }

    #[cfg(test)]
    pub(crate) fn intervals(&self) -> Vec<(u64, u64)> {
        self.by_first
            .values()
            .map(|&idx| {
                let node = &self.arena[idx as usize];
                (node.first, node.last)
            })
            .collect()
    }

    fn acquire(&mut self, sector: u64) -> u32 {
        let node = RangeNode {
            first: sector,
            last: sector,
            prev: NIL,
            next: NIL,
            flushing: false,
            failed: false,
        };
        match self.free.pop() {
            Some(idx) => {
                self.arena[idx as usize] = node;
                idx
            }
            None => {
                self.arena.push(node);
                (self.arena.len() - 1) as u32
            }
        }
    }

    fn release(&mut self, idx: u32) {
        self.free.push(idx);
    }

    fn push_front(&mut self, idx: u32) {
        let old_head = self.head;
        {
            let node = &mut self.arena[idx as usize];
            node.prev = NIL;
            node.next = old_head;
        }
        if old_head != NIL {
            self.arena[old_head as usize].prev = idx;
        } else {
            self.tail = idx;
        }
        self.head = idx;
    }

    fn insert_after(&mut self, after: u32, idx: u32) {
        let next = self.arena[after as usize].next;
        {
            let node = &mut self.arena[idx as usize];
            node.prev = after;
            node.next = next;
        }
        self.arena[after as usize].next = idx;
        if next != NIL {
            self.arena[next as usize].prev = idx;
        } else {
            self.tail = idx;
        }
    }

    fn unlink(&mut self, idx: u32) {
        let (prev, next) = {
            let node = &self.arena[idx as usize];
            (node.prev, node.next)
        };
        if prev != NIL {
            self.arena[prev as usize].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.arena[next as usize].prev = prev;
        } else {
            self.tail = prev;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_touching(set: &RangeSet) {
        let ivs = set.intervals();
        for pair in ivs.windows(2) {
            let (_, a_last) = pair[0];
            let (b_first, _) = pair[1];
            assert!(
                a_last + 1 < b_first,
                "ranges touch or overlap: {:?}",
                ivs
            );
        }
    }

    #[test]
    fn grows_forward_and_backward() {
        let mut set = RangeSet::new();
        set.add(10);
        set.add(11);
        set.add(9);
        assert_eq!(set.intervals(), vec![(9, 11)]);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn gap_fill_coalesces() {
        let mut set = RangeSet::new();
        set.add(5);
        set.add(7);
        assert_eq!(set.len(), 2);
        set.add(6);
        assert_eq!(set.intervals(), vec![(5, 7)]);
        assert_eq!(set.len(), 1);
        no_touching(&set);
    }

    #[test]
    fn disjoint_ranges_stay_apart() {
        let mut set = RangeSet::new();
        for s in [1u64, 2, 3, 10, 11, 20] {
            set.add(s);
        }
        assert_eq!(set.intervals(), vec![(1, 3), (10, 11), (20, 20)]);
        no_touching(&set);
    }

    #[test]
    fn endpoint_removal_shrinks() {
        let mut set = RangeSet::new();
        for s in 4..8u64 {
            set.add(s);
        }
        set.remove_sector(4);
        assert_eq!(set.intervals(), vec![(5, 7)]);
        set.remove_sector(7);
        assert_eq!(set.intervals(), vec![(5, 6)]);
        set.remove_sector(5);
        set.remove_sector(6);
        assert!(set.is_empty());
    }

    #[test]
    fn interior_removal_splits() {
        let mut set = RangeSet::new();
        for s in 0..5u64 {
            set.add(s);
        }
        set.remove_sector(2);
        assert_eq!(set.intervals(), vec![(0, 1), (3, 4)]);
        assert_eq!(set.len(), 2);
        no_touching(&set);
        // refilling the hole merges back into one range
        set.add(2);
        assert_eq!(set.intervals(), vec![(0, 4)]);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn lru_candidate_skips_flushing() {
        let mut set = RangeSet::new();
        set.add(1);
        set.add(10);
        // 10 is MRU, 1 is LRU
        let lru = set.lru_candidate().unwrap();
        assert_eq!(set.node(lru).first, 1);
        set.node_mut(lru).flushing = true;
        let next = set.lru_candidate().unwrap();
        assert_eq!(set.node(next).first, 10);
        set.node_mut(next).failed = true;
        assert!(set.lru_candidate().is_none());
        set.clear_failed();
        assert!(set.lru_candidate().is_some());
    }
}
