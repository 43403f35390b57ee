//! Bounded, segmented-LRU cache over fixed-size sectors.
//!
//! Clean entries live on a probation/protected pair of LRU lists and carry a
//! checksum that detects third-party corruption of the cached buffer. Dirty
//! entries are grouped into maximal runs of consecutive sectors so writeback
//! can issue large coalesced device writes.

pub mod io;
mod range;

use std::collections::BTreeMap;

use bitflags::bitflags;

use crate::{KB, MB};
use range::{NIL, RangeSet};

/// Cache sizing knobs, all in sectors.
#[derive(Copy, Clone, Debug)]
pub struct CacheTuning {
    pub max_entries: usize,
    pub max_protected: usize,
    pub max_dirty: usize,
    /// Sectors staged per coalesced device write.
    pub write_buffer: usize,
    /// Opportunistic read-ahead window for byte-level reads.
    pub read_ahead: usize,
    pub high_watermark: usize,
    pub low_watermark: usize,
}

impl CacheTuning {
    /// Derives the limits from the disk size and a memory budget:
    /// `max_entries = max(min(1 % of sectors, 10 % of budget), 1 MiB)`,
    /// protected and dirty tiers at 30 % each, watermarks at 60 %/30 % of
    /// the dirty limit.
    pub fn auto(total_sectors: u64, sector_size: u32, mem_budget: u64) -> CacheTuning {
        let disk_share = (total_sectors / 100) as usize;
        let mem_share = (mem_budget / 10 / sector_size as u64) as usize;
        let floor = (MB as usize / sector_size as usize).max(8);
        let max_entries = disk_share.min(mem_share).max(floor);
        let max_dirty = (max_entries * 30 / 100).max(1);
        CacheTuning {
            max_entries,
            max_protected: (max_entries * 30 / 100).max(1),
            max_dirty,
            write_buffer: max_dirty.min(64 * KB as usize / sector_size as usize).max(1),
            read_ahead: (64 * KB as usize / sector_size as usize).max(1),
            high_watermark: (max_dirty * 60 / 100).max(1),
            low_watermark: max_dirty * 30 / 100,
        }
    }
}

bitflags! {
    /// Flags for [`CacheState::store`].
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub(crate) struct StoreFlags: u32 {
        /// Only refresh an entry that is already cached; never allocate.
        const UPDATE_ONLY = 1 << 0;
        /// The data is known to be on the device; a dirty entry becomes
        /// clean.
        const CLEAR_DIRTY = 1 << 1;
    }
}

/// Outcome of a memory-pressure reclaim attempt.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reclaim {
    Nothing,
    SomeFreed,
    AllDone,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Kind {
    Probation,
    Protected,
    Dirty,
}

struct Slot {
    sector: u64,
    data: Box<[u8]>,
    kind: Kind,
    /// Valid only while the entry is clean.
    checksum: u32,
    /// Bumped on every dirty overwrite; lets the flusher detect a sector
    /// redirtied while its device write was in flight.
    seq: u32,
    prev: u32,
    next: u32,
}

#[derive(Copy, Clone)]
struct Lru {
    head: u32,
    tail: u32,
    len: usize,
}

impl Lru {
    const EMPTY: Lru = Lru {
        head: NIL,
        tail: NIL,
        len: 0,
    };
}

fn list_push_front(slots: &mut [Slot], list: &mut Lru, idx: u32) {
    let old_head = list.head;
    {
        let slot = &mut slots[idx as usize];
        slot.prev = NIL;
        slot.next = old_head;
    }
    if old_head != NIL {
        slots[old_head as usize].prev = idx;
    } else {
        list.tail = idx;
    }
    list.head = idx;
    list.len += 1;
}

fn list_unlink(slots: &mut [Slot], list: &mut Lru, idx: u32) {
    let (prev, next) = {
        let slot = &slots[idx as usize];
        (slot.prev, slot.next)
    };
    if prev != NIL {
        slots[prev as usize].next = next;
    } else {
        list.head = next;
    }
    if next != NIL {
        slots[next as usize].prev = prev;
    } else {
        list.tail = prev;
    }
    list.len -= 1;
}

/// End-around-carry sum of the little-endian words of a sector buffer.
fn block_checksum(data: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    for word in data.chunks_exact(4) {
        let value = u32::from_le_bytes(word.try_into().unwrap());
        let (next, carry) = sum.overflowing_add(value);
        sum = next + carry as u32;
    }
    sum
}

/// One coalesced run handed to the flusher; sectors `start .. start + count`
/// have been copied into the staging buffer.
pub(crate) struct FlushRun {
    range: u32,
    pub(crate) start: u64,
    pub(crate) count: usize,
    seqs: Vec<u32>,
}

/// The device-free cache state machine. All methods require external
/// serialisation (the owning [`io::CachedDisk`] wraps it in a mutex).
pub(crate) struct CacheState {
    tuning: CacheTuning,
    sector_size: usize,
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    by_sector: BTreeMap<u64, u32>,
    probation: Lru,
    protected: Lru,
    ranges: RangeSet,
    live: usize,
    num_dirty: usize,
}

impl CacheState {
    pub(crate) fn new(sector_size: usize, tuning: CacheTuning) -> CacheState {
        CacheState {
            tuning,
            sector_size,
            slots: Vec::new(),
            free_slots: Vec::new(),
            by_sector: BTreeMap::new(),
            probation: Lru::EMPTY,
            protected: Lru::EMPTY,
            ranges: RangeSet::new(),
            live: 0,
            num_dirty: 0,
        }
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.live
    }

    pub(crate) fn dirty_count(&self) -> usize {
        self.num_dirty
    }

    /// Membership test without any LRU side effects.
    pub(crate) fn contains(&self, sector: u64) -> bool {
        self.by_sector.contains_key(&sector)
    }

    /// Serves `sector` from the cache. A clean hit is checksum-verified
    /// first; on mismatch the entry is expunged and the read reports a miss
    /// so the caller re-reads the device. With `dirty_only` set, clean
    /// entries are ignored entirely (used to overlay pending writes onto a
    /// buffer freshly read from the device).
    pub(crate) fn read(&mut self, sector: u64, buf: &mut [u8], dirty_only: bool) -> bool {
        let Some(&idx) = self.by_sector.get(&sector) else {
            return false;
        };
        let i = idx as usize;
        match self.slots[i].kind {
            Kind::Dirty => {
                buf.copy_from_slice(&self.slots[i].data);
                let range = self.ranges.containing(sector).expect("dirty entry without range");
                self.ranges.touch(range);
                true
            }
            _ if dirty_only => false,
            Kind::Probation => {
                if block_checksum(&self.slots[i].data) != self.slots[i].checksum {
                    log::warn!("block cache: checksum mismatch on sector {sector}, expunging");
                    self.expunge(idx, false);
                    return false;
                }
                buf.copy_from_slice(&self.slots[i].data);
                // a probation hit earns a protected slot
                list_unlink(&mut self.slots, &mut self.probation, idx);
                list_push_front(&mut self.slots, &mut self.protected, idx);
                self.slots[i].kind = Kind::Protected;
                if self.protected.len > self.tuning.max_protected {
                    let tail = self.protected.tail;
                    list_unlink(&mut self.slots, &mut self.protected, tail);
                    list_push_front(&mut self.slots, &mut self.probation, tail);
                    self.slots[tail as usize].kind = Kind::Probation;
                }
                true
            }
            Kind::Protected => {
                if block_checksum(&self.slots[i].data) != self.slots[i].checksum {
                    log::warn!("block cache: checksum mismatch on sector {sector}, expunging");
                    self.expunge(idx, false);
                    return false;
                }
                buf.copy_from_slice(&self.slots[i].data);
                if self.protected.head != idx {
                    list_unlink(&mut self.slots, &mut self.protected, idx);
                    list_push_front(&mut self.slots, &mut self.protected, idx);
                }
                true
            }
        }
    }

    /// Deposits data that matches the device contents (read-miss fill or a
    /// completed write-through). Never grows the dirty tier.
    pub(crate) fn store(&mut self, sector: u64, buf: &[u8], flags: StoreFlags) -> bool {
        if let Some(&idx) = self.by_sector.get(&sector) {
            let i = idx as usize;
            self.slots[i].data.copy_from_slice(buf);
            if self.slots[i].kind == Kind::Dirty {
                if flags.contains(StoreFlags::CLEAR_DIRTY) {
                    self.make_clean(idx);
                } else {
                    self.slots[i].seq = self.slots[i].seq.wrapping_add(1);
                    let range = self.ranges.containing(sector).expect("dirty entry without range");
                    self.ranges.touch(range);
                }
            } else {
                self.slots[i].checksum = block_checksum(&self.slots[i].data);
            }
            true
        } else if flags.contains(StoreFlags::UPDATE_ONLY) {
            false
        } else {
            let Some(idx) = self.alloc_slot(sector) else {
                return false;
            };
            let i = idx as usize;
            self.slots[i].data.copy_from_slice(buf);
            self.slots[i].checksum = block_checksum(buf);
            self.slots[i].kind = Kind::Probation;
            list_push_front(&mut self.slots, &mut self.probation, idx);
            self.by_sector.insert(sector, idx);
            true
        }
    }

    /// Absorbs a write into the dirty tier. Fails when the dirty limit is
    /// reached (and the sector is not already dirty) or when no clean entry
    /// can be evicted; the caller then writes through to the device.
    pub(crate) fn write(&mut self, sector: u64, buf: &[u8]) -> bool {
        if let Some(&idx) = self.by_sector.get(&sector) {
            let i = idx as usize;
            if self.slots[i].kind == Kind::Dirty {
                self.slots[i].data.copy_from_slice(buf);
                self.slots[i].seq = self.slots[i].seq.wrapping_add(1);
                let range = self.ranges.containing(sector).expect("dirty entry without range");
                self.ranges.touch(range);
            } else {
                if self.num_dirty >= self.tuning.max_dirty {
                    return false;
                }
                self.slots[i].data.copy_from_slice(buf);
                let list = match self.slots[i].kind {
                    Kind::Probation => &mut self.probation,
                    Kind::Protected => &mut self.protected,
                    Kind::Dirty => unreachable!(),
                };
                list_unlink(&mut self.slots, list, idx);
                self.slots[i].kind = Kind::Dirty;
                self.slots[i].seq = self.slots[i].seq.wrapping_add(1);
                self.num_dirty += 1;
                self.ranges.add(sector);
            }
            true
        } else {
            if self.num_dirty >= self.tuning.max_dirty {
                return false;
            }
            let Some(idx) = self.alloc_slot(sector) else {
                return false;
            };
            let i = idx as usize;
            self.slots[i].data.copy_from_slice(buf);
            self.slots[i].kind = Kind::Dirty;
            self.num_dirty += 1;
            self.by_sector.insert(sector, idx);
            self.ranges.add(sector);
            true
        }
    }

    /// Stages the next coalesced run for writeback: picks the least recently
    /// touched range, copies up to `max_sectors` of its leading entries into
    /// `staging` and marks the range as taken.
    pub(crate) fn begin_flush_run(
        &mut self,
        max_sectors: usize,
        staging: &mut Vec<u8>,
    ) -> Option<FlushRun> {
        let range = self.ranges.lru_candidate()?;
        let (first, len) = {
            let node = self.ranges.node(range);
            (node.first, node.len())
        };
        let count = (len as usize).min(max_sectors);
        staging.clear();
        let mut seqs = Vec::with_capacity(count);
        for i in 0..count {
            let sector = first + i as u64;
            let &idx = self
                .by_sector
                .get(&sector)
                .expect("dirty range sector missing from cache");
            let slot = &self.slots[idx as usize];
            debug_assert_eq!(slot.kind, Kind::Dirty);
            staging.extend_from_slice(&slot.data);
            seqs.push(slot.seq);
        }
        self.ranges.node_mut(range).flushing = true;
        Some(FlushRun {
            range,
            start: first,
            count,
            seqs,
        })
    }

    /// Completes a staged run. On success every sector that was not
    /// redirtied while the device write was in flight becomes clean; on
    /// failure the range is parked until the end of this flush.
    pub(crate) fn finish_flush_run(&mut self, run: FlushRun, ok: bool) {
        self.ranges.node_mut(run.range).flushing = false;
        if !ok {
            self.ranges.node_mut(run.range).failed = true;
            return;
        }
        for i in 0..run.count {
            let sector = run.start + i as u64;
            let Some(&idx) = self.by_sector.get(&sector) else {
                break;
            };
            let slot = &self.slots[idx as usize];
            if slot.kind != Kind::Dirty || slot.seq != run.seqs[i] {
                break;
            }
            self.make_clean(idx);
        }
    }

    /// Re-arms ranges whose writes failed, so the next flush retries them.
    pub(crate) fn end_flush(&mut self) {
        self.ranges.clear_failed();
    }

    /// Frees clean entries from the LRU tails until `goal` bytes are
    /// released or both clean lists are empty. Dirty entries are never
    /// touched.
    pub(crate) fn reclaim(&mut self, goal: usize) -> Reclaim {
        let mut freed = 0usize;
        while freed < goal {
            let tail = if self.probation.tail != NIL {
                self.probation.tail
            } else {
                self.protected.tail
            };
            if tail == NIL {
                break;
            }
            self.expunge(tail, true);
            freed += self.sector_size;
        }
        if freed == 0 {
            Reclaim::Nothing
        } else if self.probation.tail == NIL && self.protected.tail == NIL {
            Reclaim::AllDone
        } else {
            Reclaim::SomeFreed
        }
    }

    fn make_clean(&mut self, idx: u32) {
        let i = idx as usize;
        debug_assert_eq!(self.slots[i].kind, Kind::Dirty);
        self.ranges.remove_sector(self.slots[i].sector);
        self.num_dirty -= 1;
        self.slots[i].kind = Kind::Probation;
        self.slots[i].checksum = block_checksum(&self.slots[i].data);
        list_push_front(&mut self.slots, &mut self.probation, idx);
    }

    fn expunge(&mut self, idx: u32, release_memory: bool) {
        let i = idx as usize;
        let list = match self.slots[i].kind {
            Kind::Probation => &mut self.probation,
            Kind::Protected => &mut self.protected,
            Kind::Dirty => panic!("dirty entries cannot be expunged"),
        };
        list_unlink(&mut self.slots, list, idx);
        self.by_sector.remove(&self.slots[i].sector);
        if release_memory {
            self.slots[i].data = Box::new([]);
        }
        self.live -= 1;
        self.free_slots.push(idx);
    }

    fn alloc_slot(&mut self, sector: u64) -> Option<u32> {
        if self.live >= self.tuning.max_entries {
            let tail = self.probation.tail;
            if tail == NIL {
                return None;
            }
            self.expunge(tail, false);
        }
        let idx = match self.free_slots.pop() {
            Some(idx) => idx,
            None => {
                self.slots.push(Slot {
                    sector: 0,
                    data: Box::new([]),
                    kind: Kind::Probation,
                    checksum: 0,
                    seq: 0,
                    prev: NIL,
                    next: NIL,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[idx as usize];
        if slot.data.len() != self.sector_size {
            slot.data = vec![0u8; self.sector_size].into_boxed_slice();
        }
        slot.sector = sector;
        slot.seq = 0;
        slot.prev = NIL;
        slot.next = NIL;
        self.live += 1;
        Some(idx)
    }

    #[cfg(test)]
    pub(crate) fn corrupt_cached(&mut self, sector: u64, f: impl FnOnce(&mut [u8])) {
        let &idx = self.by_sector.get(&sector).expect("sector not cached");
        f(&mut self.slots[idx as usize].data);
    }

    #[cfg(test)]
    fn is_dirty(&self, sector: u64) -> bool {
        self.by_sector
            .get(&sector)
            .is_some_and(|&idx| self.slots[idx as usize].kind == Kind::Dirty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning(max_entries: usize, max_dirty: usize) -> CacheTuning {
        CacheTuning {
            max_entries,
            max_protected: (max_entries * 30 / 100).max(1),
            max_dirty,
            write_buffer: 8,
            read_ahead: 8,
            high_watermark: (max_dirty * 60 / 100).max(1),
            low_watermark: max_dirty * 30 / 100,
        }
    }

    fn state(max_entries: usize, max_dirty: usize) -> CacheState {
        CacheState::new(16, tuning(max_entries, max_dirty))
    }

    fn sector_data(tag: u8) -> Vec<u8> {
        vec![tag; 16]
    }

    #[test]
    fn store_then_read_round_trips() {
        let mut cache = state(8, 2);
        let data = sector_data(0xAB);
        assert!(cache.store(5, &data, StoreFlags::empty()));
        let mut out = vec![0u8; 16];
        assert!(cache.read(5, &mut out, false));
        assert_eq!(out, data);
    }

    #[test]
    fn probation_hit_promotes_and_protected_overflows_back() {
        let mut cache = state(16, 2);
        // max_protected here is 16 * 30% = 4
        for s in 0..6u64 {
            cache.store(s, &sector_data(s as u8), StoreFlags::empty());
        }
        let mut out = vec![0u8; 16];
        for s in 0..5u64 {
            cache.read(s, &mut out, false);
        }
        assert_eq!(cache.protected.len, 4);
        // the first promoted entry was demoted back to probation
        assert_eq!(cache.probation.len, 2);
        assert_eq!(cache.entry_count(), 6);
    }

    #[test]
    fn total_is_bounded_and_eviction_comes_from_probation() {
        let mut cache = state(10, 4);
        // max_protected here is 3
        let mut out = vec![0u8; 16];
        for s in 0..3u64 {
            cache.store(s, &sector_data(s as u8), StoreFlags::empty());
            cache.read(s, &mut out, false); // promote into protected
        }
        for s in 10..30u64 {
            cache.store(s, &sector_data(0xFF), StoreFlags::empty());
            assert!(cache.entry_count() <= 10);
        }
        // the protected set survived the scan
        for s in 0..3u64 {
            assert!(cache.contains(s), "protected sector {s} was evicted");
        }
    }

    #[test]
    fn dirty_is_bounded() {
        let mut cache = state(64, 4);
        for s in 0..4u64 {
            assert!(cache.write(s * 10, &sector_data(1)));
        }
        assert!(!cache.write(100, &sector_data(1)));
        assert_eq!(cache.dirty_count(), 4);
        // overwriting an already dirty sector still succeeds
        assert!(cache.write(10, &sector_data(2)));
        assert_eq!(cache.dirty_count(), 4);
    }

    #[test]
    fn clean_to_dirty_conversion_respects_limit() {
        let mut cache = state(64, 1);
        cache.store(1, &sector_data(1), StoreFlags::empty());
        cache.store(2, &sector_data(2), StoreFlags::empty());
        assert!(cache.write(1, &sector_data(3)));
        assert!(!cache.write(2, &sector_data(4)));
        assert!(cache.is_dirty(1));
        assert!(!cache.is_dirty(2));
    }

    #[test]
    fn update_only_never_allocates() {
        let mut cache = state(8, 2);
        assert!(!cache.store(9, &sector_data(1), StoreFlags::UPDATE_ONLY));
        assert!(!cache.contains(9));
        cache.write(9, &sector_data(1));
        assert!(cache.store(
            9,
            &sector_data(2),
            StoreFlags::UPDATE_ONLY | StoreFlags::CLEAR_DIRTY
        ));
        assert!(!cache.is_dirty(9));
        assert_eq!(cache.dirty_count(), 0);
    }

    #[test]
    fn corrupted_clean_entry_reports_miss() {
        let mut cache = state(8, 2);
        cache.store(3, &sector_data(7), StoreFlags::empty());
        cache.corrupt_cached(3, |data| data[0] ^= 0xFF);
        let mut out = vec![0u8; 16];
        assert!(!cache.read(3, &mut out, false));
        assert!(!cache.contains(3));
    }

    #[test]
    fn dirty_entries_are_trusted_on_read() {
        let mut cache = state(8, 2);
        cache.write(3, &sector_data(7), );
        cache.corrupt_cached(3, |data| data[0] = 0x11);
        let mut out = vec![0u8; 16];
        assert!(cache.read(3, &mut out, false));
        assert_eq!(out[0], 0x11);
    }

    #[test]
    fn reclaim_never_frees_dirty() {
        let mut cache = state(16, 8);
        for s in 0..4u64 {
            cache.write(s, &sector_data(1));
        }
        for s in 10..14u64 {
            cache.store(s, &sector_data(2), StoreFlags::empty());
        }
        assert_eq!(cache.reclaim(usize::MAX), Reclaim::AllDone);
        assert_eq!(cache.dirty_count(), 4);
        assert_eq!(cache.entry_count(), 4);
        for s in 0..4u64 {
            assert!(cache.is_dirty(s));
        }
        assert_eq!(cache.reclaim(usize::MAX), Reclaim::Nothing);
    }

    #[test]
    fn reclaim_stops_at_goal() {
        let mut cache = state(16, 8);
        for s in 0..8u64 {
            cache.store(s, &sector_data(2), StoreFlags::empty());
        }
        assert_eq!(cache.reclaim(32), Reclaim::SomeFreed);
        assert_eq!(cache.entry_count(), 6);
    }

    #[test]
    fn flush_run_covers_coalesced_range() {
        let mut cache = state(64, 16);
        for s in [7u64, 5, 6, 20] {
            cache.write(s, &sector_data(s as u8));
        }
        let mut staging = Vec::new();
        // sector 20 was touched last, so 5..=7 is the LRU range
        let run = cache.begin_flush_run(16, &mut staging).unwrap();
        assert_eq!(run.start, 5);
        assert_eq!(run.count, 3);
        assert_eq!(&staging[0..16], &sector_data(5)[..]);
        assert_eq!(&staging[32..48], &sector_data(7)[..]);
        cache.finish_flush_run(run, true);
        assert_eq!(cache.dirty_count(), 1);
        assert!(cache.is_dirty(20));
        // the flushed sectors are now clean but still cached
        let mut out = vec![0u8; 16];
        assert!(cache.read(6, &mut out, false));
        assert_eq!(out, sector_data(6));
    }

    #[test]
    fn failed_flush_keeps_sectors_dirty() {
        let mut cache = state(64, 16);
        cache.write(5, &sector_data(5));
        let mut staging = Vec::new();
        let run = cache.begin_flush_run(16, &mut staging).unwrap();
        cache.finish_flush_run(run, false);
        assert_eq!(cache.dirty_count(), 1);
        // parked until end_flush
        assert!(cache.begin_flush_run(16, &mut staging).is_none());
        cache.end_flush();
        assert!(cache.begin_flush_run(16, &mut staging).is_some());
    }

    #[test]
    fn redirtied_sector_survives_flush_completion() {
        let mut cache = state(64, 16);
        cache.write(5, &sector_data(1));
        let mut staging = Vec::new();
        let run = cache.begin_flush_run(16, &mut staging).unwrap();
        // concurrent write lands while the device write is in flight
        cache.write(5, &sector_data(2));
        cache.finish_flush_run(run, true);
        assert!(cache.is_dirty(5));
        let mut out = vec![0u8; 16];
        cache.read(5, &mut out, false);
        assert_eq!(out, sector_data(2));
    }
}
