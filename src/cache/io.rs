//! Cached sector and byte-level I/O on top of a [`SectorDevice`].

use std::sync::Mutex;

use crate::KB;
use crate::cache::{CacheState, CacheTuning, Reclaim, StoreFlags};
use crate::disk::{SectorDevice, valid_sector_size};
use crate::error::DeviceError;

/// Default memory budget handed to [`CacheTuning::auto`] when the caller has
/// no better estimate of free memory.
pub const DEFAULT_MEM_BUDGET: u64 = 64 * 1024 * 1024;

/// A sector device fronted by the block cache.
///
/// All engine I/O goes through this type. One mutex guards the cache state,
/// one the device, and one the shared writeback staging buffer; the flush
/// path releases the state lock around every device write.
pub struct CachedDisk {
    dev: Mutex<Box<dyn SectorDevice>>,
    state: Mutex<CacheState>,
    staging: Mutex<Vec<u8>>,
    tuning: CacheTuning,
    sector_size: u32,
    sector_shift: u32,
    total_sectors: u64,
    write_protected: bool,
}

impl CachedDisk {
    pub fn new(dev: Box<dyn SectorDevice>, tuning: CacheTuning) -> Result<CachedDisk, DeviceError> {
        let sector_size = dev.sector_size();
        if !valid_sector_size(sector_size) {
            return Err(DeviceError::OutOfBounds);
        }
        Ok(CachedDisk {
            sector_size,
            sector_shift: sector_size.trailing_zeros(),
            total_sectors: dev.sector_count(),
            write_protected: dev.write_protected(),
            state: Mutex::new(CacheState::new(sector_size as usize, tuning)),
            staging: Mutex::new(Vec::new()),
            tuning,
            dev: Mutex::new(dev),
        })
    }

    pub fn with_defaults(dev: Box<dyn SectorDevice>) -> Result<CachedDisk, DeviceError> {
        let tuning = CacheTuning::auto(dev.sector_count(), dev.sector_size(), DEFAULT_MEM_BUDGET);
        Self::new(dev, tuning)
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    pub fn sector_count(&self) -> u64 {
        self.total_sectors
    }

    pub fn size_bytes(&self) -> u64 {
        self.total_sectors << self.sector_shift
    }

    pub fn tuning(&self) -> &CacheTuning {
        &self.tuning
    }

    pub fn write_protected(&self) -> bool {
        self.write_protected
    }

    pub fn dirty_count(&self) -> usize {
        self.state.lock().unwrap().dirty_count()
    }

    pub fn entry_count(&self) -> usize {
        self.state.lock().unwrap().entry_count()
    }

    /// Tears the cache down, returning the backing device. Pending dirty
    /// sectors are lost unless [`CachedDisk::flush`] ran first.
    pub fn into_device(self) -> Box<dyn SectorDevice> {
        self.dev.into_inner().unwrap()
    }

    fn check_range(&self, sector: u64, len: usize) -> Result<u64, DeviceError> {
        if len % self.sector_size as usize != 0 {
            return Err(DeviceError::OutOfBounds);
        }
        let count = (len >> self.sector_shift) as u64;
        if sector > self.total_sectors || count > self.total_sectors - sector {
            return Err(DeviceError::OutOfBounds);
        }
        Ok(count)
    }

    /// Reads whole sectors, serving hits from the cache and batching misses
    /// into single device reads. Reads larger than the read-ahead window
    /// bypass the cache; pending dirty sectors are overlaid onto the result
    /// so they stay visible.
    pub fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        let count = self.check_range(sector, buf.len())? as usize;
        if count == 0 {
            return Ok(());
        }
        let ss = self.sector_size as usize;

        if count > self.tuning.read_ahead {
            self.dev.lock().unwrap().read_sectors(sector, buf)?;
            let mut state = self.state.lock().unwrap();
            for (i, chunk) in buf.chunks_exact_mut(ss).enumerate() {
                state.read(sector + i as u64, chunk, true);
            }
            return Ok(());
        }

        let mut uncached = 0usize;
        for i in 0..=count {
            let hit = if i < count {
                let chunk = &mut buf[i * ss..(i + 1) * ss];
                self.state.lock().unwrap().read(sector + i as u64, chunk, false)
            } else {
                true
            };
            if !hit {
                uncached += 1;
                continue;
            }
            if uncached > 0 {
                let start = i - uncached;
                self.fill_from_device(sector + start as u64, &mut buf[start * ss..i * ss])?;
                uncached = 0;
            }
        }
        Ok(())
    }

    fn fill_from_device(&self, sector: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        self.dev.lock().unwrap().read_sectors(sector, buf)?;
        let ss = self.sector_size as usize;
        let mut state = self.state.lock().unwrap();
        for (i, chunk) in buf.chunks_exact(ss).enumerate() {
            state.store(sector + i as u64, chunk, StoreFlags::empty());
        }
        Ok(())
    }

    /// Writes whole sectors. Writes are absorbed into the dirty tier when
    /// possible; a full dirty tier triggers a flush down to the low
    /// watermark first, and anything still not absorbable is written
    /// through. Writes larger than the staging buffer always go straight to
    /// the device.
    pub fn write_sectors(&self, sector: u64, buf: &[u8]) -> Result<(), DeviceError> {
        if self.write_protected {
            return Err(DeviceError::WriteProtected);
        }
        let count = self.check_range(sector, buf.len())? as usize;
        if count == 0 {
            return Ok(());
        }
        let ss = self.sector_size as usize;

        if count > self.tuning.write_buffer {
            self.dev.lock().unwrap().write_sectors(sector, buf)?;
            let mut state = self.state.lock().unwrap();
            for (i, chunk) in buf.chunks_exact(ss).enumerate() {
                state.store(
                    sector + i as u64,
                    chunk,
                    StoreFlags::UPDATE_ONLY | StoreFlags::CLEAR_DIRTY,
                );
            }
            return Ok(());
        }

        let crowded = {
            let state = self.state.lock().unwrap();
            state.dirty_count() + count >= self.tuning.max_dirty
        };
        if crowded {
            if let Err(e) = self.flush(self.tuning.low_watermark) {
                log::warn!("block cache: pre-write flush failed: {e}");
            }
        }

        let mut uncached = 0usize;
        for i in 0..=count {
            let absorbed = if i < count {
                let chunk = &buf[i * ss..(i + 1) * ss];
                self.state.lock().unwrap().write(sector + i as u64, chunk)
            } else {
                true
            };
            if !absorbed {
                uncached += 1;
                continue;
            }
            if uncached > 0 {
                let start = i - uncached;
                let region = &buf[start * ss..i * ss];
                let dev_start = sector + start as u64;
                self.dev.lock().unwrap().write_sectors(dev_start, region)?;
                let mut state = self.state.lock().unwrap();
                for (j, chunk) in region.chunks_exact(ss).enumerate() {
                    state.store(dev_start + j as u64, chunk, StoreFlags::CLEAR_DIRTY);
                }
                uncached = 0;
            }
        }
        Ok(())
    }

    /// Reads an arbitrary byte range. Small reads are rounded to whole
    /// sectors and opportunistically extended with read-ahead of sectors the
    /// cache does not already hold; large reads split into a partial head,
    /// a whole-sector body and a partial tail.
    pub fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        if buf.is_empty() {
            return Ok(());
        }
        let ss = self.sector_size as u64;
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(DeviceError::OutOfBounds)?;
        if end > self.size_bytes() {
            return Err(DeviceError::OutOfBounds);
        }
        let first = offset >> self.sector_shift;
        let boffs = (offset & (ss - 1)) as usize;
        let needed = (boffs as u64 + buf.len() as u64).div_ceil(ss) as usize;

        if needed <= self.tuning.read_ahead {
            let mut blocks = needed as u64;
            {
                let state = self.state.lock().unwrap();
                while blocks < self.tuning.read_ahead as u64
                    && first + blocks < self.total_sectors
                    && !state.contains(first + blocks)
                {
                    blocks += 1;
                }
            }
            let mut tmp = vec![0u8; (blocks << self.sector_shift) as usize];
            self.read_sectors(first, &mut tmp)?;
            buf.copy_from_slice(&tmp[boffs..boffs + buf.len()]);
            return Ok(());
        }

        let mut block = first;
        let mut pos = 0usize;
        let mut tmp = vec![0u8; ss as usize];
        if boffs != 0 {
            self.read_sectors(block, &mut tmp)?;
            let take = (ss as usize - boffs).min(buf.len());
            buf[..take].copy_from_slice(&tmp[boffs..boffs + take]);
            pos += take;
            block += 1;
        }
        let body = (buf.len() - pos) >> self.sector_shift;
        if body > 0 {
            let blen = body << self.sector_shift;
            self.read_sectors(block, &mut buf[pos..pos + blen])?;
            pos += blen;
            block += body as u64;
        }
        if pos < buf.len() {
            self.read_sectors(block, &mut tmp)?;
            let rest = buf.len() - pos;
            buf[pos..].copy_from_slice(&tmp[..rest]);
        }
        Ok(())
    }

    /// Writes an arbitrary byte range; partial head and tail sectors are
    /// read-modify-written through the cache. Crossing the high watermark
    /// flushes the dirty tier back down to the low watermark.
    pub fn write_bytes(&self, offset: u64, buf: &[u8]) -> Result<(), DeviceError> {
        if buf.is_empty() {
            return Ok(());
        }
        let ss = self.sector_size as usize;
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(DeviceError::OutOfBounds)?;
        if end > self.size_bytes() {
            return Err(DeviceError::OutOfBounds);
        }
        let mut block = offset >> self.sector_shift;
        let boffs = (offset & (ss as u64 - 1)) as usize;
        let mut pos = 0usize;
        let mut tmp = vec![0u8; ss];

        if boffs != 0 {
            self.read_sectors(block, &mut tmp)?;
            let take = (ss - boffs).min(buf.len());
            tmp[boffs..boffs + take].copy_from_slice(&buf[..take]);
            self.write_sectors(block, &tmp)?;
            pos += take;
            block += 1;
        }
        let body = (buf.len() - pos) / ss;
        if body > 0 {
            let blen = body * ss;
            self.write_sectors(block, &buf[pos..pos + blen])?;
            pos += blen;
            block += body as u64;
        }
        if pos < buf.len() {
            self.read_sectors(block, &mut tmp)?;
            tmp[..buf.len() - pos].copy_from_slice(&buf[pos..]);
            self.write_sectors(block, &tmp)?;
        }

        let dirty = self.state.lock().unwrap().dirty_count();
        if dirty >= self.tuning.high_watermark {
            self.flush(self.tuning.low_watermark)?;
        }
        Ok(())
    }

    /// Zero-fills a byte range (newly allocated clusters, directory
    /// clusters).
    pub fn write_zeroes(&self, mut offset: u64, mut len: u64) -> Result<(), DeviceError> {
        let zeroes = [0u8; 4 * KB as usize];
        while len > 0 {
            let chunk = len.min(zeroes.len() as u64) as usize;
            self.write_bytes(offset, &zeroes[..chunk])?;
            offset += chunk as u64;
            len -= chunk as u64;
        }
        Ok(())
    }

    /// Writes back dirty ranges, least recently touched first, until the
    /// dirty count drops to `max_dirty_target`. Each coalesced run is
    /// staged, written with the cache unlocked, then marked clean. A failed
    /// run is parked and retried no further within this flush.
    pub fn flush(&self, max_dirty_target: usize) -> Result<(), DeviceError> {
        let mut staging = self.staging.lock().unwrap();
        let ss = self.sector_size as usize;
        let mut last_err: Option<DeviceError> = None;

        loop {
            let run = {
                let mut state = self.state.lock().unwrap();
                if state.dirty_count() <= max_dirty_target {
                    break;
                }
                state.begin_flush_run(self.tuning.write_buffer, &mut staging)
            };
            let Some(run) = run else { break };
            let res = self
                .dev
                .lock()
                .unwrap()
                .write_sectors(run.start, &staging[..run.count * ss]);
            let ok = res.is_ok();
            if let Err(e) = res {
                log::warn!(
                    "block cache: writeback of {} sectors at {} failed: {e}",
                    run.count,
                    run.start
                );
                last_err = Some(e);
            }
            self.state.lock().unwrap().finish_flush_run(run, ok);
        }

        let remaining = {
            let mut state = self.state.lock().unwrap();
            state.end_flush();
            state.dirty_count()
        };
        if remaining <= max_dirty_target {
            Ok(())
        } else {
            Err(last_err
                .unwrap_or_else(|| DeviceError::Io(std::io::Error::other("flush incomplete"))))
        }
    }

    /// Full flush followed by a device sync.
    pub fn sync(&self) -> Result<(), DeviceError> {
        self.flush(0)?;
        self.dev.lock().unwrap().sync()
    }

    /// Memory-pressure entry point. Must not block: when the cache mutex is
    /// contended this reports [`Reclaim::Nothing`] immediately. Dirty
    /// entries are never freed.
    pub fn try_reclaim(&self, goal_bytes: usize) -> Reclaim {
        match self.state.try_lock() {
            Ok(mut state) => state.reclaim(goal_bytes),
            Err(_) => Reclaim::Nothing,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::disk::RamDisk;

    fn tuning(max_dirty: usize, write_buffer: usize) -> CacheTuning {
        CacheTuning {
            max_entries: 256,
            max_protected: 76,
            max_dirty,
            write_buffer,
            read_ahead: 8,
            high_watermark: (max_dirty * 60 / 100).max(1),
            low_watermark: max_dirty * 30 / 100,
        }
    }

    fn disk_with(max_dirty: usize, write_buffer: usize) -> CachedDisk {
        let dev = RamDisk::new(4 * 1024 * 1024, 512);
        CachedDisk::new(Box::new(dev), tuning(max_dirty, write_buffer)).unwrap()
    }

    fn pattern(tag: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| tag ^ i as u8).collect()
    }

    #[test]
    fn write_read_round_trip_with_and_without_flush() {
        let disk = disk_with(16, 8);
        let data = pattern(0x5A, 512);
        disk.write_sectors(42, &data).unwrap();
        let mut back = vec![0u8; 512];
        disk.read_sectors(42, &mut back).unwrap();
        assert_eq!(back, data);

        disk.flush(0).unwrap();
        assert_eq!(disk.dirty_count(), 0);
        let mut back = vec![0u8; 512];
        disk.read_sectors(42, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn flushed_data_survives_a_fresh_cache() {
        let disk = disk_with(16, 8);
        let data = pattern(0x77, 1024);
        disk.write_sectors(10, &data).unwrap();
        disk.sync().unwrap();

        let disk = CachedDisk::new(disk.into_device(), tuning(16, 8)).unwrap();
        let mut back = vec![0u8; 1024];
        disk.read_sectors(10, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn dirty_pressure_triggers_flush_to_low_watermark() {
        let disk = disk_with(8, 16);
        for s in 0..6u64 {
            disk.write_sectors(100 + s, &pattern(s as u8, 512)).unwrap();
        }
        assert_eq!(disk.dirty_count(), 6);

        // ten distinct sectors in one operation
        let big = pattern(0xC3, 10 * 512);
        disk.write_sectors(300, &big).unwrap();

        let dirty = disk.dirty_count();
        assert!(dirty >= disk.tuning().low_watermark);
        assert!(dirty <= 8);

        // everything written must read back, cached or not
        let mut back = vec![0u8; 10 * 512];
        disk.read_sectors(300, &mut back).unwrap();
        assert_eq!(back, big);
        let mut one = vec![0u8; 512];
        disk.read_sectors(103, &mut one).unwrap();
        assert_eq!(one, pattern(3, 512));
    }

    #[test]
    fn corrupted_clean_entry_is_expunged_and_reread() {
        let disk = disk_with(16, 8);
        let data = pattern(0x42, 512);
        disk.write_sectors(100, &data).unwrap();
        disk.sync().unwrap();

        // prime a clean entry
        let mut back = vec![0u8; 512];
        disk.read_sectors(100, &mut back).unwrap();

        // simulate third-party DMA into the cached buffer
        disk.state
            .lock()
            .unwrap()
            .corrupt_cached(100, |data| data[17] ^= 0xFF);

        let mut back = vec![0u8; 512];
        disk.read_sectors(100, &mut back).unwrap();
        assert_eq!(back, data, "device contents must win over corrupt cache");
    }

    #[test]
    fn byte_level_io_handles_partial_sectors() {
        let disk = disk_with(64, 8);
        let data = pattern(0x33, 3000);
        disk.write_bytes(777, &data).unwrap();
        let mut back = vec![0u8; 3000];
        disk.read_bytes(777, &mut back).unwrap();
        assert_eq!(back, data);

        // neighbouring bytes stay zero
        let mut edge = vec![0u8; 2];
        disk.read_bytes(775, &mut edge).unwrap();
        assert_eq!(edge, [0, 0]);
        disk.read_bytes(3777, &mut edge).unwrap();
        assert_eq!(edge, [0, 0]);
    }

    #[test]
    fn small_reads_prime_the_read_ahead_window() {
        let disk = disk_with(64, 8);
        assert_eq!(disk.entry_count(), 0);
        let mut byte = [0u8; 1];
        disk.read_bytes(0, &mut byte).unwrap();
        assert_eq!(disk.entry_count(), disk.tuning().read_ahead);
    }

    struct FaultyDisk {
        inner: RamDisk,
        fail_writes: Arc<AtomicBool>,
    }

    impl SectorDevice for FaultyDisk {
        fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
            self.inner.read_sectors(sector, buf)
        }

        fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Result<(), DeviceError> {
            if self.fail_writes.load(Ordering::Relaxed) {
                return Err(DeviceError::Io(std::io::Error::other("injected fault")));
            }
            self.inner.write_sectors(sector, buf)
        }

        fn sync(&mut self) -> Result<(), DeviceError> {
            self.inner.sync()
        }

        fn sector_count(&self) -> u64 {
            self.inner.sector_count()
        }

        fn sector_size(&self) -> u32 {
            self.inner.sector_size()
        }
    }

    #[test]
    fn failed_writeback_stays_dirty_and_retries_next_flush() {
        let fail = Arc::new(AtomicBool::new(false));
        let dev = FaultyDisk {
            inner: RamDisk::new(1024 * 1024, 512),
            fail_writes: Arc::clone(&fail),
        };
        let disk = CachedDisk::new(Box::new(dev), tuning(16, 8)).unwrap();

        let data = pattern(0x9C, 512);
        disk.write_sectors(5, &data).unwrap();
        fail.store(true, Ordering::Relaxed);
        assert!(disk.flush(0).is_err());
        assert_eq!(disk.dirty_count(), 1);

        fail.store(false, Ordering::Relaxed);
        disk.flush(0).unwrap();
        assert_eq!(disk.dirty_count(), 0);

        let disk = CachedDisk::new(disk.into_device(), tuning(16, 8)).unwrap();
        let mut back = vec![0u8; 512];
        disk.read_sectors(5, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn reclaim_reports_contention_without_blocking() {
        let disk = disk_with(16, 8);
        let mut buf = vec![0u8; 512];
        disk.read_sectors(1, &mut buf).unwrap();
        let _guard = disk.state.lock().unwrap();
        assert_eq!(disk.try_reclaim(usize::MAX), Reclaim::Nothing);
    }
}
