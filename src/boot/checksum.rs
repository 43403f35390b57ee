/// Running checksum over the boot region, per exFAT §3.4. The
/// `volume_flags` and `percent_in_use` fields of the boot sector are
/// excluded so they can change without invalidating the checksum sector.
#[derive(Copy, Clone, Debug)]
pub struct Checksum {
    inner: u32,
}

impl Checksum {
    pub fn new() -> Checksum {
        Self { inner: 0 }
    }

    /// Folds in the boot sector itself (skipping the mutable fields at
    /// offsets 106, 107 and 112).
    pub fn boot_sector(&mut self, sector: &[u8]) {
        for (i, byte) in sector.iter().enumerate() {
            if i == 106 || i == 107 || i == 112 {
                continue;
            }
            self.inner = self.inner.rotate_right(1).wrapping_add(*byte as u32);
        }
    }

    /// Folds in any other sector of the boot region.
    pub fn sector(&mut self, sector: &[u8]) {
        for byte in sector {
            self.inner = self.inner.rotate_right(1).wrapping_add(*byte as u32);
        }
    }

    /// Returns the current state of the checksum.
    pub fn get(&self) -> u32 {
        self.inner
    }
}

impl Default for Checksum {
    fn default() -> Self {
        Self::new()
    }
}
