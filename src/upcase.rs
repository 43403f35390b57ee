use crate::Result;
use crate::error::Error;

/// Marker introducing an identity run in a compressed on-disk table.
const IDENTITY_RUN: u16 = 0xFFFF;

/// The upcase table folds file names for case-insensitive comparison.
/// Code points beyond the table map to themselves.
pub struct UpcaseTable {
    map: Vec<u16>,
}

impl UpcaseTable {
    /// Decodes an on-disk table. Both the raw form (one mapping per code
    /// point) and the compressed form (`FFFFh` followed by the length of an
    /// identity run) are accepted.
    pub fn from_bytes(data: &[u8]) -> Result<UpcaseTable> {
        if data.len() % 2 != 0 {
            return Err(Error::corrupt("upcase table has odd length"));
        }
        let mut values = data
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]));
        let mut map = Vec::new();
        while let Some(value) = values.next() {
            if value == IDENTITY_RUN {
                match values.next() {
                    Some(run) => {
                        let start = map.len();
                        for i in 0..run as usize {
                            if start + i > u16::MAX as usize {
                                return Err(Error::corrupt("upcase identity run too long"));
                            }
                            map.push((start + i) as u16);
                        }
                    }
                    // a trailing FFFF is the mapping for U+FFFF itself
                    None => map.push(IDENTITY_RUN),
                }
            } else {
                map.push(value);
            }
            if map.len() > u16::MAX as usize + 1 {
                return Err(Error::corrupt("upcase table too long"));
            }
        }
        Ok(UpcaseTable { map })
    }

    /// An ASCII-folding table (128 entries), used when formatting.
    pub fn ascii() -> UpcaseTable {
        let map = (0u16..128)
            .map(|c| {
                if (c as u8 as char).is_ascii_lowercase() {
                    c - 0x20
                } else {
                    c
                }
            })
            .collect();
        UpcaseTable { map }
    }

    /// Serializes the table in raw (uncompressed) form.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.map.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    pub fn upcase(&self, c: u16) -> u16 {
        self.map.get(c as usize).copied().unwrap_or(c)
    }

    /// Case-insensitive equality of two UTF-16 names.
    pub fn eq_fold(&self, a: &[u16], b: &[u16]) -> bool {
        a.len() == b.len()
            && a.iter()
                .zip(b)
                .all(|(&x, &y)| self.upcase(x) == self.upcase(y))
    }

    /// The 16-bit hash of the up-cased name stored in stream extension
    /// entries; a mismatch proves two names differ without comparing them.
    pub fn name_hash(&self, name: &[u16]) -> u16 {
        let mut hash: u16 = 0;
        for &unit in name {
            for byte in self.upcase(unit).to_le_bytes() {
                hash = hash.rotate_right(1).wrapping_add(byte as u16);
            }
        }
        hash
    }
}

/// Checksum over the serialized table, stored in the upcase directory
/// entry.
pub fn table_checksum(data: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    for &byte in data {
        sum = sum.rotate_right(1).wrapping_add(byte as u32);
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16(s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }

    #[test]
    fn ascii_folding() {
        let table = UpcaseTable::ascii();
        assert_eq!(table.upcase(b'a' as u16), b'A' as u16);
        assert_eq!(table.upcase(b'Z' as u16), b'Z' as u16);
        assert_eq!(table.upcase(b'7' as u16), b'7' as u16);
        // beyond the table everything maps to itself
        assert_eq!(table.upcase(0x00E9), 0x00E9);
        assert!(table.eq_fold(&utf16("Hello.TXT"), &utf16("hello.txt")));
        assert!(!table.eq_fold(&utf16("hello"), &utf16("hellp")));
        assert!(!table.eq_fold(&utf16("hello"), &utf16("hell")));
    }

    #[test]
    fn serialization_round_trips() {
        let table = UpcaseTable::ascii();
        let bytes = table.to_bytes();
        let back = UpcaseTable::from_bytes(&bytes).unwrap();
        for c in 0..256u16 {
            assert_eq!(table.upcase(c), back.upcase(c));
        }
    }

    #[test]
    fn compressed_identity_runs_decode() {
        // identity for the first 0x61 code points, then 'a'..'c' -> 'A'..'C'
        let mut data: Vec<u8> = Vec::new();
        for v in [IDENTITY_RUN, 0x61] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        for v in [0x41u16, 0x42, 0x43] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        let table = UpcaseTable::from_bytes(&data).unwrap();
        assert_eq!(table.upcase(0x30), 0x30);
        assert_eq!(table.upcase(0x61), 0x41);
        assert_eq!(table.upcase(0x63), 0x43);
        assert_eq!(table.upcase(0x64), 0x64);
    }

    #[test]
    fn name_hash_is_case_insensitive_and_discriminating() {
        let table = UpcaseTable::ascii();
        assert_eq!(
            table.name_hash(&utf16("readme.md")),
            table.name_hash(&utf16("README.MD"))
        );
        assert_ne!(
            table.name_hash(&utf16("readme.md")),
            table.name_hash(&utf16("readme.me"))
        );
    }
}
