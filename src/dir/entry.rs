// http://ntfs.com/exfat-directory-structure.htm

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable, bytes_of, pod_read_unaligned};

use crate::Result;
use crate::error::Error;
use crate::timestamp::{Timestamp, Timestamps};
use crate::upcase::UpcaseTable;

pub const ENTRY_SIZE: usize = 32;
/// UTF-16 code units per file name entry.
pub const NAME_CHARS_PER_ENTRY: usize = 15;
/// Longest file name, in UTF-16 code units.
pub const MAX_NAME_LENGTH: usize = 255;

pub(crate) const TYPE_BITMAP: u8 = 0x81;
pub(crate) const TYPE_UPCASE: u8 = 0x82;
pub(crate) const TYPE_LABEL: u8 = 0x83;
pub(crate) const TYPE_FILE: u8 = 0x85;
pub(crate) const TYPE_GUID: u8 = 0xA0;
pub(crate) const TYPE_STREAM: u8 = 0xC0;
pub(crate) const TYPE_NAME: u8 = 0xC1;

/// High bit of the type byte; clear means the entry is unused.
pub(crate) const ENTRY_IN_USE: u8 = 0x80;

bitflags! {
    /// File attributes stored in the file directory entry.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct FileAttributes: u16 {
        const READ_ONLY = 0x0001;
        const HIDDEN    = 0x0002;
        const SYSTEM    = 0x0004;
        const DIRECTORY = 0x0010;
        const ARCHIVE   = 0x0020;
    }
}

/// General secondary flags: bit 0 = allocation possible, bit 1 = no FAT
/// chain (the allocation is contiguous and the FAT is not consulted).
pub(crate) const SECONDARY_ALLOCATION_POSSIBLE: u8 = 0x01;
pub(crate) const SECONDARY_NO_FAT_CHAIN: u8 = 0x02;

// critical primary directory entry types:
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub(crate) struct BitmapEntry {
    pub(crate) entry_type: u8,
    pub(crate) flags: u8,
    pub(crate) _reserved: [u8; 18],
    pub(crate) first_cluster: u32,
    pub(crate) data_len: u64,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub(crate) struct UpcaseEntry {
    pub(crate) entry_type: u8,
    pub(crate) _reserved1: [u8; 3],
    pub(crate) table_checksum: u32,
    pub(crate) _reserved2: [u8; 12],
    pub(crate) first_cluster: u32,
    pub(crate) data_len: u64,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub(crate) struct LabelEntry {
    pub(crate) entry_type: u8,
    pub(crate) character_count: u8,
    pub(crate) volume_label: [u8; 22],
    pub(crate) _reserved: [u8; 8],
}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub(crate) struct FileEntry {
    pub(crate) entry_type: u8,
    pub(crate) secondary_count: u8,
    pub(crate) set_checksum: u16,
    pub(crate) file_attributes: u16,
    pub(crate) _reserved1: u16,
    pub(crate) create_timestamp: u32,
    pub(crate) last_modified_timestamp: u32,
    pub(crate) last_accessed_timestamp: u32,
    pub(crate) create_10ms_increment: u8,
    pub(crate) last_modified_10ms_increment: u8,
    pub(crate) create_utc_offset: u8,
    pub(crate) last_modified_utc_offset: u8,
    pub(crate) last_accessed_utc_offset: u8,
    pub(crate) _reserved2: [u8; 7],
}

// benign primary:
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub(crate) struct GuidEntry {
    pub(crate) entry_type: u8,
    pub(crate) secondary_count: u8,
    pub(crate) set_checksum: u16,
    pub(crate) general_primary_flags: u16,
    pub(crate) volume_guid: [u8; 16],
    pub(crate) _reserved: [u8; 10],
}

// critical secondary:
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub(crate) struct StreamEntry {
    pub(crate) entry_type: u8,
    pub(crate) general_secondary_flags: u8,
    pub(crate) _reserved1: u8,
    /// Length of the unicode file name, in code units.
    pub(crate) name_length: u8,
    pub(crate) name_hash: u16,
    pub(crate) _reserved2: u16,
    pub(crate) valid_data_length: u64,
    pub(crate) _reserved3: u32,
    pub(crate) first_cluster: u32,
    pub(crate) data_len: u64,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub(crate) struct NameEntry {
    pub(crate) entry_type: u8,
    pub(crate) general_secondary_flags: u8,
    pub(crate) file_name: [u8; 30],
}

/// One 32-byte directory entry, discriminated by its type byte.
#[derive(Copy, Clone, Debug)]
pub(crate) enum DirEntry {
    /// Type 0: this and every following entry is unused.
    EndOfDirectory,
    /// Types 1..=0x7F: a deleted or never-used slot.
    Unused(u8),
    Bitmap(BitmapEntry),
    Upcase(UpcaseEntry),
    Label(LabelEntry),
    File(FileEntry),
    Guid(GuidEntry),
    Stream(StreamEntry),
    Name(NameEntry),
    /// An in-use entry of a type this implementation does not interpret.
    Unrecognized(u8),
}

impl DirEntry {
    pub(crate) fn parse(raw: &[u8; ENTRY_SIZE]) -> DirEntry {
        match raw[0] {
            0x00 => DirEntry::EndOfDirectory,
            t @ 0x01..=0x7F => DirEntry::Unused(t),
            TYPE_BITMAP => DirEntry::Bitmap(pod_read_unaligned(raw)),
            TYPE_UPCASE => DirEntry::Upcase(pod_read_unaligned(raw)),
            TYPE_LABEL => DirEntry::Label(pod_read_unaligned(raw)),
            TYPE_FILE => DirEntry::File(pod_read_unaligned(raw)),
            TYPE_GUID => DirEntry::Guid(pod_read_unaligned(raw)),
            TYPE_STREAM => DirEntry::Stream(pod_read_unaligned(raw)),
            TYPE_NAME => DirEntry::Name(pod_read_unaligned(raw)),
            t => DirEntry::Unrecognized(t),
        }
    }
}

/// Checksum over all bytes of a directory entry group; bytes 2 and 3 of the
/// primary entry (the stored checksum itself) are skipped.
pub(crate) fn set_checksum(group: &[u8]) -> u16 {
    let mut sum: u16 = 0;
    for (i, &byte) in group.iter().enumerate() {
        if i == 2 || i == 3 {
            continue;
        }
        sum = sum.rotate_right(1).wrapping_add(byte as u16);
    }
    sum
}

/// A validated exFAT file name (1..=255 UTF-16 code units, no reserved
/// characters).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExfatName(Vec<u16>);

impl ExfatName {
    pub fn new(name: &str) -> Result<ExfatName> {
        if name == "." || name == ".." {
            return Err(Error::InvalidName("'.' and '..' cannot be created"));
        }
        Self::from_units(name.encode_utf16().collect())
    }

    /// Builds a name without the reserved-character/`.`/`..` checks that
    /// apply to user-supplied names. Used only for internal sentinel
    /// names (e.g. the root directory's synthetic `/`) that never round-trip
    /// through on-disk entries.
    pub(crate) fn raw(units: Vec<u16>) -> ExfatName {
        ExfatName(units)
    }

    pub(crate) fn from_units(units: Vec<u16>) -> Result<ExfatName> {
        if units.is_empty() {
            return Err(Error::InvalidName("empty name"));
        }
        if units.len() > MAX_NAME_LENGTH {
            return Err(Error::InvalidName("name exceeds 255 code units"));
        }
        for &unit in &units {
            if unit < 0x20 {
                return Err(Error::InvalidName("control character in name"));
            }
            if matches!(
                unit,
                0x22 | 0x2A | 0x2F | 0x3A | 0x3C | 0x3E | 0x3F | 0x5C | 0x7C
            ) {
                return Err(Error::InvalidName("reserved character in name"));
            }
        }
        Ok(ExfatName(units))
    }

    pub fn as_units(&self) -> &[u16] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// File name entries needed to store this name.
    pub(crate) fn entry_count(&self) -> usize {
        self.0.len().div_ceil(NAME_CHARS_PER_ENTRY)
    }
}

impl std::fmt::Display for ExfatName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf16_lossy(&self.0))
    }
}

/// The decoded contents of one directory entry group (file + stream
/// extension + file names).
#[derive(Clone, Debug)]
pub(crate) struct EntrySet {
    pub(crate) attributes: FileAttributes,
    pub(crate) timestamps: Timestamps,
    pub(crate) contiguous: bool,
    pub(crate) first_cluster: u32,
    pub(crate) size: u64,
    pub(crate) valid_size: u64,
    pub(crate) name: ExfatName,
}

impl EntrySet {
    /// Entries in the encoded group, primary included.
    pub(crate) fn entry_count(&self) -> usize {
        2 + self.name.entry_count()
    }

    /// Secondary entries following the file entry.
    pub(crate) fn continuations(&self) -> u8 {
        (1 + self.name.entry_count()) as u8
    }

    /// Decodes a group. `raw` holds the primary entry followed by its
    /// `secondary_count` continuation entries, exactly as read from the
    /// directory. The stored checksum must match the recomputed one.
    pub(crate) fn parse(raw: &[[u8; ENTRY_SIZE]]) -> Result<EntrySet> {
        let DirEntry::File(file) = DirEntry::parse(&raw[0]) else {
            return Err(Error::corrupt("entry group does not start with a file entry"));
        };
        let secondary_count = file.secondary_count as usize;
        if raw.len() != 1 + secondary_count {
            return Err(Error::corrupt("entry group truncated"));
        }
        if !(2..=18).contains(&secondary_count) {
            return Err(Error::corrupt(format!(
                "file entry with {secondary_count} secondaries"
            )));
        }

        let mut flat = Vec::with_capacity(raw.len() * ENTRY_SIZE);
        for entry in raw {
            flat.extend_from_slice(entry);
        }
        let stored = u16::from_le({ file.set_checksum });
        let computed = set_checksum(&flat);
        if stored != computed {
            return Err(Error::corrupt(format!(
                "entry group checksum {computed:#06x} does not match stored {stored:#06x}"
            )));
        }

        let DirEntry::Stream(stream) = DirEntry::parse(&raw[1]) else {
            return Err(Error::corrupt("file entry not followed by a stream extension"));
        };
        let name_length = stream.name_length as usize;
        if name_length == 0 || name_length > MAX_NAME_LENGTH {
            return Err(Error::corrupt("bad name length in stream extension"));
        }
        if secondary_count - 1 != name_length.div_ceil(NAME_CHARS_PER_ENTRY) {
            return Err(Error::corrupt("wrong number of file name entries"));
        }

        let mut units = Vec::with_capacity(name_length);
        for entry in &raw[2..] {
            let DirEntry::Name(name_entry) = DirEntry::parse(entry) else {
                return Err(Error::corrupt("missing file name entry"));
            };
            let file_name = { name_entry.file_name };
            for pair in file_name.chunks_exact(2) {
                if units.len() < name_length {
                    units.push(u16::from_le_bytes([pair[0], pair[1]]));
                }
            }
        }
        let name = ExfatName::from_units(units)
            .map_err(|_| Error::corrupt("reserved characters in stored name"))?;

        let attributes = FileAttributes::from_bits_truncate(u16::from_le({ file.file_attributes }));
        let timestamps = Timestamps {
            created: Timestamp::from_raw(
                u32::from_le({ file.create_timestamp }),
                file.create_10ms_increment,
                file.create_utc_offset,
            ),
            modified: Timestamp::from_raw(
                u32::from_le({ file.last_modified_timestamp }),
                file.last_modified_10ms_increment,
                file.last_modified_utc_offset,
            ),
            accessed: Timestamp::from_raw(
                u32::from_le({ file.last_accessed_timestamp }),
                0,
                file.last_accessed_utc_offset,
            ),
        };

        let size = u64::from_le({ stream.data_len });
        let valid_size = u64::from_le({ stream.valid_data_length });
        if valid_size > size {
            return Err(Error::corrupt("valid data length exceeds data length"));
        }

        Ok(EntrySet {
            attributes,
            timestamps,
            contiguous: stream.general_secondary_flags & SECONDARY_NO_FAT_CHAIN != 0,
            first_cluster: u32::from_le({ stream.first_cluster }),
            size,
            valid_size,
            name,
        })
    }

    /// Encodes the group, checksum included, ready to be written over
    /// `entry_count() * 32` bytes of a directory.
    pub(crate) fn encode(&self, upcase: &UpcaseTable) -> Vec<u8> {
        let file = FileEntry {
            entry_type: TYPE_FILE,
            secondary_count: self.continuations(),
            set_checksum: 0,
            file_attributes: self.attributes.bits().to_le(),
            _reserved1: 0,
            create_timestamp: self.timestamps.created.dos.to_le(),
            last_modified_timestamp: self.timestamps.modified.dos.to_le(),
            last_accessed_timestamp: self.timestamps.accessed.dos.to_le(),
            create_10ms_increment: self.timestamps.created.cs,
            last_modified_10ms_increment: self.timestamps.modified.cs,
            create_utc_offset: self.timestamps.created.utc_offset,
            last_modified_utc_offset: self.timestamps.modified.utc_offset,
            last_accessed_utc_offset: self.timestamps.accessed.utc_offset,
            _reserved2: [0; 7],
        };
        let mut flags = SECONDARY_ALLOCATION_POSSIBLE;
        if self.contiguous {
            flags |= SECONDARY_NO_FAT_CHAIN;
        }
        let stream = StreamEntry {
            entry_type: TYPE_STREAM,
            general_secondary_flags: flags,
            _reserved1: 0,
            name_length: self.name.len() as u8,
            name_hash: upcase.name_hash(self.name.as_units()).to_le(),
            _reserved2: 0,
            valid_data_length: self.valid_size.to_le(),
            _reserved3: 0,
            first_cluster: self.first_cluster.to_le(),
            data_len: self.size.to_le(),
        };

        let mut group = Vec::with_capacity(self.entry_count() * ENTRY_SIZE);
        group.extend_from_slice(bytes_of(&file));
        group.extend_from_slice(bytes_of(&stream));
        for chunk in self.name.as_units().chunks(NAME_CHARS_PER_ENTRY) {
            let mut file_name = [0u8; 30];
            for (i, unit) in chunk.iter().enumerate() {
                file_name[i * 2..i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
            }
            let name_entry = NameEntry {
                entry_type: TYPE_NAME,
                general_secondary_flags: 0,
                file_name,
            };
            group.extend_from_slice(bytes_of(&name_entry));
        }

        let checksum = set_checksum(&group);
        group[2..4].copy_from_slice(&checksum.to_le_bytes());
        group
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_set(name: &str) -> EntrySet {
        EntrySet {
            attributes: FileAttributes::ARCHIVE,
            timestamps: Timestamps::all(Timestamp::from_unix(1_700_000_000)),
            contiguous: true,
            first_cluster: 17,
            size: 4096,
            valid_size: 4096,
            name: ExfatName::new(name).unwrap(),
        }
    }

    fn split(group: &[u8]) -> Vec<[u8; ENTRY_SIZE]> {
        group
            .chunks_exact(ENTRY_SIZE)
            .map(|c| c.try_into().unwrap())
            .collect()
    }

    #[test]
    fn encode_parse_round_trip() {
        let upcase = UpcaseTable::ascii();
        let set = sample_set("Notes about Rust.md");
        let group = set.encode(&upcase);
        assert_eq!(group.len(), set.entry_count() * ENTRY_SIZE);

        let back = EntrySet::parse(&split(&group)).unwrap();
        assert_eq!(back.name, set.name);
        assert_eq!(back.first_cluster, 17);
        assert_eq!(back.size, 4096);
        assert!(back.contiguous);
        assert_eq!(back.attributes, FileAttributes::ARCHIVE);
        assert_eq!(
            back.timestamps.modified.to_unix(),
            set.timestamps.modified.to_unix()
        );
    }

    #[test]
    fn long_names_span_multiple_entries() {
        let upcase = UpcaseTable::ascii();
        let name: String = std::iter::repeat('x').take(47).collect();
        let set = sample_set(&name);
        // 47 code units => 4 name entries => 6 entries total
        assert_eq!(set.entry_count(), 6);
        let back = EntrySet::parse(&split(&set.encode(&upcase))).unwrap();
        assert_eq!(back.name.to_string(), name);
    }

    #[test]
    fn flipped_bit_fails_the_group_checksum() {
        let upcase = UpcaseTable::ascii();
        let mut group = sample_set("a.txt").encode(&upcase);
        group[40] ^= 1;
        assert!(matches!(
            EntrySet::parse(&split(&group)),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn name_validation() {
        assert!(ExfatName::new("ok name.txt").is_ok());
        assert!(ExfatName::new("").is_err());
        assert!(ExfatName::new(".").is_err());
        assert!(ExfatName::new("..").is_err());
        assert!(ExfatName::new("a/b").is_err());
        assert!(ExfatName::new("tab\there").is_err());
        assert!(ExfatName::new("what?").is_err());
        let long: String = std::iter::repeat('y').take(256).collect();
        assert!(ExfatName::new(&long).is_err());
        let just_fits: String = std::iter::repeat('y').take(255).collect();
        assert!(ExfatName::new(&just_fits).is_ok());
    }
}
