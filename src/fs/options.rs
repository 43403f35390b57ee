use std::str::FromStr;

use crate::Result;
use crate::dir::entry::FileAttributes;
use crate::error::Error;

/// Parsed mount options. Options the engine does not interpret are kept in
/// `passthrough` for the host shim.
#[derive(Clone, Debug, Default)]
pub struct MountOptions {
    /// Mount read-only.
    pub read_only: bool,
    /// Downgrade to read-only instead of failing when the device is write
    /// protected or the volume is marked dirty.
    pub ro_fallback: bool,
    /// Do not update access times on reads.
    pub noatime: bool,
    pub uid: u32,
    pub gid: u32,
    /// Permission bits removed from files in `getattr`.
    pub fmask: u16,
    /// Permission bits removed from directories in `getattr`.
    pub dmask: u16,
    /// Unrecognized options, forwarded verbatim.
    pub passthrough: Vec<String>,
}

impl MountOptions {
    /// Parses the comma-separated option vocabulary
    /// (`ro,noatime,umask=022,uid=1000,...`).
    pub fn parse(input: &str) -> Result<MountOptions> {
        let mut options = MountOptions::default();
        for item in input.split(',').filter(|i| !i.is_empty()) {
            let (key, value) = match item.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (item, None),
            };
            match key {
                "ro" => options.read_only = true,
                "rw" => options.read_only = false,
                "ro_fallback" => options.ro_fallback = true,
                "noatime" => options.noatime = true,
                "uid" => options.uid = parse_decimal(value)?,
                "gid" => options.gid = parse_decimal(value)?,
                "umask" => {
                    let mask = parse_octal(value)?;
                    options.fmask = mask;
                    options.dmask = mask;
                }
                "fmask" => options.fmask = parse_octal(value)?,
                "dmask" => options.dmask = parse_octal(value)?,
                _ => options.passthrough.push(item.to_string()),
            }
        }
        Ok(options)
    }

    /// Permission bits exposed through `getattr`, after masking.
    pub fn mode_for(&self, attributes: FileAttributes) -> u16 {
        let directory = attributes.contains(FileAttributes::DIRECTORY);
        let mut mode = if directory {
            0o777 & !self.dmask
        } else {
            0o777 & !self.fmask
        };
        if attributes.contains(FileAttributes::READ_ONLY) && !directory {
            mode &= !0o222;
        }
        mode
    }
}

impl FromStr for MountOptions {
    type Err = Error;

    fn from_str(s: &str) -> Result<MountOptions> {
        MountOptions::parse(s)
    }
}

fn parse_decimal(value: Option<&str>) -> Result<u32> {
    value
        .and_then(|v| v.parse().ok())
        .ok_or(Error::InvalidArgument("expected a decimal value"))
}

fn parse_octal(value: Option<&str>) -> Result<u16> {
    value
        .and_then(|v| u16::from_str_radix(v, 8).ok())
        .filter(|m| *m <= 0o777)
        .ok_or(Error::InvalidArgument("expected an octal mask"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocabulary_round_trip() {
        let options =
            MountOptions::parse("ro,noatime,uid=1000,gid=100,umask=022,fsname=exfat,big_writes")
                .unwrap();
        assert!(options.read_only);
        assert!(options.noatime);
        assert!(!options.ro_fallback);
        assert_eq!(options.uid, 1000);
        assert_eq!(options.gid, 100);
        assert_eq!(options.fmask, 0o022);
        assert_eq!(options.dmask, 0o022);
        assert_eq!(options.passthrough, vec!["fsname=exfat", "big_writes"]);
    }

    #[test]
    fn masks_can_differ() {
        let options = MountOptions::parse("fmask=137,dmask=027").unwrap();
        assert_eq!(options.fmask, 0o137);
        assert_eq!(options.dmask, 0o027);
        assert_eq!(options.mode_for(FileAttributes::ARCHIVE), 0o640);
        assert_eq!(options.mode_for(FileAttributes::DIRECTORY), 0o750);
    }

    #[test]
    fn read_only_attribute_drops_write_bits() {
        let options = MountOptions::default();
        assert_eq!(
            options.mode_for(FileAttributes::ARCHIVE | FileAttributes::READ_ONLY),
            0o555
        );
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(MountOptions::parse("uid=alice").is_err());
        assert!(MountOptions::parse("umask=999").is_err());
        assert!(MountOptions::parse("umask=").is_err());
    }

    #[test]
    fn empty_string_is_defaults() {
        let options: MountOptions = "".parse().unwrap();
        assert!(!options.read_only);
        assert!(options.passthrough.is_empty());
    }
}
