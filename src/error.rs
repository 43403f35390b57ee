/// Errors surfaced by the sector device layer.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("sector range out of bounds")]
    OutOfBounds,
    #[error("device is write protected")]
    WriteProtected,
    #[error("device I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the filesystem engine.
///
/// Each variant maps one-to-one onto an error the host adapter understands:
/// `Device` and `Corrupt` both surface as an I/O error to the host (`Corrupt`
/// is logged separately at error severity), the rest map onto the obvious
/// POSIX-style codes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Device(#[from] DeviceError),
    #[error("corrupt volume: {0}")]
    Corrupt(String),
    #[error("not found")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("already exists")]
    AlreadyExists,
    #[error("invalid name: {0}")]
    InvalidName(&'static str),
    #[error("no space left on volume")]
    NoSpace,
    #[error("read-only filesystem")]
    ReadOnly,
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl Error {
    /// On-disk invariant violation; logged at error severity before being
    /// handed to the caller.
    pub(crate) fn corrupt(what: impl Into<String>) -> Error {
        let what = what.into();
        log::error!("exfat: corrupt volume: {what}");
        Error::Corrupt(what)
    }
}
