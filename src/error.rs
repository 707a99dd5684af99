use thiserror::Error;

/// Errors surfaced to file-system callers.
///
/// Lower layers collapse driver and ECC failures into [`Error::Io`]; path
/// resolution and name rules produce the rest. The numeric projection in
/// [`Error::errno`] mirrors the classic error codes for callers that keep an
/// errno around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    #[error("access denied")]
    Access,
    #[error("object already exists")]
    Exist,
    #[error("invalid argument")]
    Inval,
    #[error("too many open objects")]
    TooManyHandles,
    #[error("no such object")]
    NotFound,
    #[error("can't update object time")]
    Time,
    #[error("bad object handle")]
    BadHandle,
    #[error("out of space or serial numbers")]
    NoMem,
    #[error("flash I/O error")]
    Io,
    #[error("directory not empty")]
    NotEmpty,
}

impl Error {
    /// Legacy numeric code, negative in the process-wide mirror.
    pub fn errno(self) -> i32 {
        match self {
            Error::Access => 1,
            Error::Exist => 2,
            Error::Inval => 3,
            Error::TooManyHandles => 4,
            Error::NotFound => 5,
            Error::Time => 6,
            Error::BadHandle => 9,
            Error::NoMem => 10,
            Error::Io => 11,
            Error::NotEmpty => 12,
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
