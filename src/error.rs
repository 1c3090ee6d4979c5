use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("key not found in index")]
    NotFound,
    #[error("key already exists in index")]
    DuplicateKey,
    #[error("not enough space on the volume or in the metadata record")]
    OutOfSpace,
    #[error("could not allocate memory for index scratch data")]
    OutOfMemory,
    #[error("index is corrupt: {0}")]
    CorruptIndex(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("index entry of {size} bytes exceeds the maximum of {max} bytes")]
    EntryTooLarge { size: usize, max: usize },
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("index was marked unusable after a fatal error, run a consistency check")]
    IndexUnusable,
    #[error(transparent)]
    IntConversion(#[from] std::num::TryFromIntError),
    #[error(transparent)]
    SliceConversion(#[from] std::array::TryFromSliceError),
}

impl Error {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Error {
        Error::CorruptIndex(msg.into())
    }

    /// Errors after which the on-disk metadata can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::CorruptIndex(_) | Error::IoError(_) | Error::IO(_)
        )
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Error::OutOfMemory
    }
}
