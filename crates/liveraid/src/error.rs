use std::io;

use liveraid_codec::CodecError;

/// Errors surfaced by the storage engine.
///
/// The external filesystem layer maps these onto errno values through
/// [`Error::errno`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no entry for virtual path {0}")]
    NotFound(String),

    #[error("directory {0} is not empty")]
    NotEmpty(String),

    #[error("{0} already exists")]
    Exists(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{failed} drives failed but only {parity} parity levels are configured")]
    TooManyFailures { failed: usize, parity: usize },

    #[error("parity position namespace exhausted")]
    NamespaceExhausted,

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("out of memory")]
    OutOfMemory,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<CodecError> for Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::TooManyFailures { failed, parity } => {
                Error::TooManyFailures { failed, parity }
            }
            other => Error::Invalid(other.to_string()),
        }
    }
}

impl Error {
    /// errno value for the external filesystem shim.
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::NotEmpty(_) => libc::ENOTEMPTY,
            Error::Exists(_) => libc::EEXIST,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::TooManyFailures { .. } => libc::EIO,
            Error::NamespaceExhausted => libc::ENOSPC,
            Error::Invalid(_) => libc::EINVAL,
            Error::OutOfMemory => libc::ENOMEM,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::NotFound("/a".into()).errno(), libc::ENOENT);
        assert_eq!(Error::NamespaceExhausted.errno(), libc::ENOSPC);
        assert_eq!(
            Error::TooManyFailures { failed: 3, parity: 2 }.errno(),
            libc::EIO
        );
        let io = Error::Io(io::Error::from_raw_os_error(libc::EROFS));
        assert_eq!(io.errno(), libc::EROFS);
    }
}
