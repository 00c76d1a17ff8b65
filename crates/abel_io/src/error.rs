// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use thiserror::Error;

/// A specialized `Result` for use with the write-side I/O operations of this
/// crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error arising from the vectored write path.
///
/// Transient conditions are represented too: a `writev` that cannot make
/// progress right now surfaces as [`Error::StdIo`] with
/// [`std::io::ErrorKind::WouldBlock`], and the caller re-arms its readiness
/// wait. Anything else is permanent and the caller is expected to close the
/// stream.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The remote side closed the connection (`writev` accepted zero bytes).
    #[error("connection closed by peer")]
    Closed,

    /// We are forwarding an error received from the standard library's I/O
    /// APIs without adding further detail in this layer.
    #[error(transparent)]
    StdIo(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    #[test]
    fn thread_safe_type() {
        assert_impl_all!(Error: Send, Sync);
    }

    #[test]
    fn std_io_errors_convert() {
        let e: Error = std::io::Error::from(std::io::ErrorKind::WouldBlock).into();

        assert!(matches!(e, Error::StdIo(inner) if inner.kind() == std::io::ErrorKind::WouldBlock));
    }
}
