use std::io;

/// Error returned by node and cluster operations.
///
/// Per-node errors are *values*: fan-outs store them in the aggregate map
/// instead of failing the whole operation.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Connect or DNS failure.
    #[error("node unreachable: {0}")]
    Unreachable(String),
    /// Read or connect deadline exceeded.
    #[error("operation timed out")]
    Timeout,
    /// Codec or parse failure, unexpected reply shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    /// The server recognized the command but replied empty or `error`.
    #[error("command `{0}` unsupported by server")]
    CommandUnsupported(String),
    /// Deadline or caller cancellation.
    #[error("operation cancelled")]
    Cancelled,
    /// Malformed credentials file or command-line argument.
    #[error("config: {0}")]
    Config(String),
}

impl Error {
    /// Check if the error is due to not being able to reach the node.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }

    /// Classify an OS error into the taxonomy.
    pub(crate) fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Unreachable(err.to_string()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_io_classification() {
        let timeout = io::Error::from(io::ErrorKind::TimedOut);
        assert!(matches!(Error::from_io(timeout), Error::Timeout));

        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(Error::from_io(refused).is_unreachable());
    }
}
