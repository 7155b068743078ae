use thiserror::Error;

pub type Result<T> = std::result::Result<T, P2PError>;

#[derive(Error, Debug)]
pub enum P2PError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed by remote end")]
    ConnectionClosed,

    #[error("Handshake failed: {0}")]
    HandshakeFailure(String),

    #[error("Crypto error: {0}")]
    CryptoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Username already taken: {0}")]
    UsernameTaken(String),

    #[error("Invalid username: {0}")]
    InvalidUsername(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Relay target not registered: {0}")]
    RelayTargetUnavailable(String),

    #[error("A download is already in progress")]
    TransferAlreadyInProgress,

    #[error("Transfer key mismatch: {0}")]
    TransferKeyMismatch(String),

    #[error("Transfer failed: {0}")]
    TransferIOError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl P2PError {
    /// Whether the error only means the other side went away.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, P2PError::ConnectionClosed)
    }
}

impl From<std::io::Error> for P2PError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => P2PError::ConnectionClosed,
            _ => P2PError::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for P2PError {
    fn from(err: serde_json::Error) -> Self {
        P2PError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eof_maps_to_connection_closed() {
        let err: P2PError = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(err.is_disconnect());

        let err: P2PError = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no").into();
        assert!(matches!(err, P2PError::IoError(_)));
    }
}
