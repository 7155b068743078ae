use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::utils::{P2PError, Result};

pub const KEY_LENGTH: usize = 10;
const KEY_ALPHABET: &[u8] = b"0123456789ABCDEF";

/// Longest key a transfer header may announce.
pub const MAX_KEY_LEN: usize = 256;

/// Fresh one-time token authorizing a single inbound transfer.
pub fn generate_transfer_key() -> String {
    let mut rng = rand::thread_rng();
    (0..KEY_LENGTH)
        .map(|_| KEY_ALPHABET[rng.gen_range(0..KEY_ALPHABET.len())] as char)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    Idle,
    KeyGenerated,
    ListeningForMatch,
    Receiving,
    Complete,
}

/// The single download a peer may have outstanding.
#[derive(Debug, Clone)]
pub struct TransferSession {
    key: String,
    file_name: String,
    state: TransferState,
    expected_size: Option<u64>,
    bytes_transferred: u64,
}

impl TransferSession {
    pub fn new(file_name: &str) -> Self {
        Self {
            key: generate_transfer_key(),
            file_name: file_name.to_string(),
            state: TransferState::KeyGenerated,
            expected_size: None,
            bytes_transferred: 0,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn expected_size(&self) -> Option<u64> {
        self.expected_size
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    /// Waiting for the uploader to dial in, with the key not yet used.
    pub fn is_live(&self) -> bool {
        matches!(
            self.state,
            TransferState::KeyGenerated | TransferState::ListeningForMatch
        )
    }

    pub fn is_finished(&self) -> bool {
        self.state == TransferState::Complete
    }

    /// The request carrying the key has gone out.
    pub fn mark_listening(&mut self) {
        if self.state == TransferState::KeyGenerated {
            self.state = TransferState::ListeningForMatch;
        }
    }

    /// Matches a presented key and, on success, consumes it so no later
    /// connection can reuse it.
    pub fn try_claim(&mut self, presented: &str, file_size: u64) -> bool {
        if !self.is_live() || self.key.is_empty() || presented != self.key {
            return false;
        }
        self.key.clear();
        self.state = TransferState::Receiving;
        self.expected_size = Some(file_size);
        self.bytes_transferred = 0;
        true
    }

    pub fn record_progress(&mut self, bytes_so_far: u64) {
        self.bytes_transferred = bytes_so_far;
    }

    pub fn complete(&mut self) {
        self.state = TransferState::Complete;
    }
}

/// Sent once by the uploader before the raw file bytes: the size as a
/// big-endian `u64`, then the key as a big-endian `u16` length and UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferHeader {
    pub file_size: u64,
    pub key: String,
}

impl TransferHeader {
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let key = self.key.as_bytes();
        if key.len() > MAX_KEY_LEN {
            return Err(P2PError::InvalidInput(format!(
                "transfer key is {} bytes, limit is {}",
                key.len(),
                MAX_KEY_LEN
            )));
        }

        writer.write_u64(self.file_size).await?;
        writer.write_u16(key.len() as u16).await?;
        writer.write_all(key).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let file_size = reader.read_u64().await?;
        let key_len = reader.read_u16().await? as usize;
        if key_len > MAX_KEY_LEN {
            return Err(P2PError::InvalidMessage(format!(
                "transfer key of {} bytes",
                key_len
            )));
        }

        let mut key = vec![0u8; key_len];
        reader.read_exact(&mut key).await?;
        let key = String::from_utf8(key)
            .map_err(|_| P2PError::InvalidMessage("transfer key is not UTF-8".to_string()))?;

        Ok(Self { file_size, key })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shape() {
        let key = generate_transfer_key();
        assert_eq!(key.len(), KEY_LENGTH);
        assert!(key.bytes().all(|b| KEY_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_key_is_single_use() {
        let mut session = TransferSession::new("a.txt");
        let key = session.key().to_string();
        session.mark_listening();
        assert_eq!(session.state(), TransferState::ListeningForMatch);

        assert!(!session.try_claim("WRONGKEY00", 10));
        assert_eq!(session.state(), TransferState::ListeningForMatch);

        assert!(session.try_claim(&key, 10));
        assert_eq!(session.state(), TransferState::Receiving);
        assert_eq!(session.expected_size(), Some(10));
        assert!(!session.try_claim(&key, 10));
    }

    #[test]
    fn test_empty_key_never_matches() {
        let mut session = TransferSession::new("a.txt");
        let key = session.key().to_string();
        assert!(session.try_claim(&key, 0));
        session.complete();
        assert!(!session.try_claim("", 0));
        assert!(session.is_finished());
    }

    #[tokio::test]
    async fn test_header_layout() {
        let header = TransferHeader {
            file_size: 1_000_000,
            key: "0A1B2C3D4E".to_string(),
        };
        let mut bytes = Vec::new();
        header.write_to(&mut bytes).await.unwrap();

        assert_eq!(&bytes[..8], &1_000_000u64.to_be_bytes());
        assert_eq!(&bytes[8..10], &10u16.to_be_bytes());
        assert_eq!(&bytes[10..], b"0A1B2C3D4E");

        let decoded = TransferHeader::read_from(&mut bytes.as_slice()).await.unwrap();
        assert_eq!(decoded, header);
    }

    #[tokio::test]
    async fn test_header_with_oversized_key_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&5u64.to_be_bytes());
        bytes.extend_from_slice(&1000u16.to_be_bytes());
        bytes.extend(std::iter::repeat(b'A').take(1000));

        let result = TransferHeader::read_from(&mut bytes.as_slice()).await;
        assert!(matches!(result, Err(P2PError::InvalidMessage(_))));
    }
}
