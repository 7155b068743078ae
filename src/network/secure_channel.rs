//! Encrypted, framed message channel between a peer and the directory server.
//!
//! Handshake, in order, on a fresh TCP connection:
//! 1. both sides send their X25519 public key as an unencrypted frame
//! 2. the initiator seals a random session key to the responder's public key
//! 3. both sides derive one ChaCha20-Poly1305 key per direction
//!
//! After that every frame carries exactly one encrypted application message.

use log::debug;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use x25519_dalek::PublicKey;
use zeroize::Zeroize;

use crate::network::transport::{MAX_FRAME_SIZE, Transport};
use crate::utils::crypto::{
    self, KEY_SIZE, KeyPair, MAX_SEALED_PLAINTEXT, PUBLIC_KEY_SIZE, SessionCipher, TAG_SIZE,
};
use crate::utils::{P2PError, Result};

/// Which end of the handshake this side plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dials out and picks the session key (peers).
    Initiator,
    /// Accepts the connection (directory server).
    Responder,
}

pub struct SecureChannel {
    sender: SecureSender,
    receiver: SecureReceiver,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    remote_public: PublicKey,
}

impl SecureChannel {
    /// Dials `addr` and runs the handshake as [`Role::Initiator`].
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = Transport::connect(addr).await?;
        Self::handshake(stream, Role::Initiator).await
    }

    pub async fn handshake(stream: TcpStream, role: Role) -> Result<Self> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (mut reader, mut writer) = stream.into_split();

        let keypair = KeyPair::generate();
        Transport::send_data(&mut writer, &keypair.public_bytes())
            .await
            .map_err(|e| handshake_error("sending public key", e))?;

        let remote = Transport::receive_data(&mut reader, PUBLIC_KEY_SIZE)
            .await
            .map_err(|e| handshake_error("reading public key", e))?;
        let remote: [u8; PUBLIC_KEY_SIZE] = remote.as_slice().try_into().map_err(|_| {
            P2PError::HandshakeFailure(format!(
                "public key must be {} bytes, got {}",
                PUBLIC_KEY_SIZE,
                remote.len()
            ))
        })?;
        let remote_public = PublicKey::from(remote);

        debug!(
            "Exchanged keys with {}: local {} remote {}",
            peer_addr,
            crypto::fingerprint(&keypair.public_key()),
            crypto::fingerprint(&remote_public)
        );

        let mut session_key = match role {
            Role::Initiator => {
                let session_key = crypto::generate_session_key();
                let sealed = crypto::seal(&remote_public, &session_key)
                    .map_err(|e| handshake_error("sealing session key", e))?;
                Transport::send_data(&mut writer, &sealed)
                    .await
                    .map_err(|e| handshake_error("sending session key", e))?;
                session_key
            }
            Role::Responder => {
                let sealed = Transport::receive_data(
                    &mut reader,
                    PUBLIC_KEY_SIZE + TAG_SIZE + MAX_SEALED_PLAINTEXT,
                )
                .await
                .map_err(|e| handshake_error("reading session key", e))?;
                let mut opened = keypair
                    .open(&sealed)
                    .map_err(|e| handshake_error("opening session key", e))?;
                let session_key: Result<[u8; KEY_SIZE]> =
                    opened.as_slice().try_into().map_err(|_| {
                        P2PError::HandshakeFailure(format!(
                            "session key must be {} bytes, got {}",
                            KEY_SIZE,
                            opened.len()
                        ))
                    });
                opened.zeroize();
                session_key?
            }
        };

        let keys = crypto::derive_directional_keys(&session_key);
        session_key.zeroize();
        let mut keys = keys.map_err(|e| handshake_error("deriving keys", e))?;

        let (send_key, recv_key) = match role {
            Role::Initiator => (&keys.initiator_to_responder, &keys.responder_to_initiator),
            Role::Responder => (&keys.responder_to_initiator, &keys.initiator_to_responder),
        };
        let sender = SecureSender {
            writer,
            cipher: SessionCipher::new(send_key),
        };
        let receiver = SecureReceiver {
            reader,
            cipher: SessionCipher::new(recv_key),
        };
        keys.initiator_to_responder.zeroize();
        keys.responder_to_initiator.zeroize();

        Ok(Self {
            sender,
            receiver,
            local_addr,
            peer_addr,
            remote_public,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn remote_public_key(&self) -> &PublicKey {
        &self.remote_public
    }

    pub async fn send(&mut self, plaintext: &[u8]) -> Result<()> {
        self.sender.send(plaintext).await
    }

    pub async fn receive(&mut self) -> Result<Vec<u8>> {
        self.receiver.receive().await
    }

    /// Separates the two directions so reads can block in one task while
    /// other tasks write.
    pub fn split(self) -> (SecureSender, SecureReceiver) {
        (self.sender, self.receiver)
    }
}

fn handshake_error(step: &str, err: P2PError) -> P2PError {
    P2PError::HandshakeFailure(format!("{}: {}", step, err))
}

/// Write half of an established [`SecureChannel`].
pub struct SecureSender {
    writer: OwnedWriteHalf,
    cipher: SessionCipher,
}

impl SecureSender {
    pub async fn send(&mut self, plaintext: &[u8]) -> Result<()> {
        if plaintext.len() + TAG_SIZE > MAX_FRAME_SIZE {
            return Err(P2PError::MessageTooLarge(plaintext.len()));
        }
        let ciphertext = self.cipher.encrypt(plaintext)?;
        Transport::send_data(&mut self.writer, &ciphertext).await
    }

    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.send(text.as_bytes()).await
    }

    /// Flushes and closes the write direction; the remote reader sees EOF.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Read half of an established [`SecureChannel`].
pub struct SecureReceiver {
    reader: OwnedReadHalf,
    cipher: SessionCipher,
}

impl SecureReceiver {
    /// Waits for the next frame and returns its plaintext.
    ///
    /// Fails with [`P2PError::ConnectionClosed`] once the other end hangs up
    /// and with [`P2PError::CryptoError`] if a frame does not authenticate.
    pub async fn receive(&mut self) -> Result<Vec<u8>> {
        let ciphertext = Transport::receive_data(&mut self.reader, MAX_FRAME_SIZE).await?;
        self.cipher.decrypt(&ciphertext)
    }

    pub async fn receive_text(&mut self) -> Result<String> {
        let bytes = self.receive().await?;
        String::from_utf8(bytes)
            .map_err(|e| P2PError::InvalidMessage(format!("message is not UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn channel_pair() -> (SecureChannel, SecureChannel) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            SecureChannel::handshake(stream, Role::Responder).await.unwrap()
        });
        let client = SecureChannel::connect(&addr).await.unwrap();
        let server = accept.await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_handshake_and_both_directions() {
        let (mut client, mut server) = channel_pair().await;

        client.send(b"alice").await.unwrap();
        assert_eq!(server.receive().await.unwrap(), b"alice");

        server.send(b"USERNAMEOK").await.unwrap();
        assert_eq!(client.receive().await.unwrap(), b"USERNAMEOK");
    }

    #[tokio::test]
    async fn test_messages_above_sealing_bound_use_session_key() {
        let (client, server) = channel_pair().await;
        let (mut tx, _) = client.split();
        let (_, mut rx) = server.split();

        let long_text = format!("SEARCH,{}", "x".repeat(4 * MAX_SEALED_PLAINTEXT));
        tx.send_text(&long_text).await.unwrap();
        assert_eq!(rx.receive_text().await.unwrap(), long_text);
    }

    #[tokio::test]
    async fn test_order_is_preserved() {
        let (client, server) = channel_pair().await;
        let (mut tx, _) = client.split();
        let (_, mut rx) = server.split();

        for i in 0..50 {
            tx.send_text(&format!("RESULT,bob,file{}.txt", i)).await.unwrap();
        }
        for i in 0..50 {
            assert_eq!(rx.receive_text().await.unwrap(), format!("RESULT,bob,file{}.txt", i));
        }
    }

    #[tokio::test]
    async fn test_shutdown_surfaces_as_connection_closed() {
        let (client, server) = channel_pair().await;
        let (mut tx, _client_rx) = client.split();
        let (_server_tx, mut rx) = server.split();

        tx.shutdown().await.unwrap();
        assert!(matches!(rx.receive().await, Err(P2PError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_garbage_public_key_fails_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            SecureChannel::handshake(stream, Role::Responder).await
        });

        let mut raw = TcpStream::connect(addr).await.unwrap();
        Transport::send_data(&mut raw, b"not a key").await.unwrap();

        let result = accept.await.unwrap();
        assert!(matches!(result, Err(P2PError::HandshakeFailure(_))));
    }
}
