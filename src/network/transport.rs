use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::utils::{P2PError, Result};

/// Upper bound on one framed message in either direction.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

pub struct Transport;

impl Transport {
    pub async fn connect(addr: &str) -> Result<TcpStream> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            P2PError::ConnectionFailed(format!("Failed to connect to {}: {}", addr, e))
        })?;

        stream
            .set_nodelay(true)
            .map_err(|e| P2PError::NetworkError(format!("Failed to set TCP_NODELAY: {}", e)))?;

        info!("Connected to {}", addr);
        Ok(stream)
    }

    pub async fn listen(addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| P2PError::NetworkError(format!("Failed to bind to {}: {}", addr, e)))?;

        info!("Listening on {}", addr);
        Ok(listener)
    }

    /// Binds `host:base_port`, moving up one port at a time until a bind
    /// succeeds. Port 0 asks the OS for any free port.
    pub async fn listen_from(host: &str, base_port: u16, max_attempts: u16) -> Result<TcpListener> {
        if base_port == 0 {
            return Self::listen(&format!("{}:0", host)).await;
        }

        for offset in 0..max_attempts {
            let Some(port) = base_port.checked_add(offset) else {
                break;
            };
            match TcpListener::bind(format!("{}:{}", host, port)).await {
                Ok(listener) => {
                    info!("Listening on {}:{}", host, port);
                    return Ok(listener);
                }
                Err(e) => debug!("Port {} unavailable: {}", port, e),
            }
        }

        warn!(
            "No free port in {}..{} on {}",
            base_port,
            base_port.saturating_add(max_attempts),
            host
        );
        Err(P2PError::NetworkError(
            "No available ports found".to_string(),
        ))
    }

    /// Writes one frame: a big-endian `u32` length, then the payload.
    pub async fn send_data<W>(writer: &mut W, data: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if data.len() > MAX_FRAME_SIZE {
            return Err(P2PError::MessageTooLarge(data.len()));
        }

        writer.write_u32(data.len() as u32).await?;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Reads one frame written by [`Transport::send_data`].
    pub async fn receive_data<R>(reader: &mut R, max_size: usize) -> Result<Vec<u8>>
    where
        R: AsyncRead + Unpin,
    {
        let len = reader.read_u32().await? as usize;

        if len > max_size {
            return Err(P2PError::MessageTooLarge(len));
        }

        let mut buffer = vec![0u8; len];
        reader.read_exact(&mut buffer).await?;

        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_keep_boundaries() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        Transport::send_data(&mut client, b"first").await.unwrap();
        Transport::send_data(&mut client, b"").await.unwrap();
        Transport::send_data(&mut client, b"third, with commas").await.unwrap();

        assert_eq!(Transport::receive_data(&mut server, 64).await.unwrap(), b"first");
        assert!(Transport::receive_data(&mut server, 64).await.unwrap().is_empty());
        assert_eq!(
            Transport::receive_data(&mut server, 64).await.unwrap(),
            b"third, with commas"
        );
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        Transport::send_data(&mut client, &[7u8; 100]).await.unwrap();
        let result = Transport::receive_data(&mut server, 50).await;
        assert!(matches!(result, Err(P2PError::MessageTooLarge(100))));
    }

    #[tokio::test]
    async fn test_closed_stream_reports_connection_closed() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let result = Transport::receive_data(&mut server, 64).await;
        assert!(matches!(result, Err(P2PError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_listen_from_skips_taken_port() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = taken.local_addr().unwrap().port();

        let listener = Transport::listen_from("127.0.0.1", base, 100).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port > base);
    }
}
