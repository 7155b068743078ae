use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Duration, sleep, timeout};

use crate::storage::FileWriter;
use crate::transfer::session::TransferHeader;
use crate::transfer::{CHUNK_SIZE, PAUSE_POLL_INTERVAL, TransferShared};
use crate::utils::{P2PError, Result};

/// Receiving end of direct transfers. Owns the listener for the lifetime
/// of the peer and handles one inbound connection at a time.
pub struct Downloader {
    listener: TcpListener,
    shared: Arc<TransferShared>,
}

impl Downloader {
    pub fn new(listener: TcpListener, shared: Arc<TransferShared>) -> Self {
        Self { listener, shared }
    }

    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Transfer connection from {}", addr);
                    match self.handle_connection(stream, addr).await {
                        Ok(()) => {}
                        Err(e @ P2PError::TransferKeyMismatch(_)) => warn!("{}", e),
                        Err(e) => {
                            error!("Inbound transfer from {} failed: {}", addr, e);
                            self.shared.events.on_error(&format!("Download failed: {}", e));
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to accept transfer connection: {}", e);
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let header = match timeout(
            self.shared.header_timeout,
            TransferHeader::read_from(&mut stream),
        )
        .await
        {
            Ok(Ok(header)) => header,
            Ok(Err(e)) => {
                self.shared.rejected_attempts.fetch_add(1, Ordering::SeqCst);
                return Err(P2PError::TransferKeyMismatch(format!(
                    "unreadable header from {}: {}",
                    addr, e
                )));
            }
            Err(_) => {
                self.shared.rejected_attempts.fetch_add(1, Ordering::SeqCst);
                return Err(P2PError::TransferKeyMismatch(format!(
                    "no header from {} within {:?}",
                    addr, self.shared.header_timeout
                )));
            }
        };

        let file_name = {
            let mut pending = self.shared.pending.lock().await;
            let claimed = match pending.as_mut() {
                Some(session) => session
                    .try_claim(&header.key, header.file_size)
                    .then(|| session.file_name().to_string()),
                None => None,
            };
            match claimed {
                Some(file_name) => file_name,
                None => {
                    self.shared.rejected_attempts.fetch_add(1, Ordering::SeqCst);
                    return Err(P2PError::TransferKeyMismatch(format!(
                        "rejected connection from {}",
                        addr
                    )));
                }
            }
        };

        info!(
            "Receiving {} ({} bytes) from {}",
            file_name, header.file_size, addr
        );

        let result = match self.shared.storage.open_for_write(&file_name).await {
            Ok(mut file) => {
                let streamed = self
                    .receive_file(&mut stream, &mut file, header.file_size)
                    .await;
                let closed = file.shutdown().await.map_err(|e| {
                    P2PError::TransferIOError(format!("closing {}: {}", file_name, e))
                });
                streamed.and(closed)
            }
            Err(e) => Err(P2PError::TransferIOError(format!(
                "opening {}: {}",
                file_name, e
            ))),
        };

        let mut pending = self.shared.pending.lock().await;
        match result {
            Ok(()) => {
                if let Some(session) = pending.as_mut() {
                    session.complete();
                }
                drop(pending);
                info!("Download complete: {}", file_name);
                self.shared
                    .events
                    .on_info(&format!("Download complete: {}", file_name));
                Ok(())
            }
            Err(e) => {
                *pending = None;
                drop(pending);
                if let Err(discard_err) = self.shared.storage.discard(&file_name).await {
                    warn!("Could not discard partial {}: {}", file_name, discard_err);
                }
                Err(e)
            }
        }
    }

    /// Copies exactly `total` bytes from the socket into `file`, never
    /// reading past the announced size.
    async fn receive_file(
        &self,
        stream: &mut TcpStream,
        file: &mut FileWriter,
        total: u64,
    ) -> Result<()> {
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut received: u64 = 0;

        while received < total {
            while self.shared.paused.load(Ordering::SeqCst) {
                sleep(PAUSE_POLL_INTERVAL).await;
            }

            let want = (total - received).min(CHUNK_SIZE as u64) as usize;
            let n = stream
                .read(&mut buffer[..want])
                .await
                .map_err(|e| P2PError::TransferIOError(format!("socket read: {}", e)))?;
            if n == 0 {
                return Err(P2PError::TransferIOError(format!(
                    "sender closed after {} of {} bytes",
                    received, total
                )));
            }

            file.write_all(&buffer[..n])
                .await
                .map_err(|e| P2PError::TransferIOError(format!("file write: {}", e)))?;
            received += n as u64;

            if let Some(session) = self.shared.pending.lock().await.as_mut() {
                session.record_progress(received);
            }
            self.shared.events.on_download_progress(received, total);
        }

        file.flush()
            .await
            .map_err(|e| P2PError::TransferIOError(format!("file flush: {}", e)))?;
        Ok(())
    }
}
