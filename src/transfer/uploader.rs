use log::{debug, info};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{Duration, timeout};

use crate::core::events::PeerEvents;
use crate::core::protocol::TransferOffer;
use crate::network::Transport;
use crate::storage::SharedStorage;
use crate::transfer::CHUNK_SIZE;
use crate::transfer::session::TransferHeader;
use crate::utils::{P2PError, Result};

/// Pushes one shared file to a downloader that asked for it through the
/// directory server.
pub struct Uploader {
    storage: Arc<dyn SharedStorage>,
    events: Arc<dyn PeerEvents>,
    connect_timeout: Duration,
}

impl Uploader {
    pub fn new(
        storage: Arc<dyn SharedStorage>,
        events: Arc<dyn PeerEvents>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            events,
            connect_timeout,
        }
    }

    /// Runs the upload and reports the outcome through the event sink. No
    /// retry is attempted.
    pub async fn run(self, offer: TransferOffer) {
        let file_name = offer.file_name.clone();
        match self.upload(offer).await {
            Ok(sent) => {
                info!("Uploaded {} ({} bytes)", file_name, sent);
                self.events
                    .on_info(&format!("Upload complete: {}", file_name));
            }
            Err(e) => {
                self.events
                    .on_error(&format!("Upload of {} failed: {}", file_name, e));
            }
        }
    }

    pub async fn upload(&self, offer: TransferOffer) -> Result<u64> {
        let (mut source, size) = self.storage.open_for_read(&offer.file_name).await?;

        let target = match offer.address.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, offer.port).to_string(),
            Err(_) => format!("{}:{}", offer.address, offer.port),
        };
        debug!("Dialing {} for {}", target, offer.file_name);

        let mut stream = timeout(self.connect_timeout, Transport::connect(&target))
            .await
            .map_err(|_| {
                P2PError::ConnectionFailed(format!("timed out connecting to {}", target))
            })??;

        let header = TransferHeader {
            file_size: size,
            key: offer.key,
        };
        header
            .write_to(&mut stream)
            .await
            .map_err(|e| P2PError::TransferIOError(format!("sending header: {}", e)))?;

        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut sent: u64 = 0;
        while sent < size {
            let want = (size - sent).min(CHUNK_SIZE as u64) as usize;
            let n = source
                .read(&mut buffer[..want])
                .await
                .map_err(|e| P2PError::TransferIOError(format!("file read: {}", e)))?;
            if n == 0 {
                return Err(P2PError::TransferIOError(format!(
                    "{} shrank to {} of {} bytes",
                    offer.file_name, sent, size
                )));
            }

            stream
                .write_all(&buffer[..n])
                .await
                .map_err(|e| P2PError::TransferIOError(format!("socket write: {}", e)))?;
            sent += n as u64;
            self.events.on_upload_progress(sent, size);
        }

        stream
            .shutdown()
            .await
            .map_err(|e| P2PError::TransferIOError(format!("closing connection: {}", e)))?;
        Ok(sent)
    }
}
