//! Direct peer-to-peer file transfer.
//!
//! Every peer binds one transfer listener at startup. A download primes a
//! [`TransferSession`] with a one-time key; the uploader dials the listener,
//! presents that key in a [`TransferHeader`], and streams the file.

pub mod downloader;
pub mod session;
pub mod uploader;

pub use downloader::Downloader;
pub use session::{TransferHeader, TransferSession, TransferState, generate_transfer_key};
pub use uploader::Uploader;

use log::{debug, info};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::core::config::PeerConfig;
use crate::core::events::PeerEvents;
use crate::core::protocol::TransferOffer;
use crate::network::Transport;
use crate::storage::SharedStorage;
use crate::utils::{P2PError, Result};

pub const CHUNK_SIZE: usize = 4096;
pub const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const MAX_BIND_ATTEMPTS: u16 = 100;

/// Snapshot of the download slot for observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferStatus {
    pub state: TransferState,
    pub file_name: Option<String>,
    pub bytes_transferred: u64,
    pub expected_size: Option<u64>,
    pub rejected_attempts: u64,
    pub paused: bool,
}

/// State read by the accept loop and written by the control side.
pub struct TransferShared {
    pub(crate) storage: Arc<dyn SharedStorage>,
    pub(crate) events: Arc<dyn PeerEvents>,
    pub(crate) pending: Mutex<Option<TransferSession>>,
    pub(crate) paused: AtomicBool,
    pub(crate) rejected_attempts: AtomicU64,
    pub(crate) header_timeout: Duration,
}

pub struct TransferService {
    port: u16,
    shared: Arc<TransferShared>,
    connect_timeout: Duration,
    accept_task: JoinHandle<()>,
}

impl TransferService {
    /// Binds the transfer listener and starts accepting. The port stays
    /// fixed for the life of the service.
    pub async fn bind(
        config: &PeerConfig,
        storage: Arc<dyn SharedStorage>,
        events: Arc<dyn PeerEvents>,
    ) -> Result<Arc<Self>> {
        let listener =
            Transport::listen_from("0.0.0.0", config.transfer_base_port, MAX_BIND_ATTEMPTS)
                .await?;
        let port = listener.local_addr()?.port();
        info!("Transfer listener on port {}", port);

        let shared = Arc::new(TransferShared {
            storage,
            events,
            pending: Mutex::new(None),
            paused: AtomicBool::new(false),
            rejected_attempts: AtomicU64::new(0),
            header_timeout: config.header_timeout(),
        });

        let downloader = Downloader::new(listener, shared.clone());
        let accept_task = tokio::spawn(downloader.run());

        Ok(Arc::new(Self {
            port,
            shared,
            connect_timeout: config.connect_timeout(),
            accept_task,
        }))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Primes the slot for `file_name` and returns the key to put in the
    /// download request.
    pub async fn prepare_download(&self, file_name: &str) -> Result<String> {
        let mut pending = self.shared.pending.lock().await;
        if let Some(session) = pending.as_ref() {
            if !session.is_finished() {
                return Err(P2PError::TransferAlreadyInProgress);
            }
        }

        let session = TransferSession::new(file_name);
        let key = session.key().to_string();
        debug!("Prepared download of {}", file_name);
        *pending = Some(session);
        Ok(key)
    }

    pub async fn mark_listening(&self) {
        if let Some(session) = self.shared.pending.lock().await.as_mut() {
            session.mark_listening();
        }
    }

    /// Drops a session whose uploader has not connected yet. A transfer
    /// already receiving is left alone.
    pub async fn cancel_download(&self) -> bool {
        let mut pending = self.shared.pending.lock().await;
        match pending.as_ref() {
            Some(session) if session.is_live() => {
                info!("Cancelled pending download of {}", session.file_name());
                *pending = None;
                true
            }
            _ => false,
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.shared.paused.store(paused, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> TransferStatus {
        let pending = self.shared.pending.lock().await;
        let (state, file_name, bytes_transferred, expected_size) = match pending.as_ref() {
            Some(s) => (
                s.state(),
                Some(s.file_name().to_string()),
                s.bytes_transferred(),
                s.expected_size(),
            ),
            None => (TransferState::Idle, None, 0, None),
        };

        TransferStatus {
            state,
            file_name,
            bytes_transferred,
            expected_size,
            rejected_attempts: self.shared.rejected_attempts.load(Ordering::SeqCst),
            paused: self.is_paused(),
        }
    }

    /// Starts pushing a file in answer to a relayed download request.
    pub fn spawn_upload(&self, offer: TransferOffer) -> JoinHandle<()> {
        let uploader = Uploader::new(
            self.shared.storage.clone(),
            self.shared.events.clone(),
            self.connect_timeout,
        );
        tokio::spawn(uploader.run(offer))
    }
}

impl Drop for TransferService {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}
