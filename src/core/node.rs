use log::info;
use std::sync::Arc;
use tokio::time::timeout;

use crate::core::config::PeerConfig;
use crate::core::events::PeerEvents;
use crate::core::peer::PeerSession;
use crate::storage::{FileManager, SharedStorage};
use crate::transfer::{TransferService, TransferStatus};
use crate::utils::{P2PError, Result};

/// One running peer: shared directory, transfer listener and the session
/// with the directory server.
pub struct Node {
    config: PeerConfig,
    storage: Arc<FileManager>,
    transfer: Arc<TransferService>,
    session: PeerSession,
}

impl Node {
    /// Binds the transfer listener before dialing the server, so any
    /// download request this peer sends already points at a live port.
    pub async fn start(config: PeerConfig, events: Arc<dyn PeerEvents>) -> Result<Self> {
        let storage = Arc::new(FileManager::new(config.shared_dir.clone()).await?);
        let transfer = TransferService::bind(&config, storage.clone(), events.clone()).await?;

        let session = timeout(
            config.connect_timeout(),
            PeerSession::connect(
                &config.server_addr,
                storage.clone(),
                transfer.clone(),
                events,
                config.advertise_addr,
            ),
        )
        .await
        .map_err(|_| {
            P2PError::ConnectionFailed(format!(
                "timed out connecting to {}",
                config.server_addr
            ))
        })??;

        info!(
            "Peer started: server {}, transfer port {}",
            session.server_addr(),
            transfer.port()
        );

        Ok(Self {
            config,
            storage,
            transfer,
            session,
        })
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn session(&self) -> &PeerSession {
        &self.session
    }

    pub fn transfer(&self) -> &TransferService {
        &self.transfer
    }

    pub async fn local_files(&self) -> Result<Vec<String>> {
        self.storage.list_local_files().await
    }

    pub async fn status(&self) -> TransferStatus {
        self.transfer.status().await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.transfer.cancel_download().await;
        self.session.disconnect().await
    }
}
