use log::{debug, info, warn};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};

use crate::core::events::PeerEvents;
use crate::core::protocol::{self, ClientMessage, DownloadRequest, ServerMessage};
use crate::core::search::{SearchResults, find_matches};
use crate::network::{SecureChannel, SecureReceiver, SecureSender};
use crate::storage::SharedStorage;
use crate::transfer::TransferService;
use crate::utils::{P2PError, Result};

const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// State the receive task shares with the control side.
struct SessionShared {
    sender: Mutex<SecureSender>,
    results: RwLock<SearchResults>,
    storage: Arc<dyn SharedStorage>,
    transfer: Arc<TransferService>,
    events: Arc<dyn PeerEvents>,
    connected: AtomicBool,
}

impl SessionShared {
    async fn send(&self, message: &ClientMessage) -> Result<()> {
        self.sender.lock().await.send_text(&message.encode()).await
    }
}

/// A peer's connection to the directory server.
///
/// Created unregistered. After [`register`](Self::register) succeeds a
/// background task answers relayed searches, collects results and starts
/// uploads.
pub struct PeerSession {
    shared: Arc<SessionShared>,
    receiver: Mutex<Option<SecureReceiver>>,
    username: OnceLock<String>,
    local_addr: SocketAddr,
    server_addr: SocketAddr,
    advertise_addr: Option<IpAddr>,
    receive_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PeerSession {
    pub async fn connect(
        server_addr: &str,
        storage: Arc<dyn SharedStorage>,
        transfer: Arc<TransferService>,
        events: Arc<dyn PeerEvents>,
        advertise_addr: Option<IpAddr>,
    ) -> Result<Self> {
        let channel = SecureChannel::connect(server_addr).await?;
        let local_addr = channel.local_addr();
        let server_addr = channel.peer_addr();
        let (sender, receiver) = channel.split();

        info!("Secure channel to {} established", server_addr);

        Ok(Self {
            shared: Arc::new(SessionShared {
                sender: Mutex::new(sender),
                results: RwLock::new(SearchResults::new()),
                storage,
                transfer,
                events,
                connected: AtomicBool::new(true),
            }),
            receiver: Mutex::new(Some(receiver)),
            username: OnceLock::new(),
            local_addr,
            server_addr,
            advertise_addr,
            receive_task: std::sync::Mutex::new(None),
        })
    }

    /// Claims `username` on the server. On [`P2PError::UsernameTaken`] the
    /// connection stays open for another attempt.
    pub async fn register(&self, username: &str) -> Result<()> {
        if self.username.get().is_some() {
            return Err(P2PError::InvalidInput("session is already registered".to_string()));
        }
        if !protocol::is_valid_username(username) {
            return Err(P2PError::InvalidUsername(username.to_string()));
        }

        let mut slot = self.receiver.lock().await;
        let receiver = slot.as_mut().ok_or(P2PError::ConnectionClosed)?;

        self.shared.sender.lock().await.send_text(username).await?;
        let reply = receiver.receive_text().await?;

        match ServerMessage::decode(&reply)? {
            ServerMessage::UsernameOk => {}
            ServerMessage::UsernameTaken => {
                return Err(P2PError::UsernameTaken(username.to_string()));
            }
            other => {
                return Err(P2PError::InvalidMessage(format!(
                    "expected registration reply, got {:?}",
                    other
                )));
            }
        }

        let receiver = slot.take().ok_or(P2PError::ConnectionClosed)?;
        let _ = self.username.set(username.to_string());
        info!("Registered as {}", username);

        let task = tokio::spawn(receive_loop(
            receiver,
            self.shared.clone(),
            username.to_string(),
        ));
        if let Ok(mut guard) = self.receive_task.lock() {
            *guard = Some(task);
        }
        Ok(())
    }

    /// Clears previous results and broadcasts `text`. Results arrive later
    /// through [`PeerEvents::on_results_changed`].
    pub async fn search(&self, text: &str) -> Result<()> {
        self.ensure_registered()?;
        if text.is_empty() {
            return Err(P2PError::InvalidInput("search text is empty".to_string()));
        }

        self.shared.results.write().await.clear();
        self.shared.events.on_results_changed(&[]);

        debug!("Searching for {:?}", text);
        self.shared
            .send(&ClientMessage::Search {
                text: text.to_string(),
            })
            .await
    }

    pub async fn results(&self) -> Vec<String> {
        self.shared.results.read().await.files().to_vec()
    }

    pub async fn owner_of(&self, file_name: &str) -> Option<String> {
        self.shared
            .results
            .read()
            .await
            .owner_of(file_name)
            .map(str::to_string)
    }

    /// Asks the owner of `file_name`, as recorded from search results, to
    /// push it to this peer's transfer listener.
    pub async fn start_download(&self, file_name: &str) -> Result<()> {
        self.ensure_registered()?;
        let uploader = self
            .owner_of(file_name)
            .await
            .ok_or_else(|| P2PError::FileNotFound(file_name.to_string()))?;

        let transfer = &self.shared.transfer;
        let key = transfer.prepare_download(file_name).await?;

        let request = ClientMessage::Download(DownloadRequest {
            uploader: uploader.clone(),
            file_name: file_name.to_string(),
            address: self.advertised_ip().to_string(),
            port: transfer.port(),
            key,
        });

        if let Err(e) = self.shared.send(&request).await {
            transfer.cancel_download().await;
            return Err(e);
        }
        transfer.mark_listening().await;

        info!("Requested {} from {}", file_name, uploader);
        Ok(())
    }

    /// Sends DISCONNECT and waits briefly for the server to acknowledge.
    pub async fn disconnect(&self) -> Result<()> {
        if !self.shared.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        {
            let mut sender = self.shared.sender.lock().await;
            if let Err(e) = sender.send_text(protocol::TAG_DISCONNECT).await {
                debug!("Could not send DISCONNECT: {}", e);
            }
            let _ = sender.shutdown().await;
        }

        let task = self.receive_task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(mut task) = task {
            if timeout(DISCONNECT_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }

        info!("Disconnected from {}", self.server_addr);
        Ok(())
    }

    pub fn username(&self) -> Option<&str> {
        self.username.get().map(String::as_str)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    fn advertised_ip(&self) -> IpAddr {
        self.advertise_addr.unwrap_or_else(|| self.local_addr.ip())
    }

    fn ensure_registered(&self) -> Result<()> {
        if self.username.get().is_none() {
            return Err(P2PError::InvalidInput("register a username first".to_string()));
        }
        if !self.is_connected() {
            return Err(P2PError::ConnectionClosed);
        }
        Ok(())
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.receive_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}

async fn receive_loop(mut receiver: SecureReceiver, shared: Arc<SessionShared>, username: String) {
    loop {
        let bytes = match receiver.receive().await {
            Ok(bytes) => bytes,
            Err(e) if e.is_disconnect() => break,
            Err(e) => {
                warn!("Lost connection to directory server: {}", e);
                shared.events.on_error(&format!("Connection lost: {}", e));
                break;
            }
        };
        let Ok(text) = String::from_utf8(bytes) else {
            warn!("Skipping non-UTF-8 message from server");
            continue;
        };

        match ServerMessage::decode(&text) {
            Ok(ServerMessage::Search { from, text }) => {
                if let Err(e) = answer_search(&shared, &from, &text).await {
                    warn!("Could not answer search from {}: {}", from, e);
                }
            }
            Ok(ServerMessage::Result { from, file_name }) => {
                let changed = {
                    let mut results = shared.results.write().await;
                    results
                        .insert(&file_name, &from)
                        .then(|| results.files().to_vec())
                };
                if let Some(files) = changed {
                    shared.events.on_results_changed(&files);
                }
            }
            Ok(ServerMessage::Download(offer)) => {
                info!("Upload of {} requested", offer.file_name);
                shared.transfer.spawn_upload(offer);
            }
            Ok(ServerMessage::Disconnect) => break,
            Ok(other) => debug!("Ignoring unexpected {:?}", other),
            Err(e) => warn!("Skipping message from server: {}", e),
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
    let _ = shared.sender.lock().await.shutdown().await;
    info!("{} left the directory server", username);
    shared.events.on_info("Disconnected from directory server");
}

async fn answer_search(shared: &SessionShared, searcher: &str, text: &str) -> Result<()> {
    let listing = shared.storage.list_local_files().await?;
    let matches = find_matches(&listing, text);
    debug!("{} of {} files match {:?}", matches.len(), listing.len(), text);

    for file_name in matches {
        shared
            .send(&ClientMessage::Result {
                to: searcher.to_string(),
                file_name: file_name.to_string(),
            })
            .await?;
    }
    Ok(())
}
