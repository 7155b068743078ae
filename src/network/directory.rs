//! Directory server: the rendezvous point peers register with.
//!
//! The server never sees file contents. It keeps the username registry and
//! relays SEARCH, RESULT and DOWNLOAD messages between registered peers.

use log::{debug, error, info, warn};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout};
use uuid::Uuid;

use crate::core::config::ServerConfig;
use crate::core::protocol::{self, ClientMessage, ServerMessage, TAG_DISCONNECT};
use crate::network::connection::{ConnectionHandle, ConnectionRegistry, Registration};
use crate::network::secure_channel::{Role, SecureChannel, SecureReceiver, SecureSender};
use crate::network::transport::Transport;
use crate::utils::{MetricsCollector, P2PError, Result};

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle of one server-side connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingPubkey,
    AwaitingUsername,
    Registered,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::AwaitingPubkey => "awaiting-pubkey",
            ConnectionState::AwaitingUsername => "awaiting-username",
            ConnectionState::Registered => "registered",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

pub struct DirectoryServer {
    listener: TcpListener,
    config: ServerConfig,
    registry: ConnectionRegistry,
    metrics: MetricsCollector,
}

impl DirectoryServer {
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = Transport::listen(&config.listen_addr()).await?;
        let registry = ConnectionRegistry::new(config.max_connections);

        Ok(Self {
            listener,
            config,
            registry,
            metrics: MetricsCollector::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> ConnectionRegistry {
        self.registry.clone()
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    /// Accepts connections until the task is cancelled, one task each.
    pub async fn run(&self) -> Result<()> {
        info!("Directory server listening on {}", self.local_addr()?);

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    info!("New connection from: {}", addr);
                    self.metrics.record_connection_accepted().await;

                    let registry = self.registry.clone();
                    let metrics = self.metrics.clone();
                    let handshake_timeout = self.config.handshake_timeout();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(
                            stream,
                            addr,
                            registry,
                            metrics.clone(),
                            handshake_timeout,
                        )
                        .await
                        {
                            warn!("Connection from {} ended with error: {}", addr, e);
                        }
                        metrics.record_connection_closed().await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

fn transition(addr: SocketAddr, state: &mut ConnectionState, next: ConnectionState) {
    debug!("{}: {} -> {}", addr, state, next);
    *state = next;
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: ConnectionRegistry,
    metrics: MetricsCollector,
    handshake_timeout: Duration,
) -> Result<()> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
    }
    let mut state = ConnectionState::AwaitingPubkey;

    let channel = match timeout(handshake_timeout, SecureChannel::handshake(stream, Role::Responder))
        .await
    {
        Ok(Ok(channel)) => channel,
        Ok(Err(e)) => {
            metrics.record_handshake_failed().await;
            return Err(e);
        }
        Err(_) => {
            metrics.record_handshake_failed().await;
            return Err(P2PError::HandshakeFailure(format!(
                "no key exchange within {:?}",
                handshake_timeout
            )));
        }
    };
    transition(addr, &mut state, ConnectionState::AwaitingUsername);

    let (mut sender, mut receiver) = channel.split();
    let id = Uuid::new_v4();

    let registered = register(addr, id, &mut sender, &mut receiver, &registry, &metrics).await?;
    let (username, outbound_tx, outbound_rx) = match registered {
        Some(registered) => registered,
        None => {
            transition(addr, &mut state, ConnectionState::Closed);
            let _ = sender.shutdown().await;
            return Ok(());
        }
    };
    transition(addr, &mut state, ConnectionState::Registered);

    // USERNAMEOK sits at the head of the queue, ahead of anything other
    // connections relayed since the insert.
    let mut writer = tokio::spawn(write_outbound(sender, outbound_rx, username.clone()));

    let result = serve_registered(&username, &mut receiver, &outbound_tx, &registry, &metrics).await;

    registry.remove(&username, id).await;
    drop(outbound_tx);
    transition(addr, &mut state, ConnectionState::Closed);

    if timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }

    info!("{} disconnected", username);
    match result {
        Err(e) if e.is_disconnect() => Ok(()),
        other => other,
    }
}

/// The accepted username plus the outbound queue registered under it.
type Registered = (
    String,
    mpsc::UnboundedSender<ServerMessage>,
    mpsc::UnboundedReceiver<ServerMessage>,
);

/// Reads username attempts until one is accepted. `None` means the client
/// left before registering.
///
/// Nothing fallible runs between the registry insert and the return, so an
/// accepted name is always released by the caller's cleanup.
async fn register(
    addr: SocketAddr,
    id: Uuid,
    sender: &mut SecureSender,
    receiver: &mut SecureReceiver,
    registry: &ConnectionRegistry,
    metrics: &MetricsCollector,
) -> Result<Option<Registered>> {
    loop {
        let attempt = match receiver.receive().await {
            Ok(bytes) => String::from_utf8(bytes).ok(),
            Err(e) if e.is_disconnect() => return Ok(None),
            Err(e) => return Err(e),
        };

        if attempt.as_deref() == Some(TAG_DISCONNECT) {
            debug!("{} disconnected before registering", addr);
            return Ok(None);
        }

        let accepted = match attempt {
            Some(name) if protocol::is_valid_username(&name) => {
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                outbound_tx
                    .send(ServerMessage::UsernameOk)
                    .map_err(|_| P2PError::ConnectionClosed)?;
                let handle = ConnectionHandle {
                    id,
                    addr,
                    connected_at: Instant::now(),
                    outbound: outbound_tx.clone(),
                };
                match registry.try_register(&name, handle).await {
                    Registration::Accepted => Some((name, outbound_tx, outbound_rx)),
                    Registration::Taken => None,
                    Registration::Full => {
                        warn!("Connection limit reached, refusing {}", name);
                        None
                    }
                }
            }
            _ => {
                debug!("Rejected malformed username from {}", addr);
                None
            }
        };

        match accepted {
            Some(registered) => {
                metrics.record_registration(true).await;
                return Ok(Some(registered));
            }
            None => {
                metrics.record_registration(false).await;
                sender.send_text(&ServerMessage::UsernameTaken.encode()).await?;
            }
        }
    }
}

async fn serve_registered(
    username: &str,
    receiver: &mut SecureReceiver,
    outbound: &mpsc::UnboundedSender<ServerMessage>,
    registry: &ConnectionRegistry,
    metrics: &MetricsCollector,
) -> Result<()> {
    loop {
        let text = match String::from_utf8(receiver.receive().await?) {
            Ok(text) => text,
            Err(_) => {
                warn!("Skipping non-UTF-8 message from {}", username);
                continue;
            }
        };

        let message = match ClientMessage::decode(&text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Skipping message from {}: {}", username, e);
                continue;
            }
        };

        match message {
            ClientMessage::Disconnect => {
                let _ = outbound.send(ServerMessage::Disconnect);
                return Ok(());
            }
            ClientMessage::Search { text } => {
                let mut delivered = 0;
                for (name, handle) in registry.others(username).await {
                    let msg = ServerMessage::Search {
                        from: username.to_string(),
                        text: text.clone(),
                    };
                    if enqueue(&name, &handle, msg) {
                        delivered += 1;
                    } else {
                        metrics.record_dropped().await;
                    }
                }
                debug!("{} searched {:?}, relayed to {} peers", username, text, delivered);
                metrics.record_search(delivered).await;
            }
            ClientMessage::Result { to, file_name } => {
                let msg = ServerMessage::Result {
                    from: username.to_string(),
                    file_name,
                };
                match relay(registry, &to, msg).await {
                    Ok(()) => metrics.record_result().await,
                    Err(e) => {
                        debug!("Dropping RESULT from {}: {}", username, e);
                        metrics.record_dropped().await;
                    }
                }
            }
            ClientMessage::Download(request) => {
                let uploader = request.uploader.clone();
                match relay(registry, &uploader, ServerMessage::Download(request.into_offer())).await
                {
                    Ok(()) => metrics.record_download().await,
                    Err(e) => {
                        warn!("Dropping DOWNLOAD from {}: {}", username, e);
                        metrics.record_dropped().await;
                    }
                }
            }
        }
    }
}

async fn relay(registry: &ConnectionRegistry, target: &str, msg: ServerMessage) -> Result<()> {
    let handle = registry
        .get(target)
        .await
        .ok_or_else(|| P2PError::RelayTargetUnavailable(target.to_string()))?;

    if enqueue(target, &handle, msg) {
        Ok(())
    } else {
        Err(P2PError::RelayTargetUnavailable(target.to_string()))
    }
}

/// Hands a message to the target's writer task without waiting on a slow
/// reader. Fails only once that connection is shutting down.
fn enqueue(target: &str, handle: &ConnectionHandle, msg: ServerMessage) -> bool {
    if handle.outbound.send(msg).is_err() {
        debug!("{} is closing, dropping relayed message", target);
        return false;
    }
    true
}

/// Sole writer for one registered connection. Stops when every queue
/// sender is gone or the socket fails.
async fn write_outbound(
    mut sender: SecureSender,
    mut outbound: mpsc::UnboundedReceiver<ServerMessage>,
    username: String,
) {
    while let Some(msg) = outbound.recv().await {
        let closing = msg == ServerMessage::Disconnect;
        if let Err(e) = sender.send_text(&msg.encode()).await {
            debug!("Write to {} failed: {}", username, e);
            return;
        }
        if closing {
            break;
        }
    }
    let _ = sender.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn start_server(max_connections: usize) -> (SocketAddr, ConnectionRegistry) {
        let config = ServerConfig {
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
            max_connections,
            handshake_timeout_secs: 2,
        };
        let server = DirectoryServer::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let registry = server.registry();
        tokio::spawn(async move { server.run().await });
        (addr, registry)
    }

    async fn connect(addr: SocketAddr) -> SecureChannel {
        SecureChannel::connect(&addr.to_string()).await.unwrap()
    }

    async fn reply(channel: &mut SecureChannel) -> ServerMessage {
        let bytes = channel.receive().await.unwrap();
        ServerMessage::decode(std::str::from_utf8(&bytes).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_invalid_then_taken_then_ok_on_one_connection() {
        let (addr, registry) = start_server(16).await;

        let mut first = connect(addr).await;
        first.send(b"alice").await.unwrap();
        assert_eq!(reply(&mut first).await, ServerMessage::UsernameOk);

        let mut second = connect(addr).await;
        second.send(b"bad,name").await.unwrap();
        assert_eq!(reply(&mut second).await, ServerMessage::UsernameTaken);
        second.send(b"alice").await.unwrap();
        assert_eq!(reply(&mut second).await, ServerMessage::UsernameTaken);
        second.send(b"bob").await.unwrap();
        assert_eq!(reply(&mut second).await, ServerMessage::UsernameOk);

        assert_eq!(registry.usernames().await, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_disconnect_is_acknowledged_and_name_released() {
        let (addr, registry) = start_server(16).await;

        let mut client = connect(addr).await;
        client.send(b"carol").await.unwrap();
        assert_eq!(reply(&mut client).await, ServerMessage::UsernameOk);

        client.send(b"DISCONNECT").await.unwrap();
        assert_eq!(reply(&mut client).await, ServerMessage::Disconnect);
        assert!(matches!(client.receive().await, Err(P2PError::ConnectionClosed)));

        for _ in 0..50 {
            if !registry.contains("carol").await {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert!(!registry.contains("carol").await);

        let mut again = connect(addr).await;
        again.send(b"carol").await.unwrap();
        assert_eq!(reply(&mut again).await, ServerMessage::UsernameOk);
    }

    #[tokio::test]
    async fn test_result_to_unknown_peer_is_dropped_silently() {
        let (addr, _registry) = start_server(16).await;

        let mut client = connect(addr).await;
        client.send(b"dave").await.unwrap();
        assert_eq!(reply(&mut client).await, ServerMessage::UsernameOk);

        client.send(b"RESULT,nobody,file.txt").await.unwrap();
        client.send(b"garbage").await.unwrap();
        client.send(b"DISCONNECT").await.unwrap();
        assert_eq!(reply(&mut client).await, ServerMessage::Disconnect);
    }

    async fn wait_until_released(registry: &ConnectionRegistry, username: &str) {
        for _ in 0..100 {
            if !registry.contains(username).await {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("{} is still registered", username);
    }

    #[tokio::test]
    async fn test_non_utf8_frames_do_not_drop_the_connection() {
        let (addr, registry) = start_server(16).await;

        let mut client = connect(addr).await;
        client.send(&[0xff, 0xfe, 0xfd]).await.unwrap();
        assert_eq!(reply(&mut client).await, ServerMessage::UsernameTaken);
        client.send(b"frank").await.unwrap();
        assert_eq!(reply(&mut client).await, ServerMessage::UsernameOk);

        client.send(&[0xc3, 0x28]).await.unwrap();
        assert!(registry.contains("frank").await);

        client.send(b"DISCONNECT").await.unwrap();
        assert_eq!(reply(&mut client).await, ServerMessage::Disconnect);
    }

    #[tokio::test]
    async fn test_name_released_when_client_vanishes_after_naming() {
        let (addr, registry) = start_server(16).await;

        for _ in 0..5 {
            let mut client = connect(addr).await;
            client.send(b"erin").await.unwrap();
            drop(client);
            wait_until_released(&registry, "erin").await;
        }

        let mut again = connect(addr).await;
        again.send(b"erin").await.unwrap();
        assert_eq!(reply(&mut again).await, ServerMessage::UsernameOk);
    }

    #[tokio::test]
    async fn test_relays_to_slow_reader_are_all_delivered() {
        let (addr, _registry) = start_server(16).await;

        let mut slow = connect(addr).await;
        slow.send(b"gina").await.unwrap();
        assert_eq!(reply(&mut slow).await, ServerMessage::UsernameOk);

        let mut chatty = connect(addr).await;
        chatty.send(b"hank").await.unwrap();
        assert_eq!(reply(&mut chatty).await, ServerMessage::UsernameOk);

        // Large enough that the socket buffers fill and the rest waits in
        // the server's queue.
        let padding = "x".repeat(4000);
        let searches = 600;
        for i in 0..searches {
            chatty
                .send(format!("SEARCH,query-{}-{}", i, padding).as_bytes())
                .await
                .unwrap();
        }

        for i in 0..searches {
            let msg = timeout(Duration::from_secs(10), reply(&mut slow))
                .await
                .unwrap();
            assert_eq!(
                msg,
                ServerMessage::Search {
                    from: "hank".to_string(),
                    text: format!("query-{}-{}", i, padding),
                }
            );
        }
    }

    #[tokio::test]
    async fn test_silent_client_times_out() {
        let (addr, _registry) = start_server(16).await;

        let mut raw = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        // The server sends its public key frame and then gives up on us.
        let read = timeout(Duration::from_secs(5), async {
            use tokio::io::AsyncReadExt;
            raw.read_to_end(&mut buf).await
        })
        .await;
        assert!(read.is_ok());
    }
}
