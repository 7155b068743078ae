//! Peer-to-peer file sharing around a directory server.
//!
//! Peers register a username with the directory server over an encrypted
//! channel, broadcast searches through it, and then move file bytes
//! directly between each other.

pub mod core;
pub mod network;
pub mod storage;
pub mod transfer;
pub mod utils;

// Re-export main types
pub use core::{Node, PeerConfig, PeerEvent, PeerEvents, PeerSession, ServerConfig};
pub use network::DirectoryServer;
pub use storage::{FileManager, SharedStorage};
pub use transfer::{TransferService, TransferState, TransferStatus};
pub use utils::error::{P2PError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
