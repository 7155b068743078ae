pub mod connection;
pub mod directory;
pub mod secure_channel;
pub mod transport;

pub use connection::{ConnectionHandle, ConnectionRegistry, Registration};
pub use directory::{ConnectionState, DirectoryServer};
pub use secure_channel::{Role, SecureChannel, SecureReceiver, SecureSender};
pub use transport::Transport;
