pub mod config;
pub mod events;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod search;

pub use config::{PeerConfig, ServerConfig};
pub use events::{LogEvents, PeerEvent, PeerEvents};
pub use node::Node;
pub use peer::PeerSession;
pub use protocol::{ClientMessage, DownloadRequest, ServerMessage, TransferOffer};
pub use search::SearchResults;
