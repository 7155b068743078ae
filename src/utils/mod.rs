pub mod crypto;
pub mod error;
pub mod logger;
pub mod metrics;

pub use error::{P2PError, Result};
pub use logger::setup_logging;
pub use metrics::{MetricsCollector, RelayMetrics};
