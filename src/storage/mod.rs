pub mod file_manager;

pub use file_manager::FileManager;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::utils::Result;

pub type FileReader = Box<dyn AsyncRead + Send + Unpin>;
pub type FileWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Where a peer's shared files live.
///
/// Names are bare file names as they appear in search results. They are
/// never paths.
#[async_trait]
pub trait SharedStorage: Send + Sync {
    /// Names of the files this peer offers, in a stable order.
    async fn list_local_files(&self) -> Result<Vec<String>>;

    /// Creates or truncates `name` for writing.
    async fn open_for_write(&self, name: &str) -> Result<FileWriter>;

    /// Opens `name` for reading and reports its size in bytes.
    async fn open_for_read(&self, name: &str) -> Result<(FileReader, u64)>;

    /// Removes a partially written file.
    async fn discard(&self, name: &str) -> Result<()>;
}
