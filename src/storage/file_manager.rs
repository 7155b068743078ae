use async_trait::async_trait;
use log::{debug, info};
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;

use crate::storage::{FileReader, FileWriter, SharedStorage};
use crate::utils::{P2PError, Result};

/// Directory-backed [`SharedStorage`]: every regular file in `shared_dir` is
/// offered to searches, and downloads land in the same directory.
pub struct FileManager {
    shared_dir: PathBuf,
}

impl FileManager {
    pub async fn new(shared_dir: PathBuf) -> Result<Self> {
        async_fs::create_dir_all(&shared_dir)
            .await
            .map_err(|e| P2PError::IoError(format!("Failed to create directory: {}", e)))?;

        info!("Sharing files from: {:?}", shared_dir);
        Ok(Self { shared_dir })
    }

    pub fn shared_dir(&self) -> &Path {
        &self.shared_dir
    }

    /// Maps a file name onto the shared directory, refusing anything that
    /// could escape it.
    fn resolve(&self, name: &str) -> Result<PathBuf> {
        let escapes = name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\\')
            || name.contains('\0');
        if escapes {
            return Err(P2PError::InvalidInput(format!("invalid file name: {:?}", name)));
        }
        Ok(self.shared_dir.join(name))
    }
}

#[async_trait]
impl SharedStorage for FileManager {
    async fn list_local_files(&self) -> Result<Vec<String>> {
        let mut entries = async_fs::read_dir(&self.shared_dir)
            .await
            .map_err(|e| P2PError::IoError(format!("Failed to read directory: {}", e)))?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| P2PError::IoError(format!("Failed to read directory entry: {}", e)))?
        {
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);
            if is_file {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }

        names.sort();
        debug!("Listed {} shared files", names.len());
        Ok(names)
    }

    async fn open_for_write(&self, name: &str) -> Result<FileWriter> {
        let path = self.resolve(name)?;
        let file = async_fs::File::create(&path)
            .await
            .map_err(|e| P2PError::IoError(format!("Failed to create {:?}: {}", path, e)))?;
        Ok(Box::new(file))
    }

    async fn open_for_read(&self, name: &str) -> Result<(FileReader, u64)> {
        let path = self.resolve(name)?;
        let file = async_fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                P2PError::FileNotFound(name.to_string())
            } else {
                P2PError::IoError(format!("Failed to open {:?}: {}", path, e))
            }
        })?;
        let size = file
            .metadata()
            .await
            .map_err(|e| P2PError::IoError(format!("Failed to read metadata: {}", e)))?
            .len();
        Ok((Box::new(file), size))
    }

    async fn discard(&self, name: &str) -> Result<()> {
        let path = self.resolve(name)?;
        match async_fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(P2PError::IoError(format!("Failed to remove {:?}: {}", path, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_lists_only_regular_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"n").unwrap();
        std::fs::write(dir.path().join("Report_Final.pdf"), b"r").unwrap();
        std::fs::create_dir(dir.path().join("subdir")).unwrap();

        let store = FileManager::new(dir.path().to_path_buf()).await.unwrap();
        let files = store.list_local_files().await.unwrap();
        assert_eq!(files, vec!["Report_Final.pdf", "notes.txt"]);
    }

    #[tokio::test]
    async fn test_write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileManager::new(dir.path().join("localFiles")).await.unwrap();

        let mut writer = store.open_for_write("data.bin").await.unwrap();
        writer.write_all(&[1, 2, 3, 4]).await.unwrap();
        writer.shutdown().await.unwrap();

        let (mut reader, size) = store.open_for_read("data.bin").await.unwrap();
        assert_eq!(size, 4);
        let mut content = Vec::new();
        reader.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, vec![1, 2, 3, 4]);

        store.discard("data.bin").await.unwrap();
        store.discard("data.bin").await.unwrap();
        assert!(store.list_local_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_names_outside_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileManager::new(dir.path().to_path_buf()).await.unwrap();

        for name in ["../secret", "a/b", "..", "", "dir\\file"] {
            assert!(
                matches!(store.open_for_read(name).await, Err(P2PError::InvalidInput(_))),
                "accepted {:?}",
                name
            );
        }
        assert!(matches!(
            store.open_for_read("missing.txt").await,
            Err(P2PError::FileNotFound(_))
        ));
    }
}
