use log::{error, info};
use tokio::sync::mpsc;

/// Callbacks a front end receives from a running peer.
///
/// All methods default to doing nothing. They are called from network tasks
/// and must not block.
pub trait PeerEvents: Send + Sync {
    fn on_results_changed(&self, _results: &[String]) {}
    fn on_download_progress(&self, _bytes_so_far: u64, _total: u64) {}
    fn on_upload_progress(&self, _bytes_so_far: u64, _total: u64) {}
    fn on_error(&self, _message: &str) {}
    fn on_info(&self, _message: &str) {}
}

/// Owned form of every callback, for consumers that prefer a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    ResultsChanged(Vec<String>),
    DownloadProgress { bytes_so_far: u64, total: u64 },
    UploadProgress { bytes_so_far: u64, total: u64 },
    Error(String),
    Info(String),
}

impl PeerEvents for mpsc::UnboundedSender<PeerEvent> {
    fn on_results_changed(&self, results: &[String]) {
        let _ = self.send(PeerEvent::ResultsChanged(results.to_vec()));
    }

    fn on_download_progress(&self, bytes_so_far: u64, total: u64) {
        let _ = self.send(PeerEvent::DownloadProgress { bytes_so_far, total });
    }

    fn on_upload_progress(&self, bytes_so_far: u64, total: u64) {
        let _ = self.send(PeerEvent::UploadProgress { bytes_so_far, total });
    }

    fn on_error(&self, message: &str) {
        let _ = self.send(PeerEvent::Error(message.to_string()));
    }

    fn on_info(&self, message: &str) {
        let _ = self.send(PeerEvent::Info(message.to_string()));
    }
}

/// Sends every event to the log; progress is left out to keep the log readable.
pub struct LogEvents;

impl PeerEvents for LogEvents {
    fn on_results_changed(&self, results: &[String]) {
        info!("Search results: {:?}", results);
    }

    fn on_error(&self, message: &str) {
        error!("{}", message);
    }

    fn on_info(&self, message: &str) {
        info!("{}", message);
    }
}
