use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DownloadError>;

/// Errors delivered to the caller of a download.
///
/// None of these are raised for host downloads the library did not start;
/// those are ignored by the correlator.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The probe failed before or while receiving response headers
    #[error("request for {url} failed ({message}), intended destination {path:?}")]
    Transport {
        url: String,
        path: PathBuf,
        message: String,
    },

    /// The host stopped the download before it completed
    #[error("The download of {filename} was interrupted")]
    Interrupted {
        filename: String,
        url: String,
        path: PathBuf,
    },

    /// Some items of a bulk download failed
    #[error("{failed} downloads failed")]
    Aggregate { failed: usize },

    #[error("a download for {url} is already in flight")]
    AlreadyInFlight { url: String },

    #[error("invalid url {url}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("no host window is available to start the download")]
    NoWindow,

    #[error("download of {url} timed out")]
    Timeout { url: String },

    #[error("download of {url} was cancelled")]
    Cancelled { url: String },

    #[error("invalid download options: {0}")]
    Options(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    /// The url the error refers to, when it is about a single download.
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Transport { url, .. }
            | Self::Interrupted { url, .. }
            | Self::AlreadyInFlight { url }
            | Self::InvalidUrl { url, .. }
            | Self::Timeout { url }
            | Self::Cancelled { url } => Some(url),
            _ => None,
        }
    }
}
