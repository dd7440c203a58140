pub mod config;
pub mod download;
pub mod error;
pub mod host;

// Re-export commonly used types for easier access in tests
pub use config::ConfigManager;
pub use download::{
    BulkReport, BulkRequest, DownloadOptions, DownloadRequest, Downloader, ProgressInfo,
    RegisterOptions, ResultInfo, Subscription,
};
pub use error::DownloadError;
pub use host::HttpSession;
