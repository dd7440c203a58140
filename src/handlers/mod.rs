pub mod config;
pub mod get;

pub use config::handle_config;
pub use get::handle_get;
