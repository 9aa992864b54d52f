pub mod config;
pub mod error;
pub mod types;

pub use config::{EngineConfig, SinkBackend};
pub use error::SyncError;
pub use types::*;
