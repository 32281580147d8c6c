//! Application state module
//! Shared, read-only state handed to every connection task

use std::path::PathBuf;

use super::types::Config;
use crate::handler::upload::UploadHandler;
use crate::storage::Storage;

/// Application state
pub struct AppState {
    pub config: Config,
    /// Upload endpoint bound to the storage directory created at startup
    pub uploads: UploadHandler,
    /// Static asset root
    pub public_dir: PathBuf,
}

impl AppState {
    pub fn new(config: &Config, storage: Storage) -> Self {
        Self {
            config: config.clone(),
            uploads: UploadHandler::new(storage, &config.storage, config.http.max_body_size),
            public_dir: PathBuf::from(&config.storage.public_dir),
        }
    }

    pub const fn access_log_enabled(&self) -> bool {
        self.config.logging.access_log
    }
}
