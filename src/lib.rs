//! tus Server Library
//!
//! Resumable upload server speaking the tus 1.0.0 protocol.
//!
//! # Features
//!
//! - **Resumable**: uploads grow chunk by chunk at a server-confirmed offset
//! - **Deferred Length**: the total size may be declared on a later PATCH
//! - **Concatenation**: partial uploads are merged into a final upload
//! - **Metadata**: `Upload-Metadata` pairs are stored and echoed on HEAD
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tus_server::{Config, FileStore, ProtocolHandler, TusServer, UploadRegistry};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let store = FileStore::open(&config.storage.directory).await?;
//!     let handler = ProtocolHandler::new(
//!         Arc::new(UploadRegistry::new()),
//!         Arc::new(store),
//!         config.server.base_path.clone(),
//!         config.tus.max_size,
//!     );
//!     TusServer::new(&config.server.address, handler).await?.run().await?;
//!     Ok(())
//! }
//! ```

pub mod concat;
pub mod config;
pub mod logging;
pub mod metadata;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod storage;

// Re-export commonly used types
pub use config::Config;
pub use protocol::ProtocolHandler;
pub use registry::UploadRegistry;
pub use server::TusServer;
pub use storage::{FileStore, UploadStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
