pub mod cache;
pub mod catalog;
pub mod config;
pub mod defrag;
pub mod device;
pub mod engine;
pub mod error;
pub mod namespace;
pub mod recovery;
pub mod scheduler;
pub mod tapeops;
pub mod writeback;

pub use cache::CacheStore;
pub use catalog::{
    load_catalog, save_catalog, Catalog, CatalogContents, ExtentRef, FileRecord, FileState,
    TapeId, TapeRecord, TapeStatus,
};
pub use config::{get_config_path, load_config, save_config, Config};
pub use engine::{Engine, StatusReport};
pub use error::{Result, TapeVaultError};
pub use namespace::Namespace;
pub use recovery::{Recovery, RecoverySummary};
pub use scheduler::{DriveScheduler, DriveSession, Priority};
