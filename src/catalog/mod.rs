pub mod persist;
pub mod store;
pub mod types;

pub use persist::{catalog_path, load_catalog, save_catalog};
pub use store::{Catalog, CatalogContents};
pub use types::{ExtentRef, FileRecord, FileState, TapeId, TapeRecord, TapeStatus};
