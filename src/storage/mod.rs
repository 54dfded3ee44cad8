pub mod traits;
pub mod memory;
pub mod sql;
#[cfg(feature = "duckdb")]
pub mod duckdb;

pub use traits::{BatchWriteResult, RecordStore, RecordWrite, StorageError, StoredRecord};
pub use memory::InMemoryStore;
pub use sql::SqlStore;
#[cfg(feature = "duckdb")]
pub use self::duckdb::DuckDbStore;
