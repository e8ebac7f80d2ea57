//! Persistence layer — libSQL-backed storage for jobs, sessions and steering.

pub mod libsql_backend;
pub mod migrations;
pub mod retry;
pub mod traits;

use std::path::Path;
use std::sync::Arc;

pub use libsql_backend::LibSqlBackend;
pub use retry::{RetryPolicy, with_retry};
pub use traits::{Database, IndexEntry, KeyCounts};

use crate::error::DatabaseError;

/// Open the database at `path` (or in memory for `:memory:`) behind the trait object.
pub async fn open(path: &Path) -> Result<Arc<dyn Database>, DatabaseError> {
    let backend = if path.as_os_str() == ":memory:" {
        LibSqlBackend::new_memory().await?
    } else {
        LibSqlBackend::new_local(path).await?
    };
    Ok(Arc::new(backend))
}
