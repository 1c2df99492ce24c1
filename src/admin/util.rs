use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::persist::{DatabaseRegistry, DATABASES_STORE_NAME};
use crate::primitives::kv::{KvProvider, SqliteKvProvider};
use crate::storage::dag::DagStore;

use crate::admin::error::{AdminError, Result};
use crate::admin::options::AdminOpenOptions;

/// Handle over one named store inside a data directory.
pub struct StoreHandle {
    /// Provider rooted at the data directory.
    pub provider: SqliteKvProvider,
    /// The durable chunk store.
    pub store: Arc<DagStore>,
}

/// Opens the provider for `data_dir`.
///
/// # Errors
///
/// Returns an error if the directory doesn't exist and `create_if_missing` is false.
pub fn open_provider(data_dir: &Path, opts: &AdminOpenOptions) -> Result<SqliteKvProvider> {
    if !data_dir.exists() {
        if opts.create_if_missing {
            fs::create_dir_all(data_dir)?;
        } else {
            return Err(AdminError::missing_database(data_dir));
        }
    }
    Ok(SqliteKvProvider::new(data_dir))
}

/// Opens the durable store called `name` inside `data_dir`.
///
/// # Errors
///
/// Returns an error if the store file doesn't exist and `create_if_missing`
/// is false, or if opening it fails.
pub fn open_store(data_dir: &Path, name: &str, opts: &AdminOpenOptions) -> Result<StoreHandle> {
    let provider = open_provider(data_dir, opts)?;
    let path = provider.path_for(name)?;
    if !path.exists() && !opts.create_if_missing {
        return Err(AdminError::missing_database(path));
    }
    let store = Arc::new(DagStore::new(provider.open(name)?));
    Ok(StoreHandle { provider, store })
}

/// Opens the database registry of `data_dir` without creating it.
pub fn open_registry(data_dir: &Path, opts: &AdminOpenOptions) -> Result<Option<DatabaseRegistry>> {
    let provider = open_provider(data_dir, opts)?;
    if !provider.path_for(DATABASES_STORE_NAME)?.exists() && !opts.create_if_missing {
        return Ok(None);
    }
    Ok(Some(DatabaseRegistry::open(&provider)?))
}
