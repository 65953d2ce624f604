//! Storage-engine entry points consumed by the import worker.
//!
//! The engine that actually executes imports is opaque to this crate;
//! everything it offers is reached through [`StorageEngine`].

use crate::nvlist::NvList;
use thiserror::Error;

/// Location of the boot dataset within an imported pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bootfs {
    pub pool_name: String,
    /// Dataset object id, resolved to a name via
    /// [`StorageEngine::dataset_name`].
    pub object_id: u64,
}

pub trait StorageEngine: Send + Sync {
    /// Stateless canonicalization of an assembled pool configuration.
    /// Returns `None` when the engine cannot make sense of it; the input
    /// is left untouched either way.
    fn try_import(&self, config: &NvList) -> Option<NvList>;

    /// Import the pool described by `config`. Not interruptible; callers
    /// must finish a started call before acting on termination.
    fn import(&self, pool_name: &str, config: &NvList) -> Result<(), EngineError>;

    /// Boot dataset of the first imported pool, if one is set.
    fn bootfs(&self) -> Option<Bootfs>;

    /// Resolve a dataset object id to its full name. Implementations
    /// serialize this with their own namespace lock.
    fn dataset_name(&self, pool_name: &str, object_id: u64) -> Result<String, EngineError>;

    /// Register the mount-root entry point with the engine. Called once,
    /// after a successful import and before the boot device is published.
    fn hijack_mountroot(&self);
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("import failed with code {code}")]
    Import { code: i32 },
    #[error("no dataset with object id {object_id} in pool {pool}")]
    UnknownDataset { pool: String, object_id: u64 },
    #[error("engine rejected configuration: {0}")]
    Rejected(String),
}
