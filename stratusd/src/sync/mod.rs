pub mod filter;
pub mod hash;
pub mod merge;
pub mod paths;
pub mod pool;
pub mod remote;
pub mod store;
pub mod task;
pub mod transfer;
pub mod watcher;

use std::path::PathBuf;

use self::filter::PathFilter;
use self::hash::HashCache;
use self::pool::TaskPool;
use self::remote::Remote;
use self::store::MetadataStore;
use self::transfer::TransferClient;
use self::watcher::WatchRegistry;

/// Shared state injected into every sync component. One instance per daemon,
/// always behind an `Arc`.
pub struct SyncContext {
    pub local_root: PathBuf,
    pub host_label: String,
    pub store: MetadataStore,
    pub filter: PathFilter,
    pub pool: TaskPool,
    pub remote: Remote,
    pub transfer: TransferClient,
    pub hashes: HashCache,
    pub watches: WatchRegistry,
}
