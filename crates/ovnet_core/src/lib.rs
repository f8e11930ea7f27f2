pub mod config;
pub mod logging;
pub mod sqlite;
pub mod store;

pub use config::{OverlayConfig, VXLAN_ID_END, VXLAN_ID_START};
pub use sqlite::SqliteStore;
pub use store::{DataScope, Datastore, KvPair, KvStore, MemoryStore, StoreError, Versioned};
