pub mod hot_data;
pub mod memory;
pub mod snapshot;
pub mod store;

pub use hot_data::HotDataLedger;
pub use memory::InMemoryCacheStore;
pub use snapshot::TokenSnapshotStore;
pub use store::{CacheStore, RedisCacheStore};
