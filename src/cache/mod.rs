pub mod tag_index;
pub mod tagset_cache;
pub mod ttl_lru;

pub use tag_index::TagIndex;
pub use tagset_cache::TagsetCache;
pub use ttl_lru::{TagsetKey, TtlLru};
