//! Clinic database access and sync watermarks.

pub mod memory;
pub mod pg;
pub mod store;

pub use memory::MemorySourceStore;
pub use pg::{connect_pool, PgSourceStore, PgTokenStore};
pub use store::{watermark, SourceStore, SyncStateRow};
