pub mod schema;
pub mod store;

pub use store::{ProcessedSource, ScanCommit, ScanWrite, Store, StoreStats};
