pub mod classify;
pub mod config;
pub mod errors;
pub mod fingerprint;
pub mod flakiness;
pub mod history;
pub mod identity;
pub mod ledger;
pub mod model;
pub mod normalize;
pub mod trend;

pub mod report;
pub mod scan;
pub mod storage;
