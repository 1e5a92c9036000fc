//! Database module: local queue storage and the response cache.
//!
//! - `model`: view models returned by queries.
//! - `repo`: pool setup and the offline form queue.
//! - `cache`: rows of the two-bucket response cache.
//!
//! The queue API is re-exported at `crate::db::*`.

pub mod cache;
pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{CachedBody, EntrySummary, StatusCounts};
