//! Strategies injected into the plumber: which rows to accept and how to version buckets.

mod rejection;
mod versioning;

pub use rejection::RejectionPolicy;
pub use versioning::{VersionFn, VersioningPolicy};
