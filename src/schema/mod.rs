//! Unified pulse.sources.v1 input schema
//!
//! One document carries a region and every source series fetched for it.
//! Sources that failed upstream are still listed, with the reason, so the
//! harmonizer can account for them.

mod adapter;
mod sources;

pub use adapter::*;
pub use sources::*;
