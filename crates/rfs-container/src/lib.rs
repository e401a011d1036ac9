#![forbid(unsafe_code)]
//! Ordered containers shared by the RescueFS core.
//!
//! `RangeMap` holds non-overlapping extents keyed by start position,
//! `IntervalMap` holds possibly-overlapping closed intervals, and
//! `PinnedCache` is the fixed-capacity LRU with pin counting that backs
//! the node cache.

mod cache;
mod interval;
mod range;

pub use cache::{CacheSource, PinnedCache};
pub use interval::IntervalMap;
pub use range::{RangeExt, RangeMap, RangeOverlap};
