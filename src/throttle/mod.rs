//! Throttling
//!
//! Multi-tier admission control for file I/O:
//!
//! - [`SlidingWindowCounter`] - rolling sum over a time window with a rate limit
//! - [`Tier`] - concurrency semaphore plus iops and throughput counters
//! - [`Admission`] - one call's reservation across a combined and a directional tier
//! - [`ThrottledFile`] - [`AsyncFile`](crate::file::AsyncFile) decorator applying all of the above

mod admission;
mod file;
mod tier;
mod window;

pub use admission::Admission;
pub use file::ThrottledFile;
pub use tier::Tier;
pub use window::SlidingWindowCounter;
