//! flotilla-queue — launches waiting for offers.
//!
//! The [`LaunchQueue`] holds one entry per pending task launch; the
//! [`RateLimiter`] delays relaunches of flapping apps with per-app
//! exponential backoff. Both are consulted by the offer matcher on
//! every incoming offer.

pub mod limiter;
pub mod queue;

pub use limiter::RateLimiter;
pub use queue::{LaunchQueue, QueuedLaunch};
