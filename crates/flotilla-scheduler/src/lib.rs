//! flotilla-scheduler — offers in, launches out.
//!
//! The [`OfferMatcher`] walks the launch queue against each incoming
//! offer, honoring placement constraints, launch backoff, port
//! requirements and resource arithmetic. The [`SchedulerLoop`] is the
//! single coordinator that serializes every externally driven
//! mutation: offers, status updates, reconciliation and driver
//! lifecycle events.

pub mod constraints;
pub mod matcher;
pub mod scheduler;

pub use constraints::meets_constraints;
pub use matcher::{MatchedLaunch, MatcherConfig, OfferMatcher};
pub use scheduler::{SchedulerConfig, SchedulerEvent, SchedulerLoop};
