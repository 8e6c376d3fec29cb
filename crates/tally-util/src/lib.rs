//! Shared utilities for tallyd
//!
//! This crate provides:
//! - ID types (MeterId, SeriesId, ClientId)
//! - Clock abstraction and the time-window predicate
//! - Cron recurrence evaluation for reset periods
//! - Error types
//! - Default paths for the config file, socket and data directory

mod error;
mod ids;
mod paths;
mod schedule;
mod time;

pub use error::*;
pub use ids::*;
pub use paths::*;
pub use schedule::*;
pub use time::*;
