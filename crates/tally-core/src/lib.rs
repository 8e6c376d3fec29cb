//! Metering engine for tallyd
//!
//! This crate is the heart of tallyd, containing:
//! - Meters (counter, source, time) and their measuring sessions
//! - Gating (source initialization, condition, time window)
//! - Accounting periods with DST-aware reset boundaries
//! - Persisted records, including migration of legacy shapes

mod engine;
mod events;
mod gating;
mod meter;
mod period;
mod record;
mod series;

pub use engine::*;
pub use events::*;
pub use gating::*;
pub use meter::*;
pub use period::*;
pub use record::*;
pub use series::*;
