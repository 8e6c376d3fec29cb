//! Store trait definitions

use serde_json::Value;
use tally_util::SeriesId;

use crate::{AuditEvent, StoreResult};

/// Main store trait
///
/// Series records are opaque to the store: it keeps whatever JSON document the
/// engine hands it and gives it back unchanged.
pub trait Store: Send + Sync {
    // Audit log

    /// Append an audit event
    fn append_audit(&self, event: AuditEvent) -> StoreResult<()>;

    /// Get recent audit events, newest first
    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>>;

    // Series records

    /// Load the last saved record of a series
    fn load_record(&self, series_id: &SeriesId) -> StoreResult<Option<Value>>;

    /// Save (replace) the record of a series
    fn save_record(&self, series_id: &SeriesId, record: &Value) -> StoreResult<()>;

    /// Drop the record of a series that is no longer configured
    fn delete_record(&self, series_id: &SeriesId) -> StoreResult<()>;

    /// IDs of every series with a saved record
    fn list_records(&self) -> StoreResult<Vec<SeriesId>>;

    // Health

    /// Check if store is healthy
    fn is_healthy(&self) -> bool;
}
