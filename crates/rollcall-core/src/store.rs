//! Datastore contracts consumed by the pipeline.
//!
//! The core never owns a storage engine; `rollcalld` provides the SQLite
//! implementation and tests provide in-memory fakes.

use crate::attendance::{AttendanceRecord, DetectionMethod, ScheduleConfig};
use crate::types::{GalleryEntry, IdentityId};
use chrono::NaiveDate;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("{operation} failed: {cause}")]
    OperationFailed { operation: String, cause: String },
    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
}

impl StoreError {
    pub fn failed(operation: &str, cause: impl ToString) -> Self {
        Self::OperationFailed {
            operation: operation.to_string(),
            cause: cause.to_string(),
        }
    }
}

/// Source of enrolled signatures for the gallery.
pub trait GallerySource {
    /// Every (identity, signature) pair of active identities, in a stable order.
    fn load_all_signatures(&self) -> Result<Vec<GalleryEntry>, StoreError>;
}

/// Persistence for attendance rows.
pub trait AttendanceStore {
    fn exists(
        &self,
        identity: IdentityId,
        date: NaiveDate,
        method: DetectionMethod,
    ) -> Result<bool, StoreError>;

    /// Insert a record. Returns `false` when the storage layer rejected it as
    /// a duplicate of an existing (identity, date, method) row.
    fn insert(&self, record: &AttendanceRecord) -> Result<bool, StoreError>;
}

/// Read access to the schedule singleton.
pub trait ScheduleSource {
    /// `None` when no schedule has been configured.
    fn read_schedule(&self) -> Result<Option<ScheduleConfig>, StoreError>;
}
