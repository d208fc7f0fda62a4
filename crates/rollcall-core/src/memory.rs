//! In-memory datastore for tests. Enabled by the `testing` feature.

use crate::attendance::{AttendanceRecord, DetectionMethod, ScheduleConfig};
use crate::store::{AttendanceStore, GallerySource, ScheduleSource, StoreError};
use crate::types::{GalleryEntry, IdentityId};
use chrono::NaiveDate;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Mirrors the SQLite store's semantics, including the face-method uniqueness rule.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<Vec<GalleryEntry>>,
    records: Mutex<Vec<AttendanceRecord>>,
    schedule: Mutex<Option<ScheduleConfig>>,
    fail_writes: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    pub fn with_schedule(schedule: ScheduleConfig) -> Self {
        let store = Self::default();
        store.set_schedule(Some(schedule));
        store
    }

    pub fn with_entries(entries: Vec<GalleryEntry>) -> Self {
        let store = Self::default();
        *lock(&store.entries) = entries;
        store
    }

    pub fn set_entries(&self, entries: Vec<GalleryEntry>) {
        *lock(&self.entries) = entries;
    }

    pub fn set_schedule(&self, schedule: Option<ScheduleConfig>) {
        *lock(&self.schedule) = schedule;
    }

    /// Make every subsequent `insert` fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<AttendanceRecord> {
        lock(&self.records).clone()
    }
}

impl GallerySource for MemoryStore {
    fn load_all_signatures(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        Ok(lock(&self.entries).clone())
    }
}

impl AttendanceStore for MemoryStore {
    fn exists(
        &self,
        identity: IdentityId,
        date: NaiveDate,
        method: DetectionMethod,
    ) -> Result<bool, StoreError> {
        Ok(lock(&self.records)
            .iter()
            .any(|r| r.identity == identity && r.date == date && r.method == method))
    }

    fn insert(&self, record: &AttendanceRecord) -> Result<bool, StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::failed("insert_attendance", "write failure injected"));
        }
        let mut records = lock(&self.records);
        let duplicate = record.method == DetectionMethod::Face
            && records.iter().any(|r| {
                r.identity == record.identity && r.date == record.date && r.method == record.method
            });
        if duplicate {
            return Ok(false);
        }
        records.push(record.clone());
        Ok(true)
    }
}

impl ScheduleSource for MemoryStore {
    fn read_schedule(&self) -> Result<Option<ScheduleConfig>, StoreError> {
        Ok(*lock(&self.schedule))
    }
}
