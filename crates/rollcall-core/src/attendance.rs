//! Attendance records, schedule classification and the once-per-day recorder.

use crate::store::{AttendanceStore, ScheduleSource, StoreError};
use crate::types::IdentityId;
use chrono::{Duration, Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Channel through which an attendance was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMethod {
    Face,
    Qr,
    Manual,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Face => "face",
            Self::Qr => "qr",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "face" => Ok(Self::Face),
            "qr" => Ok(Self::Qr),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown detection method: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Late,
    /// Only assigned by manual marking; the face path never produces it.
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Late => "late",
            Self::Absent => "absent",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "present" => Ok(Self::Present),
            "late" => Ok(Self::Late),
            "absent" => Ok(Self::Absent),
            other => Err(format!("unknown attendance status: {other}")),
        }
    }
}

/// A durable attendance row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub identity: IdentityId,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub method: DetectionMethod,
    pub status: AttendanceStatus,
    pub confidence: f32,
}

/// Scheduled entry time plus grace period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub entry_time: NaiveTime,
    pub tolerance_minutes: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            entry_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap_or_default(),
            tolerance_minutes: 15,
        }
    }
}

impl ScheduleConfig {
    /// Last instant on `date` that still counts as on time.
    pub fn cutoff(&self, date: NaiveDate) -> NaiveDateTime {
        date.and_time(self.entry_time) + Duration::minutes(i64::from(self.tolerance_minutes))
    }

    /// Present up to and including the cutoff, late afterwards.
    pub fn classify(&self, now: NaiveDateTime) -> AttendanceStatus {
        if now <= self.cutoff(now.date()) {
            AttendanceStatus::Present
        } else {
            AttendanceStatus::Late
        }
    }
}

/// What a call to [`AttendanceRecorder::record`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded(AttendanceStatus),
    AlreadyRecorded,
}

/// Writes at most one attendance row per identity, day and method.
pub struct AttendanceRecorder<S> {
    store: S,
}

impl<S: AttendanceStore + ScheduleSource> AttendanceRecorder<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Record attendance at the current local time.
    pub fn record(
        &self,
        identity: IdentityId,
        confidence: f32,
        method: DetectionMethod,
    ) -> Result<RecordOutcome, StoreError> {
        self.record_at(identity, confidence, method, Local::now().naive_local())
    }

    /// Record attendance as if the wall clock read `now`.
    pub fn record_at(
        &self,
        identity: IdentityId,
        confidence: f32,
        method: DetectionMethod,
        now: NaiveDateTime,
    ) -> Result<RecordOutcome, StoreError> {
        let date = now.date();
        if self.store.exists(identity, date, method)? {
            tracing::trace!(%identity, %date, %method, "attendance already recorded");
            return Ok(RecordOutcome::AlreadyRecorded);
        }

        let status = match self.store.read_schedule()? {
            Some(schedule) => schedule.classify(now),
            None => {
                tracing::warn!("no schedule configured; classifying as present");
                AttendanceStatus::Present
            }
        };

        let record = AttendanceRecord {
            identity,
            date,
            time: now.time().with_nanosecond(0).unwrap_or(now.time()),
            method,
            status,
            confidence,
        };

        if !self.store.insert(&record)? {
            // Lost a race against another writer; the unique index kept one row.
            tracing::debug!(%identity, %date, %method, "duplicate attendance rejected by store");
            return Ok(RecordOutcome::AlreadyRecorded);
        }

        tracing::info!(%identity, %date, %method, %status, confidence, "attendance recorded");
        Ok(RecordOutcome::Recorded(status))
    }
}
