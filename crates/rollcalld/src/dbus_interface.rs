use crate::monitor::{MonitorError, MonitorHandle};
use crate::store::{IdentityUpdate, NewIdentity, SqliteStore};
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use rollcall_core::{AttendanceStatus, IdentityId, ScheduleConfig, ScheduleSource, Signature, StoreError};
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Monitor1";
pub const OBJECT_PATH: &str = "/org/rollcall/Monitor1";

/// D-Bus interface for the rollcall attendance daemon.
///
/// Bus name: org.rollcall.Monitor1
/// Object path: /org/rollcall/Monitor1
pub struct RollcallService {
    monitor: MonitorHandle,
    store: SqliteStore,
}

impl RollcallService {
    pub fn new(monitor: MonitorHandle, store: SqliteStore) -> Self {
        Self { monitor, store }
    }

    /// Run a datastore operation off the async executor.
    async fn with_store<T, F>(&self, op: F) -> zbus::fdo::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("datastore task failed: {e}")))?
            .map_err(store_error)
    }
}

fn store_error(e: StoreError) -> zbus::fdo::Error {
    tracing::warn!(error = %e, "datastore request failed");
    zbus::fdo::Error::Failed(e.to_string())
}

fn monitor_error(e: MonitorError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

/// Empty means today.
fn parse_date(date: &str) -> zbus::fdo::Result<NaiveDate> {
    if date.is_empty() {
        return Ok(Local::now().date_naive());
    }
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("date {date:?}: {e}")))
}

/// Date and whole-second time for a manual mark made at `now`.
/// An empty `date` means the day of `now`.
fn mark_moment(date: &str, now: NaiveDateTime) -> zbus::fdo::Result<(NaiveDate, NaiveTime)> {
    let day = if date.is_empty() { now.date() } else { parse_date(date)? };
    let time = now.time().with_nanosecond(0).unwrap_or(now.time());
    Ok((day, time))
}

/// D-Bus has no optional strings; empty stands for "not given".
fn optional(text: String) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Zero stands for "not given".
fn optional_age(age: u32) -> Option<u32> {
    (age > 0).then_some(age)
}

fn parse_time(time: &str) -> zbus::fdo::Result<NaiveTime> {
    NaiveTime::parse_from_str(time, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(time, "%H:%M"))
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("time {time:?}: {e}")))
}

#[interface(name = "org.rollcall.Monitor1")]
impl RollcallService {
    /// Return monitoring status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.monitor.status().await.map_err(monitor_error)?;
        to_json(&status)
    }

    /// Reload the gallery from the datastore; returns the new stats as JSON.
    async fn reload_gallery(&self) -> zbus::fdo::Result<String> {
        tracing::info!("reload requested");
        let stats = self.monitor.reload().await.map_err(monitor_error)?;
        to_json(&stats)
    }

    /// Process every `every`-th frame. Returns the value in effect.
    async fn set_frame_skip(&self, every: u32) -> zbus::fdo::Result<u32> {
        if every == 0 {
            return Err(zbus::fdo::Error::InvalidArgs("frame skip must be at least 1".into()));
        }
        self.monitor.set_frame_skip(every).await.map_err(monitor_error)
    }

    /// End the monitoring session; the daemon exits once the loop stops.
    async fn stop(&self) -> zbus::fdo::Result<()> {
        tracing::info!("stop requested over D-Bus");
        self.monitor.stop().await.map_err(monitor_error)
    }

    /// Enroll a new identity. Returns its id and roster code.
    ///
    /// An empty `code` is auto-assigned; empty `section` and zero `age`
    /// are left unset.
    async fn add_identity(
        &self,
        display_name: String,
        code: String,
        section: String,
        age: u32,
    ) -> zbus::fdo::Result<(i64, String)> {
        tracing::info!(name = %display_name, "add_identity requested");
        let new = NewIdentity {
            display_name,
            code: optional(code),
            section: optional(section),
            age: optional_age(age),
        };
        let (id, code) = self.with_store(move |s| s.add_identity(&new)).await?;
        Ok((id.0, code))
    }

    /// Edit roster fields. Empty strings and zero age leave a field unchanged.
    async fn update_identity(
        &self,
        identity_id: i64,
        display_name: String,
        code: String,
        section: String,
        age: u32,
    ) -> zbus::fdo::Result<bool> {
        tracing::info!(identity = identity_id, "update_identity requested");
        let update = IdentityUpdate {
            display_name: optional(display_name),
            code: optional(code),
            section: optional(section),
            age: optional_age(age),
        };
        self.with_store(move |s| s.update_identity(IdentityId(identity_id), &update))
            .await
    }

    /// Active identity with roster `code` as JSON (`null` when none).
    async fn find_identity(&self, code: String) -> zbus::fdo::Result<String> {
        let found = self.with_store(move |s| s.find_by_code(&code)).await?;
        to_json(&found)
    }

    /// Attach an enrollment signature. Takes effect after `ReloadGallery`.
    async fn add_signature(&self, identity_id: i64, signature: Vec<f64>) -> zbus::fdo::Result<i64> {
        let signature = Signature::new(signature.into_iter().map(|v| v as f32).collect());
        self.with_store(move |s| s.add_signature(IdentityId(identity_id), &signature))
            .await
    }

    /// Exclude an identity from future gallery loads.
    async fn deactivate_identity(&self, identity_id: i64) -> zbus::fdo::Result<bool> {
        tracing::info!(identity = identity_id, "deactivate_identity requested");
        self.with_store(move |s| s.deactivate_identity(IdentityId(identity_id)))
            .await
    }

    /// List enrolled identities as JSON.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let identities = self.with_store(|s| s.list_identities()).await?;
        to_json(&identities)
    }

    /// Attendance rows for `date` (YYYY-MM-DD, empty for today) as JSON.
    async fn attendance(&self, date: &str) -> zbus::fdo::Result<String> {
        let date = parse_date(date)?;
        let rows = self.with_store(move |s| s.attendance_on(date)).await?;
        to_json(&rows)
    }

    /// Manually mark attendance on `date` (YYYY-MM-DD, empty for today)
    /// at the current time of day.
    async fn mark_attendance(
        &self,
        identity_id: i64,
        status: &str,
        date: &str,
    ) -> zbus::fdo::Result<()> {
        let status: AttendanceStatus = status
            .parse()
            .map_err(zbus::fdo::Error::InvalidArgs)?;
        let (date, time) = mark_moment(date, Local::now().naive_local())?;
        self.with_store(move |s| s.mark_manual(IdentityId(identity_id), date, time, status))
            .await
    }

    /// Dashboard numbers for today as JSON.
    async fn summary(&self) -> zbus::fdo::Result<String> {
        let today = Local::now().date_naive();
        let summary = self.with_store(move |s| s.summary(today)).await?;
        to_json(&summary)
    }

    /// Active identities as CSV with a header row.
    async fn export_roster(&self) -> zbus::fdo::Result<String> {
        self.with_store(|s| s.export_roster_csv()).await
    }

    /// Current schedule as JSON (`null` when unset).
    async fn get_schedule(&self) -> zbus::fdo::Result<String> {
        let schedule = self.with_store(|s| s.read_schedule()).await?;
        to_json(&schedule)
    }

    /// Set the class entry time (HH:MM[:SS]) and tolerance in minutes.
    async fn set_schedule(&self, entry_time: &str, tolerance_minutes: u32) -> zbus::fdo::Result<()> {
        let schedule = ScheduleConfig {
            entry_time: parse_time(entry_time)?,
            tolerance_minutes,
        };
        self.with_store(move |s| s.write_schedule(&schedule)).await
    }

    /// Remove the schedule; every arrival then counts as present.
    async fn clear_schedule(&self) -> zbus::fdo::Result<()> {
        tracing::info!("clear_schedule requested");
        self.with_store(|s| s.clear_schedule()).await
    }
}
