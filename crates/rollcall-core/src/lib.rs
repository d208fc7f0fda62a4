//! rollcall-core — Recognition-to-attendance pipeline.
//!
//! Matches encoder signatures against an in-memory gallery, smooths the
//! per-frame results for display, and turns confident matches into
//! once-per-day attendance records.

pub mod attendance;
pub mod gallery;
pub mod matcher;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod pipeline;
pub mod session;
pub mod smoother;
pub mod store;
pub mod throttle;
pub mod types;

pub use attendance::{
    AttendanceRecord, AttendanceRecorder, AttendanceStatus, DetectionMethod, RecordOutcome,
    ScheduleConfig,
};
pub use gallery::{Gallery, GalleryStats};
pub use matcher::{EuclideanMatcher, Matcher};
pub use pipeline::{
    EncoderError, FaceEncoder, FrameSource, Pipeline, PipelineError, PipelineStats, StepOutcome,
};
pub use session::{AttendanceCandidate, FrameReport, RecognitionConfig, Session};
pub use smoother::{SmoothingKey, TemporalSmoother};
pub use store::{AttendanceStore, GallerySource, ScheduleSource, StoreError};
pub use throttle::{FrameThrottle, ThrottleDecision};
pub use types::{DetectionEvent, GalleryEntry, Identity, IdentityId, MatchResult, Region, Signature};
