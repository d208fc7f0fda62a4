//! The monitoring loop: acquire → throttle → detect/encode → match →
//! smooth → record, one frame per step.

use crate::attendance::{AttendanceRecorder, DetectionMethod, RecordOutcome};
use crate::session::{FrameReport, Session};
use crate::store::{AttendanceStore, ScheduleSource};
use crate::throttle::ThrottleDecision;
use crate::types::DetectionEvent;
use serde::Serialize;
use std::fmt::Display;
use std::ops::ControlFlow;
use std::time::Instant;
use thiserror::Error;

/// Consecutive acquisition failures tolerated before the session ends.
pub const DEFAULT_MAX_CAMERA_FAILURES: u32 = 3;

/// A camera or other frame producer.
pub trait FrameSource {
    type Frame;
    type Error: Display;

    fn acquire_frame(&mut self) -> Result<Self::Frame, Self::Error>;
}

/// The external face detector + signature encoder.
pub trait FaceEncoder<F> {
    /// Zero detections is a valid result.
    fn detect_and_encode(&mut self, frame: &F) -> Result<Vec<DetectionEvent>, EncoderError>;
}

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("encoder unavailable: {0}")]
    Unavailable(String),
    #[error("encoder failed: {0}")]
    Failed(String),
    #[error("malformed encoder output: {0}")]
    Protocol(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("camera failed {failures} consecutive times: {last_error}")]
    CameraUnavailable { failures: u32, last_error: String },
}

/// What a single [`Pipeline::step`] did.
#[derive(Debug)]
pub enum StepOutcome {
    AcquireFailed { consecutive: u32 },
    Skipped,
    EncoderFailed,
    Processed(FrameReport),
}

/// Running counters for status reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub frames_seen: u64,
    pub frames_processed: u64,
    pub acquire_failures: u64,
    pub encoder_failures: u64,
    pub records_written: u64,
    pub store_failures: u64,
    pub last_recognized: usize,
    pub last_total: usize,
}

pub struct Pipeline<S, E, A> {
    source: S,
    encoder: E,
    session: Session,
    recorder: AttendanceRecorder<A>,
    max_failures: u32,
    consecutive_failures: u32,
    stats: PipelineStats,
}

impl<S, E, A> Pipeline<S, E, A>
where
    S: FrameSource,
    E: FaceEncoder<S::Frame>,
    A: AttendanceStore + ScheduleSource,
{
    pub fn new(source: S, encoder: E, session: Session, recorder: AttendanceRecorder<A>) -> Self {
        Self {
            source,
            encoder,
            session,
            recorder,
            max_failures: DEFAULT_MAX_CAMERA_FAILURES,
            consecutive_failures: 0,
            stats: PipelineStats::default(),
        }
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures.max(1);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn recorder(&self) -> &AttendanceRecorder<A> {
        &self.recorder
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            frames_seen: self.session.frames_seen(),
            ..self.stats.clone()
        }
    }

    /// Consume the pipeline, returning the frame source so callers can
    /// release it explicitly.
    pub fn into_source(self) -> S {
        self.source
    }

    /// Run one loop iteration.
    ///
    /// Only repeated acquisition failure is an error; encoder and datastore
    /// failures are logged and the loop carries on.
    pub fn step(&mut self) -> Result<StepOutcome, PipelineError> {
        let frame = match self.source.acquire_frame() {
            Ok(frame) => {
                self.consecutive_failures = 0;
                frame
            }
            Err(e) => {
                self.consecutive_failures += 1;
                self.stats.acquire_failures += 1;
                tracing::warn!(
                    error = %e,
                    consecutive = self.consecutive_failures,
                    "frame acquisition failed"
                );
                if self.consecutive_failures >= self.max_failures {
                    return Err(PipelineError::CameraUnavailable {
                        failures: self.consecutive_failures,
                        last_error: e.to_string(),
                    });
                }
                return Ok(StepOutcome::AcquireFailed {
                    consecutive: self.consecutive_failures,
                });
            }
        };

        if self.session.next_frame() == ThrottleDecision::Skip {
            return Ok(StepOutcome::Skipped);
        }

        let detections = match self.encoder.detect_and_encode(&frame) {
            Ok(d) => d,
            Err(e) => {
                self.stats.encoder_failures += 1;
                tracing::warn!(error = %e, "detect/encode failed; skipping frame");
                return Ok(StepOutcome::EncoderFailed);
            }
        };

        let report = self.session.process_detections(&detections, Instant::now());
        self.stats.frames_processed += 1;
        self.stats.last_recognized = report.recognized();
        self.stats.last_total = report.total();

        for candidate in &report.eligible {
            match self
                .recorder
                .record(candidate.identity, candidate.confidence, DetectionMethod::Face)
            {
                Ok(RecordOutcome::Recorded(_)) => self.stats.records_written += 1,
                Ok(RecordOutcome::AlreadyRecorded) => {}
                Err(e) => {
                    self.stats.store_failures += 1;
                    tracing::warn!(identity = %candidate.identity, error = %e, "attendance not recorded");
                }
            }
        }

        Ok(StepOutcome::Processed(report))
    }

    /// Step until `control` breaks or the camera gives out.
    ///
    /// `control` runs before every frame and may mutate the pipeline
    /// (reload the gallery, change the throttle).
    pub fn run<F>(&mut self, mut control: F) -> Result<PipelineStats, PipelineError>
    where
        F: FnMut(&mut Self) -> ControlFlow<()>,
    {
        loop {
            if control(self).is_break() {
                return Ok(self.stats());
            }
            self.step()?;
        }
    }
}
