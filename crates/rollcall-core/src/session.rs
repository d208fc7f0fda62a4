//! One monitoring session: gallery, throttle and smoothing history.

use crate::gallery::{Gallery, GalleryStats};
use crate::matcher::{EuclideanMatcher, Matcher};
use crate::smoother::{SmootherConfig, SmoothingKey, TemporalSmoother};
use crate::store::{GallerySource, StoreError};
use crate::throttle::{FrameThrottle, ThrottleDecision};
use crate::types::{DetectionEvent, IdentityId, MatchResult};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Recognition tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    /// A face is known when its nearest distance is below this.
    pub match_threshold: f32,
    /// A known face is eligible for attendance when confidence exceeds this.
    pub attendance_threshold: f32,
    /// Process one of every N frames.
    pub frame_skip: u32,
    pub smoothing_key: SmoothingKey,
    pub history_len: usize,
    pub stale_secs: f64,
    pub min_observations: u32,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            match_threshold: 0.6,
            attendance_threshold: 0.6,
            frame_skip: 2,
            smoothing_key: SmoothingKey::Identity,
            history_len: 5,
            stale_secs: 3.0,
            min_observations: 2,
        }
    }
}

impl RecognitionConfig {
    pub fn smoother(&self) -> SmootherConfig {
        SmootherConfig {
            key: self.smoothing_key,
            history_len: self.history_len,
            staleness: Duration::try_from_secs_f64(self.stale_secs)
                .unwrap_or(Duration::from_secs(3)),
            min_observations: self.min_observations,
        }
    }
}

/// A known face that qualifies for an attendance write.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AttendanceCandidate {
    pub identity: IdentityId,
    pub confidence: f32,
}

/// Everything one processed frame produced.
#[derive(Debug, Clone, Default)]
pub struct FrameReport {
    /// Raw match results, one per detection.
    pub matches: Vec<MatchResult>,
    /// Stabilized list for display.
    pub display: Vec<MatchResult>,
    /// Identities to record, at most once each.
    pub eligible: Vec<AttendanceCandidate>,
}

impl FrameReport {
    pub fn total(&self) -> usize {
        self.matches.len()
    }

    pub fn recognized(&self) -> usize {
        self.matches.iter().filter(|m| m.is_known()).count()
    }
}

/// Owns all mutable recognition state for one monitoring run.
pub struct Session<M = EuclideanMatcher> {
    config: RecognitionConfig,
    gallery: Gallery,
    throttle: FrameThrottle,
    smoother: TemporalSmoother,
    matcher: M,
}

impl Session {
    pub fn new(config: RecognitionConfig, gallery: Gallery) -> Self {
        Self::with_matcher(config, gallery, EuclideanMatcher)
    }
}

impl<M: Matcher> Session<M> {
    pub fn with_matcher(config: RecognitionConfig, gallery: Gallery, matcher: M) -> Self {
        Self {
            throttle: FrameThrottle::new(config.frame_skip),
            smoother: TemporalSmoother::new(config.smoother()),
            config,
            gallery,
            matcher,
        }
    }

    pub fn config(&self) -> &RecognitionConfig {
        &self.config
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    /// Replace the gallery with a fresh load. The old gallery stays in
    /// place if the load fails.
    pub fn reload_gallery(&mut self, source: &impl GallerySource) -> Result<GalleryStats, StoreError> {
        let gallery = Gallery::load(source)?;
        Ok(self.set_gallery(gallery))
    }

    /// Swap in an already-loaded gallery. Smoothing history is kept.
    pub fn set_gallery(&mut self, gallery: Gallery) -> GalleryStats {
        self.gallery = gallery;
        self.gallery.stats()
    }

    /// Count a new frame and decide whether to process it.
    pub fn next_frame(&mut self) -> ThrottleDecision {
        self.throttle.next()
    }

    pub fn frames_seen(&self) -> u64 {
        self.throttle.frames_seen()
    }

    pub fn frame_skip(&self) -> u32 {
        self.throttle.every()
    }

    pub fn set_frame_skip(&mut self, every: u32) {
        self.throttle.set_every(every);
        self.config.frame_skip = self.throttle.every();
    }

    /// Number of identities currently held in smoothing history.
    pub fn tracked(&self) -> usize {
        self.smoother.tracked()
    }

    /// Match a frame's detections, update smoothing, and pick attendance candidates.
    pub fn process_detections(&mut self, detections: &[DetectionEvent], now: Instant) -> FrameReport {
        let matches: Vec<MatchResult> = detections
            .iter()
            .map(|d| self.matcher.compare(d, &self.gallery, self.config.match_threshold))
            .collect();

        let mut eligible: Vec<AttendanceCandidate> = Vec::new();
        for m in &matches {
            let Some(identity) = &m.identity else {
                continue;
            };
            if m.confidence > self.config.attendance_threshold
                && !eligible.iter().any(|c| c.identity == identity.id)
            {
                eligible.push(AttendanceCandidate {
                    identity: identity.id,
                    confidence: m.confidence,
                });
            }
        }

        let display = self.smoother.update(&matches, now);

        FrameReport {
            matches,
            display,
            eligible,
        }
    }
}
