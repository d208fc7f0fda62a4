//! Temporal smoothing of per-frame match results.
//!
//! Keeps a short rolling history per tracked key so that a face briefly lost
//! to occlusion or a head turn keeps being reported with an averaged box.

use crate::types::{Identity, IdentityId, MatchResult, Region};
use serde::Deserialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

/// How detections are grouped into history entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmoothingKey {
    /// One entry per identity.
    #[default]
    Identity,
    /// One entry per identity and position in the frame's detection list.
    Detection,
}

impl std::str::FromStr for SmoothingKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "identity" => Ok(Self::Identity),
            "detection" => Ok(Self::Detection),
            other => Err(format!("unknown smoothing key: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TrackKey {
    identity: IdentityId,
    slot: Option<usize>,
}

#[derive(Debug, Clone)]
struct SmoothingEntry {
    regions: VecDeque<Region>,
    names: VecDeque<String>,
    confidences: VecDeque<f32>,
    last_seen: Instant,
    observation_count: u32,
}

impl SmoothingEntry {
    fn new(now: Instant) -> Self {
        Self {
            regions: VecDeque::new(),
            names: VecDeque::new(),
            confidences: VecDeque::new(),
            last_seen: now,
            observation_count: 0,
        }
    }

    fn push(&mut self, result: &MatchResult, name: &str, now: Instant, cap: usize) {
        self.regions.push_back(result.region);
        self.names.push_back(name.to_string());
        self.confidences.push_back(result.confidence);
        while self.regions.len() > cap {
            self.regions.pop_front();
            self.names.pop_front();
            self.confidences.pop_front();
        }
        self.last_seen = now;
        self.observation_count += 1;
    }

    fn average_region(&self) -> Region {
        let n = self.regions.len().max(1) as f64;
        let mean = |f: fn(&Region) -> i32| -> i32 {
            (self.regions.iter().map(|r| f64::from(f(r))).sum::<f64>() / n).round() as i32
        };
        Region {
            x: mean(|r| r.x),
            y: mean(|r| r.y),
            width: mean(|r| r.width),
            height: mean(|r| r.height),
        }
    }

    /// Most frequent name; ties go to the name seen first in the window.
    fn majority_name(&self) -> &str {
        let mut best: Option<(&str, usize)> = None;
        for name in &self.names {
            let count = self.names.iter().filter(|n| *n == name).count();
            if best.map_or(true, |(_, c)| count > c) {
                best = Some((name.as_str(), count));
            }
        }
        best.map(|(n, _)| n).unwrap_or_default()
    }

    fn mean_confidence(&self) -> f32 {
        if self.confidences.is_empty() {
            return 0.0;
        }
        self.confidences.iter().sum::<f32>() / self.confidences.len() as f32
    }
}

/// Tunables for [`TemporalSmoother`].
#[derive(Debug, Clone, Copy)]
pub struct SmootherConfig {
    pub key: SmoothingKey,
    /// Rolling window length per entry.
    pub history_len: usize,
    /// Entries not refreshed for longer than this are evicted.
    pub staleness: Duration,
    /// Observations required before an entry may be synthesized.
    pub min_observations: u32,
}

impl Default for SmootherConfig {
    fn default() -> Self {
        Self {
            key: SmoothingKey::Identity,
            history_len: 5,
            staleness: Duration::from_secs(3),
            min_observations: 2,
        }
    }
}

pub struct TemporalSmoother {
    config: SmootherConfig,
    entries: BTreeMap<TrackKey, SmoothingEntry>,
}

impl TemporalSmoother {
    pub fn new(config: SmootherConfig) -> Self {
        Self {
            config: SmootherConfig {
                history_len: config.history_len.max(1),
                ..config
            },
            entries: BTreeMap::new(),
        }
    }

    /// Number of live history entries.
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Feed one processed frame and return the list to display.
    ///
    /// A frame with detections is returned verbatim. An empty frame yields
    /// averaged results for entries seen at least `min_observations` times.
    pub fn update(&mut self, current: &[MatchResult], now: Instant) -> Vec<MatchResult> {
        self.evict_stale(now);

        for (slot, result) in current.iter().enumerate() {
            let Some(identity) = &result.identity else {
                continue;
            };
            let key = TrackKey {
                identity: identity.id,
                slot: match self.config.key {
                    SmoothingKey::Identity => None,
                    SmoothingKey::Detection => Some(slot),
                },
            };
            self.entries
                .entry(key)
                .or_insert_with(|| SmoothingEntry::new(now))
                .push(result, &identity.display_name, now, self.config.history_len);
        }

        if !current.is_empty() {
            return current.to_vec();
        }

        self.entries
            .iter()
            .filter(|(_, e)| e.observation_count >= self.config.min_observations && !e.regions.is_empty())
            .map(|(key, e)| MatchResult {
                identity: Some(Identity {
                    id: key.identity,
                    display_name: e.majority_name().to_string(),
                }),
                confidence: e.mean_confidence(),
                region: e.average_region(),
            })
            .collect()
    }

    fn evict_stale(&mut self, now: Instant) {
        let staleness = self.config.staleness;
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.last_seen) <= staleness);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            tracing::trace!(evicted, "evicted stale smoothing entries");
        }
    }
}
