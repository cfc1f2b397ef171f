//! Capture ledger: per-bin duplicate and rate gate in front of the engine.
//!
//! Each bin (keyed `team:bin`) keeps the last few average hashes and the
//! timestamps of accepted captures. The ledger is the only stateful piece of
//! the capture flow; callers serialize access to it.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::CapturePolicy;
use crate::error::{PolicyError, Result};

const HASH_SIDE: usize = 8;

/// 64-bit average hash of a frame, rendered as 16 lowercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct AverageHash(u64);

impl AverageHash {
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Samples an 8×8 grid of luma values from an RGBA buffer; each bit is
    /// set when its cell is brighter than the mean. The first cell is the
    /// most significant bit.
    pub fn from_rgba(width: usize, height: usize, data: &[u8]) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(PolicyError::Config("frame has no pixels".into()));
        }
        let needed = width
            .checked_mul(height)
            .and_then(|px| px.checked_mul(4))
            .ok_or_else(|| PolicyError::Config("frame dimensions overflow".into()))?;
        if data.len() < needed {
            return Err(PolicyError::Config(format!(
                "frame buffer holds {} bytes, {width}x{height} RGBA needs {needed}",
                data.len()
            )));
        }

        let step_x = width as f64 / HASH_SIDE as f64;
        let step_y = height as f64 / HASH_SIDE as f64;
        let mut luma = [0.0f64; HASH_SIDE * HASH_SIDE];
        for y in 0..HASH_SIDE {
            let sy = (((y as f64 + 0.5) * step_y) as usize).min(height - 1);
            for x in 0..HASH_SIDE {
                let sx = (((x as f64 + 0.5) * step_x) as usize).min(width - 1);
                let i = (sy * width + sx) * 4;
                luma[y * HASH_SIDE + x] = 0.299 * f64::from(data[i])
                    + 0.587 * f64::from(data[i + 1])
                    + 0.114 * f64::from(data[i + 2]);
            }
        }

        let mean = luma.iter().sum::<f64>() / luma.len() as f64;
        let bits = luma
            .iter()
            .fold(0u64, |acc, v| (acc << 1) | u64::from(*v > mean));
        Ok(Self(bits))
    }

    /// Hamming distance.
    pub fn distance(self, other: AverageHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }
}

impl fmt::Display for AverageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for AverageHash {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty()
            || trimmed.len() > 16
            || !trimmed.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(PolicyError::InvalidHash(s.to_string()));
        }
        u64::from_str_radix(trimmed, 16)
            .map(AverageHash)
            .map_err(|_| PolicyError::InvalidHash(s.to_string()))
    }
}

impl From<AverageHash> for String {
    fn from(hash: AverageHash) -> Self {
        hash.to_string()
    }
}

impl TryFrom<String> for AverageHash {
    type Error = PolicyError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureRejection {
    #[error("move the camera or item a bit to proceed")]
    StaticFrame,
    #[error("looks like a duplicate capture, try a different angle")]
    Duplicate,
    #[error("hourly capture limit reached for this bin")]
    HourlyCap,
}

impl CaptureRejection {
    pub fn reason(&self) -> &'static str {
        match self {
            CaptureRejection::StaticFrame => "static_frame",
            CaptureRejection::Duplicate => "duplicate",
            CaptureRejection::HourlyCap => "hourly_cap",
        }
    }
}

#[derive(Debug, Default)]
struct BinHistory {
    /// Most recent first.
    hashes: VecDeque<AverageHash>,
    accepted_at: VecDeque<DateTime<Utc>>,
}

/// Per-bin capture history. Bins with no accepted capture inside the window
/// are dropped, so the map only holds recently active bins.
#[derive(Debug)]
pub struct CaptureLedger {
    policy: CapturePolicy,
    bins: HashMap<String, BinHistory>,
    last_sweep: Option<DateTime<Utc>>,
}

impl CaptureLedger {
    pub fn new(policy: CapturePolicy) -> Self {
        Self {
            policy,
            bins: HashMap::new(),
            last_sweep: None,
        }
    }

    pub fn key(team_id: &str, bin_id: &str) -> String {
        format!("{team_id}:{bin_id}")
    }

    /// Retained hashes for `key`, reported to the engine as the recent
    /// submission count.
    pub fn recent_count(&self, key: &str) -> usize {
        self.bins.get(key).map_or(0, |h| h.hashes.len())
    }

    /// Runs the gate without recording anything. On success returns the
    /// recent submission count.
    pub fn check(
        &mut self,
        key: &str,
        hash: AverageHash,
        motion_delta: f64,
        now: DateTime<Utc>,
    ) -> std::result::Result<usize, CaptureRejection> {
        if motion_delta.is_nan() || motion_delta < self.policy.min_motion {
            return Err(CaptureRejection::StaticFrame);
        }

        let window = self.window();
        let Some(history) = self.bins.get_mut(key) else {
            return Ok(0);
        };

        history.accepted_at.retain(|t| now - *t < window);
        if history.accepted_at.is_empty() {
            self.bins.remove(key);
            return Ok(0);
        }

        if history
            .hashes
            .iter()
            .any(|h| h.distance(hash) < self.policy.duplicate_distance)
        {
            return Err(CaptureRejection::Duplicate);
        }

        if history.accepted_at.len() >= self.policy.hourly_cap {
            return Err(CaptureRejection::HourlyCap);
        }

        Ok(history.hashes.len())
    }

    /// Remembers an accepted capture.
    pub fn record(&mut self, key: &str, hash: AverageHash, now: DateTime<Utc>) {
        let limit = self.policy.history;
        let history = self.bins.entry(key.to_string()).or_default();
        history.hashes.push_front(hash);
        history.hashes.truncate(limit);
        history.accepted_at.push_back(now);
    }

    /// [`check`](Self::check) and [`record`](Self::record) in one step.
    pub fn admit(
        &mut self,
        key: &str,
        hash: AverageHash,
        motion_delta: f64,
        now: DateTime<Utc>,
    ) -> std::result::Result<usize, CaptureRejection> {
        self.sweep_if_due(now);
        let recent = self.check(key, hash, motion_delta, now)?;
        self.record(key, hash, now);
        Ok(recent)
    }

    /// Drops every bin without an accepted capture inside the window.
    pub fn evict_idle(&mut self, now: DateTime<Utc>) {
        let window = self.window();
        self.bins.retain(|_, history| {
            history.accepted_at.retain(|t| now - *t < window);
            !history.accepted_at.is_empty()
        });
        self.last_sweep = Some(now);
    }

    /// Number of bins currently holding history.
    pub fn tracked_bins(&self) -> usize {
        self.bins.len()
    }

    fn sweep_if_due(&mut self, now: DateTime<Utc>) {
        let due = self
            .last_sweep
            .map_or(true, |last| now - last >= self.window());
        if due {
            self.evict_idle(now);
        }
    }

    fn window(&self) -> Duration {
        Duration::seconds(i64::try_from(self.policy.window_secs).unwrap_or(i64::MAX / 1000))
    }
}
