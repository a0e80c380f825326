//! Network measurement and the concurrency recommendation derived from it.
//!
//! [`Profiler::measure`] never fails: when probing does not work the caller
//! gets the slowest tier, which is always a safe budget.

mod profiler;

use std::fmt;
use std::str::FromStr;

use crate::storage::{Database, DatabaseError};

pub use profiler::{ProbeOptions, Profiler};

/// Concurrency used when no profile has ever been measured.
pub const DEFAULT_CONCURRENCY: usize = 5;

const KEY_SPEED: &str = "network.speed";
const KEY_BANDWIDTH: &str = "network.bandwidth_mbps";
const KEY_LATENCY: &str = "network.latency_ms";
const KEY_CONCURRENCY: &str = "network.max_concurrency";
const KEY_MEASURED_AT: &str = "network.measured_at";

/// Ordered speed classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SpeedTier {
    Slow,
    Medium,
    Fast,
}

impl SpeedTier {
    /// Bandwidth below this is slow regardless of latency.
    pub const SLOW_BELOW_MBPS: f64 = 1.0;
    /// Bandwidth below this (and not slow) is medium.
    pub const MEDIUM_BELOW_MBPS: f64 = 10.0;
    /// Latency at or above this is slow regardless of bandwidth.
    pub const SLOW_LATENCY_MS: u64 = 500;

    pub fn classify(bandwidth_mbps: f64, latency_ms: u64) -> Self {
        if !bandwidth_mbps.is_finite()
            || bandwidth_mbps < Self::SLOW_BELOW_MBPS
            || latency_ms >= Self::SLOW_LATENCY_MS
        {
            SpeedTier::Slow
        } else if bandwidth_mbps < Self::MEDIUM_BELOW_MBPS {
            SpeedTier::Medium
        } else {
            SpeedTier::Fast
        }
    }

    /// Fixed concurrency recommendation for the tier.
    pub fn max_concurrency(self) -> usize {
        match self {
            SpeedTier::Slow => 2,
            SpeedTier::Medium => 5,
            SpeedTier::Fast => 10,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SpeedTier::Slow => "slow",
            SpeedTier::Medium => "medium",
            SpeedTier::Fast => "fast",
        }
    }
}

impl fmt::Display for SpeedTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpeedTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "slow" => Ok(SpeedTier::Slow),
            "medium" => Ok(SpeedTier::Medium),
            "fast" => Ok(SpeedTier::Fast),
            other => Err(format!("unknown speed tier '{}'", other)),
        }
    }
}

/// Result of one measurement. A cache with no hard expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkProfile {
    pub tier: SpeedTier,
    pub bandwidth_mbps: f64,
    pub latency_ms: u64,
    pub max_concurrency: usize,
    /// Unix seconds
    pub measured_at: i64,
    /// False when probing failed and this is the conservative fallback
    pub success: bool,
}

impl NetworkProfile {
    pub fn from_measurement(bandwidth_mbps: f64, latency_ms: u64) -> Self {
        let tier = SpeedTier::classify(bandwidth_mbps, latency_ms);
        Self {
            tier,
            bandwidth_mbps,
            latency_ms,
            max_concurrency: tier.max_concurrency(),
            measured_at: crate::util::now_ts(),
            success: true,
        }
    }

    /// Lowest tier, used whenever measuring is not possible.
    pub fn fallback() -> Self {
        Self {
            tier: SpeedTier::Slow,
            bandwidth_mbps: 0.0,
            latency_ms: 0,
            max_concurrency: SpeedTier::Slow.max_concurrency(),
            measured_at: crate::util::now_ts(),
            success: false,
        }
    }

    /// Whether the profile is older than `max_age_secs` at `now`.
    pub fn is_stale(&self, now: i64, max_age_secs: i64) -> bool {
        now.saturating_sub(self.measured_at) > max_age_secs
    }
}

/// Persist a profile as scalar settings. Fallback profiles are not stored,
/// so a failed probe never overwrites a real measurement.
pub async fn save_profile(db: &Database, profile: &NetworkProfile) -> Result<bool, DatabaseError> {
    if !profile.success {
        return Ok(false);
    }
    db.set_settings(&[
        (KEY_SPEED, profile.tier.as_str().to_string()),
        (KEY_BANDWIDTH, format!("{:.2}", profile.bandwidth_mbps)),
        (KEY_LATENCY, profile.latency_ms.to_string()),
        (KEY_CONCURRENCY, profile.max_concurrency.to_string()),
        (KEY_MEASURED_AT, profile.measured_at.to_string()),
    ])
    .await?;
    Ok(true)
}

/// Read back the last persisted profile, if any. Unparseable values are
/// treated as "no profile".
pub async fn cached_profile(db: &Database) -> Result<Option<NetworkProfile>, DatabaseError> {
    let Some(speed) = db.get_setting(KEY_SPEED).await? else {
        return Ok(None);
    };

    let tier = match speed.parse::<SpeedTier>() {
        Ok(tier) => tier,
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring cached network profile");
            return Ok(None);
        }
    };
    let bandwidth_mbps = db
        .get_setting(KEY_BANDWIDTH)
        .await?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0);
    let latency_ms = db
        .get_setting(KEY_LATENCY)
        .await?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let max_concurrency = db
        .get_setting(KEY_CONCURRENCY)
        .await?
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|c| *c >= 1)
        .unwrap_or_else(|| tier.max_concurrency());
    let measured_at = db
        .get_setting(KEY_MEASURED_AT)
        .await?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    Ok(Some(NetworkProfile {
        tier,
        bandwidth_mbps,
        latency_ms,
        max_concurrency,
        measured_at,
        success: true,
    }))
}
