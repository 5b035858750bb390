/// Live replication check
///
/// Writes a sentinel document through the write handle and polls the read
/// handle for it, measuring how long it takes to become visible.
use chrono::{DateTime, Utc};
use mongodb::bson::{doc, DateTime as BsonDateTime};
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::bootstrap::REPLICATION_TEST;
use crate::config::HealthConfig;
use crate::core::store::with_timeout;
use crate::core::StoreHandle;
use crate::error::VigiaError;
use crate::utils::generate_id;

/// Lag reported when the sentinel was never observed
pub const UNOBSERVED_LAG: f64 = 999.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationStatus {
    Healthy,
    /// Observed, but slower than the lag threshold
    Warning,
    Failed,
}

impl fmt::Display for ReplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationStatus::Healthy => write!(f, "healthy"),
            ReplicationStatus::Warning => write!(f, "warning"),
            ReplicationStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicationProbeResult {
    pub sentinel_id: String,
    pub observed: bool,
    /// Seconds until the sentinel was visible, `UNOBSERVED_LAG` otherwise
    pub lag_seconds: f64,
    /// Read attempts made
    pub attempts: u32,
    pub status: ReplicationStatus,
    /// Last error met while writing or polling
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl ReplicationProbeResult {
    /// A probe that could not start
    pub fn failed(sentinel_id: String, error: String) -> Self {
        Self {
            sentinel_id,
            observed: false,
            lag_seconds: UNOBSERVED_LAG,
            attempts: 0,
            status: ReplicationStatus::Failed,
            error: Some(error),
            checked_at: Utc::now(),
        }
    }

    pub fn lag(&self) -> Option<Duration> {
        if !self.observed {
            return None;
        }
        Duration::try_from_secs_f64(self.lag_seconds).ok()
    }

    /// The non-fatal error describing an unhealthy result, for logging
    pub fn unverified(&self) -> Option<VigiaError> {
        let reason = match self.status {
            ReplicationStatus::Healthy => return None,
            ReplicationStatus::Warning => format!("lag {:.3}s above threshold", self.lag_seconds),
            ReplicationStatus::Failed => self.error.clone().unwrap_or_else(|| {
                format!("sentinel not observed after {} attempt(s)", self.attempts)
            }),
        };
        Some(VigiaError::ReplicationUnverified {
            sentinel_id: self.sentinel_id.clone(),
            reason,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ReplicationVerifier {
    attempts: u32,
    interval: Duration,
    lag_threshold: Duration,
    op_timeout: Duration,
}

impl ReplicationVerifier {
    pub fn new(
        attempts: u32,
        interval: Duration,
        lag_threshold: Duration,
        op_timeout: Duration,
    ) -> Self {
        Self {
            attempts,
            interval,
            lag_threshold,
            op_timeout,
        }
    }

    pub fn from_config(config: &HealthConfig, op_timeout: Duration) -> Self {
        Self::new(
            config.replication_attempts,
            config.replication_poll_interval(),
            config.replication_lag_threshold(),
            op_timeout,
        )
    }

    /// Upper bound on how long `verify` can take
    pub fn budget(&self) -> Duration {
        let polls = self.op_timeout.saturating_mul(self.attempts);
        let sleeps = self.interval.saturating_mul(self.attempts.saturating_sub(1));
        polls
            .saturating_add(sleeps)
            .saturating_add(self.op_timeout.saturating_mul(2))
    }

    /// Run one probe. Never fails; errors collapse into the result.
    pub async fn verify(
        &self,
        write: &dyn StoreHandle,
        read: &dyn StoreHandle,
    ) -> ReplicationProbeResult {
        let sentinel_id = generate_id(REPLICATION_TEST);
        let started = Instant::now();
        let sentinel = doc! {
            "test_id": sentinel_id.clone(),
            "write_time": BsonDateTime::now(),
            "test_type": "replication_lag",
        };

        let written = with_timeout(
            self.op_timeout,
            "insert",
            write.insert_one(REPLICATION_TEST, sentinel),
        )
        .await;
        if let Err(e) = written {
            warn!("Replication sentinel {} could not be written: {}", sentinel_id, e);
            self.cleanup(write, &sentinel_id).await;
            return ReplicationProbeResult::failed(sentinel_id, e.to_string());
        }

        let mut attempts = 0;
        let mut lag = None;
        let mut last_error = None;
        let filter = doc! { "test_id": sentinel_id.clone() };

        while attempts < self.attempts {
            attempts += 1;
            let lookup = with_timeout(
                self.op_timeout,
                "find",
                read.find_one(REPLICATION_TEST, filter.clone()),
            )
            .await;
            match lookup {
                Ok(Some(_)) => {
                    lag = Some(started.elapsed());
                    break;
                }
                Ok(None) => debug!("Sentinel {} not visible on attempt {}", sentinel_id, attempts),
                Err(e) => {
                    debug!("Sentinel lookup failed on attempt {}: {}", attempts, e);
                    last_error = Some(e.to_string());
                }
            }
            if attempts < self.attempts {
                tokio::time::sleep(self.interval).await;
            }
        }

        self.cleanup(write, &sentinel_id).await;

        let result = match lag {
            Some(lag) => ReplicationProbeResult {
                sentinel_id,
                observed: true,
                lag_seconds: lag.as_secs_f64(),
                attempts,
                status: if lag < self.lag_threshold {
                    ReplicationStatus::Healthy
                } else {
                    ReplicationStatus::Warning
                },
                error: None,
                checked_at: Utc::now(),
            },
            None => ReplicationProbeResult {
                sentinel_id,
                observed: false,
                lag_seconds: UNOBSERVED_LAG,
                attempts,
                status: ReplicationStatus::Failed,
                error: last_error,
                checked_at: Utc::now(),
            },
        };

        info!(
            "Replication check {}: observed={} lag={:.3}s attempts={}",
            result.status, result.observed, result.lag_seconds, result.attempts
        );
        result
    }

    async fn cleanup(&self, write: &dyn StoreHandle, sentinel_id: &str) {
        let filter = doc! { "test_id": sentinel_id };
        let deleted = with_timeout(
            self.op_timeout,
            "delete",
            write.delete_one(REPLICATION_TEST, filter),
        )
        .await;
        if let Err(e) = deleted {
            debug!("Ignoring sentinel cleanup failure for {}: {}", sentinel_id, e);
        }
    }
}
