use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::VboxError;

/// Mutating operations subject to per-user rate limits.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    SaveFile,
    CreateFile,
    RenameFile,
    DeleteFile,
    CreateFolder,
    DeleteFolder,
}

impl OperationKind {
    pub const ALL: [OperationKind; 6] = [
        OperationKind::SaveFile,
        OperationKind::CreateFile,
        OperationKind::RenameFile,
        OperationKind::DeleteFile,
        OperationKind::CreateFolder,
        OperationKind::DeleteFolder,
    ];

    /// Human phrase used in rate-limit notices.
    pub fn describe(&self) -> &'static str {
        match self {
            OperationKind::SaveFile => "file saving",
            OperationKind::CreateFile => "file creation",
            OperationKind::RenameFile => "file renaming",
            OperationKind::DeleteFile => "file deletion",
            OperationKind::CreateFolder => "folder creation",
            OperationKind::DeleteFolder => "folder deletion",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Budget of one operation kind: `points` per fixed `window_ms` window.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketConfig {
    pub points: u32,
    pub window_ms: u64,
}

impl BucketConfig {
    pub const fn new(points: u32, window_ms: u64) -> Self {
        Self { points, window_ms }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Default budgets: file operations 3 per second, folder operations 1 per 2 seconds.
pub fn default_limits() -> HashMap<OperationKind, BucketConfig> {
    OperationKind::ALL
        .into_iter()
        .map(|kind| {
            let config = match kind {
                OperationKind::CreateFolder | OperationKind::DeleteFolder => {
                    BucketConfig::new(1, 2_000)
                }
                _ => BucketConfig::new(3, 1_000),
            };
            (kind, config)
        })
        .collect()
}

/// Fixed-window rate limiter keyed by (subject, operation kind).
///
/// A rejected attempt leaves its bucket untouched. Kinds without a configured
/// budget are unlimited.
pub struct RateLimiter {
    buckets: DashMap<(String, OperationKind), Bucket>,
    limits: HashMap<OperationKind, BucketConfig>,
}

struct Bucket {
    remaining: u32,
    resets_at: Instant,
}

impl RateLimiter {
    pub fn new(limits: HashMap<OperationKind, BucketConfig>) -> Self {
        Self {
            buckets: DashMap::new(),
            limits,
        }
    }

    pub fn limit(&self, kind: OperationKind) -> Option<BucketConfig> {
        self.limits.get(&kind).copied()
    }

    /// Try to consume `points` from `subject`'s bucket for `kind`.
    pub fn consume(&self, subject: &str, kind: OperationKind, points: u32) -> Result<(), VboxError> {
        self.consume_at(subject, kind, points, Instant::now())
    }

    pub fn consume_at(
        &self,
        subject: &str,
        kind: OperationKind,
        points: u32,
        now: Instant,
    ) -> Result<(), VboxError> {
        let Some(config) = self.limits.get(&kind) else {
            return Ok(());
        };
        let mut bucket = self
            .buckets
            .entry((subject.to_string(), kind))
            .or_insert_with(|| Bucket {
                remaining: config.points,
                resets_at: now + config.window(),
            });

        if now >= bucket.resets_at {
            bucket.remaining = config.points;
            bucket.resets_at = now + config.window();
        }

        if points > bucket.remaining {
            return Err(VboxError::RateLimited(kind));
        }
        bucket.remaining -= points;
        Ok(())
    }

    /// Drop buckets whose window has elapsed. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    pub fn cleanup_at(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.resets_at > now);
        before - self.buckets.len()
    }

    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(default_limits())
    }
}
