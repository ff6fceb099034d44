//! Dynamic trust scoring.
//!
//! The scorer folds the verification report and the principal's history
//! into five weighted factors and classifies the result against the
//! configured threshold vector. Scoring never denies service on its
//! own: any internal failure collapses to a floor score with the error
//! carried as data.

use crate::canonical;
use crate::hasher::{Hash, Hasher};
use crate::context::VerificationReport;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum TrustError {
    #[error("invalid trust weights: {0}")]
    InvalidWeights(String),

    #[error("invalid trust thresholds: {0}")]
    InvalidThresholds(String),

    #[error("history store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, TrustError>;

/// Trust classification bands
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl std::fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TrustLevel::VeryLow => "very_low",
            TrustLevel::Low => "low",
            TrustLevel::Medium => "medium",
            TrustLevel::High => "high",
            TrustLevel::VeryHigh => "very_high",
        };
        write!(f, "{name}")
    }
}

/// Factor weights; must sum to 1
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrustWeights {
    pub context: f64,
    pub behavioral: f64,
    pub risk: f64,
    pub consistency: f64,
    pub recency: f64,
}

impl Default for TrustWeights {
    fn default() -> Self {
        TrustWeights {
            context: 0.3,
            behavioral: 0.25,
            risk: 0.2,
            consistency: 0.15,
            recency: 0.1,
        }
    }
}

impl TrustWeights {
    pub fn validate(&self) -> Result<()> {
        let entries = [
            self.context,
            self.behavioral,
            self.risk,
            self.consistency,
            self.recency,
        ];
        for w in entries {
            if !(0.0..=1.0).contains(&w) {
                return Err(TrustError::InvalidWeights(format!(
                    "weight {w} outside [0, 1]"
                )));
            }
        }
        let sum: f64 = entries.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(TrustError::InvalidWeights(format!("weights sum to {sum}")));
        }
        Ok(())
    }
}

/// Descending classification thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrustThresholds {
    pub very_high: f64,
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl Default for TrustThresholds {
    fn default() -> Self {
        TrustThresholds {
            very_high: 0.9,
            high: 0.7,
            medium: 0.5,
            low: 0.3,
        }
    }
}

impl TrustThresholds {
    pub fn validate(&self) -> Result<()> {
        let entries = [self.very_high, self.high, self.medium, self.low];
        for t in entries {
            if !(0.0..=1.0).contains(&t) {
                return Err(TrustError::InvalidThresholds(format!(
                    "threshold {t} outside [0, 1]"
                )));
            }
        }
        if !(self.very_high > self.high && self.high > self.medium && self.medium > self.low) {
            return Err(TrustError::InvalidThresholds(
                "thresholds must be strictly descending".into(),
            ));
        }
        Ok(())
    }

    /// Level is a pure function of the score value.
    pub fn level_for(&self, value: f64) -> TrustLevel {
        if value >= self.very_high {
            TrustLevel::VeryHigh
        } else if value >= self.high {
            TrustLevel::High
        } else if value >= self.medium {
            TrustLevel::Medium
        } else if value >= self.low {
            TrustLevel::Low
        } else {
            TrustLevel::VeryLow
        }
    }
}

/// Per-factor breakdown, each in `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TrustFactors {
    pub context: f64,
    pub behavioral: f64,
    pub risk: f64,
    pub consistency: f64,
    pub recency: f64,
}

/// Scored trust with classification and explanation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustScore {
    pub value: f64,
    pub level: TrustLevel,
    pub factors: TrustFactors,
    pub explanation: String,
    pub computed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TrustScore {
    pub fn digest(&self, hasher: &Hasher) -> Hash {
        let bytes = canonical::canonical_bytes(self).unwrap_or_default();
        hasher.digest(&bytes)
    }
}

/// One historical decision for a principal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub timestamp: DateTime<Utc>,
    pub decision: String,
    pub success: bool,
    pub anomalous: bool,
}

/// Capability over the principal's decision history.
///
/// `lookup` returns records ordered oldest to newest, bounded by
/// `limit`.
pub trait HistoryStore: Send + Sync {
    fn lookup(&self, principal: &str, limit: usize) -> Vec<HistoryRecord>;
    fn record(&self, principal: &str, record: HistoryRecord);
}

/// In-memory ring buffer history store
pub struct MemoryHistoryStore {
    capacity: usize,
    entries: RwLock<HashMap<String, VecDeque<HistoryRecord>>>,
}

impl MemoryHistoryStore {
    pub fn new(capacity: usize) -> Self {
        MemoryHistoryStore {
            capacity: capacity.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryHistoryStore {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn lookup(&self, principal: &str, limit: usize) -> Vec<HistoryRecord> {
        let entries = self.entries.read();
        match entries.get(principal) {
            Some(ring) => {
                let skip = ring.len().saturating_sub(limit);
                ring.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    fn record(&self, principal: &str, record: HistoryRecord) {
        let mut entries = self.entries.write();
        let ring = entries.entry(principal.to_string()).or_default();
        ring.push_back(record);
        while ring.len() > self.capacity {
            ring.pop_front();
        }
    }
}

/// Persistent history store backed by RocksDB
///
/// Stores one JSON-encoded ring per principal, truncated to capacity on
/// write. Read-modify-write is serialized by an internal lock.
#[cfg(feature = "rocksdb-history-store")]
pub struct RocksDbHistoryStore {
    db: parking_lot::Mutex<rocksdb::DB>,
    capacity: usize,
}

#[cfg(feature = "rocksdb-history-store")]
impl RocksDbHistoryStore {
    pub fn open<P: AsRef<std::path::Path>>(path: P, capacity: usize) -> Result<Self> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        let db = rocksdb::DB::open(&opts, path).map_err(|e| TrustError::Store(e.to_string()))?;
        Ok(RocksDbHistoryStore {
            db: parking_lot::Mutex::new(db),
            capacity: capacity.max(1),
        })
    }
}

#[cfg(feature = "rocksdb-history-store")]
impl HistoryStore for RocksDbHistoryStore {
    fn lookup(&self, principal: &str, limit: usize) -> Vec<HistoryRecord> {
        let db = self.db.lock();
        let Ok(Some(bytes)) = db.get(principal.as_bytes()) else {
            return Vec::new();
        };
        let records: Vec<HistoryRecord> = serde_json::from_slice(&bytes).unwrap_or_default();
        let skip = records.len().saturating_sub(limit);
        records.into_iter().skip(skip).collect()
    }

    fn record(&self, principal: &str, record: HistoryRecord) {
        let db = self.db.lock();
        let mut records: Vec<HistoryRecord> = match db.get(principal.as_bytes()) {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_default(),
            _ => Vec::new(),
        };
        records.push(record);
        let skip = records.len().saturating_sub(self.capacity);
        let records: Vec<HistoryRecord> = records.into_iter().skip(skip).collect();
        if let Ok(bytes) = serde_json::to_vec(&records) {
            if let Err(e) = db.put(principal.as_bytes(), bytes) {
                warn!(error = %e, "history write failed");
            }
        }
    }
}

/// Weighted multi-factor trust scorer
pub struct TrustScorer {
    weights: TrustWeights,
    thresholds: TrustThresholds,
}

impl TrustScorer {
    pub fn new(weights: TrustWeights, thresholds: TrustThresholds) -> Result<Self> {
        weights.validate()?;
        thresholds.validate()?;
        Ok(TrustScorer {
            weights,
            thresholds,
        })
    }

    pub fn thresholds(&self) -> TrustThresholds {
        self.thresholds
    }

    /// Score a request's context verification against its history.
    ///
    /// Deterministic in its inputs (modulo the timestamp). Never fails:
    /// an internal error yields the `{0.1, very_low}` floor with the
    /// reason attached.
    pub fn score(
        &self,
        report: &VerificationReport,
        history: Option<&[HistoryRecord]>,
        context_data: &BTreeMap<String, Value>,
    ) -> TrustScore {
        match self.compute_factors(report, history, context_data) {
            Ok(factors) => {
                let value = (factors.context * self.weights.context
                    + factors.behavioral * self.weights.behavioral
                    + factors.risk * self.weights.risk
                    + factors.consistency * self.weights.consistency
                    + factors.recency * self.weights.recency)
                    .clamp(0.0, 1.0);

                let level = self.thresholds.level_for(value);
                let explanation = explain(&factors);
                info!(value, level = %level, "trust score computed");

                TrustScore {
                    value,
                    level,
                    factors,
                    explanation,
                    computed_at: Utc::now(),
                    error: None,
                }
            }
            Err(e) => {
                warn!(error = %e, "trust scoring failed, returning floor score");
                TrustScore {
                    value: 0.1,
                    level: TrustLevel::VeryLow,
                    factors: TrustFactors::default(),
                    explanation: format!("error in trust calculation: {e}"),
                    computed_at: Utc::now(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    fn compute_factors(
        &self,
        report: &VerificationReport,
        history: Option<&[HistoryRecord]>,
        context_data: &BTreeMap<String, Value>,
    ) -> Result<TrustFactors> {
        Ok(TrustFactors {
            context: context_factor(report),
            behavioral: behavioral_factor(history),
            risk: risk_factor(context_data, history),
            consistency: consistency_factor(history),
            recency: recency_factor(history),
        })
    }
}

/// Verified aggregate confidence; zero when the report as a whole did
/// not verify.
fn context_factor(report: &VerificationReport) -> f64 {
    if !report.verified {
        return 0.0;
    }
    report.aggregate_confidence.clamp(0.0, 1.0)
}

/// Success rate over the history; neutral without history.
fn behavioral_factor(history: Option<&[HistoryRecord]>) -> f64 {
    match history {
        Some(records) if !records.is_empty() => {
            let successes = records.iter().filter(|r| r.success).count();
            successes as f64 / records.len() as f64
        }
        _ => 0.5,
    }
}

/// Declared risk level scaled by the recent anomaly rate.
fn risk_factor(context_data: &BTreeMap<String, Value>, history: Option<&[HistoryRecord]>) -> f64 {
    let mut risk = match context_data.get("risk_level").and_then(Value::as_str) {
        Some("low") => 0.9,
        Some("medium") => 0.7,
        Some("high") => 0.3,
        _ => 0.5,
    };

    if let Some(records) = history {
        let recent: Vec<&HistoryRecord> = records.iter().rev().take(10).collect();
        if !recent.is_empty() {
            let anomalies = recent.iter().filter(|r| r.anomalous).count();
            let anomaly_rate = anomalies as f64 / recent.len() as f64;
            risk *= 1.0 - anomaly_rate;
        }
    }

    risk.clamp(0.0, 1.0)
}

/// Share of non-anomalous behavior; neutral with fewer than two
/// records.
fn consistency_factor(history: Option<&[HistoryRecord]>) -> f64 {
    match history {
        Some(records) if records.len() >= 2 => {
            let anomalies = records.iter().filter(|r| r.anomalous).count();
            1.0 - anomalies as f64 / records.len() as f64
        }
        _ => 0.5,
    }
}

/// Piecewise decay on the age of the most recent record.
fn recency_factor(history: Option<&[HistoryRecord]>) -> f64 {
    let Some(last) = history.and_then(|records| records.last()) else {
        return 0.5;
    };

    let age = Utc::now().signed_duration_since(last.timestamp);
    if age < ChronoDuration::hours(1) {
        1.0
    } else if age < ChronoDuration::days(1) {
        0.8
    } else if age < ChronoDuration::weeks(1) {
        0.6
    } else {
        0.3
    }
}

fn explain(factors: &TrustFactors) -> String {
    let mut phrases = Vec::new();

    if factors.context > 0.8 {
        phrases.push("Strong context verification");
    } else if factors.context < 0.3 {
        phrases.push("Weak context verification");
    }
    if factors.behavioral > 0.8 {
        phrases.push("Consistent historical behavior");
    } else if factors.behavioral < 0.3 {
        phrases.push("Inconsistent historical behavior");
    }
    if factors.risk > 0.8 {
        phrases.push("Low risk profile");
    } else if factors.risk < 0.3 {
        phrases.push("High risk profile");
    }
    if factors.consistency > 0.8 {
        phrases.push("High behavioral consistency");
    } else if factors.consistency < 0.3 {
        phrases.push("Low behavioral consistency");
    }
    if factors.recency > 0.8 {
        phrases.push("Recent activity");
    } else if factors.recency < 0.3 {
        phrases.push("Inactive principal");
    }

    if phrases.is_empty() {
        phrases.push("Moderate trust factors");
    }
    phrases.join("; ")
}
