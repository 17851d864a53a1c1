//! Core domain model for trendcast: trend records, snapshots and volume parsing.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "trendcast-core";

/// One upstream origin visited by a collection run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub endpoint: String,
    pub label: String,
}

impl SourceDescriptor {
    pub fn new(endpoint: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            label: label.into(),
        }
    }
}

/// Unparsed `(term, volumeText)` pair as handed over by a source adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTrend {
    pub term: String,
    pub volume_text: String,
}

impl RawTrend {
    pub fn new(term: impl Into<String>, volume_text: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            volume_text: volume_text.into(),
        }
    }
}

/// Parse a display magnitude such as `45K+` or `1.2M+`.
///
/// Everything except ASCII digits and `.` is stripped before parsing. `M` wins
/// over `K` when both appear. Strings without either suffix, or without any
/// digits, are invalid and yield `None`.
pub fn parse_volume(text: &str) -> Option<f64> {
    let numeric: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if !numeric.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    let value: f64 = numeric.parse().ok()?;

    let multiplier = if text.contains('M') {
        1_000_000.0
    } else if text.contains('K') {
        1_000.0
    } else {
        return None;
    };
    Some(value * multiplier)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendRecord {
    pub text: String,
    #[serde(alias = "size")]
    pub volume: f64,
    #[serde(default)]
    pub volume_text: String,
}

impl TrendRecord {
    /// Build a record from adapter output, or `None` when the term is blank or
    /// the volume does not parse to a positive number.
    pub fn from_raw(raw: &RawTrend) -> Option<Self> {
        let text = raw.term.trim();
        if text.is_empty() {
            return None;
        }
        let volume = parse_volume(&raw.volume_text)?;
        if !volume.is_finite() || volume <= 0.0 {
            return None;
        }
        Some(Self {
            text: text.to_string(),
            volume,
            volume_text: raw.volume_text.trim().to_string(),
        })
    }

    pub fn is_well_formed(&self) -> bool {
        !self.text.trim().is_empty() && self.volume.is_finite() && self.volume > 0.0
    }
}

/// One complete, deduplicated collection result. Never empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendSnapshot {
    records: Vec<TrendRecord>,
    captured_at: DateTime<Utc>,
}

impl TrendSnapshot {
    /// Returns `None` for an empty record list: an empty collection is "no update".
    pub fn new(records: Vec<TrendRecord>, captured_at: DateTime<Utc>) -> Option<Self> {
        if records.is_empty() {
            return None;
        }
        Some(Self {
            records,
            captured_at,
        })
    }

    pub fn records(&self) -> &[TrendRecord] {
        &self.records
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Milliseconds elapsed since capture, clamped at zero for clock skew.
    pub fn age_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.captured_at).num_milliseconds().max(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Added,
    Duplicate,
    Invalid,
}

/// Accumulates records across sources; exact, case-sensitive text match, first seen wins.
#[derive(Debug, Default)]
pub struct TrendCollector {
    seen: HashSet<String>,
    records: Vec<TrendRecord>,
}

impl TrendCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(&mut self, raw: &RawTrend) -> Admission {
        let Some(record) = TrendRecord::from_raw(raw) else {
            return Admission::Invalid;
        };
        if !self.seen.insert(record.text.clone()) {
            return Admission::Duplicate;
        }
        self.records.push(record);
        Admission::Added
    }

    /// Offer a batch and return how many records were newly added.
    pub fn extend(&mut self, batch: &[RawTrend]) -> usize {
        batch
            .iter()
            .filter(|raw| self.offer(raw) == Admission::Added)
            .count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn finish(self, captured_at: DateTime<Utc>) -> Option<TrendSnapshot> {
        TrendSnapshot::new(self.records, captured_at)
    }
}

/// Wall-clock source, injectable so freshness and retry timing can be tested.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub type SharedClock = Arc<dyn Clock>;

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
