//! Bounded in-memory history of poll cycles and the aggregates derived from it.
//!
//! Aggregates are recomputed from the window on demand.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::host::HostId;
use crate::status::Status;

/// How far back, relative to the newest entry, entries are kept.
pub const HISTORY_RETENTION: ChronoDuration = ChronoDuration::minutes(10);

/// One host's classified measurement for one poll cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub host_id: HostId,
    pub host_label: String,
    pub host_address: String,
    /// Round-trip time in milliseconds; `None` when the host did not answer.
    pub latency: Option<f64>,
    pub status: Status,
    pub timestamp: DateTime<Utc>,
}

/// All readings taken in one poll cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub readings: Vec<Reading>,
    pub timestamp: DateTime<Utc>,
    pub overall_status: Status,
}

impl HistoryEntry {
    pub fn new(readings: Vec<Reading>, timestamp: DateTime<Utc>) -> Self {
        let overall_status = readings
            .iter()
            .map(|r| r.status)
            .max()
            .unwrap_or(Status::Unknown);
        Self {
            readings,
            timestamp,
            overall_status,
        }
    }

    /// Highest latency among hosts that answered.
    pub fn worst_latency(&self) -> Option<f64> {
        self.readings
            .iter()
            .filter_map(|r| r.latency)
            .fold(None, |worst, ms| Some(worst.map_or(ms, |w: f64| w.max(ms))))
    }

    pub fn reading_for(&self, host: HostId) -> Option<&Reading> {
        self.readings.iter().find(|r| r.host_id == host)
    }

    /// The value averaged over time: the pinned host's latency, or the
    /// worst latency when nothing is pinned.
    fn reducible(&self, pinned: Option<HostId>) -> Option<f64> {
        match pinned {
            Some(host) => self.reading_for(host).and_then(|r| r.latency),
            None => self.worst_latency(),
        }
    }
}

/// Time-ordered window of recent poll cycles.
#[derive(Debug, Clone)]
pub struct History {
    entries: VecDeque<HistoryEntry>,
    retention: ChronoDuration,
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}

impl History {
    pub fn new() -> Self {
        Self::with_retention(HISTORY_RETENTION)
    }

    pub fn with_retention(retention: ChronoDuration) -> Self {
        Self {
            entries: VecDeque::new(),
            retention,
        }
    }

    /// Append an entry, then drop everything older than the retention horizon
    /// measured from that entry.
    ///
    /// An entry stamped earlier than the newest one is moved up to the newest
    /// timestamp so the window stays ordered.
    pub fn record(&mut self, mut entry: HistoryEntry) {
        if let Some(last) = self.entries.back().map(|e| e.timestamp) {
            if entry.timestamp < last {
                entry.timestamp = last;
                for reading in &mut entry.readings {
                    reading.timestamp = last;
                }
            }
        }
        let horizon = entry.timestamp - self.retention;
        self.entries.push_back(entry);
        while self.entries.front().is_some_and(|e| e.timestamp < horizon) {
            self.entries.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    /// Worst latency of the most recent cycle.
    pub fn worst_latency(&self) -> Option<f64> {
        self.latest().and_then(HistoryEntry::worst_latency)
    }

    /// Mean of the pinned host's latency (or of each entry's worst latency)
    /// over entries no older than `now - window`.
    ///
    /// With no entries in the window the latest instantaneous value is
    /// returned instead. Entries without a value are skipped; if none has
    /// one, the result is `None`.
    pub fn moving_average(
        &self,
        now: DateTime<Utc>,
        window: ChronoDuration,
        pinned: Option<HostId>,
    ) -> Option<f64> {
        let cutoff = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut in_window = self.entries.iter().filter(|e| e.timestamp >= cutoff).peekable();

        if in_window.peek().is_none() {
            return self.latest().and_then(|e| e.reducible(pinned));
        }

        let (sum, count) = in_window
            .filter_map(|e| e.reducible(pinned))
            .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));

        (count > 0).then(|| sum / count as f64)
    }

    /// Total time spent in each overall status, longest first.
    ///
    /// The gap between two entries is charged to the earlier entry's status
    /// and the time since the last entry to the last entry's status. Needs at
    /// least two entries.
    pub fn time_in_state(&self, now: DateTime<Utc>) -> Vec<(Status, ChronoDuration)> {
        if self.entries.len() < 2 {
            return Vec::new();
        }

        let mut totals: HashMap<Status, ChronoDuration> = HashMap::new();
        let mut charge = |status: Status, span: ChronoDuration| {
            let span = span.max(ChronoDuration::zero());
            *totals.entry(status).or_insert_with(ChronoDuration::zero) += span;
        };

        for (earlier, later) in self.entries.iter().zip(self.entries.iter().skip(1)) {
            charge(earlier.overall_status, later.timestamp - earlier.timestamp);
        }
        if let Some(last) = self.entries.back() {
            charge(last.overall_status, now - last.timestamp);
        }

        let mut breakdown: Vec<_> = totals.into_iter().collect();
        breakdown.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        breakdown
    }

    /// One host's retained latency series, oldest first.
    pub fn host_latencies(&self, host: HostId) -> Vec<(DateTime<Utc>, Option<f64>)> {
        self.entries
            .iter()
            .filter_map(|e| e.reading_for(host).map(|r| (e.timestamp, r.latency)))
            .collect()
    }
}
