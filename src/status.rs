//! Latency thresholds and status classification.
//!
//! A latency sample is mapped onto a [`Status`] by comparing it against a
//! [`Thresholds`] triple. Classification always goes through the validated
//! view of the thresholds, so an inverted or half-edited triple can never
//! produce a nonsensical range.

use serde::{Deserialize, Serialize};

/// Severity of a host or of a whole poll cycle.
///
/// The declaration order is the severity order: `Excellent` is the best
/// (rank 0) and `Unknown` the worst (rank 5). `Ord` is derived from it, so
/// `max()` over a set of statuses yields the most severe one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Excellent,
    Good,
    Fair,
    Poor,
    /// The probe produced no measurement.
    Offline,
    /// No measurement has ever been taken.
    #[default]
    Unknown,
}

impl Status {
    pub const ALL: [Status; 6] = [
        Status::Excellent,
        Status::Good,
        Status::Fair,
        Status::Poor,
        Status::Offline,
        Status::Unknown,
    ];

    pub fn rank(self) -> u8 {
        self as u8
    }

    /// `Poor` and `Offline` are the statuses that warrant an alert.
    pub fn is_problematic(self) -> bool {
        matches!(self, Status::Poor | Status::Offline)
    }

    pub fn label(self) -> &'static str {
        match self {
            Status::Excellent => "excellent",
            Status::Good => "good",
            Status::Fair => "fair",
            Status::Poor => "poor",
            Status::Offline => "offline",
            Status::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Latency boundaries in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub excellent: f64,
    pub good: f64,
    pub fair: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            excellent: 50.0,
            good: 100.0,
            fair: 200.0,
        }
    }
}

impl Thresholds {
    pub fn new(excellent: f64, good: f64, fair: f64) -> Self {
        Self { excellent, good, fair }
    }

    /// True when the triple is positive, finite and strictly ascending.
    pub fn is_valid(&self) -> bool {
        let all_usable = [self.excellent, self.good, self.fair]
            .iter()
            .all(|v| v.is_finite() && *v > 0.0);
        all_usable && self.excellent < self.good && self.good < self.fair
    }

    /// The triple used for classification: `self` if valid, otherwise the
    /// built-in defaults. The stored value is left untouched.
    pub fn validated(&self) -> Thresholds {
        if self.is_valid() {
            *self
        } else {
            Thresholds::default()
        }
    }
}

/// Map a latency (ms) onto a status. `None` means the probe got no answer.
pub fn classify(latency: Option<f64>, thresholds: &Thresholds) -> Status {
    let t = thresholds.validated();
    match latency {
        None => Status::Offline,
        Some(ms) if ms.is_nan() => Status::Offline,
        Some(ms) if ms < t.excellent => Status::Excellent,
        Some(ms) if ms < t.good => Status::Good,
        Some(ms) if ms < t.fair => Status::Fair,
        Some(_) => Status::Poor,
    }
}

/// Committed thresholds plus an optional frozen copy held while the user is
/// editing them.
///
/// History, persistence and alerting always use [`ThresholdConfig::live`].
/// Only the status shown to the user goes through
/// [`ThresholdConfig::effective`], which prefers the frozen copy so the
/// preview stays stable while values are typed in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub committed: Thresholds,
    pub frozen: Option<Thresholds>,
}

impl ThresholdConfig {
    pub fn new(committed: Thresholds) -> Self {
        Self {
            committed,
            frozen: None,
        }
    }

    pub fn live(&self) -> Thresholds {
        self.committed.validated()
    }

    pub fn effective(&self) -> Thresholds {
        match &self.frozen {
            Some(frozen) => frozen.validated(),
            None => self.live(),
        }
    }

    pub fn is_editing(&self) -> bool {
        self.frozen.is_some()
    }

    /// Freeze the current committed value. Re-entering an open session keeps
    /// the original snapshot.
    pub fn begin_edit(&mut self) {
        if self.frozen.is_none() {
            self.frozen = Some(self.committed);
        }
    }

    pub fn end_edit(&mut self) {
        self.frozen = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_order_matches_rank() {
        for pair in Status::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert_eq!(pair[0].rank() + 1, pair[1].rank());
        }
        assert_eq!(Status::Unknown.rank(), 5);
    }

    #[test]
    fn test_problematic_subset() {
        let problematic: Vec<_> = Status::ALL.iter().filter(|s| s.is_problematic()).collect();
        assert_eq!(problematic, vec![&Status::Poor, &Status::Offline]);
    }

    #[test]
    fn test_classify_boundaries() {
        let t = Thresholds::default();
        assert_eq!(classify(Some(0.0), &t), Status::Excellent);
        assert_eq!(classify(Some(49.9), &t), Status::Excellent);
        assert_eq!(classify(Some(50.0), &t), Status::Good);
        assert_eq!(classify(Some(99.9), &t), Status::Good);
        assert_eq!(classify(Some(100.0), &t), Status::Fair);
        assert_eq!(classify(Some(199.9), &t), Status::Fair);
        assert_eq!(classify(Some(200.0), &t), Status::Poor);
        assert_eq!(classify(Some(5000.0), &t), Status::Poor);
    }

    #[test]
    fn test_classify_none_is_offline() {
        for t in [
            Thresholds::default(),
            Thresholds::new(10.0, 20.0, 30.0),
            Thresholds::new(300.0, 200.0, 100.0),
        ] {
            assert_eq!(classify(None, &t), Status::Offline);
        }
        assert_eq!(classify(Some(f64::NAN), &Thresholds::default()), Status::Offline);
    }

    #[test]
    fn test_classify_is_monotonic() {
        let thresholds = [
            Thresholds::default(),
            Thresholds::new(1.0, 2.0, 3.0),
            Thresholds::new(20.0, 75.5, 400.0),
        ];
        for t in thresholds {
            let mut previous = Status::Excellent;
            let mut ms = 0.0;
            while ms < 1000.0 {
                let status = classify(Some(ms), &t);
                assert!(status >= previous, "{} ms regressed under {:?}", ms, t);
                assert!(!matches!(status, Status::Offline | Status::Unknown));
                previous = status;
                ms += 0.5;
            }
        }
    }

    #[test]
    fn test_invalid_thresholds_fall_back_to_defaults() {
        let defaults = Thresholds::default();
        let invalid = [
            Thresholds::new(100.0, 50.0, 200.0),
            Thresholds::new(50.0, 50.0, 200.0),
            Thresholds::new(50.0, 100.0, 100.0),
            Thresholds::new(-5.0, 100.0, 200.0),
            Thresholds::new(50.0, f64::INFINITY, 200.0),
        ];
        for t in invalid {
            assert!(!t.is_valid());
            assert_eq!(t.validated(), defaults);
            for ms in [0.0, 49.0, 50.0, 120.0, 199.0, 200.0, 900.0] {
                assert_eq!(classify(Some(ms), &t), classify(Some(ms), &defaults));
            }
        }
    }

    #[test]
    fn test_edit_session_freezes_effective_only() {
        let mut config = ThresholdConfig::new(Thresholds::new(20.0, 40.0, 80.0));
        config.begin_edit();
        config.committed = Thresholds::new(10.0, 15.0, 30.0);

        assert!(config.is_editing());
        assert_eq!(config.effective(), Thresholds::new(20.0, 40.0, 80.0));
        assert_eq!(config.live(), Thresholds::new(10.0, 15.0, 30.0));

        // A second begin keeps the original snapshot.
        config.begin_edit();
        assert_eq!(config.effective(), Thresholds::new(20.0, 40.0, 80.0));

        config.end_edit();
        assert_eq!(config.effective(), config.live());
    }

    #[test]
    fn test_live_uses_validated_view() {
        let config = ThresholdConfig::new(Thresholds::new(300.0, 200.0, 100.0));
        assert_eq!(config.live(), Thresholds::default());
        assert_eq!(config.committed, Thresholds::new(300.0, 200.0, 100.0));
    }
}
