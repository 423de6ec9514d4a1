//! Dwell interval model for section presence tracking

use crate::domain::types::TrackId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by dwell interval state transitions.
///
/// These are programming-logic faults: they abort the affected track's
/// processing with a diagnostic, never the whole process.
#[derive(Debug, Error)]
pub enum DwellError {
    #[error("track {track_id} closed with exit_time before entry_time")]
    NonMonotonicClose { track_id: TrackId },
}

/// Lifecycle state of a dwell interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalState {
    Open,
    Closed,
}

/// The time span a track is considered present within a section zone.
/// At most one Open interval exists per track at any time.
#[derive(Debug, Clone)]
pub struct DwellInterval {
    pub track_id: TrackId,
    pub section_name: String,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub state: IntervalState,
}

impl DwellInterval {
    /// Open a new interval at the given entry timestamp
    pub fn open(track_id: TrackId, section_name: &str, entry_time: DateTime<Utc>) -> Self {
        Self {
            track_id,
            section_name: section_name.to_string(),
            entry_time,
            exit_time: None,
            state: IntervalState::Open,
        }
    }

    /// Close the interval. Exit timestamps earlier than entry are a logic
    /// fault and rejected.
    pub fn close(&mut self, exit_time: DateTime<Utc>) -> Result<(), DwellError> {
        if exit_time < self.entry_time {
            return Err(DwellError::NonMonotonicClose { track_id: self.track_id });
        }
        self.exit_time = Some(exit_time);
        self.state = IntervalState::Closed;
        Ok(())
    }

    /// Duration in seconds; zero while the interval is still open
    pub fn duration_seconds(&self) -> f64 {
        match self.exit_time {
            Some(exit) => (exit - self.entry_time).num_milliseconds() as f64 / 1000.0,
            None => 0.0,
        }
    }
}

/// Closed, persisted form of a dwell interval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DwellRecord {
    pub track_id: TrackId,
    pub section_name: String,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub duration_seconds: f64,
    pub date: chrono::NaiveDate,
    pub hour: u32,
}

impl DwellRecord {
    /// Build a record from a closed interval. Returns None for intervals
    /// that never closed (cannot happen through the tracker paths).
    pub fn from_interval(interval: &DwellInterval) -> Option<Self> {
        use chrono::Timelike;
        let exit_time = interval.exit_time?;
        Some(Self {
            track_id: interval.track_id,
            section_name: interval.section_name.clone(),
            entry_time: interval.entry_time,
            exit_time,
            duration_seconds: interval.duration_seconds(),
            date: interval.entry_time.date_naive(),
            hour: interval.entry_time.hour(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_open_close_duration() {
        let mut interval = DwellInterval::open(TrackId(1), "electronics", ts(0));
        assert_eq!(interval.state, IntervalState::Open);

        interval.close(ts(12)).unwrap();
        assert_eq!(interval.state, IntervalState::Closed);
        assert!((interval.duration_seconds() - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_close_before_entry_rejected() {
        let mut interval = DwellInterval::open(TrackId(1), "electronics", ts(10));
        let err = interval.close(ts(5)).unwrap_err();
        assert!(matches!(err, DwellError::NonMonotonicClose { .. }));
        // Interval stays open on a rejected close
        assert_eq!(interval.state, IntervalState::Open);
    }

    #[test]
    fn test_record_from_interval() {
        let mut interval = DwellInterval::open(TrackId(7), "produce", ts(0));
        interval.close(ts(30)).unwrap();

        let record = DwellRecord::from_interval(&interval).unwrap();
        assert_eq!(record.track_id, TrackId(7));
        assert_eq!(record.section_name, "produce");
        assert!((record.duration_seconds - 30.0).abs() < 1e-9);
        assert_eq!(record.date, interval.entry_time.date_naive());
    }

    #[test]
    fn test_record_from_open_interval_is_none() {
        let interval = DwellInterval::open(TrackId(7), "produce", ts(0));
        assert!(DwellRecord::from_interval(&interval).is_none());
    }
}
