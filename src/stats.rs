//! Process-wide statistics.
//!
//! One owner holds the daily counters behind a mutex. Every access first rolls the
//! counters over if the clock's date changed since the last access, so "today"
//! always means the current calendar day. Readers get [`StatsSnapshot`] copies.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDate};
use serde::Serialize;

use crate::verification::Classification;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DailyCounters {
    pub detections_today: u64,
    pub known_today: u64,
    pub unknown_today: u64,
    pub false_positives_blocked: u64,
    /// Person boxes dropped for covering too little of the frame.
    pub too_small_filtered: u64,
    pub images_saved: u64,
}

#[derive(Debug)]
struct Inner {
    day: NaiveDate,
    daily: DailyCounters,
    frames_processed: u64,
    detector_failures: u64,
    storage_failures: u64,
    storage_error: Option<String>,
    active: bool,
}

/// Read-only copy handed to the status surface.
#[derive(Clone, Debug, Serialize)]
pub struct StatsSnapshot {
    pub active: bool,
    pub day: NaiveDate,
    #[serde(flatten)]
    pub daily: DailyCounters,
    pub frames_processed: u64,
    pub detector_failures: u64,
    pub storage_failures: u64,
    /// Last storage failure, cleared by the next successful write.
    pub storage_error: Option<String>,
    /// Whole seconds since the process started.
    #[serde(rename = "uptime")]
    pub uptime_secs: u64,
}

impl StatsSnapshot {
    pub fn uptime(&self) -> Duration {
        Duration::from_secs(self.uptime_secs)
    }
}

/// Source of the current local date.
pub type DateClock = Box<dyn Fn() -> NaiveDate + Send + Sync>;

pub struct Statistics {
    started: Instant,
    clock: DateClock,
    inner: Mutex<Inner>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    pub fn new() -> Self {
        Self::with_clock(Box::new(|| Local::now().date_naive()))
    }

    /// Statistics whose day boundaries follow `clock` instead of the wall clock.
    pub fn with_clock(clock: DateClock) -> Self {
        let day = clock();
        Self {
            started: Instant::now(),
            clock,
            inner: Mutex::new(Inner {
                day,
                daily: DailyCounters::default(),
                frames_processed: 0,
                detector_failures: 0,
                storage_failures: 0,
                storage_error: None,
                active: false,
            }),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> Option<R> {
        let mut inner = self.inner.lock().ok()?;
        Self::roll(&mut inner, (self.clock)());
        Some(f(&mut inner))
    }

    fn roll(inner: &mut Inner, today: NaiveDate) {
        if inner.day != today {
            log::info!(
                "Statistics: new day {}, resetting daily counters ({} detections on {})",
                today,
                inner.daily.detections_today,
                inner.day
            );
            inner.day = today;
            inner.daily = DailyCounters::default();
        }
    }

    pub fn set_active(&self, active: bool) {
        self.with(|inner| inner.active = active);
    }

    pub fn record_frame(&self) {
        self.with(|inner| inner.frames_processed += 1);
    }

    /// A track resolved; counted whether or not evidence is persisted.
    pub fn record_commit(&self, classification: Classification) {
        self.with(|inner| {
            inner.daily.detections_today += 1;
            match classification {
                Classification::Known => inner.daily.known_today += 1,
                Classification::Unknown => inner.daily.unknown_today += 1,
            }
        });
    }

    pub fn record_blocked(&self) {
        self.with(|inner| inner.daily.false_positives_blocked += 1);
    }

    pub fn record_too_small(&self, count: u64) {
        if count > 0 {
            self.with(|inner| inner.daily.too_small_filtered += count);
        }
    }

    pub fn record_image_saved(&self) {
        self.with(|inner| {
            inner.daily.images_saved += 1;
            inner.storage_error = None;
        });
    }

    pub fn record_detector_failure(&self) {
        self.with(|inner| inner.detector_failures += 1);
    }

    pub fn record_storage_failure(&self, reason: &str) {
        self.with(|inner| {
            inner.storage_failures += 1;
            inner.storage_error = Some(reason.to_string());
        });
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let uptime_secs = self.uptime().as_secs();
        self.with(|inner| StatsSnapshot {
            active: inner.active,
            day: inner.day,
            daily: inner.daily.clone(),
            frames_processed: inner.frames_processed,
            detector_failures: inner.detector_failures,
            storage_failures: inner.storage_failures,
            storage_error: inner.storage_error.clone(),
            uptime_secs,
        })
        .unwrap_or_else(|| StatsSnapshot {
            active: false,
            day: (self.clock)(),
            daily: DailyCounters::default(),
            frames_processed: 0,
            detector_failures: 0,
            storage_failures: 0,
            storage_error: Some("statistics lock poisoned".to_string()),
            uptime_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn settable_clock(start: NaiveDate) -> (Statistics, Arc<Mutex<NaiveDate>>) {
        let today = Arc::new(Mutex::new(start));
        let reader = today.clone();
        let stats = Statistics::with_clock(Box::new(move || *reader.lock().expect("clock")));
        (stats, today)
    }

    #[test]
    fn commits_count_by_classification() {
        let stats = Statistics::new();
        stats.record_commit(Classification::Known);
        stats.record_commit(Classification::Unknown);
        stats.record_commit(Classification::Unknown);
        stats.record_blocked();
        let snap = stats.snapshot();
        assert_eq!(snap.daily.detections_today, 3);
        assert_eq!(snap.daily.known_today, 1);
        assert_eq!(snap.daily.unknown_today, 2);
        assert_eq!(snap.daily.false_positives_blocked, 1);
    }

    #[test]
    fn midnight_drops_yesterdays_counts_and_keeps_new_ones() {
        let day = NaiveDate::from_ymd_opt(2026, 3, 14).expect("valid date");
        let (stats, today) = settable_clock(day);
        stats.record_commit(Classification::Unknown);
        stats.record_commit(Classification::Known);
        stats.record_image_saved();
        stats.record_blocked();
        stats.record_detector_failure();
        assert_eq!(stats.snapshot().daily.detections_today, 2);

        let tomorrow = day.succ_opt().expect("valid date");
        *today.lock().expect("clock") = tomorrow;
        stats.record_commit(Classification::Unknown);
        stats.record_too_small(2);

        let snap = stats.snapshot();
        assert_eq!(snap.day, tomorrow);
        assert_eq!(
            snap.daily,
            DailyCounters {
                detections_today: 1,
                unknown_today: 1,
                too_small_filtered: 2,
                ..DailyCounters::default()
            }
        );
        assert_eq!(snap.detector_failures, 1);

        // Same day again: nothing resets.
        stats.record_commit(Classification::Known);
        let snap = stats.snapshot();
        assert_eq!(snap.daily.detections_today, 2);
        assert_eq!(snap.daily.known_today, 1);
    }

    #[test]
    fn too_small_boxes_do_not_count_as_blocked() {
        let stats = Statistics::new();
        stats.record_too_small(3);
        stats.record_too_small(0);
        let snap = stats.snapshot();
        assert_eq!(snap.daily.too_small_filtered, 3);
        assert_eq!(snap.daily.false_positives_blocked, 0);
    }

    #[test]
    fn storage_error_clears_after_successful_write() {
        let stats = Statistics::new();
        stats.record_storage_failure("disk full");
        assert_eq!(stats.snapshot().storage_error.as_deref(), Some("disk full"));
        stats.record_image_saved();
        let snap = stats.snapshot();
        assert!(snap.storage_error.is_none());
        assert_eq!(snap.storage_failures, 1);
    }

    #[test]
    fn snapshot_serializes_flat_counters() {
        let stats = Statistics::new();
        stats.set_active(true);
        let json = serde_json::to_value(stats.snapshot()).expect("serialize");
        assert_eq!(json["active"], true);
        assert_eq!(json["detections_today"], 0);
        assert_eq!(json["too_small_filtered"], 0);
        assert!(json["uptime"].is_u64());
        assert!(json.get("uptime_secs").is_none());
    }
}
