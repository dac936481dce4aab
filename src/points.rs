use std::collections::{BTreeMap, HashSet};
use std::ops::RangeInclusive;

use chrono::{Datelike, NaiveDate};
use tracing::{info, warn};

use crate::models::{ExamKey, ExamPoint, PrepWindow, ScoreRecord, StudentId};

/// When the earliest exam point counts as the spring diagnostic round and is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpringRound {
    pub enabled: bool,
    pub round: u8,
    /// Optional month restriction on the first point's date.
    pub months: Option<RangeInclusive<u32>>,
}

impl Default for SpringRound {
    fn default() -> Self {
        Self {
            enabled: true,
            round: 1,
            months: None,
        }
    }
}

impl SpringRound {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    fn matches(&self, point: &ExamPoint) -> bool {
        self.enabled
            && point.key.exam_round == self.round
            && self
                .months
                .as_ref()
                .map_or(true, |months| months.contains(&point.date.month()))
    }
}

/// Month and day of the cohort start year at which the first preparation window opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepOrigin {
    pub month: u32,
    pub day: u32,
}

impl Default for PrepOrigin {
    fn default() -> Self {
        Self { month: 4, day: 1 }
    }
}

impl PrepOrigin {
    pub fn date_in(&self, year: i32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(year, self.month, self.day)
    }
}

/// Distinct exam points in chronological order, dated by their earliest score record.
pub fn exam_points(records: &[ScoreRecord]) -> Vec<ExamPoint> {
    let mut grouped: BTreeMap<ExamKey, (NaiveDate, HashSet<StudentId>)> = BTreeMap::new();

    for record in records {
        let entry = grouped
            .entry(record.key)
            .or_insert_with(|| (record.date, HashSet::new()));
        entry.0 = entry.0.min(record.date);
        entry.1.insert(record.student_id);
    }

    grouped
        .into_iter()
        .map(|(key, (date, students))| ExamPoint {
            key,
            date,
            n_students: students.len(),
        })
        .collect()
}

pub fn drop_spring_round(mut points: Vec<ExamPoint>, policy: &SpringRound) -> Vec<ExamPoint> {
    points.sort_by_key(|point| point.key);
    if points.first().is_some_and(|first| policy.matches(first)) {
        let dropped = points.remove(0);
        info!(point = %dropped.key, "dropping earliest point as spring diagnostic round");
    }
    points
}

/// One window per point: the first opens at `origin`, each later one at the previous
/// point's date, and every window closes at its own point's date.
pub fn prep_windows(points: &[ExamPoint], origin: NaiveDate) -> Vec<PrepWindow> {
    let mut ordered: Vec<&ExamPoint> = points.iter().collect();
    ordered.sort_by_key(|point| point.key);

    let mut windows = Vec::with_capacity(ordered.len());
    let mut start = origin;

    for point in ordered {
        if point.date < start {
            warn!(
                point = %point.key,
                %start,
                end = %point.date,
                "preparation window ends before it starts"
            );
        }
        windows.push(PrepWindow {
            key: point.key,
            start,
            end: point.date,
        });
        start = point.date;
    }

    windows
}
