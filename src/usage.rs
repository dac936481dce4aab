use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDateTime, NaiveTime, Weekday};

use crate::models::{PrepWindow, StudentId, Subject, UsageEvent, UsageTotal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum UsageMeasure {
    Raw,
    Capped,
}

/// How BookRoll events are turned into hours.
#[derive(Debug, Clone)]
pub struct UsagePolicy {
    /// Upper bound on the seconds a single event may contribute to capped hours.
    pub cap_seconds: f64,
    pub exclude_school_hours: bool,
    pub measure: UsageMeasure,
    /// Maximum number of student ids per database query.
    pub chunk_size: usize,
}

impl Default for UsagePolicy {
    fn default() -> Self {
        Self {
            cap_seconds: 1800.0,
            exclude_school_hours: true,
            measure: UsageMeasure::Capped,
            chunk_size: 1000,
        }
    }
}

impl UsagePolicy {
    pub fn hours(&self, total: &UsageTotal) -> f64 {
        match self.measure {
            UsageMeasure::Raw => total.hours_raw,
            UsageMeasure::Capped => total.hours_capped,
        }
    }
}

/// Weekdays from 08:00 up to 16:00.
pub fn is_school_hours(at: NaiveDateTime) -> bool {
    let weekday = !matches!(at.weekday(), Weekday::Sat | Weekday::Sun);
    let opens = NaiveTime::from_hms_opt(8, 0, 0).unwrap_or(NaiveTime::MIN);
    let closes = NaiveTime::from_hms_opt(16, 0, 0).unwrap_or(NaiveTime::MIN);
    weekday && at.time() >= opens && at.time() < closes
}

pub fn counts_toward(
    event: &UsageEvent,
    window: &PrepWindow,
    subject: Subject,
    policy: &UsagePolicy,
) -> bool {
    event.seconds > 0.0
        && window.contains(event.operated_at.date())
        && event.course_title.contains(subject.marker())
        && !(policy.exclude_school_hours && is_school_hours(event.operated_at))
}

/// Exactly one total per requested student, in request order; no events means zero.
pub fn fill_totals(students: &[StudentId], found: &[UsageTotal]) -> Vec<UsageTotal> {
    let mut summed: BTreeMap<StudentId, (f64, f64)> = BTreeMap::new();
    for total in found {
        let entry = summed.entry(total.student_id).or_insert((0.0, 0.0));
        entry.0 += total.hours_raw;
        entry.1 += total.hours_capped;
    }

    students
        .iter()
        .map(|&student_id| {
            let (hours_raw, hours_capped) = summed.get(&student_id).copied().unwrap_or_default();
            UsageTotal {
                student_id,
                hours_raw,
                hours_capped,
            }
        })
        .collect()
}

/// Sums in-memory events per student for one preparation window.
pub fn aggregate_usage(
    events: &[UsageEvent],
    students: &[StudentId],
    window: &PrepWindow,
    subject: Subject,
    policy: &UsagePolicy,
) -> Vec<UsageTotal> {
    let found: Vec<UsageTotal> = events
        .iter()
        .filter(|event| students.contains(&event.student_id))
        .filter(|event| counts_toward(event, window, subject, policy))
        .map(|event| UsageTotal {
            student_id: event.student_id,
            hours_raw: event.seconds / 3600.0,
            hours_capped: event.seconds.min(policy.cap_seconds) / 3600.0,
        })
        .collect();
    fill_totals(students, &found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExamKey;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn event(
        student_id: StudentId,
        operated_at: NaiveDateTime,
        seconds: f64,
        title: &str,
    ) -> UsageEvent {
        UsageEvent {
            student_id,
            operated_at,
            seconds,
            course_title: title.to_string(),
        }
    }

    fn window() -> PrepWindow {
        PrepWindow {
            key: ExamKey::new(2021, 2),
            start: NaiveDate::from_ymd_opt(2021, 6, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2021, 6, 30).unwrap(),
        }
    }

    #[test]
    fn school_hours_are_weekday_daytime_only() {
        // 2021-06-07 is a Monday, 2021-06-05 a Saturday
        assert!(is_school_hours(at(2021, 6, 7, 8)));
        assert!(is_school_hours(at(2021, 6, 7, 15)));
        assert!(!is_school_hours(at(2021, 6, 7, 16)));
        assert!(!is_school_hours(at(2021, 6, 7, 7)));
        assert!(!is_school_hours(at(2021, 6, 5, 10)));
    }

    #[test]
    fn sums_within_window_and_caps_long_events() {
        let events = vec![
            event(1, at(2021, 6, 5, 10), 3600.0, "数学 BookRoll"),
            event(1, at(2021, 6, 7, 19), 900.0, "数学 BookRoll"),
            event(1, at(2021, 6, 30, 19), 900.0, "数学 BookRoll"),
            event(1, at(2021, 5, 31, 19), 900.0, "数学 BookRoll"),
            event(1, at(2021, 6, 7, 10), 900.0, "数学 BookRoll"),
            event(1, at(2021, 6, 8, 20), 900.0, "英語 BookRoll"),
            event(1, at(2021, 6, 9, 20), 0.0, "数学 BookRoll"),
        ];

        let policy = UsagePolicy::default();
        let totals = aggregate_usage(&events, &[1], &window(), Subject::Math, &policy);
        assert_eq!(totals.len(), 1);
        assert!((totals[0].hours_raw - 1.25).abs() < 1e-9);
        assert!((totals[0].hours_capped - 0.75).abs() < 1e-9);
    }

    #[test]
    fn school_hours_filter_can_be_turned_off() {
        let events = vec![event(1, at(2021, 6, 7, 10), 1800.0, "数学")];
        let policy = UsagePolicy {
            exclude_school_hours: false,
            ..UsagePolicy::default()
        };
        let totals = aggregate_usage(&events, &[1], &window(), Subject::Math, &policy);
        assert!((totals[0].hours_raw - 0.5).abs() < 1e-9);
    }

    #[test]
    fn students_without_events_get_zero() {
        let events = vec![event(2, at(2021, 6, 12, 20), 1800.0, "数学")];
        let policy = UsagePolicy::default();
        let totals = aggregate_usage(&events, &[3, 2], &window(), Subject::Math, &policy);

        assert_eq!(totals.len(), 2);
        assert_eq!(totals[0].student_id, 3);
        assert_eq!(totals[0].hours_capped, 0.0);
        assert!((totals[1].hours_capped - 0.5).abs() < 1e-9);
    }

    #[test]
    fn fill_totals_merges_repeated_students() {
        let found = vec![
            UsageTotal { student_id: 4, hours_raw: 1.0, hours_capped: 0.5 },
            UsageTotal { student_id: 4, hours_raw: 2.0, hours_capped: 1.0 },
        ];
        let totals = fill_totals(&[4], &found);
        assert_eq!(totals[0].hours_raw, 3.0);
        assert_eq!(totals[0].hours_capped, 1.5);
    }

    #[test]
    fn measure_selects_hours_column() {
        let total = UsageTotal { student_id: 1, hours_raw: 2.0, hours_capped: 1.0 };
        let raw = UsagePolicy { measure: UsageMeasure::Raw, ..UsagePolicy::default() };
        assert_eq!(raw.hours(&total), 2.0);
        assert_eq!(UsagePolicy::default().hours(&total), 1.0);
    }
}
