use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::error::DataError;

pub type StudentId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    Math,
    English,
}

impl Subject {
    pub fn slug(self) -> &'static str {
        match self {
            Subject::Math => "math",
            Subject::English => "english",
        }
    }

    /// Marker used in Benesse test names and BookRoll course titles.
    pub fn marker(self) -> &'static str {
        match self {
            Subject::Math => "数学",
            Subject::English => "英語",
        }
    }
}

impl FromStr for Subject {
    type Err = DataError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "math" | "maths" => Ok(Subject::Math),
            "english" | "eng" => Ok(Subject::English),
            _ => Err(DataError::InvalidSubject(value.to_string())),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// The cohort an analysis is run for.
#[derive(Debug, Clone, Copy)]
pub struct CohortSpec {
    pub start_year: i32,
    pub start_grade: i32,
    pub subject: Subject,
}

/// One row of `course_student_scores`.
#[derive(Debug, Clone)]
pub struct ScoreRow {
    pub student_id: StudentId,
    pub course_name: String,
    pub name: String,
    pub quiz: Option<f64>,
    pub date_at: Option<NaiveDateTime>,
}

/// One row of `artsci_bookroll_difftimes`.
#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub student_id: StudentId,
    pub operated_at: NaiveDateTime,
    pub seconds: f64,
    pub course_title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExamKey {
    pub exam_year: i32,
    pub exam_round: u8,
}

impl ExamKey {
    pub fn new(exam_year: i32, exam_round: u8) -> Self {
        Self {
            exam_year,
            exam_round,
        }
    }
}

impl fmt::Display for ExamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} R{}", self.exam_year, self.exam_round)
    }
}

#[derive(Debug, Clone)]
pub struct Anchor {
    pub key: ExamKey,
    pub date: NaiveDateTime,
    pub grade: i32,
}

#[derive(Debug, Clone, Default)]
pub struct Cohort {
    pub anchor: Option<Anchor>,
    pub student_ids: Vec<StudentId>,
}

impl Cohort {
    pub fn is_empty(&self) -> bool {
        self.student_ids.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreRecord {
    pub student_id: StudentId,
    pub key: ExamKey,
    pub date: NaiveDate,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExamPoint {
    pub key: ExamKey,
    pub date: NaiveDate,
    pub n_students: usize,
}

/// Half-open `[start, end)` date range attributed to preparing for `key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepWindow {
    pub key: ExamKey,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl PrepWindow {
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageTotal {
    pub student_id: StudentId,
    pub hours_raw: f64,
    pub hours_capped: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PanelRow {
    pub student_id: StudentId,
    pub key: ExamKey,
    pub score: f64,
    pub percentile: f64,
    pub hours: f64,
}

/// One row of the long cohort CSV (`time_label` per student per exam point).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LongRecord {
    pub student_id: StudentId,
    pub year: i32,
    pub grade: String,
    pub subject: String,
    pub exam_round: u8,
    pub raw_score: f64,
    pub source: String,
    pub time_label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Quartile {
    Q1,
    Q2,
    Q3,
    Q4,
}

impl Quartile {
    pub const ALL: [Quartile; 4] = [Quartile::Q1, Quartile::Q2, Quartile::Q3, Quartile::Q4];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

impl fmt::Display for Quartile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Quartile::Q1 => "Q1",
            Quartile::Q2 => "Q2",
            Quartile::Q3 => "Q3",
            Quartile::Q4 => "Q4",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Trajectory {
    StableHigh,
    StableLow,
    Rising,
    Falling,
    Recovering,
    Volatile,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UsageChange {
    LargeDecrease,
    SlightDecrease,
    NoChange,
    SlightIncrease,
    LargeIncrease,
}

impl UsageChange {
    pub const ALL: [UsageChange; 5] = [
        UsageChange::LargeDecrease,
        UsageChange::SlightDecrease,
        UsageChange::NoChange,
        UsageChange::SlightIncrease,
        UsageChange::LargeIncrease,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EngagementPattern {
    NoUsage,
    Temporary,
    Delayed,
    Sustained,
    Unstable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UsageGroup {
    NoUsage,
    Low,
    Mid,
    High,
}

impl UsageGroup {
    pub const ALL: [UsageGroup; 4] = [
        UsageGroup::NoUsage,
        UsageGroup::Low,
        UsageGroup::Mid,
        UsageGroup::High,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_accepts_aliases() {
        assert_eq!("Maths".parse::<Subject>().unwrap(), Subject::Math);
        assert_eq!(" eng ".parse::<Subject>().unwrap(), Subject::English);
        assert!("science".parse::<Subject>().is_err());
    }

    #[test]
    fn exam_keys_order_by_year_then_round() {
        let mut keys = vec![ExamKey::new(2022, 1), ExamKey::new(2021, 2), ExamKey::new(2021, 1)];
        keys.sort();
        assert_eq!(
            keys,
            vec![ExamKey::new(2021, 1), ExamKey::new(2021, 2), ExamKey::new(2022, 1)]
        );
        assert_eq!(ExamKey::new(2021, 2).to_string(), "2021 R2");
    }

    #[test]
    fn window_is_half_open() {
        let window = PrepWindow {
            key: ExamKey::new(2021, 2),
            start: NaiveDate::from_ymd_opt(2021, 6, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2021, 11, 1).unwrap(),
        };
        assert!(window.contains(NaiveDate::from_ymd_opt(2021, 6, 1).unwrap()));
        assert!(!window.contains(NaiveDate::from_ymd_opt(2021, 11, 1).unwrap()));
    }
}
