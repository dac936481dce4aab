use std::ops::RangeInclusive;
use std::path::Path;

use anyhow::Context;
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use tracing::debug;

use crate::cohort::{grade_pattern, is_eligible};
use crate::error::DataError;
use crate::models::{
    LongRecord, PrepWindow, ScoreRow, StudentId, Subject, UsageEvent, UsageTotal,
};
use crate::usage::{aggregate_usage, UsagePolicy};

/// Where Benesse scores and BookRoll usage come from.
///
/// Implementations only need to return candidate rows; the cohort and usage modules
/// apply the final filters so every source behaves the same.
pub trait DataSource {
    /// Short tag written to exported rows.
    fn label(&self) -> &'static str;

    /// Earliest eligible Benesse row for `subject` dated in `year` whose course matches
    /// `grade`.
    async fn earliest_benesse_row(
        &self,
        subject: Subject,
        year: i32,
        grade: i32,
    ) -> anyhow::Result<Option<ScoreRow>>;

    /// Eligible Benesse rows for `subject` dated within `years`, optionally limited to
    /// `students`.
    async fn benesse_rows(
        &self,
        subject: Subject,
        years: RangeInclusive<i32>,
        students: Option<&[StudentId]>,
    ) -> anyhow::Result<Vec<ScoreRow>>;

    /// One usage total per student in `students` for the window.
    async fn usage_totals(
        &self,
        students: &[StudentId],
        window: &PrepWindow,
        subject: Subject,
        policy: &UsagePolicy,
    ) -> anyhow::Result<Vec<UsageTotal>>;

    /// Releases the underlying connection; called before any output is written.
    async fn close(self);
}

/// Table dumps loaded into memory.
#[derive(Debug, Clone, Default)]
pub struct CsvSource {
    scores: Vec<ScoreRow>,
    usage: Vec<UsageEvent>,
}

#[derive(serde::Deserialize)]
struct ScoreCsvRow {
    student_id: String,
    course_name: Option<String>,
    name: Option<String>,
    quiz: Option<String>,
    date_at: Option<String>,
}

#[derive(serde::Deserialize)]
struct UsageCsvRow {
    student_id: String,
    operationdate: String,
    diftime: Option<String>,
    course_title: Option<String>,
}

const SCORE_COLUMNS: [&str; 5] = ["student_id", "course_name", "name", "quiz", "date_at"];
const USAGE_COLUMNS: [&str; 4] = ["student_id", "operationdate", "diftime", "course_title"];

pub fn require_columns(headers: &csv::StringRecord, required: &[&str]) -> Result<(), DataError> {
    for column in required {
        if !headers.iter().any(|header| header.trim() == *column) {
            return Err(DataError::MissingColumn((*column).to_string()));
        }
    }
    Ok(())
}

/// Integer student id; ids that are not numeric are skipped like unparseable rows.
pub fn parse_student_id(raw: &str) -> Option<StudentId> {
    let raw = raw.trim();
    raw.parse::<StudentId>()
        .ok()
        .or_else(|| raw.parse::<f64>().ok().filter(|v| v.fract() == 0.0).map(|v| v as StudentId))
}

pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y/%m/%d %H:%M:%S"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

fn parse_number(raw: Option<&str>) -> Option<f64> {
    raw.and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
}

impl CsvSource {
    #[cfg(test)]
    pub fn from_records(scores: Vec<ScoreRow>, usage: Vec<UsageEvent>) -> Self {
        Self { scores, usage }
    }

    pub fn from_paths(scores_path: &Path, usage_path: &Path) -> anyhow::Result<Self> {
        let scores = read_scores(scores_path)
            .with_context(|| format!("failed to read scores from {}", scores_path.display()))?;
        let usage = read_usage(usage_path)
            .with_context(|| format!("failed to read usage from {}", usage_path.display()))?;
        debug!(scores = scores.len(), usage = usage.len(), "loaded CSV dumps");
        Ok(Self { scores, usage })
    }
}

fn read_scores(path: &Path) -> anyhow::Result<Vec<ScoreRow>> {
    let mut reader = csv::Reader::from_path(path)?;
    require_columns(reader.headers()?, &SCORE_COLUMNS)?;

    let mut rows = Vec::new();
    for result in reader.deserialize::<ScoreCsvRow>() {
        let row = result?;
        let Some(student_id) = parse_student_id(&row.student_id) else {
            continue;
        };
        rows.push(ScoreRow {
            student_id,
            course_name: row.course_name.unwrap_or_default(),
            name: row.name.unwrap_or_default(),
            quiz: parse_number(row.quiz.as_deref()),
            date_at: row.date_at.as_deref().and_then(parse_timestamp),
        });
    }
    Ok(rows)
}

fn read_usage(path: &Path) -> anyhow::Result<Vec<UsageEvent>> {
    let mut reader = csv::Reader::from_path(path)?;
    require_columns(reader.headers()?, &USAGE_COLUMNS)?;

    let mut events = Vec::new();
    for result in reader.deserialize::<UsageCsvRow>() {
        let row = result?;
        let (Some(student_id), Some(operated_at)) = (
            parse_student_id(&row.student_id),
            parse_timestamp(&row.operationdate),
        ) else {
            continue;
        };
        events.push(UsageEvent {
            student_id,
            operated_at,
            seconds: parse_number(row.diftime.as_deref()).unwrap_or(0.0),
            course_title: row.course_title.unwrap_or_default(),
        });
    }
    Ok(events)
}

#[derive(serde::Deserialize)]
struct LongCsvRow {
    student_id: String,
    year: String,
    grade: String,
    subject: String,
    exam_round: String,
    score_percent: Option<String>,
    raw_score: Option<String>,
    source: Option<String>,
    time_label: String,
}

const LONG_COLUMNS: [&str; 6] = [
    "student_id",
    "year",
    "grade",
    "subject",
    "exam_round",
    "time_label",
];

/// Reads a long cohort CSV, preferring `score_percent` over `raw_score` when both exist.
///
/// Rows without a usable id, year, round or score are skipped.
pub fn read_long_records(path: &Path) -> anyhow::Result<Vec<LongRecord>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let headers = reader.headers()?.clone();
    require_columns(&headers, &LONG_COLUMNS)?;
    if require_columns(&headers, &["score_percent"]).is_err() {
        require_columns(&headers, &["raw_score"])?;
    }

    let mut records = Vec::new();
    for result in reader.deserialize::<LongCsvRow>() {
        let row = result?;
        let score = parse_number(row.score_percent.as_deref())
            .or_else(|| parse_number(row.raw_score.as_deref()));
        let (Some(student_id), Ok(year), Ok(exam_round), Some(raw_score)) = (
            parse_student_id(&row.student_id),
            row.year.trim().parse::<i32>(),
            row.exam_round.trim().parse::<u8>(),
            score,
        ) else {
            continue;
        };
        records.push(LongRecord {
            student_id,
            year,
            grade: row.grade,
            subject: row.subject,
            exam_round,
            raw_score,
            source: row.source.unwrap_or_default(),
            time_label: row.time_label,
        });
    }
    debug!(rows = records.len(), "loaded long cohort CSV");
    Ok(records)
}

fn row_year(row: &ScoreRow) -> Option<i32> {
    row.date_at.map(|at| at.year())
}

impl DataSource for CsvSource {
    fn label(&self) -> &'static str {
        "csv"
    }

    async fn earliest_benesse_row(
        &self,
        subject: Subject,
        year: i32,
        grade: i32,
    ) -> anyhow::Result<Option<ScoreRow>> {
        let pattern = grade_pattern(grade);
        let earliest = self
            .scores
            .iter()
            .filter(|row| is_eligible(row, subject))
            .filter(|row| row_year(row) == Some(year))
            .filter(|row| pattern.is_match(&row.course_name))
            .min_by_key(|row| row.date_at);
        Ok(earliest.cloned())
    }

    async fn benesse_rows(
        &self,
        subject: Subject,
        years: RangeInclusive<i32>,
        students: Option<&[StudentId]>,
    ) -> anyhow::Result<Vec<ScoreRow>> {
        Ok(self
            .scores
            .iter()
            .filter(|row| is_eligible(row, subject))
            .filter(|row| row_year(row).is_some_and(|year| years.contains(&year)))
            .filter(|row| students.map_or(true, |ids| ids.contains(&row.student_id)))
            .cloned()
            .collect())
    }

    async fn usage_totals(
        &self,
        students: &[StudentId],
        window: &PrepWindow,
        subject: Subject,
        policy: &UsagePolicy,
    ) -> anyhow::Result<Vec<UsageTotal>> {
        Ok(aggregate_usage(&self.usage, students, window, subject, policy))
    }

    async fn close(self) {}
}
