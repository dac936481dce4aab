//! Cohort identification and Benesse score loading.
//!
//! A cohort is anchored on the first Benesse test recorded for its starting grade and
//! subject. The row filters here are shared by every data source so the database and
//! CSV paths select exactly the same rows.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;
use std::sync::OnceLock;

use anyhow::Context;
use chrono::{Datelike, NaiveDate};
use regex::Regex;
use tracing::info;

use crate::models::{
    Anchor, Cohort, CohortSpec, ExamKey, ScoreRecord, ScoreRow, StudentId, Subject,
};
use crate::source::DataSource;

const ANCHOR_SEARCH_YEARS: i32 = 5;
const JUNIOR_HIGH_GRADES: RangeInclusive<i32> = 1..=3;

/// Calendar years the cohort spends in junior high.
pub fn cohort_year_range(spec: &CohortSpec) -> RangeInclusive<i32> {
    spec.start_year..=spec.start_year + (3 - spec.start_grade)
}

pub fn grade_for_year(spec: &CohortSpec, exam_year: i32) -> i32 {
    spec.start_grade + (exam_year - spec.start_year)
}

/// Round number from a `第N回` marker, ASCII or full-width digits.
///
/// Names without a marker are first rounds; a marker whose number cannot be read is `None`.
pub fn parse_round(name: &str) -> Option<u32> {
    static ROUND: OnceLock<Regex> = OnceLock::new();
    let re = ROUND.get_or_init(|| Regex::new(r"第(\d+)回").expect("valid round pattern"));
    let Some(caps) = re.captures(name) else {
        return Some(1);
    };
    let digits: String = caps[1]
        .chars()
        .map(|c| match c {
            '０'..='９' => char::from_u32(c as u32 - '０' as u32 + '0' as u32).unwrap_or(c),
            _ => c,
        })
        .collect();
    digits.parse().ok()
}

/// Case-insensitive, like the `LIKE '%Benesse%'` filter under the server's collation.
pub fn is_benesse(name: &str) -> bool {
    name.contains("ベネッセ") || name.to_lowercase().contains("benesse")
}

pub fn grade_pattern(grade: i32) -> Regex {
    Regex::new(&format!(r"\[中{grade}\]|{grade}年.*\[中学\]|中学{grade}年"))
        .expect("valid grade pattern")
}

/// Benesse test for the subject with a positive score and a date.
pub fn is_eligible(row: &ScoreRow, subject: Subject) -> bool {
    row.date_at.is_some()
        && row.quiz.is_some_and(|quiz| quiz > 0.0)
        && is_benesse(&row.name)
        && row.name.contains(subject.marker())
}

fn anchor_from_row(row: &ScoreRow, exam_year: i32, grade: i32) -> Option<Anchor> {
    let date = row.date_at?;
    let round = parse_round(&row.name)?;
    if !matches!(round, 1 | 2) {
        return None;
    }
    Some(Anchor {
        key: ExamKey::new(exam_year, round as u8),
        date,
        grade,
    })
}

/// Students sitting the anchor exam, sorted ascending.
pub fn cohort_ids_from_rows(
    rows: &[ScoreRow],
    anchor: &Anchor,
    subject: Subject,
) -> Vec<StudentId> {
    let grade = grade_pattern(anchor.grade);

    let ids: BTreeSet<StudentId> = rows
        .iter()
        .filter(|row| is_eligible(row, subject))
        .filter(|row| parse_round(&row.name) == Some(u32::from(anchor.key.exam_round)))
        .filter(|row| grade.is_match(&row.course_name))
        .map(|row| row.student_id)
        .collect();
    ids.into_iter().collect()
}

/// Finds the anchor exam and the students present at it.
///
/// An empty cohort is not an error; callers are expected to check and stop.
pub async fn resolve_cohort<S: DataSource>(
    source: &S,
    spec: &CohortSpec,
) -> anyhow::Result<Cohort> {
    let mut anchor = None;

    for year in spec.start_year..spec.start_year + ANCHOR_SEARCH_YEARS {
        let grade = grade_for_year(spec, year);
        if !JUNIOR_HIGH_GRADES.contains(&grade) {
            continue;
        }
        let row = source
            .earliest_benesse_row(spec.subject, year, grade)
            .await
            .with_context(|| format!("failed to search anchor exam in {year}"))?;
        if let Some(found) = row.and_then(|row| anchor_from_row(&row, year, grade)) {
            anchor = Some(found);
            break;
        }
    }

    let Some(anchor) = anchor else {
        info!(subject = %spec.subject, start_year = spec.start_year, "no anchor exam found");
        return Ok(Cohort::default());
    };

    let year = anchor.key.exam_year;
    let rows = source
        .benesse_rows(spec.subject, year..=year, None)
        .await
        .context("failed to load anchor exam rows")?;
    let student_ids = cohort_ids_from_rows(&rows, &anchor, spec.subject);

    info!(
        anchor = %anchor.key,
        grade = anchor.grade,
        date = %anchor.date.date(),
        students = student_ids.len(),
        "cohort resolved"
    );

    Ok(Cohort {
        anchor: Some(anchor),
        student_ids,
    })
}

/// Collapses raw rows into one score per student per exam point.
///
/// Rows must fall in the cohort's years, carry round 1 or 2, and belong to the grade the
/// cohort was in that year. Duplicates are averaged and dated by their earliest row.
pub fn scores_from_rows(
    spec: &CohortSpec,
    rows: &[ScoreRow],
    students: &[StudentId],
) -> Vec<ScoreRecord> {
    let members: BTreeSet<StudentId> = students.iter().copied().collect();
    let patterns: BTreeMap<i32, Regex> = cohort_year_range(spec)
        .map(|year| (year, grade_pattern(grade_for_year(spec, year))))
        .collect();

    let mut grouped: BTreeMap<(StudentId, ExamKey), (f64, usize, NaiveDate)> =
        BTreeMap::new();

    for row in rows {
        if !members.contains(&row.student_id) || !is_eligible(row, spec.subject) {
            continue;
        }
        let (Some(date_at), Some(score)) = (row.date_at, row.quiz) else {
            continue;
        };
        let exam_year = date_at.year();
        let Some(pattern) = patterns.get(&exam_year) else {
            continue;
        };
        let Some(round) = parse_round(&row.name).filter(|round| matches!(round, 1 | 2)) else {
            continue;
        };
        if !pattern.is_match(&row.course_name) {
            continue;
        }

        let key = ExamKey::new(exam_year, round as u8);
        let entry = grouped
            .entry((row.student_id, key))
            .or_insert((0.0, 0, date_at.date()));
        entry.0 += score;
        entry.1 += 1;
        entry.2 = entry.2.min(date_at.date());
    }

    grouped
        .into_iter()
        .map(|((student_id, key), (total, count, date))| ScoreRecord {
            student_id,
            key,
            date,
            score: total / count as f64,
        })
        .collect()
}

pub async fn load_scores<S: DataSource>(
    source: &S,
    spec: &CohortSpec,
    students: &[StudentId],
) -> anyhow::Result<Vec<ScoreRecord>> {
    if students.is_empty() {
        return Ok(Vec::new());
    }
    let rows = source
        .benesse_rows(spec.subject, cohort_year_range(spec), Some(students))
        .await
        .context("failed to load cohort scores")?;
    Ok(scores_from_rows(spec, &rows, students))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::CsvSource;
    use chrono::NaiveDateTime;

    fn at(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap()
    }

    fn row(
        student_id: StudentId,
        course: &str,
        name: &str,
        quiz: f64,
        date_at: NaiveDateTime,
    ) -> ScoreRow {
        ScoreRow {
            student_id,
            course_name: course.to_string(),
            name: name.to_string(),
            quiz: Some(quiz),
            date_at: Some(date_at),
        }
    }

    fn spec() -> CohortSpec {
        CohortSpec {
            start_year: 2021,
            start_grade: 1,
            subject: Subject::Math,
        }
    }

    fn fixture() -> Vec<ScoreRow> {
        vec![
            row(1, "[中1] 数学A", "ベネッセ 数学 第1回", 60.0, at(2021, 4, 14)),
            row(2, "[中1] 数学A", "ベネッセ 数学 第1回", 40.0, at(2021, 4, 15)),
            row(3, "[中2] 数学A", "ベネッセ 数学 第1回", 55.0, at(2021, 4, 13)),
            row(4, "[中1] 英語", "ベネッセ 英語 第1回", 70.0, at(2021, 4, 10)),
            row(1, "[中1] 数学A", "ベネッセ 数学 第2回", 66.0, at(2021, 11, 9)),
            row(1, "[中1] 数学B", "ベネッセ 数学 第2回", 70.0, at(2021, 11, 10)),
            row(2, "中学2年 数学", "Benesse 数学 第1回", 52.0, at(2022, 4, 20)),
            row(1, "[中1] 数学A", "ベネッセ 数学 第3回", 80.0, at(2021, 12, 1)),
            row(2, "[中1] 数学A", "ベネッセ 数学 第2回", 0.0, at(2021, 11, 9)),
        ]
    }

    #[test]
    fn parses_round_marker_with_default() {
        assert_eq!(parse_round("ベネッセ 数学 第2回"), Some(2));
        assert_eq!(parse_round("ベネッセ 数学"), Some(1));
    }

    #[test]
    fn benesse_names_match_in_any_case() {
        assert!(is_benesse("BENESSE 数学 第1回"));
        assert!(is_benesse("benesse 英語"));
        assert!(is_benesse("ベネッセ 数学"));
        assert!(!is_benesse("定期テスト 数学"));
    }

    #[test]
    fn full_width_round_numbers_are_read() {
        assert_eq!(parse_round("ベネッセ 数学 第２回"), Some(2));
        assert_eq!(parse_round("ベネッセ 数学 第１２回"), Some(12));
        // Arabic-Indic digits match the marker but are not a readable round
        assert_eq!(parse_round("ベネッセ 数学 第\u{0662}回"), None);
    }

    #[test]
    fn full_width_second_round_stays_its_own_point() {
        let rows = vec![
            row(1, "[中1] 数学", "ベネッセ 数学 第1回", 40.0, at(2021, 4, 14)),
            row(1, "[中1] 数学", "ベネッセ 数学 第２回", 80.0, at(2021, 11, 10)),
            row(1, "[中1] 数学", "ベネッセ 数学 第\u{0662}回", 10.0, at(2021, 12, 1)),
        ];
        let records = scores_from_rows(&spec(), &rows, &[1]);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key, ExamKey::new(2021, 1));
        assert_eq!(records[0].score, 40.0);
        assert_eq!(records[1].key, ExamKey::new(2021, 2));
        assert_eq!(records[1].score, 80.0);
    }

    #[test]
    fn grade_pattern_accepts_all_course_spellings() {
        let pattern = grade_pattern(2);
        assert!(pattern.is_match("[中2] 数学"));
        assert!(pattern.is_match("2年 英語 [中学]"));
        assert!(pattern.is_match("中学2年 英語"));
        assert!(!pattern.is_match("[中1] 数学"));
    }

    #[test]
    fn year_range_ends_in_third_grade() {
        let mut later = spec();
        later.start_grade = 2;
        assert_eq!(cohort_year_range(&spec()), 2021..=2023);
        assert_eq!(cohort_year_range(&later), 2021..=2022);
        assert_eq!(grade_for_year(&later, 2022), 3);
    }

    #[test]
    fn scores_are_grade_restricted_and_deduplicated() {
        let records = scores_from_rows(&spec(), &fixture(), &[1, 2]);

        let keys: Vec<(StudentId, ExamKey)> =
            records.iter().map(|r| (r.student_id, r.key)).collect();
        assert_eq!(
            keys,
            vec![
                (1, ExamKey::new(2021, 1)),
                (1, ExamKey::new(2021, 2)),
                (2, ExamKey::new(2021, 1)),
                (2, ExamKey::new(2022, 1)),
            ]
        );

        let merged = &records[1];
        assert_eq!(merged.score, 68.0);
        assert_eq!(merged.date, NaiveDate::from_ymd_opt(2021, 11, 9).unwrap());
    }

    #[tokio::test]
    async fn resolves_cohort_from_earliest_grade_row() {
        let source = CsvSource::from_records(fixture(), Vec::new());
        let cohort = resolve_cohort(&source, &spec()).await.unwrap();

        let anchor = cohort.anchor.expect("anchor");
        assert_eq!(anchor.key, ExamKey::new(2021, 1));
        assert_eq!(anchor.grade, 1);
        assert_eq!(cohort.student_ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn missing_anchor_gives_empty_cohort() {
        let source = CsvSource::from_records(Vec::new(), Vec::new());
        let cohort = resolve_cohort(&source, &spec()).await.unwrap();
        assert!(cohort.is_empty());
        assert!(cohort.anchor.is_none());
    }

    #[tokio::test]
    async fn anchor_skips_years_whose_first_row_is_a_later_round() {
        let rows = vec![
            row(1, "[中1] 数学", "ベネッセ 数学 第3回", 50.0, at(2021, 6, 1)),
            row(1, "[中2] 数学", "ベネッセ 数学 第1回", 50.0, at(2022, 4, 12)),
            row(5, "[中2] 数学", "ベネッセ 数学 第1回", 61.0, at(2022, 4, 12)),
        ];
        let source = CsvSource::from_records(rows, Vec::new());
        let cohort = resolve_cohort(&source, &spec()).await.unwrap();

        assert_eq!(cohort.anchor.unwrap().key, ExamKey::new(2022, 1));
        assert_eq!(cohort.student_ids, vec![1, 5]);
    }

    #[tokio::test]
    async fn empty_cohort_loads_no_scores() {
        let source = CsvSource::from_records(fixture(), Vec::new());
        assert!(load_scores(&source, &spec(), &[]).await.unwrap().is_empty());
    }
}
