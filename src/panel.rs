use std::collections::BTreeMap;

use anyhow::Context;
use tracing::{info, warn};

use crate::cohort::{load_scores, resolve_cohort};
use crate::config::AnalysisConfig;
use crate::models::{
    Cohort, CohortSpec, ExamKey, ExamPoint, PanelRow, PrepWindow, ScoreRecord, StudentId,
};
use crate::points::{drop_spring_round, exam_points, prep_windows};
use crate::source::DataSource;
use crate::stats::percentile_ranks;

/// Everything an analysis needs about one cohort, loaded up front.
#[derive(Debug, Clone)]
pub struct Panel {
    pub spec: CohortSpec,
    pub cohort: Cohort,
    /// Scores at every exam point, including a dropped spring round.
    pub scores: Vec<ScoreRecord>,
    /// Exam points kept for usage analysis.
    pub points: Vec<ExamPoint>,
    pub windows: Vec<PrepWindow>,
    /// One row per student per kept point, in (key, student) order.
    pub rows: Vec<PanelRow>,
    pub source: &'static str,
}

impl Panel {
    pub fn rows_at(&self, key: ExamKey) -> impl Iterator<Item = &PanelRow> {
        self.rows.iter().filter(move |row| row.key == key)
    }

    /// Each student's rows in chronological order.
    pub fn by_student(&self) -> BTreeMap<StudentId, Vec<&PanelRow>> {
        let mut grouped: BTreeMap<StudentId, Vec<&PanelRow>> = BTreeMap::new();
        for row in &self.rows {
            grouped.entry(row.student_id).or_default().push(row);
        }
        for rows in grouped.values_mut() {
            rows.sort_by_key(|row| row.key);
        }
        grouped
    }

    /// Raw scores per exam point across every loaded point.
    pub fn scores_by_point(&self) -> BTreeMap<ExamKey, Vec<f64>> {
        let mut grouped: BTreeMap<ExamKey, Vec<f64>> = BTreeMap::new();
        for record in &self.scores {
            grouped.entry(record.key).or_default().push(record.score);
        }
        grouped
    }
}

/// Fills `percentile` per exam point from the rows' scores.
pub fn rank_within_points(rows: &mut [PanelRow]) {
    let mut by_key: BTreeMap<ExamKey, Vec<usize>> = BTreeMap::new();
    for (index, row) in rows.iter().enumerate() {
        by_key.entry(row.key).or_default().push(index);
    }
    for indices in by_key.values() {
        let scores: Vec<f64> = indices.iter().map(|&i| rows[i].score).collect();
        for (&i, percentile) in indices.iter().zip(percentile_ranks(&scores)) {
            rows[i].percentile = percentile;
        }
    }
}

/// Loads the cohort panel and closes the source before returning.
///
/// `Ok(None)` means there was nothing to analyse; the reason has been logged.
pub async fn build_panel<S: DataSource>(
    source: S,
    spec: &CohortSpec,
    config: &AnalysisConfig,
) -> anyhow::Result<Option<Panel>> {
    let label = source.label();
    let built = collect(&source, spec, config).await;
    source.close().await;

    let mut panel = built?;
    if let Some(panel) = panel.as_mut() {
        panel.source = label;
    }
    Ok(panel)
}

async fn collect<S: DataSource>(
    source: &S,
    spec: &CohortSpec,
    config: &AnalysisConfig,
) -> anyhow::Result<Option<Panel>> {
    let cohort = resolve_cohort(source, spec).await?;
    if cohort.is_empty() {
        warn!("no cohort students found (no anchor exam)");
        return Ok(None);
    }

    let scores = load_scores(source, spec, &cohort.student_ids).await?;
    if scores.is_empty() {
        warn!("no Benesse scores left after the grade restriction");
        return Ok(None);
    }

    let points = drop_spring_round(exam_points(&scores), &config.spring);
    if points.is_empty() {
        warn!("no exam points left to analyse");
        return Ok(None);
    }
    for point in &points {
        info!(point = %point.key, date = %point.date, students = point.n_students, "exam point");
    }

    let origin = config
        .origin
        .date_in(spec.start_year)
        .context("preparation origin is not a valid date")?;
    let windows = prep_windows(&points, origin);

    let mut rows = Vec::new();
    for window in &windows {
        info!(point = %window.key, start = %window.start, end = %window.end, "preparation window");

        let at_point: Vec<&ScoreRecord> = scores.iter().filter(|r| r.key == window.key).collect();
        let students: Vec<StudentId> = at_point.iter().map(|r| r.student_id).collect();
        let totals = source
            .usage_totals(&students, window, spec.subject, &config.usage)
            .await
            .with_context(|| format!("failed to load usage for {}", window.key))?;

        for (record, total) in at_point.iter().zip(&totals) {
            rows.push(PanelRow {
                student_id: record.student_id,
                key: record.key,
                score: record.score,
                percentile: 0.0,
                hours: config.usage.hours(total),
            });
        }
    }
    rank_within_points(&mut rows);

    Ok(Some(Panel {
        spec: *spec,
        cohort,
        scores,
        points,
        windows,
        rows,
        source: "",
    }))
}
