//! Derived metrics for each cohort analysis.
//!
//! Every function here is pure over a loaded [`Panel`]; nothing touches the data source.

use std::collections::{BTreeMap, BTreeSet};

use crate::cohort::grade_for_year;
use crate::config::ScoreStat;
use crate::models::{
    EngagementPattern, ExamKey, LongRecord, PanelRow, Quartile, StudentId, Trajectory,
    UsageChange, UsageGroup,
};
use crate::panel::Panel;
use crate::stats::{
    assign_quartiles, classify_trajectory, engagement_pattern, inequality_spread, mean, median,
    percentile_ranks, qcut, usage_change_bin,
};

/// Percentile cut-off for the initial bottom quartile.
const BOTTOM_QUARTILE_PCT: f64 = 25.0;
/// Drop in percentile that counts as a setback.
const SETBACK_PCT: f64 = -10.0;

#[derive(Debug, Clone, PartialEq)]
pub struct QuartileScore {
    pub key: ExamKey,
    pub usage_quartile: Quartile,
    pub score: Option<f64>,
    pub n: usize,
}

/// Representative score of each usage quartile at every kept point.
pub fn usage_quartile_scores(panel: &Panel, stat: ScoreStat) -> Vec<QuartileScore> {
    let mut out = Vec::new();

    for point in &panel.points {
        let rows: Vec<&PanelRow> = panel.rows_at(point.key).collect();
        let hours: Vec<f64> = rows.iter().map(|row| row.hours).collect();
        let quartiles = assign_quartiles(&hours);

        for usage_quartile in Quartile::ALL {
            let scores: Vec<f64> = rows
                .iter()
                .zip(&quartiles)
                .filter(|(_, q)| **q == usage_quartile)
                .map(|(row, _)| row.score)
                .collect();
            let score = match stat {
                ScoreStat::Median => median(&scores),
                ScoreStat::Mean => mean(&scores),
            };
            out.push(QuartileScore {
                key: point.key,
                usage_quartile,
                score,
                n: scores.len(),
            });
        }
    }

    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsageShare {
    pub key: ExamKey,
    pub usage_quartile: Quartile,
    pub share: f64,
}

/// Share of all usage hours held by each usage quartile at every kept point.
pub fn usage_concentration(panel: &Panel) -> Vec<UsageShare> {
    let mut out = Vec::new();

    for point in &panel.points {
        let hours: Vec<f64> = panel.rows_at(point.key).map(|row| row.hours).collect();
        let quartiles = assign_quartiles(&hours);
        let total: f64 = hours.iter().sum();

        for usage_quartile in Quartile::ALL {
            let held: f64 = hours
                .iter()
                .zip(&quartiles)
                .filter(|(_, q)| **q == usage_quartile)
                .map(|(h, _)| *h)
                .sum();
            let share = if total > 0.0 { held / total } else { 0.0 };
            out.push(UsageShare {
                key: point.key,
                usage_quartile,
                share,
            });
        }
    }

    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct Inequality {
    pub key: ExamKey,
    pub iqr: f64,
    pub n: usize,
}

/// Interquartile range of raw scores per exam point; small points are skipped.
pub fn inequality_over_time(panel: &Panel, min_sample: usize) -> Vec<Inequality> {
    panel
        .scores_by_point()
        .into_iter()
        .filter_map(|(key, scores)| {
            inequality_spread(&scores, min_sample).map(|iqr| Inequality {
                key,
                iqr,
                n: scores.len(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct StudentTrajectory {
    pub student_id: StudentId,
    pub trajectory: Trajectory,
    pub usage_hours: f64,
    pub usage_percentile: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrajectorySummary {
    pub trajectory: Trajectory,
    pub usage_median: f64,
    pub n_students: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryOutcome {
    pub students: Vec<StudentTrajectory>,
    pub summary: Vec<TrajectorySummary>,
}

/// Classifies percentile trajectories and compares their relative usage.
///
/// Returns `None` when the cohort has fewer than three kept exam points.
pub fn trajectory_vs_engagement(panel: &Panel) -> Option<TrajectoryOutcome> {
    if panel.points.len() < 3 {
        return None;
    }

    let mut classified: Vec<(StudentId, Trajectory, f64)> = Vec::new();
    for (student_id, rows) in panel.by_student() {
        let percentiles: Vec<f64> = rows.iter().map(|row| row.percentile).collect();
        if let Some(trajectory) = classify_trajectory(&percentiles) {
            let hours = rows.iter().map(|row| row.hours).sum();
            classified.push((student_id, trajectory, hours));
        }
    }

    let hours: Vec<f64> = classified.iter().map(|(_, _, h)| *h).collect();
    let students: Vec<StudentTrajectory> = classified
        .iter()
        .zip(percentile_ranks(&hours))
        .map(|(&(student_id, trajectory, usage_hours), usage_percentile)| StudentTrajectory {
            student_id,
            trajectory,
            usage_hours,
            usage_percentile,
        })
        .collect();

    let mut grouped: BTreeMap<Trajectory, Vec<f64>> = BTreeMap::new();
    for student in &students {
        grouped
            .entry(student.trajectory)
            .or_default()
            .push(student.usage_percentile);
    }

    let mut summary: Vec<TrajectorySummary> = grouped
        .into_iter()
        .filter_map(|(trajectory, values)| {
            median(&values).map(|usage_median| TrajectorySummary {
                trajectory,
                usage_median,
                n_students: values.len(),
            })
        })
        .collect();
    summary.sort_by(|a, b| a.usage_median.total_cmp(&b.usage_median));

    Some(TrajectoryOutcome { students, summary })
}

/// Change between a student's consecutive exam rows, attached to the later point.
#[derive(Debug, Clone, PartialEq)]
struct Step {
    student_id: StudentId,
    to: ExamKey,
    delta_hours: f64,
    delta_score: f64,
    delta_percentile: f64,
    previous_score: f64,
}

fn steps(panel: &Panel) -> Vec<Step> {
    let mut out = Vec::new();
    for (student_id, rows) in panel.by_student() {
        for pair in rows.windows(2) {
            let (prev, curr) = (pair[0], pair[1]);
            out.push(Step {
                student_id,
                to: curr.key,
                delta_hours: curr.hours - prev.hours,
                delta_score: curr.score - prev.score,
                delta_percentile: curr.percentile - prev.percentile,
                previous_score: prev.score,
            });
        }
    }
    out
}

/// Labels every item with the equal-frequency quartile of `value`, per group.
///
/// Groups whose quartile edges collapse are left out entirely.
fn quartiles_within<T, G, V>(items: &[T], group: G, value: V) -> Vec<(usize, Quartile)>
where
    G: Fn(&T) -> ExamKey,
    V: Fn(&T) -> f64,
{
    let mut by_group: BTreeMap<ExamKey, Vec<usize>> = BTreeMap::new();
    for (index, item) in items.iter().enumerate() {
        by_group.entry(group(item)).or_default().push(index);
    }

    let mut out = Vec::new();
    for indices in by_group.values() {
        let values: Vec<f64> = indices.iter().map(|&i| value(&items[i])).collect();
        let Some(bins) = qcut(&values, 4) else {
            continue;
        };
        for (&index, bin) in indices.iter().zip(bins) {
            if let Some(quartile) = Quartile::from_index(bin) {
                out.push((index, quartile));
            }
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionResponse {
    pub from: ExamKey,
    pub to: ExamKey,
    pub usage_change: UsageChange,
    pub baseline_quartile: Quartile,
    pub delta_percentile_median: Option<f64>,
    pub n_students: usize,
}

/// Percentile change at the next exam by usage change and starting score quartile.
pub fn transition_response(panel: &Panel) -> Vec<TransitionResponse> {
    let steps = steps(panel);
    let labelled = quartiles_within(&steps, |s| s.to, |s| s.previous_score);

    let mut out = Vec::new();
    for pair in panel.points.windows(2) {
        let (from, to) = (pair[0].key, pair[1].key);

        for usage_change in UsageChange::ALL {
            for baseline_quartile in Quartile::ALL {
                let matching: Vec<&Step> = labelled
                    .iter()
                    .map(|&(i, q)| (&steps[i], q))
                    .filter(|(step, q)| {
                        step.to == to
                            && *q == baseline_quartile
                            && usage_change_bin(step.delta_hours) == usage_change
                    })
                    .map(|(step, _)| step)
                    .collect();
                let deltas: Vec<f64> = matching.iter().map(|s| s.delta_percentile).collect();
                let students: BTreeSet<StudentId> =
                    matching.iter().map(|s| s.student_id).collect();

                out.push(TransitionResponse {
                    from,
                    to,
                    usage_change,
                    baseline_quartile,
                    delta_percentile_median: median(&deltas),
                    n_students: students.len(),
                });
            }
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsageChangeEffect {
    pub usage_change: UsageChange,
    pub delta_score_median: Option<f64>,
    pub n_students: usize,
}

/// Within-student view: each student's typical usage change against typical score change.
pub fn usage_change_vs_score(panel: &Panel) -> Vec<UsageChangeEffect> {
    let mut per_student: BTreeMap<StudentId, (Vec<f64>, Vec<f64>)> = BTreeMap::new();
    for step in steps(panel) {
        let entry = per_student.entry(step.student_id).or_default();
        entry.0.push(step.delta_hours);
        entry.1.push(step.delta_score);
    }

    let typical: Vec<(UsageChange, f64)> = per_student
        .values()
        .filter_map(|(hours, scores)| Some((usage_change_bin(median(hours)?), median(scores)?)))
        .collect();

    UsageChange::ALL
        .iter()
        .map(|&usage_change| {
            let scores: Vec<f64> = typical
                .iter()
                .filter(|(bin, _)| *bin == usage_change)
                .map(|(_, score)| *score)
                .collect();
            UsageChangeEffect {
                usage_change,
                delta_score_median: median(&scores),
                n_students: scores.len(),
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistenceGroup {
    pub usage_group: UsageGroup,
    pub median_gain: f64,
    pub n: usize,
}

fn usage_groups(mean_usage: &[f64]) -> Vec<UsageGroup> {
    let mut groups = vec![UsageGroup::NoUsage; mean_usage.len()];
    let users: Vec<usize> = (0..mean_usage.len()).filter(|&i| mean_usage[i] > 0.0).collect();
    if users.len() < 3 {
        return groups;
    }

    let values: Vec<f64> = users.iter().map(|&i| mean_usage[i]).collect();
    let terciles = [UsageGroup::Low, UsageGroup::Mid, UsageGroup::High];
    let bins = qcut(&values, 3).unwrap_or_else(|| {
        percentile_ranks(&values)
            .into_iter()
            .map(|pct| {
                if pct <= 100.0 / 3.0 {
                    0
                } else if pct <= 200.0 / 3.0 {
                    1
                } else {
                    2
                }
            })
            .collect()
    });

    for (&i, bin) in users.iter().zip(bins) {
        groups[i] = terciles[bin.min(2)];
    }
    groups
}

/// Longitudinal percentile gain of the students who started in the bottom quartile,
/// grouped by their relative BookRoll usage.
pub fn q1_persistence(panel: &Panel) -> Vec<PersistenceGroup> {
    let Some(first) = panel.points.first() else {
        return Vec::new();
    };
    let bottom: BTreeSet<StudentId> = panel
        .rows_at(first.key)
        .filter(|row| row.percentile <= BOTTOM_QUARTILE_PCT)
        .map(|row| row.student_id)
        .collect();

    let mut mean_usage = Vec::new();
    let mut gains = Vec::new();
    for (student_id, rows) in panel.by_student() {
        if !bottom.contains(&student_id) || rows.len() < 2 {
            continue;
        }
        let hours: Vec<f64> = rows.iter().map(|row| row.hours).collect();
        mean_usage.push(mean(&hours).unwrap_or(0.0));
        gains.push(rows[rows.len() - 1].percentile - rows[0].percentile);
    }

    let groups = usage_groups(&mean_usage);
    UsageGroup::ALL
        .iter()
        .map(|&usage_group| {
            let in_group: Vec<f64> = gains
                .iter()
                .zip(&groups)
                .filter(|(_, g)| **g == usage_group)
                .map(|(gain, _)| *gain)
                .collect();
            PersistenceGroup {
                usage_group,
                median_gain: median(&in_group).unwrap_or(0.0),
                n: in_group.len(),
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetbackRecovery {
    pub pattern: EngagementPattern,
    pub baseline_quartile: Quartile,
    pub median_recovery: f64,
    pub n_students: usize,
}

struct Setback<'a> {
    student_id: StudentId,
    key: ExamKey,
    previous_percentile: f64,
    /// The student's rows from the setback point onward.
    from_setback: Vec<&'a PanelRow>,
}

/// Engagement in the two windows after a percentile drop and the recovery it precedes.
pub fn setback_recovery(panel: &Panel) -> Vec<SetbackRecovery> {
    let by_student = panel.by_student();

    let mut setbacks = Vec::new();
    for (&student_id, rows) in &by_student {
        for i in 1..rows.len() {
            if rows[i].percentile - rows[i - 1].percentile <= SETBACK_PCT {
                setbacks.push(Setback {
                    student_id,
                    key: rows[i].key,
                    previous_percentile: rows[i - 1].percentile,
                    from_setback: rows[i..].to_vec(),
                });
            }
        }
    }

    let labelled = quartiles_within(&setbacks, |s| s.key, |s| s.previous_percentile);

    let mut grouped: BTreeMap<(EngagementPattern, Quartile), (Vec<f64>, BTreeSet<StudentId>)> =
        BTreeMap::new();
    for (index, baseline_quartile) in labelled {
        let setback = &setbacks[index];
        let rows = &setback.from_setback;
        if rows.len() < 3 {
            continue;
        }
        let pattern = engagement_pattern(rows[1].hours, rows[2].hours);
        let entry = grouped.entry((pattern, baseline_quartile)).or_default();
        entry.0.push(rows[2].percentile - rows[0].percentile);
        entry.1.insert(setback.student_id);
    }

    grouped
        .into_iter()
        .filter_map(|((pattern, baseline_quartile), (recoveries, students))| {
            median(&recoveries).map(|median_recovery| SetbackRecovery {
                pattern,
                baseline_quartile,
                median_recovery,
                n_students: students.len(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabelMean {
    pub time_label: String,
    pub mean_score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CohortLines {
    pub labels: Vec<String>,
    /// Students with a score at every label, each with scores in label order.
    pub students: Vec<(StudentId, Vec<f64>)>,
    pub means: Vec<LabelMean>,
}

/// Labels in chronological order of their (year, round).
pub fn ordered_labels(records: &[LongRecord]) -> Vec<String> {
    let mut seen: BTreeMap<String, (i32, u8)> = BTreeMap::new();
    for record in records {
        let order = (record.year, record.exam_round);
        seen.entry(record.time_label.clone())
            .and_modify(|existing| *existing = (*existing).min(order))
            .or_insert(order);
    }
    let mut labels: Vec<(String, (i32, u8))> = seen.into_iter().collect();
    labels.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    labels.into_iter().map(|(label, _)| label).collect()
}

/// Per-student score lines across `labels`, keeping only complete students.
///
/// Returns `None` when no student has a score at every label.
pub fn cohort_lines(records: &[LongRecord], labels: &[String]) -> Option<CohortLines> {
    let mut sums: BTreeMap<(StudentId, &str), (f64, usize)> = BTreeMap::new();
    for record in records {
        if !labels.contains(&record.time_label) {
            continue;
        }
        let entry = sums
            .entry((record.student_id, record.time_label.as_str()))
            .or_default();
        entry.0 += record.raw_score;
        entry.1 += 1;
    }

    let ids: BTreeSet<StudentId> = sums.keys().map(|(id, _)| *id).collect();
    let students: Vec<(StudentId, Vec<f64>)> = ids
        .into_iter()
        .filter_map(|id| {
            let scores = labels
                .iter()
                .map(|label| {
                    sums.get(&(id, label.as_str()))
                        .map(|(total, count)| total / *count as f64)
                })
                .collect::<Option<Vec<f64>>>()?;
            Some((id, scores))
        })
        .collect();

    if students.is_empty() || labels.is_empty() {
        return None;
    }

    let means = labels
        .iter()
        .enumerate()
        .map(|(i, label)| {
            let column: Vec<f64> = students.iter().map(|(_, scores)| scores[i]).collect();
            LabelMean {
                time_label: label.clone(),
                mean_score: mean(&column).unwrap_or(0.0),
            }
        })
        .collect();

    Some(CohortLines {
        labels: labels.to_vec(),
        students,
        means,
    })
}

/// The panel's scores in the long cohort CSV layout.
pub fn export_long(panel: &Panel) -> Vec<LongRecord> {
    let mut records: Vec<LongRecord> = panel
        .scores
        .iter()
        .map(|record| {
            let grade = grade_for_year(&panel.spec, record.key.exam_year);
            LongRecord {
                student_id: record.student_id,
                year: record.key.exam_year,
                grade: format!("中{grade}"),
                subject: panel.spec.subject.slug().to_string(),
                exam_round: record.key.exam_round,
                raw_score: record.score,
                source: panel.source.to_string(),
                time_label: format!(
                    "{}年度 中{} 第{}回",
                    record.key.exam_year, grade, record.key.exam_round
                ),
            }
        })
        .collect();
    records.sort_by(|a, b| {
        (a.student_id, a.year, a.exam_round).cmp(&(b.student_id, b.year, b.exam_round))
    });
    records
}
