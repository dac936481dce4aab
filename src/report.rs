use std::fmt::Write;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::analysis::{
    CohortLines, Inequality, PersistenceGroup, QuartileScore, SetbackRecovery, TrajectoryOutcome,
    TransitionResponse, UsageChangeEffect, UsageShare,
};
use crate::models::{
    EngagementPattern, ExamPoint, LongRecord, PrepWindow, Subject, Trajectory, UsageChange,
    UsageGroup,
};
use crate::panel::Panel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Locale {
    Ja,
    En,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Analysis {
    UsageQuartiles,
    Concentration,
    Inequality,
    Trajectory,
    Transitions,
    UsageChange,
    Q1Persistence,
    SetbackRecovery,
    CohortLines,
    ExportLong,
}

impl Analysis {
    pub fn slug(self) -> &'static str {
        match self {
            Analysis::UsageQuartiles => "usage_quartiles",
            Analysis::Concentration => "concentration",
            Analysis::Inequality => "inequality",
            Analysis::Trajectory => "trajectory",
            Analysis::Transitions => "transitions",
            Analysis::UsageChange => "usage_change",
            Analysis::Q1Persistence => "q1_persistence",
            Analysis::SetbackRecovery => "setback_recovery",
            Analysis::CohortLines => "cohort_lines",
            Analysis::ExportLong => "long",
        }
    }
}

/// Labels for everything a reader sees, in one locale.
#[derive(Debug, Clone, Copy)]
pub struct ReportStyle {
    pub locale: Locale,
}

impl ReportStyle {
    pub fn new(locale: Locale) -> Self {
        Self { locale }
    }

    fn pick(&self, ja: &'static str, en: &'static str) -> &'static str {
        match self.locale {
            Locale::Ja => ja,
            Locale::En => en,
        }
    }

    pub fn subject(&self, subject: Subject) -> &'static str {
        match subject {
            Subject::Math => self.pick("数学", "Math"),
            Subject::English => self.pick("英語", "English"),
        }
    }

    pub fn trajectory(&self, trajectory: Trajectory) -> &'static str {
        match trajectory {
            Trajectory::StableHigh => self.pick("安定・高位", "Stable high"),
            Trajectory::StableLow => self.pick("安定・低位", "Stable low"),
            Trajectory::Rising => self.pick("上昇型", "Rising"),
            Trajectory::Falling => self.pick("下降型", "Falling"),
            Trajectory::Recovering => self.pick("回復型", "Recovering"),
            Trajectory::Volatile => self.pick("不安定", "Volatile"),
            Trajectory::Other => self.pick("その他", "Other"),
        }
    }

    pub fn usage_change(&self, change: UsageChange) -> &'static str {
        match change {
            UsageChange::LargeDecrease => self.pick("大きく減少", "Large decrease"),
            UsageChange::SlightDecrease => self.pick("やや減少", "Slight decrease"),
            UsageChange::NoChange => self.pick("ほぼ変化なし", "No change"),
            UsageChange::SlightIncrease => self.pick("やや増加", "Slight increase"),
            UsageChange::LargeIncrease => self.pick("大きく増加", "Large increase"),
        }
    }

    pub fn pattern(&self, pattern: EngagementPattern) -> &'static str {
        match pattern {
            EngagementPattern::NoUsage => self.pick("利用なし", "No usage"),
            EngagementPattern::Temporary => self.pick("一時的増加", "Temporary"),
            EngagementPattern::Delayed => self.pick("遅れて増加", "Delayed"),
            EngagementPattern::Sustained => self.pick("継続的増加", "Sustained"),
            EngagementPattern::Unstable => self.pick("不安定", "Unstable"),
        }
    }

    pub fn usage_group(&self, group: UsageGroup) -> &'static str {
        match group {
            UsageGroup::NoUsage => self.pick("未利用", "No usage"),
            UsageGroup::Low => self.pick("低利用", "Low"),
            UsageGroup::Mid => self.pick("中利用", "Mid"),
            UsageGroup::High => self.pick("高利用", "High"),
        }
    }

    pub fn title(&self, analysis: Analysis) -> &'static str {
        match analysis {
            Analysis::UsageQuartiles => {
                self.pick("利用量四分位別の得点", "Score by usage quartile")
            }
            Analysis::Concentration => self.pick("利用時間の集中度", "Usage concentration"),
            Analysis::Inequality => {
                self.pick("得点格差の推移 (IQR)", "Score inequality over time (IQR)")
            }
            Analysis::Trajectory => self.pick("成績推移パターンと利用", "Trajectory vs engagement"),
            Analysis::Transitions => self.pick("利用変化と次回の順位変化", "Transition response"),
            Analysis::UsageChange => {
                self.pick("利用変化と得点変化", "Usage change vs score change")
            }
            Analysis::Q1Persistence => {
                self.pick("下位層の利用と伸び", "Bottom-quartile persistence")
            }
            Analysis::SetbackRecovery => self.pick("成績低下後の利用と回復", "Setback recovery"),
            Analysis::CohortLines => self.pick("コホート得点推移", "Cohort score lines"),
            Analysis::ExportLong => self.pick("縦持ちデータ", "Long export"),
        }
    }

    fn missing(&self) -> &'static str {
        self.pick("データなし", "no data")
    }

    fn cohort_line(&self, panel: &Panel) -> String {
        let spec = &panel.spec;
        let subject = self.subject(spec.subject);
        let n = panel.cohort.student_ids.len();
        match self.locale {
            Locale::Ja => format!(
                "{subject} / {}年度 中{}開始コホート ({n}人, データ元: {})",
                spec.start_year, spec.start_grade, panel.source
            ),
            Locale::En => format!(
                "{subject} / {} cohort, grade {} start ({n} students, source: {})",
                spec.start_year, spec.start_grade, panel.source
            ),
        }
    }

    fn point_line(&self, point: &ExamPoint, window: Option<&PrepWindow>) -> String {
        let (key, date, n) = (point.key, point.date, point.n_students);
        match (self.locale, window) {
            (Locale::Ja, Some(w)) => {
                format!("- {key} ({date}): {n}人, 利用集計期間 {} から {}", w.start, w.end)
            }
            (Locale::Ja, None) => format!("- {key} ({date}): {n}人"),
            (Locale::En, Some(w)) => {
                format!("- {key} on {date}: {n} students, usage window {} to {}", w.start, w.end)
            }
            (Locale::En, None) => format!("- {key} on {date}: {n} students"),
        }
    }
}

/// A rendered result: header row plus string cells.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    fn new(headers: &[&str]) -> Self {
        Self {
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    fn push(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn to_markdown(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "| {} |", self.headers.join(" | "));
        let _ = writeln!(output, "|{}", "---|".repeat(self.headers.len()));
        for row in &self.rows {
            let _ = writeln!(output, "| {} |", row.join(" | "));
        }
        output
    }

    pub fn write_csv(&self, path: &Path) -> anyhow::Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn number(value: f64) -> String {
    format!("{value:.2}")
}

fn optional(value: Option<f64>) -> String {
    value.map(number).unwrap_or_default()
}

pub fn quartile_table(rows: &[QuartileScore]) -> Table {
    let mut table = Table::new(&["exam_point", "usage_quartile", "score", "n"]);
    for row in rows {
        table.push(vec![
            row.key.to_string(),
            row.usage_quartile.to_string(),
            optional(row.score),
            row.n.to_string(),
        ]);
    }
    table
}

pub fn concentration_table(rows: &[UsageShare]) -> Table {
    let mut table = Table::new(&["exam_point", "usage_quartile", "share"]);
    for row in rows {
        table.push(vec![
            row.key.to_string(),
            row.usage_quartile.to_string(),
            format!("{:.4}", row.share),
        ]);
    }
    table
}

pub fn inequality_table(rows: &[Inequality]) -> Table {
    let mut table = Table::new(&["exam_point", "iqr", "n"]);
    for row in rows {
        table.push(vec![row.key.to_string(), number(row.iqr), row.n.to_string()]);
    }
    table
}

pub fn trajectory_table(outcome: &TrajectoryOutcome, style: &ReportStyle) -> Table {
    let mut table = Table::new(&["trajectory", "usage_percentile_median", "n_students"]);
    for row in &outcome.summary {
        table.push(vec![
            style.trajectory(row.trajectory).to_string(),
            number(row.usage_median),
            row.n_students.to_string(),
        ]);
    }
    table
}

pub fn transition_table(rows: &[TransitionResponse], style: &ReportStyle) -> Table {
    let mut table = Table::new(&[
        "transition",
        "usage_change",
        "baseline_quartile",
        "delta_percentile_median",
        "n_students",
    ]);
    for row in rows {
        table.push(vec![
            format!("{} → {}", row.from, row.to),
            style.usage_change(row.usage_change).to_string(),
            row.baseline_quartile.to_string(),
            optional(row.delta_percentile_median),
            row.n_students.to_string(),
        ]);
    }
    table
}

pub fn usage_change_table(rows: &[UsageChangeEffect], style: &ReportStyle) -> Table {
    let mut table = Table::new(&["usage_change", "delta_score_median", "n_students"]);
    for row in rows {
        table.push(vec![
            style.usage_change(row.usage_change).to_string(),
            optional(row.delta_score_median),
            row.n_students.to_string(),
        ]);
    }
    table
}

pub fn persistence_table(rows: &[PersistenceGroup], style: &ReportStyle) -> Table {
    let mut table = Table::new(&["usage_group", "median_gain", "n"]);
    for row in rows {
        table.push(vec![
            style.usage_group(row.usage_group).to_string(),
            number(row.median_gain),
            row.n.to_string(),
        ]);
    }
    table
}

pub fn setback_table(rows: &[SetbackRecovery], style: &ReportStyle) -> Table {
    let mut table = Table::new(&["pattern", "baseline_quartile", "median_recovery", "n_students"]);
    for row in rows {
        table.push(vec![
            style.pattern(row.pattern).to_string(),
            row.baseline_quartile.to_string(),
            number(row.median_recovery),
            row.n_students.to_string(),
        ]);
    }
    table
}

/// Per-label means followed by one row per complete student.
pub fn cohort_lines_table(lines: &CohortLines) -> Table {
    let mut headers = vec!["student_id".to_string()];
    headers.extend(lines.labels.iter().cloned());
    let mut table = Table {
        headers,
        rows: Vec::new(),
    };

    let mut means = vec!["mean".to_string()];
    means.extend(lines.means.iter().map(|m| number(m.mean_score)));
    table.push(means);

    for (student_id, scores) in &lines.students {
        let mut row = vec![student_id.to_string()];
        row.extend(scores.iter().copied().map(number));
        table.push(row);
    }
    table
}

pub fn write_long_csv(path: &Path, records: &[LongRecord]) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn output_stem(subject: Subject, year: i32, analysis: Analysis) -> String {
    format!("{}_{}_{}", subject.slug(), year, analysis.slug())
}

/// Markdown for one analysis run; `panel` adds the cohort, points and windows.
pub fn build_report(
    analysis: Analysis,
    panel: Option<&Panel>,
    table: &Table,
    style: &ReportStyle,
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# {}", style.title(analysis));
    if let Some(panel) = panel {
        let _ = writeln!(output, "{}", style.cohort_line(panel));
        if let Some(anchor) = &panel.cohort.anchor {
            let _ = writeln!(
                output,
                "{}: {} ({})",
                style.pick("基準試験", "Anchor exam"),
                anchor.key,
                anchor.date.date()
            );
        }

        let _ = writeln!(output);
        let _ = writeln!(output, "## {}", style.pick("試験回", "Exam Points"));
        for point in &panel.points {
            let window = panel.windows.iter().find(|w| w.key == point.key);
            let _ = writeln!(output, "{}", style.point_line(point, window));
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## {}", style.pick("結果", "Results"));
    if table.is_empty() {
        let _ = writeln!(output, "{}", style.missing());
    } else {
        output.push_str(&table.to_markdown());
    }

    output
}

/// Writes `{stem}.csv` and `{stem}.md` into `out_dir`, replacing earlier runs.
pub fn write_outputs(
    out_dir: &Path,
    stem: &str,
    table: &Table,
    report: &str,
) -> anyhow::Result<(PathBuf, PathBuf)> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;

    let csv_path = out_dir.join(format!("{stem}.csv"));
    table.write_csv(&csv_path)?;

    let md_path = out_dir.join(format!("{stem}.md"));
    fs::write(&md_path, report).with_context(|| format!("failed to write {}", md_path.display()))?;

    Ok((csv_path, md_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{LabelMean, TrajectorySummary};
    use crate::models::{Anchor, Cohort, CohortSpec, ExamKey, Quartile};
    use chrono::{Datelike, NaiveDate};

    #[test]
    fn labels_follow_locale() {
        let ja = ReportStyle::new(Locale::Ja);
        let en = ReportStyle::new(Locale::En);
        assert_eq!(ja.trajectory(Trajectory::StableHigh), "安定・高位");
        assert_eq!(en.trajectory(Trajectory::StableHigh), "Stable high");
        assert_eq!(ja.usage_change(UsageChange::NoChange), "ほぼ変化なし");
        assert_eq!(ja.pattern(EngagementPattern::Sustained), "継続的増加");
        assert_eq!(ja.usage_group(UsageGroup::NoUsage), "未利用");
        assert_eq!(en.subject(Subject::English), "English");
    }

    #[test]
    fn empty_scores_render_as_blank_cells() {
        let table = quartile_table(&[QuartileScore {
            key: ExamKey::new(2021, 2),
            usage_quartile: Quartile::Q4,
            score: None,
            n: 0,
        }]);
        assert_eq!(table.rows[0], vec!["2021 R2", "Q4", "", "0"]);
    }

    #[test]
    fn report_without_panel_lists_results() {
        let outcome = TrajectoryOutcome {
            students: Vec::new(),
            summary: vec![TrajectorySummary {
                trajectory: Trajectory::Rising,
                usage_median: 62.5,
                n_students: 4,
            }],
        };
        let style = ReportStyle::new(Locale::En);
        let table = trajectory_table(&outcome, &style);
        let report = build_report(Analysis::Trajectory, None, &table, &style);

        assert!(report.starts_with("# Trajectory vs engagement\n"));
        assert!(report.contains("| trajectory | usage_percentile_median | n_students |"));
        assert!(report.contains("| Rising | 62.50 | 4 |"));
    }

    fn small_panel() -> Panel {
        let key = ExamKey::new(2021, 2);
        let date = NaiveDate::from_ymd_opt(2021, 7, 1).unwrap();
        Panel {
            spec: CohortSpec {
                start_year: 2021,
                start_grade: 1,
                subject: Subject::Math,
            },
            cohort: Cohort {
                anchor: Some(Anchor {
                    key: ExamKey::new(2021, 1),
                    date: date.with_month(5).unwrap().and_hms_opt(9, 0, 0).unwrap(),
                    grade: 1,
                }),
                student_ids: vec![1, 2],
            },
            scores: Vec::new(),
            points: vec![ExamPoint {
                key,
                date,
                n_students: 2,
            }],
            windows: vec![PrepWindow {
                key,
                start: NaiveDate::from_ymd_opt(2021, 4, 1).unwrap(),
                end: date,
            }],
            rows: Vec::new(),
            source: "csv",
        }
    }

    #[test]
    fn japanese_report_has_no_english_headings() {
        let panel = small_panel();
        let style = ReportStyle::new(Locale::Ja);
        let table = inequality_table(&[]);
        let report = build_report(Analysis::Inequality, Some(&panel), &table, &style);

        assert!(report.contains("数学 / 2021年度 中1開始コホート (2人, データ元: csv)"));
        assert!(report.contains("基準試験: 2021 R1 (2021-05-01)"));
        assert!(report.contains("## 試験回\n"));
        assert!(report.contains("- 2021 R2 (2021-07-01): 2人, 利用集計期間 2021-04-01"));
        assert!(report.contains("## 結果\n"));
        for english in ["cohort", "Anchor", "Exam Points", "Results", "students"] {
            assert!(!report.contains(english), "{english} in {report}");
        }
    }

    #[test]
    fn english_report_describes_the_panel() {
        let panel = small_panel();
        let style = ReportStyle::new(Locale::En);
        let table = inequality_table(&[]);
        let report = build_report(Analysis::Inequality, Some(&panel), &table, &style);

        assert!(report.contains("Math / 2021 cohort, grade 1 start (2 students, source: csv)"));
        assert!(report.contains("Anchor exam: 2021 R1 (2021-05-01)"));
        assert!(report.contains("- 2021 R2 on 2021-07-01: 2 students, usage window"));
        assert!(report.contains("## Results\n"));
    }

    #[test]
    fn empty_table_says_so() {
        let style = ReportStyle::new(Locale::Ja);
        let table = inequality_table(&[]);
        let report = build_report(Analysis::Inequality, None, &table, &style);
        assert!(report.contains("データなし"));
    }

    #[test]
    fn cohort_lines_put_means_first() {
        let lines = CohortLines {
            labels: vec!["A".to_string(), "B".to_string()],
            students: vec![(7, vec![50.0, 60.0])],
            means: vec![
                LabelMean {
                    time_label: "A".to_string(),
                    mean_score: 50.0,
                },
                LabelMean {
                    time_label: "B".to_string(),
                    mean_score: 60.0,
                },
            ],
        };
        let table = cohort_lines_table(&lines);
        assert_eq!(table.headers, vec!["student_id", "A", "B"]);
        assert_eq!(table.rows[0], vec!["mean", "50.00", "60.00"]);
        assert_eq!(table.rows[1], vec!["7", "50.00", "60.00"]);
    }

    #[test]
    fn writes_csv_and_markdown() {
        let dir = tempfile::tempdir().unwrap();
        let table = inequality_table(&[Inequality {
            key: ExamKey::new(2021, 1),
            iqr: 12.0,
            n: 25,
        }]);
        let stem = output_stem(Subject::Math, 2021, Analysis::Inequality);
        assert_eq!(stem, "math_2021_inequality");

        let (csv_path, md_path) = write_outputs(dir.path(), &stem, &table, "# report\n").unwrap();
        let csv = fs::read_to_string(csv_path).unwrap();
        assert_eq!(csv, "exam_point,iqr,n\n2021 R1,12.00,25\n");
        assert_eq!(fs::read_to_string(md_path).unwrap(), "# report\n");
    }

    #[test]
    fn long_rows_serialize_in_column_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long.csv");
        let record = LongRecord {
            student_id: 3,
            year: 2022,
            grade: "中2".to_string(),
            subject: "math".to_string(),
            exam_round: 1,
            raw_score: 64.0,
            source: "db".to_string(),
            time_label: "2022年度 中2 第1回".to_string(),
        };
        write_long_csv(&path, &[record]).unwrap();

        let written = fs::read_to_string(path).unwrap();
        let mut lines = written.lines();
        assert_eq!(
            lines.next(),
            Some("student_id,year,grade,subject,exam_round,raw_score,source,time_label")
        );
        assert_eq!(lines.next(), Some("3,2022,中2,math,1,64.0,db,2022年度 中2 第1回"));
    }
}
