use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod analysis;
mod cohort;
mod config;
mod db;
mod error;
mod models;
mod panel;
mod past_years;
mod points;
mod report;
mod source;
mod stats;
mod translate;
mod usage;

use config::{AnalysisConfig, DbConfig, ScoreStat};
use db::MySqlSource;
use models::{CohortSpec, Subject};
use panel::{build_panel, Panel};
use points::SpringRound;
use report::{Analysis, Locale, ReportStyle, Table};
use source::CsvSource;
use usage::UsageMeasure;

#[derive(Parser)]
#[command(name = "cohort-usage")]
#[command(
    about = "Benesse exam scores against BookRoll usage for one student cohort",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CohortArgs {
    /// Academic year the cohort starts in
    cohort_start_year: i32,
    /// Junior-high grade in the start year
    #[arg(value_parser = clap::value_parser!(i32).range(1..=3))]
    start_grade: i32,
    /// math/maths or english/eng
    subject: Subject,
    /// Keep the earliest round 1 exam instead of dropping it as a spring diagnostic
    #[arg(long)]
    keep_first_r1: bool,
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,
    /// Scores table dump; replaces the database together with --usage-csv
    #[arg(long, requires = "usage_csv")]
    scores_csv: Option<PathBuf>,
    /// Usage table dump; replaces the database together with --scores-csv
    #[arg(long, requires = "scores_csv")]
    usage_csv: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = Locale::Ja)]
    locale: Locale,
    /// Which usage hours feed the analyses
    #[arg(long, value_enum, default_value_t = UsageMeasure::Capped)]
    measure: UsageMeasure,
    /// Count weekday usage between 08:00 and 16:00 as well
    #[arg(long)]
    include_school_hours: bool,
}

impl CohortArgs {
    fn spec(&self) -> CohortSpec {
        CohortSpec {
            start_year: self.cohort_start_year,
            start_grade: self.start_grade,
            subject: self.subject,
        }
    }

    fn config(&self) -> AnalysisConfig {
        let mut config = AnalysisConfig::default();
        if self.keep_first_r1 {
            config.spring = SpringRound::disabled();
        }
        config.usage.measure = self.measure;
        config.usage.exclude_school_hours = !self.include_school_hours;
        config
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Median or mean score of each usage quartile per exam point
    UsageQuartiles {
        #[command(flatten)]
        cohort: CohortArgs,
        #[arg(long, value_enum, default_value_t = ScoreStat::Median)]
        score_stat: ScoreStat,
    },
    /// Share of usage hours held by each usage quartile
    Concentration {
        #[command(flatten)]
        cohort: CohortArgs,
    },
    /// Interquartile range of scores per exam point
    Inequality {
        #[command(flatten)]
        cohort: CohortArgs,
        /// Points with fewer scores are skipped
        #[arg(long, default_value_t = 20)]
        min_sample: usize,
    },
    /// Percentile trajectories against relative usage
    Trajectory {
        #[command(flatten)]
        cohort: CohortArgs,
    },
    /// Percentile change after a usage change, by starting score quartile
    Transitions {
        #[command(flatten)]
        cohort: CohortArgs,
    },
    /// Each student's typical usage change against score change
    UsageChange {
        #[command(flatten)]
        cohort: CohortArgs,
    },
    /// Gains of students who started in the bottom quartile, by usage group
    Q1Persistence {
        #[command(flatten)]
        cohort: CohortArgs,
    },
    /// Usage after a percentile drop and the recovery that follows
    SetbackRecovery {
        #[command(flatten)]
        cohort: CohortArgs,
    },
    /// Write the cohort's scores in the long CSV layout
    ExportLong {
        #[command(flatten)]
        cohort: CohortArgs,
    },
    /// Score lines of students present at every label of a long cohort CSV
    CohortLines {
        csv: PathBuf,
        /// Labels to keep, in order; defaults to every label by year and round
        #[arg(long = "label")]
        labels: Vec<String>,
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
        #[arg(long, value_enum, default_value_t = Locale::Ja)]
        locale: Locale,
    },
    /// Translate Japanese test names line by line
    Translate {
        input: PathBuf,
        output: PathBuf,
    },
    /// Print the past years sidebar context and year routes
    PastYears {
        /// Defaults to the current calendar year
        #[arg(long)]
        current_year: Option<i32>,
        /// Print the sidebar tag URLs for this year instead of the route table
        #[arg(long)]
        year: Option<i32>,
        /// Page suffix for past_year_url_safe, e.g. courses or students
        #[arg(long, default_value = "", requires = "year")]
        suffix: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::UsageQuartiles { cohort, score_stat } => {
            let mut config = cohort.config();
            config.score_stat = score_stat;
            run_cohort(Analysis::UsageQuartiles, &cohort, &config).await?;
        }
        Commands::Concentration { cohort } => {
            run_cohort(Analysis::Concentration, &cohort, &cohort.config()).await?;
        }
        Commands::Inequality { cohort, min_sample } => {
            let mut config = cohort.config();
            config.inequality_min_sample = min_sample;
            run_cohort(Analysis::Inequality, &cohort, &config).await?;
        }
        Commands::Trajectory { cohort } => {
            run_cohort(Analysis::Trajectory, &cohort, &cohort.config()).await?;
        }
        Commands::Transitions { cohort } => {
            run_cohort(Analysis::Transitions, &cohort, &cohort.config()).await?;
        }
        Commands::UsageChange { cohort } => {
            run_cohort(Analysis::UsageChange, &cohort, &cohort.config()).await?;
        }
        Commands::Q1Persistence { cohort } => {
            run_cohort(Analysis::Q1Persistence, &cohort, &cohort.config()).await?;
        }
        Commands::SetbackRecovery { cohort } => {
            run_cohort(Analysis::SetbackRecovery, &cohort, &cohort.config()).await?;
        }
        Commands::ExportLong { cohort } => {
            run_cohort(Analysis::ExportLong, &cohort, &cohort.config()).await?;
        }
        Commands::CohortLines {
            csv,
            labels,
            out_dir,
            locale,
        } => {
            run_cohort_lines(&csv, labels, &out_dir, ReportStyle::new(locale))?;
        }
        Commands::Translate { input, output } => {
            let count = translate::translate_file(&input, &output)?;
            println!("Translated {count} lines into {}.", output.display());
        }
        Commands::PastYears {
            current_year,
            year,
            suffix,
        } => {
            for line in past_years_output(current_year, year, &suffix)? {
                println!("{line}");
            }
        }
    }

    Ok(())
}

/// Sidebar context and route table, or the tag URLs for one year when `year` is set.
fn past_years_output(
    current_year: Option<i32>,
    year: Option<i32>,
    suffix: &str,
) -> anyhow::Result<Vec<String>> {
    let current = current_year.unwrap_or_else(past_years::current_year);
    let urls = past_years::UrlRegistry::new(current);

    if let Some(year) = year {
        return Ok(urls.tag_lines(year, suffix));
    }

    let context = past_years::past_years_context(current);
    let mut lines = vec![serde_json::to_string_pretty(&context)?];
    for name in urls.names() {
        lines.push(format!("past_years:{name}\t{}", urls.reverse(name)?));
    }
    Ok(lines)
}

async fn load_panel(args: &CohortArgs, config: &AnalysisConfig) -> anyhow::Result<Option<Panel>> {
    let spec = args.spec();
    match (&args.scores_csv, &args.usage_csv) {
        (Some(scores), Some(usage)) => {
            let source = CsvSource::from_paths(scores, usage)?;
            build_panel(source, &spec, config).await
        }
        _ => {
            let settings = DbConfig::from_env()?;
            let source = MySqlSource::connect(&settings).await?;
            build_panel(source, &spec, config).await
        }
    }
}

async fn run_cohort(
    analysis: Analysis,
    args: &CohortArgs,
    config: &AnalysisConfig,
) -> anyhow::Result<()> {
    let Some(panel) = load_panel(args, config).await? else {
        return Ok(());
    };
    info!(
        students = panel.cohort.student_ids.len(),
        points = panel.points.len(),
        source = panel.source,
        "panel loaded"
    );

    let style = ReportStyle::new(args.locale);
    let stem = report::output_stem(panel.spec.subject, panel.spec.start_year, analysis);

    if analysis == Analysis::ExportLong {
        let records = analysis::export_long(&panel);
        std::fs::create_dir_all(&args.out_dir)
            .with_context(|| format!("failed to create {}", args.out_dir.display()))?;
        let path = args.out_dir.join(format!("{stem}.csv"));
        report::write_long_csv(&path, &records)?;
        info!(rows = records.len(), path = %path.display(), "long CSV written");
        println!("Long CSV written to {}.", path.display());
        return Ok(());
    }

    let Some(table) = analysis_table(analysis, &panel, config, &style) else {
        warn!(analysis = analysis.slug(), "not enough data for this analysis");
        return Ok(());
    };
    if table.is_empty() {
        warn!(analysis = analysis.slug(), "analysis produced no rows");
        return Ok(());
    }

    let report = report::build_report(analysis, Some(&panel), &table, &style);
    let (csv_path, md_path) = report::write_outputs(&args.out_dir, &stem, &table, &report)?;
    info!(csv = %csv_path.display(), report = %md_path.display(), "outputs written");
    println!("Results written to {} and {}.", csv_path.display(), md_path.display());
    Ok(())
}

fn analysis_table(
    analysis: Analysis,
    panel: &Panel,
    config: &AnalysisConfig,
    style: &ReportStyle,
) -> Option<Table> {
    let table = match analysis {
        Analysis::UsageQuartiles => {
            report::quartile_table(&analysis::usage_quartile_scores(panel, config.score_stat))
        }
        Analysis::Concentration => {
            report::concentration_table(&analysis::usage_concentration(panel))
        }
        Analysis::Inequality => report::inequality_table(&analysis::inequality_over_time(
            panel,
            config.inequality_min_sample,
        )),
        Analysis::Trajectory => {
            report::trajectory_table(&analysis::trajectory_vs_engagement(panel)?, style)
        }
        Analysis::Transitions => {
            report::transition_table(&analysis::transition_response(panel), style)
        }
        Analysis::UsageChange => {
            report::usage_change_table(&analysis::usage_change_vs_score(panel), style)
        }
        Analysis::Q1Persistence => {
            report::persistence_table(&analysis::q1_persistence(panel), style)
        }
        Analysis::SetbackRecovery => {
            report::setback_table(&analysis::setback_recovery(panel), style)
        }
        Analysis::CohortLines | Analysis::ExportLong => return None,
    };
    Some(table)
}

fn run_cohort_lines(
    csv: &std::path::Path,
    labels: Vec<String>,
    out_dir: &std::path::Path,
    style: ReportStyle,
) -> anyhow::Result<()> {
    let records = source::read_long_records(csv)?;
    let labels = if labels.is_empty() {
        analysis::ordered_labels(&records)
    } else {
        labels
    };

    let Some(lines) = analysis::cohort_lines(&records, &labels) else {
        warn!(labels = labels.len(), "no student has a score at every label");
        return Ok(());
    };
    info!(students = lines.students.len(), labels = lines.labels.len(), "cohort lines");

    let subject = records
        .first()
        .and_then(|record| record.subject.parse::<Subject>().ok())
        .unwrap_or(Subject::Math);
    let year = records.iter().map(|record| record.year).min().unwrap_or_default();
    let stem = report::output_stem(subject, year, Analysis::CohortLines);

    let table = report::cohort_lines_table(&lines);
    let report = report::build_report(Analysis::CohortLines, None, &table, &style);
    let (csv_path, md_path) = report::write_outputs(out_dir, &stem, &table, &report)?;
    println!("Results written to {} and {}.", csv_path.display(), md_path.display());
    Ok(())
}
