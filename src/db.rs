use std::ops::RangeInclusive;

use anyhow::Context;
use chrono::NaiveDateTime;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{MySql, QueryBuilder, Row};
use tracing::debug;

use crate::config::DbConfig;
use crate::models::{PrepWindow, ScoreRow, StudentId, Subject, UsageTotal};
use crate::source::DataSource;
use crate::usage::{fill_totals, UsagePolicy};

const SCORE_COLUMNS: &str = "SELECT CAST(student_id AS SIGNED) AS student_id, \
     COALESCE(course_name, '') AS course_name, COALESCE(name, '') AS name, \
     CAST(quiz AS DOUBLE) AS quiz, date_at \
     FROM course_student_scores \
     WHERE date_at IS NOT NULL \
     AND (name LIKE '%Benesse%' OR name LIKE '%ベネッセ%') \
     AND quiz IS NOT NULL AND quiz > 0";

const ROW_CHUNK: usize = 1000;

/// Score and usage tables on the school MySQL server, over a single connection.
pub struct MySqlSource {
    pool: MySqlPool,
}

impl MySqlSource {
    pub async fn connect(config: &DbConfig) -> anyhow::Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .connect_with(config.connect_options())
            .await
            .with_context(|| {
                format!("failed to connect to MySQL at {}:{}", config.host, config.port)
            })?;
        Ok(Self { pool })
    }
}

fn like_contains(value: &str) -> String {
    format!("%{value}%")
}

fn push_grade_clause(query: &mut QueryBuilder<'_, MySql>, grade: i32) {
    query
        .push(" AND (course_name LIKE ")
        .push_bind(format!("%[中{grade}]%"))
        .push(" OR course_name LIKE ")
        .push_bind(format!("%{grade}年%[中学]%"))
        .push(" OR course_name LIKE ")
        .push_bind(format!("%中学{grade}年%"))
        .push(")");
}

fn score_row(row: &MySqlRow) -> anyhow::Result<ScoreRow> {
    Ok(ScoreRow {
        student_id: row.try_get("student_id")?,
        course_name: row.try_get("course_name")?,
        name: row.try_get("name")?,
        quiz: row.try_get::<Option<f64>, _>("quiz")?,
        date_at: row.try_get::<Option<NaiveDateTime>, _>("date_at")?,
    })
}

impl DataSource for MySqlSource {
    fn label(&self) -> &'static str {
        "db"
    }

    async fn earliest_benesse_row(
        &self,
        subject: Subject,
        year: i32,
        grade: i32,
    ) -> anyhow::Result<Option<ScoreRow>> {
        let mut query = QueryBuilder::<MySql>::new(SCORE_COLUMNS);
        query
            .push(" AND YEAR(date_at) = ")
            .push_bind(year)
            .push(" AND name LIKE ")
            .push_bind(like_contains(subject.marker()));
        push_grade_clause(&mut query, grade);
        query.push(" ORDER BY date_at ASC LIMIT 1");

        let row = query.build().fetch_optional(&self.pool).await?;
        row.as_ref().map(score_row).transpose()
    }

    async fn benesse_rows(
        &self,
        subject: Subject,
        years: RangeInclusive<i32>,
        students: Option<&[StudentId]>,
    ) -> anyhow::Result<Vec<ScoreRow>> {
        let chunks: Vec<Option<&[StudentId]>> = match students {
            Some(ids) => ids.chunks(ROW_CHUNK).map(Some).collect(),
            None => vec![None],
        };

        let mut rows = Vec::new();
        for chunk in chunks {
            let mut query = QueryBuilder::<MySql>::new(SCORE_COLUMNS);
            query
                .push(" AND YEAR(date_at) BETWEEN ")
                .push_bind(*years.start())
                .push(" AND ")
                .push_bind(*years.end())
                .push(" AND name LIKE ")
                .push_bind(like_contains(subject.marker()));

            if let Some(ids) = chunk {
                query.push(" AND student_id IN (");
                let mut separated = query.separated(", ");
                for id in ids {
                    separated.push_bind(*id);
                }
                separated.push_unseparated(")");
            }

            let fetched = query.build().fetch_all(&self.pool).await?;
            debug!(rows = fetched.len(), "fetched Benesse rows");
            for row in &fetched {
                rows.push(score_row(row)?);
            }
        }
        Ok(rows)
    }

    async fn usage_totals(
        &self,
        students: &[StudentId],
        window: &PrepWindow,
        subject: Subject,
        policy: &UsagePolicy,
    ) -> anyhow::Result<Vec<UsageTotal>> {
        let mut found = Vec::new();

        for chunk in students.chunks(policy.chunk_size.max(1)) {
            let mut query = QueryBuilder::<MySql>::new(
                "SELECT CAST(ssokid AS SIGNED) AS student_id, \
                 CAST(SUM(diftime) / 3600.0 AS DOUBLE) AS hours_raw, \
                 CAST(SUM(LEAST(diftime, ",
            );
            query
                .push_bind(policy.cap_seconds)
                .push(")) / 3600.0 AS DOUBLE) AS hours_capped FROM artsci_bookroll_difftimes")
                .push(" WHERE operationdate >= ")
                .push_bind(window.start)
                .push(" AND operationdate < ")
                .push_bind(window.end)
                .push(" AND diftime > 0 AND course_title LIKE ")
                .push_bind(like_contains(subject.marker()));

            if policy.exclude_school_hours {
                query.push(
                    " AND NOT (DAYOFWEEK(operationdate) BETWEEN 2 AND 6 \
                     AND TIME(operationdate) >= '08:00:00' \
                     AND TIME(operationdate) < '16:00:00')",
                );
            }

            query.push(" AND ssokid IN (");
            let mut separated = query.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(") GROUP BY ssokid");

            let rows = query.build().fetch_all(&self.pool).await?;
            debug!(
                window = %window.key,
                students = chunk.len(),
                matched = rows.len(),
                "fetched usage chunk"
            );
            for row in rows {
                found.push(UsageTotal {
                    student_id: row.try_get("student_id")?,
                    hours_raw: row.try_get::<Option<f64>, _>("hours_raw")?.unwrap_or(0.0),
                    hours_capped: row.try_get::<Option<f64>, _>("hours_capped")?.unwrap_or(0.0),
                });
            }
        }

        Ok(fill_totals(students, &found))
    }

    async fn close(self) {
        self.pool.close().await;
    }
}
