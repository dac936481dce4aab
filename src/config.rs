use sqlx::mysql::MySqlConnectOptions;

use crate::error::DataError;
use crate::points::{PrepOrigin, SpringRound};
use crate::usage::UsagePolicy;

/// Connection settings for the score/usage database, read from `DB_*` variables.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl DbConfig {
    /// Loads `.env` when present, then reads the process environment.
    pub fn from_env() -> Result<Self, DataError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, DataError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| lookup(name).ok_or(DataError::MissingSetting(name));

        let port = match lookup("DB_PORT") {
            Some(raw) => raw.trim().parse().map_err(|_| DataError::InvalidSetting {
                name: "DB_PORT",
                value: raw,
            })?,
            None => 3306,
        };

        Ok(Self {
            host: required("DB_HOST")?,
            port,
            user: required("DB_USER")?,
            password: lookup("DB_PASSWORD").unwrap_or_default(),
            database: required("DB_NAME")?,
        })
    }

    pub fn connect_options(&self) -> MySqlConnectOptions {
        MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ScoreStat {
    Median,
    Mean,
}

/// Tunables shared by every analysis.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub spring: SpringRound,
    pub origin: PrepOrigin,
    pub usage: UsagePolicy,
    /// Exam points with fewer valid scores are left out of the inequality series.
    pub inequality_min_sample: usize,
    pub score_stat: ScoreStat,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            spring: SpringRound::default(),
            origin: PrepOrigin::default(),
            usage: UsagePolicy::default(),
            inequality_min_sample: 20,
            score_stat: ScoreStat::Median,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn reads_settings_with_default_port() {
        let config = DbConfig::from_lookup(lookup_from(&[
            ("DB_HOST", "db.local"),
            ("DB_USER", "analyst"),
            ("DB_PASSWORD", "secret"),
            ("DB_NAME", "leaf"),
        ]))
        .unwrap();

        assert_eq!(config.host, "db.local");
        assert_eq!(config.port, 3306);
        assert_eq!(config.database, "leaf");
    }

    #[test]
    fn missing_host_is_reported_by_name() {
        let err = DbConfig::from_lookup(lookup_from(&[("DB_USER", "a"), ("DB_NAME", "b")]))
            .unwrap_err();
        assert!(matches!(err, DataError::MissingSetting("DB_HOST")));
    }

    #[test]
    fn rejects_non_numeric_port() {
        let err = DbConfig::from_lookup(lookup_from(&[
            ("DB_HOST", "h"),
            ("DB_USER", "u"),
            ("DB_NAME", "d"),
            ("DB_PORT", "mysql"),
        ]))
        .unwrap_err();
        assert!(matches!(err, DataError::InvalidSetting { name: "DB_PORT", .. }));
    }

    #[test]
    fn defaults_match_the_original_thresholds() {
        let config = AnalysisConfig::default();
        assert_eq!(config.inequality_min_sample, 20);
        assert_eq!(config.score_stat, ScoreStat::Median);
        assert!(config.spring.enabled);
    }
}
