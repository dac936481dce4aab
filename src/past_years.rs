//! Sidebar context and named routes for the past academic years pages.

use std::collections::BTreeMap;

use chrono::{Datelike, Local};
use serde::Serialize;

use crate::error::DataError;

pub const FIRST_PAST_YEAR: i32 = 2019;
const NAMESPACE: &str = "past_years";
const PLACEHOLDER: &str = "#";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PastYearsContext {
    /// Most recent first.
    pub past_years: Vec<i32>,
    pub past_years_start: i32,
    pub past_years_end: i32,
    pub current_year: i32,
}

pub fn current_year() -> i32 {
    Local::now().date_naive().year()
}

pub fn past_years_context(current_year: i32) -> PastYearsContext {
    let end = current_year - 1;
    PastYearsContext {
        past_years: (FIRST_PAST_YEAR..=end).rev().collect(),
        past_years_start: FIRST_PAST_YEAR,
        past_years_end: end,
        current_year,
    }
}

/// Route names (`past_years:<name>`) to their paths.
#[derive(Debug, Clone)]
pub struct UrlRegistry {
    routes: BTreeMap<String, String>,
}

const PER_YEAR_ROUTES: [(&str, &str); 6] = [
    ("", ""),
    ("_courses", "courses/"),
    ("_students", "students/"),
    ("_teachers", "teachers/"),
    ("_analytics", "analytics/"),
    ("_clear_cache", "courses/clear-cache/"),
];

impl UrlRegistry {
    /// Registers the overview, cache and per-year routes up to the year before `current_year`.
    ///
    /// At least the first past year is always registered.
    pub fn new(current_year: i32) -> Self {
        let end = (current_year - 1).max(FIRST_PAST_YEAR);
        let mut routes = BTreeMap::new();

        routes.insert("overview".to_string(), "/past-years/".to_string());
        routes.insert("clear_cache".to_string(), "/past-years/clear-cache/".to_string());

        for year in FIRST_PAST_YEAR..=end {
            for (suffix, path) in PER_YEAR_ROUTES {
                routes.insert(format!("year_{year}{suffix}"), format!("/past-years/{year}/{path}"));
            }
        }
        Self { routes }
    }

    /// Resolves a `past_years:`-qualified or bare route name.
    pub fn reverse(&self, name: &str) -> Result<&str, DataError> {
        let bare = match name.split_once(':') {
            Some((NAMESPACE, rest)) => rest,
            Some(_) => return Err(DataError::UnknownRoute(name.to_string())),
            None => name,
        };
        self.routes
            .get(bare)
            .map(String::as_str)
            .ok_or_else(|| DataError::UnknownRoute(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    fn reverse_or_placeholder(&self, name: &str) -> String {
        self.reverse(name).unwrap_or(PLACEHOLDER).to_string()
    }

    pub fn past_year_url(&self, year: i32) -> String {
        self.reverse_or_placeholder(&format!("{NAMESPACE}:year_{year}"))
    }

    pub fn past_year_url_safe(&self, year: i32, suffix: &str) -> String {
        if suffix.is_empty() {
            self.past_year_url(year)
        } else {
            self.reverse_or_placeholder(&format!("{NAMESPACE}:year_{year}_{suffix}"))
        }
    }

    pub fn past_year_clear_cache_url(&self, year: i32) -> String {
        self.reverse_or_placeholder(&format!("{NAMESPACE}:year_{year}_clear_cache"))
    }

    /// The three sidebar tags for `year`, as `tag\turl` lines.
    pub fn tag_lines(&self, year: i32, suffix: &str) -> Vec<String> {
        vec![
            format!("past_year_url\t{}", self.past_year_url(year)),
            format!("past_year_url_safe\t{}", self.past_year_url_safe(year, suffix)),
            format!("past_year_clear_cache_url\t{}", self.past_year_clear_cache_url(year)),
        ]
    }
}
