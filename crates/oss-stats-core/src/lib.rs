//! Core domain model for oss-stats: the four stored row kinds, key
//! normalization, and the forecast counter used by live displays.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::serde::{ts_milliseconds, ts_milliseconds_option};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod forecast;

pub use forecast::{
    github_dependent_forecast, npm_download_forecast, ForecastCounter, ForecastInput, TickCadence,
};

pub const CRATE_NAME: &str = "oss-stats-core";

/// Minimum age of a stored dependent-count baseline before it may be replaced.
pub const BASELINE_REFRESH_INTERVAL_MS: i64 = 55 * 60 * 1000;

/// Lowercased natural key used by every unique index.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Point-in-time dependent count kept as the forecast baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependentSnapshot {
    pub count: u64,
    #[serde(with = "ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl DependentSnapshot {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        (now - self.updated_at).num_milliseconds() >= BASELINE_REFRESH_INTERVAL_MS
    }
}

/// Source-code host account (user or organization) with totals over its repos.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubOwner {
    pub name: String,
    pub name_normalized: String,
    pub star_count: u64,
    pub contributor_count: u64,
    pub dependent_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependent_count_previous: Option<DependentSnapshot>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "ts_milliseconds_option"
    )]
    pub dependent_count_updated_at: Option<DateTime<Utc>>,
    #[serde(with = "ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl GithubOwner {
    pub fn empty(name: &str, now: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            name_normalized: normalize_name(name),
            star_count: 0,
            contributor_count: 0,
            dependent_count: 0,
            dependent_count_previous: None,
            dependent_count_updated_at: None,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubRepo {
    pub owner: String,
    pub owner_normalized: String,
    pub name: String,
    pub name_normalized: String,
    pub star_count: u64,
    pub contributor_count: u64,
    pub dependent_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependent_count_previous: Option<DependentSnapshot>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "ts_milliseconds_option"
    )]
    pub dependent_count_updated_at: Option<DateTime<Utc>>,
    #[serde(with = "ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

/// Trailing four-week average downloads per weekday, index 0 = Sunday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DayOfWeekAverages(pub [u64; 7]);

impl DayOfWeekAverages {
    pub fn get(&self, weekday_from_sunday: usize) -> u64 {
        self.0[weekday_from_sunday % 7]
    }

    pub fn saturating_add(self, other: Self) -> Self {
        let mut out = self.0;
        for (slot, value) in out.iter_mut().zip(other.0) {
            *slot = slot.saturating_add(value);
        }
        Self(out)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|v| *v == 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NpmOrg {
    pub name: String,
    pub download_count: u64,
    #[serde(with = "ts_milliseconds")]
    pub download_count_updated_at: DateTime<Utc>,
    pub day_of_week_averages: DayOfWeekAverages,
    #[serde(with = "ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl NpmOrg {
    pub fn empty(name: &str, now: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            download_count: 0,
            download_count_updated_at: now,
            day_of_week_averages: DayOfWeekAverages::default(),
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NpmPackage {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
    pub download_count: u64,
    #[serde(with = "ts_milliseconds")]
    pub download_count_updated_at: DateTime<Utc>,
    pub day_of_week_averages: DayOfWeekAverages,
    #[serde(with = "ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

/// Sum over a set of packages, as returned by the package-set query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NpmPackageSummary {
    pub download_count: u64,
    pub day_of_week_averages: DayOfWeekAverages,
    #[serde(with = "ts_milliseconds_option")]
    pub download_count_updated_at: Option<DateTime<Utc>>,
    #[serde(with = "ts_milliseconds_option")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("expected `owner/name`, got `{0}`")]
pub struct RepoRefParseError(pub String);

/// `owner/name` reference to a single repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl FromStr for RepoRef {
    type Err = RepoRefParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.split_once('/') {
            Some((owner, name))
                if !owner.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self {
                    owner: owner.to_string(),
                    name: name.to_string(),
                })
            }
            _ => Err(RepoRefParseError(s.to_string())),
        }
    }
}

impl TryFrom<String> for RepoRef {
    type Error = RepoRefParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RepoRef> for String {
    fn from(value: RepoRef) -> Self {
        value.to_string()
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Time source for everything that stamps rows or compares ages.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn names_normalize_to_lowercase() {
        assert_eq!(normalize_name("Get-Convex"), "get-convex");
        assert_eq!(normalize_name("  ACME "), "acme");
    }

    #[test]
    fn repo_ref_parses_owner_and_name() {
        let r: RepoRef = "get-convex/convex-js".parse().unwrap();
        assert_eq!(r.owner, "get-convex");
        assert_eq!(r.name, "convex-js");
        assert_eq!(r.to_string(), "get-convex/convex-js");
        assert!("no-slash".parse::<RepoRef>().is_err());
        assert!("a/b/c".parse::<RepoRef>().is_err());
        assert!("/b".parse::<RepoRef>().is_err());
    }

    #[test]
    fn rows_serialize_with_camel_case_and_millis() {
        let owner = GithubOwner::empty("Acme", ts(1_700_000_000));
        let value = serde_json::to_value(&owner).unwrap();
        assert_eq!(value["nameNormalized"], "acme");
        assert_eq!(value["updatedAt"], 1_700_000_000_000i64);
        assert!(value.get("dependentCountPrevious").is_none());

        let back: GithubOwner = serde_json::from_value(value).unwrap();
        assert_eq!(back, owner);
    }

    #[test]
    fn day_of_week_averages_add_elementwise() {
        let a = DayOfWeekAverages([1, 2, 3, 4, 5, 6, 7]);
        let b = DayOfWeekAverages([10, 10, 10, 10, 10, 10, u64::MAX]);
        let sum = a.saturating_add(b);
        assert_eq!(sum.0, [11, 12, 13, 14, 15, 16, u64::MAX]);
        assert_eq!(serde_json::to_value(a).unwrap(), serde_json::json!([1, 2, 3, 4, 5, 6, 7]));
    }

    #[test]
    fn snapshot_staleness_uses_refresh_interval() {
        let snap = DependentSnapshot {
            count: 5,
            updated_at: ts(0),
        };
        assert!(!snap.is_stale(ts(54 * 60)));
        assert!(snap.is_stale(ts(55 * 60)));
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(ts(100));
        clock.advance(Duration::seconds(5));
        assert_eq!(clock.now(), ts(105));
        clock.set(ts(1));
        assert_eq!(clock.now(), ts(1));
    }
}
