//! Core domain model for jobsift: postings, companies, dispositions and
//! filter configuration.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

mod filters;

pub use filters::{
    ConfigValidationError, FilterConfig, LocationPriority, SustainabilityKeywords, WeightedKeyword,
};

pub const CRATE_NAME: &str = "jobsift-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Provider a posting was first sighted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSource {
    Apify,
    #[serde(rename = "linkedin")]
    LinkedIn,
    Other,
}

impl JobSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Apify => "apify",
            Self::LinkedIn => "linkedin",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for JobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobSource {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "apify" => Ok(Self::Apify),
            "linkedin" => Ok(Self::LinkedIn),
            "other" => Ok(Self::Other),
            _ => Err(ParseEnumError {
                kind: "job source",
                value: s.to_string(),
            }),
        }
    }
}

/// Pipeline disposition of a posting. Variants are declared in forward order;
/// a stored status never moves to a lower rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Discovered,
    Scored,
    Skipped,
    SustainabilityExcluded,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        Self::Discovered,
        Self::Scored,
        Self::Skipped,
        Self::SustainabilityExcluded,
    ];

    pub fn rank(self) -> i64 {
        match self {
            Self::Discovered => 0,
            Self::Scored => 1,
            Self::Skipped => 2,
            Self::SustainabilityExcluded => 3,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.rank() == rank)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Scored => "scored",
            Self::Skipped => "skipped",
            Self::SustainabilityExcluded => "sustainability_excluded",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseEnumError {
                kind: "job status",
                value: s.to_string(),
            })
    }
}

/// Ordinal fit classification, worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitCategory {
    Unscored,
    VeryPoorFit,
    PoorFit,
    Fit,
    GoodFit,
    VeryGoodFit,
}

impl FitCategory {
    pub const ALL: [FitCategory; 6] = [
        Self::Unscored,
        Self::VeryPoorFit,
        Self::PoorFit,
        Self::Fit,
        Self::GoodFit,
        Self::VeryGoodFit,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unscored => "unscored",
            Self::VeryPoorFit => "very_poor_fit",
            Self::PoorFit => "poor_fit",
            Self::Fit => "fit",
            Self::GoodFit => "good_fit",
            Self::VeryGoodFit => "very_good_fit",
        }
    }

    pub fn rank(self) -> i64 {
        match self {
            Self::Unscored => 0,
            Self::VeryPoorFit => 1,
            Self::PoorFit => 2,
            Self::Fit => 3,
            Self::GoodFit => 4,
            Self::VeryGoodFit => 5,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.rank() == rank)
    }

    /// Parses the human labels classifiers answer with ("Good fit",
    /// "Moderate fit", ...) as well as the snake_case storage form.
    pub fn from_label(label: &str) -> Option<Self> {
        let normalized = label
            .trim()
            .to_ascii_lowercase()
            .replace(['_', '-'], " ");
        match normalized.as_str() {
            "very good fit" => Some(Self::VeryGoodFit),
            "good fit" => Some(Self::GoodFit),
            "fit" | "moderate fit" => Some(Self::Fit),
            "poor fit" | "questionable fit" => Some(Self::PoorFit),
            "very poor fit" => Some(Self::VeryPoorFit),
            "unscored" | "" => Some(Self::Unscored),
            _ => None,
        }
    }
}

impl fmt::Display for FitCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FitCategory {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_label(s).ok_or_else(|| ParseEnumError {
            kind: "fit category",
            value: s.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    Positive,
    Negative,
}

/// Posting field a sustainability keyword was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchField {
    Title,
    CompanyName,
    Location,
    CompanyOverview,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SustainabilityMatch {
    pub keyword: String,
    pub polarity: Polarity,
    pub field: MatchField,
}

/// Stable identity of a posting: sha256 over the normalized
/// (title, company, location, canonical url) tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn derive(title: &str, company_name: &str, location: &str, url: &str) -> Self {
        let mut hasher = Sha256::new();
        for (idx, part) in [
            normalize_text(title),
            normalize_company_name(company_name),
            normalize_text(location),
            canonical_url(url),
        ]
        .iter()
        .enumerate()
        {
            if idx > 0 {
                hasher.update([0x1f]);
            }
            hasher.update(part.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Wraps an already-derived fingerprint read back from storage.
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercases and collapses whitespace.
pub fn normalize_text(input: &str) -> String {
    input
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Key under which companies are shared between postings.
pub fn normalize_company_name(name: &str) -> String {
    normalize_text(name)
}

const TRACKING_PARAMS: [&str; 6] = ["trackingid", "refid", "trk", "position", "pagenum", "ebp"];

/// Drops fragments and tracking parameters so the same posting seen through
/// different search pages keeps one identity. LinkedIn postings collapse to
/// their numeric job id.
pub fn canonical_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(mut parsed) = url::Url::parse(trimmed) else {
        return trimmed.trim_end_matches('/').to_lowercase();
    };

    if parsed
        .host_str()
        .is_some_and(|host| host.ends_with("linkedin.com"))
    {
        if let Some(job_id) = linkedin_job_id(&parsed) {
            return format!("https://www.linkedin.com/jobs/view/{job_id}");
        }
    }

    parsed.set_fragment(None);
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| {
            let key = k.to_ascii_lowercase();
            !key.starts_with("utm_") && !TRACKING_PARAMS.contains(&key.as_str())
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(kept);
    }
    parsed.to_string().trim_end_matches('/').to_string()
}

/// Numeric LinkedIn job id from `/jobs/view/<slug>-<id>` or `currentJobId=<id>`.
pub fn linkedin_job_id(url: &url::Url) -> Option<String> {
    if let Some((_, id)) = url.query_pairs().find(|(k, _)| k == "currentJobId") {
        if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
            return Some(id.into_owned());
        }
    }
    let mut segments = url.path_segments()?;
    segments.find(|s| *s == "view")?;
    let slug = segments.next()?;
    let id: String = slug
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

/// A single posting as stored by the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub fingerprint: Fingerprint,
    pub title: String,
    pub company_name: String,
    pub location: String,
    pub url: String,
    pub description: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub source: JobSource,
    pub status: JobStatus,
    pub fit_category: FitCategory,
    pub sustainability_matches: Vec<SustainabilityMatch>,
    pub keyword_score: Option<i64>,
    pub location_weight: Option<u32>,
    pub note: Option<String>,
    pub classifier_confidence: Option<f64>,
    pub classifier_requests: u32,
    pub sightings: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub classified_at: Option<DateTime<Utc>>,
}

impl Job {
    /// First sighting of a posting, before any scoring.
    pub fn discovered(
        source: JobSource,
        title: impl Into<String>,
        company_name: impl Into<String>,
        location: impl Into<String>,
        url: impl Into<String>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        let title = title.into().trim().to_string();
        let company_name = company_name.into().trim().to_string();
        let location = location.into().trim().to_string();
        let url = url.into().trim().to_string();
        Self {
            fingerprint: Fingerprint::derive(&title, &company_name, &location, &url),
            title,
            company_name,
            location,
            url,
            description: None,
            posted_at: None,
            source,
            status: JobStatus::Discovered,
            fit_category: FitCategory::Unscored,
            sustainability_matches: Vec::new(),
            keyword_score: None,
            location_weight: None,
            note: None,
            classifier_confidence: None,
            classifier_requests: 0,
            sightings: 1,
            created_at: observed_at,
            updated_at: observed_at,
            classified_at: None,
        }
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description.filter(|d| !d.trim().is_empty());
        self
    }

    pub fn with_posted_at(mut self, posted_at: Option<DateTime<Utc>>) -> Self {
        self.posted_at = posted_at;
        self
    }

    pub fn has_description(&self) -> bool {
        self.description
            .as_deref()
            .is_some_and(|d| !d.trim().is_empty())
    }
}

/// Shared enrichment for all postings of one employer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub key: String,
    pub display_name: String,
    pub url: Option<String>,
    pub overview: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Company {
    pub fn new(display_name: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        let display_name = display_name.into().trim().to_string();
        Self {
            key: normalize_company_name(&display_name),
            display_name,
            url: None,
            overview: None,
            updated_at,
        }
    }

    pub fn overview_text(&self) -> Option<&str> {
        self.overview.as_deref().filter(|o| !o.trim().is_empty())
    }
}

/// Recorded, revertible mutation of the live [`FilterConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterAdjustmentEvent {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub previous_config: FilterConfig,
    pub new_config: FilterConfig,
    pub trigger_reason: String,
    pub reverted: bool,
    pub reverted_at: Option<DateTime<Utc>>,
}
