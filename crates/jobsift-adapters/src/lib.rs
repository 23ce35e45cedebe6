//! Data source contracts and the provider implementations behind them.
//!
//! Every source reaches the network only through a [`RequestQueue`]; sources
//! classify a failed attempt but never sleep or retry on their own.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use jobsift_core::{Job, JobSource};
use jobsift_storage::{HttpFetcher, Priority, QueueError, RequestQueue};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod apify;
pub mod fixture;
mod html;
pub mod linkedin;

pub use apify::{ApifyConfig, ApifyDataSource};
pub use fixture::{FixtureBundle, FixtureDataSource};
pub use linkedin::{LinkedInConfig, LinkedInDataSource};

pub const CRATE_NAME: &str = "jobsift-adapters";

/// Search criteria handed to a source. Field names follow the preferences
/// document's `search_parameters` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParams {
    pub keywords: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub remote: Option<String>,
    #[serde(default)]
    pub experience_level: Option<String>,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub date_posted: Option<String>,
    #[serde(default)]
    pub easy_apply: bool,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    100
}

impl SearchParams {
    pub fn new(keywords: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            keywords: keywords.into(),
            location: location.into(),
            remote: None,
            experience_level: None,
            sort: None,
            date_posted: None,
            easy_apply: false,
            limit: default_limit(),
        }
    }
}

/// A posting as a provider reported it, before it becomes a [`Job`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawListing {
    pub source: JobSource,
    pub title: String,
    pub company_name: String,
    pub location: String,
    pub url: String,
    pub description: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub external_id: Option<String>,
}

impl RawListing {
    pub fn into_job(self, observed_at: DateTime<Utc>) -> Job {
        Job::discovered(
            self.source,
            self.title,
            self.company_name,
            self.location,
            self.url,
            observed_at,
        )
        .with_description(self.description)
        .with_posted_at(self.posted_at)
    }

    pub fn listing_ref(&self) -> ListingRef {
        ListingRef {
            url: self.url.clone(),
            external_id: self.external_id.clone(),
        }
    }
}

/// Opaque continuation handed back by [`DataSource::fetch_listings_page`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageToken(pub String);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingPage {
    pub listings: Vec<RawListing>,
    pub next: Option<PageToken>,
}

/// Handle to a posting for a detail lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRef {
    pub url: String,
    pub external_id: Option<String>,
}

impl ListingRef {
    pub fn from_job(job: &Job) -> Self {
        Self {
            url: job.url.clone(),
            external_id: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobDetails {
    pub description: Option<String>,
    /// The provider says the posting no longer accepts applications.
    pub expired: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanyOverview {
    pub company_name: String,
    pub overview: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Listings,
    Details,
    CompanyOverview,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Listings => "listings",
            Self::Details => "job details",
            Self::CompanyOverview => "company overviews",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub listings: bool,
    pub details: bool,
    pub company_overview: bool,
    /// Calls count against a monthly quota.
    pub metered: bool,
}

impl Capabilities {
    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Listings => self.listings,
            Capability::Details => self.details,
            Capability::CompanyOverview => self.company_overview,
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("{source_name} does not support {capability}")]
    Unsupported {
        source_name: &'static str,
        capability: Capability,
    },
    #[error("malformed provider response: {0}")]
    Malformed(String),
    #[error("actor run {run_id} ended with status {status}")]
    RunFailed { run_id: String, status: String },
    #[error("unknown data source {0:?}")]
    UnknownSource(String),
    #[error("data source configuration: {0}")]
    Config(String),
    #[error("fixture: {0:#}")]
    Fixture(#[from] anyhow::Error),
}

impl SourceError {
    /// Quota backpressure, as opposed to a provider or parsing failure.
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::Queue(err) if err.is_quota())
    }
}

#[async_trait]
pub trait DataSource: Send + Sync {
    /// Stable name used in configuration and logs.
    fn name(&self) -> &'static str;

    fn source(&self) -> JobSource;

    fn capabilities(&self) -> Capabilities;

    async fn fetch_listings_page(
        &self,
        params: &SearchParams,
        token: Option<&PageToken>,
    ) -> Result<ListingPage, SourceError>;

    async fn fetch_details(&self, _listing: &ListingRef, _priority: Priority) -> Result<JobDetails, SourceError> {
        Err(SourceError::Unsupported {
            source_name: self.name(),
            capability: Capability::Details,
        })
    }

    async fn fetch_company_overview(
        &self,
        _company_name: &str,
        _priority: Priority,
    ) -> Result<CompanyOverview, SourceError> {
        Err(SourceError::Unsupported {
            source_name: self.name(),
            capability: Capability::CompanyOverview,
        })
    }
}

struct StreamState<'a> {
    source: &'a dyn DataSource,
    params: &'a SearchParams,
    buffer: VecDeque<RawListing>,
    next: Option<PageToken>,
    started: bool,
    done: bool,
}

/// Lazily pages through `source`. A page is only requested once the
/// previous one has been consumed, so `take(n)` bounds provider calls. The
/// stream ends after the first error.
pub fn listing_stream<'a>(
    source: &'a dyn DataSource,
    params: &'a SearchParams,
    resume: Option<PageToken>,
) -> BoxStream<'a, Result<RawListing, SourceError>> {
    let state = StreamState {
        source,
        params,
        buffer: VecDeque::new(),
        next: resume,
        started: false,
        done: false,
    };
    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(listing) = st.buffer.pop_front() {
                return Some((Ok(listing), st));
            }
            if st.done || (st.started && st.next.is_none()) {
                return None;
            }
            let token = st.next.take();
            st.started = true;
            match st.source.fetch_listings_page(st.params, token.as_ref()).await {
                Ok(page) => {
                    st.buffer.extend(page.listings);
                    st.next = page.next;
                }
                Err(err) => {
                    st.done = true;
                    return Some((Err(err), st));
                }
            }
        }
    })
    .boxed()
}

/// Everything [`source_for`] may need to build a source.
#[derive(Debug, Clone)]
pub struct SourceContext {
    pub http: HttpFetcher,
    /// Shared queue over the metered Apify ledger.
    pub metered_queue: RequestQueue,
    /// Queue for sources without a quota.
    pub unmetered_queue: RequestQueue,
    pub apify_token: Option<String>,
    pub fixture_bundle: Option<PathBuf>,
}

/// Builds the source configured under `kind` ("apify", "linkedin", "fixture").
pub fn source_for(kind: &str, ctx: &SourceContext) -> Result<Box<dyn DataSource>, SourceError> {
    match kind.trim().to_ascii_lowercase().as_str() {
        "apify" => {
            let token = ctx
                .apify_token
                .clone()
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| SourceError::Config("APIFY_API_TOKEN is not set".into()))?;
            Ok(Box::new(ApifyDataSource::new(
                ApifyConfig::new(token),
                ctx.http.clone(),
                ctx.metered_queue.clone(),
            )))
        }
        "linkedin" => Ok(Box::new(LinkedInDataSource::new(
            LinkedInConfig::default(),
            ctx.http.clone(),
            ctx.unmetered_queue.clone(),
        ))),
        "fixture" => {
            let path = ctx
                .fixture_bundle
                .as_ref()
                .ok_or_else(|| SourceError::Config("no fixture bundle configured".into()))?;
            Ok(Box::new(FixtureDataSource::from_file(path, ctx.metered_queue.clone())?))
        }
        other => Err(SourceError::UnknownSource(other.to_string())),
    }
}

/// Accepts RFC 3339 timestamps and bare `YYYY-MM-DD` dates (midnight UTC).
pub(crate) fn parse_posted_at(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let date_part = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
