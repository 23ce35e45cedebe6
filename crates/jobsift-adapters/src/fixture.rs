//! Replays recorded listing bundles from disk. Pages use the Apify dataset
//! item shape and every lookup still goes through a [`RequestQueue`], so
//! quota and priority behave as they would against a live provider.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use jobsift_core::{canonical_url, linkedin_job_id, normalize_company_name, JobSource};
use jobsift_storage::{CallType, Priority, RequestQueue, SubmitMode, TaskFailure};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::apify::normalize_listing_item;
use crate::{
    Capabilities, CompanyOverview, DataSource, JobDetails, ListingPage, ListingRef, PageToken,
    RawListing, SearchParams, SourceError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureBundle {
    #[serde(default = "default_source")]
    pub source: JobSource,
    /// Listing pages in provider order.
    pub pages: Vec<Vec<Value>>,
    /// Descriptions keyed by external id or posting url.
    #[serde(default)]
    pub details: BTreeMap<String, String>,
    /// Overviews keyed by company name.
    #[serde(default)]
    pub companies: BTreeMap<String, String>,
}

fn default_source() -> JobSource {
    JobSource::Other
}

#[derive(Debug, Clone)]
pub struct FixtureDataSource {
    pages: Vec<Vec<RawListing>>,
    details: BTreeMap<String, String>,
    companies: BTreeMap<String, String>,
    queue: RequestQueue,
}

impl FixtureDataSource {
    pub fn from_file(path: &Path, queue: RequestQueue) -> Result<Self, SourceError> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read fixture bundle {}", path.display()))?;
        let bundle: FixtureBundle = serde_json::from_str(&raw)
            .with_context(|| format!("parse fixture bundle {}", path.display()))?;
        Ok(Self::from_bundle(bundle, queue))
    }

    pub fn from_bundle(bundle: FixtureBundle, queue: RequestQueue) -> Self {
        let source = bundle.source;
        let pages = bundle
            .pages
            .iter()
            .map(|items| {
                items
                    .iter()
                    .filter_map(normalize_listing_item)
                    .map(|listing| RawListing { source, ..listing })
                    .collect()
            })
            .collect();
        let details = bundle
            .details
            .into_iter()
            .map(|(key, description)| (detail_key(&key), description))
            .collect();
        let companies = bundle
            .companies
            .into_iter()
            .map(|(name, overview)| (normalize_company_name(&name), overview))
            .collect();
        Self {
            pages,
            details,
            companies,
            queue,
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

fn detail_key(raw: &str) -> String {
    if raw.contains("://") {
        canonical_url(raw)
    } else {
        raw.trim().to_string()
    }
}

#[async_trait]
impl DataSource for FixtureDataSource {
    fn name(&self) -> &'static str {
        "fixture"
    }

    fn source(&self) -> JobSource {
        self.pages
            .iter()
            .flatten()
            .next()
            .map(|listing| listing.source)
            .unwrap_or(JobSource::Other)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            listings: true,
            details: true,
            company_overview: true,
            metered: true,
        }
    }

    async fn fetch_listings_page(
        &self,
        _params: &SearchParams,
        token: Option<&PageToken>,
    ) -> Result<ListingPage, SourceError> {
        let index: usize = match token {
            Some(token) => token
                .0
                .parse()
                .map_err(|_| SourceError::Malformed(format!("bad page token {:?}", token.0)))?,
            None => 0,
        };
        let listings = self
            .queue
            .submit(CallType::ListingSearch, Priority::Normal, SubmitMode::NonBlocking, || async {
                Ok::<_, TaskFailure>(self.pages.get(index).cloned().unwrap_or_default())
            })
            .await?;
        let next = (index + 1 < self.pages.len()).then(|| PageToken((index + 1).to_string()));
        Ok(ListingPage { listings, next })
    }

    async fn fetch_details(&self, listing: &ListingRef, priority: Priority) -> Result<JobDetails, SourceError> {
        let description = self
            .queue
            .submit(CallType::JobDetails, priority, SubmitMode::NonBlocking, || async {
                let url_id = Url::parse(&listing.url).ok().and_then(|u| linkedin_job_id(&u));
                let found = listing
                    .external_id
                    .as_deref()
                    .and_then(|id| self.details.get(id))
                    .or_else(|| self.details.get(&detail_key(&listing.url)))
                    .or_else(|| url_id.as_deref().and_then(|id| self.details.get(id)));
                Ok::<_, TaskFailure>(found.cloned())
            })
            .await?;
        Ok(JobDetails {
            description,
            expired: false,
        })
    }

    async fn fetch_company_overview(
        &self,
        company_name: &str,
        priority: Priority,
    ) -> Result<CompanyOverview, SourceError> {
        let key = normalize_company_name(company_name);
        let overview = self
            .queue
            .submit(CallType::CompanyOverview, priority, SubmitMode::NonBlocking, || async {
                Ok::<_, TaskFailure>(self.companies.get(&key).cloned())
            })
            .await?;
        Ok(CompanyOverview {
            company_name: company_name.trim().to_string(),
            overview,
            url: None,
        })
    }
}
