//! Apify-hosted LinkedIn actors: start a run, wait for it, then page the
//! run's default dataset by offset. Every call goes through the shared
//! metered queue; only starting a run costs quota.

use async_trait::async_trait;
use jobsift_core::{canonical_url, linkedin_job_id, normalize_company_name, JobSource};
use jobsift_storage::{CallType, HttpFetcher, Priority, RequestQueue, SubmitMode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::{
    parse_posted_at, Capabilities, CompanyOverview, DataSource, JobDetails, ListingPage, ListingRef,
    PageToken, RawListing, SearchParams, SourceError,
};

pub const DEFAULT_BASE_URL: &str = "https://api.apify.com/v2";
pub const LISTINGS_ACTOR: &str = "apimaestro~linkedin-jobs-scraper-api";
pub const JOB_DETAIL_ACTOR: &str = "apimaestro~linkedin-job-detail";
pub const COMPANY_DETAIL_ACTOR: &str = "apimaestro~linkedin-company-detail";

const TITLE_KEYS: [&str; 2] = ["job_title", "title"];
const COMPANY_KEYS: [&str; 2] = ["company", "company_name"];
const URL_KEYS: [&str; 2] = ["job_url", "url"];
const LOCATION_KEYS: [&str; 1] = ["location"];
const DESCRIPTION_KEYS: [&str; 4] = [
    "description",
    "job_description",
    "jobDescription",
    "jobDescriptionText",
];
const POSTED_KEYS: [&str; 3] = ["posted_at", "postedAt", "posted_date"];
const ID_KEYS: [&str; 2] = ["job_id", "id"];

#[derive(Debug, Clone)]
pub struct ApifyConfig {
    pub token: String,
    pub base_url: String,
    pub listings_actor: String,
    pub details_actor: String,
    pub company_actor: String,
    pub page_size: u32,
    /// Long-poll seconds per `waitForFinish` call.
    pub wait_secs: u32,
    pub max_wait_polls: u32,
    pub mode: SubmitMode,
}

impl ApifyConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            listings_actor: LISTINGS_ACTOR.to_string(),
            details_actor: JOB_DETAIL_ACTOR.to_string(),
            company_actor: COMPANY_DETAIL_ACTOR.to_string(),
            page_size: 100,
            wait_secs: 60,
            max_wait_polls: 30,
            mode: SubmitMode::NonBlocking,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    data: T,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunData {
    pub id: String,
    pub status: String,
    pub default_dataset_id: String,
}

#[derive(Debug, Serialize)]
struct ListingsInput<'a> {
    keywords: &'a str,
    location: &'a str,
    remote: &'a str,
    #[serde(rename = "experienceLevel")]
    experience_level: &'a str,
    sort: &'a str,
    date_posted: &'a str,
    easy_apply: &'a str,
    limit: u32,
}

impl<'a> From<&'a SearchParams> for ListingsInput<'a> {
    fn from(params: &'a SearchParams) -> Self {
        Self {
            keywords: &params.keywords,
            location: &params.location,
            remote: params.remote.as_deref().unwrap_or(""),
            experience_level: params.experience_level.as_deref().unwrap_or(""),
            sort: params.sort.as_deref().unwrap_or("recent"),
            date_posted: params.date_posted.as_deref().unwrap_or("week"),
            easy_apply: if params.easy_apply { "true" } else { "" },
            limit: params.limit,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApifyDataSource {
    config: ApifyConfig,
    http: HttpFetcher,
    queue: RequestQueue,
}

impl ApifyDataSource {
    pub fn new(config: ApifyConfig, http: HttpFetcher, queue: RequestQueue) -> Self {
        Self { config, http, queue }
    }

    async fn start_run<I>(
        &self,
        actor: &str,
        input: &I,
        call_type: CallType,
        priority: Priority,
    ) -> Result<RunData, SourceError>
    where
        I: Serialize + Sync,
    {
        let url = format!("{}/acts/{}/runs", self.config.base_url, actor);
        let token = self.config.token.as_str();
        let resp: ApiResponse<RunData> = self
            .queue
            .submit(call_type, priority, self.config.mode, || {
                self.http.post_json(&url, Some(token), input)
            })
            .await?;
        info!(actor, run_id = %resp.data.id, "apify run started");
        Ok(resp.data)
    }

    async fn wait_for_run(&self, mut run: RunData, priority: Priority) -> Result<RunData, SourceError> {
        let token = self.config.token.as_str();
        for _ in 0..=self.config.max_wait_polls {
            match run.status.as_str() {
                "SUCCEEDED" => return Ok(run),
                "FAILED" | "ABORTED" | "TIMED-OUT" => {
                    return Err(SourceError::RunFailed {
                        run_id: run.id,
                        status: run.status,
                    })
                }
                _ => debug!(run_id = %run.id, status = %run.status, "run still in progress"),
            }
            let url = format!(
                "{}/actor-runs/{}?waitForFinish={}",
                self.config.base_url, run.id, self.config.wait_secs
            );
            let resp: ApiResponse<RunData> = self
                .queue
                .submit(CallType::DatasetPage, priority, self.config.mode, || {
                    self.http.get_json(&url, Some(token))
                })
                .await?;
            run = resp.data;
        }
        Err(SourceError::RunFailed {
            run_id: run.id,
            status: format!("{} after {} polls", run.status, self.config.max_wait_polls),
        })
    }

    async fn dataset_page(
        &self,
        dataset_id: &str,
        offset: usize,
        limit: u32,
        priority: Priority,
    ) -> Result<Vec<Value>, SourceError> {
        let url = format!(
            "{}/datasets/{}/items?format=json&clean=true&offset={}&limit={}",
            self.config.base_url, dataset_id, offset, limit
        );
        let token = self.config.token.as_str();
        let items: Vec<Value> = self
            .queue
            .submit(CallType::DatasetPage, priority, self.config.mode, || {
                self.http.get_json(&url, Some(token))
            })
            .await?;
        Ok(items)
    }

    /// Runs an actor to completion and returns the first page of its dataset.
    async fn run_to_items(
        &self,
        actor: &str,
        input: &Value,
        call_type: CallType,
        priority: Priority,
    ) -> Result<Vec<Value>, SourceError> {
        let run = self.start_run(actor, input, call_type, priority).await?;
        let run = self.wait_for_run(run, priority).await?;
        self.dataset_page(&run.default_dataset_id, 0, self.config.page_size, priority)
            .await
    }
}

#[async_trait]
impl DataSource for ApifyDataSource {
    fn name(&self) -> &'static str {
        "apify"
    }

    fn source(&self) -> JobSource {
        JobSource::Apify
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
        params: &SearchParams,
        token: Option<&PageToken>,
    ) -> Result<ListingPage, SourceError> {
        let (dataset_id, offset) = match token {
            Some(token) => parse_page_token(token)?,
            None => {
                let input = ListingsInput::from(params);
                let run = self
                    .start_run(&self.config.listings_actor, &input, CallType::ListingSearch, Priority::Normal)
                    .await?;
                let run = self.wait_for_run(run, Priority::Normal).await?;
                (run.default_dataset_id, 0)
            }
        };

        let items = self
            .dataset_page(&dataset_id, offset, self.config.page_size, Priority::Normal)
            .await?;
        let fetched = items.len();
        let listings: Vec<RawListing> = items.iter().filter_map(normalize_listing_item).collect();
        if listings.len() < fetched {
            warn!(
                dropped = fetched - listings.len(),
                "apify items without title, company or url dropped"
            );
        }

        let next = (fetched > 0 && fetched as u32 >= self.config.page_size)
            .then(|| PageToken(format!("{}:{}", dataset_id, offset + fetched)));
        Ok(ListingPage { listings, next })
    }

    async fn fetch_details(&self, listing: &ListingRef, priority: Priority) -> Result<JobDetails, SourceError> {
        let job_id = listing
            .external_id
            .clone()
            .or_else(|| url::Url::parse(&listing.url).ok().and_then(|u| linkedin_job_id(&u)))
            .ok_or_else(|| SourceError::Malformed(format!("no LinkedIn job id in {}", listing.url)))?;

        let items = self
            .run_to_items(
                &self.config.details_actor,
                &json!({ "job_id": [job_id] }),
                CallType::JobDetails,
                priority,
            )
            .await?;
        Ok(JobDetails {
            description: items.iter().find_map(detail_description),
            expired: false,
        })
    }

    async fn fetch_company_overview(
        &self,
        company_name: &str,
        priority: Priority,
    ) -> Result<CompanyOverview, SourceError> {
        let items = self
            .run_to_items(
                &self.config.company_actor,
                &json!({ "identifier": [company_name], "maxResults": 1 }),
                CallType::CompanyOverview,
                priority,
            )
            .await?;
        Ok(company_overview_from_items(company_name, &items))
    }
}

fn parse_page_token(token: &PageToken) -> Result<(String, usize), SourceError> {
    let (dataset, offset) = token
        .0
        .rsplit_once(':')
        .ok_or_else(|| SourceError::Malformed(format!("bad page token {:?}", token.0)))?;
    let offset = offset
        .parse()
        .map_err(|_| SourceError::Malformed(format!("bad page token {:?}", token.0)))?;
    Ok((dataset.to_string(), offset))
}

fn first_string(item: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match item.get(*key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        // Some actor versions nest the employer as {"name": ...}.
        Some(Value::Object(obj)) => obj
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        _ => None,
    })
}

/// Translates one listings-actor dataset item. Items missing a title,
/// company or url are unusable and yield `None`.
pub fn normalize_listing_item(item: &Value) -> Option<RawListing> {
    let title = first_string(item, &TITLE_KEYS)?;
    let company_name = first_string(item, &COMPANY_KEYS)?;
    let url = first_string(item, &URL_KEYS)?;
    Some(RawListing {
        source: JobSource::Apify,
        title,
        company_name,
        location: first_string(item, &LOCATION_KEYS).unwrap_or_default(),
        url,
        description: first_string(item, &DESCRIPTION_KEYS),
        posted_at: first_string(item, &POSTED_KEYS).and_then(|raw| parse_posted_at(&raw)),
        external_id: first_string(item, &ID_KEYS),
    })
}

fn detail_description(item: &Value) -> Option<String> {
    item.get("job_info")
        .and_then(|info| first_string(info, &DESCRIPTION_KEYS))
        .or_else(|| first_string(item, &DESCRIPTION_KEYS))
}

/// Picks the item answering for `company_name` from a company-detail run.
pub fn company_overview_from_items(company_name: &str, items: &[Value]) -> CompanyOverview {
    let wanted = normalize_company_name(company_name);
    let item = items
        .iter()
        .find(|item| {
            item.get("input_identifier")
                .and_then(Value::as_str)
                .is_some_and(|id| normalize_company_name(id) == wanted)
        })
        .or_else(|| items.first());

    let basic = item.and_then(|i| i.get("basic_info"));
    CompanyOverview {
        company_name: company_name.trim().to_string(),
        overview: basic.and_then(|b| first_string(b, &["description"])),
        url: basic
            .and_then(|b| first_string(b, &["linkedin_url", "website"]))
            .map(|u| canonical_url(&u)),
    }
}
