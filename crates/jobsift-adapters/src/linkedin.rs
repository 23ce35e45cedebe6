//! Direct crawl of LinkedIn's public guest endpoints. Search cards,
//! posting pages and company "about" pages are plain HTML parsed with
//! `scraper`; calls run through an unmetered queue.

use async_trait::async_trait;
use jobsift_core::{linkedin_job_id, JobSource};
use jobsift_storage::{CallType, HttpFetcher, Priority, RequestQueue, SubmitMode};
use scraper::Html;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::html::{element_block_text, element_text, first_attr_in, first_text_in, select_first_attr, selector};
use crate::{
    parse_posted_at, Capabilities, CompanyOverview, DataSource, JobDetails, ListingPage, ListingRef,
    PageToken, RawListing, SearchParams, SourceError,
};

pub const DEFAULT_BASE_URL: &str = "https://www.linkedin.com";

const CARD_SELECTOR: &str = "div.base-search-card, div.job-search-card";
const DESCRIPTION_SELECTORS: [&str; 5] = [
    "div.show-more-less-html__markup",
    "section[data-job-id] div.show-more-less-html__markup",
    "div.description__text",
    "section.description div.core-section-container__content",
    "div.jobs-description__content",
];
const ABOUT_SELECTORS: [&str; 7] = [
    ".org-about-module__description p",
    "p[data-test-id=\"about-us__description\"]",
    "[data-test-id=\"about-us__description\"]",
    ".org-about-module__description",
    "section[data-test-id=\"about-us\"] p",
    "div[data-test-id=\"about-us\"] p",
    "section.core-section-container p",
];
const EXPIRED_MARKERS: [&str; 7] = [
    "no longer accepting applications",
    "job is no longer available",
    "this job has expired",
    "position has been filled",
    "job has been closed",
    "application deadline has passed",
    "no longer active",
];

#[derive(Debug, Clone)]
pub struct LinkedInConfig {
    pub base_url: String,
    /// Search result pages fetched per query.
    pub max_pages: u32,
    pub mode: SubmitMode,
}

impl Default for LinkedInConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            max_pages: 5,
            mode: SubmitMode::NonBlocking,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkedInDataSource {
    config: LinkedInConfig,
    http: HttpFetcher,
    queue: RequestQueue,
}

impl LinkedInDataSource {
    pub fn new(config: LinkedInConfig, http: HttpFetcher, queue: RequestQueue) -> Self {
        Self { config, http, queue }
    }

    async fn get_html(&self, url: &str, call_type: CallType, priority: Priority) -> Result<String, SourceError> {
        let body = self
            .queue
            .submit(call_type, priority, self.config.mode, || self.http.get_text(url))
            .await?;
        Ok(body)
    }
}

#[async_trait]
impl DataSource for LinkedInDataSource {
    fn name(&self) -> &'static str {
        "linkedin"
    }

    fn source(&self) -> JobSource {
        JobSource::LinkedIn
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            listings: true,
            details: true,
            company_overview: true,
            metered: false,
        }
    }

    async fn fetch_listings_page(
        &self,
        params: &SearchParams,
        token: Option<&PageToken>,
    ) -> Result<ListingPage, SourceError> {
        let (start, page_index) = match token {
            Some(token) => parse_page_token(token)?,
            None => (0, 0),
        };
        let url = search_url(&self.config.base_url, params, start)?;
        let body = self.get_html(&url, CallType::ListingSearch, Priority::Normal).await?;
        let (listings, cards) = parse_search_page(&body)?;
        debug!(start, cards, kept = listings.len(), "linkedin search page parsed");

        let next_start = start + cards;
        let next = (cards > 0 && page_index + 1 < self.config.max_pages && next_start < params.limit as usize)
            .then(|| PageToken(format!("{}:{}", next_start, page_index + 1)));
        Ok(ListingPage { listings, next })
    }

    async fn fetch_details(&self, listing: &ListingRef, priority: Priority) -> Result<JobDetails, SourceError> {
        let job_id = listing
            .external_id
            .clone()
            .or_else(|| Url::parse(&listing.url).ok().and_then(|u| linkedin_job_id(&u)))
            .ok_or_else(|| SourceError::Malformed(format!("no LinkedIn job id in {}", listing.url)))?;
        let url = format!("{}/jobs-guest/jobs/api/jobPosting/{}", self.config.base_url, job_id);
        let body = self.get_html(&url, CallType::JobDetails, priority).await?;
        parse_job_posting(&body)
    }

    async fn fetch_company_overview(
        &self,
        company_name: &str,
        priority: Priority,
    ) -> Result<CompanyOverview, SourceError> {
        let slug = company_slug(company_name);
        if slug.is_empty() {
            return Err(SourceError::Malformed(format!("no slug for company {company_name:?}")));
        }
        let url = format!("{}/company/{}", self.config.base_url, slug);
        let body = self.get_html(&url, CallType::CompanyOverview, priority).await?;
        Ok(CompanyOverview {
            company_name: company_name.trim().to_string(),
            overview: parse_company_about(&body)?,
            url: Some(url),
        })
    }
}

fn parse_page_token(token: &PageToken) -> Result<(usize, u32), SourceError> {
    let bad = || SourceError::Malformed(format!("bad page token {:?}", token.0));
    let (start, page) = token.0.split_once(':').ok_or_else(bad)?;
    Ok((start.parse().map_err(|_| bad())?, page.parse().map_err(|_| bad())?))
}

fn date_posted_filter(value: &str) -> Option<&'static str> {
    match value.trim().to_ascii_lowercase().as_str() {
        "day" | "24h" => Some("r86400"),
        "week" => Some("r604800"),
        "month" => Some("r2592000"),
        _ => None,
    }
}

fn work_type_filter(value: &str) -> Option<&'static str> {
    match value.trim().to_ascii_lowercase().as_str() {
        "onsite" | "on-site" => Some("1"),
        "remote" => Some("2"),
        "hybrid" => Some("3"),
        _ => None,
    }
}

fn experience_filter(value: &str) -> Option<&'static str> {
    match value.trim().to_ascii_lowercase().as_str() {
        "internship" => Some("1"),
        "entry" => Some("2"),
        "associate" => Some("3"),
        "mid_senior" | "mid-senior" => Some("4"),
        "director" => Some("5"),
        "executive" => Some("6"),
        _ => None,
    }
}

fn sort_filter(value: &str) -> Option<&'static str> {
    match value.trim().to_ascii_lowercase().as_str() {
        "recent" => Some("DD"),
        "relevant" => Some("R"),
        _ => None,
    }
}

pub fn search_url(base_url: &str, params: &SearchParams, start: usize) -> Result<String, SourceError> {
    let mut url = Url::parse(&format!("{base_url}/jobs-guest/jobs/api/seeMoreJobPostings/search"))
        .map_err(|e| SourceError::Config(format!("linkedin base url: {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("keywords", &params.keywords);
        if !params.location.trim().is_empty() {
            query.append_pair("location", params.location.trim());
        }
        if let Some(v) = params.date_posted.as_deref().and_then(date_posted_filter) {
            query.append_pair("f_TPR", v);
        }
        if let Some(v) = params.remote.as_deref().and_then(work_type_filter) {
            query.append_pair("f_WT", v);
        }
        if let Some(v) = params.experience_level.as_deref().and_then(experience_filter) {
            query.append_pair("f_E", v);
        }
        if let Some(v) = params.sort.as_deref().and_then(sort_filter) {
            query.append_pair("sortBy", v);
        }
        if params.easy_apply {
            query.append_pair("f_AL", "true");
        }
        query.append_pair("start", &start.to_string());
    }
    Ok(url.to_string())
}

/// Returns the usable listings and the number of cards seen.
pub fn parse_search_page(body: &str) -> Result<(Vec<RawListing>, usize), SourceError> {
    let document = Html::parse_document(body);
    let card_sel = selector(CARD_SELECTOR)?;
    let title_sel = selector("h3.base-search-card__title")?;
    let company_sel = selector("h4.base-search-card__subtitle")?;
    let location_sel = selector("span.job-search-card__location")?;
    let link_sel = selector("a.base-card__full-link")?;
    let time_sel = selector("time")?;

    let mut cards = 0;
    let mut listings = Vec::new();
    for card in document.select(&card_sel) {
        cards += 1;
        let (Some(title), Some(company_name), Some(url)) = (
            first_text_in(card, &title_sel),
            first_text_in(card, &company_sel),
            first_attr_in(card, &link_sel, "href"),
        ) else {
            continue;
        };
        let external_id = card
            .value()
            .attr("data-entity-urn")
            .and_then(|urn| urn.rsplit(':').next())
            .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
            .map(str::to_string)
            .or_else(|| Url::parse(&url).ok().and_then(|u| linkedin_job_id(&u)));
        listings.push(RawListing {
            source: JobSource::LinkedIn,
            title,
            company_name,
            location: first_text_in(card, &location_sel).unwrap_or_default(),
            url,
            description: None,
            posted_at: first_attr_in(card, &time_sel, "datetime").and_then(|raw| parse_posted_at(&raw)),
            external_id,
        });
    }
    Ok((listings, cards))
}

pub fn parse_job_posting(body: &str) -> Result<JobDetails, SourceError> {
    let document = Html::parse_document(body);
    let mut description = None;
    for css in DESCRIPTION_SELECTORS {
        let sel = selector(css)?;
        if let Some(text) = document.select(&sel).find_map(element_block_text) {
            description = Some(text);
            break;
        }
    }
    let page_text = document
        .root_element()
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let expired = EXPIRED_MARKERS.iter().any(|m| page_text.contains(m));
    Ok(JobDetails { description, expired })
}

fn looks_like_cookie_banner(text: &str) -> bool {
    let t = text.to_lowercase();
    t.contains("linkedin respects your privacy")
        || t.contains("cookie policy")
        || t.contains("essential and non-essential cookies")
}

/// Best "about" paragraph on a public company page: the longest candidate
/// of at least 200 chars, else of at least 80, ignoring cookie banners.
pub fn parse_company_about(body: &str) -> Result<Option<String>, SourceError> {
    let document = Html::parse_document(body);
    let mut candidates: Vec<String> = Vec::new();

    for css in ABOUT_SELECTORS {
        let sel = selector(css)?;
        if let Some(text) = document.select(&sel).next().and_then(element_text) {
            if text.len() > 50 {
                candidates.push(text);
            }
        }
    }

    let ld_sel = selector("script[type=\"application/ld+json\"]")?;
    for script in document.select(&ld_sel) {
        let raw: String = script.text().collect();
        let Ok(data) = serde_json::from_str::<Value>(&raw) else {
            continue;
        };
        let graph = data.get("@graph").and_then(Value::as_array).cloned().unwrap_or_default();
        for node in graph.iter().chain(std::iter::once(&data)) {
            if let Some(desc) = node.get("description").and_then(Value::as_str) {
                if desc.trim().len() > 80 {
                    candidates.push(desc.trim().to_string());
                }
            }
        }
    }

    if let Some(meta) = select_first_attr(&document, "meta[name=\"description\"]", "content")? {
        let lower = meta.to_lowercase();
        if meta.len() > 50 && !lower.contains("linkedin") && !lower.contains("log in") {
            candidates.push(meta);
        }
    }

    let usable: Vec<&String> = candidates.iter().filter(|c| !looks_like_cookie_banner(c)).collect();
    let pick = |min_len: usize| {
        usable
            .iter()
            .filter(|c| c.len() >= min_len)
            .max_by_key(|c| c.len())
            .map(|c| c.to_string())
    };
    Ok(pick(200).or_else(|| pick(80)))
}

/// LinkedIn vanity slug guess: lowercase ascii alphanumerics joined by dashes.
pub fn company_slug(company_name: &str) -> String {
    let cleaned: String = company_name
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace() || *c == '-')
        .collect();
    cleaned
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{read_fixture, StubServer};
    use futures::StreamExt;
    use jobsift_storage::QueueConfig;

    #[test]
    fn search_cards_become_listings() {
        let (listings, cards) = parse_search_page(&read_fixture("linkedin/search_page.html")).unwrap();
        assert_eq!(cards, 3);
        assert_eq!(listings.len(), 2);

        let first = &listings[0];
        assert_eq!(first.title, "Platform Engineer");
        assert_eq!(first.company_name, "Windkraft GmbH");
        assert_eq!(first.location, "Berlin, Berlin, Germany");
        assert_eq!(first.external_id.as_deref(), Some("3900000001"));
        assert_eq!(first.posted_at.unwrap().to_rfc3339(), "2026-03-03T00:00:00+00:00");

        assert_eq!(listings[1].external_id.as_deref(), Some("3900000002"));
    }

    #[test]
    fn posting_description_keeps_paragraphs() {
        let details = parse_job_posting(&read_fixture("linkedin/job_posting.html")).unwrap();
        let description = details.description.unwrap();
        assert!(description.starts_with("We are hiring a Platform Engineer"));
        assert!(description.contains("\nYou will own our Rust ingestion services."));
        assert!(!details.expired);
    }

    #[test]
    fn closed_postings_are_flagged_expired() {
        let details = parse_job_posting(
            "<html><body><figure><figcaption>No longer accepting applications</figcaption></figure></body></html>",
        )
        .unwrap();
        assert!(details.expired);
        assert_eq!(details.description, None);
    }

    #[test]
    fn company_about_skips_cookie_banner() {
        let about = parse_company_about(&read_fixture("linkedin/company_about.html"))
            .unwrap()
            .unwrap();
        assert!(about.starts_with("Windkraft GmbH develops and operates onshore wind parks"));
    }

    #[test]
    fn slugs_follow_linkedin_vanity_urls() {
        assert_eq!(company_slug("Windkraft GmbH"), "windkraft-gmbh");
        assert_eq!(company_slug("  AT&T  Labs -- Research "), "att-labs-research");
        assert_eq!(company_slug("株式会社"), "");
    }

    #[test]
    fn search_url_maps_preferences_to_guest_filters() {
        let mut params = SearchParams::new("rust engineer", "Berlin");
        params.date_posted = Some("week".into());
        params.remote = Some("hybrid".into());
        params.experience_level = Some("mid_senior".into());
        params.easy_apply = true;
        let url = search_url(DEFAULT_BASE_URL, &params, 25).unwrap();
        assert!(url.starts_with("https://www.linkedin.com/jobs-guest/jobs/api/seeMoreJobPostings/search?"));
        assert!(url.contains("keywords=rust+engineer"));
        assert!(url.contains("f_TPR=r604800"));
        assert!(url.contains("f_WT=3"));
        assert!(url.contains("f_E=4"));
        assert!(url.contains("f_AL=true"));
        assert!(url.ends_with("start=25"));
    }

    #[tokio::test]
    async fn paging_stops_at_max_pages() {
        let server = StubServer::start(vec![(
            "GET",
            "/jobs-guest/jobs/api/seeMoreJobPostings/search",
            200,
            read_fixture("linkedin/search_page.html"),
        )])
        .await;
        let queue = RequestQueue::unmetered(QueueConfig::default());
        let source = LinkedInDataSource::new(
            LinkedInConfig {
                base_url: server.base_url(),
                max_pages: 2,
                mode: SubmitMode::NonBlocking,
            },
            HttpFetcher::new(Default::default()).unwrap(),
            queue.clone(),
        );

        let params = SearchParams::new("rust", "Berlin");
        let listings: Vec<_> = crate::listing_stream(&source, &params, None).collect().await;
        assert_eq!(listings.len(), 4);
        assert_eq!(queue.ledger().snapshot().calls.get(&CallType::ListingSearch), Some(&2));
    }
}
