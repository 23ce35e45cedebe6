//! One ingestion cycle: stream listings into the repository, enrich
//! companies, score, classify, then let the filter controller react.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use futures::StreamExt;
use jobsift_adapters::{listing_stream, source_for, Capability, DataSource, ListingRef, SourceContext};
use jobsift_core::{Company, FitCategory, Job, JobSource, JobStatus};
use jobsift_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, JobRepository, LedgerConfig, Priority, QueueConfig,
    RequestQueue, SqliteStore, UpsertOutcome, UsageLedger,
};
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::classifier::{ClassificationRequest, Classifier, HttpClassifier};
use crate::controller::FilterController;
use crate::preferences::{PreferencesDocument, PreferencesStore};
use crate::report::{write_reports, CycleSummary, SourceSummary};
use crate::scoring::{ScoringEngine, ScoringOutcome};
use crate::{SyncConfig, SyncError};

/// Cooperative stop signal, checked between tasks of a cycle.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SyncConfig {
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_concurrent: self.max_concurrent,
            min_request_delay: self.min_request_delay,
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

pub struct PipelineOrchestrator {
    config: SyncConfig,
    repo: JobRepository,
    preferences: PreferencesStore,
    source_ctx: SourceContext,
    sources_override: Option<Vec<Arc<dyn DataSource>>>,
    classifier: Option<Arc<dyn Classifier>>,
    scoring: ScoringEngine,
    cancel: CancellationFlag,
    cycle_lock: tokio::sync::Mutex<()>,
    last_valid: Mutex<Option<PreferencesDocument>>,
}

impl PipelineOrchestrator {
    pub fn new(config: SyncConfig, store: &SqliteStore, source_ctx: SourceContext) -> Self {
        let preferences = PreferencesStore::new(config.preferences_path.clone());
        Self {
            config,
            repo: JobRepository::new(store),
            preferences,
            source_ctx,
            sources_override: None,
            classifier: None,
            scoring: ScoringEngine,
            cancel: CancellationFlag::default(),
            cycle_lock: tokio::sync::Mutex::new(()),
            last_valid: Mutex::new(None),
        }
    }

    /// Opens the database, ledger, queues and HTTP client described by `config`.
    pub async fn from_config(config: SyncConfig) -> Result<Self, SyncError> {
        let store = SqliteStore::connect(&config.database_url).await?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })
        .context("building http client")?;

        let ledger_config = match config.monthly_cap {
            Some(cap) => LedgerConfig::with_cap(cap),
            None => LedgerConfig::unmetered(),
        };
        let ledger = UsageLedger::open(ledger_config, Arc::new(store.clone())).await?;
        let queue_config = config.queue_config();
        let metered_queue = RequestQueue::new(queue_config.clone(), Arc::new(ledger));
        let unmetered_queue = RequestQueue::unmetered(queue_config);

        let source_ctx = SourceContext {
            http: http.clone(),
            metered_queue,
            unmetered_queue: unmetered_queue.clone(),
            apify_token: config.apify_token.clone(),
            fixture_bundle: config.fixture_bundle.clone(),
        };
        let classifier_url = config.classifier_url.clone();
        let mut pipeline = Self::new(config, &store, source_ctx);
        if let Some(url) = classifier_url {
            pipeline = pipeline.with_classifier(Arc::new(HttpClassifier::new(url, http, unmetered_queue)));
        }
        Ok(pipeline)
    }

    /// Uses these sources instead of the document's `sources` list.
    pub fn with_sources(mut self, sources: Vec<Arc<dyn DataSource>>) -> Self {
        self.sources_override = Some(sources);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn repository(&self) -> &JobRepository {
        &self.repo
    }

    pub fn preferences(&self) -> &PreferencesStore {
        &self.preferences
    }

    pub fn metered_ledger(&self) -> &Arc<UsageLedger> {
        self.source_ctx.metered_queue.ledger()
    }

    pub fn cancellation(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    /// Last preferences document that passed validation.
    pub fn last_valid_preferences(&self) -> Option<PreferencesDocument> {
        lock(&self.last_valid).clone()
    }

    pub fn controller(&self, doc: &PreferencesDocument) -> FilterController {
        FilterController::for_document(self.repo.clone(), self.preferences.clone(), doc)
    }

    pub async fn run_once(&self) -> Result<CycleSummary, SyncError> {
        let _running = self.cycle_lock.try_lock().map_err(|_| SyncError::CycleInProgress)?;
        let run_id = Uuid::new_v4();
        let result = self
            .run_cycle(run_id)
            .instrument(info_span!("pipeline_cycle", %run_id))
            .await;
        // A cancel raised between cycles stops the next one; it is cleared
        // once that cycle is over.
        self.cancel.reset();
        result
    }

    async fn run_cycle(&self, run_id: Uuid) -> Result<CycleSummary, SyncError> {
        let started_at = Utc::now();

        let mut doc = match self.preferences.load().await {
            Ok(doc) => doc,
            Err(err) => {
                warn!(error = %err, "preferences rejected, cycle aborted with the last valid configuration kept");
                return Err(err);
            }
        };
        *lock(&self.last_valid) = Some(doc.clone());

        if self.metered_ledger().reset_if_new_period() {
            self.source_ctx.metered_queue.resume();
        }

        let mut summary = CycleSummary {
            run_id,
            started_at,
            finished_at: started_at,
            cancelled: false,
            sources: Vec::new(),
            companies_enriched: 0,
            details_fetched: 0,
            scored: 0,
            skipped: 0,
            excluded: 0,
            forwarded: 0,
            classified: 0,
            classification_failures: 0,
            good_fits: 0,
            adjustment: None,
            usage: self.metered_ledger().snapshot(),
            reports_dir: None,
        };
        let mut paused: HashSet<&'static str> = HashSet::new();

        let sources = self.resolve_sources(&doc, &mut summary);
        self.ingest(&doc, &sources, &mut summary, &mut paused).await?;
        if !self.cancel.is_cancelled() && doc.filters.sustainability.use_company_overview {
            self.enrich_companies(&sources, &mut summary, &mut paused).await?;
        }
        let forwarded = if self.cancel.is_cancelled() {
            Vec::new()
        } else {
            self.score_pending(&doc, &sources, &mut summary, &mut paused).await?
        };
        self.classify(&doc, forwarded, &mut summary).await?;

        if !self.cancel.is_cancelled() {
            let decision = self.controller(&doc).evaluate(&mut doc).await?;
            *lock(&self.last_valid) = Some(doc.clone());
            summary.adjustment = Some(decision);
        }

        summary.cancelled = self.cancel.is_cancelled();
        summary.finished_at = Utc::now();
        summary.usage = self.metered_ledger().snapshot();
        summary.reports_dir = Some(self.config.reports_dir.join(run_id.to_string()).display().to_string());
        write_reports(&self.config.reports_dir, &summary).await?;

        info!(
            fetched = summary.fetched(),
            inserted = summary.inserted(),
            forwarded = summary.forwarded,
            excluded = summary.excluded,
            good_fits = summary.good_fits,
            cancelled = summary.cancelled,
            "cycle finished"
        );
        Ok(summary)
    }

    fn resolve_sources(&self, doc: &PreferencesDocument, summary: &mut CycleSummary) -> Vec<Arc<dyn DataSource>> {
        if let Some(sources) = &self.sources_override {
            return sources.clone();
        }
        // A configured fixture bundle replaces the live providers.
        let kinds: Vec<String> = if self.source_ctx.fixture_bundle.is_some() {
            vec!["fixture".to_string()]
        } else {
            doc.sources.clone()
        };

        let mut sources: Vec<Arc<dyn DataSource>> = Vec::new();
        for kind in kinds {
            match source_for(&kind, &self.source_ctx) {
                Ok(source) => sources.push(Arc::from(source)),
                Err(err) => {
                    warn!(source = %kind, error = %err, "source unavailable this cycle");
                    summary.sources.push(SourceSummary {
                        name: kind,
                        provider_errors: vec![err.to_string()],
                        ..Default::default()
                    });
                }
            }
        }
        sources
    }

    async fn ingest(
        &self,
        doc: &PreferencesDocument,
        sources: &[Arc<dyn DataSource>],
        summary: &mut CycleSummary,
        paused: &mut HashSet<&'static str>,
    ) -> Result<(), SyncError> {
        if doc.search_parameters.is_empty() {
            warn!("no search_parameters configured, nothing to fetch");
        }
        for source in sources {
            let mut stats = SourceSummary {
                name: source.name().to_string(),
                ..Default::default()
            };
            for params in &doc.search_parameters {
                if self.cancel.is_cancelled() || stats.quota_paused {
                    break;
                }
                stats.searches += 1;
                let span = info_span!("search", source = source.name(), keywords = %params.keywords, location = %params.location);
                let mut listings = listing_stream(source.as_ref(), params, None).take(self.config.max_batch_size);
                while let Some(item) = listings.next().instrument(span.clone()).await {
                    match item {
                        Ok(raw) => {
                            stats.fetched += 1;
                            match self.repo.upsert(&raw.into_job(Utc::now())).await? {
                                UpsertOutcome::Inserted => stats.inserted += 1,
                                UpsertOutcome::Updated => stats.updated += 1,
                            }
                        }
                        Err(err) if err.is_quota() => {
                            warn!(source = source.name(), error = %err, "quota exhausted, source paused for this cycle");
                            stats.quota_paused = true;
                            break;
                        }
                        Err(err) => {
                            warn!(source = source.name(), error = %err, "provider error, moving to the next search");
                            stats.provider_errors.push(err.to_string());
                            break;
                        }
                    }
                    if self.cancel.is_cancelled() {
                        break;
                    }
                }
            }
            debug!(source = source.name(), fetched = stats.fetched, inserted = stats.inserted, "source done");
            if stats.quota_paused {
                paused.insert(source.name());
            }
            summary.sources.push(stats);
        }
        Ok(())
    }

    async fn enrich_companies(
        &self,
        sources: &[Arc<dyn DataSource>],
        summary: &mut CycleSummary,
        paused: &mut HashSet<&'static str>,
    ) -> Result<(), SyncError> {
        let Some(source) = pick_source(sources, paused, Capability::CompanyOverview, None) else {
            debug!("no source offers company overviews");
            return Ok(());
        };
        let stale_before = Utc::now() - chrono::Duration::days(self.config.company_refresh_days);
        let names = self
            .repo
            .companies_missing_overview(stale_before, self.config.max_batch_size as u32)
            .await?;

        for name in names {
            if self.cancel.is_cancelled() {
                break;
            }
            let mut company = Company::new(&name, Utc::now());
            match source.fetch_company_overview(&name, Priority::Low).await {
                Ok(found) => {
                    company.overview = found.overview;
                    company.url = found.url;
                    if company.overview_text().is_some() {
                        summary.companies_enriched += 1;
                    }
                }
                Err(err) if err.is_quota() => {
                    mark_paused(summary, paused, source.name());
                    break;
                }
                Err(err) => warn!(company = %name, error = %err, "company overview lookup failed"),
            }
            // Empty lookups are stored too, so they wait out the refresh window.
            self.repo.upsert_company(&company).await?;
        }
        Ok(())
    }

    async fn score_pending(
        &self,
        doc: &PreferencesDocument,
        sources: &[Arc<dyn DataSource>],
        summary: &mut CycleSummary,
        paused: &mut HashSet<&'static str>,
    ) -> Result<Vec<(Job, ScoringOutcome)>, SyncError> {
        let filters = &doc.filters;
        // Without a classifier a retry could only end Scored/Unscored again.
        let pending = self
            .repo
            .pending_scoring(self.config.max_batch_size as u32, self.classifier.is_some())
            .await?;
        let mut forwarded = Vec::new();

        for mut job in pending {
            if self.cancel.is_cancelled() {
                break;
            }
            let company = if filters.sustainability.use_company_overview {
                self.repo.find_company(&job.company_name).await?
            } else {
                None
            };
            let mut outcome = self.scoring.evaluate(&job, filters, company.as_ref());

            // Details are fetched once, on first scoring; retries reuse what is stored.
            if outcome.forward_to_classifier && job.status == JobStatus::Discovered && !job.has_description() {
                if let Some(source) = pick_source(sources, paused, Capability::Details, Some(job.source)) {
                    match source.fetch_details(&ListingRef::from_job(&job), Priority::High).await {
                        Ok(details) => {
                            summary.details_fetched += 1;
                            if details.expired {
                                outcome = ScoringOutcome {
                                    forward_to_classifier: false,
                                    status: JobStatus::Skipped,
                                    fit_category: Some(FitCategory::PoorFit),
                                    reason: Some("posting no longer accepts applications".to_string()),
                                    ..outcome
                                };
                            } else if let Some(description) = details.description {
                                self.repo
                                    .set_description(&job.fingerprint, &description, Utc::now())
                                    .await?;
                                job.description = Some(description);
                                outcome = self.scoring.evaluate(&job, filters, company.as_ref());
                            }
                        }
                        Err(err) if err.is_quota() => mark_paused(summary, paused, source.name()),
                        Err(err) => warn!(fingerprint = %job.fingerprint, error = %err, "detail fetch failed"),
                    }
                }
            }

            self.repo
                .record_outcome(&job.fingerprint, &outcome.to_record(), Utc::now())
                .await?;
            summary.scored += 1;
            match outcome.status {
                JobStatus::Skipped => summary.skipped += 1,
                JobStatus::SustainabilityExcluded => summary.excluded += 1,
                _ => {}
            }
            if outcome.forward_to_classifier {
                summary.forwarded += 1;
                forwarded.push((job, outcome));
            }
        }
        Ok(forwarded)
    }

    async fn classify(
        &self,
        doc: &PreferencesDocument,
        forwarded: Vec<(Job, ScoringOutcome)>,
        summary: &mut CycleSummary,
    ) -> Result<(), SyncError> {
        let Some(classifier) = &self.classifier else {
            if !forwarded.is_empty() {
                info!(count = forwarded.len(), "no classifier configured, forwarded postings stay unscored");
            }
            return Ok(());
        };

        for (job, outcome) in forwarded {
            if self.cancel.is_cancelled() {
                break;
            }
            if !self.repo.record_classifier_request(&job.fingerprint).await? {
                continue;
            }
            let request = ClassificationRequest::new(&job, &outcome, &doc.user_profile);
            match classifier.classify(&request).await {
                Ok(verdict) => {
                    self.repo
                        .record_classification(&job.fingerprint, verdict.fit_category, Some(verdict.confidence), Utc::now())
                        .await?;
                    summary.classified += 1;
                    if verdict.fit_category >= doc.auto_adjustment.min_fit {
                        summary.good_fits += 1;
                    }
                }
                Err(err) => {
                    summary.classification_failures += 1;
                    warn!(title = %job.title, error = %err, "classification failed, posting retried next cycle");
                }
            }
        }
        Ok(())
    }
}

/// Prefers a source of the posting's own provider, then any other that
/// supports `capability` and is not paused.
fn pick_source<'a>(
    sources: &'a [Arc<dyn DataSource>],
    paused: &HashSet<&'static str>,
    capability: Capability,
    origin: Option<JobSource>,
) -> Option<&'a Arc<dyn DataSource>> {
    let usable = |s: &&'a Arc<dyn DataSource>| s.capabilities().supports(capability) && !paused.contains(s.name());
    origin
        .and_then(|origin| sources.iter().filter(usable).find(|s| s.source() == origin))
        .or_else(|| sources.iter().find(usable))
}

fn mark_paused(summary: &mut CycleSummary, paused: &mut HashSet<&'static str>, name: &'static str) {
    warn!(source = name, "quota exhausted, source paused for this cycle");
    paused.insert(name);
    if let Some(stats) = summary.sources.iter_mut().find(|s| s.name == name) {
        stats.quota_paused = true;
    }
}

/// Cron-driven cycles. A tick that lands while a cycle is still running is
/// skipped.
pub async fn build_scheduler(pipeline: Arc<PipelineOrchestrator>, cron: &str) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = CronJob::new_async(cron, move |_uuid, _lock| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(run_id = %summary.run_id, fetched = summary.fetched(), "scheduled cycle finished"),
                Err(SyncError::CycleInProgress) => warn!("previous cycle still running, tick skipped"),
                Err(err) => error!(error = %err, "scheduled cycle failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Builds a pipeline from the environment and runs a single cycle.
pub async fn run_sync_once_from_env() -> Result<CycleSummary, SyncError> {
    let pipeline = PipelineOrchestrator::from_config(SyncConfig::from_env()).await?;
    pipeline.run_once().await
}
