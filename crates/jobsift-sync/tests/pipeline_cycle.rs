use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use jobsift_adapters::{DataSource, FixtureDataSource, SourceContext};
use jobsift_core::{ConfigValidationError, FitCategory, Job, JobSource, JobStatus, LocationPriority};
use jobsift_storage::{
    CallType, HttpClientConfig, HttpFetcher, JobQuery, LedgerConfig, QueueConfig, RequestQueue, SqliteStore,
    UsageLedger,
};
use jobsift_sync::{
    build_scheduler, AdjustmentDecision, Classification, ClassificationError, ClassificationRequest, Classifier,
    PipelineOrchestrator, PreferencesStore, SyncConfig, SyncError,
};
use tempfile::TempDir;

const PREFERENCES: &str = r#"
filters:
  positive_keywords:
    - { keyword: rust, weight: 3 }
    - { keyword: kubernetes }
  negative_keywords:
    - { keyword: on-call, weight: 2 }
  sustainability:
    positive: [wind, solar]
    negative: [oil, petroleum, coal]
    use_company_overview: true
  location_priorities:
    - { location: Berlin, weight: 2 }
    - { location: Hamburg, weight: 1 }
  title_skip_keywords: [php]
  good_fit_threshold: 3
  auto_adjustment_enabled: true
search_parameters:
  - keywords: engineer
    location: Germany
sources: [fixture]
user_profile: Backend engineer focused on Rust and energy transition work.
"#;

fn bundle_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/bundles/sample_cycle.json")
}

/// Good fit for anything in Berlin, plain fit elsewhere. An unavailable
/// classifier records the request and then fails it.
#[derive(Default)]
struct LocationClassifier {
    seen: Mutex<Vec<String>>,
    unavailable: bool,
}

impl LocationClassifier {
    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Classifier for LocationClassifier {
    async fn classify(&self, request: &ClassificationRequest) -> Result<Classification, ClassificationError> {
        self.seen.lock().unwrap().push(request.company_name.clone());
        if self.unavailable {
            return Err(ClassificationError::Unavailable("maintenance".into()));
        }
        let fit_category = if request.location.contains("Berlin") {
            FitCategory::GoodFit
        } else {
            FitCategory::Fit
        };
        Ok(Classification {
            fit_category,
            confidence: 0.8,
        })
    }
}

struct Harness {
    dir: TempDir,
    pipeline: PipelineOrchestrator,
    classifier: Arc<LocationClassifier>,
}

impl Harness {
    async fn new(monthly_cap: Option<u64>) -> Self {
        Self::with_preferences(PREFERENCES, monthly_cap).await
    }

    async fn with_preferences(yaml: &str, monthly_cap: Option<u64>) -> Self {
        Self::build(yaml, monthly_cap, &bundle_path(), LocationClassifier::default()).await
    }

    async fn build(yaml: &str, monthly_cap: Option<u64>, bundle: &Path, classifier: LocationClassifier) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let prefs_path = dir.path().join("job_preferences.yaml");
        std::fs::write(&prefs_path, yaml).unwrap();

        let mut config = SyncConfig::from_lookup(|_| None);
        config.preferences_path = prefs_path;
        config.reports_dir = dir.path().join("reports");
        config.monthly_cap = monthly_cap;

        let store = SqliteStore::in_memory().await.unwrap();
        let ledger_config = match monthly_cap {
            Some(cap) => LedgerConfig::with_cap(cap),
            None => LedgerConfig::unmetered(),
        };
        let ledger = UsageLedger::open(ledger_config, Arc::new(store.clone())).await.unwrap();
        let metered_queue = RequestQueue::new(QueueConfig::default(), Arc::new(ledger));
        let ctx = SourceContext {
            http: HttpFetcher::new(HttpClientConfig::default()).unwrap(),
            metered_queue: metered_queue.clone(),
            unmetered_queue: RequestQueue::unmetered(QueueConfig::default()),
            apify_token: None,
            fixture_bundle: None,
        };
        let fixture = FixtureDataSource::from_file(bundle, metered_queue).unwrap();
        let sources: Vec<Arc<dyn DataSource>> = vec![Arc::new(fixture)];
        let classifier = Arc::new(classifier);
        let pipeline = PipelineOrchestrator::new(config, &store, ctx)
            .with_sources(sources)
            .with_classifier(classifier.clone());
        Self {
            dir,
            pipeline,
            classifier,
        }
    }

    fn preferences(&self) -> PreferencesStore {
        PreferencesStore::new(self.dir.path().join("job_preferences.yaml"))
    }
}

#[tokio::test]
async fn full_cycle_scores_classifies_and_reports() {
    let h = Harness::new(None).await;
    let summary = h.pipeline.run_once().await.unwrap();

    assert_eq!(summary.fetched(), 6);
    assert_eq!(summary.inserted(), 6);
    assert_eq!(summary.sources[0].searches, 1);
    assert_eq!(summary.scored, 6);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.excluded, 1);
    assert_eq!(summary.forwarded, 4);
    assert_eq!(summary.classified, 4);
    assert_eq!(summary.good_fits, 3);
    assert_eq!(summary.details_fetched, 1);
    assert_eq!(summary.companies_enriched, 3);
    assert_eq!(summary.usage.calls.get(&CallType::ListingSearch), Some(&2));
    assert!(!summary.cancelled);

    let repo = h.pipeline.repository();
    let solar = repo
        .query_by_status(JobStatus::Scored, &JobQuery::default())
        .await
        .unwrap()
        .into_iter()
        .find(|j| j.company_name == "Solar Grid Labs")
        .unwrap();
    assert_eq!(
        solar.description.as_deref(),
        Some("Design batch and streaming pipelines in Rust for solar forecasting.")
    );
    assert_eq!(solar.fit_category, FitCategory::GoodFit);
    assert_eq!(solar.sightings, 1);

    let skipped = repo
        .query_by_status(JobStatus::Skipped, &JobQuery::default())
        .await
        .unwrap();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].fit_category, FitCategory::PoorFit);

    let dir = PathBuf::from(summary.reports_dir.clone().unwrap());
    let brief = std::fs::read_to_string(dir.join("daily_brief.md")).unwrap();
    assert!(brief.contains("- fixture: 6 fetched over 1 searches, 6 new, 0 updated"));
    assert!(dir.join("cycle_summary.json").exists());
}

#[tokio::test]
async fn oil_employer_never_reaches_the_classifier() {
    let h = Harness::new(None).await;
    h.pipeline.run_once().await.unwrap();

    let excluded = h
        .pipeline
        .repository()
        .query_by_status(JobStatus::SustainabilityExcluded, &JobQuery::default())
        .await
        .unwrap();
    assert_eq!(excluded.len(), 1);
    let acme = &excluded[0];
    assert_eq!(acme.company_name, "Acme Oil Corp");
    assert_eq!(acme.fit_category, FitCategory::VeryPoorFit);
    assert_eq!(acme.classifier_requests, 0);
    assert!(acme.sustainability_matches.iter().any(|m| m.keyword == "oil"));
    assert!(!h.classifier.seen().iter().any(|c| c == "Acme Oil Corp"));
    assert!(!h.classifier.seen().iter().any(|c| c == "Webshop AG"));
}

#[tokio::test]
async fn threshold_adjusts_locations_once_and_revert_restores_the_snapshot() {
    let h = Harness::new(None).await;
    let original = h.preferences().load().await.unwrap();

    let first = h.pipeline.run_once().await.unwrap();
    let event = match first.adjustment {
        Some(AdjustmentDecision::Adjusted { event }) => event,
        other => panic!("expected an adjustment, got {other:?}"),
    };
    assert_eq!(event.previous_config, original.filters);

    let adjusted = h.preferences().load().await.unwrap();
    assert_eq!(
        adjusted.filters.location_priorities,
        vec![LocationPriority::new("Berlin", 5), LocationPriority::new("Hamburg", 1)]
    );
    assert_eq!(adjusted.user_profile, original.user_profile);

    // Nothing new was classified since the adjustment.
    let second = h.pipeline.run_once().await.unwrap();
    assert!(matches!(
        second.adjustment,
        Some(AdjustmentDecision::BelowThreshold { good_fits: 0, threshold: 3 })
    ));
    assert_eq!(second.inserted(), 0);
    assert_eq!(h.classifier.seen().len(), 4);

    let repo = h.pipeline.repository();
    assert_eq!(repo.adjustments(10).await.unwrap().len(), 1);

    let controller = h.pipeline.controller(&adjusted);
    let reverted = controller.revert_last().await.unwrap().unwrap();
    assert!(reverted.reverted);
    assert_eq!(h.preferences().load().await.unwrap().filters, original.filters);
    assert!(repo.latest_adjustment().await.unwrap().unwrap().reverted);
    assert!(controller.revert_last().await.unwrap().is_none());
}

#[tokio::test]
async fn second_breach_while_adjusted_is_suppressed() {
    let h = Harness::new(None).await;
    let first = h.pipeline.run_once().await.unwrap();
    let event = match first.adjustment {
        Some(AdjustmentDecision::Adjusted { event }) => event,
        other => panic!("expected an adjustment, got {other:?}"),
    };

    let repo = h.pipeline.repository();
    for n in 0..3 {
        let job = Job::discovered(
            JobSource::Other,
            format!("Rust Engineer {n}"),
            "Kiez Energy",
            "Berlin, Germany",
            format!("https://jobs.example.test/{n}"),
            Utc::now(),
        );
        repo.upsert(&job).await.unwrap();
        assert!(repo
            .record_classification(&job.fingerprint, FitCategory::VeryGoodFit, Some(0.9), Utc::now())
            .await
            .unwrap());
    }

    let mut doc = h.preferences().load().await.unwrap();
    let decision = h.pipeline.controller(&doc).evaluate(&mut doc).await.unwrap();
    assert_eq!(
        decision,
        AdjustmentDecision::Suppressed {
            good_fits: 3,
            outstanding_id: event.id,
        }
    );
    assert_eq!(repo.adjustments(10).await.unwrap().len(), 1);
    assert_eq!(h.preferences().load().await.unwrap().filters, event.new_config);
}

#[tokio::test]
async fn exhausted_quota_pauses_the_source_for_the_cycle() {
    let h = Harness::new(Some(1)).await;
    let summary = h.pipeline.run_once().await.unwrap();

    let fixture = &summary.sources[0];
    assert!(fixture.quota_paused);
    assert_eq!(fixture.fetched, 3);
    assert!(fixture.provider_errors.is_empty());
    assert_eq!(summary.usage.used_units, 1);
    assert_eq!(summary.usage.remaining, Some(0));
    // The paused source is not asked for details or overviews.
    assert_eq!(summary.details_fetched, 0);
    assert_eq!(summary.companies_enriched, 0);
    assert!(h.pipeline.metered_ledger().is_cap_reached());
}

#[tokio::test]
async fn invalid_preferences_abort_and_keep_the_last_valid_document() {
    let h = Harness::new(None).await;
    h.pipeline.run_once().await.unwrap();
    let before = h.pipeline.last_valid_preferences().unwrap();

    let broken = PREFERENCES.replace("good_fit_threshold: 3", "good_fit_threshold: 0");
    std::fs::write(h.dir.path().join("job_preferences.yaml"), broken).unwrap();

    let err = h.pipeline.run_once().await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidPreferences { .. }));
    assert_eq!(err.validation(), Some(&ConfigValidationError::ZeroThreshold));
    assert_eq!(h.pipeline.last_valid_preferences().unwrap(), before);
    assert_eq!(before.filters.good_fit_threshold, 3);
}

#[tokio::test]
async fn blank_location_rejects_the_document_before_any_fetch() {
    let yaml = PREFERENCES.replace("location: Hamburg", "location: \"  \"");
    let h = Harness::with_preferences(&yaml, None).await;

    let err = h.pipeline.run_once().await.unwrap_err();
    assert_eq!(err.validation(), Some(&ConfigValidationError::BlankLocation));
    assert!(h.pipeline.last_valid_preferences().is_none());
    let counts = h.pipeline.repository().status_counts().await.unwrap();
    assert!(counts.values().all(|n| *n == 0));
}

#[tokio::test]
async fn scheduler_rejects_a_malformed_cron_expression() {
    let h = Harness::new(None).await;
    assert!(build_scheduler(Arc::new(h.pipeline), "every morning").await.is_err());
}

#[tokio::test]
async fn classifier_retries_do_not_refetch_details() {
    let mut bundle: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(bundle_path()).unwrap()).unwrap();
    bundle["details"].as_object_mut().unwrap().remove("4100000003");
    let scratch = tempfile::tempdir().unwrap();
    let bundle_file = scratch.path().join("bundle.json");
    std::fs::write(&bundle_file, serde_json::to_vec(&bundle).unwrap()).unwrap();

    let classifier = LocationClassifier {
        unavailable: true,
        ..Default::default()
    };
    let h = Harness::build(PREFERENCES, Some(50), &bundle_file, classifier).await;

    let first = h.pipeline.run_once().await.unwrap();
    assert_eq!(first.details_fetched, 1);
    assert_eq!(first.classification_failures, 4);
    assert_eq!(first.usage.calls.get(&CallType::JobDetails), Some(&1));

    let second = h.pipeline.run_once().await.unwrap();
    assert_eq!(second.scored, 4);
    assert_eq!(second.forwarded, 4);
    assert_eq!(second.details_fetched, 0);
    assert_eq!(second.classification_failures, 4);
    assert_eq!(second.usage.calls.get(&CallType::JobDetails), Some(&1));
    assert_eq!(second.usage.calls.get(&CallType::ListingSearch), Some(&4));
}

#[tokio::test]
async fn cancel_between_cycles_stops_only_the_next_cycle() {
    let h = Harness::new(None).await;
    h.pipeline.cancellation().cancel();

    let stopped = h.pipeline.run_once().await.unwrap();
    assert!(stopped.cancelled);
    assert_eq!(stopped.fetched(), 0);
    assert_eq!(stopped.scored, 0);
    assert!(!h.pipeline.cancellation().is_cancelled());

    let resumed = h.pipeline.run_once().await.unwrap();
    assert!(!resumed.cancelled);
    assert_eq!(resumed.fetched(), 6);
}
