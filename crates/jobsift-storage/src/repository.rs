//! Deduplicating store of postings, companies and filter adjustment events.
//!
//! Every write is a single conditional statement keyed by fingerprint (or
//! company key), so overlapping pipeline cycles can never produce two rows
//! for one posting.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobsift_core::{
    normalize_company_name, Company, FilterAdjustmentEvent, FilterConfig, Fingerprint, FitCategory,
    Job, JobSource, JobStatus, SustainabilityMatch,
};
use sqlx::sqlite::{Sqlite, SqlitePool, SqliteRow};
use sqlx::{QueryBuilder, Row};
use tracing::debug;

use crate::db::{opt_ts_from_sql, ts_from_sql, ts_to_sql};
use crate::{SqliteStore, StorageError};

const CONFLICT_RETRIES: u32 = 5;

const JOB_COLUMNS: &str = "fingerprint, title, company_name, location, url, description, posted_at, \
     source, status, fit_category, sustainability_matches, keyword_score, location_weight, note, \
     classifier_confidence, classifier_requests, sightings, created_at, updated_at, classified_at";

const UPSERT_JOB: &str = r#"
INSERT INTO jobs (
    fingerprint, title, company_name, company_key, location, url, description, posted_at,
    source, status, fit_category, sustainability_matches, keyword_score, location_weight, note,
    classifier_confidence, classifier_requests, sightings, created_at, updated_at, classified_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, 0, 1, ?17, ?18, ?19)
ON CONFLICT(fingerprint) DO UPDATE SET
    title = COALESCE(NULLIF(excluded.title, ''), jobs.title),
    company_name = COALESCE(NULLIF(excluded.company_name, ''), jobs.company_name),
    location = COALESCE(NULLIF(excluded.location, ''), jobs.location),
    url = COALESCE(NULLIF(excluded.url, ''), jobs.url),
    description = COALESCE(NULLIF(excluded.description, ''), jobs.description),
    posted_at = COALESCE(excluded.posted_at, jobs.posted_at),
    status = MAX(jobs.status, excluded.status),
    fit_category = CASE WHEN excluded.fit_category > 0 THEN excluded.fit_category ELSE jobs.fit_category END,
    sustainability_matches = CASE WHEN excluded.sustainability_matches <> '[]'
        THEN excluded.sustainability_matches ELSE jobs.sustainability_matches END,
    keyword_score = COALESCE(excluded.keyword_score, jobs.keyword_score),
    location_weight = COALESCE(excluded.location_weight, jobs.location_weight),
    note = COALESCE(excluded.note, jobs.note),
    classifier_confidence = COALESCE(excluded.classifier_confidence, jobs.classifier_confidence),
    classified_at = COALESCE(excluded.classified_at, jobs.classified_at),
    sightings = jobs.sightings + 1,
    updated_at = MAX(jobs.updated_at, excluded.updated_at)
RETURNING sightings
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Optional narrowing for [`JobRepository::query_by_status`].
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    pub source: Option<JobSource>,
    pub min_fit: Option<FitCategory>,
    pub unclassified_only: bool,
    pub limit: Option<u32>,
}

/// Scoring disposition written back after a pass of the scoring engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringRecord {
    pub status: JobStatus,
    pub fit_category: Option<FitCategory>,
    pub sustainability_matches: Vec<SustainabilityMatch>,
    pub keyword_score: Option<i64>,
    pub location_weight: Option<u32>,
    pub note: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JobRepository {
    pool: SqlitePool,
}

impl JobRepository {
    pub fn new(store: &SqliteStore) -> Self {
        Self {
            pool: store.pool().clone(),
        }
    }

    /// Insert-or-merge by fingerprint in one statement. Non-empty incoming
    /// fields win, status only advances, `created_at` is kept.
    pub async fn upsert(&self, job: &Job) -> Result<UpsertOutcome, StorageError> {
        let matches = serde_json::to_string(&job.sustainability_matches)?;
        let company_key = normalize_company_name(&job.company_name);
        let posted_at = job.posted_at.map(ts_to_sql);
        let created_at = ts_to_sql(job.created_at);
        let updated_at = ts_to_sql(job.updated_at);
        let classified_at = job.classified_at.map(ts_to_sql);

        let sightings: i64 = with_conflict_retry(|| {
            sqlx::query_scalar::<_, i64>(UPSERT_JOB)
                .bind(job.fingerprint.as_str())
                .bind(&job.title)
                .bind(&job.company_name)
                .bind(&company_key)
                .bind(&job.location)
                .bind(&job.url)
                .bind(job.description.as_deref())
                .bind(posted_at.as_deref())
                .bind(job.source.as_str())
                .bind(job.status.rank())
                .bind(job.fit_category.rank())
                .bind(&matches)
                .bind(job.keyword_score)
                .bind(job.location_weight.map(i64::from))
                .bind(job.note.as_deref())
                .bind(job.classifier_confidence)
                .bind(&created_at)
                .bind(&updated_at)
                .bind(classified_at.as_deref())
                .fetch_one(&self.pool)
        })
        .await?;

        let outcome = if sightings <= 1 {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        };
        debug!(fingerprint = %job.fingerprint, ?outcome, sightings, "job upserted");
        Ok(outcome)
    }

    pub async fn find_by_fingerprint(&self, fingerprint: &Fingerprint) -> Result<Option<Job>, StorageError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE fingerprint = ?1");
        let row = sqlx::query(&sql)
            .bind(fingerprint.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_job(&r)).transpose()
    }

    /// Jobs in `status`, best fit and location first.
    pub async fn query_by_status(&self, status: JobStatus, filter: &JobQuery) -> Result<Vec<Job>, StorageError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE status = "));
        qb.push_bind(status.rank());
        if let Some(source) = filter.source {
            qb.push(" AND source = ").push_bind(source.as_str());
        }
        if let Some(min_fit) = filter.min_fit {
            qb.push(" AND fit_category >= ").push_bind(min_fit.rank());
        }
        if filter.unclassified_only {
            qb.push(" AND fit_category = 0");
        }
        qb.push(" ORDER BY fit_category DESC, COALESCE(location_weight, 0) DESC, created_at ASC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
        }
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_job).collect()
    }

    /// Newly discovered postings, oldest first, then (with `include_retries`)
    /// scored ones whose classification failed in an earlier cycle. Retries
    /// only fill what `limit` leaves over.
    pub async fn pending_scoring(&self, limit: u32, include_retries: bool) -> Result<Vec<Job>, StorageError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE status = ?1 OR (?2 AND status = ?3 AND fit_category = 0) \
             ORDER BY status ASC, created_at ASC LIMIT ?4"
        );
        let rows = sqlx::query(&sql)
            .bind(JobStatus::Discovered.rank())
            .bind(include_retries)
            .bind(JobStatus::Scored.rank())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_job).collect()
    }

    /// Writes a scoring disposition. Status still only moves forward.
    pub async fn record_outcome(
        &self,
        fingerprint: &Fingerprint,
        record: &ScoringRecord,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let matches = serde_json::to_string(&record.sustainability_matches)?;
        let at = ts_to_sql(at);
        let result = with_conflict_retry(|| {
            sqlx::query(
                "UPDATE jobs SET \
                    status = MAX(status, ?1), \
                    fit_category = COALESCE(?2, fit_category), \
                    sustainability_matches = ?3, \
                    keyword_score = ?4, \
                    location_weight = ?5, \
                    note = ?6, \
                    updated_at = ?7 \
                 WHERE fingerprint = ?8",
            )
            .bind(record.status.rank())
            .bind(record.fit_category.map(FitCategory::rank))
            .bind(&matches)
            .bind(record.keyword_score)
            .bind(record.location_weight.map(i64::from))
            .bind(record.note.as_deref())
            .bind(&at)
            .bind(fingerprint.as_str())
            .execute(&self.pool)
        })
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Fills in a description fetched after discovery. Does not count as a sighting.
    pub async fn set_description(
        &self,
        fingerprint: &Fingerprint,
        description: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let at = ts_to_sql(at);
        let result = with_conflict_retry(|| {
            sqlx::query(
                "UPDATE jobs SET description = ?1, updated_at = MAX(updated_at, ?2) \
                 WHERE fingerprint = ?3 AND ?1 <> ''",
            )
            .bind(description.trim())
            .bind(&at)
            .bind(fingerprint.as_str())
            .execute(&self.pool)
        })
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Counts an outgoing classifier request. Refuses (returns false) for
    /// skipped or excluded postings, which must never reach the classifier.
    pub async fn record_classifier_request(&self, fingerprint: &Fingerprint) -> Result<bool, StorageError> {
        let result = with_conflict_retry(|| {
            sqlx::query(
                "UPDATE jobs SET classifier_requests = classifier_requests + 1 \
                 WHERE fingerprint = ?1 AND status < ?2",
            )
            .bind(fingerprint.as_str())
            .bind(JobStatus::Skipped.rank())
            .execute(&self.pool)
        })
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Stores the external classifier's verdict on a scored posting.
    pub async fn record_classification(
        &self,
        fingerprint: &Fingerprint,
        fit_category: FitCategory,
        confidence: Option<f64>,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let at = ts_to_sql(at);
        let result = with_conflict_retry(|| {
            sqlx::query(
                "UPDATE jobs SET fit_category = ?1, classifier_confidence = ?2, classified_at = ?3, \
                    status = MAX(status, ?4), updated_at = ?3 \
                 WHERE fingerprint = ?5 AND status < ?6",
            )
            .bind(fit_category.rank())
            .bind(confidence)
            .bind(&at)
            .bind(JobStatus::Scored.rank())
            .bind(fingerprint.as_str())
            .bind(JobStatus::Skipped.rank())
            .execute(&self.pool)
        })
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn count_recent_good_fits(
        &self,
        window: chrono::Duration,
        min_category: FitCategory,
    ) -> Result<u64, StorageError> {
        self.count_good_fits_since(Utc::now() - window, min_category).await
    }

    pub async fn count_good_fits_since(
        &self,
        since: DateTime<Utc>,
        min_category: FitCategory,
    ) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE fit_category >= ?1 AND classified_at >= ?2 AND status = ?3",
        )
        .bind(min_category.rank())
        .bind(ts_to_sql(since))
        .bind(JobStatus::Scored.rank())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    /// The good-fit postings behind [`Self::count_good_fits_since`].
    pub async fn recent_good_fits(
        &self,
        since: DateTime<Utc>,
        min_category: FitCategory,
    ) -> Result<Vec<Job>, StorageError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE fit_category >= ?1 AND classified_at >= ?2 AND status = ?3 \
             ORDER BY classified_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(min_category.rank())
            .bind(ts_to_sql(since))
            .bind(JobStatus::Scored.rank())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_job).collect()
    }

    pub async fn status_counts(&self) -> Result<BTreeMap<JobStatus, u64>, StorageError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let rank: i64 = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            let status = JobStatus::from_rank(rank)
                .ok_or_else(|| StorageError::Corrupt(format!("unknown status rank {rank}")))?;
            counts.insert(status, n.max(0) as u64);
        }
        Ok(counts)
    }

    // --- Companies ---

    pub async fn upsert_company(&self, company: &Company) -> Result<(), StorageError> {
        let updated_at = ts_to_sql(company.updated_at);
        with_conflict_retry(|| {
            sqlx::query(
                "INSERT INTO companies (key, display_name, url, overview, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(key) DO UPDATE SET \
                    display_name = excluded.display_name, \
                    url = COALESCE(excluded.url, companies.url), \
                    overview = COALESCE(NULLIF(excluded.overview, ''), companies.overview), \
                    updated_at = excluded.updated_at",
            )
            .bind(&company.key)
            .bind(&company.display_name)
            .bind(company.url.as_deref())
            .bind(company.overview.as_deref())
            .bind(&updated_at)
            .execute(&self.pool)
        })
        .await?;
        Ok(())
    }

    pub async fn find_company(&self, name: &str) -> Result<Option<Company>, StorageError> {
        let row = sqlx::query(
            "SELECT key, display_name, url, overview, updated_at FROM companies WHERE key = ?1",
        )
        .bind(normalize_company_name(name))
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            let updated_at: String = r.try_get("updated_at")?;
            Ok(Company {
                key: r.try_get("key")?,
                display_name: r.try_get("display_name")?,
                url: r.try_get("url")?,
                overview: r.try_get("overview")?,
                updated_at: ts_from_sql(&updated_at)?,
            })
        })
        .transpose()
    }

    /// Employers of still-open postings with no overview on record, skipping
    /// those whose last lookup came back empty after `stale_before`.
    pub async fn companies_missing_overview(
        &self,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query(
            "SELECT MIN(j.company_name) AS company_name FROM jobs j \
             LEFT JOIN companies c ON c.key = j.company_key \
             WHERE j.status < ?1 AND j.company_key <> '' \
               AND (c.key IS NULL OR ((c.overview IS NULL OR c.overview = '') AND c.updated_at < ?2)) \
             GROUP BY j.company_key ORDER BY MIN(j.created_at) ASC LIMIT ?3",
        )
        .bind(JobStatus::Skipped.rank())
        .bind(ts_to_sql(stale_before))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("company_name").map_err(StorageError::from))
            .collect()
    }

    // --- Filter adjustment events ---

    /// Appends an unreverted event. Fails with
    /// [`StorageError::AdjustmentOutstanding`] if one is already open.
    pub async fn append_adjustment(
        &self,
        created_at: DateTime<Utc>,
        previous: &FilterConfig,
        new: &FilterConfig,
        trigger_reason: &str,
    ) -> Result<FilterAdjustmentEvent, StorageError> {
        let previous_json = serde_json::to_string(previous)?;
        let new_json = serde_json::to_string(new)?;
        let result = sqlx::query(
            "INSERT INTO filter_adjustments (created_at, previous_config, new_config, trigger_reason, reverted) \
             VALUES (?1, ?2, ?3, ?4, 0)",
        )
        .bind(ts_to_sql(created_at))
        .bind(&previous_json)
        .bind(&new_json)
        .bind(trigger_reason)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(FilterAdjustmentEvent {
                id: done.last_insert_rowid(),
                created_at,
                previous_config: previous.clone(),
                new_config: new.clone(),
                trigger_reason: trigger_reason.to_string(),
                reverted: false,
                reverted_at: None,
            }),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StorageError::AdjustmentOutstanding)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn latest_adjustment(&self) -> Result<Option<FilterAdjustmentEvent>, StorageError> {
        let row = sqlx::query(
            "SELECT id, created_at, previous_config, new_config, trigger_reason, reverted, reverted_at \
             FROM filter_adjustments ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_adjustment(&r)).transpose()
    }

    pub async fn adjustments(&self, limit: u32) -> Result<Vec<FilterAdjustmentEvent>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, created_at, previous_config, new_config, trigger_reason, reverted, reverted_at \
             FROM filter_adjustments ORDER BY id DESC LIMIT ?1",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_adjustment).collect()
    }

    /// Marks `id` reverted, only if it is the newest event and still open.
    pub async fn mark_adjustment_reverted(&self, id: i64, at: DateTime<Utc>) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE filter_adjustments SET reverted = 1, reverted_at = ?1 \
             WHERE id = ?2 AND reverted = 0 AND id = (SELECT MAX(id) FROM filter_adjustments)",
        )
        .bind(ts_to_sql(at))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Removes an event whose config write never happened.
    pub async fn discard_adjustment(&self, id: i64) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM filter_adjustments WHERE id = ?1 AND reverted = 0")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Busy/locked contention is retried here and never reaches callers.
async fn with_conflict_retry<T, F, Fut>(mut op: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_conflict(&err) && attempt < CONFLICT_RETRIES => {
                attempt += 1;
                debug!(attempt, error = %err, "repository conflict, retrying");
                tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn is_conflict(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("5" | "6" | "261" | "262" | "517")),
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

fn row_to_job(row: &SqliteRow) -> Result<Job, StorageError> {
    let status_rank: i64 = row.try_get("status")?;
    let fit_rank: i64 = row.try_get("fit_category")?;
    let source: String = row.try_get("source")?;
    let matches: String = row.try_get("sustainability_matches")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let location_weight: Option<i64> = row.try_get("location_weight")?;
    let classifier_requests: i64 = row.try_get("classifier_requests")?;
    let sightings: i64 = row.try_get("sightings")?;

    Ok(Job {
        fingerprint: Fingerprint::from_stored(row.try_get::<String, _>("fingerprint")?),
        title: row.try_get("title")?,
        company_name: row.try_get("company_name")?,
        location: row.try_get("location")?,
        url: row.try_get("url")?,
        description: row.try_get("description")?,
        posted_at: opt_ts_from_sql(row.try_get("posted_at")?)?,
        source: source
            .parse()
            .map_err(|e| StorageError::Corrupt(format!("{e}")))?,
        status: JobStatus::from_rank(status_rank)
            .ok_or_else(|| StorageError::Corrupt(format!("unknown status rank {status_rank}")))?,
        fit_category: FitCategory::from_rank(fit_rank)
            .ok_or_else(|| StorageError::Corrupt(format!("unknown fit rank {fit_rank}")))?,
        sustainability_matches: serde_json::from_str(&matches)?,
        keyword_score: row.try_get("keyword_score")?,
        location_weight: location_weight.map(|w| w.clamp(0, i64::from(u32::MAX)) as u32),
        note: row.try_get("note")?,
        classifier_confidence: row.try_get("classifier_confidence")?,
        classifier_requests: classifier_requests.max(0) as u32,
        sightings: sightings.max(0) as u32,
        created_at: ts_from_sql(&created_at)?,
        updated_at: ts_from_sql(&updated_at)?,
        classified_at: opt_ts_from_sql(row.try_get("classified_at")?)?,
    })
}

fn row_to_adjustment(row: &SqliteRow) -> Result<FilterAdjustmentEvent, StorageError> {
    let created_at: String = row.try_get("created_at")?;
    let previous: String = row.try_get("previous_config")?;
    let new: String = row.try_get("new_config")?;
    let reverted: i64 = row.try_get("reverted")?;
    Ok(FilterAdjustmentEvent {
        id: row.try_get("id")?,
        created_at: ts_from_sql(&created_at)?,
        previous_config: serde_json::from_str(&previous)?,
        new_config: serde_json::from_str(&new)?,
        trigger_reason: row.try_get("trigger_reason")?,
        reverted: reverted != 0,
        reverted_at: opt_ts_from_sql(row.try_get("reverted_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jobsift_core::{LocationPriority, MatchField, Polarity};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).single().unwrap()
    }

    fn sample_job(hour: u32) -> Job {
        Job::discovered(
            JobSource::Apify,
            "Rust Engineer",
            "Acme",
            "Berlin",
            "https://jobs.example.com/42",
            at(hour),
        )
    }

    async fn repo() -> JobRepository {
        JobRepository::new(&SqliteStore::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn repeated_upsert_keeps_one_row_with_max_status() {
        let repo = repo().await;
        let mut first = sample_job(9);
        first.status = JobStatus::Scored;
        let second = sample_job(11).with_description(Some("Build pipelines".into()));

        assert_eq!(repo.upsert(&first).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(repo.upsert(&second).await.unwrap(), UpsertOutcome::Updated);

        let stored = repo.find_by_fingerprint(&first.fingerprint).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Scored);
        assert_eq!(stored.description.as_deref(), Some("Build pipelines"));
        assert_eq!(stored.created_at, at(9));
        assert_eq!(stored.updated_at, at(11));
        assert_eq!(stored.sightings, 2);
        let counts = repo.status_counts().await.unwrap();
        assert_eq!(counts.values().sum::<u64>(), 1);
    }

    #[tokio::test]
    async fn upsert_never_clears_known_fields() {
        let repo = repo().await;
        let described = sample_job(9).with_description(Some("Original text".into()));
        repo.upsert(&described).await.unwrap();
        repo.upsert(&sample_job(10)).await.unwrap();
        let stored = repo.find_by_fingerprint(&described.fingerprint).await.unwrap().unwrap();
        assert_eq!(stored.description.as_deref(), Some("Original text"));
    }

    #[tokio::test]
    async fn concurrent_upserts_of_one_fingerprint_produce_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("jobs.db").display());
        let store = SqliteStore::connect(&url).await.unwrap();
        let repo = JobRepository::new(&store);

        let mut handles = Vec::new();
        for hour in 0..8 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move { repo.upsert(&sample_job(hour)).await }));
        }
        let mut inserted = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() == UpsertOutcome::Inserted {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        let stored = repo.find_by_fingerprint(&sample_job(0).fingerprint).await.unwrap().unwrap();
        assert_eq!(stored.sightings, 8);
    }

    #[tokio::test]
    async fn classification_is_refused_for_excluded_jobs() {
        let repo = repo().await;
        let job = sample_job(9);
        repo.upsert(&job).await.unwrap();
        let record = ScoringRecord {
            status: JobStatus::SustainabilityExcluded,
            fit_category: Some(FitCategory::VeryPoorFit),
            sustainability_matches: vec![SustainabilityMatch {
                keyword: "oil".into(),
                polarity: Polarity::Negative,
                field: MatchField::CompanyName,
            }],
            keyword_score: None,
            location_weight: None,
            note: Some("negative sustainability keyword".into()),
        };
        assert!(repo.record_outcome(&job.fingerprint, &record, at(10)).await.unwrap());
        assert!(!repo.record_classifier_request(&job.fingerprint).await.unwrap());
        assert!(!repo
            .record_classification(&job.fingerprint, FitCategory::GoodFit, Some(0.9), at(11))
            .await
            .unwrap());

        let stored = repo.find_by_fingerprint(&job.fingerprint).await.unwrap().unwrap();
        assert_eq!(stored.fit_category, FitCategory::VeryPoorFit);
        assert_eq!(stored.classifier_requests, 0);
        assert_eq!(stored.sustainability_matches.len(), 1);
    }

    #[tokio::test]
    async fn good_fits_are_counted_inside_the_window() {
        let repo = repo().await;
        for (idx, city) in ["Berlin", "Berlin", "Lisbon"].iter().enumerate() {
            let job = Job::discovered(
                JobSource::LinkedIn,
                format!("Engineer {idx}"),
                "Acme",
                *city,
                format!("https://x.test/{idx}"),
                at(8),
            );
            repo.upsert(&job).await.unwrap();
            let fit = if idx == 2 { FitCategory::Fit } else { FitCategory::GoodFit };
            repo.record_classification(&job.fingerprint, fit, None, at(9 + idx as u32))
                .await
                .unwrap();
        }
        assert_eq!(repo.count_good_fits_since(at(0), FitCategory::GoodFit).await.unwrap(), 2);
        assert_eq!(repo.count_good_fits_since(at(10), FitCategory::GoodFit).await.unwrap(), 1);
        assert_eq!(repo.count_good_fits_since(at(0), FitCategory::Fit).await.unwrap(), 3);
        // The lower bound is inclusive.
        assert_eq!(repo.count_good_fits_since(at(9), FitCategory::GoodFit).await.unwrap(), 2);
        assert_eq!(repo.count_good_fits_since(at(11), FitCategory::GoodFit).await.unwrap(), 0);

        let scored = repo
            .query_by_status(
                JobStatus::Scored,
                &JobQuery {
                    min_fit: Some(FitCategory::GoodFit),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(scored.len(), 2);
        assert!(scored.iter().all(|j| j.location == "Berlin"));
    }

    #[tokio::test]
    async fn recent_good_fits_respect_the_rolling_window() {
        let repo = repo().await;
        let now = Utc::now();
        for (n, age_hours) in [1i64, 47, 49].iter().enumerate() {
            let job = Job::discovered(
                JobSource::Apify,
                format!("Engineer {n}"),
                "Acme",
                "Berlin",
                format!("https://x.test/w/{n}"),
                now,
            );
            repo.upsert(&job).await.unwrap();
            let classified_at = now - chrono::Duration::hours(*age_hours);
            repo.record_classification(&job.fingerprint, FitCategory::GoodFit, None, classified_at)
                .await
                .unwrap();
        }
        let window = chrono::Duration::hours(48);
        assert_eq!(repo.count_recent_good_fits(window, FitCategory::GoodFit).await.unwrap(), 2);
        assert_eq!(
            repo.count_recent_good_fits(window, FitCategory::VeryGoodFit).await.unwrap(),
            0
        );
        assert_eq!(
            repo.count_recent_good_fits(chrono::Duration::hours(2), FitCategory::GoodFit)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn pending_scoring_puts_new_postings_before_retries() {
        let repo = repo().await;
        let fresh = sample_job(9);
        let mut retry = Job::discovered(JobSource::Apify, "Retry", "Beta", "Remote", "https://x.test/r", at(8));
        retry.status = JobStatus::Scored;
        let mut done = Job::discovered(JobSource::Apify, "Done", "Gamma", "Remote", "https://x.test/d", at(7));
        done.status = JobStatus::Skipped;
        for job in [&fresh, &retry, &done] {
            repo.upsert(job).await.unwrap();
        }
        let pending = repo.pending_scoring(10, true).await.unwrap();
        let titles: Vec<_> = pending.iter().map(|j| j.title.as_str()).collect();
        assert_eq!(titles, vec!["Rust Engineer", "Retry"]);

        let pending = repo.pending_scoring(10, false).await.unwrap();
        let titles: Vec<_> = pending.iter().map(|j| j.title.as_str()).collect();
        assert_eq!(titles, vec!["Rust Engineer"]);
    }

    #[tokio::test]
    async fn old_unscored_retries_do_not_starve_new_postings() {
        let repo = repo().await;
        for n in 0..2 {
            let mut old = Job::discovered(
                JobSource::Apify,
                format!("Old {n}"),
                "Beta",
                "Remote",
                format!("https://x.test/old/{n}"),
                at(1 + n),
            );
            old.status = JobStatus::Scored;
            repo.upsert(&old).await.unwrap();
        }
        let fresh = Job::discovered(JobSource::Apify, "Fresh oil job", "Acme Oil Corp", "Houston", "https://x.test/new", at(12));
        repo.upsert(&fresh).await.unwrap();

        let pending = repo.pending_scoring(2, true).await.unwrap();
        let titles: Vec<_> = pending.iter().map(|j| j.title.as_str()).collect();
        assert_eq!(titles, vec!["Fresh oil job", "Old 0"]);
    }

    #[tokio::test]
    async fn late_descriptions_do_not_count_as_sightings() {
        let repo = repo().await;
        let job = sample_job(9);
        repo.upsert(&job).await.unwrap();

        assert!(repo.set_description(&job.fingerprint, " Own the ingest tier. ", at(10)).await.unwrap());
        assert!(!repo.set_description(&job.fingerprint, "   ", at(11)).await.unwrap());

        let stored = repo.find_by_fingerprint(&job.fingerprint).await.unwrap().unwrap();
        assert_eq!(stored.description.as_deref(), Some("Own the ingest tier."));
        assert_eq!(stored.sightings, 1);
        assert_eq!(stored.updated_at, at(10));
    }

    #[tokio::test]
    async fn companies_merge_overview_and_report_missing() {
        let repo = repo().await;
        repo.upsert(&sample_job(9)).await.unwrap();
        assert_eq!(
            repo.companies_missing_overview(at(12), 10).await.unwrap(),
            vec!["Acme".to_string()]
        );

        let mut company = Company::new("ACME", at(10));
        company.overview = Some("Builds wind turbines".into());
        repo.upsert_company(&company).await.unwrap();
        let mut refresh = Company::new("Acme", at(11));
        refresh.overview = Some(String::new());
        repo.upsert_company(&refresh).await.unwrap();

        let stored = repo.find_company("acme").await.unwrap().unwrap();
        assert_eq!(stored.overview.as_deref(), Some("Builds wind turbines"));
        assert_eq!(stored.display_name, "Acme");
        assert!(repo.companies_missing_overview(at(12), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn only_one_unreverted_adjustment_can_exist() {
        let repo = repo().await;
        let before = FilterConfig::default();
        let after = FilterConfig {
            location_priorities: vec![LocationPriority::new("Berlin", 1)],
            ..Default::default()
        };
        let first = repo.append_adjustment(at(9), &before, &after, "3 good fits").await.unwrap();
        let second = repo.append_adjustment(at(10), &after, &after, "again").await;
        assert!(matches!(second, Err(StorageError::AdjustmentOutstanding)));
        assert!(!repo.latest_adjustment().await.unwrap().unwrap().reverted);

        assert!(repo.mark_adjustment_reverted(first.id, at(11)).await.unwrap());
        assert!(!repo.mark_adjustment_reverted(first.id, at(12)).await.unwrap());
        let latest = repo.latest_adjustment().await.unwrap().unwrap();
        assert!(latest.reverted);
        assert_eq!(latest.previous_config, before);

        let third = repo.append_adjustment(at(13), &before, &after, "next").await.unwrap();
        assert!(!repo.mark_adjustment_reverted(first.id, at(14)).await.unwrap());
        repo.discard_adjustment(third.id).await.unwrap();
        assert_eq!(repo.adjustments(10).await.unwrap().len(), 1);
    }
}
