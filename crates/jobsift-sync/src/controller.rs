//! Closed-loop filter adjustment. Enough recent good fits bias the
//! location priorities toward where those fits were found; each change is
//! recorded as a revertible event before the preferences file is rewritten.

use chrono::{DateTime, Duration, Utc};
use jobsift_core::{FilterAdjustmentEvent, FilterConfig, Job, LocationPriority};
use jobsift_storage::{JobRepository, StorageError};
use serde::Serialize;
use tracing::{info, warn};

use crate::preferences::{PreferencesDocument, PreferencesStore};
use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Stable,
    PendingAdjustment,
    Adjusted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AdjustmentDecision {
    Disabled,
    BelowThreshold { good_fits: u64, threshold: u32 },
    /// Threshold reached while an earlier adjustment is still unreverted.
    Suppressed { good_fits: u64, outstanding_id: i64 },
    /// Evidence reached the threshold but the policy proposed no change.
    NoChange { good_fits: u64 },
    Adjusted { event: FilterAdjustmentEvent },
}

/// Turns good-fit evidence into new location priorities.
pub trait LocationBiasPolicy: Send + Sync {
    fn propose(&self, current: &[LocationPriority], evidence: &[Job]) -> Vec<LocationPriority>;
}

/// Adds `step` weight per good fit to each matching location. Unmatched
/// locations are appended (at most `max_new` per adjustment); nothing is
/// removed.
#[derive(Debug, Clone, Copy)]
pub struct IncrementPerOccurrence {
    pub step: u32,
    pub max_new: usize,
}

impl Default for IncrementPerOccurrence {
    fn default() -> Self {
        Self { step: 1, max_new: 5 }
    }
}

impl LocationBiasPolicy for IncrementPerOccurrence {
    fn propose(&self, current: &[LocationPriority], evidence: &[Job]) -> Vec<LocationPriority> {
        let mut next = current.to_vec();
        let mut added = 0usize;
        for job in evidence {
            let location = job.location.trim();
            if location.is_empty() {
                continue;
            }
            let haystack = location.to_lowercase();
            let matched = next
                .iter_mut()
                .filter(|p| haystack.contains(&p.location.trim().to_lowercase()))
                .max_by_key(|p| p.weight);
            match matched {
                Some(priority) => priority.weight = priority.weight.saturating_add(self.step),
                None if added < self.max_new => {
                    next.push(LocationPriority::new(location, self.step));
                    added += 1;
                }
                None => {}
            }
        }
        next
    }
}

pub struct FilterController {
    repo: JobRepository,
    preferences: PreferencesStore,
    policy: Box<dyn LocationBiasPolicy>,
}

impl FilterController {
    pub fn new(repo: JobRepository, preferences: PreferencesStore, policy: Box<dyn LocationBiasPolicy>) -> Self {
        Self {
            repo,
            preferences,
            policy,
        }
    }

    /// Controller using [`IncrementPerOccurrence`] with the document's
    /// `auto_adjustment` step and cap.
    pub fn for_document(repo: JobRepository, preferences: PreferencesStore, doc: &PreferencesDocument) -> Self {
        let policy = IncrementPerOccurrence {
            step: doc.auto_adjustment.location_step.max(1),
            max_new: doc.auto_adjustment.max_new_locations,
        };
        Self::new(repo, preferences, Box::new(policy))
    }

    pub async fn evaluate(&self, doc: &mut PreferencesDocument) -> Result<AdjustmentDecision, SyncError> {
        self.evaluate_at(doc, Utc::now()).await
    }

    /// Runs one controller step against `doc`, which is updated in place when
    /// an adjustment is applied.
    pub async fn evaluate_at(
        &self,
        doc: &mut PreferencesDocument,
        now: DateTime<Utc>,
    ) -> Result<AdjustmentDecision, SyncError> {
        if !doc.filters.auto_adjustment_enabled {
            return Ok(AdjustmentDecision::Disabled);
        }
        let threshold = doc.filters.good_fit_threshold;
        let latest = self.repo.latest_adjustment().await?;

        let window_start = now - Duration::days(i64::from(doc.auto_adjustment.window_days));
        let since = match &latest {
            Some(event) if event.created_at > window_start => event.created_at,
            _ => window_start,
        };
        let good_fits = self
            .repo
            .count_good_fits_since(since, doc.auto_adjustment.min_fit)
            .await?;

        if good_fits < u64::from(threshold) {
            return Ok(AdjustmentDecision::BelowThreshold { good_fits, threshold });
        }
        if let Some(open) = latest.as_ref().filter(|e| !e.reverted) {
            warn!(
                good_fits,
                threshold,
                outstanding_id = open.id,
                "good-fit threshold reached while an adjustment is outstanding, ignoring"
            );
            return Ok(AdjustmentDecision::Suppressed {
                good_fits,
                outstanding_id: open.id,
            });
        }

        info!(good_fits, threshold, state = ?ControllerState::PendingAdjustment, "filter adjustment pending");
        let evidence = self
            .repo
            .recent_good_fits(since, doc.auto_adjustment.min_fit)
            .await?;
        let previous = doc.filters.clone();
        let proposed = FilterConfig {
            location_priorities: self.policy.propose(&previous.location_priorities, &evidence),
            ..previous.clone()
        };
        if proposed == previous {
            return Ok(AdjustmentDecision::NoChange { good_fits });
        }

        let reason = format!(
            "{good_fits} good fits since {} reached threshold {threshold}",
            since.format("%Y-%m-%d %H:%M UTC")
        );
        let event = match self.repo.append_adjustment(now, &previous, &proposed, &reason).await {
            Ok(event) => event,
            Err(StorageError::AdjustmentOutstanding) => {
                let outstanding_id = self.repo.latest_adjustment().await?.map(|e| e.id).unwrap_or_default();
                warn!(outstanding_id, "another adjustment was recorded concurrently");
                return Ok(AdjustmentDecision::Suppressed {
                    good_fits,
                    outstanding_id,
                });
            }
            Err(err) => return Err(err.into()),
        };

        doc.filters = proposed;
        if let Err(err) = self.preferences.save(doc).await {
            doc.filters = previous;
            self.repo.discard_adjustment(event.id).await?;
            return Err(err);
        }
        info!(event_id = event.id, %reason, state = ?ControllerState::Adjusted, "filter configuration adjusted");
        Ok(AdjustmentDecision::Adjusted { event })
    }

    pub async fn revert_last(&self) -> Result<Option<FilterAdjustmentEvent>, SyncError> {
        self.revert_last_at(Utc::now()).await
    }

    /// Restores the configuration captured by the newest unreverted event.
    /// Returns `None` when there is nothing to revert.
    pub async fn revert_last_at(&self, now: DateTime<Utc>) -> Result<Option<FilterAdjustmentEvent>, SyncError> {
        let Some(event) = self.repo.latest_adjustment().await?.filter(|e| !e.reverted) else {
            return Ok(None);
        };

        let mut doc = self.preferences.load().await?;
        if doc.filters != event.new_config {
            warn!(event_id = event.id, "filters changed since the adjustment; restoring the snapshot anyway");
        }
        doc.filters = event.previous_config.clone();
        self.preferences.save(&doc).await?;

        if !self.repo.mark_adjustment_reverted(event.id, now).await? {
            warn!(event_id = event.id, "adjustment was already reverted");
        }
        info!(event_id = event.id, state = ?ControllerState::Stable, "filter adjustment reverted");
        Ok(Some(FilterAdjustmentEvent {
            reverted: true,
            reverted_at: Some(now),
            ..event
        }))
    }
}
