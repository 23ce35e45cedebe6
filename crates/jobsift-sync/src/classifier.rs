//! Seam to the external fit classifier. The model itself lives behind an
//! HTTP endpoint; this crate only sends the scored posting and reads back a
//! category with a confidence.

use async_trait::async_trait;
use jobsift_core::{FitCategory, Job, SustainabilityMatch};
use jobsift_storage::{CallType, HttpFetcher, Priority, QueueError, RequestQueue, SubmitMode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scoring::ScoringOutcome;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationRequest {
    pub title: String,
    pub company_name: String,
    pub location: String,
    pub description: Option<String>,
    pub sustainability_matches: Vec<SustainabilityMatch>,
    pub weighted_keyword_score: i64,
    pub user_profile: String,
}

impl ClassificationRequest {
    pub fn new(job: &Job, outcome: &ScoringOutcome, user_profile: &str) -> Self {
        Self {
            title: job.title.clone(),
            company_name: job.company_name.clone(),
            location: job.location.clone(),
            description: job.description.clone(),
            sustainability_matches: outcome.matches.clone(),
            weighted_keyword_score: outcome.keyword_score,
            user_profile: user_profile.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Classification {
    pub fit_category: FitCategory,
    pub confidence: f64,
}

#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error(transparent)]
    Transport(#[from] QueueError),
    #[error("classifier answered with unknown category {0:?}")]
    UnknownCategory(String),
    #[error("classifier unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, request: &ClassificationRequest) -> Result<Classification, ClassificationError>;
}

#[derive(Debug, Deserialize)]
struct ClassifierResponse {
    #[serde(alias = "fit", alias = "category")]
    fit_category: String,
    #[serde(default)]
    confidence: Option<f64>,
}

impl ClassifierResponse {
    fn into_classification(self) -> Result<Classification, ClassificationError> {
        let fit_category = FitCategory::from_label(&self.fit_category)
            .filter(|c| *c != FitCategory::Unscored)
            .ok_or_else(|| ClassificationError::UnknownCategory(self.fit_category.clone()))?;
        Ok(Classification {
            fit_category,
            confidence: self.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
        })
    }
}

/// POSTs the request as JSON and expects `{"fit_category": .., "confidence": ..}`.
#[derive(Debug, Clone)]
pub struct HttpClassifier {
    endpoint: String,
    bearer: Option<String>,
    http: HttpFetcher,
    queue: RequestQueue,
}

impl HttpClassifier {
    pub fn new(endpoint: impl Into<String>, http: HttpFetcher, queue: RequestQueue) -> Self {
        Self {
            endpoint: endpoint.into(),
            bearer: None,
            http,
            queue,
        }
    }

    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, request: &ClassificationRequest) -> Result<Classification, ClassificationError> {
        let bearer = self.bearer.as_deref();
        let response: ClassifierResponse = self
            .queue
            .submit(CallType::Classification, Priority::Normal, SubmitMode::NonBlocking, || {
                self.http.post_json(&self.endpoint, bearer, request)
            })
            .await?;
        response.into_classification()
    }
}
