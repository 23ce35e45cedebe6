//! The jobsift ingestion cycle: preferences, scoring, classification, the
//! filter controller and the scheduler that drives them.

pub mod classifier;
pub mod config;
pub mod controller;
pub mod error;
pub mod pipeline;
pub mod preferences;
pub mod report;
pub mod scoring;

pub use classifier::{Classification, ClassificationError, ClassificationRequest, Classifier, HttpClassifier};
pub use config::SyncConfig;
pub use controller::{AdjustmentDecision, ControllerState, FilterController, IncrementPerOccurrence, LocationBiasPolicy};
pub use error::SyncError;
pub use pipeline::{build_scheduler, run_sync_once_from_env, CancellationFlag, PipelineOrchestrator};
pub use preferences::{AutoAdjustmentSettings, PreferencesDocument, PreferencesStore};
pub use report::{daily_brief, write_reports, CycleSummary, SourceSummary};
pub use scoring::{ScoringEngine, ScoringOutcome};

pub const CRATE_NAME: &str = "jobsift-sync";
