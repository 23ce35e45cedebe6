//! Durable state and metered-call plumbing for jobsift: the SQLite store,
//! the job repository, the usage ledger and the request queue.

mod db;
mod error;
pub mod http;
pub mod ledger;
pub mod queue;
pub mod repository;

pub use db::SqliteStore;
pub use error::StorageError;
pub use http::{
    classify_reqwest_error, classify_status, failure_for_error, failure_for_status, parse_retry_after,
    HttpClientConfig, HttpFetcher, HARD_LIMIT_MARKER,
};
pub use ledger::{
    period_key, CallType, LedgerConfig, LedgerSnapshot, LedgerStore, MemoryLedgerStore, PeriodUsage,
    Reservation, UsageLedger,
};
pub use queue::{
    BackoffPolicy, Priority, QueueConfig, QueueError, RequestQueue, RetryDisposition, SubmitMode,
    TaskFailure,
};
pub use repository::{JobQuery, JobRepository, ScoringRecord, UpsertOutcome};

pub const CRATE_NAME: &str = "jobsift-storage";
