use std::path::PathBuf;
use std::time::Duration;

/// Runtime settings read from the environment. Domain preferences live in
/// the YAML document at `preferences_path`.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub preferences_path: PathBuf,
    pub reports_dir: PathBuf,
    pub apify_token: Option<String>,
    /// `None` disables local quota accounting.
    pub monthly_cap: Option<u64>,
    pub max_concurrent: usize,
    pub min_request_delay: Duration,
    pub max_retries: usize,
    pub max_batch_size: usize,
    pub classifier_url: Option<String>,
    pub sync_cron: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    /// Days before an empty company lookup is retried.
    pub company_refresh_days: i64,
    /// Replay this bundle instead of contacting providers.
    pub fixture_bundle: Option<PathBuf>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let parsed = |key: &str, default: u64| get(key).and_then(|v| v.parse::<u64>().ok()).unwrap_or(default);

        let monthly_cap = match get("JOBSIFT_MONTHLY_CAP").as_deref() {
            Some("none") | Some("unlimited") => None,
            Some(raw) => Some(raw.parse().unwrap_or(DEFAULT_MONTHLY_CAP)),
            None => Some(DEFAULT_MONTHLY_CAP),
        };

        Self {
            database_url: get("JOBSIFT_DATABASE_URL").unwrap_or_else(|| "sqlite://jobsift.db".to_string()),
            preferences_path: get("JOBSIFT_PREFERENCES")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("job_preferences.yaml")),
            reports_dir: get("JOBSIFT_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            apify_token: get("APIFY_API_TOKEN"),
            monthly_cap,
            max_concurrent: parsed("JOBSIFT_MAX_CONCURRENT", 2) as usize,
            min_request_delay: Duration::from_millis(parsed("JOBSIFT_MIN_REQUEST_DELAY_MS", 1000)),
            max_retries: parsed("JOBSIFT_MAX_RETRIES", 3) as usize,
            max_batch_size: parsed("JOBSIFT_MAX_BATCH_SIZE", 100) as usize,
            classifier_url: get("JOBSIFT_CLASSIFIER_URL"),
            sync_cron: get("JOBSIFT_SYNC_CRON").unwrap_or_else(|| "0 0 7,19 * * *".to_string()),
            http_timeout_secs: parsed("JOBSIFT_HTTP_TIMEOUT_SECS", 90),
            user_agent: get("JOBSIFT_USER_AGENT").unwrap_or_else(|| "jobsift/0.1".to_string()),
            company_refresh_days: parsed("JOBSIFT_COMPANY_REFRESH_DAYS", 30) as i64,
            fixture_bundle: get("JOBSIFT_FIXTURE_BUNDLE").map(PathBuf::from),
        }
    }
}

const DEFAULT_MONTHLY_CAP: u64 = 500;
