//! Monthly quota accounting for metered provider calls.
//!
//! Counters are kept per call type in cost units. A call is reserved before
//! dispatch, then either committed (success) or released (failure), so a
//! failed call never consumes quota and admitted work never exceeds the cap.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use jobsift_core::ParseEnumError;
use serde::Serialize;
use sqlx::Row;
use tracing::{info, warn};

use crate::db::ts_to_sql;
use crate::{SqliteStore, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    ListingSearch,
    JobDetails,
    CompanyOverview,
    DatasetPage,
    Classification,
}

impl CallType {
    pub const ALL: [CallType; 5] = [
        Self::ListingSearch,
        Self::JobDetails,
        Self::CompanyOverview,
        Self::DatasetPage,
        Self::Classification,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ListingSearch => "listing_search",
            Self::JobDetails => "job_details",
            Self::CompanyOverview => "company_overview",
            Self::DatasetPage => "dataset_page",
            Self::Classification => "classification",
        }
    }

    /// Reading the dataset of a finished actor run is free; starting a run is not.
    pub fn default_cost(self) -> u64 {
        match self {
            Self::DatasetPage => 0,
            _ => 1,
        }
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "call type",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// `None` disables metering entirely.
    pub monthly_cap: Option<u64>,
    pub costs: BTreeMap<CallType, u64>,
}

impl LedgerConfig {
    pub fn with_cap(monthly_cap: u64) -> Self {
        Self {
            monthly_cap: Some(monthly_cap),
            ..Self::unmetered()
        }
    }

    pub fn unmetered() -> Self {
        Self {
            monthly_cap: None,
            costs: CallType::ALL.into_iter().map(|c| (c, c.default_cost())).collect(),
        }
    }

    pub fn cost(&self, call_type: CallType) -> u64 {
        self.costs
            .get(&call_type)
            .copied()
            .unwrap_or_else(|| call_type.default_cost())
    }
}

/// Outcome of [`UsageLedger::try_reserve`]. `remaining` is in cost units
/// after this reservation (or before it, when refused).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub call_type: CallType,
    pub granted: bool,
    pub remaining: Option<u64>,
}

/// Persisted state of one period.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeriodUsage {
    pub used: BTreeMap<CallType, u64>,
    pub exhausted: bool,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn load_period(&self, period: &str) -> Result<PeriodUsage, StorageError>;
    async fn save_used(&self, period: &str, call_type: CallType, used: u64) -> Result<(), StorageError>;
    async fn save_exhausted(&self, period: &str, exhausted: bool) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    periods: Mutex<BTreeMap<String, PeriodUsage>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn load_period(&self, period: &str) -> Result<PeriodUsage, StorageError> {
        Ok(lock(&self.periods).get(period).cloned().unwrap_or_default())
    }

    async fn save_used(&self, period: &str, call_type: CallType, used: u64) -> Result<(), StorageError> {
        lock(&self.periods)
            .entry(period.to_string())
            .or_default()
            .used
            .insert(call_type, used);
        Ok(())
    }

    async fn save_exhausted(&self, period: &str, exhausted: bool) -> Result<(), StorageError> {
        lock(&self.periods)
            .entry(period.to_string())
            .or_default()
            .exhausted = exhausted;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn load_period(&self, period: &str) -> Result<PeriodUsage, StorageError> {
        let mut usage = PeriodUsage::default();
        let rows = sqlx::query("SELECT call_type, used FROM usage_ledger WHERE period = ?1")
            .bind(period)
            .fetch_all(self.pool())
            .await?;
        for row in rows {
            let raw: String = row.try_get("call_type")?;
            let used: i64 = row.try_get("used")?;
            let call_type = raw
                .parse()
                .map_err(|e| StorageError::Corrupt(format!("{e}")))?;
            usage.used.insert(call_type, used.max(0) as u64);
        }
        let exhausted: Option<i64> =
            sqlx::query_scalar("SELECT exhausted FROM usage_periods WHERE period = ?1")
                .bind(period)
                .fetch_optional(self.pool())
                .await?;
        usage.exhausted = exhausted.unwrap_or(0) != 0;
        Ok(usage)
    }

    async fn save_used(&self, period: &str, call_type: CallType, used: u64) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO usage_ledger (period, call_type, used, updated_at) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(period, call_type) DO UPDATE SET used = excluded.used, updated_at = excluded.updated_at",
        )
        .bind(period)
        .bind(call_type.as_str())
        .bind(i64::try_from(used).unwrap_or(i64::MAX))
        .bind(ts_to_sql(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn save_exhausted(&self, period: &str, exhausted: bool) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO usage_periods (period, exhausted, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(period) DO UPDATE SET exhausted = excluded.exhausted, updated_at = excluded.updated_at",
        )
        .bind(period)
        .bind(i64::from(exhausted))
        .bind(ts_to_sql(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

/// Point-in-time view of the ledger for reports and the `usage` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerSnapshot {
    pub period: String,
    pub monthly_cap: Option<u64>,
    pub used_units: u64,
    pub reserved_units: u64,
    pub remaining: Option<u64>,
    pub exhausted: bool,
    pub calls: BTreeMap<CallType, u64>,
}

#[derive(Debug, Default)]
struct LedgerState {
    period: String,
    used: BTreeMap<CallType, u64>,
    reserved: BTreeMap<CallType, u64>,
    exhausted: bool,
}

pub struct UsageLedger {
    config: LedgerConfig,
    store: Arc<dyn LedgerStore>,
    state: Mutex<LedgerState>,
}

impl fmt::Debug for UsageLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsageLedger")
            .field("config", &self.config)
            .field("state", &*lock(&self.state))
            .finish()
    }
}

pub fn period_key(at: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", at.year(), at.month())
}

impl UsageLedger {
    /// Loads the counters of the current UTC month from `store`.
    pub async fn open(config: LedgerConfig, store: Arc<dyn LedgerStore>) -> Result<Self, StorageError> {
        Self::open_at(config, store, Utc::now()).await
    }

    pub async fn open_at(
        config: LedgerConfig,
        store: Arc<dyn LedgerStore>,
        now: DateTime<Utc>,
    ) -> Result<Self, StorageError> {
        let period = period_key(now);
        let loaded = store.load_period(&period).await?;
        info!(%period, cap = ?config.monthly_cap, exhausted = loaded.exhausted, "usage ledger opened");
        Ok(Self {
            config,
            store,
            state: Mutex::new(LedgerState {
                period,
                used: loaded.used,
                reserved: BTreeMap::new(),
                exhausted: loaded.exhausted,
            }),
        })
    }

    /// Ledger for providers without a quota; counts calls, refuses nothing.
    pub fn unmetered() -> Self {
        Self {
            config: LedgerConfig::unmetered(),
            store: Arc::new(MemoryLedgerStore::new()),
            state: Mutex::new(LedgerState {
                period: period_key(Utc::now()),
                ..Default::default()
            }),
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn try_reserve(&self, call_type: CallType) -> Reservation {
        let cost = self.config.cost(call_type);
        let mut state = lock(&self.state);
        let remaining = self.remaining(&state);

        let granted = if state.exhausted {
            false
        } else {
            match remaining {
                None => true,
                Some(left) => cost <= left,
            }
        };

        if granted {
            *state.reserved.entry(call_type).or_default() += 1;
        }
        Reservation {
            call_type,
            granted,
            remaining: if granted {
                remaining.map(|left| left - cost)
            } else {
                remaining
            },
        }
    }

    /// Converts one outstanding reservation into usage and persists the
    /// counter. Without an outstanding reservation nothing is counted.
    pub async fn commit(&self, call_type: CallType) -> Result<(), StorageError> {
        let (period, used) = {
            let mut state = lock(&self.state);
            match state.reserved.get_mut(&call_type) {
                Some(reserved) if *reserved > 0 => *reserved -= 1,
                _ => {
                    warn!(%call_type, "commit without an outstanding reservation ignored");
                    return Ok(());
                }
            }
            let used = state.used.entry(call_type).or_default();
            *used += 1;
            let used = *used;
            (state.period.clone(), used)
        };
        self.store.save_used(&period, call_type, used).await
    }

    pub fn release(&self, call_type: CallType) {
        let mut state = lock(&self.state);
        if let Some(reserved) = state.reserved.get_mut(&call_type) {
            *reserved = reserved.saturating_sub(1);
        }
    }

    /// Provider-reported hard limit: refuse everything until the period rolls.
    pub async fn mark_exhausted(&self) -> Result<(), StorageError> {
        let period = {
            let mut state = lock(&self.state);
            if state.exhausted {
                return Ok(());
            }
            state.exhausted = true;
            state.period.clone()
        };
        warn!(%period, "provider reported monthly hard limit, period marked exhausted");
        self.store.save_exhausted(&period, true).await
    }

    pub fn is_cap_reached(&self) -> bool {
        let state = lock(&self.state);
        state.exhausted || self.remaining(&state) == Some(0)
    }

    pub fn reset_if_new_period(&self) -> bool {
        self.reset_if_new_period_at(Utc::now())
    }

    /// Starts a fresh period when `now` falls in a later month. Outstanding
    /// reservations carry over so their later commit or release stays balanced.
    pub fn reset_if_new_period_at(&self, now: DateTime<Utc>) -> bool {
        let period = period_key(now);
        let mut state = lock(&self.state);
        if period <= state.period {
            return false;
        }
        info!(from = %state.period, to = %period, "usage period rolled over");
        state.period = period;
        state.used.clear();
        state.exhausted = false;
        true
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = lock(&self.state);
        LedgerSnapshot {
            period: state.period.clone(),
            monthly_cap: self.config.monthly_cap,
            used_units: self.units(&state.used),
            reserved_units: self.units(&state.reserved),
            remaining: self.remaining(&state),
            exhausted: state.exhausted,
            calls: state.used.clone(),
        }
    }

    fn units(&self, counts: &BTreeMap<CallType, u64>) -> u64 {
        counts
            .iter()
            .map(|(call_type, n)| n.saturating_mul(self.config.cost(*call_type)))
            .sum()
    }

    fn remaining(&self, state: &LedgerState) -> Option<u64> {
        let cap = self.config.monthly_cap?;
        let spent = self.units(&state.used) + self.units(&state.reserved);
        Some(cap.saturating_sub(spent))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
