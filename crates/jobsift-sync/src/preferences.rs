//! The `job_preferences.yaml` document: live filters, adjustment settings,
//! saved searches and the enabled sources.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use jobsift_adapters::SearchParams;
use jobsift_core::{ConfigValidationError, FilterConfig, FitCategory};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoAdjustmentSettings {
    /// Evidence window for counting recent good fits.
    #[serde(default = "default_window_days")]
    pub window_days: u32,
    /// Weight added to a location per good fit seen there.
    #[serde(default = "default_location_step")]
    pub location_step: u32,
    #[serde(default = "default_max_new_locations")]
    pub max_new_locations: usize,
    /// Lowest category that counts as a good fit.
    #[serde(default = "default_min_fit")]
    pub min_fit: FitCategory,
}

fn default_window_days() -> u32 {
    7
}

fn default_location_step() -> u32 {
    1
}

fn default_max_new_locations() -> usize {
    5
}

fn default_min_fit() -> FitCategory {
    FitCategory::GoodFit
}

impl Default for AutoAdjustmentSettings {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
            location_step: default_location_step(),
            max_new_locations: default_max_new_locations(),
            min_fit: default_min_fit(),
        }
    }
}

fn default_sources() -> Vec<String> {
    vec!["apify".to_string()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferencesDocument {
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub auto_adjustment: AutoAdjustmentSettings,
    #[serde(default)]
    pub search_parameters: Vec<SearchParams>,
    #[serde(default = "default_sources")]
    pub sources: Vec<String>,
    #[serde(default)]
    pub user_profile: String,
    /// Keys this crate does not interpret survive a rewrite.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl Default for PreferencesDocument {
    fn default() -> Self {
        Self {
            filters: FilterConfig::default(),
            auto_adjustment: AutoAdjustmentSettings::default(),
            search_parameters: Vec::new(),
            sources: default_sources(),
            user_profile: String::new(),
            extra: BTreeMap::new(),
        }
    }
}

impl PreferencesDocument {
    pub fn parse(yaml: &str) -> Result<Self, ConfigValidationError> {
        let doc: Self =
            serde_yaml::from_str(yaml).map_err(|e| ConfigValidationError::Malformed(e.to_string()))?;
        doc.validate()?;
        Ok(doc)
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        self.filters.validate()?;
        if self.search_parameters.iter().any(|p| p.keywords.trim().is_empty()) {
            return Err(ConfigValidationError::BlankKeyword {
                list: "search_parameters.keywords",
            });
        }
        Ok(())
    }
}

/// File-backed preferences. Writes go to a sibling temp file that is then
/// renamed over the original.
#[derive(Debug, Clone)]
pub struct PreferencesStore {
    path: PathBuf,
}

impl PreferencesStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<PreferencesDocument, SyncError> {
        let text = fs::read_to_string(&self.path)
            .await
            .map_err(|source| SyncError::PreferencesIo {
                path: self.path.clone(),
                source,
            })?;
        PreferencesDocument::parse(&text).map_err(|source| SyncError::InvalidPreferences {
            path: self.path.clone(),
            source,
        })
    }

    pub async fn save(&self, doc: &PreferencesDocument) -> Result<(), SyncError> {
        doc.validate().map_err(|source| SyncError::InvalidPreferences {
            path: self.path.clone(),
            source,
        })?;
        let yaml = serde_yaml::to_string(doc)?;
        let tmp = self.temp_path();
        let io_err = |source| SyncError::PreferencesIo {
            path: self.path.clone(),
            source,
        };
        fs::write(&tmp, yaml).await.map_err(io_err)?;
        fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        debug!(path = %self.path.display(), "preferences written");
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "job_preferences.yaml".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobsift_core::LocationPriority;

    const SAMPLE: &str = r#"
filters:
  positive_keywords:
    - { keyword: rust, weight: 3 }
    - { keyword: kubernetes }
  sustainability:
    negative: [oil, coal]
    use_company_overview: true
  location_priorities:
    - { location: Berlin, weight: 2 }
  title_skip_keywords: [php]
  good_fit_threshold: 3
  auto_adjustment_enabled: true
auto_adjustment:
  window_days: 14
search_parameters:
  - keywords: rust engineer
    location: Berlin
    date_posted: week
sources: [fixture]
user_profile: Backend engineer, eight years of Rust and Go.
dashboard:
  theme: dark
"#;

    #[test]
    fn sample_document_parses_with_defaults() {
        let doc = PreferencesDocument::parse(SAMPLE).unwrap();
        assert_eq!(doc.filters.positive_keywords[1].weight, 1);
        assert_eq!(doc.filters.good_fit_threshold, 3);
        assert_eq!(doc.auto_adjustment.window_days, 14);
        assert_eq!(doc.auto_adjustment.max_new_locations, 5);
        assert_eq!(doc.search_parameters[0].limit, 100);
        assert_eq!(doc.sources, vec!["fixture"]);
        assert!(doc.extra.contains_key("dashboard"));
    }

    #[test]
    fn malformed_and_invalid_documents_are_rejected() {
        assert!(matches!(
            PreferencesDocument::parse("filters: [not, a, map]"),
            Err(ConfigValidationError::Malformed(_))
        ));
        let blank = SAMPLE.replace("[php]", "[\"  \"]");
        assert_eq!(
            PreferencesDocument::parse(&blank),
            Err(ConfigValidationError::BlankKeyword {
                list: "title_skip_keywords"
            })
        );
    }

    #[tokio::test]
    async fn save_round_trips_and_keeps_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = PreferencesStore::new(dir.path().join("job_preferences.yaml"));
        let mut doc = PreferencesDocument::parse(SAMPLE).unwrap();
        doc.filters
            .location_priorities
            .push(LocationPriority::new("Hamburg", 1));

        store.save(&doc).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, doc);
        assert!(!dir.path().join("job_preferences.yaml.tmp").exists());
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = PreferencesStore::new(dir.path().join("absent.yaml"));
        assert!(matches!(store.load().await, Err(SyncError::PreferencesIo { .. })));
    }
}
