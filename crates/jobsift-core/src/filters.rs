use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedKeyword {
    pub keyword: String,
    #[serde(default = "default_weight")]
    pub weight: i32,
}

fn default_weight() -> i32 {
    1
}

impl WeightedKeyword {
    pub fn new(keyword: impl Into<String>, weight: i32) -> Self {
        Self {
            keyword: keyword.into(),
            weight,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SustainabilityKeywords {
    #[serde(default)]
    pub positive: Vec<String>,
    #[serde(default)]
    pub negative: Vec<String>,
    /// Also search the employer's overview text, when one is known.
    #[serde(default)]
    pub use_company_overview: bool,
}

/// Preferred location with its weight; higher weights sort first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationPriority {
    pub location: String,
    pub weight: u32,
}

impl LocationPriority {
    pub fn new(location: impl Into<String>, weight: u32) -> Self {
        Self {
            location: location.into(),
            weight,
        }
    }
}

/// Live filtering criteria. Only the filter controller writes it back to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub positive_keywords: Vec<WeightedKeyword>,
    #[serde(default)]
    pub negative_keywords: Vec<WeightedKeyword>,
    #[serde(default)]
    pub sustainability: SustainabilityKeywords,
    #[serde(default)]
    pub location_priorities: Vec<LocationPriority>,
    /// Substrings of the lowercased title.
    #[serde(default)]
    pub title_skip_keywords: Vec<String>,
    /// Whole title words, for short terms like "go" or "net" that would
    /// match inside other words.
    #[serde(default)]
    pub title_skip_words: Vec<String>,
    #[serde(default)]
    pub location_skip_keywords: Vec<String>,
    /// Matched against the normalized company name.
    #[serde(default)]
    pub company_skip_keywords: Vec<String>,
    #[serde(default = "default_good_fit_threshold")]
    pub good_fit_threshold: u32,
    #[serde(default)]
    pub auto_adjustment_enabled: bool,
}

fn default_good_fit_threshold() -> u32 {
    5
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            positive_keywords: Vec::new(),
            negative_keywords: Vec::new(),
            sustainability: SustainabilityKeywords::default(),
            location_priorities: Vec::new(),
            title_skip_keywords: Vec::new(),
            title_skip_words: Vec::new(),
            location_skip_keywords: Vec::new(),
            company_skip_keywords: Vec::new(),
            good_fit_threshold: default_good_fit_threshold(),
            auto_adjustment_enabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigValidationError {
    #[error("blank keyword in {list}")]
    BlankKeyword { list: &'static str },
    #[error("title_skip_words entry {0:?} must be a single word")]
    MultiWordTitleSkip(String),
    #[error("blank location in location_priorities")]
    BlankLocation,
    #[error("duplicate location {0:?} in location_priorities")]
    DuplicateLocation(String),
    #[error("good_fit_threshold must be at least 1 when auto adjustment is enabled")]
    ZeroThreshold,
    #[error("malformed preferences document: {0}")]
    Malformed(String),
}

impl FilterConfig {
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        check_blank("positive_keywords", self.positive_keywords.iter().map(|k| k.keyword.as_str()))?;
        check_blank("negative_keywords", self.negative_keywords.iter().map(|k| k.keyword.as_str()))?;
        check_blank(
            "sustainability.positive",
            self.sustainability.positive.iter().map(String::as_str),
        )?;
        check_blank(
            "sustainability.negative",
            self.sustainability.negative.iter().map(String::as_str),
        )?;
        check_blank(
            "title_skip_keywords",
            self.title_skip_keywords.iter().map(String::as_str),
        )?;
        check_blank("title_skip_words", self.title_skip_words.iter().map(String::as_str))?;
        if let Some(word) = self.title_skip_words.iter().find(|w| w.trim().contains(char::is_whitespace)) {
            return Err(ConfigValidationError::MultiWordTitleSkip(word.clone()));
        }
        check_blank(
            "location_skip_keywords",
            self.location_skip_keywords.iter().map(String::as_str),
        )?;
        check_blank(
            "company_skip_keywords",
            self.company_skip_keywords.iter().map(String::as_str),
        )?;

        let mut seen = HashSet::new();
        for entry in &self.location_priorities {
            let key = entry.location.trim().to_lowercase();
            if key.is_empty() {
                return Err(ConfigValidationError::BlankLocation);
            }
            if !seen.insert(key) {
                return Err(ConfigValidationError::DuplicateLocation(entry.location.clone()));
            }
        }

        if self.auto_adjustment_enabled && self.good_fit_threshold == 0 {
            return Err(ConfigValidationError::ZeroThreshold);
        }
        Ok(())
    }

    /// Highest weight among configured locations contained in `location`
    /// (case-insensitive); 0 when nothing matches.
    pub fn location_weight(&self, location: &str) -> u32 {
        let haystack = location.to_lowercase();
        self.location_priorities
            .iter()
            .filter(|p| haystack.contains(&p.location.trim().to_lowercase()))
            .map(|p| p.weight)
            .max()
            .unwrap_or(0)
    }
}

fn check_blank<'a>(
    list: &'static str,
    mut values: impl Iterator<Item = &'a str>,
) -> Result<(), ConfigValidationError> {
    if values.any(|v| v.trim().is_empty()) {
        return Err(ConfigValidationError::BlankKeyword { list });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_weight_uses_substring_and_best_match() {
        let config = FilterConfig {
            location_priorities: vec![
                LocationPriority::new("Germany", 2),
                LocationPriority::new("Berlin", 5),
            ],
            ..Default::default()
        };
        assert_eq!(config.location_weight("Berlin, Germany"), 5);
        assert_eq!(config.location_weight("Hamburg, Germany"), 2);
        assert_eq!(config.location_weight("Lisbon"), 0);
    }

    #[test]
    fn duplicate_locations_are_rejected_case_insensitively() {
        let config = FilterConfig {
            location_priorities: vec![
                LocationPriority::new("Berlin", 1),
                LocationPriority::new("berlin ", 3),
            ],
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigValidationError::DuplicateLocation("berlin ".into()))
        );
    }

    #[test]
    fn zero_threshold_only_matters_with_auto_adjustment() {
        let mut config = FilterConfig {
            good_fit_threshold: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        config.auto_adjustment_enabled = true;
        assert_eq!(config.validate(), Err(ConfigValidationError::ZeroThreshold));
    }

    #[test]
    fn blank_keywords_name_their_list() {
        let config = FilterConfig {
            sustainability: SustainabilityKeywords {
                negative: vec!["oil".into(), " ".into()],
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigValidationError::BlankKeyword {
                list: "sustainability.negative"
            })
        );
    }

    #[test]
    fn skip_lists_are_validated() {
        let config = FilterConfig {
            company_skip_keywords: vec!["".into()],
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigValidationError::BlankKeyword {
                list: "company_skip_keywords"
            })
        );

        let config = FilterConfig {
            title_skip_words: vec!["go".into(), "dot net".into()],
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigValidationError::MultiWordTitleSkip("dot net".into()))
        );
    }

    #[test]
    fn yaml_defaults_fill_missing_keys() {
        let config: FilterConfig = serde_yaml::from_str(
            "title_skip_keywords: [php]\nsustainability:\n  negative: [oil]\n",
        )
        .unwrap();
        assert_eq!(config.good_fit_threshold, 5);
        assert!(!config.auto_adjustment_enabled);
        assert!(!config.sustainability.use_company_overview);
        assert_eq!(config.title_skip_keywords, vec!["php".to_string()]);
        assert!(config.title_skip_words.is_empty());
        assert!(config.location_skip_keywords.is_empty());
        assert!(config.company_skip_keywords.is_empty());
        let json = serde_json::to_string(&config).unwrap();
        let back: FilterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
