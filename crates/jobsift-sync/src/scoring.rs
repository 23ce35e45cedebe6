//! Deterministic keyword scoring. Decides whether a posting is skipped,
//! excluded on sustainability grounds, or forwarded to the classifier.

use jobsift_core::{
    normalize_company_name, Company, FilterConfig, FitCategory, Job, JobStatus, MatchField, Polarity,
    SustainabilityMatch, WeightedKeyword,
};
use jobsift_storage::ScoringRecord;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoringOutcome {
    pub excluded: bool,
    pub matches: Vec<SustainabilityMatch>,
    pub forward_to_classifier: bool,
    pub status: JobStatus,
    /// Set for terminal outcomes; forwarded postings wait for the classifier.
    pub fit_category: Option<FitCategory>,
    pub keyword_score: i64,
    pub location_weight: u32,
    pub reason: Option<String>,
}

impl ScoringOutcome {
    pub fn to_record(&self) -> ScoringRecord {
        ScoringRecord {
            status: self.status,
            fit_category: self.fit_category,
            sustainability_matches: self.matches.clone(),
            keyword_score: Some(self.keyword_score),
            location_weight: Some(self.location_weight),
            note: self.reason.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScoringEngine;

impl ScoringEngine {
    pub fn evaluate(&self, job: &Job, config: &FilterConfig, company: Option<&Company>) -> ScoringOutcome {
        let location_weight = config.location_weight(&job.location);
        let title = job.title.to_lowercase();

        if let Some(reason) = skip_reason(job, &title, config) {
            return ScoringOutcome {
                excluded: false,
                matches: Vec::new(),
                forward_to_classifier: false,
                status: JobStatus::Skipped,
                fit_category: Some(FitCategory::PoorFit),
                keyword_score: 0,
                location_weight,
                reason: Some(reason),
            };
        }

        let overview = config
            .sustainability
            .use_company_overview
            .then(|| company.and_then(Company::overview_text))
            .flatten();
        let fields = searchable_fields(job, overview);

        let negative = find_matches(&config.sustainability.negative, Polarity::Negative, &fields);
        if let Some(first) = negative.first() {
            let reason = format!(
                "sustainability keyword {:?} found in {}",
                first.keyword,
                field_label(first.field)
            );
            return ScoringOutcome {
                excluded: true,
                matches: negative,
                forward_to_classifier: false,
                status: JobStatus::SustainabilityExcluded,
                fit_category: Some(FitCategory::VeryPoorFit),
                keyword_score: 0,
                location_weight,
                reason: Some(reason),
            };
        }

        let matches = find_matches(&config.sustainability.positive, Polarity::Positive, &fields);
        let text = format!(
            "{} {}",
            title,
            job.description.as_deref().unwrap_or_default().to_lowercase()
        );
        let keyword_score = weighted_score(&config.positive_keywords, &text)
            - weighted_score(&config.negative_keywords, &text);

        ScoringOutcome {
            excluded: false,
            matches,
            forward_to_classifier: true,
            status: JobStatus::Scored,
            fit_category: None,
            keyword_score,
            location_weight,
            reason: None,
        }
    }
}

/// Title rules first, then location, then company.
fn skip_reason(job: &Job, title: &str, config: &FilterConfig) -> Option<String> {
    if let Some(keyword) = find_substring(&config.title_skip_keywords, title) {
        return Some(format!("title matched skip keyword {keyword:?}"));
    }
    let words: Vec<&str> = title
        .split(|c: char| c.is_whitespace() || matches!(c, ',' | '/' | '(' | ')' | '|'))
        .filter(|w| !w.is_empty())
        .collect();
    if let Some(word) = config
        .title_skip_words
        .iter()
        .map(|w| w.trim())
        .find(|w| words.iter().any(|t| t.eq_ignore_ascii_case(w)))
    {
        return Some(format!("title word matched skip keyword {word:?}"));
    }
    if let Some(keyword) = find_substring(&config.location_skip_keywords, &job.location.to_lowercase()) {
        return Some(format!("location matched skip keyword {keyword:?}"));
    }
    let company = normalize_company_name(&job.company_name);
    if let Some(keyword) = find_substring(&config.company_skip_keywords, &company) {
        return Some(format!("company name matched skip keyword {keyword:?}"));
    }
    None
}

fn find_substring<'a>(keywords: &'a [String], haystack: &str) -> Option<&'a str> {
    keywords
        .iter()
        .map(|k| k.trim())
        .find(|k| !k.is_empty() && haystack.contains(&k.to_lowercase()))
}

fn searchable_fields<'a>(job: &'a Job, overview: Option<&'a str>) -> Vec<(MatchField, String)> {
    let mut fields = vec![
        (MatchField::Title, job.title.to_lowercase()),
        (MatchField::CompanyName, job.company_name.to_lowercase()),
        (MatchField::Location, job.location.to_lowercase()),
    ];
    if let Some(overview) = overview {
        fields.push((MatchField::CompanyOverview, overview.to_lowercase()));
    }
    fields
}

/// One match per (keyword, field) pair, in keyword then field order.
fn find_matches(keywords: &[String], polarity: Polarity, fields: &[(MatchField, String)]) -> Vec<SustainabilityMatch> {
    let mut out = Vec::new();
    for keyword in keywords {
        let needle = keyword.trim().to_lowercase();
        if needle.is_empty() {
            continue;
        }
        for (field, haystack) in fields {
            if haystack.contains(&needle) {
                out.push(SustainabilityMatch {
                    keyword: keyword.trim().to_string(),
                    polarity,
                    field: *field,
                });
            }
        }
    }
    out
}

fn weighted_score(keywords: &[WeightedKeyword], text: &str) -> i64 {
    keywords
        .iter()
        .filter(|k| {
            let needle = k.keyword.trim().to_lowercase();
            !needle.is_empty() && text.contains(&needle)
        })
        .map(|k| i64::from(k.weight))
        .sum()
}

fn field_label(field: MatchField) -> &'static str {
    match field {
        MatchField::Title => "title",
        MatchField::CompanyName => "company name",
        MatchField::Location => "location",
        MatchField::CompanyOverview => "company overview",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jobsift_core::{JobSource, LocationPriority, SustainabilityKeywords};

    fn job(title: &str, company: &str, location: &str, description: Option<&str>) -> Job {
        Job::discovered(JobSource::Other, title, company, location, "https://x.test/1", Utc::now())
            .with_description(description.map(str::to_string))
    }

    fn config() -> FilterConfig {
        FilterConfig {
            positive_keywords: vec![WeightedKeyword::new("rust", 3), WeightedKeyword::new("kubernetes", 1)],
            negative_keywords: vec![WeightedKeyword::new("on-call", 2)],
            sustainability: SustainabilityKeywords {
                positive: vec!["wind".into(), "solar".into()],
                negative: vec!["oil".into()],
                use_company_overview: true,
            },
            location_priorities: vec![LocationPriority::new("Berlin", 4)],
            title_skip_keywords: vec!["PHP".into()],
            ..Default::default()
        }
    }

    #[test]
    fn negative_sustainability_keyword_excludes() {
        let outcome = ScoringEngine.evaluate(
            &job("Backend Engineer", "Acme Oil Corp", "Hamburg", Some("Rust")),
            &config(),
            None,
        );
        assert!(outcome.excluded);
        assert!(!outcome.forward_to_classifier);
        assert_eq!(outcome.status, JobStatus::SustainabilityExcluded);
        assert_eq!(outcome.fit_category, Some(FitCategory::VeryPoorFit));
        assert_eq!(
            outcome.matches,
            vec![SustainabilityMatch {
                keyword: "oil".into(),
                polarity: Polarity::Negative,
                field: MatchField::CompanyName,
            }]
        );
    }

    #[test]
    fn title_skip_runs_before_sustainability() {
        let outcome = ScoringEngine.evaluate(&job("Senior php developer", "Acme Oil Corp", "", None), &config(), None);
        assert_eq!(outcome.status, JobStatus::Skipped);
        assert!(!outcome.excluded);
        assert_eq!(outcome.fit_category, Some(FitCategory::PoorFit));
        assert_eq!(outcome.reason.as_deref(), Some("title matched skip keyword \"PHP\""));
    }

    #[test]
    fn whole_word_title_skip_ignores_partial_words() {
        let config = FilterConfig {
            title_skip_words: vec!["Go".into()],
            ..config()
        };
        let skipped = ScoringEngine.evaluate(&job("Senior Go/Rust Engineer", "Windkraft", "", None), &config, None);
        assert_eq!(skipped.status, JobStatus::Skipped);
        assert_eq!(skipped.reason.as_deref(), Some("title word matched skip keyword \"Go\""));

        let kept = ScoringEngine.evaluate(&job("Google Cloud Engineer", "Windkraft", "", None), &config, None);
        assert!(kept.forward_to_classifier);
    }

    #[test]
    fn location_and_company_skips_carry_their_reason() {
        let config = FilterConfig {
            location_skip_keywords: vec!["on-site only".into()],
            company_skip_keywords: vec!["recruiting".into()],
            ..config()
        };
        let location = ScoringEngine.evaluate(
            &job("Rust Engineer", "Windkraft", "Munich (On-site only)", None),
            &config,
            None,
        );
        assert_eq!(location.status, JobStatus::Skipped);
        assert_eq!(location.reason.as_deref(), Some("location matched skip keyword \"on-site only\""));

        let company = ScoringEngine.evaluate(
            &job("Rust Engineer", "Talent Recruiting GmbH", "Berlin", None),
            &config,
            None,
        );
        assert_eq!(company.status, JobStatus::Skipped);
        assert_eq!(company.fit_category, Some(FitCategory::PoorFit));
        assert_eq!(company.location_weight, 4);
        assert_eq!(
            company.reason.as_deref(),
            Some("company name matched skip keyword \"recruiting\"")
        );
    }

    #[test]
    fn overview_is_searched_only_when_enabled() {
        let mut company = Company::new("Northwind Energy", Utc::now());
        company.overview = Some("An integrated oil and gas major.".into());
        let posting = job("Data Engineer", "Northwind Energy", "Berlin, Germany", None);

        let excluded = ScoringEngine.evaluate(&posting, &config(), Some(&company));
        assert_eq!(excluded.matches[0].field, MatchField::CompanyOverview);
        assert!(excluded.excluded);

        let mut no_overview = config();
        no_overview.sustainability.use_company_overview = false;
        let kept = ScoringEngine.evaluate(&posting, &no_overview, Some(&company));
        assert!(kept.forward_to_classifier);
        assert_eq!(kept.location_weight, 4);

        let missing = ScoringEngine.evaluate(&posting, &config(), None);
        assert!(missing.forward_to_classifier);
    }

    #[test]
    fn weighted_keywords_score_title_and_description() {
        let outcome = ScoringEngine.evaluate(
            &job(
                "Platform Engineer",
                "Windkraft GmbH",
                "Berlin",
                Some("Rust services on Kubernetes, shared on-call."),
            ),
            &config(),
            None,
        );
        assert_eq!(outcome.keyword_score, 3 + 1 - 2);
        assert_eq!(outcome.status, JobStatus::Scored);
        assert_eq!(outcome.fit_category, None);
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].polarity, Polarity::Positive);
    }

    #[test]
    fn empty_lists_forward_everything() {
        let outcome = ScoringEngine.evaluate(&job("Anything", "Anyone", "", None), &FilterConfig::default(), None);
        assert!(outcome.forward_to_classifier);
        assert_eq!(outcome.keyword_score, 0);
        assert!(outcome.matches.is_empty());
    }
}
