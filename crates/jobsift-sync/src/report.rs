use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jobsift_storage::LedgerSnapshot;
use serde::Serialize;
use tokio::fs;
use uuid::Uuid;

use crate::controller::AdjustmentDecision;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceSummary {
    pub name: String,
    pub searches: usize,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Further calls were refused for the rest of the cycle.
    pub quota_paused: bool,
    pub provider_errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub sources: Vec<SourceSummary>,
    pub companies_enriched: usize,
    pub details_fetched: usize,
    pub scored: usize,
    pub skipped: usize,
    pub excluded: usize,
    pub forwarded: usize,
    pub classified: usize,
    pub classification_failures: usize,
    pub good_fits: usize,
    pub adjustment: Option<AdjustmentDecision>,
    pub usage: LedgerSnapshot,
    pub reports_dir: Option<String>,
}

impl CycleSummary {
    pub fn fetched(&self) -> usize {
        self.sources.iter().map(|s| s.fetched).sum()
    }

    pub fn inserted(&self) -> usize {
        self.sources.iter().map(|s| s.inserted).sum()
    }
}

/// Writes `cycle_summary.json` and `daily_brief.md` under
/// `<reports_root>/<run_id>/` and returns that directory.
pub async fn write_reports(reports_root: &Path, summary: &CycleSummary) -> Result<PathBuf> {
    let dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing cycle summary")?;
    fs::write(dir.join("cycle_summary.json"), json)
        .await
        .context("writing cycle_summary.json")?;
    fs::write(dir.join("daily_brief.md"), daily_brief(summary))
        .await
        .context("writing daily_brief.md")?;
    Ok(dir)
}

pub fn daily_brief(summary: &CycleSummary) -> String {
    let mut lines = vec![
        "# jobsift Daily Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
    ];
    if summary.cancelled {
        lines.push("- Cancelled before completion".to_string());
    }
    lines.push(format!(
        "- Postings: {} fetched, {} new",
        summary.fetched(),
        summary.inserted()
    ));
    lines.push(format!(
        "- Scoring: {} forwarded, {} skipped, {} excluded on sustainability",
        summary.forwarded, summary.skipped, summary.excluded
    ));
    lines.push(format!(
        "- Classified: {} ({} good fits, {} failures)",
        summary.classified, summary.good_fits, summary.classification_failures
    ));
    let usage = &summary.usage;
    lines.push(match usage.monthly_cap {
        Some(cap) => format!("- Quota {}: {} of {} units used", usage.period, usage.used_units, cap),
        None => format!("- Quota {}: {} units used, no cap", usage.period, usage.used_units),
    });

    lines.push(String::new());
    lines.push("## Sources".to_string());
    for source in &summary.sources {
        let mut line = format!(
            "- {}: {} fetched over {} searches, {} new, {} updated",
            source.name, source.fetched, source.searches, source.inserted, source.updated
        );
        if source.quota_paused {
            line.push_str(" (paused: quota)");
        }
        lines.push(line);
        for err in &source.provider_errors {
            lines.push(format!("  - error: {err}"));
        }
    }

    if let Some(decision) = &summary.adjustment {
        lines.push(String::new());
        lines.push("## Filter adjustment".to_string());
        lines.push(match decision {
            AdjustmentDecision::Disabled => "- auto adjustment disabled".to_string(),
            AdjustmentDecision::BelowThreshold { good_fits, threshold } => {
                format!("- {good_fits} good fits, threshold {threshold}")
            }
            AdjustmentDecision::Suppressed { outstanding_id, .. } => {
                format!("- threshold reached, adjustment #{outstanding_id} still outstanding")
            }
            AdjustmentDecision::NoChange { good_fits } => {
                format!("- {good_fits} good fits, no location change proposed")
            }
            AdjustmentDecision::Adjusted { event } => {
                format!("- adjustment #{}: {}", event.id, event.trigger_reason)
            }
        });
    }
    lines.push(String::new());
    lines.join("\n")
}
