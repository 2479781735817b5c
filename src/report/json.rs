//! JSON report: schema, redaction and atomic persistence.
//!
//! Every invocation writes `benchmark_<UTC yyyymmdd_HHMMSS>.json` and
//! rewrites `benchmark_latest.json` in the results directory. The latest
//! copy is the only input to skip-completed comparison, so both files are
//! written through a temp file in the same directory and then renamed.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::aggregate::AggregatedResult;
use crate::error::ReportError;
use crate::runner::result::{ConversationTurn, FileCheck, RunRecord};

/// File name of the rolling copy of the most recent report.
pub const LATEST_REPORT: &str = "benchmark_latest.json";

// ---------------------------------------------------------------------------
// Redaction
// ---------------------------------------------------------------------------

fn secret_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)(Bearer\s+)\S+|(api[_-]?key["':\s=]+)\S+"#).expect("secret regex is valid")
    })
}

/// Replaces secret-looking values with `***`, keeping the prefix that
/// identified them (`Bearer `, `api_key=`, `"apiKey": "`).
pub fn scrub(text: &str) -> String {
    secret_regex()
        .replace_all(text, |caps: &Captures<'_>| {
            let prefix = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
            format!("{}***", prefix)
        })
        .into_owned()
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// One conversation turn as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnEntry {
    pub prompt: String,
    pub response: String,
    pub duration_s: f64,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl From<&ConversationTurn> for TurnEntry {
    fn from(turn: &ConversationTurn) -> Self {
        Self {
            prompt: turn.prompt.clone(),
            response: scrub(&turn.response),
            duration_s: turn.duration.as_secs_f64(),
            success: turn.success,
            error: turn.error.as_deref().map(scrub),
        }
    }
}

/// One file check as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckEntry {
    pub filename: String,
    pub exists: bool,
    pub passed: bool,
    pub details: String,
    pub content: String,
}

impl From<&FileCheck> for CheckEntry {
    fn from(check: &FileCheck) -> Self {
        Self {
            filename: check.filename.clone(),
            exists: check.exists,
            passed: check.passed,
            details: scrub(&check.details),
            content: scrub(&check.content),
        }
    }
}

/// One trial as persisted, with secrets redacted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEntry {
    pub ritual_completed: bool,
    pub score: f64,
    pub total_duration_s: f64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub turns: Vec<TurnEntry>,
    #[serde(default)]
    pub checks: Vec<CheckEntry>,
}

impl RunEntry {
    pub fn from_record(record: &RunRecord) -> Self {
        Self {
            ritual_completed: record.conversation.ritual_completed,
            score: record.score(),
            total_duration_s: record.duration().as_secs_f64(),
            error: record.conversation.error.as_deref().map(scrub),
            turns: record.conversation.turns.iter().map(TurnEntry::from).collect(),
            checks: record.verification.checks.iter().map(CheckEntry::from).collect(),
        }
    }
}

/// Summary row for one (model, variant) pair plus the runs behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEntry {
    #[serde(flatten)]
    pub summary: AggregatedResult,
    #[serde(default)]
    pub runs: Vec<RunEntry>,
}

impl ReportEntry {
    /// Entry for runs executed in this invocation.
    pub fn fresh(summary: AggregatedResult, records: &[RunRecord]) -> Self {
        Self {
            summary,
            runs: records.iter().map(RunEntry::from_record).collect(),
        }
    }
}

/// Top-level persisted report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkReport {
    pub timestamp: DateTime<Utc>,
    /// Tool version the runs were produced with.
    #[serde(alias = "openclawVersion", alias = "openclaw_version")]
    pub tool_version: String,
    #[serde(default)]
    pub models: Vec<ReportEntry>,
}

impl BenchmarkReport {
    pub fn new(tool_version: impl Into<String>, models: Vec<ReportEntry>) -> Self {
        Self {
            timestamp: Utc::now(),
            tool_version: tool_version.into(),
            models,
        }
    }

    /// Prior result for a (model, variant) pair.
    pub fn prior(&self, model: &str, variant: &str) -> Option<PriorReportEntry<'_>> {
        self.models
            .iter()
            .find(|e| e.summary.model == model && e.summary.prompt_variant == variant)
            .map(|entry| PriorReportEntry {
                tool_version: &self.tool_version,
                entry,
            })
    }

    /// Summary rows in report order.
    pub fn summaries(&self) -> impl Iterator<Item = &AggregatedResult> {
        self.models.iter().map(|e| &e.summary)
    }

    /// True iff there is at least one row and every row is perfect.
    pub fn all_perfect(&self) -> bool {
        !self.models.is_empty() && self.models.iter().all(|e| e.summary.is_perfect())
    }
}

/// A previously persisted entry and the tool version it was produced with.
#[derive(Debug, Clone, Copy)]
pub struct PriorReportEntry<'a> {
    pub tool_version: &'a str,
    pub entry: &'a ReportEntry,
}

impl PriorReportEntry<'_> {
    /// Reasons the entry cannot be reused. Empty means it can.
    pub fn mismatch_reasons(&self, current_version: &str, prompts: &[String]) -> Vec<String> {
        let mut reasons = Vec::new();
        if self.tool_version != current_version {
            reasons.push(format!(
                "OpenClaw version changed: '{}' \u{2192} '{}'",
                self.tool_version, current_version
            ));
        }
        if self.entry.summary.prompt_variant_prompts != prompts {
            reasons.push("prompt text changed".to_string());
        }
        reasons
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Results directory holding JSON and markdown reports.
#[derive(Debug, Clone)]
pub struct ReportStore {
    dir: PathBuf,
}

impl ReportStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(LATEST_REPORT)
    }

    /// Writes the timestamped report and the latest copy. Returns the
    /// timestamped path.
    pub fn save(&self, report: &BenchmarkReport) -> Result<PathBuf, ReportError> {
        let json = serde_json::to_string_pretty(report)?;
        let name = format!("benchmark_{}.json", report.timestamp.format("%Y%m%d_%H%M%S"));
        let path = self.dir.join(name);

        write_atomic(&path, json.as_bytes())?;
        write_atomic(&self.latest_path(), json.as_bytes())?;
        debug!("Report written to {}", path.display());
        Ok(path)
    }

    /// Loads the latest report. A missing or unreadable file yields `None`.
    pub fn load_latest(&self) -> Option<BenchmarkReport> {
        let path = self.latest_path();
        if !path.is_file() {
            return None;
        }
        let loaded = fs::read_to_string(&path)
            .map_err(ReportError::from)
            .and_then(|content| serde_json::from_str(&content).map_err(ReportError::from));
        match loaded {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("Could not load {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Writes a text file into the results directory.
    pub fn write_text(&self, name: &str, content: &str) -> Result<PathBuf, ReportError> {
        let path = self.dir.join(name);
        write_atomic(&path, content.as_bytes())?;
        Ok(path)
    }
}

/// Writes `bytes` to a temp file next to `path`, then renames it over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ReportError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    // The temp file is owner-only; a rewrite keeps the target's mode.
    if let Ok(existing) = fs::metadata(path) {
        tmp.as_file().set_permissions(existing.permissions())?;
    }
    tmp.persist(path).map_err(|e| ReportError::Persist {
        path: path.to_path_buf(),
        reason: e.error.to_string(),
    })?;
    Ok(())
}
