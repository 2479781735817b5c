//! Markdown and terminal renderings of a [`BenchmarkReport`].

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use tracing::{info, warn};

use super::aggregate::AggregatedResult;
use super::json::{write_atomic, BenchmarkReport};
use crate::error::ReportError;
use crate::runner::config::DEFAULT_VARIANT;
use crate::runner::result::CheckKind;

/// Opening marker of the generated block in the README.
pub const RESULTS_START: &str = "<!-- BENCHMARK RESULTS -->";
/// Closing marker of the generated block in the README.
pub const RESULTS_END: &str = "<!-- /BENCHMARK RESULTS -->";

/// File name of the markdown table inside the results directory.
pub const LATEST_MARKDOWN: &str = "latest.md";

/// `✅` for 1.0, `❌` for 0.0, otherwise a whole percentage.
pub fn rate_cell(rate: f64) -> String {
    if rate >= 1.0 {
        "\u{2705}".to_string()
    } else if rate <= 0.0 {
        "\u{274c}".to_string()
    } else {
        percent(rate)
    }
}

fn percent(value: f64) -> String {
    format!("{:.0}%", value * 100.0)
}

/// True when any row belongs to a variant other than the default one.
pub fn has_named_variants<'a>(rows: impl IntoIterator<Item = &'a AggregatedResult>) -> bool {
    rows.into_iter().any(|r| r.prompt_variant != DEFAULT_VARIANT)
}

fn check_cells(row: &AggregatedResult) -> Vec<String> {
    CheckKind::ALL
        .iter()
        .map(|kind| rate_cell(row.per_check_rates.get(*kind)))
        .collect()
}

fn runs_note(rows: &[&AggregatedResult]) -> String {
    let counts: BTreeSet<usize> = rows.iter().map(|r| r.num_runs).collect();
    match counts.iter().next() {
        Some(n) if counts.len() == 1 => format!("{} runs per model", n),
        _ => "variable runs per model".to_string(),
    }
}

/// Renders the results table with its header line and legend.
pub fn render_markdown(report: &BenchmarkReport) -> String {
    let rows: Vec<&AggregatedResult> = report.summaries().collect();
    let variants = has_named_variants(rows.iter().copied());

    let version_note = if report.tool_version == "unknown" {
        String::new()
    } else {
        format!(" \u{b7} OpenClaw **{}**", report.tool_version)
    };

    let mut lines = vec![
        "### Latest results".to_string(),
        String::new(),
        format!(
            "> Ran on **{}** ({}, averaged){}.",
            report.timestamp.format("%Y-%m-%d %H:%M UTC"),
            runs_note(&rows),
            version_note
        ),
        String::new(),
    ];

    if variants {
        lines.push("| Model | Variant | Runs | Avg Score | Perfect | BOOTSTRAP | IDENTITY | USER | SOUL | Avg Duration |".into());
        lines.push("|-------|---------|:----:|:---------:|:-------:|:---------:|:--------:|:----:|:----:|-------------:|".into());
    } else {
        lines.push("| Model | Runs | Avg Score | Perfect | BOOTSTRAP | IDENTITY | USER | SOUL | Avg Duration |".into());
        lines.push("|-------|:----:|:---------:|:-------:|:---------:|:--------:|:----:|:----:|-------------:|".into());
    }

    for row in &rows {
        let mut cells = vec![row.model.clone()];
        if variants {
            cells.push(row.prompt_variant.clone());
        }
        cells.push(row.num_runs.to_string());
        cells.push(percent(row.avg_score));
        cells.push(rate_cell(row.perfect_rate));
        cells.extend(check_cells(row));
        cells.push(format!("{:.1}s", row.avg_duration_s));
        lines.push(format!("| {} |", cells.join(" | ")));
    }

    let perfect = rows.iter().filter(|r| r.is_perfect()).count();
    lines.push(String::new());
    lines.push(format!(
        "**{}/{}** models completed the bootstrap perfectly in every run.",
        perfect,
        rows.len()
    ));
    lines.push(String::new());
    lines.push("<details><summary>Column legend</summary>".into());
    lines.push(String::new());
    lines.push("| Column | Meaning |".into());
    lines.push("|--------|---------|".into());
    if variants {
        lines.push("| **Variant** | Prompt variant the runs were driven with |".into());
    }
    lines.push("| **Runs** | Number of independent runs (each from a fresh environment) |".into());
    lines.push("| **Avg Score** | Average percentage of checks passed across all runs |".into());
    lines.push("| **Perfect** | Fraction of runs where all 4 checks passed |".into());
    lines.push("| **BOOTSTRAP** | Rate at which `BOOTSTRAP.md` was deleted |".into());
    lines.push("| **IDENTITY** | Rate at which `IDENTITY.md` has real Name, Creature, Vibe, Emoji |".into());
    lines.push("| **USER** | Rate at which `USER.md` has real Name, Timezone |".into());
    lines.push("| **SOUL** | Rate at which `SOUL.md` was personalised beyond the template |".into());
    lines.push("| **Avg Duration** | Average wall-clock time of the bootstrap conversation |".into());
    lines.push(String::new());
    lines.push("</details>".into());
    lines.push(String::new());

    lines.join("\n")
}

/// Replaces everything between the result markers (inclusive) with the
/// table. Returns `None` when either marker is missing.
pub fn inject_results(readme: &str, table: &str) -> Option<String> {
    let start = readme.find(RESULTS_START)?;
    let end_rel = readme[start..].find(RESULTS_END)?;
    let end = start + end_rel + RESULTS_END.len();

    let mut updated = String::with_capacity(readme.len() + table.len());
    updated.push_str(&readme[..start]);
    updated.push_str(RESULTS_START);
    updated.push('\n');
    updated.push_str(table);
    updated.push('\n');
    updated.push_str(RESULTS_END);
    updated.push_str(&readme[end..]);
    Some(updated)
}

/// Rewrites the marked block of the README at `path`. Returns whether the
/// file was updated; a missing file or missing markers only warn.
pub fn update_readme(path: &Path, table: &str) -> Result<bool, ReportError> {
    if !path.is_file() {
        warn!("README not found at {}", path.display());
        return Ok(false);
    }
    let content = fs::read_to_string(path)?;
    let Some(updated) = inject_results(&content, table) else {
        warn!(
            "{} is missing result markers ({} ... {}), skipping update",
            path.display(),
            RESULTS_START,
            RESULTS_END
        );
        return Ok(false);
    };
    write_atomic(path, updated.as_bytes())?;
    info!("Updated {} with latest benchmark results", path.display());
    Ok(true)
}

/// Plain-text summary table for the terminal.
pub fn render_summary(report: &BenchmarkReport) -> String {
    let rows: Vec<&AggregatedResult> = report.summaries().collect();
    let model_width = rows
        .iter()
        .map(|r| r.model.chars().count())
        .chain(std::iter::once(5))
        .max()
        .unwrap_or(5);
    let variant_width = rows
        .iter()
        .map(|r| r.prompt_variant.chars().count())
        .chain(std::iter::once(7))
        .max()
        .unwrap_or(7);

    let mut out = String::new();
    out.push_str("\n=== OpenClaw Bootstrap Benchmark ===\n");
    out.push_str(&format!(
        "{:<mw$}  {:<vw$}  {:>4}  {:>6}  {:>7}  {:>9}  {:>8}  {:>6}  {:>6}  {:>8}\n",
        "Model",
        "Variant",
        "Runs",
        "Score",
        "Perfect",
        "BOOTSTRAP",
        "IDENTITY",
        "USER",
        "SOUL",
        "Duration",
        mw = model_width,
        vw = variant_width,
    ));
    for row in &rows {
        let checks = CheckKind::ALL.map(|kind| percent(row.per_check_rates.get(kind)));
        out.push_str(&format!(
            "{:<mw$}  {:<vw$}  {:>4}  {:>6}  {:>7}  {:>9}  {:>8}  {:>6}  {:>6}  {:>7.1}s\n",
            row.model,
            row.prompt_variant,
            row.num_runs,
            percent(row.avg_score),
            percent(row.perfect_rate),
            checks[0],
            checks[1],
            checks[2],
            checks[3],
            row.avg_duration_s,
            mw = model_width,
            vw = variant_width,
        ));
    }
    let perfect = rows.iter().filter(|r| r.is_perfect()).count();
    out.push_str(&format!(
        "\n{}/{} models completed bootstrap perfectly in all runs\n",
        perfect,
        rows.len()
    ));
    out
}
