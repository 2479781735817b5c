//! Aggregation and persistence of benchmark results.
//!
//! - [`aggregate`]: pure reduction of runs into an [`AggregatedResult`]
//! - [`json`]: the persisted report schema and the results directory
//! - [`markdown`]: README table and terminal summary

pub mod aggregate;
pub mod json;
pub mod markdown;

pub use aggregate::{aggregate, AggregatedResult, PerCheckRates};
pub use json::{
    scrub, BenchmarkReport, CheckEntry, PriorReportEntry, ReportEntry, ReportStore, RunEntry, TurnEntry,
    LATEST_REPORT,
};
pub use markdown::{
    inject_results, rate_cell, render_markdown, render_summary, update_readme, LATEST_MARKDOWN, RESULTS_END,
    RESULTS_START,
};
