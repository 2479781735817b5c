//! Reduction of a (model, variant) pair's runs into one summary row.

use serde::{Deserialize, Serialize};

use crate::runner::result::{CheckKind, RunRecord};

/// Pass rate of each check across runs, in [0, 1].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerCheckRates {
    pub trigger: f64,
    pub identity: f64,
    pub user: f64,
    pub persona: f64,
}

impl PerCheckRates {
    pub fn get(&self, kind: CheckKind) -> f64 {
        match kind {
            CheckKind::Trigger => self.trigger,
            CheckKind::Identity => self.identity,
            CheckKind::User => self.user,
            CheckKind::Persona => self.persona,
        }
    }

    fn set(&mut self, kind: CheckKind, rate: f64) {
        match kind {
            CheckKind::Trigger => self.trigger = rate,
            CheckKind::Identity => self.identity = rate,
            CheckKind::User => self.user = rate,
            CheckKind::Persona => self.persona = rate,
        }
    }
}

/// Summary of every run of one (model, variant) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedResult {
    /// Model identifier.
    pub model: String,
    /// Variant name.
    pub prompt_variant: String,
    /// Prompt text of the variant, stored for skip-completed comparison.
    #[serde(default)]
    pub prompt_variant_prompts: Vec<String>,
    /// Number of runs. Zero means "no data", not "failed".
    pub num_runs: usize,
    /// Mean verification score.
    pub avg_score: f64,
    /// Mean conversation duration in seconds.
    pub avg_duration_s: f64,
    /// Fraction of runs where the trigger file was gone after the conversation.
    pub bootstrap_rate: f64,
    /// Fraction of runs where every check passed.
    pub perfect_rate: f64,
    /// Pass rate per check.
    #[serde(default)]
    pub per_check_rates: PerCheckRates,
}

impl AggregatedResult {
    /// A zeroed result with no runs.
    pub fn empty(model: impl Into<String>, variant: impl Into<String>, prompts: Vec<String>) -> Self {
        Self {
            model: model.into(),
            prompt_variant: variant.into(),
            prompt_variant_prompts: prompts,
            num_runs: 0,
            avg_score: 0.0,
            avg_duration_s: 0.0,
            bootstrap_rate: 0.0,
            perfect_rate: 0.0,
            per_check_rates: PerCheckRates::default(),
        }
    }

    /// False for the zeroed no-runs result.
    pub fn has_data(&self) -> bool {
        self.num_runs > 0
    }

    /// True iff there is data and every run passed every check.
    pub fn is_perfect(&self) -> bool {
        self.has_data() && self.perfect_rate >= 1.0
    }
}

/// Reduces `runs` to one row. Pure: no I/O, no logging.
pub fn aggregate(model_id: &str, variant: &str, prompts: &[String], runs: &[RunRecord]) -> AggregatedResult {
    let mut result = AggregatedResult::empty(model_id, variant, prompts.to_vec());
    if runs.is_empty() {
        return result;
    }

    let n = runs.len() as f64;
    let rate = |pred: &dyn Fn(&RunRecord) -> bool| runs.iter().filter(|&r| pred(r)).count() as f64 / n;

    result.num_runs = runs.len();
    result.avg_score = runs.iter().map(RunRecord::score).sum::<f64>() / n;
    result.avg_duration_s = runs.iter().map(|r| r.duration().as_secs_f64()).sum::<f64>() / n;
    result.bootstrap_rate = rate(&|r| r.conversation.ritual_completed);
    result.perfect_rate = rate(&|r| r.verification.all_passed);
    for kind in CheckKind::ALL {
        let check_rate = rate(&|r| r.verification.check(kind).is_some_and(|c| c.passed));
        result.per_check_rates.set(kind, check_rate);
    }
    result
}
