//! Results of a single trial: the conversation, the verification, and the
//! pair of them that forms a [`RunRecord`].

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Prefix the transport puts on a response that is really an error payload.
pub const ERROR_PAYLOAD_PREFIX: &str = "[ERROR]";

/// The four workspace artifacts a completed ritual must leave behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    /// The ritual file must be gone.
    Trigger,
    /// The agent's identity file must carry real values.
    Identity,
    /// The user file must carry real values.
    User,
    /// The persona file must differ from its template.
    Persona,
}

impl CheckKind {
    /// Checks in the order they are run and reported.
    pub const ALL: [CheckKind; 4] = [
        CheckKind::Trigger,
        CheckKind::Identity,
        CheckKind::User,
        CheckKind::Persona,
    ];

    /// Workspace file inspected by this check.
    pub fn filename(&self) -> &'static str {
        match self {
            CheckKind::Trigger => "BOOTSTRAP.md",
            CheckKind::Identity => "IDENTITY.md",
            CheckKind::User => "USER.md",
            CheckKind::Persona => "SOUL.md",
        }
    }

    /// Short key used in the persisted per-check rates.
    pub fn label(&self) -> &'static str {
        match self {
            CheckKind::Trigger => "trigger",
            CheckKind::Identity => "identity",
            CheckKind::User => "user",
            CheckKind::Persona => "persona",
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.filename())
    }
}

/// Record of a single conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Prompt that was sent.
    pub prompt: String,
    /// Response text, or the error payload the transport returned.
    pub response: String,
    /// Wall-clock time spent on the turn.
    pub duration: Duration,
    /// True iff the transport succeeded and the response is not an error payload.
    pub success: bool,
    /// Error text for failed turns.
    pub error: Option<String>,
}

impl ConversationTurn {
    /// A turn that completed with a usable response.
    pub fn succeeded(prompt: impl Into<String>, response: impl Into<String>, duration: Duration) -> Self {
        Self {
            prompt: prompt.into(),
            response: response.into(),
            duration,
            success: true,
            error: None,
        }
    }

    /// A turn that failed. `response` keeps whatever payload came back.
    pub fn failed(
        prompt: impl Into<String>,
        response: impl Into<String>,
        duration: Duration,
        error: impl Into<String>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            response: response.into(),
            duration,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Outcome of the whole conversation with one environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationResult {
    /// Model identifier.
    pub model_id: String,
    /// Turns in the order they were issued.
    pub turns: Vec<ConversationTurn>,
    /// Total wall-clock time of the conversation.
    pub total_duration: Duration,
    /// True when the trigger file was gone after the last turn.
    pub ritual_completed: bool,
    /// Provisioning or transport failure. Never set for a merely wrong answer.
    pub error: Option<String>,
}

impl ConversationResult {
    /// An empty conversation for `model_id`.
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            turns: Vec::new(),
            total_duration: Duration::ZERO,
            ritual_completed: false,
            error: None,
        }
    }

    /// A conversation that never started because the environment failed.
    pub fn failed(model_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(model_id)
        }
    }

    /// True if any turn failed.
    pub fn has_failed_turn(&self) -> bool {
        self.turns.iter().any(|t| !t.success)
    }

    /// Number of successful turns.
    pub fn successful_turns(&self) -> usize {
        self.turns.iter().filter(|t| t.success).count()
    }
}

/// Result of checking a single workspace file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileCheck {
    /// Which check produced this.
    pub kind: CheckKind,
    /// Inspected file name.
    pub filename: String,
    /// Whether the file existed.
    pub exists: bool,
    /// Whether the check passed.
    pub passed: bool,
    /// Human-readable explanation.
    pub details: String,
    /// Raw file content, kept for auditing.
    pub content: String,
}

impl FileCheck {
    /// A failing check with no content.
    pub fn new(kind: CheckKind) -> Self {
        Self {
            kind,
            filename: kind.filename().to_string(),
            exists: false,
            passed: false,
            details: String::new(),
            content: String::new(),
        }
    }

    /// Sets the details.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }
}

/// Aggregate result of the four checks for one workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    /// Model identifier.
    pub model_id: String,
    /// Exactly four checks, in [`CheckKind::ALL`] order.
    pub checks: Vec<FileCheck>,
    /// True iff every check passed.
    pub all_passed: bool,
    /// passed / total, in [0, 1].
    pub score: f64,
}

impl VerificationResult {
    /// Builds the result and derives `all_passed` and `score` from `checks`.
    pub fn from_checks(model_id: impl Into<String>, checks: Vec<FileCheck>) -> Self {
        let passed = checks.iter().filter(|c| c.passed).count();
        let total = checks.len();
        Self {
            model_id: model_id.into(),
            all_passed: total > 0 && passed == total,
            score: if total > 0 {
                passed as f64 / total as f64
            } else {
                0.0
            },
            checks,
        }
    }

    /// Four failed checks for a workspace that was never verified.
    pub fn not_run(model_id: impl Into<String>, reason: &str) -> Self {
        let checks = CheckKind::ALL
            .iter()
            .map(|kind| FileCheck::new(*kind).with_details(format!("Not verified: {}", reason)))
            .collect();
        Self::from_checks(model_id, checks)
    }

    /// Looks up a check by kind.
    pub fn check(&self, kind: CheckKind) -> Option<&FileCheck> {
        self.checks.iter().find(|c| c.kind == kind)
    }

    /// Number of passed checks.
    pub fn passed_count(&self) -> usize {
        self.checks.iter().filter(|c| c.passed).count()
    }

    /// One-line summary, e.g. `3/4 checks passed (score: 75%)`.
    pub fn summary(&self) -> String {
        format!(
            "{}/{} checks passed (score: {:.0}%)",
            self.passed_count(),
            self.checks.len(),
            self.score * 100.0
        )
    }
}

/// How a finished trial is treated by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialClass {
    /// Tooling or transport failed. Eligible for retry.
    Infrastructure,
    /// Every turn went through. Accepted whatever the score.
    Behavioral,
}

impl fmt::Display for TrialClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrialClass::Infrastructure => write!(f, "infrastructure"),
            TrialClass::Behavioral => write!(f, "behavioral"),
        }
    }
}

/// One trial: the conversation and the verification of what it left behind.
/// Immutable once produced; a retry yields a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub conversation: ConversationResult,
    pub verification: VerificationResult,
}

impl RunRecord {
    pub fn new(conversation: ConversationResult, verification: VerificationResult) -> Self {
        Self {
            conversation,
            verification,
        }
    }

    /// Infrastructure iff the conversation carries an error or any turn
    /// failed. The verification score plays no part.
    pub fn classify(&self) -> TrialClass {
        if self.conversation.error.is_some() || self.conversation.has_failed_turn() {
            TrialClass::Infrastructure
        } else {
            TrialClass::Behavioral
        }
    }

    pub fn score(&self) -> f64 {
        self.verification.score
    }

    pub fn duration(&self) -> Duration {
        self.conversation.total_duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(kind: CheckKind, passed: bool) -> FileCheck {
        FileCheck {
            passed,
            ..FileCheck::new(kind)
        }
    }

    #[test]
    fn test_score_is_passed_over_total() {
        let result = VerificationResult::from_checks(
            "m",
            vec![
                check(CheckKind::Trigger, true),
                check(CheckKind::Identity, false),
                check(CheckKind::User, true),
                check(CheckKind::Persona, true),
            ],
        );
        assert_eq!(result.score, 0.75);
        assert!(!result.all_passed);
        assert_eq!(result.summary(), "3/4 checks passed (score: 75%)");
    }

    #[test]
    fn test_not_run_has_four_failed_checks() {
        let result = VerificationResult::not_run("m", "provisioning failed");
        assert_eq!(result.checks.len(), 4);
        assert_eq!(result.score, 0.0);
        assert!(!result.all_passed);
        assert_eq!(
            result.check(CheckKind::Persona).unwrap().details,
            "Not verified: provisioning failed"
        );
    }

    #[test]
    fn test_empty_checks_score_zero() {
        let result = VerificationResult::from_checks("m", Vec::new());
        assert_eq!(result.score, 0.0);
        assert!(!result.all_passed);
    }

    #[test]
    fn test_classify_behavioral_despite_zero_score() {
        let mut conversation = ConversationResult::new("m");
        conversation
            .turns
            .push(ConversationTurn::succeeded("p", "ok", Duration::from_secs(1)));
        let record = RunRecord::new(conversation, VerificationResult::not_run("m", "x"));
        assert_eq!(record.score(), 0.0);
        assert_eq!(record.classify(), TrialClass::Behavioral);
    }

    #[test]
    fn test_classify_infrastructure() {
        let mut conversation = ConversationResult::new("m");
        conversation
            .turns
            .push(ConversationTurn::failed("p", "", Duration::ZERO, "boom"));
        let record = RunRecord::new(conversation, VerificationResult::not_run("m", "x"));
        assert_eq!(record.classify(), TrialClass::Infrastructure);

        let record = RunRecord::new(
            ConversationResult::failed("m", "onboard failed"),
            VerificationResult::not_run("m", "x"),
        );
        assert_eq!(record.classify(), TrialClass::Infrastructure);
    }

    #[test]
    fn test_check_kind_names() {
        assert_eq!(CheckKind::Trigger.filename(), "BOOTSTRAP.md");
        assert_eq!(CheckKind::Persona.label(), "persona");
        assert_eq!(CheckKind::User.to_string(), "USER.md");
        assert_eq!(TrialClass::Behavioral.to_string(), "behavioral");
    }
}
