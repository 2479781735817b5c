//! Post-ritual verification of the agent workspace.
//!
//! After the conversation ends, the verifier inspects the files the ritual
//! is supposed to produce and runs four checks, in order:
//!
//! 1. `BOOTSTRAP.md` must be gone.
//! 2. `IDENTITY.md` must carry the agent's name, creature, vibe and emoji.
//! 3. `USER.md` must carry the user's name and timezone.
//! 4. `SOUL.md` must no longer be the untouched template.
//!
//! Verification only reads the filesystem, so running it twice over the
//! same workspace yields equal results.

use std::fs;
use std::path::Path;

use tracing::{debug, info, warn};

use super::matcher::{ExpectedFields, FieldQuery, MatcherChain};
use super::result::{CheckKind, FileCheck, VerificationResult};

/// Phrases that are all present in the untouched persona template.
pub const PERSONA_SENTINELS: &[&str] = &[
    "Fill this in during your first conversation",
    "You're not a chatbot. You're becoming someone.",
];

/// A persona file longer than this (trimmed, in characters) counts as
/// edited even if every sentinel is still present.
pub const PERSONA_MIN_CHARS: usize = 200;

/// Runs the four workspace checks.
#[derive(Debug)]
pub struct VerificationEngine {
    identity: ExpectedFields,
    user: ExpectedFields,
    chain: MatcherChain,
}

impl VerificationEngine {
    /// Creates an engine with the standard matcher chain.
    pub fn new(identity: ExpectedFields, user: ExpectedFields) -> Self {
        Self {
            identity,
            user,
            chain: MatcherChain::standard(),
        }
    }

    /// Replaces the matcher chain.
    pub fn with_chain(mut self, chain: MatcherChain) -> Self {
        self.chain = chain;
        self
    }

    /// Verifies the workspace at `workspace`.
    pub fn verify(&self, workspace: &Path, model_id: &str) -> VerificationResult {
        info!(model = %model_id, "Verifying workspace {}", workspace.display());

        let checks = vec![
            self.check_trigger_deleted(workspace),
            self.check_fields(workspace, CheckKind::Identity, &self.identity),
            self.check_fields(workspace, CheckKind::User, &self.user),
            self.check_persona(workspace),
        ];

        for check in &checks {
            info!(
                "  {} {}: {}",
                if check.passed { "PASS" } else { "FAIL" },
                check.filename,
                check.details
            );
        }

        let result = VerificationResult::from_checks(model_id, checks);
        info!(model = %model_id, "Verification complete: {}", result.summary());
        result
    }

    fn check_trigger_deleted(&self, workspace: &Path) -> FileCheck {
        let kind = CheckKind::Trigger;
        if !trigger_present(workspace) {
            return FileCheck {
                passed: true,
                ..FileCheck::new(kind).with_details("Deleted")
            };
        }
        let content = match read_file(workspace, kind) {
            WorkspaceFile::Content(content) => content,
            _ => String::new(),
        };
        FileCheck {
            exists: true,
            content,
            ..FileCheck::new(kind).with_details("Still exists; ritual did not complete")
        }
    }

    fn check_fields(&self, workspace: &Path, kind: CheckKind, expected: &ExpectedFields) -> FileCheck {
        let content = match read_file(workspace, kind) {
            WorkspaceFile::Content(content) => content,
            WorkspaceFile::Missing => return FileCheck::new(kind).with_details("File missing"),
            WorkspaceFile::Unreadable(reason) => return unreadable(kind, &reason),
        };

        let mut found = Vec::new();
        let mut missing = Vec::new();
        for (key, value) in expected.iter() {
            match self.chain.find(&content, &FieldQuery::new(key, value)) {
                Some(hit) => {
                    debug!(file = %kind, field = key, matcher = hit.matcher, "Field found: {}", hit.value);
                    found.push(format!("{}={}", key, hit.value));
                }
                None => missing.push(key),
            }
        }

        let mut check = FileCheck {
            exists: true,
            content,
            ..FileCheck::new(kind)
        };
        if missing.is_empty() {
            check.passed = true;
            check.details = format!("All fields set: {}", found.join(", "));
        } else {
            check.details = format!("Missing fields: {}", missing.join(", "));
        }
        check
    }

    fn check_persona(&self, workspace: &Path) -> FileCheck {
        let kind = CheckKind::Persona;
        let content = match read_file(workspace, kind) {
            WorkspaceFile::Content(content) => content,
            WorkspaceFile::Missing => return FileCheck::new(kind).with_details("File missing"),
            WorkspaceFile::Unreadable(reason) => return unreadable(kind, &reason),
        };

        let template_only = PERSONA_SENTINELS.iter().all(|s| content.contains(s));
        let long_enough = content.trim().chars().count() > PERSONA_MIN_CHARS;

        let (passed, details) = if template_only && !long_enough {
            (false, "Still contains only template text".to_string())
        } else {
            (true, format!("Modified ({} chars)", content.chars().count()))
        };

        FileCheck {
            exists: true,
            passed,
            details,
            content,
            ..FileCheck::new(kind)
        }
    }
}

/// True while the trigger file, or anything else at its path, is still in
/// the workspace.
pub fn trigger_present(workspace: &Path) -> bool {
    workspace.join(CheckKind::Trigger.filename()).exists()
}

/// Outcome of reading one workspace file.
#[derive(Debug)]
enum WorkspaceFile {
    Missing,
    Unreadable(String),
    Content(String),
}

/// A failed check for a file that exists but could not be read.
fn unreadable(kind: CheckKind, reason: &str) -> FileCheck {
    FileCheck {
        exists: true,
        ..FileCheck::new(kind).with_details(format!("Unreadable: {}", reason))
    }
}

/// Reads a workspace file. Invalid UTF-8 is replaced rather than rejected.
fn read_file(workspace: &Path, kind: CheckKind) -> WorkspaceFile {
    let path = workspace.join(kind.filename());
    if !path.exists() {
        return WorkspaceFile::Missing;
    }
    match fs::read(&path) {
        Ok(bytes) => WorkspaceFile::Content(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => {
            warn!("Failed to read {}: {}", path.display(), e);
            WorkspaceFile::Unreadable(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::config::BootstrapFields;
    use tempfile::TempDir;

    const IDENTITY_OK: &str = "# IDENTITY.md\n\n- **Name:** Coral\n- **Creature:** space lobster\n- **Vibe:** warm and casual\n- **Emoji:** \u{1f99e}\n";
    const USER_OK: &str = "# USER.md\n\n- **Name:** Alex\n- **Timezone:** Europe/Rome\n";
    const SOUL_TEMPLATE: &str = "# SOUL.md\n\nYou're not a chatbot. You're becoming someone.\n\nFill this in during your first conversation.\n";

    fn engine() -> VerificationEngine {
        let fields = BootstrapFields::default();
        VerificationEngine::new(fields.identity_expected(), fields.user_expected())
    }

    fn write(dir: &TempDir, kind: CheckKind, content: &str) {
        fs::write(dir.path().join(kind.filename()), content).unwrap();
    }

    fn complete_workspace() -> TempDir {
        let dir = TempDir::new().unwrap();
        write(&dir, CheckKind::Identity, IDENTITY_OK);
        write(&dir, CheckKind::User, USER_OK);
        write(&dir, CheckKind::Persona, "# SOUL\n\nI am Coral. I keep things warm.\n");
        dir
    }

    #[test]
    fn test_complete_workspace_scores_one() {
        let dir = complete_workspace();
        let result = engine().verify(dir.path(), "m");
        assert!(result.all_passed, "{:?}", result.checks);
        assert_eq!(result.score, 1.0);
        assert_eq!(result.checks.len(), 4);
        assert_eq!(
            result.checks.iter().map(|c| c.kind).collect::<Vec<_>>(),
            CheckKind::ALL.to_vec()
        );
    }

    #[test]
    fn test_trigger_present_fails_only_that_check() {
        let dir = complete_workspace();
        write(&dir, CheckKind::Trigger, "# BOOTSTRAP\n");
        let result = engine().verify(dir.path(), "m");
        let trigger = result.check(CheckKind::Trigger).unwrap();
        assert!(!trigger.passed);
        assert!(trigger.exists);
        assert_eq!(trigger.content, "# BOOTSTRAP\n");
        assert_eq!(result.score, 0.75);
    }

    #[test]
    fn test_empty_workspace() {
        let dir = TempDir::new().unwrap();
        let result = engine().verify(dir.path(), "m");
        assert_eq!(result.passed_count(), 1);
        assert_eq!(result.check(CheckKind::Identity).unwrap().details, "File missing");
        assert_eq!(result.check(CheckKind::Persona).unwrap().details, "File missing");
    }

    #[test]
    fn test_placeholder_name_reported_missing() {
        let dir = complete_workspace();
        write(
            &dir,
            CheckKind::Identity,
            "- **Name:**\n  _(pick something you like)_\n- **Creature:** space lobster\n- **Vibe:** warm and casual\n- **Emoji:** \u{1f99e}\n",
        );
        let result = engine().verify(dir.path(), "m");
        let identity = result.check(CheckKind::Identity).unwrap();
        assert!(!identity.passed);
        assert_eq!(identity.details, "Missing fields: name");
    }

    #[test]
    fn test_missing_fields_listed_in_order() {
        let dir = complete_workspace();
        write(&dir, CheckKind::User, "# USER.md\n\n- **Notes:** none\n");
        let result = engine().verify(dir.path(), "m");
        assert_eq!(
            result.check(CheckKind::User).unwrap().details,
            "Missing fields: name, timezone"
        );
    }

    #[test]
    fn test_user_alias_and_prose() {
        let dir = complete_workspace();
        write(
            &dir,
            CheckKind::User,
            "- **What to call them:** Sam\n\nTheir time zone is Asia/Tokyo.\n",
        );
        let result = engine().verify(dir.path(), "m");
        let user = result.check(CheckKind::User).unwrap();
        assert!(user.passed, "{}", user.details);
        assert_eq!(user.details, "All fields set: name=Sam, timezone=Asia/Tokyo");
    }

    #[test]
    fn test_persona_length_threshold() {
        let dir = complete_workspace();
        let mut short = SOUL_TEMPLATE.to_string();
        while short.trim().chars().count() < 150 {
            short.push('x');
        }
        write(&dir, CheckKind::Persona, &short);
        let result = engine().verify(dir.path(), "m");
        let persona = result.check(CheckKind::Persona).unwrap();
        assert!(!persona.passed);
        assert_eq!(persona.details, "Still contains only template text");

        let mut long = short.clone();
        while long.trim().chars().count() < 250 {
            long.push('y');
        }
        write(&dir, CheckKind::Persona, &long);
        let result = engine().verify(dir.path(), "m");
        assert!(result.check(CheckKind::Persona).unwrap().passed);
    }

    #[test]
    fn test_persona_without_all_sentinels_passes() {
        let dir = complete_workspace();
        write(&dir, CheckKind::Persona, "Fill this in during your first conversation");
        let result = engine().verify(dir.path(), "m");
        let persona = result.check(CheckKind::Persona).unwrap();
        assert!(persona.passed);
        assert_eq!(persona.details, "Modified (43 chars)");
    }

    #[test]
    fn test_verify_is_repeatable() {
        let dir = complete_workspace();
        write(&dir, CheckKind::Trigger, "still here");
        let engine = engine();
        let first = engine.verify(dir.path(), "m");
        let second = engine.verify(dir.path(), "m");
        assert_eq!(first, second);
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_persona_fails() {
        use std::os::unix::fs::PermissionsExt;

        let dir = complete_workspace();
        let path = dir.path().join(CheckKind::Persona.filename());
        fs::set_permissions(&path, fs::Permissions::from_mode(0o000)).unwrap();
        if fs::read(&path).is_ok() {
            // Privileged users read through mode 000.
            return;
        }

        let result = engine().verify(dir.path(), "m");
        let persona = result.check(CheckKind::Persona).unwrap();
        assert!(!persona.passed);
        assert!(persona.exists);
        assert!(persona.details.starts_with("Unreadable: "), "{}", persona.details);
        assert!(!result.all_passed);
    }

    #[test]
    fn test_directory_in_place_of_files_is_unreadable() {
        let dir = complete_workspace();
        for kind in [CheckKind::Identity, CheckKind::Persona] {
            let path = dir.path().join(kind.filename());
            fs::remove_file(&path).unwrap();
            fs::create_dir(&path).unwrap();
        }

        let result = engine().verify(dir.path(), "m");
        for kind in [CheckKind::Identity, CheckKind::Persona] {
            let check = result.check(kind).unwrap();
            assert!(!check.passed, "{}", kind);
            assert!(check.exists);
            assert!(check.details.starts_with("Unreadable: "), "{}", check.details);
        }
        assert_eq!(result.score, 0.5);
    }

    #[test]
    fn test_trigger_directory_counts_as_present() {
        let dir = complete_workspace();
        fs::create_dir(dir.path().join(CheckKind::Trigger.filename())).unwrap();

        assert!(trigger_present(dir.path()));
        let trigger = engine().verify(dir.path(), "m");
        let trigger = trigger.check(CheckKind::Trigger).unwrap();
        assert!(!trigger.passed);
        assert!(trigger.exists);
        assert!(trigger.content.is_empty());
    }
}
