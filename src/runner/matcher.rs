//! Field matching for agent-written markdown.
//!
//! Each expected `key = value` pair is looked up through a chain of
//! strategies, tried in order, first hit wins:
//!
//! 1. [`LiteralMatcher`]: the expected value appears anywhere in the file.
//! 2. [`StructuredLineMatcher`]: a `- **Key:** value` bullet line.
//! 3. [`ProseMatcher`]: loose phrases like "my name is X".
//!
//! All comparisons are case-insensitive. A value only counts when it is
//! not one of the template [placeholders](is_placeholder).

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, OnceLock, PoisonError};

use regex::Regex;

/// Template placeholder text, compared after [`normalize_value`].
const PLACEHOLDERS: &[&str] = &[
    "",
    "(optional)",
    "pick something you like",
    "ai? robot? familiar? ghost in the machine? something weirder?",
    "how do you come across? sharp? warm? chaotic? calm?",
    "your signature \u{2014} pick one that feels right",
    "your signature - pick one that feels right",
    "workspace-relative path, http(s) url, or data uri",
];

/// Alternate phrasings accepted in place of a field key.
fn aliases_for(key: &str) -> &'static [&'static str] {
    match key {
        "name" => &["what to call them"],
        "timezone" => &["time zone"],
        _ => &[],
    }
}

/// Ordered `key -> expected value` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectedFields {
    fields: Vec<(String, String)>,
}

impl ExpectedFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a field. Keys are stored lower-cased.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields
            .push((key.into().to_lowercase(), value.into()));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// What a matcher is looking for.
#[derive(Debug, Clone, Copy)]
pub struct FieldQuery<'a> {
    /// Lower-cased primary key.
    pub key: &'a str,
    /// Alternate keys tried when the primary one is absent.
    pub aliases: &'a [&'a str],
    /// Value the agent was asked to record.
    pub expected: &'a str,
}

impl<'a> FieldQuery<'a> {
    /// Query for `key` with its standard aliases.
    pub fn new(key: &'a str, expected: &'a str) -> Self {
        Self {
            key,
            aliases: aliases_for(key),
            expected,
        }
    }

    /// Primary key followed by aliases.
    pub fn keys(&self) -> impl Iterator<Item = &'a str> + '_ {
        std::iter::once(self.key).chain(self.aliases.iter().copied())
    }

    fn accepts_key(&self, candidate: &str) -> bool {
        self.keys().any(|k| k == candidate)
    }
}

/// A single field-lookup strategy.
pub trait FieldMatcher: Send + Sync {
    /// Strategy name, recorded alongside hits.
    fn name(&self) -> &'static str;

    /// Returns the value found for `query`, if any. Implementations must
    /// not return placeholders.
    fn find(&self, content: &str, query: &FieldQuery<'_>) -> Option<String>;
}

/// A successful lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMatch {
    pub value: String,
    pub matcher: &'static str,
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

fn md_markers_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[*_\s]+|[*_\s]+$").expect("markdown marker regex is valid"))
}

/// Strips surrounding markdown emphasis and parenthetical wrappers, then
/// trims. Case is preserved.
pub fn clean_value(raw: &str) -> String {
    let stripped = md_markers_regex().replace_all(raw, "");
    let unwrapped = stripped.trim_matches(|c| c == '(' || c == ')');
    md_markers_regex().replace_all(unwrapped, "").trim().to_string()
}

/// Canonical form used for placeholder comparison.
pub fn normalize_value(raw: &str) -> String {
    clean_value(raw).to_lowercase()
}

fn placeholder_set() -> &'static HashSet<String> {
    static SET: OnceLock<HashSet<String>> = OnceLock::new();
    SET.get_or_init(|| PLACEHOLDERS.iter().map(|p| normalize_value(p)).collect())
}

/// True if `value` is empty or still template text.
pub fn is_placeholder(value: &str) -> bool {
    placeholder_set().contains(&normalize_value(value))
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Case-insensitive substring search for the expected value.
#[derive(Debug, Default, Clone, Copy)]
pub struct LiteralMatcher;

impl FieldMatcher for LiteralMatcher {
    fn name(&self) -> &'static str {
        "literal"
    }

    fn find(&self, content: &str, query: &FieldQuery<'_>) -> Option<String> {
        let expected = query.expected.trim();
        if is_placeholder(expected) {
            return None;
        }
        content
            .to_lowercase()
            .contains(&expected.to_lowercase())
            .then(|| expected.to_string())
    }
}

fn bullet_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[-*+]\s*[*_]{0,2}\s*(\w[\w\s]*?)\s*[*_]{0,2}\s*:\s*(.*)$")
            .expect("bullet regex is valid")
    })
}

fn list_item_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[-*+]\s").expect("list item regex is valid"))
}

/// `- **Key:** value` bullets. When the value on the key line is empty or a
/// placeholder, the next non-bullet line is tried as a continuation.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredLineMatcher;

impl StructuredLineMatcher {
    fn continuation(next: Option<&&str>) -> Option<String> {
        let line = next?.trim();
        if line.is_empty() || line.starts_with('#') || list_item_regex().is_match(line) {
            return None;
        }
        Some(clean_value(line))
    }
}

impl FieldMatcher for StructuredLineMatcher {
    fn name(&self) -> &'static str {
        "structured"
    }

    fn find(&self, content: &str, query: &FieldQuery<'_>) -> Option<String> {
        let lines: Vec<&str> = content.lines().collect();
        for (idx, raw) in lines.iter().enumerate() {
            let Some(caps) = bullet_regex().captures(raw.trim()) else {
                continue;
            };
            if !query.accepts_key(&caps[1].trim().to_lowercase()) {
                continue;
            }
            let value = clean_value(&caps[2]);
            if !is_placeholder(&value) {
                return Some(value);
            }
            if let Some(next) = Self::continuation(lines.get(idx + 1)) {
                if !is_placeholder(&next) {
                    return Some(next);
                }
            }
        }
        None
    }
}

fn sentence_end_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[,;!]|\.(\s|$)").expect("sentence end regex is valid"))
}

/// `<key> is <value>`, `<key>: <value>` or `<key> = <value>`, compiled once
/// per key.
fn key_pattern(key: &str) -> Regex {
    static CACHE: OnceLock<Mutex<HashMap<String, Regex>>> = OnceLock::new();
    let mut cache = CACHE
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    cache
        .entry(key.to_string())
        .or_insert_with(|| {
            let escaped = regex::escape(key).replace(' ', r"\s+");
            Regex::new(&format!(
                r"(?im)(?:^|[^\w]){}[ \t]*[*_]{{0,2}}[ \t]*(?:is[ \t]|:|=)[ \t]*(.+)$",
                escaped
            ))
            .expect("escaped key pattern is valid")
        })
        .clone()
}

fn compile_all(sources: &[&str]) -> Vec<Regex> {
    sources
        .iter()
        .map(|s| Regex::new(s).expect("prose phrase regex is valid"))
        .collect()
}

/// Field-specific phrases tried after the key patterns.
fn phrase_patterns(key: &str) -> &'static [Regex] {
    static NAME: OnceLock<Vec<Regex>> = OnceLock::new();
    static TIMEZONE: OnceLock<Vec<Regex>> = OnceLock::new();
    match key {
        "name" => NAME.get_or_init(|| {
            compile_all(&[
                r"(?im)\bmy\s+name\s+is\s+(.+)$",
                r"(?im)\bcall\s+me\s+(.+)$",
                r"(?im)\bI['\u{2019}]m\s+(.+)$",
            ])
        }),
        "timezone" => TIMEZONE.get_or_init(|| compile_all(&[r"(?im)\btime\s*zone\s+is\s+(.+)$"])),
        _ => &[],
    }
}

/// Loosely anchored phrases: `<key> is <value>`, `<key>: <value>`, plus
/// "my name is", "call me", "I'm" for names and "time zone is" for
/// time zones.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProseMatcher;

impl ProseMatcher {
    fn patterns(query: &FieldQuery<'_>) -> Vec<Regex> {
        query
            .keys()
            .map(key_pattern)
            .chain(phrase_patterns(query.key).iter().cloned())
            .collect()
    }

    fn extract(rest: &str) -> Option<String> {
        // Reject whole-line template text before cutting at punctuation,
        // otherwise "AI? robot? ..." would yield "AI".
        if is_placeholder(rest) {
            return None;
        }
        let cut = match sentence_end_regex().find(rest) {
            Some(m) => &rest[..m.start()],
            None => rest,
        };
        let value = clean_value(cut);
        (!is_placeholder(&value)).then_some(value)
    }
}

impl FieldMatcher for ProseMatcher {
    fn name(&self) -> &'static str {
        "prose"
    }

    fn find(&self, content: &str, query: &FieldQuery<'_>) -> Option<String> {
        for re in Self::patterns(query) {
            for caps in re.captures_iter(content) {
                if let Some(value) = caps.get(1).and_then(|m| Self::extract(m.as_str())) {
                    return Some(value);
                }
            }
        }
        None
    }
}

/// Ordered list of strategies.
pub struct MatcherChain {
    matchers: Vec<Box<dyn FieldMatcher>>,
}

impl Default for MatcherChain {
    fn default() -> Self {
        Self::standard()
    }
}

impl MatcherChain {
    /// Literal, then structured line, then prose.
    pub fn standard() -> Self {
        Self {
            matchers: vec![
                Box::new(LiteralMatcher),
                Box::new(StructuredLineMatcher),
                Box::new(ProseMatcher),
            ],
        }
    }

    /// An empty chain. Add strategies with [`MatcherChain::with_matcher`].
    pub fn empty() -> Self {
        Self {
            matchers: Vec::new(),
        }
    }

    pub fn with_matcher(mut self, matcher: impl FieldMatcher + 'static) -> Self {
        self.matchers.push(Box::new(matcher));
        self
    }

    /// Runs the strategies in order and returns the first acceptable hit.
    pub fn find(&self, content: &str, query: &FieldQuery<'_>) -> Option<FieldMatch> {
        self.matchers.iter().find_map(|m| {
            m.find(content, query)
                .filter(|value| !is_placeholder(value))
                .map(|value| FieldMatch {
                    value,
                    matcher: m.name(),
                })
        })
    }
}

impl std::fmt::Debug for MatcherChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.matchers.iter().map(|m| m.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn find(content: &str, key: &str, expected: &str) -> Option<FieldMatch> {
        MatcherChain::standard().find(content, &FieldQuery::new(key, expected))
    }

    #[test]
    fn test_placeholders_are_normalized() {
        assert!(is_placeholder(""));
        assert!(is_placeholder("   "));
        assert!(is_placeholder("_(optional)_"));
        assert!(is_placeholder("_(pick something you like)_"));
        assert!(is_placeholder("**Pick Something You Like**"));
        assert!(is_placeholder("(your signature - pick one that feels right)"));
        assert!(!is_placeholder("Coral"));
    }

    #[test]
    fn test_literal_hit_is_case_insensitive() {
        let hit = find("I am CORAL the lobster", "name", "Coral").unwrap();
        assert_eq!(hit.matcher, "literal");
        assert_eq!(hit.value, "Coral");
    }

    #[test]
    fn test_structured_line_with_bold_key() {
        let content = "# IDENTITY\n\n- **Name:** Shelly\n- **Creature:** crab\n";
        let hit = find(content, "name", "Coral").unwrap();
        assert_eq!(hit.matcher, "structured");
        assert_eq!(hit.value, "Shelly");
    }

    #[test]
    fn test_structured_line_continuation() {
        let content = "- **Name:**\n  _Shelly_\n- **Vibe:** calm\n";
        let hit = find(content, "name", "Coral").unwrap();
        assert_eq!(hit.value, "Shelly");
    }

    #[test]
    fn test_placeholder_continuation_is_not_found() {
        let content = "- **Name:**\n  _(pick something you like)_\n";
        assert!(find(content, "name", "Coral").is_none());
    }

    #[test]
    fn test_placeholder_inline_is_not_found() {
        let content = "- **Creature:** _(AI? robot? familiar? ghost in the machine? something weirder?)_\n";
        assert!(find(content, "creature", "space lobster").is_none());
    }

    #[test]
    fn test_next_bullet_is_not_a_continuation() {
        let content = "- **Name:**\n- **Timezone:** UTC\n";
        assert!(find(content, "name", "Alex").is_none());
    }

    #[test]
    fn test_user_name_alias() {
        let content = "- **What to call them:** Sam\n";
        let hit = find(content, "name", "Alex").unwrap();
        assert_eq!(hit.value, "Sam");
    }

    #[test]
    fn test_prose_name_phrases() {
        assert_eq!(find("Hello! My name is Pip, nice to meet you.", "name", "Coral").unwrap().value, "Pip");
        assert_eq!(find("You can call me Pip; I'm new here.", "name", "Coral").unwrap().value, "Pip");
        assert_eq!(find("I'm Pip. I live in a shell.", "name", "Coral").unwrap().value, "Pip");
    }

    #[test]
    fn test_prose_timezone() {
        let hit = find("Their time zone is America/New_York.", "timezone", "Europe/Rome").unwrap();
        assert_eq!(hit.matcher, "prose");
        assert_eq!(hit.value, "America/New_York");
    }

    #[test]
    fn test_prose_key_is_value() {
        let hit = find("The vibe is chill, mostly.", "vibe", "warm").unwrap();
        assert_eq!(hit.value, "chill");
    }

    #[test]
    fn test_prose_ignores_key_inside_word() {
        assert!(find("username: root", "name", "Alex").is_none());
    }

    #[test]
    fn test_literal_value_inside_placeholder_text_counts_as_found() {
        // "warm" is a legitimate expected vibe but also appears in the vibe
        // placeholder prompt. The literal tier runs first and accepts it.
        let content = "- **Vibe:**\n  _(how do you come across? sharp? warm? chaotic? calm?)_\n";
        let hit = find(content, "vibe", "warm").unwrap();
        assert_eq!(hit.matcher, "literal");
    }

    #[test]
    fn test_value_inside_other_fields_placeholder_counts_as_found() {
        // Untouched template: the name line is still a placeholder, but the
        // expected name "Ghost" occurs in the creature prompt. The literal
        // tier does not look at which line it hit, so the field is found.
        let content = "- **Name:**\n  _(pick something you like)_\n- **Creature:**\n  _(AI? robot? familiar? ghost in the machine? something weirder?)_\n";
        let hit = find(content, "name", "Ghost").unwrap();
        assert_eq!(hit.matcher, "literal");
        assert_eq!(hit.value, "Ghost");

        // Without the literal tier the same file yields nothing.
        let structured_only = MatcherChain::empty()
            .with_matcher(StructuredLineMatcher)
            .with_matcher(ProseMatcher);
        assert!(structured_only
            .find(content, &FieldQuery::new("name", "Ghost"))
            .is_none());
    }

    #[test]
    fn test_prose_is_must_stand_alone() {
        assert!(find("The vibe isn't set yet.", "vibe", "warm").is_none());
        assert_eq!(find("vibe = mellow", "vibe", "warm").unwrap().value, "mellow");
    }

    #[test]
    fn test_key_patterns_are_reused() {
        let first = key_pattern("time zone");
        let second = key_pattern("time zone");
        assert_eq!(first.as_str(), second.as_str());
        assert!(first.is_match("Their time  zone: UTC"));
    }

    #[test]
    fn test_expected_placeholder_never_matches_literally() {
        assert!(LiteralMatcher
            .find("(optional)", &FieldQuery::new("name", "(optional)"))
            .is_none());
    }

    #[test]
    fn test_custom_chain_order() {
        let chain = MatcherChain::empty().with_matcher(ProseMatcher);
        let hit = chain
            .find("My name is Coral.", &FieldQuery::new("name", "Coral"))
            .unwrap();
        assert_eq!(hit.matcher, "prose");
        assert_eq!(format!("{:?}", chain), "[\"prose\"]");
    }

    #[test]
    fn test_expected_fields_order_and_lookup() {
        let fields = ExpectedFields::new().with("Name", "Coral").with("emoji", "x");
        assert_eq!(fields.len(), 2);
        assert_eq!(fields.get("name"), Some("Coral"));
        assert_eq!(fields.get("vibe"), None);
        let keys: Vec<_> = fields.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["name", "emoji"]);
    }
}
