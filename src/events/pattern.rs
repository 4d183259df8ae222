//! Pattern matching for `hears` listeners.
//!
//! String patterns compile to case-insensitive regexes at registration
//! time, so a bad pattern fails when the listener is added rather than when
//! the first message arrives. Precompiled `Regex` values are used as given.

use regex::{Regex, RegexBuilder};

use crate::error::PatternError;

/// A single compiled pattern.
#[derive(Debug, Clone)]
pub struct Pattern {
    regex: Regex,
}

impl Pattern {
    /// Compile `pattern` as a case-insensitive regex.
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|source| PatternError::Invalid {
                pattern: pattern.to_string(),
                source,
            })?;
        Ok(Self { regex })
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    /// Capture groups of the first match; index 0 is the whole match.
    pub fn captures(&self, text: &str) -> Option<Vec<Option<String>>> {
        self.regex.captures(text).map(|caps| {
            caps.iter()
                .map(|m| m.map(|m| m.as_str().to_string()))
                .collect()
        })
    }
}

impl From<Regex> for Pattern {
    fn from(regex: Regex) -> Self {
        Self { regex }
    }
}

/// Anything that can become a list of patterns.
pub trait IntoPatterns {
    fn into_patterns(self) -> Result<Vec<Pattern>, PatternError>;
}

impl IntoPatterns for &str {
    fn into_patterns(self) -> Result<Vec<Pattern>, PatternError> {
        Ok(vec![Pattern::new(self)?])
    }
}

impl IntoPatterns for String {
    fn into_patterns(self) -> Result<Vec<Pattern>, PatternError> {
        self.as_str().into_patterns()
    }
}

impl IntoPatterns for &[&str] {
    fn into_patterns(self) -> Result<Vec<Pattern>, PatternError> {
        self.iter().map(|p| Pattern::new(p)).collect()
    }
}

impl<const N: usize> IntoPatterns for [&str; N] {
    fn into_patterns(self) -> Result<Vec<Pattern>, PatternError> {
        self.as_slice().into_patterns()
    }
}

impl IntoPatterns for Vec<&str> {
    fn into_patterns(self) -> Result<Vec<Pattern>, PatternError> {
        self.as_slice().into_patterns()
    }
}

impl IntoPatterns for Vec<String> {
    fn into_patterns(self) -> Result<Vec<Pattern>, PatternError> {
        self.iter().map(|p| Pattern::new(p)).collect()
    }
}

impl IntoPatterns for Regex {
    fn into_patterns(self) -> Result<Vec<Pattern>, PatternError> {
        Ok(vec![self.into()])
    }
}

impl IntoPatterns for Vec<Regex> {
    fn into_patterns(self) -> Result<Vec<Pattern>, PatternError> {
        Ok(self.into_iter().map(Pattern::from).collect())
    }
}

impl IntoPatterns for Pattern {
    fn into_patterns(self) -> Result<Vec<Pattern>, PatternError> {
        Ok(vec![self])
    }
}

impl IntoPatterns for Vec<Pattern> {
    fn into_patterns(self) -> Result<Vec<Pattern>, PatternError> {
        Ok(self)
    }
}

/// Which message field a pattern matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchField {
    Body,
    Subject,
}

/// A successful `hears` test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HearMatch {
    pub field: MatchField,
    /// Source of the pattern that matched.
    pub pattern: String,
    /// Capture groups; index 0 is the whole match.
    pub captures: Vec<Option<String>>,
}

impl HearMatch {
    /// The matched text.
    pub fn matched(&self) -> &str {
        self.captures
            .first()
            .and_then(|c| c.as_deref())
            .unwrap_or("")
    }

    /// Capture group `i`, if it participated in the match.
    pub fn group(&self, i: usize) -> Option<&str> {
        self.captures.get(i).and_then(|c| c.as_deref())
    }
}

/// Patterns for the body and the subject of a message.
///
/// Built from a plain list, both fields share the same patterns.
#[derive(Debug, Clone, Default)]
pub struct Patterns {
    pub body: Vec<Pattern>,
    pub subject: Vec<Pattern>,
}

impl Patterns {
    /// Same patterns for body and subject.
    pub fn any(patterns: impl IntoPatterns) -> Result<Self, PatternError> {
        let patterns = patterns.into_patterns()?;
        Ok(Self {
            body: patterns.clone(),
            subject: patterns,
        })
    }

    /// Separate body and subject patterns.
    pub fn split(
        body: impl IntoPatterns,
        subject: impl IntoPatterns,
    ) -> Result<Self, PatternError> {
        Ok(Self {
            body: body.into_patterns()?,
            subject: subject.into_patterns()?,
        })
    }

    pub fn body_only(body: impl IntoPatterns) -> Result<Self, PatternError> {
        Ok(Self {
            body: body.into_patterns()?,
            subject: Vec::new(),
        })
    }

    pub fn subject_only(subject: impl IntoPatterns) -> Result<Self, PatternError> {
        Ok(Self {
            body: Vec::new(),
            subject: subject.into_patterns()?,
        })
    }

    /// Test `text` against the body patterns. Any match wins.
    pub fn match_text(&self, text: &str) -> Option<HearMatch> {
        first_match(&self.body, text, MatchField::Body)
    }

    /// Body patterns against `body`, then subject patterns against `subject`.
    pub fn match_email(&self, body: &str, subject: &str) -> Option<HearMatch> {
        first_match(&self.body, body, MatchField::Body)
            .or_else(|| first_match(&self.subject, subject, MatchField::Subject))
    }
}

fn first_match(patterns: &[Pattern], text: &str, field: MatchField) -> Option<HearMatch> {
    patterns.iter().find_map(|p| {
        p.captures(text).map(|captures| HearMatch {
            field,
            pattern: p.as_str().to_string(),
            captures,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_patterns_are_case_insensitive() {
        let p = Pattern::new("hello").unwrap();
        assert!(p.is_match("HeLLo there"));
    }

    #[test]
    fn bad_pattern_fails_at_compile_time() {
        let err = Pattern::new("+").unwrap_err();
        assert!(matches!(err, PatternError::Invalid { ref pattern, .. } if pattern == "+"));
        assert!(["ok", "("].into_patterns().is_err());
    }

    #[test]
    fn precompiled_regex_used_as_given() {
        let p: Pattern = Regex::new("Hello").unwrap().into();
        assert!(p.is_match("Hello"));
        assert!(!p.is_match("hello"));
    }

    #[test]
    fn any_pattern_matching_wins() {
        let patterns = Patterns::any(["low", "[aeiou]"]).unwrap();
        let m = patterns.match_text("hello world").unwrap();
        assert_eq!(m.pattern, "[aeiou]");
        assert_eq!(m.matched(), "e");
        assert!(patterns.match_text("rhythm").is_none());
    }

    #[test]
    fn captures_are_reported() {
        let patterns = Patterns::any(r"my name is (\w+)").unwrap();
        let m = patterns.match_text("Hi, my name is Alice").unwrap();
        assert_eq!(m.group(1), Some("Alice"));
        assert_eq!(m.field, MatchField::Body);
    }

    #[test]
    fn email_matches_body_or_subject() {
        let patterns = Patterns::any(["hello", "hi"]).unwrap();
        assert_eq!(
            patterns.match_email("nope", "hello there").unwrap().field,
            MatchField::Subject
        );
        assert_eq!(
            patterns.match_email("hi bot", "whatever").unwrap().field,
            MatchField::Body
        );
        assert!(patterns.match_email("nope", "nada").is_none());
    }

    #[test]
    fn empty_field_list_never_matches() {
        let patterns = Patterns::subject_only("invoice").unwrap();
        assert!(patterns.match_email("invoice attached", "hello").is_none());
        assert!(patterns.match_email("hello", "Invoice #4").is_some());
        assert!(Patterns::default().match_email("a", "b").is_none());
    }
}
