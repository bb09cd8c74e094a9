//! Ignore pattern matching for `.stignore` files
//!
//! Line format: glob patterns, one per line. `//` starts a comment, `!`
//! negates, `(?i)` makes the pattern case-insensitive, a leading `/`
//! anchors the pattern to the folder root. A pattern without a slash
//! matches at any depth. Evaluation is first match wins.

use std::path::Path;

use globset::{GlobBuilder, GlobMatcher};

/// The default ignore file name inside a folder root.
pub const IGNORE_FILE: &str = ".stignore";

struct Rule {
    negated: bool,
    /// Matches the path itself
    matcher: GlobMatcher,
    /// Matches anything below a matched directory
    child_matcher: GlobMatcher,
}

/// Compiled ignore patterns for one folder.
#[derive(Default)]
pub struct IgnoreMatcher {
    rules: Vec<Rule>,
}

impl IgnoreMatcher {
    /// An empty matcher ignoring nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse pattern text.
    ///
    /// # Errors
    /// Returns an error for a glob that fails to compile.
    pub fn parse(text: &str) -> color_eyre::Result<Self> {
        let mut rules = Vec::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("//") {
                continue;
            }

            let mut pattern = line;
            let mut negated = false;
            let mut case_insensitive = false;

            if let Some(rest) = pattern.strip_prefix('!') {
                negated = true;
                pattern = rest.trim_start();
            }
            if let Some(rest) = pattern.strip_prefix("(?i)") {
                case_insensitive = true;
                pattern = rest;
            }
            if pattern.is_empty() {
                continue;
            }

            // A leading slash anchors to the root; otherwise a slash-free
            // pattern matches at any depth.
            let normalized = if let Some(rest) = pattern.strip_prefix('/') {
                rest.to_string()
            } else if pattern.contains('/') {
                pattern.to_string()
            } else {
                format!("**/{pattern}")
            };

            let compile = |pat: &str| -> color_eyre::Result<GlobMatcher> {
                Ok(GlobBuilder::new(pat)
                    .literal_separator(true)
                    .case_insensitive(case_insensitive)
                    .build()?
                    .compile_matcher())
            };

            rules.push(Rule {
                negated,
                matcher: compile(&normalized)?,
                child_matcher: compile(&format!("{normalized}/**"))?,
            });
        }

        Ok(Self { rules })
    }

    /// Load patterns from a folder's ignore file; a missing file means an
    /// empty matcher.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> color_eyre::Result<Self> {
        if !path.exists() {
            return Ok(Self::empty());
        }
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Whether the folder-relative path is ignored. First matching rule
    /// decides; no rule means not ignored.
    #[must_use]
    pub fn is_ignored(&self, name: &str) -> bool {
        for rule in &self.rules {
            if rule.matcher.is_match(name) || rule.child_matcher.is_match(name) {
                return !rule.negated;
            }
        }
        false
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_globs() {
        let m = IgnoreMatcher::parse("*.log\nbuild\n").unwrap();
        assert!(m.is_ignored("debug.log"));
        assert!(m.is_ignored("sub/dir/trace.log"));
        assert!(m.is_ignored("build"));
        assert!(m.is_ignored("build/output.bin"));
        assert!(!m.is_ignored("readme.md"));
    }

    #[test]
    fn test_comments_and_blanks() {
        let m = IgnoreMatcher::parse("// a comment\n\n*.tmp\n").unwrap();
        assert!(m.is_ignored("x.tmp"));
        assert!(!m.is_ignored("// a comment"));
    }

    #[test]
    fn test_negation_first_match_wins() {
        let m = IgnoreMatcher::parse("!keep.log\n*.log\n").unwrap();
        assert!(!m.is_ignored("keep.log"));
        assert!(m.is_ignored("drop.log"));
    }

    #[test]
    fn test_case_insensitive_flag() {
        let m = IgnoreMatcher::parse("(?i)*.JPG\n").unwrap();
        assert!(m.is_ignored("photo.jpg"));
        assert!(m.is_ignored("PHOTO.JPG"));

        let strict = IgnoreMatcher::parse("*.JPG\n").unwrap();
        assert!(!strict.is_ignored("photo.jpg"));
    }

    #[test]
    fn test_root_anchor() {
        let m = IgnoreMatcher::parse("/target\n").unwrap();
        assert!(m.is_ignored("target"));
        assert!(m.is_ignored("target/debug/app"));
        assert!(!m.is_ignored("sub/target"));
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let m = IgnoreMatcher::load(&dir.path().join(IGNORE_FILE)).unwrap();
        assert!(m.is_empty());
        assert!(!m.is_ignored("anything"));
    }
}
