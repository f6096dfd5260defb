//! Prompt matchers.
//!
//! Patterns are written in POSIX basic regular expression syntax, the way
//! `grep` and `sed` read them: `\(` `\)` `\{` `\}` `\|` `\+` `\?` are operators
//! and their unescaped forms are plain characters. They are translated into
//! the `regex` crate's syntax and matched against raw bytes.

use crate::error::{Error, Result};
use regex::bytes::{Regex, RegexBuilder};

/// A compiled prompt pattern, matched against the tail of the PTY output.
#[derive(Debug, Clone)]
pub struct PromptMatcher {
    pattern: String,
    regex: Regex,
}

impl PromptMatcher {
    /// Compile a basic regular expression, optionally ignoring ASCII case.
    pub fn compile(pattern: &str, ignore_case: bool) -> Result<Self> {
        let translated = translate_bre(pattern);
        let regex = RegexBuilder::new(&translated)
            .case_insensitive(ignore_case)
            .unicode(false)
            .build()
            .map_err(|e| Error::Usage(format!("invalid regular expression `{pattern}`: {e}")))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    /// The pattern as the user wrote it.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Offset just past the first match in `haystack`, if any.
    pub fn find_end(&self, haystack: &[u8]) -> Option<usize> {
        self.regex.find(haystack).map(|m| m.end())
    }
}

/// Rewrite a POSIX basic regular expression into `regex` crate syntax.
fn translate_bre(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() + 8);
    // True where a `*` or `^` would open a new expression.
    let mut at_start = true;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        match ch {
            '\\' if i + 1 < chars.len() => {
                let next = chars[i + 1];
                i += 2;
                match next {
                    '(' | '|' => {
                        out.push(next);
                        at_start = true;
                        continue;
                    }
                    ')' | '{' | '}' | '+' | '?' => out.push(next),
                    '<' | '>' => out.push_str(r"\b"),
                    _ => {
                        out.push('\\');
                        out.push(next);
                    }
                }
            }
            '\\' => {
                out.push_str(r"\\");
                i += 1;
            }
            '[' => {
                i = copy_bracket(&chars, i, &mut out);
            }
            '(' | ')' | '{' | '}' | '|' | '+' | '?' => {
                out.push('\\');
                out.push(ch);
                i += 1;
            }
            '*' if at_start => {
                out.push_str(r"\*");
                i += 1;
            }
            '^' if !at_start => {
                out.push_str(r"\^");
                i += 1;
            }
            '$' if !at_expression_end(&chars, i + 1) => {
                out.push_str(r"\$");
                i += 1;
            }
            _ => {
                out.push(ch);
                i += 1;
            }
        }
        at_start = ch == '^' && at_start;
    }
    out
}

/// True when position `i` ends the pattern or a `\)` / `\|` group.
fn at_expression_end(chars: &[char], i: usize) -> bool {
    i >= chars.len() || (chars[i] == '\\' && matches!(chars.get(i + 1), Some(')') | Some('|')))
}

/// Copy a bracket expression starting at `start` and return the index after it.
///
/// Backslashes are literal inside POSIX brackets, so they get escaped, and so
/// do the characters the `regex` crate treats as class set operators.
fn copy_bracket(chars: &[char], start: usize, out: &mut String) -> usize {
    let mut i = start + 1;
    let mut body = String::new();

    if chars.get(i) == Some(&'^') {
        body.push('^');
        i += 1;
    }
    if chars.get(i) == Some(&']') {
        body.push_str(r"\]");
        i += 1;
    }
    while i < chars.len() {
        match chars[i] {
            ']' => {
                out.push('[');
                out.push_str(&body);
                out.push(']');
                return i + 1;
            }
            '[' if matches!(chars.get(i + 1), Some(':') | Some('=') | Some('.')) => {
                let delim = chars[i + 1];
                let close = (i + 2..chars.len().saturating_sub(1))
                    .find(|&j| chars[j] == delim && chars[j + 1] == ']');
                match close {
                    Some(j) => {
                        body.extend(&chars[i..j + 2]);
                        i = j + 2;
                    }
                    None => {
                        body.push_str(r"\[");
                        i += 1;
                    }
                }
            }
            c @ ('\\' | '[' | '&' | '~') => {
                body.push('\\');
                body.push(c);
                i += 1;
            }
            c => {
                body.push(c);
                i += 1;
            }
        }
    }

    // Unterminated bracket: treat the `[` as a literal character.
    out.push_str(r"\[");
    start + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_PROMPT, DEFAULT_YESNO};

    #[test]
    fn test_translate_interval_and_groups() {
        assert_eq!(translate_bre(r"a\{0,1\}"), "a{0,1}");
        assert_eq!(translate_bre(r"\(ab\)\|c"), "(ab)|c");
        assert_eq!(translate_bre("(yes/no)?"), r"\(yes/no\)\?");
    }

    #[test]
    fn test_translate_anchors() {
        assert_eq!(translate_bre("^abc$"), "^abc$");
        assert_eq!(translate_bre("a^b$c"), r"a\^b\$c");
        assert_eq!(translate_bre("*star"), r"\*star");
        assert_eq!(translate_bre("^*star"), r"^\*star");
    }

    #[test]
    fn test_translate_brackets() {
        assert_eq!(translate_bre("[Pp]"), "[Pp]");
        assert_eq!(translate_bre(r"[\]"), r"[\\]");
        assert_eq!(translate_bre("[]a]"), r"[\]a]");
        assert_eq!(translate_bre("[[:digit:]]"), "[[:digit:]]");
        assert_eq!(translate_bre("[a"), r"\[a");
    }

    #[test]
    fn test_default_prompt_matches() {
        let m = PromptMatcher::compile(DEFAULT_PROMPT, false).unwrap();
        assert_eq!(m.find_end(b"user@host's password: "), Some(22));
        assert_eq!(m.find_end(b"Password:"), Some(9));
        assert!(m.find_end(b"Password: \r\n$ ").is_none());
        assert!(m.find_end(b"PASSWORD: ").is_none());
    }

    #[test]
    fn test_ignore_case() {
        let m = PromptMatcher::compile(DEFAULT_PROMPT, true).unwrap();
        assert!(m.find_end(b"PASSWORD: ").is_some());
    }

    #[test]
    fn test_default_yesno_matches() {
        let m = PromptMatcher::compile(DEFAULT_YESNO, false).unwrap();
        let text = b"Are you sure you want to continue connecting (yes/no)? ";
        assert_eq!(m.find_end(text), Some(text.len()));
        assert!(m.find_end(b"(yes/no) ").is_none());
    }

    #[test]
    fn test_matches_bytes_with_high_bit() {
        let m = PromptMatcher::compile(DEFAULT_PROMPT, false).unwrap();
        assert!(m.find_end(b"\xff\xffpassword: ").is_some());
    }

    #[test]
    fn test_invalid_pattern_is_usage_error() {
        let err = PromptMatcher::compile(r"a\{2,1\}", false).unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_USAGE);
    }
}
