//! Shell-style glob matching for routing path lists (§4.A), plus a thin
//! wrapper for the full-regex route-queue matcher.

use regex::Regex;

/// Convert a shell-style glob into an anchored regex:
/// `*` → "no `/`", `**` → ".*", `?` → "single non-`/`", other regex
/// metacharacters are escaped.
pub fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2 + 2);
    out.push('^');
    let chars: Vec<char> = glob.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '*' => {
                if i + 1 < chars.len() && chars[i + 1] == '*' {
                    out.push_str(".*");
                    i += 2;
                    continue;
                }
                out.push_str("[^/]*");
            }
            '?' => out.push_str("[^/]"),
            '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            other => out.push(other),
        }
        i += 1;
    }
    out.push('$');
    out
}

/// A compiled glob matcher, anchored end-to-end.
pub struct GlobMatcher {
    regex: Regex,
}

impl GlobMatcher {
    pub fn new(glob: &str) -> Self {
        let pattern = glob_to_regex(glob);
        // A hand-built glob→regex conversion cannot itself fail to compile;
        // unwrap is safe for every `Regex::new` call fed a generated pattern.
        let regex = Regex::new(&pattern).expect("generated glob regex is always valid");
        Self { regex }
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}

/// Returns true if any of the glob patterns in `patterns` matches `path`.
pub fn any_glob_matches(patterns: &[String], path: &str) -> bool {
    patterns.iter().any(|p| GlobMatcher::new(p).matches(path))
}

/// A route-queue matcher compiled once from a full regular expression
/// (§4.A, §3 `RouteQueueConfig.compiledPattern`). Invalid regex produces a
/// matcher that rejects everything rather than failing route-queue
/// construction outright.
pub struct RouteQueueMatcher {
    regex: Option<Regex>,
}

impl RouteQueueMatcher {
    pub fn compile(pattern: &str) -> Self {
        match Regex::new(pattern) {
            Ok(regex) => Self { regex: Some(regex) },
            Err(e) => {
                tracing::warn!(pattern, error = %e, "invalid route queue pattern, queue is unreachable");
                Self { regex: None }
            }
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match &self.regex {
            Some(r) => r.is_match(path),
            None => false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.regex.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_does_not_cross_slash() {
        let m = GlobMatcher::new("/api/*");
        assert!(m.matches("/api/foo"));
        assert!(!m.matches("/api/foo/bar"));
    }

    #[test]
    fn double_star_crosses_slash() {
        let m = GlobMatcher::new("/api/**");
        assert!(m.matches("/api/foo/bar/baz"));
    }

    #[test]
    fn question_mark_is_single_char() {
        let m = GlobMatcher::new("/v?/messages");
        assert!(m.matches("/v1/messages"));
        assert!(!m.matches("/v12/messages"));
    }

    #[test]
    fn metacharacters_are_escaped() {
        let m = GlobMatcher::new("/api/event_logging.json");
        assert!(m.matches("/api/event_logging.json"));
        assert!(!m.matches("/api/event_logging_json"));
    }

    #[test]
    fn anchored_end_to_end() {
        let m = GlobMatcher::new("/status");
        assert!(m.matches("/status"));
        assert!(!m.matches("/status/extra"));
        assert!(!m.matches("/prefix/status"));
    }

    #[test]
    fn any_glob_matches_first_hit() {
        let patterns = vec!["/a/*".to_string(), "/b/*".to_string()];
        assert!(any_glob_matches(&patterns, "/b/x"));
        assert!(!any_glob_matches(&patterns, "/c/x"));
    }

    #[test]
    fn invalid_regex_rejects_everything() {
        let m = RouteQueueMatcher::compile("(unterminated");
        assert!(!m.is_valid());
        assert!(!m.matches("/anything"));
    }

    #[test]
    fn valid_regex_matches_as_expected() {
        let m = RouteQueueMatcher::compile(r"^/v1/messages");
        assert!(m.is_valid());
        assert!(m.matches("/v1/messages"));
        assert!(!m.matches("/v1/other"));
    }
}
