use regex::Regex;

/// Compiled pattern matcher over a single URL component.
///
/// Dispatch order mirrors the rule DSL: an `rx://` prefix compiles the
/// remainder as a regular expression, a pattern whose only `*` is at the end
/// becomes a literal prefix match, any other `*`/`?` becomes a shell-style
/// glob, and everything else matches exactly.
#[derive(Debug, Clone)]
pub enum Matcher {
    Exact(String),
    Prefix(String),
    Glob(Regex),
    Regex(Regex),
}

impl Matcher {
    /// Compile a DSL pattern. An empty pattern means "match anything" and
    /// compiles to `None`.
    pub fn compile(pattern: &str) -> Result<Option<Matcher>, regex::Error> {
        if pattern.is_empty() {
            return Ok(None);
        }
        if let Some(rx) = pattern.strip_prefix("rx://") {
            return Ok(Some(Matcher::Regex(Regex::new(rx)?)));
        }
        if pattern.ends_with('*') && pattern.matches('*').count() == 1 {
            return Ok(Some(Matcher::Prefix(
                pattern[..pattern.len() - 1].to_string(),
            )));
        }
        if pattern.contains(['*', '?']) {
            return Ok(Some(Matcher::Glob(Regex::new(&glob_to_regex(pattern))?)));
        }
        Ok(Some(Matcher::Exact(pattern.to_string())))
    }

    pub fn matches(&self, s: &str) -> bool {
        match self {
            Matcher::Exact(p) => s == p,
            Matcher::Prefix(p) => s.starts_with(p.as_str()),
            Matcher::Glob(re) => re.is_match(s),
            Matcher::Regex(re) => re.is_match(s),
        }
    }
}

/// Translate a glob pattern to an anchored regex. `*` and `?` do not cross
/// path separators.
fn glob_to_regex(pattern: &str) -> String {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            _ => re.push_str(&regex::escape(&ch.to_string())),
        }
    }
    re.push('$');
    re
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_pattern_is_universal() {
        assert!(Matcher::compile("").unwrap().is_none());
    }

    #[test]
    fn test_exact_dispatch() {
        let m = Matcher::compile("api.example.com").unwrap().unwrap();
        assert!(matches!(m, Matcher::Exact(_)));
        assert!(m.matches("api.example.com"));
        assert!(!m.matches("api.example.com.evil"));
        assert!(!m.matches("www.example.com"));
    }

    #[test]
    fn test_trailing_star_is_prefix() {
        let m = Matcher::compile("/api/*").unwrap().unwrap();
        assert!(matches!(m, Matcher::Prefix(_)));
        assert!(m.matches("/api/"));
        assert!(m.matches("/api/users/7"));
        assert!(!m.matches("/apix"));
    }

    #[test]
    fn test_inner_star_is_glob() {
        let m = Matcher::compile("*.example.com").unwrap().unwrap();
        assert!(matches!(m, Matcher::Glob(_)));
        assert!(m.matches("api.example.com"));
        assert!(!m.matches("example.com"));
        // the wildcard is non-recursive over path separators
        let m = Matcher::compile("/static/*.js").unwrap().unwrap();
        assert!(m.matches("/static/app.js"));
        assert!(!m.matches("/static/vendor/app.js"));
    }

    #[test]
    fn test_two_stars_is_glob_not_prefix() {
        let m = Matcher::compile("/v*/users/*").unwrap().unwrap();
        assert!(matches!(m, Matcher::Glob(_)));
        assert!(m.matches("/v1/users/7"));
        assert!(!m.matches("/v1/users/7/avatar"));
    }

    #[test]
    fn test_question_mark_glob() {
        let m = Matcher::compile("/item?").unwrap().unwrap();
        assert!(matches!(m, Matcher::Glob(_)));
        assert!(m.matches("/item1"));
        assert!(!m.matches("/item"));
        assert!(!m.matches("/item/x"));
    }

    #[test]
    fn test_regex_dispatch() {
        let m = Matcher::compile(r"rx://.*\.png$").unwrap().unwrap();
        assert!(matches!(m, Matcher::Regex(_)));
        assert!(m.matches("/images/logo.png"));
        assert!(!m.matches("/images/logo.jpg"));
    }

    #[test]
    fn test_invalid_regex_is_error() {
        assert!(Matcher::compile("rx://(").is_err());
    }

    #[test]
    fn test_glob_escapes_regex_metacharacters() {
        let m = Matcher::compile("/a.b/*").unwrap().unwrap();
        // trailing single star: prefix matcher, dot stays literal
        assert!(m.matches("/a.b/c"));
        let m = Matcher::compile("/a.?/x*y").unwrap().unwrap();
        assert!(matches!(m, Matcher::Glob(_)));
        assert!(m.matches("/a.z/xABCy"));
        assert!(!m.matches("/aXz/xy"));
    }
}
