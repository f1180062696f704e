mod matcher;
mod watcher;

pub use matcher::Matcher;

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("Invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid legacy rule file: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Rule action, the scheme part of the DSL's second field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    MapRemote,
    MapLocal,
    Status,
    ReqHeader,
    RespHeader,
}

impl Action {
    fn parse(s: &str) -> Option<Action> {
        match s {
            "mapRemote" => Some(Action::MapRemote),
            "mapLocal" => Some(Action::MapLocal),
            "status" => Some(Action::Status),
            "reqHeader" => Some(Action::ReqHeader),
            "respHeader" => Some(Action::RespHeader),
            _ => None,
        }
    }
}

/// A single compiled rule. `host`/`path` of `None` match anything.
#[derive(Debug, Clone)]
pub struct Rule {
    pub host: Option<Matcher>,
    pub path: Option<Matcher>,
    /// Original path pattern text; a trailing `*` switches map-remote into
    /// suffix-append mode.
    pub path_raw: String,
    pub action: Action,
    pub param: String,
}

impl Rule {
    fn accepts(&self, authority: &str, path: &str) -> bool {
        if let Some(host) = &self.host {
            if !host.matches(authority) {
                return false;
            }
        }
        if let Some(p) = &self.path {
            if !p.matches(path) {
                return false;
            }
        }
        true
    }
}

#[derive(Default)]
struct Inner {
    rules: Vec<Rule>,
    /// Modification-time sentinel. `None` forces a reparse on the next match.
    mtime: Option<SystemTime>,
    legacy_tried: bool,
}

/// Thread-safe rule store with hot reload.
///
/// Every `match_url` call stats the DSL file and reparses under the writer
/// lock when the recorded modification time is stale. The file watcher and
/// `force_reload` clear the sentinel so the next match reparses even when
/// filesystem timestamp resolution is too coarse to observe an edit.
pub struct RuleStore {
    dsl_path: PathBuf,
    legacy_path: PathBuf,
    inner: RwLock<Inner>,
    pub(crate) watcher: Mutex<Option<notify::RecommendedWatcher>>,
}

impl RuleStore {
    /// Create a store and perform the initial load. A malformed DSL file
    /// (including an invalid regex) is fatal here; later reloads keep the
    /// previous list instead.
    pub fn new(
        dsl_path: impl Into<PathBuf>,
        legacy_path: impl Into<PathBuf>,
    ) -> Result<Arc<Self>, RuleError> {
        let store = Arc::new(Self {
            dsl_path: dsl_path.into(),
            legacy_path: legacy_path.into(),
            inner: RwLock::new(Inner::default()),
            watcher: Mutex::new(None),
        });
        store.initial_load()?;
        Ok(store)
    }

    fn initial_load(&self) -> Result<(), RuleError> {
        match fs::metadata(&self.dsl_path) {
            Ok(md) => {
                let rules = parse_dsl_file(&self.dsl_path)?;
                info!("{} rule(s) loaded from {:?}", rules.len(), self.dsl_path);
                let mut inner = self.write();
                inner.rules = rules;
                inner.mtime = md.modified().ok();
            }
            Err(_) => {
                // Missing rule file is not an error; fall back to the legacy
                // JSON file once.
                self.try_legacy();
            }
        }
        Ok(())
    }

    /// Find the first rule matching the given URL authority and path.
    pub fn match_url(&self, authority: &str, path: &str) -> Option<Rule> {
        self.ensure_fresh();
        let inner = self.read();
        inner
            .rules
            .iter()
            .find(|r| r.accepts(authority, path))
            .cloned()
    }

    /// Clear the mtime sentinel so the next `match_url` reparses the file.
    pub fn force_reload(&self) {
        self.write().mtime = None;
    }

    /// Number of rules currently published.
    pub fn len(&self) -> usize {
        self.read().rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_fresh(&self) {
        let modified = fs::metadata(&self.dsl_path).and_then(|m| m.modified());
        let Ok(modified) = modified else {
            // DSL file missing or unreadable: keep whatever is published,
            // trying the legacy fallback if nothing was ever loaded.
            let wants_legacy = {
                let inner = self.read();
                inner.mtime.is_none() && !inner.legacy_tried
            };
            if wants_legacy {
                self.try_legacy();
            }
            return;
        };

        if self.read().mtime == Some(modified) {
            return;
        }

        match parse_dsl_file(&self.dsl_path) {
            Ok(rules) => {
                info!("{} rule(s) loaded from {:?}", rules.len(), self.dsl_path);
                let mut inner = self.write();
                inner.rules = rules;
                inner.mtime = Some(modified);
            }
            Err(e) => {
                // Keep the previous list; the next edit gets another chance.
                warn!("rule reload failed, keeping previous rules: {}", e);
            }
        }
    }

    fn try_legacy(&self) {
        {
            let mut inner = self.write();
            if inner.legacy_tried {
                return;
            }
            inner.legacy_tried = true;
        }
        let Ok(data) = fs::read(&self.legacy_path) else {
            return;
        };
        match parse_legacy(&data) {
            Ok(rules) => {
                info!(
                    "{} legacy JSON rule(s) loaded from {:?}",
                    rules.len(),
                    self.legacy_path
                );
                self.write().rules = rules;
            }
            Err(e) => warn!("legacy rule file {:?} ignored: {}", self.legacy_path, e),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_dsl_file(path: &Path) -> Result<Vec<Rule>, RuleError> {
    let text = fs::read_to_string(path)?;
    parse_dsl(&text)
}

/// Parse the line-oriented rule DSL.
///
/// Each rule line is `<host-with-optional-path> <action>://<param>`; the
/// first field ends at the first whitespace run, the rest of the line is the
/// action field so header values may contain spaces. `#` comments and blank
/// lines are skipped.
fn parse_dsl(text: &str) -> Result<Vec<Rule>, RuleError> {
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((pattern, rest)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        let rest = rest.trim();
        if rest.is_empty() {
            continue;
        }

        let (host_pat, path_pat) = split_host_path(pattern);
        let (action_str, param) = split_proto(rest);
        let Some(action) = Action::parse(action_str) else {
            warn!("skipping rule with unknown action {:?}: {}", action_str, line);
            continue;
        };

        out.push(Rule {
            host: Matcher::compile(host_pat)?,
            path: Matcher::compile(path_pat)?,
            path_raw: path_pat.to_string(),
            action,
            param: param.to_string(),
        });
    }
    Ok(out)
}

/// Split the first DSL field into host and path at the first `/`. A field
/// that is one `rx://` pattern stays whole and matches against the path; its
/// embedded slashes are not a host/path boundary.
fn split_host_path(s: &str) -> (&str, &str) {
    if s.starts_with('/') || s.starts_with("rx://") {
        return ("", s);
    }
    match s.find('/') {
        Some(i) => (&s[..i], &s[i..]),
        None => (s, ""),
    }
}

/// Split the action field at the first `://`; no separator yields an empty
/// param.
fn split_proto(s: &str) -> (&str, &str) {
    match s.find("://") {
        Some(i) => (&s[..i], &s[i + 3..]),
        None => (s, ""),
    }
}

#[derive(Deserialize)]
struct LegacyRule {
    #[serde(rename = "match", default)]
    pattern: String,
    #[serde(default)]
    action: String,
    #[serde(default)]
    target: String,
}

fn parse_legacy(data: &[u8]) -> Result<Vec<Rule>, RuleError> {
    let raw: Vec<LegacyRule> = serde_json::from_slice(data)?;
    let mut out = Vec::new();
    for r in raw {
        let (host_pat, path_pat) = split_host_path(&r.pattern);
        let Some(action) = Action::parse(&r.action) else {
            warn!("skipping legacy rule with unknown action {:?}", r.action);
            continue;
        };
        let (host, path) = match (Matcher::compile(host_pat), Matcher::compile(path_pat)) {
            (Ok(h), Ok(p)) => (h, p),
            (Err(e), _) | (_, Err(e)) => {
                warn!("skipping legacy rule {:?}: {}", r.pattern, e);
                continue;
            }
        };
        out.push(Rule {
            host,
            path,
            path_raw: path_pat.to_string(),
            action,
            param: r.target,
        });
    }
    Ok(out)
}

/// Parse a `status://` param into an HTTP status code.
pub fn parse_status(s: &str) -> Option<u16> {
    s.parse::<u16>().ok().filter(|c| (100..=999).contains(c))
}

/// Parse a header directive param of the form `op:key=value`; the `=value`
/// segment is optional.
pub fn parse_header_param(p: &str) -> (&str, &str, &str) {
    match p.split_once(':') {
        None => ("", p, ""),
        Some((op, rest)) => match rest.split_once('=') {
            Some((key, value)) => (op, key, value),
            None => (op, rest, ""),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn store_with(rules: &str) -> (tempfile::TempDir, Arc<RuleStore>) {
        let dir = tempfile::TempDir::new().unwrap();
        let dsl = dir.path().join("rules.txt");
        std::fs::write(&dsl, rules).unwrap();
        let store = RuleStore::new(&dsl, dir.path().join("rules.json")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_parse_skips_comments_and_blanks() {
        let rules = parse_dsl("# comment\n\n  \nexample.com status://404\n").unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].action, Action::Status);
        assert_eq!(rules[0].param, "404");
    }

    #[test]
    fn test_host_path_split() {
        assert_eq!(split_host_path("a.com/api"), ("a.com", "/api"));
        assert_eq!(split_host_path("/healthz"), ("", "/healthz"));
        assert_eq!(split_host_path("a.com"), ("a.com", ""));
        assert_eq!(
            split_host_path(r"rx://.*\.png$"),
            ("", r"rx://.*\.png$")
        );
    }

    #[test]
    fn test_regex_rule_matches_path_on_any_host() {
        let (_dir, store) = store_with("rx://.*\\.png$ status://404\n");
        let rule = store.match_url("cdn.example", "/images/logo.png").unwrap();
        assert_eq!(rule.param, "404");
        assert!(store.match_url("cdn.example", "/images/logo.jpg").is_none());
    }

    #[test]
    fn test_action_split() {
        assert_eq!(split_proto("mapLocal://OK"), ("mapLocal", "OK"));
        assert_eq!(split_proto("status"), ("status", ""));
        assert_eq!(
            split_proto("mapRemote://http://x/y"),
            ("mapRemote", "http://x/y")
        );
    }

    #[test]
    fn test_header_param_keeps_spaces() {
        let rules =
            parse_dsl("x.com/ reqHeader://set:Authorization=Bearer abc\n").unwrap();
        assert_eq!(rules[0].param, "set:Authorization=Bearer abc");
        let (op, key, value) = parse_header_param(&rules[0].param);
        assert_eq!((op, key, value), ("set", "Authorization", "Bearer abc"));
    }

    #[test]
    fn test_unknown_action_skipped() {
        let rules = parse_dsl("a.com tee://x\nb.com status://204\n").unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].action, Action::Status);
    }

    #[test]
    fn test_first_match_wins() {
        let (_dir, store) = store_with(
            "a.test/hello status://418\na.test/* status://500\n",
        );
        let rule = store.match_url("a.test", "/hello").unwrap();
        assert_eq!(rule.param, "418");
        // reordering flips the result
        let (_dir, store) = store_with(
            "a.test/* status://500\na.test/hello status://418\n",
        );
        let rule = store.match_url("a.test", "/hello").unwrap();
        assert_eq!(rule.param, "500");
    }

    #[test]
    fn test_empty_host_matches_any() {
        let (_dir, store) = store_with("/healthz mapLocal://OK\n");
        assert!(store.match_url("whatever.example", "/healthz").is_some());
        assert!(store.match_url("whatever.example", "/other").is_none());
    }

    #[test]
    fn test_host_only_rule_matches_any_path() {
        let (_dir, store) = store_with("host.com respHeader://del:Set-Cookie\n");
        assert!(store.match_url("host.com", "/a/b").is_some());
        assert!(store.match_url("other.com", "/a/b").is_none());
    }

    #[test]
    fn test_hot_reload_via_force_reload() {
        let (dir, store) = store_with("a.test/x status://404\n");
        assert_eq!(store.match_url("a.test", "/x").unwrap().param, "404");

        std::fs::write(dir.path().join("rules.txt"), "a.test/x status://503\n").unwrap();
        // mtime resolution may be too coarse for the rewrite to be visible
        store.force_reload();
        assert_eq!(store.match_url("a.test", "/x").unwrap().param, "503");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_failed_reload_keeps_previous_rules() {
        let (dir, store) = store_with("a.test/x status://404\n");
        assert_eq!(store.len(), 1);

        // an invalid regex makes the whole file unparseable
        let mut f = std::fs::File::create(dir.path().join("rules.txt")).unwrap();
        writeln!(f, "rx://( status://500").unwrap();
        drop(f);
        store.force_reload();
        assert_eq!(store.match_url("a.test", "/x").unwrap().param, "404");
    }

    #[test]
    fn test_invalid_regex_fatal_at_startup() {
        let dir = tempfile::TempDir::new().unwrap();
        let dsl = dir.path().join("rules.txt");
        std::fs::write(&dsl, "rx://( status://500\n").unwrap();
        assert!(RuleStore::new(&dsl, dir.path().join("rules.json")).is_err());
    }

    #[test]
    fn test_legacy_json_fallback() {
        let dir = tempfile::TempDir::new().unwrap();
        let legacy = dir.path().join("rules.json");
        std::fs::write(
            &legacy,
            r#"[{"match":"a.test/old","action":"status","target":"410"}]"#,
        )
        .unwrap();
        let store = RuleStore::new(dir.path().join("rules.txt"), &legacy).unwrap();
        let rule = store.match_url("a.test", "/old").unwrap();
        assert_eq!(rule.action, Action::Status);
        assert_eq!(rule.param, "410");
    }

    #[test]
    fn test_dsl_file_appearing_later_is_picked_up() {
        let dir = tempfile::TempDir::new().unwrap();
        let dsl = dir.path().join("rules.txt");
        let store = RuleStore::new(&dsl, dir.path().join("rules.json")).unwrap();
        assert!(store.match_url("a.test", "/x").is_none());

        std::fs::write(&dsl, "a.test/x status://404\n").unwrap();
        assert_eq!(store.match_url("a.test", "/x").unwrap().param, "404");
    }

    #[test]
    fn test_missing_everything_matches_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let store =
            RuleStore::new(dir.path().join("rules.txt"), dir.path().join("rules.json"))
                .unwrap();
        assert!(store.match_url("a.test", "/").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("418"), Some(418));
        assert_eq!(parse_status("abc"), None);
        assert_eq!(parse_status("42"), None);
        assert_eq!(parse_status(""), None);
    }

    #[test]
    fn test_parse_header_param_variants() {
        assert_eq!(parse_header_param("set:K=V"), ("set", "K", "V"));
        assert_eq!(parse_header_param("del:Set-Cookie"), ("del", "Set-Cookie", ""));
        assert_eq!(parse_header_param("nocolon"), ("", "nocolon", ""));
        assert_eq!(parse_header_param("add:K=a=b"), ("add", "K", "a=b"));
    }
}
