//! Write-path allowlist: glob allow/deny/writable rules evaluated against
//! normalized repository paths. Deny always wins.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

/// Rule file shape (`paths.allowlist.yaml`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllowlistConfig {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    /// When non-empty, a path must also match one of these to be writable.
    #[serde(default)]
    pub writable: Vec<String>,
}

impl AllowlistConfig {
    /// Built-in rules for local development: docs and collaboration
    /// artifacts are writable, VCS metadata never is.
    pub fn builtin() -> Self {
        Self {
            allow: vec!["/docs/**".into(), "/.collab/**".into()],
            deny: vec!["/.git/**".into(), "**/.git/**".into()],
            writable: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathErrorKind {
    Denied,
    NotAllowlisted,
    NotWritable,
    Escaped,
}

impl PathErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PathErrorKind::Denied => "denied",
            PathErrorKind::NotAllowlisted => "not_allowlisted",
            PathErrorKind::NotWritable => "not_writable",
            PathErrorKind::Escaped => "escaped",
        }
    }
}

impl fmt::Display for PathErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a requested path may not be written.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{detail}")]
pub struct PathError {
    pub kind: PathErrorKind,
    pub path: String,
    pub pattern: Option<String>,
    pub detail: String,
}

impl PathError {
    fn escaped(path: &str, why: &str) -> Self {
        Self {
            kind: PathErrorKind::Escaped,
            path: path.to_string(),
            pattern: None,
            detail: format!("Path {path} {why}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("invalid pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("read allowlist: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse allowlist: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    re: Regex,
}

impl Rule {
    fn compile(pattern: &str) -> Result<Self, RuleError> {
        let anchored = if pattern.starts_with('/') || pattern.starts_with('*') {
            pattern.to_string()
        } else {
            format!("/{pattern}")
        };
        let re = Regex::new(&glob_to_regex(&anchored)).map_err(|source| RuleError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            pattern: pattern.to_string(),
            re,
        })
    }

    fn matches(&self, path: &str) -> bool {
        self.re.is_match(path)
    }
}

/// Translate a path glob into an anchored regex.
///
/// `**` spans separators, `*` and `?` stay within one segment, and `/**/`
/// also matches a single `/`.
fn glob_to_regex(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::from("^");
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if out.ends_with('/') && chars.get(i + 2) == Some(&'/') {
                    out.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    out.push_str(".*");
                    i += 2;
                }
            }
            '*' => {
                out.push_str("[^/]*");
                i += 1;
            }
            '?' => {
                out.push_str("[^/]");
                i += 1;
            }
            c => {
                let mut buf = [0u8; 4];
                out.push_str(&regex::escape(c.encode_utf8(&mut buf)));
                i += 1;
            }
        }
    }
    out.push('$');
    out
}

/// A validated path: what the caller asked for and where it lands in the repo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedPath {
    pub requested: String,
    /// Repo-relative, always starting with `/`.
    pub relative: String,
}

/// Resolve `.`/`..`, collapse separators and strip the repo-root prefix.
pub fn normalize(raw: &str, root_prefix: &str) -> Result<String, PathError> {
    if raw.trim().is_empty() {
        return Err(PathError::escaped(raw, "is empty"));
    }
    if raw.contains('\0') {
        return Err(PathError::escaped(raw, "contains a NUL byte"));
    }
    let root = root_prefix.trim_end_matches('/');
    let rest = if !root.is_empty() && (raw == root || raw.starts_with(&format!("{root}/"))) {
        &raw[root.len()..]
    } else {
        raw
    };
    let mut stack: Vec<&str> = Vec::new();
    for seg in rest.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if stack.pop().is_none() {
                    return Err(PathError::escaped(raw, "escapes the repository root"));
                }
            }
            s => stack.push(s),
        }
    }
    Ok(format!("/{}", stack.join("/")))
}

/// Compiled rule set.
#[derive(Debug, Clone)]
pub struct Allowlist {
    root_prefix: String,
    allow: Vec<Rule>,
    deny: Vec<Rule>,
    writable: Vec<Rule>,
}

impl Allowlist {
    pub fn compile(cfg: &AllowlistConfig, root_prefix: &str) -> Result<Self, RuleError> {
        let compile_all = |patterns: &[String]| -> Result<Vec<Rule>, RuleError> {
            patterns.iter().map(|p| Rule::compile(p)).collect()
        };
        Ok(Self {
            root_prefix: root_prefix.trim_end_matches('/').to_string(),
            allow: compile_all(&cfg.allow)?,
            deny: compile_all(&cfg.deny)?,
            writable: compile_all(&cfg.writable)?,
        })
    }

    pub fn from_yaml_file(path: &Path, root_prefix: &str) -> Result<Self, RuleError> {
        let text = std::fs::read_to_string(path)?;
        let cfg: AllowlistConfig = serde_yaml::from_str(&text)?;
        Self::compile(&cfg, root_prefix)
    }

    /// Load rules from disk; any failure yields the deny-all fallback.
    pub fn load_or_restrictive(path: &Path, root_prefix: &str) -> Self {
        match Self::from_yaml_file(path, root_prefix) {
            Ok(list) => {
                info!(
                    path = %path.display(),
                    allow = list.allow.len(),
                    deny = list.deny.len(),
                    writable = list.writable.len(),
                    "loaded path allowlist"
                );
                list
            }
            Err(err) => {
                warn!(path = %path.display(), "failed to load allowlist, denying all writes: {err}");
                Self::restrictive(root_prefix)
            }
        }
    }

    pub fn restrictive(root_prefix: &str) -> Self {
        Self {
            root_prefix: root_prefix.trim_end_matches('/').to_string(),
            allow: Vec::new(),
            // with no allow rules every path is rejected even if this fails to compile
            deny: Rule::compile("**").into_iter().collect(),
            writable: Vec::new(),
        }
    }

    /// Check one path. Deny rules short-circuit before allow rules are tried.
    pub fn check(&self, raw: &str) -> Result<NormalizedPath, PathError> {
        let path = normalize(raw, &self.root_prefix)?;
        if let Some(rule) = self.deny.iter().find(|r| r.matches(&path)) {
            return Err(PathError {
                kind: PathErrorKind::Denied,
                detail: format!("Path {path} matches deny pattern: {}", rule.pattern),
                pattern: Some(rule.pattern.clone()),
                path,
            });
        }
        if !self.allow.iter().any(|r| r.matches(&path)) {
            return Err(PathError {
                kind: PathErrorKind::NotAllowlisted,
                detail: format!("Path {path} is not in allow list"),
                pattern: None,
                path,
            });
        }
        if !self.writable.is_empty() && !self.writable.iter().any(|r| r.matches(&path)) {
            return Err(PathError {
                kind: PathErrorKind::NotWritable,
                detail: format!("Path {path} is not in writable list"),
                pattern: None,
                path,
            });
        }
        Ok(NormalizedPath {
            requested: raw.to_string(),
            relative: path,
        })
    }

    /// Validate a whole request; the first failing path rejects all of them.
    pub fn validate<S: AsRef<str>>(&self, paths: &[S]) -> Result<Vec<NormalizedPath>, PathError> {
        paths.iter().map(|p| self.check(p.as_ref())).collect()
    }
}
