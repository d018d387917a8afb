use crate::error::ScopeError;
use crate::types::ids::{ProjectId, PromptId};
use crate::types::scope::ScopeManifest;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

/// How a changed path relates to the active manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeDecision {
    Allowed,
    /// Matched a log-only pattern: only appended content is acceptable.
    LogOnly,
    Denied,
}

/// One violation, appended to the JSONL violation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeViolationRecord {
    pub timestamp: DateTime<Utc>,
    pub prompt_id: PromptId,
    #[serde(default)]
    pub project_id: Option<ProjectId>,
    pub path: String,
    pub context: String,
}

/// Compiled form of a scope manifest. Classification rules: a deny match
/// overrides everything; with a non-empty allow list, a path must match it;
/// log-only narrows an allowed path to append-only edits.
pub struct ScopeEnforcer {
    manifest: ScopeManifest,
    allow: GlobSet,
    deny: GlobSet,
    log_only: GlobSet,
}

impl ScopeEnforcer {
    pub fn new(manifest: ScopeManifest) -> Result<Self, ScopeError> {
        let allow = build_set(&manifest.allow)?;
        let deny = build_set(&manifest.deny)?;
        let log_only = build_set(&manifest.log_only)?;
        Ok(Self {
            manifest,
            allow,
            deny,
            log_only,
        })
    }

    pub fn manifest(&self) -> &ScopeManifest {
        &self.manifest
    }

    pub fn classify(&self, path: &str) -> ScopeDecision {
        let rel = normalize_path(path);
        if rel.is_empty() {
            return ScopeDecision::Denied;
        }
        if self.deny.is_match(&rel) {
            return ScopeDecision::Denied;
        }
        if !self.manifest.allow.is_empty() && !self.allow.is_match(&rel) {
            return ScopeDecision::Denied;
        }
        if self.log_only.is_match(&rel) {
            return ScopeDecision::LogOnly;
        }
        ScopeDecision::Allowed
    }

    /// Review a completed edit batch and return the violating paths, sorted.
    ///
    /// `pre_content`/`current_content` supply a path's bytes before the
    /// attempt and now (`None` = absent). The review is pure: running it
    /// twice over the same batch yields the same violations, and reverted
    /// paths drop out of the next batch entirely.
    pub fn review<Pre, Cur>(
        &self,
        changed_paths: &[String],
        mut pre_content: Pre,
        mut current_content: Cur,
    ) -> Vec<String>
    where
        Pre: FnMut(&str) -> Option<Vec<u8>>,
        Cur: FnMut(&str) -> Option<Vec<u8>>,
    {
        let mut violations = Vec::new();
        for path in changed_paths {
            let rel = normalize_path(path);
            match self.classify(&rel) {
                ScopeDecision::Denied => violations.push(rel),
                ScopeDecision::LogOnly => {
                    if !is_pure_append(pre_content(&rel), current_content(&rel)) {
                        violations.push(rel);
                    }
                }
                ScopeDecision::Allowed => {}
            }
        }
        violations.sort();
        violations.dedup();
        violations
    }
}

/// Append-only check for log-only paths: the previous content must be a byte
/// prefix of the new content. A freshly created file counts as an append.
fn is_pure_append(pre: Option<Vec<u8>>, current: Option<Vec<u8>>) -> bool {
    match (pre, current) {
        (None, None) => true,
        (Some(_), None) => false,
        (None, Some(_)) => true,
        (Some(pre), Some(current)) => current.starts_with(&pre),
    }
}

fn normalize_path(path: &str) -> String {
    let mut cleaned = path.replace('\\', "/");
    while let Some(rest) = cleaned.strip_prefix("./") {
        cleaned = rest.to_string();
    }
    cleaned.trim().to_string()
}

fn build_set(patterns: &[String]) -> Result<GlobSet, ScopeError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let cleaned = normalize_path(pattern);
        if cleaned.is_empty() {
            continue;
        }
        let glob = Glob::new(&cleaned).map_err(|err| ScopeError::InvalidPattern {
            pattern: cleaned.clone(),
            reason: err.to_string(),
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|err| ScopeError::InvalidPattern {
        pattern: patterns.join(", "),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enforcer(allow: &[&str], deny: &[&str], log_only: &[&str]) -> ScopeEnforcer {
        ScopeEnforcer::new(ScopeManifest {
            description: String::new(),
            allow: allow.iter().map(ToString::to_string).collect(),
            deny: deny.iter().map(ToString::to_string).collect(),
            log_only: log_only.iter().map(ToString::to_string).collect(),
            is_fallback: false,
        })
        .unwrap()
    }

    #[test]
    fn deny_overrides_allow() {
        let scope = enforcer(&["a/**"], &["a/secret/**"], &[]);
        assert_eq!(scope.classify("a/ok.txt"), ScopeDecision::Allowed);
        assert_eq!(scope.classify("a/secret/x.txt"), ScopeDecision::Denied);
    }

    #[test]
    fn unmatched_path_is_denied_when_allow_is_set() {
        let scope = enforcer(&["a/**"], &[], &[]);
        assert_eq!(scope.classify("b/file.txt"), ScopeDecision::Denied);
    }

    #[test]
    fn empty_allow_list_allows_everything_not_denied() {
        let scope = enforcer(&[], &["secrets/**"], &[]);
        assert_eq!(scope.classify("anything/else.rs"), ScopeDecision::Allowed);
        assert_eq!(scope.classify("secrets/key.pem"), ScopeDecision::Denied);
    }

    #[test]
    fn review_separates_violations_from_compliant_edits() {
        let scope = enforcer(&["a/**"], &["a/secret/**"], &[]);
        let changed = vec!["a/ok.txt".to_string(), "a/secret/x.txt".to_string()];
        let violations = scope.review(&changed, |_| None, |_| Some(b"data".to_vec()));
        assert_eq!(violations, vec!["a/secret/x.txt".to_string()]);
    }

    #[test]
    fn log_only_accepts_appends_and_rejects_rewrites() {
        let scope = enforcer(&[], &[], &["logs/*.log"]);
        let appended = scope.review(
            &["logs/run.log".to_string()],
            |_| Some(b"line1\n".to_vec()),
            |_| Some(b"line1\nline2\n".to_vec()),
        );
        assert!(appended.is_empty());

        let rewritten = scope.review(
            &["logs/run.log".to_string()],
            |_| Some(b"line1\n".to_vec()),
            |_| Some(b"rewritten\n".to_vec()),
        );
        assert_eq!(rewritten, vec!["logs/run.log".to_string()]);

        let deleted = scope.review(
            &["logs/run.log".to_string()],
            |_| Some(b"line1\n".to_vec()),
            |_| None,
        );
        assert_eq!(deleted, vec!["logs/run.log".to_string()]);
    }

    #[test]
    fn review_is_idempotent() {
        let scope = enforcer(&["a/**"], &[], &[]);
        let changed = vec!["b/out.txt".to_string()];
        let first = scope.review(&changed, |_| None, |_| Some(Vec::new()));
        let second = scope.review(&changed, |_| None, |_| Some(Vec::new()));
        assert_eq!(first, second);
    }

    #[test]
    fn paths_are_normalized_before_matching() {
        let scope = enforcer(&["a/**"], &[], &[]);
        assert_eq!(scope.classify("./a/file.txt"), ScopeDecision::Allowed);
        assert_eq!(scope.classify("a\\nested\\file.txt"), ScopeDecision::Allowed);
        assert_eq!(scope.classify(""), ScopeDecision::Denied);
    }
}
