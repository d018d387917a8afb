use serde::{Deserialize, Serialize};

/// Per-project write-scope rule set. Deny wins over allow; log-only paths
/// accept appended content only; an empty allow list allows everything not
/// denied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeManifest {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub log_only: Vec<String>,
    /// True when no manifest was found and a conservative default applies.
    #[serde(default)]
    pub is_fallback: bool,
}

impl ScopeManifest {
    /// Conservative default for a project without `scope.yml`: only the
    /// project's own folder may be edited.
    pub fn fallback_for_project(project_glob: &str) -> Self {
        Self {
            description: format!(
                "No scope manifest found; restrict edits to {project_glob} until one is defined."
            ),
            allow: vec![project_glob.to_string()],
            deny: Vec::new(),
            log_only: Vec::new(),
            is_fallback: true,
        }
    }

    /// Last-resort manifest when no project resolves at all. Scope data is
    /// advisory collaborator input; an unresolvable project must not wedge
    /// the queue.
    pub fn permissive_fallback() -> Self {
        Self {
            description: "No matching project scope; allow full repository until metadata is fixed."
                .to_string(),
            allow: vec!["**".to_string()],
            deny: Vec::new(),
            log_only: Vec::new(),
            is_fallback: true,
        }
    }

    /// Human-readable summary injected into the agent context.
    pub fn guardrail_blurb(&self) -> String {
        let mut lines = vec!["Scope guardrail:".to_string()];
        let description = self.description.trim();
        if description.is_empty() {
            if self.is_fallback {
                lines.push("- Fallback manifest: Only project files may be edited.".to_string());
            }
        } else {
            let prefix = if self.is_fallback {
                "Fallback manifest"
            } else {
                "Manifest"
            };
            lines.push(format!("- {prefix}: {description}"));
        }
        if !self.allow.is_empty() {
            lines.push(format!("- Allowed globs: {}", self.allow.join(", ")));
        }
        if !self.deny.is_empty() {
            lines.push(format!("- Denied globs: {}", self.deny.join(", ")));
        }
        if !self.log_only.is_empty() {
            lines.push(format!("- Log-only globs: {}", self.log_only.join(", ")));
        }
        lines.join("\n")
    }
}
