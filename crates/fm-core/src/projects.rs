use crate::types::ids::ProjectId;
use crate::types::scope::ScopeManifest;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// External collaborator: per-project scope manifests and assembled context
/// text, keyed by project id. Loaded once at startup from a directory of
/// project folders; missing or malformed metadata degrades to defaults with a
/// warning, never to a hard failure.
pub struct ProjectRegistry {
    repo_root: PathBuf,
    projects: BTreeMap<ProjectId, ProjectEntry>,
    default_project: Option<ProjectId>,
}

pub struct ProjectEntry {
    pub id: ProjectId,
    pub name: String,
    pub description: String,
    pub root_dir: PathBuf,
    context_file: PathBuf,
    guidance_file: Option<PathBuf>,
    scope: Option<ScopeManifest>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ProjectMetadata {
    id: Option<String>,
    name: Option<String>,
    description: Option<String>,
    context_file: Option<String>,
    agents_file: Option<String>,
    default: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ScopeManifestFile {
    description: String,
    allow: Vec<String>,
    deny: Vec<String>,
    log_only: Vec<String>,
}

impl ProjectRegistry {
    pub fn load(
        base_dir: &Path,
        repo_root: &Path,
        preferred_default: Option<&str>,
    ) -> Self {
        let mut projects = BTreeMap::new();
        let mut flagged_default = None;

        let mut dirs: Vec<PathBuf> = std::fs::read_dir(base_dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .map(|entry| entry.path())
                    .filter(|path| path.is_dir())
                    .collect()
            })
            .unwrap_or_default();
        dirs.sort();

        for dir in dirs {
            let metadata = load_metadata(&dir);
            let dir_name = dir
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            let raw_id = metadata.id.as_deref().unwrap_or(&dir_name).trim().to_string();
            if raw_id.is_empty() {
                continue;
            }
            let id = ProjectId::new(raw_id);
            let name = metadata
                .name
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .unwrap_or(id.as_str())
                .to_string();
            let context_name = metadata
                .context_file
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .unwrap_or("context.md");
            let guidance_file = match metadata.agents_file.as_deref().map(str::trim) {
                Some("") => None,
                Some(name) => Some(dir.join(name)),
                None => {
                    let default_guidance = dir.join("agents.md");
                    default_guidance.exists().then_some(default_guidance)
                }
            };
            let scope = load_scope(&dir, &id);
            if metadata.default {
                flagged_default = Some(id.clone());
            }
            projects.insert(
                id.clone(),
                ProjectEntry {
                    id,
                    name,
                    description: metadata.description.unwrap_or_default().trim().to_string(),
                    context_file: dir.join(context_name),
                    guidance_file,
                    root_dir: dir,
                    scope,
                },
            );
        }

        let default_project = preferred_default
            .map(ProjectId::new)
            .filter(|id| projects.contains_key(id))
            .or(flagged_default)
            .or_else(|| projects.keys().next().cloned());

        Self {
            repo_root: repo_root.to_path_buf(),
            projects,
            default_project,
        }
    }

    pub fn resolve(&self, requested: Option<&ProjectId>) -> Option<&ProjectEntry> {
        match requested {
            Some(id) if self.projects.contains_key(id) => self.projects.get(id),
            _ => self
                .default_project
                .as_ref()
                .and_then(|id| self.projects.get(id)),
        }
    }

    /// Normalize a requested project id to one the registry knows, falling
    /// back to the default project.
    pub fn resolve_project_id(&self, requested: Option<&ProjectId>) -> Option<ProjectId> {
        self.resolve(requested).map(|entry| entry.id.clone())
    }

    /// Manifest for a project, with the documented fallbacks: a known project
    /// without `scope.yml` is confined to its own folder; an unresolvable
    /// project gets a permissive manifest flagged as fallback.
    pub fn scope_for(&self, requested: Option<&ProjectId>) -> ScopeManifest {
        match self.resolve(requested) {
            Some(entry) => entry.scope.clone().unwrap_or_else(|| {
                ScopeManifest::fallback_for_project(&self.project_glob(entry))
            }),
            None => ScopeManifest::permissive_fallback(),
        }
    }

    /// Context text handed to the agent: project header, scope guardrail,
    /// project context and guidance, then shared repo-level guidance.
    pub fn context_for(&self, requested: Option<&ProjectId>) -> String {
        let shared = read_trimmed(&self.repo_root.join("agents.md"));
        let Some(entry) = self.resolve(requested) else {
            return shared;
        };

        let mut header_lines = vec![format!("Project focus: {}", entry.name)];
        if !entry.description.is_empty() {
            header_lines.push(entry.description.clone());
        }
        let mut sections = vec![header_lines.join("\n")];

        let scope = self.scope_for(Some(&entry.id));
        let guardrail = scope.guardrail_blurb();
        if !guardrail.trim().is_empty() {
            sections.push(guardrail);
        }
        let context = read_trimmed(&entry.context_file);
        if !context.is_empty() {
            sections.push(context);
        }
        if let Some(guidance_file) = &entry.guidance_file {
            let guidance = read_trimmed(guidance_file);
            if !guidance.is_empty() {
                sections.push(guidance);
            }
        }
        if !shared.is_empty() {
            sections.push(format!("Shared agent guidance:\n{shared}"));
        }
        sections
            .iter()
            .map(|section| section.trim())
            .filter(|section| !section.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n---\n\n")
    }

    fn project_glob(&self, entry: &ProjectEntry) -> String {
        let relative = entry
            .root_dir
            .strip_prefix(&self.repo_root)
            .unwrap_or(&entry.root_dir);
        format!("{}/**", relative.to_string_lossy().replace('\\', "/"))
    }
}

fn load_metadata(dir: &Path) -> ProjectMetadata {
    let path = dir.join("project.json");
    if !path.exists() {
        return ProjectMetadata::default();
    }
    match std::fs::read_to_string(&path)
        .map_err(|err| err.to_string())
        .and_then(|raw| serde_json::from_str(&raw).map_err(|err| err.to_string()))
    {
        Ok(metadata) => metadata,
        Err(err) => {
            tracing::warn!(path = %path.display(), %err, "ignoring unreadable project metadata");
            ProjectMetadata::default()
        }
    }
}

fn load_scope(dir: &Path, project_id: &ProjectId) -> Option<ScopeManifest> {
    let path = dir.join("scope.yml");
    if !path.exists() {
        return None;
    }
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) => {
            tracing::warn!(project = %project_id, %err, "unable to read scope manifest");
            return None;
        }
    };
    match serde_yaml::from_str::<ScopeManifestFile>(&raw) {
        Ok(parsed) => Some(ScopeManifest {
            description: parsed.description.trim().to_string(),
            allow: clean_patterns(parsed.allow),
            deny: clean_patterns(parsed.deny),
            log_only: clean_patterns(parsed.log_only),
            is_fallback: false,
        }),
        Err(err) => {
            tracing::warn!(project = %project_id, %err, "invalid scope manifest");
            None
        }
    }
}

fn clean_patterns(patterns: Vec<String>) -> Vec<String> {
    patterns
        .into_iter()
        .map(|pattern| pattern.trim().to_string())
        .filter(|pattern| !pattern.is_empty())
        .collect()
}

fn read_trimmed(path: &Path) -> String {
    std::fs::read_to_string(path)
        .map(|raw| raw.trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn registry_with(projects: &[(&str, Option<&str>)]) -> (TempDir, ProjectRegistry) {
        let root = TempDir::new().unwrap();
        let base = root.path().join("projects");
        for (id, scope) in projects {
            let dir = base.join(id);
            fs::create_dir_all(&dir).unwrap();
            if let Some(scope) = scope {
                fs::write(dir.join("scope.yml"), scope).unwrap();
            }
        }
        let registry = ProjectRegistry::load(&base, root.path(), None);
        (root, registry)
    }

    #[test]
    fn manifest_is_parsed_from_yaml() {
        let (_root, registry) = registry_with(&[(
            "web",
            Some("description: Web app\nallow:\n  - web/**\ndeny:\n  - web/secrets/**\n"),
        )]);
        let scope = registry.scope_for(Some(&ProjectId::from("web")));
        assert_eq!(scope.allow, vec!["web/**"]);
        assert_eq!(scope.deny, vec!["web/secrets/**"]);
        assert!(!scope.is_fallback);
    }

    #[test]
    fn missing_manifest_falls_back_to_project_folder() {
        let (_root, registry) = registry_with(&[("api", None)]);
        let scope = registry.scope_for(Some(&ProjectId::from("api")));
        assert!(scope.is_fallback);
        assert_eq!(scope.allow, vec!["projects/api/**"]);
    }

    #[test]
    fn unknown_project_without_registry_entries_is_permissive() {
        let (_root, registry) = registry_with(&[]);
        let scope = registry.scope_for(Some(&ProjectId::from("ghost")));
        assert!(scope.is_fallback);
        assert_eq!(scope.allow, vec!["**"]);
    }

    #[test]
    fn unknown_project_resolves_to_default() {
        let (_root, registry) = registry_with(&[("alpha", None), ("beta", None)]);
        assert_eq!(
            registry.resolve_project_id(Some(&ProjectId::from("ghost"))),
            Some(ProjectId::from("alpha"))
        );
    }

    #[test]
    fn invalid_yaml_degrades_to_fallback_scope() {
        let (_root, registry) = registry_with(&[("broken", Some(": not yaml ["))]);
        let scope = registry.scope_for(Some(&ProjectId::from("broken")));
        assert!(scope.is_fallback);
    }

    #[test]
    fn context_includes_guardrail_and_project_sections() {
        let (root, _) = registry_with(&[]);
        let dir = root.path().join("projects/web");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("context.md"), "Use the staging API.").unwrap();
        fs::write(
            dir.join("project.json"),
            r#"{"name": "Web", "description": "Frontend"}"#,
        )
        .unwrap();
        fs::write(root.path().join("agents.md"), "Be careful.").unwrap();
        let registry = ProjectRegistry::load(&root.path().join("projects"), root.path(), None);

        let context = registry.context_for(Some(&ProjectId::from("web")));
        assert!(context.contains("Project focus: Web"));
        assert!(context.contains("Scope guardrail:"));
        assert!(context.contains("Use the staging API."));
        assert!(context.contains("Shared agent guidance:\nBe careful."));
    }
}
