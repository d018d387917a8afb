use fm_core::scope::ScopeViolationRecord;
use fm_core::store::ViolationLog;
use fm_core::StoreError;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;

/// Append-only scope-violation log: one JSON object per line, never
/// rewritten or truncated by the engine.
pub struct ViolationLogFile {
    path: PathBuf,
}

impl ViolationLogFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Every record currently in the log; undecodable lines are skipped.
    pub fn read_all(&self) -> Result<Vec<ScopeViolationRecord>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        Ok(raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

impl ViolationLog for ViolationLogFile {
    fn append(&self, record: &ScopeViolationRecord) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(record).map_err(|err| StoreError::Io {
            message: err.to_string(),
        })?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fm_core::types::ids::{ProjectId, PromptId};
    use tempfile::TempDir;

    #[test]
    fn records_accumulate_one_per_line() {
        let dir = TempDir::new().unwrap();
        let log = ViolationLogFile::new(dir.path().join("scope_violations.log"));
        let prompt_id = PromptId::generate();
        for path in ["a/secret/x.txt", "a/secret/y.txt"] {
            log.append(&ScopeViolationRecord {
                timestamp: Utc::now(),
                prompt_id: prompt_id.clone(),
                project_id: Some(ProjectId::from("web")),
                path: path.to_string(),
                context: "post-run diff".to_string(),
            })
            .unwrap();
        }
        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].path, "a/secret/x.txt");
        assert_eq!(records[1].prompt_id, prompt_id);
    }

    #[test]
    fn missing_log_reads_empty() {
        let dir = TempDir::new().unwrap();
        let log = ViolationLogFile::new(dir.path().join("scope_violations.log"));
        assert!(log.read_all().unwrap().is_empty());
    }
}
