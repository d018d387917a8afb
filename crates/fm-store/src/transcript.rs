use chrono::{DateTime, SecondsFormat, Utc};
use fm_core::store::{AttemptFooter, TranscriptStore};
use fm_core::types::enums::StreamKind;
use fm_core::types::ids::PromptId;
use fm_core::StoreError;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;

const ATTEMPT_HEADER: &str = "=== attempt ";
const NOTE_HEADER: &str = "=== note ";
const SECTION_PROMPT: &str = "--- prompt ---";
const SECTION_CONTEXT: &str = "--- context ---";
const SECTION_STREAM: &str = "--- stream ---";
const SECTION_STATUS: &str = "--- status ---";
const STDOUT_PREFIX: &str = "out| ";
const STDERR_PREFIX: &str = "err| ";

/// Append-only per-prompt transcript files. Each attempt is one block:
/// prompt and context sections, then stream lines tagged `out|`/`err|` as
/// they arrive (so output up to the last flush survives a crash), then a
/// status footer.
pub struct TranscriptWriter {
    dir: PathBuf,
}

impl TranscriptWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, id: &PromptId) -> PathBuf {
        self.dir.join(format!("{id}.log"))
    }

    fn append(&self, id: &PromptId, text: &str) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(id))?;
        file.write_all(text.as_bytes())?;
        Ok(())
    }
}

impl TranscriptStore for TranscriptWriter {
    fn begin_attempt(
        &self,
        id: &PromptId,
        attempt: u32,
        prompt_text: &str,
        context: &str,
    ) -> Result<(), StoreError> {
        let started = rfc3339(Utc::now());
        let context = if context.trim().is_empty() {
            "<context unavailable>"
        } else {
            context
        };
        let block = format!(
            "{ATTEMPT_HEADER}{attempt} started {started} ===\n\
             {SECTION_PROMPT}\n{prompt_text}\n\
             {SECTION_CONTEXT}\n{context}\n\
             {SECTION_STREAM}\n"
        );
        self.append(id, &block)
    }

    fn append_chunk(
        &self,
        id: &PromptId,
        _attempt: u32,
        stream: StreamKind,
        text: &str,
    ) -> Result<(), StoreError> {
        let prefix = match stream {
            StreamKind::Stdout => STDOUT_PREFIX,
            StreamKind::Stderr => STDERR_PREFIX,
        };
        let mut block = String::new();
        for line in text.lines() {
            block.push_str(prefix);
            block.push_str(line);
            block.push('\n');
        }
        if block.is_empty() {
            return Ok(());
        }
        self.append(id, &block)
    }

    fn close_attempt(
        &self,
        id: &PromptId,
        _attempt: u32,
        footer: &AttemptFooter,
    ) -> Result<(), StoreError> {
        let mut block = format!(
            "{SECTION_STATUS}\noutcome: {}\n",
            serde_variant_name(&footer.outcome)
        );
        if let Some(code) = footer.exit_code {
            block.push_str(&format!("exit_code: {code}\n"));
        }
        block.push_str(&format!("duration_secs: {:.3}\n", footer.duration_secs));
        block.push_str(&format!(
            "summary: {}\n",
            footer.summary.replace('\n', "; ")
        ));
        for note in &footer.workflow_notes {
            block.push_str(&format!("note: {}\n", note.replace('\n', "; ")));
        }
        block.push_str(&format!("finished_at: {}\n\n", rfc3339(footer.finished_at)));
        self.append(id, &block)
    }

    fn append_note(&self, id: &PromptId, note: &str) -> Result<(), StoreError> {
        let block = format!("{NOTE_HEADER}{} ===\n{note}\n\n", rfc3339(Utc::now()));
        self.append(id, &block)
    }

    fn read(&self, id: &PromptId) -> Result<String, StoreError> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(String::new());
        }
        Ok(fs::read_to_string(path)?)
    }

    fn remove(&self, id: &PromptId) -> Result<(), StoreError> {
        let path = self.path_for(id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn serde_variant_name<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|value| value.as_str().map(ToString::to_string))
        .unwrap_or_default()
}

/// One attempt block parsed back out of a transcript, as served by the API.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AttemptLog {
    pub attempt: u32,
    pub started_at: String,
    pub prompt: String,
    pub context: String,
    pub stdout: String,
    pub stderr: String,
    pub outcome: String,
    pub exit_code: Option<i32>,
    pub duration_secs: Option<f64>,
    pub summary: String,
    pub notes: Vec<String>,
    pub finished_at: String,
}

/// Parse a transcript into its attempt blocks. Notes outside attempt blocks
/// are skipped; a block cut short by a crash parses with whatever sections it
/// has.
pub fn parse_transcript(text: &str) -> Vec<AttemptLog> {
    #[derive(PartialEq)]
    enum Section {
        Preamble,
        Prompt,
        Context,
        Stream,
        Status,
    }

    let mut attempts = Vec::new();
    let mut current: Option<AttemptLog> = None;
    let mut section = Section::Preamble;
    let mut in_note = false;

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix(ATTEMPT_HEADER) {
            if let Some(done) = current.take() {
                attempts.push(done);
            }
            let mut log = AttemptLog::default();
            let rest = rest.trim_end_matches(" ===");
            let mut parts = rest.splitn(3, ' ');
            log.attempt = parts.next().and_then(|n| n.parse().ok()).unwrap_or(0);
            if parts.next() == Some("started") {
                log.started_at = parts.next().unwrap_or("").to_string();
            }
            current = Some(log);
            section = Section::Preamble;
            in_note = false;
            continue;
        }
        if line.starts_with(NOTE_HEADER) {
            in_note = true;
            continue;
        }
        if in_note {
            continue;
        }
        let Some(log) = current.as_mut() else {
            continue;
        };
        match line {
            SECTION_PROMPT => section = Section::Prompt,
            SECTION_CONTEXT => section = Section::Context,
            SECTION_STREAM => section = Section::Stream,
            SECTION_STATUS => section = Section::Status,
            _ => match section {
                Section::Preamble => {}
                Section::Prompt => push_line(&mut log.prompt, line),
                Section::Context => push_line(&mut log.context, line),
                Section::Stream => {
                    if let Some(out) = line.strip_prefix(STDOUT_PREFIX) {
                        push_line(&mut log.stdout, out);
                    } else if let Some(err) = line.strip_prefix(STDERR_PREFIX) {
                        push_line(&mut log.stderr, err);
                    }
                }
                Section::Status => {
                    if let Some((key, value)) = line.split_once(':') {
                        let value = value.trim();
                        match key {
                            "outcome" => log.outcome = value.to_string(),
                            "exit_code" => log.exit_code = value.parse().ok(),
                            "duration_secs" => log.duration_secs = value.parse().ok(),
                            "summary" => log.summary = value.to_string(),
                            "note" => log.notes.push(value.to_string()),
                            "finished_at" => log.finished_at = value.to_string(),
                            _ => {}
                        }
                    }
                }
            },
        }
    }
    if let Some(done) = current.take() {
        attempts.push(done);
    }
    attempts
}

fn push_line(target: &mut String, line: &str) {
    if !target.is_empty() {
        target.push('\n');
    }
    target.push_str(line);
}

#[cfg(test)]
mod tests {
    use super::*;
    use fm_core::types::enums::AttemptOutcome;
    use tempfile::TempDir;

    #[test]
    fn attempt_blocks_round_trip_through_the_parser() {
        let dir = TempDir::new().unwrap();
        let writer = TranscriptWriter::new(dir.path());
        let id = PromptId::generate();

        writer
            .begin_attempt(&id, 1, "fix the login test", "Project focus: Web")
            .unwrap();
        writer
            .append_chunk(&id, 1, StreamKind::Stdout, "working on it\n")
            .unwrap();
        writer
            .append_chunk(&id, 1, StreamKind::Stderr, "warning: flaky\n")
            .unwrap();
        writer
            .append_chunk(&id, 1, StreamKind::Stdout, "done\n")
            .unwrap();
        writer
            .close_attempt(
                &id,
                1,
                &AttemptFooter {
                    outcome: AttemptOutcome::Completed,
                    exit_code: Some(0),
                    duration_secs: 1.5,
                    summary: "agent run succeeded".to_string(),
                    workflow_notes: vec!["merged branch".to_string()],
                    finished_at: Utc::now(),
                },
            )
            .unwrap();

        let attempts = parse_transcript(&writer.read(&id).unwrap());
        assert_eq!(attempts.len(), 1);
        let log = &attempts[0];
        assert_eq!(log.attempt, 1);
        assert_eq!(log.prompt, "fix the login test");
        assert_eq!(log.context, "Project focus: Web");
        assert_eq!(log.stdout, "working on it\ndone");
        assert_eq!(log.stderr, "warning: flaky");
        assert_eq!(log.outcome, "completed");
        assert_eq!(log.exit_code, Some(0));
        assert_eq!(log.duration_secs, Some(1.5));
        assert_eq!(log.summary, "agent run succeeded");
        assert_eq!(log.notes, vec!["merged branch".to_string()]);
    }

    #[test]
    fn retries_append_further_blocks() {
        let dir = TempDir::new().unwrap();
        let writer = TranscriptWriter::new(dir.path());
        let id = PromptId::generate();
        for attempt in 1..=2 {
            writer.begin_attempt(&id, attempt, "retry me", "").unwrap();
            writer
                .close_attempt(
                    &id,
                    attempt,
                    &AttemptFooter {
                        outcome: AttemptOutcome::Failed,
                        exit_code: Some(1),
                        duration_secs: 0.1,
                        summary: "nope".to_string(),
                        workflow_notes: Vec::new(),
                        finished_at: Utc::now(),
                    },
                )
                .unwrap();
        }
        let attempts = parse_transcript(&writer.read(&id).unwrap());
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1].attempt, 2);
        assert_eq!(attempts[0].context, "<context unavailable>");
    }

    #[test]
    fn truncated_block_still_parses() {
        let dir = TempDir::new().unwrap();
        let writer = TranscriptWriter::new(dir.path());
        let id = PromptId::generate();
        writer.begin_attempt(&id, 1, "crashed mid-run", "").unwrap();
        writer
            .append_chunk(&id, 1, StreamKind::Stdout, "partial output\n")
            .unwrap();
        // No close_attempt: the engine crashed here.
        let attempts = parse_transcript(&writer.read(&id).unwrap());
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].stdout, "partial output");
        assert!(attempts[0].outcome.is_empty());
    }

    #[test]
    fn notes_between_attempts_are_ignored_by_the_parser() {
        let dir = TempDir::new().unwrap();
        let writer = TranscriptWriter::new(dir.path());
        let id = PromptId::generate();
        writer.begin_attempt(&id, 1, "p", "").unwrap();
        writer
            .append_note(&id, "prompt interrupted when the engine restarted")
            .unwrap();
        let attempts = parse_transcript(&writer.read(&id).unwrap());
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].stdout.is_empty());
    }
}
