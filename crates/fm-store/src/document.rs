use chrono::Utc;
use fm_core::store::{PromptStore, TransitionFields};
use fm_core::types::enums::PromptStatus;
use fm_core::types::ids::{ProjectId, PromptId};
use fm_core::types::io::{
    DurationAggregate, DurationStats, HealthSnapshot, OldestInfo, QueueItem, QueueSnapshot,
    StatusCounts,
};
use fm_core::types::prompt::{Attempt, Prompt};
use fm_core::validation::validate_status_transition;
use fm_core::StoreError;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Rolling window over finished attempts for the health duration stats.
const DURATION_WINDOW: usize = 50;

/// The prompt store: one versioned JSON document mapping prompt id to record,
/// rewritten via an atomic replace on every mutation so a reader never sees a
/// half-written state. One mutex guards all mutation; critical sections stay
/// clear of external-process I/O.
pub struct JsonStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, Prompt>>,
}

impl JsonStore {
    /// Load or initialize the backing document. A document that exists but
    /// does not parse is a fatal error: silent data loss is worse than a
    /// refused boot.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            atomic_write(&path, b"{}\n")?;
        }
        let raw = fs::read_to_string(&path)?;
        let mut records: BTreeMap<String, Prompt> =
            serde_json::from_str(&raw).map_err(|err| StoreError::Corrupt {
                message: format!("{}: {err}", path.display()),
            })?;
        // A cancellation request cannot outlive the process asked to act on it.
        for prompt in records.values_mut() {
            prompt.cancel_requested = false;
        }
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Prompt>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn persist(&self, records: &BTreeMap<String, Prompt>) -> Result<(), StoreError> {
        let mut serialized =
            serde_json::to_string_pretty(records).map_err(|err| StoreError::Io {
                message: err.to_string(),
            })?;
        serialized.push('\n');
        atomic_write(&self.path, serialized.as_bytes())
    }

    fn mutate<T>(
        &self,
        id: &PromptId,
        apply: impl FnOnce(&mut Prompt) -> Result<T, StoreError>,
    ) -> Result<(T, Prompt), StoreError> {
        let mut records = self.lock();
        let prompt = records
            .get_mut(id.as_str())
            .ok_or(StoreError::NotFound)?;
        let value = apply(prompt)?;
        prompt.updated_at = Utc::now();
        let snapshot = prompt.clone();
        self.persist(&records)?;
        Ok((value, snapshot))
    }
}

impl PromptStore for JsonStore {
    fn enqueue(&self, text: &str, project_id: Option<ProjectId>) -> Result<Prompt, StoreError> {
        let prompt = Prompt::new(PromptId::generate(), text.to_string(), project_id);
        let mut records = self.lock();
        records.insert(prompt.id.as_str().to_string(), prompt.clone());
        self.persist(&records)?;
        Ok(prompt)
    }

    fn get(&self, id: &PromptId) -> Result<Option<Prompt>, StoreError> {
        Ok(self.lock().get(id.as_str()).cloned())
    }

    fn list(&self) -> Result<Vec<Prompt>, StoreError> {
        let records = self.lock();
        let mut queued = Vec::new();
        let mut running = Vec::new();
        let mut rest = Vec::new();
        for prompt in records.values() {
            match prompt.status {
                PromptStatus::Queued => queued.push(prompt.clone()),
                PromptStatus::Running => running.push(prompt.clone()),
                _ => rest.push(prompt.clone()),
            }
        }
        queued.sort_by(|a, b| {
            a.enqueued_at
                .cmp(&b.enqueued_at)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });
        rest.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        queued.extend(running);
        queued.extend(rest);
        Ok(queued)
    }

    fn edit_text(&self, id: &PromptId, text: &str) -> Result<Prompt, StoreError> {
        let (_, prompt) = self.mutate(id, |prompt| {
            if prompt.status != PromptStatus::Queued {
                return Err(StoreError::InvalidState {
                    message: "prompt can only be edited while queued".to_string(),
                });
            }
            prompt.text = text.to_string();
            Ok(())
        })?;
        Ok(prompt)
    }

    fn delete(&self, id: &PromptId) -> Result<Prompt, StoreError> {
        let mut records = self.lock();
        let prompt = records.get(id.as_str()).ok_or(StoreError::NotFound)?;
        if prompt.status != PromptStatus::Queued {
            return Err(StoreError::InvalidState {
                message: "prompt can only be deleted while queued".to_string(),
            });
        }
        let removed = records
            .remove(id.as_str())
            .ok_or(StoreError::NotFound)?;
        self.persist(&records)?;
        Ok(removed)
    }

    fn transition(
        &self,
        id: &PromptId,
        to: PromptStatus,
        fields: TransitionFields,
    ) -> Result<Prompt, StoreError> {
        let (_, prompt) = self.mutate(id, |prompt| {
            validate_status_transition(prompt.status, to)?;
            let now = Utc::now();
            let from = prompt.status;
            prompt.status = to;
            match to {
                PromptStatus::Queued => {
                    prompt.enqueued_at = now;
                    prompt.started_at = None;
                    prompt.finished_at = None;
                    prompt.cancel_requested = false;
                    // branch_name survives a requeue: a failed attempt may
                    // have left its branch checked out for inspection.
                }
                PromptStatus::Running => {
                    prompt.started_at = Some(now);
                }
                _ => {
                    if from == PromptStatus::Running {
                        prompt.finished_at = Some(now);
                        prompt.cancel_requested = false;
                    }
                }
            }
            if let Some(summary) = fields.result_summary {
                prompt.result_summary = Some(summary);
            }
            if let Some(requires_follow_up) = fields.requires_follow_up {
                prompt.requires_follow_up = requires_follow_up;
            }
            Ok(())
        })?;
        Ok(prompt)
    }

    fn append_attempt(&self, id: &PromptId, attempt: Attempt) -> Result<Prompt, StoreError> {
        let (_, prompt) = self.mutate(id, |prompt| {
            let mut attempt = attempt;
            if attempt.sequence != prompt.attempts.len() as u32 + 1 {
                return Err(StoreError::InvalidInput {
                    message: format!(
                        "attempt sequence {} does not extend {} recorded attempts",
                        attempt.sequence,
                        prompt.attempts.len()
                    ),
                });
            }
            let waited = (attempt.started_at - prompt.enqueued_at).num_milliseconds();
            attempt.wait_secs = Some(if waited < 0 { 0.0 } else { waited as f64 / 1000.0 });
            prompt.attempts.push(attempt);
            Ok(())
        })?;
        Ok(prompt)
    }

    fn update_attempt(&self, id: &PromptId, attempt: Attempt) -> Result<Prompt, StoreError> {
        let (_, prompt) = self.mutate(id, |prompt| {
            let slot = prompt
                .attempts
                .iter_mut()
                .find(|existing| existing.sequence == attempt.sequence)
                .ok_or_else(|| StoreError::InvalidInput {
                    message: format!("attempt {} not found", attempt.sequence),
                })?;
            // Attempts are append-only: closing fills fields in place, the
            // dequeue-time wait stays as recorded.
            let wait_secs = slot.wait_secs;
            *slot = attempt;
            slot.wait_secs = slot.wait_secs.or(wait_secs);
            Ok(())
        })?;
        Ok(prompt)
    }

    fn set_cancel_requested(&self, id: &PromptId, value: bool) -> Result<Prompt, StoreError> {
        let (_, prompt) = self.mutate(id, |prompt| {
            prompt.cancel_requested = value;
            Ok(())
        })?;
        Ok(prompt)
    }

    fn set_branch(&self, id: &PromptId, branch: Option<String>) -> Result<Prompt, StoreError> {
        let (_, prompt) = self.mutate(id, |prompt| {
            prompt.branch_name = branch;
            Ok(())
        })?;
        Ok(prompt)
    }

    fn next_queued(&self) -> Result<Option<Prompt>, StoreError> {
        let records = self.lock();
        Ok(records
            .values()
            .filter(|prompt| prompt.status == PromptStatus::Queued)
            .min_by(|a, b| {
                a.enqueued_at
                    .cmp(&b.enqueued_at)
                    .then_with(|| a.id.as_str().cmp(b.id.as_str()))
            })
            .cloned())
    }

    fn snapshot(&self) -> Result<QueueSnapshot, StoreError> {
        let ordered = self.list()?;
        let mut counts = StatusCounts::default();
        for prompt in &ordered {
            counts.bump(prompt.status);
        }
        let mut queue_position = 0usize;
        let items = ordered
            .into_iter()
            .map(|prompt| {
                let position = (prompt.status == PromptStatus::Queued).then(|| {
                    let position = queue_position;
                    queue_position += 1;
                    position
                });
                QueueItem {
                    prompt,
                    queue_position: position,
                }
            })
            .collect();
        Ok(QueueSnapshot { items, counts })
    }

    fn health(&self) -> Result<HealthSnapshot, StoreError> {
        let records = self.lock();
        let now = Utc::now();
        let mut counts = StatusCounts::default();
        let mut oldest_queued: Option<OldestInfo> = None;
        let mut oldest_running: Option<OldestInfo> = None;
        let mut finished: Vec<(chrono::DateTime<Utc>, Option<f64>, Option<f64>)> = Vec::new();

        for prompt in records.values() {
            counts.bump(prompt.status);
            match prompt.status {
                PromptStatus::Queued => {
                    replace_if_older(&mut oldest_queued, prompt, prompt.enqueued_at, now);
                }
                PromptStatus::Running => {
                    if let Some(started_at) = prompt.started_at {
                        replace_if_older(&mut oldest_running, prompt, started_at, now);
                    }
                }
                _ => {}
            }
            for attempt in &prompt.attempts {
                if let Some(finished_at) = attempt.finished_at {
                    finished.push((finished_at, attempt.wait_secs, attempt.duration_secs));
                }
            }
        }

        finished.sort_by_key(|entry| entry.0);
        let window: Vec<_> = finished.iter().rev().take(DURATION_WINDOW).collect();
        let durations = DurationStats {
            window: DURATION_WINDOW,
            samples: window.len(),
            wait: aggregate(window.iter().filter_map(|entry| entry.1)),
            run: aggregate(window.iter().filter_map(|entry| entry.2)),
        };

        Ok(HealthSnapshot {
            timestamp: now,
            counts,
            oldest_queued,
            oldest_running,
            durations,
        })
    }
}

fn replace_if_older(
    slot: &mut Option<OldestInfo>,
    prompt: &Prompt,
    timestamp: chrono::DateTime<Utc>,
    now: chrono::DateTime<Utc>,
) {
    let is_older = slot
        .as_ref()
        .is_none_or(|current| timestamp < current.timestamp);
    if is_older {
        let age = (now - timestamp).num_milliseconds();
        *slot = Some(OldestInfo {
            prompt_id: prompt.id.clone(),
            timestamp,
            age_secs: if age < 0 { 0.0 } else { age as f64 / 1000.0 },
        });
    }
}

fn aggregate(values: impl Iterator<Item = f64>) -> DurationAggregate {
    let mut sum = 0.0;
    let mut max: Option<f64> = None;
    let mut count = 0usize;
    for value in values {
        sum += value;
        max = Some(max.map_or(value, |current| current.max(value)));
        count += 1;
    }
    DurationAggregate {
        average: (count > 0).then(|| sum / count as f64),
        max,
        count,
    }
}

/// Write-to-temp, fsync, atomic rename. The document is never observable in
/// a half-written state.
fn atomic_write(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());
    let temp_path = parent.join(format!(".{file_name}.tmp"));
    {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fm_core::types::enums::AttemptOutcome;
    use tempfile::TempDir;

    fn store() -> (TempDir, JsonStore) {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::open(dir.path().join("prompts.json")).unwrap();
        (dir, store)
    }

    #[test]
    fn enqueue_assigns_queued_status_and_persists() {
        let (dir, store) = store();
        let prompt = store.enqueue("do the thing", None).unwrap();
        assert_eq!(prompt.status, PromptStatus::Queued);

        let reloaded = JsonStore::open(dir.path().join("prompts.json")).unwrap();
        let found = reloaded.get(&prompt.id).unwrap().unwrap();
        assert_eq!(found.text, "do the thing");
    }

    #[test]
    fn corrupt_document_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prompts.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            JsonStore::open(&path),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn next_queued_follows_enqueue_order() {
        let (_dir, store) = store();
        let first = store.enqueue("first", None).unwrap();
        let _second = store.enqueue("second", None).unwrap();
        assert_eq!(store.next_queued().unwrap().unwrap().id, first.id);
    }

    #[test]
    fn requeue_moves_to_back_of_fifo() {
        let (_dir, store) = store();
        let first = store.enqueue("first", None).unwrap();
        let second = store.enqueue("second", None).unwrap();

        store
            .transition(&first.id, PromptStatus::Running, TransitionFields::default())
            .unwrap();
        store
            .transition(&first.id, PromptStatus::Failed, TransitionFields::default())
            .unwrap();
        store
            .transition(&first.id, PromptStatus::Queued, TransitionFields::default())
            .unwrap();

        assert_eq!(store.next_queued().unwrap().unwrap().id, second.id);
    }

    #[test]
    fn transition_validates_the_state_machine() {
        let (_dir, store) = store();
        let prompt = store.enqueue("x", None).unwrap();
        assert!(matches!(
            store.transition(&prompt.id, PromptStatus::Completed, TransitionFields::default()),
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn leaving_running_stamps_finished_and_clears_cancel_flag() {
        let (_dir, store) = store();
        let prompt = store.enqueue("x", None).unwrap();
        store
            .transition(&prompt.id, PromptStatus::Running, TransitionFields::default())
            .unwrap();
        store.set_cancel_requested(&prompt.id, true).unwrap();
        let done = store
            .transition(
                &prompt.id,
                PromptStatus::Canceled,
                TransitionFields::default(),
            )
            .unwrap();
        assert!(done.finished_at.is_some());
        assert!(!done.cancel_requested);
    }

    #[test]
    fn edit_and_delete_require_queued() {
        let (_dir, store) = store();
        let prompt = store.enqueue("x", None).unwrap();
        store
            .transition(&prompt.id, PromptStatus::Running, TransitionFields::default())
            .unwrap();
        assert!(matches!(
            store.edit_text(&prompt.id, "new"),
            Err(StoreError::InvalidState { .. })
        ));
        assert!(matches!(
            store.delete(&prompt.id),
            Err(StoreError::InvalidState { .. })
        ));
    }

    #[test]
    fn attempts_are_append_only_and_record_wait() {
        let (_dir, store) = store();
        let prompt = store.enqueue("x", None).unwrap();
        store
            .transition(&prompt.id, PromptStatus::Running, TransitionFields::default())
            .unwrap();
        let updated = store.append_attempt(&prompt.id, Attempt::open(1)).unwrap();
        assert_eq!(updated.attempts.len(), 1);
        assert!(updated.attempts[0].wait_secs.is_some());

        // Sequence must extend the list, never rewrite it.
        assert!(store.append_attempt(&prompt.id, Attempt::open(1)).is_err());

        let mut attempt = updated.attempts[0].clone();
        attempt.close(AttemptOutcome::Completed, None, Some(0), "done");
        let closed = store.update_attempt(&prompt.id, attempt).unwrap();
        assert_eq!(closed.attempts[0].outcome, Some(AttemptOutcome::Completed));
        assert!(closed.attempts[0].wait_secs.is_some());
    }

    #[test]
    fn snapshot_orders_queued_first_with_positions() {
        let (_dir, store) = store();
        let first = store.enqueue("first", None).unwrap();
        let second = store.enqueue("second", None).unwrap();
        store
            .transition(&first.id, PromptStatus::Running, TransitionFields::default())
            .unwrap();

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.counts.queued, 1);
        assert_eq!(snapshot.counts.running, 1);
        assert_eq!(snapshot.items[0].prompt.id, second.id);
        assert_eq!(snapshot.items[0].queue_position, Some(0));
        assert_eq!(snapshot.items[1].prompt.id, first.id);
        assert_eq!(snapshot.items[1].queue_position, None);
    }

    #[test]
    fn cancel_requested_does_not_survive_reload() {
        let (dir, store) = store();
        let prompt = store.enqueue("x", None).unwrap();
        store
            .transition(&prompt.id, PromptStatus::Running, TransitionFields::default())
            .unwrap();
        store.set_cancel_requested(&prompt.id, true).unwrap();

        let reloaded = JsonStore::open(dir.path().join("prompts.json")).unwrap();
        assert!(!reloaded.get(&prompt.id).unwrap().unwrap().cancel_requested);
    }

    #[test]
    fn health_reports_counts_and_oldest_ages() {
        let (_dir, store) = store();
        let queued = store.enqueue("waiting", None).unwrap();
        let health = store.health().unwrap();
        assert_eq!(health.counts.queued, 1);
        assert_eq!(
            health.oldest_queued.as_ref().map(|info| &info.prompt_id),
            Some(&queued.id)
        );
        assert_eq!(health.durations.samples, 0);
    }
}
