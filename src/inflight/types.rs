//! In-flight task record and pure store-file helpers.

use crate::ChatType;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Original prompt text is clamped before persisting.
pub const ORIGINAL_TEXT_MAX_CHARS: usize = 8_000;

/// Resume is refused once a task has been retried this many times.
pub const MAX_RESUME_ATTEMPTS: u32 = 2;

/// Lifecycle state of an in-flight task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Received,
    Queued,
    Working,
    Waiting,
    Done,
    Failed,
    Interrupted,
}

impl TaskState {
    /// Terminal states never change except via explicit resume.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Interrupted)
    }

    /// Only failed and interrupted tasks can be resumed with "continue".
    /// Waiting is not resumable: it self-finalizes when the follow-up lands.
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Failed | Self::Interrupted)
    }
}

/// The status emoji currently displayed on the anchor, and the provider
/// handle needed to remove it on the next transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji_type: String,
    pub reaction_id: String,
}

/// One durable task bound to an anchor message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InFlightTask {
    pub id: String,
    pub provider: String,
    pub account_id: String,
    pub chat_id: String,
    pub chat_type: ChatType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_open_id: Option<String>,
    /// Anchor message on the provider. Immutable, stable across resumes.
    pub message_id: String,
    pub original_text: String,
    #[serde(default)]
    pub truncated: bool,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction: Option<Reaction>,
    #[serde(default)]
    pub resume_attempts: u32,
    pub updated_at_ms: i64,
    #[serde(default)]
    pub interrupted_handled: bool,
    #[serde(default)]
    pub run_id: String,
}

impl InFlightTask {
    pub fn can_resume(&self) -> bool {
        self.state.is_resumable() && self.resume_attempts < MAX_RESUME_ATTEMPTS
    }
}

/// Clamp original prompt text to the persistence limit.
/// Returns the clamped text and whether clamping occurred.
pub fn clamp_original_text(text: &str) -> (String, bool) {
    if text.chars().count() <= ORIGINAL_TEXT_MAX_CHARS {
        return (text.to_string(), false);
    }
    (text.chars().take(ORIGINAL_TEXT_MAX_CHARS).collect(), true)
}

/// Generate a new opaque task id.
pub fn create_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// On-disk store layout: one file per account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreFile {
    pub version: u32,
    #[serde(default)]
    pub tasks: Vec<InFlightTask>,
    /// Most recent resumable task per chat, pointed at by "continue".
    #[serde(default)]
    pub last_interruptible_by_chat_id: HashMap<String, String>,
}

impl Default for StoreFile {
    fn default() -> Self {
        Self {
            version: 1,
            tasks: Vec::new(),
            last_interruptible_by_chat_id: HashMap::new(),
        }
    }
}

impl StoreFile {
    /// Insert or replace a task by id.
    pub fn upsert_task(&mut self, task: InFlightTask) {
        if let Some(existing) = self.tasks.iter_mut().find(|t| t.id == task.id) {
            *existing = task;
        } else {
            self.tasks.push(task);
        }
    }

    /// Remove a task by id, returning it when present.
    pub fn remove_task(&mut self, task_id: &str) -> Option<InFlightTask> {
        let position = self.tasks.iter().position(|t| t.id == task_id)?;
        Some(self.tasks.remove(position))
    }

    pub fn get_task(&self, task_id: &str) -> Option<&InFlightTask> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    /// At most one task exists per anchor message.
    pub fn find_by_message_id(&self, message_id: &str) -> Option<&InFlightTask> {
        self.tasks.iter().find(|t| t.message_id == message_id)
    }

    pub fn set_last_interruptible(&mut self, chat_id: &str, task_id: &str) {
        self.last_interruptible_by_chat_id
            .insert(chat_id.to_string(), task_id.to_string());
    }

    pub fn get_last_interruptible_task(&self, chat_id: &str) -> Option<&InFlightTask> {
        let task_id = self.last_interruptible_by_chat_id.get(chat_id)?;
        self.get_task(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, message_id: &str) -> InFlightTask {
        InFlightTask {
            id: id.to_string(),
            provider: "feishu".to_string(),
            account_id: "acc".to_string(),
            chat_id: "oc_1".to_string(),
            chat_type: ChatType::Direct,
            user_open_id: None,
            message_id: message_id.to_string(),
            original_text: "hi".to_string(),
            truncated: false,
            state: TaskState::Received,
            reaction: None,
            resume_attempts: 0,
            updated_at_ms: 0,
            interrupted_handled: false,
            run_id: String::new(),
        }
    }

    #[test]
    fn upsert_replaces_by_id() {
        let mut store = StoreFile::default();
        store.upsert_task(task("t1", "om_1"));
        let mut updated = task("t1", "om_1");
        updated.state = TaskState::Working;
        store.upsert_task(updated);

        assert_eq!(store.tasks.len(), 1);
        assert_eq!(store.tasks[0].state, TaskState::Working);
    }

    #[test]
    fn last_interruptible_resolves_to_task() {
        let mut store = StoreFile::default();
        let mut failed = task("t1", "om_1");
        failed.state = TaskState::Failed;
        store.upsert_task(failed);
        store.set_last_interruptible("oc_1", "t1");

        let resolved = store
            .get_last_interruptible_task("oc_1")
            .expect("should resolve");
        assert_eq!(resolved.id, "t1");
        assert!(resolved.can_resume());

        store.remove_task("t1");
        assert!(store.get_last_interruptible_task("oc_1").is_none());
    }

    #[test]
    fn resume_cap_is_enforced() {
        let mut interrupted = task("t1", "om_1");
        interrupted.state = TaskState::Interrupted;
        interrupted.resume_attempts = MAX_RESUME_ATTEMPTS;
        assert!(!interrupted.can_resume());
    }

    #[test]
    fn clamp_limits_and_flags() {
        let (text, truncated) = clamp_original_text("short");
        assert_eq!(text, "short");
        assert!(!truncated);

        let long: String = "字".repeat(ORIGINAL_TEXT_MAX_CHARS + 100);
        let (clamped, truncated) = clamp_original_text(&long);
        assert_eq!(clamped.chars().count(), ORIGINAL_TEXT_MAX_CHARS);
        assert!(truncated);
    }
}
