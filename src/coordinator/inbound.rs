use super::*;

use crate::history::HistoryEntry;
use crate::inbound::GateDecision;
use crate::inflight::types::{clamp_original_text, create_id};
use crate::inflight::InFlightTask;
use crate::{ChatType, InboundEvent, Mention, now_ms};

use regex::Regex;
use std::sync::OnceLock;

/// Commands that resume the last interruptible task instead of starting a
/// new one.
fn resume_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)^\s*(继续|continue|resume)\b").expect("pattern is valid"))
}

impl Coordinator {
    /// Entry point for provider message events. Never propagates errors to
    /// the event source: failures are logged and the event is dropped.
    pub async fn handle_event(self: &Arc<Self>, event: InboundEvent) {
        let message_id = event.message_id.clone();
        if let Err(error) = self.process_event(event).await {
            tracing::error!(%error, message_id, "inbound handling failed");
        }
    }

    async fn process_event(self: &Arc<Self>, event: InboundEvent) -> crate::Result<()> {
        // Layer one: absorb the websocket-reconnect re-delivery burst.
        if !self.gate.try_record_in_memory(&event.message_id).await {
            tracing::debug!(message_id = %event.message_id, "duplicate delivery dropped (in-memory)");
            return Ok(());
        }

        if let Some(name) = &event.sender_name {
            self.sender_names
                .lock()
                .await
                .insert(event.sender_open_id.clone(), name.clone());
        }

        let (content, mentions_bot, mention_targets) =
            strip_bot_mentions(&event.content, &event.mentions, self.bot_open_id.as_deref());

        // Layer two: the persistent per-chat gate.
        match self
            .gate
            .check_persistent(&event.chat_id, &event.message_id, event.create_time_ms)
            .await
        {
            GateDecision::Accept => {}
            GateDecision::Duplicate => {
                tracing::debug!(message_id = %event.message_id, "duplicate delivery dropped (persistent)");
                return Ok(());
            }
            GateDecision::Stale {
                sent_at_ms,
                last_processed_sent_at_ms,
            } => {
                tracing::info!(
                    message_id = %event.message_id,
                    sent_at_ms,
                    last_processed_sent_at_ms,
                    "stale out-of-order delivery dropped"
                );
                if self.gate.config().reply {
                    let notice = format!(
                        "过期消息，被忽略。message_time={sent_at_ms} \
                         watermark={last_processed_sent_at_ms} reason=out_of_order_delivery"
                    );
                    if let Err(error) = self
                        .send_text(&event.chat_id, &notice, Some(&event.message_id))
                        .await
                    {
                        tracing::warn!(%error, "failed to send stale-drop notice");
                    }
                }
                return Ok(());
            }
        }

        if !self.admit(&event, mentions_bot, &content).await {
            return Ok(());
        }

        if resume_pattern().is_match(&content) {
            return self.handle_resume(&event).await;
        }

        self.start_new_task(&event, content, mention_targets).await
    }

    /// Policy checks. Gated-out group messages are still recorded into the
    /// per-chat history ring so a later mention has context; denied DMs are
    /// dropped silently.
    async fn admit(&self, event: &InboundEvent, mentions_bot: bool, content: &str) -> bool {
        match event.chat_type {
            ChatType::Group => {
                let chat_allowed = self.policy.group_allowlist.is_empty()
                    || self.policy.group_allowlist.contains(&event.chat_id);
                let sender_allowed = match self.policy.group_sender_allowlist.get(&event.chat_id) {
                    Some(allowed) => allowed.contains(&event.sender_open_id),
                    None => true,
                };
                let mention_ok = !self.policy.require_mention || mentions_bot;

                if chat_allowed && sender_allowed && mention_ok {
                    return true;
                }
                tracing::debug!(
                    chat_id = %event.chat_id,
                    sender = %event.sender_open_id,
                    chat_allowed,
                    sender_allowed,
                    mention_ok,
                    "group message gated out, recording history"
                );
                let label = self.sender_label(&event.sender_open_id).await;
                self.history.lock().await.record(
                    &event.chat_id,
                    HistoryEntry {
                        sender_label: label,
                        text: content.to_string(),
                        at_ms: event.create_time_ms,
                    },
                );
                false
            }
            ChatType::Direct => {
                self.policy.dm_allowlist.is_empty()
                    || self.policy.dm_allowlist.contains(&event.sender_open_id)
            }
        }
    }

    /// Resume the last interruptible task in this chat, if any.
    async fn handle_resume(self: &Arc<Self>, event: &InboundEvent) -> crate::Result<()> {
        let snapshot = self.inflight.snapshot();
        let candidate = snapshot
            .get_last_interruptible_task(&event.chat_id)
            .filter(|task| task.can_resume())
            .filter(|task| {
                // In groups, only the task's own user may resume it.
                !event.chat_type.is_group()
                    || task
                        .user_open_id
                        .as_deref()
                        .is_none_or(|owner| owner == event.sender_open_id)
            })
            .cloned();

        let Some(mut task) = candidate else {
            tracing::info!(chat_id = %event.chat_id, "no resumable task for continue command");
            if let Err(error) = self
                .send_text(
                    &event.chat_id,
                    "没有可以继续的任务。(No prior task to resume.)",
                    Some(&event.message_id),
                )
                .await
            {
                tracing::warn!(%error, "failed to send no-resumable reply");
            }
            return Ok(());
        };

        task.resume_attempts += 1;
        task.run_id = create_id();
        task.interrupted_handled = false;
        tracing::info!(
            task_id = %task.id,
            attempt = task.resume_attempts,
            anchor = %task.message_id,
            "resuming interruptible task"
        );

        self.run_task(task, event, Vec::new()).await
    }

    async fn start_new_task(
        self: &Arc<Self>,
        event: &InboundEvent,
        content: String,
        mention_targets: Vec<String>,
    ) -> crate::Result<()> {
        if let Some(existing) = self.inflight.snapshot().find_by_message_id(&event.message_id) {
            tracing::warn!(
                message_id = %event.message_id,
                task_id = %existing.id,
                "anchor already has a task, dropping delivery"
            );
            return Ok(());
        }

        let (original_text, truncated) = clamp_original_text(&content);
        let task = InFlightTask {
            id: create_id(),
            provider: PROVIDER_TAG.to_string(),
            account_id: self.account_id.clone(),
            chat_id: event.chat_id.clone(),
            chat_type: event.chat_type,
            user_open_id: Some(event.sender_open_id.clone()),
            message_id: event.message_id.clone(),
            original_text,
            truncated,
            state: TaskState::Received,
            reaction: None,
            resume_attempts: 0,
            updated_at_ms: now_ms(),
            interrupted_handled: false,
            run_id: create_id(),
        };

        self.run_task(task, event, mention_targets).await
    }

    pub(crate) async fn sender_label(&self, open_id: &str) -> String {
        if let Some(name) = self.sender_names.lock().await.get(open_id) {
            return name.clone();
        }
        let tail: String = open_id
            .chars()
            .rev()
            .take(6)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("user_{tail}")
    }
}

/// Strip bot mentions from content and collect the remaining targets.
///
/// Non-bot mention keys are rewritten to readable `@name` form; when the
/// bot's own open_id is unknown, any mention is treated as addressing it.
fn strip_bot_mentions(
    content: &str,
    mentions: &[Mention],
    bot_open_id: Option<&str>,
) -> (String, bool, Vec<String>) {
    let mut text = content.to_string();
    let mut mentions_bot = false;
    let mut targets = Vec::new();

    for mention in mentions {
        let is_bot = match bot_open_id {
            Some(bot) => mention.open_id.as_deref() == Some(bot),
            None => true,
        };
        if is_bot {
            mentions_bot = true;
            if !mention.key.is_empty() {
                text = text.replace(&mention.key, "");
            }
        } else {
            let name = mention
                .name
                .clone()
                .unwrap_or_else(|| mention.key.clone());
            if !mention.key.is_empty() {
                text = text.replace(&mention.key, &format!("@{name}"));
            }
            targets.push(name);
        }
    }

    (text.trim().to_string(), mentions_bot, targets)
}
