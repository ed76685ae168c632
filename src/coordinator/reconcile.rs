use super::*;

use crate::inflight::InFlightTask;
use crate::now_ms;

/// Tasks untouched for longer than this are left alone by reconciliation.
pub const RECONCILE_MAX_AGE_MS: i64 = 24 * 60 * 60 * 1000;

impl Coordinator {
    /// Boot reconciliation: tasks that were mid-flight when the gateway went
    /// down get a visible interruption marker and become resumable.
    ///
    /// For each unhandled task in `queued`/`working`/`waiting` no older than
    /// `max_age_ms`: lingering app-operated typing reactions are removed,
    /// the error emoji is painted, one interruption notice is sent replying
    /// to the anchor, and the task is recorded as the chat's last
    /// interruptible. The store is persisted once at the end.
    pub async fn reconcile(&self, max_age_ms: i64) -> crate::Result<usize> {
        let snapshot = self.inflight.snapshot();
        let now = now_ms();

        let orphans: Vec<InFlightTask> = snapshot
            .tasks
            .iter()
            .filter(|task| {
                matches!(
                    task.state,
                    TaskState::Queued | TaskState::Working | TaskState::Waiting
                ) && !task.interrupted_handled
                    && now - task.updated_at_ms <= max_age_ms
            })
            .cloned()
            .collect();

        if orphans.is_empty() {
            return Ok(0);
        }
        tracing::info!(count = orphans.len(), "reconciling interrupted tasks");

        let mut handled = Vec::with_capacity(orphans.len());
        for mut task in orphans {
            self.cleanup_typing_reactions(&task.message_id).await;

            self.transition(&mut task, TaskState::Interrupted).await;
            task.interrupted_handled = true;

            if let Err(error) = self
                .provider
                .send_message(
                    &crate::provider::OutboundMessage::new(
                        task.chat_id.as_str(),
                        "网关已重启，这个任务被中断了。回复「继续」/ continue 可以恢复。",
                    )
                    .replying_to(task.message_id.as_str()),
                )
                .await
            {
                tracing::warn!(%error, task_id = %task.id, "failed to send interruption notice");
            }

            tracing::info!(
                task_id = %task.id,
                anchor = %task.message_id,
                "task marked interrupted"
            );
            handled.push(task);
        }

        let count = handled.len();
        self.inflight
            .update(move |file| {
                for task in handled {
                    file.set_last_interruptible(&task.chat_id, &task.id);
                    file.upsert_task(task);
                }
            })
            .await?;
        Ok(count)
    }

    /// Remove typing-indicator reactions the app left on an anchor.
    /// User-added reactions of the same emoji are not touched.
    async fn cleanup_typing_reactions(&self, message_id: &str) {
        let reactions = match self
            .provider
            .list_reactions(message_id, emoji::TYPING)
            .await
        {
            Ok(reactions) => reactions,
            Err(error) => {
                tracing::warn!(%error, message_id, "failed to list typing reactions");
                return;
            }
        };

        for reaction in reactions {
            if reaction.operator_type != "app" {
                continue;
            }
            if let Err(error) = self
                .provider
                .remove_reaction(message_id, &reaction.reaction_id)
                .await
            {
                tracing::warn!(%error, message_id, "failed to remove typing reaction");
            }
        }
    }
}
