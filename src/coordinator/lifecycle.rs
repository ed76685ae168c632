use super::*;

use crate::agent::{AgentEnvelope, AgentSignal, DispatchOutcome};
use crate::announce::{AnnounceItem, AnnounceSettings, SendFn};
use crate::error::GatewayError;
use crate::inflight::InFlightTask;
use crate::provider::{OutboundMessage, SentMessage};
use crate::{InboundEvent, now_ms};

use futures::FutureExt as _;
use tokio::sync::mpsc;

/// Permission-error notices repeat at most once per app in this window.
const PERMISSION_NOTICE_COOLDOWN_MS: i64 = 5 * 60 * 1000;

impl Coordinator {
    /// Drive one task from `received` through dispatch to its final state.
    pub(crate) async fn run_task(
        self: &Arc<Self>,
        mut task: InFlightTask,
        event: &InboundEvent,
        mention_targets: Vec<String>,
    ) -> crate::Result<()> {
        self.transition(&mut task, TaskState::Received).await;
        self.save(&task).await;

        let envelope = self.build_envelope(&task, event, mention_targets).await;

        self.transition(&mut task, TaskState::Queued).await;
        self.save(&task).await;

        let outcome = self.dispatch_and_observe(&mut task, envelope).await;

        match &outcome {
            Ok(result) if result.final_count >= 1 => {
                self.transition(&mut task, TaskState::Done).await;
                if let Err(error) = self
                    .inflight
                    .update(|file| {
                        file.remove_task(&task.id);
                    })
                    .await
                {
                    tracing::warn!(%error, task_id = %task.id, "failed to delete finished task");
                }
                tracing::info!(task_id = %task.id, replies = result.final_count, "task done");
            }
            Ok(result) if result.queued_final => {
                // A follow-up is on its way; keep the record so the outbound
                // adapter can auto-finalize when it lands.
                self.transition(&mut task, TaskState::Waiting).await;
                self.save(&task).await;
                tracing::info!(task_id = %task.id, "task waiting for queued follow-up");
            }
            Ok(_) | Err(_) => {
                if let Err(error) = &outcome {
                    tracing::error!(%error, task_id = %task.id, "agent dispatch failed");
                    if error.is_permission_denied() {
                        self.notify_permission_error(&task.chat_id, error).await;
                    }
                }
                self.fail_task(&mut task).await;
            }
        }
        Ok(())
    }

    /// Mark a task failed, remember it as the chat's last interruptible,
    /// and invite the user to resume.
    async fn fail_task(self: &Arc<Self>, task: &mut InFlightTask) {
        self.transition(task, TaskState::Failed).await;
        let persisted = self
            .inflight
            .update(|file| {
                file.upsert_task(task.clone());
                file.set_last_interruptible(&task.chat_id, &task.id);
            })
            .await;
        if let Err(error) = persisted {
            tracing::warn!(%error, task_id = %task.id, "failed to persist failed task");
        }

        if let Err(error) = self
            .send_text(
                &task.chat_id,
                "本次任务未能完成。回复「继续」/ continue 可以从中断处恢复。",
                Some(&task.message_id),
            )
            .await
        {
            tracing::warn!(%error, task_id = %task.id, "failed to send resume hint");
        }
    }

    /// Run the dispatcher and watch its signal stream; the first
    /// user-visible reply flips the status from queued to working.
    async fn dispatch_and_observe(
        &self,
        task: &mut InFlightTask,
        envelope: AgentEnvelope,
    ) -> crate::Result<DispatchOutcome> {
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let dispatch = self.dispatcher.dispatch(envelope, signal_tx);
        tokio::pin!(dispatch);

        let outcome = loop {
            tokio::select! {
                outcome = &mut dispatch => break outcome,
                Some(signal) = signal_rx.recv() => {
                    self.on_agent_signal(task, signal).await;
                }
            }
        };

        // Signals buffered while the dispatch future resolved still count.
        while let Ok(signal) = signal_rx.try_recv() {
            self.on_agent_signal(task, signal).await;
        }

        outcome
    }

    async fn on_agent_signal(&self, task: &mut InFlightTask, signal: AgentSignal) {
        match signal {
            AgentSignal::ReplyStart => {
                if task.state == TaskState::Queued {
                    self.transition(task, TaskState::Working).await;
                    self.save(task).await;
                }
            }
        }
    }

    pub(crate) async fn build_envelope(
        &self,
        task: &InFlightTask,
        event: &InboundEvent,
        mention_targets: Vec<String>,
    ) -> AgentEnvelope {
        let quoted_text = match &event.parent_id {
            Some(parent_id) => match self.provider.fetch_message(parent_id).await {
                Ok(fetched) => fetched.and_then(|message| message.text),
                Err(error) => {
                    tracing::warn!(%error, parent_id, "failed to fetch quoted message");
                    None
                }
            },
            None => None,
        };

        let chat_context = if task.chat_type.is_group() {
            self.history.lock().await.render(&task.chat_id, 20)
        } else {
            None
        };

        AgentEnvelope {
            task_id: task.id.clone(),
            run_id: task.run_id.clone(),
            account_id: self.account_id.clone(),
            chat_id: task.chat_id.clone(),
            chat_type: task.chat_type,
            sender_label: self.sender_label(&event.sender_open_id).await,
            text: task.original_text.clone(),
            quoted_text,
            mention_targets,
            chat_context,
            timestamp_ms: event.create_time_ms,
        }
    }

    /// Paint the state's emoji on the anchor and advance the record.
    ///
    /// Reaction painting is best-effort: when the add fails, the previous
    /// reaction stays visible and the state still advances.
    pub(crate) async fn transition(&self, task: &mut InFlightTask, next: TaskState) {
        let emoji = emoji_for_state(next);
        match self
            .reactor
            .replace(&task.message_id, emoji, task.reaction.as_ref())
            .await
        {
            Ok(reaction) => task.reaction = Some(reaction),
            Err(error) => {
                tracing::warn!(
                    %error,
                    task_id = %task.id,
                    emoji,
                    "failed to paint status reaction"
                );
            }
        }
        task.state = next;
        task.updated_at_ms = now_ms();
    }

    /// Best-effort journal write for one task.
    pub(crate) async fn save(&self, task: &InFlightTask) {
        let task = task.clone();
        let task_id = task.id.clone();
        if let Err(error) = self.inflight.update(move |file| file.upsert_task(task)).await {
            tracing::warn!(%error, task_id = %task_id, "failed to journal task");
        }
    }

    /// Send a text message through the provider, then auto-finalize any
    /// waiting task anchored at `reply_to`.
    pub async fn send_text(
        &self,
        chat_id: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> crate::Result<SentMessage> {
        let mut message = OutboundMessage::new(chat_id, text);
        if let Some(reply_to) = reply_to {
            message = message.replying_to(reply_to);
        }
        let sent = self.provider.send_message(&message).await?;

        if let Some(anchor) = reply_to {
            self.finalize_waiting(anchor).await;
        }
        Ok(sent)
    }

    /// waiting → done when an outbound reply lands on the task's anchor.
    /// Best-effort; errors are swallowed.
    async fn finalize_waiting(&self, anchor: &str) {
        let waiting = self
            .inflight
            .snapshot()
            .find_by_message_id(anchor)
            .filter(|task| task.state == TaskState::Waiting && task.account_id == self.account_id)
            .cloned();
        let Some(mut task) = waiting else {
            return;
        };

        self.transition(&mut task, TaskState::Done).await;
        if let Err(error) = self
            .inflight
            .update(|file| {
                file.remove_task(&task.id);
            })
            .await
        {
            tracing::warn!(%error, task_id = %task.id, "failed to remove auto-finalized task");
        }
        tracing::info!(task_id = %task.id, anchor, "waiting task auto-finalized by outbound reply");
    }

    /// Queue an agent-initiated announcement for this chat. Delivery goes
    /// through `send_text`, so announce replies also feed auto-finalization.
    pub async fn announce(self: &Arc<Self>, chat_id: &str, item: AnnounceItem) -> bool {
        let key = format!("{PROVIDER_TAG}:{}:{chat_id}", self.account_id);
        let settings = AnnounceSettings::from(&self.announce_defaults);

        let coordinator = self.clone();
        let fallback_chat = chat_id.to_string();
        let send: SendFn = Arc::new(move |item: AnnounceItem| {
            let coordinator = coordinator.clone();
            let fallback_chat = fallback_chat.clone();
            async move {
                let target = item
                    .origin
                    .as_ref()
                    .map(|origin| origin.chat_id.clone())
                    .unwrap_or(fallback_chat);
                let reply_to = item
                    .origin
                    .as_ref()
                    .and_then(|origin| origin.reply_to_message_id.clone());
                coordinator
                    .send_text(&target, &item.prompt, reply_to.as_deref())
                    .await
                    .map(|_| ())
            }
            .boxed()
        });

        self.announces.enqueue(&key, item, settings, send).await
    }

    /// Tell the chat about a provider permission error, at most once per
    /// cooldown window per app.
    pub(crate) async fn notify_permission_error(&self, chat_id: &str, error: &GatewayError) {
        let GatewayError::PermissionDenied {
            code, grant_url, ..
        } = error
        else {
            return;
        };

        {
            let mut notices = self.permission_notices.lock().await;
            let now = now_ms();
            let key = self.account_id.clone();
            if let Some(last) = notices.get(&key)
                && now - last < PERMISSION_NOTICE_COOLDOWN_MS
            {
                return;
            }
            notices.insert(key, now);
        }

        let notice = match grant_url {
            Some(url) => format!(
                "机器人缺少所需权限（code {code}）。请管理员前往授权后重试：{url}"
            ),
            None => format!("机器人缺少所需权限（code {code}）。请管理员检查应用权限配置。"),
        };
        if let Err(error) = self.send_text(chat_id, &notice, None).await {
            tracing::warn!(%error, chat_id, "failed to send permission notice");
        }
    }
}
