//! Per-destination announce queues for agent-initiated follow-ups.
//!
//! Each key gets an independent queue with debounced draining, a capacity
//! cap with a configurable drop policy, staleness eviction, and retry-safe
//! delivery: a failed send keeps its item queued and re-arms the debounce
//! instead of hot-looping.

use crate::error::{GatewayError, Result};
use crate::now_ms;

use futures::future::BoxFuture;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// How queued items are delivered once the drain runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnounceMode {
    /// Deliver items one by one, preserving enqueue order.
    #[default]
    Followup,
    /// Coalesce everything pending into a single combined prompt.
    Collect,
}

/// What happens to items when a queue is at capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Drop the oldest item, remembering its summary line for an overflow
    /// notice.
    #[default]
    Summarize,
    /// Drop the oldest item, remembering its summary line.
    Oldest,
    /// Reject the incoming item instead.
    Newest,
}

/// Per-queue delivery settings, supplied on each enqueue.
#[derive(Debug, Clone, Copy)]
pub struct AnnounceSettings {
    pub mode: AnnounceMode,
    pub debounce_ms: u64,
    pub cap: usize,
    pub drop_policy: DropPolicy,
    /// Items older than this are evicted before delivery. 0 disables.
    pub max_age_ms: i64,
}

impl From<&crate::config::AnnounceConfig> for AnnounceSettings {
    fn from(config: &crate::config::AnnounceConfig) -> Self {
        Self {
            mode: config.mode,
            debounce_ms: config.debounce_ms,
            cap: config.cap.max(1),
            drop_policy: config.drop_policy,
            max_age_ms: config.max_age_ms,
        }
    }
}

/// Delivery context an announcement originated from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceOrigin {
    pub chat_id: String,
    /// Anchor to reply to, when the announcement closes out a waiting task.
    pub reply_to_message_id: Option<String>,
}

/// One queued announcement.
#[derive(Debug, Clone)]
pub struct AnnounceItem {
    pub announce_id: Option<String>,
    pub prompt: String,
    /// Short line used in overflow summaries instead of the full prompt.
    pub summary_line: Option<String>,
    pub enqueued_at_ms: i64,
    pub session_key: String,
    pub origin: Option<AnnounceOrigin>,
    pub origin_key: Option<String>,
    /// High-priority items bypass staleness eviction.
    pub high_priority: bool,
}

impl AnnounceItem {
    pub fn new(session_key: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            announce_id: None,
            prompt: prompt.into(),
            summary_line: None,
            enqueued_at_ms: now_ms(),
            session_key: session_key.into(),
            origin: None,
            origin_key: None,
            high_priority: false,
        }
    }

    fn summary(&self) -> String {
        if let Some(line) = &self.summary_line {
            return line.clone();
        }
        let mut line: String = self.prompt.chars().take(80).collect();
        if self.prompt.chars().count() > 80 {
            line.push('…');
        }
        line
    }
}

/// Async delivery callback. Failures keep the item queued.
pub type SendFn = Arc<dyn Fn(AnnounceItem) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct QueueState {
    items: VecDeque<AnnounceItem>,
    draining: bool,
    last_enqueued_at_ms: i64,
    settings: AnnounceSettings,
    send: SendFn,
    dropped_count: usize,
    summary_lines: Vec<String>,
    /// Latched when a collect batch mixed origins; from then on this queue
    /// delivers one-by-one.
    force_individual_collect: bool,
    /// Most recent enqueued item, used to derive summary-only sends.
    template: AnnounceItem,
}

/// What one drain iteration decided to do, computed under the map lock and
/// executed outside it.
enum DrainAction {
    /// Send the front item unchanged; shift it on success.
    SendOne(AnnounceItem, SendFn),
    /// Send a combined collect prompt; clear items and summary on success.
    SendCollect(AnnounceItem, SendFn),
    /// Send an overflow summary; clear summary state on success.
    SendSummary(AnnounceItem, SendFn),
    Finished,
}

/// The process-wide announce queue map. Owned by the coordinator; tests
/// construct fresh instances.
#[derive(Clone, Default)]
pub struct AnnounceQueues {
    inner: Arc<Mutex<HashMap<String, QueueState>>>,
}

impl AnnounceQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an announcement. Returns false when the queue is full and the
    /// drop policy rejects new items.
    pub async fn enqueue(
        &self,
        key: &str,
        mut item: AnnounceItem,
        settings: AnnounceSettings,
        send: SendFn,
    ) -> bool {
        if item.origin_key.is_none() {
            item.origin_key = item.origin.as_ref().map(|origin| origin.chat_id.clone());
        }

        let mut queues = self.inner.lock().await;
        let queue = queues
            .entry(key.to_string())
            .or_insert_with(|| QueueState {
                items: VecDeque::new(),
                draining: false,
                last_enqueued_at_ms: 0,
                settings,
                send: send.clone(),
                dropped_count: 0,
                summary_lines: Vec::new(),
                force_individual_collect: false,
                template: item.clone(),
            });

        // Settings and the send callback are mutable per enqueue.
        queue.settings = settings;
        queue.send = send;

        if queue.items.len() >= settings.cap.max(1) {
            match settings.drop_policy {
                DropPolicy::Newest => {
                    tracing::warn!(key, "announce queue full, rejecting new item");
                    return false;
                }
                DropPolicy::Oldest | DropPolicy::Summarize => {
                    if let Some(front) = queue.items.pop_front() {
                        queue.summary_lines.push(front.summary());
                        queue.dropped_count += 1;
                        tracing::warn!(key, dropped = queue.dropped_count, "announce queue full, dropped oldest");
                    }
                }
            }
        }

        queue.template = item.clone();
        queue.items.push_back(item);
        queue.last_enqueued_at_ms = now_ms();

        if !queue.draining {
            queue.draining = true;
            let queues = self.clone();
            let key = key.to_string();
            tokio::spawn(async move { queues.drain(key).await });
        }
        true
    }

    /// Drain loop for one key. At most one runs per key at a time.
    fn drain(&self, key: String) -> BoxFuture<'_, ()> {
        Box::pin(async move {
        loop {
            // Debounce: wait until the queue has been quiet long enough.
            loop {
                let wait_ms = {
                    let queues = self.inner.lock().await;
                    let Some(queue) = queues.get(&key) else {
                        return;
                    };
                    let elapsed = now_ms() - queue.last_enqueued_at_ms;
                    let debounce = queue.settings.debounce_ms as i64;
                    if elapsed >= debounce {
                        break;
                    }
                    (debounce - elapsed).max(1) as u64
                };
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            }

            let action = {
                let mut queues = self.inner.lock().await;
                let Some(queue) = queues.get_mut(&key) else {
                    return;
                };
                evict_stale(&key, queue);
                next_action(queue)
            };

            let (sent_kind, item, send) = match action {
                DrainAction::Finished => {
                    let mut queues = self.inner.lock().await;
                    queues.remove(&key);
                    return;
                }
                DrainAction::SendOne(item, send) => (SentKind::One, item, send),
                DrainAction::SendCollect(item, send) => (SentKind::Collect, item, send),
                DrainAction::SendSummary(item, send) => (SentKind::Summary, item, send),
            };

            match send(item).await {
                Ok(()) => {
                    let mut queues = self.inner.lock().await;
                    let Some(queue) = queues.get_mut(&key) else {
                        return;
                    };
                    match sent_kind {
                        SentKind::One => {
                            queue.items.pop_front();
                        }
                        SentKind::Collect => {
                            queue.items.clear();
                            queue.summary_lines.clear();
                            queue.dropped_count = 0;
                        }
                        SentKind::Summary => {
                            queue.summary_lines.clear();
                            queue.dropped_count = 0;
                        }
                    }
                }
                Err(error) => {
                    // Keep the item; re-arm the debounce and hand off to a
                    // fresh drain so retries are paced, not hot-looped.
                    let mut queues = self.inner.lock().await;
                    let Some(queue) = queues.get_mut(&key) else {
                        return;
                    };
                    tracing::warn!(%error, key = %key, pending = queue.items.len(), "announce send failed, will retry");
                    queue.last_enqueued_at_ms = now_ms();
                    queue.draining = false;
                    let remaining = !queue.items.is_empty() || queue.dropped_count > 0;
                    if remaining {
                        queue.draining = true;
                        let queues_handle = self.clone();
                        let key = key.clone();
                        tokio::spawn(async move { queues_handle.drain(key).await });
                    } else {
                        queues.remove(&key);
                    }
                    return;
                }
            }
        }
        })
    }

    /// Keys with live queue state. Mostly useful in tests and status output.
    pub async fn active_keys(&self) -> Vec<String> {
        self.inner.lock().await.keys().cloned().collect()
    }

    /// Drop all queue state. Test isolation only.
    pub async fn reset_for_tests(&self) {
        self.inner.lock().await.clear();
    }
}

enum SentKind {
    One,
    Collect,
    Summary,
}

/// Evict items that went stale while queued. High-priority items are exempt.
fn evict_stale(key: &str, queue: &mut QueueState) {
    let max_age = queue.settings.max_age_ms;
    if max_age <= 0 {
        return;
    }
    let now = now_ms();
    queue.items.retain(|item| {
        let age = now - item.enqueued_at_ms;
        if item.high_priority || age <= max_age {
            return true;
        }
        tracing::info!(
            metric = "stale_message_dropped",
            key,
            age_ms = age,
            announce_id = item.announce_id.as_deref().unwrap_or(""),
            "dropping stale announce item"
        );
        false
    });
}

/// Decide what this drain iteration sends. Runs under the map lock.
fn next_action(queue: &mut QueueState) -> DrainAction {
    if queue.items.is_empty() && queue.dropped_count == 0 {
        return DrainAction::Finished;
    }

    if queue.items.is_empty() {
        // Only overflow state left: deliver the summary on its own.
        let mut item = queue.template.clone();
        item.prompt = overflow_prompt(&queue.summary_lines, queue.dropped_count);
        return DrainAction::SendSummary(item, queue.send.clone());
    }

    match queue.settings.mode {
        AnnounceMode::Collect => {
            let distinct_origins: std::collections::HashSet<&str> = queue
                .items
                .iter()
                .filter_map(|item| item.origin_key.as_deref())
                .collect();
            if distinct_origins.len() > 1 {
                queue.force_individual_collect = true;
            }
            if queue.force_individual_collect {
                let front = queue.items.front().expect("items checked non-empty");
                return DrainAction::SendOne(front.clone(), queue.send.clone());
            }

            let prompt =
                collect_prompt(&queue.items, &queue.summary_lines, queue.dropped_count);
            let mut item = queue
                .items
                .back()
                .expect("items checked non-empty")
                .clone();
            item.prompt = prompt;
            DrainAction::SendCollect(item, queue.send.clone())
        }
        AnnounceMode::Followup => {
            if !queue.summary_lines.is_empty() || queue.dropped_count > 0 {
                let mut item = queue.items.front().expect("items checked non-empty").clone();
                item.prompt = overflow_prompt(&queue.summary_lines, queue.dropped_count);
                return DrainAction::SendSummary(item, queue.send.clone());
            }
            let front = queue.items.front().expect("items checked non-empty");
            DrainAction::SendOne(front.clone(), queue.send.clone())
        }
    }
}

/// Combined prompt for collect mode.
fn collect_prompt(
    items: &VecDeque<AnnounceItem>,
    summary_lines: &[String],
    dropped_count: usize,
) -> String {
    let mut prompt = String::from("[Queued announce messages while agent was busy]\n");
    for (index, item) in items.iter().enumerate() {
        prompt.push_str("---\n");
        prompt.push_str(&format!("Queued #{}\n{}\n", index + 1, item.prompt));
    }
    if dropped_count > 0 {
        prompt.push_str("---\n");
        prompt.push_str(&overflow_prompt(summary_lines, dropped_count));
    }
    prompt
}

/// Overflow notice built from the dropped items' summary lines.
fn overflow_prompt(summary_lines: &[String], dropped_count: usize) -> String {
    let mut prompt = format!(
        "[Queue overflow]\n{dropped_count} queued announcement(s) were dropped while the queue was full:\n"
    );
    for line in summary_lines {
        prompt.push_str(&format!("- {line}\n"));
    }
    prompt
}

/// Convenience error constructor for send callbacks.
pub fn send_error(message: impl Into<String>) -> GatewayError {
    GatewayError::AnnounceSend(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt as _;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings() -> AnnounceSettings {
        AnnounceSettings {
            mode: AnnounceMode::Followup,
            debounce_ms: 0,
            cap: 20,
            drop_policy: DropPolicy::Summarize,
            max_age_ms: 600_000,
        }
    }

    /// Send callback that records prompts, optionally failing the first
    /// `fail_first` attempts.
    fn recording_send(fail_first: usize) -> (SendFn, Arc<Mutex<Vec<String>>>) {
        let sent: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let attempts = Arc::new(AtomicUsize::new(0));
        let sent_handle = sent.clone();
        let send: SendFn = Arc::new(move |item: AnnounceItem| {
            let sent = sent_handle.clone();
            let attempts = attempts.clone();
            async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                if attempt < fail_first {
                    return Err(send_error("gateway timeout after 60000ms"));
                }
                sent.lock().await.push(item.prompt);
                Ok(())
            }
            .boxed()
        });
        (send, sent)
    }

    /// Poll until `condition` holds or the timeout expires.
    async fn wait_for<F>(condition: F)
    where
        F: Fn() -> BoxFuture<'static, bool>,
    {
        for _ in 0..200 {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met within timeout");
    }

    #[tokio::test]
    async fn followup_delivers_in_order() {
        let queues = AnnounceQueues::new();
        let (send, sent) = recording_send(0);

        for index in 0..3 {
            queues
                .enqueue(
                    "feishu:oc_1",
                    AnnounceItem::new("session", format!("item {index}")),
                    settings(),
                    send.clone(),
                )
                .await;
        }

        let sent_handle = sent.clone();
        wait_for(move || {
            let sent = sent_handle.clone();
            async move { sent.lock().await.len() == 3 }.boxed()
        })
        .await;

        assert_eq!(
            *sent.lock().await,
            vec!["item 0", "item 1", "item 2"],
            "followup mode preserves enqueue order"
        );
        assert!(queues.active_keys().await.is_empty(), "queue state deleted");
    }

    #[tokio::test]
    async fn failed_send_is_retried_with_same_prompt() {
        let queues = AnnounceQueues::new();
        let (send, sent) = recording_send(1);

        queues
            .enqueue(
                "feishu:oc_1",
                AnnounceItem::new("session", "deploy finished"),
                settings(),
                send,
            )
            .await;

        let sent_handle = sent.clone();
        wait_for(move || {
            let sent = sent_handle.clone();
            async move { !sent.lock().await.is_empty() }.boxed()
        })
        .await;

        assert_eq!(*sent.lock().await, vec!["deploy finished"]);
    }

    #[tokio::test]
    async fn collect_mode_combines_items() {
        let queues = AnnounceQueues::new();
        let (send, sent) = recording_send(0);
        let collect = AnnounceSettings {
            mode: AnnounceMode::Collect,
            ..settings()
        };

        queues
            .enqueue(
                "feishu:oc_1",
                AnnounceItem::new("session", "queued item one"),
                collect,
                send.clone(),
            )
            .await;
        queues
            .enqueue(
                "feishu:oc_1",
                AnnounceItem::new("session", "queued item two"),
                collect,
                send,
            )
            .await;

        let sent_handle = sent.clone();
        wait_for(move || {
            let sent = sent_handle.clone();
            async move { !sent.lock().await.is_empty() }.boxed()
        })
        .await;

        let prompts = sent.lock().await;
        assert_eq!(prompts.len(), 1, "collect coalesces into one send");
        let prompt = &prompts[0];
        assert!(prompt.contains("Queued #1"));
        assert!(prompt.contains("queued item one"));
        assert!(prompt.contains("Queued #2"));
        assert!(prompt.contains("queued item two"));
    }

    #[tokio::test]
    async fn collect_with_mixed_origins_falls_back_to_individual() {
        let queues = AnnounceQueues::new();
        let (send, sent) = recording_send(0);
        let collect = AnnounceSettings {
            mode: AnnounceMode::Collect,
            ..settings()
        };

        for (chat, prompt) in [("oc_a", "for a"), ("oc_b", "for b")] {
            let mut item = AnnounceItem::new("session", prompt);
            item.origin = Some(AnnounceOrigin {
                chat_id: chat.to_string(),
                reply_to_message_id: None,
            });
            queues.enqueue("key", item, collect, send.clone()).await;
        }

        let sent_handle = sent.clone();
        wait_for(move || {
            let sent = sent_handle.clone();
            async move { sent.lock().await.len() == 2 }.boxed()
        })
        .await;

        assert_eq!(*sent.lock().await, vec!["for a", "for b"]);
    }

    #[tokio::test]
    async fn stale_items_are_dropped_without_send() {
        let queues = AnnounceQueues::new();
        let (send, sent) = recording_send(0);
        let short_age = AnnounceSettings {
            max_age_ms: 10,
            ..settings()
        };

        let mut item = AnnounceItem::new("session", "too old");
        item.enqueued_at_ms = now_ms() - 60_000;
        queues.enqueue("key", item, short_age, send).await;

        let queues_handle = queues.clone();
        wait_for(move || {
            let queues = queues_handle.clone();
            async move { queues.active_keys().await.is_empty() }.boxed()
        })
        .await;

        assert!(sent.lock().await.is_empty(), "stale item never reaches send");
    }

    #[tokio::test]
    async fn stale_high_priority_item_is_still_sent() {
        let queues = AnnounceQueues::new();
        let (send, sent) = recording_send(0);
        let short_age = AnnounceSettings {
            max_age_ms: 10,
            ..settings()
        };

        let mut item = AnnounceItem::new("session", "urgent");
        item.enqueued_at_ms = now_ms() - 60_000;
        item.high_priority = true;
        queues.enqueue("key", item, short_age, send).await;

        let sent_handle = sent.clone();
        wait_for(move || {
            let sent = sent_handle.clone();
            async move { !sent.lock().await.is_empty() }.boxed()
        })
        .await;

        assert_eq!(*sent.lock().await, vec!["urgent"], "exactly one send");
    }

    #[tokio::test]
    async fn newest_policy_rejects_when_full() {
        let queues = AnnounceQueues::new();
        // Never-completing send keeps the first item occupying the queue.
        let send: SendFn = Arc::new(|_| futures::future::pending().boxed());
        let tight = AnnounceSettings {
            cap: 1,
            drop_policy: DropPolicy::Newest,
            debounce_ms: 60_000,
            ..settings()
        };

        assert!(
            queues
                .enqueue("key", AnnounceItem::new("s", "first"), tight, send.clone())
                .await
        );
        assert!(
            !queues
                .enqueue("key", AnnounceItem::new("s", "second"), tight, send)
                .await,
            "newest policy rejects the incoming item"
        );
    }

    #[tokio::test]
    async fn summarize_policy_sends_overflow_notice_first() {
        let queues = AnnounceQueues::new();
        let (send, sent) = recording_send(0);
        let tight = AnnounceSettings {
            cap: 1,
            debounce_ms: 30,
            ..settings()
        };

        queues
            .enqueue("key", AnnounceItem::new("s", "first task done"), tight, send.clone())
            .await;
        queues
            .enqueue("key", AnnounceItem::new("s", "second task done"), tight, send)
            .await;

        let sent_handle = sent.clone();
        wait_for(move || {
            let sent = sent_handle.clone();
            async move { sent.lock().await.len() == 2 }.boxed()
        })
        .await;

        let prompts = sent.lock().await;
        assert!(prompts[0].starts_with("[Queue overflow]"));
        assert!(
            prompts[0].contains("first task done"),
            "dropped item's summary line appears in the notice"
        );
        assert_eq!(prompts[1], "second task done");
    }
}
