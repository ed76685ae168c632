//! Tool-result guard: pairs every assistant tool call with a persisted tool
//! result, caps oversized results, and annotates recoverable errors.
//!
//! Installed as a decorator around a `SessionSink` at construction time;
//! the wrapped sink is used through the same interface.

use crate::error::Result;
use crate::transcript::session::SessionSink;
use crate::transcript::truncate::cap_text_blocks;
use crate::transcript::types::{ToolResultBlock, TranscriptMessage};

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;

/// Marker prefix for annotated recoverable tool errors.
pub const RECOVERABLE_MARKER: &str = "[RECOVERABLE_TOOL_ERROR]";

/// Placeholder text for synthesized tool results.
const SYNTHETIC_RESULT_TEXT: &str =
    "No result was recorded for this tool call before the session moved on. \
     Treat the call as interrupted and re-run it if the result is still needed.";

/// Decision returned by the before-write hook.
pub enum BeforeWrite {
    Keep,
    /// Drop the entry without persisting.
    Skip,
    Replace(TranscriptMessage),
}

type ResultTransform = Box<dyn Fn(TranscriptMessage) -> TranscriptMessage + Send + Sync>;
type BeforeWriteHook = Box<dyn Fn(&TranscriptMessage) -> BeforeWrite + Send + Sync>;

/// Guarded transcript sink.
pub struct ToolResultGuard {
    inner: Arc<dyn SessionSink>,
    /// Assistant tool calls awaiting a result, in call order: `(id, name)`.
    pending: Mutex<Vec<(String, String)>>,
    hard_max_tool_result_chars: usize,
    transform: Option<ResultTransform>,
    before_write: Option<BeforeWriteHook>,
}

impl ToolResultGuard {
    pub fn new(inner: Arc<dyn SessionSink>, hard_max_tool_result_chars: usize) -> Self {
        Self {
            inner,
            pending: Mutex::new(Vec::new()),
            hard_max_tool_result_chars,
            transform: None,
            before_write: None,
        }
    }

    /// Install a transform applied to every tool result before persisting.
    pub fn with_transform(
        mut self,
        transform: impl Fn(TranscriptMessage) -> TranscriptMessage + Send + Sync + 'static,
    ) -> Self {
        self.transform = Some(Box::new(transform));
        self
    }

    /// Install a hook consulted right before a tool result is written.
    pub fn with_before_write(
        mut self,
        hook: impl Fn(&TranscriptMessage) -> BeforeWrite + Send + Sync + 'static,
    ) -> Self {
        self.before_write = Some(Box::new(hook));
        self
    }

    /// Ids of tool calls still awaiting a result.
    pub async fn pending_ids(&self) -> Vec<String> {
        self.pending
            .lock()
            .await
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Persist a synthetic placeholder result for every pending tool call,
    /// so strict providers see each assistant call paired. Called before
    /// any non-tool-result entry is persisted, and explicitly on shutdown.
    pub async fn flush_pending_tool_results(&self) -> Result<()> {
        let drained: Vec<(String, String)> = {
            let mut pending = self.pending.lock().await;
            pending.drain(..).collect()
        };

        for (tool_call_id, tool_name) in drained {
            tracing::warn!(
                tool_call_id = %tool_call_id,
                tool_name = %tool_name,
                "synthesizing missing tool result"
            );
            self.inner
                .append(TranscriptMessage::ToolResult {
                    tool_call_id,
                    is_error: true,
                    is_synthetic: true,
                    content: vec![ToolResultBlock::text(SYNTHETIC_RESULT_TEXT)],
                })
                .await?;
        }
        Ok(())
    }

    async fn append_assistant(
        &self,
        text: Option<String>,
        tool_calls: Vec<crate::transcript::types::ToolCall>,
    ) -> Result<()> {
        // Sanitize: tool calls whose arguments are not a JSON object are
        // malformed and dropped.
        let sane_calls: Vec<_> = tool_calls
            .into_iter()
            .filter(|call| {
                let ok = call.arguments.is_object();
                if !ok {
                    tracing::warn!(
                        tool_call_id = %call.id,
                        tool_name = %call.name,
                        "dropping tool call with malformed arguments"
                    );
                }
                ok
            })
            .collect();

        if sane_calls.is_empty() && text.as_deref().is_none_or(|t| t.trim().is_empty()) {
            // Sanitization left nothing worth persisting.
            self.flush_pending_tool_results().await?;
            return Ok(());
        }

        // Pair any dangling calls before a new assistant turn lands.
        self.flush_pending_tool_results().await?;

        {
            let mut pending = self.pending.lock().await;
            for call in &sane_calls {
                pending.push((call.id.clone(), call.name.clone()));
            }
        }

        self.inner
            .append(TranscriptMessage::Assistant {
                text,
                tool_calls: sane_calls,
            })
            .await
    }

    async fn append_tool_result(&self, mut message: TranscriptMessage) -> Result<()> {
        let tool_name = {
            let TranscriptMessage::ToolResult { tool_call_id, .. } = &message else {
                unreachable!("caller matched the role");
            };
            let mut pending = self.pending.lock().await;
            match pending.iter().position(|(id, _)| id == tool_call_id) {
                Some(index) => Some(pending.remove(index).1),
                None => None,
            }
        };

        if let TranscriptMessage::ToolResult { content, .. } = &mut message {
            let mut texts: Vec<String> = content
                .iter()
                .map(|block| block.as_text().to_string())
                .collect();
            if cap_text_blocks(&mut texts, self.hard_max_tool_result_chars) {
                *content = texts.into_iter().map(ToolResultBlock::text).collect();
            }
        }

        if let Some(transform) = &self.transform {
            message = transform(message);
        }

        message = annotate_recoverable(message, tool_name.as_deref());

        if let Some(hook) = &self.before_write {
            match hook(&message) {
                BeforeWrite::Keep => {}
                BeforeWrite::Skip => return Ok(()),
                BeforeWrite::Replace(replacement) => message = replacement,
            }
        }

        self.inner.append(message).await
    }
}

#[async_trait]
impl SessionSink for ToolResultGuard {
    async fn append(&self, message: TranscriptMessage) -> Result<()> {
        match message {
            TranscriptMessage::Assistant { text, tool_calls } => {
                self.append_assistant(text, tool_calls).await
            }
            result @ TranscriptMessage::ToolResult { .. } => {
                self.append_tool_result(result).await
            }
            other => {
                self.flush_pending_tool_results().await?;
                self.inner.append(other).await
            }
        }
    }

    fn session_file(&self) -> Option<PathBuf> {
        self.inner.session_file()
    }
}

/// Structured payload appended to recoverable edit failures.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecoverablePayload<'a> {
    kind: &'a str,
    path: &'a str,
    suggested_recovery: Vec<&'a str>,
}

fn edit_not_found_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"Could not find the exact text in (\S+)").expect("pattern is valid")
    })
}

/// Annotate recoverable `edit` failures with a structured recovery block.
///
/// Fires only for non-synthetic error results that are not already
/// annotated. Other failure shapes pass through untouched.
fn annotate_recoverable(
    message: TranscriptMessage,
    tool_name: Option<&str>,
) -> TranscriptMessage {
    let TranscriptMessage::ToolResult {
        tool_call_id,
        is_error,
        is_synthetic,
        mut content,
    } = message
    else {
        unreachable!("guard only annotates tool results");
    };

    let text = content
        .iter()
        .map(ToolResultBlock::as_text)
        .collect::<Vec<_>>()
        .join("");

    let annotate = is_error
        && !is_synthetic
        && tool_name == Some("edit")
        && !text.contains(RECOVERABLE_MARKER);

    if annotate
        && let Some(captures) = edit_not_found_pattern().captures(&text)
    {
        let path = captures[1].trim_end_matches(['.', '…', ',']);
        let payload = RecoverablePayload {
            kind: "EDIT_EXACT_MATCH_NOT_FOUND",
            path,
            suggested_recovery: vec![
                "Re-read the file to see its current contents",
                "Retry the edit with an exact snippet copied from the latest read",
                "Use a shorter search string that is still unique in the file",
            ],
        };
        let block = format!(
            "\n\n{RECOVERABLE_MARKER} {}",
            serde_json::to_string(&payload).unwrap_or_default()
        );
        content.push(ToolResultBlock::text(block));
    }

    TranscriptMessage::ToolResult {
        tool_call_id,
        is_error,
        is_synthetic,
        content,
    }
}
