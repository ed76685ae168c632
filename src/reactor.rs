//! Idempotent status-reaction replacement on provider messages.

use crate::error::Result;
use crate::inflight::Reaction;
use crate::provider::Provider;

use std::sync::Arc;

/// Replaces one status emoji with another on an anchor message.
#[derive(Clone)]
pub struct StatusReactor {
    provider: Arc<dyn Provider>,
}

impl StatusReactor {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }

    /// Add `next_emoji_type`, then best-effort remove the previous reaction.
    ///
    /// The provider may deduplicate reactions server-side and return the
    /// same reaction id for the same (message, emoji) pair; removing `prev`
    /// in that case would clear the status we just painted, so removal only
    /// happens when the ids differ.
    ///
    /// Add failures propagate (callers keep the previous reaction in place).
    /// Remove failures are logged and swallowed: at most one stale emoji
    /// lingers and the next transition overwrites it.
    pub async fn replace(
        &self,
        message_id: &str,
        next_emoji_type: &str,
        prev: Option<&Reaction>,
    ) -> Result<Reaction> {
        let reaction_id = self
            .provider
            .add_reaction(message_id, next_emoji_type)
            .await?;

        if let Some(prev) = prev
            && prev.reaction_id != reaction_id
            && let Err(error) = self
                .provider
                .remove_reaction(message_id, &prev.reaction_id)
                .await
        {
            tracing::warn!(
                %error,
                message_id,
                prev_emoji = %prev.emoji_type,
                "failed to remove previous status reaction"
            );
        }

        Ok(Reaction {
            emoji_type: next_emoji_type.to_string(),
            reaction_id,
        })
    }
}
