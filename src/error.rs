//! Gateway error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors surfaced by the gateway core.
///
/// Best-effort paths (reactions, dedup persistence, cleanup) log and swallow
/// these; the critical inbound path propagates them to the outer handler,
/// which logs and returns without re-throwing to the event source.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Provider API call failed (non-zero code or transport error).
    #[error("provider api error: {0}")]
    Provider(String),

    /// Provider rejected the call for a missing app permission.
    ///
    /// Feishu reports these with code 99991672 and embeds a grant URL in the
    /// error message so the operator can approve the scope.
    #[error("provider permission denied (code {code}): {message}")]
    PermissionDenied {
        code: i64,
        message: String,
        grant_url: Option<String>,
    },

    /// Agent dispatch failed before reaching idle.
    #[error("agent dispatch error: {0}")]
    Dispatch(String),

    /// Announce delivery failed; the item stays queued for retry.
    #[error("announce send error: {0}")]
    AnnounceSend(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GatewayError {
    /// True when the error is the provider permission-denied variant.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }
}
