//! Gateway configuration, loaded once at startup from a TOML file.

use crate::announce::{AnnounceMode, DropPolicy};
use crate::error::Result;

use anyhow::Context as _;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Top-level configuration. Every section has serde defaults so a minimal
/// config only needs the Feishu credentials.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    /// Webhook bind address.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub feishu: FeishuConfig,
    #[serde(default)]
    pub agent: AgentRuntimeConfig,
    #[serde(default)]
    pub stale_drop: StaleDropConfig,
    #[serde(default)]
    pub announce: AnnounceConfig,
    #[serde(default)]
    pub transcript: TranscriptConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

/// Feishu app credentials and endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct FeishuConfig {
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_secret: String,
    #[serde(default = "default_feishu_base_url")]
    pub base_url: String,
    /// The bot's own open_id, used to detect and strip self-mentions.
    #[serde(default)]
    pub bot_open_id: Option<String>,
    /// Account tag used in state file names. Defaults to the app id.
    #[serde(default)]
    pub account_id: Option<String>,
}

impl Default for FeishuConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            app_secret: String::new(),
            base_url: default_feishu_base_url(),
            bot_open_id: None,
            account_id: None,
        }
    }
}

impl FeishuConfig {
    pub fn account_id(&self) -> &str {
        self.account_id.as_deref().unwrap_or(&self.app_id)
    }
}

fn default_feishu_base_url() -> String {
    "https://open.feishu.cn".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:9898".to_string()
}

/// Where agent jobs are dispatched to.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AgentRuntimeConfig {
    /// HTTP endpoint of the agent runtime.
    #[serde(default)]
    pub endpoint: String,
}

/// Inbound stale/out-of-order drop behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct StaleDropConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Send a user-visible notice when dropping a stale message.
    #[serde(default = "default_true")]
    pub reply: bool,
    /// Tolerance on provider create_time before a message counts as stale.
    #[serde(default = "default_skew_window_ms")]
    pub skew_window_ms: i64,
    /// Size of the persisted recent-message-id ring per chat.
    #[serde(default = "default_recent_ids_limit")]
    pub recent_ids_limit: usize,
}

impl Default for StaleDropConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reply: true,
            skew_window_ms: default_skew_window_ms(),
            recent_ids_limit: default_recent_ids_limit(),
        }
    }
}

fn default_skew_window_ms() -> i64 {
    5_000
}

fn default_recent_ids_limit() -> usize {
    250
}

/// Defaults for announce queues. Individual enqueues may override these.
#[derive(Debug, Clone, Deserialize)]
pub struct AnnounceConfig {
    #[serde(default)]
    pub mode: AnnounceMode,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_announce_cap")]
    pub cap: usize,
    #[serde(default)]
    pub drop_policy: DropPolicy,
    /// Items older than this are evicted before delivery. 0 disables.
    #[serde(default = "default_announce_max_age_ms")]
    pub max_age_ms: i64,
}

impl Default for AnnounceConfig {
    fn default() -> Self {
        Self {
            mode: AnnounceMode::default(),
            debounce_ms: default_debounce_ms(),
            cap: default_announce_cap(),
            drop_policy: DropPolicy::default(),
            max_age_ms: default_announce_max_age_ms(),
        }
    }
}

fn default_debounce_ms() -> u64 {
    1_000
}

fn default_announce_cap() -> usize {
    20
}

fn default_announce_max_age_ms() -> i64 {
    10 * 60 * 1000
}

/// Transcript persistence limits.
#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptConfig {
    /// Hard cap across all text blocks of one persisted tool result.
    #[serde(default = "default_hard_max_tool_result_chars")]
    pub hard_max_tool_result_chars: usize,
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            hard_max_tool_result_chars: default_hard_max_tool_result_chars(),
        }
    }
}

fn default_hard_max_tool_result_chars() -> usize {
    50_000
}

/// Admission policy: which chats and senders may engage the agent.
///
/// Empty allowlists admit everyone; `require_mention` additionally gates
/// group messages on an explicit bot @-mention.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub group_allowlist: Vec<String>,
    /// Per-group sender allowlists, keyed by chat id.
    #[serde(default)]
    pub group_sender_allowlist: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub dm_allowlist: Vec<String>,
    #[serde(default = "default_true")]
    pub require_mention: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            group_allowlist: Vec::new(),
            group_sender_allowlist: HashMap::new(),
            dm_allowlist: Vec::new(),
            require_mention: true,
        }
    }
}

/// Per-chat context history retained for gated-out group traffic.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_limit")]
    pub per_chat_limit: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            per_chat_limit: default_history_limit(),
        }
    }
}

fn default_history_limit() -> usize {
    50
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config: {}", path.display()))?;
        Ok(config)
    }

    /// Resolve the state directory, defaulting to `./state` next to the binary.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("state"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = toml::from_str(
            r#"
            [feishu]
            app_id = "cli_x"
            app_secret = "secret"
            "#,
        )
        .expect("minimal config should parse");

        assert!(config.stale_drop.enabled);
        assert!(config.stale_drop.reply);
        assert_eq!(config.stale_drop.skew_window_ms, 5_000);
        assert_eq!(config.stale_drop.recent_ids_limit, 250);
        assert_eq!(config.announce.debounce_ms, 1_000);
        assert_eq!(config.announce.cap, 20);
        assert_eq!(config.announce.max_age_ms, 600_000);
        assert_eq!(config.transcript.hard_max_tool_result_chars, 50_000);
        assert!(config.policy.require_mention);
        assert_eq!(config.feishu.account_id(), "cli_x");
    }

    #[test]
    fn overrides_are_honored() {
        let config: Config = toml::from_str(
            r#"
            [stale_drop]
            enabled = false
            skew_window_ms = 100

            [announce]
            mode = "collect"
            drop_policy = "newest"
            cap = 3
            "#,
        )
        .expect("config should parse");

        assert!(!config.stale_drop.enabled);
        assert_eq!(config.stale_drop.skew_window_ms, 100);
        assert_eq!(config.announce.mode, AnnounceMode::Collect);
        assert_eq!(config.announce.drop_policy, DropPolicy::Newest);
        assert_eq!(config.announce.cap, 3);
    }
}
