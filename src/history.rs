//! Bounded per-chat context history.
//!
//! Group messages that are gated out by policy (no mention, sender not
//! allowlisted) are still recorded here, so that when the bot is later
//! mentioned it has recent conversational context to hand the agent.

use std::collections::{HashMap, VecDeque};

/// One recorded chat line.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub sender_label: String,
    pub text: String,
    pub at_ms: i64,
}

/// Per-chat bounded rings of recent messages.
#[derive(Debug)]
pub struct ChatHistoryBuffer {
    chats: HashMap<String, VecDeque<HistoryEntry>>,
    limit: usize,
}

impl ChatHistoryBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            chats: HashMap::new(),
            limit: limit.max(1),
        }
    }

    pub fn record(&mut self, chat_id: &str, entry: HistoryEntry) {
        let ring = self.chats.entry(chat_id.to_string()).or_default();
        ring.push_back(entry);
        while ring.len() > self.limit {
            ring.pop_front();
        }
    }

    /// Render recent context for envelope injection, oldest first.
    /// Returns `None` when the chat has no recorded history.
    pub fn render(&self, chat_id: &str, max_entries: usize) -> Option<String> {
        let ring = self.chats.get(chat_id)?;
        if ring.is_empty() {
            return None;
        }
        let lines: Vec<String> = ring
            .iter()
            .rev()
            .take(max_entries)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .map(|entry| format!("{}: {}", entry.sender_label, entry.text))
            .collect();
        Some(lines.join("\n"))
    }

    pub fn clear(&mut self, chat_id: &str) {
        self.chats.remove(chat_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(sender: &str, text: &str) -> HistoryEntry {
        HistoryEntry {
            sender_label: sender.to_string(),
            text: text.to_string(),
            at_ms: 0,
        }
    }

    #[test]
    fn ring_is_bounded() {
        let mut buffer = ChatHistoryBuffer::new(2);
        buffer.record("oc_1", entry("alice", "one"));
        buffer.record("oc_1", entry("bob", "two"));
        buffer.record("oc_1", entry("carol", "three"));

        let rendered = buffer.render("oc_1", 10).expect("history exists");
        assert_eq!(rendered, "bob: two\ncarol: three");
    }

    #[test]
    fn render_caps_entries_and_keeps_order() {
        let mut buffer = ChatHistoryBuffer::new(10);
        for index in 0..5 {
            buffer.record("oc_1", entry("u", &format!("m{index}")));
        }
        let rendered = buffer.render("oc_1", 2).expect("history exists");
        assert_eq!(rendered, "u: m3\nu: m4");
    }

    #[test]
    fn unknown_chat_renders_none() {
        let buffer = ChatHistoryBuffer::new(10);
        assert!(buffer.render("oc_none", 5).is_none());
    }
}
