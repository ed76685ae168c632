//! Session transcript: role-tagged message types, the persistence sink, and
//! the tool-result guard that keeps strict providers happy.

pub mod guard;
pub mod session;
pub mod truncate;
pub mod types;

pub use guard::{BeforeWrite, ToolResultGuard};
pub use session::{JsonlSession, SessionSink};
pub use types::{ToolCall, ToolResultBlock, TranscriptMessage};
