use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// One entry of the conversation history shared with the content engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Read-only view of the ordered text/image message log.
pub trait ConversationLog: Send + Sync {
    fn messages(&self) -> Vec<ChatMessage>;
}

/// In-memory conversation log. The downstream executor appends to it; the
/// ingestion core only reads.
#[derive(Default)]
pub struct InMemoryConversationLog {
    entries: Mutex<Vec<ChatMessage>>,
}

impl InMemoryConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: ChatMessage) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(message);
        }
    }
}

impl ConversationLog for InMemoryConversationLog {
    fn messages(&self) -> Vec<ChatMessage> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

/// Downstream dispatch seam. Generated prompts and selected viewer comments
/// both leave the core through here; delivery failures belong to the
/// implementor and are only logged by callers.
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// Forward a generated prompt (continuation, new topic, sleep message).
    async fn dispatch_prompt(&self, messages: Vec<ChatMessage>) -> anyhow::Result<()>;

    /// Forward a selected viewer comment as user input.
    async fn dispatch_comment(&self, text: &str) -> anyhow::Result<()>;
}

/// Busy signal published by the downstream processing pipeline. The ingestion
/// core reads `is_busy` only; the pipeline owns the writes.
#[derive(Default)]
pub struct PipelineGauge {
    processing_active: AtomicBool,
    queue_depth: AtomicUsize,
}

impl PipelineGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.processing_active.load(Ordering::Acquire) || self.queue_depth.load(Ordering::Acquire) > 0
    }

    pub fn set_processing(&self, active: bool) {
        self.processing_active.store(active, Ordering::Release);
    }

    pub fn enqueue(&self) {
        self.queue_depth.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dequeue(&self) {
        let previous = self.queue_depth.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            // Underflow means a dequeue without a matching enqueue; clamp back.
            self.queue_depth.store(0, Ordering::Release);
        }
    }
}
