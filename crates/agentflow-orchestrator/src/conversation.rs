//! Conversation history for support workflows

use agentflow_core::Message;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Append-only message log shared across support runs
///
/// Cloning shares the log. Entries are only ever appended, except for an
/// explicit [`reset`](Self::reset).
#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    messages: Arc<RwLock<Vec<Message>>>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn append(&self, message: Message) {
        debug!("Conversation {}: {}", message.role, message.id);
        self.messages.write().await.push(message);
    }

    /// Copy of every message, oldest first
    pub async fn snapshot(&self) -> Vec<Message> {
        self.messages.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }

    pub async fn last(&self) -> Option<Message> {
        self.messages.read().await.last().cloned()
    }

    /// Drop every message
    pub async fn reset(&self) {
        self.messages.write().await.clear();
    }
}
