//! Per-conversation memory, keyed by conversation id.

use crate::message::{Message, Role};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::sync::Mutex;

/// Content recorded for a tool call whose result never arrived.
pub const ABANDONED_TOOL_RESULT: &str = "Error: the tool call was abandoned before it completed.";

#[derive(Debug, Clone)]
pub struct Conversation {
    id: String,
    history: Vec<Message>,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            history: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn push(&mut self, message: Message) {
        self.history.push(message);
    }

    /// Records an error result for every tool call that has none, so the
    /// history again pairs each request with a result. Returns how many
    /// results were added.
    pub fn close_dangling_tool_calls(&mut self) -> usize {
        let answered: HashSet<&str> = self
            .history
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        let dangling: Vec<String> = self
            .history
            .iter()
            .flat_map(|m| m.tool_calls.iter())
            .filter(|call| !answered.contains(call.id.as_str()))
            .map(|call| call.id.clone())
            .collect();

        let count = dangling.len();
        for id in dangling {
            self.history.push(Message::tool_result(id, ABANDONED_TOOL_RESULT));
        }
        count
    }
}

/// Conversation-id keyed map of live conversations. Each conversation has
/// its own lock; holding it for a whole turn keeps its mutations sequential.
#[derive(Clone, Default)]
pub struct ConversationStore {
    conversations: Arc<Mutex<HashMap<String, Arc<Mutex<Conversation>>>>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the conversation, creating it on first use.
    pub async fn get_or_create(&self, id: &str) -> Arc<Mutex<Conversation>> {
        self.conversations
            .lock()
            .await
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Conversation::new(id))))
            .clone()
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Mutex<Conversation>>> {
        self.conversations.lock().await.get(id).cloned()
    }

    /// Drops a conversation. Returns whether it existed.
    pub async fn evict(&self, id: &str) -> bool {
        self.conversations.lock().await.remove(id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.conversations.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
