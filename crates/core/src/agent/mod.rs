//! Agent State Machine
//!
//! Every turn starts in [`AgentPhase::Reasoning`]: the model sees the system
//! instruction followed by the conversation history and may answer or ask
//! for tools. Tool requests move the turn to [`AgentPhase::ToolExecution`],
//! whose results send it back to `Reasoning`; an answer without tool
//! requests ends it in [`AgentPhase::Done`].
//!
//! There is no cap on `Reasoning`/`ToolExecution` cycles. A turn ends only
//! when the model stops requesting tools, so termination depends on the
//! model. Callers bound turns through cancellation, not through this loop.

pub mod memory;

use crate::{
    llm_client::{LLMClient, LLMStreamEvent},
    message::{Message, ToolCall},
    tools::{ToolContext, ToolRegistry},
};
use futures::{StreamExt, future::join_all};
use memory::ConversationStore;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentPhase {
    Reasoning,
    ToolExecution(Vec<ToolCall>),
    Done,
}

impl AgentPhase {
    /// The phase that follows a completed reasoning step.
    pub fn after_reasoning(message: &Message) -> Self {
        if message.requests_tools() {
            AgentPhase::ToolExecution(message.tool_calls.clone())
        } else {
            AgentPhase::Done
        }
    }
}

/// What a running turn reports to its consumer, in generation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// Spoken text, as soon as the model produces it.
    TextDelta(String),
    /// A message committed to the history: assistant output or a tool result.
    Message(Message),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("model call failed: {0:#}")]
    Model(anyhow::Error),
    #[error("turn consumer went away")]
    Disconnected,
}

/// Long-lived orchestrator owning the memory of every live conversation.
pub struct Agent {
    llm: Arc<dyn LLMClient>,
    tools: Arc<ToolRegistry>,
    system_prompt: String,
    conversations: ConversationStore,
}

impl Agent {
    pub fn new(
        llm: Arc<dyn LLMClient>,
        tools: Arc<ToolRegistry>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            llm,
            tools,
            system_prompt: system_prompt.into(),
            conversations: ConversationStore::new(),
        }
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    /// A copy of a conversation's history; empty for unknown ids.
    pub async fn history(&self, conversation_id: &str) -> Vec<Message> {
        match self.conversations.get(conversation_id).await {
            Some(conversation) => conversation.lock().await.history().to_vec(),
            None => Vec::new(),
        }
    }

    /// Forgets a conversation once its session has ended.
    pub async fn end_conversation(&self, conversation_id: &str) -> bool {
        let existed = self.conversations.evict(conversation_id).await;
        if existed {
            info!(conversation_id, "Conversation evicted");
        }
        existed
    }

    /// Runs one turn for `user_message`, reporting progress on `events`.
    ///
    /// The conversation stays locked for the whole turn; a second turn for
    /// the same id waits until this one finishes or is dropped.
    #[instrument(name = "agent_turn", skip_all, fields(conversation_id = %ctx.conversation_id))]
    pub async fn run_turn(
        &self,
        ctx: &ToolContext,
        user_message: Message,
        events: &mpsc::Sender<AgentEvent>,
    ) -> Result<(), AgentError> {
        let conversation = self.conversations.get_or_create(&ctx.conversation_id).await;
        let mut conversation = conversation.lock().await;

        let repaired = conversation.close_dangling_tool_calls();
        if repaired > 0 {
            warn!(repaired, "Closed tool calls left unanswered by an abandoned turn");
        }
        conversation.push(user_message);

        let mut phase = AgentPhase::Reasoning;
        loop {
            phase = match phase {
                AgentPhase::Reasoning => {
                    let message = self.reason(conversation.history(), events).await?;
                    let next = AgentPhase::after_reasoning(&message);
                    conversation.push(message.clone());
                    emit(events, AgentEvent::Message(message)).await?;
                    next
                }
                AgentPhase::ToolExecution(calls) => {
                    debug!(calls = calls.len(), "Executing tool calls");
                    let results = join_all(calls.iter().map(|call| self.tools.invoke(ctx, call))).await;
                    for (call, result) in calls.into_iter().zip(results) {
                        let content = result.unwrap_or_else(|e| {
                            warn!(tool = %call.name, call_id = %call.id, error = %e, "Tool call failed");
                            e
                        });
                        let message = Message::tool_result(call.id, content);
                        conversation.push(message.clone());
                        emit(events, AgentEvent::Message(message)).await?;
                    }
                    AgentPhase::Reasoning
                }
                AgentPhase::Done => return Ok(()),
            };
        }
    }

    /// One model call over the system instruction and `history`. Text is
    /// forwarded as it streams; the assembled message is returned.
    async fn reason(
        &self,
        history: &[Message],
        events: &mpsc::Sender<AgentEvent>,
    ) -> Result<Message, AgentError> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(Message::system(self.system_prompt.clone()));
        messages.extend_from_slice(history);

        let mut stream = self
            .llm
            .stream_chat(messages, self.tools.specs())
            .await
            .map_err(AgentError::Model)?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        while let Some(event) = stream.next().await {
            match event.map_err(AgentError::Model)? {
                LLMStreamEvent::TextChunk(delta) => {
                    text.push_str(&delta);
                    emit(events, AgentEvent::TextDelta(delta)).await?;
                }
                LLMStreamEvent::ToolCall(call) => tool_calls.push(call),
            }
        }
        Ok(Message::assistant_with_tools(text, tool_calls))
    }
}

async fn emit(events: &mpsc::Sender<AgentEvent>, event: AgentEvent) -> Result<(), AgentError> {
    events.send(event).await.map_err(|_| AgentError::Disconnected)
}
