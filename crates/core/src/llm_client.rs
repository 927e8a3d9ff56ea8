use crate::{
    message::{Message, Role, ToolCall},
    tools::ToolSpec,
};
use anyhow::{Context, Result};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
        ChatCompletionTool, ChatCompletionToolArgs, ChatCompletionToolType,
        CreateChatCompletionRequestArgs, FunctionCall, FunctionObjectArgs,
    },
};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::{collections::BTreeMap, pin::Pin};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// Events yielded while the model produces one assistant message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LLMStreamEvent {
    /// A piece of the spoken answer, yielded as soon as it arrives.
    TextChunk(String),
    /// A fully assembled tool request.
    ToolCall(ToolCall),
}

/// A stream of model output events. Dropping it abandons the call.
pub type LLMStream = Pin<Box<dyn Stream<Item = Result<LLMStreamEvent>> + Send>>;

/// Buffered events between the HTTP stream reader and the consumer.
const STREAM_BUFFER: usize = 64;

/// A generic client for interacting with an LLM.
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Starts a streaming completion over `messages` with `tools` bound.
    async fn stream_chat(&self, messages: Vec<Message>, tools: Vec<ToolSpec>) -> Result<LLMStream>;
}

/// An implementation of `LLMClient` for any OpenAI-compatible API.
pub struct OpenAICompatibleClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAICompatibleClient {
    /// Creates a new client for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration for the OpenAI client, including API key and base URL.
    /// * `model` - The specific model identifier to use for chat completions (e.g., "gpt-4o-mini").
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }
}

fn to_request_message(message: &Message) -> Result<ChatCompletionRequestMessage> {
    let request = match message.role {
        Role::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(message.content.clone())
            .build()?
            .into(),
        Role::User => ChatCompletionRequestUserMessageArgs::default()
            .content(message.content.clone())
            .build()?
            .into(),
        Role::Assistant => {
            let mut builder = ChatCompletionRequestAssistantMessageArgs::default();
            if !message.content.is_empty() {
                builder.content(message.content.clone());
            }
            if !message.tool_calls.is_empty() {
                builder.tool_calls(
                    message
                        .tool_calls
                        .iter()
                        .map(|call| ChatCompletionMessageToolCall {
                            id: call.id.clone(),
                            r#type: ChatCompletionToolType::Function,
                            function: FunctionCall {
                                name: call.name.clone(),
                                arguments: call.arguments.clone(),
                            },
                        })
                        .collect::<Vec<_>>(),
                );
            }
            builder.build()?.into()
        }
        Role::Tool => ChatCompletionRequestToolMessageArgs::default()
            .tool_call_id(message.tool_call_id.clone().unwrap_or_default())
            .content(message.content.clone())
            .build()?
            .into(),
    };
    Ok(request)
}

fn to_chat_tool(spec: &ToolSpec) -> Result<ChatCompletionTool> {
    Ok(ChatCompletionToolArgs::default()
        .function(
            FunctionObjectArgs::default()
                .name(spec.name.clone())
                .description(spec.description.clone())
                .parameters(spec.parameters.clone())
                .build()?,
        )
        .build()?)
}

/// Tool-call fragments collected across stream chunks, keyed by index.
#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

#[async_trait]
impl LLMClient for OpenAICompatibleClient {
    async fn stream_chat(&self, messages: Vec<Message>, tools: Vec<ToolSpec>) -> Result<LLMStream> {
        let request_messages = messages
            .iter()
            .map(to_request_message)
            .collect::<Result<Vec<_>>>()?;

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model).messages(request_messages).stream(true);
        if !tools.is_empty() {
            let chat_tools = tools.iter().map(to_chat_tool).collect::<Result<Vec<_>>>()?;
            args.tools(chat_tools).tool_choice("auto");
        }
        let request = args.build()?;

        let mut stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .context("Failed to open model stream")?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let mut partial_calls: BTreeMap<u32, PartialToolCall> = BTreeMap::new();
            while let Some(result) = stream.next().await {
                let response = match result {
                    Ok(response) => response,
                    Err(e) => {
                        let _ = tx
                            .send(Err(anyhow::Error::new(e).context("Model stream failed")))
                            .await;
                        return;
                    }
                };
                for choice in response.choices {
                    if let Some(content) = choice.delta.content {
                        if !content.is_empty()
                            && tx.send(Ok(LLMStreamEvent::TextChunk(content))).await.is_err()
                        {
                            debug!("Model stream consumer dropped, abandoning call");
                            return;
                        }
                    }
                    for chunk in choice.delta.tool_calls.unwrap_or_default() {
                        let partial = partial_calls.entry(chunk.index).or_default();
                        if let Some(id) = chunk.id {
                            partial.id = id;
                        }
                        if let Some(function) = chunk.function {
                            if let Some(name) = function.name {
                                partial.name = name;
                            }
                            if let Some(arguments) = function.arguments {
                                partial.arguments.push_str(&arguments);
                            }
                        }
                    }
                }
            }

            for (index, partial) in partial_calls {
                if partial.name.is_empty() {
                    warn!(index, "Dropping tool call without a name");
                    continue;
                }
                let call = ToolCall {
                    id: partial.id,
                    name: partial.name,
                    arguments: partial.arguments,
                };
                if tx.send(Ok(LLMStreamEvent::ToolCall(call))).await.is_err() {
                    return;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assistant_tool_request_is_converted() {
        let message = Message::assistant_with_tools(
            "",
            vec![ToolCall {
                id: "call_1".into(),
                name: "resolve_province".into(),
                arguments: r#"{"locality":"Kraków"}"#.into(),
            }],
        );
        let request = to_request_message(&message).unwrap();
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["tool_calls"][0]["id"], "call_1");
        assert_eq!(json["tool_calls"][0]["function"]["name"], "resolve_province");
    }

    #[test]
    fn test_tool_result_keeps_call_id() {
        let request = to_request_message(&Message::tool_result("call_9", "06")).unwrap();
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["tool_call_id"], "call_9");
        assert_eq!(json["content"], "06");
    }

    #[test]
    fn test_tool_spec_is_converted() {
        let spec = ToolSpec {
            name: "current_date_time".into(),
            description: "Tells the time".into(),
            parameters: serde_json::json!({ "type": "object", "properties": {} }),
        };
        let tool = to_chat_tool(&spec).unwrap();
        assert_eq!(tool.function.name, "current_date_time");
    }
}
