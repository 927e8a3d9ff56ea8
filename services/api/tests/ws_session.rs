//! Drives the `/ws` endpoint of a locally bound server with a scripted model.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use axum::extract::State;
use futures_util::{SinkExt, StreamExt, stream};
use nfz_voice_api::{
    config::{Config, Provider},
    handlers,
    router::create_router,
    state::AppState,
    ws::session::IDLE_FAREWELL,
};
use nfz_voice_core::{
    agent::Agent,
    llm_client::{LLMClient, LLMStream, LLMStreamEvent},
    message::{Message, ToolCall},
    tools::{Tool, ToolContext, ToolRegistry, ToolSpec},
};
use serde_json::{Value, json};
use std::{collections::VecDeque, sync::Arc, sync::Mutex, time::Duration};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Replays one scripted list of events per model call.
struct ScriptedLlm {
    scripts: Mutex<VecDeque<Vec<LLMStreamEvent>>>,
}

#[async_trait]
impl LLMClient for ScriptedLlm {
    async fn stream_chat(&self, _messages: Vec<Message>, _tools: Vec<ToolSpec>) -> Result<LLMStream> {
        let events = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("model called more often than scripted"))?;
        Ok(stream::iter(events.into_iter().map(Ok)).boxed())
    }
}

fn text(chunk: &str) -> LLMStreamEvent {
    LLMStreamEvent::TextChunk(chunk.to_string())
}

/// Reports the caller number it was invoked for.
struct CallerNumber;

#[async_trait]
impl Tool for CallerNumber {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "caller_number".into(),
            description: "Returns the caller's phone number.".into(),
            parameters: json!({ "type": "object", "properties": {} }),
        }
    }

    async fn call(&self, ctx: &ToolContext, _arguments: Value) -> Result<String, String> {
        ctx.caller
            .phone_number
            .clone()
            .ok_or_else(|| "caller number unknown".to_string())
    }
}

fn test_config(idle: Duration) -> Config {
    Config {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        provider: Provider::OpenAI,
        openai_api_key: Some("test".into()),
        gemini_api_key: None,
        chat_model: "scripted".into(),
        log_level: tracing::Level::INFO,
        prompts_path: "./prompts".into(),
        nfz_api_base: "http://127.0.0.1:9".into(),
        nfz_api_version: "1.3".into(),
        region_lookup_timeout: Duration::from_millis(100),
        session_idle_timeout: idle,
        mcp_server_command: None,
    }
}

fn app_state(scripts: Vec<Vec<LLMStreamEvent>>, idle: Duration) -> Arc<AppState> {
    let llm = Arc::new(ScriptedLlm {
        scripts: Mutex::new(scripts.into()),
    });
    let tools = ToolRegistry::new().with(Arc::new(CallerNumber));
    Arc::new(AppState {
        agent: Arc::new(Agent::new(llm, Arc::new(tools), "You help callers find visits.")),
        config: Arc::new(test_config(idle)),
    })
}

async fn connect(state: Arc<AppState>) -> Client {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, create_router(state)).await });
    let (client, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    client
}

async fn send(client: &mut Client, msg: Value) {
    client
        .send(tungstenite::Message::Text(msg.to_string().into()))
        .await
        .unwrap();
}

/// Server messages up to and including the first one of type `until`.
async fn recv_until(client: &mut Client, until: &str) -> Vec<Value> {
    let collect = async {
        let mut received = Vec::new();
        while let Some(msg) = client.next().await {
            let tungstenite::Message::Text(raw) = msg.unwrap() else {
                continue;
            };
            let value: Value = serde_json::from_str(raw.as_str()).unwrap();
            let done = value["type"] == until;
            received.push(value);
            if done {
                break;
            }
        }
        received
    };
    tokio::time::timeout(Duration::from_secs(5), collect)
        .await
        .expect("server did not send the expected message in time")
}

fn of_type<'a>(messages: &'a [Value], kind: &str) -> Vec<&'a Value> {
    messages.iter().filter(|m| m["type"] == kind).collect()
}

#[tokio::test]
async fn test_session_greets_answers_and_ends() {
    let state = app_state(
        vec![
            vec![text("Dzień dobry, "), text("w czym mogę pomóc?")],
            vec![LLMStreamEvent::ToolCall(ToolCall {
                id: "call_1".into(),
                name: "caller_number".into(),
                arguments: "{}".into(),
            })],
            vec![text("Widzę Pana numer.")],
        ],
        Duration::from_secs(30),
    );
    let mut client = connect(state.clone()).await;

    send(&mut client, json!({ "type": "init", "caller_number": "+48600100200" })).await;
    let init = recv_until(&mut client, "initialized").await;
    assert!(init[0]["session_id"].is_string());

    let greeting = recv_until(&mut client, "response_end").await;
    assert_eq!(greeting[0]["type"], "response_start");
    assert_eq!(greeting[1]["message"]["role"], "system");
    let chunks: Vec<&str> = of_type(&greeting, "response_chunk")
        .iter()
        .filter_map(|m| m["chunk"].as_str())
        .collect();
    assert_eq!(chunks.concat(), "Dzień dobry, w czym mogę pomóc?");
    assert_eq!(of_type(&greeting, "speech").len(), 1);

    send(&mut client, json!({ "type": "transcript", "text": "Jaki jest", "is_final": false })).await;
    send(&mut client, json!({ "type": "transcript", "text": "mój numer?", "is_final": true })).await;
    let turn = recv_until(&mut client, "response_end").await;
    let side = of_type(&turn, "agent_message");
    assert_eq!(side[0]["message"]["content"], "Jaki jest mój numer?");
    assert_eq!(side[2]["message"]["tool_call_id"], "call_1");
    assert_eq!(side[2]["message"]["content"], "+48600100200");
    assert_eq!(of_type(&turn, "response_start").len(), 1);

    let status = handlers::status(State(state.clone())).await.0;
    assert_eq!(status.active_conversations, 1);
    assert_eq!(status.tools, 1);

    send(&mut client, json!({ "type": "end" })).await;
    let ended = recv_until(&mut client, "session_ended").await;
    assert_eq!(ended.last().unwrap()["reason"], "client_ended");

    assert!(state.agent.conversations().is_empty().await);
}

#[tokio::test]
async fn test_idle_session_is_ended() {
    let state = app_state(vec![vec![text("Halo?")]], Duration::from_millis(300));
    let mut client = connect(state.clone()).await;

    send(&mut client, json!({ "type": "init" })).await;
    recv_until(&mut client, "response_end").await;

    let ended = recv_until(&mut client, "session_ended").await;
    let spoken: Vec<&str> = of_type(&ended, "speech")
        .iter()
        .filter_map(|m| m["text"].as_str())
        .collect();
    assert_eq!(spoken, vec![IDLE_FAREWELL]);
    assert_eq!(ended.last().unwrap()["reason"], "idle");
    assert!(state.agent.conversations().is_empty().await);
}

#[tokio::test]
async fn test_first_message_must_be_init() {
    let state = app_state(Vec::new(), Duration::from_secs(30));
    let mut client = connect(state).await;

    send(&mut client, json!({ "type": "user_message", "text": "halo" })).await;
    let reply = recv_until(&mut client, "error").await;
    assert_eq!(reply[0]["message"], "First message must be `init`");
}
