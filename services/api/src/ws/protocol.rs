//! Defines the WebSocket message protocol between a client and the API server.
//!
//! The transport is text-only: the client streams transcript fragments in,
//! the server streams response text, spoken sentences and side messages out.

use nfz_voice_core::message::Message;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Messages sent from the client to the server.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Starts a session. This must be the first message.
    Init {
        /// Caller's phone number, when the call came through telephony.
        #[serde(default)]
        caller_number: Option<String>,
    },
    /// A piece of transcribed speech.
    Transcript {
        text: String,
        #[serde(default)]
        is_final: bool,
    },
    /// A complete typed utterance.
    UserMessage { text: String },
    /// The user started talking over the assistant.
    Interrupt,
    /// The client is done with the session.
    End,
}

/// Messages sent from the server to the client.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Confirms the session and names its conversation id.
    Initialized { session_id: Uuid },
    /// Signals the beginning of a streamed response.
    ResponseStart,
    /// A chunk of a streamed text response.
    ResponseChunk { chunk: String },
    /// Signals the end of a streamed response.
    ResponseEnd,
    /// A message committed to the conversation, including tool traffic.
    AgentMessage { message: Message },
    /// A complete sentence ready to be spoken.
    Speech { text: String },
    /// Anything still being spoken should stop.
    SpeechStop,
    /// The session is over; no more messages follow.
    SessionEnded { reason: String },
    /// Reports a fatal error to the client.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_messages_parse() {
        let init: ClientMessage = serde_json::from_str(r#"{"type":"init"}"#).unwrap();
        assert_eq!(init, ClientMessage::Init { caller_number: None });

        let chunk: ClientMessage =
            serde_json::from_str(r#"{"type":"transcript","text":"Kraków"}"#).unwrap();
        assert_eq!(
            chunk,
            ClientMessage::Transcript {
                text: "Kraków".into(),
                is_final: false
            }
        );

        let interrupt: ClientMessage = serde_json::from_str(r#"{"type":"interrupt"}"#).unwrap();
        assert_eq!(interrupt, ClientMessage::Interrupt);
    }

    #[test]
    fn test_server_messages_serialize_with_type_tag() {
        let json = serde_json::to_value(ServerMessage::ResponseChunk { chunk: "Dzień".into() }).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "response_chunk", "chunk": "Dzień" }));

        let json = serde_json::to_value(ServerMessage::AgentMessage {
            message: Message::tool_result("call_1", "07"),
        })
        .unwrap();
        assert_eq!(json["type"], "agent_message");
        assert_eq!(json["message"]["tool_call_id"], "call_1");
    }
}
