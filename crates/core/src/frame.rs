//! Pipeline Frames
//!
//! A `Frame` is one typed unit of data or control moving through the
//! pipeline. Frames are never mutated after construction; a processor that
//! forwards a frame gives up ownership of it.

use crate::message::{Message, Role};

/// Closed set of frame kinds. Processors match on it exhaustively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Session start.
    ControlStart,
    /// Session end. The runner stops after delivering it.
    ControlEnd,
    /// Cancels in-flight generation for the current turn.
    Interrupt,
    /// A piece of transcribed user speech.
    TranscriptChunk { text: String, is_final: bool },
    /// One complete utterance, ready for the agent.
    UserMessage { role: Role, content: String },
    ResponseStart,
    /// A text delta of the assistant's spoken answer.
    ResponseToken { text: String },
    ResponseEnd,
    /// Side frame: a message committed to the agent's history.
    AgentMessage(Message),
}

impl Frame {
    pub fn transcript(text: impl Into<String>, is_final: bool) -> Self {
        Frame::TranscriptChunk {
            text: text.into(),
            is_final,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Frame::UserMessage {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn token(text: impl Into<String>) -> Self {
        Frame::ResponseToken { text: text.into() }
    }

    /// Control frames bypass buffering and carry no conversation data.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Frame::ControlStart | Frame::ControlEnd | Frame::Interrupt
        )
    }

    /// Short kind name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::ControlStart => "ControlStart",
            Frame::ControlEnd => "ControlEnd",
            Frame::Interrupt => "Interrupt",
            Frame::TranscriptChunk { .. } => "TranscriptChunk",
            Frame::UserMessage { .. } => "UserMessage",
            Frame::ResponseStart => "ResponseStart",
            Frame::ResponseToken { .. } => "ResponseToken",
            Frame::ResponseEnd => "ResponseEnd",
            Frame::AgentMessage(_) => "AgentMessage",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_frames() {
        assert!(Frame::Interrupt.is_control());
        assert!(Frame::ControlEnd.is_control());
        assert!(!Frame::ResponseEnd.is_control());
        assert!(!Frame::transcript("a", false).is_control());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(Frame::token("x").kind(), "ResponseToken");
        assert_eq!(Frame::user("x").kind(), "UserMessage");
        assert_eq!(
            Frame::AgentMessage(Message::assistant("x")).kind(),
            "AgentMessage"
        );
    }
}
