//! Streaming Relay
//!
//! Turns one `UserMessage` into the frames of a turn: `ResponseStart`, the
//! user message as a side `AgentMessage`, then response tokens and side
//! messages in generation order, and finally `ResponseEnd`. `ResponseEnd`
//! is emitted on every path, including agent failure and cancellation.

use crate::{
    agent::{Agent, AgentError, AgentEvent},
    frame::Frame,
    message::Message,
    pipeline::{Downstream, FrameProcessor, Interruptions, ProcessorError},
    tools::{CallerInfo, ToolContext},
};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span};
use uuid::Uuid;

/// Agent events buffered ahead of the pipeline.
const EVENT_BUFFER: usize = 64;

/// Spoken when a turn fails before producing any text.
pub const DEFAULT_FALLBACK: &str = "Sorry, something went wrong on my side. Could you say that again?";

/// Aborts the agent task when the turn is dropped, so an abandoned model
/// or tool call does not keep running.
struct AbortOnDrop(JoinHandle<Result<(), AgentError>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

enum TurnState {
    Start(Message),
    EchoUser(Message),
    Streaming {
        events: mpsc::Receiver<AgentEvent>,
        task: AbortOnDrop,
    },
    Finishing,
    Finished,
}

struct Turn {
    id: Uuid,
    agent: Arc<Agent>,
    ctx: ToolContext,
    cancel: CancellationToken,
    fallback: Option<String>,
    /// Text streamed so far, kept for diagnostics.
    partial: String,
    state: TurnState,
}

impl Turn {
    async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            match std::mem::replace(&mut self.state, TurnState::Finished) {
                TurnState::Start(message) => {
                    self.state = TurnState::EchoUser(message);
                    return Some(Frame::ResponseStart);
                }
                TurnState::EchoUser(message) => {
                    if self.cancel.is_cancelled() {
                        info!(turn_id = %self.id, "Turn interrupted before the agent started");
                        self.state = TurnState::Finishing;
                        continue;
                    }
                    self.state = self.start_agent(message.clone());
                    return Some(Frame::AgentMessage(message));
                }
                TurnState::Streaming { mut events, mut task } => {
                    let event = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => {
                            info!(turn_id = %self.id, partial = %self.partial, "Turn interrupted, abandoning agent");
                            self.state = TurnState::Finishing;
                            continue;
                        }
                        event = events.recv() => event,
                    };
                    match event {
                        Some(AgentEvent::TextDelta(delta)) => {
                            self.partial.push_str(&delta);
                            self.state = TurnState::Streaming { events, task };
                            return Some(Frame::ResponseToken { text: delta });
                        }
                        Some(AgentEvent::Message(message)) => {
                            self.state = TurnState::Streaming { events, task };
                            return Some(Frame::AgentMessage(message));
                        }
                        None => {
                            self.state = TurnState::Finishing;
                            if let Some(fallback) = self.finish(&mut task).await {
                                return Some(Frame::ResponseToken { text: fallback });
                            }
                        }
                    }
                }
                TurnState::Finishing => return Some(Frame::ResponseEnd),
                TurnState::Finished => return None,
            }
        }
    }

    fn start_agent(&self, message: Message) -> TurnState {
        let (tx, events) = mpsc::channel(EVENT_BUFFER);
        let agent = self.agent.clone();
        let ctx = self.ctx.clone();
        let span = info_span!("turn", turn_id = %self.id, conversation_id = %ctx.conversation_id);
        let handle = tokio::spawn(
            async move { agent.run_turn(&ctx, message, &tx).await }.instrument(span),
        );
        TurnState::Streaming {
            events,
            task: AbortOnDrop(handle),
        }
    }

    /// Collects the agent's outcome once its event channel has closed.
    /// Returns fallback text to speak when the turn failed silently.
    async fn finish(&mut self, task: &mut AbortOnDrop) -> Option<String> {
        let failed = match (&mut task.0).await {
            Ok(Ok(())) => {
                debug!(turn_id = %self.id, "Turn completed");
                false
            }
            Ok(Err(e)) => {
                error!(turn_id = %self.id, partial = %self.partial, error = %e, "Turn failed");
                true
            }
            Err(e) => {
                error!(turn_id = %self.id, partial = %self.partial, error = %e, "Agent task died");
                true
            }
        };
        if failed && self.partial.is_empty() {
            self.fallback.clone()
        } else {
            None
        }
    }
}

/// Drives the agent for each user message on behalf of one conversation.
pub struct StreamingRelay {
    agent: Arc<Agent>,
    ctx: ToolContext,
    fallback: Option<String>,
    interruptions: Interruptions,
}

impl StreamingRelay {
    pub fn new(agent: Arc<Agent>, conversation_id: impl Into<String>, caller: CallerInfo) -> Self {
        Self {
            agent,
            ctx: ToolContext {
                conversation_id: conversation_id.into(),
                caller,
            },
            fallback: Some(DEFAULT_FALLBACK.to_string()),
            interruptions: Interruptions::default(),
        }
    }

    /// Text spoken when a turn fails before any response text; `None`
    /// ends such turns silently.
    pub fn with_fallback(mut self, fallback: Option<String>) -> Self {
        self.fallback = fallback;
        self
    }

    /// The frames of one turn. Nothing runs until the stream is polled, and
    /// cancelling `cancel` stops it at the next frame boundary.
    pub fn stream_turn(&self, user_message: Message, cancel: CancellationToken) -> BoxStream<'static, Frame> {
        let turn = Turn {
            id: Uuid::new_v4(),
            agent: self.agent.clone(),
            ctx: self.ctx.clone(),
            cancel,
            fallback: self.fallback.clone(),
            partial: String::new(),
            state: TurnState::Start(user_message),
        };
        stream::unfold(turn, |mut turn| async move {
            let frame = turn.next_frame().await?;
            Some((frame, turn))
        })
        .boxed()
    }
}

#[async_trait]
impl FrameProcessor for StreamingRelay {
    fn name(&self) -> &str {
        "streaming_relay"
    }

    fn setup(&mut self, interruptions: &Interruptions) {
        self.interruptions = interruptions.clone();
    }

    async fn process_frame(
        &mut self,
        frame: Frame,
        downstream: &mut Downstream<'_>,
    ) -> Result<(), ProcessorError> {
        match frame {
            Frame::UserMessage { role, content } => {
                let cancel = self.interruptions.begin_turn().await;
                let mut frames = self.stream_turn(Message::new(role, content), cancel);
                let mut result = Ok(());
                while let Some(frame) = frames.next().await {
                    if let Err(e) = downstream.push(frame).await {
                        result = Err(e);
                        break;
                    }
                }
                self.interruptions.end_turn().await;
                result?;
            }
            Frame::ControlEnd => {
                if self.agent.end_conversation(&self.ctx.conversation_id).await {
                    debug!(conversation_id = %self.ctx.conversation_id, "Session ended");
                }
                downstream.push(frame).await?;
            }
            Frame::ControlStart
            | Frame::Interrupt
            | Frame::TranscriptChunk { .. }
            | Frame::ResponseStart
            | Frame::ResponseToken { .. }
            | Frame::ResponseEnd
            | Frame::AgentMessage(_) => downstream.push(frame).await?,
        }
        Ok(())
    }
}
