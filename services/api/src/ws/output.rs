//! The last stages of a session pipeline: frames become [`ServerMessage`]s
//! on the connection's outbound queue.

use super::protocol::ServerMessage;
use async_trait::async_trait;
use nfz_voice_core::{
    frame::Frame,
    pipeline::{Downstream, FrameProcessor, ProcessorError, speech::Synthesizer},
};
use tokio::sync::mpsc;
use tracing::debug;

/// Sends response frames and side messages to the client in pipeline order.
pub struct ClientOutput {
    tx: mpsc::Sender<ServerMessage>,
}

impl ClientOutput {
    pub fn new(tx: mpsc::Sender<ServerMessage>) -> Self {
        Self { tx }
    }

    fn to_server_message(frame: &Frame) -> Option<ServerMessage> {
        match frame {
            Frame::ResponseStart => Some(ServerMessage::ResponseStart),
            Frame::ResponseToken { text } => Some(ServerMessage::ResponseChunk {
                chunk: text.clone(),
            }),
            Frame::ResponseEnd => Some(ServerMessage::ResponseEnd),
            Frame::AgentMessage(message) => Some(ServerMessage::AgentMessage {
                message: message.clone(),
            }),
            Frame::ControlStart
            | Frame::ControlEnd
            | Frame::Interrupt
            | Frame::TranscriptChunk { .. }
            | Frame::UserMessage { .. } => None,
        }
    }
}

#[async_trait]
impl FrameProcessor for ClientOutput {
    fn name(&self) -> &str {
        "client_output"
    }

    async fn process_frame(
        &mut self,
        frame: Frame,
        downstream: &mut Downstream<'_>,
    ) -> Result<(), ProcessorError> {
        if let Some(message) = Self::to_server_message(&frame) {
            if self.tx.send(message).await.is_err() {
                debug!(kind = frame.kind(), "Client writer gone, dropping frame");
            }
        }
        downstream.push(frame).await?;
        Ok(())
    }
}

/// Speaks by sending sentences to the client, which renders the audio.
pub struct ClientSpeech {
    tx: mpsc::Sender<ServerMessage>,
}

impl ClientSpeech {
    pub fn new(tx: mpsc::Sender<ServerMessage>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Synthesizer for ClientSpeech {
    async fn speak(&mut self, text: &str) -> anyhow::Result<()> {
        self.tx
            .send(ServerMessage::Speech {
                text: text.to_string(),
            })
            .await?;
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        self.tx.send(ServerMessage::SpeechStop).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nfz_voice_core::{
        message::Message,
        pipeline::{PipelineRunner, speech::SpeechOutput},
    };

    #[tokio::test]
    async fn test_frames_reach_the_client_in_order() {
        let (tx, mut rx) = mpsc::channel(32);
        let (runner, _) = PipelineRunner::new(vec![
            Box::new(SpeechOutput::new(ClientSpeech::new(tx.clone()))),
            Box::new(ClientOutput::new(tx)),
        ]);
        runner
            .run(vec![
                Frame::ControlStart,
                Frame::ResponseStart,
                Frame::AgentMessage(Message::user("halo")),
                Frame::token("Dzień dobry."),
                Frame::ResponseEnd,
                Frame::ControlEnd,
            ])
            .await
            .unwrap();

        let mut received = Vec::new();
        while let Some(message) = rx.recv().await {
            received.push(message);
        }
        assert_eq!(
            received,
            vec![
                ServerMessage::ResponseStart,
                ServerMessage::AgentMessage {
                    message: Message::user("halo")
                },
                ServerMessage::Speech {
                    text: "Dzień dobry.".into()
                },
                ServerMessage::ResponseChunk {
                    chunk: "Dzień dobry.".into()
                },
                ServerMessage::ResponseEnd,
            ]
        );
    }
}
