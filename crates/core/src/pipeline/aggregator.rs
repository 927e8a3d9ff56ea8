//! Turn aggregation: many transcript chunks in, one user message out.

use super::{Downstream, FrameProcessor, ProcessorError};
use crate::{frame::Frame, message::Role};
use async_trait::async_trait;
use tracing::debug;

/// Buffers `TranscriptChunk` text until a final chunk arrives, then emits a
/// single trimmed `UserMessage`. Whitespace-only utterances are dropped.
#[derive(Debug, Default)]
pub struct TurnAggregator {
    buffer: String,
}

impl TurnAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn append(&mut self, text: &str) {
        if !self.buffer.is_empty() {
            self.buffer.push(' ');
        }
        self.buffer.push_str(text);
    }
}

#[async_trait]
impl FrameProcessor for TurnAggregator {
    fn name(&self) -> &str {
        "turn_aggregator"
    }

    async fn process_frame(
        &mut self,
        frame: Frame,
        downstream: &mut Downstream<'_>,
    ) -> Result<(), ProcessorError> {
        match frame {
            Frame::TranscriptChunk { text, is_final } => {
                self.append(&text);
                if !is_final {
                    return Ok(());
                }
                let utterance = std::mem::take(&mut self.buffer);
                let content = utterance.trim();
                if content.is_empty() {
                    debug!("Dropping empty utterance");
                    return Ok(());
                }
                downstream
                    .push(Frame::UserMessage {
                        role: Role::User,
                        content: content.to_string(),
                    })
                    .await?;
            }
            frame @ (Frame::ControlStart
            | Frame::ControlEnd
            | Frame::Interrupt
            | Frame::UserMessage { .. }
            | Frame::ResponseStart
            | Frame::ResponseToken { .. }
            | Frame::ResponseEnd
            | Frame::AgentMessage(_)) => downstream.push(frame).await?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{PipelineRunner, observer::FrameTap};

    async fn run(frames: Vec<Frame>) -> Vec<Frame> {
        let (tap, mut rx) = FrameTap::new();
        let (runner, _) =
            PipelineRunner::new(vec![Box::new(TurnAggregator::new()), Box::new(tap)]);
        runner.run(frames).await.unwrap();
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(frame);
        }
        out
    }

    #[tokio::test]
    async fn test_partial_chunks_emit_nothing() {
        let out = run(vec![
            Frame::transcript("I need", false),
            Frame::transcript("a cardiologist", false),
        ])
        .await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_final_chunk_emits_one_trimmed_message() {
        let out = run(vec![
            Frame::transcript("  I need", false),
            Frame::transcript("a cardiologist  ", true),
        ])
        .await;
        assert_eq!(out, vec![Frame::user("I need a cardiologist")]);
    }

    #[tokio::test]
    async fn test_whitespace_only_utterance_is_dropped() {
        let out = run(vec![
            Frame::transcript("   ", false),
            Frame::transcript("\t", true),
            Frame::transcript("hello", true),
        ])
        .await;
        assert_eq!(out, vec![Frame::user("hello")]);
    }

    #[tokio::test]
    async fn test_other_frames_pass_through_unchanged() {
        let out = run(vec![
            Frame::ControlStart,
            Frame::transcript("buffered", false),
            Frame::Interrupt,
            Frame::user("typed"),
        ])
        .await;
        assert_eq!(
            out,
            vec![Frame::ControlStart, Frame::Interrupt, Frame::user("typed")]
        );
    }
}
