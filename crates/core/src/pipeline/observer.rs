//! Observation processors: they look at frames on their way through and
//! always forward them.

use super::{Downstream, FrameProcessor, ProcessorError};
use crate::{frame::Frame, message::Message};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Publishes every side `AgentMessage` on a channel, e.g. to a client UI or
/// an audit log.
pub struct SideChannelObserver {
    tx: Option<mpsc::Sender<Message>>,
}

impl SideChannelObserver {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Only logs side messages.
    pub fn logging_only() -> Self {
        Self { tx: None }
    }
}

#[async_trait]
impl FrameProcessor for SideChannelObserver {
    fn name(&self) -> &str {
        "side_channel_observer"
    }

    async fn process_frame(
        &mut self,
        frame: Frame,
        downstream: &mut Downstream<'_>,
    ) -> Result<(), ProcessorError> {
        if let Frame::AgentMessage(message) = &frame {
            info!(
                role = %message.role,
                tool_call_id = ?message.tool_call_id,
                tool_calls = message.tool_calls.len(),
                "Agent message"
            );
            if let Some(tx) = &self.tx {
                if tx.send(message.clone()).await.is_err() {
                    warn!("Side channel receiver dropped; continuing with logging only.");
                    self.tx = None;
                }
            }
        }
        downstream.push(frame).await?;
        Ok(())
    }
}

/// Copies every frame into an unbounded channel before forwarding it.
/// Placed last, it is the output of the pipeline.
pub struct FrameTap {
    tx: mpsc::UnboundedSender<Frame>,
}

impl FrameTap {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl FrameProcessor for FrameTap {
    fn name(&self) -> &str {
        "frame_tap"
    }

    async fn process_frame(
        &mut self,
        frame: Frame,
        downstream: &mut Downstream<'_>,
    ) -> Result<(), ProcessorError> {
        if self.tx.send(frame.clone()).is_err() {
            debug!(kind = frame.kind(), "Frame tap receiver dropped");
        }
        downstream.push(frame).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineRunner;

    #[tokio::test]
    async fn test_side_messages_are_published_and_forwarded() {
        let (side_tx, mut side_rx) = mpsc::channel(8);
        let (tap, mut frames) = FrameTap::new();
        let (runner, _) = PipelineRunner::new(vec![
            Box::new(SideChannelObserver::new(side_tx)),
            Box::new(tap),
        ]);
        let tool_msg = Message::tool_result("call_1", "07");
        runner
            .run(vec![
                Frame::token("hi"),
                Frame::AgentMessage(tool_msg.clone()),
            ])
            .await
            .unwrap();

        assert_eq!(side_rx.recv().await, Some(tool_msg.clone()));
        assert_eq!(frames.recv().await, Some(Frame::token("hi")));
        assert_eq!(frames.recv().await, Some(Frame::AgentMessage(tool_msg)));
    }

    #[tokio::test]
    async fn test_dropped_side_receiver_does_not_fail_the_pipeline() {
        let (side_tx, side_rx) = mpsc::channel(1);
        drop(side_rx);
        let (tap, mut frames) = FrameTap::new();
        let (runner, _) = PipelineRunner::new(vec![
            Box::new(SideChannelObserver::new(side_tx)),
            Box::new(tap),
        ]);
        runner
            .run(vec![Frame::AgentMessage(Message::assistant("x"))])
            .await
            .unwrap();
        assert_eq!(
            frames.recv().await,
            Some(Frame::AgentMessage(Message::assistant("x")))
        );
    }
}
