//! Enforces the response framing contract: every turn is exactly one
//! `ResponseStart`, then tokens and side messages, then exactly one
//! `ResponseEnd`.

use super::{Downstream, FrameProcessor, ProcessorError};
use crate::frame::Frame;
use async_trait::async_trait;

#[derive(Debug, Default)]
pub struct ResponseSequenceGuard {
    in_response: bool,
}

impl ResponseSequenceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn check(&mut self, frame: &Frame) -> Result<(), String> {
        match frame {
            Frame::ResponseStart if self.in_response => {
                Err("ResponseStart while a response is already open".into())
            }
            Frame::ResponseStart => {
                self.in_response = true;
                Ok(())
            }
            Frame::ResponseEnd if !self.in_response => {
                Err("ResponseEnd without a matching ResponseStart".into())
            }
            Frame::ResponseEnd => {
                self.in_response = false;
                Ok(())
            }
            Frame::ResponseToken { .. } | Frame::AgentMessage(_) if !self.in_response => Err(
                format!("{} outside of a response", frame.kind()),
            ),
            Frame::UserMessage { .. } if self.in_response => {
                Err("UserMessage reached the output while a response is open".into())
            }
            Frame::ControlStart
            | Frame::ControlEnd
            | Frame::Interrupt
            | Frame::TranscriptChunk { .. }
            | Frame::UserMessage { .. }
            | Frame::ResponseToken { .. }
            | Frame::AgentMessage(_) => Ok(()),
        }
    }
}

#[async_trait]
impl FrameProcessor for ResponseSequenceGuard {
    fn name(&self) -> &str {
        "response_sequence_guard"
    }

    async fn process_frame(
        &mut self,
        frame: Frame,
        downstream: &mut Downstream<'_>,
    ) -> Result<(), ProcessorError> {
        self.check(&frame)
            .map_err(ProcessorError::ContractViolation)?;
        downstream.push(frame).await?;
        Ok(())
    }
}
