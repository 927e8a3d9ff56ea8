//! Speech output: hands response text to a [`Synthesizer`] sentence by
//! sentence.

use super::{Downstream, FrameProcessor, Interruptions, ProcessorError};
use crate::frame::Frame;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Text-to-speech collaborator. Audio rendering and transport are the
/// implementor's concern.
#[async_trait]
pub trait Synthesizer: Send {
    /// Speaks one chunk of response text.
    async fn speak(&mut self, text: &str) -> anyhow::Result<()>;

    /// Stops any audio still playing.
    async fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

const SENTENCE_BOUNDARIES: [char; 5] = ['.', '!', '?', ';', '\n'];

/// Forwards every frame unchanged and speaks `ResponseToken` text once a
/// sentence is complete. A synthesizer failure is logged and skipped; it
/// never ends the turn.
///
/// An interrupted turn's unfinished sentence is never spoken. The turn's
/// `ResponseEnd` reaches this stage before the queued `Interrupt` frame, so
/// the turn's cancellation token is checked instead.
pub struct SpeechOutput<S> {
    synthesizer: S,
    pending: String,
    interruptions: Interruptions,
    turn: Option<CancellationToken>,
}

impl<S: Synthesizer> SpeechOutput<S> {
    pub fn new(synthesizer: S) -> Self {
        Self {
            synthesizer,
            pending: String::new(),
            interruptions: Interruptions::default(),
            turn: None,
        }
    }

    fn turn_cancelled(&self) -> bool {
        self.turn.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    async fn discard(&mut self) {
        debug!(unspoken = %self.pending, "Interrupted, discarding unspoken text");
        self.pending.clear();
        if let Err(e) = self.synthesizer.stop().await {
            warn!(error = ?e, "Synthesizer failed to stop");
        }
    }

    /// Removes and returns the text up to and including the last sentence
    /// boundary, if there is one.
    fn take_complete_sentences(&mut self) -> Option<String> {
        let idx = self.pending.rfind(SENTENCE_BOUNDARIES)?;
        let boundary_len = self.pending[idx..].chars().next().map_or(1, char::len_utf8);
        let rest = self.pending.split_off(idx + boundary_len);
        Some(std::mem::replace(&mut self.pending, rest))
    }

    async fn speak(&mut self, text: String) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if let Err(e) = self.synthesizer.speak(text).await {
            warn!(error = ?e, "Synthesizer failed to speak text");
        }
    }
}

#[async_trait]
impl<S: Synthesizer> FrameProcessor for SpeechOutput<S> {
    fn name(&self) -> &str {
        "speech_output"
    }

    fn setup(&mut self, interruptions: &Interruptions) {
        self.interruptions = interruptions.clone();
    }

    async fn process_frame(
        &mut self,
        frame: Frame,
        downstream: &mut Downstream<'_>,
    ) -> Result<(), ProcessorError> {
        match &frame {
            Frame::ResponseStart => {
                self.turn = self.interruptions.current().await;
            }
            Frame::ResponseToken { text } => {
                self.pending.push_str(text);
                if self.turn_cancelled() {
                    self.discard().await;
                } else if let Some(sentences) = self.take_complete_sentences() {
                    self.speak(sentences).await;
                }
            }
            Frame::ResponseEnd => {
                if self.turn_cancelled() {
                    self.discard().await;
                } else {
                    let rest = std::mem::take(&mut self.pending);
                    self.speak(rest).await;
                }
                self.turn = None;
            }
            Frame::Interrupt => self.discard().await,
            Frame::ControlStart
            | Frame::ControlEnd
            | Frame::TranscriptChunk { .. }
            | Frame::UserMessage { .. }
            | Frame::AgentMessage(_) => {}
        }
        downstream.push(frame).await?;
        Ok(())
    }
}
