//! Transcriber input: feeds `(text, is_final)` pairs into a pipeline.

use super::{PipelineError, PipelineHandle};
use crate::frame::Frame;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub text: String,
    pub is_final: bool,
}

impl Transcript {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn last(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }
}

/// Speech-to-text collaborator. Yields transcripts for one audio stream in
/// time order; `None` once the stream is over.
#[async_trait]
pub trait Transcriber: Send {
    async fn next_transcript(&mut self) -> Option<anyhow::Result<Transcript>>;
}

/// A transcriber fed from a channel, for transports that deliver text.
pub struct ChannelTranscriber {
    rx: mpsc::Receiver<Transcript>,
}

impl ChannelTranscriber {
    pub fn new(buffer: usize) -> (mpsc::Sender<Transcript>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }
}

#[async_trait]
impl Transcriber for ChannelTranscriber {
    async fn next_transcript(&mut self) -> Option<anyhow::Result<Transcript>> {
        self.rx.recv().await.map(Ok)
    }
}

/// Forwards every transcript as a `TranscriptChunk` until the transcriber
/// is exhausted. A failed transcript is logged and skipped.
pub async fn pump_transcripts<T: Transcriber + ?Sized>(
    transcriber: &mut T,
    handle: &PipelineHandle,
) -> Result<(), PipelineError> {
    while let Some(item) = transcriber.next_transcript().await {
        match item {
            Ok(Transcript { text, is_final }) => {
                handle.queue_frame(Frame::transcript(text, is_final)).await?;
            }
            Err(e) => warn!(error = ?e, "Transcriber failed, skipping"),
        }
    }
    debug!("Transcriber finished");
    Ok(())
}
