//! Frame Pipeline
//!
//! A pipeline is an ordered chain of [`FrameProcessor`]s driven by a single
//! [`PipelineRunner`] per session. Frames queued through a [`PipelineHandle`]
//! are delivered strictly in FIFO order to the first processor. Each
//! processor forwards, transforms, consumes, or emits new frames through its
//! [`Downstream`], and every emitted frame is delivered through the rest of
//! the chain before the emitting call continues, so emission order is
//! preserved at every stage.
//!
//! Interruption does not wait for the queue: queueing an [`Frame::Interrupt`]
//! cancels the active turn's token immediately and the frame itself follows
//! in FIFO order.

pub mod aggregator;
pub mod guard;
pub mod input;
pub mod observer;
pub mod speech;

use crate::frame::Frame;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

/// Capacity of the inbound frame queue of one pipeline.
const INBOUND_QUEUE_SIZE: usize = 256;

/// Errors a processor may return from [`FrameProcessor::process_frame`].
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// Recoverable failure, isolated to the current turn.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
    /// The turn was interrupted. Not a failure.
    #[error("turn cancelled")]
    Cancelled,
    /// A frame contract was broken. Fatal to the session.
    #[error("contract violation: {0}")]
    ContractViolation(String),
    /// A fatal error raised further down the chain.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Errors surfaced to the owner of a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("processor '{processor}' violated the frame contract: {reason}")]
    ContractViolation { processor: String, reason: String },
    #[error("pipeline is no longer running")]
    Closed,
}

/// A stage of the pipeline.
#[async_trait]
pub trait FrameProcessor: Send {
    /// Name used in logs and error reports.
    fn name(&self) -> &str;

    /// Called once by the runner before any frame is delivered.
    fn setup(&mut self, _interruptions: &Interruptions) {}

    /// Handles one frame. Frames the processor does not consume must be
    /// pushed to `downstream`.
    async fn process_frame(
        &mut self,
        frame: Frame,
        downstream: &mut Downstream<'_>,
    ) -> Result<(), ProcessorError>;
}

/// Tracks the cancellation token of the turn currently being generated.
#[derive(Clone, Default)]
pub struct Interruptions {
    active: Arc<Mutex<Option<CancellationToken>>>,
}

impl Interruptions {
    /// Registers a new turn and returns its cancellation token.
    pub async fn begin_turn(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.active.lock().await = Some(token.clone());
        token
    }

    /// The token of the turn being generated, if any.
    pub async fn current(&self) -> Option<CancellationToken> {
        self.active.lock().await.clone()
    }

    /// Clears the active turn.
    pub async fn end_turn(&self) {
        self.active.lock().await.take();
    }

    /// Cancels the active turn, if any. Returns whether a turn was cancelled.
    pub async fn interrupt(&self) -> bool {
        match self.active.lock().await.take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

struct Stage {
    processor: Box<dyn FrameProcessor>,
    /// A `ResponseStart` left this stage without its `ResponseEnd`.
    response_open: bool,
    /// The runner closed a response on this stage's behalf after an error,
    /// so the stage's own late `ResponseEnd` must not be forwarded.
    closed_by_runner: bool,
}

/// The remainder of the chain as seen by one processor.
pub struct Downstream<'a> {
    response_open: &'a mut bool,
    closed_by_runner: &'a mut bool,
    rest: &'a mut [Stage],
}

impl Downstream<'_> {
    /// Delivers `frame` through every later stage before returning.
    pub async fn push(&mut self, frame: Frame) -> Result<(), PipelineError> {
        match &frame {
            Frame::ResponseStart => {
                *self.response_open = true;
                *self.closed_by_runner = false;
            }
            Frame::ResponseEnd if *self.closed_by_runner && !*self.response_open => {
                *self.closed_by_runner = false;
                trace!("Dropping ResponseEnd already emitted by the runner");
                return Ok(());
            }
            Frame::ResponseEnd => *self.response_open = false,
            _ => {}
        }
        deliver(self.rest, frame).await
    }
}

fn deliver(stages: &mut [Stage], frame: Frame) -> BoxFuture<'_, Result<(), PipelineError>> {
    async move {
        let Some((stage, rest)) = stages.split_first_mut() else {
            trace!(kind = frame.kind(), "Frame consumed at end of pipeline");
            return Ok(());
        };
        let Stage {
            processor,
            response_open,
            closed_by_runner,
        } = stage;
        let mut downstream = Downstream {
            response_open,
            closed_by_runner,
            rest,
        };

        match processor.process_frame(frame, &mut downstream).await {
            Ok(()) => Ok(()),
            Err(ProcessorError::Pipeline(err)) => Err(err),
            Err(ProcessorError::ContractViolation(reason)) => {
                error!(processor = processor.name(), %reason, "Frame contract violated");
                Err(PipelineError::ContractViolation {
                    processor: processor.name().to_string(),
                    reason,
                })
            }
            Err(err) => {
                if matches!(err, ProcessorError::Cancelled) {
                    debug!(processor = processor.name(), "Processing cancelled");
                } else {
                    error!(processor = processor.name(), error = ?err, "Processor failed, ending turn");
                }
                if *downstream.response_open {
                    downstream.push(Frame::ResponseEnd).await?;
                    *downstream.closed_by_runner = true;
                }
                Ok(())
            }
        }
    }
    .boxed()
}

/// Cloneable entry point for feeding frames into a running pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<Frame>,
    interruptions: Interruptions,
}

impl PipelineHandle {
    /// Queues a frame behind everything queued before it. An `Interrupt`
    /// additionally cancels the turn in flight right away.
    pub async fn queue_frame(&self, frame: Frame) -> Result<(), PipelineError> {
        if matches!(frame, Frame::Interrupt) && self.interruptions.interrupt().await {
            info!("Interrupt received, cancelling the active turn");
        }
        self.tx.send(frame).await.map_err(|_| PipelineError::Closed)
    }

    pub async fn queue_frames(
        &self,
        frames: impl IntoIterator<Item = Frame>,
    ) -> Result<(), PipelineError> {
        for frame in frames {
            self.queue_frame(frame).await?;
        }
        Ok(())
    }

    pub async fn interrupt(&self) -> Result<(), PipelineError> {
        self.queue_frame(Frame::Interrupt).await
    }

    /// Queues `ControlEnd`; the runner stops once it has been delivered.
    pub async fn end(&self) -> Result<(), PipelineError> {
        self.queue_frame(Frame::ControlEnd).await
    }
}

/// Drives one session's frames through its processors.
pub struct PipelineRunner {
    stages: Vec<Stage>,
    inbound: mpsc::Receiver<Frame>,
    interruptions: Interruptions,
}

impl PipelineRunner {
    /// Builds a runner from an ordered list of processors, returning the
    /// handle used to queue frames into it.
    pub fn new(processors: Vec<Box<dyn FrameProcessor>>) -> (Self, PipelineHandle) {
        let interruptions = Interruptions::default();
        let (tx, inbound) = mpsc::channel(INBOUND_QUEUE_SIZE);
        let stages = processors
            .into_iter()
            .map(|mut processor| {
                processor.setup(&interruptions);
                Stage {
                    processor,
                    response_open: false,
                    closed_by_runner: false,
                }
            })
            .collect();
        let handle = PipelineHandle {
            tx,
            interruptions: interruptions.clone(),
        };
        (
            Self {
                stages,
                inbound,
                interruptions,
            },
            handle,
        )
    }

    /// Delivers `initial_frames`, then every queued frame, until a
    /// `ControlEnd` has passed through the chain or all handles are dropped.
    ///
    /// Only contract violations are returned; every other processor failure
    /// is contained at the processor that raised it.
    pub async fn run(mut self, initial_frames: Vec<Frame>) -> Result<(), PipelineError> {
        let names: Vec<&str> = self.stages.iter().map(|s| s.processor.name()).collect();
        info!(processors = ?names, "Pipeline started");

        for frame in initial_frames {
            if self.dispatch(frame).await? {
                info!("Pipeline ended");
                return Ok(());
            }
        }
        while let Some(frame) = self.inbound.recv().await {
            if self.dispatch(frame).await? {
                info!("Pipeline ended");
                return Ok(());
            }
        }
        info!("All pipeline handles dropped, stopping");
        Ok(())
    }

    /// Returns `true` once the session has ended.
    async fn dispatch(&mut self, frame: Frame) -> Result<bool, PipelineError> {
        let is_end = matches!(frame, Frame::ControlEnd);
        if matches!(frame, Frame::Interrupt) {
            self.interruptions.interrupt().await;
        }
        trace!(kind = frame.kind(), "Dispatching frame");
        deliver(&mut self.stages, frame).await?;
        Ok(is_end)
    }
}

#[cfg(test)]
mod tests {
    use super::observer::FrameTap;
    use super::*;
    use anyhow::anyhow;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Emits each character of a `ResponseToken` as its own token.
    struct Splitter;

    #[async_trait]
    impl FrameProcessor for Splitter {
        fn name(&self) -> &str {
            "splitter"
        }

        async fn process_frame(
            &mut self,
            frame: Frame,
            downstream: &mut Downstream<'_>,
        ) -> Result<(), ProcessorError> {
            match frame {
                Frame::ResponseToken { text } => {
                    for c in text.chars() {
                        downstream.push(Frame::token(c.to_string())).await?;
                    }
                    Ok(())
                }
                other => Ok(downstream.push(other).await?),
            }
        }
    }

    /// Opens a response for a user message, then fails or violates the
    /// contract depending on the content.
    struct Faulty;

    #[async_trait]
    impl FrameProcessor for Faulty {
        fn name(&self) -> &str {
            "faulty"
        }

        async fn process_frame(
            &mut self,
            frame: Frame,
            downstream: &mut Downstream<'_>,
        ) -> Result<(), ProcessorError> {
            match frame {
                Frame::UserMessage { content, .. } if content == "fail" => {
                    downstream.push(Frame::ResponseStart).await?;
                    downstream.push(Frame::token("partial")).await?;
                    Err(anyhow!("model exploded").into())
                }
                Frame::UserMessage { content, .. } if content == "cancel" => {
                    downstream.push(Frame::ResponseStart).await?;
                    Err(ProcessorError::Cancelled)
                }
                Frame::UserMessage { content, .. } if content == "violate" => Err(
                    ProcessorError::ContractViolation("unexpected frame".into()),
                ),
                Frame::UserMessage { content, .. } => {
                    downstream.push(Frame::ResponseStart).await?;
                    downstream.push(Frame::token(content)).await?;
                    downstream.push(Frame::ResponseEnd).await?;
                    Ok(())
                }
                other => Ok(downstream.push(other).await?),
            }
        }
    }

    fn drain(rx: &mut UnboundedReceiver<Frame>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_emitted_frames_keep_order_downstream() {
        let (tap, mut rx) = FrameTap::new();
        let (runner, _) = PipelineRunner::new(vec![Box::new(Splitter), Box::new(tap)]);
        runner
            .run(vec![
                Frame::token("ab"),
                Frame::token("c"),
                Frame::ControlEnd,
            ])
            .await
            .unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![
                Frame::token("a"),
                Frame::token("b"),
                Frame::token("c"),
                Frame::ControlEnd,
            ]
        );
    }

    #[tokio::test]
    async fn test_queued_frames_are_fifo_after_initial_frames() {
        let (tap, mut rx) = FrameTap::new();
        let (runner, handle) = PipelineRunner::new(vec![Box::new(tap)]);
        handle.queue_frame(Frame::token("queued")).await.unwrap();
        handle.end().await.unwrap();
        runner.run(vec![Frame::ControlStart]).await.unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![Frame::ControlStart, Frame::token("queued"), Frame::ControlEnd]
        );
    }

    #[tokio::test]
    async fn test_processor_failure_becomes_response_end() {
        let (tap, mut rx) = FrameTap::new();
        let (runner, _) = PipelineRunner::new(vec![Box::new(Faulty), Box::new(tap)]);
        runner
            .run(vec![Frame::user("fail"), Frame::user("next"), Frame::ControlEnd])
            .await
            .unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![
                Frame::ResponseStart,
                Frame::token("partial"),
                Frame::ResponseEnd,
                Frame::ResponseStart,
                Frame::token("next"),
                Frame::ResponseEnd,
                Frame::ControlEnd,
            ]
        );
    }

    #[tokio::test]
    async fn test_cancellation_is_closed_without_failure() {
        let (tap, mut rx) = FrameTap::new();
        let (runner, _) = PipelineRunner::new(vec![Box::new(Faulty), Box::new(tap)]);
        runner
            .run(vec![Frame::user("cancel"), Frame::ControlEnd])
            .await
            .unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![Frame::ResponseStart, Frame::ResponseEnd, Frame::ControlEnd]
        );
    }

    #[tokio::test]
    async fn test_contract_violation_stops_the_session() {
        let (tap, mut rx) = FrameTap::new();
        let (runner, _) = PipelineRunner::new(vec![Box::new(Faulty), Box::new(tap)]);
        let err = runner
            .run(vec![Frame::user("violate"), Frame::user("never")])
            .await
            .unwrap_err();

        match err {
            PipelineError::ContractViolation { processor, .. } => assert_eq!(processor, "faulty"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_queue_after_runner_dropped_reports_closed() {
        let (runner, handle) = PipelineRunner::new(vec![]);
        drop(runner);
        assert!(matches!(
            handle.queue_frame(Frame::ControlStart).await,
            Err(PipelineError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_interrupt_cancels_active_turn_token() {
        let interruptions = Interruptions::default();
        assert!(!interruptions.interrupt().await);

        let token = interruptions.begin_turn().await;
        assert!(interruptions.interrupt().await);
        assert!(token.is_cancelled());

        let next = interruptions.begin_turn().await;
        interruptions.end_turn().await;
        assert!(!interruptions.interrupt().await);
        assert!(!next.is_cancelled());
    }
}
