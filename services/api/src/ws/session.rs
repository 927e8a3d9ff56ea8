//! Manages the WebSocket connection lifecycle for one caller session.
//!
//! Every connection owns one pipeline:
//! transcripts → aggregator → relay → observer → guard → speech → client.

use super::{
    output::{ClientOutput, ClientSpeech},
    protocol::{ClientMessage, ServerMessage},
};
use crate::state::AppState;
use anyhow::{Context, Result, anyhow};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use nfz_voice_core::{
    frame::Frame,
    message::Role,
    pipeline::{
        FrameProcessor, PipelineRunner,
        aggregator::TurnAggregator,
        guard::ResponseSequenceGuard,
        input::{ChannelTranscriber, Transcript, pump_transcripts},
        observer::SideChannelObserver,
        speech::SpeechOutput,
    },
    relay::StreamingRelay,
    tools::CallerInfo,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info, instrument, warn};
use uuid::Uuid;

const OUTBOUND_BUFFER: usize = 128;
const TRANSCRIPT_BUFFER: usize = 64;

/// Queued as a system turn when a session starts so the assistant speaks first.
pub const GREETING: &str =
    "The caller has just connected. Greet them briefly, say who you are and ask how you can help.";

/// Spoken to a caller whose session is being closed for inactivity.
pub const IDLE_FAREWELL: &str =
    "I'm sorry, we are ending the call now. Please feel free to reach out again if you need assistance.";

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Main handler for an individual WebSocket connection.
///
/// Waits for the `init` handshake, then runs the session until the client
/// leaves, goes idle, or the pipeline stops.
#[instrument(name = "ws_session", skip_all, fields(session_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("New WebSocket connection. Awaiting initialization...");
    let (mut socket_tx, mut socket_rx) = socket.split();

    let init = tokio::time::timeout(
        state.config.session_idle_timeout,
        await_init(&mut socket_rx),
    )
    .await
    .unwrap_or_else(|_| Err(anyhow!("No `init` message before the idle timeout")));
    let caller = match init {
        Ok(Some(caller)) => caller,
        Ok(None) => {
            info!("Client disconnected before sending init message.");
            return;
        }
        Err(e) => {
            error!(error = ?e, "Session initialization failed");
            let _ = send_msg(
                &mut socket_tx,
                ServerMessage::Error {
                    message: e.to_string(),
                },
            )
            .await;
            return;
        }
    };

    let session_id = Uuid::new_v4();
    tracing::Span::current().record("session_id", &session_id.to_string());
    info!(has_caller_number = caller.phone_number.is_some(), "Session initialized");

    if send_msg(&mut socket_tx, ServerMessage::Initialized { session_id })
        .await
        .is_err()
    {
        error!("Failed to send Initialized message to client.");
        return;
    }

    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let writer = tokio::spawn(write_to_client(socket_tx, out_rx).in_current_span());

    let reason = run_session(&state, session_id, caller, socket_rx, out_tx).await;

    if let Err(e) = writer.await {
        error!(error = ?e, "Client writer task failed");
    }
    info!(reason, "WebSocket connection closed and session terminated.");
}

/// Reads the first client message, which must be `init`. `None` means the
/// client went away first.
async fn await_init(socket_rx: &mut SplitStream<WebSocket>) -> Result<Option<CallerInfo>> {
    let Some(first) = socket_rx.next().await else {
        return Ok(None);
    };
    match first.context("Failed to read the first client message")? {
        Message::Text(text) => {
            let msg: ClientMessage =
                serde_json::from_str(&text).context("Malformed `init` message")?;
            match msg {
                ClientMessage::Init { caller_number } => Ok(Some(CallerInfo {
                    phone_number: caller_number,
                })),
                _ => Err(anyhow!("First message must be `init`")),
            }
        }
        Message::Close(_) => Ok(None),
        _ => Err(anyhow!("First message was not a text `init` message.")),
    }
}

fn session_processors(
    state: &AppState,
    conversation_id: String,
    caller: CallerInfo,
    out_tx: &mpsc::Sender<ServerMessage>,
) -> Vec<Box<dyn FrameProcessor>> {
    vec![
        Box::new(TurnAggregator::new()),
        Box::new(StreamingRelay::new(state.agent.clone(), conversation_id, caller)),
        Box::new(SideChannelObserver::logging_only()),
        Box::new(ResponseSequenceGuard::new()),
        Box::new(SpeechOutput::new(ClientSpeech::new(out_tx.clone()))),
        Box::new(ClientOutput::new(out_tx.clone())),
    ]
}

/// The main event loop of an initialized session. Returns why it ended.
async fn run_session(
    state: &AppState,
    session_id: Uuid,
    caller: CallerInfo,
    mut socket_rx: SplitStream<WebSocket>,
    out_tx: mpsc::Sender<ServerMessage>,
) -> &'static str {
    let conversation_id = session_id.to_string();
    let (runner, handle) = PipelineRunner::new(session_processors(
        state,
        conversation_id.clone(),
        caller,
        &out_tx,
    ));
    let greeting = Frame::UserMessage {
        role: Role::System,
        content: GREETING.to_string(),
    };
    let mut runner =
        tokio::spawn(runner.run(vec![Frame::ControlStart, greeting]).in_current_span());

    let (transcript_tx, mut transcriber) = ChannelTranscriber::new(TRANSCRIPT_BUFFER);
    let pump_handle = handle.clone();
    let pump = tokio::spawn(
        async move { pump_transcripts(&mut transcriber, &pump_handle).await }.in_current_span(),
    );

    let idle = state.config.session_idle_timeout;
    let mut reason = "client_closed";
    let mut finished = None;
    loop {
        tokio::select! {
            result = &mut runner => {
                reason = "pipeline_stopped";
                finished = Some(result);
                break;
            }
            incoming = tokio::time::timeout(idle, socket_rx.next()) => {
                let msg = match incoming {
                    Err(_) => {
                        info!(idle_secs = idle.as_secs(), "Session idle, ending it.");
                        // Spoken as its own response so it follows the interrupt's speech stop.
                        let farewell = [
                            Frame::Interrupt,
                            Frame::ResponseStart,
                            Frame::token(IDLE_FAREWELL),
                            Frame::ResponseEnd,
                        ];
                        if handle.queue_frames(farewell).await.is_err() {
                            debug!("Pipeline already stopped");
                        }
                        reason = "idle";
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        warn!(error = ?e, "Error receiving from client WebSocket");
                        break;
                    }
                    Ok(Some(Ok(msg))) => msg,
                };
                match msg {
                    Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(ClientMessage::Transcript { text, is_final }) => {
                            if transcript_tx.send(Transcript { text, is_final }).await.is_err() {
                                warn!("Transcript input closed, dropping transcript");
                            }
                        }
                        Ok(ClientMessage::UserMessage { text }) => {
                            if transcript_tx.send(Transcript::last(text)).await.is_err() {
                                warn!("Transcript input closed, dropping message");
                            }
                        }
                        Ok(ClientMessage::Interrupt) => {
                            if handle.interrupt().await.is_err() {
                                debug!("Pipeline already stopped");
                            }
                        }
                        Ok(ClientMessage::End) => {
                            reason = "client_ended";
                            break;
                        }
                        Ok(ClientMessage::Init { .. }) => warn!("Ignoring repeated init message."),
                        Err(e) => warn!(error = %e, "Ignoring malformed client message."),
                    },
                    Message::Close(_) => {
                        info!("Client sent close frame. Shutting down session.");
                        break;
                    }
                    Message::Binary(_) => warn!("Ignoring binary message on a text-only session."),
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
        }
    }

    // Transcripts already accepted are delivered before the session ends.
    drop(transcript_tx);
    match pump.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "Transcript pump stopped early"),
        Err(e) => error!(error = ?e, "Transcript pump task failed"),
    }
    let result = match finished {
        Some(result) => result,
        None => {
            if handle.end().await.is_err() {
                debug!("Pipeline already stopped");
            }
            drop(handle);
            runner.await
        }
    };
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(error = %e, "Pipeline stopped with a fatal error");
            let _ = out_tx
                .send(ServerMessage::Error {
                    message: e.to_string(),
                })
                .await;
        }
        Err(e) => error!(error = ?e, "Pipeline task failed"),
    }

    // A pipeline that stopped before `ControlEnd` never released the memory.
    state.agent.end_conversation(&conversation_id).await;
    let _ = out_tx
        .send(ServerMessage::SessionEnded {
            reason: reason.to_string(),
        })
        .await;
    reason
}

/// Drains the outbound queue into the socket until every sender is gone or
/// the client stops accepting messages.
async fn write_to_client(
    mut socket_tx: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<ServerMessage>,
) {
    while let Some(msg) = out_rx.recv().await {
        if let Err(e) = send_msg(&mut socket_tx, msg).await {
            warn!(error = ?e, "Failed to send to client, dropping outbound messages");
            return;
        }
    }
    let _ = socket_tx.close().await;
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}
