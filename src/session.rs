//! Session State Machine (§4.3): one instance per accepted web socket
//! connection, driving it through `Handshaking -> AwaitingAuth -> Running ->
//! Closing`. `Init` is folded into construction — there is no reachable
//! state before a socket exists.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::codec::{
    decode_client_frame, initial_messages, ClientFrame, FrameAssembler, ServerFrame, JSON_DATA,
};
use crate::config::ServerConfig;
use crate::error::{CloseReason, PtyError, SessionError};
use crate::pty::{self, PtyChannel};
use crate::registry::{describe_peer, SessionRegistry};

/// `Init` and `Handshaking` (§4.3) have no runtime representation here:
/// `Init` is "a `Session` doesn't exist yet" and `Handshaking` is the
/// synchronous `send_handshake` call the caller makes before `drive` ever
/// starts its loop. Only the two states a live loop iteration can be in
/// are modeled.
enum Phase {
    AwaitingAuth,
    Running,
}

/// Drive one session end to end: handshake, auth, PTY bridging, teardown.
/// Never returns an error — every failure is resolved into a [`CloseReason`]
/// and logged, because by the time we're here the HTTP response has already
/// been upgraded and there is no one left to hand a `Result` to.
#[instrument(skip(socket, config, registry), fields(session_id = session_id, peer = %peer_addr))]
pub async fn run(
    socket: WebSocket,
    peer_addr: SocketAddr,
    config: Arc<ServerConfig>,
    registry: Arc<SessionRegistry>,
    session_id: u64,
) {
    let (mut sender, mut receiver) = socket.split();

    let (close_reason, pty) = match send_handshake(&mut sender, &config, peer_addr).await {
        Ok(()) => drive(&mut sender, &mut receiver, &config, session_id).await,
        Err(e) => {
            warn!(error = %e, "handshake failed");
            (e.close_reason(), None)
        }
    };

    if let Some(channel) = pty {
        channel.close().await;
    }
    registry.remove(session_id);
    send_close(&mut sender, close_reason).await;
    info!(reason = close_reason.reason_text(), "session closed");
}

async fn send_handshake(
    sender: &mut (impl futures_util::Sink<Message, Error = axum::Error> + Unpin),
    config: &ServerConfig,
    peer_addr: SocketAddr,
) -> Result<(), SessionError> {
    let (peer_address, peer_hostname) = describe_peer(peer_addr.ip());
    debug!(peer_address, peer_hostname, "peer identity recorded");
    let messages = initial_messages(config.command_name(), &config.hostname, config.reconnect, &config.prefs_json);
    for frame in &messages {
        send_frame(sender, frame).await?;
    }
    Ok(())
}

async fn send_frame(
    sender: &mut (impl futures_util::Sink<Message, Error = axum::Error> + Unpin),
    frame: &ServerFrame,
) -> Result<(), SessionError> {
    sender
        .send(Message::Binary(frame.encode().into()))
        .await
        .map_err(SessionError::HandshakeSendFailed)
}

/// Write a single `OUTPUT` frame once the session is `Running`. Kept
/// distinct from [`send_frame`] so a dropped socket mid-session reports as
/// [`SessionError::SocketWriteFailed`], not a misleading "handshake" error.
async fn send_output_frame(
    sender: &mut (impl futures_util::Sink<Message, Error = axum::Error> + Unpin),
    frame: &ServerFrame,
) -> Result<(), SessionError> {
    sender
        .send(Message::Binary(frame.encode().into()))
        .await
        .map_err(SessionError::SocketWriteFailed)
}

/// The main loop: after the handshake, wait for auth, then bridge PTY
/// output and client input concurrently until either side ends the
/// session.
async fn drive(
    sender: &mut (impl futures_util::Sink<Message, Error = axum::Error> + Unpin),
    receiver: &mut (impl futures_util::Stream<Item = Result<Message, axum::Error>> + Unpin),
    config: &ServerConfig,
    session_id: u64,
) -> (CloseReason, Option<PtyChannel>) {
    let mut phase = Phase::AwaitingAuth;
    let mut authenticated = config.credential.is_none();
    let mut window_size: Option<(u16, u16)> = None;
    let mut pty: Option<PtyChannel> = None;
    let mut pty_rx: Option<mpsc::Receiver<Result<Vec<u8>, PtyError>>> = None;
    let mut assembler = FrameAssembler::new();

    loop {
        tokio::select! {
            maybe_msg = receiver.next() => {
                match maybe_msg {
                    None => return (CloseReason::Normal, pty),
                    Some(Err(e)) => {
                        warn!(error = %e, "web socket read error");
                        return (CloseReason::UnexpectedCondition, pty);
                    }
                    Some(Ok(Message::Close(_))) => return (CloseReason::Normal, pty),
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Binary(data))) => {
                        assembler.accumulate(&data);
                        let complete = assembler.finish();
                        match handle_client_frame(
                            &complete,
                            &mut phase,
                            &mut authenticated,
                            &mut window_size,
                            &mut pty,
                            &mut pty_rx,
                            config,
                            session_id,
                        ).await {
                            Ok(()) => {}
                            Err(e) => {
                                warn!(session_id, error = %e, "session ending");
                                return (e.close_reason(), pty);
                            }
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        assembler.accumulate(text.as_bytes());
                        let complete = assembler.finish();
                        match handle_client_frame(
                            &complete,
                            &mut phase,
                            &mut authenticated,
                            &mut window_size,
                            &mut pty,
                            &mut pty_rx,
                            config,
                            session_id,
                        ).await {
                            Ok(()) => {}
                            Err(e) => {
                                warn!(session_id, error = %e, "session ending");
                                return (e.close_reason(), pty);
                            }
                        }
                    }
                }
            }
            chunk = recv_pty(&mut pty_rx) => {
                match chunk {
                    Some(Ok(bytes)) => {
                        if bytes.is_empty() {
                            continue;
                        }
                        let frame = ServerFrame::Output(bytes);
                        if let Err(e) = send_output_frame(sender, &frame).await {
                            warn!(session_id, error = %e, "failed to write OUTPUT frame to socket");
                            return (e.close_reason(), pty);
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "PTY read failed");
                        return (CloseReason::UnexpectedCondition, pty);
                    }
                    None => {
                        if matches!(phase, Phase::Running) {
                            debug!("PTY reached EOF, closing session");
                            return (CloseReason::Normal, pty);
                        }
                    }
                }
            }
        }
    }
}

/// Dispatch one fully reassembled logical frame according to the current
/// phase (§4.3). Returns `Err(reason)` when the session must end.
#[allow(clippy::too_many_arguments)]
async fn handle_client_frame(
    bytes: &[u8],
    phase: &mut Phase,
    authenticated: &mut bool,
    window_size: &mut Option<(u16, u16)>,
    pty: &mut Option<PtyChannel>,
    pty_rx: &mut Option<mpsc::Receiver<Result<Vec<u8>, PtyError>>>,
    config: &ServerConfig,
    session_id: u64,
) -> Result<(), SessionError> {
    let tag = bytes.first().copied();

    // A credential is required and this frame isn't the one frame allowed
    // to arrive before auth completes: refuse outright (matches the
    // original server's behaviour of closing on *any* non-JSON_DATA frame
    // while unauthenticated, not just a malformed auth attempt).
    if matches!(phase, Phase::AwaitingAuth) && config.credential.is_some() && tag != Some(JSON_DATA) {
        warn!(session_id, "frame received before authentication, closing");
        return Err(SessionError::AuthFailed);
    }

    let frame = match decode_client_frame(bytes) {
        Ok(frame) => frame,
        Err(e) => {
            if matches!(phase, Phase::AwaitingAuth) && tag == Some(JSON_DATA) {
                warn!(session_id, error = %e, "malformed JSON_DATA before authentication");
                return Err(SessionError::AuthFailed);
            }
            debug!(session_id, error = %e, "discarding unparseable frame");
            return Ok(());
        }
    };

    match phase {
        Phase::AwaitingAuth => match frame {
            ClientFrame::Input(_) => Ok(()),
            ClientFrame::Resize(resize) => {
                *window_size = Some((resize.rows, resize.columns));
                Ok(())
            }
            ClientFrame::JsonData(control) => {
                if let Some(expected) = &config.credential {
                    match control.auth_token {
                        Some(ref token) if token == expected => *authenticated = true,
                        _ => {
                            warn!(session_id, "authentication failed");
                            return Err(SessionError::AuthFailed);
                        }
                    }
                } else {
                    *authenticated = true;
                }

                match spawn_pty(config, *window_size).await {
                    Ok((channel, rx)) => {
                        *pty = Some(channel);
                        *pty_rx = Some(rx);
                        *phase = Phase::Running;
                        Ok(())
                    }
                    Err(e) => {
                        warn!(session_id, error = %e, "failed to spawn PTY");
                        Err(SessionError::SpawnFailed(e))
                    }
                }
            }
        },
        Phase::Running => match frame {
            ClientFrame::Input(data) => {
                if config.readonly {
                    return Ok(());
                }
                if let Some(channel) = pty.as_ref() {
                    if let Err(e) = channel.write(data).await {
                        warn!(session_id, error = %e, "PTY write failed");
                        return Err(SessionError::Pty(e));
                    }
                }
                Ok(())
            }
            ClientFrame::Resize(resize) => {
                *window_size = Some((resize.rows, resize.columns));
                if let Some(channel) = pty.as_ref() {
                    if let Err(e) = channel.resize(resize.rows, resize.columns) {
                        warn!(session_id, error = %e, "PTY resize failed");
                    }
                }
                Ok(())
            }
            ClientFrame::JsonData(_) => Ok(()),
        },
    }
}

async fn spawn_pty(
    config: &ServerConfig,
    window_size: Option<(u16, u16)>,
) -> Result<(PtyChannel, mpsc::Receiver<Result<Vec<u8>, PtyError>>), PtyError> {
    let argv = config.argv.clone();
    let sig_code = config.sig_code;
    tokio::task::spawn_blocking(move || pty::spawn(&argv, &[], window_size, sig_code))
        .await
        .expect("PTY spawn task panicked")
}

async fn recv_pty(
    rx: &mut Option<mpsc::Receiver<Result<Vec<u8>, PtyError>>>,
) -> Option<Result<Vec<u8>, PtyError>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn send_close(
    sender: &mut (impl futures_util::Sink<Message, Error = axum::Error> + Unpin),
    reason: CloseReason,
) {
    let frame = axum::extract::ws::CloseFrame {
        code: reason.code(),
        reason: reason.reason_text().into(),
    };
    let _ = sender.send(Message::Close(Some(frame))).await;
}
