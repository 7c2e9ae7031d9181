//! Per-connection task: upgrade, receive loop, writer task and teardown.
//!
//! One task owns the socket's read half and the frame decoder and
//! dispatches frames in arrival order. A second task owns the write half and
//! drains two queues: control frames produced by this connection (pong,
//! ping, close) first, then envelopes queued by the router.

use crate::connection::{CloseRequest, ConnectionHandle, ConnectionQueues, Lifecycle, RoomKey};
use crate::control::{handle_control, ControlAction};
use crate::health;
use crate::server::ServerContext;
use crate::upgrade::{self, classify, read_request_head, Route};
use bytes::Bytes;
use sigrelay_core::codec::build_close_frame;
use sigrelay_core::{build_frame, CloseCode, Envelope, Frame, FrameDecoder, Opcode, RelayError, RelayResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Control frames waiting for the writer; beyond this the peer is not reading.
const CONTROL_QUEUE: usize = 32;

const READ_CHUNK: usize = 8 * 1024;

/// Work for the writer task, ahead of the outbound queue.
enum WriterCommand {
    Frame(Vec<u8>),
    /// Write this close frame and stop.
    Close(Vec<u8>),
}

/// Whether the receive loop keeps going after a step.
enum Flow {
    Continue,
    Finish,
}

/// Serve one accepted TCP connection from the first request byte to teardown.
pub async fn handle_connection(mut stream: TcpStream, remote: SocketAddr, ctx: Arc<ServerContext>) {
    let config = &ctx.config;

    let read = time::timeout(
        config.handshake_timeout,
        read_request_head(&mut stream, config.max_header_bytes),
    )
    .await
    .unwrap_or(Err(RelayError::Timeout));
    let (head, leftover) = match read {
        Ok(parsed) => parsed,
        Err(RelayError::ConnectionClosed) => {
            debug!(remote = %remote, "peer closed before sending a request");
            return;
        }
        Err(RelayError::Timeout) => {
            debug!(remote = %remote, "handshake timed out");
            return;
        }
        Err(e) => {
            warn!(remote = %remote, error = %e, "bad request head");
            respond(&mut stream, &upgrade::error_response(e.http_status(), &e.to_string())).await;
            return;
        }
    };

    let request = match classify(&head) {
        Route::Health(path) => {
            let report = health::report(&ctx.registry, path).await;
            let response = match serde_json::to_string(&report) {
                Ok(body) => upgrade::http_response(200, "application/json", &body),
                Err(e) => upgrade::error_response(500, &e.to_string()),
            };
            respond(&mut stream, &response).await;
            return;
        }
        Route::Reject { status, reason } => {
            debug!(remote = %remote, method = %head.method, target = %head.target, status, "request rejected");
            respond(&mut stream, &upgrade::error_response(status, reason)).await;
            return;
        }
        Route::Upgrade(Err(e)) => {
            warn!(remote = %remote, target = %head.target, error = %e, "upgrade rejected");
            respond(&mut stream, &upgrade::error_response(e.http_status(), &e.to_string())).await;
            return;
        }
        Route::Upgrade(Ok(request)) => request,
    };

    if ctx.is_shutting_down() {
        respond(&mut stream, &upgrade::error_response(503, "server shutting down")).await;
        return;
    }
    if !ctx.limiter.lock().await.check_and_record(remote.ip()) {
        let e = RelayError::RateLimited(format!("too many upgrade attempts from {}", remote.ip()));
        warn!(remote = %remote, "upgrade rate limited");
        respond(&mut stream, &upgrade::error_response(e.http_status(), &e.to_string())).await;
        return;
    }

    if let Err(e) = stream
        .write_all(upgrade::switching_protocols(&request.client_key).as_bytes())
        .await
    {
        debug!(remote = %remote, error = %e, "failed to complete handshake");
        return;
    }

    let room = RoomKey::new(request.channel, request.room_id);
    let (handle, queues) = ConnectionHandle::new(
        ctx.next_connection_id(),
        room,
        request.participant_id,
        remote,
        config.outbound_queue,
    );
    handle.advance(Lifecycle::Open);

    let greeting = Envelope::connection_established(
        &handle.room().room_id,
        handle.participant_id(),
        handle.room().channel.as_str(),
    );
    match greeting.to_json() {
        Ok(json) => {
            if let Err(e) = handle.try_send(Bytes::from(build_frame(Opcode::Text, json.as_bytes()))) {
                warn!(connection = handle.id(), error = %e, "failed to queue greeting");
            }
        }
        Err(e) => warn!(connection = handle.id(), error = %e, "failed to encode greeting"),
    }

    ctx.registry.join(handle.clone()).await;
    info!(
        connection = handle.id(),
        room = %handle.room(),
        participant = %handle.participant_id(),
        remote = %remote,
        "connection opened"
    );
    if ctx.is_shutting_down() {
        handle.close(CloseCode::GoingAway, "server shutting down");
    }

    let (reader, writer) = stream.into_split();
    Session::start(handle.clone(), queues, reader, writer, leftover, ctx.clone())
        .run()
        .await;

    if handle.release() {
        ctx.registry.leave(&handle).await;
    }
    info!(
        connection = handle.id(),
        room = %handle.room(),
        participant = %handle.participant_id(),
        "connection closed"
    );
}

/// Write a plain HTTP response and close the socket.
async fn respond(stream: &mut TcpStream, response: &str) {
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        debug!(error = %e, "failed to write HTTP response");
        return;
    }
    let _ = stream.shutdown().await;
}

/// The open phase of one connection.
struct Session {
    handle: ConnectionHandle,
    ctx: Arc<ServerContext>,
    reader: OwnedReadHalf,
    decoder: FrameDecoder,
    control: mpsc::Sender<WriterCommand>,
    close_rx: watch::Receiver<Option<CloseRequest>>,
    writer: JoinHandle<RelayResult<()>>,
    writer_done: bool,
    pong_deadline: Option<Instant>,
    close_deadline: Option<Instant>,
}

impl Session {
    fn start(
        handle: ConnectionHandle,
        queues: ConnectionQueues,
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        leftover: Vec<u8>,
        ctx: Arc<ServerContext>,
    ) -> Self {
        let (control, control_rx) = mpsc::channel(CONTROL_QUEUE);
        let writer = tokio::spawn(write_loop(writer, control_rx, queues.outbound));

        let mut decoder = FrameDecoder::server(ctx.config.max_payload);
        decoder.feed(&leftover);

        Self {
            handle,
            ctx,
            reader,
            decoder,
            control,
            close_rx: queues.close,
            writer,
            writer_done: false,
            pong_deadline: None,
            close_deadline: None,
        }
    }

    async fn run(mut self) {
        let ping_interval = self.ctx.config.ping_interval;
        let mut ping_timer = time::interval_at(Instant::now() + ping_interval, ping_interval);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; READ_CHUNK];

        'receive: loop {
            // Dispatch everything already buffered before reading more.
            loop {
                match self.decoder.next_frame() {
                    Ok(Some(frame)) => {
                        if let Flow::Finish = self.on_frame(frame).await {
                            break 'receive;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.fail(e);
                        break 'receive;
                    }
                }
            }

            let pong_deadline = self.pong_deadline;
            let close_deadline = self.close_deadline;
            tokio::select! {
                read = self.reader.read(&mut buf) => match read {
                    Ok(0) => {
                        if self.handle.lifecycle() == Lifecycle::Open {
                            warn!(connection = self.handle.id(), "peer disconnected without a close frame");
                        }
                        break;
                    }
                    Ok(n) => self.decoder.feed(&buf[..n]),
                    Err(e) => {
                        warn!(connection = self.handle.id(), error = %e, "socket read failed");
                        break;
                    }
                },
                changed = self.close_rx.changed(), if close_deadline.is_none() => {
                    if changed.is_err() {
                        break;
                    }
                    let request = self.close_rx.borrow_and_update().clone();
                    if let Some(request) = request {
                        self.begin_close(request.code, &request.reason);
                    }
                }
                _ = ping_timer.tick(), if close_deadline.is_none() && pong_deadline.is_none() => {
                    trace!(connection = self.handle.id(), "keepalive ping");
                    if self.send_control(WriterCommand::Frame(build_frame(Opcode::Ping, b""))).is_err() {
                        break;
                    }
                    self.pong_deadline = Some(Instant::now() + self.ctx.config.pong_timeout);
                }
                _ = time::sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                    warn!(connection = self.handle.id(), "no pong within timeout, dropping idle connection");
                    break;
                }
                _ = time::sleep_until(close_deadline.unwrap_or_else(Instant::now)), if close_deadline.is_some() => {
                    debug!(connection = self.handle.id(), "peer did not answer close, dropping");
                    break;
                }
                result = &mut self.writer, if !self.writer_done => {
                    self.writer_done = true;
                    if self.handle.lifecycle() == Lifecycle::Open {
                        match result {
                            Ok(Err(e)) => warn!(connection = self.handle.id(), error = %e, "socket write failed"),
                            Err(e) => warn!(connection = self.handle.id(), error = %e, "writer task failed"),
                            Ok(Ok(())) => {}
                        }
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    async fn on_frame(&mut self, frame: Frame) -> Flow {
        match frame.opcode {
            Opcode::Text => {
                if !frame.fin {
                    self.fail(RelayError::UnsupportedData("fragmented messages are not supported".into()));
                    return Flow::Finish;
                }
                if !self.handle.is_open() {
                    trace!(connection = self.handle.id(), "text frame ignored while closing");
                    return Flow::Continue;
                }
                self.route(&frame.payload).await;
                Flow::Continue
            }
            Opcode::Binary => {
                self.fail(RelayError::UnsupportedData("binary frames are not supported".into()));
                Flow::Finish
            }
            Opcode::Continuation => {
                self.fail(RelayError::UnsupportedData("unexpected continuation frame".into()));
                Flow::Finish
            }
            Opcode::Ping | Opcode::Pong | Opcode::Close => match handle_control(&frame) {
                Ok(ControlAction::Pong(pong)) => {
                    trace!(connection = self.handle.id(), "ping answered");
                    match self.send_control(WriterCommand::Frame(pong)) {
                        Ok(()) => Flow::Continue,
                        Err(_) => Flow::Finish,
                    }
                }
                Ok(ControlAction::PongReceived) => {
                    trace!(connection = self.handle.id(), "pong received");
                    self.pong_deadline = None;
                    Flow::Continue
                }
                Ok(ControlAction::Close { code, reason, ack }) => {
                    let previous = self.handle.advance(Lifecycle::Closing);
                    if previous == Lifecycle::Open {
                        debug!(connection = self.handle.id(), code = %code, reason = %reason, "peer closed");
                        let _ = self.send_control(WriterCommand::Close(ack));
                    } else {
                        debug!(connection = self.handle.id(), code = %code, "close acknowledged by peer");
                    }
                    Flow::Finish
                }
                Err(e) => {
                    self.fail(e);
                    Flow::Finish
                }
            },
        }
    }

    async fn route(&self, payload: &[u8]) {
        let Ok(text) = std::str::from_utf8(payload) else {
            warn!(connection = self.handle.id(), "text frame is not valid UTF-8, dropped");
            return;
        };
        match self.ctx.router.route_text(&self.handle, text).await {
            Ok(_) => {}
            Err(RelayError::RoomNotFound(room)) => {
                debug!(connection = self.handle.id(), room = %room, "room gone, message dropped");
            }
            Err(e @ RelayError::EnvelopeDecode(_)) => {
                warn!(connection = self.handle.id(), error = %e, "malformed envelope dropped");
            }
            Err(e) => {
                warn!(connection = self.handle.id(), error = %e, "failed to route envelope");
            }
        }
    }

    /// Server-initiated close: send the close frame and wait for the reply.
    fn begin_close(&mut self, code: CloseCode, reason: &str) {
        if self.handle.advance(Lifecycle::Closing) != Lifecycle::Open {
            return;
        }
        debug!(connection = self.handle.id(), code = %code, reason, "closing connection");
        let _ = self.send_control(WriterCommand::Close(build_close_frame(code, reason)));
        self.close_deadline = Some(Instant::now() + self.ctx.config.close_timeout);
    }

    /// Close after a protocol violation without waiting for a reply.
    fn fail(&mut self, error: RelayError) {
        let code = error.close_code();
        warn!(
            connection = self.handle.id(),
            participant = %self.handle.participant_id(),
            code = %code,
            error = %error,
            "closing connection on protocol error"
        );
        if self.handle.advance(Lifecycle::Closing) == Lifecycle::Open {
            let _ = self.send_control(WriterCommand::Close(build_close_frame(code, &error.to_string())));
        }
    }

    fn send_control(&self, command: WriterCommand) -> RelayResult<()> {
        self.control.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                warn!(connection = self.handle.id(), "control queue full, peer is not reading");
                RelayError::Backpressure(self.handle.id())
            }
            mpsc::error::TrySendError::Closed(_) => RelayError::ConnectionClosed,
        })
    }

    /// Stop the writer once it has flushed any queued close frame.
    async fn shutdown(self) {
        self.handle.advance(Lifecycle::Closed);
        let Session {
            control,
            mut writer,
            writer_done,
            ctx,
            ..
        } = self;
        drop(control);
        if writer_done {
            return;
        }
        if time::timeout(ctx.config.close_timeout, &mut writer).await.is_err() {
            writer.abort();
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut control: mpsc::Receiver<WriterCommand>,
    mut outbound: mpsc::Receiver<Bytes>,
) -> RelayResult<()> {
    loop {
        tokio::select! {
            biased;
            command = control.recv() => match command {
                Some(WriterCommand::Frame(bytes)) => writer.write_all(&bytes).await?,
                Some(WriterCommand::Close(bytes)) => {
                    writer.write_all(&bytes).await?;
                    return Ok(());
                }
                None => return Ok(()),
            },
            frame = outbound.recv() => match frame {
                Some(bytes) => writer.write_all(&bytes).await?,
                None => return Ok(()),
            },
        }
    }
}
