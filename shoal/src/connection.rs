//! Per-server connection actor.
//!
//! Each server gets one task owning the socket. Callers submit requests
//! through a bounded channel and await a oneshot reply; the task writes
//! frames in submission order and matches every decoded response to the
//! oldest in-flight request. The wire carries no correlation ids, so this
//! strict FIFO discipline is the only thing keeping requests and
//! responses paired.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::auth::{ascii_probe, binary_handshake};
use crate::config::{Config, Dialect};
use crate::error::Error;
use crate::request::{Reply, Request, try_decode};

/// Observable connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Connecting or authenticating; submissions queue up.
    Connecting,
    /// Handshake complete, serving traffic.
    Ready,
    /// A full reconnect round failed. Still retrying in the background,
    /// but excluded from the ring until a connect succeeds.
    Down,
    /// The handshake failed with an authentication error. Terminal:
    /// retrying with the same credentials cannot help.
    AuthFailed,
    /// Shut down.
    Closed,
}

impl ConnState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnState::Ready)
    }

    /// States that permanently or durably exclude the shard from the ring.
    pub fn is_excluded(&self) -> bool {
        matches!(self, ConnState::Down | ConnState::AuthFailed | ConnState::Closed)
    }
}

pub(crate) struct Job {
    pub request: Request,
    pub reply: oneshot::Sender<Result<Reply, Error>>,
}

/// Caller-side handle to a connection actor. Cloning shares the actor.
#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    pub addr: SocketAddr,
    tx: mpsc::Sender<Job>,
    state: watch::Receiver<ConnState>,
}

impl ConnectionHandle {
    /// Spawn the actor for `addr` and return its handle. The actor
    /// connects lazily in the background and runs until every handle is
    /// dropped.
    pub fn spawn(addr: SocketAddr, config: Arc<Config>) -> Self {
        let (tx, rx) = mpsc::channel(config.max_inflight);
        let (state_tx, state_rx) = watch::channel(ConnState::Connecting);
        let actor = Connection {
            addr,
            config,
            rx,
            state: state_tx,
        };
        tokio::spawn(actor.run());
        Self {
            addr,
            tx,
            state: state_rx,
        }
    }

    pub fn state(&self) -> ConnState {
        *self.state.borrow()
    }

    /// Watch receiver for state changes, used by the router to rebuild
    /// the ring on readiness transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnState> {
        self.state.clone()
    }

    /// Submit a request, waiting for in-flight capacity, and await its
    /// resolution. Resolves exactly once: a reply, or a typed failure.
    pub async fn submit(&self, request: Request) -> Result<Reply, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Job {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Closed)?;
        reply_rx.await.map_err(|_| Error::ConnectionReset)?
    }

    /// Non-blocking submission. Refuses with [`Error::WouldBlock`] when
    /// the in-flight window is full instead of waiting.
    pub fn try_submit(
        &self,
        request: Request,
    ) -> Result<oneshot::Receiver<Result<Reply, Error>>, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .try_send(Job {
                request,
                reply: reply_tx,
            })
            .map_err(|err| match err {
                TrySendError::Full(_) => Error::WouldBlock,
                TrySendError::Closed(_) => Error::Closed,
            })?;
        Ok(reply_rx)
    }
}

enum ServeExit {
    /// All handles dropped and the pipeline drained.
    Closed,
    /// Transport or framing failure; reconnect.
    Reconnect,
}

struct Connection {
    addr: SocketAddr,
    config: Arc<Config>,
    rx: mpsc::Receiver<Job>,
    state: watch::Sender<ConnState>,
}

impl Connection {
    async fn run(mut self) {
        let mut failures = 0u32;
        loop {
            match self.establish().await {
                Ok(stream) => {
                    failures = 0;
                    debug!(addr = %self.addr, "connection ready");
                    self.set_state(ConnState::Ready);
                    match self.serve(stream).await {
                        ServeExit::Closed => break,
                        ServeExit::Reconnect => {
                            if self.drain_queued() {
                                break;
                            }
                            self.set_state(ConnState::Connecting);
                        }
                    }
                }
                Err(Error::Authentication(msg)) => {
                    warn!(addr = %self.addr, error = %msg, "authentication failed");
                    self.set_state(ConnState::AuthFailed);
                    self.drain_forever(msg).await;
                    break;
                }
                Err(err) => {
                    failures += 1;
                    warn!(
                        addr = %self.addr,
                        error = %err,
                        attempt = failures,
                        "connect failed"
                    );
                    if self.drain_queued() {
                        break;
                    }
                    // Once a round is exhausted the shard stays Down
                    // through the background retries; only a successful
                    // establish brings it back.
                    if failures >= self.config.reconnect.attempts_per_round {
                        self.set_state(ConnState::Down);
                    }
                    sleep(self.config.reconnect.delay(failures - 1)).await;
                }
            }
        }
        self.set_state(ConnState::Closed);
    }

    fn set_state(&self, state: ConnState) {
        let _ = self.state.send(state);
    }

    /// Connect and run the dialect's handshake, both under the connect
    /// timeout.
    async fn establish(&self) -> Result<TcpStream, Error> {
        let connect_timeout = self.config.connect_timeout;
        let mut stream = timeout(connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| Error::Timeout)??;
        stream.set_nodelay(true)?;

        let handshake = async {
            match self.config.dialect {
                Dialect::Binary => binary_handshake(&mut stream, &self.config.credentials).await,
                Dialect::Ascii => ascii_probe(&mut stream).await,
            }
        };
        timeout(connect_timeout, handshake)
            .await
            .map_err(|_| Error::Timeout)??;
        Ok(stream)
    }

    /// Serve the pipeline until the transport fails or all handles drop.
    async fn serve(&mut self, mut stream: TcpStream) -> ServeExit {
        let mut inflight: VecDeque<Job> = VecDeque::new();
        let mut read_buf = BytesMut::with_capacity(16 * 1024);
        let mut frame = Vec::new();
        let mut accepting = true;

        let window = self.config.max_inflight;
        loop {
            let can_accept = accepting && inflight.len() < window;
            tokio::select! {
                job = self.rx.recv(), if can_accept => {
                    match job {
                        Some(job) => {
                            frame.clear();
                            if let Err(err) = job.request.encode(&mut frame) {
                                // Nothing hit the wire; the pipeline is
                                // untouched and the connection stays up.
                                let _ = job.reply.send(Err(err));
                                continue;
                            }
                            if let Err(err) = stream.write_all(&frame).await {
                                warn!(addr = %self.addr, error = %err, "write failed");
                                let _ = job.reply.send(Err(Error::Io(err)));
                                fail_inflight(&mut inflight);
                                return ServeExit::Reconnect;
                            }
                            inflight.push_back(job);
                        }
                        None => {
                            // All handles dropped. Finish what is in
                            // flight, then close.
                            accepting = false;
                            if inflight.is_empty() {
                                return ServeExit::Closed;
                            }
                        }
                    }
                }
                read = stream.read_buf(&mut read_buf) => {
                    match read {
                        Ok(0) => {
                            debug!(addr = %self.addr, "server closed connection");
                            fail_inflight(&mut inflight);
                            return if accepting { ServeExit::Reconnect } else { ServeExit::Closed };
                        }
                        Ok(_) => {
                            match self.dispatch(&mut read_buf, &mut inflight) {
                                Ok(()) => {
                                    if !accepting && inflight.is_empty() {
                                        return ServeExit::Closed;
                                    }
                                }
                                Err(()) => return ServeExit::Reconnect,
                            }
                        }
                        Err(err) => {
                            warn!(addr = %self.addr, error = %err, "read failed");
                            fail_inflight(&mut inflight);
                            return ServeExit::Reconnect;
                        }
                    }
                }
            }
        }
    }

    /// Decode buffered frames and resolve in-flight requests in FIFO
    /// order. `Err(())` means the conversation desynchronized and the
    /// connection must be torn down.
    fn dispatch(&self, buf: &mut BytesMut, inflight: &mut VecDeque<Job>) -> Result<(), ()> {
        loop {
            let (decoded, used) = match try_decode(self.config.dialect, buf) {
                Ok(frame) => frame,
                Err(err) if err.is_incomplete() => return Ok(()),
                Err(err) => {
                    warn!(addr = %self.addr, error = %err, "framing error");
                    fail_inflight(inflight);
                    return Err(());
                }
            };
            buf.advance(used);

            let Some(job) = inflight.pop_front() else {
                warn!(addr = %self.addr, "unsolicited response frame");
                return Err(());
            };
            match job.request.interpret(decoded) {
                Ok(reply) => {
                    let _ = job.reply.send(Ok(reply));
                }
                Err(err @ Error::Protocol(_)) => {
                    // The head request could not attribute the frame; the
                    // rest of the pipeline can no longer be trusted.
                    let _ = job.reply.send(Err(err));
                    fail_inflight(inflight);
                    return Err(());
                }
                Err(err) => {
                    // Request-scoped failure (e.g. authentication demanded
                    // mid-stream). The framing is still synchronized.
                    let _ = job.reply.send(Err(err));
                }
            }
        }
    }

    /// Fail everything queued in the channel right now. Returns true when
    /// every handle is gone and the actor should stop.
    fn drain_queued(&mut self) -> bool {
        loop {
            match self.rx.try_recv() {
                Ok(job) => {
                    let _ = job.reply.send(Err(Error::ConnectionReset));
                }
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Disconnected) => return true,
            }
        }
    }

    /// Terminal authentication failure: every current and future
    /// submission resolves with the same error until the client drops
    /// the handle.
    async fn drain_forever(&mut self, msg: String) {
        while let Some(job) = self.rx.recv().await {
            let _ = job.reply.send(Err(Error::Authentication(msg.clone())));
        }
    }
}

fn fail_inflight(inflight: &mut VecDeque<Job>) {
    for job in inflight.drain(..) {
        let _ = job.reply.send(Err(Error::ConnectionReset));
    }
}
