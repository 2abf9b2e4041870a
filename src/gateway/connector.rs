//! The gateway connector.
//!
//! Owns the single persistent WebSocket connection to the tabletop module.
//! The connector is a listener: the module connects in, and exactly one peer
//! is authoritative at a time. A newly connecting peer supersedes the old
//! one; queries still pending against the superseded peer are rejected, never
//! left hanging.
//!
//! State machine: `Stopped → Starting → Listening → Connected → Listening`
//! on peer disconnect, back to `Stopped` on [`Connector::stop`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{Result, ScryError};
use crate::gateway::message::{self, Envelope};

/// Connector lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Stopped,
    Starting,
    /// Listening, no peer attached.
    Listening,
    /// One authoritative peer attached.
    Connected,
}

/// Handler for unsolicited inbound messages (job events and the like).
pub trait EventHandler: Send + Sync {
    fn on_event(&self, envelope: Envelope) -> BoxFuture<'_, ()>;
}

type Pending = HashMap<String, oneshot::Sender<Result<Value>>>;

struct Inner {
    query_timeout: Duration,
    state: Mutex<GatewayState>,
    pending: Mutex<Pending>,
    /// Write half of the current peer; `None` while no peer is attached.
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    handler: Mutex<Option<Arc<dyn EventHandler>>>,
    next_id: AtomicU64,
    /// Peer generation counter; a reader only cleans up if it is still the
    /// current generation.
    epoch: AtomicU64,
}

/// Owns the gateway listener and the one peer connection.
pub struct Connector {
    inner: Arc<Inner>,
    bound_addr: Mutex<Option<std::net::SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    peer_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Connector {
    pub fn new(query_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                query_timeout,
                state: Mutex::new(GatewayState::Stopped),
                pending: Mutex::new(HashMap::new()),
                outbound: Mutex::new(None),
                handler: Mutex::new(None),
                next_id: AtomicU64::new(1),
                epoch: AtomicU64::new(0),
            }),
            bound_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
            peer_task: Arc::new(Mutex::new(None)),
        }
    }

    /// Register the handler for unsolicited inbound messages. Replaces any
    /// previous handler.
    pub fn set_event_handler(&self, handler: Arc<dyn EventHandler>) {
        *self.inner.handler.lock().unwrap() = Some(handler);
    }

    /// Bind the listener and start accepting peers.
    ///
    /// Binding failure is a startup error (the port is a fixed, well-known
    /// address the tabletop module connects to).
    pub async fn start(&self, addr: &str) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state != GatewayState::Stopped {
                return Ok(());
            }
            *state = GatewayState::Starting;
        }

        let listener = TcpListener::bind(addr).await.map_err(|e| {
            ScryError::Startup(format!("Failed to bind gateway listener on {addr}: {e}"))
        })?;
        let bound = listener.local_addr()?;
        *self.bound_addr.lock().unwrap() = Some(bound);
        *self.inner.state.lock().unwrap() = GatewayState::Listening;
        tracing::info!(addr = %bound, "Gateway listening");

        let inner = Arc::clone(&self.inner);
        let peer_task = Arc::clone(&self.peer_task);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        tracing::info!(peer = %peer_addr, "Gateway peer connecting");
                        attach_peer(&inner, &peer_task, stream).await;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Gateway accept error");
                    }
                }
            }
        });
        *self.accept_task.lock().unwrap() = Some(task);
        Ok(())
    }

    /// Stop listening, drop the peer, and reject everything pending.
    pub async fn stop(&self) {
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(task) = self.peer_task.lock().unwrap().take() {
            task.abort();
        }
        self.inner.outbound.lock().unwrap().take();
        reject_all(&self.inner, |_| ScryError::GatewayClosed);
        *self.inner.state.lock().unwrap() = GatewayState::Stopped;
        *self.bound_addr.lock().unwrap() = None;
        tracing::info!("Gateway stopped");
    }

    /// Address the listener actually bound (useful when configured with
    /// port 0 in tests).
    pub fn bound_addr(&self) -> Option<std::net::SocketAddr> {
        *self.bound_addr.lock().unwrap()
    }

    pub fn state(&self) -> GatewayState {
        *self.inner.state.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == GatewayState::Connected
    }

    /// Correlated request/response against the attached peer.
    ///
    /// Assigns a monotonically increasing id, registers a pending entry, and
    /// waits for the matching `mcp-response` up to the configured timeout.
    /// Timeouts, peer loss, and peer replacement all settle the entry; a
    /// query is never left hanging.
    pub async fn query(&self, method: &str, data: Value) -> Result<Value> {
        let sender = self
            .inner
            .outbound
            .lock()
            .unwrap()
            .clone()
            .ok_or(ScryError::GatewayNotConnected)?;

        let id = format!("q{}", self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().unwrap().insert(id.clone(), tx);

        let envelope = Envelope::query(&id, method, data);
        if sender.send(Message::Text(envelope.to_json())).is_err() {
            self.inner.pending.lock().unwrap().remove(&id);
            return Err(ScryError::GatewayNotConnected);
        }

        match tokio::time::timeout(self.inner.query_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ScryError::GatewayClosed),
            Err(_) => {
                self.inner.pending.lock().unwrap().remove(&id);
                Err(ScryError::GatewayTimeout(self.inner.query_timeout))
            }
        }
    }

    /// Fire-and-forget send to the attached peer.
    pub fn send_message(&self, envelope: &Envelope) -> Result<()> {
        let sender = self
            .inner
            .outbound
            .lock()
            .unwrap()
            .clone()
            .ok_or(ScryError::GatewayNotConnected)?;
        sender
            .send(Message::Text(envelope.to_json()))
            .map_err(|_| ScryError::GatewayNotConnected)
    }
}

/// Settle every pending query with an error produced per id.
fn reject_all(inner: &Inner, error: impl Fn(&str) -> ScryError) {
    let drained: Pending = std::mem::take(&mut *inner.pending.lock().unwrap());
    let count = drained.len();
    for (id, tx) in drained {
        let _ = tx.send(Err(error(&id)));
    }
    if count > 0 {
        tracing::warn!(count, "Rejected pending gateway queries");
    }
}

/// Make an accepted TCP stream the authoritative peer, superseding any
/// previous one.
async fn attach_peer(
    inner: &Arc<Inner>,
    peer_task: &Arc<Mutex<Option<JoinHandle<()>>>>,
    stream: TcpStream,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!(error = %e, "WebSocket handshake failed");
            return;
        }
    };

    // Supersede the previous peer: cancel its task and fail its queries.
    if let Some(old) = peer_task.lock().unwrap().take() {
        old.abort();
    }
    reject_all(inner, |_| ScryError::GatewaySuperseded);

    let epoch = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    *inner.outbound.lock().unwrap() = Some(out_tx);
    *inner.state.lock().unwrap() = GatewayState::Connected;
    tracing::info!(epoch, "Gateway peer attached");

    let inner = Arc::clone(inner);
    let task = tokio::spawn(async move {
        let (mut sink, mut source) = ws.split();

        loop {
            tokio::select! {
                outgoing = out_rx.recv() => {
                    match outgoing {
                        Some(message) => {
                            if let Err(e) = sink.send(message).await {
                                tracing::warn!(error = %e, "Gateway send failed");
                                break;
                            }
                        }
                        None => break,
                    }
                }
                incoming = source.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => handle_text(&inner, &text).await,
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(?frame, "Gateway peer closed connection");
                            break;
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                            // Transport-level keepalive handled by tungstenite.
                        }
                        Some(Ok(_)) => {
                            // Binary / raw frames are not part of the protocol.
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "Gateway receive error");
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        // Only clean up if we are still the current peer; a superseding
        // peer has already taken over the shared slots.
        if inner.epoch.load(Ordering::SeqCst) == epoch {
            inner.outbound.lock().unwrap().take();
            reject_all(&inner, |_| ScryError::GatewayClosed);
            let mut state = inner.state.lock().unwrap();
            if *state == GatewayState::Connected {
                *state = GatewayState::Listening;
            }
            tracing::info!(epoch, "Gateway peer detached");
        }
    });
    *peer_task.lock().unwrap() = Some(task);
}

/// Route one inbound text frame.
async fn handle_text(inner: &Arc<Inner>, text: &str) {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(error = %e, "Dropping malformed gateway frame");
            return;
        }
    };

    match envelope.kind.as_str() {
        message::TYPE_RESPONSE => {
            let waiter = inner.pending.lock().unwrap().remove(&envelope.id);
            match waiter {
                Some(tx) => {
                    let result = match envelope.response_data() {
                        Some(data) if data.success => Ok(data.data),
                        Some(data) => Err(ScryError::Gateway(
                            data.error.unwrap_or_else(|| "query failed".to_string()),
                        )),
                        None => Err(ScryError::Gateway("malformed response payload".to_string())),
                    };
                    let _ = tx.send(result);
                }
                None => {
                    tracing::debug!(id = %envelope.id, "Response with no pending query");
                }
            }
        }
        message::TYPE_PING => {
            let pong = Envelope::pong(envelope.id);
            if let Some(sender) = inner.outbound.lock().unwrap().clone() {
                let _ = sender.send(Message::Text(pong.to_json()));
            }
        }
        message::TYPE_PONG => {}
        _ => {
            let handler = inner.handler.lock().unwrap().clone();
            match handler {
                Some(handler) => handler.on_event(envelope).await,
                None => {
                    tracing::debug!(kind = %envelope.kind, "Dropping unhandled gateway message");
                }
            }
        }
    }
}
