//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                                   ┌──► Client A (echo)
//!             ├── conn task ── Hub (mutex) ──────┼──► Client B
//! Client B ──┘    select!        │               └──► Client C
//!                 socket | rx    ├── CategoryStore
//!                                └── SessionRegistry (replay buffers)
//! ```
//!
//! Each connection task:
//! 1. Upgrades the socket, enforcing the origin policy and reading
//!    `?format=&session=&offset=` from the request.
//! 2. Attaches to the hub and writes the greeting (snapshot or replay).
//! 3. Loops over inbound intents and outbound broadcast events.
//! 4. On a clean close forgets the session; on a dropped socket detaches
//!    it so a reconnect inside the recovery window can resume.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{Attachment, Hub, Mutation};
use crate::config::{OriginPolicy, ServerConfig};
use crate::protocol::{BoardEvent, ClientMessage, ConnectParams, Frame, ServerMessage, WireFormat};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
}

/// Lock-free counters, read via `snapshot()`.
#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_handshakes: AtomicU64,
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
}

impl AtomicServerStats {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            rejected_handshakes: self.rejected_handshakes.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// How a connection loop ended.
enum Exit {
    /// Client sent a close frame
    Closed,
    /// Socket failed or vanished; events not yet written are carried over
    Dropped { in_flight: Vec<Arc<BoardEvent>> },
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    hub: Arc<Mutex<Hub>>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let hub = Arc::new(Mutex::new(Hub::new(&config)));
        Self {
            config,
            hub,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(&self.config.bind_addr).await
    }

    /// Bind and serve until the accept loop fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);
        let _sweeper = AbortOnDrop(self.spawn_sweeper());

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();
            let policy = self.config.origin_policy.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, stats, policy).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let hub = self.hub.clone();
        let period = (self.config.recovery_window / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                hub.lock().await.sweep(Instant::now());
            }
        })
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<Mutex<Hub>>,
        stats: Arc<AtomicServerStats>,
        policy: OriginPolicy,
    ) -> Result<(), BoxError> {
        let mut params = ConnectParams::default();
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            check_origin(request, &policy)?;
            params = ConnectParams::from_query(request.uri().query());
            Ok(response)
        };
        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                stats.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let format = params.format;

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let Attachment {
            session,
            greeting,
            resumed,
            mut receiver,
        } = hub.lock().await.attach(params.resume, Instant::now());
        log::info!(
            "WebSocket connection from {addr}: session {session} ({}, {})",
            if resumed { "resumed" } else { "fresh" },
            format.as_str()
        );

        let mut delivered = params.resume.map_or(0, |t| t.offset);
        let mut exit = None;

        let mut greeting = greeting.into_iter();
        while let Some(msg) = greeting.next() {
            let seq = match &msg {
                ServerMessage::InitialState { seq, .. } => Some(*seq),
                ServerMessage::NumberUpdate(a) => Some(a.seq),
                ServerMessage::NumberDeleted(r) => Some(r.seq),
                ServerMessage::SessionResumed { .. } => None,
            };
            if let Err(e) = send_message(&mut ws_sender, &msg, format).await {
                log::warn!("Greeting to session {session} failed: {e}");
                let in_flight = std::iter::once(msg)
                    .chain(greeting)
                    .filter_map(ServerMessage::into_event)
                    .map(Arc::new)
                    .collect();
                exit = Some(Exit::Dropped { in_flight });
                break;
            }
            if let Some(seq) = seq {
                delivered = seq;
            }
        }

        let exit = match exit {
            Some(exit) => exit,
            None => loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                stats.frames_received.fetch_add(1, Ordering::Relaxed);
                                stats.bytes_received.fetch_add(data.len() as u64, Ordering::Relaxed);
                                handle_intent(&hub, session, ClientMessage::decode_binary(&data)).await;
                            }
                            Some(Ok(Message::Text(text))) => {
                                stats.frames_received.fetch_add(1, Ordering::Relaxed);
                                stats.bytes_received.fetch_add(text.len() as u64, Ordering::Relaxed);
                                handle_intent(&hub, session, ClientMessage::decode_text(text.as_str())).await;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                if ws_sender.send(Message::Pong(data)).await.is_err() {
                                    break Exit::Dropped { in_flight: Vec::new() };
                                }
                            }
                            Some(Ok(Message::Close(_))) => {
                                log::info!("Connection closed from {addr}");
                                break Exit::Closed;
                            }
                            None => {
                                log::info!("Connection from {addr} ended without close");
                                break Exit::Dropped { in_flight: Vec::new() };
                            }
                            Some(Err(e)) => {
                                log::warn!("WebSocket error from {addr}: {e}");
                                break Exit::Dropped { in_flight: Vec::new() };
                            }
                            _ => {}
                        }
                    }

                    event = receiver.recv() => {
                        match event {
                            Ok(event) => {
                                if event.seq() <= delivered {
                                    continue;
                                }
                                if let Err(e) = send_message(&mut ws_sender, &event.to_message(), format).await {
                                    log::warn!("Send to session {session} failed: {e}");
                                    break Exit::Dropped { in_flight: vec![event] };
                                }
                                delivered = event.seq();
                            }
                            Err(RecvError::Lagged(n)) => {
                                log::warn!("Session {session} lagged by {n} events, resyncing");
                                let snapshot = hub.lock().await.initial_state(session);
                                let seq = match &snapshot {
                                    ServerMessage::InitialState { seq, .. } => *seq,
                                    _ => delivered,
                                };
                                if send_message(&mut ws_sender, &snapshot, format).await.is_err() {
                                    break Exit::Dropped { in_flight: Vec::new() };
                                }
                                delivered = seq;
                            }
                            Err(RecvError::Closed) => break Exit::Dropped { in_flight: Vec::new() },
                        }
                    }
                }
            },
        };

        match exit {
            Exit::Closed => hub.lock().await.close(session),
            Exit::Dropped { in_flight } => {
                hub.lock()
                    .await
                    .detach(session, receiver, in_flight, delivered, Instant::now());
            }
        }
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        self.stats.snapshot()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Shared handle to the hub.
    pub fn hub(&self) -> Arc<Mutex<Hub>> {
        self.hub.clone()
    }
}

fn check_origin(request: &Request, policy: &OriginPolicy) -> Result<(), ErrorResponse> {
    let Some(origin) = request.headers().get(header::ORIGIN) else {
        // Non-browser clients send no Origin.
        return Ok(());
    };
    let origin = origin.to_str().unwrap_or("");
    if policy.allows(origin) {
        return Ok(());
    }
    log::warn!("Rejected WebSocket upgrade from origin {origin:?}");
    let mut response = ErrorResponse::new(Some(format!("origin {origin} not allowed")));
    *response.status_mut() = StatusCode::FORBIDDEN;
    Err(response)
}

async fn send_message(
    sink: &mut WsSink,
    msg: &ServerMessage,
    format: WireFormat,
) -> Result<(), BoxError> {
    let frame = match msg.encode(format)? {
        Frame::Binary(bytes) => Message::Binary(bytes.into()),
        Frame::Text(text) => Message::Text(text.into()),
    };
    sink.send(frame).await?;
    Ok(())
}

async fn handle_intent(
    hub: &Mutex<Hub>,
    session: Uuid,
    decoded: Result<ClientMessage, crate::protocol::ProtocolError>,
) {
    let msg = match decoded {
        Ok(msg) => msg,
        Err(e) => {
            log::warn!("Dropped undecodable frame from session {session}: {e}");
            return;
        }
    };

    if let ClientMessage::RepeatMessage { text } = &msg {
        log::info!("Repeat from session {session}: {text}");
        return;
    }

    let Some(mutation) = Mutation::from_message(msg) else {
        return;
    };
    log::debug!("Session {session} requested {mutation:?}");
    match hub.lock().await.apply(mutation) {
        Ok(event) => log::info!("Broadcasting seq {} ({})", event.seq(), event.category()),
        Err(e) => log::warn!("Dropped intent from session {session}: {e}"),
    }
}
