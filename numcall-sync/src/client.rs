//! WebSocket client transport for a call station.
//!
//! Provides:
//! - Connection lifecycle (connect with an optional resume token, disconnect)
//! - Intent send, decoded server messages delivered as [`SyncEvent`]s
//! - Offline queue for intents issued while disconnected
//!
//! Reader and writer run as background tasks that are aborted when the
//! client is dropped. The writer hands back every intent it could not
//! write; those go to the front of the offline queue for the next
//! connection.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientMessage, ConnectParams, Frame, ProtocolError, ResumeToken, ServerMessage, WireFormat};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the transport.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// A decoded server message
    Message(ServerMessage),
    /// Connection lost
    Disconnected,
}

/// Intents issued while disconnected, flushed in order on reconnect.
pub struct OfflineQueue {
    queue: VecDeque<ClientMessage>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an intent; false when full.
    pub fn enqueue(&mut self, msg: ClientMessage) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(msg);
        true
    }

    /// Put intents back ahead of everything queued, keeping their order.
    pub fn requeue_front(&mut self, msgs: Vec<ClientMessage>) {
        for msg in msgs.into_iter().rev() {
            self.queue.push_front(msg);
        }
    }

    pub fn drain(&mut self) -> Vec<ClientMessage> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// What the writer task is fed.
enum Outgoing {
    Intent { frame: Message, intent: ClientMessage },
    Close,
}

/// Write `Outgoing`s until the channel closes; returns intents not written.
async fn write_loop<W>(mut ws_writer: W, mut out_rx: mpsc::Receiver<Outgoing>) -> Vec<ClientMessage>
where
    W: Sink<Message> + Unpin,
{
    let mut unsent = Vec::new();
    while let Some(out) = out_rx.recv().await {
        match out {
            Outgoing::Intent { intent, .. } if !unsent.is_empty() => unsent.push(intent),
            Outgoing::Intent { frame, intent } => {
                if ws_writer.send(frame).await.is_err() {
                    log::debug!("Write failed, holding intents for the next connection");
                    unsent.push(intent);
                }
            }
            Outgoing::Close => {
                let _ = ws_writer.send(Message::Close(None)).await;
                break;
            }
        }
    }
    out_rx.close();
    while let Ok(out) = out_rx.try_recv() {
        if let Outgoing::Intent { intent, .. } = out {
            unsent.push(intent);
        }
    }
    unsent
}

/// The station's connection to the sync server.
pub struct SyncClient {
    server_url: String,
    format: WireFormat,
    connect_timeout: Duration,

    state: ConnectionState,
    offline_queue: OfflineQueue,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Outgoing>>,
    writer: Option<AbortOnDrop<Vec<ClientMessage>>>,
    reader: Option<AbortOnDrop<()>>,

    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl SyncClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            format: WireFormat::Binary,
            connect_timeout: Duration::from_secs(5),
            state: ConnectionState::Disconnected,
            offline_queue: OfflineQueue::new(10_000),
            outgoing_tx: None,
            writer: None,
            reader: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    pub fn with_format(mut self, format: WireFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Full connection URL for `resume`.
    pub fn url(&self, resume: Option<ResumeToken>) -> String {
        let params = ConnectParams {
            format: self.format,
            resume,
        };
        format!("{}/?{}", self.server_url.trim_end_matches('/'), params.to_query())
    }

    /// Connect, presenting `resume` if the previous session may be recoverable.
    ///
    /// Spawns the reader and writer tasks, then flushes the offline queue.
    pub async fn connect(&mut self, resume: Option<ResumeToken>) -> Result<(), ProtocolError> {
        self.reader = None;
        self.outgoing_tx = None;
        self.reclaim_unsent().await;
        self.state = match self.state {
            ConnectionState::Disconnected => ConnectionState::Connecting,
            _ => ConnectionState::Reconnecting,
        };

        let url = self.url(resume);
        let ws_stream = match tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(e)) => {
                self.state = ConnectionState::Disconnected;
                return Err(ProtocolError::HandshakeFailed(e.to_string()));
            }
            Err(_) => {
                self.state = ConnectionState::Disconnected;
                return Err(ProtocolError::Timeout);
            }
        };
        log::info!("Connected to {url}");

        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, out_rx) = mpsc::channel::<Outgoing>(256);
        let writer = tokio::spawn(write_loop(ws_writer, out_rx));

        let event_tx = self.event_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let decoded = match msg {
                    Ok(Message::Binary(data)) => ServerMessage::decode_binary(&data),
                    Ok(Message::Text(text)) => ServerMessage::decode_text(text.as_str()),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        log::warn!("WebSocket error: {e}");
                        break;
                    }
                };
                match decoded {
                    Ok(server_msg) => {
                        if event_tx.send(SyncEvent::Message(server_msg)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => log::warn!("Dropping undecodable server frame: {e}"),
                }
            }
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        self.writer = Some(AbortOnDrop(writer));
        self.reader = Some(AbortOnDrop(reader));
        self.outgoing_tx = Some(out_tx);
        self.state = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        let queued = self.offline_queue.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued intents", queued.len());
            for msg in queued {
                self.send(msg).await?;
            }
        }
        Ok(())
    }

    /// Send an intent, or queue it while disconnected.
    pub async fn send(&mut self, msg: ClientMessage) -> Result<(), ProtocolError> {
        let Some(tx) = self.outgoing_tx.as_ref().filter(|_| self.is_connected()) else {
            return self.enqueue(msg);
        };
        let frame = match msg.encode(self.format)? {
            Frame::Binary(bytes) => Message::Binary(bytes.into()),
            Frame::Text(text) => Message::Text(text.into()),
        };
        // The reader reports the loss; until then just hold on to the intent.
        if let Err(mpsc::error::SendError(out)) = tx.send(Outgoing::Intent { frame, intent: msg }).await {
            log::debug!("Writer gone, queueing intent");
            if let Outgoing::Intent { intent, .. } = out {
                return self.enqueue(intent);
            }
        }
        Ok(())
    }

    /// Wait for the previous writer to wind down and requeue what it could
    /// not write.
    async fn reclaim_unsent(&mut self) {
        let Some(mut writer) = self.writer.take() else {
            return;
        };
        match tokio::time::timeout(Duration::from_millis(500), &mut writer.0).await {
            Ok(Ok(unsent)) if !unsent.is_empty() => {
                log::info!("Requeueing {} unsent intents", unsent.len());
                self.offline_queue.requeue_front(unsent);
            }
            Ok(_) => {}
            Err(_) => log::warn!("Previous writer did not finish; its pending intents are lost"),
        }
    }

    fn enqueue(&mut self, msg: ClientMessage) -> Result<(), ProtocolError> {
        if self.offline_queue.enqueue(msg) {
            Ok(())
        } else {
            Err(ProtocolError::ConnectionClosed)
        }
    }

    /// Record that the connection is gone.
    ///
    /// The writer keeps running until it has drained its channel; the next
    /// `connect` collects whatever it could not write.
    pub fn mark_disconnected(&mut self) {
        self.outgoing_tx = None;
        self.reader = None;
        self.state = ConnectionState::Reconnecting;
    }

    /// Send a close frame and tear the connection down.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Outgoing::Close).await;
        }
        self.reclaim_unsent().await;
        self.reader = None;
        self.state = ConnectionState::Disconnected;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    pub fn offline_queue_len(&self) -> usize {
        self.offline_queue.len()
    }
}
