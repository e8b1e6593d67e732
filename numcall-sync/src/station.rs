//! Call station runtime: transport, mirror and announcer in one task.
//!
//! ```text
//!  StationHandle ──commands──┐
//!  SyncClient ────events─────┼──► select! ──► Reconciler ──► Speaker
//!  Announcer ─────ticks──────┤        │
//!  backoff timer ────────────┘        └──► SyncClient::send (or offline queue)
//! ```
//!
//! Everything runs on the station task, so the mirror needs no locking.
//! Dropping every handle (or calling [`StationHandle::shutdown`]) ends the
//! loop, which closes the socket and drops the timer.

use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::announcer::{self, Announcer};
use crate::category::Category;
use crate::client::{ConnectionState, SyncClient, SyncEvent};
use crate::config::{ConfigError, StationConfig};
use crate::protocol::{ClientMessage, ProtocolError};
use crate::reconciler::{LinkState, ReconcileError, Reconciler};
use crate::speech::Speaker;

/// Station errors.
#[derive(Debug)]
pub enum StationError {
    Config(ConfigError),
    Reconcile(ReconcileError),
    Protocol(ProtocolError),
    /// The station task has stopped
    Closed,
}

impl fmt::Display for StationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "{e}"),
            Self::Reconcile(e) => write!(f, "{e}"),
            Self::Protocol(e) => write!(f, "{e}"),
            Self::Closed => write!(f, "Station stopped"),
        }
    }
}

impl std::error::Error for StationError {}

impl From<ConfigError> for StationError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<ReconcileError> for StationError {
    fn from(e: ReconcileError) -> Self {
        Self::Reconcile(e)
    }
}

impl From<ProtocolError> for StationError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Add {
        category: Category,
        value: String,
        reply: Reply<Result<(), StationError>>,
    },
    Delete {
        category: Category,
        position: usize,
        reply: Reply<Result<(), StationError>>,
    },
    SetMuted(bool),
    SetInterval {
        minutes: u32,
        reply: Reply<Result<(), StationError>>,
    },
    View(Reply<StationView>),
    Shutdown,
}

/// Point-in-time view of a station.
#[derive(Debug, Clone, PartialEq)]
pub struct StationView {
    pub columns: Vec<(Category, Vec<String>)>,
    /// Own adds not yet confirmed
    pub pending: usize,
    pub muted: bool,
    pub connection: ConnectionState,
    pub link: LinkState,
    pub repeat_every: Duration,
}

impl StationView {
    pub fn values(&self, category: Category) -> Vec<&str> {
        self.columns
            .iter()
            .find(|(c, _)| *c == category)
            .map(|(_, values)| values.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn summary(&self) -> Option<String> {
        let columns: Vec<(Category, Vec<&str>)> = self
            .columns
            .iter()
            .map(|(c, values)| (*c, values.iter().map(String::as_str).collect()))
            .collect();
        announcer::compose_summary(&columns)
    }
}

/// Cloneable handle to a running station.
#[derive(Clone)]
pub struct StationHandle {
    tx: mpsc::Sender<Command>,
}

impl StationHandle {
    /// Add `value` under `category`. Invalid input is rejected locally.
    pub async fn add(&self, category: Category, value: impl Into<String>) -> Result<(), StationError> {
        let value = value.into();
        self.request(|reply| Command::Add {
            category,
            value,
            reply,
        })
        .await?
    }

    /// Delete the entry at `position` of the station's own list.
    pub async fn delete(&self, category: Category, position: usize) -> Result<(), StationError> {
        self.request(|reply| Command::Delete {
            category,
            position,
            reply,
        })
        .await?
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), StationError> {
        self.tx
            .send(Command::SetMuted(muted))
            .await
            .map_err(|_| StationError::Closed)
    }

    /// Change the announcement interval; restarts the schedule.
    pub async fn set_interval(&self, minutes: u32) -> Result<(), StationError> {
        self.request(|reply| Command::SetInterval { minutes, reply })
            .await?
    }

    pub async fn view(&self) -> Result<StationView, StationError> {
        self.request(Command::View).await
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, StationError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| StationError::Closed)?;
        rx.await.map_err(|_| StationError::Closed)
    }
}

/// A client station.
pub struct CallStation<S> {
    config: StationConfig,
    client: SyncClient,
    events: mpsc::Receiver<SyncEvent>,
    commands: mpsc::Receiver<Command>,
    mirror: Reconciler,
    announcer: Announcer,
    speaker: S,
    backoff: Duration,
    reconnect_at: Option<Instant>,
}

impl<S: Speaker + 'static> CallStation<S> {
    /// Build a station. Must be called inside a tokio runtime.
    pub fn new(config: StationConfig, speaker: S) -> Result<(Self, StationHandle), StationError> {
        let mut client = SyncClient::new(config.server_url.clone())
            .with_connect_timeout(config.connect_timeout);
        let events = client.take_event_rx().ok_or(StationError::Closed)?;
        let announcer = Announcer::new(config.repeat_minutes)?;
        let mut mirror = Reconciler::new(config.delete_by);
        mirror.set_muted(config.muted);

        let (tx, commands) = mpsc::channel(64);
        let station = Self {
            backoff: config.reconnect_initial,
            config,
            client,
            events,
            commands,
            mirror,
            announcer,
            speaker,
            reconnect_at: None,
        };
        Ok((station, StationHandle { tx }))
    }

    /// Override the announcement period with an arbitrary duration.
    pub fn with_announce_period(mut self, period: Duration) -> Self {
        self.announcer.restart(period);
        self
    }

    /// Build and spawn a station.
    pub fn spawn(config: StationConfig, speaker: S) -> Result<(StationHandle, JoinHandle<()>), StationError> {
        let (station, handle) = Self::new(config, speaker)?;
        Ok((handle, tokio::spawn(station.run())))
    }

    /// Run until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        log::info!("Station starting against {}", self.config.server_url);
        self.try_connect().await;

        loop {
            let reconnect_at = self.reconnect_at;
            let reconnect = async move {
                match reconnect_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Shutdown) => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                Some(event) = self.events.recv() => self.handle_event(event).await,
                _ = self.announcer.tick() => self.announce().await,
                _ = reconnect => {
                    self.reconnect_at = None;
                    self.try_connect().await;
                }
            }
        }

        self.client.disconnect().await;
        log::info!("Station stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Add {
                category,
                value,
                reply,
            } => {
                let result = match self.mirror.add(category, &value, &mut self.speaker) {
                    Ok(intent) => {
                        self.send(intent).await;
                        Ok(())
                    }
                    Err(e) => {
                        log::warn!("Rejected {category} input {value:?}: {e}");
                        Err(e.into())
                    }
                };
                let _ = reply.send(result);
            }
            Command::Delete {
                category,
                position,
                reply,
            } => {
                let result = match self.mirror.delete_at(category, position) {
                    Ok(Some(intent)) => {
                        self.send(intent).await;
                        Ok(())
                    }
                    Ok(None) => {
                        log::debug!("Deleting unconfirmed {category} entry once confirmed");
                        Ok(())
                    }
                    Err(e) => {
                        log::warn!("{e}");
                        Err(e.into())
                    }
                };
                let _ = reply.send(result);
            }
            Command::SetMuted(muted) => {
                self.mirror.set_muted(muted);
                log::info!("Station {}", if muted { "muted" } else { "unmuted" });
            }
            Command::SetInterval { minutes, reply } => {
                let result = self.announcer.reconfigure(minutes).map_err(StationError::from);
                let _ = reply.send(result);
            }
            Command::View(reply) => {
                let _ = reply.send(self.view());
            }
            Command::Shutdown => {}
        }
    }

    async fn handle_event(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::Connected => {
                log::debug!("Transport connected");
            }
            SyncEvent::Message(msg) => {
                let follow_ups = self.mirror.apply(msg, &mut self.speaker);
                for intent in follow_ups {
                    self.send(intent).await;
                }
            }
            SyncEvent::Disconnected => {
                log::warn!("Connection to {} lost", self.config.server_url);
                self.mirror.connection_lost();
                self.client.mark_disconnected();
                self.schedule_reconnect();
            }
        }
    }

    async fn announce(&mut self) {
        let Some(msg) = self.announcer.fire(&self.mirror, &mut self.speaker) else {
            log::trace!("Nothing to announce");
            return;
        };
        if self.client.is_connected() {
            self.send(msg).await;
        } else {
            log::debug!("Offline, summary not sent");
        }
    }

    async fn try_connect(&mut self) {
        let resume = self.mirror.resume_token();
        match self.client.connect(resume).await {
            Ok(()) => self.backoff = self.config.reconnect_initial,
            Err(e) => {
                log::warn!("Connect to {} failed: {e}", self.config.server_url);
                self.mirror.connection_lost();
                self.schedule_reconnect();
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.backoff;
        self.backoff = (self.backoff * 2).min(self.config.reconnect_max);
        self.reconnect_at = Some(Instant::now() + delay);
        log::info!("Reconnecting in {delay:?}");
    }

    async fn send(&mut self, intent: ClientMessage) {
        if let Err(e) = self.client.send(intent).await {
            log::error!("Dropping intent: {e}");
        }
    }

    fn view(&self) -> StationView {
        StationView {
            columns: self
                .mirror
                .columns()
                .into_iter()
                .map(|(c, values)| (c, values.into_iter().map(str::to_string).collect()))
                .collect(),
            pending: self.mirror.pending_count(),
            muted: self.mirror.is_muted(),
            connection: self.client.connection_state(),
            link: self.mirror.link_state(),
            repeat_every: self.announcer.period(),
        }
    }
}
