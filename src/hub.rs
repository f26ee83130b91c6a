//! Registry of live connections and fan-out of outbound events.
//!
//! Admission and eviction are serialized through one loop ([`Hub::run`]) so
//! presence writes and broadcasts for a user never interleave. Point sends
//! and lookups take the registry read lock directly. Every enqueue onto a
//! client buffer is a `try_send`: a full buffer drops that one frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, RwLock};
use uuid::Uuid;

use crate::messages::{OnlineUser, ServerMessage, UserStatus};
use crate::store::ChatStore;

pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

pub type ConnectionId = Uuid;

/// The hub's side of one connection. The registry holds the only sender, so
/// dropping the `Client` closes the connection's outbound buffer.
#[derive(Debug)]
pub struct Client {
    pub id: ConnectionId,
    pub user_id: String,
    pub username: String,
    sender: mpsc::Sender<String>,
}

impl Client {
    pub fn new(
        user_id: impl Into<String>,
        username: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<String>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let client = Client {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            username: username.into(),
            sender,
        };
        (client, receiver)
    }
}

enum HubCommand {
    Admit {
        client: Client,
        done: oneshot::Sender<()>,
    },
    Evict {
        user_id: String,
        connection_id: ConnectionId,
        done: oneshot::Sender<()>,
    },
    Broadcast {
        frame: String,
        exclude: Option<String>,
        done: oneshot::Sender<()>,
    },
}

#[derive(Clone, Default)]
struct Registry {
    clients: Arc<RwLock<HashMap<String, Client>>>,
    dropped: Arc<AtomicU64>,
}

impl Registry {
    fn offer(&self, client: &Client, frame: String) -> bool {
        match client.sender.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "Outbound buffer full for user {}, dropping frame ({} dropped so far)",
                    client.user_id, total
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Outbound buffer closed for user {}", client.user_id);
                false
            }
        }
    }

    async fn send_to(&self, user_id: &str, frame: String) -> bool {
        let clients = self.clients.read().await;
        match clients.get(user_id) {
            Some(client) => self.offer(client, frame),
            None => {
                debug!("User {} is not connected, skipping delivery", user_id);
                false
            }
        }
    }

    async fn broadcast(&self, frame: &str, exclude: Option<&str>) -> usize {
        let clients = self.clients.read().await;
        let mut delivered = 0;
        for (user_id, client) in clients.iter() {
            if Some(user_id.as_str()) == exclude {
                continue;
            }
            if self.offer(client, frame.to_string()) {
                delivered += 1;
            }
        }
        delivered
    }
}

fn encode(message: &ServerMessage) -> Option<String> {
    match message.encode() {
        Ok(frame) => Some(frame),
        Err(e) => {
            error!("Failed to encode outbound event: {}", e);
            None
        }
    }
}

pub struct Hub {
    registry: Registry,
    store: Arc<dyn ChatStore>,
    commands: mpsc::UnboundedReceiver<HubCommand>,
    force_refresh: bool,
}

/// Cloneable access to a running [`Hub`].
#[derive(Clone)]
pub struct HubHandle {
    registry: Registry,
    commands: mpsc::UnboundedSender<HubCommand>,
}

impl Hub {
    /// Builds a hub and its handle. Nothing is admitted until [`Hub::run`]
    /// is polled.
    pub fn new(store: Arc<dyn ChatStore>, force_refresh: bool) -> (Self, HubHandle) {
        let registry = Registry::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = Hub {
            registry: registry.clone(),
            store,
            commands: rx,
            force_refresh,
        };
        let handle = HubHandle {
            registry,
            commands: tx,
        };
        (hub, handle)
    }

    /// Processes admissions, evictions and broadcasts until every handle is dropped.
    pub async fn run(mut self) {
        info!("Hub started");
        while let Some(command) = self.commands.recv().await {
            match command {
                HubCommand::Admit { client, done } => {
                    self.admit(client).await;
                    let _ = done.send(());
                }
                HubCommand::Evict {
                    user_id,
                    connection_id,
                    done,
                } => {
                    self.evict(&user_id, connection_id).await;
                    let _ = done.send(());
                }
                HubCommand::Broadcast {
                    frame,
                    exclude,
                    done,
                } => {
                    let delivered = self.registry.broadcast(&frame, exclude.as_deref()).await;
                    debug!("Broadcast delivered to {} clients", delivered);
                    let _ = done.send(());
                }
            }
        }
        info!("Hub stopped");
    }

    async fn admit(&self, client: Client) {
        let user_id = client.user_id.clone();
        let username = client.username.clone();
        let connection_id = client.id;

        let previous = {
            let mut clients = self.registry.clients.write().await;
            clients.insert(user_id.clone(), client)
        };
        if let Some(previous) = previous {
            info!(
                "User {} reconnected, closing previous connection {}",
                user_id, previous.id
            );
        }

        if let Err(e) = self.store.set_presence(&user_id, true).await {
            warn!("Failed to persist online presence for {}: {}", user_id, e);
        }

        self.send_snapshot(&user_id).await;

        let status = ServerMessage::UserStatus(UserStatus {
            user_id: user_id.clone(),
            username: username.clone(),
            is_online: true,
        });
        if let Some(frame) = encode(&status) {
            let delivered = self.registry.broadcast(&frame, Some(&user_id)).await;
            debug!("Online status of {} sent to {} clients", username, delivered);
        }

        if self.force_refresh {
            let refresh = ServerMessage::ForceRefresh {
                timestamp: Utc::now(),
            };
            if let Some(frame) = encode(&refresh) {
                self.registry.broadcast(&frame, None).await;
            }
        }

        info!(
            "User {} ({}) connected on {}",
            username, user_id, connection_id
        );
    }

    /// Replays every other registered user as online to the newcomer.
    async fn send_snapshot(&self, user_id: &str) {
        let clients = self.registry.clients.read().await;
        let Some(newcomer) = clients.get(user_id) else {
            return;
        };

        for (other_id, other) in clients.iter() {
            if other_id == user_id {
                continue;
            }
            let status = ServerMessage::UserStatus(UserStatus {
                user_id: other_id.clone(),
                username: other.username.clone(),
                is_online: true,
            });
            if let Some(frame) = encode(&status) {
                self.registry.offer(newcomer, frame);
            }
        }
    }

    async fn evict(&self, user_id: &str, connection_id: ConnectionId) {
        let removed = {
            let mut clients = self.registry.clients.write().await;
            match clients.get(user_id) {
                Some(current) if current.id == connection_id => clients.remove(user_id),
                _ => None,
            }
        };

        let Some(client) = removed else {
            debug!(
                "Ignoring eviction of stale connection {} for user {}",
                connection_id, user_id
            );
            return;
        };
        let username = client.username.clone();
        drop(client);

        if let Err(e) = self.store.set_presence(user_id, false).await {
            warn!("Failed to persist offline presence for {}: {}", user_id, e);
        }

        let status = ServerMessage::UserStatus(UserStatus {
            user_id: user_id.to_string(),
            username: username.clone(),
            is_online: false,
        });
        if let Some(frame) = encode(&status) {
            self.registry.broadcast(&frame, Some(user_id)).await;
        }

        info!("User {} ({}) disconnected", username, user_id);
    }
}

impl HubHandle {
    async fn submit(&self, command: HubCommand, done: oneshot::Receiver<()>) {
        if self.commands.send(command).is_err() {
            warn!("Hub is not running, command discarded");
            return;
        }
        let _ = done.await;
    }

    /// Registers the client, replacing and closing any prior connection for
    /// the same user. Returns once presence and broadcasts are done.
    pub async fn admit(&self, client: Client) {
        let (done, wait) = oneshot::channel();
        self.submit(HubCommand::Admit { client, done }, wait).await;
    }

    /// Deregisters the user if `connection_id` is still their current connection.
    pub async fn evict(&self, user_id: &str, connection_id: ConnectionId) {
        let (done, wait) = oneshot::channel();
        let command = HubCommand::Evict {
            user_id: user_id.to_string(),
            connection_id,
            done,
        };
        self.submit(command, wait).await;
    }

    pub async fn broadcast(&self, message: &ServerMessage, exclude: Option<&str>) {
        let Some(frame) = encode(message) else {
            return;
        };
        let (done, wait) = oneshot::channel();
        let command = HubCommand::Broadcast {
            frame,
            exclude: exclude.map(str::to_string),
            done,
        };
        self.submit(command, wait).await;
    }

    /// Best-effort delivery. Returns whether the frame was queued.
    pub async fn send_to_user(&self, user_id: &str, message: &ServerMessage) -> bool {
        match encode(message) {
            Some(frame) => self.registry.send_to(user_id, frame).await,
            None => false,
        }
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.registry.clients.read().await.contains_key(user_id)
    }

    /// Every registered user, ordered by id.
    pub async fn online_users(&self) -> Vec<OnlineUser> {
        let clients = self.registry.clients.read().await;
        let mut users: Vec<OnlineUser> = clients
            .values()
            .map(|client| OnlineUser {
                user_id: client.user_id.clone(),
                username: client.username.clone(),
            })
            .collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    /// Frames dropped on full outbound buffers since start.
    pub fn dropped_frames(&self) -> u64 {
        self.registry.dropped.load(Ordering::Relaxed)
    }
}
