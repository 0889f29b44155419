//! The connection hub.
//!
//! The hub is the single owner of the live client set. It runs as one
//! sequential loop fed by a command channel; registration, deregistration
//! and broadcast fan-out are processed one at a time in arrival order, so
//! the set needs no lock.
//!
//! Each registered client contributes the producer side of its bounded
//! outbound queue. Removing a client drops that producer, which closes the
//! queue and tells the client's writer pump to finish.

use std::collections::HashMap;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::client::ClientId;
use crate::metrics;

/// Producer side of a client's outbound queue.
pub type Outbound = mpsc::Sender<Bytes>;

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The hub loop is no longer running.
    #[error("Hub is closed")]
    Closed,
}

/// Events processed by the hub loop.
#[derive(Debug)]
pub enum Command {
    /// Add a client to the live set.
    Register { id: ClientId, queue: Outbound },
    /// Remove a client from the live set, closing its queue.
    Unregister(ClientId),
    /// Fan a payload out to every live client.
    Broadcast(Bytes),
    /// Report statistics.
    Stats(oneshot::Sender<HubStats>),
}

/// Receiving end of the hub's command channel.
pub type HubCommands = mpsc::Receiver<Command>;

/// Create the hub command channel.
///
/// The returned handle is cloned into every reader pump; the receiver is
/// handed to [`Hub::run`].
///
/// # Panics
///
/// Panics if `capacity` is zero.
#[must_use]
pub fn channel(capacity: usize) -> (HubHandle, HubCommands) {
    let (tx, rx) = mpsc::channel(capacity);
    (HubHandle { tx }, rx)
}

/// Message-passing front door to the hub loop.
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<Command>,
}

impl HubHandle {
    /// Register a client with its outbound queue.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub loop has stopped.
    pub async fn register(&self, id: ClientId, queue: Outbound) -> Result<(), HubError> {
        self.send(Command::Register { id, queue }).await
    }

    /// Unregister a client. Unknown clients are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub loop has stopped.
    pub async fn unregister(&self, id: ClientId) -> Result<(), HubError> {
        self.send(Command::Unregister(id)).await
    }

    /// Broadcast a payload to every registered client.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub loop has stopped.
    pub async fn broadcast(&self, payload: Bytes) -> Result<(), HubError> {
        self.send(Command::Broadcast(payload)).await
    }

    /// Ask the hub loop for its statistics.
    ///
    /// The answer reflects every command sent through this handle before
    /// the call.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub loop has stopped.
    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stats(tx)).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Check if the hub loop has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn send(&self, command: Command) -> Result<(), HubError> {
        self.tx.send(command).await.map_err(|_| HubError::Closed)
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Number of currently registered clients.
    pub clients: usize,
    /// Number of broadcast events processed.
    pub broadcasts: u64,
    /// Number of clients evicted for a full or abandoned queue.
    pub evictions: u64,
}

/// Outcome of a single broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Clients whose queue accepted the payload.
    pub delivered: usize,
    /// Clients evicted by this broadcast.
    pub evicted: Vec<ClientId>,
}

/// The live client set and its fan-out policy.
#[derive(Debug, Default)]
pub struct Hub {
    clients: HashMap<ClientId, Outbound>,
    broadcasts: u64,
    evictions: u64,
}

impl Hub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no client is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Whether `id` is registered.
    #[must_use]
    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            clients: self.clients.len(),
            broadcasts: self.broadcasts,
            evictions: self.evictions,
        }
    }

    /// Add a client to the live set.
    ///
    /// Callers register each client exactly once.
    pub fn register(&mut self, id: ClientId, queue: Outbound) {
        if self.clients.insert(id, queue).is_some() {
            warn!(client = %id, "Client registered twice, replacing queue");
        }
        debug!(client = %id, clients = self.clients.len(), "Client registered");
        metrics::set_registered(self.clients.len());
    }

    /// Remove a client from the live set, closing its queue.
    ///
    /// Returns `true` if the client was registered.
    pub fn unregister(&mut self, id: ClientId) -> bool {
        let removed = self.clients.remove(&id).is_some();
        if removed {
            debug!(client = %id, clients = self.clients.len(), "Client unregistered");
            metrics::set_registered(self.clients.len());
        }
        removed
    }

    /// Offer `payload` to every registered client without waiting.
    ///
    /// A client whose queue is full (or whose writer is gone) is evicted:
    /// its queue is closed and it leaves the live set. The payload is
    /// dropped for that client only.
    pub fn broadcast(&mut self, payload: &Bytes) -> Delivery {
        self.broadcasts += 1;

        let mut delivery = Delivery::default();
        for (id, queue) in &self.clients {
            match queue.try_send(payload.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(client = %id, "Outbound queue full, evicting slow client");
                    delivery.evicted.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(client = %id, "Outbound queue abandoned, evicting client");
                    delivery.evicted.push(*id);
                }
            }
        }

        for id in &delivery.evicted {
            self.clients.remove(id);
            self.evictions += 1;
            metrics::record_eviction();
        }
        if !delivery.evicted.is_empty() {
            metrics::set_registered(self.clients.len());
        }

        trace!(
            delivered = delivery.delivered,
            evicted = delivery.evicted.len(),
            "Broadcast"
        );
        delivery
    }

    /// Apply one command.
    pub fn handle(&mut self, command: Command) {
        match command {
            Command::Register { id, queue } => self.register(id, queue),
            Command::Unregister(id) => {
                self.unregister(id);
            }
            Command::Broadcast(payload) => {
                self.broadcast(&payload);
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    /// Run the coordination loop until every [`HubHandle`] is dropped.
    ///
    /// On exit every remaining queue is closed, which ends the writer pumps
    /// of clients that were still registered.
    pub async fn run(mut self, mut commands: HubCommands) -> HubStats {
        info!("Hub started");
        while let Some(command) = commands.recv().await {
            self.handle(command);
        }
        self.finish()
    }

    /// Run the coordination loop until every [`HubHandle`] is dropped, or
    /// until `shutdown` is cancelled and the last client has unregistered.
    ///
    /// After cancellation the loop keeps serving commands so that readers
    /// can still unregister while they wind down.
    pub async fn run_until(
        mut self,
        mut commands: HubCommands,
        shutdown: CancellationToken,
    ) -> HubStats {
        info!("Hub started");
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                () = shutdown.cancelled(), if self.is_empty() => break,
            }
            if shutdown.is_cancelled() && self.is_empty() {
                break;
            }
        }
        self.finish()
    }

    fn finish(mut self) -> HubStats {
        let stats = self.stats();
        self.clients.clear();
        metrics::set_registered(0);
        info!(
            remaining = stats.clients,
            broadcasts = stats.broadcasts,
            evictions = stats.evictions,
            "Hub stopped"
        );
        stats
    }
}
