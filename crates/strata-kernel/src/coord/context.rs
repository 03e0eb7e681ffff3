//! Execution contexts and leader election.
//!
//! Every context of an [`Origin`] runs the same task. It holds its own
//! lifetime lock, announces itself on the shared channel, and races for the
//! origin's leader lock. The winner opens storage and becomes primary; the
//! rest connect to it through the broker and relay their calls.
//!
//! ```text
//!   Unelected ──Elected──▶ Primary
//!       │                    ▲
//!     Joined              Promoted
//!       ▼                    │
//!   Secondary{p} ──Replaced──▶ Secondary{q}
//! ```
//!
//! Departures are detected by acquiring a peer's lifetime lock, which only
//! succeeds once its task is gone.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use strata_types::{ContextId, VfsError, VfsResult, WireError};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use super::broker::{Broker, FsResponse, Incoming};
use super::channel::{Announcement, SharedChannel};
use super::locks::{LockGuard, LockManager};
use super::relay::Relay;
use crate::backend::{Backend, Storage};
use crate::config::StrataConfig;
use crate::protocol::{Arena, Executor, ExecutorHandle, SyncClient, wait};
use crate::sync::{EventQueue, NativeWatcher};

/// Where a context stands in the election.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Unelected,
    Primary,
    Secondary { primary: ContextId },
}

impl Role {
    pub fn is_primary(&self) -> bool {
        matches!(self, Role::Primary)
    }
}

/// A logged change of [`Role`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Transition {
    /// Won the first election this context took part in.
    Elected,
    /// Connected to an existing primary.
    Joined,
    /// A secondary took over after the primary left.
    Promoted,
    /// A secondary moved to a new primary.
    Replaced,
}

impl Transition {
    pub fn between(from: &Role, to: &Role) -> Option<Self> {
        match (from, to) {
            (Role::Unelected, Role::Primary) => Some(Transition::Elected),
            (Role::Unelected, Role::Secondary { .. }) => Some(Transition::Joined),
            (Role::Secondary { .. }, Role::Primary) => Some(Transition::Promoted),
            (Role::Secondary { primary: a }, Role::Secondary { primary: b }) if a != b => {
                Some(Transition::Replaced)
            }
            _ => None,
        }
    }
}

/// Snapshot of a context for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextRecord {
    pub id: ContextId,
    /// Name of the lock held for the context's lifetime.
    pub lock_id: String,
    pub role: Role,
    pub peers: Vec<ContextId>,
}

/// The scope contexts elect a primary within.
///
/// Owns the lock table, the announcement channel, and the broker, all of
/// which outlive any single context.
#[derive(Debug)]
pub struct Origin {
    config: Arc<StrataConfig>,
    locks: LockManager,
    channel: SharedChannel,
    broker: Broker,
}

impl Origin {
    /// Must be called inside a tokio runtime.
    pub fn new(config: StrataConfig) -> Self {
        let capacity = config.coordinator.channel_capacity;
        let (broker, _task) = Broker::spawn(capacity);
        tracing::debug!(origin = %config.coordinator.origin, "origin created");
        Self {
            config: Arc::new(config),
            locks: LockManager::new(),
            channel: SharedChannel::new(capacity),
            broker,
        }
    }

    pub fn config(&self) -> &StrataConfig {
        &self.config
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn channel(&self) -> &SharedChannel {
        &self.channel
    }

    fn leader_lock(&self) -> String {
        format!("strata:{}:leader", self.config.coordinator.origin)
    }

    /// Start a new context. Must be called inside a multi-threaded runtime.
    pub fn spawn_context(&self) -> VfsResult<ContextHandle> {
        let id = ContextId::new();
        let lifetime = self
            .locks
            .try_acquire(&id.lock_name())
            .ok_or_else(|| VfsError::already_exists(id.lock_name()))?;

        let protocol = &self.config.protocol;
        let arena = Arena::new(protocol);
        let relay = Relay::new(id, self.config.coordinator.leader_timeout(), Handle::current());
        let executor = Executor::spawn(arena.clone(), relay.clone(), protocol)?;
        let client = SyncClient::new(arena.clone(), wait::strategy(protocol.wait), protocol.call_timeout());

        let (role_tx, role_rx) = watch::channel(Role::Unelected);
        let peers = Arc::new(Mutex::new(BTreeSet::new()));
        let cancel = CancellationToken::new();

        let context = Context {
            id,
            config: self.config.clone(),
            locks: self.locks.clone(),
            channel: self.channel.clone(),
            broker: self.broker.clone(),
            leader_lock: self.leader_lock(),
            arena,
            relay,
            role: role_tx,
            peers: peers.clone(),
            cancel: cancel.clone(),
            monitored: HashSet::new(),
            primary: None,
        };
        let task = tokio::spawn(context.run(lifetime, executor));

        Ok(ContextHandle {
            id,
            role: role_rx,
            peers,
            client,
            cancel,
            task: Some(task),
        })
    }
}

/// Caller-side view of a running context.
///
/// Dropping the handle stops the context in the background; use
/// [`ContextHandle::shutdown`] to wait for it.
#[derive(Debug)]
pub struct ContextHandle {
    id: ContextId,
    role: watch::Receiver<Role>,
    peers: Arc<Mutex<BTreeSet<ContextId>>>,
    client: SyncClient,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ContextHandle {
    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role.borrow().clone()
    }

    pub fn is_primary(&self) -> bool {
        self.role.borrow().is_primary()
    }

    pub fn peers(&self) -> Vec<ContextId> {
        self.peers.lock().iter().copied().collect()
    }

    /// Blocking client for this context's arena.
    ///
    /// Calls block the current thread; from async code run them on
    /// `spawn_blocking`.
    pub fn client(&self) -> &SyncClient {
        &self.client
    }

    pub fn record(&self) -> ContextRecord {
        ContextRecord {
            id: self.id,
            lock_id: self.id.lock_name(),
            role: self.role(),
            peers: self.peers(),
        }
    }

    /// Wait until the context is primary or connected to one.
    pub async fn wait_ready(&self, timeout: Duration) -> VfsResult<Role> {
        let mut role = self.role.clone();
        let ready = async move {
            role.wait_for(|r| *r != Role::Unelected)
                .await
                .map(|r| r.clone())
        };
        match tokio::time::timeout(timeout, ready).await {
            Ok(Ok(role)) => Ok(role),
            Ok(Err(_)) => Err(VfsError::leader_unavailable(format!(
                "context {} stopped before it was ready",
                self.id.short()
            ))),
            Err(_) => Err(VfsError::timeout(format!(
                "context {} not ready within {timeout:?}",
                self.id.short()
            ))),
        }
    }

    /// Stop the context and wait for its storage to close.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(context = %self.id.short(), error = %e, "context task failed");
            }
        }
    }
}

impl Drop for ContextHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct PrimaryState {
    leader: LockGuard,
    storage: Storage,
    watcher: Option<NativeWatcher>,
    connections: JoinSet<()>,
}

struct Context {
    id: ContextId,
    config: Arc<StrataConfig>,
    locks: LockManager,
    channel: SharedChannel,
    broker: Broker,
    leader_lock: String,
    arena: Arc<Arena>,
    relay: Arc<Relay>,
    role: watch::Sender<Role>,
    peers: Arc<Mutex<BTreeSet<ContextId>>>,
    cancel: CancellationToken,
    monitored: HashSet<ContextId>,
    primary: Option<PrimaryState>,
}

impl Context {
    async fn run(mut self, lifetime: LockGuard, executor: ExecutorHandle) {
        let cancel = self.cancel.clone();
        let locks = self.locks.clone();
        let leader_lock = self.leader_lock.clone();
        let leader = locks.acquire(&leader_lock);
        tokio::pin!(leader);

        let mut announcements = self.channel.subscribe();
        let mut monitors: JoinSet<ContextId> = JoinSet::new();
        let mut inbox: Option<mpsc::Receiver<Incoming>> = None;

        tracing::info!(context = %self.id.short(), origin = %self.config.coordinator.origin, "context started");
        self.channel.publish(Announcement::Announce { id: self.id });

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                guard = &mut leader, if self.primary.is_none() => {
                    match self.become_primary(guard, &mut monitors).await {
                        Ok(rx) => inbox = Some(rx),
                        Err(e) => {
                            tracing::error!(context = %self.id.short(), error = %e, "could not take over storage");
                            break;
                        }
                    }
                }
                message = announcements.recv() => match message {
                    Ok(announcement) => self.on_announcement(announcement, &mut monitors).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(context = %self.id.short(), missed, "announcement channel lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(incoming) = next_incoming(&mut inbox) => self.serve(incoming),
                Some(joined) = monitors.join_next() => {
                    if let Ok(peer) = joined {
                        self.monitored.remove(&peer);
                        tracing::info!(context = %self.id.short(), peer = %peer.short(), "peer departed");
                        self.channel.publish(Announcement::Departed { id: peer });
                    }
                }
            }
        }

        monitors.abort_all();
        drop(inbox);
        self.teardown(executor).await;
        drop(lifetime);
        tracing::info!(context = %self.id.short(), "context stopped");
    }

    async fn become_primary(
        &mut self,
        leader: LockGuard,
        monitors: &mut JoinSet<ContextId>,
    ) -> VfsResult<mpsc::Receiver<Incoming>> {
        let events = Arc::new(EventQueue::with_metrics(
            self.arena.metrics().clone(),
            self.config.events.grace(),
            self.config.events.stale_after(),
        ));
        // Connections that arrive while storage opens wait in the inbox.
        let (inbox_tx, inbox_rx) = mpsc::channel(self.config.coordinator.channel_capacity.max(1));
        self.broker.register(self.id, inbox_tx).await?;

        let config = self.config.clone();
        let opened = tokio::task::spawn_blocking(move || Storage::open(&config, events))
            .await
            .map_err(|e| VfsError::other(format!("storage open task failed: {e}")))
            .and_then(|opened| opened);
        let storage = match opened {
            Ok(storage) => storage,
            Err(e) => {
                self.broker.unregister(self.id).await;
                return Err(e);
            }
        };

        let watcher = match storage.watch(&self.config) {
            Ok(watching) => watching.map(|(watcher, _)| watcher),
            Err(e) => {
                tracing::warn!(error = %e, "native watcher unavailable, foreign changes will not be imported");
                None
            }
        };

        self.relay.promote(storage.backend());
        self.primary = Some(PrimaryState {
            leader,
            storage,
            watcher,
            connections: JoinSet::new(),
        });
        self.set_role(Role::Primary);
        self.channel.publish(Announcement::PrimaryChanged { id: self.id });

        let peers: Vec<ContextId> = self.peers.lock().iter().copied().collect();
        for peer in peers {
            self.monitor(peer, monitors);
        }
        Ok(inbox_rx)
    }

    async fn on_announcement(&mut self, announcement: Announcement, monitors: &mut JoinSet<ContextId>) {
        if announcement.id() == self.id {
            return;
        }
        match announcement {
            Announcement::Announce { id } => {
                self.peers.lock().insert(id);
                if self.primary.is_some() {
                    self.monitor(id, monitors);
                    self.channel.publish(Announcement::PrimaryChanged { id: self.id });
                }
            }
            Announcement::PrimaryChanged { id } => {
                self.peers.lock().insert(id);
                if self.primary.is_some() {
                    tracing::error!(context = %self.id.short(), other = %id.short(), "another context claims primary");
                    return;
                }
                if self.relay.primary() == Some(id) {
                    return;
                }
                match self.broker.connect(self.id, id).await {
                    Ok(handoff) => {
                        self.relay.attach(handoff);
                        self.monitor(id, monitors);
                        self.set_role(Role::Secondary { primary: id });
                        // Make sure the new primary knows about us.
                        self.channel.publish(Announcement::Announce { id: self.id });
                    }
                    Err(e) => {
                        tracing::warn!(context = %self.id.short(), primary = %id.short(), error = %e, "connect failed");
                    }
                }
            }
            Announcement::Departed { id } => {
                self.peers.lock().remove(&id);
                self.relay.detach(id);
            }
        }
    }

    /// Watch `peer`'s lifetime lock.
    fn monitor(&mut self, peer: ContextId, monitors: &mut JoinSet<ContextId>) {
        if !self.monitored.insert(peer) {
            return;
        }
        let locks = self.locks.clone();
        monitors.spawn(async move {
            let _gone = locks.acquire(&peer.lock_name()).await;
            peer
        });
    }

    fn serve(&mut self, incoming: Incoming) {
        let Some(primary) = self.primary.as_mut() else {
            return;
        };
        tracing::debug!(context = %self.id.short(), from = %incoming.from.short(), "serving connection");
        let backend = primary.storage.backend();
        primary
            .connections
            .spawn(serve_connection(incoming, backend, self.cancel.clone()));
    }

    fn set_role(&self, next: Role) {
        let previous = self.role.borrow().clone();
        if let Some(transition) = Transition::between(&previous, &next) {
            tracing::info!(context = %self.id.short(), %transition, role = ?next, "role changed");
        }
        self.role.send_replace(next);
    }

    /// Release everything in dependency order: callers first, storage
    /// next, the leader lock last.
    async fn teardown(&mut self, mut executor: ExecutorHandle) {
        self.cancel.cancel();
        self.relay.shutdown();
        let primary = self.primary.take();
        if primary.is_some() {
            self.broker.unregister(self.id).await;
        }

        let Some(PrimaryState {
            leader,
            storage,
            watcher,
            mut connections,
        }) = primary
        else {
            let stopped = tokio::task::spawn_blocking(move || executor.stop()).await;
            if stopped.is_err() {
                tracing::error!(context = %self.id.short(), "executor stop failed");
            }
            self.set_role(Role::Unelected);
            return;
        };

        while connections.join_next().await.is_some() {}
        if let Some(watcher) = watcher {
            watcher.stop();
        }
        self.relay.demote();
        let backend = storage.backend();
        let closed = tokio::task::spawn_blocking(move || {
            executor.stop();
            backend.shutdown();
        })
        .await;
        if closed.is_err() {
            tracing::error!(context = %self.id.short(), "storage close failed");
        }
        self.set_role(Role::Unelected);
        drop(leader);
    }
}

async fn next_incoming(inbox: &mut Option<mpsc::Receiver<Incoming>>) -> Option<Incoming> {
    match inbox {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Answer one secondary's requests until it hangs up or we stop.
async fn serve_connection(incoming: Incoming, backend: Arc<dyn Backend>, cancel: CancellationToken) {
    let Incoming {
        from,
        mut requests,
        responses,
    } = incoming;
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        let syscall = request.op.method();
        let path = request.op.path().map(str::to_string);
        let backend = backend.clone();
        let op = request.op;
        let result = match tokio::task::spawn_blocking(move || backend.execute(op)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(WireError::new(&e, syscall, path)),
            Err(e) => {
                tracing::error!(syscall, error = %e, "relayed operation panicked");
                Err(WireError::new(&VfsError::other("operation panicked"), syscall, path))
            }
        };
        let response = FsResponse {
            request_id: request.request_id,
            result,
        };
        if responses.send(response).await.is_err() {
            break;
        }
    }
    tracing::debug!(from = %from.short(), "connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let a = ContextId::new();
        let b = ContextId::new();
        let sec_a = Role::Secondary { primary: a };
        let sec_b = Role::Secondary { primary: b };

        assert_eq!(Transition::between(&Role::Unelected, &Role::Primary), Some(Transition::Elected));
        assert_eq!(Transition::between(&Role::Unelected, &sec_a), Some(Transition::Joined));
        assert_eq!(Transition::between(&sec_a, &Role::Primary), Some(Transition::Promoted));
        assert_eq!(Transition::between(&sec_a, &sec_b), Some(Transition::Replaced));
        assert_eq!(Transition::between(&sec_a, &sec_a), None);
        assert_eq!(Transition::between(&Role::Primary, &Role::Unelected), None);
        assert_eq!(Transition::Promoted.to_string(), "Promoted");
    }
}
