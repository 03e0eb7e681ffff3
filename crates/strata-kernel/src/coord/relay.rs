//! The backend behind every context's executor.
//!
//! Each context runs its own arena and executor, so its callers always get
//! the same blocking call. The executor's backend is a [`Relay`]: on the
//! primary it routes straight to the opened storage, on a secondary it
//! forwards each operation over the broker-issued port and blocks until
//! the primary's reply arrives.
//!
//! `execute` runs on the executor thread, never inside the runtime, so it
//! may use `blocking_send` and `blocking_recv`.

use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use strata_types::{ContextId, FileType, Op, Reply, VfsError, VfsResult, WireError};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use super::broker::{FsRequest, FsResponse, PortHandoff};
use crate::backend::Backend;

type Pending = DashMap<u64, (u64, oneshot::Sender<Result<Reply, WireError>>)>;

struct Port {
    to: ContextId,
    generation: u64,
    requests: mpsc::Sender<FsRequest>,
}

#[derive(Default)]
struct Routes {
    local: Option<Arc<dyn Backend>>,
    port: Option<Port>,
    closed: bool,
}

enum Route {
    Local(Arc<dyn Backend>),
    Remote {
        requests: mpsc::Sender<FsRequest>,
        generation: u64,
    },
}

pub struct Relay {
    id: ContextId,
    routes: Mutex<Routes>,
    changed: Condvar,
    pending: Pending,
    next_request: AtomicU64,
    generation: AtomicU64,
    leader_timeout: Duration,
    runtime: Handle,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("id", &self.id.short())
            .field("local", &self.is_local())
            .field("primary", &self.primary().map(|p| p.short()))
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Relay {
    /// `runtime` runs the response pumps.
    pub fn new(id: ContextId, leader_timeout: Duration, runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            id,
            routes: Mutex::new(Routes::default()),
            changed: Condvar::new(),
            pending: DashMap::new(),
            next_request: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            leader_timeout,
            runtime,
        })
    }

    /// The remote primary currently attached, if any.
    pub fn primary(&self) -> Option<ContextId> {
        self.routes.lock().port.as_ref().map(|p| p.to)
    }

    pub fn is_local(&self) -> bool {
        self.routes.lock().local.is_some()
    }

    /// Requests awaiting a reply.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Serve from `backend` from now on. Drops any remote port.
    pub fn promote(&self, backend: Arc<dyn Backend>) {
        let previous = {
            let mut routes = self.routes.lock();
            routes.local = Some(backend);
            routes.port.take()
        };
        if let Some(previous) = previous {
            self.fail_generation(previous.generation);
        }
        self.changed.notify_all();
    }

    /// Stop serving locally, handing the backend back.
    pub fn demote(&self) -> Option<Arc<dyn Backend>> {
        self.routes.lock().local.take()
    }

    /// Start forwarding through `handoff`, replacing any previous port.
    pub fn attach(self: &Arc<Self>, handoff: PortHandoff) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let PortHandoff {
            to,
            requests,
            responses,
        } = handoff;

        let previous = self.routes.lock().port.replace(Port {
            to,
            generation,
            requests,
        });
        if let Some(previous) = previous {
            self.fail_generation(previous.generation);
        }
        self.changed.notify_all();
        tracing::info!(context = %self.id.short(), primary = %to.short(), "relay attached");

        self.runtime.spawn(pump(Arc::downgrade(self), generation, responses));
    }

    /// Stop forwarding to `primary`. In-flight calls to it fail.
    pub fn detach(&self, primary: ContextId) {
        let generation = {
            let mut routes = self.routes.lock();
            match routes.port.as_ref() {
                Some(port) if port.to == primary => {
                    let generation = port.generation;
                    routes.port = None;
                    generation
                }
                _ => return,
            }
        };
        self.fail_generation(generation);
        tracing::info!(context = %self.id.short(), primary = %primary.short(), "relay detached");
    }

    fn detach_generation(&self, generation: u64) {
        {
            let mut routes = self.routes.lock();
            if routes.port.as_ref().is_some_and(|p| p.generation == generation) {
                routes.port = None;
            }
        }
        self.fail_generation(generation);
    }

    /// Drop the reply senders of every request sent on `generation`.
    fn fail_generation(&self, generation: u64) {
        self.pending.retain(|_, (g, _)| *g != generation);
    }

    fn deliver(&self, response: FsResponse) {
        match self.pending.remove(&response.request_id) {
            Some((_, (_, reply))) => {
                let _ = reply.send(response.result);
            }
            None => {
                tracing::debug!(request_id = response.request_id, "reply for unknown request");
            }
        }
    }

    /// Wait for somewhere to send an op, giving up after the leader timeout.
    fn route(&self) -> VfsResult<Route> {
        let deadline = Instant::now() + self.leader_timeout;
        let mut routes = self.routes.lock();
        loop {
            if routes.closed {
                return Err(VfsError::leader_unavailable("context is shutting down"));
            }
            if let Some(local) = routes.local.as_ref() {
                return Ok(Route::Local(local.clone()));
            }
            if let Some(port) = routes.port.as_ref() {
                return Ok(Route::Remote {
                    requests: port.requests.clone(),
                    generation: port.generation,
                });
            }
            if self.changed.wait_until(&mut routes, deadline).timed_out() {
                return Err(VfsError::leader_unavailable(format!(
                    "no primary within {}ms",
                    self.leader_timeout.as_millis()
                )));
            }
        }
    }

    fn forward(&self, mut op: Op) -> VfsResult<Reply> {
        let mut retried = false;
        loop {
            let (requests, generation) = match self.route()? {
                Route::Local(backend) => return backend.execute(op),
                Route::Remote {
                    requests,
                    generation,
                } => (requests, generation),
            };
            let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            self.pending.insert(request_id, (generation, tx));

            if let Err(mpsc::error::SendError(request)) =
                requests.blocking_send(FsRequest { request_id, op })
            {
                self.pending.remove(&request_id);
                self.detach_generation(generation);
                if retried {
                    return Err(VfsError::leader_unavailable("primary stopped accepting requests"));
                }
                tracing::debug!(context = %self.id.short(), "primary port closed, waiting for the next");
                retried = true;
                op = request.op;
                continue;
            }

            return match rx.blocking_recv() {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(wire)) => Err(wire.into_call_error().into()),
                Err(_) => Err(VfsError::leader_unavailable("primary went away before replying")),
            };
        }
    }

    fn walk(&self, dir: &str, out: &mut Vec<String>) -> VfsResult<()> {
        let entries = self.forward(Op::readdir(dir))?.into_entries()?;
        for entry in entries {
            let path = if dir == "/" {
                format!("/{}", entry.name)
            } else {
                format!("{dir}/{}", entry.name)
            };
            out.push(path.clone());
            if entry.kind == FileType::Directory {
                self.walk(&path, out)?;
            }
        }
        Ok(())
    }
}

async fn pump(relay: Weak<Relay>, generation: u64, mut responses: mpsc::Receiver<FsResponse>) {
    while let Some(response) = responses.recv().await {
        let Some(relay) = relay.upgrade() else {
            return;
        };
        relay.deliver(response);
    }
    if let Some(relay) = relay.upgrade() {
        relay.detach_generation(generation);
    }
}

impl Backend for Relay {
    fn execute(&self, op: Op) -> VfsResult<Reply> {
        self.forward(op)
    }

    fn list_paths(&self) -> VfsResult<Vec<String>> {
        let local = self.routes.lock().local.clone();
        if let Some(local) = local {
            return local.list_paths();
        }
        let mut out = Vec::new();
        self.walk("/", &mut out)?;
        out.sort();
        Ok(out)
    }

    fn name(&self) -> &'static str {
        "relay"
    }

    /// Refuse further calls and fail those waiting on the primary.
    fn shutdown(&self) {
        let port = {
            let mut routes = self.routes.lock();
            routes.closed = true;
            routes.port.take()
        };
        if let Some(port) = port {
            self.fail_generation(port.generation);
        }
        self.changed.notify_all();
    }
}
