//! Port hand-off between contexts.
//!
//! The broker is a task owned by the origin, not by any context, so it
//! outlives primaries coming and going. A primary registers an inbox; a
//! secondary asks to connect to it and receives a fresh request/response
//! channel pair whose other ends are delivered to the primary's inbox.

use std::collections::HashMap;

use strata_types::{ContextId, Op, Reply, VfsError, VfsResult, WireError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// A relayed call.
#[derive(Debug)]
pub struct FsRequest {
    pub request_id: u64,
    pub op: Op,
}

/// The answer to an [`FsRequest`].
#[derive(Debug)]
pub struct FsResponse {
    pub request_id: u64,
    pub result: Result<Reply, WireError>,
}

/// The serving ends of a new connection, delivered to the target's inbox.
#[derive(Debug)]
pub struct Incoming {
    pub from: ContextId,
    pub requests: mpsc::Receiver<FsRequest>,
    pub responses: mpsc::Sender<FsResponse>,
}

/// The calling ends of a new connection, returned to the connecting side.
#[derive(Debug)]
pub struct PortHandoff {
    pub to: ContextId,
    pub requests: mpsc::Sender<FsRequest>,
    pub responses: mpsc::Receiver<FsResponse>,
}

enum Command {
    Register {
        id: ContextId,
        inbox: mpsc::Sender<Incoming>,
    },
    Unregister {
        id: ContextId,
    },
    Connect {
        from: ContextId,
        to: ContextId,
        reply: oneshot::Sender<VfsResult<PortHandoff>>,
    },
}

/// Handle to the broker task. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Broker {
    tx: mpsc::Sender<Command>,
}

impl Broker {
    /// Start the broker. `capacity` sizes every channel it creates.
    pub fn spawn(capacity: usize) -> (Self, JoinHandle<()>) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let task = tokio::spawn(run(rx, capacity));
        (Self { tx }, task)
    }

    pub async fn register(&self, id: ContextId, inbox: mpsc::Sender<Incoming>) -> VfsResult<()> {
        self.tx
            .send(Command::Register { id, inbox })
            .await
            .map_err(|_| stopped())
    }

    pub async fn unregister(&self, id: ContextId) {
        // A stopped broker has nothing registered.
        let _ = self.tx.send(Command::Unregister { id }).await;
    }

    /// Open a connection from `from` to the registered context `to`.
    pub async fn connect(&self, from: ContextId, to: ContextId) -> VfsResult<PortHandoff> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Connect { from, to, reply })
            .await
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }
}

fn stopped() -> VfsError {
    VfsError::leader_unavailable("broker stopped")
}

async fn run(mut rx: mpsc::Receiver<Command>, capacity: usize) {
    let mut inboxes: HashMap<ContextId, mpsc::Sender<Incoming>> = HashMap::new();
    while let Some(command) = rx.recv().await {
        match command {
            Command::Register { id, inbox } => {
                tracing::debug!(context = %id.short(), "broker: registered");
                inboxes.insert(id, inbox);
            }
            Command::Unregister { id } => {
                if inboxes.remove(&id).is_some() {
                    tracing::debug!(context = %id.short(), "broker: unregistered");
                }
            }
            Command::Connect { from, to, reply } => {
                let result = connect(&mut inboxes, from, to, capacity);
                let _ = reply.send(result);
            }
        }
    }
    tracing::debug!("broker stopped");
}

fn connect(
    inboxes: &mut HashMap<ContextId, mpsc::Sender<Incoming>>,
    from: ContextId,
    to: ContextId,
    capacity: usize,
) -> VfsResult<PortHandoff> {
    let inbox = inboxes
        .get(&to)
        .ok_or_else(|| VfsError::leader_unavailable(format!("{} is not registered", to.short())))?;

    let (req_tx, req_rx) = mpsc::channel(capacity);
    let (resp_tx, resp_rx) = mpsc::channel(capacity);
    let incoming = Incoming {
        from,
        requests: req_rx,
        responses: resp_tx,
    };
    if inbox.try_send(incoming).is_err() {
        inboxes.remove(&to);
        return Err(VfsError::leader_unavailable(format!(
            "{} stopped accepting connections",
            to.short()
        )));
    }
    tracing::debug!(from = %from.short(), to = %to.short(), "broker: connected");
    Ok(PortHandoff {
        to,
        requests: req_tx,
        responses: resp_rx,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::ErrorCode;

    #[tokio::test]
    async fn test_connect_hands_both_ends_over() {
        let (broker, _task) = Broker::spawn(4);
        let primary = ContextId::new();
        let secondary = ContextId::new();
        let (inbox_tx, mut inbox) = mpsc::channel(4);
        broker.register(primary, inbox_tx).await.unwrap();

        let mut handoff = broker.connect(secondary, primary).await.unwrap();
        assert_eq!(handoff.to, primary);
        let mut incoming = inbox.recv().await.unwrap();
        assert_eq!(incoming.from, secondary);

        handoff
            .requests
            .send(FsRequest {
                request_id: 1,
                op: Op::stat("/"),
            })
            .await
            .unwrap();
        let request = incoming.requests.recv().await.unwrap();
        assert_eq!(request.op, Op::stat("/"));
        incoming
            .responses
            .send(FsResponse {
                request_id: request.request_id,
                result: Ok(Reply::Unit),
            })
            .await
            .unwrap();
        let response = handoff.responses.recv().await.unwrap();
        assert_eq!(response.request_id, 1);
    }

    #[tokio::test]
    async fn test_unknown_or_gone_target_is_leader_unavailable() {
        let (broker, _task) = Broker::spawn(4);
        let me = ContextId::new();
        let err = broker.connect(me, ContextId::new()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Eagain);

        let primary = ContextId::new();
        let (inbox_tx, inbox) = mpsc::channel(4);
        broker.register(primary, inbox_tx).await.unwrap();
        drop(inbox);
        assert!(broker.connect(me, primary).await.is_err());

        let (inbox_tx, _inbox) = mpsc::channel(4);
        broker.register(primary, inbox_tx).await.unwrap();
        broker.unregister(primary).await;
        assert!(broker.connect(me, primary).await.is_err());
    }
}
