use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::application::Application;
use crate::config::RaftConfig;
use crate::raft::core::{ConsensusModule, StateReport};
use crate::raft::rpc::RaftMessage;
use crate::raft::types::NodeId;
use crate::util::errors::{RaftError, Result};

/// Request/reply transport between consensus modules: at-most-once per
/// call, best effort. Failures surface as `RaftError::TransportError` and
/// are absorbed by the periodic retry loops.
#[async_trait]
pub trait RaftTransport<C: Send + 'static>: Send + Sync {
    async fn call(&self, peer: &NodeId, message: RaftMessage<C>) -> Result<RaftMessage<C>>;
}

/// One cluster node: the consensus module plus the links to its peers.
///
/// Links are in-process, but every request and reply is round-tripped
/// through the wire codec so that command types are proven marshallable.
pub struct Server<A: Application> {
    id: NodeId,
    cm: OnceLock<Arc<ConsensusModule<A>>>,
    peers: Mutex<HashMap<NodeId, Weak<Server<A>>>>,
}

impl<A: Application> Server<A> {
    pub fn new(
        id: NodeId,
        peer_ids: Vec<NodeId>,
        config: RaftConfig,
        app: A,
        ready: watch::Receiver<bool>,
    ) -> Result<Arc<Self>> {
        let server = Arc::new(Self {
            id: id.clone(),
            cm: OnceLock::new(),
            peers: Mutex::new(HashMap::new()),
        });

        let server_dyn: Arc<dyn RaftTransport<A::Command>> = server.clone();
        let transport: Weak<dyn RaftTransport<A::Command>> = Arc::downgrade(&server_dyn);
        let cm = ConsensusModule::new(id, peer_ids, config, transport, app, ready)?;
        let _ = server.cm.set(cm);

        Ok(server)
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    fn cm(&self) -> &Arc<ConsensusModule<A>> {
        self.cm.get().expect("consensus module set during construction")
    }

    /// Submits a command to this node's consensus module.
    pub async fn submit(&self, command: A::Command) -> Result<A::Output> {
        self.cm().submit(command).await
    }

    pub fn report(&self) -> StateReport {
        self.cm().report()
    }

    pub fn is_leader(&self) -> bool {
        self.cm().is_leader()
    }

    /// Stops the consensus module. Links are left to the caller
    /// (`disconnect_all` first for a clean shutdown).
    pub fn shutdown(&self) {
        self.cm().stop();
    }

    pub fn connect_to_peer(&self, peer: &Arc<Server<A>>) {
        self.lock_peers()
            .insert(peer.id.clone(), Arc::downgrade(peer));
    }

    pub fn disconnect_peer(&self, peer_id: &NodeId) {
        self.lock_peers().remove(peer_id);
    }

    pub fn disconnect_all(&self) {
        self.lock_peers().clear();
        tracing::debug!("Node {} disconnected from all peers", self.id);
    }

    fn lock_peers(&self) -> std::sync::MutexGuard<'_, HashMap<NodeId, Weak<Server<A>>>> {
        self.peers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Dispatches a decoded inbound request to the consensus module.
    fn handle_message(&self, message: RaftMessage<A::Command>) -> Result<RaftMessage<A::Command>> {
        match message {
            RaftMessage::RequestVote(req) => Ok(RaftMessage::RequestVoteResponse(
                self.cm().handle_request_vote(req)?,
            )),
            RaftMessage::AppendEntries(req) => Ok(RaftMessage::AppendEntriesResponse(
                self.cm().handle_append_entries(req)?,
            )),
            _ => Err(RaftError::TransportError(format!(
                "node {} received a reply where a request was expected",
                self.id
            ))),
        }
    }
}

#[async_trait]
impl<A: Application> RaftTransport<A::Command> for Server<A> {
    async fn call(
        &self,
        peer: &NodeId,
        message: RaftMessage<A::Command>,
    ) -> Result<RaftMessage<A::Command>> {
        let link = self.lock_peers().get(peer).cloned();
        let Some(link) = link else {
            return Err(RaftError::TransportError(format!(
                "node {} is not connected to {}",
                self.id, peer
            )));
        };
        let Some(remote) = link.upgrade() else {
            return Err(RaftError::TransportError(format!("{} is gone", peer)));
        };

        // Both legs go through the codec, exactly as they would on a real
        // wire.
        let request = bincode::serialize(&message)?;
        let request: RaftMessage<A::Command> = bincode::deserialize(&request)?;

        let reply = remote.handle_message(request)?;

        let reply_bytes = bincode::serialize(&reply)?;
        Ok(bincode::deserialize(&reply_bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::calculator::{CalcCommand, Calculator};

    fn test_server(id: &str, peer_ids: &[&str]) -> (Arc<Server<Calculator>>, watch::Sender<bool>) {
        let (ready_tx, ready_rx) = watch::channel(false);
        let server = Server::new(
            id.to_string(),
            peer_ids.iter().map(|p| p.to_string()).collect(),
            RaftConfig::default(),
            Calculator::new(),
            ready_rx,
        )
        .unwrap();
        (server, ready_tx)
    }

    #[tokio::test]
    async fn call_fails_when_not_connected() {
        let (server, _ready) = test_server("node-0", &["node-1"]);

        let result = server
            .call(
                &"node-1".to_string(),
                RaftMessage::<CalcCommand>::RequestVote(crate::raft::rpc::RequestVoteRequest {
                    term: 1,
                    candidate_id: "node-0".to_string(),
                    last_log_index: 0,
                    last_log_term: 0,
                }),
            )
            .await;

        assert!(matches!(result, Err(RaftError::TransportError(_))));
    }

    #[tokio::test]
    async fn routes_request_vote_between_connected_servers() {
        let (a, _ready_a) = test_server("node-0", &["node-1"]);
        let (b, _ready_b) = test_server("node-1", &["node-0"]);
        a.connect_to_peer(&b);

        let reply = a
            .call(
                &"node-1".to_string(),
                RaftMessage::RequestVote(crate::raft::rpc::RequestVoteRequest {
                    term: 1,
                    candidate_id: "node-0".to_string(),
                    last_log_index: 0,
                    last_log_term: 0,
                }),
            )
            .await
            .unwrap();

        match reply {
            RaftMessage::RequestVoteResponse(response) => {
                assert!(response.vote_granted);
                assert_eq!(response.term, 1);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn disconnect_cuts_the_link() {
        let (a, _ready_a) = test_server("node-0", &["node-1"]);
        let (b, _ready_b) = test_server("node-1", &["node-0"]);
        a.connect_to_peer(&b);
        a.disconnect_peer(b.id());

        let result = a
            .call(
                &"node-1".to_string(),
                RaftMessage::RequestVote(crate::raft::rpc::RequestVoteRequest {
                    term: 1,
                    candidate_id: "node-0".to_string(),
                    last_log_index: 0,
                    last_log_term: 0,
                }),
            )
            .await;

        assert!(matches!(result, Err(RaftError::TransportError(_))));
    }
}
