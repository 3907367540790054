use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, watch};

use super::state::{CmState, Role};
use super::types::{LogEntry, LogIndex, NodeId, Term};
use crate::application::Application;
use crate::config::RaftConfig;
use crate::server::RaftTransport;
use crate::util::errors::{RaftError, Result};

/// Capacity of the commit-ready channel; multiple wakes coalesce into one
/// drain by the apply worker.
pub(crate) const COMMIT_READY_CAPACITY: usize = 16;

/// Capacity of the replication trigger channel; one pending wake is enough.
pub(crate) const REPLICATE_TRIGGER_CAPACITY: usize = 1;

/// A single node of the consensus protocol.
///
/// All mutable state sits behind one mutex. The lock is held only for the
/// duration of a decision, never across a wait; every background worker
/// re-checks role and term after reacquiring it.
pub struct ConsensusModule<A: Application> {
    pub(crate) id: NodeId,
    pub(crate) peer_ids: Vec<NodeId>,
    pub(crate) config: RaftConfig,
    pub(crate) transport: Weak<dyn RaftTransport<A::Command>>,
    self_ref: Weak<ConsensusModule<A>>,
    app: Mutex<A>,
    pub(crate) state: Mutex<CmState<A>>,
}

/// Point-in-time snapshot of a node's externally visible state.
#[derive(Debug, Clone)]
pub struct StateReport {
    pub node_id: NodeId,
    pub role: Role,
    pub current_term: Term,
    pub current_leader: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_log_index: LogIndex,
}

impl<A: Application> ConsensusModule<A> {
    /// Creates a new consensus module. The node stays dormant (no election
    /// timer) until `ready` flips to true; the apply worker runs for the
    /// whole lifetime of the module.
    pub fn new(
        id: NodeId,
        peer_ids: Vec<NodeId>,
        config: RaftConfig,
        transport: Weak<dyn RaftTransport<A::Command>>,
        app: A,
        ready: watch::Receiver<bool>,
    ) -> Result<Arc<Self>> {
        config.validate().map_err(RaftError::InvalidConfig)?;

        let (commit_ready_tx, commit_ready_rx) = mpsc::channel(COMMIT_READY_CAPACITY);
        let cm = Arc::new_cyclic(|self_ref| Self {
            state: Mutex::new(CmState::new(id.clone(), commit_ready_tx)),
            id,
            peer_ids,
            config,
            transport,
            self_ref: self_ref.clone(),
            app: Mutex::new(app),
        });

        tokio::spawn(Arc::clone(&cm).run_apply(commit_ready_rx));
        tokio::spawn(Arc::clone(&cm).wait_ready(ready));

        Ok(cm)
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, CmState<A>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// An owning handle on this module, for handing work to a new task.
    pub(crate) fn strong(&self) -> Option<Arc<Self>> {
        self.self_ref.upgrade()
    }

    /// Launches a fresh one-shot election timer task.
    pub(crate) fn spawn_election_timer(&self) {
        if let Some(cm) = self.strong() {
            tokio::spawn(cm.run_election_timer());
        }
    }

    /// Parks until the cluster releases the ready gate, then starts the
    /// election countdown.
    async fn wait_ready(self: Arc<Self>, mut ready: watch::Receiver<bool>) {
        while !*ready.borrow() {
            if ready.changed().await.is_err() {
                return;
            }
        }

        {
            let mut st = self.lock_state();
            if st.role == Role::Dead {
                return;
            }
            st.election_reset_at = Instant::now();
        }
        tracing::debug!("Node {} released, election countdown started", self.id);
        self.run_election_timer().await;
    }

    /// Submits a new command. If this node is the leader the command is
    /// appended to the log and the call waits (up to the submit timeout)
    /// for it to commit and be applied, returning the application's output.
    /// Otherwise the caller must try another node.
    pub async fn submit(&self, command: A::Command) -> Result<A::Output> {
        let (target, result_rx) = {
            let mut st = self.lock_state();
            tracing::debug!("Submit received by {} ({})", self.id, st.role);
            if st.role != Role::Leader {
                return Err(RaftError::NotLeader);
            }

            let term = st.current_term;
            st.log.push(LogEntry::new(command, term));
            let target = st.last_log_index();
            tracing::info!(
                "Leader {} appended entry at index {} (term {})",
                self.id,
                target,
                term
            );

            let (tx, rx) = oneshot::channel();
            st.waiters.insert(target, tx);

            if self.peer_ids.is_empty() {
                // Single-node cluster: nothing to replicate, commit now.
                st.commit_index = target;
                if let Some(ready) = &st.commit_ready_tx {
                    let _ = ready.try_send(());
                }
            } else if let Some(trigger) = &st.replicate_tx {
                let _ = trigger.try_send(());
            }

            (target, rx)
        };

        match tokio::time::timeout(self.config.submit_timeout(), result_rx).await {
            Ok(Ok(output)) => Ok(output),
            // The wait slot was cancelled: leadership was lost before the
            // entry committed.
            Ok(Err(_)) => Err(RaftError::NotLeader),
            Err(_) => {
                self.lock_state().waiters.remove(&target);
                tracing::debug!(
                    "Leader {} submit timed out waiting for index {}",
                    self.id,
                    target
                );
                Err(RaftError::CommitTimeout)
            }
        }
    }

    /// Reports the externally visible state of this node.
    pub fn report(&self) -> StateReport {
        let st = self.lock_state();
        StateReport {
            node_id: self.id.clone(),
            role: st.role,
            current_term: st.current_term,
            current_leader: st.current_leader.clone(),
            commit_index: st.commit_index,
            last_log_index: st.last_log_index(),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.lock_state().is_leader()
    }

    /// Stops this node. Returns quickly; background workers notice the
    /// `Dead` role within one timer tick and exit.
    pub fn stop(&self) {
        let mut st = self.lock_state();
        if st.role == Role::Dead {
            return;
        }
        st.role = Role::Dead;
        st.commit_ready_tx = None;
        st.replicate_tx = None;
        st.waiters.clear();
        tracing::info!("Node {} becomes Dead", self.id);
    }

    /// Transitions to follower at the given term and launches a fresh
    /// election timer. No-op on a stopped node.
    pub(crate) fn become_follower(&self, st: &mut CmState<A>, term: Term) {
        if st.role == Role::Dead {
            return;
        }
        st.become_follower(term);
        self.spawn_election_timer();
    }

    /// Applies committed entries, in index order, exactly once each. Runs
    /// until the commit-ready channel is closed by `stop`. Each output is
    /// handed to the submitter waiting on that index, if there is one.
    async fn run_apply(self: Arc<Self>, mut commit_ready_rx: mpsc::Receiver<()>) {
        while commit_ready_rx.recv().await.is_some() {
            let (first_index, batch) = {
                let mut st = self.lock_state();
                if st.commit_index > st.last_applied {
                    let lo = st.last_applied as usize;
                    let hi = st.commit_index as usize;
                    let batch: Vec<LogEntry<A::Command>> = st.log[lo..hi].to_vec();
                    let first_index = st.last_applied + 1;
                    st.last_applied = st.commit_index;
                    (first_index, batch)
                } else {
                    (0, Vec::new())
                }
            };

            for (offset, entry) in batch.into_iter().enumerate() {
                let index = first_index + offset as LogIndex;
                let output = {
                    let mut app = self.app.lock().unwrap_or_else(|p| p.into_inner());
                    app.apply_command(entry.command)
                };
                tracing::debug!("Node {} applied entry at index {}", self.id, index);

                let waiter = self.lock_state().waiters.remove(&index);
                if let Some(tx) = waiter {
                    let _ = tx.send(output);
                }
            }
        }
        tracing::debug!("Node {} apply worker done", self.id);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio::sync::watch;

    use super::*;
    use crate::raft::rpc::RaftMessage;

    pub(crate) struct NullApp;

    impl Application for NullApp {
        type Command = u64;
        type Output = u64;

        fn apply_command(&mut self, command: u64) -> u64 {
            command
        }
    }

    pub(crate) struct UnreachableTransport;

    #[async_trait]
    impl RaftTransport<u64> for UnreachableTransport {
        async fn call(&self, peer: &NodeId, _message: RaftMessage<u64>) -> Result<RaftMessage<u64>> {
            Err(RaftError::TransportError(format!("{} unreachable", peer)))
        }
    }

    /// Everything a handler test needs to keep alive: the node, the ready
    /// gate sender, and the (unreachable) transport.
    pub(crate) struct TestNode {
        pub cm: Arc<ConsensusModule<NullApp>>,
        #[allow(dead_code)]
        pub ready_tx: watch::Sender<bool>,
        #[allow(dead_code)]
        pub transport: Arc<dyn RaftTransport<u64>>,
    }

    /// A dormant node: the ready gate is never released, so no election
    /// timer runs and handler behavior can be tested deterministically.
    pub(crate) fn dormant_node(id: &str, peers: &[&str]) -> TestNode {
        let transport: Arc<dyn RaftTransport<u64>> = Arc::new(UnreachableTransport);
        let (ready_tx, ready_rx) = watch::channel(false);
        let cm = ConsensusModule::new(
            id.to_string(),
            peers.iter().map(|p| p.to_string()).collect(),
            RaftConfig::default(),
            Arc::downgrade(&transport),
            NullApp,
            ready_rx,
        )
        .unwrap();
        TestNode {
            cm,
            ready_tx,
            transport,
        }
    }
}
