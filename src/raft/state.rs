use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use super::types::{LogEntry, LogIndex, NodeId, Term};
use crate::application::Application;

/// The four states a node can be in. `Dead` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Follower state - receives updates from leader
    Follower,
    /// Candidate state - requesting votes for leadership
    Candidate,
    /// Leader state - manages log replication
    Leader,
    /// Stopped; all activity has ceased
    Dead,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
            Role::Dead => write!(f, "Dead"),
        }
    }
}

/// Complete mutable state of a consensus module, guarded by a single mutex.
pub(crate) struct CmState<A: Application> {
    /// This node's ID
    pub node_id: NodeId,

    /// Latest term this node has seen (initialized to 0)
    pub current_term: Term,
    /// Candidate that received this node's vote in current term (or None)
    pub voted_for: Option<NodeId>,
    /// The replicated log. Position i holds the entry at 1-based index i+1.
    pub log: Vec<LogEntry<A::Command>>,

    /// Index of highest log entry known to be committed (0 if none)
    pub commit_index: LogIndex,
    /// Index of highest log entry applied to the application (0 if none)
    pub last_applied: LogIndex,
    /// Current role of this node
    pub role: Role,
    /// ID of the current leader (if known)
    pub current_leader: Option<NodeId>,
    /// Instant of the last event that defers an election (heartbeat seen,
    /// vote granted, candidacy started)
    pub election_reset_at: Instant,

    // Volatile state on leaders (reinitialized after election)
    /// For each peer, 1-based index of the next log entry to send
    pub next_index: HashMap<NodeId, LogIndex>,
    /// For each peer, highest log index known to be replicated there
    pub match_index: HashMap<NodeId, LogIndex>,

    /// Peers that voted for this node in the current election
    pub votes_received: HashSet<NodeId>,

    /// Wakes the apply worker; None once the node is stopped
    pub commit_ready_tx: Option<mpsc::Sender<()>>,
    /// Wakes the replication loop; None unless this node is the leader
    pub replicate_tx: Option<mpsc::Sender<()>>,
    /// One wait slot per outstanding submit, keyed by the log index the
    /// submitted command was appended at
    pub waiters: HashMap<LogIndex, oneshot::Sender<A::Output>>,
}

impl<A: Application> CmState<A> {
    pub fn new(node_id: NodeId, commit_ready_tx: mpsc::Sender<()>) -> Self {
        Self {
            node_id,
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            commit_index: 0,
            last_applied: 0,
            role: Role::Follower,
            current_leader: None,
            election_reset_at: Instant::now(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes_received: HashSet::new(),
            commit_ready_tx: Some(commit_ready_tx),
            replicate_tx: None,
            waiters: HashMap::new(),
        }
    }

    /// Transition to follower state at the given term. Cancels any waiting
    /// submitters; their commands may be overwritten by the new leader.
    pub fn become_follower(&mut self, term: Term) {
        tracing::info!(
            "Node {} transitioning to Follower (term: {})",
            self.node_id,
            term
        );
        self.role = Role::Follower;
        self.current_term = term;
        self.voted_for = None;
        self.current_leader = None;
        self.votes_received.clear();
        self.election_reset_at = Instant::now();
        self.replicate_tx = None;
        self.waiters.clear();
    }

    /// Transition to candidate state: advance the term and vote for self.
    pub fn become_candidate(&mut self) {
        self.current_term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.node_id.clone());
        self.current_leader = None;
        self.election_reset_at = Instant::now();
        self.votes_received.clear();
        self.votes_received.insert(self.node_id.clone());

        tracing::info!(
            "Node {} transitioning to Candidate (term: {})",
            self.node_id,
            self.current_term
        );
    }

    /// Transition to leader state and reinitialize the peer progress maps.
    pub fn become_leader(&mut self, peer_ids: &[NodeId]) {
        tracing::info!(
            "Node {} transitioning to Leader (term: {})",
            self.node_id,
            self.current_term
        );

        self.role = Role::Leader;
        self.current_leader = Some(self.node_id.clone());

        self.next_index.clear();
        self.match_index.clear();
        let next = self.last_log_index() + 1;
        for peer_id in peer_ids {
            self.next_index.insert(peer_id.clone(), next);
            self.match_index.insert(peer_id.clone(), 0);
        }

        self.votes_received.clear();
    }

    /// Record a vote for this node
    pub fn add_vote(&mut self, from: NodeId) {
        self.votes_received.insert(from);
    }

    /// Check if the votes received form a strict majority of the cluster
    pub fn has_majority(&self, total_nodes: usize) -> bool {
        let majority = (total_nodes / 2) + 1;
        self.votes_received.len() >= majority
    }

    /// 1-based index of the last log entry, or 0 for an empty log
    pub fn last_log_index(&self) -> LogIndex {
        self.log.len() as LogIndex
    }

    /// Term of the last log entry, or 0 for an empty log
    pub fn last_log_term(&self) -> Term {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    /// Term of the entry at a 1-based index, if the log reaches that far
    pub fn entry_term(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return None;
        }
        self.log.get((index - 1) as usize).map(|e| e.term)
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn is_candidate(&self) -> bool {
        self.role == Role::Candidate
    }
}
