use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::time::sleep;

use super::core::ConsensusModule;
use super::rpc::{RaftMessage, RequestVoteRequest, RequestVoteResponse};
use super::state::{CmState, Role};
use super::types::{NodeId, Term};
use crate::application::Application;
use crate::util::errors::{RaftError, Result};

/// Granularity of the election timer poll loop.
const ELECTION_POLL_INTERVAL: Duration = Duration::from_millis(10);

impl<A: Application> ConsensusModule<A> {
    /// Pseudo-random election timeout, redrawn on every timer start.
    fn election_timeout(&self) -> Duration {
        let min = self.config.election_timeout_min_ms;
        let max = self.config.election_timeout_max_ms;
        Duration::from_millis(rand::thread_rng().gen_range(min..max))
    }

    /// A single one-shot election timer. Launched whenever the node enters
    /// Follower or Candidate; polls until either the timeout elapses with no
    /// deferring event (then starts an election) or the role/term it was
    /// started under goes stale (then exits, leaving the timer to whichever
    /// worker owns the new role or term).
    pub(crate) async fn run_election_timer(self: Arc<Self>) {
        let timeout = self.election_timeout();
        let term_started = self.lock_state().current_term;
        tracing::debug!(
            "Node {} election timer started ({:?}), term {}",
            self.id,
            timeout,
            term_started
        );

        loop {
            sleep(ELECTION_POLL_INTERVAL).await;

            let mut st = self.lock_state();
            if st.role != Role::Candidate && st.role != Role::Follower {
                tracing::debug!(
                    "Node {} election timer bailing out, role is {}",
                    self.id,
                    st.role
                );
                return;
            }
            if st.current_term != term_started {
                tracing::debug!(
                    "Node {} election timer bailing out, term changed {} -> {}",
                    self.id,
                    term_started,
                    st.current_term
                );
                return;
            }
            if st.election_reset_at.elapsed() >= timeout {
                self.start_election(&mut st);
                return;
            }
        }
    }

    /// Starts a new election with this node as candidate. Expects the state
    /// lock to be held by the caller.
    pub(crate) fn start_election(&self, st: &mut CmState<A>) {
        st.become_candidate();
        let saved_term = st.current_term;
        let last_log_index = st.last_log_index();
        let last_log_term = st.last_log_term();

        tracing::info!(
            "🗳️  Node {} starting election for term {}",
            self.id,
            saved_term
        );

        let Some(this) = self.strong() else {
            return;
        };
        for peer in &self.peer_ids {
            let cm = Arc::clone(&this);
            let peer = peer.clone();
            let args = RequestVoteRequest {
                term: saved_term,
                candidate_id: self.id.clone(),
                last_log_index,
                last_log_term,
            };

            tokio::spawn(async move {
                tracing::debug!("Node {} sending RequestVote to {}", cm.id, peer);
                let Some(transport) = cm.transport.upgrade() else {
                    return;
                };
                match transport.call(&peer, RaftMessage::RequestVote(args)).await {
                    Ok(RaftMessage::RequestVoteResponse(reply)) => {
                        cm.handle_vote_reply(peer, saved_term, reply);
                    }
                    Ok(_) => {
                        tracing::debug!(
                            "Node {} got a mismatched reply to RequestVote from {}",
                            cm.id,
                            peer
                        );
                    }
                    Err(e) => {
                        tracing::debug!("Node {} RequestVote to {} failed: {}", cm.id, peer, e);
                    }
                }
            });
        }

        // Run another timer in case this election is not decisive.
        self.spawn_election_timer();
    }

    /// Tallies one RequestVote reply. Replies are discarded once the node is
    /// no longer a candidate or the election term has passed.
    fn handle_vote_reply(&self, from: NodeId, saved_term: Term, reply: RequestVoteResponse) {
        let mut st = self.lock_state();

        if !st.is_candidate() {
            tracing::debug!(
                "Node {} ignoring vote reply from {} while {}",
                self.id,
                from,
                st.role
            );
            return;
        }
        if reply.term > st.current_term {
            tracing::info!(
                "Node {} term out of date in RequestVote reply from {}",
                self.id,
                from
            );
            self.become_follower(&mut st, reply.term);
            return;
        }
        if st.current_term != saved_term || reply.term != saved_term {
            return;
        }

        if reply.vote_granted {
            st.add_vote(from);
            let votes = st.votes_received.len();
            let total_nodes = self.peer_ids.len() + 1;
            tracing::debug!(
                "Node {} has {}/{} votes in term {}",
                self.id,
                votes,
                total_nodes,
                saved_term
            );

            if st.has_majority(total_nodes) {
                tracing::info!(
                    "Node {} wins election in term {} with {} votes",
                    self.id,
                    saved_term,
                    votes
                );
                self.start_leader(&mut st);
            }
        }
    }

    /// RequestVote RPC handler.
    pub(crate) fn handle_request_vote(
        &self,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let mut st = self.lock_state();
        if st.role == Role::Dead {
            return Err(RaftError::Stopped);
        }

        let last_log_index = st.last_log_index();
        let last_log_term = st.last_log_term();
        tracing::debug!(
            "Node {} received RequestVote from {} (term: {}, last log: {}/{})",
            self.id,
            req.candidate_id,
            req.term,
            req.last_log_index,
            req.last_log_term
        );

        if req.term > st.current_term {
            tracing::debug!("Node {} term out of date in RequestVote", self.id);
            self.become_follower(&mut st, req.term);
        }

        // Grant the vote iff the candidate is in our (possibly just
        // upgraded) term, we have no conflicting vote, and its log is at
        // least as up-to-date as ours.
        let can_vote =
            st.voted_for.is_none() || st.voted_for.as_ref() == Some(&req.candidate_id);
        let log_is_up_to_date = req.last_log_term > last_log_term
            || (req.last_log_term == last_log_term && req.last_log_index >= last_log_index);

        let vote_granted = if req.term == st.current_term && can_vote && log_is_up_to_date {
            st.voted_for = Some(req.candidate_id.clone());
            st.election_reset_at = Instant::now();
            tracing::info!(
                "Node {} granted vote to {} in term {}",
                self.id,
                req.candidate_id,
                req.term
            );
            true
        } else {
            tracing::debug!(
                "Node {} denied vote to {} (can_vote: {}, log up-to-date: {})",
                self.id,
                req.candidate_id,
                can_vote,
                log_is_up_to_date
            );
            false
        };

        Ok(RequestVoteResponse {
            term: st.current_term,
            vote_granted,
        })
    }
}
