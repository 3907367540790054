use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::time::sleep;

use super::core::{ConsensusModule, REPLICATE_TRIGGER_CAPACITY};
use super::rpc::{AppendEntriesRequest, AppendEntriesResponse, RaftMessage};
use super::state::{CmState, Role};
use super::types::{LogEntry, LogIndex, NodeId, Term};
use crate::application::Application;
use crate::util::errors::{RaftError, Result};

impl<A: Application> ConsensusModule<A> {
    /// Switches this node into the leader role and starts the replication
    /// loop. Expects the state lock to be held by the caller.
    pub(crate) fn start_leader(&self, st: &mut CmState<A>) {
        st.become_leader(&self.peer_ids);
        let term = st.current_term;

        let (trigger_tx, trigger_rx) = mpsc::channel(REPLICATE_TRIGGER_CAPACITY);
        st.replicate_tx = Some(trigger_tx);

        if let Some(cm) = self.strong() {
            tokio::spawn(cm.run_replication(trigger_rx, term));
        }
    }

    /// The leader's background loop: sends AppendEntries to every peer on
    /// each heartbeat tick, or sooner when a submit or a commit advance
    /// nudges the trigger channel. Exits on step-down.
    async fn run_replication(self: Arc<Self>, mut trigger_rx: mpsc::Receiver<()>, term: Term) {
        // First round goes out immediately so followers learn about the new
        // leader before their election timers fire.
        self.broadcast_append_entries(term);

        loop {
            tokio::select! {
                _ = sleep(self.config.heartbeat_interval()) => {}
                wake = trigger_rx.recv() => {
                    if wake.is_none() {
                        return;
                    }
                }
            }

            {
                let st = self.lock_state();
                if st.role != Role::Leader || st.current_term != term {
                    return;
                }
            }
            self.broadcast_append_entries(term);
        }
    }

    /// Sends one round of AppendEntries to every peer in parallel, tailored
    /// to each peer's next index.
    fn broadcast_append_entries(&self, saved_term: Term) {
        let st = self.lock_state();
        if st.role != Role::Leader || st.current_term != saved_term {
            return;
        }
        let Some(this) = self.strong() else {
            return;
        };

        for peer in &self.peer_ids {
            let ni = st
                .next_index
                .get(peer)
                .copied()
                .unwrap_or(st.last_log_index() + 1);
            let prev_log_index = ni - 1;
            let prev_log_term = st.entry_term(prev_log_index).unwrap_or(0);
            let entries: Vec<LogEntry<A::Command>> = st.log[(ni - 1) as usize..].to_vec();

            if !entries.is_empty() {
                tracing::debug!(
                    "Leader {} sending {} entries to {} from index {}",
                    self.id,
                    entries.len(),
                    peer,
                    ni
                );
            }

            let args = AppendEntriesRequest {
                term: saved_term,
                leader_id: self.id.clone(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: st.commit_index,
            };

            let cm = Arc::clone(&this);
            let peer = peer.clone();
            tokio::spawn(async move {
                let sent_count = args.entries.len() as u64;
                let Some(transport) = cm.transport.upgrade() else {
                    return;
                };
                match transport.call(&peer, RaftMessage::AppendEntries(args)).await {
                    Ok(RaftMessage::AppendEntriesResponse(reply)) => {
                        cm.handle_append_reply(peer, saved_term, ni, sent_count, reply);
                    }
                    Ok(_) => {
                        tracing::debug!(
                            "Node {} got a mismatched reply to AppendEntries from {}",
                            cm.id,
                            peer
                        );
                    }
                    Err(e) => {
                        tracing::debug!("Node {} AppendEntries to {} failed: {}", cm.id, peer, e);
                    }
                }
            });
        }
    }

    /// Adjusts a peer's progress from its AppendEntries reply and advances
    /// the commit index where a majority has matched.
    fn handle_append_reply(
        &self,
        peer: NodeId,
        saved_term: Term,
        sent_next_index: LogIndex,
        sent_count: u64,
        reply: AppendEntriesResponse,
    ) {
        let mut st = self.lock_state();

        if st.role == Role::Dead {
            return;
        }
        if reply.term > st.current_term {
            tracing::info!(
                "Node {} term out of date in AppendEntries reply from {}",
                self.id,
                peer
            );
            self.become_follower(&mut st, reply.term);
            return;
        }
        if st.role != Role::Leader || reply.term != saved_term {
            return;
        }

        if reply.success {
            let next = sent_next_index + sent_count;
            st.next_index.insert(peer.clone(), next);
            st.match_index.insert(peer.clone(), next - 1);

            let saved_commit = st.commit_index;
            self.advance_commit_index(&mut st);
            if st.commit_index != saved_commit {
                tracing::info!(
                    "🎉 Leader {} advanced commit index from {} to {}",
                    self.id,
                    saved_commit,
                    st.commit_index
                );
                // New entries are committed: wake the apply worker, and the
                // replication loop so followers learn the commit quickly.
                if let Some(ready) = &st.commit_ready_tx {
                    let _ = ready.try_send(());
                }
                if let Some(trigger) = &st.replicate_tx {
                    let _ = trigger.try_send(());
                }
            }
        } else {
            let fallback = sent_next_index.saturating_sub(1).max(1);
            st.next_index.insert(peer.clone(), fallback);
            tracing::debug!(
                "Leader {} AppendEntries rejected by {}, next index lowered to {}",
                self.id,
                peer,
                fallback
            );
        }
    }

    /// Commits the highest current-term index replicated on a strict
    /// majority of the cluster. Entries from earlier terms commit only
    /// transitively.
    fn advance_commit_index(&self, st: &mut CmState<A>) {
        let total_nodes = self.peer_ids.len() + 1;
        let majority = (total_nodes / 2) + 1;

        for n in (st.commit_index + 1)..=st.last_log_index() {
            if st.entry_term(n) != Some(st.current_term) {
                continue;
            }
            let mut count = 1; // this node
            for peer in &self.peer_ids {
                if st.match_index.get(peer).copied().unwrap_or(0) >= n {
                    count += 1;
                }
            }
            if count >= majority {
                st.commit_index = n;
            }
        }
    }

    /// AppendEntries RPC handler: heartbeat acknowledgement, log
    /// reconciliation, and commit-index propagation.
    pub(crate) fn handle_append_entries(
        &self,
        req: AppendEntriesRequest<A::Command>,
    ) -> Result<AppendEntriesResponse> {
        let mut st = self.lock_state();
        if st.role == Role::Dead {
            return Err(RaftError::Stopped);
        }
        tracing::debug!(
            "Node {} received AppendEntries from {} (term: {}, {} entries, prev: {}/{}, leader commit: {})",
            self.id,
            req.leader_id,
            req.term,
            req.entries.len(),
            req.prev_log_index,
            req.prev_log_term,
            req.leader_commit
        );

        if req.term > st.current_term {
            tracing::debug!("Node {} term out of date in AppendEntries", self.id);
            self.become_follower(&mut st, req.term);
        }

        let mut success = false;
        if req.term == st.current_term {
            if st.role != Role::Follower {
                self.become_follower(&mut st, req.term);
            }
            st.election_reset_at = Instant::now();
            st.current_leader = Some(req.leader_id.clone());

            // Does our log contain an entry at prev_log_index whose term
            // matches prev_log_term? prev_log_index == 0 is vacuously
            // consistent.
            let consistent = req.prev_log_index == 0
                || st.entry_term(req.prev_log_index) == Some(req.prev_log_term);

            if consistent {
                success = true;

                // Skip the prefix on which both logs already agree, then
                // truncate and append from the first divergence. Entries
                // that agree are never truncated.
                let mut insert_index = req.prev_log_index + 1;
                let mut new_entries_offset = 0;
                loop {
                    if insert_index > st.last_log_index()
                        || new_entries_offset >= req.entries.len()
                    {
                        break;
                    }
                    if st.entry_term(insert_index) != Some(req.entries[new_entries_offset].term) {
                        break;
                    }
                    insert_index += 1;
                    new_entries_offset += 1;
                }

                if new_entries_offset < req.entries.len() {
                    tracing::debug!(
                        "Node {} inserting {} entries from index {}",
                        self.id,
                        req.entries.len() - new_entries_offset,
                        insert_index
                    );
                    st.log.truncate((insert_index - 1) as usize);
                    st.log.extend_from_slice(&req.entries[new_entries_offset..]);
                }

                if req.leader_commit > st.commit_index {
                    st.commit_index = req.leader_commit.min(st.last_log_index());
                    tracing::debug!(
                        "Node {} commit index set to {}",
                        self.id,
                        st.commit_index
                    );
                    if let Some(ready) = &st.commit_ready_tx {
                        let _ = ready.try_send(());
                    }
                }
            } else {
                tracing::debug!(
                    "Node {} rejecting AppendEntries: log mismatch at index {}",
                    self.id,
                    req.prev_log_index
                );
            }
        }

        Ok(AppendEntriesResponse {
            term: st.current_term,
            success,
        })
    }
}
