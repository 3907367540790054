use std::sync::Arc;

use tokio::sync::watch;

use crate::application::Application;
use crate::config::RaftConfig;
use crate::raft::types::NodeId;
use crate::server::Server;
use crate::util::errors::{RaftError, Result};

/// An in-process cluster of consensus nodes sharing one application type.
pub struct Cluster<A: Application> {
    servers: Vec<Arc<Server<A>>>,
    ready_tx: watch::Sender<bool>,
}

impl<A: Application> Cluster<A> {
    /// Builds `num` nodes, each with its own application instance. The
    /// nodes stay dormant until `serve` wires them up and releases them.
    pub fn new<F>(num: usize, config: RaftConfig, new_app: F) -> Result<Self>
    where
        F: Fn() -> A,
    {
        let (ready_tx, ready_rx) = watch::channel(false);
        let ids: Vec<NodeId> = (0..num).map(|i| format!("node-{}", i)).collect();

        let mut servers = Vec::with_capacity(num);
        for id in &ids {
            let peer_ids: Vec<NodeId> = ids.iter().filter(|p| *p != id).cloned().collect();
            servers.push(Server::new(
                id.clone(),
                peer_ids,
                config.clone(),
                new_app(),
                ready_rx.clone(),
            )?);
        }

        Ok(Self { servers, ready_tx })
    }

    /// Connects every pair of nodes, then releases them all at once so no
    /// node can start an election against a half-wired cluster.
    pub fn serve(&self) {
        for a in &self.servers {
            for b in &self.servers {
                if a.id() != b.id() {
                    a.connect_to_peer(b);
                }
            }
        }
        let _ = self.ready_tx.send(true);
        tracing::info!("Cluster of {} nodes serving", self.servers.len());
    }

    /// Submits a command to the cluster, trying each node in turn until one
    /// accepts it. The returned output is the application's result for this
    /// command.
    pub async fn submit(&self, command: A::Command) -> Result<A::Output> {
        let mut last_err = RaftError::NotLeader;
        for server in &self.servers {
            match server.submit(command.clone()).await {
                Ok(output) => return Ok(output),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    pub fn servers(&self) -> &[Arc<Server<A>>] {
        &self.servers
    }

    /// Disconnects every link, then stops every node.
    pub fn shutdown(&self) {
        for server in &self.servers {
            server.disconnect_all();
        }
        for server in &self.servers {
            server.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use tokio::time::sleep;

    use super::*;
    use crate::application::calculator::{CalcCommand, CalcResult, Calculator};
    use crate::application::Application;

    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    fn calculator_cluster(num: usize) -> Cluster<Calculator> {
        init_logging();
        Cluster::new(num, RaftConfig::default(), Calculator::new).unwrap()
    }

    /// Waits out the initial election, then returns the index of the single
    /// stable leader.
    async fn elected_leader<A: Application>(cluster: &Cluster<A>) -> usize {
        sleep(Duration::from_secs(2)).await;
        let leaders: Vec<usize> = cluster
            .servers()
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_leader())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(leaders.len(), 1, "expected exactly one leader");
        leaders[0]
    }

    async fn submit_ok(cluster: &Cluster<Calculator>, command: CalcCommand) -> CalcResult {
        let result = cluster.submit(command.clone()).await;
        match result {
            Ok(output) => {
                assert!(output.success, "command {:?} failed: {:?}", command, output);
                output
            }
            Err(err) => panic!("command {:?} not accepted: {}", command, err),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn elects_exactly_one_leader_on_startup() {
        let cluster = calculator_cluster(3);
        cluster.serve();

        elected_leader(&cluster).await;

        let reports: Vec<_> = cluster.servers().iter().map(|s| s.report()).collect();
        let term = reports[0].current_term;
        assert!(term >= 1);
        for report in &reports {
            assert_eq!(report.current_term, term);
        }

        cluster.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn replicates_a_single_entry_to_every_node() {
        let cluster = calculator_cluster(3);
        cluster.serve();
        elected_leader(&cluster).await;

        let result = submit_ok(&cluster, CalcCommand::Create).await;
        assert!(result.value >= 1);

        // Give the followers a heartbeat or two to catch up.
        sleep(Duration::from_millis(500)).await;
        for server in cluster.servers() {
            let report = server.report();
            assert_eq!(report.last_log_index, 1, "{} log length", report.node_id);
            assert_eq!(report.commit_index, 1, "{} commit index", report.node_id);
        }

        cluster.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn runs_the_calculator_end_to_end() {
        let cluster = calculator_cluster(3);
        cluster.serve();
        elected_leader(&cluster).await;

        let created = submit_ok(&cluster, CalcCommand::Create).await;
        let instance = created.value as u64;

        submit_ok(
            &cluster,
            CalcCommand::Push {
                instance,
                operand: 1,
            },
        )
        .await;

        let popped = submit_ok(&cluster, CalcCommand::Pop { instance }).await;
        assert_eq!(popped.value, 1);

        submit_ok(&cluster, CalcCommand::Delete { instance }).await;

        cluster.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn runs_an_arithmetic_sequence() {
        let cluster = calculator_cluster(3);
        cluster.serve();
        elected_leader(&cluster).await;

        let instance = submit_ok(&cluster, CalcCommand::Create).await.value as u64;
        let push = |operand: i64| CalcCommand::Push { instance, operand };

        submit_ok(&cluster, push(1)).await;
        submit_ok(&cluster, push(2)).await;
        assert_eq!(submit_ok(&cluster, CalcCommand::Add { instance }).await.value, 3);

        submit_ok(&cluster, push(5)).await;
        assert_eq!(submit_ok(&cluster, CalcCommand::Sub { instance }).await.value, 2);

        submit_ok(&cluster, push(7)).await;
        assert_eq!(submit_ok(&cluster, CalcCommand::Mul { instance }).await.value, 14);

        submit_ok(&cluster, push(42)).await;
        assert_eq!(submit_ok(&cluster, CalcCommand::Div { instance }).await.value, 3);

        assert_eq!(submit_ok(&cluster, CalcCommand::Inc { instance }).await.value, 4);
        assert_eq!(submit_ok(&cluster, CalcCommand::Dec { instance }).await.value, 3);

        submit_ok(&cluster, CalcCommand::Delete { instance }).await;

        cluster.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn followers_reject_direct_submits_immediately() {
        let cluster = calculator_cluster(3);
        cluster.serve();
        let leader = elected_leader(&cluster).await;

        for (i, server) in cluster.servers().iter().enumerate() {
            if i == leader {
                continue;
            }
            let started = Instant::now();
            let result = server.submit(CalcCommand::Create).await;
            assert!(matches!(result, Err(RaftError::NotLeader)));
            assert!(
                started.elapsed() < Duration::from_millis(100),
                "rejection should not wait on the submit timeout"
            );
            assert_eq!(server.report().last_log_index, 0);
        }

        cluster.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn div_by_zero_restores_the_stack() {
        let cluster = calculator_cluster(3);
        cluster.serve();
        elected_leader(&cluster).await;

        let instance = submit_ok(&cluster, CalcCommand::Create).await.value as u64;
        submit_ok(
            &cluster,
            CalcCommand::Push {
                instance,
                operand: 0,
            },
        )
        .await;
        submit_ok(
            &cluster,
            CalcCommand::Push {
                instance,
                operand: 10,
            },
        )
        .await;

        let divided = cluster.submit(CalcCommand::Div { instance }).await.unwrap();
        assert!(!divided.success);
        assert_eq!(divided.value, 0);

        // Divisor-first restore: the stack is [0, 10] again.
        assert_eq!(submit_ok(&cluster, CalcCommand::Get { instance }).await.value, 10);
        assert_eq!(submit_ok(&cluster, CalcCommand::Pop { instance }).await.value, 10);
        assert_eq!(submit_ok(&cluster, CalcCommand::Pop { instance }).await.value, 0);

        cluster.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn submit_to_an_isolated_leader_times_out() {
        let cluster = calculator_cluster(3);
        cluster.serve();
        let leader = elected_leader(&cluster).await;

        // Cut the leader off in both directions: it can neither replicate
        // nor learn about the successor's term, so it keeps accepting
        // commands it can never commit.
        let leader_id = cluster.servers()[leader].id().clone();
        cluster.servers()[leader].disconnect_all();
        for (i, server) in cluster.servers().iter().enumerate() {
            if i != leader {
                server.disconnect_peer(&leader_id);
            }
        }

        let started = Instant::now();
        let result = cluster.servers()[leader].submit(CalcCommand::Create).await;
        assert!(matches!(result, Err(RaftError::CommitTimeout)));
        assert!(started.elapsed() >= Duration::from_millis(600));

        cluster.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cluster_runs_with_a_null_application() {
        struct NullApp;

        impl Application for NullApp {
            type Command = u64;
            type Output = ();

            fn apply_command(&mut self, _command: u64) {}
        }

        init_logging();
        let cluster = Cluster::new(3, RaftConfig::default(), || NullApp).unwrap();
        cluster.serve();

        elected_leader(&cluster).await;
        cluster.submit(7).await.unwrap();

        cluster.shutdown();
    }
}
