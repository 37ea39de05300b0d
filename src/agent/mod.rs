// Node agent: periodic reconcile loop plus the recovery escalation
// path. The netfilter engine is synchronous by design (each pass is a
// sequence of external commands); the agent drives it from the async
// runtime through spawn_blocking.

pub mod config;

use std::sync::Arc;

use thiserror::Error;
use tokio::task;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::agent::config::AgentConfig;
use crate::netfilter::state::Snapshot;
use crate::netfilter::{
    recover, Executor, NetfilterError, NetfilterResult, ReconcileReport, Reconciler, State,
    ROOT_NAMESPACE,
};
use crate::store::retry::retry_db_operation;
use crate::store::{Store, StoreError};
use crate::utils::{netns, sysctl};

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Netfilter error: {0}")]
    Netfilter(#[from] NetfilterError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task join error: {0}")]
    Join(#[from] task::JoinError),
}

pub type AgentResult<T> = Result<T, AgentError>;

pub struct Agent {
    config: AgentConfig,
    store: Store,
    reconciler: Arc<Reconciler>,
}

impl Agent {
    pub async fn new(config: AgentConfig) -> AgentResult<Self> {
        let store = Store::open(&config.database_path).await?;
        Ok(Self {
            config,
            store,
            reconciler: Reconciler::new(Executor::system()),
        })
    }

    /// Run the reconcile loop until interrupted. The first pass is a
    /// full rebuild so an agent restart converges with whatever the
    /// previous process left installed.
    pub async fn run(&self) -> AgentResult<()> {
        sysctl::enable_forwarding()?;
        self.rebuild().await?;
        info!(node_id = %self.config.node_id, "agent: Started");

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.pass().await {
                        error!(error = %err, "agent: Reconcile pass failed");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("agent: Shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn desired_state(&self) -> AgentResult<Snapshot> {
        let snapshot = retry_db_operation(
            || self.store.snapshot(&self.config.node_id),
            5,
            "load_snapshot",
        )
        .await?;
        Ok(snapshot)
    }

    async fn pass(&self) -> AgentResult<()> {
        let snapshot = self.desired_state().await?;
        let namespaces = netns::list()?;

        let reconciler = self.reconciler.clone();
        let report = task::spawn_blocking(move || -> NetfilterResult<ReconcileReport> {
            let state = State::load(&snapshot)?;
            Ok(reconciler.reconcile(state, &namespaces))
        })
        .await??;

        if report.any_failed() {
            self.recover_failed(report).await?;
        }

        Ok(())
    }

    async fn recover_failed(&self, report: ReconcileReport) -> AgentResult<()> {
        warn!(
            namespaces = ?report.failed_namespaces,
            "agent: Reconcile left failed namespaces, entering recovery",
        );

        // A broken host stack is clamped shut before anything else.
        if report.host_failed() {
            self.clamp_host().await?;
        }

        for attempt in 1..=self.config.recover_attempts {
            tokio::time::sleep(self.config.recover_pause).await;

            match self.rebuild().await {
                Ok(report) if !report.any_failed() => {
                    info!(attempt, "agent: Recovery succeeded");
                    return Ok(());
                }
                Ok(report) => {
                    warn!(
                        attempt,
                        namespaces = ?report.failed_namespaces,
                        "agent: Recovery pass left failed namespaces",
                    );
                }
                Err(err) => {
                    error!(attempt, error = %err, "agent: Recovery pass failed");
                }
            }
        }

        error!(
            attempts = self.config.recover_attempts,
            "agent: Recovery attempts exhausted, continuing with next pass",
        );
        Ok(())
    }

    /// Full rebuild: read the rules actually installed back from every
    /// namespace, adopt them as the last-applied state, then reconcile
    /// the desired state against that.
    pub async fn rebuild(&self) -> AgentResult<ReconcileReport> {
        let snapshot = self.desired_state().await?;

        let mut namespaces = vec![ROOT_NAMESPACE.to_string()];
        namespaces.extend(netns::list()?);

        let reconciler = self.reconciler.clone();
        let report = task::spawn_blocking(move || -> NetfilterResult<ReconcileReport> {
            let live = recover::load_live(reconciler.executor(), &namespaces)?;
            reconciler.replace_state(live);

            let desired = State::load(&snapshot)?;
            let existing: Vec<String> = namespaces
                .into_iter()
                .filter(|namespace| namespace != ROOT_NAMESPACE)
                .collect();
            Ok(reconciler.reconcile(desired, &existing))
        })
        .await??;

        Ok(report)
    }

    /// Install the host safety net, but only where node-level filtering
    /// is active. On a firewall-disabled node the clamp would cut INPUT
    /// with nothing below it to rebuild.
    async fn clamp_host(&self) -> AgentResult<()> {
        let snapshot = self.desired_state().await?;
        if snapshot.node_firewall.is_none() {
            return Ok(());
        }

        let reconciler = self.reconciler.clone();
        task::spawn_blocking(move || recover::safety_net(reconciler.executor())).await??;
        Ok(())
    }

    /// One-shot recovery for the command-line surface: clamp the host
    /// input chain, then rebuild everything from the database.
    pub async fn recover(&self) -> AgentResult<ReconcileReport> {
        self.clamp_host().await?;
        self.rebuild().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netfilter::exec::testing::RecordingRunner;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    async fn setup_agent(firewall: bool) -> (NamedTempFile, Arc<RecordingRunner>, Agent) {
        let temp_file = NamedTempFile::new().unwrap();
        let store = Store::open(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        sqlx::query("INSERT INTO nodes (id, firewall) VALUES (?, ?)")
            .bind("node1")
            .bind(firewall as i64)
            .execute(store.pool())
            .await
            .unwrap();

        let runner = RecordingRunner::new();
        let config = AgentConfig {
            node_id: "node1".to_string(),
            database_path: String::new(),
            interval: Duration::from_secs(10),
            recover_pause: Duration::from_millis(10),
            recover_attempts: 1,
        };
        let agent = Agent {
            config,
            store,
            reconciler: Reconciler::new(Executor::with_runner(runner.clone())),
        };

        (temp_file, runner, agent)
    }

    #[tokio::test]
    async fn test_host_clamp_skipped_when_node_firewall_disabled() {
        let (_tmp, runner, agent) = setup_agent(false).await;

        agent.clamp_host().await.unwrap();

        assert!(runner.lines().is_empty());
    }

    #[tokio::test]
    async fn test_host_clamp_applies_when_node_firewall_enabled() {
        let (_tmp, runner, agent) = setup_agent(true).await;

        agent.clamp_host().await.unwrap();

        let lines = runner.lines();
        assert_eq!(lines.len(), 6);
        assert!(lines.iter().all(|l| l.contains("-I INPUT 1")));
    }
}
