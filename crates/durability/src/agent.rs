//! The per-node durability agent.
//!
//! One worker task drains a bounded action queue, so at most one action runs
//! at a time on a node. Two timers feed the queue: a short one for recovery,
//! scheduled jobs and expiry, and a long one for health checks and dormant
//! node reassignment. Cluster-wide exclusion comes from advisory locks, not
//! from the worker.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use wharf_core::ResultExt;
use wharf_store::{MessageStoreAdmin, PersistedCounts};

use crate::actions::{self, ActionOutcome, AgentAction, AgentContext};
use crate::error::{DurabilityError, DurabilityResult};

/// Actions enqueued on every short-period tick.
pub const SHORT_PERIOD_ACTIONS: [AgentAction; 4] = [
    AgentAction::RecoverIncoming,
    AgentAction::RecoverOutgoing,
    AgentAction::RunScheduledJobs,
    AgentAction::DeleteExpired,
];

/// Actions enqueued on every long-period tick.
pub const LONG_PERIOD_ACTIONS: [AgentAction; 2] =
    [AgentAction::HealthCheck, AgentAction::ReassignDormantNodes];

struct Running {
    shutdown: watch::Sender<bool>,
    worker: JoinHandle<()>,
    timers: Vec<JoinHandle<()>>,
}

enum AgentState {
    Idle,
    Running(Running),
    Stopped,
}

/// Runs durability actions for one node.
pub struct DurabilityAgent {
    context: Arc<AgentContext>,
    // Serialises the worker with inline `execute` calls.
    gate: Arc<Mutex<()>>,
    counts: watch::Receiver<PersistedCounts>,
    state: Mutex<AgentState>,
}

impl DurabilityAgent {
    #[must_use]
    pub fn new(context: AgentContext) -> Self {
        let counts = context.counts.subscribe();
        Self {
            context: Arc::new(context),
            gate: Arc::new(Mutex::new(())),
            counts,
            state: Mutex::new(AgentState::Idle),
        }
    }

    #[must_use]
    pub fn node_number(&self) -> i32 {
        self.context.node_number
    }

    #[must_use]
    pub fn context(&self) -> &AgentContext {
        &self.context
    }

    /// Latest counts published by [`AgentAction::PublishCounts`].
    #[must_use]
    pub fn counts(&self) -> watch::Receiver<PersistedCounts> {
        self.counts.clone()
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, AgentState::Running(_))
    }

    /// Run one action now, outside the timers.
    ///
    /// # Errors
    ///
    /// Returns the action's failure.
    pub async fn execute(&self, action: AgentAction) -> DurabilityResult<ActionOutcome> {
        let _guard = self.gate.lock().await;
        actions::run(action, &self.context).await
    }

    /// Start the worker and both timers.
    ///
    /// # Errors
    ///
    /// Returns [`DurabilityError::AlreadyStarted`] if the agent is running,
    /// or an invalid state error once it has been stopped.
    pub async fn start(&self) -> DurabilityResult<()> {
        let mut state = self.state.lock().await;
        match *state {
            AgentState::Idle => {}
            AgentState::Running(_) => return Err(DurabilityError::AlreadyStarted),
            AgentState::Stopped => {
                return Err(DurabilityError::invalid_node_state(
                    "a stopped agent cannot restart",
                ));
            }
        }

        let settings = &self.context.settings;
        let (sender, receiver) = mpsc::channel(settings.action_queue_capacity);
        let (shutdown, stopping) = watch::channel(false);

        let worker = tokio::spawn(work(
            Arc::clone(&self.context),
            Arc::clone(&self.gate),
            sender.clone(),
            receiver,
            stopping.clone(),
        ));

        let mut short_period = SHORT_PERIOD_ACTIONS.to_vec();
        if settings.metrics_enabled {
            short_period.push(AgentAction::PublishCounts);
        }
        let timers = vec![
            tokio::spawn(tick(
                short_period,
                settings.scheduled_job_first_execution() + jitter(settings.first_execution_jitter_ms),
                settings.scheduled_job_polling(),
                sender.clone(),
                stopping.clone(),
            )),
            tokio::spawn(tick(
                LONG_PERIOD_ACTIONS.to_vec(),
                jitter(settings.first_execution_jitter_ms),
                settings.node_reassignment_polling(),
                sender,
                stopping,
            )),
        ];

        tracing::info!(node_number = self.context.node_number, "Durability agent started");
        *state = AgentState::Running(Running {
            shutdown,
            worker,
            timers,
        });
        Ok(())
    }

    /// Stop gracefully and leave the cluster.
    ///
    /// The in-flight action finishes. Then every advisory lock is released,
    /// envelopes owned by this node go back to the any-node pool, and the
    /// node is deregistered. An agent that never started still cleans up.
    ///
    /// # Errors
    ///
    /// Returns [`DurabilityError::NotStarted`] if the agent was already
    /// stopped or aborted, or the first cleanup failure.
    pub async fn stop(&self) -> DurabilityResult<()> {
        let previous = std::mem::replace(&mut *self.state.lock().await, AgentState::Stopped);
        match previous {
            AgentState::Stopped => return Err(DurabilityError::NotStarted),
            AgentState::Idle => {}
            AgentState::Running(running) => {
                let _ = running.shutdown.send(true);
                futures::future::join_all(running.timers).await;
                let _ = running.worker.await;
            }
        }

        let _guard = self.gate.lock().await;
        let node_number = self.context.node_number;
        self.context.leadership.resign(node_number).await?;
        self.context.locks.release_all().await?;
        self.context
            .store
            .release_all_ownership(Some(node_number))
            .await?;
        self.context.registry.deregister().await?;

        tracing::info!(node_number, "Durability agent stopped");
        Ok(())
    }

    /// Kill the worker and timers without any cleanup.
    ///
    /// Locks stay held until their lease runs out and owned envelopes stay
    /// owned until another node finds this one dormant.
    pub async fn abort(&self) {
        let previous = std::mem::replace(&mut *self.state.lock().await, AgentState::Stopped);
        if let AgentState::Running(running) = previous {
            for timer in &running.timers {
                timer.abort();
            }
            running.worker.abort();
        }
        tracing::warn!(node_number = self.context.node_number, "Durability agent aborted");
    }
}

async fn work(
    context: Arc<AgentContext>,
    gate: Arc<Mutex<()>>,
    requeue: mpsc::Sender<AgentAction>,
    mut queue: mpsc::Receiver<AgentAction>,
    mut stopping: watch::Receiver<bool>,
) {
    loop {
        let action = tokio::select! {
            biased;
            _ = stopping.changed() => break,
            action = queue.recv() => match action {
                Some(action) => action,
                None => break,
            },
        };

        let outcome = {
            let _guard = gate.lock().await;
            actions::run(action, &context).await
        }
        .inspect_error(|e| {
            tracing::error!(
                node_number = context.node_number,
                %action,
                lock_id = ?action.lock_id(),
                retryable = e.is_retryable(),
                error = %e,
                "Durability action failed"
            );
        });
        if matches!(outcome, Ok(ActionOutcome::Reschedule)) && requeue.try_send(action).is_err() {
            tracing::debug!(%action, "Action queue full, waiting for next tick");
        }
    }
}

async fn tick(
    batch: Vec<AgentAction>,
    first: Duration,
    period: Duration,
    sender: mpsc::Sender<AgentAction>,
    mut stopping: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + first, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = stopping.changed() => break,
            _ = interval.tick() => {
                for action in &batch {
                    if sender.try_send(*action).is_err() {
                        tracing::debug!(%action, "Action queue full, dropping tick");
                    }
                }
            }
        }
    }
}

fn jitter(max_ms: u64) -> Duration {
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}
